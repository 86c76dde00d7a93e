//! Common test utilities for all integration tests.
//!
//! Provides an in-memory [`SecretAuthority`] whose responses are scripted per path
//! and which records every call it receives.

#![allow(dead_code)]
#![allow(clippy::duplicate_mod)]

use async_trait::async_trait;
use credlease::authority::RawAuth;
use credlease::config::{BackoffPolicy, LeasePolicy};
use credlease::{
    AppRoleCredentials, CredentialManager, CredentialSource, Error, ManagerOptions, RawSecret,
    Result, SecretAuthority, SecretString,
};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Payload and lease terms returned for one path.
#[derive(Debug, Clone)]
pub struct Scripted {
    pub data: Value,
    pub lease_duration: u64,
    pub renewable: bool,
}

#[derive(Debug, Default)]
struct State {
    login_ttl: u64,
    token_renewal_ttl: u64,
    lease_renewal_ttl: u64,
    logins: usize,
    token_renewals: Vec<String>,
    lease_renewals: Vec<String>,
    secrets: HashMap<String, Scripted>,
    reads: Vec<(String, String)>,
    writes: Vec<(String, Map<String, Value>)>,
    revoked: Vec<String>,
    fail_logins: bool,
    failing_paths: HashSet<String>,
    read_delays: HashMap<String, Duration>,
    lease_serial: usize,
}

/// In-memory secret authority.
///
/// Logins issue `token-1`, `token-2`, ... Reads of a scripted path issue a new
/// authority lease id every time.
#[derive(Debug)]
pub struct ScriptedAuthority {
    state: Mutex<State>,
}

impl Default for ScriptedAuthority {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedAuthority {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                login_ttl: 3600,
                token_renewal_ttl: 3600,
                lease_renewal_ttl: 3600,
                ..Default::default()
            }),
        }
    }

    pub fn with_secret(
        self,
        path: &str,
        data: Value,
        lease_duration: u64,
        renewable: bool,
    ) -> Self {
        self.set_secret(path, data, lease_duration, renewable);
        self
    }

    pub fn set_secret(&self, path: &str, data: Value, lease_duration: u64, renewable: bool) {
        let mut state = self.state.lock().unwrap();
        state.secrets.insert(path.to_string(), Scripted { data, lease_duration, renewable });
    }

    pub fn set_login_ttl(&self, seconds: u64) {
        self.state.lock().unwrap().login_ttl = seconds;
    }

    /// Lease duration granted by token renewals.
    pub fn set_token_renewal_ttl(&self, seconds: u64) {
        self.state.lock().unwrap().token_renewal_ttl = seconds;
    }

    pub fn set_fail_logins(&self, fail: bool) {
        self.state.lock().unwrap().fail_logins = fail;
    }

    pub fn set_path_failing(&self, path: &str, failing: bool) {
        let mut state = self.state.lock().unwrap();
        if failing {
            state.failing_paths.insert(path.to_string());
        } else {
            state.failing_paths.remove(path);
        }
    }

    /// Make every read of `path` take `delay` before it is answered.
    pub fn set_read_delay(&self, path: &str, delay: Duration) {
        self.state.lock().unwrap().read_delays.insert(path.to_string(), delay);
    }

    pub fn logins(&self) -> usize {
        self.state.lock().unwrap().logins
    }

    /// Tokens used for each read of `path`, in order.
    pub fn reads_of(&self, path: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.reads.iter().filter(|(p, _)| p == path).map(|(_, token)| token.clone()).collect()
    }

    pub fn token_renewals(&self) -> Vec<String> {
        self.state.lock().unwrap().token_renewals.clone()
    }

    pub fn lease_renewals(&self) -> Vec<String> {
        self.state.lock().unwrap().lease_renewals.clone()
    }

    pub fn revoked(&self) -> Vec<String> {
        self.state.lock().unwrap().revoked.clone()
    }

    pub fn writes(&self) -> Vec<(String, Map<String, Value>)> {
        self.state.lock().unwrap().writes.clone()
    }
}

#[async_trait]
impl SecretAuthority for ScriptedAuthority {
    async fn authenticate(&self, credentials: &AppRoleCredentials) -> Result<RawSecret> {
        let mut state = self.state.lock().unwrap();
        if state.fail_logins || credentials.role_id != "test-role" {
            return Err(Error::authentication_failed("invalid role or secret id"));
        }
        state.logins += 1;
        let token = format!("token-{}", state.logins);
        Ok(RawSecret {
            auth: Some(RawAuth {
                client_token: SecretString::new(token.clone()),
                accessor: format!("accessor-{}", state.logins),
                policies: vec!["default".to_string()],
                lease_duration: state.login_ttl,
                renewable: true,
            }),
            ..Default::default()
        })
    }

    async fn read(&self, token: &SecretString, path: &str) -> Result<Option<RawSecret>> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            if state.revoked.iter().any(|revoked| revoked == token.expose_secret()) {
                return Err(Error::authentication_failed("permission denied"));
            }
            state.reads.push((path.to_string(), token.expose_secret().to_string()));
            state.read_delays.get(path).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if state.failing_paths.contains(path) {
            return Err(Error::authority(Some(503), "Vault is sealed"));
        }

        let Some(scripted) = state.secrets.get(path).cloned() else {
            return Ok(None);
        };
        state.lease_serial += 1;
        Ok(Some(RawSecret {
            lease_id: format!("{}/{}", path, state.lease_serial),
            lease_duration: scripted.lease_duration,
            renewable: scripted.renewable,
            data: scripted.data.as_object().cloned(),
            ..Default::default()
        }))
    }

    async fn write(
        &self,
        _token: &SecretString,
        path: &str,
        data: &Map<String, Value>,
    ) -> Result<Option<RawSecret>> {
        let mut state = self.state.lock().unwrap();
        state.writes.push((path.to_string(), data.clone()));
        Ok(None)
    }

    async fn renew_lease(
        &self,
        _token: &SecretString,
        lease_id: &str,
        _increment: Duration,
    ) -> Result<RawSecret> {
        let mut state = self.state.lock().unwrap();
        state.lease_renewals.push(lease_id.to_string());
        Ok(RawSecret {
            lease_id: lease_id.to_string(),
            lease_duration: state.lease_renewal_ttl,
            renewable: true,
            ..Default::default()
        })
    }

    async fn renew_token(&self, token: &SecretString, _increment: Duration) -> Result<RawSecret> {
        let mut state = self.state.lock().unwrap();
        state.token_renewals.push(token.expose_secret().to_string());
        Ok(RawSecret {
            auth: Some(RawAuth {
                client_token: token.clone(),
                lease_duration: state.token_renewal_ttl,
                renewable: true,
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    async fn revoke_token(&self, token: &SecretString) -> Result<()> {
        self.state.lock().unwrap().revoked.push(token.expose_secret().to_string());
        Ok(())
    }
}

pub fn credentials() -> CredentialSource {
    CredentialSource::Static(AppRoleCredentials::new("test-role", "test-secret"))
}

/// Options with deterministic lease times and no backoff jitter.
pub fn options() -> ManagerOptions {
    ManagerOptions {
        lease: LeasePolicy { renew_jitter_ms: 0, ..Default::default() },
        backoff: BackoffPolicy { step_ms: 50, max_ms: 60_000, jitter_ms: 0 },
        ..Default::default()
    }
}

pub async fn manager(
    authority: &Arc<ScriptedAuthority>,
    options: ManagerOptions,
) -> Result<CredentialManager> {
    CredentialManager::new_with_credentials(authority.clone(), options, credentials()).await
}

pub fn user_pass(username: &str) -> Value {
    serde_json::json!({ "username": username, "password": format!("{}-password", username) })
}
