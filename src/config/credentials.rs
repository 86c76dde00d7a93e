//! # AppRole Credentials
//!
//! Resolves the app role credentials used for the root authentication.
//!
//! `VAULT_AUTHCREDENTIALS` accepts three forms:
//! - a JSON object: `{"role_id":"...","secret_id":"..."}`
//! - `file:<path>`: a file holding the same JSON object
//! - `kubernetes:<dir>`: a directory with `role_id` and `secret_id` files (mounted secret)

use crate::errors::{Error, Result};
use crate::secrets::SecretString;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable the credentials are resolved from.
pub const APPROLE_CREDENTIALS_ENV: &str = "VAULT_AUTHCREDENTIALS";

const FILE_PREFIX: &str = "file:";
const KUBERNETES_PREFIX: &str = "kubernetes:";
const KUBERNETES_ROLE_FILE: &str = "role_id";
const KUBERNETES_SECRET_FILE: &str = "secret_id";

/// Role id and secret id for an app role login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppRoleCredentials {
    pub role_id: String,
    pub secret_id: SecretString,
}

impl AppRoleCredentials {
    pub fn new(role_id: impl Into<String>, secret_id: impl Into<String>) -> Self {
        Self { role_id: role_id.into(), secret_id: SecretString::new(secret_id) }
    }

    /// Resolve credentials from `VAULT_AUTHCREDENTIALS`.
    ///
    /// Called on every authentication so rotated files are picked up.
    pub fn from_env() -> Result<Self> {
        let locator = std::env::var(APPROLE_CREDENTIALS_ENV).unwrap_or_default();
        if locator.is_empty() {
            return Err(Error::config(format!("ENV {} is empty", APPROLE_CREDENTIALS_ENV)));
        }
        Self::from_locator(&locator)
    }

    /// Resolve credentials from one of the three accepted forms.
    pub fn from_locator(locator: &str) -> Result<Self> {
        let credentials = if let Some(path) = locator.strip_prefix(FILE_PREFIX) {
            Self::read_file(path)?
        } else if let Some(dir) = locator.strip_prefix(KUBERNETES_PREFIX) {
            Self::read_kubernetes(dir)?
        } else {
            Self::read_json(locator)?
        };
        credentials.validate()?;
        Ok(credentials)
    }

    /// Read a JSON credentials file.
    pub fn read_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::read_json(&raw)
    }

    /// Read a mounted directory with one file per field.
    pub fn read_kubernetes(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let role_id = std::fs::read_to_string(dir.join(KUBERNETES_ROLE_FILE))?;
        let secret_id = std::fs::read_to_string(dir.join(KUBERNETES_SECRET_FILE))?;
        Ok(Self::new(role_id.trim_end(), secret_id.trim_end()))
    }

    pub fn read_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.role_id.is_empty() {
            return Err(Error::config("Invalid app role authentication role id"));
        }
        if self.secret_id.is_empty() {
            return Err(Error::config("Invalid app role authentication secret id"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_json_credentials() {
        let creds =
            AppRoleCredentials::from_locator(r#"{"role_id":"role","secret_id":"secret"}"#).unwrap();
        assert_eq!(creds.role_id, "role");
        assert_eq!(creds.secret_id.expose_secret(), "secret");
    }

    #[test]
    fn test_read_file_credentials() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"role_id":"file-role","secret_id":"file-secret"}}"#).unwrap();

        let locator = format!("file:{}", file.path().display());
        let creds = AppRoleCredentials::from_locator(&locator).unwrap();
        assert_eq!(creds.role_id, "file-role");
        assert_eq!(creds.secret_id.expose_secret(), "file-secret");
    }

    #[test]
    fn test_read_kubernetes_credentials() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("role_id"), "kube-role\n").unwrap();
        std::fs::write(dir.path().join("secret_id"), "kube-secret\n").unwrap();

        let locator = format!("kubernetes:{}", dir.path().display());
        let creds = AppRoleCredentials::from_locator(&locator).unwrap();
        assert_eq!(creds.role_id, "kube-role");
        assert_eq!(creds.secret_id.expose_secret(), "kube-secret");
    }

    #[test]
    fn test_invalid_credentials() {
        let err =
            AppRoleCredentials::from_locator(r#"{"role_id":"","secret_id":"s"}"#).unwrap_err();
        assert!(err.to_string().contains("role id"));

        let err = AppRoleCredentials::from_locator(r#"{"role_id":1,"secret_id":"s"}"#).unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));

        let err = AppRoleCredentials::from_locator("file:/nonexistent/creds.json").unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn test_secret_id_is_redacted() {
        let creds = AppRoleCredentials::new("role", "very-secret");
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("very-secret"));
    }
}
