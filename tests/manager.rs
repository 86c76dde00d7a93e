//! Credential manager integration tests.
//!
//! Drive a manager against the scripted in-memory authority on a paused clock:
//! startup, disabled kinds, auth rotation cascading to dependents, stale-but-valid
//! serving during an outage, generic reads and writes, and shutdown.

mod common;

use common::{manager, options, user_pass, ScriptedAuthority};
use credlease::{Error, SecretKind};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const POSTGRES_PATH: &str = "database/creds/app";
const MONGO_PATH: &str = "mongodb/creds/app";
const STS_PATH: &str = "aws/sts/app";
const KV_PATH: &str = "secret/data/app";
const DAY: u64 = 24 * 3600;

fn sts() -> serde_json::Value {
    json!({ "access_key": "AKIA", "secret_key": "secret", "security_token": "session" })
}

async fn sleep_secs(seconds: u64) {
    tokio::time::sleep(Duration::from_secs(seconds)).await;
}

#[tokio::test(start_paused = true)]
async fn test_startup_fetches_enabled_kinds() {
    let authority = Arc::new(
        ScriptedAuthority::new()
            .with_secret(POSTGRES_PATH, user_pass("v-postgres"), DAY, false)
            .with_secret(MONGO_PATH, user_pass("v-mongo"), DAY, false)
            .with_secret(STS_PATH, sts(), 3600, true),
    );
    let mut opts = options();
    opts.enable_postgres = true;
    opts.postgres_creds_path = POSTGRES_PATH.to_string();
    opts.enable_mongo = true;
    opts.mongo_creds_path = MONGO_PATH.to_string();
    opts.enable_cloud_sts = true;
    opts.cloud_sts_creds_path = STS_PATH.to_string();

    let manager = manager(&authority, opts).await.unwrap();

    let postgres = manager.postgres_secret().await.unwrap();
    assert_eq!(postgres.username, "v-postgres");
    assert_eq!(postgres.password.expose_secret(), "v-postgres-password");
    assert_eq!(manager.mongo_secret().await.unwrap().username, "v-mongo");
    assert_eq!(manager.cloud_sts_secret().await.unwrap().access_key, "AKIA");

    let auth = manager.auth_secret().await.unwrap();
    assert_eq!(auth.client_token.expose_secret(), "token-1");
    assert_eq!(postgres.lease().parent().map(|p| p.id()), Some(auth.id()));

    assert_eq!(authority.logins(), 1);
    assert_eq!(authority.reads_of(POSTGRES_PATH), vec!["token-1"]);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_disabled_kinds_return_static_error() {
    let authority = Arc::new(ScriptedAuthority::new());
    let manager = manager(&authority, options()).await.unwrap();

    assert_eq!(manager.mongo_secret().await.unwrap_err(), SecretKind::Mongo.disabled());
    assert_eq!(manager.postgres_secret().await.unwrap_err(), SecretKind::Postgres.disabled());
    assert_eq!(manager.tls_cert_secret().await.unwrap_err(), SecretKind::TlsCert.disabled());
    assert_eq!(manager.cloud_sts_secret().await.unwrap_err(), SecretKind::CloudSts.disabled());

    let err = manager.mongo_secret().await.unwrap_err();
    assert!(err.to_string().contains("options.enable_mongo"));
    assert!(manager.auth_secret().await.is_ok());
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_startup_fails_when_login_fails() {
    let authority = Arc::new(ScriptedAuthority::new());
    authority.set_fail_logins(true);

    let err = manager(&authority, options()).await.unwrap_err();
    assert!(matches!(err, Error::AuthenticationFailed { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_startup_fails_when_enabled_secret_fails() {
    let authority = Arc::new(ScriptedAuthority::new());
    let mut opts = options();
    opts.enable_postgres = true;
    opts.postgres_creds_path = POSTGRES_PATH.to_string();

    let err = manager(&authority, opts.clone()).await.unwrap_err();
    assert_eq!(err, Error::not_found(POSTGRES_PATH));

    authority.set_secret(POSTGRES_PATH, json!({ "username": "v-app" }), DAY, false);
    let err = manager(&authority, opts).await.unwrap_err();
    assert_eq!(err, Error::EmptyField { secret: SecretKind::Postgres, key: "password" });
}

#[tokio::test(start_paused = true)]
async fn test_invalid_options_are_rejected() {
    let authority = Arc::new(ScriptedAuthority::new());
    let mut opts = options();
    opts.enable_tls_cert = true;

    let err = manager(&authority, opts).await.unwrap_err();
    assert!(matches!(err, Error::Config { .. }));
    assert_eq!(authority.logins(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_auth_rotation_cascades_exactly_once() {
    let authority = Arc::new(
        ScriptedAuthority::new()
            .with_secret(POSTGRES_PATH, user_pass("v-app"), DAY, false)
            .with_secret(KV_PATH, json!({ "api_key": "k" }), 0, false),
    );
    // Token renewals come back too short, so the auth handler logs in again.
    authority.set_token_renewal_ttl(300);

    let mut opts = options();
    opts.enable_postgres = true;
    opts.postgres_creds_path = POSTGRES_PATH.to_string();
    opts.lease.static_ttl_seconds = DAY;
    let manager = manager(&authority, opts).await.unwrap();

    let first_auth = manager.auth_secret().await.unwrap();
    let first_postgres = manager.postgres_secret().await.unwrap();
    let first_kv = manager.read(KV_PATH).await.unwrap();

    // The auth lease of 3600s is due at 3540s.
    sleep_secs(3539).await;
    assert_eq!(authority.logins(), 1);

    sleep_secs(2).await;
    assert_eq!(authority.token_renewals(), vec!["token-1"]);
    assert_eq!(authority.logins(), 2);

    let auth = manager.auth_secret().await.unwrap();
    assert_eq!(auth.client_token.expose_secret(), "token-2");
    assert!(first_auth.lease().is_canceled());
    assert!(!first_postgres.lease().is_valid());
    assert!(!first_kv.lease().is_valid());

    assert_eq!(authority.reads_of(POSTGRES_PATH), vec!["token-1", "token-2"]);
    assert_eq!(authority.reads_of(KV_PATH), vec!["token-1", "token-2"]);

    let postgres = manager.postgres_secret().await.unwrap();
    assert_ne!(postgres.id(), first_postgres.id());
    assert_eq!(postgres.lease().parent().map(|p| p.id()), Some(auth.id()));

    // The old token is revoked once the grace period has passed.
    assert!(authority.revoked().is_empty());
    sleep_secs(30).await;
    assert_eq!(authority.revoked(), vec!["token-1"]);
    assert_eq!(authority.reads_of(POSTGRES_PATH).len(), 2);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_auth_renewal_in_place_keeps_dependents_authorized() {
    let authority = Arc::new(ScriptedAuthority::new().with_secret(STS_PATH, sts(), DAY, true));
    let mut opts = options();
    opts.enable_cloud_sts = true;
    opts.cloud_sts_creds_path = STS_PATH.to_string();
    let manager = manager(&authority, opts).await.unwrap();

    let first_auth = manager.auth_secret().await.unwrap();
    let first_sts = manager.cloud_sts_secret().await.unwrap();

    sleep_secs(3541).await;

    let auth = manager.auth_secret().await.unwrap();
    assert_eq!(auth.id(), first_auth.id());
    assert_eq!(authority.logins(), 1);
    assert_eq!(authority.token_renewals(), vec!["token-1"]);

    // The dependent renews its own lease instead of fetching a new secret.
    let sts = manager.cloud_sts_secret().await.unwrap();
    assert_eq!(sts.id(), first_sts.id());
    assert_eq!(authority.reads_of(STS_PATH).len(), 1);
    assert_eq!(authority.lease_renewals().len(), 1);

    sleep_secs(60).await;
    assert!(authority.revoked().is_empty());
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stale_secret_served_until_expiry() {
    let authority = Arc::new(
        ScriptedAuthority::new().with_secret(POSTGRES_PATH, user_pass("v-app"), 300, false),
    );
    let mut opts = options();
    opts.enable_postgres = true;
    opts.postgres_creds_path = POSTGRES_PATH.to_string();
    let manager = manager(&authority, opts).await.unwrap();
    let first = manager.postgres_secret().await.unwrap();

    authority.set_path_failing(POSTGRES_PATH, true);
    sleep_secs(250).await;

    // Renewal is failing, the cached secret is still valid.
    assert!(authority.reads_of(POSTGRES_PATH).len() > 2);
    let served = manager.postgres_secret().await.unwrap();
    assert_eq!(served.id(), first.id());

    sleep_secs(50).await;
    let err = manager.postgres_secret().await.unwrap_err();
    assert_eq!(err, Error::authority(Some(503), "Vault is sealed"));

    authority.set_path_failing(POSTGRES_PATH, false);
    sleep_secs(65).await;
    let recovered = manager.postgres_secret().await.unwrap();
    assert_ne!(recovered.id(), first.id());
    assert!(recovered.is_usable());

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_generic_read_and_write() {
    let authority = Arc::new(
        ScriptedAuthority::new().with_secret(KV_PATH, json!({ "api_key": "k-123" }), 0, false),
    );
    let manager = manager(&authority, options()).await.unwrap();

    let secret = manager.read(KV_PATH).await.unwrap();
    assert_eq!(secret.get_str("api_key"), Some("k-123"));
    assert!(!secret.is_renewable());

    let again = manager.read(KV_PATH).await.unwrap();
    assert!(Arc::ptr_eq(&secret, &again));
    assert_eq!(authority.reads_of(KV_PATH).len(), 1);

    let err = manager.read("secret/data/missing").await.unwrap_err();
    assert_eq!(err, Error::not_found("secret/data/missing"));

    let data = json!({ "value": "written" }).as_object().cloned().unwrap();
    assert!(manager.write("secret/data/new", &data).await.unwrap().is_none());
    assert_eq!(authority.writes(), vec![("secret/data/new".to_string(), data)]);

    // Static secrets are refetched after the static TTL.
    sleep_secs(300).await;
    assert_eq!(authority.reads_of(KV_PATH).len(), 2);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_first_read_of_a_path_does_not_block_cached_paths() {
    const SLOW_PATH: &str = "secret/data/slow";
    let authority = Arc::new(
        ScriptedAuthority::new()
            .with_secret(KV_PATH, json!({ "api_key": "fast" }), 0, false)
            .with_secret(SLOW_PATH, json!({ "api_key": "slow" }), 0, false),
    );
    authority.set_read_delay(SLOW_PATH, Duration::from_secs(10));
    let manager = Arc::new(manager(&authority, options()).await.unwrap());
    let cached = manager.read(KV_PATH).await.unwrap();

    let slow = tokio::spawn({
        let manager = manager.clone();
        async move { manager.read(SLOW_PATH).await }
    });
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(authority.reads_of(SLOW_PATH).len(), 1);

    let started = tokio::time::Instant::now();
    let again = tokio::time::timeout(Duration::from_secs(1), manager.read(KV_PATH))
        .await
        .expect("cached read waited for another path")
        .unwrap();
    assert!(Arc::ptr_eq(&cached, &again));
    assert!(started.elapsed() < Duration::from_secs(1));

    // Concurrent readers of the slow path share its first fetch.
    let (waiter, first) = tokio::join!(manager.read(SLOW_PATH), slow);
    let first = first.unwrap().unwrap();
    assert!(Arc::ptr_eq(&first, &waiter.unwrap()));
    assert_eq!(first.get_str("api_key"), Some("slow"));
    assert_eq!(authority.reads_of(SLOW_PATH).len(), 1);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_revokes_pending_tokens_immediately() {
    let authority = Arc::new(ScriptedAuthority::new());
    authority.set_token_renewal_ttl(300);
    let manager = manager(&authority, options()).await.unwrap();

    sleep_secs(3541).await;
    assert_eq!(authority.logins(), 2);
    assert!(authority.revoked().is_empty());

    manager.shutdown().await;
    assert_eq!(authority.revoked(), vec!["token-1"]);
    assert_eq!(manager.read(KV_PATH).await.unwrap_err(), Error::Closed);
}
