//! # credlease
//!
//! Client-side credential lease manager. It logs in to a secret authority (Vault)
//! with app role credentials, caches the short-lived credentials an application
//! needs, renews them before they expire and rotates everything that depends on
//! the root auth token when that token is replaced.
//!
//! ## Architecture
//!
//! ```text
//! CredentialManager ── SecretHandler<AuthToken> ── auto-renew task
//!        │                     │ (parent lease)
//!        ├── SecretHandler<UserPass>   (mongo, postgres)
//!        ├── SecretHandler<TlsCert>
//!        ├── SecretHandler<CloudSts>
//!        └── SecretHandler<GenericSecret> per read path
//!                  │
//!          SecretAuthority (VaultAuthority over HTTP)
//!
//! ResourceClient<F> ── rebuilds a pool / TLS config when the credential id changes
//! ```
//!
//! ## Core Components
//!
//! - **Lease**: renew and expire times plus cancellation signals of one secret
//! - **SecretHandler**: caches one secret and refreshes it through a source
//! - **Auto-renew task**: waits on lease signals and refreshes with backoff
//! - **CredentialManager**: owns the handlers and cascades auth rotation
//! - **ResourceClient**: swaps resources on credential change and drains old ones
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use credlease::{CredentialManager, ManagerOptions, Result, VaultAuthority};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let options = ManagerOptions::from_env()?;
//!     let authority = Arc::new(VaultAuthority::new(&options.authority)?);
//!     let manager = CredentialManager::new(authority, options).await?;
//!
//!     let token = manager.auth_secret().await?;
//!     tracing::info!(expire_at = %token.lease().expire_at(), "Authenticated");
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod authority;
pub mod config;
pub mod errors;
pub mod handler;
pub mod lease;
pub mod manager;
pub mod observability;
pub mod renewal;
pub mod resource;
pub mod secrets;

// Re-export commonly used types and traits
pub use authority::{RawSecret, SecretAuthority, VaultAuthority};
pub use config::{AppRoleCredentials, LoggingConfig, ManagerOptions};
pub use errors::{Error, Result};
pub use handler::{SecretHandler, SecretSource};
pub use lease::{Lease, SecretId};
pub use manager::{CredentialManager, CredentialSource};
pub use observability::init_tracing;
pub use resource::{ResourceClient, ResourceFactory};
pub use secrets::{
    AuthToken, CloudSts, GenericSecret, Leased, SecretKind, SecretString, TlsCert, UserPass,
};

/// Library version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
