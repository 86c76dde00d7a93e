//! # Configuration Management
//!
//! Manager options, lease and backoff policies, and the app role credentials
//! used for the root authentication.

pub mod credentials;
pub mod settings;

pub use credentials::{AppRoleCredentials, APPROLE_CREDENTIALS_ENV};
pub use settings::{
    AuthorityConfig, BackoffPolicy, GracePolicy, LeasePolicy, LoggingConfig, ManagerOptions,
    ENV_PREFIX,
};
