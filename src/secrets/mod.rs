//! # Secrets
//!
//! Typed credentials parsed from authority payloads, and the redacting
//! [`SecretString`] they keep their sensitive fields in.
//!
//! | Kind | View | Payload keys |
//! |------|------|--------------|
//! | auth | [`AuthToken`] | `auth.client_token`, `auth.accessor` |
//! | mongo, postgres | [`UserPass`] | `username`, `password` |
//! | tls cert | [`TlsCert`] | `data` at the cert path and at the key path |
//! | cloud sts | [`CloudSts`] | `access_key`, `secret_key`, `security_token` |
//! | generic | [`GenericSecret`] | anything |
//!
//! Every view is wrapped in a [`Leased`] together with the lease it was issued under.

pub mod tls;
pub mod types;
pub mod views;

pub use tls::TlsCert;
pub use types::SecretString;
pub use views::{AuthToken, CloudSts, GenericSecret, Leased, SecretKind, TypedSecret, UserPass};
