//! # Structured Logging
//!
//! Span macros and field names shared by every component that logs lease activity.
//! Secret values are never passed to a log macro; only ids, paths and timestamps are.

/// Field names recorded on a span after it was opened.
pub mod fields {
    /// Id of the secret an operation produced.
    pub const SECRET_ID: &str = "secret_id";
}

/// Create a tracing span for a secret handler operation.
///
/// The span declares an empty `secret_id` field, recorded once the operation
/// has produced a secret:
///
/// ```rust,ignore
/// let span = lease_span!("fetch", SecretKind::Postgres, path = %path);
/// span.record(fields::SECRET_ID, secret.id().as_u64());
/// ```
#[macro_export]
macro_rules! lease_span {
    ($operation:expr, $kind:expr) => {
        tracing::debug_span!(
            "lease_operation",
            operation = %$operation,
            kind = %$kind,
            operation_id = %uuid::Uuid::new_v4(),
            secret_id = tracing::field::Empty
        )
    };
    ($operation:expr, $kind:expr, $($field:tt)*) => {
        tracing::debug_span!(
            "lease_operation",
            operation = %$operation,
            kind = %$kind,
            operation_id = %uuid::Uuid::new_v4(),
            secret_id = tracing::field::Empty,
            $($field)*
        )
    };
}

/// Log the enabled credential kinds at manager startup
pub fn log_options_info(options: &crate::config::ManagerOptions) {
    tracing::info!(
        authority = %options.authority.address,
        namespace = ?options.authority.namespace,
        mongo_enabled = %options.enable_mongo,
        postgres_enabled = %options.enable_postgres,
        tls_cert_enabled = %options.enable_tls_cert,
        cloud_sts_enabled = %options.enable_cloud_sts,
        "Credential manager configuration"
    );
}
