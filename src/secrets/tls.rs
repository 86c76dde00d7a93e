//! TLS certificate secrets.
//!
//! A certificate and its private key are usually stored under two separate
//! paths, each holding the PEM text under `data`. A PKI issue response carries
//! both in one payload as `certificate` and `private_key`.

use crate::authority::RawSecret;
use crate::errors::{Error, Result};
use crate::secrets::views::{string_field, SecretKind};
use crate::secrets::SecretString;
use chrono::{DateTime, Utc};
use x509_parser::pem::Pem;

/// A validated certificate chain plus private key, both PEM encoded.
#[derive(Debug, Clone)]
pub struct TlsCert {
    /// Leaf first, then intermediates.
    pub certificate_pem: String,
    pub private_key_pem: SecretString,
    pub subject: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl TlsCert {
    /// Combine a certificate secret and a key secret, each holding PEM under `data`.
    pub fn from_parts(cert: &RawSecret, key: &RawSecret) -> Result<Self> {
        let certificate_pem = string_field(cert, SecretKind::TlsCert, "data")?;
        let private_key_pem = string_field(key, SecretKind::TlsCert, "data")?;
        Self::from_pem(certificate_pem, SecretString::new(private_key_pem))
    }

    /// Validate PEM text and extract certificate metadata.
    pub fn from_pem(certificate_pem: String, private_key_pem: SecretString) -> Result<Self> {
        let leaf = Pem::iter_from_buffer(certificate_pem.as_bytes())
            .next()
            .ok_or_else(|| Error::invalid_certificate("no PEM block in certificate data"))?
            .map_err(|e| Error::invalid_certificate(format!("malformed certificate PEM: {}", e)))?;

        if leaf.label != "CERTIFICATE" {
            return Err(Error::invalid_certificate(format!(
                "expected a CERTIFICATE block, found {}",
                leaf.label
            )));
        }

        let (subject, issuer, not_before, not_after) = {
            let parsed = leaf
                .parse_x509()
                .map_err(|e| Error::invalid_certificate(format!("malformed certificate: {}", e)))?;
            let validity = parsed.validity();
            (
                parsed.subject().to_string(),
                parsed.issuer().to_string(),
                timestamp(validity.not_before.timestamp())?,
                timestamp(validity.not_after.timestamp())?,
            )
        };

        let key = Pem::iter_from_buffer(private_key_pem.expose_secret().as_bytes())
            .next()
            .ok_or_else(|| Error::invalid_certificate("no PEM block in private key data"))?
            .map_err(|e| Error::invalid_certificate(format!("malformed private key PEM: {}", e)))?;

        if !key.label.ends_with("PRIVATE KEY") {
            return Err(Error::invalid_certificate(format!(
                "expected a PRIVATE KEY block, found {}",
                key.label
            )));
        }

        Ok(Self { certificate_pem, private_key_pem, subject, issuer, not_before, not_after })
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_after
    }
}

fn timestamp(seconds: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(seconds, 0)
        .ok_or_else(|| Error::invalid_certificate("certificate validity out of range"))
}
