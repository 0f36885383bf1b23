//! Certificate material for sitectl
//!
//! Generates self-signed key pairs for domains, reads expiry dates out of
//! PEM certificates, and builds the certbot invocations used for
//! CA-issued certificates. Running those invocations is the caller's job.

pub mod acme;
pub mod self_signed;

pub use acme::{AcmeClient, AcmeConfig, AcmeError, LiveCertificate};
pub use self_signed::{
    generate_self_signed_cert, read_expiry, SelfSignedCertificate, SelfSignedError,
};

use chrono::{DateTime, Utc};

/// Whole days left until `expires_at` (negative once expired)
pub fn days_until_expiry(expires_at: DateTime<Utc>) -> i64 {
    (expires_at - Utc::now()).num_days()
}
