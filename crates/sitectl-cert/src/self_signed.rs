//! Self-signed certificate generation for domains without a public CA
//!
//! Produces a PEM key pair valid for the domain and its `www.` alias. The
//! pair is written with the private key readable by its owner only.

use chrono::{DateTime, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use std::path::Path;
use thiserror::Error;
use tracing::debug;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

/// Default validity of a generated certificate
pub const DEFAULT_VALID_DAYS: i64 = 365;

#[derive(Error, Debug)]
pub enum SelfSignedError {
    #[error("Certificate generation failed: {0}")]
    GenerationFailed(String),

    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),

    #[error("Certificate parsing failed: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A self-signed certificate with its private key
#[derive(Debug, Clone)]
pub struct SelfSignedCertificate {
    /// Certificate in PEM format
    pub pem_cert: String,

    /// Private key in PEM format
    pub pem_key: String,

    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Generate a self-signed certificate for `domain`
///
/// The certificate carries `domain` as common name and both `domain` and
/// `www.{domain}` as subject alternative names. A random serial avoids
/// browser caching collisions when a pair is regenerated.
pub fn generate_self_signed_cert(
    domain: &str,
    valid_days: i64,
) -> Result<SelfSignedCertificate, SelfSignedError> {
    let mut params =
        CertificateParams::new(vec![domain.to_string(), format!("www.{}", domain)])
            .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, domain);
    dn.push(DnType::OrganizationName, "sitectl self-signed");
    params.distinguished_name = dn;

    let not_before = time::OffsetDateTime::now_utc();
    let not_after = not_before + time::Duration::days(valid_days);
    params.not_before = not_before;
    params.not_after = not_after;

    params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));

    let key_pair =
        KeyPair::generate().map_err(|e| SelfSignedError::KeyGenerationFailed(e.to_string()))?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;

    debug!("Generated self-signed certificate for {}", domain);

    Ok(SelfSignedCertificate {
        pem_cert: cert.pem(),
        pem_key: key_pair.serialize_pem(),
        issued_at: to_chrono(not_before)?,
        expires_at: to_chrono(not_after)?,
    })
}

fn to_chrono(t: time::OffsetDateTime) -> Result<DateTime<Utc>, SelfSignedError> {
    DateTime::from_timestamp(t.unix_timestamp(), 0)
        .ok_or_else(|| SelfSignedError::GenerationFailed(format!("timestamp out of range: {}", t)))
}

impl SelfSignedCertificate {
    /// Save certificate and key to PEM files, creating parent directories
    pub fn save_to_files(&self, cert_path: &Path, key_path: &Path) -> Result<(), SelfSignedError> {
        for path in [cert_path, key_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }

        std::fs::write(cert_path, &self.pem_cert)?;
        write_private(key_path, &self.pem_key)?;
        Ok(())
    }
}

/// Write a file readable by its owner only (Unix)
fn write_private(path: &Path, content: &str) -> std::io::Result<()> {
    use std::fs::OpenOptions;
    use std::io::Write;

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(content.as_bytes())
}

/// Read the `notAfter` date of the first certificate in a PEM chain
pub fn read_expiry(cert_pem: &str) -> Result<DateTime<Utc>, SelfSignedError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| SelfSignedError::Parse(e.to_string()))?;

    let (_, cert) =
        X509Certificate::from_der(&pem.contents).map_err(|e| SelfSignedError::Parse(e.to_string()))?;

    let not_after = cert.validity().not_after.timestamp();
    DateTime::from_timestamp(not_after, 0)
        .ok_or_else(|| SelfSignedError::Parse(format!("notAfter out of range: {}", not_after)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_self_signed_cert() {
        let cert = generate_self_signed_cert("shop.test", DEFAULT_VALID_DAYS).unwrap();

        assert!(cert.pem_cert.contains("BEGIN CERTIFICATE"));
        assert!(cert.pem_key.contains("BEGIN PRIVATE KEY"));
        assert_eq!((cert.expires_at - cert.issued_at).num_days(), DEFAULT_VALID_DAYS);
    }

    #[test]
    fn test_read_expiry_matches_generation() {
        let cert = generate_self_signed_cert("shop.test", 30).unwrap();
        let expiry = read_expiry(&cert.pem_cert).unwrap();

        assert_eq!(expiry, cert.expires_at);
    }

    #[test]
    fn test_read_expiry_rejects_garbage() {
        assert!(read_expiry("not a certificate").is_err());
    }

    #[test]
    fn test_save_to_files() {
        let temp_dir = TempDir::new().unwrap();
        let cert_path = temp_dir.path().join("ssl").join("shop.test.crt");
        let key_path = temp_dir.path().join("ssl").join("shop.test.key");

        let cert = generate_self_signed_cert("shop.test", 10).unwrap();
        cert.save_to_files(&cert_path, &key_path).unwrap();

        assert_eq!(std::fs::read_to_string(&cert_path).unwrap(), cert.pem_cert);
        assert_eq!(std::fs::read_to_string(&key_path).unwrap(), cert.pem_key);
    }

    #[test]
    #[cfg(unix)]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let cert_path = temp_dir.path().join("a.crt");
        let key_path = temp_dir.path().join("a.key");

        generate_self_signed_cert("a.test", 10)
            .unwrap()
            .save_to_files(&cert_path, &key_path)
            .unwrap();

        let mode = std::fs::metadata(&key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
