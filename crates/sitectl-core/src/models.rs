//! Persisted records: domains and their certificates

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, SiteError};

/// A value keyed by domain name inside a [`crate::store::RecordStore`]
pub trait Record: Serialize + DeserializeOwned + Clone {
    fn key(&self) -> &str;
}

/// Which server speaks PHP for a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// nginx talks to PHP-FPM directly
    #[default]
    #[serde(alias = "direct")]
    Nginx,
    /// nginx proxies to apache, which talks to PHP-FPM
    #[serde(alias = "proxied")]
    Apache,
}

impl Backend {
    pub fn is_proxied(self) -> bool {
        self == Backend::Apache
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Nginx => "nginx",
            Backend::Apache => "apache",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = SiteError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nginx" | "direct" => Ok(Backend::Nginx),
            "apache" | "apache2" | "proxied" => Ok(Backend::Apache),
            other => Err(SiteError::Validation(format!(
                "unknown backend '{}' (expected nginx or apache)",
                other
            ))),
        }
    }
}

/// Supported PHP-FPM runtimes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PhpVersion {
    #[serde(rename = "7.4")]
    V74,
    #[serde(rename = "8.0")]
    V80,
    #[serde(rename = "8.1")]
    V81,
    #[default]
    #[serde(rename = "8.2")]
    V82,
    #[serde(rename = "8.3")]
    V83,
    #[serde(rename = "8.4")]
    V84,
}

impl PhpVersion {
    pub const ALL: [PhpVersion; 6] = [
        PhpVersion::V74,
        PhpVersion::V80,
        PhpVersion::V81,
        PhpVersion::V82,
        PhpVersion::V83,
        PhpVersion::V84,
    ];

    /// Bare `X.Y` token, as used in the FPM socket name
    pub fn as_str(self) -> &'static str {
        match self {
            PhpVersion::V74 => "7.4",
            PhpVersion::V80 => "8.0",
            PhpVersion::V81 => "8.1",
            PhpVersion::V82 => "8.2",
            PhpVersion::V83 => "8.3",
            PhpVersion::V84 => "8.4",
        }
    }

    pub fn socket_path(self) -> String {
        format!("/run/php/php{}-fpm.sock", self.as_str())
    }
}

impl fmt::Display for PhpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhpVersion {
    type Err = SiteError;

    fn from_str(s: &str) -> Result<Self> {
        let token = s.trim().to_ascii_lowercase();
        let token = token.strip_prefix("php").unwrap_or(&token);

        PhpVersion::ALL
            .into_iter()
            .find(|v| v.as_str() == token)
            .ok_or_else(|| {
                let supported: Vec<&str> = PhpVersion::ALL.iter().map(|v| v.as_str()).collect();
                SiteError::Validation(format!(
                    "unsupported PHP version '{}' (supported: {})",
                    s,
                    supported.join(", ")
                ))
            })
    }
}

/// How a certificate was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CertType {
    #[default]
    #[serde(rename = "self-signed")]
    SelfSigned,
    #[serde(rename = "letsencrypt")]
    LetsEncrypt,
}

impl fmt::Display for CertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertType::SelfSigned => f.write_str("self-signed"),
            CertType::LetsEncrypt => f.write_str("letsencrypt"),
        }
    }
}

impl FromStr for CertType {
    type Err = SiteError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "self-signed" | "selfsigned" | "self" => Ok(CertType::SelfSigned),
            "letsencrypt" | "lets-encrypt" | "le" | "acme" => Ok(CertType::LetsEncrypt),
            other => Err(SiteError::Validation(format!(
                "unknown certificate type '{}' (expected self-signed or letsencrypt)",
                other
            ))),
        }
    }
}

/// One hosted site
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DomainRecord {
    pub name: String,
    pub backend: Backend,
    pub php_version: PhpVersion,
    pub document_root: PathBuf,
    pub ssl_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_cert_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_key_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl DomainRecord {
    pub fn new(name: &str, backend: Backend, php_version: PhpVersion, web_root: &Path) -> Self {
        Self {
            name: name.to_string(),
            backend,
            php_version,
            document_root: document_root_for(web_root, name),
            created_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Point the record at a certificate's files
    pub fn apply_ssl(&mut self, cert: &CertificateRecord) {
        self.ssl_enabled = true;
        self.ssl_cert_path = Some(cert.cert_path.clone());
        self.ssl_key_path = Some(cert.key_path.clone());
        self.ssl_email = cert.email.clone();
    }

    pub fn clear_ssl(&mut self) {
        self.ssl_enabled = false;
        self.ssl_cert_path = None;
        self.ssl_key_path = None;
        self.ssl_email = None;
    }
}

impl Record for DomainRecord {
    fn key(&self) -> &str {
        &self.name
    }
}

/// Certificate state for a domain, kept when SSL is switched off
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CertificateRecord {
    pub domain: String,
    pub cert_type: CertType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl CertificateRecord {
    pub fn files_present(&self) -> bool {
        !self.cert_path.as_os_str().is_empty()
            && !self.key_path.as_os_str().is_empty()
            && self.cert_path.exists()
            && self.key_path.exists()
    }

    /// Display-only; renewal windows are certbot's decision
    pub fn days_remaining(&self) -> Option<i64> {
        self.expires_at.map(sitectl_cert::days_until_expiry)
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|at| at <= Utc::now()).unwrap_or(false)
    }
}

impl Record for CertificateRecord {
    fn key(&self) -> &str {
        &self.domain
    }
}

/// `{web_root}/{domain}/public_html`
pub fn document_root_for(web_root: &Path, domain: &str) -> PathBuf {
    web_root.join(domain).join("public_html")
}

/// Lower-case and validate a domain name
///
/// Accepts at least two dot-separated labels of `[a-z0-9-]`, each 1-63
/// characters without a leading or trailing hyphen, 253 characters total.
pub fn normalize_domain(name: &str) -> Result<String> {
    let name = name.trim().trim_end_matches('.').to_ascii_lowercase();
    let invalid = |reason: &str| SiteError::Validation(format!("invalid domain '{}': {}", name, reason));

    if name.is_empty() {
        return Err(invalid("empty"));
    }
    if name.len() > 253 {
        return Err(invalid("longer than 253 characters"));
    }

    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() < 2 {
        return Err(invalid("needs at least two labels"));
    }

    for label in labels {
        if label.is_empty() || label.len() > 63 {
            return Err(invalid("labels must be 1-63 characters"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("labels cannot start or end with a hyphen"));
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(invalid("only letters, digits and hyphens are allowed"));
        }
    }

    Ok(name)
}
