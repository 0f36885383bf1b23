//! certbot invocations for CA-issued certificates
//!
//! Issuance and renewal are delegated to certbot. This module only knows
//! certbot's command line and where it keeps live certificates; the
//! caller runs the commands and decides what a failure means.

use std::path::PathBuf;
use thiserror::Error;

/// ACME errors
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Invalid email: {0}")]
    InvalidEmail(String),
}

/// ACME client configuration
#[derive(Debug, Clone)]
pub struct AcmeConfig {
    /// certbot executable
    pub certbot_bin: String,
    /// certbot's live certificate directory
    pub live_dir: PathBuf,
    /// Use Let's Encrypt staging environment (for testing)
    pub use_staging: bool,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            certbot_bin: "certbot".to_string(),
            live_dir: PathBuf::from("/etc/letsencrypt/live"),
            use_staging: false,
        }
    }
}

/// Certificate and key paths certbot maintains for a domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveCertificate {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl LiveCertificate {
    pub fn exists(&self) -> bool {
        self.cert_path.exists() && self.key_path.exists()
    }
}

/// Builds certbot command lines
#[derive(Debug, Clone)]
pub struct AcmeClient {
    config: AcmeConfig,
}

impl AcmeClient {
    pub fn new(config: AcmeConfig) -> Self {
        Self { config }
    }

    /// certbot executable name or path
    pub fn program(&self) -> &str {
        &self.config.certbot_bin
    }

    /// Where certbot keeps the live pair for `domain`
    pub fn live_certificate(&self, domain: &str) -> LiveCertificate {
        let dir = self.config.live_dir.join(domain);
        LiveCertificate {
            cert_path: dir.join("fullchain.pem"),
            key_path: dir.join("privkey.pem"),
        }
    }

    /// Arguments for a standalone HTTP-01 issuance
    ///
    /// Standalone mode binds port 80 itself, so both web servers must be
    /// stopped while this runs.
    pub fn certonly_args(&self, domain: &str, email: &str) -> Result<Vec<String>, AcmeError> {
        Self::validate_domain(domain)?;
        Self::validate_email(email)?;

        let mut args: Vec<String> = [
            "certonly",
            "--standalone",
            "--non-interactive",
            "--agree-tos",
            "--email",
            email,
            "-d",
            domain,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        if self.config.use_staging {
            args.push("--staging".to_string());
        }

        Ok(args)
    }

    /// Arguments for `certbot renew`
    ///
    /// `cert_name` restricts renewal to one lineage. The hooks run only
    /// when certbot actually renews something.
    pub fn renew_args(
        &self,
        cert_name: Option<&str>,
        dry_run: bool,
        pre_hook: &str,
        post_hook: &str,
    ) -> Result<Vec<String>, AcmeError> {
        let mut args = vec!["renew".to_string(), "--non-interactive".to_string()];

        if let Some(name) = cert_name {
            Self::validate_domain(name)?;
            args.push("--cert-name".to_string());
            args.push(name.to_string());
        }

        if dry_run {
            args.push("--dry-run".to_string());
        }

        args.push("--pre-hook".to_string());
        args.push(pre_hook.to_string());
        args.push("--post-hook".to_string());
        args.push(post_hook.to_string());

        Ok(args)
    }

    /// Validate domain name for ACME
    pub fn validate_domain(domain: &str) -> Result<(), AcmeError> {
        if domain.is_empty() {
            return Err(AcmeError::InvalidDomain(
                "Domain cannot be empty".to_string(),
            ));
        }

        if domain.contains(char::is_whitespace) {
            return Err(AcmeError::InvalidDomain(
                "Domain cannot contain spaces".to_string(),
            ));
        }

        if domain.starts_with('.') || domain.ends_with('.') {
            return Err(AcmeError::InvalidDomain(
                "Domain cannot start or end with a dot".to_string(),
            ));
        }

        if domain.starts_with('*') {
            return Err(AcmeError::InvalidDomain(
                "Wildcard certificates need DNS-01 validation".to_string(),
            ));
        }

        Ok(())
    }

    /// Let's Encrypt rejects registrations without a plausible address
    pub fn validate_email(email: &str) -> Result<(), AcmeError> {
        let valid = match email.split_once('@') {
            Some((local, host)) => {
                !local.is_empty()
                    && host.contains('.')
                    && !host.starts_with('.')
                    && !host.ends_with('.')
                    && !email.contains(char::is_whitespace)
            }
            None => false,
        };

        if valid {
            Ok(())
        } else {
            Err(AcmeError::InvalidEmail(email.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> AcmeClient {
        AcmeClient::new(AcmeConfig::default())
    }

    #[test]
    fn test_validate_domain() {
        assert!(AcmeClient::validate_domain("example.com").is_ok());
        assert!(AcmeClient::validate_domain("sub.example.com").is_ok());
        assert!(AcmeClient::validate_domain("").is_err());
        assert!(AcmeClient::validate_domain("invalid domain.com").is_err());
        assert!(AcmeClient::validate_domain(".example.com").is_err());
        assert!(AcmeClient::validate_domain("example.com.").is_err());
        assert!(AcmeClient::validate_domain("*.example.com").is_err());
    }

    #[test]
    fn test_validate_email() {
        assert!(AcmeClient::validate_email("admin@example.com").is_ok());
        assert!(AcmeClient::validate_email("admin").is_err());
        assert!(AcmeClient::validate_email("@example.com").is_err());
        assert!(AcmeClient::validate_email("admin@localhost").is_err());
        assert!(AcmeClient::validate_email("ad min@example.com").is_err());
    }

    #[test]
    fn test_certonly_args() {
        let args = client().certonly_args("shop.example.com", "ops@example.com").unwrap();
        assert_eq!(args[0], "certonly");
        assert!(args.contains(&"--standalone".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-d" && w[1] == "shop.example.com"));
        assert!(args.windows(2).any(|w| w[0] == "--email" && w[1] == "ops@example.com"));
        assert!(!args.contains(&"--staging".to_string()));
    }

    #[test]
    fn test_certonly_args_staging() {
        let config = AcmeConfig {
            use_staging: true,
            ..AcmeConfig::default()
        };
        let args = AcmeClient::new(config)
            .certonly_args("shop.example.com", "ops@example.com")
            .unwrap();
        assert!(args.contains(&"--staging".to_string()));
    }

    #[test]
    fn test_renew_args_single() {
        let args = client()
            .renew_args(Some("shop.example.com"), true, "stop", "start")
            .unwrap();
        assert!(args.windows(2).any(|w| w[0] == "--cert-name" && w[1] == "shop.example.com"));
        assert!(args.contains(&"--dry-run".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "--pre-hook" && w[1] == "stop"));
        assert!(args.windows(2).any(|w| w[0] == "--post-hook" && w[1] == "start"));
    }

    #[test]
    fn test_live_certificate_paths() {
        let live = client().live_certificate("shop.example.com");
        assert_eq!(
            live.cert_path,
            PathBuf::from("/etc/letsencrypt/live/shop.example.com/fullchain.pem")
        );
        assert_eq!(
            live.key_path,
            PathBuf::from("/etc/letsencrypt/live/shop.example.com/privkey.pem")
        );
    }
}
