use chrono::{Datelike, Utc};
use std::fs;
use tracing::{debug, info};

use sitectl_cert::{generate_self_signed_cert, read_expiry, self_signed::DEFAULT_VALID_DAYS};

use super::{HostContext, Outcome, Warnings};
use crate::command::Invocation;
use crate::dns::ensure_resolves;
use crate::error::{Result, SiteError};
use crate::models::{normalize_domain, CertType, CertificateRecord, DomainRecord};
use crate::templates::ServerKind;

/// Earliest plausible system year; certificates validated against a
/// clock before this look expired or not yet valid
const MIN_CLOCK_YEAR: i32 = 2024;

#[derive(Debug, Clone)]
pub struct EnableSsl {
    pub domain: String,
    pub cert_type: CertType,
    /// Required for CA-issued certificates unless configured globally
    pub email: Option<String>,
}

/// Certificate state of one domain
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SslStatus {
    pub domain: String,
    pub ssl_enabled: bool,
    pub certificate: Option<CertificateRecord>,
    pub files_present: bool,
    pub days_remaining: Option<i64>,
}

pub struct SslManager<'a> {
    ctx: &'a HostContext,
}

impl<'a> SslManager<'a> {
    pub fn new(ctx: &'a HostContext) -> Self {
        Self { ctx }
    }

    pub fn enable(&self, request: EnableSsl) -> Result<Outcome<CertificateRecord>> {
        let name = normalize_domain(&request.domain)?;
        let mut domain = self.ctx.domains().find(&name)?;
        let existing = self.ctx.certificates().get(&name)?;
        let had_ca = existing
            .as_ref()
            .map_or(false, |c| c.cert_type == CertType::LetsEncrypt);
        let mut warnings = Warnings::default();

        let certificate = match request.cert_type {
            CertType::SelfSigned => self.self_signed(&name, existing)?,
            CertType::LetsEncrypt => {
                let issued = self.ca_issued(&name, request.email, existing, &mut warnings)?;
                // Kept disabled until the domain serves it; a failed render
                // below must not cost another issuance on retry
                self.ctx.certificates().upsert(CertificateRecord {
                    enabled: false,
                    ..issued.clone()
                })?;
                issued
            }
        };

        domain.apply_ssl(&certificate);
        let set = self.ctx.generator().render(&domain)?;

        self.ctx.certificates().upsert(certificate.clone())?;
        self.ctx.domains().upsert(domain)?;
        info!("Enabled {} SSL for {}", certificate.cert_type, name);

        self.ctx.install_and_reload(&set, &mut warnings)?;

        let scheduler = self.ctx.scheduler();
        if certificate.cert_type == CertType::LetsEncrypt {
            if let Err(e) = scheduler.setup_domain_renewal(&name) {
                warnings.push(format!("installing renewal job for {}", name), e);
            }
        } else if had_ca {
            if let Err(e) = scheduler.remove_domain_renewal(&name) {
                warnings.push(format!("removing renewal job for {}", name), e);
            }
        }

        Ok(warnings.finish(certificate))
    }

    /// Reuse a valid pair in the SSL directory or generate a new one
    fn self_signed(
        &self,
        name: &str,
        existing: Option<CertificateRecord>,
    ) -> Result<CertificateRecord> {
        let ssl_dir = &self.ctx.config().ssl_dir;
        let cert_path = ssl_dir.join(format!("{}.crt", name));
        let key_path = ssl_dir.join(format!("{}.key", name));

        if cert_path.exists() && key_path.exists() {
            let expiry = fs::read_to_string(&cert_path)
                .map_err(|e| SiteError::io(&cert_path, e))
                .and_then(|pem| Ok(read_expiry(&pem)?));

            match expiry {
                Ok(expires_at) if expires_at > Utc::now() => {
                    info!("Reusing self-signed certificate for {}", name);
                    let issued_at = existing
                        .filter(|c| c.cert_type == CertType::SelfSigned)
                        .and_then(|c| c.issued_at);
                    return Ok(CertificateRecord {
                        domain: name.to_string(),
                        cert_type: CertType::SelfSigned,
                        email: None,
                        enabled: true,
                        issued_at,
                        expires_at: Some(expires_at),
                        cert_path,
                        key_path,
                    });
                }
                Ok(_) => debug!("Existing certificate for {} has expired", name),
                Err(e) => debug!("Existing certificate for {} unusable: {}", name, e),
            }
        }

        let generated = generate_self_signed_cert(name, DEFAULT_VALID_DAYS)?;
        generated.save_to_files(&cert_path, &key_path)?;
        info!("Generated self-signed certificate for {}", name);

        Ok(CertificateRecord {
            domain: name.to_string(),
            cert_type: CertType::SelfSigned,
            email: None,
            enabled: true,
            issued_at: Some(generated.issued_at),
            expires_at: Some(generated.expires_at),
            cert_path,
            key_path,
        })
    }

    /// Issue through certbot, or re-enable a still-valid earlier issuance
    fn ca_issued(
        &self,
        name: &str,
        email: Option<String>,
        existing: Option<CertificateRecord>,
        warnings: &mut Warnings,
    ) -> Result<CertificateRecord> {
        let acme = self.ctx.acme();
        let live = acme.live_certificate(name);
        let previous = existing.filter(|c| c.cert_type == CertType::LetsEncrypt);

        let email = email
            .or_else(|| previous.as_ref().and_then(|c| c.email.clone()))
            .or_else(|| self.ctx.config().acme.default_email.clone())
            .ok_or_else(|| {
                SiteError::Validation(
                    "an email address is required for Let's Encrypt (--email)".to_string(),
                )
            })?;
        let args = acme.certonly_args(name, &email)?;

        if let Some(previous) = previous {
            if live.exists() && !previous.is_expired() {
                info!("Re-enabling existing Let's Encrypt certificate for {}", name);
                return Ok(CertificateRecord {
                    email: Some(email),
                    enabled: true,
                    cert_path: live.cert_path,
                    key_path: live.key_path,
                    ..previous
                });
            }
        }

        self.preflight(name)?;

        let activator = self.ctx.activator();
        for kind in [ServerKind::Frontend, ServerKind::Secondary] {
            if let Err(e) = activator.stop(kind) {
                warnings.push("stopping web server for issuance", e);
            }
        }

        let invocation = Invocation::new(acme.program()).args(args);
        let issued = self
            .ctx
            .runner()
            .stream(&invocation)
            .and_then(|output| output.check(&invocation));

        for kind in [ServerKind::Frontend, ServerKind::Secondary] {
            if let Err(e) = activator.start(kind) {
                warnings.push("restarting web server after issuance", e);
            }
        }
        issued?;

        if !live.exists() {
            return Err(SiteError::tool(
                acme.program(),
                format!(
                    "reported success but {} is missing",
                    live.cert_path.display()
                ),
            ));
        }

        let expires_at = match fs::read_to_string(&live.cert_path) {
            Ok(pem) => read_expiry(&pem).ok(),
            Err(e) => {
                debug!("Cannot read {}: {}", live.cert_path.display(), e);
                None
            }
        };
        info!("Issued Let's Encrypt certificate for {}", name);

        Ok(CertificateRecord {
            domain: name.to_string(),
            cert_type: CertType::LetsEncrypt,
            email: Some(email),
            enabled: true,
            issued_at: Some(Utc::now()),
            expires_at,
            cert_path: live.cert_path,
            key_path: live.key_path,
        })
    }

    /// Checks that must pass before any server is stopped
    fn preflight(&self, name: &str) -> Result<()> {
        let certbot = &self.ctx.config().acme.certbot_bin;
        if let Err(e) = which::which(certbot) {
            return Err(SiteError::ExternalValidation {
                check: format!("locating {}", certbot),
                message: e.to_string(),
                remedy: "install certbot (e.g. `apt install certbot`) or set acme.certbot_bin"
                    .to_string(),
            });
        }

        let year = Utc::now().year();
        if year < MIN_CLOCK_YEAR {
            return Err(SiteError::ExternalValidation {
                check: "system clock".to_string(),
                message: format!("current year is {}", year),
                remedy: "synchronise the clock, e.g. `timedatectl set-ntp true`".to_string(),
            });
        }

        ensure_resolves(self.ctx.dns(), name)?;
        Ok(())
    }

    /// Switch a domain back to plaintext, keeping its certificate files
    pub fn disable(&self, name: &str) -> Result<Outcome<DomainRecord>> {
        let name = normalize_domain(name)?;
        let domains = self.ctx.domains();
        let mut domain = domains.find(&name)?;

        domain.clear_ssl();
        let set = self.ctx.generator().render(&domain)?;

        self.ctx.certificates().update(|certs| {
            if let Some(cert) = certs.iter_mut().find(|c| c.domain == name) {
                cert.enabled = false;
            }
            Ok(())
        })?;
        domains.upsert(domain.clone())?;
        info!("Disabled SSL for {}", name);

        let mut warnings = Warnings::default();
        if let Err(e) = self.ctx.scheduler().remove_domain_renewal(&name) {
            warnings.push(format!("removing renewal job for {}", name), e);
        }
        self.ctx.install_and_reload(&set, &mut warnings)?;

        Ok(warnings.finish(domain))
    }

    /// Run `certbot renew` for one domain or all, then reload
    ///
    /// Returns the certificate records with refreshed expiry dates.
    pub fn renew(&self, name: Option<&str>, dry_run: bool) -> Result<Outcome<Vec<CertificateRecord>>> {
        let name = name.map(normalize_domain).transpose()?;

        if let Some(name) = &name {
            let cert = self.ctx.certificates().find(name)?;
            if cert.cert_type == CertType::SelfSigned {
                return Err(SiteError::Validation(format!(
                    "{} uses a self-signed certificate; run `sitectl ssl enable {} --type self-signed` to replace it",
                    name, name
                )));
            }
        }

        self.ctx.scheduler().trigger(name.as_deref(), dry_run)?;

        let mut warnings = Warnings::default();
        if dry_run {
            return Ok(warnings.finish(Vec::new()));
        }

        let refreshed = self.ctx.certificates().update(|certs| {
            let mut refreshed = Vec::new();
            for cert in certs.iter_mut().filter(|c| {
                c.cert_type == CertType::LetsEncrypt
                    && name.as_deref().map_or(true, |n| n == c.domain)
            }) {
                if let Ok(pem) = fs::read_to_string(&cert.cert_path) {
                    if let Ok(expires_at) = read_expiry(&pem) {
                        cert.expires_at = Some(expires_at);
                    }
                }
                refreshed.push(cert.clone());
            }
            Ok(refreshed)
        });

        let refreshed = match refreshed {
            Ok(refreshed) => refreshed,
            Err(e) => {
                warnings.push("refreshing certificate records", e);
                Vec::new()
            }
        };

        self.ctx.reload(&mut warnings);
        Ok(warnings.finish(refreshed))
    }

    pub fn status(&self, name: &str) -> Result<SslStatus> {
        let name = normalize_domain(name)?;
        let domain = self.ctx.domains().find(&name)?;
        let certificate = self.ctx.certificates().get(&name)?;

        Ok(SslStatus {
            ssl_enabled: domain.ssl_enabled,
            files_present: certificate.as_ref().map_or(false, |c| c.files_present()),
            days_remaining: certificate.as_ref().and_then(|c| c.days_remaining()),
            domain: name,
            certificate,
        })
    }

    /// Every certificate record, sorted by domain
    pub fn list(&self) -> Result<Vec<CertificateRecord>> {
        let mut certs = self.ctx.certificates().load()?;
        certs.sort_by(|a, b| a.domain.cmp(&b.domain));
        Ok(certs)
    }
}
