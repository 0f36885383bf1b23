//! Per-domain artifact generation
//!
//! A domain's artifacts are a pure function of its backend, its TLS flag and
//! its certificate paths. Everything is rendered before anything is
//! written, so a missing template leaves the filesystem untouched.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::activator::BackendActivator;
use crate::error::{IoResultExt, Result, SiteError};
use crate::models::DomainRecord;
use crate::templates::{apply_cache_policy, GlobalConfigInspector, TemplateName, TemplateResolver, TemplateVars};

/// One rendered config file and where it goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub template: TemplateName,
    pub path: PathBuf,
    pub contents: String,
}

/// Everything written for one domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSet {
    pub domain: String,
    pub frontend: Artifact,
    /// Present for proxied domains
    pub secondary: Option<Artifact>,
}

pub struct ConfigGenerator {
    resolver: TemplateResolver,
    inspector: Arc<dyn GlobalConfigInspector>,
    activator: BackendActivator,
}

impl ConfigGenerator {
    pub fn new(
        resolver: TemplateResolver,
        inspector: Arc<dyn GlobalConfigInspector>,
        activator: BackendActivator,
    ) -> Self {
        Self {
            resolver,
            inspector,
            activator,
        }
    }

    pub fn activator(&self) -> &BackendActivator {
        &self.activator
    }

    fn ssl_paths(domain: &DomainRecord) -> Result<Option<(&Path, &Path)>> {
        if !domain.ssl_enabled {
            return Ok(None);
        }

        let (Some(cert), Some(key)) = (&domain.ssl_cert_path, &domain.ssl_key_path) else {
            return Err(SiteError::Validation(format!(
                "{} has SSL enabled without certificate paths",
                domain.name
            )));
        };

        for path in [cert, key] {
            if !path.exists() {
                return Err(SiteError::Validation(format!(
                    "{}: certificate file {} does not exist",
                    domain.name,
                    path.display()
                )));
            }
        }

        Ok(Some((cert.as_path(), key.as_path())))
    }

    /// Render without touching the filesystem
    pub fn render(&self, domain: &DomainRecord) -> Result<ArtifactSet> {
        let vars = TemplateVars::for_domain(domain, Self::ssl_paths(domain)?);

        let template = TemplateName::frontend_for(domain.backend, domain.ssl_enabled);
        let rendered = self.resolver.render(template, &vars)?;
        let frontend = Artifact {
            template,
            path: self.activator.frontend_path(&domain.name),
            contents: apply_cache_policy(rendered, self.inspector.as_ref()),
        };

        let secondary = if domain.backend.is_proxied() {
            Some(Artifact {
                template: TemplateName::Domain,
                path: self.activator.secondary_path(&domain.name),
                contents: self.resolver.render(TemplateName::Domain, &vars)?,
            })
        } else {
            None
        };

        Ok(ArtifactSet {
            domain: domain.name.clone(),
            frontend,
            secondary,
        })
    }

    /// Write and enable a rendered set
    ///
    /// File writes are fatal. Registration commands are advisory and come
    /// back as warnings. A stale secondary artifact from an earlier proxied
    /// configuration is unregistered and deleted.
    pub fn install(&self, set: &ArtifactSet) -> Result<Vec<SiteError>> {
        let mut warnings = Vec::new();

        write_artifact(&set.frontend)?;
        self.activator.activate(&set.domain, &set.frontend.path)?;

        match &set.secondary {
            Some(artifact) => {
                write_artifact(artifact)?;
                if let Err(e) = self.activator.enable_modules() {
                    warn!("Enabling apache modules failed: {}", e);
                    warnings.push(e);
                }
                if let Err(e) = self.activator.register_secondary(&set.domain) {
                    warn!("Registering {} with apache failed: {}", set.domain, e);
                    warnings.push(e);
                }
            }
            None => {
                let stale = self.activator.secondary_path(&set.domain);
                if stale.exists() {
                    warnings.extend(self.remove_secondary(&set.domain)?);
                }
            }
        }

        info!(
            "Installed {} config for {}",
            set.frontend.template, set.domain
        );
        Ok(warnings)
    }

    /// Render then install; nothing is written if rendering fails
    pub fn generate(&self, domain: &DomainRecord) -> Result<Vec<SiteError>> {
        let set = self.render(domain)?;
        self.install(&set)
    }

    /// Delete every artifact of a domain; absent files are fine
    ///
    /// Document roots and certificates are never touched.
    pub fn remove(&self, domain: &DomainRecord) -> Result<Vec<SiteError>> {
        self.activator.deactivate(&domain.name)?;
        remove_if_present(&self.activator.frontend_path(&domain.name))?;

        if domain.backend.is_proxied() || self.activator.secondary_path(&domain.name).exists() {
            return self.remove_secondary(&domain.name);
        }

        Ok(Vec::new())
    }

    fn remove_secondary(&self, domain: &str) -> Result<Vec<SiteError>> {
        let mut warnings = Vec::new();
        if let Err(e) = self.activator.unregister_secondary(domain) {
            warn!("Unregistering {} from apache failed: {}", domain, e);
            warnings.push(e);
        }
        remove_if_present(&self.activator.secondary_path(domain))?;
        Ok(warnings)
    }
}

fn write_artifact(artifact: &Artifact) -> Result<()> {
    if let Some(parent) = artifact.path.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }
    fs::write(&artifact.path, &artifact.contents).at(&artifact.path)
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SiteError::io(path, e)),
    }
}
