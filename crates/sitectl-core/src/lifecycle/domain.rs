use std::fs;
use std::path::Path;
use tracing::{debug, info};

use super::{HostContext, Outcome, Warnings};
use crate::error::{IoResultExt, Result, SiteError};
use crate::models::{normalize_domain, Backend, CertificateRecord, DomainRecord, PhpVersion};

/// Files that count as an existing landing page
const INDEX_FILES: [&str; 3] = ["index.php", "index.html", "index.htm"];

#[derive(Debug, Clone)]
pub struct AddDomain {
    pub name: String,
    pub backend: Backend,
    pub php_version: PhpVersion,
}

/// Fields left as `None` keep their current value
#[derive(Debug, Clone, Default)]
pub struct EditDomain {
    pub backend: Option<Backend>,
    pub php_version: Option<PhpVersion>,
}

/// A domain joined with its certificate record, if any
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainDetails {
    pub domain: DomainRecord,
    pub certificate: Option<CertificateRecord>,
    pub active: bool,
}

pub struct DomainManager<'a> {
    ctx: &'a HostContext,
}

impl<'a> DomainManager<'a> {
    pub fn new(ctx: &'a HostContext) -> Self {
        Self { ctx }
    }

    pub fn add(&self, request: AddDomain) -> Result<Outcome<DomainRecord>> {
        let name = normalize_domain(&request.name)?;
        let domains = self.ctx.domains();
        if domains.contains(&name)? {
            return Err(SiteError::Validation(format!("domain {} already exists", name)));
        }

        let record = DomainRecord::new(
            &name,
            request.backend,
            request.php_version,
            &self.ctx.config().web_root,
        );
        let set = self.ctx.generator().render(&record)?;

        seed_document_root(&record.document_root, &name)?;

        domains.update(|records| {
            if records.iter().any(|r| r.name == name) {
                return Err(SiteError::Validation(format!("domain {} already exists", name)));
            }
            records.push(record.clone());
            Ok(())
        })?;
        info!("Added {} ({}, PHP {})", name, record.backend, record.php_version);

        let mut warnings = Warnings::default();
        self.ctx.install_and_reload(&set, &mut warnings)?;
        Ok(warnings.finish(record))
    }

    pub fn edit(&self, name: &str, changes: EditDomain) -> Result<Outcome<DomainRecord>> {
        let name = normalize_domain(name)?;
        let domains = self.ctx.domains();
        let mut record = domains.find(&name)?;

        if let Some(backend) = changes.backend {
            record.backend = backend;
        }
        if let Some(php_version) = changes.php_version {
            record.php_version = php_version;
        }

        let set = self.ctx.generator().render(&record)?;
        domains.upsert(record.clone())?;
        info!("Updated {} ({}, PHP {})", name, record.backend, record.php_version);

        let mut warnings = Warnings::default();
        self.ctx.install_and_reload(&set, &mut warnings)?;
        Ok(warnings.finish(record))
    }

    /// Remove a domain's artifacts and record; the document root stays
    pub fn delete(&self, name: &str) -> Result<Outcome<DomainRecord>> {
        let name = normalize_domain(name)?;
        let domains = self.ctx.domains();
        let record = domains.find(&name)?;

        let mut warnings = Warnings::default();
        warnings.extend(name.as_str(), self.ctx.generator().remove(&record)?);
        domains.remove(&name)?;
        info!("Deleted {}", name);

        if let Err(e) = self.ctx.scheduler().remove_domain_renewal(&name) {
            warnings.push(format!("removing renewal job for {}", name), e);
        }

        let disabled = self.ctx.certificates().update(|certs| {
            Ok(certs
                .iter_mut()
                .find(|c| c.domain == name)
                .map(|c| c.enabled = false)
                .is_some())
        });
        match disabled {
            Ok(true) => debug!("Disabled certificate record for {}", name),
            Ok(false) => {}
            Err(e) => warnings.push(format!("disabling certificate of {}", name), e),
        }

        self.ctx.reload(&mut warnings);
        Ok(warnings.finish(record))
    }

    /// Every domain, sorted by name
    pub fn list(&self) -> Result<Vec<DomainRecord>> {
        let mut records = self.ctx.domains().load()?;
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    pub fn show(&self, name: &str) -> Result<DomainDetails> {
        let name = normalize_domain(name)?;
        let domain = self.ctx.domains().find(&name)?;
        let certificate = self.ctx.certificates().get(&name)?;
        let active = self.ctx.activator().is_active(&name);

        Ok(DomainDetails {
            domain,
            certificate,
            active,
        })
    }

    /// Regenerate every domain's artifacts, then reload once
    ///
    /// A domain that fails to render or install is reported and skipped.
    /// The value is the number of domains regenerated.
    pub fn rebuild(&self) -> Result<Outcome<usize>> {
        let generator = self.ctx.generator();
        let mut warnings = Warnings::default();
        let mut rebuilt = 0;

        for record in self.list()? {
            match generator.generate(&record) {
                Ok(errors) => {
                    warnings.extend(record.name.as_str(), errors);
                    rebuilt += 1;
                }
                Err(e) => warnings.push(format!("rebuilding {}", record.name), e),
            }
        }

        info!("Rebuilt {} domain configs", rebuilt);
        self.ctx.reload(&mut warnings);
        Ok(warnings.finish(rebuilt))
    }
}

/// Create the document root and a landing page unless one exists
fn seed_document_root(document_root: &Path, domain: &str) -> Result<()> {
    fs::create_dir_all(document_root).at(document_root)?;

    if INDEX_FILES.iter().any(|f| document_root.join(f).exists()) {
        return Ok(());
    }

    let index = document_root.join("index.php");
    let page = format!(
        "<?php\n// Landing page created by sitectl\n?>\n<!DOCTYPE html>\n<html>\n<head><title>{domain}</title></head>\n<body>\n<h1>{domain}</h1>\n<p>Served with PHP <?= PHP_VERSION ?></p>\n</body>\n</html>\n",
        domain = domain
    );
    fs::write(&index, page).at(&index)?;
    debug!("Seeded {}", index.display());
    Ok(())
}
