//! Lifecycle orchestration
//!
//! Orchestrators validate and render first, persist second, then install
//! artifacts and reload. Failed reloads and site registrations after the
//! records are saved are reported as warnings instead of undoing the change;
//! a config file that cannot be written is still an error.

mod domain;
mod ssl;

pub use domain::{AddDomain, DomainDetails, DomainManager, EditDomain};
pub use ssl::{EnableSsl, SslManager, SslStatus};

use std::fmt;
use std::sync::Arc;
use tracing::warn;

use sitectl_cert::{AcmeClient, AcmeConfig};

use crate::activator::BackendActivator;
use crate::command::{CommandRunner, SystemRunner};
use crate::config::SiteConfig;
use crate::dns::{DnsResolver, SystemDnsResolver};
use crate::error::{Result, SiteError};
use crate::generator::{ArtifactSet, ConfigGenerator};
use crate::models::{CertificateRecord, DomainRecord};
use crate::renewal::{RenewalScheduler, SchedulingProbe, SystemSchedulingProbe};
use crate::store::RecordStore;
use crate::templates::{GlobalConfigInspector, NginxConfigInspector, TemplateResolver};

/// Result of an operation plus the advisory failures it tolerated
#[derive(Debug)]
pub struct Outcome<T> {
    pub value: T,
    pub warnings: Vec<String>,
}

impl<T> Outcome<T> {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Accumulates advisory failures during an operation
#[derive(Debug, Default)]
pub(crate) struct Warnings(Vec<String>);

impl Warnings {
    pub(crate) fn push(&mut self, context: impl fmt::Display, error: impl fmt::Display) {
        let message = format!("{}: {}", context, error);
        warn!("{}", message);
        self.0.push(message);
    }

    pub(crate) fn extend(&mut self, context: impl fmt::Display + Copy, errors: Vec<SiteError>) {
        for error in errors {
            self.push(context, error);
        }
    }

    pub(crate) fn finish<T>(self, value: T) -> Outcome<T> {
        Outcome {
            value,
            warnings: self.0,
        }
    }
}

/// Everything an orchestrator needs from the host
pub struct HostContext {
    config: SiteConfig,
    runner: Arc<dyn CommandRunner>,
    inspector: Arc<dyn GlobalConfigInspector>,
    probe: Arc<dyn SchedulingProbe>,
    dns: Arc<dyn DnsResolver>,
}

impl HostContext {
    /// Host capabilities backed by `runner`
    pub fn new(config: SiteConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            inspector: Arc::new(NginxConfigInspector::new(config.nginx.main_config.clone())),
            probe: Arc::new(SystemSchedulingProbe::new(runner.clone())),
            dns: Arc::new(SystemDnsResolver),
            config,
            runner,
        }
    }

    /// Real commands on the real host
    pub fn system(config: SiteConfig) -> Self {
        Self::new(config, Arc::new(SystemRunner))
    }

    pub fn with_inspector(mut self, inspector: Arc<dyn GlobalConfigInspector>) -> Self {
        self.inspector = inspector;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn SchedulingProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_dns(mut self, dns: Arc<dyn DnsResolver>) -> Self {
        self.dns = dns;
        self
    }

    pub fn config(&self) -> &SiteConfig {
        &self.config
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    pub fn dns(&self) -> &dyn DnsResolver {
        self.dns.as_ref()
    }

    pub fn domains(&self) -> RecordStore<DomainRecord> {
        RecordStore::new(self.config.domains_file())
    }

    pub fn certificates(&self) -> RecordStore<CertificateRecord> {
        RecordStore::new(self.config.certificates_file())
    }

    pub fn activator(&self) -> BackendActivator {
        BackendActivator::new(&self.config, self.runner.clone())
    }

    pub fn generator(&self) -> ConfigGenerator {
        ConfigGenerator::new(
            TemplateResolver::from_config(&self.config),
            self.inspector.clone(),
            self.activator(),
        )
    }

    pub fn acme(&self) -> AcmeClient {
        AcmeClient::new(AcmeConfig {
            certbot_bin: self.config.acme.certbot_bin.clone(),
            live_dir: self.config.acme.live_dir.clone(),
            use_staging: self.config.acme.staging,
        })
    }

    pub fn scheduler(&self) -> RenewalScheduler {
        RenewalScheduler::new(
            &self.config,
            self.acme(),
            self.probe.clone(),
            self.runner.clone(),
        )
    }

    /// Install a rendered set, then reload both servers
    ///
    /// A file that cannot be written or linked is an error and skips the
    /// reload. The saved record stays, so `sitectl domain rebuild` can
    /// finish the job once the cause is fixed.
    pub(crate) fn install_and_reload(
        &self,
        set: &ArtifactSet,
        warnings: &mut Warnings,
    ) -> Result<()> {
        let errors = self.generator().install(set)?;
        warnings.extend(set.domain.as_str(), errors);
        self.reload(warnings);
        Ok(())
    }

    pub(crate) fn reload(&self, warnings: &mut Warnings) {
        warnings.extend("reload", self.activator().reload_all());
    }
}
