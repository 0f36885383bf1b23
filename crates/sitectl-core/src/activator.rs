//! Site enablement and server control
//!
//! nginx sites are enabled with a symlink from `sites-enabled` into
//! `sites-available`; apache sites go through `a2ensite`/`a2dissite`.
//! Reloads run the server's own config test first and skip the reload when
//! it fails, so the running process keeps its last good config.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::command::{CommandRunner, Invocation};
use crate::config::{ApacheSettings, NginxSettings, SiteConfig};
use crate::error::{IoResultExt, Result, SiteError};
use crate::templates::ServerKind;

pub struct BackendActivator {
    nginx: NginxSettings,
    apache: ApacheSettings,
    runner: Arc<dyn CommandRunner>,
}

impl BackendActivator {
    pub fn new(config: &SiteConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            nginx: config.nginx.clone(),
            apache: config.apache.clone(),
            runner,
        }
    }

    fn conf_name(domain: &str) -> String {
        format!("{}.conf", domain)
    }

    /// `{sites-available}/{domain}.conf` for nginx
    pub fn frontend_path(&self, domain: &str) -> PathBuf {
        self.nginx.sites_available.join(Self::conf_name(domain))
    }

    /// `{sites-enabled}/{domain}.conf` for nginx
    pub fn frontend_link(&self, domain: &str) -> PathBuf {
        self.nginx.sites_enabled.join(Self::conf_name(domain))
    }

    /// `{sites-available}/{domain}.conf` for apache
    pub fn secondary_path(&self, domain: &str) -> PathBuf {
        self.apache.sites_available.join(Self::conf_name(domain))
    }

    /// Point the enabled link at `artifact`, replacing whatever is there
    pub fn activate(&self, domain: &str, artifact: &Path) -> Result<()> {
        let link = self.frontend_link(domain);
        fs::create_dir_all(&self.nginx.sites_enabled).at(&self.nginx.sites_enabled)?;

        if fs::symlink_metadata(&link).is_ok() {
            fs::remove_file(&link).at(&link)?;
        }

        #[cfg(unix)]
        std::os::unix::fs::symlink(artifact, &link).at(&link)?;
        #[cfg(not(unix))]
        fs::copy(artifact, &link).map(|_| ()).at(&link)?;

        debug!("Linked {} -> {}", link.display(), artifact.display());
        Ok(())
    }

    /// Remove the enabled link; absence is fine
    pub fn deactivate(&self, domain: &str) -> Result<()> {
        let link = self.frontend_link(domain);
        match fs::remove_file(&link) {
            Ok(()) => {
                debug!("Removed {}", link.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SiteError::io(&link, e)),
        }
    }

    pub fn is_active(&self, domain: &str) -> bool {
        fs::symlink_metadata(self.frontend_link(domain)).is_ok()
    }

    fn run_checked(&self, invocation: Invocation) -> Result<()> {
        self.runner.run(&invocation)?.check(&invocation)?;
        Ok(())
    }

    /// `a2ensite {domain}.conf`
    pub fn register_secondary(&self, domain: &str) -> Result<()> {
        self.run_checked(Invocation::new("a2ensite").arg(Self::conf_name(domain)))
    }

    /// `a2dissite {domain}.conf`
    pub fn unregister_secondary(&self, domain: &str) -> Result<()> {
        self.run_checked(Invocation::new("a2dissite").arg(Self::conf_name(domain)))
    }

    /// Modules apache needs to sit behind nginx and reach PHP-FPM
    ///
    /// `a2enmod` is idempotent, so this runs before every registration.
    pub fn enable_modules(&self) -> Result<()> {
        if self.apache.modules.is_empty() {
            return Ok(());
        }
        self.run_checked(
            Invocation::new("a2enmod")
                .arg("-q")
                .args(self.apache.modules.iter().cloned()),
        )
    }

    fn service(&self, kind: ServerKind) -> &str {
        match kind {
            ServerKind::Frontend => &self.nginx.service,
            ServerKind::Secondary => &self.apache.service,
        }
    }

    fn config_test(&self, kind: ServerKind) -> Invocation {
        match kind {
            ServerKind::Frontend => Invocation::new(self.nginx.binary.clone()).arg("-t"),
            ServerKind::Secondary => Invocation::new(self.apache.ctl.clone()).arg("configtest"),
        }
    }

    /// Config test, then graceful reload
    pub fn reload(&self, kind: ServerKind) -> Result<()> {
        self.run_checked(self.config_test(kind))?;
        self.run_checked(Invocation::new("systemctl").args(["reload", self.service(kind)]))?;
        info!("Reloaded {}", self.service(kind));
        Ok(())
    }

    /// Reload both servers, returning every failure
    pub fn reload_all(&self) -> Vec<SiteError> {
        [ServerKind::Frontend, ServerKind::Secondary]
            .into_iter()
            .filter_map(|kind| self.reload(kind).err())
            .inspect(|e| warn!("Reload failed: {}", e))
            .collect()
    }

    pub fn stop(&self, kind: ServerKind) -> Result<()> {
        self.run_checked(Invocation::new("systemctl").args(["stop", self.service(kind)]))
    }

    pub fn start(&self, kind: ServerKind) -> Result<()> {
        self.run_checked(Invocation::new("systemctl").args(["start", self.service(kind)]))
    }
}
