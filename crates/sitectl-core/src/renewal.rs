//! Automatic certificate renewal (systemd timer or cron)
//!
//! Exactly one global mechanism runs `certbot renew`: a systemd timer when
//! systemd cooperates, otherwise a crontab line. Domains issued through
//! sitectl also get their own cron-driven script.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use sitectl_cert::AcmeClient;

use crate::command::{CommandRunner, Invocation};
use crate::config::{RenewalSettings, SiteConfig};
use crate::error::{IoResultExt, Result, SiteError};

pub const SERVICE_UNIT: &str = "sitectl-renew.service";
pub const TIMER_UNIT: &str = "sitectl-renew.timer";

/// Substring identifying the global cron line
const CRON_MARKER: &str = "certbot renew";

/// Used when `certbot` is not on PATH at install time
const FALLBACK_CERTBOT: &str = "/usr/bin/certbot";

/// Active global renewal mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingMechanism {
    None,
    TimerBased,
    PeriodicJob,
}

impl fmt::Display for SchedulingMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulingMechanism::None => write!(f, "Not configured"),
            SchedulingMechanism::TimerBased => write!(f, "systemd timer ({}) ✅", TIMER_UNIT),
            SchedulingMechanism::PeriodicJob => write!(f, "cron job ✅"),
        }
    }
}

/// Read-only view of the host's schedulers
#[cfg_attr(test, mockall::automock)]
pub trait SchedulingProbe: Send + Sync {
    fn timer_active(&self) -> bool;

    /// Current user's crontab, empty when there is none
    fn crontab(&self) -> Result<String>;
}

/// Probes through `systemctl` and `crontab -l`
pub struct SystemSchedulingProbe {
    runner: Arc<dyn CommandRunner>,
}

impl SystemSchedulingProbe {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl SchedulingProbe for SystemSchedulingProbe {
    fn timer_active(&self) -> bool {
        let invocation = Invocation::new("systemctl").args(["is-active", "--quiet", TIMER_UNIT]);
        match self.runner.run(&invocation) {
            Ok(output) => output.success(),
            Err(e) => {
                debug!("Cannot query systemd: {}", e);
                false
            }
        }
    }

    fn crontab(&self) -> Result<String> {
        let output = self.runner.run(&Invocation::new("crontab").arg("-l"))?;
        // "no crontab for root" exits non-zero
        if output.success() {
            Ok(output.stdout)
        } else {
            Ok(String::new())
        }
    }
}

fn is_global_renew_line(line: &str) -> bool {
    let line = line.trim();
    !line.starts_with('#') && line.contains(CRON_MARKER)
}

/// Installs, queries and removes renewal jobs
pub struct RenewalScheduler {
    settings: RenewalSettings,
    acme: AcmeClient,
    services: [String; 2],
    probe: Arc<dyn SchedulingProbe>,
    runner: Arc<dyn CommandRunner>,
}

impl RenewalScheduler {
    pub fn new(
        config: &SiteConfig,
        acme: AcmeClient,
        probe: Arc<dyn SchedulingProbe>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            settings: config.renewal.clone(),
            acme,
            services: [config.nginx.service.clone(), config.apache.service.clone()],
            probe,
            runner,
        }
    }

    /// Servers are stopped while certbot's standalone listener owns port 80
    pub fn pre_hook(&self) -> String {
        format!("systemctl stop {}", self.services.join(" "))
    }

    pub fn post_hook(&self) -> String {
        format!("systemctl start {}", self.services.join(" "))
    }

    fn certbot_path(&self) -> PathBuf {
        which::which(self.acme.program()).unwrap_or_else(|_| PathBuf::from(FALLBACK_CERTBOT))
    }

    fn renew_command(&self, certbot: &Path, cert_name: Option<&str>) -> String {
        let mut command = format!("{} renew", certbot.display());
        if let Some(name) = cert_name {
            command.push_str(&format!(" --cert-name {}", name));
        }
        format!(
            "{} --quiet --pre-hook \"{}\" --post-hook \"{}\"",
            command,
            self.pre_hook(),
            self.post_hook()
        )
    }

    pub fn service_unit_path(&self) -> PathBuf {
        self.settings.systemd_dir.join(SERVICE_UNIT)
    }

    pub fn timer_unit_path(&self) -> PathBuf {
        self.settings.systemd_dir.join(TIMER_UNIT)
    }

    /// `{bin_dir}/sitectl-renew-{domain}.sh`
    pub fn domain_script_path(&self, domain: &str) -> PathBuf {
        self.settings
            .bin_dir
            .join(format!("sitectl-renew-{}.sh", domain))
    }

    /// Timer first, then cron
    pub fn status(&self) -> Result<SchedulingMechanism> {
        if self.probe.timer_active() {
            return Ok(SchedulingMechanism::TimerBased);
        }

        // No readable crontab means no cron job, not a failed query
        let table = match self.probe.crontab() {
            Ok(table) => table,
            Err(e) => {
                debug!("Cannot read crontab: {}", e);
                String::new()
            }
        };
        if table.lines().any(is_global_renew_line) {
            return Ok(SchedulingMechanism::PeriodicJob);
        }

        Ok(SchedulingMechanism::None)
    }

    /// Install a mechanism unless one is already active
    pub fn enable(&self) -> Result<SchedulingMechanism> {
        let current = self.status()?;
        if current != SchedulingMechanism::None {
            info!("Renewal already scheduled via {:?}", current);
            return Ok(current);
        }

        match self.install_timer() {
            Ok(()) => {
                info!("Installed {}", TIMER_UNIT);
                Ok(SchedulingMechanism::TimerBased)
            }
            Err(timer_err) => {
                warn!("systemd timer unavailable ({}), falling back to cron", timer_err);
                self.remove_timer_files();

                self.install_cron_line().map_err(|cron_err| {
                    SiteError::tool(
                        "renewal scheduling",
                        format!("systemd timer: {}; cron: {}", timer_err, cron_err),
                    )
                })?;

                info!("Installed renewal cron job");
                Ok(SchedulingMechanism::PeriodicJob)
            }
        }
    }

    /// Remove the active mechanism, returning what was removed
    pub fn disable(&self) -> Result<SchedulingMechanism> {
        match self.status()? {
            SchedulingMechanism::TimerBased => {
                for action in ["stop", "disable"] {
                    self.systemctl(&[action, TIMER_UNIT])?;
                }
                for path in [self.timer_unit_path(), self.service_unit_path()] {
                    remove_if_present(&path)?;
                }
                self.systemctl(&["daemon-reload"])?;
                info!("Removed {}", TIMER_UNIT);
                Ok(SchedulingMechanism::TimerBased)
            }
            SchedulingMechanism::PeriodicJob => {
                let table = self.probe.crontab()?;
                let kept: Vec<&str> = table.lines().filter(|l| !is_global_renew_line(l)).collect();
                self.write_crontab(&kept)?;
                info!("Removed renewal cron job");
                Ok(SchedulingMechanism::PeriodicJob)
            }
            SchedulingMechanism::None => Ok(SchedulingMechanism::None),
        }
    }

    /// Run `certbot renew` once with output on the terminal
    pub fn trigger(&self, cert_name: Option<&str>, dry_run: bool) -> Result<()> {
        let args = self
            .acme
            .renew_args(cert_name, dry_run, &self.pre_hook(), &self.post_hook())?;
        let invocation = Invocation::new(self.acme.program()).args(args);

        self.runner.stream(&invocation)?.check(&invocation)?;
        Ok(())
    }

    /// Install the per-domain script and its cron line
    ///
    /// Returns `false` when the cron line was already present.
    pub fn setup_domain_renewal(&self, domain: &str) -> Result<bool> {
        let script = self.domain_script_path(domain);
        self.write_domain_script(domain, &script)?;

        let script_str = script.display().to_string();
        let table = self.probe.crontab()?;
        if table.lines().any(|l| l.contains(&script_str)) {
            debug!("Renewal job for {} already installed", domain);
            return Ok(false);
        }

        let line = format!(
            "30 2 * * * {} >> {} 2>&1",
            script_str,
            self.settings.log_file.display()
        );
        let mut lines: Vec<&str> = table.lines().collect();
        lines.push(&line);
        self.write_crontab(&lines)?;

        info!("Installed renewal job for {}", domain);
        Ok(true)
    }

    /// Remove the per-domain cron line and script
    ///
    /// Returns `false` when neither existed.
    pub fn remove_domain_renewal(&self, domain: &str) -> Result<bool> {
        let script = self.domain_script_path(domain);
        let script_str = script.display().to_string();

        let table = self.probe.crontab()?;
        let kept: Vec<&str> = table.lines().filter(|l| !l.contains(&script_str)).collect();
        let had_line = kept.len() != table.lines().count();
        if had_line {
            self.write_crontab(&kept)?;
        }

        let had_script = script.exists();
        remove_if_present(&script)?;

        if had_line || had_script {
            info!("Removed renewal job for {}", domain);
        }
        Ok(had_line || had_script)
    }

    fn install_timer(&self) -> Result<()> {
        let certbot = self.certbot_path();
        fs::create_dir_all(&self.settings.systemd_dir).at(&self.settings.systemd_dir)?;

        let service = self.service_unit_path();
        fs::write(&service, self.service_unit(&certbot)).at(&service)?;
        let timer = self.timer_unit_path();
        fs::write(&timer, Self::timer_unit()).at(&timer)?;

        self.systemctl(&["daemon-reload"])?;
        self.systemctl(&["enable", "--now", TIMER_UNIT])
    }

    fn remove_timer_files(&self) {
        for path in [self.timer_unit_path(), self.service_unit_path()] {
            if let Err(e) = remove_if_present(&path) {
                debug!("Cleanup of {} failed: {}", path.display(), e);
            }
        }
        if let Err(e) = self.systemctl(&["daemon-reload"]) {
            debug!("daemon-reload after cleanup failed: {}", e);
        }
    }

    fn install_cron_line(&self) -> Result<()> {
        let table = self.probe.crontab()?;
        let line = format!("0 3 * * * {}", self.renew_command(&self.certbot_path(), None));

        let mut lines: Vec<&str> = table.lines().collect();
        lines.push(&line);
        self.write_crontab(&lines)
    }

    fn service_unit(&self, certbot: &Path) -> String {
        format!(
            r#"[Unit]
Description=Renew sitectl certificates
After=network-online.target
Wants=network-online.target

[Service]
Type=oneshot
ExecStart={command}
"#,
            command = self.renew_command(certbot, None),
        )
    }

    fn timer_unit() -> String {
        r#"[Unit]
Description=Run sitectl certificate renewal twice daily

[Timer]
OnCalendar=*-*-* 00,12:00:00
RandomizedDelaySec=1h
Persistent=true

[Install]
WantedBy=timers.target
"#
        .to_string()
    }

    fn write_domain_script(&self, domain: &str, script: &Path) -> Result<()> {
        fs::create_dir_all(&self.settings.bin_dir).at(&self.settings.bin_dir)?;

        let content = format!(
            "#!/bin/sh\n# Renews the certificate for {domain}\nexec {command}\n",
            domain = domain,
            command = self.renew_command(&self.certbot_path(), Some(domain)),
        );
        fs::write(script, content).at(script)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(script, fs::Permissions::from_mode(0o755)).at(script)?;
        }

        Ok(())
    }

    fn write_crontab(&self, lines: &[&str]) -> Result<()> {
        let mut table = lines.join("\n");
        if !table.is_empty() {
            table.push('\n');
        }

        let invocation = Invocation::new("crontab").arg("-").stdin(table);
        self.runner.run(&invocation)?.check(&invocation)?;
        Ok(())
    }

    fn systemctl(&self, args: &[&str]) -> Result<()> {
        let invocation = Invocation::new("systemctl").args(args.iter().copied());
        self.runner.run(&invocation)?.check(&invocation)?;
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SiteError::io(path, e)),
    }
}
