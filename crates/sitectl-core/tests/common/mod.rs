#![allow(dead_code)]

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sitectl_core::dns::DnsResolver;
use sitectl_core::{
    CommandOutput, CommandRunner, HostContext, Invocation, SiteConfig, SiteError,
};
use tempfile::TempDir;

/// The template tree shipped with the repository
pub const TEMPLATES: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../../templates");

#[derive(Default)]
struct FakeState {
    calls: Vec<Invocation>,
    crontab: String,
    timer_active: bool,
    failing: Vec<Vec<String>>,
    missing: Vec<String>,
}

/// Records every invocation and simulates systemd, crontab and certbot
#[derive(Default)]
pub struct FakeRunner {
    state: Mutex<FakeState>,
    live_dir: Option<PathBuf>,
}

impl FakeRunner {
    pub fn with_live_dir(live_dir: PathBuf) -> Self {
        Self {
            live_dir: Some(live_dir),
            ..Self::default()
        }
    }

    /// Make invocations starting with `prefix` exit with status 1
    pub fn fail(&self, prefix: &[&str]) {
        self.state
            .lock()
            .unwrap()
            .failing
            .push(prefix.iter().map(|s| s.to_string()).collect());
    }

    /// Make `program` fail to launch, as if it were not installed
    pub fn missing(&self, program: &str) {
        self.state.lock().unwrap().missing.push(program.to_string());
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn count(&self, prefix: &[&str]) -> usize {
        self.calls().iter().filter(|i| i.starts_with(prefix)).count()
    }

    /// Position of the first call matching `prefix`
    pub fn position(&self, prefix: &[&str]) -> Option<usize> {
        self.calls().iter().position(|i| i.starts_with(prefix))
    }

    pub fn crontab(&self) -> String {
        self.state.lock().unwrap().crontab.clone()
    }

    pub fn timer_active(&self) -> bool {
        self.state.lock().unwrap().timer_active
    }

    fn is_failing(state: &FakeState, invocation: &Invocation) -> bool {
        state.failing.iter().any(|prefix| {
            let prefix: Vec<&str> = prefix.iter().map(String::as_str).collect();
            invocation.starts_with(&prefix)
        })
    }

    fn issue(&self, invocation: &Invocation) {
        let Some(live_dir) = &self.live_dir else {
            return;
        };
        let Some(domain) = invocation
            .args
            .windows(2)
            .find(|w| w[0] == "-d")
            .map(|w| w[1].clone())
        else {
            return;
        };

        let cert = sitectl_cert::generate_self_signed_cert(&domain, 90).unwrap();
        cert.save_to_files(
            &live_dir.join(&domain).join("fullchain.pem"),
            &live_dir.join(&domain).join("privkey.pem"),
        )
        .unwrap();
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, invocation: &Invocation) -> sitectl_core::Result<CommandOutput> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(invocation.clone());

        if state.missing.contains(&invocation.program) {
            return Err(SiteError::tool(
                invocation.program.clone(),
                "No such file or directory (os error 2)",
            ));
        }
        if Self::is_failing(&state, invocation) {
            return Ok(CommandOutput::failed(1, "simulated failure"));
        }

        if invocation.starts_with(&["systemctl", "is-active"]) {
            return Ok(if state.timer_active {
                CommandOutput::ok("")
            } else {
                CommandOutput::failed(3, "")
            });
        }
        if invocation.starts_with(&["systemctl", "enable", "--now"]) {
            state.timer_active = true;
        }
        if invocation.starts_with(&["systemctl", "stop", "sitectl-renew.timer"]) {
            state.timer_active = false;
        }
        if invocation.starts_with(&["crontab", "-l"]) {
            return Ok(if state.crontab.is_empty() {
                CommandOutput::failed(1, "no crontab for root")
            } else {
                CommandOutput::ok(state.crontab.clone())
            });
        }
        if invocation.starts_with(&["crontab", "-"]) {
            state.crontab = invocation.stdin.clone().unwrap_or_default();
        }

        Ok(CommandOutput::ok(""))
    }

    fn stream(&self, invocation: &Invocation) -> sitectl_core::Result<CommandOutput> {
        {
            let mut state = self.state.lock().unwrap();
            state.calls.push(invocation.clone());
            if Self::is_failing(&state, invocation) {
                return Ok(CommandOutput::failed(1, ""));
            }
        }

        if invocation.args.first().map(String::as_str) == Some("certonly") {
            self.issue(invocation);
        }
        Ok(CommandOutput::ok(""))
    }
}

/// Resolves every name to one documentation address, or fails
pub struct StaticDns(pub bool);

impl DnsResolver for StaticDns {
    fn lookup(&self, _domain: &str) -> Result<Vec<IpAddr>, String> {
        if self.0 {
            Ok(vec!["203.0.113.7".parse().unwrap()])
        } else {
            Err("NXDOMAIN".to_string())
        }
    }
}

pub struct TestHost {
    pub dir: TempDir,
    pub config: SiteConfig,
    pub runner: Arc<FakeRunner>,
    pub ctx: HostContext,
}

impl TestHost {
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn frontend(&self, domain: &str) -> PathBuf {
        self.config
            .nginx
            .sites_available
            .join(format!("{}.conf", domain))
    }

    pub fn frontend_link(&self, domain: &str) -> PathBuf {
        self.config.nginx.sites_enabled.join(format!("{}.conf", domain))
    }

    pub fn secondary(&self, domain: &str) -> PathBuf {
        self.config
            .apache
            .sites_available
            .join(format!("{}.conf", domain))
    }

    pub fn read_frontend(&self, domain: &str) -> String {
        fs::read_to_string(self.frontend(domain)).unwrap()
    }
}

pub struct HostBuilder {
    templates: PathBuf,
    cache_zone: bool,
    dns_ok: bool,
    fake_certbot: bool,
}

impl HostBuilder {
    pub fn new() -> Self {
        Self {
            templates: PathBuf::from(TEMPLATES),
            cache_zone: false,
            dns_ok: true,
            fake_certbot: false,
        }
    }

    pub fn templates(mut self, dir: &Path) -> Self {
        self.templates = dir.to_path_buf();
        self
    }

    pub fn cache_zone(mut self, declared: bool) -> Self {
        self.cache_zone = declared;
        self
    }

    pub fn dns(mut self, resolves: bool) -> Self {
        self.dns_ok = resolves;
        self
    }

    /// Point `acme.certbot_bin` at an executable stub
    pub fn fake_certbot(mut self) -> Self {
        self.fake_certbot = true;
        self
    }

    pub fn build(self) -> TestHost {
        let dir = TempDir::new().unwrap();
        let mut config = SiteConfig::default().rooted(dir.path());
        config.builtin_templates = false;
        config.template_dirs = vec![self.templates];

        let main_config = &config.nginx.main_config;
        fs::create_dir_all(main_config.parent().unwrap()).unwrap();
        let zone = if self.cache_zone {
            "    proxy_cache_path /var/cache/nginx levels=1:2 keys_zone=proxycache:10m;\n"
        } else {
            ""
        };
        fs::write(main_config, format!("http {{\n{}    include sites-enabled/*;\n}}\n", zone)).unwrap();

        if self.fake_certbot {
            config.acme.certbot_bin = write_stub_certbot(dir.path()).display().to_string();
        }

        let runner = Arc::new(FakeRunner::with_live_dir(config.acme.live_dir.clone()));
        let ctx = HostContext::new(config.clone(), runner.clone())
            .with_dns(Arc::new(StaticDns(self.dns_ok)));

        TestHost {
            dir,
            config,
            runner,
            ctx,
        }
    }
}

fn write_stub_certbot(root: &Path) -> PathBuf {
    let path = root.join("bin").join("certbot");
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    path
}
