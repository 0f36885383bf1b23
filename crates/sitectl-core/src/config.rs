//! Host configuration
//!
//! Every path the engine touches lives in [`SiteConfig`]. The file is JSON,
//! every field optional, searched in `/etc/sitectl/config.json` and then the
//! user config directory unless an explicit path is given.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::error::{IoResultExt, Result, SiteError};

/// System-wide configuration file
pub const SYSTEM_CONFIG_PATH: &str = "/etc/sitectl/config.json";

/// Paths and settings for one host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Holds `domains.json` and `certificates.json`
    pub data_dir: PathBuf,
    /// Parent of every `{domain}/public_html`
    pub web_root: PathBuf,
    /// Self-signed certificate directory
    pub ssl_dir: PathBuf,
    /// Extra template roots, searched before the built-in ones
    pub template_dirs: Vec<PathBuf>,
    /// Also search the built-in template roots
    pub builtin_templates: bool,
    pub nginx: NginxSettings,
    pub apache: ApacheSettings,
    pub acme: AcmeSettings,
    pub renewal: RenewalSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NginxSettings {
    pub sites_available: PathBuf,
    pub sites_enabled: PathBuf,
    /// Global config probed for cache zones
    pub main_config: PathBuf,
    pub binary: String,
    pub service: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApacheSettings {
    pub sites_available: PathBuf,
    pub ctl: String,
    pub service: String,
    /// Enabled with `a2enmod` before the first proxied site
    pub modules: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcmeSettings {
    pub certbot_bin: String,
    pub live_dir: PathBuf,
    pub staging: bool,
    /// Used when `ssl enable --email` is omitted
    pub default_email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenewalSettings {
    pub systemd_dir: PathBuf,
    pub bin_dir: PathBuf,
    pub log_file: PathBuf,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/sitectl"),
            web_root: PathBuf::from("/var/www"),
            ssl_dir: PathBuf::from("/etc/ssl/sitectl"),
            template_dirs: Vec::new(),
            builtin_templates: true,
            nginx: NginxSettings::default(),
            apache: ApacheSettings::default(),
            acme: AcmeSettings::default(),
            renewal: RenewalSettings::default(),
        }
    }
}

impl Default for NginxSettings {
    fn default() -> Self {
        Self {
            sites_available: PathBuf::from("/etc/nginx/sites-available"),
            sites_enabled: PathBuf::from("/etc/nginx/sites-enabled"),
            main_config: PathBuf::from("/etc/nginx/nginx.conf"),
            binary: "nginx".to_string(),
            service: "nginx".to_string(),
        }
    }
}

impl Default for ApacheSettings {
    fn default() -> Self {
        Self {
            sites_available: PathBuf::from("/etc/apache2/sites-available"),
            ctl: "apache2ctl".to_string(),
            service: "apache2".to_string(),
            modules: ["proxy", "proxy_fcgi", "headers", "remoteip"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
        }
    }
}

impl Default for AcmeSettings {
    fn default() -> Self {
        Self {
            certbot_bin: "certbot".to_string(),
            live_dir: PathBuf::from("/etc/letsencrypt/live"),
            staging: false,
            default_email: None,
        }
    }
}

impl Default for RenewalSettings {
    fn default() -> Self {
        Self {
            systemd_dir: PathBuf::from("/etc/systemd/system"),
            bin_dir: PathBuf::from("/usr/local/bin"),
            log_file: PathBuf::from("/var/log/sitectl-renew.log"),
        }
    }
}

impl SiteConfig {
    pub fn domains_file(&self) -> PathBuf {
        self.data_dir.join("domains.json")
    }

    pub fn certificates_file(&self) -> PathBuf {
        self.data_dir.join("certificates.json")
    }

    /// Re-base every filesystem path under `root`
    ///
    /// `/etc/nginx/sites-available` becomes `{root}/etc/nginx/sites-available`.
    /// Program names are left alone.
    pub fn rooted(&self, root: &Path) -> Self {
        let rebase = |path: &Path| -> PathBuf {
            let relative: PathBuf = path
                .components()
                .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
                .collect();
            root.join(relative)
        };

        let mut config = self.clone();
        config.data_dir = rebase(&self.data_dir);
        config.web_root = rebase(&self.web_root);
        config.ssl_dir = rebase(&self.ssl_dir);
        config.template_dirs = self.template_dirs.iter().map(|p| rebase(p)).collect();
        config.nginx.sites_available = rebase(&self.nginx.sites_available);
        config.nginx.sites_enabled = rebase(&self.nginx.sites_enabled);
        config.nginx.main_config = rebase(&self.nginx.main_config);
        config.apache.sites_available = rebase(&self.apache.sites_available);
        config.acme.live_dir = rebase(&self.acme.live_dir);
        config.renewal.systemd_dir = rebase(&self.renewal.systemd_dir);
        config.renewal.bin_dir = rebase(&self.renewal.bin_dir);
        config.renewal.log_file = rebase(&self.renewal.log_file);
        config
    }
}

/// Configuration manager
pub struct ConfigManager;

impl ConfigManager {
    /// Per-user config file, if the platform has a config directory
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("sitectl").join("config.json"))
    }

    /// Where `config init` writes when no path is given
    pub fn default_path() -> PathBuf {
        PathBuf::from(SYSTEM_CONFIG_PATH)
    }

    /// Resolve which file to read
    ///
    /// An explicit path must exist. Otherwise the first existing of the
    /// system and user files wins; `None` means built-in defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(SiteError::NotFound(format!(
                    "config file {}",
                    path.display()
                )));
            }
            return Ok(Some(path.to_path_buf()));
        }

        let candidates = std::iter::once(Self::default_path()).chain(Self::user_config_path());
        for candidate in candidates {
            if candidate.exists() {
                return Ok(Some(candidate));
            }
        }

        Ok(None)
    }

    /// Load the effective configuration and the file it came from
    pub fn load(explicit: Option<&Path>) -> Result<(SiteConfig, Option<PathBuf>)> {
        match Self::discover(explicit)? {
            Some(path) => Ok((Self::load_from(&path)?, Some(path))),
            None => {
                debug!("No config file found, using defaults");
                Ok((SiteConfig::default(), None))
            }
        }
    }

    /// Load the configuration from a specific file
    pub fn load_from(path: &Path) -> Result<SiteConfig> {
        let json = fs::read_to_string(path).at(path)?;
        let config: SiteConfig = serde_json::from_str(&json)?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Save the configuration to disk
    pub fn save_to(config: &SiteConfig, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).at(parent)?;
            }
        }

        let mut json = serde_json::to_string_pretty(config)?;
        json.push('\n');
        fs::write(path, json).at(path)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = SiteConfig::default();
        assert_eq!(config.domains_file(), PathBuf::from("/var/lib/sitectl/domains.json"));
        assert_eq!(config.nginx.service, "nginx");
        assert_eq!(config.apache.modules, vec!["proxy", "proxy_fcgi", "headers", "remoteip"]);
        assert!(config.builtin_templates);
        assert!(config.acme.default_email.is_none());
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: SiteConfig = serde_json::from_str(
            r#"{"web_root": "/srv/www", "acme": {"staging": true}, "unknown": 1}"#,
        )
        .unwrap();

        assert_eq!(config.web_root, PathBuf::from("/srv/www"));
        assert!(config.acme.staging);
        assert_eq!(config.acme.certbot_bin, "certbot");
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/sitectl"));
    }

    #[test]
    fn test_rooted_rebases_paths() {
        let config = SiteConfig::default().rooted(Path::new("/tmp/stage"));

        assert_eq!(
            config.nginx.sites_available,
            PathBuf::from("/tmp/stage/etc/nginx/sites-available")
        );
        assert_eq!(config.web_root, PathBuf::from("/tmp/stage/var/www"));
        assert_eq!(
            config.renewal.log_file,
            PathBuf::from("/tmp/stage/var/log/sitectl-renew.log")
        );
        assert_eq!(config.nginx.binary, "nginx");
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("etc").join("config.json");

        let mut config = SiteConfig::default();
        config.acme.default_email = Some("ops@example.com".to_string());
        ConfigManager::save_to(&config, &path).unwrap();

        let (loaded, source) = ConfigManager::load(Some(&path)).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(source, Some(path));
    }

    #[test]
    fn test_explicit_missing_config_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("missing.json");

        assert!(matches!(
            ConfigManager::discover(Some(&path)),
            Err(SiteError::NotFound(_))
        ));
    }
}
