//! Config templates
//!
//! Templates live under an ordered list of roots, `nginx/<name>.conf` for
//! the frontend and `apache/domain.conf` for the secondary backend. The
//! first root holding the file wins. Rendering is plain `{{NAME}}`
//! substitution.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::SiteConfig;
use crate::error::{Result, SiteError};
use crate::models::{Backend, DomainRecord};

/// Searched after any configured roots, in this order
pub const BUILTIN_TEMPLATE_ROOTS: [&str; 4] = [
    "/usr/share/sitectl/templates",
    "./templates",
    "/opt/sitectl/templates",
    "/etc/sitectl/templates",
];

/// Which server a template configures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerKind {
    /// nginx
    Frontend,
    /// apache2, behind nginx
    Secondary,
}

impl ServerKind {
    fn dir(self) -> &'static str {
        match self {
            ServerKind::Frontend => "nginx",
            ServerKind::Secondary => "apache",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateName {
    Direct,
    DirectSsl,
    Proxy,
    ProxySsl,
    /// Secondary-backend vhost, always plaintext
    Domain,
}

impl TemplateName {
    pub fn as_str(self) -> &'static str {
        match self {
            TemplateName::Direct => "direct",
            TemplateName::DirectSsl => "direct-ssl",
            TemplateName::Proxy => "proxy",
            TemplateName::ProxySsl => "proxy-ssl",
            TemplateName::Domain => "domain",
        }
    }

    pub fn kind(self) -> ServerKind {
        match self {
            TemplateName::Domain => ServerKind::Secondary,
            _ => ServerKind::Frontend,
        }
    }

    pub fn is_ssl(self) -> bool {
        matches!(self, TemplateName::DirectSsl | TemplateName::ProxySsl)
    }

    /// Frontend template for a backend/TLS combination
    pub fn frontend_for(backend: Backend, ssl_enabled: bool) -> Self {
        match (backend.is_proxied(), ssl_enabled) {
            (false, false) => TemplateName::Direct,
            (false, true) => TemplateName::DirectSsl,
            (true, false) => TemplateName::Proxy,
            (true, true) => TemplateName::ProxySsl,
        }
    }

    fn relative_path(self) -> PathBuf {
        Path::new(self.kind().dir()).join(format!("{}.conf", self.as_str()))
    }
}

impl fmt::Display for TemplateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Values substituted into a template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateVars {
    pub domain: String,
    pub document_root: String,
    pub php_version: String,
    pub php_socket: String,
    /// Certificate and key paths, only used by `-ssl` templates
    pub ssl: Option<(String, String)>,
}

impl TemplateVars {
    pub fn for_domain(domain: &DomainRecord, ssl: Option<(&Path, &Path)>) -> Self {
        Self {
            domain: domain.name.clone(),
            document_root: domain.document_root.display().to_string(),
            php_version: domain.php_version.as_str().to_string(),
            php_socket: domain.php_version.socket_path(),
            ssl: ssl.map(|(cert, key)| (cert.display().to_string(), key.display().to_string())),
        }
    }

    fn pairs(&self, with_ssl: bool) -> Vec<(&'static str, &str)> {
        let mut pairs = vec![
            ("{{DOMAIN}}", self.domain.as_str()),
            ("{{DOCUMENT_ROOT}}", self.document_root.as_str()),
            ("{{PHP_VERSION}}", self.php_version.as_str()),
            ("{{PHP_SOCKET}}", self.php_socket.as_str()),
        ];
        if with_ssl {
            if let Some((cert, key)) = &self.ssl {
                pairs.push(("{{SSL_CERT}}", cert.as_str()));
                pairs.push(("{{SSL_KEY}}", key.as_str()));
            }
        }
        pairs
    }
}

/// Finds and renders templates across the search roots
#[derive(Debug, Clone)]
pub struct TemplateResolver {
    roots: Vec<PathBuf>,
}

impl TemplateResolver {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    /// Configured roots first, then the built-in ones if enabled
    pub fn from_config(config: &SiteConfig) -> Self {
        let mut roots = config.template_dirs.clone();
        if config.builtin_templates {
            roots.extend(BUILTIN_TEMPLATE_ROOTS.iter().map(PathBuf::from));
        }
        Self::new(roots)
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Path of the first existing candidate
    pub fn locate(&self, name: TemplateName) -> Result<PathBuf> {
        let relative = name.relative_path();

        for root in &self.roots {
            let candidate = root.join(&relative);
            if candidate.is_file() {
                debug!("Template {} resolved to {}", name, candidate.display());
                return Ok(candidate);
            }
        }

        Err(SiteError::TemplateNotFound {
            name: relative.display().to_string(),
            searched: self
                .roots
                .iter()
                .map(|r| r.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        })
    }

    /// Raw template bytes
    pub fn resolve(&self, kind: ServerKind, name: TemplateName) -> Result<Vec<u8>> {
        if name.kind() != kind {
            return Err(SiteError::Validation(format!(
                "template '{}' does not configure the {:?} server",
                name, kind
            )));
        }

        let path = self.locate(name)?;
        fs::read(&path).map_err(|e| SiteError::io(&path, e))
    }

    /// Resolve and substitute
    pub fn render(&self, name: TemplateName, vars: &TemplateVars) -> Result<String> {
        if name.is_ssl() && vars.ssl.is_none() {
            return Err(SiteError::Validation(format!(
                "template '{}' needs certificate and key paths",
                name
            )));
        }

        let bytes = self.resolve(name.kind(), name)?;
        let template = String::from_utf8(bytes).map_err(|e| SiteError::InvalidTemplate {
            path: name.relative_path(),
            reason: e.to_string(),
        })?;

        let rendered = substitute(&template, &vars.pairs(name.is_ssl()));

        if let Some(placeholder) = leftover_placeholder(&rendered) {
            return Err(SiteError::InvalidTemplate {
                path: name.relative_path(),
                reason: format!("unknown placeholder {}", placeholder),
            });
        }

        Ok(rendered)
    }
}

fn substitute(template: &str, pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .fold(template.to_string(), |acc, &(key, value)| acc.replace(key, value))
}

/// First `{{UPPER_CASE}}` token still present after substitution
fn leftover_placeholder(rendered: &str) -> Option<&str> {
    let mut rest = rendered;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        if let Some(end) = after.find("}}") {
            let inner = &after[..end];
            if !inner.is_empty()
                && inner
                    .chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
            {
                return Some(&rest[start..start + 2 + end + 2]);
            }
        }
        rest = after;
    }
    None
}

/// Whether the global frontend config declares a shared cache zone
#[cfg_attr(test, mockall::automock)]
pub trait GlobalConfigInspector: Send + Sync {
    /// `None` when the global config cannot be read
    fn declares_cache_zone(&self) -> Option<bool>;
}

/// Reads `nginx.conf` and the `conf.d/*.conf` files next to it
#[derive(Debug, Clone)]
pub struct NginxConfigInspector {
    main_config: PathBuf,
}

impl NginxConfigInspector {
    pub fn new(main_config: impl Into<PathBuf>) -> Self {
        Self {
            main_config: main_config.into(),
        }
    }

    fn declares_zone(content: &str) -> bool {
        content.lines().any(|line| {
            let line = line.trim_start();
            !line.starts_with('#')
                && (line.starts_with("proxy_cache_path") || line.starts_with("fastcgi_cache_path"))
        })
    }
}

impl GlobalConfigInspector for NginxConfigInspector {
    fn declares_cache_zone(&self) -> Option<bool> {
        let main = match fs::read_to_string(&self.main_config) {
            Ok(content) => content,
            Err(e) => {
                debug!(
                    "Cannot read {}: {}, leaving cache directives alone",
                    self.main_config.display(),
                    e
                );
                return None;
            }
        };

        if Self::declares_zone(&main) {
            return Some(true);
        }

        let conf_d = self
            .main_config
            .parent()
            .map(|dir| dir.join("conf.d"))
            .and_then(|dir| fs::read_dir(dir).ok());

        let found = conf_d
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("conf"))
            .filter_map(|path| fs::read_to_string(path).ok())
            .any(|content| Self::declares_zone(&content));

        Some(found)
    }
}

fn is_cache_line(line: &str) -> bool {
    let first = line.split_whitespace().next().unwrap_or("");
    first.starts_with("proxy_cache")
        || first.starts_with("fastcgi_cache")
        || line.contains("$upstream_cache_status")
}

/// Drop response-caching lines, keeping every other line in order
pub fn strip_cache_directives(config: &str) -> String {
    config
        .split_inclusive('\n')
        .filter(|line| !is_cache_line(line))
        .collect()
}

/// Strip caching only when the global config is known to lack a zone
pub fn apply_cache_policy(rendered: String, inspector: &dyn GlobalConfigInspector) -> String {
    match inspector.declares_cache_zone() {
        Some(false) => {
            debug!("No cache zone declared, stripping cache directives");
            strip_cache_directives(&rendered)
        }
        _ => rendered,
    }
}
