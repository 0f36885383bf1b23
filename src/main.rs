//! sitectl - per-domain nginx/apache/PHP-FPM hosting manager

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sitectl_core::{
    AddDomain, Backend, CertType, ConfigManager, DomainManager, EditDomain, EnableSsl,
    HostContext, Outcome, PhpVersion, SchedulingMechanism, SiteConfig, SslManager,
};

/// sitectl - Manage web-hosting configuration per domain
#[derive(Parser, Debug)]
#[command(name = "sitectl")]
#[command(about = "Manage nginx/apache/PHP-FPM site configuration and TLS per domain", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to /etc/sitectl/config.json, then the user config dir)
    #[arg(long, global = true, env = "SITECTL_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage hosted domains
    Domain {
        #[command(subcommand)]
        command: DomainCommands,
    },
    /// Manage TLS certificates
    Ssl {
        #[command(subcommand)]
        command: SslCommands,
    },
    /// Manage automatic certificate renewal
    Renewal {
        #[command(subcommand)]
        command: RenewalCommands,
    },
    /// Inspect or create the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum DomainCommands {
    /// Add a domain and enable its site
    Add {
        /// Domain name (e.g., shop.example.com)
        name: String,

        /// Server that runs PHP: nginx (direct) or apache (behind nginx)
        #[arg(long, default_value = "nginx")]
        backend: Backend,

        /// PHP-FPM version (7.4, 8.0, 8.1, 8.2, 8.3, 8.4)
        #[arg(long = "php", default_value = "8.2")]
        php_version: PhpVersion,
    },
    /// Change the backend or PHP version of a domain
    Edit {
        name: String,

        #[arg(long)]
        backend: Option<Backend>,

        #[arg(long = "php")]
        php_version: Option<PhpVersion>,
    },
    /// Remove a domain's configuration (the document root is kept)
    Delete { name: String },
    /// List domains
    List,
    /// Show a domain and its certificate as JSON
    Show { name: String },
    /// Regenerate every domain's configuration and reload once
    Rebuild,
}

#[derive(Subcommand, Debug)]
enum SslCommands {
    /// Enable HTTPS for a domain
    Enable {
        domain: String,

        /// Certificate source: self-signed or letsencrypt
        #[arg(long = "type", default_value = "self-signed")]
        cert_type: CertType,

        /// Contact address for Let's Encrypt
        #[arg(long)]
        email: Option<String>,
    },
    /// Serve a domain over plain HTTP again (certificate files are kept)
    Disable { domain: String },
    /// Renew Let's Encrypt certificates (one domain, or all)
    Renew {
        domain: Option<String>,

        /// Ask certbot for a dry run against the staging CA
        #[arg(long)]
        dry_run: bool,
    },
    /// Show certificate state for a domain
    Status { domain: String },
    /// List certificates
    List,
}

#[derive(Subcommand, Debug)]
enum RenewalCommands {
    /// Show the active renewal mechanism
    Status,
    /// Install a systemd timer (or a cron job when systemd is unavailable)
    Enable,
    /// Remove the active renewal mechanism
    Disable,
    /// Run `certbot renew --dry-run`
    Test,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Write the default configuration
    Init {
        /// Destination (defaults to /etc/sitectl/config.json)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Domain { command } => handle_domain_command(cli.config.as_deref(), command),
        Commands::Ssl { command } => handle_ssl_command(cli.config.as_deref(), command),
        Commands::Renewal { command } => handle_renewal_command(cli.config.as_deref(), command),
        Commands::Config { command } => handle_config_command(cli.config.as_deref(), command),
    }
}

fn load_config(explicit: Option<&Path>) -> Result<SiteConfig> {
    let (config, source) = ConfigManager::load(explicit).context("Failed to load configuration")?;
    match source {
        Some(path) => debug!("Using config {}", path.display()),
        None => debug!("Using built-in defaults"),
    }
    Ok(config)
}

fn host(explicit: Option<&Path>) -> Result<HostContext> {
    Ok(HostContext::system(load_config(explicit)?))
}

fn print_warnings<T>(outcome: &Outcome<T>) {
    for warning in &outcome.warnings {
        eprintln!("⚠️  {}", warning);
    }
}

fn handle_domain_command(config: Option<&Path>, command: DomainCommands) -> Result<()> {
    let ctx = host(config)?;
    let manager = DomainManager::new(&ctx);

    match command {
        DomainCommands::Add {
            name,
            backend,
            php_version,
        } => {
            let outcome = manager
                .add(AddDomain {
                    name: name.clone(),
                    backend,
                    php_version,
                })
                .with_context(|| format!("Failed to add domain '{}'", name))?;
            let record = &outcome.value;

            println!("✅ Domain '{}' added", record.name);
            println!("   Backend: {}", record.backend);
            println!("   PHP: {}", record.php_version);
            println!("   Document root: {}", record.document_root.display());
            print_warnings(&outcome);
            Ok(())
        }
        DomainCommands::Edit {
            name,
            backend,
            php_version,
        } => {
            if backend.is_none() && php_version.is_none() {
                anyhow::bail!("Nothing to change: pass --backend and/or --php");
            }

            let outcome = manager
                .edit(
                    &name,
                    EditDomain {
                        backend,
                        php_version,
                    },
                )
                .with_context(|| format!("Failed to update domain '{}'", name))?;

            println!(
                "✅ Domain '{}' updated ({}, PHP {})",
                outcome.value.name, outcome.value.backend, outcome.value.php_version
            );
            print_warnings(&outcome);
            Ok(())
        }
        DomainCommands::Delete { name } => {
            let outcome = manager
                .delete(&name)
                .with_context(|| format!("Failed to delete domain '{}'", name))?;

            println!("✅ Domain '{}' removed", outcome.value.name);
            println!(
                "   Document root kept: {}",
                outcome.value.document_root.display()
            );
            print_warnings(&outcome);
            Ok(())
        }
        DomainCommands::List => {
            let domains = manager.list()?;

            if domains.is_empty() {
                println!("No domains configured");
                println!("Add a domain with: sitectl domain add <name> --backend nginx --php 8.2");
                return Ok(());
            }

            println!("Configured domains ({})", domains.len());
            println!();

            for domain in domains {
                let ssl = if domain.ssl_enabled { "🔒" } else { "⚪" };
                println!("  {} {}", ssl, domain.name);
                println!(
                    "    Backend: {}, PHP: {}",
                    domain.backend, domain.php_version
                );
                println!("    Document root: {}", domain.document_root.display());
                println!();
            }
            Ok(())
        }
        DomainCommands::Show { name } => {
            let details = manager.show(&name)?;
            println!("{}", serde_json::to_string_pretty(&details)?);
            Ok(())
        }
        DomainCommands::Rebuild => {
            let outcome = manager.rebuild().context("Failed to rebuild configs")?;
            println!("✅ Rebuilt configuration for {} domain(s)", outcome.value);
            print_warnings(&outcome);
            Ok(())
        }
    }
}

fn handle_ssl_command(config: Option<&Path>, command: SslCommands) -> Result<()> {
    let ctx = host(config)?;
    let manager = SslManager::new(&ctx);

    match command {
        SslCommands::Enable {
            domain,
            cert_type,
            email,
        } => {
            let outcome = manager
                .enable(EnableSsl {
                    domain: domain.clone(),
                    cert_type,
                    email,
                })
                .with_context(|| format!("Failed to enable SSL for '{}'", domain))?;
            let cert = &outcome.value;

            println!("✅ SSL enabled for '{}' ({})", cert.domain, cert.cert_type);
            println!("   Certificate: {}", cert.cert_path.display());
            println!("   Key: {}", cert.key_path.display());
            if let Some(days) = cert.days_remaining() {
                println!("   Expires in: {} days", days);
            }
            print_warnings(&outcome);
            Ok(())
        }
        SslCommands::Disable { domain } => {
            let outcome = manager
                .disable(&domain)
                .with_context(|| format!("Failed to disable SSL for '{}'", domain))?;

            println!("✅ SSL disabled for '{}'", outcome.value.name);
            println!("   Certificate files were kept; re-enable with: sitectl ssl enable {}", outcome.value.name);
            print_warnings(&outcome);
            Ok(())
        }
        SslCommands::Renew { domain, dry_run } => {
            let outcome = manager
                .renew(domain.as_deref(), dry_run)
                .context("Certificate renewal failed")?;

            if dry_run {
                println!("✅ Renewal dry run succeeded");
            } else {
                println!("✅ Renewal finished");
                for cert in &outcome.value {
                    match cert.days_remaining() {
                        Some(days) => println!("   {}: {} days remaining", cert.domain, days),
                        None => println!("   {}: expiry unknown", cert.domain),
                    }
                }
            }
            print_warnings(&outcome);
            Ok(())
        }
        SslCommands::Status { domain } => {
            let status = manager.status(&domain)?;

            println!("SSL status for {}", status.domain);
            println!(
                "   Enabled: {}",
                if status.ssl_enabled { "yes ✅" } else { "no" }
            );
            match &status.certificate {
                Some(cert) => {
                    println!("   Type: {}", cert.cert_type);
                    println!("   Certificate: {}", cert.cert_path.display());
                    println!("   Key: {}", cert.key_path.display());
                    println!(
                        "   Files present: {}",
                        if status.files_present { "yes" } else { "no ❌" }
                    );
                    if let Some(days) = status.days_remaining {
                        println!("   Days remaining: {}", days);
                    }
                }
                None => println!("   No certificate on record"),
            }
            Ok(())
        }
        SslCommands::List => {
            let certs = manager.list()?;

            if certs.is_empty() {
                println!("No certificates on record");
                return Ok(());
            }

            println!("Certificates ({})", certs.len());
            println!();
            for cert in certs {
                let state = if cert.enabled { "✅ Enabled " } else { "⚪ Disabled" };
                let days = cert
                    .days_remaining()
                    .map(|d| format!("{} days", d))
                    .unwrap_or_else(|| "unknown".to_string());
                println!("  {} {} ({}, {})", state, cert.domain, cert.cert_type, days);
            }
            Ok(())
        }
    }
}

fn handle_renewal_command(config: Option<&Path>, command: RenewalCommands) -> Result<()> {
    let ctx = host(config)?;
    let scheduler = ctx.scheduler();

    match command {
        RenewalCommands::Status => {
            let status = scheduler.status()?;
            println!("Automatic renewal: {}", status);
            Ok(())
        }
        RenewalCommands::Enable => {
            let before = scheduler.status()?;
            let mechanism = scheduler.enable().context("Failed to enable automatic renewal")?;
            if before == mechanism {
                println!("Automatic renewal already active: {}", mechanism);
            } else {
                println!("✅ Automatic renewal enabled: {}", mechanism);
            }
            Ok(())
        }
        RenewalCommands::Disable => {
            match scheduler.disable().context("Failed to disable automatic renewal")? {
                SchedulingMechanism::None => println!("Automatic renewal is not configured"),
                removed => println!("✅ Removed {}", removed),
            }
            Ok(())
        }
        RenewalCommands::Test => {
            scheduler
                .trigger(None, true)
                .context("Renewal dry run failed")?;
            println!("✅ Renewal dry run succeeded");
            Ok(())
        }
    }
}

fn handle_config_command(config: Option<&Path>, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let (effective, source) = ConfigManager::load(config)?;
            match source {
                Some(path) => println!("# Loaded from {}", path.display()),
                None => println!("# Built-in defaults (no config file found)"),
            }
            println!("{}", serde_json::to_string_pretty(&effective)?);
            Ok(())
        }
        ConfigCommands::Init { path, force } => {
            let path = path.unwrap_or_else(ConfigManager::default_path);
            if path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }

            ConfigManager::save_to(&SiteConfig::default(), &path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("✅ Configuration written to {}", path.display());
            Ok(())
        }
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}
