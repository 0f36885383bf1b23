//! DNS lookups for issuance pre-flight

use hickory_resolver::Resolver;
use std::net::IpAddr;
use tracing::debug;

use crate::error::{Result, SiteError};

#[cfg_attr(test, mockall::automock)]
pub trait DnsResolver: Send + Sync {
    /// Addresses `domain` resolves to, or a description of why it does not
    fn lookup(&self, domain: &str) -> std::result::Result<Vec<IpAddr>, String>;
}

/// Uses the host's `/etc/resolv.conf`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDnsResolver;

impl DnsResolver for SystemDnsResolver {
    fn lookup(&self, domain: &str) -> std::result::Result<Vec<IpAddr>, String> {
        let resolver = Resolver::from_system_conf().map_err(|e| e.to_string())?;
        let response = resolver.lookup_ip(domain).map_err(|e| e.to_string())?;
        Ok(response.iter().collect())
    }
}

/// The ACME HTTP-01 challenge cannot succeed for a name that does not resolve
pub fn ensure_resolves(resolver: &dyn DnsResolver, domain: &str) -> Result<Vec<IpAddr>> {
    let failure = |message: String| SiteError::ExternalValidation {
        check: format!("DNS lookup for {}", domain),
        message,
        remedy: format!(
            "create an A or AAAA record for {} pointing at this server, wait for it to propagate, then retry",
            domain
        ),
    };

    let addresses = resolver.lookup(domain).map_err(failure)?;
    if addresses.is_empty() {
        return Err(failure("no addresses returned".to_string()));
    }

    debug!("{} resolves to {:?}", domain, addresses);
    Ok(addresses)
}
