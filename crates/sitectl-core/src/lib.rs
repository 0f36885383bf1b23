//! sitectl engine
//!
//! Keeps the domain and certificate records in sync with the nginx/apache
//! configs, enablement links and renewal jobs generated from them.

pub mod activator;
pub mod command;
pub mod config;
pub mod dns;
pub mod error;
pub mod generator;
pub mod lifecycle;
pub mod models;
pub mod renewal;
pub mod store;
pub mod templates;

pub use command::{CommandOutput, CommandRunner, Invocation, SystemRunner};
pub use config::{ConfigManager, SiteConfig};
pub use error::{Result, SiteError};
pub use lifecycle::{
    AddDomain, DomainDetails, DomainManager, EditDomain, EnableSsl, HostContext, Outcome,
    SslManager, SslStatus,
};
pub use models::{Backend, CertType, CertificateRecord, DomainRecord, PhpVersion};
pub use renewal::{RenewalScheduler, SchedulingMechanism};
pub use store::RecordStore;
