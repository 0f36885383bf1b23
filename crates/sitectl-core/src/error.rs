use sitectl_cert::{AcmeError, SelfSignedError};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SiteError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Template '{name}' not found in any of: {searched}")]
    TemplateNotFound { name: String, searched: String },

    #[error("Invalid template {}: {reason}", path.display())]
    InvalidTemplate { path: PathBuf, reason: String },

    #[error("{tool} failed: {message}")]
    ExternalTool { tool: String, message: String },

    #[error("{check} failed: {message}\n  Fix: {remedy}")]
    ExternalValidation {
        check: String,
        message: String,
        remedy: String,
    },

    #[error("Certificate error: {0}")]
    Certificate(#[from] SelfSignedError),

    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store lock error: {0}")]
    Lock(String),
}

impl SiteError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        SiteError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        SiteError::ExternalTool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Advisory errors never undo a completed record mutation
    pub fn is_advisory(&self) -> bool {
        matches!(self, SiteError::ExternalTool { .. })
    }
}

impl From<AcmeError> for SiteError {
    fn from(e: AcmeError) -> Self {
        SiteError::Validation(e.to_string())
    }
}

/// Attach the offending path to `std::io` errors
pub trait IoResultExt<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|e| SiteError::io(path, e))
    }
}

pub type Result<T> = std::result::Result<T, SiteError>;
