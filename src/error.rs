use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum GateError {
    #[error("missing config file seqgate.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unknown pathogen: {0}")]
    UnknownPathogen(String),

    #[error("pathogen {pathogen} has no platform {platform}")]
    UnknownPlatform { pathogen: String, platform: String },

    #[error("site {site} is not registered for pathogen {pathogen}")]
    UnknownSite { pathogen: String, site: String },

    #[error("bucket {0} does not match any configured bucket layout")]
    UnknownBucket(String),

    #[error("malformed object key {key}: {reason}")]
    KeyFormat { key: String, reason: String },

    #[error("object not found: {bucket}/{key}")]
    ObjectNotFound { bucket: String, key: String },

    #[error("storage unavailable: {0}")]
    TransientIo(String),

    #[error("bucket policy for {bucket} does not grant {capability}")]
    AccessDenied { bucket: String, capability: String },

    #[error("artifact {0} has not been resolved")]
    NotResolved(String),

    #[error("invalid notification: {0}")]
    Notification(String),

    #[error("failed to publish verdict: {0}")]
    Publish(String),

    #[error("failed to encode verdict: {0}")]
    Encode(String),

    #[error("catalogue request failed: {0}")]
    Catalogue(String),

    #[error("catalogue returned status {status}: {message}")]
    CatalogueStatus { status: u16, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("worker queue is closed")]
    QueueClosed,
}

impl GateError {
    pub fn key_format(key: &str, reason: impl Into<String>) -> Self {
        GateError::KeyFormat {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Errors worth retrying: storage or broker unavailability. Everything
    /// else is deterministic and fails the same way on every attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GateError::TransientIo(_) | GateError::Publish(_) | GateError::Catalogue(_)
        ) || matches!(self, GateError::CatalogueStatus { status, .. } if matches!(status, 429 | 500 | 502 | 503 | 504))
    }

    pub fn is_config(&self) -> bool {
        matches!(
            self,
            GateError::MissingConfig
                | GateError::ConfigRead(_)
                | GateError::ConfigParse(_)
                | GateError::Config(_)
                | GateError::UnknownPathogen(_)
                | GateError::UnknownPlatform { .. }
                | GateError::UnknownSite { .. }
                | GateError::UnknownBucket(_)
        )
    }
}
