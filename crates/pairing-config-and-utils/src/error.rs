//! Errors raised while loading settings and preparing the base directory.

use std::path::PathBuf;
use thiserror::Error;

/// Error type shared by the pairing crates for setup problems.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Config file could not be read or written.
    #[error("cannot access config file {}: {source}", path.display())]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid JSON for [`crate::Config`].
    #[error("malformed config file {}: {source}", path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A setting holds a value the pairing flow cannot run with.
    #[error("invalid setting {setting}: {reason}")]
    InvalidSetting {
        setting: &'static str,
        reason: String,
    },

    /// A URL setting does not parse.
    #[error("invalid URL in {setting}: {source}")]
    InvalidUrl {
        setting: &'static str,
        #[source]
        source: url::ParseError,
    },

    /// Home directory could not be determined.
    #[error("cannot determine home directory; pass --base-dir")]
    NoHomeDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub(crate) fn invalid(setting: &'static str, reason: impl Into<String>) -> Self {
        CoreError::InvalidSetting {
            setting,
            reason: reason.into(),
        }
    }
}

/// Result type alias using CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
