//! Job-level error taxonomy.
//!
//! Input and configuration errors abort before any output is written.
//! Extraction and distribution errors are scoped to a single token and the
//! orchestrator decides whether they quarantine the token or end the job.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::distribution::SendError;
use crate::ooxml::OoxmlError;

#[derive(Error, Debug)]
pub enum BurstError {
    #[error("Input error: {0}")]
    Input(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Extraction failed for token '{token}': {reason}")]
    Extraction { token: String, reason: String },

    #[error("Distribution failed for token '{token}': {source}")]
    Distribution {
        token: String,
        #[source]
        source: SendError,
    },

    #[error("Resource error at '{}': {reason}", path.display())]
    Resource { path: PathBuf, reason: String },

    #[error("License limit: {0}")]
    License(String),

    #[error("Hook '{stage}' failed: {reason}")]
    Hook { stage: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Spreadsheet package error: {0}")]
    Ooxml(#[from] OoxmlError),
}

impl BurstError {
    /// Wrap an I/O failure on a specific path.
    pub fn resource(path: &Path, err: impl std::fmt::Display) -> Self {
        Self::Resource {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    }

    pub fn extraction(token: &str, err: impl std::fmt::Display) -> Self {
        Self::Extraction {
            token: token.to_string(),
            reason: err.to_string(),
        }
    }

    /// Process exit status for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Input(_) => 2,
            Self::Configuration(_) | Self::Json(_) => 3,
            Self::Extraction { .. } | Self::Ooxml(_) => 4,
            Self::Distribution { .. } => 5,
            Self::Resource { .. } | Self::Io(_) => 6,
            Self::License(_) => 7,
            Self::Hook { .. } => 8,
        }
    }
}
