use std::path::PathBuf;

/// Result type for recoding operations
pub type Result<T> = std::result::Result<T, MediaError>;

/// Error types for recoding operations
///
/// Per-asset errors (`Decode`, `Probe`, `Encode`) mark a single asset as failed
/// and never abort the batch. `Catalog`, `Config` and `ToolMissing` are raised
/// before dispatch and abort the run.
#[derive(thiserror::Error, Debug)]
pub enum MediaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot decode {path}: {message}")]
    Decode { path: PathBuf, message: String },

    #[error("probe failed for {path}: {message}")]
    Probe { path: PathBuf, message: String },

    #[error("encoder exited with {status} for {path}: {diagnostic}")]
    Encode {
        path: PathBuf,
        status: String,
        diagnostic: String,
    },

    #[error("progress write for '{key}' dropped after {attempts} attempts: {message}")]
    ProgressWrite {
        key: String,
        attempts: u32,
        message: String,
    },

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("required tool not found: {0}")]
    ToolMissing(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl MediaError {
    pub fn probe(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::Probe {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn decode(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::Decode {
            path: path.into(),
            message: message.to_string(),
        }
    }
}
