use thiserror::Error;

use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Structural error: {0}")]
    Structural(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Resource monitor error: {0}")]
    Monitor(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Invalid transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: String,
        to: String,
    },

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Verification gate error: {0}")]
    Verification(String),

    #[error("Repair strategy error: {0}")]
    Strategy(String),

    #[error("No home directory")]
    NoHomeDir,
}

impl Error {
    /// Whether this error describes a malformed task graph.
    pub fn is_structural(&self) -> bool {
        matches!(self, Error::Structural(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
