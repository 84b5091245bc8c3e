use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("unknown dependency '{0}'")]
    Unknown(String),
    #[error(
        "dependency '{key}' requires version {required}, but its source now yields version {obtained}"
    )]
    VersionMismatch {
        key: String,
        required: String,
        obtained: String,
    },
    #[error("failed to fetch dependency '{key}' from {source_desc}: {reason}")]
    Fetch {
        key: String,
        source_desc: String,
        reason: String,
    },
    #[error("invalid version metadata at {path}: {reason}")]
    Metadata { path: PathBuf, reason: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Storage-level cache failures. Callers of `get_or_call` never see these;
/// they degrade to an uncached call.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("cache connection lock was poisoned")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to start stage thread '{stage}': {source}")]
    Spawn {
        stage: String,
        #[source]
        source: io::Error,
    },
    #[error("stage '{stage}' failed: {message}")]
    Stage { stage: String, message: String },
    #[error("stage thread '{0}' panicked")]
    Panicked(String),
}
