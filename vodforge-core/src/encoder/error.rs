use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("source file missing or unreadable: {0}")]
    InvalidSource(PathBuf),
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("encoder exited with status {status:?} for {label}: {stderr}")]
    Failed {
        label: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("probe failed: {0}")]
    Probe(String),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type EncodeResult<T> = Result<T, EncodeError>;
