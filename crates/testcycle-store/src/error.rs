use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Corrupt session file {path:?} at line {line}: {message}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Iteration {got} appended out of order, expected {expected}")]
    OutOfOrder { expected: u32, got: u32 },

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Could not determine data directory")]
    NoDataDir,
}
