use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("transfer not found: {0}")]
    NotFound(String),
    #[error("invalid transfer state: {0}")]
    InvalidState(String),
    #[error("transfer error: {0}")]
    Transfer(String),
    #[error("HTTP {status} ({context})")]
    HttpStatus { status: u16, context: String },
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Non-fatal post-processing problem. Logged and reported, never fails a transfer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PostProcessWarning {
    #[error("extraction of {path} failed: {reason}")]
    Extraction { path: PathBuf, reason: String },
    #[error("conversion of {path} failed: {reason}")]
    Conversion { path: PathBuf, reason: String },
    #[error("relocation of {path} failed: {reason}")]
    Relocation { path: PathBuf, reason: String },
}
