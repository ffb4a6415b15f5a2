use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::VersionId;

pub type Result<T> = std::result::Result<T, DuskError>;

#[derive(Debug, Error)]
pub enum DuskError {
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    #[error("cannot open database at {}: {message}", path.display())]
    FileAccess { path: PathBuf, message: String },
    #[error("database at path already opened with different {0}")]
    MismatchedConfig(&'static str),
    #[error("schema mismatch: another process has modified the database schema in an incompatible way")]
    SchemaMismatch,
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    #[error("corruption: {0}")]
    Corruption(&'static str),
    #[error("version {0} is no longer available")]
    VersionUnavailable(VersionId),
}
