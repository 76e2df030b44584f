use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PreserveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("VFS error: {0}")]
    Vfs(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Malformed record: {0}")]
    Malformed(#[from] MalformedRecordError),

    #[error(transparent)]
    DuplicateKey(#[from] DuplicateKeyError),

    #[error(transparent)]
    CheckpointCorrupt(#[from] CheckpointCorruptError),

    #[error("Comparison error: {0}")]
    Comparison(String),
}

pub type Result<T> = std::result::Result<T, PreserveError>;

/// A report row that could not be mapped onto a record.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{input}, line {line}: {reason} (row: {content:?})")]
pub struct MalformedRecordError {
    /// Label of the report the row came from
    pub input: String,
    /// 1-based line number
    pub line: u64,
    /// Raw row content
    pub content: String,
    pub reason: String,
}

/// Per-file failure during an inventory build. Never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{path}: {reason}")]
pub struct RecordError {
    pub path: String,
    pub reason: String,
}

/// The same path occurs twice in one inventory.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("duplicate path '{path}' in {input}")]
pub struct DuplicateKeyError {
    pub input: String,
    pub path: String,
}

/// Resume data that does not agree with the output it accompanies.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("checkpoint {} is corrupt: {reason}", .checkpoint.display())]
pub struct CheckpointCorruptError {
    pub checkpoint: PathBuf,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum VfsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Not a file: {0}")]
    NotAFile(String),
}
