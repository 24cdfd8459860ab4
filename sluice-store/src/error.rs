use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("transaction not found: {0}")]
    NotFound(String),
    #[error("transaction already recorded: {0}")]
    Duplicate(String),
    #[error("transaction {0} has no response")]
    NoResponse(String),
    #[error("chunk {index} out of range ({total} chunks)")]
    ChunkOutOfRange { index: usize, total: usize },
    #[error("unknown chunk kind: {0}")]
    UnknownChunkKind(String),
    #[error("chunk size must be positive")]
    InvalidChunkSize,
}
