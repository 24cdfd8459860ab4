use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("compression error: {0}")]
    Compression(String),
    #[error("unsupported content encoding: {0}")]
    Unsupported(String),
}
