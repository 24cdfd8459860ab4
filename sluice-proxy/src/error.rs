use sluice_net::{ParseError, TlsError};
use sluice_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy configuration error: {0}")]
    Config(String),
    #[error("proxy runtime error: {0}")]
    Runtime(String),
    #[error("proxy IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls error: {0}")]
    Tls(#[from] TlsError),
    #[error("malformed http message: {0}")]
    Parse(#[from] ParseError),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error(transparent)]
    Intercept(#[from] InterceptError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Rejections from the intercept queue and the interception control surface.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InterceptError {
    #[error("transaction id is empty")]
    EmptyId,
    #[error("transaction {0} is already queued")]
    Duplicate(String),
    #[error("transaction {0} has no completion signal")]
    MissingCompletion(String),
    #[error("transaction {0} has no usable method or host")]
    MalformedRequest(String),
    #[error("edited response for {0} has no valid status line")]
    MalformedResponse(String),
    #[error("intercept queue is full ({0} entries)")]
    QueueFull(usize),
    #[error("transaction {0} is not queued")]
    NotFound(String),
    #[error("transaction {0} is already being forwarded")]
    AlreadyForwarding(String),
    #[error("transaction {0} has no response yet")]
    NoResponse(String),
}
