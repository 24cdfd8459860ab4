use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::model::Transaction;

pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Request,
    Response,
}

impl FromStr for ChunkKind {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "request" => Ok(Self::Request),
            "response" => Ok(Self::Response),
            other => Err(StoreError::UnknownChunkKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionChunk {
    pub id: String,
    pub kind: ChunkKind,
    pub index: usize,
    pub total_chunks: usize,
    pub data: Vec<u8>,
    pub is_last: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionMetadata {
    pub id: String,
    pub chunk_size: usize,
    pub request_size: usize,
    pub request_chunks: usize,
    pub has_response: bool,
    pub response_size: usize,
    pub response_chunks: usize,
}

/// Raw request dump, or the printable response rendering.
fn payload(transaction: &Transaction, kind: ChunkKind) -> Result<Vec<u8>, StoreError> {
    match kind {
        ChunkKind::Request => Ok(transaction.request.dump.clone()),
        ChunkKind::Response => transaction
            .response
            .as_ref()
            .map(|response| response.printable().into_bytes())
            .ok_or_else(|| StoreError::NoResponse(transaction.id.clone())),
    }
}

/// An empty payload still counts as one (empty) chunk.
fn chunk_count(size: usize, chunk_size: usize) -> usize {
    size.div_ceil(chunk_size).max(1)
}

pub(crate) fn slice(
    transaction: &Transaction,
    kind: ChunkKind,
    index: usize,
    chunk_size: usize,
) -> Result<TransactionChunk, StoreError> {
    if chunk_size == 0 {
        return Err(StoreError::InvalidChunkSize);
    }
    let payload = payload(transaction, kind)?;
    let total = chunk_count(payload.len(), chunk_size);
    if index >= total {
        return Err(StoreError::ChunkOutOfRange { index, total });
    }

    let start = index * chunk_size;
    let end = (start + chunk_size).min(payload.len());
    Ok(TransactionChunk {
        id: transaction.id.clone(),
        kind,
        index,
        total_chunks: total,
        data: payload[start..end].to_vec(),
        is_last: index + 1 == total,
    })
}

pub(crate) fn metadata(
    transaction: &Transaction,
    chunk_size: usize,
) -> Result<TransactionMetadata, StoreError> {
    if chunk_size == 0 {
        return Err(StoreError::InvalidChunkSize);
    }
    let request_size = transaction.request.dump.len();
    let response_size = transaction
        .response
        .as_ref()
        .map(|response| response.printable().len())
        .unwrap_or(0);

    Ok(TransactionMetadata {
        id: transaction.id.clone(),
        chunk_size,
        request_size,
        request_chunks: chunk_count(request_size, chunk_size),
        has_response: transaction.response.is_some(),
        response_size,
        response_chunks: if transaction.response.is_some() {
            chunk_count(response_size, chunk_size)
        } else {
            0
        },
    })
}
