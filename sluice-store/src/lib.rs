mod chunk;
mod error;
mod model;
mod store;

pub use chunk::{ChunkKind, DEFAULT_CHUNK_SIZE, TransactionChunk, TransactionMetadata};
pub use error::StoreError;
pub use model::{HttpRequest, HttpResponse, Provenance, Transaction, TransactionSummary};
pub use store::TransactionStore;
