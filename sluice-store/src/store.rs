use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::chunk::{self, ChunkKind, TransactionChunk, TransactionMetadata};
use crate::error::StoreError;
use crate::model::{Transaction, TransactionSummary};

/// Append-only, sequence-numbered log of captured transactions.
#[derive(Debug, Default)]
pub struct TransactionStore {
    inner: RwLock<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    transactions: Vec<Transaction>,
    positions: HashMap<String, usize>,
    counter: u64,
}

impl StoreInner {
    fn highest_sequence(&self) -> u64 {
        self.transactions
            .last()
            .map(|transaction| transaction.seq_number)
            .unwrap_or(0)
    }
}

impl TransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a transaction, filling in id, timestamp and sequence number
    /// when absent.
    ///
    /// A supplied sequence number is kept only if it sorts after everything
    /// already recorded; otherwise the next counter value is used. The
    /// counter is advanced past any number it keeps.
    pub fn add(&self, mut transaction: Transaction) -> Result<Transaction, StoreError> {
        let mut inner = self.inner.write();

        if transaction.id.is_empty() {
            transaction.id = Uuid::new_v4().to_string();
        }
        if inner.positions.contains_key(&transaction.id) {
            return Err(StoreError::Duplicate(transaction.id));
        }
        if transaction.timestamp.is_none() {
            transaction.timestamp = Some(Utc::now());
        }

        let supplied = transaction.seq_number;
        if supplied != 0 && supplied > inner.highest_sequence() {
            inner.counter = inner.counter.max(supplied);
        } else {
            inner.counter += 1;
            transaction.seq_number = inner.counter;
        }

        let position = inner.transactions.len();
        inner.positions.insert(transaction.id.clone(), position);
        inner.transactions.push(transaction.clone());
        Ok(transaction)
    }

    /// Replace a recorded transaction. Its sequence number never changes and
    /// its timestamp is kept when the caller leaves it empty.
    pub fn update(&self, mut transaction: Transaction) -> Result<Transaction, StoreError> {
        let mut inner = self.inner.write();
        let position = *inner
            .positions
            .get(&transaction.id)
            .ok_or_else(|| StoreError::NotFound(transaction.id.clone()))?;

        let existing = &mut inner.transactions[position];
        transaction.seq_number = existing.seq_number;
        if transaction.timestamp.is_none() {
            transaction.timestamp = existing.timestamp;
        }
        *existing = transaction.clone();
        Ok(transaction)
    }

    pub fn get(&self, id: &str) -> Option<Transaction> {
        let inner = self.inner.read();
        inner
            .positions
            .get(id)
            .map(|position| inner.transactions[*position].clone())
    }

    pub fn get_all(&self) -> Vec<Transaction> {
        self.inner.read().transactions.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summaries(&self) -> Vec<TransactionSummary> {
        self.inner
            .read()
            .transactions
            .iter()
            .map(Transaction::summary)
            .collect()
    }

    /// Summaries recorded strictly after `last_id`; empty when `last_id` is
    /// unknown.
    pub fn summaries_after(&self, last_id: &str) -> Vec<TransactionSummary> {
        let inner = self.inner.read();
        match inner.positions.get(last_id) {
            Some(position) => inner.transactions[position + 1..]
                .iter()
                .map(Transaction::summary)
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn next_sequence_number(&self) -> u64 {
        self.inner.read().counter + 1
    }

    pub fn counter(&self) -> u64 {
        self.inner.read().counter
    }

    /// Restore the counter from persisted state. It is never moved below the
    /// highest sequence number already recorded.
    pub fn set_counter(&self, value: u64) {
        let mut inner = self.inner.write();
        inner.counter = value.max(inner.highest_sequence());
    }

    pub fn reset(&self) {
        *self.inner.write() = StoreInner::default();
    }

    pub fn chunk(
        &self,
        id: &str,
        kind: ChunkKind,
        index: usize,
        chunk_size: usize,
    ) -> Result<TransactionChunk, StoreError> {
        let transaction = self
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        chunk::slice(&transaction, kind, index, chunk_size)
    }

    pub fn metadata(&self, id: &str, chunk_size: usize) -> Result<TransactionMetadata, StoreError> {
        let transaction = self
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        chunk::metadata(&transaction, chunk_size)
    }
}
