use sluice_store::{Transaction, TransactionSummary};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;

/// Observer invoked after every store mutation.
pub trait TransactionNotifier: Send + Sync {
    fn transaction_added(&self, transaction: &Transaction);
    fn transaction_updated(&self, transaction: &Transaction);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Added(TransactionSummary),
    Updated(TransactionSummary),
}

impl StoreEvent {
    pub fn summary(&self) -> &TransactionSummary {
        match self {
            Self::Added(summary) | Self::Updated(summary) => summary,
        }
    }
}

pub type StoreEvents = ReceiverStream<StoreEvent>;

/// Delivers summaries over a bounded channel. Events are dropped, with a
/// warning, once the consumer falls a full channel behind.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::Sender<StoreEvent>,
}

impl ChannelNotifier {
    fn send(&self, event: StoreEvent) {
        match self.sender.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!(id = %event.summary().id, "store event channel full, event dropped");
            }
        }
    }
}

impl TransactionNotifier for ChannelNotifier {
    fn transaction_added(&self, transaction: &Transaction) {
        self.send(StoreEvent::Added(transaction.summary()));
    }

    fn transaction_updated(&self, transaction: &Transaction) {
        self.send(StoreEvent::Updated(transaction.summary()));
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

impl TransactionNotifier for NullNotifier {
    fn transaction_added(&self, _transaction: &Transaction) {}
    fn transaction_updated(&self, _transaction: &Transaction) {}
}

pub fn event_channel() -> (ChannelNotifier, StoreEvents) {
    let (sender, receiver) = mpsc::channel(50_000);
    (ChannelNotifier { sender }, ReceiverStream::new(receiver))
}
