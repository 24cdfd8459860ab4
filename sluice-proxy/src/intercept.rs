use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use sluice_store::Transaction;
use tokio::sync::oneshot;

use crate::error::InterceptError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Carry on with the (possibly edited) transaction.
    Continue,
    /// Answer the client with the drop sentinel; nothing goes upstream.
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub verdict: Verdict,
    pub transaction: Transaction,
}

/// Single-fire release signal for a suspended pipeline task.
///
/// Clones share the same underlying sender; whichever clone completes first
/// wins and every later call is a no-op.
#[derive(Debug, Clone)]
pub struct Completion {
    sender: Arc<Mutex<Option<oneshot::Sender<Resolution>>>>,
}

#[derive(Debug)]
pub struct CompletionWaiter {
    receiver: oneshot::Receiver<Resolution>,
}

impl Completion {
    pub fn new() -> (Self, CompletionWaiter) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                sender: Arc::new(Mutex::new(Some(sender))),
            },
            CompletionWaiter { receiver },
        )
    }

    /// Returns whether this call delivered the resolution.
    pub fn complete(&self, resolution: Resolution) -> bool {
        match self.sender.lock().take() {
            Some(sender) => {
                // A waiter that has gone away (client disconnected) is fine.
                let _ = sender.send(resolution);
                true
            }
            None => false,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl CompletionWaiter {
    /// `None` when every completion handle was dropped without firing.
    pub async fn wait(self) -> Option<Resolution> {
        self.receiver.await.ok()
    }
}

#[derive(Debug)]
struct QueueEntry {
    transaction: Transaction,
    completion: Completion,
    queued_at: Instant,
}

impl QueueEntry {
    /// Already sent upstream; the fetch releases it when the response lands.
    fn in_flight(&self) -> bool {
        self.transaction.response.is_none()
            && (self.transaction.auto_forwarded || self.transaction.waiting_for_response)
    }

    fn release(self, verdict: Verdict) -> Transaction {
        self.completion.complete(Resolution {
            verdict,
            transaction: self.transaction.clone(),
        });
        self.transaction
    }
}

/// Registry of transactions paused for an operator decision.
///
/// Every path that takes an entry out of the queue fires its completion, so
/// a suspended pipeline task is never left behind.
#[derive(Debug)]
pub struct InterceptQueue {
    entries: RwLock<HashMap<String, QueueEntry>>,
    capacity: usize,
}

impl Default for InterceptQueue {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InterceptQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub fn add(
        &self,
        transaction: Transaction,
        completion: Option<Completion>,
    ) -> Result<(), InterceptError> {
        if transaction.id.is_empty() {
            return Err(InterceptError::EmptyId);
        }
        let Some(completion) = completion else {
            return Err(InterceptError::MissingCompletion(transaction.id));
        };
        let method = transaction.request.method().unwrap_or_default();
        if method.is_empty() || transaction.request.hostname().is_empty() {
            return Err(InterceptError::MalformedRequest(transaction.id));
        }

        let mut entries = self.entries.write();
        if entries.contains_key(&transaction.id) {
            return Err(InterceptError::Duplicate(transaction.id));
        }
        if entries.len() >= self.capacity {
            return Err(InterceptError::QueueFull(self.capacity));
        }
        entries.insert(
            transaction.id.clone(),
            QueueEntry {
                transaction,
                completion,
                queued_at: Instant::now(),
            },
        );
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Transaction> {
        self.entries
            .read()
            .get(id)
            .map(|entry| entry.transaction.clone())
    }

    /// Queued transactions, oldest first.
    pub fn get_all(&self) -> Vec<Transaction> {
        let entries = self.entries.read();
        let mut ordered: Vec<&QueueEntry> = entries.values().collect();
        ordered.sort_by_key(|entry| entry.queued_at);
        ordered
            .into_iter()
            .map(|entry| entry.transaction.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.entries.read().len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }

    pub fn get_oldest(&self) -> Option<Transaction> {
        self.entries
            .read()
            .values()
            .min_by_key(|entry| entry.queued_at)
            .map(|entry| entry.transaction.clone())
    }

    pub fn get_by_status(&self, waiting_for_response: bool) -> Vec<Transaction> {
        self.get_all()
            .into_iter()
            .filter(|transaction| transaction.waiting_for_response == waiting_for_response)
            .collect()
    }

    /// Mutate a queued transaction in place without releasing it.
    pub fn update<T>(
        &self,
        id: &str,
        apply: impl FnOnce(&mut Transaction) -> Result<T, InterceptError>,
    ) -> Result<T, InterceptError> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| InterceptError::NotFound(id.to_string()))?;
        apply(&mut entry.transaction)
    }

    /// Take an entry out of the queue and release its waiting task.
    pub fn resolve(&self, id: &str, verdict: Verdict) -> Result<Transaction, InterceptError> {
        let entry = self
            .entries
            .write()
            .remove(id)
            .ok_or_else(|| InterceptError::NotFound(id.to_string()))?;
        Ok(entry.release(verdict))
    }

    /// Remove an entry; its waiting task treats the transaction as dropped.
    pub fn remove(&self, id: &str) -> Option<Transaction> {
        self.resolve(id, Verdict::Drop).ok()
    }

    /// Release every entry still awaiting a decision, unmodified, and
    /// return how many were released.
    ///
    /// Entries whose request is already upstream stay queued but lose their
    /// response review, so the pending fetch delivers straight to the client.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write();
        let released = take_where(&mut entries, |entry| !entry.in_flight());
        for entry in entries.values_mut() {
            entry.transaction.intercept_response = false;
        }
        drop(entries);
        release_all(released)
    }

    /// Release entries queued for longer than `age`, unmodified. Requests
    /// already upstream are left to their fetch.
    pub fn remove_older_than(&self, age: Duration) -> usize {
        let now = Instant::now();
        let expired = take_where(&mut self.entries.write(), |entry| {
            now.duration_since(entry.queued_at) > age && !entry.in_flight()
        });
        release_all(expired)
    }
}

fn take_where(
    entries: &mut HashMap<String, QueueEntry>,
    predicate: impl Fn(&QueueEntry) -> bool,
) -> Vec<QueueEntry> {
    let ids: Vec<String> = entries
        .iter()
        .filter(|(_, entry)| predicate(entry))
        .map(|(id, _)| id.clone())
        .collect();
    ids.iter().filter_map(|id| entries.remove(id)).collect()
}

fn release_all(entries: Vec<QueueEntry>) -> usize {
    let released = entries.len();
    for entry in entries {
        entry.release(Verdict::Continue);
    }
    released
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use sluice_store::{HttpRequest, Provenance, Transaction};

    use super::{Completion, InterceptQueue, Resolution, Verdict};
    use crate::error::InterceptError;

    fn sample() -> Transaction {
        Transaction::new(
            HttpRequest::new(
                "example.com",
                b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n".to_vec(),
                false,
            ),
            Provenance::Browser,
        )
    }

    #[test]
    fn add_rejects_wiring_errors() {
        let queue = InterceptQueue::default();

        let mut empty = sample();
        empty.id.clear();
        assert_matches!(
            queue.add(empty, Some(Completion::new().0)),
            Err(InterceptError::EmptyId)
        );

        assert_matches!(
            queue.add(sample(), None),
            Err(InterceptError::MissingCompletion(_))
        );

        let mut no_host = sample();
        no_host.request.host.clear();
        assert_matches!(
            queue.add(no_host, Some(Completion::new().0)),
            Err(InterceptError::MalformedRequest(_))
        );

        let mut no_method = sample();
        no_method.request.dump = b"\r\n\r\n".to_vec();
        assert_matches!(
            queue.add(no_method, Some(Completion::new().0)),
            Err(InterceptError::MalformedRequest(_))
        );

        let transaction = sample();
        queue
            .add(transaction.clone(), Some(Completion::new().0))
            .unwrap();
        assert_matches!(
            queue.add(transaction.clone(), Some(Completion::new().0)),
            Err(InterceptError::Duplicate(id)) if id == transaction.id
        );
        assert_eq!(queue.get(&transaction.id), Some(transaction));
        assert_eq!(queue.count(), 1);
    }

    #[test]
    fn capacity_is_enforced() {
        let queue = InterceptQueue::new(1);
        queue.add(sample(), Some(Completion::new().0)).unwrap();
        assert_matches!(
            queue.add(sample(), Some(Completion::new().0)),
            Err(InterceptError::QueueFull(1))
        );
    }

    #[tokio::test]
    async fn resolve_releases_the_waiter_with_edits() {
        let queue = InterceptQueue::default();
        let transaction = sample();
        let (completion, waiter) = Completion::new();
        queue.add(transaction.clone(), Some(completion)).unwrap();

        queue
            .update(&transaction.id, |queued| {
                queued.request.dump = b"GET /edited HTTP/1.1\r\nHost: example.com\r\n\r\n".to_vec();
                Ok(())
            })
            .unwrap();
        queue.resolve(&transaction.id, Verdict::Continue).unwrap();

        let resolution = waiter.wait().await.unwrap();
        assert_eq!(resolution.verdict, Verdict::Continue);
        assert_eq!(resolution.transaction.request.target().as_deref(), Some("/edited"));
        assert_eq!(queue.count(), 0);
        assert_matches!(
            queue.resolve(&transaction.id, Verdict::Drop),
            Err(InterceptError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn remove_signals_drop() {
        let queue = InterceptQueue::default();
        let transaction = sample();
        let (completion, waiter) = Completion::new();
        queue.add(transaction.clone(), Some(completion)).unwrap();

        assert!(queue.remove(&transaction.id).is_some());
        assert_eq!(waiter.wait().await.unwrap().verdict, Verdict::Drop);
        assert!(queue.remove(&transaction.id).is_none());
    }

    #[tokio::test]
    async fn clear_releases_every_entry() {
        let queue = InterceptQueue::default();
        let mut waiters = Vec::new();
        for _ in 0..3 {
            let (completion, waiter) = Completion::new();
            queue.add(sample(), Some(completion)).unwrap();
            waiters.push(waiter);
        }

        assert_eq!(queue.clear(), 3);
        assert_eq!(queue.count(), 0);
        for waiter in waiters {
            assert_eq!(waiter.wait().await.unwrap().verdict, Verdict::Continue);
        }
    }

    #[tokio::test]
    async fn clear_leaves_requests_already_upstream() {
        let queue = InterceptQueue::default();
        let (completion, waiter) = Completion::new();
        queue.add(sample(), Some(completion)).unwrap();

        let mut auto = sample();
        auto.auto_forwarded = true;
        queue.add(auto.clone(), Some(Completion::new().0)).unwrap();
        let mut reviewed = sample();
        reviewed.waiting_for_response = true;
        reviewed.intercept_response = true;
        queue.add(reviewed.clone(), Some(Completion::new().0)).unwrap();

        assert_eq!(queue.clear(), 1);
        assert_eq!(waiter.wait().await.unwrap().verdict, Verdict::Continue);
        assert_eq!(queue.count(), 2);
        assert!(queue.contains(&auto.id));
        assert_matches!(
            queue.get(&reviewed.id),
            Some(transaction) if !transaction.intercept_response
        );
        assert_eq!(queue.remove_older_than(Duration::ZERO), 0);
    }

    #[tokio::test]
    async fn remove_older_than_only_touches_stale_entries() {
        let queue = InterceptQueue::default();
        let (old_completion, old_waiter) = Completion::new();
        queue.add(sample(), Some(old_completion)).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let fresh = sample();
        queue.add(fresh.clone(), Some(Completion::new().0)).unwrap();

        assert_eq!(queue.remove_older_than(Duration::from_millis(20)), 1);
        assert_eq!(old_waiter.wait().await.unwrap().verdict, Verdict::Continue);
        assert_eq!(queue.get_all(), vec![fresh]);
    }

    #[test]
    fn completion_fires_once() {
        let (completion, _waiter) = Completion::new();
        let clone = completion.clone();
        let resolution = Resolution {
            verdict: Verdict::Continue,
            transaction: sample(),
        };
        assert!(completion.complete(resolution.clone()));
        assert!(!clone.complete(resolution));
        assert!(clone.is_completed());
    }

    #[tokio::test]
    async fn dropped_completion_wakes_waiter_empty() {
        let (completion, waiter) = Completion::new();
        drop(completion);
        assert_matches!(waiter.wait().await, None);
    }

    #[test]
    fn oldest_and_status_views() {
        let queue = InterceptQueue::default();
        let first = sample();
        queue.add(first.clone(), Some(Completion::new().0)).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let mut second = sample();
        second.waiting_for_response = true;
        queue.add(second.clone(), Some(Completion::new().0)).unwrap();

        assert_eq!(queue.get_oldest(), Some(first.clone()));
        assert_eq!(queue.get_by_status(true), vec![second]);
        assert_eq!(queue.get_by_status(false), vec![first]);
    }
}
