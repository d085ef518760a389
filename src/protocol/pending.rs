//! Pending-operation table
//!
//! Correlates outbound Create/Extend/Begin requests with their replies.
//! Each entry holds exactly one completion channel and one timer; expiry
//! completes the entry with [`NodeError::Timeout`] and is terminal for that
//! attempt. Registering a new request on an already-pending key completes
//! the old entry with [`NodeError::Superseded`] first, never a silent
//! clobber.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::error::{NodeError, Result};

use super::{CircuitId, ConnId, StreamId};

/// Correlation key for an in-flight request.
///
/// Create/Extend are keyed by (connection, circuit); Begin additionally by
/// stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub conn: ConnId,
    pub circuit: CircuitId,
    pub stream: Option<StreamId>,
}

impl PendingKey {
    pub fn circuit(conn: ConnId, circuit: CircuitId) -> Self {
        Self {
            conn,
            circuit,
            stream: None,
        }
    }

    pub fn stream(conn: ConnId, circuit: CircuitId, stream: StreamId) -> Self {
        Self {
            conn,
            circuit,
            stream: Some(stream),
        }
    }
}

struct Entry {
    tx: oneshot::Sender<Result<()>>,
    timer: AbortHandle,
}

/// Table of pending operations, shared across the dispatcher and the
/// components that issue requests.
pub struct PendingTable {
    timeout: Duration,
    inner: Mutex<HashMap<PendingKey, Entry>>,
}

impl PendingTable {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            timeout,
            inner: Mutex::new(HashMap::new()),
        })
    }

    /// Register a pending operation and arm its timer. The returned channel
    /// resolves exactly once: with the reply outcome, a timeout, or a
    /// supersession.
    pub fn register(self: &Arc<Self>, key: PendingKey) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();

        let table = Arc::clone(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(table.timeout).await;
            table.expire(key);
        })
        .abort_handle();

        let old = self
            .inner
            .lock()
            .expect("poisoned lock")
            .insert(key, Entry { tx, timer });
        if let Some(old) = old {
            old.timer.abort();
            let _ = old.tx.send(Err(NodeError::Superseded));
        }

        rx
    }

    /// Complete a pending operation with the given outcome. Returns false if
    /// no operation is registered under the key (a valid "too late"
    /// condition).
    pub fn complete(&self, key: PendingKey, result: Result<()>) -> bool {
        let entry = self.inner.lock().expect("poisoned lock").remove(&key);
        match entry {
            Some(entry) => {
                entry.timer.abort();
                let _ = entry.tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Timer path: completes with a timeout without touching the (already
    /// firing) timer task.
    fn expire(&self, key: PendingKey) {
        if let Some(entry) = self.inner.lock().expect("poisoned lock").remove(&key) {
            log::debug!(
                "request ({},{}{}) timed out",
                key.conn,
                key.circuit,
                key.stream
                    .map(|s| format!(",{}", s))
                    .unwrap_or_default()
            );
            let _ = entry.tx.send(Err(NodeError::Timeout));
        }
    }

    /// Fail every outstanding operation. Used on restart.
    pub fn clear(&self) {
        let entries: Vec<Entry> = {
            let mut inner = self.inner.lock().expect("poisoned lock");
            inner.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.timer.abort();
            let _ = entry.tx.send(Err(NodeError::CircuitClosed));
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("poisoned lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_once_after_interval() {
        let table = PendingTable::new(Duration::from_secs(3));
        let key = PendingKey::circuit(1, 101);
        let rx = table.register(key);

        let started = tokio::time::Instant::now();
        let outcome = rx.await.expect("sender dropped");
        assert_eq!(outcome, Err(NodeError::Timeout));
        assert_eq!(started.elapsed(), Duration::from_secs(3));

        // Terminal: the entry is gone, a late reply is a no-op.
        assert!(!table.complete(key, Ok(())));
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_cancels_timer() {
        let table = PendingTable::new(Duration::from_secs(3));
        let key = PendingKey::stream(1, 101, 5);
        let rx = table.register(key);

        assert!(table.complete(key, Ok(())));
        assert_eq!(rx.await.expect("sender dropped"), Ok(()));

        // Long after the timer would have fired, nothing is left behind.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_supersedes_existing_key() {
        let table = PendingTable::new(Duration::from_secs(3));
        let key = PendingKey::circuit(2, 4);

        let first = table.register(key);
        let second = table.register(key);

        assert_eq!(first.await.expect("sender dropped"), Err(NodeError::Superseded));
        assert!(table.complete(key, Ok(())));
        assert_eq!(second.await.expect("sender dropped"), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_fails_outstanding() {
        let table = PendingTable::new(Duration::from_secs(3));
        let rx = table.register(PendingKey::circuit(1, 1));
        table.clear();
        assert_eq!(rx.await.expect("sender dropped"), Err(NodeError::CircuitClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_timers() {
        let table = PendingTable::new(Duration::from_secs(3));
        let a = table.register(PendingKey::circuit(1, 1));
        tokio::time::sleep(Duration::from_secs(1)).await;
        let b = table.register(PendingKey::circuit(1, 3));

        // Completing b does not disturb a's timer.
        assert!(table.complete(PendingKey::circuit(1, 3), Ok(())));
        assert_eq!(b.await.expect("sender dropped"), Ok(()));
        assert_eq!(a.await.expect("sender dropped"), Err(NodeError::Timeout));
    }
}
