//! The completion-dispatch registry.
//!
//! Associates opaque completion keys with pending continuations and resolves
//! each exactly once when the transport engine reports completion. This is
//! the sole synchronization point between poller threads and
//! application-facing code; the map is lock-protected and linearizable, so a
//! continuation can never be invoked twice or never.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::batch::BatchOutcome;

/// Opaque key identifying one pending operation batch.
///
/// Used only for lookup; never dereferenced or interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionKey(u64);

impl CompletionKey {
    /// Raw value, for logging only.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// A pending continuation, invoked with the batch outcome on the worker
/// pool once the transport engine reports completion.
pub type Continuation = Box<dyn FnOnce(BatchOutcome) + Send + 'static>;

/// Registry mapping completion keys to pending continuations.
pub struct CompletionRegistry {
    pending: Mutex<HashMap<u64, Continuation>>,
    next_key: AtomicU64,
}

impl Default for CompletionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_key: AtomicU64::new(1),
        }
    }

    /// Allocates a fresh, never-before-used key.
    pub fn allocate_key(&self) -> CompletionKey {
        CompletionKey(self.next_key.fetch_add(1, Ordering::Relaxed))
    }

    /// Associates `key` with `continuation`.
    ///
    /// # Panics
    ///
    /// Panics if `key` is already registered; that is an invariant
    /// violation, not a recoverable error.
    pub fn register(&self, key: CompletionKey, continuation: Continuation) {
        let mut pending = self.pending.lock().unwrap();
        let previous = pending.insert(key.0, continuation);
        assert!(
            previous.is_none(),
            "completion key {} registered twice",
            key.0
        );
    }

    /// Atomically removes and returns the continuation for `key`.
    ///
    /// # Panics
    ///
    /// Panics if `key` is unknown; exactly one resolve must occur per
    /// register, driven by exactly one completion event.
    pub fn resolve(&self, key: CompletionKey) -> Continuation {
        let mut pending = self.pending.lock().unwrap();
        match pending.remove(&key.0) {
            Some(continuation) => continuation,
            None => panic!("completion key {} resolved without registration", key.0),
        }
    }

    /// Number of registered-but-unresolved entries.
    ///
    /// Channel and server shutdown must not proceed while any of their
    /// entries remain unresolved.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

/// Counts the unresolved completions belonging to one channel or server so
/// its shutdown can wait for them to drain.
pub(crate) struct PendingTracker {
    count: std::sync::atomic::AtomicUsize,
    drained: tokio::sync::Notify,
}

impl PendingTracker {
    pub(crate) fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(PendingTracker {
            count: std::sync::atomic::AtomicUsize::new(0),
            drained: tokio::sync::Notify::new(),
        })
    }

    /// Marks one completion outstanding; the guard releases it when the
    /// continuation has run.
    pub(crate) fn begin(self: &std::sync::Arc<Self>) -> PendingGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        PendingGuard {
            tracker: self.clone(),
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Waits until every outstanding completion has resolved.
    pub(crate) async fn drained(&self) {
        loop {
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.drained.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// RAII marker for one outstanding completion.
pub(crate) struct PendingGuard {
    tracker: std::sync::Arc<PendingTracker>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.tracker.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.drained.notify_waiters();
        }
    }
}
