//! One-shot, many-observer cancellation signals.
//!
//! Once set, a signal never resets. Registering an observer after the
//! signal is already set invokes the observer immediately, so there is no
//! missed-signal race. Parent/child wiring is one-way: cancelling a parent
//! cancels its children, never the reverse.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

/// Why a call was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelReason {
    /// Explicit cancellation by the application.
    #[default]
    UserRequested,
    /// The call's deadline expired.
    DeadlineExceeded,
    /// The parent call's signal propagated down.
    ParentCancelled,
    /// The owning channel was shut down.
    ChannelShutdown,
    /// The server was shut down.
    ServerShutdown,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::UserRequested => write!(f, "UserRequested"),
            CancelReason::DeadlineExceeded => write!(f, "DeadlineExceeded"),
            CancelReason::ParentCancelled => write!(f, "ParentCancelled"),
            CancelReason::ChannelShutdown => write!(f, "ChannelShutdown"),
            CancelReason::ServerShutdown => write!(f, "ServerShutdown"),
        }
    }
}

type Observer = Box<dyn FnOnce(CancelReason) + Send + 'static>;

struct Shared {
    cancelled: AtomicBool,
    // reason and observers share one lock; cancel() linearizes against
    // on_cancel() through it.
    pending: Mutex<PendingState>,
    changed_tx: watch::Sender<bool>,
    // Keeps the watch channel alive even with no external waiters.
    _changed_rx: watch::Receiver<bool>,
}

struct PendingState {
    reason: Option<CancelReason>,
    observers: Vec<Observer>,
}

/// Observer half of a cancellation signal. Cloneable.
#[derive(Clone)]
pub struct CancelToken {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("reason", &self.reason())
            .finish()
    }
}

/// Trigger half of a cancellation signal. Cloneable.
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<Shared>,
}

/// Creates a fresh token/handle pair.
pub fn new_cancel_pair() -> (CancelToken, CancelHandle) {
    let (changed_tx, changed_rx) = watch::channel(false);
    let shared = Arc::new(Shared {
        cancelled: AtomicBool::new(false),
        pending: Mutex::new(PendingState {
            reason: None,
            observers: Vec::new(),
        }),
        changed_tx,
        _changed_rx: changed_rx,
    });
    (
        CancelToken {
            shared: shared.clone(),
        },
        CancelHandle { shared },
    )
}

impl CancelToken {
    /// Returns `true` once the signal has been set.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// The reason the signal was set, if it has been.
    pub fn reason(&self) -> Option<CancelReason> {
        self.shared.pending.lock().unwrap().reason
    }

    /// Registers a one-shot observer.
    ///
    /// If the signal is already set the observer runs immediately on the
    /// calling thread.
    pub fn on_cancel(&self, observer: impl FnOnce(CancelReason) + Send + 'static) {
        let fire_now = {
            let mut pending = self.shared.pending.lock().unwrap();
            if self.shared.cancelled.load(Ordering::SeqCst) {
                pending.reason
            } else {
                pending.observers.push(Box::new(observer));
                return;
            }
        };
        observer(fire_now.unwrap_or_default());
    }

    /// Waits until the signal is set. Returns immediately if it already is.
    pub async fn cancelled(&self) -> CancelReason {
        if !self.is_cancelled() {
            let mut rx = self.shared.changed_tx.subscribe();
            // wait_for returns immediately when the value already satisfies
            // the predicate, covering the set-before-subscribe race.
            let _ = rx.wait_for(|set| *set).await;
        }
        self.reason().unwrap_or_default()
    }

    /// Creates a child signal cancelled when this one is; cancelling the
    /// child never affects this signal.
    pub fn child(&self) -> (CancelToken, CancelHandle) {
        let (token, handle) = new_cancel_pair();
        let child_handle = handle.clone();
        self.on_cancel(move |_| child_handle.cancel(CancelReason::ParentCancelled));
        (token, handle)
    }
}

impl CancelHandle {
    /// Sets the signal with the given reason. Only the first call has any
    /// effect; the recorded reason never changes afterwards.
    pub fn cancel(&self, reason: CancelReason) {
        let observers = {
            let mut pending = self.shared.pending.lock().unwrap();
            if self.shared.cancelled.swap(true, Ordering::SeqCst) {
                return;
            }
            pending.reason = Some(reason);
            std::mem::take(&mut pending.observers)
        };
        for observer in observers {
            observer(reason);
        }
        self.shared.changed_tx.send_replace(true);
    }

    /// Returns `true` once the signal has been set.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// A token observing this handle's signal.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            shared: self.shared.clone(),
        }
    }
}
