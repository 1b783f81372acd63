//! Client side of a call: strict pending-operation bookkeeping over the
//! transport batches, a perpetual status receive that latches the terminal
//! outcome, and a deadline watchdog that cancels the call on expiry.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{oneshot, watch};
use tracing::debug;

use crate::batch::{BatchOutcome, Op, WriteFlags};
use crate::cancel::CancelReason;
use crate::completion::PendingTracker;
use crate::deadline::Deadline;
use crate::environment::Environment;
use crate::error::{Result, RpcError, UsageError};
use crate::metadata::Metadata;
use crate::options::ResolvedCallOptions;
use crate::status::Status;
use crate::transport::CallHandle;

/// Terminal outcome of a client call.
#[derive(Debug, Clone)]
pub struct Terminal {
    /// Final status.
    pub status: Status,
    /// Trailing metadata the server attached to the status.
    pub trailers: Metadata,
}

#[derive(Default)]
struct CallFlags {
    write_pending: bool,
    read_pending: bool,
    writes_done: bool,
    reads_done: bool,
}

struct CallInner {
    env: Arc<Environment>,
    tracker: Arc<PendingTracker>,
    handle: CallHandle,
    method: String,
    deadline: Deadline,
    default_write_flags: WriteFlags,
    flags: Mutex<CallFlags>,
    terminal_tx: watch::Sender<Option<Terminal>>,
    headers_tx: watch::Sender<Option<Option<Metadata>>>,
}

impl CallInner {
    async fn run_batch(self: &Arc<Self>, ops: Vec<Op>) -> BatchOutcome {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let registry = self.env.registry();
        let key = registry.allocate_key();
        let guard = self.tracker.begin();
        registry.register(
            key,
            Box::new(move |outcome| {
                let _guard = guard;
                let _ = outcome_tx.send(outcome);
            }),
        );
        self.handle.start_batch(key, ops);
        outcome_rx
            .await
            .unwrap_or_else(|_| BatchOutcome::failed(None, true))
    }

    /// Maps a failed batch outcome onto the call's terminal status.
    fn failure(&self, outcome: &BatchOutcome) -> RpcError {
        let status = outcome
            .status
            .clone()
            .or_else(|| self.terminal_tx.borrow().as_ref().map(|t| t.status.clone()))
            .unwrap_or_else(|| Status::cancelled("call terminated"));
        RpcError::Status(status)
    }

    fn cancel_with(&self, status: Status) {
        if self.handle.cancel(status) {
            debug!(method = %self.method, "call cancelled");
        }
    }
}

/// An in-flight client call.
pub struct ClientCall {
    inner: Arc<CallInner>,
}

impl ClientCall {
    pub(crate) fn start(
        env: Arc<Environment>,
        tracker: Arc<PendingTracker>,
        handle: CallHandle,
        method: String,
        options: &ResolvedCallOptions,
    ) -> ClientCall {
        let (terminal_tx, _) = watch::channel(None);
        let (headers_tx, _) = watch::channel(None);
        let inner = Arc::new(CallInner {
            env,
            tracker,
            handle,
            method,
            deadline: options.deadline,
            default_write_flags: options.write_flags,
            flags: Mutex::new(CallFlags::default()),
            terminal_tx,
            headers_tx,
        });

        // Perpetual status receive: latches the terminal outcome however the
        // call ends.
        {
            let inner = inner.clone();
            inner.clone().env.spawn(async move {
                let outcome = inner.run_batch(vec![Op::RecvStatusOnClient]).await;
                let status = outcome
                    .status
                    .clone()
                    .unwrap_or_else(|| Status::cancelled("call terminated"));
                let trailers = outcome.trailers.clone().unwrap_or_default();
                inner
                    .terminal_tx
                    .send_replace(Some(Terminal { status, trailers }));
            });
        }

        // Response headers are requested up front so readers never race the
        // first message for them.
        {
            let inner = inner.clone();
            inner.clone().env.spawn(async move {
                let outcome = inner.run_batch(vec![Op::RecvInitialMetadata]).await;
                let headers = if outcome.success {
                    Some(outcome.metadata.unwrap_or_default())
                } else {
                    None
                };
                inner.headers_tx.send_replace(Some(headers));
            });
        }

        if let Some(expiry) = inner.deadline.instant() {
            let watchdog = inner.clone();
            inner.clone().env.spawn(async move {
                let mut terminal_rx = watchdog.terminal_tx.subscribe();
                tokio::select! {
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(expiry)) => {
                        watchdog.cancel_with(Status::deadline_exceeded("deadline exceeded"));
                    }
                    _ = terminal_rx.wait_for(|t| t.is_some()) => {}
                }
            });
        }

        if let Some(token) = &options.cancel {
            let target = inner.clone();
            token.on_cancel(move |reason| {
                let status = match reason {
                    CancelReason::DeadlineExceeded => {
                        Status::deadline_exceeded("deadline exceeded")
                    }
                    _ => Status::cancelled("cancelled by caller"),
                };
                target.cancel_with(status);
            });
        }

        ClientCall { inner }
    }

    /// Full method name this call targets.
    pub fn method(&self) -> &str {
        &self.inner.method
    }

    /// Effective deadline.
    pub fn deadline(&self) -> Deadline {
        self.inner.deadline
    }

    /// Sends one message with the call's default write flags.
    pub async fn send_message(&self, payload: Bytes) -> Result<()> {
        self.send_message_with_flags(payload, self.inner.default_write_flags)
            .await
    }

    /// Sends one message. At most one write may be pending at a time.
    pub async fn send_message_with_flags(
        &self,
        payload: Bytes,
        flags: WriteFlags,
    ) -> Result<()> {
        {
            let mut st = self.inner.flags.lock().unwrap();
            if st.writes_done {
                return Err(UsageError::WritesAlreadyCompleted.into());
            }
            if st.write_pending {
                return Err(UsageError::ConcurrentWrite.into());
            }
            if let Some(terminal) = self.inner.terminal_tx.borrow().as_ref() {
                return Err(RpcError::Status(terminal.status.clone()));
            }
            st.write_pending = true;
        }
        let outcome = self
            .inner
            .run_batch(vec![Op::SendMessage(payload, flags)])
            .await;
        self.inner.flags.lock().unwrap().write_pending = false;
        if outcome.success {
            Ok(())
        } else {
            Err(self.inner.failure(&outcome))
        }
    }

    /// Half-closes the outgoing direction. Completing twice is a usage
    /// error; completing after the call already ended is a no-op.
    pub async fn complete_writes(&self) -> Result<()> {
        {
            let mut st = self.inner.flags.lock().unwrap();
            if st.writes_done {
                return Err(UsageError::WritesAlreadyCompleted.into());
            }
            if st.write_pending {
                return Err(UsageError::ConcurrentWrite.into());
            }
            st.writes_done = true;
        }
        if self.inner.terminal_tx.borrow().is_some() {
            return Ok(());
        }
        // A failure here means the call terminated while the half-close was
        // in flight; there is nothing left to deliver either way.
        let _ = self.inner.run_batch(vec![Op::SendCloseFromClient]).await;
        Ok(())
    }

    /// Receives the next response message. Returns `None` once the server
    /// half-closed; reading past that point is a usage error.
    pub async fn read_next(&self) -> Result<Option<Bytes>> {
        {
            let mut st = self.inner.flags.lock().unwrap();
            if st.reads_done {
                return Err(UsageError::ReadAfterEndOfStream.into());
            }
            if st.read_pending {
                return Err(UsageError::ConcurrentRead.into());
            }
            st.read_pending = true;
        }
        let outcome = self.inner.run_batch(vec![Op::RecvMessage]).await;
        {
            let mut st = self.inner.flags.lock().unwrap();
            st.read_pending = false;
            if outcome.success && outcome.message.is_none() {
                st.reads_done = true;
            }
        }
        if outcome.success {
            Ok(outcome.message)
        } else {
            Err(self.inner.failure(&outcome))
        }
    }

    /// Response headers, once the server sends them. Fails with the
    /// terminal status when the call ends without headers.
    pub async fn response_headers(&self) -> Result<Metadata> {
        let mut rx = self.inner.headers_tx.subscribe();
        let resolved = match rx.wait_for(|v| v.is_some()).await {
            Ok(value) => value.clone().flatten(),
            Err(_) => None,
        };
        match resolved {
            Some(headers) => Ok(headers),
            None => Err(RpcError::Status(self.finished().await.status)),
        }
    }

    /// Waits for the call to end and returns its terminal outcome.
    pub async fn finished(&self) -> Terminal {
        let mut rx = self.inner.terminal_tx.subscribe();
        let resolved = match rx.wait_for(|t| t.is_some()).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        resolved.unwrap_or(Terminal {
            status: Status::cancelled("call terminated"),
            trailers: Metadata::new(),
        })
    }

    /// Terminal status, if the call has already ended.
    pub fn terminal_status(&self) -> Option<Status> {
        self.inner
            .terminal_tx
            .borrow()
            .as_ref()
            .map(|t| t.status.clone())
    }

    /// Cancels the call locally. A no-op once the call has a terminal
    /// status.
    pub fn cancel(&self) {
        self.inner
            .cancel_with(Status::cancelled("cancelled by caller"));
    }

    pub(crate) fn cancel_with_status(&self, status: Status) {
        self.inner.cancel_with(status);
    }
}

impl Drop for ClientCall {
    fn drop(&mut self) {
        // Abandoning a live call cancels it so the server is not left
        // holding the other half open.
        if self.inner.handle.terminal_status().is_none() {
            self.inner
                .cancel_with(Status::cancelled("call handle dropped"));
        }
    }
}

impl std::fmt::Debug for ClientCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCall")
            .field("method", &self.inner.method)
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}
