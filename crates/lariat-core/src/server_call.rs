//! Server side of a call: response-header sequencing, single-shot finish,
//! and a close watcher that surfaces client cancellation and deadline
//! expiry to the handler as a cancellation token.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::debug;

use crate::batch::{BatchOutcome, Op, WriteFlags};
use crate::cancel::{new_cancel_pair, CancelReason, CancelToken};
use crate::completion::PendingTracker;
use crate::deadline::Deadline;
use crate::environment::Environment;
use crate::error::{Result, RpcError, UsageError};
use crate::metadata::Metadata;
use crate::propagation::{PropagationOptions, PropagationToken};
use crate::status::{Status, StatusCode};
use crate::transport::{CallHandle, IncomingCall};

#[derive(Default)]
struct ServerFlags {
    headers_sent: bool,
    wrote_message: bool,
    write_pending: bool,
    read_pending: bool,
    reads_done: bool,
    finished: bool,
}

struct ServerCallInner {
    env: Arc<Environment>,
    tracker: Arc<PendingTracker>,
    handle: CallHandle,
    method: String,
    request_headers: Metadata,
    deadline: Deadline,
    flags: Mutex<ServerFlags>,
    cancel_token: CancelToken,
}

impl ServerCallInner {
    async fn run_batch(&self, ops: Vec<Op>) -> BatchOutcome {
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

    fn failure(&self, outcome: &BatchOutcome) -> RpcError {
        let status = outcome
            .status
            .clone()
            .or_else(|| self.handle.terminal_status())
            .unwrap_or_else(|| Status::cancelled("call terminated"));
        RpcError::Status(status)
    }
}

/// An accepted call being served. Clones share the same underlying call.
#[derive(Clone)]
pub struct ServerCall {
    inner: Arc<ServerCallInner>,
}

impl ServerCall {
    pub(crate) fn accept(
        env: Arc<Environment>,
        tracker: Arc<PendingTracker>,
        incoming: IncomingCall,
    ) -> ServerCall {
        let (cancel_token, cancel_handle) = new_cancel_pair();
        let inner = Arc::new(ServerCallInner {
            env,
            tracker,
            handle: incoming.handle,
            method: incoming.method,
            request_headers: incoming.headers,
            deadline: incoming.deadline,
            flags: Mutex::new(ServerFlags::default()),
            cancel_token,
        });

        // Close watcher: resolves once the call ends, and trips the
        // handler's cancellation token when it ended abnormally.
        {
            let inner = inner.clone();
            inner.clone().env.spawn(async move {
                let outcome = inner.run_batch(vec![Op::RecvCloseOnServer]).await;
                if outcome.cancelled {
                    let reason = match inner.handle.terminal_status() {
                        Some(status) if status.code() == StatusCode::DeadlineExceeded => {
                            CancelReason::DeadlineExceeded
                        }
                        _ => CancelReason::UserRequested,
                    };
                    debug!(method = %inner.method, ?reason, "serving call cancelled");
                    cancel_handle.cancel(reason);
                }
            });
        }

        ServerCall { inner }
    }

    /// Full method name the client invoked.
    pub fn method(&self) -> &str {
        &self.inner.method
    }

    /// Headers the client sent with the call.
    pub fn request_headers(&self) -> &Metadata {
        &self.inner.request_headers
    }

    /// Deadline the client transmitted.
    pub fn deadline(&self) -> Deadline {
        self.inner.deadline
    }

    /// Fires when the client cancels or the deadline expires.
    pub fn cancellation_token(&self) -> CancelToken {
        self.inner.cancel_token.clone()
    }

    /// A token that lets a nested outbound call inherit this call's
    /// deadline and cancellation.
    pub fn propagation_token(&self, options: PropagationOptions) -> PropagationToken {
        PropagationToken::new(self.inner.deadline, self.inner.cancel_token.clone(), options)
    }

    /// Sends response headers explicitly. Must happen before the first
    /// response message, and at most once.
    pub async fn send_headers(&self, headers: Metadata) -> Result<()> {
        {
            let mut st = self.inner.flags.lock().unwrap();
            if st.finished {
                return Err(UsageError::AlreadyFinished.into());
            }
            if st.wrote_message {
                return Err(UsageError::HeadersAfterFirstWrite.into());
            }
            if st.headers_sent {
                return Err(UsageError::HeadersAlreadySent.into());
            }
            st.headers_sent = true;
        }
        let outcome = self
            .inner
            .run_batch(vec![Op::SendInitialMetadata(headers)])
            .await;
        if outcome.success {
            Ok(())
        } else {
            Err(self.inner.failure(&outcome))
        }
    }

    /// Sends one response message. Empty headers are sent implicitly if the
    /// handler never sent them.
    pub async fn send_message(&self, payload: Bytes) -> Result<()> {
        self.send_message_with_flags(payload, WriteFlags::default())
            .await
    }

    /// Sends one response message with explicit write flags.
    pub async fn send_message_with_flags(
        &self,
        payload: Bytes,
        flags: WriteFlags,
    ) -> Result<()> {
        let send_headers;
        {
            let mut st = self.inner.flags.lock().unwrap();
            if st.finished {
                return Err(UsageError::AlreadyFinished.into());
            }
            if st.write_pending {
                return Err(UsageError::ConcurrentWrite.into());
            }
            send_headers = !st.headers_sent;
            st.headers_sent = true;
            st.wrote_message = true;
            st.write_pending = true;
        }
        let mut ops = Vec::with_capacity(2);
        if send_headers {
            ops.push(Op::SendInitialMetadata(Metadata::new()));
        }
        ops.push(Op::SendMessage(payload, flags));
        let outcome = self.inner.run_batch(ops).await;
        self.inner.flags.lock().unwrap().write_pending = false;
        if outcome.success {
            Ok(())
        } else {
            Err(self.inner.failure(&outcome))
        }
    }

    /// Receives the next request message. Returns `None` once the client
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

    /// Ends the call with `status` and trailing metadata. May be called at
    /// most once.
    pub async fn finish(&self, status: Status, trailers: Metadata) -> Result<()> {
        let send_headers;
        {
            let mut st = self.inner.flags.lock().unwrap();
            if st.finished {
                return Err(UsageError::AlreadyFinished.into());
            }
            if st.write_pending {
                return Err(UsageError::ConcurrentWrite.into());
            }
            send_headers = !st.headers_sent;
            st.headers_sent = true;
            st.finished = true;
        }
        let mut ops = Vec::with_capacity(2);
        if send_headers {
            ops.push(Op::SendInitialMetadata(Metadata::new()));
        }
        ops.push(Op::SendStatusFromServer(status, trailers));
        let outcome = self.inner.run_batch(ops).await;
        if outcome.success {
            Ok(())
        } else {
            Err(self.inner.failure(&outcome))
        }
    }

    /// Whether `finish` has been called.
    pub fn is_finished(&self) -> bool {
        self.inner.flags.lock().unwrap().finished
    }

    pub(crate) fn abort(&self, status: Status) {
        self.inner.handle.cancel(status);
    }
}

impl std::fmt::Debug for ServerCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerCall")
            .field("method", &self.inner.method)
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}
