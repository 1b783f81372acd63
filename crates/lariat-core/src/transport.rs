//! In-process transport fabric.
//!
//! Presents the same interface an opaque native async engine would: "start
//! operation batch" going in, completion events coming out of a shared
//! event queue. Wire framing and TLS are out of scope; the fabric routes
//! batches between the two halves of a call pair and parks receive
//! operations until the peer produces what they wait for.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use crossbeam_channel::Sender;
use tokio::sync::watch;
use tracing::debug;

use crate::batch::{BatchOutcome, CompletionEvent, Op};
use crate::completion::CompletionKey;
use crate::deadline::Deadline;
use crate::environment::EngineEvent;
use crate::error::UsageError;
use crate::metadata::Metadata;
use crate::status::Status;

/// Which half of a call pair a handle drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Client,
    Server,
}

/// One direction of message flow within a call pair.
#[derive(Default)]
struct DirState {
    queue: VecDeque<Bytes>,
    closed: bool,
    parked_recv: Option<CompletionKey>,
}

struct PairState {
    response_headers: Option<Metadata>,
    parked_headers: Option<CompletionKey>,
    client_to_server: DirState,
    server_to_client: DirState,
    status: Option<Status>,
    trailers: Metadata,
    parked_status: Option<CompletionKey>,
    parked_close: Option<CompletionKey>,
    cancelled: bool,
}

/// Shared state of one logical call, owned jointly by its two handles.
pub(crate) struct CallPair {
    state: Mutex<PairState>,
    events_tx: Sender<EngineEvent>,
}

impl CallPair {
    fn new(events_tx: Sender<EngineEvent>) -> Arc<Self> {
        Arc::new(CallPair {
            state: Mutex::new(PairState {
                response_headers: None,
                parked_headers: None,
                client_to_server: DirState::default(),
                server_to_client: DirState::default(),
                status: None,
                trailers: Metadata::new(),
                parked_status: None,
                parked_close: None,
                cancelled: false,
            }),
            events_tx,
        })
    }

    fn emit(&self, key: CompletionKey, outcome: BatchOutcome) {
        // The queue is unbounded; send never blocks. Sending while the
        // pair lock is held keeps event order consistent with state order.
        let _ = self
            .events_tx
            .send(EngineEvent::Completion(CompletionEvent { key, outcome }));
    }
}

/// Engine-side handle for one half of a call.
#[derive(Clone)]
pub(crate) struct CallHandle {
    pair: Arc<CallPair>,
    side: Side,
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle").field("side", &self.side).finish()
    }
}

impl CallHandle {
    /// Starts an operation batch. The batch resolves through the
    /// environment's event queue, either immediately or when the peer
    /// unblocks a parked receive.
    pub(crate) fn start_batch(&self, key: CompletionKey, ops: Vec<Op>) {
        let mut st = self.pair.state.lock().unwrap();
        let mut self_resolving = false;
        let mut failure: Option<Status> = None;
        for op in ops {
            if failure.is_some() {
                break;
            }
            match op {
                Op::SendInitialMetadata(md) => {
                    if st.status.is_some() {
                        failure = st.status.clone();
                        continue;
                    }
                    st.response_headers = Some(md.clone());
                    if let Some(waiter) = st.parked_headers.take() {
                        self.pair.emit(
                            waiter,
                            BatchOutcome {
                                success: true,
                                metadata: Some(md),
                                ..Default::default()
                            },
                        );
                    }
                }
                Op::SendMessage(payload, _flags) => {
                    if st.status.is_some() {
                        failure = st.status.clone();
                        continue;
                    }
                    let dir = match self.side {
                        Side::Client => &mut st.client_to_server,
                        Side::Server => &mut st.server_to_client,
                    };
                    if dir.closed {
                        failure = Some(Status::internal("send after half-close"));
                        continue;
                    }
                    if let Some(waiter) = dir.parked_recv.take() {
                        self.pair.emit(
                            waiter,
                            BatchOutcome {
                                success: true,
                                message: Some(payload),
                                ..Default::default()
                            },
                        );
                    } else {
                        dir.queue.push_back(payload);
                    }
                }
                Op::SendCloseFromClient => {
                    st.client_to_server.closed = true;
                    if st.client_to_server.queue.is_empty() {
                        if let Some(waiter) = st.client_to_server.parked_recv.take() {
                            self.pair.emit(
                                waiter,
                                BatchOutcome {
                                    success: true,
                                    message: None,
                                    ..Default::default()
                                },
                            );
                        }
                    }
                }
                Op::SendStatusFromServer(status, trailers) => {
                    if st.status.is_some() {
                        failure = st.status.clone();
                        continue;
                    }
                    st.status = Some(status.clone());
                    st.trailers = trailers.clone();
                    st.server_to_client.closed = true;
                    if let Some(waiter) = st.parked_status.take() {
                        self.pair.emit(
                            waiter,
                            BatchOutcome {
                                success: true,
                                status: Some(status.clone()),
                                trailers: Some(trailers),
                                ..Default::default()
                            },
                        );
                    }
                    if let Some(waiter) = st.parked_headers.take() {
                        let md = st.response_headers.clone().unwrap_or_default();
                        self.pair.emit(
                            waiter,
                            BatchOutcome {
                                success: true,
                                metadata: Some(md),
                                ..Default::default()
                            },
                        );
                    }
                    if st.server_to_client.queue.is_empty() {
                        if let Some(waiter) = st.server_to_client.parked_recv.take() {
                            self.pair.emit(
                                waiter,
                                BatchOutcome {
                                    success: true,
                                    message: None,
                                    ..Default::default()
                                },
                            );
                        }
                    }
                    if let Some(waiter) = st.parked_close.take() {
                        self.pair.emit(
                            waiter,
                            BatchOutcome {
                                success: true,
                                cancelled: false,
                                ..Default::default()
                            },
                        );
                    }
                }
                Op::RecvMessage => {
                    if st.cancelled {
                        let status = st.status.clone();
                        self.pair.emit(key, BatchOutcome::failed(status, true));
                        self_resolving = true;
                        continue;
                    }
                    let status_seen = st.status.is_some();
                    let dir = match self.side {
                        Side::Client => &mut st.server_to_client,
                        Side::Server => &mut st.client_to_server,
                    };
                    if let Some(payload) = dir.queue.pop_front() {
                        self.pair.emit(
                            key,
                            BatchOutcome {
                                success: true,
                                message: Some(payload),
                                ..Default::default()
                            },
                        );
                        self_resolving = true;
                    } else if dir.closed || (self.side == Side::Client && status_seen) {
                        self.pair.emit(
                            key,
                            BatchOutcome {
                                success: true,
                                message: None,
                                ..Default::default()
                            },
                        );
                        self_resolving = true;
                    } else {
                        assert!(dir.parked_recv.is_none(), "two reads pending on one direction");
                        dir.parked_recv = Some(key);
                        self_resolving = true;
                    }
                }
                Op::RecvInitialMetadata => {
                    if let Some(md) = st.response_headers.clone() {
                        self.pair.emit(
                            key,
                            BatchOutcome {
                                success: true,
                                metadata: Some(md),
                                ..Default::default()
                            },
                        );
                    } else if st.cancelled {
                        let status = st.status.clone();
                        self.pair.emit(key, BatchOutcome::failed(status, true));
                    } else if st.status.is_some() {
                        self.pair.emit(
                            key,
                            BatchOutcome {
                                success: true,
                                metadata: Some(Metadata::new()),
                                ..Default::default()
                            },
                        );
                    } else {
                        assert!(st.parked_headers.is_none());
                        st.parked_headers = Some(key);
                    }
                    self_resolving = true;
                }
                Op::RecvStatusOnClient => {
                    if let Some(status) = st.status.clone() {
                        let trailers = st.trailers.clone();
                        self.pair.emit(
                            key,
                            BatchOutcome {
                                success: true,
                                status: Some(status),
                                trailers: Some(trailers),
                                cancelled: st.cancelled,
                                ..Default::default()
                            },
                        );
                    } else {
                        assert!(st.parked_status.is_none());
                        st.parked_status = Some(key);
                    }
                    self_resolving = true;
                }
                Op::RecvCloseOnServer => {
                    if st.status.is_some() || st.cancelled {
                        self.pair.emit(
                            key,
                            BatchOutcome {
                                success: true,
                                cancelled: st.cancelled,
                                ..Default::default()
                            },
                        );
                    } else {
                        assert!(st.parked_close.is_none());
                        st.parked_close = Some(key);
                    }
                    self_resolving = true;
                }
            }
        }
        if !self_resolving {
            match failure {
                None => self.pair.emit(key, BatchOutcome::success()),
                Some(status) => self.pair.emit(key, BatchOutcome::failed(Some(status), false)),
            }
        }
    }

    /// Aborts the call with `status` unless a terminal status was already
    /// set. Returns `true` when this call set the status.
    pub(crate) fn cancel(&self, status: Status) -> bool {
        let mut st = self.pair.state.lock().unwrap();
        let st = &mut *st;
        if st.status.is_some() {
            return false;
        }
        st.status = Some(status.clone());
        st.cancelled = true;
        if let Some(waiter) = st.parked_status.take() {
            self.pair.emit(
                waiter,
                BatchOutcome {
                    success: true,
                    status: Some(status.clone()),
                    trailers: Some(Metadata::new()),
                    cancelled: true,
                    ..Default::default()
                },
            );
        }
        for dir in [&mut st.client_to_server, &mut st.server_to_client] {
            if let Some(waiter) = dir.parked_recv.take() {
                self.pair
                    .emit(waiter, BatchOutcome::failed(Some(status.clone()), true));
            }
        }
        if let Some(waiter) = st.parked_headers.take() {
            self.pair
                .emit(waiter, BatchOutcome::failed(Some(status.clone()), true));
        }
        if let Some(waiter) = st.parked_close.take() {
            self.pair.emit(
                waiter,
                BatchOutcome {
                    success: true,
                    cancelled: true,
                    ..Default::default()
                },
            );
        }
        true
    }

    /// The terminal status, if the call has one.
    pub(crate) fn terminal_status(&self) -> Option<Status> {
        self.pair.state.lock().unwrap().status.clone()
    }
}

/// A call newly delivered to a bound listener.
pub struct IncomingCall {
    /// Full method name, `/service/method` form.
    pub method: String,
    /// Request headers sent by the client.
    pub headers: Metadata,
    /// Effective deadline the client transmitted.
    pub deadline: Deadline,
    pub(crate) handle: CallHandle,
}

impl std::fmt::Debug for IncomingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingCall")
            .field("method", &self.method)
            .field("deadline", &self.deadline)
            .finish()
    }
}

struct ListenerState {
    closed: bool,
    parked_accepts: VecDeque<CompletionKey>,
    backlog: VecDeque<IncomingCall>,
    active: Vec<Weak<CallPair>>,
}

/// A bound server target accepting incoming calls.
pub(crate) struct Listener {
    target: String,
    state: Mutex<ListenerState>,
    events_tx: Sender<EngineEvent>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("target", &self.target)
            .finish()
    }
}

impl Listener {
    /// Registers a pending accept; resolves as soon as a call arrives, or
    /// with failure once the listener shuts down.
    pub(crate) fn request_call(&self, key: CompletionKey) {
        let mut st = self.state.lock().unwrap();
        if st.closed {
            let _ = self.events_tx.send(EngineEvent::Completion(CompletionEvent {
                key,
                outcome: BatchOutcome::failed(None, false),
            }));
            return;
        }
        if let Some(incoming) = st.backlog.pop_front() {
            let _ = self.events_tx.send(EngineEvent::Completion(CompletionEvent {
                key,
                outcome: BatchOutcome {
                    success: true,
                    incoming: Some(incoming),
                    ..Default::default()
                },
            }));
        } else {
            st.parked_accepts.push_back(key);
        }
    }

    /// Stops accepting, fails all parked accepts, and returns handles to
    /// every call still active so the caller can abort them.
    pub(crate) fn shutdown(&self) -> Vec<CallHandle> {
        let mut st = self.state.lock().unwrap();
        st.closed = true;
        st.backlog.clear();
        while let Some(key) = st.parked_accepts.pop_front() {
            let _ = self.events_tx.send(EngineEvent::Completion(CompletionEvent {
                key,
                outcome: BatchOutcome::failed(None, false),
            }));
        }
        debug!(target = %self.target, "listener shut down");
        st.active
            .drain(..)
            .filter_map(|weak| weak.upgrade())
            .map(|pair| CallHandle {
                pair,
                side: Side::Server,
            })
            .collect()
    }
}

/// Routing table of bound targets plus the event queue they feed.
pub(crate) struct Fabric {
    listeners: Mutex<HashMap<String, Arc<Listener>>>,
    bind_tx: watch::Sender<u64>,
    _bind_rx: watch::Receiver<u64>,
    events_tx: Sender<EngineEvent>,
}

impl Fabric {
    pub(crate) fn new(events_tx: Sender<EngineEvent>) -> Self {
        let (bind_tx, bind_rx) = watch::channel(0);
        Fabric {
            listeners: Mutex::new(HashMap::new()),
            bind_tx,
            _bind_rx: bind_rx,
            events_tx,
        }
    }

    /// Binds `target`, making it reachable by channels.
    pub(crate) fn bind(&self, target: &str) -> Result<Arc<Listener>, UsageError> {
        let mut listeners = self.listeners.lock().unwrap();
        if listeners.contains_key(target) {
            return Err(UsageError::TargetAlreadyBound(target.to_string()));
        }
        let listener = Arc::new(Listener {
            target: target.to_string(),
            state: Mutex::new(ListenerState {
                closed: false,
                parked_accepts: VecDeque::new(),
                backlog: VecDeque::new(),
                active: Vec::new(),
            }),
            events_tx: self.events_tx.clone(),
        });
        listeners.insert(target.to_string(), listener.clone());
        drop(listeners);
        self.bind_tx.send_modify(|seq| *seq += 1);
        debug!(target, "target bound");
        Ok(listener)
    }

    /// Removes `target` from the routing table.
    pub(crate) fn unbind(&self, target: &str) {
        self.listeners.lock().unwrap().remove(target);
    }

    /// Whether `target` is currently bound and accepting.
    pub(crate) fn is_reachable(&self, target: &str) -> bool {
        let listeners = self.listeners.lock().unwrap();
        listeners
            .get(target)
            .map(|l| !l.state.lock().unwrap().closed)
            .unwrap_or(false)
    }

    /// A receiver that observes every new bind, for connect waits.
    pub(crate) fn bind_watch(&self) -> watch::Receiver<u64> {
        self.bind_tx.subscribe()
    }

    /// Routes a new call to `target`. Returns the client-side handle, or
    /// `None` when the target is not reachable.
    pub(crate) fn start_call(
        &self,
        target: &str,
        method: &str,
        headers: Metadata,
        deadline: Deadline,
    ) -> Option<CallHandle> {
        let listener = self.listeners.lock().unwrap().get(target).cloned()?;
        let mut st = listener.state.lock().unwrap();
        if st.closed {
            return None;
        }
        let pair = CallPair::new(self.events_tx.clone());
        st.active.retain(|weak| weak.strong_count() > 0);
        st.active.push(Arc::downgrade(&pair));
        let incoming = IncomingCall {
            method: method.to_string(),
            headers,
            deadline,
            handle: CallHandle {
                pair: pair.clone(),
                side: Side::Server,
            },
        };
        if let Some(key) = st.parked_accepts.pop_front() {
            let _ = self.events_tx.send(EngineEvent::Completion(CompletionEvent {
                key,
                outcome: BatchOutcome {
                    success: true,
                    incoming: Some(incoming),
                    ..Default::default()
                },
            }));
        } else {
            st.backlog.push_back(incoming);
        }
        Some(CallHandle {
            pair,
            side: Side::Client,
        })
    }
}
