//! Operation batches issued to the transport engine and the completion
//! events it reports back.

use bytes::Bytes;

use crate::completion::CompletionKey;
use crate::metadata::Metadata;
use crate::status::Status;
use crate::transport::IncomingCall;

/// Flags controlling a single outbound message. Attached per message, not
/// per call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteFlags {
    /// Hint that the engine may buffer this message instead of flushing.
    pub buffer_hint: bool,
    /// Disable compression for this message only.
    pub no_compress: bool,
}

/// A single transport-level action within a batch.
#[derive(Debug, Clone)]
pub enum Op {
    /// Send initial metadata (request headers client-side, response headers
    /// server-side).
    SendInitialMetadata(Metadata),
    /// Send one message.
    SendMessage(Bytes, WriteFlags),
    /// Half-close the outgoing direction of a client call.
    SendCloseFromClient,
    /// Send the terminal status and trailers from the server.
    SendStatusFromServer(Status, Metadata),
    /// Receive the next message.
    RecvMessage,
    /// Receive the peer's initial metadata.
    RecvInitialMetadata,
    /// Receive the terminal status on the client; stays pending until the
    /// call ends.
    RecvStatusOnClient,
    /// Learn of call completion or client cancellation on the server; stays
    /// pending until the call ends.
    RecvCloseOnServer,
}

/// Outcome of a resolved operation batch.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// `false` when the batch could not be carried out (terminated call,
    /// shut-down listener).
    pub success: bool,
    /// Message received by a `RecvMessage` op; `None` with `success` means
    /// the peer half-closed.
    pub message: Option<Bytes>,
    /// Metadata received by a `RecvInitialMetadata` op.
    pub metadata: Option<Metadata>,
    /// Status observed by `RecvStatusOnClient`, or the terminal status a
    /// failed send ran into.
    pub status: Option<Status>,
    /// Trailing metadata accompanying a received status.
    pub trailers: Option<Metadata>,
    /// Set when the batch was aborted by cancellation or deadline expiry.
    pub cancelled: bool,
    /// A newly arrived call, for a server's pending accept.
    pub incoming: Option<IncomingCall>,
}

impl BatchOutcome {
    /// A plain successful outcome with no payload.
    pub fn success() -> Self {
        BatchOutcome {
            success: true,
            ..Default::default()
        }
    }

    /// A failed outcome carrying the terminal status the batch ran into.
    pub fn failed(status: Option<Status>, cancelled: bool) -> Self {
        BatchOutcome {
            success: false,
            status,
            cancelled,
            ..Default::default()
        }
    }
}

/// A completion event reported by the transport engine.
#[derive(Debug)]
pub struct CompletionEvent {
    /// Key of the batch that finished.
    pub key: CompletionKey,
    /// What happened.
    pub outcome: BatchOutcome,
}
