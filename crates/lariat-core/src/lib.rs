#![warn(missing_docs)]

//! Lariat call-lifecycle engine: completion dispatch, client/server call
//! state machines, channel connectivity, deadline and cancellation
//! propagation, and policy-driven retries over an in-process fabric.

pub mod batch;
pub mod cancel;
pub mod channel;
pub mod channel_options;
pub mod client_call;
pub mod completion;
pub mod deadline;
pub mod environment;
pub mod error;
pub mod marshal;
pub mod metadata;
pub mod options;
pub mod propagation;
pub mod retry;
pub mod server;
pub mod server_call;
pub mod status;
pub mod transport;

pub use batch::{BatchOutcome, CompletionEvent, Op, WriteFlags};
pub use cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelToken};
pub use channel::{Channel, ChannelState};
pub use channel_options::{split_method_name, ChannelOptionValue, ChannelOptions, ServiceConfig};
pub use client_call::{ClientCall, Terminal};
pub use completion::{CompletionKey, CompletionRegistry};
pub use deadline::Deadline;
pub use environment::{Environment, EnvironmentConfig};
pub use error::{MarshalError, Result, RpcError, UsageError};
pub use marshal::{JsonMarshal, Marshal, TypedClientCall, TypedServerCall, Utf8Marshal};
pub use metadata::{Metadata, MetadataValue};
pub use options::{BearerTokenCredentials, CallCredentials, CallOptions, ResolvedCallOptions};
pub use propagation::{PropagationOptions, PropagationToken};
pub use retry::{retry_unary, RetryPolicy, RetryingCall};
pub use server::{handler_fn, HandlerResult, MethodHandler, MethodRegistry, Server};
pub use server_call::ServerCall;
pub use status::{Status, StatusCode};
pub use transport::IncomingCall;
