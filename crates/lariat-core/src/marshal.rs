//! Typed message layer over the byte-oriented calls.
//!
//! Serialization failures are local errors; deserialization failures fault
//! the call itself: `INTERNAL` on the client, `UNKNOWN` on the server,
//! mirroring how each side classifies a peer it cannot understand.

use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::client_call::{ClientCall, Terminal};
use crate::error::{MarshalError, Result, RpcError};
use crate::metadata::Metadata;
use crate::server_call::ServerCall;
use crate::status::Status;

/// Converts between `T` and wire bytes.
pub trait Marshal<T>: Send + Sync {
    /// Serializes `value`.
    fn serialize(&self, value: &T) -> std::result::Result<Bytes, MarshalError>;
    /// Deserializes one message.
    fn deserialize(&self, payload: &Bytes) -> std::result::Result<T, MarshalError>;
}

/// UTF-8 string marshalling.
#[derive(Debug, Default, Clone, Copy)]
pub struct Utf8Marshal;

impl Marshal<String> for Utf8Marshal {
    fn serialize(&self, value: &String) -> std::result::Result<Bytes, MarshalError> {
        Ok(Bytes::from(value.clone()))
    }

    fn deserialize(&self, payload: &Bytes) -> std::result::Result<String, MarshalError> {
        std::str::from_utf8(payload)
            .map(str::to_owned)
            .map_err(|e| MarshalError(format!("invalid utf-8: {e}")))
    }
}

/// JSON marshalling for any serde type.
pub struct JsonMarshal<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for JsonMarshal<T> {
    fn default() -> Self {
        JsonMarshal {
            _marker: PhantomData,
        }
    }
}

impl<T> Marshal<T> for JsonMarshal<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn serialize(&self, value: &T) -> std::result::Result<Bytes, MarshalError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| MarshalError(e.to_string()))
    }

    fn deserialize(&self, payload: &Bytes) -> std::result::Result<T, MarshalError> {
        serde_json::from_slice(payload).map_err(|e| MarshalError(e.to_string()))
    }
}

/// A client call speaking typed requests and responses.
pub struct TypedClientCall<Req, Resp> {
    call: ClientCall,
    request_marshal: Arc<dyn Marshal<Req>>,
    response_marshal: Arc<dyn Marshal<Resp>>,
}

impl<Req, Resp> TypedClientCall<Req, Resp> {
    /// Wraps `call` with the given marshallers.
    pub fn new(
        call: ClientCall,
        request_marshal: Arc<dyn Marshal<Req>>,
        response_marshal: Arc<dyn Marshal<Resp>>,
    ) -> Self {
        TypedClientCall {
            call,
            request_marshal,
            response_marshal,
        }
    }

    /// The untyped call underneath.
    pub fn inner(&self) -> &ClientCall {
        &self.call
    }

    /// Sends one request. A serialization failure is a local error and
    /// leaves the call usable.
    pub async fn send(&self, request: &Req) -> Result<()> {
        let payload = self.request_marshal.serialize(request)?;
        self.call.send_message(payload).await
    }

    /// Half-closes the request stream.
    pub async fn complete_writes(&self) -> Result<()> {
        self.call.complete_writes().await
    }

    /// Receives the next response. A payload this side cannot deserialize
    /// faults the call with `INTERNAL`.
    pub async fn receive(&self) -> Result<Option<Resp>> {
        let Some(payload) = self.call.read_next().await? else {
            return Ok(None);
        };
        match self.response_marshal.deserialize(&payload) {
            Ok(response) => Ok(Some(response)),
            Err(e) => {
                let status = Status::internal(format!("failed to deserialize response: {e}"));
                self.call.cancel_with_status(status.clone());
                Err(RpcError::Status(status))
            }
        }
    }

    /// Waits for the terminal outcome.
    pub async fn finished(&self) -> Terminal {
        self.call.finished().await
    }

    /// Cancels the call.
    pub fn cancel(&self) {
        self.call.cancel();
    }
}

/// A server call speaking typed requests and responses.
pub struct TypedServerCall<Req, Resp> {
    call: ServerCall,
    request_marshal: Arc<dyn Marshal<Req>>,
    response_marshal: Arc<dyn Marshal<Resp>>,
}

impl<Req, Resp> TypedServerCall<Req, Resp> {
    /// Wraps `call` with the given marshallers.
    pub fn new(
        call: ServerCall,
        request_marshal: Arc<dyn Marshal<Req>>,
        response_marshal: Arc<dyn Marshal<Resp>>,
    ) -> Self {
        TypedServerCall {
            call,
            request_marshal,
            response_marshal,
        }
    }

    /// The untyped call underneath.
    pub fn inner(&self) -> &ServerCall {
        &self.call
    }

    /// Receives the next request. A payload this side cannot deserialize
    /// faults the call with `UNKNOWN`.
    pub async fn receive(&self) -> Result<Option<Req>> {
        let Some(payload) = self.call.read_next().await? else {
            return Ok(None);
        };
        match self.request_marshal.deserialize(&payload) {
            Ok(request) => Ok(Some(request)),
            Err(e) => {
                let status = Status::unknown(format!("failed to deserialize request: {e}"));
                self.call.abort(status.clone());
                Err(RpcError::Status(status))
            }
        }
    }

    /// Sends one response. A response that cannot be serialized faults the
    /// call with `INTERNAL`.
    pub async fn send(&self, response: &Resp) -> Result<()> {
        match self.response_marshal.serialize(response) {
            Ok(payload) => self.call.send_message(payload).await,
            Err(e) => {
                let status = Status::internal(format!("failed to serialize response: {e}"));
                self.call.abort(status.clone());
                Err(RpcError::Status(status))
            }
        }
    }

    /// Ends the call.
    pub async fn finish(&self, status: Status, trailers: Metadata) -> Result<()> {
        self.call.finish(status, trailers).await
    }
}
