//! Typed marshalling over live calls, including the asymmetric failure
//! codes: a client that cannot decode a response faults with INTERNAL, a
//! server that cannot decode a request faults with UNKNOWN.

use std::sync::Arc;

use bytes::Bytes;
use lariat_core::{
    CallOptions, Channel, JsonMarshal, Marshal, MethodRegistry, Server, Status, StatusCode,
    TypedClientCall, TypedServerCall, Utf8Marshal,
};
use serde::{Deserialize, Serialize};

use crate::harness::{init_tracing, unique_target};

const NOTES: &str = "/marshaltest.Notes/Exchange";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Note {
    id: u32,
    body: String,
}

fn json_marshal() -> Arc<dyn Marshal<Note>> {
    Arc::new(JsonMarshal::<Note>::default())
}

#[tokio::test]
async fn test_typed_exchange_roundtrip() {
    init_tracing();
    let target = unique_target("marshal");
    let mut methods = MethodRegistry::new();
    methods.add_fn(NOTES, |call| async move {
        let typed = TypedServerCall::new(call, json_marshal(), json_marshal());
        while let Some(note) = typed.receive().await.map_err(|e| to_status(&e))? {
            let reply = Note {
                id: note.id + 1,
                body: note.body.to_uppercase(),
            };
            typed.send(&reply).await.map_err(|e| to_status(&e))?;
        }
        Ok(())
    });
    let server = Server::bind(&target, methods).unwrap();
    let channel = Channel::new(&target, Default::default()).unwrap();

    let call = channel.call(NOTES, &CallOptions::new()).await.unwrap();
    let typed = TypedClientCall::new(call, json_marshal(), json_marshal());
    typed
        .send(&Note {
            id: 6,
            body: "quiet".into(),
        })
        .await
        .unwrap();
    let reply = typed.receive().await.unwrap().expect("typed reply");
    assert_eq!(
        reply,
        Note {
            id: 7,
            body: "QUIET".into()
        }
    );
    typed.complete_writes().await.unwrap();
    assert_eq!(typed.receive().await.unwrap(), None);
    assert_eq!(typed.finished().await.status.code(), StatusCode::Ok);

    channel.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_undecodable_response_faults_client_with_internal() {
    init_tracing();
    let target = unique_target("marshal");
    let mut methods = MethodRegistry::new();
    // Replies with bytes that are not valid JSON.
    methods.add_fn(NOTES, |call| async move {
        let _ = call.read_next().await;
        call.send_message(Bytes::from_static(b"<<not json>>"))
            .await
            .map_err(|e| to_status(&e))?;
        // Hold the call open; the client aborts it once decoding fails.
        let reason = call.cancellation_token().cancelled().await;
        Err(Status::cancelled(reason.to_string()))
    });
    let server = Server::bind(&target, methods).unwrap();
    let channel = Channel::new(&target, Default::default()).unwrap();

    let call = channel.call(NOTES, &CallOptions::new()).await.unwrap();
    let typed = TypedClientCall::new(call, json_marshal(), json_marshal());
    typed
        .send(&Note {
            id: 1,
            body: "hi".into(),
        })
        .await
        .unwrap();
    typed.complete_writes().await.unwrap();
    let err = typed.receive().await.unwrap_err();
    assert_eq!(
        err.status().expect("status error").code(),
        StatusCode::Internal
    );
    assert_eq!(typed.finished().await.status.code(), StatusCode::Internal);

    channel.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_undecodable_request_faults_server_with_unknown() {
    init_tracing();
    let target = unique_target("marshal");
    let mut methods = MethodRegistry::new();
    methods.add_fn(NOTES, |call| async move {
        let typed = TypedServerCall::new(call, json_marshal(), json_marshal());
        match typed.receive().await {
            Err(e) => Err(to_status(&e)),
            Ok(_) => Err(Status::internal("expected a decode failure")),
        }
    });
    let server = Server::bind(&target, methods).unwrap();
    let channel = Channel::new(&target, Default::default()).unwrap();

    // Raw bytes that the server's typed layer cannot decode.
    let call = channel.call(NOTES, &CallOptions::new()).await.unwrap();
    call.send_message(Bytes::from_static(b"junk")).await.unwrap();
    call.complete_writes().await.unwrap();
    assert_eq!(call.finished().await.status.code(), StatusCode::Unknown);

    channel.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_utf8_marshal_over_a_live_call() {
    init_tracing();
    let target = unique_target("marshal");
    let mut methods = MethodRegistry::new();
    methods.add_fn(NOTES, |call| async move {
        let utf8: Arc<dyn Marshal<String>> = Arc::new(Utf8Marshal);
        let typed = TypedServerCall::new(call, utf8.clone(), utf8);
        while let Some(line) = typed.receive().await.map_err(|e| to_status(&e))? {
            typed
                .send(&format!("{line}!"))
                .await
                .map_err(|e| to_status(&e))?;
        }
        Ok(())
    });
    let server = Server::bind(&target, methods).unwrap();
    let channel = Channel::new(&target, Default::default()).unwrap();

    let call = channel.call(NOTES, &CallOptions::new()).await.unwrap();
    let utf8: Arc<dyn Marshal<String>> = Arc::new(Utf8Marshal);
    let typed = TypedClientCall::new(call, utf8.clone(), utf8);
    typed.send(&"ahoy".to_string()).await.unwrap();
    assert_eq!(typed.receive().await.unwrap().as_deref(), Some("ahoy!"));
    typed.complete_writes().await.unwrap();
    assert_eq!(typed.receive().await.unwrap(), None);
    assert_eq!(typed.finished().await.status.code(), StatusCode::Ok);

    channel.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

fn to_status(err: &lariat_core::RpcError) -> Status {
    match err.status() {
        Some(status) => status.clone(),
        None => Status::unknown(err.to_string()),
    }
}
