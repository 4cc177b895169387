// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! End-to-end scenarios, run over a real [`Channel`]/[`SequencedChannel`]
//! pair connected by an in-memory [`rpc_core::Connection`].

use bytes::Bytes;
use rpc_core::{
    Channel, LocalHandler, MethodDescriptor, Request, RequestEnvelope, Response, ResponseBacking,
    ResponseEnvelope, RpcError, SequencedChannel, Service, ServiceDescriptor, ServiceId, StreamRequest,
    StreamResponse,
};
use rpc_core::connection::testing::MemoryConnection;
use rpc_core::message::BincodeMessage;
use rpc_core::schema_message;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Once};

/// Installs a `tracing` subscriber once so `cargo test -- --nocapture`
/// shows the channel/sink/handler trace spans, in the style of the
/// teacher's own test harness.
fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

#[derive(Default, Clone, Serialize, Deserialize)]
struct Num {
    data: i32,
}
schema_message!(Num, "integration.Num");

const UNARY_METHOD: MethodDescriptor = MethodDescriptor { index: 0, name: "Increment" };
const STREAM_METHOD: MethodDescriptor = MethodDescriptor { index: 1, name: "Echo" };
static METHODS: &[MethodDescriptor] = &[UNARY_METHOD, STREAM_METHOD];
const SERVICE_ID: ServiceId = 9;
const DESCRIPTOR: ServiceDescriptor = ServiceDescriptor { id: SERVICE_ID, name: "Counter", methods: METHODS };

/// A service exposing both a plain unary method and a stream-carrying one,
/// exercising scenarios 1-4 from spec §8.
struct CounterService;

impl Service for CounterService {
    fn id(&self) -> ServiceId {
        SERVICE_ID
    }
    fn name(&self) -> &str {
        "Counter"
    }
    fn descriptor(&self) -> ServiceDescriptor {
        DESCRIPTOR
    }
    fn create_request(&self, method: &MethodDescriptor) -> Box<dyn RequestEnvelope> {
        if method.index == STREAM_METHOD.index {
            Box::new(StreamRequest::<Num>::new(Num::default(), Bytes::new()))
        } else {
            Box::new(Request::<Num>::new(Num::default()))
        }
    }
    fn create_response(&self, method: &MethodDescriptor) -> Box<dyn ResponseEnvelope> {
        if method.index == STREAM_METHOD.index {
            Box::new(StreamResponse::<Num>::new())
        } else {
            Box::new(Response::<Num>::new())
        }
    }
    fn call_method(
        &self,
        method: &MethodDescriptor,
        request: &dyn RequestEnvelope,
        response: &mut dyn ResponseEnvelope,
    ) -> Result<(), RpcError> {
        if method.index == STREAM_METHOD.index {
            let req = request.as_any().downcast_ref::<StreamRequest<Num>>().unwrap();
            let stream = req.stream();
            let data = req.data;
            let resp = response.as_any_mut().downcast_mut::<StreamResponse<Num>>().unwrap();
            resp.data = data + 1;
            resp.set_stream(stream);
        } else {
            let req = request.as_any().downcast_ref::<Request<Num>>().unwrap();
            let data = req.data;
            let resp = response.as_any_mut().downcast_mut::<Response<Num>>().unwrap();
            resp.data = data + 1;
        }
        Ok(())
    }
}

fn wire_up() -> (Arc<Channel>, Arc<Channel>) {
    init_tracing();
    let client = Channel::new();
    let server = Channel::new();
    let (client_conn, server_conn) = MemoryConnection::pair("client", "server");
    client.set_connection(client_conn);
    server.set_connection(server_conn);

    let handler = LocalHandler::new();
    handler.provide_service(&(Arc::new(CounterService) as Arc<dyn Service>));
    server.add_handler(handler);

    (client, server)
}

#[tokio::test]
async fn scenario_1_unary_request_response() {
    let (client, _server) = wire_up();
    let future = client
        .call_method::<Num, Num>(SERVICE_ID, UNARY_METHOD.index, &Num { data: 99 }, &[])
        .unwrap();
    let reply = future.wait_async().await.unwrap();
    assert_eq!(reply.data, 100);
}

#[tokio::test]
async fn scenario_2_request_with_trailing_input_stream() {
    let (client, _server) = wire_up();
    let future = client
        .call_method::<Num, Num>(SERVICE_ID, STREAM_METHOD.index, &Num { data: 1 }, b"sometext")
        .unwrap();
    let reply = future.wait_async().await.unwrap();
    assert_eq!(reply.data, 2);
    assert_eq!(future.stream(), Bytes::from_static(b"sometext"));
}

#[tokio::test]
async fn scenario_3_async_callback_unary() {
    let (client, _server) = wire_up();
    let future = client
        .call_method::<Num, Num>(SERVICE_ID, UNARY_METHOD.index, &Num { data: 99 }, &[])
        .unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    future.on_complete(move |result| {
        let _ = tx.send(result.map(|n| n.data));
    });

    assert_eq!(rx.await.unwrap().unwrap(), 100);
}

#[tokio::test]
async fn scenario_4_async_callback_with_stream() {
    let (client, _server) = wire_up();
    let future = client
        .call_method::<Num, Num>(SERVICE_ID, STREAM_METHOD.index, &Num { data: 1 }, b"sometext")
        .unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    let future_for_cb = future.clone();
    future.on_complete(move |result| {
        let data = result.unwrap().data;
        let stream = future_for_cb.stream();
        let _ = tx.send((data, stream));
    });

    let (data, stream) = rx.await.unwrap();
    assert_eq!(data, 2);
    assert_eq!(stream, Bytes::from_static(b"sometext"));
}

#[tokio::test]
async fn scenario_5_no_matching_service() {
    let client = Channel::new();
    let server = Channel::new();
    let (client_conn, server_conn) = MemoryConnection::pair("client", "server");
    client.set_connection(client_conn);
    server.set_connection(server_conn);
    server.add_handler(LocalHandler::new());

    let future = client
        .call_method::<Num, Num>(404, 0, &Num { data: 1 }, &[])
        .unwrap();
    let err = future.wait_async().await.unwrap_err();
    match err {
        RpcError::FreeformRemote(message) => assert!(message.contains("service is not supported") || message.contains("no handler claimed")),
        other => panic!("expected a freeform remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn scenario_6_channel_close_mid_flight() {
    let (client, _server) = wire_up();

    // Two in-flight calls against a sink with no response ever coming back.
    let f1 = client
        .call_method::<Num, Num>(SERVICE_ID, UNARY_METHOD.index, &Num { data: 1 }, &[])
        .unwrap();
    let f2 = client
        .call_method::<Num, Num>(SERVICE_ID, UNARY_METHOD.index, &Num { data: 2 }, &[])
        .unwrap();

    client.close(Some(RpcError::FreeformRemote("custom shutdown".into())));

    let e1 = f1.wait_async().await.unwrap_err();
    let e2 = f2.wait_async().await.unwrap_err();
    assert!(matches!(e1, RpcError::FreeformRemote(_) | RpcError::ChannelClosed(_)));
    assert!(matches!(e2, RpcError::FreeformRemote(_) | RpcError::ChannelClosed(_)));
}

#[tokio::test]
async fn scenario_7_unknown_response_id_is_ignored() {
    let sink = rpc_core::ChannelSink::new();
    let (a, _b) = MemoryConnection::pair("a", "b");
    sink.set_connection(a);

    let base = rpc_core::BasePacket::new_request(1, 0, 1);
    let pending = sink.push(&base, None, &[]).unwrap().unwrap();

    sink.pop(
        rpc_core::BasePacket {
            direction: rpc_core::Direction::Response,
            packet_id: 999,
            ..Default::default()
        },
        Bytes::new(),
    );

    assert!(!pending.is_ready());
}

/// Spec §8 runs every end-to-end scenario's seed "over `T` ranging over
/// {sequenced, fragmented} channel variants" — this is scenario 1 driven
/// over [`SequencedChannel`] with a deliberately tiny chunk size, so a
/// single logical frame is reassembled from several transport deliveries
/// rather than arriving whole.
#[tokio::test]
async fn scenario_1_unary_request_response_over_fragmented_channel() {
    let client = SequencedChannel::new(8);
    let server = SequencedChannel::new(8);
    let (client_conn, server_conn) = MemoryConnection::pair("client", "server");
    client.set_connection(client_conn);
    server.set_connection(server_conn);

    let handler = LocalHandler::new();
    handler.provide_service(&(Arc::new(CounterService) as Arc<dyn Service>));
    server.add_handler(handler);

    let future = client
        .call_method::<Num, Num>(SERVICE_ID, UNARY_METHOD.index, &Num { data: 99 }, &[])
        .unwrap();
    let reply = future.wait_async().await.unwrap();
    assert_eq!(reply.data, 100);
}

#[tokio::test]
async fn scenario_8_duplicate_packet_id_collision() {
    let sink = rpc_core::ChannelSink::new();
    let (a, _b) = MemoryConnection::pair("a", "b");
    sink.set_connection(a);

    let base = rpc_core::BasePacket::new_request(1, 0, 1);
    let first = sink.push(&base, None, &[]).unwrap().unwrap();
    let err = sink.push(&base, None, &[]).unwrap_err();

    assert!(matches!(err, RpcError::DuplicatePacketId(1)));
    assert!(!first.is_ready());
}
