// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Inbound framing, request/response dispatch, and outbound call
//! construction (spec §4.4). Grounded on `original_source/src/Channel.cpp`.
//!
//! The sequenced and fragmented variants share everything but how a
//! transport delivery becomes a full logical frame: [`Channel`] treats
//! every delivery as one frame, [`SequencedChannel`] reassembles frames
//! from a [`crate::sequence::SequenceCollector`] first.

use crate::base_packet::{decode_frame, BasePacket, Direction, MethodIndex, PacketId, ServiceId};
use crate::config::Config;
use crate::connection::{Connection, ConnectionRef};
use crate::error::RpcError;
use crate::future::{RawFuture, ResponseFuture};
use crate::message::Message;
use crate::sequence::{ChunkedCollector, SequenceCollector, SequencedConnection};
use crate::sink::ChannelSink;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// A link in the inbound dispatch chain (spec §4.4 step 2). The first
/// handler whose [`Self::handle_request`] returns `true` wins; a
/// [`crate::local_handler::LocalHandler`] is typically installed last and
/// always claims requests for services it owns.
pub trait RequestHandler: Send + Sync {
    /// Attempts to handle an inbound request. Returns `Ok(true)` if this
    /// handler claimed it, `Ok(false)` to let the next handler try, or an
    /// `Err` which the channel converts into an error response on the same
    /// packet id.
    fn handle_request(&self, base: &BasePacket, stream: &Bytes, sink: &Arc<ChannelSink>) -> Result<bool, RpcError>;

    /// Fan-out hook for inbound responses (spec §4.3's cross-cutting
    /// interceptor point). No-op by default; a [`crate::local_handler::LocalHandler`]
    /// never overrides this since responses to outbound calls are handled
    /// by the sink.
    fn handle_response(&self, _base: &BasePacket, _remote_id: &str) {}
}

struct HandlerEntry {
    handler: Arc<dyn RequestHandler>,
}

/// Adapts an installed [`RequestHandler`] into a [`crate::sink::ResponseObserver`]
/// so the fan-out hook in spec §4.3 and the handler chain's `handle_response`
/// share one registration call (spec §4.4 `add_handler`: "adds to both the
/// sink and the channel's own handler chain").
struct ResponseFanout(Arc<dyn RequestHandler>);

impl crate::sink::ResponseObserver for ResponseFanout {
    fn handle_response(&self, base: &BasePacket, remote_id: &str) {
        self.0.handle_response(base, remote_id);
    }
}

/// Packet-id allocator shared by both channel variants (spec §4.4
/// `next_id()`, §9 wraparound note): increments, then increments again if
/// the result would be the reserved fire-and-forget sentinel `0`. Starts
/// from a random nonzero seed (spec §3's "the generator starts from a
/// nonzero seed") rather than `0`, so ids from independently constructed
/// channels aren't trivially predictable or aligned.
struct PacketIdAllocator(AtomicU32);

impl PacketIdAllocator {
    fn new() -> Self {
        let seed = loop {
            let candidate = rand::random::<u32>();
            if candidate != 0 {
                break candidate;
            }
        };
        PacketIdAllocator(AtomicU32::new(seed))
    }

    fn next(&self) -> PacketId {
        let id = self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if id == 0 {
            self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
        } else {
            id
        }
    }
}

/// Shared dispatch logic both channel variants call once a full logical
/// frame has been assembled (spec §4.4 `handle_base_packet`).
struct Core {
    sink: Arc<ChannelSink>,
    handlers: Mutex<Vec<HandlerEntry>>,
    ids: PacketIdAllocator,
}

impl Core {
    fn new(config: Config) -> Self {
        Core {
            sink: ChannelSink::with_config(config),
            handlers: Mutex::new(Vec::new()),
            ids: PacketIdAllocator::new(),
        }
    }

    /// Registers `handler` at the front of the chain (spec §4.4 "newest
    /// first") and, as the same call, as a response observer on the sink so
    /// `handle_response` sees every inbound reply.
    fn add_handler(&self, handler: Arc<dyn RequestHandler>) {
        self.sink.add_observer(Arc::new(ResponseFanout(handler.clone())));
        self.handlers.lock().insert(0, HandlerEntry { handler });
    }

    fn handle_base_packet(&self, raw: Bytes) {
        let frame = match decode_frame(raw) {
            Ok(f) => f,
            Err(e) => {
                // Parse failure: log and drop the frame, per spec §4.4 step 1 —
                // do NOT close the channel over a single malformed delivery.
                tracing::error!(target: "rpc", error = %e, "failed to decode inbound frame");
                return;
            }
        };

        let mut base = frame.base;
        let known_remote = self.sink.remote_id();
        if base.caller_id.is_empty() && !known_remote.is_empty() {
            base.caller_id = known_remote.clone();
        }

        match base.direction {
            Direction::Request => self.handle_request(base, frame.payload, frame.stream),
            Direction::Response => {
                if base.packet_id == 0 {
                    return;
                }
                let mut body = Bytes::new();
                if let Some(p) = frame.payload {
                    body = p;
                }
                // `pop` re-parses the length prefix itself via `ResponseFuture`;
                // hand it the remaining wire bytes (payload + stream) back
                // together so the consumer can recover both.
                let combined = rejoin_payload_and_stream(body, frame.stream);
                self.sink.pop(base, combined);
            }
        }
    }

    fn handle_request(&self, base: BasePacket, payload: Option<Bytes>, stream: Bytes) {
        let wire_stream = rejoin_payload_and_stream(payload.unwrap_or_default(), stream);

        let handlers: Vec<Arc<dyn RequestHandler>> = self
            .handlers
            .lock()
            .iter()
            .map(|e| e.handler.clone())
            .collect();

        let mut claimed = false;
        for handler in &handlers {
            match handler.handle_request(&base, &wire_stream, &self.sink) {
                Ok(true) => {
                    claimed = true;
                    break;
                }
                Ok(false) => continue,
                Err(e) => {
                    self.send_error_response(&base, e);
                    claimed = true;
                    break;
                }
            }
        }

        if !claimed {
            self.send_error_response(
                &base,
                RpcError::Dispatch(format!("no handler claimed service_id={}", base.service_id)),
            );
        }
    }

    fn send_error_response(&self, base: &BasePacket, e: RpcError) {
        if base.packet_id == 0 {
            tracing::error!(target: "rpc", error = %e, "request dispatch failed (fire-and-forget, dropping)");
            return;
        }
        let mut response = base.to_response();
        match e {
            RpcError::StructuredRemote { type_name, payload, .. } => {
                response.error_id = crate::error::registry::crc32(&type_name);
                response.error = payload;
            }
            other => {
                response.error_id = 0;
                response.error = Bytes::from(other.to_string());
            }
        }
        tracing::error!(target: "rpc", error = %String::from_utf8_lossy(&response.error), "dispatch failed, sending error response");
        let _ = self.sink.push_response(&response, None, &[]);
    }

    fn call_method<Req: Message + Default, Resp: Message + Default>(
        self: &Arc<Self>,
        service_id: ServiceId,
        method_index: MethodIndex,
        request: &Req,
        stream: &[u8],
    ) -> Result<Arc<ResponseFuture<Resp>>, RpcError> {
        let packet_id = self.ids.next();
        let base = BasePacket::new_request(service_id, method_index, packet_id);
        let payload = request.encode()?;
        let future = self
            .sink
            .push(&base, Some(&payload), stream)?
            .unwrap_or_else(RawFuture::new);
        Ok(Arc::new(ResponseFuture::new(future)))
    }
}

/// Re-lays a decoded frame's payload and trailing stream back into one
/// length-prefixed section, the same shape `encode_frame` originally wrote,
/// so [`ResponseFuture`] and [`crate::local_handler::LocalHandler`] can each
/// run the identical length-prefixed parse the sender used instead of
/// threading `Option<Bytes>` and `Bytes` through separately.
fn rejoin_payload_and_stream(payload: Bytes, stream: Bytes) -> Bytes {
    if payload.is_empty() && stream.is_empty() {
        return Bytes::new();
    }
    let mut buf = bytes::BytesMut::with_capacity(4 + payload.len() + stream.len());
    {
        use bytes::BufMut;
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);
    }
    buf.extend_from_slice(&stream);
    buf.freeze()
}

/// The sequenced channel variant (spec §4.4): every transport delivery is
/// exactly one logical frame.
pub struct Channel {
    core: Arc<Core>,
}

impl Channel {
    pub fn new() -> Arc<Self> {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Arc<Self> {
        Arc::new(Channel { core: Arc::new(Core::new(config)) })
    }

    pub fn sink(&self) -> &Arc<ChannelSink> {
        &self.core.sink
    }

    pub fn add_handler(&self, handler: Arc<dyn RequestHandler>) {
        self.core.add_handler(handler);
    }

    pub fn set_connection(self: &Arc<Self>, connection: ConnectionRef) {
        self.core.sink.set_connection(connection);
        let core = self.core.clone();
        self.core.sink.receive(Box::new(move |result| match result {
            Ok(bytes) => core.handle_base_packet(bytes),
            Err(e) => {
                tracing::warn!(target: "rpc", error = %e, "connection reported an error, closing channel");
                core.sink.close(Some(e));
            }
        }));
    }

    pub fn close(&self, error: Option<RpcError>) {
        self.core.sink.close(error);
    }

    pub fn call_method<Req: Message + Default, Resp: Message + Default>(
        self: &Arc<Self>,
        service_id: ServiceId,
        method_index: MethodIndex,
        request: &Req,
        stream: &[u8],
    ) -> Result<Arc<ResponseFuture<Resp>>, RpcError> {
        self.core.call_method(service_id, method_index, request, stream)
    }
}

/// The fragmented channel variant (spec §4.4): reassembles frames via a
/// [`SequenceCollector`] before treating them as logical frames, and chunks
/// outbound writes to match through a [`SequencedConnection`] wrapper.
pub struct SequencedChannel {
    core: Arc<Core>,
    collector: Mutex<Option<Arc<Mutex<ChunkedCollector>>>>,
    chunk_size: usize,
}

impl SequencedChannel {
    pub fn new(chunk_size: usize) -> Arc<Self> {
        Self::with_config(Config {
            fragment_chunk_size: chunk_size,
            ..Config::default()
        })
    }

    /// Builds a fragmented channel from a full [`Config`], using both
    /// [`Config::fragment_chunk_size`] for outbound chunking and
    /// [`Config::max_in_memory_frame_size`] for the sink's large-frame
    /// streaming threshold.
    pub fn with_config(config: Config) -> Arc<Self> {
        Arc::new(SequencedChannel {
            core: Arc::new(Core::new(config)),
            collector: Mutex::new(None),
            chunk_size: config.fragment_chunk_size,
        })
    }

    pub fn sink(&self) -> &Arc<ChannelSink> {
        &self.core.sink
    }

    pub fn add_handler(&self, handler: Arc<dyn RequestHandler>) {
        self.core.add_handler(handler);
    }

    pub fn set_connection(self: &Arc<Self>, connection: ConnectionRef) {
        let core = self.core.clone();
        let collector = Arc::new(Mutex::new(ChunkedCollector::new(Box::new(move |frame| {
            core.handle_base_packet(frame);
        }))));
        *self.collector.lock() = Some(collector.clone());

        self.core.sink.set_connection_wrapper(Box::new({
            let chunk_size = self.chunk_size;
            move |inner: Arc<dyn Connection>| -> Arc<dyn Connection> { Arc::new(SequencedConnection::new(inner, chunk_size)) }
        }));
        self.core.sink.set_connection(connection);

        let sink_for_close = self.core.sink.clone();
        self.core.sink.receive(Box::new(move |result| match result {
            Ok(fragment) => {
                if let Err(e) = collector.lock().on_new_stream(fragment) {
                    tracing::error!(target: "rpc", error = %e, "fragment reassembly failed");
                }
            }
            Err(e) => {
                tracing::warn!(target: "rpc", error = %e, "connection reported an error, closing channel");
                sink_for_close.close(Some(e));
            }
        }));
    }

    pub fn close(&self, error: Option<RpcError>) {
        self.core.sink.close(error);
    }

    pub fn call_method<Req: Message + Default, Resp: Message + Default>(
        self: &Arc<Self>,
        service_id: ServiceId,
        method_index: MethodIndex,
        request: &Req,
        stream: &[u8],
    ) -> Result<Arc<ResponseFuture<Resp>>, RpcError> {
        self.core.call_method(service_id, method_index, request, stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::MemoryConnection;
    use crate::local_handler::LocalHandler;
    use crate::message::BincodeMessage;
    use crate::schema_message;
    use crate::service::{MethodDescriptor, Request, RequestEnvelope, Response, ResponseEnvelope, Service, ServiceDescriptor};
    use serde::{Deserialize, Serialize};

    #[derive(Default, Clone, Serialize, Deserialize)]
    struct Num {
        data: i32,
    }
    schema_message!(Num, "channel.test.Num");

    const METHOD: MethodDescriptor = MethodDescriptor { index: 0, name: "Increment" };
    static METHODS: &[MethodDescriptor] = &[METHOD];
    const DESCRIPTOR: ServiceDescriptor = ServiceDescriptor { id: 1, name: "Counter", methods: METHODS };

    struct CounterService;

    impl Service for CounterService {
        fn id(&self) -> ServiceId {
            1
        }
        fn name(&self) -> &str {
            "Counter"
        }
        fn descriptor(&self) -> ServiceDescriptor {
            DESCRIPTOR
        }
        fn create_request(&self, _method: &MethodDescriptor) -> Box<dyn RequestEnvelope> {
            Box::new(Request::<Num>::new(Num::default()))
        }
        fn create_response(&self, _method: &MethodDescriptor) -> Box<dyn ResponseEnvelope> {
            Box::new(Response::<Num>::new())
        }
        fn call_method(
            &self,
            _method: &MethodDescriptor,
            request: &dyn RequestEnvelope,
            response: &mut dyn ResponseEnvelope,
        ) -> Result<(), RpcError> {
            let req = request.as_any().downcast_ref::<Request<Num>>().unwrap();
            let resp = response.as_any_mut().downcast_mut::<Response<Num>>().unwrap();
            resp.data = req.data + 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn unary_round_trip_over_memory_connection() {
        let client = Channel::new();
        let server = Channel::new();
        let (client_conn, server_conn) = MemoryConnection::pair("client", "server");
        client.set_connection(client_conn);
        server.set_connection(server_conn);

        let handler = LocalHandler::new();
        handler.provide_service(&(Arc::new(CounterService) as Arc<dyn Service>));
        server.add_handler(handler);

        let future = client
            .call_method::<Num, Num>(1, 0, &Num { data: 99 }, &[])
            .unwrap();
        let reply = future.wait_async().await.unwrap();
        assert_eq!(reply.data, 100);
    }

    #[tokio::test]
    async fn no_matching_service_fails_with_dispatch_error() {
        let client = Channel::new();
        let server = Channel::new();
        let (client_conn, server_conn) = MemoryConnection::pair("client", "server");
        client.set_connection(client_conn);
        server.set_connection(server_conn);

        let handler = LocalHandler::new();
        server.add_handler(handler);

        let future = client
            .call_method::<Num, Num>(77, 0, &Num { data: 1 }, &[])
            .unwrap();
        let err = future.wait_async().await.unwrap_err();
        assert!(err.is_remote());
    }

    #[test]
    fn packet_ids_skip_zero_on_wraparound() {
        let ids = PacketIdAllocator(AtomicU32::new(u32::MAX));
        let first = ids.next();
        assert_ne!(first, 0);
    }
}
