// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Write serialization, outgoing-request table, and response demultiplex
//! (spec §4.3). Grounded on `original_source/src/ChannelSink.cpp`.

use crate::base_packet::{encode_frame, frame_len, write_frame_direct, BasePacket, PacketId};
use crate::config::Config;
use crate::connection::{Connection, ReceiveCallback, WriteHandle};
use crate::error::RpcError;
use crate::future::RawFuture;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// A cross-cutting interceptor that observes every inbound response before
/// the sink completes its matching future (spec §4.3's "fan-out hook").
pub trait ResponseObserver: Send + Sync {
    fn handle_response(&self, base: &BasePacket, remote_id: &str);
}

/// Adapter installed around the transport on every write, used to enable
/// fragmentation (spec §4.3 `set_connection_wrapper`, §4.4).
pub type ConnectionWrapper = Box<dyn Fn(Arc<dyn Connection>) -> Arc<dyn Connection> + Send + Sync>;

struct Guarded {
    connection: Option<Arc<dyn Connection>>,
    wrapper: Option<ConnectionWrapper>,
    outgoing: HashMap<PacketId, RawFuture>,
    close_error: Option<String>,
    remote_id: String,
}

/// Per-channel writer and response demultiplexer (spec §4.3, §4.8).
///
/// `Open -> Open` on connection swap; `Open -> Closed(e)` on [`Self::close`],
/// which is terminal: further pushes are no-ops and new futures are
/// rejected.
pub struct ChannelSink {
    state: Mutex<Guarded>,
    observers: Mutex<Vec<Arc<dyn ResponseObserver>>>,
    config: Config,
}

impl ChannelSink {
    pub fn new() -> Arc<Self> {
        Self::with_config(Config::default())
    }

    /// Builds a sink tuned by `config` — in particular
    /// [`Config::max_in_memory_frame_size`], the spec §4.1 threshold above
    /// which a frame streams directly into the transport instead of being
    /// assembled into one contiguous buffer first.
    pub fn with_config(config: Config) -> Arc<Self> {
        Arc::new(ChannelSink {
            state: Mutex::new(Guarded {
                connection: None,
                wrapper: None,
                outgoing: HashMap::new(),
                close_error: None,
                remote_id: String::new(),
            }),
            observers: Mutex::new(Vec::new()),
            config,
        })
    }

    pub fn add_observer(&self, observer: Arc<dyn ResponseObserver>) {
        self.observers.lock().push(observer);
    }

    pub fn set_remote_id(&self, id: String) {
        self.state.lock().remote_id = id;
    }

    pub fn remote_id(&self) -> String {
        self.state.lock().remote_id.clone()
    }

    pub fn set_connection_wrapper(&self, wrapper: ConnectionWrapper) {
        self.state.lock().wrapper = Some(wrapper);
    }

    /// Swaps in a new transport. Drains and closes any prior connection;
    /// clears a latched close error so the sink can be reused after a
    /// reconnect.
    pub fn set_connection(self: &Arc<Self>, connection: Arc<dyn Connection>) {
        let previous = {
            let mut state = self.state.lock();
            state.close_error = None;
            state.connection.replace(connection)
        };
        if let Some(previous) = previous {
            previous.receive(Box::new(|_| {})); // ignore everything from the old connection
            previous.close();
        }
    }

    /// Registers the inbound-delivery callback against the current
    /// connection wrapped the same way outbound writes are.
    pub fn receive(self: &Arc<Self>, callback: ReceiveCallback) {
        let connection = {
            let state = self.state.lock();
            state.connection.clone()
        };
        if let Some(connection) = connection {
            connection.receive(callback);
        }
    }

    /// Pushes a request or response frame. For requests with a nonzero
    /// `packet_id`, allocates and registers a [`RawFuture`] before writing;
    /// responses (and fire-and-forget requests) are just serialized.
    pub fn push(&self, base: &BasePacket, payload: Option<&[u8]>, stream: &[u8]) -> Result<Option<RawFuture>, RpcError> {
        use crate::base_packet::Direction;

        let future = if base.packet_id != 0 && base.direction == Direction::Request {
            let future = RawFuture::new();
            let mut state = self.state.lock();
            if state.outgoing.insert(base.packet_id, future.clone()).is_some() {
                return Err(RpcError::DuplicatePacketId(base.packet_id));
            }
            Some(future)
        } else {
            None
        };

        self.write(base, payload, stream);
        Ok(future)
    }

    /// Pushes a response frame (spec §4.6's scoped send calls through
    /// here). Never registers a future.
    pub fn push_response(&self, base: &BasePacket, payload: Option<&[u8]>, stream: &[u8]) -> Result<(), RpcError> {
        self.write(base, payload, stream);
        Ok(())
    }

    fn write(&self, base: &BasePacket, payload: Option<&[u8]>, stream: &[u8]) {
        let (connection, remote_id) = {
            let state = self.state.lock();
            if state.close_error.is_some() || state.connection.is_none() {
                tracing::warn!(
                    target: "rpc",
                    remote = %state.remote_id,
                    "channel has been closed, dropping write"
                );
                return;
            }
            let raw = state.connection.clone().unwrap();
            let wrapped = match &state.wrapper {
                Some(w) => w(raw),
                None => raw,
            };
            (wrapped, state.remote_id.clone())
        };

        tracing::trace!(target: "rpc", remote = %remote_id, packet_id = base.packet_id, "writing packet");

        let total = match frame_len(base, payload, stream) {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(target: "rpc", error = %e, "failed to size frame");
                return;
            }
        };

        let mut handle: Box<dyn WriteHandle> = connection.prepare(total);

        let result = if total > self.config.max_in_memory_frame_size {
            // Large frame: stream each piece straight into the transport's
            // reserved buffer instead of assembling it in memory first
            // (spec §4.1).
            write_frame_direct(handle.as_mut(), base, payload, stream)
        } else {
            encode_frame(base, payload, stream).and_then(|wire| handle.write(&wire))
        };

        if let Err(e) = result {
            tracing::error!(target: "rpc", error = %e, "failed to write frame");
        }
    }

    /// Looks up the pending request matching `base.packet_id` and completes
    /// its future; logs and discards on an unknown (stale/duplicate) id.
    /// Before the lookup, every registered [`ResponseObserver`] is invoked
    /// (spec §4.3's "fan-out hook" for cross-cutting interceptors).
    pub fn pop(&self, base: BasePacket, stream: Bytes) {
        let remote_id = self.remote_id();
        for observer in self.observers.lock().iter() {
            observer.handle_response(&base, &remote_id);
        }

        let future = {
            let mut state = self.state.lock();
            match state.outgoing.remove(&base.packet_id) {
                Some(f) => f,
                None => {
                    tracing::error!(target: "rpc", remote = %remote_id, packet_id = base.packet_id, "unknown packet id");
                    return;
                }
            }
        };

        future.set_base(base.clone());
        if base.has_error() {
            let error = crate::error::make_exception(base.error_id, &base.error);
            future.complete_with_error(error);
        } else {
            future.complete_with_stream(stream);
        }
    }

    /// Closes the transport, records the close cause (first one wins), and
    /// fails every pending future. Idempotent: a second call has no further
    /// effect on an already-closed sink.
    pub fn close(&self, error: Option<RpcError>) {
        let (connection, drained) = {
            let mut state = self.state.lock();
            let connection = state.connection.take();
            if state.close_error.is_none() {
                state.close_error = Some(
                    error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "channel closed by local side".to_string()),
                );
            }
            let drained: Vec<RawFuture> = state.outgoing.drain().map(|(_, f)| f).collect();
            (connection, drained)
        };

        if let Some(connection) = connection {
            connection.close();
        }

        if drained.is_empty() {
            return;
        }

        let message = error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "channel closed by local side".to_string());
        for future in drained {
            future.complete_with_error(RpcError::ChannelClosed(message.clone()));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().close_error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base_packet::Direction;
    use crate::connection::testing::MemoryConnection;

    fn req(packet_id: u32) -> BasePacket {
        BasePacket {
            direction: Direction::Request,
            packet_id,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn duplicate_packet_id_fails_second_push_only() {
        let sink = ChannelSink::new();
        let (a, _b) = MemoryConnection::pair("a", "b");
        sink.set_connection(a);

        let f1 = sink.push(&req(1), None, &[]).unwrap();
        assert!(f1.is_some());
        let err = sink.push(&req(1), None, &[]);
        assert!(matches!(err, Err(RpcError::DuplicatePacketId(1))));
        assert!(!f1.unwrap().is_ready());
    }

    #[tokio::test]
    async fn close_fans_out_to_every_pending_future() {
        let sink = ChannelSink::new();
        let (a, _b) = MemoryConnection::pair("a", "b");
        sink.set_connection(a);

        let f1 = sink.push(&req(1), None, &[]).unwrap().unwrap();
        let f2 = sink.push(&req(2), None, &[]).unwrap().unwrap();

        sink.close(Some(RpcError::FreeformRemote("custom".into())));

        assert!(f1.wait_async().await.is_err());
        assert!(f2.wait_async().await.is_err());
        assert!(sink.is_closed());

        // A second close is a no-op, not a panic or a second fan-out.
        sink.close(None);
    }

    #[tokio::test]
    async fn large_frame_streams_directly_and_still_round_trips() {
        let sink = ChannelSink::with_config(Config {
            max_in_memory_frame_size: 16,
            ..Config::default()
        });
        let (a, b) = MemoryConnection::pair("a", "b");
        sink.set_connection(a);

        let stream = vec![7u8; 256];
        let base = BasePacket::new_request(1, 2, 0); // fire-and-forget: just exercise the write path
        sink.push(&base, None, &stream).unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        b.receive(Box::new(move |result| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(result.unwrap());
            }
        }));
        let wire = rx.await.unwrap();
        let frame = crate::base_packet::decode_frame(wire).unwrap();
        assert_eq!(frame.base.service_id, 1);
        assert_eq!(frame.stream, Bytes::from(stream));
    }

    #[tokio::test]
    async fn unknown_response_id_is_logged_and_ignored() {
        let sink = ChannelSink::new();
        let (a, _b) = MemoryConnection::pair("a", "b");
        sink.set_connection(a);

        let f1 = sink.push(&req(1), None, &[]).unwrap().unwrap();
        sink.pop(
            BasePacket {
                direction: Direction::Response,
                packet_id: 999,
                ..Default::default()
            },
            Bytes::new(),
        );
        assert!(!f1.is_ready());
    }
}
