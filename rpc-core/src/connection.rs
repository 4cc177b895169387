// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The transport contract (spec §6 `Connection`).
//!
//! The byte-transport itself is out of scope (spec §1); this module only
//! specifies the shape the channel/sink rely on. Production code plugs in
//! a real socket/stream implementation. `testing` provides an in-memory
//! duplex pair used by this crate's own tests.

use crate::error::RpcError;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// A reserved write buffer, acquired via [`Connection::prepare`].
pub trait WriteHandle: Send {
    fn write(&mut self, bytes: &[u8]) -> Result<(), RpcError>;
}

/// Callback invoked once per inbound delivery. `Ok(bytes)` is one logical
/// frame (sequenced variant) or one fragment (fragmented variant,
/// reassembled by a [`crate::sequence::SequenceCollector`]). `Err` signals
/// the connection failed or was closed by the peer.
pub type ReceiveCallback = Box<dyn Fn(Result<Bytes, RpcError>) + Send + Sync>;

/// The byte-transport a [`crate::channel::Channel`] is bound to.
pub trait Connection: Send + Sync {
    /// Reserves `size` bytes and returns a handle to write into them.
    fn prepare(&self, size: usize) -> Box<dyn WriteHandle>;

    /// Arranges for `callback` to fire once per inbound delivery. Connections
    /// support only one registered callback at a time; registering a new one
    /// replaces the previous.
    fn receive(&self, callback: ReceiveCallback);

    fn close(&self);

    fn flush(&self);

    fn info(&self) -> String;
}

pub type ConnectionRef = Arc<dyn Connection>;

impl fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Connection({})", self.info())
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    //! An in-memory duplex [`Connection`] pair, in the style of the
    //! teacher's `server::testing` fixtures — enough to drive the channel
    //! end to end without a real socket.

    use super::*;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    struct ChannelWriteHandle {
        tx: mpsc::UnboundedSender<Bytes>,
    }

    impl WriteHandle for ChannelWriteHandle {
        fn write(&mut self, bytes: &[u8]) -> Result<(), RpcError> {
            self.tx
                .send(Bytes::copy_from_slice(bytes))
                .map_err(|_| RpcError::ChannelClosed("peer dropped".into()))
        }
    }

    pub struct MemoryConnection {
        tx: mpsc::UnboundedSender<Bytes>,
        rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
        // Shared so `receive()` can be called again later (e.g. around a
        // `ChannelSink::set_connection` swap) and simply replace which
        // callback the already-spawned pump delivers to, per the trait's
        // documented "replaces the previous" contract, instead of requiring
        // a fresh `tokio::spawn` (and a second `rx.take()`) every time.
        callback: Arc<Mutex<ReceiveCallback>>,
        closed: Mutex<bool>,
        name: String,
    }

    fn noop_callback() -> ReceiveCallback {
        Box::new(|_| {})
    }

    impl MemoryConnection {
        /// Builds a connected pair: writes to `a` are delivered to `b`'s
        /// receive callback and vice versa.
        pub fn pair(name_a: &str, name_b: &str) -> (Arc<MemoryConnection>, Arc<MemoryConnection>) {
            let (a_tx, b_rx) = mpsc::unbounded_channel();
            let (b_tx, a_rx) = mpsc::unbounded_channel();
            let a = Arc::new(MemoryConnection {
                tx: a_tx,
                rx: Mutex::new(Some(a_rx)),
                callback: Arc::new(Mutex::new(noop_callback())),
                closed: Mutex::new(false),
                name: name_a.to_string(),
            });
            let b = Arc::new(MemoryConnection {
                tx: b_tx,
                rx: Mutex::new(Some(b_rx)),
                callback: Arc::new(Mutex::new(noop_callback())),
                closed: Mutex::new(false),
                name: name_b.to_string(),
            });
            (a, b)
        }
    }

    impl Connection for MemoryConnection {
        fn prepare(&self, _size: usize) -> Box<dyn WriteHandle> {
            Box::new(ChannelWriteHandle { tx: self.tx.clone() })
        }

        fn receive(&self, callback: ReceiveCallback) {
            *self.callback.lock() = callback;

            let Some(mut rx) = self.rx.lock().take() else {
                // Pump already spawned on a prior `receive()` call; it reads
                // the callback cell fresh on every delivery, so the swap
                // above is all that's needed.
                return;
            };
            let callback_cell = self.callback.clone();
            tokio::spawn(async move {
                while let Some(bytes) = rx.recv().await {
                    (*callback_cell.lock())(Ok(bytes));
                }
                (*callback_cell.lock())(Err(RpcError::ChannelClosed("peer closed".into())));
            });
        }

        fn close(&self) {
            *self.closed.lock() = true;
        }

        fn flush(&self) {}

        fn info(&self) -> String {
            format!("memory://{}", self.name)
        }
    }
}
