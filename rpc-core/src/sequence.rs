// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Fragmentation contract and a concrete chunked implementation (spec §6
//! `SequenceCollector`, §4.4 fragmented [`crate::channel::Channel`]).
//!
//! Spec §6 specifies the collector's *interface*, not its internals. This
//! module supplies one concrete scheme (length-prefixed chunks terminated
//! by a zero-length chunk) as an implementation decision — see DESIGN.md —
//! so the fragmented channel variant is exercisable end to end.

use crate::connection::{Connection, WriteHandle};
use crate::error::RpcError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;

/// Reassembles a chunked sub-stream into full logical frames.
pub trait SequenceCollector: Send {
    /// Ingests one fragment delivered by the transport.
    fn on_new_stream(&mut self, fragment: Bytes) -> Result<(), RpcError>;
}

/// Invoked once per fully reassembled logical frame.
pub type FullStreamCallback = Box<dyn Fn(Bytes) + Send + Sync>;

/// Chunk format: `u32 len | bytes`, repeated; a `len == 0` chunk marks the
/// end of the current logical frame and triggers delivery.
pub struct ChunkedCollector {
    buffer: BytesMut,
    on_full: FullStreamCallback,
}

impl ChunkedCollector {
    pub fn new(on_full: FullStreamCallback) -> Self {
        ChunkedCollector {
            buffer: BytesMut::new(),
            on_full,
        }
    }
}

impl SequenceCollector for ChunkedCollector {
    fn on_new_stream(&mut self, mut fragment: Bytes) -> Result<(), RpcError> {
        if fragment.len() < 4 {
            return Err(RpcError::Protocol("fragment shorter than its length prefix".into()));
        }
        let len = fragment.get_u32_le() as usize;
        if len == 0 {
            if fragment.len() != 0 {
                return Err(RpcError::Protocol("terminator chunk carried trailing bytes".into()));
            }
            let collected = self.buffer.split().freeze();
            (self.on_full)(collected);
            return Ok(());
        }
        if fragment.len() != len {
            return Err(RpcError::Protocol(format!(
                "chunk length mismatch: header said {len}, fragment carried {}",
                fragment.len()
            )));
        }
        self.buffer.extend_from_slice(&fragment);
        Ok(())
    }
}

struct SequencedWriteHandle {
    inner: Box<dyn WriteHandle>,
    chunk_size: usize,
}

impl WriteHandle for SequencedWriteHandle {
    fn write(&mut self, bytes: &[u8]) -> Result<(), RpcError> {
        for chunk in bytes.chunks(self.chunk_size.max(1)) {
            let mut framed = BytesMut::with_capacity(4 + chunk.len());
            framed.put_u32_le(chunk.len() as u32);
            framed.put_slice(chunk);
            self.inner.write(&framed)?;
        }
        Ok(())
    }
}

impl Drop for SequencedWriteHandle {
    fn drop(&mut self) {
        let mut terminator = BytesMut::with_capacity(4);
        terminator.put_u32_le(0);
        let _ = self.inner.write(&terminator);
    }
}

/// Write-side adapter pairing [`ChunkedCollector`]'s framing: wraps a real
/// [`Connection`] so every frame written through it is chunked the same way
/// the collector expects to reassemble it.
pub struct SequencedConnection {
    inner: Arc<dyn Connection>,
    chunk_size: usize,
}

impl SequencedConnection {
    pub fn new(inner: Arc<dyn Connection>, chunk_size: usize) -> Self {
        SequencedConnection { inner, chunk_size }
    }
}

impl Connection for SequencedConnection {
    fn prepare(&self, size: usize) -> Box<dyn WriteHandle> {
        Box::new(SequencedWriteHandle {
            inner: self.inner.prepare(size),
            chunk_size: self.chunk_size,
        })
    }

    fn receive(&self, callback: crate::connection::ReceiveCallback) {
        self.inner.receive(callback);
    }

    fn close(&self) {
        self.inner.close();
    }

    fn flush(&self) {
        self.inner.flush();
    }

    fn info(&self) -> String {
        format!("sequenced({})", self.inner.info())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc as StdArc;

    #[test]
    fn reassembles_chunks_across_calls() {
        let collected = StdArc::new(Mutex::new(Vec::new()));
        let collected2 = collected.clone();
        let mut collector = ChunkedCollector::new(Box::new(move |bytes| {
            collected2.lock().push(bytes);
        }));

        let payload = b"hello world, this is a logical frame";
        for chunk in payload.chunks(8) {
            let mut framed = BytesMut::with_capacity(4 + chunk.len());
            framed.put_u32_le(chunk.len() as u32);
            framed.put_slice(chunk);
            collector.on_new_stream(framed.freeze()).unwrap();
        }
        let mut terminator = BytesMut::with_capacity(4);
        terminator.put_u32_le(0);
        collector.on_new_stream(terminator.freeze()).unwrap();

        let got = collected.lock();
        assert_eq!(got.len(), 1);
        assert_eq!(&got[0][..], &payload[..]);
    }
}
