// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The wire envelope and framing (spec §3, §4.1).
//!
//! A [`Frame`] is the atomic unit the transport delivers (sequenced variant)
//! or that a [`crate::sequence::SequenceCollector`] reassembles (fragmented
//! variant): a length-prefixed [`BasePacket`], an optional length-prefixed
//! payload message, and a trailing opaque byte stream running to frame end.

use crate::connection::WriteHandle;
use crate::error::RpcError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

pub type ServiceId = u32;
pub type MethodIndex = u32;
pub type PacketId = u32;

/// Frames above this size are streamed directly into the transport's write
/// buffer instead of being assembled in one contiguous allocation first
/// (spec §4.1's "~100 KiB" suggestion).
pub const MAX_IN_MEMORY_FRAME_SIZE: usize = 100 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Request,
    Response,
}

impl Default for Direction {
    fn default() -> Self {
        Direction::Request
    }
}

/// The fixed-format envelope carried by every frame.
///
/// `packet_id == 0` means "fire-and-forget, no response expected" (spec
/// §3). `error`/`error_id` are populated only on response frames that carry
/// a failure; a nonzero `error_id` selects the structured decoder.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BasePacket {
    pub service_id: ServiceId,
    pub method_index: MethodIndex,
    pub packet_id: PacketId,
    pub direction: Direction,
    pub caller_id: String,
    pub error: Bytes,
    pub error_id: u32,
}

impl BasePacket {
    pub fn new_request(service_id: ServiceId, method_index: MethodIndex, packet_id: PacketId) -> Self {
        BasePacket {
            service_id,
            method_index,
            packet_id,
            direction: Direction::Request,
            ..Default::default()
        }
    }

    /// Clones `self` into a response envelope for the same packet id,
    /// clearing any error fields (spec §4.5 step 4: "clone base, flip
    /// direction to Response").
    pub fn to_response(&self) -> Self {
        BasePacket {
            direction: Direction::Response,
            error: Bytes::new(),
            error_id: 0,
            ..self.clone()
        }
    }

    pub fn has_error(&self) -> bool {
        self.error_id != 0 || !self.error.is_empty()
    }
}

/// One atomic `{base, payload?, stream?}` block (spec §3 `Frame`).
///
/// `payload` is the length-prefixed message body — the request body on a
/// request frame, the response body on a response frame. `stream` is
/// whatever bytes remain after the payload block; it is meaningful only for
/// `StreamRequest`/`StreamResponse` wrappers and is empty otherwise.
#[derive(Clone, Debug, Default)]
pub struct Frame {
    pub base: BasePacket,
    pub payload: Option<Bytes>,
    pub stream: Bytes,
}

/// Reads one length-prefixed block: a little-endian `u32` size followed by
/// exactly that many bytes. A size of `0` yields `None` (spec §4.1's
/// end-of-stream sentinel, consumed by the fragmentation layer).
pub fn read_length_prefixed(buf: &mut Bytes) -> Result<Option<Bytes>, RpcError> {
    if buf.len() < 4 {
        return Err(RpcError::Protocol("truncated length prefix".into()));
    }
    let size = buf.get_u32_le() as usize;
    if size == 0 {
        return Ok(None);
    }
    if buf.len() < size {
        return Err(RpcError::Protocol(format!(
            "truncated frame: expected {size} bytes, have {}",
            buf.len()
        )));
    }
    Ok(Some(buf.split_to(size)))
}

fn write_length_prefixed(out: &mut BytesMut, bytes: &[u8]) {
    out.put_u32_le(bytes.len() as u32);
    out.put_slice(bytes);
}

/// Decodes a [`Frame`] from a byte buffer previously delivered as one
/// logical frame by the transport (or reassembled by the fragmentation
/// layer). The base block is mandatory; the payload block is present
/// exactly when the sender provided one.
pub fn decode_frame(mut buf: Bytes) -> Result<Frame, RpcError> {
    let base_bytes = read_length_prefixed(&mut buf)?
        .ok_or_else(|| RpcError::Protocol("empty base packet".into()))?;
    let base: BasePacket = bincode::deserialize(&base_bytes)?;

    // A payload block is present iff there are at least 4 more bytes and
    // they don't immediately run out — callers that sent no payload simply
    // stop after the base block, so an empty remainder means "no payload".
    let payload = if buf.is_empty() {
        None
    } else {
        read_length_prefixed(&mut buf)?
    };

    Ok(Frame {
        base,
        payload,
        stream: buf,
    })
}

/// Encodes a [`Frame`] to its on-wire representation.
///
/// `bytes_written == 4 + base_size + [4 + payload_size] + stream_size`
/// exactly, per the spec §8 universal invariant.
pub fn encode_frame(base: &BasePacket, payload: Option<&[u8]>, stream: &[u8]) -> Result<BytesMut, RpcError> {
    let base_bytes = bincode::serialize(base)?;
    let mut total = 4 + base_bytes.len() + stream.len();
    if let Some(p) = payload {
        total += 4 + p.len();
    }
    let mut out = BytesMut::with_capacity(total);
    write_length_prefixed(&mut out, &base_bytes);
    if let Some(p) = payload {
        write_length_prefixed(&mut out, p);
    }
    out.put_slice(stream);
    Ok(out)
}

/// The number of bytes [`encode_frame`] would produce, computed without
/// assembling the frame — lets [`crate::sink::ChannelSink`] decide whether a
/// frame is small enough to buffer contiguously before deciding how to
/// write it (spec §4.1).
pub fn frame_len(base: &BasePacket, payload: Option<&[u8]>, stream: &[u8]) -> Result<usize, RpcError> {
    let base_len = bincode::serialized_size(base).map_err(RpcError::from)? as usize;
    let mut total = 4 + base_len + stream.len();
    if let Some(p) = payload {
        total += 4 + p.len();
    }
    Ok(total)
}

/// Writes a frame straight into `handle` as separate length-prefixed
/// pieces instead of assembling it into one contiguous buffer first (spec
/// §4.1: frames above the in-memory threshold "stream directly into
/// transport buffers"). `handle` must already have reserved at least
/// [`frame_len`]'s result via [`crate::connection::Connection::prepare`].
pub fn write_frame_direct(
    handle: &mut dyn WriteHandle,
    base: &BasePacket,
    payload: Option<&[u8]>,
    stream: &[u8],
) -> Result<(), RpcError> {
    let base_bytes = bincode::serialize(base)?;
    let mut len_prefix = [0u8; 4];

    len_prefix.copy_from_slice(&(base_bytes.len() as u32).to_le_bytes());
    handle.write(&len_prefix)?;
    handle.write(&base_bytes)?;

    if let Some(p) = payload {
        len_prefix.copy_from_slice(&(p.len() as u32).to_le_bytes());
        handle.write(&len_prefix)?;
        handle.write(p)?;
    }

    if !stream.is_empty() {
        handle.write(stream)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_base_only() {
        let base = BasePacket::new_request(7, 2, 99);
        let wire = encode_frame(&base, None, &[]).unwrap();
        let frame = decode_frame(wire.freeze()).unwrap();
        assert_eq!(frame.base, base);
        assert!(frame.payload.is_none());
        assert!(frame.stream.is_empty());
    }

    #[test]
    fn round_trip_with_payload_and_stream() {
        let base = BasePacket::new_request(1, 1, 5);
        let payload = b"hello".to_vec();
        let stream = b"trailing-bytes".to_vec();
        let wire = encode_frame(&base, Some(&payload), &stream).unwrap();
        assert_eq!(wire.len(), 4 + bincode::serialize(&base).unwrap().len() + 4 + payload.len() + stream.len());
        let frame = decode_frame(wire.freeze()).unwrap();
        assert_eq!(frame.base, base);
        assert_eq!(frame.payload.unwrap(), Bytes::from(payload));
        assert_eq!(frame.stream, Bytes::from(stream));
    }

    struct CollectingHandle(BytesMut);

    impl WriteHandle for CollectingHandle {
        fn write(&mut self, bytes: &[u8]) -> Result<(), RpcError> {
            self.0.put_slice(bytes);
            Ok(())
        }
    }

    #[test]
    fn frame_len_matches_encode_frame_output_size() {
        let base = BasePacket::new_request(3, 4, 5);
        let payload = b"payload-bytes".to_vec();
        let stream = b"stream-bytes".to_vec();

        let expected = frame_len(&base, Some(&payload), &stream).unwrap();
        let wire = encode_frame(&base, Some(&payload), &stream).unwrap();
        assert_eq!(expected, wire.len());
    }

    #[test]
    fn write_frame_direct_produces_the_same_bytes_as_encode_frame() {
        let base = BasePacket::new_request(3, 4, 5);
        let payload = b"payload-bytes".to_vec();
        let stream = b"stream-bytes".to_vec();

        let via_encode = encode_frame(&base, Some(&payload), &stream).unwrap();

        let mut handle = CollectingHandle(BytesMut::new());
        write_frame_direct(&mut handle, &base, Some(&payload), &stream).unwrap();

        assert_eq!(handle.0, via_encode);
    }

    #[test]
    fn zero_length_is_sentinel() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(0);
        let mut bytes = buf.freeze();
        assert!(read_length_prefixed(&mut bytes).unwrap().is_none());
    }
}
