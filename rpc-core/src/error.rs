// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Error kinds for the RPC runtime (spec §7).
//!
//! Mirrors the teacher crate's preference for small, typed errors over
//! `Box<dyn Error>` at API boundaries; the freeform/structured remote split
//! models the wire-level distinction a caller needs to recover a schema
//! message from a failed call.

use bytes::Bytes;
use thiserror::Error;

/// Errors surfaced by the channel/sink/handler machinery.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Malformed frame, unknown direction tag, or a length/size mismatch.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No service registered for the incoming `service_id`, or an unknown
    /// method index within a matched service's descriptor.
    #[error("dispatch error: {0}")]
    Dispatch(String),

    /// A request (or response) body failed its `is_initialized` check.
    #[error("request validation failed: {0}")]
    RequestValidation(String),

    /// The sink is closed; further writes are refused and pending futures
    /// are failed with the recorded close cause (or this variant itself).
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// A packet id collided with one already outstanding in `outgoing`.
    #[error("duplicate packet id {0}")]
    DuplicatePacketId(u32),

    /// The reply carried a nonzero `error_id` decoded into a schema message.
    #[error("remote error ({type_name}): {message}")]
    StructuredRemote {
        type_name: String,
        message: String,
        /// The raw encoded schema message, for callers that want to decode
        /// it themselves via [`crate::error::registered_factory`].
        payload: Bytes,
    },

    /// The reply carried `error_id == 0`; `error` is a human-readable string.
    #[error("remote error: {0}")]
    FreeformRemote(String),
}

impl From<bincode::Error> for RpcError {
    fn from(e: bincode::Error) -> Self {
        RpcError::Protocol(e.to_string())
    }
}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        RpcError::Protocol(e.to_string())
    }
}

impl RpcError {
    /// True for the two "remote told us about a failure" variants, as
    /// opposed to local transport/protocol failures.
    pub fn is_remote(&self) -> bool {
        matches!(self, RpcError::StructuredRemote { .. } | RpcError::FreeformRemote(_))
    }
}

pub(crate) mod registry {
    //! Process-wide exception factory, keyed by CRC32 of the schema
    //! message's fully qualified name (spec §4.7, §9 "Global exception
    //! factory"). Populated once at startup via [`crate::register_exception`]
    //! and read thereafter — no mutation after the first reads are expected,
    //! matching the C++ original's static-init-then-read-only usage.

    use super::RpcError;
    use bytes::Bytes;
    use parking_lot::RwLock;
    use std::collections::HashMap;
    use std::sync::OnceLock;

    type DecodeFn = fn(&Bytes) -> Result<String, RpcError>;

    fn factory() -> &'static RwLock<HashMap<u32, (&'static str, DecodeFn)>> {
        static FACTORY: OnceLock<RwLock<HashMap<u32, (&'static str, DecodeFn)>>> = OnceLock::new();
        FACTORY.get_or_init(|| RwLock::new(HashMap::new()))
    }

    pub fn crc32(text: &str) -> u32 {
        crc32fast::hash(text.as_bytes())
    }

    pub fn register(id: u32, type_name: &'static str, decode: DecodeFn) {
        factory().write().insert(id, (type_name, decode));
    }

    pub fn lookup(id: u32) -> Option<(&'static str, DecodeFn)> {
        factory().read().get(&id).copied()
    }
}

/// Registers a schema message type `T` in the global exception factory,
/// keyed by `CRC32(T::default().type_name())`. Call once at process start for every
/// message type that may be thrown as a structured remote error.
pub fn register_exception<T>()
where
    T: crate::message::Message + Default,
{
    let name = T::default().type_name();
    let id = registry::crc32(name);
    // The closure must capture nothing to coerce to the bare `DecodeFn`
    // pointer `registry::register` stores (monomorphized per `T`, so it
    // still recovers its own type name without closing over the outer
    // `name` binding).
    registry::register(id, name, |bytes| {
        let mut msg = T::default();
        msg.decode_into(bytes)?;
        Ok(format!("{}: {} byte payload", T::default().type_name(), bytes.len()))
    });
}

/// Decodes the error carried by a response [`crate::base_packet::BasePacket`]
/// into an [`RpcError`] (spec §4.7 `make_exception`).
pub fn make_exception(error_id: u32, error: &Bytes) -> RpcError {
    if error_id != 0 {
        if let Some((type_name, decode)) = registry::lookup(error_id) {
            return match decode(error) {
                Ok(message) => RpcError::StructuredRemote {
                    type_name: type_name.to_string(),
                    message,
                    payload: error.clone(),
                },
                Err(e) => RpcError::Protocol(format!("failed to parse proto exception: {e}")),
            };
        }
    }
    RpcError::FreeformRemote(String::from_utf8_lossy(error).into_owned())
}
