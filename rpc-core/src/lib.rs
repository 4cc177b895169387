// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Transport-agnostic core of a bidirectional, multiplexed schema-RPC
//! runtime: frames outbound calls and correlates their responses, dispatches
//! inbound calls into registered services, and optionally fragments a
//! logical frame across several transport deliveries.
//!
//! The byte transport itself, the schema-compiler plugin that would emit
//! per-service stubs, and CLI/logging policy are out of scope — see
//! [`connection`] and [`service`] for the contracts this crate relies on
//! instead of implementing them.

pub mod base_packet;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod future;
pub mod local_handler;
pub mod message;
pub mod sequence;
pub mod service;
pub mod sink;

pub use base_packet::{BasePacket, Direction, Frame, MethodIndex, PacketId, ServiceId};
pub use channel::{Channel, RequestHandler, SequencedChannel};
pub use config::Config;
pub use connection::{Connection, ConnectionRef, WriteHandle};
pub use error::{make_exception, register_exception, RpcError};
pub use future::{RawFuture, ResponseFuture};
pub use local_handler::LocalHandler;
pub use message::{BincodeMessage, Message};
pub use sequence::{ChunkedCollector, SequenceCollector, SequencedConnection};
pub use service::{
    MethodDescriptor, Request, RequestBacking, RequestEnvelope, Response, ResponseBacking, ResponseEnvelope,
    Service, ServiceDescriptor, StreamKind, StreamRequest, StreamResponse,
};
pub use sink::{ChannelSink, ConnectionWrapper, ResponseObserver};
