// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The generated-stub contract (spec §6): the shape of the code a schema
//! compiler plugin would emit, implemented here as plain traits and
//! wrapper structs instead of generated from a `.proto`/IDL file — the
//! plugin itself is out of scope (spec §1).
//!
//! Redesign flag (spec §9): the C++ original reaches these backing fields
//! via `dynamic_cast` onto private holder base classes. This crate instead
//! exposes them through small, explicit, object-safe traits
//! ([`RequestBacking`], [`ResponseBacking`]) that every wrapper implements
//! directly — no downcasting required.

use crate::base_packet::{BasePacket, MethodIndex, ServiceId};
use crate::error::RpcError;
use crate::message::Message;
use crate::sink::ChannelSink;
use bytes::Bytes;
use std::ops::{Deref, DerefMut};
use std::sync::Weak;

/// Identifies one method within a service's descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub index: MethodIndex,
    pub name: &'static str,
}

/// Identifies a service and its extension-bound `ServiceId` (spec §6's
/// `GetExtension(proto::ServiceId)`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub id: ServiceId,
    pub name: &'static str,
    pub methods: &'static [MethodDescriptor],
}

impl ServiceDescriptor {
    pub fn method(&self, index: MethodIndex) -> Option<&'static MethodDescriptor> {
        self.methods.iter().find(|m| m.index == index)
    }
}

/// Per-method stream annotation the generator recognizes at field number
/// `60002` (spec §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    None,
    In,
    Out,
    InOut,
}

/// Object-safe backing fields every request wrapper carries
/// (`RequestAndInfoHolder`/`StreamHolder` in the C++ original).
pub trait RequestBacking: Send {
    fn set_caller(&mut self, caller_id: String);
    fn caller(&self) -> &str;
    fn set_response_required(&mut self, required: bool);
    fn is_response_required(&self) -> bool;
    fn set_method(&mut self, method: MethodDescriptor);
    fn set_stream(&mut self, stream: Bytes);
    fn stream(&self) -> Bytes;
    /// The channel the request arrived on, installed by
    /// [`crate::local_handler::LocalHandler`] alongside the response's own
    /// binding (spec §4.5 step 4) so a service method can issue further
    /// calls back out over the same channel if it needs to.
    fn set_channel(&mut self, sink: Weak<ChannelSink>);
    fn channel(&self) -> Weak<ChannelSink>;
}

/// Object-safe backing fields every response wrapper carries
/// (`ResponseHolder` in the C++ original), plus the scoped-send lifecycle
/// (spec §4.6, §9 "explicit send rather than destructor order").
pub trait ResponseBacking: Send {
    fn bind(&mut self, base: BasePacket, method: MethodDescriptor, service: ServiceDescriptor, sink: Weak<ChannelSink>);
    fn set_exception(&mut self, e: RpcError);
    fn base_mut(&mut self) -> &mut BasePacket;
    fn base(&self) -> &BasePacket;
    /// Sends the response exactly once. A no-op if unbound, fire-and-forget
    /// (`packet_id == 0`), the channel is gone, or already sent.
    fn send(&mut self);
}

struct ResponseState {
    base: Option<BasePacket>,
    method: Option<MethodDescriptor>,
    service: Option<ServiceDescriptor>,
    sink: Weak<ChannelSink>,
    sent: bool,
    exception: Option<RpcError>,
}

impl Default for ResponseState {
    fn default() -> Self {
        ResponseState {
            base: None,
            method: None,
            service: None,
            sink: Weak::new(),
            sent: false,
            exception: None,
        }
    }
}

fn bind_state(state: &mut ResponseState, base: BasePacket, method: MethodDescriptor, service: ServiceDescriptor, sink: Weak<ChannelSink>) {
    state.base = Some(base);
    state.method = Some(method);
    state.service = Some(service);
    state.sink = sink;
}

/// Shared send logic for [`Response`] and [`StreamResponse`] (spec §4.6).
fn send_response(state: &mut ResponseState, body_initialized: bool, encode_body: impl FnOnce() -> Result<Vec<u8>, RpcError>, stream: &[u8]) {
    if state.sent {
        return;
    }
    let Some(base) = state.base.as_mut() else {
        return; // response is not initialized (spec §9 open question)
    };
    if base.packet_id == 0 {
        return; // fire-and-forget: no response expected
    }
    let Some(sink) = state.sink.upgrade() else {
        return; // channel is gone
    };

    if !base.has_error() {
        if let Some(e) = state.exception.take() {
            bind_error_onto(base, e, state.method, state.service);
        } else if !body_initialized {
            let method_name = state.method.map(|m| m.name).unwrap_or("<unknown>");
            bind_error_onto(
                base,
                RpcError::RequestValidation(format!("response for {method_name} is not initialized")),
                state.method,
                state.service,
            );
        }
    }

    let payload = if base.has_error() {
        None
    } else {
        match encode_body() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                bind_error_onto(base, e, state.method, state.service);
                None
            }
        }
    };

    if base.has_error() {
        tracing::error!(target: "rpc", error = %String::from_utf8_lossy(&base.error), "sending error response");
    } else {
        tracing::trace!(target: "rpc", packet_id = base.packet_id, "sending response");
    }

    let _ = sink.push_response(base, payload.as_deref(), payload.as_ref().map(|_| stream).unwrap_or(&[]));
    state.sent = true;
}

fn bind_error_onto(base: &mut BasePacket, e: RpcError, method: Option<MethodDescriptor>, _service: Option<ServiceDescriptor>) {
    match e {
        RpcError::StructuredRemote { type_name, payload, .. } => {
            // Spec §4.7: `error_id = CRC32(full_qualified_name)` of the
            // thrown schema message, the same name `register_exception::<T>()`
            // hashed on the decoding side — not the method name.
            base.error_id = crate::error::registry::crc32(&type_name);
            base.error = payload;
        }
        other => {
            let method_name = method.map(|m| m.name).unwrap_or("<unknown>");
            base.error_id = 0;
            base.error = Bytes::from(format!("Method [{method_name}] failed with: {other}"));
        }
    }
}

/// `Request<T>`: a request body `T` plus caller/method/stream-required
/// backing fields, with no trailing byte stream (spec §6).
pub struct Request<T: Message> {
    body: T,
    caller_id: String,
    response_required: bool,
    method: Option<MethodDescriptor>,
    channel: Weak<ChannelSink>,
}

impl<T: Message + Default> Request<T> {
    pub fn new(body: T) -> Self {
        Request {
            body,
            caller_id: String::new(),
            response_required: false,
            method: None,
            channel: Weak::new(),
        }
    }
}

impl<T: Message> Deref for Request<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.body
    }
}

impl<T: Message> DerefMut for Request<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.body
    }
}

impl<T: Message> Message for Request<T> {
    fn type_name(&self) -> &'static str {
        self.body.type_name()
    }
    fn is_initialized(&self) -> bool {
        self.body.is_initialized()
    }
    fn encode(&self) -> Result<Vec<u8>, RpcError> {
        self.body.encode()
    }
    fn decode_into(&mut self, bytes: &[u8]) -> Result<(), RpcError> {
        self.body.decode_into(bytes)
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl<T: Message> RequestBacking for Request<T> {
    fn set_caller(&mut self, caller_id: String) {
        self.caller_id = caller_id;
    }
    fn caller(&self) -> &str {
        &self.caller_id
    }
    fn set_response_required(&mut self, required: bool) {
        self.response_required = required;
    }
    fn is_response_required(&self) -> bool {
        self.response_required
    }
    fn set_method(&mut self, method: MethodDescriptor) {
        self.method = Some(method);
    }
    fn set_stream(&mut self, _stream: Bytes) {
        // Plain `Request<T>` has no stream slot; callers wanting the
        // trailing bytes declare the method `StreamRequest` instead.
    }
    fn stream(&self) -> Bytes {
        Bytes::new()
    }
    fn set_channel(&mut self, sink: Weak<ChannelSink>) {
        self.channel = sink;
    }
    fn channel(&self) -> Weak<ChannelSink> {
        self.channel.clone()
    }
}

/// `StreamRequest<T>`: like [`Request<T>`] but also carries the trailing
/// opaque byte stream (spec §6, stream annotation `In`/`InOut`).
pub struct StreamRequest<T: Message> {
    inner: Request<T>,
    stream: Bytes,
}

impl<T: Message + Default> StreamRequest<T> {
    pub fn new(body: T, stream: Bytes) -> Self {
        StreamRequest {
            inner: Request::new(body),
            stream,
        }
    }
}

impl<T: Message> Deref for StreamRequest<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.inner.body
    }
}

impl<T: Message> DerefMut for StreamRequest<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner.body
    }
}

impl<T: Message> Message for StreamRequest<T> {
    fn type_name(&self) -> &'static str {
        self.inner.type_name()
    }
    fn is_initialized(&self) -> bool {
        self.inner.is_initialized()
    }
    fn encode(&self) -> Result<Vec<u8>, RpcError> {
        self.inner.encode()
    }
    fn decode_into(&mut self, bytes: &[u8]) -> Result<(), RpcError> {
        self.inner.decode_into(bytes)
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl<T: Message> RequestBacking for StreamRequest<T> {
    fn set_caller(&mut self, caller_id: String) {
        self.inner.set_caller(caller_id);
    }
    fn caller(&self) -> &str {
        self.inner.caller()
    }
    fn set_response_required(&mut self, required: bool) {
        self.inner.set_response_required(required);
    }
    fn is_response_required(&self) -> bool {
        self.inner.is_response_required()
    }
    fn set_method(&mut self, method: MethodDescriptor) {
        self.inner.set_method(method);
    }
    fn set_stream(&mut self, stream: Bytes) {
        self.stream = stream;
    }
    fn stream(&self) -> Bytes {
        self.stream.clone()
    }
    fn set_channel(&mut self, sink: Weak<ChannelSink>) {
        self.inner.set_channel(sink);
    }
    fn channel(&self) -> Weak<ChannelSink> {
        self.inner.channel()
    }
}

/// `Response<T>`: a response body `T` with no trailing stream. Sends
/// exactly once, either when [`ResponseBacking::send`] is called explicitly
/// by the framework after `call_method` returns, or on drop as a backstop
/// (idempotent, so this never double-sends).
pub struct Response<T: Message> {
    body: T,
    state: ResponseState,
}

impl<T: Message + Default> Response<T> {
    pub fn new() -> Self {
        Response {
            body: T::default(),
            state: ResponseState::default(),
        }
    }
}

impl<T: Message + Default> Default for Response<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Message> Deref for Response<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.body
    }
}

impl<T: Message> DerefMut for Response<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.body
    }
}

impl<T: Message> Message for Response<T> {
    fn type_name(&self) -> &'static str {
        self.body.type_name()
    }
    fn is_initialized(&self) -> bool {
        self.body.is_initialized()
    }
    fn encode(&self) -> Result<Vec<u8>, RpcError> {
        self.body.encode()
    }
    fn decode_into(&mut self, bytes: &[u8]) -> Result<(), RpcError> {
        self.body.decode_into(bytes)
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl<T: Message> ResponseBacking for Response<T> {
    fn bind(&mut self, base: BasePacket, method: MethodDescriptor, service: ServiceDescriptor, sink: Weak<ChannelSink>) {
        bind_state(&mut self.state, base, method, service, sink);
    }
    fn set_exception(&mut self, e: RpcError) {
        self.state.exception = Some(e);
    }
    fn base_mut(&mut self) -> &mut BasePacket {
        self.state.base.as_mut().expect("response base not bound")
    }
    fn base(&self) -> &BasePacket {
        self.state.base.as_ref().expect("response base not bound")
    }
    fn send(&mut self) {
        let body = &self.body;
        send_response(&mut self.state, body.is_initialized(), || body.encode(), &[]);
    }
}

impl<T: Message> Drop for Response<T> {
    fn drop(&mut self) {
        ResponseBacking::send(self);
    }
}

/// `StreamResponse<T>`: like [`Response<T>`] but also carries a trailing
/// opaque byte stream sent after the response body (stream annotation
/// `Out`/`InOut`).
pub struct StreamResponse<T: Message> {
    body: T,
    state: ResponseState,
    stream: Bytes,
}

impl<T: Message + Default> StreamResponse<T> {
    pub fn new() -> Self {
        StreamResponse {
            body: T::default(),
            state: ResponseState::default(),
            stream: Bytes::new(),
        }
    }
}

impl<T: Message + Default> Default for StreamResponse<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Message> StreamResponse<T> {
    pub fn set_stream(&mut self, stream: Bytes) {
        self.stream = stream;
    }
}

impl<T: Message> Deref for StreamResponse<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.body
    }
}

impl<T: Message> DerefMut for StreamResponse<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.body
    }
}

impl<T: Message> Message for StreamResponse<T> {
    fn type_name(&self) -> &'static str {
        self.body.type_name()
    }
    fn is_initialized(&self) -> bool {
        self.body.is_initialized()
    }
    fn encode(&self) -> Result<Vec<u8>, RpcError> {
        self.body.encode()
    }
    fn decode_into(&mut self, bytes: &[u8]) -> Result<(), RpcError> {
        self.body.decode_into(bytes)
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl<T: Message> ResponseBacking for StreamResponse<T> {
    fn bind(&mut self, base: BasePacket, method: MethodDescriptor, service: ServiceDescriptor, sink: Weak<ChannelSink>) {
        bind_state(&mut self.state, base, method, service, sink);
    }
    fn set_exception(&mut self, e: RpcError) {
        self.state.exception = Some(e);
    }
    fn base_mut(&mut self) -> &mut BasePacket {
        self.state.base.as_mut().expect("response base not bound")
    }
    fn base(&self) -> &BasePacket {
        self.state.base.as_ref().expect("response base not bound")
    }
    fn send(&mut self) {
        let body = &self.body;
        let stream = self.stream.clone();
        send_response(&mut self.state, body.is_initialized(), || body.encode(), &stream);
    }
}

impl<T: Message> Drop for StreamResponse<T> {
    fn drop(&mut self) {
        ResponseBacking::send(self);
    }
}

/// A server-side, type-erased RPC service (spec §3 "polymorphic over the
/// capability set"). Generated code implements this; this crate's tests
/// hand-write the equivalent.
pub trait Service: Send + Sync {
    fn id(&self) -> ServiceId;
    fn name(&self) -> &str;
    fn descriptor(&self) -> ServiceDescriptor;

    /// Returns a freshly constructed, empty request wrapper of the flavor
    /// `method` declares (`Request<T>` or `StreamRequest<T>`). The caller
    /// parses the body into it and, for `StreamRequest`, attaches the
    /// trailing stream separately (spec §4.5 steps 2-3).
    fn create_request(&self, method: &MethodDescriptor) -> Box<dyn RequestEnvelope>;
    fn create_response(&self, method: &MethodDescriptor) -> Box<dyn ResponseEnvelope>;

    /// Dispatches by `method.index`. Implementations should fill in the
    /// response via its body fields (through [`Deref`]/[`DerefMut`]) or
    /// call [`ResponseBacking::set_exception`]; errors returned here are
    /// also converted onto the response by the caller (spec §4.5 step 5).
    fn call_method(
        &self,
        method: &MethodDescriptor,
        request: &dyn RequestEnvelope,
        response: &mut dyn ResponseEnvelope,
    ) -> Result<(), RpcError>;
}

/// A boxed request, type-erased but able to receive its body bytes.
pub trait RequestEnvelope: Message + RequestBacking {}
impl<T: Message + RequestBacking> RequestEnvelope for T {}

/// A boxed response, type-erased but able to send itself.
pub trait ResponseEnvelope: Message + ResponseBacking {}
impl<T: Message + ResponseBacking> ResponseEnvelope for T {}
