// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Single-shot completion cell (spec §4.2, §4.8).
//!
//! [`RawFuture`] is the untyped primitive the sink completes; [`ResponseFuture<T>`]
//! is the typed wrapper a caller gets back from [`crate::channel::Channel::call_method`],
//! lazily parsing the response body the way the teacher's own client futures
//! defer deserialization until the caller actually asks for it.

use crate::base_packet::BasePacket;
use crate::error::RpcError;
use crate::message::Message;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

type Callback = Box<dyn FnOnce(&RawFuture) + Send>;

enum State {
    Pending(Option<Callback>),
    Ready(Bytes),
    Failed(Arc<RpcError>),
}

struct Inner {
    state: Mutex<State>,
    base: Mutex<Option<BasePacket>>,
    notify: Notify,
}

/// Untyped single-shot result cell: holds either a payload stream, an
/// error, or neither. Monotonic — `Pending -> Ready | Failed` exactly once;
/// later completions are silently dropped (spec §4.8).
#[derive(Clone)]
pub struct RawFuture(Arc<Inner>);

impl RawFuture {
    pub fn new() -> Self {
        RawFuture(Arc::new(Inner {
            state: Mutex::new(State::Pending(None)),
            base: Mutex::new(None),
            notify: Notify::new(),
        }))
    }

    /// Binds the response envelope. Spec's ordering guarantee: a caller
    /// that observes a ready stream via [`Self::wait`] always sees the base
    /// set first, since [`crate::sink::ChannelSink::pop`] calls this before
    /// completing the future.
    pub fn set_base(&self, base: BasePacket) {
        *self.0.base.lock() = Some(base);
    }

    pub fn get_base(&self) -> Option<BasePacket> {
        self.0.base.lock().clone()
    }

    pub fn complete_with_stream(&self, data: Bytes) {
        self.complete(State::Ready(data));
    }

    pub fn complete_with_error(&self, e: RpcError) {
        self.complete(State::Failed(Arc::new(e)));
    }

    fn complete(&self, new_state: State) {
        let callback = {
            let mut state = self.0.state.lock();
            match &*state {
                State::Pending(_) => {
                    let old = std::mem::replace(&mut *state, new_state);
                    match old {
                        State::Pending(cb) => cb,
                        _ => unreachable!(),
                    }
                }
                // Already terminal: idempotent no-op.
                _ => return,
            }
        };
        self.0.notify.notify_waiters();
        if let Some(cb) = callback {
            cb(self);
        }
    }

    /// Registers a callback fired on the completing context. If already
    /// complete, invoked synchronously and immediately.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(&RawFuture) + Send + 'static,
    {
        let already_done = {
            let mut state = self.0.state.lock();
            match &mut *state {
                State::Pending(slot) => {
                    *slot = Some(Box::new(f));
                    false
                }
                _ => true,
            }
        };
        if already_done {
            f(self);
        }
    }

    pub fn is_ready(&self) -> bool {
        !matches!(&*self.0.state.lock(), State::Pending(_))
    }

    fn try_result(&self) -> Option<Result<Bytes, RpcError>> {
        match &*self.0.state.lock() {
            State::Pending(_) => None,
            State::Ready(data) => Some(Ok(data.clone())),
            State::Failed(e) => Some(Err(clone_error(e))),
        }
    }

    /// Awaits completion from within the reactor (spec §4.2 `wait()`'s
    /// async form — drives forward progress without parking a thread).
    pub async fn wait_async(&self) -> Result<Bytes, RpcError> {
        loop {
            if let Some(r) = self.try_result() {
                return r;
            }
            let notified = self.0.notify.notified();
            if let Some(r) = self.try_result() {
                return r;
            }
            notified.await;
        }
    }

    /// Blocks the current thread until ready. When called from inside a
    /// multi-threaded `tokio` runtime this offloads the wait to another
    /// worker (`block_in_place`) so the calling task doesn't starve the
    /// reactor it depends on, per spec §5's suspension-point requirement.
    /// Callers on a current-thread runtime must not call this from the
    /// runtime thread; use [`Self::wait_async`] there instead.
    pub fn wait(&self) -> Result<Bytes, RpcError> {
        if let Some(r) = self.try_result() {
            return r;
        }
        let this = self.clone();
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(this.wait_async())
        })
    }
}

impl Default for RawFuture {
    fn default() -> Self {
        Self::new()
    }
}

fn clone_error(e: &Arc<RpcError>) -> RpcError {
    // RpcError isn't Clone (it carries a non-Clone io::Error today via
    // `From`), so failed futures hand back a flattened re-description on
    // every access beyond the first.
    RpcError::FreeformRemote(e.to_string())
}

/// Typed view over a [`RawFuture`], parsing the response body as `T` on
/// first access and caching the result plus any trailing stream bytes.
pub struct ResponseFuture<T: Message + Default> {
    raw: RawFuture,
    parsed: Mutex<Option<(Arc<T>, Bytes)>>,
}

impl<T: Message + Default> ResponseFuture<T> {
    pub fn new(raw: RawFuture) -> Self {
        ResponseFuture {
            raw,
            parsed: Mutex::new(None),
        }
    }

    fn parse(&self, data: &Bytes) -> Result<(Arc<T>, Bytes), RpcError> {
        let mut buf = data.clone();
        let payload = crate::base_packet::read_length_prefixed(&mut buf)?
            .unwrap_or_default();
        let mut message = T::default();
        message.decode_into(&payload)?;
        Ok((Arc::new(message), buf))
    }

    /// Blocks for the response and returns the parsed body.
    pub fn wait(&self) -> Result<Arc<T>, RpcError> {
        let data = self.raw.wait()?;
        self.cache_and_get(&data)
    }

    pub async fn wait_async(&self) -> Result<Arc<T>, RpcError> {
        let data = self.raw.wait_async().await?;
        self.cache_and_get(&data)
    }

    fn cache_and_get(&self, data: &Bytes) -> Result<Arc<T>, RpcError> {
        let mut cache = self.parsed.lock();
        if let Some((msg, _)) = &*cache {
            return Ok(msg.clone());
        }
        let (msg, stream) = self.parse(data)?;
        *cache = Some((msg.clone(), stream));
        Ok(msg)
    }

    /// The trailing stream bytes, valid once the response has been parsed
    /// (calling [`Self::wait`]/[`Self::wait_async`] first, as the teacher's
    /// `Future<T>::Stream()` does via its own `Response()`).
    pub fn stream(&self) -> Bytes {
        self.parsed
            .lock()
            .as_ref()
            .map(|(_, s)| s.clone())
            .unwrap_or_default()
    }

    pub fn is_ready(&self) -> bool {
        self.raw.is_ready()
    }

    pub fn base(&self) -> Option<BasePacket> {
        self.raw.get_base()
    }

    /// Registers a completion callback. Fires exactly once; if the future
    /// was already complete at registration time, fires synchronously.
    pub fn on_complete<F>(self: Arc<Self>, f: F)
    where
        F: FnOnce(Result<Arc<T>, RpcError>) + Send + 'static,
    {
        let this = self.clone();
        self.raw.on_complete(move |raw| {
            let result = raw.try_result_pub().and_then(|data| this.cache_and_get(&data));
            f(result);
        });
    }
}

// Small private extension so `on_complete`'s callback can reuse try_result
// without widening RawFuture's public surface with a confusing name.
impl RawFuture {
    fn try_result_pub(&self) -> Result<Bytes, RpcError> {
        self.try_result().unwrap_or_else(|| {
            Err(RpcError::Protocol("on_complete fired before completion".into()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_exactly_once() {
        let f = RawFuture::new();
        f.complete_with_stream(Bytes::from_static(b"first"));
        f.complete_with_stream(Bytes::from_static(b"second"));
        assert_eq!(f.wait_async().await.unwrap(), Bytes::from_static(b"first"));
    }

    #[tokio::test]
    async fn on_complete_fires_synchronously_if_already_done() {
        let f = RawFuture::new();
        f.complete_with_stream(Bytes::from_static(b"data"));
        let (tx, rx) = tokio::sync::oneshot::channel();
        f.on_complete(move |raw| {
            let _ = tx.send(raw.is_ready());
        });
        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn on_complete_fires_on_later_completion() {
        let f = RawFuture::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        f.on_complete(move |raw| {
            let _ = tx.send(raw.try_result_pub().unwrap());
        });
        f.complete_with_stream(Bytes::from_static(b"later"));
        assert_eq!(rx.await.unwrap(), Bytes::from_static(b"later"));
    }
}
