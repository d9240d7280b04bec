//! The three consumption shapes over one request queue.
//!
//! - [`RequestHandle::wait`]: block the calling thread for a single value.
//! - [`RequestHandle::result`]: the same value as a future.
//! - [`EventStream`]: every payload in arrival order until `finished`.
//!
//! An empty queue always means "nothing yet", never "done". Whatever the
//! shape, the queue is released from the Correlator when consumption ends,
//! including early abandonment (drop).

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use conduit_types::{
    ClientError, EngineError, Handle, Payload, RequestId, ResponseEvent, ResponseKind,
};
use futures_util::Stream;
use serde_json::Value;

use crate::correlator::EventReceiver;
use crate::dispatcher::Dispatcher;

/// Releases the request's Correlator entry when dropped.
struct QueueLease {
    id: RequestId,
    dispatcher: Arc<Dispatcher>,
}

impl QueueLease {
    fn release(&self) {
        self.dispatcher.correlator().release(self.id);
    }
}

impl Drop for QueueLease {
    fn drop(&mut self) {
        self.release();
    }
}

fn payload_value(payload: Payload) -> Result<Value, ClientError> {
    match payload {
        Payload::Json(value) => Ok(value),
        Payload::Empty => Ok(Value::Null),
        Payload::Opaque(raw) => Err(ClientError::protocol("payload is not valid JSON", raw)),
    }
}

fn engine_error(payload: Payload) -> ClientError {
    match payload {
        Payload::Json(value) => match EngineError::from_payload(&value) {
            Some(err) => ClientError::Engine(err),
            None => ClientError::protocol("malformed error payload", value.to_string()),
        },
        Payload::Empty => ClientError::protocol("empty error payload", ""),
        Payload::Opaque(raw) => ClientError::protocol("error payload is not valid JSON", raw),
    }
}

/// Single-value classification. `None` means keep waiting.
fn settle(event: ResponseEvent) -> Option<Result<Value, ClientError>> {
    match event.kind {
        ResponseKind::Success => Some(payload_value(event.payload)),
        ResponseKind::Error => Some(Err(engine_error(event.payload))),
        ResponseKind::Nop | ResponseKind::Custom(_) if event.finished => Some(Err(
            ClientError::protocol("request finished without a result", ""),
        )),
        ResponseKind::Nop
        | ResponseKind::Custom(_)
        | ResponseKind::AppRequest
        | ResponseKind::AppNotify => None,
    }
}

/// An issued request whose outcome has not been consumed yet.
///
/// Redeem it exactly once through one of the consumption shapes. Dropping
/// it unconsumed releases the queue.
pub struct RequestHandle {
    events: EventReceiver,
    lease: QueueLease,
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.lease.id)
            .finish_non_exhaustive()
    }
}

impl RequestHandle {
    pub(crate) fn new(id: RequestId, events: EventReceiver, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            events,
            lease: QueueLease { id, dispatcher },
        }
    }

    #[must_use]
    pub fn id(&self) -> RequestId {
        self.lease.id
    }

    /// Block until the Success or Error event arrives.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn wait(mut self) -> Result<Value, ClientError> {
        loop {
            let Some(event) = self.events.blocking_recv() else {
                return Err(self.lease.dispatcher.destroyed());
            };
            if let Some(outcome) = settle(event) {
                return outcome;
            }
        }
    }

    /// Await the Success or Error event.
    pub async fn result(mut self) -> Result<Value, ClientError> {
        loop {
            let Some(event) = self.events.recv().await else {
                return Err(self.lease.dispatcher.destroyed());
            };
            if let Some(outcome) = settle(event) {
                return outcome;
            }
        }
    }

    /// [`RequestHandle::result`] bounded by a caller-chosen timeout. On
    /// expiry the queue is released; the engine is not told.
    pub async fn result_timeout(self, timeout: Duration) -> Result<Value, ClientError> {
        tokio::time::timeout(timeout, self.result())
            .await
            .map_err(|_| ClientError::Timeout { elapsed: timeout })?
    }

    /// Consume every event as a stream.
    #[must_use]
    pub fn into_stream(self) -> EventStream {
        EventStream {
            events: self.events,
            lease: self.lease,
            unsubscribe: None,
            finished: false,
        }
    }

    /// Like [`RequestHandle::into_stream`], and abandoning the stream early
    /// calls `method` with the `handle` from the first Success payload.
    #[must_use]
    pub fn into_stream_with_unsubscribe(self, method: impl Into<String>) -> EventStream {
        let mut stream = self.into_stream();
        stream.unsubscribe = Some(Unsubscribe {
            method: method.into(),
            handle: None,
        });
        stream
    }
}

#[derive(Debug)]
struct Unsubscribe {
    method: String,
    handle: Option<Handle>,
}

/// Lazy sequence of payloads for one request.
///
/// Yields Success and Custom payloads in arrival order, skips `Nop`, ends
/// right after an event with `finished = true`, and ends after yielding the
/// error of an Error event. A payload that is not JSON yields a protocol
/// error and the stream continues.
pub struct EventStream {
    events: EventReceiver,
    lease: QueueLease,
    unsubscribe: Option<Unsubscribe>,
    finished: bool,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("id", &self.lease.id)
            .field("finished", &self.finished)
            .field("unsubscribe", &self.unsubscribe)
            .finish_non_exhaustive()
    }
}

impl EventStream {
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.lease.id
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Handle captured from the first Success payload, if unsubscribe is
    /// configured and it has arrived.
    #[must_use]
    pub fn handle(&self) -> Option<Handle> {
        self.unsubscribe.as_ref().and_then(|u| u.handle)
    }

    /// Blocking iterator over the same sequence, for callers without a runtime.
    #[must_use]
    pub fn blocking(self) -> BlockingEvents {
        BlockingEvents { stream: self }
    }

    /// Stop consuming now: release the queue and, if configured, ask the
    /// engine to unsubscribe and wait for its answer.
    pub async fn unsubscribe(mut self) -> Result<(), ClientError> {
        if self.finished {
            return Ok(());
        }
        let Some((method, handle)) = self.abandon() else {
            return Ok(());
        };
        self.lease
            .dispatcher
            .call(&method, &serde_json::json!({ "handle": handle }))
            .await
            .map(|_| ())
    }

    fn finish(&mut self) {
        self.finished = true;
        self.lease.release();
    }

    /// Remember the `handle` of the first Success payload.
    fn capture_handle(&mut self, event: &ResponseEvent) {
        if event.kind == ResponseKind::Success
            && let Some(unsubscribe) = self.unsubscribe.as_mut()
            && unsubscribe.handle.is_none()
            && let Some(value) = event.payload.as_json()
        {
            unsubscribe.handle = Handle::from_field(value, "handle");
        }
    }

    /// Stop consuming and return what to unsubscribe, if anything.
    ///
    /// Events already delivered but not yet polled are drained first: the
    /// Success carrying the handle may still be buffered, and a buffered
    /// terminal event means the engine already ended the subscription.
    fn abandon(&mut self) -> Option<(String, Handle)> {
        let mut ended = false;
        while let Ok(event) = self.events.try_recv() {
            self.capture_handle(&event);
            if event.is_terminal() {
                ended = true;
                break;
            }
        }
        self.finish();
        if ended {
            return None;
        }
        match self.unsubscribe.take() {
            Some(Unsubscribe {
                method,
                handle: Some(handle),
            }) => Some((method, handle)),
            _ => None,
        }
    }

    /// Turn one receive result into an item. `None` means nothing to yield.
    fn on_recv(&mut self, received: Option<ResponseEvent>) -> Option<Result<Value, ClientError>> {
        let Some(event) = received else {
            self.finished = true;
            return Some(Err(self.lease.dispatcher.destroyed()));
        };

        let terminal = event.is_terminal();
        self.capture_handle(&event);
        let item = match event.kind {
            ResponseKind::Success | ResponseKind::Custom(_) => match event.payload {
                Payload::Empty => None,
                payload => Some(payload_value(payload)),
            },
            ResponseKind::Error => Some(Err(engine_error(event.payload))),
            ResponseKind::Nop | ResponseKind::AppRequest | ResponseKind::AppNotify => None,
        };

        if terminal {
            self.finish();
        }
        item
    }
}

impl Stream for EventStream {
    type Item = Result<Value, ClientError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if this.finished {
                return Poll::Ready(None);
            }
            let received = ready!(this.events.poll_recv(cx));
            if let Some(item) = this.on_recv(received) {
                return Poll::Ready(Some(item));
            }
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if !self.lease.dispatcher.unsubscribe_on_drop() {
            self.finish();
            return;
        }
        if let Some((method, handle)) = self.abandon() {
            let dispatcher = &self.lease.dispatcher;
            tracing::debug!(
                request_id = %self.lease.id,
                %handle,
                method = %method,
                "stream abandoned; unsubscribing"
            );
            if let Err(err) = dispatcher.notify(&method, &serde_json::json!({ "handle": handle })) {
                tracing::debug!(%handle, error = %err, "unsubscribe on drop failed");
            }
        }
    }
}

/// Blocking view of an [`EventStream`].
#[derive(Debug)]
pub struct BlockingEvents {
    stream: EventStream,
}

impl BlockingEvents {
    #[must_use]
    pub fn into_inner(self) -> EventStream {
        self.stream
    }
}

impl Iterator for BlockingEvents {
    type Item = Result<Value, ClientError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.stream.finished {
                return None;
            }
            let received = self.stream.events.blocking_recv();
            if let Some(item) = self.stream.on_recv(received) {
                return Some(item);
            }
        }
    }
}
