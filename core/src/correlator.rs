//! Maps request ids to ordered event queues.
//!
//! The engine callback lands in [`Correlator::on_event`], possibly from many
//! engine-owned threads at once. Each outstanding request owns an unbounded
//! channel; appending is a non-blocking send under the table lock, so events
//! for one id keep their delivery order and the delivery thread never waits
//! on a consumer.
//!
//! Entries are removed only by the consumer (`release`) or by `close` when
//! the context is destroyed. A queue that never sees a terminal event stays
//! in the table: the caller is still waiting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use conduit_types::{RequestId, ResponseEvent, ResponseHandler};
use tokio::sync::mpsc;

/// Receiving side of one request's queue.
pub(crate) type EventReceiver = mpsc::UnboundedReceiver<ResponseEvent>;

/// Destination for AppRequest / AppNotify events.
///
/// `route` runs on the delivery thread; implementations must hand work off
/// and return.
pub(crate) trait AppEventRouter: Send + Sync {
    fn route(&self, event: ResponseEvent);
}

pub struct Correlator {
    queues: Mutex<HashMap<RequestId, mpsc::UnboundedSender<ResponseEvent>>>,
    router: RwLock<Option<Arc<dyn AppEventRouter>>>,
    closed: AtomicBool,
}

/// Why a queue could not be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpenError {
    Closed,
    InUse,
}

impl Correlator {
    pub(crate) fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            router: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn install_router(&self, router: Arc<dyn AppEventRouter>) {
        *self
            .router
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(router);
    }

    /// Register a queue for `id`.
    pub(crate) fn open(&self, id: RequestId) -> Result<EventReceiver, OpenError> {
        let mut queues = self
            .queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        // Checked under the lock so `close` cannot interleave.
        if self.is_closed() {
            return Err(OpenError::Closed);
        }
        if queues.contains_key(&id) {
            return Err(OpenError::InUse);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        queues.insert(id, tx);
        Ok(rx)
    }

    /// Remove the entry for `id`. Returns whether it was present.
    pub fn release(&self, id: RequestId) -> bool {
        let removed = self
            .queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&id)
            .is_some();
        if removed {
            tracing::trace!(request_id = %id, "released request queue");
        }
        removed
    }

    /// Whether a queue is registered for `id`.
    #[must_use]
    pub fn contains(&self, id: RequestId) -> bool {
        self.queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Number of requests currently holding a queue.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Single entry point for engine events.
    pub fn on_event(&self, event: ResponseEvent) {
        if event.kind.is_app() {
            let router = self
                .router
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone();
            match router {
                Some(router) => router.route(event),
                None => tracing::warn!(
                    request_id = %event.request_id,
                    kind = ?event.kind,
                    "app event arrived with no router installed; dropping"
                ),
            }
            return;
        }

        let mut queues = self
            .queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let id = event.request_id;
        let Some(tx) = queues.get(&id) else {
            tracing::trace!(request_id = %id, kind = ?event.kind, "dropping event for unknown request");
            return;
        };
        if tx.send(event).is_err() {
            // Consumer went away without releasing; reclaim the slot.
            queues.remove(&id);
            tracing::debug!(request_id = %id, "consumer gone; removed request queue");
        }
    }

    /// Fail every outstanding request and stop accepting new ones.
    ///
    /// Dropping the senders wakes each consumer with a closed channel, which
    /// the result adapter reports as `LifecycleError::ContextDestroyed`.
    pub(crate) fn close(&self) -> usize {
        let drained = {
            let mut queues = self
                .queues
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            self.closed.store(true, Ordering::Release);
            std::mem::take(&mut *queues)
        };
        self.router
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let count = drained.len();
        drop(drained);
        count
    }
}

impl ResponseHandler for Correlator {
    fn on_response(&self, request_id: u32, params_json: &str, response_type: u32, finished: bool) {
        self.on_event(ResponseEvent::from_raw(
            request_id,
            params_json,
            response_type,
            finished,
        ));
    }
}
