//! Issues boundary calls and registers the waiting intent.
//!
//! Every call allocates a fresh request id, opens its queue in the
//! [`Correlator`] *before* the boundary call (the engine may answer on
//! another thread before `request` even returns), and hands the queue to a
//! [`RequestHandle`]. Boundary failures are reported immediately and the
//! queue is released again.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use conduit_types::{
    AppRequestId, AppRequestResult, ClientError, ContextId, EngineBinding, LifecycleError,
    RequestId,
};
use serde_json::Value;

use crate::adapter::RequestHandle;
use crate::correlator::{Correlator, OpenError};

/// Engine method that accepts the outcome of an AppRequest.
pub const RESOLVE_APP_REQUEST: &str = "client.resolve_app_request";

pub struct Dispatcher {
    context: ContextId,
    binding: Arc<dyn EngineBinding>,
    correlator: Arc<Correlator>,
    next_id: AtomicU32,
    /// AppRequests received and not yet resolved.
    app_requests: Mutex<HashSet<AppRequestId>>,
    /// Ids still bound to App Object registrations after their queue closed.
    reserved: Mutex<HashSet<RequestId>>,
    unsubscribe_on_drop: bool,
}

impl Dispatcher {
    pub(crate) fn new(
        context: ContextId,
        binding: Arc<dyn EngineBinding>,
        correlator: Arc<Correlator>,
        unsubscribe_on_drop: bool,
    ) -> Self {
        Self {
            context,
            binding,
            correlator,
            next_id: AtomicU32::new(1),
            app_requests: Mutex::new(HashSet::new()),
            reserved: Mutex::new(HashSet::new()),
            unsubscribe_on_drop,
        }
    }

    #[must_use]
    pub fn context(&self) -> ContextId {
        self.context
    }

    #[must_use]
    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub(crate) fn unsubscribe_on_drop(&self) -> bool {
        self.unsubscribe_on_drop
    }

    pub(crate) fn destroyed(&self) -> ClientError {
        LifecycleError::ContextDestroyed(self.context).into()
    }

    /// Allocate the next request id without issuing anything.
    ///
    /// The counter wraps; 0 and ids reserved by live registrations are
    /// skipped.
    pub fn prepare(&self) -> RequestId {
        let reserved = self
            .reserved
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                continue;
            }
            let id = RequestId::new(id);
            if !reserved.contains(&id) {
                return id;
            }
        }
    }

    /// Keep `id` out of allocation until [`Dispatcher::unreserve`].
    pub(crate) fn reserve(&self, id: RequestId) {
        self.reserved
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id);
    }

    pub(crate) fn unreserve(&self, id: RequestId) {
        self.reserved
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&id);
    }

    pub(crate) fn clear_reserved(&self) {
        self.reserved
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }

    #[cfg(test)]
    pub(crate) fn set_next_id(&self, next: u32) {
        self.next_id.store(next, Ordering::Relaxed);
    }

    /// Issue `method` under a previously prepared id.
    pub fn issue(
        self: &Arc<Self>,
        id: RequestId,
        method: &str,
        params: &Value,
    ) -> Result<RequestHandle, ClientError> {
        let params_json = serde_json::to_string(params).map_err(|e| {
            ClientError::protocol(format!("serializing params for {method}: {e}"), "")
        })?;

        let events = self.correlator.open(id).map_err(|e| match e {
            OpenError::Closed => self.destroyed(),
            OpenError::InUse => LifecycleError::RequestIdInUse(id).into(),
        })?;

        tracing::trace!(context = %self.context, request_id = %id, method, "issuing request");
        if let Err(err) = self
            .binding
            .request(self.context, method, &params_json, id)
        {
            // Reported now, not through the event stream; don't leak the queue.
            self.correlator.release(id);
            tracing::debug!(request_id = %id, method, error = %err, "boundary call failed");
            return Err(err.into());
        }

        Ok(RequestHandle::new(id, events, Arc::clone(self)))
    }

    /// Issue `method` and return immediately.
    pub fn call_async(
        self: &Arc<Self>,
        method: &str,
        params: &Value,
    ) -> Result<RequestHandle, ClientError> {
        let id = self.prepare();
        self.issue(id, method, params)
    }

    /// Issue `method` and block the calling thread until its result arrives.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context; use
    /// [`Dispatcher::call`] there.
    pub fn call_sync(self: &Arc<Self>, method: &str, params: &Value) -> Result<Value, ClientError> {
        self.call_async(method, params)?.wait()
    }

    /// Issue `method` and await its result.
    pub async fn call(self: &Arc<Self>, method: &str, params: &Value) -> Result<Value, ClientError> {
        self.call_async(method, params)?.result().await
    }

    /// Fire-and-forget call: no queue is opened, so any answer is dropped.
    pub fn notify(&self, method: &str, params: &Value) -> Result<RequestId, ClientError> {
        if self.correlator.is_closed() {
            return Err(self.destroyed());
        }
        let id = self.prepare();
        let params_json = serde_json::to_string(params).map_err(|e| {
            ClientError::protocol(format!("serializing params for {method}: {e}"), "")
        })?;
        tracing::trace!(context = %self.context, request_id = %id, method, "issuing notification");
        self.binding
            .request(self.context, method, &params_json, id)
            .map_err(ClientError::from)?;
        Ok(id)
    }

    /// Record an AppRequest as awaiting resolution. Returns `false` if the
    /// id was already outstanding.
    pub(crate) fn track_app_request(&self, id: AppRequestId) -> bool {
        self.app_requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id)
    }

    /// Number of AppRequests received and not yet resolved.
    #[must_use]
    pub fn pending_app_requests(&self) -> usize {
        self.app_requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub(crate) fn clear_app_requests(&self) -> usize {
        let mut pending = self
            .app_requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let count = pending.len();
        pending.clear();
        count
    }

    /// Submit the outcome of an AppRequest. Exactly once per id: a second
    /// call, or an id the engine never sent, is a `LifecycleError`.
    ///
    /// The returned handle carries the engine's acknowledgement; dropping it
    /// is fine.
    pub fn resolve(
        self: &Arc<Self>,
        app_request_id: AppRequestId,
        result: AppRequestResult,
    ) -> Result<RequestHandle, ClientError> {
        let known = self
            .app_requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&app_request_id);
        if !known {
            return Err(LifecycleError::UnknownAppRequest(app_request_id).into());
        }
        tracing::debug!(
            app_request_id = %app_request_id,
            ok = result.is_ok(),
            "resolving app request"
        );
        let params = serde_json::json!({
            "app_request_id": app_request_id,
            "result": result,
        });
        self.call_async(RESOLVE_APP_REQUEST, &params)
    }
}
