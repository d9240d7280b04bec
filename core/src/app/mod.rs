//! App Object protocol: engine-initiated calls into locally registered
//! objects.
//!
//! The Correlator hands every AppRequest and AppNotify event to
//! [`AppObjects`] on the delivery thread. Routing only looks up the target
//! object and submits a job to the worker pool; decoding the message,
//! running the handler and resolving the nested id back through the
//! Dispatcher all happen on the worker.

mod handlers;
mod scope;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock, Weak};

use conduit_types::{
    AppRequest, AppRequestId, AppRequestResult, ClientError, Handle, HandlerError, Payload,
    RequestId, ResponseEvent, ResponseKind,
};
use futures_util::FutureExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

pub use handlers::{
    AppFut, AppObject, DebotBrowser, EncryptionBoxHandler, SigningBoxHandler,
};
pub use scope::RegistrationScope;

use crate::correlator::AppEventRouter;
use crate::dispatcher::Dispatcher;
use crate::worker::{Job, WorkerPool};

pub const REGISTER_SIGNING_BOX: &str = "crypto.register_signing_box";
pub const REMOVE_SIGNING_BOX: &str = "crypto.remove_signing_box";
pub const REGISTER_ENCRYPTION_BOX: &str = "crypto.register_encryption_box";
pub const REMOVE_ENCRYPTION_BOX: &str = "crypto.remove_encryption_box";
pub const DEBOT_INIT: &str = "debot.init";
pub const DEBOT_REMOVE: &str = "debot.remove";

/// A handler failure that could not be reported back to the engine.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    /// Request the notification arrived on.
    pub request_id: RequestId,
    pub error: HandlerError,
}

struct Registration {
    object: AppObject,
    handle: Option<Handle>,
    /// Registered through a [`RegistrationScope`] by a running handler.
    nested: bool,
}

#[derive(Default)]
struct Registry {
    by_request: HashMap<RequestId, Registration>,
    by_handle: HashMap<Handle, RequestId>,
    default: Option<AppObject>,
}

/// Registered App Objects of one context and the router that feeds them.
pub struct AppObjects {
    registry: RwLock<Registry>,
    dispatcher: Arc<Dispatcher>,
    pool: Arc<dyn WorkerPool>,
    failures: mpsc::UnboundedSender<HandlerFailure>,
    this: Weak<AppObjects>,
}

impl AppObjects {
    pub(crate) fn new(
        dispatcher: Arc<Dispatcher>,
        pool: Arc<dyn WorkerPool>,
        failures: mpsc::UnboundedSender<HandlerFailure>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            registry: RwLock::new(Registry::default()),
            dispatcher,
            pool,
            failures,
            this: this.clone(),
        })
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Register `object` through `method` and index it by the handle the
    /// engine returns in `handle_field`.
    ///
    /// The object is bound to the request id before the call is issued, so
    /// AppRequests the engine sends while registering already find it.
    /// Returns the handle together with the full Success payload.
    pub async fn register(
        &self,
        object: AppObject,
        method: &str,
        params: &Value,
        handle_field: &str,
    ) -> Result<(Handle, Value), ClientError> {
        self.register_with(object, method, params, handle_field, false)
            .await
    }

    /// [`AppObjects::register`] for a nested invocation. Events for the
    /// object are scheduled with [`WorkerPool::execute_nested`].
    pub(crate) async fn register_nested(
        &self,
        object: AppObject,
        method: &str,
        params: &Value,
        handle_field: &str,
    ) -> Result<(Handle, Value), ClientError> {
        self.register_with(object, method, params, handle_field, true)
            .await
    }

    async fn register_with(
        &self,
        object: AppObject,
        method: &str,
        params: &Value,
        handle_field: &str,
        nested: bool,
    ) -> Result<(Handle, Value), ClientError> {
        let id = self.dispatcher.prepare();
        let capability = object.capability();
        self.bind(id, object, nested);

        let registered = match self.dispatcher.issue(id, method, params) {
            Ok(pending) => pending.result().await,
            Err(err) => Err(err),
        };
        let value = match registered {
            Ok(value) => value,
            Err(err) => {
                self.unbind(id);
                return Err(err);
            }
        };
        let Some(handle) = Handle::from_field(&value, handle_field) else {
            self.unbind(id);
            return Err(ClientError::protocol(
                format!("{method} result has no `{handle_field}`"),
                value.to_string(),
            ));
        };

        self.attach_handle(id, handle);
        tracing::debug!(request_id = %id, %handle, capability, nested, "app object registered");
        Ok((handle, value))
    }

    /// Ask the engine to drop `handle` through `method`, then forget the
    /// local registration whatever the engine answered.
    pub async fn remove(&self, handle: Handle, method: &str, field: &str) -> Result<(), ClientError> {
        let removed = self
            .dispatcher
            .call(method, &serde_json::json!({ field: handle }))
            .await;
        self.unregister(handle);
        removed.map(|_| ())
    }

    /// Forget the local registration for `handle`. Returns whether it existed.
    pub fn unregister(&self, handle: Handle) -> bool {
        let mut registry = self
            .registry
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(id) = registry.by_handle.remove(&handle) else {
            return false;
        };
        registry.by_request.remove(&id);
        self.dispatcher.unreserve(id);
        tracing::debug!(%handle, request_id = %id, "app object unregistered");
        true
    }

    /// Object used for AppRequests that match no registration.
    pub fn set_default(&self, object: Option<AppObject>) {
        self.registry
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .default = object;
    }

    /// Number of live registrations, excluding the default object.
    #[must_use]
    pub fn registered(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .by_request
            .len()
    }

    #[must_use]
    pub fn is_registered(&self, handle: Handle) -> bool {
        self.registry
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .by_handle
            .contains_key(&handle)
    }

    /// A fresh isolated scope over this registry.
    #[must_use]
    pub fn scope(self: &Arc<Self>) -> RegistrationScope {
        RegistrationScope::new(Arc::clone(self))
    }

    /// Drop every registration and the default object.
    pub(crate) fn clear(&self) -> usize {
        let mut registry = self
            .registry
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let count = registry.by_request.len();
        *registry = Registry::default();
        self.dispatcher.clear_reserved();
        count
    }

    fn bind(&self, id: RequestId, object: AppObject, nested: bool) {
        self.dispatcher.reserve(id);
        self.registry
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .by_request
            .insert(
                id,
                Registration {
                    object,
                    handle: None,
                    nested,
                },
            );
    }

    fn unbind(&self, id: RequestId) {
        let mut registry = self
            .registry
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(Registration {
            handle: Some(handle),
            ..
        }) = registry.by_request.remove(&id)
        {
            registry.by_handle.remove(&handle);
        }
        self.dispatcher.unreserve(id);
    }

    fn attach_handle(&self, id: RequestId, handle: Handle) {
        let mut registry = self
            .registry
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(registration) = registry.by_request.get_mut(&id) {
            registration.handle = Some(handle);
            registry.by_handle.insert(handle, id);
        }
    }

    /// Target object for events on `id`, and whether it belongs to a
    /// nested invocation.
    fn lookup(&self, id: RequestId) -> Option<(AppObject, bool)> {
        let registry = self
            .registry
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        registry
            .by_request
            .get(&id)
            .map(|registration| (registration.object.clone(), registration.nested))
            .or_else(|| registry.default.clone().map(|object| (object, false)))
    }

    fn submit(&self, nested: bool, job: Job) {
        if nested {
            self.pool.execute_nested(job);
        } else {
            self.pool.execute(job);
        }
    }

    fn report(&self, failure: HandlerFailure) {
        tracing::warn!(
            request_id = %failure.request_id,
            error = %failure.error,
            "app handler failed with nobody to resolve"
        );
        // Nobody listening is fine; the warning above is the record.
        let _ = self.failures.send(failure);
    }

    fn on_app_request(&self, request_id: RequestId, payload: Payload) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let value = match payload {
            Payload::Json(value) => value,
            Payload::Empty | Payload::Opaque(_) => {
                self.report(HandlerFailure {
                    request_id,
                    error: HandlerError::new("app request payload is not a JSON object"),
                });
                return;
            }
        };

        let request = match AppRequest::deserialize(&value) {
            Ok(request) => request,
            Err(err) => {
                let Some(app_request_id) = value
                    .get("app_request_id")
                    .and_then(Value::as_u64)
                    .and_then(|id| u32::try_from(id).ok())
                    .map(AppRequestId::new)
                else {
                    self.report(HandlerFailure {
                        request_id,
                        error: HandlerError::new(format!("malformed app request: {err}")),
                    });
                    return;
                };
                if self.dispatcher.track_app_request(app_request_id) {
                    let result = AppRequestResult::error(format!("malformed app request: {err}"));
                    let nested = self.lookup(request_id).is_some_and(|(_, nested)| nested);
                    self.submit(nested, Box::pin(async move {
                        this.resolve(app_request_id, result).await;
                    }));
                }
                return;
            }
        };

        let AppRequest {
            app_request_id,
            request_data,
        } = request;
        if !self.dispatcher.track_app_request(app_request_id) {
            tracing::warn!(%app_request_id, "duplicate app request; ignoring");
            return;
        }
        let target = self.lookup(request_id);
        let nested = target.as_ref().is_some_and(|(_, nested)| *nested);
        let object = target.map(|(object, _)| object);
        tracing::trace!(
            request_id = %request_id,
            %app_request_id,
            object = ?object,
            nested,
            "dispatching app request"
        );
        self.submit(nested, Box::pin(async move {
            let result = match object {
                Some(object) => run_request(&this, &object, request_data).await,
                None => AppRequestResult::error(format!(
                    "no app object registered for request {request_id}"
                )),
            };
            this.resolve(app_request_id, result).await;
        }));
    }

    fn on_app_notify(&self, request_id: RequestId, payload: Payload) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let Some((object, nested)) = self.lookup(request_id) else {
            tracing::debug!(request_id = %request_id, "app notification with no object; dropping");
            return;
        };
        let data = match payload {
            Payload::Json(data) => data,
            Payload::Empty | Payload::Opaque(_) => {
                self.report(HandlerFailure {
                    request_id,
                    error: HandlerError::new("app notification payload is not JSON"),
                });
                return;
            }
        };
        self.submit(nested, Box::pin(async move {
            let outcome = AssertUnwindSafe(object.handle_notify(data))
                .catch_unwind()
                .await;
            let error = match outcome {
                Ok(Ok(())) => return,
                Ok(Err(err)) => err,
                Err(panic) => HandlerError::new(format!(
                    "{} handler panicked: {}",
                    object.capability(),
                    panic_payload_to_string(&panic)
                )),
            };
            this.report(HandlerFailure { request_id, error });
        }));
    }

    /// Submit the outcome and wait for the engine's acknowledgement.
    async fn resolve(&self, app_request_id: AppRequestId, result: AppRequestResult) {
        let acknowledged = match self.dispatcher.resolve(app_request_id, result) {
            Ok(pending) => pending.result().await,
            Err(err) => Err(err),
        };
        match acknowledged {
            Ok(_) => {}
            Err(err) if err.is_lifecycle() => {
                tracing::debug!(%app_request_id, error = %err, "app request outlived its context");
            }
            Err(err) => {
                tracing::warn!(%app_request_id, error = %err, "failed to resolve app request");
            }
        }
    }
}

impl AppEventRouter for AppObjects {
    fn route(&self, event: ResponseEvent) {
        match event.kind {
            ResponseKind::AppRequest => self.on_app_request(event.request_id, event.payload),
            ResponseKind::AppNotify => self.on_app_notify(event.request_id, event.payload),
            kind => {
                tracing::trace!(request_id = %event.request_id, ?kind, "not an app event");
            }
        }
    }
}

/// Run one request handler; errors and panics become an Error result.
async fn run_request(
    objects: &Arc<AppObjects>,
    object: &AppObject,
    data: Value,
) -> AppRequestResult {
    let outcome = AssertUnwindSafe(object.handle_request(data, objects))
        .catch_unwind()
        .await;
    match outcome {
        Ok(Ok(result)) => AppRequestResult::Ok { result },
        Ok(Err(err)) => {
            tracing::debug!(capability = object.capability(), error = %err, "app handler failed");
            AppRequestResult::error(err.message())
        }
        Err(panic) => {
            let message = panic_payload_to_string(&panic);
            tracing::warn!(capability = object.capability(), panic = %message, "app handler panicked");
            AppRequestResult::error(format!("{} handler panicked: {message}", object.capability()))
        }
    }
}

fn panic_payload_to_string(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
