use std::sync::{Arc, Mutex};

use conduit_types::{ClientError, Handle};
use serde_json::Value;

use super::{AppObject, AppObjects, REGISTER_SIGNING_BOX, SigningBoxHandler};
use crate::dispatcher::Dispatcher;

/// A handle registered through a scope and how the engine removes it.
#[derive(Debug, Clone, Copy)]
struct Scoped {
    handle: Handle,
    method: &'static str,
    field: &'static str,
}

/// Registrations that live only as long as this scope.
///
/// A nested debot gets one of these. Whatever it registers is removed from
/// the engine and forgotten locally when the invocation ends, leaving the
/// outer registrations untouched. [`RegistrationScope::close`] awaits the
/// engine's answers; dropping the scope sends the removals without waiting.
pub struct RegistrationScope {
    objects: Arc<AppObjects>,
    handles: Mutex<Vec<Scoped>>,
}

impl RegistrationScope {
    pub(crate) fn new(objects: Arc<AppObjects>) -> Self {
        Self {
            objects,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Dispatcher of the owning context, for calls made by the nested task.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        self.objects.dispatcher()
    }

    /// [`AppObjects::register`], tied to this scope.
    pub async fn register(
        &self,
        object: AppObject,
        method: &str,
        params: &Value,
        handle_field: &str,
    ) -> Result<(Handle, Value), ClientError> {
        let (removal, field) = object.removal();
        let (handle, value) = self
            .objects
            .register_nested(object, method, params, handle_field)
            .await?;
        self.handles
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(Scoped {
                handle,
                method: removal,
                field,
            });
        Ok((handle, value))
    }

    pub async fn register_signing_box(
        &self,
        handler: Arc<dyn SigningBoxHandler>,
    ) -> Result<Handle, ClientError> {
        self.register(
            AppObject::SigningBox(handler),
            REGISTER_SIGNING_BOX,
            &serde_json::json!({}),
            "handle",
        )
        .await
        .map(|(handle, _)| handle)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every registration made through this scope, newest first,
    /// and wait for the engine to confirm each removal.
    ///
    /// Every handle is forgotten locally even if a removal fails; the first
    /// failure is returned.
    pub async fn close(self) -> Result<(), ClientError> {
        let scoped = self.take();
        let mut first_err = None;
        for Scoped {
            handle,
            method,
            field,
        } in scoped.into_iter().rev()
        {
            if let Err(err) = self.objects.remove(handle, method, field).await {
                tracing::debug!(%handle, method, error = %err, "scoped removal failed");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn take(&self) -> Vec<Scoped> {
        std::mem::take(
            &mut *self
                .handles
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }
}

impl Drop for RegistrationScope {
    fn drop(&mut self) {
        let scoped = self.take();
        if scoped.is_empty() {
            return;
        }
        let dispatcher = Arc::clone(self.objects.dispatcher());
        let mut removed = 0usize;
        for Scoped {
            handle,
            method,
            field,
        } in scoped.into_iter().rev()
        {
            if self.objects.unregister(handle) {
                removed += 1;
            }
            if let Err(err) = dispatcher.notify(method, &serde_json::json!({ field: handle })) {
                tracing::debug!(%handle, method, error = %err, "scoped removal failed");
            }
        }
        tracing::debug!(removed, "registration scope dropped");
    }
}

impl std::fmt::Debug for RegistrationScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationScope")
            .field("handles", &self.len())
            .finish_non_exhaustive()
    }
}
