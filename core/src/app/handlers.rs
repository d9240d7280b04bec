//! Handler traits for the App Object capability families.
//!
//! Each family's requests decode into a closed enum from `conduit_types` and
//! the dispatch below is an exhaustive `match`, so adding a message type is
//! a compile error here until it is handled.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use conduit_types::{
    DebotBrowserNotify, DebotBrowserRequest, DebotBrowserResponse, EncryptionBoxRequest,
    EncryptionBoxResponse, Handle, HandlerError, SigningBoxRequest, SigningBoxResponse,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{
    AppObjects, DEBOT_REMOVE, REMOVE_ENCRYPTION_BOX, REMOVE_SIGNING_BOX, RegistrationScope,
};

/// Future returned by every handler method.
pub type AppFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, HandlerError>> + Send + 'a>>;

/// Signs on behalf of the engine without exposing key material to it.
pub trait SigningBoxHandler: Send + Sync {
    fn get_public_key(&self) -> AppFut<'_, String>;
    fn sign(&self, unsigned: String) -> AppFut<'_, String>;
}

pub trait EncryptionBoxHandler: Send + Sync {
    fn get_info(&self) -> AppFut<'_, Value>;
    fn encrypt(&self, data: String) -> AppFut<'_, String>;
    fn decrypt(&self, data: String) -> AppFut<'_, String>;
}

/// Host side of a running debot.
///
/// Notifications default to no-ops; requests must be answered.
pub trait DebotBrowser: Send + Sync {
    fn log(&self, _msg: String) -> AppFut<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn switch(&self, _context_id: u8) -> AppFut<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn switch_completed(&self) -> AppFut<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn show_action(&self, _action: Value) -> AppFut<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn send(&self, _message: String) -> AppFut<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn input(&self, prompt: String) -> AppFut<'_, String>;

    fn get_signing_box(&self) -> AppFut<'_, Handle>;

    /// Run another debot. Objects registered through `scope` are removed
    /// from the engine and forgotten locally once this call returns.
    fn invoke_debot<'a>(
        &'a self,
        debot_addr: String,
        action: Value,
        scope: &'a RegistrationScope,
    ) -> AppFut<'a, ()>;

    fn approve(&self, activity: Value) -> AppFut<'_, bool>;
}

/// A locally registered object the engine may call back into.
#[derive(Clone)]
pub enum AppObject {
    SigningBox(Arc<dyn SigningBoxHandler>),
    EncryptionBox(Arc<dyn EncryptionBoxHandler>),
    DebotBrowser(Arc<dyn DebotBrowser>),
}

impl std::fmt::Debug for AppObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.capability())
    }
}

fn decode<T: DeserializeOwned>(capability: &str, data: Value) -> Result<T, HandlerError> {
    serde_json::from_value(data)
        .map_err(|e| HandlerError::new(format!("unsupported {capability} message: {e}")))
}

fn encode<T: Serialize>(response: &T) -> Result<Value, HandlerError> {
    serde_json::to_value(response)
        .map_err(|e| HandlerError::new(format!("failed to encode response: {e}")))
}

impl AppObject {
    #[must_use]
    pub fn capability(&self) -> &'static str {
        match self {
            Self::SigningBox(_) => "signing box",
            Self::EncryptionBox(_) => "encryption box",
            Self::DebotBrowser(_) => "debot browser",
        }
    }

    /// Engine method, and its handle parameter, that removes this object.
    pub(crate) fn removal(&self) -> (&'static str, &'static str) {
        match self {
            Self::SigningBox(_) => (REMOVE_SIGNING_BOX, "handle"),
            Self::EncryptionBox(_) => (REMOVE_ENCRYPTION_BOX, "handle"),
            Self::DebotBrowser(_) => (DEBOT_REMOVE, "debot_handle"),
        }
    }

    /// Decode `data`, run the matching handler and encode its response.
    pub(crate) async fn handle_request(
        &self,
        data: Value,
        objects: &Arc<AppObjects>,
    ) -> Result<Value, HandlerError> {
        let capability = self.capability();
        match self {
            Self::SigningBox(handler) => {
                let response = match decode::<SigningBoxRequest>(capability, data)? {
                    SigningBoxRequest::GetPublicKey => SigningBoxResponse::GetPublicKey {
                        public_key: handler.get_public_key().await?,
                    },
                    SigningBoxRequest::Sign { unsigned } => SigningBoxResponse::Sign {
                        signature: handler.sign(unsigned).await?,
                    },
                };
                encode(&response)
            }
            Self::EncryptionBox(handler) => {
                let response = match decode::<EncryptionBoxRequest>(capability, data)? {
                    EncryptionBoxRequest::GetInfo => EncryptionBoxResponse::GetInfo {
                        info: handler.get_info().await?,
                    },
                    EncryptionBoxRequest::Encrypt { data } => EncryptionBoxResponse::Encrypt {
                        data: handler.encrypt(data).await?,
                    },
                    EncryptionBoxRequest::Decrypt { data } => EncryptionBoxResponse::Decrypt {
                        data: handler.decrypt(data).await?,
                    },
                };
                encode(&response)
            }
            Self::DebotBrowser(browser) => {
                let response = match decode::<DebotBrowserRequest>(capability, data)? {
                    DebotBrowserRequest::Input { prompt } => DebotBrowserResponse::Input {
                        value: browser.input(prompt).await?,
                    },
                    DebotBrowserRequest::GetSigningBox => DebotBrowserResponse::GetSigningBox {
                        signing_box: browser.get_signing_box().await?,
                    },
                    DebotBrowserRequest::InvokeDebot { debot_addr, action } => {
                        let scope = objects.scope();
                        let invoked = browser.invoke_debot(debot_addr, action, &scope).await;
                        if let Err(err) = scope.close().await {
                            tracing::warn!(error = %err, "failed to remove nested registrations");
                        }
                        invoked?;
                        DebotBrowserResponse::InvokeDebot
                    }
                    DebotBrowserRequest::Approve { activity } => DebotBrowserResponse::Approve {
                        approved: browser.approve(activity).await?,
                    },
                };
                encode(&response)
            }
        }
    }

    /// Decode and deliver a one-way notification.
    pub(crate) async fn handle_notify(&self, data: Value) -> Result<(), HandlerError> {
        let capability = self.capability();
        let Self::DebotBrowser(browser) = self else {
            return Err(HandlerError::new(format!(
                "{capability} does not accept notifications"
            )));
        };
        match decode::<DebotBrowserNotify>(capability, data)? {
            DebotBrowserNotify::Log { msg } => browser.log(msg).await,
            DebotBrowserNotify::Switch { context_id } => browser.switch(context_id).await,
            DebotBrowserNotify::SwitchCompleted => browser.switch_completed().await,
            DebotBrowserNotify::ShowAction { action } => browser.show_action(action).await,
            DebotBrowserNotify::Send { message } => browser.send(message).await,
        }
    }
}
