//! Controller-action resolution and invocation.
//!
//! Controllers are registered under an identifier in a [`Resolver`] when the
//! service is assembled. A handler asks for `(action, identifier)` once, when
//! it registers the action; failing to resolve is a wiring mistake and is
//! reported as [`Error::Configuration`].
//!
//! An action completes exactly once by returning. `Ok(value)` resolves the
//! call, `Err(ActionError::Rejected)` is a business rejection the caller is
//! expected to handle, and `Err(ActionError::Internal)` (or a panic) is a
//! fault in the handler itself. Transports report the two failure kinds
//! differently.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tracing::error;

use crate::rpc::envelope::RpcRequest;
use crate::utils::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum ActionError {
    /// The request was refused; `0` goes back to the caller as `data`.
    Rejected(Value),
    /// The handler broke.
    Internal(String),
}

impl ActionError {
    /// A rejection carrying any serializable value.
    pub fn reject(value: impl Serialize) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => ActionError::Rejected(value),
            Err(e) => ActionError::Internal(format!("unserializable rejection: {e}")),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ActionError::Internal(message.into())
    }
}

impl From<Error> for ActionError {
    fn from(e: Error) -> Self {
        ActionError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for ActionError {
    fn from(e: serde_json::Error) -> Self {
        ActionError::Internal(e.to_string())
    }
}

pub type ActionResult = std::result::Result<Value, ActionError>;

pub type ActionFn = Arc<dyn Fn(RpcRequest) -> BoxFuture<'static, ActionResult> + Send + Sync>;

/// Produces an action for a controller that has no method of that name.
pub type ActionFactory = Arc<dyn Fn(Arc<dyn Controller>) -> Option<ActionFn> + Send + Sync>;

/// Boxes an async closure into an [`ActionFn`].
pub fn action_fn<F, Fut>(f: F) -> ActionFn
where
    F: Fn(RpcRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ActionResult> + Send + 'static,
{
    Arc::new(move |request: RpcRequest| f(request).boxed())
}

pub trait Controller: Send + Sync {
    /// The action registered under `name`, if this controller has one.
    fn action(&self, name: &str) -> Option<ActionFn>;
}

pub trait Resolver: Send + Sync {
    fn resolve(&self, id: &str) -> Option<Arc<dyn Controller>>;
}

/// Controller built from a table of named actions.
#[derive(Default, Clone)]
pub struct ActionTable {
    actions: HashMap<String, ActionFn>,
}

impl ActionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F, Fut>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(RpcRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
    {
        self.actions.insert(name.to_string(), action_fn(f));
        self
    }
}

impl Controller for ActionTable {
    fn action(&self, name: &str) -> Option<ActionFn> {
        self.actions.get(name).cloned()
    }
}

/// Identifier → controller map, filled at composition time.
#[derive(Default, Clone)]
pub struct ControllerRegistry {
    controllers: HashMap<String, Arc<dyn Controller>>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: &str, controller: Arc<dyn Controller>) {
        self.controllers.insert(id.to_string(), controller);
    }

    pub fn with(mut self, id: &str, controller: impl Controller + 'static) -> Self {
        self.register(id, Arc::new(controller));
        self
    }
}

impl Resolver for ControllerRegistry {
    fn resolve(&self, id: &str) -> Option<Arc<dyn Controller>> {
        self.controllers.get(id).cloned()
    }
}

/// Finds the function behind `action_name` on the controller registered as
/// `dependency_id`, falling back to `factory` when the controller has no
/// such action.
pub fn resolve_action_func(
    resolver: &dyn Resolver,
    action_name: &str,
    dependency_id: &str,
    factory: Option<&ActionFactory>,
) -> Result<ActionFn> {
    let controller = resolver.resolve(dependency_id).ok_or_else(|| {
        Error::Configuration(format!("Cannot resolve dependency `{dependency_id}`"))
    })?;

    controller
        .action(action_name)
        .or_else(|| factory.and_then(|make| make(controller.clone())))
        .ok_or_else(|| {
            Error::Configuration(format!(
                "Specified action does not exist in controller: `{action_name}` on `{dependency_id}`"
            ))
        })
}

/// Runs an action, turning a panic into [`ActionError::Internal`].
pub async fn invoke(action: &ActionFn, request: RpcRequest) -> ActionResult {
    match AssertUnwindSafe(action(request)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "action panicked".to_string());
            error!("action panicked: {message}");
            Err(ActionError::Internal(message))
        }
    }
}
