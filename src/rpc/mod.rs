//! Request/response calls between services.
//!
//! Two transports share one envelope ([`envelope`]) and one dispatch scheme
//! ([`dispatch`]): [`direct`] carries calls over HTTP, [`mediate`] carries
//! them over the message broker. Each side implements the [`Caller`] or
//! [`Handler`] capability independently.

pub mod direct;
pub mod dispatch;
pub mod envelope;
pub mod mediate;

use async_trait::async_trait;
use serde_json::Value;

use crate::utils::error::Result;

pub use direct::{DirectCaller, DirectHandler};
pub use dispatch::{
    ActionError, ActionFactory, ActionFn, ActionResult, ActionTable, Controller,
    ControllerRegistry, Resolver, action_fn, resolve_action_func,
};
pub use envelope::{RpcRequest, RpcResponse, create_response};
pub use mediate::{MediateCaller, MediateHandler};

#[async_trait]
pub trait Caller: Send + Sync {
    /// Calls `action` on the service named `module` and waits for its
    /// response envelope.
    async fn call(&self, module: &str, action: &str, params: Value) -> Result<RpcResponse>;
}

#[async_trait]
pub trait Handler: Send + Sync {
    /// Exposes the controller action `action` of `dependency_id`. `factory`
    /// supplies the function when the controller has no action of that name.
    async fn handle(
        &self,
        action: &str,
        dependency_id: &str,
        factory: Option<ActionFactory>,
    ) -> Result<()>;
}
