//! Direct RPC over HTTP.
//!
//! The caller POSTs an [`RpcRequest`] as JSON to
//! `http://{base}/{module}/{action}`. The handler side is an axum router
//! mounted under `/{name}` with one POST route per registered action.
//!
//! Status mapping: a resolved or rejected action answers `200` with an
//! envelope whose `isSuccess` tells them apart; an internal fault answers
//! `500` with the error message as plain-text body.

use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use serde_json::Value;
use tracing::{debug, error};

use crate::rpc::dispatch::{ActionError, ActionFactory, ActionFn, Resolver, invoke, resolve_action_func};
use crate::rpc::envelope::{RpcRequest, RpcResponse, create_response, is_valid_action_name};
use crate::rpc::{Caller, Handler};
use crate::utils::error::{Error, Result};

#[derive(Clone)]
pub struct DirectCaller {
    name: String,
    base_address: Arc<RwLock<Option<String>>>,
    client: reqwest::Client,
}

impl DirectCaller {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_client(name, reqwest::Client::new())
    }

    pub fn with_client(name: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            name: name.into(),
            base_address: Arc::new(RwLock::new(None)),
            client,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `host:port` (or a full `http://` URL) that `call` sends requests to.
    pub fn set_base_address(&self, address: impl Into<String>) {
        *self
            .base_address
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(address.into());
    }

    pub fn base_address(&self) -> Option<String> {
        self.base_address
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Calls `module`/`action` at an explicit address, ignoring the base
    /// address. Transport errors are returned as they are; nothing is retried.
    pub async fn call_at(
        &self,
        base: &str,
        module: &str,
        action: &str,
        params: Value,
    ) -> Result<RpcResponse> {
        let url = endpoint_url(base, module, action);
        let request = RpcRequest::new(&self.name, module, params);
        debug!("POST {url}");

        let response = self.client.post(&url).json(&request).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<RpcResponse>().await?);
        }

        let message = response.text().await.unwrap_or_default();
        Err(Error::HandlerFault {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl Caller for DirectCaller {
    async fn call(&self, module: &str, action: &str, params: Value) -> Result<RpcResponse> {
        let base = self
            .base_address()
            .ok_or_else(|| Error::Configuration("direct caller has no base address".into()))?;
        self.call_at(&base, module, action, params).await
    }
}

fn endpoint_url(base: &str, module: &str, action: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.starts_with("http://") || base.starts_with("https://") {
        format!("{base}/{module}/{action}")
    } else {
        format!("http://{base}/{module}/{action}")
    }
}

pub struct DirectHandler {
    name: String,
    resolver: Arc<dyn Resolver>,
    routes: Mutex<Router>,
}

impl DirectHandler {
    pub fn new(name: impl Into<String>, resolver: Arc<dyn Resolver>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || !is_valid_action_name(&name) {
            return Err(Error::InvalidArgument(format!(
                "handler name `{name}` must be a non-empty URL-safe segment"
            )));
        }
        Ok(Self {
            name,
            resolver,
            routes: Mutex::new(Router::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers `POST /{action}` backed by the resolved controller action.
    pub fn register(
        &self,
        action: &str,
        dependency_id: &str,
        factory: Option<&ActionFactory>,
    ) -> Result<()> {
        if !is_valid_action_name(action) {
            return Err(Error::InvalidArgument(format!(
                "action name `{action}` may only contain [a-zA-Z0-9_-]"
            )));
        }
        let func = resolve_action_func(self.resolver.as_ref(), action, dependency_id, factory)?;

        let name = self.name.clone();
        let route = post(move |Json(request): Json<RpcRequest>| {
            let func = func.clone();
            let name = name.clone();
            async move { respond(&name, &func, request).await }
        });

        let mut routes = self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *routes = std::mem::take(&mut *routes).route(&format!("/{action}"), route);
        debug!("direct handler {} serves /{action}", self.name);
        Ok(())
    }

    /// The registered routes nested under `/{name}`. Actions registered
    /// later are not part of an already returned router.
    pub fn router(&self) -> Router {
        let routes = self
            .routes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        Router::new().nest(&format!("/{}", self.name), routes)
    }

    /// Mounts this handler's routes on `app`.
    pub fn init(&self, app: Router) -> Router {
        app.merge(self.router())
    }
}

#[async_trait]
impl Handler for DirectHandler {
    async fn handle(
        &self,
        action: &str,
        dependency_id: &str,
        factory: Option<ActionFactory>,
    ) -> Result<()> {
        self.register(action, dependency_id, factory.as_ref())
    }
}

async fn respond(name: &str, func: &ActionFn, request: RpcRequest) -> Response {
    let reply_to = request.from.clone();
    match invoke(func, request).await {
        Ok(data) => (StatusCode::OK, Json(create_response(name, true, data, &reply_to))).into_response(),
        Err(ActionError::Rejected(data)) => {
            (StatusCode::OK, Json(create_response(name, false, data, &reply_to))).into_response()
        }
        Err(ActionError::Internal(message)) => {
            error!("direct handler {name} failed: {message}");
            (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
        }
    }
}
