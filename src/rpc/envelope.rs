//! Request/response envelope shared by the HTTP and broker transports.
//!
//! Both transports serialize the same two shapes as JSON: an [`RpcRequest`]
//! going out and an [`RpcResponse`] coming back.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    pub fn new(from: impl Into<String>, to: impl Into<String>, params: Value) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    pub is_success: bool,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub data: Value,
}

impl RpcResponse {
    /// `data` when the call succeeded, the rejection otherwise.
    pub fn into_result(self) -> Result<Value, Value> {
        if self.is_success {
            Ok(self.data)
        } else {
            Err(self.data)
        }
    }
}

/// Builds the envelope a handler named `from` sends back to `reply_to`.
pub fn create_response(from: &str, is_success: bool, data: Value, reply_to: &str) -> RpcResponse {
    RpcResponse {
        is_success,
        from: from.to_string(),
        to: reply_to.to_string(),
        data,
    }
}

pub fn request_topic(service: &str, action: &str) -> String {
    format!("request.{service}.{action}")
}

pub fn response_topic(service: &str, action: &str) -> String {
    format!("response.{service}.{action}")
}

static ACTION_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]*$").expect("action name pattern is valid"));

/// Action names end up in URLs and topic names, so only
/// `[a-zA-Z0-9_-]` is allowed.
pub fn is_valid_action_name(action: &str) -> bool {
    ACTION_NAME.is_match(action)
}
