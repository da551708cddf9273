use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::error::{Error, Result};

/// Recognized setting keys. The same name is used in the static file, the
/// process environment and the remote settings service.
pub mod keys {
    /// JSON array of settings-service addresses (`host:port`).
    pub const SETTINGS_SERVICE_ADDRESSES: &str = "SETTINGS_SERVICE_ADDRESSES";
    /// Module name the settings service registers its direct handler under.
    pub const SETTINGS_SERVICE_NAME: &str = "SETTINGS_SERVICE_NAME";
    /// Period of the background refetch, in milliseconds.
    pub const SETTINGS_REFETCH_INTERVAL: &str = "SETTINGS_REFETCH_INTERVAL";
    pub const SERVICE_SLUG: &str = "SERVICE_SLUG";
    pub const SERVICE_IP_ADDRESS: &str = "SERVICE_IP_ADDRESS";
    pub const BROKER_HOST: &str = "BROKER_HOST";
    pub const BROKER_USERNAME: &str = "BROKER_USERNAME";
    pub const BROKER_PASSWORD: &str = "BROKER_PASSWORD";
    pub const BROKER_EXCHANGE: &str = "BROKER_EXCHANGE";
    pub const BROKER_QUEUE: &str = "BROKER_QUEUE";
    /// Milliseconds between reconnection attempts.
    pub const BROKER_RECONNECT_TIMEOUT: &str = "BROKER_RECONNECT_TIMEOUT";
    pub const BROKER_RECONNECT_ATTEMPTS: &str = "BROKER_RECONNECT_ATTEMPTS";
    /// Per-message expiration, in milliseconds.
    pub const BROKER_MESSAGE_EXPIRY: &str = "BROKER_MESSAGE_EXPIRY";
    /// Mediate RPC call timeout in milliseconds; `0` disables it.
    pub const RPC_TIMEOUT: &str = "RPC_TIMEOUT";
    pub const LOG_LEVEL: &str = "LOG_LEVEL";
}

pub const DEFAULT_REFETCH_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_SETTINGS_SERVICE_NAME: &str = "settings";

/// Declared type of a setting value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    String,
    Number,
    Boolean,
}

/// One entry of the settings service's `getSetting` answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingItem {
    pub name: String,
    pub value: String,
    pub data_type: DataType,
}

impl SettingItem {
    pub fn new(name: impl Into<String>, value: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            data_type,
        }
    }

    /// Builds an item from a JSON value, inferring its declared type.
    pub fn from_value(name: impl Into<String>, value: &Value) -> Self {
        match value {
            Value::String(s) => Self::new(name, s.clone(), DataType::String),
            Value::Bool(b) => Self::new(name, b.to_string(), DataType::Boolean),
            Value::Number(n) => Self::new(name, n.to_string(), DataType::Number),
            other => Self::new(name, other.to_string(), DataType::String),
        }
    }
}

/// Decodes a raw setting value against the type the caller expects.
///
/// Strings pass through untouched. Every other type is parsed as JSON, so a
/// boolean must be the literal `true`/`false` and a number a JSON number.
pub fn decode_value(key: &str, raw: &Value, expected: DataType) -> Result<Value> {
    let parse_err = |reason: String| Error::SettingParse {
        key: key.to_string(),
        reason,
    };

    match expected {
        DataType::String => Ok(match raw {
            Value::String(_) => raw.clone(),
            other => Value::String(other.to_string()),
        }),
        DataType::Number | DataType::Boolean => {
            let value = match raw {
                Value::String(s) => serde_json::from_str::<Value>(s.trim())
                    .map_err(|e| parse_err(e.to_string()))?,
                other => other.clone(),
            };
            let fits = match expected {
                DataType::Number => value.is_number(),
                _ => value.is_boolean(),
            };
            if fits {
                Ok(value)
            } else {
                Err(parse_err(format!("expected {expected:?}, got {value}")))
            }
        }
    }
}

/// Connection parameters of the broker adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerSettings {
    pub host: String,
    pub username: String,
    pub password: String,
    pub exchange: String,
    /// Fixed name for the consume queue; the broker picks one when unset.
    pub queue: Option<String>,
    pub reconnect_timeout: Duration,
    pub reconnect_attempts: u32,
    /// Expiration applied to published messages, in milliseconds.
    pub message_expiry: Option<u64>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1:5680".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            exchange: "services".to_string(),
            queue: None,
            reconnect_timeout: Duration::from_millis(5000),
            reconnect_attempts: 0,
            message_expiry: None,
        }
    }
}
