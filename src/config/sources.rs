//! Local setting layers: the static file and the process environment.

use std::collections::HashMap;
use std::path::Path;

use config::{Config, File};
use serde_json::Value;
use tracing::{debug, warn};

use crate::utils::error::Result;

/// Loads the static settings file into a key → value map.
///
/// The format follows the file extension (TOML, JSON, YAML, ...). Keys are
/// upper-cased so they line up with the environment layer. A missing or
/// unreadable file yields an empty map.
pub fn load_file(path: &Path) -> HashMap<String, Value> {
    match read_file(path) {
        Ok(map) => {
            debug!("loaded {} settings from {}", map.len(), path.display());
            map
        }
        Err(e) => {
            warn!("ignoring settings file {}: {e}", path.display());
            HashMap::new()
        }
    }
}

fn read_file(path: &Path) -> Result<HashMap<String, Value>> {
    let config = Config::builder()
        .add_source(File::from(path).required(false))
        .build()?;
    let raw: HashMap<String, Value> = config.try_deserialize()?;
    Ok(raw
        .into_iter()
        .map(|(key, value)| (key.to_uppercase(), value))
        .collect())
}

/// Loads a `.env` file into the process environment. Variables that are
/// already set win over the file.
pub fn load_env_file(path: &Path) {
    match dotenvy::from_path(path) {
        Ok(()) => debug!("loaded environment from {}", path.display()),
        Err(e) if e.not_found() => {}
        Err(e) => warn!("ignoring env file {}: {e}", path.display()),
    }
}

/// Environment layer lookup. Values are always strings.
pub fn env_value(key: &str) -> Option<Value> {
    std::env::var(key).ok().map(Value::String)
}
