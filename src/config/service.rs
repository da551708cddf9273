//! A minimal settings service: answers `getSetting` from a static file.
//!
//! Every service gets the same item list; the requesting slug is only
//! logged. Values keep the declared type inferred from the file.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::provider::SettingsRequest;
use crate::config::settings::SettingItem;
use crate::config::sources;
use crate::rpc::dispatch::{ActionError, ActionResult, ActionTable, ControllerRegistry};
use crate::rpc::envelope::RpcRequest;
use crate::rpc::direct::DirectHandler;
use crate::utils::error::Result;

pub const GET_SETTING_ACTION: &str = "getSetting";
const CONTROLLER_ID: &str = "settings";

/// Items served for a key → value map, sorted by name.
pub fn setting_items(settings: &HashMap<String, Value>) -> Vec<SettingItem> {
    let mut items: Vec<SettingItem> = settings
        .iter()
        .map(|(name, value)| SettingItem::from_value(name.clone(), value))
        .collect();
    items.sort_by(|a, b| a.name.cmp(&b.name));
    items
}

/// Controller with a single `getSetting` action over `settings`.
pub fn settings_controller(settings: HashMap<String, Value>) -> ActionTable {
    let items = Arc::new(setting_items(&settings));
    ActionTable::new().with(GET_SETTING_ACTION, move |request| {
        get_setting(items.clone(), request)
    })
}

async fn get_setting(items: Arc<Vec<SettingItem>>, request: RpcRequest) -> ActionResult {
    let query: SettingsRequest = serde_json::from_value(request.params)
        .map_err(|e| ActionError::reject(format!("invalid settings request: {e}")))?;
    debug!(
        "serving {} setting(s) to {} at {}",
        items.len(),
        query.slug,
        query.ip_address
    );
    Ok(serde_json::to_value(items.as_ref())?)
}

/// Router serving `POST /{name}/getSetting` from the settings file at `path`.
pub fn settings_router(name: &str, path: &Path) -> Result<Router> {
    let settings = sources::load_file(path);
    info!(
        "settings service `{name}` serving {} key(s) from {}",
        settings.len(),
        path.display()
    );

    let registry = ControllerRegistry::new().with(CONTROLLER_ID, settings_controller(settings));
    let handler = DirectHandler::new(name, Arc::new(registry))?;
    handler.register(GET_SETTING_ACTION, CONTROLLER_ID, None)?;
    Ok(handler.init(Router::new()))
}
