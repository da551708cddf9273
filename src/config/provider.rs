//! Layered configuration provider.
//!
//! Lookups go remote map → process environment → static file. The remote
//! map comes from a settings service reached over direct RPC; it is replaced
//! wholesale on every successful fetch, and the keys that changed are
//! broadcast to subscribers.
//!
//! The candidate addresses are tried in order. The first one that answers
//! moves to the front, so the last known good service is tried first next
//! time. After the first successful fetch a background timer refetches
//! periodically; its period is itself a remote setting and changing it
//! re-arms the timer. A fetch where every address fails is critical only
//! while no timer is running yet. Once the service is up, a failed refetch
//! is logged and the previous settings stay in effect.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::settings::{
    BrokerSettings, DEFAULT_REFETCH_INTERVAL_MS, DEFAULT_SETTINGS_SERVICE_NAME, DataType,
    SettingItem, decode_value, keys,
};
use crate::config::sources;
use crate::rpc::direct::DirectCaller;
use crate::utils::error::{Error, Result};

/// Payload of the settings service's `getSetting` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsRequest {
    pub slug: String,
    pub ip_address: String,
}

/// Where remote settings come from.
#[async_trait]
pub trait SettingsSource: Send + Sync {
    async fn get_settings(
        &self,
        address: &str,
        request: &SettingsRequest,
    ) -> Result<Vec<SettingItem>>;
}

/// Fetches settings with a direct RPC `getSetting` call.
pub struct DirectSettingsSource {
    caller: DirectCaller,
    module: String,
}

impl DirectSettingsSource {
    pub fn new(caller: DirectCaller, module: impl Into<String>) -> Self {
        Self {
            caller,
            module: module.into(),
        }
    }
}

#[async_trait]
impl SettingsSource for DirectSettingsSource {
    async fn get_settings(
        &self,
        address: &str,
        request: &SettingsRequest,
    ) -> Result<Vec<SettingItem>> {
        let params = serde_json::to_value(request)?;
        let response = self
            .caller
            .call_at(address, &self.module, "getSetting", params)
            .await?;
        if !response.is_success {
            return Err(Error::Rejected(response.data));
        }
        Ok(serde_json::from_value(response.data)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    Initialized,
    Fetching,
    Fetched,
    FetchFailed,
}

#[derive(Default)]
pub struct ProviderOptions {
    /// Static settings file; missing or unreadable means an empty layer.
    pub file: Option<PathBuf>,
    /// `.env` file merged into the process environment at startup.
    pub env_file: Option<PathBuf>,
    /// Remote source; a direct-RPC source is built when unset.
    pub source: Option<Arc<dyn SettingsSource>>,
    /// Identity of this service in `getSetting` requests.
    pub service_name: Option<String>,
}

struct Refetch {
    period: watch::Sender<Duration>,
    task: JoinHandle<()>,
}

struct Inner {
    file: HashMap<String, Value>,
    remote: RwLock<BTreeMap<String, Value>>,
    addresses: Mutex<Vec<String>>,
    source: Arc<dyn SettingsSource>,
    service_name: Option<String>,
    changes: broadcast::Sender<Vec<String>>,
    state: Mutex<ProviderState>,
    refetch: Mutex<Option<Refetch>>,
    fetch_lock: tokio::sync::Mutex<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let refetch = self
            .refetch
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(refetch) = refetch.take() {
            refetch.task.abort();
        }
    }
}

#[derive(Clone)]
pub struct ConfigurationProvider {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConfigurationProvider {
    /// Loads the local layers and the candidate address list.
    pub fn init(options: ProviderOptions) -> Self {
        if let Some(env_file) = &options.env_file {
            sources::load_env_file(env_file);
        }
        let file = options
            .file
            .as_deref()
            .map(sources::load_file)
            .unwrap_or_default();

        let file_or_env = |key: &str| {
            sources::env_value(key).or_else(|| file.get(key).cloned())
        };

        let addresses = match file_or_env(keys::SETTINGS_SERVICE_ADDRESSES) {
            Some(raw) => parse_addresses(&raw).unwrap_or_else(|e| {
                warn!("ignoring {}: {e}", keys::SETTINGS_SERVICE_ADDRESSES);
                Vec::new()
            }),
            None => Vec::new(),
        };

        let source = options.source.unwrap_or_else(|| {
            let module = file_or_env(keys::SETTINGS_SERVICE_NAME)
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| DEFAULT_SETTINGS_SERVICE_NAME.to_string());
            let caller = DirectCaller::new(options.service_name.clone().unwrap_or_default());
            Arc::new(DirectSettingsSource::new(caller, module))
        });

        let (changes, _) = broadcast::channel(64);
        debug!(
            "configuration initialized with {} file settings and {} settings service address(es)",
            file.len(),
            addresses.len()
        );

        Self {
            inner: Arc::new(Inner {
                file,
                remote: RwLock::new(BTreeMap::new()),
                addresses: Mutex::new(addresses),
                source,
                service_name: options.service_name,
                changes,
                state: Mutex::new(ProviderState::Initialized),
                refetch: Mutex::new(None),
                fetch_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Raw value of `key`: remote, then environment, then file.
    pub fn get(&self, key: &str) -> Option<Value> {
        let remote = self
            .inner
            .remote
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned();
        remote
            .or_else(|| sources::env_value(key))
            .or_else(|| self.inner.file.get(&key.to_uppercase()).cloned())
    }

    /// Value of `key` decoded as `data_type`. A malformed value is an error
    /// for this access only.
    pub fn get_typed(&self, key: &str, data_type: DataType) -> Result<Option<Value>> {
        self.get(key)
            .map(|raw| decode_value(key, &raw, data_type))
            .transpose()
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).map(|value| match value {
            Value::String(s) => s,
            other => other.to_string(),
        })
    }

    pub fn get_number(&self, key: &str) -> Result<Option<f64>> {
        Ok(self
            .get_typed(key, DataType::Number)?
            .and_then(|v| v.as_f64()))
    }

    pub fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        match self.get_typed(key, DataType::Number)? {
            None => Ok(None),
            Some(value) => value.as_u64().map(Some).ok_or_else(|| Error::SettingParse {
                key: key.to_string(),
                reason: format!("expected a non-negative integer, got {value}"),
            }),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        Ok(self
            .get_typed(key, DataType::Boolean)?
            .and_then(|v| v.as_bool()))
    }

    /// Value of `key` deserialized from JSON (string values are parsed first).
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(serde_json::from_str(&s)?)),
            Some(other) => Ok(Some(serde_json::from_value(other)?)),
        }
    }

    pub fn state(&self) -> ProviderState {
        *lock(&self.inner.state)
    }

    /// Candidate settings-service addresses in the order they will be tried.
    pub fn addresses(&self) -> Vec<String> {
        lock(&self.inner.addresses).clone()
    }

    pub fn remote_enabled(&self) -> bool {
        !lock(&self.inner.addresses).is_empty()
    }

    pub fn has_refetch_timer(&self) -> bool {
        lock(&self.inner.refetch).is_some()
    }

    /// Receives the list of changed keys after every fetch that changed any.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<String>> {
        self.inner.changes.subscribe()
    }

    /// Cancels the background refetch, if any.
    pub fn stop_refetch(&self) {
        if let Some(refetch) = lock(&self.inner.refetch).take() {
            refetch.task.abort();
            debug!("settings refetch stopped");
        }
    }

    /// Fetches the remote settings from the first address that answers.
    ///
    /// Returns `Ok(true)` on success. When every address fails this is a
    /// critical error unless the refetch timer is already running, in which
    /// case the failure is logged and `Ok(false)` is returned.
    pub async fn fetch(&self) -> Result<bool> {
        let _serialized = self.inner.fetch_lock.lock().await;

        let candidates = self.addresses();
        if candidates.is_empty() {
            debug!("no settings service configured, skipping fetch");
            return Ok(false);
        }

        self.set_state(ProviderState::Fetching);
        let request = self.settings_request();

        for address in &candidates {
            match self.inner.source.get_settings(address, &request).await {
                Ok(items) => {
                    self.apply(address, items);
                    self.set_state(ProviderState::Fetched);
                    return Ok(true);
                }
                Err(e) => warn!("settings service at {address} failed: {e}"),
            }
        }

        if self.has_refetch_timer() {
            error!(
                "settings refetch failed on all {} address(es), keeping previous settings",
                candidates.len()
            );
            self.set_state(ProviderState::Fetched);
            Ok(false)
        } else {
            self.set_state(ProviderState::FetchFailed);
            Err(Error::critical(
                "Settings fetch error",
                Error::Configuration(format!(
                    "no settings service reachable among {} address(es)",
                    candidates.len()
                )),
            ))
        }
    }

    /// Broker connection parameters, defaults filling every absent key.
    pub fn broker_settings(&self) -> Result<BrokerSettings> {
        let default = BrokerSettings::default();
        Ok(BrokerSettings {
            host: self.get_string(keys::BROKER_HOST).unwrap_or(default.host),
            username: self
                .get_string(keys::BROKER_USERNAME)
                .unwrap_or(default.username),
            password: self
                .get_string(keys::BROKER_PASSWORD)
                .unwrap_or(default.password),
            exchange: self
                .get_string(keys::BROKER_EXCHANGE)
                .unwrap_or(default.exchange),
            queue: self
                .get_string(keys::BROKER_QUEUE)
                .filter(|q| !q.is_empty())
                .or(default.queue),
            reconnect_timeout: self
                .get_u64(keys::BROKER_RECONNECT_TIMEOUT)?
                .map(Duration::from_millis)
                .unwrap_or(default.reconnect_timeout),
            reconnect_attempts: self
                .get_u64(keys::BROKER_RECONNECT_ATTEMPTS)?
                .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
                .unwrap_or(default.reconnect_attempts),
            message_expiry: self
                .get_u64(keys::BROKER_MESSAGE_EXPIRY)?
                .or(default.message_expiry),
        })
    }

    /// Mediate RPC timeout; `Some(0)` in settings disables it.
    pub fn rpc_timeout(&self) -> Result<Option<Duration>> {
        Ok(match self.get_u64(keys::RPC_TIMEOUT)? {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => Some(crate::rpc::mediate::DEFAULT_CALL_TIMEOUT),
        })
    }

    pub fn refetch_interval(&self) -> Duration {
        match self.get_u64(keys::SETTINGS_REFETCH_INTERVAL) {
            Ok(Some(ms)) if ms > 0 => Duration::from_millis(ms),
            Ok(_) => Duration::from_millis(DEFAULT_REFETCH_INTERVAL_MS),
            Err(e) => {
                warn!("{e}, using the default refetch interval");
                Duration::from_millis(DEFAULT_REFETCH_INTERVAL_MS)
            }
        }
    }

    fn set_state(&self, state: ProviderState) {
        *lock(&self.inner.state) = state;
    }

    fn settings_request(&self) -> SettingsRequest {
        let slug = self
            .get_string(keys::SERVICE_SLUG)
            .or_else(|| self.inner.service_name.clone())
            .unwrap_or_default();
        let ip_address = self
            .get_string(keys::SERVICE_IP_ADDRESS)
            .unwrap_or_else(|| "127.0.0.1".to_string());
        SettingsRequest { slug, ip_address }
    }

    fn apply(&self, address: &str, items: Vec<SettingItem>) {
        promote(&mut lock(&self.inner.addresses), address);

        let fresh: BTreeMap<String, Value> = items
            .into_iter()
            .map(|item| (item.name, Value::String(item.value)))
            .collect();
        let changed = {
            let mut remote = self
                .inner
                .remote
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let changed = diff_settings(&remote, &fresh);
            *remote = fresh;
            changed
        };
        info!(
            "fetched settings from {address}, {} key(s) changed",
            changed.len()
        );

        if !changed.is_empty() {
            // no receivers is fine
            let _ = self.inner.changes.send(changed.clone());
            self.on_settings_changed(&changed);
        }

        if !self.has_refetch_timer() {
            self.install_refetch(self.refetch_interval());
        }
    }

    /// The provider's own reaction to a change broadcast: re-arm the timer
    /// and pick up a new address list.
    fn on_settings_changed(&self, changed: &[String]) {
        if changed.iter().any(|k| k == keys::SETTINGS_REFETCH_INTERVAL) {
            if let Some(refetch) = lock(&self.inner.refetch).as_ref() {
                let period = self.refetch_interval();
                debug!("re-arming settings refetch every {period:?}");
                let _ = refetch.period.send(period);
            }
        }

        if changed.iter().any(|k| k == keys::SETTINGS_SERVICE_ADDRESSES) {
            let parsed = match self.get(keys::SETTINGS_SERVICE_ADDRESSES) {
                Some(raw) => parse_addresses(&raw),
                None => Ok(Vec::new()),
            };
            match parsed {
                Ok(list) if !list.is_empty() => {
                    info!("settings service addresses updated: {list:?}");
                    *lock(&self.inner.addresses) = list;
                }
                Ok(_) => warn!("new settings service address list is empty, keeping the previous one"),
                Err(e) => warn!("new settings service address list is invalid ({e}), keeping the previous one"),
            }
        }
    }

    fn install_refetch(&self, period: Duration) {
        let mut slot = lock(&self.inner.refetch);
        if slot.is_some() {
            return;
        }
        let (tx, rx) = watch::channel(period);
        let task = tokio::spawn(refetch_loop(Arc::downgrade(&self.inner), rx));
        *slot = Some(Refetch { period: tx, task });
        info!("settings refetch armed every {period:?}");
    }
}

async fn refetch_loop(inner: Weak<Inner>, mut period: watch::Receiver<Duration>) {
    loop {
        let current = *period.borrow_and_update();
        tokio::select! {
            _ = tokio::time::sleep(current) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let provider = ConfigurationProvider { inner };
                if let Err(e) = provider.fetch().await {
                    error!("background settings refetch failed: {e}");
                }
            }
            changed = period.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

/// Moves `address` to the front, keeping the others in order.
pub fn promote(addresses: &mut Vec<String>, address: &str) {
    if let Some(pos) = addresses.iter().position(|a| a == address) {
        let promoted = addresses.remove(pos);
        addresses.insert(0, promoted);
    }
}

/// Keys whose value differs between `old` and `new`: changed or added keys
/// first, then removed keys.
pub fn diff_settings(old: &BTreeMap<String, Value>, new: &BTreeMap<String, Value>) -> Vec<String> {
    let mut changed: Vec<String> = new
        .iter()
        .filter(|(key, value)| old.get(*key) != Some(*value))
        .map(|(key, _)| key.clone())
        .collect();
    changed.extend(old.keys().filter(|key| !new.contains_key(*key)).cloned());
    changed
}

/// Accepts a JSON array value or a string holding one.
pub fn parse_addresses(raw: &Value) -> Result<Vec<String>> {
    let list: Vec<String> = match raw {
        Value::String(s) => serde_json::from_str(s)?,
        other => serde_json::from_value(other.clone())?,
    };
    Ok(list
        .into_iter()
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .collect())
}
