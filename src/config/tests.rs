use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use serial_test::serial;
use tempfile::{TempDir, tempdir};
use tokio::net::TcpListener;

use super::provider::{diff_settings, parse_addresses, promote};
use super::service::{setting_items, settings_router};
use super::settings::{DataType, SettingItem, decode_value, keys};
use super::sources::load_file;
use super::{ConfigurationProvider, ProviderOptions, ProviderState, SettingsRequest, SettingsSource};
use crate::broker::transport::TransportError;
use crate::utils::error::{Error, Result};

#[derive(Default)]
struct FakeSource {
    answers: Mutex<HashMap<String, Vec<SettingItem>>>,
    calls: Mutex<Vec<String>>,
    requests: Mutex<Vec<SettingsRequest>>,
}

impl FakeSource {
    fn answer(&self, address: &str, items: Vec<SettingItem>) {
        self.answers
            .lock()
            .unwrap()
            .insert(address.to_string(), items);
    }

    fn fail(&self, address: &str) {
        self.answers.lock().unwrap().remove(address);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SettingsSource for FakeSource {
    async fn get_settings(
        &self,
        address: &str,
        request: &SettingsRequest,
    ) -> Result<Vec<SettingItem>> {
        self.calls.lock().unwrap().push(address.to_string());
        self.requests.lock().unwrap().push(request.clone());
        match self.answers.lock().unwrap().get(address) {
            Some(items) => Ok(items.clone()),
            None => Err(Error::Transport(TransportError::Unreachable(
                address.to_string(),
            ))),
        }
    }
}

fn item(name: &str, value: &str) -> SettingItem {
    SettingItem::new(name, value, DataType::String)
}

fn write_settings(dir: &TempDir, name: &str, contents: Value) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents.to_string()).unwrap();
    path
}

fn provider_with(file: Value, source: Arc<FakeSource>) -> (ConfigurationProvider, TempDir) {
    let dir = tempdir().unwrap();
    let path = write_settings(&dir, "settings.json", file);
    let provider = ConfigurationProvider::init(ProviderOptions {
        file: Some(path),
        source: Some(source as Arc<dyn SettingsSource>),
        service_name: Some("orders".to_string()),
        ..ProviderOptions::default()
    });
    (provider, dir)
}

#[test]
fn test_promote_moves_address_to_front() {
    let mut addresses = vec!["A".to_string(), "B".to_string(), "C".to_string()];
    promote(&mut addresses, "C");
    assert_eq!(addresses, vec!["C", "A", "B"]);

    promote(&mut addresses, "Z");
    assert_eq!(addresses, vec!["C", "A", "B"]);
}

#[test]
fn test_diff_reports_changed_added_and_removed() {
    let old: BTreeMap<String, Value> =
        BTreeMap::from([("x".into(), json!(1)), ("y".into(), json!(2))]);
    let new: BTreeMap<String, Value> =
        BTreeMap::from([("y".into(), json!(3)), ("z".into(), json!(4))]);
    assert_eq!(diff_settings(&old, &new), vec!["y", "z", "x"]);

    assert!(diff_settings(&new, &new.clone()).is_empty());
}

#[test]
fn test_parse_addresses() {
    assert_eq!(
        parse_addresses(&json!(r#"["a:1", " b:2 ", ""]"#)).unwrap(),
        vec!["a:1", "b:2"]
    );
    assert_eq!(parse_addresses(&json!(["c:3"])).unwrap(), vec!["c:3"]);
    assert!(parse_addresses(&json!("a:1,b:2")).is_err());
    assert!(parse_addresses(&json!(42)).is_err());
}

#[test]
fn test_decode_value() {
    assert_eq!(
        decode_value("n", &json!("42"), DataType::Number).unwrap(),
        json!(42)
    );
    assert_eq!(
        decode_value("b", &json!(" true "), DataType::Boolean).unwrap(),
        json!(true)
    );
    assert_eq!(
        decode_value("s", &json!("true"), DataType::String).unwrap(),
        json!("true")
    );
    assert_eq!(
        decode_value("s", &json!(5), DataType::String).unwrap(),
        json!("5")
    );

    let err = decode_value("b", &json!("yes"), DataType::Boolean).unwrap_err();
    assert!(matches!(err, Error::SettingParse { ref key, .. } if key == "b"));
    assert!(decode_value("n", &json!("true"), DataType::Number).is_err());
}

#[test]
fn test_setting_item_wire_format() {
    let item: SettingItem =
        serde_json::from_value(json!({"name": "a", "value": "1", "dataType": "Number"})).unwrap();
    assert_eq!(item, SettingItem::new("a", "1", DataType::Number));
    assert_eq!(
        serde_json::to_value(SettingItem::from_value("flag", &json!(true))).unwrap(),
        json!({"name": "flag", "value": "true", "dataType": "Boolean"})
    );
}

#[test]
fn test_load_file_normalizes_keys() {
    let dir = tempdir().unwrap();
    let path = write_settings(
        &dir,
        "settings.json",
        json!({"broker_host": "mq:5672", "RETRIES": 3}),
    );
    let map = load_file(&path);
    assert_eq!(map.get("BROKER_HOST"), Some(&json!("mq:5672")));
    assert_eq!(map.get("RETRIES"), Some(&json!(3)));
}

#[test]
fn test_unreadable_file_is_an_empty_layer() {
    let dir = tempdir().unwrap();
    assert!(load_file(&dir.path().join("missing.json")).is_empty());

    let broken = dir.path().join("broken.json");
    std::fs::write(&broken, "{ not json").unwrap();
    assert!(load_file(&broken).is_empty());
}

#[test]
fn test_setting_items_infer_types() {
    let settings = HashMap::from([
        ("RETRIES".to_string(), json!(3)),
        ("ENABLED".to_string(), json!(false)),
        ("GREETING".to_string(), json!("hello")),
    ]);
    assert_eq!(
        setting_items(&settings),
        vec![
            SettingItem::new("ENABLED", "false", DataType::Boolean),
            SettingItem::new("GREETING", "hello", DataType::String),
            SettingItem::new("RETRIES", "3", DataType::Number),
        ]
    );
}

#[tokio::test]
async fn test_fetch_promotes_first_answering_address() {
    let source = Arc::new(FakeSource::default());
    source.answer("C", vec![item("K", "v")]);
    let (provider, _dir) = provider_with(
        json!({ "SETTINGS_SERVICE_ADDRESSES": ["A", "B", "C"] }),
        source.clone(),
    );
    assert_eq!(provider.state(), ProviderState::Initialized);

    assert!(provider.fetch().await.unwrap());
    assert_eq!(source.calls(), vec!["A", "B", "C"]);
    assert_eq!(provider.addresses(), vec!["C", "A", "B"]);
    assert_eq!(provider.state(), ProviderState::Fetched);
    assert!(provider.has_refetch_timer());

    let request = source.requests.lock().unwrap()[0].clone();
    assert_eq!(request.slug, "orders");
    provider.stop_refetch();
}

#[tokio::test]
async fn test_first_fetch_failure_is_critical() {
    let source = Arc::new(FakeSource::default());
    let (provider, _dir) = provider_with(
        json!({ "SETTINGS_SERVICE_ADDRESSES": ["A", "B"] }),
        source.clone(),
    );

    let err = provider.fetch().await.unwrap_err();
    assert!(err.is_critical());
    assert_eq!(err.context(), Some("Settings fetch error"));
    assert_eq!(provider.state(), ProviderState::FetchFailed);
    assert!(!provider.has_refetch_timer());
    assert_eq!(provider.addresses(), vec!["A", "B"]);
}

#[tokio::test]
async fn test_refetch_failure_keeps_previous_settings() {
    let source = Arc::new(FakeSource::default());
    source.answer("A", vec![item("K", "first")]);
    let (provider, _dir) =
        provider_with(json!({ "SETTINGS_SERVICE_ADDRESSES": ["A"] }), source.clone());

    assert!(provider.fetch().await.unwrap());
    source.fail("A");

    assert!(!provider.fetch().await.unwrap());
    assert_eq!(provider.get_string("K").as_deref(), Some("first"));
    assert_eq!(provider.state(), ProviderState::Fetched);
    provider.stop_refetch();
}

#[tokio::test]
async fn test_no_addresses_disables_remote_layer() {
    let source = Arc::new(FakeSource::default());
    let (provider, _dir) = provider_with(json!({ "OTHER": "x" }), source.clone());

    assert!(!provider.remote_enabled());
    assert!(!provider.fetch().await.unwrap());
    assert!(source.calls().is_empty());
    assert_eq!(provider.state(), ProviderState::Initialized);
}

#[tokio::test]
async fn test_malformed_address_list_is_ignored() {
    let source = Arc::new(FakeSource::default());
    let (provider, _dir) = provider_with(
        json!({ "SETTINGS_SERVICE_ADDRESSES": "A,B" }),
        source.clone(),
    );
    assert!(provider.addresses().is_empty());
}

#[tokio::test]
async fn test_changes_are_broadcast() {
    let source = Arc::new(FakeSource::default());
    source.answer("A", vec![item("x", "1"), item("y", "2")]);
    let (provider, _dir) =
        provider_with(json!({ "SETTINGS_SERVICE_ADDRESSES": ["A"] }), source.clone());
    let mut changes = provider.subscribe();

    provider.fetch().await.unwrap();
    assert_eq!(changes.try_recv().unwrap(), vec!["x", "y"]);

    source.answer("A", vec![item("y", "3"), item("z", "4")]);
    provider.fetch().await.unwrap();
    assert_eq!(changes.try_recv().unwrap(), vec!["y", "z", "x"]);

    // nothing changed, nothing sent
    provider.fetch().await.unwrap();
    assert!(changes.try_recv().is_err());
    provider.stop_refetch();
}

#[tokio::test]
async fn test_remote_address_list_replaces_candidates() {
    let source = Arc::new(FakeSource::default());
    source.answer(
        "A",
        vec![item(keys::SETTINGS_SERVICE_ADDRESSES, r#"["D", "A"]"#)],
    );
    let (provider, _dir) = provider_with(
        json!({ "SETTINGS_SERVICE_ADDRESSES": ["B", "A"] }),
        source.clone(),
    );

    provider.fetch().await.unwrap();
    assert_eq!(provider.addresses(), vec!["D", "A"]);

    source.answer("A", vec![item(keys::SETTINGS_SERVICE_ADDRESSES, "oops")]);
    provider.fetch().await.unwrap();
    assert_eq!(provider.addresses(), vec!["A", "D"]);

    source.answer("A", vec![item(keys::SETTINGS_SERVICE_ADDRESSES, "[]")]);
    provider.fetch().await.unwrap();
    assert_eq!(provider.addresses(), vec!["A", "D"]);
    provider.stop_refetch();
}

#[tokio::test]
async fn test_refetch_timer_uses_remote_interval() {
    let source = Arc::new(FakeSource::default());
    source.answer("A", vec![item(keys::SETTINGS_REFETCH_INTERVAL, "40")]);
    let (provider, _dir) =
        provider_with(json!({ "SETTINGS_SERVICE_ADDRESSES": ["A"] }), source.clone());

    assert_eq!(provider.refetch_interval(), Duration::from_millis(60_000));
    provider.fetch().await.unwrap();
    assert_eq!(provider.refetch_interval(), Duration::from_millis(40));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(source.calls().len() >= 3);

    provider.stop_refetch();
    assert!(!provider.has_refetch_timer());
    tokio::time::sleep(Duration::from_millis(20)).await;
    let stopped_at = source.calls().len();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(source.calls().len(), stopped_at);
}

#[tokio::test]
async fn test_changed_interval_rearms_running_timer() {
    let source = Arc::new(FakeSource::default());
    source.answer("A", vec![item(keys::SETTINGS_REFETCH_INTERVAL, "100000")]);
    let (provider, _dir) =
        provider_with(json!({ "SETTINGS_SERVICE_ADDRESSES": ["A"] }), source.clone());

    provider.fetch().await.unwrap();
    assert!(provider.has_refetch_timer());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(source.calls().len(), 1);

    // shortened by an explicit fetch
    source.answer("A", vec![item(keys::SETTINGS_REFETCH_INTERVAL, "30")]);
    provider.fetch().await.unwrap();
    assert_eq!(provider.refetch_interval(), Duration::from_millis(30));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(source.calls().len() >= 4);

    // lengthened again by a background refetch
    source.answer("A", vec![item(keys::SETTINGS_REFETCH_INTERVAL, "100000")]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(provider.refetch_interval(), Duration::from_millis(100_000));
    let settled = source.calls().len();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(source.calls().len(), settled);

    provider.stop_refetch();
}

#[tokio::test]
async fn test_typed_settings_from_remote() {
    let source = Arc::new(FakeSource::default());
    source.answer(
        "A",
        vec![
            item(keys::BROKER_HOST, "mq:5672"),
            item(keys::BROKER_RECONNECT_ATTEMPTS, "3"),
            item(keys::BROKER_MESSAGE_EXPIRY, "1000"),
            item(keys::BROKER_QUEUE, ""),
            item(keys::RPC_TIMEOUT, "0"),
            item("FLAG", "true"),
            item("RATIO", "0.5"),
            item("LIMITS", r#"{"max": 7}"#),
        ],
    );
    let (provider, _dir) =
        provider_with(json!({ "SETTINGS_SERVICE_ADDRESSES": ["A"] }), source.clone());

    assert_eq!(
        provider.rpc_timeout().unwrap(),
        Some(crate::rpc::mediate::DEFAULT_CALL_TIMEOUT)
    );
    provider.fetch().await.unwrap();

    let broker = provider.broker_settings().unwrap();
    assert_eq!(broker.host, "mq:5672");
    assert_eq!(broker.reconnect_attempts, 3);
    assert_eq!(broker.message_expiry, Some(1000));
    assert_eq!(broker.queue, None);
    assert_eq!(broker.exchange, "services");
    assert_eq!(provider.rpc_timeout().unwrap(), None);

    assert_eq!(provider.get_bool("FLAG").unwrap(), Some(true));
    assert_eq!(provider.get_number("RATIO").unwrap(), Some(0.5));
    assert_eq!(provider.get_bool("MISSING").unwrap(), None);

    #[derive(serde::Deserialize)]
    struct Limits {
        max: u32,
    }
    let limits: Limits = provider.get_json("LIMITS").unwrap().unwrap();
    assert_eq!(limits.max, 7);
    provider.stop_refetch();
}

#[tokio::test]
async fn test_malformed_value_fails_only_that_access() {
    let source = Arc::new(FakeSource::default());
    source.answer(
        "A",
        vec![
            item(keys::BROKER_RECONNECT_TIMEOUT, "soon"),
            item("NAME", "svc"),
        ],
    );
    let (provider, _dir) =
        provider_with(json!({ "SETTINGS_SERVICE_ADDRESSES": ["A"] }), source.clone());
    provider.fetch().await.unwrap();

    let err = provider.broker_settings().unwrap_err();
    assert!(matches!(err, Error::SettingParse { .. }));
    assert!(!err.is_critical());
    assert_eq!(provider.get_string("NAME").as_deref(), Some("svc"));
    provider.stop_refetch();
}

#[tokio::test]
#[serial]
async fn test_layered_lookup_order() {
    const KEY: &str = "SVCLINK_TEST_LAYERED";
    let source = Arc::new(FakeSource::default());
    source.answer("A", vec![item(KEY, "remote")]);
    let (provider, _dir) = provider_with(
        json!({ "SETTINGS_SERVICE_ADDRESSES": ["A"], KEY: "file" }),
        source.clone(),
    );

    assert_eq!(provider.get_string(KEY).as_deref(), Some("file"));
    provider.fetch().await.unwrap();
    assert_eq!(provider.get_string(KEY).as_deref(), Some("remote"));

    source.answer("A", vec![]);
    provider.fetch().await.unwrap();
    temp_env::with_var(KEY, Some("env"), || {
        assert_eq!(provider.get_string(KEY).as_deref(), Some("env"));
    });
    temp_env::with_var_unset(KEY, || {
        assert_eq!(provider.get_string(KEY).as_deref(), Some("file"));
    });
    provider.stop_refetch();
}

#[test]
#[serial]
fn test_env_file_feeds_environment_layer() {
    const KEY: &str = "SVCLINK_TEST_DOTENV";
    let dir = tempdir().unwrap();
    let env_file = dir.path().join(".env");
    std::fs::write(&env_file, format!("{KEY}=from-dotenv\n")).unwrap();

    temp_env::with_var_unset(KEY, || {
        let provider = ConfigurationProvider::init(ProviderOptions {
            env_file: Some(env_file.clone()),
            ..ProviderOptions::default()
        });
        assert_eq!(provider.get_string(KEY).as_deref(), Some("from-dotenv"));
    });
}

#[tokio::test]
async fn test_fetch_from_settings_service() {
    let dir = tempdir().unwrap();
    let served = write_settings(
        &dir,
        "served.json",
        json!({"GREETING": "hello", "RETRIES": 3, "ENABLED": true}),
    );
    let app = settings_router("settings", &served).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let local = write_settings(
        &dir,
        "local.json",
        json!({
            "SETTINGS_SERVICE_ADDRESSES": ["127.0.0.1:1", addr.clone()],
            "SETTINGS_SERVICE_NAME": "settings",
        }),
    );
    let provider = ConfigurationProvider::init(ProviderOptions {
        file: Some(local),
        service_name: Some("orders".to_string()),
        ..ProviderOptions::default()
    });

    assert!(provider.fetch().await.unwrap());
    assert_eq!(provider.addresses()[0], addr);
    assert_eq!(provider.get_string("GREETING").as_deref(), Some("hello"));
    assert_eq!(provider.get_u64("RETRIES").unwrap(), Some(3));
    assert_eq!(provider.get_bool("ENABLED").unwrap(), Some(true));
    provider.stop_refetch();
}
