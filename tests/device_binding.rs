//! Parameter binding between devices, the cache and hardware.

use rust_ics::cache::{Cache, CacheEntry, CacheStore, LocalCache};
use rust_ics::clock;
use rust_ics::config::{DeviceConfig, Settings};
use rust_ics::context::{Context, Mode};
use rust_ics::device::{readable, Device, Readable, VirtualMotor, VirtualSensor};
use rust_ics::error::IcsError;
use serde_json::json;
use std::sync::Arc;
use tracing_test::traced_test;

fn context(store: &Arc<CacheStore>, mode: Mode) -> Arc<Context> {
    Context::builder(Arc::new(Settings::default()))
        .cache(Arc::new(LocalCache::new(Arc::clone(store))))
        .mode(mode)
        .build()
}

async fn seed(store: &Arc<CacheStore>, key: &str, value: serde_json::Value) {
    let cache = LocalCache::new(Arc::clone(store));
    cache.put(key, value, clock::now() - 10.0, None).await.unwrap();
}

fn sensor_config(center: f64) -> DeviceConfig {
    DeviceConfig::new(VirtualSensor::CLASS).with("center", center)
}

#[tokio::test]
async fn test_init_resolves_cache_and_config_conflicts() {
    let store = Arc::new(CacheStore::new());
    seed(&store, "s1/center", json!(7.0)).await;
    seed(&store, "s1/maxage", json!(30.0)).await;

    let ctx = context(&store, Mode::Master);
    let config = sensor_config(1.0).with("maxage", 5.0);
    let sensor = ctx.create_device_from("s1", &config).await.unwrap();
    let core = sensor.core();

    // runtime-tuned value survives, plain configuration wins
    assert_eq!(core.local("center"), Some(json!(7.0)));
    assert_eq!(core.local("maxage"), Some(json!(5.0)));
    assert_eq!(store.get("s1/maxage", 0.0).unwrap().value, json!(5.0));
}

#[tokio::test]
#[traced_test]
async fn test_conflict_is_logged() {
    let store = Arc::new(CacheStore::new());
    seed(&store, "s1/jitter", json!(0.5)).await;
    let ctx = context(&store, Mode::Master);
    let config = sensor_config(1.0).with("jitter", 0.0);
    ctx.create_device_from("s1", &config).await.unwrap();
    assert!(logs_contain("cached value differs from setup, using cached value"));
}

#[tokio::test]
async fn test_changed_configuration_beats_cache() {
    let store = Arc::new(CacheStore::new());
    seed(&store, "s1/center", json!(7.0)).await;
    seed(&store, "_lastconfig_/s1", json!({"center": 1.0})).await;

    let ctx = context(&store, Mode::Master);
    let sensor = ctx.create_device_from("s1", &sensor_config(2.0)).await.unwrap();
    assert_eq!(sensor.core().local("center"), Some(json!(2.0)));
    assert_eq!(store.get("s1/center", 0.0).unwrap().value, json!(2.0));
    assert_eq!(
        store.get("_lastconfig_/s1", 0.0).unwrap().value,
        json!({"center": 2.0})
    );
}

#[tokio::test]
async fn test_mandatory_parameter_from_cache_or_config() {
    let store = Arc::new(CacheStore::new());
    let ctx = context(&store, Mode::Master);
    let err = ctx
        .create_device_from("m1", &DeviceConfig::new(VirtualMotor::CLASS))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, IcsError::Configuration { .. }));
    assert!(err.to_string().contains("[m1]"));
    assert!(err.to_string().contains("abslimits"));
    assert!(ctx.device("m1").is_none());

    seed(&store, "m1/abslimits", json!([-5.0, 5.0])).await;
    let motor = ctx
        .create_device_from("m1", &DeviceConfig::new(VirtualMotor::CLASS))
        .await
        .unwrap();
    assert_eq!(motor.core().local("abslimits"), Some(json!([-5.0, 5.0])));
}

#[tokio::test]
async fn test_values_converge_across_processes() {
    let store = Arc::new(CacheStore::new());
    let daemon = context(&store, Mode::Master);
    let observer = context(&store, Mode::Slave);
    let writer = daemon.create_device_from("s1", &sensor_config(1.0)).await.unwrap();
    let reader = observer.create_device_from("s1", &sensor_config(1.0)).await.unwrap();

    writer.core().set_param("center", json!(3.0)).await.unwrap();
    assert_eq!(reader.core().param("center").await.unwrap(), json!(3.0));
}

#[tokio::test]
async fn test_set_depends_on_mode() {
    let store = Arc::new(CacheStore::new());
    let slave = context(&store, Mode::Slave);
    let sensor = slave.create_device_from("s1", &sensor_config(1.0)).await.unwrap();
    let err = sensor.core().set_param("center", json!(2.0)).await.unwrap_err();
    assert!(matches!(err, IcsError::Mode { .. }));

    let sim = context(&store, Mode::Simulation);
    let sensor = sim.create_device_from("s2", &sensor_config(1.0)).await.unwrap();
    let before = store.get("s2/center", 0.0).map(|e| e.value);
    sensor.core().set_param("center", json!(2.0)).await.unwrap();
    assert_eq!(sensor.core().local("center"), Some(json!(2.0)));
    assert_eq!(store.get("s2/center", 0.0).map(|e| e.value), before);
}

#[tokio::test]
async fn test_set_rejects_invalid_and_unknown_parameters() {
    let store = Arc::new(CacheStore::new());
    let ctx = context(&store, Mode::Master);
    let sensor = ctx.create_device_from("s1", &sensor_config(1.0)).await.unwrap();
    let err = sensor.core().set_param("jitter", json!(-1.0)).await.unwrap_err();
    assert!(matches!(err, IcsError::InvalidValue { .. }));
    let err = sensor.core().set_param("nonsense", json!(1)).await.unwrap_err();
    assert!(matches!(err, IcsError::Usage { .. }));
}

#[tokio::test]
async fn test_volatile_read_writes_cache_only_on_change() {
    let store = Arc::new(CacheStore::new());
    let ctx = context(&store, Mode::Master);
    let config = DeviceConfig::new(VirtualMotor::CLASS)
        .with("abslimits", json!([-10.0, 10.0]))
        .with("speed", 1.0);
    let motor = ctx.create_device_from("m1", &config).await.unwrap();
    let writes = |store: &CacheStore| store.history("m1/speed", 0.0, f64::MAX).len();
    let initial = writes(&store);

    assert_eq!(motor.core().param("speed").await.unwrap(), json!(1.0));
    assert_eq!(writes(&store), initial);

    motor.core().set_param("speed", json!(2.5)).await.unwrap();
    assert_eq!(writes(&store), initial + 1);
    assert_eq!(motor.core().param("speed").await.unwrap(), json!(2.5));
    assert_eq!(writes(&store), initial + 1);
}

#[tokio::test]
async fn test_volatile_read_corrects_foreign_cache_value() {
    let store = Arc::new(CacheStore::new());
    let ctx = context(&store, Mode::Master);
    let config = DeviceConfig::new(VirtualMotor::CLASS)
        .with("abslimits", json!([-10.0, 10.0]))
        .with("speed", 1.0);
    let motor = ctx.create_device_from("m1", &config).await.unwrap();

    // written behind the device's back; its local copy has not caught up yet
    store.put(CacheEntry::new("m1/speed", json!(4.0), clock::now(), None));
    assert_eq!(motor.core().param("speed").await.unwrap(), json!(1.0));
    assert_eq!(store.get("m1/speed", 0.0).unwrap().value, json!(1.0));
}

#[tokio::test]
async fn test_read_serves_cache_until_forced() {
    let store = Arc::new(CacheStore::new());
    let ctx = context(&store, Mode::Master);
    let sensor = ctx.create_device_from("s1", &sensor_config(1.0)).await.unwrap();
    let sensor = readable(&*sensor).unwrap();

    assert_eq!(sensor.read(None).await.unwrap(), json!(1.0));
    let cached = store.get("s1/value", 0.0).unwrap();
    assert_eq!(cached.ttl, Some(12.0));

    sensor.core().set_param("center", json!(2.0)).await.unwrap();
    assert_eq!(sensor.read(None).await.unwrap(), json!(1.0));
    assert_eq!(sensor.read(Some(0.0)).await.unwrap(), json!(2.0));
    assert_eq!(sensor.status(None).await.unwrap().to_string(), "OK");
}

#[tokio::test]
async fn test_history_with_relative_times() {
    let store = Arc::new(CacheStore::new());
    let ctx = context(&store, Mode::Master);
    let sensor = ctx.create_device_from("s1", &sensor_config(1.0)).await.unwrap();
    sensor.core().set_param("center", json!(2.0)).await.unwrap();
    sensor.core().set_param("center", json!(3.0)).await.unwrap();

    let history = sensor.core().history("center", Some(-1.0), None).await.unwrap();
    let values: Vec<_> = history.into_iter().map(|(_, v)| v).collect();
    assert_eq!(values, vec![json!(1.0), json!(2.0), json!(3.0)]);
}

#[tokio::test]
async fn test_device_lock_is_released_after_failure() {
    let store = Arc::new(CacheStore::new());
    let ctx = context(&store, Mode::Master);
    let sensor = ctx.create_device_from("s1", &sensor_config(1.0)).await.unwrap();
    let core = sensor.core();

    let result: Result<(), IcsError> = core
        .with_device_lock(1.0, || async { Err(IcsError::Script("boom".into())) })
        .await;
    assert!(result.is_err());
    assert_eq!(store.lock_holder("s1"), None);

    let other = LocalCache::new(Arc::clone(&store));
    other.lock("s1", 1.0).await.unwrap();
    let err = core
        .with_device_lock(0.2, || async { Ok(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, IcsError::LockTimeout { .. }));
}
