#![allow(clippy::unwrap_used)]

//! End-to-end collector scenarios: shaping to writer dispatch for the
//! cron path, and event fan-out through an event provider.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use metron_collectors::{CollectorCore, EventCollector};
use metron_common::{
    Component, Signal, Value, WorkerComponent,
    config::{ComponentConfig, ConfigValue, EnvTable},
    value_map,
};
use metron_providers::{EventProviderCore, Provider, ProviderError};
use metron_writers::{Envelope, WriteError, Writer, WriterBackend, writer::WriterSettings};
use tokio::sync::broadcast;

fn component(id: &str, yaml: &str) -> ComponentConfig {
    let node: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
    let tree = ConfigValue::from_yaml(&node, &EnvTable::default()).unwrap();
    ComponentConfig::new(id.to_string(), tree)
}

#[derive(Default)]
struct CaptureBackend {
    batches: Mutex<Vec<Vec<Envelope>>>,
}

impl CaptureBackend {
    fn items(&self) -> Vec<Envelope> {
        self.batches.lock().unwrap().clone().into_iter().flatten().collect()
    }
}

#[async_trait]
impl WriterBackend for CaptureBackend {
    async fn healthcheck(&self) -> Result<(), WriteError> {
        Ok(())
    }

    async fn do_write(&self, batch: &[Envelope]) -> Result<(), WriteError> {
        self.batches.lock().unwrap().push(batch.to_vec());
        Ok(())
    }
}

struct TestEventProvider {
    id: String,
    core: EventProviderCore,
}

impl Component for TestEventProvider {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Provider for TestEventProvider {
    fn call(&self, op: &str, _args: &[Value]) -> Result<Value, ProviderError> {
        Err(ProviderError::data(format!("unknown operation '{op}'")))
    }

    fn operations(&self) -> &'static [&'static str] {
        &[]
    }

    fn events(&self) -> Option<&EventProviderCore> {
        Some(&self.core)
    }
}

async fn capture_writer(
    dir: &std::path::Path,
) -> (Arc<Writer>, Arc<CaptureBackend>) {
    let backend = Arc::new(CaptureBackend::default());
    let writer = Arc::new(
        Writer::new(
            "w",
            backend.clone(),
            WriterSettings {
                write_interval: Duration::ZERO,
                healthcheck_interval: Duration::from_secs(3600),
                batch_size: 100,
                max_queue_size: 10_000,
            },
            dir,
            false,
        )
        .unwrap(),
    );
    assert!(writer.is_healthy().await);
    (writer, backend)
}

async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn shaped_points_reach_the_writer_with_overlay() {
    let dir = tempfile::tempdir().unwrap();
    let (writer, backend) = capture_writer(dir.path()).await;

    let core = Arc::new(
        CollectorCore::from_config(&component(
            "every-5s",
            concat!(
                "data:\n  x: 1\n  y: 2\n",
                "writers:\n",
                "  - writer_id: w\n",
                "    measurement: load\n",
                "    tags:\n      host: !py 'db' + '1'\n",
            ),
        ))
        .unwrap(),
    );
    let writer_for_lookup = writer.clone();
    core.resolve_writers(&move |id| (id == "w").then(|| writer_for_lookup.clone()));

    let (shutdown, _keep) = broadcast::channel(8);
    let handle = writer.clone().start(shutdown.subscribe());

    core.collect(None);

    assert!(wait_until(|| backend.items().len() == 1, Duration::from_secs(5)).await);
    let envelope = &backend.items()[0];
    assert_eq!(envelope.collector_id, "every-5s");
    let data = envelope.data.as_map().unwrap();
    assert_eq!(data.get("x"), Some(&Value::Int(1)));
    assert_eq!(data.get("y"), Some(&Value::Int(2)));
    assert!(matches!(data.get("time"), Some(Value::Int(t)) if *t > 0));
    // the overlay was evaluated at enqueue time
    let overlay = envelope.writer_config.as_map().unwrap();
    assert_eq!(overlay.get("measurement"), Some(&Value::Str("load".into())));
    assert_eq!(
        overlay
            .get("tags")
            .and_then(Value::as_map)
            .and_then(|m| m.get("host")),
        Some(&Value::Str("db1".into()))
    );

    shutdown.send(Signal::Shutdown).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn unknown_writers_are_skipped_at_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let (writer, backend) = capture_writer(dir.path()).await;

    let core = Arc::new(
        CollectorCore::from_config(&component(
            "c1",
            concat!(
                "data:\n  x: 1\n",
                "writers:\n",
                "  - writer_id: w\n",
                "  - writer_id: missing\n",
            ),
        ))
        .unwrap(),
    );
    let writer_for_lookup = writer.clone();
    core.resolve_writers(&move |id| (id == "w").then(|| writer_for_lookup.clone()));

    let (shutdown, _keep) = broadcast::channel(8);
    let handle = writer.clone().start(shutdown.subscribe());

    core.collect(None);

    assert!(wait_until(|| backend.items().len() == 1, Duration::from_secs(5)).await);

    shutdown.send(Signal::Shutdown).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn event_updates_flow_to_the_writer_with_the_event_timestamp() {
    let dir = tempfile::tempdir().unwrap();
    let (writer, backend) = capture_writer(dir.path()).await;

    let provider: Arc<dyn Provider> = Arc::new(TestEventProvider {
        id: "broker".to_string(),
        core: EventProviderCore::new(
            ["sensors/room1/temp", "sensors/room2/temp"]
                .into_iter()
                .map(String::from),
        )
        .unwrap(),
    });

    let core = Arc::new(
        CollectorCore::from_config(&component(
            "temps",
            concat!(
                "data: !py event.data\n",
                "writers:\n  - writer_id: w\n",
            ),
        ))
        .unwrap(),
    );
    let writer_for_lookup = writer.clone();
    core.resolve_writers(&move |id| (id == "w").then(|| writer_for_lookup.clone()));

    let collector = Arc::new(
        EventCollector::from_config(
            &component(
                "temps",
                concat!(
                    "data: !py event.data\n",
                    "source:\n",
                    "  - provider: broker\n",
                    "    events:\n      - sensors/.*\n",
                ),
            ),
            core,
        )
        .unwrap(),
    );
    let provider_for_lookup = provider.clone();
    collector.resolve_sources(&move |id| {
        (id == "broker").then(|| provider_for_lookup.clone())
    });

    let (shutdown, _keep) = broadcast::channel(8);
    let writer_handle = writer.clone().start(shutdown.subscribe());
    let collector_handle = collector.clone().start(shutdown.subscribe());
    tokio::time::sleep(Duration::from_millis(50)).await;

    let event = provider
        .events()
        .unwrap()
        .get("sensors/room1/temp")
        .unwrap()
        .clone();
    event.publish(Value::Map(value_map! {"value" => Value::Float(21.5)}));

    assert!(wait_until(|| backend.items().len() == 1, Duration::from_secs(5)).await);
    let envelope = &backend.items()[0];
    assert_eq!(envelope.collector_id, "temps");
    let data = envelope.data.as_map().unwrap();
    assert_eq!(data.get("value"), Some(&Value::Float(21.5)));
    // the point carries the event timestamp
    let expected_time = event
        .snapshot()
        .as_map()
        .unwrap()
        .get("time")
        .and_then(Value::as_i64)
        .unwrap();
    assert_eq!(data.get("time"), Some(&Value::Int(expected_time)));

    shutdown.send(Signal::Shutdown).unwrap();
    writer_handle.await.unwrap();
    collector_handle.await.unwrap();
}

#[tokio::test]
async fn collector_history_is_visible_to_expressions() {
    let core = Arc::new(
        CollectorCore::from_config(&component("c1", "data:\n  x: 1\nmax_history: 5\n")).unwrap(),
    );
    core.prepare_data(None).unwrap();
    core.prepare_data(None).unwrap();

    let mut base: HashMap<String, metron_common::ScopeValue> = HashMap::new();
    base.insert(
        "c1".to_string(),
        metron_common::ScopeValue::Object(core.clone()),
    );
    let scope = metron_common::Scope::new(Arc::new(base));

    let expr = metron_common::Expr::compile("c1.history[-1].x").unwrap();
    assert_eq!(expr.eval(&scope).unwrap(), Value::Int(1));
}
