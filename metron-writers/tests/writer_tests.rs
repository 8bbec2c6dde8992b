#![allow(clippy::unwrap_used)]

//! End-to-end scenarios for the writer worker: health gating, backlog
//! growth and replay, batch bounds and graceful shutdown.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use metron_common::{Signal, Value, WorkerComponent, value_map};
use metron_writers::{
    Envelope, WriteError, Writer, WriterBackend,
    writer::WriterSettings,
};
use tokio::sync::broadcast;

/// A scripted sink: fails the first `health_failures` probes and the
/// first `write_failures` sends, records everything else.
#[derive(Default)]
struct MockBackend {
    health_failures: AtomicU32,
    write_failures: AtomicU32,
    batches: Mutex<Vec<Vec<Envelope>>>,
}

impl MockBackend {
    fn with_health_failures(failures: u32) -> Self {
        Self {
            health_failures: AtomicU32::new(failures),
            ..Self::default()
        }
    }

    fn batches(&self) -> Vec<Vec<Envelope>> {
        self.batches.lock().unwrap().clone()
    }

    fn items(&self) -> Vec<Envelope> {
        self.batches().into_iter().flatten().collect()
    }
}

#[async_trait]
impl WriterBackend for MockBackend {
    async fn healthcheck(&self) -> Result<(), WriteError> {
        let remaining = self.health_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.health_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(WriteError::healthcheck("scripted probe failure"));
        }
        Ok(())
    }

    async fn do_write(&self, batch: &[Envelope]) -> Result<(), WriteError> {
        let remaining = self.write_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.write_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(WriteError::healthcheck("scripted write failure"));
        }
        self.batches.lock().unwrap().push(batch.to_vec());
        Ok(())
    }
}

fn settings(write_interval: Duration, batch_size: usize) -> WriterSettings {
    WriterSettings {
        write_interval,
        healthcheck_interval: Duration::ZERO,
        batch_size,
        max_queue_size: 10_000,
    }
}

fn point(n: i64) -> Value {
    Value::Map(value_map! {"n" => Value::Int(n), "time" => Value::Int(1_700_000_000 + n)})
}

fn overlay() -> Value {
    Value::Map(value_map! {})
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
async fn healthy_writer_delivers_in_order_with_bounded_batches() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MockBackend::default());
    let writer = Arc::new(
        Writer::new(
            "w",
            backend.clone(),
            settings(Duration::from_millis(20), 10),
            dir.path(),
            false,
        )
        .unwrap(),
    );
    assert!(writer.is_healthy().await);

    for n in 0..35 {
        writer.write("c1", point(n), overlay());
    }

    let (shutdown, _keep) = broadcast::channel(8);
    let handle = writer.clone().start(shutdown.subscribe());

    assert!(wait_until(|| backend.items().len() == 35, Duration::from_secs(5)).await);

    // batch bound and ordering
    for batch in backend.batches() {
        assert!(batch.len() <= 10);
    }
    let ns: Vec<i64> = backend
        .items()
        .iter()
        .map(|e| e.data.as_map().unwrap().get("n").unwrap().as_i64().unwrap())
        .collect();
    assert_eq!(ns, (0..35).collect::<Vec<_>>());
    assert_eq!(writer.backlog().size(), 0);

    shutdown.send(Signal::Shutdown).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn unhealthy_writer_spills_to_backlog_and_never_sends() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MockBackend::with_health_failures(u32::MAX));
    let writer = Arc::new(
        Writer::new(
            "w",
            backend.clone(),
            settings(Duration::from_millis(20), 10),
            dir.path(),
            false,
        )
        .unwrap(),
    );
    assert!(!writer.is_healthy().await);

    let before = writer.backlog().size();
    for n in 0..5 {
        writer.write("c1", point(n), overlay());
        // backlog file count grows monotonically while unhealthy
        assert_eq!(writer.backlog().size(), before + usize::try_from(n).unwrap() + 1);
    }

    let (shutdown, _keep) = broadcast::channel(8);
    let handle = writer.clone().start(shutdown.subscribe());
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(backend.batches().is_empty());
    assert_eq!(writer.backlog().size(), 5);

    shutdown.send(Signal::Shutdown).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn backlog_replays_in_order_after_recovery() {
    let dir = tempfile::tempdir().unwrap();
    // the first 3 probes fail, then the sink recovers
    let backend = Arc::new(MockBackend::with_health_failures(3));
    let writer = Arc::new(
        Writer::new(
            "w",
            backend.clone(),
            settings(Duration::from_millis(20), 100),
            dir.path(),
            false,
        )
        .unwrap(),
    );

    // unhealthy: everything spills to the backlog
    assert!(!writer.is_healthy().await);
    for n in 0..250 {
        writer.write("c1", point(n), overlay());
    }
    assert_eq!(writer.backlog().size(), 250);

    let (shutdown, _keep) = broadcast::channel(8);
    let handle = writer.clone().start(shutdown.subscribe());

    assert!(wait_until(|| backend.items().len() == 250, Duration::from_secs(10)).await);
    assert_eq!(writer.backlog().size(), 0);

    // delivered in enqueue order, every batch within the bound
    for batch in backend.batches() {
        assert!(batch.len() <= 100);
    }
    let ns: Vec<i64> = backend
        .items()
        .iter()
        .map(|e| e.data.as_map().unwrap().get("n").unwrap().as_i64().unwrap())
        .collect();
    assert_eq!(ns, (0..250).collect::<Vec<_>>());

    shutdown.send(Signal::Shutdown).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn failed_batch_flips_health_and_lands_in_backlog() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MockBackend::default());
    backend.write_failures.store(1, Ordering::SeqCst);
    let writer = Arc::new(
        Writer::new(
            "w",
            backend.clone(),
            settings(Duration::from_millis(20), 100),
            dir.path(),
            false,
        )
        .unwrap(),
    );
    assert!(writer.is_healthy().await);

    for n in 0..3 {
        writer.write("c1", point(n), overlay());
    }

    let (shutdown, _keep) = broadcast::channel(8);
    let handle = writer.clone().start(shutdown.subscribe());

    // the failed batch is preserved and re-delivered from the backlog
    // once the (immediately succeeding) probe recovers the writer
    assert!(wait_until(|| backend.items().len() == 3, Duration::from_secs(5)).await);
    assert_eq!(writer.backlog().size(), 0);

    shutdown.send(Signal::Shutdown).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn graceful_shutdown_drains_once_and_spills_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MockBackend::default());
    let writer = Arc::new(
        Writer::new(
            "w",
            backend.clone(),
            // a long interval: the loop only ever sees the shutdown signal
            settings(Duration::from_secs(3600), 100),
            dir.path(),
            false,
        )
        .unwrap(),
    );
    assert!(writer.is_healthy().await);

    for n in 0..150 {
        writer.write("c1", point(n), overlay());
    }

    let (shutdown, _keep) = broadcast::channel(8);
    let handle = writer.clone().start(shutdown.subscribe());
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.send(Signal::Shutdown).unwrap();

    // workers return promptly once signaled
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("the writer worker did not stop in time")
        .unwrap();

    // one final batch went out, the residue was spilled
    assert_eq!(backend.items().len(), 100);
    assert_eq!(writer.backlog().size(), 1);
    let (_, spilled) = writer.backlog().peek(10);
    assert_eq!(spilled.len(), 50);
}

#[tokio::test]
async fn zero_write_interval_flushes_on_enqueue() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MockBackend::default());
    let writer = Arc::new(
        Writer::new(
            "w",
            backend.clone(),
            settings(Duration::ZERO, 100),
            dir.path(),
            false,
        )
        .unwrap(),
    );
    assert!(writer.is_healthy().await);

    let (shutdown, _keep) = broadcast::channel(8);
    let handle = writer.clone().start(shutdown.subscribe());
    tokio::time::sleep(Duration::from_millis(50)).await;

    writer.write("c1", point(1), overlay());
    assert!(wait_until(|| backend.items().len() == 1, Duration::from_secs(5)).await);

    shutdown.send(Signal::Shutdown).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_mode_disables_delivery_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MockBackend::default());
    let writer = Arc::new(
        Writer::new(
            "w",
            backend.clone(),
            settings(Duration::from_millis(20), 10),
            dir.path(),
            true,
        )
        .unwrap(),
    );
    assert!(writer.is_healthy().await);

    for n in 0..5 {
        writer.write("c1", point(n), overlay());
    }

    let (shutdown, _keep) = broadcast::channel(8);
    let handle = writer.clone().start(shutdown.subscribe());
    tokio::time::sleep(Duration::from_millis(200)).await;

    // the queue drained but nothing was sent
    assert_eq!(writer.queue_size(), 0);
    assert!(backend.batches().is_empty());

    shutdown.send(Signal::Shutdown).unwrap();
    handle.await.unwrap();
}
