//! The writer worker: queueing, batching, health gating and backlog
//! replay around a [`WriterBackend`].

use std::{
    collections::VecDeque,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use metron_common::{
    Component, ConfigError, Signal, Value, WorkerComponent, config::ComponentConfig, wait_shutdown,
};
use tokio::{sync::Notify, sync::broadcast, task::JoinHandle};
use tracing::{debug, error, info};

use crate::{Backlog, Envelope, WriteError, WriterBackend};

pub const DEFAULT_WRITE_INTERVAL_SECS: i64 = 10;
pub const DEFAULT_HEALTHCHECK_INTERVAL_SECS: i64 = 20;
pub const DEFAULT_BATCH_SIZE: i64 = 100;
pub const DEFAULT_MAX_QUEUE_SIZE: i64 = 10_000;

/// Floor applied when `write_interval` is zero so a hot enqueue loop
/// cannot busy-spin the worker.
const ZERO_INTERVAL_FLOOR: Duration = Duration::from_millis(10);

/// Tunables shared by every writer kind.
#[derive(Debug, Clone, Copy)]
pub struct WriterSettings {
    pub write_interval: Duration,
    pub healthcheck_interval: Duration,
    pub batch_size: usize,
    pub max_queue_size: usize,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            write_interval: Duration::from_secs(DEFAULT_WRITE_INTERVAL_SECS.unsigned_abs()),
            healthcheck_interval: Duration::from_secs(
                DEFAULT_HEALTHCHECK_INTERVAL_SECS.unsigned_abs(),
            ),
            batch_size: usize::try_from(DEFAULT_BATCH_SIZE).expect("fits"),
            max_queue_size: usize::try_from(DEFAULT_MAX_QUEUE_SIZE).expect("fits"),
        }
    }
}

impl WriterSettings {
    /// Reads the tunables from a component configuration, falling back to
    /// the given defaults for absent keys.
    pub fn from_config(config: &ComponentConfig, defaults: Self) -> Result<Self, ConfigError> {
        let seconds = |v: i64| Duration::from_secs(v.max(0).unsigned_abs());
        let count = |path: &str, v: i64, minimum: usize| -> Result<usize, ConfigError> {
            usize::try_from(v)
                .ok()
                .filter(|v| *v >= minimum)
                .ok_or_else(|| {
                    ConfigError::invalid(
                        format!("{}.{path}", config.id()),
                        format!("must be at least {minimum}"),
                    )
                })
        };
        Ok(Self {
            write_interval: seconds(config.int_or(
                "write_interval",
                i64::try_from(defaults.write_interval.as_secs()).unwrap_or(i64::MAX),
            )?),
            healthcheck_interval: seconds(config.int_or(
                "healthcheck_interval",
                i64::try_from(defaults.healthcheck_interval.as_secs()).unwrap_or(i64::MAX),
            )?),
            batch_size: count(
                "batch_size",
                config.int_or(
                    "batch_size",
                    i64::try_from(defaults.batch_size).unwrap_or(DEFAULT_BATCH_SIZE),
                )?,
                1,
            )?,
            max_queue_size: count(
                "max_queue_size",
                config.int_or(
                    "max_queue_size",
                    i64::try_from(defaults.max_queue_size).unwrap_or(DEFAULT_MAX_QUEUE_SIZE),
                )?,
                1,
            )?,
        })
    }
}

/// A writer: the non-blocking enqueue surface handed to collectors and
/// the worker that batches, health-checks and delivers.
pub struct Writer {
    id: String,
    backend: Arc<dyn WriterBackend>,
    settings: WriterSettings,
    queue: Mutex<VecDeque<Envelope>>,
    notify: Notify,
    healthy: AtomicBool,
    last_check: Mutex<Option<Instant>>,
    backlog: Backlog,
    test: bool,
}

impl Writer {
    pub fn new(
        id: impl Into<String>,
        backend: Arc<dyn WriterBackend>,
        settings: WriterSettings,
        data_dir: &Path,
        test: bool,
    ) -> Result<Self, ConfigError> {
        let id = id.into();
        let backlog = Backlog::open(data_dir, &id, test).map_err(|source| ConfigError::Io {
            path: data_dir.join("backlog").join(&id),
            source,
        })?;
        Ok(Self {
            id,
            backend,
            settings,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            healthy: AtomicBool::new(false),
            last_check: Mutex::new(None),
            backlog,
            test,
        })
    }

    pub fn settings(&self) -> &WriterSettings {
        &self.settings
    }

    pub fn backlog(&self) -> &Backlog {
        &self.backlog
    }

    pub fn queue_size(&self) -> usize {
        self.queue.lock().expect("queue lock poisoned").len()
    }

    /// Non-blocking write called from collectors. While the writer is
    /// unhealthy (or the queue is full) the envelope spills straight to
    /// the backlog; nothing here ever blocks or probes the sink.
    pub fn write(&self, collector_id: &str, data: Value, writer_config: Value) {
        let envelope = Envelope::new(collector_id, data, writer_config);
        if !self.healthy.load(Ordering::Acquire) {
            self.backlog.put(std::slice::from_ref(&envelope));
            return;
        }

        let overflow = {
            let mut queue = self.queue.lock().expect("queue lock poisoned");
            if queue.len() >= self.settings.max_queue_size {
                true
            } else {
                queue.push_back(envelope.clone());
                false
            }
        };
        if overflow {
            error!(
                name = %self.id,
                "the queue is full ({} items), spilling to the backlog",
                self.settings.max_queue_size
            );
            self.backlog.put(std::slice::from_ref(&envelope));
            return;
        }
        if self.settings.write_interval.is_zero() {
            self.notify.notify_one();
        }
    }

    /// The cached health state, refreshed by a probe once it is older
    /// than `healthcheck_interval`.
    pub async fn is_healthy(&self) -> bool {
        let due = {
            let mut last_check = self.last_check.lock().expect("health lock poisoned");
            let due = last_check
                .is_none_or(|at| at.elapsed() > self.settings.healthcheck_interval);
            if due {
                *last_check = Some(Instant::now());
            }
            due
        };

        if due {
            let was_healthy = self.healthy.load(Ordering::Acquire);
            match self.backend.healthcheck().await {
                Ok(()) => {
                    self.healthy.store(true, Ordering::Release);
                    if was_healthy {
                        debug!(name = %self.id, "the healthcheck succeeded");
                    } else {
                        info!(name = %self.id, "the healthcheck succeeded");
                    }
                }
                Err(e) => {
                    self.healthy.store(false, Ordering::Release);
                    error!(name = %self.id, "the healthcheck failed on {e}");
                    info!(
                        name = %self.id,
                        "the backlog size is {}", self.backlog.size()
                    );
                }
            }
        }
        self.healthy.load(Ordering::Acquire)
    }

    fn drain_batch(&self) -> Vec<Envelope> {
        let mut queue = self.queue.lock().expect("queue lock poisoned");
        let take = queue.len().min(self.settings.batch_size);
        queue.drain(..take).collect()
    }

    /// Drains one batch from the queue and hands it to the backend.
    async fn process_queue(&self) {
        if !self.is_healthy().await {
            return;
        }
        let batch = self.drain_batch();
        if batch.is_empty() {
            return;
        }
        info!(
            name = %self.id,
            "writing the batch, batch-size={}, queue-size={}",
            batch.len(),
            self.queue_size()
        );
        if self.test {
            info!(
                name = %self.id,
                "running in test mode, the writing operation is disabled"
            );
            return;
        }
        match self.backend.do_write(&batch).await {
            Ok(()) => {}
            Err(WriteError::HealthCheck(e)) => {
                error!(
                    name = %self.id,
                    "cannot write the batch due to writer's problem: {e}; \
                     the batch will be stored in the backlog"
                );
                self.healthy.store(false, Ordering::Release);
                self.backlog.put(&batch);
            }
            Err(WriteError::Other(e)) => {
                error!(
                    name = %self.id,
                    "cannot write the batch, it will be discarded due to the following error: {e}"
                );
            }
        }
    }

    /// Replays the backlog, one batch's worth of the oldest files per
    /// iteration, until it is empty or a send fails. Runs only while
    /// healthy, strictly after the in-memory queue was drained for this
    /// tick: fresh data takes priority, the backlog catches up
    /// opportunistically.
    async fn process_backlog(&self) {
        if self.backlog.size() == 0 {
            return;
        }
        info!(
            name = %self.id,
            "there are {} files in the backlog, writing items in batches of {}",
            self.backlog.size(),
            self.settings.batch_size
        );
        while self.backlog.size() > 0 {
            // one batch's worth of files per iteration; the chunking
            // below only splits a file that is itself oversized
            let (files, items) = self.backlog.peek(self.settings.batch_size);
            if files.is_empty() {
                break;
            }
            if self.test {
                info!(
                    name = %self.id,
                    "running in test mode, writing of backlog files is disabled \
                     (the backlog will be removed from memory only)"
                );
            } else {
                let mut failed = None;
                for chunk in items.chunks(self.settings.batch_size) {
                    if let Err(e) = self.backend.do_write(chunk).await {
                        failed = Some(e);
                        break;
                    }
                }
                if let Some(e) = failed {
                    error!(
                        name = %self.id,
                        "cannot write items from the writer's backlog due to: {e}"
                    );
                    self.healthy.store(false, Ordering::Release);
                    break;
                }
            }
            self.backlog.remove(&files);
        }
        info!(
            name = %self.id,
            "the processing of the backlog finished, the backlog size is {}",
            self.backlog.size()
        );
    }

    async fn serve(self: Arc<Self>, mut shutdown: broadcast::Receiver<Signal>) {
        loop {
            // write_interval 0 means "flush on enqueue", with a small
            // floor tick so health probes and backlog replay still run
            let stop = if self.settings.write_interval.is_zero() {
                tokio::select! {
                    received = shutdown.recv() => !matches!(
                        received,
                        Err(broadcast::error::RecvError::Lagged(_))
                    ),
                    () = self.notify.notified() => false,
                    () = tokio::time::sleep(ZERO_INTERVAL_FLOOR) => false,
                }
            } else {
                wait_shutdown(&mut shutdown, self.settings.write_interval).await
            };
            if stop {
                break;
            }
            self.process_queue().await;
            if self.is_healthy().await {
                self.process_backlog().await;
            }
        }

        // one final drain; whatever cannot be sent spills to the backlog
        info!(name = %self.id, "ending the writer worker");
        self.process_queue().await;
        let remainder: Vec<Envelope> = {
            let mut queue = self.queue.lock().expect("queue lock poisoned");
            queue.drain(..).collect()
        };
        if !remainder.is_empty() {
            info!(
                name = %self.id,
                "there are {} unprocessed items in the queue of the writer, \
                 writing them all to the backlog",
                remainder.len()
            );
            self.backlog.put(&remainder);
        }
        info!(name = %self.id, "the writer worker ended");
    }
}

impl Component for Writer {
    fn id(&self) -> &str {
        &self.id
    }
}

impl WorkerComponent for Writer {
    fn start(self: Arc<Self>, shutdown: broadcast::Receiver<Signal>) -> JoinHandle<()> {
        info!(name = %self.id, "starting the writer worker");
        tokio::spawn(self.serve(shutdown))
    }
}
