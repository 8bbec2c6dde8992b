//! Writers: sinks with a bounded in-memory queue, a batching worker, a
//! periodic health check and a durable on-disk backlog providing
//! at-least-once delivery.

pub mod backlog;
pub mod influxdb;
pub mod push;
pub mod writer;

use async_trait::async_trait;
use metron_common::Value;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use backlog::Backlog;
pub use writer::Writer;

/// One queued measurement: the producing collector, the data point, and
/// the collector's per-writer overlay evaluated at enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub collector_id: String,
    pub data: Value,
    pub writer_config: Value,
}

impl Envelope {
    pub fn new(collector_id: impl Into<String>, data: Value, writer_config: Value) -> Self {
        Self {
            collector_id: collector_id.into(),
            data,
            writer_config,
        }
    }
}

/// Errors raised by a writer backend.
#[derive(Debug, Error)]
pub enum WriteError {
    /// The sink cannot be reached; the writer flips unhealthy and the
    /// batch goes to the backlog.
    #[error("healthcheck failed: {0}")]
    HealthCheck(String),

    /// The batch is unacceptable (malformed, rejected); it is dropped
    /// with an error log and the writer stays healthy.
    #[error("{0}")]
    Other(String),
}

impl WriteError {
    pub fn healthcheck(message: impl Into<String>) -> Self {
        Self::HealthCheck(message.into())
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

/// A writer sink implementation.
///
/// This is the extensibility seam for new writer kinds: implement the
/// probe and the bulk send, and register a factory for the `class` name.
/// Queueing, batching, health gating and the backlog are provided by
/// [`Writer`].
#[async_trait]
pub trait WriterBackend: Send + Sync + 'static {
    /// Synchronous probe of the sink; an error means "unreachable".
    async fn healthcheck(&self) -> Result<(), WriteError>;

    /// Sends one batch. The batch never exceeds the writer's
    /// `batch_size`.
    async fn do_write(&self, batch: &[Envelope]) -> Result<(), WriteError>;
}
