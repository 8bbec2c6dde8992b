//! Collectors: components that produce measurements on a schedule or in
//! reaction to events, shape them through the expression evaluator and
//! hand them to their configured writers.

pub mod collector;
pub mod cron;
pub mod event;

use thiserror::Error;

pub use collector::CollectorCore;
pub use cron::CronCollector;
pub use event::EventCollector;

/// Errors raised while shaping data points. These are per-tick failures:
/// the worker logs them and continues with the next tick or event.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("{0}")]
    Expression(#[from] metron_common::ExprError),

    #[error("{0}")]
    Data(String),
}

impl CollectError {
    pub fn data(message: impl Into<String>) -> Self {
        Self::Data(message.into())
    }
}
