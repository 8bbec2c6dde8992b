//! Shared building blocks for the metron agent: the component model and
//! shutdown signal, the expression evaluator with its scope, the dynamic
//! configuration tree and the logging setup.

pub mod component;
pub mod config;
pub mod error;
pub mod expr;
pub mod logging;
pub mod scope;
pub mod value;

pub use component::{Component, Signal, WorkerComponent, wait_shutdown};
pub use error::{ConfigError, ExprError};
pub use expr::Expr;
pub use scope::{Scope, ScopeFn, ScopeObject, ScopeValue};
pub use value::{Value, ValueMap};

/// Unix wall-clock time in whole seconds.
pub fn now_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}
