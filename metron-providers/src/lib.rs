//! Data providers: long-lived components that acquire measurements from
//! external sources, either on demand (pull providers with a freshness
//! cache) or via subscription (event providers fanning updates out to
//! collectors).

pub mod csv;
pub mod event;
pub mod pull;
pub mod sql;
pub mod websocket;

use std::sync::Arc;

use metron_common::{Component, ExprError, Scope, ScopeObject, ScopeValue, Value};
use thiserror::Error;

pub use event::{Event, EventProviderCore, EventUpdate};
pub use pull::{DiffTracker, PullCache};

/// Errors raised by provider operations.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The remote resource does not exist (HTTP 404); permanent.
    #[error("the resource at {0} does not exist")]
    NotFound(String),

    /// The resource could not be retrieved within the retry budget.
    #[error("cannot retrieve the resource at {url} after {attempts} attempts")]
    CannotRetrieve { url: String, attempts: u32 },

    /// The peer could not be reached at all.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed payload, bad operation arguments, missing file; the item
    /// is dropped, the provider stays usable.
    #[error("{0}")]
    Data(String),

    #[error("database error: {0}")]
    Sql(#[from] rusqlite::Error),
}

impl ProviderError {
    pub fn data(message: impl Into<String>) -> Self {
        Self::Data(message.into())
    }
}

/// A provider visible to collectors and expressions.
///
/// This is the extensibility seam for new provider kinds: implement
/// [`Component`] plus `call` for the operations expressions may invoke,
/// and register a factory for the `class` name.
pub trait Provider: Component {
    /// Invokes a named operation (`field`, `sql`, `diff`, ...).
    fn call(&self, op: &str, args: &[Value]) -> Result<Value, ProviderError>;

    /// The operation names `call` accepts.
    fn operations(&self) -> &'static [&'static str];

    /// Resolves a non-operation attribute to a plain value.
    fn attr_value(&self, _name: &str) -> Option<Value> {
        None
    }

    /// The event table, for providers that own one.
    fn events(&self) -> Option<&EventProviderCore> {
        None
    }
}

/// Adapts a provider into the expression scope: operations become bound
/// functions, other attributes resolve through [`Provider::attr_value`].
pub struct ProviderScopeObject(pub Arc<dyn Provider>);

impl ScopeObject for ProviderScopeObject {
    fn attr(&self, name: &str) -> Option<ScopeValue> {
        if self.0.operations().contains(&name) {
            let provider = Arc::clone(&self.0);
            let op = name.to_string();
            return Some(ScopeValue::func(move |args| {
                provider.call(&op, args).map_err(|e| {
                    ExprError::call(format!("{}.{op}: {e}", provider.id()))
                })
            }));
        }
        self.0.attr_value(name).map(ScopeValue::Value)
    }
}

/// Registers a provider under its id in a scope overlay. Used by tests
/// and the runtime's registry construction.
pub fn scope_with_provider(scope: Scope, provider: Arc<dyn Provider>) -> Scope {
    let id = provider.id().to_string();
    scope.with_object(id, Arc::new(ProviderScopeObject(provider)))
}

pub(crate) fn arg_str<'a>(
    op: &str,
    args: &'a [Value],
    index: usize,
) -> Result<&'a str, ProviderError> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::data(format!("{op}: argument {index} must be a string")))
}

pub(crate) fn arg_i64(op: &str, args: &[Value], index: usize) -> Result<i64, ProviderError> {
    args.get(index)
        .and_then(Value::as_i64)
        .ok_or_else(|| ProviderError::data(format!("{op}: argument {index} must be an integer")))
}
