//! The name→value table expressions are evaluated against.
//!
//! A scope is built right-biased from the runtime component registry, the
//! registered custom functions and an optional call-local overlay
//! (typically `{data}` or `{event}`).

use std::{collections::HashMap, fmt, sync::Arc};

use crate::{error::ExprError, value::Value};

/// A host function callable from expressions.
pub type ScopeFn = Arc<dyn Fn(&[Value]) -> Result<Value, ExprError> + Send + Sync>;

/// An entry in a scope: a plain value, a callable, or a component handle
/// exposing named operations and attributes.
#[derive(Clone)]
pub enum ScopeValue {
    Value(Value),
    Func(ScopeFn),
    Object(Arc<dyn ScopeObject>),
}

impl ScopeValue {
    pub fn func<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, ExprError> + Send + Sync + 'static,
    {
        Self::Func(Arc::new(f))
    }
}

impl fmt::Debug for ScopeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => write!(f, "Value({v:?})"),
            Self::Func(_) => write!(f, "Func(..)"),
            Self::Object(_) => write!(f, "Object(..)"),
        }
    }
}

impl From<Value> for ScopeValue {
    fn from(v: Value) -> Self {
        Self::Value(v)
    }
}

/// A component visible to expressions. Providers expose their operations
/// here; collectors expose `history`.
pub trait ScopeObject: Send + Sync {
    /// Resolves an attribute access (`object.name`). `None` means the
    /// attribute does not exist.
    fn attr(&self, name: &str) -> Option<ScopeValue>;
}

/// The evaluation scope: a shared base table plus a call-local overlay.
#[derive(Clone, Default)]
pub struct Scope {
    base: Arc<HashMap<String, ScopeValue>>,
    overlay: HashMap<String, ScopeValue>,
}

impl Scope {
    pub fn new(base: Arc<HashMap<String, ScopeValue>>) -> Self {
        Self {
            base,
            overlay: HashMap::new(),
        }
    }

    /// Adds an overlay entry; overlay entries shadow the base table.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, entry: impl Into<ScopeValue>) -> Self {
        self.overlay.insert(name.into(), entry.into());
        self
    }

    #[must_use]
    pub fn with_object(mut self, name: impl Into<String>, object: Arc<dyn ScopeObject>) -> Self {
        self.overlay.insert(name.into(), ScopeValue::Object(object));
        self
    }

    pub fn lookup(&self, name: &str) -> Option<ScopeValue> {
        self.overlay
            .get(name)
            .or_else(|| self.base.get(name))
            .cloned()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("base", &self.base.len())
            .field("overlay", &self.overlay.keys())
            .finish()
    }
}
