//! The dynamic configuration tree.
//!
//! Configuration values are a tagged tree: plain scalars, compiled
//! expressions (`!py`), and nested sequences/mappings of either.
//! [`ConfigValue::deep_eval`] walks the tree and replaces every
//! expression leaf with its evaluated value, preserving container order.

use serde_yaml::Value as Yaml;
use tracing::error;

use super::env::EnvTable;
use crate::{
    error::{ConfigError, ExprError},
    expr::Expr,
    scope::Scope,
    value::{Value, ValueMap},
};

#[derive(Debug, Clone)]
pub enum ConfigValue {
    Scalar(Value),
    Expr(Expr),
    Seq(Vec<ConfigValue>),
    Map(Vec<(String, ConfigValue)>),
}

impl ConfigValue {
    /// Converts a parsed YAML node, substituting `${VAR}` references and
    /// compiling `!py` leaves.
    pub fn from_yaml(node: &Yaml, env: &EnvTable) -> Result<Self, ConfigError> {
        match node {
            Yaml::Null => Ok(Self::Scalar(Value::Null)),
            Yaml::Bool(v) => Ok(Self::Scalar(Value::Bool(*v))),
            Yaml::Number(n) => Ok(Self::Scalar(n.as_i64().map_or_else(
                || Value::Float(n.as_f64().unwrap_or(f64::NAN)),
                Value::Int,
            ))),
            Yaml::String(text) => {
                let text = if EnvTable::references_variable(text) {
                    env.substitute(text)?
                } else {
                    text.clone()
                };
                Ok(Self::Scalar(Value::Str(text)))
            }
            Yaml::Sequence(items) => items
                .iter()
                .map(|item| Self::from_yaml(item, env))
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Seq),
            Yaml::Mapping(members) => {
                let mut entries = Vec::with_capacity(members.len());
                for (key, value) in members {
                    let key = key
                        .as_str()
                        .ok_or_else(|| {
                            ConfigError::invalid("<mapping>", "mapping keys must be strings")
                        })?
                        .to_string();
                    entries.push((key, Self::from_yaml(value, env)?));
                }
                Ok(Self::Map(entries))
            }
            Yaml::Tagged(tagged) => {
                let text = tagged.value.as_str().ok_or_else(|| {
                    ConfigError::invalid(tagged.tag.to_string(), "tagged values must be strings")
                })?;
                let text = env.substitute(text)?;
                if tagged.tag == "py" {
                    Expr::compile(&text)
                        .map(Self::Expr)
                        .map_err(|source| ConfigError::Expression {
                            source_text: text,
                            source,
                        })
                } else if tagged.tag == "env" {
                    Ok(Self::Scalar(Value::Str(text)))
                } else {
                    Err(ConfigError::invalid(
                        tagged.tag.to_string(),
                        "unknown tag (expected !py or !env)",
                    ))
                }
            }
        }
    }

    /// Looks up a dotted path of mapping keys.
    pub fn get(&self, path: &str) -> Option<&Self> {
        let mut node = self;
        for key in path.split('.') {
            match node {
                Self::Map(entries) => {
                    node = entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)?;
                }
                _ => return None,
            }
        }
        Some(node)
    }

    pub fn as_map(&self) -> Option<&[(String, Self)]> {
        match self {
            Self::Map(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&[Self]> {
        match self {
            Self::Seq(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Scalar(Value::Str(text)) => Some(text),
            _ => None,
        }
    }

    /// Evaluates the tree against the scope; expression failures surface
    /// as errors.
    pub fn deep_eval_strict(&self, scope: &Scope) -> Result<Value, ExprError> {
        match self {
            Self::Scalar(v) => Ok(v.clone()),
            Self::Expr(expr) => expr.eval(scope),
            Self::Seq(items) => items
                .iter()
                .map(|item| item.deep_eval_strict(scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Seq),
            Self::Map(entries) => {
                let mut map = ValueMap::new();
                for (key, value) in entries {
                    map.insert(key.clone(), value.deep_eval_strict(scope)?);
                }
                Ok(Value::Map(map))
            }
        }
    }

    /// Evaluates the tree against the scope; a failing expression leaf is
    /// logged at ERROR and becomes `null`, leaving the rest of the tree
    /// intact.
    pub fn deep_eval(&self, scope: &Scope) -> Value {
        match self {
            Self::Scalar(v) => v.clone(),
            Self::Expr(expr) => expr.eval(scope).unwrap_or_else(|e| {
                error!(name = "eval", "cannot evaluate \"{}\": {e}", expr.source());
                Value::Null
            }),
            Self::Seq(items) => Value::Seq(items.iter().map(|item| item.deep_eval(scope)).collect()),
            Self::Map(entries) => {
                let mut map = ValueMap::new();
                for (key, value) in entries {
                    map.insert(key.clone(), value.deep_eval(scope));
                }
                Value::Map(map)
            }
        }
    }
}

/// Deep-merges `overlay` into `base`: mappings merge key-wise and
/// recursively, anything else is replaced by the overlay.
pub(super) fn deep_merge(base: Yaml, overlay: Yaml) -> Yaml {
    match (base, overlay) {
        (Yaml::Mapping(mut base), Yaml::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.remove(&key) {
                    Some(existing) => {
                        base.insert(key, deep_merge(existing, value));
                    }
                    None => {
                        base.insert(key, value);
                    }
                }
            }
            Yaml::Mapping(base)
        }
        (_, overlay) => overlay,
    }
}
