//! The collector base: writer binding, data shaping and the history ring.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, OnceLock},
};

use metron_common::{
    ConfigError, Scope, ScopeObject, ScopeValue, Value, ValueMap,
    config::{ComponentConfig, ConfigValue},
    expr::Expr,
    now_seconds,
};
use metron_writers::Writer;
use tracing::{info, warn};

use crate::CollectError;

const DEFAULT_MAX_HISTORY: i64 = 120;

/// The `data` section of a collector: either a mapping of fields (each
/// possibly an expression) or a single expression producing a mapping or
/// a list of mappings.
#[derive(Debug, Clone)]
enum DataDef {
    Tree(ConfigValue),
    Expr(Expr),
}

/// One entry of the collector's `writers:` list: the target writer id,
/// the raw overlay evaluated per data point, and the writer itself once
/// the registry resolved it.
struct WriterBinding {
    writer_id: String,
    overlay: ConfigValue,
    writer: OnceLock<Arc<Writer>>,
}

/// State and behavior shared by every collector kind.
pub struct CollectorCore {
    id: String,
    data_def: DataDef,
    bindings: Vec<WriterBinding>,
    max_history: usize,
    history: Mutex<VecDeque<Value>>,
    base: OnceLock<Arc<HashMap<String, ScopeValue>>>,
}

impl CollectorCore {
    pub fn from_config(config: &ComponentConfig) -> Result<Self, ConfigError> {
        let data_def = match config.raw("data") {
            Some(tree @ ConfigValue::Map(_)) => DataDef::Tree(tree.clone()),
            Some(ConfigValue::Expr(expr)) => DataDef::Expr(expr.clone()),
            Some(_) => {
                return Err(ConfigError::invalid(
                    format!("{}.data", config.id()),
                    "must be a mapping or an expression",
                ));
            }
            None => return Err(ConfigError::Missing(format!("{}.data", config.id()))),
        };

        let mut bindings = Vec::new();
        if let Some(entries) = config.raw("writers") {
            let entries = entries.as_seq().ok_or_else(|| {
                ConfigError::invalid(format!("{}.writers", config.id()), "must be a list")
            })?;
            for entry in entries {
                let members = entry.as_map().ok_or_else(|| {
                    ConfigError::invalid(
                        format!("{}.writers", config.id()),
                        "entries must be mappings",
                    )
                })?;
                let writer_id = members
                    .iter()
                    .find(|(key, _)| key == "writer_id")
                    .and_then(|(_, value)| value.as_str())
                    .ok_or_else(|| {
                        ConfigError::invalid(
                            format!("{}.writers", config.id()),
                            "entries must declare a 'writer_id' string",
                        )
                    })?;
                let overlay = ConfigValue::Map(
                    members
                        .iter()
                        .filter(|(key, _)| key != "writer_id")
                        .cloned()
                        .collect(),
                );
                bindings.push(WriterBinding {
                    writer_id: writer_id.to_string(),
                    overlay,
                    writer: OnceLock::new(),
                });
            }
        }

        let max_history = config.int_or("max_history", DEFAULT_MAX_HISTORY)?;
        Ok(Self {
            id: config.id().to_string(),
            data_def,
            bindings,
            max_history: usize::try_from(max_history).unwrap_or(0),
            history: Mutex::new(VecDeque::new()),
            base: OnceLock::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Installs the shared base scope once the registry is built.
    pub fn set_base_scope(&self, base: Arc<HashMap<String, ScopeValue>>) {
        let _ = self.base.set(base);
    }

    /// Resolves the writer bindings against the registry. Unknown ids are
    /// logged here and silently skipped at dispatch.
    pub fn resolve_writers(&self, lookup: &dyn Fn(&str) -> Option<Arc<Writer>>) {
        for binding in &self.bindings {
            match lookup(&binding.writer_id) {
                Some(writer) => {
                    let _ = binding.writer.set(writer);
                }
                None => {
                    warn!(
                        name = %self.id,
                        "the writer '{}' does not exist", binding.writer_id
                    );
                }
            }
        }
    }

    pub fn writer_ids(&self) -> impl Iterator<Item = &str> {
        self.bindings.iter().map(|b| b.writer_id.as_str())
    }

    fn base_scope(&self) -> Scope {
        self.base
            .get()
            .map_or_else(Scope::default, |base| Scope::new(Arc::clone(base)))
    }

    fn scope_with_overlay(&self, event: Option<&Value>) -> Scope {
        let scope = self.base_scope();
        match event {
            Some(event) => scope.with("event", event.clone()),
            None => scope,
        }
    }

    /// Shapes the configured `data` into a list of timestamped points.
    ///
    /// A point missing `time` takes the event's timestamp when shaping
    /// runs under an `event` overlay, the wall clock otherwise. Shaped
    /// points are appended to the history ring.
    pub fn prepare_data(&self, event: Option<&Value>) -> Result<Vec<Value>, CollectError> {
        let scope = self.scope_with_overlay(event);
        let shaped = match &self.data_def {
            DataDef::Tree(tree) => tree.deep_eval(&scope),
            DataDef::Expr(expr) => expr.eval(&scope)?,
        };

        let default_time = event
            .and_then(Value::as_map)
            .and_then(|m| m.get("time"))
            .and_then(Value::as_i64)
            .filter(|time| *time > 0)
            .unwrap_or_else(now_seconds);

        let mut points = Vec::new();
        match shaped {
            Value::Map(point) => points.push(with_time(point, default_time)),
            Value::Seq(items) => {
                for item in items {
                    match item {
                        Value::Map(point) => points.push(with_time(point, default_time)),
                        other => {
                            return Err(CollectError::data(format!(
                                "every data item must be a mapping, got {}",
                                other.type_name()
                            )));
                        }
                    }
                }
            }
            other => {
                return Err(CollectError::data(format!(
                    "the data must be a mapping or a list, got {}",
                    other.type_name()
                )));
            }
        }

        if self.max_history > 0 {
            let mut history = self.history.lock().expect("history lock poisoned");
            history.extend(points.iter().cloned());
            while history.len() > self.max_history {
                history.pop_front();
            }
        }
        Ok(points)
    }

    /// Dispatches the points to every resolved writer, evaluating the
    /// per-writer overlay against `base ∪ {data: point}` (plus the event
    /// overlay when present) for each point.
    pub fn write(&self, points: &[Value], event: Option<&Value>) {
        for binding in &self.bindings {
            let Some(writer) = binding.writer.get() else {
                continue;
            };
            for point in points {
                let scope = self
                    .scope_with_overlay(event)
                    .with("data", point.clone());
                let overlay = binding.overlay.deep_eval(&scope);
                writer.write(&self.id, point.clone(), overlay);
            }
        }
    }

    /// Runs one full collection: shape, then dispatch. Failures are
    /// logged and swallowed so worker loops always continue.
    pub fn collect(&self, event: Option<&Value>) {
        match self.prepare_data(event) {
            Ok(points) => self.write(&points, event),
            Err(e) => {
                tracing::error!(name = %self.id, "the job failed due to {e}");
            }
        }
    }

    pub fn history(&self) -> Vec<Value> {
        let history = self.history.lock().expect("history lock poisoned");
        history.iter().cloned().collect()
    }

    pub(crate) fn log_start(&self, what: &str) {
        info!(name = %self.id, "starting the {what} worker");
    }
}

fn with_time(mut point: ValueMap, default_time: i64) -> Value {
    match point.get("time") {
        Some(Value::Int(_)) => {}
        // fractional timestamps truncate to whole seconds
        Some(Value::Float(seconds)) => {
            let seconds = *seconds;
            point.insert("time", Value::Int(seconds as i64));
        }
        _ => point.insert("time", Value::Int(default_time)),
    }
    Value::Map(point)
}

impl metron_common::Component for CollectorCore {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Collectors are visible to expressions through their `history`.
impl ScopeObject for CollectorCore {
    fn attr(&self, name: &str) -> Option<ScopeValue> {
        match name {
            "history" => Some(ScopeValue::Value(Value::Seq(self.history()))),
            "id" => Some(ScopeValue::Value(Value::Str(self.id.clone()))),
            _ => None,
        }
    }
}

#[allow(dead_code)]
fn _assert_traits() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<CollectorCore>();
}

#[cfg(test)]
mod tests {
    use metron_common::{config::EnvTable, value_map};

    use super::*;

    pub(crate) fn component(yaml: &str) -> ComponentConfig {
        let node: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        let tree = ConfigValue::from_yaml(&node, &EnvTable::default()).unwrap();
        ComponentConfig::new("c1".to_string(), tree)
    }

    #[test]
    fn mapping_data_shapes_one_point_with_time() {
        let core = CollectorCore::from_config(&component("data:\n  x: 1\n  y: 2\n")).unwrap();
        let points = core.prepare_data(None).unwrap();
        assert_eq!(points.len(), 1);
        let point = points[0].as_map().unwrap();
        assert_eq!(point.get("x"), Some(&Value::Int(1)));
        assert_eq!(point.get("y"), Some(&Value::Int(2)));
        assert!(matches!(point.get("time"), Some(Value::Int(t)) if *t > 0));
    }

    #[test]
    fn expression_list_items_must_be_mappings() {
        let core = CollectorCore::from_config(&component("data: !py [1, 2]\n")).unwrap();
        let err = core.prepare_data(None).unwrap_err();
        assert!(matches!(err, CollectError::Data(_)));
    }

    #[test]
    fn event_overlay_supplies_data_and_time() {
        let core =
            CollectorCore::from_config(&component("data: !py event.data\n")).unwrap();
        let event = Value::Map(value_map! {
            "id" => Value::Str("sensors/room1/temp".into()),
            "time" => Value::Int(1_700_000_000),
            "data" => Value::Map(value_map! {"value" => Value::Float(21.5)}),
        });
        let points = core.prepare_data(Some(&event)).unwrap();
        assert_eq!(points.len(), 1);
        let point = points[0].as_map().unwrap();
        assert_eq!(point.get("value"), Some(&Value::Float(21.5)));
        // the event timestamp wins over the wall clock
        assert_eq!(point.get("time"), Some(&Value::Int(1_700_000_000)));
    }

    #[test]
    fn scalar_data_is_an_error_and_missing_data_rejected() {
        let core = CollectorCore::from_config(&component("data: !py 1 + 1\n")).unwrap();
        assert!(core.prepare_data(None).is_err());
        assert!(CollectorCore::from_config(&component("schedule: x\n")).is_err());
    }

    #[test]
    fn history_ring_is_bounded() {
        let core = CollectorCore::from_config(&component(
            "data:\n  x: 1\nmax_history: 3\n",
        ))
        .unwrap();
        for _ in 0..5 {
            core.prepare_data(None).unwrap();
        }
        assert_eq!(core.history().len(), 3);
    }

    #[test]
    fn existing_time_is_preserved() {
        let core = CollectorCore::from_config(&component("data:\n  time: 42\n  x: 1\n")).unwrap();
        let points = core.prepare_data(None).unwrap();
        assert_eq!(
            points[0].as_map().unwrap().get("time"),
            Some(&Value::Int(42))
        );
    }
}
