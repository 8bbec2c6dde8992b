//! Configuration loading.
//!
//! The configuration is YAML with two custom tags: `!env STRING`
//! substitutes `${VAR}` references from the environment table, and
//! `!py EXPR` compiles into an expression evaluated at collection time.
//! Files compose through `include:` lists (deep-merged, paths relative to
//! the including file) and per-kind `defaults` entries fill absent keys
//! on every component whose id matches their pattern.

mod env;
mod value;

use std::{
    fs,
    path::{Path, PathBuf},
};

use regex::Regex;
use serde_yaml::Value as Yaml;
use tracing::debug;

pub use env::EnvTable;
pub use value::ConfigValue;

use crate::{error::ConfigError, scope::Scope, value::Value};

pub const KIND_PROVIDERS: &str = "providers";
pub const KIND_COLLECTORS: &str = "collectors";
pub const KIND_WRITERS: &str = "writers";

/// The loaded agent configuration.
#[derive(Debug)]
pub struct Config {
    root: ConfigValue,
    pub config_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub data_dir: PathBuf,
    /// Test mode: delivery and backlog side effects are disabled.
    pub test: bool,
}

impl Config {
    /// Reads the configuration file, processing includes, environment
    /// substitution, expression compilation and defaults.
    pub fn load(file: &Path, env_file: Option<&Path>, test: bool) -> Result<Self, ConfigError> {
        let env = EnvTable::load(env_file)?;
        let file = file
            .canonicalize()
            .map_err(|source| ConfigError::Io {
                path: file.to_path_buf(),
                source,
            })?;
        let config_dir = file
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

        let merged = read_with_includes(&file)?;
        let mut root = ConfigValue::from_yaml(&merged, &env)?;
        for kind in [KIND_PROVIDERS, KIND_COLLECTORS, KIND_WRITERS] {
            apply_defaults(&mut root, kind)?;
        }

        let logs_dir = resolve_dir(&config_dir, &root, "directories.logs", "../logs");
        let data_dir = resolve_dir(&config_dir, &root, "directories.data", "../data");
        for dir in [&logs_dir, &data_dir] {
            fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                path: dir.clone(),
                source,
            })?;
        }

        Ok(Self {
            root,
            config_dir,
            logs_dir,
            data_dir,
            test,
        })
    }

    /// Builds a configuration from an already-parsed YAML string. Used by
    /// tests and embedders; directories resolve relative to `config_dir`.
    pub fn from_str_with_dirs(
        text: &str,
        config_dir: &Path,
        test: bool,
    ) -> Result<Self, ConfigError> {
        let yaml: Yaml = serde_yaml::from_str(text).map_err(|source| ConfigError::Yaml {
            file: PathBuf::from("<inline>"),
            source,
        })?;
        let env = EnvTable::load(None)?;
        let mut root = ConfigValue::from_yaml(&yaml, &env)?;
        for kind in [KIND_PROVIDERS, KIND_COLLECTORS, KIND_WRITERS] {
            apply_defaults(&mut root, kind)?;
        }
        let logs_dir = resolve_dir(config_dir, &root, "directories.logs", "logs");
        let data_dir = resolve_dir(config_dir, &root, "directories.data", "data");
        for dir in [&logs_dir, &data_dir] {
            fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(Self {
            root,
            config_dir: config_dir.to_path_buf(),
            logs_dir,
            data_dir,
            test,
        })
    }

    pub fn root(&self) -> &ConfigValue {
        &self.root
    }

    /// Resolves a possibly-relative path against the configuration
    /// directory.
    pub fn dir_path(&self, path: &str) -> PathBuf {
        resolve_path(&self.config_dir, path)
    }

    /// The configured components of one kind, in declaration order.
    pub fn components(&self, kind: &str) -> Vec<(String, ComponentConfig)> {
        let Some(entries) = self.root.get(kind).and_then(ConfigValue::as_map) else {
            return Vec::new();
        };
        entries
            .iter()
            .map(|(id, values)| {
                (
                    id.clone(),
                    ComponentConfig::new(id.clone(), values.clone()),
                )
            })
            .collect()
    }

    /// The declared custom-function table (`name -> path`).
    pub fn custom_functions(&self) -> Vec<(String, String)> {
        self.root
            .get("custom-functions")
            .and_then(ConfigValue::as_map)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|(name, value)| match value {
                        ConfigValue::Scalar(Value::Str(path)) => {
                            Some((name.clone(), path.clone()))
                        }
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn resolve_path(base: &Path, path: &str) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base.join(candidate)
    }
}

fn resolve_dir(config_dir: &Path, root: &ConfigValue, key: &str, default: &str) -> PathBuf {
    let configured = match root.get(key) {
        Some(ConfigValue::Scalar(Value::Str(path))) => path.clone(),
        _ => default.to_string(),
    };
    resolve_path(config_dir, &configured)
}

/// Reads a YAML file and splices every `include:` list it contains, at
/// any mapping level, by deep-merging the included files in place.
fn read_with_includes(file: &Path) -> Result<Yaml, ConfigError> {
    let text = fs::read_to_string(file).map_err(|source| ConfigError::Io {
        path: file.to_path_buf(),
        source,
    })?;
    let yaml: Yaml = serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
        file: file.to_path_buf(),
        source,
    })?;
    let base_dir = file
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    splice_includes(yaml, &base_dir)
}

fn splice_includes(node: Yaml, base_dir: &Path) -> Result<Yaml, ConfigError> {
    let Yaml::Mapping(members) = node else {
        return Ok(node);
    };

    let mut result = Yaml::Mapping(serde_yaml::Mapping::new());
    for (key, value) in members {
        if key.as_str() == Some("include") {
            let Yaml::Sequence(paths) = value else {
                return Err(ConfigError::invalid("include", "must be a list of paths"));
            };
            for path in paths {
                let Some(path) = path.as_str() else {
                    return Err(ConfigError::invalid("include", "must be a list of paths"));
                };
                let included = read_with_includes(&resolve_path(base_dir, path))?;
                debug!(name = "config", "including configuration from {path}");
                result = value::deep_merge(result, included);
            }
        } else {
            let spliced = splice_includes(value, base_dir)?;
            let mut single = serde_yaml::Mapping::new();
            single.insert(key, spliced);
            result = value::deep_merge(result, Yaml::Mapping(single));
        }
    }
    Ok(result)
}

/// Fills absent keys on every component of `kind` from each
/// `defaults.<kind>` entry whose pattern matches the component id.
/// Present keys are never overwritten.
fn apply_defaults(root: &mut ConfigValue, kind: &str) -> Result<(), ConfigError> {
    let defaults: Vec<(Regex, Vec<(String, ConfigValue)>)> = match root
        .get(&format!("defaults.{kind}"))
        .and_then(ConfigValue::as_seq)
    {
        Some(entries) => entries
            .iter()
            .map(|entry| {
                let map = entry.as_map().ok_or_else(|| {
                    ConfigError::invalid(format!("defaults.{kind}"), "entries must be mappings")
                })?;
                let pattern = map
                    .iter()
                    .find(|(k, _)| k == "pattern")
                    .and_then(|(_, v)| match v {
                        ConfigValue::Scalar(Value::Str(p)) => Some(p.as_str()),
                        _ => None,
                    })
                    .ok_or_else(|| {
                        ConfigError::invalid(
                            format!("defaults.{kind}"),
                            "entries must declare a 'pattern' string",
                        )
                    })?;
                let regex = Regex::new(pattern).map_err(|e| {
                    ConfigError::invalid(format!("defaults.{kind}.pattern"), e.to_string())
                })?;
                let overrides = map
                    .iter()
                    .filter(|(k, _)| k != "pattern")
                    .cloned()
                    .collect();
                Ok((regex, overrides))
            })
            .collect::<Result<_, ConfigError>>()?,
        None => return Ok(()),
    };

    if defaults.is_empty() {
        return Ok(());
    }

    let Some(ConfigValue::Map(components)) = root_get_mut(root, kind) else {
        return Ok(());
    };
    for (id, component) in components {
        let ConfigValue::Map(values) = component else {
            continue;
        };
        for (pattern, overrides) in &defaults {
            if !pattern.is_match(id) {
                continue;
            }
            for (key, value) in overrides {
                if !values.iter().any(|(k, _)| k == key) {
                    values.push((key.clone(), value.clone()));
                }
            }
        }
    }
    Ok(())
}

fn root_get_mut<'a>(root: &'a mut ConfigValue, key: &str) -> Option<&'a mut ConfigValue> {
    match root {
        ConfigValue::Map(entries) => entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v),
        _ => None,
    }
}

/// One component's configuration mapping with typed accessors.
#[derive(Debug, Clone)]
pub struct ComponentConfig {
    id: String,
    values: ConfigValue,
}

impl ComponentConfig {
    pub fn new(id: String, values: ConfigValue) -> Self {
        Self { id, values }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn raw(&self, path: &str) -> Option<&ConfigValue> {
        self.values.get(path)
    }

    pub fn class(&self) -> Result<String, ConfigError> {
        self.str_value("class")
    }

    pub fn enabled(&self) -> bool {
        self.bool_or("enabled", true).unwrap_or(true)
    }

    fn prop(&self, path: &str) -> String {
        format!("{}.{path}", self.id)
    }

    /// A scalar value; configuration-level expressions are evaluated
    /// against an empty scope extended by the caller-provided one.
    fn scalar(&self, path: &str, scope: &Scope) -> Result<Option<Value>, ConfigError> {
        match self.values.get(path) {
            None => Ok(None),
            Some(ConfigValue::Scalar(v)) => Ok(Some(v.clone())),
            Some(ConfigValue::Expr(expr)) => expr
                .eval(scope)
                .map(Some)
                .map_err(|e| ConfigError::invalid(self.prop(path), e.to_string())),
            Some(_) => Err(ConfigError::invalid(
                self.prop(path),
                "expected a scalar value",
            )),
        }
    }

    pub fn str_value(&self, path: &str) -> Result<String, ConfigError> {
        self.opt_str(path)?
            .ok_or_else(|| ConfigError::Missing(self.prop(path)))
    }

    pub fn opt_str(&self, path: &str) -> Result<Option<String>, ConfigError> {
        match self.scalar(path, &Scope::default())? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Str(v)) => Ok(Some(v)),
            Some(other) => Ok(Some(other.to_string())),
        }
    }

    pub fn str_or(&self, path: &str, default: &str) -> Result<String, ConfigError> {
        Ok(self.opt_str(path)?.unwrap_or_else(|| default.to_string()))
    }

    pub fn int_or(&self, path: &str, default: i64) -> Result<i64, ConfigError> {
        match self.scalar(path, &Scope::default())? {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Int(v)) => Ok(v),
            Some(other) => Err(ConfigError::invalid(
                self.prop(path),
                format!("expected an integer, got {}", other.type_name()),
            )),
        }
    }

    pub fn bool_or(&self, path: &str, default: bool) -> Result<bool, ConfigError> {
        match self.scalar(path, &Scope::default())? {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Bool(v)) => Ok(v),
            Some(other) => Err(ConfigError::invalid(
                self.prop(path),
                format!("expected a boolean, got {}", other.type_name()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_config_with_includes_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "writers.yaml",
            "writers:\n  w1:\n    class: influxdb\n    url: http://localhost:8086\n",
        );
        let main = write_file(
            dir.path(),
            "main.yaml",
            concat!(
                "directories:\n  logs: logs\n  data: data\n",
                "include:\n  - writers.yaml\n",
                "collectors:\n  c1:\n    class: cron\n    schedule: '* * * * *'\n",
            ),
        );

        let config = Config::load(&main, None, false).unwrap();
        assert!(config.logs_dir.is_dir());
        assert!(config.data_dir.is_dir());
        assert_eq!(config.components(KIND_WRITERS).len(), 1);
        assert_eq!(config.components(KIND_COLLECTORS).len(), 1);
        let (id, writer) = &config.components(KIND_WRITERS)[0];
        assert_eq!(id, "w1");
        assert_eq!(writer.class().unwrap(), "influxdb");
    }

    #[test]
    fn defaults_fill_absent_keys_only() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_str_with_dirs(
            concat!(
                "defaults:\n",
                "  writers:\n",
                "    - pattern: 'influx.*'\n",
                "      batch_size: 50\n",
                "      write_interval: 5\n",
                "writers:\n",
                "  influx-main:\n",
                "    class: influxdb\n",
                "    write_interval: 1\n",
                "  other:\n",
                "    class: push\n",
            ),
            dir.path(),
            false,
        )
        .unwrap();

        let components = config.components(KIND_WRITERS);
        let influx = &components[0].1;
        assert_eq!(influx.int_or("batch_size", 100).unwrap(), 50);
        // present keys are never overwritten
        assert_eq!(influx.int_or("write_interval", 10).unwrap(), 1);
        // non-matching ids are untouched
        let other = &components[1].1;
        assert_eq!(other.int_or("batch_size", 100).unwrap(), 100);
    }

    #[test]
    fn component_accessors() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_str_with_dirs(
            concat!(
                "providers:\n",
                "  web:\n",
                "    class: csv\n",
                "    url: http://example.org/data.csv\n",
                "    max_age: 30\n",
                "    enabled: false\n",
            ),
            dir.path(),
            false,
        )
        .unwrap();

        let (_, web) = &config.components(KIND_PROVIDERS)[0];
        assert_eq!(web.str_value("url").unwrap(), "http://example.org/data.csv");
        assert_eq!(web.int_or("max_age", 10).unwrap(), 30);
        assert!(!web.enabled());
        assert!(matches!(
            web.str_value("missing"),
            Err(ConfigError::Missing(prop)) if prop == "web.missing"
        ));
    }
}
