//! Environment table: OS environment merged with an optional env file,
//! and `${VAR}` substitution for configuration strings.

use std::{collections::HashMap, fs, path::Path, sync::OnceLock};

use regex::Regex;

use crate::error::ConfigError;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("^[A-Z0-9_]+$").expect("valid pattern"))
}

fn param_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([A-Z0-9_]+)\}").expect("valid pattern"))
}

/// The consolidated variable table used for `${VAR}` substitution.
#[derive(Debug, Clone, Default)]
pub struct EnvTable {
    values: HashMap<String, String>,
}

impl EnvTable {
    /// Builds the table from the OS environment, overlaid with the
    /// entries of `env_file` when given. File entries win over the OS.
    pub fn load(env_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut values: HashMap<String, String> = std::env::vars().collect();

        if let Some(file) = env_file {
            let text = fs::read_to_string(file).map_err(|source| ConfigError::Io {
                path: file.to_path_buf(),
                source,
            })?;
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let (key, value) = line.split_once('=').unwrap_or((line, ""));
                let key = key.trim();
                if !name_pattern().is_match(key) {
                    return Err(ConfigError::EnvFile {
                        file: file.to_path_buf(),
                        name: key.to_string(),
                    });
                }
                let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
                values.insert(key.to_string(), value.to_string());
            }
        }

        Ok(Self { values })
    }

    #[cfg(test)]
    pub(crate) fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self {
            values: pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Replaces every `${VAR}` occurrence in `value`. A reference to an
    /// unknown variable is a configuration error.
    pub fn substitute(&self, value: &str) -> Result<String, ConfigError> {
        let mut result = String::with_capacity(value.len());
        let mut last = 0;
        for found in param_pattern().captures_iter(value) {
            let whole = found.get(0).expect("capture 0 always present");
            let name = &found[1];
            let replacement = self
                .get(name)
                .ok_or_else(|| ConfigError::EnvVar(name.to_string()))?;
            result.push_str(&value[last..whole.start()]);
            result.push_str(replacement);
            last = whole.end();
        }
        result.push_str(&value[last..]);
        Ok(result)
    }

    /// Whether the string references any `${VAR}` parameter.
    pub fn references_variable(value: &str) -> bool {
        param_pattern().is_match(value)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn parses_env_file_with_comments_and_quotes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# a comment").unwrap();
        writeln!(file, "DB_HOST=localhost").unwrap();
        writeln!(file, "DB_NAME='metrics'").unwrap();
        writeln!(file, "TOKEN=\"abc=def\"").unwrap();
        writeln!(file).unwrap();

        let env = EnvTable::load(Some(file.path())).unwrap();
        assert_eq!(env.get("DB_HOST"), Some("localhost"));
        assert_eq!(env.get("DB_NAME"), Some("metrics"));
        // values may themselves contain '='
        assert_eq!(env.get("TOKEN"), Some("abc=def"));
    }

    #[test]
    fn rejects_invalid_variable_names() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "lower_case=nope").unwrap();
        assert!(matches!(
            EnvTable::load(Some(file.path())),
            Err(ConfigError::EnvFile { .. })
        ));
    }

    #[test]
    fn substitutes_parameters() {
        let env = EnvTable::from_pairs(&[("HOST", "db1"), ("PORT", "8086")]);
        assert_eq!(
            env.substitute("http://${HOST}:${PORT}/write").unwrap(),
            "http://db1:8086/write"
        );
        assert!(matches!(
            env.substitute("${MISSING}"),
            Err(ConfigError::EnvVar(name)) if name == "MISSING"
        ));
        assert!(EnvTable::references_variable("x ${A} y"));
        assert!(!EnvTable::references_variable("plain"));
    }
}
