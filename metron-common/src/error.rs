//! Error types shared across the workspace.

use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors raised while loading or validating the configuration. All of
/// these reject at startup; none of them occur at runtime.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration file {file}: {source}")]
    Yaml {
        file: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("the environment variable {0} does not exist")]
    EnvVar(String),

    #[error("invalid variable name '{name}' in {file}")]
    EnvFile { file: PathBuf, name: String },

    #[error("cannot compile expression \"{source_text}\": {source}")]
    Expression {
        source_text: String,
        #[source]
        source: ExprError,
    },

    #[error("the property '{0}' does not exist")]
    Missing(String),

    #[error("invalid value for '{path}': {message}")]
    Invalid { path: String, message: String },

    #[error("cannot load component '{id}': {message}")]
    Component { id: String, message: String },
}

impl ConfigError {
    pub fn invalid(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn component(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Component {
            id: id.into(),
            message: message.into(),
        }
    }
}

/// Errors raised while compiling or evaluating an expression.
#[derive(Debug, Error)]
pub enum ExprError {
    #[error("parse error at offset {pos}: {message}")]
    Parse { pos: usize, message: String },

    #[error("name '{0}' is not defined")]
    Name(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("{0}")]
    Call(String),
}

impl ExprError {
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::Type(message.into())
    }

    pub fn call(message: impl Into<String>) -> Self {
        Self::Call(message.into())
    }
}
