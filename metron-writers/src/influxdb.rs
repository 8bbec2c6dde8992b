//! InfluxDB writer: line-protocol over the v1 HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use metron_common::{ConfigError, Value, config::ComponentConfig};
use tracing::{error, warn};

use crate::{Envelope, WriteError, WriterBackend};

const NANOS_PER_SECOND: i64 = 1_000_000_000;

pub struct InfluxDbWriter {
    id: String,
    url: String,
    dbname: String,
    user: String,
    password: String,
    client: reqwest::Client,
}

impl InfluxDbWriter {
    pub fn from_config(config: &ComponentConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ConfigError::component(config.id(), e.to_string()))?;
        Ok(Self {
            id: config.id().to_string(),
            url: config
                .str_value("url")?
                .trim_end_matches('/')
                .to_string(),
            dbname: config.str_value("dbname")?,
            user: config.str_or("user", "")?,
            password: config.str_or("password", "")?,
            client,
        })
    }

    /// Renders one envelope as a line-protocol line, or `None` when the
    /// point is unusable.
    fn line(&self, envelope: &Envelope) -> Option<String> {
        let overlay = envelope.writer_config.as_map();
        let data = envelope.data.as_map();

        let measurement = overlay
            .and_then(|m| m.get("measurement"))
            .and_then(Value::as_str)
            .unwrap_or(&envelope.collector_id);

        let time = data
            .and_then(|m| m.get("time"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        if time <= 0 {
            error!(
                name = %self.id,
                "cannot write the data point of '{}' due to a missing time field",
                envelope.collector_id
            );
            return None;
        }

        let mut tags: Vec<(String, String)> = Vec::new();
        let mut fields: Vec<(String, String)> = Vec::new();
        if let Some(declared) = overlay.and_then(|m| m.get("tags")).and_then(Value::as_map) {
            for (key, value) in declared.iter() {
                tags.push((key.clone(), value.to_string()));
            }
        }
        if let Some(declared) = overlay.and_then(|m| m.get("fields")).and_then(Value::as_map) {
            for (key, value) in declared.iter() {
                fields.push((key.clone(), field_value(value)));
            }
        }

        // nothing declared: numeric data members become fields, the rest
        // become tags
        if tags.is_empty() && fields.is_empty() {
            if let Some(data) = data {
                for (key, value) in data.iter() {
                    if key == "time" {
                        continue;
                    }
                    if value.is_number() {
                        fields.push((key.clone(), field_value(value)));
                    } else {
                        tags.push((key.clone(), value.to_string()));
                    }
                }
            }
        }

        if fields.is_empty() {
            warn!(
                name = %self.id,
                "there are no fields in the data point of '{}'",
                envelope.collector_id
            );
            return None;
        }

        let mut line = escape_measurement(measurement);
        for (key, value) in &tags {
            line.push(',');
            line.push_str(&escape_tag(key));
            line.push('=');
            line.push_str(&escape_tag(value));
        }
        line.push(' ');
        for (index, (key, value)) in fields.iter().enumerate() {
            if index > 0 {
                line.push(',');
            }
            line.push_str(&escape_tag(key));
            line.push('=');
            line.push_str(value);
        }
        line.push(' ');
        line.push_str(&(time * NANOS_PER_SECOND).to_string());
        Some(line)
    }
}

fn escape_measurement(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace(' ', "\\ ")
}

fn escape_tag(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

fn field_value(value: &Value) -> String {
    match value {
        Value::Int(v) => format!("{v}i"),
        Value::Float(v) => v.to_string(),
        Value::Bool(v) => v.to_string(),
        other => format!("\"{}\"", other.to_string().replace('"', "\\\"")),
    }
}

#[async_trait]
impl WriterBackend for InfluxDbWriter {
    async fn healthcheck(&self) -> Result<(), WriteError> {
        let response = self
            .client
            .get(format!("{}/ping", self.url))
            .send()
            .await
            .map_err(|e| WriteError::healthcheck(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(WriteError::healthcheck(format!(
                "ping returned status-code={}",
                response.status().as_u16()
            )))
        }
    }

    async fn do_write(&self, batch: &[Envelope]) -> Result<(), WriteError> {
        let lines: Vec<String> = batch
            .iter()
            .filter_map(|envelope| self.line(envelope))
            .collect();
        if lines.is_empty() {
            return Ok(());
        }

        let mut request = self
            .client
            .post(format!("{}/write", self.url))
            .query(&[("db", self.dbname.as_str())])
            .body(lines.join("\n"));
        if !self.user.is_empty() {
            request = request.basic_auth(&self.user, Some(&self.password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| WriteError::healthcheck(format!("writing the points failed: {e}")))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_client_error() {
            Err(WriteError::other(format!(
                "the database rejected the points, status-code={}",
                status.as_u16()
            )))
        } else {
            Err(WriteError::healthcheck(format!(
                "writing the points failed, status-code={}",
                status.as_u16()
            )))
        }
    }
}
