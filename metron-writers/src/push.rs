//! Push (notification) writer.
//!
//! Notifications are low-volume and latest-wins: each batch collapses to
//! one message per collector, controlled by the `do_push` and `message`
//! keys of the collector's writer overlay. Writers of this class default
//! to `write_interval: 0` (flush on enqueue).

use std::time::Duration;

use async_trait::async_trait;
use metron_common::{ConfigError, Value, config::ComponentConfig};
use tracing::{debug, info};

use crate::{Envelope, WriteError, WriterBackend};

const HEALTHCHECK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct PushWriter {
    id: String,
    app_token: String,
    user_token: String,
    host: String,
    path: String,
    client: reqwest::Client,
}

impl PushWriter {
    pub fn from_config(config: &ComponentConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ConfigError::component(config.id(), e.to_string()))?;
        Ok(Self {
            id: config.id().to_string(),
            app_token: config.str_value("app_token")?,
            user_token: config.str_value("user_token")?,
            host: config.str_or("host", "api.pushover.net")?,
            path: config.str_or("path", "/1/messages.json")?,
            client,
        })
    }

    /// Groups the batch per collector, preserving first-seen collector
    /// order; within a group the newest item wins.
    fn last_per_collector(batch: &[Envelope]) -> Vec<&Envelope> {
        let mut order: Vec<&str> = Vec::new();
        for envelope in batch {
            if !order.contains(&envelope.collector_id.as_str()) {
                order.push(&envelope.collector_id);
            }
        }
        order
            .into_iter()
            .filter_map(|collector_id| {
                batch
                    .iter()
                    .rev()
                    .find(|envelope| envelope.collector_id == collector_id)
            })
            .collect()
    }
}

#[async_trait]
impl WriterBackend for PushWriter {
    async fn healthcheck(&self) -> Result<(), WriteError> {
        let address = format!("{}:443", self.host);
        let connect = tokio::net::TcpStream::connect(&address);
        match tokio::time::timeout(HEALTHCHECK_TIMEOUT, connect).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(WriteError::healthcheck(format!(
                "cannot connect to the push host {}: {e}",
                self.host
            ))),
            Err(_) => Err(WriteError::healthcheck(format!(
                "cannot connect to the push host {} within {} seconds",
                self.host,
                HEALTHCHECK_TIMEOUT.as_secs()
            ))),
        }
    }

    async fn do_write(&self, batch: &[Envelope]) -> Result<(), WriteError> {
        for envelope in Self::last_per_collector(batch) {
            let collector = &envelope.collector_id;
            let overlay = envelope.writer_config.as_map();

            let do_push = overlay
                .and_then(|m| m.get("do_push"))
                .is_some_and(Value::truthy);
            if !do_push {
                debug!(
                    name = %self.id,
                    "{collector}: the message will not be sent, do_push evaluated to false"
                );
                continue;
            }

            let Some(message) = overlay
                .and_then(|m| m.get("message"))
                .and_then(Value::as_str)
            else {
                return Err(WriteError::other(format!(
                    "{collector}: the writer overlay has no 'message' string"
                )));
            };

            info!(name = %self.id, "{collector}: sending the message '{message}'");
            let response = self
                .client
                .post(format!("https://{}{}", self.host, self.path))
                .form(&[
                    ("token", self.app_token.as_str()),
                    ("user", self.user_token.as_str()),
                    ("message", message),
                ])
                .send()
                .await
                .map_err(|e| {
                    WriteError::healthcheck(format!("sending the message failed: {e}"))
                })?;
            if !response.status().is_success() {
                return Err(WriteError::other(format!(
                    "sending the message failed, status-code={}",
                    response.status().as_u16()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use metron_common::value_map;

    use super::*;

    fn envelope(collector: &str, n: i64) -> Envelope {
        Envelope::new(
            collector,
            Value::Map(value_map! {"n" => Value::Int(n), "time" => Value::Int(n)}),
            Value::Map(value_map! {"do_push" => Value::Bool(true)}),
        )
    }

    #[test]
    fn newest_item_per_collector_wins() {
        let batch = vec![
            envelope("a", 1),
            envelope("b", 2),
            envelope("a", 3),
            envelope("a", 4),
        ];
        let last = PushWriter::last_per_collector(&batch);
        assert_eq!(last.len(), 2);
        assert_eq!(last[0].collector_id, "a");
        assert_eq!(
            last[0].data.as_map().unwrap().get("n"),
            Some(&Value::Int(4))
        );
        assert_eq!(last[1].collector_id, "b");
    }
}
