//! WebSocket event provider.
//!
//! Connects to a broker-style WebSocket endpoint, subscribes to the
//! declared topics, and publishes every incoming frame to the matching
//! event. The connection runs a DISCONNECTED → CONNECTING → CONNECTED
//! state machine with a fixed reconnect backoff; subscriptions are
//! re-issued on every successful connect.

use std::{sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use metron_common::{
    Component, ConfigError, Signal, Value, WorkerComponent, config::ComponentConfig, wait_shutdown,
};
use serde::Deserialize;
use tokio::{net::TcpStream, sync::broadcast, task::JoinHandle};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, error, info};

use crate::{EventProviderCore, Provider, ProviderError};

const DEFAULT_RECONNECT_AFTER_SECS: i64 = 30;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// The payload shape expected on the wire: a topic id and an arbitrary
/// JSON document.
#[derive(Debug, Deserialize)]
struct Frame {
    topic: String,
    data: serde_json::Value,
}

pub struct WebSocketProvider {
    id: String,
    url: String,
    reconnect_after: Duration,
    core: EventProviderCore,
}

impl WebSocketProvider {
    pub fn from_config(config: &ComponentConfig) -> Result<Self, ConfigError> {
        let ids = config
            .raw("events")
            .and_then(metron_common::config::ConfigValue::as_seq)
            .ok_or_else(|| {
                ConfigError::invalid(
                    format!("{}.events", config.id()),
                    "must be a list of topic ids",
                )
            })?
            .iter()
            .map(|item| {
                item.as_str().map(String::from).ok_or_else(|| {
                    ConfigError::invalid(
                        format!("{}.events", config.id()),
                        "topic ids must be strings",
                    )
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let core = EventProviderCore::new(ids)
            .map_err(|message| ConfigError::component(config.id(), message))?;
        Ok(Self {
            id: config.id().to_string(),
            url: config.str_value("url")?,
            reconnect_after: Duration::from_secs(
                config
                    .int_or("reconnect_after", DEFAULT_RECONNECT_AFTER_SECS)?
                    .max(0)
                    .unsigned_abs(),
            ),
            core,
        })
    }

    async fn connect_and_subscribe(&self) -> Result<WsStream, ProviderError> {
        let (mut stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        for id in self.core.ids() {
            info!(name = %self.id, "subscribing to the topic {id}");
            let frame = serde_json::json!({"op": "subscribe", "topic": id});
            stream
                .send(Message::Text(frame.to_string()))
                .await
                .map_err(|e| ProviderError::Transport(e.to_string()))?;
        }
        Ok(stream)
    }

    fn handle_text(&self, text: &str) {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                error!(name = %self.id, "cannot decode the incoming frame: {e}");
                return;
            }
        };
        let Some(event) = self.core.select_one(&self.id, &frame.topic) else {
            debug!(name = %self.id, "no event matches the topic {}", frame.topic);
            return;
        };
        let data = Value::from(frame.data);
        if data.as_map().is_none() {
            error!(
                name = %self.id,
                "the payload for topic {} is not a mapping", frame.topic
            );
            return;
        }
        event.publish(data);
    }

    /// Reads frames until the connection drops or shutdown fires.
    /// Returns `true` when the worker should exit.
    async fn read_loop(
        &self,
        stream: &mut WsStream,
        shutdown: &mut broadcast::Receiver<Signal>,
    ) -> bool {
        loop {
            tokio::select! {
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text),
                    Some(Ok(Message::Ping(payload))) => {
                        if stream.send(Message::Pong(payload)).await.is_err() {
                            return false;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(name = %self.id, "disconnected from the broker");
                        return false;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(name = %self.id, "error in the broker loop: {e}");
                        return false;
                    }
                },
                received = shutdown.recv() => {
                    if !matches!(received, Err(broadcast::error::RecvError::Lagged(_))) {
                        let _ = stream.close(None).await;
                        return true;
                    }
                }
            }
        }
    }

    async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<Signal>) {
        let mut state = ConnectionState::Disconnected;
        loop {
            debug!(name = %self.id, "connection state {state:?} -> Connecting");
            state = ConnectionState::Connecting;
            let mut stream = match self.connect_and_subscribe().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(
                        name = %self.id,
                        "cannot connect to the broker at {}: {e}; will reconnect in {} seconds",
                        self.url,
                        self.reconnect_after.as_secs()
                    );
                    if wait_shutdown(&mut shutdown, self.reconnect_after).await {
                        break;
                    }
                    continue;
                }
            };

            debug!(name = %self.id, "connection state {state:?} -> Connected");
            state = ConnectionState::Connected;
            info!(name = %self.id, "connected to the broker at {}", self.url);

            if self.read_loop(&mut stream, &mut shutdown).await {
                break;
            }

            debug!(name = %self.id, "connection state {state:?} -> Disconnected");
            state = ConnectionState::Disconnected;
            if wait_shutdown(&mut shutdown, self.reconnect_after).await {
                break;
            }
        }
    }
}

impl Component for WebSocketProvider {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Provider for WebSocketProvider {
    fn call(&self, op: &str, _args: &[Value]) -> Result<Value, ProviderError> {
        Err(ProviderError::data(format!("unknown operation '{op}'")))
    }

    fn operations(&self) -> &'static [&'static str] {
        &[]
    }

    fn attr_value(&self, name: &str) -> Option<Value> {
        match name {
            "events" => Some(self.core.snapshot()),
            _ => None,
        }
    }

    fn events(&self) -> Option<&EventProviderCore> {
        Some(&self.core)
    }
}

impl WorkerComponent for WebSocketProvider {
    fn start(self: Arc<Self>, shutdown: broadcast::Receiver<Signal>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
