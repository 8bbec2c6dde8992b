//! The event collector: subscribes to provider events and shapes a data
//! point for every delivery.

use std::sync::{Arc, OnceLock};

use futures_util::StreamExt;
use metron_common::{
    Component, ConfigError, Signal, Value, WorkerComponent, config::ComponentConfig, value_map,
};
use metron_providers::{Event, EventUpdate, Provider};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use tracing::{error, info, warn};

use crate::CollectorCore;

/// One `source:` entry: an event provider and the topic patterns to
/// subscribe to.
#[derive(Debug, Clone)]
struct SourceConfig {
    provider: String,
    patterns: Vec<String>,
}

pub struct EventCollector {
    core: Arc<CollectorCore>,
    sources: Vec<SourceConfig>,
    events: OnceLock<Vec<Arc<Event>>>,
}

impl EventCollector {
    pub fn from_config(
        config: &ComponentConfig,
        core: Arc<CollectorCore>,
    ) -> Result<Self, ConfigError> {
        let invalid = || {
            ConfigError::invalid(
                format!("{}.source", config.id()),
                "must be a list of {provider, events} mappings",
            )
        };
        let entries = config
            .raw("source")
            .and_then(metron_common::config::ConfigValue::as_seq)
            .ok_or_else(invalid)?;

        let mut sources = Vec::new();
        for entry in entries {
            let members = entry.as_map().ok_or_else(invalid)?;
            let provider = members
                .iter()
                .find(|(key, _)| key == "provider")
                .and_then(|(_, value)| value.as_str())
                .ok_or_else(invalid)?
                .to_string();
            let patterns = members
                .iter()
                .find(|(key, _)| key == "events")
                .and_then(|(_, value)| value.as_seq())
                .ok_or_else(invalid)?
                .iter()
                .map(|item| item.as_str().map(String::from).ok_or_else(invalid))
                .collect::<Result<Vec<_>, _>>()?;
            sources.push(SourceConfig { provider, patterns });
        }
        Ok(Self {
            core,
            sources,
            events: OnceLock::new(),
        })
    }

    pub fn core(&self) -> &Arc<CollectorCore> {
        &self.core
    }

    /// Resolves the source patterns to events. Called by the runtime once
    /// providers exist; subscription itself happens at start.
    pub fn resolve_sources(&self, lookup: &dyn Fn(&str) -> Option<Arc<dyn Provider>>) {
        let mut events: Vec<Arc<Event>> = Vec::new();
        for source in &self.sources {
            let Some(provider) = lookup(&source.provider) else {
                warn!(
                    name = %self.core.id(),
                    "the event provider '{}' does not exist", source.provider
                );
                continue;
            };
            let Some(table) = provider.events() else {
                warn!(
                    name = %self.core.id(),
                    "the provider '{}' has no events", source.provider
                );
                continue;
            };
            let patterns: Vec<&str> = source.patterns.iter().map(String::as_str).collect();
            for event in table.select(self.core.id(), &patterns, false) {
                if !events.iter().any(|e| e.id() == event.id()) {
                    events.push(event);
                }
            }
        }
        if !events.is_empty() {
            info!(
                name = %self.core.id(),
                "the event sources are: {}",
                events
                    .iter()
                    .map(|e| Event::id(e))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        let _ = self.events.set(events);
    }

    async fn handle(&self, update: EventUpdate) {
        let overlay = Value::Map(value_map! {
            "id" => Value::Str(update.id),
            "time" => Value::Int(update.time),
            "data" => update.data,
        });
        let core = Arc::clone(&self.core);
        // shaping may call into blocking providers
        let shaped = tokio::task::spawn_blocking(move || {
            core.collect(Some(&overlay));
        })
        .await;
        if let Err(e) = shaped {
            // a panicked handler is a programmer error; the loop continues
            error!(
                name = %self.core.id(),
                critical = true,
                "the event handler failed due to {e}"
            );
        }
    }

    async fn serve(self: Arc<Self>, mut shutdown: broadcast::Receiver<Signal>) {
        let events = self.events.get().cloned().unwrap_or_default();
        for event in &events {
            info!(
                name = %self.core.id(),
                "subscribing to events from '{}'", event.id()
            );
        }
        let mut merged = futures_util::stream::select_all(
            events
                .iter()
                .map(|event| BroadcastStream::new(event.subscribe())),
        );

        loop {
            tokio::select! {
                update = merged.next(), if !events.is_empty() => match update {
                    Some(Ok(update)) => self.handle(update).await,
                    Some(Err(BroadcastStreamRecvError::Lagged(count))) => {
                        warn!(
                            name = %self.core.id(),
                            "dropped {count} events, the collector is falling behind"
                        );
                    }
                    None => {
                        // all providers are gone; park on the exit signal
                        let _ = shutdown.recv().await;
                        break;
                    }
                },
                received = shutdown.recv() => {
                    if !matches!(received, Err(broadcast::error::RecvError::Lagged(_))) {
                        break;
                    }
                }
            }
        }
    }
}

impl Component for EventCollector {
    fn id(&self) -> &str {
        self.core.id()
    }
}

impl WorkerComponent for EventCollector {
    fn start(self: Arc<Self>, shutdown: broadcast::Receiver<Signal>) -> JoinHandle<()> {
        self.core.log_start("event");
        tokio::spawn(self.serve(shutdown))
    }
}
