//! The event contract: named topics owned by an event provider, fanning
//! updates out to subscribed collectors.
//!
//! Fan-out is a bounded broadcast channel per event, so a slow subscriber
//! can never block the provider's delivery task; it only loses its own
//! oldest updates.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use metron_common::{Value, ValueMap, now_seconds, value_map};
use regex::Regex;
use tokio::sync::broadcast;
use tracing::warn;

const EVENT_HISTORY_LIMIT: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One update delivered to subscribers.
#[derive(Debug, Clone)]
pub struct EventUpdate {
    pub id: String,
    pub time: i64,
    pub data: Value,
}

#[derive(Debug)]
struct EventState {
    last_time: i64,
    last_data: Value,
    history: VecDeque<Value>,
}

/// A named event topic: its last observation, a bounded history, and the
/// subscriber channel.
#[derive(Debug)]
pub struct Event {
    id: String,
    state: Mutex<EventState>,
    sender: broadcast::Sender<EventUpdate>,
}

impl Event {
    pub fn new(id: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            id: id.into(),
            state: Mutex::new(EventState {
                last_time: 0,
                last_data: Value::Null,
                history: VecDeque::new(),
            }),
            sender,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Records a new observation and fans it out. `last_time` never goes
    /// backwards, even across clock adjustments.
    pub fn publish(&self, data: Value) {
        let update = {
            let mut state = self.state.lock().expect("event state lock poisoned");
            let time = now_seconds().max(state.last_time);
            state.last_time = time;
            state.last_data = data.clone();
            state.history.push_back(data.clone());
            while state.history.len() > EVENT_HISTORY_LIMIT {
                state.history.pop_front();
            }
            EventUpdate {
                id: self.id.clone(),
                time,
                data,
            }
        };
        // no receivers is fine; nothing has subscribed yet
        let _ = self.sender.send(update);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventUpdate> {
        self.sender.subscribe()
    }

    /// The last observation as `{time, data}`.
    pub fn snapshot(&self) -> Value {
        let state = self.state.lock().expect("event state lock poisoned");
        Value::Map(value_map! {
            "time" => Value::Int(state.last_time),
            "data" => state.last_data.clone(),
        })
    }

    pub fn history(&self) -> Vec<Value> {
        let state = self.state.lock().expect("event state lock poisoned");
        state.history.iter().cloned().collect()
    }
}

/// The event table of an event provider: one [`Event`] per declared
/// topic, created at construction and living for the provider's lifetime.
#[derive(Debug, Default)]
pub struct EventProviderCore {
    events: Vec<Arc<Event>>,
}

impl EventProviderCore {
    /// Creates the declared events. Duplicate ids are rejected.
    pub fn new(ids: impl IntoIterator<Item = String>) -> Result<Self, String> {
        let mut events: Vec<Arc<Event>> = Vec::new();
        for id in ids {
            if events.iter().any(|e| e.id() == id) {
                return Err(format!("the event with id {id} already exists"));
            }
            events.push(Arc::new(Event::new(id)));
        }
        Ok(Self { events })
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.events.iter().map(|e| e.id())
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Event>> {
        self.events.iter().find(|e| e.id() == id)
    }

    /// Resolves patterns to events: exact id match first, then anchored
    /// regex match. A pattern matching nothing logs a warning unless
    /// `silent`.
    pub fn select(&self, owner: &str, patterns: &[&str], silent: bool) -> Vec<Arc<Event>> {
        let mut selected: Vec<Arc<Event>> = Vec::new();
        for pattern in patterns {
            let mut found = false;
            if let Some(event) = self.get(pattern) {
                found = true;
                if !selected.iter().any(|e| e.id() == event.id()) {
                    selected.push(Arc::clone(event));
                }
            } else {
                match Regex::new(&format!("^(?:{pattern})")) {
                    Ok(regex) => {
                        for event in &self.events {
                            if regex.is_match(event.id()) {
                                found = true;
                                if !selected.iter().any(|e| e.id() == event.id()) {
                                    selected.push(Arc::clone(event));
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!(name = %owner, "invalid event pattern '{pattern}': {e}");
                    }
                }
            }
            if !found && !silent {
                warn!(name = %owner, "the event with pattern '{pattern}' cannot be found");
            }
        }
        selected
    }

    pub fn select_one(&self, owner: &str, pattern: &str) -> Option<Arc<Event>> {
        self.select(owner, &[pattern], true).into_iter().next()
    }

    /// All topics as `{id: {time, data}}`.
    pub fn snapshot(&self) -> Value {
        Value::Map(
            self.events
                .iter()
                .map(|e| (e.id().to_string(), e.snapshot()))
                .collect::<ValueMap>(),
        )
    }
}
