//! The pull-provider contract: a freshness-bounded cache in front of a
//! fetch, transport retry, and the per-id counter differ.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use metron_common::Value;
use tracing::{debug, error};

use crate::ProviderError;

pub const DEFAULT_MAX_AGE_SECS: i64 = 10;

const FETCH_ATTEMPTS: u32 = 3;
const FETCH_RETRY_SPACING: Duration = Duration::from_secs(1);

/// A lock-guarded cache with a freshness budget. Every provider operation
/// goes through [`PullCache::get_or_refresh`]; the fetch runs only when
/// there is no data yet or the cached copy is older than `max_age`.
#[derive(Debug)]
pub struct PullCache<T> {
    max_age: Duration,
    state: Mutex<CacheState<T>>,
}

#[derive(Debug)]
struct CacheState<T> {
    data: Option<Arc<T>>,
    refreshed_at: Option<Instant>,
}

impl<T> PullCache<T> {
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age,
            state: Mutex::new(CacheState {
                data: None,
                refreshed_at: None,
            }),
        }
    }

    /// Returns the cached document, refreshing it first when stale. The
    /// cached copy is left untouched when the fetch fails.
    pub fn get_or_refresh(
        &self,
        name: &str,
        fetch: impl FnOnce() -> Result<T, ProviderError>,
    ) -> Result<Arc<T>, ProviderError> {
        let mut state = self.state.lock().expect("pull cache lock poisoned");
        let stale = match (&state.data, state.refreshed_at) {
            (Some(_), Some(at)) => at.elapsed() > self.max_age,
            _ => true,
        };
        if stale {
            let data = Arc::new(fetch()?);
            state.data = Some(Arc::clone(&data));
            state.refreshed_at = Some(Instant::now());
            Ok(data)
        } else {
            debug!(name = %name, "serving data from cache");
            Ok(Arc::clone(state.data.as_ref().expect("fresh cache has data")))
        }
    }
}

/// Fetches a URL with the pull-provider retry policy: up to 3 attempts
/// spaced 1 s apart; 404 aborts immediately, any other status of 400 or
/// above retries and fails permanently once the attempts are exhausted.
pub fn fetch_with_retry(
    client: &reqwest::blocking::Client,
    name: &str,
    url: &str,
) -> Result<Vec<u8>, ProviderError> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let failure = match client.get(url).send() {
            Ok(response) => {
                let status = response.status();
                if status == reqwest::StatusCode::NOT_FOUND {
                    return Err(ProviderError::NotFound(url.to_string()));
                }
                if status.as_u16() < 400 {
                    return response
                        .bytes()
                        .map(|body| body.to_vec())
                        .map_err(|e| ProviderError::Transport(e.to_string()));
                }
                format!("status-code={}", status.as_u16())
            }
            Err(e) => e.to_string(),
        };

        error!(
            name = %name,
            "the request at {url} failed, {failure}, attempt={attempts}"
        );
        if attempts >= FETCH_ATTEMPTS {
            return Err(ProviderError::CannotRetrieve {
                url: url.to_string(),
                attempts,
            });
        }
        std::thread::sleep(FETCH_RETRY_SPACING);
    }
}

/// Computes successive differences of a numeric series, one slot per id.
/// The first observation yields `0`; every later one yields
/// `value - previous`.
#[derive(Debug, Default)]
pub struct DiffTracker {
    slots: Mutex<HashMap<String, Value>>,
}

impl DiffTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn diff(&self, id: &str, value: &Value) -> Result<Value, ProviderError> {
        if !value.is_number() {
            return Err(ProviderError::data(format!(
                "can only calculate diff on numeric values, got {}",
                value.type_name()
            )));
        }

        let mut slots = self.slots.lock().expect("diff tracker lock poisoned");
        let previous = slots.insert(id.to_string(), value.clone());
        match previous {
            None => Ok(Value::Int(0)),
            Some(previous) => Ok(match (&previous, value) {
                (Value::Int(a), Value::Int(b)) => Value::Int(b - a),
                _ => Value::Float(
                    value.as_f64().unwrap_or(0.0) - previous.as_f64().unwrap_or(0.0),
                ),
            }),
        }
    }
}
