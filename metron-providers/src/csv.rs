//! CSV-over-HTTP pull provider.

use std::{
    sync::{Arc, Mutex, OnceLock},
    time::{Duration, Instant},
};

use metron_common::{Component, ConfigError, Value, ValueMap, config::ComponentConfig};
use tracing::{error, info};

use crate::{
    Provider, ProviderError, arg_i64, arg_str,
    pull::{DEFAULT_MAX_AGE_SECS, DiffTracker, PullCache, fetch_with_retry},
};

/// A parsed CSV document: one header row, then data rows.
#[derive(Debug)]
pub struct CsvDocument {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl CsvDocument {
    pub fn parse(bytes: &[u8], delimiter: u8) -> Result<Self, ProviderError> {
        let mut reader = ::csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .from_reader(bytes);
        let header = reader
            .headers()
            .map_err(|e| ProviderError::data(format!("cannot parse CSV header: {e}")))?
            .iter()
            .map(str::to_string)
            .collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record =
                record.map_err(|e| ProviderError::data(format!("cannot parse CSV row: {e}")))?;
            let fields: Vec<String> = record.iter().map(str::to_string).collect();
            if fields.iter().any(|f| !f.trim().is_empty()) {
                rows.push(fields);
            }
        }
        Ok(Self { header, rows })
    }

    fn column(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }

    fn row(&self, index: i64) -> Option<&[String]> {
        let len = i64::try_from(self.rows.len()).ok()?;
        let index = if index < 0 { index + len } else { index };
        usize::try_from(index)
            .ok()
            .and_then(|i| self.rows.get(i))
            .map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Interprets a CSV cell as an integer, then a float, then a string.
fn typed(cell: &str) -> Value {
    let trimmed = cell.trim();
    if let Ok(v) = trimmed.parse::<i64>() {
        return Value::Int(v);
    }
    if let Ok(v) = trimmed.parse::<f64>() {
        return Value::Float(v);
    }
    Value::Str(cell.to_string())
}

/// Pull provider for CSV documents retrieved over HTTP.
///
/// Operations: `field(row, name)` (negative rows count from the end),
/// `rows()`, `diff(id, value)`.
pub struct CsvProvider {
    id: String,
    url: String,
    delimiter: u8,
    init_url: Option<String>,
    init_max_age: Duration,
    init_time: Mutex<Option<Instant>>,
    client: OnceLock<reqwest::blocking::Client>,
    cache: PullCache<CsvDocument>,
    diff: DiffTracker,
}

impl CsvProvider {
    pub fn from_config(config: &ComponentConfig) -> Result<Self, ConfigError> {
        let max_age = config.int_or("max_age", DEFAULT_MAX_AGE_SECS)?;
        let delimiter = config.str_or("delimiter", ";")?;
        let delimiter = *delimiter.as_bytes().first().ok_or_else(|| {
            ConfigError::invalid(format!("{}.delimiter", config.id()), "must not be empty")
        })?;
        Ok(Self {
            id: config.id().to_string(),
            url: config.str_value("url")?,
            delimiter,
            init_url: config.opt_str("init_url")?,
            init_max_age: Duration::from_secs(
                config.int_or("init_max_age", 3600)?.max(0).unsigned_abs(),
            ),
            init_time: Mutex::new(None),
            client: OnceLock::new(),
            cache: PullCache::new(Duration::from_secs(max_age.max(0).unsigned_abs())),
            diff: DiffTracker::new(),
        })
    }

    /// The client is created lazily: providers always run on blocking
    /// threads, never on the async runtime.
    fn client(&self) -> &reqwest::blocking::Client {
        self.client
            .get_or_init(reqwest::blocking::Client::new)
    }

    /// Runs the session warm-up request when one is configured and its
    /// own freshness budget has lapsed. Failures are logged, not fatal.
    fn init_session(&self) {
        let Some(init_url) = &self.init_url else {
            return;
        };
        let mut init_time = self.init_time.lock().expect("init time lock poisoned");
        let due = init_time.is_none_or(|at| at.elapsed() > self.init_max_age);
        if !due {
            return;
        }
        *init_time = Some(Instant::now());
        info!(name = %self.id, "running the initialization request at {init_url}");
        if let Err(e) = self.client().get(init_url).send() {
            error!(name = %self.id, "the initialization request failed: {e}");
        }
    }

    fn document(&self) -> Result<Arc<CsvDocument>, ProviderError> {
        self.cache.get_or_refresh(&self.id, || {
            self.init_session();
            let bytes = fetch_with_retry(self.client(), &self.id, &self.url)?;
            CsvDocument::parse(&bytes, self.delimiter)
        })
    }

    pub fn field(&self, row: i64, name: &str) -> Result<Value, ProviderError> {
        let document = self.document()?;
        let column = document.column(name).ok_or_else(|| {
            ProviderError::data(format!("there is no column '{name}' in the CSV document"))
        })?;
        let cells = document.row(row).ok_or_else(|| {
            ProviderError::data(format!(
                "row {row} is out of range ({} rows)",
                document.len()
            ))
        })?;
        Ok(cells.get(column).map_or(Value::Null, |cell| typed(cell)))
    }

    pub fn rows(&self) -> Result<Value, ProviderError> {
        let document = self.document()?;
        let rows = document
            .rows
            .iter()
            .map(|cells| {
                Value::Map(
                    document
                        .header
                        .iter()
                        .zip(cells)
                        .map(|(name, cell)| (name.clone(), typed(cell)))
                        .collect::<ValueMap>(),
                )
            })
            .collect();
        Ok(Value::Seq(rows))
    }
}

impl Component for CsvProvider {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Provider for CsvProvider {
    fn call(&self, op: &str, args: &[Value]) -> Result<Value, ProviderError> {
        match op {
            "field" => self.field(arg_i64(op, args, 0)?, arg_str(op, args, 1)?),
            "rows" => self.rows(),
            "diff" => {
                let id = arg_str(op, args, 0)?.to_string();
                let value = args
                    .get(1)
                    .ok_or_else(|| ProviderError::data("diff: missing value argument"))?;
                self.diff.diff(&id, value)
            }
            other => Err(ProviderError::data(format!("unknown operation '{other}'"))),
        }
    }

    fn operations(&self) -> &'static [&'static str] {
        &["field", "rows", "diff"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"name;count;load\r\nweb1;10;0.5\r\nweb2;20;1.5\r\n\r\n";

    #[test]
    fn parses_header_and_skips_blank_lines() {
        let document = CsvDocument::parse(SAMPLE, b';').unwrap();
        assert_eq!(document.header, vec!["name", "count", "load"]);
        assert_eq!(document.len(), 2);
    }

    #[test]
    fn rows_index_from_both_ends() {
        let document = CsvDocument::parse(SAMPLE, b';').unwrap();
        assert_eq!(document.row(0).unwrap()[0], "web1");
        assert_eq!(document.row(-1).unwrap()[0], "web2");
        assert!(document.row(2).is_none());
        assert!(document.row(-3).is_none());
    }

    #[test]
    fn cells_are_typed() {
        assert_eq!(typed("10"), Value::Int(10));
        assert_eq!(typed(" 1.5 "), Value::Float(1.5));
        assert_eq!(typed("web1"), Value::Str("web1".into()));
    }
}
