//! SQLite pull provider with a bounded connection lifetime.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Mutex,
    time::{Duration, Instant},
};

use metron_common::{Component, ConfigError, Value, ValueMap, config::ComponentConfig, now_seconds};
use rusqlite::{Connection, types::ValueRef};
use tracing::{debug, info};

use crate::{Provider, ProviderError, arg_str, pull::DiffTracker};

const DEFAULT_RECONNECT_AFTER_SECS: i64 = 3600;

struct OpenConnection {
    connection: Connection,
    opened_at: Instant,
}

/// Pull provider running SQL statements from files against a SQLite
/// database. The connection is opened on first use and reopened once it
/// is older than `reconnect_after`; a failing query closes it.
///
/// Operations: `sql(file)`, `sql(file, [params])`, `diff(id, value)`.
pub struct SqlProvider {
    id: String,
    database: PathBuf,
    sql_files_dir: PathBuf,
    reconnect_after: Duration,
    connection: Mutex<Option<OpenConnection>>,
    statements: Mutex<HashMap<String, String>>,
    diff: DiffTracker,
}

impl SqlProvider {
    pub fn from_config(
        config: &ComponentConfig,
        config_dir: &std::path::Path,
    ) -> Result<Self, ConfigError> {
        let database = config.str_value("database")?;
        let sql_files_dir = config.str_value("sql_files_dir")?;
        let resolve = |path: &str| {
            let candidate = PathBuf::from(path);
            if candidate.is_absolute() {
                candidate
            } else {
                config_dir.join(candidate)
            }
        };
        let sql_files_dir = resolve(&sql_files_dir);
        if !sql_files_dir.is_dir() {
            return Err(ConfigError::invalid(
                format!("{}.sql_files_dir", config.id()),
                format!("the directory {} does not exist", sql_files_dir.display()),
            ));
        }
        Ok(Self {
            id: config.id().to_string(),
            database: resolve(&database),
            sql_files_dir,
            reconnect_after: Duration::from_secs(
                config
                    .int_or("reconnect_after", DEFAULT_RECONNECT_AFTER_SECS)?
                    .max(0)
                    .unsigned_abs(),
            ),
            connection: Mutex::new(None),
            statements: Mutex::new(HashMap::new()),
            diff: DiffTracker::new(),
        })
    }

    /// Loads and caches the statement text for a file name.
    fn load_statement(&self, file: &str) -> Result<String, ProviderError> {
        let mut statements = self.statements.lock().expect("statement cache poisoned");
        if let Some(text) = statements.get(file) {
            return Ok(text.clone());
        }
        let path = self.sql_files_dir.join(file);
        let text = std::fs::read_to_string(&path).map_err(|_| {
            ProviderError::data(format!("the SQL file {} does not exist", path.display()))
        })?;
        statements.insert(file.to_string(), text.clone());
        Ok(text)
    }

    pub fn sql(&self, file: &str, params: &[Value]) -> Result<Value, ProviderError> {
        let statement = self.load_statement(file)?;
        let mut guard = self.connection.lock().expect("connection lock poisoned");

        let reopen = match guard.as_ref() {
            None => true,
            Some(open) => open.opened_at.elapsed() > self.reconnect_after,
        };
        if reopen {
            if guard.take().is_some() {
                info!(name = %self.id, "closing the database connection");
            }
            info!(
                name = %self.id,
                "opening the database connection, database={}",
                self.database.display()
            );
            let connection = Connection::open(&self.database)?;
            *guard = Some(OpenConnection {
                connection,
                opened_at: Instant::now(),
            });
        }

        let open = guard.as_ref().expect("connection was just opened");
        debug!(name = %self.id, "running the SQL statement from {file}");
        let query_time = now_seconds();
        let started = Instant::now();

        let result = Self::run_query(&open.connection, &statement, params, query_time);
        match result {
            Ok(rows) => {
                info!(
                    name = %self.id,
                    "the sql operation retrieved {} records in {:.4} seconds",
                    rows.len(),
                    started.elapsed().as_secs_f64()
                );
                Ok(Value::Seq(rows))
            }
            Err(e) => {
                // a failing query invalidates the connection
                *guard = None;
                Err(e)
            }
        }
    }

    fn run_query(
        connection: &Connection,
        statement: &str,
        params: &[Value],
        query_time: i64,
    ) -> Result<Vec<Value>, ProviderError> {
        let mut prepared = connection.prepare(statement)?;
        let columns: Vec<String> = prepared
            .column_names()
            .into_iter()
            .map(|name| name.to_lowercase())
            .collect();

        let bound: Vec<Box<dyn rusqlite::ToSql>> = params
            .iter()
            .map(|param| -> Result<Box<dyn rusqlite::ToSql>, ProviderError> {
                Ok(match param {
                    Value::Null => Box::new(rusqlite::types::Null),
                    Value::Bool(v) => Box::new(*v),
                    Value::Int(v) => Box::new(*v),
                    Value::Float(v) => Box::new(*v),
                    Value::Str(v) => Box::new(v.clone()),
                    other => {
                        return Err(ProviderError::data(format!(
                            "cannot bind a {} parameter",
                            other.type_name()
                        )));
                    }
                })
            })
            .collect::<Result<_, _>>()?;
        let bound_refs: Vec<&dyn rusqlite::ToSql> =
            bound.iter().map(|param| &**param).collect();

        let mut rows = prepared.query(bound_refs.as_slice())?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = ValueMap::new();
            for (index, column) in columns.iter().enumerate() {
                let value = match row.get_ref(index)? {
                    ValueRef::Null => Value::Null,
                    ValueRef::Integer(v) => Value::Int(v),
                    ValueRef::Real(v) => Value::Float(v),
                    ValueRef::Text(text) => {
                        Value::Str(String::from_utf8_lossy(text).into_owned())
                    }
                    ValueRef::Blob(blob) => Value::Str(format!("<{} bytes>", blob.len())),
                };
                record.insert(column.clone(), value);
            }
            record.insert("time", Value::Int(query_time));
            records.push(Value::Map(record));
        }
        Ok(records)
    }

    fn close(&self) {
        if let Ok(mut guard) = self.connection.lock() {
            if guard.take().is_some() {
                info!(name = %self.id, "closing the database connection");
            }
        }
    }
}

impl Component for SqlProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn destroy(&self) {
        self.close();
    }
}

impl Provider for SqlProvider {
    fn call(&self, op: &str, args: &[Value]) -> Result<Value, ProviderError> {
        match op {
            "sql" => {
                let file = arg_str(op, args, 0)?.to_string();
                let params = match args.get(1) {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Seq(items)) => items.clone(),
                    Some(other) => {
                        return Err(ProviderError::data(format!(
                            "sql: parameters must be a list, got {}",
                            other.type_name()
                        )));
                    }
                };
                self.sql(&file, &params)
            }
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
        &["sql", "diff"]
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn provider(dir: &std::path::Path) -> SqlProvider {
        let sql_dir = dir.join("sql");
        std::fs::create_dir_all(&sql_dir).unwrap();
        let mut file = std::fs::File::create(sql_dir.join("hosts.sql")).unwrap();
        writeln!(file, "SELECT name, cpu FROM hosts ORDER BY name").unwrap();
        let mut file = std::fs::File::create(sql_dir.join("one.sql")).unwrap();
        writeln!(file, "SELECT name FROM hosts WHERE cpu > ?1").unwrap();

        let database = dir.join("metrics.db");
        let connection = Connection::open(&database).unwrap();
        connection
            .execute_batch(
                "CREATE TABLE hosts (name TEXT, cpu REAL);
                 INSERT INTO hosts VALUES ('web1', 0.5), ('web2', 1.5);",
            )
            .unwrap();

        SqlProvider {
            id: "db".to_string(),
            database,
            sql_files_dir: sql_dir,
            reconnect_after: Duration::from_secs(3600),
            connection: Mutex::new(None),
            statements: Mutex::new(HashMap::new()),
            diff: DiffTracker::new(),
        }
    }

    #[test]
    fn runs_statements_from_files_and_stamps_time() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(dir.path());

        let Value::Seq(rows) = provider.sql("hosts.sql", &[]).unwrap() else {
            panic!("expected a list of rows");
        };
        assert_eq!(rows.len(), 2);
        let first = rows[0].as_map().unwrap();
        assert_eq!(first.get("name"), Some(&Value::Str("web1".into())));
        assert_eq!(first.get("cpu"), Some(&Value::Float(0.5)));
        assert!(matches!(first.get("time"), Some(Value::Int(t)) if *t > 0));
    }

    #[test]
    fn binds_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(dir.path());

        let Value::Seq(rows) = provider
            .sql("one.sql", &[Value::Float(1.0)])
            .unwrap()
        else {
            panic!("expected a list of rows");
        };
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].as_map().unwrap().get("name"),
            Some(&Value::Str("web2".into()))
        );
    }

    #[test]
    fn missing_sql_file_is_a_data_error() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(dir.path());
        assert!(matches!(
            provider.sql("nope.sql", &[]),
            Err(ProviderError::Data(_))
        ));
    }

    #[test]
    fn failing_query_closes_the_connection() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(dir.path());
        provider.sql("hosts.sql", &[]).unwrap();
        assert!(provider.connection.lock().unwrap().is_some());

        let sql_dir = dir.path().join("sql");
        let mut file = std::fs::File::create(sql_dir.join("bad.sql")).unwrap();
        writeln!(file, "SELECT nope FROM missing_table").unwrap();
        assert!(provider.sql("bad.sql", &[]).is_err());
        assert!(provider.connection.lock().unwrap().is_none());

        // and the next good query reopens it
        provider.sql("hosts.sql", &[]).unwrap();
        assert!(provider.connection.lock().unwrap().is_some());
    }
}
