//! SQLite client using rusqlite
//!
//! rusqlite is synchronous. The single connection lives behind a tokio
//! mutex and each call runs its statement while holding the lock, which
//! also keeps `:memory:` databases alive for the life of the client.

use crate::config::SqliteConfig;
use crate::db::connection_url;
use crate::db::driver::{log_statement, DatabaseClient};
use crate::db::params::{NamedQuery, Params, PlaceholderStyle};
use crate::db::query::{QueryResult, Value};
use crate::db::BackendKind;
use crate::error::{Error, Result};
use async_trait::async_trait;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Connection, ToSql};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// SQLite client
pub struct SqliteClient {
    conn: Arc<Mutex<Option<Connection>>>,
    url: String,
    pub path: String,
    echo: bool,
    closed: AtomicBool,
}

impl SqliteClient {
    /// Open the database described by a typed config
    pub async fn connect(config: SqliteConfig) -> Result<Self> {
        config.validate()?;
        Self::open(&config.connection_url(), config.echo).await
    }

    /// Open (or create) the database named by a `sqlite:///<path>` URL
    pub async fn open(url: &str, echo: bool) -> Result<Self> {
        let path = connection_url::sqlite_path(url)?;
        let p = path.clone();
        let conn = tokio::task::spawn_blocking(move || {
            if p == ":memory:" {
                Connection::open_in_memory()
            } else {
                Connection::open(&p)
            }
        })
        .await
        .map_err(Error::connection)?
        .map_err(|e| Error::Connection(format!("Failed to open SQLite database {}: {}", path, e)))?;

        tracing::info!(backend = %BackendKind::SQLite, path = %path, "opened database");

        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            url: url.to_string(),
            path,
            echo,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl DatabaseClient for SqliteClient {
    fn backend(&self) -> BackendKind {
        BackendKind::SQLite
    }

    fn connection_url(&self) -> &str {
        &self.url
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn execute_query(&self, sql: &str, params: &Params) -> Result<QueryResult> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let (sql, values) = NamedQuery::parse(sql).compile(PlaceholderStyle::Numbered, params)?;
        log_statement(BackendKind::SQLite, self.echo, &sql, values.len());

        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(Error::Closed)?;
        let start = Instant::now();

        let tx = conn.transaction().map_err(Error::query)?;
        match run_statement(&tx, &sql, &values) {
            Ok(mut result) => {
                tx.commit().map_err(Error::query)?;
                result.execution_time = start.elapsed();
                Ok(result)
            }
            Err(e) => {
                tracing::warn!(backend = %BackendKind::SQLite, error = %e, "rolling back");
                if let Err(rollback) = tx.rollback() {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn execute_many(&self, sql: &str, params_list: &[Params]) -> Result<u64> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let query = NamedQuery::parse(sql);
        let batches = params_list
            .iter()
            .map(|params| query.compile(PlaceholderStyle::Numbered, params))
            .collect::<Result<Vec<_>>>()?;

        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(Error::Closed)?;

        let tx = conn.transaction().map_err(Error::query)?;
        let mut affected = 0u64;
        for (sql, values) in &batches {
            log_statement(BackendKind::SQLite, self.echo, sql, values.len());
            match run_statement(&tx, sql, values) {
                Ok(result) => affected += result.rows_affected,
                Err(e) => {
                    tracing::warn!(backend = %BackendKind::SQLite, error = %e, "rolling back batch");
                    if let Err(rollback) = tx.rollback() {
                        tracing::warn!(error = %rollback, "rollback failed");
                    }
                    return Err(e);
                }
            }
        }
        tx.commit().map_err(Error::query)?;
        Ok(affected)
    }

    async fn close(&self) -> Result<()> {
        let conn = self.conn.lock().await.take();
        self.closed.store(true, Ordering::Release);
        if let Some(conn) = conn {
            conn.close().map_err(|(_, e)| Error::connection(e))?;
            tracing::info!(backend = %BackendKind::SQLite, path = %self.path, "closed database");
        }
        Ok(())
    }
}

/// Prepare, bind, and drain one statement
fn run_statement(conn: &Connection, sql: &str, values: &[Value]) -> Result<QueryResult> {
    let mut stmt = conn.prepare(sql).map_err(Error::query)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    if columns.is_empty() {
        // Statement doesn't return rows (INSERT/UPDATE/DELETE/CREATE/etc.)
        let affected = stmt
            .execute(rusqlite::params_from_iter(values.iter()))
            .map_err(Error::query)?;
        let last_insert_id = (affected > 0 && is_insert(sql)).then(|| conn.last_insert_rowid());
        return Ok(QueryResult {
            rows_affected: affected as u64,
            last_insert_id,
            ..QueryResult::empty()
        });
    }

    let col_count = columns.len();
    let mut rows: Vec<Vec<Value>> = Vec::new();
    let mut raw_rows = stmt
        .query(rusqlite::params_from_iter(values.iter()))
        .map_err(Error::query)?;

    while let Some(row) = raw_rows.next().map_err(Error::query)? {
        let mut row_data = Vec::with_capacity(col_count);
        for i in 0..col_count {
            let val = match row.get_ref(i).map_err(Error::query)? {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(v) => Value::Integer(v),
                ValueRef::Real(v) => Value::Float(v),
                ValueRef::Text(v) => Value::Text(String::from_utf8_lossy(v).to_string()),
                ValueRef::Blob(v) => Value::Binary(v.to_vec()),
            };
            row_data.push(val);
        }
        rows.push(row_data);
    }

    Ok(QueryResult {
        columns,
        rows,
        ..QueryResult::empty()
    })
}

/// `last_insert_rowid` only describes the statement when it inserted rows
fn is_insert(sql: &str) -> bool {
    let keyword = sql
        .trim_start()
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or("");
    keyword.eq_ignore_ascii_case("INSERT") || keyword.eq_ignore_ascii_case("REPLACE")
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Integer(v) => ToSqlOutput::from(*v),
            Value::Float(v) => ToSqlOutput::from(*v),
            Value::Text(v) => ToSqlOutput::from(v.as_str()),
            Value::Boolean(v) => ToSqlOutput::from(*v),
            Value::Binary(v) => ToSqlOutput::from(v.as_slice()),
            Value::Timestamp(v) => ToSqlOutput::from(v.format(TIMESTAMP_FORMAT).to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params;

    async fn users_db() -> SqliteClient {
        let client = SqliteClient::connect(SqliteConfig::in_memory()).await.unwrap();
        client
            .execute_query(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, email TEXT UNIQUE, age INTEGER)",
                &Params::new(),
            )
            .await
            .unwrap();
        client
    }

    #[tokio::test]
    async fn test_insert_reports_rows_and_rowid() {
        let client = users_db().await;
        let result = client
            .execute_query(
                "INSERT INTO users (name, email, age) VALUES (:name, :email, :age)",
                &params! { "name" => "Alice", "email" => "alice@example.com", "age" => 30 },
            )
            .await
            .unwrap();
        assert_eq!(result.rows_affected, 1);
        assert_eq!(result.last_insert_id, Some(1));
        assert!(result.columns.is_empty());
    }

    #[tokio::test]
    async fn test_select_returns_typed_values() {
        let client = users_db().await;
        client
            .execute_query(
                "INSERT INTO users (name, email, age) VALUES ('Bob', NULL, 25)",
                &Params::new(),
            )
            .await
            .unwrap();

        let result = client
            .execute_query("SELECT id, name, email, age, 1.5 AS ratio FROM users", &Params::new())
            .await
            .unwrap();
        assert_eq!(result.columns, vec!["id", "name", "email", "age", "ratio"]);
        assert_eq!(
            result.rows[0],
            vec![
                Value::Integer(1),
                Value::Text("Bob".into()),
                Value::Null,
                Value::Integer(25),
                Value::Float(1.5),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_statement_leaves_client_usable() {
        let client = users_db().await;
        let err = client
            .execute_query("SELECT * FROM missing_table", &Params::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Query(_)));

        let result = client
            .execute_query("SELECT COUNT(*) AS cnt FROM users", &Params::new())
            .await
            .unwrap();
        assert_eq!(result.rows[0][0], Value::Integer(0));
    }

    #[tokio::test]
    async fn test_execute_many_is_all_or_nothing() {
        let client = users_db().await;
        let insert = "INSERT INTO users (name, email, age) VALUES (:name, :email, :age)";

        let affected = client
            .execute_many(
                insert,
                &[
                    params! { "name" => "Alice", "email" => "a@example.com", "age" => 30 },
                    params! { "name" => "Bob", "email" => "b@example.com", "age" => 25 },
                ],
            )
            .await
            .unwrap();
        assert_eq!(affected, 2);

        // second row violates the UNIQUE email constraint
        let err = client
            .execute_many(
                insert,
                &[
                    params! { "name" => "Carol", "email" => "c@example.com", "age" => 41 },
                    params! { "name" => "Dup", "email" => "a@example.com", "age" => 50 },
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Query(_)));

        let result = client
            .execute_query("SELECT name FROM users ORDER BY id", &Params::new())
            .await
            .unwrap();
        assert_eq!(result.row_count(), 2);
    }

    #[tokio::test]
    async fn test_bound_values_round_trip() {
        let client = users_db().await;
        let ts = chrono::NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();
        let result = client
            .execute_query(
                "SELECT :flag AS flag, :data AS data, :ts AS ts, :absent AS absent",
                &params! {
                    "flag" => true,
                    "data" => vec![1u8, 2, 3],
                    "ts" => ts,
                    "absent" => None::<i64>,
                },
            )
            .await
            .unwrap();
        assert_eq!(
            result.rows[0],
            vec![
                Value::Integer(1),
                Value::Binary(vec![1, 2, 3]),
                Value::Text("2024-01-02 03:04:05".into()),
                Value::Null,
            ]
        );
    }

    #[tokio::test]
    async fn test_closed_client_rejects_calls() {
        let client = users_db().await;
        client.close().await.unwrap();
        assert!(client.is_closed());
        // closing again is a no-op
        client.close().await.unwrap();

        let err = client
            .execute_query("SELECT 1", &Params::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Closed));
        assert!(matches!(
            client.execute_many("SELECT 1", &[Params::new()]).await,
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn test_closed_check_precedes_parameter_binding() {
        let client = users_db().await;
        client.close().await.unwrap();

        let err = client.execute_query("SELECT :x", &Params::new()).await.unwrap_err();
        assert!(matches!(err, Error::Closed));
        let err = client.execute_many("SELECT :x", &[Params::new()]).await.unwrap_err();
        assert!(matches!(err, Error::Closed));
    }

    #[tokio::test]
    async fn test_last_insert_id_only_for_inserts() {
        let client = users_db().await;
        client
            .execute_query("INSERT INTO users (name) VALUES ('Alice')", &Params::new())
            .await
            .unwrap();

        let update = client
            .execute_query("UPDATE users SET age = 31", &Params::new())
            .await
            .unwrap();
        assert_eq!(update.rows_affected, 1);
        assert_eq!(update.last_insert_id, None);

        let ddl = client
            .execute_query("CREATE TABLE other (id INTEGER)", &Params::new())
            .await
            .unwrap();
        assert_eq!(ddl.last_insert_id, None);

        let insert = client
            .execute_query("  insert into users (name) VALUES ('Bob')", &Params::new())
            .await
            .unwrap();
        assert_eq!(insert.last_insert_id, Some(2));
    }

    #[tokio::test]
    async fn test_file_path_with_percent_sign_opens_that_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data%41.db");
        let client = SqliteClient::connect(SqliteConfig::new(path.to_string_lossy().to_string()))
            .await
            .unwrap();
        client
            .execute_query("CREATE TABLE t (v TEXT)", &Params::new())
            .await
            .unwrap();
        client.close().await.unwrap();

        assert!(path.exists());
        assert!(!dir.path().join("dataA.db").exists());
    }

    #[tokio::test]
    async fn test_file_database_persists_between_clients() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        let config = SqliteConfig::new(path.to_string_lossy().to_string());

        let client = SqliteClient::connect(config.clone()).await.unwrap();
        client
            .execute_query("CREATE TABLE t (v TEXT)", &Params::new())
            .await
            .unwrap();
        client
            .execute_query("INSERT INTO t (v) VALUES (:v)", &params! { "v" => "kept" })
            .await
            .unwrap();
        client.close().await.unwrap();

        let reopened = SqliteClient::connect(config).await.unwrap();
        let result = reopened
            .execute_query("SELECT v FROM t", &Params::new())
            .await
            .unwrap();
        assert_eq!(result.rows, vec![vec![Value::Text("kept".into())]]);
    }

    #[tokio::test]
    async fn test_missing_parent_directory_is_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope").join("app.db");
        let result = SqliteClient::connect(SqliteConfig::new(path.to_string_lossy().to_string())).await;
        assert!(matches!(result, Err(Error::Connection(_))));
    }
}
