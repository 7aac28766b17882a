//! SQL Server client using tiberius
//!
//! Connections are described by the ODBC-style URL built from
//! [`SqlServerConfig`]; the `odbc_connect` pairs are decoded back into a
//! tiberius [`Config`].

use crate::config::SqlServerConfig;
use crate::db::connection_url::{
    self, SQLSERVER_COMMAND_TIMEOUT_SECS, SQLSERVER_CONNECTION_TIMEOUT_SECS,
};
use crate::db::driver::{log_statement, DatabaseClient};
use crate::db::params::{NamedQuery, Params, PlaceholderStyle};
use crate::db::query::{QueryResult, Value};
use crate::db::BackendKind;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql, Query, SqlBrowser};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

type SqlClient = Client<Compat<TcpStream>>;

const DEFAULT_PORT: u16 = 1433;

/// SQL Server client over a single TDS connection
pub struct SqlServerClient {
    client: Mutex<Option<SqlClient>>,
    url: String,
    echo: bool,
    command_timeout: Duration,
    closed: AtomicBool,
}

impl SqlServerClient {
    pub async fn connect(config: SqlServerConfig) -> Result<Self> {
        config.validate()?;
        Self::open(&config.connection_url(), config.echo).await
    }

    /// Connect using an `mssql:///?odbc_connect=...` URL
    pub async fn open(url: &str, echo: bool) -> Result<Self> {
        let settings = OdbcSettings::parse(&connection_url::odbc_params(url)?)?;
        let config = settings.tiberius_config()?;
        let connect_timeout = settings.connection_timeout;

        let tcp = with_timeout(connect_timeout, "connecting", async {
            if settings.instance.is_some() {
                TcpStream::connect_named(&config).await.map_err(Error::connection)
            } else {
                TcpStream::connect(config.get_addr())
                    .await
                    .map_err(|e| Error::Connection(format!("Failed to connect to SQL Server: {}", e)))
            }
        })
        .await?;
        tcp.set_nodelay(true).map_err(Error::connection)?;

        let client = with_timeout(connect_timeout, "logging in", async {
            Client::connect(config, tcp.compat_write())
                .await
                .map_err(|e| Error::Connection(format!("Failed to authenticate with SQL Server: {}", e)))
        })
        .await?;

        tracing::info!(backend = %BackendKind::SqlServer, server = %settings.server, "connected");

        Ok(Self {
            client: Mutex::new(Some(client)),
            url: url.to_string(),
            echo,
            command_timeout: settings.command_timeout,
            closed: AtomicBool::new(false),
        })
    }
}

/// Connection settings recovered from the `odbc_connect` pairs
#[derive(Debug, Clone, PartialEq)]
struct OdbcSettings {
    server: String,
    host: String,
    port: Option<u16>,
    instance: Option<String>,
    database: Option<String>,
    username: Option<String>,
    password: Option<String>,
    trusted: bool,
    encrypt: bool,
    trust_cert: bool,
    connection_timeout: Duration,
    command_timeout: Duration,
}

impl OdbcSettings {
    fn parse(pairs: &[(String, String)]) -> Result<Self> {
        let get = |key: &str| {
            pairs
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.trim().to_string())
        };
        let flag = |key: &str| get(key).map(|v| is_yes(&v)).unwrap_or(false);
        let seconds = |key: &str, default: u64| -> Result<Duration> {
            match get(key) {
                Some(v) => v
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|_| Error::Configuration(format!("invalid {}: {:?}", key, v))),
                None => Ok(Duration::from_secs(default)),
            }
        };

        let server = get("server")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Configuration("SQL Server URL has no server".into()))?;

        // tcp:host,port | host\instance | host
        let address = server.strip_prefix("tcp:").unwrap_or(&server);
        let (host, port, instance) = if let Some((host, port)) = address.split_once(',') {
            let port = port
                .trim()
                .parse::<u16>()
                .map_err(|_| Error::Configuration(format!("invalid server port in {:?}", server)))?;
            (host.to_string(), Some(port), None)
        } else if let Some((host, instance)) = address.split_once('\\') {
            (host.to_string(), None, Some(instance.to_string()))
        } else {
            (address.to_string(), None, None)
        };
        let host = match host.as_str() {
            "." | "(local)" => "localhost".to_string(),
            _ => host,
        };

        Ok(Self {
            server: server.clone(),
            host,
            port,
            instance,
            database: get("database").filter(|d| !d.is_empty()),
            username: get("uid"),
            password: get("pwd"),
            trusted: flag("trusted_connection"),
            encrypt: flag("encrypt"),
            trust_cert: flag("TrustServerCertificate"),
            connection_timeout: seconds("Connection Timeout", SQLSERVER_CONNECTION_TIMEOUT_SECS)?,
            command_timeout: seconds("Command Timeout", SQLSERVER_COMMAND_TIMEOUT_SECS)?,
        })
    }

    fn tiberius_config(&self) -> Result<Config> {
        let mut config = Config::new();
        config.host(&self.host);
        match (&self.instance, self.port) {
            (Some(instance), _) => config.instance_name(instance),
            (None, port) => config.port(port.unwrap_or(DEFAULT_PORT)),
        }
        if let Some(database) = &self.database {
            config.database(database);
        }
        config.application_name("sql_explorer");

        if self.trusted {
            return Err(Error::Connection(
                "trusted_connection (integrated authentication) is not available; \
                 supply a username and password"
                    .into(),
            ));
        }
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => {
                config.authentication(AuthMethod::sql_server(username, password))
            }
            _ => {
                return Err(Error::Configuration(
                    "SQL Server URL needs uid and pwd".into(),
                ))
            }
        }

        if self.trust_cert {
            config.trust_cert();
        }
        if !self.encrypt {
            config.encryption(EncryptionLevel::NotSupported);
        }

        Ok(config)
    }
}

fn is_yes(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "yes" | "true" | "1"
    )
}

/// A round trip that overran its limit; the TDS stream is left mid-response
#[derive(Debug, thiserror::Error)]
#[error("SQL Server timed out after {}s while {}", .after.as_secs(), .what)]
struct TimedOut {
    after: Duration,
    what: &'static str,
}

async fn bounded<T>(
    limit: Duration,
    what: &'static str,
    fut: impl Future<Output = Result<T>>,
) -> std::result::Result<Result<T>, TimedOut> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| TimedOut { after: limit, what })
}

async fn with_timeout<T>(
    limit: Duration,
    what: &'static str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    bounded(limit, what, fut)
        .await
        .unwrap_or_else(|timed_out| Err(Error::Connection(timed_out.to_string())))
}

/// Drop a connection that can no longer be trusted to be in sync
fn discard<C>(slot: &mut Option<C>, closed: &AtomicBool, timed_out: TimedOut) -> Error {
    slot.take();
    closed.store(true, Ordering::Release);
    tracing::warn!(backend = %BackendKind::SqlServer, error = %timed_out, "discarding connection");
    Error::Connection(format!("{}; connection discarded", timed_out))
}

/// Whether a statement hands back a result set rather than a row count
fn produces_rows(sql: &str) -> bool {
    let mut words = sql
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '@' || c == '#'))
        .filter(|w| !w.is_empty());
    let first = match words.next() {
        Some(word) => word.to_ascii_uppercase(),
        None => return false,
    };
    matches!(first.as_str(), "SELECT" | "WITH" | "EXEC" | "EXECUTE" | "VALUES")
        || words.any(|w| w.eq_ignore_ascii_case("OUTPUT"))
}

async fn batch(client: &mut SqlClient, sql: &str) -> Result<()> {
    client
        .simple_query(sql)
        .await
        .map_err(Error::query)?
        .into_results()
        .await
        .map_err(Error::query)?;
    Ok(())
}

/// Run each statement in one transaction, committing only if all succeed
///
/// The outer `Err` means a round trip timed out and the connection is unusable.
async fn run_in_transaction(
    client: &mut SqlClient,
    limit: Duration,
    echo: bool,
    statements: Vec<(String, Vec<Value>)>,
) -> std::result::Result<Result<Vec<QueryResult>>, TimedOut> {
    if let Err(e) = bounded(limit, "starting a transaction", batch(client, "BEGIN TRANSACTION")).await? {
        return Ok(Err(e));
    }

    let mut results = Vec::with_capacity(statements.len());
    for (sql, values) in statements {
        log_statement(BackendKind::SqlServer, echo, &sql, values.len());
        match bounded(limit, "running a statement", run_statement(client, &sql, values)).await? {
            Ok(result) => results.push(result),
            Err(e) => {
                tracing::warn!(backend = %BackendKind::SqlServer, error = %e, "rolling back");
                let rollback = batch(client, "IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION");
                if let Err(rollback) = bounded(limit, "rolling back", rollback).await? {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                return Ok(Err(e));
            }
        }
    }

    let committed = bounded(limit, "committing", batch(client, "COMMIT TRANSACTION")).await?;
    Ok(committed.map(|()| results))
}

async fn run_statement(client: &mut SqlClient, sql: &str, values: Vec<Value>) -> Result<QueryResult> {
    let mut query = Query::new(sql.to_string());
    for value in values {
        bind(&mut query, value);
    }

    if !produces_rows(sql) {
        let result = query.execute(client).await.map_err(Error::query)?;
        return Ok(QueryResult {
            rows_affected: result.total(),
            ..QueryResult::empty()
        });
    }

    let mut stream = query.query(client).await.map_err(Error::query)?;
    let columns: Vec<String> = stream
        .columns()
        .await
        .map_err(Error::query)?
        .map(|cols| cols.iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();

    let mut rows = Vec::new();
    for row in stream.into_first_result().await.map_err(Error::query)? {
        rows.push(
            row.into_iter()
                .map(extract_value)
                .collect::<Result<Vec<_>>>()?,
        );
    }

    Ok(QueryResult {
        columns,
        rows,
        ..QueryResult::empty()
    })
}

fn bind(query: &mut Query<'_>, value: Value) {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Integer(v) => query.bind(v),
        Value::Float(v) => query.bind(v),
        Value::Text(v) => query.bind(v),
        Value::Boolean(v) => query.bind(v),
        Value::Binary(v) => query.bind(v),
        Value::Timestamp(v) => query.bind(v),
    }
}

fn extract_value(data: ColumnData<'static>) -> Result<Value> {
    let value = match &data {
        ColumnData::U8(v) => v.map(Value::from),
        ColumnData::I16(v) => v.map(Value::from),
        ColumnData::I32(v) => v.map(Value::from),
        ColumnData::I64(v) => v.map(Value::Integer),
        ColumnData::F32(v) => v.map(Value::from),
        ColumnData::F64(v) => v.map(Value::Float),
        ColumnData::Bit(v) => v.map(Value::Boolean),
        ColumnData::String(v) => v.as_ref().map(|s| Value::Text(s.to_string())),
        ColumnData::Guid(v) => v.as_ref().map(|g| Value::Text(g.to_string())),
        ColumnData::Binary(v) => v.as_ref().map(|b| Value::Binary(b.to_vec())),
        ColumnData::Numeric(v) => v.as_ref().map(|n| Value::Text(n.to_string())),
        ColumnData::Xml(v) => v
            .as_ref()
            .map(|x| Value::Text(x.clone().into_owned().into_string())),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            NaiveDateTime::from_sql(&data)
                .map_err(Error::query)?
                .map(Value::Timestamp)
        }
        ColumnData::Date(_) => NaiveDate::from_sql(&data)
            .map_err(Error::query)?
            .map(|d| Value::Text(d.format("%Y-%m-%d").to_string())),
        ColumnData::Time(_) => NaiveTime::from_sql(&data)
            .map_err(Error::query)?
            .map(|t| Value::Text(t.format("%H:%M:%S%.f").to_string())),
        ColumnData::DateTimeOffset(_) => DateTime::<FixedOffset>::from_sql(&data)
            .map_err(Error::query)?
            .map(|t| Value::Text(t.to_rfc3339())),
    };
    Ok(value.unwrap_or(Value::Null))
}

#[async_trait]
impl DatabaseClient for SqlServerClient {
    fn backend(&self) -> BackendKind {
        BackendKind::SqlServer
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
        let statement = NamedQuery::parse(sql).compile(PlaceholderStyle::AtP, params)?;

        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or(Error::Closed)?;
        let start = Instant::now();

        match run_in_transaction(client, self.command_timeout, self.echo, vec![statement]).await {
            Ok(results) => {
                let mut result = results?.pop().unwrap_or_else(QueryResult::empty);
                result.execution_time = start.elapsed();
                Ok(result)
            }
            Err(timed_out) => Err(discard(&mut *guard, &self.closed, timed_out)),
        }
    }

    async fn execute_many(&self, sql: &str, params_list: &[Params]) -> Result<u64> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let query = NamedQuery::parse(sql);
        let batches = params_list
            .iter()
            .map(|params| query.compile(PlaceholderStyle::AtP, params))
            .collect::<Result<Vec<_>>>()?;

        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or(Error::Closed)?;

        match run_in_transaction(client, self.command_timeout, self.echo, batches).await {
            Ok(results) => Ok(results?.iter().map(|r| r.rows_affected).sum()),
            Err(timed_out) => Err(discard(&mut *guard, &self.closed, timed_out)),
        }
    }

    async fn close(&self) -> Result<()> {
        let client = self.client.lock().await.take();
        self.closed.store(true, Ordering::Release);
        if let Some(client) = client {
            client.close().await.map_err(Error::connection)?;
            tracing::info!(backend = %BackendKind::SqlServer, "closed connection");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_for(config: SqlServerConfig) -> OdbcSettings {
        let pairs = connection_url::odbc_params(&config.connection_url()).unwrap();
        OdbcSettings::parse(&pairs).unwrap()
    }

    #[test]
    fn test_settings_from_config_url() {
        let settings = settings_for(
            SqlServerConfig::new("tcp:db.internal,1444", "core").credentials("app", "p@ss;word"),
        );
        assert_eq!(settings.host, "db.internal");
        assert_eq!(settings.port, Some(1444));
        assert_eq!(settings.database.as_deref(), Some("core"));
        assert_eq!(settings.username.as_deref(), Some("app"));
        assert_eq!(settings.password.as_deref(), Some("p@ss;word"));
        assert!(settings.trust_cert);
        assert!(!settings.encrypt);
        assert_eq!(settings.connection_timeout, Duration::from_secs(30));
        assert_eq!(settings.command_timeout, Duration::from_secs(30));
        assert!(settings.tiberius_config().is_ok());
    }

    #[test]
    fn test_named_instance() {
        let settings =
            settings_for(SqlServerConfig::new(r"sqlhost\REPORTING", "core").credentials("app", "x"));
        assert_eq!(settings.host, "sqlhost");
        assert_eq!(settings.instance.as_deref(), Some("REPORTING"));
        assert_eq!(settings.port, None);
    }

    #[test]
    fn test_trusted_connection_is_rejected() {
        let settings = settings_for(SqlServerConfig::new("localhost", "core").trusted());
        assert!(settings.trusted);
        assert!(matches!(settings.tiberius_config(), Err(Error::Connection(_))));
    }

    #[test]
    fn test_missing_server() {
        let pairs = vec![("database".to_string(), "core".to_string())];
        assert!(matches!(OdbcSettings::parse(&pairs), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_produces_rows() {
        assert!(produces_rows("SELECT * FROM users"));
        assert!(produces_rows("  with t as (select 1 x) select x from t"));
        assert!(produces_rows("INSERT INTO users (name) OUTPUT INSERTED.id VALUES (@P1)"));
        assert!(!produces_rows("INSERT INTO users (name) VALUES (@P1)"));
        assert!(!produces_rows("UPDATE users SET age = @P1"));
        assert!(!produces_rows(""));
    }

    #[tokio::test]
    async fn test_bounded_distinguishes_timeout_from_failure() {
        let stalled =
            bounded(Duration::from_millis(10), "running a statement", std::future::pending::<Result<()>>()).await;
        let timed_out = stalled.unwrap_err();
        assert_eq!(timed_out.what, "running a statement");

        let failed = bounded(Duration::from_secs(5), "committing", async {
            Err::<(), _>(Error::Query("deadlock".into()))
        })
        .await;
        assert!(matches!(failed, Ok(Err(Error::Query(_)))));

        let connecting =
            with_timeout(Duration::from_millis(10), "connecting", std::future::pending::<Result<()>>()).await;
        assert!(matches!(connecting, Err(Error::Connection(_))));
    }

    #[test]
    fn test_timeout_discards_connection() {
        let mut slot = Some("tds stream");
        let closed = AtomicBool::new(false);
        let timed_out = TimedOut {
            after: Duration::from_secs(30),
            what: "committing",
        };

        let err = discard(&mut slot, &closed, timed_out);
        assert!(slot.is_none());
        assert!(closed.load(Ordering::Acquire));
        match err {
            Error::Connection(message) => {
                assert!(message.contains("after 30s while committing"));
                assert!(message.contains("connection discarded"));
            }
            other => panic!("expected a connection error, got {:?}", other),
        }
    }

    #[test]
    fn test_extract_value() {
        assert_eq!(extract_value(ColumnData::I32(Some(7))).unwrap(), Value::Integer(7));
        assert_eq!(extract_value(ColumnData::I64(None)).unwrap(), Value::Null);
        assert_eq!(extract_value(ColumnData::Bit(Some(true))).unwrap(), Value::Boolean(true));
        assert_eq!(
            extract_value(ColumnData::String(Some("Alice".into()))).unwrap(),
            Value::Text("Alice".into())
        );
        assert_eq!(
            extract_value(ColumnData::Binary(Some(vec![1u8, 2].into()))).unwrap(),
            Value::Binary(vec![1, 2])
        );
    }
}
