//! MySQL / MariaDB client using mysql_async

use crate::config::MySqlConfig;
use crate::db::connection_url;
use crate::db::driver::{log_statement, DatabaseClient};
use crate::db::params::{NamedQuery, Params, PlaceholderStyle};
use crate::db::query::{QueryResult, Value};
use crate::db::BackendKind;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Timelike};
use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{Column, Opts, OptsBuilder, Pool, Row, TxOpts};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::Mutex;

/// `binary` collation id; string columns with it carry raw bytes
const BINARY_CHARSET: u16 = 63;

const DEFAULT_CHARSET: &str = "utf8mb4";

/// MySQL client backed by the driver's connection pool
pub struct MySqlClient {
    pool: Mutex<Option<Pool>>,
    url: String,
    echo: bool,
    closed: AtomicBool,
}

impl MySqlClient {
    pub async fn connect(config: MySqlConfig) -> Result<Self> {
        config.validate()?;
        Self::open(&config.connection_url(), config.echo).await
    }

    /// Connect using a `mysql://` URL; a `charset` query parameter is applied
    /// with `SET NAMES` on every pooled connection
    pub async fn open(url: &str, echo: bool) -> Result<Self> {
        let (driver_url, charset) = split_charset(url)?;
        let opts = Opts::from_url(&driver_url)
            .map_err(|e| Error::Connection(format!("Invalid MySQL URL: {}", e)))?;
        let opts = OptsBuilder::from_opts(opts).init(vec![format!("SET NAMES {}", charset)]);
        let pool = Pool::new(opts);

        // Fail fast when the server can't be reached
        let conn = pool.get_conn().await.map_err(Error::connection)?;
        drop(conn);

        tracing::info!(backend = %BackendKind::MySQL, url = %connection_url::redact(url), "connected");

        Ok(Self {
            pool: Mutex::new(Some(pool)),
            url: url.to_string(),
            echo,
            closed: AtomicBool::new(false),
        })
    }

    async fn pool(&self) -> Result<Pool> {
        self.pool.lock().await.clone().ok_or(Error::Closed)
    }
}

/// Strip `charset` (unknown to mysql_async) and normalize the scheme
fn split_charset(url: &str) -> Result<(String, String)> {
    let rest = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .ok_or_else(|| Error::Configuration(format!("invalid MySQL URL: {}", connection_url::redact(url))))?;

    let mut parsed = url::Url::parse(&format!("mysql://{}", rest))
        .map_err(|e| Error::Configuration(format!("invalid MySQL URL: {}", e)))?;

    let mut charset = DEFAULT_CHARSET.to_string();
    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter_map(|(key, value)| {
            if key == "charset" {
                charset = value.into_owned();
                None
            } else {
                Some((key.into_owned(), value.into_owned()))
            }
        })
        .collect();

    if charset.is_empty() || !charset.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::Configuration(format!("invalid MySQL charset: {:?}", charset)));
    }

    parsed.set_query(None);
    if !kept.is_empty() {
        parsed.query_pairs_mut().extend_pairs(kept);
    }
    Ok((parsed.to_string(), charset))
}

#[async_trait]
impl DatabaseClient for MySqlClient {
    fn backend(&self) -> BackendKind {
        BackendKind::MySQL
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
        let (sql, values) =
            NamedQuery::parse_backslash_escaped(sql).compile(PlaceholderStyle::Question, params)?;
        log_statement(BackendKind::MySQL, self.echo, &sql, values.len());

        let pool = self.pool().await?;
        let mut conn = pool.get_conn().await.map_err(Error::connection)?;
        let start = Instant::now();

        let mut tx = conn
            .start_transaction(TxOpts::default())
            .await
            .map_err(Error::query)?;
        match run_statement(&mut tx, &sql, values).await {
            Ok(mut result) => {
                tx.commit().await.map_err(Error::query)?;
                result.execution_time = start.elapsed();
                Ok(result)
            }
            Err(e) => {
                tracing::warn!(backend = %BackendKind::MySQL, error = %e, "rolling back");
                if let Err(rollback) = tx.rollback().await {
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
        let query = NamedQuery::parse_backslash_escaped(sql);
        let batches = params_list
            .iter()
            .map(|params| query.compile(PlaceholderStyle::Question, params))
            .collect::<Result<Vec<_>>>()?;

        let pool = self.pool().await?;
        let mut conn = pool.get_conn().await.map_err(Error::connection)?;

        let mut tx = conn
            .start_transaction(TxOpts::default())
            .await
            .map_err(Error::query)?;
        let mut affected = 0u64;
        for (sql, values) in batches {
            log_statement(BackendKind::MySQL, self.echo, &sql, values.len());
            match run_statement(&mut tx, &sql, values).await {
                Ok(result) => affected += result.rows_affected,
                Err(e) => {
                    tracing::warn!(backend = %BackendKind::MySQL, error = %e, "rolling back batch");
                    if let Err(rollback) = tx.rollback().await {
                        tracing::warn!(error = %rollback, "rollback failed");
                    }
                    return Err(e);
                }
            }
        }
        tx.commit().await.map_err(Error::query)?;
        Ok(affected)
    }

    async fn close(&self) -> Result<()> {
        let pool = self.pool.lock().await.take();
        self.closed.store(true, Ordering::Release);
        if let Some(pool) = pool {
            pool.disconnect().await.map_err(Error::connection)?;
            tracing::info!(backend = %BackendKind::MySQL, "closed pool");
        }
        Ok(())
    }
}

async fn run_statement(
    tx: &mut mysql_async::Transaction<'_>,
    sql: &str,
    values: Vec<Value>,
) -> Result<QueryResult> {
    let params = if values.is_empty() {
        mysql_async::Params::Empty
    } else {
        mysql_async::Params::Positional(values.into_iter().map(to_mysql).collect())
    };

    let mut result = tx.exec_iter(sql, params).await.map_err(Error::query)?;
    let columns_meta: Vec<Column> = result.columns_ref().to_vec();
    let raw_rows: Vec<Row> = result.collect().await.map_err(Error::query)?;
    let rows_affected = result.affected_rows();
    let last_insert_id = result.last_insert_id().map(|id| id as i64);
    drop(result);

    let columns = columns_meta
        .iter()
        .map(|c| c.name_str().into_owned())
        .collect();
    let rows = raw_rows
        .into_iter()
        .map(|row| {
            row.unwrap_raw()
                .into_iter()
                .zip(columns_meta.iter())
                .map(|(value, column)| match value {
                    Some(value) => from_mysql(value, column),
                    None => Value::Null,
                })
                .collect()
        })
        .collect();

    Ok(QueryResult {
        columns,
        rows,
        rows_affected,
        last_insert_id,
        ..QueryResult::empty()
    })
}

fn to_mysql(value: Value) -> mysql_async::Value {
    match value {
        Value::Null => mysql_async::Value::NULL,
        Value::Integer(v) => mysql_async::Value::Int(v),
        Value::Float(v) => mysql_async::Value::Double(v),
        Value::Text(v) => mysql_async::Value::Bytes(v.into_bytes()),
        Value::Boolean(v) => mysql_async::Value::Int(v as i64),
        Value::Binary(v) => mysql_async::Value::Bytes(v),
        Value::Timestamp(v) => mysql_async::Value::Date(
            v.year() as u16,
            v.month() as u8,
            v.day() as u8,
            v.hour() as u8,
            v.minute() as u8,
            v.second() as u8,
            v.nanosecond() / 1_000,
        ),
    }
}

fn from_mysql(value: mysql_async::Value, column: &Column) -> Value {
    match value {
        mysql_async::Value::NULL => Value::Null,
        mysql_async::Value::Int(v) => Value::Integer(v),
        mysql_async::Value::UInt(v) => i64::try_from(v)
            .map(Value::Integer)
            .unwrap_or_else(|_| Value::Text(v.to_string())),
        mysql_async::Value::Float(v) => Value::Float(v as f64),
        mysql_async::Value::Double(v) => Value::Float(v),
        mysql_async::Value::Bytes(bytes) => {
            if column.character_set() == BINARY_CHARSET && is_string_type(column.column_type()) {
                Value::Binary(bytes)
            } else {
                Value::Text(String::from_utf8_lossy(&bytes).into_owned())
            }
        }
        mysql_async::Value::Date(year, month, day, hour, minute, second, micros) => {
            let date = NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32);
            match (column.column_type(), date) {
                (ColumnType::MYSQL_TYPE_DATE, Some(date)) => {
                    Value::Text(date.format("%Y-%m-%d").to_string())
                }
                (_, Some(date)) => date
                    .and_hms_micro_opt(hour as u32, minute as u32, second as u32, micros)
                    .map(Value::Timestamp)
                    .unwrap_or(Value::Null),
                // zero dates such as 0000-00-00
                (_, None) => Value::Null,
            }
        }
        mysql_async::Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let hours = days * 24 + hours as u32;
            let sign = if negative { "-" } else { "" };
            Value::Text(format!(
                "{}{:02}:{:02}:{:02}.{:06}",
                sign, hours, minutes, seconds, micros
            ))
        }
    }
}

fn is_string_type(column_type: ColumnType) -> bool {
    matches!(
        column_type,
        ColumnType::MYSQL_TYPE_BLOB
            | ColumnType::MYSQL_TYPE_TINY_BLOB
            | ColumnType::MYSQL_TYPE_MEDIUM_BLOB
            | ColumnType::MYSQL_TYPE_LONG_BLOB
            | ColumnType::MYSQL_TYPE_STRING
            | ColumnType::MYSQL_TYPE_VAR_STRING
            | ColumnType::MYSQL_TYPE_VARCHAR
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_charset_removes_param() {
        let (url, charset) = split_charset("mysql://root:secret@db:3306/shop?charset=latin1").unwrap();
        assert_eq!(url, "mysql://root:secret@db:3306/shop");
        assert_eq!(charset, "latin1");
    }

    #[test]
    fn test_split_charset_keeps_other_params_and_default() {
        let (url, charset) =
            split_charset("mysql+pymysql://root@db/shop?pool_min=1").unwrap();
        assert_eq!(url, "mysql://root@db/shop?pool_min=1");
        assert_eq!(charset, "utf8mb4");
    }

    #[test]
    fn test_split_charset_rejects_injection() {
        assert!(split_charset("mysql://root@db/shop?charset=utf8%3B%20DROP").is_err());
    }

    #[test]
    fn test_timestamp_binds_as_date_value() {
        let ts = NaiveDate::from_ymd_opt(2024, 5, 6)
            .unwrap()
            .and_hms_micro_opt(7, 8, 9, 10)
            .unwrap();
        assert_eq!(
            to_mysql(Value::Timestamp(ts)),
            mysql_async::Value::Date(2024, 5, 6, 7, 8, 9, 10)
        );
        assert_eq!(to_mysql(Value::Boolean(true)), mysql_async::Value::Int(1));
        assert_eq!(
            to_mysql(Value::from("x")),
            mysql_async::Value::Bytes(b"x".to_vec())
        );
    }
}
