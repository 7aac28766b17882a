//! PostgreSQL client using tokio-postgres

use crate::config::PostgresConfig;
use crate::db::connection_url;
use crate::db::driver::{log_statement, DatabaseClient};
use crate::db::params::{NamedQuery, Params, PlaceholderStyle};
use crate::db::query::{QueryResult, Value};
use crate::db::BackendKind;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::{NoTls, Row, Transaction};

type BoxError = Box<dyn std::error::Error + Sync + Send>;

/// PostgreSQL client holding one connection
pub struct PostgresClient {
    client: Mutex<Option<tokio_postgres::Client>>,
    connection_task: Mutex<Option<JoinHandle<()>>>,
    url: String,
    echo: bool,
    closed: AtomicBool,
}

impl PostgresClient {
    pub async fn connect(config: PostgresConfig) -> Result<Self> {
        config.validate()?;
        let client = Self::open(&config.connection_url(), config.echo).await?;

        if config.schema != "public" {
            let statement = format!("SET search_path TO {}", quote_ident(&config.schema));
            let guard = client.client.lock().await;
            if let Some(conn) = guard.as_ref() {
                conn.batch_execute(&statement).await.map_err(Error::connection)?;
            }
        }

        Ok(client)
    }

    /// Connect using a `postgres://` or `postgresql://` URL
    pub async fn open(url: &str, echo: bool) -> Result<Self> {
        let driver_url = normalize_scheme(url);
        let (client, connection) = tokio_postgres::connect(&driver_url, NoTls)
            .await
            .map_err(Error::connection)?;

        // Spawn connection handler (required by tokio-postgres)
        let task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(backend = %BackendKind::PostgreSQL, error = %e, "connection error");
            }
        });

        tracing::info!(backend = %BackendKind::PostgreSQL, url = %connection_url::redact(url), "connected");

        Ok(Self {
            client: Mutex::new(Some(client)),
            connection_task: Mutex::new(Some(task)),
            url: url.to_string(),
            echo,
            closed: AtomicBool::new(false),
        })
    }
}

/// tokio-postgres only understands the bare scheme, not `postgresql+driver`
fn normalize_scheme(url: &str) -> String {
    match url.split_once("://") {
        Some((_, rest)) => format!("postgresql://{}", rest),
        None => url.to_string(),
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[async_trait]
impl DatabaseClient for PostgresClient {
    fn backend(&self) -> BackendKind {
        BackendKind::PostgreSQL
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
        let (sql, values) = NamedQuery::parse(sql).compile(PlaceholderStyle::Dollar, params)?;
        log_statement(BackendKind::PostgreSQL, self.echo, &sql, values.len());

        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or(Error::Closed)?;
        let start = Instant::now();

        let tx = client.transaction().await.map_err(Error::query)?;
        match run_statement(&tx, &sql, &values).await {
            Ok(mut result) => {
                tx.commit().await.map_err(Error::query)?;
                result.execution_time = start.elapsed();
                Ok(result)
            }
            Err(e) => {
                tracing::warn!(backend = %BackendKind::PostgreSQL, error = %e, "rolling back");
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
        let query = NamedQuery::parse(sql);
        let batches = params_list
            .iter()
            .map(|params| query.compile(PlaceholderStyle::Dollar, params))
            .collect::<Result<Vec<_>>>()?;

        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or(Error::Closed)?;

        let tx = client.transaction().await.map_err(Error::query)?;
        let mut affected = 0u64;
        for (sql, values) in &batches {
            log_statement(BackendKind::PostgreSQL, self.echo, sql, values.len());
            match run_statement(&tx, sql, values).await {
                Ok(result) => affected += result.rows_affected,
                Err(e) => {
                    tracing::warn!(backend = %BackendKind::PostgreSQL, error = %e, "rolling back batch");
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
        let client = self.client.lock().await.take();
        self.closed.store(true, Ordering::Release);
        // Dropping the client ends the connection future
        drop(client);
        if let Some(task) = self.connection_task.lock().await.take() {
            task.abort();
            tracing::info!(backend = %BackendKind::PostgreSQL, "closed connection");
        }
        Ok(())
    }
}

async fn run_statement(tx: &Transaction<'_>, sql: &str, values: &[Value]) -> Result<QueryResult> {
    let stmt = tx.prepare(sql).await.map_err(Error::query)?;
    let args: Vec<PgParam<'_>> = values.iter().map(PgParam).collect();
    let refs: Vec<&(dyn ToSql + Sync)> = args.iter().map(|a| a as &(dyn ToSql + Sync)).collect();

    if stmt.columns().is_empty() {
        let affected = tx.execute(&stmt, &refs).await.map_err(Error::query)?;
        return Ok(QueryResult {
            rows_affected: affected,
            ..QueryResult::empty()
        });
    }

    let columns: Vec<String> = stmt.columns().iter().map(|c| c.name().to_string()).collect();
    let raw_rows = tx.query(&stmt, &refs).await.map_err(Error::query)?;

    let mut rows = Vec::with_capacity(raw_rows.len());
    for row in &raw_rows {
        let mut row_data = Vec::with_capacity(columns.len());
        for (i, column) in row.columns().iter().enumerate() {
            row_data.push(extract_value(row, i, column.type_())?);
        }
        rows.push(row_data);
    }

    Ok(QueryResult {
        columns,
        rows,
        ..QueryResult::empty()
    })
}

fn extract_value(row: &Row, index: usize, ty: &Type) -> Result<Value> {
    fn get<'a, T: tokio_postgres::types::FromSql<'a>>(row: &'a Row, index: usize) -> Result<Option<T>> {
        row.try_get::<_, Option<T>>(index).map_err(Error::query)
    }

    let value = match *ty {
        Type::BOOL => get::<bool>(row, index)?.map(Value::Boolean),
        Type::CHAR => get::<i8>(row, index)?.map(Value::from),
        Type::INT2 => get::<i16>(row, index)?.map(Value::from),
        Type::INT4 => get::<i32>(row, index)?.map(Value::from),
        Type::INT8 => get::<i64>(row, index)?.map(Value::Integer),
        Type::OID => get::<u32>(row, index)?.map(Value::from),
        Type::FLOAT4 => get::<f32>(row, index)?.map(Value::from),
        Type::FLOAT8 => get::<f64>(row, index)?.map(Value::Float),
        Type::NUMERIC => get::<Decimal>(row, index)?.map(|v| Value::Text(v.to_string())),
        Type::BYTEA => get::<Vec<u8>>(row, index)?.map(Value::Binary),
        Type::TIMESTAMP => get::<NaiveDateTime>(row, index)?.map(Value::Timestamp),
        Type::TIMESTAMPTZ => get::<DateTime<Utc>>(row, index)?.map(|v| Value::Timestamp(v.naive_utc())),
        Type::DATE => get::<NaiveDate>(row, index)?.map(|v| Value::Text(v.format("%Y-%m-%d").to_string())),
        Type::TIME => get::<NaiveTime>(row, index)?.map(|v| Value::Text(v.format("%H:%M:%S%.f").to_string())),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            get::<String>(row, index)?.map(Value::Text)
        }
        _ => match row.try_get::<_, Option<String>>(index) {
            Ok(v) => v.map(Value::Text),
            Err(_) => {
                return Err(Error::Query(format!(
                    "unsupported column type {} for column {}",
                    ty,
                    row.columns()[index].name()
                )))
            }
        },
    };
    Ok(value.unwrap_or(Value::Null))
}

/// Binds a [`Value`] to whatever type the server inferred for the parameter
#[derive(Debug)]
struct PgParam<'a>(&'a Value);

impl ToSql for PgParam<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
        match self.0 {
            Value::Null => Ok(IsNull::Yes),
            Value::Integer(v) => match *ty {
                Type::INT2 => i16::try_from(*v)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*v)?.to_sql(ty, out),
                Type::INT8 => v.to_sql(ty, out),
                Type::OID => u32::try_from(*v)?.to_sql(ty, out),
                Type::FLOAT4 => (*v as f32).to_sql(ty, out),
                Type::FLOAT8 => (*v as f64).to_sql(ty, out),
                Type::NUMERIC => Decimal::from(*v).to_sql(ty, out),
                Type::BOOL => (*v != 0).to_sql(ty, out),
                Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
                    v.to_string().to_sql(ty, out)
                }
                _ => Err(mismatch("integer", ty)),
            },
            Value::Float(v) => match *ty {
                Type::FLOAT4 => (*v as f32).to_sql(ty, out),
                Type::FLOAT8 => v.to_sql(ty, out),
                Type::NUMERIC => Decimal::try_from(*v)?.to_sql(ty, out),
                Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::UNKNOWN => v.to_string().to_sql(ty, out),
                _ => Err(mismatch("float", ty)),
            },
            Value::Text(v) => match *ty {
                Type::NUMERIC => v.parse::<Decimal>()?.to_sql(ty, out),
                _ if <&str as ToSql>::accepts(ty) => v.as_str().to_sql(ty, out),
                _ => Err(mismatch("text", ty)),
            },
            Value::Boolean(v) => match *ty {
                Type::BOOL => v.to_sql(ty, out),
                Type::INT2 => (*v as i16).to_sql(ty, out),
                Type::INT4 => (*v as i32).to_sql(ty, out),
                Type::INT8 => (*v as i64).to_sql(ty, out),
                _ => Err(mismatch("boolean", ty)),
            },
            Value::Binary(v) => match *ty {
                Type::BYTEA => v.to_sql(ty, out),
                _ => Err(mismatch("binary", ty)),
            },
            Value::Timestamp(v) => match *ty {
                Type::TIMESTAMP => v.to_sql(ty, out),
                Type::TIMESTAMPTZ => DateTime::<Utc>::from_naive_utc_and_offset(*v, Utc).to_sql(ty, out),
                Type::DATE => v.date().to_sql(ty, out),
                _ => Err(mismatch("timestamp", ty)),
            },
        }
    }

    fn accepts(_: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn mismatch(kind: &str, ty: &Type) -> BoxError {
    format!("cannot bind {} parameter to a column of type {}", kind, ty).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: &Value, ty: &Type) -> std::result::Result<Vec<u8>, BoxError> {
        let mut out = BytesMut::new();
        PgParam(value).to_sql(ty, &mut out)?;
        Ok(out.to_vec())
    }

    #[test]
    fn test_integer_follows_inferred_width() {
        assert_eq!(encode(&Value::Integer(7), &Type::INT4).unwrap(), 7i32.to_be_bytes());
        assert_eq!(encode(&Value::Integer(7), &Type::INT2).unwrap(), 7i16.to_be_bytes());
        assert_eq!(encode(&Value::Integer(7), &Type::INT8).unwrap(), 7i64.to_be_bytes());
        assert!(encode(&Value::Integer(70_000), &Type::INT2).is_err());
    }

    #[test]
    fn test_text_binds_to_string_types() {
        assert_eq!(encode(&Value::from("abc"), &Type::VARCHAR).unwrap(), b"abc");
        assert!(encode(&Value::from("abc"), &Type::INT4).is_err());
    }

    #[test]
    fn test_null_binds_to_anything() {
        let mut out = BytesMut::new();
        let is_null = PgParam(&Value::Null).to_sql(&Type::INT4, &mut out).unwrap();
        assert!(matches!(is_null, IsNull::Yes));
    }

    #[test]
    fn test_schema_identifier_is_quoted() {
        assert_eq!(quote_ident("sales"), "\"sales\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_normalize_scheme() {
        assert_eq!(normalize_scheme("postgres://u@h/db"), "postgresql://u@h/db");
        assert_eq!(normalize_scheme("postgresql+psycopg2://u@h/db"), "postgresql://u@h/db");
    }
}
