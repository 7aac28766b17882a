//! Query explorer
//!
//! A thin layer over a [`DatabaseClient`] that always binds values as
//! parameters and hands rows back as [`ResultRow`]s.
//!
//! The table and column names accepted by [`DatabaseExplorer::find_by_id`],
//! [`DatabaseExplorer::find_all`], [`DatabaseExplorer::count`] and
//! [`DatabaseExplorer::exists`] are pasted into the SQL text as-is. They are
//! NOT sanitized and must only come from trusted call sites, never from end
//! user input. Only the values are bound.

use crate::config::{ConnectionConfig, DatabaseSettings, Settings};
use crate::db::{BackendKind, ClientFactory, DatabaseClient, Params, QueryResult, ResultRow, Value};
use crate::error::{Error, Result};

pub struct DatabaseExplorer {
    client: Box<dyn DatabaseClient>,
}

impl DatabaseExplorer {
    pub fn new(client: Box<dyn DatabaseClient>) -> Self {
        Self { client }
    }

    /// Open a client through the global factory
    pub async fn connect(kind: BackendKind, config: impl Into<ConnectionConfig>) -> Result<Self> {
        let client = ClientFactory::global().create(kind, config).await?;
        Ok(Self::new(client))
    }

    pub async fn from_url(url: &str, echo: bool) -> Result<Self> {
        let client = ClientFactory::global().from_url(url, echo).await?;
        Ok(Self::new(client))
    }

    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        match &settings.database {
            DatabaseSettings::Url(config) => Self::from_url(&config.url, config.echo).await,
            DatabaseSettings::Typed(config) => Self::connect(config.kind(), config.clone()).await,
        }
    }

    pub fn client(&self) -> &dyn DatabaseClient {
        self.client.as_ref()
    }

    pub fn backend(&self) -> BackendKind {
        self.client.backend()
    }

    /// Run a statement and return the raw result
    pub async fn execute(&self, sql: &str, params: &Params) -> Result<QueryResult> {
        self.client.execute_query(sql, params).await
    }

    /// Run a statement once per parameter set in a single transaction
    pub async fn execute_many(&self, sql: &str, params_list: &[Params]) -> Result<u64> {
        self.client.execute_many(sql, params_list).await
    }

    /// Every row of the result; empty when nothing matched
    pub async fn fetch_all(&self, sql: &str, params: &Params) -> Result<Vec<ResultRow>> {
        Ok(self.execute(sql, params).await?.into_records())
    }

    pub async fn fetch_one(&self, sql: &str, params: &Params) -> Result<Option<ResultRow>> {
        Ok(self.execute(sql, params).await?.into_first())
    }

    /// `SELECT * FROM {table} WHERE {id_column} = :id_value`
    pub async fn find_by_id(
        &self,
        table: &str,
        id_column: &str,
        id_value: impl Into<Value>,
    ) -> Result<Option<ResultRow>> {
        let sql = format!("SELECT * FROM {} WHERE {} = :id_value", table, id_column);
        self.fetch_one(&sql, &crate::params! { "id_value" => id_value.into() })
            .await
    }

    /// Every row of `table`, at most `limit` of them when given
    pub async fn find_all(&self, table: &str, limit: Option<u64>) -> Result<Vec<ResultRow>> {
        let sql = match (limit, self.backend()) {
            (Some(n), BackendKind::SqlServer) => format!("SELECT TOP ({}) * FROM {}", n, table),
            (Some(n), _) => format!("SELECT * FROM {} LIMIT {}", table, n),
            (None, _) => format!("SELECT * FROM {}", table),
        };
        self.fetch_all(&sql, &Params::new()).await
    }

    /// Number of rows in `table`
    pub async fn count(&self, table: &str) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) AS cnt FROM {}", table);
        let row = match self.fetch_one(&sql, &Params::new()).await? {
            Some(row) => row,
            None => return Ok(0),
        };

        match row.get("cnt") {
            Some(Value::Integer(n)) => Ok((*n).max(0) as u64),
            Some(Value::Text(s)) => s
                .parse()
                .map_err(|_| Error::Query(format!("COUNT(*) returned {:?}", s))),
            Some(Value::Null) | None => Ok(0),
            Some(other) => Err(Error::Query(format!("COUNT(*) returned {}", other))),
        }
    }

    /// Whether any row of `table` has `column = value`
    pub async fn exists(&self, table: &str, column: &str, value: impl Into<Value>) -> Result<bool> {
        let sql = match self.backend() {
            BackendKind::SqlServer => {
                format!("SELECT TOP 1 1 AS found FROM {} WHERE {} = :value", table, column)
            }
            _ => format!("SELECT 1 AS found FROM {} WHERE {} = :value LIMIT 1", table, column),
        };
        let row = self
            .fetch_one(&sql, &crate::params! { "value" => value.into() })
            .await?;
        Ok(row.is_some())
    }

    /// Close the underlying client
    pub async fn close(&self) -> Result<()> {
        self.client.close().await
    }
}
