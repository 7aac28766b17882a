//! Database client abstraction
//!
//! Defines the interface that every backend client implements.

use crate::db::{BackendKind, Params, QueryResult};
use crate::error::Result;
use async_trait::async_trait;

/// One open connection (or driver pool) bound to one configuration.
///
/// Every call checks out the underlying connection for its own duration and
/// runs inside a transaction that commits on success and rolls back on any
/// error. This layer adds no locking beyond what a driver needs to hand out
/// its connection; callers that want parallelism should rely on a pooled
/// backend instead of sharing one client between many tasks.
///
/// After [`close`](DatabaseClient::close) every call fails with
/// [`Error::Closed`](crate::Error::Closed). Closing twice is a no-op.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// Which backend this client talks to
    fn backend(&self) -> BackendKind;

    /// The URL the client was opened with
    fn connection_url(&self) -> &str;

    fn is_closed(&self) -> bool;

    /// Run one statement with `:name` parameters bound from `params`
    async fn execute_query(&self, sql: &str, params: &Params) -> Result<QueryResult>;

    /// Run one statement per parameter set, all in a single transaction.
    /// Returns the total number of affected rows.
    async fn execute_many(&self, sql: &str, params_list: &[Params]) -> Result<u64>;

    /// Release the connection / pool
    async fn close(&self) -> Result<()>;
}

/// Log a statement before it is sent; `echo` promotes it to `info`
pub(crate) fn log_statement(backend: BackendKind, echo: bool, sql: &str, param_count: usize) {
    if echo {
        tracing::info!(target: "sql_explorer::echo", backend = %backend, params = param_count, "{}", sql);
    } else {
        tracing::debug!(backend = %backend, params = param_count, "executing: {}", sql);
    }
}
