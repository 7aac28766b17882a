//! Clients opened straight from a caller-supplied URL
//!
//! The URL scheme picks the driver; the typed configs and the factory's
//! registry are not involved.

use crate::config::GenericConfig;
use crate::db::connection_url;
use crate::db::driver::DatabaseClient;
use crate::db::BackendKind;
use crate::error::{Error, Result};

#[cfg(feature = "mysql")]
use crate::db::mysql::MySqlClient;
#[cfg(feature = "postgres")]
use crate::db::postgres::PostgresClient;
#[cfg(feature = "sqlite")]
use crate::db::sqlite::SqliteClient;
#[cfg(feature = "mssql")]
use crate::db::sqlserver::SqlServerClient;

/// Open a client for `config.url`, choosing the driver by URL scheme
pub async fn open_url(config: GenericConfig) -> Result<Box<dyn DatabaseClient>> {
    config.validate()?;
    let kind = connection_url::backend_for(&config.url)?;
    let url = config.url.as_str();

    tracing::debug!(backend = %kind, url = %connection_url::redact(url), "opening from URL");

    #[allow(unreachable_patterns)]
    let client: Box<dyn DatabaseClient> = match kind {
        #[cfg(feature = "sqlite")]
        BackendKind::SQLite => Box::new(SqliteClient::open(url, config.echo).await?),
        #[cfg(feature = "postgres")]
        BackendKind::PostgreSQL => Box::new(PostgresClient::open(url, config.echo).await?),
        #[cfg(feature = "mysql")]
        BackendKind::MySQL => Box::new(MySqlClient::open(url, config.echo).await?),
        #[cfg(feature = "mssql")]
        BackendKind::SqlServer => Box::new(SqlServerClient::open(url, config.echo).await?),
        other => return Err(not_compiled(other)),
    };
    Ok(client)
}

/// Error for a backend whose driver feature is off
pub(crate) fn not_compiled(kind: BackendKind) -> Error {
    Error::UnsupportedBackend {
        requested: format!("{} (build with feature \"{}\")", kind, kind.feature_name()),
        available: BackendKind::all()
            .iter()
            .filter(|k| k.is_compiled())
            .map(|k| k.to_string())
            .collect(),
    }
}
