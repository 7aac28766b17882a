//! Database module: client abstraction, value model and the per-backend drivers

mod backend;
pub mod connection_url;
mod driver;
pub mod generic;
mod params;
mod query;
mod registry;

#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;
#[cfg(feature = "mssql")]
pub mod sqlserver;

pub use backend::BackendKind;
pub use driver::DatabaseClient;
pub use params::{NamedQuery, Params, PlaceholderStyle};
pub use query::{QueryResult, ResultRow, Value};
pub use registry::{ClientFactory, ClientFuture, Constructor};

#[cfg(feature = "mysql")]
pub use mysql::MySqlClient;
#[cfg(feature = "postgres")]
pub use postgres::PostgresClient;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteClient;
#[cfg(feature = "mssql")]
pub use sqlserver::SqlServerClient;
