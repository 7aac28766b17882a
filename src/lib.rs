//! SQL Explorer - Library
//! Parameterized query helpers over SQL Server, PostgreSQL, MySQL and SQLite
//!
//! ```no_run
//! use sql_explorer::{params, config::SqliteConfig, BackendKind, DatabaseExplorer};
//!
//! # async fn demo() -> sql_explorer::Result<()> {
//! let explorer = DatabaseExplorer::connect(BackendKind::SQLite, SqliteConfig::in_memory()).await?;
//! explorer.execute("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)", &params!()).await?;
//! explorer.execute("INSERT INTO users (name) VALUES (:name)", &params! { "name" => "Alice" }).await?;
//! assert_eq!(explorer.count("users").await?, 1);
//! explorer.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod explorer;

pub use config::{ConnectionConfig, GenericConfig, Settings};
pub use db::{BackendKind, ClientFactory, DatabaseClient, Params, QueryResult, ResultRow, Value};
pub use error::{Error, Result};
pub use explorer::DatabaseExplorer;
