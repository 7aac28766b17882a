//! Connection configuration
//!
//! One typed config per backend, a [`ConnectionConfig`] sum type that the
//! factory dispatches on, and [`Settings`] for loading a connection from a
//! TOML file or the environment.

use crate::db::BackendKind;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

fn default_odbc_driver() -> String {
    "ODBC Driver 17 for SQL Server".to_string()
}

fn default_true() -> bool {
    true
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_charset() -> String {
    "utf8mb4".to_string()
}

fn default_sqlite_path() -> String {
    ":memory:".to_string()
}

fn require(field: &str, value: &str, backend: BackendKind) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Configuration(format!(
            "{} requires a non-empty `{}`",
            backend.name(),
            field
        )));
    }
    Ok(())
}

/// SQL Server connection settings.
///
/// With `trusted_connection` the server's integrated authentication is
/// used and no credentials are needed. Otherwise both `username` and
/// `password` are required.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SqlServerConfig {
    pub server: String,
    pub database: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_odbc_driver")]
    pub driver: String,
    #[serde(default)]
    pub trusted_connection: bool,
    #[serde(default)]
    pub echo: bool,
    #[serde(default = "default_true")]
    pub mars_connection: bool,
}

impl SqlServerConfig {
    pub fn new(server: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            database: database.into(),
            username: None,
            password: None,
            driver: default_odbc_driver(),
            trusted_connection: false,
            echo: false,
            mars_connection: true,
        }
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn trusted(mut self) -> Self {
        self.trusted_connection = true;
        self
    }

    pub fn driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = driver.into();
        self
    }

    pub fn mars(mut self, enabled: bool) -> Self {
        self.mars_connection = enabled;
        self
    }

    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let kind = BackendKind::SqlServer;
        require("server", &self.server, kind)?;
        require("database", &self.database, kind)?;
        require("driver", &self.driver, kind)?;
        if !self.trusted_connection {
            let has_username = self
                .username
                .as_deref()
                .is_some_and(|u| !u.trim().is_empty());
            if !has_username {
                return Err(Error::Configuration(
                    "SQL Server credentials mode requires `username` (or set trusted_connection)".into(),
                ));
            }
            if self.password.is_none() {
                return Err(Error::Configuration(
                    "SQL Server credentials mode requires `password` (or set trusted_connection)".into(),
                ));
            }
        }
        Ok(())
    }
}

/// PostgreSQL connection settings
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PostgresConfig {
    pub host: String,
    pub database: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_postgres_port")]
    pub port: u16,
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default)]
    pub echo: bool,
}

impl PostgresConfig {
    pub fn new(
        host: impl Into<String>,
        database: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            database: database.into(),
            username: username.into(),
            password: password.into(),
            port: default_postgres_port(),
            schema: default_schema(),
            echo: false,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let kind = BackendKind::PostgreSQL;
        require("host", &self.host, kind)?;
        require("database", &self.database, kind)?;
        require("username", &self.username, kind)?;
        require("schema", &self.schema, kind)?;
        if self.port == 0 {
            return Err(Error::Configuration("PostgreSQL port must be non-zero".into()));
        }
        Ok(())
    }
}

/// MySQL / MariaDB connection settings
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MySqlConfig {
    pub host: String,
    pub database: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    #[serde(default = "default_charset")]
    pub charset: String,
    #[serde(default)]
    pub echo: bool,
}

impl MySqlConfig {
    pub fn new(
        host: impl Into<String>,
        database: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            database: database.into(),
            username: username.into(),
            password: password.into(),
            port: default_mysql_port(),
            charset: default_charset(),
            echo: false,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = charset.into();
        self
    }

    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let kind = BackendKind::MySQL;
        require("host", &self.host, kind)?;
        require("database", &self.database, kind)?;
        require("username", &self.username, kind)?;
        if self.port == 0 {
            return Err(Error::Configuration("MySQL port must be non-zero".into()));
        }
        // charset ends up in `SET NAMES`, so only plain identifiers are allowed
        if self.charset.is_empty()
            || !self.charset.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(Error::Configuration(format!(
                "invalid MySQL charset: {:?}",
                self.charset
            )));
        }
        Ok(())
    }
}

/// SQLite settings; `:memory:` is a private database that lives as long as
/// the client's single connection
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SqliteConfig {
    #[serde(default = "default_sqlite_path")]
    pub database_path: String,
    #[serde(default)]
    pub echo: bool,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            database_path: default_sqlite_path(),
            echo: false,
        }
    }
}

impl SqliteConfig {
    pub fn new(database_path: impl Into<String>) -> Self {
        Self {
            database_path: database_path.into(),
            echo: false,
        }
    }

    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn is_memory(&self) -> bool {
        self.database_path == ":memory:"
    }

    pub fn validate(&self) -> Result<()> {
        require("database_path", &self.database_path, BackendKind::SQLite)
    }
}

/// A ready-made URL passed straight to the driver
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GenericConfig {
    pub url: String,
    #[serde(default)]
    pub echo: bool,
}

impl GenericConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            echo: false,
        }
    }

    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(Error::Configuration("connection URL is empty".into()));
        }
        Ok(())
    }
}

/// Typed configuration for one backend
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum ConnectionConfig {
    SqlServer(SqlServerConfig),
    PostgreSQL(PostgresConfig),
    MySQL(MySqlConfig),
    SQLite(SqliteConfig),
}

impl ConnectionConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            ConnectionConfig::SqlServer(_) => BackendKind::SqlServer,
            ConnectionConfig::PostgreSQL(_) => BackendKind::PostgreSQL,
            ConnectionConfig::MySQL(_) => BackendKind::MySQL,
            ConnectionConfig::SQLite(_) => BackendKind::SQLite,
        }
    }

    pub fn echo(&self) -> bool {
        match self {
            ConnectionConfig::SqlServer(c) => c.echo,
            ConnectionConfig::PostgreSQL(c) => c.echo,
            ConnectionConfig::MySQL(c) => c.echo,
            ConnectionConfig::SQLite(c) => c.echo,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            ConnectionConfig::SqlServer(c) => c.validate(),
            ConnectionConfig::PostgreSQL(c) => c.validate(),
            ConnectionConfig::MySQL(c) => c.validate(),
            ConnectionConfig::SQLite(c) => c.validate(),
        }
    }
}

impl From<SqlServerConfig> for ConnectionConfig {
    fn from(config: SqlServerConfig) -> Self {
        ConnectionConfig::SqlServer(config)
    }
}

impl From<PostgresConfig> for ConnectionConfig {
    fn from(config: PostgresConfig) -> Self {
        ConnectionConfig::PostgreSQL(config)
    }
}

impl From<MySqlConfig> for ConnectionConfig {
    fn from(config: MySqlConfig) -> Self {
        ConnectionConfig::MySQL(config)
    }
}

impl From<SqliteConfig> for ConnectionConfig {
    fn from(config: SqliteConfig) -> Self {
        ConnectionConfig::SQLite(config)
    }
}

/// Where to connect: either a raw URL or a typed backend config
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum DatabaseSettings {
    Url(GenericConfig),
    Typed(ConnectionConfig),
}

/// Settings file contents
///
/// ```toml
/// [database]
/// backend = "postgresql"
/// host = "localhost"
/// database = "mydb"
/// username = "postgres"
/// password = "secret"
/// ```
///
/// or `[database]` with a single `url = "..."`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Settings {
    pub database: DatabaseSettings,
}

impl Settings {
    /// Default settings file path (`<config dir>/sql_explorer/config.toml`)
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Configuration("Could not find config directory".into()))?
            .join("sql_explorer");

        Ok(config_dir.join("config.toml"))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let settings: Self = toml::from_str(contents)
            .map_err(|e| Error::Configuration(format!("Failed to parse settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Build settings from `DATABASE_URL` / `DATABASE_ECHO`, reading `.env`
    /// first when one is present
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let url = std::env::var("DATABASE_URL")
            .map_err(|_| Error::Configuration("DATABASE_URL is not set".into()))?;
        let echo = std::env::var("DATABASE_ECHO")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let settings = Self {
            database: DatabaseSettings::Url(GenericConfig { url, echo }),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        match &self.database {
            DatabaseSettings::Url(c) => c.validate(),
            DatabaseSettings::Typed(c) => c.validate(),
        }
    }
}
