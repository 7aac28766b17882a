//! Client factory
//!
//! Maps a [`BackendKind`] to the constructor that opens a client for it.
//! The built-in drivers are registered in one place,
//! [`ClientFactory::with_default_backends`]; [`ClientFactory::global`] is a
//! process-wide instance built from it and never mutated afterwards.

use crate::config::{ConnectionConfig, GenericConfig};
use crate::db::driver::DatabaseClient;
use crate::db::generic;
use crate::db::BackendKind;
use crate::error::{Error, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Future returned by a constructor
pub type ClientFuture = BoxFuture<'static, Result<Box<dyn DatabaseClient>>>;

/// Opens a client from a validated config of the kind it was registered for
pub type Constructor = Arc<dyn Fn(ConnectionConfig) -> ClientFuture + Send + Sync>;

static GLOBAL: Lazy<ClientFactory> = Lazy::new(ClientFactory::with_default_backends);

#[derive(Clone, Default)]
pub struct ClientFactory {
    constructors: HashMap<BackendKind, Constructor>,
}

impl ClientFactory {
    /// An empty factory
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory with every driver compiled into this build
    pub fn with_default_backends() -> Self {
        let mut factory = Self::new();

        #[cfg(feature = "sqlite")]
        factory.register(BackendKind::SQLite, |config| async move {
            match config {
                ConnectionConfig::SQLite(c) => {
                    let client = crate::db::sqlite::SqliteClient::connect(c).await?;
                    Ok(Box::new(client) as Box<dyn DatabaseClient>)
                }
                other => Err(mismatch(BackendKind::SQLite, &other)),
            }
        });

        #[cfg(feature = "postgres")]
        factory.register(BackendKind::PostgreSQL, |config| async move {
            match config {
                ConnectionConfig::PostgreSQL(c) => {
                    let client = crate::db::postgres::PostgresClient::connect(c).await?;
                    Ok(Box::new(client) as Box<dyn DatabaseClient>)
                }
                other => Err(mismatch(BackendKind::PostgreSQL, &other)),
            }
        });

        #[cfg(feature = "mysql")]
        factory.register(BackendKind::MySQL, |config| async move {
            match config {
                ConnectionConfig::MySQL(c) => {
                    let client = crate::db::mysql::MySqlClient::connect(c).await?;
                    Ok(Box::new(client) as Box<dyn DatabaseClient>)
                }
                other => Err(mismatch(BackendKind::MySQL, &other)),
            }
        });

        #[cfg(feature = "mssql")]
        factory.register(BackendKind::SqlServer, |config| async move {
            match config {
                ConnectionConfig::SqlServer(c) => {
                    let client = crate::db::sqlserver::SqlServerClient::connect(c).await?;
                    Ok(Box::new(client) as Box<dyn DatabaseClient>)
                }
                other => Err(mismatch(BackendKind::SqlServer, &other)),
            }
        });

        factory
    }

    /// The process-wide factory holding the built-in drivers
    pub fn global() -> &'static ClientFactory {
        &GLOBAL
    }

    /// Register `constructor` for `kind`.
    ///
    /// Registering a kind twice replaces the earlier constructor (last write
    /// wins); the replaced one is returned.
    pub fn register<F, Fut>(&mut self, kind: BackendKind, constructor: F) -> Option<Constructor>
    where
        F: Fn(ConnectionConfig) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Box<dyn DatabaseClient>>> + Send + 'static,
    {
        let constructor: Constructor = Arc::new(move |config| constructor(config).boxed());
        let previous = self.constructors.insert(kind, constructor);
        if previous.is_some() {
            tracing::warn!(backend = %kind, "replacing registered client constructor");
        } else {
            tracing::debug!(backend = %kind, "registered client constructor");
        }
        previous
    }

    /// Registered kinds, in declaration order
    pub fn registered(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<BackendKind> = self.constructors.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn is_registered(&self, kind: BackendKind) -> bool {
        self.constructors.contains_key(&kind)
    }

    /// Validate `config` and open a client through the constructor
    /// registered for `kind`
    pub async fn create(
        &self,
        kind: BackendKind,
        config: impl Into<ConnectionConfig>,
    ) -> Result<Box<dyn DatabaseClient>> {
        let config = config.into();
        if config.kind() != kind {
            return Err(mismatch(kind, &config));
        }

        let constructor = self
            .constructors
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::UnsupportedBackend {
                requested: kind.to_string(),
                available: self.registered().iter().map(|k| k.to_string()).collect(),
            })?;

        config.validate()?;
        tracing::debug!(backend = %kind, "creating client");
        constructor(config).await
    }

    /// Open a client directly from a URL, bypassing the registry
    pub async fn from_url(&self, url: &str, echo: bool) -> Result<Box<dyn DatabaseClient>> {
        generic::open_url(GenericConfig::new(url).echo(echo)).await
    }
}

impl fmt::Debug for ClientFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientFactory")
            .field("registered", &self.registered())
            .finish()
    }
}

fn mismatch(kind: BackendKind, config: &ConnectionConfig) -> Error {
    Error::Configuration(format!(
        "{} config passed for backend {}",
        config.kind(),
        kind
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PostgresConfig, SqlServerConfig, SqliteConfig};
    use crate::db::{Params, QueryResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct StubClient {
        kind: BackendKind,
        tag: &'static str,
        closed: AtomicBool,
    }

    impl StubClient {
        fn boxed(kind: BackendKind, tag: &'static str) -> Box<dyn DatabaseClient> {
            Box::new(Self {
                kind,
                tag,
                closed: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl DatabaseClient for StubClient {
        fn backend(&self) -> BackendKind {
            self.kind
        }

        fn connection_url(&self) -> &str {
            self.tag
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        async fn execute_query(&self, _sql: &str, _params: &Params) -> Result<QueryResult> {
            Ok(QueryResult::empty())
        }

        async fn execute_many(&self, _sql: &str, params_list: &[Params]) -> Result<u64> {
            Ok(params_list.len() as u64)
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn postgres_config() -> PostgresConfig {
        PostgresConfig::new("localhost", "app", "postgres", "secret")
    }

    #[tokio::test]
    async fn test_unregistered_kind_lists_registered() {
        let mut factory = ClientFactory::new();
        factory.register(BackendKind::SQLite, |_| async {
            Ok(StubClient::boxed(BackendKind::SQLite, "stub"))
        });

        let err = factory
            .create(BackendKind::PostgreSQL, postgres_config())
            .await
            .err()
            .unwrap();
        match err {
            Error::UnsupportedBackend { requested, available } => {
                assert_eq!(requested, "postgresql");
                assert_eq!(available, vec!["sqlite".to_string()]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_register_twice_last_write_wins() {
        let mut factory = ClientFactory::new();
        let first = factory.register(BackendKind::PostgreSQL, |_| async {
            Ok(StubClient::boxed(BackendKind::PostgreSQL, "first"))
        });
        assert!(first.is_none());

        let second = factory.register(BackendKind::PostgreSQL, |_| async {
            Ok(StubClient::boxed(BackendKind::PostgreSQL, "second"))
        });
        assert!(second.is_some());
        assert_eq!(factory.registered(), vec![BackendKind::PostgreSQL]);

        let client = factory
            .create(BackendKind::PostgreSQL, postgres_config())
            .await
            .unwrap();
        assert_eq!(client.connection_url(), "second");
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_constructor() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let mut factory = ClientFactory::new();
        factory.register(BackendKind::SqlServer, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(StubClient::boxed(BackendKind::SqlServer, "stub")) }
        });

        // credentials mode without a username
        let config = SqlServerConfig::new("localhost", "master");
        let result = factory.create(BackendKind::SqlServer, config).await;
        assert!(matches!(result, Err(Error::Configuration(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let config = SqlServerConfig::new("localhost", "master").credentials("sa", "pw");
        assert!(factory.create(BackendKind::SqlServer, config).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_kind_and_config_must_agree() {
        let mut factory = ClientFactory::new();
        factory.register(BackendKind::MySQL, |_| async {
            Ok(StubClient::boxed(BackendKind::MySQL, "stub"))
        });

        let result = factory.create(BackendKind::MySQL, postgres_config()).await;
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_default_backends_follow_features() {
        let factory = ClientFactory::with_default_backends();
        for kind in BackendKind::all() {
            assert_eq!(factory.is_registered(*kind), kind.is_compiled(), "{}", kind);
        }
        assert_eq!(ClientFactory::global().registered(), factory.registered());
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_global_creates_sqlite() {
        let client = ClientFactory::global()
            .create(BackendKind::SQLite, SqliteConfig::in_memory())
            .await
            .unwrap();
        assert_eq!(client.backend(), BackendKind::SQLite);
        client.close().await.unwrap();
        assert!(client.is_closed());
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_from_url_bypasses_registry() {
        let factory = ClientFactory::new();
        let client = factory.from_url("sqlite:///:memory:", false).await.unwrap();
        assert_eq!(client.backend(), BackendKind::SQLite);
    }
}
