//! Error type shared by every layer of the crate

use thiserror::Error;

/// Errors surfaced by configuration, the client factory, and the drivers.
///
/// Nothing is retried or recovered internally. Every variant except
/// [`Error::Closed`] leaves the client usable for the next call, apart from
/// a SQL Server timeout, which discards the connection.
#[derive(Error, Debug)]
pub enum Error {
    /// A required field is missing or invalid for the chosen backend
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The requested backend has no constructor in the registry
    #[error("Unsupported backend: {requested}. Available: {}", .available.join(", "))]
    UnsupportedBackend {
        requested: String,
        available: Vec<String>,
    },

    /// The driver rejected the URL or could not reach the server
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The statement failed; the enclosing transaction was rolled back
    #[error("Query failed: {0}")]
    Query(String),

    /// The client was closed
    #[error("Client is closed")]
    Closed,
}

impl Error {
    pub(crate) fn connection(err: impl std::fmt::Display) -> Self {
        Error::Connection(err.to_string())
    }

    pub(crate) fn query(err: impl std::fmt::Display) -> Self {
        Error::Query(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_backend_lists_available() {
        let err = Error::UnsupportedBackend {
            requested: "mysql".to_string(),
            available: vec!["sqlite".to_string(), "postgresql".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Unsupported backend: mysql. Available: sqlite, postgresql"
        );
    }
}
