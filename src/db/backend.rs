//! Backend identifiers

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Which database engine a client targets
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    SqlServer,
    PostgreSQL,
    MySQL,
    SQLite,
}

impl BackendKind {
    /// Stable lowercase identifier, also used in config files
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::SqlServer => "sqlserver",
            BackendKind::PostgreSQL => "postgresql",
            BackendKind::MySQL => "mysql",
            BackendKind::SQLite => "sqlite",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::SqlServer => "SQL Server",
            BackendKind::PostgreSQL => "PostgreSQL",
            BackendKind::MySQL => "MySQL",
            BackendKind::SQLite => "SQLite",
        }
    }

    /// Cargo feature that compiles this backend's driver
    pub fn feature_name(&self) -> &'static str {
        match self {
            BackendKind::SqlServer => "mssql",
            BackendKind::PostgreSQL => "postgres",
            BackendKind::MySQL => "mysql",
            BackendKind::SQLite => "sqlite",
        }
    }

    /// Whether this build carries the backend's driver
    pub fn is_compiled(&self) -> bool {
        match self {
            BackendKind::SqlServer => cfg!(feature = "mssql"),
            BackendKind::PostgreSQL => cfg!(feature = "postgres"),
            BackendKind::MySQL => cfg!(feature = "mysql"),
            BackendKind::SQLite => cfg!(feature = "sqlite"),
        }
    }

    pub fn default_port(&self) -> Option<u16> {
        match self {
            BackendKind::SqlServer => Some(1433),
            BackendKind::PostgreSQL => Some(5432),
            BackendKind::MySQL => Some(3306),
            BackendKind::SQLite => None,
        }
    }

    pub fn all() -> &'static [BackendKind] {
        &[
            BackendKind::SqlServer,
            BackendKind::PostgreSQL,
            BackendKind::MySQL,
            BackendKind::SQLite,
        ]
    }

    /// Resolve a URL scheme such as `postgres`, `mysql+pymysql` or `sqlite`.
    /// Anything after a `+` (a driver suffix) is ignored.
    pub fn from_scheme(scheme: &str) -> Option<BackendKind> {
        let base = scheme.split('+').next().unwrap_or(scheme);
        match base.to_ascii_lowercase().as_str() {
            "mssql" | "sqlserver" => Some(BackendKind::SqlServer),
            "postgres" | "postgresql" => Some(BackendKind::PostgreSQL),
            "mysql" | "mariadb" => Some(BackendKind::MySQL),
            "sqlite" => Some(BackendKind::SQLite),
            _ => None,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendKind::all()
            .iter()
            .copied()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::UnsupportedBackend {
                requested: s.to_string(),
                available: BackendKind::all().iter().map(|k| k.to_string()).collect(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_backend_names() {
        assert_eq!("sqlite".parse::<BackendKind>().unwrap(), BackendKind::SQLite);
        assert_eq!("PostgreSQL".parse::<BackendKind>().unwrap(), BackendKind::PostgreSQL);
        assert!("oracle".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_scheme_with_driver_suffix() {
        assert_eq!(BackendKind::from_scheme("mysql+pymysql"), Some(BackendKind::MySQL));
        assert_eq!(BackendKind::from_scheme("postgres"), Some(BackendKind::PostgreSQL));
        assert_eq!(BackendKind::from_scheme("mssql+odbc"), Some(BackendKind::SqlServer));
        assert_eq!(BackendKind::from_scheme("redis"), None);
    }

    #[test]
    fn test_serde_uses_lowercase_ids() {
        let json = serde_json::to_string(&BackendKind::SqlServer).unwrap();
        assert_eq!(json, "\"sqlserver\"");
    }
}
