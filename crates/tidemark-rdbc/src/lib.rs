//! # tidemark-rdbc
//!
//! Relational database connectivity for tidemark.
//!
//! This crate provides the database-facing half of an extraction job: a value
//! model with key ordering, connection traits, SQL dialects and catalog
//! introspection.
//!
//! ## Features
//!
//! - **Value model**: typed column values with the ordering databases apply to `ORDER BY`
//! - **Error taxonomy**: transient (connection, timeout, lock) vs permanent failures
//! - **SQL dialects**: quoting, placeholders and catalog queries for MySQL and PostgreSQL
//! - **Schema discovery**: primary key lookup through `information_schema`
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tidemark_rdbc::prelude::*;
//! use tidemark_rdbc::mysql::MySqlConnectionFactory;
//!
//! let config = ConnectionConfig::new("localhost", 3306, "shop")
//!     .with_credentials("reader", Some(password));
//! let conn = MySqlConnectionFactory::new().connect(&config).await?;
//!
//! let provider = InformationSchemaProvider::new(Box::new(MySqlDialect));
//! let pk = provider.get_primary_key(conn.as_ref(), Some("shop"), "orders").await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `mysql` - MySQL/MariaDB support via mysql_async (default)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod connection;
pub mod dialect;
pub mod error;
pub mod schema;
pub mod security;
pub mod types;

#[cfg(feature = "mysql")]
pub mod mysql;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{Error, ErrorCategory, Result};

    pub use crate::types::{ColumnMetadata, Row, TableMetadata, Value};

    pub use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, DatabaseType};

    pub use crate::dialect::{dialect_for, MySqlDialect, PostgresDialect, SqlDialect};

    pub use crate::schema::{InformationSchemaProvider, SchemaProvider};

    pub use crate::security::{escape_string_literal, validate_sql_identifier};
}

pub use error::{Error, Result};
pub use types::Value;

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_prelude_imports() {
        let _value = Value::Int32(42);
        let config = ConnectionConfig::new("localhost", 3306, "shop");
        assert_eq!(config.endpoint(), "localhost:3306/shop");
    }

    #[test]
    fn test_error_types() {
        let err = Error::connection("test error");
        assert!(err.is_retriable());
        assert_eq!(err.category(), ErrorCategory::Connection);
    }

    #[test]
    fn test_dialect_selection() {
        let mysql = dialect_for("mysql").unwrap();
        assert_eq!(mysql.name(), "MySQL");
        assert_eq!(mysql.quote_identifier("id"), "`id`");
    }
}
