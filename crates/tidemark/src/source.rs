//! Reading from the source table
//!
//! [`TableReader`] is the seam between the extraction loop and a database:
//! it answers metadata lookups and runs planned queries. [`RdbcReader`]
//! implements it over a single lazily-opened connection, dropping the handle
//! when an error indicates the session is gone so the next attempt reconnects.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tidemark_rdbc::connection::{Connection, ConnectionConfig, ConnectionFactory};
use tidemark_rdbc::dialect::SqlDialect;
use tidemark_rdbc::schema::SchemaProvider;
use tidemark_rdbc::types::{Row, TableMetadata};
use tracing::{debug, info, warn};

use crate::planner::Query;

/// A table, optionally qualified by schema (database for MySQL)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    /// Schema or database
    pub schema: Option<String>,
    /// Table name
    pub name: String,
}

impl TableRef {
    /// Unqualified table
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }

    /// Set the qualifying schema
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Source of rows for one extraction job
#[async_trait]
pub trait TableReader: Send + Sync {
    /// SQL dialect queries must be rendered in
    fn dialect(&self) -> &dyn SqlDialect;

    /// Table metadata, `None` when the table does not exist
    async fn table_metadata(
        &mut self,
        table: &TableRef,
    ) -> tidemark_rdbc::Result<Option<TableMetadata>>;

    /// Run a planned query
    async fn fetch(&mut self, query: &Query) -> tidemark_rdbc::Result<Vec<Row>>;

    /// Release the connection, if any
    async fn close(&mut self) -> tidemark_rdbc::Result<()> {
        Ok(())
    }
}

/// Reader over a `tidemark-rdbc` connection
pub struct RdbcReader {
    factory: Arc<dyn ConnectionFactory>,
    schema_provider: Box<dyn SchemaProvider>,
    dialect: Box<dyn SqlDialect>,
    config: ConnectionConfig,
    conn: Option<Box<dyn Connection>>,
}

impl RdbcReader {
    /// Create a reader; no connection is opened until first use
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        schema_provider: Box<dyn SchemaProvider>,
        dialect: Box<dyn SqlDialect>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            factory,
            schema_provider,
            dialect,
            config,
            conn: None,
        }
    }

    /// Whether a connection is currently held
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    async fn ensure_connected(&mut self) -> tidemark_rdbc::Result<()> {
        if self.conn.is_none() {
            let conn = self.factory.connect(&self.config).await?;
            info!(
                endpoint = %self.config.endpoint(),
                database_type = %self.factory.database_type(),
                "Opened source connection"
            );
            self.conn = Some(conn);
        }
        Ok(())
    }

    fn discard_if_broken<T>(
        &mut self,
        result: tidemark_rdbc::Result<T>,
    ) -> tidemark_rdbc::Result<T> {
        if let Err(e) = &result {
            if e.invalidates_connection() && self.conn.take().is_some() {
                warn!(error = %e, "Dropping source connection; next attempt reconnects");
            }
        }
        result
    }
}

#[async_trait]
impl TableReader for RdbcReader {
    fn dialect(&self) -> &dyn SqlDialect {
        self.dialect.as_ref()
    }

    async fn table_metadata(
        &mut self,
        table: &TableRef,
    ) -> tidemark_rdbc::Result<Option<TableMetadata>> {
        let result = match (self.ensure_connected().await, self.conn.as_deref()) {
            (Ok(()), Some(conn)) => {
                self.schema_provider
                    .get_table(conn, table.schema.as_deref(), &table.name)
                    .await
            }
            (Err(e), _) => Err(e),
            (Ok(()), None) => Err(tidemark_rdbc::Error::connection("connection not available")),
        };
        self.discard_if_broken(result)
    }

    async fn fetch(&mut self, query: &Query) -> tidemark_rdbc::Result<Vec<Row>> {
        debug!(sql = %query.sql, params = query.params.len(), "Executing query");
        let result = match (self.ensure_connected().await, self.conn.as_deref()) {
            (Ok(()), Some(conn)) => conn.query(&query.sql, &query.params).await,
            (Err(e), _) => Err(e),
            (Ok(()), None) => Err(tidemark_rdbc::Error::connection("connection not available")),
        };
        self.discard_if_broken(result)
    }

    async fn close(&mut self) -> tidemark_rdbc::Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().await?;
            debug!(endpoint = %self.config.endpoint(), "Closed source connection");
        }
        Ok(())
    }
}
