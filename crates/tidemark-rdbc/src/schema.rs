//! Schema discovery for tidemark-rdbc
//!
//! Introspection runs over an already established [`Connection`] so that a
//! caller retrying transient failures handles metadata lookups and data
//! queries the same way.

use async_trait::async_trait;

use crate::connection::Connection;
use crate::dialect::SqlDialect;
use crate::error::Result;
use crate::types::{ColumnMetadata, Row, TableMetadata};

/// Read-only schema discovery
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    /// Get table metadata, `None` when the table does not exist
    async fn get_table(
        &self,
        conn: &dyn Connection,
        schema: Option<&str>,
        table: &str,
    ) -> Result<Option<TableMetadata>>;

    /// Get primary key columns for a table, in key order
    async fn get_primary_key(
        &self,
        conn: &dyn Connection,
        schema: Option<&str>,
        table: &str,
    ) -> Result<Vec<ColumnMetadata>> {
        let meta = self.get_table(conn, schema, table).await?;
        Ok(meta
            .map(|t| t.primary_key_columns().into_iter().cloned().collect())
            .unwrap_or_default())
    }
}

/// Schema provider backed by the `information_schema` catalog
pub struct InformationSchemaProvider {
    dialect: Box<dyn SqlDialect>,
}

impl InformationSchemaProvider {
    /// Create a provider issuing catalog queries in the given dialect
    pub fn new(dialect: Box<dyn SqlDialect>) -> Self {
        Self { dialect }
    }
}

#[async_trait]
impl SchemaProvider for InformationSchemaProvider {
    async fn get_table(
        &self,
        conn: &dyn Connection,
        schema: Option<&str>,
        table: &str,
    ) -> Result<Option<TableMetadata>> {
        let sql = self.dialect.list_columns_sql(schema, table);
        let rows = conn.query(&sql, &[]).await?;
        if rows.is_empty() {
            return Ok(None);
        }

        let mut meta = TableMetadata::new(table);
        meta.schema = schema.map(str::to_string);
        meta.columns = rows.iter().map(column_from_catalog_row).collect();
        tracing::debug!(
            table = %meta.qualified_name(),
            columns = meta.columns.len(),
            primary_key = ?meta.primary_key_columns().iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            "Loaded table metadata"
        );
        Ok(Some(meta))
    }
}

/// Decode one row of [`SqlDialect::list_columns_sql`] output
fn column_from_catalog_row(row: &Row) -> ColumnMetadata {
    let name = row.get(0).and_then(|v| v.as_string()).unwrap_or_default();
    let type_name = row.get(1).and_then(|v| v.as_string()).unwrap_or_default();

    let mut column = ColumnMetadata::new(name, type_name);
    column.nullable = row.get(2).and_then(|v| v.as_bool()).unwrap_or(true);
    column.ordinal = row
        .get(3)
        .and_then(|v| v.as_i64())
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0);
    column.primary_key_ordinal = row
        .get(4)
        .and_then(|v| v.as_i64())
        .and_then(|n| u32::try_from(n).ok());
    column.auto_increment = row.get(5).and_then(|v| v.as_bool()).unwrap_or(false);
    column
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::MySqlDialect;
    use crate::types::Value;

    struct CatalogConnection {
        rows: Vec<Row>,
    }

    #[async_trait]
    impl Connection for CatalogConnection {
        async fn query(&self, sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
            assert!(sql.contains("INFORMATION_SCHEMA.COLUMNS"));
            Ok(self.rows.clone())
        }

        async fn is_valid(&self) -> bool {
            true
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn catalog_row(name: &str, ordinal: i64, pk: Option<i64>) -> Row {
        Row::new(
            vec![
                "COLUMN_NAME".into(),
                "DATA_TYPE".into(),
                "nullable".into(),
                "ORDINAL_POSITION".into(),
                "pk_ordinal".into(),
                "auto_increment".into(),
            ],
            vec![
                Value::String(name.into()),
                Value::String("int".into()),
                Value::Int64(i64::from(pk.is_none())),
                Value::Int64(ordinal),
                pk.map(Value::Int64).unwrap_or(Value::Null),
                Value::Int64(0),
            ],
        )
    }

    #[tokio::test]
    async fn test_composite_primary_key_order() {
        let conn = CatalogConnection {
            rows: vec![
                catalog_row("line_no", 1, Some(2)),
                catalog_row("qty", 2, None),
                catalog_row("order_id", 3, Some(1)),
            ],
        };
        let provider = InformationSchemaProvider::new(Box::new(MySqlDialect));

        let pk = provider
            .get_primary_key(&conn, Some("shop"), "order_lines")
            .await
            .unwrap();
        let names: Vec<_> = pk.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["order_id", "line_no"]);

        let table = provider
            .get_table(&conn, Some("shop"), "order_lines")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(table.qualified_name(), "shop.order_lines");
        assert!(table.column("qty").unwrap().nullable);
        assert!(!table.column("order_id").unwrap().nullable);
    }

    #[tokio::test]
    async fn test_missing_table() {
        let conn = CatalogConnection { rows: vec![] };
        let provider = InformationSchemaProvider::new(Box::new(MySqlDialect));
        assert!(provider
            .get_table(&conn, None, "nope")
            .await
            .unwrap()
            .is_none());
        assert!(provider
            .get_primary_key(&conn, None, "nope")
            .await
            .unwrap()
            .is_empty());
    }
}
