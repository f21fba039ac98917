//! SQL dialect abstraction for tidemark-rdbc
//!
//! Vendor differences the extraction queries care about:
//! - Identifier quoting (backticks vs double quotes)
//! - Parameter placeholders (`?` vs `$n`)
//! - Row limiting syntax
//! - Column and primary-key introspection queries

use crate::error::{Error, Result};
use crate::security::escape_string_literal;

/// SQL dialect for vendor-specific SQL generation
pub trait SqlDialect: Send + Sync {
    /// Get the dialect name
    fn name(&self) -> &'static str;

    /// Quote an identifier (table, column name)
    fn quote_identifier(&self, name: &str) -> String;

    /// Get the placeholder for the 1-based parameter `index`
    fn placeholder(&self, index: usize) -> String;

    /// Get the row limiting clause (with leading space), empty when unlimited
    fn limit_sql(&self, limit: Option<u64>) -> String {
        match limit {
            Some(l) => format!(" LIMIT {}", l),
            None => String::new(),
        }
    }

    /// Quote an optionally schema-qualified table reference
    fn qualified_table(&self, schema: Option<&str>, table: &str) -> String {
        match schema {
            Some(s) => format!(
                "{}.{}",
                self.quote_identifier(s),
                self.quote_identifier(table)
            ),
            None => self.quote_identifier(table),
        }
    }

    /// Get the SQL listing a table's columns with their primary key position
    ///
    /// Result columns, in order: name, data type, nullable flag, ordinal,
    /// primary key ordinal (NULL when not part of the key), auto increment flag.
    fn list_columns_sql(&self, schema: Option<&str>, table: &str) -> String;
}

/// PostgreSQL dialect
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn list_columns_sql(&self, schema: Option<&str>, table: &str) -> String {
        let schema = escape_string_literal(schema.unwrap_or("public"));
        let table = escape_string_literal(table);
        format!(
            r#"SELECT
                c.column_name,
                c.data_type,
                c.is_nullable = 'YES' AS nullable,
                c.ordinal_position,
                pk.ordinal_position AS pk_ordinal,
                c.column_default LIKE 'nextval(%' AS auto_increment
            FROM information_schema.columns c
            LEFT JOIN (
                SELECT ku.column_name, ku.ordinal_position
                FROM information_schema.table_constraints tc
                JOIN information_schema.key_column_usage ku
                    ON tc.constraint_name = ku.constraint_name
                    AND tc.table_schema = ku.table_schema
                WHERE tc.constraint_type = 'PRIMARY KEY'
                    AND tc.table_schema = '{schema}'
                    AND tc.table_name = '{table}'
            ) pk ON c.column_name = pk.column_name
            WHERE c.table_schema = '{schema}' AND c.table_name = '{table}'
            ORDER BY c.ordinal_position"#
        )
    }
}

/// MySQL dialect (also used for MariaDB)
#[derive(Debug, Clone, Default)]
pub struct MySqlDialect;

impl SqlDialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "MySQL"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn list_columns_sql(&self, schema: Option<&str>, table: &str) -> String {
        let db_filter = schema
            .map(|s| format!("'{}'", escape_string_literal(s)))
            .unwrap_or_else(|| "DATABASE()".to_string());
        let table = escape_string_literal(table);

        format!(
            r#"SELECT
                c.COLUMN_NAME,
                c.DATA_TYPE,
                c.IS_NULLABLE = 'YES' AS nullable,
                c.ORDINAL_POSITION,
                k.ORDINAL_POSITION AS pk_ordinal,
                c.EXTRA LIKE '%auto_increment%' AS auto_increment
            FROM INFORMATION_SCHEMA.COLUMNS c
            LEFT JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE k
                ON k.TABLE_SCHEMA = c.TABLE_SCHEMA
                AND k.TABLE_NAME = c.TABLE_NAME
                AND k.COLUMN_NAME = c.COLUMN_NAME
                AND k.CONSTRAINT_NAME = 'PRIMARY'
            WHERE c.TABLE_SCHEMA = {db_filter} AND c.TABLE_NAME = '{table}'
            ORDER BY c.ORDINAL_POSITION"#
        )
    }
}

/// Get a dialect instance by database type name
pub fn dialect_for(name: &str) -> Result<Box<dyn SqlDialect>> {
    match name.to_lowercase().as_str() {
        "postgres" | "postgresql" => Ok(Box::new(PostgresDialect)),
        "mysql" | "mariadb" => Ok(Box::new(MySqlDialect)),
        other => Err(Error::unsupported(format!("unknown SQL dialect '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_dialect() {
        let dialect = PostgresDialect;
        assert_eq!(dialect.quote_identifier("users"), "\"users\"");
        assert_eq!(dialect.quote_identifier("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(dialect.placeholder(3), "$3");
        assert_eq!(
            dialect.qualified_table(Some("shop"), "orders"),
            "\"shop\".\"orders\""
        );
    }

    #[test]
    fn test_mysql_dialect() {
        let dialect = MySqlDialect;
        assert_eq!(dialect.quote_identifier("users"), "`users`");
        assert_eq!(dialect.quote_identifier("we`ird"), "`we``ird`");
        assert_eq!(dialect.placeholder(7), "?");
        assert_eq!(dialect.qualified_table(None, "orders"), "`orders`");
    }

    #[test]
    fn test_limit_sql() {
        assert_eq!(MySqlDialect.limit_sql(Some(100)), " LIMIT 100");
        assert_eq!(MySqlDialect.limit_sql(None), "");
    }

    #[test]
    fn test_list_columns_escapes_names() {
        let sql = MySqlDialect.list_columns_sql(Some("shop"), "o'rders");
        assert!(sql.contains("'o''rders'"));
        assert!(sql.contains("CONSTRAINT_NAME = 'PRIMARY'"));

        let sql = MySqlDialect.list_columns_sql(None, "orders");
        assert!(sql.contains("DATABASE()"));
    }

    #[test]
    fn test_dialect_for() {
        assert_eq!(dialect_for("postgres").unwrap().name(), "PostgreSQL");
        assert_eq!(dialect_for("MariaDB").unwrap().name(), "MySQL");
        assert!(dialect_for("oracle").is_err());
    }
}
