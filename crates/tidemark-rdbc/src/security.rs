//! Identifier and literal hygiene for generated SQL.
//!
//! Table and column names come from user configuration and end up inside
//! generated statements, so they are restricted to the unquoted identifier
//! alphabet shared by MySQL and PostgreSQL. Values never go through here:
//! they are always bound as parameters.

use crate::error::Error;

/// Longest identifier accepted (MySQL limit; PostgreSQL truncates at 63)
pub const MAX_IDENTIFIER_LEN: usize = 64;

/// Validate a SQL identifier (database, table or column name).
///
/// Rules:
/// - Must not be empty or longer than [`MAX_IDENTIFIER_LEN`]
/// - Must start with an ASCII letter or underscore
/// - May contain ASCII letters, digits, underscores and `$`
///
/// # Examples
///
/// ```
/// use tidemark_rdbc::security::validate_sql_identifier;
///
/// assert!(validate_sql_identifier("orders").is_ok());
/// assert!(validate_sql_identifier("order_lines_2024").is_ok());
/// assert!(validate_sql_identifier("x; DROP TABLE orders--").is_err());
/// assert!(validate_sql_identifier("9lives").is_err());
/// ```
pub fn validate_sql_identifier(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(Error::config("SQL identifier cannot be empty"));
    }

    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::config(format!(
            "SQL identifier too long: {} chars (max {})",
            name.len(),
            MAX_IDENTIFIER_LEN
        )));
    }

    let mut chars = name.chars();
    if !matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_') {
        return Err(Error::config(format!(
            "invalid SQL identifier '{}': must start with a letter or underscore",
            name
        )));
    }

    if let Some(bad) = chars.find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '$')) {
        return Err(Error::config(format!(
            "invalid SQL identifier '{}': contains invalid character '{}'",
            name, bad
        )));
    }

    Ok(())
}

/// Escape a string for a single-quoted SQL literal (`'` becomes `''`).
///
/// Only used for catalog lookups, which embed the table name in
/// `information_schema` filters.
///
/// ```
/// use tidemark_rdbc::security::escape_string_literal;
///
/// assert_eq!(escape_string_literal("orders"), "orders");
/// assert_eq!(escape_string_literal("o'rders"), "o''rders");
/// ```
pub fn escape_string_literal(value: &str) -> String {
    if !value.contains('\'') {
        return value.to_string();
    }
    value.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identifiers() {
        for name in ["orders", "_staging", "Order_Lines", "t$1", "a"] {
            assert!(validate_sql_identifier(name).is_ok(), "should accept '{name}'");
        }
        let longest = "a".repeat(MAX_IDENTIFIER_LEN);
        assert!(validate_sql_identifier(&longest).is_ok());
    }

    #[test]
    fn test_invalid_identifiers() {
        let too_long = "a".repeat(MAX_IDENTIFIER_LEN + 1);
        for name in [
            "",
            "1orders",
            "$orders",
            "orders;",
            "or ders",
            "shop.orders",
            "orders--",
            "ord`ers",
            "ord\"ers",
            "ordérs",
            too_long.as_str(),
        ] {
            assert!(validate_sql_identifier(name).is_err(), "should reject '{name}'");
        }
    }

    #[test]
    fn test_escape_string_literal() {
        assert_eq!(escape_string_literal(""), "");
        assert_eq!(escape_string_literal("don't"), "don''t");
        assert_eq!(escape_string_literal("' OR '1'='1"), "'' OR ''1''=''1");
    }
}
