//! Keyset range query planning
//!
//! Builds `SELECT <columns> FROM <table> [WHERE <range>] [ORDER BY <keys>] [LIMIT n]`
//! where the range selects rows whose key tuple is strictly greater than the
//! watermark under lexicographic order. For keys `(a, b, c)` and watermark
//! `(x, y, z)` the predicate is
//!
//! ```text
//! (a > x) OR (a = x AND b > y) OR (a = x AND b = y AND c > z)
//! ```
//!
//! Values are always bound as parameters.

use tidemark_rdbc::dialect::SqlDialect;
use tidemark_rdbc::Value;

use crate::error::{ExtractError, Result};
use crate::key::{KeySet, KeyTuple};
use crate::source::TableRef;

/// A rendered range query together with the bound it encodes
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// SQL text in the target dialect
    pub sql: String,
    /// Parameters in placeholder order
    pub params: Vec<Value>,
    /// Projection (empty = all columns)
    pub columns: Vec<String>,
    /// Ordering key
    pub keys: KeySet,
    /// Exclusive lower bound on the key tuple
    pub after: Option<KeyTuple>,
    /// Row limit
    pub limit: Option<u64>,
}

/// Build the next range query
///
/// With an empty key set the watermark is ignored and neither a predicate
/// nor an ordering is emitted. Otherwise the watermark must carry one value
/// per key column.
pub fn plan(
    table: &TableRef,
    columns: &[String],
    keys: &KeySet,
    watermark: Option<&KeyTuple>,
    limit: Option<u64>,
    dialect: &dyn SqlDialect,
) -> Result<Query> {
    let after = watermark.filter(|_| !keys.is_empty()).cloned();
    if let Some(bound) = &after {
        if bound.len() != keys.len() {
            return Err(ExtractError::Configuration(format!(
                "watermark {bound} has {} values for key {keys}",
                bound.len()
            )));
        }
    }

    let projection = if columns.is_empty() {
        "*".to_string()
    } else {
        columns
            .iter()
            .map(|c| dialect.quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut sql = format!(
        "SELECT {} FROM {}",
        projection,
        dialect.qualified_table(table.schema.as_deref(), &table.name)
    );
    let mut params = Vec::new();

    if let Some(bound) = &after {
        sql.push_str(" WHERE ");
        sql.push_str(&range_predicate(keys, bound, dialect, &mut params));
    }

    if !keys.is_empty() {
        let order = keys
            .columns()
            .iter()
            .map(|k| format!("{} ASC", dialect.quote_identifier(k)))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(" ORDER BY ");
        sql.push_str(&order);
    }

    sql.push_str(&dialect.limit_sql(limit));

    Ok(Query {
        sql,
        params,
        columns: columns.to_vec(),
        keys: keys.clone(),
        after,
        limit,
    })
}

fn range_predicate(
    keys: &KeySet,
    bound: &KeyTuple,
    dialect: &dyn SqlDialect,
    params: &mut Vec<Value>,
) -> String {
    let quoted: Vec<String> = keys
        .columns()
        .iter()
        .map(|k| dialect.quote_identifier(k))
        .collect();
    let pairs: Vec<(&String, &Value)> = quoted.iter().zip(bound.values()).collect();

    let groups: Vec<String> = (0..pairs.len())
        .map(|i| {
            let mut terms = Vec::with_capacity(i + 1);
            for (n, (column, value)) in pairs.iter().take(i + 1).enumerate() {
                params.push((*value).clone());
                let op = if n == i { ">" } else { "=" };
                terms.push(format!("{} {} {}", column, op, dialect.placeholder(params.len())));
            }
            terms.join(" AND ")
        })
        .collect();

    if groups.len() == 1 {
        groups.into_iter().collect()
    } else {
        groups
            .iter()
            .map(|g| format!("({g})"))
            .collect::<Vec<_>>()
            .join(" OR ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemark_rdbc::dialect::{MySqlDialect, PostgresDialect};

    fn orders() -> TableRef {
        TableRef::new("orders")
    }

    #[test]
    fn test_first_poll_has_no_predicate() {
        let q = plan(
            &orders(),
            &[],
            &KeySet::new(["id"]),
            None,
            Some(100_000),
            &MySqlDialect,
        )
        .unwrap();
        assert_eq!(q.sql, "SELECT * FROM `orders` ORDER BY `id` ASC LIMIT 100000");
        assert!(q.params.is_empty());
        assert!(q.after.is_none());
    }

    #[test]
    fn test_single_key_range() {
        let bound = KeyTuple::new(vec![Value::Int64(42)]);
        let q = plan(
            &orders().with_schema("shop"),
            &["id".into(), "total".into()],
            &KeySet::new(["id"]),
            Some(&bound),
            Some(10),
            &MySqlDialect,
        )
        .unwrap();
        assert_eq!(
            q.sql,
            "SELECT `id`, `total` FROM `shop`.`orders` WHERE `id` > ? ORDER BY `id` ASC LIMIT 10"
        );
        assert_eq!(q.params, vec![Value::Int64(42)]);
    }

    #[test]
    fn test_composite_range_expansion() {
        let bound = KeyTuple::new(vec![Value::Int64(5), Value::Int64(10), Value::from("z")]);
        let q = plan(
            &orders(),
            &[],
            &KeySet::new(["a", "b", "c"]),
            Some(&bound),
            Some(3),
            &PostgresDialect,
        )
        .unwrap();
        assert_eq!(
            q.sql,
            "SELECT * FROM \"orders\" WHERE (\"a\" > $1) OR (\"a\" = $2 AND \"b\" > $3) \
             OR (\"a\" = $4 AND \"b\" = $5 AND \"c\" > $6) \
             ORDER BY \"a\" ASC, \"b\" ASC, \"c\" ASC LIMIT 3"
        );
        assert_eq!(
            q.params,
            vec![
                Value::Int64(5),
                Value::Int64(5),
                Value::Int64(10),
                Value::Int64(5),
                Value::Int64(10),
                Value::from("z"),
            ]
        );
    }

    #[test]
    fn test_empty_keyset_ignores_watermark() {
        let bound = KeyTuple::new(vec![Value::Int64(1)]);
        let q = plan(
            &orders(),
            &[],
            &KeySet::default(),
            Some(&bound),
            Some(50),
            &MySqlDialect,
        )
        .unwrap();
        assert_eq!(q.sql, "SELECT * FROM `orders` LIMIT 50");
        assert!(q.after.is_none());
    }

    #[test]
    fn test_unbounded_omits_limit() {
        let q = plan(&orders(), &[], &KeySet::new(["id"]), None, None, &MySqlDialect).unwrap();
        assert_eq!(q.sql, "SELECT * FROM `orders` ORDER BY `id` ASC");
    }

    #[test]
    fn test_plan_is_deterministic() {
        let keys = KeySet::new(["a", "b"]);
        let bound = KeyTuple::new(vec![Value::Int64(1), Value::Int64(2)]);
        let first = plan(&orders(), &[], &keys, Some(&bound), Some(5), &MySqlDialect).unwrap();
        let second = plan(&orders(), &[], &keys, Some(&bound), Some(5), &MySqlDialect).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_bound_width_must_match_keys() {
        let short = KeyTuple::new(vec![Value::Int64(5)]);
        let err = plan(
            &orders(),
            &[],
            &KeySet::new(["tenant_id", "id"]),
            Some(&short),
            Some(10),
            &MySqlDialect,
        )
        .unwrap_err();
        assert!(matches!(err, ExtractError::Configuration(_)));

        let wide = KeyTuple::new(vec![Value::Int64(1), Value::Int64(2)]);
        assert!(plan(&orders(), &[], &KeySet::new(["id"]), Some(&wide), None, &MySqlDialect).is_err());
    }
}
