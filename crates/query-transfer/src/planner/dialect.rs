//! Row-range rewriting strategies.
//!
//! The planner only manages offsets and limits; turning a base query plus a
//! range into dialect-specific SQL is delegated to a [`RangeRewriter`].

use serde::{Deserialize, Serialize};

/// Rewrites a base query so it selects exactly `limit` rows starting at `offset`.
pub trait RangeRewriter: Send + Sync {
    /// Produce the SQL for one row range.
    fn rewrite(&self, base_query: &str, offset: u64, limit: u64) -> String;
}

/// Strip trailing whitespace and statement terminators so clauses can be appended.
fn trim_query(query: &str) -> &str {
    query.trim_end().trim_end_matches(';').trim_end()
}

/// `<query> LIMIT n OFFSET m` (PostgreSQL, MySQL, SQLite, Hive, Spark SQL).
#[derive(Debug, Clone, Copy, Default)]
pub struct LimitOffset;

impl RangeRewriter for LimitOffset {
    fn rewrite(&self, base_query: &str, offset: u64, limit: u64) -> String {
        format!("{} LIMIT {} OFFSET {}", trim_query(base_query), limit, offset)
    }
}

/// `<query> OFFSET m ROWS FETCH NEXT n ROWS ONLY` (SQL:2008, SQL Server 2012+, Oracle 12c+).
///
/// SQL Server requires an ORDER BY in the base query for this form.
#[derive(Debug, Clone, Copy, Default)]
pub struct OffsetFetch;

impl RangeRewriter for OffsetFetch {
    fn rewrite(&self, base_query: &str, offset: u64, limit: u64) -> String {
        format!(
            "{} OFFSET {} ROWS FETCH NEXT {} ROWS ONLY",
            trim_query(base_query),
            offset,
            limit
        )
    }
}

/// Wraps the query in a ROW_NUMBER() window and filters on the row number.
///
/// The output carries an extra `__rn` column.
#[derive(Debug, Clone, Default)]
pub struct RowNumberRange {
    /// ORDER BY expression for the window. `None` numbers rows in scan order.
    pub order_by: Option<String>,
}

impl RangeRewriter for RowNumberRange {
    fn rewrite(&self, base_query: &str, offset: u64, limit: u64) -> String {
        let window = match &self.order_by {
            Some(expr) => format!("ORDER BY {}", expr),
            None => String::new(),
        };
        // __rn is 1-based
        format!(
            r#"WITH numbered AS (
    SELECT __inner.*, ROW_NUMBER() OVER ({}) AS __rn
    FROM ({}) AS __inner
)
SELECT * FROM numbered WHERE __rn > {} AND __rn <= {}"#,
            window,
            trim_query(base_query),
            offset,
            offset + limit
        )
    }
}

/// Rewriter selection as it appears in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    #[default]
    LimitOffset,
    OffsetFetch,
    RowNumber,
}

impl Dialect {
    /// Build the rewriter for this dialect.
    pub fn rewriter(self) -> Box<dyn RangeRewriter> {
        match self {
            Dialect::LimitOffset => Box::new(LimitOffset),
            Dialect::OffsetFetch => Box::new(OffsetFetch),
            Dialect::RowNumber => Box::new(RowNumberRange::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_offset() {
        let sql = LimitOffset.rewrite("SELECT * FROM events;", 2000, 1000);
        assert_eq!(sql, "SELECT * FROM events LIMIT 1000 OFFSET 2000");
    }

    #[test]
    fn test_offset_fetch() {
        let sql = OffsetFetch.rewrite("SELECT id FROM t ORDER BY id", 0, 50);
        assert_eq!(
            sql,
            "SELECT id FROM t ORDER BY id OFFSET 0 ROWS FETCH NEXT 50 ROWS ONLY"
        );
    }

    #[test]
    fn test_row_number_range() {
        let rewriter = RowNumberRange {
            order_by: Some("id".to_string()),
        };
        let sql = rewriter.rewrite("SELECT * FROM t", 100, 50);
        assert!(sql.contains("ROW_NUMBER() OVER (ORDER BY id)"));
        assert!(sql.contains("FROM (SELECT * FROM t) AS __inner"));
        assert!(sql.contains("__rn > 100 AND __rn <= 150"));
    }

    #[test]
    fn test_dialect_deserialize() {
        let d: Dialect = serde_yaml::from_str("offset_fetch").unwrap();
        assert_eq!(d, Dialect::OffsetFetch);
        assert_eq!(Dialect::default(), Dialect::LimitOffset);
    }
}
