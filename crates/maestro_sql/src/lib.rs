//! Light SQL analysis for dependency discovery.
//!
//! Maestro never parses SQL properly. Tables are related to each other by
//! scanning a query for tokens that follow `FROM`, `JOIN` or
//! `TABLE_DATE_RANGE` and treating them as candidate parent names. False
//! positives are fine - callers intersect the result with the catalog -
//! false negatives are not.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

fn block_comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/\*[^*]*\*+(?:[^*/][^*]*\*+)*/").unwrap())
}

fn whole_line_comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(--|#)").unwrap())
}

fn trailing_comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"--|#").unwrap())
}

fn token_split_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\s)(;,]+").unwrap())
}

/// Strip block comments, whole-line comments and trailing comments,
/// joining the surviving lines with spaces.
fn remove_sql_comments(stmt: &str) -> String {
    let stmt = block_comment_re().replace_all(stmt, "");

    let mut lines = Vec::new();
    for line in stmt.lines() {
        if whole_line_comment_re().is_match(line) {
            continue;
        }
        // Split on the first comment introducer, keep what precedes it.
        let head = trailing_comment_re()
            .split(line)
            .next()
            .unwrap_or("")
            .to_string();
        lines.push(head);
    }
    lines.join(" ")
}

/// Return every plausible table name mentioned in a query, deduplicated
/// and sorted. A token is a candidate when the previous (lowercased)
/// token was `from`, `join` or `table_date_range`, and the token itself
/// is not empty, `select` or `table_date_range`. Original case is
/// preserved in the output.
pub fn tables_in_query(query: &str) -> Vec<String> {
    let cleaned = remove_sql_comments(query);

    let mut set = BTreeSet::new();
    let mut get_next = false;
    for tok in token_split_re().split(&cleaned) {
        let ltok = tok.to_lowercase();
        if get_next && !ltok.is_empty() && ltok != "select" && ltok != "table_date_range" {
            set.insert(tok.to_string());
        }
        get_next = ltok == "from" || ltok == "join" || ltok == "table_date_range";
    }

    set.into_iter().collect()
}

/// An SQL statement reduced to its primitive parts. Import table queries
/// are stored as the JSON form of this struct rather than free-form SQL,
/// which keeps them portable across external database dialects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrimitiveSelect {
    #[serde(rename = "Select")]
    pub select: String,
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "Where")]
    pub where_: String,
    #[serde(rename = "Limit")]
    pub limit: String,
    #[serde(rename = "OrderBy")]
    pub order_by: String,
}

impl fmt::Display for PrimitiveSelect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cols = if self.select.is_empty() {
            "*"
        } else {
            &self.select
        };
        write!(f, "SELECT {} \n  FROM {}\n", cols, self.from)?;
        if !self.where_.is_empty() {
            write!(f, " WHERE {}\n", self.where_)?;
        }
        if !self.order_by.is_empty() {
            write!(f, " ORDER BY {}\n", self.order_by)?;
        }
        if !self.limit.is_empty() {
            write!(f, " LIMIT {}", self.limit)?;
        }
        Ok(())
    }
}

impl PrimitiveSelect {
    /// Select everything from a single table.
    pub fn star(table: &str) -> Self {
        Self {
            select: "*".to_string(),
            from: table.to_string(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_from_and_join_tables() {
        let q = "SELECT a.x, b.y FROM ds.alpha a JOIN ds.beta b ON a.id = b.id";
        assert_eq!(tables_in_query(q), vec!["ds.alpha", "ds.beta"]);
    }

    #[test]
    fn output_is_sorted_and_deduplicated() {
        let q = "SELECT * FROM zed JOIN alpha JOIN zed";
        assert_eq!(tables_in_query(q), vec!["alpha", "zed"]);
    }

    #[test]
    fn preserves_original_case() {
        let q = "SELECT * FROM Stats.Events";
        assert_eq!(tables_in_query(q), vec!["Stats.Events"]);
    }

    #[test]
    fn subselect_is_not_a_table() {
        // "(" is a token separator, so the inner SELECT follows FROM and
        // must be rejected by the select keyword check.
        let q = "SELECT * FROM (SELECT x FROM inner_t) t";
        assert_eq!(tables_in_query(q), vec!["inner_t"]);
    }

    #[test]
    fn table_date_range_argument_is_a_table() {
        let q = "SELECT * FROM TABLE_DATE_RANGE(ds.events_, TIMESTAMP('2017-01-01'), CURRENT_TIMESTAMP())";
        assert_eq!(tables_in_query(q), vec!["ds.events_"]);
    }

    #[test]
    fn comments_are_ignored() {
        let q = "SELECT * /* FROM ds.ghost */ FROM ds.real -- FROM ds.trailing\n# FROM ds.hash\nJOIN ds.other";
        assert_eq!(tables_in_query(q), vec!["ds.other", "ds.real"]);
    }

    #[test]
    fn empty_query_yields_nothing() {
        assert!(tables_in_query("").is_empty());
    }

    #[test]
    fn primitive_select_renders() {
        let s = PrimitiveSelect {
            select: "id, name".to_string(),
            from: "accounts".to_string(),
            where_: "active".to_string(),
            limit: "10".to_string(),
            order_by: "id".to_string(),
        };
        let sql = s.to_string();
        assert!(sql.starts_with("SELECT id, name"));
        assert!(sql.contains("FROM accounts"));
        assert!(sql.contains("WHERE active"));
        assert!(sql.contains("ORDER BY id"));
        assert!(sql.ends_with("LIMIT 10"));
        // A primitive select references exactly one table.
        assert_eq!(tables_in_query(&sql), vec!["accounts"]);
    }

    #[test]
    fn primitive_select_defaults_to_star() {
        let s: PrimitiveSelect = serde_json::from_str(r#"{"From": "users"}"#).unwrap();
        assert!(s.to_string().starts_with("SELECT * "));
    }
}
