//! Name parsing: store URIs and qualified table specs.

use crate::WarehouseError;

const STORE_SCHEME: &str = "gs://";

/// Split a `gs://bucket/name` URI into its bucket and object name.
pub fn parse_store_uri(uri: &str) -> Result<(String, String), WarehouseError> {
    let rest = uri
        .strip_prefix(STORE_SCHEME)
        .ok_or_else(|| WarehouseError::BadUri {
            uri: uri.to_string(),
            reason: format!("scheme is not {:?}", STORE_SCHEME),
        })?;
    match rest.split_once('/') {
        Some((bucket, name)) if !name.is_empty() => Ok((bucket.to_string(), name.to_string())),
        _ => Err(WarehouseError::BadUri {
            uri: uri.to_string(),
            reason: "no object name".to_string(),
        }),
    }
}

/// Parse a table reference as it appears in SQL: `[project:dataset.table]`
/// (legacy), `` `project.dataset.table` `` (standard), or a bare
/// `dataset.table` / `table`. Returns (project, dataset, table), blank
/// where unspecified.
pub fn parse_table_spec(spec: &str) -> (String, String, String) {
    let mut spec = spec;
    let mut project = String::new();

    if spec.starts_with('[') && spec.ends_with(']') {
        spec = &spec[1..spec.len() - 1];
        if let Some((proj, rest)) = spec.split_once(':') {
            project = proj.to_string();
            spec = rest;
        }
        return match spec.split_once('.') {
            Some((ds, table)) => (project, ds.to_string(), table.to_string()),
            None => (project, String::new(), String::new()),
        };
    }

    if spec.starts_with('`') && spec.ends_with('`') && spec.len() >= 2 {
        spec = &spec[1..spec.len() - 1];
    }

    let parts: Vec<&str> = spec.splitn(3, '.').collect();
    match parts.as_slice() {
        [proj, ds, table] => (proj.to_string(), ds.to_string(), table.to_string()),
        [ds, table] => (String::new(), ds.to_string(), table.to_string()),
        [table] => (String::new(), String::new(), table.to_string()),
        _ => (String::new(), String::new(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_uri_parses() {
        let (bucket, name) = parse_store_uri("gs://my-bucket/dir/file.csv").unwrap();
        assert_eq!(bucket, "my-bucket");
        assert_eq!(name, "dir/file.csv");
    }

    #[test]
    fn store_uri_rejects_bad_input() {
        assert!(parse_store_uri("s3://bucket/name").is_err());
        assert!(parse_store_uri("gs://bucket-only").is_err());
        assert!(parse_store_uri("gs://bucket/").is_err());
    }

    #[test]
    fn legacy_spec() {
        assert_eq!(
            parse_table_spec("[myproj:stats.daily]"),
            ("myproj".into(), "stats".into(), "daily".into())
        );
        assert_eq!(
            parse_table_spec("[stats.daily]"),
            ("".into(), "stats".into(), "daily".into())
        );
    }

    #[test]
    fn standard_spec() {
        assert_eq!(
            parse_table_spec("`myproj.stats.daily`"),
            ("myproj".into(), "stats".into(), "daily".into())
        );
        assert_eq!(
            parse_table_spec("`stats.daily`"),
            ("".into(), "stats".into(), "daily".into())
        );
    }

    #[test]
    fn bare_spec() {
        assert_eq!(
            parse_table_spec("stats.daily"),
            ("".into(), "stats".into(), "daily".into())
        );
        assert_eq!(
            parse_table_spec("daily"),
            ("".into(), "".into(), "daily".into())
        );
    }
}
