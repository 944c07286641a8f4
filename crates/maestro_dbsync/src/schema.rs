//! Warehouse schema inference from external database column metadata.
//!
//! The statement is described as `SELECT * FROM (<stmt>) t LIMIT 0` and
//! each driver-native column type maps to a small set of
//! warehouse-neutral types.

use sqlx::mysql::MySqlPool;
use sqlx::postgres::PgPool;
use sqlx::{Column, Executor, TypeInfo};

use maestro_sql::PrimitiveSelect;
use maestro_warehouse::{TableFieldSchema, TableSchema};

use crate::Result;

/// PostgreSQL native type to warehouse type.
pub fn postgres_type_to_warehouse(typ: &str) -> &'static str {
    match typ {
        "INT8" | "INT4" | "INT2" => "INT64",
        "BYTEA" => "BYTES",
        "BOOL" => "BOOL",
        "DATE" => "DATE",
        "TIME" => "TIME",
        "TIMETZ" | "TIMESTAMP" | "TIMESTAMPTZ" => "TIMESTAMP",
        "FLOAT4" | "FLOAT8" => "FLOAT64",
        _ => "STRING", // works for most anything else
    }
}

/// MySQL native type to warehouse type.
pub fn mysql_type_to_warehouse(typ: &str) -> &'static str {
    match typ {
        "INT" | "BIGINT" | "MEDIUMINT" | "SMALLINT" | "TINYINT" | "YEAR" => "INT64",
        "BLOB" | "LONGBLOB" | "MEDIUMBLOB" | "TINYBLOB" => "BYTES",
        "BIT" => "BOOL",
        "DATE" => "DATE",
        "TIME" => "TIME",
        "TIMESTAMP" | "DATETIME" => "TIMESTAMP",
        "FLOAT" | "DECIMAL" => "FLOAT64",
        _ => "STRING",
    }
}

fn limit_zero(stmt: &PrimitiveSelect) -> String {
    format!("SELECT * FROM ({}) t LIMIT 0", stmt)
}

pub(crate) async fn postgres_schema(pool: &PgPool, stmt: &PrimitiveSelect) -> Result<TableSchema> {
    let sql = limit_zero(stmt);
    let describe = pool.describe(&sql).await?;
    let fields = describe
        .columns()
        .iter()
        .map(|col| TableFieldSchema {
            name: col.name().to_string(),
            field_type: postgres_type_to_warehouse(col.type_info().name()).to_string(),
            mode: String::new(),
        })
        .collect();
    Ok(TableSchema { fields })
}

pub(crate) async fn mysql_schema(pool: &MySqlPool, stmt: &PrimitiveSelect) -> Result<TableSchema> {
    // The WHERE may reference the import cursor; strip the variable
    // parts before describing.
    let mut stmt = stmt.clone();
    stmt.where_.clear();
    stmt.order_by.clear();
    stmt.limit.clear();

    let sql = limit_zero(&stmt);
    let describe = pool.describe(&sql).await?;
    let fields = describe
        .columns()
        .iter()
        .map(|col| TableFieldSchema {
            name: col.name().to_string(),
            field_type: mysql_type_to_warehouse(col.type_info().name()).to_string(),
            mode: String::new(),
        })
        .collect();
    Ok(TableSchema { fields })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_mapping() {
        assert_eq!(postgres_type_to_warehouse("INT8"), "INT64");
        assert_eq!(postgres_type_to_warehouse("TIMESTAMPTZ"), "TIMESTAMP");
        assert_eq!(postgres_type_to_warehouse("FLOAT4"), "FLOAT64");
        assert_eq!(postgres_type_to_warehouse("VARCHAR"), "STRING");
        assert_eq!(postgres_type_to_warehouse("JSONB"), "STRING");
    }

    #[test]
    fn mysql_mapping() {
        assert_eq!(mysql_type_to_warehouse("TINYINT"), "INT64");
        assert_eq!(mysql_type_to_warehouse("DATETIME"), "TIMESTAMP");
        assert_eq!(mysql_type_to_warehouse("DECIMAL"), "FLOAT64");
        assert_eq!(mysql_type_to_warehouse("VARCHAR"), "STRING");
        // DOUBLE has no dedicated mapping and falls through.
        assert_eq!(mysql_type_to_warehouse("DOUBLE"), "STRING");
    }

    #[test]
    fn limit_zero_wraps_the_statement() {
        let stmt = PrimitiveSelect::star("accounts");
        let sql = limit_zero(&stmt);
        assert!(sql.starts_with("SELECT * FROM (SELECT *"));
        assert!(sql.ends_with("LIMIT 0"));
    }
}
