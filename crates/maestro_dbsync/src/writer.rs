//! Export writer: warehouse extract files into an external PostgreSQL
//! table via COPY.

use futures::{Stream, StreamExt};
use sqlx::postgres::PgConnection;
use sqlx::Connection;
use tracing::info;

use maestro_warehouse::TableSchema;

use crate::{Result, SyncError};

/// Report progress every this many rows.
const REPORT_EVERY: u64 = 1_000_000;

fn warehouse_type_to_postgres(typ: &str) -> &'static str {
    match typ {
        "BYTES" => "BYTEA",
        "INTEGER" | "INT64" => "BIGINT",
        "FLOAT" | "FLOAT64" => "DOUBLE PRECISION",
        "BOOLEAN" | "BOOL" => "BOOLEAN",
        "TIMESTAMP" => "TIMESTAMP WITH TIME ZONE",
        "DATE" => "DATE",
        "TIME" => "TIME",
        "DATETIME" => "TIMESTAMP",
        _ => "TEXT", // STRING and anything exotic
    }
}

fn create_table_sql(schema: &TableSchema, table: &str, drop: bool) -> String {
    let mut sql = String::new();
    if drop {
        sql.push_str(&format!("DROP TABLE IF EXISTS {};\n", table));
    }
    sql.push_str(&format!("CREATE TABLE {} (\n", table));
    let cols: Vec<String> = schema
        .fields
        .iter()
        .map(|field| {
            let mut col = format!(
                "    {} {}",
                field.name,
                warehouse_type_to_postgres(&field.field_type)
            );
            if field.mode == "REQUIRED" {
                col.push_str(" NOT NULL");
            }
            col
        })
        .collect();
    sql.push_str(&cols.join(",\n"));
    sql.push_str(");");
    sql
}

/// Encode one row for COPY CSV input. Empty values in nullable
/// non-string columns become NULL (unquoted empty); everything else is
/// quoted so empty strings stay empty strings.
fn encode_copy_row(schema: &TableSchema, row: &[String]) -> Vec<u8> {
    let mut line = Vec::new();
    for (i, val) in row.iter().enumerate() {
        if i > 0 {
            line.push(b',');
        }
        let field = &schema.fields[i.min(schema.fields.len() - 1)];
        if val.is_empty() && field.field_type != "STRING" && field.mode != "REQUIRED" {
            // unquoted empty: NULL
            continue;
        }
        line.push(b'"');
        line.extend_from_slice(val.replace('"', "\"\"").as_bytes());
        line.push(b'"');
    }
    line.push(b'\n');
    line
}

/// Drop/create `table` from the warehouse schema and COPY all `rows`
/// into it, in a single transaction. Returns the number of rows sent.
///
/// If the process dies mid-way the transaction simply never commits;
/// the next export starts over.
pub async fn copy_table(
    mut conn: PgConnection,
    schema: &TableSchema,
    table: &str,
    mut rows: std::pin::Pin<Box<dyn Stream<Item = Result<Vec<String>>> + Send>>,
) -> Result<u64> {
    sqlx::query("BEGIN").execute(&mut conn).await?;
    sqlx::raw_sql(&create_table_sql(schema, table, true))
        .execute(&mut conn)
        .await?;

    let cols: Vec<&str> = schema.fields.iter().map(|f| f.name.as_str()).collect();
    let copy_stmt = format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT csv)",
        table,
        cols.join(", ")
    );

    let mut copy = conn.copy_in_raw(&copy_stmt).await?;
    let mut sent: u64 = 0;
    while let Some(row) = rows.next().await {
        let row = match row {
            Ok(row) => row,
            Err(err) => {
                copy.abort(err.to_string()).await?;
                return Err(err);
            }
        };
        if row.len() != schema.fields.len() {
            let msg = format!(
                "row has {} fields, table {} has {}",
                row.len(),
                table,
                schema.fields.len()
            );
            copy.abort(msg.clone()).await?;
            return Err(SyncError::InvalidState(msg));
        }
        copy.send(encode_copy_row(schema, &row)).await?;
        sent += 1;
        if sent % REPORT_EVERY == 0 {
            info!("Export of {}: {} rows sent...", table, sent);
        }
    }
    copy.finish().await?;

    sqlx::query("COMMIT").execute(&mut conn).await?;
    info!("Export of {} complete, {} rows sent.", table, sent);
    Ok(sent)
}

/// Open a plain connection for an export transaction.
pub async fn connect_postgres(connect_str: &str) -> Result<PgConnection> {
    Ok(PgConnection::connect(connect_str).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_warehouse::TableFieldSchema;

    fn schema() -> TableSchema {
        TableSchema {
            fields: vec![
                TableFieldSchema {
                    name: "id".to_string(),
                    field_type: "INT64".to_string(),
                    mode: "REQUIRED".to_string(),
                },
                TableFieldSchema {
                    name: "name".to_string(),
                    field_type: "STRING".to_string(),
                    mode: String::new(),
                },
                TableFieldSchema {
                    name: "seen_at".to_string(),
                    field_type: "TIMESTAMP".to_string(),
                    mode: String::new(),
                },
            ],
        }
    }

    #[test]
    fn create_table_from_schema() {
        let sql = create_table_sql(&schema(), "export_tab", true);
        assert!(sql.starts_with("DROP TABLE IF EXISTS export_tab;"));
        assert!(sql.contains("id BIGINT NOT NULL"));
        assert!(sql.contains("name TEXT"));
        assert!(sql.contains("seen_at TIMESTAMP WITH TIME ZONE"));
    }

    #[test]
    fn empty_nullable_non_string_becomes_null() {
        let row = vec!["7".to_string(), String::new(), String::new()];
        let line = encode_copy_row(&schema(), &row);
        // id quoted, name is an empty *string* (quoted), timestamp NULL
        // (unquoted empty).
        assert_eq!(line, b"\"7\",\"\",\n");
    }

    #[test]
    fn quotes_are_doubled() {
        let row = vec![
            "1".to_string(),
            "say \"hi\"".to_string(),
            "2017-01-01".to_string(),
        ];
        let line = encode_copy_row(&schema(), &row);
        assert_eq!(line, b"\"1\",\"say \"\"hi\"\"\",\"2017-01-01\"\n");
    }
}
