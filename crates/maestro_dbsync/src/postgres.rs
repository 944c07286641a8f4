//! PostgreSQL streaming reader.
//!
//! The inner statement is wrapped as
//! `SELECT <id>, ROW(t.*) FROM (<inner>) t [WHERE id > <cursor>] ORDER BY <id>`
//! so every row arrives as a single parenthesized CSV-like value:
//! stripping the leading paren and substituting the trailing one with a
//! newline yields a CSV line without any per-column work.

use bytes::Bytes;
use futures::StreamExt;
use sqlx::postgres::PgPool;
use sqlx::Row;
use tokio::sync::mpsc;
use tracing::debug;

use maestro_sql::PrimitiveSelect;

use crate::stream::{io_err, ChannelStream, SharedStats, CHANNEL_DEPTH};
use crate::{quote_literal, ProgressFn, Result, TableReader, MAX_ROW_BYTES};

pub(crate) fn wrap_statement(inner: &str, id_column: &str, last_id: &str) -> String {
    if id_column.is_empty() {
        return format!("SELECT '-1' AS _id, (ROW(t.*))::text AS _row FROM ({}) t", inner);
    }
    let mut where_clause = String::new();
    if !last_id.is_empty() {
        // The cursor is spliced as a literal so the server coerces it to
        // the id column's type.
        where_clause = format!("WHERE {} > {} ", id_column, quote_literal(last_id));
    }
    format!(
        "SELECT ({})::text AS _id, (ROW(t.*))::text AS _row FROM ({}) t {}ORDER BY {}",
        id_column, inner, where_clause, id_column
    )
}

/// Turn one `ROW(...)` text value into a CSV line, in place.
pub(crate) fn frame_row(mut val: Vec<u8>) -> Vec<u8> {
    if !val.is_empty() {
        val.remove(0); // strip starting paren
        let last = val.len() - 1;
        val[last] = b'\n'; // replace trailing paren with EOL
    }
    val
}

pub(crate) fn start_reader(
    pool: &PgPool,
    stmt: &PrimitiveSelect,
    id_column: &str,
    last_id: &str,
    progress: Option<ProgressFn>,
    report_every: i64,
) -> Result<TableReader> {
    let statement = wrap_statement(&stmt.to_string(), id_column, last_id);
    let stats = SharedStats::default();
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);

    {
        let pool = pool.clone();
        let statement = statement.clone();
        let stats = stats.clone();
        let initial_last_id = last_id.to_string();

        tokio::spawn(async move {
            stats.update(|s| s.last_id = initial_last_id);

            let mut rows = sqlx::query(&statement).fetch(&pool);
            while let Some(row) = rows.next().await {
                let row = match row {
                    Ok(row) => row,
                    Err(err) => {
                        let _ = tx.send(Err(io_err(err))).await;
                        return;
                    }
                };

                let id: String = match row.try_get("_id") {
                    Ok(id) => id,
                    Err(err) => {
                        let _ = tx.send(Err(io_err(err))).await;
                        return;
                    }
                };
                let val: String = match row.try_get("_row") {
                    Ok(val) => val,
                    Err(err) => {
                        let _ = tx.send(Err(io_err(err))).await;
                        return;
                    }
                };

                let mut framed = frame_row(val.into_bytes());
                let mut oversized = false;
                if framed.len() >= MAX_ROW_BYTES {
                    framed = Vec::new();
                    oversized = true;
                }

                let framed_len = framed.len() as i64;
                let mut report_now = false;
                stats.update(|s| {
                    s.rows += 1;
                    s.bytes += framed_len;
                    s.last_id = id;
                    if oversized {
                        s.oversized += 1;
                    }
                    report_now = report_every != 0 && s.rows % report_every == 0;
                });

                if report_now {
                    if let Some(progress) = &progress {
                        let snap = stats.snapshot();
                        progress(snap.rows, snap.bytes);
                    }
                }

                if !framed.is_empty() && tx.send(Ok(Bytes::from(framed))).await.is_err() {
                    debug!("row stream receiver dropped, stopping read");
                    return;
                }
            }

            if let Some(progress) = &progress {
                let snap = stats.snapshot();
                progress(snap.rows, snap.bytes); // final report
            }
        });
    }

    Ok(TableReader {
        stream: ChannelStream(rx).boxed(),
        statement,
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_statement_with_cursor() {
        let stmt = wrap_statement("SELECT * \n  FROM accounts\n", "id", "100");
        assert!(stmt.starts_with("SELECT (id)::text AS _id, (ROW(t.*))::text AS _row"));
        assert!(stmt.contains("WHERE id > '100'"));
        assert!(stmt.ends_with("ORDER BY id"));
    }

    #[test]
    fn wrapped_statement_first_import_has_no_cursor() {
        let stmt = wrap_statement("SELECT * FROM accounts", "id", "");
        assert!(!stmt.contains("WHERE"));
        assert!(stmt.ends_with("ORDER BY id"));
    }

    #[test]
    fn wrapped_statement_without_id_column() {
        let stmt = wrap_statement("SELECT * FROM accounts", "", "");
        assert!(stmt.starts_with("SELECT '-1' AS _id"));
        assert!(!stmt.contains("ORDER BY"));
    }

    #[test]
    fn row_framing_strips_parens() {
        assert_eq!(frame_row(b"(1,alice,true)".to_vec()), b"1,alice,true\n");
        assert_eq!(frame_row(Vec::new()), b"");
    }
}
