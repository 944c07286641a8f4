//! MySQL streaming reader.
//!
//! MySQL has no ROW() shortcut, so every column is materialized as text
//! and pushed through a CSV encoder. ASCII NUL and invalid UTF-8 are
//! stripped on the way: the warehouse rejects both.

use bytes::Bytes;
use futures::StreamExt;
use sqlx::mysql::MySqlPool;
use sqlx::Row;
use tokio::sync::mpsc;
use tracing::debug;

use maestro_sql::PrimitiveSelect;

use crate::stream::{io_err, ChannelStream, SharedStats, CHANNEL_DEPTH};
use crate::{quote_literal, ProgressFn, Result, SyncError, TableReader, MAX_ROW_BYTES};

/// Rewrite the primitive select for the id-framed MySQL read:
/// `*` becomes `t.*` behind an alias ("id, *" is not valid MySQL), the
/// id column is prepended as `_id`, and the cursor lands in WHERE.
pub(crate) fn wrap_statement(
    stmt: &PrimitiveSelect,
    id_column: &str,
    last_id: &str,
) -> PrimitiveSelect {
    let mut stmt = stmt.clone();
    stmt.select = stmt.select.replace('*', "t.*");
    if stmt.select.is_empty() {
        stmt.select = "t.*".to_string();
    }
    stmt.from = format!("{} t", stmt.from);

    if id_column.is_empty() {
        stmt.select = format!("-1 AS _id, {}", stmt.select);
        return stmt;
    }

    if !last_id.is_empty() {
        if !stmt.where_.is_empty() {
            stmt.where_.push_str(" AND ");
        }
        stmt.where_
            .push_str(&format!(" {} > {}", id_column, quote_literal(last_id)));
    }
    stmt.select = format!("{} AS _id, {}", id_column, stmt.select);
    stmt.order_by = id_column.to_string();
    stmt
}

/// Drop ASCII NUL and replacement characters from a field.
pub(crate) fn filter_invalid_utf8(s: String) -> String {
    if !s.contains(['\u{0}', char::REPLACEMENT_CHARACTER]) {
        return s;
    }
    s.chars()
        .filter(|&c| c != '\u{0}' && c != char::REPLACEMENT_CHARACTER)
        .collect()
}

/// Encode one record as a CSV line.
pub(crate) fn encode_csv_row(record: &[String]) -> std::result::Result<Vec<u8>, SyncError> {
    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    writer.write_record(record)?;
    writer
        .into_inner()
        .map_err(|err| SyncError::InvalidState(err.to_string()))
}

pub(crate) fn start_reader(
    pool: &MySqlPool,
    stmt: &PrimitiveSelect,
    id_column: &str,
    last_id: &str,
    progress: Option<ProgressFn>,
    report_every: i64,
) -> Result<TableReader> {
    let wrapped = wrap_statement(stmt, id_column, last_id);
    let statement = wrapped.to_string();
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

                // Column 0 is the id; the rest are data. Everything is
                // read as text, the way the wire protocol delivers it.
                let id = row
                    .try_get_unchecked::<Option<String>, _>(0)
                    .ok()
                    .flatten()
                    .unwrap_or_default();

                let mut record = Vec::with_capacity(row.columns().len().saturating_sub(1));
                for i in 1..row.columns().len() {
                    let field = row
                        .try_get_unchecked::<Option<String>, _>(i)
                        .ok()
                        .flatten()
                        .unwrap_or_default();
                    if field.len() < MAX_ROW_BYTES {
                        record.push(filter_invalid_utf8(field));
                    } else {
                        record.push(String::new());
                    }
                }

                let mut framed = match encode_csv_row(&record) {
                    Ok(framed) => framed,
                    Err(err) => {
                        let _ = tx.send(Err(io_err(err))).await;
                        return;
                    }
                };
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
    fn wrapped_statement_aliases_star() {
        let stmt = PrimitiveSelect::star("accounts");
        let wrapped = wrap_statement(&stmt, "id", "100");
        assert_eq!(wrapped.select, "id AS _id, t.*");
        assert_eq!(wrapped.from, "accounts t");
        assert!(wrapped.where_.contains("id > '100'"));
        assert_eq!(wrapped.order_by, "id");
    }

    #[test]
    fn wrapped_statement_merges_where() {
        let stmt = PrimitiveSelect {
            select: "name".to_string(),
            from: "accounts".to_string(),
            where_: "active = 1".to_string(),
            ..Default::default()
        };
        let wrapped = wrap_statement(&stmt, "id", "5");
        assert!(wrapped.where_.starts_with("active = 1 AND "));
    }

    #[test]
    fn wrapped_statement_without_id_column() {
        let wrapped = wrap_statement(&PrimitiveSelect::star("t1"), "", "");
        assert!(wrapped.select.starts_with("-1 AS _id"));
        assert!(wrapped.order_by.is_empty());
    }

    #[test]
    fn invalid_utf8_filtering() {
        assert_eq!(filter_invalid_utf8("plain".to_string()), "plain");
        assert_eq!(filter_invalid_utf8("a\u{0}b".to_string()), "ab");
        assert_eq!(
            filter_invalid_utf8(format!("x{}y", char::REPLACEMENT_CHARACTER)),
            "xy"
        );
    }

    #[test]
    fn csv_row_encoding() {
        let row = encode_csv_row(&["1".to_string(), "with,comma".to_string()]).unwrap();
        assert_eq!(row, b"1,\"with,comma\"\n");
    }
}
