//! Transferring rows in and out of external PostgreSQL and MySQL
//! databases, primarily for import tables.
//!
//! A [`TableReader`] streams framed rows lazily: the query runs on a
//! background task, frames travel through a bounded channel, and the
//! object-store upload consumes the resulting [`ByteStream`] to
//! completion. Nothing buffers a whole extract.

mod mysql;
mod postgres;
mod schema;
mod stream;
mod writer;

pub use schema::{mysql_type_to_warehouse, postgres_type_to_warehouse};
pub use stream::ImportStats;
pub use writer::{connect_postgres, copy_table};

use futures::StreamExt;
use maestro_sql::PrimitiveSelect;
use maestro_warehouse::{ByteStream, TableSchema};
use sqlx::mysql::MySqlPool;
use sqlx::postgres::PgPool;
use thiserror::Error;

/// Rows this large (encoded) are suppressed and counted instead of
/// shipped: the warehouse rejects them anyway.
pub const MAX_ROW_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Unsupported driver: {0}")]
    UnsupportedDriver(String),

    #[error("Import tables must select from only one table, we have {0}: {1:?}")]
    MultipleTables(usize, Vec<String>),

    #[error("{0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// One open connection pool to an external database.
#[derive(Clone)]
pub enum ExternalPool {
    Postgres(PgPool),
    MySql(MySqlPool),
}

impl ExternalPool {
    /// Connect with the resolved connect string. The driver decides the
    /// dialect everywhere downstream.
    pub async fn connect(driver: &str, connect_str: &str) -> Result<Self> {
        match driver {
            "postgres" => Ok(ExternalPool::Postgres(PgPool::connect(connect_str).await?)),
            "mysql" => Ok(ExternalPool::MySql(MySqlPool::connect(connect_str).await?)),
            other => Err(SyncError::UnsupportedDriver(other.to_string())),
        }
    }

    pub async fn close(&self) {
        match self {
            ExternalPool::Postgres(pool) => pool.close().await,
            ExternalPool::MySql(pool) => pool.close().await,
        }
    }
}

/// Progress callback: (rows so far, bytes so far).
pub type ProgressFn = Box<dyn Fn(i64, i64) + Send + Sync>;

/// A streaming read of an external table: the framed-row byte stream,
/// the statement that produced it and the stats that accumulate while
/// the stream is consumed.
pub struct TableReader {
    pub(crate) stream: ByteStream,
    pub(crate) statement: String,
    pub(crate) stats: stream::SharedStats,
}

impl TableReader {
    /// Start reading. `id_column`/`last_id` drive incremental imports:
    /// with both set, only rows past `last_id` are read, in id order,
    /// and the maximum id seen is tracked. `report_every` emits the
    /// progress callback every N rows (0 disables it).
    pub fn start(
        pool: &ExternalPool,
        stmt: &PrimitiveSelect,
        id_column: &str,
        last_id: &str,
        progress: Option<ProgressFn>,
        report_every: i64,
    ) -> Result<TableReader> {
        match pool {
            ExternalPool::Postgres(pool) => {
                postgres::start_reader(pool, stmt, id_column, last_id, progress, report_every)
            }
            ExternalPool::MySql(pool) => {
                mysql::start_reader(pool, stmt, id_column, last_id, progress, report_every)
            }
        }
    }

    /// Infer the warehouse schema of the statement by describing
    /// `SELECT * FROM (stmt) t LIMIT 0` and mapping the driver column
    /// types.
    pub async fn warehouse_schema(
        pool: &ExternalPool,
        stmt: &PrimitiveSelect,
    ) -> Result<TableSchema> {
        match pool {
            ExternalPool::Postgres(pool) => schema::postgres_schema(pool, stmt).await,
            ExternalPool::MySql(pool) => schema::mysql_schema(pool, stmt).await,
        }
    }

    /// The wrapped statement actually sent to the external database.
    pub fn statement(&self) -> &str {
        &self.statement
    }

    /// Take the byte stream for consumption (an upload reads it to
    /// completion). Subsequent calls yield an empty stream.
    pub fn take_stream(&mut self) -> ByteStream {
        std::mem::replace(&mut self.stream, futures::stream::empty().boxed())
    }

    /// Snapshot of the transfer stats. Final once the stream has been
    /// consumed to completion.
    pub fn stats(&self) -> ImportStats {
        self.stats.snapshot()
    }
}

/// Escape a value as a single-quoted SQL literal. Used for the
/// incremental-import cursor, whose value originates from the id column
/// itself; a literal lets the server coerce it to the column type.
pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_literal_doubles_quotes() {
        assert_eq!(quote_literal("100"), "'100'");
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
    }

    #[test]
    fn unsupported_driver_is_rejected() {
        let err = futures::executor::block_on(ExternalPool::connect("oracle", "x")).unwrap_err();
        assert!(matches!(err, SyncError::UnsupportedDriver(_)));
    }
}
