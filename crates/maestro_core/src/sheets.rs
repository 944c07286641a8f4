//! The spreadsheet-export capability.
//!
//! The actual sheets client lives outside the core; the monitor only
//! needs something to hand a small table to. Size limits are enforced
//! here because they protect the paging API regardless of the client.

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::info;

use maestro_catalog::model::Table;
use maestro_warehouse::TableInfo;

/// Largest table a sheet export will accept.
pub const SHEET_MAX_ROWS: u64 = 200 * 1000;
pub const SHEET_MAX_BYTES: i64 = 20 * 1000 * 1000;

#[async_trait]
pub trait SheetSink: Send + Sync {
    /// Copy the table into a spreadsheet. `headers` are the column
    /// names in schema order.
    async fn export(&self, table: &Table, headers: Vec<String>) -> Result<()>;
}

/// No-op sink for deployments without a spreadsheet integration.
#[derive(Debug, Default)]
pub struct NullSheets;

#[async_trait]
impl SheetSink for NullSheets {
    async fn export(&self, table: &Table, _headers: Vec<String>) -> Result<()> {
        info!("sheet export for table {} skipped (no sink)", table.id);
        Ok(())
    }
}

/// Guard the paging API: sheet exports only make sense for small
/// tables.
pub(crate) fn check_sheet_size(info: &TableInfo) -> Result<()> {
    if info.num_rows > SHEET_MAX_ROWS {
        bail!(
            "Maximum allowed rows for Sheets export is {}, this table has {}.",
            SHEET_MAX_ROWS,
            info.num_rows
        );
    }
    if info.num_bytes > SHEET_MAX_BYTES {
        bail!(
            "Maximum allowed size for Sheets export is {}, this table is {}.",
            SHEET_MAX_BYTES,
            info.num_bytes
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_guard() {
        let ok = TableInfo {
            num_rows: 100,
            num_bytes: 1000,
            ..Default::default()
        };
        assert!(check_sheet_size(&ok).is_ok());

        let too_many_rows = TableInfo {
            num_rows: SHEET_MAX_ROWS + 1,
            ..Default::default()
        };
        assert!(check_sheet_size(&too_many_rows).is_err());

        let too_big = TableInfo {
            num_bytes: SHEET_MAX_BYTES + 1,
            ..Default::default()
        };
        assert!(check_sheet_size(&too_big).is_err());
    }
}
