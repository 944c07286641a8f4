//! Tables: the central catalog entity.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use maestro_scheduler::{Condition, GraphItem};
use serde::{Deserialize, Serialize};

/// How a query or load writes into its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum WriteDisposition {
    /// Truncate the destination and write fresh.
    #[default]
    Replace,
    /// Append to whatever is there.
    Append,
}

impl WriteDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteDisposition::Replace => "WRITE_TRUNCATE",
            WriteDisposition::Append => "WRITE_APPEND",
        }
    }
}

impl fmt::Display for WriteDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WriteDisposition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WRITE_TRUNCATE" | "replace" => Ok(WriteDisposition::Replace),
            "WRITE_APPEND" | "append" => Ok(WriteDisposition::Append),
            _ => Err(format!("Invalid write disposition: {:?}", s)),
        }
    }
}

/// File format an external uploader delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ExternalFormat {
    #[default]
    Csv,
    NewlineDelimitedJson,
}

impl ExternalFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExternalFormat::Csv => "CSV",
            ExternalFormat::NewlineDelimitedJson => "NEWLINE_DELIMITED_JSON",
        }
    }
}

impl FromStr for ExternalFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "CSV" => Ok(ExternalFormat::Csv),
            "NEWLINE_DELIMITED_JSON" => Ok(ExternalFormat::NewlineDelimitedJson),
            _ => Err(format!("Invalid external format: {:?}", s)),
        }
    }
}

/// What kind of table this is, derived from its fields. The three kinds
/// are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// Defined by a warehouse query over other tables.
    Summary,
    /// Populated by importing rows from an external database.
    Import,
    /// Populated by an outside process uploading to object storage.
    External,
}

/// A named dataset within the warehouse.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub id: i64,
    pub dataset: String,
}

/// Everything the catalog knows about one table.
///
/// For summary tables `query` holds SQL; for import tables it holds the
/// JSON form of a primitive select against the external database; for
/// external tables it is empty.
#[derive(Debug, Clone, Default)]
pub struct Table {
    pub id: i64,
    pub user_id: i64,
    pub email: String, // joined from users
    pub name: String,
    pub dataset: String, // joined from datasets
    pub dataset_id: i64,
    pub query: String,
    pub disposition: WriteDisposition,
    pub partitioned: bool,
    pub legacy_sql: bool,
    pub description: String,
    pub error: String,
    pub running: bool,

    pub extract: bool,
    pub notify_extract_url: String,
    pub sheets_extract: bool,
    pub sheet_id: String,
    pub export_db_id: Option<i64>,
    pub export_table_name: String,

    pub freq_id: Option<i64>,
    pub conditions: Vec<Condition>,

    pub external_tmout_secs: Option<i64>,
    pub external_format: ExternalFormat,

    pub import_db_id: Option<i64>,
    pub imported_at: Option<DateTime<Utc>>,
    pub id_column: String,
    pub last_id: String,
    pub reimport_cond: Vec<Condition>,

    pub created_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub last_ok_run_end_at: Option<DateTime<Utc>>,
}

impl GraphItem for Table {
    fn node_name(&self) -> String {
        self.name.clone()
    }
}

impl Table {
    pub fn kind(&self) -> TableKind {
        if self.import_db_id.is_some() {
            TableKind::Import
        } else if self.external_tmout_secs.is_some() {
            TableKind::External
        } else {
            TableKind::Summary
        }
    }

    pub fn is_import(&self) -> bool {
        self.kind() == TableKind::Import
    }

    pub fn is_external(&self) -> bool {
        self.kind() == TableKind::External
    }

    /// Candidate parent names from the query. Imports have none: their
    /// query runs against the external database.
    pub fn parent_names(&self) -> Vec<String> {
        if self.is_import() {
            return Vec::new();
        }
        maestro_sql::tables_in_query(&self.query)
    }

    /// An empty condition list is always satisfied; otherwise any
    /// satisfied entry suffices.
    pub fn conditions_satisfied(&self, now: DateTime<Utc>) -> bool {
        Condition::any_satisfied(&self.conditions, now)
    }

    /// A reimport fires when some reimport condition is satisfied by
    /// `now` AND the previous import moment does not satisfy any - so a
    /// given window triggers at most one reimport. Unlike run
    /// conditions, an empty list is never satisfied.
    pub fn reimport_cond_satisfied(&self, now: DateTime<Utc>) -> bool {
        let ok = self.reimport_cond.iter().any(|c| c.satisfied(now));
        if !ok {
            return false;
        }
        if let Some(imported_at) = self.imported_at {
            if self.reimport_cond.iter().any(|c| c.satisfied(imported_at)) {
                return false;
            }
        }
        true
    }

    /// Object-store file name for an import extract.
    pub fn import_file_name(&self, run_id: Option<i64>, now: DateTime<Utc>) -> String {
        match run_id {
            Some(run_id) => format!(
                "{}_{}__run_{}__{}.csv",
                self.dataset,
                self.name,
                run_id,
                now.timestamp()
            ),
            None => format!("{}_{}_{}.csv", self.dataset, self.name, now.timestamp()),
        }
    }

    /// Object-store file name an external uploader is given.
    pub fn external_file_name(&self, now: DateTime<Utc>) -> String {
        format!("{}_{}_{}.json", self.dataset, self.name, now.timestamp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeSet;

    fn hours(hs: &[u32]) -> Condition {
        Condition {
            hours: hs.iter().copied().collect::<BTreeSet<u32>>(),
            ..Default::default()
        }
    }

    #[test]
    fn kind_is_derived_and_exclusive() {
        let mut t = Table::default();
        assert_eq!(t.kind(), TableKind::Summary);
        t.import_db_id = Some(3);
        assert_eq!(t.kind(), TableKind::Import);
        t.import_db_id = None;
        t.external_tmout_secs = Some(3600);
        assert_eq!(t.kind(), TableKind::External);
    }

    #[test]
    fn import_tables_have_no_parents() {
        let t = Table {
            import_db_id: Some(1),
            query: r#"{"From": "accounts"}"#.to_string(),
            ..Default::default()
        };
        assert!(t.parent_names().is_empty());
    }

    #[test]
    fn summary_parents_come_from_sql() {
        let t = Table {
            query: "SELECT * FROM ds.a JOIN ds.b".to_string(),
            ..Default::default()
        };
        assert_eq!(t.parent_names(), vec!["ds.a", "ds.b"]);
    }

    #[test]
    fn reimport_fires_once_per_window() {
        let nine = Utc.with_ymd_and_hms(2017, 8, 28, 9, 15, 0).unwrap();
        let mut t = Table {
            reimport_cond: vec![hours(&[9])],
            imported_at: Some(Utc.with_ymd_and_hms(2017, 8, 28, 8, 0, 0).unwrap()),
            ..Default::default()
        };
        assert!(t.reimport_cond_satisfied(nine));

        // Already imported inside the window: do not fire again.
        t.imported_at = Some(Utc.with_ymd_and_hms(2017, 8, 28, 9, 5, 0).unwrap());
        assert!(!t.reimport_cond_satisfied(nine));

        // No reimport conditions: never auto-reimport.
        t.reimport_cond.clear();
        assert!(!t.reimport_cond_satisfied(nine));
    }

    #[test]
    fn disposition_round_trips_through_wire_form() {
        for d in [WriteDisposition::Replace, WriteDisposition::Append] {
            assert_eq!(d.as_str().parse::<WriteDisposition>().unwrap(), d);
        }
        assert!("WRITE_EXPLODE".parse::<WriteDisposition>().is_err());
    }

    #[test]
    fn import_file_names() {
        let t = Table {
            dataset: "ds".to_string(),
            name: "tab".to_string(),
            ..Default::default()
        };
        let now = Utc.timestamp_opt(1500000000, 0).unwrap();
        assert_eq!(t.import_file_name(Some(7), now), "ds_tab__run_7__1500000000.csv");
        assert_eq!(t.import_file_name(None, now), "ds_tab_1500000000.csv");
    }
}
