//! Durable warehouse jobs.
//!
//! A job intentionally duplicates the table attributes it was created
//! from: the table may be edited afterwards, but a run must execute the
//! plan as assembled. Between creation and submission the warehouse job
//! id is empty; submission fills it, and only a transient-retry
//! resubmission ever replaces it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use maestro_scheduler::GraphItem;
use maestro_warehouse::{
    build_extract_destination_uris, parse_store_uri, JobConfiguration, JobStatus, TableReference,
    TableSchema, WarehouseError, WarehouseJob,
};
use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, Result};

/// What the warehouse is asked to do for the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Run SQL into a destination table.
    Query,
    /// Load object-store files into a table.
    Load,
    /// Extract a table into object-store files.
    Extract,
}

impl Default for JobKind {
    fn default() -> Self {
        JobKind::Query
    }
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Query => "query",
            JobKind::Load => "load",
            JobKind::Extract => "extract",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "query" => Ok(JobKind::Query),
            "load" => Ok(JobKind::Load),
            "extract" => Ok(JobKind::Extract),
            _ => Err(format!("Invalid job kind: {:?}", s)),
        }
    }
}

/// Derived lifecycle state, computed from the status blob and end time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Never submitted, or submitted with nothing reported yet.
    Pending,
    /// The warehouse reports a non-terminal state.
    Running,
    /// Terminal without error.
    Done,
    /// Terminal with error.
    Error,
}

#[derive(Debug, Clone, Default)]
pub struct Job {
    pub id: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub table_id: i64,
    pub user_id: Option<i64>,
    pub run_id: Option<i64>,
    /// Table ids of this job's parents within the same run.
    pub parents: Vec<i64>,
    /// Server-side id; empty until submitted.
    pub warehouse_job_id: String,
    pub kind: JobKind,
    /// Opaque configuration blob (JSON), passed back on submission.
    pub configuration: Option<String>,
    /// Opaque status blob (JSON) as last observed.
    pub status: Option<String>,
    pub query_stats: Option<String>,
    pub load_stats: Option<String>,
    pub extract_stats: Option<String>,
    /// For extracts: the concrete output file URIs (JSON array).
    pub destination_urls: Option<String>,
    pub creation_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_bytes_processed: i64,
    pub total_bytes_billed: i64,
    pub import_begin: Option<DateTime<Utc>>,
    pub import_end: Option<DateTime<Utc>>,
    pub import_bytes: i64,
    pub import_rows: i64,
}

impl GraphItem for Job {
    // Within a run there is exactly one job per table, so the table id
    // is the node name.
    fn node_name(&self) -> String {
        self.table_id.to_string()
    }
}

impl Job {
    pub fn new(table_id: i64, user_id: Option<i64>, run_id: Option<i64>, kind: JobKind) -> Self {
        Self {
            table_id,
            user_id,
            run_id,
            kind,
            ..Default::default()
        }
    }

    pub fn set_configuration(&mut self, conf: &JobConfiguration) -> Result<()> {
        self.configuration = Some(serde_json::to_string(conf)?);
        Ok(())
    }

    pub fn parsed_configuration(&self) -> Result<JobConfiguration> {
        let raw = self
            .configuration
            .as_deref()
            .ok_or_else(|| CatalogError::invalid_state(format!("Missing configuration in job {}", self.id)))?;
        Ok(serde_json::from_str(raw)?)
    }

    /// The parsed status blob, if one has been observed.
    pub fn parsed_status(&self) -> Result<Option<JobStatus>> {
        match self.status.as_deref() {
            None => Ok(None),
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
        }
    }

    /// Short error text from the status blob; empty when none.
    pub fn error_text(&self) -> Result<String> {
        Ok(self
            .parsed_status()?
            .map(|s| s.error_message().to_string())
            .unwrap_or_default())
    }

    /// Derived (state, error) pair.
    pub fn get_status(&self) -> Result<(JobState, String)> {
        let status = self.parsed_status()?;
        let status = match status {
            None => {
                return Ok((JobState::Pending, String::new()));
            }
            Some(s) => s,
        };
        let error = status.error_message().to_string();
        // Terminal means the server said DONE and stamped an end time.
        let state = if status.done() && self.end_time.is_some() {
            if error.is_empty() {
                JobState::Done
            } else {
                JobState::Error
            }
        } else {
            JobState::Running
        };
        Ok((state, error))
    }

    pub fn is_done(&self) -> bool {
        matches!(self.get_status(), Ok((JobState::Done, _)) | Ok((JobState::Error, _)))
    }

    /// Destination (query/load) or source (extract) table of the stored
    /// configuration.
    pub fn table_reference(&self) -> Result<TableReference> {
        let conf = self.parsed_configuration()?;
        let tref = match self.kind {
            JobKind::Load => conf.load.and_then(|l| l.destination_table),
            JobKind::Query => conf.query.and_then(|q| q.destination_table),
            JobKind::Extract => conf.extract.and_then(|e| e.source_table),
        };
        tref.ok_or_else(|| {
            CatalogError::invalid_state(format!(
                "Unsupported job type or empty config (id {}): {}",
                self.id, self.kind
            ))
        })
    }

    /// Attach an explicit load schema, turning autodetection off.
    pub fn set_load_schema(&mut self, schema: TableSchema) -> Result<()> {
        let mut conf = self.parsed_configuration()?;
        let load = conf
            .load
            .as_mut()
            .ok_or_else(|| CatalogError::invalid_state(format!("Job {} is not a load", self.id)))?;
        load.schema = Some(schema);
        load.autodetect = false;
        self.set_configuration(&conf)
    }

    /// Rewrite the object-store source URIs of a load.
    pub fn set_load_sources(&mut self, urls: Vec<String>) -> Result<()> {
        let mut conf = self.parsed_configuration()?;
        let load = conf
            .load
            .as_mut()
            .ok_or_else(|| CatalogError::invalid_state(format!("Job {} is not a load", self.id)))?;
        load.source_uris = Some(urls);
        self.set_configuration(&conf)
    }

    /// Object name of the first load source.
    pub fn import_file_name(&self) -> Result<String> {
        let conf = self.parsed_configuration()?;
        let uris = conf
            .load
            .and_then(|l| l.source_uris)
            .unwrap_or_default();
        let first = uris
            .first()
            .ok_or_else(|| CatalogError::invalid_state("Missing load source URIs.".to_string()))?;
        let (_, name) = parse_store_uri(first).map_err(|e: WarehouseError| {
            CatalogError::invalid_state(e.to_string())
        })?;
        Ok(name)
    }

    /// Extract output URIs recorded at completion.
    pub fn destination_url_list(&self) -> Result<Vec<String>> {
        match self.destination_urls.as_deref() {
            None => Ok(Vec::new()),
            Some(raw) => Ok(serde_json::from_str(raw)?),
        }
    }

    /// Fold a warehouse job record into this one: server id (shorn of
    /// project/location qualifiers), configuration, statistics, status
    /// and the timestamps that signal completion.
    pub fn apply_warehouse_data(&mut self, wh: &WarehouseJob) -> Result<()> {
        if !wh.id.is_empty() {
            self.warehouse_job_id = wh.short_id();
        }

        if let Some(stats) = &wh.statistics {
            self.query_stats = stats
                .query
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            self.load_stats = stats.load.as_ref().map(serde_json::to_string).transpose()?;
            self.extract_stats = stats
                .extract
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            self.total_bytes_processed = stats.total_bytes_processed;
            if let Some(q) = &stats.query {
                self.total_bytes_billed = q.total_bytes_billed;
            }
            self.creation_time = time_from_ms(stats.creation_time);
            self.start_time = time_from_ms(stats.start_time);
            // Present whenever the job has reached the terminal state.
            self.end_time = time_from_ms(stats.end_time);
        }

        if let Some(conf) = &wh.configuration {
            self.configuration = Some(serde_json::to_string(conf)?);

            // Concrete extract outputs become known once the statistics
            // carry per-pattern file counts.
            if let Some(extract) = &conf.extract {
                if !extract.destination_uris.is_empty() {
                    if let Some(counts) = wh
                        .statistics
                        .as_ref()
                        .and_then(|s| s.extract.as_ref())
                        .map(|e| e.destination_uri_file_counts.as_slice())
                    {
                        let urls =
                            build_extract_destination_uris(&extract.destination_uris, counts);
                        self.destination_urls = Some(serde_json::to_string(&urls)?);
                    }
                }
            }
        }

        if let Some(status) = &wh.status {
            self.status = Some(serde_json::to_string(status)?);
        }

        Ok(())
    }
}

fn time_from_ms(ms: i64) -> Option<DateTime<Utc>> {
    if ms == 0 {
        return None;
    }
    Utc.timestamp_millis_opt(ms).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_warehouse::{
        ErrorProto, ExtractStatistics, JobStatistics, WarehouseSettings, JOB_STATE_DONE,
    };

    fn query_job() -> Job {
        let mut job = Job::new(42, None, Some(1), JobKind::Query);
        let conf = WarehouseSettings::new("proj", "bucket").new_query_configuration(
            "SELECT 1",
            "stats",
            "daily",
            "WRITE_TRUNCATE",
            false,
            false,
        );
        job.set_configuration(&conf).unwrap();
        job
    }

    #[test]
    fn node_name_is_the_table_id() {
        assert_eq!(query_job().node_name(), "42");
    }

    #[test]
    fn status_states() {
        let mut job = query_job();
        assert_eq!(job.get_status().unwrap().0, JobState::Pending);

        job.status = Some(r#"{"state":"RUNNING"}"#.to_string());
        assert_eq!(job.get_status().unwrap().0, JobState::Running);

        // DONE without an end time is still running from our side.
        job.status = Some(r#"{"state":"DONE"}"#.to_string());
        assert_eq!(job.get_status().unwrap().0, JobState::Running);

        job.end_time = Some(Utc::now());
        assert_eq!(job.get_status().unwrap().0, JobState::Done);

        job.status =
            Some(r#"{"state":"DONE","errorResult":{"message":"boom"}}"#.to_string());
        let (state, error) = job.get_status().unwrap();
        assert_eq!(state, JobState::Error);
        assert_eq!(error, "boom");
    }

    #[test]
    fn table_reference_follows_the_kind() {
        let job = query_job();
        let tref = job.table_reference().unwrap();
        assert_eq!(
            (tref.dataset_id.as_str(), tref.table_id.as_str()),
            ("stats", "daily")
        );

        // Kind not matching the configuration branch fails.
        let mut wrong = query_job();
        wrong.kind = JobKind::Extract;
        assert!(wrong.table_reference().is_err());
    }

    #[test]
    fn load_schema_disables_autodetect() {
        let mut job = Job::new(1, None, None, JobKind::Load);
        let conf = WarehouseSettings::new("p", "b").new_load_configuration(
            "t",
            "ds",
            "WRITE_APPEND",
            Some(vec!["gs://b/f.csv".to_string()]),
            "CSV",
        );
        job.set_configuration(&conf).unwrap();

        job.set_load_schema(TableSchema::default()).unwrap();
        let parsed = job.parsed_configuration().unwrap();
        let load = parsed.load.unwrap();
        assert!(!load.autodetect);
        assert!(load.schema.is_some());

        assert_eq!(job.import_file_name().unwrap(), "f.csv");
    }

    #[test]
    fn load_sources_can_be_rewritten() {
        let mut job = Job::new(1, None, None, JobKind::Load);
        let conf = WarehouseSettings::new("p", "b").new_load_configuration(
            "t", "ds", "WRITE_APPEND", None, "CSV",
        );
        job.set_configuration(&conf).unwrap();

        job.set_load_sources(vec!["gs://b/upload.json".to_string()])
            .unwrap();
        assert_eq!(job.import_file_name().unwrap(), "upload.json");
    }

    #[test]
    fn warehouse_data_is_folded_in() {
        let mut job = Job::new(9, None, None, JobKind::Extract);
        let settings = WarehouseSettings::new("p", "b");
        let mut conf = settings.new_extract_configuration("ds", "t");
        conf.extract.as_mut().unwrap().destination_uris =
            vec!["gs://b/out_*.csv.gz".to_string()];

        let wh = WarehouseJob {
            id: "p:US.job_abc".to_string(),
            configuration: Some(conf),
            status: Some(JobStatus {
                state: JOB_STATE_DONE.to_string(),
                error_result: None,
            }),
            statistics: Some(JobStatistics {
                creation_time: 1_500_000_000_000,
                start_time: 1_500_000_001_000,
                end_time: 1_500_000_002_000,
                total_bytes_processed: 123,
                extract: Some(ExtractStatistics {
                    destination_uri_file_counts: vec![2],
                }),
                ..Default::default()
            }),
        };

        job.apply_warehouse_data(&wh).unwrap();
        assert_eq!(job.warehouse_job_id, "job_abc");
        assert!(job.end_time.is_some());
        assert_eq!(job.total_bytes_processed, 123);
        assert_eq!(
            job.destination_url_list().unwrap(),
            vec!["gs://b/out_000000000000.csv.gz", "gs://b/out_000000000001.csv.gz"]
        );
        assert_eq!(job.get_status().unwrap().0, JobState::Done);
    }

    #[test]
    fn retrying_marker_is_visible_in_the_raw_status() {
        let mut job = query_job();
        let status = JobStatus {
            state: JOB_STATE_DONE.to_string(),
            error_result: Some(ErrorProto {
                reason: "backendError".to_string(),
                message: "Retrying may solve the problem".to_string(),
            }),
        };
        job.status = Some(serde_json::to_string(&status).unwrap());
        assert!(job
            .status
            .as_deref()
            .unwrap()
            .contains(maestro_warehouse::RETRYING_MARKER));
    }
}
