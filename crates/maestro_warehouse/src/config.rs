//! Job configuration blobs.
//!
//! Configurations are stored in the catalog as JSON and passed straight
//! back on submission. Only three operations ever decode them: reading
//! the destination/source table reference, attaching a load schema, and
//! rewriting load source URIs.

use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableReference {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub project_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dataset_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub table_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableFieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    #[serde(default)]
    pub fields: Vec<TableFieldSchema>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimePartitioning {
    #[serde(rename = "type")]
    pub partition_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryConfig {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_table: Option<TableReference>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub write_disposition: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub create_disposition: String,
    #[serde(default)]
    pub allow_large_results: bool,
    /// Never skipped: the server treats an absent flag as legacy SQL, so
    /// `false` must survive every decode/encode round trip.
    #[serde(default)]
    pub use_legacy_sql: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_partitioning: Option<TimePartitioning>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_uris: Option<Vec<String>>,
    #[serde(default)]
    pub autodetect: bool,
    #[serde(default)]
    pub allow_quoted_newlines: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub create_disposition: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub write_disposition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_table: Option<TableReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<TableSchema>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub destination_uris: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub compression: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination_format: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub field_delimiter: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_table: Option<TableReference>,
}

/// One warehouse job configuration: exactly one of the three branches is
/// populated, matching the job kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<QueryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load: Option<LoadConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extract: Option<ExtractConfig>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dry_run: bool,
}

/// Deploy-time warehouse settings: where jobs run and where extracts and
/// import files live. Builds the configuration blobs the way the
/// warehouse expects them.
#[derive(Debug, Clone)]
pub struct WarehouseSettings {
    pub project_id: String,
    pub bucket: String,
    /// Signed URL lifetime in seconds. Defaults to 4 hours.
    pub url_expiry_secs: u64,
}

pub const DEFAULT_URL_EXPIRY_SECS: u64 = 4 * 3600;

impl WarehouseSettings {
    pub fn new(project_id: &str, bucket: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            bucket: bucket.to_string(),
            url_expiry_secs: DEFAULT_URL_EXPIRY_SECS,
        }
    }

    fn table_ref(&self, dataset: &str, table: &str) -> TableReference {
        TableReference {
            project_id: self.project_id.clone(),
            dataset_id: dataset.to_string(),
            table_id: table.to_string(),
        }
    }

    /// A query job writing its result to `dataset.table`.
    pub fn new_query_configuration(
        &self,
        sql: &str,
        dataset: &str,
        table: &str,
        disposition: &str,
        legacy: bool,
        partitioned: bool,
    ) -> JobConfiguration {
        JobConfiguration {
            query: Some(QueryConfig {
                query: sql.to_string(),
                destination_table: Some(self.table_ref(dataset, table)),
                write_disposition: disposition.to_string(),
                create_disposition: "CREATE_IF_NEEDED".to_string(),
                allow_large_results: true,
                use_legacy_sql: legacy,
                time_partitioning: partitioned.then(|| TimePartitioning {
                    partition_type: "DAY".to_string(),
                }),
            }),
            ..Default::default()
        }
    }

    /// A load job from object-store files into `dataset.table`. The
    /// schema starts in autodetect mode; imports attach an inferred
    /// schema just before submission.
    pub fn new_load_configuration(
        &self,
        table: &str,
        dataset: &str,
        disposition: &str,
        source_urls: Option<Vec<String>>,
        format: &str,
    ) -> JobConfiguration {
        JobConfiguration {
            load: Some(LoadConfig {
                source_format: format.to_string(),
                source_uris: source_urls,
                autodetect: true,
                allow_quoted_newlines: true,
                create_disposition: "CREATE_IF_NEEDED".to_string(),
                write_disposition: disposition.to_string(),
                destination_table: Some(self.table_ref(dataset, table)),
                schema: None,
            }),
            ..Default::default()
        }
    }

    /// An extract job from `dataset.table` to sharded gzip CSV files in
    /// the configured bucket.
    pub fn new_extract_configuration(&self, dataset: &str, table: &str) -> JobConfiguration {
        let url = format!(
            "gs://{}/{}_{}_{}_*.csv.gz",
            self.bucket,
            dataset,
            table,
            Utc::now().timestamp()
        );
        JobConfiguration {
            extract: Some(ExtractConfig {
                destination_uris: vec![url],
                compression: "GZIP".to_string(),
                destination_format: "CSV".to_string(),
                field_delimiter: ",".to_string(),
                source_table: Some(self.table_ref(dataset, table)),
            }),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> WarehouseSettings {
        WarehouseSettings::new("proj", "bucket")
    }

    #[test]
    fn query_configuration_shape() {
        let conf = settings().new_query_configuration(
            "SELECT 1",
            "stats",
            "daily",
            "WRITE_TRUNCATE",
            false,
            true,
        );
        let q = conf.query.as_ref().unwrap();
        assert_eq!(q.destination_table.as_ref().unwrap().project_id, "proj");
        assert_eq!(q.time_partitioning.as_ref().unwrap().partition_type, "DAY");
        assert!(conf.load.is_none() && conf.extract.is_none());
    }

    #[test]
    fn use_legacy_sql_false_survives_round_trip() {
        let conf = settings().new_query_configuration(
            "SELECT 1",
            "stats",
            "daily",
            "WRITE_APPEND",
            false,
            false,
        );
        let json = serde_json::to_string(&conf).unwrap();
        assert!(json.contains(r#""useLegacySql":false"#));
        let back: JobConfiguration = serde_json::from_str(&json).unwrap();
        assert_eq!(back, conf);
    }

    #[test]
    fn load_configuration_starts_with_autodetect() {
        let conf = settings().new_load_configuration(
            "events",
            "imports",
            "WRITE_APPEND",
            Some(vec!["gs://bucket/file.csv".to_string()]),
            "CSV",
        );
        let l = conf.load.as_ref().unwrap();
        assert!(l.autodetect);
        assert!(l.schema.is_none());
        assert_eq!(l.source_uris.as_deref().unwrap().len(), 1);
    }

    #[test]
    fn external_load_may_omit_source_uris() {
        let conf =
            settings().new_load_configuration("ext", "stats", "WRITE_APPEND", None, "CSV");
        let json = serde_json::to_string(&conf).unwrap();
        assert!(!json.contains("sourceUris"));
    }

    #[test]
    fn extract_configuration_targets_the_bucket() {
        let conf = settings().new_extract_configuration("stats", "daily");
        let e = conf.extract.as_ref().unwrap();
        assert!(e.destination_uris[0].starts_with("gs://bucket/stats_daily_"));
        assert!(e.destination_uris[0].ends_with("_*.csv.gz"));
        assert_eq!(e.compression, "GZIP");
    }

    #[test]
    fn dry_run_omitted_when_false() {
        let conf = settings().new_extract_configuration("a", "b");
        let json = serde_json::to_string(&conf).unwrap();
        assert!(!json.contains("dryRun"));
        let mut conf = conf;
        conf.dry_run = true;
        let json = serde_json::to_string(&conf).unwrap();
        assert!(json.contains(r#""dryRun":true"#));
    }
}
