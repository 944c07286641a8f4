//! Server-side job state: status and statistics blobs.

use serde::{Deserialize, Serialize};

use crate::config::JobConfiguration;

/// Terminal state reported by the warehouse.
pub const JOB_STATE_DONE: &str = "DONE";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorProto {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_result: Option<ErrorProto>,
}

impl JobStatus {
    pub fn done(&self) -> bool {
        self.state == JOB_STATE_DONE
    }

    pub fn error_message(&self) -> &str {
        self.error_result.as_ref().map(|e| e.message.as_str()).unwrap_or("")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryStatistics {
    #[serde(default)]
    pub total_bytes_billed: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadStatistics {
    #[serde(default)]
    pub input_file_bytes: i64,
    #[serde(default)]
    pub output_rows: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractStatistics {
    /// One entry per destination URI pattern; the count of files the
    /// extract actually produced for it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub destination_uri_file_counts: Vec<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatistics {
    /// Milliseconds since the epoch; zero when the server has not
    /// reported the moment yet.
    #[serde(default)]
    pub creation_time: i64,
    #[serde(default)]
    pub start_time: i64,
    /// Present whenever the job has reached DONE.
    #[serde(default)]
    pub end_time: i64,
    #[serde(default)]
    pub total_bytes_processed: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<QueryStatistics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load: Option<LoadStatistics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extract: Option<ExtractStatistics>,
}

/// A job as the warehouse reports it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarehouseJob {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<JobConfiguration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<JobStatistics>,
}

impl WarehouseJob {
    /// The server may qualify the job id as `project:id` or `loc.id`;
    /// only the trailing component is ours.
    pub fn short_id(&self) -> String {
        let mut id = self.id.as_str();
        if let Some(i) = id.rfind(':') {
            id = &id[i + 1..];
        }
        if let Some(i) = id.rfind('.') {
            id = &id[i + 1..];
        }
        id.to_string()
    }
}

/// Expand extract destination URI patterns into the concrete file list:
/// a `*` is replaced by a twelve-digit zero-padded counter, one URI per
/// produced file.
pub fn build_extract_destination_uris(uris: &[String], file_counts: &[i64]) -> Vec<String> {
    let mut result = Vec::with_capacity(uris.len());
    for (i, uri) in uris.iter().enumerate() {
        if !uri.contains('*') {
            result.push(uri.clone());
            continue;
        }
        let n = file_counts.get(i).copied().unwrap_or(0);
        for file in 0..n {
            result.push(uri.replacen('*', &format!("{:012}", file), 1));
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_done_and_error() {
        let mut status = JobStatus {
            state: "RUNNING".to_string(),
            error_result: None,
        };
        assert!(!status.done());
        assert_eq!(status.error_message(), "");

        status.state = JOB_STATE_DONE.to_string();
        status.error_result = Some(ErrorProto {
            reason: "invalid".to_string(),
            message: "boom".to_string(),
        });
        assert!(status.done());
        assert_eq!(status.error_message(), "boom");
    }

    #[test]
    fn short_id_strips_qualifiers() {
        let mut job = WarehouseJob {
            id: "proj:job_123".to_string(),
            ..Default::default()
        };
        assert_eq!(job.short_id(), "job_123");
        job.id = "proj:US.job_456".to_string();
        assert_eq!(job.short_id(), "job_456");
        job.id = "job_789".to_string();
        assert_eq!(job.short_id(), "job_789");
    }

    #[test]
    fn destination_uris_expand_stars() {
        let uris = vec![
            "gs://b/plain.csv".to_string(),
            "gs://b/sharded_*.csv.gz".to_string(),
        ];
        let result = build_extract_destination_uris(&uris, &[1, 2]);
        assert_eq!(
            result,
            vec![
                "gs://b/plain.csv",
                "gs://b/sharded_000000000000.csv.gz",
                "gs://b/sharded_000000000001.csv.gz",
            ]
        );
    }

    #[test]
    fn status_blob_round_trip() {
        let json = r#"{"state":"DONE","errorResult":{"reason":"backendError","message":"Retrying may solve the problem"}}"#;
        let status: JobStatus = serde_json::from_str(json).unwrap();
        assert!(status.done());
        assert!(status.error_message().contains("Retrying"));
        let back = serde_json::to_string(&status).unwrap();
        assert_eq!(back, json);
    }
}
