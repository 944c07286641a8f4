//! The warehouse and object-store capabilities.
//!
//! Maestro treats the analytical store and its object storage as opaque
//! services reachable through the [`Warehouse`] and [`ObjectStore`]
//! traits. Job configurations and statuses are carried around as
//! already-serialized JSON; this crate owns the serde types for the few
//! places where they must be decoded, modified and re-encoded.

mod config;
mod status;
mod traits;
mod uri;

pub use config::{
    ExtractConfig, JobConfiguration, LoadConfig, QueryConfig, TableFieldSchema, TableReference,
    TableSchema, TimePartitioning, WarehouseSettings, DEFAULT_URL_EXPIRY_SECS,
};
pub use status::{
    build_extract_destination_uris, ErrorProto, ExtractStatistics, JobStatistics, JobStatus,
    LoadStatistics, QueryStatistics, WarehouseJob, JOB_STATE_DONE,
};
pub use traits::{ByteStream, ObjectStore, StoredObject, TableInfo, Warehouse};
pub use uri::{parse_store_uri, parse_table_spec};

use thiserror::Error;

/// Terminal status message marking a transient failure the warehouse
/// itself suggests retrying. Matched by substring.
pub const RETRYING_MARKER: &str = "Retrying may solve the problem";

/// Terminal status message for a load whose data no longer matches the
/// destination table schema. Matched by substring.
pub const SCHEMA_MISMATCH_MARKER: &str = "Provided Schema does not match Table";

/// Submit/upload failure text that warrants a single delayed retry.
pub const TEMPORARY_ERROR_MARKER: &str = "server encountered a temporary error";

#[derive(Debug, Error)]
pub enum WarehouseError {
    /// Anything the remote API returned that is not a job status. Always
    /// treated as transient by the monitor.
    #[error("warehouse API error: {0}")]
    Api(String),
    #[error("configuration decode error: {0}")]
    Config(#[from] serde_json::Error),
    #[error("unsupported job kind or missing configuration branch: {0}")]
    UnsupportedKind(String),
    #[error("object store error: {0}")]
    Store(String),
    #[error("wrong bucket: {0} != {1}")]
    WrongBucket(String, String),
    #[error("bad object URI {uri:?}: {reason}")]
    BadUri { uri: String, reason: String },
}
