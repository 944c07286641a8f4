//! Runs: one per-frequency sweep over the eligible tables.

use chrono::{DateTime, Utc};

/// A durable run record. The run owns all jobs inserted for it; at most
/// one run per frequency may be unfinished (`end_time` null) at a time,
/// enforced by a partial unique index in the catalog.
#[derive(Debug, Clone, Default)]
pub struct Run {
    pub id: i64,
    /// Set only for interactively triggered runs.
    pub user_id: Option<i64>,
    pub created_at: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    /// Set when the run ends, also on failure.
    pub end_time: Option<DateTime<Utc>>,
    pub freq_id: i64,
    /// Joined from the frequency row on list queries.
    pub freq_name: String,
    /// Aggregated billed bytes over the run's jobs on list queries.
    pub total_bytes: i64,
    pub error: Option<String>,
}
