//! Log rows for extract-completion webhooks.

use chrono::{DateTime, Utc};

/// One webhook delivery: what was sent where, and how the other side
/// answered.
#[derive(Debug, Clone, Default)]
pub struct Notification {
    pub id: i64,
    pub table_id: i64,
    pub job_id: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub error: Option<String>,
    pub url: String,
    pub method: String,
    pub body: String,
    pub resp_status_code: i32,
    pub resp_status: String,
    pub resp_headers: String,
    pub resp_body: String,
}
