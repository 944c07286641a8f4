//! Users, as far as the core cares about them.

use chrono::{DateTime, Utc};

/// A user resolved from an OAuth identity. New users start disabled;
/// the very first user ever created becomes an enabled admin.
#[derive(Debug, Clone, Default)]
pub struct User {
    pub id: i64,
    pub oauth_id: String,
    pub email: String,
    pub admin: bool,
    pub disabled: bool,
    pub created_at: Option<DateTime<Utc>>,
}
