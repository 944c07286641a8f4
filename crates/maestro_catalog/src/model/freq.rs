//! Run frequencies.

use chrono::Duration;

/// A named firing schedule. Periods and offsets are whole seconds in
/// the catalog; `offset` must be smaller than `period`. Firing moments
/// are `floor(now, period) + offset` plus period multiples.
#[derive(Debug, Clone)]
pub struct Freq {
    pub id: i64,
    pub name: String,
    pub period: Duration,
    pub offset: Duration,
    pub active: bool,
}

impl Freq {
    pub fn period_secs(&self) -> i64 {
        self.period.num_seconds()
    }

    pub fn offset_secs(&self) -> i64 {
        self.offset.num_seconds()
    }
}
