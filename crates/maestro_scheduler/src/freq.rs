//! Firing-time math for run frequencies.

use chrono::{DateTime, Duration, TimeZone, Utc};

/// Compute the next firing moment strictly after `now` for a frequency
/// with the given period and offset: the firing grid is
/// `floor(now, period) + offset` plus whole multiples of `period`.
///
/// With a negative offset the result may land in the past; callers are
/// expected to sleep briefly and recompute (the grid catches up within a
/// second).
pub fn next_firing(now: DateTime<Utc>, period: Duration, offset: Duration) -> DateTime<Utc> {
    let truncated = truncate(now, period);
    let candidate = truncated + offset;
    if candidate > now {
        candidate
    } else {
        truncated + period + offset
    }
}

/// Round down to a whole multiple of `period` since the Unix epoch.
fn truncate(t: DateTime<Utc>, period: Duration) -> DateTime<Utc> {
    let period_ns = period.num_nanoseconds().unwrap_or(0);
    if period_ns <= 0 {
        return t;
    }
    let ns = t.timestamp_nanos_opt().unwrap_or(0);
    Utc.timestamp_nanos(ns - ns.rem_euclid(period_ns))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2017, 8, 28, h, m, s).unwrap()
    }

    #[test]
    fn on_the_boundary_advances_a_full_period() {
        let next = next_firing(at(11, 30, 0), Duration::minutes(30), Duration::zero());
        assert_eq!(next, at(12, 0, 0));
    }

    #[test]
    fn just_before_the_boundary_fires_at_it() {
        let now = at(11, 29, 59) + Duration::nanoseconds(999_900_000);
        let next = next_firing(now, Duration::minutes(30), Duration::zero());
        assert_eq!(next, at(11, 30, 0));
    }

    #[test]
    fn negative_offset_shifts_the_grid_back() {
        let next = next_firing(at(11, 30, 0), Duration::minutes(30), Duration::seconds(-60));
        assert_eq!(next, at(11, 59, 0));
    }

    #[test]
    fn positive_offset_within_the_current_period() {
        // At 11:01 with a 30 minute period and 5 minute offset the next
        // firing is 11:05, not 11:35.
        let next = next_firing(at(11, 1, 0), Duration::minutes(30), Duration::minutes(5));
        assert_eq!(next, at(11, 5, 0));
    }

    #[test]
    fn daily_period() {
        let next = next_firing(at(11, 30, 0), Duration::days(1), Duration::hours(6));
        assert_eq!(next, Utc.with_ymd_and_hms(2017, 8, 29, 6, 0, 0).unwrap());
    }
}
