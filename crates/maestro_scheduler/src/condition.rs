//! Calendar conditions.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// A calendar predicate over months, weekdays, days-of-month and hours.
///
/// For each non-empty set, the corresponding field of the tested moment
/// must be a member. An entirely empty condition is satisfied by any
/// moment. The JSON form uses sorted integer arrays and omits empty
/// sets; weekdays are numbered 0 (Sunday) through 6 (Saturday).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub months: BTreeSet<u32>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub weekdays: BTreeSet<u32>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub days: BTreeSet<u32>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub hours: BTreeSet<u32>,
}

impl Condition {
    pub fn satisfied(&self, now: DateTime<Utc>) -> bool {
        if !self.months.is_empty() && !self.months.contains(&now.month()) {
            return false;
        }
        if !self.weekdays.is_empty()
            && !self.weekdays.contains(&now.weekday().num_days_from_sunday())
        {
            return false;
        }
        if !self.days.is_empty() && !self.days.contains(&now.day()) {
            return false;
        }
        if !self.hours.is_empty() && !self.hours.contains(&now.hour()) {
            return false;
        }
        true
    }

    /// Any satisfied entry satisfies the list; an empty list is
    /// satisfied too (used for run conditions).
    pub fn any_satisfied(conditions: &[Condition], now: DateTime<Utc>) -> bool {
        if conditions.is_empty() {
            return true;
        }
        conditions.iter().any(|c| c.satisfied(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cond(weekdays: &[u32], hours: &[u32]) -> Condition {
        Condition {
            weekdays: weekdays.iter().copied().collect(),
            hours: hours.iter().copied().collect(),
            ..Default::default()
        }
    }

    #[test]
    fn empty_condition_is_always_satisfied() {
        let c = Condition::default();
        assert!(c.satisfied(Utc::now()));
    }

    #[test]
    fn weekday_and_hour_must_both_match() {
        // 2017-08-28 is a Monday.
        let monday_9 = Utc.with_ymd_and_hms(2017, 8, 28, 9, 0, 0).unwrap();
        let monday_10 = Utc.with_ymd_and_hms(2017, 8, 28, 10, 0, 0).unwrap();
        let prev_monday_9 = Utc.with_ymd_and_hms(2017, 8, 21, 9, 0, 0).unwrap();

        let c = cond(&[1], &[9]); // Monday, 9am
        assert!(c.satisfied(monday_9));
        assert!(!c.satisfied(monday_10));
        // A different Monday at 9 satisfies as well - only the listed
        // fields are consulted.
        assert!(c.satisfied(prev_monday_9));

        let tue_wed_9 = Condition {
            weekdays: [2, 3].into_iter().collect(),
            hours: [9].into_iter().collect(),
            ..Default::default()
        };
        assert!(!tue_wed_9.satisfied(monday_9));
    }

    #[test]
    fn months_and_days() {
        let aug_28 = Utc.with_ymd_and_hms(2017, 8, 28, 0, 0, 0).unwrap();
        let c = Condition {
            months: [8].into_iter().collect(),
            days: [28].into_iter().collect(),
            ..Default::default()
        };
        assert!(c.satisfied(aug_28));

        let sep_28 = Utc.with_ymd_and_hms(2017, 9, 28, 0, 0, 0).unwrap();
        assert!(!c.satisfied(sep_28));
    }

    #[test]
    fn any_satisfied_ors_entries() {
        let monday = Utc.with_ymd_and_hms(2017, 8, 28, 9, 0, 0).unwrap();
        let sat = cond(&[6], &[]);
        let mon = cond(&[1], &[]);
        assert!(Condition::any_satisfied(&[sat.clone(), mon], monday));
        assert!(!Condition::any_satisfied(&[sat], monday));
        assert!(Condition::any_satisfied(&[], monday));
    }

    #[test]
    fn json_round_trip_sorted() {
        let c: Condition =
            serde_json::from_str(r#"{"weekdays":[5,1,3],"hours":[22,7]}"#).unwrap();
        assert_eq!(c.weekdays.iter().copied().collect::<Vec<_>>(), vec![1, 3, 5]);

        let json = serde_json::to_string(&c).unwrap();
        // Arrays come out ascending, empty sets are omitted.
        assert_eq!(json, r#"{"weekdays":[1,3,5],"hours":[7,22]}"#);

        let back: Condition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn missing_fields_mean_empty_sets() {
        let c: Condition = serde_json::from_str("{}").unwrap();
        assert!(c.months.is_empty() && c.weekdays.is_empty());
        assert!(c.days.is_empty() && c.hours.is_empty());
        assert_eq!(serde_json::to_string(&c).unwrap(), "{}");
    }
}
