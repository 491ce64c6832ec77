//! Calendars: named predicates over instants that triggers skip.

use std::collections::BTreeSet;

use {
    chrono::{DateTime, Datelike, NaiveDate, Utc},
    serde::{Deserialize, Serialize},
};

/// One civil day is excluded at a time, so a search never needs more steps
/// than the number of excluded entries plus one full week.
const MAX_DAY_SKIPS: u32 = 4_000;

/// A named exclusion calendar. Triggers referencing it skip any fire instant
/// the calendar excludes. The variant set is closed and versioned with the
/// persistence format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Calendar {
    /// Excludes whole civil days (UTC), e.g. public holidays.
    Holiday { excluded_dates: BTreeSet<NaiveDate> },
    /// Excludes whole weekdays, numbered 1 = Sunday .. 7 = Saturday.
    Weekly { excluded_days: BTreeSet<u8> },
}

impl Calendar {
    #[must_use]
    pub fn holiday(excluded_dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self::Holiday {
            excluded_dates: excluded_dates.into_iter().collect(),
        }
    }

    /// Weekend-excluding calendar (Saturday and Sunday).
    #[must_use]
    pub fn weekends() -> Self {
        Self::Weekly {
            excluded_days: BTreeSet::from([1, 7]),
        }
    }

    #[must_use]
    pub fn weekly(excluded_days: impl IntoIterator<Item = u8>) -> Self {
        Self::Weekly {
            excluded_days: excluded_days.into_iter().collect(),
        }
    }

    /// Whether the instant is allowed by this calendar.
    #[must_use]
    pub fn is_included_ms(&self, at_ms: u64) -> bool {
        let Some(dt) = DateTime::<Utc>::from_timestamp_millis(at_ms as i64) else {
            return false;
        };
        match self {
            Self::Holiday { excluded_dates } => !excluded_dates.contains(&dt.date_naive()),
            Self::Weekly { excluded_days } => {
                let dow = dt.weekday().num_days_from_sunday() as u8 + 1;
                !excluded_days.contains(&dow)
            },
        }
    }

    /// Smallest included instant `>= from_ms`, or `None` when the calendar
    /// excludes all future time.
    #[must_use]
    pub fn next_included_ms(&self, from_ms: u64) -> Option<u64> {
        if let Self::Weekly { excluded_days } = self {
            if (1..=7).all(|d| excluded_days.contains(&d)) {
                return None;
            }
        }
        let mut at = from_ms;
        for _ in 0..MAX_DAY_SKIPS {
            if self.is_included_ms(at) {
                return Some(at);
            }
            // Advance to the next UTC midnight.
            let dt = DateTime::<Utc>::from_timestamp_millis(at as i64)?;
            let next_day = dt.date_naive().succ_opt()?;
            at = next_day.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis() as u64;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(s: &str) -> u64 {
        s.parse::<DateTime<Utc>>().unwrap().timestamp_millis() as u64
    }

    #[test]
    fn test_holiday_excludes_whole_day() {
        let cal = Calendar::holiday([NaiveDate::from_ymd_opt(2024, 12, 25).unwrap()]);
        assert!(!cal.is_included_ms(ms("2024-12-25T09:00:00Z")));
        assert!(cal.is_included_ms(ms("2024-12-24T09:00:00Z")));
        assert!(cal.is_included_ms(ms("2024-12-26T00:00:00Z")));
    }

    #[test]
    fn test_weekends_calendar() {
        let cal = Calendar::weekends();
        // 2024-06-01 is a Saturday, 2024-06-03 a Monday.
        assert!(!cal.is_included_ms(ms("2024-06-01T12:00:00Z")));
        assert!(!cal.is_included_ms(ms("2024-06-02T12:00:00Z")));
        assert!(cal.is_included_ms(ms("2024-06-03T12:00:00Z")));
    }

    #[test]
    fn test_next_included_skips_to_monday() {
        let cal = Calendar::weekends();
        let next = cal.next_included_ms(ms("2024-06-01T12:00:00Z")).unwrap();
        assert_eq!(next, ms("2024-06-03T00:00:00Z"));
    }

    #[test]
    fn test_all_days_excluded_returns_none() {
        let cal = Calendar::weekly(1..=7);
        assert_eq!(cal.next_included_ms(ms("2024-06-01T12:00:00Z")), None);
    }

    #[test]
    fn test_serde_round_trip() {
        let cal = Calendar::holiday([NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()]);
        let json = serde_json::to_string(&cal).unwrap();
        let back: Calendar = serde_json::from_str(&json).unwrap();
        assert_eq!(cal, back);
    }
}
