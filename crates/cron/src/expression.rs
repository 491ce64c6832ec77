//! Quartz-style cron expressions: parsing and next-fire evaluation.

use std::{collections::BTreeSet, fmt, str::FromStr};

use {
    chrono::{Datelike, LocalResult, NaiveDate, NaiveTime, TimeZone, Timelike, Utc},
    chrono_tz::Tz,
};

use crate::{
    error::{ParseError, Result},
    field::{self, ValueSet},
};

const MIN_YEAR: i32 = 1970;
const MAX_YEAR: i32 = 2099;

/// Safety bound on the search loop. Far above anything a legal expression
/// needs (the year cut-off terminates real searches first).
const MAX_SEARCH_STEPS: u32 = 100_000;

/// Day-of-month constraint, including the `L`/`W` specials.
#[derive(Debug, Clone, PartialEq, Eq)]
enum DayOfMonth {
    /// `?` — the day-of-week field constrains instead.
    Unspecified,
    Days(ValueSet),
    /// `L` — last day of the month.
    Last,
    /// `LW` — last weekday (Mon..Fri) of the month.
    LastWeekday,
    /// `dW` — nearest weekday to day `d`, never crossing the month boundary.
    NearestWeekday(u8),
}

/// Day-of-week constraint. Numbering is 1 = Sunday .. 7 = Saturday.
#[derive(Debug, Clone, PartialEq, Eq)]
enum DayOfWeek {
    Unspecified,
    Days(ValueSet),
    /// `dL` — last occurrence of weekday `d` in the month.
    LastOfMonth(u8),
    /// `d#n` — the `n`-th occurrence of weekday `d` in the month.
    Nth { weekday: u8, nth: u8 },
}

/// A parsed cron expression.
///
/// Six or seven whitespace-separated fields: seconds, minutes, hours,
/// day-of-month, month, day-of-week, optional year. Exactly one of
/// day-of-month / day-of-week must be `?`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    seconds: ValueSet,
    minutes: ValueSet,
    hours: ValueSet,
    day_of_month: DayOfMonth,
    months: ValueSet,
    day_of_week: DayOfWeek,
    /// `None` = any year up to 2099.
    years: Option<BTreeSet<u16>>,
}

impl CronExpression {
    /// Parse an expression, reporting the byte offset of any invalid field.
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<(usize, &str)> = expr
            .split_whitespace()
            .map(|tok| (tok.as_ptr() as usize - expr.as_ptr() as usize, tok))
            .collect();

        if fields.len() < 6 || fields.len() > 7 {
            return Err(ParseError::new(
                0,
                format!("expected 6 or 7 fields, found {}", fields.len()),
            ));
        }

        let seconds = field::SECONDS.parse_list(fields[0].1, fields[0].0)?;
        let minutes = field::MINUTES.parse_list(fields[1].1, fields[1].0)?;
        let hours = field::HOURS.parse_list(fields[2].1, fields[2].0)?;
        let day_of_month = Self::parse_day_of_month(fields[3].1, fields[3].0)?;
        let months = field::MONTH.parse_list(fields[4].1, fields[4].0)?;
        let day_of_week = Self::parse_day_of_week(fields[5].1, fields[5].0)?;
        let years = match fields.get(6) {
            Some((at, tok)) => Self::parse_years(tok, *at)?,
            None => None,
        };

        match (&day_of_month, &day_of_week) {
            (DayOfMonth::Unspecified, DayOfWeek::Unspecified) => {
                return Err(ParseError::new(
                    fields[3].0,
                    "'?' cannot be used in both day-of-month and day-of-week",
                ));
            },
            (DayOfMonth::Unspecified, _) | (_, DayOfWeek::Unspecified) => {},
            _ => {
                return Err(ParseError::new(
                    fields[3].0,
                    "exactly one of day-of-month and day-of-week must be '?'",
                ));
            },
        }

        Ok(Self {
            source: expr.trim().to_string(),
            seconds,
            minutes,
            hours,
            day_of_month,
            months,
            day_of_week,
            years,
        })
    }

    fn parse_day_of_month(tok: &str, at: usize) -> Result<DayOfMonth> {
        let upper = tok.to_ascii_uppercase();
        match upper.as_str() {
            "?" => Ok(DayOfMonth::Unspecified),
            "L" => Ok(DayOfMonth::Last),
            "LW" => Ok(DayOfMonth::LastWeekday),
            _ if upper.ends_with('W') => {
                let day = field::DAY_OF_MONTH.value(&upper[..upper.len() - 1], at)?;
                Ok(DayOfMonth::NearestWeekday(day))
            },
            _ => Ok(DayOfMonth::Days(
                field::DAY_OF_MONTH.parse_list(tok, at)?,
            )),
        }
    }

    fn parse_day_of_week(tok: &str, at: usize) -> Result<DayOfWeek> {
        let upper = tok.to_ascii_uppercase();
        if upper == "?" {
            return Ok(DayOfWeek::Unspecified);
        }
        if let Some(prefix) = upper.strip_suffix('L') {
            // Bare `L` in day-of-week would be legal Quartz shorthand for
            // Saturday, but it reads as a mistake more often than not.
            let weekday = field::DAY_OF_WEEK.value(prefix, at)?;
            return Ok(DayOfWeek::LastOfMonth(weekday));
        }
        if let Some((day, nth)) = upper.split_once('#') {
            let weekday = field::DAY_OF_WEEK.value(day, at)?;
            let nth: u8 = nth
                .parse()
                .ok()
                .filter(|n| (1..=5).contains(n))
                .ok_or_else(|| {
                    ParseError::new(at, format!("'#' ordinal must be 1..=5, got '{nth}'"))
                })?;
            return Ok(DayOfWeek::Nth { weekday, nth });
        }
        Ok(DayOfWeek::Days(field::DAY_OF_WEEK.parse_list(tok, at)?))
    }

    fn parse_years(tok: &str, at: usize) -> Result<Option<BTreeSet<u16>>> {
        if tok == "*" {
            return Ok(None);
        }
        let value = |s: &str| -> Result<u16> {
            s.parse::<u16>()
                .ok()
                .filter(|y| (MIN_YEAR as u16..=MAX_YEAR as u16).contains(y))
                .ok_or_else(|| {
                    ParseError::new(
                        at,
                        format!("year value '{s}' out of range {MIN_YEAR}..={MAX_YEAR}"),
                    )
                })
        };
        let mut years = BTreeSet::new();
        for part in tok.split(',') {
            let (base, step) = match part.split_once('/') {
                Some((base, step_str)) => {
                    let step: u16 = step_str.parse().ok().filter(|s| *s > 0).ok_or_else(|| {
                        ParseError::new(at, format!("invalid year step '{step_str}'"))
                    })?;
                    (base, step)
                },
                None => (part, 1),
            };
            let (start, end) = if base == "*" {
                (MIN_YEAR as u16, MAX_YEAR as u16)
            } else if let Some((lo, hi)) = base.split_once('-') {
                let (lo, hi) = (value(lo)?, value(hi)?);
                if lo > hi {
                    return Err(ParseError::new(
                        at,
                        format!("year range {lo}-{hi} is inverted"),
                    ));
                }
                (lo, hi)
            } else {
                let v = value(base)?;
                match part.contains('/') {
                    true => (v, MAX_YEAR as u16),
                    false => (v, v),
                }
            };
            years.extend((start..=end).step_by(step as usize));
        }
        Ok(Some(years))
    }

    /// The normalized source text of the expression.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Next instant (epoch millis) strictly after `after_ms` that satisfies
    /// the expression, evaluated in `tz`. `None` when no such instant exists
    /// on or before the year 2099.
    ///
    /// Local times skipped by a DST spring-forward are treated as
    /// non-existent; repeated local times (fall-back) resolve to their first
    /// occurrence.
    #[must_use]
    pub fn next_after_ms(&self, after_ms: u64, tz: Tz) -> Option<u64> {
        let after = Utc.timestamp_millis_opt(after_ms as i64).single()?;
        let local = after.with_timezone(&tz);
        let mut cur = Cursor {
            year: local.year(),
            month: local.month(),
            day: local.day(),
            hour: local.hour(),
            minute: local.minute(),
            second: local.second() + 1,
        };

        for _ in 0..MAX_SEARCH_STEPS {
            if !self.align(&mut cur) {
                return None;
            }
            let date = NaiveDate::from_ymd_opt(cur.year, cur.month, cur.day)?;
            let time = NaiveTime::from_hms_opt(cur.hour, cur.minute, cur.second)?;
            match tz.from_local_datetime(&date.and_time(time)) {
                LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => {
                    let ms = dt.timestamp_millis();
                    if ms > after_ms as i64 {
                        return Some(ms as u64);
                    }
                    // Fall-back fold can map a later wall-clock time to an
                    // earlier instant; step past it and keep searching.
                    cur.second += 1;
                },
                LocalResult::None => {
                    // Spring-forward gap: this local time does not exist and
                    // is forgotten, not shifted.
                    cur.second = 0;
                    cur.minute += 1;
                },
            }
        }
        None
    }

    /// Advance `cur` to the next local time satisfying every field.
    /// Returns false when the year range is exhausted.
    fn align(&self, cur: &mut Cursor) -> bool {
        // Seconds.
        if cur.second > 59 {
            cur.second = 0;
            cur.minute += 1;
        }
        match self.seconds.first_at_or_after(cur.second as u8) {
            Some(s) => cur.second = s as u32,
            None => {
                cur.second = self.seconds.min() as u32;
                cur.minute += 1;
            },
        }

        // Minutes.
        if cur.minute > 59 {
            cur.minute = 0;
            cur.hour += 1;
        }
        match self.minutes.first_at_or_after(cur.minute as u8) {
            Some(m) if m as u32 == cur.minute => {},
            Some(m) => {
                cur.minute = m as u32;
                cur.second = self.seconds.min() as u32;
            },
            None => {
                cur.minute = self.minutes.min() as u32;
                cur.second = self.seconds.min() as u32;
                cur.hour += 1;
            },
        }

        // Hours.
        if cur.hour > 23 {
            cur.hour = 0;
            cur.day += 1;
        }
        match self.hours.first_at_or_after(cur.hour as u8) {
            Some(h) if h as u32 == cur.hour => {},
            Some(h) => {
                cur.hour = h as u32;
                cur.minute = self.minutes.min() as u32;
                cur.second = self.seconds.min() as u32;
            },
            None => {
                cur.reset_time(self);
                cur.day += 1;
            },
        }

        // Date: year, month, then the day constraint, with carries.
        loop {
            if cur.month > 12 {
                cur.month = 1;
                cur.year += 1;
                cur.day = 1;
                cur.reset_time(self);
            }

            match self.next_allowed_year(cur.year) {
                None => return false,
                Some(y) if y != cur.year => {
                    cur.year = y;
                    cur.month = 1;
                    cur.day = 1;
                    cur.reset_time(self);
                },
                Some(_) => {},
            }

            match self.months.first_at_or_after(cur.month as u8) {
                Some(m) if m as u32 == cur.month => {},
                Some(m) => {
                    cur.month = m as u32;
                    cur.day = 1;
                    cur.reset_time(self);
                },
                None => {
                    cur.month = 13; // carry into the next year
                    continue;
                },
            }

            let Some(dim) = days_in_month(cur.year, cur.month) else {
                return false;
            };
            if cur.day > dim {
                cur.day = 1;
                cur.month += 1;
                cur.reset_time(self);
                continue;
            }

            match self.next_matching_day(cur.year, cur.month, cur.day, dim) {
                Some(d) => {
                    if d != cur.day {
                        cur.day = d;
                        cur.reset_time(self);
                    }
                    return true;
                },
                None => {
                    cur.day = 1;
                    cur.month += 1;
                    cur.reset_time(self);
                },
            }
        }
    }

    /// Smallest day in `from..=dim` of the given month satisfying the day
    /// constraint, or `None` when the month has no such day.
    fn next_matching_day(&self, year: i32, month: u32, from: u32, dim: u32) -> Option<u32> {
        match (&self.day_of_month, &self.day_of_week) {
            (DayOfMonth::Unspecified, dow) => match dow {
                DayOfWeek::Days(set) => {
                    (from..=dim).find(|d| set.contains(weekday_num(year, month, *d)))
                },
                DayOfWeek::LastOfMonth(w) => {
                    let d = (1..=dim).rev().find(|d| weekday_num(year, month, *d) == *w)?;
                    (d >= from).then_some(d)
                },
                DayOfWeek::Nth { weekday, nth } => {
                    let first = (1..=7).find(|d| weekday_num(year, month, *d) == *weekday)?;
                    let d = first + 7 * (*nth as u32 - 1);
                    (d <= dim && d >= from).then_some(d)
                },
                DayOfWeek::Unspecified => None,
            },
            (dom, _) => match dom {
                DayOfMonth::Days(set) => (from..=dim).find(|d| set.contains(*d as u8)),
                DayOfMonth::Last => Some(dim),
                DayOfMonth::LastWeekday => {
                    let d = match weekday_num(year, month, dim) {
                        7 => dim - 1, // Saturday
                        1 => dim - 2, // Sunday
                        _ => dim,
                    };
                    (d >= from).then_some(d)
                },
                DayOfMonth::NearestWeekday(target) => {
                    let target = *target as u32;
                    if target > dim {
                        return None;
                    }
                    let d = match weekday_num(year, month, target) {
                        7 if target == 1 => target + 2,
                        7 => target - 1,
                        1 if target == dim => target - 2,
                        1 => target + 1,
                        _ => target,
                    };
                    (d >= from).then_some(d)
                },
                DayOfMonth::Unspecified => None,
            },
        }
    }

    fn next_allowed_year(&self, from: i32) -> Option<i32> {
        if from > MAX_YEAR {
            return None;
        }
        let from = from.max(MIN_YEAR);
        match &self.years {
            None => Some(from),
            Some(set) => set.range(from as u16..).next().map(|y| *y as i32),
        }
    }
}

/// Local wall-clock cursor used by the search. Fields may transiently
/// overflow their ranges; `align` normalizes the carries.
struct Cursor {
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
}

impl Cursor {
    /// Reset the time-of-day fields to the smallest allowed values after a
    /// date field advances.
    fn reset_time(&mut self, expr: &CronExpression) {
        self.second = expr.seconds.min() as u32;
        self.minute = expr.minutes.min() as u32;
        self.hour = expr.hours.min() as u32;
    }
}

/// Weekday of a civil date, numbered 1 = Sunday .. 7 = Saturday.
/// Out-of-range dates return 0, which matches no constraint.
fn weekday_num(year: i32, month: u32, day: u32) -> u8 {
    NaiveDate::from_ymd_opt(year, month, day)
        .map(|d| d.weekday().num_days_from_sunday() as u8 + 1)
        .unwrap_or(0)
}

fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let (ny, nm) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(ny, nm, 1)?.pred_opt().map(|d| d.day())
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for CronExpression {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {chrono::DateTime, chrono_tz::Tz, rstest::rstest};

    use super::*;

    fn ms(s: &str) -> u64 {
        s.parse::<DateTime<chrono::Utc>>().unwrap().timestamp_millis() as u64
    }

    fn next(expr: &str, after: &str) -> Option<String> {
        next_in(expr, after, chrono_tz::UTC)
    }

    fn next_in(expr: &str, after: &str, tz: Tz) -> Option<String> {
        let cron = CronExpression::parse(expr).unwrap();
        cron.next_after_ms(ms(after), tz).map(|t| {
            DateTime::from_timestamp_millis(t as i64)
                .unwrap()
                .format("%Y-%m-%dT%H:%M:%SZ")
                .to_string()
        })
    }

    #[test]
    fn test_daily_noon() {
        let cron = CronExpression::parse("0 0 12 * * ?").unwrap();
        let mut t = ms("2024-01-01T00:00:00Z");
        let mut fires = Vec::new();
        for _ in 0..3 {
            t = cron.next_after_ms(t, chrono_tz::UTC).unwrap();
            fires.push(t);
        }
        assert_eq!(
            fires,
            vec![
                ms("2024-01-01T12:00:00Z"),
                ms("2024-01-02T12:00:00Z"),
                ms("2024-01-03T12:00:00Z"),
            ]
        );
    }

    #[test]
    fn test_weekday_mornings_skip_weekend() {
        assert_eq!(
            next("0 15 10 ? * MON-FRI", "2024-06-01T00:00:00Z"),
            Some("2024-06-03T10:15:00Z".into())
        );
    }

    #[test]
    fn test_third_friday() {
        let cron = CronExpression::parse("0 15 10 ? * 6#3").unwrap();
        let mut t = ms("2024-01-01T00:00:00Z");
        let mut fires = Vec::new();
        for _ in 0..3 {
            t = cron.next_after_ms(t, chrono_tz::UTC).unwrap();
            fires.push(t);
        }
        assert_eq!(
            fires,
            vec![
                ms("2024-01-19T10:15:00Z"),
                ms("2024-02-16T10:15:00Z"),
                ms("2024-03-15T10:15:00Z"),
            ]
        );
    }

    #[test]
    fn test_last_day_of_month() {
        let cron = CronExpression::parse("0 15 10 L * ?").unwrap();
        let mut t = ms("2024-01-01T00:00:00Z");
        let mut fires = Vec::new();
        for _ in 0..3 {
            t = cron.next_after_ms(t, chrono_tz::UTC).unwrap();
            fires.push(t);
        }
        assert_eq!(
            fires,
            vec![
                ms("2024-01-31T10:15:00Z"),
                ms("2024-02-29T10:15:00Z"), // leap year
                ms("2024-03-31T10:15:00Z"),
            ]
        );
    }

    #[test]
    fn test_last_weekday_of_month() {
        // June 2024 ends on a Sunday; the last weekday is Friday the 28th.
        assert_eq!(
            next("0 0 0 LW * ?", "2024-06-05T00:00:00Z"),
            Some("2024-06-28T00:00:00Z".into())
        );
    }

    #[test]
    fn test_nearest_weekday() {
        // 2024-06-15 is a Saturday: nearest weekday is Friday the 14th.
        assert_eq!(
            next("0 0 0 15W * ?", "2024-06-01T00:00:00Z"),
            Some("2024-06-14T00:00:00Z".into())
        );
        // 2024-09-15 is a Sunday: nearest weekday is Monday the 16th.
        assert_eq!(
            next("0 0 0 15W * ?", "2024-09-01T00:00:00Z"),
            Some("2024-09-16T00:00:00Z".into())
        );
    }

    #[test]
    fn test_nearest_weekday_does_not_cross_month() {
        // 2024-06-01 is a Saturday at the month start: move forward to Monday
        // the 3rd instead of crossing back into May.
        assert_eq!(
            next("0 0 0 1W * ?", "2024-05-31T23:00:00Z"),
            Some("2024-06-03T00:00:00Z".into())
        );
    }

    #[test]
    fn test_last_monday_of_month() {
        assert_eq!(
            next("0 0 0 ? * 2L", "2024-01-01T00:00:00Z"),
            Some("2024-01-29T00:00:00Z".into())
        );
    }

    #[test]
    fn test_fifth_friday_skips_short_months() {
        // Neither January nor February 2024 has a fifth Friday; March does.
        assert_eq!(
            next("0 0 0 ? * 6#5", "2024-01-01T00:00:00Z"),
            Some("2024-03-29T00:00:00Z".into())
        );
    }

    #[test]
    fn test_year_field() {
        let cron = CronExpression::parse("0 0 0 1 1 ? 2030").unwrap();
        let first = cron
            .next_after_ms(ms("2024-01-01T00:00:00Z"), chrono_tz::UTC)
            .unwrap();
        assert_eq!(first, ms("2030-01-01T00:00:00Z"));
        assert_eq!(cron.next_after_ms(first, chrono_tz::UTC), None);
    }

    #[test]
    fn test_exhausted_past_2099() {
        let cron = CronExpression::parse("0 0 0 1 1 ? 2024").unwrap();
        assert_eq!(cron.next_after_ms(ms("2025-01-01T00:00:00Z"), chrono_tz::UTC), None);
    }

    #[test]
    fn test_strictly_after() {
        let cron = CronExpression::parse("0 0 12 * * ?").unwrap();
        let noon = ms("2024-01-01T12:00:00Z");
        assert_eq!(
            cron.next_after_ms(noon, chrono_tz::UTC),
            Some(ms("2024-01-02T12:00:00Z"))
        );
    }

    #[test]
    fn test_every_minute_in_timezone() {
        assert_eq!(
            next_in(
                "0 * * * * ?",
                "2024-02-01T10:30:15Z",
                chrono_tz::Europe::Paris
            ),
            Some("2024-02-01T10:31:00Z".into())
        );
    }

    #[test]
    fn test_dst_spring_forward_skips_gap_time() {
        // America/New_York springs forward 2024-03-10 02:00 -> 03:00.
        // A daily 02:30 local fire on the 10th is forgotten; the next fire is
        // the 11th at 02:30 EDT (06:30Z).
        assert_eq!(
            next_in(
                "0 30 2 * * ?",
                "2024-03-09T12:00:00Z",
                chrono_tz::America::New_York
            ),
            Some("2024-03-11T06:30:00Z".into())
        );
    }

    #[test]
    fn test_dst_spring_forward_every_minute_resumes_after_gap() {
        // Every-minute schedule crosses the gap: 01:59 EST is followed by
        // 03:00 EDT.
        let cron = CronExpression::parse("0 * * * * ?").unwrap();
        let before_gap = ms("2024-03-10T06:59:00Z"); // 01:59 EST
        assert_eq!(
            cron.next_after_ms(before_gap, chrono_tz::America::New_York),
            Some(ms("2024-03-10T07:00:00Z")) // 03:00 EDT
        );
    }

    #[test]
    fn test_dst_fall_back_fires_first_occurrence_only() {
        // America/New_York falls back 2024-11-03 02:00 -> 01:00; 01:30 local
        // occurs twice. Fire on the first occurrence (EDT, 05:30Z) and skip
        // the repeat.
        let cron = CronExpression::parse("0 30 1 * * ?").unwrap();
        let midnight_local = ms("2024-11-03T04:00:00Z");
        let first = cron
            .next_after_ms(midnight_local, chrono_tz::America::New_York)
            .unwrap();
        assert_eq!(first, ms("2024-11-03T05:30:00Z"));
        // The next fire is the following day, not the second occurrence.
        assert_eq!(
            cron.next_after_ms(first, chrono_tz::America::New_York),
            Some(ms("2024-11-04T06:30:00Z"))
        );
    }

    #[test]
    fn test_daily_fire_holds_local_time_across_dst() {
        // 10:15 local on the spring-forward day still fires at 10:15 local.
        assert_eq!(
            next_in(
                "0 15 10 ? * *",
                "2024-03-10T00:00:00Z",
                chrono_tz::America::New_York
            ),
            Some("2024-03-10T14:15:00Z".into()) // 10:15 EDT
        );
    }

    #[rstest]
    #[case("* * * * *")] // five fields
    #[case("0 0 0 * * ? 2024 extra")] // eight fields
    #[case("0 0 0 ? * ?")] // both '?'
    #[case("0 0 0 * * *")] // neither '?'
    #[case("0 0 25 * * ?")] // hour out of range
    #[case("0 0 0 32 * ?")] // day out of range
    #[case("0 0 0 ? * 8")] // weekday out of range
    #[case("0 0 0 ? * 6#6")] // ordinal out of range
    #[case("0 0 0 0W * ?")] // W day out of range
    #[case("0 0 0 * FOO ?")] // bad month name
    #[case("0 0 0 1 1 ? 1969")] // year below range
    #[case("0 0 0 1 1 ? 2100")] // year above range
    fn test_parse_rejects(#[case] expr: &str) {
        assert!(CronExpression::parse(expr).is_err());
    }

    #[rstest]
    #[case("0 0 12 * * ?")]
    #[case("0 15 10 ? * MON-FRI")]
    #[case("0 15 10 L * ?")]
    #[case("0 0/5 14,18 * * ?")]
    #[case("0 15 10 ? * 6#3 2024-2030")]
    fn test_display_round_trip(#[case] expr: &str) {
        let parsed = CronExpression::parse(expr).unwrap();
        let reparsed = CronExpression::parse(&parsed.to_string()).unwrap();
        assert_eq!(parsed, reparsed);
    }

    #[test]
    fn test_parse_error_position_points_at_field() {
        let err = CronExpression::parse("0 0 12 * BAD ?").unwrap_err();
        assert_eq!(err.position, 9);
    }

    #[test]
    fn test_seconds_and_steps() {
        assert_eq!(
            next("15/20 * * * * ?", "2024-01-01T00:00:00Z"),
            Some("2024-01-01T00:00:15Z".into())
        );
        assert_eq!(
            next("15/20 * * * * ?", "2024-01-01T00:00:15Z"),
            Some("2024-01-01T00:00:35Z".into())
        );
        assert_eq!(
            next("15/20 * * * * ?", "2024-01-01T00:00:55Z"),
            Some("2024-01-01T00:01:15Z".into())
        );
    }
}
