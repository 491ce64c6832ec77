//! Trigger model: schedule variants, next-fire computation, misfire handling.

use std::fmt;

use {
    belfry_cron::CronExpression,
    chrono::{Months, TimeZone, Utc},
    chrono_tz::Tz,
    serde::{Deserialize, Serialize},
};

use crate::{
    calendar::Calendar,
    error::{Result, SchedulerError},
    job::{JobDataMap, JobExecutionError},
    key::{JobKey, TriggerKey},
    store::CompletionInstruction,
};

/// Priority used when none is given. Higher fires first on equal fire times.
pub const DEFAULT_PRIORITY: i32 = 5;

/// Bound on calendar-exclusion skips before a trigger gives up and
/// completes. A calendar that excludes everything hits this.
const MAX_CALENDAR_SKIPS: u32 = 5_000;

/// Bound on month-arithmetic steps for calendar-interval schedules.
const MAX_MONTH_STEPS: u32 = 12_000;

/// Repeat forever.
pub const REPEAT_INDEFINITELY: i32 = -1;

/// Lifecycle state of a trigger, owned by the job store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TriggerState {
    /// Eligible for acquisition.
    Waiting,
    /// Reserved by the dispatcher for imminent firing.
    Acquired,
    /// A fired bundle for it is running.
    Executing,
    Paused,
    /// Paused while also blocked by a concurrency-restricted job.
    PausedBlocked,
    /// Held back because its job disallows concurrent execution.
    Blocked,
    /// Will never fire again.
    Complete,
    Error,
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Waiting => "waiting",
            Self::Acquired => "acquired",
            Self::Executing => "executing",
            Self::Paused => "paused",
            Self::PausedBlocked => "pausedBlocked",
            Self::Blocked => "blocked",
            Self::Complete => "complete",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TriggerState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "acquired" => Ok(Self::Acquired),
            "executing" => Ok(Self::Executing),
            "paused" => Ok(Self::Paused),
            "pausedBlocked" => Ok(Self::PausedBlocked),
            "blocked" => Ok(Self::Blocked),
            "complete" => Ok(Self::Complete),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown trigger state: {other}")),
        }
    }
}

/// Misfire remedy for simple (fixed-interval) triggers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SimpleMisfire {
    /// Fire immediately. For repeating triggers this behaves like
    /// [`RescheduleNowWithRemainingCount`](Self::RescheduleNowWithRemainingCount).
    #[default]
    FireNow,
    RescheduleNowWithExistingCount,
    RescheduleNowWithRemainingCount,
    RescheduleNextWithExistingCount,
    RescheduleNextWithRemainingCount,
}

/// Misfire remedy for cron triggers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CronMisfire {
    /// Fire once immediately, then return to the regular schedule.
    #[default]
    FireOnceNow,
    /// Skip the missed fires; advance to the first time strictly after now.
    DoNothing,
}

/// Misfire remedy for calendar-interval triggers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IntervalMisfire {
    #[default]
    FireOnceNow,
    DoNothing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IntervalUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

/// Firing rule of a trigger. Closed set: next-fire computation is a match on
/// the variant, and the persistence format is versioned with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Schedule {
    /// Fixed-interval repetition. `repeat_count` of -1 means forever; a
    /// count of `n` yields `n + 1` total fires.
    Simple {
        repeat_count: i32,
        repeat_interval_ms: u64,
        #[serde(default)]
        times_triggered: u32,
        #[serde(default)]
        misfire: SimpleMisfire,
    },
    /// Cron expression, evaluated in an IANA time zone (UTC when omitted).
    Cron {
        expression: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
        #[serde(default)]
        misfire: CronMisfire,
    },
    /// Calendar-aware interval: months follow civil month lengths, the other
    /// units are fixed durations.
    CalendarInterval {
        interval: u32,
        unit: IntervalUnit,
        #[serde(default)]
        misfire: IntervalMisfire,
    },
}

impl Schedule {
    /// One-shot at the trigger's start time.
    #[must_use]
    pub fn once() -> Self {
        Self::Simple {
            repeat_count: 0,
            repeat_interval_ms: 0,
            times_triggered: 0,
            misfire: SimpleMisfire::FireNow,
        }
    }

    #[must_use]
    pub fn simple(repeat_count: i32, repeat_interval_ms: u64) -> Self {
        Self::Simple {
            repeat_count,
            repeat_interval_ms,
            times_triggered: 0,
            misfire: SimpleMisfire::default(),
        }
    }

    #[must_use]
    pub fn cron(expression: impl Into<String>) -> Self {
        Self::Cron {
            expression: expression.into(),
            timezone: None,
            misfire: CronMisfire::default(),
        }
    }

    /// Discriminant used by persistent stores.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Simple { .. } => "simple",
            Self::Cron { .. } => "cron",
            Self::CalendarInterval { .. } => "calendarInterval",
        }
    }
}

/// A firing rule bound to a job. `previous_fire_at_ms` and `next_fire_at_ms`
/// are maintained by [`triggered`](Trigger::triggered) and the misfire
/// handlers; the store owns the [`TriggerState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub key: TriggerKey,
    pub job_key: JobKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calendar_name: Option<String>,
    pub priority: i32,
    pub start_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_fire_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_fire_at_ms: Option<u64>,
    #[serde(default)]
    pub data: JobDataMap,
    pub schedule: Schedule,
}

impl Trigger {
    #[must_use]
    pub fn new(key: TriggerKey, job_key: JobKey, start_at_ms: u64, schedule: Schedule) -> Self {
        Self {
            key,
            job_key,
            description: None,
            calendar_name: None,
            priority: DEFAULT_PRIORITY,
            start_at_ms,
            end_at_ms: None,
            previous_fire_at_ms: None,
            next_fire_at_ms: None,
            data: JobDataMap::default(),
            schedule,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_calendar(mut self, calendar_name: impl Into<String>) -> Self {
        self.calendar_name = Some(calendar_name.into());
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_end_at(mut self, end_at_ms: u64) -> Self {
        self.end_at_ms = Some(end_at_ms);
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: JobDataMap) -> Self {
        self.data = data;
        self
    }

    /// Check the schedule definition without evaluating it.
    pub fn validate(&self) -> Result<()> {
        match &self.schedule {
            Schedule::Simple {
                repeat_count,
                repeat_interval_ms,
                ..
            } => {
                if *repeat_count < REPEAT_INDEFINITELY {
                    return Err(SchedulerError::invalid_argument(format!(
                        "repeat count must be >= -1, got {repeat_count}"
                    )));
                }
                if *repeat_interval_ms == 0 && *repeat_count != 0 {
                    return Err(SchedulerError::invalid_argument(
                        "repeat interval must be > 0 for a repeating trigger",
                    ));
                }
            },
            Schedule::Cron {
                expression,
                timezone,
                ..
            } => {
                CronExpression::parse(expression)?;
                if let Some(tz) = timezone {
                    self.parse_tz(tz)?;
                }
            },
            Schedule::CalendarInterval { interval, .. } => {
                if *interval == 0 {
                    return Err(SchedulerError::invalid_argument(
                        "calendar interval must be > 0",
                    ));
                }
            },
        }
        Ok(())
    }

    fn parse_tz(&self, timezone: &str) -> Result<Tz> {
        timezone
            .parse::<Tz>()
            .map_err(|_| SchedulerError::unknown_timezone(timezone))
    }

    /// Fire time strictly after `after_ms`, ignoring any calendar. `None`
    /// when the schedule is exhausted or past its end time.
    pub fn fire_time_after(&self, after_ms: u64) -> Result<Option<u64>> {
        let candidate = match &self.schedule {
            Schedule::Simple {
                repeat_count,
                repeat_interval_ms,
                times_triggered,
                ..
            } => {
                if *repeat_count != REPEAT_INDEFINITELY && *times_triggered as i64 > *repeat_count as i64
                {
                    None
                } else if after_ms < self.start_at_ms {
                    Some(self.start_at_ms)
                } else if *repeat_interval_ms == 0 {
                    None
                } else {
                    let n = (after_ms - self.start_at_ms) / repeat_interval_ms + 1;
                    if *repeat_count != REPEAT_INDEFINITELY && n > *repeat_count as u64 {
                        None
                    } else {
                        Some(self.start_at_ms + n * repeat_interval_ms)
                    }
                }
            },
            Schedule::Cron {
                expression,
                timezone,
                ..
            } => {
                let cron = CronExpression::parse(expression)?;
                let tz = match timezone {
                    Some(tz) => self.parse_tz(tz)?,
                    None => chrono_tz::UTC,
                };
                let from = after_ms.max(self.start_at_ms.saturating_sub(1));
                cron.next_after_ms(from, tz)
            },
            Schedule::CalendarInterval { interval, unit, .. } => {
                self.interval_fire_after(after_ms, *interval, *unit)?
            },
        };
        Ok(candidate.filter(|t| match self.end_at_ms {
            Some(end) => *t <= end,
            None => true,
        }))
    }

    fn interval_fire_after(
        &self,
        after_ms: u64,
        interval: u32,
        unit: IntervalUnit,
    ) -> Result<Option<u64>> {
        if after_ms < self.start_at_ms {
            return Ok(Some(self.start_at_ms));
        }
        let step_ms = match unit {
            IntervalUnit::Second => Some(1_000),
            IntervalUnit::Minute => Some(60_000),
            IntervalUnit::Hour => Some(3_600_000),
            IntervalUnit::Day => Some(86_400_000),
            IntervalUnit::Week => Some(7 * 86_400_000),
            IntervalUnit::Month => None,
        };
        if let Some(unit_ms) = step_ms {
            let step = unit_ms * interval as u64;
            let n = (after_ms - self.start_at_ms) / step + 1;
            return Ok(Some(self.start_at_ms + n * step));
        }

        // Months follow the civil calendar, so lengths vary: walk forward
        // from a cheap lower bound.
        let start = Utc
            .timestamp_millis_opt(self.start_at_ms as i64)
            .single()
            .ok_or_else(|| SchedulerError::invalid_argument("start time out of range"))?;
        let mut n = (after_ms - self.start_at_ms) / (31 * 86_400_000 * interval as u64);
        for _ in 0..MAX_MONTH_STEPS {
            n += 1;
            let months = (n as u32).checked_mul(interval);
            let candidate = months
                .and_then(|m| start.checked_add_months(Months::new(m)))
                .map(|dt| dt.timestamp_millis() as u64);
            match candidate {
                Some(t) if t > after_ms => return Ok(Some(t)),
                Some(_) => {},
                None => return Ok(None),
            }
        }
        Ok(None)
    }

    /// Advance past instants the calendar excludes. Gives up (completing the
    /// trigger) after [`MAX_CALENDAR_SKIPS`] exclusions.
    fn filter_by_calendar(
        &self,
        mut candidate: Option<u64>,
        calendar: Option<&Calendar>,
    ) -> Result<Option<u64>> {
        let Some(cal) = calendar else {
            return Ok(candidate);
        };
        for _ in 0..MAX_CALENDAR_SKIPS {
            match candidate {
                Some(t) if !cal.is_included_ms(t) => candidate = self.fire_time_after(t)?,
                _ => return Ok(candidate),
            }
        }
        Ok(None)
    }

    /// Compute and record the first fire time at or after the start time.
    pub fn compute_first_fire(&mut self, calendar: Option<&Calendar>) -> Result<Option<u64>> {
        let first = match &self.schedule {
            Schedule::Simple { .. } | Schedule::CalendarInterval { .. } => Some(self.start_at_ms),
            Schedule::Cron { .. } => self.fire_time_after(self.start_at_ms.saturating_sub(1))?,
        };
        let first = first.filter(|t| match self.end_at_ms {
            Some(end) => *t <= end,
            None => true,
        });
        let first = self.filter_by_calendar(first, calendar)?;
        self.next_fire_at_ms = first;
        Ok(first)
    }

    /// Record a fire: shift `next` into `previous` and compute the new next
    /// fire time, honouring the calendar.
    pub fn triggered(&mut self, calendar: Option<&Calendar>) -> Result<()> {
        if let Schedule::Simple {
            times_triggered, ..
        } = &mut self.schedule
        {
            *times_triggered += 1;
        }
        let fired_at = self.next_fire_at_ms;
        let next = match fired_at {
            Some(t) => self.fire_time_after(t)?,
            None => None,
        };
        let next = self.filter_by_calendar(next, calendar)?;
        self.previous_fire_at_ms = fired_at;
        self.next_fire_at_ms = next;
        Ok(())
    }

    /// Whether any future fire remains.
    #[must_use]
    pub fn may_fire_again(&self) -> bool {
        self.next_fire_at_ms.is_some()
    }

    /// Apply the trigger's misfire instruction: the scheduler has decided
    /// this trigger missed its fire time by more than the misfire threshold.
    pub fn update_after_misfire(
        &mut self,
        calendar: Option<&Calendar>,
        now_ms: u64,
    ) -> Result<()> {
        let next = match &self.schedule {
            Schedule::Cron { misfire, .. } => match misfire {
                CronMisfire::FireOnceNow => Some(now_ms),
                CronMisfire::DoNothing => {
                    self.filter_by_calendar(self.fire_time_after(now_ms)?, calendar)?
                },
            },
            Schedule::CalendarInterval { misfire, .. } => match misfire {
                IntervalMisfire::FireOnceNow => Some(now_ms),
                IntervalMisfire::DoNothing => {
                    self.filter_by_calendar(self.fire_time_after(now_ms)?, calendar)?
                },
            },
            Schedule::Simple { .. } => return self.update_simple_after_misfire(calendar, now_ms),
        };
        self.next_fire_at_ms = next;
        Ok(())
    }

    fn update_simple_after_misfire(
        &mut self,
        calendar: Option<&Calendar>,
        now_ms: u64,
    ) -> Result<()> {
        let Schedule::Simple {
            repeat_count,
            repeat_interval_ms,
            times_triggered,
            misfire,
        } = self.schedule
        else {
            return Ok(());
        };

        // One-shot FireNow keeps its literal meaning; for repeating triggers
        // it degrades to rescheduling with the remaining count.
        let policy = match misfire {
            SimpleMisfire::FireNow if repeat_count == 0 => SimpleMisfire::FireNow,
            SimpleMisfire::FireNow => SimpleMisfire::RescheduleNowWithRemainingCount,
            other => other,
        };

        let missed = match repeat_interval_ms {
            0 => 0,
            interval => self
                .next_fire_at_ms
                .map(|next| (now_ms.saturating_sub(next) / interval) as u32)
                .unwrap_or(0),
        };

        match policy {
            SimpleMisfire::FireNow => {
                self.next_fire_at_ms = Some(now_ms);
            },
            SimpleMisfire::RescheduleNowWithExistingCount => {
                self.rebase_simple_now(now_ms, repeat_count, times_triggered, 0);
            },
            SimpleMisfire::RescheduleNowWithRemainingCount => {
                self.rebase_simple_now(now_ms, repeat_count, times_triggered, missed);
            },
            SimpleMisfire::RescheduleNextWithExistingCount => {
                let next = self.fire_time_after(now_ms)?;
                self.next_fire_at_ms = self.filter_by_calendar(next, calendar)?;
            },
            SimpleMisfire::RescheduleNextWithRemainingCount => {
                if let Schedule::Simple {
                    times_triggered, ..
                } = &mut self.schedule
                {
                    *times_triggered += missed;
                }
                let next = self.fire_time_after(now_ms)?;
                self.next_fire_at_ms = self.filter_by_calendar(next, calendar)?;
            },
        }
        Ok(())
    }

    /// Rebase a simple trigger so its schedule restarts at `now`, folding
    /// already-performed (and optionally missed) fires into the count.
    fn rebase_simple_now(&mut self, now_ms: u64, repeat: i32, fired: u32, missed: u32) {
        if let Schedule::Simple {
            repeat_count,
            times_triggered,
            ..
        } = &mut self.schedule
        {
            if repeat != 0 && repeat != REPEAT_INDEFINITELY {
                *repeat_count = (repeat - (fired + missed) as i32).max(0);
                *times_triggered = 0;
            }
        }
        if self.end_at_ms.is_some_and(|end| end < now_ms) {
            self.next_fire_at_ms = None;
        } else {
            self.start_at_ms = now_ms;
            self.next_fire_at_ms = Some(now_ms);
        }
    }

    /// Recompute the next fire time after the calendar it references was
    /// replaced.
    pub fn update_with_new_calendar(
        &mut self,
        calendar: &Calendar,
        now_ms: u64,
        misfire_threshold_ms: u64,
    ) -> Result<()> {
        let base = self
            .previous_fire_at_ms
            .unwrap_or_else(|| self.start_at_ms.saturating_sub(1));
        let mut candidate = self.fire_time_after(base)?;
        for _ in 0..MAX_CALENDAR_SKIPS {
            match candidate {
                None => break,
                Some(t) if !calendar.is_included_ms(t) => {
                    candidate = self.fire_time_after(t)?;
                },
                Some(t) if t < now_ms && now_ms - t >= misfire_threshold_ms => {
                    candidate = self.fire_time_after(t)?;
                },
                Some(_) => break,
            }
        }
        self.next_fire_at_ms = candidate;
        Ok(())
    }

    /// Completion instruction for the run shell, derived from the execution
    /// outcome. Exception flags override the default.
    #[must_use]
    pub fn execution_complete(
        &self,
        error: Option<&JobExecutionError>,
    ) -> CompletionInstruction {
        if let Some(err) = error {
            if err.refire_immediately {
                return CompletionInstruction::ReExecuteJob;
            }
            if err.unschedule_firing_trigger {
                return CompletionInstruction::SetTriggerComplete;
            }
            if err.unschedule_all_triggers {
                return CompletionInstruction::SetAllJobTriggersComplete;
            }
        }
        if self.may_fire_again() {
            CompletionInstruction::Noop
        } else {
            CompletionInstruction::DeleteTrigger
        }
    }
}
