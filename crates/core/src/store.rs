//! The job store contract: the authoritative, transactional source of truth
//! the dispatcher relies on.

use std::collections::BTreeSet;

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
};

use crate::{
    calendar::Calendar,
    error::Result,
    job::JobDetail,
    key::{JobKey, KeyMatcher, TriggerKey},
    listener::ListenerBus,
    signal::Signaler,
    trigger::{Trigger, TriggerState},
};

/// Group that holds one-shot recovery triggers created at startup.
pub const RECOVERY_GROUP: &str = "RECOVERING_JOBS";

/// Data-map keys carrying the original trigger identity into a recovery run.
pub const RECOVERY_ORIG_TRIGGER_GROUP: &str = "recovery.origTriggerGroup";
pub const RECOVERY_ORIG_TRIGGER_NAME: &str = "recovery.origTriggerName";
pub const RECOVERY_ORIG_FIRE_TIME: &str = "recovery.origScheduledFireTime";

/// Default time a trigger may run late before its misfire instruction
/// applies.
pub const DEFAULT_MISFIRE_THRESHOLD_MS: u64 = 60_000;

/// What the run shell asks the store to do once an execution finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CompletionInstruction {
    Noop,
    DeleteTrigger,
    SetTriggerComplete,
    /// Handled by the run shell itself (refire without completing).
    ReExecuteJob,
    SetTriggerError,
    SetAllJobTriggersError,
    SetAllJobTriggersComplete,
}

/// Everything the run shell needs to execute one fire: snapshots only, no
/// live references back into the store.
#[derive(Debug, Clone)]
pub struct TriggerFiredBundle {
    pub job: JobDetail,
    pub trigger: Trigger,
    pub calendar: Option<Calendar>,
    /// True when this bundle replays an execution lost in a crash.
    pub recovering: bool,
    pub fire_instance_id: String,
    /// Wall-clock instant the store committed the fire.
    pub fire_at_ms: u64,
    /// The fire instant the schedule asked for.
    pub scheduled_fire_at_ms: u64,
    pub previous_fire_at_ms: Option<u64>,
    pub next_fire_at_ms: Option<u64>,
}

/// Persistence backend for jobs, triggers, and calendars, plus the firing
/// protocol. Every operation is atomic with respect to the others.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Called once before the scheduler starts. Recovers triggers orphaned
    /// in `Acquired`/`Executing` by a prior crash: each returns to
    /// `Waiting`, and executions of jobs that request recovery are re-fired
    /// through one-shot triggers in [`RECOVERY_GROUP`].
    async fn initialize(&self, signaler: Signaler, bus: std::sync::Arc<ListenerBus>)
    -> Result<()>;

    // ── Mutation ────────────────────────────────────────────────────────

    async fn store_job(&self, job: JobDetail, replace: bool) -> Result<()>;
    async fn store_trigger(&self, trigger: Trigger, replace: bool) -> Result<()>;
    async fn store_job_and_trigger(&self, job: JobDetail, trigger: Trigger) -> Result<()>;
    /// True iff the job existed. Removes its triggers first.
    async fn remove_job(&self, key: &JobKey) -> Result<bool>;
    /// True iff the trigger existed. A non-durable job left without triggers
    /// is deleted with it.
    async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool>;
    /// Swap a trigger for a new one bound to the same job.
    async fn replace_trigger(&self, key: &TriggerKey, new_trigger: Trigger) -> Result<bool>;
    async fn store_calendar(
        &self,
        name: &str,
        calendar: Calendar,
        replace: bool,
        update_triggers: bool,
    ) -> Result<()>;
    /// Fails while any trigger references the calendar.
    async fn remove_calendar(&self, name: &str) -> Result<bool>;
    async fn clear_all_scheduling_data(&self) -> Result<()>;

    async fn pause_trigger(&self, key: &TriggerKey) -> Result<()>;
    /// Returns the groups the matcher covered; those groups also block
    /// future trigger additions into them.
    async fn pause_triggers(&self, matcher: &KeyMatcher) -> Result<Vec<String>>;
    async fn pause_job(&self, key: &JobKey) -> Result<()>;
    async fn pause_jobs(&self, matcher: &KeyMatcher) -> Result<Vec<String>>;
    async fn resume_trigger(&self, key: &TriggerKey) -> Result<()>;
    async fn resume_triggers(&self, matcher: &KeyMatcher) -> Result<Vec<String>>;
    async fn resume_job(&self, key: &JobKey) -> Result<()>;
    async fn resume_jobs(&self, matcher: &KeyMatcher) -> Result<Vec<String>>;
    async fn pause_all(&self) -> Result<()>;
    async fn resume_all(&self) -> Result<()>;
    async fn reset_trigger_from_error_state(&self, key: &TriggerKey) -> Result<()>;

    // ── Query ───────────────────────────────────────────────────────────

    async fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDetail>>;
    async fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>>;
    async fn retrieve_calendar(&self, name: &str) -> Result<Option<Calendar>>;
    async fn check_job_exists(&self, key: &JobKey) -> Result<bool>;
    async fn check_trigger_exists(&self, key: &TriggerKey) -> Result<bool>;
    async fn get_job_keys(&self, matcher: &KeyMatcher) -> Result<Vec<JobKey>>;
    async fn get_trigger_keys(&self, matcher: &KeyMatcher) -> Result<Vec<TriggerKey>>;
    async fn get_triggers_for_job(&self, key: &JobKey) -> Result<Vec<Trigger>>;
    async fn get_trigger_state(&self, key: &TriggerKey) -> Result<Option<TriggerState>>;
    async fn get_job_group_names(&self) -> Result<Vec<String>>;
    async fn get_trigger_group_names(&self) -> Result<Vec<String>>;
    async fn get_calendar_names(&self) -> Result<Vec<String>>;
    async fn get_number_of_jobs(&self) -> Result<usize>;
    async fn get_number_of_triggers(&self) -> Result<usize>;
    async fn get_number_of_calendars(&self) -> Result<usize>;
    async fn get_paused_trigger_groups(&self) -> Result<BTreeSet<String>>;

    // ── Firing protocol ─────────────────────────────────────────────────

    /// Reserve up to `max_count` due triggers, ordered by
    /// `(next_fire, priority desc, key)`, each transitioned
    /// `Waiting -> Acquired`. Triggers past the misfire threshold have their
    /// misfire instruction applied before being considered. No trigger is
    /// ever handed to two concurrent callers.
    async fn acquire_next_triggers(
        &self,
        no_later_than_ms: u64,
        max_count: usize,
        time_window_ms: u64,
    ) -> Result<Vec<Trigger>>;

    /// `Acquired -> Waiting` without firing. Idempotent.
    async fn release_acquired_trigger(&self, trigger: &Trigger) -> Result<()>;

    /// Commit the reserved triggers: each still-valid one transitions
    /// `Acquired -> Executing`, advances its fire times, and yields a
    /// bundle; slots for triggers that were paused, removed, or otherwise
    /// invalidated since acquisition are `None`.
    async fn triggers_fired(
        &self,
        triggers: &[Trigger],
    ) -> Result<Vec<Option<TriggerFiredBundle>>>;

    /// Reverse the execution state changes per the instruction, persist the
    /// job data map when the job asks for it, and unblock siblings of
    /// concurrency-restricted jobs.
    async fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletionInstruction,
    ) -> Result<()>;

    // ── Capabilities ────────────────────────────────────────────────────

    fn supports_persistence(&self) -> bool;

    fn is_clustered(&self) -> bool {
        false
    }

    /// Delay before the dispatcher retries after a store failure. The
    /// dispatcher clamps the result to `[20 ms, 600 000 ms]`.
    fn acquire_retry_delay_ms(&self, failure_count: u32) -> u64 {
        100 * failure_count as u64
    }
}

impl TriggerFiredBundle {
    /// Identity of the trigger whose lost execution this bundle replays.
    #[must_use]
    pub fn recovering_trigger_key(&self) -> Option<TriggerKey> {
        if !self.recovering {
            return None;
        }
        let group = self.trigger.data.get_str(RECOVERY_ORIG_TRIGGER_GROUP)?;
        let name = self.trigger.data.get_str(RECOVERY_ORIG_TRIGGER_NAME)?;
        TriggerKey::new(group, name).ok()
    }
}
