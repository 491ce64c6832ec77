//! In-memory reference job store. Single-process only; the full contract,
//! including the trigger state machine, misfire handling, and recovery.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::{Arc, Mutex},
};

use {
    async_trait::async_trait,
    tracing::{debug, info, warn},
    uuid::Uuid,
};

use crate::{
    calendar::Calendar,
    clock::{Clock, SharedClock, SystemClock},
    error::{Result, SchedulerError},
    job::{JobDataMap, JobDetail},
    key::{JobKey, KeyMatcher, TriggerKey},
    listener::ListenerBus,
    signal::Signaler,
    store::{
        CompletionInstruction, DEFAULT_MISFIRE_THRESHOLD_MS, JobStore, RECOVERY_GROUP,
        RECOVERY_ORIG_FIRE_TIME, RECOVERY_ORIG_TRIGGER_GROUP, RECOVERY_ORIG_TRIGGER_NAME,
        TriggerFiredBundle,
    },
    trigger::{Schedule, Trigger, TriggerState},
};

#[derive(Debug, Clone)]
struct TriggerRecord {
    trigger: Trigger,
    state: TriggerState,
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<JobKey, JobDetail>,
    triggers: HashMap<TriggerKey, TriggerRecord>,
    calendars: HashMap<String, Calendar>,
    paused_trigger_groups: HashSet<String>,
    paused_job_groups: HashSet<String>,
    /// Concurrency-restricted jobs with an execution in flight.
    blocked_jobs: HashSet<JobKey>,
}

impl MemoryState {
    fn triggers_for_job(&self, job_key: &JobKey) -> Vec<TriggerKey> {
        self.triggers
            .iter()
            .filter(|(_, r)| r.trigger.job_key == *job_key)
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn calendar_for(&self, trigger: &Trigger) -> Option<Calendar> {
        trigger
            .calendar_name
            .as_deref()
            .and_then(|n| self.calendars.get(n).cloned())
    }

    /// Remove a trigger record; a non-durable job left without triggers goes
    /// with it.
    fn remove_trigger_record(&mut self, key: &TriggerKey) -> bool {
        let Some(rec) = self.triggers.remove(key) else {
            return false;
        };
        let job_key = rec.trigger.job_key;
        let orphaned = !self.triggers.values().any(|r| r.trigger.job_key == job_key);
        if orphaned && self.jobs.get(&job_key).is_some_and(|j| !j.durable) {
            debug!(job = %job_key, "deleting orphaned non-durable job");
            self.jobs.remove(&job_key);
        }
        true
    }

    fn initial_trigger_state(&self, trigger: &Trigger) -> TriggerState {
        let paused = self.paused_trigger_groups.contains(trigger.key.group())
            || self.paused_job_groups.contains(trigger.job_key.group());
        let blocked = self.blocked_jobs.contains(&trigger.job_key);
        match (paused, blocked) {
            (true, true) => TriggerState::PausedBlocked,
            (true, false) => TriggerState::Paused,
            (false, true) => TriggerState::Blocked,
            (false, false) => TriggerState::Waiting,
        }
    }
}

/// The reference store. One lock over all state; the lock is never held
/// across an await.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    hooks: Mutex<Option<(Signaler, Arc<ListenerBus>)>>,
    clock: SharedClock,
    misfire_threshold_ms: u64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            hooks: Mutex::new(None),
            clock,
            misfire_threshold_ms: DEFAULT_MISFIRE_THRESHOLD_MS,
        }
    }

    #[must_use]
    pub fn with_misfire_threshold(mut self, misfire_threshold_ms: u64) -> Self {
        self.misfire_threshold_ms = misfire_threshold_ms;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn hooks(&self) -> Option<(Signaler, Arc<ListenerBus>)> {
        self.hooks.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn signal_change(&self, candidate_fire_ms: u64) {
        if let Some((signaler, _)) = self.hooks() {
            signaler.signal_scheduling_change(candidate_fire_ms);
        }
    }

    async fn notify_misfired(&self, triggers: &[Trigger]) {
        if let Some((_, bus)) = self.hooks() {
            for t in triggers {
                bus.notify_trigger_misfired(t).await;
            }
        }
    }

    /// Apply the misfire instruction when `now` is past the threshold.
    /// Returns true if the trigger misfired. Transitions the record to
    /// `Complete` when nothing remains, `Error` when the schedule itself is
    /// broken.
    fn apply_misfire(
        rec: &mut TriggerRecord,
        calendar: Option<&Calendar>,
        now_ms: u64,
        threshold_ms: u64,
    ) -> bool {
        let Some(next_fire) = rec.trigger.next_fire_at_ms else {
            return false;
        };
        if now_ms.saturating_sub(next_fire) <= threshold_ms {
            return false;
        }
        match rec.trigger.update_after_misfire(calendar, now_ms) {
            Ok(()) => {
                if rec.trigger.next_fire_at_ms.is_none() {
                    rec.state = TriggerState::Complete;
                }
                true
            },
            Err(e) => {
                warn!(trigger = %rec.trigger.key, error = %e, "misfire update failed; marking trigger errored");
                rec.state = TriggerState::Error;
                true
            },
        }
    }

    fn pause_trigger_in(state: &mut MemoryState, key: &TriggerKey) {
        if let Some(rec) = state.triggers.get_mut(key) {
            rec.state = match rec.state {
                TriggerState::Blocked | TriggerState::PausedBlocked => TriggerState::PausedBlocked,
                TriggerState::Complete | TriggerState::Error => rec.state,
                _ => TriggerState::Paused,
            };
        }
    }

    fn resume_trigger_in(
        state: &mut MemoryState,
        key: &TriggerKey,
        now_ms: u64,
        threshold_ms: u64,
    ) {
        let calendar = state
            .triggers
            .get(key)
            .and_then(|r| state.calendar_for(&r.trigger));
        let blocked_jobs = state.blocked_jobs.clone();
        if let Some(rec) = state.triggers.get_mut(key) {
            if rec.state != TriggerState::Paused && rec.state != TriggerState::PausedBlocked {
                return;
            }
            Self::apply_misfire(rec, calendar.as_ref(), now_ms, threshold_ms);
            if rec.state == TriggerState::Paused || rec.state == TriggerState::PausedBlocked {
                rec.state = if blocked_jobs.contains(&rec.trigger.job_key) {
                    TriggerState::Blocked
                } else {
                    TriggerState::Waiting
                };
            }
        }
    }

    /// Groups a matcher covers, for the paused-group bookkeeping.
    fn matched_trigger_groups(state: &MemoryState, matcher: &KeyMatcher) -> BTreeSet<String> {
        match matcher {
            KeyMatcher::GroupEquals { group } => BTreeSet::from([group.clone()]),
            KeyMatcher::Exact { group, .. } => BTreeSet::from([group.clone()]),
            _ => state
                .triggers
                .keys()
                .filter(|k| matcher.matches_trigger(k))
                .map(|k| k.group().to_string())
                .collect(),
        }
    }

    fn matched_job_groups(state: &MemoryState, matcher: &KeyMatcher) -> BTreeSet<String> {
        match matcher {
            KeyMatcher::GroupEquals { group } => BTreeSet::from([group.clone()]),
            KeyMatcher::Exact { group, .. } => BTreeSet::from([group.clone()]),
            _ => state
                .jobs
                .keys()
                .filter(|k| matcher.matches_job(k))
                .map(|k| k.group().to_string())
                .collect(),
        }
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn initialize(&self, signaler: Signaler, bus: Arc<ListenerBus>) -> Result<()> {
        *self.hooks.lock().unwrap_or_else(|e| e.into_inner()) = Some((signaler, bus));

        let mut recovered = 0usize;
        {
            let mut state = self.lock();
            let now = self.clock.now_ms();
            let orphaned: Vec<TriggerKey> = state
                .triggers
                .iter()
                .filter(|(_, r)| {
                    matches!(r.state, TriggerState::Acquired | TriggerState::Executing)
                })
                .map(|(k, _)| k.clone())
                .collect();

            for key in orphaned {
                let Some(rec) = state.triggers.get_mut(&key) else {
                    continue;
                };
                let was_executing = rec.state == TriggerState::Executing;
                rec.state = TriggerState::Waiting;
                let source = rec.trigger.clone();
                let wants_recovery = state
                    .jobs
                    .get(&source.job_key)
                    .is_some_and(|j| j.requests_recovery);
                if was_executing
                    && wants_recovery
                    && let Ok(recovery_key) = TriggerKey::new(
                        RECOVERY_GROUP,
                        format!("recover-{}-{}", source.key.name(), Uuid::new_v4()),
                    )
                {
                    let data = source
                        .data
                        .merged_with(&recovery_data(&source, source.previous_fire_at_ms));
                    let mut recovery = Trigger::new(
                        recovery_key,
                        source.job_key.clone(),
                        now,
                        Schedule::once(),
                    )
                    .with_priority(source.priority)
                    .with_data(data);
                    recovery.next_fire_at_ms = Some(now);
                    state.triggers.insert(
                        recovery.key.clone(),
                        TriggerRecord {
                            trigger: recovery,
                            state: TriggerState::Waiting,
                        },
                    );
                    recovered += 1;
                }
            }
        }
        if recovered > 0 {
            info!(count = recovered, "queued recovery triggers for orphaned executions");
        }
        Ok(())
    }

    // ── Mutation ────────────────────────────────────────────────────────

    async fn store_job(&self, job: JobDetail, replace: bool) -> Result<()> {
        let mut state = self.lock();
        if !replace && state.jobs.contains_key(&job.key) {
            return Err(SchedulerError::already_exists(format!("job '{}'", job.key)));
        }
        state.jobs.insert(job.key.clone(), job);
        Ok(())
    }

    async fn store_trigger(&self, trigger: Trigger, replace: bool) -> Result<()> {
        let mut state = self.lock();
        if !replace && state.triggers.contains_key(&trigger.key) {
            return Err(SchedulerError::already_exists(format!(
                "trigger '{}'",
                trigger.key
            )));
        }
        if !state.jobs.contains_key(&trigger.job_key) {
            return Err(SchedulerError::persistence(format!(
                "trigger '{}' references missing job '{}'",
                trigger.key, trigger.job_key
            )));
        }
        if let Some(name) = &trigger.calendar_name
            && !state.calendars.contains_key(name)
        {
            return Err(SchedulerError::persistence(format!(
                "trigger '{}' references missing calendar '{name}'",
                trigger.key
            )));
        }
        let initial = state.initial_trigger_state(&trigger);
        state.triggers.insert(
            trigger.key.clone(),
            TriggerRecord {
                trigger,
                state: initial,
            },
        );
        Ok(())
    }

    async fn store_job_and_trigger(&self, job: JobDetail, trigger: Trigger) -> Result<()> {
        self.store_job(job, false).await?;
        self.store_trigger(trigger, false).await
    }

    async fn remove_job(&self, key: &JobKey) -> Result<bool> {
        let mut state = self.lock();
        for tk in state.triggers_for_job(key) {
            state.triggers.remove(&tk);
        }
        state.blocked_jobs.remove(key);
        Ok(state.jobs.remove(key).is_some())
    }

    async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool> {
        Ok(self.lock().remove_trigger_record(key))
    }

    async fn replace_trigger(&self, key: &TriggerKey, new_trigger: Trigger) -> Result<bool> {
        let mut state = self.lock();
        let Some(existing) = state.triggers.get(key) else {
            return Ok(false);
        };
        if existing.trigger.job_key != new_trigger.job_key {
            return Err(SchedulerError::persistence(format!(
                "replacement trigger '{}' is not related to the same job",
                new_trigger.key
            )));
        }
        state.triggers.remove(key);
        let initial = state.initial_trigger_state(&new_trigger);
        state.triggers.insert(
            new_trigger.key.clone(),
            TriggerRecord {
                trigger: new_trigger,
                state: initial,
            },
        );
        Ok(true)
    }

    async fn store_calendar(
        &self,
        name: &str,
        calendar: Calendar,
        replace: bool,
        update_triggers: bool,
    ) -> Result<()> {
        let mut state = self.lock();
        if !replace && state.calendars.contains_key(name) {
            return Err(SchedulerError::already_exists(format!("calendar '{name}'")));
        }
        state.calendars.insert(name.to_string(), calendar.clone());
        if update_triggers {
            let now = self.clock.now_ms();
            let keys: Vec<TriggerKey> = state
                .triggers
                .iter()
                .filter(|(_, r)| r.trigger.calendar_name.as_deref() == Some(name))
                .map(|(k, _)| k.clone())
                .collect();
            for key in keys {
                if let Some(rec) = state.triggers.get_mut(&key)
                    && let Err(e) = rec.trigger.update_with_new_calendar(
                        &calendar,
                        now,
                        self.misfire_threshold_ms,
                    )
                {
                    warn!(trigger = %key, error = %e, "failed to update trigger for new calendar");
                }
            }
        }
        Ok(())
    }

    async fn remove_calendar(&self, name: &str) -> Result<bool> {
        let mut state = self.lock();
        let referenced = state
            .triggers
            .values()
            .any(|r| r.trigger.calendar_name.as_deref() == Some(name));
        if referenced {
            return Err(SchedulerError::persistence(format!(
                "calendar '{name}' is referenced by a trigger and cannot be removed"
            )));
        }
        Ok(state.calendars.remove(name).is_some())
    }

    async fn clear_all_scheduling_data(&self) -> Result<()> {
        let mut state = self.lock();
        *state = MemoryState::default();
        Ok(())
    }

    async fn pause_trigger(&self, key: &TriggerKey) -> Result<()> {
        let mut state = self.lock();
        Self::pause_trigger_in(&mut state, key);
        Ok(())
    }

    async fn pause_triggers(&self, matcher: &KeyMatcher) -> Result<Vec<String>> {
        let mut state = self.lock();
        let groups = Self::matched_trigger_groups(&state, matcher);
        state
            .paused_trigger_groups
            .extend(groups.iter().cloned());
        let keys: Vec<TriggerKey> = state
            .triggers
            .keys()
            .filter(|k| matcher.matches_trigger(k))
            .cloned()
            .collect();
        for key in keys {
            Self::pause_trigger_in(&mut state, &key);
        }
        Ok(groups.into_iter().collect())
    }

    async fn pause_job(&self, key: &JobKey) -> Result<()> {
        let mut state = self.lock();
        for tk in state.triggers_for_job(key) {
            Self::pause_trigger_in(&mut state, &tk);
        }
        Ok(())
    }

    async fn pause_jobs(&self, matcher: &KeyMatcher) -> Result<Vec<String>> {
        let mut state = self.lock();
        let groups = Self::matched_job_groups(&state, matcher);
        state.paused_job_groups.extend(groups.iter().cloned());
        let jobs: Vec<JobKey> = state
            .jobs
            .keys()
            .filter(|k| matcher.matches_job(k))
            .cloned()
            .collect();
        for job in jobs {
            for tk in state.triggers_for_job(&job) {
                Self::pause_trigger_in(&mut state, &tk);
            }
        }
        Ok(groups.into_iter().collect())
    }

    async fn resume_trigger(&self, key: &TriggerKey) -> Result<()> {
        let now = self.clock.now_ms();
        {
            let mut state = self.lock();
            Self::resume_trigger_in(&mut state, key, now, self.misfire_threshold_ms);
        }
        self.signal_change(0);
        Ok(())
    }

    async fn resume_triggers(&self, matcher: &KeyMatcher) -> Result<Vec<String>> {
        let now = self.clock.now_ms();
        let groups;
        {
            let mut state = self.lock();
            groups = Self::matched_trigger_groups(&state, matcher);
            for group in &groups {
                state.paused_trigger_groups.remove(group);
            }
            let keys: Vec<TriggerKey> = state
                .triggers
                .keys()
                .filter(|k| matcher.matches_trigger(k))
                .cloned()
                .collect();
            for key in keys {
                Self::resume_trigger_in(&mut state, &key, now, self.misfire_threshold_ms);
            }
        }
        self.signal_change(0);
        Ok(groups.into_iter().collect())
    }

    async fn resume_job(&self, key: &JobKey) -> Result<()> {
        let now = self.clock.now_ms();
        {
            let mut state = self.lock();
            for tk in state.triggers_for_job(key) {
                Self::resume_trigger_in(&mut state, &tk, now, self.misfire_threshold_ms);
            }
        }
        self.signal_change(0);
        Ok(())
    }

    async fn resume_jobs(&self, matcher: &KeyMatcher) -> Result<Vec<String>> {
        let now = self.clock.now_ms();
        let groups;
        {
            let mut state = self.lock();
            groups = Self::matched_job_groups(&state, matcher);
            for group in &groups {
                state.paused_job_groups.remove(group);
            }
            let jobs: Vec<JobKey> = state
                .jobs
                .keys()
                .filter(|k| matcher.matches_job(k))
                .cloned()
                .collect();
            for job in jobs {
                for tk in state.triggers_for_job(&job) {
                    Self::resume_trigger_in(&mut state, &tk, now, self.misfire_threshold_ms);
                }
            }
        }
        self.signal_change(0);
        Ok(groups.into_iter().collect())
    }

    async fn pause_all(&self) -> Result<()> {
        self.pause_triggers(&KeyMatcher::Everything).await?;
        Ok(())
    }

    async fn resume_all(&self) -> Result<()> {
        {
            let mut state = self.lock();
            state.paused_trigger_groups.clear();
            state.paused_job_groups.clear();
        }
        self.resume_triggers(&KeyMatcher::Everything).await?;
        Ok(())
    }

    async fn reset_trigger_from_error_state(&self, key: &TriggerKey) -> Result<()> {
        {
            let mut state = self.lock();
            let paused = state.paused_trigger_groups.contains(key.group());
            let Some(rec) = state.triggers.get_mut(key) else {
                return Err(SchedulerError::not_found(format!("trigger '{key}'")));
            };
            if rec.state != TriggerState::Error {
                return Ok(());
            }
            rec.state = if paused {
                TriggerState::Paused
            } else {
                TriggerState::Waiting
            };
        }
        self.signal_change(0);
        Ok(())
    }

    // ── Query ───────────────────────────────────────────────────────────

    async fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDetail>> {
        Ok(self.lock().jobs.get(key).cloned())
    }

    async fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>> {
        Ok(self.lock().triggers.get(key).map(|r| r.trigger.clone()))
    }

    async fn retrieve_calendar(&self, name: &str) -> Result<Option<Calendar>> {
        Ok(self.lock().calendars.get(name).cloned())
    }

    async fn check_job_exists(&self, key: &JobKey) -> Result<bool> {
        Ok(self.lock().jobs.contains_key(key))
    }

    async fn check_trigger_exists(&self, key: &TriggerKey) -> Result<bool> {
        Ok(self.lock().triggers.contains_key(key))
    }

    async fn get_job_keys(&self, matcher: &KeyMatcher) -> Result<Vec<JobKey>> {
        let mut keys: Vec<JobKey> = self
            .lock()
            .jobs
            .keys()
            .filter(|k| matcher.matches_job(k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn get_trigger_keys(&self, matcher: &KeyMatcher) -> Result<Vec<TriggerKey>> {
        let mut keys: Vec<TriggerKey> = self
            .lock()
            .triggers
            .keys()
            .filter(|k| matcher.matches_trigger(k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn get_triggers_for_job(&self, key: &JobKey) -> Result<Vec<Trigger>> {
        let state = self.lock();
        let mut triggers: Vec<Trigger> = state
            .triggers
            .values()
            .filter(|r| r.trigger.job_key == *key)
            .map(|r| r.trigger.clone())
            .collect();
        triggers.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(triggers)
    }

    async fn get_trigger_state(&self, key: &TriggerKey) -> Result<Option<TriggerState>> {
        Ok(self.lock().triggers.get(key).map(|r| r.state))
    }

    async fn get_job_group_names(&self) -> Result<Vec<String>> {
        let groups: BTreeSet<String> = self
            .lock()
            .jobs
            .keys()
            .map(|k| k.group().to_string())
            .collect();
        Ok(groups.into_iter().collect())
    }

    async fn get_trigger_group_names(&self) -> Result<Vec<String>> {
        let groups: BTreeSet<String> = self
            .lock()
            .triggers
            .keys()
            .map(|k| k.group().to_string())
            .collect();
        Ok(groups.into_iter().collect())
    }

    async fn get_calendar_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.lock().calendars.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn get_number_of_jobs(&self) -> Result<usize> {
        Ok(self.lock().jobs.len())
    }

    async fn get_number_of_triggers(&self) -> Result<usize> {
        Ok(self.lock().triggers.len())
    }

    async fn get_number_of_calendars(&self) -> Result<usize> {
        Ok(self.lock().calendars.len())
    }

    async fn get_paused_trigger_groups(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .lock()
            .paused_trigger_groups
            .iter()
            .cloned()
            .collect())
    }

    // ── Firing protocol ─────────────────────────────────────────────────

    async fn acquire_next_triggers(
        &self,
        no_later_than_ms: u64,
        max_count: usize,
        time_window_ms: u64,
    ) -> Result<Vec<Trigger>> {
        let mut misfired = Vec::new();
        let acquired = {
            let mut state = self.lock();
            let now = self.clock.now_ms();

            let mut candidates: Vec<(u64, std::cmp::Reverse<i32>, TriggerKey)> = state
                .triggers
                .iter()
                .filter(|(_, r)| {
                    r.state == TriggerState::Waiting && r.trigger.next_fire_at_ms.is_some()
                })
                .map(|(k, r)| {
                    (
                        r.trigger.next_fire_at_ms.unwrap_or(u64::MAX),
                        std::cmp::Reverse(r.trigger.priority),
                        k.clone(),
                    )
                })
                .collect();
            candidates.sort();

            let mut acquired: Vec<Trigger> = Vec::new();
            let mut first_fire: Option<u64> = None;
            let mut no_concurrent: HashSet<JobKey> = HashSet::new();

            for (_, _, key) in candidates {
                if acquired.len() >= max_count {
                    break;
                }
                let Some(rec) = state.triggers.get(&key) else {
                    continue;
                };
                if rec.state != TriggerState::Waiting {
                    continue;
                }
                let calendar = state.calendar_for(&rec.trigger);
                let job_key = rec.trigger.job_key.clone();
                let disallow_concurrent = state
                    .jobs
                    .get(&job_key)
                    .is_some_and(|j| j.disallow_concurrent_execution);

                let Some(rec) = state.triggers.get_mut(&key) else {
                    continue;
                };
                if Self::apply_misfire(rec, calendar.as_ref(), now, self.misfire_threshold_ms) {
                    misfired.push(rec.trigger.clone());
                    if rec.state != TriggerState::Waiting {
                        continue;
                    }
                }
                let Some(next_fire) = rec.trigger.next_fire_at_ms else {
                    continue;
                };
                // Batch window anchors on the first acquired trigger so a
                // wide batch never drags in much-later fire times.
                let in_window = match first_fire {
                    None => next_fire <= no_later_than_ms.saturating_add(time_window_ms),
                    Some(first) => next_fire <= first.saturating_add(time_window_ms),
                };
                if !in_window {
                    continue;
                }
                if disallow_concurrent && !no_concurrent.insert(job_key) {
                    continue;
                }
                rec.state = TriggerState::Acquired;
                first_fire.get_or_insert(next_fire);
                acquired.push(rec.trigger.clone());
            }
            debug!(count = acquired.len(), "batch acquisition");
            acquired
        };
        self.notify_misfired(&misfired).await;
        Ok(acquired)
    }

    async fn release_acquired_trigger(&self, trigger: &Trigger) -> Result<()> {
        let mut state = self.lock();
        if let Some(rec) = state.triggers.get_mut(&trigger.key)
            && rec.state == TriggerState::Acquired
        {
            rec.state = TriggerState::Waiting;
        }
        Ok(())
    }

    async fn triggers_fired(
        &self,
        triggers: &[Trigger],
    ) -> Result<Vec<Option<TriggerFiredBundle>>> {
        let mut state = self.lock();
        let now = self.clock.now_ms();
        let mut results = Vec::with_capacity(triggers.len());

        for t in triggers {
            let Some(rec) = state.triggers.get(&t.key) else {
                results.push(None);
                continue;
            };
            if rec.state != TriggerState::Acquired {
                results.push(None);
                continue;
            }
            let calendar = match rec.trigger.calendar_name.as_deref() {
                Some(name) => match state.calendars.get(name) {
                    Some(c) => Some(c.clone()),
                    // Calendar vanished since acquisition: cannot fire.
                    None => {
                        results.push(None);
                        continue;
                    },
                },
                None => None,
            };
            let Some(job) = state.jobs.get(&rec.trigger.job_key).cloned() else {
                results.push(None);
                continue;
            };
            let Some(rec) = state.triggers.get_mut(&t.key) else {
                results.push(None);
                continue;
            };

            let scheduled_fire = rec.trigger.next_fire_at_ms.unwrap_or(now);
            let prev_fire = rec.trigger.previous_fire_at_ms;
            if let Err(e) = rec.trigger.triggered(calendar.as_ref()) {
                warn!(trigger = %t.key, error = %e, "trigger advance failed at fire time");
                rec.state = TriggerState::Error;
                results.push(None);
                continue;
            }
            rec.state = TriggerState::Executing;

            let recovering = rec.trigger.key.group() == RECOVERY_GROUP
                && rec.trigger.data.contains_key(RECOVERY_ORIG_TRIGGER_NAME);
            let bundle = TriggerFiredBundle {
                job: job.clone(),
                trigger: rec.trigger.clone(),
                calendar,
                recovering,
                fire_instance_id: Uuid::new_v4().to_string(),
                fire_at_ms: now,
                scheduled_fire_at_ms: scheduled_fire,
                previous_fire_at_ms: prev_fire,
                next_fire_at_ms: rec.trigger.next_fire_at_ms,
            };

            if job.disallow_concurrent_execution {
                state.blocked_jobs.insert(job.key.clone());
                for sibling in state.triggers_for_job(&job.key) {
                    if sibling == t.key {
                        continue;
                    }
                    if let Some(s) = state.triggers.get_mut(&sibling) {
                        s.state = match s.state {
                            TriggerState::Waiting => TriggerState::Blocked,
                            TriggerState::Paused => TriggerState::PausedBlocked,
                            other => other,
                        };
                    }
                }
            }
            results.push(Some(bundle));
        }
        Ok(results)
    }

    async fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletionInstruction,
    ) -> Result<()> {
        let mut signal = false;
        {
            let mut state = self.lock();

            if let Some(stored) = state.jobs.get_mut(&job.key) {
                if stored.persist_data_after_execution {
                    stored.data = job.data.clone();
                }
            }
            if job.disallow_concurrent_execution {
                state.blocked_jobs.remove(&job.key);
                for sibling in state.triggers_for_job(&job.key) {
                    if let Some(s) = state.triggers.get_mut(&sibling) {
                        s.state = match s.state {
                            TriggerState::Blocked => TriggerState::Waiting,
                            TriggerState::PausedBlocked => TriggerState::Paused,
                            other => other,
                        };
                    }
                }
                signal = true;
            }

            match instruction {
                CompletionInstruction::SetAllJobTriggersComplete => {
                    for tk in state.triggers_for_job(&job.key) {
                        if let Some(r) = state.triggers.get_mut(&tk) {
                            r.state = TriggerState::Complete;
                        }
                    }
                    signal = true;
                },
                CompletionInstruction::SetAllJobTriggersError => {
                    warn!(job = %job.key, "setting all triggers of job to error state");
                    for tk in state.triggers_for_job(&job.key) {
                        if let Some(r) = state.triggers.get_mut(&tk) {
                            r.state = TriggerState::Error;
                        }
                    }
                    signal = true;
                },
                CompletionInstruction::DeleteTrigger => {
                    let keep = trigger.next_fire_at_ms.is_none()
                        && state
                            .triggers
                            .get(&trigger.key)
                            .is_some_and(|r| r.trigger.next_fire_at_ms.is_some());
                    if keep {
                        // The trigger was rescheduled while executing; it
                        // lives on.
                        if let Some(r) = state.triggers.get_mut(&trigger.key)
                            && r.state == TriggerState::Executing
                        {
                            r.state = TriggerState::Waiting;
                        }
                    } else {
                        state.remove_trigger_record(&trigger.key);
                    }
                },
                CompletionInstruction::SetTriggerComplete => {
                    if let Some(r) = state.triggers.get_mut(&trigger.key) {
                        r.state = TriggerState::Complete;
                    }
                    signal = true;
                },
                CompletionInstruction::SetTriggerError => {
                    warn!(trigger = %trigger.key, "setting trigger to error state");
                    if let Some(r) = state.triggers.get_mut(&trigger.key) {
                        r.state = TriggerState::Error;
                    }
                    signal = true;
                },
                CompletionInstruction::Noop | CompletionInstruction::ReExecuteJob => {
                    if let Some(r) = state.triggers.get_mut(&trigger.key)
                        && r.state == TriggerState::Executing
                    {
                        r.state = if r.trigger.may_fire_again() {
                            TriggerState::Waiting
                        } else {
                            TriggerState::Complete
                        };
                    }
                },
            }
        }
        if signal {
            self.signal_change(0);
        }
        Ok(())
    }

    // ── Capabilities ────────────────────────────────────────────────────

    fn supports_persistence(&self) -> bool {
        false
    }
}

fn recovery_data(source: &Trigger, scheduled_fire_at_ms: Option<u64>) -> JobDataMap {
    let mut data = JobDataMap::new()
        .with(RECOVERY_ORIG_TRIGGER_GROUP, source.key.group())
        .with(RECOVERY_ORIG_TRIGGER_NAME, source.key.name());
    if let Some(at) = scheduled_fire_at_ms {
        data.insert(RECOVERY_ORIG_FIRE_TIME, at);
    }
    data
}
