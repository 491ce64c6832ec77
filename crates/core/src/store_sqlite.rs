//! SQLite-backed job store using sqlx. Rows carry the serialized payload in
//! a JSON `data` column; state and fire times are real columns so
//! acquisition can filter and sort in SQL. Every operation runs in its own
//! transaction, which is what gives the firing protocol its atomicity on a
//! single node.

use std::{
    collections::BTreeSet,
    str::FromStr,
    sync::{Arc, Mutex},
};

use {
    async_trait::async_trait,
    sqlx::{Row, SqlitePool, sqlite::SqlitePoolOptions},
    tracing::{debug, info, warn},
    uuid::Uuid,
};

use crate::{
    calendar::Calendar,
    clock::{SharedClock, SystemClock},
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

type Tx<'a> = sqlx::Transaction<'a, sqlx::Sqlite>;

/// Persistent store. `supports_persistence` is true, so the dispatcher uses
/// the larger batch-abandon cost threshold.
pub struct SqliteStore {
    pool: SqlitePool,
    hooks: Mutex<Option<(Signaler, Arc<ListenerBus>)>>,
    clock: SharedClock,
    misfire_threshold_ms: u64,
    instance_id: String,
}

impl SqliteStore {
    /// Connect with a private pool and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        // In-memory SQLite databases are per-connection; more than one
        // connection would see different databases.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| SchedulerError::persistence_with("failed to connect to SQLite", e))?;
        crate::run_migrations(&pool).await?;
        Ok(Self::with_pool(pool))
    }

    /// Use an existing pool. Call [`crate::run_migrations`] first.
    #[must_use]
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            hooks: Mutex::new(None),
            clock: Arc::new(SystemClock),
            misfire_threshold_ms: DEFAULT_MISFIRE_THRESHOLD_MS,
            instance_id: "NON_CLUSTERED".to_string(),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_misfire_threshold(mut self, misfire_threshold_ms: u64) -> Self {
        self.misfire_threshold_ms = misfire_threshold_ms;
        self
    }

    #[must_use]
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
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

    // ── Row helpers ─────────────────────────────────────────────────────

    async fn load_job_tx(tx: &mut Tx<'_>, key: &JobKey) -> Result<Option<JobDetail>> {
        let row = sqlx::query("SELECT data FROM jobs WHERE job_group = ? AND job_name = ?")
            .bind(key.group())
            .bind(key.name())
            .fetch_optional(&mut **tx)
            .await?;
        row.map(|r| {
            let data: String = r.get("data");
            serde_json::from_str(&data).map_err(Into::into)
        })
        .transpose()
    }

    async fn save_job_tx(tx: &mut Tx<'_>, job: &JobDetail) -> Result<()> {
        let data = serde_json::to_string(job)?;
        sqlx::query(
            "INSERT INTO jobs
               (job_group, job_name, durable, requests_recovery, disallow_concurrent, data)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(job_group, job_name) DO UPDATE SET
               durable = excluded.durable,
               requests_recovery = excluded.requests_recovery,
               disallow_concurrent = excluded.disallow_concurrent,
               data = excluded.data",
        )
        .bind(job.key.group())
        .bind(job.key.name())
        .bind(job.durable as i64)
        .bind(job.requests_recovery as i64)
        .bind(job.disallow_concurrent_execution as i64)
        .bind(&data)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn load_trigger_tx(
        tx: &mut Tx<'_>,
        key: &TriggerKey,
    ) -> Result<Option<(Trigger, TriggerState)>> {
        let row = sqlx::query(
            "SELECT data, state FROM triggers WHERE trigger_group = ? AND trigger_name = ?",
        )
        .bind(key.group())
        .bind(key.name())
        .fetch_optional(&mut **tx)
        .await?;
        row.map(|r| {
            let data: String = r.get("data");
            let state: String = r.get("state");
            let trigger: Trigger = serde_json::from_str(&data)?;
            let state = TriggerState::from_str(&state)
                .map_err(SchedulerError::persistence)?;
            Ok((trigger, state))
        })
        .transpose()
    }

    async fn save_trigger_tx(
        tx: &mut Tx<'_>,
        trigger: &Trigger,
        state: TriggerState,
    ) -> Result<()> {
        let data = serde_json::to_string(trigger)?;
        sqlx::query(
            "INSERT INTO triggers
               (trigger_group, trigger_name, job_group, job_name, kind, state,
                next_fire_at_ms, priority, calendar_name, data)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(trigger_group, trigger_name) DO UPDATE SET
               job_group = excluded.job_group,
               job_name = excluded.job_name,
               kind = excluded.kind,
               state = excluded.state,
               next_fire_at_ms = excluded.next_fire_at_ms,
               priority = excluded.priority,
               calendar_name = excluded.calendar_name,
               data = excluded.data",
        )
        .bind(trigger.key.group())
        .bind(trigger.key.name())
        .bind(trigger.job_key.group())
        .bind(trigger.job_key.name())
        .bind(trigger.schedule.kind())
        .bind(state.to_string())
        .bind(trigger.next_fire_at_ms.map(|t| t as i64))
        .bind(trigger.priority as i64)
        .bind(&trigger.calendar_name)
        .bind(&data)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn load_calendar_tx(tx: &mut Tx<'_>, name: &str) -> Result<Option<Calendar>> {
        let row = sqlx::query("SELECT data FROM calendars WHERE calendar_name = ?")
            .bind(name)
            .fetch_optional(&mut **tx)
            .await?;
        row.map(|r| {
            let data: String = r.get("data");
            serde_json::from_str(&data).map_err(Into::into)
        })
        .transpose()
    }

    /// Delete a trigger row; a non-durable job left without triggers goes
    /// with it. Returns true iff the trigger existed.
    async fn delete_trigger_tx(tx: &mut Tx<'_>, key: &TriggerKey) -> Result<bool> {
        let row = sqlx::query(
            "SELECT job_group, job_name FROM triggers
             WHERE trigger_group = ? AND trigger_name = ?",
        )
        .bind(key.group())
        .bind(key.name())
        .fetch_optional(&mut **tx)
        .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let (job_group, job_name): (String, String) = (row.get("job_group"), row.get("job_name"));
        sqlx::query("DELETE FROM triggers WHERE trigger_group = ? AND trigger_name = ?")
            .bind(key.group())
            .bind(key.name())
            .execute(&mut **tx)
            .await?;

        let remaining: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM triggers WHERE job_group = ? AND job_name = ?",
        )
        .bind(&job_group)
        .bind(&job_name)
        .fetch_one(&mut **tx)
        .await?
        .get("n");
        if remaining == 0 {
            let deleted = sqlx::query(
                "DELETE FROM jobs WHERE job_group = ? AND job_name = ? AND durable = 0",
            )
            .bind(&job_group)
            .bind(&job_name)
            .execute(&mut **tx)
            .await?;
            if deleted.rows_affected() > 0 {
                debug!(job = %format!("{job_group}.{job_name}"), "deleted orphaned non-durable job");
            }
        }
        Ok(true)
    }

    async fn initial_trigger_state_tx(
        tx: &mut Tx<'_>,
        trigger: &Trigger,
    ) -> Result<TriggerState> {
        let paused: bool = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM paused_trigger_groups WHERE trigger_group = ?)
                 OR EXISTS (SELECT 1 FROM paused_job_groups WHERE job_group = ?) AS paused",
        )
        .bind(trigger.key.group())
        .bind(trigger.job_key.group())
        .fetch_one(&mut **tx)
        .await?
        .get::<i64, _>("paused")
            != 0;

        let blocked: bool = sqlx::query(
            "SELECT EXISTS (
                 SELECT 1 FROM fired_triggers f
                 JOIN jobs j ON j.job_group = f.job_group AND j.job_name = f.job_name
                 WHERE f.job_group = ? AND f.job_name = ? AND j.disallow_concurrent = 1
             ) AS blocked",
        )
        .bind(trigger.job_key.group())
        .bind(trigger.job_key.name())
        .fetch_one(&mut **tx)
        .await?
        .get::<i64, _>("blocked")
            != 0;

        Ok(match (paused, blocked) {
            (true, true) => TriggerState::PausedBlocked,
            (true, false) => TriggerState::Paused,
            (false, true) => TriggerState::Blocked,
            (false, false) => TriggerState::Waiting,
        })
    }

    async fn set_trigger_state_tx(
        tx: &mut Tx<'_>,
        key: &TriggerKey,
        state: TriggerState,
    ) -> Result<()> {
        sqlx::query("UPDATE triggers SET state = ? WHERE trigger_group = ? AND trigger_name = ?")
            .bind(state.to_string())
            .bind(key.group())
            .bind(key.name())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn all_trigger_keys_tx(tx: &mut Tx<'_>) -> Result<Vec<TriggerKey>> {
        let rows = sqlx::query("SELECT trigger_group, trigger_name FROM triggers")
            .fetch_all(&mut **tx)
            .await?;
        rows.into_iter()
            .map(|r| {
                TriggerKey::new(
                    r.get::<String, _>("trigger_group"),
                    r.get::<String, _>("trigger_name"),
                )
            })
            .collect()
    }

    async fn all_job_keys_tx(tx: &mut Tx<'_>) -> Result<Vec<JobKey>> {
        let rows = sqlx::query("SELECT job_group, job_name FROM jobs")
            .fetch_all(&mut **tx)
            .await?;
        rows.into_iter()
            .map(|r| {
                JobKey::new(
                    r.get::<String, _>("job_group"),
                    r.get::<String, _>("job_name"),
                )
            })
            .collect()
    }

    async fn pause_trigger_tx(tx: &mut Tx<'_>, key: &TriggerKey) -> Result<()> {
        let Some((_, state)) = Self::load_trigger_tx(tx, key).await? else {
            return Ok(());
        };
        let new_state = match state {
            TriggerState::Blocked | TriggerState::PausedBlocked => TriggerState::PausedBlocked,
            TriggerState::Complete | TriggerState::Error => return Ok(()),
            _ => TriggerState::Paused,
        };
        Self::set_trigger_state_tx(tx, key, new_state).await
    }

    async fn resume_trigger_tx(
        &self,
        tx: &mut Tx<'_>,
        key: &TriggerKey,
        now_ms: u64,
    ) -> Result<()> {
        let Some((mut trigger, state)) = Self::load_trigger_tx(tx, key).await? else {
            return Ok(());
        };
        if state != TriggerState::Paused && state != TriggerState::PausedBlocked {
            return Ok(());
        }
        // A trigger that missed fires while paused is subject to its
        // misfire instruction on resume.
        if trigger
            .next_fire_at_ms
            .is_some_and(|next| now_ms.saturating_sub(next) > self.misfire_threshold_ms)
        {
            let calendar = match trigger.calendar_name.as_deref() {
                Some(name) => Self::load_calendar_tx(tx, name).await?,
                None => None,
            };
            if let Err(e) = trigger.update_after_misfire(calendar.as_ref(), now_ms) {
                warn!(trigger = %key, error = %e, "misfire update on resume failed");
                return Self::save_trigger_tx(tx, &trigger, TriggerState::Error).await;
            }
        }
        let new_state = if trigger.next_fire_at_ms.is_none() {
            TriggerState::Complete
        } else if state == TriggerState::PausedBlocked {
            TriggerState::Blocked
        } else {
            TriggerState::Waiting
        };
        Self::save_trigger_tx(tx, &trigger, new_state).await
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn initialize(&self, signaler: Signaler, bus: Arc<ListenerBus>) -> Result<()> {
        *self.hooks.lock().unwrap_or_else(|e| e.into_inner()) = Some((signaler, bus));
        let now = self.clock.now_ms();
        let mut tx = self.pool.begin().await?;

        // Executions orphaned by a crash: re-fire the recoverable ones.
        let fired = sqlx::query(
            "SELECT f.trigger_group, f.trigger_name, f.job_group, f.job_name,
                    f.scheduled_fire_at_ms, f.requests_recovery
             FROM fired_triggers f",
        )
        .fetch_all(&mut *tx)
        .await?;

        let mut recovered = 0usize;
        for row in &fired {
            if row.get::<i64, _>("requests_recovery") == 0 {
                continue;
            }
            let orig_key = TriggerKey::new(
                row.get::<String, _>("trigger_group"),
                row.get::<String, _>("trigger_name"),
            )?;
            let job_key = JobKey::new(
                row.get::<String, _>("job_group"),
                row.get::<String, _>("job_name"),
            )?;
            let original = Self::load_trigger_tx(&mut tx, &orig_key).await?;
            let (priority, base_data) = original
                .as_ref()
                .map(|(t, _)| (t.priority, t.data.clone()))
                .unwrap_or((crate::trigger::DEFAULT_PRIORITY, JobDataMap::default()));

            let data = base_data
                .with(RECOVERY_ORIG_TRIGGER_GROUP, orig_key.group())
                .with(RECOVERY_ORIG_TRIGGER_NAME, orig_key.name())
                .with(
                    RECOVERY_ORIG_FIRE_TIME,
                    row.get::<i64, _>("scheduled_fire_at_ms"),
                );
            let recovery_key = TriggerKey::new(
                RECOVERY_GROUP,
                format!("recover-{}-{}", orig_key.name(), Uuid::new_v4()),
            )?;
            let mut recovery = Trigger::new(recovery_key, job_key, now, Schedule::once())
                .with_priority(priority)
                .with_data(data);
            recovery.next_fire_at_ms = Some(now);
            Self::save_trigger_tx(&mut tx, &recovery, TriggerState::Waiting).await?;
            recovered += 1;
        }

        sqlx::query("DELETE FROM fired_triggers")
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE triggers SET state = 'waiting' WHERE state IN ('acquired', 'executing')")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO scheduler_state (instance_id, last_checkin_at_ms, checkin_interval_ms)
             VALUES (?, ?, ?)
             ON CONFLICT(instance_id) DO UPDATE SET last_checkin_at_ms = excluded.last_checkin_at_ms",
        )
        .bind(&self.instance_id)
        .bind(now as i64)
        .bind(15_000i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        if recovered > 0 {
            info!(count = recovered, "queued recovery triggers for orphaned executions");
        }
        Ok(())
    }

    // ── Mutation ────────────────────────────────────────────────────────

    async fn store_job(&self, job: JobDetail, replace: bool) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if !replace && Self::load_job_tx(&mut tx, &job.key).await?.is_some() {
            return Err(SchedulerError::already_exists(format!("job '{}'", job.key)));
        }
        Self::save_job_tx(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn store_trigger(&self, trigger: Trigger, replace: bool) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if !replace && Self::load_trigger_tx(&mut tx, &trigger.key).await?.is_some() {
            return Err(SchedulerError::already_exists(format!(
                "trigger '{}'",
                trigger.key
            )));
        }
        if Self::load_job_tx(&mut tx, &trigger.job_key).await?.is_none() {
            return Err(SchedulerError::persistence(format!(
                "trigger '{}' references missing job '{}'",
                trigger.key, trigger.job_key
            )));
        }
        if let Some(name) = &trigger.calendar_name {
            if Self::load_calendar_tx(&mut tx, name).await?.is_none() {
                return Err(SchedulerError::persistence(format!(
                    "trigger '{}' references missing calendar '{name}'",
                    trigger.key
                )));
            }
        }
        let state = Self::initial_trigger_state_tx(&mut tx, &trigger).await?;
        Self::save_trigger_tx(&mut tx, &trigger, state).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn store_job_and_trigger(&self, job: JobDetail, trigger: Trigger) -> Result<()> {
        self.store_job(job, false).await?;
        self.store_trigger(trigger, false).await
    }

    async fn remove_job(&self, key: &JobKey) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM triggers WHERE job_group = ? AND job_name = ?")
            .bind(key.group())
            .bind(key.name())
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM jobs WHERE job_group = ? AND job_name = ?")
            .bind(key.group())
            .bind(key.name())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(deleted.rows_affected() > 0)
    }

    async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let removed = Self::delete_trigger_tx(&mut tx, key).await?;
        tx.commit().await?;
        Ok(removed)
    }

    async fn replace_trigger(&self, key: &TriggerKey, new_trigger: Trigger) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let Some((existing, _)) = Self::load_trigger_tx(&mut tx, key).await? else {
            return Ok(false);
        };
        if existing.job_key != new_trigger.job_key {
            return Err(SchedulerError::persistence(format!(
                "replacement trigger '{}' is not related to the same job",
                new_trigger.key
            )));
        }
        sqlx::query("DELETE FROM triggers WHERE trigger_group = ? AND trigger_name = ?")
            .bind(key.group())
            .bind(key.name())
            .execute(&mut *tx)
            .await?;
        let state = Self::initial_trigger_state_tx(&mut tx, &new_trigger).await?;
        Self::save_trigger_tx(&mut tx, &new_trigger, state).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn store_calendar(
        &self,
        name: &str,
        calendar: Calendar,
        replace: bool,
        update_triggers: bool,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if !replace && Self::load_calendar_tx(&mut tx, name).await?.is_some() {
            return Err(SchedulerError::already_exists(format!("calendar '{name}'")));
        }
        let data = serde_json::to_string(&calendar)?;
        sqlx::query(
            "INSERT INTO calendars (calendar_name, data) VALUES (?, ?)
             ON CONFLICT(calendar_name) DO UPDATE SET data = excluded.data",
        )
        .bind(name)
        .bind(&data)
        .execute(&mut *tx)
        .await?;

        if update_triggers {
            let now = self.clock.now_ms();
            let rows = sqlx::query(
                "SELECT trigger_group, trigger_name, data, state FROM triggers
                 WHERE calendar_name = ?",
            )
            .bind(name)
            .fetch_all(&mut *tx)
            .await?;
            for row in rows {
                let mut trigger: Trigger = serde_json::from_str(&row.get::<String, _>("data"))?;
                let state = TriggerState::from_str(&row.get::<String, _>("state"))
                    .map_err(SchedulerError::persistence)?;
                if let Err(e) =
                    trigger.update_with_new_calendar(&calendar, now, self.misfire_threshold_ms)
                {
                    warn!(trigger = %trigger.key, error = %e, "failed to update trigger for new calendar");
                    continue;
                }
                Self::save_trigger_tx(&mut tx, &trigger, state).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn remove_calendar(&self, name: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let referenced: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM triggers WHERE calendar_name = ?",
        )
        .bind(name)
        .fetch_one(&mut *tx)
        .await?
        .get("n");
        if referenced > 0 {
            return Err(SchedulerError::persistence(format!(
                "calendar '{name}' is referenced by a trigger and cannot be removed"
            )));
        }
        let deleted = sqlx::query("DELETE FROM calendars WHERE calendar_name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(deleted.rows_affected() > 0)
    }

    async fn clear_all_scheduling_data(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in [
            "fired_triggers",
            "triggers",
            "jobs",
            "calendars",
            "paused_trigger_groups",
            "paused_job_groups",
        ] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn pause_trigger(&self, key: &TriggerKey) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::pause_trigger_tx(&mut tx, key).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn pause_triggers(&self, matcher: &KeyMatcher) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;
        let keys = Self::all_trigger_keys_tx(&mut tx).await?;
        let groups: BTreeSet<String> = match matcher {
            KeyMatcher::GroupEquals { group } | KeyMatcher::Exact { group, .. } => {
                BTreeSet::from([group.clone()])
            },
            _ => keys
                .iter()
                .filter(|k| matcher.matches_trigger(k))
                .map(|k| k.group().to_string())
                .collect(),
        };
        for group in &groups {
            sqlx::query(
                "INSERT INTO paused_trigger_groups (trigger_group) VALUES (?)
                 ON CONFLICT(trigger_group) DO NOTHING",
            )
            .bind(group)
            .execute(&mut *tx)
            .await?;
        }
        for key in keys.iter().filter(|k| matcher.matches_trigger(k)) {
            Self::pause_trigger_tx(&mut tx, key).await?;
        }
        tx.commit().await?;
        Ok(groups.into_iter().collect())
    }

    async fn pause_job(&self, key: &JobKey) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "SELECT trigger_group, trigger_name FROM triggers WHERE job_group = ? AND job_name = ?",
        )
        .bind(key.group())
        .bind(key.name())
        .fetch_all(&mut *tx)
        .await?;
        for row in rows {
            let tk = TriggerKey::new(
                row.get::<String, _>("trigger_group"),
                row.get::<String, _>("trigger_name"),
            )?;
            Self::pause_trigger_tx(&mut tx, &tk).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn pause_jobs(&self, matcher: &KeyMatcher) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;
        let job_keys = Self::all_job_keys_tx(&mut tx).await?;
        let groups: BTreeSet<String> = match matcher {
            KeyMatcher::GroupEquals { group } | KeyMatcher::Exact { group, .. } => {
                BTreeSet::from([group.clone()])
            },
            _ => job_keys
                .iter()
                .filter(|k| matcher.matches_job(k))
                .map(|k| k.group().to_string())
                .collect(),
        };
        for group in &groups {
            sqlx::query(
                "INSERT INTO paused_job_groups (job_group) VALUES (?)
                 ON CONFLICT(job_group) DO NOTHING",
            )
            .bind(group)
            .execute(&mut *tx)
            .await?;
        }
        for job in job_keys.iter().filter(|k| matcher.matches_job(k)) {
            let rows = sqlx::query(
                "SELECT trigger_group, trigger_name FROM triggers
                 WHERE job_group = ? AND job_name = ?",
            )
            .bind(job.group())
            .bind(job.name())
            .fetch_all(&mut *tx)
            .await?;
            for row in rows {
                let tk = TriggerKey::new(
                    row.get::<String, _>("trigger_group"),
                    row.get::<String, _>("trigger_name"),
                )?;
                Self::pause_trigger_tx(&mut tx, &tk).await?;
            }
        }
        tx.commit().await?;
        Ok(groups.into_iter().collect())
    }

    async fn resume_trigger(&self, key: &TriggerKey) -> Result<()> {
        let now = self.clock.now_ms();
        let mut tx = self.pool.begin().await?;
        self.resume_trigger_tx(&mut tx, key, now).await?;
        tx.commit().await?;
        self.signal_change(0);
        Ok(())
    }

    async fn resume_triggers(&self, matcher: &KeyMatcher) -> Result<Vec<String>> {
        let now = self.clock.now_ms();
        let mut tx = self.pool.begin().await?;
        let keys = Self::all_trigger_keys_tx(&mut tx).await?;
        let groups: BTreeSet<String> = match matcher {
            KeyMatcher::GroupEquals { group } | KeyMatcher::Exact { group, .. } => {
                BTreeSet::from([group.clone()])
            },
            _ => keys
                .iter()
                .filter(|k| matcher.matches_trigger(k))
                .map(|k| k.group().to_string())
                .collect(),
        };
        for group in &groups {
            sqlx::query("DELETE FROM paused_trigger_groups WHERE trigger_group = ?")
                .bind(group)
                .execute(&mut *tx)
                .await?;
        }
        for key in keys.iter().filter(|k| matcher.matches_trigger(k)) {
            self.resume_trigger_tx(&mut tx, key, now).await?;
        }
        tx.commit().await?;
        self.signal_change(0);
        Ok(groups.into_iter().collect())
    }

    async fn resume_job(&self, key: &JobKey) -> Result<()> {
        let now = self.clock.now_ms();
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "SELECT trigger_group, trigger_name FROM triggers WHERE job_group = ? AND job_name = ?",
        )
        .bind(key.group())
        .bind(key.name())
        .fetch_all(&mut *tx)
        .await?;
        for row in rows {
            let tk = TriggerKey::new(
                row.get::<String, _>("trigger_group"),
                row.get::<String, _>("trigger_name"),
            )?;
            self.resume_trigger_tx(&mut tx, &tk, now).await?;
        }
        tx.commit().await?;
        self.signal_change(0);
        Ok(())
    }

    async fn resume_jobs(&self, matcher: &KeyMatcher) -> Result<Vec<String>> {
        let now = self.clock.now_ms();
        let mut tx = self.pool.begin().await?;
        let job_keys = Self::all_job_keys_tx(&mut tx).await?;
        let groups: BTreeSet<String> = match matcher {
            KeyMatcher::GroupEquals { group } | KeyMatcher::Exact { group, .. } => {
                BTreeSet::from([group.clone()])
            },
            _ => job_keys
                .iter()
                .filter(|k| matcher.matches_job(k))
                .map(|k| k.group().to_string())
                .collect(),
        };
        for group in &groups {
            sqlx::query("DELETE FROM paused_job_groups WHERE job_group = ?")
                .bind(group)
                .execute(&mut *tx)
                .await?;
        }
        for job in job_keys.iter().filter(|k| matcher.matches_job(k)) {
            let rows = sqlx::query(
                "SELECT trigger_group, trigger_name FROM triggers
                 WHERE job_group = ? AND job_name = ?",
            )
            .bind(job.group())
            .bind(job.name())
            .fetch_all(&mut *tx)
            .await?;
            for row in rows {
                let tk = TriggerKey::new(
                    row.get::<String, _>("trigger_group"),
                    row.get::<String, _>("trigger_name"),
                )?;
                self.resume_trigger_tx(&mut tx, &tk, now).await?;
            }
        }
        tx.commit().await?;
        self.signal_change(0);
        Ok(groups.into_iter().collect())
    }

    async fn pause_all(&self) -> Result<()> {
        self.pause_triggers(&KeyMatcher::Everything).await?;
        Ok(())
    }

    async fn resume_all(&self) -> Result<()> {
        {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM paused_trigger_groups")
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM paused_job_groups")
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        }
        self.resume_triggers(&KeyMatcher::Everything).await?;
        Ok(())
    }

    async fn reset_trigger_from_error_state(&self, key: &TriggerKey) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let Some((_, state)) = Self::load_trigger_tx(&mut tx, key).await? else {
            return Err(SchedulerError::not_found(format!("trigger '{key}'")));
        };
        if state == TriggerState::Error {
            let paused: i64 = sqlx::query(
                "SELECT EXISTS (SELECT 1 FROM paused_trigger_groups WHERE trigger_group = ?) AS p",
            )
            .bind(key.group())
            .fetch_one(&mut *tx)
            .await?
            .get("p");
            let new_state = if paused != 0 {
                TriggerState::Paused
            } else {
                TriggerState::Waiting
            };
            Self::set_trigger_state_tx(&mut tx, key, new_state).await?;
        }
        tx.commit().await?;
        self.signal_change(0);
        Ok(())
    }

    // ── Query ───────────────────────────────────────────────────────────

    async fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDetail>> {
        let mut tx = self.pool.begin().await?;
        let job = Self::load_job_tx(&mut tx, key).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>> {
        let mut tx = self.pool.begin().await?;
        let trigger = Self::load_trigger_tx(&mut tx, key).await?.map(|(t, _)| t);
        tx.commit().await?;
        Ok(trigger)
    }

    async fn retrieve_calendar(&self, name: &str) -> Result<Option<Calendar>> {
        let mut tx = self.pool.begin().await?;
        let calendar = Self::load_calendar_tx(&mut tx, name).await?;
        tx.commit().await?;
        Ok(calendar)
    }

    async fn check_job_exists(&self, key: &JobKey) -> Result<bool> {
        Ok(self.retrieve_job(key).await?.is_some())
    }

    async fn check_trigger_exists(&self, key: &TriggerKey) -> Result<bool> {
        Ok(self.retrieve_trigger(key).await?.is_some())
    }

    async fn get_job_keys(&self, matcher: &KeyMatcher) -> Result<Vec<JobKey>> {
        let mut tx = self.pool.begin().await?;
        let mut keys = Self::all_job_keys_tx(&mut tx).await?;
        tx.commit().await?;
        keys.retain(|k| matcher.matches_job(k));
        keys.sort();
        Ok(keys)
    }

    async fn get_trigger_keys(&self, matcher: &KeyMatcher) -> Result<Vec<TriggerKey>> {
        let mut tx = self.pool.begin().await?;
        let mut keys = Self::all_trigger_keys_tx(&mut tx).await?;
        tx.commit().await?;
        keys.retain(|k| matcher.matches_trigger(k));
        keys.sort();
        Ok(keys)
    }

    async fn get_triggers_for_job(&self, key: &JobKey) -> Result<Vec<Trigger>> {
        let rows = sqlx::query(
            "SELECT data FROM triggers WHERE job_group = ? AND job_name = ?
             ORDER BY trigger_group, trigger_name",
        )
        .bind(key.group())
        .bind(key.name())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| serde_json::from_str(&r.get::<String, _>("data")).map_err(Into::into))
            .collect()
    }

    async fn get_trigger_state(&self, key: &TriggerKey) -> Result<Option<TriggerState>> {
        let mut tx = self.pool.begin().await?;
        let state = Self::load_trigger_tx(&mut tx, key).await?.map(|(_, s)| s);
        tx.commit().await?;
        Ok(state)
    }

    async fn get_job_group_names(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT job_group FROM jobs ORDER BY job_group")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("job_group")).collect())
    }

    async fn get_trigger_group_names(&self) -> Result<Vec<String>> {
        let rows =
            sqlx::query("SELECT DISTINCT trigger_group FROM triggers ORDER BY trigger_group")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.iter().map(|r| r.get("trigger_group")).collect())
    }

    async fn get_calendar_names(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT calendar_name FROM calendars ORDER BY calendar_name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("calendar_name")).collect())
    }

    async fn get_number_of_jobs(&self) -> Result<usize> {
        let n: i64 = sqlx::query("SELECT COUNT(*) AS n FROM jobs")
            .fetch_one(&self.pool)
            .await?
            .get("n");
        Ok(n as usize)
    }

    async fn get_number_of_triggers(&self) -> Result<usize> {
        let n: i64 = sqlx::query("SELECT COUNT(*) AS n FROM triggers")
            .fetch_one(&self.pool)
            .await?
            .get("n");
        Ok(n as usize)
    }

    async fn get_number_of_calendars(&self) -> Result<usize> {
        let n: i64 = sqlx::query("SELECT COUNT(*) AS n FROM calendars")
            .fetch_one(&self.pool)
            .await?
            .get("n");
        Ok(n as usize)
    }

    async fn get_paused_trigger_groups(&self) -> Result<BTreeSet<String>> {
        let rows = sqlx::query("SELECT trigger_group FROM paused_trigger_groups")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("trigger_group")).collect())
    }

    // ── Firing protocol ─────────────────────────────────────────────────

    async fn acquire_next_triggers(
        &self,
        no_later_than_ms: u64,
        max_count: usize,
        time_window_ms: u64,
    ) -> Result<Vec<Trigger>> {
        let now = self.clock.now_ms();
        let bound = no_later_than_ms.saturating_add(time_window_ms);
        let mut misfired = Vec::new();
        let mut acquired: Vec<Trigger> = Vec::new();

        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "SELECT trigger_group, trigger_name, data FROM triggers
             WHERE state = 'waiting' AND next_fire_at_ms IS NOT NULL AND next_fire_at_ms <= ?
             ORDER BY next_fire_at_ms ASC, priority DESC,
                      CASE WHEN trigger_group = 'DEFAULT' THEN 0 ELSE 1 END,
                      trigger_group ASC, trigger_name ASC",
        )
        .bind(bound as i64)
        .fetch_all(&mut *tx)
        .await?;

        let mut first_fire: Option<u64> = None;
        let mut no_concurrent: std::collections::HashSet<JobKey> = std::collections::HashSet::new();

        for row in rows {
            if acquired.len() >= max_count {
                break;
            }
            let mut trigger: Trigger = serde_json::from_str(&row.get::<String, _>("data"))?;

            // Misfire handling before candidacy.
            if trigger
                .next_fire_at_ms
                .is_some_and(|next| now.saturating_sub(next) > self.misfire_threshold_ms)
            {
                let calendar = match trigger.calendar_name.as_deref() {
                    Some(name) => Self::load_calendar_tx(&mut tx, name).await?,
                    None => None,
                };
                match trigger.update_after_misfire(calendar.as_ref(), now) {
                    Ok(()) => {
                        misfired.push(trigger.clone());
                        let state = if trigger.next_fire_at_ms.is_none() {
                            TriggerState::Complete
                        } else {
                            TriggerState::Waiting
                        };
                        Self::save_trigger_tx(&mut tx, &trigger, state).await?;
                        if state != TriggerState::Waiting {
                            continue;
                        }
                    },
                    Err(e) => {
                        warn!(trigger = %trigger.key, error = %e, "misfire update failed; marking trigger errored");
                        Self::save_trigger_tx(&mut tx, &trigger, TriggerState::Error).await?;
                        continue;
                    },
                }
            }
            let Some(next_fire) = trigger.next_fire_at_ms else {
                continue;
            };
            let in_window = match first_fire {
                None => next_fire <= bound,
                Some(first) => next_fire <= first.saturating_add(time_window_ms),
            };
            if !in_window {
                continue;
            }

            let disallow: i64 = sqlx::query(
                "SELECT disallow_concurrent FROM jobs WHERE job_group = ? AND job_name = ?",
            )
            .bind(trigger.job_key.group())
            .bind(trigger.job_key.name())
            .fetch_optional(&mut *tx)
            .await?
            .map(|r| r.get("disallow_concurrent"))
            .unwrap_or(0);
            if disallow != 0 && !no_concurrent.insert(trigger.job_key.clone()) {
                continue;
            }

            let updated = sqlx::query(
                "UPDATE triggers SET state = 'acquired'
                 WHERE trigger_group = ? AND trigger_name = ? AND state = 'waiting'",
            )
            .bind(trigger.key.group())
            .bind(trigger.key.name())
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() != 1 {
                continue;
            }
            first_fire.get_or_insert(next_fire);
            acquired.push(trigger);
        }
        tx.commit().await?;

        debug!(count = acquired.len(), "batch acquisition");
        self.notify_misfired(&misfired).await;
        Ok(acquired)
    }

    async fn release_acquired_trigger(&self, trigger: &Trigger) -> Result<()> {
        sqlx::query(
            "UPDATE triggers SET state = 'waiting'
             WHERE trigger_group = ? AND trigger_name = ? AND state = 'acquired'",
        )
        .bind(trigger.key.group())
        .bind(trigger.key.name())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn triggers_fired(
        &self,
        triggers: &[Trigger],
    ) -> Result<Vec<Option<TriggerFiredBundle>>> {
        let now = self.clock.now_ms();
        let mut results = Vec::with_capacity(triggers.len());
        let mut tx = self.pool.begin().await?;

        for t in triggers {
            let Some((mut trigger, state)) = Self::load_trigger_tx(&mut tx, &t.key).await? else {
                results.push(None);
                continue;
            };
            if state != TriggerState::Acquired {
                results.push(None);
                continue;
            }
            let calendar = match trigger.calendar_name.as_deref() {
                Some(name) => match Self::load_calendar_tx(&mut tx, name).await? {
                    Some(c) => Some(c),
                    None => {
                        results.push(None);
                        continue;
                    },
                },
                None => None,
            };
            let Some(job) = Self::load_job_tx(&mut tx, &trigger.job_key).await? else {
                results.push(None);
                continue;
            };

            let scheduled_fire = trigger.next_fire_at_ms.unwrap_or(now);
            let prev_fire = trigger.previous_fire_at_ms;
            if let Err(e) = trigger.triggered(calendar.as_ref()) {
                warn!(trigger = %t.key, error = %e, "trigger advance failed at fire time");
                Self::save_trigger_tx(&mut tx, &trigger, TriggerState::Error).await?;
                results.push(None);
                continue;
            }
            Self::save_trigger_tx(&mut tx, &trigger, TriggerState::Executing).await?;

            let fire_instance_id = Uuid::new_v4().to_string();
            sqlx::query(
                "INSERT INTO fired_triggers
                   (fire_instance_id, trigger_group, trigger_name, job_group, job_name,
                    fired_at_ms, scheduled_fire_at_ms, requests_recovery)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&fire_instance_id)
            .bind(trigger.key.group())
            .bind(trigger.key.name())
            .bind(trigger.job_key.group())
            .bind(trigger.job_key.name())
            .bind(now as i64)
            .bind(scheduled_fire as i64)
            .bind(job.requests_recovery as i64)
            .execute(&mut *tx)
            .await?;

            if job.disallow_concurrent_execution {
                sqlx::query(
                    "UPDATE triggers SET state = 'blocked'
                     WHERE job_group = ? AND job_name = ? AND state = 'waiting'",
                )
                .bind(job.key.group())
                .bind(job.key.name())
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    "UPDATE triggers SET state = 'pausedBlocked'
                     WHERE job_group = ? AND job_name = ? AND state = 'paused'",
                )
                .bind(job.key.group())
                .bind(job.key.name())
                .execute(&mut *tx)
                .await?;
            }

            let recovering = trigger.key.group() == RECOVERY_GROUP
                && trigger.data.contains_key(RECOVERY_ORIG_TRIGGER_NAME);
            results.push(Some(TriggerFiredBundle {
                next_fire_at_ms: trigger.next_fire_at_ms,
                job,
                trigger,
                calendar,
                recovering,
                fire_instance_id,
                fire_at_ms: now,
                scheduled_fire_at_ms: scheduled_fire,
                previous_fire_at_ms: prev_fire,
            }));
        }
        tx.commit().await?;
        Ok(results)
    }

    async fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletionInstruction,
    ) -> Result<()> {
        let mut signal = false;
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM fired_triggers WHERE trigger_group = ? AND trigger_name = ?")
            .bind(trigger.key.group())
            .bind(trigger.key.name())
            .execute(&mut *tx)
            .await?;

        if job.persist_data_after_execution {
            if let Some(mut stored) = Self::load_job_tx(&mut tx, &job.key).await? {
                stored.data = job.data.clone();
                Self::save_job_tx(&mut tx, &stored).await?;
            }
        }

        if job.disallow_concurrent_execution {
            sqlx::query(
                "UPDATE triggers SET state = 'waiting'
                 WHERE job_group = ? AND job_name = ? AND state = 'blocked'",
            )
            .bind(job.key.group())
            .bind(job.key.name())
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "UPDATE triggers SET state = 'paused'
                 WHERE job_group = ? AND job_name = ? AND state = 'pausedBlocked'",
            )
            .bind(job.key.group())
            .bind(job.key.name())
            .execute(&mut *tx)
            .await?;
            signal = true;
        }

        match instruction {
            CompletionInstruction::SetAllJobTriggersComplete => {
                sqlx::query(
                    "UPDATE triggers SET state = 'complete' WHERE job_group = ? AND job_name = ?",
                )
                .bind(job.key.group())
                .bind(job.key.name())
                .execute(&mut *tx)
                .await?;
                signal = true;
            },
            CompletionInstruction::SetAllJobTriggersError => {
                warn!(job = %job.key, "setting all triggers of job to error state");
                sqlx::query(
                    "UPDATE triggers SET state = 'error' WHERE job_group = ? AND job_name = ?",
                )
                .bind(job.key.group())
                .bind(job.key.name())
                .execute(&mut *tx)
                .await?;
                signal = true;
            },
            CompletionInstruction::DeleteTrigger => {
                let stored = Self::load_trigger_tx(&mut tx, &trigger.key).await?;
                let rescheduled = trigger.next_fire_at_ms.is_none()
                    && stored
                        .as_ref()
                        .is_some_and(|(t, _)| t.next_fire_at_ms.is_some());
                if rescheduled {
                    // The trigger gained a future fire while executing; keep it.
                    if stored.is_some_and(|(_, s)| s == TriggerState::Executing) {
                        Self::set_trigger_state_tx(&mut tx, &trigger.key, TriggerState::Waiting)
                            .await?;
                    }
                } else {
                    Self::delete_trigger_tx(&mut tx, &trigger.key).await?;
                }
            },
            CompletionInstruction::SetTriggerComplete => {
                Self::set_trigger_state_tx(&mut tx, &trigger.key, TriggerState::Complete).await?;
                signal = true;
            },
            CompletionInstruction::SetTriggerError => {
                warn!(trigger = %trigger.key, "setting trigger to error state");
                Self::set_trigger_state_tx(&mut tx, &trigger.key, TriggerState::Error).await?;
                signal = true;
            },
            CompletionInstruction::Noop | CompletionInstruction::ReExecuteJob => {
                sqlx::query(
                    "UPDATE triggers
                     SET state = CASE WHEN next_fire_at_ms IS NULL THEN 'complete' ELSE 'waiting' END
                     WHERE trigger_group = ? AND trigger_name = ? AND state = 'executing'",
                )
                .bind(trigger.key.group())
                .bind(trigger.key.name())
                .execute(&mut *tx)
                .await?;
            },
        }
        tx.commit().await?;

        if signal {
            self.signal_change(0);
        }
        Ok(())
    }

    // ── Capabilities ────────────────────────────────────────────────────

    fn supports_persistence(&self) -> bool {
        true
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::clock::{Clock, ManualClock};

    async fn make_store() -> SqliteStore {
        SqliteStore::new("sqlite::memory:").await.unwrap()
    }

    fn job(name: &str) -> JobDetail {
        JobDetail::new(JobKey::of(name).unwrap(), "test.Job").durable(true)
    }

    fn simple_trigger(name: &str, job: &str, start: u64, repeat: i32, interval: u64) -> Trigger {
        let mut t = Trigger::new(
            TriggerKey::of(name).unwrap(),
            JobKey::of(job).unwrap(),
            start,
            Schedule::simple(repeat, interval),
        );
        t.compute_first_fire(None).unwrap();
        t
    }

    #[tokio::test]
    async fn test_sqlite_job_round_trip() {
        let store = make_store().await;
        let j = job("j1").with_data(JobDataMap::new().with("limit", 3));
        store.store_job(j.clone(), false).await.unwrap();
        let back = store.retrieve_job(&j.key).await.unwrap().unwrap();
        assert_eq!(j, back);
    }

    #[tokio::test]
    async fn test_sqlite_duplicate_job_fails_without_replace() {
        let store = make_store().await;
        store.store_job(job("j1"), false).await.unwrap();
        assert!(store.store_job(job("j1"), false).await.is_err());
        store.store_job(job("j1"), true).await.unwrap();
    }

    #[tokio::test]
    async fn test_sqlite_trigger_round_trip_and_state() {
        let store = make_store().await;
        store.store_job(job("j1"), false).await.unwrap();
        let t = simple_trigger("t1", "j1", 0, 2, 1_000);
        store.store_trigger(t.clone(), false).await.unwrap();
        let back = store.retrieve_trigger(&t.key).await.unwrap().unwrap();
        assert_eq!(t, back);
        assert_eq!(
            store.get_trigger_state(&t.key).await.unwrap(),
            Some(TriggerState::Waiting)
        );
    }

    #[tokio::test]
    async fn test_sqlite_acquire_fire_complete_cycle() {
        let clock = Arc::new(ManualClock::new(0));
        let store = make_store().await.with_clock(clock.clone());
        store.store_job(job("j1"), false).await.unwrap();
        store
            .store_trigger(simple_trigger("t1", "j1", 0, 1, 60_000), false)
            .await
            .unwrap();

        let acquired = store.acquire_next_triggers(30_000, 1, 0).await.unwrap();
        assert_eq!(acquired.len(), 1);
        // Not handed out twice.
        assert!(store.acquire_next_triggers(30_000, 1, 0).await.unwrap().is_empty());

        let bundles = store.triggers_fired(&acquired).await.unwrap();
        let bundle = bundles[0].as_ref().unwrap();
        assert_eq!(bundle.scheduled_fire_at_ms, 0);
        assert_eq!(bundle.trigger.next_fire_at_ms, Some(60_000));
        assert_eq!(
            store.get_trigger_state(&bundle.trigger.key).await.unwrap(),
            Some(TriggerState::Executing)
        );

        store
            .triggered_job_complete(&bundle.trigger, &bundle.job, CompletionInstruction::Noop)
            .await
            .unwrap();
        assert_eq!(
            store.get_trigger_state(&bundle.trigger.key).await.unwrap(),
            Some(TriggerState::Waiting)
        );
    }

    #[tokio::test]
    async fn test_sqlite_disallow_concurrent_blocks_and_unblocks() {
        let store = make_store().await;
        let j = JobDetail::new(JobKey::of("serial").unwrap(), "test.Job")
            .durable(true)
            .disallow_concurrent_execution(true);
        store.store_job(j, false).await.unwrap();
        store
            .store_trigger(simple_trigger("t1", "serial", 0, 0, 0), false)
            .await
            .unwrap();
        store
            .store_trigger(simple_trigger("t2", "serial", 0, 0, 0), false)
            .await
            .unwrap();

        let acquired = store.acquire_next_triggers(30_000, 2, 0).await.unwrap();
        assert_eq!(acquired.len(), 1);
        let bundles = store.triggers_fired(&acquired).await.unwrap();
        let bundle = bundles[0].as_ref().unwrap();

        let other = if acquired[0].key.name() == "t1" { "t2" } else { "t1" };
        assert_eq!(
            store
                .get_trigger_state(&TriggerKey::of(other).unwrap())
                .await
                .unwrap(),
            Some(TriggerState::Blocked)
        );

        store
            .triggered_job_complete(&bundle.trigger, &bundle.job, CompletionInstruction::Noop)
            .await
            .unwrap();
        assert_eq!(
            store
                .get_trigger_state(&TriggerKey::of(other).unwrap())
                .await
                .unwrap(),
            Some(TriggerState::Waiting)
        );
    }

    #[tokio::test]
    async fn test_sqlite_paused_group_applies_to_new_triggers() {
        let store = make_store().await;
        store.store_job(job("j1"), false).await.unwrap();
        store
            .pause_triggers(&KeyMatcher::group("DEFAULT"))
            .await
            .unwrap();
        store
            .store_trigger(simple_trigger("late", "j1", 0, 0, 0), false)
            .await
            .unwrap();
        assert_eq!(
            store
                .get_trigger_state(&TriggerKey::of("late").unwrap())
                .await
                .unwrap(),
            Some(TriggerState::Paused)
        );
        assert!(!store.get_paused_trigger_groups().await.unwrap().is_empty());

        store
            .resume_triggers(&KeyMatcher::group("DEFAULT"))
            .await
            .unwrap();
        assert_eq!(
            store
                .get_trigger_state(&TriggerKey::of("late").unwrap())
                .await
                .unwrap(),
            Some(TriggerState::Waiting)
        );
    }

    #[tokio::test]
    async fn test_sqlite_recovery_across_reopen() {
        let dir = TempDir::new().unwrap();
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("sched.db").display()
        );

        // First life: fire a recoverable job, then "crash" (drop the store
        // without completing).
        {
            let store = SqliteStore::new(&url).await.unwrap();
            let j = job("critical").requests_recovery(true);
            store.store_job(j, false).await.unwrap();
            store
                .store_trigger(simple_trigger("t1", "critical", 0, 5, 60_000), false)
                .await
                .unwrap();
            let acquired = store.acquire_next_triggers(30_000, 1, 0).await.unwrap();
            let bundles = store.triggers_fired(&acquired).await.unwrap();
            assert!(bundles[0].is_some());
        }

        // Second life: initialize recovers the orphaned execution.
        let store = SqliteStore::new(&url).await.unwrap();
        store
            .initialize(Signaler::new(), Arc::new(ListenerBus::new()))
            .await
            .unwrap();

        assert_eq!(
            store
                .get_trigger_state(&TriggerKey::of("t1").unwrap())
                .await
                .unwrap(),
            Some(TriggerState::Waiting)
        );
        let recovery_keys = store
            .get_trigger_keys(&KeyMatcher::group(RECOVERY_GROUP))
            .await
            .unwrap();
        assert_eq!(recovery_keys.len(), 1);

        let now = crate::clock::SystemClock.now_ms();
        let acquired = store.acquire_next_triggers(now, 5, 0).await.unwrap();
        let recovery = acquired
            .iter()
            .find(|t| t.key.group() == RECOVERY_GROUP)
            .expect("recovery trigger should be due");
        let bundles = store
            .triggers_fired(std::slice::from_ref(recovery))
            .await
            .unwrap();
        let bundle = bundles[0].as_ref().unwrap();
        assert!(bundle.recovering);
        assert_eq!(
            bundle.recovering_trigger_key(),
            Some(TriggerKey::of("t1").unwrap())
        );
    }

    #[tokio::test]
    async fn test_sqlite_calendar_guard_and_round_trip() {
        let store = make_store().await;
        store
            .store_calendar("weekends", Calendar::weekends(), false, false)
            .await
            .unwrap();
        let back = store.retrieve_calendar("weekends").await.unwrap().unwrap();
        assert_eq!(back, Calendar::weekends());

        store.store_job(job("j1"), false).await.unwrap();
        let t = simple_trigger("t1", "j1", 0, 0, 0).with_calendar("weekends");
        store.store_trigger(t, false).await.unwrap();
        assert!(store.remove_calendar("weekends").await.is_err());
    }

    #[tokio::test]
    async fn test_sqlite_delete_trigger_cleans_up_non_durable_job() {
        let store = make_store().await;
        let j = JobDetail::new(JobKey::of("ephemeral").unwrap(), "test.Job");
        store.store_job(j, false).await.unwrap();
        store
            .store_trigger(simple_trigger("t1", "ephemeral", 0, 0, 0), false)
            .await
            .unwrap();
        assert!(store.remove_trigger(&TriggerKey::of("t1").unwrap()).await.unwrap());
        assert!(!store.check_job_exists(&JobKey::of("ephemeral").unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_misfire_applied_on_acquire() {
        let clock = Arc::new(ManualClock::new(0));
        let store = make_store().await.with_clock(clock.clone());
        store.store_job(job("j1"), false).await.unwrap();
        let mut t = Trigger::new(
            TriggerKey::of("hourly").unwrap(),
            JobKey::of("j1").unwrap(),
            0,
            Schedule::cron("0 0 * * * ?"),
        );
        t.compute_first_fire(None).unwrap();
        store.store_trigger(t, false).await.unwrap();

        clock.set(3 * 3_600_000 + 5 * 60_000);
        let now = clock.now_ms();
        let acquired = store.acquire_next_triggers(now + 30_000, 1, 0).await.unwrap();
        assert_eq!(acquired.len(), 1);
        assert_eq!(acquired[0].next_fire_at_ms, Some(now));
    }
}
