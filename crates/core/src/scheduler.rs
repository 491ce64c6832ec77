//! The scheduler façade: lifecycle, scheduling CRUD, and the process-wide
//! instance repository.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, OnceLock, RwLock},
    time::Duration,
};

use {
    tokio::task::JoinHandle,
    tracing::{error, info, warn},
    uuid::Uuid,
};

use crate::{
    calendar::Calendar,
    clock::{SharedClock, SystemClock},
    config::{SchedulerConfig, StoreConfig},
    dispatch::Dispatcher,
    error::{Result, SchedulerError},
    job::{JobDataMap, JobDetail, JobFactory, RegistryJobFactory},
    key::{JobKey, KeyMatcher, TriggerKey},
    listener::ListenerBus,
    pool::{FixedWorkerPool, WorkerPool, ZeroSizeWorkerPool},
    shell::{ExecutingJobSummary, ExecutingRegistry},
    signal::Signaler,
    store::JobStore,
    store_memory::MemoryStore,
    store_sqlite::SqliteStore,
    trigger::{Schedule, Trigger, TriggerState},
};

/// Group that holds the one-shot triggers created by `trigger_job`.
pub const MANUAL_GROUP: &str = "MANUAL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Started,
    Standby,
    Shutdown,
}

struct Lifecycle {
    phase: Phase,
    dispatcher: Option<JoinHandle<()>>,
}

/// A scheduler instance. Construct through [`SchedulerBuilder`]; instances
/// register themselves in the [`SchedulerRepository`] under their unique
/// name and deregister on shutdown.
pub struct Scheduler {
    name: String,
    instance_id: String,
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    pool: Arc<dyn WorkerPool>,
    bus: Arc<ListenerBus>,
    signaler: Signaler,
    clock: SharedClock,
    factory: Arc<RwLock<Arc<dyn JobFactory>>>,
    registry: Arc<ExecutingRegistry>,
    lifecycle: Mutex<Lifecycle>,
}

impl Scheduler {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    #[must_use]
    pub fn listeners(&self) -> Arc<ListenerBus> {
        Arc::clone(&self.bus)
    }

    pub fn set_job_factory(&self, factory: Arc<dyn JobFactory>) {
        *self.factory.write().unwrap_or_else(|e| e.into_inner()) = factory;
    }

    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn phase(&self) -> Phase {
        self.lifecycle().phase
    }

    fn ensure_not_shutdown(&self) -> Result<()> {
        if self.phase() == Phase::Shutdown {
            return Err(SchedulerError::Shutdown);
        }
        Ok(())
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut lc = self.lifecycle();
            match lc.phase {
                Phase::Shutdown => return Err(SchedulerError::Shutdown),
                Phase::Started => return Ok(()),
                Phase::Standby => lc.phase = Phase::Started,
                Phase::Created => {
                    let dispatcher = Dispatcher {
                        scheduler_name: self.name.clone(),
                        store: Arc::clone(&self.store),
                        pool: Arc::clone(&self.pool),
                        bus: Arc::clone(&self.bus),
                        signaler: self.signaler.clone(),
                        registry: Arc::clone(&self.registry),
                        factory: Arc::clone(&self.factory),
                        clock: Arc::clone(&self.clock),
                        idle_wait_ms: self.config.idle_wait_ms,
                        batch_max_count: self.config.batch_max_count,
                        batch_time_window_ms: self.config.batch_time_window_ms,
                    };
                    lc.dispatcher = Some(tokio::spawn(dispatcher.run()));
                    lc.phase = Phase::Started;
                },
            }
        }
        self.signaler.set_paused(false);
        info!(scheduler = %self.name, instance = %self.instance_id, "scheduler started");
        self.bus.notify_scheduler_started().await;
        Ok(())
    }

    /// Start after a delay. Errors from the deferred start are logged.
    pub fn start_delayed(self: &Arc<Self>, delay: Duration) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = scheduler.start().await {
                error!(scheduler = %scheduler.name, error = %e, "delayed start failed");
            }
        });
    }

    /// Stop firing without giving up any state; `start` resumes.
    pub async fn standby(&self) -> Result<()> {
        self.ensure_not_shutdown()?;
        self.lifecycle().phase = Phase::Standby;
        self.signaler.set_paused(true);
        info!(scheduler = %self.name, "scheduler in standby");
        self.bus.notify_scheduler_in_standby().await;
        Ok(())
    }

    pub async fn shutdown(&self, wait_for_jobs: bool) -> Result<()> {
        let dispatcher = {
            let mut lc = self.lifecycle();
            if lc.phase == Phase::Shutdown {
                return Ok(());
            }
            lc.phase = Phase::Shutdown;
            lc.dispatcher.take()
        };
        self.signaler.halt();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                warn!(scheduler = %self.name, error = %e, "dispatcher task ended abnormally");
            }
        }
        self.pool.shutdown(wait_for_jobs).await;
        SchedulerRepository::remove(&self.name);
        info!(scheduler = %self.name, "scheduler shut down");
        self.bus.notify_scheduler_shutdown().await;
        Ok(())
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.phase() == Phase::Started
    }

    #[must_use]
    pub fn is_in_standby_mode(&self) -> bool {
        self.phase() == Phase::Standby
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.phase() == Phase::Shutdown
    }

    // ── Scheduling ──────────────────────────────────────────────────────

    async fn resolve_calendar(&self, trigger: &Trigger) -> Result<Option<Calendar>> {
        match trigger.calendar_name.as_deref() {
            Some(name) => {
                let calendar = self.store.retrieve_calendar(name).await?;
                calendar
                    .map(Some)
                    .ok_or_else(|| {
                        SchedulerError::persistence(format!(
                            "trigger '{}' references missing calendar '{name}'",
                            trigger.key
                        ))
                    })
            },
            None => Ok(None),
        }
    }

    /// Store the job and its trigger; returns the first fire time.
    pub async fn schedule_job(&self, job: JobDetail, trigger: Trigger) -> Result<u64> {
        self.ensure_not_shutdown()?;
        if trigger.job_key != job.key {
            return Err(SchedulerError::invalid_argument(format!(
                "trigger '{}' does not reference job '{}'",
                trigger.key, job.key
            )));
        }
        trigger.validate()?;
        let calendar = self.resolve_calendar(&trigger).await?;
        let mut trigger = trigger;
        let first_fire = trigger
            .compute_first_fire(calendar.as_ref())?
            .ok_or_else(|| {
                SchedulerError::invalid_argument(format!(
                    "trigger '{}' will never fire",
                    trigger.key
                ))
            })?;
        self.store.store_job_and_trigger(job, trigger.clone()).await?;
        self.signaler.signal_scheduling_change(first_fire);
        info!(trigger = %trigger.key, first_fire, "job scheduled");
        self.bus.notify_job_scheduled(&trigger).await;
        Ok(first_fire)
    }

    /// Schedule a trigger for an already-stored job.
    pub async fn schedule_trigger(&self, trigger: Trigger) -> Result<u64> {
        self.ensure_not_shutdown()?;
        trigger.validate()?;
        let calendar = self.resolve_calendar(&trigger).await?;
        let mut trigger = trigger;
        let first_fire = trigger
            .compute_first_fire(calendar.as_ref())?
            .ok_or_else(|| {
                SchedulerError::invalid_argument(format!(
                    "trigger '{}' will never fire",
                    trigger.key
                ))
            })?;
        self.store.store_trigger(trigger.clone(), false).await?;
        self.signaler.signal_scheduling_change(first_fire);
        self.bus.notify_job_scheduled(&trigger).await;
        Ok(first_fire)
    }

    /// Store a job with no trigger. Non-durable jobs are only accepted with
    /// `store_non_durable_while_awaiting_scheduling`.
    pub async fn add_job(
        &self,
        job: JobDetail,
        replace: bool,
        store_non_durable_while_awaiting_scheduling: bool,
    ) -> Result<()> {
        self.ensure_not_shutdown()?;
        if !job.durable && !store_non_durable_while_awaiting_scheduling {
            return Err(SchedulerError::invalid_argument(
                "jobs added with no trigger must be durable",
            ));
        }
        self.store.store_job(job, replace).await
    }

    /// True iff the job existed. Unschedules its triggers first.
    pub async fn delete_job(&self, key: &JobKey) -> Result<bool> {
        self.ensure_not_shutdown()?;
        let triggers = self.store.get_triggers_for_job(key).await?;
        let removed = self.store.remove_job(key).await?;
        if removed {
            for t in &triggers {
                self.bus.notify_job_unscheduled(&t.key).await;
            }
        }
        Ok(removed)
    }

    /// True iff the trigger existed; unknown keys are not an error.
    pub async fn unschedule_job(&self, key: &TriggerKey) -> Result<bool> {
        self.ensure_not_shutdown()?;
        let removed = self.store.remove_trigger(key).await?;
        if removed {
            self.signaler.signal_scheduling_change(0);
            self.bus.notify_job_unscheduled(key).await;
        }
        Ok(removed)
    }

    /// Replace a trigger with a new one for the same job. `None` when the
    /// old trigger does not exist.
    pub async fn reschedule_job(
        &self,
        key: &TriggerKey,
        new_trigger: Trigger,
    ) -> Result<Option<u64>> {
        self.ensure_not_shutdown()?;
        new_trigger.validate()?;
        let calendar = self.resolve_calendar(&new_trigger).await?;
        let mut new_trigger = new_trigger;
        let first_fire = new_trigger
            .compute_first_fire(calendar.as_ref())?
            .ok_or_else(|| {
                SchedulerError::invalid_argument(format!(
                    "trigger '{}' will never fire",
                    new_trigger.key
                ))
            })?;
        if !self.store.replace_trigger(key, new_trigger.clone()).await? {
            return Ok(None);
        }
        self.signaler.signal_scheduling_change(first_fire);
        self.bus.notify_job_unscheduled(key).await;
        self.bus.notify_job_scheduled(&new_trigger).await;
        Ok(Some(first_fire))
    }

    /// Fire a stored job once, now, bypassing the normal trigger path.
    pub async fn trigger_job(&self, key: &JobKey, data: Option<JobDataMap>) -> Result<()> {
        self.ensure_not_shutdown()?;
        if self.store.retrieve_job(key).await?.is_none() {
            return Err(SchedulerError::not_found(format!("job '{key}'")));
        }
        let now = self.clock.now_ms();
        let trigger_key = TriggerKey::new(MANUAL_GROUP, format!("mt-{}", Uuid::new_v4()))?;
        let mut trigger = Trigger::new(trigger_key, key.clone(), now, Schedule::once())
            .with_data(data.unwrap_or_default());
        trigger.next_fire_at_ms = Some(now);
        self.store.store_trigger(trigger, false).await?;
        self.signaler.signal_scheduling_change(now);
        Ok(())
    }

    // ── Pause / resume ──────────────────────────────────────────────────

    pub async fn pause_trigger(&self, key: &TriggerKey) -> Result<()> {
        self.ensure_not_shutdown()?;
        self.store.pause_trigger(key).await?;
        self.bus.notify_trigger_paused(key).await;
        Ok(())
    }

    pub async fn pause_triggers(&self, matcher: &KeyMatcher) -> Result<Vec<String>> {
        self.ensure_not_shutdown()?;
        let groups = self.store.pause_triggers(matcher).await?;
        for group in &groups {
            self.bus.notify_triggers_paused(Some(group)).await;
        }
        Ok(groups)
    }

    pub async fn pause_job(&self, key: &JobKey) -> Result<()> {
        self.ensure_not_shutdown()?;
        self.store.pause_job(key).await?;
        self.bus.notify_job_paused(key).await;
        Ok(())
    }

    pub async fn pause_jobs(&self, matcher: &KeyMatcher) -> Result<Vec<String>> {
        self.ensure_not_shutdown()?;
        let groups = self.store.pause_jobs(matcher).await?;
        for group in &groups {
            self.bus.notify_jobs_paused(Some(group)).await;
        }
        Ok(groups)
    }

    pub async fn resume_trigger(&self, key: &TriggerKey) -> Result<()> {
        self.ensure_not_shutdown()?;
        self.store.resume_trigger(key).await?;
        self.bus.notify_trigger_resumed(key).await;
        Ok(())
    }

    pub async fn resume_triggers(&self, matcher: &KeyMatcher) -> Result<Vec<String>> {
        self.ensure_not_shutdown()?;
        let groups = self.store.resume_triggers(matcher).await?;
        for group in &groups {
            self.bus.notify_triggers_resumed(Some(group)).await;
        }
        Ok(groups)
    }

    pub async fn resume_job(&self, key: &JobKey) -> Result<()> {
        self.ensure_not_shutdown()?;
        self.store.resume_job(key).await?;
        self.bus.notify_job_resumed(key).await;
        Ok(())
    }

    pub async fn resume_jobs(&self, matcher: &KeyMatcher) -> Result<Vec<String>> {
        self.ensure_not_shutdown()?;
        let groups = self.store.resume_jobs(matcher).await?;
        for group in &groups {
            self.bus.notify_jobs_resumed(Some(group)).await;
        }
        Ok(groups)
    }

    pub async fn pause_all(&self) -> Result<()> {
        self.ensure_not_shutdown()?;
        self.store.pause_all().await?;
        self.bus.notify_triggers_paused(None).await;
        Ok(())
    }

    pub async fn resume_all(&self) -> Result<()> {
        self.ensure_not_shutdown()?;
        self.store.resume_all().await?;
        self.bus.notify_triggers_resumed(None).await;
        Ok(())
    }

    /// Remove all jobs, triggers, and calendars.
    pub async fn clear(&self) -> Result<()> {
        self.ensure_not_shutdown()?;
        self.store.clear_all_scheduling_data().await?;
        self.bus.notify_scheduling_data_cleared().await;
        Ok(())
    }

    // ── Introspection ───────────────────────────────────────────────────

    #[must_use]
    pub fn get_currently_executing_jobs(&self) -> Vec<ExecutingJobSummary> {
        self.registry.snapshot()
    }

    /// Best-effort: flags every running execution of the job. Returns true
    /// iff at least one execution was flagged.
    pub fn interrupt(&self, key: &JobKey) -> Result<bool> {
        self.ensure_not_shutdown()?;
        Ok(self.registry.interrupt_job(key))
    }

    pub fn interrupt_instance(&self, fire_instance_id: &str) -> Result<bool> {
        self.ensure_not_shutdown()?;
        Ok(self.registry.interrupt_instance(fire_instance_id))
    }

    pub async fn check_job_exists(&self, key: &JobKey) -> Result<bool> {
        self.store.check_job_exists(key).await
    }

    pub async fn check_trigger_exists(&self, key: &TriggerKey) -> Result<bool> {
        self.store.check_trigger_exists(key).await
    }

    pub async fn get_job_detail(&self, key: &JobKey) -> Result<Option<JobDetail>> {
        self.store.retrieve_job(key).await
    }

    pub async fn get_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>> {
        self.store.retrieve_trigger(key).await
    }

    pub async fn get_trigger_state(&self, key: &TriggerKey) -> Result<Option<TriggerState>> {
        self.store.get_trigger_state(key).await
    }

    pub async fn reset_trigger_from_error_state(&self, key: &TriggerKey) -> Result<()> {
        self.ensure_not_shutdown()?;
        self.store.reset_trigger_from_error_state(key).await
    }

    pub async fn get_job_keys(&self, matcher: &KeyMatcher) -> Result<Vec<JobKey>> {
        self.store.get_job_keys(matcher).await
    }

    pub async fn get_trigger_keys(&self, matcher: &KeyMatcher) -> Result<Vec<TriggerKey>> {
        self.store.get_trigger_keys(matcher).await
    }

    pub async fn get_job_group_names(&self) -> Result<Vec<String>> {
        self.store.get_job_group_names().await
    }

    pub async fn get_trigger_group_names(&self) -> Result<Vec<String>> {
        self.store.get_trigger_group_names().await
    }

    pub async fn get_paused_trigger_groups(&self) -> Result<HashSet<String>> {
        Ok(self
            .store
            .get_paused_trigger_groups()
            .await?
            .into_iter()
            .collect())
    }

    pub async fn get_triggers_of_job(&self, key: &JobKey) -> Result<Vec<Trigger>> {
        self.store.get_triggers_for_job(key).await
    }

    // ── Calendars ───────────────────────────────────────────────────────

    pub async fn add_calendar(
        &self,
        name: &str,
        calendar: Calendar,
        replace: bool,
        update_triggers: bool,
    ) -> Result<()> {
        self.ensure_not_shutdown()?;
        self.store
            .store_calendar(name, calendar, replace, update_triggers)
            .await
    }

    pub async fn delete_calendar(&self, name: &str) -> Result<bool> {
        self.ensure_not_shutdown()?;
        self.store.remove_calendar(name).await
    }

    pub async fn get_calendar(&self, name: &str) -> Result<Option<Calendar>> {
        self.store.retrieve_calendar(name).await
    }

    pub async fn get_calendar_names(&self) -> Result<Vec<String>> {
        self.store.get_calendar_names().await
    }
}

/// Wires a [`Scheduler`] from configuration and optional overrides, runs
/// store recovery, and registers the instance.
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    store: Option<Arc<dyn JobStore>>,
    pool: Option<Arc<dyn WorkerPool>>,
    factory: Option<Arc<dyn JobFactory>>,
    clock: Option<SharedClock>,
}

impl SchedulerBuilder {
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            store: None,
            pool: None,
            factory: None,
            clock: None,
        }
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_pool(mut self, pool: Arc<dyn WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    #[must_use]
    pub fn with_job_factory(mut self, factory: Arc<dyn JobFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub async fn build(self) -> Result<Arc<Scheduler>> {
        self.config.validate()?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let store: Arc<dyn JobStore> = match self.store {
            Some(store) => store,
            None => match &self.config.store {
                StoreConfig::Memory => Arc::new(
                    MemoryStore::with_clock(Arc::clone(&clock))
                        .with_misfire_threshold(self.config.misfire_threshold_ms),
                ),
                StoreConfig::Sqlite { url } => Arc::new(
                    SqliteStore::new(url)
                        .await?
                        .with_clock(Arc::clone(&clock))
                        .with_misfire_threshold(self.config.misfire_threshold_ms)
                        .with_instance_id(self.config.effective_instance_id()),
                ),
            },
        };
        let pool: Arc<dyn WorkerPool> = match self.pool {
            Some(pool) => pool,
            None if self.config.thread_count == 0 => Arc::new(ZeroSizeWorkerPool),
            None => Arc::new(FixedWorkerPool::new(self.config.thread_count)),
        };
        let factory: Arc<dyn JobFactory> = self
            .factory
            .unwrap_or_else(|| Arc::new(RegistryJobFactory::new()));

        let bus = Arc::new(ListenerBus::new());
        let signaler = Signaler::new();
        store.initialize(signaler.clone(), Arc::clone(&bus)).await?;

        let scheduler = Arc::new(Scheduler {
            name: self.config.instance_name.clone(),
            instance_id: self.config.effective_instance_id(),
            config: self.config,
            store,
            pool,
            bus,
            signaler,
            clock,
            factory: Arc::new(RwLock::new(factory)),
            registry: Arc::new(ExecutingRegistry::new()),
            lifecycle: Mutex::new(Lifecycle {
                phase: Phase::Created,
                dispatcher: None,
            }),
        });
        SchedulerRepository::bind(Arc::clone(&scheduler))?;
        Ok(scheduler)
    }
}

/// Process-wide registry of live schedulers, keyed by name. Keeps instances
/// reachable for lookup and enforces name uniqueness; `shutdown` removes
/// the entry.
pub struct SchedulerRepository;

static INSTANCES: OnceLock<Mutex<HashMap<String, Arc<Scheduler>>>> = OnceLock::new();

impl SchedulerRepository {
    fn registry() -> &'static Mutex<HashMap<String, Arc<Scheduler>>> {
        INSTANCES.get_or_init(|| Mutex::new(HashMap::new()))
    }

    pub fn bind(scheduler: Arc<Scheduler>) -> Result<()> {
        let mut instances = Self::registry().lock().unwrap_or_else(|e| e.into_inner());
        if instances.contains_key(scheduler.name()) {
            return Err(SchedulerError::already_exists(format!(
                "scheduler '{}'",
                scheduler.name()
            )));
        }
        instances.insert(scheduler.name().to_string(), scheduler);
        Ok(())
    }

    #[must_use]
    pub fn lookup(name: &str) -> Option<Arc<Scheduler>> {
        Self::registry()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn remove(name: &str) -> bool {
        Self::registry()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some()
    }

    #[must_use]
    pub fn instance_names() -> Vec<String> {
        Self::registry()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}
