//! The dispatcher: a single long-running task that acquires due triggers,
//! waits out their fire times, and hands fired bundles to the worker pool.

use std::{sync::Arc, time::Duration};

use {
    rand::Rng,
    tracing::{debug, error, info},
};

use crate::{
    clock::SharedClock,
    job::JobFactory,
    listener::ListenerBus,
    pool::WorkerPool,
    shell::{ExecutingRegistry, JobRunShell},
    signal::Signaler,
    store::{CompletionInstruction, JobStore},
    trigger::Trigger,
};

/// Bounds on the store-suggested retry delay after acquisition failures.
const MIN_RETRY_DELAY_MS: u64 = 20;
const MAX_RETRY_DELAY_MS: u64 = 600_000;

/// A trigger within this many milliseconds of its fire time is "due now".
const FIRE_SLACK_MS: u64 = 2;

/// Abandoning an acquired batch means store round-trips; it is only worth
/// doing when the acquired fire time is at least this far away. The store
/// knows best, but the contract exposes no per-store cost, so these are
/// educated constants.
const PERSISTENT_COST_THRESHOLD_MS: u64 = 70;
const MEMORY_COST_THRESHOLD_MS: u64 = 7;

pub(crate) struct Dispatcher {
    pub scheduler_name: String,
    pub store: Arc<dyn JobStore>,
    pub pool: Arc<dyn WorkerPool>,
    pub bus: Arc<ListenerBus>,
    pub signaler: Signaler,
    pub registry: Arc<ExecutingRegistry>,
    pub factory: Arc<std::sync::RwLock<Arc<dyn JobFactory>>>,
    pub clock: SharedClock,
    pub idle_wait_ms: u64,
    pub batch_max_count: usize,
    pub batch_time_window_ms: u64,
}

impl Dispatcher {
    pub async fn run(self) {
        info!(scheduler = %self.scheduler_name, "dispatcher started");
        let mut acquires_failed: u32 = 0;

        'main: while !self.signaler.is_halted() {
            // Standby gate: wake once a second in case a notify was missed.
            while self.signaler.is_paused() && !self.signaler.is_halted() {
                self.signaler.wait_signaled(Duration::from_secs(1)).await;
                acquires_failed = 0;
            }
            if self.signaler.is_halted() {
                break;
            }

            // Back off while the store is failing.
            if acquires_failed > 1 {
                let delay = self
                    .store
                    .acquire_retry_delay_ms(acquires_failed)
                    .clamp(MIN_RETRY_DELAY_MS, MAX_RETRY_DELAY_MS);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            let available = match self.pool.block_for_available_workers().await {
                Ok(n) if n > 0 => n,
                Ok(_) => continue, // pool shutting down; halted soon
                Err(e) => {
                    error!(error = %e, "worker pool cannot supply workers; dispatcher exiting");
                    break;
                },
            };

            let now = self.clock.now_ms();
            self.signaler.clear_signaled();
            let mut batch = match self
                .store
                .acquire_next_triggers(
                    now + self.idle_wait_ms,
                    available.min(self.batch_max_count),
                    self.batch_time_window_ms,
                )
                .await
            {
                Ok(batch) => {
                    acquires_failed = 0;
                    batch
                },
                Err(e) => {
                    if acquires_failed == 0 {
                        error!(error = %e, "failed to scan for next triggers to fire");
                        self.bus
                            .notify_scheduler_error("failed to scan for next triggers to fire", &e)
                            .await;
                    }
                    acquires_failed = acquires_failed.saturating_add(1);
                    continue;
                },
            };

            if batch.is_empty() {
                // Randomized idle so a fleet of schedulers doesn't thunder
                // at the store in lockstep.
                let variance = (self.idle_wait_ms / 5).max(1);
                let idle = self.idle_wait_ms - rand::thread_rng().gen_range(0..variance);
                if !self.signaler.is_signaled() {
                    self.signaler.wait_signaled(Duration::from_millis(idle)).await;
                }
                continue;
            }

            debug!(count = batch.len(), "acquired trigger batch");
            let first_fire = batch[0].next_fire_at_ms.unwrap_or(now);

            // Wait until the first trigger is due, replanning early if a
            // sufficiently-earlier trigger arrives in the meantime.
            loop {
                if self.signaler.is_halted() {
                    self.release_all(&batch).await;
                    break 'main;
                }
                let until = first_fire.saturating_sub(self.clock.now_ms());
                if until <= FIRE_SLACK_MS {
                    break;
                }
                if !self.candidate_earlier_within_reason(first_fire, false) {
                    self.signaler
                        .wait_signaled(Duration::from_millis(until))
                        .await;
                }
                if self.candidate_earlier_within_reason(first_fire, true) {
                    debug!("abandoning acquired batch for an earlier trigger");
                    self.release_all(&batch).await;
                    batch.clear();
                    break;
                }
            }
            if batch.is_empty() {
                continue;
            }
            if self.signaler.is_halted() {
                self.release_all(&batch).await;
                break;
            }

            let results = match self.store.triggers_fired(&batch).await {
                Ok(results) => results,
                Err(e) => {
                    error!(error = %e, "failed to fire acquired triggers");
                    self.bus
                        .notify_scheduler_error("failed to fire acquired triggers", &e)
                        .await;
                    self.release_all(&batch).await;
                    continue;
                },
            };

            for (trigger, result) in batch.iter().zip(results) {
                let Some(bundle) = result else {
                    // Paused, removed, or blocked since acquisition.
                    if let Err(e) = self.store.release_acquired_trigger(trigger).await {
                        error!(trigger = %trigger.key, error = %e, "failed to release trigger");
                    }
                    continue;
                };

                let factory = self
                    .factory
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                let job = bundle.job.clone();
                match JobRunShell::initialize(
                    self.scheduler_name.clone(),
                    Arc::clone(&self.store),
                    Arc::clone(&self.bus),
                    Arc::clone(&self.registry),
                    Arc::clone(&self.clock),
                    factory.as_ref(),
                    bundle,
                ) {
                    Ok(shell) => {
                        let submitted = self.pool.run(Box::pin(shell.run())).await;
                        if !matches!(submitted, Ok(true)) {
                            error!(trigger = %trigger.key, "worker pool rejected job run shell");
                            self.complete_errored(trigger, &job).await;
                        }
                    },
                    Err(e) => {
                        error!(trigger = %trigger.key, error = %e, "failed to build job run shell");
                        self.complete_errored(trigger, &job).await;
                    },
                }
            }
        }
        info!(scheduler = %self.scheduler_name, "dispatcher halted");
    }

    async fn release_all(&self, batch: &[Trigger]) {
        for trigger in batch {
            if let Err(e) = self.store.release_acquired_trigger(trigger).await {
                error!(trigger = %trigger.key, error = %e, "failed to release trigger");
            }
        }
    }

    async fn complete_errored(&self, trigger: &Trigger, job: &crate::job::JobDetail) {
        if let Err(e) = self
            .store
            .triggered_job_complete(trigger, job, CompletionInstruction::SetAllJobTriggersError)
            .await
        {
            error!(trigger = %trigger.key, error = %e, "failed to record errored execution");
        }
    }

    /// Is the pending schedule-change signal worth abandoning an acquired
    /// batch for? Only when the candidate is earlier than what we hold and
    /// the held fire time is far enough away to pay for the store
    /// round-trips.
    fn candidate_earlier_within_reason(&self, old_time_ms: u64, clear: bool) -> bool {
        let Some(candidate) = self.signaler.signal_snapshot(clear) else {
            return false;
        };
        let earlier = candidate == 0 || candidate < old_time_ms;
        if !earlier {
            return false;
        }
        let cost_threshold = if self.store.supports_persistence() {
            PERSISTENT_COST_THRESHOLD_MS
        } else {
            MEMORY_COST_THRESHOLD_MS
        };
        old_time_ms.saturating_sub(self.clock.now_ms()) >= cost_threshold
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::{
        clock::{Clock, SystemClock},
        job::{Job, JobDetail, JobExecutionContext, JobExecutionError, RegistryJobFactory},
        key::{JobKey, TriggerKey},
        pool::FixedWorkerPool,
        store_memory::MemoryStore,
        trigger::{Schedule, Trigger},
    };

    struct CountingJob(Arc<AtomicUsize>);

    #[async_trait]
    impl Job for CountingJob {
        async fn execute(
            &self,
            _ctx: &mut JobExecutionContext,
        ) -> std::result::Result<(), JobExecutionError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        pool: FixedWorkerPool,
        signaler: Signaler,
        runs: Arc<AtomicUsize>,
        handle: tokio::task::JoinHandle<()>,
    }

    async fn start_dispatcher() -> Fixture {
        let store = Arc::new(MemoryStore::new().with_misfire_threshold(60_000));
        let pool = FixedWorkerPool::new(2);
        let bus = Arc::new(ListenerBus::new());
        let signaler = Signaler::new();
        store
            .initialize(signaler.clone(), Arc::clone(&bus))
            .await
            .unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        let factory = RegistryJobFactory::new();
        let counter = Arc::clone(&runs);
        factory.register("counting", move || Box::new(CountingJob(Arc::clone(&counter))));

        let dispatcher = Dispatcher {
            scheduler_name: "test-sched".into(),
            store: store.clone(),
            pool: Arc::new(pool.clone()),
            bus,
            signaler: signaler.clone(),
            registry: Arc::new(ExecutingRegistry::new()),
            factory: Arc::new(std::sync::RwLock::new(Arc::new(factory))),
            clock: Arc::new(SystemClock),
            idle_wait_ms: 5_000,
            batch_max_count: 1,
            batch_time_window_ms: 0,
        };
        let handle = tokio::spawn(dispatcher.run());
        Fixture {
            store,
            pool,
            signaler,
            runs,
            handle,
        }
    }

    async fn schedule_counting_job(store: &MemoryStore, repeat: i32, interval_ms: u64) {
        let job = JobDetail::new(JobKey::of("j1").unwrap(), "counting").durable(true);
        store.store_job(job, false).await.unwrap();
        let mut t = Trigger::new(
            TriggerKey::of("t1").unwrap(),
            JobKey::of("j1").unwrap(),
            SystemClock.now_ms(),
            Schedule::simple(repeat, interval_ms),
        );
        t.compute_first_fire(None).unwrap();
        store.store_trigger(t, false).await.unwrap();
    }

    async fn wait_for_runs(runs: &AtomicUsize, at_least: usize) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while runs.load(Ordering::SeqCst) < at_least {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("jobs should have run in time");
    }

    #[tokio::test]
    async fn test_dispatcher_fires_scheduled_triggers() {
        let fx = start_dispatcher().await;
        schedule_counting_job(&fx.store, 2, 40).await;
        fx.signaler.set_paused(false);
        fx.signaler.signal_scheduling_change(0);

        wait_for_runs(&fx.runs, 3).await;

        fx.signaler.halt();
        let _ = tokio::time::timeout(Duration::from_secs(5), fx.handle).await;
        fx.pool.shutdown(true).await;
        assert_eq!(fx.runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_dispatcher_standby_stops_firing() {
        let fx = start_dispatcher().await;
        fx.signaler.set_paused(false);
        fx.signaler.signal_scheduling_change(0);
        // Give the loop a moment to reach its idle wait, then pause and
        // schedule; nothing should fire while paused.
        tokio::time::sleep(Duration::from_millis(50)).await;
        fx.signaler.set_paused(true);
        schedule_counting_job(&fx.store, 0, 0).await;
        fx.signaler.signal_scheduling_change(0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fx.runs.load(Ordering::SeqCst), 0);

        // Unpausing lets it through.
        fx.signaler.set_paused(false);
        wait_for_runs(&fx.runs, 1).await;
        fx.signaler.halt();
        let _ = tokio::time::timeout(Duration::from_secs(5), fx.handle).await;
        fx.pool.shutdown(true).await;
    }

    #[tokio::test]
    async fn test_dispatcher_wakes_for_new_earlier_trigger() {
        let fx = start_dispatcher().await;
        fx.signaler.set_paused(false);
        // Loop is idling with an empty store; a new immediate trigger plus
        // a signal must fire well before the idle wait elapses.
        tokio::time::sleep(Duration::from_millis(50)).await;
        schedule_counting_job(&fx.store, 0, 0).await;
        fx.signaler.signal_scheduling_change(SystemClock.now_ms());

        wait_for_runs(&fx.runs, 1).await;
        fx.signaler.halt();
        let _ = tokio::time::timeout(Duration::from_secs(5), fx.handle).await;
        fx.pool.shutdown(true).await;
    }
}
