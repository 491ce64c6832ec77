//! The job run shell: executes one fired bundle on a worker, drives the
//! listener callbacks in order, and reports completion to the store.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::{debug, error, info, warn};

use crate::{
    clock::SharedClock,
    error::Result,
    job::{Job, JobExecutionContext, JobFactory},
    key::{JobKey, TriggerKey},
    listener::ListenerBus,
    store::{CompletionInstruction, JobStore, TriggerFiredBundle},
};

/// Snapshot of one in-flight execution.
#[derive(Debug, Clone)]
pub struct ExecutingJobSummary {
    pub fire_instance_id: String,
    pub job_key: JobKey,
    pub trigger_key: TriggerKey,
    pub job_class: String,
    pub fire_at_ms: u64,
    pub recovering: bool,
}

struct ExecutingEntry {
    summary: ExecutingJobSummary,
    interrupt: Arc<AtomicBool>,
}

/// Currently-executing jobs, keyed by fire instance id. Backs
/// `get_currently_executing_jobs` and best-effort interruption.
#[derive(Default)]
pub struct ExecutingRegistry {
    entries: Mutex<HashMap<String, ExecutingEntry>>,
}

impl ExecutingRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, bundle: &TriggerFiredBundle) -> Arc<AtomicBool> {
        let interrupt = Arc::new(AtomicBool::new(false));
        let entry = ExecutingEntry {
            summary: ExecutingJobSummary {
                fire_instance_id: bundle.fire_instance_id.clone(),
                job_key: bundle.job.key.clone(),
                trigger_key: bundle.trigger.key.clone(),
                job_class: bundle.job.job_class.clone(),
                fire_at_ms: bundle.fire_at_ms,
                recovering: bundle.recovering,
            },
            interrupt: Arc::clone(&interrupt),
        };
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(bundle.fire_instance_id.clone(), entry);
        interrupt
    }

    fn unregister(&self, fire_instance_id: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(fire_instance_id);
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<ExecutingJobSummary> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|e| e.summary.clone())
            .collect()
    }

    /// Flag every running execution of the job. Returns true if any was
    /// flagged; the jobs themselves decide whether to poll the flag.
    pub fn interrupt_job(&self, key: &JobKey) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut any = false;
        for entry in entries.values() {
            if entry.summary.job_key == *key {
                entry.interrupt.store(true, Ordering::SeqCst);
                any = true;
            }
        }
        any
    }

    pub fn interrupt_instance(&self, fire_instance_id: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(fire_instance_id) {
            Some(entry) => {
                entry.interrupt.store(true, Ordering::SeqCst);
                true
            },
            None => false,
        }
    }
}

/// Runs exactly one fired bundle. Constructed on the dispatcher (so factory
/// failures surface there), then handed to a pool worker.
pub(crate) struct JobRunShell {
    scheduler_name: String,
    store: Arc<dyn JobStore>,
    bus: Arc<ListenerBus>,
    registry: Arc<ExecutingRegistry>,
    clock: SharedClock,
    job: Box<dyn Job>,
    bundle: TriggerFiredBundle,
}

impl JobRunShell {
    /// Resolve the job instance; an unknown job class fails here, before
    /// any worker is consumed.
    pub fn initialize(
        scheduler_name: String,
        store: Arc<dyn JobStore>,
        bus: Arc<ListenerBus>,
        registry: Arc<ExecutingRegistry>,
        clock: SharedClock,
        factory: &dyn JobFactory,
        bundle: TriggerFiredBundle,
    ) -> Result<Self> {
        let job = factory.new_job(&bundle)?;
        Ok(Self {
            scheduler_name,
            store,
            bus,
            registry,
            clock,
            job,
            bundle,
        })
    }

    /// Per-trigger event order is total: `trigger_fired`,
    /// `job_to_be_executed`, `job_was_executed`, `trigger_complete`, then
    /// the store's `triggered_job_complete` — across refires too.
    pub async fn run(self) {
        let interrupt = self.registry.register(&self.bundle);
        let trigger = self.bundle.trigger.clone();
        let mut refire_count = 0u32;

        loop {
            let mut ctx = JobExecutionContext::from_bundle(
                &self.scheduler_name,
                &self.bundle,
                refire_count,
                Arc::clone(&interrupt),
            );

            self.bus.notify_trigger_fired(&trigger, &ctx).await;
            if self.bus.collect_veto(&trigger, &ctx).await {
                info!(job = %ctx.job.key, trigger = %trigger.key, "job execution vetoed");
                self.bus.notify_job_execution_vetoed(&ctx).await;
                self.complete(&ctx, CompletionInstruction::Noop).await;
                break;
            }

            self.bus.notify_job_to_be_executed(&ctx).await;
            debug!(
                job = %ctx.job.key,
                trigger = %trigger.key,
                fire_instance = %ctx.fire_instance_id,
                refire_count,
                "executing job"
            );
            let started = self.clock.now_ms();
            let result = self.job.execute(&mut ctx).await;
            let duration_ms = self.clock.now_ms().saturating_sub(started);
            ctx.run_duration_ms = Some(duration_ms);

            let execution_error = result.err();
            match &execution_error {
                Some(e) => {
                    warn!(job = %ctx.job.key, error = %e, duration_ms, "job execution failed")
                },
                None => debug!(job = %ctx.job.key, duration_ms, "job execution finished"),
            }

            let instruction = ctx.trigger.execution_complete(execution_error.as_ref());
            self.bus
                .notify_job_was_executed(&ctx, execution_error.as_ref())
                .await;
            self.bus
                .notify_trigger_complete(&trigger, &ctx, instruction)
                .await;

            if instruction == CompletionInstruction::ReExecuteJob {
                // Refire on this same worker, without completing.
                refire_count += 1;
                continue;
            }
            self.complete(&ctx, instruction).await;
            break;
        }

        self.registry.unregister(&self.bundle.fire_instance_id);
    }

    async fn complete(&self, ctx: &JobExecutionContext, instruction: CompletionInstruction) {
        if let Err(e) = self
            .store
            .triggered_job_complete(&ctx.trigger, &ctx.job, instruction)
            .await
        {
            error!(trigger = %ctx.trigger.key, error = %e, "failed to report job completion to store");
            self.bus
                .notify_scheduler_error("failed to report job completion", &e)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        clock::SystemClock,
        error::SchedulerError,
        job::{JobDetail, JobExecutionError, RegistryJobFactory},
        listener::TriggerListener,
        signal::Signaler,
        store_memory::MemoryStore,
        trigger::{Schedule, Trigger, TriggerState},
    };

    struct CountingJob {
        runs: Arc<AtomicUsize>,
        fail_first_with_refire: bool,
    }

    #[async_trait]
    impl Job for CountingJob {
        async fn execute(
            &self,
            ctx: &mut JobExecutionContext,
        ) -> std::result::Result<(), JobExecutionError> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail_first_with_refire && run == 0 {
                assert_eq!(ctx.refire_count, 0);
                return Err(JobExecutionError::new("transient").refire_immediately());
            }
            Ok(())
        }
    }

    struct VetoListener;

    #[async_trait]
    impl TriggerListener for VetoListener {
        fn name(&self) -> &str {
            "veto-everything"
        }

        async fn veto_job_execution(
            &self,
            _trigger: &Trigger,
            _ctx: &JobExecutionContext,
        ) -> Result<bool> {
            Ok(true)
        }
    }

    async fn fire_bundle(store: &MemoryStore) -> TriggerFiredBundle {
        let job = JobDetail::new(JobKey::of("j1").unwrap(), "counting").durable(true);
        store.store_job(job, false).await.unwrap();
        let mut t = Trigger::new(
            TriggerKey::of("t1").unwrap(),
            JobKey::of("j1").unwrap(),
            0,
            Schedule::once(),
        );
        t.compute_first_fire(None).unwrap();
        store.store_trigger(t, false).await.unwrap();
        let acquired = store.acquire_next_triggers(10_000, 1, 0).await.unwrap();
        store.triggers_fired(&acquired).await.unwrap()[0]
            .clone()
            .expect("bundle")
    }

    fn shell_for(
        store: Arc<MemoryStore>,
        bus: Arc<ListenerBus>,
        runs: Arc<AtomicUsize>,
        fail_first_with_refire: bool,
        bundle: TriggerFiredBundle,
    ) -> JobRunShell {
        let factory = RegistryJobFactory::new();
        let counter = Arc::clone(&runs);
        factory.register("counting", move || {
            Box::new(CountingJob {
                runs: Arc::clone(&counter),
                fail_first_with_refire,
            })
        });
        JobRunShell::initialize(
            "test-sched".into(),
            store,
            bus,
            Arc::new(ExecutingRegistry::new()),
            Arc::new(SystemClock),
            &factory,
            bundle,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_shell_executes_and_completes() {
        let store = Arc::new(MemoryStore::new());
        let bundle = fire_bundle(&store).await;
        let runs = Arc::new(AtomicUsize::new(0));
        let shell = shell_for(
            Arc::clone(&store),
            Arc::new(ListenerBus::new()),
            Arc::clone(&runs),
            false,
            bundle,
        );
        shell.run().await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        // One-shot trigger is deleted on completion; the durable job stays.
        assert!(
            !store
                .check_trigger_exists(&TriggerKey::of("t1").unwrap())
                .await
                .unwrap()
        );
        assert!(store.check_job_exists(&JobKey::of("j1").unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn test_shell_refires_immediately_on_request() {
        let store = Arc::new(MemoryStore::new());
        let bundle = fire_bundle(&store).await;
        let runs = Arc::new(AtomicUsize::new(0));
        let shell = shell_for(
            Arc::clone(&store),
            Arc::new(ListenerBus::new()),
            Arc::clone(&runs),
            true,
            bundle,
        );
        shell.run().await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shell_veto_skips_execution() {
        let store = Arc::new(MemoryStore::new());
        let bundle = fire_bundle(&store).await;
        let bus = Arc::new(ListenerBus::new());
        bus.add_trigger_listener(Arc::new(VetoListener), vec![]);
        let runs = Arc::new(AtomicUsize::new(0));
        let shell = shell_for(Arc::clone(&store), bus, Arc::clone(&runs), false, bundle);
        shell.run().await;

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        // Vetoed one-shot returns through Noop: exhausted, so complete.
        assert_eq!(
            store
                .get_trigger_state(&TriggerKey::of("t1").unwrap())
                .await
                .unwrap(),
            Some(TriggerState::Complete)
        );
    }

    #[tokio::test]
    async fn test_unknown_job_class_fails_initialize() {
        let store = Arc::new(MemoryStore::new());
        let bundle = fire_bundle(&store).await;
        let factory = RegistryJobFactory::new();
        let result = JobRunShell::initialize(
            "test-sched".into(),
            store,
            Arc::new(ListenerBus::new()),
            Arc::new(ExecutingRegistry::new()),
            Arc::new(SystemClock),
            &factory,
            bundle,
        );
        assert!(matches!(result, Err(SchedulerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_registry_interrupt_flags() {
        let registry = ExecutingRegistry::new();
        let store = MemoryStore::new();
        let bundle = fire_bundle(&store).await;
        let flag = registry.register(&bundle);

        assert_eq!(registry.snapshot().len(), 1);
        assert!(!flag.load(Ordering::SeqCst));
        assert!(registry.interrupt_job(&JobKey::of("j1").unwrap()));
        assert!(flag.load(Ordering::SeqCst));
        assert!(!registry.interrupt_job(&JobKey::of("other").unwrap()));
        assert!(registry.interrupt_instance(&bundle.fire_instance_id));

        registry.unregister(&bundle.fire_instance_id);
        assert!(registry.snapshot().is_empty());
        assert!(!registry.interrupt_instance(&bundle.fire_instance_id));
    }

    #[tokio::test]
    async fn test_shell_uses_signaler_free_store() {
        // A store with no hooks installed must still complete cleanly.
        let store = Arc::new(MemoryStore::new());
        store
            .initialize(Signaler::new(), Arc::new(ListenerBus::new()))
            .await
            .unwrap();
        let bundle = fire_bundle(&store).await;
        let runs = Arc::new(AtomicUsize::new(0));
        let shell = shell_for(
            Arc::clone(&store),
            Arc::new(ListenerBus::new()),
            Arc::clone(&runs),
            false,
            bundle,
        );
        shell.run().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
