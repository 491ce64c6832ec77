//! End-to-end scenarios through the public façade: a real dispatcher, a
//! real worker pool, and real stores.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use {async_trait::async_trait, tempfile::TempDir, uuid::Uuid};

use belfry_core::{
    Clock, CompletionInstruction, Job, JobDetail, JobExecutionContext, JobExecutionError,
    JobKey, JobListener, KeyMatcher, RegistryJobFactory, Result, Schedule, SchedulerBuilder,
    SchedulerConfig, StoreConfig, SystemClock, Trigger, TriggerKey, TriggerListener,
};

fn unique_config() -> SchedulerConfig {
    SchedulerConfig {
        instance_name: format!("e2e-{}", Uuid::new_v4()),
        thread_count: 4,
        idle_wait_ms: 2_000,
        ..SchedulerConfig::default()
    }
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

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

#[tokio::test]
async fn test_simple_repeat_runs_to_completion() {
    let runs = Arc::new(AtomicUsize::new(0));
    let factory = RegistryJobFactory::new();
    let counter = Arc::clone(&runs);
    factory.register("counting", move || Box::new(CountingJob(Arc::clone(&counter))));

    let scheduler = SchedulerBuilder::new(unique_config())
        .with_job_factory(Arc::new(factory))
        .build()
        .await
        .unwrap();
    scheduler.start().await.unwrap();

    let job = JobDetail::new(JobKey::of("repeat").unwrap(), "counting").durable(true);
    let trigger = Trigger::new(
        TriggerKey::of("every-40ms").unwrap(),
        job.key.clone(),
        SystemClock.now_ms(),
        Schedule::simple(2, 40),
    );
    scheduler.schedule_job(job, trigger).await.unwrap();

    wait_until("three fires", || runs.load(Ordering::SeqCst) >= 3).await;
    // Exhausted trigger is deleted; the durable job survives.
    tokio::time::timeout(Duration::from_secs(10), async {
        while scheduler
            .check_trigger_exists(&TriggerKey::of("every-40ms").unwrap())
            .await
            .unwrap()
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("exhausted trigger should be removed");
    assert!(
        scheduler
            .check_job_exists(&JobKey::of("repeat").unwrap())
            .await
            .unwrap()
    );

    scheduler.shutdown(true).await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 3);
}

struct GaugeJob {
    current: Arc<AtomicUsize>,
    max_seen: Arc<AtomicUsize>,
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl Job for GaugeJob {
    async fn execute(
        &self,
        _ctx: &mut JobExecutionContext,
    ) -> std::result::Result<(), JobExecutionError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(120)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disallow_concurrent_executions_never_overlap() {
    let current = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let runs = Arc::new(AtomicUsize::new(0));

    let factory = RegistryJobFactory::new();
    let (c, m, r) = (Arc::clone(&current), Arc::clone(&max_seen), Arc::clone(&runs));
    factory.register("gauge", move || {
        Box::new(GaugeJob {
            current: Arc::clone(&c),
            max_seen: Arc::clone(&m),
            runs: Arc::clone(&r),
        })
    });

    let scheduler = SchedulerBuilder::new(unique_config())
        .with_job_factory(Arc::new(factory))
        .build()
        .await
        .unwrap();
    scheduler.start().await.unwrap();

    let job = JobDetail::new(JobKey::of("serial").unwrap(), "gauge")
        .durable(true)
        .disallow_concurrent_execution(true);
    let now = SystemClock.now_ms();
    let t1 = Trigger::new(
        TriggerKey::of("t1").unwrap(),
        job.key.clone(),
        now,
        Schedule::once(),
    );
    let t2 = Trigger::new(
        TriggerKey::of("t2").unwrap(),
        job.key.clone(),
        now,
        Schedule::once(),
    );
    scheduler.schedule_job(job, t1).await.unwrap();
    scheduler.schedule_trigger(t2).await.unwrap();

    wait_until("both executions", || runs.load(Ordering::SeqCst) >= 2).await;
    scheduler.shutdown(true).await.unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(
        max_seen.load(Ordering::SeqCst),
        1,
        "executions of a disallow-concurrent job overlapped"
    );
}

#[derive(Default)]
struct EventLog(Mutex<Vec<String>>);

impl EventLog {
    fn push(&self, event: &str) {
        self.0.lock().unwrap().push(event.to_string());
    }

    fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

struct RecordingListener(Arc<EventLog>);

#[async_trait]
impl TriggerListener for RecordingListener {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn trigger_fired(&self, _t: &Trigger, _c: &JobExecutionContext) -> Result<()> {
        self.0.push("trigger_fired");
        Ok(())
    }

    async fn trigger_complete(
        &self,
        _t: &Trigger,
        _c: &JobExecutionContext,
        _i: CompletionInstruction,
    ) -> Result<()> {
        self.0.push("trigger_complete");
        Ok(())
    }
}

#[async_trait]
impl JobListener for RecordingListener {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn job_to_be_executed(&self, _c: &JobExecutionContext) -> Result<()> {
        self.0.push("job_to_be_executed");
        Ok(())
    }

    async fn job_was_executed(
        &self,
        _c: &JobExecutionContext,
        _e: Option<&JobExecutionError>,
    ) -> Result<()> {
        self.0.push("job_was_executed");
        Ok(())
    }
}

#[tokio::test]
async fn test_listener_events_are_totally_ordered_per_trigger() {
    let runs = Arc::new(AtomicUsize::new(0));
    let factory = RegistryJobFactory::new();
    let counter = Arc::clone(&runs);
    factory.register("counting", move || Box::new(CountingJob(Arc::clone(&counter))));

    let scheduler = SchedulerBuilder::new(unique_config())
        .with_job_factory(Arc::new(factory))
        .build()
        .await
        .unwrap();
    let log = Arc::new(EventLog::default());
    let listener = Arc::new(RecordingListener(Arc::clone(&log)));
    scheduler
        .listeners()
        .add_trigger_listener(listener.clone(), vec![]);
    scheduler.listeners().add_job_listener(listener, vec![]);
    scheduler.start().await.unwrap();

    let job = JobDetail::new(JobKey::of("observed").unwrap(), "counting").durable(true);
    let trigger = Trigger::new(
        TriggerKey::of("once").unwrap(),
        job.key.clone(),
        SystemClock.now_ms(),
        Schedule::once(),
    );
    scheduler.schedule_job(job, trigger).await.unwrap();

    wait_until("execution", || runs.load(Ordering::SeqCst) >= 1).await;
    wait_until("all events", || log.events().len() >= 4).await;
    scheduler.shutdown(true).await.unwrap();

    assert_eq!(
        log.events(),
        vec![
            "trigger_fired",
            "job_to_be_executed",
            "job_was_executed",
            "trigger_complete",
        ]
    );
}

struct RecoveryProbe {
    observations: Arc<Mutex<Vec<(bool, Option<TriggerKey>)>>>,
    hang: bool,
}

#[async_trait]
impl Job for RecoveryProbe {
    async fn execute(
        &self,
        ctx: &mut JobExecutionContext,
    ) -> std::result::Result<(), JobExecutionError> {
        self.observations
            .lock()
            .unwrap()
            .push((ctx.recovering, ctx.recovering_trigger_key()));
        if self.hang {
            // Simulated wedge: the "process" dies before this returns.
            tokio::time::sleep(Duration::from_secs(600)).await;
        }
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_recovery_refires_job_lost_in_crash() {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("sched.db").display());
    let observations = Arc::new(Mutex::new(Vec::new()));

    // First life: the job wedges mid-execution and the process "dies"
    // (shutdown without waiting for jobs).
    {
        let factory = RegistryJobFactory::new();
        let obs = Arc::clone(&observations);
        factory.register("probe", move || {
            Box::new(RecoveryProbe {
                observations: Arc::clone(&obs),
                hang: true,
            })
        });
        let scheduler = SchedulerBuilder::new(SchedulerConfig {
            store: StoreConfig::Sqlite { url: url.clone() },
            ..unique_config()
        })
        .with_job_factory(Arc::new(factory))
        .build()
        .await
        .unwrap();
        scheduler.start().await.unwrap();

        let job = JobDetail::new(JobKey::of("critical").unwrap(), "probe")
            .durable(true)
            .requests_recovery(true);
        let trigger = Trigger::new(
            TriggerKey::of("orig").unwrap(),
            job.key.clone(),
            SystemClock.now_ms(),
            Schedule::once(),
        );
        scheduler.schedule_job(job, trigger).await.unwrap();

        let obs = Arc::clone(&observations);
        wait_until("first execution to start", move || !obs.lock().unwrap().is_empty()).await;
        scheduler.shutdown(false).await.unwrap();
    }

    // Second life: startup recovery re-fires the lost execution, flagged as
    // recovering and carrying the original trigger identity.
    let factory = RegistryJobFactory::new();
    let obs = Arc::clone(&observations);
    factory.register("probe", move || {
        Box::new(RecoveryProbe {
            observations: Arc::clone(&obs),
            hang: false,
        })
    });
    let scheduler = SchedulerBuilder::new(SchedulerConfig {
        store: StoreConfig::Sqlite { url },
        ..unique_config()
    })
    .with_job_factory(Arc::new(factory))
    .build()
    .await
    .unwrap();
    scheduler.start().await.unwrap();

    let obs = Arc::clone(&observations);
    wait_until("recovery execution", move || obs.lock().unwrap().len() >= 2).await;
    scheduler.shutdown(true).await.unwrap();

    let observations = observations.lock().unwrap();
    assert_eq!(observations[0], (false, None));
    assert_eq!(
        observations[1],
        (true, Some(TriggerKey::of("orig").unwrap()))
    );
    assert_eq!(observations.len(), 2, "recovery must fire exactly once");
}

#[tokio::test]
async fn test_pause_all_holds_fires_until_resume() {
    let runs = Arc::new(AtomicUsize::new(0));
    let factory = RegistryJobFactory::new();
    let counter = Arc::clone(&runs);
    factory.register("counting", move || Box::new(CountingJob(Arc::clone(&counter))));

    let scheduler = SchedulerBuilder::new(unique_config())
        .with_job_factory(Arc::new(factory))
        .build()
        .await
        .unwrap();
    scheduler.start().await.unwrap();
    scheduler.pause_all().await.unwrap();

    let job = JobDetail::new(JobKey::of("held").unwrap(), "counting").durable(true);
    let trigger = Trigger::new(
        TriggerKey::of("held-t").unwrap(),
        job.key.clone(),
        SystemClock.now_ms(),
        Schedule::once(),
    );
    scheduler.schedule_job(job, trigger).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 0, "paused trigger fired");

    scheduler
        .resume_triggers(&KeyMatcher::Everything)
        .await
        .unwrap();
    wait_until("fire after resume", || runs.load(Ordering::SeqCst) >= 1).await;
    scheduler.shutdown(true).await.unwrap();
}
