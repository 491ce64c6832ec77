//! `belfry-core` — the scheduler core: job and trigger model, pluggable job
//! stores, the dispatcher loop, worker pool, and run shell.
//!
//! # Overview
//!
//! Jobs and triggers are identified by `(group, name)` pairs and persisted
//! in a [`store::JobStore`] (in-memory reference implementation and a
//! SQLite-backed one). A single dispatcher task acquires due triggers from
//! the store, waits out their fire times (replanning early when a
//! sufficiently-earlier trigger arrives), commits the fires, and hands the
//! resulting bundles to a fixed worker pool. The run shell executes each
//! bundle, drives listeners in order, and reports completion back to the
//! store.
//!
//! ```ignore
//! let scheduler = SchedulerBuilder::new(SchedulerConfig::default())
//!     .with_job_factory(factory)
//!     .build()
//!     .await?;
//! scheduler.start().await?;
//! let job = JobDetail::new(JobKey::of("report")?, "jobs.NightlyReport").durable(true);
//! let trigger = Trigger::new(
//!     TriggerKey::of("nightly")?,
//!     job.key.clone(),
//!     now_ms,
//!     Schedule::cron("0 0 3 * * ?"),
//! );
//! scheduler.schedule_job(job, trigger).await?;
//! ```

pub mod calendar;
pub mod clock;
pub mod config;
mod dispatch;
pub mod error;
pub mod job;
pub mod key;
pub mod listener;
pub mod pool;
pub mod scheduler;
pub mod shell;
pub mod signal;
pub mod store;
pub mod store_memory;
pub mod store_sqlite;
pub mod trigger;

pub use {
    calendar::Calendar,
    clock::{Clock, ManualClock, SharedClock, SystemClock},
    config::{SchedulerConfig, StoreConfig},
    error::{Result, SchedulerError},
    job::{Job, JobDataMap, JobDetail, JobExecutionContext, JobExecutionError, JobFactory,
        RegistryJobFactory},
    key::{DEFAULT_GROUP, JobKey, KeyMatcher, TriggerKey},
    listener::{JobListener, ListenerBus, SchedulerListener, TriggerListener},
    pool::{FixedWorkerPool, WorkerPool, ZeroSizeWorkerPool},
    scheduler::{Scheduler, SchedulerBuilder, SchedulerRepository},
    shell::{ExecutingJobSummary, ExecutingRegistry},
    signal::Signaler,
    store::{CompletionInstruction, JobStore, TriggerFiredBundle},
    store_memory::MemoryStore,
    store_sqlite::SqliteStore,
    trigger::{CronMisfire, IntervalMisfire, IntervalUnit, Schedule, SimpleMisfire, Trigger,
        TriggerState},
};

/// Run database migrations for the SQLite store.
///
/// Creates the scheduling tables. Call at application startup when using
/// [`SqliteStore::with_pool`]; [`SqliteStore::new`] runs them itself.
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}
