//! Job definitions, the executable `Job` trait, and the job factory.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    serde_json::Value,
    thiserror::Error,
};

use crate::{
    error::{Result, SchedulerError},
    key::{JobKey, TriggerKey},
    store::{RECOVERY_ORIG_TRIGGER_GROUP, RECOVERY_ORIG_TRIGGER_NAME, TriggerFiredBundle},
    trigger::Trigger,
};

/// String-keyed bag of serializable values attached to jobs and triggers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobDataMap(HashMap<String, Value>);

impl JobDataMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// This map with `overlay` merged on top; overlay entries win.
    #[must_use]
    pub fn merged_with(&self, overlay: &JobDataMap) -> JobDataMap {
        let mut out = self.clone();
        for (k, v) in &overlay.0 {
            out.0.insert(k.clone(), v.clone());
        }
        out
    }
}

/// A stored job definition. The `job_class` string is opaque to the
/// scheduler; the [`JobFactory`] resolves it to executable code at fire time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDetail {
    pub key: JobKey,
    pub job_class: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub data: JobDataMap,
    /// Retained even when no trigger references it.
    #[serde(default)]
    pub durable: bool,
    /// Re-fired on restart if it was executing at shutdown.
    #[serde(default)]
    pub requests_recovery: bool,
    /// The data map returned by the job replaces the stored one.
    #[serde(default)]
    pub persist_data_after_execution: bool,
    /// At most one execution per job identity at a time.
    #[serde(default)]
    pub disallow_concurrent_execution: bool,
}

impl JobDetail {
    #[must_use]
    pub fn new(key: JobKey, job_class: impl Into<String>) -> Self {
        Self {
            key,
            job_class: job_class.into(),
            description: None,
            data: JobDataMap::default(),
            durable: false,
            requests_recovery: false,
            persist_data_after_execution: false,
            disallow_concurrent_execution: false,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: JobDataMap) -> Self {
        self.data = data;
        self
    }

    #[must_use]
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    #[must_use]
    pub fn requests_recovery(mut self, requests_recovery: bool) -> Self {
        self.requests_recovery = requests_recovery;
        self
    }

    #[must_use]
    pub fn persist_data_after_execution(mut self, persist: bool) -> Self {
        self.persist_data_after_execution = persist;
        self
    }

    #[must_use]
    pub fn disallow_concurrent_execution(mut self, disallow: bool) -> Self {
        self.disallow_concurrent_execution = disallow;
        self
    }
}

/// Error returned by a job execution. The flags steer the completion
/// instruction the run shell derives from it.
#[derive(Debug, Clone, Default, Error)]
#[error("job execution failed: {message}")]
pub struct JobExecutionError {
    pub message: String,
    /// Run the same bundle again immediately, on the same worker.
    pub refire_immediately: bool,
    /// Mark the firing trigger complete so it never fires again.
    pub unschedule_firing_trigger: bool,
    /// Mark every trigger of this job complete.
    pub unschedule_all_triggers: bool,
}

impl JobExecutionError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn refire_immediately(mut self) -> Self {
        self.refire_immediately = true;
        self
    }

    #[must_use]
    pub fn unschedule_firing_trigger(mut self) -> Self {
        self.unschedule_firing_trigger = true;
        self
    }

    #[must_use]
    pub fn unschedule_all_triggers(mut self) -> Self {
        self.unschedule_all_triggers = true;
        self
    }
}

/// Everything one execution of a job can see and mutate.
///
/// Cross-references are carried by key and value, never by live handles, so
/// contexts serialize cleanly and never create reference cycles.
#[derive(Debug)]
pub struct JobExecutionContext {
    pub scheduler_name: String,
    pub job: JobDetail,
    pub trigger: Trigger,
    /// Job data merged with trigger data; trigger entries win.
    pub merged_data: JobDataMap,
    pub fire_instance_id: String,
    pub fire_at_ms: u64,
    pub scheduled_fire_at_ms: u64,
    pub previous_fire_at_ms: Option<u64>,
    pub next_fire_at_ms: Option<u64>,
    /// True when this execution replays a run lost in a crash.
    pub recovering: bool,
    pub refire_count: u32,
    /// Set by the run shell after the job returns.
    pub run_duration_ms: Option<u64>,
    /// Free-form result a job may leave for listeners.
    pub result: Option<Value>,
    interrupt_flag: Arc<AtomicBool>,
}

impl JobExecutionContext {
    pub(crate) fn from_bundle(
        scheduler_name: &str,
        bundle: &TriggerFiredBundle,
        refire_count: u32,
        interrupt_flag: Arc<AtomicBool>,
    ) -> Self {
        Self {
            scheduler_name: scheduler_name.to_string(),
            job: bundle.job.clone(),
            trigger: bundle.trigger.clone(),
            merged_data: bundle.job.data.merged_with(&bundle.trigger.data),
            fire_instance_id: bundle.fire_instance_id.clone(),
            fire_at_ms: bundle.fire_at_ms,
            scheduled_fire_at_ms: bundle.scheduled_fire_at_ms,
            previous_fire_at_ms: bundle.previous_fire_at_ms,
            next_fire_at_ms: bundle.next_fire_at_ms,
            recovering: bundle.recovering,
            refire_count,
            run_duration_ms: None,
            result: None,
            interrupt_flag,
        }
    }

    /// Best-effort cancellation: cooperative jobs poll this.
    #[must_use]
    pub fn is_interrupt_requested(&self) -> bool {
        self.interrupt_flag.load(Ordering::SeqCst)
    }

    /// For a recovering execution, the identity of the trigger that fired the
    /// lost run.
    #[must_use]
    pub fn recovering_trigger_key(&self) -> Option<TriggerKey> {
        if !self.recovering {
            return None;
        }
        let group = self.merged_data.get_str(RECOVERY_ORIG_TRIGGER_GROUP)?;
        let name = self.merged_data.get_str(RECOVERY_ORIG_TRIGGER_NAME)?;
        TriggerKey::new(group, name).ok()
    }
}

/// Executable code for a job class.
#[async_trait]
pub trait Job: Send + Sync {
    async fn execute(
        &self,
        ctx: &mut JobExecutionContext,
    ) -> std::result::Result<(), JobExecutionError>;
}

/// Resolves a job-class identifier to a fresh [`Job`] instance for one
/// execution. User-pluggable.
pub trait JobFactory: Send + Sync {
    fn new_job(&self, bundle: &TriggerFiredBundle) -> Result<Box<dyn Job>>;
}

type JobConstructor = Arc<dyn Fn() -> Box<dyn Job> + Send + Sync>;

/// Default factory: an explicit registry of job-class constructors.
#[derive(Default)]
pub struct RegistryJobFactory {
    constructors: Mutex<HashMap<String, JobConstructor>>,
}

impl RegistryJobFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, job_class: impl Into<String>, constructor: F)
    where
        F: Fn() -> Box<dyn Job> + Send + Sync + 'static,
    {
        let mut constructors = self
            .constructors
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        constructors.insert(job_class.into(), Arc::new(constructor));
    }
}

impl fmt::Debug for RegistryJobFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryJobFactory").finish_non_exhaustive()
    }
}

impl JobFactory for RegistryJobFactory {
    fn new_job(&self, bundle: &TriggerFiredBundle) -> Result<Box<dyn Job>> {
        let constructors = self
            .constructors
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let constructor = constructors.get(&bundle.job.job_class).ok_or_else(|| {
            SchedulerError::not_found(format!(
                "no job registered for class '{}'",
                bundle.job.job_class
            ))
        })?;
        Ok(constructor())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_map_merge_trigger_wins() {
        let job = JobDataMap::new().with("shared", "job").with("onlyJob", 1);
        let trigger = JobDataMap::new().with("shared", "trigger").with("onlyTrigger", 2);
        let merged = job.merged_with(&trigger);
        assert_eq!(merged.get_str("shared"), Some("trigger"));
        assert_eq!(merged.get("onlyJob"), Some(&Value::from(1)));
        assert_eq!(merged.get("onlyTrigger"), Some(&Value::from(2)));
    }

    #[test]
    fn test_job_detail_serde_round_trip() {
        let detail = JobDetail::new(JobKey::of("j").unwrap(), "jobs.Report")
            .durable(true)
            .requests_recovery(true)
            .with_data(JobDataMap::new().with("limit", 10));
        let json = serde_json::to_string(&detail).unwrap();
        let back: JobDetail = serde_json::from_str(&json).unwrap();
        assert_eq!(detail, back);
    }

    #[test]
    fn test_execution_error_flags() {
        let err = JobExecutionError::new("boom").refire_immediately();
        assert!(err.refire_immediately);
        assert!(!err.unschedule_firing_trigger);
    }
}
