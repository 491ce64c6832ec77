//! Listener contracts and the broadcast bus.
//!
//! Job and trigger listeners are registered under a unique name with a list
//! of key matchers; scheduler listeners are global. Broadcasting snapshots
//! the registry, then invokes callbacks in insertion order without holding
//! any lock; a listener error is logged and never stops the broadcast.

use std::sync::{Arc, Mutex};

use {async_trait::async_trait, tracing::warn};

use crate::{
    error::{Result, SchedulerError},
    job::{JobExecutionContext, JobExecutionError},
    key::{KeyMatcher, TriggerKey},
    store::CompletionInstruction,
    trigger::Trigger,
};

/// Observes executions of matching jobs. All methods default to no-ops.
#[async_trait]
pub trait JobListener: Send + Sync {
    fn name(&self) -> &str;

    async fn job_to_be_executed(&self, _ctx: &JobExecutionContext) -> Result<()> {
        Ok(())
    }

    async fn job_execution_vetoed(&self, _ctx: &JobExecutionContext) -> Result<()> {
        Ok(())
    }

    async fn job_was_executed(
        &self,
        _ctx: &JobExecutionContext,
        _error: Option<&JobExecutionError>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Observes firings of matching triggers. All methods default to no-ops;
/// [`veto_job_execution`](Self::veto_job_execution) defaults to no veto.
#[async_trait]
pub trait TriggerListener: Send + Sync {
    fn name(&self) -> &str;

    async fn trigger_fired(&self, _trigger: &Trigger, _ctx: &JobExecutionContext) -> Result<()> {
        Ok(())
    }

    /// Return true to veto the job execution for this fire.
    async fn veto_job_execution(
        &self,
        _trigger: &Trigger,
        _ctx: &JobExecutionContext,
    ) -> Result<bool> {
        Ok(false)
    }

    async fn trigger_misfired(&self, _trigger: &Trigger) -> Result<()> {
        Ok(())
    }

    async fn trigger_complete(
        &self,
        _trigger: &Trigger,
        _ctx: &JobExecutionContext,
        _instruction: CompletionInstruction,
    ) -> Result<()> {
        Ok(())
    }
}

/// Observes scheduler-wide events. Global: no matchers.
#[async_trait]
pub trait SchedulerListener: Send + Sync {
    async fn scheduler_started(&self) -> Result<()> {
        Ok(())
    }

    async fn scheduler_in_standby(&self) -> Result<()> {
        Ok(())
    }

    async fn scheduler_shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn scheduler_error(&self, _message: &str, _error: &SchedulerError) -> Result<()> {
        Ok(())
    }

    async fn job_scheduled(&self, _trigger: &Trigger) -> Result<()> {
        Ok(())
    }

    async fn job_unscheduled(&self, _key: &TriggerKey) -> Result<()> {
        Ok(())
    }

    async fn trigger_paused(&self, _key: &TriggerKey) -> Result<()> {
        Ok(())
    }

    async fn trigger_resumed(&self, _key: &TriggerKey) -> Result<()> {
        Ok(())
    }

    async fn job_paused(&self, _key: &crate::key::JobKey) -> Result<()> {
        Ok(())
    }

    async fn job_resumed(&self, _key: &crate::key::JobKey) -> Result<()> {
        Ok(())
    }

    /// `group` is `None` for pause-all.
    async fn triggers_paused(&self, _group: Option<&str>) -> Result<()> {
        Ok(())
    }

    async fn triggers_resumed(&self, _group: Option<&str>) -> Result<()> {
        Ok(())
    }

    async fn jobs_paused(&self, _group: Option<&str>) -> Result<()> {
        Ok(())
    }

    async fn jobs_resumed(&self, _group: Option<&str>) -> Result<()> {
        Ok(())
    }

    async fn scheduling_data_cleared(&self) -> Result<()> {
        Ok(())
    }
}

/// Empty matcher list means "everything".
fn matches(matchers: &[KeyMatcher], group: &str, name: &str) -> bool {
    matchers.is_empty() || matchers.iter().any(|m| m.matches(group, name))
}

/// Multiplexes scheduler events to registered listeners.
#[derive(Default)]
pub struct ListenerBus {
    job: Mutex<Vec<(Arc<dyn JobListener>, Vec<KeyMatcher>)>>,
    trigger: Mutex<Vec<(Arc<dyn TriggerListener>, Vec<KeyMatcher>)>>,
    scheduler: Mutex<Vec<Arc<dyn SchedulerListener>>>,
}

impl ListenerBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the listener's name, replacing any previous listener
    /// with that name.
    pub fn add_job_listener(&self, listener: Arc<dyn JobListener>, matchers: Vec<KeyMatcher>) {
        let mut registry = self.job.lock().unwrap_or_else(|e| e.into_inner());
        registry.retain(|(l, _)| l.name() != listener.name());
        registry.push((listener, matchers));
    }

    pub fn remove_job_listener(&self, name: &str) -> bool {
        let mut registry = self.job.lock().unwrap_or_else(|e| e.into_inner());
        let before = registry.len();
        registry.retain(|(l, _)| l.name() != name);
        registry.len() != before
    }

    pub fn add_trigger_listener(
        &self,
        listener: Arc<dyn TriggerListener>,
        matchers: Vec<KeyMatcher>,
    ) {
        let mut registry = self.trigger.lock().unwrap_or_else(|e| e.into_inner());
        registry.retain(|(l, _)| l.name() != listener.name());
        registry.push((listener, matchers));
    }

    pub fn remove_trigger_listener(&self, name: &str) -> bool {
        let mut registry = self.trigger.lock().unwrap_or_else(|e| e.into_inner());
        let before = registry.len();
        registry.retain(|(l, _)| l.name() != name);
        registry.len() != before
    }

    pub fn add_scheduler_listener(&self, listener: Arc<dyn SchedulerListener>) {
        self.scheduler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    fn job_listeners_for(&self, group: &str, name: &str) -> Vec<Arc<dyn JobListener>> {
        self.job
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, m)| matches(m, group, name))
            .map(|(l, _)| Arc::clone(l))
            .collect()
    }

    fn trigger_listeners_for(&self, group: &str, name: &str) -> Vec<Arc<dyn TriggerListener>> {
        self.trigger
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, m)| matches(m, group, name))
            .map(|(l, _)| Arc::clone(l))
            .collect()
    }

    fn scheduler_listeners(&self) -> Vec<Arc<dyn SchedulerListener>> {
        self.scheduler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    // ── Broadcasts ──────────────────────────────────────────────────────

    pub async fn notify_trigger_fired(&self, trigger: &Trigger, ctx: &JobExecutionContext) {
        for l in self.trigger_listeners_for(trigger.key.group(), trigger.key.name()) {
            if let Err(e) = l.trigger_fired(trigger, ctx).await {
                warn!(listener = %l.name(), error = %e, "trigger listener failed in trigger_fired");
            }
        }
    }

    /// True if any matching trigger listener vetoes the execution.
    pub async fn collect_veto(&self, trigger: &Trigger, ctx: &JobExecutionContext) -> bool {
        let mut vetoed = false;
        for l in self.trigger_listeners_for(trigger.key.group(), trigger.key.name()) {
            match l.veto_job_execution(trigger, ctx).await {
                Ok(true) => vetoed = true,
                Ok(false) => {},
                Err(e) => {
                    warn!(listener = %l.name(), error = %e, "trigger listener failed in veto_job_execution");
                },
            }
        }
        vetoed
    }

    pub async fn notify_trigger_misfired(&self, trigger: &Trigger) {
        for l in self.trigger_listeners_for(trigger.key.group(), trigger.key.name()) {
            if let Err(e) = l.trigger_misfired(trigger).await {
                warn!(listener = %l.name(), error = %e, "trigger listener failed in trigger_misfired");
            }
        }
    }

    pub async fn notify_trigger_complete(
        &self,
        trigger: &Trigger,
        ctx: &JobExecutionContext,
        instruction: CompletionInstruction,
    ) {
        for l in self.trigger_listeners_for(trigger.key.group(), trigger.key.name()) {
            if let Err(e) = l.trigger_complete(trigger, ctx, instruction).await {
                warn!(listener = %l.name(), error = %e, "trigger listener failed in trigger_complete");
            }
        }
    }

    pub async fn notify_job_to_be_executed(&self, ctx: &JobExecutionContext) {
        for l in self.job_listeners_for(ctx.job.key.group(), ctx.job.key.name()) {
            if let Err(e) = l.job_to_be_executed(ctx).await {
                warn!(listener = %l.name(), error = %e, "job listener failed in job_to_be_executed");
            }
        }
    }

    pub async fn notify_job_execution_vetoed(&self, ctx: &JobExecutionContext) {
        for l in self.job_listeners_for(ctx.job.key.group(), ctx.job.key.name()) {
            if let Err(e) = l.job_execution_vetoed(ctx).await {
                warn!(listener = %l.name(), error = %e, "job listener failed in job_execution_vetoed");
            }
        }
    }

    pub async fn notify_job_was_executed(
        &self,
        ctx: &JobExecutionContext,
        error: Option<&JobExecutionError>,
    ) {
        for l in self.job_listeners_for(ctx.job.key.group(), ctx.job.key.name()) {
            if let Err(e) = l.job_was_executed(ctx, error).await {
                warn!(listener = %l.name(), error = %e, "job listener failed in job_was_executed");
            }
        }
    }

    pub async fn notify_scheduler_error(&self, message: &str, error: &SchedulerError) {
        for l in self.scheduler_listeners() {
            if let Err(e) = l.scheduler_error(message, error).await {
                warn!(error = %e, "scheduler listener failed in scheduler_error");
            }
        }
    }

    pub async fn notify_scheduler_started(&self) {
        for l in self.scheduler_listeners() {
            if let Err(e) = l.scheduler_started().await {
                warn!(error = %e, "scheduler listener failed in scheduler_started");
            }
        }
    }

    pub async fn notify_scheduler_in_standby(&self) {
        for l in self.scheduler_listeners() {
            if let Err(e) = l.scheduler_in_standby().await {
                warn!(error = %e, "scheduler listener failed in scheduler_in_standby");
            }
        }
    }

    pub async fn notify_scheduler_shutdown(&self) {
        for l in self.scheduler_listeners() {
            if let Err(e) = l.scheduler_shutdown().await {
                warn!(error = %e, "scheduler listener failed in scheduler_shutdown");
            }
        }
    }

    pub async fn notify_job_scheduled(&self, trigger: &Trigger) {
        for l in self.scheduler_listeners() {
            if let Err(e) = l.job_scheduled(trigger).await {
                warn!(error = %e, "scheduler listener failed in job_scheduled");
            }
        }
    }

    pub async fn notify_job_unscheduled(&self, key: &TriggerKey) {
        for l in self.scheduler_listeners() {
            if let Err(e) = l.job_unscheduled(key).await {
                warn!(error = %e, "scheduler listener failed in job_unscheduled");
            }
        }
    }

    pub async fn notify_trigger_paused(&self, key: &TriggerKey) {
        for l in self.scheduler_listeners() {
            if let Err(e) = l.trigger_paused(key).await {
                warn!(error = %e, "scheduler listener failed in trigger_paused");
            }
        }
    }

    pub async fn notify_trigger_resumed(&self, key: &TriggerKey) {
        for l in self.scheduler_listeners() {
            if let Err(e) = l.trigger_resumed(key).await {
                warn!(error = %e, "scheduler listener failed in trigger_resumed");
            }
        }
    }

    pub async fn notify_job_paused(&self, key: &crate::key::JobKey) {
        for l in self.scheduler_listeners() {
            if let Err(e) = l.job_paused(key).await {
                warn!(error = %e, "scheduler listener failed in job_paused");
            }
        }
    }

    pub async fn notify_job_resumed(&self, key: &crate::key::JobKey) {
        for l in self.scheduler_listeners() {
            if let Err(e) = l.job_resumed(key).await {
                warn!(error = %e, "scheduler listener failed in job_resumed");
            }
        }
    }

    pub async fn notify_triggers_paused(&self, group: Option<&str>) {
        for l in self.scheduler_listeners() {
            if let Err(e) = l.triggers_paused(group).await {
                warn!(error = %e, "scheduler listener failed in triggers_paused");
            }
        }
    }

    pub async fn notify_triggers_resumed(&self, group: Option<&str>) {
        for l in self.scheduler_listeners() {
            if let Err(e) = l.triggers_resumed(group).await {
                warn!(error = %e, "scheduler listener failed in triggers_resumed");
            }
        }
    }

    pub async fn notify_jobs_paused(&self, group: Option<&str>) {
        for l in self.scheduler_listeners() {
            if let Err(e) = l.jobs_paused(group).await {
                warn!(error = %e, "scheduler listener failed in jobs_paused");
            }
        }
    }

    pub async fn notify_jobs_resumed(&self, group: Option<&str>) {
        for l in self.scheduler_listeners() {
            if let Err(e) = l.jobs_resumed(group).await {
                warn!(error = %e, "scheduler listener failed in jobs_resumed");
            }
        }
    }

    pub async fn notify_scheduling_data_cleared(&self) {
        for l in self.scheduler_listeners() {
            if let Err(e) = l.scheduling_data_cleared().await {
                warn!(error = %e, "scheduler listener failed in scheduling_data_cleared");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{job::JobDetail, key::JobKey, trigger::Schedule};

    struct CountingTriggerListener {
        name: String,
        fired: Arc<AtomicUsize>,
        veto: bool,
        fail: bool,
    }

    #[async_trait]
    impl TriggerListener for CountingTriggerListener {
        fn name(&self) -> &str {
            &self.name
        }

        async fn trigger_fired(&self, _t: &Trigger, _c: &JobExecutionContext) -> Result<()> {
            self.fired.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SchedulerError::message("listener exploded"));
            }
            Ok(())
        }

        async fn veto_job_execution(
            &self,
            _t: &Trigger,
            _c: &JobExecutionContext,
        ) -> Result<bool> {
            Ok(self.veto)
        }
    }

    fn test_trigger(group: &str) -> Trigger {
        Trigger::new(
            TriggerKey::new(group, "t").unwrap(),
            JobKey::of("j").unwrap(),
            0,
            Schedule::once(),
        )
    }

    fn test_ctx(trigger: &Trigger) -> JobExecutionContext {
        let bundle = crate::store::TriggerFiredBundle {
            job: JobDetail::new(JobKey::of("j").unwrap(), "test.Job"),
            trigger: trigger.clone(),
            calendar: None,
            recovering: false,
            fire_instance_id: "fi-1".into(),
            fire_at_ms: 0,
            scheduled_fire_at_ms: 0,
            previous_fire_at_ms: None,
            next_fire_at_ms: None,
        };
        JobExecutionContext::from_bundle(
            "test-sched",
            &bundle,
            0,
            Arc::new(std::sync::atomic::AtomicBool::new(false)),
        )
    }

    #[tokio::test]
    async fn test_matchers_filter_broadcast() {
        let bus = ListenerBus::new();
        let count_a = Arc::new(AtomicUsize::new(0));
        let count_b = Arc::new(AtomicUsize::new(0));
        bus.add_trigger_listener(
            Arc::new(CountingTriggerListener {
                name: "a".into(),
                fired: Arc::clone(&count_a),
                veto: false,
                fail: false,
            }),
            vec![KeyMatcher::group("batch")],
        );
        bus.add_trigger_listener(
            Arc::new(CountingTriggerListener {
                name: "b".into(),
                fired: Arc::clone(&count_b),
                veto: false,
                fail: false,
            }),
            vec![],
        );

        let trigger = test_trigger("other");
        let ctx = test_ctx(&trigger);
        bus.notify_trigger_fired(&trigger, &ctx).await;
        assert_eq!(count_a.load(Ordering::SeqCst), 0);
        assert_eq!(count_b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_listener_error_does_not_stop_broadcast() {
        let bus = ListenerBus::new();
        let failing = Arc::new(AtomicUsize::new(0));
        let healthy = Arc::new(AtomicUsize::new(0));
        bus.add_trigger_listener(
            Arc::new(CountingTriggerListener {
                name: "failing".into(),
                fired: Arc::clone(&failing),
                veto: false,
                fail: true,
            }),
            vec![],
        );
        bus.add_trigger_listener(
            Arc::new(CountingTriggerListener {
                name: "healthy".into(),
                fired: Arc::clone(&healthy),
                veto: false,
                fail: false,
            }),
            vec![],
        );

        let trigger = test_trigger("g");
        let ctx = test_ctx(&trigger);
        bus.notify_trigger_fired(&trigger, &ctx).await;
        assert_eq!(failing.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_any_veto_wins() {
        let bus = ListenerBus::new();
        bus.add_trigger_listener(
            Arc::new(CountingTriggerListener {
                name: "quiet".into(),
                fired: Arc::new(AtomicUsize::new(0)),
                veto: false,
                fail: false,
            }),
            vec![],
        );
        bus.add_trigger_listener(
            Arc::new(CountingTriggerListener {
                name: "vetoer".into(),
                fired: Arc::new(AtomicUsize::new(0)),
                veto: true,
                fail: false,
            }),
            vec![],
        );

        let trigger = test_trigger("g");
        let ctx = test_ctx(&trigger);
        assert!(bus.collect_veto(&trigger, &ctx).await);
    }

    #[tokio::test]
    async fn test_register_replaces_same_name() {
        let bus = ListenerBus::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        for fired in [&first, &second] {
            bus.add_trigger_listener(
                Arc::new(CountingTriggerListener {
                    name: "same".into(),
                    fired: Arc::clone(fired),
                    veto: false,
                    fail: false,
                }),
                vec![],
            );
        }
        let trigger = test_trigger("g");
        let ctx = test_ctx(&trigger);
        bus.notify_trigger_fired(&trigger, &ctx).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert!(bus.remove_trigger_listener("same"));
        assert!(!bus.remove_trigger_listener("same"));
    }
}
