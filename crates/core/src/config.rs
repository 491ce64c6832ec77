//! Process-wide scheduler configuration, read once at startup.

use {
    serde::{Deserialize, Serialize},
    uuid::Uuid,
};

use crate::error::{Result, SchedulerError};

/// Sentinel `instance_id` that generates a unique id at startup.
pub const AUTO_INSTANCE_ID: &str = "AUTO";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerConfig {
    pub instance_name: String,
    /// Fixed id, or [`AUTO_INSTANCE_ID`] to generate one.
    pub instance_id: String,
    /// Worker pool size. Zero builds a scheduler that can manage
    /// definitions but must never be started.
    pub thread_count: usize,
    pub misfire_threshold_ms: u64,
    /// Max triggers acquired per dispatcher pass.
    pub batch_max_count: usize,
    /// Triggers due within this window of the first one ride along in the
    /// same batch.
    pub batch_time_window_ms: u64,
    /// How far ahead an acquisition looks, and the idle sleep bound.
    pub idle_wait_ms: u64,
    pub store: StoreConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_name: "BelfryScheduler".to_string(),
            instance_id: "NON_CLUSTERED".to_string(),
            thread_count: 10,
            misfire_threshold_ms: 60_000,
            batch_max_count: 1,
            batch_time_window_ms: 0,
            idle_wait_ms: 30_000,
            store: StoreConfig::Memory,
        }
    }
}

/// Which job store implementation to build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StoreConfig {
    #[default]
    Memory,
    Sqlite {
        url: String,
    },
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.instance_name.is_empty() {
            return Err(SchedulerError::Config("instance name cannot be empty".into()));
        }
        if self.batch_max_count == 0 {
            return Err(SchedulerError::Config(
                "batch max count must be at least 1".into(),
            ));
        }
        if self.idle_wait_ms < 1_000 {
            return Err(SchedulerError::Config(
                "idle wait must be at least 1000 ms".into(),
            ));
        }
        Ok(())
    }

    /// The configured instance id, resolving `AUTO` to a generated one.
    #[must_use]
    pub fn effective_instance_id(&self) -> String {
        if self.instance_id == AUTO_INSTANCE_ID {
            format!("{}-{}", self.instance_name, Uuid::new_v4())
        } else {
            self.instance_id.clone()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| SchedulerError::Config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.thread_count, 10);
        assert_eq!(config.misfire_threshold_ms, 60_000);
        assert_eq!(config.batch_max_count, 1);
        assert_eq!(config.batch_time_window_ms, 0);
        assert_eq!(config.idle_wait_ms, 30_000);
        assert_eq!(config.store, StoreConfig::Memory);
        config.validate().unwrap();
    }

    #[test]
    fn test_from_json_camel_case() {
        let config = SchedulerConfig::from_json(
            r#"{
                "instanceName": "reports",
                "instanceId": "AUTO",
                "threadCount": 4,
                "idleWaitMs": 5000,
                "store": { "kind": "sqlite", "url": "sqlite://sched.db" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.instance_name, "reports");
        assert_eq!(config.thread_count, 4);
        assert_eq!(
            config.store,
            StoreConfig::Sqlite {
                url: "sqlite://sched.db".into()
            }
        );
    }

    #[test]
    fn test_auto_instance_id_generates_unique() {
        let config = SchedulerConfig {
            instance_id: AUTO_INSTANCE_ID.into(),
            ..SchedulerConfig::default()
        };
        let a = config.effective_instance_id();
        let b = config.effective_instance_id();
        assert_ne!(a, b);
        assert!(a.starts_with("BelfryScheduler-"));
    }

    #[test]
    fn test_fixed_instance_id_is_stable() {
        let config = SchedulerConfig::default();
        assert_eq!(config.effective_instance_id(), "NON_CLUSTERED");
    }

    #[rstest]
    #[case::empty_name(r#"{"instanceName": ""}"#)]
    #[case::zero_batch(r#"{"batchMaxCount": 0}"#)]
    #[case::tiny_idle_wait(r#"{"idleWaitMs": 10}"#)]
    fn test_validation_rejects_bad_values(#[case] json: &str) {
        assert!(matches!(
            SchedulerConfig::from_json(json),
            Err(SchedulerError::Config(_))
        ));
    }

    #[test]
    fn test_bad_json_is_config_error() {
        assert!(matches!(
            SchedulerConfig::from_json("{ nope"),
            Err(SchedulerError::Config(_))
        ));
    }
}
