//! Process configuration assembled from the environment.

use serde::{Deserialize, Serialize};

use tessera_jobs::{EventLogConfig, SchedulerConfig};
use tessera_recommend::VisibilityConfig;

/// Everything the worker process needs to start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub scheduler: SchedulerConfig,
    pub visibility: VisibilityConfig,
    pub event_log: EventLogConfig,
}

impl WorkerSettings {
    pub fn from_env() -> Self {
        Self {
            scheduler: SchedulerConfig::from_env(),
            visibility: VisibilityConfig::from_env(),
            event_log: EventLogConfig::from_env(),
        }
    }

    pub fn validate(&self) -> tessera_core::Result<()> {
        self.scheduler.validate()?;
        if !(0.0..=1.0).contains(&self.visibility.min_confidence) {
            return Err(tessera_core::Error::Config(format!(
                "min_confidence {} outside [0, 1]",
                self.visibility.min_confidence
            )));
        }
        if self.event_log.batch_size == 0 {
            return Err(tessera_core::Error::Config(
                "event log batch size must be positive".into(),
            ));
        }
        Ok(())
    }
}
