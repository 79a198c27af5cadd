//! Configuration for the hierarchy controller.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a hierarchy controller instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HncConfig {
    /// Number of concurrent reconcile workers
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Upper bound of drain iterations for `run_until_idle`
    #[serde(default = "default_max_passes")]
    pub max_passes: usize,
    /// Work queue configuration
    #[serde(default)]
    pub queue: QueueConfig,
    /// Propagation configuration
    #[serde(default)]
    pub propagation: PropagationConfig,
}

impl Default for HncConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_passes: default_max_passes(),
            queue: QueueConfig::default(),
            propagation: PropagationConfig::default(),
        }
    }
}

impl HncConfig {
    /// Load config from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Check values that would stall the controller.
    pub fn validate(&self) -> crate::types::Result<()> {
        if self.workers == 0 {
            return Err(crate::types::HncError::Config(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.queue.base_delay_ms > self.queue.max_delay_ms {
            return Err(crate::types::HncError::Config(format!(
                "queue.base_delay_ms ({}) exceeds queue.max_delay_ms ({})",
                self.queue.base_delay_ms, self.queue.max_delay_ms
            )));
        }
        Ok(())
    }
}

/// Work queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// First retry delay for a failing key (ms)
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    /// Retry delay cap (ms)
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Consecutive transient failures before a key is dropped
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            max_retries: default_max_retries(),
        }
    }
}

impl QueueConfig {
    /// Exponential backoff for the given number of prior failures.
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u64.saturating_pow(failures.min(32));
        let delay = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Propagation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationConfig {
    /// Object kinds copied from ancestors into descendants
    #[serde(default = "default_kinds")]
    pub kinds: Vec<String>,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            kinds: default_kinds(),
        }
    }
}

impl PropagationConfig {
    pub fn propagates(&self, kind: &str) -> bool {
        self.kinds.iter().any(|k| k == kind)
    }
}

fn default_workers() -> usize { 4 }
fn default_max_passes() -> usize { 64 }
fn default_base_delay() -> u64 { 5 }
fn default_max_delay() -> u64 { 30_000 }
fn default_max_retries() -> u32 { 15 }
fn default_kinds() -> Vec<String> {
    vec!["Role".to_string(), "RoleBinding".to_string()]
}
