//! Limits applied to background refreshes.

use std::time::Duration;

/// What happens to a refresh that runs too long.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// Run until completion.
    #[default]
    None,
    /// Cancel after the duration.
    Cancel(Duration),
    /// Log a warning after the duration, keep running.
    Warn(Duration),
}

/// Configuration of an [`OffloadManager`](super::OffloadManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffloadConfig {
    /// Upper bound on concurrently running refreshes, unbounded when `None`.
    /// Refreshes spawned past the bound are skipped.
    pub max_concurrent_tasks: Option<usize>,
    pub timeout_policy: TimeoutPolicy,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: None,
            timeout_policy: TimeoutPolicy::None,
        }
    }
}

impl OffloadConfig {
    pub fn builder() -> OffloadConfigBuilder {
        OffloadConfigBuilder::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct OffloadConfigBuilder {
    config: OffloadConfig,
}

impl OffloadConfigBuilder {
    pub fn max_concurrent_tasks(mut self, max: usize) -> Self {
        self.config.max_concurrent_tasks = Some(max);
        self
    }

    pub fn timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.config.timeout_policy = policy;
        self
    }

    /// Cancels refreshes running longer than `duration`.
    pub fn timeout(self, duration: Duration) -> Self {
        self.timeout_policy(TimeoutPolicy::Cancel(duration))
    }

    pub fn build(self) -> OffloadConfig {
        self.config
    }
}
