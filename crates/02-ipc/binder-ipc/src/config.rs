use std::time::Duration;

use serde::Deserialize;

/// What happens when a restricted process makes a call that waits for a reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRestriction {
    #[default]
    None,
    ErrorIfNotOneway,
    FatalIfNotOneway,
}

/// Process-wide engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Threads the peer may ask this process to start.
    pub max_threads: usize,
    pub starvation_threshold_ms: u64,
    pub thread_wait_log_interval_ms: u64,
    /// Bytes requested from the peer on each read.
    pub read_buffer_capacity: usize,
    pub call_restriction: CallRestriction,
    pub oneway_spam_detection: bool,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            max_threads: 15,
            starvation_threshold_ms: 100,
            thread_wait_log_interval_ms: 1000,
            read_buffer_capacity: 256,
            call_restriction: CallRestriction::None,
            oneway_spam_detection: true,
        }
    }
}

impl IpcConfig {
    pub fn starvation_threshold(&self) -> Duration {
        Duration::from_millis(self.starvation_threshold_ms)
    }

    pub fn thread_wait_log_interval(&self) -> Duration {
        Duration::from_millis(self.thread_wait_log_interval_ms.max(1))
    }
}
