use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use binder_ipc::IpcConfig;
use blast_queue::BlastConfig;
use buffer_queue::QueueConfig;
use serde::Deserialize;

/// Everything `binderctl` can be configured with, one table per layer.
///
/// ```toml
/// [ipc]
/// max_threads = 4
///
/// [queue]
/// consumer_name = "demo"
/// max_acquired_buffers = 2
///
/// [blast]
/// name = "demo-surface"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub ipc: IpcConfig,
    pub queue: QueueConfig,
    pub blast: BlastConfig,
}

impl CliConfig {
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid binderctl config")
    }

    /// Reads `path`, or falls back to the defaults when there is none.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path).with_context(|| format!("failed to read config {path:?}"))?;
        Self::parse(&text).with_context(|| format!("while loading {path:?}"))
    }
}
