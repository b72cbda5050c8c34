//! Configuration module for the queue engine.
//!
//! Loads a structured TOML file into strongly typed structs using
//! `serde` + `toml`.
//!
//! # Example `relaymq.toml`
//! ```toml
//! [queue]
//! gc_threshold = 1_000   # tombstones tolerated before compaction
//! max_paged_in = 2_000   # base working-set bound, before prefetch
//!
//! [memory]
//! limit_bytes           = 67_108_864   # 64 MiB
//! send_fail_if_no_space = false
//! ```

use serde::Deserialize;
use std::{fs, path::Path};

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueueTuning {
    /// Tombstone count that triggers paged-in compaction.
    pub gc_threshold: usize,
    /// Base bound on the in-memory working set; each subscription's
    /// prefetch is added on top.
    pub max_paged_in: usize,
}

impl Default for QueueTuning {
    fn default() -> Self {
        Self {
            gc_threshold: 1000,
            max_paged_in: 2000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MemoryTuning {
    /// Byte budget for the queue's usage accountant.
    pub limit_bytes: u64,
    /// Raise an error from `send` instead of blocking when full.
    pub send_fail_if_no_space: bool,
}

impl Default for MemoryTuning {
    fn default() -> Self {
        Self {
            limit_bytes: u64::MAX,
            send_fail_if_no_space: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub queue: QueueTuning,
    pub memory: MemoryTuning,
}

/// Load configuration from a TOML file into `EngineConfig`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<EngineConfig, anyhow::Error> {
    let raw: String = fs::read_to_string(&path)?;
    let cfg: EngineConfig = toml::from_str(&raw)?;
    Ok(cfg)
}
