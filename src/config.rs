//! Engine configuration (spec §6).
//!
//! The donor has no properties-file parser to imitate, so this is a plain
//! struct with one field per documented option rather than a
//! `HashMap<String, String>` — inventing a mini key=value parser crate
//! just to mimic Persistit's `.properties` surface would add a dependency
//! this codebase has no other use for.

use std::path::PathBuf;

use crate::error::{EngineError, EngineResult};

pub const MIN_JOURNAL_SIZE: u64 = 128 * 1024;
pub const DEFAULT_CHECKPOINT_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_LATCH_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPolicy {
    /// fsync before returning from `commit()`.
    Hard,
    /// batch multiple commits into one fsync (group commit).
    Group,
    /// return before fsync; durable only after the next periodic flush.
    Soft,
}

impl Default for CommitPolicy {
    fn default() -> Self {
        CommitPolicy::Group
    }
}

#[derive(Debug, Clone)]
pub struct VolumeSpec {
    pub name: String,
    pub path: PathBuf,
    pub create: VolumeOpenMode,
    pub page_size: u32,
    pub initial_pages: u32,
    pub extension_pages: u32,
    pub maximum_pages: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeOpenMode {
    Create,
    CreateOnly,
    ReadOnly,
    Open,
}

#[derive(Debug, Clone)]
pub struct BufferPoolSpec {
    pub page_size: u32,
    pub frame_count: usize,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub volumes: Vec<VolumeSpec>,
    pub buffer_pools: Vec<BufferPoolSpec>,
    pub journal_path: PathBuf,
    pub journal_size: u64,
    pub appendonly: bool,
    pub ignore_missing_volumes: bool,
    pub commit_policy: CommitPolicy,
    pub checkpoint_interval_secs: u64,
    pub latch_timeout_ms: u64,
    /// `-1` (represented here as `None`) disables every background worker;
    /// tests drive checkpoint/copy-back/cleanup synchronously instead.
    pub poll_interval_ms: Option<u64>,
}

impl EngineConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.journal_size < MIN_JOURNAL_SIZE {
            return Err(EngineError::Config(format!(
                "journalsize {} below minimum {}",
                self.journal_size, MIN_JOURNAL_SIZE
            )));
        }
        for v in &self.volumes {
            if !v.page_size.is_power_of_two() || v.page_size < 1024 || v.page_size > 16384 {
                return Err(EngineError::Config(format!(
                    "volume {} page size {} must be a power of two in [1024, 16384]",
                    v.name, v.page_size
                )));
            }
            if v.maximum_pages < v.initial_pages {
                return Err(EngineError::Config(format!(
                    "volume {} maximumPages {} below initialPages {}",
                    v.name, v.maximum_pages, v.initial_pages
                )));
            }
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            volumes: Vec::new(),
            buffer_pools: Vec::new(),
            journal_path: PathBuf::from("./journal"),
            journal_size: 64 * 1024 * 1024,
            appendonly: false,
            ignore_missing_volumes: false,
            commit_policy: CommitPolicy::default(),
            checkpoint_interval_secs: DEFAULT_CHECKPOINT_INTERVAL_SECS,
            latch_timeout_ms: DEFAULT_LATCH_TIMEOUT_MS,
            poll_interval_ms: Some(1000),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_undersized_journal() {
        let mut config = EngineConfig::default();
        config.journal_size = 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_page_size() {
        let mut config = EngineConfig::default();
        config.volumes.push(VolumeSpec {
            name: "main".into(),
            path: "main.db".into(),
            create: VolumeOpenMode::Create,
            page_size: 3000,
            initial_pages: 1,
            extension_pages: 1,
            maximum_pages: 10,
        });
        assert!(config.validate().is_err());
    }
}
