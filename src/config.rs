//! Configuration types for §6's enumerated key table.
//!
//! These are plain `serde::Deserialize` structs - the core never reads a
//! config file itself (that's the external CLI/daemon's job per §1); it
//! only needs a typed shape for whatever an external loader deserializes
//! into.

use serde::Deserialize;

use crate::chunker::ChunkerParams as ChunkerBounds;

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub root: std::path::PathBuf,
}

/// Mirrors `chunker.min_size` / `avg_size` / `max_size` from §6's
/// configuration table; converts into `chunker::ChunkerParams` once
/// validated.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    pub min_size: usize,
    pub avg_size: usize,
    pub max_size: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        let defaults = ChunkerBounds::default();
        Self {
            min_size: defaults.min_size,
            avg_size: defaults.avg_size,
            max_size: defaults.max_size,
        }
    }
}

impl ChunkerConfig {
    pub fn into_params(self) -> crate::error::Result<ChunkerBounds> {
        ChunkerBounds::new(self.min_size, self.avg_size, self.max_size)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackupOptions {
    pub include_hidden: bool,
    pub follow_symlinks: bool,
    pub exclude_globs: Vec<String>,
    pub verify_after: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            include_hidden: false,
            follow_symlinks: false,
            exclude_globs: Vec::new(),
            verify_after: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RestoreOptions {
    pub preserve_attributes: bool,
    pub overwrite_existing: bool,
    pub continue_on_error: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self { preserve_attributes: true, overwrite_existing: false, continue_on_error: false }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct GcOptions {
    pub grace_seconds: u64,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self { grace_seconds: 60 }
    }
}
