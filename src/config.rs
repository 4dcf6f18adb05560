//! Engine-wide configuration, loadable from a JSON file with sensible defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::TileResult;

/// Tunables for a `TileManager` instance.
///
/// All fields have defaults appropriate for a desktop ZUI application; callers
/// typically start from [`TileEngineConfig::default`] and override a handful
/// of fields, or load a full config from disk with [`TileEngineConfig::load`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TileEngineConfig {
    /// Root directory for the on-disk tile store. `None` resolves to the
    /// platform default under the user's home/profile directory.
    pub root_dir: Option<PathBuf>,

    /// Total bytes of decoded tile pixels the in-memory cache may hold.
    pub cache_total_bytes: u64,

    /// Fraction of `cache_total_bytes` reserved for the permanent (loaded)
    /// cache; the remainder backs the scratch (synthesized) cache.
    pub permanent_fraction: f64,

    /// Whether idle-time cleanup of stale on-disk tiles runs automatically.
    pub auto_cleanup: bool,

    /// Tiles older than this many days are eligible for cleanup.
    pub cleanup_age_days: u32,

    /// Whether cleanup also runs once at shutdown.
    pub cleanup_on_shutdown: bool,

    /// Whether cleanup collects and returns per-run statistics (costs an
    /// extra directory walk).
    pub collect_cleanup_stats: bool,

    /// Number of worker threads in the conversion pool.
    pub conversion_workers: usize,
}

impl Default for TileEngineConfig {
    fn default() -> Self {
        Self {
            root_dir: None,
            cache_total_bytes: 512 * 1024 * 1024,
            permanent_fraction: 0.8,
            auto_cleanup: true,
            cleanup_age_days: 3,
            cleanup_on_shutdown: true,
            collect_cleanup_stats: false,
            conversion_workers: default_conversion_workers(),
        }
    }
}

fn default_conversion_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1).min(4)
}

impl TileEngineConfig {
    /// Load configuration from a JSON file, falling back to defaults for any
    /// field the file omits.
    pub fn load(path: &Path) -> TileResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TileEngineConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> TileResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Resolve the effective tile store root: `root_dir` if set, otherwise
    /// the platform default under the user's home/profile directory.
    pub fn resolved_root_dir(&self) -> PathBuf {
        self.root_dir.clone().unwrap_or_else(default_root_dir)
    }

    pub fn permanent_bytes(&self) -> u64 {
        (self.cache_total_bytes as f64 * self.permanent_fraction) as u64
    }

    pub fn scratch_bytes(&self) -> u64 {
        self.cache_total_bytes.saturating_sub(self.permanent_bytes())
    }
}

#[cfg(target_os = "windows")]
fn default_root_dir() -> PathBuf {
    let appdata = std::env::var_os("APPDATA").unwrap_or_else(|| ".".into());
    PathBuf::from(appdata).join("tile_pyramid_engine").join("tilestore")
}

#[cfg(not(target_os = "windows"))]
fn default_root_dir() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_else(|| ".".into());
    PathBuf::from(home).join(".tile_pyramid_engine").join("tilestore")
}
