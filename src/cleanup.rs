//! Age-based reclamation of on-disk tile pyramids.

use std::time::{Duration, SystemTime};

use crate::error::TileResult;
use crate::store::{StoreStats, TileStore};

/// Outcome of one `cleanup_old_tiles` run.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub deleted_media_count: usize,
    pub freed_bytes: u64,
    pub kept_media_count: usize,
    pub before: Option<StoreStats>,
    pub after: Option<StoreStats>,
}

/// Delete media directories whose most recent file mtime is older than
/// `max_age_days`. Serialized on the same disk mutex as `TileStore` writes
/// (each deletion goes through `TileStore::delete_media`).
pub fn cleanup_old_tiles(store: &TileStore, max_age_days: u32, dry_run: bool, collect_stats: bool) -> TileResult<CleanupReport> {
    let mut report = CleanupReport::default();
    if collect_stats {
        report.before = Some(store.stats()?);
    }

    let threshold = Duration::from_secs(u64::from(max_age_days) * 24 * 60 * 60);
    let now = SystemTime::now();

    let root = store.root();
    if !root.exists() {
        return Ok(report);
    }

    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let media_dir = entry.path();
        let newest_mtime = newest_mtime_in(&media_dir)?;
        let age = newest_mtime.and_then(|t| now.duration_since(t).ok());

        let stale = age.map(|a| a > threshold).unwrap_or(false);
        if stale {
            let freed = dir_size(&media_dir)?;
            if !dry_run {
                let hash = entry.file_name().to_string_lossy().to_string();
                store.delete_media_dir(&hash)?;
            }
            report.deleted_media_count += 1;
            report.freed_bytes += freed;
        } else {
            report.kept_media_count += 1;
        }
    }

    if collect_stats {
        report.after = Some(store.stats()?);
    }

    log::info!(
        "cleanup: {} media deleted ({} bytes freed), {} kept{}",
        report.deleted_media_count,
        report.freed_bytes,
        report.kept_media_count,
        if dry_run { " [dry run]" } else { "" }
    );

    Ok(report)
}

fn newest_mtime_in(dir: &std::path::Path) -> TileResult<Option<SystemTime>> {
    let mut newest = None;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let ty = entry.file_type()?;
        let candidate = if ty.is_dir() {
            newest_mtime_in(&entry.path())?
        } else {
            Some(entry.metadata()?.modified()?)
        };
        if let Some(candidate) = candidate {
            newest = Some(match newest {
                Some(current) if current > candidate => current,
                _ => candidate,
            });
        }
    }
    Ok(newest)
}

fn dir_size(dir: &std::path::Path) -> TileResult<u64> {
    let mut total = 0u64;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::TileId;
    use crate::tile::{Tile, TileExt};

    fn age_media(store: &TileStore, media_id: &str, age: Duration) {
        let path = store.media_path(media_id);
        let mtime = SystemTime::now() - age;
        for entry in walkdir_files(&path) {
            if let Ok(file) = std::fs::File::open(&entry) {
                let _ = file.set_modified(mtime);
            }
        }
    }

    fn walkdir_files(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
        let mut out = Vec::new();
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    out.extend(walkdir_files(&entry.path()));
                } else {
                    out.push(entry.path());
                }
            }
        }
        out
    }

    #[test]
    fn fresh_media_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = TileStore::new(dir.path()).unwrap();
        store.save_tile(&TileId::new("fresh", 0, 0, 0), &Tile::solid(8, [1, 1, 1]), TileExt::Png).unwrap();

        let report = cleanup_old_tiles(&store, 3, false, false).unwrap();
        assert_eq!(report.kept_media_count, 1);
        assert_eq!(report.deleted_media_count, 0);
    }

    #[test]
    fn dry_run_reports_without_deleting() {
        let dir = tempfile::tempdir().unwrap();
        let store = TileStore::new(dir.path()).unwrap();
        store.save_tile(&TileId::new("stale", 0, 0, 0), &Tile::solid(8, [1, 1, 1]), TileExt::Png).unwrap();
        age_media(&store, "stale", Duration::from_secs(10 * 24 * 60 * 60));

        let report = cleanup_old_tiles(&store, 3, true, false).unwrap();
        assert_eq!(report.deleted_media_count, 1);
        assert!(store.is_tiled("stale"));
        assert!(store.media_path("stale").exists());
    }

    #[test]
    fn stats_collection_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        let store = TileStore::new(dir.path()).unwrap();
        let report = cleanup_old_tiles(&store, 3, false, false).unwrap();
        assert!(report.before.is_none());
        assert!(report.after.is_none());

        let report = cleanup_old_tiles(&store, 3, false, true).unwrap();
        assert!(report.before.is_some());
        assert!(report.after.is_some());
    }
}
