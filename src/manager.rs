//! Process-scoped entry point gluing the store, cache, providers, and
//! conversion pool into the operations a ZUI viewer actually calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};

use crate::cache::{EvictionClass, Lookup, TileCache};
use crate::cleanup::cleanup_old_tiles;
use crate::config::TileEngineConfig;
use crate::conversion::{ConversionRunner, Job, JobStatus};
use crate::error::{TileEngineError, TileResult};
use crate::ids::{dynamic_generator_key, media_kind, MediaKind, TileId};
use crate::provider::{
    DynamicLoader, DynamicProvider, Provider, ReferencedCheck, StaticLoader, StaticProvider, TileGenerator,
};
use crate::store::{MetaValue, TileStore};
use crate::tile::{Tile, TileExt};
use crate::tiler::{RawRasterFile, Tiler, TilerHandle};

const PLACEHOLDER_SIZE: u32 = 256;

/// How a tile returned from [`TileManager::fetch`] was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Read directly from the store or a generator.
    Loaded,
    /// Synthesized by cropping and resizing a cached ancestor.
    Synthesized { from_level: i32 },
    /// No ancestor was cached; a neutral placeholder was returned and the
    /// real tile (or its nearest ancestor) has been requested.
    Placeholder,
}

fn make_is_referenced(purged_media: Arc<DashSet<String>>, all_purged: Arc<AtomicBool>) -> ReferencedCheck {
    Arc::new(move |media_id: &str| !all_purged.load(Ordering::Acquire) && !purged_media.contains(media_id))
}

/// The process-wide tile engine: one instance created at startup and passed
/// explicitly to callers, rather than reached for as global state.
pub struct TileManager {
    store: Arc<TileStore>,
    /// Provider-loaded tiles. Level-0 tiles are Immortal here and never
    /// displaced by synthesis traffic.
    permanent: Arc<TileCache>,
    /// `cut_tile` synthesis output only; bounded separately so a burst of
    /// zooming can never evict a real tile out of `permanent`.
    scratch: Arc<TileCache>,
    static_provider: StaticProvider,
    dynamic_providers: DashMap<String, DynamicProvider>,
    generators: DashMap<String, Arc<dyn TileGenerator>>,
    conversion_runner: ConversionRunner,
    purged_media: Arc<DashSet<String>>,
    all_purged: Arc<AtomicBool>,
    config: TileEngineConfig,
}

impl TileManager {
    /// Build a manager from `config`, spawning one `DynamicProvider` per
    /// registered generator plus the single `StaticProvider`.
    pub fn new(config: TileEngineConfig, generators: Vec<(String, Arc<dyn TileGenerator>)>) -> TileResult<Self> {
        let store = Arc::new(TileStore::new(config.resolved_root_dir())?);
        let permanent = Arc::new(TileCache::new(config.permanent_bytes() as usize));
        let scratch = Arc::new(TileCache::new(config.scratch_bytes() as usize));
        let purged_media = Arc::new(DashSet::new());
        let all_purged = Arc::new(AtomicBool::new(false));

        let static_provider = Provider::spawn_with_guard(
            "static-provider",
            StaticLoader::new(Arc::clone(&store)),
            Arc::clone(&permanent),
            make_is_referenced(Arc::clone(&purged_media), Arc::clone(&all_purged)),
        );

        let dynamic_providers = DashMap::new();
        let generator_table = DashMap::new();
        for (key, generator) in generators {
            let name = format!("dynamic-provider-{key}");
            let provider = Provider::spawn_with_guard(
                &name,
                DynamicLoader::new(Arc::clone(&generator)),
                Arc::clone(&permanent),
                make_is_referenced(Arc::clone(&purged_media), Arc::clone(&all_purged)),
            );
            dynamic_providers.insert(key.clone(), provider);
            generator_table.insert(key, generator);
        }

        let conversion_runner = ConversionRunner::new(config.conversion_workers);

        Ok(Self {
            store,
            permanent,
            scratch,
            static_provider,
            dynamic_providers,
            generators: generator_table,
            conversion_runner,
            purged_media,
            all_purged,
            config,
        })
    }

    /// Look up `id` without synthesizing or requesting anything. Checks the
    /// permanent (provider-loaded) cache first, then the scratch
    /// (previously synthesized) cache.
    pub fn peek(&self, id: &TileId) -> TileResult<Tile> {
        if id.media_kind() == MediaKind::Static && !self.store.is_tiled(&id.media_id) {
            return Err(TileEngineError::NotTiled(id.media_id.clone()));
        }
        match self.permanent.get(id) {
            Lookup::Tile(tile) => return Ok(tile),
            Lookup::Tombstone => return Err(TileEngineError::NotAvailable(id.to_string())),
            Lookup::Miss => {}
        }
        match self.scratch.get(id) {
            Lookup::Tile(tile) => Ok(tile),
            Lookup::Tombstone => Err(TileEngineError::NotAvailable(id.to_string())),
            Lookup::Miss => Err(TileEngineError::NotLoaded),
        }
    }

    /// Return a tile for `id` now: the cached tile if present, otherwise a
    /// synthesized approximation from the nearest cached ancestor, otherwise
    /// a placeholder — while requesting the real tile in the background.
    /// Never raises `NotLoaded` or `NotAvailable`; those collapse into synthesis.
    pub fn fetch(&self, id: &TileId) -> TileResult<(Tile, Provenance)> {
        match self.peek(id) {
            Ok(tile) => Ok((tile, Provenance::Loaded)),
            Err(TileEngineError::NotTiled(media_id)) => Err(TileEngineError::NotTiled(media_id)),
            Err(_) => {
                self.request(id);
                Ok(self.cut_tile(id))
            }
        }
    }

    /// Enqueue `id` with its provider, reactivating its media if it was
    /// previously purged.
    pub fn request(&self, id: &TileId) {
        self.purged_media.remove(&id.media_id);
        self.all_purged.store(false, Ordering::Release);
        match id.media_kind() {
            MediaKind::Static => self.static_provider.enqueue(id.clone()),
            MediaKind::Dynamic => {
                if let Some(key) = dynamic_generator_key(&id.media_id) {
                    if let Some(provider) = self.dynamic_providers.get(key) {
                        provider.enqueue(id.clone());
                    }
                }
            }
        }
    }

    /// Drop queued requests and cached tiles for `media_id`, or for every
    /// media if `None`. In-flight loads already past their provider's queue
    /// cannot be aborted; their result is discarded by the `ReferencedCheck`
    /// once it completes.
    pub fn purge(&self, media_id: Option<&str>) {
        log::debug!("purge requested for {media_id:?}");
        match media_id {
            Some(media_id) => {
                self.purged_media.insert(media_id.to_string());
                self.permanent.remove_matching(media_id);
                self.scratch.remove_matching(media_id);
                self.static_provider.purge(Some(media_id));
                for entry in self.dynamic_providers.iter() {
                    entry.value().purge(Some(media_id));
                }
            }
            None => {
                self.all_purged.store(true, Ordering::Release);
                self.permanent.clear();
                self.scratch.clear();
                self.static_provider.purge(None);
                for entry in self.dynamic_providers.iter() {
                    entry.value().purge(None);
                }
            }
        }
    }

    /// Signal all workers to stop accepting new requests, wait up to
    /// `timeout` for queued and in-flight work to drain, then (per
    /// `auto_cleanup`/`cleanup_on_shutdown`) run the cleanup subsystem once
    /// before returning. Persists no in-memory state.
    pub fn shutdown(&self, timeout: Duration) {
        log::info!("shutdown: pausing providers and waiting for drain");
        self.static_provider.pause();
        for entry in self.dynamic_providers.iter() {
            entry.value().pause();
        }

        let deadline = std::time::Instant::now() + timeout;
        loop {
            let pending = self.static_provider.pending_count()
                + self.dynamic_providers.iter().map(|e| e.value().pending_count()).sum::<usize>();
            if pending == 0 || std::time::Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        if self.config.auto_cleanup && self.config.cleanup_on_shutdown {
            match cleanup_old_tiles(&self.store, self.config.cleanup_age_days, false, self.config.collect_cleanup_stats) {
                Ok(report) => log::info!(
                    "shutdown cleanup: {} media deleted, {} kept",
                    report.deleted_media_count,
                    report.kept_media_count
                ),
                Err(e) => log::warn!("shutdown cleanup failed: {e}"),
            }
        }
    }

    pub fn is_tiled(&self, media_id: &str) -> bool {
        match media_kind(media_id) {
            MediaKind::Dynamic => true,
            MediaKind::Static => self.store.is_tiled(media_id),
        }
    }

    /// Read one metadata field. For dynamic media this reflects the
    /// registered generator's declared properties rather than a stored file.
    pub fn get_metadata(&self, media_id: &str, key: &str) -> TileResult<Option<MetaValue>> {
        match media_kind(media_id) {
            MediaKind::Static => {
                let meta = self.store.read_metadata(media_id)?;
                Ok(meta.get(key).cloned())
            }
            MediaKind::Dynamic => {
                let Some(gen_key) = dynamic_generator_key(media_id) else {
                    return Ok(None);
                };
                let Some(generator) = self.generators.get(gen_key) else {
                    return Ok(None);
                };
                Ok(match key {
                    "tilesize" => Some(MetaValue::Int(generator.tilesize() as i64)),
                    "file_ext" => Some(MetaValue::Str(generator.file_ext().as_str().to_string())),
                    "aspect_ratio" => Some(MetaValue::Float(generator.aspect_ratio())),
                    "max_level" => generator.max_level().map(|m| MetaValue::Int(m as i64)),
                    _ => None,
                })
            }
        }
    }

    /// Normalize `source_path` through the conversion pool, then build its
    /// pyramid. Blocks the calling thread until both stages finish or fail.
    pub fn convert_and_tile(&self, media_id: &str, job: Job, tilesize: u32, ext: TileExt) -> TileResult<()> {
        let output_path = job.output_path().to_path_buf();
        let handle = self.conversion_runner.submit(job);
        match handle.wait(Duration::from_secs(600)) {
            JobStatus::Done => {
                log::debug!("conversion done for {media_id}, building pyramid");
                let mut source = RawRasterFile::open(&output_path)?;
                let tiler_handle = TilerHandle::new();
                let tiler = Tiler::new(&self.store);
                tiler.run(media_id, &mut source, tilesize, ext, &tiler_handle)
            }
            JobStatus::Failed(msg) => {
                log::warn!("conversion failed for {media_id}: {msg}");
                Err(TileEngineError::ConversionFailed(msg))
            }
            JobStatus::Queued | JobStatus::Running => {
                log::warn!("conversion timed out for {media_id}");
                Err(TileEngineError::ConversionFailed("conversion did not finish within the allotted time".into()))
            }
        }
    }

    /// Build a tile for `id` from the nearest cached ancestor, falling back
    /// to a neutral placeholder when no ancestor is cached. Ancestors are
    /// looked up in `permanent` only — synthesizing from an already-synthetic
    /// tile would compound approximation error. The result is written to
    /// `scratch`, never `permanent`, so it can never displace a real tile.
    /// As a side effect, requests whatever was missing so a later call can
    /// resolve from cache.
    fn cut_tile(&self, id: &TileId) -> (Tile, Provenance) {
        if id.level < 0 {
            let overview = id.overview();
            if let Lookup::Tile(ancestor) = self.permanent.get(&overview) {
                let factor = 1u64 << (-id.level);
                let new_dim = ((ancestor.width() as u64 / factor).max(1)) as u32;
                let resized = ancestor.resize(new_dim, new_dim);
                self.scratch.insert(id.clone(), resized.clone(), EvictionClass::Mortal);
                return (resized, Provenance::Synthesized { from_level: 0 });
            }
            self.request(&overview);
            return (self.placeholder(), Provenance::Placeholder);
        }

        let mut missed = Vec::new();
        let mut current = id.clone();
        while let Some(parent) = current.parent() {
            if let Lookup::Tile(ancestor) = self.permanent.get(&parent) {
                let factor = 1u64 << (id.level - parent.level);
                let tilesize = ancestor.width();
                let sub = ((tilesize as u64 / factor).max(1)) as u32;
                let ox = (id.col as u64 % factor) as u32 * sub;
                let oy = (id.row as u64 % factor) as u32 * sub;
                let cropped = ancestor.crop(ox, oy, ox + sub, oy + sub);
                let resized = cropped.resize(tilesize, tilesize);

                self.request(id);
                for m in &missed {
                    self.request(m);
                }
                self.scratch.insert(id.clone(), resized.clone(), EvictionClass::Mortal);
                return (resized, Provenance::Synthesized { from_level: parent.level });
            }
            missed.push(parent.clone());
            current = parent;
        }

        self.request(&id.overview());
        (self.placeholder(), Provenance::Placeholder)
    }

    fn placeholder(&self) -> Tile {
        Tile::solid(PLACEHOLDER_SIZE, [128, 128, 128])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EvictionClass;
    use std::time::Duration as StdDuration;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn config_in(dir: &std::path::Path) -> TileEngineConfig {
        TileEngineConfig {
            root_dir: Some(dir.to_path_buf()),
            cache_total_bytes: 10 * 1024 * 1024,
            conversion_workers: 1,
            ..Default::default()
        }
    }

    struct SolidGenerator {
        tilesize: u32,
    }

    impl TileGenerator for SolidGenerator {
        fn tilesize(&self) -> u32 {
            self.tilesize
        }
        fn file_ext(&self) -> TileExt {
            TileExt::Png
        }
        fn aspect_ratio(&self) -> f64 {
            1.0
        }
        fn max_level(&self) -> Option<u32> {
            Some(3)
        }
        fn generate(&self, _level: u32, _row: u32, _col: u32) -> TileResult<Tile> {
            Ok(Tile::solid(self.tilesize, [3, 3, 3]))
        }
    }

    fn wait_until(f: impl Fn() -> bool, timeout: StdDuration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if f() {
                return true;
            }
            std::thread::sleep(StdDuration::from_millis(5));
        }
        f()
    }

    #[test]
    fn peek_on_untiled_static_media_is_not_tiled() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TileManager::new(config_in(dir.path()), vec![]).unwrap();
        let err = manager.peek(&TileId::new("missing.tif", 0, 0, 0)).unwrap_err();
        assert!(matches!(err, TileEngineError::NotTiled(_)));
    }

    #[test]
    fn fetch_never_raises_not_loaded_or_not_available() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TileManager::new(
            config_in(dir.path()),
            vec![("checker".to_string(), Arc::new(SolidGenerator { tilesize: 64 }) as Arc<dyn TileGenerator>)],
        )
        .unwrap();

        let id = TileId::new("dynamic:checker", 2, 1, 1);
        let (_, provenance) = manager.fetch(&id).unwrap();
        assert_eq!(provenance, Provenance::Placeholder);
    }

    #[test]
    fn fetch_synthesizes_from_cached_overview() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TileManager::new(
            config_in(dir.path()),
            vec![("checker".to_string(), Arc::new(SolidGenerator { tilesize: 64 }) as Arc<dyn TileGenerator>)],
        )
        .unwrap();

        let overview = TileId::new("dynamic:checker", 0, 0, 0);
        manager.request(&overview);
        assert!(wait_until(|| manager.permanent.contains(&overview), StdDuration::from_secs(2)));

        let deeper = TileId::new("dynamic:checker", 1, 0, 0);
        let (tile, provenance) = manager.fetch(&deeper).unwrap();
        assert_eq!(tile.width(), 64);
        assert_eq!(provenance, Provenance::Synthesized { from_level: 0 });
    }

    #[test]
    fn cut_tile_negative_level_resizes_smaller_than_tilesize() {
        use crate::store::{MetaValue as MV, TileMetadata};

        let dir = tempfile::tempdir().unwrap();
        let manager = TileManager::new(config_in(dir.path()), vec![]).unwrap();

        let mut meta = TileMetadata::new();
        meta.set("width", MV::Int(256));
        meta.set("height", MV::Int(256));
        meta.set("tilesize", MV::Int(256));
        meta.set("max_level", MV::Int(0));
        meta.set("file_ext", MV::Str("png".into()));
        meta.set("tiled", MV::Bool(true));
        manager.store.write_metadata("m", &meta).unwrap();

        let overview = TileId::new("m", 0, 0, 0);
        manager
            .permanent
            .insert(overview.clone(), Tile::solid(256, [1, 1, 1]), EvictionClass::Immortal);

        let zoomed_out = TileId::new("m", -2, 0, 0);
        let (tile, provenance) = manager.fetch(&zoomed_out).unwrap();
        assert_eq!(tile.width(), 64);
        assert_eq!(provenance, Provenance::Synthesized { from_level: 0 });
    }

    #[test]
    fn purge_then_request_reactivates_media() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let manager = TileManager::new(
            config_in(dir.path()),
            vec![("checker".to_string(), Arc::new(SolidGenerator { tilesize: 32 }) as Arc<dyn TileGenerator>)],
        )
        .unwrap();

        let id = TileId::new("dynamic:checker", 0, 0, 0);
        manager.request(&id);
        assert!(wait_until(|| manager.permanent.contains(&id), StdDuration::from_secs(2)));

        manager.purge(Some("dynamic:checker"));
        assert!(!manager.permanent.contains(&id));

        manager.request(&id);
        assert!(wait_until(|| manager.permanent.contains(&id), StdDuration::from_secs(2)));
    }

    #[test]
    fn is_tiled_is_always_true_for_dynamic_media() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TileManager::new(config_in(dir.path()), vec![]).unwrap();
        assert!(manager.is_tiled("dynamic:anything"));
        assert!(!manager.is_tiled("/slides/a.tif"));
    }

    #[test]
    fn get_metadata_reads_generator_declarations_for_dynamic_media() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TileManager::new(
            config_in(dir.path()),
            vec![("checker".to_string(), Arc::new(SolidGenerator { tilesize: 128 }) as Arc<dyn TileGenerator>)],
        )
        .unwrap();

        let value = manager.get_metadata("dynamic:checker", "tilesize").unwrap();
        assert_eq!(value, Some(MetaValue::Int(128)));
        assert_eq!(manager.get_metadata("dynamic:checker", "nonexistent_key").unwrap(), None);
    }

    #[test]
    fn synthesized_tiles_land_in_scratch_not_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TileManager::new(
            config_in(dir.path()),
            vec![("checker".to_string(), Arc::new(SolidGenerator { tilesize: 64 }) as Arc<dyn TileGenerator>)],
        )
        .unwrap();

        let overview = TileId::new("dynamic:checker", 0, 0, 0);
        manager.request(&overview);
        assert!(wait_until(|| manager.permanent.contains(&overview), StdDuration::from_secs(2)));

        let deeper = TileId::new("dynamic:checker", 1, 0, 0);
        manager.fetch(&deeper).unwrap();
        assert!(manager.scratch.contains(&deeper));
        assert!(!manager.permanent.contains(&deeper));
    }

    #[test]
    fn shutdown_drains_pending_queue_and_runs_cleanup() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.auto_cleanup = true;
        config.cleanup_on_shutdown = true;
        config.cleanup_age_days = 3;
        let manager = TileManager::new(
            config,
            vec![("checker".to_string(), Arc::new(SolidGenerator { tilesize: 32 }) as Arc<dyn TileGenerator>)],
        )
        .unwrap();

        let id = TileId::new("dynamic:checker", 0, 0, 0);
        manager.request(&id);
        assert!(wait_until(|| manager.permanent.contains(&id), StdDuration::from_secs(2)));

        manager.shutdown(StdDuration::from_secs(2));
        assert_eq!(manager.static_provider.pending_count(), 0);
    }
}
