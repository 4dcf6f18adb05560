//! Content-addressed on-disk tile and metadata repository.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use sha1::{Digest, Sha1};

use crate::error::{TileEngineError, TileResult};
use crate::ids::TileId;
use crate::tile::{Tile, TileExt};

/// A metadata value together with its TSV typetag.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    Int(i64),
    Str(String),
    Float(f64),
    Bool(bool),
}

impl MetaValue {
    fn typetag(&self) -> &'static str {
        match self {
            MetaValue::Int(_) => "int",
            MetaValue::Str(_) => "str",
            MetaValue::Float(_) => "float",
            MetaValue::Bool(_) => "bool",
        }
    }

    fn render(&self) -> String {
        match self {
            MetaValue::Int(v) => v.to_string(),
            MetaValue::Str(v) => v.clone(),
            MetaValue::Float(v) => v.to_string(),
            MetaValue::Bool(v) => v.to_string(),
        }
    }

    fn parse(typetag: &str, raw: &str) -> TileResult<MetaValue> {
        match typetag {
            "int" => raw
                .parse::<i64>()
                .map(MetaValue::Int)
                .map_err(|e| TileEngineError::Validation(e.to_string())),
            "str" => Ok(MetaValue::Str(raw.to_string())),
            "float" => raw
                .parse::<f64>()
                .map(MetaValue::Float)
                .map_err(|e| TileEngineError::Validation(e.to_string())),
            "bool" => raw
                .parse::<bool>()
                .map(MetaValue::Bool)
                .map_err(|e| TileEngineError::Validation(e.to_string())),
            other => Err(TileEngineError::Validation(format!("unknown typetag '{other}'"))),
        }
    }
}

/// Metadata record for one media_id. Unknown keys round-trip on rewrite.
#[derive(Debug, Clone, Default)]
pub struct TileMetadata {
    fields: BTreeMap<String, MetaValue>,
}

impl TileMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: MetaValue) {
        self.fields.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.fields.get(key)
    }

    pub fn width(&self) -> TileResult<u32> {
        self.require_int("width")
    }

    pub fn height(&self) -> TileResult<u32> {
        self.require_int("height")
    }

    pub fn tilesize(&self) -> TileResult<u32> {
        self.require_int("tilesize")
    }

    pub fn max_level(&self) -> TileResult<u32> {
        self.require_int("max_level")
    }

    pub fn file_ext(&self) -> TileResult<TileExt> {
        match self.fields.get("file_ext") {
            Some(MetaValue::Str(s)) => {
                TileExt::parse(s).ok_or_else(|| TileEngineError::Validation(format!("unknown file_ext '{s}'")))
            }
            _ => Err(TileEngineError::Validation("missing file_ext".into())),
        }
    }

    pub fn tiled(&self) -> bool {
        matches!(self.fields.get("tiled"), Some(MetaValue::Bool(true)))
    }

    fn require_int(&self, key: &str) -> TileResult<u32> {
        match self.fields.get(key) {
            Some(MetaValue::Int(v)) if *v >= 0 => Ok(*v as u32),
            Some(MetaValue::Int(_)) => Err(TileEngineError::Validation(format!("'{key}' is negative"))),
            _ => Err(TileEngineError::Validation(format!("missing '{key}'"))),
        }
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.fields {
            out.push_str(key);
            out.push('\t');
            out.push_str(&value.render());
            out.push('\t');
            out.push_str(value.typetag());
            out.push('\n');
        }
        out
    }

    fn parse(content: &str) -> TileResult<TileMetadata> {
        let mut fields = BTreeMap::new();
        for line in content.lines() {
            if line.is_empty() {
                continue;
            }
            let mut parts = line.splitn(3, '\t');
            let key = parts
                .next()
                .ok_or_else(|| TileEngineError::Validation("malformed metadata line".into()))?;
            let raw = parts
                .next()
                .ok_or_else(|| TileEngineError::Validation("malformed metadata line".into()))?;
            let typetag = parts
                .next()
                .ok_or_else(|| TileEngineError::Validation("malformed metadata line".into()))?;
            fields.insert(key.to_string(), MetaValue::parse(typetag, raw)?);
        }
        Ok(TileMetadata { fields })
    }
}

/// Aggregate statistics over the whole tile store.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub media_count: usize,
    pub file_count: usize,
    pub bytes: u64,
}

/// Content-addressed filesystem wrapper: one directory per media_id, hashed
/// by SHA-1 so arbitrary media ids (including paths) are safe directory names.
///
/// Writes are serialized through a process-wide mutex; reads are lock-free
/// with respect to other readers.
pub struct TileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl TileStore {
    pub fn new(root: impl Into<PathBuf>) -> TileResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn media_path(&self, media_id: &str) -> PathBuf {
        self.root.join(hash_media_id(media_id))
    }

    pub fn tile_path(&self, tile_id: &TileId, ext: TileExt) -> PathBuf {
        let level = tile_id.level.max(0) as u32;
        self.media_path(&tile_id.media_id).join(format!("{level:02}")).join(format!(
            "{:02}_{:06}_{:06}.{}",
            level,
            tile_id.row,
            tile_id.col,
            ext.as_str()
        ))
    }

    fn metadata_path(&self, media_id: &str) -> PathBuf {
        self.media_path(media_id).join("metadata")
    }

    pub fn is_tiled(&self, media_id: &str) -> bool {
        self.read_metadata(media_id).map(|m| m.tiled()).unwrap_or(false)
    }

    pub fn read_metadata(&self, media_id: &str) -> TileResult<TileMetadata> {
        let path = self.metadata_path(media_id);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TileEngineError::NotTiled(media_id.to_string())
            } else {
                TileEngineError::Io(e)
            }
        })?;
        TileMetadata::parse(&content)
    }

    /// Write metadata atomically: write to a temp file, then rename.
    /// Readers must never observe a metadata write mid-flight.
    pub fn write_metadata(&self, media_id: &str, metadata: &TileMetadata) -> TileResult<()> {
        let _guard = self.write_lock.lock();
        let dir = self.media_path(media_id);
        std::fs::create_dir_all(&dir)?;
        let final_path = self.metadata_path(media_id);
        let tmp_path = dir.join("metadata.tmp");
        std::fs::write(&tmp_path, metadata.render())?;
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    pub fn load_tile(&self, tile_id: &TileId, ext: TileExt) -> TileResult<Tile> {
        let path = self.tile_path(tile_id, ext);
        Tile::decode(&path)
    }

    pub fn save_tile(&self, tile_id: &TileId, tile: &Tile, ext: TileExt) -> TileResult<()> {
        let _guard = self.write_lock.lock();
        let path = self.tile_path(tile_id, ext);
        tile.encode(&path, ext)
    }

    pub fn delete_media(&self, media_id: &str) -> TileResult<()> {
        self.delete_media_dir(&hash_media_id(media_id))
    }

    /// Delete a media directory by its hashed directory name directly, for
    /// callers (e.g. age-based cleanup) that only have the hash, having
    /// discovered it by walking the store root rather than knowing the
    /// original media_id.
    pub fn delete_media_dir(&self, dir_name: &str) -> TileResult<()> {
        let _guard = self.write_lock.lock();
        let dir = self.root.join(dir_name);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TileEngineError::Io(e)),
        }
    }

    pub fn stats(&self) -> TileResult<StoreStats> {
        let mut stats = StoreStats::default();
        if !self.root.exists() {
            return Ok(stats);
        }
        for media_dir in std::fs::read_dir(&self.root)? {
            let media_dir = media_dir?;
            if !media_dir.file_type()?.is_dir() {
                continue;
            }
            stats.media_count += 1;
            stats.bytes += dir_size(&media_dir.path(), &mut stats.file_count)?;
        }
        Ok(stats)
    }
}

fn dir_size(dir: &Path, file_count: &mut usize) -> TileResult<u64> {
    let mut total = 0u64;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let ty = entry.file_type()?;
        if ty.is_dir() {
            total += dir_size(&entry.path(), file_count)?;
        } else {
            *file_count += 1;
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

/// Stable, content-free hex hash of a media_id, used as its directory name.
pub fn hash_media_id(media_id: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(media_id.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
