//! Streaming pyramid construction: scanlines in, tile files and committed
//! metadata out.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::{TileEngineError, TileResult};
use crate::ids::TileId;
use crate::store::{MetaValue, TileMetadata, TileStore};
use crate::tile::{Tile, TileExt};

/// A decoded source raster, read one scanline at a time. Decoding the
/// original source format is explicitly out of scope here; callers supply an
/// implementation over whatever `RasterDecoder` they have on hand.
pub trait RasterSource {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    /// Yield the next row as `width * 3` RGB8 bytes, or `None` at EOF.
    fn next_row(&mut self) -> TileResult<Option<Vec<u8>>>;
}

/// Progress and cancellation shared between a `Tiler::run` call and its caller.
#[derive(Default)]
pub struct TilerHandle {
    produced_tiles: AtomicU64,
    total_tiles: AtomicU64,
    cancelled: AtomicBool,
}

impl TilerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Fraction of total tiles produced so far, in `[0,1]`. `0.0` before the
    /// total tile count is known.
    pub fn progress(&self) -> f32 {
        let total = self.total_tiles.load(Ordering::Acquire);
        if total == 0 {
            return 0.0;
        }
        self.produced_tiles.load(Ordering::Acquire) as f32 / total as f32
    }
}

/// `max_level = ceil(log2(max(W,H) / T))`, floored at 0.
pub fn max_level_for(width: u32, height: u32, tilesize: u32) -> u32 {
    let longest = width.max(height).max(1);
    if longest <= tilesize {
        return 0;
    }
    let ratio = longest as f64 / tilesize as f64;
    ratio.log2().ceil() as u32
}

/// Tile grid dimensions `(cols, rows)` at level `level` of a pyramid whose
/// base level is `max_level`.
fn level_dims(width: u32, height: u32, tilesize: u32, max_level: u32, level: u32) -> (u32, u32) {
    let shift = max_level - level;
    let effective_tile = (tilesize as u64) << shift;
    let cols = width.div_ceil(effective_tile as u32).max(1);
    let rows = height.div_ceil(effective_tile as u32).max(1);
    (cols, rows)
}

fn total_tile_count(width: u32, height: u32, tilesize: u32, max_level: u32) -> u64 {
    (0..=max_level)
        .map(|l| {
            let (cols, rows) = level_dims(width, height, tilesize, max_level, l);
            cols as u64 * rows as u64
        })
        .sum()
}

/// Streaming pyramid builder.
pub struct Tiler<'a> {
    store: &'a TileStore,
}

impl<'a> Tiler<'a> {
    pub fn new(store: &'a TileStore) -> Self {
        Self { store }
    }

    /// Build the full pyramid for `media_id` from `source`, then commit
    /// metadata atomically. On any failure or cancellation, all tiles
    /// written for this media_id are removed and the media stays untiled.
    pub fn run(
        &self,
        media_id: &str,
        source: &mut dyn RasterSource,
        tilesize: u32,
        ext: TileExt,
        handle: &TilerHandle,
    ) -> TileResult<()> {
        match self.run_inner(media_id, source, tilesize, ext, handle) {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = self.store.delete_media(media_id);
                Err(e)
            }
        }
    }

    fn run_inner(
        &self,
        media_id: &str,
        source: &mut dyn RasterSource,
        tilesize: u32,
        ext: TileExt,
        handle: &TilerHandle,
    ) -> TileResult<()> {
        let width = source.width();
        let height = source.height();
        let max_level = max_level_for(width, height, tilesize);
        handle
            .total_tiles
            .store(total_tile_count(width, height, tilesize, max_level), Ordering::Release);

        self.build_base_level(media_id, source, width, height, tilesize, max_level, ext, handle)?;

        for level in (0..max_level).rev() {
            if handle.is_cancelled() {
                return Err(TileEngineError::Cancelled);
            }
            self.reduce_level(media_id, width, height, tilesize, max_level, level, ext, handle)?;
        }

        let mut metadata = TileMetadata::new();
        metadata.set("width", MetaValue::Int(width as i64));
        metadata.set("height", MetaValue::Int(height as i64));
        metadata.set("tilesize", MetaValue::Int(tilesize as i64));
        metadata.set("max_level", MetaValue::Int(max_level as i64));
        metadata.set("file_ext", MetaValue::Str(ext.as_str().to_string()));
        metadata.set("aspect_ratio", MetaValue::Float(width as f64 / height.max(1) as f64));
        metadata.set("tiled", MetaValue::Bool(true));
        self.store.write_metadata(media_id, &metadata)?;

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn build_base_level(
        &self,
        media_id: &str,
        source: &mut dyn RasterSource,
        width: u32,
        height: u32,
        tilesize: u32,
        max_level: u32,
        ext: TileExt,
        handle: &TilerHandle,
    ) -> TileResult<()> {
        let (cols, rows) = level_dims(width, height, tilesize, max_level, max_level);
        let mut row_group_index = 0u32;

        while row_group_index < rows {
            if handle.is_cancelled() {
                return Err(TileEngineError::Cancelled);
            }

            let mut band = vec![0u8; (tilesize as usize) * (width as usize) * 3];
            for local_row in 0..tilesize {
                let global_row = row_group_index * tilesize + local_row;
                if global_row >= height {
                    break; // remaining rows in the band stay black padding
                }
                let scanline = source.next_row()?.ok_or_else(|| {
                    TileEngineError::Decode(format!("short read at row {global_row}"))
                })?;
                let dest_start = local_row as usize * width as usize * 3;
                let copy_len = scanline.len().min(width as usize * 3);
                band[dest_start..dest_start + copy_len].copy_from_slice(&scanline[..copy_len]);
            }

            for col in 0..cols {
                let x0 = col * tilesize;
                let tile = band_to_tile(&band, width, tilesize, x0);
                let id = TileId::new(media_id, max_level as i32, row_group_index, col);
                self.store.save_tile(&id, &tile, ext)?;
                handle.produced_tiles.fetch_add(1, Ordering::Release);
            }

            row_group_index += 1;
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn reduce_level(
        &self,
        media_id: &str,
        width: u32,
        height: u32,
        tilesize: u32,
        max_level: u32,
        level: u32,
        ext: TileExt,
        handle: &TilerHandle,
    ) -> TileResult<()> {
        let (cols, rows) = level_dims(width, height, tilesize, max_level, level);
        let (child_cols, child_rows) = level_dims(width, height, tilesize, max_level, level + 1);
        let black = Tile::solid(tilesize, [0, 0, 0]);

        for row in 0..rows {
            if handle.is_cancelled() {
                return Err(TileEngineError::Cancelled);
            }
            for col in 0..cols {
                let load_child = |cr: u32, cc: u32| -> TileResult<Tile> {
                    if cr >= child_rows || cc >= child_cols {
                        return Ok(black.clone());
                    }
                    let child_id = TileId::new(media_id, (level + 1) as i32, cr, cc);
                    self.store.load_tile(&child_id, ext)
                };

                let tl = load_child(row * 2, col * 2)?;
                let tr = load_child(row * 2, col * 2 + 1)?;
                let bl = load_child(row * 2 + 1, col * 2)?;
                let br = load_child(row * 2 + 1, col * 2 + 1)?;

                let merged = Tile::merge(&tl, &tr, &bl, &br);
                let id = TileId::new(media_id, level as i32, row, col);
                self.store.save_tile(&id, &merged, ext)?;
                handle.produced_tiles.fetch_add(1, Ordering::Release);
            }
        }

        Ok(())
    }
}

/// A `RasterSource` over the normalized output of `ConversionRunner`: an
/// 8-byte little-endian `(width, height)` header followed by raw RGB8
/// scanlines. This is the "streamable raster" handed to `Tiler` once a
/// source asset has been normalized.
pub struct RawRasterFile {
    reader: BufReader<File>,
    width: u32,
    height: u32,
}

impl RawRasterFile {
    pub fn open(path: &Path) -> TileResult<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut header = [0u8; 8];
        reader.read_exact(&mut header)?;
        let width = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let height = u32::from_le_bytes(header[4..8].try_into().unwrap());
        Ok(Self { reader, width, height })
    }
}

impl RasterSource for RawRasterFile {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn next_row(&mut self) -> TileResult<Option<Vec<u8>>> {
        let mut row = vec![0u8; self.width as usize * 3];
        match self.reader.read_exact(&mut row) {
            Ok(()) => Ok(Some(row)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(TileEngineError::Io(e)),
        }
    }
}

/// Extract one `tilesize`-wide column band starting at `x0` from a
/// `tilesize`-tall RGB band, padding black where the band or source are
/// narrower than a full tile.
fn band_to_tile(band: &[u8], source_width: u32, tilesize: u32, x0: u32) -> Tile {
    use image::{ImageBuffer, Rgb};
    let buf = ImageBuffer::from_fn(tilesize, tilesize, |x, y| {
        let sx = x0 + x;
        if sx >= source_width {
            return Rgb([0, 0, 0]);
        }
        let idx = (y as usize * source_width as usize + sx as usize) * 3;
        if idx + 2 >= band.len() {
            return Rgb([0, 0, 0]);
        }
        Rgb([band[idx], band[idx + 1], band[idx + 2]])
    });
    Tile::from_buffer(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SolidSource {
        width: u32,
        height: u32,
        rows_emitted: u32,
        color: [u8; 3],
    }

    impl RasterSource for SolidSource {
        fn width(&self) -> u32 {
            self.width
        }
        fn height(&self) -> u32 {
            self.height
        }
        fn next_row(&mut self) -> TileResult<Option<Vec<u8>>> {
            if self.rows_emitted >= self.height {
                return Ok(None);
            }
            self.rows_emitted += 1;
            Ok(Some(self.color.repeat(self.width as usize)))
        }
    }

    #[test]
    fn max_level_is_zero_when_within_one_tile() {
        assert_eq!(max_level_for(200, 200, 256), 0);
        assert_eq!(max_level_for(256, 256, 256), 0);
    }

    #[test]
    fn max_level_boundary_at_tilesize_plus_one() {
        assert_eq!(max_level_for(257, 100, 256), 1);
        assert_eq!(max_level_for(512, 100, 256), 1);
    }

    #[test]
    fn level_dims_matches_ceil_division_formula() {
        // 512x512 at T=256: max_level=1. Level 1: 2x2, level 0: 1x1.
        assert_eq!(level_dims(512, 512, 256, 1, 1), (2, 2));
        assert_eq!(level_dims(512, 512, 256, 1, 0), (1, 1));
    }

    #[test]
    fn run_produces_expected_files_for_512_square_input() {
        let dir = tempfile::tempdir().unwrap();
        let store = TileStore::new(dir.path()).unwrap();
        let mut source = SolidSource {
            width: 512,
            height: 512,
            rows_emitted: 0,
            color: [10, 20, 30],
        };
        let handle = TilerHandle::new();
        let tiler = Tiler::new(&store);
        tiler.run("slide-a", &mut source, 256, TileExt::Jpg, &handle).unwrap();

        let meta = store.read_metadata("slide-a").unwrap();
        assert_eq!(meta.width().unwrap(), 512);
        assert_eq!(meta.max_level().unwrap(), 1);
        assert!(meta.tiled());

        for (row, col) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
            let id = TileId::new("slide-a", 1, row, col);
            assert!(store.load_tile(&id, TileExt::Jpg).is_ok());
        }
        let overview = TileId::new("slide-a", 0, 0, 0);
        assert!(store.load_tile(&overview, TileExt::Jpg).is_ok());
    }

    #[test]
    fn cancellation_removes_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let store = TileStore::new(dir.path()).unwrap();
        let mut source = SolidSource {
            width: 512,
            height: 512,
            rows_emitted: 0,
            color: [1, 1, 1],
        };
        let handle = TilerHandle::new();
        handle.cancel();
        let tiler = Tiler::new(&store);
        let result = tiler.run("slide-b", &mut source, 256, TileExt::Png, &handle);
        assert!(result.is_err());
        assert!(!store.is_tiled("slide-b"));
    }

    #[test]
    fn raw_raster_file_reads_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("normalized.raw");
        let mut content = Vec::new();
        content.extend_from_slice(&4u32.to_le_bytes());
        content.extend_from_slice(&2u32.to_le_bytes());
        content.extend(std::iter::repeat(9u8).take(4 * 3 * 2));
        std::fs::write(&path, content).unwrap();

        let mut source = RawRasterFile::open(&path).unwrap();
        assert_eq!(source.width(), 4);
        assert_eq!(source.height(), 2);
        assert!(source.next_row().unwrap().is_some());
        assert!(source.next_row().unwrap().is_some());
        assert!(source.next_row().unwrap().is_none());
    }

    #[test]
    fn rerun_on_same_media_id_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = TileStore::new(dir.path()).unwrap();
        let handle = TilerHandle::new();
        let tiler = Tiler::new(&store);

        for _ in 0..2 {
            let mut source = SolidSource {
                width: 300,
                height: 300,
                rows_emitted: 0,
                color: [5, 5, 5],
            };
            tiler.run("slide-c", &mut source, 256, TileExt::Png, &handle).unwrap();
        }

        let meta = store.read_metadata("slide-c").unwrap();
        assert!(meta.tiled());
    }
}
