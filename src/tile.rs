//! In-memory pixel buffer with crop/resize/merge/encode operations.

use std::path::Path;

use image::{ImageBuffer, Rgb, RgbImage};

use crate::error::{TileEngineError, TileResult};

/// Encoded file extension for a tile on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileExt {
    Jpg,
    Png,
}

impl TileExt {
    pub fn as_str(&self) -> &'static str {
        match self {
            TileExt::Jpg => "jpg",
            TileExt::Png => "png",
        }
    }

    pub fn parse(s: &str) -> Option<TileExt> {
        match s {
            "jpg" | "jpeg" => Some(TileExt::Jpg),
            "png" => Some(TileExt::Png),
            _ => None,
        }
    }

    fn image_format(&self) -> image::ImageFormat {
        match self {
            TileExt::Jpg => image::ImageFormat::Jpeg,
            TileExt::Png => image::ImageFormat::Png,
        }
    }
}

/// An owned square RGB pixel buffer. Value-semantic: cloning copies pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    buf: RgbImage,
}

impl Tile {
    /// A tile filled with a single solid color, used for placeholders.
    pub fn solid(size: u32, color: [u8; 3]) -> Self {
        let buf = ImageBuffer::from_pixel(size, size, Rgb(color));
        Self { buf }
    }

    pub fn from_buffer(buf: RgbImage) -> Self {
        Self { buf }
    }

    pub fn width(&self) -> u32 {
        self.buf.width()
    }

    pub fn height(&self) -> u32 {
        self.buf.height()
    }

    pub fn as_raw(&self) -> &[u8] {
        self.buf.as_raw()
    }

    /// Crop the subregion `(x0,y0,x1,y1)` (exclusive end), producing a new tile.
    /// The region is clamped to the tile's bounds; anything outside is padded black.
    pub fn crop(&self, x0: u32, y0: u32, x1: u32, y1: u32) -> Tile {
        let w = x1.saturating_sub(x0);
        let h = y1.saturating_sub(y0);
        let mut out = ImageBuffer::from_pixel(w, h, Rgb([0, 0, 0]));
        for y in 0..h {
            let sy = y0 + y;
            if sy >= self.buf.height() {
                continue;
            }
            for x in 0..w {
                let sx = x0 + x;
                if sx >= self.buf.width() {
                    continue;
                }
                out.put_pixel(x, y, *self.buf.get_pixel(sx, sy));
            }
        }
        Tile { buf: out }
    }

    /// Resize to `(w,h)` using a bilinear filter.
    pub fn resize(&self, w: u32, h: u32) -> Tile {
        let resized = image::imageops::resize(&self.buf, w, h, image::imageops::FilterType::Triangle);
        Tile { buf: resized }
    }

    /// Stitch a 2x2 grid of equally sized tiles into one tile of the same
    /// dimension, downscaling each quadrant to half size.
    pub fn merge(tl: &Tile, tr: &Tile, bl: &Tile, br: &Tile) -> Tile {
        let size = tl.width();
        let half = size / 2;
        let mut out = ImageBuffer::from_pixel(size, size, Rgb([0, 0, 0]));

        let quadrants = [(tl, 0, 0), (tr, half, 0), (bl, 0, half), (br, half, half)];
        for (tile, ox, oy) in quadrants {
            let small = image::imageops::resize(&tile.buf, half, half, image::imageops::FilterType::Triangle);
            image::imageops::replace(&mut out, &small, ox as i64, oy as i64);
        }

        Tile { buf: out }
    }

    /// Write the tile to `path` using the encoder implied by `ext`.
    pub fn encode(&self, path: &Path, ext: TileExt) -> TileResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.buf
            .save_with_format(path, ext.image_format())
            .map_err(|e| TileEngineError::Decode(e.to_string()))
    }

    /// Read a tile from `path`.
    pub fn decode(path: &Path) -> TileResult<Tile> {
        let img = image::open(path).map_err(|e| TileEngineError::Decode(e.to_string()))?;
        Ok(Tile { buf: img.to_rgb8() })
    }

    /// Decode from an in-memory byte buffer, given the format hint.
    pub fn decode_bytes(bytes: &[u8], ext: TileExt) -> TileResult<Tile> {
        let img = image::load_from_memory_with_format(bytes, ext.image_format())
            .map_err(|e| TileEngineError::Decode(e.to_string()))?;
        Ok(Tile { buf: img.to_rgb8() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkerboard(size: u32) -> Tile {
        let buf = ImageBuffer::from_fn(size, size, |x, y| {
            if (x / 8 + y / 8) % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        });
        Tile { buf }
    }

    #[test]
    fn solid_tile_has_requested_size_and_color() {
        let t = Tile::solid(64, [10, 20, 30]);
        assert_eq!(t.width(), 64);
        assert_eq!(t.height(), 64);
        assert_eq!(t.as_raw()[0..3], [10, 20, 30]);
    }

    #[test]
    fn crop_extracts_subregion() {
        let t = checkerboard(32);
        let cropped = t.crop(0, 0, 16, 16);
        assert_eq!(cropped.width(), 16);
        assert_eq!(cropped.height(), 16);
    }

    #[test]
    fn crop_beyond_bounds_pads_black() {
        let t = Tile::solid(16, [200, 200, 200]);
        let cropped = t.crop(8, 8, 24, 24);
        assert_eq!(cropped.width(), 16);
        // bottom-right quadrant is outside the source, must be black
        assert_eq!(cropped.as_raw()[(15 * 16 + 15) * 3..][..3], [0, 0, 0]);
        // top-left quadrant is inside the source, must be the solid color
        assert_eq!(cropped.as_raw()[0..3], [200, 200, 200]);
    }

    #[test]
    fn resize_changes_dimensions() {
        let t = Tile::solid(256, [1, 2, 3]);
        let resized = t.resize(64, 64);
        assert_eq!(resized.width(), 64);
        assert_eq!(resized.height(), 64);
    }

    #[test]
    fn merge_produces_same_size_as_inputs() {
        let tl = Tile::solid(32, [255, 0, 0]);
        let tr = Tile::solid(32, [0, 255, 0]);
        let bl = Tile::solid(32, [0, 0, 255]);
        let br = Tile::solid(32, [255, 255, 0]);
        let merged = Tile::merge(&tl, &tr, &bl, &br);
        assert_eq!(merged.width(), 32);
        assert_eq!(merged.height(), 32);
        // top-left quadrant should reflect tl's color
        assert_eq!(merged.as_raw()[0..3], [255, 0, 0]);
    }

    #[test]
    fn png_round_trip_is_bit_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.png");
        let t = checkerboard(32);
        t.encode(&path, TileExt::Png).unwrap();
        let back = Tile::decode(&path).unwrap();
        assert_eq!(t, back);
    }

    #[test]
    fn jpeg_round_trip_preserves_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jpg");
        let t = checkerboard(32);
        t.encode(&path, TileExt::Jpg).unwrap();
        let back = Tile::decode(&path).unwrap();
        assert_eq!(back.width(), t.width());
        assert_eq!(back.height(), t.height());
    }

    #[test]
    fn ext_parse_roundtrips() {
        assert_eq!(TileExt::parse("jpg"), Some(TileExt::Jpg));
        assert_eq!(TileExt::parse("png"), Some(TileExt::Png));
        assert_eq!(TileExt::parse("gif"), None);
    }
}
