//! Tile identity and media-kind routing.

use std::fmt;

/// Reserved media_id prefix denoting procedurally generated content.
pub const DYNAMIC_PREFIX: &str = "dynamic:";

/// The media kind a `media_id` resolves to; governs provider routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    /// Persisted pyramid served from `TileStore`.
    Static,
    /// Procedurally generated content, served from a registered generator.
    Dynamic,
}

/// Classify a `media_id` by its prefix.
pub fn media_kind(media_id: &str) -> MediaKind {
    if media_id.starts_with(DYNAMIC_PREFIX) {
        MediaKind::Dynamic
    } else {
        MediaKind::Static
    }
}

/// The generator key for a `dynamic:` media id, if it is one.
pub fn dynamic_generator_key(media_id: &str) -> Option<&str> {
    media_id.strip_prefix(DYNAMIC_PREFIX)
}

/// Identity of a single tile: media, pyramid level, row, column.
///
/// Level 0 is the coarsest overview; increasing level doubles both axes.
/// Negative levels are virtual zoom-outs of the level-0 overview and always
/// carry `row = col = 0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileId {
    pub media_id: String,
    pub level: i32,
    pub row: u32,
    pub col: u32,
}

impl TileId {
    pub fn new(media_id: impl Into<String>, level: i32, row: u32, col: u32) -> Self {
        Self {
            media_id: media_id.into(),
            level,
            row,
            col,
        }
    }

    /// The overview tile id for this tile's media: `(media_id, 0, 0, 0)`.
    pub fn overview(&self) -> TileId {
        TileId::new(self.media_id.clone(), 0, 0, 0)
    }

    pub fn parent(&self) -> Option<TileId> {
        if self.level <= 0 {
            return None;
        }
        Some(TileId::new(
            self.media_id.clone(),
            self.level - 1,
            self.row / 2,
            self.col / 2,
        ))
    }

    pub fn media_kind(&self) -> MediaKind {
        media_kind(&self.media_id)
    }

    pub fn is_overview(&self) -> bool {
        self.level == 0 && self.row == 0 && self.col == 0
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@L{}[{},{}]", self.media_id, self.level, self.row, self.col)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_dynamic_media() {
        assert_eq!(media_kind("dynamic:checkerboard"), MediaKind::Dynamic);
        assert_eq!(dynamic_generator_key("dynamic:checkerboard"), Some("checkerboard"));
    }

    #[test]
    fn classifies_static_media() {
        assert_eq!(media_kind("/slides/a.tif"), MediaKind::Static);
        assert_eq!(dynamic_generator_key("/slides/a.tif"), None);
    }

    #[test]
    fn parent_halves_coordinates() {
        let id = TileId::new("m", 3, 5, 7);
        let parent = id.parent().unwrap();
        assert_eq!(parent.level, 2);
        assert_eq!(parent.row, 2);
        assert_eq!(parent.col, 3);
    }

    #[test]
    fn level_zero_has_no_parent() {
        let id = TileId::new("m", 0, 0, 0);
        assert!(id.parent().is_none());
    }

    #[test]
    fn overview_is_level_zero_origin() {
        let id = TileId::new("m", 4, 9, 2);
        let overview = id.overview();
        assert!(overview.is_overview());
        assert_eq!(overview.media_id, "m");
    }
}
