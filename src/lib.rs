//! Tile pyramid engine for a zooming user interface.
//!
//! Given a source asset, normalizes it to a raster stream, builds a
//! multi-resolution tile pyramid on disk, and serves tiles for a viewport at
//! any zoom level — synthesizing an approximation from a cached ancestor
//! when the exact tile isn't ready yet, so a viewer is never blocked on disk
//! or network I/O.
//!
//! [`TileManager`] is the entry point: construct one from a
//! [`TileEngineConfig`] and a set of registered [`TileGenerator`]s, then call
//! `fetch`/`request`/`purge` as the viewport moves.

mod cache;
mod cleanup;
mod config;
mod conversion;
mod error;
mod ids;
mod manager;
mod provider;
mod store;
mod tile;
mod tiler;

pub use cache::{CacheStats, EvictionClass, Lookup, TileCache};
pub use cleanup::{cleanup_old_tiles, CleanupReport};
pub use config::TileEngineConfig;
pub use conversion::{ConversionRunner, Handle as ConversionHandle, Job as ConversionJob, JobStatus};
pub use error::{TileEngineError, TileResult};
pub use ids::{media_kind, MediaKind, TileId, DYNAMIC_PREFIX};
pub use manager::{Provenance, TileManager};
pub use provider::{DynamicLoader, DynamicProvider, Load, LoadOutcome, StaticLoader, StaticProvider, TileGenerator};
pub use store::{MetaValue, StoreStats, TileMetadata, TileStore};
pub use tile::{Tile, TileExt};
pub use tiler::{RasterSource, RawRasterFile, Tiler, TilerHandle};
