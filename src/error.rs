//! Error types for the tile pyramid engine.

use thiserror::Error;

/// Error taxonomy for tile pyramid operations.
#[derive(Error, Debug)]
pub enum TileEngineError {
    #[error("media '{0}' has not been tiled")]
    NotTiled(String),

    #[error("tile not yet loaded into cache")]
    NotLoaded,

    #[error("tile is not available: {0}")]
    NotAvailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("conversion failed: {0}")]
    ConversionFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("failed to decode tile: {0}")]
    Decode(String),

    #[error("invalid metadata: {0}")]
    Validation(String),
}

/// Result type alias for tile pyramid operations.
pub type TileResult<T> = Result<T, TileEngineError>;
