//! Producer contract consumed by the tile cache.

use crate::coords::TileCoords;
use crate::tile::TileImage;

/// Errors a producer can signal from [`TileSource::load_tile`].
#[derive(Debug, thiserror::Error)]
pub enum TileSourceError {
    /// The producer was asked to abort. The cache discards the load
    /// silently without memoizing an error.
    #[error("tile load cancelled")]
    Cancelled,

    /// Any other production failure. The cache memoizes the coordinate as
    /// errored until the error set is cleared.
    #[error("tile producer fault: {0}")]
    Fault(String),
}

/// A tile producer: map servers, document rasterizers, anything that can
/// turn a coordinate triple into pixels.
///
/// The cache calls [`TileSource::load_tile`] from its single background
/// worker, but the remaining methods may be called concurrently from any
/// caller thread; implementations keep them cheap.
pub trait TileSource: Send + Sync {
    /// Map raw viewport coordinates onto the producer's canonical grid,
    /// for example wrapping longitude into range. Returns `None` when the
    /// coordinate is unrepresentable.
    fn normalize(&self, coords: TileCoords) -> Option<TileCoords>;

    /// Stable, filesystem-safe relative path naming the tile artifact.
    ///
    /// This is the cache's true primary key: two coordinate triples that
    /// map to the same path address the same logical tile.
    fn tile_path(&self, coords: TileCoords) -> String;

    /// Produce the tile. May block arbitrarily long; this is the only
    /// long-latency operation in the cache pipeline.
    fn load_tile(&self, coords: TileCoords) -> Result<TileImage, TileSourceError>;

    /// Advisory: in-flight and upcoming loads should return
    /// [`TileSourceError::Cancelled`] promptly until the latch is cleared.
    fn cancel_pending_loads(&self);

    /// Clear a latched cancellation before the next load proceeds.
    fn resume_loading(&self);
}
