//! Core tile model for the ChartPad viewer.
//!
//! Defines the coordinate and pixel-buffer types shared by the tile cache
//! and every tile producer, plus the [`TileSource`] contract the cache
//! consumes.

mod cancel;
mod coords;
mod source;
mod tile;

pub use cancel::CancelFlag;
pub use coords::TileCoords;
pub use source::{TileSource, TileSourceError};
pub use tile::{TileImage, TileImageError};
