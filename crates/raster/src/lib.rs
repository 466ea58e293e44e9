//! Document rasterization for ChartPad.
//!
//! Renders pages of vector documents (approach plates, en-route charts)
//! into fixed-size square tiles at `√2^zoom` pixel scales, and adapts a
//! rasterizer plus a current-page selector to the cache's
//! [`chartpad_core::TileSource`] contract.

mod device;
mod document;
mod source;

pub use document::{PageBounds, RasterError, Rasterizer, TILE_SIZE};
pub use source::{DocumentTileSource, MAX_ZOOM};
