//! TileSource adapter exposing one document page as a tile grid.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tracing::debug;

use chartpad_core::{CancelFlag, TileCoords, TileImage, TileSource, TileSourceError};

use crate::document::{PageBounds, RasterError, Rasterizer};

/// Highest zoom step the source will address.
pub const MAX_ZOOM: i32 = 16;

/// Adapts a [`Rasterizer`] plus a current-page selector to the cache's
/// [`TileSource`] contract.
///
/// The rasterizer itself is single-threaded, so it sits behind a mutex that
/// only the cache's loader thread contends on; coordinate validation and
/// artifact naming work from a page-bounds table kept outside the lock.
pub struct DocumentTileSource {
    raster: Mutex<Rasterizer>,
    bounds: Vec<PageBounds>,
    tile_size: u32,
    page: AtomicUsize,
    cancel: CancelFlag,
    doc_key: String,
}

impl DocumentTileSource {
    /// Open a document from disk. The artifact key is derived from the
    /// file stem.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RasterError> {
        let key = doc_key_for(path.as_ref());
        Ok(Self::from_rasterizer(Rasterizer::open(path)?, key))
    }

    /// Open a document held in memory under an explicit artifact key.
    pub fn from_bytes(bytes: &[u8], key: &str) -> Result<Self, RasterError> {
        Ok(Self::from_rasterizer(
            Rasterizer::from_bytes(bytes)?,
            sanitize(key),
        ))
    }

    fn from_rasterizer(raster: Rasterizer, doc_key: String) -> Self {
        Self {
            bounds: raster.page_bounds().to_vec(),
            tile_size: raster.tile_size(),
            raster: Mutex::new(raster),
            page: AtomicUsize::new(0),
            cancel: CancelFlag::new(),
            doc_key,
        }
    }

    pub fn page_count(&self) -> usize {
        self.bounds.len()
    }

    pub fn page(&self) -> usize {
        self.page.load(Ordering::Acquire)
    }

    /// Select the page subsequent tile requests address.
    pub fn set_page(&self, page: usize) -> Result<(), RasterError> {
        if page >= self.bounds.len() {
            return Err(RasterError::PageOutOfRange {
                page,
                page_count: self.bounds.len(),
            });
        }
        debug!("switching to page {page}");
        self.page.store(page, Ordering::Release);
        Ok(())
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    /// Scaled width in pixels of `page` at `zoom`.
    pub fn page_width(&self, page: usize, zoom: i32) -> Result<u32, RasterError> {
        Ok(self.page_bounds(page)?.width_at(zoom))
    }

    /// Scaled height in pixels of `page` at `zoom`.
    pub fn page_height(&self, page: usize, zoom: i32) -> Result<u32, RasterError> {
        Ok(self.page_bounds(page)?.height_at(zoom))
    }

    fn page_bounds(&self, page: usize) -> Result<PageBounds, RasterError> {
        self.bounds
            .get(page)
            .copied()
            .ok_or(RasterError::PageOutOfRange {
                page,
                page_count: self.bounds.len(),
            })
    }

    /// Tile grid dimensions (columns, rows) of `page` at `zoom`.
    pub fn tile_grid(&self, page: usize, zoom: i32) -> Result<(u32, u32), RasterError> {
        let bounds = self.page_bounds(page)?;
        Ok((
            bounds.width_at(zoom).div_ceil(self.tile_size),
            bounds.height_at(zoom).div_ceil(self.tile_size),
        ))
    }
}

impl TileSource for DocumentTileSource {
    fn normalize(&self, coords: TileCoords) -> Option<TileCoords> {
        if coords.zoom < 0 || coords.zoom > MAX_ZOOM || coords.x < 0 || coords.y < 0 {
            return None;
        }
        let (columns, rows) = self.tile_grid(self.page(), coords.zoom).ok()?;
        if (coords.x as u32) < columns && (coords.y as u32) < rows {
            Some(coords)
        } else {
            None
        }
    }

    fn tile_path(&self, coords: TileCoords) -> String {
        format!(
            "{}/p{:04}/z{}/{}_{}.png",
            self.doc_key,
            self.page(),
            coords.zoom,
            coords.x,
            coords.y
        )
    }

    fn load_tile(&self, coords: TileCoords) -> Result<TileImage, TileSourceError> {
        if self.cancel.is_cancelled() {
            return Err(TileSourceError::Cancelled);
        }

        let page = self.page();
        let mut raster = self
            .raster
            .lock()
            .map_err(|_| TileSourceError::Fault("rasterizer lock poisoned".to_string()))?;
        raster
            .load_tile(page, coords.x as u32, coords.y as u32, coords.zoom)
            .map_err(|err| TileSourceError::Fault(err.to_string()))
    }

    fn cancel_pending_loads(&self) {
        self.cancel.cancel();
    }

    fn resume_loading(&self) {
        self.cancel.reset();
    }
}

fn doc_key_for(path: &Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("document");
    sanitize(stem)
}

fn sanitize(name: &str) -> String {
    let key: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if key.is_empty() {
        "document".to_string()
    } else {
        key
    }
}
