//! Document handling: page enumeration and tile rendering.

use std::path::Path;
use std::time::Instant;

use lopdf::content::{Content, Operation};
use lopdf::{Document, Object, ObjectId};
use tracing::{debug, info};

use chartpad_core::TileImage;

use crate::device::DrawDevice;

/// Default output tile edge in pixels.
pub const TILE_SIZE: u32 = 512;

/// Errors that can occur while opening or rendering a document.
#[derive(Debug, thiserror::Error)]
pub enum RasterError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("document parse error: {0}")]
    Parse(#[from] lopdf::Error),
    #[error("page {page} out of range (page_count={page_count})")]
    PageOutOfRange { page: usize, page_count: usize },
    #[error("render error: {0}")]
    Render(String),
}

/// Bounding box of a page in native document units (72 dpi points).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageBounds {
    pub width: f32,
    pub height: f32,
}

impl PageBounds {
    /// Page width in output pixels at `zoom`; fractional pixels truncate.
    pub fn width_at(&self, zoom: i32) -> u32 {
        (self.width * Rasterizer::zoom_to_scale(zoom)) as u32
    }

    /// Page height in output pixels at `zoom`; fractional pixels truncate.
    pub fn height_at(&self, zoom: i32) -> u32 {
        (self.height * Rasterizer::zoom_to_scale(zoom)) as u32
    }
}

/// A page's decoded content stream, replayable per tile.
///
/// Decoding is the expensive per-page step, so the rasterizer builds one
/// list and reuses it for every tile of that page.
pub(crate) struct DisplayList {
    pub(crate) operations: Vec<Operation>,
}

/// Renders document pages into fixed-size square tiles.
///
/// The tile pixel scale is `√2 ^ zoom`; zoom zero yields native document
/// units. At most one page's display list is held at a time, so iterating
/// tiles page by page amortizes the content decode.
///
/// Not shareable across threads: rasterize concurrently by constructing one
/// `Rasterizer` per thread.
pub struct Rasterizer {
    // declaration order doubles as drop order: the display list goes
    // before the document it was decoded from
    current_page: Option<(usize, DisplayList)>,
    doc: Document,
    page_ids: Vec<ObjectId>,
    page_bounds: Vec<PageBounds>,
    tile_size: u32,
}

impl Rasterizer {
    /// Open a document from disk and eagerly enumerate its page bounds.
    ///
    /// This is the only fatal failure in the rasterization pipeline; all
    /// later per-tile errors are recoverable.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RasterError> {
        info!("loading document {}", path.as_ref().display());
        Self::from_document(Document::load(path)?)
    }

    /// Open a document already held in memory.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RasterError> {
        Self::from_document(Document::load_mem(bytes)?)
    }

    fn from_document(doc: Document) -> Result<Self, RasterError> {
        let mut page_ids = Vec::new();
        let mut page_bounds = Vec::new();
        for (_, id) in doc.get_pages() {
            page_ids.push(id);
            page_bounds.push(Self::media_box(&doc, id));
        }
        if page_ids.is_empty() {
            return Err(RasterError::Render("document has no pages".to_string()));
        }
        debug!("document has {} pages", page_ids.len());

        Ok(Self {
            doc,
            page_ids,
            page_bounds,
            current_page: None,
            tile_size: TILE_SIZE,
        })
    }

    fn media_box(doc: &Document, id: ObjectId) -> PageBounds {
        doc.get_dictionary(id)
            .ok()
            .and_then(|dict| dict.get(b"MediaBox").ok())
            .and_then(|obj| obj.as_array().ok())
            .and_then(|array| {
                if array.len() != 4 {
                    return None;
                }
                let x0 = number(&array[0])?;
                let y0 = number(&array[1])?;
                let x1 = number(&array[2])?;
                let y1 = number(&array[3])?;
                Some(PageBounds {
                    width: (x1 - x0).abs(),
                    height: (y1 - y0).abs(),
                })
            })
            // US Letter at 72 dpi when the box is missing or malformed
            .unwrap_or(PageBounds {
                width: 612.0,
                height: 792.0,
            })
    }

    /// Pixel scale factor for a zoom step.
    pub fn zoom_to_scale(zoom: i32) -> f32 {
        std::f32::consts::SQRT_2.powi(zoom)
    }

    /// Use a non-default tile edge.
    pub fn with_tile_size(mut self, tile_size: u32) -> Self {
        self.tile_size = tile_size;
        self
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn page_count(&self) -> usize {
        self.page_ids.len()
    }

    /// Native-unit bounds of every page, in page order.
    pub fn page_bounds(&self) -> &[PageBounds] {
        &self.page_bounds
    }

    /// Scaled page width in pixels at `zoom`.
    pub fn page_width(&self, page: usize, zoom: i32) -> Result<u32, RasterError> {
        Ok(self.bounds(page)?.width_at(zoom))
    }

    /// Scaled page height in pixels at `zoom`.
    pub fn page_height(&self, page: usize, zoom: i32) -> Result<u32, RasterError> {
        Ok(self.bounds(page)?.height_at(zoom))
    }

    fn bounds(&self, page: usize) -> Result<PageBounds, RasterError> {
        self.page_bounds
            .get(page)
            .copied()
            .ok_or(RasterError::PageOutOfRange {
                page,
                page_count: self.page_ids.len(),
            })
    }

    /// Render one tile of `page` at `zoom`.
    ///
    /// The tile window starts at `(x · tile_size, y · tile_size)` in output
    /// pixels. Pixels outside the page keep the transparent pre-fill; the
    /// page region is painted opaque white before the display list runs, so
    /// pages without an explicit background render opaque.
    pub fn load_tile(
        &mut self,
        page: usize,
        x: u32,
        y: u32,
        zoom: i32,
    ) -> Result<TileImage, RasterError> {
        let bounds = self.bounds(page)?;
        self.ensure_page(page)?;
        let Some((_, list)) = self.current_page.as_ref() else {
            return Err(RasterError::Render("display list unavailable".to_string()));
        };

        let start = Instant::now();
        let scale = Self::zoom_to_scale(zoom);
        let origin_x = x * self.tile_size;
        let origin_y = y * self.tile_size;

        let mut device = DrawDevice::new(self.tile_size, scale, origin_x, origin_y, bounds)
            .ok_or_else(|| RasterError::Render("cannot allocate tile pixmap".to_string()))?;
        device.fill_page_background();
        device.run(list);

        debug!(
            "tile {page}/{x}/{y}/{zoom} rendered in {} ms",
            start.elapsed().as_millis()
        );
        Ok(device.into_image())
    }

    /// Make the display list slot match `page`, dropping the previous
    /// page's list before decoding the new one.
    fn ensure_page(&mut self, page: usize) -> Result<(), RasterError> {
        if let Some((current, _)) = &self.current_page {
            if *current == page {
                return Ok(());
            }
        }
        self.current_page = None;

        let id = *self
            .page_ids
            .get(page)
            .ok_or(RasterError::PageOutOfRange {
                page,
                page_count: self.page_ids.len(),
            })?;

        debug!("building display list for page {page}");
        let content = self.doc.get_page_content(id)?;
        let operations = Content::decode(&content)
            .map_err(|err| RasterError::Render(format!("cannot parse page {page}: {err}")))?
            .operations;

        self.current_page = Some((page, DisplayList { operations }));
        Ok(())
    }
}

pub(crate) fn number(obj: &Object) -> Option<f32> {
    match obj {
        Object::Integer(value) => Some(*value as f32),
        Object::Real(value) => Some(*value as f32),
        _ => None,
    }
}
