//! Tile pixel buffers and their on-disk encoded form.

use std::fs;
use std::io::Cursor;
use std::path::Path;

use image::{ImageFormat, Rgba, RgbaImage};

/// Errors from loading or storing tile images.
#[derive(Debug, thiserror::Error)]
pub enum TileImageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image codec error: {0}")]
    Codec(#[from] image::ImageError),
}

/// A raster tile: RGBA pixels plus, when available, the encoded bytes the
/// pixels were decoded from.
///
/// Producers that fetch pre-encoded artifacts keep the encoded buffer around
/// so the disk tier can persist it without a re-encode.
/// [`TileImage::store_and_clear_encoded_data`] drops the buffer after the
/// write so a cached tile holds exactly one copy of itself in memory.
#[derive(Debug)]
pub struct TileImage {
    pixels: RgbaImage,
    encoded: Option<Vec<u8>>,
}

impl TileImage {
    /// Create a tile filled with a single RGBA colour.
    pub fn new(width: u32, height: u32, fill: [u8; 4]) -> Self {
        Self {
            pixels: RgbaImage::from_pixel(width, height, Rgba(fill)),
            encoded: None,
        }
    }

    /// Wrap an already-rendered pixel buffer.
    pub fn from_pixels(pixels: RgbaImage) -> Self {
        Self {
            pixels,
            encoded: None,
        }
    }

    /// Decode an encoded artifact, retaining the encoded bytes for a later
    /// [`TileImage::store_and_clear_encoded_data`].
    pub fn from_encoded(bytes: Vec<u8>) -> Result<Self, TileImageError> {
        let pixels = image::load_from_memory(&bytes)?.into_rgba8();
        Ok(Self {
            pixels,
            encoded: Some(bytes),
        })
    }

    /// Decode a tile file from disk.
    pub fn load_image_file<P: AsRef<Path>>(path: P) -> Result<Self, TileImageError> {
        let bytes = fs::read(path)?;
        let pixels = image::load_from_memory(&bytes)?.into_rgba8();
        Ok(Self {
            pixels,
            encoded: None,
        })
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut RgbaImage {
        &mut self.pixels
    }

    /// Whether an encoded copy is still held alongside the pixels.
    pub fn has_encoded_data(&self) -> bool {
        self.encoded.is_some()
    }

    /// Persist the tile at `path` and drop the in-memory encoded buffer.
    ///
    /// Uses the retained encoded bytes when present, otherwise encodes the
    /// pixels as PNG. Parent directories are created as needed and the file
    /// is published with a write-then-rename so readers never observe a
    /// partial artifact.
    pub fn store_and_clear_encoded_data<P: AsRef<Path>>(
        &mut self,
        path: P,
    ) -> Result<(), TileImageError> {
        let path = path.as_ref();
        let bytes = match self.encoded.take() {
            Some(bytes) => bytes,
            None => {
                let mut buf = Vec::new();
                self.pixels
                    .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
                buf
            }
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = path.with_extension("part");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
