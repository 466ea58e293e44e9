//! Draw device: replays a page display list into a tile pixmap.
//!
//! Interprets the path-and-paint subset of the content operator set. Text
//! and image operators are skipped; the geometry of a chart (grids, airways,
//! obstruction symbology) is what tiling cares about. The tile window itself
//! is the clip: everything is drawn through a flip/scale/offset transform
//! into a pixmap exactly one tile in size.

use image::RgbaImage;
use lopdf::content::Operation;
use lopdf::Object;
use tiny_skia::{Color, FillRule, Paint, PathBuilder, Pixmap, Rect, Shader, Stroke, Transform};

use chartpad_core::TileImage;

use crate::document::{number, DisplayList, PageBounds};

#[derive(Clone)]
struct GraphicsState {
    ctm: Transform,
    fill_color: Color,
    stroke_color: Color,
    line_width: f32,
}

impl Default for GraphicsState {
    fn default() -> Self {
        Self {
            ctm: Transform::identity(),
            fill_color: Color::BLACK,
            stroke_color: Color::BLACK,
            line_width: 1.0,
        }
    }
}

pub(crate) struct DrawDevice {
    pixmap: Pixmap,
    /// Page space → tile pixels: y-flip, then `√2^zoom` scale, then the
    /// tile-window offset.
    base: Transform,
    page: PageBounds,
    state: GraphicsState,
    stack: Vec<GraphicsState>,
    path: PathBuilder,
    current: (f32, f32),
}

impl DrawDevice {
    /// Allocate a device for one tile window. Returns `None` when the
    /// pixmap cannot be allocated (zero tile size).
    pub(crate) fn new(
        tile_size: u32,
        scale: f32,
        origin_x: u32,
        origin_y: u32,
        page: PageBounds,
    ) -> Option<Self> {
        let pixmap = Pixmap::new(tile_size, tile_size)?;
        let base = Transform::from_row(1.0, 0.0, 0.0, -1.0, 0.0, page.height)
            .post_scale(scale, scale)
            .post_translate(-(origin_x as f32), -(origin_y as f32));

        Some(Self {
            pixmap,
            base,
            page,
            state: GraphicsState::default(),
            stack: Vec::new(),
            path: PathBuilder::new(),
            current: (0.0, 0.0),
        })
    }

    /// Paint the page's clipped region opaque white, leaving pixels beyond
    /// the page edge at the transparent pre-fill.
    pub(crate) fn fill_page_background(&mut self) {
        if let Some(rect) = Rect::from_xywh(0.0, 0.0, self.page.width, self.page.height) {
            let path = PathBuilder::from_rect(rect);
            self.pixmap.fill_path(
                &path,
                &solid_paint(Color::WHITE),
                FillRule::Winding,
                self.base,
                None,
            );
        }
    }

    /// Replay the display list.
    pub(crate) fn run(&mut self, list: &DisplayList) {
        for op in &list.operations {
            self.apply(op);
        }
    }

    pub(crate) fn into_image(self) -> TileImage {
        let width = self.pixmap.width();
        let height = self.pixmap.height();

        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for px in self.pixmap.pixels() {
            let color = px.demultiply();
            data.extend_from_slice(&[color.red(), color.green(), color.blue(), color.alpha()]);
        }

        let pixels =
            RgbaImage::from_raw(width, height, data).unwrap_or_else(|| RgbaImage::new(width, height));
        TileImage::from_pixels(pixels)
    }

    fn apply(&mut self, op: &Operation) {
        let args = op.operands.as_slice();
        match op.operator.as_str() {
            "q" => self.stack.push(self.state.clone()),
            "Q" => {
                if let Some(state) = self.stack.pop() {
                    self.state = state;
                }
            }
            "cm" => {
                if let Some([a, b, c, d, e, f]) = nums(args) {
                    let m = Transform::from_row(a, b, c, d, e, f);
                    self.state.ctm = m.post_concat(self.state.ctm);
                }
            }
            "w" => {
                if let Some([width]) = nums(args) {
                    self.state.line_width = width;
                }
            }
            "g" => {
                if let Some([v]) = nums(args) {
                    self.state.fill_color = rgb_color(v, v, v);
                }
            }
            "G" => {
                if let Some([v]) = nums(args) {
                    self.state.stroke_color = rgb_color(v, v, v);
                }
            }
            "rg" => {
                if let Some([r, g, b]) = nums(args) {
                    self.state.fill_color = rgb_color(r, g, b);
                }
            }
            "RG" => {
                if let Some([r, g, b]) = nums(args) {
                    self.state.stroke_color = rgb_color(r, g, b);
                }
            }
            "k" => {
                if let Some([c, m, y, k]) = nums(args) {
                    self.state.fill_color = cmyk_color(c, m, y, k);
                }
            }
            "K" => {
                if let Some([c, m, y, k]) = nums(args) {
                    self.state.stroke_color = cmyk_color(c, m, y, k);
                }
            }
            "m" => {
                if let Some([x, y]) = nums(args) {
                    self.path.move_to(x, y);
                    self.current = (x, y);
                }
            }
            "l" => {
                if let Some([x, y]) = nums(args) {
                    self.path.line_to(x, y);
                    self.current = (x, y);
                }
            }
            "c" => {
                if let Some([x1, y1, x2, y2, x3, y3]) = nums(args) {
                    self.path.cubic_to(x1, y1, x2, y2, x3, y3);
                    self.current = (x3, y3);
                }
            }
            "v" => {
                // first control point coincides with the current point
                if let Some([x2, y2, x3, y3]) = nums(args) {
                    let (x0, y0) = self.current;
                    self.path.cubic_to(x0, y0, x2, y2, x3, y3);
                    self.current = (x3, y3);
                }
            }
            "y" => {
                if let Some([x1, y1, x3, y3]) = nums(args) {
                    self.path.cubic_to(x1, y1, x3, y3, x3, y3);
                    self.current = (x3, y3);
                }
            }
            "h" => self.path.close(),
            "re" => {
                if let Some([x, y, w, h]) = nums(args) {
                    self.path.move_to(x, y);
                    self.path.line_to(x + w, y);
                    self.path.line_to(x + w, y + h);
                    self.path.line_to(x, y + h);
                    self.path.close();
                    self.current = (x, y);
                }
            }
            "f" | "F" => self.paint_path(Some(FillRule::Winding), false),
            "f*" => self.paint_path(Some(FillRule::EvenOdd), false),
            "B" => self.paint_path(Some(FillRule::Winding), true),
            "B*" => self.paint_path(Some(FillRule::EvenOdd), true),
            "b" => {
                self.path.close();
                self.paint_path(Some(FillRule::Winding), true);
            }
            "b*" => {
                self.path.close();
                self.paint_path(Some(FillRule::EvenOdd), true);
            }
            "S" => self.paint_path(None, true),
            "s" => {
                self.path.close();
                self.paint_path(None, true);
            }
            "n" => self.discard_path(),
            // Clipping beyond the tile window is not applied; the path is
            // consumed by the painting operator that follows W/W*.
            "W" | "W*" => {}
            // Text, images, shading, inline objects: not tiled.
            _ => {}
        }
    }

    fn paint_path(&mut self, fill: Option<FillRule>, stroke: bool) {
        let builder = std::mem::replace(&mut self.path, PathBuilder::new());
        let Some(path) = builder.finish() else {
            return;
        };
        let transform = self.state.ctm.post_concat(self.base);

        if let Some(rule) = fill {
            self.pixmap
                .fill_path(&path, &solid_paint(self.state.fill_color), rule, transform, None);
        }
        if stroke {
            let stroke_def = Stroke {
                // zero-width means thinnest-visible in page space
                width: self.state.line_width.max(0.1),
                ..Stroke::default()
            };
            self.pixmap.stroke_path(
                &path,
                &solid_paint(self.state.stroke_color),
                &stroke_def,
                transform,
                None,
            );
        }
    }

    fn discard_path(&mut self) {
        self.path = PathBuilder::new();
    }
}

fn solid_paint(color: Color) -> Paint<'static> {
    Paint {
        shader: Shader::SolidColor(color),
        anti_alias: true,
        ..Paint::default()
    }
}

fn rgb_color(r: f32, g: f32, b: f32) -> Color {
    Color::from_rgba(
        r.clamp(0.0, 1.0),
        g.clamp(0.0, 1.0),
        b.clamp(0.0, 1.0),
        1.0,
    )
    .unwrap_or(Color::BLACK)
}

fn cmyk_color(c: f32, m: f32, y: f32, k: f32) -> Color {
    rgb_color(
        (1.0 - c) * (1.0 - k),
        (1.0 - m) * (1.0 - k),
        (1.0 - y) * (1.0 - k),
    )
}

fn nums<const N: usize>(operands: &[Object]) -> Option<[f32; N]> {
    if operands.len() < N {
        return None;
    }
    let mut out = [0.0; N];
    for (slot, obj) in out.iter_mut().zip(operands) {
        *slot = number(obj)?;
    }
    Some(out)
}
