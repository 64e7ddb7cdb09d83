//! CPU-backed surface on an `RgbaImage`, for PNG snapshots of the overlay.
//!
//! Only axis-aligned transforms (scale plus translation) are honoured, which
//! is all the overlay ever sets.  Text uses the 8x8 bitmap font, each glyph
//! scaled to a square cell of one advance width so `measure_text` matches
//! what is drawn.

use std::path::Path;

use anyhow::{Context, Result};
use font8x8::{UnicodeFonts, BASIC_FONTS};
use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect as PixelRect;

use super::surface::{Color, Font, PixelSize, Rect, Size, Surface, Transform};

const GLYPH_ADVANCE_EM: f64 = 0.6;
const GLYPH_BITS: usize = 8;

pub struct RasterSurface {
    image: RgbaImage,
    css: Size,
    transform: Transform,
}

impl RasterSurface {
    pub fn new() -> Self {
        Self {
            image: RgbaImage::new(0, 0),
            css: Size::default(),
            transform: Transform::IDENTITY,
        }
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn css_size(&self) -> Size {
        self.css
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        anyhow::ensure!(
            self.image.width() > 0 && self.image.height() > 0,
            "overlay has not been sized yet; nothing to save"
        );
        self.image
            .save(path)
            .with_context(|| format!("failed to write snapshot: {}", path.display()))
    }

    /// Map a user-space rect to whole device pixels `(x, y, w, h)`.
    fn to_device(&self, rect: Rect) -> Option<(i32, i32, u32, u32)> {
        let (x0, y0) = self.transform.apply(rect.x, rect.y);
        let (x1, y1) = self.transform.apply(rect.right(), rect.bottom());
        let (left, right) = (x0.min(x1), x0.max(x1));
        let (top, bottom) = (y0.min(y1), y0.max(y1));
        if ![left, right, top, bottom].iter().all(|v| v.is_finite()) {
            return None;
        }
        let clamp = |v: f64| v.round().clamp(i32::MIN as f64 / 2.0, i32::MAX as f64 / 2.0) as i32;
        let (l, t, r, b) = (clamp(left), clamp(top), clamp(right), clamp(bottom));
        if r <= l || b <= t {
            return None;
        }
        Some((l, t, (r - l) as u32, (b - t) as u32))
    }
}

impl Default for RasterSurface {
    fn default() -> Self {
        Self::new()
    }
}

fn rgba(color: Color) -> Rgba<u8> {
    Rgba(color.to_rgba())
}

impl Surface for RasterSurface {
    fn resize(&mut self, buffer: PixelSize, css: Size) {
        self.image = RgbaImage::new(buffer.width, buffer.height);
        self.css = css;
        self.transform = Transform::IDENTITY;
    }

    fn set_transform(&mut self, transform: Transform) {
        self.transform = transform;
    }

    fn clear(&mut self) {
        for pixel in self.image.pixels_mut() {
            *pixel = rgba(Color::TRANSPARENT);
        }
    }

    fn stroke_rect(&mut self, rect: Rect, color: Color, line_width: f64) {
        // Canvas strokes straddle the path: half the line falls outside.
        let half = line_width / 2.0;
        let outer = Rect::new(
            rect.x - half,
            rect.y - half,
            rect.width + line_width,
            rect.height + line_width,
        );
        let Some((x, y, w, h)) = self.to_device(outer) else {
            return;
        };
        let thickness = (line_width * self.transform.a.abs()).round().max(1.0) as u32;
        for t in 0..thickness {
            let (tw, th) = (w.saturating_sub(2 * t), h.saturating_sub(2 * t));
            if tw == 0 || th == 0 {
                break;
            }
            let ring = PixelRect::at(x + t as i32, y + t as i32).of_size(tw, th);
            draw_hollow_rect_mut(&mut self.image, ring, rgba(color));
        }
    }

    fn fill_rect(&mut self, rect: Rect, color: Color) {
        if let Some((x, y, w, h)) = self.to_device(rect) {
            draw_filled_rect_mut(&mut self.image, PixelRect::at(x, y).of_size(w, h), rgba(color));
        }
    }

    fn measure_text(&self, text: &str, font: &Font) -> f64 {
        text.chars().count() as f64 * font.size_px * GLYPH_ADVANCE_EM
    }

    /// `y` is the baseline; glyphs sit in the cell directly above it.
    fn fill_text(&mut self, text: &str, x: f64, y: f64, font: &Font, color: Color) {
        let cell = font.size_px * GLYPH_ADVANCE_EM;
        let bit = cell / GLYPH_BITS as f64;
        let top = y - cell;
        for (i, ch) in text.chars().enumerate() {
            let Some(glyph) = BASIC_FONTS.get(ch).or_else(|| BASIC_FONTS.get('?')) else {
                continue;
            };
            let left = x + i as f64 * cell;
            for (row, bits) in glyph.iter().enumerate() {
                for col in 0..GLYPH_BITS {
                    if (bits >> col) & 1 == 0 {
                        continue;
                    }
                    let dot = Rect::new(left + col as f64 * bit, top + row as f64 * bit, bit, bit);
                    self.fill_rect(dot, color);
                }
            }
        }
    }
}
