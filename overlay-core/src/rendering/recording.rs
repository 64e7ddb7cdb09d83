//! In-memory surface that records every call, so a test can inspect exactly
//! what the overlay drew.

use super::surface::{Color, Font, PixelSize, Rect, Size, Surface, Transform};

/// Average glyph advance as a fraction of the font size.
const GLYPH_ADVANCE_EM: f64 = 0.6;

#[derive(Debug, Clone, PartialEq)]
pub enum DrawOp {
    Resize { buffer: PixelSize, css: Size },
    SetTransform(Transform),
    Clear,
    StrokeRect {
        rect: Rect,
        color: Color,
        line_width: f64,
    },
    FillRect {
        rect: Rect,
        color: Color,
    },
    FillText {
        text: String,
        x: f64,
        y: f64,
        font: Font,
        color: Color,
    },
}

#[derive(Debug, Clone, Default)]
pub struct RecordingSurface {
    buffer: PixelSize,
    css: Size,
    transform: Transform,
    ops: Vec<DrawOp>,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer_size(&self) -> PixelSize {
        self.buffer
    }

    pub fn css_size(&self) -> Size {
        self.css
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }

    pub fn ops(&self) -> &[DrawOp] {
        &self.ops
    }

    /// Ops recorded since the most recent `Clear`, i.e. what is currently visible.
    pub fn visible_ops(&self) -> &[DrawOp] {
        let start = self
            .ops
            .iter()
            .rposition(|op| matches!(op, DrawOp::Clear | DrawOp::Resize { .. }))
            .map_or(0, |i| i + 1);
        &self.ops[start..]
    }

    /// Rectangles stroked since the last clear, in drawing order.
    pub fn strokes(&self) -> Vec<(Rect, Color)> {
        self.visible_ops()
            .iter()
            .filter_map(|op| match op {
                DrawOp::StrokeRect { rect, color, .. } => Some((*rect, *color)),
                _ => None,
            })
            .collect()
    }

    /// Captions drawn since the last clear.
    pub fn texts(&self) -> Vec<&str> {
        self.visible_ops()
            .iter()
            .filter_map(|op| match op {
                DrawOp::FillText { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn clear_count(&self) -> usize {
        self.ops.iter().filter(|op| matches!(op, DrawOp::Clear)).count()
    }

    pub fn take_ops(&mut self) -> Vec<DrawOp> {
        std::mem::take(&mut self.ops)
    }
}

impl Surface for RecordingSurface {
    fn resize(&mut self, buffer: PixelSize, css: Size) {
        self.buffer = buffer;
        self.css = css;
        // Resizing a canvas also resets its context state.
        self.transform = Transform::IDENTITY;
        self.ops.push(DrawOp::Resize { buffer, css });
    }

    fn set_transform(&mut self, transform: Transform) {
        self.transform = transform;
        self.ops.push(DrawOp::SetTransform(transform));
    }

    fn clear(&mut self) {
        self.ops.push(DrawOp::Clear);
    }

    fn stroke_rect(&mut self, rect: Rect, color: Color, line_width: f64) {
        self.ops.push(DrawOp::StrokeRect {
            rect,
            color,
            line_width,
        });
    }

    fn fill_rect(&mut self, rect: Rect, color: Color) {
        self.ops.push(DrawOp::FillRect { rect, color });
    }

    fn measure_text(&self, text: &str, font: &Font) -> f64 {
        text.chars().count() as f64 * font.size_px * GLYPH_ADVANCE_EM
    }

    fn fill_text(&mut self, text: &str, x: f64, y: f64, font: &Font, color: Color) {
        self.ops.push(DrawOp::FillText {
            text: text.to_string(),
            x,
            y,
            font: font.clone(),
            color,
        });
    }
}
