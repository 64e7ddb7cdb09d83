use std::collections::{BTreeMap, HashMap};

use anyhow::{bail, Result};

use super::surface::{Color, Font};
use crate::detection::Label;

pub const IRON_POLE: Color = Color::rgb(0xEF, 0x44, 0x44);
pub const CONCRETE_POLE: Color = Color::rgb(0x3B, 0x82, 0xF6);
pub const IRON_GANTRY_POLE: Color = Color::rgb(0x10, 0xB9, 0x81);
/// Used for `unknown` and for any label the palette has no entry for.
pub const FALLBACK: Color = Color::rgb(0x6B, 0x72, 0x80);

/// Label → stroke color.  Lookups never fail.
#[derive(Debug, Clone, PartialEq)]
pub struct Palette {
    colors: HashMap<String, Color>,
    fallback: Color,
}

impl Default for Palette {
    fn default() -> Self {
        let colors = [
            (Label::IronPole, IRON_POLE),
            (Label::ConcretePole, CONCRETE_POLE),
            (Label::IronGantryPole, IRON_GANTRY_POLE),
        ]
        .into_iter()
        .map(|(label, color)| (String::from(label), color))
        .collect();
        Self {
            colors,
            fallback: FALLBACK,
        }
    }
}

impl Palette {
    /// Default palette with `#RRGGBB` overrides or additions keyed by label name.
    pub fn with_overrides(overrides: &BTreeMap<String, String>) -> Result<Self> {
        let mut palette = Self::default();
        for (label, hex) in overrides {
            let Some(color) = Color::from_hex(hex) else {
                bail!("palette entry `{label}` has invalid color `{hex}` (expected #RRGGBB)");
            };
            palette.insert(label.as_str(), color);
        }
        Ok(palette)
    }

    pub fn insert(&mut self, label: impl Into<Label>, color: Color) {
        self.colors.insert(String::from(label.into()), color);
    }

    pub fn color_for(&self, label: &Label) -> Color {
        self.colors
            .get(label.as_str())
            .copied()
            .unwrap_or(self.fallback)
    }
}

/// Stroke and caption parameters for drawn boxes.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelStyle {
    pub line_width: f64,
    pub font: Font,
    /// Space between caption text and the edge of its background.
    pub padding: f64,
    pub text_color: Color,
}

impl Default for LabelStyle {
    fn default() -> Self {
        Self {
            line_width: 2.0,
            font: Font::default(),
            padding: 4.0,
            text_color: Color::WHITE,
        }
    }
}

impl LabelStyle {
    /// Height of the caption background strip.
    pub fn caption_height(&self) -> f64 {
        self.font.size_px + self.padding * 2.0
    }
}
