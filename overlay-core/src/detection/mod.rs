//! detection: per-frame pole detections as produced by the backend
//!
//! One `DetectionFrame` per sampled video frame, each holding the boxes the
//! detector reported for it.  Box geometry arrives as a raw JSON array and is
//! only validated when it is about to be drawn, so one bad box never poisons
//! the rest of a task's results.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod lookup;

pub use lookup::{DetectionIndex, DetectionLookup};

/// Full ordered detection output for one task.
pub type DetectionSet = Vec<DetectionFrame>;

// ── Labels ───────────────────────────────────────────────────────────────────

/// Pole class reported by the detector.  Unrecognised names are kept verbatim
/// in `Other` rather than failing deserialisation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Label {
    IronPole,
    ConcretePole,
    IronGantryPole,
    #[default]
    Unknown,
    Other(String),
}

impl Label {
    pub fn as_str(&self) -> &str {
        match self {
            Label::IronPole => "iron_pole",
            Label::ConcretePole => "concrete_pole",
            Label::IronGantryPole => "iron_gantry_pole",
            Label::Unknown => "unknown",
            Label::Other(name) => name,
        }
    }
}

impl From<&str> for Label {
    fn from(name: &str) -> Self {
        match name {
            "iron_pole" => Label::IronPole,
            "concrete_pole" => Label::ConcretePole,
            "iron_gantry_pole" => Label::IronGantryPole,
            "unknown" | "" => Label::Unknown,
            other => Label::Other(other.to_string()),
        }
    }
}

impl From<String> for Label {
    fn from(name: String) -> Self {
        Label::from(name.as_str())
    }
}

impl From<Label> for String {
    fn from(label: Label) -> Self {
        label.as_str().to_string()
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Geometry ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeometryError {
    #[error("xyxy must have 4 coordinates, got {0}")]
    Arity(usize),
    #[error("xyxy contains a non-finite coordinate: {0:?}")]
    NonFinite(Vec<f64>),
    #[error("xyxy corners are inverted or degenerate: {0:?}")]
    Inverted([f64; 4]),
}

/// Validated axis-aligned box, `x1 < x2` and `y1 < y2`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxRect {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoxRect {
    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }
    pub fn height(&self) -> f64 {
        self.y2 - self.y1
    }
    pub fn center_x(&self) -> f64 {
        (self.x1 + self.x2) / 2.0
    }
    pub fn center_y(&self) -> f64 {
        (self.y1 + self.y2) / 2.0
    }

    /// Scale independently along each axis (source → display space).
    pub fn scaled(&self, sx: f64, sy: f64) -> BoxRect {
        BoxRect {
            x1: self.x1 * sx,
            y1: self.y1 * sy,
            x2: self.x2 * sx,
            y2: self.y2 * sy,
        }
    }
}

// ── Wire types ───────────────────────────────────────────────────────────────

/// One detected pole.  `xyxy` is in source-video pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub id: i64,
    #[serde(default)]
    pub xyxy: Vec<f64>,
    #[serde(default)]
    pub label: Label,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl BoundingBox {
    pub fn new(id: i64, xyxy: [f64; 4], label: Label) -> Self {
        Self {
            id,
            xyxy: xyxy.to_vec(),
            label,
            confidence: None,
        }
    }

    pub fn rect(&self) -> Result<BoxRect, GeometryError> {
        let [x1, y1, x2, y2] = <[f64; 4]>::try_from(self.xyxy.as_slice())
            .map_err(|_| GeometryError::Arity(self.xyxy.len()))?;
        if ![x1, y1, x2, y2].iter().all(|v| v.is_finite()) {
            return Err(GeometryError::NonFinite(self.xyxy.clone()));
        }
        if x1 >= x2 || y1 >= y2 {
            return Err(GeometryError::Inverted([x1, y1, x2, y2]));
        }
        Ok(BoxRect { x1, y1, x2, y2 })
    }

    /// Caption drawn above the box.
    pub fn caption(&self) -> String {
        format!("{} {}", self.id, self.label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionFrame {
    pub frame_index: u64,
    /// Sample time reported by the backend; informational only, the overlay
    /// always derives the index from the player clock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    #[serde(default)]
    pub boxes: Vec<BoundingBox>,
}

// ── Loading ──────────────────────────────────────────────────────────────────

/// Parse a detection set from JSON.  Accepts either the bare array or the
/// backend's `{ "success": true, "data": [...] }` envelope.
pub fn parse_detection_set(json: &str) -> Result<DetectionSet> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Document {
        Bare(DetectionSet),
        Envelope { data: DetectionSet },
    }

    let doc: Document = serde_json::from_str(json).context("invalid detection set JSON")?;
    Ok(match doc {
        Document::Bare(set) | Document::Envelope { data: set } => set,
    })
}

pub fn load_detection_set<P: AsRef<Path>>(path: P) -> Result<DetectionSet> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read detections: {}", path.display()))?;
    parse_detection_set(&text).with_context(|| format!("in {}", path.display()))
}

/// Write `set` as a bare pretty-printed array, readable by `load_detection_set`.
pub fn save_detection_set<P: AsRef<Path>>(path: P, set: &DetectionSet) -> Result<()> {
    let path = path.as_ref();
    let json = serde_json::to_string_pretty(set).context("failed to serialize detections")?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write detections: {}", path.display()))
}
