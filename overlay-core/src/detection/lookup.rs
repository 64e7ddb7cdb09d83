use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::{BoundingBox, DetectionSet};

/// Frame-index → boxes table built in one pass over a detection set.
///
/// When the same `frame_index` appears more than once, the first entry wins
/// and later ones are ignored.
#[derive(Debug, Clone)]
pub struct DetectionIndex {
    set: Arc<DetectionSet>,
    by_frame: HashMap<u64, usize>,
}

impl DetectionIndex {
    pub fn build(set: Arc<DetectionSet>) -> Self {
        let mut by_frame = HashMap::with_capacity(set.len());
        let mut duplicates = 0usize;

        for (position, frame) in set.iter().enumerate() {
            match by_frame.entry(frame.frame_index) {
                Entry::Vacant(slot) => {
                    slot.insert(position);
                }
                Entry::Occupied(_) => duplicates += 1,
            }
        }

        if duplicates > 0 {
            warn!(
                duplicates,
                "detection set repeats frame indices; keeping the first entry of each"
            );
        }
        debug!(
            frames = set.len(),
            indexed = by_frame.len(),
            "detection index built"
        );

        Self { set, by_frame }
    }

    /// Boxes for `frame_index`, or an empty slice when the frame has no entry.
    pub fn boxes_for(&self, frame_index: u64) -> &[BoundingBox] {
        self.by_frame
            .get(&frame_index)
            .and_then(|&position| self.set.get(position))
            .map(|frame| frame.boxes.as_slice())
            .unwrap_or(&[])
    }

    pub fn set(&self) -> &Arc<DetectionSet> {
        &self.set
    }

    /// Number of distinct frame indices.
    pub fn len(&self) -> usize {
        self.by_frame.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_frame.is_empty()
    }
}

/// Owns the current detection set and its index.
///
/// The index is rebuilt whenever a set with a different `Arc` identity is
/// installed; `generation` increments on every such change so callers can
/// tell whether what they painted is still current.
#[derive(Debug, Default)]
pub struct DetectionLookup {
    index: Option<DetectionIndex>,
    generation: u64,
}

impl DetectionLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `set`.  Returns `false` (and keeps the existing index) when it
    /// is the same allocation that is already installed.
    pub fn replace(&mut self, set: Arc<DetectionSet>) -> bool {
        if let Some(index) = &self.index {
            if Arc::ptr_eq(index.set(), &set) {
                return false;
            }
        }
        self.index = Some(DetectionIndex::build(set));
        self.generation += 1;
        true
    }

    /// Drop the current set.  Returns whether anything was installed.
    pub fn clear(&mut self) -> bool {
        if self.index.take().is_some() {
            self.generation += 1;
            true
        } else {
            false
        }
    }

    pub fn boxes_for(&self, frame_index: u64) -> &[BoundingBox] {
        match &self.index {
            Some(index) => index.boxes_for(frame_index),
            None => &[],
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn current(&self) -> Option<&Arc<DetectionSet>> {
        self.index.as_ref().map(DetectionIndex::set)
    }
}
