mod classify;
mod dedup;
mod order;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use strsim::normalized_levenshtein;

use crate::geometry::{BBox, Point, union_bbox};
use crate::recognition::Modality;
use crate::restore::RestoredDetection;
use crate::tiling::TileIndex;

pub use classify::{Classification, ComponentClass, EntityKind, classify};
pub use dedup::{DedupThresholds, deduplicate, deduplicate_entities};
pub use order::{ReadingOrder, reading_order, reading_text, reading_weight, sort};

/// One real-world item after overlapping detections of it were collapsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeduplicatedEntity {
    pub text: String,
    pub kind: EntityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<ComponentClass>,
    /// Type name as the vision model reported it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision_type: Option<String>,
    pub bbox: BBox,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polygon: Option<Vec<Point>>,
    pub confidence: f32,
    pub modality: Modality,
    pub tiles: BTreeSet<TileIndex>,
    pub attributes: BTreeMap<String, String>,
    pub members: usize,
}

impl DeduplicatedEntity {
    pub fn from_detection(detection: &RestoredDetection) -> Self {
        let local = &detection.local;
        let classification = classify(&local.text, local.kind.as_deref());
        let mut attributes = local.attributes.clone();
        for (key, value) in classification.attributes {
            attributes.entry(key).or_insert(value);
        }
        Self {
            text: local.text.clone(),
            kind: classification.kind,
            class: classification.class,
            vision_type: local.kind.clone(),
            bbox: detection.bbox,
            polygon: detection.polygon.clone(),
            confidence: local.confidence,
            modality: local.modality,
            tiles: BTreeSet::from([detection.tile_index()]),
            attributes,
            members: 1,
        }
    }

    pub fn first_tile(&self) -> Option<TileIndex> {
        self.tiles.iter().next().copied()
    }

    /// Folds a lower-priority duplicate into this entity. The representative
    /// text and confidence stay with `self`, and the type is classified from
    /// that text again.
    pub(crate) fn absorb(&mut self, other: &DeduplicatedEntity) {
        self.bbox = union_bbox(&self.bbox, &other.bbox);
        self.confidence = self.confidence.max(other.confidence);
        self.tiles.extend(other.tiles.iter().copied());
        self.members += other.members;
        if self.polygon.is_none() {
            self.polygon = other.polygon.clone();
        }
        if self.vision_type.is_none() {
            self.vision_type = other.vision_type.clone();
        }

        let classification = classify(&self.text, self.vision_type.as_deref());
        let component = matches!(
            classification.kind,
            EntityKind::Component | EntityKind::ComponentId
        );
        self.kind = classification.kind;
        self.class = classification
            .class
            .or(if component { self.class } else { None });
        for (key, value) in classification.attributes {
            self.attributes.entry(key).or_insert(value);
        }
        for (key, value) in &other.attributes {
            if key == "class" {
                continue;
            }
            self.attributes
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        match self.class {
            Some(class) => {
                self.attributes
                    .insert("class".to_string(), class.as_str().to_string());
            }
            None => {
                self.attributes.remove("class");
            }
        }
    }
}

/// Similarity in [0, 1] that tolerates OCR dropping punctuation.
pub fn text_similarity(a: &str, b: &str) -> f32 {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let base = normalized_levenshtein(&a, &b) as f32;
    let a_plain: String = a.chars().filter(|ch| ch.is_alphanumeric()).collect();
    let b_plain: String = b.chars().filter(|ch| ch.is_alphanumeric()).collect();
    let plain = if !a_plain.is_empty() && !b_plain.is_empty() {
        normalized_levenshtein(&a_plain, &b_plain) as f32
    } else {
        0.0
    };
    base.max(plain)
}
