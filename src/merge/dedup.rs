use std::cmp::Ordering;
use tracing::debug;

use super::{DeduplicatedEntity, text_similarity};
use crate::geometry::iou;
use crate::restore::RestoredDetection;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedupThresholds {
    /// Boxes overlapping this much are the same item whatever they say.
    pub iou_merge: f32,
    pub text_merge: f32,
    pub text_merge_min_iou: f32,
    pub mixed_iou: f32,
    pub mixed_text: f32,
}

impl Default for DedupThresholds {
    fn default() -> Self {
        Self {
            iou_merge: 0.7,
            text_merge: 0.9,
            text_merge_min_iou: 0.0,
            mixed_iou: 0.3,
            mixed_text: 0.8,
        }
    }
}

impl DedupThresholds {
    fn should_merge(&self, seed: &DeduplicatedEntity, other: &DeduplicatedEntity) -> bool {
        let overlap = iou(&seed.bbox, &other.bbox);
        if overlap > self.iou_merge {
            return true;
        }
        if overlap <= self.text_merge_min_iou && overlap <= self.mixed_iou {
            return false;
        }
        let similarity = text_similarity(&seed.text, &other.text);
        (similarity > self.text_merge && overlap > self.text_merge_min_iou)
            || (overlap > self.mixed_iou && similarity > self.mixed_text)
    }
}

/// Collapses restored detections of one modality into entities.
pub fn deduplicate(
    detections: &[RestoredDetection],
    thresholds: &DedupThresholds,
) -> Vec<DeduplicatedEntity> {
    let entities = detections
        .iter()
        .map(DeduplicatedEntity::from_detection)
        .collect();
    deduplicate_entities(entities, thresholds)
}

/// Runs merge passes until nothing merges, so feeding the output back in
/// returns it unchanged.
pub fn deduplicate_entities(
    entities: Vec<DeduplicatedEntity>,
    thresholds: &DedupThresholds,
) -> Vec<DeduplicatedEntity> {
    let input = entities.len();
    let mut current = entities;
    let mut passes = 0usize;
    loop {
        passes += 1;
        let (next, merged) = merge_pass(current, thresholds);
        current = next;
        if !merged {
            break;
        }
    }
    current.retain(|entity| !entity.text.trim().is_empty());
    debug!(
        "dedup: {} detections -> {} entities in {} pass(es)",
        input,
        current.len(),
        passes
    );
    current
}

fn merge_pass(
    mut entities: Vec<DeduplicatedEntity>,
    thresholds: &DedupThresholds,
) -> (Vec<DeduplicatedEntity>, bool) {
    entities.sort_by(priority);
    let mut consumed = vec![false; entities.len()];
    let mut merged_any = false;
    let mut output = Vec::with_capacity(entities.len());

    for seed_idx in 0..entities.len() {
        if consumed[seed_idx] {
            continue;
        }
        consumed[seed_idx] = true;
        let seed = &entities[seed_idx];
        let mut cluster = seed.clone();
        for other_idx in seed_idx + 1..entities.len() {
            if consumed[other_idx] {
                continue;
            }
            let other = &entities[other_idx];
            if thresholds.should_merge(seed, other) {
                consumed[other_idx] = true;
                cluster.absorb(other);
                merged_any = true;
            }
        }
        output.push(cluster);
    }
    (output, merged_any)
}

/// Confidence descending, then tile row-major, then position, then text.
fn priority(a: &DeduplicatedEntity, b: &DeduplicatedEntity) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then_with(|| a.first_tile().cmp(&b.first_tile()))
        .then_with(|| a.bbox.y1.cmp(&b.bbox.y1))
        .then_with(|| a.bbox.x1.cmp(&b.bbox.x1))
        .then_with(|| a.bbox.y2.cmp(&b.bbox.y2))
        .then_with(|| a.bbox.x2.cmp(&b.bbox.x2))
        .then_with(|| a.text.cmp(&b.text))
}
