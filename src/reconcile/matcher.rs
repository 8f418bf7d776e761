use std::collections::BTreeSet;

use crate::geometry::{area_ratio, center_distance};
use crate::merge::DeduplicatedEntity;

use super::ReconcileThresholds;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchScore {
    pub spatial: f32,
    pub semantic: f32,
    pub combined: f32,
}

pub fn score(
    ocr: &DeduplicatedEntity,
    vision: &DeduplicatedEntity,
    thresholds: &ReconcileThresholds,
) -> MatchScore {
    let spatial = spatial_score(ocr, vision, thresholds);
    let semantic = semantic_score(ocr, vision);
    MatchScore {
        spatial,
        semantic,
        combined: thresholds.spatial_weight * spatial + thresholds.semantic_weight * semantic,
    }
}

/// Centre proximity (relative to the larger diagonal) blended with size
/// agreement. Boxes further apart than that diagonal score zero.
pub fn spatial_score(
    a: &DeduplicatedEntity,
    b: &DeduplicatedEntity,
    thresholds: &ReconcileThresholds,
) -> f32 {
    let scale = a.bbox.diagonal().max(b.bbox.diagonal());
    if scale <= 0.0 {
        return 0.0;
    }
    let proximity = 1.0 - center_distance(&a.bbox, &b.bbox) / scale;
    if proximity <= 0.0 {
        return 0.0;
    }
    thresholds.distance_weight * proximity + thresholds.area_weight * area_ratio(&a.bbox, &b.bbox)
}

/// 1.0 for identical text, 0.8 for containment or a shared component class,
/// otherwise a fraction of keyword overlap.
pub fn semantic_score(ocr: &DeduplicatedEntity, vision: &DeduplicatedEntity) -> f32 {
    let a = normalize(&ocr.text);
    let b = normalize(&vision.text);
    if !a.is_empty() && a == b {
        return 1.0;
    }
    if a.chars().count() >= 2 && b.chars().count() >= 2 && (a.contains(&b) || b.contains(&a)) {
        return 0.8;
    }
    if let (Some(left), Some(right)) = (ocr.class, vision.class)
        && left == right
    {
        return 0.8;
    }

    let left = keywords(ocr);
    let right = keywords(vision);
    let union = left.union(&right).count();
    if union == 0 {
        return 0.0;
    }
    let shared = left.intersection(&right).count();
    0.6 * shared as f32 / union as f32
}

fn normalize(text: &str) -> String {
    text.chars()
        .filter(|ch| ch.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn keywords(entity: &DeduplicatedEntity) -> BTreeSet<String> {
    let mut words = entity
        .text
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect::<BTreeSet<_>>();
    if let Some(class) = entity.class {
        words.insert(class.as_str().to_string());
    }
    if let Some(kind) = entity.vision_type.as_deref() {
        words.insert(kind.trim().to_lowercase());
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BBox;
    use crate::merge::{ComponentClass, EntityKind};
    use crate::recognition::Modality;
    use std::collections::BTreeMap;

    fn entity(text: &str, class: Option<ComponentClass>, bbox: BBox) -> DeduplicatedEntity {
        DeduplicatedEntity {
            text: text.to_string(),
            kind: EntityKind::Unknown,
            class,
            vision_type: None,
            bbox,
            polygon: None,
            confidence: 0.9,
            modality: Modality::Ocr,
            tiles: BTreeSet::new(),
            attributes: BTreeMap::new(),
            members: 1,
        }
    }

    #[test]
    fn semantic_tiers() {
        let bbox = BBox::new(0, 0, 10, 10);
        let kz1 = entity("KZ1", Some(ComponentClass::Column), bbox);
        assert_eq!(semantic_score(&kz1, &entity("kz-1", None, bbox)), 1.0);
        assert_eq!(semantic_score(&kz1, &entity("KZ1 500x500", None, bbox)), 0.8);
        assert_eq!(
            semantic_score(&kz1, &entity("column", Some(ComponentClass::Column), bbox)),
            0.8
        );
        assert_eq!(
            semantic_score(&kz1, &entity("beam", Some(ComponentClass::Beam), bbox)),
            0.0
        );
    }

    #[test]
    fn distant_boxes_have_no_spatial_score() {
        let thresholds = ReconcileThresholds::default();
        let a = entity("A", None, BBox::new(0, 0, 10, 10));
        let b = entity("A", None, BBox::new(100, 100, 110, 110));
        assert_eq!(spatial_score(&a, &b, &thresholds), 0.0);
        assert!((spatial_score(&a, &a, &thresholds) - 1.0).abs() < 1e-6);
    }
}
