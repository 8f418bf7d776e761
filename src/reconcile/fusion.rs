use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::{ConsistencyStatus, ReconcileThresholds, ReconciledPair, Reconciliation, ReviewAction};
use crate::geometry::{BBox, Point, center_distance, union_bbox};
use crate::merge::{ComponentClass, DeduplicatedEntity, EntityKind};
use crate::recognition::Modality;
use crate::tiling::TileIndex;

/// Attribute carrying the component class; compared as a type, not as an attribute.
const CLASS_KEY: &str = "class";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionWeights {
    pub ocr_trust: f32,
    pub vision_trust: f32,
    pub hybrid_trust: f32,
    pub consistency_bonus: f32,
    pub multi_source_bonus: f32,
    /// Centre distance over the larger diagonal beyond which boxes disagree.
    pub spatial_conflict_ratio: f32,
    pub confidence_conflict_gap: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            ocr_trust: 0.8,
            vision_trust: 0.9,
            hybrid_trust: 1.0,
            consistency_bonus: 0.1,
            multi_source_bonus: 0.05,
            spatial_conflict_ratio: 0.5,
            confidence_conflict_gap: 0.3,
        }
    }
}

impl FusionWeights {
    fn trust(&self, modality: Modality) -> f32 {
        match modality {
            Modality::Ocr => self.ocr_trust,
            Modality::Vision => self.vision_trust,
            Modality::Hybrid => self.hybrid_trust,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    Spatial,
    Attribute,
    Semantic,
    Confidence,
}

impl ConflictKind {
    pub fn strategy(&self) -> &'static str {
        match self {
            ConflictKind::Spatial => "most_complete_geometry",
            ConflictKind::Attribute => "most_complete_attributes",
            ConflictKind::Semantic => "prefer_vision",
            ConflictKind::Confidence => "highest_confidence",
        }
    }
}

/// Summary of the member that lost a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alternative {
    pub id: String,
    pub source: Modality,
    pub confidence: f32,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub kind: ConflictKind,
    pub strategy: String,
    pub discarded: Alternative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub modalities: BTreeSet<Modality>,
    pub tiles: BTreeSet<TileIndex>,
    pub members: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedEntity {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EntityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<ComponentClass>,
    pub label: String,
    pub attributes: BTreeMap<String, String>,
    pub bbox: BBox,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polygon: Option<Vec<Point>>,
    pub confidence: f32,
    pub provenance: Provenance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consistency_score: Option<f32>,
    pub status: ConsistencyStatus,
    pub action: ReviewAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<ConflictResolution>,
}

#[derive(Debug, Clone, Copy)]
pub enum FusionInput<'a> {
    Pair(&'a ReconciledPair),
    Single(&'a DeduplicatedEntity),
}

/// Fuses every reconciled pair and leftover entity, pairs first.
pub fn fuse_all(
    reconciliation: &Reconciliation,
    weights: &FusionWeights,
    thresholds: &ReconcileThresholds,
) -> Vec<FusedEntity> {
    let pairs = reconciliation.matched.iter().map(FusionInput::Pair);
    let singles = reconciliation
        .ocr_only
        .iter()
        .chain(&reconciliation.vision_only)
        .map(FusionInput::Single);
    pairs
        .chain(singles)
        .map(|input| fuse(input, weights, thresholds))
        .collect()
}

pub fn fuse(
    input: FusionInput<'_>,
    weights: &FusionWeights,
    thresholds: &ReconcileThresholds,
) -> FusedEntity {
    match input {
        FusionInput::Single(entity) => fuse_single(entity, thresholds),
        FusionInput::Pair(pair) => match (pair.ocr.as_ref(), pair.vision.as_ref()) {
            (Some(ocr), Some(vision)) => fuse_pair(pair, ocr, vision, weights),
            (Some(entity), None) | (None, Some(entity)) => fuse_single(entity, thresholds),
            (None, None) => empty_entity(pair),
        },
    }
}

fn fuse_single(entity: &DeduplicatedEntity, thresholds: &ReconcileThresholds) -> FusedEntity {
    let action = if entity.confidence >= thresholds.consistency_threshold {
        ReviewAction::Accept
    } else {
        ReviewAction::ManualReview
    };
    let label = entity.text.clone();
    FusedEntity {
        id: entity_id(entity.kind, &label, &entity.bbox),
        kind: entity.kind,
        class: entity.class,
        label,
        attributes: entity.attributes.clone(),
        bbox: entity.bbox,
        polygon: entity.polygon.clone(),
        confidence: entity.confidence.clamp(0.0, 1.0),
        provenance: provenance(&[entity]),
        consistency_score: None,
        status: ConsistencyStatus::SingleSource,
        action,
        conflict: None,
    }
}

fn fuse_pair(
    pair: &ReconciledPair,
    ocr: &DeduplicatedEntity,
    vision: &DeduplicatedEntity,
    weights: &FusionWeights,
) -> FusedEntity {
    let (kind, class, label, attributes, bbox, polygon, confidence, conflict) =
        match detect_conflict(ocr, vision, weights) {
            Some(conflict) => {
                let (winner, loser) = resolve(conflict, ocr, vision);
                debug!(
                    "{:?} conflict between '{}' and '{}': kept {} member",
                    conflict,
                    ocr.text,
                    vision.text,
                    winner.modality.as_str()
                );
                let confidence = match conflict {
                    ConflictKind::Confidence => winner.confidence,
                    _ => blended_confidence(ocr, vision, weights),
                };
                let mut attributes = winner.attributes.clone();
                for (key, value) in &loser.attributes {
                    attributes
                        .entry(key.clone())
                        .or_insert_with(|| value.clone());
                }
                let resolution = ConflictResolution {
                    kind: conflict,
                    strategy: conflict.strategy().to_string(),
                    discarded: Alternative {
                        id: entity_id(loser.kind, &loser.text, &loser.bbox),
                        source: loser.modality,
                        confidence: loser.confidence,
                        label: loser.text.clone(),
                    },
                };
                (
                    winner.kind,
                    winner.class,
                    winner.text.clone(),
                    attributes,
                    winner.bbox,
                    winner.polygon.clone(),
                    confidence,
                    Some(resolution),
                )
            }
            None => {
                let label = if ocr.text.trim().is_empty() {
                    vision.text.clone()
                } else {
                    ocr.text.clone()
                };
                let kind = match ocr.kind {
                    EntityKind::Unknown => vision.kind,
                    kind => kind,
                };
                let mut attributes = ocr.attributes.clone();
                for (key, value) in &vision.attributes {
                    attributes
                        .entry(key.clone())
                        .or_insert_with(|| value.clone());
                }
                (
                    kind,
                    vision.class.or(ocr.class),
                    label,
                    attributes,
                    union_bbox(&ocr.bbox, &vision.bbox),
                    vision.polygon.clone().or_else(|| ocr.polygon.clone()),
                    blended_confidence(ocr, vision, weights),
                    None,
                )
            }
        };

    let (status, action) = match (&conflict, pair.status) {
        (Some(resolution), ConsistencyStatus::Consistent)
            if resolution.kind == ConflictKind::Semantic =>
        {
            (ConsistencyStatus::LowConfidence, ReviewAction::ManualReview)
        }
        _ => (pair.status, pair.action),
    };

    FusedEntity {
        id: entity_id(kind, &label, &bbox),
        kind,
        class,
        label,
        attributes,
        bbox,
        polygon,
        confidence: confidence.clamp(0.0, 1.0),
        provenance: provenance(&[ocr, vision]),
        consistency_score: Some(pair.consistency_score),
        status,
        action,
        conflict,
    }
}

fn empty_entity(pair: &ReconciledPair) -> FusedEntity {
    let bbox = BBox::new(0, 0, 0, 0);
    FusedEntity {
        id: entity_id(EntityKind::Unknown, "", &bbox),
        kind: EntityKind::Unknown,
        class: None,
        label: String::new(),
        attributes: BTreeMap::new(),
        bbox,
        polygon: None,
        confidence: 0.0,
        provenance: provenance(&[]),
        consistency_score: Some(pair.consistency_score),
        status: pair.status,
        action: pair.action,
        conflict: None,
    }
}

/// First matching conflict in priority order: spatial, attribute, semantic,
/// confidence.
fn detect_conflict(
    ocr: &DeduplicatedEntity,
    vision: &DeduplicatedEntity,
    weights: &FusionWeights,
) -> Option<ConflictKind> {
    let scale = ocr.bbox.diagonal().max(vision.bbox.diagonal()).max(1.0);
    if center_distance(&ocr.bbox, &vision.bbox) / scale > weights.spatial_conflict_ratio {
        return Some(ConflictKind::Spatial);
    }
    let attribute_clash = ocr.attributes.iter().any(|(key, value)| {
        key != CLASS_KEY
            && vision
                .attributes
                .get(key)
                .is_some_and(|other| !other.eq_ignore_ascii_case(value))
    });
    if attribute_clash {
        return Some(ConflictKind::Attribute);
    }
    if types_disagree(ocr, vision) {
        return Some(ConflictKind::Semantic);
    }
    if (ocr.confidence - vision.confidence).abs() > weights.confidence_conflict_gap {
        return Some(ConflictKind::Confidence);
    }
    None
}

/// Two classes must match. Without both classes, the entity kinds must be
/// equal, or a component code paired with a located component.
fn types_disagree(ocr: &DeduplicatedEntity, vision: &DeduplicatedEntity) -> bool {
    if let (Some(left), Some(right)) = (ocr.class, vision.class) {
        return left != right;
    }
    let component =
        |kind: EntityKind| matches!(kind, EntityKind::ComponentId | EntityKind::Component);
    match (ocr.kind, vision.kind) {
        (EntityKind::Unknown, _) | (_, EntityKind::Unknown) => false,
        (left, right) if left == right => false,
        (left, right) => !(component(left) && component(right)),
    }
}

fn resolve<'a>(
    conflict: ConflictKind,
    ocr: &'a DeduplicatedEntity,
    vision: &'a DeduplicatedEntity,
) -> (&'a DeduplicatedEntity, &'a DeduplicatedEntity) {
    let by_confidence = |a: &'a DeduplicatedEntity, b: &'a DeduplicatedEntity| {
        if b.confidence > a.confidence {
            (b, a)
        } else {
            (a, b)
        }
    };
    match conflict {
        ConflictKind::Spatial => {
            let completeness = |entity: &DeduplicatedEntity| {
                entity.polygon.as_ref().map_or(0, |points| points.len().min(8)) + 1
            };
            match completeness(vision).cmp(&completeness(ocr)) {
                std::cmp::Ordering::Greater => (vision, ocr),
                std::cmp::Ordering::Less => (ocr, vision),
                std::cmp::Ordering::Equal => by_confidence(vision, ocr),
            }
        }
        ConflictKind::Attribute => match vision.attributes.len().cmp(&ocr.attributes.len()) {
            std::cmp::Ordering::Greater => (vision, ocr),
            std::cmp::Ordering::Less => (ocr, vision),
            std::cmp::Ordering::Equal => by_confidence(vision, ocr),
        },
        ConflictKind::Semantic => (vision, ocr),
        ConflictKind::Confidence => by_confidence(vision, ocr),
    }
}

/// Trust-weighted mean plus agreement and multi-source bonuses.
fn blended_confidence(
    ocr: &DeduplicatedEntity,
    vision: &DeduplicatedEntity,
    weights: &FusionWeights,
) -> f32 {
    let ocr_trust = weights.trust(ocr.modality);
    let vision_trust = weights.trust(vision.modality);
    let total_trust = (ocr_trust + vision_trust).max(f32::EPSILON);
    let mean = (ocr.confidence * ocr_trust + vision.confidence * vision_trust) / total_trust;

    let mut compared = 0usize;
    let mut agreed = 0usize;
    for (key, value) in &ocr.attributes {
        if key == CLASS_KEY {
            continue;
        }
        if let Some(other) = vision.attributes.get(key) {
            compared += 1;
            if other.eq_ignore_ascii_case(value) {
                agreed += 1;
            }
        }
    }
    if let (Some(left), Some(right)) = (ocr.class, vision.class) {
        compared += 1;
        if left == right {
            agreed += 1;
        }
    }
    let agreement = if compared == 0 {
        0.0
    } else {
        agreed as f32 / compared as f32
    };

    (mean + weights.consistency_bonus * agreement + weights.multi_source_bonus).clamp(0.0, 1.0)
}

fn provenance(members: &[&DeduplicatedEntity]) -> Provenance {
    Provenance {
        modalities: members.iter().map(|entity| entity.modality).collect(),
        tiles: members
            .iter()
            .flat_map(|entity| entity.tiles.iter().copied())
            .collect(),
        members: members.iter().map(|entity| entity.members).sum(),
    }
}

/// Content-derived id, identical for identical type, label and box.
fn entity_id(kind: EntityKind, label: &str, bbox: &BBox) -> String {
    let key = format!(
        "{}|{}|{},{},{},{}",
        kind.as_str(),
        label.trim(),
        bbox.x1,
        bbox.y1,
        bbox.x2,
        bbox.y2
    );
    format!("{:x}", md5::compute(key.as_bytes()))
}
