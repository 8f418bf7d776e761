mod fusion;
mod matcher;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::merge::DeduplicatedEntity;

pub use fusion::{
    Alternative, ConflictKind, ConflictResolution, FusedEntity, FusionInput, FusionWeights,
    Provenance, fuse, fuse_all,
};
pub use matcher::{MatchScore, score, semantic_score, spatial_score};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcileThresholds {
    pub spatial_weight: f32,
    pub semantic_weight: f32,
    /// Share of the spatial score given to centre proximity; the rest is area agreement.
    pub distance_weight: f32,
    pub area_weight: f32,
    pub match_threshold: f32,
    pub consistency_threshold: f32,
    pub inconsistent_threshold: f32,
}

impl Default for ReconcileThresholds {
    fn default() -> Self {
        Self {
            spatial_weight: 0.7,
            semantic_weight: 0.3,
            distance_weight: 0.7,
            area_weight: 0.3,
            match_threshold: 0.5,
            consistency_threshold: 0.7,
            inconsistent_threshold: 0.6,
        }
    }
}

impl ReconcileThresholds {
    pub fn status_for(&self, consistency: f32) -> (ConsistencyStatus, ReviewAction) {
        if consistency >= self.consistency_threshold {
            (ConsistencyStatus::Consistent, ReviewAction::Accept)
        } else if consistency >= self.inconsistent_threshold {
            (ConsistencyStatus::LowConfidence, ReviewAction::ManualReview)
        } else {
            (ConsistencyStatus::Inconsistent, ReviewAction::Investigate)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyStatus {
    Consistent,
    LowConfidence,
    Inconsistent,
    /// Seen by one modality only; nothing to compare against.
    SingleSource,
}

impl ConsistencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsistencyStatus::Consistent => "consistent",
            ConsistencyStatus::LowConfidence => "low_confidence",
            ConsistencyStatus::Inconsistent => "inconsistent",
            ConsistencyStatus::SingleSource => "single_source",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    Accept,
    ManualReview,
    Investigate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledPair {
    pub ocr: Option<DeduplicatedEntity>,
    pub vision: Option<DeduplicatedEntity>,
    pub spatial_score: f32,
    pub semantic_score: f32,
    pub consistency_score: f32,
    pub status: ConsistencyStatus,
    pub action: ReviewAction,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    pub matched: Vec<ReconciledPair>,
    pub ocr_only: Vec<DeduplicatedEntity>,
    pub vision_only: Vec<DeduplicatedEntity>,
}

impl Reconciliation {
    pub fn len(&self) -> usize {
        self.matched.len() + self.ocr_only.len() + self.vision_only.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Greedy one-to-one matching: each OCR entity, in input order, claims the
/// best-scoring vision entity still unclaimed.
pub fn reconcile(
    ocr: &[DeduplicatedEntity],
    vision: &[DeduplicatedEntity],
    thresholds: &ReconcileThresholds,
) -> Reconciliation {
    let mut claimed = vec![false; vision.len()];
    let mut result = Reconciliation::default();

    for ocr_entity in ocr {
        let mut best: Option<(usize, MatchScore)> = None;
        for (idx, vision_entity) in vision.iter().enumerate() {
            if claimed[idx] {
                continue;
            }
            let candidate = score(ocr_entity, vision_entity, thresholds);
            if candidate.combined <= thresholds.match_threshold {
                continue;
            }
            if best
                .as_ref()
                .is_none_or(|(_, current)| candidate.combined > current.combined)
            {
                best = Some((idx, candidate));
            }
        }

        match best {
            Some((idx, found)) => {
                claimed[idx] = true;
                let (status, action) = thresholds.status_for(found.combined);
                debug!(
                    "matched '{}' with '{}' (score {:.3}, {})",
                    ocr_entity.text,
                    vision[idx].text,
                    found.combined,
                    status.as_str()
                );
                result.matched.push(ReconciledPair {
                    ocr: Some(ocr_entity.clone()),
                    vision: Some(vision[idx].clone()),
                    spatial_score: found.spatial,
                    semantic_score: found.semantic,
                    consistency_score: found.combined,
                    status,
                    action,
                });
            }
            None => result.ocr_only.push(ocr_entity.clone()),
        }
    }

    result.vision_only = vision
        .iter()
        .zip(claimed)
        .filter(|(_, taken)| !taken)
        .map(|(entity, _)| entity.clone())
        .collect();

    info!(
        "reconciled {} ocr / {} vision entities: {} matched, {} ocr-only, {} vision-only",
        ocr.len(),
        vision.len(),
        result.matched.len(),
        result.ocr_only.len(),
        result.vision_only.len()
    );
    result
}
