use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::geometry::{BBox, Point};
use crate::recognition::{Detection, Modality, RawDetection, TileOutcome};
use crate::tiling::{TileIndex, TileSpec};

/// A detection translated from tile-local to source-image pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredDetection {
    pub tile: TileSpec,
    /// The validated detection as the tile reported it.
    pub local: Detection,
    pub bbox: BBox,
    pub polygon: Option<Vec<Point>>,
}

impl RestoredDetection {
    pub fn text(&self) -> &str {
        &self.local.text
    }

    pub fn confidence(&self) -> f32 {
        self.local.confidence
    }

    pub fn modality(&self) -> Modality {
        self.local.modality
    }

    pub fn tile_index(&self) -> TileIndex {
        self.tile.index
    }
}

/// Validates a raw backend detection and moves it into image coordinates.
pub fn restore(
    raw: &RawDetection,
    modality: Modality,
    tile: &TileSpec,
) -> Result<RestoredDetection, PipelineError> {
    let local = Detection::from_raw(raw, modality, tile.index)?;
    Ok(restore_detection(local, tile))
}

pub fn restore_detection(local: Detection, tile: &TileSpec) -> RestoredDetection {
    let (dx, dy) = tile.offset();
    let bbox = local.bbox.translate(dx, dy);
    let polygon = local
        .polygon
        .as_ref()
        .map(|points| points.iter().map(|point| point.translate(dx, dy)).collect());
    RestoredDetection {
        tile: tile.clone(),
        local,
        bbox,
        polygon,
    }
}

/// Restores every detection from a batch of tile outcomes. Malformed
/// detections are dropped with a warning.
pub fn restore_outcomes(outcomes: &[TileOutcome]) -> Vec<RestoredDetection> {
    let mut restored = Vec::new();
    let mut dropped = 0usize;
    for outcome in outcomes {
        for raw in &outcome.detections {
            match restore(raw, outcome.modality, &outcome.tile) {
                Ok(detection) => restored.push(detection),
                Err(err) => {
                    dropped += 1;
                    warn!("dropping detection from {}: {}", outcome.recognizer, err);
                }
            }
        }
    }
    debug!(
        "restored {} detections ({} dropped)",
        restored.len(),
        dropped
    );
    restored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognition::TileStatus;
    use crate::tiling::plan;

    fn raw(text: &str, bbox: Vec<f64>) -> RawDetection {
        RawDetection {
            text: Some(text.to_string()),
            bbox,
            confidence: Some(0.8),
            ..RawDetection::default()
        }
    }

    #[test]
    fn translation_is_exact_for_every_tile() {
        let tiles = plan(6000, 4000, 2048, 0.1).unwrap();
        for tile in &tiles {
            let restored = restore(
                &raw("KL1", vec![10.0, 20.0, 110.0, 45.0]),
                Modality::Ocr,
                tile,
            )
            .unwrap();
            let (x, y) = (tile.x as i64, tile.y as i64);
            assert_eq!(restored.bbox, BBox::new(x + 10, y + 20, x + 110, y + 45));
            assert_eq!(restored.local.bbox, BBox::new(10, 20, 110, 45));
            assert_eq!(restored.tile_index(), tile.index);
        }
    }

    #[test]
    fn polygon_moves_with_the_box() {
        let tiles = plan(4000, 1000, 2048, 0.1).unwrap();
        let tile = &tiles[1];
        let mut detection = raw("Q1", vec![0.0, 0.0, 10.0, 10.0]);
        detection.polygon = Some(vec![vec![0.0, 0.0], vec![10.0, 0.0], vec![10.0, 10.0]]);
        let restored = restore(&detection, Modality::Vision, tile).unwrap();
        let polygon = restored.polygon.unwrap();
        assert_eq!(polygon[1], Point { x: 1843 + 10, y: 0 });
    }

    #[test]
    fn batch_restore_drops_malformed() {
        let tiles = plan(100, 100, 2048, 0.1).unwrap();
        let outcome = TileOutcome {
            tile: tiles[0].clone(),
            modality: Modality::Ocr,
            recognizer: "test".to_string(),
            attempts: 1,
            status: TileStatus::Succeeded { cached: false },
            detections: vec![
                raw("ok", vec![1.0, 1.0, 5.0, 5.0]),
                raw("short", vec![1.0, 1.0, 5.0]),
                raw("flat", vec![1.0, 1.0, 1.0, 5.0]),
            ],
        };
        let restored = restore_outcomes(&[outcome]);
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].text(), "ok");
    }

    #[test]
    fn huge_coordinates_off_the_origin_tile_are_dropped() {
        let tiles = plan(4000, 1000, 2048, 0.1).unwrap();
        assert_eq!(tiles[1].index, crate::tiling::TileIndex { row: 0, col: 1 });
        let mut bent = raw("bent", vec![0.0, 0.0, 10.0, 10.0]);
        bent.polygon = Some(vec![vec![0.0, 0.0], vec![-1e300, 5.0]]);
        let outcome = TileOutcome {
            tile: tiles[1].clone(),
            modality: Modality::Vision,
            recognizer: "test".to_string(),
            attempts: 1,
            status: TileStatus::Succeeded { cached: false },
            detections: vec![
                raw("wide", vec![0.0, 0.0, 1e30, 10.0]),
                bent,
                raw("ok", vec![1.0, 1.0, 5.0, 5.0]),
            ],
        };
        let restored = restore_outcomes(&[outcome]);
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].text(), "ok");
        assert_eq!(restored[0].bbox, BBox::new(1844, 1, 1848, 5));
    }
}
