use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::pipeline::{ImageInfo, PipelineOutput, PipelineStatus, ReconcileSummary, TileReport};
use crate::reconcile::FusedEntity;
use crate::tiling::TileSpec;

/// What gets handed to storage and quantity take-off for one drawing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub generated_at: String,
    pub image: ImageInfo,
    pub status: PipelineStatus,
    pub tiles: Vec<TileSpec>,
    pub tile_reports: Vec<TileReport>,
    #[serde(default)]
    pub summary: ReconcileSummary,
    pub entities: Vec<FusedEntity>,
    #[serde(default)]
    pub reading_text: Vec<String>,
}

impl DocumentRecord {
    pub fn from_output(output: &PipelineOutput) -> Result<Self> {
        let generated_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .with_context(|| "failed to format record timestamp")?;
        Ok(Self {
            generated_at,
            image: output.image.clone(),
            status: output.status,
            tiles: output.tiles.clone(),
            tile_reports: output.tile_reports.clone(),
            summary: output.summary,
            entities: output.entities.clone(),
            reading_text: output.reading_text.clone(),
        })
    }

    pub fn generated_at(&self) -> Result<OffsetDateTime> {
        OffsetDateTime::parse(&self.generated_at, &Rfc3339)
            .with_context(|| format!("invalid record timestamp '{}'", self.generated_at))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).with_context(|| "failed to serialize record")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(path, self.to_json()?)
            .with_context(|| format!("failed to write record: {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read record: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse record: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BBox;
    use crate::merge::{DeduplicatedEntity, classify};
    use crate::recognition::{Modality, TileStatus};
    use crate::reconcile::{FusionInput, FusionWeights, ReconcileThresholds, fuse};
    use crate::tiling::{Margins, TileIndex};
    use std::collections::BTreeSet;

    fn record() -> DocumentRecord {
        let classification = classify("KZ1", None);
        let entity = DeduplicatedEntity {
            text: "KZ1".to_string(),
            kind: classification.kind,
            class: classification.class,
            vision_type: None,
            bbox: BBox::new(1943, 100, 1993, 120),
            polygon: None,
            confidence: 0.87,
            modality: Modality::Ocr,
            tiles: BTreeSet::from([TileIndex { row: 0, col: 1 }]),
            attributes: classification.attributes,
            members: 2,
        };
        let fused = fuse(
            FusionInput::Single(&entity),
            &FusionWeights::default(),
            &ReconcileThresholds::default(),
        );
        let tile = TileSpec {
            index: TileIndex { row: 0, col: 1 },
            x: 1843,
            y: 0,
            width: 2048,
            height: 2048,
            margins: Margins {
                left: 205,
                ..Margins::default()
            },
        };
        DocumentRecord {
            generated_at: "2026-10-17T08:30:00Z".to_string(),
            image: ImageInfo {
                width: 3891,
                height: 2048,
                mime: Some("image/png".to_string()),
            },
            status: PipelineStatus::Completed,
            tiles: vec![tile],
            tile_reports: vec![TileReport {
                tile: TileIndex { row: 0, col: 1 },
                modality: Modality::Ocr,
                recognizer: "tesseract".to_string(),
                attempts: 2,
                outcome: TileStatus::Failed {
                    error: "timed out after 120.0s".to_string(),
                },
                detections: 0,
            }],
            summary: ReconcileSummary {
                matched: 0,
                ocr_only: 1,
                vision_only: 0,
            },
            entities: vec![fused],
            reading_text: vec!["KZ1".to_string()],
        }
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records").join("sheet.json");
        let original = record();
        original.save(&path).unwrap();
        let loaded = DocumentRecord::load(&path).unwrap();
        assert_eq!(loaded, original);
        assert_eq!(loaded.entities[0].bbox, BBox::new(1943, 100, 1993, 120));
        assert_eq!(loaded.generated_at().unwrap().year(), 2026);
    }

    #[test]
    fn serialized_shape() {
        let json: serde_json::Value = serde_json::from_str(&record().to_json().unwrap()).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["tile_reports"][0]["outcome"]["status"], "failed");
        assert_eq!(json["entities"][0]["type"], "component_id");
        assert_eq!(json["entities"][0]["status"], "single_source");
        assert_eq!(json["tiles"][0]["x"], 1843);
    }

    #[test]
    fn missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = DocumentRecord::load(&dir.path().join("absent.json")).unwrap_err();
        assert!(format!("{:#}", err).contains("absent.json"));
    }
}
