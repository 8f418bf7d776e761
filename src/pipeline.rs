use anyhow::{Result, anyhow};
use futures_util::FutureExt;
use futures_util::future::join_all;
use image::{DynamicImage, GenericImageView};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::future::Future;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::merge::{self, DedupThresholds, DeduplicatedEntity};
use crate::recognition::{
    Modality, RecognitionCache, Recognizer, RetryPolicy, TileOutcome, TileStatus, recognize_tiles,
};
use crate::reconcile::{self, FusedEntity, FusionWeights, ReconcileThresholds};
use crate::restore::restore_outcomes;
use crate::settings::Settings;
use crate::tiling::{self, TileImage, TileIndex, TileSpec};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_tile_dimension: u32,
    pub overlap_ratio: f32,
    pub retry: RetryPolicy,
    pub dedup: DedupThresholds,
    pub reconcile: ReconcileThresholds,
    pub fusion: FusionWeights,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl PipelineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_tile_dimension: settings.max_tile_dimension,
            overlap_ratio: settings.overlap_ratio,
            retry: settings.retry_policy(),
            dedup: settings.dedup,
            reconcile: settings.reconcile,
            fusion: settings.fusion,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Completed,
    /// Every tile was read and nothing was found.
    NoDetections,
    /// No tile produced a usable result.
    Failed,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Completed => "completed",
            PipelineStatus::NoDetections => "no_detections",
            PipelineStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileReport {
    pub tile: TileIndex,
    pub modality: Modality,
    pub recognizer: String,
    pub attempts: usize,
    pub outcome: TileStatus,
    pub detections: usize,
}

impl From<&TileOutcome> for TileReport {
    fn from(outcome: &TileOutcome) -> Self {
        Self {
            tile: outcome.tile.index,
            modality: outcome.modality,
            recognizer: outcome.recognizer.clone(),
            attempts: outcome.attempts,
            outcome: outcome.status.clone(),
            detections: outcome.detections.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub matched: usize,
    pub ocr_only: usize,
    pub vision_only: usize,
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub image: ImageInfo,
    pub status: PipelineStatus,
    pub tiles: Vec<TileSpec>,
    pub tile_reports: Vec<TileReport>,
    /// Deduplicated OCR entities in reading order.
    pub ocr_entities: Vec<DeduplicatedEntity>,
    /// Deduplicated vision and hybrid entities in reading order.
    pub vision_entities: Vec<DeduplicatedEntity>,
    pub summary: ReconcileSummary,
    pub entities: Vec<FusedEntity>,
    pub reading_text: Vec<String>,
}

/// A decoded drawing cut into tiles, ready for the recognizers.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub info: ImageInfo,
    pub tiles: Vec<TileImage>,
}

impl PreparedImage {
    pub fn specs(&self) -> Vec<TileSpec> {
        self.tiles.iter().map(|tile| tile.spec.clone()).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn plan(&self, image_width: u32, image_height: u32) -> Result<Vec<TileSpec>, PipelineError> {
        tiling::plan(
            image_width,
            image_height,
            self.config.max_tile_dimension,
            self.config.overlap_ratio,
        )
    }

    pub fn prepare(&self, image_bytes: &[u8]) -> Result<PreparedImage, PipelineError> {
        let image = image::load_from_memory(image_bytes).map_err(PipelineError::ImageDecode)?;
        let info = image_info(&image, image_bytes);
        let specs = self.plan(info.width, info.height)?;
        let tiles = specs
            .iter()
            .map(|spec| tiling::extract(&image, spec))
            .collect::<Result<Vec<_>, _>>()?;
        info!(
            "prepared {}x{} image as {} tile(s)",
            info.width,
            info.height,
            tiles.len()
        );
        Ok(PreparedImage { info, tiles })
    }

    /// Tiles the image, runs every recognizer over the tiles concurrently and
    /// reconciles what they report. `stop` abandons whatever is still pending.
    pub async fn run<S>(
        &self,
        image_bytes: &[u8],
        recognizers: &[Box<dyn Recognizer>],
        cache: &RecognitionCache,
        stop: S,
    ) -> Result<PipelineOutput>
    where
        S: Future<Output = ()>,
    {
        if recognizers.is_empty() {
            return Err(anyhow!("no recognizers configured"));
        }
        let prepared = self.prepare(image_bytes)?;
        let stop = Box::pin(stop).shared();

        let batches = recognizers.iter().map(|recognizer| {
            recognize_tiles(
                &prepared.tiles,
                recognizer.as_ref(),
                &self.config.retry,
                cache,
                stop.clone(),
            )
        });
        let outcomes = join_all(batches).await.into_iter().flatten().collect();

        let specs = prepared.specs();
        Ok(self.aggregate(prepared.info, specs, outcomes))
    }

    /// Everything after recognition: restore, dedup, order, reconcile, fuse.
    pub fn aggregate(
        &self,
        image: ImageInfo,
        tiles: Vec<TileSpec>,
        outcomes: Vec<TileOutcome>,
    ) -> PipelineOutput {
        let tile_reports = outcomes.iter().map(TileReport::from).collect::<Vec<_>>();
        let failed = outcomes.iter().filter(|outcome| !outcome.succeeded()).count();
        if failed > 0 {
            warn!(
                "{} of {} tile recognitions produced no result",
                failed,
                outcomes.len()
            );
        }

        let (ocr, visual): (Vec<_>, Vec<_>) = restore_outcomes(&outcomes)
            .into_iter()
            .partition(|detection| detection.modality() == Modality::Ocr);

        let ocr_entities = merge::deduplicate(&ocr, &self.config.dedup);
        let vision_entities = merge::deduplicate(&visual, &self.config.dedup);
        info!(
            "deduplicated {} ocr detections into {} entities, {} vision detections into {}",
            ocr.len(),
            ocr_entities.len(),
            visual.len(),
            vision_entities.len()
        );

        let ocr_entities = merge::sort(&ocr_entities, image.width, image.height);
        let vision_entities = merge::sort(&vision_entities, image.width, image.height);
        let reading_text = merge::reading_text(&ocr_entities, image.width, image.height);

        let reconciliation =
            reconcile::reconcile(&ocr_entities, &vision_entities, &self.config.reconcile);
        let summary = ReconcileSummary {
            matched: reconciliation.matched.len(),
            ocr_only: reconciliation.ocr_only.len(),
            vision_only: reconciliation.vision_only.len(),
        };
        let mut entities = reconcile::fuse_all(
            &reconciliation,
            &self.config.fusion,
            &self.config.reconcile,
        );
        entities.sort_by(|a, b| {
            let a = merge::reading_weight(&a.bbox, image.width, image.height);
            let b = merge::reading_weight(&b.bbox, image.width, image.height);
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        });

        let status = if !outcomes.is_empty() && failed == outcomes.len() {
            PipelineStatus::Failed
        } else if entities.is_empty() {
            PipelineStatus::NoDetections
        } else {
            PipelineStatus::Completed
        };
        info!(
            "pipeline {}: {} fused entities",
            status.as_str(),
            entities.len()
        );

        PipelineOutput {
            image,
            status,
            tiles,
            tile_reports,
            ocr_entities,
            vision_entities,
            summary,
            entities,
            reading_text,
        }
    }
}

fn image_info(image: &DynamicImage, bytes: &[u8]) -> ImageInfo {
    let (width, height) = image.dimensions();
    ImageInfo {
        width,
        height,
        mime: infer::get(bytes).map(|kind| kind.mime_type().to_string()),
    }
}

/// Reads only the header to find the image size.
pub fn image_dimensions(image_bytes: &[u8]) -> Result<(u32, u32), PipelineError> {
    image::ImageReader::new(std::io::Cursor::new(image_bytes))
        .with_guessed_format()
        .map_err(|err| PipelineError::ImageDecode(image::ImageError::IoError(err)))?
        .into_dimensions()
        .map_err(PipelineError::ImageDecode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognition::RawDetection;
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(
            width,
            height,
            image::Rgb([255, 255, 255]),
        ));
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn small_tiles() -> Pipeline {
        Pipeline::new(PipelineConfig {
            max_tile_dimension: 64,
            overlap_ratio: 0.1,
            ..PipelineConfig::default()
        })
    }

    fn outcome(spec: &TileSpec, modality: Modality, status: TileStatus) -> TileOutcome {
        TileOutcome {
            tile: spec.clone(),
            modality,
            recognizer: modality.as_str().to_string(),
            attempts: 1,
            status,
            detections: Vec::new(),
        }
    }

    #[test]
    fn prepare_reads_size_and_cuts_tiles() {
        let bytes = png(150, 100);
        let prepared = small_tiles().prepare(&bytes).unwrap();
        assert_eq!(prepared.info.width, 150);
        assert_eq!(prepared.info.height, 100);
        assert_eq!(prepared.info.mime.as_deref(), Some("image/png"));
        assert_eq!(prepared.tiles.len(), 6);
        assert_eq!(image_dimensions(&bytes).unwrap(), (150, 100));
    }

    #[test]
    fn undecodable_bytes_are_an_image_error() {
        let err = small_tiles().prepare(b"not an image").unwrap_err();
        assert!(matches!(err, PipelineError::ImageDecode(_)));
    }

    #[test]
    fn all_failed_tiles_is_failure_not_empty() {
        let pipeline = small_tiles();
        let specs = pipeline.plan(100, 100).unwrap();
        let info = ImageInfo {
            width: 100,
            height: 100,
            mime: None,
        };

        let failed = specs
            .iter()
            .map(|spec| {
                outcome(
                    spec,
                    Modality::Ocr,
                    TileStatus::Failed {
                        error: "boom".to_string(),
                    },
                )
            })
            .collect();
        let output = pipeline.aggregate(info.clone(), specs.clone(), failed);
        assert_eq!(output.status, PipelineStatus::Failed);
        assert_eq!(output.tile_reports.len(), specs.len());

        let clean = specs
            .iter()
            .map(|spec| outcome(spec, Modality::Ocr, TileStatus::Succeeded { cached: false }))
            .collect();
        let output = pipeline.aggregate(info, specs, clean);
        assert_eq!(output.status, PipelineStatus::NoDetections);
        assert!(output.entities.is_empty());
    }

    #[test]
    fn modalities_are_deduplicated_separately() {
        let pipeline = small_tiles();
        let specs = pipeline.plan(100, 100).unwrap();
        let info = ImageInfo {
            width: 100,
            height: 100,
            mime: None,
        };
        let detection = RawDetection {
            text: Some("KZ1".to_string()),
            bbox: vec![10.0, 10.0, 40.0, 20.0],
            confidence: Some(0.9),
            ..RawDetection::default()
        };
        let mut ocr = outcome(&specs[0], Modality::Ocr, TileStatus::Succeeded { cached: false });
        ocr.detections.push(detection.clone());
        let mut vision = outcome(
            &specs[0],
            Modality::Hybrid,
            TileStatus::Succeeded { cached: false },
        );
        vision.detections.push(detection);

        let output = pipeline.aggregate(info, specs, vec![ocr, vision]);
        assert_eq!(output.ocr_entities.len(), 1);
        assert_eq!(output.vision_entities.len(), 1);
        assert_eq!(output.summary.matched, 1);
        assert_eq!(output.entities.len(), 1);
        assert_eq!(output.status, PipelineStatus::Completed);
        assert_eq!(output.reading_text, vec!["KZ1".to_string()]);
    }
}
