use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::merge::DedupThresholds;
use crate::reconcile::{FusionWeights, ReconcileThresholds};
use crate::recognition::{RetryPolicy, VisionMode};
use crate::retry::Backoff;

const DEFAULT_SETTINGS_TOML: &str = include_str!("../settings.toml");

#[derive(Debug, Clone)]
pub struct Settings {
    pub max_tile_dimension: u32,
    pub overlap_ratio: f32,
    pub concurrency: usize,
    pub max_retries: usize,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub tile_timeout: Option<Duration>,
    pub batch_timeout: Option<Duration>,
    pub dedup: DedupThresholds,
    pub reconcile: ReconcileThresholds,
    pub fusion: FusionWeights,
    pub ocr_enabled: bool,
    pub ocr_languages: String,
    pub ocr_dpi: u32,
    pub vision_enabled: bool,
    pub vision_model: Option<String>,
    pub vision_mode: VisionMode,
    pub vision_instructions: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_tile_dimension: 2048,
            overlap_ratio: 0.1,
            concurrency: 0,
            max_retries: 2,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(8),
            tile_timeout: Some(Duration::from_secs(120)),
            batch_timeout: None,
            dedup: DedupThresholds::default(),
            reconcile: ReconcileThresholds::default(),
            fusion: FusionWeights::default(),
            ocr_enabled: true,
            ocr_languages: "eng".to_string(),
            ocr_dpi: 300,
            vision_enabled: true,
            vision_model: None,
            vision_mode: VisionMode::Detect,
            vision_instructions: None,
        }
    }
}

impl Settings {
    pub fn retry_policy(&self) -> RetryPolicy {
        let concurrency = if self.concurrency == 0 {
            num_cpus::get()
        } else {
            self.concurrency
        };
        RetryPolicy {
            concurrency: concurrency.max(1),
            max_retries: self.max_retries,
            backoff: Backoff {
                base: self.retry_base_delay,
                max: self.retry_max_delay.max(self.retry_base_delay),
            },
            tile_timeout: self.tile_timeout,
            batch_timeout: self.batch_timeout,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    tiling: Option<TilingSection>,
    recognition: Option<RecognitionSection>,
    dedup: Option<DedupSection>,
    reconcile: Option<ReconcileSection>,
    fusion: Option<FusionSection>,
    ocr: Option<OcrSection>,
    vision: Option<VisionSection>,
}

#[derive(Debug, Default, Deserialize)]
struct TilingSection {
    max_tile_dimension: Option<u32>,
    overlap_ratio: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct RecognitionSection {
    concurrency: Option<usize>,
    max_retries: Option<usize>,
    retry_base_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
    tile_timeout_secs: Option<u64>,
    batch_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct DedupSection {
    iou_merge: Option<f32>,
    text_merge: Option<f32>,
    text_merge_min_iou: Option<f32>,
    mixed_iou: Option<f32>,
    mixed_text: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct ReconcileSection {
    spatial_weight: Option<f32>,
    semantic_weight: Option<f32>,
    distance_weight: Option<f32>,
    area_weight: Option<f32>,
    match_threshold: Option<f32>,
    consistency_threshold: Option<f32>,
    inconsistent_threshold: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct FusionSection {
    ocr_trust: Option<f32>,
    vision_trust: Option<f32>,
    hybrid_trust: Option<f32>,
    consistency_bonus: Option<f32>,
    multi_source_bonus: Option<f32>,
    spatial_conflict_ratio: Option<f32>,
    confidence_conflict_gap: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct OcrSection {
    enabled: Option<bool>,
    languages: Option<String>,
    dpi: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct VisionSection {
    enabled: Option<bool>,
    model: Option<String>,
    mode: Option<String>,
    instructions: Option<String>,
}

pub fn load_settings(extra_path: Option<&Path>) -> Result<Settings> {
    let mut settings = Settings::default();
    ensure_home_settings_file()?;

    let mut ordered_paths = vec![
        PathBuf::from("settings.toml"),
        PathBuf::from("settings.local.toml"),
    ];
    if let Some(home) = home_dir() {
        ordered_paths.push(home.join("settings.toml"));
        ordered_paths.push(home.join("settings.local.toml"));
    }
    if let Some(extra) = extra_path {
        if !extra.exists() {
            return Err(anyhow!("settings file not found: {}", extra.display()));
        }
        ordered_paths.push(extra.to_path_buf());
    }

    for path in ordered_paths {
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read settings: {}", path.display()))?;
            settings
                .merge_toml(&content)
                .with_context(|| format!("failed to parse settings: {}", path.display()))?;
        }
    }

    Ok(settings)
}

fn set_positive<T: PartialOrd + Default>(target: &mut T, value: Option<T>) {
    if let Some(value) = value
        && value > T::default()
    {
        *target = value;
    }
}

fn set_fraction(target: &mut f32, value: Option<f32>) {
    if let Some(value) = value
        && value.is_finite()
        && value >= 0.0
    {
        *target = value;
    }
}

fn set_text(target: &mut Option<String>, value: Option<String>) {
    if let Some(value) = value
        && !value.trim().is_empty()
    {
        *target = Some(value.trim().to_string());
    }
}

impl Settings {
    pub fn merge_toml(&mut self, content: &str) -> Result<()> {
        let parsed: SettingsFile = toml::from_str(content)?;
        self.merge(parsed)
    }

    fn merge(&mut self, incoming: SettingsFile) -> Result<()> {
        if let Some(tiling) = incoming.tiling {
            set_positive(&mut self.max_tile_dimension, tiling.max_tile_dimension);
            set_fraction(&mut self.overlap_ratio, tiling.overlap_ratio);
        }
        if let Some(recognition) = incoming.recognition {
            if let Some(concurrency) = recognition.concurrency {
                self.concurrency = concurrency;
            }
            if let Some(retries) = recognition.max_retries {
                self.max_retries = retries;
            }
            if let Some(ms) = recognition.retry_base_delay_ms.filter(|ms| *ms > 0) {
                self.retry_base_delay = Duration::from_millis(ms);
            }
            if let Some(ms) = recognition.retry_max_delay_ms.filter(|ms| *ms > 0) {
                self.retry_max_delay = Duration::from_millis(ms);
            }
            if let Some(secs) = recognition.tile_timeout_secs {
                self.tile_timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
            if let Some(secs) = recognition.batch_timeout_secs {
                self.batch_timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
        }
        if let Some(dedup) = incoming.dedup {
            set_fraction(&mut self.dedup.iou_merge, dedup.iou_merge);
            set_fraction(&mut self.dedup.text_merge, dedup.text_merge);
            set_fraction(&mut self.dedup.text_merge_min_iou, dedup.text_merge_min_iou);
            set_fraction(&mut self.dedup.mixed_iou, dedup.mixed_iou);
            set_fraction(&mut self.dedup.mixed_text, dedup.mixed_text);
        }
        if let Some(reconcile) = incoming.reconcile {
            let target = &mut self.reconcile;
            set_fraction(&mut target.spatial_weight, reconcile.spatial_weight);
            set_fraction(&mut target.semantic_weight, reconcile.semantic_weight);
            set_fraction(&mut target.distance_weight, reconcile.distance_weight);
            set_fraction(&mut target.area_weight, reconcile.area_weight);
            set_fraction(&mut target.match_threshold, reconcile.match_threshold);
            set_fraction(
                &mut target.consistency_threshold,
                reconcile.consistency_threshold,
            );
            set_fraction(
                &mut target.inconsistent_threshold,
                reconcile.inconsistent_threshold,
            );
        }
        if let Some(fusion) = incoming.fusion {
            let target = &mut self.fusion;
            set_fraction(&mut target.ocr_trust, fusion.ocr_trust);
            set_fraction(&mut target.vision_trust, fusion.vision_trust);
            set_fraction(&mut target.hybrid_trust, fusion.hybrid_trust);
            set_fraction(&mut target.consistency_bonus, fusion.consistency_bonus);
            set_fraction(&mut target.multi_source_bonus, fusion.multi_source_bonus);
            set_fraction(
                &mut target.spatial_conflict_ratio,
                fusion.spatial_conflict_ratio,
            );
            set_fraction(
                &mut target.confidence_conflict_gap,
                fusion.confidence_conflict_gap,
            );
        }
        if let Some(ocr) = incoming.ocr {
            if let Some(enabled) = ocr.enabled {
                self.ocr_enabled = enabled;
            }
            if let Some(languages) = ocr.languages
                && !languages.trim().is_empty()
            {
                self.ocr_languages = languages.trim().to_string();
            }
            set_positive(&mut self.ocr_dpi, ocr.dpi);
        }
        if let Some(vision) = incoming.vision {
            if let Some(enabled) = vision.enabled {
                self.vision_enabled = enabled;
            }
            set_text(&mut self.vision_model, vision.model);
            set_text(&mut self.vision_instructions, vision.instructions);
            if let Some(mode) = vision.mode
                && !mode.trim().is_empty()
            {
                self.vision_mode = VisionMode::parse(&mode)
                    .ok_or_else(|| anyhow!("unknown vision mode '{}'", mode))?;
            }
        }
        Ok(())
    }
}

fn ensure_home_settings_file() -> Result<()> {
    let Some(home) = home_dir() else {
        return Ok(());
    };
    fs::create_dir_all(&home)
        .with_context(|| format!("failed to create settings directory: {}", home.display()))?;
    let path = home.join("settings.toml");
    if !path.exists() {
        fs::write(&path, DEFAULT_SETTINGS_TOML)
            .with_context(|| format!("failed to write settings: {}", path.display()))?;
    }
    Ok(())
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().and_then(|home| {
        let home = home.trim();
        if home.is_empty() {
            None
        } else {
            Some(Path::new(home).join(".drawing-reconciler"))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_defaults_match_built_in_defaults() {
        let mut settings = Settings::default();
        settings.merge_toml(DEFAULT_SETTINGS_TOML).unwrap();
        let defaults = Settings::default();
        assert_eq!(settings.max_tile_dimension, defaults.max_tile_dimension);
        assert_eq!(settings.overlap_ratio, defaults.overlap_ratio);
        assert_eq!(settings.dedup, defaults.dedup);
        assert_eq!(settings.reconcile, defaults.reconcile);
        assert_eq!(settings.fusion, defaults.fusion);
        assert_eq!(settings.vision_mode, VisionMode::Detect);
    }

    #[test]
    fn later_layers_override_and_invalid_values_are_ignored() {
        let mut settings = Settings::default();
        settings
            .merge_toml(
                r#"
[tiling]
max_tile_dimension = 1024
overlap_ratio = -0.5

[recognition]
concurrency = 3
tile_timeout_secs = 0

[dedup]
iou_merge = 0.8

[vision]
mode = "hybrid"
model = "  "
"#,
            )
            .unwrap();
        assert_eq!(settings.max_tile_dimension, 1024);
        assert_eq!(settings.overlap_ratio, 0.1);
        assert_eq!(settings.tile_timeout, None);
        assert_eq!(settings.dedup.iou_merge, 0.8);
        assert_eq!(settings.vision_mode, VisionMode::Hybrid);
        assert!(settings.vision_model.is_none());
        assert_eq!(settings.retry_policy().concurrency, 3);
    }

    #[test]
    fn unknown_vision_mode_is_rejected() {
        let mut settings = Settings::default();
        assert!(settings.merge_toml("[vision]\nmode = \"sketch\"\n").is_err());
    }
}
