use anyhow::{Context, Result, anyhow};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub mod error;
pub mod geometry;
pub mod logging;
pub mod merge;
pub mod pipeline;
pub mod providers;
pub mod recognition;
pub mod reconcile;
pub mod record;
pub mod render;
pub mod restore;
pub mod retry;
pub mod settings;
pub mod tiling;

pub use error::PipelineError;
pub use pipeline::{Pipeline, PipelineConfig, PipelineOutput, PipelineStatus};
pub use recognition::{RecognitionCache, Recognizer};
pub use record::DocumentRecord;

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub input: PathBuf,
    pub output: Option<PathBuf>,
    pub model: Option<String>,
    pub key: Option<String>,
    pub max_tile: Option<u32>,
    pub overlap: Option<f32>,
    pub no_ocr: bool,
    pub no_vision: bool,
    pub ocr_languages: Option<String>,
    pub instructions: Option<String>,
    pub dpi: Option<u32>,
    pub settings_path: Option<String>,
    pub debug_overlay: Option<PathBuf>,
    pub plan_only: bool,
}

/// Runs one drawing end to end. Returns the JSON to print, or a one-line
/// summary when the record was written to `config.output`.
pub async fn run(config: Config) -> Result<String> {
    let settings_path = config.settings_path.as_deref().map(Path::new);
    let mut settings = settings::load_settings(settings_path)?;
    apply_overrides(&mut settings, &config);

    let bytes = fs::read(&config.input)
        .with_context(|| format!("failed to read drawing: {}", config.input.display()))?;
    let pipeline = Pipeline::new(PipelineConfig::from_settings(&settings));

    if config.plan_only {
        let (width, height) = pipeline::image_dimensions(&bytes)?;
        let tiles = pipeline.plan(width, height)?;
        return serde_json::to_string_pretty(&tiles).with_context(|| "failed to serialize tiles");
    }

    let recognizers = build_recognizers(&settings, &config)?;
    let cache = RecognitionCache::new();
    let stop = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        warn!("interrupted; abandoning pending tiles");
    };
    let output = pipeline.run(&bytes, &recognizers, &cache, stop).await?;
    if output.status == PipelineStatus::Failed {
        warn!("recognition failed on every tile");
    }

    if let Some(path) = config.debug_overlay.as_deref() {
        write_overlay(&bytes, &output, path)?;
    }

    let record = DocumentRecord::from_output(&output)?;
    match config.output.as_deref() {
        Some(path) => {
            record.save(path)?;
            Ok(format!(
                "{}: {} entities written to {}",
                output.status.as_str(),
                record.entities.len(),
                path.display()
            ))
        }
        None => record.to_json(),
    }
}

fn apply_overrides(settings: &mut settings::Settings, config: &Config) {
    if let Some(max_tile) = config.max_tile {
        settings.max_tile_dimension = max_tile;
    }
    if let Some(overlap) = config.overlap {
        settings.overlap_ratio = overlap;
    }
    if config.no_ocr {
        settings.ocr_enabled = false;
    }
    if config.no_vision {
        settings.vision_enabled = false;
    }
    if let Some(languages) = config.ocr_languages.as_deref()
        && !languages.trim().is_empty()
    {
        settings.ocr_languages = languages.trim().to_string();
    }
    if let Some(dpi) = config.dpi.filter(|dpi| *dpi > 0) {
        settings.ocr_dpi = dpi;
    }
    if let Some(instructions) = config.instructions.as_deref()
        && !instructions.trim().is_empty()
    {
        settings.vision_instructions = Some(instructions.trim().to_string());
    }
    if let Some(model) = config.model.as_deref()
        && !model.trim().is_empty()
    {
        settings.vision_model = Some(model.trim().to_string());
    }
}

fn build_recognizers(
    settings: &settings::Settings,
    config: &Config,
) -> Result<Vec<Box<dyn Recognizer>>> {
    let mut recognizers: Vec<Box<dyn Recognizer>> = Vec::new();

    if settings.ocr_enabled {
        let ocr = recognition::TesseractRecognizer::new(&settings.ocr_languages, settings.ocr_dpi)
            .with_context(|| "failed to set up OCR")?;
        recognizers.push(Box::new(ocr));
    }

    if settings.vision_enabled {
        let selection = providers::resolve_provider_selection(
            settings.vision_model.as_deref(),
            config.key.as_deref(),
        )?;
        let key = providers::resolve_key(selection.provider, config.key.as_deref())
            .with_context(|| "no API key found for selected provider")?;
        let model = selection.model();
        let name = format!("{}:{}", selection.provider.as_str(), model);
        let provider = providers::build_provider(selection.provider, key, model);
        let mut vision =
            recognition::VisionRecognizer::new(provider, name.clone(), settings.vision_mode);
        if let Some(instructions) = settings.vision_instructions.as_deref() {
            vision = vision.with_instructions(instructions);
        }
        info!("vision recognition through {}", name);
        recognizers.push(Box::new(vision));
    }

    if recognizers.is_empty() {
        return Err(anyhow!("both OCR and vision recognition are disabled"));
    }
    Ok(recognizers)
}

fn write_overlay(image_bytes: &[u8], output: &PipelineOutput, path: &Path) -> Result<()> {
    let mime = output.image.mime.as_deref().unwrap_or(tiling::TILE_MIME);
    let svg = render::render_overlay_svg(
        image_bytes,
        mime,
        output.image.width,
        output.image.height,
        &output.tiles,
        &output.entities,
    );
    let png = render::render_png(&svg)?;
    fs::write(path, png)
        .with_context(|| format!("failed to write debug overlay: {}", path.display()))?;
    info!("debug overlay written to {}", path.display());
    Ok(())
}
