use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "drawing-reconciler",
    version,
    about = "Read a construction drawing with OCR and a vision model and reconcile the results"
)]
struct Cli {
    /// Drawing image (png, jpeg, tiff, ...)
    #[arg(short = 'i', long = "input")]
    input: PathBuf,

    /// Write the document record here instead of stdout
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Vision model name or provider:model (e.g. openai:MODEL_ID)
    #[arg(short = 'm', long = "model")]
    model: Option<String>,

    /// API key (overrides environment variables)
    #[arg(short = 'k', long = "key")]
    key: Option<String>,

    /// Longest tile side in pixels
    #[arg(long = "max-tile")]
    max_tile: Option<u32>,

    /// Overlap between neighbouring tiles as a fraction of the tile size
    #[arg(long = "overlap")]
    overlap: Option<f32>,

    /// Skip OCR
    #[arg(long = "no-ocr")]
    no_ocr: bool,

    /// Skip the vision model
    #[arg(long = "no-vision")]
    no_vision: bool,

    /// Tesseract languages (e.g. eng+chi_sim)
    #[arg(long = "ocr-languages")]
    ocr_languages: Option<String>,

    /// Extra instructions for the vision model
    #[arg(long = "instructions")]
    instructions: Option<String>,

    /// Resolution hint passed to OCR
    #[arg(long = "dpi")]
    dpi: Option<u32>,

    /// Read extra settings from a local TOML file
    #[arg(short = 'r', long = "read-settings")]
    read_settings: Option<String>,

    /// Write a PNG with tiles and entity boxes drawn over the drawing
    #[arg(long = "debug-overlay")]
    debug_overlay: Option<PathBuf>,

    /// Print the tile grid and exit
    #[arg(long = "plan-only")]
    plan_only: bool,

    /// Enable verbose logging
    #[arg(long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    drawing_reconciler::logging::init(cli.verbose)?;

    let output = drawing_reconciler::run(drawing_reconciler::Config {
        input: cli.input,
        output: cli.output,
        model: cli.model,
        key: cli.key,
        max_tile: cli.max_tile,
        overlap: cli.overlap,
        no_ocr: cli.no_ocr,
        no_vision: cli.no_vision,
        ocr_languages: cli.ocr_languages,
        instructions: cli.instructions,
        dpi: cli.dpi,
        settings_path: cli.read_settings,
        debug_overlay: cli.debug_overlay,
        plan_only: cli.plan_only,
    })
    .await?;

    println!("{}", output);
    Ok(())
}
