use anyhow::{Context, Result, anyhow};
use serde_json::{Value, json};
use tera::{Context as TeraContext, Tera};
use tracing::{debug, warn};

use super::{Modality, RawDetection, RecognizeFuture, Recognizer};
use crate::merge::ComponentClass;
use crate::providers::{ImageAttachment, Provider, ProviderImpl, ToolSpec};
use crate::tiling::TileImage;

pub const DETECTION_TOOL: &str = "report_detections";

const SYSTEM_TEMPLATE: &str = include_str!("prompts/vision_system.tera");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisionMode {
    /// Components only.
    Detect,
    /// Components plus every readable text run.
    Hybrid,
}

impl VisionMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "detect" | "vision" => Some(VisionMode::Detect),
            "hybrid" => Some(VisionMode::Hybrid),
            _ => None,
        }
    }
}

/// Locates components through a tool-calling multimodal model.
#[derive(Debug, Clone)]
pub struct VisionRecognizer<P: Provider = ProviderImpl> {
    provider: P,
    name: String,
    mode: VisionMode,
    instructions: String,
}

impl<P: Provider> VisionRecognizer<P> {
    pub fn new(provider: P, name: impl Into<String>, mode: VisionMode) -> Self {
        Self {
            provider,
            name: name.into(),
            mode,
            instructions: String::new(),
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into().trim().to_string();
        self
    }

    fn render_system_prompt(&self, tile: &TileImage) -> Result<String> {
        let classes = ComponentClass::ALL
            .iter()
            .map(|class| class.as_str())
            .chain((self.mode == VisionMode::Hybrid).then_some("text"))
            .collect::<Vec<_>>();
        let mut context = TeraContext::new();
        context.insert("tile_width", &tile.spec.width);
        context.insert("tile_height", &tile.spec.height);
        context.insert("classes", &classes);
        context.insert("hybrid", &(self.mode == VisionMode::Hybrid));
        context.insert("instructions", self.instructions.as_str());
        context.insert("tool_name", DETECTION_TOOL);
        Tera::one_off(SYSTEM_TEMPLATE, &context, false)
            .with_context(|| "failed to render vision prompt")
    }
}

impl<P: Provider> Recognizer for VisionRecognizer<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn modality(&self) -> Modality {
        match self.mode {
            VisionMode::Detect => Modality::Vision,
            VisionMode::Hybrid => Modality::Hybrid,
        }
    }

    fn recognize<'a>(&'a self, tile: &'a TileImage) -> RecognizeFuture<'a> {
        Box::pin(async move {
            let system = self.render_system_prompt(tile)?;
            let response = self
                .provider
                .clone()
                .append_system_input(system)
                .append_user_input(format!(
                    "Tile {} of the drawing. Report its components with {}.",
                    tile.spec.index, DETECTION_TOOL
                ))
                .append_user_image(ImageAttachment {
                    mime: tile.mime.clone(),
                    bytes: tile.bytes.clone(),
                })
                .register_tool(tool_spec())
                .call_tool(DETECTION_TOOL)
                .await?;
            if let Some(usage) = response.usage.as_ref() {
                debug!(
                    "{} tile {}: {:?} tokens",
                    self.name, tile.spec.index, usage.total_tokens
                );
            }
            parse_detection_args(response.args)
        })
    }
}

pub fn tool_spec() -> ToolSpec {
    let detection = json!({
        "type": "object",
        "properties": {
            "label": {"type": "string"},
            "type": {"type": "string"},
            "bbox": {
                "type": "array",
                "items": {"type": "number"},
                "minItems": 4,
                "maxItems": 4
            },
            "confidence": {"type": "number"},
            "attributes": {
                "type": "object",
                "additionalProperties": {"type": "string"}
            }
        },
        "required": ["label", "type", "bbox", "confidence"]
    });
    ToolSpec {
        name: DETECTION_TOOL.to_string(),
        description: "Report the construction components found in the drawing tile.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "detections": {"type": "array", "items": detection}
            },
            "required": ["detections"]
        }),
    }
}

/// Accepts `{"detections": [...]}` or a bare list. Entries that are not
/// objects of the expected shape are skipped; geometry is validated later.
pub fn parse_detection_args(args: Value) -> Result<Vec<RawDetection>> {
    let entries = match args {
        Value::Array(entries) => entries,
        Value::Object(mut map) => match map.remove("detections") {
            Some(Value::Array(entries)) => entries,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => return Err(anyhow!("detections is not a list: {}", other)),
        },
        other => return Err(anyhow!("unexpected tool arguments: {}", other)),
    };

    let mut detections = Vec::with_capacity(entries.len());
    for entry in entries {
        match serde_json::from_value::<RawDetection>(entry) {
            Ok(detection) => detections.push(detection),
            Err(err) => warn!("skipping unreadable detection entry: {}", err),
        }
    }
    Ok(detections)
}
