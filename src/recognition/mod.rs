use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use crate::error::PipelineError;
use crate::geometry::{BBox, Point};
use crate::tiling::{TileImage, TileIndex};

mod batch;
mod cache;
mod tesseract;
mod vision;

pub use batch::{RetryPolicy, TileOutcome, TileStatus, recognize_tiles};
pub use cache::RecognitionCache;
pub use tesseract::TesseractRecognizer;
pub use vision::{DETECTION_TOOL, VisionMode, VisionRecognizer};

/// Confidence assumed when a backend omits one.
pub const DEFAULT_CONFIDENCE: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Ocr,
    Vision,
    /// Vision model asked to transcribe text as well as locate components.
    Hybrid,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Ocr => "ocr",
            Modality::Vision => "vision",
            Modality::Hybrid => "hybrid",
        }
    }

    pub fn is_visual(&self) -> bool {
        matches!(self, Modality::Vision | Modality::Hybrid)
    }
}

/// Detection as a backend reports it, before any validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub bbox: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polygon: Option<Vec<Vec<f64>>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

/// Validated detection in tile-local pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub text: String,
    pub kind: Option<String>,
    pub bbox: BBox,
    pub confidence: f32,
    pub polygon: Option<Vec<Point>>,
    pub attributes: BTreeMap<String, String>,
    pub modality: Modality,
    pub tile: TileIndex,
}

impl Detection {
    pub fn from_raw(
        raw: &RawDetection,
        modality: Modality,
        tile: TileIndex,
    ) -> Result<Self, PipelineError> {
        if raw.bbox.len() < 4 {
            return Err(PipelineError::malformed(
                tile,
                format!("bbox has {} components, expected 4", raw.bbox.len()),
            ));
        }
        if raw.bbox[..4].iter().any(|value| !value.is_finite()) {
            return Err(PipelineError::malformed(tile, "bbox is not finite"));
        }
        if raw.bbox[..4].iter().any(|value| !in_pixel_range(*value)) {
            return Err(PipelineError::malformed(tile, "bbox is out of range"));
        }
        let (ax, ay, bx, by) = (
            raw.bbox[0].round() as i64,
            raw.bbox[1].round() as i64,
            raw.bbox[2].round() as i64,
            raw.bbox[3].round() as i64,
        );
        let bbox = BBox::new(ax.min(bx), ay.min(by), ax.max(bx), ay.max(by));
        if bbox.width() == 0 || bbox.height() == 0 {
            return Err(PipelineError::malformed(tile, "bbox has zero area"));
        }

        let confidence = match raw.confidence {
            Some(value) if !value.is_finite() => {
                return Err(PipelineError::malformed(tile, "confidence is not finite"));
            }
            Some(value) => value.clamp(0.0, 1.0) as f32,
            None => DEFAULT_CONFIDENCE,
        };

        let polygon = match raw.polygon.as_ref() {
            Some(points) => Some(parse_polygon(points, tile)?),
            None => None,
        };

        let kind = raw
            .kind
            .as_deref()
            .map(|value| value.trim().to_lowercase())
            .filter(|value| !value.is_empty());
        let text = [raw.text.as_deref(), raw.label.as_deref()]
            .into_iter()
            .flatten()
            .map(collapse_whitespace)
            .find(|value| !value.is_empty())
            .or_else(|| kind.clone())
            .unwrap_or_default();

        let attributes = raw
            .attributes
            .iter()
            .filter_map(|(key, value)| {
                let value = match value {
                    serde_json::Value::Null => return None,
                    serde_json::Value::String(text) => text.trim().to_string(),
                    other => other.to_string(),
                };
                if key.trim().is_empty() || value.is_empty() {
                    None
                } else {
                    Some((key.trim().to_lowercase(), value))
                }
            })
            .collect();

        Ok(Detection {
            text,
            kind,
            bbox,
            confidence,
            polygon,
            attributes,
            modality,
            tile,
        })
    }
}

/// Coordinates beyond `i32` cannot come from a real tile and would overflow
/// once offset into image space.
fn in_pixel_range(value: f64) -> bool {
    value.abs() <= i32::MAX as f64
}

fn parse_polygon(points: &[Vec<f64>], tile: TileIndex) -> Result<Vec<Point>, PipelineError> {
    points
        .iter()
        .map(|point| match point.as_slice() {
            [x, y, ..] if in_pixel_range(*x) && in_pixel_range(*y) => Ok(Point {
                x: x.round() as i64,
                y: y.round() as i64,
            }),
            _ => Err(PipelineError::malformed(tile, "polygon point is malformed")),
        })
        .collect()
}

pub(crate) fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub type RecognizeFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<RawDetection>>> + Send + 'a>>;

/// A black-box backend that turns one tile image into raw detections.
///
/// Implementations must return an empty list for blank tiles rather than an
/// error; errors are reserved for transport or backend failures.
pub trait Recognizer: Send + Sync {
    fn name(&self) -> &str;
    fn modality(&self) -> Modality;
    fn recognize<'a>(&'a self, tile: &'a TileImage) -> RecognizeFuture<'a>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TILE: TileIndex = TileIndex { row: 1, col: 2 };

    fn raw(value: serde_json::Value) -> RawDetection {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn vision_shape_is_validated() {
        let detection = Detection::from_raw(
            &raw(json!({
                "label": " KZ1 ",
                "type": "Column",
                "bbox": [10.4, 20.6, 60.0, 41.0],
                "confidence": 0.87,
                "attributes": {"section": "500x500", "count": 2, "note": null}
            })),
            Modality::Vision,
            TILE,
        )
        .unwrap();
        assert_eq!(detection.text, "KZ1");
        assert_eq!(detection.kind.as_deref(), Some("column"));
        assert_eq!(detection.bbox, BBox::new(10, 21, 60, 41));
        assert!((detection.confidence - 0.87).abs() < 1e-6);
        assert_eq!(detection.attributes.get("section").unwrap(), "500x500");
        assert_eq!(detection.attributes.get("count").unwrap(), "2");
        assert!(!detection.attributes.contains_key("note"));
    }

    #[test]
    fn label_falls_back_to_type() {
        let detection = Detection::from_raw(
            &raw(json!({"label": "  ", "type": "beam", "bbox": [0, 0, 5, 5]})),
            Modality::Vision,
            TILE,
        )
        .unwrap();
        assert_eq!(detection.text, "beam");
        assert_eq!(detection.confidence, DEFAULT_CONFIDENCE);
    }

    #[test]
    fn reversed_corners_are_normalized() {
        let detection = Detection::from_raw(
            &raw(json!({"text": "A", "bbox": [30, 40, 10, 20], "confidence": 3.0})),
            Modality::Ocr,
            TILE,
        )
        .unwrap();
        assert_eq!(detection.bbox, BBox::new(10, 20, 30, 40));
        assert_eq!(detection.confidence, 1.0);
    }

    #[test]
    fn short_bbox_is_malformed() {
        let err = Detection::from_raw(
            &raw(json!({"text": "A", "bbox": [1, 2, 3]})),
            Modality::Ocr,
            TILE,
        )
        .unwrap_err();
        match err {
            PipelineError::MalformedDetection { tile, reason } => {
                assert_eq!(tile, TILE);
                assert!(reason.contains("3 components"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn degenerate_bbox_and_bad_polygon_are_malformed() {
        assert!(
            Detection::from_raw(
                &raw(json!({"text": "A", "bbox": [5, 5, 5, 9]})),
                Modality::Ocr,
                TILE
            )
            .is_err()
        );
        assert!(
            Detection::from_raw(
                &raw(json!({"text": "A", "bbox": [0, 0, 5, 9], "polygon": [[1.0], [2.0, 3.0]]})),
                Modality::Ocr,
                TILE
            )
            .is_err()
        );
    }

    #[test]
    fn coordinates_beyond_pixel_range_are_malformed() {
        let err = Detection::from_raw(
            &raw(json!({"text": "A", "bbox": [0, 0, 1e30, 10]})),
            Modality::Vision,
            TILE,
        )
        .unwrap_err();
        assert!(err.to_string().contains("out of range"), "{err}");
        assert!(
            Detection::from_raw(
                &raw(json!({"text": "A", "bbox": [0, 0, 5, 9], "polygon": [[0, 0], [-1e19, 3]]})),
                Modality::Vision,
                TILE
            )
            .is_err()
        );
    }
}
