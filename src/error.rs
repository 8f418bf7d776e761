use thiserror::Error;

use crate::tiling::TileIndex;

/// Domain failures raised by the tiling and reconciliation stages.
///
/// Adapter and I/O plumbing stays on `anyhow`; these variants are the ones a
/// caller may want to match on.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid dimension: {message}")]
    InvalidDimension { message: String },

    #[error(
        "tile {index} at {x},{y} size {width}x{height} is outside the {image_width}x{image_height} image"
    )]
    TileOutOfBounds {
        index: TileIndex,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        image_width: u32,
        image_height: u32,
    },

    #[error("malformed detection from tile {tile}: {reason}")]
    MalformedDetection { tile: TileIndex, reason: String },

    #[error("failed to decode source image")]
    ImageDecode(#[source] image::ImageError),

    #[error("failed to encode tile {tile}")]
    TileEncode {
        tile: TileIndex,
        #[source]
        source: image::ImageError,
    },
}

impl PipelineError {
    pub(crate) fn invalid_dimension(message: impl Into<String>) -> Self {
        PipelineError::InvalidDimension {
            message: message.into(),
        }
    }

    pub(crate) fn malformed(tile: TileIndex, reason: impl Into<String>) -> Self {
        PipelineError::MalformedDetection {
            tile,
            reason: reason.into(),
        }
    }
}
