use tracing::debug;

use super::{Margins, TileIndex, TileSpec};
use crate::error::PipelineError;

#[derive(Debug, Clone, Copy)]
struct Span {
    start: u32,
    len: u32,
}

impl Span {
    fn end(&self) -> u32 {
        self.start + self.len
    }
}

pub fn plan(
    image_width: u32,
    image_height: u32,
    max_tile_dimension: u32,
    overlap_ratio: f32,
) -> Result<Vec<TileSpec>, PipelineError> {
    if image_width == 0 || image_height == 0 {
        return Err(PipelineError::invalid_dimension(format!(
            "image size must be positive (got {}x{})",
            image_width, image_height
        )));
    }
    if max_tile_dimension == 0 {
        return Err(PipelineError::invalid_dimension(
            "max tile dimension must be positive",
        ));
    }
    if !overlap_ratio.is_finite() || overlap_ratio < 0.0 {
        return Err(PipelineError::invalid_dimension(format!(
            "overlap ratio must be a non-negative number (got {})",
            overlap_ratio
        )));
    }

    if image_width <= max_tile_dimension && image_height <= max_tile_dimension {
        debug!(
            "{}x{} fits in one tile (max {})",
            image_width, image_height, max_tile_dimension
        );
        return Ok(vec![TileSpec {
            index: TileIndex { row: 0, col: 0 },
            x: 0,
            y: 0,
            width: image_width,
            height: image_height,
            margins: Margins::default(),
        }]);
    }

    let overlap = (max_tile_dimension as f64 * overlap_ratio as f64).round() as u64;
    if overlap >= max_tile_dimension as u64 {
        return Err(PipelineError::invalid_dimension(format!(
            "overlap of {}px leaves no effective stride for {}px tiles",
            overlap, max_tile_dimension
        )));
    }
    let effective = max_tile_dimension - overlap as u32;

    let cols = axis_spans(image_width, effective, max_tile_dimension);
    let rows = axis_spans(image_height, effective, max_tile_dimension);
    debug!(
        "planned {} rows x {} cols (tile {}px, overlap {}px, stride {}px)",
        rows.len(),
        cols.len(),
        max_tile_dimension,
        overlap,
        effective
    );

    let mut tiles = Vec::with_capacity(rows.len() * cols.len());
    for (row, y_span) in rows.iter().enumerate() {
        let (top, bottom) = shared_with_neighbours(&rows, row);
        for (col, x_span) in cols.iter().enumerate() {
            let (left, right) = shared_with_neighbours(&cols, col);
            tiles.push(TileSpec {
                index: TileIndex {
                    row: row as u32,
                    col: col as u32,
                },
                x: x_span.start,
                y: y_span.start,
                width: x_span.len,
                height: y_span.len,
                margins: Margins {
                    left,
                    top,
                    right,
                    bottom,
                },
            });
        }
    }
    Ok(tiles)
}

fn axis_spans(length: u32, effective: u32, max_tile_dimension: u32) -> Vec<Span> {
    let count = length.div_ceil(effective);
    (0..count)
        .map(|idx| {
            let start = idx * effective;
            Span {
                start,
                len: max_tile_dimension.min(length - start),
            }
        })
        .collect()
}

fn shared_with_neighbours(spans: &[Span], idx: usize) -> (u32, u32) {
    let current = spans[idx];
    let before = idx
        .checked_sub(1)
        .map(|prev| shared_len(&spans[prev], &current))
        .unwrap_or(0);
    let after = spans
        .get(idx + 1)
        .map(|next| shared_len(&current, next))
        .unwrap_or(0);
    (before, after)
}

fn shared_len(a: &Span, b: &Span) -> u32 {
    a.end().min(b.end()).saturating_sub(a.start.max(b.start))
}
