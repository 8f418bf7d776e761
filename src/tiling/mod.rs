mod extractor;
mod planner;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::geometry::BBox;

pub use extractor::{TILE_MIME, TileImage, extract};
pub use planner::plan;

/// Grid position; the derived ordering is row-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TileIndex {
    pub row: u32,
    pub col: u32,
}

impl fmt::Display for TileIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.col)
    }
}

/// Pixels shared with the neighbouring tile on each side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Margins {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileSpec {
    pub index: TileIndex,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub margins: Margins,
}

impl TileSpec {
    pub fn offset(&self) -> (i64, i64) {
        (self.x as i64, self.y as i64)
    }

    pub fn bbox(&self) -> BBox {
        BBox::new(
            self.x as i64,
            self.y as i64,
            self.x as i64 + self.width as i64,
            self.y as i64 + self.height as i64,
        )
    }
}
