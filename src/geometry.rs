use serde::{Deserialize, Serialize};

/// Axis-aligned pixel box, `x2`/`y2` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BBox {
    pub x1: i64,
    pub y1: i64,
    pub x2: i64,
    pub y2: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i64,
    pub y: i64,
}

impl BBox {
    pub fn new(x1: i64, y1: i64, x2: i64, y2: i64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i64 {
        (self.x2 - self.x1).max(0)
    }

    pub fn height(&self) -> i64 {
        (self.y2 - self.y1).max(0)
    }

    pub fn area(&self) -> f32 {
        self.width() as f32 * self.height() as f32
    }

    pub fn center(&self) -> (f32, f32) {
        (
            (self.x1 + self.x2) as f32 * 0.5,
            (self.y1 + self.y2) as f32 * 0.5,
        )
    }

    pub fn diagonal(&self) -> f32 {
        let w = self.width() as f32;
        let h = self.height() as f32;
        (w * w + h * h).sqrt()
    }

    pub fn translate(&self, dx: i64, dy: i64) -> BBox {
        BBox {
            x1: self.x1 + dx,
            y1: self.y1 + dy,
            x2: self.x2 + dx,
            y2: self.y2 + dy,
        }
    }

    pub fn contains(&self, other: &BBox) -> bool {
        other.x1 >= self.x1 && other.y1 >= self.y1 && other.x2 <= self.x2 && other.y2 <= self.y2
    }
}

impl Point {
    pub fn translate(&self, dx: i64, dy: i64) -> Point {
        Point {
            x: self.x + dx,
            y: self.y + dy,
        }
    }
}

pub fn intersection_area(a: &BBox, b: &BBox) -> f32 {
    let ix1 = a.x1.max(b.x1);
    let iy1 = a.y1.max(b.y1);
    let ix2 = a.x2.min(b.x2);
    let iy2 = a.y2.min(b.y2);
    if ix2 <= ix1 || iy2 <= iy1 {
        return 0.0;
    }
    (ix2 - ix1) as f32 * (iy2 - iy1) as f32
}

pub fn iou(a: &BBox, b: &BBox) -> f32 {
    let inter = intersection_area(a, b);
    if inter <= 0.0 {
        return 0.0;
    }
    inter / (a.area() + b.area() - inter).max(1.0)
}

pub fn union_bbox(a: &BBox, b: &BBox) -> BBox {
    BBox {
        x1: a.x1.min(b.x1),
        y1: a.y1.min(b.y1),
        x2: a.x2.max(b.x2),
        y2: a.y2.max(b.y2),
    }
}

pub fn center_distance(a: &BBox, b: &BBox) -> f32 {
    let (ax, ay) = a.center();
    let (bx, by) = b.center();
    ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
}

/// Smaller area over larger area, 0 when either box is empty.
pub fn area_ratio(a: &BBox, b: &BBox) -> f32 {
    let area_a = a.area();
    let area_b = b.area();
    let larger = area_a.max(area_b);
    if larger <= 0.0 {
        return 0.0;
    }
    area_a.min(area_b) / larger
}
