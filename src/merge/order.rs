use std::cmp::Ordering;

use super::DeduplicatedEntity;
use crate::geometry::BBox;

/// Row-dominant sort key: any vertical step of more than a thousandth of the
/// page height outweighs horizontal position.
pub fn reading_weight(bbox: &BBox, image_width: u32, image_height: u32) -> f64 {
    let (cx, cy) = bbox.center();
    let width = image_width.max(1) as f64;
    let height = image_height.max(1) as f64;
    (cy as f64 / height) * 1000.0 + cx as f64 / width
}

/// Entities in reading order. The input slice is left as is.
pub fn sort(
    entities: &[DeduplicatedEntity],
    image_width: u32,
    image_height: u32,
) -> Vec<DeduplicatedEntity> {
    reading_order(entities, image_width, image_height)
        .cloned()
        .collect()
}

pub fn reading_order(
    entities: &[DeduplicatedEntity],
    image_width: u32,
    image_height: u32,
) -> ReadingOrder<'_> {
    let weights = entities
        .iter()
        .map(|entity| reading_weight(&entity.bbox, image_width, image_height))
        .collect::<Vec<_>>();
    let mut order = (0..entities.len()).collect::<Vec<_>>();
    order.sort_by(|&a, &b| {
        weights[a]
            .partial_cmp(&weights[b])
            .unwrap_or(Ordering::Equal)
    });
    ReadingOrder {
        entities,
        order,
        position: 0,
    }
}

/// Borrowing iterator over entities in reading order; `restart` rewinds it.
#[derive(Debug, Clone)]
pub struct ReadingOrder<'a> {
    entities: &'a [DeduplicatedEntity],
    order: Vec<usize>,
    position: usize,
}

impl ReadingOrder<'_> {
    pub fn restart(&mut self) {
        self.position = 0;
    }

    pub fn indices(&self) -> &[usize] {
        &self.order
    }
}

impl<'a> Iterator for ReadingOrder<'a> {
    type Item = &'a DeduplicatedEntity;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = *self.order.get(self.position)?;
        self.position += 1;
        self.entities.get(idx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.order.len() - self.position;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ReadingOrder<'_> {}

/// Joins entity texts into lines. A new line starts when an entity's centre
/// drops below the current line by more than half the line's height.
pub fn reading_text(
    entities: &[DeduplicatedEntity],
    image_width: u32,
    image_height: u32,
) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    let mut line_center = 0f32;
    let mut line_height = 0f32;
    for entity in reading_order(entities, image_width, image_height) {
        let text = entity.text.trim();
        if text.is_empty() {
            continue;
        }
        let (_, cy) = entity.bbox.center();
        let height = entity.bbox.height().max(1) as f32;
        match lines.last_mut() {
            Some(line) if (cy - line_center).abs() <= line_height.max(height) * 0.5 => {
                line.push(' ');
                line.push_str(text);
            }
            _ => {
                lines.push(text.to_string());
                line_center = cy;
                line_height = height;
            }
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::EntityKind;
    use crate::recognition::Modality;
    use std::collections::{BTreeMap, BTreeSet};

    fn entity(text: &str, x: i64, y: i64) -> DeduplicatedEntity {
        DeduplicatedEntity {
            text: text.to_string(),
            kind: EntityKind::Unknown,
            class: None,
            vision_type: None,
            bbox: BBox::new(x, y, x + 20, y + 10),
            polygon: None,
            confidence: 0.9,
            modality: Modality::Ocr,
            tiles: BTreeSet::new(),
            attributes: BTreeMap::new(),
            members: 1,
        }
    }

    #[test]
    fn top_row_left_to_right_then_next_row() {
        let entities = vec![
            entity("below", 0, 50),
            entity("right", 100, 0),
            entity("left", 10, 0),
        ];
        let sorted = sort(&entities, 1000, 1000);
        let texts = sorted.iter().map(|e| e.text.as_str()).collect::<Vec<_>>();
        assert_eq!(texts, vec!["left", "right", "below"]);
        assert_eq!(entities[0].text, "below");
    }

    #[test]
    fn ties_keep_input_order() {
        let entities = vec![entity("first", 10, 10), entity("second", 10, 10)];
        let order = reading_order(&entities, 100, 100);
        assert_eq!(order.indices(), &[0, 1]);
    }

    #[test]
    fn order_can_be_replayed() {
        let entities = vec![entity("b", 50, 0), entity("a", 0, 0)];
        let mut order = reading_order(&entities, 200, 200);
        let first = order.by_ref().map(|e| e.text.clone()).collect::<Vec<_>>();
        assert_eq!(order.len(), 0);
        order.restart();
        let second = order.map(|e| e.text.clone()).collect::<Vec<_>>();
        assert_eq!(first, second);
        assert_eq!(first, vec!["a", "b"]);
    }

    #[test]
    fn lines_group_by_row() {
        let entities = vec![
            entity("C30", 200, 101),
            entity("KZ1", 10, 100),
            entity("3000", 10, 300),
        ];
        assert_eq!(reading_text(&entities, 1000, 1000), vec!["KZ1 C30", "3000"]);
    }
}
