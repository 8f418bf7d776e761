use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use resvg::render;
use std::io::Cursor;
use std::sync::Arc;
use tiny_skia::Pixmap;
use usvg::{Options, Tree, fontdb};

use crate::reconcile::{ConsistencyStatus, FusedEntity};
use crate::tiling::TileSpec;

const TILE_STROKE: &str = "#2962ff";

fn status_colour(status: ConsistencyStatus) -> &'static str {
    match status {
        ConsistencyStatus::Consistent => "#00c853",
        ConsistencyStatus::LowConfidence => "#ffab00",
        ConsistencyStatus::Inconsistent => "#d50000",
        ConsistencyStatus::SingleSource => "#9e9e9e",
    }
}

/// Source drawing with the tile grid dashed on top and one box per fused
/// entity, coloured by review status.
pub fn render_overlay_svg(
    image_bytes: &[u8],
    image_mime: &str,
    width: u32,
    height: u32,
    tiles: &[TileSpec],
    entities: &[FusedEntity],
) -> String {
    let data_uri = format!("data:{};base64,{}", image_mime, BASE64.encode(image_bytes));
    let stroke = (width.max(height) as f32 / 1000.0).clamp(1.0, 6.0);
    let font_size = (stroke * 8.0).clamp(10.0, 40.0);

    let mut svg = String::new();
    svg.push_str(&format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" xmlns:xlink="http://www.w3.org/1999/xlink" width="{w}" height="{h}" viewBox="0 0 {w} {h}">"#,
        w = width,
        h = height
    ));
    svg.push_str(&format!(
        r#"<image href="{uri}" xlink:href="{uri}" x="0" y="0" width="{w}" height="{h}" preserveAspectRatio="none"/>"#,
        uri = data_uri,
        w = width,
        h = height
    ));

    for tile in tiles {
        svg.push_str(&format!(
            r#"<rect x="{x}" y="{y}" width="{w}" height="{h}" fill="none" stroke="{stroke}" stroke-width="{sw}" stroke-dasharray="{dash}"/>"#,
            x = tile.x,
            y = tile.y,
            w = tile.width,
            h = tile.height,
            stroke = TILE_STROKE,
            sw = stroke,
            dash = stroke * 6.0
        ));
    }

    for entity in entities {
        let colour = status_colour(entity.status);
        let bbox = entity.bbox;
        svg.push_str(&format!(
            r#"<rect x="{x}" y="{y}" width="{w}" height="{h}" fill="none" stroke="{colour}" stroke-width="{sw}"/>"#,
            x = bbox.x1,
            y = bbox.y1,
            w = bbox.width().max(1),
            h = bbox.height().max(1),
            colour = colour,
            sw = stroke * 2.0
        ));
        if entity.label.trim().is_empty() {
            continue;
        }
        let text_y = if bbox.y1 as f32 > font_size {
            bbox.y1 as f32 - stroke * 2.0
        } else {
            bbox.y2 as f32 + font_size
        };
        svg.push_str(&format!(
            r#"<text x="{x}" y="{y}" font-size="{size}" fill="{colour}">{text}</text>"#,
            x = bbox.x1,
            y = text_y,
            size = font_size,
            colour = colour,
            text = escape_xml(&entity.label)
        ));
    }

    svg.push_str("</svg>");
    svg
}

pub fn render_png(svg: &str) -> Result<Vec<u8>> {
    let mut db = fontdb::Database::new();
    db.load_system_fonts();
    let options = Options {
        fontdb: Arc::new(db),
        ..Options::default()
    };
    let tree = Tree::from_str(svg, &options).with_context(|| "failed to parse overlay SVG")?;
    let size = tree.size().to_int_size();
    let mut pixmap =
        Pixmap::new(size.width(), size.height()).ok_or_else(|| anyhow!("empty SVG size"))?;
    render(&tree, tiny_skia::Transform::identity(), &mut pixmap.as_mut());
    let image = image::RgbaImage::from_raw(size.width(), size.height(), pixmap.data().to_vec())
        .ok_or_else(|| anyhow!("failed to build image buffer from SVG"))?;
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgba8(image)
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .with_context(|| "failed to encode overlay PNG")?;
    Ok(bytes)
}

fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BBox;
    use crate::merge::EntityKind;
    use crate::reconcile::{Provenance, ReviewAction};
    use crate::tiling::plan;
    use std::collections::{BTreeMap, BTreeSet};

    fn entity(label: &str, status: ConsistencyStatus) -> FusedEntity {
        FusedEntity {
            id: "e1".to_string(),
            kind: EntityKind::ComponentId,
            class: None,
            label: label.to_string(),
            attributes: BTreeMap::new(),
            bbox: BBox::new(10, 4, 30, 14),
            polygon: None,
            confidence: 0.9,
            provenance: Provenance {
                modalities: BTreeSet::new(),
                tiles: BTreeSet::new(),
                members: 1,
            },
            consistency_score: None,
            status,
            action: ReviewAction::Accept,
            conflict: None,
        }
    }

    fn white_png(width: u32, height: u32) -> Vec<u8> {
        let image = image::RgbaImage::from_pixel(width, height, image::Rgba([255, 255, 255, 255]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgba8(image)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn overlay_draws_tiles_and_entities() {
        let tiles = plan(80, 40, 32, 0.1).unwrap();
        let svg = render_overlay_svg(
            &white_png(80, 40),
            "image/png",
            80,
            40,
            &tiles,
            &[
                entity("KL<1>", ConsistencyStatus::Inconsistent),
                entity("", ConsistencyStatus::Consistent),
            ],
        );
        assert_eq!(svg.matches("stroke-dasharray").count(), tiles.len());
        assert_eq!(svg.matches("<rect").count(), tiles.len() + 2);
        assert_eq!(svg.matches("<text").count(), 1);
        assert!(svg.contains("KL&lt;1&gt;"));
        assert!(svg.contains("#d50000"));
        assert!(svg.contains("#00c853"));
    }

    #[test]
    fn overlay_rasterizes_to_png() {
        let svg = render_overlay_svg(&white_png(40, 20), "image/png", 40, 20, &[], &[]);
        let png = render_png(&svg).unwrap();
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (40, 20));
    }
}
