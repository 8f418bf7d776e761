use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::{DynamicImage, GenericImageView};
use std::io::Cursor;

use super::TileSpec;
use crate::error::PipelineError;

pub const TILE_MIME: &str = "image/png";

/// One cropped tile, PNG-encoded for the recognition backends.
#[derive(Debug, Clone)]
pub struct TileImage {
    pub spec: TileSpec,
    pub bytes: Vec<u8>,
    pub mime: String,
}

impl TileImage {
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.bytes)
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, self.to_base64())
    }

    pub fn digest(&self) -> String {
        format!("{:x}", md5::compute(&self.bytes))
    }
}

pub fn extract(image: &DynamicImage, spec: &TileSpec) -> Result<TileImage, PipelineError> {
    let (image_width, image_height) = image.dimensions();
    let fits_x = spec.x as u64 + spec.width as u64 <= image_width as u64;
    let fits_y = spec.y as u64 + spec.height as u64 <= image_height as u64;
    if spec.width == 0 || spec.height == 0 || !fits_x || !fits_y {
        return Err(PipelineError::TileOutOfBounds {
            index: spec.index,
            x: spec.x,
            y: spec.y,
            width: spec.width,
            height: spec.height,
            image_width,
            image_height,
        });
    }

    let cropped = image.crop_imm(spec.x, spec.y, spec.width, spec.height);
    let mut bytes = Vec::new();
    cropped
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .map_err(|source| PipelineError::TileEncode {
            tile: spec.index,
            source,
        })?;
    Ok(TileImage {
        spec: spec.clone(),
        bytes,
        mime: TILE_MIME.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiling::{Margins, TileIndex, plan};
    use image::{Rgba, RgbaImage};

    fn gradient(width: u32, height: u32) -> DynamicImage {
        let mut buffer = RgbaImage::new(width, height);
        for (x, y, pixel) in buffer.enumerate_pixels_mut() {
            *pixel = Rgba([(x % 256) as u8, (y % 256) as u8, 0, 255]);
        }
        DynamicImage::ImageRgba8(buffer)
    }

    fn spec(x: u32, y: u32, width: u32, height: u32) -> TileSpec {
        TileSpec {
            index: TileIndex { row: 0, col: 0 },
            x,
            y,
            width,
            height,
            margins: Margins::default(),
        }
    }

    #[test]
    fn crops_exact_region() {
        let image = gradient(64, 48);
        let tile = extract(&image, &spec(10, 20, 16, 8)).unwrap();
        assert_eq!(tile.mime, TILE_MIME);
        let decoded = image::load_from_memory(&tile.bytes).unwrap();
        assert_eq!(decoded.dimensions(), (16, 8));
        let pixel = decoded.to_rgba8().get_pixel(0, 0).0;
        assert_eq!(pixel, [10, 20, 0, 255]);
        assert!(tile.data_url().starts_with("data:image/png;base64,"));
    }

    #[test]
    fn every_planned_tile_extracts() {
        let image = gradient(300, 200);
        for tile_spec in plan(300, 200, 128, 0.2).unwrap() {
            let tile = extract(&image, &tile_spec).unwrap();
            let decoded = image::load_from_memory(&tile.bytes).unwrap();
            assert_eq!(decoded.dimensions(), (tile_spec.width, tile_spec.height));
        }
    }

    #[test]
    fn rejects_rectangles_outside_image() {
        let image = gradient(64, 48);
        let err = extract(&image, &spec(60, 0, 8, 8)).unwrap_err();
        assert!(matches!(err, PipelineError::TileOutOfBounds { .. }));
        let err = extract(&image, &spec(0, 0, 0, 8)).unwrap_err();
        assert!(matches!(err, PipelineError::TileOutOfBounds { .. }));
    }
}
