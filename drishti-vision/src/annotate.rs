//! Renders detections onto a copy of the source image.

use crate::error::VisionError;
use drishti_core::Detection;
use image::{DynamicImage, Rgb, RgbImage};
use std::path::Path;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_THICKNESS: i32 = 2;

/// Draw every detection box on `input` and save the result to `output`.
/// The output encoding follows the output path's extension.
pub fn annotate_image(input: &Path, output: &Path, detections: &[Detection]) -> Result<(), VisionError> {
    let mut canvas = image::open(input)?.to_rgb8();
    draw_detections(&mut canvas, detections);

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    DynamicImage::ImageRgb8(canvas).save(output)?;
    Ok(())
}

pub(crate) fn draw_detections(canvas: &mut RgbImage, detections: &[Detection]) {
    for detection in detections {
        let bbox = detection.bbox;
        for inset in 0..BOX_THICKNESS {
            draw_rectangle(
                canvas,
                bbox.x1.round() as i32 + inset,
                bbox.y1.round() as i32 + inset,
                bbox.x2.round() as i32 - inset,
                bbox.y2.round() as i32 - inset,
                BOX_COLOR,
            );
        }
    }
}

fn draw_rectangle(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    if width == 0 || height == 0 || left > right || top > bottom {
        return;
    }
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);

    for x in left..=right {
        image.put_pixel(x as u32, top as u32, color);
        image.put_pixel(x as u32, bottom as u32, color);
    }
    for y in top..=bottom {
        image.put_pixel(left as u32, y as u32, color);
        image.put_pixel(right as u32, y as u32, color);
    }
}
