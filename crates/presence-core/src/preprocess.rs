//! Image decoding, grayscale conversion and bilinear resampling.

use crate::types::GrayImage;
use image::{DynamicImage, ImageDecoder, ImageReader};
use std::io::Cursor;
use thiserror::Error;

// BT.601 luma weights in 14-bit fixed point (sum = 1 << 14).
const LUMA_R: u32 = 4899;
const LUMA_G: u32 = 9617;
const LUMA_B: u32 = 1868;
const LUMA_SHIFT: u32 = 14;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("image payload is empty")]
    Empty,
    #[error("image could not be decoded: {0}")]
    Undecodable(#[from] image::ImageError),
}

/// Decode an encoded image (JPEG, PNG, ...) into grayscale.
///
/// An EXIF Orientation tag is applied, so phone photos come out upright.
pub fn decode_gray(bytes: &[u8]) -> Result<GrayImage, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    let mut decoder = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(image::ImageError::IoError)?
        .into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut img = DynamicImage::from_decoder(decoder)?;
    img.apply_orientation(orientation);
    Ok(to_gray(&img))
}

/// Convert any decoded image to single-channel intensity using BT.601 weights.
pub fn to_gray(img: &image::DynamicImage) -> GrayImage {
    let rgb = img.to_rgb8();
    let (width, height) = (rgb.width() as usize, rgb.height() as usize);
    let data = rgb
        .pixels()
        .map(|p| {
            let [r, g, b] = p.0;
            let y = r as u32 * LUMA_R + g as u32 * LUMA_G + b as u32 * LUMA_B;
            ((y + (1 << (LUMA_SHIFT - 1))) >> LUMA_SHIFT) as u8
        })
        .collect();
    GrayImage { data, width, height }
}

/// Resize with bilinear interpolation on half-pixel centers.
pub fn resize_bilinear(src: &GrayImage, new_w: usize, new_h: usize) -> GrayImage {
    let (width, height) = (src.width, src.height);
    if width == 0 || height == 0 || new_w == 0 || new_h == 0 {
        return GrayImage {
            data: vec![0; new_w * new_h],
            width: new_w,
            height: new_h,
        };
    }
    if width == new_w && height == new_h {
        return src.clone();
    }

    let inv_scale_x = width as f32 / new_w as f32;
    let inv_scale_y = height as f32 / new_h as f32;
    let frame = &src.data;

    let mut resized = vec![0u8; new_w * new_h];
    for y in 0..new_h {
        let src_y = ((y as f32 + 0.5) * inv_scale_y - 0.5).max(0.0);
        let y0 = (src_y.floor() as usize).min(height - 1);
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = ((x as f32 + 0.5) * inv_scale_x - 0.5).max(0.0);
            let x0 = (src_x.floor() as usize).min(width - 1);
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = frame[y0 * width + x0] as f32;
            let tr = frame[y0 * width + x1] as f32;
            let bl = frame[y1 * width + x0] as f32;
            let br = frame[y1 * width + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;

            resized[y * new_w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    GrayImage {
        data: resized,
        width: new_w,
        height: new_h,
    }
}
