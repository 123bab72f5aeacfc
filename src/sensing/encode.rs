use std::io::Cursor;

use anyhow::{Context, Result};
use image::{
    codecs::{jpeg::JpegEncoder, png::PngEncoder},
    imageops::{self, FilterType},
    DynamicImage, RgbaImage,
};

use crate::bridge::{EncodeParams, EncodedImage, ImageEncoder};
use crate::settings::SnapshotFormat;

use super::Frame;

/// `ImageEncoder` built on the `image` crate. Downscales to fit
/// `max_dimension` while keeping the aspect ratio.
#[derive(Debug, Default, Clone, Copy)]
pub struct RasterEncoder;

impl RasterEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl ImageEncoder for RasterEncoder {
    fn encode(&self, frame: &Frame, params: &EncodeParams) -> Result<EncodedImage> {
        let image = fit_within(frame, params.max_dimension);
        write_image(image, params.format, params.quality)
    }

    fn thumbnail(&self, frame: &Frame, max_dimension: u32) -> Result<EncodedImage> {
        let (width, height) = scaled_size(frame.width(), frame.height(), max_dimension);
        let image = imageops::thumbnail(&frame.view(), width, height);
        write_image(image, SnapshotFormat::Jpeg, 60)
    }
}

fn fit_within(frame: &Frame, max_dimension: u32) -> RgbaImage {
    let (width, height) = scaled_size(frame.width(), frame.height(), max_dimension);
    if (width, height) == (frame.width(), frame.height()) {
        frame.to_rgba_image()
    } else {
        imageops::resize(&frame.view(), width, height, FilterType::Triangle)
    }
}

fn scaled_size(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_dimension {
        return (width, height);
    }
    let scale = f64::from(max_dimension) / f64::from(longest);
    let scaled = |value: u32| ((f64::from(value) * scale).round() as u32).max(1);
    (scaled(width), scaled(height))
}

fn write_image(image: RgbaImage, format: SnapshotFormat, quality: u8) -> Result<EncodedImage> {
    let (width, height) = image.dimensions();
    let mut bytes = Vec::new();

    match format {
        SnapshotFormat::Png => {
            image
                .write_with_encoder(PngEncoder::new(Cursor::new(&mut bytes)))
                .context("png encoding failed")?;
        }
        SnapshotFormat::Jpeg => {
            let rgb = DynamicImage::ImageRgba8(image).to_rgb8();
            rgb.write_with_encoder(JpegEncoder::new_with_quality(
                Cursor::new(&mut bytes),
                quality,
            ))
            .context("jpeg encoding failed")?;
        }
    }

    Ok(EncodedImage {
        bytes,
        width,
        height,
        format,
    })
}
