use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::GenericImageView;
use serde::Deserialize;

use super::FrameDecoder;
use crate::layout::{FrameLayout, CHANNELS};

/// Channel order of published pixels.
///
/// `Bgr24` matches what OpenCV consumers read into a `CV_8UC3` matrix.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    #[default]
    #[serde(alias = "bgr24")]
    Bgr,
    #[serde(alias = "rgb24")]
    Rgb,
}

impl std::str::FromStr for PixelFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "bgr" | "bgr24" => Ok(Self::Bgr),
            "rgb" | "rgb24" => Ok(Self::Rgb),
            other => Err(anyhow!("unknown pixel format '{}'; expected bgr or rgb", other)),
        }
    }
}

/// JPEG (or any format the `image` crate was built with) to fixed-size
/// 24-bit pixels.
#[derive(Clone, Debug)]
pub struct ImageDecoder {
    layout: FrameLayout,
    format: PixelFormat,
}

impl ImageDecoder {
    pub fn new(layout: FrameLayout, format: PixelFormat) -> Self {
        Self { layout, format }
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }
}

impl FrameDecoder for ImageDecoder {
    fn decode(&mut self, encoded: &[u8]) -> Result<Vec<u8>> {
        let image = image::load_from_memory(encoded).context("decode snapshot")?;
        let (width, height) = (self.layout.width(), self.layout.height());
        let image = if image.dimensions() == (width, height) {
            image
        } else {
            image.resize_exact(width, height, FilterType::Triangle)
        };
        let pixels = image.into_rgb8().into_raw();
        order_channels(pixels, self.layout, self.format)
    }
}

/// Validate an RGB24 buffer against the layout and reorder it in place.
pub(crate) fn order_channels(
    mut pixels: Vec<u8>,
    layout: FrameLayout,
    format: PixelFormat,
) -> Result<Vec<u8>> {
    let expected = layout.frame_len();
    if pixels.len() != expected {
        return Err(anyhow!(
            "RGB frame length mismatch: expected {}, got {}",
            expected,
            pixels.len()
        ));
    }
    if format == PixelFormat::Bgr {
        for pixel in pixels.chunks_exact_mut(CHANNELS) {
            pixel.swap(0, 2);
        }
    }
    Ok(pixels)
}

/// Inverse of `order_channels` for code that needs RGB back (previews).
pub(crate) fn to_rgb(pixels: &[u8], format: PixelFormat) -> Vec<u8> {
    let mut rgb = pixels.to_vec();
    if format == PixelFormat::Bgr {
        for pixel in rgb.chunks_exact_mut(CHANNELS) {
            pixel.swap(0, 2);
        }
    }
    rgb
}
