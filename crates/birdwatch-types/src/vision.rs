use chrono::{DateTime, Local};
use image::{
    codecs::jpeg::JpegEncoder,
    error::{ImageError, ParameterError, ParameterErrorKind},
    ColorType, DynamicImage, RgbImage,
};
use serde::{Deserialize, Serialize};

/// A decoded still image plus the moment it was acquired.
///
/// Pixels are kept as tightly packed 8-bit RGB.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub data: Vec<u8>,
    pub captured_at: DateTime<Local>,
}

impl Frame {
    pub const CHANNELS: u8 = 3;

    pub fn from_rgb(width: u32, height: u32, data: Vec<u8>, captured_at: DateTime<Local>) -> Self {
        Self {
            width,
            height,
            channels: Self::CHANNELS,
            data,
            captured_at,
        }
    }

    pub fn from_image(image: DynamicImage, captured_at: DateTime<Local>) -> Self {
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();
        Self::from_rgb(width, height, rgb.into_raw(), captured_at)
    }

    /// Copy as an `image` buffer; `None` when the buffer does not
    /// match the declared dimensions.
    pub fn to_rgb_image(&self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data.clone())
    }

    pub fn pixel_count(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.pixel_count() == 0
    }

    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, ImageError> {
        if self.channels != Self::CHANNELS
            || self.data.len() != self.pixel_count() * Self::CHANNELS as usize
        {
            return Err(ImageError::Parameter(ParameterError::from_kind(
                ParameterErrorKind::DimensionMismatch,
            )));
        }
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)).encode(
            &self.data,
            self.width,
            self.height,
            ColorType::Rgb8,
        )?;
        Ok(out)
    }
}

/// Result of the sharpness check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub sharpness_score: f64,
    pub is_blurred: bool,
}

/// Axis-aligned box in pixel coordinates, `(x1, y1)` top-left. Serialized
/// as `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub const fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Integer corners clamped into a `width x height` image, normalised so
    /// that left <= right and top <= bottom.
    pub fn clamp_to(&self, width: u32, height: u32) -> (i32, i32, i32, i32) {
        let max_x = width.saturating_sub(1) as f32;
        let max_y = height.saturating_sub(1) as f32;
        let left = self.x1.min(self.x2).clamp(0.0, max_x).round() as i32;
        let right = self.x1.max(self.x2).clamp(0.0, max_x).round() as i32;
        let top = self.y1.min(self.y2).clamp(0.0, max_y).round() as i32;
        let bottom = self.y1.max(self.y2).clamp(0.0, max_y).round() as i32;
        (left, top, right, bottom)
    }
}

impl From<[f32; 4]> for BoundingBox {
    fn from([x1, y1, x2, y2]: [f32; 4]) -> Self {
        Self::new(x1, y1, x2, y2)
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: u32,
    pub confidence: f32,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
}

pub type DetectionSet = Vec<Detection>;
