//! Camera frames and their encoding for multimodal prompts.

use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};
use llmnav_types::NavError;

const JPEG_QUALITY: u8 = 85;

/// A raw RGB24 image frame returned by the robot's camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraFrame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Row-major RGB24 pixel data, `width * height * 3` bytes.
    pub data: Vec<u8>,
}

impl CameraFrame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            data,
        }
    }

    /// Encode the frame as a baseline JPEG.
    ///
    /// # Errors
    ///
    /// * [`NavError::HardwareFault`] if the buffer length does not match the
    ///   frame dimensions.
    /// * [`NavError::Serialization`] if the encoder fails.
    pub fn to_jpeg(&self) -> Result<Vec<u8>, NavError> {
        let expected = self.width as usize * self.height as usize * 3;
        if self.width == 0 || self.height == 0 || self.data.len() != expected {
            return Err(NavError::HardwareFault {
                component: "camera".to_string(),
                details: format!(
                    "frame {}x{} carries {} bytes, expected {expected}",
                    self.width,
                    self.height,
                    self.data.len()
                ),
            });
        }

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
            .write_image(&self.data, self.width, self.height, ExtendedColorType::Rgb8)
            .map_err(|e| NavError::Serialization(format!("JPEG encoding failed: {e}")))?;
        Ok(jpeg)
    }

    /// Base64 (standard alphabet) of the JPEG encoding.
    pub fn to_base64_jpeg(&self) -> Result<String, NavError> {
        let jpeg = self.to_jpeg()?;
        Ok(base64::engine::general_purpose::STANDARD.encode(jpeg))
    }

    /// `data:image/jpeg;base64,...` URI suitable for an `image_url` part.
    pub fn to_data_uri(&self) -> Result<String, NavError> {
        Ok(jpeg_data_uri(&self.to_base64_jpeg()?))
    }
}

/// Wrap an already base64-encoded JPEG in a data URI.
pub fn jpeg_data_uri(base64_jpeg: &str) -> String {
    format!("data:image/jpeg;base64,{base64_jpeg}")
}
