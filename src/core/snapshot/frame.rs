use std::io::Cursor;
use std::time::Duration;

use image::{ImageOutputFormat, RgbImage, RgbaImage};

use super::uploader::EncodedImage;

/// 帧数据结构，RGBA 像素，按原生分辨率渲染
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>, // RGBA 格式
    pub timestamp: Duration,
}

impl FrameBuffer {
    pub fn new(width: u32, height: u32, data: Vec<u8>, timestamp: Duration) -> Self {
        Self {
            width,
            height,
            data,
            timestamp,
        }
    }

    /// 纯色帧，主要用于测试和占位
    pub fn uniform(width: u32, height: u32, rgb: [u8; 3], timestamp: Duration) -> Self {
        let pixel_count = width as usize * height as usize;
        let mut data = Vec::with_capacity(pixel_count * 4);
        for _ in 0..pixel_count {
            data.extend_from_slice(&[rgb[0], rgb[1], rgb[2], 255]);
        }
        Self::new(width, height, data, timestamp)
    }

    pub fn from_rgba_image(image: RgbaImage, timestamp: Duration) -> Self {
        let (width, height) = image.dimensions();
        Self::new(width, height, image.into_raw(), timestamp)
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Non-empty, and the buffer length matches the declared dimensions.
    pub fn is_readable(&self) -> bool {
        self.width > 0 && self.height > 0 && self.data.len() == self.pixel_count() * 4
    }

    pub fn timestamp_seconds(&self) -> f64 {
        self.timestamp.as_secs_f64()
    }

    pub fn to_rgb(&self) -> Vec<u8> {
        let mut rgb = Vec::with_capacity(self.pixel_count() * 3);
        for chunk in self.data.chunks_exact(4) {
            rgb.push(chunk[0]); // R
            rgb.push(chunk[1]); // G
            rgb.push(chunk[2]); // B
        }
        rgb
    }

    pub fn resize_to(&self, target_width: u32, target_height: u32) -> Option<FrameBuffer> {
        let img = RgbaImage::from_raw(self.width, self.height, self.data.clone())?;
        let resized = image::imageops::resize(
            &img,
            target_width,
            target_height,
            image::imageops::FilterType::Triangle,
        );

        Some(FrameBuffer {
            width: target_width,
            height: target_height,
            data: resized.into_raw(),
            timestamp: self.timestamp,
        })
    }

    /// 等比缩放到不超过 `max_width`，已经够小则原样返回
    pub fn fit_within(&self, max_width: u32) -> Option<FrameBuffer> {
        if !self.is_readable() {
            return None;
        }
        if max_width == 0 || self.width <= max_width {
            return Some(self.clone());
        }
        let scaled_height =
            ((self.height as u64 * max_width as u64) / self.width as u64).max(1) as u32;
        self.resize_to(max_width, scaled_height)
    }

    pub fn encode_jpeg(&self, quality: u8) -> Result<EncodedImage, image::ImageError> {
        let img = RgbImage::from_raw(self.width, self.height, self.to_rgb()).ok_or_else(|| {
            image::ImageError::Parameter(image::error::ParameterError::from_kind(
                image::error::ParameterErrorKind::DimensionMismatch,
            ))
        })?;

        let mut buffer = Cursor::new(Vec::new());
        img.write_to(&mut buffer, ImageOutputFormat::Jpeg(quality.clamp(1, 100)))?;
        Ok(EncodedImage::jpeg(buffer.into_inner()))
    }
}
