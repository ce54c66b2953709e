// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 视频帧 (Frame)
//!
//! 采集后不可变; 克隆只增加像素缓冲区的引用计数, 不复制数据。

use std::fmt;
use std::sync::Arc;

use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};

/// 一帧图像: 交错排列的 8 位像素 + 宽高/通道数
#[derive(Clone)]
pub struct Frame {
    pixels: Arc<[u8]>, // 使用Arc共享数据,避免复制
    width: u32,
    height: u32,
    channels: u8,
    index: u64, // 帧序号 (由帧源递增)
}

impl Frame {
    /// 从原始像素创建; 长度与 `width * height * channels` 不符时返回 `None`
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, channels: u8) -> Option<Self> {
        if !matches!(channels, 1 | 3 | 4) {
            return None;
        }
        let expected = width as usize * height as usize * channels as usize;
        if pixels.len() != expected {
            return None;
        }
        Some(Self {
            pixels: Arc::from(pixels),
            width,
            height,
            channels,
            index: 0,
        })
    }

    pub fn from_rgb(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            pixels: Arc::from(image.into_raw()),
            width,
            height,
            channels: 3,
            index: 0,
        }
    }

    pub fn from_dynamic(image: DynamicImage) -> Self {
        match image {
            DynamicImage::ImageRgb8(rgb) => Self::from_rgb(rgb),
            other => Self::from_rgb(other.to_rgb8()),
        }
    }

    pub fn with_index(mut self, index: u64) -> Self {
        self.index = index;
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// 两个句柄是否指向同一块像素缓冲区
    pub fn shares_pixels(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.pixels, &other.pixels)
    }

    /// 转换为 RGB 图像 (灰度/RGBA 会被展开或丢弃 Alpha)
    pub fn to_rgb_image(&self) -> Option<RgbImage> {
        let raw = self.pixels.to_vec();
        match self.channels {
            3 => RgbImage::from_raw(self.width, self.height, raw),
            4 => RgbaImage::from_raw(self.width, self.height, raw)
                .map(|img| DynamicImage::ImageRgba8(img).to_rgb8()),
            1 => GrayImage::from_raw(self.width, self.height, raw)
                .map(|img| DynamicImage::ImageLuma8(img).to_rgb8()),
            _ => None,
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("index", &self.index)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("channels", &self.channels)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_wrong_length() {
        assert!(Frame::new(vec![0; 11], 2, 2, 3).is_none());
        assert!(Frame::new(vec![0; 12], 2, 2, 3).is_some());
        assert!(Frame::new(vec![0; 8], 2, 2, 2).is_none());
    }

    #[test]
    fn test_clone_shares_pixels() {
        let frame = Frame::from_rgb(RgbImage::new(4, 3)).with_index(7);
        let copy = frame.clone();
        assert!(frame.shares_pixels(&copy));
        assert_eq!(copy.index(), 7);
        assert_eq!((copy.width(), copy.height(), copy.channels()), (4, 3, 3));
    }

    #[test]
    fn test_rgba_to_rgb() {
        let frame = Frame::new(vec![10, 20, 30, 255], 1, 1, 4).unwrap();
        let rgb = frame.to_rgb_image().unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [10, 20, 30]);
    }
}
