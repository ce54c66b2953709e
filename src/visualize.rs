// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 展示辅助 (Presentation Helpers)
//!
//! - `format_info_text`: 检测结果 → 文本说明 (纯函数)
//! - `resize_for_display`: 保持宽高比缩放到显示区域 (fast_image_resize)
//! - `Annotator`: 在帧上绘制检测框与标签 (imageproc + ab_glyph)

use std::fmt::Write as _;
use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use anyhow::Context;
use fast_image_resize as fr;
use image::Rgb;
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::detection::DetectionResult;
use crate::frame::Frame;

/// 显示缩放错误
#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("cannot display an empty frame ({width}x{height})")]
    EmptyFrame { width: u32, height: u32 },

    #[error("resize failed: {0}")]
    Resize(String),
}

// ========== 文本说明 ==========

/// 生成检测结果的文本说明
///
/// ```text
/// Detections:
/// object: person, confidence: 0.90, box: (10,10,50,50), track id: 4, mask, mask area: 1200
///
/// Summary:
/// person: 1
/// ```
pub fn format_info_text(result: &DetectionResult) -> String {
    let mut text = String::from("Detections:\n");

    if result.is_empty() {
        text.push_str("no objects detected\n");
        return text;
    }

    for det in result {
        let b = det.bbox;
        let _ = write!(
            text,
            "object: {}, confidence: {:.2}, box: ({},{},{},{})",
            det.class_name, det.confidence, b.x1, b.y1, b.x2, b.y2
        );
        if let Some(id) = det.track_id {
            let _ = write!(text, ", track id: {id}");
        }
        if det.mask_present {
            text.push_str(", mask");
            if let Some(area) = det.mask_pixel_area {
                let _ = write!(text, ", mask area: {area:.0}");
            }
        }
        text.push('\n');
    }

    text.push_str("\nSummary:\n");
    for (name, count) in result.count_by_class() {
        let _ = writeln!(text, "{name}: {count}");
    }
    text
}

// ========== 显示缩放 ==========

/// 等比缩放后的尺寸 (至少 1x1); 目标宽或高为 0 时使用原始尺寸
pub fn fit_size(width: u32, height: u32, target_w: u32, target_h: u32) -> (u32, u32) {
    if target_w == 0 || target_h == 0 {
        return (width, height);
    }
    let ratio = (target_w as f64 / width as f64).min(target_h as f64 / height as f64);
    let new_w = ((width as f64 * ratio) as u32).max(1);
    let new_h = ((height as f64 * ratio) as u32).max(1);
    (new_w, new_h)
}

/// 保持宽高比缩放到显示区域
pub fn resize_for_display(frame: &Frame, target_w: u32, target_h: u32) -> Result<Frame, DisplayError> {
    if frame.is_empty() {
        error!(
            "resize_for_display 收到空图像: w={}, h={}",
            frame.width(),
            frame.height()
        );
        return Err(DisplayError::EmptyFrame {
            width: frame.width(),
            height: frame.height(),
        });
    }
    if target_w == 0 || target_h == 0 {
        debug!("目标宽高为 0, 使用原始尺寸: target={}x{}", target_w, target_h);
    }

    let (new_w, new_h) = fit_size(frame.width(), frame.height(), target_w, target_h);
    if (new_w, new_h) == (frame.width(), frame.height()) {
        return Ok(frame.clone());
    }

    let pixel_type = match frame.channels() {
        1 => fr::PixelType::U8,
        3 => fr::PixelType::U8x3,
        _ => fr::PixelType::U8x4,
    };
    let src = fr::images::Image::from_vec_u8(
        frame.width(),
        frame.height(),
        frame.pixels().to_vec(),
        pixel_type,
    )
    .map_err(|e| DisplayError::Resize(e.to_string()))?;
    let mut dst = fr::images::Image::new(new_w, new_h, pixel_type);

    // 显示用途: 双线性插值, 缩小时比 Nearest 清晰
    let mut resizer = fr::Resizer::new();
    resizer
        .resize(
            &src,
            &mut dst,
            &fr::ResizeOptions::new()
                .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear)),
        )
        .map_err(|e| DisplayError::Resize(e.to_string()))?;

    Frame::new(dst.into_vec(), new_w, new_h, frame.channels())
        .map(|resized| resized.with_index(frame.index()))
        .ok_or_else(|| DisplayError::Resize("resized buffer has unexpected length".into()))
}

// ========== 检测框绘制 ==========

/// Ultralytics 默认调色板
const PALETTE: [[u8; 3]; 20] = [
    [4, 42, 255],
    [11, 219, 235],
    [243, 243, 243],
    [0, 223, 183],
    [17, 31, 104],
    [255, 111, 221],
    [255, 68, 79],
    [204, 237, 0],
    [0, 243, 68],
    [189, 0, 255],
    [0, 180, 255],
    [221, 0, 186],
    [0, 255, 255],
    [38, 192, 0],
    [1, 255, 179],
    [125, 36, 255],
    [123, 0, 104],
    [255, 27, 108],
    [252, 98, 3],
    [255, 0, 0],
];

fn class_color(class_id: u32) -> Rgb<u8> {
    Rgb(PALETTE[class_id as usize % PALETTE.len()])
}

/// 检测结果绘制器
///
/// 没有字体时只画框, 不画标签。
pub struct Annotator {
    font: Option<FontVec>,
    scale: PxScale,
    thickness: u32,
}

impl Default for Annotator {
    fn default() -> Self {
        Self {
            font: None,
            scale: PxScale::from(18.0),
            thickness: 2,
        }
    }
}

impl Annotator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_font(mut self, font: FontVec) -> Self {
        self.font = Some(font);
        self
    }

    /// 从 TTF/OTF 文件加载标签字体
    pub fn with_font_file(self, path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("cannot read font {}", path.display()))?;
        let font = FontVec::try_from_vec(data)
            .with_context(|| format!("invalid font {}", path.display()))?;
        Ok(self.with_font(font))
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = PxScale::from(scale);
        self
    }

    pub fn with_thickness(mut self, thickness: u32) -> Self {
        self.thickness = thickness.max(1);
        self
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// 标签文本: `#id name 0.90`
    pub fn label(det: &crate::detection::Detection) -> String {
        match det.track_id {
            Some(id) => format!("#{id} {} {:.2}", det.class_name, det.confidence),
            None => format!("{} {:.2}", det.class_name, det.confidence),
        }
    }

    /// 绘制检测结果, 返回新帧 (原帧不变)
    pub fn render(&self, frame: &Frame, result: &DetectionResult) -> Frame {
        if result.is_empty() || frame.is_empty() {
            return frame.clone();
        }
        let Some(mut img) = frame.to_rgb_image() else {
            warn!("⚠️ 帧转换 RGB 失败, 跳过绘制: {:?}", frame);
            return frame.clone();
        };

        for det in result {
            let color = class_color(det.class_id);
            let b = det.bbox;

            for t in 0..self.thickness as i32 {
                let w = (b.width() as i32 - 2 * t).max(1) as u32;
                let h = (b.height() as i32 - 2 * t).max(1) as u32;
                let rect = Rect::at(b.x1 + t, b.y1 + t).of_size(w, h);
                draw_hollow_rect_mut(&mut img, rect, color);
            }

            if let Some(font) = &self.font {
                let label = Self::label(det);
                let (tw, th) = text_size(self.scale, font, &label);
                let y = (b.y1 - th as i32 - 4).max(0);
                let bg = Rect::at(b.x1, y).of_size(tw.max(1) + 4, th.max(1) + 4);
                draw_filled_rect_mut(&mut img, bg, color);
                draw_text_mut(&mut img, Rgb([255, 255, 255]), b.x1 + 2, y + 2, self.scale, font, &label);
            }
        }

        Frame::from_rgb(img).with_index(frame.index())
    }
}
