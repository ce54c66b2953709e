// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 帧源 (Frame Source)
///
/// ## 架构说明
/// - **SourceKind**: 图片 / 视频文件 / 摄像头
/// - **Capture**: 采集设备边界 (默认实现为 ez-ffmpeg 解码器, 见 [`ffmpeg::FfmpegCapture`])
/// - **FrameSource**: 统一的 open / frames / release 接口
///
/// ## 帧序列
/// ```text
/// Image:        Frame                         (图片无法解码时为 EndOfStream)
/// Video/Camera: Frame, Frame, ..., EndOfStream (只出现一次)
/// ```
/// `frames()` 不可重启: 第二次调用直接结束。
pub mod ffmpeg;

use std::fmt;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::error::SourceError;
use crate::frame::Frame;

pub use ffmpeg::FfmpegCapture;

/// 帧源类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Image(PathBuf),
    Video(PathBuf),
    /// 摄像头设备索引
    Camera(usize),
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Image(path) => write!(f, "image {}", path.display()),
            SourceKind::Video(path) => write!(f, "video {}", path.display()),
            SourceKind::Camera(index) => write!(f, "camera #{index}"),
        }
    }
}

/// `frames()` 产出的事件
#[derive(Debug, Clone)]
pub enum SourceEvent {
    Frame(Frame),
    EndOfStream,
}

impl SourceEvent {
    pub fn into_frame(self) -> Option<Frame> {
        match self {
            SourceEvent::Frame(frame) => Some(frame),
            SourceEvent::EndOfStream => None,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, SourceEvent::EndOfStream)
    }
}

/// 采集设备 (视频文件解码器 / 摄像头)
pub trait Capture: Send {
    /// 阻塞读取下一帧; 流结束或设备失效时返回 `None`
    fn read(&mut self) -> Option<Frame>;

    /// 释放设备; 可重复调用
    fn release(&mut self);
}

/// 打开采集设备的工厂函数
pub type CaptureOpener = Box<dyn FnMut(&SourceKind) -> Result<Box<dyn Capture>, SourceError> + Send>;

fn open_ffmpeg(kind: &SourceKind) -> Result<Box<dyn Capture>, SourceError> {
    Ok(Box::new(FfmpegCapture::open(kind)?))
}

pub struct FrameSource {
    kind: SourceKind,
    opener: CaptureOpener,
    capture: Option<Box<dyn Capture>>,
    consumed: bool,
    next_index: u64,
}

impl FrameSource {
    /// 使用默认的 ffmpeg 采集设备
    pub fn new(kind: SourceKind) -> Self {
        Self::with_opener(kind, Box::new(open_ffmpeg))
    }

    /// 使用自定义的采集设备
    pub fn with_opener(kind: SourceKind, opener: CaptureOpener) -> Self {
        Self {
            kind,
            opener,
            capture: None,
            consumed: false,
            next_index: 0,
        }
    }

    pub fn kind(&self) -> &SourceKind {
        &self.kind
    }

    pub fn is_open(&self) -> bool {
        self.capture.is_some()
    }

    /// 打开帧源; 图片无需打开, 直接成功
    pub fn open(&mut self) -> Result<(), SourceError> {
        info!("📂 打开帧源: {}", self.kind);
        if matches!(self.kind, SourceKind::Image(_)) {
            return Ok(());
        }
        if self.capture.is_some() {
            debug!("帧源已打开: {}", self.kind);
            return Ok(());
        }
        match (self.opener)(&self.kind) {
            Ok(capture) => {
                self.capture = Some(capture);
                Ok(())
            }
            Err(e) => {
                warn!("❌ 打开帧源失败: {e}");
                Err(e)
            }
        }
    }

    /// 帧序列 (惰性, 不可重启)
    pub fn frames(&mut self) -> Frames<'_> {
        let done = self.consumed;
        if done {
            debug!("帧序列已被消费过: {}", self.kind);
        }
        self.consumed = true;
        Frames { source: self, done }
    }

    /// 释放设备; 可重复调用, 打开失败后调用也安全
    pub fn release(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            info!("🔌 释放帧源: {}", self.kind);
            capture.release();
        }
    }

    fn stamp(&mut self, frame: Frame) -> Frame {
        let index = self.next_index;
        self.next_index += 1;
        frame.with_index(index)
    }

    fn load_image(&mut self, path: &std::path::Path) -> SourceEvent {
        match image::open(path) {
            Ok(img) => {
                debug!("读取图片 {} ({}x{})", path.display(), img.width(), img.height());
                SourceEvent::Frame(self.stamp(Frame::from_dynamic(img)))
            }
            Err(e) => {
                warn!("⚠️ 图片无法解码 {}: {}", path.display(), SourceError::from(e));
                SourceEvent::EndOfStream
            }
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.release();
    }
}

/// [`FrameSource::frames`] 返回的迭代器
pub struct Frames<'a> {
    source: &'a mut FrameSource,
    done: bool,
}

impl Iterator for Frames<'_> {
    type Item = SourceEvent;

    fn next(&mut self) -> Option<SourceEvent> {
        if self.done {
            return None;
        }

        if let SourceKind::Image(path) = &self.source.kind {
            let path = path.clone();
            self.done = true;
            return Some(self.source.load_image(&path));
        }

        let frame = self.source.capture.as_mut().and_then(|capture| capture.read());
        match frame {
            Some(frame) => Some(SourceEvent::Frame(self.source.stamp(frame))),
            None => {
                info!("📹 帧源读取结束: {}", self.source.kind);
                self.done = true;
                Some(SourceEvent::EndOfStream)
            }
        }
    }
}
