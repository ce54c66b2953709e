// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 视频输出 (Video Sink)
//!
//! - `Codec::for_path`: 根据扩展名选择编码 (`.avi` → MJPG, 其他 → avc1)
//! - `VideoSink`: open / write / close 接口
//! - `ImageSequenceSink`: 逐帧写出编号的 JPEG
//! - `Recorder`: 首帧到达时按其尺寸打开输出

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::SinkError;
use crate::frame::Frame;

/// 源帧率未知时使用的输出帧率
pub const DEFAULT_FPS: f64 = 25.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Mjpeg,
    H264,
}

impl Codec {
    /// `.avi` (不区分大小写) 使用 MJPEG, 其他一律 H.264
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("avi") => Codec::Mjpeg,
            _ => Codec::H264,
        }
    }

    pub fn fourcc(&self) -> &'static str {
        match self {
            Codec::Mjpeg => "MJPG",
            Codec::H264 => "avc1",
        }
    }
}

/// 输出参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SinkSpec {
    pub frame_size: (u32, u32),
    pub fps: f64,
    pub codec: Codec,
}

impl SinkSpec {
    /// 帧率无效 (≤ 0 或非有限值) 时退回 [`DEFAULT_FPS`]
    pub fn new(frame_size: (u32, u32), fps: f64, codec: Codec) -> Self {
        let fps = if fps.is_finite() && fps > 0.0 { fps } else { DEFAULT_FPS };
        Self {
            frame_size,
            fps,
            codec,
        }
    }
}

pub trait VideoSink: Send {
    fn open(&mut self, spec: &SinkSpec) -> Result<(), SinkError>;
    fn write(&mut self, frame: &Frame) -> Result<(), SinkError>;
    fn close(&mut self) -> Result<(), SinkError>;
}

// ========== 图片序列 ==========

/// 把每帧写成 `frame_000000.jpg` 形式的图片
pub struct ImageSequenceSink {
    dir: PathBuf,
    spec: Option<SinkSpec>,
    written: u64,
}

impl ImageSequenceSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            spec: None,
            written: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    fn frame_path(&self, n: u64) -> PathBuf {
        self.dir.join(format!("frame_{n:06}.jpg"))
    }
}

impl VideoSink for ImageSequenceSink {
    fn open(&mut self, spec: &SinkSpec) -> Result<(), SinkError> {
        fs::create_dir_all(&self.dir)?;
        info!(
            "💾 输出目录: {} (size={}x{}, fps={:.2}, codec={})",
            self.dir.display(),
            spec.frame_size.0,
            spec.frame_size.1,
            spec.fps,
            spec.codec.fourcc()
        );
        self.spec = Some(*spec);
        self.written = 0;
        Ok(())
    }

    fn write(&mut self, frame: &Frame) -> Result<(), SinkError> {
        let spec = self.spec.ok_or(SinkError::NotOpen)?;
        let got = (frame.width(), frame.height());
        if got != spec.frame_size {
            return Err(SinkError::FrameSize {
                expected: spec.frame_size,
                got,
            });
        }
        let img = frame.to_rgb_image().ok_or(SinkError::Pixels(frame.index()))?;
        img.save(self.frame_path(self.written))?;
        self.written += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if self.spec.take().is_some() {
            info!("💾 已写出 {} 帧到 {}", self.written, self.dir.display());
        }
        Ok(())
    }
}

// ========== 录制器 ==========

/// 延迟打开的录制器: 第一帧决定输出尺寸
pub struct Recorder<S: VideoSink> {
    sink: S,
    fps: f64,
    codec: Codec,
    spec: Option<SinkSpec>,
}

impl<S: VideoSink> Recorder<S> {
    /// `target` 只用于选择编码
    pub fn new(sink: S, target: &Path, fps: f64) -> Self {
        Self {
            sink,
            fps,
            codec: Codec::for_path(target),
            spec: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.spec.is_some()
    }

    pub fn spec(&self) -> Option<&SinkSpec> {
        self.spec.as_ref()
    }

    pub fn record(&mut self, frame: &Frame) -> Result<(), SinkError> {
        if self.spec.is_none() {
            let spec = SinkSpec::new((frame.width(), frame.height()), self.fps, self.codec);
            debug!("初始化视频写入器: {:?}", spec);
            self.sink.open(&spec)?;
            self.spec = Some(spec);
        }
        self.sink.write(frame)
    }

    /// 关闭输出; 从未写入过帧时什么都不做
    pub fn finish(&mut self) -> Result<(), SinkError> {
        if self.spec.take().is_some() {
            self.sink.close()?;
        }
        Ok(())
    }

    pub fn into_inner(self) -> S {
        self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_for_path() {
        assert_eq!(Codec::for_path(Path::new("out.avi")), Codec::Mjpeg);
        assert_eq!(Codec::for_path(Path::new("OUT.AVI")), Codec::Mjpeg);
        assert_eq!(Codec::for_path(Path::new("out.mp4")), Codec::H264);
        assert_eq!(Codec::for_path(Path::new("out")), Codec::H264);
        assert_eq!(Codec::Mjpeg.fourcc(), "MJPG");
        assert_eq!(Codec::H264.fourcc(), "avc1");
    }

    #[test]
    fn test_spec_fps_fallback() {
        assert_eq!(SinkSpec::new((1, 1), 0.0, Codec::H264).fps, DEFAULT_FPS);
        assert_eq!(SinkSpec::new((1, 1), f64::NAN, Codec::H264).fps, DEFAULT_FPS);
        assert_eq!(SinkSpec::new((1, 1), 30.0, Codec::H264).fps, 30.0);
    }

    #[test]
    fn test_write_before_open_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = ImageSequenceSink::new(dir.path());
        let frame = Frame::new(vec![0; 12], 2, 2, 3).unwrap();
        assert!(matches!(sink.write(&frame), Err(SinkError::NotOpen)));
    }

    #[test]
    fn test_recorder_opens_lazily_with_first_frame_size() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("frames");
        let mut recorder = Recorder::new(ImageSequenceSink::new(&out), Path::new("out.avi"), -1.0);
        assert!(!recorder.is_open());

        let frame = Frame::new(vec![200; 8 * 6 * 3], 8, 6, 3).unwrap();
        recorder.record(&frame).unwrap();
        recorder.record(&frame).unwrap();
        let spec = *recorder.spec().unwrap();
        assert_eq!(spec.frame_size, (8, 6));
        assert_eq!(spec.codec, Codec::Mjpeg);
        assert_eq!(spec.fps, DEFAULT_FPS);

        let wrong = Frame::new(vec![0; 12], 2, 2, 3).unwrap();
        assert!(matches!(
            recorder.record(&wrong),
            Err(SinkError::FrameSize { .. })
        ));

        recorder.finish().unwrap();
        let sink = recorder.into_inner();
        assert_eq!(sink.written(), 2);
        assert!(out.join("frame_000000.jpg").exists());
        assert!(out.join("frame_000001.jpg").exists());
    }
}
