// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 流水线错误类型
//! Error kinds surfaced by the pipeline and the frame source

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// 流水线错误
///
/// 只有 `Configuration` 会同步返回给调用方; `Decode` / `Backend` 属于单帧错误,
/// 在工作线程内记录日志后跳过该帧; `ShutdownTimeout` 仅记录, 不阻塞 `stop()`。
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to decode inference output: {0}")]
    Decode(String),

    #[error("inference backend failed: {0}")]
    Backend(String),

    #[error("inference worker did not exit within {0:?}")]
    ShutdownTimeout(Duration),
}

impl PipelineError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }
}

/// 帧源错误 (设备被占用 / 文件不可读)
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open video source {path:?}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("camera {index} is unavailable after {attempts} attempts: {reason}")]
    Camera {
        index: usize,
        attempts: u32,
        reason: String,
    },

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

/// 视频输出错误
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("video sink is not open")]
    NotOpen,

    #[error("frame size {got:?} does not match the sink size {expected:?}")]
    FrameSize {
        expected: (u32, u32),
        got: (u32, u32),
    },

    #[error("cannot convert frame #{0} to RGB")]
    Pixels(u64),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}
