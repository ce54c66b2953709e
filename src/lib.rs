// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod backend; // 推理后端接口
pub mod detection; // 检测结果与归一化
pub mod error; // 错误类型
pub mod frame; // 视频帧
pub mod pipeline; // 实时处理流水线
pub mod sink; // 视频输出
pub mod source; // 帧源 (图片/视频/摄像头)
pub mod visualize; // 文本说明/缩放/绘制

pub use crate::backend::{Detector, InferenceBackend, ModelFormat, ModelInfo, ReplayBackend, Task};
pub use crate::detection::{
    normalize, BoundingBox, ClassNames, Detection, DetectionResult, RawBox, RawBoxes, RawMask,
    RawMasks, RawResult,
};
pub use crate::error::{PipelineError, SinkError, SourceError};
pub use crate::frame::Frame;
pub use crate::pipeline::{PipelineConfig, PipelineController, PipelineOutput, PipelineStats};
pub use crate::source::{FrameSource, SourceEvent, SourceKind};
pub use crate::visualize::{format_info_text, resize_for_display, Annotator};

/// 时间字符串 (北京时间), 用于输出目录命名
pub fn gen_time_string(delimiter: &str) -> String {
    use chrono::Offset;
    let offset = chrono::FixedOffset::east_opt(8 * 60 * 60).unwrap_or_else(|| chrono::Utc.fix()); // Beijing
    let t_now = chrono::Utc::now().with_timezone(&offset);
    let fmt = format!(
        "%Y{}%m{}%d{}%H{}%M{}%S{}%f",
        delimiter, delimiter, delimiter, delimiter, delimiter, delimiter
    );
    t_now.format(&fmt).to_string()
}
