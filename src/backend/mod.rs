// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 推理后端接口 (Inference Backend)
///
/// ## 架构说明
/// - **InferenceBackend**: 外部推理引擎的统一接口 (加载 / 检测 / 跟踪)
///   - 跟踪模式下后端自行维护轨迹状态 (persist = true 时跨帧保持 track_id)
/// - **Detector**: 面向流水线的封装
///   - 加载前校验模型格式 (`.pth` 直接拒绝, 不会传给后端)
///   - 记录模型信息 (task / device / class_names)
/// - **ReplayBackend**: 回放 JSON 录制的检测结果, 不依赖 GPU 模型
///
/// ## 核心流程
/// ```text
/// 模型路径 → ModelFormat::from_path → InferenceBackend::load → ModelInfo
/// Frame → infer / track → RawResult → detection::normalize → DetectionResult
/// ```
pub mod replay;

use std::fmt;
use std::path::Path;

use anyhow::Result;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::detection::{ClassNames, RawResult};
use crate::error::PipelineError;
use crate::frame::Frame;

pub use replay::ReplayBackend;

/// 模型文件格式 (根据扩展名识别)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelFormat {
    /// PyTorch 导出的 YOLO 权重
    Pt,
    /// ONNX 模型
    Onnx,
    /// 纯 state_dict 权重, 不包含网络结构, 不支持
    Pth,
    /// JSON 检测结果录制 (回放后端)
    Replay,
    Other(String),
}

impl ModelFormat {
    /// 从模型路径推断格式
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "pt" => ModelFormat::Pt,
            "onnx" => ModelFormat::Onnx,
            "pth" => ModelFormat::Pth,
            "json" => ModelFormat::Replay,
            _ => ModelFormat::Other(ext),
        }
    }
}

/// 模型任务类型
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    #[default]
    Detect,
    Segment,
    Pose,
    Obb,
    Classify,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Task::Detect => "detect",
            Task::Segment => "segment",
            Task::Pose => "pose",
            Task::Obb => "obb",
            Task::Classify => "classify",
            Task::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// 模型加载成功后返回的信息
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub task: Task,
    pub device: String,
    pub class_names: ClassNames,
}

/// 推理后端统一接口
///
/// 所有调用都发生在推理线程中; 实现方只需 `Send`。
pub trait InferenceBackend: Send {
    /// 加载模型, 返回任务类型 / 设备 / 类别名称
    fn load(&mut self, path: &Path) -> Result<ModelInfo>;

    /// 单帧普通推理 (无跟踪)
    ///
    /// # Arguments
    /// * `frame` - 原始帧
    /// * `size` - 推理尺寸 (正方形边长)
    fn infer(&mut self, frame: &Frame, size: u32) -> Result<RawResult>;

    /// 单帧多目标跟踪推理
    ///
    /// 连续调用并设置 `persist = true` 时, 后端需在帧间保持轨迹与 track_id。
    fn track(
        &mut self,
        frame: &Frame,
        size: u32,
        tracker_profile: &str,
        persist: bool,
    ) -> Result<RawResult>;
}

/// 检测器: 对流水线提供统一的 加载 / 推理 / 跟踪 接口
pub struct Detector {
    backend: Box<dyn InferenceBackend>,
    info: Option<ModelInfo>,
}

impl Detector {
    pub fn new(backend: Box<dyn InferenceBackend>) -> Self {
        Self {
            backend,
            info: None,
        }
    }

    /// 加载模型; 失败时保留之前已加载的模型
    pub fn load_model(&mut self, path: &Path) -> Result<&ModelInfo, PipelineError> {
        info!("📦 加载模型: {}", path.display());

        if ModelFormat::from_path(path) == ModelFormat::Pth {
            warn!("⚠️ 尝试加载不支持的 .pth 模型: {}", path.display());
            return Err(PipelineError::configuration(format!(
                "unsupported model format '.pth' ({}): export the model to .pt or .onnx",
                path.display()
            )));
        }

        match self.backend.load(path) {
            Ok(model) => {
                info!(
                    "✅ 模型加载成功: task={}, device={}, classes={}",
                    model.task,
                    model.device,
                    model.class_names.len()
                );
                Ok(&*self.info.insert(model))
            }
            Err(e) => {
                error!("❌ 模型加载失败: {e:#}");
                Err(PipelineError::configuration(format!(
                    "failed to load model {}: {e:#}",
                    path.display()
                )))
            }
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.info.is_some()
    }

    pub fn info(&self) -> Option<&ModelInfo> {
        self.info.as_ref()
    }

    pub fn names(&self) -> Option<&ClassNames> {
        self.info.as_ref().map(|info| &info.class_names)
    }

    fn ensure_loaded(&self) -> Result<(), PipelineError> {
        if self.info.is_none() {
            return Err(PipelineError::configuration("model not loaded"));
        }
        Ok(())
    }

    /// 普通推理
    pub fn infer(&mut self, frame: &Frame, size: u32) -> Result<RawResult, PipelineError> {
        self.ensure_loaded()?;
        self.backend
            .infer(frame, size)
            .map_err(|e| PipelineError::Backend(format!("{e:#}")))
    }

    /// 跟踪推理
    pub fn track(
        &mut self,
        frame: &Frame,
        size: u32,
        tracker_profile: &str,
        persist: bool,
    ) -> Result<RawResult, PipelineError> {
        self.ensure_loaded()?;
        self.backend
            .track(frame, size, tracker_profile, persist)
            .map_err(|e| PipelineError::Backend(format!("{e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingBackend {
        loads: Arc<AtomicUsize>,
    }

    impl InferenceBackend for CountingBackend {
        fn load(&mut self, _path: &Path) -> Result<ModelInfo> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(ModelInfo {
                task: Task::Segment,
                device: "cpu".into(),
                class_names: [(0, "person")].into_iter().collect(),
            })
        }

        fn infer(&mut self, _frame: &Frame, _size: u32) -> Result<RawResult> {
            anyhow::bail!("out of memory")
        }

        fn track(&mut self, _: &Frame, _: u32, _: &str, _: bool) -> Result<RawResult> {
            Ok(RawResult::empty())
        }
    }

    #[test]
    fn test_model_format_from_path() {
        assert_eq!(ModelFormat::from_path(Path::new("yolov8n.pt")), ModelFormat::Pt);
        assert_eq!(ModelFormat::from_path(Path::new("m/yolo.ONNX")), ModelFormat::Onnx);
        assert_eq!(ModelFormat::from_path(Path::new("w.Pth")), ModelFormat::Pth);
        assert_eq!(
            ModelFormat::from_path(Path::new("model.engine")),
            ModelFormat::Other("engine".into())
        );
    }

    #[test]
    fn test_pth_rejected_before_backend() {
        let loads = Arc::new(AtomicUsize::new(0));
        let mut detector = Detector::new(Box::new(CountingBackend {
            loads: loads.clone(),
        }));

        let err = detector.load_model(&PathBuf::from("weights.pth")).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
        assert!(err.to_string().contains(".pth"));
        assert_eq!(loads.load(Ordering::SeqCst), 0);
        assert!(!detector.is_loaded());

        let info = detector.load_model(Path::new("yolov8n-seg.pt")).unwrap();
        assert_eq!(info.task, Task::Segment);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_inference_requires_model_and_wraps_errors() {
        let mut detector = Detector::new(Box::new(CountingBackend {
            loads: Arc::new(AtomicUsize::new(0)),
        }));
        let frame = Frame::new(vec![0; 3], 1, 1, 3).unwrap();

        assert!(matches!(
            detector.infer(&frame, 640),
            Err(PipelineError::Configuration(_))
        ));

        detector.load_model(Path::new("yolov8n.onnx")).unwrap();
        let err = detector.infer(&frame, 640).unwrap_err();
        assert!(matches!(err, PipelineError::Backend(ref msg) if msg.contains("out of memory")));
        assert!(detector.track(&frame, 640, "bytetrack.yaml", true).is_ok());
    }

    #[test]
    fn test_task_display_and_parse() {
        let task: Task = serde_json::from_str("\"segment\"").unwrap();
        assert_eq!(task, Task::Segment);
        let task: Task = serde_json::from_str("\"keypoints\"").unwrap();
        assert_eq!(task, Task::Unknown);
        assert_eq!(Task::Obb.to_string(), "obb");
    }
}
