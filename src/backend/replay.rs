// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 回放后端 (Replay Backend)
//!
//! 从 JSON 录制文件读取逐帧检测结果, 按调用顺序循环回放。
//! 用于在没有 GPU 模型的环境中驱动整条流水线。
//!
//! 录制格式:
//! ```json
//! {
//!   "task": "segment",
//!   "device": "cpu",
//!   "class_names": { "0": "person", "1": "car" },
//!   "frames": [
//!     { "boxes": [[10, 10, 50, 50, 0.9, 0]], "track_ids": [3], "masks": [[[0.9, 0.1], [0.7, 0.0]]] }
//!   ]
//! }
//! ```

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use ndarray::Array2;
use serde::Deserialize;
use tracing::{debug, info};

use super::{InferenceBackend, ModelInfo, Task};
use crate::detection::{ClassNames, RawBox, RawBoxes, RawMask, RawMasks, RawResult, FLAT_COLUMNS};
use crate::frame::Frame;

fn default_device() -> String {
    "cpu".to_string()
}

/// 单帧录制
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordedFrame {
    /// 每行 `[x1, y1, x2, y2, conf, class_id]`
    #[serde(default)]
    pub boxes: Vec<Vec<f32>>,
    #[serde(default)]
    pub track_ids: Option<Vec<Option<i64>>>,
    /// 每个目标一张 (H, W) 激活图
    #[serde(default)]
    pub masks: Option<Vec<Vec<Vec<f32>>>>,
}

/// 完整录制文件
#[derive(Debug, Clone, Deserialize)]
pub struct Recording {
    #[serde(default)]
    pub task: Task,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default)]
    pub class_names: ClassNames,
    pub frames: Vec<RecordedFrame>,
}

impl Recording {
    pub fn from_json(json: &str) -> Result<Self> {
        let recording: Recording = serde_json::from_str(json).context("invalid recording")?;
        if recording.frames.is_empty() {
            bail!("recording contains no frames");
        }
        Ok(recording)
    }
}

impl RecordedFrame {
    /// 转换为原始输出: 逐目标记录 + 扁平表 (所有行都完整时才提供)
    fn to_raw(&self, with_track_ids: bool) -> RawResult {
        let objects = self
            .boxes
            .iter()
            .map(|row| RawBox {
                xyxy: row.iter().take(4).copied().collect(),
                conf: row.get(4).copied(),
                cls: row.get(5).copied(),
            })
            .collect();

        let table = if self.boxes.iter().all(|row| row.len() >= FLAT_COLUMNS) {
            let flat: Vec<f32> = self
                .boxes
                .iter()
                .flat_map(|row| row[..FLAT_COLUMNS].iter().copied())
                .collect();
            Array2::from_shape_vec((self.boxes.len(), FLAT_COLUMNS), flat).ok()
        } else {
            None
        };

        let masks = self.masks.as_ref().map(|planes| {
            RawMasks::new(planes.iter().map(|plane| to_mask(plane)).collect())
        });

        RawResult {
            boxes: RawBoxes::Structured { objects, table },
            masks,
            track_ids: if with_track_ids {
                self.track_ids.clone()
            } else {
                None
            },
        }
    }
}

/// 行长度不一致的掩码无法还原为矩阵, 视为不可读
fn to_mask(rows: &[Vec<f32>]) -> RawMask {
    let height = rows.len();
    let width = rows.first().map_or(0, Vec::len);
    if rows.iter().any(|row| row.len() != width) {
        return RawMask::Opaque;
    }
    let data: Vec<f32> = rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((height, width), data)
        .map(RawMask::Plane)
        .unwrap_or(RawMask::Opaque)
}

/// 回放后端
#[derive(Default)]
pub struct ReplayBackend {
    recording: Option<Recording>,
    cursor: usize,
    tracker_profile: Option<String>,
}

impl ReplayBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 直接使用内存中的录制 (无需文件)
    pub fn from_recording(recording: Recording) -> Self {
        Self {
            recording: Some(recording),
            ..Self::default()
        }
    }

    fn next_frame(&mut self) -> Result<&RecordedFrame> {
        let recording = self
            .recording
            .as_ref()
            .context("replay backend has no recording loaded")?;
        let idx = self.cursor % recording.frames.len();
        self.cursor += 1;
        Ok(&recording.frames[idx])
    }
}

impl InferenceBackend for ReplayBackend {
    fn load(&mut self, path: &Path) -> Result<ModelInfo> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("cannot read recording {}", path.display()))?;
        let recording = Recording::from_json(&json)?;
        info!(
            "🎞️ 回放录制已加载: {} 帧, {} 个类别",
            recording.frames.len(),
            recording.class_names.len()
        );
        let model = ModelInfo {
            task: recording.task.clone(),
            device: recording.device.clone(),
            class_names: recording.class_names.clone(),
        };
        self.recording = Some(recording);
        self.cursor = 0;
        self.tracker_profile = None;
        Ok(model)
    }

    fn infer(&mut self, frame: &Frame, size: u32) -> Result<RawResult> {
        debug!("回放推理: frame={} imgsz={}", frame.index(), size);
        Ok(self.next_frame()?.to_raw(false))
    }

    fn track(
        &mut self,
        frame: &Frame,
        size: u32,
        tracker_profile: &str,
        persist: bool,
    ) -> Result<RawResult> {
        if self.tracker_profile.as_deref() != Some(tracker_profile) {
            info!("🎯 跟踪器: {tracker_profile}");
            self.tracker_profile = Some(tracker_profile.to_string());
        }
        debug!(
            "回放跟踪: frame={} imgsz={} persist={}",
            frame.index(),
            size,
            persist
        );
        Ok(self.next_frame()?.to_raw(true))
    }
}
