// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 检测结果数据结构定义
/// Uniform detection data model shared by plain detection, segmentation and tracking
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ========== 类别名称映射 ==========

/// 模型级别的 class_id → 类别名称映射
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassNames(BTreeMap<u32, String>);

impl ClassNames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: u32, name: impl Into<String>) {
        self.0.insert(id, name.into());
    }

    pub fn get(&self, id: u32) -> Option<&str> {
        self.0.get(&id).map(String::as_str)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.0.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 解析类别名称; 映射中没有时退化为数字字符串
    pub fn resolve(&self, id: u32) -> String {
        self.get(id)
            .map(str::to_owned)
            .unwrap_or_else(|| id.to_string())
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> {
        self.0.iter().map(|(id, name)| (*id, name.as_str()))
    }
}

impl<S: Into<String>> FromIterator<(u32, S)> for ClassNames {
    fn from_iter<I: IntoIterator<Item = (u32, S)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(id, name)| (id, name.into())).collect())
    }
}

/// 按下标编号 (与 YOLO 模型导出的 names 列表一致)
impl From<Vec<String>> for ClassNames {
    fn from(names: Vec<String>) -> Self {
        names
            .into_iter()
            .enumerate()
            .map(|(id, name)| (id as u32, name))
            .collect()
    }
}

// ========== 检测框 ==========

/// 轴对齐检测框 (像素坐标, 保证 x1 ≤ x2, y1 ≤ y2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    /// 自动交换颠倒的坐标
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    pub fn width(&self) -> u32 {
        self.x2.abs_diff(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.abs_diff(self.y1)
    }
}

// ========== 单个检测目标 ==========

/// 单个检测目标
///
/// - 普通检测: class_id / class_name / confidence / bbox
/// - 分割: 额外 mask_present / mask_pixel_area
/// - 跟踪: 额外 track_id (仅在启用跟踪且关联成功时存在)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub class_id: u32,
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub mask_present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask_pixel_area: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_id: Option<u64>,
}

impl Detection {
    pub fn new(class_id: u32, class_name: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            class_id,
            class_name: class_name.into(),
            confidence,
            bbox,
            mask_present: false,
            mask_pixel_area: None,
            track_id: None,
        }
    }
}

// ========== 单帧检测结果 ==========

/// 单帧检测结果: 有序的检测列表 + 解析名称所用的映射
///
/// 顺序与推理后端输出顺序一致, 不重新排序。空结果是合法状态。
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectionResult {
    detections: Vec<Detection>,
    names: ClassNames,
}

impl DetectionResult {
    pub fn new(detections: Vec<Detection>, names: ClassNames) -> Self {
        Self { detections, names }
    }

    pub fn empty(names: ClassNames) -> Self {
        Self::new(Vec::new(), names)
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn detections(&self) -> &[Detection] {
        &self.detections
    }

    pub fn names(&self) -> &ClassNames {
        &self.names
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Detection> {
        self.detections.iter()
    }

    /// 按类别统计数量, 按首次出现顺序排列
    pub fn count_by_class(&self) -> Vec<(String, usize)> {
        let mut counts: Vec<(String, usize)> = Vec::new();
        for det in &self.detections {
            match counts.iter_mut().find(|(name, _)| *name == det.class_name) {
                Some((_, n)) => *n += 1,
                None => counts.push((det.class_name.clone(), 1)),
            }
        }
        counts
    }
}

impl<'a> IntoIterator for &'a DetectionResult {
    type Item = &'a Detection;
    type IntoIter = std::slice::Iter<'a, Detection>;

    fn into_iter(self) -> Self::IntoIter {
        self.detections.iter()
    }
}
