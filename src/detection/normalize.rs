// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 推理结果归一化 (Result Normalizer)
//!
//! 推理后端的单帧原始输出 → 统一的 [`DetectionResult`]。
//!
//! ```text
//! RawBoxes::Structured ──(逐目标解析)──┐
//!        │ 任一目标解析失败            ├─→ Vec<Detection> (+ 掩码 / 跟踪ID 按下标对齐)
//!        └──→ 回退: 扁平表 (x1,y1,x2,y2,conf,cls) ──┘
//! RawBoxes::Flat ─────(扁平表解析)─────┘
//! ```
//! 两种策略都失败时整帧解析失败 (`PipelineError::Decode`), 不静默丢弃。

use ndarray::{Array2, Array3, ArrayView1, Axis};
use tracing::{debug, warn};

use super::types::{BoundingBox, ClassNames, Detection, DetectionResult};
use crate::error::PipelineError;

/// 掩码激活阈值: 像素值大于该值才计入掩码面积
pub const MASK_THRESHOLD: f32 = 0.5;

/// 扁平表每行的最少列数: x1, y1, x2, y2, conf, class_id
pub const FLAT_COLUMNS: usize = 6;

// ========== 原始输出 (推理后端边界) ==========

/// 逐目标的原始检测记录
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawBox {
    pub xyxy: Vec<f32>,
    pub conf: Option<f32>,
    pub cls: Option<f32>,
}

impl RawBox {
    pub fn new(xyxy: [f32; 4], conf: f32, cls: f32) -> Self {
        Self {
            xyxy: xyxy.to_vec(),
            conf: Some(conf),
            cls: Some(cls),
        }
    }
}

/// 原始检测框的两种表示
#[derive(Debug, Clone, PartialEq)]
pub enum RawBoxes {
    /// 逐目标记录; `table` 为同一批数据的扁平表, 供回退解析使用
    Structured {
        objects: Vec<RawBox>,
        table: Option<Array2<f32>>,
    },
    /// 扁平数值表, 每行 `(x1, y1, x2, y2, conf, class_id)`
    Flat(Array2<f32>),
}

impl RawBoxes {
    pub fn len(&self) -> usize {
        match self {
            RawBoxes::Structured { objects, .. } => objects.len(),
            RawBoxes::Flat(table) => table.nrows(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 单个目标的分割掩码
#[derive(Debug, Clone, PartialEq)]
pub enum RawMask {
    /// (H, W) 激活图
    Plane(Array2<f32>),
    /// 掩码存在但像素数据不可读 (例如仍在设备端或格式不支持)
    Opaque,
}

/// 按下标与检测框对齐的掩码集合
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawMasks(Vec<RawMask>);

impl RawMasks {
    pub fn new(masks: Vec<RawMask>) -> Self {
        Self(masks)
    }

    /// 由 (N, H, W) 掩码张量拆分
    pub fn from_stack(stack: Array3<f32>) -> Self {
        Self(
            stack
                .axis_iter(Axis(0))
                .map(|plane| RawMask::Plane(plane.to_owned()))
                .collect(),
        )
    }

    pub fn get(&self, idx: usize) -> Option<&RawMask> {
        self.0.get(idx)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// 推理后端的单帧原始输出
#[derive(Debug, Clone, PartialEq)]
pub struct RawResult {
    pub boxes: RawBoxes,
    pub masks: Option<RawMasks>,
    /// 跟踪ID, 按下标对齐; `None` 元素表示该目标未关联到轨迹
    pub track_ids: Option<Vec<Option<i64>>>,
}

impl RawResult {
    pub fn empty() -> Self {
        Self::flat(Array2::zeros((0, FLAT_COLUMNS)))
    }

    pub fn structured(objects: Vec<RawBox>) -> Self {
        Self {
            boxes: RawBoxes::Structured {
                objects,
                table: None,
            },
            masks: None,
            track_ids: None,
        }
    }

    pub fn flat(table: Array2<f32>) -> Self {
        Self {
            boxes: RawBoxes::Flat(table),
            masks: None,
            track_ids: None,
        }
    }

    pub fn with_masks(mut self, masks: RawMasks) -> Self {
        self.masks = Some(masks);
        self
    }

    pub fn with_track_ids(mut self, ids: Vec<Option<i64>>) -> Self {
        self.track_ids = Some(ids);
        self
    }
}

// ========== 解析策略 ==========

/// 实际生效的解析策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStrategy {
    Structured,
    Flat,
}

/// 必填字段 (class_id / confidence / bbox)
#[derive(Debug, Clone, PartialEq)]
struct BoxRecord {
    class_id: u32,
    confidence: f32,
    bbox: BoundingBox,
}

fn extract_record(
    xyxy: &[f32],
    conf: Option<f32>,
    cls: Option<f32>,
    names: &ClassNames,
) -> Result<BoxRecord, String> {
    let [x1, y1, x2, y2] = <[f32; 4]>::try_from(xyxy)
        .map_err(|_| format!("expected 4 coordinates, got {}", xyxy.len()))?;
    if [x1, y1, x2, y2].iter().any(|v| !v.is_finite()) {
        return Err("non-finite coordinate".to_string());
    }

    let confidence = conf.ok_or("missing confidence")?;
    if !(0.0..=1.0).contains(&confidence) {
        return Err(format!("confidence {confidence} outside [0, 1]"));
    }

    let cls = cls.ok_or("missing class id")?;
    if !cls.is_finite() || cls < 0.0 || cls.fract() != 0.0 || cls > u32::MAX as f32 {
        return Err(format!("invalid class id {cls}"));
    }
    let class_id = cls as u32;
    if !names.is_empty() && !names.contains(class_id) {
        return Err(format!("class id {class_id} missing from name map"));
    }

    Ok(BoxRecord {
        class_id,
        confidence,
        bbox: BoundingBox::new(x1 as i32, y1 as i32, x2 as i32, y2 as i32),
    })
}

fn decode_structured(objects: &[RawBox], names: &ClassNames) -> Result<Vec<BoxRecord>, String> {
    objects
        .iter()
        .enumerate()
        .map(|(idx, obj)| {
            extract_record(&obj.xyxy, obj.conf, obj.cls, names)
                .map_err(|e| format!("object #{idx}: {e}"))
        })
        .collect()
}

fn decode_row(row: ArrayView1<f32>, names: &ClassNames) -> Result<BoxRecord, String> {
    let xyxy = [row[0], row[1], row[2], row[3]];
    extract_record(&xyxy, Some(row[4]), Some(row[5]), names)
}

fn decode_flat(table: &Array2<f32>, names: &ClassNames) -> Result<Vec<BoxRecord>, String> {
    if table.ncols() < FLAT_COLUMNS {
        return Err(format!(
            "flat table has {} columns, expected at least {FLAT_COLUMNS}",
            table.ncols()
        ));
    }
    table
        .rows()
        .into_iter()
        .enumerate()
        .map(|(idx, row)| decode_row(row, names).map_err(|e| format!("row #{idx}: {e}")))
        .collect()
}

/// 按固定顺序尝试两种策略: 逐目标 → 扁平表
fn decode_boxes(
    boxes: &RawBoxes,
    names: &ClassNames,
) -> Result<(Vec<BoxRecord>, DecodeStrategy), PipelineError> {
    match boxes {
        RawBoxes::Structured { objects, table } => match decode_structured(objects, names) {
            Ok(records) => Ok((records, DecodeStrategy::Structured)),
            Err(reason) => {
                warn!("逐目标解析失败 ({reason}), 退回到扁平表解析");
                let table = table.as_ref().ok_or_else(|| {
                    PipelineError::decode(format!("{reason}; no flat table to fall back to"))
                })?;
                if table.nrows() != objects.len() {
                    return Err(PipelineError::decode(format!(
                        "{reason}; fallback table has {} rows for {} objects",
                        table.nrows(),
                        objects.len()
                    )));
                }
                decode_flat(table, names)
                    .map(|records| (records, DecodeStrategy::Flat))
                    .map_err(|fallback| PipelineError::decode(format!("{reason}; {fallback}")))
            }
        },
        RawBoxes::Flat(table) => decode_flat(table, names)
            .map(|records| (records, DecodeStrategy::Flat))
            .map_err(PipelineError::decode),
    }
}

// ========== 可选字段 ==========

/// 掩码像素面积; 数据不可读或含非有限值时返回 `None`
fn mask_area(mask: &RawMask) -> Option<f32> {
    match mask {
        RawMask::Plane(plane) => {
            if plane.iter().any(|v| !v.is_finite()) {
                return None;
            }
            Some(plane.iter().filter(|&&v| v > MASK_THRESHOLD).count() as f32)
        }
        RawMask::Opaque => None,
    }
}

fn track_id_at(ids: Option<&Vec<Option<i64>>>, idx: usize) -> Option<u64> {
    ids.and_then(|ids| ids.get(idx).copied().flatten())
        .and_then(|id| u64::try_from(id).ok())
}

// ========== 入口 ==========

/// 把原始输出归一化为 [`DetectionResult`], 返回实际使用的解析策略
pub fn normalize_with_strategy(
    raw: &RawResult,
    names: &ClassNames,
) -> Result<(DetectionResult, DecodeStrategy), PipelineError> {
    let initial = match raw.boxes {
        RawBoxes::Structured { .. } => DecodeStrategy::Structured,
        RawBoxes::Flat(_) => DecodeStrategy::Flat,
    };
    if raw.boxes.is_empty() {
        return Ok((DetectionResult::empty(names.clone()), initial));
    }

    let (records, strategy) = decode_boxes(&raw.boxes, names)?;

    let detections = records
        .into_iter()
        .enumerate()
        .map(|(idx, record)| {
            let mut det = Detection::new(
                record.class_id,
                names.resolve(record.class_id),
                record.confidence,
                record.bbox,
            );
            if let Some(mask) = raw.masks.as_ref().and_then(|m| m.get(idx)) {
                det.mask_present = true;
                det.mask_pixel_area = mask_area(mask);
                if det.mask_pixel_area.is_none() {
                    debug!("目标 #{idx} 的掩码面积无法计算, 仅保留掩码标记");
                }
            }
            det.track_id = track_id_at(raw.track_ids.as_ref(), idx);
            det
        })
        .collect();

    Ok((DetectionResult::new(detections, names.clone()), strategy))
}

/// 把原始输出归一化为 [`DetectionResult`]
pub fn normalize(raw: &RawResult, names: &ClassNames) -> Result<DetectionResult, PipelineError> {
    normalize_with_strategy(raw, names).map(|(result, _)| result)
}

impl DetectionResult {
    /// 从推理后端的原始输出构建
    pub fn from_raw(raw: &RawResult, names: &ClassNames) -> Result<Self, PipelineError> {
        normalize(raw, names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn person_car() -> ClassNames {
        [(0, "person"), (1, "car")].into_iter().collect()
    }

    #[test]
    fn test_empty_boxes_is_not_an_error() {
        let result = normalize(&RawResult::empty(), &person_car()).unwrap();
        assert!(result.is_empty());
        assert!(result.count_by_class().is_empty());

        let result = normalize(&RawResult::structured(vec![]), &ClassNames::new()).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_flat_two_boxes() {
        let raw = RawResult::flat(array![
            [10.0, 10.0, 50.0, 50.0, 0.9, 0.0],
            [20.0, 20.0, 60.0, 60.0, 0.5, 1.0]
        ]);
        let result = normalize(&raw, &person_car()).unwrap();
        assert_eq!(result.len(), 2);

        let first = &result.detections()[0];
        assert_eq!(first.class_name, "person");
        assert_eq!(first.bbox, BoundingBox::new(10, 10, 50, 50));
        assert!(!first.mask_present);
        assert_eq!(first.track_id, None);
        assert_eq!(result.detections()[1].class_name, "car");
        assert_eq!(
            result.count_by_class(),
            vec![("person".to_string(), 1), ("car".to_string(), 1)]
        );

        let text = crate::visualize::format_info_text(&result);
        assert_eq!(
            text,
            "Detections:\n\
             object: person, confidence: 0.90, box: (10,10,50,50)\n\
             object: car, confidence: 0.50, box: (20,20,60,60)\n\
             \n\
             Summary:\n\
             person: 1\n\
             car: 1\n"
        );
    }

    #[test]
    fn test_track_and_mask_presence_follow_indices() {
        // N=4, 跟踪ID在 {0, 2}, 掩码在 {1, 2, 3}
        let objects = (0..4)
            .map(|i| RawBox::new([i as f32, 0.0, i as f32 + 5.0, 5.0], 0.8, (i % 2) as f32))
            .collect();
        let mut plane = Array2::<f32>::zeros((4, 4));
        plane[[0, 0]] = 0.9;
        plane[[1, 1]] = 0.51;
        plane[[2, 2]] = 0.5; // 等于阈值, 不计入
        let masks = RawMasks::new(vec![
            RawMask::Plane(Array2::zeros((4, 4))),
            RawMask::Plane(plane),
            RawMask::Opaque,
        ]);
        let raw = RawResult::structured(objects)
            .with_masks(masks)
            .with_track_ids(vec![Some(3), None, Some(8), Some(-1)]);

        let result = normalize(&raw, &person_car()).unwrap();
        assert_eq!(result.len(), 4);

        let tracks: Vec<_> = result.iter().map(|d| d.track_id).collect();
        assert_eq!(tracks, vec![Some(3), None, Some(8), None]);

        let masks: Vec<_> = result.iter().map(|d| d.mask_present).collect();
        assert_eq!(masks, vec![true, true, true, false]);
        assert_eq!(result.detections()[0].mask_pixel_area, Some(0.0));
        assert_eq!(result.detections()[1].mask_pixel_area, Some(2.0));
        assert_eq!(result.detections()[2].mask_pixel_area, None);

        // 顺序保持
        let xs: Vec<_> = result.iter().map(|d| d.bbox.x1).collect();
        assert_eq!(xs, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_structured_falls_back_to_flat_table() {
        let broken = RawBox {
            xyxy: vec![1.0, 2.0, 3.0],
            conf: Some(0.4),
            cls: Some(1.0),
        };
        let raw = RawResult {
            boxes: RawBoxes::Structured {
                objects: vec![RawBox::new([0.0, 0.0, 4.0, 4.0], 0.7, 0.0), broken],
                table: Some(array![[0.0, 0.0, 4.0, 4.0, 0.7, 0.0], [1.0, 2.0, 3.0, 6.0, 0.4, 1.0]]),
            },
            masks: None,
            track_ids: Some(vec![None, Some(12)]),
        };
        let (result, strategy) = normalize_with_strategy(&raw, &person_car()).unwrap();
        assert_eq!(strategy, DecodeStrategy::Flat);
        assert_eq!(result.len(), 2);
        assert_eq!(result.detections()[1].bbox, BoundingBox::new(1, 2, 3, 6));
        assert_eq!(result.detections()[1].track_id, Some(12));
    }

    #[test]
    fn test_both_strategies_failing_is_a_decode_error() {
        let raw = RawResult {
            boxes: RawBoxes::Structured {
                objects: vec![RawBox {
                    xyxy: vec![0.0, 0.0, 1.0, 1.0],
                    conf: None,
                    cls: Some(0.0),
                }],
                table: Some(array![[0.0, 0.0, 1.0, 1.0]]),
            },
            masks: None,
            track_ids: None,
        };
        let err = normalize(&raw, &person_car()).unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));

        let no_table = RawResult::structured(vec![RawBox::default()]);
        assert!(matches!(
            normalize(&no_table, &person_car()),
            Err(PipelineError::Decode(_))
        ));
    }

    #[test]
    fn test_unknown_class_with_non_empty_names_is_rejected() {
        let raw = RawResult::flat(array![[0.0, 0.0, 1.0, 1.0, 0.5, 9.0]]);
        assert!(normalize(&raw, &person_car()).is_err());

        // 名称映射为空时使用数字名称
        let result = normalize(&raw, &ClassNames::new()).unwrap();
        assert_eq!(result.detections()[0].class_name, "9");
    }

    #[test]
    fn test_coordinates_truncate_and_reorder() {
        let raw = RawResult::flat(array![[50.9, 60.2, 10.7, 20.99, 1.0, 0.0]]);
        let result = normalize(&raw, &person_car()).unwrap();
        assert_eq!(result.detections()[0].bbox, BoundingBox::new(10, 20, 50, 60));
    }

    #[test]
    fn test_mask_stack_split() {
        let stack = Array3::<f32>::from_elem((2, 3, 3), 1.0);
        let masks = RawMasks::from_stack(stack);
        assert_eq!(masks.len(), 2);
        assert_eq!(mask_area(masks.get(1).unwrap()), Some(9.0));

        let mut nan_plane = Array2::<f32>::zeros((2, 2));
        nan_plane[[0, 1]] = f32::NAN;
        assert_eq!(mask_area(&RawMask::Plane(nan_plane)), None);
    }
}
