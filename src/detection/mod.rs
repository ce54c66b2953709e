// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 检测结果 (Detection Results)
///
/// - types:     统一的 Detection / DetectionResult 数据结构
/// - normalize: 推理原始输出 → DetectionResult (检测 / 分割 / 跟踪)
pub mod normalize;
pub mod types;

pub use normalize::{
    normalize, normalize_with_strategy, DecodeStrategy, RawBox, RawBoxes, RawMask, RawMasks,
    RawResult, FLAT_COLUMNS, MASK_THRESHOLD,
};
pub use types::{BoundingBox, ClassNames, Detection, DetectionResult};
