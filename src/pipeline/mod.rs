// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 实时处理流水线 (Real-time Pipeline)
///
/// 双线程架构, 通过两个单槽信箱通信:
/// - 采集/展示: 调用方线程 (submit_frame / poll_result)
/// - 推理: 独立线程 (infer / track → normalize → render)
pub mod controller;
pub mod mailbox;

pub use controller::{
    PipelineConfig, PipelineController, PipelineOutput, PipelineStats, DEFAULT_INFERENCE_SIZE,
    DEFAULT_TRACKER, INGRESS_WAIT, SHUTDOWN_TIMEOUT,
};
pub use mailbox::Mailbox;
