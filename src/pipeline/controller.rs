// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 流水线控制器 (Pipeline Controller)
//!
//! ```text
//! 采集循环 ──submit_frame──→ [输入单槽] ──→ 推理线程 ──→ [输出单槽] ──poll_result──→ 展示循环
//!                              newest-wins     infer/track      newest-wins
//!                                              → normalize
//!                                              → render
//! ```
//! - 两个槽位各自最多保存 1 项, 新值覆盖旧值
//! - 推理线程在输入槽上按 1 秒分片阻塞等待, 每片检查本轮的停止标志
//! - `stop()` 注入停止哨兵, 最多等待 2 秒, 然后清空两个槽位
//! - 输出项带运行代号 (generation), 被放弃的旧线程产出的结果不会被交付

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::mailbox::Mailbox;
use crate::backend::{Detector, InferenceBackend, ModelInfo};
use crate::detection::{normalize, DetectionResult};
use crate::error::PipelineError;
use crate::frame::Frame;
use crate::visualize::Annotator;

/// 推理线程在输入槽上单次等待的时长
pub const INGRESS_WAIT: Duration = Duration::from_secs(1);

/// `stop()` 等待推理线程退出的上限
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

pub const DEFAULT_TRACKER: &str = "bytetrack.yaml";
pub const DEFAULT_INFERENCE_SIZE: u32 = 640;

// ========== 配置 / 输出 / 统计 ==========

/// 流水线配置; 修改后从推理线程取到的下一帧开始生效
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub tracking_enabled: bool,
    pub tracker_profile: String,
    pub inference_size: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tracking_enabled: false,
            tracker_profile: DEFAULT_TRACKER.to_string(),
            inference_size: DEFAULT_INFERENCE_SIZE,
        }
    }
}

/// 一帧的处理结果: 原始帧 + 绘制后的帧 + 检测结果
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub source: Frame,
    pub rendered: Frame,
    pub result: DetectionResult,
}

/// 运行统计快照
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineStats {
    pub frames_submitted: u64,
    /// 尚未被处理就被新帧覆盖 (或被 stop 清掉) 的帧
    pub frames_dropped: u64,
    pub frames_processed: u64,
    pub frames_failed: u64,
    /// 尚未被取走就被新结果覆盖 (或被 stop 清掉) 的结果
    pub results_dropped: u64,
    pub last_inference_ms: f64,
    pub inference_fps: f64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    dropped: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    results_dropped: AtomicU64,
    last_inference_us: AtomicU64,
    fps_bits: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            frames_submitted: self.submitted.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
            frames_processed: self.processed.load(Ordering::Relaxed),
            frames_failed: self.failed.load(Ordering::Relaxed),
            results_dropped: self.results_dropped.load(Ordering::Relaxed),
            last_inference_ms: self.last_inference_us.load(Ordering::Relaxed) as f64 / 1000.0,
            inference_fps: f64::from_bits(self.fps_bits.load(Ordering::Relaxed)),
        }
    }
}

// ========== 内部状态 ==========

enum Ingress {
    Frame(Frame),
    /// 停止哨兵
    Stop,
}

struct Tagged {
    generation: u64,
    output: PipelineOutput,
}

struct Shared {
    ingress: Mailbox<Ingress>,
    egress: Mailbox<Tagged>,
    config: RwLock<PipelineConfig>,
    detector: Mutex<Detector>,
    annotator: RwLock<Annotator>,
    model_loaded: AtomicBool,
    generation: AtomicU64,
    counters: Counters,
}

struct Worker {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
    done: Receiver<()>,
    generation: u64,
}

impl Worker {
    fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }
}

// ========== 控制器 ==========

/// 实时流水线控制器
///
/// 所有方法都只需要 `&self`, 采集循环与展示循环可以通过 `Arc` 共享同一个控制器。
pub struct PipelineController {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl PipelineController {
    pub fn new(backend: Box<dyn InferenceBackend>) -> Self {
        Self::with_config(backend, PipelineConfig::default())
    }

    pub fn with_config(backend: Box<dyn InferenceBackend>, config: PipelineConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                ingress: Mailbox::new(),
                egress: Mailbox::new(),
                config: RwLock::new(config),
                detector: Mutex::new(Detector::new(backend)),
                annotator: RwLock::new(Annotator::new()),
                model_loaded: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                counters: Counters::default(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// 替换绘制器 (例如加载了标签字体之后)
    pub fn set_annotator(&self, annotator: Annotator) {
        *self.shared.annotator.write() = annotator;
    }

    // ---------- 模型与配置 ----------

    /// 加载模型; 失败时保持原状态不变
    pub fn load_model(&self, path: impl AsRef<Path>) -> Result<ModelInfo, PipelineError> {
        let info = self.shared.detector.lock().load_model(path.as_ref())?.clone();
        self.shared.model_loaded.store(true, Ordering::SeqCst);
        Ok(info)
    }

    pub fn is_model_loaded(&self) -> bool {
        self.shared.model_loaded.load(Ordering::SeqCst)
    }

    /// 开关多目标跟踪; `profile` 为 `None` 时保持当前跟踪器配置
    pub fn configure_tracking(&self, enabled: bool, profile: Option<&str>) {
        let mut config = self.shared.config.write();
        let profile = profile.unwrap_or(&config.tracker_profile).to_string();
        if config.tracking_enabled == enabled && config.tracker_profile == profile {
            debug!("跟踪配置未变化: enabled={enabled}, tracker={profile}");
            return;
        }
        if enabled {
            info!("🎯 跟踪器: {profile}");
        } else {
            info!("🎯 跟踪器: 禁用");
        }
        config.tracking_enabled = enabled;
        config.tracker_profile = profile;
    }

    /// 设置推理尺寸 (必须为正数)
    pub fn set_inference_size(&self, size: u32) -> Result<(), PipelineError> {
        if size == 0 {
            return Err(PipelineError::configuration(
                "inference size must be a positive integer",
            ));
        }
        self.shared.config.write().inference_size = size;
        info!("📐 推理尺寸: {size}");
        Ok(())
    }

    pub fn config(&self) -> PipelineConfig {
        self.shared.config.read().clone()
    }

    // ---------- 生命周期 ----------

    /// 启动推理线程; 已在运行时什么都不做
    pub fn start(&self) {
        let mut slot = self.worker.lock();
        if let Some(worker) = slot.as_ref() {
            if worker.is_alive() {
                debug!("推理线程已在运行 (run #{})", worker.generation);
                return;
            }
        }
        if let Some(finished) = slot.take() {
            let _ = finished.handle.join();
        }
        // 上一轮遗留的停止哨兵不能带进新一轮
        if self
            .shared
            .ingress
            .take_if(|item| matches!(item, Ingress::Stop))
            .is_some()
        {
            debug!("清除遗留的停止哨兵");
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);

        let shared = self.shared.clone();
        let flag = stop.clone();
        let spawned = thread::Builder::new()
            .name("inference-worker".into())
            .spawn(move || {
                run_worker(&shared, &flag, generation);
                let _ = done_tx.send(());
            });

        match spawned {
            Ok(handle) => {
                info!("🚀 推理线程已启动 (run #{generation})");
                *slot = Some(Worker {
                    handle,
                    stop,
                    done: done_rx,
                    generation,
                });
            }
            Err(e) => error!("❌ 推理线程启动失败: {e}"),
        }
    }

    /// 停止推理线程并清空两个槽位
    ///
    /// 线程在 [`SHUTDOWN_TIMEOUT`] 内未退出时记录错误并放弃等待, 本函数照常返回。
    pub fn stop(&self) {
        let mut slot = self.worker.lock();
        match slot.take() {
            Some(worker) => {
                info!("🛑 正在停止推理线程 (run #{})...", worker.generation);
                worker.stop.store(true, Ordering::SeqCst);
                if let Some(Ingress::Frame(frame)) = self.shared.ingress.replace(Ingress::Stop) {
                    self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!("丢弃未处理的帧 #{}", frame.index());
                }

                match worker.done.recv_timeout(SHUTDOWN_TIMEOUT) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        if worker.handle.join().is_err() {
                            error!("❌ 推理线程异常退出");
                        } else {
                            info!("✅ 推理线程已退出");
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        let err = PipelineError::ShutdownTimeout(SHUTDOWN_TIMEOUT);
                        error!("❌ {err}, 放弃等待该线程");
                    }
                }
                // 旧线程之后产出的结果一律作废
                self.shared.generation.fetch_add(1, Ordering::SeqCst);
            }
            None => debug!("推理线程未运行"),
        }
        self.clear_slots();
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().as_ref().is_some_and(Worker::is_alive)
    }

    fn clear_slots(&self) {
        let counters = &self.shared.counters;
        if let Some(Ingress::Frame(frame)) = self.shared.ingress.clear() {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("丢弃未处理的帧 #{}", frame.index());
        }
        if self.shared.egress.clear().is_some() {
            counters.results_dropped.fetch_add(1, Ordering::Relaxed);
            debug!("丢弃未取走的结果");
        }
    }

    // ---------- 数据通路 ----------

    /// 提交一帧 (非阻塞); 未加载模型时直接忽略
    pub fn submit_frame(&self, frame: Frame) {
        if !self.is_model_loaded() {
            debug!("模型未加载, 忽略帧 #{}", frame.index());
            return;
        }
        let counters = &self.shared.counters;
        counters.submitted.fetch_add(1, Ordering::Relaxed);
        // 正在停止时哨兵优先, 检查与写入在同一临界区内
        let offered = self
            .shared
            .ingress
            .offer(Ingress::Frame(frame), |cur| !matches!(cur, Some(Ingress::Stop)));
        match offered {
            Ok(Some(Ingress::Frame(old))) => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("输入槽已满, 丢弃旧帧 #{}", old.index());
            }
            Ok(_) => {}
            Err(rejected) => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                if let Ingress::Frame(frame) = rejected {
                    debug!("正在停止, 丢弃帧 #{}", frame.index());
                }
            }
        }
    }

    /// 取出最新的处理结果 (非阻塞)
    pub fn poll_result(&self) -> Option<PipelineOutput> {
        let tagged = self.shared.egress.take()?;
        if tagged.generation != self.shared.generation.load(Ordering::SeqCst) {
            debug!("丢弃过期结果 (run #{})", tagged.generation);
            return None;
        }
        Some(tagged.output)
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.counters.snapshot()
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        if self.worker.get_mut().is_some() {
            self.stop();
        }
    }
}

// ========== 推理线程 ==========

/// 每秒更新一次推理 FPS
struct FpsWindow {
    count: u64,
    last: Instant,
}

impl FpsWindow {
    fn new() -> Self {
        Self {
            count: 0,
            last: Instant::now(),
        }
    }

    fn tick(&mut self) -> Option<f64> {
        self.count += 1;
        let now = Instant::now();
        if now.duration_since(self.last).as_secs() >= 1 {
            let fps = self.count as f64 / now.duration_since(self.last).as_secs_f64();
            self.count = 0;
            self.last = now;
            return Some(fps);
        }
        None
    }
}

/// 写入输出槽; 所属的运行代号已经过期时拒绝写入并返回 `false`
///
/// 代号检查与写入在输出槽的同一临界区内, 被放弃的旧线程无法挤掉新一轮的结果。
fn publish(shared: &Shared, tagged: Tagged) -> bool {
    let generation = tagged.generation;
    let offered = shared
        .egress
        .offer(tagged, |_| shared.generation.load(Ordering::SeqCst) == generation);
    match offered {
        Ok(evicted) => {
            if evicted.is_some() {
                shared.counters.results_dropped.fetch_add(1, Ordering::Relaxed);
            }
            true
        }
        Err(_) => false,
    }
}

fn run_worker(shared: &Shared, stop: &AtomicBool, generation: u64) {
    debug!("🔍 推理线程进入主循环 (run #{generation})");
    let mut window = FpsWindow::new();

    while !stop.load(Ordering::SeqCst) {
        let frame = match shared.ingress.recv_timeout(INGRESS_WAIT) {
            Some(Ingress::Frame(frame)) => frame,
            Some(Ingress::Stop) => break,
            None => continue,
        };
        if stop.load(Ordering::SeqCst) {
            break;
        }

        let index = frame.index();
        let start = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| process_frame(shared, frame)))
            .unwrap_or_else(|payload| {
                Err(PipelineError::Backend(format!(
                    "panic: {}",
                    panic_message(payload.as_ref())
                )))
            });
        let elapsed = start.elapsed();

        let counters = &shared.counters;
        match outcome {
            Ok(output) => {
                counters.processed.fetch_add(1, Ordering::Relaxed);
                counters
                    .last_inference_us
                    .store(elapsed.as_micros() as u64, Ordering::Relaxed);

                let detections = output.result.len();
                if !publish(shared, Tagged { generation, output }) {
                    debug!("本轮已结束, 丢弃帧 #{index} 的结果");
                    continue;
                }

                if let Some(fps) = window.tick() {
                    counters.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
                    info!(
                        "🎯 推理: {}个目标 | {:.1}ms/帧 | {:.1}fps | 丢帧 {}",
                        detections,
                        elapsed.as_secs_f64() * 1000.0,
                        fps,
                        counters.dropped.load(Ordering::Relaxed)
                    );
                }
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                match e {
                    PipelineError::Decode(_) => warn!("⚠️ 帧 #{index} 解析失败, 已跳过: {e}"),
                    _ => error!("❌ 帧 #{index} 处理失败, 已跳过: {e}"),
                }
            }
        }
    }

    debug!("推理线程退出 (run #{generation})");
}

/// 推理 → 归一化 → 绘制
fn process_frame(shared: &Shared, frame: Frame) -> Result<PipelineOutput, PipelineError> {
    let config = shared.config.read().clone();

    let (raw, names) = {
        let mut detector = shared.detector.lock();
        let raw = if config.tracking_enabled {
            detector.track(
                &frame,
                config.inference_size,
                &config.tracker_profile,
                true,
            )?
        } else {
            detector.infer(&frame, config.inference_size)?
        };
        (raw, detector.names().cloned().unwrap_or_default())
    };

    let result = normalize(&raw, &names)?;
    let rendered = shared.annotator.read().render(&frame, &result);
    Ok(PipelineOutput {
        source: frame,
        rendered,
        result,
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::replay::Recording;
    use crate::backend::ReplayBackend;

    fn controller() -> PipelineController {
        let recording = Recording::from_json(
            r#"{"class_names": {"0": "person"}, "frames": [{"boxes": [[1, 1, 5, 5, 0.9, 0]]}]}"#,
        )
        .unwrap();
        PipelineController::new(Box::new(ReplayBackend::from_recording(recording)))
    }

    #[test]
    fn test_default_config() {
        let config = controller().config();
        assert!(!config.tracking_enabled);
        assert_eq!(config.tracker_profile, "bytetrack.yaml");
        assert_eq!(config.inference_size, 640);
    }

    #[test]
    fn test_configure_tracking_keeps_profile() {
        let ctrl = controller();
        ctrl.configure_tracking(true, Some("botsort.yaml"));
        ctrl.configure_tracking(false, None);
        let config = ctrl.config();
        assert!(!config.tracking_enabled);
        assert_eq!(config.tracker_profile, "botsort.yaml");

        ctrl.configure_tracking(true, None);
        ctrl.configure_tracking(true, None);
        assert!(ctrl.config().tracking_enabled);
    }

    #[test]
    fn test_inference_size_must_be_positive() {
        let ctrl = controller();
        assert!(matches!(
            ctrl.set_inference_size(0),
            Err(PipelineError::Configuration(_))
        ));
        assert_eq!(ctrl.config().inference_size, 640);
        ctrl.set_inference_size(320).unwrap();
        assert_eq!(ctrl.config().inference_size, 320);
    }

    #[test]
    fn test_pth_model_rejected() {
        let ctrl = controller();
        let err = ctrl.load_model("weights.pth").unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
        assert!(!ctrl.is_model_loaded());
    }

    #[test]
    fn test_submit_before_load_is_ignored() {
        let ctrl = controller();
        ctrl.submit_frame(Frame::new(vec![0; 3], 1, 1, 3).unwrap());
        assert!(ctrl.shared.ingress.is_empty());
        assert_eq!(ctrl.stats().frames_submitted, 0);
    }

    #[test]
    fn test_start_stop_lifecycle() {
        let ctrl = controller();
        assert!(!ctrl.is_running());
        ctrl.stop();
        ctrl.start();
        ctrl.start();
        assert!(ctrl.is_running());
        let generation = ctrl.worker.lock().as_ref().map(|w| w.generation);
        assert_eq!(generation, Some(1));
        ctrl.stop();
        assert!(!ctrl.is_running());
        assert!(ctrl.shared.ingress.is_empty());
        assert!(ctrl.shared.egress.is_empty());
    }

    fn output(index: u64) -> PipelineOutput {
        let frame = Frame::new(vec![0; 3], 1, 1, 3).unwrap().with_index(index);
        PipelineOutput {
            source: frame.clone(),
            rendered: frame,
            result: DetectionResult::empty(Default::default()),
        }
    }

    #[test]
    fn test_submit_keeps_pending_stop_sentinel() {
        let ctrl = controller();
        ctrl.shared.model_loaded.store(true, Ordering::SeqCst);
        ctrl.shared.ingress.replace(Ingress::Stop);

        ctrl.submit_frame(Frame::new(vec![0; 3], 1, 1, 3).unwrap());
        assert!(matches!(ctrl.shared.ingress.take(), Some(Ingress::Stop)));
        let stats = ctrl.stats();
        assert_eq!(stats.frames_submitted, 1);
        assert_eq!(stats.frames_dropped, 1);
    }

    #[test]
    fn test_start_discards_leftover_stop_sentinel() {
        let ctrl = controller();
        ctrl.shared.ingress.replace(Ingress::Stop);
        ctrl.start();
        thread::sleep(Duration::from_millis(50));
        assert!(ctrl.is_running());
        ctrl.stop();
    }

    #[test]
    fn test_stale_result_cannot_evict_current_one() {
        let ctrl = controller();
        ctrl.start();
        let current = ctrl.shared.generation.load(Ordering::SeqCst);

        assert!(publish(&ctrl.shared, Tagged { generation: current, output: output(2) }));
        assert!(!publish(&ctrl.shared, Tagged { generation: current - 1, output: output(1) }));
        assert_eq!(ctrl.stats().results_dropped, 0);
        assert_eq!(ctrl.poll_result().map(|o| o.source.index()), Some(2));
        ctrl.stop();
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
