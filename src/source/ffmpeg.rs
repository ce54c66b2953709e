// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! FFmpeg 采集设备 - 视频文件 / 本地摄像头
//!
//! 解码在独立线程中运行, 通过有界通道把 RGB 帧交给 [`FfmpegCapture::read`]。
//! 摄像头支持 DirectShow(Windows) / AVFoundation(macOS) / V4L2(Linux)。

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Frame as AvFrame, Input};
use tracing::{debug, error, info, warn};

use super::{Capture, SourceKind};
use crate::error::SourceError;
use crate::frame::Frame;

/// 解码线程与消费者之间的缓冲帧数
const FRAME_QUEUE: usize = 2;

/// 摄像头打开重试次数与间隔
pub const CAMERA_RETRIES: u32 = 3;
pub const CAMERA_RETRY_DELAY: Duration = Duration::from_secs(1);

/// 超过该分辨率的帧视为异常
const MAX_DIMENSION: u32 = 8192;

// ========== 输入描述 ==========

#[derive(Debug, Clone)]
struct InputSpec {
    url: String,
    format: Option<&'static str>,
    /// 摄像头: 消费者跟不上时丢帧; 视频文件: 阻塞等待, 不丢帧
    live: bool,
    attempts: u32,
}

impl InputSpec {
    fn for_kind(kind: &SourceKind) -> Result<Self, SourceError> {
        match kind {
            SourceKind::Video(path) => Ok(Self {
                url: path.to_string_lossy().into_owned(),
                format: None,
                live: false,
                attempts: 1,
            }),
            SourceKind::Camera(index) => {
                let url = camera_url(*index).map_err(|reason| SourceError::Camera {
                    index: *index,
                    attempts: 0,
                    reason,
                })?;
                Ok(Self {
                    url,
                    format: Some(camera_format()),
                    live: true,
                    attempts: CAMERA_RETRIES,
                })
            }
            SourceKind::Image(path) => Err(SourceError::Open {
                path: path.clone(),
                reason: "still images are read directly, not through ffmpeg".into(),
            }),
        }
    }
}

fn open_error(kind: &SourceKind, attempts: u32, reason: String) -> SourceError {
    match kind {
        SourceKind::Camera(index) => SourceError::Camera {
            index: *index,
            attempts,
            reason,
        },
        SourceKind::Video(path) | SourceKind::Image(path) => SourceError::Open {
            path: path.clone(),
            reason,
        },
    }
}

/// 摄像头输入格式 - 根据平台选择
fn camera_format() -> &'static str {
    if cfg!(target_os = "windows") {
        "dshow"
    } else if cfg!(target_os = "macos") {
        "avfoundation"
    } else if cfg!(target_os = "linux") {
        "v4l2"
    } else {
        "video4linux2"
    }
}

/// 摄像头URL; dshow 需要设备名称
#[cfg(target_os = "windows")]
fn camera_url(index: usize) -> Result<String, String> {
    let devices = ez_ffmpeg::device::get_input_video_devices().map_err(|e| e.to_string())?;
    devices
        .get(index)
        .map(|name| format!("video={name}"))
        .ok_or_else(|| format!("no video device at index {index} ({} found)", devices.len()))
}

#[cfg(target_os = "macos")]
fn camera_url(index: usize) -> Result<String, String> {
    Ok(index.to_string())
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn camera_url(index: usize) -> Result<String, String> {
    Ok(format!("/dev/video{index}"))
}

/// 获取可用的摄像头设备列表
pub fn camera_devices() -> Vec<(usize, String)> {
    match ez_ffmpeg::device::get_input_video_devices() {
        Ok(devices) => devices.into_iter().enumerate().collect(),
        Err(e) => {
            warn!("⚠️ 获取摄像头列表失败: {e}");
            Vec::new()
        }
    }
}

// ========== 采集设备 ==========

#[derive(Debug)]
pub struct FfmpegCapture {
    frames: Option<Receiver<Frame>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FfmpegCapture {
    /// 打开视频文件或摄像头; 解码线程确认启动成功后才返回
    pub fn open(kind: &SourceKind) -> Result<Self, SourceError> {
        let spec = InputSpec::for_kind(kind)?;
        info!("🔗 输入: {} (format: {:?})", spec.url, spec.format);

        let (frame_tx, frame_rx) = bounded(FRAME_QUEUE);
        let (ready_tx, ready_rx) = bounded::<Result<(), (u32, String)>>(1);
        let stop = Arc::new(AtomicBool::new(false));

        let filter = DecodeFilter::new(frame_tx, stop.clone(), spec.live);
        let handle = thread::Builder::new()
            .name("ffmpeg-capture".into())
            .spawn(move || run_decoder(spec, filter, ready_tx))
            .map_err(|e| open_error(kind, 0, e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                frames: Some(frame_rx),
                stop,
                handle: Some(handle),
            }),
            Ok(Err((attempts, reason))) => {
                let _ = handle.join();
                Err(open_error(kind, attempts, reason))
            }
            Err(_) => {
                let _ = handle.join();
                Err(open_error(kind, 0, "decoder thread exited unexpectedly".into()))
            }
        }
    }

    /// 打开视频文件
    pub fn open_video(path: &Path) -> Result<Self, SourceError> {
        Self::open(&SourceKind::Video(path.to_path_buf()))
    }
}

impl Capture for FfmpegCapture {
    fn read(&mut self) -> Option<Frame> {
        self.frames.as_ref()?.recv().ok()
    }

    fn release(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // 先断开通道, 阻塞在发送上的解码线程会立即返回
        self.frames = None;
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("❌ 解码线程异常退出");
            }
        }
    }
}

impl Drop for FfmpegCapture {
    fn drop(&mut self) {
        self.release();
    }
}

/// 解码线程: 构建 FFmpeg 上下文 (摄像头失败时重试), 运行到流结束
fn run_decoder(spec: InputSpec, filter: DecodeFilter, ready: Sender<Result<(), (u32, String)>>) {
    let mut attempt = 0;
    let scheduler = loop {
        attempt += 1;

        let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
        let pipe = pipe.filter("decode", Box::new(filter.clone()));
        let out = create_null_output().add_frame_pipeline(pipe);

        let mut input = Input::new(spec.url.as_str());
        if let Some(format) = spec.format {
            input = input.set_format(format);
        }

        let started = FfmpegContext::builder()
            .input(input)
            .filter_descs(["format=yuv420p"].into())
            .output(out)
            .build()
            .map_err(|e| format!("build failed: {e}"))
            .and_then(|ctx| ctx.start().map_err(|e| format!("start failed: {e}")));

        match started {
            Ok(scheduler) => break scheduler,
            Err(reason) if attempt < spec.attempts => {
                warn!(
                    "⚠️ 设备忙或无法打开 ({reason}), {}秒后重试... ({}/{})",
                    CAMERA_RETRY_DELAY.as_secs(),
                    attempt,
                    spec.attempts
                );
                thread::sleep(CAMERA_RETRY_DELAY);
            }
            Err(reason) => {
                error!("❌ 输入打开失败 (尝试{}次): {reason}", attempt);
                let _ = ready.send(Err((attempt, reason)));
                return;
            }
        }
    };

    info!("✅ 输入连接成功, 开始解码!");
    let _ = ready.send(Ok(()));
    let _ = scheduler.wait();
    info!("📹 解码循环结束");
}

// ========== 解码过滤器 ==========

/// FFmpeg解码过滤器: YUV420P → RGB 帧
#[derive(Clone)]
struct DecodeFilter {
    tx: Sender<Frame>,
    stop: Arc<AtomicBool>,
    live: bool,
    count: usize,
    total_frames: usize,
    dropped_frames: usize,
    last: Instant,
}

impl DecodeFilter {
    fn new(tx: Sender<Frame>, stop: Arc<AtomicBool>, live: bool) -> Self {
        Self {
            tx,
            stop,
            live,
            count: 0,
            total_frames: 0,
            dropped_frames: 0,
            last: Instant::now(),
        }
    }

    fn drop_frame(&mut self, reason: &str) {
        self.dropped_frames += 1;
        if self.total_frames <= 10 {
            warn!("⚠️ 丢弃帧 #{}: {reason}", self.total_frames);
        }
    }

    /// 把解码帧转换为 RGB; 帧不可用时返回 `None`
    fn convert(&mut self, frame: &AvFrame) -> Option<Frame> {
        // SAFETY: 指针非空时指向的 AVFrame 在 filter_frame 调用期间有效
        let av = unsafe {
            if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
                None
            } else {
                Some(&*frame.as_ptr())
            }
        };
        let Some(av) = av else {
            self.drop_frame("空帧/损坏帧");
            return None;
        };
        let (w, h) = (av.width.max(0) as u32, av.height.max(0) as u32);
        if w == 0 || h == 0 || w > MAX_DIMENSION || h > MAX_DIMENSION {
            self.drop_frame(&format!("非法分辨率 {w}x{h}"));
            return None;
        }
        // 只丢弃严重错误的帧 (缺少参考帧、无效比特流)
        if av.decode_error_flags & 0x03 != 0 {
            self.drop_frame(&format!("解码错误标志=0x{:02x}", av.decode_error_flags));
            return None;
        }

        let (y_plane, u_plane, v_plane) = (av.data[0], av.data[1], av.data[2]);
        if y_plane.is_null() || u_plane.is_null() || v_plane.is_null() {
            self.drop_frame("YUV指针为空");
            return None;
        }
        let y_stride = av.linesize[0].max(0) as usize;
        let uv_stride = av.linesize[1].max(0) as usize;
        if y_stride < w as usize || uv_stride < (w as usize).div_ceil(2) {
            self.drop_frame(&format!("步长异常 y_stride={y_stride} uv_stride={uv_stride}"));
            return None;
        }

        let uv_rows = (h as usize).div_ceil(2);
        // SAFETY: format=yuv420p 保证三个平面的大小分别为 stride × 行数
        let (y, u, v) = unsafe {
            (
                std::slice::from_raw_parts(y_plane, y_stride * h as usize),
                std::slice::from_raw_parts(u_plane, uv_stride * uv_rows),
                std::slice::from_raw_parts(v_plane, uv_stride * uv_rows),
            )
        };
        let rgb = yuv420p_to_rgb(y, u, v, y_stride, uv_stride, w as usize, h as usize);
        Frame::new(rgb, w, h, 3)
    }

    fn report_fps(&mut self) {
        self.count += 1;
        let elapsed = self.last.elapsed().as_secs_f64();
        if elapsed >= 1.0 {
            let fps = self.count as f64 / elapsed;
            let drop_rate = self.dropped_frames as f64 / self.total_frames.max(1) as f64 * 100.0;
            debug!(
                "📺 解码统计: 解码{}帧 | 实际{:.1}fps | 总帧{} | 丢弃{} ({:.1}%)",
                self.count, fps, self.total_frames, self.dropped_frames, drop_rate
            );
            self.last = Instant::now();
            self.count = 0;
        }
    }
}

impl FrameFilter for DecodeFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> Result<(), String> {
        debug!("✅ 解码线程启动");
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: AvFrame,
        _ctx: &FrameFilterContext,
    ) -> Result<Option<AvFrame>, String> {
        if self.stop.load(Ordering::Relaxed) {
            info!("🛑 采集已释放, 停止解码");
            return Err("capture released".to_string());
        }

        self.total_frames += 1;
        let Some(rgb) = self.convert(&frame) else {
            return Ok(None);
        };
        self.report_fps();

        if self.live {
            match self.tx.try_send(rgb) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => self.dropped_frames += 1,
                Err(TrySendError::Disconnected(_)) => return Err("consumer gone".to_string()),
            }
        } else if self.tx.send(rgb).is_err() {
            return Err("consumer gone".to_string());
        }

        Ok(Some(frame))
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        debug!("✅ 解码线程退出");
    }
}

/// YUV420P → RGB (BT.601, 系数乘以128以避免浮点)
pub fn yuv420p_to_rgb(
    y_plane: &[u8],
    u_plane: &[u8],
    v_plane: &[u8],
    y_stride: usize,
    uv_stride: usize,
    width: usize,
    height: usize,
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(width * height * 3);
    for y in 0..height {
        let y_row = y * y_stride;
        let uv_row = (y >> 1) * uv_stride;

        for x in 0..width {
            let y_val = y_plane[y_row + x] as i32;
            let u_val = u_plane[uv_row + (x >> 1)] as i32 - 128;
            let v_val = v_plane[uv_row + (x >> 1)] as i32 - 128;

            buffer.push((y_val + ((v_val * 179) >> 7)).clamp(0, 255) as u8);
            buffer.push((y_val - ((u_val * 44) >> 7) - ((v_val * 91) >> 7)).clamp(0, 255) as u8);
            buffer.push((y_val + ((u_val * 227) >> 7)).clamp(0, 255) as u8);
        }
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuv_gray_maps_to_gray() {
        // 4x2, 中性色度
        let y = [16, 64, 128, 235, 16, 64, 128, 235];
        let uv = [128, 128];
        let rgb = yuv420p_to_rgb(&y, &uv, &uv, 4, 2, 4, 2);
        assert_eq!(rgb.len(), 4 * 2 * 3);
        for (px, &luma) in rgb.chunks_exact(3).zip(y.iter()) {
            assert_eq!(px, &[luma, luma, luma]);
        }
    }

    #[test]
    fn test_yuv_respects_stride() {
        // 2x2 图像, Y 步长 4 (每行 2 字节填充)
        let y = [200, 200, 0, 0, 200, 200, 0, 0];
        let u = [128, 0];
        let v = [255, 0];
        let rgb = yuv420p_to_rgb(&y, &u, &v, 4, 2, 2, 2);
        assert_eq!(rgb.len(), 12);
        for px in rgb.chunks_exact(3) {
            assert_eq!(px[0], 255); // V 偏红, 饱和
            assert!(px[1] < 200);
            assert_eq!(px[2], 200);
        }
    }

    #[test]
    fn test_image_kind_is_not_an_ffmpeg_input() {
        let err = InputSpec::for_kind(&SourceKind::Image("a.png".into())).unwrap_err();
        assert!(matches!(err, SourceError::Open { .. }));
    }

    #[test]
    fn test_camera_spec_retries() {
        let spec = InputSpec::for_kind(&SourceKind::Camera(0));
        if let Ok(spec) = spec {
            assert!(spec.live);
            assert_eq!(spec.attempts, CAMERA_RETRIES);
            assert_eq!(spec.format, Some(camera_format()));
        }
    }

    #[test]
    fn test_missing_video_fails_to_open() {
        let err = FfmpegCapture::open_video(Path::new("/definitely/missing/clip.mp4")).unwrap_err();
        assert!(matches!(err, SourceError::Open { .. }));
    }
}
