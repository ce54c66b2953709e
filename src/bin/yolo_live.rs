// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 实时检测命令行 - 图片 / 视频文件 / 摄像头
///
/// 主程序入口 - 直接运行: cargo run --bin yolo-live --release -- --model det.json --source video --input clip.mp4
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use yolo_live::sink::{ImageSequenceSink, Recorder};
use yolo_live::{
    format_info_text, gen_time_string, Annotator, FrameSource, PipelineController,
    PipelineOutput, ReplayBackend, SourceEvent, SourceKind,
};

/// 等待最后一帧结果的上限
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SourceArg {
    Image,
    Video,
    Camera,
}

/// 实时检测程序
#[derive(Parser, Debug)]
#[command(author, version, about = "YOLO 实时检测 / 分割 / 跟踪", long_about = None)]
struct Args {
    /// 模型文件 (回放后端: JSON 录制)
    #[arg(short, long)]
    model: PathBuf,

    /// 帧源类型
    #[arg(short, long, value_enum, default_value_t = SourceArg::Camera)]
    source: SourceArg,

    /// 图片或视频路径
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// 摄像头设备索引
    #[arg(long, default_value_t = 0)]
    camera_id: usize,

    /// 启用多目标跟踪
    #[arg(long)]
    track: bool,

    /// 跟踪器配置
    #[arg(long, default_value = "bytetrack.yaml")]
    tracker: String,

    /// 推理尺寸
    #[arg(long, default_value_t = 640)]
    imgsz: u32,

    /// 保存绘制后的帧 (输出到 <save-dir>/<时间>/)
    #[arg(long)]
    save: bool,

    #[arg(long, default_value = "runs")]
    save_dir: PathBuf,

    /// 输出帧率 (保存时使用)
    #[arg(long, default_value_t = 25.0)]
    fps: f64,

    /// 标签字体 (TTF/OTF); 不提供时只画框
    #[arg(long)]
    font: Option<PathBuf>,

    /// 以 JSON 行输出检测结果
    #[arg(long)]
    json: bool,
}

impl Args {
    fn source_kind(&self) -> Result<SourceKind> {
        Ok(match self.source {
            SourceArg::Camera => SourceKind::Camera(self.camera_id),
            SourceArg::Image => SourceKind::Image(
                self.input.clone().context("--input is required for image sources")?,
            ),
            SourceArg::Video => SourceKind::Video(
                self.input.clone().context("--input is required for video sources")?,
            ),
        })
    }
}

struct Presenter {
    json: bool,
    recorder: Option<Recorder<ImageSequenceSink>>,
    shown: u64,
}

impl Presenter {
    fn show(&mut self, output: &PipelineOutput) -> Result<()> {
        self.shown += 1;
        if self.json {
            let line = serde_json::json!({
                "frame": output.source.index(),
                "detections": output.result.detections(),
            });
            println!("{line}");
        } else {
            println!("--- frame #{} ---", output.source.index());
            print!("{}", format_info_text(&output.result));
        }
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.record(&output.rendered)?;
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let kind = args.source_kind()?;

    // 1. 流水线
    let controller = PipelineController::new(Box::new(ReplayBackend::new()));
    controller.set_inference_size(args.imgsz)?;
    controller.configure_tracking(args.track, Some(args.tracker.as_str()));
    if let Some(font) = &args.font {
        controller.set_annotator(Annotator::new().with_font_file(font)?);
    }

    let model = controller.load_model(&args.model)?;
    info!(
        "📦 模型: {} | task={} | device={} | {} 个类别",
        args.model.display(),
        model.task,
        model.device,
        model.class_names.len()
    );

    // 2. 输出
    let recorder = if args.save {
        let dir = args.save_dir.join(gen_time_string("-"));
        let target = dir.join("result.mp4");
        Some(Recorder::new(ImageSequenceSink::new(&dir), &target, args.fps))
    } else {
        None
    };
    let mut presenter = Presenter {
        json: args.json,
        recorder,
        shown: 0,
    };

    // 3. 帧源
    let mut source = FrameSource::new(kind);
    source.open()?;
    controller.start();

    let started = Instant::now();
    let mut submitted = 0u64;
    for event in source.frames() {
        match event {
            SourceEvent::Frame(frame) => {
                controller.submit_frame(frame);
                submitted += 1;
            }
            SourceEvent::EndOfStream => break,
        }
        if let Some(output) = controller.poll_result() {
            presenter.show(&output)?;
        }
    }
    source.release();

    // 4. 等待最后一帧
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while submitted > 0 && Instant::now() < deadline {
        if let Some(output) = controller.poll_result() {
            presenter.show(&output)?;
        }
        let stats = controller.stats();
        if stats.frames_processed + stats.frames_failed + stats.frames_dropped >= submitted {
            if let Some(output) = controller.poll_result() {
                presenter.show(&output)?;
            }
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    controller.stop();

    if let Some(recorder) = presenter.recorder.as_mut() {
        recorder.finish()?;
    }

    let stats = controller.stats();
    info!(
        "📊 统计: 提交{} | 处理{} | 失败{} | 丢帧{} | 展示{} | 耗时{:.1}s",
        stats.frames_submitted,
        stats.frames_processed,
        stats.frames_failed,
        stats.frames_dropped,
        presenter.shown,
        started.elapsed().as_secs_f64()
    );
    if submitted == 0 {
        warn!("⚠️ 帧源没有产出任何帧");
        bail!("no frames read from the source");
    }
    Ok(())
}
