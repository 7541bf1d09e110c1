mod config;
mod detector;
mod display;
mod overlay;
mod pose;
mod stream;

use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, error, info};

use crate::config::{CameraIntrinsics, StreamConfig};
use crate::detector::TagDetector;
use crate::display::{DisplaySink, VideoWindow};
use crate::overlay::OverlayRenderer;
use crate::pose::TagObservation;
use crate::stream::{FrameReader, ReadOutcome, VideoSource};

#[derive(Parser, Debug)]
#[command(version, about = "AprilTag pose viewer for an RTP/H.264 UDP camera stream")]
struct Args {
    /// Path to a JSON settings file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Frame width in pixels
    #[arg(long)]
    width: Option<u32>,

    /// Frame height in pixels
    #[arg(long)]
    height: Option<u32>,

    /// Horizontal field of view in radians
    #[arg(long)]
    fov: Option<f64>,

    /// UDP port the decode pipeline listens on
    #[arg(long)]
    port: Option<u16>,

    /// Physical tag edge length in meters
    #[arg(long)]
    tag_size: Option<f64>,

    /// Detector worker threads
    #[arg(long)]
    threads: Option<i32>,

    /// TrueType font used for overlay text
    #[arg(long)]
    font: Option<PathBuf>,
}

fn main() {
    let _ = tracing_subscriber::fmt::try_init();
    if let Err(e) = run() {
        error!("fatal: {e:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = resolve_config(&args)?;
    let intrinsics =
        CameraIntrinsics::from_fov(config.width, config.height, config.horizontal_fov)?;
    info!(
        "camera parameters: fx={:.2} fy={:.2} cx={:.2} cy={:.2}",
        intrinsics.fx, intrinsics.fy, intrinsics.cx, intrinsics.cy
    );

    let mut detector = TagDetector::new(config.detector_threads)?;
    let renderer = OverlayRenderer::new(config.font_path.as_deref());

    let mut source = VideoSource::spawn(&config)?;

    // the handler also kills the pipeline: its stdout closes and a read
    // blocked mid-frame returns instead of retrying through the signal
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        let pipeline = source.handle();
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::Relaxed);
            pipeline.terminate();
        })
        .context("installing interrupt handler")?;
    }

    info!(
        "decode pipeline listening on udp port {} ({} bytes per frame)",
        config.port,
        config.frame_len()
    );

    let mut window = VideoWindow::open("AprilTag Detection", config.width, config.height)?;

    let outcome = run_loop(
        source.reader_mut(),
        &mut detector,
        &renderer,
        &mut window,
        &intrinsics,
        config.tag_size_m,
        &stop,
    );

    // same teardown on every exit path, before the error propagates
    source.shutdown();

    match outcome? {
        LoopExit::StreamEnded => info!("stream ended"),
        LoopExit::QuitRequested => info!("quit requested"),
        LoopExit::Interrupted => info!("interrupted"),
    }
    info!("session finished");
    Ok(())
}

fn resolve_config(args: &Args) -> anyhow::Result<StreamConfig> {
    let mut config = match &args.config {
        Some(path) => StreamConfig::load(path)?,
        None => StreamConfig::default(),
    };
    if let Some(v) = args.width {
        config.width = v;
    }
    if let Some(v) = args.height {
        config.height = v;
    }
    if let Some(v) = args.fov {
        config.horizontal_fov = v;
    }
    if let Some(v) = args.port {
        config.port = v;
    }
    if let Some(v) = args.tag_size {
        config.tag_size_m = v;
    }
    if let Some(v) = args.threads {
        config.detector_threads = v;
    }
    if let Some(v) = &args.font {
        config.font_path = Some(v.clone());
    }
    config.validate()?;
    Ok(config)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    StreamEnded,
    QuitRequested,
    Interrupted,
}

/// The read-detect-render-present loop. Runs until the stream ends, the
/// user asks to quit, the interrupt flag is raised or an error propagates;
/// the caller owns teardown in all cases.
#[allow(clippy::too_many_arguments)]
fn run_loop<R: Read, S: DisplaySink>(
    reader: &mut FrameReader<R>,
    detector: &mut TagDetector,
    renderer: &OverlayRenderer,
    sink: &mut S,
    intrinsics: &CameraIntrinsics,
    tag_size: f64,
    stop: &AtomicBool,
) -> anyhow::Result<LoopExit> {
    let mut frame_count: u64 = 0;

    loop {
        if stop.load(Ordering::Relaxed) {
            return Ok(LoopExit::Interrupted);
        }

        let frame = match reader.read_frame().context("reading frame from stream")? {
            ReadOutcome::Frame(frame) => frame,
            // an interrupt tears the pipeline down and surfaces here as EOF
            ReadOutcome::Ended if stop.load(Ordering::Relaxed) => {
                return Ok(LoopExit::Interrupted)
            }
            ReadOutcome::Ended => return Ok(LoopExit::StreamEnded),
        };
        frame_count += 1;
        debug!(
            "frame {} ({}x{}, {} bytes)",
            frame_count,
            frame.width(),
            frame.height(),
            frame.as_bytes().len()
        );

        let gray = frame.to_luma();
        let mut img = frame.to_rgb();

        let raw = detector.detect(&gray).context("tag detection failed")?;
        let tags: Vec<TagObservation> = raw
            .iter()
            .filter_map(|d| TagObservation::interpret(d, tag_size, intrinsics))
            .collect();

        for tag in &tags {
            let t = &tag.pose.translation;
            info!(
                "tag {} center=({:.2}, {:.2}) t=({:.3}, {:.3}, {:.3})m rpy=({:.1}, {:.1}, {:.1})deg",
                tag.id,
                tag.center[0],
                tag.center[1],
                t.x,
                t.y,
                t.z,
                tag.euler.roll_deg,
                tag.euler.pitch_deg,
                tag.euler.yaw_deg
            );
        }

        renderer.render(&mut img, frame_count, &tags);
        sink.present(&img)?;

        if sink.quit_requested() {
            return Ok(LoopExit::QuitRequested);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::io::Cursor;

    struct MockSink {
        presented: usize,
        quit_after: Option<usize>,
    }

    impl MockSink {
        fn new(quit_after: Option<usize>) -> Self {
            Self {
                presented: 0,
                quit_after,
            }
        }
    }

    impl DisplaySink for MockSink {
        fn present(&mut self, _img: &RgbImage) -> anyhow::Result<()> {
            self.presented += 1;
            Ok(())
        }

        fn quit_requested(&self) -> bool {
            self.quit_after.is_some_and(|n| self.presented >= n)
        }
    }

    const W: u32 = 32;
    const H: u32 = 24;

    fn stream_of(frames: usize, trailing_bytes: usize) -> Cursor<Vec<u8>> {
        let frame_len = W as usize * H as usize * 3;
        let mut bytes = vec![0u8; frames * frame_len];
        bytes.extend(vec![0u8; trailing_bytes]);
        Cursor::new(bytes)
    }

    fn fixture() -> (TagDetector, OverlayRenderer, CameraIntrinsics) {
        let detector = TagDetector::new(1).expect("detector");
        let renderer = OverlayRenderer::new(None);
        let intrinsics = CameraIntrinsics::from_fov(W, H, 1.0).unwrap();
        (detector, renderer, intrinsics)
    }

    #[test]
    fn truncated_stream_ends_after_full_frames() {
        let frame_len = W as usize * H as usize * 3;
        let mut reader = FrameReader::new(stream_of(3, frame_len / 2), W, H);
        let (mut detector, renderer, intrinsics) = fixture();
        let mut sink = MockSink::new(None);
        let stop = AtomicBool::new(false);

        let exit = run_loop(
            &mut reader,
            &mut detector,
            &renderer,
            &mut sink,
            &intrinsics,
            0.165,
            &stop,
        )
        .expect("loop");

        assert_eq!(exit, LoopExit::StreamEnded);
        assert_eq!(sink.presented, 3);
    }

    #[test]
    fn quit_request_stops_the_loop() {
        let mut reader = FrameReader::new(stream_of(5, 0), W, H);
        let (mut detector, renderer, intrinsics) = fixture();
        let mut sink = MockSink::new(Some(1));
        let stop = AtomicBool::new(false);

        let exit = run_loop(
            &mut reader,
            &mut detector,
            &renderer,
            &mut sink,
            &intrinsics,
            0.165,
            &stop,
        )
        .expect("loop");

        assert_eq!(exit, LoopExit::QuitRequested);
        assert_eq!(sink.presented, 1);
    }

    /// Byte source standing in for a pipeline killed by the interrupt
    /// handler while the reader was blocked: the flag goes up, then the
    /// pipe closes.
    struct InterruptedStream {
        stop: Arc<std::sync::atomic::AtomicBool>,
    }

    impl std::io::Read for InterruptedStream {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            self.stop.store(true, Ordering::Relaxed);
            Ok(0)
        }
    }

    #[test]
    fn interrupt_during_blocked_read_exits_as_interrupted() {
        let stop = Arc::new(AtomicBool::new(false));
        let source = InterruptedStream {
            stop: Arc::clone(&stop),
        };
        let mut reader = FrameReader::new(source, W, H);
        let (mut detector, renderer, intrinsics) = fixture();
        let mut sink = MockSink::new(None);

        let exit = run_loop(
            &mut reader,
            &mut detector,
            &renderer,
            &mut sink,
            &intrinsics,
            0.165,
            &stop,
        )
        .expect("loop");

        assert_eq!(exit, LoopExit::Interrupted);
        assert_eq!(sink.presented, 0);
    }

    #[test]
    fn interrupt_flag_stops_before_reading() {
        let mut reader = FrameReader::new(stream_of(5, 0), W, H);
        let (mut detector, renderer, intrinsics) = fixture();
        let mut sink = MockSink::new(None);
        let stop = AtomicBool::new(true);

        let exit = run_loop(
            &mut reader,
            &mut detector,
            &renderer,
            &mut sink,
            &intrinsics,
            0.165,
            &stop,
        )
        .expect("loop");

        assert_eq!(exit, LoopExit::Interrupted);
        assert_eq!(sink.presented, 0);
    }
}
