use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};

use image::{GrayImage, RgbImage};

use crate::config::StreamConfig;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("failed to start gst-launch-1.0 (is GStreamer installed?): {0}")]
    Unavailable(#[from] std::io::Error),
    #[error("gst-launch-1.0 produced no stdout pipe")]
    NoStdout,
}

/// One raw BGR frame pulled off the decode pipeline. The buffer is owned
/// and writable; it never aliases the pipeline's internal buffers.
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Swaps the BGR byte order into an `RgbImage` for annotation and display.
    pub fn to_rgb(&self) -> RgbImage {
        let mut rgb = Vec::with_capacity(self.data.len());
        for px in self.data.chunks_exact(3) {
            rgb.extend_from_slice(&[px[2], px[1], px[0]]);
        }
        RgbImage::from_raw(self.width, self.height, rgb)
            .unwrap_or_else(|| RgbImage::new(self.width, self.height))
    }

    pub fn to_luma(&self) -> GrayImage {
        image::imageops::grayscale(&self.to_rgb())
    }
}

/// What a single read attempt produced.
pub enum ReadOutcome {
    Frame(Frame),
    /// The source delivered fewer bytes than a full frame (including zero).
    /// Partial frames are never returned.
    Ended,
}

/// Pulls exactly one frame's worth of bytes per call from a byte stream.
pub struct FrameReader<R: Read> {
    source: R,
    width: u32,
    height: u32,
    frame_len: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(source: R, width: u32, height: u32) -> Self {
        Self {
            source,
            width,
            height,
            frame_len: width as usize * height as usize * 3,
        }
    }

    /// Blocks until a full frame is available. A short read means the
    /// stream closed mid-frame and ends the session; other I/O errors
    /// propagate to the caller.
    pub fn read_frame(&mut self) -> std::io::Result<ReadOutcome> {
        let mut data = vec![0u8; self.frame_len];
        match self.source.read_exact(&mut data) {
            Ok(()) => Ok(ReadOutcome::Frame(Frame {
                data,
                width: self.width,
                height: self.height,
            })),
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(ReadOutcome::Ended),
            Err(err) => Err(err),
        }
    }
}

/// Builds the decode pipeline: RTP/H.264 in on UDP, raw BGR frames out on
/// stdout at the configured resolution.
pub fn source_command(config: &StreamConfig) -> Command {
    let mut cmd = Command::new("gst-launch-1.0");
    cmd.arg("-q")
        .arg("udpsrc")
        .arg(format!("port={}", config.port))
        .arg("!")
        .arg("application/x-rtp,media=video,clock-rate=90000,encoding-name=H264")
        .arg("!")
        .arg("rtph264depay")
        .arg("!")
        .arg("h264parse")
        .arg("!")
        .arg("avdec_h264")
        .arg("!")
        .arg("videoconvert")
        .arg("!")
        .arg(format!(
            "video/x-raw,format=BGR,width={},height={}",
            config.width, config.height
        ))
        .arg("!")
        .arg("fdsink");
    cmd
}

/// Shared handle onto the pipeline child. Cloneable so a signal handler
/// can terminate the pipeline while the reader is blocked on its stdout;
/// killing the child closes the pipe and unblocks the read. The first
/// `terminate` call kills and reaps the child, later calls are no-ops.
#[derive(Clone)]
pub struct SourceHandle {
    child: Arc<Mutex<Option<Child>>>,
}

impl SourceHandle {
    pub fn terminate(&self) {
        if let Ok(mut slot) = self.child.lock() {
            if let Some(mut child) = slot.take() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

/// The running decode pipeline plus the reader over its stdout.
/// Shutdown terminates and reaps the child exactly once; dropping the
/// source without calling `shutdown` does the same.
pub struct VideoSource {
    handle: SourceHandle,
    reader: FrameReader<ChildStdout>,
}

impl VideoSource {
    pub fn spawn(config: &StreamConfig) -> Result<Self, StreamError> {
        let mut cmd = source_command(config);
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdout = child.stdout.take().ok_or(StreamError::NoStdout)?;
        Ok(Self {
            handle: SourceHandle {
                child: Arc::new(Mutex::new(Some(child))),
            },
            reader: FrameReader::new(stdout, config.width, config.height),
        })
    }

    pub fn reader_mut(&mut self) -> &mut FrameReader<ChildStdout> {
        &mut self.reader
    }

    pub fn handle(&self) -> SourceHandle {
        self.handle.clone()
    }

    pub fn shutdown(&mut self) {
        self.handle.terminate();
    }
}

impl Drop for VideoSource {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn frame_bytes(width: u32, height: u32, fill: u8) -> Vec<u8> {
        vec![fill; width as usize * height as usize * 3]
    }

    #[test]
    fn exact_read_yields_frame() {
        let (w, h) = (4, 3);
        let bytes = frame_bytes(w, h, 7);
        let mut reader = FrameReader::new(Cursor::new(bytes.clone()), w, h);
        match reader.read_frame().unwrap() {
            ReadOutcome::Frame(frame) => {
                assert_eq!(frame.width(), w);
                assert_eq!(frame.height(), h);
                assert_eq!(frame.as_bytes(), &bytes[..]);
            }
            ReadOutcome::Ended => panic!("expected a frame"),
        }
        // the stream is now exhausted
        assert!(matches!(reader.read_frame().unwrap(), ReadOutcome::Ended));
    }

    #[test]
    fn short_read_signals_ended() {
        let (w, h) = (4, 3);
        let mut bytes = frame_bytes(w, h, 1);
        bytes.truncate(bytes.len() - 1);
        let mut reader = FrameReader::new(Cursor::new(bytes), w, h);
        assert!(matches!(reader.read_frame().unwrap(), ReadOutcome::Ended));
    }

    #[test]
    fn empty_stream_signals_ended() {
        let mut reader = FrameReader::new(Cursor::new(Vec::new()), 4, 3);
        assert!(matches!(reader.read_frame().unwrap(), ReadOutcome::Ended));
    }

    #[test]
    fn bgr_to_rgb_swaps_channels() {
        let (w, h) = (2, 1);
        // two BGR pixels: pure blue then pure red
        let bytes = vec![255, 0, 0, 0, 0, 255];
        let mut reader = FrameReader::new(Cursor::new(bytes), w, h);
        let ReadOutcome::Frame(frame) = reader.read_frame().unwrap() else {
            panic!("expected a frame");
        };
        let rgb = frame.to_rgb();
        assert_eq!(rgb.get_pixel(0, 0).0, [0, 0, 255]);
        assert_eq!(rgb.get_pixel(1, 0).0, [255, 0, 0]);
    }

    #[test]
    fn luma_conversion_keeps_dimensions() {
        let (w, h) = (3, 2);
        let mut reader = FrameReader::new(Cursor::new(frame_bytes(w, h, 200)), w, h);
        let ReadOutcome::Frame(frame) = reader.read_frame().unwrap() else {
            panic!("expected a frame");
        };
        let gray = frame.to_luma();
        assert_eq!((gray.width(), gray.height()), (w, h));
        // uniform input stays uniform
        assert!(gray.pixels().all(|p| p.0 == gray.get_pixel(0, 0).0));
    }

    #[test]
    fn pipeline_command_matches_configuration() {
        let cfg = StreamConfig::default();
        let cmd = source_command(&cfg);
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(cmd.get_program().to_string_lossy(), "gst-launch-1.0");
        assert!(args.contains(&"port=5601".to_string()));
        assert!(args.contains(&"rtph264depay".to_string()));
        assert!(args.contains(&"video/x-raw,format=BGR,width=1280,height=720".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("fdsink"));
    }

    fn spawn_sleep_source() -> VideoSource {
        let mut child = Command::new("sleep")
            .arg("5")
            .stdout(Stdio::piped())
            .spawn()
            .expect("spawn sleep");
        let stdout = child.stdout.take().unwrap();
        VideoSource {
            handle: SourceHandle {
                child: Arc::new(Mutex::new(Some(child))),
            },
            reader: FrameReader::new(stdout, 2, 2),
        }
    }

    #[test]
    fn shutdown_is_idempotent() {
        let mut source = spawn_sleep_source();
        source.shutdown();
        source.shutdown();
        assert!(source.handle.child.lock().unwrap().is_none());
    }

    #[test]
    fn terminate_through_a_cloned_handle_unblocks_the_reader() {
        // a signal handler holds a cloned handle and kills the pipeline;
        // the reader then sees EOF instead of blocking forever
        let mut source = spawn_sleep_source();
        let handle = source.handle();
        handle.terminate();
        assert!(matches!(
            source.reader_mut().read_frame().unwrap(),
            ReadOutcome::Ended
        ));
        // the regular teardown afterwards is a no-op
        source.shutdown();
        assert!(source.handle.child.lock().unwrap().is_none());
    }
}
