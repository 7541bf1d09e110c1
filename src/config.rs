use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("image dimensions must be positive, got {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("horizontal field of view must be in (0, pi), got {0} rad")]
    InvalidFov(f64),
    #[error("tag size must be positive, got {0} m")]
    InvalidTagSize(f64),
    #[error("detector thread count must be positive, got {0}")]
    InvalidThreads(i32),
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Stream and detection settings. Defaults match the simulated camera
/// (1280x720 @ 1.134 rad horizontal FOV, RTP/H.264 on UDP 5601, 16.5 cm tags).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub width: u32,
    pub height: u32,
    pub horizontal_fov: f64,
    pub port: u16,
    pub tag_size_m: f64,
    pub detector_threads: i32,
    pub font_path: Option<PathBuf>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            horizontal_fov: 1.134,
            port: 5601,
            tag_size_m: 0.165,
            detector_threads: 2,
            font_path: None,
        }
    }
}

impl StreamConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let reader = BufReader::new(file);
        let config: Self = serde_json::from_reader(reader).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::InvalidDimensions {
                width: self.width,
                height: self.height,
            });
        }
        if !(self.horizontal_fov > 0.0 && self.horizontal_fov < std::f64::consts::PI) {
            return Err(ConfigError::InvalidFov(self.horizontal_fov));
        }
        if !(self.tag_size_m > 0.0) {
            return Err(ConfigError::InvalidTagSize(self.tag_size_m));
        }
        if self.detector_threads <= 0 {
            return Err(ConfigError::InvalidThreads(self.detector_threads));
        }
        Ok(())
    }

    /// Bytes per raw BGR frame on the pipeline's stdout.
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// Pinhole intrinsics derived from the horizontal field of view.
/// Computed once at startup and never changed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl CameraIntrinsics {
    pub fn from_fov(width: u32, height: u32, horizontal_fov: f64) -> Result<Self, ConfigError> {
        if width == 0 || height == 0 {
            return Err(ConfigError::InvalidDimensions { width, height });
        }
        if !(horizontal_fov > 0.0 && horizontal_fov < std::f64::consts::PI) {
            return Err(ConfigError::InvalidFov(horizontal_fov));
        }
        let focal = (width as f64 / 2.0) / (horizontal_fov / 2.0).tan();
        Ok(Self {
            fx: focal,
            fy: focal,
            cx: width as f64 / 2.0,
            cy: height as f64 / 2.0,
        })
    }
}
