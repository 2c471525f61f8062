// SPDX-License-Identifier: MPL-2.0-only

pub mod defaults;

use derive_setters::Setters;
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, str::FromStr};

pub use defaults::Defaults;

pub const NAME: &str = "livebg";

/// Sentinel output name selecting every output of the session.
pub const ALL_OUTPUTS: &str = "ALL";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("media path is required")]
    MissingMediaPath,
    #[error("media file not found: {}", .0.display())]
    MediaNotFound(PathBuf),
    #[error("invalid scaling mode `{0}`, use: stretch, fit, fill, or default")]
    InvalidScaling(String),
    #[error("fps must be at least 1")]
    InvalidFps,
    #[error("cannot force both X11 and Wayland backends")]
    ConflictingBackends,
    #[error("failed to resolve media path {}: {source}", path.display())]
    ResolvePath {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse defaults file: {0}")]
    Parse(#[from] ron::error::SpannedError),
}

/// Output the wallpaper is presented on
#[derive(Debug, Deserialize, Serialize, Clone, Hash, PartialEq, Eq)]
#[must_use]
pub enum Output {
    /// every output of the session
    All,
    /// a single output, matched by name
    Name(String),
}

impl From<&str> for Output {
    fn from(name: &str) -> Self {
        if name == ALL_OUTPUTS {
            Output::All
        } else {
            Output::Name(name.to_owned())
        }
    }
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::All => f.write_str(ALL_OUTPUTS),
            Output::Name(name) => f.write_str(name),
        }
    }
}

/// Scaling mode handed to the media engine's own scaler
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScalingMode {
    /// Stretch the video ignoring any aspect ratio
    Stretch,
    /// Fit the video inside the output, keeping its aspect ratio
    #[default]
    Fit,
    /// Fill the output, cropping what overflows
    Fill,
    /// Leave the engine's own defaults untouched
    Default,
}

impl ScalingMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ScalingMode::Stretch => "stretch",
            ScalingMode::Fit => "fit",
            ScalingMode::Fill => "fill",
            ScalingMode::Default => "default",
        }
    }
}

impl FromStr for ScalingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stretch" => Ok(ScalingMode::Stretch),
            "fit" => Ok(ScalingMode::Fit),
            "fill" => Ok(ScalingMode::Fill),
            "default" => Ok(ScalingMode::Default),
            other => Err(ConfigError::InvalidScaling(other.to_owned())),
        }
    }
}

impl fmt::Display for ScalingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Display backend requested on the command line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendPreference {
    /// Detect the session type from the environment
    #[default]
    Auto,
    X11,
    Wayland,
}

impl BackendPreference {
    /// Resolves the two mutually exclusive force flags.
    pub fn from_flags(force_x11: bool, force_wayland: bool) -> Result<Self, ConfigError> {
        match (force_x11, force_wayland) {
            (true, true) => Err(ConfigError::ConflictingBackends),
            (true, false) => Ok(BackendPreference::X11),
            (false, true) => Ok(BackendPreference::Wayland),
            (false, false) => Ok(BackendPreference::Auto),
        }
    }
}

/// Startup configuration. Built once, then only ever borrowed.
#[derive(Debug, Clone, PartialEq, Setters)]
#[must_use]
pub struct Config {
    /// the video or image to play
    #[setters(skip)]
    pub media_path: PathBuf,
    /// outputs the wallpaper is presented on
    pub outputs: Vec<Output>,
    /// restart playback when the media ends
    pub loop_playback: bool,
    /// let the engine pick a hardware decoder
    pub hardware_decode: bool,
    /// disable the media's audio entirely
    pub mute: bool,
    /// audio volume in `0.0..=1.0`
    #[setters(skip)]
    pub volume: f64,
    /// target render rate
    pub fps: u32,
    pub scaling: ScalingMode,
    /// slow rendering down for still images
    pub adaptive_fps: bool,
    /// stop rendering while a fullscreen application is shown
    pub pause_on_fullscreen: bool,
    /// mute while other applications play audio
    pub auto_mute: bool,
    /// raw `--key[=value]` options handed to the engine
    #[setters(into)]
    pub mpv_options: String,
    pub backend: BackendPreference,
}

impl Config {
    pub const DEFAULT_FPS: u32 = 30;
    pub const DEFAULT_VOLUME: f64 = 0.5;

    pub fn new(media_path: impl Into<PathBuf>) -> Self {
        Self {
            media_path: media_path.into(),
            outputs: vec![Output::All],
            loop_playback: true,
            hardware_decode: true,
            mute: false,
            volume: Self::DEFAULT_VOLUME,
            fps: Self::DEFAULT_FPS,
            scaling: ScalingMode::default(),
            adaptive_fps: true,
            pause_on_fullscreen: true,
            auto_mute: true,
            mpv_options: String::new(),
            backend: BackendPreference::default(),
        }
    }

    /// Sets the volume, accepting either `0.0..=1.0` or a `0..=100` percentage.
    pub fn volume(mut self, volume: f64) -> Self {
        self.volume = normalize_volume(volume);
        self
    }

    /// Target interval between two renders.
    #[must_use]
    pub fn frame_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(1000 / u64::from(self.fps.max(1)))
    }

    /// Whether the audio detector should run at all.
    #[must_use]
    pub fn wants_auto_mute(&self) -> bool {
        self.auto_mute && !self.mute
    }

    /// Checks the constraints that cannot be expressed by the types alone.
    ///
    /// # Errors
    ///
    /// Fails if the media path is empty or missing on disk, or if fps is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.media_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingMediaPath);
        }
        if self.fps == 0 {
            return Err(ConfigError::InvalidFps);
        }
        if !self.media_path.exists() {
            return Err(ConfigError::MediaNotFound(self.media_path.clone()));
        }
        Ok(())
    }
}

/// Values above 1.0 are read as a percentage, then clamped to `0.0..=1.0`.
#[must_use]
pub fn normalize_volume(volume: f64) -> f64 {
    if volume.is_nan() {
        return 0.0;
    }
    let volume = if volume > 1.0 { volume / 100.0 } else { volume };
    volume.clamp(0.0, 1.0)
}
