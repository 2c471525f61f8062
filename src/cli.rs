// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use livebg_config::{BackendPreference, Config, ConfigError, Defaults, Output};

#[derive(Debug, Parser, Clone)]
#[command(name = "livebg", version)]
#[command(about = "Video and image wallpapers for Wayland and X11")]
pub struct Cli {
    /// Video or image to play.
    pub media_path: Option<PathBuf>,

    /// Output to draw on. Repeatable; `ALL` selects every output.
    #[arg(short = 'o', long = "output", value_name = "NAME")]
    pub outputs: Vec<String>,

    /// Draw on this output only, replacing any `--output`.
    #[arg(short = 'r', long = "screen-root", value_name = "NAME")]
    pub screen_root: Option<String>,

    /// Media path, used when no positional path is given.
    #[arg(short = 'b', long = "bg", value_name = "PATH")]
    pub background: Option<PathBuf>,

    /// Target frames per second.
    #[arg(short = 'f', long)]
    pub fps: Option<u32>,

    /// Play without audio.
    #[arg(short = 's', long)]
    pub silent: bool,

    /// Keep playing audio while other applications do.
    #[arg(long = "noautomute")]
    pub no_auto_mute: bool,

    /// One of stretch, fit, fill or default.
    #[arg(long, value_name = "MODE")]
    pub scaling: Option<String>,

    /// 0.0 to 1.0, or a percentage from 0 to 100.
    #[arg(long, allow_negative_numbers = true)]
    pub volume: Option<f64>,

    #[arg(long)]
    pub no_loop: bool,

    #[arg(long)]
    pub no_hardware_decode: bool,

    /// Extra mpv options, e.g. "--vf=hflip --deband".
    #[arg(long, value_name = "OPTIONS", allow_hyphen_values = true)]
    pub mpv_options: Option<String>,

    #[arg(long)]
    pub force_x11: bool,

    #[arg(long)]
    pub force_wayland: bool,

    /// Keep rendering at full rate for still images.
    #[arg(long)]
    pub no_adaptive_fps: bool,

    /// Keep rendering while a fullscreen application is shown.
    #[arg(long)]
    pub no_fullscreen_pause: bool,

    /// Shorthand for `--log-level debug`.
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Detach from the terminal.
    #[arg(short = 'd', long)]
    pub daemon: bool,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl Cli {
    #[must_use]
    pub fn max_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else {
            self.log_level.into()
        }
    }

    /// Layers the command line over `defaults`. The media path is made
    /// absolute here, since daemonizing changes the working directory. File
    /// existence is checked later by [`Config::validate`].
    pub fn to_config(&self, defaults: &Defaults) -> Result<Config, ConfigError> {
        let media_path = self
            .media_path
            .as_deref()
            .or(self.background.as_deref())
            .ok_or(ConfigError::MissingMediaPath)?;

        let media_path = if media_path.as_os_str().is_empty() {
            media_path.to_path_buf()
        } else {
            std::path::absolute(media_path).map_err(|source| ConfigError::ResolvePath {
                path: media_path.to_path_buf(),
                source,
            })?
        };

        let mut config = defaults.apply(media_path);

        if !self.outputs.is_empty() {
            config.outputs = self.outputs.iter().map(|name| Output::from(name.as_str())).collect();
        }
        if let Some(root) = &self.screen_root {
            config.outputs = vec![Output::from(root.as_str())];
        }

        if let Some(fps) = self.fps {
            config.fps = fps;
        }
        if let Some(scaling) = &self.scaling {
            config.scaling = scaling.parse()?;
        }

        if let Some(volume) = self.volume {
            config = config.volume(volume);
            if config.volume > 0.0 && !self.silent {
                config.mute = false;
            }
        }
        if self.silent {
            config.mute = true;
        }

        if self.no_auto_mute {
            config.auto_mute = false;
        }
        if self.no_loop {
            config.loop_playback = false;
        }
        if self.no_hardware_decode {
            config.hardware_decode = false;
        }
        if self.no_adaptive_fps {
            config.adaptive_fps = false;
        }
        if self.no_fullscreen_pause {
            config.pause_on_fullscreen = false;
        }
        if let Some(options) = &self.mpv_options {
            config.mpv_options.clone_from(options);
        }

        config.backend = BackendPreference::from_flags(self.force_x11, self.force_wayland)?;

        Ok(config)
    }
}
