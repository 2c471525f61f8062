// SPDX-License-Identifier: MPL-2.0-only

//! Optional on-disk defaults, layered under the command line.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Config, ConfigError, Output, ScalingMode};

const FILE_NAME: &str = "config.ron";

/// Values read from `$XDG_CONFIG_HOME/livebg/config.ron`. Every field is optional.
#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
#[must_use]
pub struct Defaults {
    pub fps: Option<u32>,
    pub volume: Option<f64>,
    pub scaling: Option<ScalingMode>,
    pub outputs: Option<Vec<String>>,
    pub loop_playback: Option<bool>,
    pub hardware_decode: Option<bool>,
    pub adaptive_fps: Option<bool>,
    pub pause_on_fullscreen: Option<bool>,
    pub auto_mute: Option<bool>,
    pub mpv_options: Option<String>,
}

impl Defaults {
    /// Location of the defaults file, if a config directory is known.
    #[must_use]
    pub fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(crate::NAME).join(FILE_NAME))
    }

    pub fn from_ron(source: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(source)?)
    }

    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_ron(&source)
    }

    /// Loads the defaults file. A missing file yields empty defaults; an
    /// unreadable or malformed one is logged and ignored.
    pub fn load() -> Self {
        let Some(path) = Self::path() else {
            return Self::default();
        };

        if !path.exists() {
            return Self::default();
        }

        match Self::read(&path) {
            Ok(defaults) => {
                tracing::debug!(path = %path.display(), "loaded defaults file");
                defaults
            }
            Err(why) => {
                tracing::warn!(?why, path = %path.display(), "defaults file error, falling back to built-in defaults");
                Self::default()
            }
        }
    }

    /// Builds a configuration for `media_path` with these values over the built-in defaults.
    pub fn apply(&self, media_path: PathBuf) -> Config {
        let mut config = Config::new(media_path);

        if let Some(fps) = self.fps {
            config.fps = fps;
        }
        if let Some(volume) = self.volume {
            config = config.volume(volume);
        }
        if let Some(scaling) = self.scaling {
            config.scaling = scaling;
        }
        if let Some(outputs) = self.outputs.as_ref().filter(|o| !o.is_empty()) {
            config.outputs = outputs.iter().map(|name| Output::from(name.as_str())).collect();
        }
        if let Some(loop_playback) = self.loop_playback {
            config.loop_playback = loop_playback;
        }
        if let Some(hardware_decode) = self.hardware_decode {
            config.hardware_decode = hardware_decode;
        }
        if let Some(adaptive_fps) = self.adaptive_fps {
            config.adaptive_fps = adaptive_fps;
        }
        if let Some(pause) = self.pause_on_fullscreen {
            config.pause_on_fullscreen = pause;
        }
        if let Some(auto_mute) = self.auto_mute {
            config.auto_mute = auto_mute;
        }
        if let Some(options) = &self.mpv_options {
            config.mpv_options.clone_from(options);
        }

        config
    }
}
