// SPDX-License-Identifier: MPL-2.0

//! Media engine adapter. mpv decodes the media and renders each frame into
//! an off-screen target through its OpenGL render API.

use std::{
    ffi::c_void,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use eyre::{OptionExt, eyre};
use libmpv2::{
    Mpv,
    events::{Event, EventContext},
    render::{OpenGLInitParams, RenderContext, RenderParam, RenderParamApiType},
};
use livebg_config::{Config, ScalingMode};

use crate::gpu::{ProcAddressResolver, RenderTarget};

/// What the orchestration loop needs from a media engine.
pub trait MediaEngine {
    fn create_render_context(&mut self, resolver: ProcAddressResolver) -> eyre::Result<()>;

    /// Renders the current frame into `target`. Clears the new-frame flag on
    /// success.
    fn render_frame(&mut self, target: &RenderTarget) -> bool;

    fn report_presented(&mut self);

    fn has_new_frame(&self) -> bool;

    fn is_playing(&self) -> bool;

    fn has_video(&self) -> bool;

    /// Media length in seconds, 0 when unknown.
    fn duration(&self) -> f64;

    fn position(&self) -> f64;

    fn set_property(&mut self, name: &str, value: &str) -> bool;

    fn get_property(&self, name: &str) -> Option<String>;

    /// Drains pending engine events without blocking.
    fn process_events(&mut self);
}

/// Translates the configuration into mpv options, in the order they are
/// applied. Pass-through options come last so they override the rest.
pub fn engine_options(config: &Config) -> Vec<(String, String)> {
    let mut options: Vec<(String, String)> = Vec::new();
    let mut set = |key: &str, value: &str| options.push((key.to_owned(), value.to_owned()));

    set("terminal", "no");
    set("msg-level", "all=no");

    if config.hardware_decode {
        set("hwdec", "auto-safe");
        set("hwdec-codecs", "all");
    } else {
        set("hwdec", "no");
    }

    if config.loop_playback {
        set("loop-file", "inf");
        set("loop-playlist", "inf");
    }

    if config.mute {
        set("audio", "no");
    } else {
        set("volume", &format!("{:.0}", config.volume * 100.0));
    }

    match config.scaling {
        ScalingMode::Stretch => set("keepaspect", "no"),
        ScalingMode::Fit => {
            set("keepaspect", "yes");
            set("panscan", "0.0");
        }
        ScalingMode::Fill => {
            set("keepaspect", "yes");
            set("panscan", "1.0");
        }
        ScalingMode::Default => {}
    }

    set("vo", "libmpv");
    set("gpu-context", "auto");
    set("gpu-api", "auto");

    options.extend(parse_passthrough(&config.mpv_options));
    options
}

/// Parses `--key=value` and `--key [value]` tokens separated by whitespace.
/// A flag followed by another flag, or by nothing, is set to `yes`. Tokens
/// that are not flags are ignored.
pub fn parse_passthrough(options: &str) -> Vec<(String, String)> {
    let mut parsed = Vec::new();
    let mut tokens = options.split_whitespace().peekable();

    while let Some(token) = tokens.next() {
        let Some(option) = token.strip_prefix("--") else {
            tracing::debug!(token, "ignoring mpv option without leading --");
            continue;
        };

        if option.is_empty() {
            continue;
        }

        if let Some((key, value)) = option.split_once('=') {
            parsed.push((key.to_owned(), value.to_owned()));
            continue;
        }

        let value = tokens
            .next_if(|next| !next.starts_with("--"))
            .unwrap_or("yes");
        parsed.push((option.to_owned(), value.to_owned()));
    }

    parsed
}

/// Context handed to mpv's GL loader.
fn get_proc_address(resolver: &ProcAddressResolver, name: &str) -> *mut c_void {
    resolver.resolve(name)
}

pub struct MpvEngine {
    // Dropped before `mpv`, which owns the handle both borrow.
    render: Option<RenderContext>,
    events: EventContext,
    mpv: Mpv,
    new_frame: Arc<AtomicBool>,
}

impl MpvEngine {
    /// Creates the engine with the configured options and starts loading
    /// the media.
    pub fn initialize(config: &Config) -> eyre::Result<Self> {
        let path = config
            .media_path
            .to_str()
            .ok_or_eyre("media path is not valid UTF-8")?
            .to_owned();

        let options = engine_options(config);
        let mpv = Mpv::with_initializer(move |init| {
            for (key, value) in &options {
                if let Err(why) = init.set_property(key, value.as_str()) {
                    tracing::warn!(option = %key, %value, ?why, "mpv rejected option");
                }
            }
            Ok(())
        })
        .map_err(|why| eyre!("failed to create mpv instance: {why:?}"))?;

        mpv.command("loadfile", &[path.as_str()])
            .map_err(|why| eyre!("failed to load {path}: {why:?}"))?;

        let events = EventContext::new(mpv.ctx);

        tracing::info!(%path, "media engine initialized");

        Ok(Self {
            render: None,
            events,
            mpv,
            new_frame: Arc::new(AtomicBool::new(false)),
        })
    }
}

impl MediaEngine for MpvEngine {
    fn create_render_context(&mut self, resolver: ProcAddressResolver) -> eyre::Result<()> {
        let mut render = RenderContext::new(
            unsafe { self.mpv.ctx.as_mut() },
            vec![
                RenderParam::ApiType(RenderParamApiType::OpenGl),
                RenderParam::InitParams(OpenGLInitParams {
                    get_proc_address,
                    ctx: resolver,
                }),
            ],
        )
        .map_err(|why| eyre!("failed to create mpv render context: {why:?}"))?;

        let new_frame = Arc::clone(&self.new_frame);
        render.set_update_callback(move || {
            new_frame.store(true, Ordering::Release);
        });

        self.render = Some(render);
        tracing::debug!("mpv render context created");
        Ok(())
    }

    fn render_frame(&mut self, target: &RenderTarget) -> bool {
        let Some(render) = self.render.as_ref() else {
            tracing::debug!("render requested before the render context exists");
            return false;
        };

        match render.render::<ProcAddressResolver>(
            target.framebuffer as i32,
            target.width as i32,
            target.height as i32,
            true,
        ) {
            Ok(()) => {
                self.new_frame.store(false, Ordering::Release);
                true
            }
            Err(why) => {
                tracing::debug!(?why, "mpv render failed");
                false
            }
        }
    }

    fn report_presented(&mut self) {
        if let Some(render) = self.render.as_ref() {
            render.report_swap();
        }
    }

    fn has_new_frame(&self) -> bool {
        self.new_frame.load(Ordering::Acquire)
    }

    fn is_playing(&self) -> bool {
        self.mpv
            .get_property::<bool>("pause")
            .is_ok_and(|paused| !paused)
    }

    fn has_video(&self) -> bool {
        self.mpv
            .get_property::<String>("video-codec")
            .is_ok_and(|codec| !codec.is_empty())
    }

    fn duration(&self) -> f64 {
        self.mpv.get_property::<f64>("duration").unwrap_or(0.0)
    }

    fn position(&self) -> f64 {
        self.mpv.get_property::<f64>("time-pos").unwrap_or(0.0)
    }

    fn set_property(&mut self, name: &str, value: &str) -> bool {
        match self.mpv.set_property(name, value) {
            Ok(()) => true,
            Err(why) => {
                tracing::debug!(property = name, value, ?why, "failed to set mpv property");
                false
            }
        }
    }

    fn get_property(&self, name: &str) -> Option<String> {
        self.mpv.get_property::<String>(name).ok()
    }

    fn process_events(&mut self) {
        while let Some(event) = self.events.wait_event(0.0) {
            match event {
                Ok(Event::VideoReconfig | Event::PlaybackRestart) => {
                    self.new_frame.store(true, Ordering::Release);
                }
                Ok(Event::EndFile(reason)) => {
                    tracing::debug!(?reason, "end of file");
                }
                Ok(Event::LogMessage { prefix, level, text, .. }) => {
                    tracing::debug!(prefix, level, text = text.trim_end(), "mpv");
                }
                Ok(_) => {}
                Err(why) => tracing::debug!(?why, "mpv event error"),
            }
        }
    }
}
