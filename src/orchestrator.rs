// SPDX-License-Identifier: MPL-2.0

//! The cooperative render loop tying the media engine, the GPU provider, the
//! display backend and the capability detectors together.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use calloop::EventLoop;
use eyre::WrapErr;
use livebg_config::{Config, Output};

use crate::{
    backend::{DisplayBackend, primary_monitor},
    detector::{AudioDetector, FullscreenDetector},
    gpu::{RenderTarget, SurfaceProvider},
    media::MediaEngine,
};

/// Event pump ceiling, about 60 Hz.
const EVENT_INTERVAL: Duration = Duration::from_millis(16);
/// Auto-mute reconciliation period.
const AUDIO_CHECK_INTERVAL: Duration = Duration::from_millis(100);
/// Minimum gap between two renders, whatever the configured fps.
const MIN_RENDER_GAP: Duration = Duration::from_millis(16);
/// How often adaptive fps re-classifies the content.
const STATIC_CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// Render period for still images without new frames.
const STATIC_RENDER_INTERVAL: Duration = Duration::from_millis(500);
/// Media shorter than this is treated as a still image.
const STATIC_DURATION_THRESHOLD: f64 = 0.1;
const PAUSED_SLEEP: Duration = Duration::from_millis(100);
const MIN_SLEEP: Duration = Duration::from_millis(1);

/// Timers and flags carried from one tick to the next.
#[derive(Debug)]
struct LoopState {
    last_frame: Instant,
    last_event: Instant,
    last_audio_check: Instant,
    last_render: Instant,
    last_static_check: Instant,
    needs_redraw: bool,
    is_static: bool,
    paused_by_fullscreen: bool,
    muted_by_detector: bool,
    waiting_for_playback: u64,
}

impl LoopState {
    fn new(now: Instant) -> Self {
        Self {
            last_frame: now,
            last_event: now,
            last_audio_check: now,
            last_render: now,
            last_static_check: now,
            needs_redraw: true,
            is_static: false,
            paused_by_fullscreen: false,
            muted_by_detector: false,
            waiting_for_playback: 0,
        }
    }
}

/// The "waiting for playback" diagnostic is logged on its first occurrence
/// and then on every 60th.
fn should_log_waiting(occurrence: u64) -> bool {
    occurrence == 1 || occurrence % 60 == 0
}

pub struct Orchestrator<'a, G, B, M> {
    config: &'a Config,
    // Declared before `gpu` so the engine's render context is released while
    // the GL context still exists.
    engine: M,
    backend: B,
    gpu: G,
    audio: AudioDetector,
    fullscreen: FullscreenDetector,
    state: LoopState,
}

impl<'a, G, B, M> Orchestrator<'a, G, B, M>
where
    G: SurfaceProvider,
    B: DisplayBackend<G>,
    M: MediaEngine,
{
    pub fn new(
        config: &'a Config,
        gpu: G,
        backend: B,
        engine: M,
        audio: AudioDetector,
        fullscreen: FullscreenDetector,
    ) -> Self {
        Self {
            config,
            engine,
            backend,
            gpu,
            audio,
            fullscreen,
            state: LoopState::new(Instant::now()),
        }
    }

    /// Ticks until `running` is cleared or the backend asks to quit. Sleeping
    /// happens inside `event_loop`, so a signal source registered there wakes
    /// the loop immediately.
    pub fn run<Data>(
        &mut self,
        event_loop: &mut EventLoop<'_, Data>,
        data: &mut Data,
        running: &AtomicBool,
    ) -> eyre::Result<()> {
        tracing::info!(
            fps = self.config.fps,
            adaptive = self.config.adaptive_fps,
            "render loop started"
        );

        self.state = LoopState::new(Instant::now());

        while running.load(Ordering::Acquire) && !self.backend.should_quit() {
            let timeout = self.tick(Instant::now());
            event_loop
                .dispatch(Some(timeout), data)
                .wrap_err("event loop dispatch failed")?;
        }

        if self.backend.should_quit() {
            tracing::info!("display backend requested shutdown");
        }
        Ok(())
    }

    /// Runs one iteration of the loop at `now` and returns how long to sleep
    /// before the next one.
    pub fn tick(&mut self, now: Instant) -> Duration {
        let frame_interval = self.config.frame_interval();

        if now.saturating_duration_since(self.state.last_event) >= EVENT_INTERVAL {
            self.backend.process_events();
            self.engine.process_events();
            self.state.last_event = now;
        }

        if self.update_fullscreen_pause() {
            return PAUSED_SLEEP;
        }

        if now.saturating_duration_since(self.state.last_audio_check) >= AUDIO_CHECK_INTERVAL {
            self.reconcile_auto_mute();
            self.state.last_audio_check = now;
        }

        let elapsed = now.saturating_duration_since(self.state.last_frame);
        let new_frame = self.engine.has_new_frame();
        let gap_ok = now.saturating_duration_since(self.state.last_render) >= MIN_RENDER_GAP;
        let should_render = (self.state.needs_redraw || new_frame) && gap_ok;

        if elapsed >= frame_interval && should_render {
            if self.config.adaptive_fps {
                self.classify_content(now);
            }

            let static_hold = self.config.adaptive_fps
                && self.state.is_static
                && !new_frame
                && elapsed < STATIC_RENDER_INTERVAL;

            if !static_hold {
                self.render();
                self.state.last_render = now;
                self.state.last_frame = now;
            }
        }

        self.sleep_duration(now, frame_interval)
    }

    /// Stops the detectors and releases the backend's surfaces.
    pub fn shutdown(mut self) {
        self.audio.stop();
        self.fullscreen.stop();
        self.backend.destroy(&mut self.gpu);
        tracing::info!("shut down");
    }

    /// Returns whether rendering is paused for this tick.
    fn update_fullscreen_pause(&mut self) -> bool {
        if !self.fullscreen.enabled() {
            return false;
        }

        let active = self.fullscreen.fullscreen_app_active();
        if active && !self.state.paused_by_fullscreen {
            tracing::info!("pausing wallpaper, a fullscreen application is active");
            self.state.paused_by_fullscreen = true;
            self.state.needs_redraw = false;
        } else if !active && self.state.paused_by_fullscreen {
            tracing::info!("resuming wallpaper");
            self.state.paused_by_fullscreen = false;
            self.state.needs_redraw = true;
        }

        self.state.paused_by_fullscreen
    }

    /// Mutes on the rising edge of foreign audio and unmutes on the falling
    /// edge. Level changes in between write nothing.
    fn reconcile_auto_mute(&mut self) {
        if !self.audio.enabled() || self.config.mute {
            return;
        }

        let other_playing = self.audio.other_audio_playing();
        if other_playing && !self.state.muted_by_detector {
            self.engine.set_property("mute", "yes");
            self.state.muted_by_detector = true;
            tracing::debug!("auto-muted, another application is playing audio");
        } else if !other_playing && self.state.muted_by_detector {
            self.engine.set_property("mute", "no");
            self.state.muted_by_detector = false;
            tracing::debug!("auto-unmuted");
        }
    }

    fn classify_content(&mut self, now: Instant) {
        if now.saturating_duration_since(self.state.last_static_check) <= STATIC_CHECK_INTERVAL {
            return;
        }

        let is_static = self.engine.duration() <= STATIC_DURATION_THRESHOLD;
        if is_static != self.state.is_static {
            tracing::debug!(is_static, "content classification changed");
        }
        self.state.is_static = is_static;
        self.state.last_static_check = now;
    }

    fn render(&mut self) {
        let Some((width, height)) =
            primary_monitor(&self.backend.monitors()).map(|monitor| (monitor.width, monitor.height))
        else {
            tracing::debug!("no monitor to size the render target for");
            return;
        };

        self.gpu.make_current();

        let Some(target) = self.gpu.get_or_create_framebuffer(width, height) else {
            tracing::debug!(width, height, "no render target available");
            return;
        };

        tracing::trace!(
            framebuffer = target.framebuffer,
            new_frame = self.engine.has_new_frame(),
            "rendering frame"
        );

        self.gpu.bind_framebuffer(&target);
        self.gpu.clear(0.0, 0.0, 0.0, 1.0);

        if self.engine.render_frame(&target) {
            self.engine.report_presented();

            if self.engine.has_video() && self.engine.is_playing() {
                self.present(&target);
                self.state.needs_redraw = false;
                self.state.waiting_for_playback = 0;
            } else {
                self.state.waiting_for_playback += 1;
                if should_log_waiting(self.state.waiting_for_playback) {
                    tracing::info!(
                        has_video = self.engine.has_video(),
                        is_playing = self.engine.is_playing(),
                        duration = self.engine.duration(),
                        position = self.engine.position(),
                        "waiting for the media engine to start playback"
                    );
                }
            }
        } else {
            tracing::debug!("media engine rendered nothing");
        }

        self.gpu.bind_default_framebuffer();
    }

    fn present(&mut self, target: &RenderTarget) {
        for output in &self.config.outputs {
            let presented = match output {
                Output::All => self.backend.set_wallpaper_all(&mut self.gpu, target),
                Output::Name(name) => self.backend.set_wallpaper(&mut self.gpu, name, target),
            };
            if !presented {
                tracing::debug!(%output, "wallpaper not presented");
            }
        }
    }

    /// Half of the time until the nearest deadline, at least 1 ms.
    fn sleep_duration(&self, now: Instant, frame_interval: Duration) -> Duration {
        let until = |last: Instant, interval: Duration| {
            interval.saturating_sub(now.saturating_duration_since(last))
        };

        let nearest = until(self.state.last_frame, frame_interval)
            .min(until(self.state.last_event, EVENT_INTERVAL))
            .min(until(self.state.last_audio_check, AUDIO_CHECK_INTERVAL));

        (nearest / 2).max(MIN_SLEEP)
    }
}

#[cfg(test)]
mod tests;
