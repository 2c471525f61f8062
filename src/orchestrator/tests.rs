// SPDX-License-Identifier: MPL-2.0

use std::sync::{Arc, atomic::AtomicBool};

use crate::{
    backend::{BackendKind, Monitor},
    gpu::FramebufferCache,
};

use super::*;

#[derive(Default)]
struct FakeGpu {
    cache: FramebufferCache<RenderTarget>,
    allocations: Vec<(u32, u32)>,
    clears: usize,
}

impl SurfaceProvider for FakeGpu {
    fn make_current(&mut self) -> bool {
        true
    }

    fn get_or_create_framebuffer(&mut self, width: u32, height: u32) -> Option<RenderTarget> {
        let next = self.allocations.len() as u32 + 1;
        let allocations = &mut self.allocations;
        self.cache
            .get_or_create(width, height, |width, height| {
                allocations.push((width, height));
                Ok::<_, ()>(RenderTarget {
                    framebuffer: next,
                    texture: next + 100,
                    width,
                    height,
                })
            })
            .ok()
    }

    fn bind_framebuffer(&mut self, _target: &RenderTarget) {}

    fn bind_default_framebuffer(&mut self) {}

    fn clear(&mut self, _r: f32, _g: f32, _b: f32, _a: f32) {
        self.clears += 1;
    }
}

struct FakeBackend {
    monitors: Vec<Monitor>,
    all: usize,
    named: Vec<String>,
    pumps: usize,
    quit_after: Option<usize>,
}

impl FakeBackend {
    fn single_1080p() -> Self {
        Self {
            monitors: vec![Monitor {
                name: "HDMI-A-1".to_owned(),
                x: 0,
                y: 0,
                width: 1920,
                height: 1080,
                refresh_rate: 60,
                primary: true,
            }],
            all: 0,
            named: Vec::new(),
            pumps: 0,
            quit_after: None,
        }
    }
}

impl DisplayBackend<FakeGpu> for FakeBackend {
    fn destroy(&mut self, _gpu: &mut FakeGpu) {}

    fn monitors(&self) -> Vec<Monitor> {
        self.monitors.clone()
    }

    fn set_wallpaper(&mut self, _gpu: &mut FakeGpu, name: &str, _target: &RenderTarget) -> bool {
        self.named.push(name.to_owned());
        true
    }

    fn set_wallpaper_all(&mut self, _gpu: &mut FakeGpu, _target: &RenderTarget) -> bool {
        self.all += 1;
        true
    }

    fn process_events(&mut self) {
        self.pumps += 1;
    }

    fn should_quit(&self) -> bool {
        self.quit_after.is_some_and(|limit| self.pumps >= limit)
    }
}

struct FakeEngine {
    new_frame: bool,
    /// Every render is immediately followed by another decoded frame.
    continuous: bool,
    playing: bool,
    video: bool,
    duration: f64,
    renders: usize,
    presented: usize,
    properties: Vec<(String, String)>,
}

impl FakeEngine {
    fn playing_video() -> Self {
        Self {
            new_frame: true,
            continuous: true,
            playing: true,
            video: true,
            duration: 12.0,
            renders: 0,
            presented: 0,
            properties: Vec::new(),
        }
    }

    fn mute_writes(&self) -> Vec<&str> {
        self.properties
            .iter()
            .filter(|(name, _)| name == "mute")
            .map(|(_, value)| value.as_str())
            .collect()
    }
}

impl MediaEngine for FakeEngine {
    fn create_render_context(&mut self, _resolver: crate::gpu::ProcAddressResolver) -> eyre::Result<()> {
        Ok(())
    }

    fn render_frame(&mut self, _target: &RenderTarget) -> bool {
        self.renders += 1;
        self.new_frame = self.continuous;
        true
    }

    fn report_presented(&mut self) {
        self.presented += 1;
    }

    fn has_new_frame(&self) -> bool {
        self.new_frame
    }

    fn is_playing(&self) -> bool {
        self.playing
    }

    fn has_video(&self) -> bool {
        self.video
    }

    fn duration(&self) -> f64 {
        self.duration
    }

    fn position(&self) -> f64 {
        0.0
    }

    fn set_property(&mut self, name: &str, value: &str) -> bool {
        self.properties.push((name.to_owned(), value.to_owned()));
        true
    }

    fn get_property(&self, name: &str) -> Option<String> {
        self.properties
            .iter()
            .rev()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
    }

    fn process_events(&mut self) {}
}

struct Harness<'a> {
    orchestrator: Orchestrator<'a, FakeGpu, FakeBackend, FakeEngine>,
    audio: Arc<AtomicBool>,
    fullscreen: Arc<AtomicBool>,
    start: Instant,
}

impl<'a> Harness<'a> {
    fn new(config: &'a Config, backend: FakeBackend, engine: FakeEngine) -> Self {
        let audio = AudioDetector::default();
        let fullscreen = FullscreenDetector::new(BackendKind::X11);
        let audio_flag = audio.inner().shared_state();
        let fullscreen_flag = fullscreen.inner().shared_state();

        let mut orchestrator =
            Orchestrator::new(config, FakeGpu::default(), backend, engine, audio, fullscreen);
        let start = Instant::now();
        orchestrator.state = LoopState::new(start);

        Self {
            orchestrator,
            audio: audio_flag,
            fullscreen: fullscreen_flag,
            start,
        }
    }

    fn at(&self, ms: u64) -> Instant {
        self.start + Duration::from_millis(ms)
    }

    fn tick(&mut self, ms: u64) -> Duration {
        let now = self.at(ms);
        self.orchestrator.tick(now)
    }

    fn engine(&self) -> &FakeEngine {
        &self.orchestrator.engine
    }

    fn engine_mut(&mut self) -> &mut FakeEngine {
        &mut self.orchestrator.engine
    }

    fn backend(&self) -> &FakeBackend {
        &self.orchestrator.backend
    }

    /// Ticks every millisecond in `range` and returns the times a render
    /// happened.
    fn run_ms(&mut self, range: std::ops::Range<u64>) -> Vec<u64> {
        let mut renders = Vec::new();
        for ms in range {
            let before = self.engine().renders;
            self.tick(ms);
            if self.engine().renders > before {
                renders.push(ms);
            }
        }
        renders
    }
}

#[test]
fn auto_mute_is_edge_triggered() {
    let config = Config::new("clip.mp4");
    let mut harness = Harness::new(&config, FakeBackend::single_1080p(), FakeEngine::playing_video());

    for (step, playing) in [false, false, true, true, true, false].into_iter().enumerate() {
        harness.audio.store(playing, Ordering::Relaxed);
        harness.tick(100 * (step as u64 + 1));
    }

    assert_eq!(harness.engine().mute_writes(), vec!["yes", "no"]);
}

#[test]
fn explicit_mute_disables_auto_mute() {
    let config = Config::new("clip.mp4").mute(true);
    let mut harness = Harness::new(&config, FakeBackend::single_1080p(), FakeEngine::playing_video());

    harness.audio.store(true, Ordering::Relaxed);
    for step in 1..=5 {
        harness.tick(100 * step);
    }

    assert!(harness.engine().mute_writes().is_empty());
}

#[test]
fn fullscreen_pause_blocks_rendering_then_forces_a_redraw() {
    let config = Config::new("clip.mp4");
    let mut engine = FakeEngine::playing_video();
    engine.new_frame = false;
    engine.continuous = false;
    let mut harness = Harness::new(&config, FakeBackend::single_1080p(), engine);

    harness.fullscreen.store(true, Ordering::Relaxed);
    for ms in (50..2000).step_by(50) {
        assert_eq!(harness.tick(ms), PAUSED_SLEEP);
    }
    assert_eq!(harness.engine().renders, 0);
    assert_eq!(harness.backend().all, 0);

    harness.fullscreen.store(false, Ordering::Relaxed);
    harness.tick(2000);
    assert_eq!(harness.engine().renders, 1);
    assert_eq!(harness.backend().all, 1);

    // Nothing new after the forced redraw.
    harness.run_ms(2001..2500);
    assert_eq!(harness.engine().renders, 1);
}

#[test]
fn disabled_fullscreen_detector_never_pauses() {
    let config = Config::new("clip.mp4");
    let mut harness = Harness::new(&config, FakeBackend::single_1080p(), FakeEngine::playing_video());
    harness.orchestrator.fullscreen.set_enabled(false);

    harness.fullscreen.store(true, Ordering::Relaxed);
    let renders = harness.run_ms(0..200);
    assert!(!renders.is_empty());
}

#[test]
fn clip_at_30_fps_on_a_single_1080p_monitor() {
    let config = Config::new("clip.mp4").fps(30);
    let mut engine = FakeEngine::playing_video();
    engine.playing = false;
    let mut harness = Harness::new(&config, FakeBackend::single_1080p(), engine);

    // Frames render while the engine is still starting, but nothing is shown.
    let early = harness.run_ms(0..500);
    assert!(!early.is_empty());
    assert_eq!(harness.backend().all, 0);

    harness.engine_mut().playing = true;
    let rendered_before = harness.engine().renders;
    let renders = harness.run_ms(500..1500);

    assert_eq!(harness.orchestrator.gpu.allocations, vec![(1920, 1080)]);
    assert_eq!(harness.backend().all, harness.engine().renders - rendered_before);
    assert_eq!(harness.engine().presented, harness.engine().renders);
    assert_eq!(harness.orchestrator.gpu.clears, harness.engine().renders);

    assert!(renders.len() <= 30, "{} renders in one second", renders.len());
    assert!(renders.len() >= 28, "{} renders in one second", renders.len());
    assert!(renders.windows(2).all(|pair| pair[1] - pair[0] >= 33));
}

#[test]
fn render_gap_caps_high_fps() {
    let config = Config::new("clip.mp4").fps(240);
    let mut harness = Harness::new(&config, FakeBackend::single_1080p(), FakeEngine::playing_video());

    let renders = harness.run_ms(0..500);

    assert!(renders.len() > 1);
    assert!(renders.windows(2).all(|pair| pair[1] - pair[0] >= 16));
}

#[test]
fn named_outputs_are_presented_individually() {
    let config = Config::new("clip.mp4").outputs(vec![
        Output::Name("HDMI-A-1".to_owned()),
        Output::All,
    ]);
    let mut harness = Harness::new(&config, FakeBackend::single_1080p(), FakeEngine::playing_video());

    harness.tick(40);

    assert_eq!(harness.backend().named, vec!["HDMI-A-1".to_owned()]);
    assert_eq!(harness.backend().all, 1);
}

#[test]
fn static_content_renders_at_a_reduced_rate() {
    let mut engine = FakeEngine::playing_video();
    engine.video = false;
    engine.new_frame = false;
    engine.continuous = false;
    engine.duration = 0.0;

    let adaptive = Config::new("still.png");
    let mut harness = Harness::new(&adaptive, FakeBackend::single_1080p(), engine);
    harness.run_ms(0..6000);
    let reduced = harness.run_ms(6000..8000).len();
    assert!((3..=5).contains(&reduced), "{reduced} renders in two seconds");

    let mut engine = FakeEngine::playing_video();
    engine.video = false;
    engine.new_frame = false;
    engine.continuous = false;
    engine.duration = 0.0;

    let fixed = Config::new("still.png").adaptive_fps(false);
    let mut harness = Harness::new(&fixed, FakeBackend::single_1080p(), engine);
    harness.run_ms(0..6000);
    let full = harness.run_ms(6000..8000).len();
    assert!(full >= 55, "{full} renders in two seconds");
}

#[test]
fn sleep_is_half_of_the_nearest_deadline() {
    let config = Config::new("clip.mp4");
    let mut engine = FakeEngine::playing_video();
    engine.new_frame = false;
    engine.continuous = false;
    let mut harness = Harness::new(&config, FakeBackend::single_1080p(), engine);
    harness.orchestrator.state.needs_redraw = false;

    // frame 33 ms, events 16 ms, audio 100 ms away
    assert_eq!(harness.tick(0), Duration::from_millis(8));
    // events just pumped: frame 17 ms, events 16 ms away
    assert_eq!(harness.tick(16), Duration::from_millis(8));
    // events 3 ms away
    assert_eq!(harness.tick(29), Duration::from_micros(1500));
    // frame overdue but nothing to draw
    assert_eq!(harness.tick(40), MIN_SLEEP);
}

#[test]
fn sleep_never_drops_below_the_floor() {
    let config = Config::new("clip.mp4");
    let mut engine = FakeEngine::playing_video();
    engine.new_frame = false;
    engine.continuous = false;
    let mut harness = Harness::new(&config, FakeBackend::single_1080p(), engine);
    harness.orchestrator.state.needs_redraw = false;

    harness.tick(16);
    // events 1.5 ms away, half of that is under the floor
    let now = harness.start + Duration::from_micros(30_500);
    assert_eq!(harness.orchestrator.tick(now), MIN_SLEEP);
}

#[test]
fn disabled_audio_detector_does_not_shorten_sleep() {
    let config = Config::new("clip.mp4").fps(1);
    let mut engine = FakeEngine::playing_video();
    engine.new_frame = false;
    engine.continuous = false;
    let mut harness = Harness::new(&config, FakeBackend::single_1080p(), engine);
    harness.orchestrator.state.needs_redraw = false;
    harness.orchestrator.audio.set_enabled(false);

    harness.tick(200);
    // events 15 ms away, the audio check 99 ms away
    assert_eq!(harness.tick(201), Duration::from_micros(7500));
}

#[test]
fn waiting_diagnostic_is_rate_limited() {
    let logged: Vec<u64> = (1..=180).filter(|n| should_log_waiting(*n)).collect();
    assert_eq!(logged, vec![1, 60, 120, 180]);
}

#[test]
fn run_stops_when_the_backend_quits() {
    let config = Config::new("clip.mp4");
    let mut backend = FakeBackend::single_1080p();
    backend.quit_after = Some(3);
    let mut harness = Harness::new(&config, backend, FakeEngine::playing_video());

    let mut event_loop = EventLoop::<()>::try_new().unwrap();
    let running = AtomicBool::new(true);
    harness
        .orchestrator
        .run(&mut event_loop, &mut (), &running)
        .unwrap();

    assert!(harness.backend().pumps >= 3);
}

#[test]
fn run_returns_immediately_once_stopped() {
    let config = Config::new("clip.mp4");
    let mut harness = Harness::new(&config, FakeBackend::single_1080p(), FakeEngine::playing_video());

    let mut event_loop = EventLoop::<()>::try_new().unwrap();
    let running = AtomicBool::new(false);
    harness
        .orchestrator
        .run(&mut event_loop, &mut (), &running)
        .unwrap();

    assert_eq!(harness.engine().renders, 0);
}
