// SPDX-License-Identifier: MPL-2.0

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use eyre::eyre;

use super::{AudioDetector, FullscreenDetector, PollingDetector, audio::is_own_stream};
use crate::backend::BackendKind;

fn constant(value: bool) -> impl FnMut() -> eyre::Result<bool> {
    move || Ok(value)
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn probe_result_reaches_the_accessor() {
    let mut detector = PollingDetector::new("test");
    detector
        .start(Duration::from_millis(10), || Ok(constant(true)))
        .unwrap();

    assert!(detector.is_running());
    assert!(wait_until(|| detector.state()));
    detector.stop();
    assert!(!detector.is_running());
}

#[test]
fn disabling_resets_state_immediately() {
    let mut detector = PollingDetector::new("test");
    detector
        .start(Duration::from_millis(10), || Ok(constant(true)))
        .unwrap();
    assert!(wait_until(|| detector.state()));

    detector.set_enabled(false);
    assert!(!detector.state());
    assert!(!detector.enabled());

    // later polls cannot raise it while disabled
    thread::sleep(Duration::from_millis(50));
    assert!(!detector.state());

    detector.set_enabled(true);
    assert!(wait_until(|| detector.state()));
}

#[test]
fn disabled_detector_reports_false_for_a_set_flag() {
    let mut detector = PollingDetector::new("test");
    detector.shared_state().store(true, Ordering::Relaxed);
    assert!(detector.state());

    detector.set_enabled(false);
    assert!(!detector.state());
}

#[test]
fn setup_failure_is_reported_and_nothing_runs() {
    let mut detector = PollingDetector::new("test");
    let result =
        detector.start(Duration::from_millis(10), || Err::<fn() -> eyre::Result<bool>, _>(eyre!("no server")));

    assert!(result.is_err());
    assert!(!detector.is_running());
    assert!(!detector.state());
}

#[test]
fn probe_errors_keep_polling() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut detector = PollingDetector::new("test");

    let counter = Arc::clone(&calls);
    detector
        .start(Duration::from_millis(5), move || {
            Ok(move || {
                let n = counter.fetch_add(1, Ordering::Relaxed);
                if n < 2 { Err(eyre!("transient")) } else { Ok(true) }
            })
        })
        .unwrap();

    assert!(wait_until(|| detector.state()));
    assert!(calls.load(Ordering::Relaxed) >= 3);
}

#[test]
fn stop_wakes_a_sleeping_poller() {
    let mut detector = PollingDetector::new("test");
    detector
        .start(Duration::from_secs(3600), || Ok(constant(false)))
        .unwrap();

    let started = Instant::now();
    detector.stop();
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn stuck_probe_is_detached_after_timeout() {
    let release = Arc::new(AtomicBool::new(false));
    let mut detector = PollingDetector::new("test");

    let flag = Arc::clone(&release);
    detector
        .start(Duration::from_millis(1), move || {
            Ok(move || {
                while !flag.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(5));
                }
                Ok(false)
            })
        })
        .unwrap();

    let started = Instant::now();
    detector.stop();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_secs(4));

    release.store(true, Ordering::Relaxed);
}

#[test]
fn own_streams_are_recognized() {
    let own: Vec<String> = ["livebg", "mpv", "wallpaper"]
        .iter()
        .map(|s| (*s).to_owned())
        .collect();

    assert!(is_own_stream(Some("livebg"), &own));
    assert!(is_own_stream(Some("mpv Media Player"), &own));
    assert!(is_own_stream(Some("My-Wallpaper-Tool"), &own));
    assert!(!is_own_stream(Some("Firefox"), &own));
    assert!(!is_own_stream(Some("Spotify"), &own));
    assert!(!is_own_stream(None, &own));
}

#[test]
fn wayland_fullscreen_detector_never_reports_fullscreen() {
    let mut detector = FullscreenDetector::new(BackendKind::Wayland);
    detector.initialize().unwrap();
    assert!(!detector.inner().is_running());
    assert!(!detector.fullscreen_app_active());
}

#[test]
fn audio_detector_disable_masks_state() {
    let mut detector = AudioDetector::default();
    detector.inner().shared_state().store(true, Ordering::Relaxed);
    assert!(detector.other_audio_playing());

    detector.set_enabled(false);
    assert!(!detector.other_audio_playing());
}
