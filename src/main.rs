// SPDX-License-Identifier: MPL-2.0-only

mod backend;
mod cli;
mod detector;
mod gpu;
mod media;
mod orchestrator;

use std::{
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use calloop::{
    EventLoop,
    signals::{Signal, Signals},
};
use clap::Parser;
use eyre::{WrapErr, eyre};
use livebg_config::{Config, Defaults};

use crate::{
    backend::{Backend, DisplayBackend, Session},
    cli::Cli,
    detector::{AudioDetector, FullscreenDetector},
    gpu::{ProcAddressResolver, Renderer},
    media::{MediaEngine, MpvEngine},
    orchestrator::Orchestrator,
};

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(why) => {
            _ = why.print();
            return if why.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    if let Err(why) = color_eyre::install() {
        eprintln!("error: {why}");
        return ExitCode::FAILURE;
    }

    tracing_subscriber::fmt()
        .with_max_level(cli.max_level())
        .with_writer(std::io::stderr)
        .init();

    let config = match cli
        .to_config(&Defaults::load())
        .and_then(|config| config.validate().map(|()| config))
    {
        Ok(config) => config,
        Err(why) => {
            tracing::error!(%why, "invalid configuration");
            eprintln!("error: {why}");
            return ExitCode::FAILURE;
        }
    };

    // Detach before any thread or connection exists.
    if cli.daemon {
        if let Err(why) = nix::unistd::daemon(false, false) {
            eprintln!("error: failed to daemonize: {why}");
            return ExitCode::FAILURE;
        }
    }

    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(why) => {
            tracing::error!(?why, "fatal error");
            eprintln!("error: {why}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: &Config) -> eyre::Result<()> {
    let mut event_loop: EventLoop<'static, ()> =
        EventLoop::try_new().wrap_err("failed to create event loop")?;

    // Registered first so every thread spawned later inherits the blocked mask.
    let running = Arc::new(AtomicBool::new(true));
    let signals = Signals::new(&[Signal::SIGINT, Signal::SIGTERM])
        .wrap_err("failed to create signal source")?;
    let flag = Arc::clone(&running);
    event_loop
        .handle()
        .insert_source(signals, move |event, _, _| {
            tracing::info!(signal = ?event.signal(), "shutting down");
            flag.store(false, Ordering::Release);
        })
        .map_err(|why| eyre!("failed to register signal handler: {}", why.error))?;

    tracing::info!(
        media = %config.media_path.display(),
        scaling = %config.scaling,
        "starting {}",
        livebg_config::NAME
    );

    let backend = Backend::connect(config.backend, Session::from_env())?;

    let monitors = backend.monitors();
    if monitors.is_empty() {
        return Err(eyre!("no monitors found"));
    }
    for monitor in &monitors {
        tracing::info!(%monitor, "found monitor");
    }

    let gpu = Renderer::new(backend.native_display()).wrap_err("failed to create GPU context")?;

    let mut engine = MpvEngine::initialize(config)?;
    engine.create_render_context(ProcAddressResolver)?;

    let mut audio = AudioDetector::default();
    if config.wants_auto_mute() {
        match audio.initialize() {
            Ok(()) => tracing::info!("auto-mute enabled"),
            Err(why) => {
                tracing::warn!(?why, "audio detection unavailable, auto-mute disabled");
                audio.set_enabled(false);
            }
        }
    } else {
        tracing::info!(mute = config.mute, "auto-mute disabled");
        audio.set_enabled(false);
    }

    let mut fullscreen = FullscreenDetector::new(backend.kind());
    if config.pause_on_fullscreen {
        if let Err(why) = fullscreen.initialize() {
            tracing::warn!(?why, "fullscreen detection unavailable, pausing disabled");
            fullscreen.set_enabled(false);
        }
    } else {
        fullscreen.set_enabled(false);
    }

    tracing::info!("all components initialized");

    let mut orchestrator = Orchestrator::new(config, gpu, backend, engine, audio, fullscreen);
    let result = orchestrator.run(&mut event_loop, &mut (), &running);
    orchestrator.shutdown();
    result
}
