// SPDX-License-Identifier: MPL-2.0

//! Detects other applications playing audio through PulseAudio (or the
//! PipeWire pulse server).

use std::{cell::Cell, rc::Rc, time::Duration};

use eyre::{OptionExt, WrapErr, eyre};
use libpulse_binding::{
    callbacks::ListResult,
    context::{self, Context, FlagSet},
    mainloop::standard::{IterateResult, Mainloop},
    operation,
    proplist::properties,
};

use super::PollingDetector;

const POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Substrings identifying streams that belong to this process.
const OWN_STREAM_NAMES: [&str; 3] = [livebg_config::NAME, "mpv", "wallpaper"];

pub struct AudioDetector {
    inner: PollingDetector,
}

impl Default for AudioDetector {
    fn default() -> Self {
        Self {
            inner: PollingDetector::new("audio"),
        }
    }
}

impl AudioDetector {
    /// Connects to the sound server on the polling thread.
    pub fn initialize(&mut self) -> eyre::Result<()> {
        let own_names = own_stream_names();
        self.inner.start(POLL_INTERVAL, move || {
            let mut connection = PulseConnection::connect()?;
            Ok(move || connection.other_stream_active(&own_names))
        })
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.inner.enabled()
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.inner.set_enabled(enabled);
    }

    /// Whether another application was playing audio at the last poll.
    #[must_use]
    pub fn other_audio_playing(&self) -> bool {
        self.inner.state()
    }

    pub fn stop(&mut self) {
        self.inner.stop();
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &PollingDetector {
        &self.inner
    }
}

/// Identity strings of this process: the running binary's name plus the
/// fixed ones.
fn own_stream_names() -> Vec<String> {
    let mut names: Vec<String> = OWN_STREAM_NAMES.iter().map(|s| (*s).to_owned()).collect();
    if let Some(binary) = std::env::current_exe()
        .ok()
        .and_then(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
    {
        if !names.contains(&binary) {
            names.push(binary);
        }
    }
    names
}

/// A stream is ours if its application name contains one of our identity strings.
pub(crate) fn is_own_stream(application_name: Option<&str>, own_names: &[String]) -> bool {
    application_name.is_some_and(|app| {
        let app = app.to_ascii_lowercase();
        own_names
            .iter()
            .any(|own| app.contains(&own.to_ascii_lowercase()))
    })
}

/// Blocking client on a private standard mainloop.
struct PulseConnection {
    mainloop: Mainloop,
    context: Context,
}

impl PulseConnection {
    fn connect() -> eyre::Result<Self> {
        let mut mainloop = Mainloop::new().ok_or_eyre("failed to create PulseAudio mainloop")?;
        let mut context = Context::new(&mainloop, livebg_config::NAME)
            .ok_or_eyre("failed to create PulseAudio context")?;

        context
            .connect(None, FlagSet::NOFLAGS, None)
            .wrap_err("failed to connect to PulseAudio")?;

        loop {
            iterate(&mut mainloop)?;
            match context.get_state() {
                context::State::Ready => break,
                context::State::Failed | context::State::Terminated => {
                    return Err(eyre!("PulseAudio context failed to become ready"));
                }
                _ => {}
            }
        }

        tracing::debug!("connected to PulseAudio");
        Ok(Self { mainloop, context })
    }

    /// Lists sink inputs and reports whether any uncorked one is not ours.
    fn other_stream_active(&mut self, own_names: &[String]) -> eyre::Result<bool> {
        let found = Rc::new(Cell::new(false));
        let own_names = own_names.to_vec();

        let op = {
            let found = Rc::clone(&found);
            self.context
                .introspect()
                .get_sink_input_info_list(move |result| {
                    if let ListResult::Item(info) = result {
                        let app = info.proplist.get_str(properties::APPLICATION_NAME);
                        if !info.corked && !is_own_stream(app.as_deref(), &own_names) {
                            tracing::trace!(app = ?app, "foreign audio stream");
                            found.set(true);
                        }
                    }
                })
        };

        while op.get_state() == operation::State::Running {
            iterate(&mut self.mainloop)?;
        }

        if op.get_state() == operation::State::Cancelled {
            return Err(eyre!("sink input query was cancelled"));
        }

        Ok(found.get())
    }
}

impl Drop for PulseConnection {
    fn drop(&mut self) {
        self.context.disconnect();
    }
}

fn iterate(mainloop: &mut Mainloop) -> eyre::Result<()> {
    match mainloop.iterate(true) {
        IterateResult::Success(_) => Ok(()),
        IterateResult::Quit(_) => Err(eyre!("PulseAudio mainloop quit")),
        IterateResult::Err(why) => Err(eyre!("PulseAudio mainloop failed: {why}")),
    }
}
