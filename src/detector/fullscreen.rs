// SPDX-License-Identifier: MPL-2.0

//! Detects fullscreen applications through EWMH window state on X11.
//! Wayland offers no portable way to inspect other clients' windows, so the
//! compositor session always reports no fullscreen application.

use std::time::Duration;

use eyre::{OptionExt, WrapErr};
use x11rb::{
    connection::Connection,
    protocol::xproto::{Atom, AtomEnum, ConnectionExt as _, MapState, Window},
    rust_connection::RustConnection,
};

use super::PollingDetector;
use crate::backend::BackendKind;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct FullscreenDetector {
    inner: PollingDetector,
    session: BackendKind,
}

impl FullscreenDetector {
    #[must_use]
    pub fn new(session: BackendKind) -> Self {
        Self {
            inner: PollingDetector::new("fullscreen"),
            session,
        }
    }

    pub fn initialize(&mut self) -> eyre::Result<()> {
        match self.session {
            BackendKind::X11 => self.inner.start(POLL_INTERVAL, || {
                let probe = EwmhProbe::connect()?;
                Ok(move || probe.fullscreen_window_mapped())
            }),
            BackendKind::Wayland => {
                tracing::info!("fullscreen detection is not available on Wayland");
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.inner.enabled()
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.inner.set_enabled(enabled);
    }

    /// Whether a fullscreen window was mapped at the last poll.
    #[must_use]
    pub fn fullscreen_app_active(&self) -> bool {
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

/// A private X11 connection used only from the polling thread.
struct EwmhProbe {
    conn: RustConnection,
    root: Window,
    client_list: Atom,
    wm_state: Atom,
    wm_state_fullscreen: Atom,
}

impl EwmhProbe {
    fn connect() -> eyre::Result<Self> {
        let (conn, screen_num) = x11rb::connect(None).wrap_err("failed to open X11 display")?;
        let root = conn
            .setup()
            .roots
            .get(screen_num)
            .ok_or_eyre("X11 screen not found")?
            .root;

        let intern = |name: &str| -> eyre::Result<Atom> {
            Ok(conn.intern_atom(false, name.as_bytes())?.reply()?.atom)
        };

        let client_list = intern("_NET_CLIENT_LIST")?;
        let wm_state = intern("_NET_WM_STATE")?;
        let wm_state_fullscreen = intern("_NET_WM_STATE_FULLSCREEN")?;

        Ok(Self {
            conn,
            root,
            client_list,
            wm_state,
            wm_state_fullscreen,
        })
    }

    fn fullscreen_window_mapped(&self) -> eyre::Result<bool> {
        let clients = self
            .conn
            .get_property(false, self.root, self.client_list, AtomEnum::WINDOW, 0, u32::MAX)?
            .reply()?;

        let Some(windows) = clients.value32() else {
            return Ok(false);
        };

        for window in windows {
            // Windows may vanish between the list and these queries.
            if self.is_fullscreen(window).unwrap_or(false) {
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn is_fullscreen(&self, window: Window) -> eyre::Result<bool> {
        let attributes = self.conn.get_window_attributes(window)?.reply()?;
        if attributes.map_state != MapState::VIEWABLE {
            return Ok(false);
        }

        let states = self
            .conn
            .get_property(false, window, self.wm_state, AtomEnum::ATOM, 0, 1024)?
            .reply()?;

        Ok(states
            .value32()
            .is_some_and(|mut atoms| atoms.any(|atom| atom == self.wm_state_fullscreen)))
    }
}
