// SPDX-License-Identifier: MPL-2.0

//! Display backends: layer-shell surfaces on Wayland and the root window
//! pixmap on X11, behind one interface.

mod surface;
pub mod wayland;
pub mod x11;

use std::fmt;

use eyre::eyre;
use livebg_config::{ALL_OUTPUTS, BackendPreference};

use crate::gpu::{NativeDisplay, RenderTarget, Renderer};

pub use wayland::WaylandBackend;
pub use x11::X11Backend;

/// Snapshot of one physical output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Monitor {
    pub name: String,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub refresh_rate: u32,
    pub primary: bool,
}

impl fmt::Display for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}x{} at {},{} {}Hz",
            self.name, self.width, self.height, self.x, self.y, self.refresh_rate
        )?;
        if self.primary {
            f.write_str(" (primary)")?;
        }
        Ok(())
    }
}

/// Returns the primary monitor, or the first one when none is marked.
pub fn primary_monitor(monitors: &[Monitor]) -> Option<&Monitor> {
    monitors.iter().find(|m| m.primary).or_else(|| monitors.first())
}

/// A named output that does not exist in the current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputNotFound {
    pub requested: String,
    pub available: Vec<String>,
}

impl fmt::Display for OutputNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "output {} not found, available: {}",
            self.requested,
            self.available.join(", ")
        )
    }
}

impl std::error::Error for OutputNotFound {}

impl OutputNotFound {
    pub fn log(&self) {
        tracing::error!(
            output = %self.requested,
            available = ?self.available,
            "Output not found"
        );
    }
}

/// Where a `set_wallpaper` request lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputTarget {
    All,
    Index(usize),
}

/// Resolves a requested output name against `monitors`. `ALL` always
/// resolves; any other name must match a monitor exactly.
pub fn resolve_output(monitors: &[Monitor], name: &str) -> Result<OutputTarget, OutputNotFound> {
    if name == ALL_OUTPUTS {
        return Ok(OutputTarget::All);
    }
    find_output(monitors, name).map(OutputTarget::Index)
}

/// Index of the monitor called `name`.
pub fn find_output(monitors: &[Monitor], name: &str) -> Result<usize, OutputNotFound> {
    monitors
        .iter()
        .position(|m| m.name == name)
        .ok_or_else(|| OutputNotFound {
            requested: name.to_owned(),
            available: monitors.iter().map(|m| m.name.clone()).collect(),
        })
}

/// Presents textures produced by a GPU provider `G` on the session's outputs.
pub trait DisplayBackend<G> {
    /// Releases every surface and the display connection.
    fn destroy(&mut self, gpu: &mut G);

    fn monitors(&self) -> Vec<Monitor>;

    /// Presents `target` on the output called `name`. The sentinel `ALL`
    /// selects every output.
    fn set_wallpaper(&mut self, gpu: &mut G, name: &str, target: &RenderTarget) -> bool;

    fn set_wallpaper_all(&mut self, gpu: &mut G, target: &RenderTarget) -> bool;

    /// Non-blocking pump of pending protocol traffic.
    fn process_events(&mut self);

    fn should_quit(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Wayland,
    X11,
}

impl BackendKind {
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            BackendKind::Wayland => BackendKind::X11,
            BackendKind::X11 => BackendKind::Wayland,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Wayland => "wayland",
            BackendKind::X11 => "x11",
        })
    }
}

/// Session signals read from the environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Session {
    pub wayland: bool,
    pub x11: bool,
}

impl Session {
    #[must_use]
    pub fn from_env() -> Self {
        let set = |var| std::env::var_os(var).is_some_and(|value| !value.is_empty());
        Self {
            wayland: set("WAYLAND_DISPLAY"),
            x11: set("DISPLAY"),
        }
    }
}

/// Backends to attempt, in order. A forced or detected backend is tried
/// first and the other one is the fallback.
pub fn selection_order(
    preference: BackendPreference,
    session: Session,
) -> Option<[BackendKind; 2]> {
    let first = match preference {
        BackendPreference::Wayland => BackendKind::Wayland,
        BackendPreference::X11 => BackendKind::X11,
        BackendPreference::Auto if session.wayland => BackendKind::Wayland,
        BackendPreference::Auto if session.x11 => BackendKind::X11,
        BackendPreference::Auto => return None,
    };

    Some([first, first.other()])
}

/// The backend in use for this session.
pub enum Backend {
    Wayland(WaylandBackend),
    X11(X11Backend),
}

impl Backend {
    /// Connects to the display server picked by [`selection_order`].
    pub fn connect(preference: BackendPreference, session: Session) -> eyre::Result<Self> {
        let order =
            selection_order(preference, session).ok_or_else(|| eyre!("no display server detected"))?;

        if preference == BackendPreference::Auto {
            tracing::info!(session = %order[0], "detected session");
        }

        let mut last_error = None;
        for (attempt, kind) in order.into_iter().enumerate() {
            if attempt > 0 {
                tracing::warn!(backend = %kind, "falling back to the other backend");
            }

            let result = match kind {
                BackendKind::Wayland => WaylandBackend::initialize().map(Backend::Wayland),
                BackendKind::X11 => X11Backend::initialize().map(Backend::X11),
            };

            match result {
                Ok(backend) => {
                    tracing::info!(backend = %kind, "display backend initialized");
                    return Ok(backend);
                }
                Err(why) => {
                    tracing::error!(backend = %kind, ?why, "failed to create display backend");
                    last_error = Some(why);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| eyre!("no display backend"))
            .wrap_err("failed to create any display backend"))
    }

    #[must_use]
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Wayland(_) => BackendKind::Wayland,
            Backend::X11(_) => BackendKind::X11,
        }
    }

    /// Display the GPU context must be created on.
    #[must_use]
    pub fn native_display(&self) -> NativeDisplay {
        match self {
            Backend::Wayland(backend) => backend.native_display(),
            Backend::X11(_) => NativeDisplay::Default,
        }
    }
}

impl DisplayBackend<Renderer> for Backend {
    fn destroy(&mut self, gpu: &mut Renderer) {
        match self {
            Backend::Wayland(backend) => backend.destroy(gpu),
            Backend::X11(backend) => backend.destroy(gpu),
        }
    }

    fn monitors(&self) -> Vec<Monitor> {
        match self {
            Backend::Wayland(backend) => backend.monitors(),
            Backend::X11(backend) => backend.monitors(),
        }
    }

    fn set_wallpaper(&mut self, gpu: &mut Renderer, name: &str, target: &RenderTarget) -> bool {
        match self {
            Backend::Wayland(backend) => backend.set_wallpaper(gpu, name, target),
            Backend::X11(backend) => backend.set_wallpaper(gpu, name, target),
        }
    }

    fn set_wallpaper_all(&mut self, gpu: &mut Renderer, target: &RenderTarget) -> bool {
        match self {
            Backend::Wayland(backend) => backend.set_wallpaper_all(gpu, target),
            Backend::X11(backend) => backend.set_wallpaper_all(gpu, target),
        }
    }

    fn process_events(&mut self) {
        match self {
            Backend::Wayland(backend) => backend.process_events(),
            Backend::X11(backend) => backend.process_events(),
        }
    }

    fn should_quit(&self) -> bool {
        match self {
            Backend::Wayland(backend) => backend.should_quit(),
            Backend::X11(backend) => backend.should_quit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(name: &str, primary: bool) -> Monitor {
        Monitor {
            name: name.to_owned(),
            x: 0,
            y: 0,
            width: 1920,
            height: 1080,
            refresh_rate: 60,
            primary,
        }
    }

    #[test]
    fn forced_backend_is_tried_first_then_the_other() {
        let session = Session {
            wayland: true,
            x11: true,
        };
        assert_eq!(
            selection_order(BackendPreference::X11, session),
            Some([BackendKind::X11, BackendKind::Wayland])
        );
        assert_eq!(
            selection_order(BackendPreference::Wayland, Session::default()),
            Some([BackendKind::Wayland, BackendKind::X11])
        );
    }

    #[test]
    fn auto_prefers_wayland_session() {
        let both = Session {
            wayland: true,
            x11: true,
        };
        assert_eq!(
            selection_order(BackendPreference::Auto, both),
            Some([BackendKind::Wayland, BackendKind::X11])
        );

        let x11_only = Session {
            wayland: false,
            x11: true,
        };
        assert_eq!(
            selection_order(BackendPreference::Auto, x11_only),
            Some([BackendKind::X11, BackendKind::Wayland])
        );
    }

    #[test]
    fn no_session_means_no_backend() {
        assert_eq!(
            selection_order(BackendPreference::Auto, Session::default()),
            None
        );
    }

    #[test]
    fn unknown_output_lists_every_monitor_name() {
        let monitors = vec![monitor("DP-1", true), monitor("HDMI-A-1", false)];

        assert_eq!(find_output(&monitors, "HDMI-A-1"), Ok(1));

        let err = find_output(&monitors, "DP-9").unwrap_err();
        let names: Vec<String> = monitors.iter().map(|m| m.name.clone()).collect();
        assert_eq!(err.available, names);
        assert_eq!(err.to_string(), "output DP-9 not found, available: DP-1, HDMI-A-1");
    }

    #[test]
    fn named_request_for_a_missing_output_fails() {
        let monitors = vec![monitor("DP-1", true), monitor("HDMI-A-1", false)];

        assert_eq!(resolve_output(&monitors, "ALL"), Ok(OutputTarget::All));
        assert_eq!(resolve_output(&monitors, "DP-1"), Ok(OutputTarget::Index(0)));

        let err = resolve_output(&monitors, "DP-9").unwrap_err();
        assert_eq!(err.requested, "DP-9");
        assert_eq!(err.available, vec!["DP-1", "HDMI-A-1"]);

        // names are matched exactly
        assert!(resolve_output(&monitors, "dp-1").is_err());
        assert!(resolve_output(&monitors, "").is_err());
    }

    #[test]
    fn all_resolves_without_monitors() {
        assert_eq!(resolve_output(&[], "ALL"), Ok(OutputTarget::All));
        let err = resolve_output(&[], "DP-1").unwrap_err();
        assert!(err.available.is_empty());
    }

    #[test]
    fn primary_falls_back_to_first_monitor() {
        let monitors = vec![monitor("DP-1", false), monitor("DP-2", true)];
        assert_eq!(primary_monitor(&monitors).map(|m| m.name.as_str()), Some("DP-2"));

        let monitors = vec![monitor("DP-1", false), monitor("DP-2", false)];
        assert_eq!(primary_monitor(&monitors).map(|m| m.name.as_str()), Some("DP-1"));

        assert!(primary_monitor(&[]).is_none());
    }

    #[test]
    fn monitor_display_marks_primary() {
        assert_eq!(
            monitor("DP-1", true).to_string(),
            "DP-1 1920x1080 at 0,0 60Hz (primary)"
        );
    }
}
