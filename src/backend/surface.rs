// SPDX-License-Identifier: MPL-2.0

//! Presentation state of a single compositor surface.

/// Lifecycle of a layer surface after it has been created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the compositor to send the first size.
    Configuring,
    /// Sized and free to present.
    Configured,
    /// A present is being issued right now.
    Rendering,
    /// Presented; waiting on the frame callback.
    AwaitingFrame,
}

/// What the caller must do with the native window after a configure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resize {
    /// First configure: allocate the native window at this size.
    Allocate { width: u32, height: u32 },
    /// Later configure with a new size: resize the existing window in place.
    Resize { width: u32, height: u32 },
    /// Same size as before.
    Unchanged,
}

/// Enforces at most one in-flight present per surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceState {
    phase: Phase,
    size: Option<(u32, u32)>,
}

impl Default for SurfaceState {
    fn default() -> Self {
        Self {
            phase: Phase::Configuring,
            size: None,
        }
    }
}

impl SurfaceState {
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub fn size(&self) -> Option<(u32, u32)> {
        self.size
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.phase != Phase::Configuring
    }

    /// Records a size from the compositor.
    pub fn configure(&mut self, width: u32, height: u32) -> Resize {
        let previous = self.size.replace((width, height));

        if self.phase == Phase::Configuring {
            self.phase = Phase::Configured;
        }

        match previous {
            None => Resize::Allocate { width, height },
            Some(size) if size == (width, height) => Resize::Unchanged,
            Some(_) => Resize::Resize { width, height },
        }
    }

    /// Enters `Rendering` when the surface is configured and no present is
    /// outstanding. Returns `false` when the request must be dropped.
    pub fn try_begin_present(&mut self) -> bool {
        if self.phase == Phase::Configured {
            self.phase = Phase::Rendering;
            true
        } else {
            false
        }
    }

    /// Leaves `Rendering`. A successful present waits for its frame callback.
    pub fn end_present(&mut self, presented: bool) {
        if self.phase == Phase::Rendering {
            self.phase = if presented {
                Phase::AwaitingFrame
            } else {
                Phase::Configured
            };
        }
    }

    /// The compositor consumed the last buffer.
    pub fn frame_done(&mut self) {
        if self.phase == Phase::AwaitingFrame {
            self.phase = Phase::Configured;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_surface_rejects_presents() {
        let mut state = SurfaceState::default();
        assert!(!state.try_begin_present());
        assert_eq!(state.phase(), Phase::Configuring);
    }

    #[test]
    fn only_one_present_in_flight() {
        let mut state = SurfaceState::default();
        state.configure(1920, 1080);

        assert!(state.try_begin_present());
        assert!(!state.try_begin_present());
        state.end_present(true);
        assert_eq!(state.phase(), Phase::AwaitingFrame);

        // dropped, not queued
        assert!(!state.try_begin_present());
        assert!(!state.try_begin_present());

        state.frame_done();
        assert!(state.try_begin_present());
    }

    #[test]
    fn failed_present_does_not_wait_for_a_frame() {
        let mut state = SurfaceState::default();
        state.configure(800, 600);

        assert!(state.try_begin_present());
        state.end_present(false);
        assert_eq!(state.phase(), Phase::Configured);
        assert!(state.try_begin_present());
    }

    #[test]
    fn stray_frame_callback_is_ignored() {
        let mut state = SurfaceState::default();
        state.frame_done();
        assert_eq!(state.phase(), Phase::Configuring);

        state.configure(800, 600);
        state.frame_done();
        assert_eq!(state.phase(), Phase::Configured);
    }

    #[test]
    fn reconfigure_resizes_instead_of_reallocating() {
        let mut state = SurfaceState::default();
        assert_eq!(
            state.configure(1920, 1080),
            Resize::Allocate {
                width: 1920,
                height: 1080
            }
        );
        assert_eq!(state.configure(1920, 1080), Resize::Unchanged);
        assert_eq!(
            state.configure(2560, 1440),
            Resize::Resize {
                width: 2560,
                height: 1440
            }
        );
        assert_eq!(state.size(), Some((2560, 1440)));
    }

    #[test]
    fn reconfigure_keeps_outstanding_present() {
        let mut state = SurfaceState::default();
        state.configure(1920, 1080);
        assert!(state.try_begin_present());
        state.end_present(true);

        state.configure(2560, 1440);
        assert_eq!(state.phase(), Phase::AwaitingFrame);
        assert!(state.is_configured());
    }
}
