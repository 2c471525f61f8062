// SPDX-License-Identifier: MPL-2.0

//! GPU surface provider: an off-screen EGL context, a size-keyed cache of
//! render targets and the texture-to-surface blit used by the compositor
//! backend.

mod renderer;

use std::collections::HashMap;

pub use renderer::{NativeDisplay, ProcAddressResolver, Renderer, WindowSurface};

/// An off-screen framebuffer with its color texture attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderTarget {
    pub framebuffer: u32,
    pub texture: u32,
    pub width: u32,
    pub height: u32,
}

/// Render targets keyed by size. At most one target exists per size and it
/// lives until the cache is drained.
#[derive(Debug)]
pub struct FramebufferCache<T> {
    targets: HashMap<(u32, u32), T>,
}

impl<T> Default for FramebufferCache<T> {
    fn default() -> Self {
        Self {
            targets: HashMap::new(),
        }
    }
}

impl<T: Copy> FramebufferCache<T> {
    /// Returns the cached target for `width`x`height`, calling `alloc` only
    /// when none exists yet. A failed allocation is not cached.
    pub fn get_or_create<E>(
        &mut self,
        width: u32,
        height: u32,
        alloc: impl FnOnce(u32, u32) -> Result<T, E>,
    ) -> Result<T, E> {
        if let Some(target) = self.targets.get(&(width, height)) {
            return Ok(*target);
        }

        let target = alloc(width, height)?;
        self.targets.insert((width, height), target);
        Ok(target)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Empties the cache, handing every target to the caller for release.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.targets.drain().map(|(_, target)| target)
    }
}

/// Operations of the GPU provider the render loop depends on.
pub trait SurfaceProvider {
    /// Restores the provider's own context as current.
    fn make_current(&mut self) -> bool;

    /// Cached off-screen target of the given size.
    fn get_or_create_framebuffer(&mut self, width: u32, height: u32) -> Option<RenderTarget>;

    fn bind_framebuffer(&mut self, target: &RenderTarget);

    fn bind_default_framebuffer(&mut self);

    fn clear(&mut self, r: f32, g: f32, b: f32, a: f32);
}
