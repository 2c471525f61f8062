// SPDX-License-Identifier: MPL-2.0

//! Layer-shell backend: one background layer surface per output, presented
//! through an EGL window surface and paced by frame callbacks.

use std::{ffi::c_void, io::ErrorKind};

use eyre::WrapErr;
use sctk::{
    compositor::{CompositorHandler, CompositorState},
    delegate_compositor, delegate_layer, delegate_output, delegate_registry,
    output::{OutputHandler, OutputInfo, OutputState},
    reexports::client::{
        Connection, EventQueue, Proxy, QueueHandle,
        backend::WaylandError,
        globals::registry_queue_init,
        protocol::{
            wl_output::{self, WlOutput},
            wl_surface,
        },
    },
    registry::{ProvidesRegistryState, RegistryState},
    registry_handlers,
    shell::{
        WaylandSurface,
        wlr_layer::{
            Anchor, KeyboardInteractivity, Layer, LayerShell, LayerShellHandler, LayerSurface,
            LayerSurfaceConfigure,
        },
    },
};
use wayland_egl::WlEglSurface;

use super::{
    DisplayBackend, Monitor, OutputTarget, resolve_output,
    surface::{Resize, SurfaceState},
};
use crate::gpu::{NativeDisplay, RenderTarget, Renderer, WindowSurface};

/// Name used when a lone output does not report one.
const SINGLE_OUTPUT_NAME: &str = "HDMI-A-1";

const LAYER_NAMESPACE: &str = "wallpaper";

const DEFAULT_REFRESH_RATE: u32 = 60;

pub struct WaylandBackend {
    conn: Connection,
    queue: EventQueue<WaylandState>,
    qh: QueueHandle<WaylandState>,
    state: WaylandState,
}

struct WaylandState {
    registry_state: RegistryState,
    output_state: OutputState,
    compositor_state: CompositorState,
    layer_shell: LayerShell,
    outputs: Vec<OutputBinding>,
    /// Surfaces of destroyed outputs, released once a GPU is at hand.
    retired: Vec<LayerBinding>,
    should_quit: bool,
}

/// A known output and its lazily created background surface.
struct OutputBinding {
    output: WlOutput,
    geometry: OutputGeometry,
    monitor: Monitor,
    layer: Option<LayerBinding>,
}

struct LayerBinding {
    layer: LayerSurface,
    state: SurfaceState,
    presentation: Option<Presentation>,
}

impl LayerBinding {
    fn release(self, gpu: &mut Renderer) {
        let (window, surface) = match self.presentation {
            Some(Presentation { window, surface }) => (Some(window), surface),
            None => (None, None),
        };
        teardown(self.layer, window, surface, |surface| {
            gpu.destroy_window_surface(surface);
        });
    }
}

/// Native EGL window of a configured surface and the EGL surface wrapping it.
struct Presentation {
    window: WlEglSurface,
    surface: Option<WindowSurface>,
}

/// Releases a surface innermost first: the EGL surface, then the native
/// window it was created on, then the layer owning the `wl_surface`.
fn teardown<L, W, S>(layer: L, window: Option<W>, surface: Option<S>, destroy_surface: impl FnOnce(S)) {
    if let Some(surface) = surface {
        destroy_surface(surface);
    }
    drop(window);
    drop(layer);
}

/// What an output reports about itself, before a name is settled on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OutputGeometry {
    pub name: Option<String>,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub refresh_rate: u32,
}

impl OutputGeometry {
    fn from_info(info: &OutputInfo) -> Self {
        let mode = info
            .modes
            .iter()
            .find(|mode| mode.current)
            .or_else(|| info.modes.first());

        let (width, height) = mode
            .map(|mode| mode.dimensions)
            .or(info.logical_size)
            .unwrap_or((0, 0));

        let (x, y) = info.logical_position.unwrap_or(info.location);

        let refresh_rate = mode
            .map(|mode| u32::try_from((mode.refresh_rate + 500) / 1000).unwrap_or(0))
            .filter(|rate| *rate > 0)
            .unwrap_or(DEFAULT_REFRESH_RATE);

        Self {
            name: info.name.clone(),
            x,
            y,
            width: width.max(0) as u32,
            height: height.max(0) as u32,
            refresh_rate,
        }
    }
}

/// Names every output deterministically. A usable reported name wins;
/// otherwise a lone output gets a fixed name and several outputs are named
/// after their resolution and position, with an index separating identical
/// ones.
pub(crate) fn output_names(outputs: &[OutputGeometry]) -> Vec<String> {
    outputs
        .iter()
        .enumerate()
        .map(|(index, output)| {
            if let Some(name) = output.name.as_deref().filter(|n| !n.is_empty() && *n != "Unknown") {
                return name.to_owned();
            }

            if outputs.len() == 1 {
                return SINGLE_OUTPUT_NAME.to_owned();
            }

            let mut name = format!("OUTPUT-{}x{}", output.width, output.height);
            if output.x != 0 || output.y != 0 {
                name.push_str(&format!("-{}+{}", output.x, output.y));
            }

            let duplicates = outputs[..index]
                .iter()
                .filter(|other| {
                    (other.width, other.height, other.x, other.y)
                        == (output.width, output.height, output.x, output.y)
                })
                .count();
            if duplicates > 0 {
                name.push_str(&format!("-{duplicates}"));
            }

            name
        })
        .collect()
}

impl WaylandBackend {
    /// Connects to the compositor and collects its outputs.
    pub fn initialize() -> eyre::Result<Self> {
        let conn = Connection::connect_to_env().wrap_err("wayland client connection failed")?;

        let (globals, mut queue) =
            registry_queue_init(&conn).wrap_err("failed to initialize registry queue")?;
        let qh = queue.handle();

        let compositor_state =
            CompositorState::bind(&globals, &qh).wrap_err("wl_compositor is not available")?;
        let layer_shell =
            LayerShell::bind(&globals, &qh).wrap_err("wlr layer shell is not available")?;

        let mut state = WaylandState {
            registry_state: RegistryState::new(&globals),
            output_state: OutputState::new(&globals, &qh),
            compositor_state,
            layer_shell,
            outputs: Vec::new(),
            retired: Vec::new(),
            should_quit: false,
        };

        // Outputs are announced on the first roundtrip and described on the second.
        queue
            .roundtrip(&mut state)
            .wrap_err("failed to enumerate outputs")?;
        queue
            .roundtrip(&mut state)
            .wrap_err("failed to enumerate outputs")?;

        tracing::info!(outputs = state.outputs.len(), "wayland backend initialized");

        Ok(Self {
            conn,
            queue,
            qh,
            state,
        })
    }

    #[must_use]
    pub fn native_display(&self) -> NativeDisplay {
        NativeDisplay::Wayland(self.conn.backend().display_ptr().cast())
    }

    fn render_to_output(&mut self, gpu: &mut Renderer, index: usize, target: &RenderTarget) -> bool {
        let Some(binding) = self.state.outputs.get_mut(index) else {
            return false;
        };

        if binding.layer.is_none() {
            tracing::debug!(output = %binding.monitor.name, "creating background surface");
            let output = binding.output.clone();
            let layer = self.state.create_layer(&self.qh, &output);
            if let Some(binding) = self.state.outputs.get_mut(index) {
                binding.layer = Some(LayerBinding {
                    layer,
                    state: SurfaceState::default(),
                    presentation: None,
                });
            }

            // Pick up the initial configure right away.
            if let Err(why) = self.queue.roundtrip(&mut self.state) {
                tracing::error!(?why, "roundtrip after surface creation failed");
                return false;
            }

            // The roundtrip may have changed the output list.
            let Some(moved) = self.state.outputs.iter().position(|b| b.output == output) else {
                return false;
            };
            return self.present(gpu, moved, target);
        }

        self.present(gpu, index, target)
    }

    fn present(&mut self, gpu: &mut Renderer, index: usize, target: &RenderTarget) -> bool {
        let Some(binding) = self.state.outputs.get_mut(index) else {
            return false;
        };
        let name = &binding.monitor.name;
        let Some(layer) = binding.layer.as_mut() else {
            return false;
        };

        let Some(presentation) = layer.presentation.as_mut() else {
            tracing::debug!(output = %name, "surface not configured yet");
            return true;
        };

        if !layer.state.try_begin_present() {
            tracing::trace!(output = %name, "present already in flight");
            return true;
        }

        let surface = match presentation.surface {
            Some(surface) => surface,
            None => {
                let window = presentation.window.ptr() as *mut c_void;
                let Some(surface) = gpu.create_window_surface(window) else {
                    tracing::error!(output = %name, "failed to create EGL surface for wallpaper");
                    layer.state.end_present(false);
                    return false;
                };
                presentation.surface = Some(surface);
                surface
            }
        };

        let Some((width, height)) = layer.state.size() else {
            layer.state.end_present(false);
            return false;
        };

        let presented = gpu.present_to_surface(surface, target, width, height);
        if presented {
            let wl_surface = layer.layer.wl_surface();
            wl_surface.frame(&self.qh, wl_surface.clone());
            wl_surface.damage_buffer(0, 0, width as i32, height as i32);
            wl_surface.commit();
        }
        layer.state.end_present(presented);

        tracing::debug!(output = %name, width, height, presented, "presented wallpaper");
        presented
    }

    fn release_retired(&mut self, gpu: &mut Renderer) {
        for layer in self.state.retired.drain(..) {
            layer.release(gpu);
        }
    }

    fn flush(&mut self) {
        if let Err(why) = self.conn.flush() {
            tracing::error!(?why, "failed to flush wayland connection");
        }
    }
}

impl DisplayBackend<Renderer> for WaylandBackend {
    fn destroy(&mut self, gpu: &mut Renderer) {
        self.release_retired(gpu);

        for binding in self.state.outputs.drain(..) {
            if let Some(layer) = binding.layer {
                layer.release(gpu);
            }
        }

        self.flush();
    }

    fn monitors(&self) -> Vec<Monitor> {
        self.state.outputs.iter().map(|b| b.monitor.clone()).collect()
    }

    fn set_wallpaper(&mut self, gpu: &mut Renderer, name: &str, target: &RenderTarget) -> bool {
        let index = match resolve_output(&self.monitors(), name) {
            Ok(OutputTarget::All) => return self.set_wallpaper_all(gpu, target),
            Ok(OutputTarget::Index(index)) => index,
            Err(not_found) => {
                not_found.log();
                return false;
            }
        };

        self.release_retired(gpu);

        let result = self.render_to_output(gpu, index, target);
        self.flush();
        result
    }

    fn set_wallpaper_all(&mut self, gpu: &mut Renderer, target: &RenderTarget) -> bool {
        self.release_retired(gpu);

        let outputs: Vec<WlOutput> = self.state.outputs.iter().map(|b| b.output.clone()).collect();

        let mut success = true;
        for output in outputs {
            let Some(index) = self.state.outputs.iter().position(|b| b.output == output) else {
                continue;
            };
            success &= self.render_to_output(gpu, index, target);
        }

        self.flush();
        success
    }

    fn process_events(&mut self) {
        let span = tracing::trace_span!("WaylandBackend::process_events");
        let _handle = span.enter();

        self.flush();

        if let Some(guard) = self.queue.prepare_read() {
            match guard.read() {
                Ok(_) => {}
                Err(WaylandError::Io(why)) if why.kind() == ErrorKind::WouldBlock => {}
                Err(why) => {
                    tracing::error!(?why, "lost the wayland connection");
                    self.state.should_quit = true;
                    return;
                }
            }
        }

        if let Err(why) = self.queue.dispatch_pending(&mut self.state) {
            tracing::error!(?why, "failed to dispatch wayland events");
            self.state.should_quit = true;
        }
    }

    fn should_quit(&self) -> bool {
        self.state.should_quit
    }
}

impl WaylandState {
    fn create_layer(&self, qh: &QueueHandle<Self>, output: &WlOutput) -> LayerSurface {
        let surface = self.compositor_state.create_surface(qh);

        let layer = self.layer_shell.create_layer_surface(
            qh,
            surface,
            Layer::Background,
            Some(LAYER_NAMESPACE),
            Some(output),
        );

        layer.set_size(0, 0);
        layer.set_anchor(Anchor::all());
        layer.set_exclusive_zone(-1);
        layer.set_keyboard_interactivity(KeyboardInteractivity::None);
        layer.commit();

        layer
    }

    /// Recomputes every monitor name after the output set changed.
    fn rename_outputs(&mut self) {
        let geometries: Vec<OutputGeometry> =
            self.outputs.iter().map(|b| b.geometry.clone()).collect();
        let names = output_names(&geometries);

        for (index, (binding, name)) in self.outputs.iter_mut().zip(names).enumerate() {
            let geometry = &binding.geometry;
            binding.monitor = Monitor {
                name,
                x: geometry.x,
                y: geometry.y,
                width: geometry.width,
                height: geometry.height,
                refresh_rate: geometry.refresh_rate,
                primary: index == 0,
            };
        }
    }

    fn binding_for_layer(&mut self, layer: &LayerSurface) -> Option<&mut OutputBinding> {
        self.outputs
            .iter_mut()
            .find(|b| b.layer.as_ref().is_some_and(|l| &l.layer == layer))
    }
}

impl CompositorHandler for WaylandState {
    fn scale_factor_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _new_factor: i32,
    ) {
    }

    fn transform_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _new_transform: wl_output::Transform,
    ) {
    }

    fn frame(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        surface: &wl_surface::WlSurface,
        _time: u32,
    ) {
        if let Some(layer) = self
            .outputs
            .iter_mut()
            .filter_map(|b| b.layer.as_mut())
            .find(|l| l.layer.wl_surface() == surface)
        {
            layer.state.frame_done();
        }
    }

    fn surface_enter(
        &mut self,
        _: &Connection,
        _: &QueueHandle<Self>,
        _: &wl_surface::WlSurface,
        _: &WlOutput,
    ) {
    }

    fn surface_leave(
        &mut self,
        _: &Connection,
        _: &QueueHandle<Self>,
        _: &wl_surface::WlSurface,
        _: &WlOutput,
    ) {
    }
}

impl OutputHandler for WaylandState {
    fn output_state(&mut self) -> &mut OutputState {
        &mut self.output_state
    }

    fn new_output(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, output: WlOutput) {
        let Some(info) = self.output_state.info(&output) else {
            return;
        };

        let geometry = OutputGeometry::from_info(&info);
        tracing::debug!(
            name = ?geometry.name,
            id = output.id().protocol_id(),
            "new output"
        );

        self.outputs.push(OutputBinding {
            output,
            monitor: Monitor {
                name: String::new(),
                x: geometry.x,
                y: geometry.y,
                width: geometry.width,
                height: geometry.height,
                refresh_rate: geometry.refresh_rate,
                primary: false,
            },
            geometry,
            layer: None,
        });
        self.rename_outputs();
    }

    fn update_output(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, output: WlOutput) {
        let Some(info) = self.output_state.info(&output) else {
            return;
        };

        if let Some(binding) = self.outputs.iter_mut().find(|b| b.output == output) {
            binding.geometry = OutputGeometry::from_info(&info);
            self.rename_outputs();
        }
    }

    fn output_destroyed(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, output: WlOutput) {
        let Some(position) = self.outputs.iter().position(|b| b.output == output) else {
            return;
        };

        let binding = self.outputs.remove(position);
        tracing::info!(output = %binding.monitor.name, "output removed");

        // The EGL surface must go before the window and the layer.
        if let Some(layer) = binding.layer {
            self.retired.push(layer);
        }
        self.rename_outputs();
    }
}

impl LayerShellHandler for WaylandState {
    fn closed(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, layer: &LayerSurface) {
        let name = self
            .binding_for_layer(layer)
            .map(|b| b.monitor.name.clone())
            .unwrap_or_default();
        tracing::warn!(output = %name, "layer surface closed by the compositor");
        self.should_quit = true;
    }

    fn configure(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        layer: &LayerSurface,
        configure: LayerSurfaceConfigure,
        _serial: u32,
    ) {
        let span = tracing::debug_span!("<WaylandState as LayerShellHandler>::configure");
        let _handle = span.enter();

        let Some(binding) = self.binding_for_layer(layer) else {
            return;
        };

        let (mut width, mut height) = configure.new_size;
        if width == 0 {
            width = binding.monitor.width;
        }
        if height == 0 {
            height = binding.monitor.height;
        }

        let name = binding.monitor.name.clone();
        let Some(layer_binding) = binding.layer.as_mut() else {
            return;
        };

        match layer_binding.state.configure(width, height) {
            Resize::Allocate { width, height } => {
                match WlEglSurface::new(layer.wl_surface().id(), width as i32, height as i32) {
                    Ok(window) => {
                        tracing::debug!(output = %name, width, height, "allocated EGL window");
                        layer_binding.presentation = Some(Presentation {
                            window,
                            surface: None,
                        });
                    }
                    Err(why) => {
                        tracing::error!(?why, output = %name, "failed to create EGL window");
                    }
                }
            }
            Resize::Resize { width, height } => {
                tracing::debug!(output = %name, width, height, "resizing EGL window");
                if let Some(presentation) = &layer_binding.presentation {
                    presentation
                        .window
                        .resize(width as i32, height as i32, 0, 0);
                }
            }
            Resize::Unchanged => {}
        }
    }
}

impl ProvidesRegistryState for WaylandState {
    fn registry(&mut self) -> &mut RegistryState {
        &mut self.registry_state
    }
    registry_handlers![OutputState];
}

delegate_compositor!(WaylandState);
delegate_output!(WaylandState);
delegate_layer!(WaylandState);
delegate_registry!(WaylandState);

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(name: Option<&str>, width: u32, height: u32, x: i32, y: i32) -> OutputGeometry {
        OutputGeometry {
            name: name.map(str::to_owned),
            x,
            y,
            width,
            height,
            refresh_rate: 60,
        }
    }

    #[test]
    fn teardown_releases_the_egl_surface_first() {
        use std::{cell::RefCell, rc::Rc};

        struct Dropped(&'static str, Rc<RefCell<Vec<&'static str>>>);

        impl Drop for Dropped {
            fn drop(&mut self) {
                self.1.borrow_mut().push(self.0);
            }
        }

        let order = Rc::new(RefCell::new(Vec::new()));
        let layer = Dropped("layer", Rc::clone(&order));
        let window = Dropped("window", Rc::clone(&order));

        teardown(layer, Some(window), Some("surface"), |surface| {
            order.borrow_mut().push(surface);
        });

        assert_eq!(*order.borrow(), vec!["surface", "window", "layer"]);
    }

    #[test]
    fn teardown_without_a_presentation_drops_the_layer() {
        use std::{cell::RefCell, rc::Rc};

        struct Dropped(Rc<RefCell<bool>>);

        impl Drop for Dropped {
            fn drop(&mut self) {
                *self.0.borrow_mut() = true;
            }
        }

        let dropped = Rc::new(RefCell::new(false));
        let mut destroyed = false;
        teardown(
            Dropped(Rc::clone(&dropped)),
            None::<()>,
            None::<u32>,
            |_| destroyed = true,
        );

        assert!(*dropped.borrow());
        assert!(!destroyed);
    }

    #[test]
    fn unknown_output_among_synthetic_names() {
        let names = output_names(&[
            geometry(None, 1920, 1080, 0, 0),
            geometry(None, 1920, 1080, 1920, 0),
        ]);
        let monitors: Vec<Monitor> = names
            .into_iter()
            .map(|name| Monitor {
                name,
                x: 0,
                y: 0,
                width: 1920,
                height: 1080,
                refresh_rate: 60,
                primary: false,
            })
            .collect();

        assert_eq!(
            resolve_output(&monitors, "OUTPUT-1920x1080-1920+0"),
            Ok(OutputTarget::Index(1))
        );

        let err = resolve_output(&monitors, "HDMI-A-1").unwrap_err();
        let names: Vec<String> = monitors.iter().map(|m| m.name.clone()).collect();
        assert_eq!(err.available, names);
    }

    #[test]
    fn reported_names_are_kept() {
        let outputs = [
            geometry(Some("DP-1"), 2560, 1440, 0, 0),
            geometry(Some("eDP-1"), 1920, 1080, 2560, 0),
        ];
        assert_eq!(output_names(&outputs), vec!["DP-1", "eDP-1"]);
    }

    #[test]
    fn lone_unnamed_output_gets_the_fixed_name() {
        assert_eq!(
            output_names(&[geometry(None, 1920, 1080, 0, 0)]),
            vec![SINGLE_OUTPUT_NAME]
        );
        assert_eq!(
            output_names(&[geometry(Some("Unknown"), 1920, 1080, 0, 0)]),
            vec![SINGLE_OUTPUT_NAME]
        );
    }

    #[test]
    fn unnamed_outputs_are_named_by_mode_and_position() {
        let outputs = [
            geometry(None, 1920, 1080, 0, 0),
            geometry(None, 1920, 1080, 1920, 0),
            geometry(None, 1280, 1024, 0, 0),
        ];
        assert_eq!(
            output_names(&outputs),
            vec!["OUTPUT-1920x1080", "OUTPUT-1920x1080-1920+0", "OUTPUT-1280x1024"]
        );
    }

    #[test]
    fn identical_outputs_are_disambiguated_by_index() {
        let outputs = [
            geometry(None, 1920, 1080, 0, 0),
            geometry(None, 1920, 1080, 0, 0),
            geometry(None, 1920, 1080, 0, 0),
        ];
        assert_eq!(
            output_names(&outputs),
            vec!["OUTPUT-1920x1080", "OUTPUT-1920x1080-1", "OUTPUT-1920x1080-2"]
        );
    }

    #[test]
    fn naming_is_deterministic() {
        let outputs = [
            geometry(None, 3840, 2160, 0, 0),
            geometry(Some("HDMI-A-2"), 1920, 1080, 3840, 0),
            geometry(None, 3840, 2160, 0, 0),
        ];
        assert_eq!(output_names(&outputs), output_names(&outputs));
        assert_eq!(output_names(&outputs)[2], "OUTPUT-3840x2160-1");
    }
}
