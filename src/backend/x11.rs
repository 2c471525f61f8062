// SPDX-License-Identifier: MPL-2.0

//! Root window backend. Every frame is read back from the GPU and published
//! as the root window's background pixmap.

use eyre::{OptionExt, WrapErr, eyre};
use x11rb::{
    connection::{Connection, RequestConnection},
    protocol::{
        randr::{self, ConnectionExt as _},
        xproto::{
            Atom, AtomEnum, ChangeWindowAttributesAux, ConnectionExt as _, CreateGCAux,
            ImageFormat, Pixmap, PropMode, Window,
        },
    },
    rust_connection::RustConnection,
    wrapper::ConnectionExt as _,
};

use super::{DisplayBackend, Monitor, OutputTarget, resolve_output};
use crate::gpu::{RenderTarget, Renderer};

const DEFAULT_REFRESH_RATE: u32 = 60;

/// Fixed size of a PutImage request header.
const PUT_IMAGE_HEADER: usize = 24;

pub struct X11Backend {
    conn: RustConnection,
    root: Window,
    depth: u8,
    atoms: RootAtoms,
    monitors: Vec<Monitor>,
    /// Pixmap currently installed as the root background.
    pixmap: Option<Pixmap>,
    warned_named_output: bool,
    should_quit: bool,
}

/// Properties other desktop tools read the root pixmap from.
#[derive(Debug, Clone, Copy)]
struct RootAtoms {
    xrootpmap_id: Atom,
    esetroot_pmap_id: Atom,
}

impl RootAtoms {
    fn published(self) -> [Atom; 2] {
        [self.xrootpmap_id, self.esetroot_pmap_id]
    }
}

impl X11Backend {
    /// Connects to the X server named by `DISPLAY` and enumerates its monitors.
    pub fn initialize() -> eyre::Result<Self> {
        let (conn, screen_num) = x11rb::connect(None).wrap_err("failed to open X11 display")?;

        let screen = conn
            .setup()
            .roots
            .get(screen_num)
            .ok_or_eyre("X11 screen not found")?;
        let root = screen.root;
        let depth = screen.root_depth;
        let (screen_width, screen_height) = (screen.width_in_pixels, screen.height_in_pixels);

        if depth != 24 && depth != 32 {
            return Err(eyre!("unsupported root window depth {depth}"));
        }

        let atoms = RootAtoms {
            xrootpmap_id: intern(&conn, "_XROOTPMAP_ID")?,
            esetroot_pmap_id: intern(&conn, "ESETROOT_PMAP_ID")?,
        };

        let monitors = match query_randr_monitors(&conn, root) {
            Ok(monitors) if !monitors.is_empty() => monitors,
            Ok(_) => {
                tracing::debug!("RandR reports no connected outputs");
                vec![whole_screen(screen_width, screen_height)]
            }
            Err(why) => {
                tracing::debug!(?why, "RandR unavailable, using screen dimensions");
                vec![whole_screen(screen_width, screen_height)]
            }
        };

        tracing::info!(screen = screen_num, depth, "X11 backend initialized");

        Ok(Self {
            conn,
            root,
            depth,
            atoms,
            monitors,
            pixmap: None,
            warned_named_output: false,
            should_quit: false,
        })
    }

    /// Uploads bottom-up RGBA pixels into a new pixmap and installs it as the
    /// root background.
    fn publish(&mut self, rgba: &[u8], width: u32, height: u32) -> eyre::Result<()> {
        let (Ok(pixmap_width), Ok(pixmap_height)) = (u16::try_from(width), u16::try_from(height))
        else {
            return Err(eyre!("{width}x{height} exceeds the X11 pixmap size limit"));
        };

        let data = to_native_rows(rgba, width as usize, height as usize);
        let stride = width as usize * 4;
        let conn = &self.conn;

        let pixmap = conn.generate_id()?;
        conn.create_pixmap(self.depth, pixmap, self.root, pixmap_width, pixmap_height)?;

        let gc = conn.generate_id()?;
        conn.create_gc(gc, pixmap, &CreateGCAux::new())?;

        for (y, rows) in bands(height, stride, conn.maximum_request_bytes()) {
            let start = y as usize * stride;
            let end = start + rows as usize * stride;
            conn.put_image(
                ImageFormat::Z_PIXMAP,
                pixmap,
                gc,
                pixmap_width,
                rows as u16,
                0,
                y as i16,
                0,
                self.depth,
                &data[start..end],
            )?;
        }

        conn.free_gc(gc)?;

        conn.change_window_attributes(
            self.root,
            &ChangeWindowAttributesAux::new().background_pixmap(pixmap),
        )?;
        conn.clear_area(false, self.root, 0, 0, 0, 0)?;

        for atom in self.atoms.published() {
            conn.change_property32(PropMode::REPLACE, self.root, atom, AtomEnum::PIXMAP, &[pixmap])?;
        }

        if let Some(previous) = self.pixmap.replace(pixmap) {
            conn.free_pixmap(previous)?;
        }

        conn.flush()?;
        Ok(())
    }

    /// Withdraws the root pixmap properties that still name our pixmap. The
    /// server frees the pixmap with the connection, so they would dangle.
    fn unpublish(&mut self) -> eyre::Result<()> {
        let Some(pixmap) = self.pixmap.take() else {
            return Ok(());
        };
        let conn = &self.conn;

        for atom in self.atoms.published() {
            let reply = conn
                .get_property(false, self.root, atom, AtomEnum::PIXMAP, 0, 1)?
                .reply()?;
            let value: Vec<u32> = reply.value32().map(Iterator::collect).unwrap_or_default();
            if names_pixmap(&value, pixmap) {
                conn.delete_property(self.root, atom)?;
            }
        }

        conn.free_pixmap(pixmap)?;
        conn.flush()?;
        Ok(())
    }
}

impl DisplayBackend<Renderer> for X11Backend {
    fn destroy(&mut self, _gpu: &mut Renderer) {
        if let Err(why) = self.unpublish() {
            tracing::warn!(?why, "failed to withdraw root pixmap properties");
        }
    }

    fn monitors(&self) -> Vec<Monitor> {
        self.monitors.clone()
    }

    fn set_wallpaper(&mut self, gpu: &mut Renderer, name: &str, target: &RenderTarget) -> bool {
        match resolve_output(&self.monitors, name) {
            Ok(OutputTarget::All) => {}
            Ok(OutputTarget::Index(_)) => {
                if !self.warned_named_output {
                    tracing::warn!(
                        output = name,
                        "per-output wallpapers are not supported on X11, setting all outputs"
                    );
                    self.warned_named_output = true;
                }
            }
            Err(not_found) => {
                not_found.log();
                return false;
            }
        }

        self.set_wallpaper_all(gpu, target)
    }

    fn set_wallpaper_all(&mut self, gpu: &mut Renderer, target: &RenderTarget) -> bool {
        let span = tracing::debug_span!("X11Backend::set_wallpaper_all", width = target.width, height = target.height);
        let _handle = span.enter();

        let Some(pixels) = gpu.read_pixels(target) else {
            tracing::error!("failed to read back wallpaper texture");
            return false;
        };

        match self.publish(&pixels, target.width, target.height) {
            Ok(()) => true,
            Err(why) => {
                tracing::error!(?why, "failed to set root window background");
                false
            }
        }
    }

    fn process_events(&mut self) {
        loop {
            match self.conn.poll_for_event() {
                Ok(Some(event)) => tracing::trace!(?event, "x11 event"),
                Ok(None) => break,
                Err(why) => {
                    tracing::error!(?why, "lost the X11 connection");
                    self.should_quit = true;
                    break;
                }
            }
        }
    }

    fn should_quit(&self) -> bool {
        self.should_quit
    }
}

fn intern(conn: &RustConnection, name: &str) -> eyre::Result<Atom> {
    Ok(conn
        .intern_atom(false, name.as_bytes())?
        .reply()
        .wrap_err_with(|| format!("failed to intern {name}"))?
        .atom)
}

fn whole_screen(width: u16, height: u16) -> Monitor {
    Monitor {
        name: "Screen".to_owned(),
        x: 0,
        y: 0,
        width: u32::from(width),
        height: u32::from(height),
        refresh_rate: DEFAULT_REFRESH_RATE,
        primary: true,
    }
}

/// Connected RandR outputs that drive a CRTC.
fn query_randr_monitors(conn: &RustConnection, root: Window) -> eyre::Result<Vec<Monitor>> {
    if conn
        .extension_information(randr::X11_EXTENSION_NAME)?
        .is_none()
    {
        return Err(eyre!("RandR extension not present"));
    }

    let resources = conn.randr_get_screen_resources_current(root)?.reply()?;
    let primary = conn.randr_get_output_primary(root)?.reply()?.output;

    let mut monitors = Vec::new();
    for &output in &resources.outputs {
        let info = conn
            .randr_get_output_info(output, resources.config_timestamp)?
            .reply()?;

        if info.connection != randr::Connection::CONNECTED || info.crtc == 0 {
            continue;
        }

        let crtc = conn
            .randr_get_crtc_info(info.crtc, resources.config_timestamp)?
            .reply()?;

        let refresh_rate = resources
            .modes
            .iter()
            .find(|mode| mode.id == crtc.mode)
            .map_or(DEFAULT_REFRESH_RATE, |mode| {
                refresh_rate(mode.dot_clock, mode.htotal, mode.vtotal)
            });

        monitors.push(Monitor {
            name: String::from_utf8_lossy(&info.name).into_owned(),
            x: i32::from(crtc.x),
            y: i32::from(crtc.y),
            width: u32::from(crtc.width),
            height: u32::from(crtc.height),
            refresh_rate,
            primary: output == primary,
        });
    }

    Ok(monitors)
}

/// Refresh rate of a mode line, rounded to whole hertz.
/// Whether a root pixmap property value still points at `pixmap`.
pub(crate) fn names_pixmap(value: &[u32], pixmap: Pixmap) -> bool {
    value.first() == Some(&pixmap)
}

pub(crate) fn refresh_rate(dot_clock: u32, htotal: u16, vtotal: u16) -> u32 {
    let total = u64::from(htotal) * u64::from(vtotal);
    if dot_clock == 0 || total == 0 {
        return DEFAULT_REFRESH_RATE;
    }
    ((u64::from(dot_clock) + total / 2) / total) as u32
}

/// Flips bottom-up RGBA rows to top-down and reorders each pixel to the
/// server's little-endian BGRX layout.
pub(crate) fn to_native_rows(rgba: &[u8], width: usize, height: usize) -> Vec<u8> {
    let stride = width * 4;
    if stride == 0 {
        return Vec::new();
    }

    let mut native = Vec::with_capacity(stride * height);
    for row in rgba.chunks_exact(stride).take(height).rev() {
        for pixel in row.chunks_exact(4) {
            native.extend_from_slice(&[pixel[2], pixel[1], pixel[0], 0xff]);
        }
    }
    native
}

/// Splits `height` rows into `(first_row, row_count)` bands that each fit in
/// a single PutImage request.
pub(crate) fn bands(
    height: u32,
    stride: usize,
    max_request_bytes: usize,
) -> impl Iterator<Item = (u32, u32)> {
    let budget = max_request_bytes.saturating_sub(PUT_IMAGE_HEADER);
    let rows_per_band = (budget / stride.max(1)).clamp(1, u16::MAX as usize) as u32;

    (0..height)
        .step_by(rows_per_band as usize)
        .map(move |y| (y, rows_per_band.min(height - y)))
}
