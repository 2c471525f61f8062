// SPDX-License-Identifier: MPL-2.0

use std::{ffi::c_void, num::NonZeroU32};

use eyre::{OptionExt, WrapErr, eyre};
use glow::HasContext;
use khronos_egl as egl;

use super::{FramebufferCache, RenderTarget, SurfaceProvider};

/// `EGL_PLATFORM_WAYLAND_KHR`
const PLATFORM_WAYLAND: egl::Enum = 0x31D8;

const SURFACELESS_EXTENSION: &str = "EGL_KHR_surfaceless_context";

const CONFIG_ATTRIBS: [egl::Int; 13] = [
    egl::SURFACE_TYPE,
    egl::PBUFFER_BIT | egl::WINDOW_BIT,
    egl::RENDERABLE_TYPE,
    egl::OPENGL_BIT,
    egl::RED_SIZE,
    8,
    egl::GREEN_SIZE,
    8,
    egl::BLUE_SIZE,
    8,
    egl::ALPHA_SIZE,
    8,
    egl::NONE,
];

const WINDOW_CONFIG_ATTRIBS: [egl::Int; 11] = [
    egl::SURFACE_TYPE,
    egl::WINDOW_BIT,
    egl::RENDERABLE_TYPE,
    egl::OPENGL_BIT,
    egl::RED_SIZE,
    8,
    egl::GREEN_SIZE,
    8,
    egl::BLUE_SIZE,
    8,
    egl::NONE,
];

/// Context versions tried in order: 3.3 core, 3.0, then whatever the driver offers.
const CONTEXT_ATTEMPTS: [&[egl::Int]; 3] = [
    &[
        egl::CONTEXT_MAJOR_VERSION,
        3,
        egl::CONTEXT_MINOR_VERSION,
        3,
        egl::CONTEXT_OPENGL_PROFILE_MASK,
        egl::CONTEXT_OPENGL_CORE_PROFILE_BIT,
        egl::NONE,
    ],
    &[egl::CONTEXT_MAJOR_VERSION, 3, egl::CONTEXT_MINOR_VERSION, 0, egl::NONE],
    &[egl::NONE],
];

const QUAD_VERTEX_SHADER: &str = r"#version 330 core
layout (location = 0) in vec2 aPos;
layout (location = 1) in vec2 aTexCoord;

out vec2 TexCoord;

void main() {
    gl_Position = vec4(aPos, 0.0, 1.0);
    TexCoord = aTexCoord;
}
";

const QUAD_FRAGMENT_SHADER: &str = r"#version 330 core
out vec4 FragColor;

in vec2 TexCoord;
uniform sampler2D wallpaper;

void main() {
    FragColor = texture(wallpaper, TexCoord);
}
";

#[rustfmt::skip]
const QUAD_VERTICES: [f32; 16] = [
    // position   // uv
    -1.0,  1.0,   0.0, 1.0,
    -1.0, -1.0,   0.0, 0.0,
     1.0, -1.0,   1.0, 0.0,
     1.0,  1.0,   1.0, 1.0,
];

const QUAD_INDICES: [u32; 6] = [0, 1, 2, 0, 2, 3];

/// Native display the EGL context is created on.
#[derive(Debug, Clone, Copy)]
pub enum NativeDisplay {
    /// A `wl_display` pointer owned by the compositor backend.
    Wayland(*mut c_void),
    /// `EGL_DEFAULT_DISPLAY`, used for the X11 session.
    Default,
}

/// Presentation drawable created from a native window.
pub type WindowSurface = egl::Surface;

/// Resolves GL entry points for the media engine's own renderer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcAddressResolver;

impl ProcAddressResolver {
    #[must_use]
    pub fn resolve(&self, name: &str) -> *mut c_void {
        egl::API
            .get_proc_address(name)
            .map_or(std::ptr::null_mut(), |f| f as *mut c_void)
    }
}

/// Program and geometry used to blit a texture onto a window surface.
struct Quad {
    program: glow::NativeProgram,
    vertex_array: glow::NativeVertexArray,
    vertex_buffer: glow::NativeBuffer,
    index_buffer: glow::NativeBuffer,
    sampler: Option<glow::UniformLocation>,
}

pub struct Renderer {
    display: egl::Display,
    config: egl::Config,
    context: egl::Context,
    /// 1x1 drawable kept current when the platform lacks surfaceless contexts.
    pbuffer: Option<egl::Surface>,
    gl: glow::Context,
    targets: FramebufferCache<RenderTarget>,
    quad: Option<Quad>,
}

impl Renderer {
    /// Creates an off-screen GL context on `native` and makes it current.
    pub fn new(native: NativeDisplay) -> eyre::Result<Self> {
        let egl = &egl::API;

        let display = open_display(native)?;
        let (major, minor) = egl
            .initialize(display)
            .wrap_err("failed to initialize EGL display")?;

        let extensions = egl
            .query_string(Some(display), egl::EXTENSIONS)
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let surfaceless = has_extension(&extensions, SURFACELESS_EXTENSION);

        tracing::info!(major, minor, surfaceless, "EGL initialized");

        egl.bind_api(egl::OPENGL_API)
            .wrap_err("failed to bind the OpenGL API")?;

        let config = match egl.choose_first_config(display, &CONFIG_ATTRIBS) {
            Ok(Some(config)) => config,
            _ => egl
                .choose_first_config(display, &WINDOW_CONFIG_ATTRIBS)
                .wrap_err("eglChooseConfig failed")?
                .ok_or_eyre("no OpenGL capable EGL config")?,
        };

        let context = CONTEXT_ATTEMPTS
            .iter()
            .find_map(|attribs| match egl.create_context(display, config, None, attribs) {
                Ok(context) => Some(context),
                Err(why) => {
                    tracing::debug!(?why, ?attribs, "context attempt failed");
                    None
                }
            })
            .ok_or_eyre("failed to create an OpenGL context")?;

        let pbuffer = if surfaceless
            && egl.make_current(display, None, None, Some(context)).is_ok()
        {
            None
        } else {
            let surface = egl
                .create_pbuffer_surface(display, config, &[egl::WIDTH, 1, egl::HEIGHT, 1, egl::NONE])
                .wrap_err("failed to create 1x1 pbuffer surface")?;
            egl.make_current(display, Some(surface), Some(surface), Some(context))
                .wrap_err("failed to make the pbuffer context current")?;
            Some(surface)
        };

        if egl.get_proc_address("glGenFramebuffers").is_none()
            || egl.get_proc_address("glCreateShader").is_none()
            || egl.get_proc_address("glGenVertexArrays").is_none()
        {
            return Err(eyre!("failed to load OpenGL entry points"));
        }

        let gl = unsafe {
            glow::Context::from_loader_function(|name| {
                egl.get_proc_address(name)
                    .map_or(std::ptr::null(), |f| f as *const c_void)
            })
        };

        unsafe {
            tracing::info!(
                vendor = %gl.get_parameter_string(glow::VENDOR),
                renderer = %gl.get_parameter_string(glow::RENDERER),
                version = %gl.get_parameter_string(glow::VERSION),
                "OpenGL context created"
            );
        }

        Ok(Self {
            display,
            config,
            context,
            pbuffer,
            gl,
            targets: FramebufferCache::default(),
            quad: None,
        })
    }

    /// Makes the off-screen context current again.
    pub fn make_current(&self) -> bool {
        egl::API
            .make_current(self.display, self.pbuffer, self.pbuffer, Some(self.context))
            .inspect_err(|why| tracing::error!(?why, "eglMakeCurrent failed"))
            .is_ok()
    }

    /// Creates an empty RGBA texture.
    #[allow(dead_code)]
    pub fn create_texture(&mut self, width: u32, height: u32) -> Option<u32> {
        unsafe {
            let texture = self
                .gl
                .create_texture()
                .inspect_err(|why| tracing::error!(%why, "glGenTextures failed"))
                .ok()?;
            self.gl.bind_texture(glow::TEXTURE_2D, Some(texture));
            self.gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                glow::RGBA as i32,
                width as i32,
                height as i32,
                0,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                None,
            );
            set_linear_filtering(&self.gl);
            self.gl.bind_texture(glow::TEXTURE_2D, None);
            Some(texture.0.get())
        }
    }

    /// Replaces the contents of `texture` with tightly packed RGBA pixels.
    #[allow(dead_code)]
    pub fn update_texture(&mut self, texture: u32, width: u32, height: u32, rgba: &[u8]) -> bool {
        let Some(texture) = texture_handle(texture) else {
            return false;
        };

        if rgba.len() < width as usize * height as usize * 4 {
            tracing::error!(len = rgba.len(), width, height, "texture data too short");
            return false;
        }

        unsafe {
            self.gl.bind_texture(glow::TEXTURE_2D, Some(texture));
            self.gl.tex_sub_image_2d(
                glow::TEXTURE_2D,
                0,
                0,
                0,
                width as i32,
                height as i32,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                glow::PixelUnpackData::Slice(rgba),
            );
            self.gl.bind_texture(glow::TEXTURE_2D, None);
        }

        self.check_gl_error("update_texture")
    }

    #[allow(dead_code)]
    pub fn destroy_texture(&mut self, texture: u32) {
        if let Some(texture) = texture_handle(texture) {
            unsafe { self.gl.delete_texture(texture) };
        }
    }

    /// Compiles and links a program. Failures are logged and yield `None`.
    pub fn create_program(&self, vertex: &str, fragment: &str) -> Option<glow::NativeProgram> {
        let gl = &self.gl;

        let vertex_shader = compile_shader(gl, glow::VERTEX_SHADER, vertex);
        let fragment_shader = compile_shader(gl, glow::FRAGMENT_SHADER, fragment);

        let (Some(vertex_shader), Some(fragment_shader)) = (vertex_shader, fragment_shader) else {
            unsafe {
                vertex_shader.into_iter().for_each(|s| gl.delete_shader(s));
                fragment_shader.into_iter().for_each(|s| gl.delete_shader(s));
            }
            return None;
        };

        unsafe {
            let program = match gl.create_program() {
                Ok(program) => program,
                Err(why) => {
                    tracing::error!(%why, "glCreateProgram failed");
                    gl.delete_shader(vertex_shader);
                    gl.delete_shader(fragment_shader);
                    return None;
                }
            };

            gl.attach_shader(program, vertex_shader);
            gl.attach_shader(program, fragment_shader);
            gl.link_program(program);

            let linked = gl.get_program_link_status(program);
            if !linked {
                tracing::error!(log = %gl.get_program_info_log(program), "program link failed");
            }

            gl.detach_shader(program, vertex_shader);
            gl.detach_shader(program, fragment_shader);
            gl.delete_shader(vertex_shader);
            gl.delete_shader(fragment_shader);

            if linked {
                Some(program)
            } else {
                gl.delete_program(program);
                None
            }
        }
    }

    /// Wraps a native window (a `wl_egl_window`) in an EGL surface.
    pub fn create_window_surface(&mut self, window: *mut c_void) -> Option<WindowSurface> {
        if window.is_null() {
            tracing::error!("invalid native window");
            return None;
        }

        let surface = unsafe {
            egl::API.create_window_surface(self.display, self.config, window, None)
        };

        match surface {
            Ok(surface) => {
                tracing::debug!("created EGL window surface");
                Some(surface)
            }
            Err(why) => {
                tracing::error!(?why, "eglCreateWindowSurface failed");
                None
            }
        }
    }

    pub fn destroy_window_surface(&mut self, surface: WindowSurface) {
        if let Err(why) = egl::API.destroy_surface(self.display, surface) {
            tracing::warn!(?why, "eglDestroySurface failed");
        }
    }

    /// Draws `target`'s texture over the whole of `surface` and swaps it.
    /// The previously current drawables are restored before returning.
    pub fn present_to_surface(
        &mut self,
        surface: WindowSurface,
        target: &RenderTarget,
        width: u32,
        height: u32,
    ) -> bool {
        let span = tracing::debug_span!("Renderer::present_to_surface", width, height);
        let _handle = span.enter();

        let Some(texture) = texture_handle(target.texture) else {
            return false;
        };

        let egl = &egl::API;
        let previous_draw = egl.get_current_surface(egl::DRAW);
        let previous_read = egl.get_current_surface(egl::READ);

        if let Err(why) =
            egl.make_current(self.display, Some(surface), Some(surface), Some(self.context))
        {
            tracing::error!(?why, "eglMakeCurrent for window surface failed");
            return false;
        }

        if let Err(why) = egl.swap_interval(self.display, 0) {
            tracing::debug!(?why, "eglSwapInterval failed");
        }

        let drawn = self.draw_quad(texture, width, height);

        let swapped = drawn
            && egl
                .swap_buffers(self.display, surface)
                .inspect_err(|why| tracing::error!(?why, "eglSwapBuffers failed"))
                .is_ok();

        if let Err(why) = egl.make_current(
            self.display,
            previous_draw,
            previous_read,
            Some(self.context),
        ) {
            tracing::error!(?why, "failed to restore the previous EGL surface");
            self.make_current();
        }

        swapped
    }

    /// Reads back `target` as bottom-up RGBA rows.
    pub fn read_pixels(&mut self, target: &RenderTarget) -> Option<Vec<u8>> {
        let framebuffer = framebuffer_handle(target.framebuffer)?;
        let mut pixels = vec![0u8; target.width as usize * target.height as usize * 4];

        unsafe {
            self.gl.bind_framebuffer(glow::FRAMEBUFFER, Some(framebuffer));
            self.gl.pixel_store_i32(glow::PACK_ALIGNMENT, 1);
            self.gl.read_pixels(
                0,
                0,
                target.width as i32,
                target.height as i32,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                glow::PixelPackData::Slice(&mut pixels),
            );
            self.gl.bind_framebuffer(glow::FRAMEBUFFER, None);
        }

        self.check_gl_error("read_pixels").then_some(pixels)
    }

    fn draw_quad(&mut self, texture: glow::NativeTexture, width: u32, height: u32) -> bool {
        if self.quad.is_none() {
            self.quad = self.create_quad();
        }

        let Some(quad) = &self.quad else {
            tracing::error!("failed to create wallpaper shader program");
            return false;
        };

        let gl = &self.gl;
        unsafe {
            gl.bind_framebuffer(glow::FRAMEBUFFER, None);
            gl.viewport(0, 0, width as i32, height as i32);
            gl.clear_color(0.0, 0.0, 0.0, 1.0);
            gl.clear(glow::COLOR_BUFFER_BIT);

            gl.use_program(Some(quad.program));
            gl.active_texture(glow::TEXTURE0);
            gl.bind_texture(glow::TEXTURE_2D, Some(texture));
            gl.uniform_1_i32(quad.sampler.as_ref(), 0);

            gl.bind_vertex_array(Some(quad.vertex_array));
            gl.draw_elements(glow::TRIANGLES, QUAD_INDICES.len() as i32, glow::UNSIGNED_INT, 0);
            gl.bind_vertex_array(None);
            gl.bind_texture(glow::TEXTURE_2D, None);
            gl.use_program(None);
        }

        self.check_gl_error("draw_quad")
    }

    fn create_quad(&self) -> Option<Quad> {
        let program = self.create_program(QUAD_VERTEX_SHADER, QUAD_FRAGMENT_SHADER)?;
        let gl = &self.gl;

        unsafe {
            let (Ok(vertex_array), Ok(vertex_buffer), Ok(index_buffer)) = (
                gl.create_vertex_array(),
                gl.create_buffer(),
                gl.create_buffer(),
            ) else {
                tracing::error!("failed to allocate quad buffers");
                gl.delete_program(program);
                return None;
            };

            gl.bind_vertex_array(Some(vertex_array));

            gl.bind_buffer(glow::ARRAY_BUFFER, Some(vertex_buffer));
            gl.buffer_data_u8_slice(
                glow::ARRAY_BUFFER,
                bytemuck::cast_slice(&QUAD_VERTICES),
                glow::STATIC_DRAW,
            );

            gl.bind_buffer(glow::ELEMENT_ARRAY_BUFFER, Some(index_buffer));
            gl.buffer_data_u8_slice(
                glow::ELEMENT_ARRAY_BUFFER,
                bytemuck::cast_slice(&QUAD_INDICES),
                glow::STATIC_DRAW,
            );

            let stride = 4 * std::mem::size_of::<f32>() as i32;
            gl.vertex_attrib_pointer_f32(0, 2, glow::FLOAT, false, stride, 0);
            gl.enable_vertex_attrib_array(0);
            gl.vertex_attrib_pointer_f32(1, 2, glow::FLOAT, false, stride, 2 * 4);
            gl.enable_vertex_attrib_array(1);

            gl.bind_vertex_array(None);

            let sampler = gl.get_uniform_location(program, "wallpaper");

            Some(Quad {
                program,
                vertex_array,
                vertex_buffer,
                index_buffer,
                sampler,
            })
        }
    }

    fn check_gl_error(&self, operation: &str) -> bool {
        let error = unsafe { self.gl.get_error() };
        if error == glow::NO_ERROR {
            true
        } else {
            tracing::error!(operation, error = format_args!("{error:#x}"), "OpenGL error");
            false
        }
    }
}

impl SurfaceProvider for Renderer {
    fn make_current(&mut self) -> bool {
        Renderer::make_current(self)
    }

    fn get_or_create_framebuffer(&mut self, width: u32, height: u32) -> Option<RenderTarget> {
        let gl = &self.gl;
        self.targets
            .get_or_create(width, height, |width, height| {
                tracing::debug!(width, height, "allocating render target");
                allocate_target(gl, width, height)
            })
            .inspect_err(|why| tracing::error!(%why, width, height, "render target allocation failed"))
            .ok()
    }

    fn bind_framebuffer(&mut self, target: &RenderTarget) {
        unsafe {
            self.gl
                .bind_framebuffer(glow::FRAMEBUFFER, framebuffer_handle(target.framebuffer));
            self.gl
                .viewport(0, 0, target.width as i32, target.height as i32);
        }
    }

    fn bind_default_framebuffer(&mut self) {
        unsafe { self.gl.bind_framebuffer(glow::FRAMEBUFFER, None) };
    }

    fn clear(&mut self, r: f32, g: f32, b: f32, a: f32) {
        unsafe {
            self.gl.clear_color(r, g, b, a);
            self.gl.clear(glow::COLOR_BUFFER_BIT);
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        let egl = &egl::API;
        self.make_current();

        unsafe {
            for target in self.targets.drain() {
                if let Some(framebuffer) = framebuffer_handle(target.framebuffer) {
                    self.gl.delete_framebuffer(framebuffer);
                }
                if let Some(texture) = texture_handle(target.texture) {
                    self.gl.delete_texture(texture);
                }
            }

            if let Some(quad) = self.quad.take() {
                self.gl.delete_vertex_array(quad.vertex_array);
                self.gl.delete_buffer(quad.vertex_buffer);
                self.gl.delete_buffer(quad.index_buffer);
                self.gl.delete_program(quad.program);
            }
        }

        _ = egl.make_current(self.display, None, None, None);
        if let Some(pbuffer) = self.pbuffer.take() {
            _ = egl.destroy_surface(self.display, pbuffer);
        }
        _ = egl.destroy_context(self.display, self.context);
        _ = egl.terminate(self.display);
    }
}

fn open_display(native: NativeDisplay) -> eyre::Result<egl::Display> {
    let egl = &egl::API;
    match native {
        NativeDisplay::Wayland(display) => {
            let platform = unsafe {
                egl.get_platform_display(PLATFORM_WAYLAND, display, &[egl::ATTRIB_NONE])
            };
            match platform {
                Ok(display) => Ok(display),
                Err(why) => {
                    tracing::debug!(?why, "eglGetPlatformDisplay failed, trying eglGetDisplay");
                    unsafe { egl.get_display(display) }.ok_or_eyre("no EGL display for Wayland")
                }
            }
        }
        NativeDisplay::Default => unsafe { egl.get_display(egl::DEFAULT_DISPLAY) }
            .ok_or_eyre("no default EGL display"),
    }
}

fn allocate_target(gl: &glow::Context, width: u32, height: u32) -> Result<RenderTarget, String> {
    unsafe {
        let texture = gl.create_texture()?;
        gl.bind_texture(glow::TEXTURE_2D, Some(texture));
        gl.tex_image_2d(
            glow::TEXTURE_2D,
            0,
            glow::RGB as i32,
            width as i32,
            height as i32,
            0,
            glow::RGB,
            glow::UNSIGNED_BYTE,
            None,
        );
        set_linear_filtering(gl);
        gl.bind_texture(glow::TEXTURE_2D, None);

        let framebuffer = match gl.create_framebuffer() {
            Ok(framebuffer) => framebuffer,
            Err(why) => {
                gl.delete_texture(texture);
                return Err(why);
            }
        };

        gl.bind_framebuffer(glow::FRAMEBUFFER, Some(framebuffer));
        gl.framebuffer_texture_2d(
            glow::FRAMEBUFFER,
            glow::COLOR_ATTACHMENT0,
            glow::TEXTURE_2D,
            Some(texture),
            0,
        );
        let status = gl.check_framebuffer_status(glow::FRAMEBUFFER);
        gl.bind_framebuffer(glow::FRAMEBUFFER, None);

        if status != glow::FRAMEBUFFER_COMPLETE {
            gl.delete_framebuffer(framebuffer);
            gl.delete_texture(texture);
            return Err(format!("framebuffer not complete: {status:#x}"));
        }

        Ok(RenderTarget {
            framebuffer: framebuffer.0.get(),
            texture: texture.0.get(),
            width,
            height,
        })
    }
}

unsafe fn set_linear_filtering(gl: &glow::Context) {
    unsafe {
        gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MIN_FILTER, glow::LINEAR as i32);
        gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MAG_FILTER, glow::LINEAR as i32);
        gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_S, glow::CLAMP_TO_EDGE as i32);
        gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_T, glow::CLAMP_TO_EDGE as i32);
    }
}

fn compile_shader(gl: &glow::Context, kind: u32, source: &str) -> Option<glow::NativeShader> {
    unsafe {
        let shader = gl
            .create_shader(kind)
            .inspect_err(|why| tracing::error!(%why, "glCreateShader failed"))
            .ok()?;
        gl.shader_source(shader, source);
        gl.compile_shader(shader);

        if gl.get_shader_compile_status(shader) {
            Some(shader)
        } else {
            tracing::error!(kind, log = %gl.get_shader_info_log(shader), "shader compilation failed");
            gl.delete_shader(shader);
            None
        }
    }
}

fn texture_handle(id: u32) -> Option<glow::NativeTexture> {
    NonZeroU32::new(id).map(glow::NativeTexture)
}

fn framebuffer_handle(id: u32) -> Option<glow::NativeFramebuffer> {
    NonZeroU32::new(id).map(glow::NativeFramebuffer)
}

/// Whether `name` appears as a whole word in an EGL extension string.
fn has_extension(extensions: &str, name: &str) -> bool {
    extensions.split_ascii_whitespace().any(|ext| ext == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_match_is_exact() {
        let extensions = "EGL_KHR_image_base EGL_KHR_surfaceless_context EGL_EXT_buffer_age";
        assert!(has_extension(extensions, SURFACELESS_EXTENSION));
        assert!(!has_extension("EGL_KHR_surfaceless_context_v2", SURFACELESS_EXTENSION));
        assert!(!has_extension("", SURFACELESS_EXTENSION));
    }

    #[test]
    fn zero_ids_have_no_handle() {
        assert!(texture_handle(0).is_none());
        assert!(framebuffer_handle(0).is_none());
        assert_eq!(texture_handle(3).map(|t| t.0.get()), Some(3));
    }

    #[test]
    fn quad_covers_clip_space() {
        let positions: Vec<(f32, f32)> =
            QUAD_VERTICES.chunks(4).map(|v| (v[0], v[1])).collect();
        for corner in [(-1.0, -1.0), (-1.0, 1.0), (1.0, -1.0), (1.0, 1.0)] {
            assert!(positions.contains(&corner));
        }
        assert!(QUAD_INDICES.iter().all(|&i| (i as usize) < positions.len()));
    }
}
