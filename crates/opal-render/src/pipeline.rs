//! The multi-pass render pipeline.
//!
//! Orchestrates one frame: plane upload, user hooks, YUV conversion,
//! debanding, scaling, color mapping, temporal interpolation, dithering and
//! presentation. Every pass is generated through the shader cache against
//! the backend seam, so the whole pipeline runs unchanged on the null
//! backend.
//!
//! Pass texture conventions: source `i` of a pass is bound as `texture{i}`
//! with `texture_size{i}`/`pixel_size{i}`/`texture_rot{i}` uniforms and a
//! `texcoord{i}` coordinate (a varying in raster passes, a macro over
//! gl_GlobalInvocationID in compute passes).

use std::collections::HashMap;
use std::sync::Arc;

use opal_core::options::{AlphaMode, ComputePeak, InterpolationOpts, ScalerOpts};
use opal_core::{
    ColorDescription, Colorspace, ImageView, Levels, Light, OpalError, OpalResult, PlaneType,
    Primaries, RenderOptions, TextureDesc, TextureFormat, TextureHandle, Transfer, Transform2x2,
};
use opal_hooks::{parse_user_shader, Axis, Block, HookBlock, SHADER_MAX_HOOKS};
use opal_kernels::{FILTER_SIZES, TSCALE_SIZES};
use opal_shader::{
    color, is_fixed_scaler, scale, Backend, BufferHandle, BufferKind, Scaler, ShaderCache,
    VertexAttrib,
};
use tracing::{debug, error, info, warn};

use crate::dither::DitherState;
use crate::gpu::TexturePool;
use crate::interpolate::{plan_mix, Surface, SurfaceRing, Validity};
use crate::lut3d::{apply_lut3d, Lut3d};
use crate::perf::{PassStats, PerfTracker};

/// Diagnostic fill for frames that failed to render.
const BROKEN_COLOR: [f32; 3] = [0.0, 0.05, 0.5];

/// All intermediate images render at this format.
const INTERMEDIATE_FORMAT: TextureFormat = TextureFormat::Rgba16F;

/// Compute pass block shape.
const COMPUTE_BLOCK: (usize, usize) = (8, 8);

/// One decoded plane handed to the renderer.
#[derive(Debug, Clone)]
pub struct FramePlane {
    pub plane: PlaneType,
    pub w: u32,
    pub h: u32,
    pub format: TextureFormat,
    pub data: Vec<u8>,
}

/// One decoded video frame.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Content identity; equal ids mean equal pixels. Must grow
    /// monotonically for interpolation.
    pub id: u64,
    pub planes: Vec<FramePlane>,
    pub color: ColorDescription,
    /// Significant bits within each stored sample.
    pub bit_depth: u32,
}

impl VideoFrame {
    /// Size of the reference frame: the first non-chroma plane.
    fn reference_size(&self) -> (u32, u32) {
        self.planes
            .iter()
            .find(|p| p.plane != PlaneType::Chroma)
            .or(self.planes.first())
            .map(|p| (p.w, p.h))
            .unwrap_or((0, 0))
    }
}

/// Where a frame is rendered to.
#[derive(Debug, Clone, Copy)]
pub struct RenderTarget {
    pub tex: TextureHandle,
    pub w: u32,
    pub h: u32,
    pub format: TextureFormat,
    /// Output bit depth, used to size the dither quantization.
    pub depth: u32,
}

/// Vsync timing for temporal interpolation.
#[derive(Debug, Clone, Copy)]
pub struct FrameTiming {
    /// Time from the ideal presentation point of the newest frame to this
    /// vsync, in the same unit as `ideal_frame_duration`.
    pub vsync_offset: f64,
    pub ideal_frame_duration: f64,
}

/// Outcome of one rendered frame.
#[derive(Debug, Clone)]
pub struct RenderResult {
    pub is_interpolated: bool,
    /// The frame failed and a diagnostic fill was drawn instead.
    pub broken: bool,
    pub passes: Vec<PassStats>,
}

struct UploadedPlane {
    tex: TextureHandle,
    desc: TextureDesc,
    plane: PlaneType,
}

struct UploadedFrame {
    id: u64,
    planes: Vec<UploadedPlane>,
}

/// A texture block from a user shader, resident on the GPU.
struct UserTexture {
    name: String,
    view: ImageView,
}

/// Per-pass builder tracking bound source textures; the vertex data and the
/// per-texture uniforms derive from it.
#[derive(Default)]
struct PassBuilder {
    textures: Vec<ImageView>,
    compute: bool,
    /// Output texels covered by one workgroup, for the dispatch size.
    block: (u32, u32),
}

impl PassBuilder {
    fn raster() -> Self {
        Self::default()
    }

    fn compute(
        sc: &mut ShaderCache,
        out_w: u32,
        out_h: u32,
        threads: (u32, u32),
        block: (u32, u32),
    ) -> Self {
        sc.hadd(format!(
            "layout (local_size_x = {}, local_size_y = {}) in;",
            threads.0, threads.1
        ));
        sc.hadd("#define outcoord(id) (out_scale * (vec2(id) + vec2(0.5)))");
        sc.uniform_vec2(
            "out_scale",
            [1.0 / out_w as f32, 1.0 / out_h as f32],
        );
        Self {
            textures: Vec::new(),
            compute: true,
            block,
        }
    }

    /// Bind a source image as texture slot `i` with all its per-texture
    /// uniforms. Returns the slot.
    fn bind(&mut self, sc: &mut ShaderCache, img: &ImageView) -> usize {
        let i = self.textures.len();
        let inv = img.transform.inverse();
        // Map normalized output coords to this texture's texel space.
        let rot = [
            inv.m[0][0] * img.w as f32 / img.tex_w as f32,
            inv.m[0][1] * img.h as f32 / img.tex_w as f32,
            inv.m[1][0] * img.w as f32 / img.tex_h as f32,
            inv.m[1][1] * img.h as f32 / img.tex_h as f32,
        ];
        sc.uniform_texture(&format!("texture{}", i), img.tex, 2);
        sc.uniform_vec2(
            &format!("texture_size{}", i),
            [img.tex_w as f32, img.tex_h as f32],
        );
        sc.uniform_vec2(
            &format!("pixel_size{}", i),
            [1.0 / img.tex_w as f32, 1.0 / img.tex_h as f32],
        );
        sc.uniform_mat2(&format!("texture_rot{}", i), true, rot);
        sc.uniform_vec2(&format!("texture_off{}", i), inv.t);
        if self.compute {
            sc.hadd(format!(
                "#define texmap{i}(id) (texture_rot{i} * outcoord(id) + pixel_size{i} * texture_off{i})",
            ));
            sc.hadd(format!(
                "#define texcoord{i} texmap{i}(vec2(gl_GlobalInvocationID.xy))",
            ));
        }
        self.textures.push(*img);
        i
    }

    /// Emit the NAME_tex/NAME_pos/... macro family for slot `i`.
    fn prelude(&self, sc: &mut ShaderCache, name: &str, i: usize) {
        let mul = self.textures[i].multiplier;
        sc.hadd(format!("#define {name}_raw texture{i}"));
        sc.hadd(format!("#define {name}_pos texcoord{i}"));
        sc.hadd(format!("#define {name}_size texture_size{i}"));
        sc.hadd(format!("#define {name}_rot texture_rot{i}"));
        sc.hadd(format!("#define {name}_pt pixel_size{i}"));
        sc.hadd(format!("#define {name}_map texmap{i}"));
        sc.hadd(format!("#define {name}_mul {:.6}", mul as f64));
        sc.hadd(format!(
            "vec4 {name}_tex(vec2 pos) {{ return {name}_mul * vec4(texture({name}_raw, pos)); }}"
        ));
        sc.hadd(format!(
            "#define {name}_texOff(off) ({name}_tex({name}_pos + {name}_pt * vec2(off)))"
        ));
    }

    /// Fullscreen quad: two triangles, position plus one texcoord per bound
    /// texture.
    fn quad(&self) -> (Vec<VertexAttrib>, Vec<u8>) {
        assert!(!self.compute);
        let mut vao = vec![VertexAttrib {
            name: "position".into(),
            dim: 2,
        }];
        for i in 0..self.textures.len() {
            vao.push(VertexAttrib {
                name: format!("texcoord{}", i),
                dim: 2,
            });
        }
        const CORNERS: [(f32, f32); 6] = [
            (0.0, 0.0),
            (1.0, 0.0),
            (0.0, 1.0),
            (1.0, 0.0),
            (1.0, 1.0),
            (0.0, 1.0),
        ];
        let mut data: Vec<f32> = Vec::with_capacity(6 * (1 + self.textures.len()) * 2);
        for (cx, cy) in CORNERS {
            data.push(cx * 2.0 - 1.0);
            data.push(cy * 2.0 - 1.0);
            for img in &self.textures {
                let inv = img.transform.inverse();
                let p = inv.apply([cx * img.w as f32, cy * img.h as f32]);
                data.push(p[0] / img.tex_w as f32);
                data.push(p[1] / img.tex_h as f32);
            }
        }
        (vao, bytemuck::cast_slice(&data).to_vec())
    }
}

/// The renderer: owns the shader cache, scalers, surfaces and all other
/// per-configuration state. One instance per output.
pub struct Renderer {
    backend: Arc<dyn Backend>,
    sc: ShaderCache,
    pool: TexturePool,
    opts: RenderOptions,
    /// Single-pass mode, forced by capabilities or chosen by configuration.
    dumb: bool,
    scale: Scaler,
    dscale: Scaler,
    cscale: Scaler,
    tscale: Scaler,
    user_hooks: Vec<HookBlock>,
    user_textures: Vec<UserTexture>,
    surfaces: SurfaceRing,
    dither: Option<DitherState>,
    dither_depth: u32,
    lut3d_tex: Option<TextureHandle>,
    peak_buf: Option<BufferHandle>,
    perf: PerfTracker,
    uploaded: Option<UploadedFrame>,
    /// Pool textures acquired for the current frame, released at its end.
    frame_allocs: Vec<(TextureDesc, TextureHandle)>,
    /// Saved hook images, scoped to the current frame.
    saved: HashMap<String, ImageView>,
    frame_counter: u64,
}

impl Renderer {
    pub fn new(backend: Arc<dyn Backend>, opts: RenderOptions) -> OpalResult<Renderer> {
        let mut sc = ShaderCache::new(backend.clone());
        if let Some(dir) = &opts.shader_cache_dir {
            sc.set_cache_dir(dir.clone());
        }

        let profile = backend.profile();
        let forced_dumb = !profile.supports_full_path();
        let dumb = match opts.dumb_mode {
            Some(false) if forced_dumb => {
                warn!(
                    backend = %profile.name,
                    "backend cannot sustain the full render path, staying in dumb mode"
                );
                true
            }
            Some(v) => v || forced_dumb,
            None => forced_dumb || opts.is_trivial(),
        };
        if dumb {
            info!("renderer configured for single-pass (dumb) mode");
        }

        let lut3d_tex = match &opts.lut_3d {
            Some(path) if !dumb => {
                if !profile.caps.has(opal_core::BackendCaps::TEX_3D) {
                    warn!("backend lacks 3D textures, ignoring the 3D LUT");
                    None
                } else {
                    let dir = opts.shader_cache_dir.as_deref();
                    match Lut3d::load(path, dir).and_then(|l| l.upload(&backend)) {
                        Ok(tex) => Some(tex),
                        Err(err) => {
                            warn!(?path, %err, "failed to load 3D LUT");
                            None
                        }
                    }
                }
            }
            _ => None,
        };

        Ok(Renderer {
            pool: TexturePool::new(backend.clone()),
            backend,
            sc,
            opts,
            dumb,
            scale: Scaler::new(),
            dscale: Scaler::new(),
            cscale: Scaler::new(),
            tscale: Scaler::new(),
            user_hooks: Vec::new(),
            user_textures: Vec::new(),
            surfaces: SurfaceRing::new(),
            dither: None,
            dither_depth: 0,
            lut3d_tex,
            peak_buf: None,
            perf: PerfTracker::new(),
            uploaded: None,
            frame_allocs: Vec::new(),
            saved: HashMap::new(),
            frame_counter: 0,
        })
    }

    pub fn options(&self) -> &RenderOptions {
        &self.opts
    }

    pub fn is_dumb(&self) -> bool {
        self.dumb
    }

    /// Replace user shaders. Each source is (file name, text); a malformed
    /// file is skipped whole, previously loaded files are replaced.
    pub fn set_user_shaders(&mut self, sources: &[(String, String)]) -> usize {
        for ut in self.user_textures.drain(..) {
            self.backend.destroy_texture(ut.view.tex);
        }
        self.user_hooks.clear();

        for (file, text) in sources {
            let blocks = match parse_user_shader(text, file) {
                Ok(b) => b,
                Err(err) => {
                    warn!(file = %file, %err, "user shader rejected");
                    continue;
                }
            };
            for block in blocks {
                match block {
                    Block::Hook(hook) => {
                        if self.user_hooks.len() >= SHADER_MAX_HOOKS {
                            warn!(file = %file, "too many hooks, ignoring the rest");
                            break;
                        }
                        self.user_hooks.push(hook);
                    }
                    Block::Texture(tb) => match self.upload_user_texture(&tb) {
                        Ok(ut) => self.user_textures.push(ut),
                        Err(err) => {
                            warn!(file = %file, name = %tb.name, %err, "texture block rejected")
                        }
                    },
                }
            }
        }
        info!(
            hooks = self.user_hooks.len(),
            textures = self.user_textures.len(),
            "user shaders loaded"
        );
        self.sc.flush();
        self.user_hooks.len()
    }

    fn upload_user_texture(&self, tb: &opal_hooks::TextureBlock) -> OpalResult<UserTexture> {
        let desc = TextureDesc {
            w: tb.w,
            h: tb.h,
            d: tb.d,
            format: tb.format,
            render_target: false,
            storage: tb.storage,
            linear_filter: tb.linear_filter,
        };
        let tex = self.backend.create_texture(&desc)?;
        if !tb.data.is_empty() {
            self.backend.upload_texture(tex, &tb.data)?;
        }
        let mut view = ImageView::new(PlaneType::None, tex, &desc, desc.format.components());
        view.multiplier = 1.0;
        Ok(UserTexture {
            name: tb.name.clone(),
            view,
        })
    }

    /// Render one frame into the target. Never fails: a broken frame is
    /// reported in the result and drawn as a solid diagnostic color.
    pub fn render_frame(
        &mut self,
        frame: &VideoFrame,
        target: &RenderTarget,
        timing: Option<&FrameTiming>,
    ) -> RenderResult {
        self.frame_counter += 1;
        self.perf.begin_frame();
        self.saved.clear();
        // The compile-error latch is deliberately not cleared here: a dead
        // cache entry re-latches it on every hit, so repeated frames over
        // the same failing passes keep coming back broken.

        let result = self.render_inner(frame, target, timing);

        for (desc, tex) in std::mem::take(&mut self.frame_allocs) {
            self.pool.release(&desc, tex);
        }
        self.saved.clear();

        match result {
            Ok(is_interpolated) => RenderResult {
                is_interpolated,
                broken: false,
                passes: self.perf.snapshot(),
            },
            Err(err) => {
                error!(frame = frame.id, %err, "frame failed to render");
                self.draw_broken(target);
                RenderResult {
                    is_interpolated: false,
                    broken: true,
                    passes: self.perf.snapshot(),
                }
            }
        }
    }

    fn render_inner(
        &mut self,
        frame: &VideoFrame,
        target: &RenderTarget,
        timing: Option<&FrameTiming>,
    ) -> OpalResult<bool> {
        if frame.planes.is_empty() {
            return Err(OpalError::InvalidArgument("frame without planes".into()));
        }
        let views = self.upload(frame)?;

        if self.dumb {
            self.render_dumb(frame, &views, target)?;
            return Ok(false);
        }

        let interp = self.opts.interpolation.clone();
        if interp.enabled {
            if let Some(timing) = timing {
                return self.render_interpolated(frame, &views, target, timing, &interp);
            }
        }
        let img = self.render_full(frame, &views, target)?;
        self.present(&img, target)?;
        Ok(false)
    }

    // --- upload ---

    fn upload(&mut self, frame: &VideoFrame) -> OpalResult<Vec<ImageView>> {
        let geometry_matches = self.uploaded.as_ref().is_some_and(|u| {
            u.planes.len() == frame.planes.len()
                && u.planes.iter().zip(&frame.planes).all(|(a, b)| {
                    a.desc.w == b.w
                        && a.desc.h == b.h
                        && a.desc.format == b.format
                        && a.plane == b.plane
                })
        });
        if !geometry_matches {
            if let Some(old) = self.uploaded.take() {
                for p in old.planes {
                    self.backend.destroy_texture(p.tex);
                }
            }
            let mut planes = Vec::with_capacity(frame.planes.len());
            for p in &frame.planes {
                let desc = TextureDesc::plane(p.w, p.h, p.format);
                let tex = self.backend.create_texture(&desc)?;
                planes.push(UploadedPlane {
                    tex,
                    desc,
                    plane: p.plane,
                });
            }
            self.uploaded = Some(UploadedFrame {
                id: frame.id.wrapping_sub(1),
                planes,
            });
        }

        let uploaded = self.uploaded.as_mut().ok_or_else(|| {
            OpalError::Other("upload state missing".into())
        })?;
        if uploaded.id != frame.id {
            for (up, p) in uploaded.planes.iter().zip(&frame.planes) {
                self.backend.upload_texture(up.tex, &p.data)?;
            }
            uploaded.id = frame.id;
            debug!(id = frame.id, planes = frame.planes.len(), "frame uploaded");
        }

        // Build views in the reference frame of the first non-chroma plane.
        let (ref_w, ref_h) = frame.reference_size();
        let mut views = Vec::with_capacity(frame.planes.len());
        for (up, p) in uploaded.planes.iter().zip(&frame.planes) {
            let mut view = ImageView::new(p.plane, up.tex, &up.desc, p.format.components());
            view.multiplier = plane_multiplier(p.format, frame.bit_depth);
            if p.plane == PlaneType::Chroma && (p.w != ref_w || p.h != ref_h) {
                // Texel-to-reference scale; sampling inverts it.
                view.w = ref_w;
                view.h = ref_h;
                view.transform = Transform2x2::scale_offset(
                    ref_w as f32 / p.w as f32,
                    ref_h as f32 / p.h as f32,
                    0.0,
                    0.0,
                );
            }
            views.push(view);
        }
        Ok(views)
    }

    // --- pass plumbing ---

    fn alloc(&mut self, w: u32, h: u32) -> OpalResult<ImageView> {
        let desc = TextureDesc::target(w, h, INTERMEDIATE_FORMAT);
        let tex = self.pool.acquire(&desc)?;
        self.frame_allocs.push((desc, tex));
        Ok(ImageView::new(PlaneType::Rgb, tex, &desc, 4))
    }

    fn dispatch(
        &mut self,
        name: &str,
        builder: &PassBuilder,
        target: TextureHandle,
        format: TextureFormat,
    ) -> OpalResult<()> {
        let (vao, vdata) = builder.quad();
        let info = self.sc.dispatch_draw(target, format, true, &vao, &vdata, 6)?;
        if self.sc.error_state() {
            return Err(OpalError::Compile(format!("pass '{}' failed", name)));
        }
        self.perf.record(name, info.gpu_ns);
        Ok(())
    }

    /// Dispatch the session as a compute pass writing `out_image`.
    fn dispatch_compute(
        &mut self,
        name: &str,
        builder: &PassBuilder,
        target: TextureHandle,
        format: TextureFormat,
        out_w: u32,
        out_h: u32,
    ) -> OpalResult<()> {
        self.sc.uniform_image("out_image", target, format);
        self.sc.add(
            "imageStore(out_image, ivec2(gl_GlobalInvocationID.xy), color);",
        );
        let gx = out_w.div_ceil(builder.block.0.max(1));
        let gy = out_h.div_ceil(builder.block.1.max(1));
        let info = self.sc.dispatch_compute(gx, gy, 1)?;
        if self.sc.error_state() {
            return Err(OpalError::Compile(format!("pass '{}' failed", name)));
        }
        self.perf.record(name, info.gpu_ns);
        Ok(())
    }

    /// Sample slot `i` into `color`, applying the multiplier.
    fn sample_into_color(&mut self, builder: &PassBuilder, i: usize) {
        self.sc
            .add(format!("color = texture(texture{i}, texcoord{i});"));
        let mul = builder.textures[i].multiplier;
        if mul != 1.0 {
            self.sc.add(format!("color *= {:.6};", mul as f64));
        }
    }

    // --- user hooks ---

    fn size_lookup(
        &self,
        hooked: &ImageView,
        native: (u32, u32),
        output: (u32, u32),
    ) -> HashMap<(String, Axis), f32> {
        let mut map = HashMap::new();
        let mut put = |name: &str, w: f32, h: f32| {
            map.insert((name.to_string(), Axis::W), w);
            map.insert((name.to_string(), Axis::H), h);
        };
        put("HOOKED", hooked.w as f32, hooked.h as f32);
        put("NATIVE_CROPPED", native.0 as f32, native.1 as f32);
        put("OUTPUT", output.0 as f32, output.1 as f32);
        for (name, img) in &self.saved {
            put(name, img.w as f32, img.h as f32);
        }
        for ut in &self.user_textures {
            put(&ut.name, ut.view.w as f32, ut.view.h as f32);
        }
        map
    }

    /// Run all user hooks registered for `point` over `img`, returning the
    /// (possibly replaced) image. Expression failures skip the hook with a
    /// warning; they never break the frame.
    fn run_hooks(
        &mut self,
        point: &str,
        img: ImageView,
        native: (u32, u32),
        output: (u32, u32),
    ) -> OpalResult<ImageView> {
        let mut img = img;
        for idx in 0..self.user_hooks.len() {
            if !self.user_hooks[idx]
                .hook_points
                .iter()
                .any(|p| p == point)
            {
                continue;
            }
            let hook = self.user_hooks[idx].clone();
            let sizes = self.size_lookup(&img, native, output);
            let lookup = |name: &str, axis: Axis| sizes.get(&(name.to_string(), axis)).copied();

            if let Some(when) = &hook.when {
                match when.eval_bool(&lookup) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(err) => {
                        warn!(point, %err, "hook condition failed, skipping hook");
                        continue;
                    }
                }
            }
            let eval_size = |expr: &Option<opal_hooks::SzExpr>, fallback: u32| -> u32 {
                match expr {
                    None => fallback,
                    Some(e) => match e.eval(&lookup) {
                        Ok(v) if v.is_finite() && v >= 1.0 => v.round() as u32,
                        Ok(v) => {
                            warn!(point, v, "hook size expression out of range");
                            fallback
                        }
                        Err(err) => {
                            warn!(point, %err, "hook size expression failed");
                            fallback
                        }
                    },
                }
            };
            let out_w = eval_size(&hook.width, img.w);
            let out_h = eval_size(&hook.height, img.h);

            let out = self.run_one_hook(point, &hook, img, out_w, out_h)?;
            match &hook.save {
                Some(name) => {
                    self.saved.insert(name.clone(), out);
                }
                None => img = out,
            }
        }
        Ok(img)
    }

    fn run_one_hook(
        &mut self,
        point: &str,
        hook: &HookBlock,
        img: ImageView,
        out_w: u32,
        out_h: u32,
    ) -> OpalResult<ImageView> {
        let is_compute =
            hook.compute.is_some() && self.backend.profile().has_compute();
        let mut builder = if is_compute {
            let cs = hook.compute.as_ref().ok_or_else(|| {
                OpalError::Other("compute hook without compute size".into())
            })?;
            PassBuilder::compute(
                &mut self.sc,
                out_w,
                out_h,
                (cs.threads_w, cs.threads_h),
                (cs.block_w, cs.block_h),
            )
        } else {
            PassBuilder::raster()
        };

        let slot = builder.bind(&mut self.sc, &img);
        builder.prelude(&mut self.sc, "HOOKED", slot);
        builder.prelude(&mut self.sc, point, slot);

        for bind in &hook.binds {
            if bind == "HOOKED" || bind == point {
                continue;
            }
            let bound = self
                .saved
                .get(bind)
                .copied()
                .or_else(|| {
                    self.user_textures
                        .iter()
                        .find(|t| &t.name == bind)
                        .map(|t| t.view)
                })
                .ok_or_else(|| {
                    OpalError::InvalidArgument(format!(
                        "hook binds unknown texture '{}'",
                        bind
                    ))
                })?;
            let i = builder.bind(&mut self.sc, &bound);
            builder.prelude(&mut self.sc, bind, i);
        }

        self.sc.hadd(&hook.body);
        self.sc.add("color = hook();");

        let mut out = self.alloc(out_w, out_h)?;
        out.components = hook.components.unwrap_or(img.components);
        if hook.align_offset {
            out.transform = Transform2x2::IDENTITY;
        } else {
            out.transform = Transform2x2::scale_offset(1.0, 1.0, hook.offset[0], hook.offset[1]);
        }

        let name = if hook.desc.is_empty() {
            format!("hook {}", point)
        } else {
            format!("hook {} ({})", point, hook.desc)
        };
        if is_compute {
            self.dispatch_compute(&name, &builder, out.tex, INTERMEDIATE_FORMAT, out_w, out_h)?;
        } else {
            self.dispatch(&name, &builder, out.tex, INTERMEDIATE_FORMAT)?;
        }
        debug!(point, w = out_w, h = out_h, "user hook ran");
        Ok(out)
    }

    // --- pipeline stages ---

    /// Full render chain up to (excluding) dither/present: hooks, convert,
    /// scale, color map. Output is a target-sized image in target space.
    fn render_full(
        &mut self,
        frame: &VideoFrame,
        views: &[ImageView],
        target: &RenderTarget,
    ) -> OpalResult<ImageView> {
        let native = frame.reference_size();
        let output = (target.w, target.h);

        // Per-plane hooks.
        let mut views = views.to_vec();
        for v in views.iter_mut() {
            let point = match v.plane {
                PlaneType::Luma => "LUMA",
                PlaneType::Chroma => "CHROMA",
                PlaneType::Alpha => "ALPHA",
                PlaneType::Rgb => "RGB",
                PlaneType::Xyz => "XYZ",
                PlaneType::None => continue,
            };
            *v = self.run_hooks(point, *v, native, output)?;
            // Alpha always rides at luma resolution, so the scaled point
            // fires immediately after the plane hooks.
            if v.plane == PlaneType::Alpha {
                *v = self.run_hooks("ALPHA_SCALED", *v, native, output)?;
            }
            if v.plane == PlaneType::Rgb || v.plane == PlaneType::Xyz {
                *v = self.run_hooks("NATIVE", *v, native, output)?;
            }
        }

        let views = self.scale_chroma(views, native, output)?;
        let mut main = self.convert(frame, &views, native)?;
        main = self.run_hooks("MAINPRESUB", main, native, output)?;
        main = self.run_hooks("MAIN", main, native, output)?;

        if self.opts.deband.enabled {
            main = self.deband_pass(main, frame.color.transfer)?;
        }

        let src = frame.color;
        let dst = self.resolve_target_color(&src);
        let scaling_up = target.w > main.w || target.h > main.h;
        let use_linear = self.opts.linear_scaling
            || src.is_hdr()
            || (self.opts.sigmoid.enabled && scaling_up && !src.is_hdr());
        let use_sigmoid = self.opts.sigmoid.enabled && scaling_up && !src.is_hdr();

        let mut is_linear = false;
        if use_linear && !src.transfer.is_linear() {
            main = self.simple_pass("linearize", main, |sc, trc| color::linearize(sc, trc), src.transfer)?;
            is_linear = true;
            main = self.run_hooks("LINEAR", main, native, output)?;
        }
        let mut sigmoided = false;
        if use_sigmoid && is_linear {
            let opts = self.opts.sigmoid;
            main = self.wrap_pass("sigmoidize", main, |sc| color::sigmoidize(sc, &opts))?;
            sigmoided = true;
            main = self.run_hooks("SIGMOID", main, native, output)?;
        }

        main = self.run_hooks("PREKERNEL", main, native, output)?;
        main = self.scale_main(main, target)?;
        main = self.run_hooks("POSTKERNEL", main, native, output)?;

        if sigmoided {
            let opts = self.opts.sigmoid;
            main = self.wrap_pass("desigmoidize", main, |sc| color::desigmoidize(sc, &opts))?;
        }
        main = self.run_hooks("SCALED", main, native, output)?;

        main = self.color_map_pass(main, is_linear, &src, &dst)?;
        main = self.run_hooks("OUTPUT", main, native, output)?;
        Ok(main)
    }

    /// One bilinear 1:1 pass that applies `f` to the sampled color.
    fn wrap_pass(
        &mut self,
        name: &str,
        img: ImageView,
        f: impl FnOnce(&mut ShaderCache),
    ) -> OpalResult<ImageView> {
        let mut builder = PassBuilder::raster();
        let i = builder.bind(&mut self.sc, &img);
        self.sample_into_color(&builder, i);
        f(&mut self.sc);
        let mut out = self.alloc(img.w, img.h)?;
        out.components = img.components;
        self.dispatch(name, &builder, out.tex, INTERMEDIATE_FORMAT)?;
        Ok(out)
    }

    fn simple_pass(
        &mut self,
        name: &str,
        img: ImageView,
        f: impl FnOnce(&mut ShaderCache, Transfer),
        trc: Transfer,
    ) -> OpalResult<ImageView> {
        self.wrap_pass(name, img, |sc| f(sc, trc))
    }

    /// Scale subsampled chroma to the reference size with cscale when a real
    /// kernel is configured; bilinear chroma is merged implicitly later.
    fn scale_chroma(
        &mut self,
        views: Vec<ImageView>,
        native: (u32, u32),
        output: (u32, u32),
    ) -> OpalResult<Vec<ImageView>> {
        let conf = self
            .opts
            .cscale
            .clone()
            .unwrap_or_else(|| self.opts.scale.clone());
        let needs_kernel = !is_fixed_scaler(&conf.kernel);
        let mut out = Vec::with_capacity(views.len());
        for v in views {
            let subsampled = v.plane == PlaneType::Chroma && (v.tex_w != v.w || v.tex_h != v.h);
            if !(subsampled && needs_kernel) {
                out.push(v);
                continue;
            }
            let ratio = v.w as f64 / v.tex_w as f64;
            let inv_scale = (1.0 / ratio).max(1.0);
            self.cscale
                .reinit(&self.backend, &conf, FILTER_SIZES, inv_scale)?;

            let scaled = self.scaler_pass("chroma scale", &v, v.w, v.h, ScalerUnit::Chroma)?;
            let mut scaled = scaled;
            scaled.plane = PlaneType::Chroma;
            scaled.components = v.components;
            scaled.multiplier = 1.0;
            let scaled = self.run_hooks("CHROMA_SCALED", scaled, native, output)?;
            out.push(scaled);
        }
        Ok(out)
    }

    /// Merge the planes into one RGBA image and convert to RGB.
    fn convert(
        &mut self,
        frame: &VideoFrame,
        views: &[ImageView],
        native: (u32, u32),
    ) -> OpalResult<ImageView> {
        let mut builder = PassBuilder::raster();
        let mut slots: Vec<(usize, &ImageView)> = Vec::new();
        for v in views {
            let i = builder.bind(&mut self.sc, v);
            slots.push((i, v));
        }

        // Gather plane samples into the canonical component layout.
        self.sc.add("vec4 c;");
        let mut comp = 0usize;
        let mut has_alpha = false;
        for (i, v) in &slots {
            self.sc
                .add(format!("c = texture(texture{i}, texcoord{i});"));
            if v.multiplier != 1.0 {
                self.sc.add(format!("c *= {:.6};", v.multiplier as f64));
            }
            if v.plane == PlaneType::Alpha {
                self.sc.add("color.a = c.r;");
                has_alpha = true;
                continue;
            }
            for k in 0..v.components.min(4) as usize {
                if comp >= 3 {
                    break;
                }
                self.sc
                    .add(format!("color[{}] = c[{}];", comp, k));
                comp += 1;
            }
        }

        color::convert_input(&mut self.sc, &frame.color);

        if has_alpha {
            match self.opts.alpha {
                AlphaMode::No => self.sc.add("color.a = 1.0;"),
                // Premultiply so scaling in linear light stays correct.
                _ => self.sc.add("color.rgb *= vec3(color.a);"),
            }
        }

        let mut out = self.alloc(native.0, native.1)?;
        out.components = if has_alpha && self.opts.alpha != AlphaMode::No {
            4
        } else {
            3
        };
        self.dispatch("convert", &builder, out.tex, INTERMEDIATE_FORMAT)?;
        Ok(out)
    }

    fn deband_pass(&mut self, img: ImageView, trc: Transfer) -> OpalResult<ImageView> {
        let mut builder = PassBuilder::raster();
        let i = builder.bind(&mut self.sc, &img);
        builder.prelude(&mut self.sc, "HOOKED", i);
        let random = ((self.frame_counter as f64) * 0.618033988749895).fract() as f32;
        let opts = self.opts.deband;
        color::deband(&mut self.sc, &opts, random, trc);
        let mut out = self.alloc(img.w, img.h)?;
        out.components = img.components;
        self.dispatch("deband", &builder, out.tex, INTERMEDIATE_FORMAT)?;
        Ok(out)
    }

    /// Scale the main image to the target size with the configured scaler.
    fn scale_main(&mut self, img: ImageView, target: &RenderTarget) -> OpalResult<ImageView> {
        if img.w == target.w && img.h == target.h {
            return Ok(img);
        }
        let factor = (target.w as f64 / img.w as f64).min(target.h as f64 / img.h as f64);
        let downscaling = factor < 1.0;
        let conf = if downscaling {
            self.opts
                .dscale
                .clone()
                .unwrap_or_else(|| self.opts.scale.clone())
        } else {
            self.opts.scale.clone()
        };
        let inv_scale = if downscaling && self.opts.correct_downscaling {
            1.0 / factor
        } else {
            1.0
        };
        let unit = if downscaling {
            ScalerUnit::Down
        } else {
            ScalerUnit::Up
        };
        let backend = self.backend.clone();
        self.unit_mut(unit)
            .reinit(&backend, &conf, FILTER_SIZES, inv_scale)?;
        let mut out = self.scaler_pass("main scale", &img, target.w, target.h, unit)?;
        out.components = img.components;
        Ok(out)
    }

    /// One scaling pass (or two for separable kernels) from `img` to a
    /// (w, h) intermediate.
    fn scaler_pass(
        &mut self,
        name: &str,
        img: &ImageView,
        w: u32,
        h: u32,
        unit: ScalerUnit,
    ) -> OpalResult<ImageView> {
        enum Plan {
            Fixed(&'static str),
            Polar { compute: bool },
            Separable,
        }
        let profile = self.backend.profile().clone();
        let plan = {
            let scaler = self.unit_ref(unit);
            match scaler.kernel.as_ref() {
                None => Plan::Fixed(match scaler.conf.kernel.as_str() {
                    "bicubic_fast" => "bicubic_fast",
                    "oversample" | "nearest" => "oversample",
                    _ => "bilinear",
                }),
                Some(k) if k.polar => {
                    let bound = k.radius_cutoff.ceil() as usize;
                    let iw = COMPUTE_BLOCK.0 + 2 * bound - 1;
                    let ih = COMPUTE_BLOCK.1 + 2 * bound - 1;
                    let shmem = 4 * iw * ih * img.components.min(3) as usize;
                    let compute = profile.has_compute() && shmem <= profile.max_shmem;
                    Plan::Polar { compute }
                }
                Some(_) => Plan::Separable,
            }
        };

        match plan {
            Plan::Fixed(kind) => {
                let mut builder = PassBuilder::raster();
                let i = builder.bind(&mut self.sc, img);
                scale::sampler_prelude(&mut self.sc, i);
                match kind {
                    "bicubic_fast" => scale::sample_bicubic_fast(&mut self.sc),
                    "oversample" => {
                        let scaler = take_scaler(self, unit);
                        scale::sample_oversample(&mut self.sc, &scaler, w, h);
                        put_scaler(self, unit, scaler);
                    }
                    _ => scale::sample_bilinear(&mut self.sc),
                }
                self.apply_multiplier(img);
                let out = self.alloc(w, h)?;
                self.dispatch(name, &builder, out.tex, INTERMEDIATE_FORMAT)?;
                Ok(out)
            }
            Plan::Polar { compute } => {
                let components = img.components.min(3) as usize;
                let scaler = take_scaler(self, unit);
                let result = if compute {
                    let bound = scaler
                        .kernel
                        .as_ref()
                        .map(|k| k.radius_cutoff.ceil() as usize)
                        .unwrap_or(1);
                    let (bw, bh) = COMPUTE_BLOCK;
                    let (iw, ih) = (bw + 2 * bound - 1, bh + 2 * bound - 1);
                    let mut builder = PassBuilder::compute(
                        &mut self.sc,
                        w,
                        h,
                        (bw as u32, bh as u32),
                        (bw as u32, bh as u32),
                    );
                    let i = builder.bind(&mut self.sc, img);
                    scale::sampler_prelude(&mut self.sc, i);
                    scale::compute_polar(&mut self.sc, &scaler, components, bw, bh, iw, ih);
                    self.apply_multiplier(img);
                    let out = self.alloc(w, h)?;
                    self.dispatch_compute(name, &builder, out.tex, INTERMEDIATE_FORMAT, w, h)?;
                    Ok(out)
                } else {
                    let mut builder = PassBuilder::raster();
                    let i = builder.bind(&mut self.sc, img);
                    scale::sampler_prelude(&mut self.sc, i);
                    scale::sample_polar(&mut self.sc, &scaler, components, profile.has_gather());
                    self.apply_multiplier(img);
                    let out = self.alloc(w, h)?;
                    self.dispatch(name, &builder, out.tex, INTERMEDIATE_FORMAT)?;
                    Ok(out)
                };
                put_scaler(self, unit, scaler);
                result
            }
            Plan::Separable => {
                // Vertical pass into a (src_w, dst_h) intermediate, then
                // horizontal into the final size.
                let scaler = take_scaler(self, unit);
                let run = |me: &mut Renderer,
                           pass: &str,
                           src: &ImageView,
                           dx: i32,
                           dy: i32,
                           ow: u32,
                           oh: u32|
                 -> OpalResult<ImageView> {
                    let mut builder = PassBuilder::raster();
                    let i = builder.bind(&mut me.sc, src);
                    scale::sampler_prelude(&mut me.sc, i);
                    scale::sample_separated(&mut me.sc, &scaler, dx, dy);
                    me.apply_multiplier(src);
                    let out = me.alloc(ow, oh)?;
                    me.dispatch(pass, &builder, out.tex, INTERMEDIATE_FORMAT)?;
                    Ok(out)
                };
                let result = (|| {
                    let tmp = run(self, &format!("{} y", name), img, 0, 1, img.w, h)?;
                    run(self, &format!("{} x", name), &tmp, 1, 0, w, h)
                })();
                put_scaler(self, unit, scaler);
                result
            }
        }
    }

    fn apply_multiplier(&mut self, img: &ImageView) {
        if img.multiplier != 1.0 {
            self.sc
                .add(format!("color *= {:.6};", img.multiplier as f64));
        }
    }

    /// Resolve the output color description from the options and the source.
    fn resolve_target_color(&self, src: &ColorDescription) -> ColorDescription {
        let transfer = self.opts.target.transfer.unwrap_or(if src.transfer.is_hdr() {
            Transfer::Bt1886
        } else {
            src.transfer
        });
        ColorDescription {
            space: Colorspace::Rgb,
            levels: Levels::Full,
            primaries: self.opts.target.primaries.unwrap_or(Primaries::Bt709),
            transfer,
            light: Light::Display,
            sig_peak: self.opts.target.peak.unwrap_or(0.0),
        }
    }

    fn color_map_pass(
        &mut self,
        img: ImageView,
        is_linear: bool,
        src: &ColorDescription,
        dst: &ColorDescription,
    ) -> OpalResult<ImageView> {
        let needs_tone_map = src.peak() > dst.peak();
        let detect = needs_tone_map
            && self.backend.profile().has_compute()
            && match self.opts.tone.compute_peak {
                ComputePeak::Auto | ComputePeak::Yes => true,
                ComputePeak::No => false,
            };

        let peak_buf = if detect {
            Some(self.ensure_peak_buffer()?)
        } else {
            None
        };

        let tone = self.opts.tone.clone();
        let lut = self.lut3d_tex;
        if detect {
            // Peak detection needs workgroup atomics, so the whole color
            // mapping pass runs as compute.
            let block = (COMPUTE_BLOCK.0 as u32, COMPUTE_BLOCK.1 as u32);
            let mut builder = PassBuilder::compute(&mut self.sc, img.w, img.h, block, block);
            let i = builder.bind(&mut self.sc, &img);
            self.sample_into_color(&builder, i);
            color::color_map(&mut self.sc, is_linear, src, dst, &tone, peak_buf);
            if let Some(lut) = lut {
                apply_lut3d(&mut self.sc, lut);
            }
            let mut out = self.alloc(img.w, img.h)?;
            out.components = img.components;
            self.dispatch_compute(
                "color map",
                &builder,
                out.tex,
                INTERMEDIATE_FORMAT,
                img.w,
                img.h,
            )?;
            Ok(out)
        } else {
            let mut builder = PassBuilder::raster();
            let i = builder.bind(&mut self.sc, &img);
            self.sample_into_color(&builder, i);
            color::color_map(&mut self.sc, is_linear, src, dst, &tone, None);
            if let Some(lut) = lut {
                apply_lut3d(&mut self.sc, lut);
            }
            let mut out = self.alloc(img.w, img.h)?;
            out.components = img.components;
            self.dispatch("color map", &builder, out.tex, INTERMEDIATE_FORMAT)?;
            Ok(out)
        }
    }

    fn ensure_peak_buffer(&mut self) -> OpalResult<BufferHandle> {
        if let Some(buf) = self.peak_buf {
            return Ok(buf);
        }
        // vec2 + int + uint + uint, padded to std430 friendliness.
        let buf = self.backend.create_buffer(BufferKind::Storage, 32)?;
        self.backend.update_buffer(buf, 0, &[0u8; 32])?;
        self.peak_buf = Some(buf);
        Ok(buf)
    }

    // --- interpolation ---

    fn render_interpolated(
        &mut self,
        frame: &VideoFrame,
        views: &[ImageView],
        target: &RenderTarget,
        timing: &FrameTiming,
        interp: &InterpolationOpts,
    ) -> OpalResult<bool> {
        match self.surfaces.check(frame.id) {
            Validity::Present => {}
            validity => {
                if validity == Validity::Invalid {
                    self.release_surfaces();
                }
                let img = self.render_full(frame, views, target)?;
                // Ownership of the texture moves to the ring.
                self.frame_allocs.retain(|(_, t)| *t != img.tex);
                let evicted = self.surfaces.commit(Surface {
                    tex: img.tex,
                    w: img.w,
                    h: img.h,
                    id: frame.id,
                });
                if let Some(s) = evicted {
                    let desc = TextureDesc::target(s.w, s.h, INTERMEDIATE_FORMAT);
                    self.pool.release(&desc, s.tex);
                }
            }
        }

        let (mix, shifted) = plan_mix(timing.vsync_offset, timing.ideal_frame_duration);
        let fixed = is_fixed_scaler(&interp.tscale.kernel);
        let taps = if fixed {
            2
        } else {
            self.tscale
                .reinit(&self.backend, &interp.tscale, TSCALE_SIZES, 1.0)?;
            self.tscale.kernel.as_ref().map(|k| k.size).unwrap_or(2)
        };

        let mut window = self.surfaces.window(taps + usize::from(shifted));
        if shifted && window.len() > 1 {
            window.pop();
        }

        // Close enough to a frame edge, or not enough history for the
        // kernel width yet: show the nearest frame directly.
        let near_edge = mix < interp.threshold || mix > 1.0 - interp.threshold;
        if window.len() < 2 || (!fixed && window.len() < taps) || near_edge {
            let img = self.surface_view(self.surfaces.latest().copied().ok_or_else(|| {
                OpalError::Other("no interpolation surface".into())
            })?);
            self.present(&img, target)?;
            return Ok(false);
        }

        let mixed = if fixed {
            self.mix_two(&window, mix, &interp.tscale)?
        } else {
            self.mix_kernel(&window, mix)?
        };
        self.present(&mixed, target)?;
        Ok(true)
    }

    /// Return every parked surface texture to the pool.
    fn release_surfaces(&mut self) {
        for s in self.surfaces.drain() {
            let desc = TextureDesc::target(s.w, s.h, INTERMEDIATE_FORMAT);
            self.pool.release(&desc, s.tex);
        }
    }

    fn surface_view(&self, s: Surface) -> ImageView {
        let desc = TextureDesc::target(s.w, s.h, INTERMEDIATE_FORMAT);
        ImageView::new(PlaneType::Rgb, s.tex, &desc, 4)
    }

    /// Linear cross-fade of the two newest surfaces; oversample snaps the
    /// coefficient to the edges within the threshold band.
    fn mix_two(
        &mut self,
        window: &[Surface],
        mix: f32,
        conf: &ScalerOpts,
    ) -> OpalResult<ImageView> {
        let prev = self.surface_view(window[window.len() - 2]);
        let next = self.surface_view(window[window.len() - 1]);
        let coeff = if conf.kernel == "oversample" {
            let threshold = conf.params[0].unwrap_or(0.0).clamp(0.0, 0.5);
            if mix < threshold {
                0.0
            } else if mix > 1.0 - threshold {
                1.0
            } else {
                mix
            }
        } else {
            mix
        };
        let mut builder = PassBuilder::raster();
        let a = builder.bind(&mut self.sc, &prev);
        let b = builder.bind(&mut self.sc, &next);
        self.sc.uniform_dynamic();
        self.sc.uniform_f("inter_coeff", coeff);
        self.sc.add(format!(
            "color = mix(texture(texture{a}, texcoord{a}), texture(texture{b}, texcoord{b}), inter_coeff);"
        ));
        let out = self.alloc(next.w, next.h)?;
        self.dispatch("interpolate", &builder, out.tex, INTERMEDIATE_FORMAT)?;
        Ok(out)
    }

    /// True 1D temporal convolution across the surface window, using the
    /// separable machinery in planar mode.
    fn mix_kernel(&mut self, window: &[Surface], mix: f32) -> OpalResult<ImageView> {
        let newest = self.surface_view(window[window.len() - 1]);
        let mut builder = PassBuilder::raster();
        for s in window {
            let v = self.surface_view(*s);
            builder.bind(&mut self.sc, &v);
        }
        scale::sampler_prelude(&mut self.sc, 0);
        self.sc.uniform_dynamic();
        self.sc.uniform_f("fcoord", mix);
        let scaler = std::mem::take(&mut self.tscale);
        scale::sample_separated(&mut self.sc, &scaler, 0, 0);
        self.tscale = scaler;
        let out = self.alloc(newest.w, newest.h)?;
        self.dispatch("interpolate", &builder, out.tex, INTERMEDIATE_FORMAT)?;
        Ok(out)
    }

    // --- output ---

    fn ensure_dither(&mut self, target: &RenderTarget) -> OpalResult<()> {
        if self.dither_depth == target.depth {
            return Ok(());
        }
        if let Some(old) = self.dither.take() {
            old.release(&self.backend);
        }
        self.dither_depth = target.depth;
        if !self
            .backend
            .profile()
            .caps
            .has(opal_core::BackendCaps::FRAGCOORD)
        {
            warn!("backend lacks gl_FragCoord, dithering disabled");
            return Ok(());
        }
        self.dither = DitherState::new(&self.backend, &self.opts.dither, target.depth)?;
        Ok(())
    }

    /// Blend alpha against the configured background.
    fn background(&mut self) {
        match self.opts.alpha {
            AlphaMode::No | AlphaMode::Yes => {}
            AlphaMode::Blend => {
                let [r, g, b] = self.opts.background_color;
                self.sc.add(format!(
                    "color.rgb += vec3({:.6}, {:.6}, {:.6}) * (1.0 - color.a);",
                    r as f64, g as f64, b as f64
                ));
                self.sc.add("color.a = 1.0;");
            }
            AlphaMode::BlendTiles => {
                self.sc
                    .add("vec2 tile = floor(gl_FragCoord.xy * 1.0/32.0);");
                self.sc.add(
                    "vec3 bg = mix(vec3(0.55), vec3(0.79), mod(tile.x + tile.y, 2.0));",
                );
                self.sc.add("color.rgb += bg * (1.0 - color.a);");
                self.sc.add("color.a = 1.0;");
            }
        }
    }

    /// Final pass: background, dither, draw to the caller's target.
    fn present(&mut self, img: &ImageView, target: &RenderTarget) -> OpalResult<()> {
        self.ensure_dither(target)?;
        let mut builder = PassBuilder::raster();
        let i = builder.bind(&mut self.sc, img);
        self.sample_into_color(&builder, i);
        self.background();
        if let Some(dither) = self.dither.take() {
            dither.fragment(&mut self.sc, self.frame_counter);
            self.dither = Some(dither);
        }
        self.dispatch("present", &builder, target.tex, target.format)
    }

    /// Single-pass mode: convert and bilinear-stretch straight into the
    /// target, still honoring levels/gamma via the conversion matrix.
    fn render_dumb(
        &mut self,
        frame: &VideoFrame,
        views: &[ImageView],
        target: &RenderTarget,
    ) -> OpalResult<()> {
        self.ensure_dither(target)?;
        let mut builder = PassBuilder::raster();
        let mut slots = Vec::new();
        for v in views {
            // The fullscreen quad stretches each plane to the target.
            slots.push((builder.bind(&mut self.sc, v), *v));
        }

        self.sc.add("vec4 c;");
        let mut comp = 0usize;
        let mut has_alpha = false;
        for (i, v) in &slots {
            self.sc
                .add(format!("c = texture(texture{i}, texcoord{i});"));
            if v.multiplier != 1.0 {
                self.sc.add(format!("c *= {:.6};", v.multiplier as f64));
            }
            if v.plane == PlaneType::Alpha {
                self.sc.add("color.a = c.r;");
                has_alpha = true;
                continue;
            }
            for k in 0..v.components.min(4) as usize {
                if comp >= 3 {
                    break;
                }
                self.sc.add(format!("color[{}] = c[{}];", comp, k));
                comp += 1;
            }
        }
        color::convert_input(&mut self.sc, &frame.color);
        if has_alpha {
            if self.opts.alpha == AlphaMode::No {
                self.sc.add("color.a = 1.0;");
            } else {
                self.sc.add("color.rgb *= vec3(color.a);");
            }
        }
        self.background();
        if let Some(dither) = self.dither.take() {
            dither.fragment(&mut self.sc, self.frame_counter);
            self.dither = Some(dither);
        }
        self.dispatch("dumb", &builder, target.tex, target.format)
    }

    /// Solid diagnostic fill for a frame that failed mid-render.
    fn draw_broken(&mut self, target: &RenderTarget) {
        self.sc.clear_error_state();
        self.sc.reset();
        let builder = PassBuilder::raster();
        self.sc.add(format!(
            "color = vec4({:.6}, {:.6}, {:.6}, 1.0);",
            BROKEN_COLOR[0] as f64, BROKEN_COLOR[1] as f64, BROKEN_COLOR[2] as f64
        ));
        if let Err(err) = self.dispatch("broken frame", &builder, target.tex, target.format) {
            warn!(%err, "even the diagnostic fill failed");
        }
    }

    fn unit_ref(&self, unit: ScalerUnit) -> &Scaler {
        match unit {
            ScalerUnit::Up => &self.scale,
            ScalerUnit::Down => &self.dscale,
            ScalerUnit::Chroma => &self.cscale,
        }
    }

    fn unit_mut(&mut self, unit: ScalerUnit) -> &mut Scaler {
        match unit {
            ScalerUnit::Up => &mut self.scale,
            ScalerUnit::Down => &mut self.dscale,
            ScalerUnit::Chroma => &mut self.cscale,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScalerUnit {
    Up,
    Down,
    Chroma,
}

// The scaler fragments borrow the scaler while the cache is also borrowed
// mutably; moving the scaler out for the duration keeps both borrows legal.
fn take_scaler(r: &mut Renderer, unit: ScalerUnit) -> Scaler {
    std::mem::take(r.unit_mut(unit))
}

fn put_scaler(r: &mut Renderer, unit: ScalerUnit, s: Scaler) {
    *r.unit_mut(unit) = s;
}

/// Rescale padded bit depths (e.g. 10-bit samples in 16-bit planes) to the
/// nominal [0,1] range.
fn plane_multiplier(format: TextureFormat, bit_depth: u32) -> f32 {
    let tex_depth = match format {
        TextureFormat::R8 | TextureFormat::Rg8 | TextureFormat::Rgba8 => 8,
        TextureFormat::R16 | TextureFormat::Rg16 | TextureFormat::Rgba16 => 16,
        _ => return 1.0,
    };
    if bit_depth == 0 || bit_depth >= tex_depth {
        return 1.0;
    }
    ((1u64 << tex_depth) - 1) as f32 / ((1u64 << bit_depth) - 1) as f32
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.release_surfaces();
        if let Some(up) = self.uploaded.take() {
            for p in up.planes {
                self.backend.destroy_texture(p.tex);
            }
        }
        for ut in self.user_textures.drain(..) {
            self.backend.destroy_texture(ut.view.tex);
        }
        self.scale.release(&self.backend);
        self.dscale.release(&self.backend);
        self.cscale.release(&self.backend);
        self.tscale.release(&self.backend);
        if let Some(d) = self.dither.take() {
            d.release(&self.backend);
        }
        if let Some(t) = self.lut3d_tex.take() {
            self.backend.destroy_texture(t);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plane_multiplier() {
        assert_eq!(plane_multiplier(TextureFormat::R8, 8), 1.0);
        assert_eq!(plane_multiplier(TextureFormat::R16F, 10), 1.0);
        let m = plane_multiplier(TextureFormat::R16, 10);
        assert!((m - 65535.0 / 1023.0).abs() < 1e-3);
    }

    #[test]
    fn test_quad_covers_unit_square() {
        let backend: Arc<dyn Backend> =
            Arc::new(opal_shader::NullBackend::new(opal_shader::vulkan_class_profile()));
        let mut sc = ShaderCache::new(backend.clone());
        let desc = TextureDesc::plane(64, 32, TextureFormat::Rgba8);
        let tex = backend.create_texture(&desc).unwrap();
        let img = ImageView::new(PlaneType::Rgb, tex, &desc, 4);
        let mut b = PassBuilder::raster();
        b.bind(&mut sc, &img);
        let (vao, data) = b.quad();
        assert_eq!(vao.len(), 2);
        assert_eq!(vao[0].name, "position");
        let floats: &[f32] = bytemuck::cast_slice(&data);
        // 6 vertices x (position + texcoord0).
        assert_eq!(floats.len(), 6 * 4);
        // Last vertex: corner (0, 1) -> NDC (-1, 1), texcoord (0, 1).
        assert_eq!(&floats[20..24], &[-1.0, 1.0, 0.0, 1.0]);
        sc.reset();
    }

    #[test]
    fn test_subsampled_chroma_texcoords() {
        let backend: Arc<dyn Backend> =
            Arc::new(opal_shader::NullBackend::new(opal_shader::vulkan_class_profile()));
        let mut sc = ShaderCache::new(backend.clone());
        let desc = TextureDesc::plane(32, 16, TextureFormat::Rg8);
        let tex = backend.create_texture(&desc).unwrap();
        let mut img = ImageView::new(PlaneType::Chroma, tex, &desc, 2);
        img.w = 64;
        img.h = 32;
        img.transform = Transform2x2::scale_offset(2.0, 2.0, 0.0, 0.0);
        let mut b = PassBuilder::raster();
        b.bind(&mut sc, &img);
        let (_, data) = b.quad();
        let floats: &[f32] = bytemuck::cast_slice(&data);
        // Corner (1, 1): reference (64, 32) maps back to texel (32, 16),
        // i.e. normalized (1, 1).
        assert_eq!(&floats[16..20], &[1.0, 1.0, 1.0, 1.0]);
        sc.reset();
    }
}
