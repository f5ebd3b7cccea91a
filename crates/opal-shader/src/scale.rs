//! Scaler state and the sampling shader fragments.
//!
//! A [`Scaler`] owns the GPU weight LUT for one kernel configuration and is
//! rebuilt lazily whenever the configuration or the scale factor changes.
//! The fragments assume [`sampler_prelude`] ran first, so `tex`, `pos`,
//! `size` and `pt` describe the source texture.

use std::sync::Arc;

use opal_core::options::ScalerOpts;
use opal_core::{BackendCaps, OpalError, OpalResult, TextureDesc, TextureFormat, TextureHandle};
use opal_kernels::{lookup, Kernel, SCALER_LUT_SIZE};
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::cache::ShaderCache;

/// Sampler names without a kernel entry; each has a dedicated fragment.
const FIXED_SCALERS: &[&str] = &["bilinear", "nearest", "bicubic_fast", "oversample"];

pub fn is_fixed_scaler(name: &str) -> bool {
    FIXED_SCALERS.contains(&name)
}

/// One scaler unit (scale/dscale/cscale/tscale) with its weight LUT.
pub struct Scaler {
    pub conf: ScalerOpts,
    /// None for the fixed samplers (bilinear etc.).
    pub kernel: Option<Kernel>,
    pub lut: Option<TextureHandle>,
    /// 1 for a true 1D ramp, 2 when stored as a Nx1 column texture.
    pub lut_dims: u8,
    pub lut_size: usize,
    /// The kernel had to be degraded because no legal tap count covers the
    /// scale factor.
    pub insufficient: bool,
    inv_scale: f64,
    initialized: bool,
}

impl Scaler {
    pub fn new() -> Self {
        Self {
            conf: ScalerOpts::default(),
            kernel: None,
            lut: None,
            lut_dims: 2,
            lut_size: SCALER_LUT_SIZE,
            insufficient: false,
            inv_scale: 0.0,
            initialized: false,
        }
    }

    /// Drop the GPU LUT and forget the configuration.
    pub fn release(&mut self, backend: &Arc<dyn Backend>) {
        if let Some(lut) = self.lut.take() {
            backend.destroy_texture(lut);
        }
        self.kernel = None;
        self.initialized = false;
    }

    /// (Re)initialize for a configuration and scale factor. A no-op when
    /// nothing changed. `sizes` is the list of legal tap counts.
    pub fn reinit(
        &mut self,
        backend: &Arc<dyn Backend>,
        conf: &ScalerOpts,
        sizes: &[usize],
        inv_scale: f64,
    ) -> OpalResult<()> {
        if self.initialized && self.conf == *conf && self.inv_scale == inv_scale {
            return Ok(());
        }
        self.release(backend);

        self.conf = conf.clone();
        self.inv_scale = inv_scale;
        self.insufficient = false;
        self.initialized = true;

        if is_fixed_scaler(&conf.kernel) {
            return Ok(());
        }

        let mut kernel = lookup(&conf.kernel).ok_or_else(|| {
            OpalError::InvalidArgument(format!("unknown scaler kernel '{}'", conf.kernel))
        })?;
        kernel.apply_opts(conf);
        self.insufficient = !kernel.init(sizes, inv_scale);
        if self.insufficient {
            warn!(
                kernel = kernel.name,
                inv_scale, "filter radius too large, using a degraded kernel"
            );
        }

        self.lut_size = SCALER_LUT_SIZE;
        let (data, desc) = if kernel.polar {
            let mut data = vec![0f32; self.lut_size];
            kernel.compute_lut(self.lut_size, 1, &mut data);
            let use_1d = backend.profile().caps.has(BackendCaps::TEX_1D);
            self.lut_dims = if use_1d { 1 } else { 2 };
            let desc = TextureDesc {
                w: if use_1d { self.lut_size as u32 } else { 1 },
                h: if use_1d { 1 } else { self.lut_size as u32 },
                d: 1,
                format: TextureFormat::R32F,
                render_target: false,
                storage: false,
                linear_filter: true,
            };
            (data, desc)
        } else {
            // One row per fractional offset, weights packed 4 per texel.
            let width = (kernel.size + 3) / 4;
            let stride = width * 4;
            let mut data = vec![0f32; self.lut_size * stride];
            kernel.compute_lut(self.lut_size, stride, &mut data);
            self.lut_dims = 2;
            let desc = TextureDesc {
                w: width as u32,
                h: self.lut_size as u32,
                d: 1,
                format: TextureFormat::Rgba32F,
                render_target: false,
                storage: false,
                linear_filter: true,
            };
            (data, desc)
        };

        let lut = backend.create_texture(&desc)?;
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        backend.upload_texture(lut, &bytes)?;
        self.lut = Some(lut);

        debug!(
            kernel = kernel.name,
            size = kernel.size,
            polar = kernel.polar,
            radius_cutoff = kernel.radius_cutoff,
            "scaler initialized"
        );
        self.kernel = Some(kernel);
        Ok(())
    }
}

impl Default for Scaler {
    fn default() -> Self {
        Self::new()
    }
}

/// Point the shared sampling variables at source texture `tex_num`. The
/// per-texture macros and varyings come from the pass setup.
pub fn sampler_prelude(sc: &mut ShaderCache, tex_num: usize) {
    sc.add("#undef tex");
    sc.add("#undef texmap");
    sc.add(format!("#define tex texture{}", tex_num));
    sc.add(format!("#define texmap texmap{}", tex_num));
    sc.add(format!("vec2 pos = texcoord{};", tex_num));
    sc.add(format!("vec2 size = texture_size{};", tex_num));
    sc.add(format!("vec2 pt = pixel_size{};", tex_num));
}

/// Plain bilinear tap; the texture's own filtering does the work.
pub fn sample_bilinear(sc: &mut ShaderCache) {
    sc.add("color = texture(tex, pos);");
}

fn separated_get_weights(sc: &mut ShaderCache, scaler: &Scaler, kernel: &Kernel) {
    let lut = scaler.lut.unwrap_or(TextureHandle(0));
    sc.uniform_texture("lut", lut, scaler.lut_dims);
    sc.add(format!("float ypos = LUT_POS(fcoord, {}.0);", scaler.lut_size));

    let n = kernel.size;
    let width = (n + 3) / 4;

    sc.add(format!("float weights[{}];", n));
    for i in 0..n {
        if i % 4 == 0 {
            sc.add(format!(
                "c = texture(lut, vec2({:.6}, ypos));",
                ((i / 4) as f64 + 0.5) / width as f64
            ));
        }
        sc.add(format!("weights[{}] = c[{}];", i, i % 4));
    }
}

/// One separable pass along direction (d_x, d_y). A zero direction samples
/// planar inputs instead (texture0 through textureN-1).
pub fn sample_separated(sc: &mut ShaderCache, scaler: &Scaler, d_x: i32, d_y: i32) {
    let Some(kernel) = &scaler.kernel else {
        sample_bilinear(sc);
        return;
    };
    let n = kernel.size;
    let use_ar = scaler.conf.antiring > 0.0;
    let planar = d_x == 0 && d_y == 0;

    sc.add("color = vec4(0.0);");
    sc.add("{");
    if !planar {
        sc.add(format!("vec2 dir = vec2({}.0, {}.0);", d_x, d_y));
        sc.add("pt *= dir;");
        sc.add("float fcoord = dot(fract(pos * size - vec2(0.5)), dir);");
        sc.add(format!(
            "vec2 base = pos - fcoord * pt - pt * vec2({}.0);",
            n as i32 / 2 - 1
        ));
    }
    sc.add("vec4 c;");
    if use_ar {
        sc.add("vec4 hi = vec4(0.0);");
        sc.add("vec4 lo = vec4(1.0);");
    }
    separated_get_weights(sc, scaler, kernel);
    sc.add("// scaler samples");
    for i in 0..n {
        if planar {
            sc.add(format!("c = texture(texture{}, texcoord{});", i, i));
        } else {
            sc.add(format!("c = texture(tex, base + pt * vec2({}.0));", i));
        }
        sc.add(format!("color += vec4(weights[{}]) * c;", i));
        if use_ar && (i == n / 2 - 1 || i == n / 2) {
            sc.add("lo = min(lo, c);");
            sc.add("hi = max(hi, c);");
        }
    }
    if use_ar {
        sc.add(format!(
            "color = mix(color, clamp(color, lo, hi), {:.6});",
            scaler.conf.antiring as f64
        ));
    }
    sc.add("}");
}

// Emit one texel contribution. Direct sampling unless planar; planar takes
// the pixel from inX[idx] where X is the component, with idx set by the
// caller.
fn polar_sample(
    sc: &mut ShaderCache,
    scaler: &Scaler,
    kernel: &Kernel,
    x: i32,
    y: i32,
    components: usize,
    planar: bool,
) {
    let radius = kernel.f.radius * kernel.filter_scale;
    let radius_cutoff = kernel.radius_cutoff;

    // The subpixel position is unknown in advance, so assume the worst
    // case when deciding what can be skipped.
    let yy = if y > 0 { y - 1 } else { y };
    let xx = if x > 0 { x - 1 } else { x };
    let dmax = ((xx * xx + yy * yy) as f64).sqrt();
    if dmax >= radius_cutoff {
        return;
    }
    sc.add(format!("d = length(vec2({}.0, {}.0) - fcoord);", x, y));
    let maybe_skippable = dmax >= radius_cutoff - std::f64::consts::SQRT_2;
    if maybe_skippable {
        sc.add(format!("if (d < {:.6}) {{", radius_cutoff));
    }

    if scaler.lut_dims == 1 {
        sc.add(format!(
            "w = tex1D(lut, LUT_POS(d * 1.0/{:.6}, {}.0)).r;",
            radius, scaler.lut_size
        ));
    } else {
        sc.add(format!(
            "w = texture(lut, vec2(0.5, LUT_POS(d * 1.0/{:.6}, {}.0))).r;",
            radius, scaler.lut_size
        ));
    }
    sc.add("wsum += w;");

    if planar {
        for c in 0..components {
            sc.add(format!("color[{}] += w * in{}[idx];", c, c));
        }
    } else {
        sc.add(format!("in0 = texture(tex, base + pt * vec2({}.0, {}.0));", x, y));
        sc.add("color += vec4(w) * in0;");
    }

    if maybe_skippable {
        sc.add("}");
    }
}

/// Polar (EWA) sampling in a fragment pass. With `sup_gather`, in-bounds
/// 2x2 blocks use textureGatherOffset.
pub fn sample_polar(sc: &mut ShaderCache, scaler: &Scaler, components: usize, sup_gather: bool) {
    let Some(kernel) = &scaler.kernel else {
        sample_bilinear(sc);
        return;
    };

    sc.add("color = vec4(0.0);");
    sc.add("{");
    sc.add("vec2 fcoord = fract(pos * size - vec2(0.5));");
    sc.add("vec2 base = pos - fcoord * pt;");
    sc.add("float w, d, wsum = 0.0;");
    for c in 0..components {
        sc.add(format!("vec4 in{};", c));
    }
    sc.add("int idx;");

    let lut = scaler.lut.unwrap_or(TextureHandle(0));
    sc.uniform_texture("lut", lut, scaler.lut_dims);

    sc.add("// scaler samples");
    let bound = kernel.radius_cutoff.ceil() as i32;
    let mut y = 1 - bound;
    while y <= bound {
        let mut x = 1 - bound;
        while x <= bound {
            // Gathering 4 texels only to discard some is wasteful; gather
            // exactly when all four are within bounds.
            let all_in = ((x * x + y * y) as f64).sqrt() < kernel.radius_cutoff;
            let use_gather = sup_gather && all_in;

            if use_gather {
                for c in 0..components {
                    sc.add(format!(
                        "in{} = textureGatherOffset(tex, base, ivec2({}, {}), {});",
                        c, x, y, c
                    ));
                }
                // Texels come back counterclockwise from the bottom left.
                const XO: [i32; 4] = [0, 1, 1, 0];
                const YO: [i32; 4] = [1, 1, 0, 0];
                for p in 0..4 {
                    if x + XO[p] > bound || y + YO[p] > bound {
                        continue;
                    }
                    sc.add(format!("idx = {};", p));
                    polar_sample(sc, scaler, kernel, x + XO[p], y + YO[p], components, true);
                }
            } else {
                let mut yy = y;
                while yy <= bound && yy <= y + 1 {
                    let mut xx = x;
                    while xx <= bound && xx <= x + 1 {
                        polar_sample(sc, scaler, kernel, xx, yy, components, false);
                        xx += 1;
                    }
                    yy += 1;
                }
            }
            x += 2;
        }
        y += 2;
    }

    sc.add("color = color / vec4(wsum);");
    sc.add("}");
}

/// Polar (EWA) sampling in a compute pass: the workgroup stages all
/// required texels into shared memory first. `bw`/`bh` is the block size,
/// `iw`/`ih` the staged input size covering the whole block's footprint.
pub fn compute_polar(
    sc: &mut ShaderCache,
    scaler: &Scaler,
    components: usize,
    bw: usize,
    bh: usize,
    iw: usize,
    ih: usize,
) {
    let Some(kernel) = &scaler.kernel else {
        sample_bilinear(sc);
        return;
    };
    let bound = kernel.radius_cutoff.ceil() as i32;
    let offset = bound - 1; // top/left padding

    sc.add("color = vec4(0.0);");
    sc.add("{");
    sc.add("vec2 wpos = texmap(gl_WorkGroupID * gl_WorkGroupSize);");
    sc.add("vec2 wbase = wpos - pt * fract(wpos * size - vec2(0.5));");
    sc.add("vec2 fcoord = fract(pos * size - vec2(0.5));");
    sc.add("vec2 base = pos - pt * fcoord;");
    sc.add("ivec2 rel = ivec2(round((base - wbase) * size));");
    sc.add("int idx;");
    sc.add("float w, d, wsum = 0.0;");
    let lut = scaler.lut.unwrap_or(TextureHandle(0));
    sc.uniform_texture("lut", lut, scaler.lut_dims);

    for c in 0..components {
        sc.hadd(format!("shared float in{}[{}];", c, ih * iw));
    }

    sc.add("vec4 c;");
    sc.add(format!(
        "for (int y = int(gl_LocalInvocationID.y); y < {}; y += {}) {{",
        ih, bh
    ));
    sc.add(format!(
        "for (int x = int(gl_LocalInvocationID.x); x < {}; x += {}) {{",
        iw, bw
    ));
    sc.add(format!(
        "c = texture(tex, wbase + pt * vec2(x - {}, y - {}));",
        offset, offset
    ));
    for c in 0..components {
        sc.add(format!("in{}[{} * y + x] = c[{}];", c, iw, c));
    }
    sc.add("}}");
    sc.add("groupMemoryBarrier();");
    sc.add("barrier();");

    sc.add("// scaler samples");
    for y in (1 - bound)..=bound {
        for x in (1 - bound)..=bound {
            sc.add(format!(
                "idx = {} * rel.y + rel.x + {};",
                iw,
                iw as i32 * (y + offset) + x + offset
            ));
            polar_sample(sc, scaler, kernel, x, y, components, true);
        }
    }

    sc.add("color = color / vec4(wsum);");
    sc.add("}");
}

// B-spline bicubic with 4 bilinear fetches, per 'Efficient GPU-Based
// Texture Interpolation using Uniform B-Splines'.
fn bicubic_calcweights(sc: &mut ShaderCache, t: &str, s: &str) {
    sc.add(format!(
        "vec4 {t} = vec4(-0.5, 0.1666, 0.3333, -0.3333) * {s} + vec4(1, 0, -0.5, 0.5);"
    ));
    sc.add(format!("{t} = {t} * {s} + vec4(0, 0, -0.5, 0.5);"));
    sc.add(format!("{t} = {t} * {s} + vec4(-0.6666, 0, 0.8333, 0.1666);"));
    sc.add(format!("{t}.xy *= vec2(1, 1) / vec2({t}.z, {t}.w);"));
    sc.add(format!("{t}.xy += vec2(1.0 + {s}, 1.0 - {s});"));
}

pub fn sample_bicubic_fast(sc: &mut ShaderCache) {
    sc.add("{");
    sc.add("vec2 fcoord = fract(pos * size + vec2(0.5, 0.5));");
    bicubic_calcweights(sc, "parmx", "fcoord.x");
    bicubic_calcweights(sc, "parmy", "fcoord.y");
    sc.add("vec4 cdelta;");
    sc.add("cdelta.xz = parmx.rg * vec2(-pt.x, pt.x);");
    sc.add("cdelta.yw = parmy.rg * vec2(-pt.y, pt.y);");
    // first y-interpolation
    sc.add("vec4 ar = texture(tex, pos + cdelta.xy);");
    sc.add("vec4 ag = texture(tex, pos + cdelta.xw);");
    sc.add("vec4 ab = mix(ag, ar, parmy.b);");
    // second y-interpolation
    sc.add("vec4 br = texture(tex, pos + cdelta.zy);");
    sc.add("vec4 bg = texture(tex, pos + cdelta.zw);");
    sc.add("vec4 aa = mix(bg, br, parmy.b);");
    // x-interpolation
    sc.add("color = mix(aa, ab, parmx.b);");
    sc.add("}");
}

/// Sharpened integer-ratio upscaling: blend between neighboring texels only
/// within the configured transition band.
pub fn sample_oversample(sc: &mut ShaderCache, scaler: &Scaler, w: u32, h: u32) {
    sc.add("{");
    sc.add("vec2 pos = pos - vec2(0.5) * pt;"); // round to nearest
    sc.add("vec2 fcoord = fract(pos * size - vec2(0.5));");
    sc.uniform_vec2("output_size", [w as f32, h as f32]);
    sc.add("vec2 coeff = fcoord * output_size/size;");
    let threshold = scaler.conf.params[0].unwrap_or(0.0) as f64;
    sc.add(format!(
        "coeff = (coeff - {:.6}) * 1.0/{:.6};",
        threshold,
        1.0 - 2.0 * threshold
    ));
    sc.add("coeff = clamp(coeff, 0.0, 1.0);");
    sc.add("color = texture(tex, pos + pt * (coeff - fcoord));");
    sc.add("}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{vulkan_class_profile, NullBackend};
    use opal_kernels::FILTER_SIZES;

    fn setup(kernel: &str, inv_scale: f64) -> (Arc<NullBackend>, Arc<dyn Backend>, Scaler) {
        let null = Arc::new(NullBackend::new(vulkan_class_profile()));
        let backend: Arc<dyn Backend> = null.clone();
        let mut scaler = Scaler::new();
        scaler
            .reinit(&backend, &ScalerOpts::named(kernel), FILTER_SIZES, inv_scale)
            .unwrap();
        (null, backend, scaler)
    }

    fn session(backend: &Arc<dyn Backend>) -> ShaderCache {
        ShaderCache::new(backend.clone())
    }

    #[test]
    fn test_reinit_builds_separable_lut() {
        let (null, _, scaler) = setup("lanczos", 1.0);
        let kernel = scaler.kernel.as_ref().unwrap();
        assert_eq!(kernel.size, 6);
        let desc = null.texture_desc(scaler.lut.unwrap()).unwrap();
        // 6 weights pack into 2 RGBA texels per row.
        assert_eq!(desc.w, 2);
        assert_eq!(desc.h, SCALER_LUT_SIZE as u32);
        assert_eq!(desc.format, TextureFormat::Rgba32F);
    }

    #[test]
    fn test_reinit_polar_builds_1d_ramp() {
        let (null, _, scaler) = setup("ewa_lanczos", 1.0);
        assert_eq!(scaler.lut_dims, 1);
        let desc = null.texture_desc(scaler.lut.unwrap()).unwrap();
        assert_eq!(desc.w, SCALER_LUT_SIZE as u32);
        assert_eq!(desc.format, TextureFormat::R32F);
        assert!(scaler.kernel.as_ref().unwrap().radius_cutoff > 0.0);
    }

    #[test]
    fn test_reinit_same_config_is_noop() {
        let (_, backend, mut scaler) = setup("lanczos", 1.0);
        let lut = scaler.lut;
        scaler
            .reinit(&backend, &ScalerOpts::named("lanczos"), FILTER_SIZES, 1.0)
            .unwrap();
        assert_eq!(scaler.lut, lut);
    }

    #[test]
    fn test_extreme_downscale_degrades() {
        let (_, _, scaler) = setup("lanczos", 4.0);
        // lanczos radius 3 at 4x downscale needs 24 taps; 16 is the cap.
        assert!(scaler.insufficient);
        assert_eq!(scaler.kernel.as_ref().unwrap().size, 16);
    }

    #[test]
    fn test_fixed_scalers_have_no_kernel() {
        let (_, _, scaler) = setup("bilinear", 1.0);
        assert!(scaler.kernel.is_none());
        assert!(scaler.lut.is_none());
    }

    #[test]
    fn test_unknown_kernel_is_an_error() {
        let backend: Arc<dyn Backend> = Arc::new(NullBackend::new(vulkan_class_profile()));
        let mut scaler = Scaler::new();
        let r = scaler.reinit(&backend, &ScalerOpts::named("nosuch"), FILTER_SIZES, 1.0);
        assert!(matches!(r, Err(OpalError::InvalidArgument(_))));
    }

    #[test]
    fn test_separated_emits_one_tap_per_weight() {
        let (_, backend, scaler) = setup("lanczos", 1.0);
        let mut sc = session(&backend);
        sample_separated(&mut sc, &scaler, 1, 0);
        let n = scaler.kernel.as_ref().unwrap().size;
        let body = sc.body_text();
        assert_eq!(body.matches("color += vec4(weights[").count(), n);
        assert_eq!(body.matches("float weights[").count(), 1);
    }

    #[test]
    fn test_separated_antiring_clamps_center_taps() {
        let (_, backend, mut scaler) = setup("lanczos", 1.0);
        scaler.conf.antiring = 0.8;
        let mut sc = session(&backend);
        sample_separated(&mut sc, &scaler, 0, 1);
        let body = sc.body_text();
        assert_eq!(body.matches("lo = min(lo, c);").count(), 2);
        assert!(body.contains("clamp(color, lo, hi)"));
    }

    #[test]
    fn test_polar_skips_and_guards_boundary_samples() {
        let (_, backend, scaler) = setup("ewa_lanczos", 1.0);
        let mut sc = session(&backend);
        sample_polar(&mut sc, &scaler, 3, false);
        let body = sc.body_text();
        let kernel = scaler.kernel.as_ref().unwrap();
        let bound = kernel.radius_cutoff.ceil() as i64;
        let grid = (2 * bound) * (2 * bound);
        // Corner samples are dropped outright, so fewer distance checks
        // than grid positions; boundary samples get a runtime guard.
        let taps = body.matches("d = length(").count() as i64;
        assert!(taps > 0 && taps < grid, "taps = {}, grid = {}", taps, grid);
        assert!(body.contains("if (d < "));
        assert!(body.contains("color = color / vec4(wsum);"));
    }

    #[test]
    fn test_polar_gather_used_only_in_bounds() {
        let (_, backend, scaler) = setup("ewa_lanczos", 1.0);
        let mut sc = session(&backend);
        sample_polar(&mut sc, &scaler, 1, true);
        assert!(sc.body_text().contains("textureGatherOffset(tex, base,"));
        // Out-of-bounds blocks still fall back to direct taps.
        assert!(sc.body_text().contains("in0 = texture(tex, base + pt *"));
    }

    #[test]
    fn test_compute_polar_stages_shared_memory() {
        let (_, backend, scaler) = setup("ewa_lanczos", 1.0);
        let mut sc = session(&backend);
        compute_polar(&mut sc, &scaler, 2, 32, 8, 40, 16);
        assert!(sc.header_text().contains("shared float in0[640];"));
        assert!(sc.header_text().contains("shared float in1[640];"));
        assert!(sc.body_text().contains("groupMemoryBarrier();"));
    }

    #[test]
    fn test_oversample_applies_threshold() {
        let backend: Arc<dyn Backend> = Arc::new(NullBackend::new(vulkan_class_profile()));
        let mut scaler = Scaler::new();
        let mut conf = ScalerOpts::named("oversample");
        conf.params[0] = Some(0.1);
        scaler.reinit(&backend, &conf, FILTER_SIZES, 0.5).unwrap();
        let mut sc = session(&backend);
        sample_oversample(&mut sc, &scaler, 1920, 1080);
        assert!(sc.body_text().contains("(coeff - 0.100000) * 1.0/0.800000;"));
        assert!(sc.has_uniform("output_size"));
    }
}
