//! Dither matrix generation and the quantization fragment.
//!
//! Two matrix flavors: a classic ordered Bayer matrix and "fruit", a
//! deterministic void-and-cluster construction that distributes thresholds
//! blue-noise-like. Both are uploaded once as a single-channel float texture
//! and tiled over the output via gl_FragCoord.

use std::sync::Arc;

use opal_core::options::{DitherMode, DitherOpts};
use opal_core::{OpalError, OpalResult, TextureDesc, TextureFormat, TextureHandle};
use opal_shader::{Backend, ShaderCache};
use tracing::debug;

/// Ordered Bayer matrix with `size` (a power of two) entries per side.
/// Values are thresholds in [0, 1), each appearing exactly once.
pub fn ordered_matrix(size: usize) -> Vec<f32> {
    assert!(size.is_power_of_two());
    let mut m = vec![0u32];
    let mut n = 1;
    while n < size {
        let nn = 2 * n;
        let mut next = vec![0u32; nn * nn];
        for y in 0..n {
            for x in 0..n {
                let v = 4 * m[y * n + x];
                next[y * nn + x] = v;
                next[y * nn + x + n] = v + 2;
                next[(y + n) * nn + x] = v + 3;
                next[(y + n) * nn + x + n] = v + 1;
            }
        }
        m = next;
        n = nn;
    }
    let scale = 1.0 / (size * size) as f32;
    m.iter().map(|&v| (v as f32 + 0.5) * scale).collect()
}

/// Void-and-cluster threshold matrix. Each rank is placed at the current
/// energy minimum of a toroidal gaussian field, which spreads consecutive
/// thresholds apart spatially. Fully deterministic.
pub fn fruit_matrix(size: usize) -> Vec<f32> {
    assert!(size.is_power_of_two());
    let n = size * size;

    // Precomputed toroidal gaussian, indexed by wrapped (dy, dx).
    let sigma = size as f64 / 8.0;
    let inv2s2 = 1.0 / (2.0 * sigma * sigma);
    let mut kern = vec![0f64; n];
    for dy in 0..size {
        for dx in 0..size {
            let wy = dy.min(size - dy) as f64;
            let wx = dx.min(size - dx) as f64;
            kern[dy * size + dx] = (-(wx * wx + wy * wy) * inv2s2).exp();
        }
    }

    let mut energy = vec![0f64; n];
    let mut rank = vec![0usize; n];
    let mut placed = vec![false; n];
    // Seed placement in the center; every later one goes to the emptiest
    // spot of the field so far.
    let mut best = (size / 2) * size + size / 2;
    for k in 0..n {
        placed[best] = true;
        rank[best] = k;
        let (by, bx) = (best / size, best % size);
        for y in 0..size {
            let dy = (y + size - by) % size;
            for x in 0..size {
                let dx = (x + size - bx) % size;
                energy[y * size + x] += kern[dy * size + dx];
            }
        }
        let mut next = usize::MAX;
        let mut next_e = f64::INFINITY;
        for (i, &e) in energy.iter().enumerate() {
            if !placed[i] && e < next_e {
                next_e = e;
                next = i;
            }
        }
        best = if next == usize::MAX { 0 } else { next };
    }

    let scale = 1.0 / n as f32;
    rank.iter().map(|&r| (r as f32 + 0.5) * scale).collect()
}

// Temporal variation: the matrix is re-read through one of eight
// rotation/mirror transforms, cycled every few frames.
const TRAFOS: [[f32; 4]; 8] = [
    [1.0, 0.0, 0.0, 1.0],
    [0.0, -1.0, 1.0, 0.0],
    [-1.0, 0.0, 0.0, -1.0],
    [0.0, 1.0, -1.0, 0.0],
    [-1.0, 0.0, 0.0, 1.0],
    [0.0, 1.0, 1.0, 0.0],
    [1.0, 0.0, 0.0, -1.0],
    [0.0, -1.0, -1.0, 0.0],
];

/// Frames a single trafo stays active.
const TEMPORAL_PERIOD: u64 = 4;

/// An uploaded dither matrix ready for the output pass.
pub struct DitherState {
    tex: TextureHandle,
    size: u32,
    depth: u32,
    temporal: bool,
}

impl DitherState {
    /// Build the matrix for `opts` and upload it. `target_depth` is the
    /// output bit depth used when the options do not pin one. Returns None
    /// when dithering is off.
    pub fn new(
        backend: &Arc<dyn Backend>,
        opts: &DitherOpts,
        target_depth: u32,
    ) -> OpalResult<Option<Self>> {
        if opts.mode == DitherMode::None {
            return Ok(None);
        }
        if opts.size == 0 || opts.size > 8 {
            return Err(OpalError::InvalidArgument(format!(
                "dither size exponent {} out of range",
                opts.size
            )));
        }
        let size = 1usize << opts.size;
        let data = match opts.mode {
            DitherMode::Fruit => fruit_matrix(size),
            DitherMode::Ordered => ordered_matrix(size),
            DitherMode::None => unreachable!(),
        };

        let desc = TextureDesc {
            w: size as u32,
            h: size as u32,
            d: 1,
            format: TextureFormat::R32F,
            render_target: false,
            storage: false,
            linear_filter: false,
        };
        let tex = backend.create_texture(&desc)?;
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        backend.upload_texture(tex, &bytes)?;

        let depth = opts.depth.unwrap_or(target_depth).clamp(1, 16);
        debug!(mode = ?opts.mode, size, depth, "dither matrix uploaded");
        Ok(Some(Self {
            tex,
            size: size as u32,
            depth,
            temporal: opts.temporal,
        }))
    }

    pub fn release(self, backend: &Arc<dyn Backend>) {
        backend.destroy_texture(self.tex);
    }

    /// Quantize `color` to the output depth with the matrix as threshold.
    /// Needs gl_FragCoord, so only usable in fragment passes.
    pub fn fragment(&self, sc: &mut ShaderCache, frame: u64) {
        sc.add("// dithering");
        sc.uniform_texture("dither_lut", self.tex, 2);
        sc.add(format!(
            "vec2 dither_pos = gl_FragCoord.xy * 1.0/{}.0;",
            self.size
        ));
        if self.temporal {
            let t = ((frame / TEMPORAL_PERIOD) % 8) as usize;
            sc.uniform_dynamic();
            sc.uniform_mat2("dither_trafo", true, TRAFOS[t]);
            sc.add("dither_pos = dither_trafo * dither_pos;");
        }
        sc.add("float dither_value = texture(dither_lut, dither_pos).r;");
        let quant = ((1u32 << self.depth) - 1) as f64;
        sc.add(format!(
            "color = floor(color * {:.1} + vec4(dither_value) + vec4(0.5/{}.0)) * 1.0/{:.1};",
            quant,
            self.size * self.size,
            quant
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_shader::{vulkan_class_profile, NullBackend};

    fn is_permutation(data: &[f32]) -> bool {
        // Every threshold (k + 0.5)/n must appear exactly once.
        let n = data.len();
        let mut seen = vec![false; n];
        for &v in data {
            let k = (v * n as f32 - 0.5).round() as usize;
            if k >= n || seen[k] {
                return false;
            }
            seen[k] = true;
        }
        true
    }

    #[test]
    fn test_ordered_matrix_is_a_permutation() {
        let m = ordered_matrix(8);
        assert_eq!(m.len(), 64);
        assert!(is_permutation(&m));
    }

    #[test]
    fn test_ordered_2x2_base_pattern() {
        let m = ordered_matrix(2);
        // Classic Bayer order: 0, 2 / 3, 1 (offset by half a step).
        assert_eq!(m, vec![0.125, 0.625, 0.875, 0.375]);
    }

    #[test]
    fn test_fruit_matrix_is_a_permutation() {
        let m = fruit_matrix(16);
        assert_eq!(m.len(), 256);
        assert!(is_permutation(&m));
    }

    #[test]
    fn test_fruit_is_deterministic() {
        assert_eq!(fruit_matrix(8), fruit_matrix(8));
    }

    #[test]
    fn test_fruit_spreads_early_ranks() {
        // The second placement should not be adjacent to the first.
        let size = 16;
        let m = fruit_matrix(size);
        let pos = |rank: usize| {
            let i = m
                .iter()
                .position(|&v| (v * (size * size) as f32 - 0.5).round() as usize == rank)
                .unwrap();
            ((i / size) as i32, (i % size) as i32)
        };
        let (y0, x0) = pos(0);
        let (y1, x1) = pos(1);
        let dy = (y0 - y1).rem_euclid(size as i32).min((y1 - y0).rem_euclid(size as i32));
        let dx = (x0 - x1).rem_euclid(size as i32).min((x1 - x0).rem_euclid(size as i32));
        assert!(dx * dx + dy * dy > 8, "ranks 0 and 1 clustered at distance^2 {}", dx * dx + dy * dy);
    }

    #[test]
    fn test_state_uploads_unfiltered_texture() {
        let backend: Arc<NullBackend> = Arc::new(NullBackend::new(vulkan_class_profile()));
        let b: Arc<dyn Backend> = backend.clone();
        let opts = DitherOpts {
            size: 4,
            ..Default::default()
        };
        let state = DitherState::new(&b, &opts, 8).unwrap().unwrap();
        let desc = backend.texture_desc(state.tex).unwrap();
        assert_eq!(desc.w, 16);
        assert_eq!(desc.format, TextureFormat::R32F);
        assert!(!desc.linear_filter);
        assert_eq!(state.depth, 8);
    }

    #[test]
    fn test_mode_none_yields_no_state() {
        let backend: Arc<dyn Backend> = Arc::new(NullBackend::new(vulkan_class_profile()));
        let opts = DitherOpts {
            mode: DitherMode::None,
            ..Default::default()
        };
        assert!(DitherState::new(&backend, &opts, 8).unwrap().is_none());
    }

    #[test]
    fn test_fragment_quantizes_to_depth() {
        let null = Arc::new(NullBackend::new(vulkan_class_profile()));
        let backend: Arc<dyn Backend> = null.clone();
        let mut sc = ShaderCache::new(backend.clone());
        let opts = DitherOpts {
            depth: Some(8),
            size: 4,
            temporal: true,
            ..Default::default()
        };
        let state = DitherState::new(&backend, &opts, 10).unwrap().unwrap();
        let target = backend
            .create_texture(&TextureDesc::target(16, 16, TextureFormat::Rgba8))
            .unwrap();
        sc.add("vec4 color = vec4(0.5);");
        state.fragment(&mut sc, 9);
        sc.dispatch_draw(target, TextureFormat::Rgba8, false, &[], &[], 3)
            .unwrap();
        let frag = null.last_program_source().unwrap().fragment.unwrap();
        assert!(frag.contains("255.0"));
        assert!(frag.contains("dither_trafo * dither_pos"));
    }
}
