//! Filter kernels: named combinations of a base weight function and a
//! window, with size selection and LUT computation.

use opal_core::options::ScalerOpts;
use tracing::warn;

use crate::window::{self, Window};

/// Number of rows (separable) or samples (polar) in a scaler LUT.
pub const SCALER_LUT_SIZE: usize = 256;

/// Legal discrete tap counts for spatial separable scalers.
pub const FILTER_SIZES: &[usize] = &[2, 4, 6, 8, 12, 16];

/// Legal tap counts for temporal interpolation.
pub const TSCALE_SIZES: &[usize] = &[2, 4, 6];

// Third zero of the jinc function, the conventional EWA lanczos support.
const JINC_ZERO3: f64 = 3.2383154841662362;

/// A named convolution kernel, plus the state filled in by [`Kernel::init`]
/// and [`Kernel::compute_lut`].
#[derive(Debug, Clone, Copy)]
pub struct Kernel {
    pub name: &'static str,
    /// Base weight function.
    pub f: Window,
    /// Window stretched over the whole support.
    pub window: Window,
    pub polar: bool,
    /// Negative-lobe attenuation in [0,1]; 1 clamps all ringing away.
    pub clamp: f64,
    /// Polar LUT: weights with magnitude at or below this end the support.
    pub value_cutoff: f64,

    /// Tap count chosen by `init` (1 for polar kernels).
    pub size: usize,
    /// Effective kernel stretch (>1 when downscaling or degraded).
    pub filter_scale: f64,
    /// Largest radius with a non-negligible weight, found during LUT
    /// computation of polar kernels.
    pub radius_cutoff: f64,
}

impl Kernel {
    const fn new(name: &'static str, f: Window, win: Window) -> Self {
        Self {
            name,
            f,
            window: win,
            polar: false,
            clamp: 0.0,
            value_cutoff: 0.0,
            size: 0,
            filter_scale: 1.0,
            radius_cutoff: 0.0,
        }
    }

    const fn polar(mut self) -> Self {
        self.polar = true;
        self
    }

    const fn blur(mut self, blur: f64) -> Self {
        self.f.blur = blur;
        self
    }

    /// Effective radius after any resize.
    pub fn radius(&self) -> f64 {
        self.f.radius
    }

    /// Apply user scaler options: params, blur/taper, clamp, radius and
    /// window overrides. Unknown window names are warned about and ignored.
    pub fn apply_opts(&mut self, opts: &ScalerOpts) {
        for (i, p) in opts.params.iter().enumerate() {
            if let Some(p) = p {
                self.f.params[i] = *p as f64;
            }
        }
        if opts.blur > 0.0 {
            self.f.blur = opts.blur as f64;
        }
        self.f.taper = opts.taper as f64;
        self.clamp = opts.clamp.clamp(0.0, 1.0) as f64;
        self.value_cutoff = opts.cutoff as f64;
        if let Some(r) = opts.radius {
            if self.f.resizable {
                self.f.radius = r as f64;
            } else {
                warn!(kernel = self.name, "radius override on a fixed-radius kernel, ignored");
            }
        }
        if let Some(wname) = &opts.window {
            match lookup_window(wname) {
                Some(mut w) => {
                    if let Some(wp) = opts.wparam {
                        w.params[0] = wp as f64;
                    }
                    self.window = w;
                }
                None => warn!(window = %wname, "unknown window, keeping kernel default"),
            }
        } else if let Some(wp) = opts.wparam {
            self.window.params[0] = wp as f64;
        }
    }

    /// Sample the full (windowed) kernel at distance x >= 0.
    pub fn sample(&self, x: f64) -> f64 {
        let w = self.window.sample(x / self.f.radius * self.window.radius);
        let k = w * self.f.sample(x);
        if k < 0.0 {
            k * (1.0 - self.clamp)
        } else {
            k
        }
    }

    /// Pick the tap count for this kernel given the legal sizes and the
    /// inverse scale factor (src/dst; > 1 when downscaling widens support).
    ///
    /// Returns false when the kernel had to be degraded to fit: the largest
    /// size is used with a recomputed effective scale. Never hard-fails.
    pub fn init(&mut self, sizes: &[usize], inv_scale: f64) -> bool {
        self.filter_scale = inv_scale.max(1.0);
        let mut src_radius = self.f.radius * self.filter_scale;

        if self.polar {
            // Polar kernels have no tap count; only guard against shaders
            // with absurd loop bounds.
            self.size = 1;
            if src_radius > 16.0 {
                src_radius = 16.0;
                self.filter_scale = src_radius / self.f.radius;
                return false;
            }
            return true;
        }

        let need = (2.0 * src_radius).ceil() as usize;
        for &s in sizes {
            if s >= need {
                self.size = s;
                return true;
            }
        }
        // Doesn't fit: use the largest size with a stretched kernel rather
        // than failing. The degradation is observable via the return value
        // and the changed filter_scale.
        let Some(&largest) = sizes.last() else {
            self.size = 2;
            return false;
        };
        self.size = largest;
        self.filter_scale = (self.size as f64 / 2.0) / self.f.radius;
        false
    }

    /// Compute one row of normalized weights for fractional offset
    /// `fcoord` in [0,1). `out` must hold `self.size` entries.
    pub fn weights(&self, fcoord: f64, out: &mut [f64]) {
        debug_assert_eq!(out.len(), self.size);
        let mut sum = 0.0;
        for (n, w) in out.iter_mut().enumerate() {
            let x = fcoord - (n as f64 - (self.size / 2) as f64 + 1.0);
            let c = x.abs() / self.filter_scale;
            let v = if c <= self.f.radius { self.sample(c) } else { 0.0 };
            *w = v;
            sum += v;
        }
        if sum != 0.0 {
            for w in out.iter_mut() {
                *w /= sum;
            }
        }
    }

    /// Fill a LUT for GPU sampling.
    ///
    /// Separable kernels get `count` rows of `size` weights (`stride` floats
    /// apart), one row per fractional offset. Polar kernels get a single
    /// `count`-entry ramp indexed by distance, and `radius_cutoff` is
    /// updated to the largest distance with a usable weight.
    pub fn compute_lut(&mut self, count: usize, stride: usize, out: &mut [f32]) {
        if self.polar {
            debug_assert!(out.len() >= count);
            self.radius_cutoff = 0.0;
            for (x, o) in out.iter_mut().take(count).enumerate() {
                let r = x as f64 * self.f.radius / (count - 1) as f64;
                let w = self.sample(r);
                *o = w as f32;
                if w.abs() > self.value_cutoff {
                    self.radius_cutoff = r;
                }
            }
        } else {
            debug_assert!(out.len() >= count * stride);
            let mut row = vec![0.0f64; self.size];
            for n in 0..count {
                self.weights(n as f64 / (count - 1) as f64, &mut row);
                for (i, w) in row.iter().enumerate() {
                    out[n * stride + i] = *w as f32;
                }
            }
        }
    }
}

/// Look up a window function by name.
pub fn lookup_window(name: &str) -> Option<Window> {
    let w = match name {
        "box" => Window::new(1.0, window::w_box),
        "triangle" | "bartlett" => Window::new(1.0, window::triangle),
        "cosine" => Window::new(std::f64::consts::FRAC_PI_2, window::cosine),
        "hanning" => Window::new(1.0, window::hanning),
        "hamming" => Window::new(1.0, window::hamming),
        "quadric" => Window::new(1.5, window::quadric),
        "welch" => Window::new(1.0, window::welch),
        "kaiser" => Window::new(1.0, window::kaiser),
        "blackman" => Window::new(1.0, window::blackman),
        "gaussian" => Window::resizable(2.0, window::gaussian),
        "sinc" => Window::resizable(1.0, window::sinc),
        "jinc" => Window::resizable(1.2196698912665045, window::jinc),
        "sphinx" => Window::resizable(1.4302966531242027, window::sphinx),
        _ => return None,
    };
    Some(w)
}

/// Look up a kernel by name. The returned kernel still needs
/// [`Kernel::apply_opts`] and [`Kernel::init`].
pub fn lookup(name: &str) -> Option<Kernel> {
    let bc = |name, b, c| {
        Kernel::new(
            name,
            Window::new(2.0, window::cubic_bc).with_params([b, c]),
            Window::new(1.0, window::w_box),
        )
    };
    let boxwin = Window::new(1.0, window::w_box);

    // Each arm names its literal again so the kernel carries a 'static name.
    let k = match name {
        "nearest" => Kernel::new("nearest", Window::new(0.5, window::w_box), boxwin),
        "box" => Kernel::new("box", Window::resizable(1.0, window::w_box), boxwin),
        "triangle" => Kernel::new("triangle", Window::resizable(1.0, window::triangle), boxwin),
        "cosine" => Kernel::new(
            "cosine",
            Window::new(std::f64::consts::FRAC_PI_2, window::cosine),
            boxwin,
        ),
        "gaussian" => Kernel::new("gaussian", Window::resizable(2.0, window::gaussian), boxwin),
        "quadric" => Kernel::new("quadric", Window::new(1.5, window::quadric), boxwin),
        "sinc" => Kernel::new("sinc", Window::resizable(2.0, window::sinc), boxwin),
        "lanczos" => Kernel::new(
            "lanczos",
            Window::resizable(3.0, window::sinc),
            Window::new(1.0, window::sinc),
        ),
        "ginseng" => Kernel::new(
            "ginseng",
            Window::resizable(3.0, window::sinc),
            Window::new(1.2196698912665045, window::jinc),
        ),
        "hermite" => bc("hermite", 0.0, 0.0),
        "bicubic" => bc("bicubic", 1.0, 0.0),
        "catmull_rom" => bc("catmull_rom", 0.0, 0.5),
        "mitchell" => bc("mitchell", 1.0 / 3.0, 1.0 / 3.0),
        "robidoux" => bc(
            "robidoux",
            12.0 / (19.0 + 9.0 * std::f64::consts::SQRT_2),
            113.0 / (58.0 + 216.0 * std::f64::consts::SQRT_2),
        ),
        "robidouxsharp" => bc(
            "robidouxsharp",
            6.0 / (13.0 + 7.0 * std::f64::consts::SQRT_2),
            7.0 / (2.0 + 12.0 * std::f64::consts::SQRT_2),
        ),
        "spline16" => Kernel::new("spline16", Window::new(2.0, window::spline16), boxwin),
        "spline36" => Kernel::new("spline36", Window::new(3.0, window::spline36), boxwin),
        "spline64" => Kernel::new("spline64", Window::new(4.0, window::spline64), boxwin),
        "ewa_lanczos" => Kernel::new(
            "ewa_lanczos",
            Window::resizable(JINC_ZERO3, window::jinc),
            Window::new(1.2196698912665045, window::jinc),
        )
        .polar(),
        "ewa_hanning" => Kernel::new(
            "ewa_hanning",
            Window::resizable(JINC_ZERO3, window::jinc),
            Window::new(1.0, window::hanning),
        )
        .polar(),
        "ewa_ginseng" => Kernel::new(
            "ewa_ginseng",
            Window::resizable(JINC_ZERO3, window::jinc),
            Window::new(1.0, window::sinc),
        )
        .polar(),
        "ewa_lanczossharp" => Kernel::new(
            "ewa_lanczossharp",
            Window::resizable(JINC_ZERO3, window::jinc),
            Window::new(1.2196698912665045, window::jinc),
        )
        .polar()
        .blur(0.9812505644269356),
        "ewa_lanczossoft" => Kernel::new(
            "ewa_lanczossoft",
            Window::resizable(JINC_ZERO3, window::jinc),
            Window::new(1.2196698912665045, window::jinc),
        )
        .polar()
        .blur(1.015),
        "ewa_robidoux" => bc(
            "ewa_robidoux",
            12.0 / (19.0 + 9.0 * std::f64::consts::SQRT_2),
            113.0 / (58.0 + 216.0 * std::f64::consts::SQRT_2),
        )
        .polar(),
        "ewa_robidouxsharp" => bc(
            "ewa_robidouxsharp",
            6.0 / (13.0 + 7.0 * std::f64::consts::SQRT_2),
            7.0 / (2.0 + 12.0 * std::f64::consts::SQRT_2),
        )
        .polar(),
        _ => return None,
    };
    Some(k)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_sum(kernel: &Kernel, fcoord: f64) -> f64 {
        let mut out = vec![0.0; kernel.size];
        kernel.weights(fcoord, &mut out);
        out.iter().sum()
    }

    #[test]
    fn test_weight_rows_sum_to_one() {
        for name in ["lanczos", "mitchell", "spline36", "triangle", "gaussian"] {
            for inv_scale in [0.5, 1.0, 1.7, 3.0] {
                let mut k = lookup(name).unwrap();
                k.init(FILTER_SIZES, inv_scale);
                for fcoord in [0.0, 0.25, 0.5, 0.99] {
                    let sum = row_sum(&k, fcoord);
                    assert!(
                        (sum - 1.0).abs() < 1e-6,
                        "{} inv_scale={} fcoord={}: sum={}",
                        name,
                        inv_scale,
                        fcoord,
                        sum
                    );
                }
            }
        }
    }

    #[test]
    fn test_size_picking_smallest_sufficient() {
        let mut k = lookup("lanczos").unwrap();
        // radius 3, inv_scale 1 -> needs 6 taps exactly.
        assert!(k.init(FILTER_SIZES, 1.0));
        assert_eq!(k.size, 6);
        // Downscale by 1.3 -> needs ceil(7.8) = 8.
        assert!(k.init(FILTER_SIZES, 1.3));
        assert_eq!(k.size, 8);
    }

    #[test]
    fn test_size_picking_never_below_smallest() {
        let mut k = lookup("nearest").unwrap();
        assert!(k.init(FILTER_SIZES, 1.0));
        assert_eq!(k.size, 2);
    }

    #[test]
    fn test_size_picking_degrades_to_largest() {
        let mut k = lookup("lanczos").unwrap();
        // Extreme downscale: 2*3*4 = 24 taps needed, 16 available.
        let fit = k.init(FILTER_SIZES, 4.0);
        assert!(!fit);
        assert_eq!(k.size, 16);
        // Effective scale recomputed so the kernel spans all 16 taps.
        assert!((k.filter_scale - 16.0 / 2.0 / 3.0).abs() < 1e-9);
        // Degraded or not, rows still normalize.
        assert!((row_sum(&k, 0.3) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_polar_radius_cutoff() {
        let mut k = lookup("ewa_lanczos").unwrap();
        k.value_cutoff = 0.001;
        assert!(k.init(FILTER_SIZES, 1.0));
        let mut lut = vec![0.0f32; SCALER_LUT_SIZE];
        k.compute_lut(SCALER_LUT_SIZE, 1, &mut lut);
        assert!(k.radius_cutoff > 0.0);
        assert!(k.radius_cutoff <= k.radius());
    }

    #[test]
    fn test_polar_extreme_downscale_degrades() {
        let mut k = lookup("ewa_lanczos").unwrap();
        let fit = k.init(FILTER_SIZES, 8.0);
        assert!(!fit);
        assert!(k.f.radius * k.filter_scale <= 16.0 + 1e-9);
    }

    #[test]
    fn test_separable_lut_rows() {
        let mut k = lookup("mitchell").unwrap();
        k.init(FILTER_SIZES, 1.0);
        assert_eq!(k.size, 4);
        let stride = 4;
        let mut lut = vec![0.0f32; SCALER_LUT_SIZE * stride];
        k.compute_lut(SCALER_LUT_SIZE, stride, &mut lut);
        // First row is fcoord 0: weight on the center tap dominates.
        let row0: Vec<f32> = lut[0..4].to_vec();
        let sum: f32 = row0.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_lookup_unknown_kernel() {
        assert!(lookup("nosuchkernel").is_none());
        assert!(lookup_window("nosuchwindow").is_none());
    }

    #[test]
    fn test_lookup_carries_matching_name() {
        for name in [
            "nearest",
            "box",
            "triangle",
            "cosine",
            "gaussian",
            "quadric",
            "sinc",
            "lanczos",
            "ginseng",
            "hermite",
            "bicubic",
            "catmull_rom",
            "mitchell",
            "robidoux",
            "robidouxsharp",
            "spline16",
            "spline36",
            "spline64",
            "ewa_lanczos",
            "ewa_hanning",
            "ewa_ginseng",
            "ewa_lanczossharp",
            "ewa_lanczossoft",
            "ewa_robidoux",
            "ewa_robidouxsharp",
        ] {
            let k = lookup(name).unwrap();
            assert_eq!(k.name, name);
        }
    }

    #[test]
    fn test_apply_opts_radius_and_clamp() {
        let mut k = lookup("lanczos").unwrap();
        let opts = ScalerOpts {
            radius: Some(2.0),
            clamp: 1.0,
            ..Default::default()
        };
        k.apply_opts(&opts);
        assert_eq!(k.f.radius, 2.0);
        // Full clamp kills all negative lobes.
        assert!(k.sample(1.3) >= 0.0);
    }
}
