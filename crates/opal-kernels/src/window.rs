//! Weight functions and the window abstraction.
//!
//! A [`Window`] is one radially symmetric weight function with a finite
//! radius, optional parameters, and blur/taper reshaping. Kernels combine a
//! base function with a second window stretched over the whole support.

/// Weight function evaluated at |x| within the window radius.
pub type WeightFn = fn(&Window, f64) -> f64;

/// One weight function with its support and tunables.
#[derive(Debug, Clone, Copy)]
pub struct Window {
    pub radius: f64,
    /// Radius may be overridden by the user.
    pub resizable: bool,
    /// Function parameters; NAN means "use the built-in default".
    pub params: [f64; 2],
    /// Stretch factor (> 1 blurs, < 1 sharpens). 0.0 means untouched.
    pub blur: f64,
    /// Flat-top region: |x| below this samples the peak.
    pub taper: f64,
    weight: WeightFn,
}

impl Window {
    pub const fn new(radius: f64, weight: WeightFn) -> Self {
        Self {
            radius,
            resizable: false,
            params: [f64::NAN, f64::NAN],
            blur: 0.0,
            taper: 0.0,
            weight,
        }
    }

    pub const fn resizable(radius: f64, weight: WeightFn) -> Self {
        Self {
            radius,
            resizable: true,
            params: [f64::NAN, f64::NAN],
            blur: 0.0,
            taper: 0.0,
            weight,
        }
    }

    pub const fn with_params(mut self, params: [f64; 2]) -> Self {
        self.params = params;
        self
    }

    /// Parameter with default fallback.
    pub fn param(&self, i: usize, default: f64) -> f64 {
        let p = self.params[i];
        if p.is_nan() {
            default
        } else {
            p
        }
    }

    /// Sample the window at distance x, applying blur and taper. Outside the
    /// (reshaped) radius the result is 0.
    pub fn sample(&self, x: f64) -> f64 {
        let mut x = x.abs();
        if self.blur > 0.0 {
            x /= self.blur;
        }
        if x <= self.taper {
            x = 0.0;
        } else if self.taper > 0.0 {
            x = (x - self.taper) * self.radius / (self.radius - self.taper);
        }
        if x < self.radius {
            (self.weight)(self, x)
        } else {
            0.0
        }
    }
}

pub fn w_box(_: &Window, _x: f64) -> f64 {
    1.0
}

pub fn triangle(k: &Window, x: f64) -> f64 {
    (1.0 - x / k.radius).max(0.0)
}

pub fn cosine(_: &Window, x: f64) -> f64 {
    x.cos()
}

pub fn hanning(_: &Window, x: f64) -> f64 {
    0.5 + 0.5 * (std::f64::consts::PI * x).cos()
}

pub fn hamming(_: &Window, x: f64) -> f64 {
    0.54 + 0.46 * (std::f64::consts::PI * x).cos()
}

pub fn quadric(_: &Window, x: f64) -> f64 {
    if x < 0.5 {
        0.75 - x * x
    } else if x < 1.5 {
        0.5 * (x - 1.5) * (x - 1.5)
    } else {
        0.0
    }
}

pub fn welch(_: &Window, x: f64) -> f64 {
    1.0 - x * x
}

// Zeroth order modified Bessel function of the first kind, by power series.
fn bessel_i0(x: f64) -> f64 {
    let mut sum = 1.0;
    let mut term = 1.0;
    let half_sq = x * x / 4.0;
    for k in 1..32 {
        term *= half_sq / (k as f64 * k as f64);
        sum += term;
        if term < 1e-12 * sum {
            break;
        }
    }
    sum
}

pub fn kaiser(k: &Window, x: f64) -> f64 {
    let alpha = k.param(0, 6.33);
    let t = 1.0 - x * x;
    if t < 0.0 {
        return 0.0;
    }
    bessel_i0(alpha * t.sqrt()) / bessel_i0(alpha)
}

pub fn blackman(k: &Window, x: f64) -> f64 {
    let a = k.param(0, 0.16);
    let pi_x = std::f64::consts::PI * x;
    (1.0 - a) / 2.0 + 0.5 * pi_x.cos() + a / 2.0 * (2.0 * pi_x).cos()
}

pub fn gaussian(k: &Window, x: f64) -> f64 {
    let p = k.param(0, 1.0);
    (-2.0 * x * x / p).exp()
}

pub fn sinc(_: &Window, x: f64) -> f64 {
    if x.abs() < 1e-8 {
        return 1.0;
    }
    let pi_x = std::f64::consts::PI * x;
    pi_x.sin() / pi_x
}

// First order Bessel function of the first kind, rational/asymptotic
// approximation (double precision is ample for 8-16 bit video weights).
fn bessel_j1(x: f64) -> f64 {
    let ax = x.abs();
    if ax < 8.0 {
        let y = x * x;
        let p1 = x
            * (72362614232.0
                + y * (-7895059235.0
                    + y * (242396853.1 + y * (-2972611.439 + y * (15704.48260 + y * -30.16036606)))));
        let p2 = 144725228442.0
            + y * (2300535178.0
                + y * (18583304.74 + y * (99447.43394 + y * (376.9991397 + y))));
        p1 / p2
    } else {
        let z = 8.0 / ax;
        let y = z * z;
        let xx = ax - 2.356194491;
        let p1 = 1.0
            + y * (0.183105e-2
                + y * (-0.3516396496e-4 + y * (0.2457520174e-5 + y * -0.240337019e-6)));
        let p2 = 0.04687499995
            + y * (-0.2002690873e-3
                + y * (0.8449199096e-5 + y * (-0.88228987e-6 + y * 0.105787412e-6)));
        let ans = (0.636619772 / ax).sqrt() * (xx.cos() * p1 - z * xx.sin() * p2);
        if x < 0.0 {
            -ans
        } else {
            ans
        }
    }
}

pub fn jinc(_: &Window, x: f64) -> f64 {
    if x.abs() < 1e-8 {
        return 1.0;
    }
    let pi_x = std::f64::consts::PI * x;
    2.0 * bessel_j1(pi_x) / pi_x
}

pub fn sphinx(_: &Window, x: f64) -> f64 {
    if x.abs() < 1e-8 {
        return 1.0;
    }
    let pi_x = std::f64::consts::PI * x;
    3.0 * (pi_x.sin() - pi_x * pi_x.cos()) / (pi_x * pi_x * pi_x)
}

/// BC-spline (Mitchell-Netravali family) with parameters b and c.
pub fn cubic_bc(k: &Window, x: f64) -> f64 {
    let b = k.param(0, 0.0);
    let c = k.param(1, 0.0);
    if x < 1.0 {
        ((12.0 - 9.0 * b - 6.0 * c) * x * x * x
            + (-18.0 + 12.0 * b + 6.0 * c) * x * x
            + (6.0 - 2.0 * b))
            / 6.0
    } else if x < 2.0 {
        ((-b - 6.0 * c) * x * x * x
            + (6.0 * b + 30.0 * c) * x * x
            + (-12.0 * b - 48.0 * c) * x
            + (8.0 * b + 24.0 * c))
            / 6.0
    } else {
        0.0
    }
}

pub fn spline16(_: &Window, x: f64) -> f64 {
    if x < 1.0 {
        ((x - 9.0 / 5.0) * x - 1.0 / 5.0) * x + 1.0
    } else {
        let x = x - 1.0;
        ((-1.0 / 3.0 * x + 4.0 / 5.0) * x - 7.0 / 15.0) * x
    }
}

pub fn spline36(_: &Window, x: f64) -> f64 {
    if x < 1.0 {
        ((13.0 / 11.0 * x - 453.0 / 209.0) * x - 3.0 / 209.0) * x + 1.0
    } else if x < 2.0 {
        let x = x - 1.0;
        ((-6.0 / 11.0 * x + 270.0 / 209.0) * x - 156.0 / 209.0) * x
    } else {
        let x = x - 2.0;
        ((1.0 / 11.0 * x - 45.0 / 209.0) * x + 26.0 / 209.0) * x
    }
}

pub fn spline64(_: &Window, x: f64) -> f64 {
    if x < 1.0 {
        ((49.0 / 41.0 * x - 6387.0 / 2911.0) * x - 3.0 / 2911.0) * x + 1.0
    } else if x < 2.0 {
        let x = x - 1.0;
        ((-24.0 / 41.0 * x + 4032.0 / 2911.0) * x - 2328.0 / 2911.0) * x
    } else if x < 3.0 {
        let x = x - 2.0;
        ((6.0 / 41.0 * x - 1008.0 / 2911.0) * x + 582.0 / 2911.0) * x
    } else {
        let x = x - 3.0;
        ((-1.0 / 41.0 * x + 168.0 / 2911.0) * x - 97.0 / 2911.0) * x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sinc_at_zero_and_integers() {
        let w = Window::new(3.0, sinc);
        assert!((w.sample(0.0) - 1.0).abs() < 1e-9);
        assert!(w.sample(1.0).abs() < 1e-9);
        assert!(w.sample(2.0).abs() < 1e-9);
    }

    #[test]
    fn test_jinc_at_zero() {
        let w = Window::new(3.2383154841662362, jinc);
        assert!((w.sample(0.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_jinc_first_zero() {
        // First zero of 2*J1(pi x)/(pi x) is at x ~ 1.2196699.
        let w = Window::new(4.0, jinc);
        assert!(w.sample(1.2196699).abs() < 1e-5);
    }

    #[test]
    fn test_mitchell_continuity_at_one() {
        let w = Window::new(2.0, cubic_bc).with_params([1.0 / 3.0, 1.0 / 3.0]);
        let below = w.sample(1.0 - 1e-9);
        let above = w.sample(1.0 + 1e-9);
        assert!((below - above).abs() < 1e-6);
    }

    #[test]
    fn test_kaiser_peak_is_one() {
        let w = Window::new(1.0, kaiser);
        assert!((w.sample(0.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_blur_stretches_support() {
        let mut w = Window::new(1.0, triangle);
        let sharp = w.sample(0.5);
        w.blur = 2.0;
        let blurred = w.sample(0.5);
        // Blur 2.0 samples the function at x/2, giving a larger weight.
        assert!(blurred > sharp);
    }

    #[test]
    fn test_taper_creates_flat_top() {
        let mut w = Window::new(1.0, triangle);
        w.taper = 0.25;
        assert_eq!(w.sample(0.1), w.sample(0.25));
        assert!(w.sample(1.0 - 1e-9).abs() < 1e-6);
    }

    #[test]
    fn test_spline36_interpolating() {
        let w = Window::new(3.0, spline36);
        assert!((w.sample(0.0) - 1.0).abs() < 1e-9);
        assert!(w.sample(1.0).abs() < 1e-6);
        assert!(w.sample(2.0).abs() < 1e-6);
    }
}
