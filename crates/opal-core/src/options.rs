//! User-facing render options.
//!
//! These structs are plain serde-friendly data; validation and capability
//! downgrades happen where the options are consumed. Defaults match the
//! renderer's tuned values and are treated as configuration data.

use serde::{Deserialize, Serialize};

use crate::color::{Primaries, Transfer};

/// Configuration of one scaler unit (scale/dscale/cscale/tscale).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalerOpts {
    /// Kernel name, looked up in the filter kernel registry.
    pub kernel: String,
    /// Kernel-specific parameters (e.g. BC-spline b/c).
    pub params: [Option<f32>; 2],
    /// Window override and its parameter.
    pub window: Option<String>,
    pub wparam: Option<f32>,
    /// Blur/taper reshape the kernel; 0.0 leaves the kernel untouched.
    pub blur: f32,
    pub taper: f32,
    /// Weight-level anti-ringing clamp in [0,1].
    pub clamp: f32,
    /// Radius override for resizable kernels.
    pub radius: Option<f32>,
    /// Shader-level anti-ringing strength in [0,1].
    pub antiring: f32,
    /// Polar kernels: weights below this are considered zero.
    pub cutoff: f32,
}

impl Default for ScalerOpts {
    fn default() -> Self {
        Self {
            kernel: "lanczos".into(),
            params: [None, None],
            window: None,
            wparam: None,
            blur: 0.0,
            taper: 0.0,
            clamp: 0.0,
            radius: None,
            antiring: 0.0,
            cutoff: 0.001,
        }
    }
}

impl ScalerOpts {
    pub fn named(kernel: &str) -> Self {
        Self {
            kernel: kernel.into(),
            ..Default::default()
        }
    }
}

/// Tone-mapping curve selection. The numeric parameters of each curve are
/// empirically tuned configuration data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ToneCurve {
    Clip,
    Mobius,
    Reinhard,
    Hable,
    Gamma,
    Linear,
    #[default]
    Bt2390,
}

/// Peak detection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ComputePeak {
    /// On when the backend has compute shaders.
    #[default]
    Auto,
    Yes,
    No,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToneMapOpts {
    pub curve: ToneCurve,
    /// Curve-specific parameter (mobius knee, reinhard contrast, gamma).
    pub param: Option<f32>,
    /// Allowed over-brightening of SDR sources viewed on HDR targets.
    pub max_boost: f32,
    pub compute_peak: ComputePeak,
    /// Frames of half-life for the peak moving average.
    pub decay_rate: f32,
    /// Scene-cut hysteresis thresholds in dB of log-ratio brightness change.
    pub scene_threshold_low: f32,
    pub scene_threshold_high: f32,
    /// Desaturation strength base and exponent.
    pub desat: f32,
    pub desat_exp: f32,
    /// Colorimetrically clip out-of-gamut colors instead of hard clamping.
    pub gamut_clipping: bool,
}

impl Default for ToneMapOpts {
    fn default() -> Self {
        Self {
            curve: ToneCurve::default(),
            param: None,
            max_boost: 1.0,
            compute_peak: ComputePeak::Auto,
            decay_rate: 100.0,
            scene_threshold_low: 5.5,
            scene_threshold_high: 10.0,
            desat: 0.75,
            desat_exp: 1.5,
            gamut_clipping: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebandOpts {
    pub enabled: bool,
    pub iterations: u32,
    pub threshold: f32,
    pub range: f32,
    pub grain: f32,
}

impl Default for DebandOpts {
    fn default() -> Self {
        Self {
            enabled: false,
            iterations: 1,
            threshold: 32.0,
            range: 16.0,
            grain: 48.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DitherMode {
    /// Blue-noise-like matrix.
    #[default]
    Fruit,
    /// Ordered Bayer matrix.
    Ordered,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DitherOpts {
    pub mode: DitherMode,
    /// Output bit depth override; None derives it from the target.
    pub depth: Option<u32>,
    /// Matrix size exponent (2^n per side).
    pub size: u32,
    /// Rotate/mirror the matrix every few frames.
    pub temporal: bool,
}

impl Default for DitherOpts {
    fn default() -> Self {
        Self {
            mode: DitherMode::Fruit,
            depth: None,
            size: 6,
            temporal: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SigmoidOpts {
    pub enabled: bool,
    pub center: f32,
    pub slope: f32,
}

impl Default for SigmoidOpts {
    fn default() -> Self {
        Self {
            enabled: true,
            center: 0.75,
            slope: 6.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpolationOpts {
    pub enabled: bool,
    pub tscale: ScalerOpts,
    /// Skip interpolation when the vsync/frame duration ratio is already
    /// this close to an integer.
    pub threshold: f32,
}

impl Default for InterpolationOpts {
    fn default() -> Self {
        Self {
            enabled: false,
            tscale: ScalerOpts::named("mitchell"),
            threshold: 0.01,
        }
    }
}

/// How alpha in the source is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AlphaMode {
    /// Discard alpha.
    No,
    /// Write alpha through to the target.
    Yes,
    /// Blend against the solid background color.
    #[default]
    Blend,
    /// Blend against a checkerboard.
    BlendTiles,
}

/// Forced output color description; unset fields are auto-resolved.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TargetOpts {
    pub primaries: Option<Primaries>,
    pub transfer: Option<Transfer>,
    /// Target peak as a multiple of reference white.
    pub peak: Option<f32>,
}

/// Everything configurable about the render pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    pub scale: ScalerOpts,
    /// Downscale kernel; falls back to `scale` when unset.
    pub dscale: Option<ScalerOpts>,
    /// Chroma scale kernel; falls back to `scale` when unset.
    pub cscale: Option<ScalerOpts>,
    pub sigmoid: SigmoidOpts,
    /// Scale in linear light (implied by sigmoid on upscale and by HDR).
    pub linear_scaling: bool,
    pub correct_downscaling: bool,
    pub tone: ToneMapOpts,
    pub target: TargetOpts,
    pub deband: DebandOpts,
    pub dither: DitherOpts,
    pub interpolation: InterpolationOpts,
    pub alpha: AlphaMode,
    pub background_color: [f32; 3],
    /// Force the single-pass dumb path even on capable backends.
    pub dumb_mode: Option<bool>,
    /// Directory for the compiled-program disk cache.
    pub shader_cache_dir: Option<std::path::PathBuf>,
    /// Plain-text 3D LUT applied in target space after color mapping.
    pub lut_3d: Option<std::path::PathBuf>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            scale: ScalerOpts::default(),
            dscale: Some(ScalerOpts::named("mitchell")),
            cscale: None,
            sigmoid: SigmoidOpts::default(),
            linear_scaling: false,
            correct_downscaling: true,
            tone: ToneMapOpts::default(),
            target: TargetOpts::default(),
            deband: DebandOpts::default(),
            dither: DitherOpts::default(),
            interpolation: InterpolationOpts::default(),
            alpha: AlphaMode::default(),
            background_color: [0.0, 0.0, 0.0],
            dumb_mode: None,
            shader_cache_dir: None,
            lut_3d: None,
        }
    }
}

impl RenderOptions {
    /// True when nothing beyond bilinear sampling and the fixed conversion
    /// matrix is requested, making the dumb path a lossless choice.
    pub fn is_trivial(&self) -> bool {
        self.scale.kernel == "bilinear"
            && self.dscale.as_ref().map_or(true, |s| s.kernel == "bilinear")
            && self.cscale.as_ref().map_or(true, |s| s.kernel == "bilinear")
            && !self.deband.enabled
            && !self.interpolation.enabled
            && !self.linear_scaling
            && self.dither.mode == DitherMode::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_roundtrip_through_json() {
        let opts = RenderOptions::default();
        let json = serde_json::to_string(&opts).unwrap();
        let back: RenderOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(opts, back);
    }

    #[test]
    fn test_default_is_not_trivial() {
        // Lanczos scaling and fruit dithering need the full path.
        assert!(!RenderOptions::is_trivial(&RenderOptions::default()));
    }

    #[test]
    fn test_bilinear_no_extras_is_trivial() {
        let opts = RenderOptions {
            scale: ScalerOpts::named("bilinear"),
            dscale: None,
            dither: DitherOpts {
                mode: DitherMode::None,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(opts.is_trivial());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let opts: RenderOptions =
            serde_json::from_str(r#"{"deband": {"enabled": true}}"#).unwrap();
        assert!(opts.deband.enabled);
        assert_eq!(opts.deband.threshold, 32.0);
        assert_eq!(opts.scale.kernel, "lanczos");
    }
}
