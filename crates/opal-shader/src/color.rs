//! Color transform shader fragments: transfer curves, OOTFs, tone mapping
//! and gamut conversion, plus the host-side scalar versions of the curves.
//!
//! All fragments read and write the session's `vec4 color`. Linear light is
//! normalized so that 1.0 is reference white; multiply by the curve's
//! nominal peak to get an absolute scale.

use opal_core::{
    gamut_matrix, luma_coefficients, yuv_to_rgb_matrix, ColorDescription, Colorspace, Light,
    Transfer, REF_WHITE,
};
use opal_core::options::{DebandOpts, SigmoidOpts, ToneCurve, ToneMapOpts};

use crate::backend::BufferHandle;
use crate::cache::ShaderCache;

// SMPTE ST.2084 (PQ) constants.
const PQ_M1: f64 = 2610.0 / 4096.0 / 4.0;
const PQ_M2: f64 = 2523.0 / 4096.0 * 128.0;
const PQ_C1: f64 = 3424.0 / 4096.0;
const PQ_C2: f64 = 2413.0 / 4096.0 * 32.0;
const PQ_C3: f64 = 2392.0 / 4096.0 * 32.0;

// ARIB STD-B67 (HLG) constants.
const HLG_A: f64 = 0.17883277;
const HLG_B: f64 = 0.28466892;
const HLG_C: f64 = 0.55991073;

// The HLG OETF maps [0,12] to [0,1]; this is the encoded level of
// reference white.
const REF_WHITE_HLG: f64 = 3.17955;

// Panasonic V-Log constants.
const VLOG_B: f64 = 0.00873;
const VLOG_C: f64 = 0.241514;
const VLOG_D: f64 = 0.598206;

// Sony S-Log constants.
const SLOG_A: f64 = 0.432699;
const SLOG_B: f64 = 0.037584;
const SLOG_C: f64 = 0.616596 + 0.03;
const SLOG_P: f64 = 3.538813;
const SLOG_Q: f64 = 0.030001;
const SLOG_K2: f64 = 155.0 / 219.0;

// Average signal level of SDR content, i.e. 0.5 under a presentation gamma
// of about 2.0.
const SDR_AVG: f64 = 0.25;

fn nom_peak(trc: Transfer) -> f64 {
    trc.nominal_peak() as f64
}

/// Host-side transfer curve expansion, the scalar equivalent of
/// [`linearize`]. Input and output are both normalized to [0,1].
pub fn linearize_value(trc: Transfer, v: f64) -> f64 {
    let x = v.clamp(0.0, 1.0);
    let out = match trc {
        Transfer::Linear => return x,
        Transfer::Srgb => {
            if x > 0.04045 {
                ((x + 0.055) / 1.055).powf(2.4)
            } else {
                x / 12.92
            }
        }
        Transfer::Bt1886 | Transfer::Gamma24 => x.powf(2.4),
        Transfer::Gamma18 => x.powf(1.8),
        Transfer::Gamma20 => x.powf(2.0),
        Transfer::Gamma22 => x.powf(2.2),
        Transfer::Gamma26 => x.powf(2.6),
        Transfer::Gamma28 => x.powf(2.8),
        Transfer::ProPhoto => {
            if x > 0.03125 {
                x.powf(1.8)
            } else {
                x / 16.0
            }
        }
        Transfer::Pq => {
            let x = x.powf(1.0 / PQ_M2);
            let x = (x - PQ_C1).max(0.0) / (PQ_C2 - PQ_C3 * x);
            x.powf(1.0 / PQ_M1) * (10000.0 / REF_WHITE as f64)
        }
        Transfer::Hlg => {
            let x = if x > 0.5 {
                ((x - HLG_C) / HLG_A).exp() + HLG_B
            } else {
                4.0 * x * x
            };
            x / REF_WHITE_HLG
        }
        Transfer::VLog => {
            if x >= 0.181 {
                10f64.powf((x - VLOG_D) / VLOG_C) - VLOG_B
            } else {
                (x - 0.125) / 5.6
            }
        }
        Transfer::SLog1 => 10f64.powf((x - SLOG_C) / SLOG_A) - SLOG_B,
        Transfer::SLog2 => {
            if x >= SLOG_Q {
                (10f64.powf((x - SLOG_C) / SLOG_A) - SLOG_B) / SLOG_K2
            } else {
                (x - SLOG_Q) / SLOG_P
            }
        }
    };
    out / nom_peak(trc)
}

/// Host-side transfer curve compression, the scalar inverse of
/// [`linearize_value`].
pub fn delinearize_value(trc: Transfer, v: f64) -> f64 {
    let x = v.clamp(0.0, 1.0) * nom_peak(trc);
    match trc {
        Transfer::Linear => v.clamp(0.0, 1.0),
        Transfer::Srgb => {
            if x >= 0.0031308 {
                1.055 * x.powf(1.0 / 2.4) - 0.055
            } else {
                12.92 * x
            }
        }
        Transfer::Bt1886 | Transfer::Gamma24 => x.powf(1.0 / 2.4),
        Transfer::Gamma18 => x.powf(1.0 / 1.8),
        Transfer::Gamma20 => x.powf(1.0 / 2.0),
        Transfer::Gamma22 => x.powf(1.0 / 2.2),
        Transfer::Gamma26 => x.powf(1.0 / 2.6),
        Transfer::Gamma28 => x.powf(1.0 / 2.8),
        Transfer::ProPhoto => {
            if x >= 0.001953 {
                x.powf(1.0 / 1.8)
            } else {
                16.0 * x
            }
        }
        Transfer::Pq => pq_delinearize(x),
        Transfer::Hlg => {
            let x = x * REF_WHITE_HLG;
            if x > 1.0 {
                HLG_A * (x - HLG_B).ln() + HLG_C
            } else {
                0.5 * x.sqrt()
            }
        }
        Transfer::VLog => {
            if x >= 0.01 {
                VLOG_C * (x + VLOG_B).log10() + VLOG_D
            } else {
                5.6 * x + 0.125
            }
        }
        Transfer::SLog1 => SLOG_A * (x + SLOG_B).log10() + SLOG_C,
        Transfer::SLog2 => {
            if x >= 0.0 {
                SLOG_A * (SLOG_K2 * x + SLOG_B).log10() + SLOG_C
            } else {
                SLOG_P * x + SLOG_Q
            }
        }
    }
}

fn pq_delinearize(x: f64) -> f64 {
    let x = x * REF_WHITE as f64 / 10000.0;
    let x = x.powf(PQ_M1);
    let x = (PQ_C1 + PQ_C2 * x) / (1.0 + PQ_C3 * x);
    x.powf(PQ_M2)
}

/// Expand `color.rgb` from the given transfer curve to normalized linear
/// light. This is the ITU-R EOTF on an idealized reference display.
pub fn linearize(sc: &mut ShaderCache, trc: Transfer) {
    if trc == Transfer::Linear {
        return;
    }

    sc.add("// linearize");

    // Not all curves are well-defined outside [0,1], so sub-blacks and
    // super-whites are clipped before expansion.
    sc.add("color.rgb = clamp(color.rgb, 0.0, 1.0);");

    match trc {
        Transfer::Srgb => {
            sc.add(format!(
                "color.rgb = mix(color.rgb * vec3(1.0/12.92), \
                 pow((color.rgb + vec3(0.055))/vec3(1.055), vec3(2.4)), \
                 {}(lessThan(vec3(0.04045), color.rgb)));",
                sc.bvec(3)
            ));
        }
        Transfer::Bt1886 => sc.add("color.rgb = pow(color.rgb, vec3(2.4));"),
        Transfer::Gamma18 => sc.add("color.rgb = pow(color.rgb, vec3(1.8));"),
        Transfer::Gamma20 => sc.add("color.rgb = pow(color.rgb, vec3(2.0));"),
        Transfer::Gamma22 => sc.add("color.rgb = pow(color.rgb, vec3(2.2));"),
        Transfer::Gamma24 => sc.add("color.rgb = pow(color.rgb, vec3(2.4));"),
        Transfer::Gamma26 => sc.add("color.rgb = pow(color.rgb, vec3(2.6));"),
        Transfer::Gamma28 => sc.add("color.rgb = pow(color.rgb, vec3(2.8));"),
        Transfer::ProPhoto => {
            sc.add(format!(
                "color.rgb = mix(color.rgb * vec3(1.0/16.0), \
                 pow(color.rgb, vec3(1.8)), \
                 {}(lessThan(vec3(0.03125), color.rgb)));",
                sc.bvec(3)
            ));
        }
        Transfer::Pq => {
            sc.add(format!("color.rgb = pow(color.rgb, vec3(1.0/{:.6}));", PQ_M2));
            sc.add(format!(
                "color.rgb = max(color.rgb - vec3({:.6}), vec3(0.0)) \
                 / (vec3({:.6}) - vec3({:.6}) * color.rgb);",
                PQ_C1, PQ_C2, PQ_C3
            ));
            sc.add(format!("color.rgb = pow(color.rgb, vec3({:.6}));", 1.0 / PQ_M1));
            // PQ is defined on an absolute scale of 0-10000 cd/m^2; rescale
            // so 1.0 is reference white.
            sc.add(format!("color.rgb *= vec3({:.6});", 10000.0 / REF_WHITE as f64));
        }
        Transfer::Hlg => {
            sc.add(format!(
                "color.rgb = mix(vec3(4.0) * color.rgb * color.rgb, \
                 exp((color.rgb - vec3({:.6})) * vec3(1.0/{:.6})) + vec3({:.6}), \
                 {}(lessThan(vec3(0.5), color.rgb)));",
                HLG_C,
                HLG_A,
                HLG_B,
                sc.bvec(3)
            ));
            sc.add(format!("color.rgb *= vec3(1.0/{:.6});", REF_WHITE_HLG));
        }
        Transfer::VLog => {
            sc.add(format!(
                "color.rgb = mix((color.rgb - vec3(0.125)) * vec3(1.0/5.6), \
                 pow(vec3(10.0), (color.rgb - vec3({:.6})) * vec3(1.0/{:.6})) - vec3({:.6}), \
                 {}(lessThanEqual(vec3(0.181), color.rgb)));",
                VLOG_D,
                VLOG_C,
                VLOG_B,
                sc.bvec(3)
            ));
        }
        Transfer::SLog1 => {
            sc.add(format!(
                "color.rgb = pow(vec3(10.0), (color.rgb - vec3({:.6})) * vec3(1.0/{:.6})) \
                 - vec3({:.6});",
                SLOG_C, SLOG_A, SLOG_B
            ));
        }
        Transfer::SLog2 => {
            sc.add(format!(
                "color.rgb = mix((color.rgb - vec3({:.6})) * vec3(1.0/{:.6}), \
                 (pow(vec3(10.0), (color.rgb - vec3({:.6})) * vec3(1.0/{:.6})) \
                 - vec3({:.6})) * vec3(1.0/{:.6}), \
                 {}(lessThanEqual(vec3({:.6}), color.rgb)));",
                SLOG_Q,
                SLOG_P,
                SLOG_C,
                SLOG_A,
                SLOG_B,
                SLOG_K2,
                sc.bvec(3),
                SLOG_Q
            ));
        }
        Transfer::Linear => unreachable!(),
    }

    // Normalize so non-float textures don't clip the HDR range.
    sc.add(format!("color.rgb *= vec3(1.0/{:.6});", nom_peak(trc)));
}

/// Compress normalized linear `color.rgb` with the given transfer curve:
/// the inverse EOTF, again assuming a reference display.
pub fn delinearize(sc: &mut ShaderCache, trc: Transfer) {
    if trc == Transfer::Linear {
        return;
    }

    sc.add("// delinearize");
    sc.add("color.rgb = clamp(color.rgb, 0.0, 1.0);");
    sc.add(format!("color.rgb *= vec3({:.6});", nom_peak(trc)));

    match trc {
        Transfer::Srgb => {
            sc.add(format!(
                "color.rgb = mix(color.rgb * vec3(12.92), \
                 vec3(1.055) * pow(color.rgb, vec3(1.0/2.4)) - vec3(0.055), \
                 {}(lessThanEqual(vec3(0.0031308), color.rgb)));",
                sc.bvec(3)
            ));
        }
        Transfer::Bt1886 => sc.add("color.rgb = pow(color.rgb, vec3(1.0/2.4));"),
        Transfer::Gamma18 => sc.add("color.rgb = pow(color.rgb, vec3(1.0/1.8));"),
        Transfer::Gamma20 => sc.add("color.rgb = pow(color.rgb, vec3(1.0/2.0));"),
        Transfer::Gamma22 => sc.add("color.rgb = pow(color.rgb, vec3(1.0/2.2));"),
        Transfer::Gamma24 => sc.add("color.rgb = pow(color.rgb, vec3(1.0/2.4));"),
        Transfer::Gamma26 => sc.add("color.rgb = pow(color.rgb, vec3(1.0/2.6));"),
        Transfer::Gamma28 => sc.add("color.rgb = pow(color.rgb, vec3(1.0/2.8));"),
        Transfer::ProPhoto => {
            sc.add(format!(
                "color.rgb = mix(color.rgb * vec3(16.0), \
                 pow(color.rgb, vec3(1.0/1.8)), \
                 {}(lessThanEqual(vec3(0.001953), color.rgb)));",
                sc.bvec(3)
            ));
        }
        Transfer::Pq => {
            sc.add(format!("color.rgb *= vec3(1.0/{:.6});", 10000.0 / REF_WHITE as f64));
            sc.add(format!("color.rgb = pow(color.rgb, vec3({:.6}));", PQ_M1));
            sc.add(format!(
                "color.rgb = (vec3({:.6}) + vec3({:.6}) * color.rgb) \
                 / (vec3(1.0) + vec3({:.6}) * color.rgb);",
                PQ_C1, PQ_C2, PQ_C3
            ));
            sc.add(format!("color.rgb = pow(color.rgb, vec3({:.6}));", PQ_M2));
        }
        Transfer::Hlg => {
            sc.add(format!("color.rgb *= vec3({:.6});", REF_WHITE_HLG));
            sc.add(format!(
                "color.rgb = mix(vec3(0.5) * sqrt(color.rgb), \
                 vec3({:.6}) * log(color.rgb - vec3({:.6})) + vec3({:.6}), \
                 {}(lessThan(vec3(1.0), color.rgb)));",
                HLG_A,
                HLG_B,
                HLG_C,
                sc.bvec(3)
            ));
        }
        Transfer::VLog => {
            sc.add(format!(
                "color.rgb = mix(vec3(5.6) * color.rgb + vec3(0.125), \
                 vec3({:.6}) * log(color.rgb + vec3({:.6})) + vec3({:.6}), \
                 {}(lessThanEqual(vec3(0.01), color.rgb)));",
                VLOG_C / std::f64::consts::LN_10,
                VLOG_B,
                VLOG_D,
                sc.bvec(3)
            ));
        }
        Transfer::SLog1 => {
            sc.add(format!(
                "color.rgb = vec3({:.6}) * log(color.rgb + vec3({:.6})) + vec3({:.6});",
                SLOG_A / std::f64::consts::LN_10,
                SLOG_B,
                SLOG_C
            ));
        }
        Transfer::SLog2 => {
            sc.add(format!(
                "color.rgb = mix(vec3({:.6}) * color.rgb + vec3({:.6}), \
                 vec3({:.6}) * log(vec3({:.6}) * color.rgb + vec3({:.6})) + vec3({:.6}), \
                 {}(lessThanEqual(vec3(0.0), color.rgb)));",
                SLOG_P,
                SLOG_Q,
                SLOG_A / std::f64::consts::LN_10,
                SLOG_K2,
                SLOG_B,
                SLOG_C,
                sc.bvec(3)
            ));
        }
        Transfer::Linear => unreachable!(),
    }
}

fn hlg_ootf_gamma(peak: f64) -> f64 {
    // BT.2100 HLG OOTF gamma, scaled to the chosen display peak.
    (1.2 + 0.42 * (peak * REF_WHITE as f64 / 1000.0).log10()).max(1.0)
}

/// Map from a scene-referred light type to display-referred light. Assumes
/// absolute scale values and requires a `src_luma` uniform.
pub fn ootf(sc: &mut ShaderCache, light: Light, peak: f32) {
    if light == Light::Display {
        return;
    }

    sc.add("// apply ootf");

    match light {
        Light::SceneHlg => {
            let gamma = hlg_ootf_gamma(peak as f64);
            sc.add(format!(
                "color.rgb *= vec3({:.6} * pow(dot(src_luma, color.rgb), {:.6}));",
                peak as f64 / (12.0 / REF_WHITE_HLG).powf(gamma),
                gamma - 1.0
            ));
        }
        Light::Scene709_1886 => {
            // Encode as 709, decode as 1886. The coefficients are the more
            // precise BT.2020 versions.
            sc.add(format!(
                "color.rgb = mix(color.rgb * vec3(4.5), \
                 vec3(1.0993) * pow(color.rgb, vec3(0.45)) - vec3(0.0993), \
                 {}(lessThan(vec3(0.0181), color.rgb)));",
                sc.bvec(3)
            ));
            sc.add("color.rgb = pow(color.rgb, vec3(2.4));");
        }
        Light::Scene12 => sc.add("color.rgb = pow(color.rgb, vec3(1.2));"),
        Light::Display => unreachable!(),
    }
}

/// Inverse of [`ootf`]. Requires a `src_luma` uniform for HLG.
pub fn inverse_ootf(sc: &mut ShaderCache, light: Light, peak: f32) {
    if light == Light::Display {
        return;
    }

    sc.add("// apply inverse ootf");

    match light {
        Light::SceneHlg => {
            let gamma = hlg_ootf_gamma(peak as f64);
            sc.add(format!(
                "color.rgb *= vec3(1.0/{:.6});",
                peak as f64 / (12.0 / REF_WHITE_HLG).powf(gamma)
            ));
            sc.add(format!(
                "color.rgb /= vec3(max(1e-6, pow(dot(src_luma, color.rgb), {:.6})));",
                (gamma - 1.0) / gamma
            ));
        }
        Light::Scene709_1886 => {
            sc.add("color.rgb = pow(color.rgb, vec3(1.0/2.4));");
            sc.add(format!(
                "color.rgb = mix(color.rgb * vec3(1.0/4.5), \
                 pow((color.rgb + vec3(0.0993)) * vec3(1.0/1.0993), vec3(1.0/0.45)), \
                 {}(lessThan(vec3(0.08145), color.rgb)));",
                sc.bvec(3)
            ));
        }
        Light::Scene12 => sc.add("color.rgb = pow(color.rgb, vec3(1.0/1.2));"),
        Light::Display => unreachable!(),
    }
}

fn sigmoid_coeffs(opts: &SigmoidOpts) -> (f64, f64, f64, f64) {
    let center = opts.center as f64;
    let slope = opts.slope as f64;
    // The curve must pass through (0,0) and (1,1), so factor out the values
    // of the raw sigmoid at those points.
    let offset = 1.0 / (1.0 + (slope * center).exp());
    let scale = 1.0 / (1.0 + (slope * (center - 1.0)).exp()) - offset;
    (center, slope, offset, scale)
}

/// Move linear light into sigmoidal space, for ring-free upscaling.
pub fn sigmoidize(sc: &mut ShaderCache, opts: &SigmoidOpts) {
    let (center, slope, offset, scale) = sigmoid_coeffs(opts);
    sc.add("color.rgb = clamp(color.rgb, 0.0, 1.0);");
    sc.add(format!(
        "color.rgb = vec3({:.6}) - vec3({:.6}) * log(vec3(1.0) / \
         (color.rgb * vec3({:.6}) + vec3({:.6})) - vec3(1.0));",
        center,
        1.0 / slope,
        scale,
        offset
    ));
}

/// Inverse of [`sigmoidize`].
pub fn desigmoidize(sc: &mut ShaderCache, opts: &SigmoidOpts) {
    let (center, slope, offset, scale) = sigmoid_coeffs(opts);
    sc.add("color.rgb = clamp(color.rgb, 0.0, 1.0);");
    sc.add(format!(
        "color.rgb = (1.0/(1.0 + exp(vec3({:.6}) * (vec3({:.6}) - color.rgb))) \
         - vec3({:.6})) / vec3({:.6});",
        slope, center, offset, scale
    ));
}

/// Decode the fixed-function input conversion: levels expansion and the
/// YUV decoding matrix, plus the nonlinear part of constant-luminance
/// BT.2020 and the DCI XYZ gamma.
pub fn convert_input(sc: &mut ShaderCache, color: &ColorDescription) {
    sc.add("// color conversion");

    let m = yuv_to_rgb_matrix(color.space, color.levels, color.primaries);
    sc.uniform_mat3("color_matrix", m.m.to_gl());
    sc.uniform_vec3("color_matrix_c", m.c);
    sc.add("color.rgb = mat3(color_matrix) * color.rgb + color_matrix_c;");

    match color.space {
        Colorspace::Bt2020Cl => {
            // Constant luminance: the matrix only expanded levels; the
            // actual decoding is nonlinear.
            sc.add("color.rgb = clamp(color.rgb, 0.0, 1.0);");
            sc.add(format!(
                "color.rgb = mix(color.rgb * vec3(1.0/4.5), \
                 pow((color.rgb + vec3(0.0993)) * vec3(1.0/1.0993), vec3(1.0/0.45)), \
                 {}(lessThanEqual(vec3(0.08145), color.rgb)));",
                sc.bvec(3)
            ));
        }
        Colorspace::Xyz => {
            // DCI XYZ is always encoded with gamma 2.6.
            sc.add("color.rgb = pow(color.rgb, vec3(2.6));");
        }
        _ => {}
    }
}

/// Running peak detection over the tone-mapping statistics buffer. Only
/// valid inside a compute pass with the `PeakDetect` SSBO bound.
fn hdr_update_peak(sc: &mut ShaderCache, opts: &ToneMapOpts) {
    // Seed sig_peak/sig_avg from the previous frames' state.
    sc.add("if (average.y > 0.0) {");
    sc.add("    sig_avg  = max(1e-3, average.x);");
    sc.add("    sig_peak = max(1.00, average.y);");
    sc.add("}");

    // Fixed-point scales chosen to not overflow on an 8K buffer.
    let (log_min, log_scale, sig_scale) = (1e-3f64, 400.0f64, 10000.0f64);

    // Tally per-workgroup sub-results in shared memory first.
    sc.hadd("shared int wg_sum;");
    sc.hadd("shared uint wg_max;");
    sc.add("wg_sum = 0; wg_max = 0u;");
    sc.add("barrier();");
    sc.add(format!("float sig_log = log(max(sig_max, {:.6}));", log_min));
    sc.add(format!("atomicAdd(wg_sum, int(sig_log * {:.6}));", log_scale));
    sc.add(format!("atomicMax(wg_max, uint(sig_max * {:.6}));", sig_scale));

    // One thread per workgroup updates the global atomics.
    sc.add("memoryBarrierShared();");
    sc.add("barrier();");
    sc.add("if (gl_LocalInvocationIndex == 0u) {");
    sc.add("    int wg_avg = wg_sum / int(gl_WorkGroupSize.x * gl_WorkGroupSize.y);");
    sc.add("    atomicAdd(frame_sum, wg_avg);");
    sc.add("    atomicMax(frame_max, wg_max);");
    sc.add("    memoryBarrierBuffer();");
    sc.add("}");
    sc.add("barrier();");

    // The last workgroup to finish folds the frame statistics into the
    // running average.
    sc.add("uint num_wg = gl_NumWorkGroups.x * gl_NumWorkGroups.y;");
    sc.add("if (gl_LocalInvocationIndex == 0u && atomicAdd(counter, 1u) == num_wg - 1u) {");
    sc.add("    counter = 0u;");
    sc.add("    vec2 cur = vec2(float(frame_sum) / float(num_wg), frame_max);");
    sc.add(format!("    cur *= vec2(1.0/{:.6}, 1.0/{:.6});", log_scale, sig_scale));
    sc.add("    cur.x = exp(cur.x);");
    sc.add("    if (average.y == 0.0)");
    sc.add("        average = cur;");

    // IIR low-pass with the configured time constant.
    let a = 1.0 - (1.0 / opts.decay_rate as f64).cos();
    let decay = (a * a + 2.0 * a).sqrt() - a;
    sc.add(format!("    average += {:.6} * (cur - average);", decay));

    // Scene change hysteresis.
    let log_db = 10.0 / 10f64.ln();
    sc.add(format!(
        "    float weight = smoothstep({:.6}, {:.6}, abs(log(cur.x / average.x)));",
        opts.scene_threshold_low as f64 / log_db,
        opts.scene_threshold_high as f64 / log_db
    ));
    sc.add("    average = mix(average, cur, weight);");

    sc.add("    frame_sum = 0; frame_max = 0u;");
    sc.add("    memoryBarrierBuffer();");
    sc.add("}");
}

/// Tone map from `src_peak` down to `dst_peak`, both as multiples of
/// reference white. With `detect_peak` the tagged peak is replaced by the
/// measured running peak.
pub fn tone_map(
    sc: &mut ShaderCache,
    src_peak: f32,
    dst_peak: f32,
    detect_peak: bool,
    opts: &ToneMapOpts,
) {
    sc.add("// HDR tone mapping");

    // Tone map based on the brightest component to prevent discoloration
    // from out-of-bounds clipping.
    sc.add("int sig_idx = 0;");
    sc.add("if (color[1] > color[sig_idx]) sig_idx = 1;");
    sc.add("if (color[2] > color[sig_idx]) sig_idx = 2;");
    sc.add("float sig_max = color[sig_idx];");
    sc.add(format!("float sig_peak = {:.6};", src_peak as f64));
    sc.add(format!("float sig_avg = {:.6};", SDR_AVG));

    if detect_peak {
        hdr_update_peak(sc, opts);
    }

    // Hard-clip the upper bound; the curves explode on inputs above the
    // peak.
    sc.add("vec3 sig = min(color.rgb, sig_peak);");

    // BT.2390 operates on an absolute scale and does its own target
    // normalization.
    let dst_scale = if opts.curve == ToneCurve::Bt2390 {
        1.0f64
    } else {
        dst_peak as f64
    };

    // Rescale so 1.0 represents dst_peak; the curves all map to [0,1].
    if dst_scale > 1.0 {
        sc.add(format!("sig *= 1.0/{:.6};", dst_scale));
        sc.add(format!("sig_peak *= 1.0/{:.6};", dst_scale));
    }

    sc.add("float sig_orig = sig[sig_idx];");
    sc.add(format!(
        "float slope = min({:.6}, {:.6} / sig_avg);",
        opts.max_boost as f64, SDR_AVG
    ));
    sc.add("sig *= slope;");
    sc.add("sig_peak *= slope;");

    let param = opts.param.map(|p| p as f64);
    match opts.curve {
        ToneCurve::Clip => {
            sc.add(format!("sig = min({:.6} * sig, 1.0);", param.unwrap_or(1.0)));
        }

        ToneCurve::Mobius => {
            sc.add("if (sig_peak > (1.0 + 1e-6)) {");
            sc.add(format!("const float j = {:.6};", param.unwrap_or(0.3)));
            // Solve for M(j) = j, M(sig_peak) = 1.0, M'(j) = 1.0, where
            // M(x) = scale * (x+a)/(x+b).
            sc.add("float a = -j*j * (sig_peak - 1.0) / (j*j - 2.0*j + sig_peak);");
            sc.add(
                "float b = (j*j - 2.0*j*sig_peak + sig_peak) / max(1e-6, sig_peak - 1.0);",
            );
            sc.add("float scale = (b*b + 2.0*b*j + j*j) / (b-a);");
            sc.add(format!(
                "sig = mix(sig, scale * (sig + vec3(a)) / (sig + vec3(b)), \
                 {}(greaterThan(sig, vec3(j))));",
                sc.bvec(3)
            ));
            sc.add("}");
        }

        ToneCurve::Reinhard => {
            let contrast = param.unwrap_or(0.5);
            let offset = (1.0 - contrast) / contrast;
            sc.add(format!("sig = sig / (sig + vec3({:.6}));", offset));
            sc.add(format!("float scale = (sig_peak + {:.6}) / sig_peak;", offset));
            sc.add("sig *= scale;");
        }

        ToneCurve::Hable => {
            let (a, b, c, d, e, f) = (0.15, 0.50, 0.10, 0.20, 0.02, 0.30);
            sc.hadd("vec3 hable(vec3 x) {");
            sc.hadd(format!(
                "return (x * ({:.6}*x + vec3({:.6})) + vec3({:.6})) / \
                 (x * ({:.6}*x + vec3({:.6})) + vec3({:.6})) - vec3({:.6});",
                a,
                c * b,
                d * e,
                a,
                b,
                d * f,
                e / f
            ));
            sc.hadd("}");
            sc.add("sig = hable(max(vec3(0.0), sig)) / hable(vec3(sig_peak)).x;");
        }

        ToneCurve::Gamma => {
            let gamma = param.unwrap_or(1.8);
            sc.add(format!("const float cutoff = 0.05, gamma = 1.0/{:.6};", gamma));
            sc.add("float scale = pow(cutoff / sig_peak, gamma) / cutoff;");
            sc.add(format!(
                "sig = mix(scale * sig, pow(sig / sig_peak, vec3(gamma)), \
                 {}(greaterThan(sig, vec3(cutoff))));",
                sc.bvec(3)
            ));
        }

        ToneCurve::Linear => {
            let coeff = param.unwrap_or(1.0);
            sc.add(format!("sig = min({:.6} / sig_peak, 1.0) * sig;", coeff));
        }

        ToneCurve::Bt2390 => {
            // Encode both sig and sig_peak into PQ space.
            sc.add(format!(
                "vec4 sig_pq = vec4(sig.rgb, sig_peak);\n\
                 sig_pq *= vec4(1.0/{:.6});\n\
                 sig_pq = pow(sig_pq, vec4({:.6}));\n\
                 sig_pq = (vec4({:.6}) + vec4({:.6}) * sig_pq) \
                 / (vec4(1.0) + vec4({:.6}) * sig_pq);\n\
                 sig_pq = pow(sig_pq, vec4({:.6}));",
                10000.0 / REF_WHITE as f64,
                PQ_M1,
                PQ_C1,
                PQ_C2,
                PQ_C3,
                PQ_M2
            ));
            // Everything becomes relative to the source peak; find the
            // target peak in that space.
            sc.add(format!(
                "float scale = 1.0 / sig_pq.a;\n\
                 sig_pq.rgb *= vec3(scale);\n\
                 float maxLum = {:.6} * scale;",
                pq_delinearize(dst_peak as f64)
            ));
            // Piece-wise hermite spline above the knee.
            sc.add(format!(
                "float ks = 1.5 * maxLum - 0.5;\n\
                 vec3 tb = (sig_pq.rgb - vec3(ks)) / vec3(1.0 - ks);\n\
                 vec3 tb2 = tb * tb;\n\
                 vec3 tb3 = tb2 * tb;\n\
                 vec3 pb = (2.0 * tb3 - 3.0 * tb2 + vec3(1.0)) * vec3(ks) + \
                 (tb3 - 2.0 * tb2 + tb) * vec3(1.0 - ks) + \
                 (-2.0 * tb3 + 3.0 * tb2) * vec3(maxLum);\n\
                 sig = mix(pb, sig_pq.rgb, {}(lessThan(sig_pq.rgb, vec3(ks))));",
                sc.bvec(3)
            ));
            // Back from PQ space to linear light.
            sc.add(format!(
                "sig *= vec3(sig_pq.a);\n\
                 sig = pow(sig, vec3(1.0/{:.6}));\n\
                 sig = max(sig - vec3({:.6}), 0.0) / \
                 (vec3({:.6}) - vec3({:.6}) * sig);\n\
                 sig = pow(sig, vec3(1.0/{:.6}));\n\
                 sig *= vec3({:.6});",
                PQ_M2,
                PQ_C1,
                PQ_C2,
                PQ_C3,
                PQ_M1,
                10000.0 / REF_WHITE as f64
            ));
        }
    }

    sc.add("vec3 sig_lin = color.rgb * (sig[sig_idx] / sig_orig);");

    // Mix between the per-channel and the luma-preserving linear result
    // based on the desaturation strength.
    if opts.desat > 0.0 {
        let base = 0.18 * dst_scale;
        sc.add(format!(
            "float coeff = max(sig[sig_idx] - {:.6}, 1e-6) / max(sig[sig_idx], 1.0);",
            base
        ));
        sc.add(format!(
            "coeff = {:.6} * pow(coeff, {:.6});",
            opts.desat as f64, opts.desat_exp as f64
        ));
        sc.add(format!("color.rgb = mix(sig_lin, {:.6} * sig, coeff);", dst_scale));
    } else {
        sc.add("color.rgb = sig_lin;");
    }
}

/// Map colors between two fully specified source and destination spaces.
/// When `peak_buf` is set, the statistics SSBO is bound and the measured
/// peak overrides the tagged one; this requires a compute pass.
pub fn color_map(
    sc: &mut ShaderCache,
    mut is_linear: bool,
    src: &ColorDescription,
    dst: &ColorDescription,
    opts: &ToneMapOpts,
    peak_buf: Option<BufferHandle>,
) {
    sc.add("// color mapping");

    // Several operations need the luma coefficients of both spaces.
    sc.uniform_vec3("src_luma", luma_coefficients(src.primaries));
    sc.uniform_vec3("dst_luma", luma_coefficients(dst.primaries));

    let src_peak = src.peak();
    let dst_peak = dst.peak();

    let mut need_ootf = src.light != dst.light;
    if src.light == Light::SceneHlg && src_peak != dst_peak {
        need_ootf = true;
    }

    // Everything below needs linear light, so linearize even for equal
    // transfer curves when another operation demands it.
    let need_linear = src.transfer != dst.transfer
        || src.primaries != dst.primaries
        || src_peak != dst_peak
        || need_ootf;

    if need_linear && !is_linear {
        linearize(sc, src.transfer);
        is_linear = true;
    }

    // Move to an absolute scale where 1.0 is reference white.
    sc.add(format!("color.rgb *= vec3({:.6});", nom_peak(src.transfer)));

    if need_ootf {
        ootf(sc, src.light, src_peak);
    }

    if src_peak > dst_peak {
        let detect = if let Some(buf) = peak_buf {
            sc.ssbo(
                "PeakDetect",
                buf,
                "vec2 average; int frame_sum; uint frame_max; uint counter;",
            );
            true
        } else {
            false
        };
        tone_map(sc, src_peak, dst_peak, detect, opts);
    }

    if src.primaries != dst.primaries {
        let m = gamut_matrix(src.primaries, dst.primaries);
        sc.uniform_mat3("cms_matrix", m.to_gl());
        sc.add("color.rgb = cms_matrix * color.rgb;");

        if opts.gamut_clipping {
            // Desaturate colors below black rather than clamping them off.
            sc.add("float cmin = min(min(color.r, color.g), color.b);");
            sc.add(
                "if (cmin < 0.0) {\n\
                 float luma = dot(dst_luma, color.rgb);\n\
                 float coeff = cmin / (cmin - luma);\n\
                 color.rgb = mix(color.rgb, vec3(luma), coeff);\n\
                 }",
            );
            sc.add(format!(
                "float cmax = 1.0/{:.6} * max(max(color.r, color.g), color.b);",
                dst_peak as f64
            ));
            sc.add("if (cmax > 1.0) color.rgb /= cmax;");
        }
    }

    if need_ootf {
        inverse_ootf(sc, dst.light, dst_peak);
    }

    // Back to a normalized scale: the signal peak for SDR, the encoding
    // range of the curve for HDR.
    let dst_range = if dst.transfer.is_hdr() {
        nom_peak(dst.transfer)
    } else {
        dst_peak as f64
    };
    sc.add(format!("color.rgb *= vec3({:.6});", 1.0 / dst_range));

    if is_linear {
        delinearize(sc, dst.transfer);
    }
}

// Wide-usage-friendly PRNG. Obtain numbers with rand(h) followed by
// h = permute(h) to advance the state. permute() avoids large
// intermediates, which overflow on low-end mobile GPUs.
fn prng_init(sc: &mut ShaderCache, random: f32) {
    sc.hadd("float mod289(float x)  { return x - floor(x * 1.0/289.0) * 289.0; }");
    sc.hadd("float permute(float x) {");
    sc.hadd("return mod289( mod289(34.0*x + 1.0) * (fract(x) + 1.0) );");
    sc.hadd("}");
    sc.hadd("float rand(float x)    { return fract(x * 1.0/41.0); }");

    // Seed by hashing the position with a per-frame random value.
    sc.add("vec3 _m = vec3(HOOKED_pos, random) + vec3(1.0);");
    sc.add("float h = permute(permute(permute(_m.x)+_m.y)+_m.z);");
    sc.uniform_dynamic();
    sc.uniform_f("random", random);
}

/// Stochastically sample a debanded result from the hooked texture.
/// `random` is a fresh per-frame value in [0,1).
pub fn deband(sc: &mut ShaderCache, opts: &DebandOpts, random: f32, trc: Transfer) {
    sc.add("{");
    prng_init(sc, random);

    // Helper: stochastic approximation of the average color around a pixel,
    // sampled at quarter-turn intervals.
    sc.hadd("vec4 average(float range, inout float h) {");
    sc.hadd("float dist = rand(h) * range;     h = permute(h);");
    sc.hadd("float dir  = rand(h) * 6.2831853; h = permute(h);");
    sc.hadd("vec2 o = dist * vec2(cos(dir), sin(dir));");
    sc.hadd("vec4 ref[4];");
    sc.hadd("ref[0] = HOOKED_texOff(vec2( o.x,  o.y));");
    sc.hadd("ref[1] = HOOKED_texOff(vec2(-o.y,  o.x));");
    sc.hadd("ref[2] = HOOKED_texOff(vec2(-o.x, -o.y));");
    sc.hadd("ref[3] = HOOKED_texOff(vec2( o.y, -o.x));");
    sc.hadd("return (ref[0] + ref[1] + ref[2] + ref[3])*0.25;");
    sc.hadd("}");

    sc.add("color = HOOKED_tex(HOOKED_pos);");
    sc.add("vec4 avg, diff;");
    for i in 1..=opts.iterations {
        // Use the averaged color when the difference stays under the
        // threshold.
        sc.add(format!("avg = average({:.6}, h);", i as f64 * opts.range as f64));
        sc.add("diff = abs(color - avg);");
        sc.add(format!(
            "color = mix(avg, color, {}(greaterThan(diff, vec4({:.6}))));",
            sc.bvec(4),
            opts.threshold as f64 / (i as f64 * 16384.0)
        ));
    }

    // Grain noise smooths out what remains; scaled to the signal level so
    // HDR doesn't get extreme noise.
    sc.add("vec3 noise;");
    sc.add("noise.x = rand(h); h = permute(h);");
    sc.add("noise.y = rand(h); h = permute(h);");
    sc.add("noise.z = rand(h); h = permute(h);");
    let gain = opts.grain as f64 / 8192.0 / nom_peak(trc);
    sc.add(format!("color.xyz += {:.6} * (noise - vec3(0.5));", gain));
    sc.add("}");
}

/// Simple 5x5 unsharp mask over the hooked texture.
pub fn unsharp(sc: &mut ShaderCache, param: f32) {
    sc.add("{");
    sc.add("float st1 = 1.2;");
    sc.add("vec4 p = HOOKED_tex(HOOKED_pos);");
    sc.add(
        "vec4 sum1 = HOOKED_texOff(st1 * vec2(+1, +1))\n\
         + HOOKED_texOff(st1 * vec2(+1, -1))\n\
         + HOOKED_texOff(st1 * vec2(-1, +1))\n\
         + HOOKED_texOff(st1 * vec2(-1, -1));",
    );
    sc.add("float st2 = 1.5;");
    sc.add(
        "vec4 sum2 = HOOKED_texOff(st2 * vec2(+1,  0))\n\
         + HOOKED_texOff(st2 * vec2( 0, +1))\n\
         + HOOKED_texOff(st2 * vec2(-1,  0))\n\
         + HOOKED_texOff(st2 * vec2( 0, -1));",
    );
    sc.add("vec4 t = p * 0.859375 + sum2 * -0.1171875 + sum1 * -0.09765625;");
    sc.add(format!("color = p + t * {:.6};", param as f64));
    sc.add("}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{vulkan_class_profile, NullBackend};
    use crate::cache::ShaderCache;
    use std::sync::Arc;

    fn session() -> ShaderCache {
        ShaderCache::new(Arc::new(NullBackend::new(vulkan_class_profile())))
    }

    const ALL_TRANSFERS: &[Transfer] = &[
        Transfer::Bt1886,
        Transfer::Srgb,
        Transfer::Linear,
        Transfer::Gamma18,
        Transfer::Gamma20,
        Transfer::Gamma22,
        Transfer::Gamma24,
        Transfer::Gamma26,
        Transfer::Gamma28,
        Transfer::ProPhoto,
        Transfer::Pq,
        Transfer::Hlg,
        Transfer::VLog,
        Transfer::SLog1,
        Transfer::SLog2,
    ];

    #[test]
    fn test_linearize_roundtrip_identity() {
        for &trc in ALL_TRANSFERS {
            for i in 0..=20 {
                let x = i as f64 / 20.0;
                let lin = linearize_value(trc, x);
                let back = delinearize_value(trc, lin);
                assert!(
                    (back - x).abs() < 1e-4,
                    "{:?}: {} -> {} -> {}",
                    trc,
                    x,
                    lin,
                    back
                );
            }
        }
    }

    #[test]
    fn test_linearize_endpoints() {
        for &trc in ALL_TRANSFERS {
            let black = linearize_value(trc, 0.0);
            let white = linearize_value(trc, 1.0);
            assert!(black.abs() < 1e-3, "{:?} black = {}", trc, black);
            assert!((white - 1.0).abs() < 1e-4, "{:?} white = {}", trc, white);
        }
    }

    #[test]
    fn test_pq_half_signal_is_dim() {
        // PQ is heavily weighted towards the dark end; half signal is far
        // below half of the nominal peak.
        let lin = linearize_value(Transfer::Pq, 0.5);
        assert!(lin > 0.0 && lin < 0.05, "lin = {}", lin);
    }

    #[test]
    fn test_linear_transfer_emits_nothing() {
        let mut sc = session();
        linearize(&mut sc, Transfer::Linear);
        delinearize(&mut sc, Transfer::Linear);
        assert!(sc.body_text().is_empty());
    }

    #[test]
    fn test_linearize_clamps_before_expanding() {
        let mut sc = session();
        linearize(&mut sc, Transfer::Bt1886);
        let body = sc.body_text();
        let clamp = body.find("clamp(color.rgb").unwrap();
        let pow = body.find("pow(color.rgb").unwrap();
        assert!(clamp < pow);
    }

    #[test]
    fn test_sigmoid_roundtrip_in_glsl_coeffs() {
        // The emitted coefficients must satisfy sig(0)=0 and sig(1)=1.
        let opts = SigmoidOpts::default();
        let (center, slope, offset, scale) = sigmoid_coeffs(&opts);
        let sig = |x: f64| (1.0 / (1.0 + (slope * (center - x)).exp()) - offset) / scale;
        assert!(sig(0.0).abs() < 1e-6);
        assert!((sig(1.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_color_map_pq_to_sdr_tone_maps() {
        let mut sc = session();
        let src = ColorDescription {
            transfer: Transfer::Pq,
            primaries: opal_core::Primaries::Bt2020,
            ..Default::default()
        };
        let dst = ColorDescription::default();
        let opts = ToneMapOpts {
            curve: ToneCurve::Hable,
            ..Default::default()
        };
        color_map(&mut sc, false, &src, &dst, &opts, None);
        assert!(sc.header_text().contains("vec3 hable(vec3 x)"));
        assert!(sc.body_text().contains("// HDR tone mapping"));
        assert!(sc.has_uniform("cms_matrix"));
        assert!(sc.has_uniform("src_luma"));
    }

    #[test]
    fn test_color_map_identity_spaces_skip_linearization() {
        let mut sc = session();
        let c = ColorDescription::default();
        color_map(&mut sc, false, &c, &c, &ToneMapOpts::default(), None);
        assert!(!sc.body_text().contains("// linearize"));
        assert!(!sc.body_text().contains("// HDR tone mapping"));
    }

    #[test]
    fn test_peak_detection_binds_ssbo() {
        let mut sc = session();
        let buf = sc
            .backend()
            .create_buffer(crate::backend::BufferKind::Storage, 64)
            .unwrap();
        let src = ColorDescription {
            transfer: Transfer::Pq,
            ..Default::default()
        };
        let dst = ColorDescription::default();
        color_map(&mut sc, false, &src, &dst, &ToneMapOpts::default(), Some(buf));
        assert!(sc.has_uniform("PeakDetect"));
        assert!(sc.body_text().contains("atomicMax(frame_max, wg_max);"));
    }

    #[test]
    fn test_deband_seeds_prng_with_dynamic_uniform() {
        let mut sc = session();
        deband(&mut sc, &DebandOpts::default(), 0.25, Transfer::Bt1886);
        assert!(sc.has_uniform("random"));
        assert!(sc.header_text().contains("float permute(float x)"));
        // Default single iteration emits exactly one average() call.
        assert_eq!(sc.body_text().matches("avg = average(").count(), 1);
    }

    #[test]
    fn test_convert_input_emits_cl_decode_only_for_cl() {
        let mut sc = session();
        convert_input(&mut sc, &ColorDescription::default());
        assert!(sc.has_uniform("color_matrix"));
        assert!(!sc.body_text().contains("1.0/1.0993"));

        let mut sc = session();
        let cl = ColorDescription {
            space: Colorspace::Bt2020Cl,
            ..Default::default()
        };
        convert_input(&mut sc, &cl);
        assert!(sc.body_text().contains("1.0/1.0993"));
    }
}
