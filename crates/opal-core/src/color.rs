//! Colorspace model: transfer curves, primaries, YUV matrices, gamut math.
//!
//! Everything here is plain CPU math. The GPU-side application of these
//! values (linearization shader text, tone mapping, and so on) lives in the
//! shader crate; this module only answers "which matrix" and "which
//! constants" questions.

use serde::{Deserialize, Serialize};

/// Reference white level in cd/m^2 that all linear light in the renderer is
/// normalized against. Signal value 1.0 in linear light equals this.
pub const REF_WHITE: f32 = 203.0;

/// Named transfer characteristics (TRCs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Transfer {
    #[default]
    Bt1886,
    Srgb,
    Linear,
    Gamma18,
    Gamma20,
    Gamma22,
    Gamma24,
    Gamma26,
    Gamma28,
    ProPhoto,
    Pq,
    Hlg,
    VLog,
    SLog1,
    SLog2,
}

impl Transfer {
    /// True for curves whose nominal peak exceeds reference white.
    pub fn is_hdr(&self) -> bool {
        self.nominal_peak() > 1.0
    }

    /// Nominal peak of the curve as a multiple of reference white.
    /// SDR curves peak at exactly 1.0 by definition.
    pub fn nominal_peak(&self) -> f32 {
        match self {
            Transfer::Pq => 10000.0 / REF_WHITE,
            Transfer::Hlg => 1000.0 / REF_WHITE,
            Transfer::VLog => 46.0855,
            Transfer::SLog1 => 6.228,
            Transfer::SLog2 => 9.212,
            _ => 1.0,
        }
    }

    pub fn is_linear(&self) -> bool {
        matches!(self, Transfer::Linear)
    }
}

/// Color primaries (gamut definitions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Primaries {
    #[default]
    Bt709,
    /// SMPTE C / BT.601 NTSC.
    Bt601_525,
    /// EBU / BT.601 PAL.
    Bt601_625,
    Bt2020,
    DciP3,
    DisplayP3,
    AdobeRgb,
    ProPhoto,
}

/// xy chromaticity coordinate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Chromaticity {
    pub x: f32,
    pub y: f32,
}

/// Raw primaries: chromaticities of R, G, B and the white point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawPrimaries {
    pub red: Chromaticity,
    pub green: Chromaticity,
    pub blue: Chromaticity,
    pub white: Chromaticity,
}

const D65: Chromaticity = Chromaticity { x: 0.3127, y: 0.3290 };
const D50: Chromaticity = Chromaticity { x: 0.34567, y: 0.35850 };
const DCI: Chromaticity = Chromaticity { x: 0.3140, y: 0.3510 };

impl Primaries {
    pub fn raw(&self) -> RawPrimaries {
        let c = |x, y| Chromaticity { x, y };
        match self {
            Primaries::Bt709 => RawPrimaries {
                red: c(0.640, 0.330),
                green: c(0.300, 0.600),
                blue: c(0.150, 0.060),
                white: D65,
            },
            Primaries::Bt601_525 => RawPrimaries {
                red: c(0.630, 0.340),
                green: c(0.310, 0.595),
                blue: c(0.155, 0.070),
                white: D65,
            },
            Primaries::Bt601_625 => RawPrimaries {
                red: c(0.640, 0.330),
                green: c(0.290, 0.600),
                blue: c(0.150, 0.060),
                white: D65,
            },
            Primaries::Bt2020 => RawPrimaries {
                red: c(0.708, 0.292),
                green: c(0.170, 0.797),
                blue: c(0.131, 0.046),
                white: D65,
            },
            Primaries::DciP3 => RawPrimaries {
                red: c(0.680, 0.320),
                green: c(0.265, 0.690),
                blue: c(0.150, 0.060),
                white: DCI,
            },
            Primaries::DisplayP3 => RawPrimaries {
                red: c(0.680, 0.320),
                green: c(0.265, 0.690),
                blue: c(0.150, 0.060),
                white: D65,
            },
            Primaries::AdobeRgb => RawPrimaries {
                red: c(0.640, 0.330),
                green: c(0.210, 0.710),
                blue: c(0.150, 0.060),
                white: D65,
            },
            Primaries::ProPhoto => RawPrimaries {
                red: c(0.7347, 0.2653),
                green: c(0.1596, 0.8404),
                blue: c(0.0366, 0.0001),
                white: D50,
            },
        }
    }
}

/// YUV-style matrix coefficients (which decoding matrix applies).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Colorspace {
    #[default]
    Bt709,
    Bt601,
    Bt2020Ncl,
    /// Constant luminance; the nonlinear part is handled in shader text.
    Bt2020Cl,
    Rgb,
    Xyz,
}

impl Colorspace {
    pub fn is_yuv(&self) -> bool {
        matches!(
            self,
            Colorspace::Bt709 | Colorspace::Bt601 | Colorspace::Bt2020Ncl | Colorspace::Bt2020Cl
        )
    }
}

/// Signal range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Levels {
    #[default]
    Limited,
    Full,
}

/// Light tagging: whether values describe display light or scene light.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Light {
    #[default]
    Display,
    SceneHlg,
    Scene709_1886,
    Scene12,
}

/// Full color description of an image or a target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorDescription {
    pub space: Colorspace,
    pub levels: Levels,
    pub primaries: Primaries,
    pub transfer: Transfer,
    pub light: Light,
    /// Tagged signal peak as a multiple of reference white. Zero means
    /// "unknown, use the transfer curve's nominal peak".
    pub sig_peak: f32,
}

impl Default for ColorDescription {
    fn default() -> Self {
        Self {
            space: Colorspace::Bt709,
            levels: Levels::Limited,
            primaries: Primaries::Bt709,
            transfer: Transfer::Bt1886,
            light: Light::Display,
            sig_peak: 0.0,
        }
    }
}

impl ColorDescription {
    /// Effective signal peak, falling back to the curve's nominal peak.
    pub fn peak(&self) -> f32 {
        if self.sig_peak > 0.0 {
            self.sig_peak
        } else {
            self.transfer.nominal_peak()
        }
    }

    pub fn is_hdr(&self) -> bool {
        self.peak() > 1.0
    }
}

/// Row-major 3x3 matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mat3 {
    pub m: [[f32; 3]; 3],
}

impl Mat3 {
    pub const IDENTITY: Mat3 = Mat3 {
        m: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
    };

    pub fn mul(&self, rhs: &Mat3) -> Mat3 {
        let mut out = [[0.0f32; 3]; 3];
        for (i, row) in out.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = (0..3).map(|k| self.m[i][k] * rhs.m[k][j]).sum();
            }
        }
        Mat3 { m: out }
    }

    pub fn mul_vec(&self, v: [f32; 3]) -> [f32; 3] {
        let mut out = [0.0f32; 3];
        for (i, o) in out.iter_mut().enumerate() {
            *o = self.m[i][0] * v[0] + self.m[i][1] * v[1] + self.m[i][2] * v[2];
        }
        out
    }

    pub fn determinant(&self) -> f32 {
        let m = &self.m;
        m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
    }

    /// Inverse via the adjugate. Degenerate matrices return identity; the
    /// inputs here are gamut matrices, which are always well-conditioned.
    pub fn inverse(&self) -> Mat3 {
        let det = self.determinant();
        if det.abs() < 1e-12 {
            return Mat3::IDENTITY;
        }
        let m = &self.m;
        let inv_det = 1.0 / det;
        let mut out = [[0.0f32; 3]; 3];
        for (i, row) in out.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                // Cofactor expansion, transposed.
                let a = m[(j + 1) % 3][(i + 1) % 3];
                let b = m[(j + 2) % 3][(i + 2) % 3];
                let c = m[(j + 1) % 3][(i + 2) % 3];
                let d = m[(j + 2) % 3][(i + 1) % 3];
                *cell = (a * b - c * d) * inv_det;
            }
        }
        Mat3 { m: out }
    }

    /// Column-major flattening for GPU upload.
    pub fn to_gl(&self) -> [f32; 9] {
        let mut out = [0.0f32; 9];
        for col in 0..3 {
            for row in 0..3 {
                out[col * 3 + row] = self.m[row][col];
            }
        }
        out
    }
}

/// A 3x3 matrix with a translation column, for YUV decoding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mat3x4 {
    pub m: Mat3,
    pub c: [f32; 3],
}

impl Mat3x4 {
    pub const IDENTITY: Mat3x4 = Mat3x4 {
        m: Mat3::IDENTITY,
        c: [0.0; 3],
    };

    pub fn mul_vec(&self, v: [f32; 3]) -> [f32; 3] {
        let r = self.m.mul_vec(v);
        [r[0] + self.c[0], r[1] + self.c[1], r[2] + self.c[2]]
    }
}

/// RGB -> CIE XYZ matrix for a set of raw primaries.
pub fn rgb_to_xyz(prim: &RawPrimaries) -> Mat3 {
    let xyz = |c: Chromaticity| [c.x / c.y, 1.0, (1.0 - c.x - c.y) / c.y];
    let r = xyz(prim.red);
    let g = xyz(prim.green);
    let b = xyz(prim.blue);
    let w = xyz(prim.white);

    let basis = Mat3 {
        m: [
            [r[0], g[0], b[0]],
            [r[1], g[1], b[1]],
            [r[2], g[2], b[2]],
        ],
    };
    let scale = basis.inverse().mul_vec(w);
    Mat3 {
        m: [
            [r[0] * scale[0], g[0] * scale[1], b[0] * scale[2]],
            [r[1] * scale[0], g[1] * scale[1], b[1] * scale[2]],
            [r[2] * scale[0], g[2] * scale[1], b[2] * scale[2]],
        ],
    }
}

// Bradford cone response matrix, used for white point adaptation.
const BRADFORD: Mat3 = Mat3 {
    m: [
        [0.8951, 0.2664, -0.1614],
        [-0.7502, 1.7135, 0.0367],
        [0.0389, -0.0685, 1.0296],
    ],
};

/// Chromatic adaptation (Bradford) between two white points, in XYZ.
pub fn white_adaptation(src: Chromaticity, dst: Chromaticity) -> Mat3 {
    if (src.x - dst.x).abs() < 1e-6 && (src.y - dst.y).abs() < 1e-6 {
        return Mat3::IDENTITY;
    }
    let xyz = |c: Chromaticity| [c.x / c.y, 1.0, (1.0 - c.x - c.y) / c.y];
    let s = BRADFORD.mul_vec(xyz(src));
    let d = BRADFORD.mul_vec(xyz(dst));
    let gain = Mat3 {
        m: [
            [d[0] / s[0], 0.0, 0.0],
            [0.0, d[1] / s[1], 0.0],
            [0.0, 0.0, d[2] / s[2]],
        ],
    };
    BRADFORD.inverse().mul(&gain).mul(&BRADFORD)
}

/// Gamut conversion matrix: source RGB -> destination RGB through XYZ with
/// white point adaptation.
pub fn gamut_matrix(src: Primaries, dst: Primaries) -> Mat3 {
    let sp = src.raw();
    let dp = dst.raw();
    let adapt = white_adaptation(sp.white, dp.white);
    rgb_to_xyz(&dp).inverse().mul(&adapt).mul(&rgb_to_xyz(&sp))
}

/// Relative luminance coefficients of an RGB space: the Y row of its
/// RGB -> XYZ matrix.
pub fn luma_coefficients(prim: Primaries) -> [f32; 3] {
    rgb_to_xyz(&prim.raw()).m[1]
}

/// YUV -> RGB decoding matrix in the normalized [0,1] texture domain, using
/// 8-bit-equivalent level fractions. Constant-luminance and XYZ inputs get a
/// levels-only expansion; their nonlinear decode happens in shader text.
pub fn yuv_to_rgb_matrix(space: Colorspace, levels: Levels, prim: Primaries) -> Mat3x4 {
    let (ymul, yoff, cmul) = match levels {
        Levels::Limited => (255.0 / 219.0, 16.0 / 255.0, 255.0 / 224.0),
        Levels::Full => (1.0, 0.0, 1.0),
    };
    let coff = 128.0 / 255.0;

    let expand_only = |cm: f32| Mat3x4 {
        m: Mat3 {
            m: [[ymul, 0.0, 0.0], [0.0, cm, 0.0], [0.0, 0.0, cm]],
        },
        c: [-yoff * ymul, -coff * cm, -coff * cm],
    };

    let [kr, kg, kb] = match space {
        Colorspace::Bt601 => [0.299, 0.587, 0.114],
        Colorspace::Bt709 => [0.2126, 0.7152, 0.0722],
        Colorspace::Bt2020Ncl => [0.2627, 0.6780, 0.0593],
        Colorspace::Bt2020Cl => return expand_only(cmul),
        Colorspace::Xyz => {
            // XYZ is documented as full range.
            return Mat3x4::IDENTITY;
        }
        Colorspace::Rgb => {
            let _ = prim;
            return match levels {
                Levels::Full => Mat3x4::IDENTITY,
                Levels::Limited => Mat3x4 {
                    m: Mat3 {
                        m: [[ymul, 0.0, 0.0], [0.0, ymul, 0.0], [0.0, 0.0, ymul]],
                    },
                    c: [-yoff * ymul; 3],
                },
            };
        }
    };

    let m = Mat3 {
        m: [
            [ymul, 0.0, cmul * 2.0 * (1.0 - kr)],
            [
                ymul,
                -cmul * 2.0 * kb * (1.0 - kb) / kg,
                -cmul * 2.0 * kr * (1.0 - kr) / kg,
            ],
            [ymul, cmul * 2.0 * (1.0 - kb), 0.0],
        ],
    };
    let c = [
        -yoff * ymul - coff * m.m[0][2],
        -yoff * ymul - coff * (m.m[1][1] + m.m[1][2]),
        -yoff * ymul - coff * m.m[2][1],
    ];
    Mat3x4 { m, c }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f32, b: f32, eps: f32) {
        assert!((a - b).abs() < eps, "{} != {} (eps {})", a, b, eps);
    }

    #[test]
    fn test_bt709_luma_coefficients() {
        let [kr, kg, kb] = luma_coefficients(Primaries::Bt709);
        assert_close(kr, 0.2126, 1e-3);
        assert_close(kg, 0.7152, 1e-3);
        assert_close(kb, 0.0722, 1e-3);
    }

    #[test]
    fn test_rgb_to_xyz_maps_white_to_whitepoint() {
        let raw = Primaries::Bt709.raw();
        let m = rgb_to_xyz(&raw);
        let xyz = m.mul_vec([1.0, 1.0, 1.0]);
        // White should land on D65 with Y = 1.
        assert_close(xyz[1], 1.0, 1e-4);
        assert_close(xyz[0] / (xyz[0] + xyz[1] + xyz[2]), 0.3127, 1e-3);
    }

    #[test]
    fn test_gamut_matrix_identity_for_same_primaries() {
        let m = gamut_matrix(Primaries::Bt709, Primaries::Bt709);
        for i in 0..3 {
            for j in 0..3 {
                let expect = if i == j { 1.0 } else { 0.0 };
                assert_close(m.m[i][j], expect, 1e-4);
            }
        }
    }

    #[test]
    fn test_gamut_roundtrip_is_identity() {
        let fwd = gamut_matrix(Primaries::Bt709, Primaries::Bt2020);
        let back = gamut_matrix(Primaries::Bt2020, Primaries::Bt709);
        let id = fwd.mul(&back);
        for i in 0..3 {
            for j in 0..3 {
                let expect = if i == j { 1.0 } else { 0.0 };
                assert_close(id.m[i][j], expect, 1e-4);
            }
        }
    }

    #[test]
    fn test_matrix_inverse() {
        let m = rgb_to_xyz(&Primaries::Bt2020.raw());
        let id = m.mul(&m.inverse());
        for i in 0..3 {
            for j in 0..3 {
                let expect = if i == j { 1.0 } else { 0.0 };
                assert_close(id.m[i][j], expect, 1e-4);
            }
        }
    }

    #[test]
    fn test_yuv_matrix_gray_maps_to_gray() {
        // Mid gray in limited range 8-bit: Y=126/255 (roughly 0.5 after
        // expansion), Cb=Cr=128/255.
        let m = yuv_to_rgb_matrix(Colorspace::Bt709, Levels::Limited, Primaries::Bt709);
        let y = (16.0 + 219.0 * 0.5) / 255.0;
        let rgb = m.mul_vec([y, 128.0 / 255.0, 128.0 / 255.0]);
        for ch in rgb {
            assert_close(ch, 0.5, 1e-4);
        }
    }

    #[test]
    fn test_yuv_matrix_peak_white() {
        let m = yuv_to_rgb_matrix(Colorspace::Bt601, Levels::Limited, Primaries::Bt601_525);
        let rgb = m.mul_vec([235.0 / 255.0, 128.0 / 255.0, 128.0 / 255.0]);
        for ch in rgb {
            assert_close(ch, 1.0, 1e-4);
        }
    }

    #[test]
    fn test_hdr_peaks() {
        assert!(Transfer::Pq.is_hdr());
        assert_close(Transfer::Pq.nominal_peak(), 10000.0 / REF_WHITE, 1e-3);
        assert!(Transfer::Hlg.is_hdr());
        assert!(!Transfer::Bt1886.is_hdr());
        assert_close(Transfer::Srgb.nominal_peak(), 1.0, 0.0);
    }

    #[test]
    fn test_color_description_peak_fallback() {
        let mut desc = ColorDescription {
            transfer: Transfer::Pq,
            ..Default::default()
        };
        assert_close(desc.peak(), 10000.0 / REF_WHITE, 1e-3);
        desc.sig_peak = 1000.0 / REF_WHITE;
        assert_close(desc.peak(), 1000.0 / REF_WHITE, 1e-3);
    }
}
