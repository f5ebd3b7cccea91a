//! Texture and image descriptors.
//!
//! A [`TextureDesc`] describes a GPU-resident pixel buffer; textures are
//! recreated, never mutated, when their size or format must change. An
//! [`ImageView`] is the transient per-pass view of a texture: which plane it
//! is, how many components matter, and how its coordinates map into the
//! shared reference frame.

use serde::{Deserialize, Serialize};

/// What a plane holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PlaneType {
    #[default]
    None,
    Luma,
    Chroma,
    Rgb,
    Alpha,
    Xyz,
}

/// Texture pixel formats the renderer allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TextureFormat {
    R8,
    Rg8,
    Rgba8,
    R16,
    Rg16,
    Rgba16,
    R16F,
    Rgba16F,
    R32F,
    Rgba32F,
}

impl TextureFormat {
    pub fn components(&self) -> u8 {
        match self {
            TextureFormat::R8 | TextureFormat::R16 | TextureFormat::R16F | TextureFormat::R32F => 1,
            TextureFormat::Rg8 | TextureFormat::Rg16 => 2,
            TextureFormat::Rgba8
            | TextureFormat::Rgba16
            | TextureFormat::Rgba16F
            | TextureFormat::Rgba32F => 4,
        }
    }

    /// Bytes per pixel.
    pub fn pixel_size(&self) -> usize {
        match self {
            TextureFormat::R8 => 1,
            TextureFormat::Rg8 => 2,
            TextureFormat::Rgba8 => 4,
            TextureFormat::R16 | TextureFormat::R16F => 2,
            TextureFormat::Rg16 => 4,
            TextureFormat::Rgba16 | TextureFormat::Rgba16F => 8,
            TextureFormat::R32F => 4,
            TextureFormat::Rgba32F => 16,
        }
    }

    /// GLSL image format qualifier, for compute image bindings.
    pub fn glsl_format(&self) -> &'static str {
        match self {
            TextureFormat::R8 => "r8",
            TextureFormat::Rg8 => "rg8",
            TextureFormat::Rgba8 => "rgba8",
            TextureFormat::R16 => "r16",
            TextureFormat::Rg16 => "rg16",
            TextureFormat::Rgba16 => "rgba16",
            TextureFormat::R16F => "r16f",
            TextureFormat::Rgba16F => "rgba16f",
            TextureFormat::R32F => "r32f",
            TextureFormat::Rgba32F => "rgba32f",
        }
    }
}

/// Opaque backend texture identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u64);

/// Immutable description of a texture allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextureDesc {
    pub w: u32,
    pub h: u32,
    /// Depth; 1 for 2D textures, >1 only for 3D LUTs.
    pub d: u32,
    pub format: TextureFormat,
    pub render_target: bool,
    /// Usable as a compute storage image.
    pub storage: bool,
    /// Sampled with linear filtering (as opposed to nearest).
    pub linear_filter: bool,
}

impl TextureDesc {
    pub fn plane(w: u32, h: u32, format: TextureFormat) -> Self {
        Self {
            w,
            h,
            d: 1,
            format,
            render_target: false,
            storage: false,
            linear_filter: true,
        }
    }

    pub fn target(w: u32, h: u32, format: TextureFormat) -> Self {
        Self {
            w,
            h,
            d: 1,
            format,
            render_target: true,
            storage: true,
            linear_filter: true,
        }
    }

    pub fn byte_size(&self) -> usize {
        self.w as usize * self.h as usize * self.d as usize * self.format.pixel_size()
    }
}

/// 2x2 linear transform plus offset, mapping an image's own texel
/// coordinates into the shared reference frame (rotation, chroma alignment).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform2x2 {
    pub m: [[f32; 2]; 2],
    pub t: [f32; 2],
}

impl Transform2x2 {
    pub const IDENTITY: Transform2x2 = Transform2x2 {
        m: [[1.0, 0.0], [0.0, 1.0]],
        t: [0.0, 0.0],
    };

    /// Compose: apply `other` after `self`.
    pub fn then(&self, other: &Transform2x2) -> Transform2x2 {
        let m = [
            [
                other.m[0][0] * self.m[0][0] + other.m[0][1] * self.m[1][0],
                other.m[0][0] * self.m[0][1] + other.m[0][1] * self.m[1][1],
            ],
            [
                other.m[1][0] * self.m[0][0] + other.m[1][1] * self.m[1][0],
                other.m[1][0] * self.m[0][1] + other.m[1][1] * self.m[1][1],
            ],
        ];
        let t = [
            other.m[0][0] * self.t[0] + other.m[0][1] * self.t[1] + other.t[0],
            other.m[1][0] * self.t[0] + other.m[1][1] * self.t[1] + other.t[1],
        ];
        Transform2x2 { m, t }
    }

    pub fn apply(&self, p: [f32; 2]) -> [f32; 2] {
        [
            self.m[0][0] * p[0] + self.m[0][1] * p[1] + self.t[0],
            self.m[1][0] * p[0] + self.m[1][1] * p[1] + self.t[1],
        ]
    }

    /// Invert the transform. The linear part must be non-singular, which
    /// holds for every transform the renderer constructs (rotations and
    /// nonzero scales).
    pub fn inverse(&self) -> Transform2x2 {
        let det = self.m[0][0] * self.m[1][1] - self.m[0][1] * self.m[1][0];
        let inv_det = if det.abs() > f32::EPSILON { 1.0 / det } else { 0.0 };
        let m = [
            [self.m[1][1] * inv_det, -self.m[0][1] * inv_det],
            [-self.m[1][0] * inv_det, self.m[0][0] * inv_det],
        ];
        let t = [
            -(m[0][0] * self.t[0] + m[0][1] * self.t[1]),
            -(m[1][0] * self.t[0] + m[1][1] * self.t[1]),
        ];
        Transform2x2 { m, t }
    }

    /// Pure scale + offset transform.
    pub fn scale_offset(sx: f32, sy: f32, ox: f32, oy: f32) -> Transform2x2 {
        Transform2x2 {
            m: [[sx, 0.0], [0.0, sy]],
            t: [ox, oy],
        }
    }
}

/// Transient logical view of a texture, created fresh each pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageView {
    pub plane: PlaneType,
    pub tex: TextureHandle,
    /// Texture allocation size (for pt computation).
    pub tex_w: u32,
    pub tex_h: u32,
    /// Logical size after applying the transform.
    pub w: u32,
    pub h: u32,
    pub components: u8,
    /// Multiplier rescaling sampled values to nominal range (e.g. 10-bit
    /// data in a 16-bit texture).
    pub multiplier: f32,
    pub transform: Transform2x2,
}

impl ImageView {
    pub fn new(plane: PlaneType, tex: TextureHandle, desc: &TextureDesc, components: u8) -> Self {
        Self {
            plane,
            tex,
            tex_w: desc.w,
            tex_h: desc.h,
            w: desc.w,
            h: desc.h,
            components,
            multiplier: 1.0,
            transform: Transform2x2::IDENTITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_sizes() {
        assert_eq!(TextureFormat::R8.pixel_size(), 1);
        assert_eq!(TextureFormat::Rgba16.pixel_size(), 8);
        assert_eq!(TextureFormat::Rgba16F.components(), 4);
        assert_eq!(TextureFormat::Rg16.components(), 2);
    }

    #[test]
    fn test_texture_byte_size() {
        let desc = TextureDesc::plane(64, 32, TextureFormat::Rg16);
        assert_eq!(desc.byte_size(), 64 * 32 * 4);
    }

    #[test]
    fn test_transform_inverse() {
        let t = Transform2x2::scale_offset(2.0, 0.5, 3.0, -1.0);
        let inv = t.inverse();
        let p = inv.apply(t.apply([4.0, 7.0]));
        assert!((p[0] - 4.0).abs() < 1e-5);
        assert!((p[1] - 7.0).abs() < 1e-5);
    }

    #[test]
    fn test_transform_compose() {
        let a = Transform2x2::scale_offset(2.0, 2.0, 1.0, 0.0);
        let b = Transform2x2::scale_offset(0.5, 0.5, 0.0, 3.0);
        let ab = a.then(&b);
        // b(a(p)) for p = (1, 1): a -> (3, 2), b -> (1.5, 4)
        assert_eq!(ab.apply([1.0, 1.0]), [1.5, 4.0]);
    }
}
