//! Uniform values, their GLSL types, and storage layout math.
//!
//! Three storage classes exist: push constants (std430), the cache-owned
//! uniform buffer (std140), and plain global uniforms. Layout rules are
//! applied identically on every declaration so a cached program can reuse
//! its buffer instance across frames.

use opal_core::{TextureFormat, TextureHandle};

use crate::backend::BufferHandle;

/// A uniform's current value, as declared this session.
#[derive(Debug, Clone, PartialEq)]
pub enum UniformValue {
    Int(i32),
    Float(f32),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    /// Column-major.
    Mat2([f32; 4]),
    /// Column-major.
    Mat3([f32; 9]),
    Texture {
        tex: TextureHandle,
        /// 1, 2 or 3.
        dims: u8,
    },
    /// Write-only storage image.
    Image {
        tex: TextureHandle,
        format: TextureFormat,
    },
    /// Read-write storage buffer with an inline member declaration list.
    StorageBuffer {
        buf: BufferHandle,
        body: String,
    },
}

impl UniformValue {
    /// Vector dimension (components per column).
    pub fn dim_v(&self) -> usize {
        match self {
            UniformValue::Int(_) | UniformValue::Float(_) => 1,
            UniformValue::Vec2(_) | UniformValue::Mat2(_) => 2,
            UniformValue::Vec3(_) | UniformValue::Mat3(_) => 3,
            _ => 1,
        }
    }

    /// Matrix dimension (column count; 1 for non-matrices).
    pub fn dim_m(&self) -> usize {
        match self {
            UniformValue::Mat2(_) => 2,
            UniformValue::Mat3(_) => 3,
            _ => 1,
        }
    }

    /// Whether this is a plain data value (as opposed to an object binding).
    pub fn is_data(&self) -> bool {
        !matches!(
            self,
            UniformValue::Texture { .. }
                | UniformValue::Image { .. }
                | UniformValue::StorageBuffer { .. }
        )
    }

    pub fn glsl_type(&self) -> &'static str {
        match self {
            UniformValue::Int(_) => "int",
            UniformValue::Float(_) => "float",
            UniformValue::Vec2(_) => "vec2",
            UniformValue::Vec3(_) => "vec3",
            UniformValue::Mat2(_) => "mat2",
            UniformValue::Mat3(_) => "mat3",
            UniformValue::Texture { dims: 1, .. } => "sampler1D",
            UniformValue::Texture { dims: 3, .. } => "sampler3D",
            UniformValue::Texture { .. } => "sampler2D",
            UniformValue::Image { .. } => "writeonly image2D",
            UniformValue::StorageBuffer { .. } => "",
        }
    }

    /// Tightly packed bytes of a data value, used for snapshot comparison
    /// and as the copy source. Object bindings return empty.
    pub fn bytes(&self) -> Vec<u8> {
        fn f32s(vals: &[f32]) -> Vec<u8> {
            vals.iter().flat_map(|v| v.to_le_bytes()).collect()
        }
        match self {
            UniformValue::Int(v) => v.to_le_bytes().to_vec(),
            UniformValue::Float(v) => f32s(&[*v]),
            UniformValue::Vec2(v) => f32s(v),
            UniformValue::Vec3(v) => f32s(v),
            UniformValue::Mat2(v) => f32s(v),
            UniformValue::Mat3(v) => f32s(v),
            _ => Vec::new(),
        }
    }
}

/// Alignment/stride/size of one value in some storage class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub align: usize,
    /// Bytes per column.
    pub stride: usize,
    pub size: usize,
}

const EL: usize = 4; // all supported base types are 4 bytes

fn vec_align(dim_v: usize) -> usize {
    match dim_v {
        1 => EL,
        2 => 2 * EL,
        // vec3 aligns like vec4 in both std140 and std430
        _ => 4 * EL,
    }
}

/// std430 layout, used for the push-constant block.
pub fn std430(value: &UniformValue) -> Layout {
    let dim_v = value.dim_v();
    let dim_m = value.dim_m();
    let align = vec_align(dim_v);
    if dim_m > 1 {
        Layout {
            align,
            stride: align,
            size: dim_m * align,
        }
    } else {
        Layout {
            align,
            stride: dim_v * EL,
            size: dim_v * EL,
        }
    }
}

/// std140 layout, used for the uniform buffer. Differs from std430 in that
/// matrix columns are padded out to vec4.
pub fn std140(value: &UniformValue) -> Layout {
    let dim_v = value.dim_v();
    let dim_m = value.dim_m();
    if dim_m > 1 {
        Layout {
            align: 4 * EL,
            stride: 4 * EL,
            size: dim_m * 4 * EL,
        }
    } else {
        Layout {
            align: vec_align(dim_v),
            stride: dim_v * EL,
            size: dim_v * EL,
        }
    }
}

/// Host-side packing of the declared value: tight, column-major.
pub fn tight(value: &UniformValue) -> Layout {
    let dim_v = value.dim_v();
    let dim_m = value.dim_m();
    Layout {
        align: EL,
        stride: dim_v * EL,
        size: dim_m * dim_v * EL,
    }
}

pub fn align_up(v: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (v + align - 1) & !(align - 1)
}

/// Copy a tightly packed value into a destination blob with the given
/// per-column stride, starting at `offset`.
pub fn copy_strided(dst: &mut [u8], offset: usize, src: &[u8], src_layout: Layout, dst_layout: Layout) {
    let mut s = 0;
    let mut d = offset;
    let cols = if src_layout.stride == 0 { 0 } else { src.len() / src_layout.stride };
    for _ in 0..cols {
        dst[d..d + src_layout.stride].copy_from_slice(&src[s..s + src_layout.stride]);
        s += src_layout.stride;
        d += dst_layout.stride;
    }
}

/// Which storage class a data uniform was assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    PushConstant { offset: usize, layout: Layout },
    Ubo { offset: usize, layout: Layout },
    Global,
    /// Texture/image/buffer objects: slot in their binding namespace.
    Binding(u32),
}

/// Binding namespaces with independent monotonically increasing slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Texture,
    Image,
    UniformBuffer,
    StorageBuffer,
}

impl Namespace {
    pub const COUNT: usize = 4;

    pub fn index(&self) -> usize {
        match self {
            Namespace::Texture => 0,
            Namespace::Image => 1,
            Namespace::UniformBuffer => 2,
            Namespace::StorageBuffer => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec3_padding() {
        let v = UniformValue::Vec3([0.0; 3]);
        assert_eq!(std430(&v), Layout { align: 16, stride: 12, size: 12 });
        assert_eq!(std140(&v), Layout { align: 16, stride: 12, size: 12 });
        assert_eq!(tight(&v).size, 12);
    }

    #[test]
    fn test_mat2_differs_between_classes() {
        let v = UniformValue::Mat2([0.0; 4]);
        // std430 packs mat2 columns as vec2, std140 pads to vec4.
        assert_eq!(std430(&v), Layout { align: 8, stride: 8, size: 16 });
        assert_eq!(std140(&v), Layout { align: 16, stride: 16, size: 32 });
    }

    #[test]
    fn test_mat3_column_stride() {
        let v = UniformValue::Mat3([0.0; 9]);
        assert_eq!(std430(&v), Layout { align: 16, stride: 16, size: 48 });
        assert_eq!(tight(&v), Layout { align: 4, stride: 12, size: 36 });
    }

    #[test]
    fn test_copy_strided_pads_columns() {
        let v = UniformValue::Mat2([1.0, 2.0, 3.0, 4.0]);
        let src = v.bytes();
        let mut dst = vec![0u8; 32];
        copy_strided(&mut dst, 0, &src, tight(&v), std140(&v));
        // First column at 0, second at 16.
        assert_eq!(&dst[0..4], &1.0f32.to_le_bytes());
        assert_eq!(&dst[16..20], &3.0f32.to_le_bytes());
        assert_eq!(&dst[8..12], &[0u8; 4]);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(4, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 4), 20);
    }

    #[test]
    fn test_value_bytes_roundtrip_length() {
        assert_eq!(UniformValue::Float(1.0).bytes().len(), 4);
        assert_eq!(UniformValue::Vec3([0.0; 3]).bytes().len(), 12);
        assert_eq!(UniformValue::Mat3([0.0; 9]).bytes().len(), 36);
        assert!(UniformValue::Texture {
            tex: TextureHandle(1),
            dims: 2
        }
        .bytes()
        .is_empty());
    }
}
