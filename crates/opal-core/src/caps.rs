//! Backend capability profile.
//!
//! All capability-dependent branching in the renderer goes through a
//! [`BackendProfile`] computed once when the backend is created. Components
//! query it via small predicates instead of probing the GPU ad hoc.

use serde::{Deserialize, Serialize};

/// Capability bit set advertised by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendCaps(pub u32);

impl BackendCaps {
    /// Compute shaders are available.
    pub const COMPUTE: u32 = 1 << 0;
    /// Read-only storage buffers can be bound to shaders.
    pub const BUF_RO: u32 = 1 << 1;
    /// Read-write storage buffers can be bound to shaders.
    pub const BUF_RW: u32 = 1 << 2;
    /// Plain (non-block) global uniforms are supported.
    pub const GLOBAL_UNIFORMS: u32 = 1 << 3;
    /// Push constants (small fast-path parameter block) are supported.
    pub const PUSH_CONSTANTS: u32 = 1 << 4;
    /// textureGather is available.
    pub const GATHER: u32 = 1 << 5;
    /// gl_FragCoord is meaningful in fragment shaders.
    pub const FRAGCOORD: u32 = 1 << 6;
    /// 1D textures.
    pub const TEX_1D: u32 = 1 << 7;
    /// 3D textures.
    pub const TEX_3D: u32 = 1 << 8;
    /// Texture-to-texture blits.
    pub const BLIT: u32 = 1 << 9;
    /// gl_NumWorkGroups is usable in compute shaders.
    pub const NUM_GROUPS: u32 = 1 << 10;

    pub fn has(&self, cap: u32) -> bool {
        self.0 & cap == cap
    }

    pub fn insert(&mut self, cap: u32) {
        self.0 |= cap;
    }

    pub fn remove(&mut self, cap: u32) {
        self.0 &= !cap;
    }
}

/// Static description of what a backend can do, computed once at creation.
///
/// Serializable so a profile can be captured from a real device and replayed
/// in tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendProfile {
    /// Human-readable backend name, for logs.
    pub name: String,
    pub caps: BackendCaps,
    /// GLSL target version the backend compiles (e.g. 450).
    pub glsl_version: u32,
    /// Maximum push-constant block size in bytes. Zero when unsupported.
    pub max_pushc_size: usize,
    /// Maximum compute shared-memory size in bytes.
    pub max_shmem: usize,
    /// Maximum total threads per compute workgroup.
    pub max_workgroup_threads: u32,
    /// Largest 2D texture dimension.
    pub max_texture_dim: u32,
    /// A 16-bit float texture format exists and is linearly filterable.
    pub filterable_f16: bool,
    /// Two-component narrow textures (rg8/rg16) exist.
    pub tex_rg: bool,
}

impl BackendProfile {
    pub fn has_compute(&self) -> bool {
        self.caps.has(BackendCaps::COMPUTE)
    }

    pub fn has_push_constants(&self) -> bool {
        self.caps.has(BackendCaps::PUSH_CONSTANTS) && self.max_pushc_size > 0
    }

    pub fn has_readonly_buffers(&self) -> bool {
        self.caps.has(BackendCaps::BUF_RO)
    }

    pub fn has_global_uniforms(&self) -> bool {
        self.caps.has(BackendCaps::GLOBAL_UNIFORMS)
    }

    pub fn has_gather(&self) -> bool {
        self.caps.has(BackendCaps::GATHER)
    }

    /// Whether the profile can sustain the full render path at all; callers
    /// falling below this run the single-pass dumb path permanently.
    pub fn supports_full_path(&self) -> bool {
        self.glsl_version >= 130 && self.filterable_f16 && self.tex_rg
    }
}

impl Default for BackendProfile {
    /// A conservative profile corresponding to a plain GL 3.3 class device.
    fn default() -> Self {
        Self {
            name: "default".into(),
            caps: BackendCaps(BackendCaps::GLOBAL_UNIFORMS | BackendCaps::FRAGCOORD),
            glsl_version: 330,
            max_pushc_size: 0,
            max_shmem: 0,
            max_workgroup_threads: 0,
            max_texture_dim: 8192,
            filterable_f16: true,
            tex_rg: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caps_insert_remove() {
        let mut caps = BackendCaps::default();
        assert!(!caps.has(BackendCaps::COMPUTE));
        caps.insert(BackendCaps::COMPUTE);
        assert!(caps.has(BackendCaps::COMPUTE));
        caps.remove(BackendCaps::COMPUTE);
        assert!(!caps.has(BackendCaps::COMPUTE));
    }

    #[test]
    fn test_default_profile_is_full_path_capable() {
        let profile = BackendProfile::default();
        assert!(profile.supports_full_path());
        assert!(!profile.has_push_constants());
        assert!(profile.has_global_uniforms());
    }

    #[test]
    fn test_profile_roundtrips_through_json() {
        let profile = BackendProfile::default();
        let json = serde_json::to_string(&profile).unwrap();
        let back: BackendProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(profile, back);
    }
}
