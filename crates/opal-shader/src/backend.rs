//! The GPU backend seam.
//!
//! Everything that talks to an actual device goes through [`Backend`]. The
//! shader cache and the render pipeline only ever see handles, so the whole
//! shader-generation stack can run against the [`NullBackend`] with a
//! replayed capability profile — no device required.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use opal_core::{BackendProfile, OpalError, OpalResult, TextureDesc, TextureHandle};
use tracing::debug;

/// Opaque backend buffer identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

/// Opaque compiled-program identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramHandle(pub u64);

/// What kind of pass a program runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    Raster,
    Compute,
}

/// Buffer usage classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Uniform,
    Storage,
}

/// One float vertex attribute of the pass-through vertex stage.
#[derive(Debug, Clone, PartialEq)]
pub struct VertexAttrib {
    pub name: String,
    /// Component count (1-4).
    pub dim: u8,
}

/// Fully assembled shader source handed to the backend for compilation.
#[derive(Debug, Clone, Default)]
pub struct ShaderSource {
    pub vertex: Option<String>,
    pub fragment: Option<String>,
    pub compute: Option<String>,
    pub vertex_attribs: Vec<VertexAttrib>,
    pub vertex_stride: usize,
    pub push_constants_size: usize,
    /// Previously persisted program binary, if the disk cache had one.
    pub cached_blob: Option<Vec<u8>>,
}

impl ShaderSource {
    pub fn kind(&self) -> PassKind {
        if self.compute.is_some() {
            PassKind::Compute
        } else {
            PassKind::Raster
        }
    }
}

/// Result of a successful compile.
#[derive(Debug, Clone)]
pub struct CompiledProgram {
    pub handle: ProgramHandle,
    /// Backend-specific binary for disk persistence, when available.
    pub binary: Option<Vec<u8>>,
}

/// One bound input of a pass run.
#[derive(Debug, Clone)]
pub enum BoundValue {
    Texture {
        binding: u32,
        tex: TextureHandle,
    },
    /// Writable storage image.
    Image {
        binding: u32,
        tex: TextureHandle,
    },
    /// Read-only uniform buffer (including the cache-owned UBO).
    UniformBuffer {
        binding: u32,
        buf: BufferHandle,
    },
    StorageBuffer {
        binding: u32,
        buf: BufferHandle,
    },
    /// Plain global uniform with tightly packed data.
    Global {
        name: String,
        data: Vec<u8>,
    },
}

/// Everything needed to run one pass.
#[derive(Debug, Clone)]
pub struct PassRun<'a> {
    pub program: ProgramHandle,
    pub values: &'a [BoundValue],
    pub push_constants: Option<&'a [u8]>,
    /// Render target; None for compute passes.
    pub target: Option<TextureHandle>,
    /// Previous target contents may be discarded.
    pub discard_target: bool,
    pub vertex_data: &'a [u8],
    pub vertex_count: usize,
    /// Compute workgroup counts; ignored for raster passes.
    pub compute_groups: [u32; 3],
}

/// A GPU device abstraction. Created once, passed to every component.
pub trait Backend: Send + Sync {
    fn profile(&self) -> &BackendProfile;

    fn create_texture(&self, desc: &TextureDesc) -> OpalResult<TextureHandle>;
    fn upload_texture(&self, tex: TextureHandle, data: &[u8]) -> OpalResult<()>;
    fn destroy_texture(&self, tex: TextureHandle);

    fn create_buffer(&self, kind: BufferKind, size: usize) -> OpalResult<BufferHandle>;
    fn update_buffer(&self, buf: BufferHandle, offset: usize, data: &[u8]) -> OpalResult<()>;

    fn compile(&self, source: &ShaderSource) -> OpalResult<CompiledProgram>;
    fn destroy_program(&self, program: ProgramHandle);

    fn run(&self, run: &PassRun) -> OpalResult<()>;

    /// Most recent GPU time for a program in nanoseconds, if the backend
    /// measures one. Never blocks.
    fn poll_timer(&self, program: ProgramHandle) -> Option<u64>;

    /// Synchronous readback, for verification paths. Backends without
    /// readback return Unsupported.
    fn read_texture(&self, _tex: TextureHandle) -> OpalResult<Vec<u8>> {
        Err(OpalError::Unsupported("texture readback".into()))
    }
}

#[derive(Default)]
struct NullState {
    textures: HashMap<u64, TextureDesc>,
    buffers: HashMap<u64, usize>,
    programs: HashMap<u64, ShaderSource>,
    /// Every compile in order, kept for test inspection.
    compile_log: Vec<ShaderSource>,
    runs: u64,
    buffer_updates: u64,
}

/// A device-free backend: allocates handles, records compiles and runs, and
/// never touches a GPU. Used for shader pre-generation and tests.
pub struct NullBackend {
    profile: BackendProfile,
    next_id: AtomicU64,
    state: Mutex<NullState>,
    /// When set, every compile fails; exercises the error-latch path.
    fail_compiles: bool,
}

impl NullBackend {
    pub fn new(profile: BackendProfile) -> Self {
        Self {
            profile,
            next_id: AtomicU64::new(1),
            state: Mutex::new(NullState::default()),
            fail_compiles: false,
        }
    }

    pub fn failing_compiles(profile: BackendProfile) -> Self {
        Self {
            fail_compiles: true,
            ..Self::new(profile)
        }
    }

    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of compiles recorded so far.
    pub fn compile_count(&self) -> usize {
        self.state.lock().map(|s| s.programs.len()).unwrap_or(0)
    }

    /// Number of pass runs recorded so far.
    pub fn run_count(&self) -> u64 {
        self.state.lock().map(|s| s.runs).unwrap_or(0)
    }

    /// Number of buffer updates recorded so far.
    pub fn buffer_update_count(&self) -> u64 {
        self.state.lock().map(|s| s.buffer_updates).unwrap_or(0)
    }

    /// The descriptor a texture was created with, for inspection in tests.
    pub fn texture_desc(&self, tex: TextureHandle) -> Option<TextureDesc> {
        self.state.lock().ok().and_then(|s| s.textures.get(&tex.0).copied())
    }

    /// The source of a compiled program, for inspection in tests.
    pub fn program_source(&self, program: ProgramHandle) -> Option<ShaderSource> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.programs.get(&program.0).cloned())
    }

    /// All compiled sources in compile order, for inspection in tests.
    pub fn compiled_sources(&self) -> Vec<ShaderSource> {
        self.state
            .lock()
            .map(|s| s.compile_log.clone())
            .unwrap_or_default()
    }

    /// The most recently compiled source, for inspection in tests.
    pub fn last_program_source(&self) -> Option<ShaderSource> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.compile_log.last().cloned())
    }
}

impl Backend for NullBackend {
    fn profile(&self) -> &BackendProfile {
        &self.profile
    }

    fn create_texture(&self, desc: &TextureDesc) -> OpalResult<TextureHandle> {
        if desc.w > self.profile.max_texture_dim || desc.h > self.profile.max_texture_dim {
            return Err(OpalError::Allocation(format!(
                "texture {}x{} exceeds device limit {}",
                desc.w, desc.h, self.profile.max_texture_dim
            )));
        }
        let id = self.next();
        if let Ok(mut s) = self.state.lock() {
            s.textures.insert(id, *desc);
        }
        Ok(TextureHandle(id))
    }

    fn upload_texture(&self, _tex: TextureHandle, _data: &[u8]) -> OpalResult<()> {
        Ok(())
    }

    fn destroy_texture(&self, tex: TextureHandle) {
        if let Ok(mut s) = self.state.lock() {
            s.textures.remove(&tex.0);
        }
    }

    fn create_buffer(&self, _kind: BufferKind, size: usize) -> OpalResult<BufferHandle> {
        let id = self.next();
        if let Ok(mut s) = self.state.lock() {
            s.buffers.insert(id, size);
        }
        Ok(BufferHandle(id))
    }

    fn update_buffer(&self, _buf: BufferHandle, _offset: usize, _data: &[u8]) -> OpalResult<()> {
        if let Ok(mut s) = self.state.lock() {
            s.buffer_updates += 1;
        }
        Ok(())
    }

    fn compile(&self, source: &ShaderSource) -> OpalResult<CompiledProgram> {
        if self.fail_compiles {
            return Err(OpalError::Compile("null backend: forced failure".into()));
        }
        let id = self.next();
        debug!(program = id, kind = ?source.kind(), "null backend compile");
        if let Ok(mut s) = self.state.lock() {
            s.programs.insert(id, source.clone());
            s.compile_log.push(source.clone());
        }
        // Deterministic pseudo-binary so disk-cache persistence is testable.
        let mut binary = Vec::new();
        for part in [&source.vertex, &source.fragment, &source.compute]
            .into_iter()
            .flatten()
        {
            binary.extend_from_slice(part.as_bytes());
        }
        Ok(CompiledProgram {
            handle: ProgramHandle(id),
            binary: Some(binary),
        })
    }

    fn destroy_program(&self, program: ProgramHandle) {
        if let Ok(mut s) = self.state.lock() {
            s.programs.remove(&program.0);
        }
    }

    fn run(&self, _run: &PassRun) -> OpalResult<()> {
        if let Ok(mut s) = self.state.lock() {
            s.runs += 1;
        }
        Ok(())
    }

    fn poll_timer(&self, _program: ProgramHandle) -> Option<u64> {
        None
    }
}

/// A profile resembling a modern Vulkan-class device, for tests and
/// headless generation.
pub fn vulkan_class_profile() -> BackendProfile {
    use opal_core::BackendCaps;
    let mut caps = BackendCaps::default();
    for c in [
        BackendCaps::COMPUTE,
        BackendCaps::BUF_RO,
        BackendCaps::BUF_RW,
        BackendCaps::PUSH_CONSTANTS,
        BackendCaps::GATHER,
        BackendCaps::FRAGCOORD,
        BackendCaps::TEX_1D,
        BackendCaps::TEX_3D,
        BackendCaps::BLIT,
        BackendCaps::NUM_GROUPS,
    ] {
        caps.insert(c);
    }
    BackendProfile {
        name: "null-vulkan".into(),
        caps,
        glsl_version: 450,
        max_pushc_size: 128,
        max_shmem: 32768,
        max_workgroup_threads: 1024,
        max_texture_dim: 16384,
        filterable_f16: true,
        tex_rg: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_backend_handles_are_unique() {
        let b = NullBackend::new(vulkan_class_profile());
        let t1 = b
            .create_texture(&TextureDesc::plane(4, 4, opal_core::TextureFormat::Rgba8))
            .unwrap();
        let t2 = b
            .create_texture(&TextureDesc::plane(4, 4, opal_core::TextureFormat::Rgba8))
            .unwrap();
        assert_ne!(t1, t2);
    }

    #[test]
    fn test_null_backend_oversized_texture_fails() {
        let b = NullBackend::new(vulkan_class_profile());
        let desc = TextureDesc::plane(1 << 20, 2, opal_core::TextureFormat::R8);
        assert!(matches!(
            b.create_texture(&desc),
            Err(OpalError::Allocation(_))
        ));
    }

    #[test]
    fn test_failing_backend_reports_compile_error() {
        let b = NullBackend::failing_compiles(vulkan_class_profile());
        let src = ShaderSource {
            compute: Some("void main() {}".into()),
            ..Default::default()
        };
        assert!(matches!(b.compile(&src), Err(OpalError::Compile(_))));
    }
}
