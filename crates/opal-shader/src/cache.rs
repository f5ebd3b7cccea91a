//! Shader builder session and compiled-program cache.
//!
//! A session accumulates prelude/header/body text and uniform declarations
//! between `reset()` and one `dispatch_*` call. Dispatch assembles the final
//! GLSL, hashes it, and reuses a cached compiled program when one exists.
//! The cache holds a fixed number of entries and flushes in bulk when full;
//! per-entry eviction is pointless at this size and would complicate the
//! append-only invariant.

use std::path::PathBuf;
use std::sync::Arc;

use opal_core::{hash_bytes, ContentHash, OpalError, OpalResult, TextureFormat, TextureHandle};
use tracing::{debug, error, info, warn};

use crate::backend::{
    Backend, BoundValue, BufferHandle, BufferKind, PassRun, ProgramHandle, ShaderSource,
    VertexAttrib,
};
use crate::uniforms::{
    align_up, copy_strided, std140, std430, tight, Namespace, Storage, UniformValue,
};

/// Compiled-program cache capacity. Exceeding it flushes everything.
pub const SC_MAX_ENTRIES: usize = 48;

// Guards disk-cache files against stale formats.
const CACHE_HEADER: &[u8] = b"opal shader cache v1\n";

/// Outcome of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchInfo {
    /// False when the dispatch no-opped because the error latch is set.
    pub ran: bool,
    /// Most recent GPU time of this pass, if the backend measures it.
    pub gpu_ns: Option<u64>,
}

#[derive(Debug)]
struct Uniform {
    name: String,
    value: UniformValue,
    storage: Storage,
}

struct Entry {
    hash: ContentHash,
    program: Option<ProgramHandle>,
    pushc: Vec<u8>,
    ubo: Option<BufferHandle>,
    ubo_data: Vec<u8>,
    /// Last-pushed value per uniform slot; pushes happen only on change.
    snapshots: Vec<Option<Vec<u8>>>,
}

/// The shader builder session plus its compiled-program cache.
pub struct ShaderCache {
    backend: Arc<dyn Backend>,

    prelude: String,
    header: String,
    body: String,
    uniforms: Vec<Uniform>,
    next_binding: [u32; Namespace::COUNT],
    next_dynamic: bool,
    pushc_size: usize,
    ubo_size: usize,
    ubo_binding: u32,
    needs_reset: bool,

    error_state: bool,
    entries: Vec<Entry>,
    cache_dir: Option<PathBuf>,
}

impl ShaderCache {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            prelude: String::new(),
            header: String::new(),
            body: String::new(),
            uniforms: Vec::new(),
            next_binding: [0; Namespace::COUNT],
            next_dynamic: false,
            pushc_size: 0,
            ubo_size: 0,
            ubo_binding: 0,
            needs_reset: false,
            error_state: false,
            entries: Vec::new(),
            cache_dir: None,
        }
    }

    /// Enable the on-disk program cache. Purely an optimization; files are
    /// safe to delete at any time.
    pub fn set_cache_dir(&mut self, dir: impl Into<PathBuf>) {
        self.cache_dir = Some(dir.into());
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// True once a compile has failed. All dispatches no-op until
    /// [`ShaderCache::clear_error_state`].
    pub fn error_state(&self) -> bool {
        self.error_state
    }

    pub fn clear_error_state(&mut self) {
        self.error_state = false;
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Whether a program with this exact generated source is resident.
    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.entries.iter().any(|e| e.hash == *hash)
    }

    // --- session text accumulation ---

    /// Append a line to the shader body.
    pub fn add(&mut self, text: impl AsRef<str>) {
        self.assert_session();
        self.body.push_str(text.as_ref());
        self.body.push('\n');
    }

    /// Append a line to the header (declarations, helper functions).
    pub fn hadd(&mut self, text: impl AsRef<str>) {
        self.assert_session();
        self.header.push_str(text.as_ref());
        self.header.push('\n');
    }

    /// Append a line to the prelude (macros that must precede the header).
    pub fn padd(&mut self, text: impl AsRef<str>) {
        self.assert_session();
        self.prelude.push_str(text.as_ref());
        self.prelude.push('\n');
    }

    fn assert_session(&self) {
        // Adding text or uniforms after generate and before reset is a
        // programmer error, not a runtime condition.
        assert!(!self.needs_reset, "shader cache used without reset()");
    }

    /// Selector vector type for mix(). GLSL before 1.30 cannot mix with
    /// boolean vectors.
    pub fn bvec(&self, dims: u8) -> &'static str {
        let modern = self.backend.profile().glsl_version >= 130;
        match (dims, modern) {
            (2, true) => "bvec2",
            (3, true) => "bvec3",
            (_, true) => "bvec4",
            (2, false) => "vec2",
            (3, false) => "vec3",
            (_, false) => "vec4",
        }
    }

    #[cfg(test)]
    pub(crate) fn body_text(&self) -> &str {
        &self.body
    }

    #[cfg(test)]
    pub(crate) fn header_text(&self) -> &str {
        &self.header
    }

    #[cfg(test)]
    pub(crate) fn has_uniform(&self, name: &str) -> bool {
        self.uniforms.iter().any(|u| u.name == name)
    }

    // --- uniforms ---

    /// Flag the next declared uniform as frequently changing.
    pub fn uniform_dynamic(&mut self) {
        self.next_dynamic = true;
    }

    fn next_binding(&mut self, ns: Namespace) -> u32 {
        let b = self.next_binding[ns.index()];
        self.next_binding[ns.index()] += 1;
        b
    }

    fn assign_storage(&mut self, value: &UniformValue) -> Storage {
        let dynamic = self.next_dynamic;
        self.next_dynamic = false;
        let profile = self.backend.profile().clone();

        // Keep matrices out of push constants unless dynamic; they eat the
        // small budget and gain little.
        let try_pushc = value.dim_m() == 1 || dynamic;
        if try_pushc && profile.has_push_constants() {
            let layout = std430(value);
            let offset = align_up(self.pushc_size, layout.align);
            if offset + layout.size <= profile.max_pushc_size {
                self.pushc_size = offset + layout.size;
                return Storage::PushConstant { offset, layout };
            }
        }

        // UBOs need explicit member offsets (GLSL >= 440). Dynamic values
        // stay out of the UBO when plain globals exist, to avoid
        // synchronizing buffer writes every frame.
        let try_ubo = !profile.has_global_uniforms() || !dynamic;
        if try_ubo && profile.glsl_version >= 440 && profile.has_readonly_buffers() {
            let layout = std140(value);
            let offset = align_up(self.ubo_size, layout.align);
            self.ubo_size = offset + layout.size;
            return Storage::Ubo { offset, layout };
        }

        if !profile.has_global_uniforms() {
            warn!("backend lacks global uniforms and all other storage classes were rejected");
        }
        Storage::Global
    }

    fn declare(&mut self, name: &str, value: UniformValue, storage: Storage) {
        self.assert_session();
        if let Some(u) = self.uniforms.iter_mut().find(|u| u.name == name) {
            u.value = value;
            u.storage = storage;
            return;
        }
        self.uniforms.push(Uniform {
            name: name.into(),
            value,
            storage,
        });
    }

    fn declare_data(&mut self, name: &str, value: UniformValue) {
        let storage = self.assign_storage(&value);
        self.declare(name, value, storage);
    }

    pub fn uniform_int(&mut self, name: &str, v: i32) {
        self.declare_data(name, UniformValue::Int(v));
    }

    pub fn uniform_f(&mut self, name: &str, v: f32) {
        self.declare_data(name, UniformValue::Float(v));
    }

    pub fn uniform_vec2(&mut self, name: &str, v: [f32; 2]) {
        self.declare_data(name, UniformValue::Vec2(v));
    }

    pub fn uniform_vec3(&mut self, name: &str, v: [f32; 3]) {
        self.declare_data(name, UniformValue::Vec3(v));
    }

    /// Declare a mat2. `v` is row-major when `transpose` is set, otherwise
    /// column-major.
    pub fn uniform_mat2(&mut self, name: &str, transpose: bool, v: [f32; 4]) {
        let v = if transpose { [v[0], v[2], v[1], v[3]] } else { v };
        self.declare_data(name, UniformValue::Mat2(v));
    }

    /// Declare a mat3 from column-major values.
    pub fn uniform_mat3(&mut self, name: &str, v: [f32; 9]) {
        self.declare_data(name, UniformValue::Mat3(v));
    }

    pub fn uniform_texture(&mut self, name: &str, tex: TextureHandle, dims: u8) {
        let binding = self.next_binding(Namespace::Texture);
        self.declare(name, UniformValue::Texture { tex, dims }, Storage::Binding(binding));
    }

    /// Write-only storage image, for compute outputs.
    pub fn uniform_image(&mut self, name: &str, tex: TextureHandle, format: TextureFormat) {
        let binding = self.next_binding(Namespace::Image);
        self.declare(name, UniformValue::Image { tex, format }, Storage::Binding(binding));
    }

    /// Read-write storage buffer with an inline member list, e.g.
    /// `"uint counter; float frame_max[16];"`.
    pub fn ssbo(&mut self, name: &str, buf: BufferHandle, body: &str) {
        let binding = self.next_binding(Namespace::StorageBuffer);
        self.declare(
            name,
            UniformValue::StorageBuffer {
                buf,
                body: body.into(),
            },
            Storage::Binding(binding),
        );
    }

    // --- generation ---

    fn uniform_block_text(&self) -> String {
        let mut out = String::new();
        if self.ubo_size > 0 {
            out.push_str(&format!(
                "layout(std140, binding={}) uniform UBO {{\n",
                self.ubo_binding
            ));
            for u in &self.uniforms {
                if let Storage::Ubo { offset, .. } = u.storage {
                    out.push_str(&format!(
                        "layout(offset={}) {} {};\n",
                        offset,
                        u.value.glsl_type(),
                        u.name
                    ));
                }
            }
            out.push_str("};\n");
        }

        if self.pushc_size > 0 {
            out.push_str("layout(std430, push_constant) uniform PushC {\n");
            for u in &self.uniforms {
                if let Storage::PushConstant { offset, .. } = u.storage {
                    // Push constants don't support explicit offsets; the
                    // comment documents the layout for debugging.
                    out.push_str(&format!(
                        "/*offset={}*/ {} {};\n",
                        offset,
                        u.value.glsl_type(),
                        u.name
                    ));
                }
            }
            out.push_str("};\n");
        }

        for u in &self.uniforms {
            match (&u.storage, &u.value) {
                (Storage::Global, v) => {
                    out.push_str(&format!("uniform {} {};\n", v.glsl_type(), u.name));
                }
                (Storage::Binding(b), UniformValue::Texture { .. }) => {
                    out.push_str(&format!(
                        "layout(binding={}) uniform {} {};\n",
                        b,
                        u.value.glsl_type(),
                        u.name
                    ));
                }
                (Storage::Binding(b), UniformValue::Image { format, .. }) => {
                    out.push_str(&format!(
                        "layout(binding={}, {}) uniform {} {};\n",
                        b,
                        format.glsl_format(),
                        u.value.glsl_type(),
                        u.name
                    ));
                }
                (Storage::Binding(b), UniformValue::StorageBuffer { body, .. }) => {
                    out.push_str(&format!(
                        "layout(std430, binding={}) buffer {} {{ {} }};\n",
                        b, u.name, body
                    ));
                }
                _ => {}
            }
        }
        out
    }

    fn common_header(&self) -> String {
        let mut h = format!("#version {}\n", self.backend.profile().glsl_version);
        h.push_str("#define tex1D texture\n");
        h.push_str("#define tex3D texture\n");
        h.push_str(
            "#define LUT_POS(x, lut_size) \
             mix(0.5 / (lut_size), 1.0 - 0.5 / (lut_size), (x))\n",
        );
        h
    }

    fn assemble(
        &mut self,
        target_format: Option<TextureFormat>,
        vao: &[VertexAttrib],
    ) -> (ShaderSource, ContentHash) {
        let header = self.common_header();
        let mut source = ShaderSource {
            vertex_attribs: vao.to_vec(),
            vertex_stride: vao.iter().map(|a| a.dim as usize * 4).sum(),
            push_constants_size: align_up(self.pushc_size, 4),
            ..Default::default()
        };

        let is_compute = target_format.is_none();
        if !is_compute {
            // Pass-through vertex stage generated from the attributes; the
            // fragment stage gets matching varyings.
            let mut vert_head = header.clone();
            let mut vert_body = String::from("void main() {\n");
            let mut frag_vaos = String::new();
            for (n, a) in vao.iter().enumerate() {
                let ty = match a.dim {
                    1 => "float",
                    2 => "vec2",
                    3 => "vec3",
                    _ => "vec4",
                };
                let loc = format!("layout(location={}) ", n);
                if a.name == "position" {
                    debug_assert_eq!(a.dim, 2);
                    vert_head.push_str(&format!("{}in vec2 vertex_position;\n", loc));
                    vert_body.push_str("gl_Position = vec4(vertex_position, 1.0, 1.0);\n");
                } else {
                    vert_head.push_str(&format!("{}in {} vertex_{};\n", loc, ty, a.name));
                    vert_head.push_str(&format!("{}out {} {};\n", loc, ty, a.name));
                    vert_body.push_str(&format!("{} = vertex_{};\n", a.name, a.name));
                    frag_vaos.push_str(&format!("{}in {} {};\n", loc, ty, a.name));
                }
            }
            vert_body.push_str("}\n");

            let mut frag = header.clone();
            frag.push_str("layout(location=0) out vec4 out_color;\n");
            frag.push_str(&frag_vaos);
            frag.push_str(&self.uniform_block_text());
            frag.push_str(&self.prelude);
            frag.push_str(&self.header);
            frag.push_str("void main() {\n");
            // All generated bodies write to a "vec4 color".
            frag.push_str("vec4 color = vec4(0.0, 0.0, 0.0, 1.0);\n");
            frag.push_str(&self.body);
            frag.push_str("out_color = color;\n");
            frag.push_str("}\n");

            source.vertex = Some(vert_head + &vert_body);
            source.fragment = Some(frag);
        } else {
            let mut comp = header;
            comp.push_str(&self.uniform_block_text());
            comp.push_str(&self.prelude);
            comp.push_str(&self.header);
            comp.push_str("void main() {\n");
            comp.push_str("vec4 color = vec4(0.0, 0.0, 0.0, 1.0);\n");
            comp.push_str(&self.body);
            comp.push_str("}\n");
            source.compute = Some(comp);
        }

        let mut total = String::new();
        total.push_str(if is_compute { "type compute\n" } else { "type raster\n" });
        if let Some(f) = &source.fragment {
            total.push_str(f);
        }
        total.push('\n');
        if let Some(v) = &source.vertex {
            total.push_str(v);
        }
        total.push('\n');
        if let Some(c) = &source.compute {
            total.push_str(c);
        }
        total.push('\n');
        if let Some(fmt) = target_format {
            total.push_str(&format!("format {:?}\n", fmt));
        }

        let hash = hash_bytes(&total);
        (source, hash)
    }

    fn disk_cache_path(&self, hash: &ContentHash) -> Option<PathBuf> {
        self.cache_dir.as_ref().map(|d| d.join(hash.to_hex()))
    }

    fn load_cached_blob(&self, hash: &ContentHash) -> Option<Vec<u8>> {
        let path = self.disk_cache_path(hash)?;
        let data = std::fs::read(&path).ok()?;
        if data.starts_with(CACHE_HEADER) {
            debug!(file = %path.display(), "loaded shader from disk cache");
            Some(data[CACHE_HEADER.len()..].to_vec())
        } else {
            // Stale or foreign file: treated as a miss, never an error.
            warn!(file = %path.display(), "shader cache file has wrong header, ignoring");
            None
        }
    }

    fn persist_blob(&self, hash: &ContentHash, binary: &[u8], had: Option<&[u8]>) {
        let Some(path) = self.disk_cache_path(hash) else {
            return;
        };
        if had == Some(binary) {
            return;
        }
        let write = || -> std::io::Result<()> {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let mut out = CACHE_HEADER.to_vec();
            out.extend_from_slice(binary);
            std::fs::write(&path, out)
        };
        match write() {
            Ok(()) => debug!(file = %path.display(), "wrote shader cache file"),
            Err(e) => warn!(file = %path.display(), "failed writing shader cache file: {e}"),
        }
    }

    fn flush_entries(&mut self) {
        debug!(entries = self.entries.len(), "flushing shader cache");
        for e in self.entries.drain(..) {
            if let Some(p) = e.program {
                self.backend.destroy_program(p);
            }
        }
    }

    /// Find or create the cache entry for the current session, pushing the
    /// changed uniform values into its storage. Returns the entry index, or
    /// None on compile failure (which also latches the error state).
    fn generate(
        &mut self,
        target_format: Option<TextureFormat>,
        vao: &[VertexAttrib],
    ) -> Option<usize> {
        // reset() must be called after every generation and before the next.
        assert!(!self.needs_reset, "generate without reset()");
        self.needs_reset = true;

        if self.ubo_size > 0 {
            self.ubo_binding = self.next_binding(Namespace::UniformBuffer);
        }

        let (source, hash) = self.assemble(target_format, vao);

        let idx = self.entries.iter().position(|e| e.hash == hash);
        let idx = match idx {
            Some(idx) => idx,
            None => {
                if self.entries.len() == SC_MAX_ENTRIES {
                    self.flush_entries();
                }

                let cached_blob = self.load_cached_blob(&hash);
                let mut source = source;
                source.cached_blob = cached_blob.clone();

                let program = match self.backend.compile(&source) {
                    Ok(compiled) => {
                        if let Some(binary) = &compiled.binary {
                            self.persist_blob(&hash, binary, cached_blob.as_deref());
                        }
                        Some(compiled.handle)
                    }
                    Err(e) => {
                        error!("shader compile failed: {e}");
                        self.error_state = true;
                        None
                    }
                };

                let ubo = if self.ubo_size > 0 && program.is_some() {
                    match self.backend.create_buffer(BufferKind::Uniform, self.ubo_size) {
                        Ok(b) => Some(b),
                        Err(e) => {
                            error!("failed creating uniform buffer: {e}");
                            self.error_state = true;
                            None
                        }
                    }
                } else {
                    None
                };

                self.entries.push(Entry {
                    hash,
                    program,
                    pushc: vec![0u8; align_up(self.pushc_size, 4)],
                    ubo,
                    ubo_data: vec![0u8; self.ubo_size],
                    snapshots: vec![None; self.uniforms.len()],
                });
                self.entries.len() - 1
            }
        };

        if self.entries[idx].program.is_none() {
            // A dead entry (earlier compile failure) re-latches the error so
            // repeated hits keep reporting failure until the cache is
            // flushed or the error is explicitly cleared.
            self.error_state = true;
            return None;
        }

        debug_assert_eq!(self.entries[idx].snapshots.len(), self.uniforms.len());
        self.push_uniform_values(idx);
        Some(idx)
    }

    /// Push each declared value into the entry's storage, skipping values
    /// whose bytes match the last-pushed snapshot for that slot.
    fn push_uniform_values(&mut self, idx: usize) {
        let entry = &mut self.entries[idx];
        for (n, u) in self.uniforms.iter().enumerate() {
            if !u.value.is_data() {
                continue;
            }
            let bytes = u.value.bytes();
            if entry.snapshots[n].as_deref() == Some(bytes.as_slice()) {
                continue;
            }
            match u.storage {
                Storage::PushConstant { offset, layout } => {
                    copy_strided(&mut entry.pushc, offset, &bytes, tight(&u.value), layout);
                }
                Storage::Ubo { offset, layout } => {
                    copy_strided(&mut entry.ubo_data, offset, &bytes, tight(&u.value), layout);
                    if let Some(buf) = entry.ubo {
                        let end = offset + layout.size;
                        if let Err(e) =
                            self.backend
                                .update_buffer(buf, offset, &entry.ubo_data[offset..end])
                        {
                            warn!("UBO update failed: {e}");
                        }
                    }
                }
                // Globals are re-sent with every run; nothing to store.
                Storage::Global => {}
                Storage::Binding(_) => {}
            }
            entry.snapshots[n] = Some(bytes);
        }
    }

    fn bound_values(&self, idx: usize) -> Vec<BoundValue> {
        let entry = &self.entries[idx];
        let mut values = Vec::new();
        for u in &self.uniforms {
            match (&u.storage, &u.value) {
                (Storage::Binding(b), UniformValue::Texture { tex, .. }) => {
                    values.push(BoundValue::Texture {
                        binding: *b,
                        tex: *tex,
                    });
                }
                (Storage::Binding(b), UniformValue::Image { tex, .. }) => {
                    values.push(BoundValue::Image {
                        binding: *b,
                        tex: *tex,
                    });
                }
                (Storage::Binding(b), UniformValue::StorageBuffer { buf, .. }) => {
                    values.push(BoundValue::StorageBuffer {
                        binding: *b,
                        buf: *buf,
                    });
                }
                (Storage::Global, v) => {
                    values.push(BoundValue::Global {
                        name: u.name.clone(),
                        data: v.bytes(),
                    });
                }
                _ => {}
            }
        }
        if let Some(ubo) = entry.ubo {
            values.push(BoundValue::UniformBuffer {
                binding: self.ubo_binding,
                buf: ubo,
            });
        }
        values
    }

    /// Generate (or reuse) the program for the current session and draw it
    /// to `target`. Always resets the session afterwards.
    pub fn dispatch_draw(
        &mut self,
        target: TextureHandle,
        target_format: TextureFormat,
        discard: bool,
        vao: &[VertexAttrib],
        vertex_data: &[u8],
        vertex_count: usize,
    ) -> OpalResult<DispatchInfo> {
        if self.error_state {
            self.reset();
            return Ok(DispatchInfo::default());
        }

        let result = match self.generate(Some(target_format), vao) {
            Some(idx) => {
                let entry = &self.entries[idx];
                let program = entry.program.ok_or_else(|| {
                    OpalError::Compile("dispatch with failed program".into())
                })?;
                let values = self.bound_values(idx);
                let entry = &self.entries[idx];
                let run = PassRun {
                    program,
                    values: &values,
                    push_constants: (!entry.pushc.is_empty()).then_some(entry.pushc.as_slice()),
                    target: Some(target),
                    discard_target: discard,
                    vertex_data,
                    vertex_count,
                    compute_groups: [0; 3],
                };
                self.backend.run(&run).map(|()| DispatchInfo {
                    ran: true,
                    gpu_ns: self.backend.poll_timer(program),
                })
            }
            None => Ok(DispatchInfo::default()),
        };

        self.reset();
        result
    }

    /// Generate (or reuse) the compute program for the current session and
    /// dispatch `w x h x d` workgroups. Always resets the session afterwards.
    pub fn dispatch_compute(&mut self, w: u32, h: u32, d: u32) -> OpalResult<DispatchInfo> {
        if self.error_state {
            self.reset();
            return Ok(DispatchInfo::default());
        }

        let result = match self.generate(None, &[]) {
            Some(idx) => {
                let entry = &self.entries[idx];
                let program = entry.program.ok_or_else(|| {
                    OpalError::Compile("dispatch with failed program".into())
                })?;
                let values = self.bound_values(idx);
                let entry = &self.entries[idx];
                let run = PassRun {
                    program,
                    values: &values,
                    push_constants: (!entry.pushc.is_empty()).then_some(entry.pushc.as_slice()),
                    target: None,
                    discard_target: false,
                    vertex_data: &[],
                    vertex_count: 0,
                    compute_groups: [w, h, d],
                };
                self.backend.run(&run).map(|()| DispatchInfo {
                    ran: true,
                    gpu_ns: self.backend.poll_timer(program),
                })
            }
            None => Ok(DispatchInfo::default()),
        };

        self.reset();
        result
    }

    /// Clear all session state. Must be called exactly once between
    /// generations; `dispatch_*` calls it internally.
    pub fn reset(&mut self) {
        self.prelude.clear();
        self.header.clear();
        self.body.clear();
        self.uniforms.clear();
        self.next_binding = [0; Namespace::COUNT];
        self.next_dynamic = false;
        self.pushc_size = 0;
        self.ubo_size = 0;
        self.ubo_binding = 0;
        self.needs_reset = false;
    }

    /// Drop all compiled programs, e.g. on output format reconfiguration.
    pub fn flush(&mut self) {
        info!("shader cache flushed");
        self.flush_entries();
    }
}

impl Drop for ShaderCache {
    fn drop(&mut self) {
        self.flush_entries();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{vulkan_class_profile, NullBackend};
    use opal_core::{BackendCaps, BackendProfile};

    fn cache_with(profile: BackendProfile) -> (Arc<NullBackend>, ShaderCache) {
        let backend = Arc::new(NullBackend::new(profile));
        let sc = ShaderCache::new(backend.clone());
        (backend, sc)
    }

    fn draw_body(sc: &mut ShaderCache, body: &str) -> DispatchInfo {
        sc.add(body);
        let target = sc
            .backend()
            .create_texture(&opal_core::TextureDesc::target(
                16,
                16,
                opal_core::TextureFormat::Rgba8,
            ))
            .unwrap();
        sc.dispatch_draw(
            target,
            opal_core::TextureFormat::Rgba8,
            true,
            &[VertexAttrib {
                name: "position".into(),
                dim: 2,
            }],
            &[0u8; 32],
            4,
        )
        .unwrap()
    }

    #[test]
    fn test_repeat_generate_hits_cache() {
        let (backend, mut sc) = cache_with(vulkan_class_profile());
        sc.uniform_f("gamma", 2.2);
        draw_body(&mut sc, "color.rgb = pow(color.rgb, vec3(gamma));");
        assert_eq!(backend.compile_count(), 1);

        sc.uniform_f("gamma", 2.2);
        draw_body(&mut sc, "color.rgb = pow(color.rgb, vec3(gamma));");
        assert_eq!(backend.compile_count(), 1);
        assert_eq!(sc.entry_count(), 1);
    }

    #[test]
    fn test_full_flush_at_capacity() {
        let (backend, mut sc) = cache_with(vulkan_class_profile());
        // 50 distinct single-character bodies against 48 slots.
        for c in 0..50u8 {
            draw_body(&mut sc, &format!("color.r = {}.0;", c));
        }
        // One full flush happened at insertion 49; afterwards entries 49
        // and 50 are resident.
        assert_eq!(backend.compile_count(), 50);
        assert_eq!(sc.entry_count(), 2);
        // Entry 49 is still cached: re-dispatching it compiles nothing new.
        draw_body(&mut sc, "color.r = 48.0;");
        assert_eq!(backend.compile_count(), 50);
        assert_eq!(sc.entry_count(), 2);
    }

    #[test]
    fn test_storage_assignment_deterministic() {
        let declare_all = |sc: &mut ShaderCache| {
            sc.uniform_f("a", 1.0);
            sc.uniform_vec3("b", [0.0; 3]);
            sc.uniform_mat3("m", [0.0; 9]);
            sc.uniform_dynamic();
            sc.uniform_vec2("dyn", [0.0; 2]);
        };
        let (_, mut sc1) = cache_with(vulkan_class_profile());
        let (_, mut sc2) = cache_with(vulkan_class_profile());
        declare_all(&mut sc1);
        declare_all(&mut sc2);
        let s1: Vec<Storage> = sc1.uniforms.iter().map(|u| u.storage).collect();
        let s2: Vec<Storage> = sc2.uniforms.iter().map(|u| u.storage).collect();
        assert_eq!(s1, s2);
        // Vulkan-class profile: scalars and vectors go to push constants,
        // matrices to the UBO.
        assert!(matches!(s1[0], Storage::PushConstant { offset: 0, .. }));
        assert!(matches!(s1[2], Storage::Ubo { offset: 0, .. }));
    }

    #[test]
    fn test_matrix_goes_to_pushc_only_when_dynamic() {
        let (_, mut sc) = cache_with(vulkan_class_profile());
        sc.uniform_mat2("static_m", false, [0.0; 4]);
        sc.uniform_dynamic();
        sc.uniform_mat2("dynamic_m", false, [0.0; 4]);
        assert!(matches!(sc.uniforms[0].storage, Storage::Ubo { .. }));
        assert!(matches!(sc.uniforms[1].storage, Storage::PushConstant { .. }));
    }

    #[test]
    fn test_global_fallback_without_modern_features() {
        let (_, mut sc) = cache_with(BackendProfile::default());
        sc.uniform_f("a", 1.0);
        sc.uniform_mat3("m", [0.0; 9]);
        assert!(matches!(sc.uniforms[0].storage, Storage::Global));
        assert!(matches!(sc.uniforms[1].storage, Storage::Global));
    }

    #[test]
    fn test_binding_namespaces_are_independent() {
        let (_, mut sc) = cache_with(vulkan_class_profile());
        sc.uniform_texture("t0", TextureHandle(1), 2);
        sc.uniform_texture("t1", TextureHandle(2), 2);
        let buf = sc
            .backend()
            .create_buffer(BufferKind::Storage, 64)
            .unwrap();
        sc.ssbo("stats", buf, "uint frame_max;");
        sc.uniform_image("out_img", TextureHandle(3), opal_core::TextureFormat::Rgba16F);
        let bindings: Vec<Storage> = sc.uniforms.iter().map(|u| u.storage).collect();
        assert_eq!(bindings[0], Storage::Binding(0));
        assert_eq!(bindings[1], Storage::Binding(1));
        // Buffers and images count in their own namespaces.
        assert_eq!(bindings[2], Storage::Binding(0));
        assert_eq!(bindings[3], Storage::Binding(0));
    }

    #[test]
    fn test_redeclaration_replaces_value() {
        let (_, mut sc) = cache_with(vulkan_class_profile());
        sc.uniform_f("x", 1.0);
        sc.uniform_f("x", 2.0);
        assert_eq!(sc.uniforms.len(), 1);
        assert_eq!(sc.uniforms[0].value, UniformValue::Float(2.0));
    }

    #[test]
    fn test_error_latch_makes_dispatch_noop() {
        let backend = Arc::new(NullBackend::failing_compiles(vulkan_class_profile()));
        let mut sc = ShaderCache::new(backend.clone());

        let info = draw_body(&mut sc, "color.r = 1.0;");
        assert!(!info.ran);
        assert!(sc.error_state());

        // Latched: nothing compiles or runs, but the session is still reset.
        let info = draw_body(&mut sc, "color.g = 1.0;");
        assert!(!info.ran);
        assert_eq!(backend.run_count(), 0);

        sc.clear_error_state();
        assert!(!sc.error_state());
    }

    #[test]
    fn test_dead_entry_relatches_error() {
        let backend = Arc::new(NullBackend::failing_compiles(vulkan_class_profile()));
        let mut sc = ShaderCache::new(backend.clone());

        draw_body(&mut sc, "color.r = 1.0;");
        assert!(sc.error_state());
        sc.clear_error_state();

        // The same source hits the cached dead entry; the failure must come
        // back even though nothing recompiles.
        let info = draw_body(&mut sc, "color.r = 1.0;");
        assert!(!info.ran);
        assert!(sc.error_state());
        assert_eq!(backend.run_count(), 0);
    }

    #[test]
    fn test_ubo_updates_only_on_changed_values() {
        // Profile without push constants or globals: everything lands in
        // the UBO.
        let mut profile = vulkan_class_profile();
        profile.caps.remove(BackendCaps::PUSH_CONSTANTS);
        profile.caps.remove(BackendCaps::GLOBAL_UNIFORMS);
        profile.max_pushc_size = 0;
        let (backend, mut sc) = cache_with(profile);

        sc.uniform_f("v", 1.0);
        draw_body(&mut sc, "color.r = v;");
        let updates_first = backend.buffer_update_count();
        assert!(updates_first > 0);

        // Same value: byte-compare suppresses the push.
        sc.uniform_f("v", 1.0);
        draw_body(&mut sc, "color.r = v;");
        assert_eq!(backend.buffer_update_count(), updates_first);

        // Changed value: pushed again.
        sc.uniform_f("v", 2.0);
        draw_body(&mut sc, "color.r = v;");
        assert_eq!(backend.buffer_update_count(), updates_first + 1);
    }

    #[test]
    fn test_disk_cache_persist_and_hydrate() {
        let dir = tempfile::tempdir().unwrap();

        let (_, mut sc) = cache_with(vulkan_class_profile());
        sc.set_cache_dir(dir.path());
        draw_body(&mut sc, "color.b = 0.5;");

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
        let data = std::fs::read(files[0].as_ref().unwrap().path()).unwrap();
        assert!(data.starts_with(CACHE_HEADER));

        // A fresh cache instance hydrates the blob from disk.
        let (backend2, mut sc2) = cache_with(vulkan_class_profile());
        sc2.set_cache_dir(dir.path());
        draw_body(&mut sc2, "color.b = 0.5;");
        let sources: Vec<_> = (1..100)
            .filter_map(|id| backend2.program_source(crate::backend::ProgramHandle(id)))
            .collect();
        assert!(sources.iter().any(|s| s.cached_blob.is_some()));
    }

    #[test]
    fn test_stale_cache_header_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut sc) = cache_with(vulkan_class_profile());
        sc.set_cache_dir(dir.path());

        // Poison the would-be cache file with a wrong header.
        sc.add("color.g = 0.25;");
        let target = sc
            .backend()
            .create_texture(&opal_core::TextureDesc::target(
                4,
                4,
                opal_core::TextureFormat::Rgba8,
            ))
            .unwrap();
        let vao = [VertexAttrib {
            name: "position".into(),
            dim: 2,
        }];
        let (_, hash) = sc.assemble(Some(opal_core::TextureFormat::Rgba8), &vao);
        sc.reset();
        std::fs::write(dir.path().join(hash.to_hex()), b"bogus header\nxxxx").unwrap();

        // Dispatch still succeeds by compiling from source.
        let info = draw_body(&mut sc, "color.g = 0.25;");
        assert!(info.ran);
        assert!(!sc.error_state());
        let _ = target;
    }

    #[test]
    #[should_panic(expected = "reset")]
    fn test_add_after_generate_panics() {
        let (_, mut sc) = cache_with(vulkan_class_profile());
        sc.add("color.r = 1.0;");
        // generate without dispatch leaves needs_reset set
        let _ = sc.generate(None, &[]);
        sc.add("color.g = 1.0;");
    }
}
