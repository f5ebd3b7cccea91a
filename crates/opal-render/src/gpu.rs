//! wgpu implementation of the backend seam, plus the texture pool the
//! pipeline recycles intermediates through.
//!
//! The generated GLSL 450 goes through `wgpu::ShaderSource::Glsl` (naga's
//! GLSL frontend). The profile deliberately advertises neither push
//! constants nor plain global uniforms: every parameter block then takes the
//! UBO path, which lets pipelines use wgpu's automatic bind group layouts.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use opal_core::{
    BackendCaps, BackendProfile, OpalError, OpalResult, TextureDesc, TextureFormat, TextureHandle,
};
use opal_shader::{
    Backend, BoundValue, BufferHandle, BufferKind, CompiledProgram, PassKind, PassRun,
    ProgramHandle, ShaderSource, VertexAttrib,
};
use tracing::{debug, info, warn};
use wgpu::util::DeviceExt;

/// Combined GLSL samplers split into a texture and a sampler binding; the
/// sampler lands this far above its texture's slot.
const SAMPLER_BINDING_OFFSET: u32 = 16;

/// Pool of recycled GPU textures keyed by their full descriptor.
///
/// Intermediate pass targets have a handful of recurring shapes per
/// configuration, so exact-descriptor matching hits almost always.
pub struct TexturePool {
    backend: Arc<dyn Backend>,
    free: DashMap<TextureDesc, Vec<TextureHandle>>,
}

impl TexturePool {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            free: DashMap::new(),
        }
    }

    /// Reuse a free texture with this exact descriptor or create one.
    pub fn acquire(&self, desc: &TextureDesc) -> OpalResult<TextureHandle> {
        if let Some(mut list) = self.free.get_mut(desc) {
            if let Some(tex) = list.pop() {
                return Ok(tex);
            }
        }
        self.backend.create_texture(desc)
    }

    /// Return a texture to the pool for later reuse.
    pub fn release(&self, desc: &TextureDesc, tex: TextureHandle) {
        self.free.entry(*desc).or_default().push(tex);
    }

    /// Destroy everything pooled, e.g. on reconfiguration.
    pub fn clear(&self) {
        for mut entry in self.free.iter_mut() {
            for tex in entry.value_mut().drain(..) {
                self.backend.destroy_texture(tex);
            }
        }
        self.free.clear();
    }
}

impl Drop for TexturePool {
    fn drop(&mut self) {
        self.clear();
    }
}

struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    sampler: wgpu::Sampler,
    desc: TextureDesc,
}

struct GpuProgram {
    kind: PassKind,
    vertex: Option<wgpu::ShaderModule>,
    fragment: Option<wgpu::ShaderModule>,
    compute: Option<wgpu::ComputePipeline>,
    /// Raster pipelines are specialized on the target format, which is only
    /// known at run time.
    raster: Mutex<HashMap<wgpu::TextureFormat, wgpu::RenderPipeline>>,
    vertex_stride: u64,
    vertex_attributes: Vec<wgpu::VertexAttribute>,
}

/// A wgpu device with handle maps for every backend object.
pub struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    profile: BackendProfile,
    has_16bit_norm: bool,
    next_id: AtomicU64,
    textures: DashMap<u64, GpuTexture>,
    buffers: DashMap<u64, wgpu::Buffer>,
    programs: DashMap<u64, GpuProgram>,
}

impl GpuContext {
    /// Bring up a headless high-performance device.
    pub fn init() -> OpalResult<Arc<GpuContext>> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| OpalError::Capability("no suitable GPU adapter".into()))?;

        let wanted = wgpu::Features::TEXTURE_FORMAT_16BIT_NORM | wgpu::Features::FLOAT32_FILTERABLE;
        let features = adapter.features() & wanted;
        let limits = adapter.limits();
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("opal device"),
                required_features: features,
                required_limits: limits.clone(),
            },
            None,
        ))
        .map_err(|e| OpalError::Capability(format!("device request failed: {}", e)))?;

        let info = adapter.get_info();
        info!(name = %info.name, backend = ?info.backend, "GPU context initialized");

        let mut caps = BackendCaps::default();
        for c in [
            BackendCaps::COMPUTE,
            BackendCaps::BUF_RO,
            BackendCaps::BUF_RW,
            BackendCaps::GATHER,
            BackendCaps::FRAGCOORD,
            BackendCaps::TEX_3D,
            BackendCaps::BLIT,
            BackendCaps::NUM_GROUPS,
        ] {
            caps.insert(c);
        }
        let profile = BackendProfile {
            name: format!("wgpu/{}", info.name),
            caps,
            glsl_version: 450,
            max_pushc_size: 0,
            max_shmem: limits.max_compute_workgroup_storage_size as usize,
            max_workgroup_threads: limits.max_compute_invocations_per_workgroup,
            max_texture_dim: limits.max_texture_dimension_2d,
            filterable_f16: true,
            tex_rg: true,
        };

        Ok(Arc::new(GpuContext {
            device,
            queue,
            profile,
            has_16bit_norm: features.contains(wgpu::Features::TEXTURE_FORMAT_16BIT_NORM),
            next_id: AtomicU64::new(1),
            textures: DashMap::new(),
            buffers: DashMap::new(),
            programs: DashMap::new(),
        }))
    }

    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn map_format(&self, format: TextureFormat) -> OpalResult<wgpu::TextureFormat> {
        let f = match format {
            TextureFormat::R8 => wgpu::TextureFormat::R8Unorm,
            TextureFormat::Rg8 => wgpu::TextureFormat::Rg8Unorm,
            TextureFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
            TextureFormat::R16F => wgpu::TextureFormat::R16Float,
            TextureFormat::Rgba16F => wgpu::TextureFormat::Rgba16Float,
            TextureFormat::R32F => wgpu::TextureFormat::R32Float,
            TextureFormat::Rgba32F => wgpu::TextureFormat::Rgba32Float,
            TextureFormat::R16 | TextureFormat::Rg16 | TextureFormat::Rgba16 => {
                if !self.has_16bit_norm {
                    return Err(OpalError::Unsupported(
                        "16-bit normalized texture formats".into(),
                    ));
                }
                match format {
                    TextureFormat::R16 => wgpu::TextureFormat::R16Unorm,
                    TextureFormat::Rg16 => wgpu::TextureFormat::Rg16Unorm,
                    _ => wgpu::TextureFormat::Rgba16Unorm,
                }
            }
        };
        Ok(f)
    }

    fn compile_module(
        &self,
        text: &str,
        stage: wgpu::naga::ShaderStage,
        label: &str,
    ) -> wgpu::ShaderModule {
        self.device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Glsl {
                    shader: Cow::Borrowed(text),
                    stage,
                    defines: wgpu::naga::FastHashMap::default(),
                },
            })
    }

    fn vertex_layout(attribs: &[VertexAttrib]) -> Vec<wgpu::VertexAttribute> {
        let mut out = Vec::with_capacity(attribs.len());
        let mut offset = 0u64;
        for (i, a) in attribs.iter().enumerate() {
            let format = match a.dim {
                1 => wgpu::VertexFormat::Float32,
                2 => wgpu::VertexFormat::Float32x2,
                3 => wgpu::VertexFormat::Float32x3,
                _ => wgpu::VertexFormat::Float32x4,
            };
            out.push(wgpu::VertexAttribute {
                format,
                offset,
                shader_location: i as u32,
            });
            offset += a.dim as u64 * 4;
        }
        out
    }

    fn raster_pipeline(
        &self,
        program: &GpuProgram,
        format: wgpu::TextureFormat,
    ) -> OpalResult<()> {
        let mut pipelines = program
            .raster
            .lock()
            .map_err(|_| OpalError::Other("pipeline map poisoned".into()))?;
        if pipelines.contains_key(&format) {
            return Ok(());
        }
        let (Some(vs), Some(fs)) = (&program.vertex, &program.fragment) else {
            return Err(OpalError::Compile("raster program missing a stage".into()));
        };
        let pipeline = self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("opal raster pass"),
                layout: None,
                vertex: wgpu::VertexState {
                    module: vs,
                    entry_point: "main",
                    compilation_options: Default::default(),
                    buffers: &[wgpu::VertexBufferLayout {
                        array_stride: program.vertex_stride,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &program.vertex_attributes,
                    }],
                },
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    ..Default::default()
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                fragment: Some(wgpu::FragmentState {
                    module: fs,
                    entry_point: "main",
                    compilation_options: Default::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                multiview: None,
            });
        pipelines.insert(format, pipeline);
        Ok(())
    }

    fn bind_group_entries<'a>(
        &self,
        values: &'a [BoundValue],
        texture_refs: &'a [(u32, dashmap::mapref::one::Ref<'a, u64, GpuTexture>, bool)],
        buffer_refs: &'a [(u32, dashmap::mapref::one::Ref<'a, u64, wgpu::Buffer>)],
    ) -> Vec<wgpu::BindGroupEntry<'a>> {
        let mut entries = Vec::new();
        for (binding, tex, sampled) in texture_refs {
            entries.push(wgpu::BindGroupEntry {
                binding: *binding,
                resource: wgpu::BindingResource::TextureView(&tex.view),
            });
            if *sampled {
                entries.push(wgpu::BindGroupEntry {
                    binding: *binding + SAMPLER_BINDING_OFFSET,
                    resource: wgpu::BindingResource::Sampler(&tex.sampler),
                });
            }
        }
        for (binding, buf) in buffer_refs {
            entries.push(wgpu::BindGroupEntry {
                binding: *binding,
                resource: buf.as_entire_binding(),
            });
        }
        for v in values {
            if let BoundValue::Global { name, .. } = v {
                // The profile never requests plain globals; reaching this
                // means a storage assignment bug upstream.
                warn!(name, "plain global uniform ignored by wgpu backend");
            }
        }
        entries
    }
}

impl Backend for GpuContext {
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
        let format = self.map_format(desc.format)?;
        let mut usage = wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_DST
            | wgpu::TextureUsages::COPY_SRC;
        if desc.render_target {
            usage |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        if desc.storage {
            usage |= wgpu::TextureUsages::STORAGE_BINDING;
        }
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: None,
            size: wgpu::Extent3d {
                width: desc.w,
                height: desc.h,
                depth_or_array_layers: desc.d,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: if desc.d > 1 {
                wgpu::TextureDimension::D3
            } else {
                wgpu::TextureDimension::D2
            },
            format,
            usage,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let filter = if desc.linear_filter {
            wgpu::FilterMode::Linear
        } else {
            wgpu::FilterMode::Nearest
        };
        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: None,
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: filter,
            min_filter: filter,
            ..Default::default()
        });

        let id = self.next();
        self.textures.insert(
            id,
            GpuTexture {
                texture,
                view,
                sampler,
                desc: *desc,
            },
        );
        Ok(TextureHandle(id))
    }

    fn upload_texture(&self, tex: TextureHandle, data: &[u8]) -> OpalResult<()> {
        let t = self
            .textures
            .get(&tex.0)
            .ok_or_else(|| OpalError::InvalidArgument("upload to unknown texture".into()))?;
        let desc = t.desc;
        if data.len() != desc.byte_size() {
            return Err(OpalError::InvalidArgument(format!(
                "upload of {} bytes into a {}-byte texture",
                data.len(),
                desc.byte_size()
            )));
        }
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &t.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(desc.w * desc.format.pixel_size() as u32),
                rows_per_image: Some(desc.h),
            },
            wgpu::Extent3d {
                width: desc.w,
                height: desc.h,
                depth_or_array_layers: desc.d,
            },
        );
        Ok(())
    }

    fn destroy_texture(&self, tex: TextureHandle) {
        if let Some((_, t)) = self.textures.remove(&tex.0) {
            t.texture.destroy();
        }
    }

    fn create_buffer(&self, kind: BufferKind, size: usize) -> OpalResult<BufferHandle> {
        let usage = match kind {
            BufferKind::Uniform => wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            BufferKind::Storage => {
                wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC
            }
        };
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: size as u64,
            usage,
            mapped_at_creation: false,
        });
        let id = self.next();
        self.buffers.insert(id, buffer);
        Ok(BufferHandle(id))
    }

    fn update_buffer(&self, buf: BufferHandle, offset: usize, data: &[u8]) -> OpalResult<()> {
        let b = self
            .buffers
            .get(&buf.0)
            .ok_or_else(|| OpalError::InvalidArgument("update of unknown buffer".into()))?;
        self.queue.write_buffer(&b, offset as u64, data);
        Ok(())
    }

    fn compile(&self, source: &ShaderSource) -> OpalResult<CompiledProgram> {
        let id = self.next();
        let program = match source.kind() {
            PassKind::Compute => {
                let text = source
                    .compute
                    .as_ref()
                    .ok_or_else(|| OpalError::Compile("compute source missing".into()))?;
                let module =
                    self.compile_module(text, wgpu::naga::ShaderStage::Compute, "opal compute");
                let pipeline =
                    self.device
                        .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                            label: Some("opal compute pass"),
                            layout: None,
                            module: &module,
                            entry_point: "main",
                            compilation_options: Default::default(),
                        });
                GpuProgram {
                    kind: PassKind::Compute,
                    vertex: None,
                    fragment: None,
                    compute: Some(pipeline),
                    raster: Mutex::new(HashMap::new()),
                    vertex_stride: 0,
                    vertex_attributes: Vec::new(),
                }
            }
            PassKind::Raster => {
                let vs = source
                    .vertex
                    .as_ref()
                    .ok_or_else(|| OpalError::Compile("vertex source missing".into()))?;
                let fs = source
                    .fragment
                    .as_ref()
                    .ok_or_else(|| OpalError::Compile("fragment source missing".into()))?;
                GpuProgram {
                    kind: PassKind::Raster,
                    vertex: Some(self.compile_module(
                        vs,
                        wgpu::naga::ShaderStage::Vertex,
                        "opal vertex",
                    )),
                    fragment: Some(self.compile_module(
                        fs,
                        wgpu::naga::ShaderStage::Fragment,
                        "opal fragment",
                    )),
                    compute: None,
                    raster: Mutex::new(HashMap::new()),
                    vertex_stride: source.vertex_stride as u64,
                    vertex_attributes: Self::vertex_layout(&source.vertex_attribs),
                }
            }
        };
        debug!(id, kind = ?source.kind(), "program compiled");
        self.programs.insert(id, program);
        // wgpu exposes no portable program binaries; the disk cache stays
        // cold on this backend.
        Ok(CompiledProgram {
            handle: ProgramHandle(id),
            binary: None,
        })
    }

    fn destroy_program(&self, program: ProgramHandle) {
        self.programs.remove(&program.0);
    }

    fn run(&self, run: &PassRun) -> OpalResult<()> {
        let program = self
            .programs
            .get(&run.program.0)
            .ok_or_else(|| OpalError::InvalidArgument("run of unknown program".into()))?;

        // Resolve handles up front so the borrow lives through the pass.
        let mut texture_refs = Vec::new();
        let mut buffer_refs = Vec::new();
        for v in run.values {
            match v {
                BoundValue::Texture { binding, tex } => {
                    let t = self.textures.get(&tex.0).ok_or_else(|| {
                        OpalError::InvalidArgument("bound texture is gone".into())
                    })?;
                    texture_refs.push((*binding, t, true));
                }
                BoundValue::Image { binding, tex } => {
                    let t = self.textures.get(&tex.0).ok_or_else(|| {
                        OpalError::InvalidArgument("bound image is gone".into())
                    })?;
                    texture_refs.push((*binding, t, false));
                }
                BoundValue::UniformBuffer { binding, buf }
                | BoundValue::StorageBuffer { binding, buf } => {
                    let b = self.buffers.get(&buf.0).ok_or_else(|| {
                        OpalError::InvalidArgument("bound buffer is gone".into())
                    })?;
                    buffer_refs.push((*binding, b));
                }
                BoundValue::Global { .. } => {}
            }
        }

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });

        match program.kind {
            PassKind::Compute => {
                let pipeline = program
                    .compute
                    .as_ref()
                    .ok_or_else(|| OpalError::Compile("compute pipeline missing".into()))?;
                let entries = self.bind_group_entries(run.values, &texture_refs, &buffer_refs);
                let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: None,
                    layout: &pipeline.get_bind_group_layout(0),
                    entries: &entries,
                });
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("opal compute"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                let [x, y, z] = run.compute_groups;
                pass.dispatch_workgroups(x, y, z);
                drop(pass);
            }
            PassKind::Raster => {
                let target = run.target.ok_or_else(|| {
                    OpalError::InvalidArgument("raster pass without a target".into())
                })?;
                let target_tex = self
                    .textures
                    .get(&target.0)
                    .ok_or_else(|| OpalError::InvalidArgument("target texture is gone".into()))?;
                let format = self.map_format(target_tex.desc.format)?;
                self.raster_pipeline(&program, format)?;
                let pipelines = program
                    .raster
                    .lock()
                    .map_err(|_| OpalError::Other("pipeline map poisoned".into()))?;
                let pipeline = &pipelines[&format];

                let entries = self.bind_group_entries(run.values, &texture_refs, &buffer_refs);
                let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: None,
                    layout: &pipeline.get_bind_group_layout(0),
                    entries: &entries,
                });
                let vbo = self
                    .device
                    .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: None,
                        contents: run.vertex_data,
                        usage: wgpu::BufferUsages::VERTEX,
                    });

                let load = if run.discard_target {
                    wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT)
                } else {
                    wgpu::LoadOp::Load
                };
                let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("opal raster"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: &target_tex.view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load,
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
                pass.set_pipeline(pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.set_vertex_buffer(0, vbo.slice(..));
                pass.draw(0..run.vertex_count as u32, 0..1);
                drop(pass);
            }
        }

        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn poll_timer(&self, _program: ProgramHandle) -> Option<u64> {
        // TODO: wire up timestamp queries when TIMESTAMP_QUERY is available.
        None
    }

    fn read_texture(&self, tex: TextureHandle) -> OpalResult<Vec<u8>> {
        let t = self
            .textures
            .get(&tex.0)
            .ok_or_else(|| OpalError::InvalidArgument("readback of unknown texture".into()))?;
        let desc = t.desc;
        let row = desc.w as usize * desc.format.pixel_size();
        // Copy rows must be 256-byte aligned.
        let padded = (row + 255) & !255;
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("opal readback"),
            size: (padded * desc.h as usize * desc.d as usize) as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &t.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded as u32),
                    rows_per_image: Some(desc.h),
                },
            },
            wgpu::Extent3d {
                width: desc.w,
                height: desc.h,
                depth_or_array_layers: desc.d,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let slice = buffer.slice(..);
        slice.map_async(wgpu::MapMode::Read, |_| {});
        self.device.poll(wgpu::Maintain::Wait);

        let mapped = slice.get_mapped_range();
        let mut out = Vec::with_capacity(desc.byte_size());
        for r in 0..(desc.h as usize * desc.d as usize) {
            out.extend_from_slice(&mapped[r * padded..r * padded + row]);
        }
        drop(mapped);
        buffer.unmap();
        Ok(out)
    }
}
