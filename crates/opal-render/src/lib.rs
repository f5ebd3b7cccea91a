//! # opal-render
//!
//! The top of the Opal stack: the multi-pass render pipeline that turns
//! decoded video frames into presented output, the texture pool and wgpu
//! backend it runs on, temporal interpolation, dithering, 3D LUTs and
//! per-pass timing.

pub mod dither;
pub mod gpu;
pub mod interpolate;
pub mod lut3d;
pub mod perf;
pub mod pipeline;

pub use gpu::{GpuContext, TexturePool};
pub use interpolate::{plan_mix, Surface, SurfaceRing, Validity, SURFACES_MAX};
pub use lut3d::Lut3d;
pub use perf::{PassStats, PerfTracker};
pub use pipeline::{
    FramePlane, FrameTiming, RenderResult, RenderTarget, Renderer, VideoFrame,
};
