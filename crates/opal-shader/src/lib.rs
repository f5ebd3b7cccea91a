//! # opal-shader
//!
//! GLSL program generation for the Opal renderer: the shader builder
//! session and compiled-program cache, the backend abstraction it runs
//! against, uniform storage layout, and the reusable shader fragments for
//! color transforms and image scaling.

pub mod backend;
pub mod cache;
pub mod color;
pub mod scale;
pub mod uniforms;

pub use backend::{
    vulkan_class_profile, Backend, BoundValue, BufferHandle, BufferKind, CompiledProgram,
    NullBackend, PassKind, PassRun, ProgramHandle, ShaderSource, VertexAttrib,
};
pub use cache::{DispatchInfo, ShaderCache, SC_MAX_ENTRIES};
pub use scale::{is_fixed_scaler, Scaler};
pub use uniforms::{Storage, UniformValue};
