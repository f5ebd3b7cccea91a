//! # opal-kernels
//!
//! Scaling filter kernels: pure weight math used to build convolution LUTs
//! for the GPU scalers. No GPU types in here; the shader crate samples the
//! LUTs this crate computes.

pub mod kernel;
pub mod window;

pub use kernel::{lookup, lookup_window, Kernel, FILTER_SIZES, SCALER_LUT_SIZE, TSCALE_SIZES};
pub use window::Window;
