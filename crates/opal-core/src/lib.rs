//! # opal-core
//!
//! Core types and primitives for the Opal video renderer.
//! This crate contains foundational types shared across all Opal crates:
//! colorspace descriptions, backend capability profiles, texture and image
//! descriptors, content hashing, render options, and error types.

pub mod caps;
pub mod color;
pub mod error;
pub mod hash;
pub mod image;
pub mod options;

pub use caps::{BackendCaps, BackendProfile};
pub use color::{
    gamut_matrix, luma_coefficients, yuv_to_rgb_matrix, ColorDescription, Colorspace, Levels,
    Light, Mat3, Mat3x4, Primaries, Transfer, REF_WHITE,
};
pub use error::{OpalError, OpalResult};
pub use hash::{hash_bytes, ContentHash};
pub use image::{ImageView, PlaneType, TextureDesc, TextureFormat, TextureHandle, Transform2x2};
pub use options::RenderOptions;
