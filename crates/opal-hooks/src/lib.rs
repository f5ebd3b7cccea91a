//! # opal-hooks
//!
//! User shader support: parsing of `//!`-directive hook files into hook
//! passes and embedded textures, plus the RPN size expressions used by
//! their WIDTH/HEIGHT/WHEN directives. Executing the parsed hooks is the
//! renderer's job; this crate only understands the format.

pub mod parse;
pub mod szexpr;

pub use parse::{
    parse_user_shader, Block, BorderMode, ComputeSize, HookBlock, TextureBlock,
    SHADER_MAX_BINDS, SHADER_MAX_HOOKS,
};
pub use szexpr::{Axis, SzExpr};
