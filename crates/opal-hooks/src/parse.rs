//! Parser for user shader files.
//!
//! A file is a sequence of blocks. Each block opens with a run of `//!`
//! header lines and is followed by its body: GLSL text for hook passes,
//! hex-encoded texel data for texture blocks. The first header line
//! determines the block kind (`//!HOOK` or `//!TEXTURE`).

use opal_core::{OpalError, OpalResult, TextureFormat};
use tracing::debug;

use crate::szexpr::SzExpr;

/// Most hook points one pass may attach to.
pub const SHADER_MAX_HOOKS: usize = 16;
/// Most textures one pass may bind.
pub const SHADER_MAX_BINDS: usize = 16;

/// Workgroup geometry of a compute hook pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeSize {
    /// Output block computed per workgroup.
    pub block_w: u32,
    pub block_h: u32,
    /// Threads per workgroup; defaults to the block size.
    pub threads_w: u32,
    pub threads_h: u32,
}

/// One hook pass parsed from a user shader.
#[derive(Debug, Clone, PartialEq)]
pub struct HookBlock {
    /// Hook points this pass attaches to.
    pub hook_points: Vec<String>,
    /// Textures bound for sampling, in declaration order. "HOOKED" refers
    /// to the texture being hooked.
    pub binds: Vec<String>,
    /// Name the result is saved under; None overwrites the hooked texture.
    pub save: Option<String>,
    pub desc: String,
    /// Texel-space offset of the output, or alignment to the reference.
    pub offset: [f32; 2],
    pub align_offset: bool,
    pub width: Option<SzExpr>,
    pub height: Option<SzExpr>,
    /// Condition; the pass is skipped when it evaluates to zero.
    pub when: Option<SzExpr>,
    pub components: Option<u8>,
    pub compute: Option<ComputeSize>,
    /// Raw GLSL body defining `vec4 hook()`.
    pub body: String,
}

impl Default for HookBlock {
    fn default() -> Self {
        Self {
            hook_points: Vec::new(),
            binds: Vec::new(),
            save: None,
            desc: String::new(),
            offset: [0.0, 0.0],
            align_offset: false,
            width: None,
            height: None,
            when: None,
            components: None,
            compute: None,
            body: String::new(),
        }
    }
}

/// Texture edge behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BorderMode {
    #[default]
    Clamp,
    Repeat,
    Mirror,
}

/// One embedded texture parsed from a user shader.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureBlock {
    pub name: String,
    pub w: u32,
    pub h: u32,
    pub d: u32,
    pub format: TextureFormat,
    pub linear_filter: bool,
    pub border: BorderMode,
    /// Usable as a storage image.
    pub storage: bool,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Hook(HookBlock),
    Texture(TextureBlock),
}

fn valid_ident(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_format(name: &str) -> Option<TextureFormat> {
    let f = match name {
        "r8" => TextureFormat::R8,
        "rg8" => TextureFormat::Rg8,
        "rgba8" => TextureFormat::Rgba8,
        "r16" => TextureFormat::R16,
        "rg16" => TextureFormat::Rg16,
        "rgba16" => TextureFormat::Rgba16,
        "r16f" => TextureFormat::R16F,
        "rgba16f" => TextureFormat::Rgba16F,
        "r32f" => TextureFormat::R32F,
        "rgba32f" => TextureFormat::Rgba32F,
        _ => return None,
    };
    Some(f)
}

struct Parser<'a> {
    lines: Vec<&'a str>,
    pos: usize,
    file: &'a str,
}

impl<'a> Parser<'a> {
    fn err(&self, message: impl Into<String>) -> OpalError {
        OpalError::hook_parse(message, self.file, self.pos)
    }

    // Line numbers in errors are 1-based.
    fn peek(&self) -> Option<&'a str> {
        self.lines.get(self.pos).copied()
    }

    fn parse_hook_block(&mut self) -> OpalResult<HookBlock> {
        let mut hook = HookBlock::default();

        while let Some(line) = self.peek() {
            let Some(rest) = line.strip_prefix("//!") else {
                break;
            };
            self.pos += 1;
            let (directive, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            let args = args.trim();
            match directive {
                "HOOK" => {
                    if !valid_ident(args) {
                        return Err(self.err(format!("invalid hook point '{}'", args)));
                    }
                    if hook.hook_points.len() == SHADER_MAX_HOOKS {
                        return Err(self.err("too many hook points"));
                    }
                    hook.hook_points.push(args.to_string());
                }
                "BIND" => {
                    if !valid_ident(args) {
                        return Err(self.err(format!("invalid bind name '{}'", args)));
                    }
                    if hook.binds.len() == SHADER_MAX_BINDS {
                        return Err(self.err("too many binds"));
                    }
                    hook.binds.push(args.to_string());
                }
                "SAVE" => {
                    if !valid_ident(args) {
                        return Err(self.err(format!("invalid save name '{}'", args)));
                    }
                    hook.save = Some(args.to_string());
                }
                "DESC" => hook.desc = args.to_string(),
                "OFFSET" => {
                    if args.eq_ignore_ascii_case("align") {
                        hook.align_offset = true;
                    } else {
                        let mut it = args.split_ascii_whitespace();
                        let x = it.next().and_then(|v| v.parse::<f32>().ok());
                        let y = it.next().and_then(|v| v.parse::<f32>().ok());
                        let (Some(x), Some(y)) = (x, y) else {
                            return Err(self.err("OFFSET wants two floats or 'align'"));
                        };
                        hook.offset = [x, y];
                    }
                }
                "WIDTH" => {
                    hook.width = Some(self.parse_expr(args, "WIDTH")?);
                }
                "HEIGHT" => {
                    hook.height = Some(self.parse_expr(args, "HEIGHT")?);
                }
                "WHEN" => {
                    hook.when = Some(self.parse_expr(args, "WHEN")?);
                }
                "COMPONENTS" => {
                    let n = args.parse::<u8>().ok().filter(|n| (1..=4).contains(n));
                    let Some(n) = n else {
                        return Err(self.err("COMPONENTS wants an integer in 1..=4"));
                    };
                    hook.components = Some(n);
                }
                "COMPUTE" => {
                    let nums: Vec<u32> = args
                        .split_ascii_whitespace()
                        .map(|v| v.parse::<u32>())
                        .collect::<Result<_, _>>()
                        .map_err(|_| self.err("COMPUTE wants integers"))?;
                    let cs = match nums.as_slice() {
                        [bw, bh] => ComputeSize {
                            block_w: *bw,
                            block_h: *bh,
                            threads_w: *bw,
                            threads_h: *bh,
                        },
                        [bw, bh, tw, th] => ComputeSize {
                            block_w: *bw,
                            block_h: *bh,
                            threads_w: *tw,
                            threads_h: *th,
                        },
                        _ => return Err(self.err("COMPUTE wants 'bw bh [tw th]'")),
                    };
                    hook.compute = Some(cs);
                }
                _ => return Err(self.err(format!("unknown hook directive '{}'", directive))),
            }
        }

        if hook.hook_points.is_empty() {
            return Err(self.err("hook pass with no HOOK directive"));
        }

        hook.body = self.take_body();
        if hook.body.trim().is_empty() {
            return Err(self.err("hook pass with an empty body"));
        }
        Ok(hook)
    }

    fn parse_expr(&self, args: &str, what: &str) -> OpalResult<SzExpr> {
        SzExpr::parse(args)
            .map_err(|e| self.err(format!("bad {} expression: {}", what, e)))
    }

    fn parse_texture_block(&mut self) -> OpalResult<TextureBlock> {
        let mut name = None;
        let mut size: Option<(u32, u32, u32)> = None;
        let mut format = None;
        let mut linear_filter = false;
        let mut border = BorderMode::default();
        let mut storage = false;

        while let Some(line) = self.peek() {
            let Some(rest) = line.strip_prefix("//!") else {
                break;
            };
            self.pos += 1;
            let (directive, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            let args = args.trim();
            match directive {
                "TEXTURE" => {
                    if !valid_ident(args) {
                        return Err(self.err(format!("invalid texture name '{}'", args)));
                    }
                    name = Some(args.to_string());
                }
                "SIZE" => {
                    let nums: Vec<u32> = args
                        .split_ascii_whitespace()
                        .map(|v| v.parse::<u32>())
                        .collect::<Result<_, _>>()
                        .map_err(|_| self.err("SIZE wants integers"))?;
                    size = Some(match nums.as_slice() {
                        [w] => (*w, 1, 1),
                        [w, h] => (*w, *h, 1),
                        [w, h, d] => (*w, *h, *d),
                        _ => return Err(self.err("SIZE wants 1 to 3 integers")),
                    });
                    if let Some((w, h, d)) = size {
                        if w == 0 || h == 0 || d == 0 {
                            return Err(self.err("SIZE dimensions must be nonzero"));
                        }
                    }
                }
                "FORMAT" => {
                    format = Some(parse_format(args).ok_or_else(|| {
                        self.err(format!("unknown texture format '{}'", args))
                    })?);
                }
                "FILTER" => match args {
                    "LINEAR" => linear_filter = true,
                    "NEAREST" => linear_filter = false,
                    _ => return Err(self.err(format!("unknown filter '{}'", args))),
                },
                "BORDER" => {
                    border = match args {
                        "CLAMP" => BorderMode::Clamp,
                        "REPEAT" => BorderMode::Repeat,
                        "MIRROR" => BorderMode::Mirror,
                        _ => return Err(self.err(format!("unknown border mode '{}'", args))),
                    };
                }
                "STORAGE" => storage = true,
                _ => return Err(self.err(format!("unknown texture directive '{}'", directive))),
            }
        }

        let name = name.ok_or_else(|| self.err("texture block with no TEXTURE name"))?;
        let (w, h, d) = size.ok_or_else(|| self.err("texture block with no SIZE"))?;
        let format = format.ok_or_else(|| self.err("texture block with no FORMAT"))?;

        let hex: String = self
            .take_body()
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        let data = decode_hex(&hex).map_err(|m| self.err(m))?;
        let expected = w as usize * h as usize * d as usize * format.pixel_size();
        if data.len() != expected {
            return Err(self.err(format!(
                "texture '{}' has {} bytes of data, needs exactly {}",
                name,
                data.len(),
                expected
            )));
        }

        Ok(TextureBlock {
            name,
            w,
            h,
            d,
            format,
            linear_filter,
            border,
            storage,
            data,
        })
    }

    /// Everything up to the next header line (or EOF) is the body.
    fn take_body(&mut self) -> String {
        let mut body = String::new();
        while let Some(line) = self.peek() {
            if line.starts_with("//!") {
                break;
            }
            self.pos += 1;
            body.push_str(line);
            body.push('\n');
        }
        body
    }
}

fn decode_hex(hex: &str) -> Result<Vec<u8>, String> {
    if hex.len() % 2 != 0 {
        return Err("odd number of hex digits in texture data".into());
    }
    let mut out = Vec::with_capacity(hex.len() / 2);
    let bytes = hex.as_bytes();
    for pair in bytes.chunks_exact(2) {
        let hi = (pair[0] as char).to_digit(16);
        let lo = (pair[1] as char).to_digit(16);
        let (Some(hi), Some(lo)) = (hi, lo) else {
            return Err("invalid hex digit in texture data".into());
        };
        out.push((hi * 16 + lo) as u8);
    }
    Ok(out)
}

/// Parse a whole user shader file into its blocks, preserving declaration
/// order. `file` is used for error reporting only.
pub fn parse_user_shader(source: &str, file: &str) -> OpalResult<Vec<Block>> {
    let mut p = Parser {
        lines: source.lines().collect(),
        pos: 0,
        file,
    };
    let mut blocks = Vec::new();

    while let Some(line) = p.peek() {
        if line.trim().is_empty() && blocks.is_empty() {
            p.pos += 1;
            continue;
        }
        if !line.starts_with("//!") {
            return Err(p.err("text outside of a block"));
        }
        let block = if line.starts_with("//!HOOK") {
            Block::Hook(p.parse_hook_block()?)
        } else if line.starts_with("//!TEXTURE") {
            Block::Texture(p.parse_texture_block()?)
        } else {
            return Err(p.err("a block must start with //!HOOK or //!TEXTURE"));
        };
        blocks.push(block);
    }

    debug!(file, blocks = blocks.len(), "parsed user shader");
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_pass_with_all_directives() {
        let src = "\
//!HOOK LUMA
//!BIND HOOKED
//!SAVE SHARP
//!DESC adaptive sharpen
//!WIDTH HOOKED.w 2 *
//!HEIGHT HOOKED.h 2 *
//!WHEN OUTPUT.w HOOKED.w >
//!COMPONENTS 1
//!OFFSET -0.5 -0.5
vec4 hook() {
    return HOOKED_tex(HOOKED_pos);
}
";
        let blocks = parse_user_shader(src, "sharp.hook").unwrap();
        assert_eq!(blocks.len(), 1);
        let Block::Hook(h) = &blocks[0] else {
            panic!("expected hook block");
        };
        assert_eq!(h.hook_points, ["LUMA"]);
        assert_eq!(h.binds, ["HOOKED"]);
        assert_eq!(h.save.as_deref(), Some("SHARP"));
        assert_eq!(h.desc, "adaptive sharpen");
        assert_eq!(h.offset, [-0.5, -0.5]);
        assert_eq!(h.components, Some(1));
        assert!(h.width.is_some() && h.height.is_some() && h.when.is_some());
        assert!(h.body.contains("vec4 hook()"));
    }

    #[test]
    fn test_save_then_bind_chain_keeps_order() {
        // First pass saves FOO off MAIN, second pass binds it again.
        let src = "\
//!HOOK MAIN
//!BIND HOOKED
//!SAVE FOO
vec4 hook() { return HOOKED_tex(HOOKED_pos) * 0.5; }

//!HOOK MAIN
//!BIND HOOKED
//!BIND FOO
vec4 hook() { return HOOKED_tex(HOOKED_pos) + FOO_tex(FOO_pos); }
";
        let blocks = parse_user_shader(src, "chain.hook").unwrap();
        assert_eq!(blocks.len(), 2);
        let Block::Hook(first) = &blocks[0] else {
            panic!()
        };
        let Block::Hook(second) = &blocks[1] else {
            panic!()
        };
        assert_eq!(first.save.as_deref(), Some("FOO"));
        assert_eq!(first.hook_points, ["MAIN"]);
        assert_eq!(second.save, None);
        assert_eq!(second.binds, ["HOOKED", "FOO"]);
    }

    #[test]
    fn test_multiple_hook_points() {
        let src = "\
//!HOOK LUMA
//!HOOK CHROMA
//!BIND HOOKED
vec4 hook() { return HOOKED_tex(HOOKED_pos); }
";
        let blocks = parse_user_shader(src, "multi.hook").unwrap();
        let Block::Hook(h) = &blocks[0] else { panic!() };
        assert_eq!(h.hook_points, ["LUMA", "CHROMA"]);
    }

    #[test]
    fn test_compute_directive() {
        let src = "\
//!HOOK MAIN
//!COMPUTE 32 8 32 16
void hook() { }
";
        let blocks = parse_user_shader(src, "c.hook").unwrap();
        let Block::Hook(h) = &blocks[0] else { panic!() };
        assert_eq!(
            h.compute,
            Some(ComputeSize {
                block_w: 32,
                block_h: 8,
                threads_w: 32,
                threads_h: 16,
            })
        );

        let src = "\
//!HOOK MAIN
//!COMPUTE 16 16
void hook() { }
";
        let blocks = parse_user_shader(src, "c.hook").unwrap();
        let Block::Hook(h) = &blocks[0] else { panic!() };
        let cs = h.compute.unwrap();
        assert_eq!((cs.threads_w, cs.threads_h), (16, 16));
    }

    #[test]
    fn test_texture_block_roundtrip() {
        let src = "\
//!TEXTURE NOISE
//!SIZE 2 2
//!FORMAT r8
//!FILTER NEAREST
//!BORDER REPEAT
00ff
7f01
";
        let blocks = parse_user_shader(src, "tex.hook").unwrap();
        let Block::Texture(t) = &blocks[0] else {
            panic!("expected texture block")
        };
        assert_eq!(t.name, "NOISE");
        assert_eq!((t.w, t.h, t.d), (2, 2, 1));
        assert_eq!(t.format, TextureFormat::R8);
        assert!(!t.linear_filter);
        assert_eq!(t.border, BorderMode::Repeat);
        assert_eq!(t.data, [0x00, 0xff, 0x7f, 0x01]);
    }

    #[test]
    fn test_texture_data_length_must_match_exactly() {
        let src = "\
//!TEXTURE T
//!SIZE 2 2
//!FORMAT r8
00ff7f
";
        let err = parse_user_shader(src, "bad.hook").unwrap_err();
        assert!(err.to_string().contains("needs exactly 4"));
    }

    #[test]
    fn test_unknown_directive_is_an_error() {
        let src = "\
//!HOOK MAIN
//!FROBNICATE yes
void hook() { }
";
        let err = parse_user_shader(src, "bad.hook").unwrap_err();
        assert!(matches!(err, OpalError::HookParse { line: 2, .. }));
    }

    #[test]
    fn test_missing_hook_point_is_an_error() {
        let src = "\
//!TEXTURE T
//!SIZE 1
//!FORMAT r8
00
//!BIND HOOKED
void hook() { }
";
        // The second block starts with BIND, which is not a valid opener.
        let err = parse_user_shader(src, "bad.hook").unwrap_err();
        assert!(err.to_string().contains("//!HOOK or //!TEXTURE"));
    }

    #[test]
    fn test_empty_body_is_an_error() {
        let src = "//!HOOK MAIN\n//!BIND HOOKED\n";
        assert!(parse_user_shader(src, "bad.hook").is_err());
    }

    #[test]
    fn test_offset_align() {
        let src = "\
//!HOOK CHROMA
//!OFFSET align
void hook() { }
";
        let blocks = parse_user_shader(src, "a.hook").unwrap();
        let Block::Hook(h) = &blocks[0] else { panic!() };
        assert!(h.align_offset);
    }
}
