//! Plain-text 3D LUT loader.
//!
//! Parses the common tabular format (`LUT_3D_SIZE n` followed by n^3
//! whitespace-separated RGB rows, red fastest) and uploads it as a 3D
//! texture. Parsed LUTs are cached as binary files keyed by the content
//! hash of the text, so large LUTs parse once.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use opal_core::{hash_bytes, OpalError, OpalResult, TextureDesc, TextureFormat, TextureHandle};
use opal_shader::{Backend, ShaderCache};
use tracing::{debug, warn};

const BIN_CACHE_HEADER: &[u8] = b"opal lut3d v1\n";
const MAX_LUT_SIZE: u32 = 256;

/// A parsed 3D LUT: `size`^3 RGBA entries, red index fastest.
#[derive(Debug, Clone, PartialEq)]
pub struct Lut3d {
    pub size: u32,
    /// RGBA rows; alpha is padding so the data uploads as rgba32f.
    pub data: Vec<f32>,
}

impl Lut3d {
    /// Parse the text form. Unknown keyword lines are skipped.
    pub fn parse(text: &str) -> OpalResult<Lut3d> {
        let mut size: Option<u32> = None;
        let mut data: Vec<f32> = Vec::new();

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_ascii_whitespace();
            let first = match fields.next() {
                Some(f) => f,
                None => continue,
            };
            if first == "LUT_3D_SIZE" {
                let n: u32 = fields
                    .next()
                    .and_then(|v| v.parse().ok())
                    .ok_or_else(|| {
                        OpalError::InvalidArgument(format!(
                            "lut3d line {}: bad LUT_3D_SIZE",
                            lineno + 1
                        ))
                    })?;
                if n < 2 || n > MAX_LUT_SIZE {
                    return Err(OpalError::InvalidArgument(format!(
                        "lut3d size {} out of range",
                        n
                    )));
                }
                size = Some(n);
                continue;
            }
            if first.parse::<f32>().is_err() {
                // Keyword line (TITLE, DOMAIN_MIN, ...) we do not interpret.
                continue;
            }
            let r: f32 = first.parse().map_err(|_| bad_row(lineno))?;
            let g: f32 = fields
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| bad_row(lineno))?;
            let b: f32 = fields
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| bad_row(lineno))?;
            if fields.next().is_some() {
                return Err(bad_row(lineno));
            }
            data.extend_from_slice(&[r, g, b, 1.0]);
        }

        let size = size.ok_or_else(|| {
            OpalError::InvalidArgument("lut3d: missing LUT_3D_SIZE".into())
        })?;
        let expect = size as usize * size as usize * size as usize * 4;
        if data.len() != expect {
            return Err(OpalError::InvalidArgument(format!(
                "lut3d: {} entries, expected {}",
                data.len() / 4,
                expect / 4
            )));
        }
        Ok(Lut3d { size, data })
    }

    /// Load from a file, going through the binary cache in `cache_dir` when
    /// one is set. Cache failures degrade to a plain parse.
    pub fn load(path: &Path, cache_dir: Option<&Path>) -> OpalResult<Lut3d> {
        let text = fs::read_to_string(path)?;
        let cache_file = cache_dir.map(|dir| {
            let mut p = PathBuf::from(dir);
            p.push(format!("{}.lut3d", hash_bytes(&text).to_hex()));
            p
        });

        if let Some(file) = &cache_file {
            if let Some(lut) = read_binary(file) {
                debug!(?file, "lut3d loaded from binary cache");
                return Ok(lut);
            }
        }

        let lut = Lut3d::parse(&text)?;
        if let Some(file) = &cache_file {
            if let Err(err) = write_binary(file, &lut) {
                warn!(?file, %err, "failed to write lut3d binary cache");
            }
        }
        Ok(lut)
    }

    /// Upload as a linearly filtered 3D texture.
    pub fn upload(&self, backend: &Arc<dyn Backend>) -> OpalResult<TextureHandle> {
        let desc = TextureDesc {
            w: self.size,
            h: self.size,
            d: self.size,
            format: TextureFormat::Rgba32F,
            render_target: false,
            storage: false,
            linear_filter: true,
        };
        let tex = backend.create_texture(&desc)?;
        let bytes: Vec<u8> = self.data.iter().flat_map(|v| v.to_le_bytes()).collect();
        backend.upload_texture(tex, &bytes)?;
        Ok(tex)
    }
}

fn bad_row(lineno: usize) -> OpalError {
    OpalError::InvalidArgument(format!("lut3d line {}: expected 3 floats", lineno + 1))
}

fn read_binary(file: &Path) -> Option<Lut3d> {
    let bytes = fs::read(file).ok()?;
    let body = bytes.strip_prefix(BIN_CACHE_HEADER)?;
    let (size_bytes, data_bytes) = body.split_first_chunk::<4>()?;
    let size = u32::from_le_bytes(*size_bytes);
    let expect = size as usize * size as usize * size as usize * 4;
    if data_bytes.len() != expect * 4 {
        return None;
    }
    let data = data_bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Some(Lut3d { size, data })
}

fn write_binary(file: &Path, lut: &Lut3d) -> std::io::Result<()> {
    let mut out = Vec::with_capacity(BIN_CACHE_HEADER.len() + 4 + lut.data.len() * 4);
    out.extend_from_slice(BIN_CACHE_HEADER);
    out.extend_from_slice(&lut.size.to_le_bytes());
    for v in &lut.data {
        out.extend_from_slice(&v.to_le_bytes());
    }
    fs::write(file, out)
}

/// Remap `color` through the LUT. The LUT is defined over [0,1], so the
/// input is clamped.
pub fn apply_lut3d(sc: &mut ShaderCache, tex: TextureHandle) {
    sc.add("// 3D LUT");
    sc.uniform_texture("lut_3d", tex, 3);
    sc.add("color.rgb = tex3D(lut_3d, clamp(color.rgb, 0.0, 1.0)).rgb;");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_text(n: u32) -> String {
        let mut s = format!("# identity\nTITLE \"id\"\nLUT_3D_SIZE {}\n", n);
        for b in 0..n {
            for g in 0..n {
                for r in 0..n {
                    let f = |v: u32| v as f32 / (n - 1) as f32;
                    s.push_str(&format!("{} {} {}\n", f(r), f(g), f(b)));
                }
            }
        }
        s
    }

    #[test]
    fn test_parse_identity() {
        let lut = Lut3d::parse(&identity_text(3)).unwrap();
        assert_eq!(lut.size, 3);
        assert_eq!(lut.data.len(), 27 * 4);
        // First entry is black, last is white.
        assert_eq!(&lut.data[0..3], &[0.0, 0.0, 0.0]);
        assert_eq!(&lut.data[26 * 4..26 * 4 + 3], &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_parse_rejects_wrong_entry_count() {
        let mut text = identity_text(3);
        text.push_str("0 0 0\n");
        assert!(Lut3d::parse(&text).is_err());
    }

    #[test]
    fn test_parse_rejects_missing_size() {
        assert!(Lut3d::parse("0 0 0\n").is_err());
    }

    #[test]
    fn test_binary_cache_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let lut_path = dir.path().join("test.cube");
        fs::write(&lut_path, identity_text(4)).unwrap();

        let first = Lut3d::load(&lut_path, Some(dir.path())).unwrap();
        // A cache file appeared and a second load agrees with the parse.
        let cached: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "lut3d"))
            .collect();
        assert_eq!(cached.len(), 1);
        let second = Lut3d::load(&lut_path, Some(dir.path())).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_stale_binary_cache_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let lut_path = dir.path().join("test.cube");
        fs::write(&lut_path, identity_text(2)).unwrap();
        let hex = hash_bytes(identity_text(2)).to_hex();
        fs::write(dir.path().join(format!("{}.lut3d", hex)), b"garbage").unwrap();
        // Bad cache contents fall back to the text parse.
        let lut = Lut3d::load(&lut_path, Some(dir.path())).unwrap();
        assert_eq!(lut.size, 2);
    }
}
