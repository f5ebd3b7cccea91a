//! Content hashing for shader program identity.
//!
//! Produces a SHA-256 hash over generated shader text (and anything else
//! that contributes to program identity), used as the compiled-program
//! cache key and as the disk-cache file name.

use sha2::{Digest, Sha256};

/// A content hash digest (SHA-256, 32 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash {
    bytes: [u8; 32],
}

impl ContentHash {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// Get the hash as a hex string.
    pub fn to_hex(&self) -> String {
        self.bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Incremental hasher producing a [`ContentHash`].
#[derive(Default)]
pub struct ContentHasher {
    inner: Sha256,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: impl AsRef<[u8]>) {
        self.inner.update(data.as_ref());
    }

    pub fn finalize(self) -> ContentHash {
        let result = self.inner.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&result);
        ContentHash::from_bytes(bytes)
    }
}

/// Compute the content hash of a byte slice in one call.
pub fn hash_bytes(data: impl AsRef<[u8]>) -> ContentHash {
    let mut hasher = ContentHasher::new();
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        assert_eq!(hash_bytes("void main() {}"), hash_bytes("void main() {}"));
    }

    #[test]
    fn test_hash_different_content() {
        assert_ne!(hash_bytes("a"), hash_bytes("b"));
    }

    #[test]
    fn test_hash_hex_format() {
        let hex = hash_bytes("x").to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let mut h = ContentHasher::new();
        h.update("hello ");
        h.update("world");
        assert_eq!(h.finalize(), hash_bytes("hello world"));
    }
}
