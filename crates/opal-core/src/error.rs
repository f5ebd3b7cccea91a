/// Core error types for the Opal renderer.
use std::path::PathBuf;

/// A specialized Result type for Opal operations.
pub type OpalResult<T> = Result<T, OpalError>;

/// Top-level error type encompassing all Opal subsystems.
///
/// The variants follow the renderer's failure taxonomy: capability errors
/// are permanent configuration downgrades, allocation errors abort a single
/// frame, compile errors latch the shader cache, and hook/LUT parse errors
/// abort loading one file while leaving everything else intact.
#[derive(Debug, thiserror::Error)]
pub enum OpalError {
    #[error("missing backend capability: {0}")]
    Capability(String),

    #[error("resource allocation failed: {0}")]
    Allocation(String),

    #[error("shader compile error: {0}")]
    Compile(String),

    #[error("hook parse error: {message} at {file}:{line}")]
    HookParse {
        message: String,
        file: String,
        line: usize,
    },

    #[error("LUT error: {message} ({path:?})")]
    Lut { message: String, path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported feature: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(String),
}

impl OpalError {
    /// Create a hook parse error with source location.
    pub fn hook_parse(message: impl Into<String>, file: impl Into<String>, line: usize) -> Self {
        OpalError::HookParse {
            message: message.into(),
            file: file.into(),
            line,
        }
    }

    /// Create a LUT loading error.
    pub fn lut(message: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        OpalError::Lut {
            message: message.into(),
            path: path.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_parse_error_display() {
        let err = OpalError::hook_parse("unknown directive", "sharpen.hook", 12);
        assert_eq!(
            err.to_string(),
            "hook parse error: unknown directive at sharpen.hook:12"
        );
    }

    #[test]
    fn test_lut_error_display() {
        let err = OpalError::lut("truncated table", "/luts/film.cube");
        assert!(err.to_string().contains("truncated table"));
    }
}
