//! Custom error types for tryon.

use std::path::PathBuf;
use thiserror::Error;

/// Broad failure class, so callers can tell bad input from a broken install
/// or an exhausted device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Model assets are missing, unreadable or failed to download.
    Asset,
    /// The caller supplied an unusable image or parameter.
    Input,
    /// Inference itself failed (numerics, memory, shape contracts).
    Generation,
    /// Plain filesystem failure on a user-facing path.
    Io,
}

/// Main error type for the tryon library.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to load an image file.
    #[error("failed to load image from {path}: {source}")]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Failed to save an image file.
    #[error("failed to save image to {path}: {source}")]
    ImageSave {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Image is decodable but cannot be used.
    #[error("invalid {role} image ({width}x{height}): {reason}")]
    InvalidImage {
        role: &'static str,
        width: u32,
        height: u32,
        reason: String,
    },

    /// A required model file is not present.
    #[error("missing model asset {name} at {path}")]
    MissingAsset { name: String, path: PathBuf },

    /// An asset config file could not be parsed.
    #[error("invalid asset config {path}: {source}")]
    AssetConfig {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Failed to download a model.
    #[error("failed to download model {name}: {source}")]
    ModelDownload {
        name: String,
        #[source]
        source: reqwest::Error,
    },

    /// Failed to load an ONNX model.
    #[error("failed to load ONNX model {name}: {source}")]
    ModelLoad {
        name: String,
        #[source]
        source: ort::Error,
    },

    /// A loaded model does not expose the inputs/outputs the pipeline needs.
    #[error("model {name} has an unexpected interface: {detail}")]
    ModelInterface { name: String, detail: String },

    /// Failed to load a tokenizer definition.
    #[error("failed to load tokenizer {name}: {source}")]
    TokenizerLoad {
        name: String,
        #[source]
        source: tokenizers::Error,
    },

    /// Prompt tokenization failed.
    #[error("failed to tokenize prompt: {source}")]
    Tokenize {
        #[source]
        source: tokenizers::Error,
    },

    /// Model inference failed.
    #[error("model inference failed: {source}")]
    Inference {
        #[source]
        source: ort::Error,
    },

    /// Latents stopped being finite during denoising.
    #[error("numerical instability at denoising step {step}")]
    NumericalInstability { step: usize },

    /// Failed to create cache directory.
    #[error("failed to create cache directory {path}: {source}")]
    CacheDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Invalid parameter value.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Shape mismatch in tensor operations.
    #[error("tensor shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },
}

impl Error {
    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingAsset { .. }
            | Self::AssetConfig { .. }
            | Self::ModelDownload { .. }
            | Self::ModelLoad { .. }
            | Self::ModelInterface { .. }
            | Self::TokenizerLoad { .. }
            | Self::CacheDir { .. } => ErrorKind::Asset,
            Self::ImageLoad { .. } | Self::InvalidImage { .. } | Self::InvalidParameter { .. } => {
                ErrorKind::Input
            }
            Self::Tokenize { .. }
            | Self::Inference { .. }
            | Self::NumericalInstability { .. }
            | Self::ShapeMismatch { .. } => ErrorKind::Generation,
            Self::ImageSave { .. } | Self::Io(_) => ErrorKind::Io,
        }
    }

    pub(crate) fn invalid_parameter(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for tryon operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let missing = Error::MissingAsset {
            name: "unet".to_string(),
            path: PathBuf::from("/nowhere/unet.onnx"),
        };
        assert_eq!(missing.kind(), ErrorKind::Asset);

        let bad = Error::InvalidImage {
            role: "human",
            width: 0,
            height: 10,
            reason: "empty".to_string(),
        };
        assert_eq!(bad.kind(), ErrorKind::Input);

        assert_eq!(
            Error::NumericalInstability { step: 3 }.kind(),
            ErrorKind::Generation
        );
    }

    #[test]
    fn test_display_mentions_context() {
        let err = Error::invalid_parameter("denoising_steps", "must be greater than 0");
        assert_eq!(
            err.to_string(),
            "invalid parameter denoising_steps: must be greater than 0"
        );
    }
}
