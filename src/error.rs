//! Error types for servir
//!
//! This module defines all error types used throughout the library.

use thiserror::Error;

/// Result type alias for servir operations
pub type Result<T> = std::result::Result<T, ServirError>;

/// Error type for all servir operations
#[derive(Error, Debug)]
pub enum ServirError {
    /// Invalid or missing configuration
    #[error("Configuration error: {reason}")]
    Config {
        /// Reason the configuration is invalid
        reason: String,
    },

    /// Request or file content could not be parsed
    #[error("Parse error: {reason}")]
    Parse {
        /// Reason the content is invalid
        reason: String,
    },

    /// A model file could not be opened or contained no usable data
    #[error("Model file error for '{path}': {reason}")]
    ModelFile {
        /// Path that failed to load
        path: String,
        /// Reason the load failed
        reason: String,
    },

    /// Model load or generation failure
    #[error("Model error: {reason}")]
    Model {
        /// Reason the model operation failed
        reason: String,
    },

    /// Tool dispatch or external tool transport failure
    ///
    /// Tool errors are normally folded into the JSON returned to the model
    /// and never propagate out of the generation loop; this variant exists
    /// for the transport layer underneath.
    #[error("Tool error: {reason}")]
    Tool {
        /// Reason the tool call failed
        reason: String,
    },

    /// Streaming sink write failure; aborts the request
    #[error("Stream error: {reason}")]
    Stream {
        /// Reason the stream broke
        reason: String,
    },

    /// Unexpected internal failure
    #[error("Internal error: {reason}")]
    Internal {
        /// Description of the unexpected condition
        reason: String,
    },
}

impl ServirError {
    /// HTTP status code matching this error kind
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Config { .. } | Self::Parse { .. } => 400,
            Self::ModelFile { .. }
            | Self::Model { .. }
            | Self::Tool { .. }
            | Self::Stream { .. }
            | Self::Internal { .. } => 500,
        }
    }
}
