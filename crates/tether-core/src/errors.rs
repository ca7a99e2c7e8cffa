//! Unified error type for tether operations
//!
//! Load failures never surface here: strategies swallow them and the caller's
//! default wins. What remains are explicit saves, required loads, and the
//! storage plumbing underneath the effect handlers.

use serde::{Deserialize, Serialize};

/// Unified error type for all tether operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum TetherError {
    /// A value could not be encoded for persistence
    #[error("Encoding error: {message}")]
    Encoding {
        /// Error message describing the encoding failure
        message: String,
    },

    /// Persisted bytes could not be decoded into the requested type
    #[error("Decoding error: {message}")]
    Decoding {
        /// Error message describing the decoding failure
        message: String,
    },

    /// The underlying store rejected a read or write
    #[error("Storage error: {message}")]
    Storage {
        /// Error message describing the storage failure
        message: String,
    },

    /// A required persisted value was absent
    #[error("Not found: {message}")]
    NotFound {
        /// Error message describing what was not found
        message: String,
    },

    /// A persistence identity was reused with a different value type
    #[error("Type mismatch: {message}")]
    TypeMismatch {
        /// Error message naming the conflicting identity
        message: String,
    },

    /// Configuration could not be loaded or failed validation
    #[error("Configuration error: {message}")]
    Config {
        /// Error message describing the configuration problem
        message: String,
    },

    /// Internal invariant violation
    #[error("Internal error: {message}")]
    Internal {
        /// Error message describing the internal error
        message: String,
    },
}

impl TetherError {
    /// Create an encoding error
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding {
            message: message.into(),
        }
    }

    /// Create a decoding error
    pub fn decoding(message: impl Into<String>) -> Self {
        Self::Decoding {
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a type mismatch error
    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::TypeMismatch {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Standard Result type for tether operations
pub type Result<T> = std::result::Result<T, TetherError>;

impl From<std::io::Error> for TetherError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(err.to_string()),
            _ => Self::storage(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        match err.classify() {
            serde_json::error::Category::Io => Self::storage(err.to_string()),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => Self::decoding(err.to_string()),
        }
    }
}
