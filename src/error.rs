//! Error taxonomy for the secrets artifact engine.
//!
//! Every variant is terminal for the operation that produced it. Messages carry
//! key paths and error kinds only, never plaintext values or key material.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum RelicError {
    #[error("Secrets artifact not found: {}", .0.display())]
    MissingArtifact(PathBuf),

    #[error("No master key available (set RELIC_MASTER_KEY or create a key file with 'relic init')")]
    MissingMasterKey,

    #[error("Invalid artifact format: {0}")]
    InvalidFormat(String),

    #[error("Failed to decrypt value at '{path}': wrong master key or tampered data")]
    DecryptFailed { path: String },

    #[error("Edited content is not a JSON object: {0}")]
    InvalidJson(String),

    #[error("Encryption failed: {0}")]
    Encrypt(String),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from encoding or decoding a single token.
///
/// These carry no key path; the tree walker attaches one when lifting them
/// into [`RelicError`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Invalid token: {0}")]
    InvalidFormat(String),

    #[error("Decryption failed: invalid key or corrupted data")]
    DecryptFailed,

    #[error("Encryption failed: {0}")]
    Encrypt(String),
}

impl CodecError {
    /// Lift into a [`RelicError`] for the leaf at `path`.
    pub fn at(self, path: &str) -> RelicError {
        match self {
            CodecError::InvalidFormat(detail) => {
                RelicError::InvalidFormat(format!("{} (at '{}')", detail, path))
            }
            CodecError::DecryptFailed => RelicError::DecryptFailed {
                path: path.to_string(),
            },
            CodecError::Encrypt(detail) => {
                RelicError::Encrypt(format!("{} (at '{}')", detail, path))
            }
        }
    }
}

pub type Result<T, E = RelicError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrypt_failed_names_path_only() {
        let err = CodecError::DecryptFailed.at("database.password");
        let msg = err.to_string();
        assert!(msg.contains("database.password"));
        assert!(matches!(err, RelicError::DecryptFailed { .. }));
    }

    #[test]
    fn invalid_format_keeps_detail() {
        let err = CodecError::InvalidFormat("unsupported version 'v9'".to_string()).at("a");
        match err {
            RelicError::InvalidFormat(detail) => {
                assert!(detail.contains("v9"));
                assert!(detail.contains("'a'"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
