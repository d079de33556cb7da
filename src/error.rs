use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::policy::PolicyResult;

/// Failure taxonomy shared by every patch phase.
///
/// Bootstrap-phase callers never see these surface as a crash; apply-phase
/// callers receive them through `on_error`; recovery-phase callers log them
/// and retry on a later start.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("content hash mismatch (expected {expected}, got {actual})")]
    HashMismatch { expected: String, actual: String },
    #[error("patch signature invalid: {0}")]
    SignatureInvalid(String),
    #[error("patch signer does not match host signing identity: {0}")]
    SignatureMismatchWithHost(String),
    #[error("security policy violation: {0}")]
    PolicyViolation(PolicyResult),
    #[error("failed to decrypt archive entry: {0}")]
    DecryptFailure(String),
    #[error("tamper threshold exceeded after {count} detections; all patch state cleared")]
    ThresholdExceeded { count: u32 },
    #[error("malformed patch archive: {0}")]
    Archive(String),
    #[error("install cancelled before commit")]
    Cancelled,
}

impl PatchError {
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Stable label for callbacks, audit records and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io { .. } => "io_error",
            Self::HashMismatch { .. } => "hash_mismatch",
            Self::SignatureInvalid(_) => "signature_invalid",
            Self::SignatureMismatchWithHost(_) => "signature_mismatch_with_host",
            Self::PolicyViolation(_) => "policy_violation",
            Self::DecryptFailure(_) => "decrypt_failure",
            Self::ThresholdExceeded { .. } => "threshold_exceeded",
            Self::Archive(_) => "archive_error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

impl From<zip::result::ZipError> for PatchError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Archive(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::PatchError;
    use crate::policy::PolicyResult;

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(
            PatchError::PolicyViolation(PolicyResult::MissingSignature).kind(),
            "policy_violation"
        );
        assert_eq!(
            PatchError::ThresholdExceeded { count: 3 }.kind(),
            "threshold_exceeded"
        );
        let missing = PatchError::io(
            "/nonexistent",
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(missing.is_not_found());
        assert_eq!(missing.kind(), "io_error");
    }
}
