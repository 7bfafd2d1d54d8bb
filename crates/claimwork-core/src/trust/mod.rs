//! Trust - artifact の chain of trust
//!
//! - **digest**: sha256 と期待値 manifest
//! - **keyset**: 署名者の allow-list（起動時に構築、以後は読み取り専用）
//! - **verifier**: 署名者の検証 + digest の突き合わせ

pub mod digest;
pub mod keyset;
pub mod verifier;

pub use self::digest::{DigestError, DigestManifest, Sha256Digest};
pub use self::keyset::{KeySetError, TrustedKey, TrustedKeySet};
pub use self::verifier::{SignatureStatement, TrustVerifier};

use crate::domain::ErrorKind;

/// Rejection reasons for an artifact's chain of trust.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrustError {
    #[error("untrusted signer: {0}")]
    Untrusted(String),

    #[error("malformed signature: {0}")]
    Malformed(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    Integrity {
        expected: Sha256Digest,
        actual: Sha256Digest,
    },
}

impl TrustError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TrustError::Untrusted(_) => ErrorKind::Untrusted,
            TrustError::Malformed(_) => ErrorKind::Malformed,
            TrustError::Integrity { .. } => ErrorKind::Integrity,
        }
    }
}
