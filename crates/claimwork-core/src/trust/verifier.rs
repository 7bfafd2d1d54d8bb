//! TrustVerifier - 署名者の検証と digest の突き合わせ
//!
//! A signature blob is a JSON signature statement:
//!
//! ```json
//! {"signer": "scriptworker@example.com",
//!  "fingerprint": "FB7765CD0FC616FF7AC961A1D9DC50F64C7D44CF",
//!  "keyid": "4C7D44CF",
//!  "sha256": "b5bb9d80..."}
//! ```
//!
//! Cryptographic validation of the statement itself (the keyring) lives
//! outside this crate; what we enforce here is that the claimed signer is on
//! the allow-list and that the statement covers the bytes we actually hold.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::digest::Sha256Digest;
use super::keyset::{TrustedKeySet, normalize_fingerprint, normalize_key_id};
use super::TrustError;

/// Parsed signature blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureStatement {
    pub signer: String,
    pub fingerprint: String,
    pub keyid: String,
    pub sha256: String,
}

impl SignatureStatement {
    pub fn new(
        signer: impl Into<String>,
        fingerprint: impl Into<String>,
        keyid: impl Into<String>,
        digest: &Sha256Digest,
    ) -> Self {
        Self {
            signer: signer.into(),
            fingerprint: fingerprint.into(),
            keyid: keyid.into(),
            sha256: digest.to_hex(),
        }
    }

    pub fn parse(blob: &[u8]) -> Result<Self, TrustError> {
        serde_json::from_slice(blob)
            .map_err(|e| TrustError::Malformed(format!("signature is not a valid statement: {e}")))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing four plain strings cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Verifies signers against an injected, immutable allow-list.
#[derive(Debug, Clone)]
pub struct TrustVerifier {
    keys: Arc<TrustedKeySet>,
}

impl TrustVerifier {
    pub fn new(keys: Arc<TrustedKeySet>) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &TrustedKeySet {
        &self.keys
    }

    /// Returns the verified identity label.
    ///
    /// Order of checks:
    /// 1. statement parses, fingerprint/key id/digest are well formed and the
    ///    key id is the fingerprint's suffix (otherwise `Malformed`);
    /// 2. fingerprint, key id and identity all match one allow-listed entry
    ///    (otherwise `Untrusted`);
    /// 3. asserted digest equals `content_digest` (otherwise `Integrity`).
    pub fn verify_signature(
        &self,
        content_digest: &Sha256Digest,
        signature: &[u8],
    ) -> Result<String, TrustError> {
        let statement = SignatureStatement::parse(signature)?;

        let fingerprint = normalize_fingerprint(&statement.fingerprint)
            .map_err(|reason| TrustError::Malformed(format!("fingerprint: {reason}")))?;
        let key_id = normalize_key_id(&statement.keyid)
            .map_err(|reason| TrustError::Malformed(format!("key id: {reason}")))?;
        if !fingerprint.ends_with(&key_id) {
            return Err(TrustError::Malformed(format!(
                "key id {key_id} does not belong to fingerprint {fingerprint}"
            )));
        }
        let asserted = Sha256Digest::from_hex(&statement.sha256)
            .map_err(|e| TrustError::Malformed(e.to_string()))?;

        let Some(key) = self.keys.by_fingerprint(&fingerprint) else {
            let collisions = self.keys.with_key_id(&key_id);
            if !collisions.is_empty() {
                warn!(
                    signer = %statement.signer,
                    key_id = %key_id,
                    fingerprint = %fingerprint,
                    "short key id matches a trusted key but fingerprint does not"
                );
            }
            return Err(TrustError::Untrusted(format!(
                "{} ({fingerprint}) is not a trusted signer",
                statement.signer
            )));
        };

        if key.key_id != key_id || key.identity != statement.signer {
            return Err(TrustError::Untrusted(format!(
                "signer {} / key id {key_id} does not match trusted entry {}",
                statement.signer, key.identity
            )));
        }

        if asserted != *content_digest {
            return Err(TrustError::Integrity {
                expected: asserted,
                actual: *content_digest,
            });
        }

        debug!(signer = %key.identity, digest = %content_digest, "signature verified");
        Ok(key.identity.clone())
    }
}
