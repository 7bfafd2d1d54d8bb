//! Content digests and the expected-digest manifest.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// A sha256 digest. Displays and serializes as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sha256Digest([u8; 32]);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DigestError {
    #[error("sha256 digest must be 64 hex characters, got {0}")]
    BadLength(usize),

    #[error("sha256 digest is not valid hex: {0}")]
    BadHex(String),
}

impl Sha256Digest {
    /// Digest of an in-memory buffer.
    pub fn of(bytes: &[u8]) -> Self {
        let out = Sha256::digest(bytes);
        let mut buf = [0u8; 32];
        buf.copy_from_slice(&out);
        Self(buf)
    }

    /// Digest of a sequence of chunks, as they would be streamed.
    pub fn of_chunks<'a>(chunks: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut hasher = Sha256::new();
        for chunk in chunks {
            hasher.update(chunk);
        }
        let mut buf = [0u8; 32];
        buf.copy_from_slice(&hasher.finalize());
        Self(buf)
    }

    pub fn from_hex(s: &str) -> Result<Self, DigestError> {
        let s = s.trim();
        if s.len() != 64 {
            return Err(DigestError::BadLength(s.len()));
        }
        let raw = hex::decode(s).map_err(|e| DigestError::BadHex(e.to_string()))?;
        let mut buf = [0u8; 32];
        buf.copy_from_slice(&raw);
        Ok(Self(buf))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha256Digest({})", self.to_hex())
    }
}

impl FromStr for Sha256Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for Sha256Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Sha256Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Expected digests keyed by artifact path (e.g. `"public/foo"`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DigestManifest {
    entries: BTreeMap<String, Sha256Digest>,
}

impl DigestManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `{"public/foo": "<sha256 hex>", ...}`.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn insert(&mut self, path: impl Into<String>, digest: Sha256Digest) -> Option<Sha256Digest> {
        self.entries.insert(path.into(), digest)
    }

    pub fn expected(&self, path: &str) -> Option<&Sha256Digest> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FOO_SHA: &str = "b5bb9d8014a0f9b1d61e21e796d78dccdf1352f23cd32812f4850b878ae4944c";

    #[test]
    fn digest_of_known_payload() {
        assert_eq!(Sha256Digest::of(b"foo\n").to_hex(), FOO_SHA);
    }

    #[test]
    fn chunked_digest_matches_whole_buffer() {
        let whole = Sha256Digest::of(b"foo\n");
        let chunked = Sha256Digest::of_chunks([&b"fo"[..], &b"o"[..], &b"\n"[..]]);
        assert_eq!(whole, chunked);
    }

    #[test]
    fn every_single_byte_mutation_changes_digest() {
        let payload = b"foo\n".to_vec();
        let original = Sha256Digest::of(&payload);
        for i in 0..payload.len() {
            let mut mutated = payload.clone();
            mutated[i] ^= 0x01;
            assert_ne!(Sha256Digest::of(&mutated), original, "byte {i}");
        }
    }

    #[test]
    fn hex_parsing_rejects_bad_input() {
        assert_eq!(Sha256Digest::from_hex("abcd"), Err(DigestError::BadLength(4)));
        let not_hex = "z".repeat(64);
        assert!(matches!(Sha256Digest::from_hex(&not_hex), Err(DigestError::BadHex(_))));
        let upper = FOO_SHA.to_uppercase();
        assert_eq!(Sha256Digest::from_hex(&upper).unwrap().to_hex(), FOO_SHA);
    }

    #[test]
    fn manifest_loads_from_json() {
        let json = format!(
            r#"{{"public/foo": "{FOO_SHA}",
                "public/baz": "bf07a7fbb825fc0aae7bf4a1177b2b31fcf8a3feeaf7092761e18c859ee52a9c"}}"#
        );
        let manifest = DigestManifest::from_json_str(&json).unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.expected("public/foo").unwrap().to_hex(), FOO_SHA);
        assert!(manifest.expected("public/missing").is_none());
    }

    #[test]
    fn manifest_rejects_bad_digest() {
        assert!(DigestManifest::from_json_str(r#"{"public/foo": "nope"}"#).is_err());
    }
}
