//! Artifacts produced by a run.

use bytes::Bytes;
use serde::Serialize;

use crate::trust::Sha256Digest;

/// A file produced by the payload, ready for upload.
///
/// Content is held as `Bytes` so retries re-send the same buffer without
/// copying.
#[derive(Debug, Clone)]
pub struct Artifact {
    name: String,
    content_type: String,
    content: Bytes,
    signature: Option<Bytes>,
}

impl Artifact {
    pub fn new(
        name: impl Into<String>,
        content_type: impl Into<String>,
        content: impl Into<Bytes>,
    ) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            content: content.into(),
            signature: None,
        }
    }

    pub fn with_signature(mut self, signature: impl Into<Bytes>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    /// Artifact path, e.g. `public/logs/live.log`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn signature(&self) -> Option<&Bytes> {
        self.signature.as_ref()
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// sha256 over the current content.
    pub fn digest(&self) -> Sha256Digest {
        Sha256Digest::of(&self.content)
    }
}

/// Record of an artifact that made it to its upload destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadedArtifact {
    pub name: String,
    pub content_type: String,
    pub sha256: Sha256Digest,
    pub size: usize,
    /// Verified signer identity, when the artifact carried a signature.
    pub signer: Option<String>,
}
