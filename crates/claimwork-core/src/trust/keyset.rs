//! TrustedKeySet - 署名者の allow-list
//!
//! Built once at startup and shared read-only (`Arc<TrustedKeySet>`) by every
//! task. Nothing mutates it afterwards.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// One allow-listed signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedKey {
    pub identity: String,
    /// Full key fingerprint, uppercase hex without spaces.
    pub fingerprint: String,
    /// Short key id, uppercase hex. Always a suffix of `fingerprint`.
    pub key_id: String,
}

impl TrustedKey {
    pub fn new(
        identity: impl Into<String>,
        fingerprint: &str,
        key_id: &str,
    ) -> Result<Self, KeySetError> {
        let identity = identity.into();
        let fingerprint = normalize_fingerprint(fingerprint)
            .map_err(|reason| KeySetError::InvalidFingerprint { identity: identity.clone(), reason })?;
        let key_id = normalize_key_id(key_id)
            .map_err(|reason| KeySetError::InvalidKeyId { identity: identity.clone(), reason })?;
        if !fingerprint.ends_with(&key_id) {
            return Err(KeySetError::KeyIdMismatch { identity });
        }
        Ok(Self {
            identity,
            fingerprint,
            key_id,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeySetError {
    #[error("invalid fingerprint for {identity}: {reason}")]
    InvalidFingerprint { identity: String, reason: String },

    #[error("invalid key id for {identity}: {reason}")]
    InvalidKeyId { identity: String, reason: String },

    #[error("key id for {identity} is not a suffix of its fingerprint")]
    KeyIdMismatch { identity: String },

    #[error("identity {0} listed twice")]
    DuplicateIdentity(String),

    #[error("fingerprint {fingerprint} listed for both {first} and {second}")]
    DuplicateFingerprint {
        fingerprint: String,
        first: String,
        second: String,
    },

    #[error("trusted key file is not valid JSON: {0}")]
    Parse(String),
}

/// On-disk shape: `{"identity": {"fingerprint": "...", "keyid": "..."}}`.
#[derive(Debug, Deserialize)]
struct KeyEntry {
    fingerprint: String,
    keyid: String,
}

/// Immutable allow-list of signer identities.
#[derive(Debug, Clone, Default)]
pub struct TrustedKeySet {
    by_identity: BTreeMap<String, TrustedKey>,
    /// fingerprint -> identity
    by_fingerprint: HashMap<String, String>,
}

impl TrustedKeySet {
    pub fn from_keys(keys: impl IntoIterator<Item = TrustedKey>) -> Result<Self, KeySetError> {
        let mut set = Self::default();
        for key in keys {
            if set.by_identity.contains_key(&key.identity) {
                return Err(KeySetError::DuplicateIdentity(key.identity));
            }
            if let Some(first) = set.by_fingerprint.get(&key.fingerprint) {
                return Err(KeySetError::DuplicateFingerprint {
                    fingerprint: key.fingerprint.clone(),
                    first: first.clone(),
                    second: key.identity,
                });
            }
            set.by_fingerprint
                .insert(key.fingerprint.clone(), key.identity.clone());
            set.by_identity.insert(key.identity.clone(), key);
        }
        Ok(set)
    }

    pub fn from_json_str(json: &str) -> Result<Self, KeySetError> {
        let raw: BTreeMap<String, KeyEntry> =
            serde_json::from_str(json).map_err(|e| KeySetError::Parse(e.to_string()))?;
        let keys = raw
            .into_iter()
            .map(|(identity, entry)| TrustedKey::new(identity, &entry.fingerprint, &entry.keyid))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_keys(keys)
    }

    pub fn get(&self, identity: &str) -> Option<&TrustedKey> {
        self.by_identity.get(identity)
    }

    /// Look up by full fingerprint (any case, spaces allowed).
    pub fn by_fingerprint(&self, fingerprint: &str) -> Option<&TrustedKey> {
        let fp = normalize_fingerprint(fingerprint).ok()?;
        self.by_fingerprint
            .get(&fp)
            .and_then(|identity| self.by_identity.get(identity))
    }

    /// Every entry whose short key id equals `key_id`. Only for diagnostics:
    /// a key id match alone never establishes trust.
    pub fn with_key_id(&self, key_id: &str) -> Vec<&TrustedKey> {
        let Ok(kid) = normalize_key_id(key_id) else {
            return Vec::new();
        };
        self.by_identity
            .values()
            .filter(|k| k.key_id == kid)
            .collect()
    }

    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.by_identity.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_identity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_identity.is_empty()
    }
}

/// Uppercase, strip whitespace, require 40 (v4) or 64 (v5) hex characters.
pub(crate) fn normalize_fingerprint(raw: &str) -> Result<String, String> {
    let fp: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase();
    if fp.len() != 40 && fp.len() != 64 {
        return Err(format!("expected 40 or 64 hex characters, got {}", fp.len()));
    }
    if !fp.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err("not hex".to_string());
    }
    Ok(fp)
}

/// Uppercase, optional `0x` prefix, require 8 or 16 hex characters.
pub(crate) fn normalize_key_id(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let kid = trimmed.to_ascii_uppercase();
    if kid.len() != 8 && kid.len() != 16 {
        return Err(format!("expected 8 or 16 hex characters, got {}", kid.len()));
    }
    if !kid.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err("not hex".to_string());
    }
    Ok(kid)
}
