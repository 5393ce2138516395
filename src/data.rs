//! Stored values and their metadata.
//!
//! A [`Data`] is handed to the coordinator immutable; the same instance is
//! replicated to every peer of a write and comes back unchanged from reads.

use serde::{Deserialize, Serialize};

use crate::identity::{now_ms, verify_signature, Id, Keypair};

/// Domain separation prefix for value signatures.
pub const DATA_SIGNATURE_DOMAIN: &[u8] = b"hashmesh-data-v1:";

/// Default time-to-live; zero means the value never expires.
pub const DEFAULT_TTL_SECONDS: u32 = 0;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Data {
    value: Vec<u8>,
    ttl_seconds: u32,
    created_ms: u64,
    signature: Option<Vec<u8>>,
    public_key: Option<[u8; 32]>,
}

impl Data {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: value.into(),
            ttl_seconds: DEFAULT_TTL_SECONDS,
            created_ms: now_ms(),
            signature: None,
            public_key: None,
        }
    }

    pub fn with_ttl(mut self, ttl_seconds: u32) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    /// Sign the value, binding it to `keypair`'s public key.
    pub fn sign(mut self, keypair: &Keypair) -> Self {
        let signature = keypair.sign(&Self::signed_payload(&self.value));
        self.signature = Some(signature.to_bytes().to_vec());
        self.public_key = Some(keypair.public_key_bytes());
        self
    }

    /// `true` when the value carries a signature that verifies against the
    /// embedded public key.
    pub fn verify(&self) -> bool {
        match (&self.public_key, &self.signature) {
            (Some(key), Some(signature)) => {
                verify_signature(key, &Self::signed_payload(&self.value), signature)
            }
            _ => false,
        }
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn into_value(self) -> Vec<u8> {
        self.value
    }

    pub fn ttl_seconds(&self) -> u32 {
        self.ttl_seconds
    }

    pub fn created_ms(&self) -> u64 {
        self.created_ms
    }

    pub fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    pub fn public_key(&self) -> Option<&[u8; 32]> {
        self.public_key.as_ref()
    }

    /// Digest of the payload only; two replicas of one value vote together
    /// even when their metadata differs.
    pub fn content_hash(&self) -> Id {
        Id::from_hash(&self.value)
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.ttl_seconds > 0
            && now_ms.saturating_sub(self.created_ms) > u64::from(self.ttl_seconds) * 1000
    }

    fn signed_payload(value: &[u8]) -> Vec<u8> {
        let mut prefixed = Vec::with_capacity(DATA_SIGNATURE_DOMAIN.len() + value.len());
        prefixed.extend_from_slice(DATA_SIGNATURE_DOMAIN);
        prefixed.extend_from_slice(value);
        prefixed
    }
}

impl std::fmt::Debug for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Data")
            .field("len", &self.value.len())
            .field("hash", &self.content_hash())
            .field("ttl_seconds", &self.ttl_seconds)
            .field("signed", &self.signature.is_some())
            .finish()
    }
}

impl From<&str> for Data {
    fn from(value: &str) -> Self {
        Data::new(value.as_bytes().to_vec())
    }
}
