//! # Identifiers, Peer Addresses and Signing Keys
//!
//! This module defines the identity types shared by every DHT operation:
//!
//! - [`Id`]: 160-bit opaque identifier (location, domain and content keys, peer ids)
//! - [`PeerAddress`]: a remote node, i.e. its [`Id`] plus a network endpoint
//! - [`Keypair`]: Ed25519 signing keypair used for signed writes and domain ownership
//!
//! ## Identifier Model
//!
//! Every operation touches three kinds of keys:
//!
//! - **Location key**: where a value lives in the keyspace (drives routing)
//! - **Domain key**: namespace inside a location, usually owned by a public key
//! - **Content key**: one value inside a location + domain bucket
//!
//! Owner identifiers are derived from public keys with [`Id::from_hash`].
//!
//! ## Invariants
//!
//! - P1: `Id::from_bytes(bytes)?.as_bytes() == bytes` (round-trip preservation)
//! - P2: XOR distance is symmetric and zero only against itself
//! - P3: [`PeerAddress`] equality, hashing and ordering ignore the endpoint

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::result::DhtError;

/// Width of an identifier in bytes (160 bits).
pub const ID_LEN: usize = 20;

/// Raw XOR distance between two identifiers.
pub type Distance = [u8; ID_LEN];

/// Returns current time as milliseconds since Unix epoch.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Id([u8; ID_LEN]);

impl Id {
    /// Minimal sentinel, all bits cleared.
    pub const ZERO: Id = Id([0u8; ID_LEN]);

    /// Maximal sentinel, all bits set.
    pub const MAX: Id = Id([0xFF; ID_LEN]);

    #[inline]
    pub const fn new(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Build an identifier from a raw slice.
    ///
    /// # Errors
    /// Returns [`DhtError::InvalidArgument`] unless `bytes` is exactly
    /// [`ID_LEN`] bytes long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        let arr: [u8; ID_LEN] = bytes.try_into().map_err(|_| {
            DhtError::InvalidArgument(format!(
                "identifier must be {} bytes, got {}",
                ID_LEN,
                bytes.len()
            ))
        })?;
        let id = Self(arr);

        debug_assert_eq!(
            &id.0[..],
            bytes,
            "P1 violation: Id must preserve bytes exactly"
        );

        Ok(id)
    }

    /// Derive an identifier from arbitrary bytes.
    ///
    /// BLAKE3 truncated to 160 bits. Used to turn a public key into the
    /// owner id of a protected domain, and to key values stored with `add`.
    pub fn from_hash(input: &[u8]) -> Self {
        let digest = blake3::hash(input);
        let mut out = [0u8; ID_LEN];
        out.copy_from_slice(&digest.as_bytes()[..ID_LEN]);
        Self(out)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &Id) -> Distance {
        let mut out = [0u8; ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != ID_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; ID_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

/// Compare two XOR distances lexicographically.
///
/// Used to determine which of two identifiers is closer to a target
/// in the XOR metric space.
#[inline]
pub fn distance_cmp(a: &Distance, b: &Distance) -> Ordering {
    for i in 0..ID_LEN {
        if a[i] < b[i] {
            return Ordering::Less;
        } else if a[i] > b[i] {
            return Ordering::Greater;
        }
    }
    Ordering::Equal
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Id({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; ID_LEN]> for Id {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl From<Id> for [u8; ID_LEN] {
    fn from(id: Id) -> Self {
        id.0
    }
}

/// Small integers map onto the low-order bytes, big-endian.
impl From<u64> for Id {
    fn from(value: u64) -> Self {
        let mut out = [0u8; ID_LEN];
        out[ID_LEN - 8..].copy_from_slice(&value.to_be_bytes());
        Self(out)
    }
}

impl AsRef<[u8]> for Id {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A remote node: its identifier plus the endpoint it listens on.
#[derive(Clone, Copy, Serialize, Deserialize)]
pub struct PeerAddress {
    pub id: Id,
    pub addr: SocketAddr,
}

impl PeerAddress {
    pub fn new(id: Id, addr: SocketAddr) -> Self {
        Self { id, addr }
    }

    #[inline]
    pub fn distance_to(&self, target: &Id) -> Distance {
        self.id.xor_distance(target)
    }

    /// Order two peers by their XOR distance to `target`.
    ///
    /// Ties (same id) fall back to id order, so the result is total.
    pub fn cmp_distance(&self, other: &PeerAddress, target: &Id) -> Ordering {
        distance_cmp(&self.distance_to(target), &other.distance_to(target))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialEq for PeerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerAddress {}

impl Hash for PeerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for PeerAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl std::fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerAddress({:?}@{})", self.id, self.addr)
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", &self.id.to_hex()[..16], self.addr)
    }
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Identifier owned by this keypair, i.e. the domain key it may claim
    /// as master.
    pub fn owner_id(&self) -> Id {
        Id::from_hash(&self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key.verifying_key().verify(message, signature).is_ok()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("owner", &self.owner_id())
            .finish_non_exhaustive()
    }
}

/// Verify an Ed25519 signature against raw public key bytes.
pub fn verify_signature(public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(message, &signature).is_ok()
}
