//! # Request and Response Types
//!
//! Types exchanged with the routing and storage collaborators. Object-mode
//! direct payloads are bincode-encoded with size limits to prevent memory
//! exhaustion.
//!
//! | Collaborator | Request | Response |
//! |--------------|---------|----------|
//! | Routing | [`RoutingRequest`] | [`RoutingResult`] |
//! | Storage (remove) | — | [`RemoveReply`] |
//! | Direct | [`DirectPayload`] | [`DirectReply`] |

use std::collections::{BTreeMap, BTreeSet};

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::data::Data;
use crate::identity::{Id, PeerAddress};

/// Maximum size of a stored value or direct payload (1 MiB).
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization.
/// Set slightly larger than MAX_VALUE_SIZE to allow for framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_VALUE_SIZE as u64) + 4096;

/// Returns bincode options with size limits enforced.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_bounded<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// What the routing step is looking for on behalf of the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Neighbours responsible for a storage location.
    NeighborsStorage,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoutingRequest {
    pub location_key: Id,
    pub domain_key: Option<Id>,
    pub content_keys: Option<BTreeSet<Id>>,
    pub command: Command,
    /// Ask routing to collect direct hits (peers that confirm holding the key).
    pub is_direct: bool,
    pub direct_hits: usize,
    pub max_no_new_info: usize,
    pub max_failures: usize,
    pub max_success: usize,
    pub parallel: usize,
}

/// Outcome of a routing call.
///
/// Both sets are ordered by proximity to the location key; the coordinator
/// re-sorts them anyway when it builds its candidate set.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RoutingResult {
    pub potential_hits: Vec<PeerAddress>,
    pub direct_hits: Vec<PeerAddress>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoveReply {
    /// Removed values, when the caller asked for them back.
    Data(BTreeMap<Id, Data>),
    Keys(BTreeSet<Id>),
}

impl RemoveReply {
    pub fn keys(&self) -> BTreeSet<Id> {
        match self {
            RemoveReply::Data(map) => map.keys().copied().collect(),
            RemoveReply::Keys(keys) => keys.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectPayload {
    /// Opaque bytes handed to the receiver untouched.
    Raw(Vec<u8>),
    /// A serialized object; the receiver answers with an object too.
    Object(Vec<u8>),
}

impl DirectPayload {
    pub fn object<T: Serialize>(value: &T) -> Result<Self, bincode::Error> {
        Ok(DirectPayload::Object(serialize_bounded(value)?))
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, DirectPayload::Raw(_))
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            DirectPayload::Raw(bytes) | DirectPayload::Object(bytes) => bytes,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectReply {
    Raw(Vec<u8>),
    Object(Vec<u8>),
}

impl DirectReply {
    pub fn object<T: Serialize>(value: &T) -> Result<Self, bincode::Error> {
        Ok(DirectReply::Object(serialize_bounded(value)?))
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            DirectReply::Raw(bytes) | DirectReply::Object(bytes) => bytes,
        }
    }
}
