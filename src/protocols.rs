//! Protocol trait definitions for the coordinator's collaborators.
//!
//! The coordinator never talks to the network itself. It consumes these
//! traits, so any transport (QUIC, TCP, the in-process [`crate::memory`]
//! network) can sit underneath.
//!
//! | Protocol | Trait | Purpose |
//! |----------|-------|---------|
//! | Routing | [`Routing`] | Find the candidate replica set for a key |
//! | Storage | [`StorageRpc`] | add / put / put_if_absent / get / remove on one peer |
//! | Direct | [`DirectRpc`] | Point-to-point raw or object transfer |
//!
//! Every method resolves to `Err` for a per-peer failure (refused, timed
//! out, unreachable). The coordinator absorbs those; only a routing failure
//! is fatal to a call.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use async_trait::async_trait;

use crate::data::Data;
use crate::identity::{Id, PeerAddress};
use crate::messages::{DirectPayload, DirectReply, RemoveReply, RoutingRequest, RoutingResult};

#[async_trait]
pub trait Routing: Send + Sync + 'static {
    /// Resolve the candidate peers for a request.
    async fn route(&self, request: RoutingRequest) -> Result<RoutingResult>;
}

/// Storage operations against a single remote peer.
#[async_trait]
pub trait StorageRpc: Send + Sync + 'static {
    /// Append values to a bucket; each is keyed by the hash of its payload.
    /// Returns the content keys the peer actually stored.
    async fn add(
        &self,
        to: &PeerAddress,
        location_key: Id,
        domain_key: Id,
        data: Vec<Data>,
        protect_domain: bool,
        sign: bool,
    ) -> Result<BTreeSet<Id>>;

    /// Store values, overwriting existing ones.
    async fn put(
        &self,
        to: &PeerAddress,
        location_key: Id,
        domain_key: Id,
        data: BTreeMap<Id, Data>,
        protect_domain: bool,
        sign: bool,
    ) -> Result<BTreeSet<Id>>;

    /// Store only values whose content key is not present yet.
    async fn put_if_absent(
        &self,
        to: &PeerAddress,
        location_key: Id,
        domain_key: Id,
        data: BTreeMap<Id, Data>,
        protect_domain: bool,
        sign: bool,
    ) -> Result<BTreeSet<Id>>;

    /// Fetch values. `None` content keys means the whole bucket; a public
    /// key restricts the answer to values signed by that key.
    async fn get(
        &self,
        to: &PeerAddress,
        location_key: Id,
        domain_key: Id,
        content_keys: Option<BTreeSet<Id>>,
        public_key: Option<[u8; 32]>,
        sign: bool,
    ) -> Result<BTreeMap<Id, Data>>;

    async fn remove(
        &self,
        to: &PeerAddress,
        location_key: Id,
        domain_key: Id,
        content_keys: Option<BTreeSet<Id>>,
        return_results: bool,
        sign: bool,
    ) -> Result<RemoveReply>;
}

/// Point-to-point request-response messaging.
#[async_trait]
pub trait DirectRpc: Send + Sync + 'static {
    async fn send(&self, to: &PeerAddress, payload: DirectPayload) -> Result<DirectReply>;
}
