//! # In-Memory Network
//!
//! In-process peers implementing every collaborator trait, for tests and
//! for embedding the coordinator without a transport.
//!
//! | Piece | Role |
//! |-------|------|
//! | [`MemoryNetwork`] | registry of peers plus fault injection |
//! | [`MemoryRpc`] | client view of the network: [`Routing`], [`StorageRpc`], [`DirectRpc`] |
//!
//! ## Routing
//!
//! Routing sees the whole registry at once: potential hits are the
//! `max_success` peers closest to the location key, direct hits the
//! `direct_hits` closest peers holding live values there. A failing peer
//! still shows up in routing results; it only fails when contacted.
//!
//! ## Fault Injection
//!
//! - `set_failing`: every RPC to the peer errors out.
//! - `set_latency`: every RPC to the peer sleeps first.
//! - `set_routing_failure`: routing itself errors out.
//! - [`MemoryRpc::with_timeout`]: RPCs that take longer fail.
//!
//! ## Signing
//!
//! A client built [`with_keypair`](MemoryRpc::with_keypair) identifies
//! itself on writes that ask for `sign`, and signs unsigned values before
//! sending them. Without `sign` the sender is anonymous.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::coordinator::DistributedHashMap;
use crate::data::Data;
use crate::identity::{now_ms, Id, Keypair, PeerAddress};
use crate::messages::{DirectPayload, DirectReply, RemoveReply, RoutingRequest, RoutingResult};
use crate::protocols::{DirectRpc, Routing, StorageRpc};
use crate::storage::{PeerStore, Protection};

/// Port every in-memory peer pretends to listen on.
const MEMORY_PORT: u16 = 9001;

/// Handles direct messages on one peer.
pub type DirectHandler = Arc<dyn Fn(&PeerAddress, DirectPayload) -> Result<DirectReply> + Send + Sync>;

struct MemoryPeer {
    address: PeerAddress,
    store: Mutex<PeerStore>,
    failing: AtomicBool,
    latency: Mutex<Option<Duration>>,
    requests: AtomicUsize,
    direct_handler: Mutex<Option<DirectHandler>>,
}

impl MemoryPeer {
    fn new(address: PeerAddress, protection: Protection) -> Self {
        Self {
            address,
            store: Mutex::new(PeerStore::new(protection)),
            failing: AtomicBool::new(false),
            latency: Mutex::new(None),
            requests: AtomicUsize::new(0),
            direct_handler: Mutex::new(None),
        }
    }

    async fn handle_direct(&self, payload: DirectPayload) -> Result<DirectReply> {
        let handler = self.direct_handler.lock().await.clone();
        match handler {
            Some(handler) => handler(&self.address, payload),
            None => Ok(match payload {
                DirectPayload::Raw(bytes) => DirectReply::Raw(bytes),
                DirectPayload::Object(bytes) => DirectReply::Object(bytes),
            }),
        }
    }
}

/// Registry of in-process peers.
pub struct MemoryNetwork {
    peers: RwLock<HashMap<Id, Arc<MemoryPeer>>>,
    protection: Protection,
    routing_failure: Mutex<Option<String>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Self::with_protection(Protection::default())
    }

    /// Network whose peers all enforce `protection`.
    pub fn with_protection(protection: Protection) -> Arc<Self> {
        Arc::new(Self {
            peers: RwLock::new(HashMap::new()),
            protection,
            routing_failure: Mutex::new(None),
        })
    }

    /// Register a peer with the given id. Re-adding an id keeps the
    /// existing peer.
    pub async fn add_peer(&self, id: Id) -> PeerAddress {
        let mut peers = self.peers.write().await;
        let peer = peers
            .entry(id)
            .or_insert_with(|| Arc::new(MemoryPeer::new(memory_address(id), self.protection)));
        peer.address
    }

    /// Register `count` peers with ids derived from their index.
    pub async fn add_peers(&self, count: usize) -> Vec<PeerAddress> {
        let mut added = Vec::with_capacity(count);
        for index in 0..count {
            let id = Id::from_hash(format!("memory-peer-{index}").as_bytes());
            added.push(self.add_peer(id).await);
        }
        added
    }

    pub async fn peers(&self) -> Vec<PeerAddress> {
        let mut peers: Vec<PeerAddress> =
            self.peers.read().await.values().map(|p| p.address).collect();
        peers.sort();
        peers
    }

    async fn peer(&self, id: &Id) -> Option<Arc<MemoryPeer>> {
        self.peers.read().await.get(id).cloned()
    }

    pub async fn set_failing(&self, peer: &PeerAddress, failing: bool) {
        if let Some(p) = self.peer(&peer.id).await {
            p.failing.store(failing, Ordering::SeqCst);
        }
    }

    pub async fn set_latency(&self, peer: &PeerAddress, latency: Option<Duration>) {
        if let Some(p) = self.peer(&peer.id).await {
            *p.latency.lock().await = latency;
        }
    }

    pub async fn set_direct_handler(&self, peer: &PeerAddress, handler: DirectHandler) {
        if let Some(p) = self.peer(&peer.id).await {
            *p.direct_handler.lock().await = Some(handler);
        }
    }

    /// Make every routing call fail with `reason`; `None` restores routing.
    pub async fn set_routing_failure(&self, reason: Option<String>) {
        *self.routing_failure.lock().await = reason;
    }

    /// RPCs this peer received, failed ones included.
    pub async fn request_count(&self, peer: &PeerAddress) -> usize {
        match self.peer(&peer.id).await {
            Some(p) => p.requests.load(Ordering::SeqCst),
            None => 0,
        }
    }

    pub async fn total_requests(&self) -> usize {
        self.peers
            .read()
            .await
            .values()
            .map(|p| p.requests.load(Ordering::SeqCst))
            .sum()
    }

    /// What one peer currently holds in a bucket.
    pub async fn stored(&self, peer: &PeerAddress, location_key: Id, domain_key: Id) -> BTreeMap<Id, Data> {
        match self.peer(&peer.id).await {
            Some(p) => p.store.lock().await.get(location_key, domain_key, None, None, now_ms()),
            None => BTreeMap::new(),
        }
    }

    /// Client handle for this network.
    pub fn client(self: &Arc<Self>) -> MemoryRpc {
        MemoryRpc {
            network: self.clone(),
            keypair: None,
            timeout: None,
        }
    }

    /// Count the request, then apply injected faults.
    async fn reach(&self, to: &PeerAddress) -> Result<Arc<MemoryPeer>> {
        let peer = self
            .peer(&to.id)
            .await
            .ok_or_else(|| anyhow!("peer {to} not reachable"))?;
        peer.requests.fetch_add(1, Ordering::SeqCst);

        let latency = *peer.latency.lock().await;
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }
        if peer.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("injected network failure"));
        }
        Ok(peer)
    }
}

fn memory_address(id: Id) -> PeerAddress {
    let bytes = id.as_bytes();
    let ip = Ipv4Addr::new(10, bytes[0], bytes[1], bytes[2]);
    PeerAddress::new(id, SocketAddr::V4(SocketAddrV4::new(ip, MEMORY_PORT)))
}

/// Client side of a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryRpc {
    network: Arc<MemoryNetwork>,
    keypair: Option<Arc<Keypair>>,
    timeout: Option<Duration>,
}

impl MemoryRpc {
    pub fn with_keypair(mut self, keypair: Keypair) -> Self {
        self.keypair = Some(Arc::new(keypair));
        self
    }

    /// Fail any RPC that takes longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }

    /// Coordinator that routes, stores and sends through this client.
    pub fn coordinator(&self) -> DistributedHashMap {
        let rpc = Arc::new(self.clone());
        DistributedHashMap::new(rpc.clone(), rpc.clone(), rpc)
    }

    /// Public key to present for a request, if it asked to be signed.
    fn sender(&self, sign: bool) -> Result<Option<[u8; 32]>> {
        if !sign {
            return Ok(None);
        }
        self.keypair
            .as_ref()
            .map(|k| Some(k.public_key_bytes()))
            .ok_or_else(|| anyhow!("signed request without a keypair"))
    }

    fn sign_values(&self, sign: bool, data: Data) -> Data {
        match (&self.keypair, sign) {
            (Some(keypair), true) if data.signature().is_none() => data.sign(keypair),
            _ => data,
        }
    }

    async fn bounded<T, F>(&self, to: &PeerAddress, rpc: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, rpc)
                .await
                .map_err(|_| anyhow!("request to {to} timed out after {limit:?}"))?,
            None => rpc.await,
        }
    }
}

#[async_trait]
impl Routing for MemoryRpc {
    async fn route(&self, request: RoutingRequest) -> Result<RoutingResult> {
        if let Some(reason) = self.network.routing_failure.lock().await.clone() {
            return Err(anyhow!(reason));
        }

        let target = request.location_key;
        let mut peers: Vec<Arc<MemoryPeer>> =
            self.network.peers.read().await.values().cloned().collect();
        peers.sort_by(|a, b| a.address.cmp_distance(&b.address, &target));

        let potential_hits: Vec<PeerAddress> = peers
            .iter()
            .take(request.max_success)
            .map(|p| p.address)
            .collect();

        let mut direct_hits = Vec::new();
        if request.is_direct {
            let now = now_ms();
            for peer in &peers {
                if direct_hits.len() >= request.direct_hits {
                    break;
                }
                if peer.store.lock().await.holds(target, request.domain_key, now) {
                    direct_hits.push(peer.address);
                }
            }
        }

        trace!(
            location = ?target,
            potential = potential_hits.len(),
            direct = direct_hits.len(),
            "memory routing resolved"
        );
        Ok(RoutingResult {
            potential_hits,
            direct_hits,
        })
    }
}

#[async_trait]
impl StorageRpc for MemoryRpc {
    async fn add(
        &self,
        to: &PeerAddress,
        location_key: Id,
        domain_key: Id,
        data: Vec<Data>,
        protect_domain: bool,
        sign: bool,
    ) -> Result<BTreeSet<Id>> {
        let sender = self.sender(sign)?;
        let data: Vec<Data> = data.into_iter().map(|d| self.sign_values(sign, d)).collect();
        self.bounded(to, async {
            let peer = self.network.reach(to).await?;
            let mut store = peer.store.lock().await;
            Ok(store.add(location_key, domain_key, data, protect_domain, sender.as_ref(), now_ms()))
        })
        .await
    }

    async fn put(
        &self,
        to: &PeerAddress,
        location_key: Id,
        domain_key: Id,
        data: BTreeMap<Id, Data>,
        protect_domain: bool,
        sign: bool,
    ) -> Result<BTreeSet<Id>> {
        self.store_values(to, location_key, domain_key, data, false, protect_domain, sign)
            .await
    }

    async fn put_if_absent(
        &self,
        to: &PeerAddress,
        location_key: Id,
        domain_key: Id,
        data: BTreeMap<Id, Data>,
        protect_domain: bool,
        sign: bool,
    ) -> Result<BTreeSet<Id>> {
        self.store_values(to, location_key, domain_key, data, true, protect_domain, sign)
            .await
    }

    async fn get(
        &self,
        to: &PeerAddress,
        location_key: Id,
        domain_key: Id,
        content_keys: Option<BTreeSet<Id>>,
        public_key: Option<[u8; 32]>,
        sign: bool,
    ) -> Result<BTreeMap<Id, Data>> {
        self.sender(sign)?;
        self.bounded(to, async {
            let peer = self.network.reach(to).await?;
            let store = peer.store.lock().await;
            Ok(store.get(
                location_key,
                domain_key,
                content_keys.as_ref(),
                public_key.as_ref(),
                now_ms(),
            ))
        })
        .await
    }

    async fn remove(
        &self,
        to: &PeerAddress,
        location_key: Id,
        domain_key: Id,
        content_keys: Option<BTreeSet<Id>>,
        return_results: bool,
        sign: bool,
    ) -> Result<RemoveReply> {
        let sender = self.sender(sign)?;
        self.bounded(to, async {
            let peer = self.network.reach(to).await?;
            let removed = peer.store.lock().await.remove(
                location_key,
                domain_key,
                content_keys.as_ref(),
                sender.as_ref(),
            );
            Ok(if return_results {
                RemoveReply::Data(removed)
            } else {
                RemoveReply::Keys(removed.into_keys().collect())
            })
        })
        .await
    }
}

impl MemoryRpc {
    #[allow(clippy::too_many_arguments)]
    async fn store_values(
        &self,
        to: &PeerAddress,
        location_key: Id,
        domain_key: Id,
        data: BTreeMap<Id, Data>,
        put_if_absent: bool,
        protect_domain: bool,
        sign: bool,
    ) -> Result<BTreeSet<Id>> {
        let sender = self.sender(sign)?;
        let data: BTreeMap<Id, Data> = data
            .into_iter()
            .map(|(key, d)| (key, self.sign_values(sign, d)))
            .collect();
        self.bounded(to, async {
            let peer = self.network.reach(to).await?;
            let mut store = peer.store.lock().await;
            let requested = data.len();
            let written = store.put(
                location_key,
                domain_key,
                data,
                put_if_absent,
                protect_domain,
                sender.as_ref(),
                now_ms(),
            );
            if written.len() < requested {
                debug!(
                    peer = %to,
                    requested,
                    written = written.len(),
                    put_if_absent,
                    "peer stored a subset of the request"
                );
            }
            Ok(written)
        })
        .await
    }
}

#[async_trait]
impl DirectRpc for MemoryRpc {
    async fn send(&self, to: &PeerAddress, payload: DirectPayload) -> Result<DirectReply> {
        self.bounded(to, async {
            let peer = self.network.reach(to).await?;
            peer.handle_direct(payload).await
        })
        .await
    }
}
