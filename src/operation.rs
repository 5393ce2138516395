//! # Operation Strategies
//!
//! One strategy per logical operation kind. A strategy knows how to send a
//! single RPC to a single peer and how to fold the replies of many peers into
//! the call's result; the coordinator supplies everything else (routing,
//! rounds, retries, quorum).
//!
//! | Kind | RPC | Candidates | Aggregate | Cancel on finish |
//! |------|-----|------------|-----------|------------------|
//! | ADD | `add` | potential hits | keys written per peer | no |
//! | PUT | `put` / `put_if_absent` | potential hits | keys written per peer | no |
//! | GET | `get` | direct hits | data per peer | yes |
//! | REMOVE | `remove` | direct hits | removed data or keys per peer | no |
//! | DIRECT | `send` | potential hits | raw buffer or object per peer | caller |
//!
//! The accumulator is owned by the call and passed in explicitly; the
//! coordinator serializes `on_partial` calls, so strategies hold no locks.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::data::Data;
use crate::future::ResponseFuture;
use crate::identity::{Id, PeerAddress};
use crate::messages::{Command, DirectPayload, DirectReply, RemoveReply};
use crate::protocols::{DirectRpc, StorageRpc};
use crate::result::PeerResults;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Add,
    Put,
    Get,
    Remove,
    Direct,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperationKind::Add => "add",
            OperationKind::Put => "put",
            OperationKind::Get => "get",
            OperationKind::Remove => "remove",
            OperationKind::Direct => "direct",
        };
        f.write_str(name)
    }
}

pub trait Operation: Send + Sync + 'static {
    type Reply: Send + 'static;
    type Accumulator: Default + Send;

    fn kind(&self) -> OperationKind;

    /// Send exactly one RPC for this call to `peer`.
    fn issue(&self, peer: &PeerAddress) -> ResponseFuture<Self::Reply>;

    /// Fold one peer's successful reply into the accumulator.
    fn on_partial(&self, acc: &mut Self::Accumulator, peer: PeerAddress, reply: Self::Reply);

    /// Turn the accumulator into the call's per-peer result.
    fn on_finalize(&self, acc: Self::Accumulator) -> PeerResults;

    /// Cancel responses still in flight once the call finishes.
    fn cancel_on_finish(&self) -> bool {
        false
    }

    /// Routing command that discovers this call's candidates.
    fn command(&self) -> Command {
        Command::NeighborsStorage
    }

    /// Read-class operations target peers routing confirmed as holding the
    /// key; write-class operations target the closest peers.
    fn is_direct(&self) -> bool {
        false
    }
}

pub struct AddOperation {
    rpc: Arc<dyn StorageRpc>,
    location_key: Id,
    domain_key: Id,
    data: Vec<Data>,
    protect_domain: bool,
    sign: bool,
}

impl AddOperation {
    pub fn new(
        rpc: Arc<dyn StorageRpc>,
        location_key: Id,
        domain_key: Id,
        data: Vec<Data>,
        protect_domain: bool,
        sign: bool,
    ) -> Self {
        Self {
            rpc,
            location_key,
            domain_key,
            data,
            protect_domain,
            sign,
        }
    }
}

impl Operation for AddOperation {
    type Reply = BTreeSet<Id>;
    type Accumulator = HashMap<PeerAddress, BTreeSet<Id>>;

    fn kind(&self) -> OperationKind {
        OperationKind::Add
    }

    fn issue(&self, peer: &PeerAddress) -> ResponseFuture<Self::Reply> {
        let rpc = self.rpc.clone();
        let to = *peer;
        let (location_key, domain_key) = (self.location_key, self.domain_key);
        let data = self.data.clone();
        let (protect_domain, sign) = (self.protect_domain, self.sign);
        ResponseFuture::spawn(to, async move {
            rpc.add(&to, location_key, domain_key, data, protect_domain, sign)
                .await
        })
    }

    fn on_partial(&self, acc: &mut Self::Accumulator, peer: PeerAddress, reply: Self::Reply) {
        acc.insert(peer, reply);
    }

    fn on_finalize(&self, acc: Self::Accumulator) -> PeerResults {
        PeerResults::StoredKeys {
            keys: acc,
            put_if_absent: false,
        }
    }
}

pub struct PutOperation {
    rpc: Arc<dyn StorageRpc>,
    location_key: Id,
    domain_key: Id,
    data: BTreeMap<Id, Data>,
    put_if_absent: bool,
    protect_domain: bool,
    sign: bool,
}

impl PutOperation {
    pub fn new(
        rpc: Arc<dyn StorageRpc>,
        location_key: Id,
        domain_key: Id,
        data: BTreeMap<Id, Data>,
        put_if_absent: bool,
        protect_domain: bool,
        sign: bool,
    ) -> Self {
        Self {
            rpc,
            location_key,
            domain_key,
            data,
            put_if_absent,
            protect_domain,
            sign,
        }
    }
}

impl Operation for PutOperation {
    type Reply = BTreeSet<Id>;
    type Accumulator = HashMap<PeerAddress, BTreeSet<Id>>;

    fn kind(&self) -> OperationKind {
        OperationKind::Put
    }

    fn issue(&self, peer: &PeerAddress) -> ResponseFuture<Self::Reply> {
        let rpc = self.rpc.clone();
        let to = *peer;
        let (location_key, domain_key) = (self.location_key, self.domain_key);
        let data = self.data.clone();
        let (put_if_absent, protect_domain, sign) =
            (self.put_if_absent, self.protect_domain, self.sign);
        ResponseFuture::spawn(to, async move {
            if put_if_absent {
                rpc.put_if_absent(&to, location_key, domain_key, data, protect_domain, sign)
                    .await
            } else {
                rpc.put(&to, location_key, domain_key, data, protect_domain, sign)
                    .await
            }
        })
    }

    fn on_partial(&self, acc: &mut Self::Accumulator, peer: PeerAddress, reply: Self::Reply) {
        acc.insert(peer, reply);
    }

    fn on_finalize(&self, acc: Self::Accumulator) -> PeerResults {
        PeerResults::StoredKeys {
            keys: acc,
            put_if_absent: self.put_if_absent,
        }
    }
}

pub struct GetOperation {
    rpc: Arc<dyn StorageRpc>,
    location_key: Id,
    domain_key: Id,
    content_keys: Option<BTreeSet<Id>>,
    public_key: Option<[u8; 32]>,
    sign: bool,
}

impl GetOperation {
    pub fn new(
        rpc: Arc<dyn StorageRpc>,
        location_key: Id,
        domain_key: Id,
        content_keys: Option<BTreeSet<Id>>,
        public_key: Option<[u8; 32]>,
        sign: bool,
    ) -> Self {
        Self {
            rpc,
            location_key,
            domain_key,
            content_keys,
            public_key,
            sign,
        }
    }
}

impl Operation for GetOperation {
    type Reply = BTreeMap<Id, Data>;
    type Accumulator = HashMap<PeerAddress, BTreeMap<Id, Data>>;

    fn kind(&self) -> OperationKind {
        OperationKind::Get
    }

    fn issue(&self, peer: &PeerAddress) -> ResponseFuture<Self::Reply> {
        let rpc = self.rpc.clone();
        let to = *peer;
        let (location_key, domain_key) = (self.location_key, self.domain_key);
        let content_keys = self.content_keys.clone();
        let (public_key, sign) = (self.public_key, self.sign);
        ResponseFuture::spawn(to, async move {
            rpc.get(&to, location_key, domain_key, content_keys, public_key, sign)
                .await
        })
    }

    fn on_partial(&self, acc: &mut Self::Accumulator, peer: PeerAddress, reply: Self::Reply) {
        acc.insert(peer, reply);
    }

    fn on_finalize(&self, acc: Self::Accumulator) -> PeerResults {
        PeerResults::Data(acc)
    }

    fn cancel_on_finish(&self) -> bool {
        true
    }

    fn is_direct(&self) -> bool {
        true
    }
}

pub struct RemoveOperation {
    rpc: Arc<dyn StorageRpc>,
    location_key: Id,
    domain_key: Id,
    content_keys: Option<BTreeSet<Id>>,
    return_results: bool,
    sign: bool,
}

impl RemoveOperation {
    pub fn new(
        rpc: Arc<dyn StorageRpc>,
        location_key: Id,
        domain_key: Id,
        content_keys: Option<BTreeSet<Id>>,
        return_results: bool,
        sign: bool,
    ) -> Self {
        Self {
            rpc,
            location_key,
            domain_key,
            content_keys,
            return_results,
            sign,
        }
    }
}

#[derive(Default)]
pub struct RemoveAccumulator {
    data: HashMap<PeerAddress, BTreeMap<Id, Data>>,
    keys: HashMap<PeerAddress, BTreeSet<Id>>,
}

impl Operation for RemoveOperation {
    type Reply = RemoveReply;
    type Accumulator = RemoveAccumulator;

    fn kind(&self) -> OperationKind {
        OperationKind::Remove
    }

    fn issue(&self, peer: &PeerAddress) -> ResponseFuture<Self::Reply> {
        let rpc = self.rpc.clone();
        let to = *peer;
        let (location_key, domain_key) = (self.location_key, self.domain_key);
        let content_keys = self.content_keys.clone();
        let (return_results, sign) = (self.return_results, self.sign);
        ResponseFuture::spawn(to, async move {
            rpc.remove(&to, location_key, domain_key, content_keys, return_results, sign)
                .await
        })
    }

    fn on_partial(&self, acc: &mut Self::Accumulator, peer: PeerAddress, reply: Self::Reply) {
        match (self.return_results, reply) {
            (true, RemoveReply::Data(map)) => {
                acc.data.insert(peer, map);
            }
            // A peer that answered with keys only has no prior values to give.
            (true, RemoveReply::Keys(_)) => {
                acc.data.insert(peer, BTreeMap::new());
            }
            (false, reply) => {
                acc.keys.insert(peer, reply.keys());
            }
        }
    }

    fn on_finalize(&self, acc: Self::Accumulator) -> PeerResults {
        if self.return_results {
            PeerResults::Data(acc.data)
        } else {
            PeerResults::RemovedKeys(acc.keys)
        }
    }

    fn is_direct(&self) -> bool {
        true
    }
}

pub struct DirectOperation {
    rpc: Arc<dyn DirectRpc>,
    payload: DirectPayload,
    cancel_on_finish: bool,
}

impl DirectOperation {
    pub fn new(rpc: Arc<dyn DirectRpc>, payload: DirectPayload, cancel_on_finish: bool) -> Self {
        Self {
            rpc,
            payload,
            cancel_on_finish,
        }
    }
}

impl Operation for DirectOperation {
    type Reply = DirectReply;
    type Accumulator = HashMap<PeerAddress, Vec<u8>>;

    fn kind(&self) -> OperationKind {
        OperationKind::Direct
    }

    fn issue(&self, peer: &PeerAddress) -> ResponseFuture<Self::Reply> {
        let rpc = self.rpc.clone();
        let to = *peer;
        let payload = self.payload.clone();
        ResponseFuture::spawn(to, async move { rpc.send(&to, payload).await })
    }

    fn on_partial(&self, acc: &mut Self::Accumulator, peer: PeerAddress, reply: Self::Reply) {
        acc.insert(peer, reply.into_bytes());
    }

    fn on_finalize(&self, acc: Self::Accumulator) -> PeerResults {
        if self.payload.is_raw() {
            PeerResults::DirectRaw(acc)
        } else {
            PeerResults::DirectObject(acc)
        }
    }

    fn cancel_on_finish(&self) -> bool {
        self.cancel_on_finish
    }
}
