//! # hashmesh - Replicated Operations over a Kademlia-Style DHT
//!
//! hashmesh turns one logical key-value request (add, put, get, remove, or a
//! direct message) into concurrent RPCs against the replica set responsible
//! for a key, and reports what those replicas confirmed.
//!
//! - **Routing first**: every call asks a [`Routing`] collaborator for the
//!   candidate peers closest to its location key
//! - **Quorum rounds**: up to `minimum_results + parallel_diff` RPCs in flight,
//!   refilled from the nearest unused candidates until `minimum_results` peers
//!   succeeded, the candidates ran out, or `max_failure` rounds fell short
//! - **Degraded success**: a short quorum is reported, not raised; only a
//!   routing failure fails a call
//! - **Evaluation**: per-peer answers reduce to one value set through an
//!   [`EvaluationScheme`] (majority vote by default)
//!
//! ## Architecture
//!
//! The coordinator owns no sockets. Routing, storage and direct messaging are
//! traits ([`Routing`], [`StorageRpc`], [`DirectRpc`]) so any transport can sit
//! underneath; [`MemoryNetwork`] implements all three in-process. Each call runs
//! on its own tokio task and hands back a [`DhtFuture`].
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `identity` | 160-bit ids, XOR distance, peer addresses, Ed25519 keypairs |
//! | `data` | Stored values with TTL and optional signature |
//! | `config` | Request and routing configuration |
//! | `messages` | Routing request/result, remove and direct payloads, bounded bincode |
//! | `protocols` | Collaborator traits (Routing, StorageRpc, DirectRpc) |
//! | `candidates` | Per-call candidate set, nearest first |
//! | `future` | Per-peer response futures |
//! | `forkjoin` | Quorum join over one round of responses |
//! | `operation` | Per-kind strategies: what to send, how to aggregate |
//! | `coordinator` | `DistributedHashMap` and the round/retry state machine |
//! | `evaluation` | Voting and first-success reduction |
//! | `result` | `DhtFuture`, `DhtResult`, `DhtError` |
//! | `storage` | Peer-side buckets with domain protection |
//! | `memory` | In-process network for tests and embedding |
//!
//! ## Example
//!
//! ```ignore
//! let network = MemoryNetwork::new();
//! network.add_peers(8).await;
//! let dht = network.client().coordinator();
//!
//! let location = Id::from_hash(b"profile");
//! dht.put(PutRequest::new(location).with_data(Id::from(1u64), Data::from("hello")))
//!     .await?;
//! let value = dht.get(GetRequest::new(location)).await?.value();
//! ```

mod candidates;
mod config;
mod coordinator;
mod data;
mod evaluation;
mod forkjoin;
mod future;
mod identity;
mod memory;
mod messages;
mod operation;
mod protocols;
mod request;
mod result;
mod storage;

pub use candidates::CandidateSet;
pub use config::{
    RequestConfig, RoutingConfig, DEFAULT_MAX_FAILURE, DEFAULT_MINIMUM_RESULTS,
    DEFAULT_PARALLEL_DIFF, DEFAULT_ROUTING_DIRECT_HITS, DEFAULT_ROUTING_MAX_FAILURES,
    DEFAULT_ROUTING_MAX_NO_NEW_INFO_DIFF, DEFAULT_ROUTING_MAX_SUCCESS, DEFAULT_ROUTING_PARALLEL,
};
pub use coordinator::DistributedHashMap;
pub use data::{Data, DATA_SIGNATURE_DOMAIN, DEFAULT_TTL_SECONDS};
pub use evaluation::{EvaluationScheme, FirstSuccess, VotingScheme};
pub use forkjoin::{cancel_pending, fork_join, JoinOutcome};
pub use future::{Completer, ResponseFuture, Status, CANCELLED_REASON};
pub use identity::{distance_cmp, verify_signature, Distance, Id, Keypair, PeerAddress, ID_LEN};
pub use memory::{DirectHandler, MemoryNetwork, MemoryRpc};
pub use messages::{
    deserialize_bounded, serialize_bounded, Command, DirectPayload, DirectReply, RemoveReply,
    RoutingRequest, RoutingResult, MAX_DESERIALIZE_SIZE, MAX_VALUE_SIZE,
};
pub use operation::{
    AddOperation, DirectOperation, GetOperation, Operation, OperationKind, PutOperation,
    RemoveAccumulator, RemoveOperation,
};
pub use protocols::{DirectRpc, Routing, StorageRpc};
pub use request::{
    AddRequest, DirectRequest, GetRequest, PutRequest, RemoveRequest, DEFAULT_DOMAIN,
};
pub use result::{DhtError, DhtFuture, DhtResult, PeerResults};
pub use storage::{PeerStore, Protection, ProtectionEnable, ProtectionMode};
