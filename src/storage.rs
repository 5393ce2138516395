//! # Peer-Side Storage
//!
//! What one replica holds: values grouped into buckets keyed by
//! `(location, domain)`, plus the domain claims that gate writes.
//!
//! ## Domain Protection
//!
//! A protected write claims its `(location, domain)` bucket for the sender's
//! public key. Later writers are checked against the claim:
//!
//! | Writer | Unclaimed bucket | Claimed bucket |
//! |--------|------------------|----------------|
//! | claim holder | write, may claim | write |
//! | master (`hash(public key) == domain`) | write, may claim | write, takes over claim |
//! | anyone else, [`ProtectionEnable::All`] | write, may claim | rejected |
//! | anyone else, [`ProtectionEnable::None`] | write, cannot claim | rejected |
//!
//! Masters only exist under [`ProtectionMode::MasterPublicKey`]. Rejected
//! writes are not errors: the peer answers with an empty key set.
//!
//! ## Value Checks
//!
//! - Values larger than [`MAX_VALUE_SIZE`] are skipped.
//! - Values that carry a signature must verify.
//! - Expired values are invisible to reads and count as absent for
//!   put-if-absent.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;

use crate::data::Data;
use crate::identity::Id;
use crate::messages::MAX_VALUE_SIZE;

/// Who may claim an unclaimed domain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProtectionEnable {
    /// Any signed protected write.
    #[default]
    All,
    /// Only the domain's master.
    None,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProtectionMode {
    /// Claims are final.
    NoMaster,
    /// The key whose hash equals the domain key can always write and claim.
    #[default]
    MasterPublicKey,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Protection {
    pub enable: ProtectionEnable,
    pub mode: ProtectionMode,
}

impl Protection {
    pub fn new(enable: ProtectionEnable, mode: ProtectionMode) -> Self {
        Self { enable, mode }
    }
}

type BucketKey = (Id, Id);

/// Why a write was turned away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriteRejection {
    ClaimedByOther,
}

#[derive(Debug, Default)]
pub struct PeerStore {
    buckets: HashMap<BucketKey, BTreeMap<Id, Data>>,
    claims: HashMap<BucketKey, [u8; 32]>,
    protection: Protection,
}

impl PeerStore {
    pub fn new(protection: Protection) -> Self {
        Self {
            buckets: HashMap::new(),
            claims: HashMap::new(),
            protection,
        }
    }

    pub fn protection(&self) -> Protection {
        self.protection
    }

    /// Public key holding the claim on a bucket, if any.
    pub fn owner(&self, location_key: Id, domain_key: Id) -> Option<[u8; 32]> {
        self.claims.get(&(location_key, domain_key)).copied()
    }

    fn is_master(&self, domain_key: Id, sender: Option<&[u8; 32]>) -> bool {
        self.protection.mode == ProtectionMode::MasterPublicKey
            && sender.is_some_and(|key| Id::from_hash(key) == domain_key)
    }

    /// Check the claim on a bucket, and record a new one when asked to.
    fn authorize(
        &mut self,
        location_key: Id,
        domain_key: Id,
        sender: Option<&[u8; 32]>,
        protect_domain: bool,
    ) -> Result<(), WriteRejection> {
        let bucket = (location_key, domain_key);
        let master = self.is_master(domain_key, sender);

        if let Some(owner) = self.claims.get(&bucket) {
            if sender != Some(owner) && !master {
                return Err(WriteRejection::ClaimedByOther);
            }
        }

        if protect_domain {
            if let Some(key) = sender {
                let may_claim = master || self.protection.enable == ProtectionEnable::All;
                let unclaimed = !self.claims.contains_key(&bucket);
                if may_claim && (unclaimed || master) {
                    self.claims.insert(bucket, *key);
                } else if !may_claim {
                    debug!(
                        location = ?location_key,
                        domain = ?domain_key,
                        "claim refused: only the domain master may protect"
                    );
                }
            }
        }
        Ok(())
    }

    fn admissible(data: &Data) -> bool {
        if data.value().len() > MAX_VALUE_SIZE {
            debug!(
                size = data.value().len(),
                max = MAX_VALUE_SIZE,
                "value rejected: too large"
            );
            return false;
        }
        if data.signature().is_some() && !data.verify() {
            debug!(hash = ?data.content_hash(), "value rejected: bad signature");
            return false;
        }
        true
    }

    /// Store values, returning the content keys actually written.
    #[allow(clippy::too_many_arguments)]
    pub fn put(
        &mut self,
        location_key: Id,
        domain_key: Id,
        data: BTreeMap<Id, Data>,
        put_if_absent: bool,
        protect_domain: bool,
        sender: Option<&[u8; 32]>,
        now_ms: u64,
    ) -> BTreeSet<Id> {
        if let Err(rejection) = self.authorize(location_key, domain_key, sender, protect_domain) {
            debug!(
                location = ?location_key,
                domain = ?domain_key,
                reason = ?rejection,
                sender = ?sender.map(|k| hex::encode(&k[..8])),
                "write rejected by domain protection"
            );
            return BTreeSet::new();
        }

        let bucket = self.buckets.entry((location_key, domain_key)).or_default();
        let mut written = BTreeSet::new();
        for (content_key, value) in data {
            if !Self::admissible(&value) {
                continue;
            }
            if put_if_absent
                && bucket
                    .get(&content_key)
                    .is_some_and(|existing| !existing.is_expired(now_ms))
            {
                continue;
            }
            bucket.insert(content_key, value);
            written.insert(content_key);
        }
        written
    }

    /// Store values under the hash of their payload.
    pub fn add(
        &mut self,
        location_key: Id,
        domain_key: Id,
        data: Vec<Data>,
        protect_domain: bool,
        sender: Option<&[u8; 32]>,
        now_ms: u64,
    ) -> BTreeSet<Id> {
        let keyed = data.into_iter().map(|d| (d.content_hash(), d)).collect();
        self.put(
            location_key,
            domain_key,
            keyed,
            false,
            protect_domain,
            sender,
            now_ms,
        )
    }

    /// Live values in a bucket, optionally narrowed to `content_keys` and to
    /// values signed by `public_key`.
    pub fn get(
        &self,
        location_key: Id,
        domain_key: Id,
        content_keys: Option<&BTreeSet<Id>>,
        public_key: Option<&[u8; 32]>,
        now_ms: u64,
    ) -> BTreeMap<Id, Data> {
        let Some(bucket) = self.buckets.get(&(location_key, domain_key)) else {
            return BTreeMap::new();
        };
        bucket
            .iter()
            .filter(|(key, _)| content_keys.map_or(true, |keys| keys.contains(*key)))
            .filter(|(_, data)| !data.is_expired(now_ms))
            .filter(|(_, data)| public_key.map_or(true, |pk| data.public_key() == Some(pk)))
            .map(|(key, data)| (*key, data.clone()))
            .collect()
    }

    /// Remove values, returning what was removed. A claimed bucket only
    /// accepts removals from its owner or master.
    pub fn remove(
        &mut self,
        location_key: Id,
        domain_key: Id,
        content_keys: Option<&BTreeSet<Id>>,
        sender: Option<&[u8; 32]>,
    ) -> BTreeMap<Id, Data> {
        if let Err(rejection) = self.authorize(location_key, domain_key, sender, false) {
            debug!(
                location = ?location_key,
                domain = ?domain_key,
                reason = ?rejection,
                "remove rejected by domain protection"
            );
            return BTreeMap::new();
        }

        let bucket_key = (location_key, domain_key);
        let Some(bucket) = self.buckets.get_mut(&bucket_key) else {
            return BTreeMap::new();
        };
        let removed = match content_keys {
            Some(keys) => keys
                .iter()
                .filter_map(|key| bucket.remove(key).map(|data| (*key, data)))
                .collect(),
            None => std::mem::take(bucket),
        };
        if bucket.is_empty() {
            self.buckets.remove(&bucket_key);
        }
        removed
    }

    /// `true` when this peer holds live values at `location_key`, in
    /// `domain_key` if given.
    pub fn holds(&self, location_key: Id, domain_key: Option<Id>, now_ms: u64) -> bool {
        self.buckets.iter().any(|((location, domain), bucket)| {
            *location == location_key
                && domain_key.map_or(true, |d| d == *domain)
                && bucket.values().any(|data| !data.is_expired(now_ms))
        })
    }

    /// Number of stored values, expired ones included.
    pub fn len(&self) -> usize {
        self.buckets.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    const NOW: u64 = 1_700_000_000_000;

    fn values(entries: &[(u64, &str)]) -> BTreeMap<Id, Data> {
        entries
            .iter()
            .map(|(k, v)| (Id::from(*k), Data::from(*v)))
            .collect()
    }

    fn loc() -> Id {
        Id::from_hash(b"location")
    }

    #[test]
    fn put_overwrites_and_put_if_absent_does_not() {
        let mut store = PeerStore::default();
        let domain = Id::ZERO;

        let first = store.put(loc(), domain, values(&[(1, "a")]), false, false, None, NOW);
        assert_eq!(first, BTreeSet::from([Id::from(1u64)]));

        let again = store.put(loc(), domain, values(&[(1, "b")]), true, false, None, NOW);
        assert!(again.is_empty());
        assert_eq!(store.get(loc(), domain, None, None, NOW)[&Id::from(1u64)].value(), b"a");

        let overwrite = store.put(loc(), domain, values(&[(1, "c")]), false, false, None, NOW);
        assert_eq!(overwrite.len(), 1);
        assert_eq!(store.get(loc(), domain, None, None, NOW)[&Id::from(1u64)].value(), b"c");
    }

    #[test]
    fn expired_values_are_absent() {
        let mut store = PeerStore::default();
        let short = Data::new(b"short".to_vec()).with_ttl(1);
        let later = short.created_ms() + 5_000;
        let mut data = BTreeMap::new();
        data.insert(Id::from(1u64), short);
        store.put(loc(), Id::ZERO, data, false, false, None, NOW);

        assert!(store.holds(loc(), None, NOW));
        assert!(store.get(loc(), Id::ZERO, None, None, later).is_empty());
        assert!(!store.holds(loc(), None, later));

        let replaced = store.put(loc(), Id::ZERO, values(&[(1, "fresh")]), true, false, None, later);
        assert_eq!(replaced.len(), 1);
    }

    #[test]
    fn add_keys_by_content_hash() {
        let mut store = PeerStore::default();
        let data = Data::from("payload");
        let expected = data.content_hash();

        let added = store.add(loc(), Id::ZERO, vec![data], false, None, NOW);
        assert_eq!(added, BTreeSet::from([expected]));
    }

    #[test]
    fn get_filters_by_content_key_and_signer() {
        let keypair = Keypair::generate();
        let mut store = PeerStore::default();
        let mut data = values(&[(1, "plain")]);
        data.insert(Id::from(2u64), Data::from("signed").sign(&keypair));
        store.put(loc(), Id::ZERO, data, false, false, None, NOW);

        let narrowed = store.get(loc(), Id::ZERO, Some(&BTreeSet::from([Id::from(1u64)])), None, NOW);
        assert_eq!(narrowed.len(), 1);

        let signed = store.get(loc(), Id::ZERO, None, Some(&keypair.public_key_bytes()), NOW);
        assert_eq!(signed.keys().copied().collect::<Vec<_>>(), vec![Id::from(2u64)]);
    }

    #[test]
    fn remove_returns_removed_values() {
        let mut store = PeerStore::default();
        store.put(loc(), Id::ZERO, values(&[(1, "a"), (2, "b")]), false, false, None, NOW);

        let removed = store.remove(loc(), Id::ZERO, Some(&BTreeSet::from([Id::from(1u64)])), None);
        assert_eq!(removed.len(), 1);
        assert_eq!(store.len(), 1);

        let rest = store.remove(loc(), Id::ZERO, None, None);
        assert_eq!(rest.len(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn first_protected_writer_claims_the_domain() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let domain = Id::from_hash(b"shared");
        let mut store = PeerStore::default();

        let claimed = store.put(loc(), domain, values(&[(1, "a")]), false, true, Some(&alice.public_key_bytes()), NOW);
        assert_eq!(claimed.len(), 1);
        assert_eq!(store.owner(loc(), domain), Some(alice.public_key_bytes()));

        let rejected = store.put(loc(), domain, values(&[(2, "b")]), false, true, Some(&bob.public_key_bytes()), NOW);
        assert!(rejected.is_empty());

        let unsigned = store.put(loc(), domain, values(&[(3, "c")]), false, false, None, NOW);
        assert!(unsigned.is_empty());

        assert!(store.remove(loc(), domain, None, Some(&bob.public_key_bytes())).is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn master_overrides_an_existing_claim() {
        let squatter = Keypair::generate();
        let master = Keypair::generate();
        let domain = master.owner_id();
        let mut store = PeerStore::default();

        store.put(loc(), domain, values(&[(1, "squat")]), false, true, Some(&squatter.public_key_bytes()), NOW);
        let written = store.put(loc(), domain, values(&[(1, "mine")]), false, true, Some(&master.public_key_bytes()), NOW);

        assert_eq!(written.len(), 1);
        assert_eq!(store.owner(loc(), domain), Some(master.public_key_bytes()));
        let after = store.put(loc(), domain, values(&[(2, "again")]), false, false, Some(&squatter.public_key_bytes()), NOW);
        assert!(after.is_empty());
    }

    #[test]
    fn without_master_mode_claims_are_final() {
        let squatter = Keypair::generate();
        let master = Keypair::generate();
        let domain = master.owner_id();
        let mut store = PeerStore::new(Protection::new(ProtectionEnable::All, ProtectionMode::NoMaster));

        store.put(loc(), domain, values(&[(1, "squat")]), false, true, Some(&squatter.public_key_bytes()), NOW);
        let written = store.put(loc(), domain, values(&[(1, "mine")]), false, true, Some(&master.public_key_bytes()), NOW);

        assert!(written.is_empty());
    }

    #[test]
    fn protection_none_only_lets_the_master_claim() {
        let other = Keypair::generate();
        let master = Keypair::generate();
        let domain = master.owner_id();
        let mut store = PeerStore::new(Protection::new(ProtectionEnable::None, ProtectionMode::MasterPublicKey));

        let stored = store.put(loc(), domain, values(&[(1, "a")]), false, true, Some(&other.public_key_bytes()), NOW);
        assert_eq!(stored.len(), 1);
        assert_eq!(store.owner(loc(), domain), None);

        store.put(loc(), domain, values(&[(2, "b")]), false, true, Some(&master.public_key_bytes()), NOW);
        assert_eq!(store.owner(loc(), domain), Some(master.public_key_bytes()));

        let rejected = store.put(loc(), domain, values(&[(3, "c")]), false, false, Some(&other.public_key_bytes()), NOW);
        assert!(rejected.is_empty());
    }

    #[test]
    fn tampered_signature_is_not_stored() {
        let keypair = Keypair::generate();
        let signed = Data::from("original").sign(&keypair);
        let forged: Data = {
            let mut bytes = bincode::serialize(&signed).unwrap();
            let last = bytes.len() - 1;
            // Flip a bit inside the public key, the final field.
            bytes[last] ^= 0x01;
            bincode::deserialize(&bytes).unwrap()
        };
        let mut store = PeerStore::default();

        let mut data = BTreeMap::new();
        data.insert(Id::from(1u64), forged);
        assert!(store.put(loc(), Id::ZERO, data, false, false, None, NOW).is_empty());
    }
}
