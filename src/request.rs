//! Builders describing one logical call per operation kind.
//!
//! ```ignore
//! let request = PutRequest::new(location)
//!     .with_domain(owner_id)
//!     .with_data(content_key, Data::from("value"))
//!     .protect_domain()
//!     .sign();
//! let result = dht.put(request).await?;
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;

use crate::config::{RequestConfig, RoutingConfig};
use crate::data::Data;
use crate::evaluation::{EvaluationScheme, VotingScheme};
use crate::identity::Id;
use crate::messages::DirectPayload;
use crate::result::DhtError;

/// Domain used when the caller does not name one.
pub const DEFAULT_DOMAIN: Id = Id::ZERO;

#[derive(Clone, Debug)]
pub struct AddRequest {
    pub(crate) location_key: Id,
    pub(crate) domain_key: Id,
    pub(crate) data: Vec<Data>,
    pub(crate) protect_domain: bool,
    pub(crate) sign: bool,
    pub(crate) routing: RoutingConfig,
    pub(crate) request: RequestConfig,
}

impl AddRequest {
    pub fn new(location_key: Id) -> Self {
        Self {
            location_key,
            domain_key: DEFAULT_DOMAIN,
            data: Vec::new(),
            protect_domain: false,
            sign: false,
            routing: RoutingConfig::default(),
            request: RequestConfig::default(),
        }
    }

    pub fn with_domain(mut self, domain_key: Id) -> Self {
        self.domain_key = domain_key;
        self
    }

    pub fn with_data(mut self, data: Data) -> Self {
        self.data.push(data);
        self
    }

    pub fn protect_domain(mut self) -> Self {
        self.protect_domain = true;
        self
    }

    pub fn sign(mut self) -> Self {
        self.sign = true;
        self
    }

    pub fn with_routing_config(mut self, routing: RoutingConfig) -> Self {
        self.routing = routing;
        self
    }

    pub fn with_request_config(mut self, request: RequestConfig) -> Self {
        self.request = request;
        self
    }
}

#[derive(Clone, Debug)]
pub struct PutRequest {
    pub(crate) location_key: Id,
    pub(crate) domain_key: Id,
    pub(crate) data: BTreeMap<Id, Data>,
    pub(crate) put_if_absent: bool,
    pub(crate) protect_domain: bool,
    pub(crate) sign: bool,
    pub(crate) routing: RoutingConfig,
    pub(crate) request: RequestConfig,
}

impl PutRequest {
    pub fn new(location_key: Id) -> Self {
        Self {
            location_key,
            domain_key: DEFAULT_DOMAIN,
            data: BTreeMap::new(),
            put_if_absent: false,
            protect_domain: false,
            sign: false,
            routing: RoutingConfig::default(),
            request: RequestConfig::default(),
        }
    }

    pub fn with_domain(mut self, domain_key: Id) -> Self {
        self.domain_key = domain_key;
        self
    }

    pub fn with_data(mut self, content_key: Id, data: Data) -> Self {
        self.data.insert(content_key, data);
        self
    }

    /// Only write content keys the peer does not hold yet.
    pub fn put_if_absent(mut self) -> Self {
        self.put_if_absent = true;
        self
    }

    pub fn protect_domain(mut self) -> Self {
        self.protect_domain = true;
        self
    }

    pub fn sign(mut self) -> Self {
        self.sign = true;
        self
    }

    pub fn with_routing_config(mut self, routing: RoutingConfig) -> Self {
        self.routing = routing;
        self
    }

    pub fn with_request_config(mut self, request: RequestConfig) -> Self {
        self.request = request;
        self
    }
}

#[derive(Clone)]
pub struct GetRequest {
    pub(crate) location_key: Id,
    pub(crate) domain_key: Id,
    pub(crate) content_keys: Option<BTreeSet<Id>>,
    pub(crate) public_key: Option<[u8; 32]>,
    pub(crate) sign: bool,
    pub(crate) evaluation: Arc<dyn EvaluationScheme>,
    pub(crate) routing: RoutingConfig,
    pub(crate) request: RequestConfig,
}

impl GetRequest {
    /// Fetch the whole bucket at `location_key` unless content keys are added.
    pub fn new(location_key: Id) -> Self {
        Self {
            location_key,
            domain_key: DEFAULT_DOMAIN,
            content_keys: None,
            public_key: None,
            sign: false,
            evaluation: Arc::new(VotingScheme),
            routing: RoutingConfig::default(),
            request: RequestConfig::default(),
        }
    }

    pub fn with_domain(mut self, domain_key: Id) -> Self {
        self.domain_key = domain_key;
        self
    }

    pub fn with_content_key(mut self, content_key: Id) -> Self {
        self.content_keys
            .get_or_insert_with(BTreeSet::new)
            .insert(content_key);
        self
    }

    /// Only return values signed by this public key.
    pub fn with_public_key(mut self, public_key: [u8; 32]) -> Self {
        self.public_key = Some(public_key);
        self
    }

    pub fn with_evaluation(mut self, evaluation: Arc<dyn EvaluationScheme>) -> Self {
        self.evaluation = evaluation;
        self
    }

    pub fn sign(mut self) -> Self {
        self.sign = true;
        self
    }

    pub fn with_routing_config(mut self, routing: RoutingConfig) -> Self {
        self.routing = routing;
        self
    }

    pub fn with_request_config(mut self, request: RequestConfig) -> Self {
        self.request = request;
        self
    }
}

impl std::fmt::Debug for GetRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetRequest")
            .field("location_key", &self.location_key)
            .field("domain_key", &self.domain_key)
            .field("content_keys", &self.content_keys)
            .field("sign", &self.sign)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub struct RemoveRequest {
    pub(crate) location_key: Id,
    pub(crate) domain_key: Id,
    pub(crate) content_keys: Option<BTreeSet<Id>>,
    pub(crate) return_results: bool,
    pub(crate) sign: bool,
    pub(crate) routing: RoutingConfig,
    pub(crate) request: RequestConfig,
}

impl RemoveRequest {
    /// Remove the whole bucket at `location_key` unless content keys are added.
    pub fn new(location_key: Id) -> Self {
        Self {
            location_key,
            domain_key: DEFAULT_DOMAIN,
            content_keys: None,
            return_results: false,
            sign: false,
            routing: RoutingConfig::default(),
            request: RequestConfig::default(),
        }
    }

    pub fn with_domain(mut self, domain_key: Id) -> Self {
        self.domain_key = domain_key;
        self
    }

    pub fn with_content_key(mut self, content_key: Id) -> Self {
        self.content_keys
            .get_or_insert_with(BTreeSet::new)
            .insert(content_key);
        self
    }

    /// Ask peers to send back the values they removed.
    pub fn return_results(mut self) -> Self {
        self.return_results = true;
        self
    }

    pub fn sign(mut self) -> Self {
        self.sign = true;
        self
    }

    pub fn with_routing_config(mut self, routing: RoutingConfig) -> Self {
        self.routing = routing;
        self
    }

    pub fn with_request_config(mut self, request: RequestConfig) -> Self {
        self.request = request;
        self
    }
}

#[derive(Clone, Debug)]
pub struct DirectRequest {
    pub(crate) location_key: Id,
    pub(crate) payload: DirectPayload,
    pub(crate) cancel_on_finish: bool,
    pub(crate) routing: RoutingConfig,
    pub(crate) request: RequestConfig,
}

impl DirectRequest {
    pub fn raw(location_key: Id, bytes: impl Into<Vec<u8>>) -> Self {
        Self::with_payload(location_key, DirectPayload::Raw(bytes.into()))
    }

    pub fn object<T: Serialize>(location_key: Id, value: &T) -> Result<Self, DhtError> {
        let payload = DirectPayload::object(value)
            .map_err(|e| DhtError::InvalidArgument(format!("cannot encode object: {e}")))?;
        Ok(Self::with_payload(location_key, payload))
    }

    fn with_payload(location_key: Id, payload: DirectPayload) -> Self {
        Self {
            location_key,
            payload,
            cancel_on_finish: false,
            routing: RoutingConfig::default(),
            request: RequestConfig::default(),
        }
    }

    /// Cancel replies still in flight once enough peers answered.
    pub fn cancel_on_finish(mut self) -> Self {
        self.cancel_on_finish = true;
        self
    }

    pub fn with_routing_config(mut self, routing: RoutingConfig) -> Self {
        self.routing = routing;
        self
    }

    pub fn with_request_config(mut self, request: RequestConfig) -> Self {
        self.request = request;
        self
    }
}
