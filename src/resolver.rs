//! Resolver configuration and the per-query lookup pipeline.
//!
//! A [`ResolverConfig`] is the user-facing unit of configuration: DNS name
//! patterns, listeners to serve them on, and upstream forwarders to fall
//! back to. The [`Resolver`] pipeline answers one question at a time:
//! exact store match, then wildcard match, then the forwarders in order.

use hickory_proto::op::{Message, ResponseCode};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::forwarder::ForwarderClient;
use crate::message::StoredMessage;
use crate::metrics::{self, ForwardResult};
use crate::store::Store;

/// Transport of a listener or forwarder endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Net {
    Udp,
    Tcp,
}

impl fmt::Display for Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Net::Udp => write!(f, "udp"),
            Net::Tcp => write!(f, "tcp"),
        }
    }
}

/// One endpoint a resolver wants to be reachable on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub net: Net,
    pub address: String,
}

impl ListenerConfig {
    /// Unique identifier of a bound endpoint across the running set.
    pub fn key(&self) -> String {
        format!("{}-{}", self.address, self.net)
    }
}

impl fmt::Display for ListenerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.net, self.address)
    }
}

/// One upstream server used for fallback resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwarderConfig {
    pub net: Net,
    pub address: String,
}

impl fmt::Display for ForwarderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.net, self.address)
    }
}

/// Tag naming the collection backing a resolver (single local backend in v1;
/// persisted and echoed, never dispatched on).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreTag {
    #[serde(rename = "type", default = "default_store_type")]
    pub kind: String,
}

impl Default for StoreTag {
    fn default() -> Self {
        Self {
            kind: default_store_type(),
        }
    }
}

fn default_store_type() -> String {
    "local".to_string()
}

/// The user-facing unit of configuration, persisted in the `resolvers`
/// collection and reconciled into running listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Stable unique id; the primary key.
    pub id: String,

    /// DNS name suffixes this resolver answers for (`.` matches everything).
    #[serde(default)]
    pub patterns: Vec<String>,

    /// Endpoints to serve the patterns on.
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,

    /// Upstream fallback order.
    #[serde(default)]
    pub forwarders: Vec<ForwarderConfig>,

    /// Backing collection tag.
    #[serde(default)]
    pub store: StoreTag,
}

/// Shared handle between a resolver's installed handlers and the reconciler.
///
/// `id` is immutable after creation; the forwarder list is replaced in place
/// on configuration reload and read per request, so handlers never serve a
/// stale fallback order.
#[derive(Debug)]
pub struct ResolverBinding {
    id: String,
    forwarders: RwLock<Vec<ForwarderConfig>>,
}

impl ResolverBinding {
    /// Create a binding for a resolver id with its initial forwarders.
    pub fn new(id: impl Into<String>, forwarders: Vec<ForwarderConfig>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            forwarders: RwLock::new(forwarders),
        })
    }

    /// The resolver id this binding belongs to.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Replace the forwarder list (hot reload).
    pub fn set_forwarders(&self, forwarders: Vec<ForwarderConfig>) {
        *self.forwarders.write() = forwarders;
    }

    /// Snapshot the current forwarder list.
    pub fn forwarders(&self) -> Vec<ForwarderConfig> {
        self.forwarders.read().clone()
    }
}

/// Outcome of the local (store-backed) stages of the pipeline.
#[derive(Debug)]
pub enum InternalLookup {
    /// An answer was found, by exact or wildcard match.
    Answer {
        message: Box<StoredMessage>,
        wildcard: bool,
    },
    /// Neither exact nor wildcard entry exists; maps to NXDOMAIN.
    NotFound,
    /// The store failed hard; maps to SERVFAIL.
    Failed,
}

/// The per-query pipeline for one resolver.
#[derive(Debug, Clone)]
pub struct Resolver {
    binding: Arc<ResolverBinding>,
    store: Store,
    client: ForwarderClient,
}

impl Resolver {
    pub fn new(binding: Arc<ResolverBinding>, store: Store, client: ForwarderClient) -> Self {
        Self {
            binding,
            store,
            client,
        }
    }

    /// The binding shared with the reconciler.
    pub fn binding(&self) -> &Arc<ResolverBinding> {
        &self.binding
    }

    /// Stages 1-2: exact store match, then wildcard match with the answer
    /// rewritten for the concrete query name.
    pub fn lookup(&self, qtype: u16, qname: &str) -> InternalLookup {
        match self.store.read_message(self.binding.id(), qtype, qname) {
            Ok(message) => {
                return InternalLookup::Answer {
                    message: Box::new(message),
                    wildcard: false,
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!(resolver = self.binding.id(), qname, qtype, error = %e, "store lookup failed");
                return InternalLookup::Failed;
            }
        }

        let wildcard = wildcard_qname(qname);
        match self.store.read_message(self.binding.id(), qtype, &wildcard) {
            Ok(mut message) => {
                message.rewrite_for_wildcard(qname);
                InternalLookup::Answer {
                    message: Box::new(message),
                    wildcard: true,
                }
            }
            Err(e) if e.is_not_found() => InternalLookup::NotFound,
            Err(e) => {
                warn!(resolver = self.binding.id(), qname = wildcard.as_str(), qtype, error = %e, "store lookup failed");
                InternalLookup::Failed
            }
        }
    }

    /// Stage 3: try the forwarders in order.
    ///
    /// Returns the first definitive upstream answer: NOERROR, or NXDOMAIN
    /// from a recursing upstream (trusted negative). Failing that, the last
    /// response any upstream produced; `None` when none responded at all.
    pub async fn forward(&self, request: &Message) -> Option<Message> {
        let forwarders = self.binding.forwarders();
        let mut last_response = None;

        for upstream in &forwarders {
            debug!(resolver = self.binding.id(), upstream = %upstream, "querying forwarder");
            let response = match self.client.exchange(upstream, request).await {
                Ok(response) => response,
                Err(e) => {
                    metrics::record_forward(&upstream.net.to_string(), ForwardResult::TransportError);
                    warn!(resolver = self.binding.id(), upstream = %upstream, error = %e, "forwarder exchange failed");
                    continue;
                }
            };

            match response.response_code() {
                ResponseCode::NoError => {
                    metrics::record_forward(&upstream.net.to_string(), ForwardResult::Answer);
                    return Some(response);
                }
                ResponseCode::NXDomain if response.recursion_available() => {
                    // A recursing upstream stated the name does not exist.
                    metrics::record_forward(&upstream.net.to_string(), ForwardResult::NegativeAnswer);
                    return Some(response);
                }
                rcode => {
                    metrics::record_forward(&upstream.net.to_string(), ForwardResult::Rejected);
                    debug!(resolver = self.binding.id(), upstream = %upstream, ?rcode, "forwarder answer not definitive");
                    last_response = Some(response);
                }
            }
        }

        last_response
    }
}

/// Replace the leftmost label of a query name with `*`.
///
/// `host.some.example.` becomes `*.some.example.`; the root name maps to the
/// root wildcard `*.`.
pub fn wildcard_qname(qname: &str) -> String {
    match qname.split_once('.') {
        Some((_, rest)) => format!("*.{rest}"),
        None => format!("*.{qname}"),
    }
}
