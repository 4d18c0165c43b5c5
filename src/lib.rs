//! A cache mapping IP prefixes to numeric security identities.
//!
//! Multiple resources (pods, network policies, CIDR groups, node
//! discovery, DNS resolution, the local host) each contribute labels and
//! attributes for the prefixes they know about. This crate maintains the
//! union of those contributions per `(prefix, cluster)`, resolves the
//! flattened label set of every prefix to a numeric identity, and pushes
//! the result to the policy selectors and the datapath table in an order
//! that never maps traffic to an identity the policy engine has not seen.
//!
//! The central type is [`IpCache`]. Producers call
//! [`upsert`](IpCache::upsert) and [`remove`](IpCache::remove); a
//! background controller drains the change queue and callers can block on
//! [`wait_for_revision`](IpCache::wait_for_revision) until their change
//! took effect. The downstream collaborators are trait objects, see
//! [`downstream`].

pub use cache::{Collaborators, IpCache, PrefixMetadata};
pub use config::Config;
pub use injector::LabelInjector;
pub use store::{FlattenedEntry, MetadataStore};
pub use sync::{CacheStatus, CancelToken, DoneSignal};
pub use types::errors::{AllocatorError, IpCacheError, OverwriteError};
pub use types::identity::{Identity, IDENTITY_HOST, LOCAL_IDENTITY_BASE};
pub use types::labels::{Label, LabelSet};
pub use types::prefix_cluster::{ClusterId, PrefixCluster, LOCAL_CLUSTER};
pub use types::resource_info::{
    Attributes, EncryptKey, EndpointFlags, ResourceId, ResourceInfo,
    TunnelPeer,
};
pub use types::source::Source;

pub mod cache;
pub mod config;
pub mod controller;
pub mod downstream;
pub mod injector;
pub mod metrics;
pub mod store;
pub mod sync;
pub mod test_types;
pub mod types;

mod resolver;
mod trie;
