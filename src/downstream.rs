//! Interfaces to the collaborators downstream of the metadata layer: the
//! identity allocator, the policy-selector updater and the IPCache table
//! writer that ultimately programs the datapath maps.
//!
//! These stay trait objects so the agent can plug in its real
//! implementations while tests use the reference ones from
//! [`test_types`](crate::test_types).

use std::collections::HashMap;

use crate::sync::DoneSignal;
use crate::types::errors::{AllocatorError, OverwriteError};
use crate::types::identity::Identity;
use crate::types::labels::LabelSet;
use crate::types::prefix_cluster::PrefixCluster;
use crate::types::resource_info::{EncryptKey, EndpointFlags, TunnelPeer};
use crate::types::source::Source;

//------------ IdentityAllocator ---------------------------------------------

/// The result of an identity allocation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AllocatedIdentity {
    pub identity: Identity,
    /// Whether this allocation created the identity, as opposed to
    /// taking another reference on an existing one.
    pub is_new: bool,
}

/// Allocates reference-counted numeric identities for label sets.
///
/// Identities are allocated per unique label set. Every successful
/// allocation takes a reference that must eventually be returned through
/// [`release_local_identities`](Self::release_local_identities).
pub trait IdentityAllocator: Send + Sync {
    fn is_initialized(&self) -> bool {
        true
    }

    /// Allocates (or references) the identity for a label set. A free
    /// `preferred` identity in the local scope is honored, otherwise the
    /// allocator picks.
    fn allocate_local_identity(
        &self,
        labels: &LabelSet,
        preferred: Option<Identity>,
    ) -> Result<AllocatedIdentity, AllocatorError>;

    /// Returns one reference for each listed identity and reports the
    /// identities whose reference count dropped to zero.
    fn release_local_identities(&self, ids: &[Identity]) -> Vec<Identity>;
}

//------------ IdentityUpdater -----------------------------------------------

/// Pushes identity additions and deletions to the policy selectors.
///
/// The returned [`DoneSignal`] completes once the selectors have absorbed
/// the update. The injector waits for it before writing any IPCache entry
/// that maps traffic to one of the added identities.
pub trait IdentityUpdater: Send + Sync {
    fn update_identities(
        &self,
        added: &HashMap<Identity, LabelSet>,
        deleted: &HashMap<Identity, LabelSet>,
    ) -> DoneSignal;
}

//------------ IpCacheEntry --------------------------------------------------

/// The legacy owner remembered on an entry the metadata layer overwrote.
/// Restored verbatim when the metadata contributions disappear, so the
/// legacy writer keeps the ability to delete its own entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ShadowEntry {
    pub source: Source,
    pub identity: Identity,
}

/// One entry of the downstream IPCache table.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IpCacheEntry {
    pub identity: Identity,
    pub source: Source,
    pub tunnel_peer: Option<TunnelPeer>,
    pub encrypt_key: Option<EncryptKey>,
    pub endpoint_flags: Option<EndpointFlags>,
    /// Whether this entry is owned by the metadata layer. Entries written
    /// through the legacy direct-upsert path carry `false`.
    pub from_metadata: bool,
    pub shadow: Option<ShadowEntry>,
}

impl IpCacheEntry {
    /// A bare legacy entry, as the direct-upsert path writes it.
    pub fn legacy(identity: Identity, source: Source) -> Self {
        IpCacheEntry {
            identity,
            source,
            tunnel_peer: None,
            encrypt_key: None,
            endpoint_flags: None,
            from_metadata: false,
            shadow: None,
        }
    }

    /// Whether two entries agree on every field the datapath sees. Equal
    /// entries need no write; the freshly taken identity reference is
    /// dropped instead.
    pub fn same_datapath_state(&self, other: &IpCacheEntry) -> bool {
        self.identity == other.identity
            && self.source == other.source
            && self.tunnel_peer == other.tunnel_peer
            && self.encrypt_key == other.encrypt_key
            && self.endpoint_flags == other.endpoint_flags
    }
}

//------------ IpCacheWriter -------------------------------------------------

/// The downstream IPCache table.
///
/// The writer has its own lock. When a caller holds both the metadata lock
/// and the writer lock, the metadata lock is always taken first.
pub trait IpCacheWriter: Send + Sync {
    fn lookup(&self, prefix: &PrefixCluster) -> Option<IpCacheEntry>;

    /// Inserts or replaces an entry. A non-forced upsert is rejected with
    /// [`OverwriteError`] when the existing entry's source takes
    /// precedence, or when nothing would change.
    fn upsert(
        &self,
        prefix: &PrefixCluster,
        entry: IpCacheEntry,
        force: bool,
    ) -> Result<(), OverwriteError>;

    fn delete(&self, prefix: &PrefixCluster);
}
