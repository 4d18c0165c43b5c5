use std::collections::BTreeMap;
use std::net::IpAddr;

use serde_derive::Serialize;

use super::identity::Identity;
use super::labels::LabelSet;
use super::source::Source;

//------------ ResourceId ----------------------------------------------------

/// Opaque identifier of the writer of a contribution, unique per
/// contributor, e.g. `pod/default/web-0`.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        ResourceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        ResourceId(value.to_string())
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

//------------ Scalar attributes ---------------------------------------------

/// The node address traffic for a prefix is tunneled to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct TunnelPeer(pub IpAddr);

/// The transparent-encryption key index for a prefix.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct EncryptKey(pub u8);

/// Datapath flags attached to entries for a prefix.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct EndpointFlags(pub u8);

//------------ Attributes ----------------------------------------------------

/// The payload of a single `upsert`/`remove` call: the attributes one
/// resource contributes for (or retracts from) one prefix. Only set
/// attributes participate in merging.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Attributes {
    pub labels: LabelSet,
    pub tunnel_peer: Option<TunnelPeer>,
    pub encrypt_key: Option<EncryptKey>,
    pub endpoint_flags: Option<EndpointFlags>,
    pub identity_override: bool,
    pub requested_identity: Option<Identity>,
}

impl Attributes {
    pub fn labels(labels: LabelSet) -> Self {
        Attributes {
            labels,
            ..Default::default()
        }
    }

    pub fn with_tunnel_peer(mut self, peer: IpAddr) -> Self {
        self.tunnel_peer = Some(TunnelPeer(peer));
        self
    }

    pub fn with_encrypt_key(mut self, key: u8) -> Self {
        self.encrypt_key = Some(EncryptKey(key));
        self
    }

    pub fn with_endpoint_flags(mut self, flags: u8) -> Self {
        self.endpoint_flags = Some(EndpointFlags(flags));
        self
    }

    pub fn with_identity_override(mut self) -> Self {
        self.identity_override = true;
        self
    }

    pub fn with_requested_identity(mut self, id: Identity) -> Self {
        self.requested_identity = Some(id);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
            && self.tunnel_peer.is_none()
            && self.encrypt_key.is_none()
            && self.endpoint_flags.is_none()
            && !self.identity_override
    }
}

//------------ ResourceInfo --------------------------------------------------

/// One resource's contribution for one prefix, or the flattened union of
/// all contributions.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ResourceInfo {
    pub labels: LabelSet,
    pub source: Source,
    pub tunnel_peer: Option<TunnelPeer>,
    pub encrypt_key: Option<EncryptKey>,
    pub endpoint_flags: Option<EndpointFlags>,
    pub identity_override: bool,
    pub requested_identity: Option<Identity>,
}

impl ResourceInfo {
    fn new(source: Source) -> Self {
        ResourceInfo {
            source,
            ..Default::default()
        }
    }

    /// Merges a fresh contribution into this one. Labels union by name.
    /// Scalars accept the incoming value when currently empty, otherwise
    /// the higher-precedence source keeps its value. The identity override
    /// is sticky once any contributor set it. Returns whether anything
    /// changed.
    pub fn merge(&mut self, attrs: &Attributes, source: Source) -> bool {
        let mut changed = false;
        for label in attrs.labels.iter() {
            changed |= self.labels.insert(label.clone());
        }
        changed |= merge_scalar(
            &mut self.tunnel_peer,
            attrs.tunnel_peer,
            self.source,
            source,
        );
        changed |= merge_scalar(
            &mut self.encrypt_key,
            attrs.encrypt_key,
            self.source,
            source,
        );
        changed |= merge_scalar(
            &mut self.endpoint_flags,
            attrs.endpoint_flags,
            self.source,
            source,
        );
        if attrs.identity_override && !self.identity_override {
            self.identity_override = true;
            changed = true;
        }
        if attrs.requested_identity.is_some()
            && self.requested_identity != attrs.requested_identity
        {
            self.requested_identity = attrs.requested_identity;
            changed = true;
        }
        if source > self.source {
            self.source = source;
            changed = true;
        }
        changed
    }

    /// The inverse of [`merge`](Self::merge): subtracts labels and clears
    /// scalars that match the contribution. Returns whether anything
    /// changed.
    pub fn unmerge(&mut self, attrs: &Attributes) -> bool {
        let mut changed = self.labels.subtract(&attrs.labels);
        changed |= clear_scalar(&mut self.tunnel_peer, attrs.tunnel_peer);
        changed |= clear_scalar(&mut self.encrypt_key, attrs.encrypt_key);
        changed |=
            clear_scalar(&mut self.endpoint_flags, attrs.endpoint_flags);
        if attrs.identity_override && self.identity_override {
            self.identity_override = false;
            changed = true;
        }
        if attrs.requested_identity.is_some()
            && self.requested_identity == attrs.requested_identity
        {
            self.requested_identity = None;
            changed = true;
        }
        changed
    }

    /// A contribution is valid while it still asserts at least one
    /// attribute. Invalid contributions are dropped from the store.
    pub fn is_valid(&self) -> bool {
        !self.labels.is_empty()
            || self.tunnel_peer.is_some()
            || self.encrypt_key.is_some()
            || self.endpoint_flags.is_some()
            || self.identity_override
    }
}

fn merge_scalar<T: Copy + Eq>(
    current: &mut Option<T>,
    incoming: Option<T>,
    current_source: Source,
    incoming_source: Source,
) -> bool {
    let Some(value) = incoming else {
        return false;
    };
    match *current {
        None => {
            *current = Some(value);
            true
        }
        Some(existing) => {
            if incoming_source >= current_source && existing != value {
                *current = Some(value);
                true
            } else {
                false
            }
        }
    }
}

fn clear_scalar<T: Copy + Eq>(
    current: &mut Option<T>,
    retracted: Option<T>,
) -> bool {
    if retracted.is_some() && *current == retracted {
        *current = None;
        true
    } else {
        false
    }
}

//------------ PrefixInfo ----------------------------------------------------

/// All contributions for one prefix, with the lazily computed flattened
/// view across them.
///
/// The flattened view is a nullable cache: every mutation clears it and
/// the next reader recomputes it under the store lock.
#[derive(Clone, Debug, Default)]
pub struct PrefixInfo {
    by_resource: BTreeMap<ResourceId, ResourceInfo>,
    flattened: Option<ResourceInfo>,
}

impl PrefixInfo {
    pub fn is_empty(&self) -> bool {
        self.by_resource.is_empty()
    }

    pub fn has_resource(&self, resource: &ResourceId) -> bool {
        self.by_resource.contains_key(resource)
    }

    /// Merges one resource's contribution. Returns whether anything
    /// changed. A contribution that ends up invalid is dropped.
    pub fn merge_resource(
        &mut self,
        resource: &ResourceId,
        attrs: &Attributes,
        source: Source,
    ) -> bool {
        let info = self
            .by_resource
            .entry(resource.clone())
            .or_insert_with(|| ResourceInfo::new(source));
        let changed = info.merge(attrs, source);
        if !info.is_valid() {
            self.by_resource.remove(resource);
        }
        if changed {
            self.flattened = None;
        }
        changed
    }

    /// Unmerges one resource's contribution, dropping the contribution
    /// entirely once it no longer asserts anything. Returns whether
    /// anything changed.
    pub fn unmerge_resource(
        &mut self,
        resource: &ResourceId,
        attrs: &Attributes,
    ) -> bool {
        let Some(info) = self.by_resource.get_mut(resource) else {
            return false;
        };
        let changed = info.unmerge(attrs);
        if !info.is_valid() {
            self.by_resource.remove(resource);
            self.flattened = None;
            return true;
        }
        if changed {
            self.flattened = None;
        }
        changed
    }

    /// Computes the flattened union across all contributions.
    ///
    /// Contributors are visited in descending source precedence; ties are
    /// broken by ascending resource id so the outcome never depends on
    /// insertion order. Label names already claimed by a higher-precedence
    /// contributor are not overwritten, scalars keep the first (highest
    /// precedence) value, and the result's source is the highest among
    /// contributors.
    pub fn flatten(&self) -> ResourceInfo {
        let mut contributors: Vec<(&ResourceId, &ResourceInfo)> =
            self.by_resource.iter().collect();
        contributors.sort_by(|(a_id, a), (b_id, b)| {
            b.source.cmp(&a.source).then_with(|| a_id.cmp(b_id))
        });

        let mut flat = ResourceInfo::default();
        for (_, info) in contributors {
            flat.labels.merge_missing(&info.labels);
            if flat.tunnel_peer.is_none() {
                flat.tunnel_peer = info.tunnel_peer;
            }
            if flat.encrypt_key.is_none() {
                flat.encrypt_key = info.encrypt_key;
            }
            if flat.endpoint_flags.is_none() {
                flat.endpoint_flags = info.endpoint_flags;
            }
            flat.identity_override |= info.identity_override;
            if flat.requested_identity.is_none() {
                flat.requested_identity = info.requested_identity;
            }
            if info.source > flat.source {
                flat.source = info.source;
            }
        }
        flat
    }

    /// The cached flattened view, recomputing it first if a mutation
    /// cleared it.
    pub fn flattened(&mut self) -> &ResourceInfo {
        if self.flattened.is_none() {
            self.flattened = Some(self.flatten());
        }
        // Just written above when it was empty.
        self.flattened.as_ref().unwrap()
    }
}
