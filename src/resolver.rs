//! Translates the flattened label set of a prefix into a numeric security
//! identity.
//!
//! Resolution happens in three layers. First the prefix inherits labels
//! from its ancestors in the trie, longest prefix first, keeping at most
//! one `cidr:` label. Then the in-cluster invariants rewrite the set:
//! prefixes belonging to the cluster must not look like world or CIDR
//! traffic, and everything else must. Finally the set is handed to the
//! identity allocator, except for local-cluster host prefixes, which all
//! share the fixed host identity with the union of their labels.

use log::{debug, log_enabled};

use crate::config::Config;
use crate::downstream::IdentityAllocator;
use crate::store::{MetadataStore, StoreInner};
use crate::types::errors::AllocatorError;
use crate::types::identity::{Identity, IDENTITY_HOST};
use crate::types::labels::{
    Label, LabelSet, LABEL_HEALTH, LABEL_HOST, LABEL_INGRESS,
    LABEL_REMOTE_NODE, LABEL_SOURCE_CIDR, LABEL_SOURCE_CIDRGROUP,
    LABEL_SOURCE_FQDN, LABEL_SOURCE_NODE, LABEL_WORLD_IPV4,
    LABEL_WORLD_IPV6,
};
use crate::types::prefix_cluster::PrefixCluster;
use crate::types::resource_info::ResourceInfo;

//------------ ResolvedIdentity ----------------------------------------------

#[derive(Clone, Debug)]
pub(crate) struct ResolvedIdentity {
    pub identity: Identity,
    /// Whether this resolution created the identity.
    pub is_new: bool,
    /// The labels the identity stands for. For the host identity this is
    /// the union across all host prefixes.
    pub labels: LabelSet,
    /// Whether this resolution took an allocator reference that must be
    /// balanced by a release.
    pub allocated: bool,
}

//------------ Label resolution ----------------------------------------------

/// The labels a prefix is resolved under: its own flattened labels, the
/// inherited ancestor labels, and the in-cluster invariants applied on
/// top.
pub(crate) fn resolved_labels(
    inner: &mut StoreInner,
    prefix: &PrefixCluster,
    base: &LabelSet,
    config: &Config,
) -> LabelSet {
    let mut labels = base.clone();

    // Inherit from ancestors, longest prefix first. Label names already
    // present are kept; only the first `cidr:` label survives.
    for ancestor in inner.tries.ancestors(prefix) {
        let Some(info) = inner.entries.get_mut(&ancestor) else {
            continue;
        };
        let ancestor_labels = info.flattened().labels.clone();
        for label in ancestor_labels.iter() {
            if label.source() == LABEL_SOURCE_CIDR {
                if !labels.has_label_source(LABEL_SOURCE_CIDR) {
                    labels.insert(label.clone());
                }
            } else {
                labels.insert_if_absent(label.clone());
            }
        }
    }

    apply_invariants(&mut labels, prefix, config);

    if config.debug_logging && log_enabled!(log::Level::Debug) {
        debug!("resolved labels for {}: {}", prefix, labels);
    }
    labels
}

/// The in-cluster invariants.
///
/// A node prefix carries `reserved:host` or `reserved:remote-node`; an
/// in-cluster prefix is a node or carries `reserved:health` or
/// `reserved:ingress`. In-cluster prefixes shed world and CIDR-ish labels,
/// everything else gains the world label of its family plus its own
/// `cidr:` label for policy matching.
fn apply_invariants(
    labels: &mut LabelSet,
    prefix: &PrefixCluster,
    config: &Config,
) {
    let is_node = labels.has_reserved(LABEL_HOST)
        || labels.has_reserved(LABEL_REMOTE_NODE);
    let in_cluster = is_node
        || labels.has_reserved(LABEL_HEALTH)
        || labels.has_reserved(LABEL_INGRESS);

    if in_cluster {
        labels.remove_world();
        if !(is_node && config.policy_cidr_matches_nodes) {
            labels.remove_label_source(LABEL_SOURCE_CIDR);
            labels.remove_label_source(LABEL_SOURCE_FQDN);
            labels.remove_label_source(LABEL_SOURCE_CIDRGROUP);
        }
    }
    if !(is_node && config.per_node_labels) {
        labels.remove_label_source(LABEL_SOURCE_NODE);
    }
    if labels.is_empty() {
        labels.insert(Label::cidr(&prefix.prefix()));
    }
    if !in_cluster {
        let world = if prefix.is_ipv4() {
            LABEL_WORLD_IPV4
        } else {
            LABEL_WORLD_IPV6
        };
        labels.insert(Label::reserved(world));
    }
    if labels.has_world() {
        // World prefixes are matched by policy through their own CIDR.
        labels.remove_label_source(LABEL_SOURCE_CIDR);
        labels.insert(Label::cidr(&prefix.prefix()));
    }
}

//------------ Identity resolution -------------------------------------------

/// Resolves the identity for a prefix from its flattened view.
///
/// With an identity override, the flattened labels go to the allocator
/// unmodified, bypassing inheritance and the invariants. Local-cluster
/// host prefixes route to the reserved-host merge path and never allocate.
pub(crate) fn resolve_identity(
    store: &MetadataStore,
    inner: &mut StoreInner,
    allocator: &dyn IdentityAllocator,
    config: &Config,
    prefix: &PrefixCluster,
    flat: &ResourceInfo,
) -> Result<ResolvedIdentity, AllocatorError> {
    if flat.identity_override {
        let allocated = allocator.allocate_local_identity(
            &flat.labels,
            flat.requested_identity,
        )?;
        return Ok(ResolvedIdentity {
            identity: allocated.identity,
            is_new: allocated.is_new,
            labels: flat.labels.clone(),
            allocated: true,
        });
    }

    let labels = resolved_labels(inner, prefix, &flat.labels, config);

    if prefix.in_local_cluster() && labels.has_reserved(LABEL_HOST) {
        let union = store.host_labels_insert(*prefix, labels);
        return Ok(ResolvedIdentity {
            identity: IDENTITY_HOST,
            is_new: false,
            labels: union,
            allocated: false,
        });
    }

    let allocated = allocator
        .allocate_local_identity(&labels, flat.requested_identity)?;
    Ok(ResolvedIdentity {
        identity: allocated.identity,
        is_new: allocated.is_new,
        labels,
        allocated: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::labels::{LABEL_WORLD, LABEL_WORLD_IPV4};
    use inetnum::addr::Prefix;
    use std::str::FromStr;

    fn pc(s: &str) -> PrefixCluster {
        PrefixCluster::new(Prefix::from_str(s).unwrap(), 0)
    }

    fn invariants(
        labels: &[Label],
        prefix: &str,
        config: &Config,
    ) -> LabelSet {
        let mut set: LabelSet = labels.iter().cloned().collect();
        apply_invariants(&mut set, &pc(prefix), config);
        set
    }

    #[test]
    fn test_world_prefix_gets_world_and_cidr() {
        let set = invariants(
            &[Label::new("k8s", "app", "web")],
            "10.0.0.1/32",
            &Config::default(),
        );
        assert!(set.has_reserved(LABEL_WORLD_IPV4));
        assert!(set.contains_name("cidr:10.0.0.1/32"));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_in_cluster_sheds_world_and_cidr() {
        let set = invariants(
            &[
                Label::reserved(LABEL_HEALTH),
                Label::reserved(LABEL_WORLD),
                Label::cidr(&Prefix::from_str("10.0.0.0/8").unwrap()),
            ],
            "10.0.0.5/32",
            &Config::default(),
        );
        assert!(!set.has_world());
        assert!(!set.has_label_source(LABEL_SOURCE_CIDR));
        assert!(set.has_reserved(LABEL_HEALTH));
    }

    #[test]
    fn test_node_keeps_cidr_only_when_configured() {
        let cidr = Label::cidr(&Prefix::from_str("10.0.0.0/8").unwrap());
        let host = Label::reserved(LABEL_HOST);

        let stripped = invariants(
            &[host.clone(), cidr.clone()],
            "10.0.0.1/32",
            &Config::default(),
        );
        assert!(!stripped.has_label_source(LABEL_SOURCE_CIDR));

        let config = Config {
            policy_cidr_matches_nodes: true,
            ..Config::default()
        };
        let kept = invariants(&[host, cidr], "10.0.0.1/32", &config);
        assert!(kept.has_label_source(LABEL_SOURCE_CIDR));
    }

    #[test]
    fn test_node_labels_stripped_unless_enabled() {
        let node_label = Label::new(LABEL_SOURCE_NODE, "role", "cp");
        let host = Label::reserved(LABEL_HOST);

        let stripped = invariants(
            &[host.clone(), node_label.clone()],
            "192.168.1.1/32",
            &Config::default(),
        );
        assert!(!stripped.has_label_source(LABEL_SOURCE_NODE));

        let config = Config {
            per_node_labels: true,
            ..Config::default()
        };
        let kept =
            invariants(&[host, node_label], "192.168.1.1/32", &config);
        assert!(kept.has_label_source(LABEL_SOURCE_NODE));

        // Never on non-node prefixes.
        let plain = invariants(
            &[Label::new(LABEL_SOURCE_NODE, "role", "cp")],
            "10.0.0.1/32",
            &config,
        );
        assert!(!plain.has_label_source(LABEL_SOURCE_NODE));
    }

    #[test]
    fn test_empty_set_falls_back_to_own_cidr() {
        let set = invariants(
            &[Label::new(LABEL_SOURCE_NODE, "role", "cp")],
            "10.0.0.0/8",
            &Config::default(),
        );
        // The node label is stripped, the set falls back to the CIDR and
        // then turns into a world prefix.
        assert!(set.contains_name("cidr:10.0.0.0/8"));
        assert!(set.has_reserved(LABEL_WORLD_IPV4));
    }

    #[test]
    fn test_ipv6_world_variant() {
        let set = invariants(
            &[Label::new("k8s", "app", "db")],
            "2001:db8::1/128",
            &Config::default(),
        );
        assert!(set.has_reserved(LABEL_WORLD_IPV6));
        assert!(set.contains_name("cidr:2001-db8--1/128"));
    }
}
