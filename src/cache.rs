//! The public surface of the metadata cache.
//!
//! An [`IpCache`] owns the metadata store, the label injector and the
//! controller thread driving it. Producers feed it contributions through
//! [`upsert`](IpCache::upsert) and [`remove`](IpCache::remove) and may
//! block on [`wait_for_revision`](IpCache::wait_for_revision) until their
//! change reached the datapath.

use std::collections::BTreeSet;
use std::sync::Arc;

use inetnum::addr::Prefix;

use crate::config::Config;
use crate::controller::Controller;
use crate::downstream::{
    IdentityAllocator, IdentityUpdater, IpCacheWriter,
};
use crate::injector::LabelInjector;
use crate::metrics::Metrics;
use crate::resolver;
use crate::store::{FlattenedEntry, MetadataStore};
use crate::sync::{CacheStatus, CancelToken};
use crate::types::errors::IpCacheError;
use crate::types::labels::LabelSet;
use crate::types::prefix_cluster::{ClusterId, PrefixCluster};
use crate::types::resource_info::{
    Attributes, EncryptKey, EndpointFlags, ResourceId, TunnelPeer,
};
use crate::types::source::Source;

//------------ Collaborators -------------------------------------------------

/// The downstream collaborators an [`IpCache`] is wired to.
pub struct Collaborators {
    pub allocator: Arc<dyn IdentityAllocator>,
    pub updater: Arc<dyn IdentityUpdater>,
    pub writer: Arc<dyn IpCacheWriter>,
    pub cache_status: CacheStatus,
}

//------------ PrefixMetadata ------------------------------------------------

/// The resolved view of a prefix: the labels it will be matched under,
/// after parent inheritance and the in-cluster invariants, plus the
/// flattened scalar attributes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PrefixMetadata {
    pub labels: LabelSet,
    pub source: Source,
    pub tunnel_peer: Option<TunnelPeer>,
    pub encrypt_key: Option<EncryptKey>,
    pub endpoint_flags: Option<EndpointFlags>,
}

//------------ IpCache -------------------------------------------------------

/// The IP-to-identity metadata cache with label injection.
pub struct IpCache {
    store: Arc<MetadataStore>,
    controller: Controller,
    config: Config,
    metrics: Arc<Metrics>,
}

impl IpCache {
    pub fn new(
        config: Config,
        collaborators: Collaborators,
    ) -> Result<Self, IpCacheError> {
        let metrics = Arc::new(Metrics::new()?);
        let store = Arc::new(MetadataStore::new(metrics.clone()));
        let injector = Arc::new(LabelInjector::new(
            store.clone(),
            collaborators.allocator,
            collaborators.updater,
            collaborators.writer,
            collaborators.cache_status,
            config.clone(),
            metrics.clone(),
        ));
        let controller = Controller::spawn(
            "ipcache-inject-labels",
            config.max_retry_interval,
            move |cancel| injector.inject_labels(cancel),
        );
        Ok(IpCache {
            store,
            controller,
            config,
            metrics,
        })
    }

    //--- Mutation

    /// Merges one resource's contribution for a prefix and schedules
    /// injection. Returns the revision to wait for.
    pub fn upsert(
        &self,
        prefix: Prefix,
        cluster_id: ClusterId,
        source: Source,
        resource: &ResourceId,
        attrs: &Attributes,
    ) -> u64 {
        let prefix = PrefixCluster::new(prefix, cluster_id);
        let affected =
            self.store.upsert_metadata(prefix, source, resource, attrs);
        let rev = self.store.enqueue_prefix_updates(&affected);
        self.controller.trigger();
        rev
    }

    /// Retracts (parts of) one resource's contribution and schedules
    /// injection. Returns the revision to wait for.
    pub fn remove(
        &self,
        prefix: Prefix,
        cluster_id: ClusterId,
        resource: &ResourceId,
        attrs: &Attributes,
    ) -> u64 {
        let prefix = PrefixCluster::new(prefix, cluster_id);
        let affected =
            self.store.remove_metadata(prefix, resource, attrs);
        let rev = self.store.enqueue_prefix_updates(&affected);
        self.controller.trigger();
        rev
    }

    /// Removes `labels` as contributed by `resource` from every prefix
    /// not in `excluded`, and schedules injection.
    pub fn remove_labels_excluded(
        &self,
        labels: &LabelSet,
        excluded: &BTreeSet<PrefixCluster>,
        resource: &ResourceId,
    ) -> u64 {
        let affected = self
            .store
            .remove_labels_excluded(labels, excluded, resource);
        let rev = self.store.enqueue_prefix_updates(&affected);
        self.controller.trigger();
        rev
    }

    //--- Access

    /// The resolved view of a prefix, or `None` when it is not tracked.
    pub fn get(
        &self,
        prefix: Prefix,
        cluster_id: ClusterId,
    ) -> Option<PrefixMetadata> {
        let prefix = PrefixCluster::new(prefix, cluster_id);
        self.store.with_inner(|inner| {
            let flat =
                inner.entries.get_mut(&prefix)?.flattened().clone();
            let labels = if flat.identity_override {
                flat.labels.clone()
            } else {
                resolver::resolved_labels(
                    inner,
                    &prefix,
                    &flat.labels,
                    &self.config,
                )
            };
            Some(PrefixMetadata {
                labels,
                source: flat.source,
                tunnel_peer: flat.tunnel_peer,
                encrypt_key: flat.encrypt_key,
                endpoint_flags: flat.endpoint_flags,
            })
        })
    }

    /// The source of the flattened metadata for a prefix.
    pub fn metadata_source(
        &self,
        prefix: Prefix,
        cluster_id: ClusterId,
    ) -> Option<Source> {
        self.store
            .metadata_source(&PrefixCluster::new(prefix, cluster_id))
    }

    /// All prefixes whose flattened labels are a superset of `subset`.
    pub fn filter_by_labels(
        &self,
        subset: &LabelSet,
    ) -> Vec<PrefixCluster> {
        self.store.filter_by_labels(subset)
    }

    //--- Injection control

    /// Kicks the injector. Idempotent; pending kicks coalesce.
    pub fn trigger_label_injection(&self) {
        self.controller.trigger();
    }

    /// Blocks until all changes enqueued at or before `rev` have been
    /// injected, or `cancel` fires.
    pub fn wait_for_revision(
        &self,
        cancel: &CancelToken,
        rev: u64,
    ) -> Result<(), IpCacheError> {
        self.store.wait_for_revision(cancel, rev)
    }

    pub fn injected_revision(&self) -> u64 {
        self.store.injected_revision()
    }

    //--- Observability

    /// The flattened view of every tracked prefix.
    pub fn dump_flattened(&self) -> Vec<FlattenedEntry> {
        self.store.dump()
    }

    /// The flattened view of every tracked prefix, rendered as JSON.
    pub fn dump_flattened_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.store.dump())
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    /// Stops the injector controller. Also happens on drop.
    pub fn shutdown(&self) {
        self.controller.shutdown();
    }
}
