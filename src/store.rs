//! The metadata store: every prefix observed in the cluster, the label
//! contributions each resource made for it, and the machinery that tells
//! the injector what changed.
//!
//! Lock order, outermost first: the metadata lock (`inner`), then the
//! downstream IPCache writer lock, then the reserved-host label lock. The
//! queue lock and the revision lock are independent and only ever held for
//! short critical sections.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde_derive::Serialize;

use crate::metrics::Metrics;
use crate::sync::CancelToken;
use crate::trie::ClusterTries;
use crate::types::errors::IpCacheError;
use crate::types::labels::{LabelSet, LABEL_KUBE_APISERVER};
use crate::types::prefix_cluster::{ClusterId, PrefixCluster};
use crate::types::resource_info::{
    Attributes, EncryptKey, EndpointFlags, PrefixInfo, ResourceId,
    ResourceInfo, TunnelPeer,
};
use crate::types::source::Source;

//------------ StoreInner ----------------------------------------------------

/// The map and the tries, guarded together by the metadata lock. Every
/// prefix in the map is in the trie for its cluster, and vice versa.
pub(crate) struct StoreInner {
    pub(crate) entries: HashMap<PrefixCluster, PrefixInfo>,
    pub(crate) tries: ClusterTries,
}

struct QueueState {
    queue: BTreeSet<PrefixCluster>,
    queue_rev: u64,
}

struct RevisionState {
    injected: Mutex<u64>,
    cv: Condvar,
}

//------------ MetadataStore -------------------------------------------------

/// Maps `(prefix, cluster)` to the merged metadata contributed for it and
/// queues changed prefixes for the label injector.
pub struct MetadataStore {
    inner: Mutex<StoreInner>,
    queue: Mutex<QueueState>,
    revision: Arc<RevisionState>,
    reserved_host: Mutex<BTreeMap<PrefixCluster, LabelSet>>,
    metrics: Arc<Metrics>,
}

impl MetadataStore {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        MetadataStore {
            inner: Mutex::new(StoreInner {
                entries: HashMap::new(),
                tries: ClusterTries::default(),
            }),
            queue: Mutex::new(QueueState {
                queue: BTreeSet::new(),
                queue_rev: 1,
            }),
            revision: Arc::new(RevisionState {
                injected: Mutex::new(0),
                cv: Condvar::new(),
            }),
            reserved_host: Mutex::new(BTreeMap::new()),
            metrics,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    //--- Metadata mutation

    /// Merges one resource's contribution for a prefix. Returns the
    /// prefixes whose flattened view may have changed: the prefix itself
    /// plus all its descendants, or nothing when the merge was a no-op.
    pub fn upsert_metadata(
        &self,
        prefix: PrefixCluster,
        source: Source,
        resource: &ResourceId,
        attrs: &Attributes,
    ) -> Vec<PrefixCluster> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if !inner.entries.contains_key(&prefix) {
            let mut info = PrefixInfo::default();
            info.merge_resource(resource, attrs, source);
            if info.is_empty() {
                // Nothing valid was contributed; nothing to insert.
                return Vec::new();
            }
            inner.entries.insert(prefix, info);
            inner.tries.upsert(&prefix);
            self.metrics.prefixes.set(inner.entries.len() as i64);
            return affected_set(&inner.tries, prefix);
        }

        let (changed, now_empty, before, after) = {
            // Present per the check above.
            let info = inner.entries.get_mut(&prefix).unwrap();
            let before = info.flatten();
            let changed = info.merge_resource(resource, attrs, source);
            let now_empty = info.is_empty();
            let after = if changed && !now_empty {
                Some(info.flattened().clone())
            } else {
                None
            };
            (changed, now_empty, before, after)
        };
        if !changed {
            return Vec::new();
        }
        if now_empty {
            let affected = affected_set(&inner.tries, prefix);
            inner.entries.remove(&prefix);
            inner.tries.remove(&prefix);
            self.metrics.prefixes.set(inner.entries.len() as i64);
            return affected;
        }
        if after.as_ref() == Some(&before) {
            // The contribution changed but the flattened view did not.
            return Vec::new();
        }
        affected_set(&inner.tries, prefix)
    }

    /// Retracts (parts of) one resource's contribution for a prefix. The
    /// affected set is computed before any deletion, so it includes the
    /// prefix even when this removal destroys the entry.
    pub fn remove_metadata(
        &self,
        prefix: PrefixCluster,
        resource: &ResourceId,
        attrs: &Attributes,
    ) -> Vec<PrefixCluster> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let affected = remove_locked(inner, prefix, resource, attrs);
        self.metrics.prefixes.set(inner.entries.len() as i64);
        affected
    }

    /// Removes `labels` as contributed by `resource` from every prefix
    /// except the excluded ones.
    ///
    /// When a prefix's flattened view consists of exactly the
    /// kube-apiserver label and a world label, the world label joins the
    /// removal set, so the kube-apiserver label cannot linger alone on an
    /// orphaned identity.
    pub fn remove_labels_excluded(
        &self,
        labels: &LabelSet,
        excluded: &BTreeSet<PrefixCluster>,
        resource: &ResourceId,
    ) -> Vec<PrefixCluster> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let mut plans: Vec<(PrefixCluster, Attributes)> = Vec::new();
        for (prefix, info) in inner.entries.iter_mut() {
            if excluded.contains(prefix) || !info.has_resource(resource) {
                continue;
            }
            let flat = info.flattened();
            let mut to_remove = labels.clone();
            if flat.labels.len() == 2
                && flat.labels.has_reserved(LABEL_KUBE_APISERVER)
            {
                if let Some(world) =
                    flat.labels.iter().find(|l| l.is_world()).cloned()
                {
                    to_remove.insert(world);
                }
            }
            plans.push((*prefix, Attributes::labels(to_remove)));
        }

        let mut affected = BTreeSet::new();
        for (prefix, attrs) in plans {
            affected
                .extend(remove_locked(inner, prefix, resource, &attrs));
        }
        self.metrics.prefixes.set(inner.entries.len() as i64);
        affected.into_iter().collect()
    }

    //--- Metadata access

    /// A deep copy of the flattened view for a prefix, recomputing and
    /// caching it first if needed.
    pub fn get(&self, prefix: &PrefixCluster) -> Option<ResourceInfo> {
        let mut guard = self.inner.lock();
        guard
            .entries
            .get_mut(prefix)
            .map(|info| info.flattened().clone())
    }

    /// The source of the flattened view for a prefix.
    pub fn metadata_source(&self, prefix: &PrefixCluster) -> Option<Source> {
        self.get(prefix).map(|flat| flat.source)
    }

    /// All prefixes whose flattened labels are a superset of `subset`.
    pub fn filter_by_labels(&self, subset: &LabelSet) -> Vec<PrefixCluster> {
        let mut guard = self.inner.lock();
        let mut found: Vec<PrefixCluster> = guard
            .entries
            .iter_mut()
            .filter_map(|(prefix, info)| {
                info.flattened()
                    .labels
                    .is_superset_of(subset)
                    .then_some(*prefix)
            })
            .collect();
        found.sort();
        found
    }

    /// Runs a closure with the metadata lock held. The injector uses this
    /// for its per-chunk decision phase so every resolution reads the
    /// latest flattened views.
    pub(crate) fn with_inner<R>(
        &self,
        f: impl FnOnce(&mut StoreInner) -> R,
    ) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }

    //--- Change queue and revisions

    /// Adds prefixes to the change queue and returns the revision that
    /// will cover them once a dequeued batch with that revision has been
    /// injected.
    pub fn enqueue_prefix_updates(
        &self,
        prefixes: &[PrefixCluster],
    ) -> u64 {
        let mut q = self.queue.lock();
        q.queue.extend(prefixes.iter().copied());
        self.metrics.queue_depth.set(q.queue.len() as i64);
        q.queue_rev
    }

    /// Snapshots and clears the queue. Returns the batch and the revision
    /// that, once injected, satisfies every waiter at or below it.
    pub fn dequeue_prefix_updates(&self) -> (Vec<PrefixCluster>, u64) {
        let mut q = self.queue.lock();
        let batch: Vec<PrefixCluster> =
            std::mem::take(&mut q.queue).into_iter().collect();
        let rev = q.queue_rev;
        q.queue_rev += 1;
        self.metrics.queue_depth.set(0);
        (batch, rev)
    }

    /// Publishes that all changes up to `rev` have been injected and
    /// wakes all revision waiters.
    pub fn set_injected_revision(&self, rev: u64) {
        let mut injected = self.revision.injected.lock();
        if rev > *injected {
            *injected = rev;
        }
        self.revision.cv.notify_all();
    }

    pub fn injected_revision(&self) -> u64 {
        *self.revision.injected.lock()
    }

    /// Blocks until the injected revision reaches `rev` or `cancel`
    /// fires. Cancellation broadcasts through the revision condvar, so
    /// the wait never polls.
    pub fn wait_for_revision(
        &self,
        cancel: &CancelToken,
        rev: u64,
    ) -> Result<(), IpCacheError> {
        let notifier = {
            let revision = self.revision.clone();
            cancel.subscribe(Box::new(move || {
                let guard = revision.injected.lock();
                drop(guard);
                revision.cv.notify_all();
            }))
        };
        let mut injected = self.revision.injected.lock();
        let result = loop {
            if *injected >= rev {
                break Ok(());
            }
            if cancel.is_cancelled() {
                break Err(IpCacheError::Cancelled);
            }
            self.revision.cv.wait(&mut injected);
        };
        drop(injected);
        cancel.unsubscribe(notifier);
        result
    }

    //--- Reserved-host labels

    /// Records the resolved labels of a host prefix and returns the union
    /// across all host prefixes, which becomes the label set of the fixed
    /// host identity.
    pub(crate) fn host_labels_insert(
        &self,
        prefix: PrefixCluster,
        labels: LabelSet,
    ) -> LabelSet {
        let mut hosts = self.reserved_host.lock();
        hosts.insert(prefix, labels);
        host_union(&hosts)
    }

    /// Forgets a prefix's host labels and returns the remaining union.
    pub(crate) fn host_labels_remove(
        &self,
        prefix: &PrefixCluster,
    ) -> LabelSet {
        let mut hosts = self.reserved_host.lock();
        hosts.remove(prefix);
        host_union(&hosts)
    }

    //--- Observability

    /// The flattened view of every stored prefix, for debugging tools.
    pub fn dump(&self) -> Vec<FlattenedEntry> {
        let mut guard = self.inner.lock();
        let mut entries: Vec<FlattenedEntry> = guard
            .entries
            .iter_mut()
            .map(|(prefix, info)| {
                let flat = info.flattened();
                FlattenedEntry {
                    prefix: prefix.prefix().to_string(),
                    cluster_id: prefix.cluster_id(),
                    source: flat.source,
                    labels: flat.labels.clone(),
                    tunnel_peer: flat.tunnel_peer,
                    encrypt_key: flat.encrypt_key,
                    endpoint_flags: flat.endpoint_flags,
                    identity_override: flat.identity_override,
                }
            })
            .collect();
        entries.sort_by(|a, b| {
            (a.cluster_id, &a.prefix).cmp(&(b.cluster_id, &b.prefix))
        });
        entries
    }
}

fn affected_set(
    tries: &ClusterTries,
    prefix: PrefixCluster,
) -> Vec<PrefixCluster> {
    let mut affected = vec![prefix];
    for descendant in tries.descendants(&prefix) {
        if descendant != prefix {
            affected.push(descendant);
        }
    }
    affected
}

fn remove_locked(
    inner: &mut StoreInner,
    prefix: PrefixCluster,
    resource: &ResourceId,
    attrs: &Attributes,
) -> Vec<PrefixCluster> {
    let (changed, now_empty, before, after) = {
        let Some(info) = inner.entries.get_mut(&prefix) else {
            return Vec::new();
        };
        let before = info.flatten();
        let changed = info.unmerge_resource(resource, attrs);
        let now_empty = info.is_empty();
        let after = if changed && !now_empty {
            Some(info.flattened().clone())
        } else {
            None
        };
        (changed, now_empty, before, after)
    };
    if !changed {
        return Vec::new();
    }
    let affected = affected_set(&inner.tries, prefix);
    if now_empty {
        inner.entries.remove(&prefix);
        inner.tries.remove(&prefix);
        return affected;
    }
    if after.as_ref() == Some(&before) {
        return Vec::new();
    }
    affected
}

fn host_union(hosts: &BTreeMap<PrefixCluster, LabelSet>) -> LabelSet {
    let mut union = LabelSet::new();
    for labels in hosts.values() {
        for label in labels.iter() {
            union.insert(label.clone());
        }
    }
    union
}

//------------ FlattenedEntry ------------------------------------------------

/// One row of the observability dump.
#[derive(Clone, Debug, Serialize)]
pub struct FlattenedEntry {
    pub prefix: String,
    pub cluster_id: ClusterId,
    pub source: Source,
    pub labels: LabelSet,
    pub tunnel_peer: Option<TunnelPeer>,
    pub encrypt_key: Option<EncryptKey>,
    pub endpoint_flags: Option<EndpointFlags>,
    pub identity_override: bool,
}
