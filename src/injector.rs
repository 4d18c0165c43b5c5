//! The label injector: drains the change queue and turns metadata into
//! datapath state.
//!
//! Every run dequeues a batch, splits it into chunks, and for each chunk
//! decides under the metadata lock what the downstream table should look
//! like. The decisions are then applied in a strict order: policy
//! selectors learn about new identities first, then table entries are
//! replaced, then deleted, and only then are old identity references
//! released. Deviating from that order opens windows in which the
//! datapath maps traffic to an identity the policy engine does not know,
//! which drops traffic.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::config::Config;
use crate::downstream::{
    IdentityAllocator, IdentityUpdater, IpCacheEntry, IpCacheWriter,
    ShadowEntry,
};
use crate::metrics::Metrics;
use crate::resolver;
use crate::store::MetadataStore;
use crate::sync::{CacheStatus, CancelToken};
use crate::types::errors::IpCacheError;
use crate::types::identity::{Identity, IDENTITY_HOST};
use crate::types::labels::LabelSet;
use crate::types::prefix_cluster::PrefixCluster;

//------------ Injector state ------------------------------------------------

#[derive(Default)]
struct InjectorState {
    first_batch_done: bool,
    /// Entries restored to their legacy owner, still tracked so they can
    /// be force-deleted once their identity dies.
    unmanaged: BTreeSet<PrefixCluster>,
    /// Mirror of the downstream table, prefix to identity.
    prefix_identity: HashMap<PrefixCluster, Identity>,
    /// Reverse index, identity to the prefixes mapped to it. Updated in
    /// step with every table write.
    identity_prefixes: HashMap<Identity, BTreeSet<PrefixCluster>>,
}

impl InjectorState {
    fn record_entry(&mut self, prefix: PrefixCluster, identity: Identity) {
        if let Some(old) = self.prefix_identity.insert(prefix, identity) {
            if old != identity {
                self.unlink(old, &prefix);
            }
        }
        self.identity_prefixes
            .entry(identity)
            .or_default()
            .insert(prefix);
    }

    fn forget_entry(&mut self, prefix: &PrefixCluster) {
        if let Some(old) = self.prefix_identity.remove(prefix) {
            self.unlink(old, prefix);
        }
        self.unmanaged.remove(prefix);
    }

    fn unlink(&mut self, identity: Identity, prefix: &PrefixCluster) {
        if let Some(set) = self.identity_prefixes.get_mut(&identity) {
            set.remove(prefix);
            if set.is_empty() {
                self.identity_prefixes.remove(&identity);
            }
        }
    }
}

struct PendingReplace {
    prefix: PrefixCluster,
    entry: IpCacheEntry,
    force: bool,
    /// Whether the entry's identity reference was taken by this chunk's
    /// resolution and is still unbalanced.
    allocated: bool,
}

struct ChunkFailure {
    remaining: Vec<PrefixCluster>,
    error: IpCacheError,
}

//------------ LabelInjector -------------------------------------------------

/// Orchestrates identity allocation, policy-selector updates and datapath
/// table writes for batches of changed prefixes.
pub struct LabelInjector {
    store: Arc<MetadataStore>,
    allocator: Arc<dyn IdentityAllocator>,
    updater: Arc<dyn IdentityUpdater>,
    writer: Arc<dyn IpCacheWriter>,
    cache_status: CacheStatus,
    config: Config,
    metrics: Arc<Metrics>,
    state: Mutex<InjectorState>,
}

impl LabelInjector {
    pub fn new(
        store: Arc<MetadataStore>,
        allocator: Arc<dyn IdentityAllocator>,
        updater: Arc<dyn IdentityUpdater>,
        writer: Arc<dyn IpCacheWriter>,
        cache_status: CacheStatus,
        config: Config,
        metrics: Arc<Metrics>,
    ) -> Self {
        LabelInjector {
            store,
            allocator,
            updater,
            writer,
            cache_status,
            config,
            metrics,
            state: Mutex::new(InjectorState::default()),
        }
    }

    /// One injection run. Dequeues the pending batch and injects it chunk
    /// by chunk; on failure the unprocessed prefixes are re-enqueued and
    /// the error is returned for the controller to retry with backoff.
    pub fn inject_labels(
        &self,
        cancel: &CancelToken,
    ) -> Result<(), IpCacheError> {
        self.cache_status.wait(cancel)?;

        let (batch, rev) = self.store.dequeue_prefix_updates();
        if !self.allocator.is_initialized() {
            self.store.enqueue_prefix_updates(&batch);
            self.metrics.injection_errors.inc();
            return Err(IpCacheError::AllocatorUninitialized);
        }

        let timer = self.metrics.injection_duration.start_timer();

        // The first batch runs unchunked: there is nothing to release
        // yet, so chunking would not bound the identity watermark.
        let chunk_size = if self.state.lock().first_batch_done {
            self.config.chunk_size.max(1)
        } else {
            batch.len().max(1)
        };

        let chunks: Vec<&[PrefixCluster]> =
            batch.chunks(chunk_size).collect();
        for (i, chunk) in chunks.iter().enumerate() {
            if let Err(failure) = self.inject_chunk(chunk, cancel) {
                let mut leftover = failure.remaining;
                for later in &chunks[i + 1..] {
                    leftover.extend_from_slice(later);
                }
                warn!(
                    "label injection failed, re-enqueueing {} prefixes: {}",
                    leftover.len(),
                    failure.error
                );
                self.store.enqueue_prefix_updates(&leftover);
                self.metrics.injection_errors.inc();
                self.update_identity_gauge();
                drop(timer);
                return Err(failure.error);
            }
        }
        timer.observe_duration();

        self.store.set_injected_revision(rev);
        self.state.lock().first_batch_done = true;
        self.update_identity_gauge();
        Ok(())
    }

    fn update_identity_gauge(&self) {
        let state = self.state.lock();
        self.metrics
            .identities
            .set(state.identity_prefixes.len() as i64);
    }

    /// Decides and applies one chunk.
    ///
    /// The decision loop runs under the metadata lock so it always reads
    /// the latest flattened views. A resolution failure stops the chunk at
    /// that prefix; decisions already made are still applied and the
    /// suffix is reported back for retry.
    fn inject_chunk(
        &self,
        chunk: &[PrefixCluster],
        cancel: &CancelToken,
    ) -> Result<(), ChunkFailure> {
        let mut state = self.state.lock();

        let mut to_replace: Vec<PendingReplace> = Vec::new();
        let mut to_delete: Vec<(PrefixCluster, IpCacheEntry)> = Vec::new();
        let mut ids_to_add: HashMap<Identity, LabelSet> = HashMap::new();
        let mut previously_allocated: HashMap<PrefixCluster, Identity> =
            HashMap::new();
        let mut newly_allocated: Vec<Identity> = Vec::new();
        let mut failure: Option<(Vec<PrefixCluster>, IpCacheError)> = None;

        self.store.with_inner(|inner| {
            for (idx, prefix) in chunk.iter().enumerate() {
                let old = self.writer.lookup(prefix);
                let flat = inner
                    .entries
                    .get_mut(prefix)
                    .map(|info| info.flattened().clone());

                match (old, flat) {
                    (None, None) => {}

                    (old, Some(flat)) => {
                        let resolved = match resolver::resolve_identity(
                            self.store.as_ref(),
                            inner,
                            self.allocator.as_ref(),
                            &self.config,
                            prefix,
                            &flat,
                        ) {
                            Ok(resolved) => resolved,
                            Err(err) => {
                                warn!(
                                    "failed to resolve an identity for \
                                     {}: {}",
                                    prefix, err
                                );
                                failure = Some((
                                    chunk[idx..].to_vec(),
                                    err.into(),
                                ));
                                break;
                            }
                        };

                        // The host identity's labels are mutable even
                        // though its numeric value is fixed, so it is
                        // always pushed to the selectors.
                        if resolved.identity == IDENTITY_HOST {
                            ids_to_add.insert(
                                IDENTITY_HOST,
                                resolved.labels.clone(),
                            );
                        }

                        let mut entry = IpCacheEntry {
                            identity: resolved.identity,
                            source: flat.source,
                            tunnel_peer: flat.tunnel_peer,
                            encrypt_key: flat.encrypt_key,
                            endpoint_flags: flat.endpoint_flags,
                            from_metadata: true,
                            shadow: None,
                        };
                        if let Some(old) = &old {
                            entry.shadow = if old.from_metadata {
                                old.shadow
                            } else {
                                Some(ShadowEntry {
                                    source: old.source,
                                    identity: old.identity,
                                })
                            };
                        }

                        if let Some(old) = &old {
                            if old.same_datapath_state(&entry) {
                                // Nothing to write; drop the reference
                                // this resolution took.
                                if resolved.allocated {
                                    self.allocator
                                        .release_local_identities(&[
                                            resolved.identity,
                                        ]);
                                }
                                state.record_entry(
                                    *prefix,
                                    resolved.identity,
                                );
                                continue;
                            }
                        }

                        if resolved.allocated {
                            newly_allocated.push(resolved.identity);
                        }
                        if resolved.is_new {
                            ids_to_add.insert(
                                resolved.identity,
                                resolved.labels.clone(),
                            );
                        }

                        let force = old
                            .as_ref()
                            .is_some_and(|o| entry.source < o.source);
                        if let Some(old) = &old {
                            if old.identity == IDENTITY_HOST
                                && resolved.identity != IDENTITY_HOST
                            {
                                let union =
                                    self.store.host_labels_remove(prefix);
                                ids_to_add.insert(IDENTITY_HOST, union);
                            }
                            if old.from_metadata
                                && old.identity != IDENTITY_HOST
                            {
                                previously_allocated
                                    .insert(*prefix, old.identity);
                            }
                        }
                        to_replace.push(PendingReplace {
                            prefix: *prefix,
                            entry,
                            force,
                            allocated: resolved.allocated,
                        });
                    }

                    (Some(old), None) => {
                        if !old.from_metadata {
                            // Entirely the legacy writer's entry; its
                            // lifecycle is not ours.
                            continue;
                        }
                        if let Some(shadow) = old.shadow {
                            // Shared with the legacy path: restore the
                            // legacy fact and keep watching the prefix.
                            to_replace.push(PendingReplace {
                                prefix: *prefix,
                                entry: IpCacheEntry::legacy(
                                    shadow.identity,
                                    shadow.source,
                                ),
                                force: true,
                                allocated: false,
                            });
                            state.unmanaged.insert(*prefix);
                        } else {
                            to_delete.push((*prefix, old.clone()));
                        }
                        if old.identity == IDENTITY_HOST {
                            let union =
                                self.store.host_labels_remove(prefix);
                            ids_to_add.insert(IDENTITY_HOST, union);
                        } else {
                            previously_allocated
                                .insert(*prefix, old.identity);
                        }
                    }
                }
            }
        });

        // Selectors must know every identity before any table entry can
        // map traffic to it.
        if !ids_to_add.is_empty() {
            let done = self
                .updater
                .update_identities(&ids_to_add, &HashMap::new());
            if done.wait(cancel).is_err() {
                // Nothing was applied; balance this chunk's references
                // and hand the whole chunk back.
                if !newly_allocated.is_empty() {
                    self.allocator
                        .release_local_identities(&newly_allocated);
                }
                return Err(ChunkFailure {
                    remaining: chunk.to_vec(),
                    error: IpCacheError::Cancelled,
                });
            }
        }

        // Replaces before deletes, so no prefix transits through an
        // unknown state while its neighbors are rewritten.
        for pending in &to_replace {
            match self.writer.upsert(
                &pending.prefix,
                pending.entry.clone(),
                pending.force,
            ) {
                Ok(()) => {
                    if self.config.debug_logging {
                        debug!(
                            "upserted {} with identity {}",
                            pending.prefix, pending.entry.identity
                        );
                    }
                    state.record_entry(
                        pending.prefix,
                        pending.entry.identity,
                    );
                }
                Err(err) if err.identity_unchanged() => {
                    // The same fact arrived through two paths.
                    debug!("{}: {}", pending.prefix, err);
                    state.record_entry(
                        pending.prefix,
                        pending.entry.identity,
                    );
                }
                Err(err) => {
                    error!(
                        "{}: {} Traffic may be disrupted.",
                        pending.prefix, err
                    );
                    // The entry stays as it was: keep our reference on
                    // the old identity and drop the unused new one.
                    previously_allocated.remove(&pending.prefix);
                    if pending.allocated {
                        self.allocator.release_local_identities(&[
                            pending.entry.identity,
                        ]);
                    }
                }
            }
        }

        for (prefix, old) in &to_delete {
            self.writer.delete(prefix);
            state.forget_entry(prefix);
            if self.config.debug_logging {
                debug!(
                    "deleted {} (was identity {})",
                    prefix, old.identity
                );
            }
        }

        // Only now may references drop, after the datapath stopped
        // pointing at the old identities.
        let released: Vec<Identity> =
            previously_allocated.values().copied().collect();
        let freed = if released.is_empty() {
            Vec::new()
        } else {
            self.allocator.release_local_identities(&released)
        };

        // A freed identity may still be carried by an entry we restored
        // to its legacy owner. Those entries are now dead weight.
        for identity in freed {
            let Some(prefixes) = state.identity_prefixes.get(&identity)
            else {
                continue;
            };
            let stranded: Vec<PrefixCluster> = prefixes
                .intersection(&state.unmanaged)
                .copied()
                .collect();
            for prefix in stranded {
                warn!(
                    "force-deleting {} still mapped to released \
                     identity {}",
                    prefix, identity
                );
                self.writer.delete(&prefix);
                state.forget_entry(&prefix);
            }
        }

        match failure {
            Some((remaining, error)) => {
                Err(ChunkFailure { remaining, error })
            }
            None => Ok(()),
        }
    }
}
