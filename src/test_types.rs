//! Reference collaborator implementations used by the integration tests.
//!
//! They behave like the real collaborators as far as this crate can
//! observe them: the allocator reference-counts identities per label set
//! and honors preferred ids, the updater completes synchronously, and the
//! writer keeps a table with source-precedence checks. Updater and writer
//! share a logical clock so tests can assert the order in which the
//! injector touched them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use crate::downstream::{
    AllocatedIdentity, IdentityAllocator, IdentityUpdater, IpCacheEntry,
    IpCacheWriter,
};
use crate::sync::DoneSignal;
use crate::types::errors::{AllocatorError, OverwriteError};
use crate::types::identity::{Identity, LOCAL_IDENTITY_BASE};
use crate::types::labels::LabelSet;
use crate::types::prefix_cluster::PrefixCluster;

/// The shared logical clock stamping updater and writer events.
pub fn logical_clock() -> Arc<AtomicU64> {
    Arc::new(AtomicU64::new(0))
}

//------------ CountingAllocator ---------------------------------------------

struct AllocEntry {
    labels: LabelSet,
    refcount: usize,
}

#[derive(Default)]
struct AllocState {
    by_labels: HashMap<String, Identity>,
    entries: HashMap<Identity, AllocEntry>,
    next: u32,
    fail_after: Option<usize>,
}

/// A local identity allocator with reference counting and failure
/// injection.
pub struct CountingAllocator {
    state: Mutex<AllocState>,
    initialized: AtomicBool,
}

impl Default for CountingAllocator {
    fn default() -> Self {
        CountingAllocator {
            state: Mutex::new(AllocState::default()),
            initialized: AtomicBool::new(true),
        }
    }
}

impl CountingAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_initialized(&self, initialized: bool) {
        self.initialized.store(initialized, Ordering::SeqCst);
    }

    /// Makes the allocation after the next `successes` successful ones
    /// fail exactly once.
    pub fn fail_after(&self, successes: usize) {
        self.state.lock().fail_after = Some(successes);
    }

    pub fn refcount(&self, identity: Identity) -> usize {
        self.state
            .lock()
            .entries
            .get(&identity)
            .map(|e| e.refcount)
            .unwrap_or(0)
    }

    pub fn identity_for(&self, labels: &LabelSet) -> Option<Identity> {
        self.state.lock().by_labels.get(&labels.to_string()).copied()
    }

    pub fn labels_for(&self, identity: Identity) -> Option<LabelSet> {
        self.state
            .lock()
            .entries
            .get(&identity)
            .map(|e| e.labels.clone())
    }

    /// The number of identities with a non-zero reference count.
    pub fn live_identities(&self) -> usize {
        self.state.lock().entries.len()
    }
}

impl IdentityAllocator for CountingAllocator {
    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn allocate_local_identity(
        &self,
        labels: &LabelSet,
        preferred: Option<Identity>,
    ) -> Result<AllocatedIdentity, AllocatorError> {
        let mut state = self.state.lock();
        match state.fail_after {
            Some(0) => {
                state.fail_after = None;
                return Err(AllocatorError::Exhausted);
            }
            Some(n) => state.fail_after = Some(n - 1),
            None => {}
        }

        let key = labels.to_string();
        if let Some(identity) = state.by_labels.get(&key).copied() {
            // Present in by_labels, so the entry exists.
            state.entries.get_mut(&identity).unwrap().refcount += 1;
            return Ok(AllocatedIdentity {
                identity,
                is_new: false,
            });
        }

        let identity = match preferred {
            Some(id)
                if id.is_local()
                    && !state.entries.contains_key(&id) =>
            {
                id
            }
            _ => loop {
                let candidate =
                    Identity(LOCAL_IDENTITY_BASE + state.next);
                state.next += 1;
                if !state.entries.contains_key(&candidate) {
                    break candidate;
                }
            },
        };
        state.by_labels.insert(key, identity);
        state.entries.insert(
            identity,
            AllocEntry {
                labels: labels.clone(),
                refcount: 1,
            },
        );
        Ok(AllocatedIdentity {
            identity,
            is_new: true,
        })
    }

    fn release_local_identities(&self, ids: &[Identity]) -> Vec<Identity> {
        let mut state = self.state.lock();
        let mut freed = Vec::new();
        for id in ids {
            let Some(entry) = state.entries.get_mut(id) else {
                warn!("release of non-existent local identity {}", id);
                continue;
            };
            entry.refcount -= 1;
            if entry.refcount == 0 {
                let labels_key = entry.labels.to_string();
                state.entries.remove(id);
                state.by_labels.remove(&labels_key);
                freed.push(*id);
            }
        }
        freed
    }
}

//------------ RecordingUpdater ----------------------------------------------

/// One call to the policy-selector updater.
#[derive(Clone, Debug)]
pub struct UpdateRecord {
    pub seq: u64,
    pub added: HashMap<Identity, LabelSet>,
    pub deleted: HashMap<Identity, LabelSet>,
}

/// An updater that records every batch and completes immediately.
pub struct RecordingUpdater {
    clock: Arc<AtomicU64>,
    records: Mutex<Vec<UpdateRecord>>,
}

impl RecordingUpdater {
    pub fn new(clock: Arc<AtomicU64>) -> Self {
        RecordingUpdater {
            clock,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn records(&self) -> Vec<UpdateRecord> {
        self.records.lock().clone()
    }

    /// The clock value of the first update that added `identity`.
    pub fn added_at(&self, identity: Identity) -> Option<u64> {
        self.records
            .lock()
            .iter()
            .find(|r| r.added.contains_key(&identity))
            .map(|r| r.seq)
    }

    /// The labels of the most recent addition of `identity`.
    pub fn last_added_labels(&self, identity: Identity) -> Option<LabelSet> {
        self.records
            .lock()
            .iter()
            .rev()
            .find_map(|r| r.added.get(&identity).cloned())
    }
}

impl IdentityUpdater for RecordingUpdater {
    fn update_identities(
        &self,
        added: &HashMap<Identity, LabelSet>,
        deleted: &HashMap<Identity, LabelSet>,
    ) -> DoneSignal {
        let seq = self.clock.fetch_add(1, Ordering::SeqCst);
        self.records.lock().push(UpdateRecord {
            seq,
            added: added.clone(),
            deleted: deleted.clone(),
        });
        DoneSignal::completed()
    }
}

//------------ TableWriter ---------------------------------------------------

/// An IPCache table that checks source precedence like the real writer.
pub struct TableWriter {
    clock: Arc<AtomicU64>,
    table: Mutex<HashMap<PrefixCluster, IpCacheEntry>>,
    upserted_at: Mutex<HashMap<PrefixCluster, u64>>,
}

impl TableWriter {
    pub fn new(clock: Arc<AtomicU64>) -> Self {
        TableWriter {
            clock,
            table: Mutex::new(HashMap::new()),
            upserted_at: Mutex::new(HashMap::new()),
        }
    }

    pub fn entry(&self, prefix: &PrefixCluster) -> Option<IpCacheEntry> {
        self.table.lock().get(prefix).cloned()
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    /// The clock value of the most recent upsert for `prefix`.
    pub fn upserted_at(&self, prefix: &PrefixCluster) -> Option<u64> {
        self.upserted_at.lock().get(prefix).copied()
    }
}

impl IpCacheWriter for TableWriter {
    fn lookup(&self, prefix: &PrefixCluster) -> Option<IpCacheEntry> {
        self.table.lock().get(prefix).cloned()
    }

    fn upsert(
        &self,
        prefix: &PrefixCluster,
        entry: IpCacheEntry,
        force: bool,
    ) -> Result<(), OverwriteError> {
        let mut table = self.table.lock();
        if let Some(existing) = table.get(prefix) {
            if !force {
                if entry.source < existing.source {
                    return Err(OverwriteError {
                        existing: existing.identity,
                        proposed: entry.identity,
                    });
                }
                if existing.same_datapath_state(&entry) {
                    return Err(OverwriteError {
                        existing: existing.identity,
                        proposed: entry.identity,
                    });
                }
            }
        }
        let seq = self.clock.fetch_add(1, Ordering::SeqCst);
        self.upserted_at.lock().insert(*prefix, seq);
        table.insert(*prefix, entry);
        Ok(())
    }

    fn delete(&self, prefix: &PrefixCluster) {
        self.table.lock().remove(prefix);
        self.upserted_at.lock().remove(prefix);
    }
}
