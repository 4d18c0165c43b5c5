use std::collections::BTreeSet;
use std::error::Error;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use inetnum::addr::Prefix;
use ipcache_store::metrics::Metrics;
use ipcache_store::{
    Attributes, CancelToken, Label, LabelSet, MetadataStore,
    PrefixCluster, ResourceId, Source,
};

mod common {
    use std::io::Write;

    pub fn init() {
        let _ = env_logger::builder()
            .format(|buf, record| writeln!(buf, "{}", record.args()))
            .is_test(true)
            .try_init();
    }
}

fn store() -> MetadataStore {
    MetadataStore::new(Arc::new(Metrics::new().unwrap()))
}

fn pc(s: &str) -> PrefixCluster {
    PrefixCluster::new(Prefix::from_str(s).unwrap(), 0)
}

fn labels(pairs: &[(&str, &str, &str)]) -> LabelSet {
    pairs
        .iter()
        .map(|(s, k, v)| Label::new(*s, *k, *v))
        .collect()
}

#[test]
fn test_upsert_idempotent() -> Result<(), Box<dyn Error>> {
    common::init();
    let store = store();
    let attrs = Attributes::labels(labels(&[("k8s", "app", "web")]));
    let resource = ResourceId::from("pod/default/web-0");

    let first = store.upsert_metadata(
        pc("10.0.0.1/32"),
        Source::CustomResource,
        &resource,
        &attrs,
    );
    assert_eq!(first, vec![pc("10.0.0.1/32")]);

    // The identical upsert changes nothing and affects nothing.
    let second = store.upsert_metadata(
        pc("10.0.0.1/32"),
        Source::CustomResource,
        &resource,
        &attrs,
    );
    assert!(second.is_empty());
    assert_eq!(store.len(), 1);
    Ok(())
}

#[test]
fn test_upsert_remove_inverse() -> Result<(), Box<dyn Error>> {
    common::init();
    let store = store();
    let resource = ResourceId::from("pod/default/web-0");
    let base = Attributes::labels(labels(&[("k8s", "app", "web")]));
    store.upsert_metadata(
        pc("10.0.0.1/32"),
        Source::CustomResource,
        &resource,
        &base,
    );
    let before = store.get(&pc("10.0.0.1/32"));

    let extra = Attributes::labels(labels(&[("k8s", "team", "red")]))
        .with_encrypt_key(7);
    let affected = store.upsert_metadata(
        pc("10.0.0.1/32"),
        Source::CustomResource,
        &resource,
        &extra,
    );
    assert_eq!(affected, vec![pc("10.0.0.1/32")]);
    let affected =
        store.remove_metadata(pc("10.0.0.1/32"), &resource, &extra);
    assert_eq!(affected, vec![pc("10.0.0.1/32")]);

    assert_eq!(store.get(&pc("10.0.0.1/32")), before);

    // Removing the rest destroys the entry.
    store.remove_metadata(pc("10.0.0.1/32"), &resource, &base);
    assert_eq!(store.get(&pc("10.0.0.1/32")), None);
    assert_eq!(store.len(), 0);
    Ok(())
}

#[test]
fn test_empty_contribution_is_rejected() -> Result<(), Box<dyn Error>> {
    common::init();
    let store = store();
    let affected = store.upsert_metadata(
        pc("10.0.0.1/32"),
        Source::Local,
        &ResourceId::from("noop"),
        &Attributes::default(),
    );
    assert!(affected.is_empty());
    assert_eq!(store.len(), 0);
    Ok(())
}

#[test]
fn test_affected_set_includes_descendants() -> Result<(), Box<dyn Error>> {
    common::init();
    let store = store();
    let resource = ResourceId::from("cidr-group/env");
    store.upsert_metadata(
        pc("10.1.0.0/16"),
        Source::CustomResource,
        &resource,
        &Attributes::labels(labels(&[("k8s", "team", "red")])),
    );
    store.upsert_metadata(
        pc("10.1.1.0/24"),
        Source::CustomResource,
        &resource,
        &Attributes::labels(labels(&[("k8s", "svc", "x")])),
    );

    // A parent update affects all stored descendants.
    let mut affected = store.upsert_metadata(
        pc("10.0.0.0/8"),
        Source::CustomResource,
        &resource,
        &Attributes::labels(labels(&[("k8s", "env", "prod")])),
    );
    affected.sort();
    assert_eq!(
        affected,
        vec![pc("10.0.0.0/8"), pc("10.1.0.0/16"), pc("10.1.1.0/24")]
    );

    // Removal reports the removed prefix and its descendants as well.
    let mut affected = store.remove_metadata(
        pc("10.0.0.0/8"),
        &resource,
        &Attributes::labels(labels(&[("k8s", "env", "prod")])),
    );
    affected.sort();
    assert_eq!(
        affected,
        vec![pc("10.0.0.0/8"), pc("10.1.0.0/16"), pc("10.1.1.0/24")]
    );
    assert_eq!(store.get(&pc("10.0.0.0/8")), None);
    Ok(())
}

#[test]
fn test_flattening_deterministic() -> Result<(), Box<dyn Error>> {
    common::init();
    let contributions = [
        (
            ResourceId::from("pod/a"),
            Source::CustomResource,
            labels(&[("k8s", "app", "web"), ("k8s", "tier", "fe")]),
        ),
        (
            ResourceId::from("policy/b"),
            Source::Local,
            labels(&[("k8s", "app", "override")]),
        ),
        (
            ResourceId::from("group/c"),
            Source::Generated,
            labels(&[("k8s", "zone", "eu")]),
        ),
    ];

    let forward = store();
    for (resource, source, labelset) in contributions.iter() {
        forward.upsert_metadata(
            pc("10.0.0.1/32"),
            *source,
            resource,
            &Attributes::labels(labelset.clone()),
        );
    }
    let backward = store();
    for (resource, source, labelset) in contributions.iter().rev() {
        backward.upsert_metadata(
            pc("10.0.0.1/32"),
            *source,
            resource,
            &Attributes::labels(labelset.clone()),
        );
    }

    let a = forward.get(&pc("10.0.0.1/32")).unwrap();
    let b = backward.get(&pc("10.0.0.1/32")).unwrap();
    assert_eq!(a, b);
    // The Local contribution wins the shared label name.
    assert_eq!(
        a.labels.get("k8s:app").map(|l| l.value()),
        Some("override")
    );
    assert_eq!(a.source, Source::Local);
    Ok(())
}

#[test]
fn test_scalar_conflicts_follow_precedence() -> Result<(), Box<dyn Error>> {
    common::init();
    let store = store();
    let peer_low: IpAddr = "192.0.2.1".parse()?;
    let peer_high: IpAddr = "192.0.2.2".parse()?;

    store.upsert_metadata(
        pc("10.0.0.0/24"),
        Source::KVStore,
        &ResourceId::from("kvstore/n1"),
        &Attributes::labels(labels(&[("k8s", "a", "1")]))
            .with_tunnel_peer(peer_low),
    );
    store.upsert_metadata(
        pc("10.0.0.0/24"),
        Source::Local,
        &ResourceId::from("node/local"),
        &Attributes::labels(labels(&[("k8s", "b", "2")]))
            .with_tunnel_peer(peer_high),
    );

    let flat = store.get(&pc("10.0.0.0/24")).unwrap();
    assert_eq!(flat.tunnel_peer.map(|p| p.0), Some(peer_high));
    assert_eq!(flat.source, Source::Local);
    Ok(())
}

#[test]
fn test_canonicalization_on_all_paths() -> Result<(), Box<dyn Error>> {
    common::init();
    let store = store();
    let relaxed = PrefixCluster::new(
        Prefix::new_relaxed(IpAddr::from_str("10.9.8.7")?, 8)?,
        0,
    );
    store.upsert_metadata(
        relaxed,
        Source::Local,
        &ResourceId::from("r"),
        &Attributes::labels(labels(&[("k8s", "env", "prod")])),
    );
    assert!(store.get(&pc("10.0.0.0/8")).is_some());

    let mapped = PrefixCluster::new(
        Prefix::new(IpAddr::from_str("::ffff:10.0.0.0")?, 104)?,
        0,
    );
    assert_eq!(mapped, pc("10.0.0.0/8"));
    assert!(store.get(&mapped).is_some());
    Ok(())
}

#[test]
fn test_filter_by_labels() -> Result<(), Box<dyn Error>> {
    common::init();
    let store = store();
    let resource = ResourceId::from("r");
    store.upsert_metadata(
        pc("10.0.0.1/32"),
        Source::Local,
        &resource,
        &Attributes::labels(labels(&[
            ("k8s", "app", "web"),
            ("k8s", "env", "prod"),
        ])),
    );
    store.upsert_metadata(
        pc("10.0.0.2/32"),
        Source::Local,
        &resource,
        &Attributes::labels(labels(&[("k8s", "app", "web")])),
    );

    let matched =
        store.filter_by_labels(&labels(&[("k8s", "env", "prod")]));
    assert_eq!(matched, vec![pc("10.0.0.1/32")]);
    let matched = store.filter_by_labels(&labels(&[("k8s", "app", "web")]));
    assert_eq!(matched, vec![pc("10.0.0.1/32"), pc("10.0.0.2/32")]);
    Ok(())
}

#[test]
fn test_remove_labels_excluded_special_case() -> Result<(), Box<dyn Error>>
{
    common::init();
    let store = store();
    let watcher = ResourceId::from("kube-apiserver-watcher");
    let kas_world = labels(&[
        ("reserved", "kube-apiserver", ""),
        ("reserved", "world", ""),
    ]);

    store.upsert_metadata(
        pc("172.16.0.1/32"),
        Source::KubeAPIServer,
        &watcher,
        &Attributes::labels(kas_world.clone()),
    );
    store.upsert_metadata(
        pc("172.16.0.2/32"),
        Source::KubeAPIServer,
        &watcher,
        &Attributes::labels(kas_world),
    );

    let excluded: BTreeSet<PrefixCluster> =
        [pc("172.16.0.2/32")].into_iter().collect();
    let affected = store.remove_labels_excluded(
        &labels(&[("reserved", "kube-apiserver", "")]),
        &excluded,
        &watcher,
    );
    assert_eq!(affected, vec![pc("172.16.0.1/32")]);

    // The world label went with the kube-apiserver label, so the whole
    // entry is gone rather than lingering as a world-only orphan.
    assert_eq!(store.get(&pc("172.16.0.1/32")), None);
    assert!(store.get(&pc("172.16.0.2/32")).is_some());
    Ok(())
}

#[test]
fn test_remove_labels_excluded_leaves_richer_sets() -> Result<(), Box<dyn Error>>
{
    common::init();
    let store = store();
    let watcher = ResourceId::from("kube-apiserver-watcher");
    store.upsert_metadata(
        pc("172.16.0.3/32"),
        Source::KubeAPIServer,
        &watcher,
        &Attributes::labels(labels(&[
            ("reserved", "kube-apiserver", ""),
            ("reserved", "world", ""),
            ("k8s", "extra", "x"),
        ])),
    );
    store.remove_labels_excluded(
        &labels(&[("reserved", "kube-apiserver", "")]),
        &BTreeSet::new(),
        &watcher,
    );
    // Three labels flattened, so only the named label is removed.
    let flat = store.get(&pc("172.16.0.3/32")).unwrap();
    assert!(flat.labels.contains_name("reserved:world"));
    assert!(flat.labels.contains_name("k8s:extra"));
    assert!(!flat.labels.contains_name("reserved:kube-apiserver"));
    Ok(())
}

#[test]
fn test_revision_flow() -> Result<(), Box<dyn Error>> {
    common::init();
    let store = store();
    let rev = store.enqueue_prefix_updates(&[pc("10.0.0.1/32")]);
    assert_eq!(rev, 1);
    assert_eq!(store.enqueue_prefix_updates(&[pc("10.0.0.2/32")]), 1);

    let (batch, rev) = store.dequeue_prefix_updates();
    assert_eq!(batch.len(), 2);
    assert_eq!(rev, 1);
    assert_eq!(store.enqueue_prefix_updates(&[pc("10.0.0.3/32")]), 2);

    store.set_injected_revision(1);
    assert_eq!(store.injected_revision(), 1);
    store.wait_for_revision(&CancelToken::new(), 1)?;

    // Waiters for a later revision block until it is published.
    let store = Arc::new(store);
    let waiter = store.clone();
    let handle =
        std::thread::spawn(move || {
            waiter.wait_for_revision(&CancelToken::new(), 2)
        });
    std::thread::sleep(std::time::Duration::from_millis(20));
    let (_, rev) = store.dequeue_prefix_updates();
    store.set_injected_revision(rev);
    assert!(handle.join().unwrap().is_ok());

    // Revisions never move backwards.
    store.set_injected_revision(1);
    assert_eq!(store.injected_revision(), 2);
    Ok(())
}

#[test]
fn test_wait_for_revision_cancellation() -> Result<(), Box<dyn Error>> {
    common::init();
    let store = Arc::new(store());
    store.enqueue_prefix_updates(&[pc("10.0.0.1/32")]);
    let cancel = CancelToken::new();
    let (waiter, token) = (store.clone(), cancel.clone());
    let handle =
        std::thread::spawn(move || waiter.wait_for_revision(&token, 1));
    std::thread::sleep(std::time::Duration::from_millis(20));
    cancel.cancel();
    assert!(handle.join().unwrap().is_err());
    Ok(())
}

#[test]
fn test_dump_flattened() -> Result<(), Box<dyn Error>> {
    common::init();
    let store = store();
    store.upsert_metadata(
        pc("10.0.0.1/32"),
        Source::Local,
        &ResourceId::from("r"),
        &Attributes::labels(labels(&[("k8s", "app", "web")])),
    );
    let dump = store.dump();
    assert_eq!(dump.len(), 1);
    assert_eq!(dump[0].prefix, "10.0.0.1/32");
    assert_eq!(dump[0].source, Source::Local);
    assert!(dump[0].labels.contains_name("k8s:app"));
    Ok(())
}
