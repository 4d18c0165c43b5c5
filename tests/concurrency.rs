use std::error::Error;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use inetnum::addr::Prefix;
use ipcache_store::test_types::{
    logical_clock, CountingAllocator, RecordingUpdater, TableWriter,
};
use ipcache_store::{
    Attributes, CacheStatus, CancelToken, Collaborators, Config, IpCache,
    Label, LabelSet, PrefixCluster, ResourceId, Source,
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

fn build() -> (
    Arc<IpCache>,
    Arc<CountingAllocator>,
    Arc<TableWriter>,
    CacheStatus,
) {
    let clock = logical_clock();
    let allocator = Arc::new(CountingAllocator::new());
    let updater = Arc::new(RecordingUpdater::new(clock.clone()));
    let writer = Arc::new(TableWriter::new(clock));
    let status = CacheStatus::new();
    let cache = IpCache::new(
        Config::default(),
        Collaborators {
            allocator: allocator.clone(),
            updater,
            writer: writer.clone(),
            cache_status: status.clone(),
        },
    )
    .unwrap();
    (Arc::new(cache), allocator, writer, status)
}

fn labels(pairs: &[(&str, &str, &str)]) -> LabelSet {
    pairs
        .iter()
        .map(|(s, k, v)| Label::new(*s, *k, *v))
        .collect()
}

#[test]
fn test_concurrent_producers() -> Result<(), Box<dyn Error>> {
    common::init();
    let (cache, _allocator, writer, status) = build();
    status.signal();

    struct Producer {
        resource: ResourceId,
        prefixes: Vec<&'static str>,
        app: &'static str,
    }

    let producers = vec![
        Producer {
            resource: ResourceId::from("pod/a"),
            prefixes: vec!["10.1.0.1/32", "10.1.0.2/32", "10.1.0.3/32"],
            app: "a",
        },
        Producer {
            resource: ResourceId::from("pod/b"),
            prefixes: vec!["10.2.0.1/32", "10.2.0.2/32", "10.2.0.3/32"],
            app: "b",
        },
        Producer {
            resource: ResourceId::from("pod/c"),
            prefixes: vec!["10.3.0.1/32", "10.3.0.2/32", "10.3.0.3/32"],
            app: "c",
        },
    ];

    let handles: Vec<_> = producers
        .into_iter()
        .map(|producer| {
            let cache = cache.clone();
            std::thread::Builder::new()
                .name(producer.resource.to_string())
                .spawn(move || {
                    let mut rev = 0;
                    for prefix in &producer.prefixes {
                        rev = cache.upsert(
                            Prefix::from_str(prefix).unwrap(),
                            0,
                            Source::CustomResource,
                            &producer.resource,
                            &Attributes::labels(labels(&[(
                                "k8s",
                                "app",
                                producer.app,
                            )])),
                        );
                    }
                    cache
                        .wait_for_revision(&CancelToken::new(), rev)
                        .unwrap();
                    producer.prefixes.clone()
                })
                .unwrap()
        })
        .collect();

    let mut all_prefixes = Vec::new();
    for handle in handles {
        all_prefixes.extend(handle.join().unwrap());
    }

    assert_eq!(all_prefixes.len(), 9);
    for prefix in all_prefixes {
        let pc =
            PrefixCluster::new(Prefix::from_str(prefix).unwrap(), 0);
        let entry = writer.entry(&pc).unwrap();
        assert!(entry.identity.is_local());
    }
    assert_eq!(cache.metrics().prefixes(), 9);
    assert_eq!(cache.metrics().queue_depth(), 0);
    Ok(())
}

#[test]
fn test_concurrent_contributions_to_one_prefix() -> Result<(), Box<dyn Error>>
{
    common::init();
    let (cache, _allocator, writer, status) = build();
    status.signal();

    let prefix = Prefix::from_str("10.0.0.1/32")?;
    let handles: Vec<_> = ["pod/a", "policy/b", "group/c"]
        .into_iter()
        .map(|resource| {
            let cache = cache.clone();
            std::thread::spawn(move || {
                let rev = cache.upsert(
                    prefix,
                    0,
                    Source::CustomResource,
                    &ResourceId::from(resource),
                    &Attributes::labels(labels(&[(
                        "k8s",
                        resource,
                        "on",
                    )])),
                );
                cache
                    .wait_for_revision(&CancelToken::new(), rev)
                    .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // All three contributions survive concurrent merging.
    let flat = cache.get(prefix, 0).unwrap();
    for resource in ["pod/a", "policy/b", "group/c"] {
        assert!(flat.labels.contains_name(&format!("k8s:{}", resource)));
    }
    let entry =
        writer.entry(&PrefixCluster::new(prefix, 0)).unwrap();
    assert!(entry.identity.is_local());
    Ok(())
}

#[test]
fn test_waiters_block_until_caches_synchronize() -> Result<(), Box<dyn Error>>
{
    common::init();
    let (cache, _allocator, writer, status) = build();

    let rev = cache.upsert(
        Prefix::from_str("10.0.0.1/32")?,
        0,
        Source::CustomResource,
        &ResourceId::from("pod/A"),
        &Attributes::labels(labels(&[("k8s", "app", "web")])),
    );

    // Nothing may be injected before the caches report synchronized.
    let cancel = CancelToken::new();
    let (early, token) = (cache.clone(), cancel.clone());
    let waiter =
        std::thread::spawn(move || early.wait_for_revision(&token, rev));
    std::thread::sleep(Duration::from_millis(50));
    assert!(writer.is_empty());
    assert!(!waiter.is_finished());

    status.signal();
    cache.trigger_label_injection();
    waiter.join().unwrap()?;
    assert_eq!(writer.len(), 1);
    Ok(())
}

#[test]
fn test_shutdown_while_blocked() -> Result<(), Box<dyn Error>> {
    common::init();
    let (cache, _allocator, _writer, _status) = build();
    cache.upsert(
        Prefix::from_str("10.0.0.1/32")?,
        0,
        Source::CustomResource,
        &ResourceId::from("pod/A"),
        &Attributes::labels(labels(&[("k8s", "app", "web")])),
    );
    // The injector is blocked on cache synchronization; shutdown must
    // still return promptly.
    std::thread::sleep(Duration::from_millis(20));
    cache.shutdown();
    Ok(())
}
