//! End-to-end behavior of the memory cache: expiry, cascading invalidation,
//! fingerprint rotation, bounded eviction and the start/stop cycle.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use revcache::cache::{
    CacheConfig, CacheError, CacheManager, EvictionPolicy, Fingerprint, ManualClock, MemoryCache,
    NewEntry,
};

fn tags(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

fn metadata(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn quiet_config() -> CacheConfig {
    CacheConfig {
        cleanup_interval: String::new(),
        ..Default::default()
    }
}

#[test]
fn entries_expire_after_their_ttl() {
    let clock = Arc::new(ManualClock::default());
    let cache = MemoryCache::with_clock(quiet_config(), clock.clone());

    cache
        .set("users:list", Bytes::from_static(b"[A,B]"), Duration::from_secs(60))
        .expect("set succeeds");
    assert_eq!(
        cache.get("users:list"),
        Some(Bytes::from_static(b"[A,B]"))
    );

    clock.advance(Duration::from_secs(61));
    assert_eq!(cache.get("users:list"), None);
    assert_eq!(cache.stats().expired, 1);
}

#[test]
fn entry_is_gone_exactly_at_its_deadline() {
    let clock = Arc::new(ManualClock::default());
    let cache = MemoryCache::with_clock(quiet_config(), clock.clone());

    cache
        .set("k", Bytes::from_static(b"v"), Duration::from_secs(10))
        .expect("set succeeds");
    clock.advance(Duration::from_secs(9));
    assert!(cache.get("k").is_some());

    clock.advance(Duration::from_secs(1));
    assert!(cache.get("k").is_none());
}

#[test]
fn invalidation_purges_dependents_and_bumps_the_revision() {
    let cache = MemoryCache::new(quiet_config());
    let before = cache.get_revision("users");

    cache
        .set_entry(
            NewEntry::new("K", "payload", Duration::from_secs(60))
                .with_dependencies(tags(&["users"])),
        )
        .expect("set succeeds");
    assert_eq!(cache.dependents("users"), vec!["K".to_string()]);

    cache.invalidate(&["users"]).expect("invalidate succeeds");

    assert!(cache.get("K").is_none());
    assert_eq!(cache.get_revision("users"), before + 1);
    assert!(cache.dependents("users").is_empty());
}

#[test]
fn fingerprints_embed_tag_revisions() {
    let cache = MemoryCache::new(quiet_config());
    cache.set_revision("users", 3);
    cache.set_revision("perm", 7);
    let deps = tags(&["users", "perm"]);
    let meta = metadata(&[("v", "1")]);

    let key = cache.build_cache_key("/api/users", &deps, &meta);
    assert_eq!(key.as_str(), "/api/users|users|3|perm|7|v:1");

    cache.invalidate(&["perm"]).expect("invalidate succeeds");
    let rotated = cache.build_cache_key("/api/users", &deps, &meta);
    assert_eq!(rotated.as_str(), "/api/users|users|3|perm|8|v:1");
}

#[test]
fn fingerprints_separate_every_axis() {
    let cache = MemoryCache::new(quiet_config());
    let base = cache.build_cache_key("/p", &tags(&["a", "b"]), &metadata(&[("v", "1")]));

    let variants = [
        cache.build_cache_key("/p", &tags(&["b", "a"]), &metadata(&[("v", "1")])),
        cache.build_cache_key("/p", &tags(&["a", "c"]), &metadata(&[("v", "1")])),
        cache.build_cache_key("/p", &tags(&["a", "b"]), &metadata(&[("v", "2")])),
        cache.build_cache_key("/q", &tags(&["a", "b"]), &metadata(&[("v", "1")])),
    ];
    for variant in &variants {
        assert_ne!(variant.as_str(), base.as_str());
    }

    let again = cache.build_cache_key("/p", &tags(&["a", "b"]), &metadata(&[("v", "1")]));
    assert_eq!(again, base);
}

#[test]
fn metadata_order_does_not_change_the_key() {
    let cache = MemoryCache::new(quiet_config());
    let mut forward = BTreeMap::new();
    forward.insert("a".to_string(), "1".to_string());
    forward.insert("b".to_string(), "2".to_string());
    let mut backward = BTreeMap::new();
    backward.insert("b".to_string(), "2".to_string());
    backward.insert("a".to_string(), "1".to_string());

    assert_eq!(
        cache.build_cache_key("/p", &[], &forward),
        cache.build_cache_key("/p", &[], &backward)
    );
    assert_eq!(cache.build_cache_key("/p", &[], &forward).as_str(), "/p|a:1|b:2");
}

#[test]
fn fifo_capacity_evicts_the_oldest_entry() {
    let cache = MemoryCache::new(CacheConfig {
        max_entries: 2,
        eviction_policy: EvictionPolicy::Fifo,
        ..quiet_config()
    });

    for key in ["A", "B", "C"] {
        cache
            .set_entry(
                NewEntry::new(key, key.to_lowercase(), Duration::ZERO)
                    .with_dependencies(tags(&["letters"])),
            )
            .expect("set succeeds");
    }

    assert!(cache.entry_info("A").is_none());
    assert!(cache.entry_info("B").is_some());
    assert!(cache.entry_info("C").is_some());
    assert_eq!(cache.stats().entries, 2);
    assert_eq!(cache.stats().evictions, 1);

    let mut dependents = cache.dependents("letters");
    dependents.sort();
    assert_eq!(dependents, vec!["B".to_string(), "C".to_string()]);
}

#[test]
fn lru_capacity_keeps_recently_read_entries() {
    let cache = MemoryCache::new(CacheConfig {
        max_entries: 2,
        eviction_policy: EvictionPolicy::Lru,
        ..quiet_config()
    });

    cache.set("A", Bytes::from_static(b"a"), Duration::ZERO).unwrap();
    cache.set("B", Bytes::from_static(b"b"), Duration::ZERO).unwrap();
    assert!(cache.get("A").is_some());
    cache.set("C", Bytes::from_static(b"c"), Duration::ZERO).unwrap();

    assert!(cache.entry_info("A").is_some());
    assert!(cache.entry_info("B").is_none());
    assert!(cache.entry_info("C").is_some());
}

#[test]
fn lfu_capacity_keeps_frequently_read_entries() {
    let cache = MemoryCache::new(CacheConfig {
        max_entries: 2,
        eviction_policy: EvictionPolicy::Lfu,
        ..quiet_config()
    });

    cache.set("A", Bytes::from_static(b"a"), Duration::ZERO).unwrap();
    cache.set("B", Bytes::from_static(b"b"), Duration::ZERO).unwrap();
    for _ in 0..3 {
        assert!(cache.get("B").is_some());
    }
    assert!(cache.get("A").is_some());
    cache.set("C", Bytes::from_static(b"c"), Duration::ZERO).unwrap();

    assert!(cache.entry_info("A").is_none());
    assert!(cache.entry_info("B").is_some());
    assert!(cache.entry_info("C").is_some());
}

#[test]
fn replacing_an_entry_moves_its_back_links() {
    let cache = MemoryCache::new(quiet_config());
    cache
        .set_entry(NewEntry::new("K", "v1", Duration::ZERO).with_dependencies(tags(&["old"])))
        .unwrap();
    cache
        .set_entry(NewEntry::new("K", "v2", Duration::ZERO).with_dependencies(tags(&["new"])))
        .unwrap();

    assert!(cache.dependents("old").is_empty());
    assert_eq!(cache.dependents("new"), vec!["K".to_string()]);
    assert_eq!(cache.get("K"), Some(Bytes::from_static(b"v2")));
}

#[test]
fn delete_unlinks_every_tag() {
    let cache = MemoryCache::new(quiet_config());
    cache
        .set_entry(
            NewEntry::new("K", "v", Duration::ZERO).with_dependencies(tags(&["a", "b"])),
        )
        .unwrap();

    cache.delete("K").unwrap();
    cache.delete("K").unwrap();

    assert!(cache.dependents("a").is_empty());
    assert!(cache.dependents("b").is_empty());
}

#[test]
fn empty_keys_are_rejected() {
    let cache = MemoryCache::new(quiet_config());
    assert_eq!(
        cache.set("", Bytes::from_static(b"v"), Duration::ZERO),
        Err(CacheError::KeyEmpty)
    );
}

#[test]
fn oversized_entries_are_rejected() {
    let cache = MemoryCache::new(CacheConfig {
        max_memory: 16,
        ..quiet_config()
    });
    let result = cache.set("K", Bytes::from(vec![0u8; 64]), Duration::ZERO);
    assert!(matches!(result, Err(CacheError::EntryTooLarge { .. })));
    assert_eq!(cache.stats().entries, 0);
}

#[test]
fn start_stop_cycle_resets_state() {
    let cache = MemoryCache::new(quiet_config());
    cache.start().expect("first start");
    assert_eq!(cache.start(), Err(CacheError::AlreadyRunning));

    cache
        .set_entry(NewEntry::new("K", "v", Duration::ZERO).with_dependencies(tags(&["users"])))
        .unwrap();
    cache.invalidate(&["perm"]).unwrap();

    cache.stop().expect("first stop");
    assert_eq!(cache.stop(), Err(CacheError::NotRunning));
    assert!(!cache.is_running());
    assert_eq!(cache.stats().entries, 0);
    assert_eq!(cache.get_revision("perm"), 0);
    assert!(cache.dependents("users").is_empty());

    cache.start().expect("restart");
    assert!(cache.is_running());
    cache.stop().expect("final stop");
}

#[tokio::test(start_paused = true)]
async fn background_sweep_removes_expired_entries() {
    let clock = Arc::new(ManualClock::default());
    let cache = MemoryCache::with_clock(
        CacheConfig {
            cleanup_interval: "10s".to_string(),
            ..Default::default()
        },
        clock.clone(),
    );
    cache.start().expect("start");

    for index in 0..5 {
        cache
            .set(
                &format!("short-{index}"),
                Bytes::from_static(b"v"),
                Duration::from_secs(5),
            )
            .unwrap();
    }
    cache
        .set("forever", Bytes::from_static(b"v"), Duration::ZERO)
        .unwrap();

    clock.advance(Duration::from_secs(6));
    tokio::time::sleep(Duration::from_secs(11)).await;

    let stats = cache.stats();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.expired, 5);
    cache.stop().expect("stop");
}

#[test]
fn concurrent_invalidation_never_leaves_stale_entries() {
    const ROUNDS: usize = 200;
    const WRITES: usize = 50;

    for round in 0..ROUNDS {
        let cache = Arc::new(MemoryCache::new(quiet_config()));
        cache.start().expect("start");

        let writer = thread::spawn({
            let cache = Arc::clone(&cache);
            move || {
                let mut written: Vec<Fingerprint> = Vec::with_capacity(WRITES);
                for index in 0..WRITES {
                    let deps = if index % 2 == 0 {
                        tags(&["users"])
                    } else {
                        tags(&["users", "perm"])
                    };
                    let fingerprint =
                        cache.build_cache_key(&format!("/r{round}/{index}"), &deps, &BTreeMap::new());
                    cache
                        .set_fingerprint(
                            &fingerprint,
                            Bytes::from_static(b"v"),
                            Duration::ZERO,
                            BTreeMap::new(),
                        )
                        .expect("write succeeds");
                    written.push(fingerprint);
                }
                written
            }
        });

        for _ in 0..3 {
            cache.invalidate(&["users"]).expect("invalidate succeeds");
            thread::yield_now();
        }
        let written = writer.join().expect("writer thread");

        let current = cache.get_revision("users");
        let live: Vec<&Fingerprint> = written
            .iter()
            .filter(|fingerprint| cache.entry_info(fingerprint.as_str()).is_some())
            .collect();
        for fingerprint in &live {
            assert_eq!(
                fingerprint.revisions()[0],
                current,
                "round {round}: {fingerprint} survived an invalidation"
            );
        }

        for tag in ["users", "perm"] {
            let registered: BTreeSet<String> = cache.dependents(tag).into_iter().collect();
            let carrying: BTreeSet<String> = live
                .iter()
                .filter(|fingerprint| fingerprint.dependencies().iter().any(|dep| dep == tag))
                .map(|fingerprint| fingerprint.as_str().to_string())
                .collect();
            assert_eq!(registered, carrying, "round {round}: back-links of `{tag}`");
        }

        cache.stop().expect("stop");
    }
}
