//! Local Cache Tests
//!
//! Tests for the in-memory cache: conditional writes, versions, expiration, listeners,
//! statistics and the cache manager.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hotrodkv::cache::{
    Cache, CacheConfiguration, CacheEvent, CacheFlags, CacheListener, CacheManager, EventKind, ListenerStatus,
    Metadata, VersionedOutcome,
};
use hotrodkv::error::CacheError;
use hotrodkv::protocol::Expiration;
use hotrodkv::LocalCache;
use parking_lot::Mutex;

fn cache() -> LocalCache {
    LocalCache::new("test", CacheConfiguration::default())
}

fn put(cache: &LocalCache, key: &str, value: &str) {
    cache
        .put(key.into(), value.into(), Metadata::immortal(), CacheFlags::none())
        .unwrap();
}

fn version_of(cache: &LocalCache, key: &str) -> u64 {
    cache.get(key.as_bytes(), CacheFlags::none()).unwrap().unwrap().version
}

/// Records every event; optionally asks to be removed after the first one
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<CacheEvent>>,
    once: bool,
}

impl CacheListener for Recorder {
    fn on_event(&self, event: &CacheEvent) -> ListenerStatus {
        self.events.lock().push(event.clone());
        if self.once {
            ListenerStatus::Remove
        } else {
            ListenerStatus::Keep
        }
    }
}

// =============================================================================
// Basic Operations
// =============================================================================

#[test]
fn test_put_returns_previous() {
    let cache = cache();
    let first = cache
        .put(b"k".to_vec(), b"v1".to_vec(), Metadata::immortal(), CacheFlags::none())
        .unwrap();
    assert!(first.is_none());

    let second = cache
        .put(b"k".to_vec(), b"v2".to_vec(), Metadata::immortal(), CacheFlags::none())
        .unwrap();
    assert_eq!(second.unwrap().value, b"v1".to_vec());
    assert_eq!(cache.get(b"k", CacheFlags::none()).unwrap().unwrap().value, b"v2".to_vec());
}

#[test]
fn test_versions_change_on_every_write() {
    let cache = cache();
    put(&cache, "k", "a");
    let v1 = version_of(&cache, "k");
    put(&cache, "k", "b");
    let v2 = version_of(&cache, "k");
    assert_ne!(v1, v2);
}

#[test]
fn test_put_if_absent_and_replace() {
    let cache = cache();
    let replaced = cache
        .replace(b"k".to_vec(), b"x".to_vec(), Metadata::immortal(), CacheFlags::none())
        .unwrap();
    assert!(replaced.is_none());
    assert!(!cache.contains_key(b"k", CacheFlags::none()).unwrap());

    assert!(cache
        .put_if_absent(b"k".to_vec(), b"v".to_vec(), Metadata::immortal(), CacheFlags::none())
        .unwrap()
        .is_none());
    let existing = cache
        .put_if_absent(b"k".to_vec(), b"w".to_vec(), Metadata::immortal(), CacheFlags::none())
        .unwrap();
    assert_eq!(existing.unwrap().value, b"v".to_vec());

    let replaced = cache
        .replace(b"k".to_vec(), b"x".to_vec(), Metadata::immortal(), CacheFlags::none())
        .unwrap();
    assert_eq!(replaced.unwrap().value, b"v".to_vec());
    assert_eq!(cache.get(b"k", CacheFlags::none()).unwrap().unwrap().value, b"x".to_vec());
}

#[test]
fn test_versioned_writes() {
    let cache = cache();
    assert_eq!(
        cache
            .replace_if_version(b"k".to_vec(), 1, b"v".to_vec(), Metadata::immortal(), CacheFlags::none())
            .unwrap(),
        VersionedOutcome::Missing
    );

    put(&cache, "k", "v1");
    let version = version_of(&cache, "k");

    let mismatch = cache
        .replace_if_version(b"k".to_vec(), version + 1, b"v2".to_vec(), Metadata::immortal(), CacheFlags::none())
        .unwrap();
    assert!(matches!(mismatch, VersionedOutcome::Mismatch(ref e) if e.version == version));

    let applied = cache
        .replace_if_version(b"k".to_vec(), version, b"v2".to_vec(), Metadata::immortal(), CacheFlags::none())
        .unwrap();
    assert!(matches!(applied, VersionedOutcome::Applied(ref e) if e.value == b"v1".to_vec()));

    let new_version = version_of(&cache, "k");
    assert!(matches!(
        cache.remove_if_version(b"k", version, CacheFlags::none()).unwrap(),
        VersionedOutcome::Mismatch(_)
    ));
    assert!(matches!(
        cache.remove_if_version(b"k", new_version, CacheFlags::none()).unwrap(),
        VersionedOutcome::Applied(_)
    ));
    assert_eq!(cache.size().unwrap(), 0);
}

#[test]
fn test_bulk_operations() {
    let cache = cache();
    cache
        .put_all(
            vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())],
            Metadata::immortal(),
            CacheFlags::none(),
        )
        .unwrap();
    assert_eq!(cache.size().unwrap(), 2);

    let found = cache
        .get_all(&[b"a".to_vec(), b"missing".to_vec()], CacheFlags::none())
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].key, b"a".to_vec());

    assert_eq!(cache.entries().unwrap().len(), 2);
    cache.clear().unwrap();
    assert_eq!(cache.size().unwrap(), 0);
}

// =============================================================================
// Expiration
// =============================================================================

#[test]
fn test_lifespan_expires_entries() {
    let cache = cache();
    let metadata = Metadata {
        lifespan: Some(Duration::from_millis(30)),
        max_idle: None,
    };
    cache
        .put(b"short".to_vec(), b"v".to_vec(), metadata, CacheFlags::none())
        .unwrap();
    put(&cache, "long", "v");
    assert_eq!(cache.size().unwrap(), 2);

    thread::sleep(Duration::from_millis(80));
    assert!(cache.get(b"short", CacheFlags::none()).unwrap().is_none());
    assert_eq!(cache.size().unwrap(), 1);
}

#[test]
fn test_metadata_resolution() {
    let config = CacheConfiguration {
        default_lifespan: Some(Duration::from_secs(60)),
        ..CacheConfiguration::default()
    };
    let resolved = Metadata::resolve(Expiration::Default, Expiration::Infinite, &config);
    assert_eq!(resolved.lifespan, Some(Duration::from_secs(60)));
    assert_eq!(resolved.max_idle, None);

    let explicit = Metadata::resolve(Expiration::After(Duration::from_secs(5)), Expiration::Default, &config);
    assert_eq!(explicit.lifespan, Some(Duration::from_secs(5)));
    assert_eq!(explicit.max_idle, None);
}

// =============================================================================
// Listeners
// =============================================================================

#[test]
fn test_listener_receives_events() {
    let cache = cache();
    let recorder = Arc::new(Recorder::default());
    let id = cache.add_listener(recorder.clone());

    put(&cache, "k", "v1");
    put(&cache, "k", "v2");
    cache.remove(b"k", CacheFlags::none()).unwrap();

    let kinds: Vec<EventKind> = recorder.events.lock().iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![EventKind::Created, EventKind::Modified, EventKind::Removed]);
    let events = recorder.events.lock();
    assert_eq!(events[1].old_value, Some(b"v1".to_vec()));
    assert_eq!(events[2].old_value, Some(b"v2".to_vec()));
    drop(events);

    assert!(cache.remove_listener(id));
    assert!(!cache.remove_listener(id));
    put(&cache, "k", "v3");
    assert_eq!(recorder.events.lock().len(), 3);
}

#[test]
fn test_skip_listener_notification() {
    let cache = cache();
    let recorder = Arc::new(Recorder::default());
    cache.add_listener(recorder.clone());

    cache
        .put(
            b"k".to_vec(),
            b"v".to_vec(),
            Metadata::immortal(),
            CacheFlags::none().with(CacheFlags::SKIP_LISTENER_NOTIFICATION),
        )
        .unwrap();
    assert!(recorder.events.lock().is_empty());
}

#[test]
fn test_listener_can_unregister_itself() {
    let cache = cache();
    let recorder = Arc::new(Recorder {
        events: Mutex::new(Vec::new()),
        once: true,
    });
    cache.add_listener(recorder.clone());

    put(&cache, "a", "1");
    put(&cache, "b", "2");
    assert_eq!(recorder.events.lock().len(), 1);
}

// =============================================================================
// Statistics and Segments
// =============================================================================

#[test]
fn test_stats_counters() {
    let cache = cache();
    put(&cache, "k", "v");
    cache.get(b"k", CacheFlags::none()).unwrap();
    cache.get(b"nope", CacheFlags::none()).unwrap();
    cache.remove(b"k", CacheFlags::none()).unwrap();
    cache.remove(b"k", CacheFlags::none()).unwrap();

    let stats = cache.stats();
    assert_eq!(stats.stores, 1);
    assert_eq!(stats.retrievals, 2);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.remove_hits, 1);
    assert_eq!(stats.remove_misses, 1);
    assert_eq!(stats.current_entries, 0);
}

#[test]
fn test_segment_of_is_in_range_and_stable() {
    let config = CacheConfiguration {
        num_segments: 16,
        ..CacheConfiguration::default()
    };
    let cache = LocalCache::new("seg", config);
    for i in 0..100u32 {
        let key = i.to_be_bytes();
        let segment = cache.segment_of(&key);
        assert!(segment < 16);
        assert_eq!(segment, cache.segment_of(&key));
    }
}

#[test]
fn test_non_transactional_cache_has_no_engine() {
    assert!(cache().transaction_engine().is_none());
    let tx = LocalCache::new("tx", CacheConfiguration::transactional());
    assert!(tx.transaction_engine().is_some());
}

// =============================================================================
// Cache Manager
// =============================================================================

#[test]
fn test_cache_manager_resolves_default() {
    let manager = CacheManager::new("default");
    manager.register(Arc::new(LocalCache::new("default", CacheConfiguration::default())));
    manager.register(Arc::new(LocalCache::new("books", CacheConfiguration::default())));

    assert_eq!(manager.resolve_name(""), "default");
    assert_eq!(manager.get("").unwrap().name(), "default");
    assert_eq!(manager.get("books").unwrap().name(), "books");
    assert!(matches!(manager.get("nope"), Err(CacheError::CacheNotFound(name)) if name == "nope"));
    assert_eq!(manager.names(), vec!["books".to_string(), "default".to_string()]);
}
