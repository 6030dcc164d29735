//! Listener Tests
//!
//! Tests for remote listeners: event frames, interest filtering, factories and the
//! bounded queue between a cache and a slow connection.

use std::sync::Arc;

use bytes::Bytes;
use hotrodkv::cache::{CacheEvent, CacheFlags, Metadata};
use hotrodkv::listener::{
    EventConverter, EventConverterFactory, EventFilter, EventFilterFactory, ListenerRegistry,
    CACHE_ENTRY_CREATED_EVENT, CACHE_ENTRY_MODIFIED_EVENT, CACHE_ENTRY_REMOVED_EVENT,
};
use hotrodkv::network::{Channel, ChannelHandle, ChannelReceiver};
use hotrodkv::protocol::constants::*;
use hotrodkv::protocol::{ListenerRequest, NamedFactory, ReadLimits, VersionTable, VersionedEncoder, WireReader};
use hotrodkv::{Cache, CacheConfiguration, HotRodError, LocalCache};

fn cache() -> Arc<dyn Cache> {
    Arc::new(LocalCache::new("default", CacheConfiguration::default()))
}

fn encoder() -> Arc<dyn VersionedEncoder> {
    VersionTable::standard().encoder_for(VERSION_28).unwrap()
}

fn request(id: &[u8]) -> ListenerRequest {
    ListenerRequest {
        listener_id: id.to_vec(),
        include_current_state: false,
        filter: None,
        converter: None,
        use_raw_data: false,
        interests: 0,
    }
}

fn put(cache: &Arc<dyn Cache>, key: &[u8], value: &[u8]) {
    cache
        .put(key.to_vec(), value.to_vec(), Metadata::immortal(), CacheFlags::none())
        .unwrap();
}

fn register(
    registry: &ListenerRegistry,
    channel: &ChannelHandle,
    request: &ListenerRequest,
    cache: &Arc<dyn Cache>,
) -> hotrodkv::Result<bool> {
    registry.add_listener(channel, VERSION_28, request, Arc::clone(cache), encoder())
}

/// Decoded event frame
#[derive(Debug)]
struct Event {
    message_id: u64,
    op: u8,
    listener_id: Vec<u8>,
    marker: u8,
    body: Vec<u8>,
    version: Option<i64>,
}

fn parse(frame: &Bytes) -> Event {
    let mut r = WireReader::new(frame, ReadLimits::default());
    assert_eq!(r.read_u8().unwrap(), MAGIC_RES);
    let message_id = r.read_vlong().unwrap();
    let op = r.read_u8().unwrap();
    assert_eq!(r.read_u8().unwrap(), 0, "status");
    assert_eq!(r.read_u8().unwrap(), 0, "topology marker");
    let listener_id = r.read_ranged_bytes().unwrap();
    let marker = r.read_u8().unwrap();
    assert_eq!(r.read_u8().unwrap(), 0, "retried");
    let body = r.read_ranged_bytes().unwrap();
    let version = if r.remaining() >= 8 { Some(r.read_i64().unwrap()) } else { None };
    assert_eq!(r.remaining(), 0);
    Event {
        message_id,
        op,
        listener_id,
        marker,
        body,
        version,
    }
}

fn next_event(rx: &ChannelReceiver) -> Event {
    parse(&rx.try_recv().expect("an event frame"))
}

// =============================================================================
// Event Frames
// =============================================================================

#[test]
fn test_write_produces_event_frames() {
    let registry = ListenerRegistry::new(16);
    let (channel, rx) = Channel::new("client", 16);
    let cache = cache();
    assert!(register(&registry, &channel, &request(b"L1"), &cache).unwrap());

    put(&cache, b"k", b"v1");
    put(&cache, b"k", b"v2");
    cache.remove(b"k", CacheFlags::none()).unwrap();

    let created = next_event(&rx);
    assert_eq!(created.op, CACHE_ENTRY_CREATED_EVENT);
    assert_eq!(created.listener_id, b"L1".to_vec());
    assert_eq!(created.marker, 0);
    assert_eq!(created.body, b"k".to_vec());
    assert!(created.version.is_some());

    let modified = next_event(&rx);
    assert_eq!(modified.op, CACHE_ENTRY_MODIFIED_EVENT);
    assert_eq!(modified.message_id, created.message_id + 1);
    assert_ne!(modified.version, created.version);

    let removed = next_event(&rx);
    assert_eq!(removed.op, CACHE_ENTRY_REMOVED_EVENT);
    assert_eq!(removed.version, None);
    assert!(rx.try_recv().is_none());
}

#[test]
fn test_removing_absent_key_sends_nothing() {
    let registry = ListenerRegistry::new(16);
    let (channel, rx) = Channel::new("client", 16);
    let cache = cache();
    register(&registry, &channel, &request(b"L1"), &cache).unwrap();

    cache.remove(b"missing", CacheFlags::none()).unwrap();
    assert!(rx.try_recv().is_none());
}

#[test]
fn test_interests_limit_event_types() {
    let registry = ListenerRegistry::new(16);
    let (channel, rx) = Channel::new("client", 16);
    let cache = cache();
    let mut req = request(b"L1");
    req.interests = INTEREST_REMOVED;
    register(&registry, &channel, &req, &cache).unwrap();

    put(&cache, b"k", b"v");
    put(&cache, b"k", b"v2");
    assert!(rx.try_recv().is_none());

    cache.remove(b"k", CacheFlags::none()).unwrap();
    assert_eq!(next_event(&rx).op, CACHE_ENTRY_REMOVED_EVENT);
}

#[test]
fn test_include_current_state_replays_entries() {
    let registry = ListenerRegistry::new(16);
    let (channel, rx) = Channel::new("client", 16);
    let cache = cache();
    put(&cache, b"a", b"1");
    put(&cache, b"b", b"2");

    let mut req = request(b"L1");
    req.include_current_state = true;
    register(&registry, &channel, &req, &cache).unwrap();

    let mut keys = vec![next_event(&rx), next_event(&rx)]
        .into_iter()
        .map(|e| {
            assert_eq!(e.op, CACHE_ENTRY_CREATED_EVENT);
            e.body
        })
        .collect::<Vec<_>>();
    keys.sort();
    assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
}

// =============================================================================
// Registration
// =============================================================================

#[test]
fn test_duplicate_listener_id() {
    let registry = ListenerRegistry::new(16);
    let (channel, _rx) = Channel::new("client", 16);
    let cache = cache();
    assert!(register(&registry, &channel, &request(b"L1"), &cache).unwrap());
    assert!(!register(&registry, &channel, &request(b"L1"), &cache).unwrap());
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_remove_listener_stops_events() {
    let registry = ListenerRegistry::new(16);
    let (channel, rx) = Channel::new("client", 16);
    let cache = cache();
    register(&registry, &channel, &request(b"L1"), &cache).unwrap();

    assert!(registry.remove_listener(b"L1"));
    assert!(!registry.remove_listener(b"L1"));
    put(&cache, b"k", b"v");
    assert!(rx.try_recv().is_none());
}

#[test]
fn test_remove_channel() {
    let registry = ListenerRegistry::new(16);
    let (first, _rx1) = Channel::new("first", 16);
    let (second, _rx2) = Channel::new("second", 16);
    let cache = cache();
    register(&registry, &first, &request(b"A"), &cache).unwrap();
    register(&registry, &first, &request(b"B"), &cache).unwrap();
    register(&registry, &second, &request(b"C"), &cache).unwrap();

    assert_eq!(registry.remove_channel(first.id()), 2);
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_closed_channel_unregisters_from_cache() {
    let registry = ListenerRegistry::new(16);
    let (channel, rx) = Channel::new("client", 16);
    let cache = cache();
    register(&registry, &channel, &request(b"L1"), &cache).unwrap();

    channel.close();
    put(&cache, b"k", b"v");
    put(&cache, b"k", b"v2");
    assert!(rx.try_recv().is_none());
}

// =============================================================================
// Filters and Converters
// =============================================================================

/// Accepts keys starting with the first parameter
struct PrefixFilterFactory;

struct PrefixFilter(Vec<u8>);

impl EventFilter for PrefixFilter {
    fn accept(&self, event: &CacheEvent) -> bool {
        event.key.starts_with(&self.0)
    }
}

impl EventFilterFactory for PrefixFilterFactory {
    fn create(&self, params: &[Vec<u8>]) -> Arc<dyn EventFilter> {
        Arc::new(PrefixFilter(params.first().cloned().unwrap_or_default()))
    }
}

/// Sends the new value instead of the key
struct ValueConverterFactory;

struct ValueConverter;

impl EventConverter for ValueConverter {
    fn convert(&self, event: &CacheEvent) -> Option<Vec<u8>> {
        event.value.clone()
    }
}

impl EventConverterFactory for ValueConverterFactory {
    fn create(&self, _params: &[Vec<u8>]) -> Arc<dyn EventConverter> {
        Arc::new(ValueConverter)
    }
}

#[test]
fn test_filter_factory() {
    let registry = ListenerRegistry::new(16);
    registry.add_filter_factory("prefix", Arc::new(PrefixFilterFactory));
    let (channel, rx) = Channel::new("client", 16);
    let cache = cache();

    let mut req = request(b"L1");
    req.filter = Some(NamedFactory {
        name: "prefix".to_string(),
        params: vec![b"user:".to_vec()],
    });
    register(&registry, &channel, &req, &cache).unwrap();

    put(&cache, b"order:1", b"x");
    put(&cache, b"user:1", b"y");
    let event = next_event(&rx);
    assert_eq!(event.body, b"user:1".to_vec());
    assert!(rx.try_recv().is_none());
}

#[test]
fn test_converter_sends_custom_payload() {
    let registry = ListenerRegistry::new(16);
    registry.add_converter_factory("value", Arc::new(ValueConverterFactory));
    let (channel, rx) = Channel::new("client", 16);
    let cache = cache();

    let mut req = request(b"L1");
    req.converter = Some(NamedFactory {
        name: "value".to_string(),
        params: Vec::new(),
    });
    register(&registry, &channel, &req, &cache).unwrap();

    put(&cache, b"k", b"converted");
    let event = next_event(&rx);
    assert_eq!(event.marker, 1);
    assert_eq!(event.body, b"converted".to_vec());
    assert_eq!(event.version, None);
}

#[test]
fn test_raw_data_marker() {
    let registry = ListenerRegistry::new(16);
    registry.add_converter_factory("value", Arc::new(ValueConverterFactory));
    let (channel, rx) = Channel::new("client", 16);
    let cache = cache();

    let mut req = request(b"L1");
    req.use_raw_data = true;
    req.converter = Some(NamedFactory {
        name: "value".to_string(),
        params: Vec::new(),
    });
    register(&registry, &channel, &req, &cache).unwrap();

    put(&cache, b"k", b"raw");
    assert_eq!(next_event(&rx).marker, 2);
}

#[test]
fn test_unknown_factory_is_rejected() {
    let registry = ListenerRegistry::new(16);
    let (channel, _rx) = Channel::new("client", 16);
    let cache = cache();

    let mut req = request(b"L1");
    req.filter = Some(NamedFactory {
        name: "nope".to_string(),
        params: Vec::new(),
    });
    assert!(matches!(
        register(&registry, &channel, &req, &cache),
        Err(HotRodError::Listener(_))
    ));
    assert!(registry.is_empty());
}

// =============================================================================
// Backpressure
// =============================================================================

#[test]
fn test_slow_channel_queues_then_drops() {
    let registry = ListenerRegistry::new(1);
    let (channel, rx) = Channel::new("slow", 1);
    let cache = cache();
    register(&registry, &channel, &request(b"L1"), &cache).unwrap();

    // a goes straight out, b waits in the queue, c finds the queue full
    put(&cache, b"a", b"1");
    put(&cache, b"b", b"2");
    put(&cache, b"c", b"3");

    assert_eq!(next_event(&rx).body, b"a".to_vec());
    assert!(rx.try_recv().is_none());

    registry.on_writable(channel.id());
    assert_eq!(next_event(&rx).body, b"b".to_vec());
    assert!(rx.try_recv().is_none());
}
