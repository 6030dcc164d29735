//! Client Listener Module
//!
//! Remote clients register listeners on a cache; cache events are turned into event frames
//! pushed down the client's connection.
//!
//! ## Event Flow
//! ```text
//!   cache write ──► EventSender::on_event ──► bounded queue ──► channel (when writable)
//!                        │                                           ▲
//!                        └── filter / converter                      │
//!                                                  writer drained ───┘ (on_writable)
//! ```
//!
//! The cache's notification path never blocks: when the channel is full, events wait in the
//! listener's queue until the writer reports room again, and when the queue is full too
//! the event is dropped with a warning.

mod sender;

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cache::{Cache, CacheEvent, EventKind};
use crate::error::{HotRodError, Result};
use crate::network::ChannelHandle;
use crate::protocol::{ListenerRequest, NamedFactory, VersionedEncoder};

pub use sender::EventSender;

// =============================================================================
// Event Frames
// =============================================================================

/// Event op codes
pub const CACHE_ENTRY_CREATED_EVENT: u8 = 0x60;
pub const CACHE_ENTRY_MODIFIED_EVENT: u8 = 0x61;
pub const CACHE_ENTRY_REMOVED_EVENT: u8 = 0x62;
pub const CACHE_ENTRY_EXPIRED_EVENT: u8 = 0x63;

pub fn event_op_code(kind: EventKind) -> u8 {
    match kind {
        EventKind::Created => CACHE_ENTRY_CREATED_EVENT,
        EventKind::Modified => CACHE_ENTRY_MODIFIED_EVENT,
        EventKind::Removed => CACHE_ENTRY_REMOVED_EVENT,
        EventKind::Expired => CACHE_ENTRY_EXPIRED_EVENT,
    }
}

/// Payload of an event frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    /// Key, plus the entry version for created / modified events
    Plain { key: Vec<u8>, version: Option<u64> },
    /// Converter output
    Custom(Vec<u8>),
    /// Converter output the client asked to receive unmarshalled
    CustomRaw(Vec<u8>),
}

/// An event addressed to one client listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEvent {
    pub protocol_version: u8,
    pub message_id: u64,
    pub kind: EventKind,
    pub listener_id: Vec<u8>,
    pub retried: bool,
    pub payload: EventPayload,
}

// =============================================================================
// Filters and Converters
// =============================================================================

pub trait EventFilter: Send + Sync {
    fn accept(&self, event: &CacheEvent) -> bool;
}

pub trait EventConverter: Send + Sync {
    /// `None` suppresses the event
    fn convert(&self, event: &CacheEvent) -> Option<Vec<u8>>;
}

/// Filter and converter in one pass; `None` rejects the event
pub trait EventFilterConverter: Send + Sync {
    fn filter_and_convert(&self, event: &CacheEvent) -> Option<Vec<u8>>;
}

pub trait EventFilterFactory: Send + Sync {
    fn create(&self, params: &[Vec<u8>]) -> Arc<dyn EventFilter>;
}

pub trait EventConverterFactory: Send + Sync {
    fn create(&self, params: &[Vec<u8>]) -> Arc<dyn EventConverter>;
}

pub trait EventFilterConverterFactory: Send + Sync {
    fn create(&self, params: &[Vec<u8>]) -> Arc<dyn EventFilterConverter>;
}

/// How a listener shapes events before sending them
#[derive(Clone, Default)]
pub enum EventTransform {
    #[default]
    None,
    Filter(Arc<dyn EventFilter>),
    Convert {
        filter: Option<Arc<dyn EventFilter>>,
        converter: Arc<dyn EventConverter>,
    },
    FilterConvert(Arc<dyn EventFilterConverter>),
}

// =============================================================================
// Registry
// =============================================================================

struct Registration {
    sender: Arc<EventSender>,
    cache: Arc<dyn Cache>,
    cache_listener_id: u64,
}

/// All client listeners of this server, keyed by listener id
pub struct ListenerRegistry {
    event_queue_capacity: usize,
    message_ids: Arc<AtomicU64>,
    listeners: RwLock<HashMap<Vec<u8>, Registration>>,
    filter_factories: RwLock<HashMap<String, Arc<dyn EventFilterFactory>>>,
    converter_factories: RwLock<HashMap<String, Arc<dyn EventConverterFactory>>>,
    filter_converter_factories: RwLock<HashMap<String, Arc<dyn EventFilterConverterFactory>>>,
}

impl ListenerRegistry {
    pub fn new(event_queue_capacity: usize) -> Self {
        Self {
            event_queue_capacity: event_queue_capacity.max(1),
            message_ids: Arc::new(AtomicU64::new(1)),
            listeners: RwLock::new(HashMap::new()),
            filter_factories: RwLock::new(HashMap::new()),
            converter_factories: RwLock::new(HashMap::new()),
            filter_converter_factories: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_filter_factory(&self, name: impl Into<String>, factory: Arc<dyn EventFilterFactory>) {
        self.filter_factories.write().insert(name.into(), factory);
    }

    pub fn add_converter_factory(&self, name: impl Into<String>, factory: Arc<dyn EventConverterFactory>) {
        self.converter_factories.write().insert(name.into(), factory);
    }

    pub fn add_filter_converter_factory(&self, name: impl Into<String>, factory: Arc<dyn EventFilterConverterFactory>) {
        self.filter_converter_factories.write().insert(name.into(), factory);
    }

    fn transform_for(&self, request: &ListenerRequest) -> Result<EventTransform> {
        let filter = request.filter.as_ref();
        let converter = request.converter.as_ref();

        // Same name on both sides: a single filter-converter if one is registered
        if let (Some(f), Some(c)) = (filter, converter) {
            if f.name == c.name {
                if let Some(factory) = self.filter_converter_factories.read().get(&f.name) {
                    return Ok(EventTransform::FilterConvert(factory.create(&f.params)));
                }
            }
        }

        let filter = filter.map(|f| self.create_filter(f)).transpose()?;
        match converter {
            Some(c) => {
                let factory = self
                    .converter_factories
                    .read()
                    .get(&c.name)
                    .cloned()
                    .ok_or_else(|| HotRodError::Listener(format!("No converter factory named '{}'", c.name)))?;
                Ok(EventTransform::Convert {
                    filter,
                    converter: factory.create(&c.params),
                })
            }
            None => Ok(filter.map_or(EventTransform::None, EventTransform::Filter)),
        }
    }

    fn create_filter(&self, named: &NamedFactory) -> Result<Arc<dyn EventFilter>> {
        let factory = self
            .filter_factories
            .read()
            .get(&named.name)
            .cloned()
            .ok_or_else(|| HotRodError::Listener(format!("No filter factory named '{}'", named.name)))?;
        Ok(factory.create(&named.params))
    }

    /// Register a client listener on `cache`
    ///
    /// Returns `Ok(false)` when the listener id is already registered.
    pub fn add_listener(
        &self,
        channel: &ChannelHandle,
        protocol_version: u8,
        request: &ListenerRequest,
        cache: Arc<dyn Cache>,
        encoder: Arc<dyn VersionedEncoder>,
    ) -> Result<bool> {
        let transform = self.transform_for(request)?;
        let sender = Arc::new(EventSender::new(
            request,
            Arc::clone(channel),
            protocol_version,
            transform,
            encoder,
            self.event_queue_capacity,
            Arc::clone(&self.message_ids),
        ));

        {
            let mut listeners = self.listeners.write();
            if listeners.contains_key(&request.listener_id) {
                tracing::debug!("Listener {} already registered", sender.display_id());
                return Ok(false);
            }
            let cache_listener_id = cache.add_listener(sender.clone());
            listeners.insert(
                request.listener_id.clone(),
                Registration {
                    sender: Arc::clone(&sender),
                    cache: Arc::clone(&cache),
                    cache_listener_id,
                },
            );
        }
        tracing::debug!(
            "Added listener {} on '{}' for {}",
            sender.display_id(),
            cache.name(),
            channel.peer_addr()
        );

        if request.include_current_state {
            for entry in cache.entries()? {
                sender.send_state(&entry);
            }
        }
        Ok(true)
    }

    /// Unregister by listener id; `false` for unknown ids
    pub fn remove_listener(&self, listener_id: &[u8]) -> bool {
        let removed = self.listeners.write().remove(listener_id);
        match removed {
            Some(registration) => {
                registration.cache.remove_listener(registration.cache_listener_id);
                tracing::debug!("Removed listener {}", registration.sender.display_id());
                true
            }
            None => false,
        }
    }

    /// Drop every listener registered through `channel_id`
    pub fn remove_channel(&self, channel_id: u64) -> usize {
        let ids: Vec<Vec<u8>> = self
            .listeners
            .read()
            .iter()
            .filter(|(_, r)| r.sender.channel_id() == channel_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter().filter(|id| self.remove_listener(id)).count()
    }

    /// The writer of `channel_id` has room again
    pub fn on_writable(&self, channel_id: u64) {
        let senders: Vec<Arc<EventSender>> = self
            .listeners
            .read()
            .values()
            .filter(|r| r.sender.channel_id() == channel_id)
            .map(|r| Arc::clone(&r.sender))
            .collect();
        for sender in senders {
            sender.drain();
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
