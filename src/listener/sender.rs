//! Per-listener event sender

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;

use crate::cache::{CacheEntry, CacheEvent, CacheListener, EventKind, ListenerStatus};
use crate::error::Result;
use crate::network::ChannelHandle;
use crate::protocol::constants::*;
use crate::protocol::{ListenerRequest, VersionedEncoder};

use super::{ClientEvent, EventPayload, EventTransform};

/// Pushes one listener's events to its client
pub struct EventSender {
    listener_id: Vec<u8>,
    channel: ChannelHandle,
    protocol_version: u8,
    interests: u32,
    use_raw_data: bool,
    transform: EventTransform,
    encoder: Arc<dyn VersionedEncoder>,

    queue: ArrayQueue<ClientEvent>,
    /// Encoded frame that did not fit in the channel; sent before anything else
    pending: Mutex<Option<Bytes>>,
    message_ids: Arc<AtomicU64>,
    dropped: AtomicU64,
}

impl EventSender {
    pub(super) fn new(
        request: &ListenerRequest,
        channel: ChannelHandle,
        protocol_version: u8,
        transform: EventTransform,
        encoder: Arc<dyn VersionedEncoder>,
        queue_capacity: usize,
        message_ids: Arc<AtomicU64>,
    ) -> Self {
        let interests = if request.interests == 0 {
            INTEREST_ALL
        } else {
            request.interests
        };
        Self {
            listener_id: request.listener_id.clone(),
            channel,
            protocol_version,
            interests,
            use_raw_data: request.use_raw_data,
            transform,
            encoder,
            queue: ArrayQueue::new(queue_capacity),
            pending: Mutex::new(None),
            message_ids,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn channel_id(&self) -> u64 {
        self.channel.id()
    }

    /// Listener id as hex, for logs
    pub fn display_id(&self) -> String {
        self.listener_id.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Events dropped because the queue was full
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn queued_events(&self) -> usize {
        self.queue.len()
    }

    fn is_interested(&self, kind: EventKind) -> bool {
        let bit = match kind {
            EventKind::Created => INTEREST_CREATED,
            EventKind::Modified => INTEREST_MODIFIED,
            EventKind::Removed => INTEREST_REMOVED,
            EventKind::Expired => INTEREST_EXPIRED,
        };
        self.interests & bit != 0
    }

    fn custom(&self, bytes: Vec<u8>) -> EventPayload {
        if self.use_raw_data && self.protocol_version >= VERSION_21 {
            EventPayload::CustomRaw(bytes)
        } else {
            EventPayload::Custom(bytes)
        }
    }

    fn payload_for(&self, event: &CacheEvent) -> Option<EventPayload> {
        let plain = || EventPayload::Plain {
            key: event.key.clone(),
            version: matches!(event.kind, EventKind::Created | EventKind::Modified).then_some(event.version),
        };
        match &self.transform {
            EventTransform::None => Some(plain()),
            EventTransform::Filter(filter) => filter.accept(event).then(plain),
            EventTransform::Convert { filter, converter } => {
                if filter.as_ref().is_some_and(|f| !f.accept(event)) {
                    return None;
                }
                converter.convert(event).map(|bytes| self.custom(bytes))
            }
            EventTransform::FilterConvert(fc) => fc.filter_and_convert(event).map(|bytes| self.custom(bytes)),
        }
    }

    /// Replay an existing entry as a created event
    pub(super) fn send_state(&self, entry: &CacheEntry) {
        let event = CacheEvent {
            kind: EventKind::Created,
            key: entry.key.clone(),
            value: Some(entry.value.clone()),
            old_value: None,
            version: entry.version,
            retried: false,
        };
        self.on_event(&event);
    }

    fn enqueue(&self, event: ClientEvent) {
        if let Err(rejected) = self.queue.push(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "Event queue full for listener {}; dropping {:?} event",
                self.display_id(),
                rejected.kind
            );
        }
    }

    fn encode(&self, event: &ClientEvent) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(32 + event.listener_id.len());
        self.encoder.write_event(event, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Write queued events while the channel has room
    pub fn drain(&self) {
        let mut pending = self.pending.lock();
        loop {
            let frame = match pending.take() {
                Some(frame) => frame,
                None => match self.queue.pop() {
                    Some(event) => match self.encode(&event) {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::warn!("Failed to encode event for listener {}: {}", self.display_id(), e);
                            continue;
                        }
                    },
                    None => break,
                },
            };
            match self.channel.try_write(frame) {
                Ok(None) => {}
                Ok(Some(frame)) => {
                    *pending = Some(frame);
                    break;
                }
                Err(_) => break,
            }
        }
    }
}

impl CacheListener for EventSender {
    fn on_event(&self, event: &CacheEvent) -> ListenerStatus {
        if !self.channel.is_open() {
            tracing::debug!(
                "Channel {} closed; unregistering listener {}",
                self.channel.id(),
                self.display_id()
            );
            return ListenerStatus::Remove;
        }
        if !self.is_interested(event.kind) {
            return ListenerStatus::Keep;
        }
        // Removing an absent key is not an event
        if event.kind == EventKind::Removed && event.old_value.is_none() {
            return ListenerStatus::Keep;
        }
        let Some(payload) = self.payload_for(event) else {
            return ListenerStatus::Keep;
        };

        self.enqueue(ClientEvent {
            protocol_version: self.protocol_version,
            message_id: self.message_ids.fetch_add(1, Ordering::Relaxed),
            kind: event.kind,
            listener_id: self.listener_id.clone(),
            retried: event.retried,
            payload,
        });

        if self.channel.is_writable() {
            self.drain();
        }
        ListenerStatus::Keep
    }
}
