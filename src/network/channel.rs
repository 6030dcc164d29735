//! Connection channel
//!
//! The write side of a connection as seen by the rest of the server. Frames are queued on
//! a bounded crossbeam channel drained by the connection's single writer thread; the
//! channel is "writable" while that queue has room.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};

use crate::error::{HotRodError, Result};

/// Shared handle to a connection's outbound side
pub type ChannelHandle = Arc<Channel>;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

pub struct Channel {
    id: u64,
    peer_addr: String,
    tx: Sender<Bytes>,
    open: AtomicBool,
}

/// Receiving end owned by the writer
pub struct ChannelReceiver {
    rx: Receiver<Bytes>,
}

impl ChannelReceiver {
    /// Next frame if one is queued
    pub fn try_recv(&self) -> Option<Bytes> {
        match self.rx.try_recv() {
            Ok(frame) => Some(frame),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Wait up to `timeout` for a frame; `None` on timeout or disconnect
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Bytes> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }
}

impl Channel {
    /// Create a channel with room for `capacity` queued frames
    pub fn new(peer_addr: impl Into<String>, capacity: usize) -> (ChannelHandle, ChannelReceiver) {
        let (tx, rx) = channel::bounded(capacity.max(1));
        let channel = Arc::new(Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr: peer_addr.into(),
            tx,
            open: AtomicBool::new(true),
        });
        (channel, ChannelReceiver { rx })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            tracing::debug!("Channel {} to {} closed", self.id, self.peer_addr);
        }
    }

    /// Open and with room in the write queue
    pub fn is_writable(&self) -> bool {
        self.is_open() && !self.tx.is_full()
    }

    /// Queue a frame, waiting for room
    pub fn write(&self, frame: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(HotRodError::ChannelClosed);
        }
        self.tx.send(frame).map_err(|_| HotRodError::ChannelClosed)
    }

    /// Queue a frame without waiting; hands the frame back when the queue is full
    pub fn try_write(&self, frame: Bytes) -> Result<Option<Bytes>> {
        if !self.is_open() {
            return Err(HotRodError::ChannelClosed);
        }
        match self.tx.try_send(frame) {
            Ok(()) => Ok(None),
            Err(TrySendError::Full(frame)) => Ok(Some(frame)),
            Err(TrySendError::Disconnected(_)) => Err(HotRodError::ChannelClosed),
        }
    }

    /// Queue a frame without waiting; a full queue closes the channel
    pub fn write_or_close(&self, frame: Bytes) -> Result<()> {
        if self.try_write(frame)?.is_none() {
            return Ok(());
        }
        tracing::warn!(
            "Write queue of channel {} to {} is full; closing the connection",
            self.id,
            self.peer_addr
        );
        self.close();
        Err(HotRodError::ChannelClosed)
    }
}
