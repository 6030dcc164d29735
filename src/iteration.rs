//! Iteration Manager
//!
//! Server side cursors for IterationStart / IterationNext / IterationEnd.
//!
//! ## Cursor Lifecycle
//! ```text
//!   start ──► snapshot entries (filtered by segment, ordered by segment)
//!     │
//!   next  ──► up to batch_size entries + segments finished by this batch
//!     │
//!   end / channel closed / idle timeout ──► removed
//! ```
//!
//! Segments are reported finished exactly once, in the batch that hands out their last
//! entry (or in the first batch when they had none). Segment sets travel as bitsets:
//! byte `i`, bit `j` stands for segment `8 * i + j`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::cache::{Cache, CacheEntry};
use crate::error::{HotRodError, Result};
use crate::protocol::IterationRequest;

/// One IterationNext result
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IterationBatch {
    /// Bitset of segments completed by this batch
    pub finished_segments: Vec<u8>,
    pub entries: Vec<CacheEntry>,
    /// Whether entries go out with their metadata
    pub metadata: bool,
}

/// Whether `segment` is set in `bits`
pub fn segment_in(bits: &[u8], segment: usize) -> bool {
    bits.get(segment / 8).is_some_and(|b| b & (1 << (segment % 8)) != 0)
}

/// Bitset of `segments`, trimmed after the highest set byte
pub fn segments_to_bits(segments: impl IntoIterator<Item = usize>) -> Vec<u8> {
    let mut bits = Vec::new();
    for segment in segments {
        let byte = segment / 8;
        if bits.len() <= byte {
            bits.resize(byte + 1, 0);
        }
        bits[byte] |= 1 << (segment % 8);
    }
    bits
}

struct Cursor {
    pending: VecDeque<(usize, CacheEntry)>,
    /// Entries still to hand out, per segment
    remaining: HashMap<usize, usize>,
    /// Requested segments not yet reported finished
    unreported: Vec<usize>,
}

struct IterationState {
    cache_name: String,
    channel_id: u64,
    batch_size: usize,
    metadata: bool,
    cursor: Mutex<Cursor>,
    last_access: Mutex<Instant>,
}

impl IterationState {
    fn next_batch(&self) -> IterationBatch {
        *self.last_access.lock() = Instant::now();
        let mut cursor = self.cursor.lock();

        let mut entries = Vec::with_capacity(self.batch_size.min(cursor.pending.len()));
        while entries.len() < self.batch_size {
            let Some((segment, entry)) = cursor.pending.pop_front() else {
                break;
            };
            if let Some(left) = cursor.remaining.get_mut(&segment) {
                *left = left.saturating_sub(1);
            }
            entries.push(entry);
        }

        let Cursor {
            remaining, unreported, ..
        } = &mut *cursor;
        let mut finished = Vec::new();
        unreported.retain(|segment| {
            if remaining.get(segment).copied().unwrap_or(0) == 0 {
                finished.push(*segment);
                false
            } else {
                true
            }
        });

        IterationBatch {
            finished_segments: segments_to_bits(finished),
            entries,
            metadata: self.metadata,
        }
    }
}

/// Open iteration cursors of this server
pub struct IterationManager {
    cursors: Mutex<HashMap<String, Arc<IterationState>>>,
    next_id: AtomicU64,
    idle_timeout: Duration,
}

impl IterationManager {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            cursors: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            idle_timeout,
        }
    }

    /// Open a cursor over `cache` bound to `channel_id`; returns its id
    pub fn start(&self, cache: &dyn Cache, channel_id: u64, request: &IterationRequest) -> Result<String> {
        if let Some(filter) = &request.filter {
            return Err(HotRodError::Iteration(format!(
                "iteration filter '{}' is not supported",
                filter.name
            )));
        }

        let num_segments = cache.configuration().num_segments.max(1);
        let requested: Vec<usize> = match &request.segments {
            Some(bits) => (0..num_segments).filter(|&s| segment_in(bits, s)).collect(),
            None => (0..num_segments).collect(),
        };

        let mut selected: Vec<(usize, CacheEntry)> = cache
            .entries()?
            .into_iter()
            .map(|entry| (cache.segment_of(&entry.key), entry))
            .filter(|(segment, _)| request.segments.as_ref().map_or(true, |bits| segment_in(bits, *segment)))
            .collect();
        selected.sort_by(|(sa, ea), (sb, eb)| sa.cmp(sb).then_with(|| ea.key.cmp(&eb.key)));

        let mut remaining: HashMap<usize, usize> = HashMap::new();
        for (segment, _) in &selected {
            *remaining.entry(*segment).or_insert(0) += 1;
        }

        let id = format!("iter-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let state = IterationState {
            cache_name: cache.name().to_string(),
            channel_id,
            batch_size: (request.batch_size as usize).max(1),
            metadata: request.metadata,
            cursor: Mutex::new(Cursor {
                pending: selected.into(),
                remaining,
                unreported: requested,
            }),
            last_access: Mutex::new(Instant::now()),
        };
        tracing::debug!(
            "Started iteration {} over '{}' (batch {}, metadata {})",
            id,
            state.cache_name,
            state.batch_size,
            state.metadata
        );
        self.cursors.lock().insert(id.clone(), Arc::new(state));
        Ok(id)
    }

    /// Next batch, `None` for unknown ids
    pub fn next(&self, id: &str) -> Option<IterationBatch> {
        let state = self.cursors.lock().get(id).cloned()?;
        Some(state.next_batch())
    }

    /// Close a cursor; `false` for unknown ids
    pub fn close(&self, id: &str) -> bool {
        let removed = self.cursors.lock().remove(id).is_some();
        if removed {
            tracing::debug!("Closed iteration {}", id);
        }
        removed
    }

    /// Close every cursor opened through `channel_id`
    pub fn close_channel(&self, channel_id: u64) -> usize {
        let mut cursors = self.cursors.lock();
        let before = cursors.len();
        cursors.retain(|_, state| state.channel_id != channel_id);
        before - cursors.len()
    }

    /// Drop cursors idle for longer than the configured timeout
    pub fn reap_idle(&self) -> usize {
        let timeout = self.idle_timeout;
        let mut cursors = self.cursors.lock();
        let before = cursors.len();
        cursors.retain(|id, state| {
            let idle = state.last_access.lock().elapsed();
            if idle > timeout {
                tracing::debug!("Reaping iteration {} idle for {:?}", id, idle);
                false
            } else {
                true
            }
        });
        before - cursors.len()
    }

    pub fn len(&self) -> usize {
        self.cursors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
