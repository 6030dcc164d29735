//! Response payload serialization shared by both protocol generations
//!
//! ```text
//! value              ranged
//! value + version    version i64 | ranged
//! metadata           flags (1) | [created i64, lifespan vint] | [last used i64, max idle vint]
//!                    | version i64 | ranged value
//! stats              count vint | (name, value) strings
//! bulk               (1, key[, value]) * n | 0
//! entries            count vint | (key, value) * n
//! iteration batch    finished segments ranged | count vint | [projection vint]
//!                    | ([metadata byte [+ metadata]], key, value) * count
//! transaction        XA code i32 (success only)
//! error              message string
//! ```

use bytes::{BufMut, BytesMut};

use crate::cache::CacheEntry;
use crate::iteration::IterationBatch;

use super::constants::*;
use super::response::{Response, ResponseBody};
use super::status::OperationStatus;
use super::wire::WireWrite;

/// Magic, message id, op code and status
pub(super) fn write_preamble(response: &Response, status: OperationStatus, buf: &mut BytesMut) {
    buf.put_u8(MAGIC_RES);
    buf.put_vlong(response.header.message_id);
    buf.put_u8(response.op_code());
    buf.put_u8(status.code());
}

/// Expiration metadata of an entry, without the value
pub(super) fn write_metadata(entry: &CacheEntry, buf: &mut BytesMut) {
    let mut flags = 0u8;
    if entry.lifespan.is_none() {
        flags |= INFINITE_LIFESPAN;
    }
    if entry.max_idle.is_none() {
        flags |= INFINITE_MAXIDLE;
    }
    buf.put_u8(flags);
    if let Some(lifespan) = entry.lifespan {
        buf.put_i64(entry.created);
        buf.put_vint(lifespan.as_secs().min(u64::from(u32::MAX)) as u32);
    }
    if let Some(max_idle) = entry.max_idle {
        buf.put_i64(entry.last_used);
        buf.put_vint(max_idle.as_secs().min(u64::from(u32::MAX)) as u32);
    }
    buf.put_i64(entry.version as i64);
}

fn write_iteration_batch(batch: &IterationBatch, version: u8, buf: &mut BytesMut) {
    buf.put_ranged_bytes(&batch.finished_segments);
    buf.put_vint(batch.entries.len() as u32);
    if version >= VERSION_24 && !batch.entries.is_empty() {
        // Projection size: one value per entry
        buf.put_vint(1);
    }
    for entry in &batch.entries {
        if version > VERSION_24 {
            if batch.metadata {
                buf.put_u8(1);
                write_metadata(entry, buf);
            } else {
                buf.put_u8(0);
            }
        }
        buf.put_ranged_bytes(&entry.key);
        buf.put_ranged_bytes(&entry.value);
    }
}

/// Operation payload
///
/// `previous` is the previous-value field of write operations, already decided by the
/// versioned encoder: `None` writes nothing.
pub(super) fn write_body(response: &Response, version: u8, previous: Option<&[u8]>, buf: &mut BytesMut) {
    match &response.body {
        ResponseBody::Empty => {}
        ResponseBody::Previous(_) => {
            if let Some(prev) = previous {
                buf.put_ranged_bytes(prev);
            }
        }
        ResponseBody::Value(value) => buf.put_ranged_bytes(value),
        ResponseBody::ValueWithVersion { value, version } => {
            buf.put_i64(*version as i64);
            buf.put_ranged_bytes(value);
        }
        ResponseBody::ValueWithMetadata(entry) => {
            write_metadata(entry, buf);
            buf.put_ranged_bytes(&entry.value);
        }
        ResponseBody::Stats(stats) => {
            buf.put_vint(stats.len() as u32);
            for (name, value) in stats {
                buf.put_string(name);
                buf.put_string(value);
            }
        }
        ResponseBody::Size(size) => buf.put_vlong(*size),
        ResponseBody::BulkEntries(entries) => {
            for (key, value) in entries {
                buf.put_u8(1);
                buf.put_ranged_bytes(key);
                buf.put_ranged_bytes(value);
            }
            buf.put_u8(0);
        }
        ResponseBody::BulkKeys(keys) => {
            for key in keys {
                buf.put_u8(1);
                buf.put_ranged_bytes(key);
            }
            buf.put_u8(0);
        }
        ResponseBody::Entries(entries) => {
            buf.put_vint(entries.len() as u32);
            for (key, value) in entries {
                buf.put_ranged_bytes(key);
                buf.put_ranged_bytes(value);
            }
        }
        ResponseBody::IterationStart { iteration_id } => buf.put_string(iteration_id),
        ResponseBody::IterationNext(batch) => write_iteration_batch(batch, version, buf),
        ResponseBody::Transaction(code) => {
            if response.status == OperationStatus::Success {
                buf.put_i32(*code);
            }
        }
        ResponseBody::Error(message) => buf.put_string(message),
    }
}
