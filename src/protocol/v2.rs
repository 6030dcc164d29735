//! Protocol 2.x codec (versions 2.0 - 2.8)
//!
//! ## Expirations
//! ```text
//! 2.0, 2.1   lifespan vint secs | max idle vint secs        (<= 0: default or infinite per flags)
//! 2.2+       units (1) | [lifespan vlong] | [max idle vlong]
//!            high nibble = lifespan unit, low nibble = max idle unit,
//!            units 7 (default) and 8 (infinite) carry no duration
//! ```
//!
//! ## Listener Events
//! ```text
//! A1 | msg id vlong | event op | status 0 | topology 0 | listener id ranged
//!    | [custom marker (1), retried (1)]  (2.1+)
//!    | key ranged [+ version i64 for created / modified]  or  custom payload ranged
//! ```

use bytes::{BufMut, BytesMut};

use crate::error::{DecodeError, DecodeResult, Result};
use crate::listener::{event_op_code, ClientEvent, EventPayload};
use crate::topology::{maybe_topology, write_topology_v2};
use crate::tx::{ControlByte, TransactionDecodeContext, TxWrite, Xid};

use super::constants::*;
use super::decoder::{CustomDecodeContext, ListenerDecodeContext, PartialRequest};
use super::header::{ClientIntelligence, MediaType, ProtocolFlags, RequestHeader};
use super::payload;
use super::request::{
    Expiration, IterationRequest, ListenerRequest, NamedFactory, RequestBody, RequestParameters, TimeUnitCode,
};
use super::response::{Response, ResponseBody};
use super::status::OperationStatus;
use super::versioned::{EncodeContext, VersionedDecoder, VersionedEncoder};
use super::wire::{WireBuffer, WireReader, WireWrite};
use super::Operation;

// =============================================================================
// Shared Field Readers
// =============================================================================

/// Op code through topology id; common to every version
pub(super) fn read_header_fields(
    reader: &mut WireReader<'_>,
    version: u8,
    message_id: u64,
    max_cache_name_length: usize,
) -> DecodeResult<RequestHeader> {
    let code = reader.read_u8()?;
    let op = Operation::from_request_code(code, version).ok_or(DecodeError::UnknownOperation(code))?;
    let cache_name = reader.read_limited_string("cache name", max_cache_name_length)?;
    let flags = ProtocolFlags(reader.read_vint()?);
    let client_intelligence = ClientIntelligence::from_code(reader.read_u8()?);
    let topology_id = reader.read_vint_i32()?;
    Ok(RequestHeader {
        version,
        message_id,
        op,
        cache_name,
        flags,
        client_intelligence,
        topology_id,
        key_media_type: None,
        value_media_type: None,
    })
}

/// Lifespan and max-idle in the encoding of `version`
pub(super) fn read_expirations(
    reader: &mut WireReader<'_>,
    version: u8,
    flags: ProtocolFlags,
) -> DecodeResult<(Expiration, Expiration)> {
    if version < VERSION_22 {
        let lifespan = Expiration::from_seconds(reader.read_vint_i32()?, flags.contains(ProtocolFlags::DEFAULT_LIFESPAN));
        let max_idle = Expiration::from_seconds(reader.read_vint_i32()?, flags.contains(ProtocolFlags::DEFAULT_MAXIDLE));
        return Ok((lifespan, max_idle));
    }

    let units = reader.read_u8()?;
    let lifespan_unit = TimeUnitCode::from_code((units & 0xF0) >> 4)?;
    let max_idle_unit = TimeUnitCode::from_code(units & 0x0F)?;
    let lifespan = read_duration(reader, lifespan_unit)?;
    let max_idle = read_duration(reader, max_idle_unit)?;
    Ok((lifespan, max_idle))
}

fn read_duration(reader: &mut WireReader<'_>, unit: TimeUnitCode) -> DecodeResult<Expiration> {
    if unit.carries_duration() {
        let amount = reader.read_vlong()? as i64;
        Ok(unit.to_expiration(amount))
    } else {
        Ok(unit.to_expiration(0))
    }
}

/// Key, value and parameter fields of the standard operations
pub(super) fn read_standard_parameters(
    reader: &mut WireReader<'_>,
    header: &RequestHeader,
) -> DecodeResult<RequestParameters> {
    match header.op {
        Operation::RemoveIfUnmodified => Ok(RequestParameters {
            stream_version: reader.read_i64()? as u64,
            ..RequestParameters::default()
        }),
        Operation::GetAll => Ok(RequestParameters {
            value_length: reader.read_vint()? as usize,
            ..RequestParameters::default()
        }),
        op => {
            let (lifespan, max_idle) = read_expirations(reader, header.version, header.flags)?;
            let stream_version = if op == Operation::ReplaceIfUnmodified {
                reader.read_i64()? as u64
            } else {
                0
            };
            let value_length = reader.read_vint()? as usize;
            // PutAll carries an entry count here
            let max = reader.limits().max_ranged_bytes;
            if op != Operation::PutAll && value_length > max {
                return Err(DecodeError::LimitExceeded {
                    what: "value",
                    len: value_length,
                    max,
                });
            }
            Ok(RequestParameters {
                lifespan,
                max_idle,
                stream_version,
                value_length,
            })
        }
    }
}

fn read_media_type(reader: &mut WireReader<'_>) -> DecodeResult<Option<MediaType>> {
    match reader.read_u8()? {
        0 => Ok(None),
        1 => {
            let id = reader.read_vint()?;
            let params = read_media_params(reader)?;
            Ok(Some(MediaType::Predefined { id, params }))
        }
        2 => {
            let name = reader.read_string()?;
            let params = read_media_params(reader)?;
            Ok(Some(MediaType::Custom { name, params }))
        }
        other => Err(DecodeError::Malformed(format!("unknown media type info {}", other))),
    }
}

fn read_media_params(reader: &mut WireReader<'_>) -> DecodeResult<Vec<(String, String)>> {
    let count = reader.read_vint()?;
    let mut params = Vec::with_capacity(count.min(64) as usize);
    for _ in 0..count {
        params.push((reader.read_string()?, reader.read_string()?));
    }
    Ok(params)
}

/// u8 count followed by ranged parameters
fn read_factory_params(reader: &mut WireReader<'_>) -> DecodeResult<Vec<Vec<u8>>> {
    let count = reader.read_u8()?;
    let mut params = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        params.push(reader.read_ranged_bytes()?);
    }
    Ok(params)
}

/// Factory name, parameters only when the name is not empty
fn read_named_factory(reader: &mut WireReader<'_>) -> DecodeResult<Option<NamedFactory>> {
    let Some(name) = reader.read_optional_string()? else {
        return Ok(None);
    };
    let params = read_factory_params(reader)?;
    Ok(Some(NamedFactory { name, params }))
}

fn read_xid(reader: &mut WireReader<'_>) -> DecodeResult<Xid> {
    let format_id = reader.read_signed_vint()?;
    let global_id = reader.read_ranged_bytes()?;
    let branch_qualifier = reader.read_ranged_bytes()?;
    Ok(Xid {
        format_id,
        global_id,
        branch_qualifier,
    })
}

fn read_tx_write(reader: &mut WireReader<'_>, header: &RequestHeader) -> DecodeResult<TxWrite> {
    let key = reader.read_ranged_bytes()?;
    let control = ControlByte(reader.read_u8()?);
    let version_read = if control.has_version() {
        reader.read_i64()? as u64
    } else {
        0
    };
    if control.remove() {
        return Ok(TxWrite {
            key,
            control,
            version_read,
            lifespan: Expiration::Default,
            max_idle: Expiration::Default,
            value: None,
        });
    }
    let (lifespan, max_idle) = read_expirations(reader, header.version, header.flags)?;
    let value = reader.read_ranged_bytes()?;
    Ok(TxWrite {
        key,
        control,
        version_read,
        lifespan,
        max_idle,
        value: Some(value),
    })
}

fn lost_context(what: &str) -> DecodeError {
    DecodeError::Malformed(format!("{} decode context missing", what))
}

// =============================================================================
// Decoder2x
// =============================================================================

/// Request decoder for 2.0 - 2.8
pub struct Decoder2x;

impl Decoder2x {
    /// AddClientListener in three marks: id + state flag, filter, converter + options
    fn read_listener(
        &self,
        header: &RequestHeader,
        buf: &mut WireBuffer<'_>,
        partial: &mut PartialRequest,
    ) -> DecodeResult<RequestBody> {
        if !matches!(partial.custom, CustomDecodeContext::Listener(_)) {
            let (listener_id, include_current_state) =
                buf.read(|r| Ok((r.read_ranged_bytes()?, r.read_bool()?)))?;
            partial.custom = CustomDecodeContext::Listener(ListenerDecodeContext {
                listener_id,
                include_current_state,
                filter: None,
            });
        }
        let CustomDecodeContext::Listener(ctx) = &mut partial.custom else {
            return Err(lost_context("listener"));
        };

        if ctx.filter.is_none() {
            let filter = buf.read(read_named_factory)?;
            ctx.filter = Some(filter);
        }

        let version = header.version;
        let (converter, use_raw_data, interests) = buf.read(|r| {
            let converter = read_named_factory(r)?;
            let use_raw_data = r.read_bool()?;
            let interests = if version >= VERSION_26 { r.read_vint()? } else { 0 };
            Ok((converter, use_raw_data, interests))
        })?;

        let CustomDecodeContext::Listener(ctx) = std::mem::take(&mut partial.custom) else {
            return Err(lost_context("listener"));
        };
        Ok(RequestBody::AddListener(ListenerRequest {
            listener_id: ctx.listener_id,
            include_current_state: ctx.include_current_state,
            filter: ctx.filter.flatten(),
            converter,
            use_raw_data,
            interests,
        }))
    }

    fn read_iteration_start(&self, header: &RequestHeader, buf: &mut WireBuffer<'_>) -> DecodeResult<RequestBody> {
        let version = header.version;
        buf.read(|r| {
            let segments = r.read_optional_ranged_bytes()?;
            let filter = match r.read_optional_string()? {
                Some(name) => {
                    let params = if version >= VERSION_24 {
                        read_factory_params(r)?
                    } else {
                        Vec::new()
                    };
                    Some(NamedFactory { name, params })
                }
                None => None,
            };
            let batch_size = r.read_vint()?;
            let metadata = if version >= VERSION_24 { r.read_bool()? } else { false };
            Ok(RequestBody::IterationStart(IterationRequest {
                segments,
                filter,
                batch_size,
                metadata,
            }))
        })
    }
}

impl VersionedDecoder for Decoder2x {
    fn read_header(
        &self,
        reader: &mut WireReader<'_>,
        version: u8,
        message_id: u64,
        max_cache_name_length: usize,
    ) -> DecodeResult<RequestHeader> {
        let mut header = read_header_fields(reader, version, message_id, max_cache_name_length)?;
        if version >= VERSION_28 {
            header.key_media_type = read_media_type(reader)?;
            header.value_media_type = read_media_type(reader)?;
        }
        Ok(header)
    }

    fn read_custom_header(
        &self,
        header: &RequestHeader,
        buf: &mut WireBuffer<'_>,
        partial: &mut PartialRequest,
    ) -> DecodeResult<RequestBody> {
        match header.op {
            Operation::CommitTx | Operation::RollbackTx => {
                let xid = buf.read(read_xid)?;
                Ok(RequestBody::TxBoundary { xid })
            }
            Operation::PrepareTx => {
                if !matches!(partial.custom, CustomDecodeContext::Transaction(_)) {
                    let (xid, one_phase, count) =
                        buf.read(|r| Ok((read_xid(r)?, r.read_bool()?, r.read_vint()? as usize)))?;
                    tracing::trace!("Decoding prepare of {} with {} writes", xid, count);
                    partial.custom =
                        CustomDecodeContext::Transaction(TransactionDecodeContext::new(xid, one_phase, count));
                }
                let CustomDecodeContext::Transaction(ctx) = &mut partial.custom else {
                    return Err(lost_context("transaction"));
                };
                // One mark per write
                while !ctx.is_complete() {
                    let write = buf.read(|r| read_tx_write(r, header))?;
                    ctx.writes.push(write);
                }
                match std::mem::take(&mut partial.custom) {
                    CustomDecodeContext::Transaction(ctx) => Ok(RequestBody::Prepare(ctx)),
                    _ => Err(lost_context("transaction")),
                }
            }
            op => Err(DecodeError::Malformed(format!("{:?} has no custom header", op))),
        }
    }

    fn read_custom_key(
        &self,
        header: &RequestHeader,
        buf: &mut WireBuffer<'_>,
        partial: &mut PartialRequest,
    ) -> DecodeResult<RequestBody> {
        match header.op {
            Operation::BulkGet | Operation::BulkGetKeys => {
                let count = buf.read(|r| r.read_vint())?;
                Ok(RequestBody::Bulk { count })
            }
            Operation::AddClientListener => self.read_listener(header, buf, partial),
            Operation::RemoveClientListener => {
                let listener_id = buf.read(|r| r.read_ranged_bytes())?;
                Ok(RequestBody::RemoveListener { listener_id })
            }
            Operation::IterationStart => self.read_iteration_start(header, buf),
            Operation::IterationNext | Operation::IterationEnd => {
                let iteration_id = buf.read(|r| r.read_string())?;
                Ok(RequestBody::Iteration { iteration_id })
            }
            op => Err(DecodeError::Malformed(format!("{:?} has no custom key", op))),
        }
    }

    fn read_parameters(&self, header: &RequestHeader, buf: &mut WireBuffer<'_>) -> DecodeResult<RequestParameters> {
        buf.read(|r| read_standard_parameters(r, header))
    }

    fn read_custom_value(
        &self,
        header: &RequestHeader,
        params: &RequestParameters,
        buf: &mut WireBuffer<'_>,
        partial: &mut PartialRequest,
    ) -> DecodeResult<RequestBody> {
        let count = params.value_length;
        match header.op {
            Operation::PutAll => {
                if !matches!(partial.custom, CustomDecodeContext::Entries(_)) {
                    partial.custom = CustomDecodeContext::Entries(Vec::with_capacity(count.min(1024)));
                }
                let CustomDecodeContext::Entries(entries) = &mut partial.custom else {
                    return Err(lost_context("put all"));
                };
                while entries.len() < count {
                    let entry = buf.read(|r| Ok((r.read_ranged_bytes()?, r.read_ranged_bytes()?)))?;
                    entries.push(entry);
                }
                let CustomDecodeContext::Entries(entries) = std::mem::take(&mut partial.custom) else {
                    return Err(lost_context("put all"));
                };
                Ok(RequestBody::PutAll {
                    entries,
                    params: params.clone(),
                })
            }
            Operation::GetAll => {
                if !matches!(partial.custom, CustomDecodeContext::Keys(_)) {
                    partial.custom = CustomDecodeContext::Keys(Vec::with_capacity(count.min(1024)));
                }
                let CustomDecodeContext::Keys(keys) = &mut partial.custom else {
                    return Err(lost_context("get all"));
                };
                while keys.len() < count {
                    let key = buf.read(|r| r.read_ranged_bytes())?;
                    keys.push(key);
                }
                let CustomDecodeContext::Keys(keys) = std::mem::take(&mut partial.custom) else {
                    return Err(lost_context("get all"));
                };
                Ok(RequestBody::GetAll { keys })
            }
            op => Err(DecodeError::Malformed(format!("{:?} has no custom value", op))),
        }
    }
}

// =============================================================================
// Encoder2x
// =============================================================================

/// Response and event encoder for 2.0 - 2.8
pub struct Encoder2x;

impl Encoder2x {
    /// Final status and previous-value field of a response
    fn status_and_previous<'r>(response: &'r Response, ctx: &EncodeContext<'_>) -> (OperationStatus, Option<&'r [u8]>) {
        let (status, previous) = match (&response.body, response.status) {
            (ResponseBody::Previous(Some(prev)), OperationStatus::Success) => {
                (OperationStatus::SuccessWithPrevious, Some(prev.as_slice()))
            }
            (ResponseBody::Previous(Some(prev)), OperationStatus::OperationNotExecuted) => {
                (OperationStatus::NotExecutedWithPrevious, Some(prev.as_slice()))
            }
            (_, status) => (status, None),
        };
        let status = if response.header.version >= VERSION_24 && ctx.object_storage && !status.is_error() {
            status.with_object_storage()
        } else {
            status
        };
        (status, previous)
    }
}

impl VersionedEncoder for Encoder2x {
    fn write_response(&self, response: &Response, ctx: &EncodeContext<'_>, buf: &mut BytesMut) -> Result<()> {
        let (status, previous) = Self::status_and_previous(response, ctx);
        payload::write_preamble(response, status, buf);

        let update = maybe_topology(&response.header, ctx.topology);
        if let Some(update) = &update {
            tracing::trace!(
                "Sending topology {} to client at {}",
                update.topology_id(),
                response.header.topology_id
            );
        }
        write_topology_v2(update.as_ref(), response.header.client_intelligence, buf);

        payload::write_body(response, response.header.version, previous, buf);
        Ok(())
    }

    fn write_event(&self, event: &ClientEvent, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(MAGIC_RES);
        buf.put_vlong(event.message_id);
        buf.put_u8(event_op_code(event.kind));
        buf.put_u8(OperationStatus::Success.code());
        buf.put_u8(0);
        buf.put_ranged_bytes(&event.listener_id);

        if event.protocol_version >= VERSION_21 {
            let marker = match event.payload {
                EventPayload::Plain { .. } => 0,
                EventPayload::Custom(_) => 1,
                EventPayload::CustomRaw(_) => 2,
            };
            buf.put_u8(marker);
            buf.put_u8(u8::from(event.retried));
        }

        match &event.payload {
            EventPayload::Plain { key, version } => {
                buf.put_ranged_bytes(key);
                if let Some(version) = version {
                    buf.put_i64(*version as i64);
                }
            }
            EventPayload::Custom(bytes) | EventPayload::CustomRaw(bytes) => buf.put_ranged_bytes(bytes),
        }
        Ok(())
    }
}
