//! Protocol 1.x codec (versions 1.0 - 1.3)
//!
//! The 1.x header ends with a transaction type byte which must be `0`. Expirations are whole
//! seconds, and write responses with force-return-previous always carry a previous value
//! field (empty when there was none) under the plain status codes.

use bytes::BytesMut;

use crate::error::{DecodeError, DecodeResult, HotRodError, Result};
use crate::listener::ClientEvent;
use crate::topology::{maybe_topology, write_topology_v1};

use super::decoder::PartialRequest;
use super::header::RequestHeader;
use super::payload;
use super::request::{RequestBody, RequestParameters};
use super::response::{Response, ResponseBody};
use super::v2::{read_header_fields, read_standard_parameters};
use super::versioned::{EncodeContext, VersionedDecoder, VersionedEncoder};
use super::wire::{WireBuffer, WireReader};
use super::Operation;

/// Request decoder for 1.0 - 1.3
pub struct Decoder1x;

impl VersionedDecoder for Decoder1x {
    fn read_header(
        &self,
        reader: &mut WireReader<'_>,
        version: u8,
        message_id: u64,
        max_cache_name_length: usize,
    ) -> DecodeResult<RequestHeader> {
        let header = read_header_fields(reader, version, message_id, max_cache_name_length)?;
        let tx_type = reader.read_u8()?;
        if tx_type != 0 {
            return Err(DecodeError::Malformed(format!(
                "transaction type {} is not supported",
                tx_type
            )));
        }
        Ok(header)
    }

    fn read_custom_key(
        &self,
        header: &RequestHeader,
        buf: &mut WireBuffer<'_>,
        _partial: &mut PartialRequest,
    ) -> DecodeResult<RequestBody> {
        match header.op {
            Operation::BulkGet | Operation::BulkGetKeys => {
                let count = buf.read(|r| r.read_vint())?;
                Ok(RequestBody::Bulk { count })
            }
            op => Err(DecodeError::Malformed(format!("{:?} is not a 1.x operation", op))),
        }
    }

    fn read_parameters(&self, header: &RequestHeader, buf: &mut WireBuffer<'_>) -> DecodeResult<RequestParameters> {
        buf.read(|r| read_standard_parameters(r, header))
    }

    fn read_custom_value(
        &self,
        header: &RequestHeader,
        _params: &RequestParameters,
        _buf: &mut WireBuffer<'_>,
        _partial: &mut PartialRequest,
    ) -> DecodeResult<RequestBody> {
        Err(DecodeError::Malformed(format!("{:?} is not a 1.x operation", header.op)))
    }
}

/// Response encoder for 1.0 - 1.3
pub struct Encoder1x;

impl VersionedEncoder for Encoder1x {
    fn write_response(&self, response: &Response, ctx: &EncodeContext<'_>, buf: &mut BytesMut) -> Result<()> {
        payload::write_preamble(response, response.status, buf);

        let update = maybe_topology(&response.header, ctx.topology);
        write_topology_v1(update.as_ref(), ctx.topology, response.header.client_intelligence, buf);

        let previous = match &response.body {
            ResponseBody::Previous(prev) => Some(prev.as_deref().unwrap_or(&[])),
            _ => None,
        };
        payload::write_body(response, response.header.version, previous, buf);
        Ok(())
    }

    fn write_event(&self, event: &ClientEvent, _buf: &mut BytesMut) -> Result<()> {
        Err(HotRodError::Protocol(format!(
            "listener events are not supported by protocol version {}",
            event.protocol_version
        )))
    }
}
