//! Frame decoder
//!
//! Turns the connection's byte stream into [`RequestContext`]s. `decode` may be called any
//! number of times as bytes arrive; it never discards bytes of a frame it has not finished.
//!
//! ## Decode States
//! ```text
//!            ┌──────────────┐
//!   ┌───────►│    Header    │── preamble + versioned header
//!   │        └──────┬───────┘
//!   │               │ operation descriptor picks the stages
//!   │     ┌─────────┼───────────┬──────────────┐
//!   │     ▼         ▼           ▼              ▼
//!   │ HeaderCustom  Key ──► Parameters ──► Value
//!   │  (tx ops)     │           │
//!   │               ▼           ▼
//!   │           KeyCustom   ValueCustom
//!   │               │           │
//!   └───────────────┴───────────┘  request complete, back to Header
//! ```
//!
//! Each stage reads one field group through [`WireBuffer::read`], so consumed bytes are
//! released only when the group is complete. Values from finished stages wait in the
//! per-connection [`PartialRequest`] accumulator.
//!
//! ## Error Recovery
//! A bad frame produces an error response and puts the decoder in recovery: bytes are
//! skipped until the next request magic. A bad magic byte with no prior error means the
//! stream is out of sync and is fatal for the connection.

use std::sync::Arc;

use bytes::{Buf, BytesMut};

use crate::error::{DecodeError, HotRodError, Result};
use crate::tx::TransactionDecodeContext;

use super::constants::MAGIC_REQ;
use super::header::RequestHeader;
use super::request::{NamedFactory, RequestBody, RequestContext, RequestParameters};
use super::response::{Response, ResponseHeader};
use super::status::OperationStatus;
use super::versioned::{VersionTable, VersionedCodec};
use super::wire::{ReadLimits, WireBuffer, WireReader};
use super::Operation;

/// Position of the decoder inside the current frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeState {
    Header,
    HeaderCustom,
    Key,
    KeyCustom,
    Parameters,
    Value,
    ValueCustom,
}

// =============================================================================
// Accumulator
// =============================================================================

/// Progress of an AddClientListener body across passes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerDecodeContext {
    pub listener_id: Vec<u8>,
    pub include_current_state: bool,
    /// `Some` once the filter factory field has been read
    pub filter: Option<Option<NamedFactory>>,
}

/// Partial results of custom stages that read in several marks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CustomDecodeContext {
    #[default]
    None,
    Listener(ListenerDecodeContext),
    /// PutAll entries read so far
    Entries(Vec<(Vec<u8>, Vec<u8>)>),
    /// GetAll keys read so far
    Keys(Vec<Vec<u8>>),
    Transaction(TransactionDecodeContext),
}

/// Per-connection accumulator for the frame being decoded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialRequest {
    pub key: Option<Vec<u8>>,
    pub params: Option<RequestParameters>,
    pub value: Option<Vec<u8>>,
    pub body: Option<RequestBody>,
    pub custom: CustomDecodeContext,
}

impl PartialRequest {
    fn take_key(&mut self) -> std::result::Result<Vec<u8>, DecodeError> {
        self.key
            .take()
            .ok_or_else(|| DecodeError::Malformed("request key missing".to_string()))
    }

    /// Assemble the request body once every stage has run
    fn into_body(mut self, op: Operation) -> std::result::Result<RequestBody, DecodeError> {
        if let Some(body) = self.body.take() {
            return Ok(body);
        }
        let body = match op {
            Operation::Put | Operation::PutIfAbsent | Operation::Replace | Operation::ReplaceIfUnmodified => {
                RequestBody::KeyValue {
                    key: self.take_key()?,
                    value: self.value.take().unwrap_or_default(),
                    params: self.params.take().unwrap_or_default(),
                }
            }
            Operation::RemoveIfUnmodified => RequestBody::KeyVersion {
                key: self.take_key()?,
                version: self.params.as_ref().map(|p| p.stream_version).unwrap_or_default(),
            },
            op if op.descriptor().requires_key() => RequestBody::Key { key: self.take_key()? },
            _ => RequestBody::Empty,
        };
        Ok(body)
    }
}

// =============================================================================
// FrameDecoder
// =============================================================================

/// Result of one `decode` call that made progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Request(RequestContext),
    /// A recoverable failure, already turned into the response to send
    Error(Response),
}

enum HeaderStep {
    Ready,
    Incomplete,
    Failed(Response),
}

/// Per-connection resumable decoder
pub struct FrameDecoder {
    versions: Arc<VersionTable>,
    limits: ReadLimits,
    max_cache_name_length: usize,

    // --- Per-frame state ---
    state: DecodeState,
    stage: usize,
    header: Option<RequestHeader>,
    codec: Option<VersionedCodec>,
    partial: PartialRequest,

    /// Set after a reported error; cleared by the next good header
    recovering: bool,
}

impl FrameDecoder {
    pub fn new(versions: Arc<VersionTable>, limits: ReadLimits, max_cache_name_length: usize) -> Self {
        Self {
            versions,
            limits,
            max_cache_name_length,
            state: DecodeState::Header,
            stage: 0,
            header: None,
            codec: None,
            partial: PartialRequest::default(),
            recovering: false,
        }
    }

    pub fn from_config(versions: Arc<VersionTable>, config: &crate::config::Config) -> Self {
        let limits = ReadLimits {
            max_ranged_bytes: config.max_ranged_bytes,
            max_string: config.max_ranged_bytes,
        };
        Self::new(versions, limits, config.max_cache_name_length)
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering
    }

    /// Decode at most one request from `buf`
    ///
    /// Returns `Ok(None)` when more bytes are needed, and `Err` only when the stream can no
    /// longer be realigned.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Decoded>> {
        loop {
            if self.state == DecodeState::Header {
                match self.decode_header(buf)? {
                    HeaderStep::Ready => {}
                    HeaderStep::Incomplete => return Ok(None),
                    HeaderStep::Failed(response) => return Ok(Some(Decoded::Error(response))),
                }
            } else {
                match self.decode_stage(buf) {
                    Ok(()) => {}
                    Err(DecodeError::Incomplete) => return Ok(None),
                    Err(e) => return Ok(Some(Decoded::Error(self.fail(e)))),
                }
            }

            if let Some(decoded) = self.advance_stage() {
                return Ok(Some(decoded));
            }
        }
    }

    /// Preamble plus versioned header, consumed as one group
    fn decode_header(&mut self, buf: &mut BytesMut) -> Result<HeaderStep> {
        if self.recovering {
            let skip = buf.iter().position(|&b| b == MAGIC_REQ).unwrap_or(buf.len());
            if skip > 0 {
                tracing::trace!("Skipping {} bytes while resynchronizing", skip);
                buf.advance(skip);
            }
        }
        let Some(&magic) = buf.first() else {
            return Ok(HeaderStep::Incomplete);
        };
        if magic != MAGIC_REQ {
            return Err(HotRodError::InvalidMagic {
                expected: MAGIC_REQ,
                found: magic,
            });
        }

        let mut reader = WireReader::new(&buf[..], self.limits);
        reader.read_u8()?;
        let message_id = match reader.read_vlong() {
            Ok(id) => id,
            Err(DecodeError::Incomplete) => return Ok(HeaderStep::Incomplete),
            Err(e) => {
                return Ok(self.header_failed(
                    buf,
                    ResponseHeader::minimal(0, 0),
                    OperationStatus::InvalidMagicOrMsgId,
                    e.to_string(),
                ));
            }
        };
        let version = match reader.read_u8() {
            Ok(v) => v,
            Err(_) => return Ok(HeaderStep::Incomplete),
        };

        let Some(codec) = self.versions.get(version).cloned() else {
            return Ok(self.header_failed(
                buf,
                ResponseHeader::minimal(version, message_id),
                OperationStatus::UnknownVersion,
                format!("Unknown version: {}", version),
            ));
        };

        let outcome = codec
            .decoder
            .read_header(&mut reader, version, message_id, self.max_cache_name_length);
        let consumed = reader.position();
        match outcome {
            Ok(header) => {
                buf.advance(consumed);
                tracing::trace!(
                    "Decoded header: op={:?} version={} message_id={} cache='{}'",
                    header.op,
                    header.version,
                    header.message_id,
                    header.cache_name
                );
                self.recovering = false;
                self.header = Some(header);
                self.codec = Some(codec);
                Ok(HeaderStep::Ready)
            }
            Err(DecodeError::Incomplete) => Ok(HeaderStep::Incomplete),
            Err(DecodeError::UnknownOperation(code)) => Ok(self.header_failed(
                buf,
                ResponseHeader::minimal(version, message_id),
                OperationStatus::UnknownOperation,
                format!("Unknown operation: {:#04x}", code),
            )),
            Err(e) => Ok(self.header_failed(
                buf,
                ResponseHeader::minimal(version, message_id),
                OperationStatus::ParseError,
                e.to_string(),
            )),
        }
    }

    fn header_failed(
        &mut self,
        buf: &mut BytesMut,
        header: ResponseHeader,
        status: OperationStatus,
        message: String,
    ) -> HeaderStep {
        tracing::debug!("Rejecting request {}: {}", header.message_id, message);
        // Step past the magic so recovery looks for the next frame
        buf.advance(1);
        self.reset();
        self.recovering = true;
        HeaderStep::Failed(Response::error(header, status, message))
    }

    /// Run the current non-header stage
    fn decode_stage(&mut self, buf: &mut BytesMut) -> std::result::Result<(), DecodeError> {
        let (Some(header), Some(codec)) = (self.header.as_ref(), self.codec.as_ref()) else {
            return Err(DecodeError::Malformed("decoder lost its header".to_string()));
        };
        let decoder = &codec.decoder;
        let partial = &mut self.partial;
        let mut wire = WireBuffer::new(buf, self.limits);

        match self.state {
            DecodeState::Header => {}
            DecodeState::HeaderCustom => {
                let body = decoder.read_custom_header(header, &mut wire, partial)?;
                partial.body = Some(body);
            }
            DecodeState::Key => {
                let key = decoder.read_key(header, &mut wire)?;
                partial.key = Some(key);
            }
            DecodeState::KeyCustom => {
                let body = decoder.read_custom_key(header, &mut wire, partial)?;
                partial.body = Some(body);
            }
            DecodeState::Parameters => {
                let params = decoder.read_parameters(header, &mut wire)?;
                partial.params = Some(params);
            }
            DecodeState::Value => {
                let params = partial.params.clone().unwrap_or_default();
                let value = decoder.read_value(header, &params, &mut wire)?;
                partial.value = Some(value);
            }
            DecodeState::ValueCustom => {
                let params = partial.params.clone().unwrap_or_default();
                let body = decoder.read_custom_value(header, &params, &mut wire, partial)?;
                partial.body = Some(body);
            }
        }
        Ok(())
    }

    /// Move to the next stage, or finish the request when none is left
    fn advance_stage(&mut self) -> Option<Decoded> {
        let op = self.header.as_ref()?.op;
        let stages = op.descriptor().stages;
        if self.state != DecodeState::Header {
            self.stage += 1;
        }
        if let Some(&next) = stages.get(self.stage) {
            self.state = next;
            return None;
        }

        let header = self.header.take()?;
        let partial = std::mem::take(&mut self.partial);
        self.reset();
        match partial.into_body(op) {
            Ok(body) => Some(Decoded::Request(RequestContext { header, body })),
            Err(e) => {
                self.recovering = true;
                Some(Decoded::Error(Response::error(&header, OperationStatus::ParseError, e.to_string())))
            }
        }
    }

    /// Report a stage failure and start recovery
    fn fail(&mut self, error: DecodeError) -> Response {
        let response = match self.header.as_ref() {
            Some(header) => Response::error(header, OperationStatus::ParseError, error.to_string()),
            None => Response::error(ResponseHeader::minimal(0, 0), OperationStatus::ParseError, error.to_string()),
        };
        tracing::debug!("Parse error in request {}: {}", response.header.message_id, error);
        self.reset();
        self.recovering = true;
        response
    }

    fn reset(&mut self) {
        self.state = DecodeState::Header;
        self.stage = 0;
        self.header = None;
        self.codec = None;
        self.partial = PartialRequest::default();
    }
}
