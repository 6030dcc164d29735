//! Version dispatch
//!
//! Every protocol generation implements [`VersionedDecoder`] and [`VersionedEncoder`]. The
//! [`VersionTable`] maps the version byte of a request to the pair that handles it and is
//! built once at startup.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::BytesMut;

use crate::error::{DecodeError, DecodeResult, Result};
use crate::listener::ClientEvent;
use crate::topology::TopologySnapshot;

use super::constants::{VERSIONS_1X, VERSIONS_2X};
use super::decoder::PartialRequest;
use super::header::RequestHeader;
use super::request::{RequestBody, RequestParameters};
use super::response::Response;
use super::v1::{Decoder1x, Encoder1x};
use super::v2::{Decoder2x, Encoder2x};
use super::wire::{WireBuffer, WireReader};

/// Request parsing for one protocol generation
///
/// Every method either reads a complete field group or fails with
/// [`DecodeError::Incomplete`] having consumed nothing of the unfinished group.
pub trait VersionedDecoder: Send + Sync {
    /// Versioned part of the header; the reader is positioned after the version byte
    fn read_header(
        &self,
        reader: &mut WireReader<'_>,
        version: u8,
        message_id: u64,
        max_cache_name_length: usize,
    ) -> DecodeResult<RequestHeader>;

    /// Operations whose body starts right after the header (transactions)
    fn read_custom_header(
        &self,
        header: &RequestHeader,
        buf: &mut WireBuffer<'_>,
        partial: &mut PartialRequest,
    ) -> DecodeResult<RequestBody> {
        let _ = (buf, partial);
        Err(DecodeError::Malformed(format!("{:?} has no custom header", header.op)))
    }

    fn read_key(&self, _header: &RequestHeader, buf: &mut WireBuffer<'_>) -> DecodeResult<Vec<u8>> {
        buf.read(|r| r.read_ranged_bytes())
    }

    /// Operations with a non-standard body after the header
    fn read_custom_key(
        &self,
        header: &RequestHeader,
        buf: &mut WireBuffer<'_>,
        partial: &mut PartialRequest,
    ) -> DecodeResult<RequestBody>;

    fn read_parameters(&self, header: &RequestHeader, buf: &mut WireBuffer<'_>) -> DecodeResult<RequestParameters>;

    fn read_value(
        &self,
        _header: &RequestHeader,
        params: &RequestParameters,
        buf: &mut WireBuffer<'_>,
    ) -> DecodeResult<Vec<u8>> {
        buf.read(|r| r.read_slice(params.value_length).map(|v| v.to_vec()))
    }

    /// Operations with a non-standard body after the parameters (PutAll, GetAll)
    fn read_custom_value(
        &self,
        header: &RequestHeader,
        params: &RequestParameters,
        buf: &mut WireBuffer<'_>,
        partial: &mut PartialRequest,
    ) -> DecodeResult<RequestBody>;
}

/// What the encoder needs besides the response itself
#[derive(Default)]
pub struct EncodeContext<'a> {
    /// Current topology of the response's cache, `None` for local caches
    pub topology: Option<&'a TopologySnapshot>,
    /// Whether the cache stores values as objects
    pub object_storage: bool,
}

/// Response and event serialization for one protocol generation
pub trait VersionedEncoder: Send + Sync {
    fn write_response(&self, response: &Response, ctx: &EncodeContext<'_>, buf: &mut BytesMut) -> Result<()>;

    fn write_event(&self, event: &ClientEvent, buf: &mut BytesMut) -> Result<()>;
}

/// Decoder and encoder of one protocol generation
#[derive(Clone)]
pub struct VersionedCodec {
    pub decoder: Arc<dyn VersionedDecoder>,
    pub encoder: Arc<dyn VersionedEncoder>,
}

/// Version byte → codec lookup
#[derive(Clone, Default)]
pub struct VersionTable {
    codecs: HashMap<u8, VersionedCodec>,
    latest: Option<u8>,
}

impl VersionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every supported version: 1.0-1.3 and 2.0-2.8
    pub fn standard() -> Self {
        let mut table = Self::new();
        table.register(VERSIONS_1X, Arc::new(Decoder1x), Arc::new(Encoder1x));
        table.register(VERSIONS_2X, Arc::new(Decoder2x), Arc::new(Encoder2x));
        table
    }

    pub fn register(
        &mut self,
        versions: impl IntoIterator<Item = u8>,
        decoder: Arc<dyn VersionedDecoder>,
        encoder: Arc<dyn VersionedEncoder>,
    ) {
        let codec = VersionedCodec { decoder, encoder };
        for version in versions {
            self.codecs.insert(version, codec.clone());
            self.latest = Some(self.latest.map_or(version, |v| v.max(version)));
        }
    }

    pub fn get(&self, version: u8) -> Option<&VersionedCodec> {
        self.codecs.get(&version)
    }

    pub fn supports(&self, version: u8) -> bool {
        self.codecs.contains_key(&version)
    }

    /// Encoder for `version`, or the newest one for versions we could not decode
    pub fn encoder_for(&self, version: u8) -> Option<Arc<dyn VersionedEncoder>> {
        self.get(version)
            .or_else(|| self.latest.and_then(|v| self.get(v)))
            .map(|codec| Arc::clone(&codec.encoder))
    }
}
