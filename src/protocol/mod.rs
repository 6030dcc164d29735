//! Protocol Module
//!
//! Hot Rod wire protocol: frame decoding, versioned codecs and response encoding.
//!
//! ## Request Frame
//! ```text
//! ┌───────────┬─────────────┬─────────┬────────┬────────────┬───────────┐
//! │ Magic 0xA0│ Msg id vlong│ Ver (1) │ Op (1) │ Cache name │ Flags vint│ ...
//! └───────────┴─────────────┴─────────┴────────┴────────────┴───────────┘
//!   ... │ Intelligence (1) │ Topology id vint │ [tx type (1), 1.x] │ [media types, 2.8+] │ body
//! ```
//!
//! ## Response Frame
//! ```text
//! ┌───────────┬─────────────┬────────┬────────────┬────────────────┬──────────┐
//! │ Magic 0xA1│ Msg id vlong│ Op (1) │ Status (1) │ Topology block │ Payload  │
//! └───────────┴─────────────┴────────┴────────────┴────────────────┴──────────┘
//! ```
//!
//! ## Primitive Encodings
//! - vint / vlong: 7 bits per byte, least significant group first, high bit = more
//! - ranged bytes / strings: vint length followed by the bytes (UTF-8 for strings)
//! - fixed width integers are big-endian
//!
//! ## Layers
//! - [`FrameDecoder`]: resumable per-connection state machine
//! - [`VersionTable`]: version byte → [`VersionedDecoder`] / [`VersionedEncoder`]
//! - [`Response`]: version neutral result handed to the encoder
//! - [`client`]: request writer and response reader for clients and tests

pub mod client;
pub mod constants;
mod decoder;
mod header;
mod operation;
mod payload;
mod request;
mod response;
mod status;
mod v1;
mod v2;
mod versioned;
pub mod wire;

pub use decoder::{CustomDecodeContext, DecodeState, Decoded, FrameDecoder, ListenerDecodeContext, PartialRequest};
pub use header::{ClientIntelligence, MediaType, ProtocolFlags, RequestHeader};
pub use operation::{Operation, OperationDescriptor, ERROR_RESPONSE};
pub use request::{
    Expiration, IterationRequest, ListenerRequest, NamedFactory, RequestBody, RequestContext, RequestParameters,
    TimeUnitCode,
};
pub use response::{Response, ResponseBody, ResponseHeader};
pub use status::OperationStatus;
pub use v1::{Decoder1x, Encoder1x};
pub use v2::{Decoder2x, Encoder2x};
pub use versioned::{EncodeContext, VersionTable, VersionedCodec, VersionedDecoder, VersionedEncoder};
pub use wire::{ReadLimits, WireBuffer, WireReader, WireWrite};
