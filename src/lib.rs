//! # hotrodkv
//!
//! A Hot Rod protocol server engine for a clustered key-value cache:
//! - Resumable, per-connection frame decoding for protocol versions 1.0 - 2.8
//! - Version-specific request decoders and response encoders behind one lookup table
//! - Topology and hash distribution headers for topology-aware clients
//! - Client-driven transactions (prepare / commit / rollback)
//! - Remote listeners with bounded event queues, and segment-aware iteration
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      TCP Server                              │
//! │            (reader + writer thread per client)               │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ bytes
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                   Frame Decoder                              │
//! │        (state machine, versioned decoders 1.x / 2.x)         │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ RequestContext
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │            Request Processor (worker pool)                   │
//! └──────┬──────────────┬──────────────┬──────────────┬─────────┘
//!        │              │              │              │
//!        ▼              ▼              ▼              ▼
//!   ┌─────────┐   ┌───────────┐  ┌───────────┐  ┌───────────┐
//!   │  Cache  │   │ Listeners │  │ Iteration │  │Transaction│
//!   │ Manager │   │ Registry  │  │  Manager  │  │Coordinator│
//!   └─────────┘   └───────────┘  └───────────┘  └───────────┘
//!                       │ Response / ClientEvent
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │        Versioned Encoder (+ topology header)                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;

pub mod cache;
pub mod iteration;
pub mod listener;
pub mod network;
pub mod processor;
pub mod protocol;
pub mod topology;
pub mod tx;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use cache::{Cache, CacheConfiguration, CacheManager, LocalCache};
pub use config::Config;
pub use error::{CacheError, DecodeError, HotRodError, Result};
pub use network::{Server, ServerHandle};
pub use processor::RequestProcessor;
pub use protocol::{FrameDecoder, VersionTable};
pub use topology::{ClusterView, StaticClusterView};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of hotrodkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
