//! Network Module
//!
//! TCP server and client connection handling.
//!
//! ## Architecture
//! - Single acceptor thread
//! - One reader thread and one writer thread per connection
//! - Cache operations run on a shared worker pool
//! - Everything written to a client goes through its [`Channel`]

mod channel;
mod connection;
mod server;
mod worker;

pub use channel::{Channel, ChannelHandle, ChannelReceiver};
pub use connection::Connection;
pub use server::{Server, ServerContext, ServerHandle};
pub use worker::WorkerPool;
