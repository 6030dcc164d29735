//! Connection Handler
//!
//! One client connection: a reader loop that owns the frame decoder and a writer thread
//! that owns the socket's write half.
//!
//! ```text
//!   socket ──► reader loop ──► FrameDecoder ──► Ping: answered inline
//!                                   │
//!                                   └──► WorkerPool ──► RequestProcessor
//!                                                           │
//!   socket ◄── writer thread ◄── Channel (bounded) ◄────────┘ responses + events
//! ```

use std::io::{BufWriter, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use crate::error::{HotRodError, Result};
use crate::protocol::constants::VERSION_28;
use crate::protocol::{Decoded, FrameDecoder, Operation, OperationStatus, RequestContext, Response, ResponseHeader};

use super::channel::{Channel, ChannelHandle, ChannelReceiver};
use super::server::ServerContext;

const READ_CHUNK: usize = 8 * 1024;
const WRITER_POLL: Duration = Duration::from_millis(100);

/// Handles a single client connection
pub struct Connection {
    /// Read half
    stream: TcpStream,

    /// Outbound queue shared with workers and listeners
    channel: ChannelHandle,

    /// Taken by the writer thread when `handle` starts
    receiver: Option<ChannelReceiver>,

    decoder: FrameDecoder,

    ctx: Arc<ServerContext>,

    /// Peer address for logging
    peer_addr: String,
}

impl Connection {
    /// Create a new connection handler
    pub fn new(stream: TcpStream, ctx: Arc<ServerContext>) -> Result<Self> {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        // Disable Nagle's algorithm for low latency
        stream.set_nodelay(true)?;

        let (channel, receiver) = Channel::new(peer_addr.clone(), ctx.config.write_queue_capacity);
        let decoder = FrameDecoder::from_config(Arc::clone(ctx.processor.versions()), &ctx.config);

        Ok(Self {
            stream,
            channel,
            receiver: Some(receiver),
            decoder,
            ctx,
            peer_addr,
        })
    }

    /// Configure connection timeouts
    pub fn set_timeouts(&mut self, read_ms: u64, write_ms: u64) -> Result<()> {
        if read_ms > 0 {
            self.stream.set_read_timeout(Some(Duration::from_millis(read_ms)))?;
        }
        if write_ms > 0 {
            self.stream.set_write_timeout(Some(Duration::from_millis(write_ms)))?;
        }
        Ok(())
    }

    pub fn channel(&self) -> &ChannelHandle {
        &self.channel
    }

    /// Get the peer address string
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// Serve the connection until the client goes away (blocking)
    pub fn handle(&mut self) -> Result<()> {
        tracing::debug!("Connection established from {} (channel {})", self.peer_addr, self.channel.id());

        let writer = self.spawn_writer()?;
        let result = self.read_loop();

        self.teardown();
        if writer.join().is_err() {
            tracing::warn!("Writer thread for {} panicked", self.peer_addr);
        }
        result
    }

    fn spawn_writer(&mut self) -> Result<JoinHandle<()>> {
        let receiver = self
            .receiver
            .take()
            .ok_or_else(|| HotRodError::Network("connection already handled".to_string()))?;
        let stream = self.stream.try_clone()?;
        let channel = Arc::clone(&self.channel);
        let ctx = Arc::clone(&self.ctx);
        let handle = thread::Builder::new()
            .name(format!("hotrod-writer-{}", channel.id()))
            .spawn(move || write_loop(stream, receiver, channel, ctx))?;
        Ok(handle)
    }

    fn read_loop(&mut self) -> Result<()> {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let n = match self.stream.read(&mut chunk) {
                Ok(0) => {
                    tracing::debug!("Client {} disconnected", self.peer_addr);
                    return Ok(());
                }
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted) => {
                    tracing::debug!("Connection reset by client {}", self.peer_addr);
                    return Ok(());
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    tracing::debug!("Read timeout for client {}", self.peer_addr);
                    return Ok(());
                }
                Err(e) => {
                    if !self.channel.is_open() {
                        return Ok(());
                    }
                    tracing::warn!("Error reading from {}: {}", self.peer_addr, e);
                    return Err(e.into());
                }
            };
            self.ctx.processor.transport().record_read(n);
            buf.extend_from_slice(&chunk[..n]);

            loop {
                match self.decoder.decode(&mut buf) {
                    Ok(Some(Decoded::Request(request))) => self.dispatch(request)?,
                    Ok(Some(Decoded::Error(response))) => self.respond(&response)?,
                    Ok(None) => break,
                    Err(HotRodError::InvalidMagic { expected, found }) => {
                        tracing::warn!(
                            "Invalid magic {:#04x} (expected {:#04x}) from {}; closing",
                            found,
                            expected,
                            self.peer_addr
                        );
                        let response = Response::error(
                            ResponseHeader::minimal(VERSION_28, 0),
                            OperationStatus::InvalidMagicOrMsgId,
                            format!("Invalid magic byte: {:#04x}", found),
                        );
                        // Best effort; the connection is closing anyway
                        let _ = self.respond(&response);
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    fn dispatch(&self, request: RequestContext) -> Result<()> {
        if request.header.op == Operation::Ping {
            return self.respond(&Response::success(&request.header));
        }

        let processor = Arc::clone(&self.ctx.processor);
        let channel = Arc::clone(&self.channel);
        self.ctx.workers.submit(move || {
            if !channel.is_open() {
                return;
            }
            let response = processor.process(&request, &channel);
            if !channel.is_open() {
                tracing::trace!("Discarding response {} for closed channel", response.header.message_id);
                return;
            }
            match processor.encode(&response) {
                Ok(frame) => {
                    if let Err(e) = channel.write_or_close(frame) {
                        tracing::debug!("Dropping response {}: {}", response.header.message_id, e);
                    }
                }
                Err(e) => tracing::warn!("Failed to encode response {}: {}", response.header.message_id, e),
            }
        })
    }

    fn respond(&self, response: &Response) -> Result<()> {
        let frame = self.ctx.processor.encode(response)?;
        self.channel.write(frame)
    }

    fn teardown(&self) {
        self.channel.close();
        let listeners = self.ctx.processor.listeners().remove_channel(self.channel.id());
        let cursors = self.ctx.processor.iterations().close_channel(self.channel.id());
        if listeners > 0 || cursors > 0 {
            tracing::debug!(
                "Released {} listeners and {} iterations of {}",
                listeners,
                cursors,
                self.peer_addr
            );
        }
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            tracing::trace!("Shutdown of {} failed: {}", self.peer_addr, e);
        }
    }
}

/// Drain the channel into the socket until it is closed and empty
fn write_loop(stream: TcpStream, receiver: ChannelReceiver, channel: ChannelHandle, ctx: Arc<ServerContext>) {
    let mut writer = BufWriter::new(stream);
    loop {
        let Some(frame) = receiver.recv_timeout(WRITER_POLL) else {
            if !channel.is_open() {
                break;
            }
            continue;
        };
        if let Err(e) = write_frame(&mut writer, &frame, &receiver, &ctx) {
            match e.kind() {
                ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => {
                    tracing::debug!("Client {} disconnected before response could be sent", channel.peer_addr());
                }
                _ => tracing::warn!("Error writing to {}: {}", channel.peer_addr(), e),
            }
            channel.close();
            break;
        }
        // Room freed up; let listeners push what they buffered
        ctx.processor.listeners().on_writable(channel.id());
    }
    // A channel closed by a worker leaves the reader blocked on the socket
    if let Err(e) = writer.get_ref().shutdown(Shutdown::Read) {
        tracing::trace!("Shutdown of {} read side failed: {}", channel.peer_addr(), e);
    }
    tracing::trace!("Writer for channel {} exiting", channel.id());
}

/// Write `frame` plus whatever else is already queued, then flush
fn write_frame(
    writer: &mut BufWriter<TcpStream>,
    frame: &Bytes,
    receiver: &ChannelReceiver,
    ctx: &ServerContext,
) -> std::io::Result<()> {
    writer.write_all(frame)?;
    let mut written = frame.len();
    while let Some(next) = receiver.try_recv() {
        writer.write_all(&next)?;
        written += next.len();
    }
    writer.flush()?;
    ctx.processor.transport().record_written(written);
    Ok(())
}
