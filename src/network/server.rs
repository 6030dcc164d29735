//! TCP Server
//!
//! Accepts connections and hands each one to its own reader thread. Cache work goes
//! through the shared worker pool.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::Result;
use crate::processor::RequestProcessor;

use super::connection::Connection;
use super::worker::WorkerPool;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(25);
const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// State shared by every connection of a server
pub struct ServerContext {
    pub config: Config,
    pub processor: Arc<RequestProcessor>,
    pub workers: WorkerPool,
}

/// TCP server for hotrodkv
pub struct Server {
    config: Config,
    processor: Arc<RequestProcessor>,
}

/// Running server
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for the acceptor to exit
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if self.join.join().is_err() {
            tracing::warn!("Acceptor thread panicked");
        }
    }

    /// Block until the acceptor exits
    pub fn wait(self) {
        if self.join.join().is_err() {
            tracing::warn!("Acceptor thread panicked");
        }
    }
}

struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn try_acquire(active: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        let mut current = active.load(Ordering::Acquire);
        loop {
            if current >= max {
                return None;
            }
            match active.compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    return Some(Self {
                        active: Arc::clone(active),
                    })
                }
                Err(next) => current = next,
            }
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Server {
    /// Create a new server with the given config and processor
    pub fn new(config: Config, processor: Arc<RequestProcessor>) -> Self {
        Self { config, processor }
    }

    /// Bind the listen address and start accepting in the background
    pub fn start(self) -> Result<ServerHandle> {
        let listener = TcpListener::bind(&self.config.listen_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let workers = WorkerPool::new(self.config.worker_threads, self.config.worker_queue_capacity)?;
        let ctx = Arc::new(ServerContext {
            config: self.config,
            processor: self.processor,
            workers,
        });
        let shutdown = Arc::new(AtomicBool::new(false));

        let join = {
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("hotrod-acceptor".to_string())
                .spawn(move || accept_loop(listener, ctx, shutdown))?
        };

        tracing::info!("Hot Rod server listening on {}", local_addr);
        Ok(ServerHandle {
            local_addr,
            shutdown,
            join,
        })
    }
}

fn accept_loop(listener: TcpListener, ctx: Arc<ServerContext>, shutdown: Arc<AtomicBool>) {
    let active = Arc::new(AtomicUsize::new(0));
    let mut last_reap = Instant::now();

    while !shutdown.load(Ordering::Relaxed) {
        if last_reap.elapsed() >= REAP_INTERVAL {
            let reaped = ctx.processor.iterations().reap_idle();
            if reaped > 0 {
                tracing::debug!("Reaped {} idle iterations", reaped);
            }
            ctx.processor
                .transactions()
                .reap_completed(ctx.config.completed_tx_retention());
            last_reap = Instant::now();
        }

        match listener.accept() {
            Ok((stream, addr)) => match ConnectionGuard::try_acquire(&active, ctx.config.max_connections) {
                Some(guard) => spawn_connection(stream, Arc::clone(&ctx), guard),
                None => {
                    tracing::warn!(
                        "Rejecting {}: connection limit {} reached",
                        addr,
                        ctx.config.max_connections
                    );
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_BACKOFF),
            Err(e) => {
                tracing::warn!("Accept error: {}", e);
                thread::sleep(ACCEPT_BACKOFF);
            }
        }
    }
    tracing::info!("Server shutting down");
}

fn spawn_connection(stream: TcpStream, ctx: Arc<ServerContext>, guard: ConnectionGuard) {
    let spawned = thread::Builder::new()
        .name("hotrod-conn".to_string())
        .spawn(move || {
            let _guard = guard;
            if let Err(e) = serve(stream, ctx) {
                tracing::warn!("Connection error: {}", e);
            }
        });
    if let Err(e) = spawned {
        tracing::error!("Failed to spawn connection thread: {}", e);
    }
}

fn serve(stream: TcpStream, ctx: Arc<ServerContext>) -> Result<()> {
    stream.set_nonblocking(false)?;
    let (read_ms, write_ms) = (ctx.config.read_timeout_ms, ctx.config.write_timeout_ms);
    let mut connection = Connection::new(stream, ctx)?;
    connection.set_timeouts(read_ms, write_ms)?;
    connection.handle()
}
