//! Request Processor
//!
//! Executes decoded requests against the cache layer and builds version-neutral
//! [`Response`]s. Runs on the worker pool; nothing here touches decoder state.
//!
//! ## Status Rules
//! - write operations answer with the previous value only under force-return-previous
//! - conditional writes that did not apply answer `OperationNotExecuted`
//! - misses answer `KeyDoesNotExist`
//! - failures are mapped by [`error_status`] and carry the cause chain as message

use std::error::Error as StdError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::cache::{Cache, CacheEntry, CacheFlags, CacheManager, Metadata, TransactionEngine, VersionedOutcome};
use crate::config::Config;
use crate::error::{CacheError, DecodeError, HotRodError, Result};
use crate::iteration::{IterationBatch, IterationManager};
use crate::listener::ListenerRegistry;
use crate::network::ChannelHandle;
use crate::protocol::{
    EncodeContext, Operation, OperationDescriptor, OperationStatus, ProtocolFlags, RequestBody, RequestContext,
    RequestHeader, Response, ResponseBody, ResponseHeader, VersionTable,
};
use crate::topology::ClusterView;
use crate::tx::{PrepareOutcome, TransactionCoordinator};

// =============================================================================
// Transport Counters
// =============================================================================

/// Bytes moved by all connections, reported through Stats
#[derive(Debug, Default)]
pub struct TransportStats {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self, bytes: usize) {
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_written(&self, bytes: usize) {
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Error Mapping
// =============================================================================

/// Status of an error response for `err`
pub fn error_status(err: &HotRodError) -> OperationStatus {
    match err {
        HotRodError::Decode(_) => OperationStatus::ParseError,
        HotRodError::Cache(cause) => cache_error_status(cause, true),
        _ => OperationStatus::ServerError,
    }
}

fn cache_error_status(err: &CacheError, unwrap: bool) -> OperationStatus {
    match err {
        CacheError::Timeout(_) => OperationStatus::OperationTimedOut,
        CacheError::NodeSuspected(_) => OperationStatus::NodeSuspected,
        CacheError::IllegalLifecycleState(_) | CacheError::Interrupted => OperationStatus::IllegalLifecycleState,
        // One level only
        CacheError::Wrapped { cause, .. } if unwrap => cache_error_status(cause, false),
        _ => OperationStatus::ServerError,
    }
}

/// `err` followed by its sources, `: ` separated
pub fn cause_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

// =============================================================================
// Processor
// =============================================================================

/// Shared request execution state of a server
pub struct RequestProcessor {
    caches: Arc<CacheManager>,
    cluster: Arc<dyn ClusterView>,
    listeners: Arc<ListenerRegistry>,
    iterations: Arc<IterationManager>,
    transactions: Arc<TransactionCoordinator>,
    transport: Arc<TransportStats>,
    versions: Arc<VersionTable>,
    warned_conditional: AtomicBool,
}

impl RequestProcessor {
    pub fn new(
        caches: Arc<CacheManager>,
        cluster: Arc<dyn ClusterView>,
        versions: Arc<VersionTable>,
        config: &Config,
    ) -> Self {
        Self {
            caches,
            listeners: Arc::new(ListenerRegistry::new(config.event_queue_capacity)),
            iterations: Arc::new(IterationManager::new(config.iteration_idle_timeout())),
            transactions: Arc::new(TransactionCoordinator::new(Arc::clone(&cluster))),
            cluster,
            transport: Arc::new(TransportStats::new()),
            versions,
            warned_conditional: AtomicBool::new(false),
        }
    }

    pub fn caches(&self) -> &Arc<CacheManager> {
        &self.caches
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }

    pub fn iterations(&self) -> &Arc<IterationManager> {
        &self.iterations
    }

    pub fn transactions(&self) -> &Arc<TransactionCoordinator> {
        &self.transactions
    }

    pub fn transport(&self) -> &Arc<TransportStats> {
        &self.transport
    }

    pub fn versions(&self) -> &Arc<VersionTable> {
        &self.versions
    }

    /// Execute one request; failures become error responses
    pub fn process(&self, ctx: &RequestContext, channel: &ChannelHandle) -> Response {
        match self.dispatch(ctx, channel) {
            Ok(response) => response,
            Err(e) => self.error_response(ResponseHeader::from(&ctx.header), &e),
        }
    }

    /// Error response for `err`, logged by severity
    pub fn error_response(&self, header: ResponseHeader, err: &HotRodError) -> Response {
        let status = error_status(err);
        let message = cause_chain(err);
        match status {
            OperationStatus::ParseError => tracing::debug!("Request {} rejected: {}", header.message_id, message),
            _ => tracing::warn!(
                "Request {} ({:?}) on '{}' failed: {}",
                header.message_id,
                header.op,
                header.cache_name,
                message
            ),
        }
        Response::error(header, status, message)
    }

    /// Serialize `response` with the encoder of its protocol version
    pub fn encode(&self, response: &Response) -> Result<Bytes> {
        let encoder = self
            .versions
            .encoder_for(response.header.version)
            .ok_or_else(|| HotRodError::Protocol("no encoder registered".to_string()))?;

        let name = self.caches.resolve_name(&response.header.cache_name);
        let topology = match response.header.op {
            Some(_) => self.cluster.topology(name),
            None => None,
        };
        let object_storage = self
            .caches
            .get(name)
            .map(|cache| cache.configuration().object_storage)
            .unwrap_or(false);

        let ctx = EncodeContext {
            topology: topology.as_deref(),
            object_storage,
        };
        let mut buf = BytesMut::with_capacity(64);
        encoder.write_response(response, &ctx, &mut buf)?;
        Ok(buf.freeze())
    }

    fn cache_flags(&self, header: &RequestHeader, descriptor: &OperationDescriptor, cache: &dyn Cache) -> CacheFlags {
        let mut flags = CacheFlags::none();
        if descriptor.can_skip_cache_load && header.has_flag(ProtocolFlags::SKIP_CACHE_LOAD) {
            flags = flags.with(CacheFlags::SKIP_CACHE_LOAD);
        }
        if descriptor.can_skip_indexing && header.has_flag(ProtocolFlags::SKIP_INDEXING) {
            flags = flags.with(CacheFlags::SKIP_INDEXING);
        }
        if header.has_flag(ProtocolFlags::SKIP_LISTENER_NOTIFICATION) {
            flags = flags.with(CacheFlags::SKIP_LISTENER_NOTIFICATION);
        }
        if !descriptor.is_conditional && !header.flags.force_return_previous() {
            flags = flags.with(CacheFlags::IGNORE_RETURN_VALUES);
        }

        let config = cache.configuration();
        if descriptor.is_conditional
            && config.is_clustered()
            && !config.is_transactional()
            && !self.warned_conditional.swap(true, Ordering::Relaxed)
        {
            tracing::warn!(
                "Conditional operation {:?} on non-transactional clustered cache '{}' is not reliable",
                header.op,
                cache.name()
            );
        }
        flags
    }

    fn dispatch(&self, ctx: &RequestContext, channel: &ChannelHandle) -> Result<Response> {
        let header = &ctx.header;
        if header.op == Operation::Ping {
            return Ok(Response::success(header));
        }

        let cache = self.caches.get(&header.cache_name)?;
        let descriptor = header.op.descriptor();
        let flags = self.cache_flags(header, &descriptor, cache.as_ref());
        let writes = WriteResponder {
            header,
            with_previous: descriptor.can_return_previous && header.flags.force_return_previous(),
        };

        tracing::trace!("Processing {:?} #{} on '{}'", header.op, header.message_id, cache.name());

        let response = match (header.op, &ctx.body) {
            // --- Writes ---
            (Operation::Put, RequestBody::KeyValue { key, value, params }) => {
                let metadata = Metadata::resolve(params.lifespan, params.max_idle, cache.configuration());
                let previous = cache.put(key.clone(), value.clone(), metadata, flags)?;
                writes.respond(OperationStatus::Success, previous)
            }
            (Operation::PutIfAbsent, RequestBody::KeyValue { key, value, params }) => {
                let metadata = Metadata::resolve(params.lifespan, params.max_idle, cache.configuration());
                match cache.put_if_absent(key.clone(), value.clone(), metadata, flags)? {
                    None => writes.respond(OperationStatus::Success, None),
                    Some(existing) => writes.respond(OperationStatus::OperationNotExecuted, Some(existing)),
                }
            }
            (Operation::Replace, RequestBody::KeyValue { key, value, params }) => {
                let metadata = Metadata::resolve(params.lifespan, params.max_idle, cache.configuration());
                match cache.replace(key.clone(), value.clone(), metadata, flags)? {
                    Some(previous) => writes.respond(OperationStatus::Success, Some(previous)),
                    None => writes.respond(OperationStatus::OperationNotExecuted, None),
                }
            }
            (Operation::ReplaceIfUnmodified, RequestBody::KeyValue { key, value, params }) => {
                let metadata = Metadata::resolve(params.lifespan, params.max_idle, cache.configuration());
                let outcome =
                    cache.replace_if_version(key.clone(), params.stream_version, value.clone(), metadata, flags)?;
                writes.versioned(outcome)
            }
            (Operation::Remove, RequestBody::Key { key }) => match cache.remove(key, flags)? {
                Some(previous) => writes.respond(OperationStatus::Success, Some(previous)),
                None => writes.respond(OperationStatus::KeyDoesNotExist, None),
            },
            (Operation::RemoveIfUnmodified, RequestBody::KeyVersion { key, version }) => {
                writes.versioned(cache.remove_if_version(key, *version, flags)?)
            }
            (Operation::PutAll, RequestBody::PutAll { entries, params }) => {
                let metadata = Metadata::resolve(params.lifespan, params.max_idle, cache.configuration());
                cache.put_all(entries.clone(), metadata, flags)?;
                Response::success(header)
            }
            (Operation::Clear, RequestBody::Empty) => {
                cache.clear()?;
                Response::success(header)
            }

            // --- Reads ---
            (Operation::Get, RequestBody::Key { key }) => match cache.get(key, flags)? {
                Some(entry) => Response::new(header, OperationStatus::Success, ResponseBody::Value(entry.value)),
                None => Response::empty(header, OperationStatus::KeyDoesNotExist),
            },
            (Operation::GetWithVersion, RequestBody::Key { key }) => match cache.get(key, flags)? {
                Some(entry) => Response::new(
                    header,
                    OperationStatus::Success,
                    ResponseBody::ValueWithVersion {
                        value: entry.value,
                        version: entry.version,
                    },
                ),
                None => Response::empty(header, OperationStatus::KeyDoesNotExist),
            },
            (Operation::GetWithMetadata, RequestBody::Key { key }) => match cache.get(key, flags)? {
                Some(entry) => Response::new(header, OperationStatus::Success, ResponseBody::ValueWithMetadata(entry)),
                None => Response::empty(header, OperationStatus::KeyDoesNotExist),
            },
            (Operation::ContainsKey, RequestBody::Key { key }) => {
                if cache.contains_key(key, flags)? {
                    Response::success(header)
                } else {
                    Response::empty(header, OperationStatus::KeyDoesNotExist)
                }
            }
            (Operation::GetAll, RequestBody::GetAll { keys }) => {
                let found = cache
                    .get_all(keys, flags)?
                    .into_iter()
                    .map(|entry| (entry.key, entry.value))
                    .collect();
                Response::new(header, OperationStatus::Success, ResponseBody::Entries(found))
            }
            (Operation::BulkGet, RequestBody::Bulk { count }) => {
                let mut entries = cache.entries()?;
                if *count > 0 {
                    entries.truncate(*count as usize);
                }
                let entries = entries.into_iter().map(|e| (e.key, e.value)).collect();
                Response::new(header, OperationStatus::Success, ResponseBody::BulkEntries(entries))
            }
            (Operation::BulkGetKeys, RequestBody::Bulk { count: scope }) => {
                tracing::trace!("BulkGetKeys with scope {}", scope);
                let keys = cache.entries()?.into_iter().map(|e| e.key).collect();
                Response::new(header, OperationStatus::Success, ResponseBody::BulkKeys(keys))
            }
            (Operation::Size, RequestBody::Empty) => {
                Response::new(header, OperationStatus::Success, ResponseBody::Size(cache.size()?))
            }
            (Operation::Stats, RequestBody::Empty) => {
                Response::new(header, OperationStatus::Success, ResponseBody::Stats(self.stats(cache.as_ref())))
            }

            // --- Listeners ---
            (Operation::AddClientListener, RequestBody::AddListener(request)) => {
                let encoder = self
                    .versions
                    .encoder_for(header.version)
                    .ok_or_else(|| HotRodError::Protocol("no encoder registered".to_string()))?;
                if self
                    .listeners
                    .add_listener(channel, header.version, request, Arc::clone(&cache), encoder)?
                {
                    Response::success(header)
                } else {
                    Response::empty(header, OperationStatus::OperationNotExecuted)
                }
            }
            (Operation::RemoveClientListener, RequestBody::RemoveListener { listener_id }) => {
                if self.listeners.remove_listener(listener_id) {
                    Response::success(header)
                } else {
                    Response::empty(header, OperationStatus::OperationNotExecuted)
                }
            }

            // --- Iteration ---
            (Operation::IterationStart, RequestBody::IterationStart(request)) => {
                let iteration_id = self.iterations.start(cache.as_ref(), channel.id(), request)?;
                Response::new(
                    header,
                    OperationStatus::Success,
                    ResponseBody::IterationStart { iteration_id },
                )
            }
            (Operation::IterationNext, RequestBody::Iteration { iteration_id }) => {
                match self.iterations.next(iteration_id) {
                    Some(batch) => Response::new(header, OperationStatus::Success, ResponseBody::IterationNext(batch)),
                    None => Response::new(
                        header,
                        OperationStatus::InvalidIteration,
                        ResponseBody::IterationNext(IterationBatch::default()),
                    ),
                }
            }
            (Operation::IterationEnd, RequestBody::Iteration { iteration_id }) => {
                if self.iterations.close(iteration_id) {
                    Response::success(header)
                } else {
                    Response::empty(header, OperationStatus::InvalidIteration)
                }
            }

            // --- Transactions ---
            (Operation::PrepareTx, RequestBody::Prepare(request)) => {
                let engine = self.transaction_engine(cache.as_ref())?;
                match self
                    .transactions
                    .prepare(cache.name(), cache.configuration(), engine, request)?
                {
                    PrepareOutcome::Completed(code) => {
                        Response::new(header, OperationStatus::Success, ResponseBody::Transaction(code))
                    }
                    PrepareOutcome::NotExecuted => Response::new(
                        header,
                        OperationStatus::OperationNotExecuted,
                        ResponseBody::Transaction(0),
                    ),
                }
            }
            (Operation::CommitTx, RequestBody::TxBoundary { xid }) => {
                let engine = self.transaction_engine(cache.as_ref())?;
                let code = self.transactions.commit(cache.name(), engine, xid);
                Response::new(header, OperationStatus::Success, ResponseBody::Transaction(code))
            }
            (Operation::RollbackTx, RequestBody::TxBoundary { xid }) => {
                let engine = self.transaction_engine(cache.as_ref())?;
                let code = self.transactions.rollback(cache.name(), engine, xid);
                Response::new(header, OperationStatus::Success, ResponseBody::Transaction(code))
            }

            (op, _) => {
                return Err(HotRodError::Decode(DecodeError::Malformed(format!(
                    "{:?} request carries an unexpected body",
                    op
                ))));
            }
        };
        Ok(response)
    }

    fn transaction_engine<'c>(&self, cache: &'c dyn Cache) -> Result<&'c dyn TransactionEngine> {
        self.transactions
            .validate_configuration(cache.name(), cache.configuration())?;
        cache
            .transaction_engine()
            .ok_or_else(|| HotRodError::IllegalTransactionConfiguration {
                cache: cache.name().to_string(),
                reason: "no transaction engine".to_string(),
            })
    }

    fn stats(&self, cache: &dyn Cache) -> Vec<(String, String)> {
        let stats = cache.stats();
        [
            ("timeSinceStart", stats.time_since_start_secs),
            ("currentNumberOfEntries", stats.current_entries),
            ("totalNumberOfEntries", stats.total_entries),
            ("stores", stats.stores),
            ("retrievals", stats.retrievals),
            ("hits", stats.hits),
            ("misses", stats.misses),
            ("removeHits", stats.remove_hits),
            ("removeMisses", stats.remove_misses),
            ("totalBytesRead", self.transport.bytes_read()),
            ("totalBytesWritten", self.transport.bytes_written()),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
    }
}

/// Builds write responses, attaching the previous value when the client asked for it
struct WriteResponder<'a> {
    header: &'a RequestHeader,
    with_previous: bool,
}

impl WriteResponder<'_> {
    fn respond(&self, status: OperationStatus, previous: Option<CacheEntry>) -> Response {
        if self.with_previous {
            Response::new(self.header, status, ResponseBody::Previous(previous.map(|e| e.value)))
        } else {
            Response::empty(self.header, status)
        }
    }

    fn versioned(&self, outcome: VersionedOutcome) -> Response {
        match outcome {
            VersionedOutcome::Missing => self.respond(OperationStatus::KeyDoesNotExist, None),
            VersionedOutcome::Mismatch(current) => self.respond(OperationStatus::OperationNotExecuted, Some(current)),
            VersionedOutcome::Applied(previous) => self.respond(OperationStatus::Success, Some(previous)),
        }
    }
}
