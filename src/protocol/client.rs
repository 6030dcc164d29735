//! Client side of the protocol
//!
//! [`RequestWriter`] builds request frames for any supported version, [`read_preamble`]
//! parses the start of a response including its topology block, and [`Client`] is a small
//! blocking TCP client built on both. Used by the CLI and by the tests.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{DecodeError, DecodeResult, HotRodError, Result};
use crate::topology::ServerAddress;
use crate::tx::{TransactionDecodeContext, TxWrite, Xid};

use super::constants::*;
use super::header::ClientIntelligence;
use super::request::{Expiration, IterationRequest, ListenerRequest, NamedFactory, TimeUnitCode};
use super::status::OperationStatus;
use super::wire::{ReadLimits, WireReader, WireWrite};
use super::Operation;

// =============================================================================
// Request Writer
// =============================================================================

/// Builds request frames sharing one header configuration
#[derive(Debug, Clone)]
pub struct RequestWriter {
    version: u8,
    cache_name: String,
    flags: u32,
    intelligence: ClientIntelligence,
    topology_id: i32,
}

impl RequestWriter {
    pub fn new(version: u8) -> Self {
        Self {
            version,
            cache_name: String::new(),
            flags: 0,
            intelligence: ClientIntelligence::Basic,
            topology_id: 0,
        }
    }

    pub fn cache_name(mut self, name: impl Into<String>) -> Self {
        self.cache_name = name.into();
        self
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn intelligence(mut self, intelligence: ClientIntelligence) -> Self {
        self.intelligence = intelligence;
        self
    }

    pub fn topology_id(mut self, topology_id: i32) -> Self {
        self.topology_id = topology_id;
        self
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    fn header(&self, op: Operation, message_id: u64) -> BytesMut {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(MAGIC_REQ);
        buf.put_vlong(message_id);
        buf.put_u8(self.version);
        buf.put_u8(op.request_code());
        buf.put_string(&self.cache_name);
        buf.put_vint(self.flags);
        buf.put_u8(self.intelligence.code());
        buf.put_vint(self.topology_id as u32);
        if is_version_1x(self.version) {
            // Transaction type: none
            buf.put_u8(0);
        } else if self.version >= VERSION_28 {
            // No key / value media types
            buf.put_u8(0);
            buf.put_u8(0);
        }
        buf
    }

    fn put_expirations(&self, lifespan: Expiration, max_idle: Expiration, buf: &mut BytesMut) {
        if self.version < VERSION_22 {
            buf.put_vint(lifespan.as_seconds() as u32);
            buf.put_vint(max_idle.as_seconds() as u32);
            return;
        }
        let lifespan_unit = TimeUnitCode::for_expiration(&lifespan);
        let max_idle_unit = TimeUnitCode::for_expiration(&max_idle);
        buf.put_u8((lifespan_unit.code() << 4) | max_idle_unit.code());
        for (unit, expiration) in [(lifespan_unit, lifespan), (max_idle_unit, max_idle)] {
            if unit.carries_duration() {
                buf.put_vlong(expiration.as_millis_or_sentinel() as u64);
            }
        }
    }

    fn put_named_factory(factory: Option<&NamedFactory>, buf: &mut BytesMut) {
        match factory {
            Some(factory) => {
                buf.put_string(&factory.name);
                buf.put_u8(factory.params.len() as u8);
                for param in &factory.params {
                    buf.put_ranged_bytes(param);
                }
            }
            None => buf.put_string(""),
        }
    }

    fn put_xid(xid: &Xid, buf: &mut BytesMut) {
        buf.put_signed_vint(xid.format_id);
        buf.put_ranged_bytes(&xid.global_id);
        buf.put_ranged_bytes(&xid.branch_qualifier);
    }

    /// Ping, Stats, Clear, Size
    pub fn header_only(&self, op: Operation, message_id: u64) -> Bytes {
        self.header(op, message_id).freeze()
    }

    /// Get, ContainsKey, GetWithVersion, GetWithMetadata, Remove
    pub fn key_only(&self, op: Operation, message_id: u64, key: &[u8]) -> Bytes {
        let mut buf = self.header(op, message_id);
        buf.put_ranged_bytes(key);
        buf.freeze()
    }

    /// Put, PutIfAbsent, Replace
    pub fn key_value(
        &self,
        op: Operation,
        message_id: u64,
        key: &[u8],
        value: &[u8],
        lifespan: Expiration,
        max_idle: Expiration,
    ) -> Bytes {
        let mut buf = self.header(op, message_id);
        buf.put_ranged_bytes(key);
        self.put_expirations(lifespan, max_idle, &mut buf);
        buf.put_ranged_bytes(value);
        buf.freeze()
    }

    pub fn put(&self, message_id: u64, key: &[u8], value: &[u8]) -> Bytes {
        self.key_value(Operation::Put, message_id, key, value, Expiration::Default, Expiration::Default)
    }

    pub fn replace_if_unmodified(&self, message_id: u64, key: &[u8], value: &[u8], version: u64) -> Bytes {
        let mut buf = self.header(Operation::ReplaceIfUnmodified, message_id);
        buf.put_ranged_bytes(key);
        self.put_expirations(Expiration::Default, Expiration::Default, &mut buf);
        buf.put_i64(version as i64);
        buf.put_ranged_bytes(value);
        buf.freeze()
    }

    pub fn remove_if_unmodified(&self, message_id: u64, key: &[u8], version: u64) -> Bytes {
        let mut buf = self.header(Operation::RemoveIfUnmodified, message_id);
        buf.put_ranged_bytes(key);
        buf.put_i64(version as i64);
        buf.freeze()
    }

    /// BulkGet / BulkGetKeys
    pub fn bulk(&self, op: Operation, message_id: u64, count: u32) -> Bytes {
        let mut buf = self.header(op, message_id);
        buf.put_vint(count);
        buf.freeze()
    }

    pub fn put_all(&self, message_id: u64, entries: &[(Vec<u8>, Vec<u8>)]) -> Bytes {
        let mut buf = self.header(Operation::PutAll, message_id);
        self.put_expirations(Expiration::Default, Expiration::Default, &mut buf);
        buf.put_vint(entries.len() as u32);
        for (key, value) in entries {
            buf.put_ranged_bytes(key);
            buf.put_ranged_bytes(value);
        }
        buf.freeze()
    }

    pub fn get_all(&self, message_id: u64, keys: &[Vec<u8>]) -> Bytes {
        let mut buf = self.header(Operation::GetAll, message_id);
        buf.put_vint(keys.len() as u32);
        for key in keys {
            buf.put_ranged_bytes(key);
        }
        buf.freeze()
    }

    pub fn add_listener(&self, message_id: u64, request: &ListenerRequest) -> Bytes {
        let mut buf = self.header(Operation::AddClientListener, message_id);
        buf.put_ranged_bytes(&request.listener_id);
        buf.put_u8(u8::from(request.include_current_state));
        Self::put_named_factory(request.filter.as_ref(), &mut buf);
        Self::put_named_factory(request.converter.as_ref(), &mut buf);
        buf.put_u8(u8::from(request.use_raw_data));
        if self.version >= VERSION_26 {
            buf.put_vint(request.interests);
        }
        buf.freeze()
    }

    pub fn remove_listener(&self, message_id: u64, listener_id: &[u8]) -> Bytes {
        let mut buf = self.header(Operation::RemoveClientListener, message_id);
        buf.put_ranged_bytes(listener_id);
        buf.freeze()
    }

    pub fn iteration_start(&self, message_id: u64, request: &IterationRequest) -> Bytes {
        let mut buf = self.header(Operation::IterationStart, message_id);
        buf.put_optional_ranged_bytes(request.segments.as_deref());
        match &request.filter {
            Some(filter) if self.version >= VERSION_24 => Self::put_named_factory(Some(filter), &mut buf),
            Some(filter) => buf.put_string(&filter.name),
            None => buf.put_string(""),
        }
        buf.put_vint(request.batch_size);
        if self.version >= VERSION_24 {
            buf.put_u8(u8::from(request.metadata));
        }
        buf.freeze()
    }

    /// IterationNext / IterationEnd
    pub fn iteration(&self, op: Operation, message_id: u64, iteration_id: &str) -> Bytes {
        let mut buf = self.header(op, message_id);
        buf.put_string(iteration_id);
        buf.freeze()
    }

    fn put_tx_write(&self, write: &TxWrite, buf: &mut BytesMut) {
        buf.put_ranged_bytes(&write.key);
        buf.put_u8(write.control.0);
        if write.control.has_version() {
            buf.put_i64(write.version_read as i64);
        }
        if !write.is_remove() {
            self.put_expirations(write.lifespan, write.max_idle, buf);
            buf.put_ranged_bytes(write.value.as_deref().unwrap_or_default());
        }
    }

    pub fn prepare(&self, message_id: u64, tx: &TransactionDecodeContext) -> Bytes {
        let mut buf = self.header(Operation::PrepareTx, message_id);
        Self::put_xid(&tx.xid, &mut buf);
        buf.put_u8(u8::from(tx.one_phase));
        buf.put_vint(tx.writes.len() as u32);
        for write in &tx.writes {
            self.put_tx_write(write, &mut buf);
        }
        buf.freeze()
    }

    /// CommitTx / RollbackTx
    pub fn tx_boundary(&self, op: Operation, message_id: u64, xid: &Xid) -> Bytes {
        let mut buf = self.header(op, message_id);
        Self::put_xid(xid, &mut buf);
        buf.freeze()
    }
}

// =============================================================================
// Response Reader
// =============================================================================

/// Topology block as seen by a client
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyInfo {
    pub topology_id: i32,
    pub servers: Vec<ServerAddress>,
    /// `0` when the block carries no hash information
    pub hash_function: u8,
    pub num_segments: u32,
    /// 2.x: per segment, indices into `servers`
    pub segment_owners: Vec<Vec<u32>>,
    /// 1.x: number of owners
    pub num_owners: u16,
    /// 1.x: (server, hash id) entries
    pub hash_ids: Vec<(ServerAddress, i32)>,
}

/// Everything of a response before its payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePreamble {
    pub message_id: u64,
    pub op_code: u8,
    pub status: u8,
    pub topology: Option<TopologyInfo>,
}

impl ResponsePreamble {
    pub fn status(&self) -> Option<OperationStatus> {
        OperationStatus::from_code(self.status)
    }
}

fn read_server(reader: &mut WireReader<'_>) -> DecodeResult<ServerAddress> {
    let host = reader.read_string()?;
    let port = reader.read_u16()?;
    Ok(ServerAddress { host, port })
}

fn read_servers(reader: &mut WireReader<'_>) -> DecodeResult<Vec<ServerAddress>> {
    let count = reader.read_vint()?;
    (0..count).map(|_| read_server(reader)).collect()
}

fn read_topology_v2(reader: &mut WireReader<'_>, intelligence: ClientIntelligence) -> DecodeResult<TopologyInfo> {
    let mut info = TopologyInfo {
        topology_id: reader.read_vint_i32()?,
        servers: read_servers(reader)?,
        ..TopologyInfo::default()
    };
    if intelligence == ClientIntelligence::HashDistributionAware {
        info.hash_function = reader.read_u8()?;
        info.num_segments = reader.read_vint()?;
        if info.hash_function != 0 {
            for _ in 0..info.num_segments {
                let owners = reader.read_u8()?;
                let owners = (0..owners).map(|_| reader.read_vint()).collect::<DecodeResult<Vec<u32>>>()?;
                info.segment_owners.push(owners);
            }
        }
    }
    Ok(info)
}

fn read_topology_v1(reader: &mut WireReader<'_>, intelligence: ClientIntelligence) -> DecodeResult<TopologyInfo> {
    let topology_id = reader.read_vint_i32()?;
    if intelligence != ClientIntelligence::HashDistributionAware {
        return Ok(TopologyInfo {
            topology_id,
            servers: read_servers(reader)?,
            ..TopologyInfo::default()
        });
    }
    let num_owners = reader.read_u16()?;
    let hash_function = reader.read_u8()?;
    let _hash_space = reader.read_vint()?;
    let entries = reader.read_vint()?;
    let mut info = TopologyInfo {
        topology_id,
        num_owners,
        hash_function,
        ..TopologyInfo::default()
    };
    for _ in 0..entries {
        let server = read_server(reader)?;
        let hash_id = reader.read_i32()?;
        if !info.servers.contains(&server) {
            info.servers.push(server.clone());
        }
        info.hash_ids.push((server, hash_id));
    }
    Ok(info)
}

/// Parse a response up to its payload
pub fn read_preamble(
    reader: &mut WireReader<'_>,
    version: u8,
    intelligence: ClientIntelligence,
) -> DecodeResult<ResponsePreamble> {
    let magic = reader.read_u8()?;
    if magic != MAGIC_RES {
        return Err(DecodeError::Malformed(format!("invalid response magic {:#04x}", magic)));
    }
    let message_id = reader.read_vlong()?;
    let op_code = reader.read_u8()?;
    let status = reader.read_u8()?;
    let topology = match reader.read_u8()? {
        0 => None,
        _ if is_version_1x(version) => Some(read_topology_v1(reader, intelligence)?),
        _ => Some(read_topology_v2(reader, intelligence)?),
    };
    Ok(ResponsePreamble {
        message_id,
        op_code,
        status,
        topology,
    })
}

// =============================================================================
// Blocking Client
// =============================================================================

/// Minimal blocking client over one TCP connection
pub struct Client {
    stream: TcpStream,
    writer: RequestWriter,
    buf: BytesMut,
    next_message_id: u64,
}

impl Client {
    pub fn connect(addr: &str, writer: RequestWriter) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        Ok(Self {
            stream,
            writer,
            buf: BytesMut::with_capacity(4096),
            next_message_id: 1,
        })
    }

    pub fn writer(&self) -> &RequestWriter {
        &self.writer
    }

    /// Message id for the next request
    pub fn next_message_id(&mut self) -> u64 {
        let id = self.next_message_id;
        self.next_message_id += 1;
        id
    }

    /// Send `request` and parse the response with `payload`
    pub fn call<T>(
        &mut self,
        request: &[u8],
        payload: impl Fn(&mut WireReader<'_>, &ResponsePreamble) -> DecodeResult<T>,
    ) -> Result<(ResponsePreamble, T)> {
        self.stream.write_all(request)?;
        self.stream.flush()?;
        self.read_frame(payload)
    }

    /// Read the next frame (response or event) from the connection
    pub fn read_frame<T>(
        &mut self,
        payload: impl Fn(&mut WireReader<'_>, &ResponsePreamble) -> DecodeResult<T>,
    ) -> Result<(ResponsePreamble, T)> {
        let version = self.writer.version;
        let intelligence = self.writer.intelligence;
        let mut chunk = [0u8; 4096];
        loop {
            let parsed = try_parse(&self.buf[..], version, intelligence, &payload);
            match parsed {
                Ok((parsed, consumed)) => {
                    let _ = self.buf.split_to(consumed);
                    return Ok(parsed);
                }
                Err(DecodeError::Incomplete) => {}
                Err(e) => return Err(e.into()),
            }
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Err(HotRodError::ChannelClosed);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    pub fn ping(&mut self) -> Result<ResponsePreamble> {
        let id = self.next_message_id();
        let request = self.writer.header_only(Operation::Ping, id);
        Ok(self.call(&request, |_, _| Ok(()))?.0)
    }

    /// Value of `key`, `None` when absent
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let id = self.next_message_id();
        let request = self.writer.key_only(Operation::Get, id, key);
        let (preamble, value) = self.call(&request, |r, p| {
            if p.status == OperationStatus::Success.code() || p.status == OperationStatus::SuccessObjStorage.code() {
                r.read_ranged_bytes().map(Some)
            } else {
                read_error(r, p).map(|_| None)
            }
        })?;
        check_status(&preamble)?;
        Ok(value)
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<ResponsePreamble> {
        let id = self.next_message_id();
        let request = self.writer.put(id, key, value);
        let (preamble, _) = self.call(&request, read_error)?;
        check_status(&preamble)?;
        Ok(preamble)
    }

    /// Whether the key existed
    pub fn remove(&mut self, key: &[u8]) -> Result<bool> {
        let id = self.next_message_id();
        let request = self.writer.key_only(Operation::Remove, id, key);
        let (preamble, _) = self.call(&request, read_error)?;
        check_status(&preamble)?;
        Ok(preamble.status != OperationStatus::KeyDoesNotExist.code())
    }

    pub fn size(&mut self) -> Result<u64> {
        let id = self.next_message_id();
        let request = self.writer.header_only(Operation::Size, id);
        let (preamble, size) = self.call(&request, |r, p| {
            if OperationStatus::from_code(p.status).is_some_and(|s| s.is_error()) {
                read_error(r, p).map(|_| 0)
            } else {
                r.read_vlong()
            }
        })?;
        check_status(&preamble)?;
        Ok(size)
    }

    pub fn stats(&mut self) -> Result<Vec<(String, String)>> {
        let id = self.next_message_id();
        let request = self.writer.header_only(Operation::Stats, id);
        let (preamble, stats) = self.call(&request, |r, p| {
            if OperationStatus::from_code(p.status).is_some_and(|s| s.is_error()) {
                return read_error(r, p).map(|_| Vec::new());
            }
            let count = r.read_vint()?;
            let mut stats = Vec::with_capacity(count as usize);
            for _ in 0..count {
                stats.push((r.read_string()?, r.read_string()?));
            }
            Ok(stats)
        })?;
        check_status(&preamble)?;
        Ok(stats)
    }
}

fn try_parse<T>(
    buf: &[u8],
    version: u8,
    intelligence: ClientIntelligence,
    payload: &impl Fn(&mut WireReader<'_>, &ResponsePreamble) -> DecodeResult<T>,
) -> DecodeResult<((ResponsePreamble, T), usize)> {
    let mut reader = WireReader::new(buf, ReadLimits::default());
    let preamble = read_preamble(&mut reader, version, intelligence)?;
    let value = payload(&mut reader, &preamble)?;
    Ok(((preamble, value), reader.position()))
}

/// Consume the error message of an error response; nothing otherwise
fn read_error(reader: &mut WireReader<'_>, preamble: &ResponsePreamble) -> DecodeResult<()> {
    if OperationStatus::from_code(preamble.status).is_some_and(|s| s.is_error()) {
        reader.read_string()?;
    }
    Ok(())
}

fn check_status(preamble: &ResponsePreamble) -> Result<()> {
    match OperationStatus::from_code(preamble.status) {
        Some(status) if status.is_error() => Err(HotRodError::Protocol(format!(
            "request {} failed with {:?}",
            preamble.message_id, status
        ))),
        Some(_) => Ok(()),
        None => Err(HotRodError::Protocol(format!("unknown status {:#04x}", preamble.status))),
    }
}
