//! Processor Tests
//!
//! Tests for request execution: decoded frames run against in-memory caches and the
//! responses they produce.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use hotrodkv::cache::{Cache, CacheConfiguration, CacheManager};
use hotrodkv::network::{Channel, ChannelHandle, ChannelReceiver};
use hotrodkv::protocol::client::{read_preamble, RequestWriter};
use hotrodkv::protocol::constants::*;
use hotrodkv::protocol::{
    ClientIntelligence, Decoded, FrameDecoder, Operation, OperationStatus, ProtocolFlags, ReadLimits, RequestBody,
    RequestContext, Response, ResponseBody, VersionTable, WireReader, ERROR_RESPONSE,
};
use hotrodkv::topology::StaticClusterView;
use hotrodkv::tx::{ControlByte, TransactionDecodeContext, TxWrite, Xid};
use hotrodkv::{Config, LocalCache, RequestProcessor};

struct Fixture {
    processor: RequestProcessor,
    channel: ChannelHandle,
    _rx: ChannelReceiver,
    decoder: FrameDecoder,
}

impl Fixture {
    fn new() -> Self {
        let config = Config::default();
        let caches = Arc::new(CacheManager::new("default"));
        caches.register(Arc::new(LocalCache::new("default", CacheConfiguration::default())));
        caches.register(Arc::new(LocalCache::new("tx", CacheConfiguration::transactional())));

        let versions = Arc::new(VersionTable::standard());
        let processor = RequestProcessor::new(
            caches,
            Arc::new(StaticClusterView::new("node-1")),
            Arc::clone(&versions),
            &config,
        );
        let (channel, rx) = Channel::new("test", 16);
        Self {
            processor,
            channel,
            _rx: rx,
            decoder: FrameDecoder::from_config(versions, &config),
        }
    }

    fn decode(&mut self, frame: Bytes) -> RequestContext {
        let mut buf = BytesMut::from(&frame[..]);
        match self.decoder.decode(&mut buf).unwrap() {
            Some(Decoded::Request(ctx)) => ctx,
            other => panic!("frame did not decode to a request: {:?}", other),
        }
    }

    fn run(&mut self, frame: Bytes) -> Response {
        let ctx = self.decode(frame);
        self.processor.process(&ctx, &self.channel)
    }

    fn cache(&self, name: &str) -> Arc<dyn Cache> {
        self.processor.caches().get(name).unwrap()
    }
}

fn frpv() -> RequestWriter {
    RequestWriter::new(VERSION_28).flags(ProtocolFlags::FORCE_RETURN_PREVIOUS_VALUE)
}

// =============================================================================
// Writes
// =============================================================================

#[test]
fn test_put_returns_previous_when_forced() {
    let mut fx = Fixture::new();

    let first = fx.run(frpv().put(1, b"k", b"v"));
    assert_eq!(first.status, OperationStatus::Success);
    assert_eq!(first.body, ResponseBody::Previous(None));

    let second = fx.run(frpv().put(2, b"k", b"v2"));
    assert_eq!(second.status, OperationStatus::Success);
    assert_eq!(second.body, ResponseBody::Previous(Some(b"v".to_vec())));

    // On the wire the previous value upgrades the status
    let encoded = fx.processor.encode(&second).unwrap();
    let mut reader = WireReader::new(&encoded, ReadLimits::default());
    let preamble = read_preamble(&mut reader, VERSION_28, ClientIntelligence::Basic).unwrap();
    assert_eq!(preamble.message_id, 2);
    assert_eq!(preamble.status(), Some(OperationStatus::SuccessWithPrevious));
    assert_eq!(reader.read_ranged_bytes().unwrap(), b"v".to_vec());
}

#[test]
fn test_put_without_flag_has_no_payload() {
    let mut fx = Fixture::new();
    let writer = RequestWriter::new(VERSION_28);
    fx.run(writer.put(1, b"k", b"v"));
    let response = fx.run(writer.put(2, b"k", b"v2"));
    assert_eq!(response.status, OperationStatus::Success);
    assert_eq!(response.body, ResponseBody::Empty);
}

#[test]
fn test_conditional_writes() {
    let mut fx = Fixture::new();
    let writer = frpv();

    let response = fx.run(writer.key_value(
        Operation::Replace,
        1,
        b"k",
        b"x",
        hotrodkv::protocol::Expiration::Default,
        hotrodkv::protocol::Expiration::Default,
    ));
    assert_eq!(response.status, OperationStatus::OperationNotExecuted);

    fx.run(writer.put(2, b"k", b"v"));
    let response = fx.run(writer.key_value(
        Operation::PutIfAbsent,
        3,
        b"k",
        b"w",
        hotrodkv::protocol::Expiration::Default,
        hotrodkv::protocol::Expiration::Default,
    ));
    assert_eq!(response.status, OperationStatus::OperationNotExecuted);
    assert_eq!(response.body, ResponseBody::Previous(Some(b"v".to_vec())));
}

#[test]
fn test_versioned_replace_and_remove() {
    let mut fx = Fixture::new();
    let writer = RequestWriter::new(VERSION_26);
    fx.run(writer.put(1, b"k", b"v1"));

    let version = match fx.run(writer.key_only(Operation::GetWithVersion, 2, b"k")).body {
        ResponseBody::ValueWithVersion { value, version } => {
            assert_eq!(value, b"v1".to_vec());
            version
        }
        other => panic!("unexpected body {:?}", other),
    };

    let stale = fx.run(writer.replace_if_unmodified(3, b"k", b"v2", version + 100));
    assert_eq!(stale.status, OperationStatus::OperationNotExecuted);

    let applied = fx.run(writer.replace_if_unmodified(4, b"k", b"v2", version));
    assert_eq!(applied.status, OperationStatus::Success);

    let stale = fx.run(writer.remove_if_unmodified(5, b"k", version));
    assert_eq!(stale.status, OperationStatus::OperationNotExecuted);

    let missing = fx.run(writer.remove_if_unmodified(6, b"nope", 1));
    assert_eq!(missing.status, OperationStatus::KeyDoesNotExist);
}

#[test]
fn test_remove_and_contains() {
    let mut fx = Fixture::new();
    let writer = RequestWriter::new(VERSION_25);

    assert_eq!(
        fx.run(writer.key_only(Operation::Remove, 1, b"k")).status,
        OperationStatus::KeyDoesNotExist
    );
    fx.run(writer.put(2, b"k", b"v"));
    assert_eq!(
        fx.run(writer.key_only(Operation::ContainsKey, 3, b"k")).status,
        OperationStatus::Success
    );
    assert_eq!(fx.run(writer.key_only(Operation::Remove, 4, b"k")).status, OperationStatus::Success);
    assert_eq!(
        fx.run(writer.key_only(Operation::ContainsKey, 5, b"k")).status,
        OperationStatus::KeyDoesNotExist
    );
}

// =============================================================================
// Reads and Bulk Operations
// =============================================================================

#[test]
fn test_get() {
    let mut fx = Fixture::new();
    let writer = RequestWriter::new(VERSION_13);
    assert_eq!(
        fx.run(writer.key_only(Operation::Get, 1, b"k")).status,
        OperationStatus::KeyDoesNotExist
    );
    fx.run(writer.put(2, b"k", b"v"));
    let response = fx.run(writer.key_only(Operation::Get, 3, b"k"));
    assert_eq!(response.status, OperationStatus::Success);
    assert_eq!(response.body, ResponseBody::Value(b"v".to_vec()));
}

#[test]
fn test_get_with_metadata() {
    let mut fx = Fixture::new();
    let writer = RequestWriter::new(VERSION_28);
    fx.run(writer.put(1, b"k", b"v"));
    match fx.run(writer.key_only(Operation::GetWithMetadata, 2, b"k")).body {
        ResponseBody::ValueWithMetadata(entry) => {
            assert_eq!(entry.value, b"v".to_vec());
            assert_eq!(entry.lifespan, None);
        }
        other => panic!("unexpected body {:?}", other),
    }
}

#[test]
fn test_put_all_get_all_and_bulk() {
    let mut fx = Fixture::new();
    let writer = RequestWriter::new(VERSION_28);
    let entries = vec![
        (b"a".to_vec(), b"1".to_vec()),
        (b"b".to_vec(), b"2".to_vec()),
        (b"c".to_vec(), b"3".to_vec()),
    ];
    assert_eq!(fx.run(writer.put_all(1, &entries)).status, OperationStatus::Success);

    match fx.run(writer.get_all(2, &[b"a".to_vec(), b"z".to_vec()])).body {
        ResponseBody::Entries(found) => assert_eq!(found, vec![(b"a".to_vec(), b"1".to_vec())]),
        other => panic!("unexpected body {:?}", other),
    }

    match fx.run(writer.bulk(Operation::BulkGet, 3, 0)).body {
        ResponseBody::BulkEntries(all) => assert_eq!(all.len(), 3),
        other => panic!("unexpected body {:?}", other),
    }
    match fx.run(writer.bulk(Operation::BulkGet, 4, 2)).body {
        ResponseBody::BulkEntries(some) => assert_eq!(some.len(), 2),
        other => panic!("unexpected body {:?}", other),
    }
    match fx.run(writer.bulk(Operation::BulkGetKeys, 5, 0)).body {
        ResponseBody::BulkKeys(mut keys) => {
            keys.sort();
            assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        }
        other => panic!("unexpected body {:?}", other),
    }

    assert_eq!(fx.run(writer.header_only(Operation::Size, 6)).body, ResponseBody::Size(3));
    assert_eq!(fx.run(writer.header_only(Operation::Clear, 7)).status, OperationStatus::Success);
    assert_eq!(fx.run(writer.header_only(Operation::Size, 8)).body, ResponseBody::Size(0));
}

#[test]
fn test_stats_names() {
    let mut fx = Fixture::new();
    let writer = RequestWriter::new(VERSION_28);
    fx.run(writer.put(1, b"k", b"v"));
    fx.processor.transport().record_read(10);

    let stats = match fx.run(writer.header_only(Operation::Stats, 2)).body {
        ResponseBody::Stats(stats) => stats,
        other => panic!("unexpected body {:?}", other),
    };
    let value = |name: &str| {
        stats
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| panic!("missing stat {}", name))
    };
    assert_eq!(value("currentNumberOfEntries"), "1");
    assert_eq!(value("stores"), "1");
    assert_eq!(value("totalBytesRead"), "10");
    value("timeSinceStart");
    value("removeMisses");
}

// =============================================================================
// Errors
// =============================================================================

#[test]
fn test_unknown_cache_is_server_error() {
    let mut fx = Fixture::new();
    let writer = RequestWriter::new(VERSION_28).cache_name("missing");
    let response = fx.run(writer.key_only(Operation::Get, 1, b"k"));
    assert_eq!(response.status, OperationStatus::ServerError);
    assert_eq!(response.op_code(), ERROR_RESPONSE);
    match response.body {
        ResponseBody::Error(message) => assert!(message.contains("missing")),
        other => panic!("unexpected body {:?}", other),
    }

    // Ping never touches a cache
    assert_eq!(
        fx.run(writer.header_only(Operation::Ping, 2)).status,
        OperationStatus::Success
    );
}

#[test]
fn test_mismatched_body_is_parse_error() {
    let mut fx = Fixture::new();
    let mut ctx = fx.decode(RequestWriter::new(VERSION_28).key_only(Operation::Get, 1, b"k"));
    ctx.body = RequestBody::Empty;
    let response = fx.processor.process(&ctx, &fx.channel);
    assert_eq!(response.status, OperationStatus::ParseError);
}

#[test]
fn test_error_response_encoding() {
    let mut fx = Fixture::new();
    let response = fx.run(RequestWriter::new(VERSION_22).cache_name("missing").header_only(Operation::Size, 9));
    let encoded = fx.processor.encode(&response).unwrap();
    let mut reader = WireReader::new(&encoded, ReadLimits::default());
    let preamble = read_preamble(&mut reader, VERSION_22, ClientIntelligence::Basic).unwrap();
    assert_eq!(preamble.message_id, 9);
    assert_eq!(preamble.op_code, ERROR_RESPONSE);
    assert_eq!(preamble.status(), Some(OperationStatus::ServerError));
    assert!(reader.read_string().unwrap().contains("missing"));
}

// =============================================================================
// Transactions
// =============================================================================

fn prepare_request(n: u8, one_phase: bool) -> TransactionDecodeContext {
    let mut tx = TransactionDecodeContext::new(Xid::new(1, vec![n], vec![n]), one_phase, 1);
    tx.writes
        .push(TxWrite::put(b"k".to_vec(), b"v".to_vec()).with_control(ControlByte::NON_EXISTING));
    tx
}

#[test]
fn test_prepare_and_commit() {
    let mut fx = Fixture::new();
    let writer = RequestWriter::new(VERSION_27).cache_name("tx");
    let tx = prepare_request(1, false);

    let response = fx.run(writer.prepare(1, &tx));
    assert_eq!(response.status, OperationStatus::Success);
    assert_eq!(response.body, ResponseBody::Transaction(XA_OK));
    assert_eq!(fx.cache("tx").size().unwrap(), 0);

    let response = fx.run(writer.tx_boundary(Operation::CommitTx, 2, &tx.xid));
    assert_eq!(response.body, ResponseBody::Transaction(XA_OK));
    assert_eq!(fx.cache("tx").size().unwrap(), 1);

    let unknown = Xid::new(1, vec![9], vec![9]);
    let response = fx.run(writer.tx_boundary(Operation::RollbackTx, 3, &unknown));
    assert_eq!(response.body, ResponseBody::Transaction(XAER_NOTA));
}

#[test]
fn test_prepare_on_non_transactional_cache() {
    let mut fx = Fixture::new();
    let writer = RequestWriter::new(VERSION_27);
    let response = fx.run(writer.prepare(1, &prepare_request(2, true)));
    assert_eq!(response.status, OperationStatus::ServerError);
    assert_eq!(fx.cache("default").size().unwrap(), 0);
}

// =============================================================================
// Listeners
// =============================================================================

#[test]
fn test_add_and_remove_listener() {
    let mut fx = Fixture::new();
    let writer = RequestWriter::new(VERSION_26);
    let request = hotrodkv::protocol::ListenerRequest {
        listener_id: vec![1, 2],
        include_current_state: false,
        filter: None,
        converter: None,
        use_raw_data: false,
        interests: 0,
    };

    assert_eq!(fx.run(writer.add_listener(1, &request)).status, OperationStatus::Success);
    assert_eq!(
        fx.run(writer.add_listener(2, &request)).status,
        OperationStatus::OperationNotExecuted
    );
    assert_eq!(fx.processor.listeners().len(), 1);

    assert_eq!(fx.run(writer.remove_listener(3, &[1, 2])).status, OperationStatus::Success);
    assert_eq!(
        fx.run(writer.remove_listener(4, &[1, 2])).status,
        OperationStatus::OperationNotExecuted
    );
    assert!(fx.processor.listeners().is_empty());
}
