//! Topology block serialization
//!
//! ```text
//! absent          0
//! 2.x endpoints   1 | id (vint) | n (vint) | (host, port u16) * n
//!                 [hash-aware: hash fn 0 | segment count (vint)]
//! 2.x hash        1 | id | n | (host, port) * n | hash fn 3 | segments (vint)
//!                 | per segment: owner count (u8) + owner index (vint) * count
//! 1.x endpoints   1 | id | n | (host, port) * n
//! 1.x hash        1 | id | num owners (u16) | hash fn (u8) | hash space (vint)
//!                 | entries (vint) | (host, port, hash id i32) * entries
//! ```

use bytes::{BufMut, BytesMut};

use crate::protocol::constants::{HASH_FUNCTION_V1, HASH_FUNCTION_V2, LEGACY_HASH_SPACE};
use crate::protocol::wire::WireWrite;
use crate::protocol::ClientIntelligence;

use super::{denormalize_segment_hash_ids, ServerAddress, TopologySnapshot, TopologyUpdate};

fn write_servers(servers: &[ServerAddress], buf: &mut BytesMut) {
    buf.put_vint(servers.len() as u32);
    for server in servers {
        buf.put_string(&server.host);
        buf.put_u16(server.port);
    }
}

/// Topology block for 2.x responses
pub fn write_topology_v2(update: Option<&TopologyUpdate>, intelligence: ClientIntelligence, buf: &mut BytesMut) {
    // Owner indices point into the server list, so an empty list is no update
    let Some(update) = update.filter(|u| !u.servers().is_empty()) else {
        buf.put_u8(0);
        return;
    };
    buf.put_u8(1);
    buf.put_vint(update.topology_id() as u32);
    write_servers(update.servers(), buf);

    match update {
        TopologyUpdate::Endpoints { num_segments, .. } => {
            if intelligence == ClientIntelligence::HashDistributionAware {
                buf.put_u8(0);
                buf.put_vint(*num_segments as u32);
            }
        }
        TopologyUpdate::Hash { owners, .. } => {
            buf.put_u8(HASH_FUNCTION_V2);
            buf.put_vint(owners.len() as u32);
            for segment_owners in owners {
                if segment_owners.is_empty() {
                    // No live owner: point the client at the first server
                    buf.put_u8(1);
                    buf.put_vint(0);
                    continue;
                }
                buf.put_u8(segment_owners.len() as u8);
                for &idx in segment_owners {
                    buf.put_vint(idx as u32);
                }
            }
        }
    }
}

/// Topology block for 1.x responses
pub fn write_topology_v1(
    update: Option<&TopologyUpdate>,
    snapshot: Option<&TopologySnapshot>,
    intelligence: ClientIntelligence,
    buf: &mut BytesMut,
) {
    let Some(update) = update.filter(|u| !u.servers().is_empty()) else {
        buf.put_u8(0);
        return;
    };
    buf.put_u8(1);
    buf.put_vint(update.topology_id() as u32);

    match update {
        TopologyUpdate::Endpoints { servers, .. } if intelligence == ClientIntelligence::HashDistributionAware => {
            // Limited hash topology: every field zeroed
            buf.put_u16(0);
            buf.put_u8(0);
            buf.put_vint(0);
            buf.put_vint(servers.len() as u32);
            for server in servers {
                buf.put_string(&server.host);
                buf.put_u16(server.port);
                buf.put_i32(0);
            }
        }
        TopologyUpdate::Endpoints { servers, .. } => write_servers(servers, buf),
        TopologyUpdate::Hash {
            servers,
            num_owners,
            owners,
            ..
        } => {
            let hash_ids = match snapshot {
                Some(snapshot) => snapshot.legacy_hash_ids(),
                None => std::sync::Arc::new(denormalize_segment_hash_ids(owners.len(), *num_owners)),
            };

            let mut entries: Vec<(&ServerAddress, i32)> = Vec::new();
            for (server_idx, server) in servers.iter().enumerate() {
                for (segment, segment_owners) in owners.iter().enumerate() {
                    let Some(position) = segment_owners.iter().position(|&o| o == server_idx) else {
                        continue;
                    };
                    if let Some(&id) = hash_ids.get(segment).and_then(|ids| ids.get(position)) {
                        entries.push((server, id));
                    }
                }
            }

            buf.put_u16(*num_owners as u16);
            buf.put_u8(HASH_FUNCTION_V1);
            buf.put_vint(LEGACY_HASH_SPACE as u32);
            buf.put_vint(entries.len() as u32);
            for (server, id) in entries {
                buf.put_string(&server.host);
                buf.put_u16(server.port);
                buf.put_i32(id);
            }
        }
    }
}
