//! Topology update decision

use std::collections::HashMap;

use crate::protocol::{ClientIntelligence, ResponseHeader};

use super::{CacheMode, NodeId, ServerAddress, TopologySnapshot};

/// Topology block attached to a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyUpdate {
    /// Endpoint list only
    Endpoints {
        topology_id: i32,
        servers: Vec<ServerAddress>,
        num_segments: usize,
    },
    /// Endpoint list plus the segment ownership table
    Hash {
        topology_id: i32,
        servers: Vec<ServerAddress>,
        num_owners: usize,
        /// Per segment, indices into `servers`
        owners: Vec<Vec<usize>>,
    },
}

impl TopologyUpdate {
    pub fn topology_id(&self) -> i32 {
        match self {
            TopologyUpdate::Endpoints { topology_id, .. } | TopologyUpdate::Hash { topology_id, .. } => *topology_id,
        }
    }

    pub fn servers(&self) -> &[ServerAddress] {
        match self {
            TopologyUpdate::Endpoints { servers, .. } | TopologyUpdate::Hash { servers, .. } => servers,
        }
    }
}

/// Decide whether a response to `header` carries a topology update
///
/// - basic clients, local caches and clients already at the current id get nothing
/// - while some member has no published endpoint the update is deferred, unless the client
///   is two or more ids behind, in which case it gets a partial update at `current - 1`
/// - with no published endpoint at all there is nothing to send
/// - hash-aware clients of replicated and distributed caches get segment ownership, everyone
///   else the endpoint list
pub fn maybe_topology(header: &ResponseHeader, snapshot: Option<&TopologySnapshot>) -> Option<TopologyUpdate> {
    if header.client_intelligence == ClientIntelligence::Basic {
        return None;
    }
    let snapshot = snapshot?;
    if snapshot.cache_mode == CacheMode::Local {
        return None;
    }

    let current = snapshot.topology_id;
    if header.topology_id >= current {
        return None;
    }

    let mut topology_id = current;
    if snapshot.has_missing_endpoints() {
        let gap = i64::from(current) - i64::from(header.topology_id);
        if gap < 2 {
            tracing::trace!(
                "Deferring topology {} for client at {}: endpoints not published yet",
                current,
                header.topology_id
            );
            return None;
        }
        topology_id = current - 1;
    }

    let published: Vec<&(NodeId, ServerAddress)> = snapshot
        .endpoints
        .iter()
        .filter(|(node, _)| snapshot.members.contains(node))
        .collect();
    let servers: Vec<ServerAddress> = published.iter().map(|(_, addr)| addr.clone()).collect();
    if servers.is_empty() {
        tracing::trace!("No endpoints published for topology {}", current);
        return None;
    }

    let hash_aware = header.client_intelligence == ClientIntelligence::HashDistributionAware;
    let segmented = snapshot.cache_mode != CacheMode::Invalidation;
    match &snapshot.segments {
        Some(segments) if hash_aware && segmented => {
            let index: HashMap<&NodeId, usize> =
                published.iter().enumerate().map(|(idx, (node, _))| (node, idx)).collect();
            let owners = segments
                .owners
                .iter()
                .map(|nodes| nodes.iter().filter_map(|n| index.get(n).copied()).collect())
                .collect();
            Some(TopologyUpdate::Hash {
                topology_id,
                servers,
                num_owners: segments.num_owners,
                owners,
            })
        }
        _ => Some(TopologyUpdate::Endpoints {
            topology_id,
            servers,
            num_segments: if segmented { snapshot.num_segments() } else { 0 },
        }),
    }
}
