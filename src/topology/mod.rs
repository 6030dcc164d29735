//! Topology Module
//!
//! What the server tells clients about the cluster.
//!
//! ## Responsibilities
//! - Model a cache's topology: members, published endpoints, segment owners
//! - Decide whether a response carries a topology update (`maybe_topology`)
//! - Serialize updates for 1.x and 2.x clients
//! - Denormalize segment hash ids for 1.x hash-aware clients
//!
//! The cluster itself is an external collaborator reached through [`ClusterView`].

mod encode;
mod hash;
mod update;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

pub use encode::{write_topology_v1, write_topology_v2};
pub use hash::{denormalize_segment_hash_ids, leeway, murmur3_32, normalized_hash, MURMUR_SEED};
pub use update::{maybe_topology, TopologyUpdate};

/// Cluster member identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl From<&str> for NodeId {
    fn from(name: &str) -> Self {
        NodeId(name.to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Host and port a client connects to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// How a cache spreads its data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Local,
    Replicated,
    Invalidation,
    Distributed,
}

impl CacheMode {
    pub fn is_clustered(&self) -> bool {
        !matches!(self, CacheMode::Local)
    }
}

/// Segment → owners table of a distributed cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentOwnership {
    pub num_owners: usize,
    /// Indexed by segment; primary owner first
    pub owners: Vec<Vec<NodeId>>,
}

impl SegmentOwnership {
    pub fn num_segments(&self) -> usize {
        self.owners.len()
    }
}

/// Immutable view of one cache's topology at one topology id
#[derive(Debug)]
pub struct TopologySnapshot {
    pub topology_id: i32,
    pub cache_mode: CacheMode,
    pub members: Vec<NodeId>,
    /// Published endpoints, in member order
    pub endpoints: Vec<(NodeId, ServerAddress)>,
    pub segments: Option<SegmentOwnership>,
    legacy_hash_ids: OnceLock<Arc<Vec<Vec<i32>>>>,
}

impl TopologySnapshot {
    pub fn new(topology_id: i32, cache_mode: CacheMode) -> Self {
        Self {
            topology_id,
            cache_mode,
            members: Vec::new(),
            endpoints: Vec::new(),
            segments: None,
            legacy_hash_ids: OnceLock::new(),
        }
    }

    /// Add a member; `None` means it has not published an endpoint yet
    pub fn with_member(mut self, node: impl Into<NodeId>, endpoint: Option<ServerAddress>) -> Self {
        let node = node.into();
        if let Some(address) = endpoint {
            self.endpoints.push((node.clone(), address));
        }
        self.members.push(node);
        self
    }

    pub fn with_segments(mut self, num_owners: usize, owners: Vec<Vec<NodeId>>) -> Self {
        self.segments = Some(SegmentOwnership { num_owners, owners });
        self
    }

    pub fn num_segments(&self) -> usize {
        self.segments.as_ref().map_or(0, |s| s.num_segments())
    }

    pub fn num_owners(&self) -> usize {
        self.segments.as_ref().map_or(0, |s| s.num_owners)
    }

    /// Whether some member has not published its endpoint
    pub fn has_missing_endpoints(&self) -> bool {
        self.members
            .iter()
            .any(|m| !self.endpoints.iter().any(|(node, _)| node == m))
    }

    /// Hash ids for 1.x clients, computed once per snapshot
    pub fn legacy_hash_ids(&self) -> Arc<Vec<Vec<i32>>> {
        Arc::clone(self.legacy_hash_ids.get_or_init(|| {
            tracing::debug!(
                "Denormalizing {} segments x {} owners for topology {}",
                self.num_segments(),
                self.num_owners(),
                self.topology_id
            );
            Arc::new(denormalize_segment_hash_ids(self.num_segments(), self.num_owners()))
        }))
    }
}

impl From<String> for NodeId {
    fn from(name: String) -> Self {
        NodeId(name)
    }
}

// =============================================================================
// Cluster View
// =============================================================================

/// Read access to the distribution layer
pub trait ClusterView: Send + Sync {
    fn local_node(&self) -> NodeId;

    /// Whether `node` is currently part of the cluster
    fn is_member(&self, node: &NodeId) -> bool;

    /// Current topology of `cache_name`; `None` for caches without one
    fn topology(&self, cache_name: &str) -> Option<Arc<TopologySnapshot>>;
}

/// A cluster view whose membership and topologies are set explicitly
pub struct StaticClusterView {
    local: NodeId,
    members: RwLock<Vec<NodeId>>,
    topologies: RwLock<HashMap<String, Arc<TopologySnapshot>>>,
}

impl StaticClusterView {
    pub fn new(local: impl Into<NodeId>) -> Self {
        let local = local.into();
        Self {
            members: RwLock::new(vec![local.clone()]),
            local,
            topologies: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_members(&self, members: Vec<NodeId>) {
        *self.members.write() = members;
    }

    pub fn set_topology(&self, cache_name: impl Into<String>, snapshot: TopologySnapshot) {
        let cache_name = cache_name.into();
        tracing::debug!("Topology of '{}' is now {}", cache_name, snapshot.topology_id);
        self.topologies.write().insert(cache_name, Arc::new(snapshot));
    }

    pub fn remove_topology(&self, cache_name: &str) {
        self.topologies.write().remove(cache_name);
    }
}

impl ClusterView for StaticClusterView {
    fn local_node(&self) -> NodeId {
        self.local.clone()
    }

    fn is_member(&self, node: &NodeId) -> bool {
        self.members.read().contains(node)
    }

    fn topology(&self, cache_name: &str) -> Option<Arc<TopologySnapshot>> {
        self.topologies.read().get(cache_name).cloned()
    }
}
