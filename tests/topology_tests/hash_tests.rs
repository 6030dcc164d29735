//! Hash Tests
//!
//! Tests for ring positions and the legacy hash id search.

use hotrodkv::protocol::constants::LEGACY_HASH_SPACE;
use hotrodkv::topology::{denormalize_segment_hash_ids, leeway, normalized_hash, CacheMode, TopologySnapshot};

fn segment_size(num_segments: usize) -> i64 {
    let space = i64::from(LEGACY_HASH_SPACE);
    (space + num_segments as i64 - 1) / num_segments as i64
}

// =============================================================================
// Ring Positions
// =============================================================================

#[test]
fn test_normalized_hash_is_non_negative() {
    for value in [0, 1, -1, 42, i32::MIN, i32::MAX] {
        assert!(normalized_hash(value) >= 0);
    }
}

#[test]
fn test_normalized_hash_is_stable() {
    assert_eq!(normalized_hash(12345), normalized_hash(12345));
    assert_ne!(normalized_hash(1), normalized_hash(2));
}

// =============================================================================
// Denormalization
// =============================================================================

#[test]
fn test_ids_land_inside_their_segment_window() {
    let num_segments = 8;
    let num_owners = 2;
    let ids = denormalize_segment_hash_ids(num_segments, num_owners);
    assert_eq!(ids.len(), num_segments);

    let size = segment_size(num_segments);
    let window = leeway(size, num_owners);
    for (segment, slot) in ids.iter().enumerate() {
        assert_eq!(slot.len(), num_owners);
        for &id in slot {
            let hash = i64::from(normalized_hash(id));
            let start = segment as i64 * size;
            assert!(
                hash >= start && hash < start + window,
                "id {} hashes to {} outside segment {}",
                id,
                hash,
                segment
            );
        }
    }
}

#[test]
fn test_ids_are_distinct_within_a_segment() {
    let ids = denormalize_segment_hash_ids(4, 3);
    for slot in &ids {
        let mut sorted = slot.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), slot.len());
    }
}

#[test]
fn test_denormalization_is_deterministic() {
    assert_eq!(denormalize_segment_hash_ids(6, 2), denormalize_segment_hash_ids(6, 2));
}

#[test]
fn test_empty_dimensions() {
    assert!(denormalize_segment_hash_ids(0, 2).is_empty());
    assert_eq!(denormalize_segment_hash_ids(3, 0), vec![Vec::<i32>::new(); 3]);
}

#[test]
fn test_snapshot_caches_legacy_ids() {
    let snapshot = TopologySnapshot::new(1, CacheMode::Distributed)
        .with_member("a", None)
        .with_segments(1, vec![vec!["a".into()], vec!["a".into()]]);
    let first = snapshot.legacy_hash_ids();
    let second = snapshot.legacy_hash_ids();
    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert_eq!(first.len(), 2);
    assert_eq!(*first, denormalize_segment_hash_ids(2, 1));
}
