//! Legacy hash ids
//!
//! 1.x hash-aware clients place servers on a 31-bit ring using one hash id per
//! (owner, segment) pair. Segment ownership has no such ids, so they are found by search:
//! walk the integers, hash each one, and keep it for segment `s` when its normalized hash
//! lands shortly after the start of `s`.

use crate::protocol::constants::LEGACY_HASH_SPACE;

/// Seed used for every ring position hash
pub const MURMUR_SEED: u32 = 9001;

/// MurmurHash3, x86 32-bit variant
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;
    let chunks = data.chunks_exact(4);
    let tail = chunks.remainder();

    for chunk in chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let mut k: u32 = 0;
    if tail.len() >= 3 {
        k ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        k ^= u32::from(tail[1]) << 8;
    }
    if !tail.is_empty() {
        k ^= u32::from(tail[0]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
    }

    // Finalization mix
    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// Ring position of an integer: its big-endian bytes hashed, sign bit cleared
pub fn normalized_hash(value: i32) -> i32 {
    (murmur3_32(&value.to_be_bytes(), MURMUR_SEED) & LEGACY_HASH_SPACE as u32) as i32
}

/// Width of the window after a segment start that accepts a hash id
pub fn leeway(segment_size: i64, num_owners: usize) -> i64 {
    let per_owner = segment_size / 64;
    (per_owner * num_owners as i64).min(segment_size / 2).max(1)
}

/// Find `num_owners` hash ids for each of `num_segments` segments
///
/// Integers are scanned from 0 upward; once the positive range is exhausted the scan wraps
/// into the negative half. Segments still short after a full cycle are padded with the
/// segment start.
pub fn denormalize_segment_hash_ids(num_segments: usize, num_owners: usize) -> Vec<Vec<i32>> {
    if num_segments == 0 || num_owners == 0 {
        return vec![Vec::new(); num_segments];
    }

    let space = i64::from(LEGACY_HASH_SPACE);
    let segment_size = (space + num_segments as i64 - 1) / num_segments as i64;
    let window = leeway(segment_size, num_owners);

    let mut ids: Vec<Vec<i32>> = vec![Vec::with_capacity(num_owners); num_segments];
    let mut missing = num_segments * num_owners;

    for counter in 0..=u32::MAX {
        let candidate = counter as i32;
        let hash = i64::from(normalized_hash(candidate));
        let segment = (hash / segment_size) as usize;
        let offset = hash - segment as i64 * segment_size;
        if offset >= window || segment >= num_segments {
            continue;
        }
        let slot = &mut ids[segment];
        if slot.len() < num_owners {
            slot.push(candidate);
            missing -= 1;
            if missing == 0 {
                break;
            }
        }
    }

    if missing > 0 {
        tracing::warn!(
            "Hash id search left {} slots empty; falling back to segment boundaries",
            missing
        );
        for (segment, slot) in ids.iter_mut().enumerate() {
            let start = (segment as i64 * segment_size).min(space) as i32;
            while slot.len() < num_owners {
                slot.push(start);
            }
        }
    }
    ids
}
