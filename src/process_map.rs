//! Process map — the pure `Key -> ProcessId` routing function that shards
//! the function tree across ranks (spec.md §3, §4.2).

use crate::tree::key::Key;

/// Ranks below this level are routed by an ancestor key instead of the key
/// itself, to keep parent/child locality near the root where fan-out is
/// highest.
const DEFAULT_N0: u32 = 2;

/// Maps tree keys to owning ranks.
///
/// The default implementation hashes the key itself once `n > n0`, and
/// hashes the level-`n0` ancestor below that, so that a whole near-root
/// subtree lands on one process (spec.md §3's "preserving parent-child
/// locality on the deep parts of the tree" — read literally: locality is
/// preserved near the root, where `n <= n0`).
pub trait ProcessMap<const D: usize>: Send + Sync {
    /// The owning rank for `key`.
    fn owner(&self, key: Key<D>) -> usize;

    /// Total number of ranks this map distributes over.
    fn world_size(&self) -> usize;
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

fn key_hash<const D: usize>(key: Key<D>) -> u64 {
    let mut bytes = Vec::with_capacity(4 + D * 8);
    bytes.extend_from_slice(&key.n.to_le_bytes());
    for coord in key.l {
        bytes.extend_from_slice(&coord.to_le_bytes());
    }
    fnv1a(&bytes)
}

/// Default process map from spec.md §3: hash the key above `n0`, hash the
/// `n0`-ancestor below.
#[derive(Clone, Copy, Debug)]
pub struct DefaultProcessMap {
    world_size: usize,
    n0: u32,
}

impl DefaultProcessMap {
    /// A default map over `world_size` ranks using the standard `n0`.
    #[must_use]
    pub fn new(world_size: usize) -> Self {
        assert!(world_size > 0, "process map needs at least one rank");
        Self {
            world_size,
            n0: DEFAULT_N0,
        }
    }

    /// A default map with an explicit locality threshold `n0`.
    #[must_use]
    pub fn with_n0(world_size: usize, n0: u32) -> Self {
        assert!(world_size > 0, "process map needs at least one rank");
        Self { world_size, n0 }
    }

    fn ancestor_at_n0<const D: usize>(&self, mut key: Key<D>) -> Key<D> {
        while key.n > self.n0 {
            key = key.parent();
        }
        key
    }
}

impl<const D: usize> ProcessMap<D> for DefaultProcessMap {
    fn owner(&self, key: Key<D>) -> usize {
        let routing_key = if key.n > self.n0 {
            key
        } else {
            self.ancestor_at_n0(key)
        };
        (key_hash(routing_key) % self.world_size as u64) as usize
    }

    fn world_size(&self) -> usize {
        self.world_size
    }
}

/// A process map pinning every key to a single rank; useful for
/// single-process tests and for factory defaults before a world is known.
#[derive(Clone, Copy, Debug)]
pub struct SingleProcessMap;

impl<const D: usize> ProcessMap<D> for SingleProcessMap {
    fn owner(&self, _key: Key<D>) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_process_map_always_owns() {
        let pmap = SingleProcessMap;
        let k = Key::<2> { n: 5, l: [3, 1] };
        assert_eq!(<SingleProcessMap as ProcessMap<2>>::owner(&pmap, k), 0);
    }

    #[test]
    fn near_root_subtree_shares_an_owner() {
        let pmap = DefaultProcessMap::new(8);
        let root = Key::<2>::root();
        let deep_a = root.child(0).child(1).child(2).child(3);
        let deep_b = root.child(0).child(1).child(2).child(0);
        // Both descend the same n0-ancestor, so they must land on the same rank.
        assert_eq!(pmap.owner(deep_a), pmap.owner(deep_b));
    }

    #[test]
    fn owner_is_within_world_size() {
        let pmap = DefaultProcessMap::new(5);
        for bits in 0..4usize {
            let k = Key::<2>::root().child(bits);
            assert!(pmap.owner(k) < 5);
        }
    }
}
