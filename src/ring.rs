//! Consistent-hash ring with virtual nodes.
//!
//! Maps keys to peer identities so every process agrees on which peer owns a
//! key, and so membership changes move as few keys as possible. Each peer is
//! projected onto the ring as `replicas` virtual points; a key belongs to the
//! peer owning the first point at or after the key's hash, wrapping around.

use std::collections::{HashMap, HashSet};

/// Hash function projecting bytes onto the ring.
pub type HashFn = Box<dyn Fn(&[u8]) -> u32 + Send + Sync>;

/// A consistent-hash ring.
///
/// For a fixed `(replicas, hash, peer set)`, [`get`](Self::get) is a pure
/// function of the key; two processes configured alike agree on ownership.
pub struct HashRing {
    hash: HashFn,
    replicas: usize,
    /// Virtual-node hash points, sorted ascending.
    points: Vec<u32>,
    /// Owning peer of every point.
    owners: HashMap<u32, String>,
}

impl HashRing {
    /// Create an empty ring hashing with CRC-32 (IEEE).
    pub fn new(replicas: usize) -> Self {
        Self::with_hash(replicas, Box::new(|data| crc32fast::hash(data)))
    }

    /// Create an empty ring with a custom hash function.
    pub fn with_hash(replicas: usize, hash: HashFn) -> Self {
        assert!(replicas > 0, "ring needs at least one replica per peer");
        Self {
            hash,
            replicas,
            points: Vec::new(),
            owners: HashMap::new(),
        }
    }

    /// Returns `true` if no peers are registered.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Register peers, projecting `replicas` points for each.
    ///
    /// Point `i` of a peer hashes the decimal rendering of `i` concatenated
    /// with the peer identity. Hash collisions overwrite the owning peer;
    /// the ring is advisory and collisions are rare.
    pub fn add<I, S>(&mut self, peers: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for peer in peers {
            let peer = peer.into();
            for i in 0..self.replicas {
                let point = (self.hash)(format!("{i}{peer}").as_bytes());
                self.points.push(point);
                self.owners.insert(point, peer.clone());
            }
        }
        self.points.sort_unstable();
    }

    /// Deregister peers, deleting exactly their points.
    pub fn remove<I, S>(&mut self, peers: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let gone: HashSet<String> = peers.into_iter().map(|p| p.as_ref().to_owned()).collect();
        self.owners.retain(|_, owner| !gone.contains(owner));
        self.points = self.owners.keys().copied().collect();
        self.points.sort_unstable();
    }

    /// The peer owning `key`, or `None` if the ring is empty.
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }

        let hash = (self.hash)(key.as_bytes());
        let idx = self.points.partition_point(|&point| point < hash);
        // the ring is circular: past the last point, wrap to the first
        let point = self.points[if idx == self.points.len() { 0 } else { idx }];
        Some(
            self.owners
                .get(&point)
                .expect("every point has an owner")
                .as_str(),
        )
    }
}

impl std::fmt::Debug for HashRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashRing")
            .field("replicas", &self.replicas)
            .field("points", &self.points.len())
            .finish_non_exhaustive()
    }
}
