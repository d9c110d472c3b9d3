//! Provides the consistent hash ring which deterministically maps keys to cache nodes.
//!
//! Every node of a cache cluster builds the same ring from the same peer list. A key is routed
//! to the node owning the first ring position at or after the key's hash - therefore all nodes
//! agree on the owner of every key without any coordination. Adding a node only remaps the keys
//! falling into the arcs claimed by its positions, which is the property that makes consistent
//! hashing attractive for cache sharding in the first place.
//!
//! To smooth the load distribution, each physical node claims a configurable number of
//! **virtual replicas** on the ring: with only one position per node, the arc sizes (and
//! therefore the per-node load) are entirely up to chance, while a few dozen positions per node
//! even out the distribution quite reliably.
//!
//! The ring is append-only by design: peer sets are announced wholesale (see
//! [HttpPeers::set_peers](crate::transport::HttpPeers::set_peers)) and a changed set is handled
//! by building a fresh ring rather than by mutating the existing one.
use fnv::FnvHashMap;

/// Computes the ring position of a key.
///
/// The default is CRC-32, mainly because it is a well-known checksum which is cheap to compute
/// and available on every platform. All nodes of a cluster must use the same function.
pub type HashFn = Box<dyn Fn(&[u8]) -> u32 + Send + Sync>;

/// Maps keys to node identifiers using consistent hashing with virtual replicas.
///
/// # Examples
/// ```
/// # use ganymede::ring::HashRing;
/// let mut ring = HashRing::new(50);
/// ring.add(&["http://cache-1:2420", "http://cache-2:2420"]);
///
/// // Routing is deterministic...
/// let owner = ring.locate("some-key").unwrap().to_owned();
/// assert_eq!(ring.locate("some-key").unwrap(), owner);
///
/// // ...and always lands on a registered node.
/// assert_eq!(owner.starts_with("http://cache-"), true);
/// ```
pub struct HashRing {
    hash: HashFn,
    replicas: usize,
    positions: Vec<u32>,
    nodes: FnvHashMap<u32, String>,
}

impl HashRing {
    /// Creates an empty ring which claims the given number of virtual replicas per node.
    ///
    /// Keys and virtual node names are hashed with CRC-32.
    pub fn new(replicas: usize) -> Self {
        HashRing::with_hash(replicas, Box::new(crc32fast::hash))
    }

    /// Creates an empty ring using a custom hash function.
    ///
    /// This is mainly useful for tests which want full control over the ring positions. All
    /// nodes of a cluster have to agree on the hash function, otherwise they will route keys
    /// to different owners.
    pub fn with_hash(replicas: usize, hash: HashFn) -> Self {
        HashRing {
            hash,
            replicas,
            positions: Vec::new(),
            nodes: FnvHashMap::default(),
        }
    }

    /// Registers the given nodes on the ring.
    ///
    /// For each node, **replicas** ring positions are claimed by hashing `"{i}{node}"` for each
    /// replica index i. The position sequence is re-sorted after every batch so that lookups
    /// can binary-search it.
    pub fn add<S: AsRef<str>>(&mut self, nodes: &[S]) {
        for node in nodes {
            let node = node.as_ref();
            for replica in 0..self.replicas {
                let position = (self.hash)(format!("{}{}", replica, node).as_bytes());
                self.positions.push(position);
                let _ = self.nodes.insert(position, node.to_owned());
            }
        }

        self.positions.sort_unstable();
    }

    /// Returns the identifier of the node owning the given key.
    ///
    /// Returns **None** if no nodes have been registered yet. Otherwise the owner is determined
    /// by binary-searching the first ring position at or after the key's hash - wrapping around
    /// to the first position if the key hashes above all of them. Without the wraparound, keys
    /// hashing beyond the largest position would be unroutable.
    pub fn locate(&self, key: &str) -> Option<&str> {
        if self.positions.is_empty() {
            return None;
        }

        let hash = (self.hash)(key.as_bytes());
        let index = match self.positions.binary_search(&hash) {
            Ok(index) => index,
            Err(index) => index,
        };
        let position = self.positions[index % self.positions.len()];

        self.nodes.get(&position).map(|node| node.as_str())
    }

    /// Determines if any node has been registered.
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Returns the number of virtual nodes (ring positions) currently claimed.
    pub fn virtual_nodes(&self) -> usize {
        self.positions.len()
    }
}

#[cfg(test)]
mod tests {
    use crate::ring::HashRing;
    use std::collections::HashMap;

    /// Creates a ring with a fully predictable hash: keys are parsed as decimal numbers.
    ///
    /// With three replicas, a node "6" claims the positions 6 ("06"), 16 ("16") and 26 ("26").
    fn numeric_ring() -> HashRing {
        HashRing::with_hash(
            3,
            Box::new(|data| {
                std::str::from_utf8(data)
                    .unwrap()
                    .parse::<u32>()
                    .unwrap()
            }),
        )
    }

    #[test]
    fn keys_are_routed_to_the_next_position_with_wraparound() {
        let mut ring = numeric_ring();
        ring.add(&["6", "4", "2"]);

        // Ring positions: 2, 4, 6, 12, 14, 16, 22, 24, 26
        assert_eq!(ring.locate("2").unwrap(), "2");
        assert_eq!(ring.locate("11").unwrap(), "2");
        assert_eq!(ring.locate("23").unwrap(), "4");

        // 27 lies beyond the largest position and therefore wraps around to the first one...
        assert_eq!(ring.locate("27").unwrap(), "2");
    }

    #[test]
    fn added_nodes_claim_their_share_of_the_ring() {
        let mut ring = numeric_ring();
        ring.add(&["6", "4", "2"]);

        // 27 wraps around initially (see above). Once "8" joins (claiming 8, 18 and 28),
        // it takes over that key...
        assert_eq!(ring.locate("27").unwrap(), "2");
        ring.add(&["8"]);
        assert_eq!(ring.locate("27").unwrap(), "8");

        // ...and each registered node holds exactly three virtual positions.
        assert_eq!(ring.virtual_nodes(), 4 * 3);
    }

    #[test]
    fn routing_is_deterministic_and_complete() {
        let mut ring = HashRing::new(16);
        let nodes = ["node-a", "node-b", "node-c"];
        ring.add(&nodes);

        for index in 0..1000 {
            let key = format!("key{}", index);
            let owner = ring.locate(&key).unwrap().to_owned();

            // Repeated lookups agree and only ever yield registered nodes...
            assert_eq!(ring.locate(&key).unwrap(), owner);
            assert_eq!(nodes.contains(&owner.as_str()), true);
        }
    }

    #[test]
    fn an_empty_ring_routes_nothing() {
        let ring = HashRing::new(50);

        assert_eq!(ring.is_empty(), true);
        assert_eq!(ring.locate("anything"), None);
    }

    /// Distributes a key sample over three nodes and returns the spread between the most and
    /// the least loaded node.
    fn spread_for_replicas(replicas: usize) -> usize {
        let mut ring = HashRing::new(replicas);
        ring.add(&["node-a", "node-b", "node-c"]);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for index in 0..10_000 {
            let owner = ring.locate(&format!("key{}", index)).unwrap();
            *counts.entry(owner.to_owned()).or_insert(0) += 1;
        }

        let max = counts.values().max().copied().unwrap_or(0);
        let min = counts.values().min().copied().unwrap_or(0);

        max - min
    }

    #[test]
    fn replicas_smooth_the_load_distribution() {
        // With a single position per node the arc sizes are up to chance, with 64 positions
        // per node the sample is distributed noticeably more evenly...
        assert_eq!(spread_for_replicas(64) < spread_for_replicas(1), true);
    }
}
