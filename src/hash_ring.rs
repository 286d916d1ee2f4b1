// Copyright 2026 Directory Services Engineering

//! Weighted consistent hashing.
//!
//! A circular 32-bit hash space owned by partition keys. Each partition
//! occupies `weight` ring points, computed by hashing `"{key}-{i}"` for
//! `i` in `0..weight`. A lookup resolves to the first ring point at or after
//! the lookup's hash (closed lower bound), wrapping to the smallest point.
//! Adding or removing a partition reassigns only the spans its points owned.
//!
//! The map is a plain value type: holders that share one across threads keep
//! it behind an `Arc` and replace the whole snapshot on membership change, so
//! readers see either the old or the new ring, never a torn one.

use std::collections::{BTreeMap, HashMap};

use derive_more::{Display, From, Into};

/// Identifies one partition (backend server) on the ring.
#[derive(Clone, Debug, Display, Eq, From, Hash, Into, Ord, PartialEq, PartialOrd)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PartitionKey {
    fn from(value: &str) -> Self {
        PartitionKey(value.to_owned())
    }
}

/// The production ring hash: leading four MD5 digest bytes as an unsigned
/// big-endian 32-bit integer.
pub fn md5_hash32(key: &str) -> u32 {
    let digest = md5::compute(key.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

type HashFn = dyn Fn(&str) -> u32 + Send + Sync;

/// A generic weighted consistent-hashing ring mapping keys to partitions.
pub struct ConsistentHashMap<V> {
    ring: BTreeMap<u32, (PartitionKey, V)>,
    // Ring points per partition, kept so removal does not scan the ring.
    points: HashMap<PartitionKey, Vec<u32>>,
    hash: Box<HashFn>,
}

impl<V: Clone> ConsistentHashMap<V> {
    /// A ring using the production MD5 hash function.
    pub fn new() -> Self {
        ConsistentHashMap::with_hash(Box::new(md5_hash32))
    }

    /// A ring using an injected hash function. The map only requires that
    /// identical inputs produce identical outputs.
    pub fn with_hash(hash: Box<HashFn>) -> Self {
        ConsistentHashMap {
            ring: BTreeMap::new(),
            points: HashMap::new(),
            hash,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Number of ring points (not partitions).
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn partition_count(&self) -> usize {
        self.points.len()
    }

    /// Insert a partition occupying `weight` ring points. Re-inserting an
    /// existing key replaces it.
    pub fn put(&mut self, key: PartitionKey, value: V, weight: u32) {
        if self.points.contains_key(&key) {
            self.remove(&key);
        }
        let mut owned = Vec::with_capacity(weight as usize);
        for i in 0..weight {
            let point = (self.hash)(&format!("{}-{}", key, i));
            self.ring.insert(point, (key.clone(), value.clone()));
            owned.push(point);
        }
        self.points.insert(key, owned);
    }

    /// Remove a partition and all of its ring points. The hash ranges it
    /// owned fall through to the next clockwise partition.
    pub fn remove(&mut self, key: &PartitionKey) -> bool {
        match self.points.remove(key) {
            Some(owned) => {
                for point in owned {
                    // Another partition may have overwritten this point.
                    if self
                        .ring
                        .get(&point)
                        .map_or(false, |(owner, _)| owner == key)
                    {
                        self.ring.remove(&point);
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Resolve a lookup key to the partition owning its hash.
    pub fn get(&self, lookup_key: &str) -> Option<&V> {
        self.get_entry(lookup_key).map(|(_, value)| value)
    }

    /// Resolve a lookup key to the owning partition's key and value.
    pub fn get_entry(&self, lookup_key: &str) -> Option<(&PartitionKey, &V)> {
        if self.ring.is_empty() {
            return None;
        }
        let hash = (self.hash)(lookup_key);
        let entry = self
            .ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next());
        entry.map(|(_, (key, value))| (key, value))
    }

    /// Per partition key, the total hash-range size it currently owns: the
    /// sum over its ring points of the span from the previous point
    /// (exclusive) to the point (inclusive). The spans of all partitions
    /// cover the whole 2^32 space. Diagnostics and tests only.
    pub fn get_weights(&self) -> HashMap<PartitionKey, u64> {
        let mut weights = HashMap::with_capacity(self.points.len());
        if self.ring.is_empty() {
            return weights;
        }
        let points: Vec<(u32, &PartitionKey)> = self
            .ring
            .iter()
            .map(|(point, (key, _))| (*point, key))
            .collect();
        for (index, (point, key)) in points.iter().enumerate() {
            let span = if points.len() == 1 {
                1u64 << 32
            } else {
                let previous = if index == 0 {
                    points[points.len() - 1].0
                } else {
                    points[index - 1].0
                };
                u64::from(point.wrapping_sub(previous))
            };
            *weights.entry((*key).clone()).or_insert(0) += span;
        }
        weights
    }
}

impl<V: Clone> Default for ConsistentHashMap<V> {
    fn default() -> Self {
        ConsistentHashMap::new()
    }
}

impl<V> std::fmt::Debug for ConsistentHashMap<V> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("ConsistentHashMap")
            .field("partitions", &self.points.keys().collect::<Vec<_>>())
            .field("points", &self.ring.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Routes by the leading decimal digits of the key, so tests can place
    // partitions and lookups at exact ring positions.
    fn numeric_hash() -> Box<HashFn> {
        Box::new(|key: &str| {
            let digits: String =
                key.chars().filter(|c| c.is_ascii_digit()).collect();
            digits.parse::<u32>().unwrap_or(0)
        })
    }

    #[test]
    fn lookup_is_deterministic() {
        let mut ring = ConsistentHashMap::new();
        ring.put("partition-a".into(), 0usize, 8);
        ring.put("partition-b".into(), 1usize, 8);
        ring.put("partition-c".into(), 2usize, 8);
        let first = *ring.get("uid=bjensen,ou=people,dc=example,dc=com").unwrap();
        for _ in 0..10 {
            let again =
                *ring.get("uid=bjensen,ou=people,dc=example,dc=com").unwrap();
            assert_eq!(first, again);
        }
    }

    #[test]
    fn lookup_resolves_to_next_point_at_or_after_hash() {
        let mut ring = ConsistentHashMap::with_hash(numeric_hash());
        // Single-point partitions at 100, 200, 300: "a-0" hashes to 100 etc.
        // is awkward with the digit filter, so weight 1 keys carry digits.
        ring.put("100".into(), "low", 1); // point at hash("100-0") = 1000
        ring.put("200".into(), "mid", 1); // 2000
        ring.put("300".into(), "high", 1); // 3000
        assert_eq!(*ring.get("1500").unwrap(), "mid");
        // Closed lower bound: an exact hit resolves to that entry.
        assert_eq!(*ring.get("2000").unwrap(), "mid");
        assert_eq!(*ring.get("2001").unwrap(), "high");
        // Wraparound past the largest point.
        assert_eq!(*ring.get("9999").unwrap(), "low");
    }

    #[test]
    fn removal_reassigns_only_the_removed_span() {
        let mut ring = ConsistentHashMap::with_hash(numeric_hash());
        ring.put("100".into(), "a", 1); // 1000
        ring.put("200".into(), "b", 1); // 2000
        ring.put("300".into(), "c", 1); // 3000

        let keys: Vec<String> = (500..3500).step_by(100)
            .map(|n| n.to_string())
            .collect();
        let before: Vec<&str> =
            keys.iter().map(|k| *ring.get(k).unwrap()).collect();

        ring.remove(&"200".into());

        for (key, owner_before) in keys.iter().zip(before) {
            let owner_after = *ring.get(key).unwrap();
            if owner_before == "b" {
                // Keys in b's span fall through to the next clockwise owner.
                assert_eq!(owner_after, "c");
            } else {
                assert_eq!(owner_after, owner_before);
            }
        }
    }

    #[test]
    fn weights_cover_the_whole_ring() {
        let mut ring = ConsistentHashMap::new();
        ring.put("a".into(), 0usize, 10);
        ring.put("b".into(), 1usize, 20);
        let weights = ring.get_weights();
        let total: u64 = weights.values().sum();
        assert_eq!(total, 1u64 << 32);
        // Twice the points should own more of the ring, with slack for hash
        // placement variance.
        assert!(weights[&PartitionKey::from("b")] > weights[&PartitionKey::from("a")] / 2);
    }

    #[test]
    fn single_partition_owns_everything() {
        let mut ring = ConsistentHashMap::new();
        ring.put("only".into(), 7usize, 1);
        assert_eq!(*ring.get("anything").unwrap(), 7);
        assert_eq!(*ring.get("").unwrap(), 7);
        let weights = ring.get_weights();
        assert_eq!(weights[&PartitionKey::from("only")], 1u64 << 32);
    }

    #[test]
    fn empty_ring_returns_none() {
        let ring: ConsistentHashMap<usize> = ConsistentHashMap::new();
        assert!(ring.get("anything").is_none());
    }

    #[test]
    fn md5_hash_is_big_endian_leading_bytes() {
        // MD5("") = d41d8cd98f00b204e9800998ecf8427e
        assert_eq!(md5_hash32(""), 0xd41d8cd9);
    }
}
