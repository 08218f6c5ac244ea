//! Consistent hash ring for sharding blocks across block stores
//!
//! Each member is placed on the ring at the BLAKE3 hex digest of its
//! identifier. A block belongs to the first member whose position is
//! lexicographically greater than or equal to the block's hex hash, wrapping
//! around to the lowest position. Both sides are fixed-length lowercase hex,
//! so string order is numeric order.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use crate::hash::{BlockHash, hash_member};

#[derive(Debug, Clone, Default)]
pub struct ConsistentHashRing {
    /// ring position -> member id
    positions: BTreeMap<String, String>,
}

impl ConsistentHashRing {
    /// Build a ring from live members.
    #[must_use]
    pub fn new<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ring = Self::default();
        for member in members {
            ring.insert_server(member);
        }
        ring
    }

    /// Build a ring from every configured member, then drop the ones that
    /// are down.
    #[must_use]
    pub fn with_down(members: &[String], down: &[String]) -> Self {
        let mut ring = Self::new(members.iter().cloned());
        for member in down {
            ring.remove_server(member);
        }
        ring
    }

    pub fn insert_server(&mut self, member: impl Into<String>) {
        let member = member.into();
        self.positions.insert(hash_member(&member), member);
    }

    pub fn remove_server(&mut self, member: &str) {
        self.positions.remove(&hash_member(member));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// The member responsible for `hash`, or `None` on an empty ring.
    #[must_use]
    pub fn get_responsible_server(&self, hash: &BlockHash) -> Option<&str> {
        self.positions
            .range::<str, _>((Bound::Included(hash.as_str()), Bound::Unbounded))
            .next()
            .or_else(|| self.positions.iter().next())
            .map(|(_, member)| member.as_str())
    }

    /// Map each hash to its responsible member. `None` on an empty ring.
    #[must_use]
    pub fn output_map(&self, hashes: &[BlockHash]) -> Option<HashMap<BlockHash, String>> {
        hashes
            .iter()
            .map(|h| {
                self.get_responsible_server(h)
                    .map(|member| (h.clone(), member.to_string()))
            })
            .collect()
    }
}
