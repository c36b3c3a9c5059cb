//! Last-writer-wins state map.
//!
//! Entries carry `(id, value, clock, peer_id)`. Higher clock wins; equal
//! clocks break to the lexicographically larger peer id. Merge is
//! commutative, associative, and idempotent, so any sync order converges.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LwwEntry {
    pub id: String,
    pub value: Value,
    pub clock: u64,
    pub peer_id: String,
}

/// True when `incoming` beats `current`.
fn wins(incoming: &LwwEntry, current: &LwwEntry) -> bool {
    incoming.clock > current.clock
        || (incoming.clock == current.clock && incoming.peer_id > current.peer_id)
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LwwMap {
    entries: BTreeMap<String, LwwEntry>,
}

impl LwwMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local write at `clock` from `peer_id`. Applied through the same merge
    /// rule, so a stale local write loses.
    pub fn set(&mut self, id: &str, value: Value, clock: u64, peer_id: &str) {
        self.apply(LwwEntry {
            id: id.to_string(),
            value,
            clock,
            peer_id: peer_id.to_string(),
        });
    }

    /// Merges one entry; keeps the winner.
    pub fn apply(&mut self, incoming: LwwEntry) {
        match self.entries.get(&incoming.id) {
            Some(current) if !wins(&incoming, current) => {}
            _ => {
                self.entries.insert(incoming.id.clone(), incoming);
            }
        }
    }

    /// Merges every entry of `other` into `self`.
    pub fn merge(&mut self, other: &LwwMap) {
        for entry in other.entries.values() {
            self.apply(entry.clone());
        }
    }

    pub fn get(&self, id: &str) -> Option<&LwwEntry> {
        self.entries.get(id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &LwwEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(id: &str, value: &str, clock: u64, peer: &str) -> LwwEntry {
        LwwEntry {
            id: id.to_string(),
            value: json!(value),
            clock,
            peer_id: peer.to_string(),
        }
    }

    fn map_of(entries: &[LwwEntry]) -> LwwMap {
        let mut map = LwwMap::new();
        for e in entries {
            map.apply(e.clone());
        }
        map
    }

    #[test]
    fn higher_clock_wins() {
        let mut map = LwwMap::new();
        map.apply(entry("k", "old", 1, "a"));
        map.apply(entry("k", "new", 2, "a"));
        assert_eq!(map.get("k").unwrap().value, "new");
        map.apply(entry("k", "stale", 1, "z"));
        assert_eq!(map.get("k").unwrap().value, "new");
    }

    #[test]
    fn equal_clocks_break_to_larger_peer_id() {
        // Peers a and b write concurrently at clock 5; both converge on b.
        let mut on_a = map_of(&[entry("k", "α", 5, "a")]);
        let mut on_b = map_of(&[entry("k", "β", 5, "b")]);
        let from_a = on_a.clone();
        on_a.merge(&on_b);
        on_b.merge(&from_a);
        assert_eq!(on_a.get("k").unwrap().value, "β");
        assert_eq!(on_a.get("k"), on_b.get("k"));
        assert_eq!(on_a.get("k").unwrap().peer_id, "b");
        assert_eq!(on_a.get("k").unwrap().clock, 5);
    }

    #[test]
    fn merge_is_commutative() {
        let a = map_of(&[entry("x", "1", 3, "a"), entry("y", "2", 1, "a")]);
        let b = map_of(&[entry("x", "9", 2, "b"), entry("z", "3", 4, "b")]);
        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(
            ab.entries().collect::<Vec<_>>(),
            ba.entries().collect::<Vec<_>>()
        );
    }

    #[test]
    fn merge_is_associative() {
        let a = map_of(&[entry("k", "a", 1, "a")]);
        let b = map_of(&[entry("k", "b", 2, "b")]);
        let c = map_of(&[entry("k", "c", 2, "c")]);

        let mut left = a.clone();
        left.merge(&b);
        left.merge(&c);

        let mut bc = b.clone();
        bc.merge(&c);
        let mut right = a.clone();
        right.merge(&bc);

        assert_eq!(
            left.entries().collect::<Vec<_>>(),
            right.entries().collect::<Vec<_>>()
        );
    }

    #[test]
    fn merge_is_idempotent() {
        let a = map_of(&[entry("k", "v", 7, "a")]);
        let mut twice = a.clone();
        twice.merge(&a);
        assert_eq!(
            twice.entries().collect::<Vec<_>>(),
            a.entries().collect::<Vec<_>>()
        );
    }
}
