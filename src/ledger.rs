use std::collections::HashSet;

use crate::formats::Item;

/// Set of stable ids already counted for a topic. Never shrinks.
#[derive(Debug, Clone, Default)]
pub struct DedupLedger {
    seen: HashSet<String>,
}

impl DedupLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Returns `true` when `id` was not recorded before. Recording twice is a no-op.
    pub fn record(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.to_owned())
    }

    /// Unions the ids of a loaded artifact into the ledger. Items without an
    /// id are ignored. Returns how many ids were new.
    pub fn seed_from(&mut self, items: &[Item]) -> usize {
        items
            .iter()
            .filter(|item| !item.stable_id.is_empty())
            .filter(|item| self.record(&item.stable_id))
            .count()
    }

    /// Records `item` and appends it to `collection` in one step, or leaves
    /// both untouched when the id was already seen.
    pub fn accept(&mut self, item: Item, collection: &mut Vec<Item>) -> bool {
        if item.stable_id.is_empty() || !self.record(&item.stable_id) {
            return false;
        }
        collection.push(item);
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.seen.iter().map(String::as_str)
    }
}
