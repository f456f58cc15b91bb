//! Card table
//!
//! Fixed-size regions of the slot space whose mark bit says "a cell in this
//! card may hold a cross-generation pointer". The mutator's barrier stores
//! with release ordering; the collector's reads acquire, so a barrier store
//! is visible to any subsequent collection.

use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::RwLock;

/// Slots covered by one card.
pub const SLOTS_PER_CARD: u32 = 64;

/// The card table.
pub struct CardTable {
    cards: RwLock<Vec<AtomicU8>>,
}

impl CardTable {
    /// Empty table; grows as the heap does.
    pub fn new() -> Self {
        CardTable { cards: RwLock::new(Vec::new()) }
    }

    fn card_index(slot: u32) -> usize {
        (slot / SLOTS_PER_CARD) as usize
    }

    /// Grow to cover `slot`.
    pub fn ensure(&self, slot: u32) {
        let needed = Self::card_index(slot) + 1;
        let cards = self.cards.read();
        if cards.len() >= needed {
            return;
        }
        drop(cards);
        let mut cards = self.cards.write();
        while cards.len() < needed {
            cards.push(AtomicU8::new(0));
        }
    }

    /// Mark the card containing `slot`.
    pub fn mark(&self, slot: u32) {
        self.ensure(slot);
        let cards = self.cards.read();
        cards[Self::card_index(slot)].store(1, Ordering::Release);
    }

    /// Whether the card containing `slot` is marked.
    pub fn is_marked(&self, slot: u32) -> bool {
        let cards = self.cards.read();
        cards
            .get(Self::card_index(slot))
            .map(|c| c.load(Ordering::Acquire) == 1)
            .unwrap_or(false)
    }

    /// Clear the card containing `slot`.
    pub fn clear(&self, slot: u32) {
        let cards = self.cards.read();
        if let Some(c) = cards.get(Self::card_index(slot)) {
            c.store(0, Ordering::Release);
        }
    }

    /// Clear every card.
    pub fn clear_all(&self) {
        let cards = self.cards.read();
        for c in cards.iter() {
            c.store(0, Ordering::Release);
        }
    }

    /// Number of cards.
    pub fn card_count(&self) -> usize {
        self.cards.read().len()
    }

    /// Slot indices of marked cards' first slots (iteration base).
    pub fn marked_cards(&self) -> Vec<u32> {
        let cards = self.cards.read();
        cards
            .iter()
            .enumerate()
            .filter(|(_, c)| c.load(Ordering::Acquire) == 1)
            .map(|(i, _)| i as u32 * SLOTS_PER_CARD)
            .collect()
    }
}

impl Default for CardTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_check() {
        let t = CardTable::new();
        assert!(!t.is_marked(10));
        t.mark(10);
        assert!(t.is_marked(10));
        // Same card covers neighbors
        assert!(t.is_marked(11));
        // Different card unaffected
        assert!(!t.is_marked(SLOTS_PER_CARD + 1));
    }

    #[test]
    fn test_clear() {
        let t = CardTable::new();
        t.mark(5);
        t.clear(5);
        assert!(!t.is_marked(5));
    }

    #[test]
    fn test_clear_all_and_marked_cards() {
        let t = CardTable::new();
        t.mark(0);
        t.mark(SLOTS_PER_CARD * 3);
        let marked = t.marked_cards();
        assert_eq!(marked.len(), 2);
        t.clear_all();
        assert!(t.marked_cards().is_empty());
    }
}
