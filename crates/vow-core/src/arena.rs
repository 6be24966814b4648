//! Generation-checked slot arenas.
//!
//! Every pooled entity (promise nodes, pass-through edges, progress
//! subscriptions) lives in a slot arena. Recycling pushes the slot index onto
//! a free list and bumps the slot generation, so a stale key can never alias
//! the next occupant. With pooling disabled, freed slots are simply never
//! reused; external behavior is identical.

/// Index + generation key into one arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

pub(crate) struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    pooling: bool,
}

impl<T> Arena<T> {
    pub fn new(pooling: bool) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            pooling,
        }
    }

    pub fn insert(&mut self, value: T) -> Key {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.value.is_none(), "free list pointed at a live slot");
            slot.value = Some(value);
            return Key {
                index,
                generation: slot.generation,
            };
        }
        let index = u32::try_from(self.slots.len()).expect("arena exceeded u32 slots");
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Key {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, key: Key) -> Option<&T> {
        let slot = self.slots.get(key.index as usize)?;
        (slot.generation == key.generation)
            .then_some(slot.value.as_ref())
            .flatten()
    }

    pub fn get_mut(&mut self, key: Key) -> Option<&mut T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        (slot.generation == key.generation)
            .then_some(slot.value.as_mut())
            .flatten()
    }

    pub fn contains(&self, key: Key) -> bool {
        self.get(key).is_some()
    }

    /// Remove the value and recycle the slot. The generation bump makes every
    /// outstanding key for this slot stale, which is the double-release guard.
    pub fn remove(&mut self, key: Key) -> Option<T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        if self.pooling {
            self.free.push(key.index);
        }
        Some(value)
    }

    /// Drop the free list. Slot storage stays owned by the arena; future
    /// removals start a fresh pool.
    pub fn clear_pool(&mut self) {
        self.free.clear();
    }

    /// Number of live values.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.value.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let mut arena = Arena::new(true);
        let k = arena.insert(7);
        assert_eq!(arena.get(k), Some(&7));
        assert_eq!(arena.remove(k), Some(7));
        assert_eq!(arena.get(k), None);
        assert_eq!(arena.remove(k), None);
    }

    #[test]
    fn test_slot_reuse_bumps_generation() {
        let mut arena = Arena::new(true);
        let k1 = arena.insert("a");
        arena.remove(k1);
        let k2 = arena.insert("b");
        assert_eq!(k1.index, k2.index);
        assert_ne!(k1.generation, k2.generation);
        // Stale key must not observe the new occupant.
        assert_eq!(arena.get(k1), None);
        assert_eq!(arena.get(k2), Some(&"b"));
    }

    #[test]
    fn test_pooling_disabled_never_reuses() {
        let mut arena = Arena::new(false);
        let k1 = arena.insert(1);
        arena.remove(k1);
        let k2 = arena.insert(2);
        assert_ne!(k1.index, k2.index);
    }

    #[test]
    fn test_clear_pool() {
        let mut arena = Arena::new(true);
        let k = arena.insert(1);
        arena.remove(k);
        arena.clear_pool();
        let k2 = arena.insert(2);
        assert_ne!(k.index, k2.index);
    }

    #[test]
    fn test_len_counts_live_only() {
        let mut arena = Arena::new(true);
        let a = arena.insert(1);
        let _b = arena.insert(2);
        arena.remove(a);
        assert_eq!(arena.len(), 1);
    }
}
