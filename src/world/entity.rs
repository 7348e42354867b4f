//! Entity identity and slot allocation
//!
//! Entities are addressed on the wire by a 128-bit id. Internally each live
//! entity owns a slot in the component columns; a slot's generation is bumped
//! when it is released so stale keys never read a recycled slot.

use rustc_hash::FxHashMap;
use uuid::Uuid;

pub type EntityId = Uuid;

/// Slot index plus the generation it was allocated under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub slot: u32,
    pub generation: u32,
}

#[derive(Debug, Default)]
pub struct EntityArena {
    generations: Vec<u32>,
    free: Vec<u32>,
    index: FxHashMap<EntityId, EntityKey>,
}

impl EntityArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a slot for `id`; `None` if the id is already live
    pub fn allocate(&mut self, id: EntityId) -> Option<EntityKey> {
        if self.index.contains_key(&id) {
            return None;
        }

        let key = match self.free.pop() {
            Some(slot) => EntityKey {
                slot,
                generation: self.generations[slot as usize],
            },
            None => {
                let slot = self.generations.len() as u32;
                self.generations.push(0);
                EntityKey { slot, generation: 0 }
            }
        };

        self.index.insert(id, key);
        Some(key)
    }

    pub fn resolve(&self, id: EntityId) -> Option<EntityKey> {
        self.index.get(&id).copied()
    }

    /// Release `id`'s slot and invalidate its key
    pub fn release(&mut self, id: EntityId) -> Option<EntityKey> {
        let key = self.index.remove(&id)?;
        let generation = &mut self.generations[key.slot as usize];
        *generation = generation.wrapping_add(1);
        self.free.push(key.slot);
        Some(key)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.index.contains_key(&id)
    }

    /// True while `key` still names a live allocation
    pub fn is_current(&self, key: EntityKey) -> bool {
        self.generations
            .get(key.slot as usize)
            .map(|g| *g == key.generation)
            .unwrap_or(false)
    }

    pub fn ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.index.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Number of slots ever allocated (column length needed)
    pub fn capacity(&self) -> usize {
        self.generations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_resolve() {
        let mut arena = EntityArena::new();
        let id = Uuid::new_v4();
        let key = arena.allocate(id).unwrap();

        assert_eq!(arena.resolve(id), Some(key));
        assert!(arena.contains(id));
        assert_eq!(arena.len(), 1);
        assert!(arena.allocate(id).is_none());
    }

    #[test]
    fn test_release_bumps_generation_and_reuses_slot() {
        let mut arena = EntityArena::new();
        let first = Uuid::new_v4();
        let old = arena.allocate(first).unwrap();
        arena.release(first).unwrap();

        assert!(!arena.is_current(old));
        assert!(arena.resolve(first).is_none());

        let second = Uuid::new_v4();
        let new = arena.allocate(second).unwrap();
        assert_eq!(new.slot, old.slot);
        assert_ne!(new.generation, old.generation);
        assert!(arena.is_current(new));
        assert!(!arena.is_current(old));
    }

    #[test]
    fn test_release_unknown() {
        let mut arena = EntityArena::new();
        assert!(arena.release(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_capacity_grows_only_when_free_list_empty() {
        let mut arena = EntityArena::new();
        let ids: Vec<_> = (0..4).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            arena.allocate(*id);
        }
        arena.release(ids[1]);
        arena.allocate(Uuid::new_v4());
        assert_eq!(arena.capacity(), 4);
        assert_eq!(arena.len(), 4);
    }
}
