//! Type-segmented component storage
//!
//! One column per component type, indexed by entity slot. Every access checks
//! the slot's generation against the caller's key, so a key that outlived its
//! entity reads nothing even after the slot is recycled.

use std::any::Any;
use std::marker::PhantomData;

use parking_lot::RwLock;

use crate::net::protocol::Timestamp;
use crate::world::component::{decode_component, encode_component, Component, FieldError, Visibility};
use crate::world::entity::EntityKey;

/// Result of applying a remote field update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Sender timestamp older than the last applied one; fields untouched
    Stale,
}

#[derive(Debug, Clone)]
pub struct Stored<T> {
    pub generation: u32,
    pub value: T,
    pub last_update: Timestamp,
}

pub struct ComponentColumn<T: Component> {
    slots: RwLock<Vec<Option<Stored<T>>>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Component> Default for ComponentColumn<T> {
    fn default() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            _marker: PhantomData,
        }
    }
}

impl<T: Component> ComponentColumn<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` in an empty slot; false if a live value is present
    pub fn insert(&self, key: EntityKey, value: T, stamp: Timestamp) -> bool {
        let mut slots = self.slots.write();
        let index = key.slot as usize;
        if slots.len() <= index {
            slots.resize_with(index + 1, || None);
        }
        if matches!(&slots[index], Some(s) if s.generation == key.generation) {
            return false;
        }
        slots[index] = Some(Stored {
            generation: key.generation,
            value,
            last_update: stamp,
        });
        true
    }

    pub fn get(&self, key: EntityKey) -> Option<T> {
        self.slots
            .read()
            .get(key.slot as usize)?
            .as_ref()
            .filter(|s| s.generation == key.generation)
            .map(|s| s.value.clone())
    }

    pub fn contains(&self, key: EntityKey) -> bool {
        self.last_update(key).is_some()
    }

    pub fn last_update(&self, key: EntityKey) -> Option<Timestamp> {
        self.slots
            .read()
            .get(key.slot as usize)?
            .as_ref()
            .filter(|s| s.generation == key.generation)
            .map(|s| s.last_update)
    }

    /// Mutate a live value in place and restamp it
    pub fn update<R>(&self, key: EntityKey, stamp: Timestamp, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut slots = self.slots.write();
        let stored = slots
            .get_mut(key.slot as usize)?
            .as_mut()
            .filter(|s| s.generation == key.generation)?;
        let result = f(&mut stored.value);
        stored.last_update = stamp;
        Some(result)
    }

    pub fn remove(&self, key: EntityKey) -> Option<T> {
        let mut slots = self.slots.write();
        let slot = slots.get_mut(key.slot as usize)?;
        if slot.as_ref().map(|s| s.generation) != Some(key.generation) {
            return None;
        }
        slot.take().map(|s| s.value)
    }

    /// Number of live values
    pub fn len(&self) -> usize {
        self.slots.read().iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Kind-erased view of a column for wire encode/decode
pub trait AnyColumn: Send + Sync {
    fn kind(&self) -> &'static str;

    fn visibility(&self) -> Visibility;

    fn contains_slot(&self, key: EntityKey) -> bool;

    fn encode_slot(&self, key: EntityKey) -> Option<Vec<String>>;

    fn clear_slot(&self, key: EntityKey) -> bool;

    /// Last-write-wins apply; inserts the component when absent
    fn apply_fields(&self, key: EntityKey, sent_at: Timestamp, fields: &[String]) -> Result<ApplyOutcome, FieldError>;

    /// Overwrite or insert from starting data, without staleness checks
    fn apply_defaults(&self, key: EntityKey, fields: &[String]) -> Result<(), FieldError>;

    fn as_any(&self) -> &dyn Any;
}

impl<T: Component> AnyColumn for ComponentColumn<T> {
    fn kind(&self) -> &'static str {
        T::KIND
    }

    fn visibility(&self) -> Visibility {
        T::VISIBILITY
    }

    fn contains_slot(&self, key: EntityKey) -> bool {
        self.contains(key)
    }

    fn encode_slot(&self, key: EntityKey) -> Option<Vec<String>> {
        let slots = self.slots.read();
        let stored = slots
            .get(key.slot as usize)?
            .as_ref()
            .filter(|s| s.generation == key.generation)?;
        Some(encode_component(&stored.value))
    }

    fn clear_slot(&self, key: EntityKey) -> bool {
        self.remove(key).is_some()
    }

    fn apply_fields(&self, key: EntityKey, sent_at: Timestamp, fields: &[String]) -> Result<ApplyOutcome, FieldError> {
        let mut slots = self.slots.write();
        let index = key.slot as usize;
        if slots.len() <= index {
            slots.resize_with(index + 1, || None);
        }

        match &mut slots[index] {
            Some(stored) if stored.generation == key.generation => {
                if sent_at < stored.last_update {
                    return Ok(ApplyOutcome::Stale);
                }
                stored.value = decode_component(&stored.value, fields)?;
                stored.last_update = sent_at;
            }
            slot => {
                let value = decode_component(&T::default(), fields)?;
                *slot = Some(Stored {
                    generation: key.generation,
                    value,
                    last_update: sent_at,
                });
            }
        }
        Ok(ApplyOutcome::Applied)
    }

    fn apply_defaults(&self, key: EntityKey, fields: &[String]) -> Result<(), FieldError> {
        let current = self.get(key).unwrap_or_default();
        let value = decode_component(&current, fields)?;
        let stamp = Timestamp::now();
        if self.update(key, stamp, |v| *v = value.clone()).is_none() {
            self.insert(key, value, stamp);
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::vec3::Vec3;
    use crate::world::component::Transform;

    fn key(slot: u32, generation: u32) -> EntityKey {
        EntityKey { slot, generation }
    }

    #[test]
    fn test_insert_get_remove() {
        let column = ComponentColumn::<Transform>::new();
        let k = key(3, 0);
        assert!(column.insert(k, Transform::at(Vec3::ONE), Timestamp(1)));
        assert!(!column.insert(k, Transform::default(), Timestamp(2)));

        assert_eq!(column.get(k).unwrap().position, Vec3::ONE);
        assert_eq!(column.len(), 1);
        assert!(column.remove(k).is_some());
        assert!(column.get(k).is_none());
    }

    #[test]
    fn test_generation_mismatch_reads_nothing() {
        let column = ComponentColumn::<Transform>::new();
        column.insert(key(0, 1), Transform::default(), Timestamp(1));

        assert!(column.get(key(0, 0)).is_none());
        assert!(column.remove(key(0, 0)).is_none());
        assert!(column.update(key(0, 2), Timestamp(5), |_| ()).is_none());
        assert!(column.get(key(0, 1)).is_some());
    }

    #[test]
    fn test_stale_update_rejected() {
        let column = ComponentColumn::<Transform>::new();
        let k = key(0, 0);
        let newer = encode_component(&Transform::at(Vec3::new(5.0, 0.0, 0.0)));
        let older = encode_component(&Transform::at(Vec3::new(1.0, 0.0, 0.0)));

        assert_eq!(column.apply_fields(k, Timestamp(200), &newer), Ok(ApplyOutcome::Applied));
        assert_eq!(column.apply_fields(k, Timestamp(100), &older), Ok(ApplyOutcome::Stale));
        assert_eq!(column.get(k).unwrap().position.x, 5.0);
        assert_eq!(column.last_update(k), Some(Timestamp(200)));
    }

    #[test]
    fn test_bad_fields_leave_value() {
        let column = ComponentColumn::<Transform>::new();
        let k = key(0, 0);
        column.insert(k, Transform::at(Vec3::ONE), Timestamp(1));

        let bad = vec!["###".to_string()];
        assert!(column.apply_fields(k, Timestamp(9), &bad).is_err());
        assert_eq!(column.get(k).unwrap().position, Vec3::ONE);
        assert_eq!(column.last_update(k), Some(Timestamp(1)));
    }

    #[test]
    fn test_type_erased_access() {
        let column: Box<dyn AnyColumn> = Box::new(ComponentColumn::<Transform>::new());
        let k = key(1, 0);
        assert_eq!(column.kind(), "Transform");
        assert!(column.encode_slot(k).is_none());

        let fields = encode_component(&Transform::at(Vec3::new(2.0, 2.0, 0.0)));
        column.apply_defaults(k, &fields).unwrap();
        assert_eq!(column.encode_slot(k), Some(fields));

        let typed = column.as_any().downcast_ref::<ComponentColumn<Transform>>().unwrap();
        assert_eq!(typed.get(k).unwrap().position.x, 2.0);
        assert!(column.clear_slot(k));
        assert!(!column.contains_slot(k));
    }
}
