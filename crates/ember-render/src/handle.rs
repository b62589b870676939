// SPDX-License-Identifier: CEPL-1.0
//! Generation-checked handles and the slot table that hands them out.
//!
//! A handle is `(index, generation)`. It stays valid while the slot at `index`
//! still carries the same generation; removal bumps the generation, so an old
//! handle can never reach whatever moves into the slot next.

use std::marker::PhantomData;

use crate::error::{RenderError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    pub index: u32,
    pub generation: u32,
}

impl ObjectId {
    /// Never handed out: live generations start at 1.
    pub const NULL: ObjectId = ObjectId {
        index: 0,
        generation: 0,
    };

    pub fn is_null(self) -> bool {
        self.generation == 0
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        ObjectId::NULL
    }
}

/// A strongly typed wrapper over [`ObjectId`].
pub trait TypedId: Copy + Eq + std::fmt::Debug {
    const KIND: &'static str;
    fn from_raw(raw: ObjectId) -> Self;
    fn raw(self) -> ObjectId;
}

/// Declares a `Copy` handle type for one resource kind.
#[macro_export]
macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name($crate::handle::ObjectId);

        impl $crate::handle::TypedId for $name {
            const KIND: &'static str = stringify!($name);
            fn from_raw(raw: $crate::handle::ObjectId) -> Self {
                $name(raw)
            }
            fn raw(self) -> $crate::handle::ObjectId {
                self.0
            }
        }
    };
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot arena keyed by `K`.
///
/// Owns its values. `remove` hands the value back so the caller can release
/// whatever GPU objects it wraps; the table itself never calls into a driver.
pub struct HandleTable<K: TypedId, T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    used: usize,
    retired: usize,
    _key: PhantomData<fn() -> K>,
}

impl<K: TypedId, T> Default for HandleTable<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: TypedId, T> HandleTable<K, T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            used: 0,
            retired: 0,
            _key: PhantomData,
        }
    }

    pub fn add(&mut self, value: T) -> K {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 1,
                    value: None,
                });
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        debug_assert!(slot.value.is_none());
        slot.value = Some(value);
        self.used += 1;

        K::from_raw(ObjectId {
            index,
            generation: slot.generation,
        })
    }

    fn live_slot(&self, id: ObjectId) -> Option<&Slot<T>> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation && s.value.is_some())
    }

    pub fn contains(&self, key: K) -> bool {
        self.live_slot(key.raw()).is_some()
    }

    pub fn get(&self, key: K) -> Result<&T> {
        self.live_slot(key.raw())
            .and_then(|s| s.value.as_ref())
            .ok_or(RenderError::NotFound)
    }

    pub fn get_mut(&mut self, key: K) -> Result<&mut T> {
        let id = key.raw();
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.value.as_mut())
            .ok_or(RenderError::NotFound)
    }

    /// Takes the value out and invalidates every copy of `key`.
    pub fn remove(&mut self, key: K) -> Result<T> {
        let id = key.raw();
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation && s.value.is_some())
            .ok_or(RenderError::InvalidHandle)?;

        let value = slot.value.take().ok_or(RenderError::InvalidHandle)?;
        self.used -= 1;

        match slot.generation.checked_add(1) {
            Some(next) => {
                slot.generation = next;
                self.free.push(id.index);
            }
            None => {
                // Reusing the slot would restart at a generation some stale
                // handle may still hold. Park it for good.
                tracing::debug!("{} slot {} retired after generation wrap", K::KIND, id.index);
                self.retired += 1;
            }
        }
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn retired_count(&self) -> usize {
        self.retired
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.value.as_ref().map(|v| {
                (
                    K::from_raw(ObjectId {
                        index: i as u32,
                        generation: s.generation,
                    }),
                    v,
                )
            })
        })
    }

    /// Removes every live value in index order. Used for orderly teardown.
    pub fn drain(&mut self) -> Vec<(K, T)> {
        let keys: Vec<K> = self.iter().map(|(k, _)| k).collect();
        keys.into_iter()
            .filter_map(|k| self.remove(k).ok().map(|v| (k, v)))
            .collect()
    }
}

impl<K: TypedId, T> Drop for HandleTable<K, T> {
    fn drop(&mut self) {
        if self.used != 0 {
            tracing::error!(
                "{} table dropped with {} live object(s); destroy them first",
                K::KIND,
                self.used
            );
            if !std::thread::panicking() {
                debug_assert!(self.used == 0, "{} table leaked objects", K::KIND);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::id_type!(TestId);

    #[derive(Debug, PartialEq)]
    struct Payload(u32);

    #[test]
    fn get_returns_what_was_added_until_removed() {
        let mut table = HandleTable::<TestId, Payload>::new();
        let a = table.add(Payload(7));
        let b = table.add(Payload(9));

        assert_eq!(table.get(a).unwrap(), &Payload(7));
        assert_eq!(table.get(b).unwrap(), &Payload(9));
        assert!(table.contains(a));

        assert_eq!(table.remove(a).unwrap(), Payload(7));
        assert_eq!(table.get(a), Err(RenderError::NotFound));
        assert!(!table.contains(a));
        assert_eq!(table.remove(b).unwrap(), Payload(9));
    }

    #[test]
    fn reused_slot_gets_a_new_generation() {
        let mut table = HandleTable::<TestId, Payload>::new();
        let a = table.add(Payload(1));
        table.remove(a).unwrap();
        let b = table.add(Payload(2));

        assert_eq!(a.raw().index, b.raw().index);
        assert_ne!(a, b);
        assert_eq!(b.raw().generation, a.raw().generation + 1);

        assert_eq!(table.get(a), Err(RenderError::NotFound));
        assert!(!table.contains(a));
        assert_eq!(table.get(b).unwrap(), &Payload(2));
        table.remove(b).unwrap();
    }

    #[test]
    fn double_remove_is_an_invalid_handle() {
        let mut table = HandleTable::<TestId, Payload>::new();
        let a = table.add(Payload(3));
        table.remove(a).unwrap();
        assert_eq!(table.remove(a), Err(RenderError::InvalidHandle));
        assert_eq!(table.remove(TestId::default()), Err(RenderError::InvalidHandle));
    }

    #[test]
    fn null_and_out_of_range_handles_are_not_found() {
        let mut table = HandleTable::<TestId, Payload>::new();
        let a = table.add(Payload(0));
        assert!(!table.contains(TestId::from_raw(ObjectId::NULL)));
        let far = TestId::from_raw(ObjectId {
            index: 40,
            generation: 1,
        });
        assert_eq!(table.get(far), Err(RenderError::NotFound));
        assert!(table.get_mut(far).is_err());
        table.remove(a).unwrap();
    }

    #[test]
    fn counts_stay_consistent() {
        let mut table = HandleTable::<TestId, Payload>::new();
        let ids: Vec<_> = (0..5).map(|i| table.add(Payload(i))).collect();
        table.remove(ids[1]).unwrap();
        table.remove(ids[3]).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.free_count(), 2);
        assert_eq!(table.len() + table.free_count() + table.retired_count(), 5);

        // LIFO free list: index 3 comes back first.
        let c = table.add(Payload(30));
        assert_eq!(c.raw().index, 3);

        let drained = table.drain();
        assert_eq!(drained.len(), 4);
        assert!(table.is_empty());
    }

    #[test]
    fn wrapped_slot_is_retired_instead_of_reused() {
        let mut table = HandleTable::<TestId, Payload>::new();
        let a = table.add(Payload(1));
        table.slots[0].generation = u32::MAX;
        let stale = TestId::from_raw(ObjectId {
            index: 0,
            generation: u32::MAX,
        });
        table.remove(stale).unwrap();

        assert_eq!(table.retired_count(), 1);
        assert_eq!(table.free_count(), 0);
        let b = table.add(Payload(2));
        assert_ne!(b.raw().index, 0);
        assert!(!table.contains(a));
        assert!(!table.contains(stale));
        table.remove(b).unwrap();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "leaked objects")]
    fn dropping_a_non_empty_table_is_reported() {
        let mut table = HandleTable::<TestId, Payload>::new();
        table.add(Payload(1));
    }
}
