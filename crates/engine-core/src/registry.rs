//! Reference registry: opaque handles for values owned by a session
//!
//! A `HandleTable` is a slot map. Each registration stamps the slot with a
//! generation drawn from a table-wide counter, so handles are never reused
//! and a stale handle is caught by generation mismatch.

use std::sync::Mutex;

use tether_protocol::Handle;

use crate::sync::MutexExt;

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Invalid handle {0}")]
    InvalidHandle(Handle),
    #[error("Handle {0} was already released")]
    AlreadyReleased(Handle),
    #[error("Registry is closed")]
    Closed,
    #[error("Registry is full")]
    Exhausted,
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

struct Table<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    next_generation: u32,
    live: usize,
    closed: bool,
}

/// Generation-tagged handle table guarded by one mutex.
///
/// The lock is held only for the lookup, insert or erase itself. Callers
/// that need to run script code with a value must copy what they need out
/// of `with` and call after it returns.
pub struct HandleTable<T> {
    name: &'static str,
    inner: Mutex<Table<T>>,
}

impl<T> HandleTable<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(Table {
                slots: Vec::new(),
                free: Vec::new(),
                next_generation: 1,
                live: 0,
                closed: false,
            }),
        }
    }

    /// Register a value under a fresh handle.
    ///
    /// Two registrations of equal values yield two handles.
    pub fn register(&self, value: T) -> Result<Handle, RegistryError> {
        let mut table = self.inner.lock_or_recover();
        if table.closed {
            return Err(RegistryError::Closed);
        }
        let generation = table.next_generation;
        table.next_generation = generation.checked_add(1).ok_or(RegistryError::Exhausted)?;

        let index = match table.free.pop() {
            Some(index) => {
                let slot = &mut table.slots[index as usize];
                slot.generation = generation;
                slot.value = Some(value);
                index
            }
            None => {
                let index = u32::try_from(table.slots.len()).map_err(|_| RegistryError::Exhausted)?;
                table.slots.push(Slot {
                    generation,
                    value: Some(value),
                });
                index
            }
        };
        table.live += 1;

        let handle = Handle::new(index, generation);
        tracing::trace!(registry = self.name, %handle, "Handle registered");
        Ok(handle)
    }

    /// Run `f` on the value behind `handle`
    pub fn with<R>(&self, handle: Handle, f: impl FnOnce(&T) -> R) -> Result<R, RegistryError> {
        let table = self.inner.lock_or_recover();
        match table.slots.get(handle.index() as usize) {
            Some(Slot {
                generation,
                value: Some(value),
            }) if *generation == handle.generation() => Ok(f(value)),
            _ => Err(RegistryError::InvalidHandle(handle)),
        }
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.with(handle, |_| ()).is_ok()
    }

    /// Remove the value behind `handle` and hand it back.
    ///
    /// A handle whose slot has since been reused by a newer registration
    /// counts as released, since generations are never handed out twice.
    pub fn release(&self, handle: Handle) -> Result<T, RegistryError> {
        let mut table = self.inner.lock_or_recover();
        let issued = handle.generation() != 0 && handle.generation() < table.next_generation;
        let Some(slot) = table.slots.get_mut(handle.index() as usize) else {
            return Err(RegistryError::InvalidHandle(handle));
        };

        if slot.generation == handle.generation() {
            let Some(value) = slot.value.take() else {
                return Err(RegistryError::AlreadyReleased(handle));
            };
            if !table.closed {
                table.free.push(handle.index());
            }
            table.live -= 1;
            tracing::trace!(registry = self.name, %handle, "Handle released");
            return Ok(value);
        }

        if issued && slot.generation > handle.generation() {
            Err(RegistryError::AlreadyReleased(handle))
        } else {
            Err(RegistryError::InvalidHandle(handle))
        }
    }

    /// Force-release every value and refuse further registrations
    pub fn close(&self) -> Vec<T> {
        let mut table = self.inner.lock_or_recover();
        table.closed = true;
        table.live = 0;
        table.free.clear();
        let drained: Vec<T> = table.slots.iter_mut().filter_map(|s| s.value.take()).collect();
        if !drained.is_empty() {
            tracing::debug!(registry = self.name, count = drained.len(), "Force-released handles");
        }
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock_or_recover().closed
    }

    /// Number of live handles
    pub fn len(&self) -> usize {
        self.inner.lock_or_recover().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live handles in slot order
    pub fn handles(&self) -> Vec<Handle> {
        let table = self.inner.lock_or_recover();
        table
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.value.is_some())
            .map(|(index, slot)| Handle::new(index as u32, slot.generation))
            .collect()
    }
}

impl<T: Clone> HandleTable<T> {
    /// Copy of the value behind `handle`
    pub fn resolve(&self, handle: Handle) -> Result<T, RegistryError> {
        self.with(handle, T::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_resolve_release() {
        let table = HandleTable::new("test");
        let h = table.register("cb".to_string()).unwrap();
        assert_eq!(table.resolve(h).unwrap(), "cb");
        assert!(table.contains(h));
        assert_eq!(table.release(h).unwrap(), "cb");
        assert_eq!(table.resolve(h), Err(RegistryError::InvalidHandle(h)));
        assert!(table.is_empty());
    }

    #[test]
    fn double_release_reports_already_released() {
        let table = HandleTable::new("test");
        let h = table.register(1).unwrap();
        assert!(table.release(h).is_ok());
        assert_eq!(table.release(h), Err(RegistryError::AlreadyReleased(h)));

        // Still reported after the slot is reused
        let reused = table.register(2).unwrap();
        assert_eq!(reused.index(), h.index());
        assert_eq!(table.release(h), Err(RegistryError::AlreadyReleased(h)));
        assert_eq!(table.resolve(reused).unwrap(), 2);
    }

    #[test]
    fn equal_values_get_distinct_handles() {
        let table = HandleTable::new("test");
        let a = table.register(7).unwrap();
        let b = table.register(7).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn handles_increase_and_never_repeat() {
        let table = HandleTable::new("test");
        let mut last = 0u64;
        for _ in 0..100 {
            let h = table.register(()).unwrap();
            assert!(h.to_raw() > last);
            last = h.to_raw();
            table.release(h).unwrap();
        }
    }

    #[test]
    fn unknown_handles_are_invalid() {
        let table: HandleTable<i32> = HandleTable::new("test");
        let forged = Handle::new(42, 9);
        assert_eq!(table.resolve(forged), Err(RegistryError::InvalidHandle(forged)));
        assert_eq!(table.release(forged), Err(RegistryError::InvalidHandle(forged)));
    }

    #[test]
    fn use_after_close() {
        let table = HandleTable::new("test");
        let a = table.register("a").unwrap();
        let b = table.register("b").unwrap();
        table.release(b).unwrap();

        let drained = table.close();
        assert_eq!(drained, vec!["a"]);
        assert!(table.is_closed());
        assert_eq!(table.resolve(a), Err(RegistryError::InvalidHandle(a)));
        assert!(!table.contains(a));
        assert_eq!(table.release(a), Err(RegistryError::AlreadyReleased(a)));
        assert_eq!(table.register("c"), Err(RegistryError::Closed));
    }

    #[test]
    fn live_handles_listed() {
        let table = HandleTable::new("test");
        let a = table.register(1).unwrap();
        let b = table.register(2).unwrap();
        let c = table.register(3).unwrap();
        table.release(b).unwrap();
        assert_eq!(table.handles(), vec![a, c]);
        assert_eq!(table.len(), 2);
    }
}
