//! Generation-checked handle table for engine callbacks.
//!
//! Engine callbacks capture a [`ContextHandle`] instead of a reference to the object
//! they call back into. When a callback fires, the handle is resolved through the
//! [`ContextManager`]; if the object has since been unregistered or dropped, the
//! lookup yields `None` and the callback is ignored. Slots are reused, but every reuse
//! bumps the slot's generation, so a stale handle never resolves to a newer object.

use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

/// A handle to an object registered with a [`ContextManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle {
    index: u32,
    generation: u32,
}

impl ContextHandle {
    /// Packs the handle into a single integer, unique among live handles.
    pub fn as_u64(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }
}

impl fmt::Display for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx:{}.{}", self.index, self.generation)
    }
}

type AnyObject = dyn Any + Send + Sync;

struct Slot {
    generation: u32,
    occupied: bool,
    object: Option<Weak<AnyObject>>,
}

#[derive(Default)]
struct Table {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Table {
    fn slot(&self, handle: ContextHandle) -> Option<&Slot> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.occupied && slot.generation == handle.generation)
    }

    fn slot_mut(&mut self, handle: ContextHandle) -> Option<&mut Slot> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.occupied && slot.generation == handle.generation)
    }
}

/// Table of objects reachable from engine callbacks.
#[derive(Default)]
pub struct ContextManager {
    table: Mutex<Table>,
}

impl ContextManager {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide table.
    pub fn shared() -> &'static ContextManager {
        static SHARED: OnceLock<ContextManager> = OnceLock::new();
        SHARED.get_or_init(ContextManager::new)
    }

    /// Reserves a handle before its object exists.
    ///
    /// Until [`bind`](Self::bind) is called the handle resolves to `None`.
    pub fn reserve(&self) -> ContextHandle {
        let mut table = self.table.lock();
        if let Some(index) = table.free.pop() {
            let slot = &mut table.slots[index as usize];
            slot.occupied = true;
            slot.object = None;
            return ContextHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = table.slots.len() as u32;
        table.slots.push(Slot {
            generation: 0,
            occupied: true,
            object: None,
        });
        ContextHandle {
            index,
            generation: 0,
        }
    }

    /// Attaches an object to a reserved handle. Returns false for a stale handle.
    pub fn bind(&self, handle: ContextHandle, object: Weak<AnyObject>) -> bool {
        match self.table.lock().slot_mut(handle) {
            Some(slot) => {
                slot.object = Some(object);
                true
            }
            None => false,
        }
    }

    /// Reserves a handle and binds `object` to it.
    pub fn register(&self, object: Weak<AnyObject>) -> ContextHandle {
        let handle = self.reserve();
        self.bind(handle, object);
        handle
    }

    /// Resolves a handle to its object, if it is still registered, alive and a `T`.
    pub fn get<T: Any + Send + Sync>(&self, handle: ContextHandle) -> Option<Arc<T>> {
        let weak = self.table.lock().slot(handle)?.object.clone()?;
        weak.upgrade()?.downcast::<T>().ok()
    }

    /// Unregisters a handle. Returns false if it was already stale.
    pub fn unregister(&self, handle: ContextHandle) -> bool {
        let mut table = self.table.lock();
        let Some(slot) = table.slot_mut(handle) else {
            return false;
        };
        slot.occupied = false;
        slot.object = None;
        slot.generation = slot.generation.wrapping_add(1);
        table.free.push(handle.index);
        true
    }

    /// Number of registered handles.
    pub fn len(&self) -> usize {
        let table = self.table.lock();
        table.slots.len() - table.free.len()
    }

    /// Returns true if no handles are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ContextManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextManager")
            .field("registered", &self.len())
            .finish()
    }
}
