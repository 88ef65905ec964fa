//! The process-wide scheduler registry.
//!
//! A grow-only array of scheduler handles, indexed by scheduler id. The
//! reader path is a shared-lock bounds check plus a load; the array
//! doubles under the write lock whenever a higher id first appears and
//! never shrinks. Dispatcher contexts use it to route admitted requests
//! without owning the schedulers.

use parking_lot::RwLock;

use crate::sched::eventloop::SchedulerHandle;
use crate::sched::SchedId;

/// Registered scheduler handles, indexed by scheduler id.
pub struct Registry {
    slots: RwLock<Vec<Option<SchedulerHandle>>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Registry {
        Registry {
            slots: RwLock::new(Vec::new()),
        }
    }

    /// Register a handle under its scheduler id.
    pub fn insert(&self, handle: SchedulerHandle) {
        let id = handle.id() as usize;
        let mut slots = self.slots.write();
        if slots.len() <= id {
            let mut cap = slots.len().max(4);
            while cap <= id {
                cap *= 2;
            }
            slots.resize_with(cap, || None);
        }
        slots[id] = Some(handle);
    }

    /// The handle registered under `id`.
    pub fn get(&self, id: SchedId) -> Option<SchedulerHandle> {
        let slots = self.slots.read();
        slots.get(id as usize).and_then(|slot| slot.clone())
    }

    /// Every registered handle, in id order.
    pub fn handles(&self) -> Vec<SchedulerHandle> {
        self.slots.read().iter().flatten().cloned().collect()
    }

    /// Number of registered schedulers.
    pub fn len(&self) -> usize {
        self.slots.read().iter().filter(|s| s.is_some()).count()
    }

    /// Whether no scheduler is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registered handle, letting the schedulers drain.
    pub fn clear(&self) {
        self.slots.write().clear();
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("len", &self.len()).finish()
    }
}
