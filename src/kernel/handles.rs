//! Handle tables
//!
//! A handle table maps small guest-visible integers to kernel objects.
//! Per-process, per-thread and kernel-owned tables coexist; bits 29..31
//! of a handle record which kind of table issued it. The low 16 bits are
//! the slot index and bits 16..29 carry an instance counter, so a handle
//! that survived a close cannot silently alias whatever reuses its slot.

use super::object::ObjectRef;

/// A guest-visible handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub u32);

impl Handle {
    pub const NULL: Handle = Handle(0);

    const INDEX_MASK: u32 = 0xffff;
    const INSTANCE_SHIFT: u32 = 16;
    const INSTANCE_MASK: u32 = 0x1fff;
    const THREAD_BIT: u32 = 1 << 30;
    const KERNEL_BIT: u32 = 1 << 29;

    fn encode(owner: HandleOwner, index: u32, instance: u32) -> Handle {
        let mut raw = (index & Self::INDEX_MASK)
            | ((instance & Self::INSTANCE_MASK) << Self::INSTANCE_SHIFT);
        match owner {
            HandleOwner::Process => {}
            HandleOwner::Thread => raw |= Self::THREAD_BIT,
            HandleOwner::Kernel => raw |= Self::KERNEL_BIT,
        }
        Handle(raw)
    }

    pub fn index(self) -> u32 {
        self.0 & Self::INDEX_MASK
    }

    pub fn instance(self) -> u32 {
        (self.0 >> Self::INSTANCE_SHIFT) & Self::INSTANCE_MASK
    }

    /// Which table kind issued this handle.
    pub fn owner(self) -> HandleOwner {
        if self.0 & Self::THREAD_BIT != 0 {
            HandleOwner::Thread
        } else if self.0 & Self::KERNEL_BIT != 0 {
            HandleOwner::Kernel
        } else {
            HandleOwner::Process
        }
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handle:{:#010x}", self.0)
    }
}

/// Which scope a table serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOwner {
    Process,
    Thread,
    /// Host-issued handles held by the kernel itself
    Kernel,
}

#[derive(Debug, Clone)]
struct Entry {
    instance: u32,
    object: ObjectRef,
}

/// One handle table.
#[derive(Debug)]
pub struct HandleTable {
    owner: HandleOwner,
    entries: Vec<Option<Entry>>,
    next_instance: u32,
    last: Handle,
}

impl HandleTable {
    pub fn new(owner: HandleOwner) -> Self {
        Self {
            owner,
            entries: Vec::new(),
            // Instance 0 is reserved so no valid handle encodes to NULL.
            next_instance: 1,
            last: Handle::NULL,
        }
    }

    /// Add an object, returning its new handle.
    pub fn add(&mut self, object: ObjectRef) -> Handle {
        let instance = self.next_instance;
        self.next_instance = if self.next_instance >= Handle::INSTANCE_MASK {
            1
        } else {
            self.next_instance + 1
        };

        let entry = Entry { instance, object };

        let index = match self.entries.iter().position(|slot| slot.is_none()) {
            Some(free) => {
                self.entries[free] = Some(entry);
                free
            }
            None => {
                self.entries.push(Some(entry));
                self.entries.len() - 1
            }
        };

        let handle = Handle::encode(self.owner, index as u32, instance);
        self.last = handle;
        handle
    }

    fn slot(&self, handle: Handle) -> Option<&Entry> {
        if handle.owner() != self.owner {
            return None;
        }

        self.entries
            .get(handle.index() as usize)?
            .as_ref()
            .filter(|entry| entry.instance == handle.instance())
    }

    /// Resolve a handle to its object reference.
    pub fn get(&self, handle: Handle) -> Option<ObjectRef> {
        self.slot(handle).map(|entry| entry.object)
    }

    /// Close a handle. Returns the reference it held.
    pub fn remove(&mut self, handle: Handle) -> Option<ObjectRef> {
        self.slot(handle)?;
        self.entries[handle.index() as usize]
            .take()
            .map(|entry| entry.object)
    }

    /// The handle most recently issued by this table.
    pub fn last_handle(&self) -> Handle {
        self.last
    }

    /// Number of live entries.
    pub fn count(&self) -> usize {
        self.entries.iter().filter(|slot| slot.is_some()).count()
    }

    /// Iterate over live object references.
    pub fn iter(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.entries
            .iter()
            .filter_map(|slot| slot.as_ref().map(|entry| entry.object))
    }

    /// Remove every entry matching `object`, returning how many were
    /// closed.
    pub fn remove_refs(&mut self, object: ObjectRef) -> usize {
        let mut removed = 0;
        for slot in self.entries.iter_mut() {
            if slot.as_ref().is_some_and(|entry| entry.object == object) {
                *slot = None;
                removed += 1;
            }
        }
        removed
    }
}
