//! Kernel object headers
//!
//! Every nameable, shareable kernel entity carries the same header: a
//! unique id, an optional name, an owner kind and an access scope. The set
//! of kinds is closed; cross-references between objects are typed arena
//! ids, and handle tables hold non-owning [`ObjectRef`]s into the arenas.

use super::chunk::ChunkId;
use super::ipc::{ServerId, SessionId};
use super::mutex::MutexId;
use super::process::ProcessId;
use super::property::PropertyId;
use super::semaphore::SemaphoreId;
use super::thread::ThreadId;

/// Who owns an object's lifetime (and which id base it draws from).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerKind {
    Process,
    Thread,
    Kernel,
}

/// Whether the object's name is visible beyond its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Local,
    Global,
}

/// The closed set of kernel object kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Process,
    Thread,
    Chunk,
    Mutex,
    Semaphore,
    Property,
    Session,
    Server,
    Timer,
    Message,
}

/// Common header embedded in every kernel object.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub id: u32,
    pub name: Option<String>,
    pub owner: OwnerKind,
    pub access: Access,
}

impl ObjectInfo {
    pub fn new(id: u32, name: Option<String>, owner: OwnerKind, access: Access) -> Self {
        Self {
            id,
            name,
            owner,
            access,
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }
}

/// A typed, non-owning reference to an object in one of the kernel's
/// arenas. This is what handle tables store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectRef {
    Process(ProcessId),
    Thread(ThreadId),
    Chunk(ChunkId),
    Mutex(MutexId),
    Semaphore(SemaphoreId),
    Property(PropertyId),
    Session(SessionId),
    Server(ServerId),
}

impl ObjectRef {
    pub fn kind(&self) -> ObjectKind {
        match self {
            ObjectRef::Process(_) => ObjectKind::Process,
            ObjectRef::Thread(_) => ObjectKind::Thread,
            ObjectRef::Chunk(_) => ObjectKind::Chunk,
            ObjectRef::Mutex(_) => ObjectKind::Mutex,
            ObjectRef::Semaphore(_) => ObjectKind::Semaphore,
            ObjectRef::Property(_) => ObjectKind::Property,
            ObjectRef::Session(_) => ObjectKind::Session,
            ObjectRef::Server(_) => ObjectKind::Server,
        }
    }
}

/// Allocates object ids, partitioned by owner kind so a guest can tell a
/// process-owned basis from a kernel-owned one.
#[derive(Debug)]
pub struct IdAllocator {
    next_kernel: u32,
    next_process: u32,
    next_thread: u32,
}

pub const ID_BASE_KERNEL: u32 = 0x1000;
pub const ID_BASE_PROCESS: u32 = 0x8000;
pub const ID_BASE_THREAD: u32 = 0x20000;

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next_kernel: ID_BASE_KERNEL,
            next_process: ID_BASE_PROCESS,
            next_thread: ID_BASE_THREAD,
        }
    }

    /// The id base for objects owned by `owner`.
    pub fn base(&self, owner: OwnerKind) -> u32 {
        match owner {
            OwnerKind::Kernel => ID_BASE_KERNEL,
            OwnerKind::Process => ID_BASE_PROCESS,
            OwnerKind::Thread => ID_BASE_THREAD,
        }
    }

    pub fn next(&mut self, owner: OwnerKind) -> u32 {
        let slot = match owner {
            OwnerKind::Kernel => &mut self.next_kernel,
            OwnerKind::Process => &mut self.next_process,
            OwnerKind::Thread => &mut self.next_thread,
        };
        let id = *slot;
        *slot += 1;
        id
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_partitioned_by_owner() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.next(OwnerKind::Kernel), ID_BASE_KERNEL);
        assert_eq!(ids.next(OwnerKind::Process), ID_BASE_PROCESS);
        assert_eq!(ids.next(OwnerKind::Thread), ID_BASE_THREAD);
        assert_eq!(ids.next(OwnerKind::Kernel), ID_BASE_KERNEL + 1);
    }

    #[test]
    fn test_object_ref_kind() {
        let r = ObjectRef::Mutex(MutexId(3));
        assert_eq!(r.kind(), ObjectKind::Mutex);
    }
}
