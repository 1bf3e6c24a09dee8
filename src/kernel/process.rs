//! Processes
//!
//! A process owns its threads, a process-scoped handle table, a code
//! segment and the identity carried over from its image (UID triplet,
//! command line). Processes are created suspended; the first thread only
//! runs once `run_process` is called. A process dies when its last thread
//! exits, regardless of how many handles to it remain open.

use super::chunk::ChunkId;
use super::handles::{HandleOwner, HandleTable};
use super::object::ObjectInfo;
use super::thread::ThreadId;
use crate::loader::UidTriplet;

/// Identifier into the kernel's process arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub usize);

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "process:{}", self.0)
    }
}

/// Symbian process priorities (absolute scheduler values).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessPriority {
    Low,
    Background,
    #[default]
    Foreground,
    High,
    WindowServer,
    FileServer,
    RealTimeServer,
    Supervisor,
}

impl ProcessPriority {
    pub fn value(self) -> i32 {
        match self {
            ProcessPriority::Low => 150,
            ProcessPriority::Background => 250,
            ProcessPriority::Foreground => 350,
            ProcessPriority::High => 450,
            ProcessPriority::WindowServer => 650,
            ProcessPriority::FileServer => 750,
            ProcessPriority::RealTimeServer => 850,
            ProcessPriority::Supervisor => 950,
        }
    }
}

/// Process lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Created suspended; no thread has run
    Created,
    Running,
    /// Last thread exited
    Dead,
}

/// A guest process.
#[derive(Debug)]
pub struct Process {
    pub info: ObjectInfo,
    pub state: ProcessState,

    pub uids: UidTriplet,
    pub cmd_line: String,
    pub priority: ProcessPriority,

    pub threads: Vec<ThreadId>,
    pub handles: HandleTable,

    /// Code segment backing the executable image.
    pub code_chunk: Option<ChunkId>,
    pub entry_point: u32,

    pub exit_reason: i32,
}

impl Process {
    pub fn new(
        info: ObjectInfo,
        uids: UidTriplet,
        cmd_line: String,
        entry_point: u32,
    ) -> Self {
        Self {
            info,
            state: ProcessState::Created,
            uids,
            cmd_line,
            priority: ProcessPriority::default(),
            threads: Vec::new(),
            handles: HandleTable::new(HandleOwner::Process),
            code_chunk: None,
            entry_point,
            exit_reason: 0,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.state == ProcessState::Dead
    }

    pub fn primary_thread(&self) -> Option<ThreadId> {
        self.threads.first().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::object::{Access, OwnerKind};

    #[test]
    fn test_process_starts_suspended() {
        let p = Process::new(
            ObjectInfo::new(0x8000, Some("app.exe".into()), OwnerKind::Kernel, Access::Global),
            UidTriplet::default(),
            String::new(),
            0x7000_0000,
        );
        assert_eq!(p.state, ProcessState::Created);
        assert!(p.threads.is_empty());
        assert!(p.primary_thread().is_none());
    }

    #[test]
    fn test_priority_values_ascend() {
        assert!(ProcessPriority::Low.value() < ProcessPriority::Foreground.value());
        assert!(ProcessPriority::Foreground.value() < ProcessPriority::WindowServer.value());
        assert!(ProcessPriority::WindowServer.value() < ProcessPriority::Supervisor.value());
    }
}
