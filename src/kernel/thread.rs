//! Threads
//!
//! A thread is a guest execution context plus the kernel bookkeeping hung
//! off it: saved CPU state, priorities (nominal and inherited), TLS slots,
//! a per-thread handle table, the request semaphore, logon/rendezvous
//! subscriber lists and a call trace for debugging.
//!
//! State transitions that touch other objects (scheduler queues, mutexes,
//! timing events) live on the [`Kernel`](super::Kernel); this module holds
//! the data and the self-contained pieces of the state machine.

use super::chunk::ChunkId;
use super::handles::{HandleOwner, HandleTable};
use super::ipc::{MessageId, RequestStatusId};
use super::mutex::MutexId;
use super::object::ObjectInfo;
use super::process::ProcessId;
use super::semaphore::SemaphoreId;
use crate::cpu::ThreadContext;

/// Identifier into the kernel's thread arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub usize);

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "thread:{}", self.0)
    }
}

/// The thread state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Constructed, not yet resumed
    Create,
    /// In a scheduler ready queue
    Ready,
    /// The one currently executing thread
    Run,
    /// Blocked on the request semaphore or a plain sleep
    Wait,
    WaitMutex,
    WaitMutexSuspend,
    WaitFastSema,
    WaitFastSemaSuspend,
    /// Mutex ownership transferred but the thread not yet resumed
    HoldMutexPending,
    /// Parked while a host-side (HLE) event completes
    WaitHle,
    /// Terminated
    Stop,
}

impl ThreadState {
    /// True for every state that sits on some wait object's queue.
    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            ThreadState::Wait
                | ThreadState::WaitMutex
                | ThreadState::WaitMutexSuspend
                | ThreadState::WaitFastSema
                | ThreadState::WaitFastSemaSuspend
                | ThreadState::WaitHle
        )
    }
}

/// Nominal Symbian thread priorities. Process-relative values are the
/// small signed ones; absolute values start at 100.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadPriority {
    Null,
    MuchLess,
    Less,
    Normal,
    More,
    MuchMore,
    RealTime,
    AbsoluteVeryLow,
    AbsoluteLow,
    AbsoluteBackground,
    AbsoluteForeground,
    AbsoluteHigh,
}

impl ThreadPriority {
    pub fn value(self) -> i32 {
        match self {
            ThreadPriority::Null => -30,
            ThreadPriority::MuchLess => -20,
            ThreadPriority::Less => -10,
            ThreadPriority::Normal => 0,
            ThreadPriority::More => 10,
            ThreadPriority::MuchMore => 20,
            ThreadPriority::RealTime => 30,
            ThreadPriority::AbsoluteVeryLow => 100,
            ThreadPriority::AbsoluteLow => 200,
            ThreadPriority::AbsoluteBackground => 300,
            ThreadPriority::AbsoluteForeground => 400,
            ThreadPriority::AbsoluteHigh => 500,
        }
    }
}

/// What a waiting thread is enqueued on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitObject {
    Mutex(MutexId),
    FastSema(SemaphoreId),
    /// The thread's own request semaphore
    Request,
    /// A timed sleep
    Sleep,
    /// A host-side event
    Hle,
}

pub const TLS_SLOT_COUNT: usize = 50;

/// One TLS slot, keyed by `(handle, uid)`; `handle == -1` marks it free.
#[derive(Debug, Clone, Copy)]
pub struct TlsSlot {
    pub handle: i32,
    pub uid: i32,
    pub pointer: u32,
}

impl TlsSlot {
    const FREE: TlsSlot = TlsSlot {
        handle: -1,
        uid: -1,
        pointer: 0,
    };

    pub fn is_free(&self) -> bool {
        self.handle == -1
    }
}

/// The guest-visible per-thread block.
#[derive(Debug)]
pub struct ThreadLocalData {
    pub heap: u32,
    pub scheduler: u32,
    pub trap_handler: u32,
    pub thread_id: u32,
    pub tls_slots: [TlsSlot; TLS_SLOT_COUNT],
}

impl ThreadLocalData {
    pub fn new(thread_id: u32) -> Self {
        Self {
            heap: 0,
            scheduler: 0,
            trap_handler: 0,
            thread_id,
            tls_slots: [TlsSlot::FREE; TLS_SLOT_COUNT],
        }
    }
}

/// A logon or rendezvous subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogonRequest {
    pub requester: ThreadId,
    pub status: RequestStatusId,
}

/// One frame of the debug call trace.
#[derive(Debug, Clone)]
pub struct CallFrame {
    pub func_name: String,
    pub ctx: ThreadContext,
}

/// A guest thread.
#[derive(Debug)]
pub struct Thread {
    pub info: ObjectInfo,
    pub owner: ProcessId,
    pub state: ThreadState,

    pub ctx: ThreadContext,
    pub priority: ThreadPriority,
    pub real_priority: i32,

    pub stack_chunk: Option<ChunkId>,
    pub local_data: ThreadLocalData,
    pub handles: HandleTable,

    /// Count of completed-but-unconsumed asynchronous requests.
    pub request_sema: i32,
    pub wait_obj: Option<WaitObject>,

    pub sleep_status: Option<RequestStatusId>,
    pub timeout_status: Option<RequestStatusId>,

    pub leave_depth: i32,
    pub exit_reason: i32,
    pub rendezvous_reason: i32,

    pub logon_requests: Vec<LogonRequest>,
    pub rendezvous_requests: Vec<LogonRequest>,

    pub held_mutexes: Vec<MutexId>,
    pub sync_msg: Option<MessageId>,
    pub call_stack: Vec<CallFrame>,

    pub create_time: u64,
    pub last_run: u64,
}

impl Thread {
    pub fn new(
        info: ObjectInfo,
        owner: ProcessId,
        ctx: ThreadContext,
        priority: ThreadPriority,
        create_time: u64,
    ) -> Self {
        let thread_id = info.id;
        Self {
            info,
            owner,
            state: ThreadState::Create,
            ctx,
            priority,
            real_priority: priority.value(),
            stack_chunk: None,
            local_data: ThreadLocalData::new(thread_id),
            handles: HandleTable::new(HandleOwner::Thread),
            request_sema: 0,
            wait_obj: None,
            sleep_status: None,
            timeout_status: None,
            leave_depth: -1,
            exit_reason: 0,
            rendezvous_reason: 0,
            logon_requests: Vec::new(),
            rendezvous_requests: Vec::new(),
            held_mutexes: Vec::new(),
            sync_msg: None,
            call_stack: Vec::new(),
            create_time,
            last_run: 0,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.state == ThreadState::Stop
    }

    /// The TLS slot for `(handle, uid)`, claiming a free slot when absent.
    /// None when every slot is taken.
    pub fn get_tls_slot(&mut self, handle: i32, uid: i32) -> Option<&mut TlsSlot> {
        let slots = &mut self.local_data.tls_slots;

        let pos = slots
            .iter()
            .position(|s| s.handle == handle && s.uid == uid)
            .or_else(|| slots.iter().position(|s| s.is_free()));

        let slot = &mut slots[pos?];
        if slot.is_free() {
            slot.handle = handle;
            slot.uid = uid;
        }
        Some(slot)
    }

    /// Release the TLS slot claimed for `(handle, uid)`.
    pub fn close_tls_slot(&mut self, handle: i32, uid: i32) -> bool {
        for slot in self.local_data.tls_slots.iter_mut() {
            if slot.handle == handle && slot.uid == uid {
                *slot = TlsSlot::FREE;
                return true;
            }
        }
        false
    }

    pub fn increase_leave_depth(&mut self) {
        self.leave_depth += 1;
    }

    pub fn decrease_leave_depth(&mut self) {
        self.leave_depth -= 1;
    }

    /// A positive depth after unwinding means an unbalanced leave.
    pub fn is_invalid_leave(&self) -> bool {
        self.leave_depth > 0
    }

    pub fn push_call(&mut self, func_name: &str, ctx: &ThreadContext) {
        self.call_stack.push(CallFrame {
            func_name: func_name.to_string(),
            ctx: ctx.clone(),
        });
    }

    pub fn pop_call(&mut self) -> Option<CallFrame> {
        self.call_stack.pop()
    }

    pub fn top_call(&self) -> Option<&CallFrame> {
        self.call_stack.last()
    }
}
