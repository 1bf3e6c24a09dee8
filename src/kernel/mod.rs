//! The kernel
//!
//! Central registry of every kernel object. Objects live in per-kind slab
//! arenas and cross-reference each other by id; handle tables map
//! guest-visible handles onto those ids. All state transitions that span
//! objects (blocking on a mutex, completing a request status, tearing a
//! thread down) are methods here, so every mutation happens under one
//! `&mut Kernel`.
//!
//! Core abstractions:
//! - Process/Thread: units of isolation and execution
//! - HandleTable: guest handle → object reference
//! - RequestStatus: one-shot completion cell backed by guest memory
//! - Scheduler: cooperative ready queues; blocked threads live on their
//!   wait object, never in a ready queue

pub mod chunk;
pub mod handles;
pub mod ipc;
pub mod mutex;
pub mod object;
pub mod process;
pub mod property;
pub mod scheduler;
pub mod semaphore;
pub mod thread;


pub use chunk::{Chunk, ChunkId, ChunkType};
pub use handles::{Handle, HandleOwner, HandleTable};
pub use ipc::{
    IpcArg, IpcArgs, Message, MessageId, RequestState, RequestStatus, RequestStatusId, Server,
    ServerId, Session, SessionId,
};
pub use mutex::{Mutex, MutexId};
pub use object::{Access, IdAllocator, ObjectInfo, ObjectKind, ObjectRef, OwnerKind};
pub use process::{Process, ProcessId, ProcessPriority, ProcessState};
pub use property::{Property, PropertyId, PropertySubscriber, PropertyType};
pub use scheduler::Scheduler;
pub use semaphore::{Semaphore, SemaphoreId};
pub use thread::{Thread, ThreadId, ThreadPriority, ThreadState, WaitObject};

use crate::EpocVersion;
use crate::cpu::{CpuCore, ThreadContext};
use crate::error::{KERR_CANCEL, KERR_NONE, KREQUEST_PENDING, KernelError, KernelResult};
use crate::loader::ProcessImage;
use crate::memory::{MemArea, Memory, Protection, round_to_pages};
use crate::timing::{EventType, FiredEvent, Timing};
use slab::Slab;
use std::collections::VecDeque;

/// Work posted by host-side drivers, serviced by `processing_requests`.
#[derive(Debug, Clone, Copy)]
struct PostedCompletion {
    status: RequestStatusId,
    code: i32,
}

/// The kernel object registry and scheduler.
pub struct Kernel {
    version: EpocVersion,

    pub(crate) processes: Slab<Process>,
    pub(crate) threads: Slab<Thread>,
    pub(crate) chunks: Slab<Chunk>,
    pub(crate) mutexes: Slab<Mutex>,
    pub(crate) semaphores: Slab<Semaphore>,
    pub(crate) properties: Slab<Property>,
    pub(crate) sessions: Slab<Session>,
    pub(crate) servers: Slab<Server>,
    pub(crate) messages: Slab<Message>,
    pub(crate) statuses: Slab<RequestStatus>,

    pub scheduler: Scheduler,
    ids: IdAllocator,

    /// Host-issued handles (process spawning, open-by-name from the host).
    kernel_handles: HandleTable,

    posted: VecDeque<PostedCompletion>,
    pending_dispatch: VecDeque<MessageId>,

    evt_sleep: EventType,
    evt_after: EventType,

    has_spawned: bool,
}

impl Kernel {
    pub fn new(version: EpocVersion) -> Self {
        Self {
            version,
            processes: Slab::new(),
            threads: Slab::new(),
            chunks: Slab::new(),
            mutexes: Slab::new(),
            semaphores: Slab::new(),
            properties: Slab::new(),
            sessions: Slab::new(),
            servers: Slab::new(),
            messages: Slab::new(),
            statuses: Slab::new(),
            scheduler: Scheduler::new(),
            ids: IdAllocator::new(),
            kernel_handles: HandleTable::new(HandleOwner::Kernel),
            posted: VecDeque::new(),
            pending_dispatch: VecDeque::new(),
            evt_sleep: 0,
            evt_after: 0,
            has_spawned: false,
        }
    }

    /// Register the kernel's timed-event types.
    pub fn init(&mut self, timing: &mut Timing) {
        self.evt_sleep = timing.register_event("ThreadSleep");
        self.evt_after = timing.register_event("ThreadAfter");
    }

    pub fn set_epoc_version(&mut self, version: EpocVersion) {
        self.version = version;
    }

    pub fn epoc_version(&self) -> EpocVersion {
        self.version
    }

    pub fn get_id_base_owner(&self, owner: OwnerKind) -> u32 {
        self.ids.base(owner)
    }

    fn new_info(&mut self, name: Option<String>, owner: OwnerKind, access: Access) -> ObjectInfo {
        ObjectInfo::new(self.ids.next(owner), name, owner, access)
    }

    // ------------------------------------------------------------------
    // Current thread / process

    pub fn current_thread(&self) -> Option<ThreadId> {
        self.scheduler.current()
    }

    pub fn current_process(&self) -> Option<ProcessId> {
        self.current_thread().map(|t| self.threads[t.0].owner)
    }

    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(id.0)
    }

    pub fn thread_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.threads.get_mut(id.0)
    }

    pub fn process(&self, id: ProcessId) -> Option<&Process> {
        self.processes.get(id.0)
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(id.0)
    }

    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.messages.get(id.0)
    }

    pub fn request_status(&self, id: RequestStatusId) -> Option<&RequestStatus> {
        self.statuses.get(id.0)
    }

    // ------------------------------------------------------------------
    // Processes and threads

    /// Create a process from a loaded image. The process starts suspended;
    /// its primary thread runs once `run_process` is called.
    pub fn spawn_new_process(
        &mut self,
        mem: &mut Memory,
        image: &ProcessImage,
        cmd_line: &str,
    ) -> KernelResult<Handle> {
        let info = self.new_info(
            Some(image.name.clone()),
            OwnerKind::Kernel,
            Access::Global,
        );
        let mut process = Process::new(info, image.uids, cmd_line.to_string(), image.entry_point);

        // Code segment.
        if image.code_size > 0 {
            let chunk = self.create_chunk(
                mem,
                Some(&format!("{}::code", image.name)),
                MemArea::RamCode,
                ChunkType::Normal,
                image.code_size,
                image.code_size,
                None,
                Access::Local,
            )?;
            process.code_chunk = Some(chunk);
        }

        let pid = ProcessId(self.processes.insert(process));
        if let Some(chunk) = self.processes[pid.0].code_chunk {
            self.chunks[chunk.0].owner_process = Some(pid);
        }

        // Primary thread, created but not resumed.
        let main_name = format!("{}::Main", image.name);
        self.create_thread(
            mem,
            pid,
            &main_name,
            image.entry_point,
            image.stack_size,
            ThreadPriority::Normal,
            0,
        )?;

        self.has_spawned = true;
        Ok(self.kernel_handles.add(ObjectRef::Process(pid)))
    }

    /// Start a suspended process: resume its primary thread.
    pub fn run_process(&mut self, handle: Handle) -> KernelResult<()> {
        let ObjectRef::Process(pid) = self
            .kernel_handles
            .get(handle)
            .ok_or(KernelError::InvalidArgument)?
        else {
            return Err(KernelError::InvalidArgument);
        };

        let primary = self.processes[pid.0]
            .primary_thread()
            .ok_or(KernelError::NotFound)?;
        self.processes[pid.0].state = ProcessState::Running;
        self.resume_thread(primary);
        Ok(())
    }

    /// Create a thread inside `owner`, with its own stack chunk. The
    /// thread starts in `Create` and must be resumed.
    #[allow(clippy::too_many_arguments)]
    pub fn create_thread(
        &mut self,
        mem: &mut Memory,
        owner: ProcessId,
        name: &str,
        entry_point: u32,
        stack_size: u32,
        priority: ThreadPriority,
        now: u64,
    ) -> KernelResult<ThreadId> {
        if !self.processes.contains(owner.0) {
            return Err(KernelError::NotFound);
        }

        let stack_size = round_to_pages(stack_size.max(1));
        let stack_chunk = self.create_chunk(
            mem,
            Some(&format!("{}::stack", name)),
            MemArea::LocalData,
            ChunkType::DoubleEnded,
            stack_size,
            stack_size,
            Some(owner),
            Access::Local,
        )?;
        let base = self.chunks[stack_chunk.0].base;

        let info = self.new_info(Some(name.to_string()), OwnerKind::Process, Access::Local);
        let ctx = ThreadContext::new(entry_point, base + stack_size, 0);
        let mut thread = Thread::new(info, owner, ctx, priority, now);
        thread.stack_chunk = Some(stack_chunk);

        let tid = ThreadId(self.threads.insert(thread));
        self.processes[owner.0].threads.push(tid);

        // Every thread carries a reserved message for synchronous sends.
        let sync_msg = self.alloc_message(Message {
            function: 0,
            args: IpcArgs::default(),
            sender: tid,
            session: None,
            status: None,
            free: false,
        });
        self.threads[tid.0].sync_msg = Some(sync_msg);

        Ok(tid)
    }

    /// Reserve a chunk of guest memory and commit its initial section.
    /// Code-area chunks come out executable, everything else read-write.
    #[allow(clippy::too_many_arguments)]
    pub fn create_chunk(
        &mut self,
        mem: &mut Memory,
        name: Option<&str>,
        area: MemArea,
        chunk_type: ChunkType,
        max_size: u32,
        committed: u32,
        owner_process: Option<ProcessId>,
        access: Access,
    ) -> KernelResult<ChunkId> {
        if committed > max_size {
            return Err(KernelError::InvalidArgument);
        }

        let max_size = round_to_pages(max_size.max(1));
        let committed = round_to_pages(committed);
        let protection = match area {
            MemArea::RamCode => Protection::ReadWriteExec,
            _ => Protection::ReadWrite,
        };

        let region = mem.reserve(area, max_size, protection)?;
        if committed > 0 {
            mem.commit(region, 0, committed)?;
        }
        let base = mem.region_base(region).expect("fresh region");

        let info = self.new_info(name.map(str::to_string), OwnerKind::Process, access);
        Ok(ChunkId(self.chunks.insert(Chunk {
            info,
            chunk_type,
            region,
            base,
            max_size,
            committed_size: committed,
            owner_process,
        })))
    }

    /// Grow or shrink a chunk's committed section.
    pub fn adjust_chunk(
        &mut self,
        mem: &mut Memory,
        id: ChunkId,
        new_committed: u32,
    ) -> KernelResult<()> {
        let chunk = self.chunks.get_mut(id.0).ok_or(KernelError::InvalidArgument)?;

        let new_committed = round_to_pages(new_committed);
        if new_committed > chunk.max_size {
            return Err(KernelError::Overflow);
        }

        if new_committed > chunk.committed_size {
            mem.commit(chunk.region, chunk.committed_size, new_committed - chunk.committed_size)?;
        } else if new_committed < chunk.committed_size {
            mem.decommit(chunk.region, new_committed, chunk.committed_size - new_committed)?;
        }

        chunk.committed_size = new_committed;
        Ok(())
    }

    pub fn chunk(&self, id: ChunkId) -> Option<&Chunk> {
        self.chunks.get(id.0)
    }

    /// Threads not yet stopped.
    pub fn live_thread_count(&self) -> usize {
        self.threads.iter().filter(|(_, t)| !t.is_stopped()).count()
    }

    /// True once every spawned thread has terminated.
    pub fn should_terminate(&self) -> bool {
        self.has_spawned && self.live_thread_count() == 0
    }

    // ------------------------------------------------------------------
    // Thread state machine

    fn wake_thread(&mut self, tid: ThreadId) {
        let thread = &mut self.threads[tid.0];
        thread.state = ThreadState::Ready;
        thread.wait_obj = None;
        let priority = thread.real_priority;
        self.scheduler.enqueue(tid, priority);
    }

    /// Pull the current thread off the CPU without making it ready.
    fn block_current(&mut self, tid: ThreadId) {
        if self.scheduler.current() == Some(tid) {
            self.scheduler.set_current(None);
        } else {
            self.scheduler.remove(tid);
        }
    }

    /// Resume a suspended or newly created thread. Suspended waits return
    /// to their prior wait state instead of ready.
    pub fn resume_thread(&mut self, tid: ThreadId) -> bool {
        match self.threads[tid.0].state {
            ThreadState::Create => {
                self.wake_thread(tid);
                true
            }
            ThreadState::Wait if self.threads[tid.0].wait_obj.is_none() => {
                self.wake_thread(tid);
                true
            }
            ThreadState::WaitMutexSuspend => {
                let thread = &mut self.threads[tid.0];
                thread.state = ThreadState::WaitMutex;
                if let Some(WaitObject::Mutex(mid)) = thread.wait_obj {
                    let mutex = &mut self.mutexes[mid.0];
                    mutex.suspended.retain(|&t| t != tid);
                    mutex.waiting.push(tid);
                }
                true
            }
            ThreadState::WaitFastSemaSuspend => {
                let thread = &mut self.threads[tid.0];
                thread.state = ThreadState::WaitFastSema;
                if let Some(WaitObject::FastSema(sid)) = thread.wait_obj {
                    let sema = &mut self.semaphores[sid.0];
                    sema.suspended.retain(|&t| t != tid);
                    sema.waiting.push(tid);
                }
                true
            }
            ThreadState::HoldMutexPending => {
                if let Some(WaitObject::Mutex(mid)) = self.threads[tid.0].wait_obj {
                    self.mutexes[mid.0].pending.retain(|&t| t != tid);
                }
                let thread = &mut self.threads[tid.0];
                thread.wait_obj = None;
                thread.state = ThreadState::Ready;
                let priority = thread.real_priority;
                self.scheduler.enqueue(tid, priority);
                true
            }
            _ => false,
        }
    }

    /// Suspend a thread. A waiting thread moves to the matching suspended
    /// wait state and off its wait queue's eligible list.
    pub fn suspend_thread(&mut self, tid: ThreadId) -> bool {
        match self.threads[tid.0].state {
            ThreadState::Ready | ThreadState::Run => {
                self.block_current(tid);
                let thread = &mut self.threads[tid.0];
                thread.state = ThreadState::Wait;
                thread.wait_obj = None;
                true
            }
            ThreadState::WaitMutex => {
                let thread = &mut self.threads[tid.0];
                thread.state = ThreadState::WaitMutexSuspend;
                if let Some(WaitObject::Mutex(mid)) = thread.wait_obj {
                    let mutex = &mut self.mutexes[mid.0];
                    mutex.waiting.retain(|&t| t != tid);
                    mutex.suspended.push(tid);
                }
                true
            }
            ThreadState::WaitFastSema => {
                let thread = &mut self.threads[tid.0];
                thread.state = ThreadState::WaitFastSemaSuspend;
                if let Some(WaitObject::FastSema(sid)) = thread.wait_obj {
                    let sema = &mut self.semaphores[sid.0];
                    sema.waiting.retain(|&t| t != tid);
                    sema.suspended.push(tid);
                }
                true
            }
            _ => false,
        }
    }

    /// Change a thread's nominal priority and recompute its effective one.
    pub fn set_thread_priority(&mut self, tid: ThreadId, priority: ThreadPriority) {
        self.threads[tid.0].priority = priority;
        self.update_real_priority(tid);
    }

    /// Recompute `real_priority` as the max of the nominal priority and
    /// every waiter's nominal priority across all mutexes the thread
    /// holds, then propagate through any mutex the thread itself waits on.
    fn update_real_priority(&mut self, tid: ThreadId) {
        let mut real = self.threads[tid.0].priority.value();
        for &mid in &self.threads[tid.0].held_mutexes {
            let mutex = &self.mutexes[mid.0];
            for &waiter in mutex.waiting.iter().chain(mutex.suspended.iter()) {
                real = real.max(self.threads[waiter.0].priority.value());
            }
        }

        let thread = &mut self.threads[tid.0];
        if thread.real_priority == real {
            return;
        }
        thread.real_priority = real;

        if self.scheduler.is_ready(tid) {
            self.scheduler.remove(tid);
            self.scheduler.enqueue(tid, real);
        }

        // A boosted thread blocked on another mutex carries the boost on.
        if let Some(WaitObject::Mutex(mid)) = self.threads[tid.0].wait_obj {
            if let Some(holder) = self.mutexes[mid.0].holder {
                self.update_real_priority(holder);
            }
        }
    }

    /// Terminate a thread: complete its logons, release its mutexes, drop
    /// it from every queue. The owning process dies with its last thread.
    pub fn stop_thread(&mut self, mem: &mut Memory, timing: &mut Timing, tid: ThreadId, reason: i32) {
        if self.threads[tid.0].is_stopped() {
            return;
        }

        self.block_current(tid);
        timing.unschedule_event(self.evt_sleep, tid.0 as u64);
        timing.unschedule_event(self.evt_after, tid.0 as u64);

        // Drop the thread from whatever wait queue held it.
        if let Some(wait) = self.threads[tid.0].wait_obj {
            match wait {
                WaitObject::Mutex(mid) => {
                    self.mutexes[mid.0].remove_waiter(tid);
                }
                WaitObject::FastSema(sid) => {
                    self.semaphores[sid.0].remove_waiter(tid);
                }
                _ => {}
            }
        }

        let thread = &mut self.threads[tid.0];
        thread.state = ThreadState::Stop;
        thread.wait_obj = None;
        thread.exit_reason = reason;

        // Hand every held mutex to its next waiter.
        let held = std::mem::take(&mut self.threads[tid.0].held_mutexes);
        for mid in held {
            self.mutexes[mid.0].holder = None;
            self.mutexes[mid.0].hold_count = 0;
            self.grant_mutex_to_next(mid);
        }
        self.update_real_priority(tid);

        self.finish_logons(mem, tid, reason);

        let owner = self.threads[tid.0].owner;
        let all_stopped = self.processes[owner.0]
            .threads
            .iter()
            .all(|&t| self.threads[t.0].is_stopped());
        if all_stopped {
            let process = &mut self.processes[owner.0];
            process.state = ProcessState::Dead;
            process.exit_reason = reason;
            log::info!("process {} exited with {}", process.info.name(), reason);
        }
    }

    // ------------------------------------------------------------------
    // Request statuses

    /// Register a completion cell at guest address `addr`, owned by `tid`.
    /// The cell is stamped with the pending sentinel.
    pub fn create_request_status(
        &mut self,
        mem: &mut Memory,
        tid: ThreadId,
        addr: u32,
    ) -> RequestStatusId {
        if addr != 0 {
            if let Err(err) = mem.write_i32(addr, KREQUEST_PENDING) {
                log::warn!("request status at {:#010x} unwritable: {}", addr, err);
            }
        }
        RequestStatusId(self.statuses.insert(RequestStatus {
            owner: tid,
            addr,
            state: RequestState::Pending,
        }))
    }

    /// Complete a request exactly once: write the code into guest memory
    /// and signal the owner's request semaphore. Late completions of an
    /// already-completed status are ignored.
    pub fn complete_request(&mut self, mem: &mut Memory, id: RequestStatusId, code: i32) {
        let Some(status) = self.statuses.get_mut(id.0) else {
            return;
        };
        if !status.is_pending() {
            return;
        }
        status.state = RequestState::Completed(code);

        let owner = status.owner;
        let addr = status.addr;
        if addr != 0 {
            if let Err(err) = mem.write_i32(addr, code) {
                log::warn!("request status at {:#010x} unwritable: {}", addr, err);
            }
        }

        self.signal_request(owner, 1);
    }

    /// Post a completion from a host-side driver; serviced on the next
    /// `processing_requests`.
    pub fn post_completion(&mut self, status: RequestStatusId, code: i32) {
        self.posted.push_back(PostedCompletion { status, code });
    }

    /// Drain work posted by host-side asynchronous drivers.
    pub fn processing_requests(&mut self, mem: &mut Memory) {
        while let Some(work) = self.posted.pop_front() {
            self.complete_request(mem, work.status, work.code);
        }
    }

    // ------------------------------------------------------------------
    // Request semaphore

    /// Signal `count` completed requests to `tid`, waking it if it sits in
    /// `wait_for_any_request`.
    pub fn signal_request(&mut self, tid: ThreadId, count: i32) {
        let thread = &mut self.threads[tid.0];
        thread.request_sema += count;

        if thread.state == ThreadState::Wait
            && thread.wait_obj == Some(WaitObject::Request)
            && thread.request_sema > 0
        {
            thread.request_sema -= 1;
            self.wake_thread(tid);
        }
    }

    /// Consume one pending completion, blocking the thread when none is
    /// available.
    pub fn wait_for_any_request(&mut self, tid: ThreadId) {
        let thread = &mut self.threads[tid.0];
        if thread.request_sema > 0 {
            thread.request_sema -= 1;
            return;
        }

        thread.state = ThreadState::Wait;
        thread.wait_obj = Some(WaitObject::Request);
        self.block_current(tid);
    }

    // ------------------------------------------------------------------
    // Sleep / after

    /// Block `tid` until `delay_us` of virtual time passes.
    pub fn sleep(&mut self, timing: &mut Timing, tid: ThreadId, delay_us: u64) {
        let thread = &mut self.threads[tid.0];
        thread.state = ThreadState::Wait;
        thread.wait_obj = Some(WaitObject::Sleep);
        self.block_current(tid);
        timing.schedule_event(delay_us, self.evt_sleep, tid.0 as u64);
    }

    /// Sleep with a notification status completed at wakeup.
    pub fn sleep_nof(
        &mut self,
        timing: &mut Timing,
        tid: ThreadId,
        status: RequestStatusId,
        delay_us: u64,
    ) {
        self.threads[tid.0].sleep_status = Some(status);
        self.sleep(timing, tid, delay_us);
    }

    /// The asynchronous form: arm a timer that completes `status` after
    /// `delay_us`. The thread keeps running.
    pub fn after(
        &mut self,
        timing: &mut Timing,
        tid: ThreadId,
        status: RequestStatusId,
        delay_us: u64,
    ) {
        self.threads[tid.0].timeout_status = Some(status);
        timing.schedule_event(delay_us, self.evt_after, tid.0 as u64);
    }

    /// Cancel a pending sleep: dequeue the timer and complete the sleep
    /// status (if any) with `KErrCancel`. Idempotent.
    pub fn cancel_sleep(&mut self, mem: &mut Memory, timing: &mut Timing, tid: ThreadId) {
        if !timing.unschedule_event(self.evt_sleep, tid.0 as u64) {
            return;
        }
        self.notify_sleep(mem, tid, KERR_CANCEL);
    }

    /// Cancel a pending `after`. Idempotent.
    pub fn cancel_after(&mut self, mem: &mut Memory, timing: &mut Timing, tid: ThreadId) {
        if !timing.unschedule_event(self.evt_after, tid.0 as u64) {
            return;
        }
        self.notify_after(mem, tid, KERR_CANCEL);
    }

    fn notify_sleep(&mut self, mem: &mut Memory, tid: ThreadId, code: i32) {
        if let Some(status) = self.threads[tid.0].sleep_status.take() {
            self.complete_request(mem, status, code);
        }

        let thread = &self.threads[tid.0];
        if thread.state == ThreadState::Wait && thread.wait_obj == Some(WaitObject::Sleep) {
            self.wake_thread(tid);
        }
    }

    fn notify_after(&mut self, mem: &mut Memory, tid: ThreadId, code: i32) {
        if let Some(status) = self.threads[tid.0].timeout_status.take() {
            self.complete_request(mem, status, code);
        }
    }

    /// Interpret an event fired by the timing queue.
    pub fn on_timed_event(&mut self, mem: &mut Memory, event: FiredEvent) {
        let tid = ThreadId(event.userdata as usize);
        if !self.threads.contains(tid.0) {
            return;
        }

        if event.event_type == self.evt_sleep {
            self.notify_sleep(mem, tid, KERR_NONE);
        } else if event.event_type == self.evt_after {
            self.notify_after(mem, tid, KERR_NONE);
        } else {
            log::warn!("unknown timed event type {}", event.event_type);
        }
    }

    // ------------------------------------------------------------------
    // Logon / rendezvous

    /// Subscribe `status` to `target`'s termination (or next rendezvous).
    /// A logon on an already stopped thread completes immediately.
    pub fn logon(
        &mut self,
        mem: &mut Memory,
        subscriber: ThreadId,
        target: ThreadId,
        status: RequestStatusId,
        rendezvous: bool,
    ) {
        if self.threads[target.0].is_stopped() {
            let reason = self.threads[target.0].exit_reason;
            self.complete_request(mem, status, reason);
            return;
        }

        let request = thread::LogonRequest {
            requester: subscriber,
            status,
        };
        let list = if rendezvous {
            &mut self.threads[target.0].rendezvous_requests
        } else {
            &mut self.threads[target.0].logon_requests
        };
        list.push(request);
    }

    /// Remove a specific subscription, completing it with `KErrCancel`.
    pub fn logon_cancel(
        &mut self,
        mem: &mut Memory,
        target: ThreadId,
        status: RequestStatusId,
        rendezvous: bool,
    ) -> bool {
        let list = if rendezvous {
            &mut self.threads[target.0].rendezvous_requests
        } else {
            &mut self.threads[target.0].logon_requests
        };

        let Some(pos) = list.iter().position(|r| r.status == status) else {
            return false;
        };
        list.remove(pos);
        self.complete_request(mem, status, KERR_CANCEL);
        true
    }

    /// Complete `tid`'s rendezvous subscribers with `reason`, in
    /// registration order, then clear the list.
    pub fn rendezvous(&mut self, mem: &mut Memory, tid: ThreadId, reason: i32) {
        self.threads[tid.0].rendezvous_reason = reason;
        let requests = std::mem::take(&mut self.threads[tid.0].rendezvous_requests);
        for request in requests {
            self.complete_request(mem, request.status, reason);
        }
    }

    fn finish_logons(&mut self, mem: &mut Memory, tid: ThreadId, reason: i32) {
        let logons = std::mem::take(&mut self.threads[tid.0].logon_requests);
        let rendezvous = std::mem::take(&mut self.threads[tid.0].rendezvous_requests);
        for request in logons.into_iter().chain(rendezvous) {
            self.complete_request(mem, request.status, reason);
        }
    }

    // ------------------------------------------------------------------
    // Mutexes

    pub fn create_mutex(&mut self, name: Option<&str>, access: Access) -> KernelResult<MutexId> {
        if let Some(name) = name {
            if self.find_mutex_by_name(name).is_some() {
                return Err(KernelError::AlreadyExists);
            }
        }
        let info = self.new_info(name.map(str::to_string), OwnerKind::Process, access);
        Ok(MutexId(self.mutexes.insert(Mutex::new(info))))
    }

    fn find_mutex_by_name(&self, name: &str) -> Option<MutexId> {
        self.mutexes
            .iter()
            .find(|(_, m)| m.info.name.as_deref() == Some(name))
            .map(|(k, _)| MutexId(k))
    }

    /// Acquire, recursively acquire, or block on a mutex.
    pub fn wait_mutex(&mut self, tid: ThreadId, mid: MutexId) {
        let mutex = &mut self.mutexes[mid.0];

        if mutex.is_free() {
            mutex.holder = Some(tid);
            mutex.hold_count = 1;
            self.threads[tid.0].held_mutexes.push(mid);
            return;
        }

        if mutex.held_by(tid) {
            mutex.hold_count += 1;
            return;
        }

        mutex.waiting.push(tid);
        let thread = &mut self.threads[tid.0];
        thread.state = ThreadState::WaitMutex;
        thread.wait_obj = Some(WaitObject::Mutex(mid));
        self.block_current(tid);

        // Priority inheritance: boost the holder (and onward, if the
        // holder itself waits on a mutex).
        let holder = self.mutexes[mid.0].holder.expect("contended mutex has holder");
        self.update_real_priority(holder);
    }

    /// Release one hold. At zero the highest-priority waiter takes over.
    pub fn signal_mutex(&mut self, tid: ThreadId, mid: MutexId) -> KernelResult<()> {
        let mutex = &mut self.mutexes[mid.0];
        if !mutex.held_by(tid) {
            return Err(KernelError::PermissionDenied);
        }

        mutex.hold_count -= 1;
        if mutex.hold_count > 0 {
            return Ok(());
        }

        mutex.holder = None;
        self.threads[tid.0].held_mutexes.retain(|&m| m != mid);
        self.grant_mutex_to_next(mid);

        // The releaser sheds any boost this mutex's waiters gave it.
        self.update_real_priority(tid);
        Ok(())
    }

    fn grant_mutex_to_next(&mut self, mid: MutexId) {
        let winner = {
            let Kernel {
                mutexes, threads, ..
            } = self;
            mutexes[mid.0].take_best_waiter(|t| threads[t.0].real_priority)
        };

        if let Some(next) = winner {
            self.mutexes[mid.0].holder = Some(next);
            self.mutexes[mid.0].hold_count = 1;
            self.threads[next.0].held_mutexes.push(mid);
            self.wake_thread(next);
            self.update_real_priority(next);
            return;
        }

        // Only suspended waiters remain: ownership transfers, but the
        // thread stays parked until resumed.
        if let Some(&next) = self.mutexes[mid.0].suspended.first() {
            self.mutexes[mid.0].suspended.remove(0);
            self.mutexes[mid.0].holder = Some(next);
            self.mutexes[mid.0].hold_count = 1;
            self.mutexes[mid.0].pending.push(next);
            self.threads[next.0].held_mutexes.push(mid);
            self.threads[next.0].state = ThreadState::HoldMutexPending;
            self.update_real_priority(next);
        }
    }

    // ------------------------------------------------------------------
    // Fast semaphores

    pub fn create_semaphore(
        &mut self,
        name: Option<&str>,
        initial: i32,
        access: Access,
    ) -> SemaphoreId {
        let info = self.new_info(name.map(str::to_string), OwnerKind::Process, access);
        SemaphoreId(self.semaphores.insert(Semaphore::new(info, initial)))
    }

    /// Decrement if positive, otherwise block.
    pub fn sema_wait(&mut self, tid: ThreadId, sid: SemaphoreId) {
        let sema = &mut self.semaphores[sid.0];
        if sema.count > 0 {
            sema.count -= 1;
            return;
        }

        sema.waiting.push(tid);
        let thread = &mut self.threads[tid.0];
        thread.state = ThreadState::WaitFastSema;
        thread.wait_obj = Some(WaitObject::FastSema(sid));
        self.block_current(tid);
    }

    /// Increment by `count`, waking up to `count` waiters in priority
    /// order.
    pub fn sema_signal(&mut self, sid: SemaphoreId, count: i32) {
        for _ in 0..count {
            let winner = {
                let Kernel {
                    semaphores,
                    threads,
                    ..
                } = self;
                semaphores[sid.0].take_best_waiter(|t| threads[t.0].real_priority)
            };

            match winner {
                Some(next) => self.wake_thread(next),
                None => self.semaphores[sid.0].count += 1,
            }
        }
    }

    // ------------------------------------------------------------------
    // Properties

    fn find_property(&self, category: u32, key: u32) -> Option<PropertyId> {
        self.properties
            .iter()
            .find(|(_, p)| p.category == category && p.key == key)
            .map(|(k, _)| PropertyId(k))
    }

    /// Create or reinitialize the property at `(category, key)`.
    pub fn define_prop(
        &mut self,
        category: u32,
        key: u32,
        data_type: PropertyType,
        pre_allocated: u32,
    ) -> PropertyId {
        if let Some(id) = self.find_property(category, key) {
            let info = self.properties[id.0].info.clone();
            let subscribers = std::mem::take(&mut self.properties[id.0].subscribers);
            self.properties[id.0] = Property::new(info, category, key, data_type, pre_allocated);
            self.properties[id.0].subscribers = subscribers;
            return id;
        }

        let info = self.new_info(None, OwnerKind::Process, Access::Global);
        PropertyId(self.properties.insert(Property::new(
            info,
            category,
            key,
            data_type,
            pre_allocated,
        )))
    }

    /// Register a one-shot subscription on the next set.
    pub fn subscribe_prop(
        &mut self,
        category: u32,
        key: u32,
        thread: ThreadId,
        status: RequestStatusId,
    ) -> KernelResult<()> {
        let id = self
            .find_property(category, key)
            .ok_or(KernelError::NotFound)?;
        self.properties[id.0]
            .subscribers
            .push(PropertySubscriber { thread, status });
        Ok(())
    }

    pub fn set_prop_int(&mut self, mem: &mut Memory, category: u32, key: u32, value: i32) -> KernelResult<()> {
        let id = self
            .find_property(category, key)
            .ok_or(KernelError::NotFound)?;
        if !self.properties[id.0].set_int(value) {
            return Err(KernelError::InvalidArgument);
        }
        self.notify_prop(mem, category, key);
        Ok(())
    }

    pub fn set_prop_bin(
        &mut self,
        mem: &mut Memory,
        category: u32,
        key: u32,
        payload: &[u8],
    ) -> KernelResult<()> {
        let id = self
            .find_property(category, key)
            .ok_or(KernelError::NotFound)?;
        let prop = &mut self.properties[id.0];
        if prop.data_type != PropertyType::Bin {
            return Err(KernelError::InvalidArgument);
        }
        if !prop.set_bin(payload) {
            return Err(KernelError::Overflow);
        }
        self.notify_prop(mem, category, key);
        Ok(())
    }

    pub fn get_prop_int(&self, category: u32, key: u32) -> KernelResult<i32> {
        let id = self
            .find_property(category, key)
            .ok_or(KernelError::NotFound)?;
        self.properties[id.0]
            .get_int()
            .ok_or(KernelError::InvalidArgument)
    }

    pub fn get_prop_bin(&self, category: u32, key: u32) -> KernelResult<Vec<u8>> {
        let id = self
            .find_property(category, key)
            .ok_or(KernelError::NotFound)?;
        self.properties[id.0]
            .get_bin()
            .map(<[u8]>::to_vec)
            .ok_or(KernelError::InvalidArgument)
    }

    /// Complete every subscriber of `(category, key)` exactly once, in
    /// registration order, leaving the list empty.
    pub fn notify_prop(&mut self, mem: &mut Memory, category: u32, key: u32) {
        let Some(id) = self.find_property(category, key) else {
            return;
        };
        let subscribers = self.properties[id.0].take_subscribers();
        for sub in subscribers {
            self.complete_request(mem, sub.status, KERR_NONE);
        }
    }

    // ------------------------------------------------------------------
    // Servers, sessions, messages

    /// Register a named server. Server names are unique.
    pub fn create_server(&mut self, name: &str, owner: Option<ThreadId>) -> KernelResult<ServerId> {
        if self.find_server(name).is_some() {
            return Err(KernelError::AlreadyExists);
        }
        let info = self.new_info(Some(name.to_string()), OwnerKind::Kernel, Access::Global);
        Ok(ServerId(self.servers.insert(Server {
            info,
            queue: VecDeque::new(),
            owner,
        })))
    }

    pub fn find_server(&self, name: &str) -> Option<ServerId> {
        self.servers
            .iter()
            .find(|(_, s)| s.info.name.as_deref() == Some(name))
            .map(|(k, _)| ServerId(k))
    }

    pub fn server(&self, id: ServerId) -> Option<&Server> {
        self.servers.get(id.0)
    }

    /// Connect a client thread to a named server.
    pub fn create_session(&mut self, tid: ThreadId, server_name: &str) -> KernelResult<SessionId> {
        let server = self
            .find_server(server_name)
            .ok_or(KernelError::NotFound)?;
        let info = self.new_info(None, OwnerKind::Process, Access::Local);
        Ok(SessionId(self.sessions.insert(Session {
            info,
            server,
            owner: tid,
        })))
    }

    /// Allocate or recycle a message slot.
    fn alloc_message(&mut self, message: Message) -> MessageId {
        let free = self
            .messages
            .iter()
            .find(|(_, m)| m.free)
            .map(|(k, _)| k);

        match free {
            Some(slot) => {
                self.messages[slot] = message;
                MessageId(slot)
            }
            None => MessageId(self.messages.insert(message)),
        }
    }

    /// Send a message over a session. The message lands on the server's
    /// queue (send order preserved) and `status` stays pending until the
    /// server completes it.
    pub fn send_message(
        &mut self,
        session: SessionId,
        function: u32,
        args: IpcArgs,
        status: Option<RequestStatusId>,
    ) -> KernelResult<MessageId> {
        let session_ref = self.sessions.get(session.0).ok_or(KernelError::NotFound)?;
        let sender = session_ref.owner;
        let server = session_ref.server;

        let msg = self.alloc_message(Message {
            function,
            args,
            sender,
            session: Some(session),
            status,
            free: false,
        });

        self.servers[server.0].queue.push_back(msg);
        self.pending_dispatch.push_back(msg);
        Ok(msg)
    }

    /// Complete a message's reply status and recycle the message.
    pub fn set_request_status(&mut self, mem: &mut Memory, msg: MessageId, code: i32) {
        let Some(message) = self.messages.get(msg.0) else {
            return;
        };
        if let Some(status) = message.status {
            self.complete_request(mem, status, code);
        }
    }

    /// Mark a message slot reusable and drop it from its server's queue.
    pub fn free_message(&mut self, msg: MessageId) {
        if let Some(message) = self.messages.get_mut(msg.0) {
            message.free = true;
            if let Some(session) = message.session {
                let server = self.sessions[session.0].server;
                self.servers[server.0].queue.retain(|&m| m != msg);
            }
        }
    }

    /// Messages waiting for host-side (HLE) service dispatch.
    pub fn take_pending_messages(&mut self) -> Vec<MessageId> {
        self.pending_dispatch.drain(..).collect()
    }

    // ------------------------------------------------------------------
    // Handles

    /// Resolve a host-issued handle against the kernel table.
    pub fn lookup_kernel_handle(&self, handle: Handle) -> Option<ObjectRef> {
        self.kernel_handles.get(handle)
    }

    /// Resolve a handle presented by `tid` against the table its owner
    /// bits name.
    pub fn lookup_handle(&self, tid: ThreadId, handle: Handle) -> Option<ObjectRef> {
        let thread = self.threads.get(tid.0)?;
        match handle.owner() {
            HandleOwner::Thread => thread.handles.get(handle),
            HandleOwner::Process => self.processes[thread.owner.0].handles.get(handle),
            HandleOwner::Kernel => self.kernel_handles.get(handle),
        }
    }

    /// Issue a handle to `object` from the chosen table of `tid`.
    pub fn open_handle(&mut self, tid: ThreadId, object: ObjectRef, owner: HandleOwner) -> Handle {
        match owner {
            HandleOwner::Thread => self.threads[tid.0].handles.add(object),
            HandleOwner::Process => {
                let pid = self.threads[tid.0].owner;
                self.processes[pid.0].handles.add(object)
            }
            HandleOwner::Kernel => self.kernel_handles.add(object),
        }
    }

    /// Duplicate an existing handle into `owner`'s table.
    pub fn duplicate_handle(
        &mut self,
        tid: ThreadId,
        handle: Handle,
        owner: HandleOwner,
    ) -> KernelResult<Handle> {
        let object = self
            .lookup_handle(tid, handle)
            .ok_or(KernelError::InvalidArgument)?;
        Ok(self.open_handle(tid, object, owner))
    }

    /// Close a handle. When the last handle to a closeable object goes
    /// away and no internal reference remains, the object is destroyed.
    pub fn close_handle(&mut self, mem: &mut Memory, tid: ThreadId, handle: Handle) -> KernelResult<()> {
        let object = match handle.owner() {
            HandleOwner::Thread => self.threads[tid.0].handles.remove(handle),
            HandleOwner::Process => {
                let pid = self.threads[tid.0].owner;
                self.processes[pid.0].handles.remove(handle)
            }
            HandleOwner::Kernel => self.kernel_handles.remove(handle),
        };

        let object = object.ok_or(KernelError::InvalidArgument)?;
        if self.handle_count(object) == 0 {
            self.destroy_unreferenced(mem, object);
        }
        Ok(())
    }

    /// How many live handles reference `object` across every table.
    fn handle_count(&self, object: ObjectRef) -> usize {
        let in_threads: usize = self
            .threads
            .iter()
            .map(|(_, t)| t.handles.iter().filter(|&o| o == object).count())
            .sum();
        let in_processes: usize = self
            .processes
            .iter()
            .map(|(_, p)| p.handles.iter().filter(|&o| o == object).count())
            .sum();
        let in_kernel = self.kernel_handles.iter().filter(|&o| o == object).count();
        in_threads + in_processes + in_kernel
    }

    fn destroy_unreferenced(&mut self, mem: &mut Memory, object: ObjectRef) {
        match object {
            ObjectRef::Chunk(id) => {
                if let Some(chunk) = self.chunks.try_remove(id.0) {
                    mem.free(chunk.region);
                }
            }
            ObjectRef::Mutex(id) => {
                let busy = self
                    .mutexes
                    .get(id.0)
                    .is_some_and(|m| !m.is_free() || !m.waiting.is_empty() || !m.suspended.is_empty());
                if !busy {
                    self.mutexes.try_remove(id.0);
                }
            }
            ObjectRef::Semaphore(id) => {
                let busy = self
                    .semaphores
                    .get(id.0)
                    .is_some_and(|s| !s.waiting.is_empty() || !s.suspended.is_empty());
                if !busy {
                    self.semaphores.try_remove(id.0);
                }
            }
            ObjectRef::Session(id) => {
                self.sessions.try_remove(id.0);
            }
            // Properties persist for late subscribers; processes and
            // threads outlive their handles until they terminate.
            ObjectRef::Property(_)
            | ObjectRef::Process(_)
            | ObjectRef::Thread(_)
            | ObjectRef::Server(_) => {}
        }
    }

    /// Find a global object by kind and name and hand out a kernel handle.
    pub fn open_by_name(&mut self, kind: ObjectKind, name: &str) -> Option<Handle> {
        let object = match kind {
            ObjectKind::Mutex => self.find_mutex_by_name(name).map(ObjectRef::Mutex),
            ObjectKind::Server => self.find_server(name).map(ObjectRef::Server),
            ObjectKind::Semaphore => self
                .semaphores
                .iter()
                .find(|(_, s)| s.info.name.as_deref() == Some(name))
                .map(|(k, _)| ObjectRef::Semaphore(SemaphoreId(k))),
            ObjectKind::Process => self
                .processes
                .iter()
                .find(|(_, p)| p.info.name.as_deref() == Some(name))
                .map(|(k, _)| ObjectRef::Process(ProcessId(k))),
            ObjectKind::Thread => self
                .threads
                .iter()
                .find(|(_, t)| t.info.name.as_deref() == Some(name))
                .map(|(k, _)| ObjectRef::Thread(ThreadId(k))),
            _ => None,
        }?;

        Some(self.kernel_handles.add(object))
    }

    // ------------------------------------------------------------------
    // Scheduling

    /// Context-switch: park the outgoing thread (re-queueing it when its
    /// slice simply ran out), then load the highest-priority ready thread.
    pub fn reschedule(&mut self, cpu: &mut dyn CpuCore, now: u64) {
        if let Some(current) = self.scheduler.current() {
            cpu.save_context(&mut self.threads[current.0].ctx);

            let thread = &mut self.threads[current.0];
            if thread.state == ThreadState::Run {
                thread.state = ThreadState::Ready;
                let priority = thread.real_priority;
                self.scheduler.enqueue(current, priority);
            }
            self.scheduler.set_current(None);
        }

        if let Some(next) = self.scheduler.pick_next() {
            let thread = &mut self.threads[next.0];
            thread.state = ThreadState::Run;
            thread.last_run = now;
            cpu.load_context(&thread.ctx);
            self.scheduler.set_current(Some(next));
        }
    }
}
