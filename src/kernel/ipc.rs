//! IPC plumbing
//!
//! Sessions connect client threads to named servers; messages carry a
//! function code, four argument slots and the reply status. A request
//! status is a guest-memory word that is written exactly once on
//! completion; completing it signals the owning thread's request
//! semaphore.
//!
//! Messages are pooled: a completed message is marked free and recycled by
//! the next send.

use super::object::ObjectInfo;
use super::thread::ThreadId;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestStatusId(pub usize);

/// Completion state of an asynchronous request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Completed(i32),
}

/// An asynchronous completion cell. `addr` is the guest-memory word the
/// completion code lands in.
#[derive(Debug)]
pub struct RequestStatus {
    pub owner: ThreadId,
    pub addr: u32,
    pub state: RequestState,
}

impl RequestStatus {
    pub fn is_pending(&self) -> bool {
        self.state == RequestState::Pending
    }
}

/// One of a message's four argument slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpcArg {
    #[default]
    Empty,
    Int(i32),
    /// Handle to a kernel object, passed by value
    Handle(u32),
    /// 8-bit descriptor in guest memory
    Des8 {
        addr: u32,
        len: u32,
    },
    /// 16-bit descriptor in guest memory (length in characters)
    Des16 {
        addr: u32,
        len: u32,
    },
    /// Writable 8-bit descriptor; `max_len` bounds the reply
    Des8Out {
        addr: u32,
        max_len: u32,
    },
}

/// The four argument slots of a message.
pub type IpcArgs = [IpcArg; 4];

/// A message in flight from a client thread to a server. A thread's
/// reserved sync message has no session until it is sent.
#[derive(Debug)]
pub struct Message {
    pub function: u32,
    pub args: IpcArgs,
    pub sender: ThreadId,
    pub session: Option<SessionId>,
    pub status: Option<RequestStatusId>,
    pub free: bool,
}

/// A client's connection to a server.
#[derive(Debug)]
pub struct Session {
    pub info: ObjectInfo,
    pub server: ServerId,
    pub owner: ThreadId,
}

/// A named server with its delivery queue. Delivery order is send order.
#[derive(Debug)]
pub struct Server {
    pub info: ObjectInfo,
    pub queue: VecDeque<MessageId>,
    /// The host-side thread the server is bound to.
    pub owner: Option<ThreadId>,
}
