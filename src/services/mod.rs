//! System servers
//!
//! Host-side (HLE) implementations of Symbian system servers. A service
//! registers a named kernel server; client sessions send messages through
//! the kernel, and the system loop hands queued messages to the owning
//! service in send order. `IpcContext` gives a service typed access to a
//! message's argument slots and its reply status.

pub mod window;

use crate::error::KernelResult;
use crate::kernel::{IpcArg, Kernel, MessageId, SessionId, ThreadId};
use crate::memory::Memory;
use std::collections::HashMap;

/// Everything a service needs to act on one message.
pub struct IpcContext<'a> {
    pub kernel: &'a mut Kernel,
    pub mem: &'a mut Memory,
    pub msg: MessageId,
}

impl IpcContext<'_> {
    pub fn function(&self) -> u32 {
        self.kernel.message(self.msg).map(|m| m.function).unwrap_or(0)
    }

    pub fn sender(&self) -> Option<ThreadId> {
        self.kernel.message(self.msg).map(|m| m.sender)
    }

    pub fn session(&self) -> Option<SessionId> {
        self.kernel.message(self.msg).and_then(|m| m.session)
    }

    /// The guest-unique id of the sending session.
    pub fn session_uid(&self) -> u32 {
        self.session()
            .and_then(|s| self.kernel.session(s))
            .map(|s| s.info.id)
            .unwrap_or(0)
    }

    pub fn arg(&self, slot: usize) -> IpcArg {
        self.kernel
            .message(self.msg)
            .and_then(|m| m.args.get(slot).copied())
            .unwrap_or(IpcArg::Empty)
    }

    /// Copy an 8-bit descriptor argument out of guest memory.
    pub fn read_arg_bytes(&self, slot: usize) -> Option<Vec<u8>> {
        match self.arg(slot) {
            IpcArg::Des8 { addr, len } => {
                let mut buf = vec![0u8; len as usize];
                self.mem.read_bytes(addr, &mut buf).ok()?;
                Some(buf)
            }
            _ => None,
        }
    }

    pub fn read_arg_int(&self, slot: usize) -> Option<i32> {
        match self.arg(slot) {
            IpcArg::Int(v) => Some(v),
            IpcArg::Handle(h) => Some(h as i32),
            _ => None,
        }
    }

    /// Write a packaged value back through an output descriptor slot.
    /// Returns the number of bytes written.
    pub fn write_arg_pkg(&mut self, slot: usize, payload: &[u8]) -> KernelResult<usize> {
        match self.arg(slot) {
            IpcArg::Des8Out { addr, max_len } => {
                let len = payload.len().min(max_len as usize);
                self.mem.write_bytes(addr, &payload[..len])?;
                Ok(len)
            }
            _ => Err(crate::error::KernelError::InvalidArgument),
        }
    }

    /// Complete the message's reply status.
    pub fn set_request_status(&mut self, code: i32) {
        self.kernel.set_request_status(self.mem, self.msg, code);
    }
}

/// A host-side server implementation.
pub trait Service {
    /// The kernel server name clients connect to.
    fn name(&self) -> &'static str;

    /// Handle one message. Return false when the function code is not
    /// one this service implements.
    fn handle_message(&mut self, ctx: &mut IpcContext) -> bool;

    /// Called for function codes `handle_message` rejected.
    fn on_unhandled_opcode(&mut self, _ctx: &mut IpcContext) {}
}

/// Owns every registered service and routes queued messages to them.
#[derive(Default)]
pub struct ServiceRegistry {
    services: Vec<Box<dyn Service>>,
    by_name: HashMap<String, usize>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service and create its kernel server object.
    pub fn register(&mut self, kernel: &mut Kernel, service: Box<dyn Service>) -> KernelResult<()> {
        let name = service.name().to_string();
        kernel.create_server(&name, None)?;
        self.by_name.insert(name, self.services.len());
        self.services.push(service);
        Ok(())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Box<dyn Service>> {
        let idx = *self.by_name.get(name)?;
        self.services.get_mut(idx)
    }

    /// Deliver every queued message to its service, in send order.
    pub fn dispatch_pending(&mut self, kernel: &mut Kernel, mem: &mut Memory) {
        for msg in kernel.take_pending_messages() {
            let Some(session) = kernel.message(msg).and_then(|m| m.session) else {
                continue;
            };
            let Some(server) = kernel.session(session).map(|s| s.server) else {
                continue;
            };
            let Some(name) = kernel
                .server(server)
                .and_then(|s| s.info.name.clone())
            else {
                continue;
            };

            let Some(idx) = self.by_name.get(&name).copied() else {
                log::warn!("message for unregistered server {}", name);
                continue;
            };

            let service = &mut self.services[idx];
            let mut ctx = IpcContext {
                kernel: &mut *kernel,
                mem: &mut *mem,
                msg,
            };
            if !service.handle_message(&mut ctx) {
                log::warn!(
                    "{}: unhandled function {:#x}",
                    name,
                    ctx.function()
                );
                service.on_unhandled_opcode(&mut ctx);
            }

            kernel.free_message(msg);
        }
    }
}
