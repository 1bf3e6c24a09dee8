//! Integration tests
//!
//! Cross-subsystem scenarios: scheduling under priority inheritance,
//! property publish/subscribe, timed sleep cancellation, path algebra and
//! the window server's command-buffer protocol, driven through the public
//! crate surface.

use symemu::EpocVersion;
use symemu::cpu::IdleCpu;
use symemu::error::{KERR_CANCEL, KERR_NONE, KREQUEST_PENDING};
use symemu::kernel::{
    Access, IpcArg, IpcArgs, Kernel, ObjectRef, ProcessId, RequestState, RequestStatusId,
    ThreadId, ThreadPriority,
};
use symemu::loader::{ImageTable, ProcessImage};
use symemu::memory::{MemArea, Memory, MemoryMap, Protection};
use symemu::path;
use symemu::services::window::{
    BASE_HANDLE, CL_OP_REDRAW_READY, ClientOp, GC_OP_ACTIVATE, MSG_ASYNC_FLAG,
    MSG_COMMAND_BUFFER, MSG_INIT, SD_OP_PIXEL_SIZE, SERVER_NAME, StubGraphicsDriver, Vec2,
    WindowServer, WsObjectKind,
};
use symemu::services::{IpcContext, Service, ServiceRegistry};
use symemu::system::{LOOP_CONTINUE, System};
use symemu::timing::Timing;

// ----------------------------------------------------------------------
// Harness

struct Emu {
    kernel: Kernel,
    mem: Memory,
    timing: Timing,
    cpu: IdleCpu,
    process: ProcessId,
}

impl Emu {
    fn new() -> Self {
        let mut kernel = Kernel::new(EpocVersion::Epoc9);
        let mut mem = Memory::new(MemoryMap::eka2());
        let mut timing = Timing::new();
        kernel.init(&mut timing);

        let handle = kernel
            .spawn_new_process(&mut mem, &ProcessImage::with_name("host.exe"), "")
            .expect("spawn");
        let Some(ObjectRef::Process(process)) = kernel.lookup_kernel_handle(handle) else {
            panic!("spawn handle is not a process");
        };

        Self {
            kernel,
            mem,
            timing,
            cpu: IdleCpu::new(),
            process,
        }
    }

    fn thread(&mut self, name: &str, priority: ThreadPriority) -> ThreadId {
        let tid = self
            .kernel
            .create_thread(&mut self.mem, self.process, name, 0, 0x1000, priority, 0)
            .expect("create thread");
        tid
    }

    /// A fresh committed guest buffer; returns its base address.
    fn guest_buffer(&mut self, size: u32) -> u32 {
        let region = self
            .mem
            .reserve(MemArea::SharedData, size, Protection::ReadWrite)
            .expect("reserve");
        self.mem.commit(region, 0, size).expect("commit");
        self.mem.region_base(region).expect("base")
    }

    fn status(&mut self, owner: ThreadId) -> (RequestStatusId, u32) {
        let addr = self.guest_buffer(0x1000);
        let id = self.kernel.create_request_status(&mut self.mem, owner, addr);
        (id, addr)
    }

    fn reschedule(&mut self) {
        let now = self.timing.ticks();
        self.kernel.reschedule(&mut self.cpu, now);
    }
}

// ----------------------------------------------------------------------
// Scenario: priority scheduling

#[test]
fn scheduler_picks_highest_priority_then_suspension_falls_back() {
    let mut emu = Emu::new();
    let t1 = emu.thread("t1", ThreadPriority::Normal);
    let t2 = emu.thread("t2", ThreadPriority::More);
    emu.kernel.resume_thread(t1);
    emu.kernel.resume_thread(t2);

    emu.reschedule();
    assert_eq!(emu.kernel.current_thread(), Some(t2));

    emu.kernel.suspend_thread(t2);
    emu.reschedule();
    assert_eq!(emu.kernel.current_thread(), Some(t1));
}

// ----------------------------------------------------------------------
// Scenario: priority inheritance

#[test]
fn mutex_owner_inherits_waiter_priority_until_release() {
    let mut emu = Emu::new();
    let t1 = emu.thread("t1", ThreadPriority::Normal);
    let t2 = emu.thread("t2", ThreadPriority::MuchMore);
    let t3 = emu.thread("t3", ThreadPriority::More);
    let mutex = emu.kernel.create_mutex(Some("m"), Access::Local).unwrap();

    emu.kernel.resume_thread(t1);
    emu.reschedule();
    emu.kernel.wait_mutex(t1, mutex);

    emu.kernel.wait_mutex(t2, mutex);
    emu.kernel.resume_thread(t3);

    // The boosted holder beats the ready middle-priority thread.
    emu.reschedule();
    assert_eq!(emu.kernel.current_thread(), Some(t1));
    assert_eq!(emu.kernel.thread(t1).unwrap().real_priority, 20);

    emu.kernel.signal_mutex(t1, mutex).unwrap();
    assert_eq!(emu.kernel.thread(t1).unwrap().real_priority, 0);

    emu.reschedule();
    assert_eq!(emu.kernel.current_thread(), Some(t2));
}

// ----------------------------------------------------------------------
// Scenario: property publish/subscribe

#[test]
fn property_set_completes_subscriber_and_stores_payload() {
    let mut emu = Emu::new();
    let t1 = emu.thread("t1", ThreadPriority::Normal);
    emu.kernel
        .define_prop(1, 2, symemu::kernel::PropertyType::Bin, 16);

    let (status, addr) = emu.status(t1);
    emu.kernel.subscribe_prop(1, 2, t1, status).unwrap();
    assert_eq!(emu.mem.read_i32(addr).unwrap(), KREQUEST_PENDING);

    emu.kernel.set_prop_bin(&mut emu.mem, 1, 2, b"hello").unwrap();

    assert_eq!(emu.mem.read_i32(addr).unwrap(), KERR_NONE);
    assert_eq!(
        emu.kernel.request_status(status).unwrap().state,
        RequestState::Completed(KERR_NONE)
    );
    assert_eq!(emu.kernel.get_prop_bin(1, 2).unwrap(), b"hello".to_vec());
}

// ----------------------------------------------------------------------
// Scenario: path algebra

#[test]
fn absolute_path_symbian_forms() {
    assert_eq!(
        path::absolute_path("file.txt", "C:\\data", true),
        "C:\\data\\file.txt"
    );
    assert_eq!(path::absolute_path("\\a\\b", "C:\\cwd", true), "C:\\a\\b");
    assert_eq!(
        path::absolute_path("D:x", "C:\\cwd\\sub", true),
        "D:\\cwd\\sub\\x"
    );
}

#[test]
fn path_laws_hold() {
    let cwd = "C:\\work";
    for p in ["file.txt", "\\rooted\\x", "D:rel", "E:\\abs\\path"] {
        let once = path::absolute_path(p, cwd, true);
        assert_eq!(path::absolute_path(&once, cwd, true), once);
    }

    for p in ["C:\\a\\b.txt", "\\a\\b", "plain\\rel"] {
        let root = path::root_path(p, true);
        let rel = path::relative_path(p, true);
        assert_eq!(path::add_path(&root, rel, true), p);
    }
}

// ----------------------------------------------------------------------
// Scenario: sleep cancellation

#[test]
fn cancel_sleep_mid_way_completes_with_cancel() {
    let mut emu = Emu::new();
    let t1 = emu.thread("t1", ThreadPriority::Normal);
    emu.kernel.resume_thread(t1);
    emu.reschedule();

    let (status, addr) = emu.status(t1);
    emu.kernel
        .sleep_nof(&mut emu.timing, t1, status, 100_000);
    assert_eq!(emu.timing.pending_count(), 1);

    emu.timing.add_ticks(50_000);
    emu.kernel.cancel_sleep(&mut emu.mem, &mut emu.timing, t1);

    assert_eq!(emu.mem.read_i32(addr).unwrap(), KERR_CANCEL);
    assert_eq!(emu.timing.pending_count(), 0);

    // Nothing fires later.
    emu.timing.add_ticks(100_000);
    assert!(emu.timing.advance().is_empty());
}

// ----------------------------------------------------------------------
// Window server

/// Build one wire command.
fn ws_command(op: u16, obj_handle: Option<u32>, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let op = if obj_handle.is_some() { op | 0x8000 } else { op };
    out.extend_from_slice(&op.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    if let Some(handle) = obj_handle {
        out.extend_from_slice(&handle.to_le_bytes());
    }
    out.extend_from_slice(payload);
    out
}

struct WsHarness {
    emu: Emu,
    server: WindowServer,
    session: symemu::kernel::SessionId,
    client: ThreadId,
    uid: u32,
}

impl WsHarness {
    fn new() -> Self {
        let mut emu = Emu::new();
        let client = emu.thread("ws-client", ThreadPriority::Normal);

        let mut server = WindowServer::new(Box::new(StubGraphicsDriver));
        emu.kernel.create_server(SERVER_NAME, None).unwrap();
        let session = emu.kernel.create_session(client, SERVER_NAME).unwrap();
        let uid = emu.kernel.session(session).unwrap().info.id;

        // Connect.
        let (status, _) = emu.status(client);
        emu.kernel
            .send_message(session, MSG_INIT, IpcArgs::default(), Some(status))
            .unwrap();
        Self::drain(&mut emu, &mut server);
        assert_eq!(
            emu.kernel.request_status(status).unwrap().state,
            RequestState::Completed(uid as i32)
        );

        Self {
            emu,
            server,
            session,
            client,
            uid,
        }
    }

    fn drain(emu: &mut Emu, server: &mut WindowServer) {
        for msg in emu.kernel.take_pending_messages() {
            let mut ctx = IpcContext {
                kernel: &mut emu.kernel,
                mem: &mut emu.mem,
                msg,
            };
            if !server.handle_message(&mut ctx) {
                server.on_unhandled_opcode(&mut ctx);
            }
            emu.kernel.free_message(msg);
        }
    }

    /// Send one command buffer; returns the completion code, if any.
    fn send_buffer(&mut self, buffer: &[u8]) -> Option<i32> {
        let addr = self.emu.guest_buffer(buffer.len().max(1) as u32);
        self.emu.mem.write_bytes(addr, buffer).unwrap();

        let (status, _) = self.emu.status(self.client);
        let mut args = IpcArgs::default();
        args[0] = IpcArg::Des8 {
            addr,
            len: buffer.len() as u32,
        };

        self.emu
            .kernel
            .send_message(self.session, MSG_COMMAND_BUFFER, args, Some(status))
            .unwrap();
        Self::drain(&mut self.emu, &mut self.server);

        match self.emu.kernel.request_status(status).unwrap().state {
            RequestState::Completed(code) => Some(code),
            RequestState::Pending => None,
        }
    }
}

#[test]
fn window_server_concatenated_create_commands() {
    let mut ws = WsHarness::new();

    // Two commands in one stream: a screen device, then a window group
    // addressed at that device with an unknown parent id.
    let mut payload = Vec::new();
    payload.extend_from_slice(&0i32.to_le_bytes());
    payload.extend_from_slice(&0u32.to_le_bytes());
    let mut buffer = ws_command(ClientOp::CreateScreenDevice.to_u16(), None, &payload);

    let screen_handle = BASE_HANDLE + 2;
    let mut group_payload = Vec::new();
    group_payload.extend_from_slice(&1u32.to_le_bytes()); // client handle
    group_payload.extend_from_slice(&1u32.to_le_bytes()); // focus
    group_payload.extend_from_slice(&0u32.to_le_bytes()); // parent id
    group_payload.extend_from_slice(&screen_handle.to_le_bytes());
    buffer.extend_from_slice(&ws_command(
        ClientOp::CreateWindowGroup.to_u16(),
        Some(screen_handle),
        &group_payload,
    ));

    // The first creation's reply lands in the message status.
    assert_eq!(ws.send_buffer(&buffer), Some(screen_handle as i32));

    let client = ws.server.client(ws.uid).unwrap();
    assert_eq!(client.objects.len(), 3);

    // Handle bounds: base < h <= base + len.
    assert!(client.object(BASE_HANDLE).is_none());
    assert!(client.object(screen_handle).is_some());

    let group = client.object(BASE_HANDLE + 3).unwrap();
    match &group.kind {
        WsObjectKind::Window {
            parent, device, ..
        } => {
            // Unknown parent id fell back to the root window.
            assert_eq!(*parent, Some(client.root));
            assert!(device.is_some());
        }
        other => panic!("expected a window group, got {:?}", other),
    }

    // Focus was requested.
    assert!(client.focus_group.is_some());
}

#[test]
fn window_server_screen_device_queries() {
    let mut ws = WsHarness::new();

    let mut payload = Vec::new();
    payload.extend_from_slice(&0i32.to_le_bytes());
    payload.extend_from_slice(&0u32.to_le_bytes());
    let buffer = ws_command(ClientOp::CreateScreenDevice.to_u16(), None, &payload);
    let device = ws.send_buffer(&buffer).unwrap() as u32;

    // PixelSize writes the panel size through the reply descriptor.
    let reply_addr = ws.emu.guest_buffer(0x1000);
    let cmd = ws_command(SD_OP_PIXEL_SIZE, Some(device), &[]);
    let buf_addr = ws.emu.guest_buffer(cmd.len() as u32);
    ws.emu.mem.write_bytes(buf_addr, &cmd).unwrap();

    let (status, _) = ws.emu.status(ws.client);
    let mut args = IpcArgs::default();
    args[0] = IpcArg::Des8 {
        addr: buf_addr,
        len: cmd.len() as u32,
    };
    args[1] = IpcArg::Des8Out {
        addr: reply_addr,
        max_len: 8,
    };
    ws.emu
        .kernel
        .send_message(ws.session, MSG_COMMAND_BUFFER, args, Some(status))
        .unwrap();
    WsHarness::drain(&mut ws.emu, &mut ws.server);

    assert_eq!(ws.emu.mem.read_i32(reply_addr).unwrap(), 360);
    assert_eq!(ws.emu.mem.read_i32(reply_addr + 4).unwrap(), 640);
    assert_eq!(
        ws.emu.kernel.request_status(status).unwrap().state,
        RequestState::Completed(KERR_NONE)
    );
}

#[test]
fn window_server_gc_activate_replies_device_id() {
    let mut ws = WsHarness::new();

    let mut payload = Vec::new();
    payload.extend_from_slice(&0i32.to_le_bytes());
    payload.extend_from_slice(&0u32.to_le_bytes());
    let device = ws
        .send_buffer(&ws_command(ClientOp::CreateScreenDevice.to_u16(), None, &payload))
        .unwrap() as u32;

    let mut group_payload = Vec::new();
    group_payload.extend_from_slice(&1u32.to_le_bytes());
    group_payload.extend_from_slice(&0u32.to_le_bytes());
    group_payload.extend_from_slice(&0u32.to_le_bytes());
    group_payload.extend_from_slice(&device.to_le_bytes());
    let group = ws
        .send_buffer(&ws_command(
            ClientOp::CreateWindowGroup.to_u16(),
            None,
            &group_payload,
        ))
        .unwrap() as u32;

    let gc = ws
        .send_buffer(&ws_command(ClientOp::CreateGc.to_u16(), None, &[]))
        .unwrap() as u32;

    // Activate binds the window and replies with its device's id.
    let code = ws
        .send_buffer(&ws_command(GC_OP_ACTIVATE, Some(gc), &group.to_le_bytes()))
        .unwrap();
    assert_eq!(code, device as i32);
}

#[test]
fn window_server_sprite_invalid_window_falls_back_to_root() {
    let mut ws = WsHarness::new();

    let mut payload = Vec::new();
    payload.extend_from_slice(&0i32.to_le_bytes()); // invalid window handle
    payload.extend_from_slice(&Vec2::new(10, 20).to_le_bytes());
    payload.extend_from_slice(&0i32.to_le_bytes());
    let sprite = ws
        .send_buffer(&ws_command(ClientOp::CreateSprite.to_u16(), None, &payload))
        .unwrap() as u32;

    let client = ws.server.client(ws.uid).unwrap();
    match &client.object(sprite).unwrap().kind {
        WsObjectKind::Sprite {
            attached_window,
            position,
        } => {
            assert_eq!(*attached_window, Some(client.root));
            assert_eq!(*position, Vec2::new(10, 20));
        }
        other => panic!("expected a sprite, got {:?}", other),
    }
}

#[test]
fn window_server_async_redraw_ready_completes_benignly() {
    let mut ws = WsHarness::new();

    let (status, _) = ws.emu.status(ws.client);
    ws.emu
        .kernel
        .send_message(
            ws.session,
            CL_OP_REDRAW_READY | MSG_ASYNC_FLAG,
            IpcArgs::default(),
            Some(status),
        )
        .unwrap();
    WsHarness::drain(&mut ws.emu, &mut ws.server);
    assert_eq!(
        ws.emu.kernel.request_status(status).unwrap().state,
        RequestState::Completed(KERR_NONE)
    );

    // An unknown async opcode is ignored; the status stays pending.
    let (other, _) = ws.emu.status(ws.client);
    ws.emu
        .kernel
        .send_message(
            ws.session,
            0x7777 | MSG_ASYNC_FLAG,
            IpcArgs::default(),
            Some(other),
        )
        .unwrap();
    WsHarness::drain(&mut ws.emu, &mut ws.server);
    assert_eq!(
        ws.emu.kernel.request_status(other).unwrap().state,
        RequestState::Pending
    );
}

// ----------------------------------------------------------------------
// IPC ordering law

struct RecordingService {
    seen: std::rc::Rc<std::cell::RefCell<Vec<u32>>>,
}

impl Service for RecordingService {
    fn name(&self) -> &'static str {
        "!Recorder"
    }

    fn handle_message(&mut self, ctx: &mut IpcContext) -> bool {
        self.seen.borrow_mut().push(ctx.function());
        ctx.set_request_status(KERR_NONE);
        true
    }
}

#[test]
fn messages_dispatch_in_send_order() {
    let mut emu = Emu::new();
    let client = emu.thread("client", ThreadPriority::Normal);

    let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let mut registry = ServiceRegistry::new();
    registry
        .register(&mut emu.kernel, Box::new(RecordingService { seen: seen.clone() }))
        .unwrap();

    let session = emu.kernel.create_session(client, "!Recorder").unwrap();
    for function in [10, 11, 12, 13] {
        emu.kernel
            .send_message(session, function, IpcArgs::default(), None)
            .unwrap();
    }

    registry.dispatch_pending(&mut emu.kernel, &mut emu.mem);
    assert_eq!(*seen.borrow(), vec![10, 11, 12, 13]);
}

// ----------------------------------------------------------------------
// Full-system smoke

#[test]
fn system_boots_runs_and_exits() {
    let mut table = ImageTable::new();
    table.register(0x2000_0001, ProcessImage::with_name("app.exe"));

    let mut sys = System::new();
    sys.set_symbian_version_use(EpocVersion::Epoc94);
    sys.set_image_loader(Box::new(table));
    sys.init();

    sys.load(0x2000_0001).unwrap();
    assert_eq!(sys.loop_once(), LOOP_CONTINUE);
    let tid = sys.kernel().current_thread().expect("a thread runs");

    // Idle loop keeps continuing while the thread lives.
    assert_eq!(sys.loop_once(), LOOP_CONTINUE);

    let (kernel, mem, timing) = sys.kernel_and_deps();
    kernel.stop_thread(mem, timing, tid, 0);
    assert_eq!(sys.loop_once(), symemu::system::LOOP_EXIT);
    assert!(sys.should_exit());
}

#[test]
fn system_window_server_is_reachable() {
    let mut table = ImageTable::new();
    table.register(1, ProcessImage::with_name("shell.exe"));

    let mut sys = System::new();
    sys.set_image_loader(Box::new(table));
    sys.init();
    sys.load(1).unwrap();
    sys.loop_once();

    let tid = sys.kernel().current_thread().unwrap();
    let session = sys
        .kernel_mut()
        .create_session(tid, SERVER_NAME)
        .expect("window server registered at init");

    // Drive Init through the real system loop.
    let (kernel, mem, _) = sys.kernel_and_deps();
    let region = mem
        .reserve(MemArea::SharedData, 0x1000, Protection::ReadWrite)
        .unwrap();
    mem.commit(region, 0, 0x1000).unwrap();
    let addr = mem.region_base(region).unwrap();
    let status = kernel.create_request_status(mem, tid, addr);
    kernel
        .send_message(session, MSG_INIT, IpcArgs::default(), Some(status))
        .unwrap();

    sys.loop_once();
    assert!(matches!(
        sys.kernel().request_status(status).unwrap().state,
        RequestState::Completed(_)
    ));
}
