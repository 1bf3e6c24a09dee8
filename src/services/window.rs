//! Window server
//!
//! The exemplary system server: it owns per-client object trees and
//! terminates the command-buffer protocol every Symbian server speaks. No
//! rasterization happens here: commands mutate server state and complete
//! request statuses, nothing more.
//!
//! Wire format, little-endian: `u16 op, u16 cmd_len`, then a `u32` object
//! handle when bit 15 of `op` is set, then `cmd_len` payload bytes.
//! Commands concatenate until the buffer ends.

use super::{IpcContext, Service};
use crate::error::KERR_NONE;
use std::collections::HashMap;

/// Client object handles count up from here, one per created object.
pub const BASE_HANDLE: u32 = 0x4000_0000;

/// Server-level message functions.
pub const MSG_INIT: u32 = 0;
pub const MSG_COMMAND_BUFFER: u32 = 1;
pub const MSG_SHUTDOWN: u32 = 2;
pub const MSG_SYNC_MSG_BUF: u32 = 3;

/// Set on a message function for fire-and-forget asynchronous requests.
pub const MSG_ASYNC_FLAG: u32 = 0x010000;

/// Asynchronous redraw-ready notification, completed benignly.
pub const CL_OP_REDRAW_READY: u32 = 9;

/// Client-level opcodes carried inside command buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientOp {
    RestoreDefaultHotKey,
    EventReady,
    CreateWindowGroup,
    CreateSprite,
    CreateGc,
    CreateScreenDevice,
    GetFocusWindowGroup,
}

impl ClientOp {
    pub fn from_u16(op: u16) -> Option<ClientOp> {
        match op {
            3 => Some(ClientOp::RestoreDefaultHotKey),
            5 => Some(ClientOp::EventReady),
            35 => Some(ClientOp::CreateWindowGroup),
            36 => Some(ClientOp::CreateSprite),
            40 => Some(ClientOp::CreateGc),
            43 => Some(ClientOp::CreateScreenDevice),
            54 => Some(ClientOp::GetFocusWindowGroup),
            _ => None,
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            ClientOp::RestoreDefaultHotKey => 3,
            ClientOp::EventReady => 5,
            ClientOp::CreateWindowGroup => 35,
            ClientOp::CreateSprite => 36,
            ClientOp::CreateGc => 40,
            ClientOp::CreateScreenDevice => 43,
            ClientOp::GetFocusWindowGroup => 54,
        }
    }
}

/// Screen-device opcodes.
pub const SD_OP_PIXEL_SIZE: u16 = 1;
pub const SD_OP_TWIPS_SIZE: u16 = 2;

/// Graphics-context opcodes.
pub const GC_OP_ACTIVATE: u16 = 1;

/// Reply descriptor convention: commands read from slot 0, reply into
/// slot 1.
pub const CMD_SLOT: usize = 0;
pub const REPLY_SLOT: usize = 1;

/// A 2D size/position pair on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Vec2 {
    pub x: i32,
    pub y: i32,
}

impl Vec2 {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn to_le_bytes(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&self.x.to_le_bytes());
        out[4..].copy_from_slice(&self.y.to_le_bytes());
        out
    }
}

impl std::ops::Mul<i32> for Vec2 {
    type Output = Vec2;

    fn mul(self, rhs: i32) -> Vec2 {
        Vec2::new(self.x * rhs, self.y * rhs)
    }
}

/// The graphics driver contract; the real client lives outside the core.
pub trait GraphicsDriver {
    fn screen_size(&self) -> Vec2;
}

/// Fixed-size panel for headless operation and tests.
pub struct StubGraphicsDriver;

impl GraphicsDriver for StubGraphicsDriver {
    fn screen_size(&self) -> Vec2 {
        Vec2::new(360, 640)
    }
}

/// One decoded command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsCmd {
    pub op: u16,
    pub obj_handle: Option<u32>,
    pub payload: Vec<u8>,
}

/// Split a command buffer into commands. A truncated trailing command is
/// dropped with a warning.
pub fn parse_command_buffer(data: &[u8]) -> Vec<WsCmd> {
    let mut cmds = Vec::new();
    let mut at = 0usize;

    while at + 4 <= data.len() {
        let mut op = u16::from_le_bytes([data[at], data[at + 1]]);
        let cmd_len = u16::from_le_bytes([data[at + 2], data[at + 3]]) as usize;
        at += 4;

        let obj_handle = if op & 0x8000 != 0 {
            op &= !0x8000;
            if at + 4 > data.len() {
                log::warn!("command buffer truncated in object handle");
                return cmds;
            }
            let handle = u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
            at += 4;
            Some(handle)
        } else {
            None
        };

        if at + cmd_len > data.len() {
            log::warn!("command buffer truncated in payload, op {:#x}", op);
            return cmds;
        }

        cmds.push(WsCmd {
            op,
            obj_handle,
            payload: data[at..at + cmd_len].to_vec(),
        });
        at += cmd_len;
    }

    cmds
}

fn payload_u32(payload: &[u8], at: usize) -> Option<u32> {
    payload
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// What kind of window a window object is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowType {
    Normal,
    Group,
    TopClient,
    Client,
}

/// Per-kind object payload.
#[derive(Debug)]
pub enum WsObjectKind {
    Window {
        win_type: WindowType,
        parent: Option<usize>,
        children: Vec<usize>,
        /// Object index of the attached screen device.
        device: Option<usize>,
        priority: u16,
    },
    ScreenDevice {
        screen: i32,
    },
    GraphicContext {
        attached_window: Option<usize>,
    },
    Sprite {
        attached_window: Option<usize>,
        position: Vec2,
    },
}

/// Borrow-free discriminant for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WsKindTag {
    Window,
    ScreenDevice,
    GraphicContext,
    Sprite,
}

impl WsObjectKind {
    fn tag(&self) -> WsKindTag {
        match self {
            WsObjectKind::Window { .. } => WsKindTag::Window,
            WsObjectKind::ScreenDevice { .. } => WsKindTag::ScreenDevice,
            WsObjectKind::GraphicContext { .. } => WsKindTag::GraphicContext,
            WsObjectKind::Sprite { .. } => WsKindTag::Sprite,
        }
    }

    fn root_window() -> Self {
        WsObjectKind::Window {
            win_type: WindowType::Normal,
            parent: None,
            children: Vec::new(),
            device: None,
            priority: 0,
        }
    }
}

/// One client-side object.
#[derive(Debug)]
pub struct WsObject {
    pub id: u32,
    pub kind: WsObjectKind,
}

/// Per-session client record: the object list and the window tree rooted
/// at `root`.
#[derive(Debug)]
pub struct WsClient {
    pub session_uid: u32,
    /// Slot index + 1 + `BASE_HANDLE` is the object's handle. Deleted
    /// objects leave a dead slot so handles are never reused.
    pub objects: Vec<Option<WsObject>>,
    pub root: usize,
    pub primary_device: Option<usize>,
    pub focus_group: Option<usize>,
}

impl WsClient {
    pub fn new(session_uid: u32) -> Self {
        let mut client = Self {
            session_uid,
            objects: Vec::new(),
            root: 0,
            primary_device: None,
            focus_group: None,
        };
        client.add_object(WsObjectKind::root_window());
        client
    }

    /// Insert an object; its id (and handle) is `BASE_HANDLE` plus its
    /// one-based position.
    pub fn add_object(&mut self, kind: WsObjectKind) -> u32 {
        let id = BASE_HANDLE + self.objects.len() as u32 + 1;
        self.objects.push(Some(WsObject { id, kind }));
        id
    }

    /// Map a handle to its object index. Dead or out-of-range handles do
    /// not resolve.
    pub fn object_index(&self, handle: u32) -> Option<usize> {
        if handle <= BASE_HANDLE || handle > BASE_HANDLE + self.objects.len() as u32 {
            log::warn!("object handle {:#x} is invalid", handle);
            return None;
        }
        let index = (handle - 1 - BASE_HANDLE) as usize;
        self.objects[index].as_ref().map(|_| index)
    }

    pub fn object(&self, handle: u32) -> Option<&WsObject> {
        self.objects[self.object_index(handle)?].as_ref()
    }

    /// Drop an object, leaving its handle slot dead.
    pub fn delete_object(&mut self, handle: u32) -> bool {
        match self.object_index(handle) {
            Some(index) if index != self.root => {
                self.objects[index] = None;
                true
            }
            _ => false,
        }
    }

    fn object_id(&self, index: usize) -> u32 {
        self.objects[index].as_ref().map(|o| o.id).unwrap_or(0)
    }

    /// Depth-first search of the window tree for a window object id.
    pub fn find_window_by_id(&self, from: usize, id: u32) -> Option<usize> {
        let object = self.objects[from].as_ref()?;
        if object.id == id {
            return Some(from);
        }
        let WsObjectKind::Window { children, .. } = &object.kind else {
            return None;
        };
        children
            .iter()
            .find_map(|&child| self.find_window_by_id(child, id))
    }

    /// Give every group window without a screen device the primary one.
    fn init_device(&mut self, from: usize) {
        let primary = self.primary_device;
        let children = {
            let Some(object) = self.objects[from].as_mut() else {
                return;
            };
            let WsObjectKind::Window {
                win_type,
                device,
                children,
                ..
            } = &mut object.kind
            else {
                return;
            };
            if *win_type == WindowType::Group && device.is_none() {
                *device = primary;
            }
            children.clone()
        };

        for child in children {
            self.init_device(child);
        }
    }
}

/// The window server service.
pub struct WindowServer {
    driver: Box<dyn GraphicsDriver>,
    clients: HashMap<u32, WsClient>,
}

pub const SERVER_NAME: &str = "!Windowserver";

impl WindowServer {
    pub fn new(driver: Box<dyn GraphicsDriver>) -> Self {
        Self {
            driver,
            clients: HashMap::new(),
        }
    }

    pub fn client(&self, session_uid: u32) -> Option<&WsClient> {
        self.clients.get(&session_uid)
    }

    /// Allocate the client record for a fresh session and reply with the
    /// session's unique id.
    fn init(&mut self, ctx: &mut IpcContext) {
        let uid = ctx.session_uid();
        self.clients.insert(uid, WsClient::new(uid));
        ctx.set_request_status(uid as i32);
    }

    fn command_buffer(&mut self, ctx: &mut IpcContext) {
        let uid = ctx.session_uid();
        if !self.clients.contains_key(&uid) {
            log::warn!("command buffer from uninitialized session {}", uid);
            return;
        }

        let Some(data) = ctx.read_arg_bytes(CMD_SLOT) else {
            log::warn!("command buffer argument missing");
            return;
        };

        for cmd in parse_command_buffer(&data) {
            self.execute_command(ctx, uid, &cmd);
        }
    }

    /// Dispatch one command. Client-level opcodes always act on the
    /// client record; anything else goes to the addressed object.
    fn execute_command(&mut self, ctx: &mut IpcContext, uid: u32, cmd: &WsCmd) {
        if let Some(op) = ClientOp::from_u16(cmd.op) {
            self.execute_client_op(ctx, uid, op, cmd);
            return;
        }

        if let Some(handle) = cmd.obj_handle {
            self.execute_object_op(ctx, uid, handle, cmd);
            return;
        }

        log::info!("unimplemented client opcode {:#x}", cmd.op);
    }

    fn execute_client_op(&mut self, ctx: &mut IpcContext, uid: u32, op: ClientOp, cmd: &WsCmd) {
        let client = self.clients.get_mut(&uid).expect("client checked by caller");

        match op {
            ClientOp::CreateScreenDevice => {
                log::info!("create screen device");
                let screen = payload_u32(&cmd.payload, 0).unwrap_or(0) as i32;

                let handle = client.add_object(WsObjectKind::ScreenDevice { screen });
                let index = (handle - 1 - BASE_HANDLE) as usize;
                if client.primary_device.is_none() {
                    client.primary_device = Some(index);
                }

                let root = client.root;
                client.init_device(root);
                ctx.set_request_status(handle as i32);
            }

            ClientOp::CreateWindowGroup => {
                let focus = payload_u32(&cmd.payload, 4).unwrap_or(0);
                let parent_id = payload_u32(&cmd.payload, 8).unwrap_or(0);
                let device_handle = payload_u32(&cmd.payload, 12).unwrap_or(0);

                let device = if device_handle as i32 <= 0 {
                    client.primary_device
                } else {
                    client.object_index(device_handle)
                };

                let parent = client.find_window_by_id(client.root, parent_id).unwrap_or_else(|| {
                    log::warn!(
                        "no parent for new group with id {:#x}, using root",
                        parent_id
                    );
                    client.root
                });

                let handle = client.add_object(WsObjectKind::Window {
                    win_type: WindowType::Group,
                    parent: Some(parent),
                    children: Vec::new(),
                    device,
                    priority: 0,
                });
                let index = (handle - 1 - BASE_HANDLE) as usize;

                if let Some(WsObject {
                    kind: WsObjectKind::Window { children, .. },
                    ..
                }) = client.objects[parent].as_mut()
                {
                    children.push(index);
                }

                if focus != 0 {
                    client.focus_group = Some(index);
                }

                ctx.set_request_status(handle as i32);
            }

            ClientOp::CreateGc => {
                let handle = client.add_object(WsObjectKind::GraphicContext {
                    attached_window: None,
                });
                ctx.set_request_status(handle as i32);
            }

            ClientOp::CreateSprite => {
                let window_handle = payload_u32(&cmd.payload, 0).unwrap_or(0);
                let x = payload_u32(&cmd.payload, 4).unwrap_or(0) as i32;
                let y = payload_u32(&cmd.payload, 8).unwrap_or(0) as i32;

                let attached_window = if (window_handle as i32) <= 0 {
                    log::warn!("sprite window handle is invalid, using root");
                    Some(client.root)
                } else {
                    client.object_index(window_handle).or(Some(client.root))
                };

                let handle = client.add_object(WsObjectKind::Sprite {
                    attached_window,
                    position: Vec2::new(x, y),
                });
                ctx.set_request_status(handle as i32);
            }

            ClientOp::RestoreDefaultHotKey => {
                let key = payload_u32(&cmd.payload, 0).unwrap_or(0);
                log::warn!("unknown restore key op {:#x}", key);
            }

            ClientOp::EventReady | ClientOp::GetFocusWindowGroup => {}
        }
    }

    fn execute_object_op(&mut self, ctx: &mut IpcContext, uid: u32, handle: u32, cmd: &WsCmd) {
        let client = self.clients.get_mut(&uid).expect("client checked by caller");
        let Some(index) = client.object_index(handle) else {
            return;
        };

        let Some(tag) = client.objects[index].as_ref().map(|o| o.kind.tag()) else {
            return;
        };

        match tag {
            WsKindTag::ScreenDevice => match cmd.op {
                SD_OP_PIXEL_SIZE => {
                    let size = self.driver.screen_size();
                    if let Err(err) = ctx.write_arg_pkg(REPLY_SLOT, &size.to_le_bytes()) {
                        log::warn!("pixel size reply failed: {}", err);
                    }
                    ctx.set_request_status(KERR_NONE);
                }
                SD_OP_TWIPS_SIZE => {
                    // Twips are a fifteenth of a pixel on this panel.
                    let size = self.driver.screen_size() * 15;
                    if let Err(err) = ctx.write_arg_pkg(REPLY_SLOT, &size.to_le_bytes()) {
                        log::warn!("twips size reply failed: {}", err);
                    }
                    ctx.set_request_status(KERR_NONE);
                }
                op => log::warn!("unimplemented screen device opcode {:#x}", op),
            },

            WsKindTag::GraphicContext => match cmd.op {
                GC_OP_ACTIVATE => {
                    let window_handle = payload_u32(&cmd.payload, 0).unwrap_or(0);
                    let Some(window_index) = client.object_index(window_handle) else {
                        log::warn!("activate on invalid window {:#x}", window_handle);
                        return;
                    };

                    let device = match client.objects[window_index].as_ref().map(|o| &o.kind) {
                        Some(WsObjectKind::Window { device, .. }) => *device,
                        _ => None,
                    };
                    let device_id = device
                        .or(client.primary_device)
                        .map(|d| client.object_id(d))
                        .unwrap_or(0);

                    if let Some(WsObject {
                        kind: WsObjectKind::GraphicContext { attached_window },
                        ..
                    }) = client.objects[index].as_mut()
                    {
                        *attached_window = Some(window_index);
                    }

                    ctx.set_request_status(device_id as i32);
                }
                op => log::warn!("unimplemented graphics context opcode {:#x}", op),
            },

            WsKindTag::Sprite => {}

            WsKindTag::Window => {
                log::warn!("unimplemented window opcode {:#x}", cmd.op);
            }
        }
    }
}

impl Service for WindowServer {
    fn name(&self) -> &'static str {
        SERVER_NAME
    }

    fn handle_message(&mut self, ctx: &mut IpcContext) -> bool {
        match ctx.function() {
            MSG_INIT => {
                self.init(ctx);
                true
            }
            MSG_COMMAND_BUFFER | MSG_SYNC_MSG_BUF => {
                self.command_buffer(ctx);
                true
            }
            _ => false,
        }
    }

    /// Asynchronous requests arrive as direct message functions. Redraw
    /// readiness completes benignly; everything else is ignored.
    fn on_unhandled_opcode(&mut self, ctx: &mut IpcContext) {
        let function = ctx.function();
        if function & MSG_ASYNC_FLAG != 0 {
            if function & !MSG_ASYNC_FLAG == CL_OP_REDRAW_READY {
                log::trace!("redraw ready");
                ctx.set_request_status(KERR_NONE);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_command() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&43u16.to_le_bytes());
        buf.extend_from_slice(&8u16.to_le_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let cmds = parse_command_buffer(&buf);
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].op, 43);
        assert_eq!(cmds[0].obj_handle, None);
        assert_eq!(cmds[0].payload.len(), 8);
    }

    #[test]
    fn test_parse_handle_bit() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(35u16 | 0x8000).to_le_bytes());
        buf.extend_from_slice(&4u16.to_le_bytes());
        buf.extend_from_slice(&0x4000_0002u32.to_le_bytes());
        buf.extend_from_slice(&[1, 2, 3, 4]);

        let cmds = parse_command_buffer(&buf);
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].op, 35);
        assert_eq!(cmds[0].obj_handle, Some(0x4000_0002));
        assert_eq!(cmds[0].payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_parse_concatenated_commands() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&5u16.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&40u16.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());

        let cmds = parse_command_buffer(&buf);
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0].op, 5);
        assert_eq!(cmds[1].op, 40);
    }

    #[test]
    fn test_parse_truncated_payload_dropped() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&5u16.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&43u16.to_le_bytes());
        buf.extend_from_slice(&64u16.to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]);

        let cmds = parse_command_buffer(&buf);
        assert_eq!(cmds.len(), 1);
    }

    #[test]
    fn test_client_handles_count_from_base() {
        let mut client = WsClient::new(7);
        // Root occupies the first slot.
        assert_eq!(client.objects.len(), 1);
        assert_eq!(client.object_id(0), BASE_HANDLE + 1);

        let h = client.add_object(WsObjectKind::ScreenDevice { screen: 0 });
        assert_eq!(h, BASE_HANDLE + 2);
        assert!(client.object_index(h).is_some());
    }

    #[test]
    fn test_handle_validity_bounds() {
        let client = WsClient::new(7);
        assert!(client.object_index(BASE_HANDLE).is_none());
        assert!(client.object_index(BASE_HANDLE + 1).is_some());
        assert!(client.object_index(BASE_HANDLE + 2).is_none());
    }

    #[test]
    fn test_deleted_handles_never_reused() {
        let mut client = WsClient::new(7);
        let doomed = client.add_object(WsObjectKind::GraphicContext {
            attached_window: None,
        });
        assert!(client.delete_object(doomed));
        assert!(client.object_index(doomed).is_none());

        // The next object gets a fresh handle past the dead slot.
        let next = client.add_object(WsObjectKind::GraphicContext {
            attached_window: None,
        });
        assert_eq!(next, doomed + 1);
    }

    #[test]
    fn test_root_is_not_deletable() {
        let mut client = WsClient::new(7);
        assert!(!client.delete_object(BASE_HANDLE + 1));
    }

    #[test]
    fn test_find_window_by_id() {
        let mut client = WsClient::new(7);
        let group = client.add_object(WsObjectKind::Window {
            win_type: WindowType::Group,
            parent: Some(0),
            children: Vec::new(),
            device: None,
            priority: 0,
        });
        let group_index = client.object_index(group).unwrap();
        if let Some(WsObject {
            kind: WsObjectKind::Window { children, .. },
            ..
        }) = client.objects[0].as_mut()
        {
            children.push(group_index);
        }

        assert_eq!(client.find_window_by_id(0, group), Some(group_index));
        assert_eq!(client.find_window_by_id(0, 0xdead), None);
    }

    #[test]
    fn test_twips_are_pixels_times_fifteen() {
        assert_eq!(Vec2::new(360, 640) * 15, Vec2::new(5400, 9600));
    }
}
