//! Properties
//!
//! A property is a typed cell identified by a `(category, key)` pair,
//! holding either an int or a byte array of at most 512 bytes. Setting a
//! value notifies every subscriber exactly once and clears the subscriber
//! list (subscriptions are one-shot). Notification delivery goes through
//! the kernel, which owns the request statuses.

use super::ipc::RequestStatusId;
use super::object::ObjectInfo;
use super::thread::ThreadId;

/// Identifier into the kernel's property arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyId(pub usize);

/// Hard cap on binary property payloads.
pub const MAX_BIN_LEN: u32 = 512;

/// Int properties are a fixed machine word regardless of requested size.
pub const INT_LEN: u32 = 4;

/// The declared type of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    Int,
    Bin,
}

/// The stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyData {
    Int(i32),
    Bin(Vec<u8>),
}

/// One subscriber waiting for the next set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertySubscriber {
    pub thread: ThreadId,
    pub status: RequestStatusId,
}

/// A publish-subscribe property cell.
#[derive(Debug)]
pub struct Property {
    pub info: ObjectInfo,
    pub category: u32,
    pub key: u32,
    pub data_type: PropertyType,
    /// Capacity for binary payloads; `INT_LEN` for int properties.
    pub data_len: u32,
    pub data: PropertyData,
    pub subscribers: Vec<PropertySubscriber>,
}

impl Property {
    pub fn new(
        info: ObjectInfo,
        category: u32,
        key: u32,
        data_type: PropertyType,
        pre_allocated: u32,
    ) -> Self {
        let data_len = match data_type {
            PropertyType::Int => INT_LEN,
            PropertyType::Bin => {
                if pre_allocated > MAX_BIN_LEN {
                    log::warn!(
                        "property ({:#x},{:#x}) requested {} bytes, clamped to {}",
                        category,
                        key,
                        pre_allocated,
                        MAX_BIN_LEN
                    );
                    MAX_BIN_LEN
                } else {
                    pre_allocated
                }
            }
        };

        let data = match data_type {
            PropertyType::Int => PropertyData::Int(0),
            PropertyType::Bin => PropertyData::Bin(Vec::new()),
        };

        Self {
            info,
            category,
            key,
            data_type,
            data_len,
            data,
            subscribers: Vec::new(),
        }
    }

    /// Store an int value. Fails on a type mismatch.
    pub fn set_int(&mut self, value: i32) -> bool {
        if self.data_type != PropertyType::Int {
            return false;
        }
        self.data = PropertyData::Int(value);
        true
    }

    /// Store a binary value. Fails on a type mismatch or when the payload
    /// exceeds the defined length.
    pub fn set_bin(&mut self, payload: &[u8]) -> bool {
        if self.data_type != PropertyType::Bin || payload.len() as u32 > self.data_len {
            return false;
        }
        self.data = PropertyData::Bin(payload.to_vec());
        true
    }

    pub fn get_int(&self) -> Option<i32> {
        match self.data {
            PropertyData::Int(v) => Some(v),
            PropertyData::Bin(_) => None,
        }
    }

    pub fn get_bin(&self) -> Option<&[u8]> {
        match &self.data {
            PropertyData::Bin(v) => Some(v),
            PropertyData::Int(_) => None,
        }
    }

    /// Detach the current subscriber list for notification, in
    /// registration order.
    pub fn take_subscribers(&mut self) -> Vec<PropertySubscriber> {
        std::mem::take(&mut self.subscribers)
    }
}
