//! Image loading contracts
//!
//! The ROM/E32/SIS binary loaders live outside the core. The kernel only
//! needs what spawning a process requires: the image's identity, entry
//! point and sizing. `ImageTable` is an in-process provider for hosts that
//! pre-register images (and for tests).

use std::collections::HashMap;

/// Symbian's three-part executable identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UidTriplet {
    pub uid1: u32,
    pub uid2: u32,
    pub uid3: u32,
}

/// Everything the kernel needs to instantiate a process from an image.
#[derive(Debug, Clone)]
pub struct ProcessImage {
    pub name: String,
    pub uids: UidTriplet,
    pub entry_point: u32,
    pub code_size: u32,
    pub stack_size: u32,
    pub min_heap_size: u32,
    pub max_heap_size: u32,
}

impl ProcessImage {
    /// A minimal image with conventional sizes; enough for tests and HLE
    /// processes that never execute guest code.
    pub fn with_name(name: &str) -> Self {
        Self {
            name: name.to_string(),
            uids: UidTriplet::default(),
            entry_point: 0,
            code_size: 0x1000,
            stack_size: 0x2000,
            min_heap_size: 0x1000,
            max_heap_size: 0x10_0000,
        }
    }
}

/// Resolves image ids (UID3 values) or paths to loadable images.
pub trait ImageLoader {
    fn load_by_id(&mut self, id: u32) -> Option<ProcessImage>;
    fn load_by_path(&mut self, path: &str) -> Option<ProcessImage>;
}

/// SIS/RPKG installation lives with the external package manager; the
/// system façade only forwards.
pub trait PackageInstaller {
    /// Install a SIS/SISX package onto `drive`.
    fn install_package(&mut self, path: &str, drive: crate::io::Drive) -> bool;

    /// Unpack a Z-drive repackage.
    fn install_rpkg(&mut self, path: &str) -> bool;
}

/// Static image provider keyed by UID3 and by name.
#[derive(Default)]
pub struct ImageTable {
    by_id: HashMap<u32, ProcessImage>,
}

impl ImageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: u32, image: ProcessImage) {
        self.by_id.insert(id, image);
    }
}

impl ImageLoader for ImageTable {
    fn load_by_id(&mut self, id: u32) -> Option<ProcessImage> {
        self.by_id.get(&id).cloned()
    }

    fn load_by_path(&mut self, path: &str) -> Option<ProcessImage> {
        let name = crate::path::filename(path);
        self.by_id
            .values()
            .find(|img| img.name.eq_ignore_ascii_case(name))
            .cloned()
    }
}
