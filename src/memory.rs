//! Guest memory
//!
//! The guest sees a flat 32-bit address space carved into areas whose
//! bounds depend on the EPOC version (EKA1 layouts differ from EKA2).
//! Backing storage lives host-side in per-region buffers; a page table
//! maps guest pages onto them. The CPU engine reads and writes through
//! this module directly, so mappings only change at kernel entry.
//!
//! Design:
//! - Regions are reserve-then-commit: reservation picks a base address in
//!   an area, commits enable page ranges for access
//! - Cross-references are `RegionId`s; nothing hands out pointers

use crate::error::KernelError;
use slab::Slab;
use std::collections::HashMap;

pub const PAGE_SIZE: u32 = 0x1000;

/// Round `size` up to a whole number of pages.
pub fn round_to_pages(size: u32) -> u32 {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Page protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    ReadOnly,
    ReadWrite,
    ReadWriteExec,
}

/// Address-space areas a region can be reserved in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemArea {
    /// Per-process local data (heaps, stacks)
    LocalData,
    /// Globally visible shared data
    SharedData,
    /// RAM-loaded code
    RamCode,
    /// ROM image window
    Rom,
}

/// Version-dependent layout constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMap {
    pub local_data: u32,
    pub shared_data: u32,
    pub shared_data_end: u32,
    pub ram_code_addr: u32,
    pub rom_addr: u32,
}

impl MemoryMap {
    /// EKA2 layout (epoc9 and later).
    pub fn eka2() -> Self {
        Self {
            local_data: 0x0040_0000,
            shared_data: 0x3800_0000,
            shared_data_end: 0x7000_0000,
            ram_code_addr: 0x7000_0000,
            rom_addr: 0x8000_0000,
        }
    }

    /// EKA1 layout (epoc6 and earlier).
    pub fn eka1() -> Self {
        Self {
            local_data: 0x0040_0000,
            shared_data: 0x1000_0000,
            shared_data_end: 0x3000_0000,
            ram_code_addr: 0x5000_0000,
            rom_addr: 0x5800_0000,
        }
    }

    fn area_base(&self, area: MemArea) -> u32 {
        match area {
            MemArea::LocalData => self.local_data,
            MemArea::SharedData => self.shared_data,
            MemArea::RamCode => self.ram_code_addr,
            MemArea::Rom => self.rom_addr,
        }
    }
}

/// Identifier of a reserved region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(pub usize);

/// Memory errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// Address is not inside any reserved region
    OutOfRange(u32),
    /// Address is reserved but not committed
    NotCommitted(u32),
    /// Write to a read-only page
    ReadOnly(u32),
    /// Area exhausted or size zero
    NoMemory,
    /// Offset/size outside the region's reservation
    BadRange,
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryError::OutOfRange(addr) => write!(f, "address {:#010x} unmapped", addr),
            MemoryError::NotCommitted(addr) => write!(f, "address {:#010x} not committed", addr),
            MemoryError::ReadOnly(addr) => write!(f, "address {:#010x} is read-only", addr),
            MemoryError::NoMemory => write!(f, "address area exhausted"),
            MemoryError::BadRange => write!(f, "range outside reservation"),
        }
    }
}

impl From<MemoryError> for KernelError {
    fn from(e: MemoryError) -> Self {
        match e {
            MemoryError::NoMemory => KernelError::Overflow,
            MemoryError::BadRange => KernelError::InvalidArgument,
            other => KernelError::Fatal(other.to_string()),
        }
    }
}

struct Region {
    base: u32,
    max_size: u32,
    protection: Protection,
    data: Vec<u8>,
    committed: Vec<bool>,
}

#[derive(Clone, Copy)]
struct PageEntry {
    region: usize,
}

/// The guest address space.
pub struct Memory {
    map: MemoryMap,
    regions: Slab<Region>,
    pages: HashMap<u32, PageEntry>,
    cursors: HashMap<u32, u32>,
}

impl Memory {
    pub fn new(map: MemoryMap) -> Self {
        Self {
            map,
            regions: Slab::new(),
            pages: HashMap::new(),
            cursors: HashMap::new(),
        }
    }

    pub fn layout(&self) -> &MemoryMap {
        &self.map
    }

    /// Reserve `max_size` bytes in `area`. No page is accessible until
    /// committed.
    pub fn reserve(
        &mut self,
        area: MemArea,
        max_size: u32,
        protection: Protection,
    ) -> Result<RegionId, MemoryError> {
        if max_size == 0 {
            return Err(MemoryError::NoMemory);
        }

        let size = round_to_pages(max_size);
        let area_base = self.map.area_base(area);
        let cursor = self.cursors.entry(area_base).or_insert(area_base);
        let base = *cursor;

        let (end, overflow) = base.overflowing_add(size);
        if overflow {
            return Err(MemoryError::NoMemory);
        }
        *cursor = end;

        let id = self.regions.insert(Region {
            base,
            max_size: size,
            protection,
            data: vec![0; size as usize],
            committed: vec![false; (size / PAGE_SIZE) as usize],
        });

        Ok(RegionId(id))
    }

    /// Commit `[offset, offset + size)` of a region, making it accessible.
    pub fn commit(&mut self, id: RegionId, offset: u32, size: u32) -> Result<(), MemoryError> {
        let region = self.regions.get_mut(id.0).ok_or(MemoryError::BadRange)?;

        let end = offset.checked_add(size).ok_or(MemoryError::BadRange)?;
        if end > region.max_size {
            return Err(MemoryError::BadRange);
        }

        let first = offset / PAGE_SIZE;
        let last = round_to_pages(end) / PAGE_SIZE;
        let base = region.base;

        for page in first..last {
            region.committed[page as usize] = true;
            self.pages
                .insert(base + page * PAGE_SIZE, PageEntry { region: id.0 });
        }

        Ok(())
    }

    /// Decommit a page range. Reads and writes to it fail afterwards.
    pub fn decommit(&mut self, id: RegionId, offset: u32, size: u32) -> Result<(), MemoryError> {
        let region = self.regions.get_mut(id.0).ok_or(MemoryError::BadRange)?;

        let end = offset.checked_add(size).ok_or(MemoryError::BadRange)?;
        if end > region.max_size {
            return Err(MemoryError::BadRange);
        }

        let first = offset / PAGE_SIZE;
        let last = round_to_pages(end) / PAGE_SIZE;
        let base = region.base;

        for page in first..last {
            region.committed[page as usize] = false;
            self.pages.remove(&(base + page * PAGE_SIZE));
        }

        Ok(())
    }

    /// Release a region entirely.
    pub fn free(&mut self, id: RegionId) {
        if self.regions.contains(id.0) {
            let region = self.regions.remove(id.0);
            for page in 0..(region.max_size / PAGE_SIZE) {
                self.pages.remove(&(region.base + page * PAGE_SIZE));
            }
        }
    }

    /// Guest base address of a region.
    pub fn region_base(&self, id: RegionId) -> Option<u32> {
        self.regions.get(id.0).map(|r| r.base)
    }

    /// Map a ROM image at the layout's ROM window, read-only and fully
    /// committed.
    pub fn map_rom(&mut self, data: Vec<u8>) -> Result<RegionId, MemoryError> {
        let size = round_to_pages(data.len() as u32);
        let id = self.reserve(MemArea::Rom, size, Protection::ReadOnly)?;
        self.commit(id, 0, size)?;

        let region = &mut self.regions[id.0];
        region.data[..data.len()].copy_from_slice(&data);
        Ok(id)
    }

    fn locate(&self, addr: u32) -> Result<(usize, usize), MemoryError> {
        let entry = self
            .pages
            .get(&(addr & !(PAGE_SIZE - 1)))
            .ok_or(MemoryError::OutOfRange(addr))?;

        let region = &self.regions[entry.region];
        let offset = (addr - region.base) as usize;
        if !region.committed[offset / PAGE_SIZE as usize] {
            return Err(MemoryError::NotCommitted(addr));
        }

        Ok((entry.region, offset))
    }

    pub fn read_bytes(&self, addr: u32, buf: &mut [u8]) -> Result<(), MemoryError> {
        for (i, slot) in buf.iter_mut().enumerate() {
            let (region, offset) = self.locate(addr + i as u32)?;
            *slot = self.regions[region].data[offset];
        }
        Ok(())
    }

    pub fn write_bytes(&mut self, addr: u32, buf: &[u8]) -> Result<(), MemoryError> {
        for (i, byte) in buf.iter().enumerate() {
            let a = addr + i as u32;
            let (region, offset) = self.locate(a)?;
            if self.regions[region].protection == Protection::ReadOnly {
                return Err(MemoryError::ReadOnly(a));
            }
            self.regions[region].data[offset] = *byte;
        }
        Ok(())
    }

    pub fn read_u32(&self, addr: u32) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read_bytes(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), MemoryError> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    pub fn read_i32(&self, addr: u32) -> Result<i32, MemoryError> {
        Ok(self.read_u32(addr)? as i32)
    }

    pub fn write_i32(&mut self, addr: u32, value: i32) -> Result<(), MemoryError> {
        self.write_u32(addr, value as u32)
    }
}
