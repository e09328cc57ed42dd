//! Guest memory arena and region table.
//!
//! Guest memory is a single owned byte buffer. Instruction operands only ever carry guest
//! addresses; every access goes through [`GuestMemory::check`] before touching the buffer.

use bitflags::bitflags;
use thiserror::Error;

/// Maximum number of live entries in the region table.
pub const MAX_REGIONS: usize = 32;
/// Upper bound on any guest address range, regardless of the configured memory size.
pub const DEFAULT_MEMORY_CEILING: u64 = 256 * 1024 * 1024;
/// Accesses below this address fault (null-page guard).
pub const DEFAULT_MIN_VALID_ADDRESS: u64 = 0x1000;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct RegionFlags: u8 {
        const ALLOCATED = 1 << 0;
        const WRITABLE = 1 << 1;
        const EXECUTABLE = 1 << 2;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: u64,
    pub size: u64,
    pub flags: RegionFlags,
    pub name: String,
}

impl MemoryRegion {
    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    /// `start <= addr` and `addr + size <= start + self.size`.
    pub fn contains(&self, addr: u64, size: u64) -> bool {
        match addr.checked_add(size) {
            Some(end) => self.start <= addr && end <= self.end(),
            None => false,
        }
    }

    fn overlaps(&self, start: u64, size: u64) -> bool {
        start < self.end() && self.start < start + size
    }
}

/// Index into the region table. Slots are reused after [`GuestMemory::unmap_region`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessPolicy {
    /// An access must fall entirely inside one mapped region, with matching permissions.
    #[default]
    Regions,
    /// An access only has to fit inside the memory block.
    Bounds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Fetch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLimits {
    pub policy: AccessPolicy,
    pub min_valid_address: u64,
    pub ceiling: u64,
}

impl Default for MemoryLimits {
    fn default() -> Self {
        Self {
            policy: AccessPolicy::Regions,
            min_valid_address: DEFAULT_MIN_VALID_ADDRESS,
            ceiling: DEFAULT_MEMORY_CEILING,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("address {addr:#x} is below the minimum valid address {min:#x}")]
    BelowMinimum { addr: u64, min: u64 },
    #[error("access of {size} bytes at {addr:#x} exceeds the memory ceiling {ceiling:#x}")]
    CeilingExceeded { addr: u64, size: u64, ceiling: u64 },
    #[error("access of {size} bytes at {addr:#x} is outside guest memory")]
    OutOfBounds { addr: u64, size: u64 },
    #[error("access of {size} bytes at {addr:#x} is not covered by any mapped region")]
    Unmapped { addr: u64, size: u64 },
    #[error("write to {addr:#x} in read-only region `{region}`")]
    NotWritable { addr: u64, region: String },
    #[error("instruction fetch from {addr:#x} in non-executable region `{region}`")]
    NotExecutable { addr: u64, region: String },
    #[error("memory size {size:#x} exceeds the ceiling {ceiling:#x}")]
    TooLarge { size: u64, ceiling: u64 },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegionError {
    #[error("region `{name}` has zero size")]
    ZeroSize { name: String },
    #[error("region `{name}` starts at {start:#x}, below the minimum valid address {min:#x}")]
    BelowMinimum { name: String, start: u64, min: u64 },
    #[error("region `{name}` ({start:#x}+{size:#x}) extends past guest memory ({memory_size:#x})")]
    BeyondMemory {
        name: String,
        start: u64,
        size: u64,
        memory_size: u64,
    },
    #[error("region `{name}` ({start:#x}+{size:#x}) overlaps `{existing}`")]
    Overlap {
        name: String,
        start: u64,
        size: u64,
        existing: String,
    },
    #[error("region table is full ({MAX_REGIONS} entries)")]
    TableFull,
    #[error("no region in slot {0}")]
    UnknownRegion(usize),
}

#[derive(Debug, Clone, Default)]
struct RegionTable {
    slots: Vec<Option<MemoryRegion>>,
}

impl RegionTable {
    fn insert(&mut self, region: MemoryRegion) -> Result<RegionId, RegionError> {
        if let Some(existing) = self
            .iter()
            .map(|(_, r)| r)
            .find(|r| r.overlaps(region.start, region.size))
        {
            return Err(RegionError::Overlap {
                existing: existing.name.clone(),
                name: region.name,
                start: region.start,
                size: region.size,
            });
        }
        if let Some(idx) = self.slots.iter().position(Option::is_none) {
            self.slots[idx] = Some(region);
            return Ok(RegionId(idx));
        }
        if self.slots.len() >= MAX_REGIONS {
            return Err(RegionError::TableFull);
        }
        self.slots.push(Some(region));
        Ok(RegionId(self.slots.len() - 1))
    }

    fn remove(&mut self, id: RegionId) -> Result<MemoryRegion, RegionError> {
        self.slots
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or(RegionError::UnknownRegion(id.0))
    }

    fn iter(&self) -> impl Iterator<Item = (RegionId, &MemoryRegion)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|r| (RegionId(idx), r)))
    }

    fn find(&self, addr: u64, size: u64) -> Option<&MemoryRegion> {
        self.iter().map(|(_, r)| r).find(|r| r.contains(addr, size))
    }

    fn find_start(&self, addr: u64) -> Option<&MemoryRegion> {
        self.find(addr, 1)
    }
}

/// Owned guest memory block plus the region table that gates access to it.
#[derive(Debug, Clone)]
pub struct GuestMemory {
    bytes: Vec<u8>,
    regions: RegionTable,
    limits: MemoryLimits,
}

impl GuestMemory {
    pub fn new(size: u64, limits: MemoryLimits) -> Result<Self, MemoryError> {
        if size > limits.ceiling {
            return Err(MemoryError::TooLarge {
                size,
                ceiling: limits.ceiling,
            });
        }
        let len = usize::try_from(size).map_err(|_| MemoryError::TooLarge {
            size,
            ceiling: limits.ceiling,
        })?;
        Ok(Self {
            bytes: vec![0; len],
            regions: RegionTable::default(),
            limits,
        })
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn limits(&self) -> MemoryLimits {
        self.limits
    }

    pub fn policy(&self) -> AccessPolicy {
        self.limits.policy
    }

    pub fn set_policy(&mut self, policy: AccessPolicy) {
        self.limits.policy = policy;
    }

    pub fn map_region(
        &mut self,
        start: u64,
        size: u64,
        flags: RegionFlags,
        name: impl Into<String>,
    ) -> Result<RegionId, RegionError> {
        let name = name.into();
        if size == 0 {
            return Err(RegionError::ZeroSize { name });
        }
        if start < self.limits.min_valid_address {
            return Err(RegionError::BelowMinimum {
                name,
                start,
                min: self.limits.min_valid_address,
            });
        }
        let fits = start.checked_add(size).is_some_and(|end| end <= self.size());
        if !fits {
            return Err(RegionError::BeyondMemory {
                name,
                start,
                size,
                memory_size: self.size(),
            });
        }
        self.regions.insert(MemoryRegion {
            start,
            size,
            flags: flags | RegionFlags::ALLOCATED,
            name,
        })
    }

    pub fn unmap_region(&mut self, id: RegionId) -> Result<MemoryRegion, RegionError> {
        self.regions.remove(id)
    }

    pub fn regions(&self) -> impl Iterator<Item = (RegionId, &MemoryRegion)> {
        self.regions.iter()
    }

    pub fn region_at(&self, addr: u64) -> Option<&MemoryRegion> {
        self.regions.find_start(addr)
    }

    /// Validate an access of `size` bytes at `addr` against the active policy.
    pub fn check(&self, addr: u64, size: u64, kind: AccessKind) -> Result<(), MemoryError> {
        let min = self.limits.min_valid_address;
        if addr < min {
            return Err(MemoryError::BelowMinimum { addr, min });
        }
        let end = addr
            .checked_add(size)
            .ok_or(MemoryError::OutOfBounds { addr, size })?;
        if end > self.limits.ceiling {
            return Err(MemoryError::CeilingExceeded {
                addr,
                size,
                ceiling: self.limits.ceiling,
            });
        }
        match self.limits.policy {
            AccessPolicy::Bounds => {
                if end > self.size() {
                    return Err(MemoryError::OutOfBounds { addr, size });
                }
                Ok(())
            }
            AccessPolicy::Regions => {
                let region = self
                    .regions
                    .find(addr, size)
                    .ok_or(MemoryError::Unmapped { addr, size })?;
                match kind {
                    AccessKind::Write if !region.flags.contains(RegionFlags::WRITABLE) => {
                        Err(MemoryError::NotWritable {
                            addr,
                            region: region.name.clone(),
                        })
                    }
                    AccessKind::Fetch if !region.flags.contains(RegionFlags::EXECUTABLE) => {
                        Err(MemoryError::NotExecutable {
                            addr,
                            region: region.name.clone(),
                        })
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    pub fn read(&self, addr: u64, out: &mut [u8]) -> Result<(), MemoryError> {
        self.check(addr, out.len() as u64, AccessKind::Read)?;
        out.copy_from_slice(self.slice(addr, out.len())?);
        Ok(())
    }

    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.check(addr, data.len() as u64, AccessKind::Write)?;
        self.slice_mut(addr, data.len())?.copy_from_slice(data);
        Ok(())
    }

    /// Little-endian read of a 1/2/4/8-byte value.
    pub fn read_uint(&self, addr: u64, size: usize) -> Result<u64, MemoryError> {
        let mut buf = [0u8; 8];
        let size = size.min(8);
        self.read(addr, &mut buf[..size])?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Little-endian write of the low `size` bytes of `value`.
    pub fn write_uint(&mut self, addr: u64, size: usize, value: u64) -> Result<(), MemoryError> {
        let size = size.min(8);
        self.write(addr, &value.to_le_bytes()[..size])
    }

    pub fn read_u8(&self, addr: u64) -> Result<u8, MemoryError> {
        Ok(self.read_uint(addr, 1)? as u8)
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32, MemoryError> {
        Ok(self.read_uint(addr, 4)? as u32)
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, MemoryError> {
        self.read_uint(addr, 8)
    }

    pub fn write_u8(&mut self, addr: u64, value: u8) -> Result<(), MemoryError> {
        self.write_uint(addr, 1, value.into())
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) -> Result<(), MemoryError> {
        self.write_uint(addr, 4, value.into())
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) -> Result<(), MemoryError> {
        self.write_uint(addr, 8, value)
    }

    /// Bytes available for decoding at `addr`, at most `max` long.
    ///
    /// The window is clipped to the end of the containing region (or the memory block under the
    /// bounds policy) so the decoder can never be handed bytes the guest could not fetch.
    pub fn fetch_window(&self, addr: u64, max: usize) -> Result<&[u8], MemoryError> {
        self.check(addr, 1, AccessKind::Fetch)?;
        let limit = match self.limits.policy {
            AccessPolicy::Bounds => self.size(),
            AccessPolicy::Regions => self
                .regions
                .find_start(addr)
                .map(MemoryRegion::end)
                .unwrap_or(addr),
        };
        let limit = limit.min(self.limits.ceiling).min(self.size());
        let len = (limit.saturating_sub(addr) as usize).min(max);
        self.slice(addr, len)
    }

    /// Host-side copy into guest memory. Only bounds are enforced, not region permissions.
    pub fn load(&mut self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.host_bounds(addr, data.len() as u64)?;
        self.slice_mut(addr, data.len())?.copy_from_slice(data);
        Ok(())
    }

    /// Host-side view of guest bytes for diagnostics. Only bounds are enforced.
    pub fn peek(&self, addr: u64, len: usize) -> Result<&[u8], MemoryError> {
        self.host_bounds(addr, len as u64)?;
        self.slice(addr, len)
    }

    fn host_bounds(&self, addr: u64, size: u64) -> Result<(), MemoryError> {
        let min = self.limits.min_valid_address;
        if addr < min {
            return Err(MemoryError::BelowMinimum { addr, min });
        }
        match addr.checked_add(size) {
            Some(end) if end <= self.size() => Ok(()),
            _ => Err(MemoryError::OutOfBounds { addr, size }),
        }
    }

    fn slice(&self, addr: u64, len: usize) -> Result<&[u8], MemoryError> {
        let start = usize::try_from(addr).map_err(|_| MemoryError::OutOfBounds {
            addr,
            size: len as u64,
        })?;
        start
            .checked_add(len)
            .and_then(|end| self.bytes.get(start..end))
            .ok_or(MemoryError::OutOfBounds {
                addr,
                size: len as u64,
            })
    }

    fn slice_mut(&mut self, addr: u64, len: usize) -> Result<&mut [u8], MemoryError> {
        let start = usize::try_from(addr).map_err(|_| MemoryError::OutOfBounds {
            addr,
            size: len as u64,
        })?;
        start
            .checked_add(len)
            .and_then(|end| self.bytes.get_mut(start..end))
            .ok_or(MemoryError::OutOfBounds {
                addr,
                size: len as u64,
            })
    }
}
