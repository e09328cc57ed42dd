#![forbid(unsafe_code)]

//! Guest-visible CPU and memory state for the x86-64 → AArch64 translator.
//!
//! Everything the decoder, code generator and dispatcher mutate lives here: the register file,
//! RFLAGS, the x87/XMM banks, and the guest memory arena with its region table.

pub mod flags;
pub mod memory;
pub mod state;

pub use flags::Rflags;
pub use memory::{
    AccessKind, AccessPolicy, GuestMemory, MemoryError, MemoryLimits, MemoryRegion, RegionError,
    RegionFlags, RegionId, DEFAULT_MEMORY_CEILING, DEFAULT_MIN_VALID_ADDRESS, MAX_REGIONS,
};
pub use state::{CpuState, Gpr, InstBytes, Span, GPR_COUNT, MAX_INST_LEN};
