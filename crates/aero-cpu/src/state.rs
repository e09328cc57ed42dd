use core::fmt;

use crate::flags::Rflags;
use crate::memory::GuestMemory;

pub const GPR_COUNT: usize = 16;
/// Architectural upper bound on x86 instruction length.
pub const MAX_INST_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    pub const ALL: [Gpr; GPR_COUNT] = [
        Gpr::Rax,
        Gpr::Rcx,
        Gpr::Rdx,
        Gpr::Rbx,
        Gpr::Rsp,
        Gpr::Rbp,
        Gpr::Rsi,
        Gpr::Rdi,
        Gpr::R8,
        Gpr::R9,
        Gpr::R10,
        Gpr::R11,
        Gpr::R12,
        Gpr::R13,
        Gpr::R14,
        Gpr::R15,
    ];

    pub fn from_u4(code: u8) -> Option<Gpr> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Gpr::Rax => "rax",
            Gpr::Rcx => "rcx",
            Gpr::Rdx => "rdx",
            Gpr::Rbx => "rbx",
            Gpr::Rsp => "rsp",
            Gpr::Rbp => "rbp",
            Gpr::Rsi => "rsi",
            Gpr::Rdi => "rdi",
            Gpr::R8 => "r8",
            Gpr::R9 => "r9",
            Gpr::R10 => "r10",
            Gpr::R11 => "r11",
            Gpr::R12 => "r12",
            Gpr::R13 => "r13",
            Gpr::R14 => "r14",
            Gpr::R15 => "r15",
        }
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A `[base, base + size)` guest address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub base: u64,
    pub size: u64,
}

impl Span {
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }
}

/// Raw bytes of the most recently fetched instruction, kept for fault reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InstBytes {
    bytes: [u8; MAX_INST_LEN],
    len: u8,
}

impl InstBytes {
    pub fn new(bytes: &[u8]) -> Self {
        let len = bytes.len().min(MAX_INST_LEN);
        let mut out = Self::default();
        out.bytes[..len].copy_from_slice(&bytes[..len]);
        out.len = len as u8;
        out
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl fmt::Display for InstBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.as_slice().iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// All mutable guest-visible state owned by one engine.
#[derive(Debug, Clone)]
pub struct CpuState {
    gpr: [u64; GPR_COUNT],
    pub rip: u64,
    pub rflags: Rflags,
    pub xmm: [u128; 16],
    /// x87 register stack, `x87[i]` is `ST(i)`.
    pub x87: [f64; 8],
    pub memory: GuestMemory,
    pub stack: Span,
    pub heap: Span,
    pub executed: u64,
    pub budget: u64,
    pub safety: bool,
    pub last_valid_rip: u64,
    pub last_inst: InstBytes,
}

impl CpuState {
    pub fn new(memory: GuestMemory) -> Self {
        Self {
            gpr: [0; GPR_COUNT],
            rip: 0,
            rflags: Rflags::default(),
            xmm: [0; 16],
            x87: [0.0; 8],
            memory,
            stack: Span::default(),
            heap: Span::default(),
            executed: 0,
            budget: u64::MAX,
            safety: false,
            last_valid_rip: 0,
            last_inst: InstBytes::default(),
        }
    }

    pub fn gpr(&self, reg: Gpr) -> u64 {
        self.gpr[reg.index()]
    }

    pub fn set_gpr(&mut self, reg: Gpr, value: u64) {
        self.gpr[reg.index()] = value;
    }

    /// Register access by raw 4-bit encoding, as produced by the decoder.
    pub fn gpr_at(&self, index: u8) -> u64 {
        debug_assert!((index as usize) < GPR_COUNT);
        self.gpr[(index & 0xf) as usize]
    }

    pub fn set_gpr_at(&mut self, index: u8, value: u64) {
        debug_assert!((index as usize) < GPR_COUNT);
        self.gpr[(index & 0xf) as usize] = value;
    }

    pub fn gprs(&self) -> &[u64; GPR_COUNT] {
        &self.gpr
    }

    pub fn flag(&self, flag: Rflags) -> bool {
        self.rflags.contains(flag)
    }

    pub fn set_flag(&mut self, flag: Rflags, value: bool) {
        self.rflags.set(flag, value);
    }

    /// `true` once safety mode is on and the run has used up its instruction budget.
    pub fn budget_exhausted(&self) -> bool {
        self.safety && self.executed >= self.budget
    }

    pub fn record_fetch(&mut self, rip: u64, bytes: &[u8]) {
        self.last_valid_rip = rip;
        self.last_inst = InstBytes::new(bytes);
    }

    /// Clear the register file, flags and FP/vector banks. Memory and layout are left alone.
    pub fn clear_registers(&mut self) {
        self.gpr = [0; GPR_COUNT];
        self.rip = 0;
        self.rflags = Rflags::default();
        self.xmm = [0; 16];
        self.x87 = [0.0; 8];
        self.executed = 0;
        self.last_valid_rip = 0;
        self.last_inst = InstBytes::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLimits;

    #[test]
    fn gpr_indices_follow_encoding_order() {
        let mut cpu = CpuState::new(GuestMemory::new(0x2000, MemoryLimits::default()).unwrap());
        cpu.set_gpr(Gpr::Rsi, 7);
        assert_eq!(cpu.gpr_at(6), 7);
        cpu.set_gpr_at(15, 9);
        assert_eq!(cpu.gpr(Gpr::R15), 9);
        assert_eq!(Gpr::from_u4(16), None);
    }

    #[test]
    fn budget_only_applies_in_safety_mode() {
        let mut cpu = CpuState::new(GuestMemory::new(0, MemoryLimits::default()).unwrap());
        cpu.budget = 2;
        cpu.executed = 2;
        assert!(!cpu.budget_exhausted());
        cpu.safety = true;
        assert!(cpu.budget_exhausted());
    }

    #[test]
    fn inst_bytes_truncate_to_max_length() {
        let bytes = InstBytes::new(&[0x90; 20]);
        assert_eq!(bytes.as_slice().len(), MAX_INST_LEN);
        assert_eq!(InstBytes::new(&[0xb8, 0x0a]).to_string(), "b8 0a");
    }
}
