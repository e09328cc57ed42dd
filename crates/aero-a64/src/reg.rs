use core::fmt;

use aero_x86::Cond as X86Cond;

/// AArch64 general register identifier (0–31).
///
/// Register 31 is context-dependent: it encodes ZR in most instructions, but SP in base-address
/// contexts (load/store, add/sub immediate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Reg(pub u8);

impl Reg {
    pub const X0: Reg = Reg(0);
    pub const X16: Reg = Reg(16);
    pub const X17: Reg = Reg(17);
    pub const X28: Reg = Reg(28);
    pub const X29: Reg = Reg(29);
    pub const X30: Reg = Reg(30);
    pub const XZR: Reg = Reg(31);
    pub const SP: Reg = Reg(31);

    pub(crate) fn bits(self) -> u32 {
        (self.0 & 0x1f) as u32
    }
}

/// AArch64 SIMD/FP register identifier (V0–V31).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct VReg(pub u8);

impl VReg {
    pub(crate) fn bits(self) -> u32 {
        (self.0 & 0x1f) as u32
    }
}

/// Guest GPR → host register. RSP and RBP land on X28/X29; every other guest register keeps its
/// encoding number.
///
/// | guest | host | guest | host |
/// |-------|------|-------|------|
/// | rax   | x0   | rsi   | x6   |
/// | rcx   | x1   | rdi   | x7   |
/// | rdx   | x2   | r8–r15| x8–x15 |
/// | rbx   | x3   | rsp   | x28  |
/// |       |      | rbp   | x29  |
pub const GPR_MAP: [Reg; 16] = [
    Reg(0),
    Reg(1),
    Reg(2),
    Reg(3),
    Reg(28),
    Reg(29),
    Reg(6),
    Reg(7),
    Reg(8),
    Reg(9),
    Reg(10),
    Reg(11),
    Reg(12),
    Reg(13),
    Reg(14),
    Reg(15),
];

/// Host register for indices outside the guest register file.
pub const DEFAULT_REG: Reg = Reg::X16;
/// Holds materialized effective addresses. Never mapped to a guest register.
pub const SCRATCH: Reg = Reg::X17;
/// FP/SIMD temporary. Never mapped to a guest register.
pub const SCRATCH_V: VReg = VReg(31);

pub fn map_gpr(index: u8) -> Reg {
    GPR_MAP.get(index as usize).copied().unwrap_or(DEFAULT_REG)
}

/// `xmm0..15` live in `v0..15`.
pub fn xmm_vreg(index: u8) -> VReg {
    VReg(index & 0xf)
}

/// `st(0)..st(7)` live in `v16..23`.
pub fn st_vreg(index: u8) -> VReg {
    VReg(16 + (index & 0x7))
}

/// Condition codes for conditional branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    EQ = 0b0000,
    NE = 0b0001,
    CS = 0b0010,
    CC = 0b0011,
    MI = 0b0100,
    PL = 0b0101,
    VS = 0b0110,
    VC = 0b0111,
    HI = 0b1000,
    LS = 0b1001,
    GE = 0b1010,
    LT = 0b1011,
    GT = 0b1100,
    LE = 0b1101,
    AL = 0b1110,
}

impl Cond {
    const ALL: [Cond; 15] = [
        Cond::EQ,
        Cond::NE,
        Cond::CS,
        Cond::CC,
        Cond::MI,
        Cond::PL,
        Cond::VS,
        Cond::VC,
        Cond::HI,
        Cond::LS,
        Cond::GE,
        Cond::LT,
        Cond::GT,
        Cond::LE,
        Cond::AL,
    ];

    /// `0b1111` decodes as AL (it is "always" as well).
    pub fn from_bits(bits: u8) -> Cond {
        Self::ALL
            .get((bits & 0xf) as usize)
            .copied()
            .unwrap_or(Cond::AL)
    }

    /// Native condition for an x86 condition, with the guest carry flag stored inverted in C.
    /// Parity has no native counterpart.
    pub fn from_x86(cond: X86Cond) -> Option<Cond> {
        Some(match cond {
            X86Cond::O => Cond::VS,
            X86Cond::No => Cond::VC,
            X86Cond::B => Cond::CC,
            X86Cond::Ae => Cond::CS,
            X86Cond::E => Cond::EQ,
            X86Cond::Ne => Cond::NE,
            X86Cond::Be => Cond::LS,
            X86Cond::A => Cond::HI,
            X86Cond::S => Cond::MI,
            X86Cond::Ns => Cond::PL,
            X86Cond::P | X86Cond::Np => return None,
            X86Cond::L => Cond::LT,
            X86Cond::Ge => Cond::GE,
            X86Cond::Le => Cond::LE,
            X86Cond::G => Cond::GT,
        })
    }

    /// Evaluate against an NZCV nibble (`N` in bit 3).
    pub fn holds(self, nzcv: u8) -> bool {
        let n = nzcv & 0b1000 != 0;
        let z = nzcv & 0b0100 != 0;
        let c = nzcv & 0b0010 != 0;
        let v = nzcv & 0b0001 != 0;
        match self {
            Cond::EQ => z,
            Cond::NE => !z,
            Cond::CS => c,
            Cond::CC => !c,
            Cond::MI => n,
            Cond::PL => !n,
            Cond::VS => v,
            Cond::VC => !v,
            Cond::HI => c && !z,
            Cond::LS => !c || z,
            Cond::GE => n == v,
            Cond::LT => n != v,
            Cond::GT => !z && n == v,
            Cond::LE => z || n != v,
            Cond::AL => true,
        }
    }
}

impl fmt::Display for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Cond::EQ => "eq",
            Cond::NE => "ne",
            Cond::CS => "cs",
            Cond::CC => "cc",
            Cond::MI => "mi",
            Cond::PL => "pl",
            Cond::VS => "vs",
            Cond::VC => "vc",
            Cond::HI => "hi",
            Cond::LS => "ls",
            Cond::GE => "ge",
            Cond::LT => "lt",
            Cond::GT => "gt",
            Cond::LE => "le",
            Cond::AL => "al",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_map_is_bijective() {
        let mut seen = std::collections::HashSet::new();
        for reg in GPR_MAP {
            assert!(seen.insert(reg), "{reg:?} mapped twice");
            assert_ne!(reg, SCRATCH);
            assert_ne!(reg, DEFAULT_REG);
        }
        assert_eq!(map_gpr(4), Reg::X28);
        assert_eq!(map_gpr(200), DEFAULT_REG);
    }

    #[test]
    fn carry_conditions_use_inverted_carry() {
        // x86 CF=1 is stored as C=0.
        let borrow = 0b0000;
        assert!(Cond::from_x86(X86Cond::B).unwrap().holds(borrow));
        assert!(!Cond::from_x86(X86Cond::Ae).unwrap().holds(borrow));
        assert_eq!(Cond::from_x86(X86Cond::P), None);
    }
}
