use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    W8,
    W16,
    W32,
    W64,
}

impl Width {
    pub fn bytes(self) -> usize {
        match self {
            Width::W8 => 1,
            Width::W16 => 2,
            Width::W32 => 4,
            Width::W64 => 8,
        }
    }

    pub fn mask(self) -> u64 {
        match self {
            Width::W64 => u64::MAX,
            w => (1u64 << (w.bytes() * 8)) - 1,
        }
    }
}

/// Which part of the pipeline handles an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstFamily {
    /// Translated by the code generator.
    Base,
    FloatingPoint,
    Simd,
    String,
    Bit,
}

impl InstFamily {
    pub fn is_extended(self) -> bool {
        self != InstFamily::Base
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcodeMap {
    Primary,
    /// `0F xx`
    Secondary,
}

/// Condition encoded in the low nibble of `70..7F` / `0F 80..8F`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xa,
    Np = 0xb,
    L = 0xc,
    Ge = 0xd,
    Le = 0xe,
    G = 0xf,
}

impl Cond {
    pub const ALL: [Cond; 16] = [
        Cond::O,
        Cond::No,
        Cond::B,
        Cond::Ae,
        Cond::E,
        Cond::Ne,
        Cond::Be,
        Cond::A,
        Cond::S,
        Cond::Ns,
        Cond::P,
        Cond::Np,
        Cond::L,
        Cond::Ge,
        Cond::Le,
        Cond::G,
    ];

    pub fn from_low4(code: u8) -> Cond {
        Self::ALL[(code & 0xf) as usize]
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Cond::O => "o",
            Cond::No => "no",
            Cond::B => "b",
            Cond::Ae => "ae",
            Cond::E => "e",
            Cond::Ne => "ne",
            Cond::Be => "be",
            Cond::A => "a",
            Cond::S => "s",
            Cond::Ns => "ns",
            Cond::P => "p",
            Cond::Np => "np",
            Cond::L => "l",
            Cond::Ge => "ge",
            Cond::Le => "le",
            Cond::G => "g",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Or,
    And,
    Sub,
    Xor,
    Cmp,
    Test,
}

impl AluOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            AluOp::Add => "add",
            AluOp::Or => "or",
            AluOp::And => "and",
            AluOp::Sub => "sub",
            AluOp::Xor => "xor",
            AluOp::Cmp => "cmp",
            AluOp::Test => "test",
        }
    }

    /// CMP and TEST only update flags.
    pub fn writes_dst(self) -> bool {
        !matches!(self, AluOp::Cmp | AluOp::Test)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovDir {
    /// `89 /r`: `r/m <- reg`
    ToRm,
    /// `8B /r`: `reg <- r/m`
    FromRm,
}

/// x87 register-stack forms. The operand is the `ST(i)` index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpuOp {
    Fadd(u8),
    Fsub(u8),
    Fmul(u8),
    Fdiv(u8),
    Fld(u8),
    Fxch(u8),
    Fstp(u8),
    Fld1,
    Fldz,
    Fchs,
    Fabs,
    /// Any memory-operand x87 form; decoded for length only.
    Memory { escape: u8, reg: u8 },
}

impl FpuOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            FpuOp::Fadd(_) => "fadd",
            FpuOp::Fsub(_) => "fsub",
            FpuOp::Fmul(_) => "fmul",
            FpuOp::Fdiv(_) => "fdiv",
            FpuOp::Fld(_) => "fld",
            FpuOp::Fxch(_) => "fxch",
            FpuOp::Fstp(_) => "fstp",
            FpuOp::Fld1 => "fld1",
            FpuOp::Fldz => "fldz",
            FpuOp::Fchs => "fchs",
            FpuOp::Fabs => "fabs",
            FpuOp::Memory { .. } => "fpu-mem",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimdOp {
    Movss,
    Addss,
    Subss,
    Mulss,
    Divss,
    Movaps,
    Addps,
    Mulps,
    Paddb,
    Paddd,
    Pxor,
}

impl SimdOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            SimdOp::Movss => "movss",
            SimdOp::Addss => "addss",
            SimdOp::Subss => "subss",
            SimdOp::Mulss => "mulss",
            SimdOp::Divss => "divss",
            SimdOp::Movaps => "movaps",
            SimdOp::Addps => "addps",
            SimdOp::Mulps => "mulps",
            SimdOp::Paddb => "paddb",
            SimdOp::Paddd => "paddd",
            SimdOp::Pxor => "pxor",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringOp {
    Movs,
    Stos,
    Lods,
    Cmps,
    Scas,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepPrefix {
    /// `F3`: REP for MOVS/STOS/LODS, REPE for CMPS/SCAS.
    Rep,
    /// `F2`: REPNE.
    Repne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOp {
    Bsf,
    Bsr,
    Bt,
    Bts,
    Btr,
    Btc,
}

impl BitOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            BitOp::Bsf => "bsf",
            BitOp::Bsr => "bsr",
            BitOp::Bt => "bt",
            BitOp::Bts => "bts",
            BitOp::Btr => "btr",
            BitOp::Btc => "btc",
        }
    }
}

/// Operation-level view of a decoded instruction. Operand registers, displacement and immediate
/// live on [`DecodedInstruction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstKind {
    Nop,
    Ret,
    Hlt,
    /// `B8+r`, register in `dst_reg`.
    MovImm,
    /// `05`/`2D`/`3D`: operation against the accumulator.
    AccImm(AluOp),
    Jmp,
    Jcc(Cond),
    Call,
    Push,
    Pop,
    Int(u8),
    Syscall,
    Mov(MovDir),
    Alu(AluOp),
    Lea,
    Fpu(FpuOp),
    Simd(SimdOp),
    String {
        op: StringOp,
        rep: Option<RepPrefix>,
    },
    Bit(BitOp),
    Invalid,
}

impl InstKind {
    pub fn family(self) -> InstFamily {
        match self {
            InstKind::Fpu(_) => InstFamily::FloatingPoint,
            InstKind::Simd(_) => InstFamily::Simd,
            InstKind::String { .. } => InstFamily::String,
            InstKind::Bit(_) => InstFamily::Bit,
            _ => InstFamily::Base,
        }
    }

    pub fn is_branch(self) -> bool {
        matches!(self, InstKind::Jmp | InstKind::Jcc(_) | InstKind::Call)
    }
}

/// Structured result of decoding one instruction.
///
/// `length == 0` means the bytes could not be decoded and the caller must not advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub rip: u64,
    pub map: OpcodeMap,
    pub opcode: u8,
    pub prefix: Option<u8>,
    pub rex: Option<u8>,
    pub modrm: Option<u8>,
    pub sib: Option<u8>,
    pub displacement: Option<i32>,
    pub immediate: Option<i64>,
    pub length: u8,
    pub src_reg: Option<u8>,
    pub dst_reg: Option<u8>,
    pub has_memory_operand: bool,
    pub effective_address: u64,
    pub width: Width,
    pub kind: InstKind,
    pub valid: bool,
    pub safe: bool,
    pub mnemonic: &'static str,
}

impl DecodedInstruction {
    pub(crate) fn empty(rip: u64) -> Self {
        Self {
            rip,
            map: OpcodeMap::Primary,
            opcode: 0,
            prefix: None,
            rex: None,
            modrm: None,
            sib: None,
            displacement: None,
            immediate: None,
            length: 0,
            src_reg: None,
            dst_reg: None,
            has_memory_operand: false,
            effective_address: 0,
            width: Width::W32,
            kind: InstKind::Invalid,
            valid: false,
            safe: false,
            mnemonic: "(bad)",
        }
    }

    pub fn family(&self) -> InstFamily {
        self.kind.family()
    }

    pub fn next_rip(&self) -> u64 {
        self.rip.wrapping_add(self.length as u64)
    }

    /// Absolute target of a relative branch.
    pub fn branch_target(&self) -> Option<u64> {
        match (self.kind.is_branch(), self.immediate) {
            (true, Some(rel)) => Some(self.next_rip().wrapping_add(rel as u64)),
            _ => None,
        }
    }

    pub fn rex_w(&self) -> bool {
        self.rex.is_some_and(|r| r & 0x08 != 0)
    }
}

pub(crate) fn gpr_name(index: u8, width: Width) -> &'static str {
    const R64: [&str; 16] = [
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15",
    ];
    const R32: [&str; 16] = [
        "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d", "r11d",
        "r12d", "r13d", "r14d", "r15d",
    ];
    let i = (index & 0xf) as usize;
    match width {
        Width::W64 => R64[i],
        _ => R32[i],
    }
}

struct Xmm(u8);

impl fmt::Display for Xmm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xmm{}", self.0)
    }
}

impl DecodedInstruction {
    fn fmt_mem(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[0x{:x}]", self.effective_address)
    }

    fn fmt_gpr_or_mem(&self, f: &mut fmt::Formatter<'_>, reg: Option<u8>) -> fmt::Result {
        match reg {
            Some(r) => f.write_str(gpr_name(r, self.width)),
            None => self.fmt_mem(f),
        }
    }
}

impl fmt::Display for DecodedInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.valid {
            return f.write_str("(bad)");
        }
        let imm = self.immediate.unwrap_or(0);
        match self.kind {
            InstKind::Nop | InstKind::Ret | InstKind::Hlt | InstKind::Syscall => {
                f.write_str(self.mnemonic)
            }
            InstKind::MovImm => write!(
                f,
                "mov {}, 0x{:x}",
                gpr_name(self.dst_reg.unwrap_or(0), self.width),
                imm as u64 & self.width.mask()
            ),
            InstKind::AccImm(op) => write!(
                f,
                "{} {}, 0x{:x}",
                op.mnemonic(),
                gpr_name(0, self.width),
                imm as u64 & self.width.mask()
            ),
            InstKind::Jmp | InstKind::Jcc(_) | InstKind::Call => write!(
                f,
                "{} 0x{:x}",
                self.mnemonic,
                self.branch_target().unwrap_or(0)
            ),
            InstKind::Push | InstKind::Pop => {
                let reg = self.src_reg.or(self.dst_reg).unwrap_or(0);
                write!(f, "{} {}", self.mnemonic, gpr_name(reg, Width::W64))
            }
            InstKind::Int(vector) => write!(f, "int 0x{vector:x}"),
            InstKind::Mov(_) | InstKind::Alu(_) | InstKind::Lea => {
                write!(f, "{} ", self.mnemonic)?;
                self.fmt_gpr_or_mem(f, self.dst_reg)?;
                f.write_str(", ")?;
                self.fmt_gpr_or_mem(f, self.src_reg)
            }
            InstKind::Fpu(op) => match op {
                FpuOp::Fadd(i) | FpuOp::Fsub(i) | FpuOp::Fmul(i) | FpuOp::Fdiv(i) => {
                    write!(f, "{} st0, st({i})", self.mnemonic)
                }
                FpuOp::Fld(i) | FpuOp::Fxch(i) | FpuOp::Fstp(i) => {
                    write!(f, "{} st({i})", self.mnemonic)
                }
                FpuOp::Memory { .. } => {
                    write!(f, "{} ", self.mnemonic)?;
                    self.fmt_mem(f)
                }
                _ => f.write_str(self.mnemonic),
            },
            InstKind::Simd(_) => {
                write!(f, "{} {}, ", self.mnemonic, Xmm(self.dst_reg.unwrap_or(0)))?;
                match self.src_reg {
                    Some(r) => write!(f, "{}", Xmm(r)),
                    None => self.fmt_mem(f),
                }
            }
            InstKind::String { rep, .. } => {
                match rep {
                    Some(RepPrefix::Rep) => f.write_str("rep ")?,
                    Some(RepPrefix::Repne) => f.write_str("repne ")?,
                    None => {}
                }
                f.write_str(self.mnemonic)
            }
            InstKind::Bit(_) => {
                write!(f, "{} ", self.mnemonic)?;
                self.fmt_gpr_or_mem(f, self.dst_reg)?;
                f.write_str(", ")?;
                match self.src_reg {
                    Some(r) => f.write_str(gpr_name(r, self.width)),
                    None if self.immediate.is_some() => write!(f, "0x{imm:x}"),
                    None => self.fmt_mem(f),
                }
            }
            InstKind::Invalid => f.write_str("(bad)"),
        }
    }
}
