//! Table-driven decoder for the supported x86-64 subset.
//!
//! The decoder never looks at more than [`MAX_INST_LEN`] bytes and never past the end of the
//! supplied window. Operand fields are only recorded once every byte of the field was available,
//! so a truncated instruction leaves them absent.

use aero_cpu::{CpuState, MAX_INST_LEN};
use thiserror::Error;

use crate::inst::{
    AluOp, BitOp, Cond, DecodedInstruction, FpuOp, InstKind, MovDir, OpcodeMap, RepPrefix, SimdOp,
    StringOp, Width,
};

/// Register values used to resolve effective addresses.
pub trait AddressRegs {
    fn gpr_at(&self, index: u8) -> u64;
}

impl AddressRegs for CpuState {
    fn gpr_at(&self, index: u8) -> u64 {
        CpuState::gpr_at(self, index)
    }
}

/// Resolves every register to zero; used when decoding outside of a run (disassembly).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRegs;

impl AddressRegs for NoRegs {
    fn gpr_at(&self, _index: u8) -> u64 {
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("no bytes available")]
    Empty,
    #[error("instruction truncated: needs at least {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("unrecognized opcode {opcode:#04x} ({map:?} map)")]
    UnknownOpcode { map: OpcodeMap, opcode: u8 },
    #[error("prefix {prefix:#04x} is not supported with opcode {opcode:#04x}")]
    UnsupportedPrefix { prefix: u8, opcode: u8 },
}

#[derive(Debug, Clone, Copy)]
enum ModRmForm {
    Mov(MovDir),
    Alu(AluOp),
    Lea,
}

#[derive(Debug, Clone, Copy)]
enum Form {
    Invalid,
    Fixed(InstKind),
    MovImm,
    AccImm(AluOp),
    JmpRel8,
    JccRel8,
    JmpRel32,
    CallRel32,
    Push,
    Pop,
    IntImm8,
    ModRm(ModRmForm),
    /// `bool` is true for the byte-sized opcode of the pair.
    String(StringOp, bool),
    Fpu,
    Escape0F,
}

#[derive(Debug, Clone, Copy)]
enum Form0F {
    Invalid,
    Syscall,
    JccRel32,
    /// SIMD opcode selected by the mandatory prefix: none, `66`, `F3`.
    Simd {
        none: Option<SimdOp>,
        p66: Option<SimdOp>,
        pf3: Option<SimdOp>,
    },
    /// `reg <- scan(r/m)`
    BitScan(BitOp),
    /// `r/m` is the bit base, `reg` the bit offset.
    BitTest(BitOp),
    /// `0F BA /4..7 ib`
    BitTestImm,
}

const fn primary_table() -> [Form; 256] {
    let mut t = [Form::Invalid; 256];
    t[0x90] = Form::Fixed(InstKind::Nop);
    t[0xC3] = Form::Fixed(InstKind::Ret);
    t[0xF4] = Form::Fixed(InstKind::Hlt);
    t[0xCC] = Form::Fixed(InstKind::Int(3));
    t[0xCD] = Form::IntImm8;
    t[0x05] = Form::AccImm(AluOp::Add);
    t[0x2D] = Form::AccImm(AluOp::Sub);
    t[0x3D] = Form::AccImm(AluOp::Cmp);
    t[0x01] = Form::ModRm(ModRmForm::Alu(AluOp::Add));
    t[0x09] = Form::ModRm(ModRmForm::Alu(AluOp::Or));
    t[0x21] = Form::ModRm(ModRmForm::Alu(AluOp::And));
    t[0x29] = Form::ModRm(ModRmForm::Alu(AluOp::Sub));
    t[0x31] = Form::ModRm(ModRmForm::Alu(AluOp::Xor));
    t[0x39] = Form::ModRm(ModRmForm::Alu(AluOp::Cmp));
    t[0x85] = Form::ModRm(ModRmForm::Alu(AluOp::Test));
    t[0x89] = Form::ModRm(ModRmForm::Mov(MovDir::ToRm));
    t[0x8B] = Form::ModRm(ModRmForm::Mov(MovDir::FromRm));
    t[0x8D] = Form::ModRm(ModRmForm::Lea);
    t[0xEB] = Form::JmpRel8;
    t[0xE9] = Form::JmpRel32;
    t[0xE8] = Form::CallRel32;
    t[0xA4] = Form::String(StringOp::Movs, true);
    t[0xA5] = Form::String(StringOp::Movs, false);
    t[0xA6] = Form::String(StringOp::Cmps, true);
    t[0xA7] = Form::String(StringOp::Cmps, false);
    t[0xAA] = Form::String(StringOp::Stos, true);
    t[0xAB] = Form::String(StringOp::Stos, false);
    t[0xAC] = Form::String(StringOp::Lods, true);
    t[0xAD] = Form::String(StringOp::Lods, false);
    t[0xAE] = Form::String(StringOp::Scas, true);
    t[0xAF] = Form::String(StringOp::Scas, false);
    t[0xD8] = Form::Fpu;
    t[0xD9] = Form::Fpu;
    t[0xDD] = Form::Fpu;
    t[0x0F] = Form::Escape0F;
    let mut i = 0;
    while i < 8 {
        t[0xB8 + i] = Form::MovImm;
        t[0x50 + i] = Form::Push;
        t[0x58 + i] = Form::Pop;
        i += 1;
    }
    let mut c = 0;
    while c < 16 {
        t[0x70 + c] = Form::JccRel8;
        c += 1;
    }
    t
}

const fn secondary_table() -> [Form0F; 256] {
    let mut t = [Form0F::Invalid; 256];
    t[0x05] = Form0F::Syscall;
    t[0x10] = Form0F::Simd {
        none: None,
        p66: None,
        pf3: Some(SimdOp::Movss),
    };
    t[0x28] = Form0F::Simd {
        none: Some(SimdOp::Movaps),
        p66: None,
        pf3: None,
    };
    t[0x58] = Form0F::Simd {
        none: Some(SimdOp::Addps),
        p66: None,
        pf3: Some(SimdOp::Addss),
    };
    t[0x59] = Form0F::Simd {
        none: Some(SimdOp::Mulps),
        p66: None,
        pf3: Some(SimdOp::Mulss),
    };
    t[0x5C] = Form0F::Simd {
        none: None,
        p66: None,
        pf3: Some(SimdOp::Subss),
    };
    t[0x5E] = Form0F::Simd {
        none: None,
        p66: None,
        pf3: Some(SimdOp::Divss),
    };
    t[0xFC] = Form0F::Simd {
        none: None,
        p66: Some(SimdOp::Paddb),
        pf3: None,
    };
    t[0xFE] = Form0F::Simd {
        none: None,
        p66: Some(SimdOp::Paddd),
        pf3: None,
    };
    t[0xEF] = Form0F::Simd {
        none: None,
        p66: Some(SimdOp::Pxor),
        pf3: None,
    };
    t[0xBC] = Form0F::BitScan(BitOp::Bsf);
    t[0xBD] = Form0F::BitScan(BitOp::Bsr);
    t[0xA3] = Form0F::BitTest(BitOp::Bt);
    t[0xAB] = Form0F::BitTest(BitOp::Bts);
    t[0xB3] = Form0F::BitTest(BitOp::Btr);
    t[0xBB] = Form0F::BitTest(BitOp::Btc);
    t[0xBA] = Form0F::BitTestImm;
    let mut c = 0;
    while c < 16 {
        t[0x80 + c] = Form0F::JccRel32;
        c += 1;
    }
    t
}

static PRIMARY: [Form; 256] = primary_table();
static SECONDARY: [Form0F; 256] = secondary_table();

#[derive(Debug, Clone, Copy, Default)]
struct Rex {
    w: bool,
    r: bool,
    x: bool,
    b: bool,
}

impl Rex {
    fn from_byte(b: Option<u8>) -> Self {
        match b {
            Some(b) => Self {
                w: (b & 0x08) != 0,
                r: (b & 0x04) != 0,
                x: (b & 0x02) != 0,
                b: (b & 0x01) != 0,
            },
            None => Self::default(),
        }
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn truncated(&self, len: usize) -> DecodeError {
        DecodeError::Truncated {
            needed: self.pos + len,
            available: self.bytes.len(),
        }
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        let b = self.bytes.get(self.pos).copied().ok_or(self.truncated(1))?;
        self.pos += 1;
        Ok(b)
    }

    fn le(&mut self, len: usize) -> Result<u64, DecodeError> {
        let field = self
            .bytes
            .get(self.pos..self.pos + len)
            .ok_or(self.truncated(len))?;
        let mut out = 0u64;
        for (i, b) in field.iter().enumerate() {
            out |= (*b as u64) << (i * 8);
        }
        self.pos += len;
        Ok(out)
    }

    fn i8(&mut self) -> Result<i64, DecodeError> {
        Ok(self.u8()? as i8 as i64)
    }

    fn i32(&mut self) -> Result<i64, DecodeError> {
        Ok(self.le(4)? as u32 as i32 as i64)
    }
}

#[derive(Debug, Clone, Copy)]
struct MemOperand {
    base: Option<u8>,
    index: Option<u8>,
    scale: u8,
    disp: i32,
    rip_relative: bool,
}

#[derive(Debug, Clone, Copy)]
enum Rm {
    Reg(u8),
    Mem(MemOperand),
}

struct Decoder<'a, R: ?Sized> {
    cur: Cursor<'a>,
    regs: &'a R,
    out: DecodedInstruction,
    rex: Rex,
    mem: Option<MemOperand>,
}

/// Decode one instruction from `bytes`, which start at guest address `rip`.
///
/// On failure the returned instruction has `length == 0` and `valid == false`; the fields that
/// were completely read before the failure are still filled in for diagnostics.
pub fn decode<R: AddressRegs + ?Sized>(bytes: &[u8], rip: u64, regs: &R) -> DecodedInstruction {
    match try_decode_partial(bytes, rip, regs) {
        Ok(inst) => inst,
        Err((_, partial)) => partial,
    }
}

/// Like [`decode`], but reports why decoding failed.
pub fn try_decode<R: AddressRegs + ?Sized>(
    bytes: &[u8],
    rip: u64,
    regs: &R,
) -> Result<DecodedInstruction, DecodeError> {
    try_decode_partial(bytes, rip, regs).map_err(|(err, _)| err)
}

fn try_decode_partial<R: AddressRegs + ?Sized>(
    bytes: &[u8],
    rip: u64,
    regs: &R,
) -> Result<DecodedInstruction, (DecodeError, DecodedInstruction)> {
    let window = &bytes[..bytes.len().min(MAX_INST_LEN)];
    let mut dec = Decoder {
        cur: Cursor {
            bytes: window,
            pos: 0,
        },
        regs,
        out: DecodedInstruction::empty(rip),
        rex: Rex::default(),
        mem: None,
    };
    if window.is_empty() {
        return Err((DecodeError::Empty, dec.out));
    }
    match dec.run() {
        Ok(()) => Ok(dec.finish()),
        Err(err) => {
            let mut partial = dec.out;
            partial.length = 0;
            partial.valid = false;
            partial.safe = false;
            partial.kind = InstKind::Invalid;
            partial.mnemonic = "(bad)";
            Err((err, partial))
        }
    }
}

impl<'a, R: AddressRegs + ?Sized> Decoder<'a, R> {
    fn run(&mut self) -> Result<(), DecodeError> {
        let mut b = self.cur.u8()?;
        if matches!(b, 0x66 | 0xF2 | 0xF3) {
            self.out.prefix = Some(b);
            b = self.cur.u8()?;
        }
        if (0x40..=0x4F).contains(&b) {
            self.out.rex = Some(b);
            self.rex = Rex::from_byte(Some(b));
            b = self.cur.u8()?;
        }
        self.out.opcode = b;
        self.out.width = if self.rex.w { Width::W64 } else { Width::W32 };

        let kind = match PRIMARY[b as usize] {
            Form::Invalid => {
                return Err(DecodeError::UnknownOpcode {
                    map: OpcodeMap::Primary,
                    opcode: b,
                })
            }
            // REX.B turns 90 into `xchg r8, rax`.
            Form::Fixed(InstKind::Nop) if self.rex.b => {
                return Err(DecodeError::UnknownOpcode {
                    map: OpcodeMap::Primary,
                    opcode: b,
                })
            }
            Form::Fixed(InstKind::Nop) if self.out.prefix == Some(0xF3) => InstKind::Nop,
            Form::Fixed(kind) => {
                self.no_prefix()?;
                if let InstKind::Int(vector) = kind {
                    self.out.immediate = Some(vector as i64);
                }
                kind
            }
            Form::MovImm => {
                self.no_prefix()?;
                self.out.dst_reg = Some(self.low3_reg(b));
                let imm = if self.rex.w {
                    self.cur.le(8)? as i64
                } else {
                    self.cur.le(4)? as i64
                };
                self.out.immediate = Some(imm);
                InstKind::MovImm
            }
            Form::AccImm(op) => {
                self.no_prefix()?;
                self.out.dst_reg = Some(0);
                self.out.immediate = Some(self.cur.i32()?);
                InstKind::AccImm(op)
            }
            Form::JmpRel8 => {
                self.no_prefix()?;
                self.out.immediate = Some(self.cur.i8()?);
                InstKind::Jmp
            }
            Form::JccRel8 => {
                self.no_prefix()?;
                self.out.immediate = Some(self.cur.i8()?);
                InstKind::Jcc(Cond::from_low4(b))
            }
            Form::JmpRel32 => {
                self.no_prefix()?;
                self.out.immediate = Some(self.cur.i32()?);
                InstKind::Jmp
            }
            Form::CallRel32 => {
                self.no_prefix()?;
                self.out.immediate = Some(self.cur.i32()?);
                InstKind::Call
            }
            Form::Push => {
                self.no_prefix()?;
                self.out.width = Width::W64;
                self.out.src_reg = Some(self.low3_reg(b));
                InstKind::Push
            }
            Form::Pop => {
                self.no_prefix()?;
                self.out.width = Width::W64;
                self.out.dst_reg = Some(self.low3_reg(b));
                InstKind::Pop
            }
            Form::IntImm8 => {
                self.no_prefix()?;
                let vector = self.cur.u8()?;
                self.out.immediate = Some(vector as i64);
                InstKind::Int(vector)
            }
            Form::ModRm(form) => {
                self.no_prefix()?;
                self.decode_modrm_form(form)?
            }
            Form::String(op, byte) => self.decode_string(op, byte),
            Form::Fpu => {
                self.no_prefix()?;
                self.decode_fpu(b)?
            }
            Form::Escape0F => self.decode_0f()?,
        };
        self.out.kind = kind;
        Ok(())
    }

    fn finish(mut self) -> DecodedInstruction {
        self.out.length = self.cur.pos as u8;
        if let Some(mem) = self.mem {
            self.out.has_memory_operand = true;
            self.out.effective_address = self.effective_address(mem);
        }
        self.out.valid = true;
        self.out.safe = is_safe(&self.out);
        self.out.mnemonic = mnemonic(self.out.kind, self.out.width);
        self.out
    }

    fn effective_address(&self, mem: MemOperand) -> u64 {
        let disp = mem.disp as i64 as u64;
        if mem.rip_relative {
            return self.out.next_rip_for(self.cur.pos).wrapping_add(disp);
        }
        let base = mem.base.map_or(0, |r| self.regs.gpr_at(r));
        let index = mem
            .index
            .map_or(0, |r| self.regs.gpr_at(r).wrapping_mul(mem.scale as u64));
        base.wrapping_add(index).wrapping_add(disp)
    }

    fn no_prefix(&self) -> Result<(), DecodeError> {
        match self.out.prefix {
            Some(prefix) => Err(DecodeError::UnsupportedPrefix {
                prefix,
                opcode: self.out.opcode,
            }),
            None => Ok(()),
        }
    }

    fn low3_reg(&self, opcode: u8) -> u8 {
        (opcode & 0x7) | if self.rex.b { 8 } else { 0 }
    }

    /// Reads the ModRM byte and any SIB/displacement, returning the `reg` field and r/m operand.
    fn modrm(&mut self) -> Result<(u8, Rm), DecodeError> {
        let byte = self.cur.u8()?;
        self.out.modrm = Some(byte);
        let mod_bits = byte >> 6;
        let reg = ((byte >> 3) & 0x7) | if self.rex.r { 8 } else { 0 };
        let rm_low3 = byte & 0x7;
        if mod_bits == 3 {
            return Ok((reg, Rm::Reg(rm_low3 | if self.rex.b { 8 } else { 0 })));
        }

        let mut mem = MemOperand {
            base: None,
            index: None,
            scale: 1,
            disp: 0,
            rip_relative: false,
        };
        let mut disp32_no_base = false;
        if rm_low3 == 4 {
            let sib = self.cur.u8()?;
            self.out.sib = Some(sib);
            mem.scale = 1 << (sib >> 6);
            let index = ((sib >> 3) & 0x7) | if self.rex.x { 8 } else { 0 };
            if index != 4 {
                mem.index = Some(index);
            }
            let base = (sib & 0x7) | if self.rex.b { 8 } else { 0 };
            if (base & 0x7) == 5 && mod_bits == 0 {
                disp32_no_base = true;
            } else {
                mem.base = Some(base);
            }
        } else if rm_low3 == 5 && mod_bits == 0 {
            mem.rip_relative = true;
        } else {
            mem.base = Some(rm_low3 | if self.rex.b { 8 } else { 0 });
        }

        let disp = match mod_bits {
            1 => Some(self.cur.i8()? as i32),
            2 => Some(self.cur.i32()? as i32),
            _ if mem.rip_relative || disp32_no_base => Some(self.cur.i32()? as i32),
            _ => None,
        };
        if let Some(disp) = disp {
            self.out.displacement = Some(disp);
            mem.disp = disp;
        }
        Ok((reg, Rm::Mem(mem)))
    }

    fn decode_modrm_form(&mut self, form: ModRmForm) -> Result<InstKind, DecodeError> {
        let (reg, rm) = self.modrm()?;
        let rm_reg = match rm {
            Rm::Reg(r) => Some(r),
            Rm::Mem(mem) => {
                self.mem = Some(mem);
                None
            }
        };
        let kind = match form {
            ModRmForm::Mov(MovDir::ToRm) | ModRmForm::Alu(_) => {
                self.out.dst_reg = rm_reg;
                self.out.src_reg = Some(reg);
                match form {
                    ModRmForm::Alu(op) => InstKind::Alu(op),
                    _ => InstKind::Mov(MovDir::ToRm),
                }
            }
            ModRmForm::Mov(MovDir::FromRm) => {
                self.out.dst_reg = Some(reg);
                self.out.src_reg = rm_reg;
                InstKind::Mov(MovDir::FromRm)
            }
            ModRmForm::Lea => {
                if rm_reg.is_some() {
                    return Err(DecodeError::UnknownOpcode {
                        map: OpcodeMap::Primary,
                        opcode: self.out.opcode,
                    });
                }
                self.out.dst_reg = Some(reg);
                InstKind::Lea
            }
        };
        Ok(kind)
    }

    fn decode_string(&mut self, op: StringOp, byte: bool) -> InstKind {
        let rep = match self.out.prefix {
            Some(0xF3) => Some(RepPrefix::Rep),
            Some(0xF2) => Some(RepPrefix::Repne),
            _ => None,
        };
        self.out.width = match (byte, self.out.prefix, self.rex.w) {
            (true, _, _) => Width::W8,
            (false, _, true) => Width::W64,
            (false, Some(0x66), false) => Width::W16,
            (false, _, false) => Width::W32,
        };
        let (src, dst) = match op {
            StringOp::Movs | StringOp::Cmps => (6, 7),
            StringOp::Stos | StringOp::Scas => (0, 7),
            StringOp::Lods => (6, 0),
        };
        self.out.src_reg = Some(src);
        self.out.dst_reg = Some(dst);
        InstKind::String { op, rep }
    }

    fn decode_fpu(&mut self, escape: u8) -> Result<InstKind, DecodeError> {
        let (reg, rm) = self.modrm()?;
        let reg = reg & 0x7;
        let i = match rm {
            Rm::Reg(r) => r & 0x7,
            Rm::Mem(mem) => {
                self.mem = Some(mem);
                return Ok(InstKind::Fpu(FpuOp::Memory { escape, reg }));
            }
        };
        let op = match (escape, reg, i) {
            (0xD8, 0, _) => FpuOp::Fadd(i),
            (0xD8, 1, _) => FpuOp::Fmul(i),
            (0xD8, 4, _) => FpuOp::Fsub(i),
            (0xD8, 6, _) => FpuOp::Fdiv(i),
            (0xD9, 0, _) => FpuOp::Fld(i),
            (0xD9, 1, _) => FpuOp::Fxch(i),
            (0xD9, 4, 0) => FpuOp::Fchs,
            (0xD9, 4, 1) => FpuOp::Fabs,
            (0xD9, 5, 0) => FpuOp::Fld1,
            (0xD9, 5, 6) => FpuOp::Fldz,
            (0xDD, 3, _) => FpuOp::Fstp(i),
            _ => {
                return Err(DecodeError::UnknownOpcode {
                    map: OpcodeMap::Primary,
                    opcode: escape,
                })
            }
        };
        match op {
            FpuOp::Fadd(i) | FpuOp::Fsub(i) | FpuOp::Fmul(i) | FpuOp::Fdiv(i) => {
                self.out.dst_reg = Some(0);
                self.out.src_reg = Some(i);
            }
            FpuOp::Fld(i) | FpuOp::Fxch(i) => self.out.src_reg = Some(i),
            FpuOp::Fstp(i) => self.out.dst_reg = Some(i),
            _ => {}
        }
        Ok(InstKind::Fpu(op))
    }

    fn decode_0f(&mut self) -> Result<InstKind, DecodeError> {
        let b = self.cur.u8()?;
        self.out.map = OpcodeMap::Secondary;
        self.out.opcode = b;
        let unknown = DecodeError::UnknownOpcode {
            map: OpcodeMap::Secondary,
            opcode: b,
        };
        match SECONDARY[b as usize] {
            Form0F::Invalid => Err(unknown),
            Form0F::Syscall => {
                self.no_prefix()?;
                Ok(InstKind::Syscall)
            }
            Form0F::JccRel32 => {
                self.no_prefix()?;
                self.out.immediate = Some(self.cur.i32()?);
                Ok(InstKind::Jcc(Cond::from_low4(b)))
            }
            Form0F::Simd { none, p66, pf3 } => {
                let op = match self.out.prefix {
                    None => none,
                    Some(0x66) => p66,
                    Some(0xF3) => pf3,
                    Some(_) => None,
                };
                let op = op.ok_or(match self.out.prefix {
                    Some(prefix) => DecodeError::UnsupportedPrefix { prefix, opcode: b },
                    None => unknown,
                })?;
                let (reg, rm) = self.modrm()?;
                self.out.width = Width::W32;
                self.out.dst_reg = Some(reg);
                match rm {
                    Rm::Reg(r) => self.out.src_reg = Some(r),
                    Rm::Mem(mem) => self.mem = Some(mem),
                }
                Ok(InstKind::Simd(op))
            }
            Form0F::BitScan(op) => {
                self.no_prefix()?;
                let (reg, rm) = self.modrm()?;
                self.out.dst_reg = Some(reg);
                match rm {
                    Rm::Reg(r) => self.out.src_reg = Some(r),
                    Rm::Mem(mem) => self.mem = Some(mem),
                }
                Ok(InstKind::Bit(op))
            }
            Form0F::BitTest(op) => {
                self.no_prefix()?;
                let (reg, rm) = self.modrm()?;
                self.out.src_reg = Some(reg);
                match rm {
                    Rm::Reg(r) => self.out.dst_reg = Some(r),
                    Rm::Mem(mem) => self.mem = Some(mem),
                }
                Ok(InstKind::Bit(op))
            }
            Form0F::BitTestImm => {
                self.no_prefix()?;
                let (reg, rm) = self.modrm()?;
                let op = match reg & 0x7 {
                    4 => BitOp::Bt,
                    5 => BitOp::Bts,
                    6 => BitOp::Btr,
                    7 => BitOp::Btc,
                    _ => return Err(unknown),
                };
                match rm {
                    Rm::Reg(r) => self.out.dst_reg = Some(r),
                    Rm::Mem(mem) => self.mem = Some(mem),
                }
                self.out.immediate = Some(self.cur.u8()? as i64);
                Ok(InstKind::Bit(op))
            }
        }
    }
}

impl DecodedInstruction {
    fn next_rip_for(&self, len: usize) -> u64 {
        self.rip.wrapping_add(len as u64)
    }
}

/// Memory-operand forms of the ALU and extended families are recognized for their length only.
fn is_safe(inst: &DecodedInstruction) -> bool {
    match inst.kind {
        InstKind::Invalid => false,
        InstKind::Alu(_)
        | InstKind::Fpu(_)
        | InstKind::Simd(_)
        | InstKind::Bit(_) => !inst.has_memory_operand,
        _ => true,
    }
}

fn mnemonic(kind: InstKind, width: Width) -> &'static str {
    const JCC: [&str; 16] = [
        "jo", "jno", "jb", "jae", "je", "jne", "jbe", "ja", "js", "jns", "jp", "jnp", "jl", "jge",
        "jle", "jg",
    ];
    let sized = |names: [&'static str; 4]| match width {
        Width::W8 => names[0],
        Width::W16 => names[1],
        Width::W32 => names[2],
        Width::W64 => names[3],
    };
    match kind {
        InstKind::Nop => "nop",
        InstKind::Ret => "ret",
        InstKind::Hlt => "hlt",
        InstKind::MovImm | InstKind::Mov(_) => "mov",
        InstKind::AccImm(op) | InstKind::Alu(op) => op.mnemonic(),
        InstKind::Jmp => "jmp",
        InstKind::Jcc(cond) => JCC[cond as usize],
        InstKind::Call => "call",
        InstKind::Push => "push",
        InstKind::Pop => "pop",
        InstKind::Int(_) => "int",
        InstKind::Syscall => "syscall",
        InstKind::Lea => "lea",
        InstKind::Fpu(op) => op.mnemonic(),
        InstKind::Simd(op) => op.mnemonic(),
        InstKind::Bit(op) => op.mnemonic(),
        InstKind::String { op, .. } => match op {
            StringOp::Movs => sized(["movsb", "movsw", "movsd", "movsq"]),
            StringOp::Stos => sized(["stosb", "stosw", "stosd", "stosq"]),
            StringOp::Lods => sized(["lodsb", "lodsw", "lodsd", "lodsq"]),
            StringOp::Cmps => sized(["cmpsb", "cmpsw", "cmpsd", "cmpsq"]),
            StringOp::Scas => sized(["scasb", "scasw", "scasd", "scasq"]),
        },
        InstKind::Invalid => "(bad)",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inst::InstFamily;

    fn dec(bytes: &[u8]) -> DecodedInstruction {
        decode(bytes, 0x1000, &NoRegs)
    }

    #[test]
    fn mov_imm32() {
        let inst = dec(&[0xB8, 0x0A, 0x00, 0x00, 0x00]);
        assert!(inst.valid && inst.safe);
        assert_eq!(inst.kind, InstKind::MovImm);
        assert_eq!(inst.dst_reg, Some(0));
        assert_eq!(inst.immediate, Some(10));
        assert_eq!(inst.length, 5);
        assert_eq!(inst.to_string(), "mov eax, 0xa");
    }

    #[test]
    fn rex_extends_registers_and_immediate() {
        let inst = dec(&[0x49, 0xBB, 1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(inst.dst_reg, Some(11));
        assert_eq!(inst.immediate, Some(0x0807_0605_0403_0201));
        assert_eq!(inst.length, 10);
        assert_eq!(inst.width, Width::W64);

        let push = dec(&[0x41, 0x57]);
        assert_eq!((push.kind, push.src_reg, push.length), (InstKind::Push, Some(15), 2));
    }

    #[test]
    fn truncated_immediate_is_left_absent() {
        let inst = dec(&[0xB8, 0x0A, 0x00]);
        assert_eq!(inst.length, 0);
        assert!(!inst.valid);
        assert_eq!(inst.opcode, 0xB8);
        assert_eq!(inst.immediate, None);
        assert_eq!(
            try_decode(&[0xB8, 0x0A, 0x00], 0, &NoRegs),
            Err(DecodeError::Truncated {
                needed: 5,
                available: 3
            })
        );
    }

    #[test]
    fn truncated_displacement_is_left_absent() {
        // mov eax, [rbx+disp32] with only two displacement bytes.
        let inst = dec(&[0x8B, 0x83, 0x10, 0x00]);
        assert_eq!(inst.length, 0);
        assert_eq!(inst.modrm, Some(0x83));
        assert_eq!(inst.displacement, None);
    }

    #[test]
    fn unknown_opcode_consumes_nothing() {
        let inst = dec(&[0x06, 0x90, 0x90]);
        assert!(!inst.valid);
        assert_eq!(inst.length, 0);
        assert_eq!(inst.modrm, None);
        assert_eq!(inst.immediate, None);
    }

    #[test]
    fn short_jumps_keep_signed_offsets() {
        let inst = dec(&[0x75, 0xFC]);
        assert_eq!(inst.kind, InstKind::Jcc(Cond::Ne));
        assert_eq!(inst.immediate, Some(-4));
        assert_eq!(inst.branch_target(), Some(0x0FFE));
        assert_eq!(inst.mnemonic, "jne");
    }

    #[test]
    fn modrm_memory_operands_resolve_addresses() {
        let mut cpu = CpuState::new(
            aero_cpu::GuestMemory::new(0, aero_cpu::MemoryLimits::default()).unwrap(),
        );
        cpu.set_gpr_at(3, 0x2000);
        cpu.set_gpr_at(1, 0x10);
        // mov eax, [rbx + rcx*4 + 8]
        let inst = decode(&[0x8B, 0x44, 0x8B, 0x08], 0x1000, &cpu);
        assert_eq!(inst.length, 4);
        assert_eq!(inst.sib, Some(0x8B));
        assert_eq!(inst.displacement, Some(8));
        assert!(inst.has_memory_operand);
        assert_eq!(inst.effective_address, 0x2048);
        assert_eq!(inst.dst_reg, Some(0));
        assert_eq!(inst.src_reg, None);

        // lea rax, [rip + 0x10]
        let lea = decode(&[0x48, 0x8D, 0x05, 0x10, 0, 0, 0], 0x1000, &cpu);
        assert_eq!(lea.kind, InstKind::Lea);
        assert_eq!(lea.effective_address, 0x1000 + 7 + 0x10);
    }

    #[test]
    fn alu_memory_forms_are_not_safe() {
        let reg = dec(&[0x01, 0xC8]);
        assert_eq!(reg.kind, InstKind::Alu(AluOp::Add));
        assert_eq!((reg.dst_reg, reg.src_reg), (Some(0), Some(1)));
        assert!(reg.safe);

        let mem = dec(&[0x01, 0x08]);
        assert!(mem.valid);
        assert!(!mem.safe);
    }

    #[test]
    fn extended_families_are_classified() {
        assert_eq!(dec(&[0xD8, 0xC1]).family(), InstFamily::FloatingPoint);
        assert_eq!(dec(&[0xD8, 0xC1]).kind, InstKind::Fpu(FpuOp::Fadd(1)));
        assert_eq!(dec(&[0xF3, 0x0F, 0x58, 0xC1]).kind, InstKind::Simd(SimdOp::Addss));
        assert_eq!(dec(&[0x0F, 0x58, 0xC1]).kind, InstKind::Simd(SimdOp::Addps));
        assert_eq!(dec(&[0x66, 0x0F, 0xFC, 0xC1]).kind, InstKind::Simd(SimdOp::Paddb));
        assert_eq!(dec(&[0xA4]).family(), InstFamily::String);
        assert_eq!(dec(&[0xF3, 0xAA]).to_string(), "rep stosb");
        assert_eq!(dec(&[0x0F, 0xBC, 0xC1]).kind, InstKind::Bit(BitOp::Bsf));
        let bt = dec(&[0x48, 0x0F, 0xBA, 0xE0, 0x05]);
        assert_eq!(bt.kind, InstKind::Bit(BitOp::Bt));
        assert_eq!(bt.immediate, Some(5));
        assert_eq!(bt.length, 5);
    }

    #[test]
    fn mismatched_simd_prefix_is_rejected() {
        assert_eq!(
            try_decode(&[0x66, 0x0F, 0x10, 0xC1], 0, &NoRegs),
            Err(DecodeError::UnsupportedPrefix {
                prefix: 0x66,
                opcode: 0x10
            })
        );
    }
}
