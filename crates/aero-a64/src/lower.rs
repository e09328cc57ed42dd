//! x86 → A64 lowering.
//!
//! Each decoded instruction becomes a short, self-contained run of A64 words. Guest registers
//! live in the host registers given by [`crate::GPR_MAP`]; effective addresses are resolved at
//! decode time and materialized into [`SCRATCH`].

use aero_x86::{AluOp, Cond as X86Cond, DecodedInstruction, FpuOp, InstKind, MovDir, SimdOp};
use thiserror::Error;

use crate::emit::{Emitter, FpOp};
use crate::flags::{FlagEffect, FlagOp, FlagOperand};
use crate::reg::{map_gpr, st_vreg, xmm_vreg, Cond, Reg, VReg, SCRATCH, SCRATCH_V};

/// `SVC` immediate used for `SYSCALL`; `INT n` uses `n` itself.
pub const SYSCALL_SVC_IMM: u16 = 0x100;

const IMM26_MAX: i64 = (1 << 25) - 1;
const IMM19_MAX: i64 = (1 << 18) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LowerError {
    #[error("immediate {0:#x} needs more than 32 bits")]
    ImmediateTooWide(u64),
    #[error("branch displacement {0} is not a multiple of 4")]
    MisalignedBranch(i64),
    #[error("branch displacement {0} does not fit the native branch encoding")]
    BranchOutOfRange(i64),
    #[error("condition {0:?} has no native counterpart")]
    UnsupportedCondition(X86Cond),
    #[error("{0} has no register form to lower")]
    UnsupportedForm(&'static str),
    #[error("{0} is missing an operand")]
    MissingOperand(&'static str),
}

/// Code for one guest instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lowered {
    pub words: Vec<u32>,
    /// Set when the instruction updates the guest status flags.
    pub flags: Option<FlagEffect>,
}

impl Lowered {
    fn code(e: Emitter) -> Self {
        Self {
            words: e.into_code(),
            flags: None,
        }
    }

    fn nop() -> Self {
        let mut e = Emitter::new();
        e.nop();
        Self::code(e)
    }
}

fn operand(reg: Option<u8>, mnemonic: &'static str) -> Result<u8, LowerError> {
    reg.ok_or(LowerError::MissingOperand(mnemonic))
}

fn branch_words(rel: i64, max: i64) -> Result<i32, LowerError> {
    if rel % 4 != 0 {
        return Err(LowerError::MisalignedBranch(rel));
    }
    let words = rel / 4;
    if words > max || words < -max - 1 {
        return Err(LowerError::BranchOutOfRange(rel));
    }
    Ok(words as i32)
}

/// Lower a base-family instruction. Instructions without a lowering rule, including memory forms
/// of the ALU group, become a single `NOP`.
pub fn lower(inst: &DecodedInstruction) -> Result<Lowered, LowerError> {
    if !inst.valid {
        return Ok(Lowered::nop());
    }
    let wide = inst.rex_w();
    let mut e = Emitter::new();
    let mut flags = None;

    match inst.kind {
        InstKind::Nop => e.nop(),
        InstKind::Ret => e.ret(),
        InstKind::Hlt => e.hlt(0),
        InstKind::MovImm => {
            let rd = map_gpr(operand(inst.dst_reg, inst.mnemonic)?);
            let value = inst
                .immediate
                .ok_or(LowerError::MissingOperand(inst.mnemonic))? as u64;
            if value > u32::MAX as u64 {
                return Err(LowerError::ImmediateTooWide(value));
            }
            e.materialize(rd, value, wide);
        }
        InstKind::AccImm(op) => {
            let imm = inst
                .immediate
                .ok_or(LowerError::MissingOperand(inst.mnemonic))? as u64
                & 0xfff;
            let acc = map_gpr(0);
            let flag_op = match op {
                AluOp::Add => {
                    e.add_imm(acc, acc, imm as u16, wide);
                    FlagOp::Add
                }
                AluOp::Sub => {
                    e.sub_imm(acc, acc, imm as u16, wide);
                    FlagOp::Sub
                }
                AluOp::Cmp => {
                    e.subs_imm(Reg::XZR, acc, imm as u16, wide);
                    FlagOp::Sub
                }
                _ => return Ok(Lowered::nop()),
            };
            flags = Some(FlagEffect {
                op: flag_op,
                dst: 0,
                rhs: FlagOperand::Imm(imm),
                writes_dst: op.writes_dst(),
            });
        }
        InstKind::Jmp | InstKind::Jcc(_) | InstKind::Call => {
            let rel = inst
                .immediate
                .ok_or(LowerError::MissingOperand(inst.mnemonic))?;
            match inst.kind {
                InstKind::Jcc(cond) => {
                    let native =
                        Cond::from_x86(cond).ok_or(LowerError::UnsupportedCondition(cond))?;
                    e.b_cond(native, branch_words(rel, IMM19_MAX)?);
                }
                InstKind::Call => e.bl(branch_words(rel, IMM26_MAX)?),
                _ => e.b(branch_words(rel, IMM26_MAX)?),
            }
        }
        InstKind::Push => {
            let rt = map_gpr(operand(inst.src_reg, inst.mnemonic)?);
            e.str_pre(rt, map_gpr(4), -16);
        }
        InstKind::Pop => {
            let rt = map_gpr(operand(inst.dst_reg, inst.mnemonic)?);
            e.ldr_post(rt, map_gpr(4), 16);
        }
        InstKind::Int(vector) => e.svc(vector as u16),
        InstKind::Syscall => e.svc(SYSCALL_SVC_IMM),
        InstKind::Mov(dir) => match (inst.dst_reg, inst.src_reg) {
            (Some(d), Some(s)) => e.mov_reg(map_gpr(d), map_gpr(s), wide),
            (None, Some(s)) if dir == MovDir::ToRm => {
                e.materialize(SCRATCH, inst.effective_address, true);
                e.str_base(map_gpr(s), SCRATCH, wide);
            }
            (Some(d), None) if dir == MovDir::FromRm => {
                e.materialize(SCRATCH, inst.effective_address, true);
                e.ldr_base(map_gpr(d), SCRATCH, wide);
            }
            _ => return Err(LowerError::MissingOperand(inst.mnemonic)),
        },
        InstKind::Alu(op) => {
            let (Some(d), Some(s)) = (inst.dst_reg, inst.src_reg) else {
                return Ok(Lowered::nop());
            };
            let (rd, rs) = (map_gpr(d), map_gpr(s));
            let flag_op = match op {
                AluOp::Add => {
                    e.add_reg(rd, rd, rs, wide);
                    FlagOp::Add
                }
                AluOp::Sub => {
                    e.sub_reg(rd, rd, rs, wide);
                    FlagOp::Sub
                }
                AluOp::Cmp => {
                    e.subs_reg(Reg::XZR, rd, rs, wide);
                    FlagOp::Sub
                }
                AluOp::And => {
                    e.and_reg(rd, rd, rs, wide);
                    FlagOp::Logic
                }
                AluOp::Or => {
                    e.orr_reg(rd, rd, rs, wide);
                    FlagOp::Logic
                }
                AluOp::Xor => {
                    e.eor_reg(rd, rd, rs, wide);
                    FlagOp::Logic
                }
                AluOp::Test => {
                    e.ands_reg(Reg::XZR, rd, rs, wide);
                    FlagOp::Logic
                }
            };
            flags = Some(FlagEffect {
                op: flag_op,
                dst: d,
                rhs: FlagOperand::Reg(s),
                writes_dst: op.writes_dst(),
            });
        }
        InstKind::Lea => {
            let rd = map_gpr(operand(inst.dst_reg, inst.mnemonic)?);
            let ea = if wide {
                inst.effective_address
            } else {
                inst.effective_address & 0xffff_ffff
            };
            e.materialize(rd, ea, wide);
        }
        InstKind::Fpu(_)
        | InstKind::Simd(_)
        | InstKind::String { .. }
        | InstKind::Bit(_)
        | InstKind::Invalid => e.nop(),
    }

    Ok(Lowered {
        words: e.into_code(),
        flags,
    })
}

fn st(i: u8) -> VReg {
    st_vreg(i)
}

/// Shift `st(0..6)` into `st(1..7)` and load `st(0)` from the scratch register.
fn x87_push(e: &mut Emitter) {
    for k in (1..8).rev() {
        e.fmov_d(st(k), st(k - 1));
    }
    e.fmov_d(st(0), SCRATCH_V);
}

/// Shift `st(1..7)` into `st(0..6)` and clear `st(7)`.
fn x87_pop(e: &mut Emitter) {
    for k in 0..7 {
        e.fmov_d(st(k), st(k + 1));
    }
    e.fmov_d_from_x(st(7), Reg::XZR);
}

/// Lower a floating-point or SIMD instruction. The x87 stack lives in `v16..v23` as doubles and
/// XMM registers in `v0..v15`.
pub fn lower_extended(inst: &DecodedInstruction) -> Result<Lowered, LowerError> {
    let mut e = Emitter::new();
    match inst.kind {
        InstKind::Fpu(op) => match op {
            FpuOp::Fadd(i) => e.fp_arith(FpOp::Add, st(0), st(0), st(i), true),
            FpuOp::Fsub(i) => e.fp_arith(FpOp::Sub, st(0), st(0), st(i), true),
            FpuOp::Fmul(i) => e.fp_arith(FpOp::Mul, st(0), st(0), st(i), true),
            FpuOp::Fdiv(i) => e.fp_arith(FpOp::Div, st(0), st(0), st(i), true),
            FpuOp::Fld(i) => {
                e.fmov_d(SCRATCH_V, st(i));
                x87_push(&mut e);
            }
            FpuOp::Fld1 => {
                e.fmov_d_imm(SCRATCH_V, 0x70);
                x87_push(&mut e);
            }
            FpuOp::Fldz => {
                e.fmov_d_from_x(SCRATCH_V, Reg::XZR);
                x87_push(&mut e);
            }
            FpuOp::Fxch(i) => {
                e.fmov_d(SCRATCH_V, st(0));
                e.fmov_d(st(0), st(i));
                e.fmov_d(st(i), SCRATCH_V);
            }
            FpuOp::Fstp(i) => {
                e.fmov_d(st(i), st(0));
                x87_pop(&mut e);
            }
            FpuOp::Fchs => e.fneg_d(st(0), st(0)),
            FpuOp::Fabs => e.fabs_d(st(0), st(0)),
            FpuOp::Memory { .. } => return Err(LowerError::UnsupportedForm(inst.mnemonic)),
        },
        InstKind::Simd(op) => {
            let (Some(d), Some(s)) = (inst.dst_reg, inst.src_reg) else {
                return Err(LowerError::UnsupportedForm(inst.mnemonic));
            };
            let (vd, vs) = (xmm_vreg(d), xmm_vreg(s));
            let scalar = |e: &mut Emitter, fp: FpOp| {
                e.fp_arith(fp, SCRATCH_V, vd, vs, false);
                e.ins_s0(vd, SCRATCH_V);
            };
            match op {
                SimdOp::Movss => e.ins_s0(vd, vs),
                SimdOp::Addss => scalar(&mut e, FpOp::Add),
                SimdOp::Subss => scalar(&mut e, FpOp::Sub),
                SimdOp::Mulss => scalar(&mut e, FpOp::Mul),
                SimdOp::Divss => scalar(&mut e, FpOp::Div),
                SimdOp::Movaps => e.orr_16b(vd, vs, vs),
                SimdOp::Addps => e.fadd_4s(vd, vd, vs),
                SimdOp::Mulps => e.fmul_4s(vd, vd, vs),
                SimdOp::Paddb => e.add_16b(vd, vd, vs),
                SimdOp::Paddd => e.add_4s(vd, vd, vs),
                SimdOp::Pxor => e.eor_16b(vd, vd, vs),
            }
        }
        _ => return Err(LowerError::UnsupportedForm(inst.mnemonic)),
    }
    Ok(Lowered::code(e))
}
