#![forbid(unsafe_code)]

//! AArch64 code generation for decoded x86 instructions.
//!
//! [`emit`] knows how to encode individual A64 instruction words, [`lower`] decides which words
//! an x86 instruction becomes, and [`insn`] turns words back into a structured form for the block
//! executor and for listings.

pub mod emit;
pub mod flags;
pub mod insn;
pub mod lower;
pub mod reg;

pub use emit::{Emitter, FpOp};
pub use flags::{update_flags, FlagEffect, FlagOp, FlagOperand};
pub use insn::{
    decode_word, expand_fp_imm8, format_word, A64Insn, FpUnary, LogicOp, MoveWide, VecOp,
};
pub use lower::{lower, lower_extended, LowerError, Lowered, SYSCALL_SVC_IMM};
pub use reg::{
    map_gpr, st_vreg, xmm_vreg, Cond, Reg, VReg, DEFAULT_REG, GPR_MAP, SCRATCH, SCRATCH_V,
};
