#![forbid(unsafe_code)]

//! x86-64 instruction decoding for the translator.
//!
//! Only a subset of the instruction set is recognized. Anything else decodes as invalid
//! (`length == 0`) and the dispatcher faults instead of guessing.

pub mod decoder;
pub mod disasm;
pub mod inst;

pub use decoder::{decode, try_decode, AddressRegs, DecodeError, NoRegs};
pub use disasm::{disassemble, DisasmLine};
pub use inst::{
    AluOp, BitOp, Cond, DecodedInstruction, FpuOp, InstFamily, InstKind, MovDir, OpcodeMap,
    RepPrefix, SimdOp, StringOp, Width,
};
