#![forbid(unsafe_code)]

//! The translation engine: one guest's state plus the fetch/decode/translate/execute loop.
//!
//! An [`Engine`] owns a [`aero_cpu::CpuState`] and its guest memory. Base-family instructions
//! are lowered to A64 by `aero-a64`, committed to a write-xor-execute page from `aero-jit` and run
//! from there; x87 and SIMD instructions take the same path through their own lowering, while
//! string and bit instructions are interpreted directly against the CPU state.

mod config;
pub mod diag;
mod engine;
mod error;
mod event;
mod extended;
mod trap;

pub use config::{parse_policy, ConfigError, EngineConfig};
pub use engine::{DispatchState, Engine, RunResult, StepExit};
pub use error::{EngineError, FaultKind};
pub use event::{EngineEvent, EventQueue, HaltReason};
pub use trap::{LoggingTrapHandler, TrapHandler, SYSCALL_VECTOR};

pub use aero_cpu::{AccessPolicy, CpuState, Gpr, RegionFlags, RegionId};
pub use aero_jit::{JitMemoryManager, JitStats};
pub use aero_x86::DisasmLine;
