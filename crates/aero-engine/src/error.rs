use aero_a64::LowerError;
use aero_cpu::{MemoryError, RegionError};
use aero_jit::JitError;
use aero_x86::DecodeError;
use thiserror::Error;

use crate::config::ConfigError;

/// Coarse classification of [`EngineError`], reported with every fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Truncated, unrecognized, untranslatable or unsafe instruction.
    Decode,
    /// Address below the minimum, outside the mapped bound or ceiling, or a permission violation.
    Memory,
    /// JIT page or engine setup failure.
    Resource,
    /// The instruction budget ran out under safety mode.
    BudgetExceeded,
}

impl FaultKind {
    pub fn name(self) -> &'static str {
        match self {
            FaultKind::Decode => "decode",
            FaultKind::Memory => "memory",
            FaultKind::Resource => "resource",
            FaultKind::BudgetExceeded => "budget-exceeded",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("failed to decode instruction at {rip:#x}: {source}")]
    Decode {
        rip: u64,
        #[source]
        source: DecodeError,
    },
    #[error("`{mnemonic}` at {rip:#x} is not permitted in safety mode")]
    Unsafe { rip: u64, mnemonic: &'static str },
    #[error("failed to translate `{mnemonic}` at {rip:#x}: {source}")]
    Translate {
        rip: u64,
        mnemonic: &'static str,
        #[source]
        source: LowerError,
    },
    #[error("`{mnemonic}` at {rip:#x} has no supported form")]
    Unsupported { rip: u64, mnemonic: &'static str },
    #[error("memory fault at rip {rip:#x}: {source}")]
    Memory {
        rip: u64,
        #[source]
        source: MemoryError,
    },
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error("JIT failure at rip {rip:#x}: {source}")]
    Jit {
        rip: u64,
        #[source]
        source: JitError,
    },
    #[error("engine setup failed: {0}")]
    Setup(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("instruction budget of {budget} exhausted")]
    BudgetExceeded { budget: u64 },
}

impl EngineError {
    pub fn kind(&self) -> FaultKind {
        match self {
            EngineError::Decode { .. }
            | EngineError::Unsafe { .. }
            | EngineError::Translate { .. }
            | EngineError::Unsupported { .. } => FaultKind::Decode,
            EngineError::Memory { .. } | EngineError::Region(_) => FaultKind::Memory,
            EngineError::Jit {
                source: JitError::Memory(_),
                ..
            } => FaultKind::Memory,
            EngineError::Jit { .. } | EngineError::Setup(_) | EngineError::Config(_) => {
                FaultKind::Resource
            }
            EngineError::BudgetExceeded { .. } => FaultKind::BudgetExceeded,
        }
    }

    /// Translated code reports guest memory faults through the JIT layer; surface them as plain
    /// memory faults.
    pub(crate) fn from_jit(rip: u64, err: JitError) -> Self {
        match err {
            JitError::Memory(source) => EngineError::Memory { rip, source },
            source => EngineError::Jit { rip, source },
        }
    }
}
