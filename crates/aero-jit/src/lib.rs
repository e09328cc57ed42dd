//! JIT page management for translated code.
//!
//! [`JitMemoryManager`] owns host pages and enforces write-xor-execute: a page accepts writes
//! only while writable and control transfers only while executable. Translated guest blocks are
//! run from executable pages by a [`BlockExecutor`]; [`A64Interpreter`] is the portable one.

mod exec;
mod manager;
mod page;

use aero_cpu::MemoryError;
use thiserror::Error;

pub use exec::{A64Bus, A64Interpreter, A64State, BlockExecutor, BlockExit, NoMemory};
pub use manager::{JitMemoryManager, JitStats, PageId, PageState, MAX_PAGES};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JitError {
    #[error("failed to allocate a {size}-byte JIT page: {reason}")]
    AllocationFailed { size: usize, reason: String },
    #[error("failed to make JIT page {to}: {reason}")]
    PermissionTransition { to: &'static str, reason: String },
    #[error("{0} is executable and cannot be written")]
    WriteToExecutable(PageId),
    #[error("{0} is writable and cannot be executed")]
    ExecuteWritable(PageId),
    #[error("{0} does not exist")]
    UnknownPage(PageId),
    #[error("{len} bytes of code do not fit a {size}-byte page")]
    CodeTooLarge { len: usize, size: usize },
    #[error("page limit of {max} reached")]
    TooManyPages { max: usize },
    #[error("{page} exited abnormally: {reason}")]
    AbnormalExit { page: PageId, reason: String },
    #[error("undefined instruction {word:#010x} at offset {offset:#x}")]
    UndefinedInstruction { offset: usize, word: u32 },
    #[error(transparent)]
    Memory(#[from] MemoryError),
}
