use aero_cpu::CpuState;

pub use aero_a64::SYSCALL_SVC_IMM as SYSCALL_VECTOR;

/// Host side of `INT n` and `SYSCALL`.
///
/// `vector` is the interrupt number, or [`SYSCALL_VECTOR`] for `SYSCALL`. The returned value is
/// written to RAX before execution resumes after the trapping instruction.
pub trait TrapHandler {
    fn on_trap(&mut self, vector: u16, cpu: &mut CpuState) -> u64;
}

impl<F> TrapHandler for F
where
    F: FnMut(u16, &mut CpuState) -> u64,
{
    fn on_trap(&mut self, vector: u16, cpu: &mut CpuState) -> u64 {
        self(vector, cpu)
    }
}

/// Logs the trap and returns 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingTrapHandler;

impl TrapHandler for LoggingTrapHandler {
    fn on_trap(&mut self, vector: u16, cpu: &mut CpuState) -> u64 {
        tracing::warn!(vector, rip = cpu.rip, "unhandled guest trap");
        0
    }
}
