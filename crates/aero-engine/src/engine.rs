use std::fmt;
use std::sync::Arc;

use aero_a64::{lower, lower_extended, update_flags, FlagOperand, Lowered};
use aero_cpu::{
    CpuState, GuestMemory, Gpr, InstBytes, MemoryLimits, MemoryRegion, RegionFlags, RegionId,
    Span, MAX_INST_LEN,
};
use aero_jit::{A64Interpreter, BlockExit, JitMemoryManager, JitStats, PageId};
use aero_x86::{try_decode, DecodedInstruction, DisasmLine, InstFamily};

use crate::config::EngineConfig;
use crate::diag;
use crate::error::EngineError;
use crate::event::{EngineEvent, EventQueue, HaltReason};
use crate::extended;
use crate::trap::{LoggingTrapHandler, TrapHandler};

/// Size of one guest stack slot written by `PUSH`/`CALL`.
const STACK_SLOT: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Fetching,
    Decoding,
    Translating,
    Committing,
    Executing,
    Faulted,
    Halted,
}

/// Outcome of a single [`Engine::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepExit {
    Continue,
    Halted(HaltReason),
}

/// Outcome of a run that did not fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunResult {
    /// Instructions retired during this run.
    pub executed: u64,
    pub reason: HaltReason,
}

/// One guest: its CPU state and memory, a JIT page for translated code, and the dispatcher that
/// drives them.
pub struct Engine {
    config: EngineConfig,
    cpu: CpuState,
    jit: Arc<JitMemoryManager>,
    page: PageId,
    executor: A64Interpreter,
    trap: Box<dyn TrapHandler + Send>,
    events: EventQueue,
    state: DispatchState,
    entry: u64,
    image: Option<RegionId>,
    /// Outstanding `CALL`s; a `RET` at depth 0 ends the run.
    call_depth: u64,
    last_error: Option<EngineError>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state)
            .field("rip", &format_args!("{:#x}", self.cpu.rip))
            .field("executed", &self.cpu.executed)
            .field("page", &self.page)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_jit(config, Arc::new(JitMemoryManager::new()))
    }

    /// Build an engine whose translated code lives in pages of a shared manager.
    pub fn with_jit(config: EngineConfig, jit: Arc<JitMemoryManager>) -> Result<Self, EngineError> {
        config.validate()?;

        let limits = MemoryLimits {
            policy: config.policy,
            min_valid_address: config.min_valid_address,
            ceiling: config.memory_ceiling,
        };
        let mut memory = GuestMemory::new(config.memory_size, limits)
            .map_err(|err| EngineError::Setup(err.to_string()))?;
        memory.map_region(
            config.stack_base(),
            config.stack_size,
            RegionFlags::WRITABLE,
            "stack",
        )?;
        if config.heap_size > 0 {
            memory.map_region(
                config.heap_base(),
                config.heap_size,
                RegionFlags::WRITABLE,
                "heap",
            )?;
        }

        let mut cpu = CpuState::new(memory);
        cpu.stack = Span {
            base: config.stack_base(),
            size: config.stack_size,
        };
        cpu.heap = Span {
            base: config.heap_base(),
            size: config.heap_size,
        };
        cpu.budget = config.budget;
        cpu.safety = config.safety;

        let page = jit
            .allocate(config.jit_page_size)
            .map_err(|source| EngineError::Jit { rip: 0, source })?;

        let mut engine = Self {
            events: EventQueue::new(config.event_capacity),
            entry: config.load_address,
            config,
            cpu,
            jit,
            page,
            executor: A64Interpreter::new(),
            trap: Box::new(LoggingTrapHandler),
            state: DispatchState::Idle,
            image: None,
            call_depth: 0,
            last_error: None,
        };
        engine.reset_registers();
        tracing::debug!(
            memory = engine.config.memory_size,
            page = %engine.page,
            "engine created"
        );
        Ok(engine)
    }

    fn reset_registers(&mut self) {
        self.cpu.clear_registers();
        self.cpu.set_gpr(Gpr::Rsp, self.cpu.stack.end());
        self.cpu.rip = self.entry;
        self.call_depth = 0;
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn cpu(&self) -> &CpuState {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut CpuState {
        &mut self.cpu
    }

    pub fn gpr(&self, reg: Gpr) -> u64 {
        self.cpu.gpr(reg)
    }

    pub fn set_gpr(&mut self, reg: Gpr, value: u64) {
        self.cpu.set_gpr(reg, value);
    }

    pub fn entry(&self) -> u64 {
        self.entry
    }

    pub fn set_trap_handler(&mut self, handler: impl TrapHandler + Send + 'static) {
        self.trap = Box::new(handler);
    }

    /// Map `bytes` as a read/write/execute region at `address` and point RIP at `entry`.
    ///
    /// A previously loaded image is unmapped first.
    pub fn load_image(
        &mut self,
        address: u64,
        bytes: &[u8],
        entry: u64,
    ) -> Result<RegionId, EngineError> {
        if let Some(old) = self.image.take() {
            self.cpu.memory.unmap_region(old)?;
        }
        let id = self.cpu.memory.map_region(
            address,
            bytes.len() as u64,
            RegionFlags::WRITABLE | RegionFlags::EXECUTABLE,
            "image",
        )?;
        self.cpu
            .memory
            .load(address, bytes)
            .map_err(|source| EngineError::Memory { rip: entry, source })?;
        self.image = Some(id);
        self.entry = entry;
        self.cpu.rip = entry;
        self.call_depth = 0;
        tracing::debug!(address, len = bytes.len(), entry, "image loaded");
        Ok(id)
    }

    /// Copy `bytes` to the configured load address. No region is mapped.
    pub fn preload(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        let address = self.config.load_address;
        self.cpu
            .memory
            .load(address, bytes)
            .map_err(|source| EngineError::Memory {
                rip: address,
                source,
            })
    }

    pub fn map_region(
        &mut self,
        start: u64,
        size: u64,
        flags: RegionFlags,
        name: impl Into<String>,
    ) -> Result<RegionId, EngineError> {
        Ok(self.cpu.memory.map_region(start, size, flags, name)?)
    }

    pub fn unmap_region(&mut self, id: RegionId) -> Result<MemoryRegion, EngineError> {
        if self.image == Some(id) {
            self.image = None;
        }
        Ok(self.cpu.memory.unmap_region(id)?)
    }

    /// Run from the current RIP until the guest returns, halts, exhausts its budget, or faults.
    pub fn run(&mut self) -> Result<RunResult, EngineError> {
        self.cpu.executed = 0;
        self.last_error = None;
        self.state = DispatchState::Fetching;
        let rip = self.cpu.rip;
        tracing::debug!(
            rip,
            budget = self.cpu.budget,
            safety = self.cpu.safety,
            "run started"
        );
        self.events.push(EngineEvent::RunStarted { rip });

        loop {
            if let StepExit::Halted(reason) = self.step()? {
                return Ok(RunResult {
                    executed: self.cpu.executed,
                    reason,
                });
            }
        }
    }

    /// Execute one guest instruction.
    pub fn step(&mut self) -> Result<StepExit, EngineError> {
        match self.step_inner() {
            Ok(StepExit::Continue) => {
                self.state = DispatchState::Fetching;
                Ok(StepExit::Continue)
            }
            Ok(StepExit::Halted(reason)) => {
                self.halt(reason);
                Ok(StepExit::Halted(reason))
            }
            Err(err) => {
                self.fault(&err);
                Err(err)
            }
        }
    }

    fn halt(&mut self, reason: HaltReason) {
        self.state = DispatchState::Halted;
        if reason == HaltReason::BudgetExceeded {
            self.last_error = Some(EngineError::BudgetExceeded {
                budget: self.cpu.budget,
            });
        }
        let (rip, executed) = (self.cpu.rip, self.cpu.executed);
        tracing::debug!(rip, executed, ?reason, "run halted");
        self.events.push(EngineEvent::Halted {
            rip,
            executed,
            reason,
        });
    }

    fn fault(&mut self, err: &EngineError) {
        self.state = DispatchState::Faulted;
        let rip = self.cpu.rip;
        let kind = err.kind();
        tracing::warn!(
            rip,
            kind = kind.name(),
            last_inst = %self.cpu.last_inst,
            error = %err,
            "run faulted"
        );
        self.events.push(EngineEvent::Faulted {
            rip,
            kind,
            message: err.to_string(),
        });
        self.last_error = Some(err.clone());
    }

    fn step_inner(&mut self) -> Result<StepExit, EngineError> {
        if self.cpu.budget_exhausted() {
            return Ok(StepExit::Halted(HaltReason::BudgetExceeded));
        }

        let rip = self.cpu.rip;
        self.state = DispatchState::Fetching;
        let window = self
            .cpu
            .memory
            .fetch_window(rip, MAX_INST_LEN)
            .map_err(|source| EngineError::Memory { rip, source })?;
        let bytes = InstBytes::new(window);

        self.state = DispatchState::Decoding;
        let inst = match try_decode(bytes.as_slice(), rip, &self.cpu) {
            Ok(inst) => inst,
            Err(source) => {
                self.cpu.record_fetch(rip, bytes.as_slice());
                return Err(EngineError::Decode { rip, source });
            }
        };
        self.cpu
            .record_fetch(rip, &bytes.as_slice()[..inst.length as usize]);
        if self.cpu.safety && !inst.safe {
            return Err(EngineError::Unsafe {
                rip,
                mnemonic: inst.mnemonic,
            });
        }

        let exit = match inst.family() {
            InstFamily::Base | InstFamily::FloatingPoint | InstFamily::Simd => {
                self.state = DispatchState::Translating;
                let lowered = if inst.family() == InstFamily::Base {
                    lower(&inst)
                } else {
                    lower_extended(&inst)
                }
                .map_err(|source| EngineError::Translate {
                    rip,
                    mnemonic: inst.mnemonic,
                    source,
                })?;
                self.execute_lowered(&inst, &lowered)?
            }
            InstFamily::String | InstFamily::Bit => {
                self.state = DispatchState::Executing;
                extended::execute(&mut self.cpu, &inst)?;
                self.cpu.rip = inst.next_rip();
                StepExit::Continue
            }
        };

        self.cpu.executed += 1;
        tracing::trace!(rip, inst = %inst, "retired");
        if self.config.trace_instructions {
            self.events.push(EngineEvent::Retired {
                rip,
                text: inst.to_string(),
            });
        }
        Ok(exit)
    }

    fn flag_operand(&self, rhs: FlagOperand) -> u64 {
        match rhs {
            FlagOperand::Imm(v) => v,
            FlagOperand::Reg(r) => self.cpu.gpr_at(r),
        }
    }

    /// Commit `lowered` to the JIT page, run it, and apply its flag and control-flow effects.
    fn execute_lowered(
        &mut self,
        inst: &DecodedInstruction,
        lowered: &Lowered,
    ) -> Result<StepExit, EngineError> {
        let rip = inst.rip;
        let jit_err = |source| EngineError::from_jit(rip, source);

        self.state = DispatchState::Committing;
        self.jit.make_writable(self.page).map_err(jit_err)?;
        self.jit
            .write_words(self.page, &lowered.words)
            .map_err(jit_err)?;
        self.jit.make_executable(self.page).map_err(jit_err)?;

        self.state = DispatchState::Executing;
        let operands = lowered
            .flags
            .map(|fx| (fx, self.cpu.gpr_at(fx.dst), self.flag_operand(fx.rhs)));
        let exit = self
            .jit
            .run_block(self.page, &mut self.cpu, &mut self.executor)
            .map_err(jit_err)?;
        if let Some((fx, before, rhs)) = operands {
            let after = if fx.writes_dst {
                self.cpu.gpr_at(fx.dst)
            } else {
                fx.result(before, rhs)
            };
            update_flags(&mut self.cpu.rflags, fx.op, before, rhs, after);
        }

        self.finish_block(inst, exit)
    }

    fn finish_block(
        &mut self,
        inst: &DecodedInstruction,
        exit: BlockExit,
    ) -> Result<StepExit, EngineError> {
        let rip = inst.rip;
        let next = inst.next_rip();
        let mem_err = |source| EngineError::Memory { rip, source };

        match exit {
            BlockExit::Fallthrough => {
                self.cpu.rip = next;
                Ok(StepExit::Continue)
            }
            BlockExit::Branch { offset_words, link } => {
                if link {
                    let rsp = self.cpu.gpr(Gpr::Rsp).wrapping_sub(STACK_SLOT);
                    self.cpu.memory.write_u64(rsp, next).map_err(mem_err)?;
                    self.cpu.set_gpr(Gpr::Rsp, rsp);
                    self.call_depth += 1;
                }
                let target = next.wrapping_add((i64::from(offset_words) * 4) as u64);
                self.cpu.rip = target;
                Ok(StepExit::Continue)
            }
            BlockExit::Svc(vector) => {
                let result = self.trap.on_trap(vector, &mut self.cpu);
                self.cpu.set_gpr(Gpr::Rax, result);
                self.cpu.rip = next;
                tracing::debug!(rip, vector, result, "trap handled");
                self.events.push(EngineEvent::Trap {
                    rip,
                    vector,
                    result,
                });
                Ok(StepExit::Continue)
            }
            BlockExit::Return if self.call_depth > 0 => {
                let rsp = self.cpu.gpr(Gpr::Rsp);
                let ret = self.cpu.memory.read_u64(rsp).map_err(mem_err)?;
                self.cpu.set_gpr(Gpr::Rsp, rsp.wrapping_add(STACK_SLOT));
                self.call_depth -= 1;
                self.cpu.rip = ret;
                Ok(StepExit::Continue)
            }
            BlockExit::Return => {
                self.cpu.rip = next;
                Ok(StepExit::Halted(HaltReason::Return))
            }
            BlockExit::Halt => {
                self.cpu.rip = next;
                Ok(StepExit::Halted(HaltReason::Hlt))
            }
        }
    }

    /// Clear registers, flags and counters, return RIP to the entry point and the dispatcher to
    /// `Idle`. Guest memory and regions are kept.
    pub fn reset_to_safe_state(&mut self) -> Result<(), EngineError> {
        self.reset_registers();
        self.last_error = None;
        self.jit
            .make_writable(self.page)
            .map_err(|source| EngineError::Jit { rip: 0, source })?;
        self.state = DispatchState::Idle;
        self.events.push(EngineEvent::Reset);
        tracing::debug!(entry = self.entry, "engine reset");
        Ok(())
    }

    pub fn last_error(&self) -> Option<&EngineError> {
        self.last_error.as_ref()
    }

    pub fn last_error_description(&self) -> Option<String> {
        self.last_error.as_ref().map(ToString::to_string)
    }

    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        self.events.drain()
    }

    pub fn dropped_events(&self) -> u64 {
        self.events.dropped()
    }

    pub fn jit_stats(&self) -> JitStats {
        self.jit.stats()
    }

    pub fn dump_registers(&self) -> String {
        diag::dump_registers(&self.cpu)
    }

    pub fn dump_regions(&self) -> String {
        diag::dump_regions(&self.cpu.memory)
    }

    pub fn dump_memory(&self, address: u64, len: usize) -> Result<String, EngineError> {
        diag::dump_memory(&self.cpu.memory, address, len).map_err(|source| EngineError::Memory {
            rip: self.cpu.rip,
            source,
        })
    }

    pub fn disassemble(&self, address: u64, len: usize) -> Result<Vec<DisasmLine>, EngineError> {
        diag::disassemble(&self.cpu.memory, address, len).map_err(|source| {
            EngineError::Memory {
                rip: self.cpu.rip,
                source,
            }
        })
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(err) = self.jit.free(self.page) {
            tracing::debug!(page = %self.page, error = %err, "failed to free jit page");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(code: &[u8]) -> Engine {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        engine.load_image(0x1000, code, 0x1000).unwrap();
        engine
    }

    #[test]
    fn step_walks_the_state_machine() {
        let mut e = engine(&[0x90, 0xC3]);
        assert_eq!(e.state(), DispatchState::Idle);
        assert_eq!(e.step().unwrap(), StepExit::Continue);
        assert_eq!(e.state(), DispatchState::Fetching);
        assert_eq!(e.cpu().rip, 0x1001);
        assert_eq!(e.step().unwrap(), StepExit::Halted(HaltReason::Return));
        assert_eq!(e.state(), DispatchState::Halted);
    }

    #[test]
    fn stack_pointer_starts_at_top_of_stack() {
        let e = engine(&[0xC3]);
        assert_eq!(e.gpr(Gpr::Rsp), e.config().memory_size);
    }

    #[test]
    fn unsafe_instruction_faults_before_translation() {
        // add [rax], eax
        let mut e = engine(&[0x01, 0x00, 0xC3]);
        let err = e.run().unwrap_err();
        assert!(matches!(err, EngineError::Unsafe { rip: 0x1000, .. }));
        assert_eq!(e.state(), DispatchState::Faulted);
        assert_eq!(e.cpu().last_valid_rip, 0x1000);
        assert_eq!(e.cpu().last_inst.as_slice(), &[0x01, 0x00]);
        assert_eq!(e.jit_stats().executions, 0);
    }

    #[test]
    fn decode_failure_records_window() {
        let mut e = engine(&[0x06]);
        let err = e.run().unwrap_err();
        assert!(matches!(err, EngineError::Decode { .. }));
        assert_eq!(e.cpu().last_inst.as_slice(), &[0x06]);
        assert!(e
            .last_error_description()
            .unwrap()
            .contains("failed to decode"));
    }

    #[test]
    fn page_is_executable_after_a_block_and_writable_after_reset() {
        let mut e = engine(&[0x90, 0xC3]);
        e.run().unwrap();
        assert_eq!(
            e.jit.state(e.page).unwrap(),
            aero_jit::PageState::Executable
        );
        e.reset_to_safe_state().unwrap();
        assert_eq!(e.jit.state(e.page).unwrap(), aero_jit::PageState::Writable);
    }

    #[test]
    fn dropping_the_engine_frees_its_page() {
        let jit = Arc::new(JitMemoryManager::new());
        let e = Engine::with_jit(EngineConfig::default(), Arc::clone(&jit)).unwrap();
        assert_eq!(jit.stats().live_pages, 1);
        drop(e);
        assert_eq!(jit.stats().live_pages, 0);
    }
}
