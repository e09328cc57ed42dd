//! Portable executor for translated blocks.
//!
//! Runs the A64 words of an executable page against an [`A64State`] that mirrors the guest
//! registers through the fixed register map. Guest memory is reached through [`A64Bus`], so every
//! load and store is validated the same way interpreted instructions are.

use aero_a64::{
    decode_word, expand_fp_imm8, map_gpr, st_vreg, xmm_vreg, A64Insn, Cond, FpOp, FpUnary,
    LogicOp, MoveWide, VecOp,
};
use aero_cpu::{CpuState, GuestMemory, MemoryError, Rflags, GPR_COUNT};

use crate::JitError;

const NZCV_N: u8 = 0b1000;
const NZCV_Z: u8 = 0b0100;
const NZCV_C: u8 = 0b0010;
const NZCV_V: u8 = 0b0001;

/// Data accesses made by translated code. Implementations validate every access.
pub trait A64Bus {
    fn read_mem(&mut self, addr: u64, size: usize) -> Result<u64, MemoryError>;
    fn write_mem(&mut self, addr: u64, size: usize, value: u64) -> Result<(), MemoryError>;
}

impl A64Bus for GuestMemory {
    fn read_mem(&mut self, addr: u64, size: usize) -> Result<u64, MemoryError> {
        self.read_uint(addr, size)
    }

    fn write_mem(&mut self, addr: u64, size: usize, value: u64) -> Result<(), MemoryError> {
        self.write_uint(addr, size, value)
    }
}

/// A bus with nothing mapped; every access is rejected.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMemory;

impl A64Bus for NoMemory {
    fn read_mem(&mut self, addr: u64, size: usize) -> Result<u64, MemoryError> {
        Err(MemoryError::Unmapped {
            addr,
            size: size as u64,
        })
    }

    fn write_mem(&mut self, addr: u64, size: usize, _value: u64) -> Result<(), MemoryError> {
        Err(MemoryError::Unmapped {
            addr,
            size: size as u64,
        })
    }
}

/// How a block stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockExit {
    /// Ran past the last word.
    Fallthrough,
    /// A taken `B`/`BL`/`B.cond`. The offset is in words, relative to the branch.
    Branch { offset_words: i32, link: bool },
    Svc(u16),
    Return,
    Halt,
}

/// Host register file seen by translated code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct A64State {
    pub x: [u64; 31],
    pub sp: u64,
    /// `N` in bit 3, `V` in bit 0.
    pub nzcv: u8,
    pub v: [u128; 32],
}

impl Default for A64State {
    fn default() -> Self {
        Self {
            x: [0; 31],
            sp: 0,
            nzcv: 0,
            v: [0; 32],
        }
    }
}

impl A64State {
    /// Guest registers, flags, XMM and x87 state mapped onto host registers. The guest carry
    /// flag is stored inverted in `C`.
    pub fn from_cpu(cpu: &CpuState) -> Self {
        let mut s = Self::default();
        for (i, value) in cpu.gprs().iter().enumerate() {
            s.x[map_gpr(i as u8).0 as usize] = *value;
        }
        let flags = cpu.rflags;
        s.nzcv = (if flags.contains(Rflags::SF) { NZCV_N } else { 0 })
            | (if flags.contains(Rflags::ZF) { NZCV_Z } else { 0 })
            | (if flags.contains(Rflags::CF) { 0 } else { NZCV_C })
            | (if flags.contains(Rflags::OF) { NZCV_V } else { 0 });
        for (i, xmm) in cpu.xmm.iter().enumerate() {
            s.v[xmm_vreg(i as u8).0 as usize] = *xmm;
        }
        for (i, st) in cpu.x87.iter().enumerate() {
            s.v[st_vreg(i as u8).0 as usize] = st.to_bits() as u128;
        }
        s
    }

    pub fn write_back(&self, cpu: &mut CpuState) {
        for i in 0..GPR_COUNT as u8 {
            cpu.set_gpr_at(i, self.x[map_gpr(i).0 as usize]);
        }
        cpu.rflags.set_status(
            self.nzcv & NZCV_Z != 0,
            self.nzcv & NZCV_N != 0,
            self.nzcv & NZCV_C == 0,
            self.nzcv & NZCV_V != 0,
        );
        for i in 0..cpu.xmm.len() {
            cpu.xmm[i] = self.v[xmm_vreg(i as u8).0 as usize];
        }
        for i in 0..cpu.x87.len() {
            cpu.x87[i] = f64::from_bits(self.v[st_vreg(i as u8).0 as usize] as u64);
        }
    }

    /// Register 31 reads as zero.
    fn xzr(&self, r: u8) -> u64 {
        match r {
            31 => 0,
            n => self.x[n as usize],
        }
    }

    /// Register 31 reads as SP.
    fn xsp(&self, r: u8) -> u64 {
        match r {
            31 => self.sp,
            n => self.x[n as usize],
        }
    }

    fn set_xzr(&mut self, r: u8, value: u64) {
        if r != 31 {
            self.x[r as usize] = value;
        }
    }

    fn set_xsp(&mut self, r: u8, value: u64) {
        match r {
            31 => self.sp = value,
            n => self.x[n as usize] = value,
        }
    }

    fn d(&self, r: u8) -> f64 {
        f64::from_bits(self.v[r as usize] as u64)
    }

    fn s(&self, r: u8) -> f32 {
        f32::from_bits(self.v[r as usize] as u32)
    }

    /// Scalar writes clear the rest of the vector register.
    fn set_d(&mut self, r: u8, value: f64) {
        self.v[r as usize] = value.to_bits() as u128;
    }

    fn set_s(&mut self, r: u8, value: f32) {
        self.v[r as usize] = value.to_bits() as u128;
    }
}

/// Runs a block of A64 words against guest state.
pub trait BlockExecutor {
    fn run_block(&mut self, code: &[u32], cpu: &mut CpuState) -> Result<BlockExit, JitError>;
}

/// Software execution of the A64 subset produced by `aero-a64`.
#[derive(Debug, Default)]
pub struct A64Interpreter {
    executed_words: u64,
}

impl A64Interpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total words executed by this interpreter.
    pub fn executed_words(&self) -> u64 {
        self.executed_words
    }

    /// Execute `code` until a taken branch, a trap, a return, or the end of the block.
    pub fn run<B: A64Bus + ?Sized>(
        &mut self,
        code: &[u32],
        state: &mut A64State,
        bus: &mut B,
    ) -> Result<BlockExit, JitError> {
        for (index, &word) in code.iter().enumerate() {
            let insn = decode_word(word).ok_or(JitError::UndefinedInstruction {
                offset: index * 4,
                word,
            })?;
            self.executed_words += 1;
            if let Some(exit) = step(insn, state, bus)? {
                return Ok(exit);
            }
        }
        Ok(BlockExit::Fallthrough)
    }
}

impl BlockExecutor for A64Interpreter {
    fn run_block(&mut self, code: &[u32], cpu: &mut CpuState) -> Result<BlockExit, JitError> {
        let mut state = A64State::from_cpu(cpu);
        let result = self.run(code, &mut state, &mut cpu.memory);
        // Registers are committed only when the whole block completed.
        if result.is_ok() {
            state.write_back(cpu);
        }
        result
    }
}

fn width_mask(wide: bool) -> u64 {
    if wide {
        u64::MAX
    } else {
        u32::MAX as u64
    }
}

fn nz(result: u64, wide: bool) -> u8 {
    let top = if wide { 63 } else { 31 };
    let mut flags = 0;
    if result & width_mask(wide) == 0 {
        flags |= NZCV_Z;
    }
    if (result >> top) & 1 != 0 {
        flags |= NZCV_N;
    }
    flags
}

/// `a + b + carry` with A64 flag semantics.
fn add_with_flags(a: u64, b: u64, carry: bool, wide: bool) -> (u64, u8) {
    let mask = width_mask(wide);
    let (a, b) = (a & mask, b & mask);
    let wide_sum = a as u128 + b as u128 + carry as u128;
    let result = (wide_sum as u64) & mask;
    let mut flags = nz(result, wide);
    if wide_sum > mask as u128 {
        flags |= NZCV_C;
    }
    let top = if wide { 63 } else { 31 };
    if ((a ^ result) & (b ^ result)) >> top & 1 != 0 {
        flags |= NZCV_V;
    }
    (result, flags)
}

fn add_sub(a: u64, b: u64, sub: bool, wide: bool) -> (u64, u8) {
    if sub {
        add_with_flags(a, !b, true, wide)
    } else {
        add_with_flags(a, b, false, wide)
    }
}

fn lanes_u8(v: u128) -> [u8; 16] {
    v.to_le_bytes()
}

fn lanes_u32(v: u128) -> [u32; 4] {
    let b = v.to_le_bytes();
    let mut out = [0u32; 4];
    for (i, lane) in out.iter_mut().enumerate() {
        *lane = u32::from_le_bytes([b[i * 4], b[i * 4 + 1], b[i * 4 + 2], b[i * 4 + 3]]);
    }
    out
}

fn join_u32(lanes: [u32; 4]) -> u128 {
    let mut b = [0u8; 16];
    for (i, lane) in lanes.iter().enumerate() {
        b[i * 4..i * 4 + 4].copy_from_slice(&lane.to_le_bytes());
    }
    u128::from_le_bytes(b)
}

fn map_u32_lanes(a: u128, b: u128, f: impl Fn(u32, u32) -> u32) -> u128 {
    let (a, b) = (lanes_u32(a), lanes_u32(b));
    join_u32([f(a[0], b[0]), f(a[1], b[1]), f(a[2], b[2]), f(a[3], b[3])])
}

fn step<B: A64Bus + ?Sized>(
    insn: A64Insn,
    state: &mut A64State,
    bus: &mut B,
) -> Result<Option<BlockExit>, JitError> {
    match insn {
        A64Insn::MoveWide {
            wide,
            op,
            hw,
            imm16,
            rd,
        } => {
            let shift = hw as u32 * 16;
            let imm = (imm16 as u64) << shift;
            let value = match op {
                MoveWide::Z => imm,
                MoveWide::N => !imm,
                MoveWide::K => (state.xzr(rd) & !(0xffff_u64 << shift)) | imm,
            };
            state.set_xzr(rd, value & width_mask(wide));
        }
        A64Insn::AddSubImm {
            wide,
            sub,
            set_flags,
            imm,
            rn,
            rd,
        } => {
            let (result, flags) = add_sub(state.xsp(rn), imm as u64, sub, wide);
            if set_flags {
                state.nzcv = flags;
                state.set_xzr(rd, result);
            } else {
                state.set_xsp(rd, result);
            }
        }
        A64Insn::AddSubReg {
            wide,
            sub,
            set_flags,
            rm,
            rn,
            rd,
        } => {
            let (result, flags) = add_sub(state.xzr(rn), state.xzr(rm), sub, wide);
            if set_flags {
                state.nzcv = flags;
            }
            state.set_xzr(rd, result);
        }
        A64Insn::Logic {
            wide,
            op,
            rm,
            rn,
            rd,
        } => {
            let (a, b) = (state.xzr(rn), state.xzr(rm));
            let result = match op {
                LogicOp::And | LogicOp::Ands => a & b,
                LogicOp::Orr => a | b,
                LogicOp::Eor => a ^ b,
            } & width_mask(wide);
            if op == LogicOp::Ands {
                state.nzcv = nz(result, wide);
            }
            state.set_xzr(rd, result);
        }
        A64Insn::B { link, offset } => {
            return Ok(Some(BlockExit::Branch {
                offset_words: offset,
                link,
            }))
        }
        A64Insn::BCond { cond, offset } => {
            if cond.holds(state.nzcv) {
                return Ok(Some(BlockExit::Branch {
                    offset_words: offset,
                    link: false,
                }));
            }
        }
        A64Insn::Ret { .. } => return Ok(Some(BlockExit::Return)),
        A64Insn::Nop => {}
        A64Insn::Svc(imm) => return Ok(Some(BlockExit::Svc(imm))),
        A64Insn::Hlt(_) => return Ok(Some(BlockExit::Halt)),
        A64Insn::LoadStoreIndexed {
            load,
            pre,
            offset,
            rn,
            rt,
        } => {
            let base = state.xsp(rn);
            let moved = base.wrapping_add(offset as i64 as u64);
            let addr = if pre { moved } else { base };
            if load {
                let value = bus.read_mem(addr, 8)?;
                state.set_xsp(rn, moved);
                state.set_xzr(rt, value);
            } else {
                bus.write_mem(addr, 8, state.xzr(rt))?;
                state.set_xsp(rn, moved);
            }
        }
        A64Insn::LoadStoreOffset {
            load,
            wide,
            offset,
            rn,
            rt,
        } => {
            let addr = state.xsp(rn).wrapping_add(offset as u64);
            let size = if wide { 8 } else { 4 };
            if load {
                let value = bus.read_mem(addr, size)?;
                state.set_xzr(rt, value);
            } else {
                bus.write_mem(addr, size, state.xzr(rt) & width_mask(wide))?;
            }
        }
        A64Insn::FpArith {
            double,
            op,
            rm,
            rn,
            rd,
        } => {
            if double {
                let (a, b) = (state.d(rn), state.d(rm));
                let r = match op {
                    FpOp::Add => a + b,
                    FpOp::Sub => a - b,
                    FpOp::Mul => a * b,
                    FpOp::Div => a / b,
                };
                state.set_d(rd, r);
            } else {
                let (a, b) = (state.s(rn), state.s(rm));
                let r = match op {
                    FpOp::Add => a + b,
                    FpOp::Sub => a - b,
                    FpOp::Mul => a * b,
                    FpOp::Div => a / b,
                };
                state.set_s(rd, r);
            }
        }
        A64Insn::FpUnary { double, op, rn, rd } => {
            if double {
                let a = state.d(rn);
                let r = match op {
                    FpUnary::Mov => a,
                    FpUnary::Abs => a.abs(),
                    FpUnary::Neg => -a,
                };
                state.set_d(rd, r);
            } else {
                let a = state.s(rn);
                let r = match op {
                    FpUnary::Mov => a,
                    FpUnary::Abs => a.abs(),
                    FpUnary::Neg => -a,
                };
                state.set_s(rd, r);
            }
        }
        A64Insn::FmovImm { double, imm8, rd } => {
            let value = expand_fp_imm8(imm8);
            if double {
                state.set_d(rd, value);
            } else {
                state.set_s(rd, value as f32);
            }
        }
        A64Insn::FmovFromGpr { rn, rd } => state.v[rd as usize] = state.xzr(rn) as u128,
        A64Insn::InsS0 { rn, rd } => {
            let low = state.v[rn as usize] & 0xffff_ffff;
            state.v[rd as usize] = (state.v[rd as usize] & !0xffff_ffff_u128) | low;
        }
        A64Insn::Vec { op, rm, rn, rd } => {
            let (a, b) = (state.v[rn as usize], state.v[rm as usize]);
            state.v[rd as usize] = match op {
                VecOp::Orr16B => a | b,
                VecOp::Eor16B => a ^ b,
                VecOp::Add16B => {
                    let (a, b) = (lanes_u8(a), lanes_u8(b));
                    let mut out = [0u8; 16];
                    for i in 0..16 {
                        out[i] = a[i].wrapping_add(b[i]);
                    }
                    u128::from_le_bytes(out)
                }
                VecOp::Add4S => map_u32_lanes(a, b, u32::wrapping_add),
                VecOp::Fadd4S => map_u32_lanes(a, b, |x, y| {
                    (f32::from_bits(x) + f32::from_bits(y)).to_bits()
                }),
                VecOp::Fmul4S => map_u32_lanes(a, b, |x, y| {
                    (f32::from_bits(x) * f32::from_bits(y)).to_bits()
                }),
            };
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use aero_a64::{Emitter, Reg, VReg};
    use aero_cpu::{MemoryLimits, RegionFlags};

    use super::*;

    fn cpu() -> CpuState {
        let mut memory = GuestMemory::new(0x10000, MemoryLimits::default()).unwrap();
        memory
            .map_region(0x1000, 0x1000, RegionFlags::WRITABLE, "data")
            .unwrap();
        CpuState::new(memory)
    }

    #[test]
    fn movz_movk_then_ret() {
        let mut e = Emitter::new();
        e.materialize(Reg(0), 0x1234_5678, false);
        e.ret();
        let mut state = A64State::default();
        let exit = A64Interpreter::new()
            .run(e.code(), &mut state, &mut NoMemory)
            .unwrap();
        assert_eq!(exit, BlockExit::Return);
        assert_eq!(state.x[0], 0x1234_5678);
    }

    #[test]
    fn w_form_arithmetic_zero_extends() {
        let mut e = Emitter::new();
        e.materialize(Reg(0), 3, false);
        e.sub_imm(Reg(0), Reg(0), 5, false);
        let mut state = A64State::default();
        state.x[0] = u64::MAX;
        A64Interpreter::new()
            .run(e.code(), &mut state, &mut NoMemory)
            .unwrap();
        assert_eq!(state.x[0], 0xFFFF_FFFE);
    }

    #[test]
    fn subs_sets_inverted_borrow() {
        let mut e = Emitter::new();
        e.subs_imm(Reg::XZR, Reg(0), 2, true);
        let mut state = A64State::default();
        state.x[0] = 1;
        A64Interpreter::new()
            .run(e.code(), &mut state, &mut NoMemory)
            .unwrap();
        // 1 - 2 borrows: C clear, N set.
        assert_eq!(state.nzcv, NZCV_N);
        assert!(Cond::CC.holds(state.nzcv));
    }

    #[test]
    fn taken_branch_leaves_the_block() {
        let mut e = Emitter::new();
        e.b_cond(Cond::EQ, 3);
        e.movz(Reg(1), 7, 0, true);
        let mut state = A64State::default();
        state.nzcv = NZCV_Z;
        let exit = A64Interpreter::new()
            .run(e.code(), &mut state, &mut NoMemory)
            .unwrap();
        assert_eq!(
            exit,
            BlockExit::Branch {
                offset_words: 3,
                link: false
            }
        );
        assert_eq!(state.x[1], 0);

        state.nzcv = 0;
        let exit = A64Interpreter::new()
            .run(e.code(), &mut state, &mut NoMemory)
            .unwrap();
        assert_eq!(exit, BlockExit::Fallthrough);
        assert_eq!(state.x[1], 7);
    }

    #[test]
    fn push_pop_round_trip_through_guest_memory() {
        let mut cpu = cpu();
        cpu.set_gpr_at(4, 0x1800);
        cpu.set_gpr_at(3, 0xDEAD_BEEF);
        let mut e = Emitter::new();
        e.str_pre(Reg(3), Reg::X28, -16);
        let exit = A64Interpreter::new().run_block(e.code(), &mut cpu).unwrap();
        assert_eq!(exit, BlockExit::Fallthrough);
        assert_eq!(cpu.gpr_at(4), 0x17F0);
        assert_eq!(cpu.memory.read_u64(0x17F0).unwrap(), 0xDEAD_BEEF);

        let mut e = Emitter::new();
        e.ldr_post(Reg(9), Reg::X28, 16);
        A64Interpreter::new().run_block(e.code(), &mut cpu).unwrap();
        assert_eq!(cpu.gpr_at(9), 0xDEAD_BEEF);
        assert_eq!(cpu.gpr_at(4), 0x1800);
    }

    #[test]
    fn faulting_store_leaves_registers_untouched() {
        let mut cpu = cpu();
        cpu.set_gpr_at(4, 0x1000);
        let mut e = Emitter::new();
        e.str_pre(Reg(0), Reg::X28, -16);
        let err = A64Interpreter::new().run_block(e.code(), &mut cpu).unwrap_err();
        assert!(matches!(err, JitError::Memory(_)));
        assert_eq!(cpu.gpr_at(4), 0x1000);
    }

    #[test]
    fn scalar_insert_preserves_upper_lanes() {
        let mut state = A64State::default();
        state.v[1] = join_u32([1.5f32.to_bits(), 7, 8, 9]);
        state.v[2] = join_u32([2.0f32.to_bits(), 0, 0, 0]);
        let mut e = Emitter::new();
        e.fp_arith(FpOp::Add, VReg(31), VReg(1), VReg(2), false);
        e.ins_s0(VReg(1), VReg(31));
        A64Interpreter::new()
            .run(e.code(), &mut state, &mut NoMemory)
            .unwrap();
        assert_eq!(lanes_u32(state.v[1]), [3.5f32.to_bits(), 7, 8, 9]);
    }

    #[test]
    fn unknown_word_is_rejected() {
        let mut state = A64State::default();
        let err = A64Interpreter::new()
            .run(&[0xD503_201F, 0], &mut state, &mut NoMemory)
            .unwrap_err();
        assert!(matches!(
            err,
            JitError::UndefinedInstruction { offset: 4, word: 0 }
        ));
    }

    #[test]
    fn flags_round_trip_through_nzcv() {
        let mut cpu = cpu();
        cpu.rflags.set_status(true, false, true, false);
        let state = A64State::from_cpu(&cpu);
        assert_eq!(state.nzcv, NZCV_Z);
        let mut other = self::cpu();
        state.write_back(&mut other);
        assert!(other.flag(Rflags::ZF) && other.flag(Rflags::CF));
        assert!(Cond::LS.holds(state.nzcv));
    }
}
