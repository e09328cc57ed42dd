use crate::reg::{Cond, Reg, VReg};

/// Scalar FP arithmetic selector (bits 15..12 of the encoding).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpOp {
    Mul = 0b0000,
    Div = 0b0001,
    Add = 0b0010,
    Sub = 0b0011,
}

/// Low-level aarch64 instruction encoder.
///
/// Appends u32 instruction words to an internal buffer. [`crate::lower`] decides *what* to emit;
/// this struct only knows *how* to encode each instruction form.
#[derive(Debug, Default)]
pub struct Emitter {
    code: Vec<u32>,
}

fn sf(wide: bool) -> u32 {
    if wide {
        1 << 31
    } else {
        0
    }
}

impl Emitter {
    pub fn new() -> Self {
        Self {
            code: Vec::with_capacity(16),
        }
    }

    pub fn code(&self) -> &[u32] {
        &self.code
    }

    pub fn into_code(self) -> Vec<u32> {
        self.code
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    fn push(&mut self, inst: u32) {
        self.code.push(inst);
    }

    // ---- Moves ----

    /// `MOVZ Rd, #imm16, LSL #(16*hw)`
    pub fn movz(&mut self, rd: Reg, imm16: u16, hw: u8, wide: bool) {
        self.push(
            0x5280_0000 | sf(wide) | ((hw as u32 & 0x3) << 21) | ((imm16 as u32) << 5) | rd.bits(),
        );
    }

    /// `MOVK Rd, #imm16, LSL #(16*hw)`
    pub fn movk(&mut self, rd: Reg, imm16: u16, hw: u8, wide: bool) {
        self.push(
            0x7280_0000 | sf(wide) | ((hw as u32 & 0x3) << 21) | ((imm16 as u32) << 5) | rd.bits(),
        );
    }

    /// MOVZ for the low halfword, then one MOVK per remaining halfword up to the highest
    /// non-zero one.
    pub fn materialize(&mut self, rd: Reg, value: u64, wide: bool) {
        self.movz(rd, value as u16, 0, wide);
        let halfwords = if wide { 4 } else { 2 };
        for hw in 1..halfwords {
            if value >> (16 * hw) == 0 {
                break;
            }
            self.movk(rd, (value >> (16 * hw)) as u16, hw, wide);
        }
    }

    /// `MOV Rd, Rm` (alias of `ORR Rd, ZR, Rm`).
    pub fn mov_reg(&mut self, rd: Reg, rm: Reg, wide: bool) {
        self.orr_reg(rd, Reg::XZR, rm, wide);
    }

    // ---- Arithmetic (immediate) ----

    /// `ADD Rd, Rn, #imm12`
    pub fn add_imm(&mut self, rd: Reg, rn: Reg, imm12: u16, wide: bool) {
        self.push(
            0x1100_0000 | sf(wide) | ((imm12 as u32 & 0xfff) << 10) | rn.bits() << 5 | rd.bits(),
        );
    }

    /// `SUB Rd, Rn, #imm12`
    pub fn sub_imm(&mut self, rd: Reg, rn: Reg, imm12: u16, wide: bool) {
        self.push(
            0x5100_0000 | sf(wide) | ((imm12 as u32 & 0xfff) << 10) | rn.bits() << 5 | rd.bits(),
        );
    }

    /// `SUBS Rd, Rn, #imm12`; `CMP Rn, #imm12` when `rd` is ZR.
    pub fn subs_imm(&mut self, rd: Reg, rn: Reg, imm12: u16, wide: bool) {
        self.push(
            0x7100_0000 | sf(wide) | ((imm12 as u32 & 0xfff) << 10) | rn.bits() << 5 | rd.bits(),
        );
    }

    // ---- Arithmetic / logic (shifted register, shift 0) ----

    fn rrr(&mut self, base: u32, rd: Reg, rn: Reg, rm: Reg, wide: bool) {
        self.push(base | sf(wide) | rm.bits() << 16 | rn.bits() << 5 | rd.bits());
    }

    pub fn add_reg(&mut self, rd: Reg, rn: Reg, rm: Reg, wide: bool) {
        self.rrr(0x0B00_0000, rd, rn, rm, wide);
    }

    pub fn sub_reg(&mut self, rd: Reg, rn: Reg, rm: Reg, wide: bool) {
        self.rrr(0x4B00_0000, rd, rn, rm, wide);
    }

    pub fn subs_reg(&mut self, rd: Reg, rn: Reg, rm: Reg, wide: bool) {
        self.rrr(0x6B00_0000, rd, rn, rm, wide);
    }

    pub fn and_reg(&mut self, rd: Reg, rn: Reg, rm: Reg, wide: bool) {
        self.rrr(0x0A00_0000, rd, rn, rm, wide);
    }

    pub fn orr_reg(&mut self, rd: Reg, rn: Reg, rm: Reg, wide: bool) {
        self.rrr(0x2A00_0000, rd, rn, rm, wide);
    }

    pub fn eor_reg(&mut self, rd: Reg, rn: Reg, rm: Reg, wide: bool) {
        self.rrr(0x4A00_0000, rd, rn, rm, wide);
    }

    /// `ANDS Rd, Rn, Rm`; `TST Rn, Rm` when `rd` is ZR.
    pub fn ands_reg(&mut self, rd: Reg, rn: Reg, rm: Reg, wide: bool) {
        self.rrr(0x6A00_0000, rd, rn, rm, wide);
    }

    // ---- Branches ----

    /// `B #offset` (offset in instruction words). Caller checks the ±2^25 range.
    pub fn b(&mut self, offset: i32) {
        self.push(0x1400_0000 | (offset as u32 & 0x03FF_FFFF));
    }

    /// `BL #offset`
    pub fn bl(&mut self, offset: i32) {
        self.push(0x9400_0000 | (offset as u32 & 0x03FF_FFFF));
    }

    /// `B.cond #offset`. Caller checks the ±2^18 range.
    pub fn b_cond(&mut self, cond: Cond, offset: i32) {
        self.push(0x5400_0000 | (offset as u32 & 0x7FFFF) << 5 | cond as u32);
    }

    pub fn ret(&mut self) {
        self.push(0xD65F_03C0);
    }

    pub fn nop(&mut self) {
        self.push(0xD503_201F);
    }

    pub fn svc(&mut self, imm16: u16) {
        self.push(0xD400_0001 | (imm16 as u32) << 5);
    }

    pub fn hlt(&mut self, imm16: u16) {
        self.push(0xD440_0000 | (imm16 as u32) << 5);
    }

    // ---- Loads / stores ----

    /// `STR Xt, [Xn, #simm9]!`
    pub fn str_pre(&mut self, rt: Reg, rn: Reg, simm9: i16) {
        self.push(0xF800_0C00 | (simm9 as u32 & 0x1FF) << 12 | rn.bits() << 5 | rt.bits());
    }

    /// `LDR Xt, [Xn], #simm9`
    pub fn ldr_post(&mut self, rt: Reg, rn: Reg, simm9: i16) {
        self.push(0xF840_0400 | (simm9 as u32 & 0x1FF) << 12 | rn.bits() << 5 | rt.bits());
    }

    /// `STR Rt, [Xn]`
    pub fn str_base(&mut self, rt: Reg, rn: Reg, wide: bool) {
        let base = if wide { 0xF900_0000 } else { 0xB900_0000 };
        self.push(base | rn.bits() << 5 | rt.bits());
    }

    /// `LDR Rt, [Xn]`
    pub fn ldr_base(&mut self, rt: Reg, rn: Reg, wide: bool) {
        let base = if wide { 0xF940_0000 } else { 0xB940_0000 };
        self.push(base | rn.bits() << 5 | rt.bits());
    }

    // ---- Scalar FP ----

    /// `FADD/FSUB/FMUL/FDIV` on `Dd` (`double`) or `Sd`.
    pub fn fp_arith(&mut self, op: FpOp, rd: VReg, rn: VReg, rm: VReg, double: bool) {
        let ty = if double { 1 << 22 } else { 0 };
        self.push(
            0x1E20_0800 | ty | rm.bits() << 16 | (op as u32) << 12 | rn.bits() << 5 | rd.bits(),
        );
    }

    /// `FMOV Dd, Dn`
    pub fn fmov_d(&mut self, rd: VReg, rn: VReg) {
        self.push(0x1E60_4000 | rn.bits() << 5 | rd.bits());
    }

    /// `FMOV Dd, #imm` with the 8-bit packed FP immediate (`0x70` is 1.0).
    pub fn fmov_d_imm(&mut self, rd: VReg, imm8: u8) {
        self.push(0x1E60_1000 | (imm8 as u32) << 13 | rd.bits());
    }

    /// `FMOV Dd, Xn`
    pub fn fmov_d_from_x(&mut self, rd: VReg, rn: Reg) {
        self.push(0x9E67_0000 | rn.bits() << 5 | rd.bits());
    }

    pub fn fneg_d(&mut self, rd: VReg, rn: VReg) {
        self.push(0x1E61_4000 | rn.bits() << 5 | rd.bits());
    }

    pub fn fabs_d(&mut self, rd: VReg, rn: VReg) {
        self.push(0x1E60_C000 | rn.bits() << 5 | rd.bits());
    }

    // ---- Vector ----

    /// `MOV Vd.S[0], Vn.S[0]` (INS element). Other lanes of `Vd` are preserved.
    pub fn ins_s0(&mut self, rd: VReg, rn: VReg) {
        self.push(0x6E04_0400 | rn.bits() << 5 | rd.bits());
    }

    fn vvv(&mut self, base: u32, rd: VReg, rn: VReg, rm: VReg) {
        self.push(base | rm.bits() << 16 | rn.bits() << 5 | rd.bits());
    }

    /// `ORR Vd.16B, Vn.16B, Vm.16B` (`MOV Vd.16B, Vn.16B` when `rn == rm`).
    pub fn orr_16b(&mut self, rd: VReg, rn: VReg, rm: VReg) {
        self.vvv(0x4EA0_1C00, rd, rn, rm);
    }

    pub fn eor_16b(&mut self, rd: VReg, rn: VReg, rm: VReg) {
        self.vvv(0x6E20_1C00, rd, rn, rm);
    }

    pub fn add_16b(&mut self, rd: VReg, rn: VReg, rm: VReg) {
        self.vvv(0x4E20_8400, rd, rn, rm);
    }

    pub fn add_4s(&mut self, rd: VReg, rn: VReg, rm: VReg) {
        self.vvv(0x4EA0_8400, rd, rn, rm);
    }

    pub fn fadd_4s(&mut self, rd: VReg, rn: VReg, rm: VReg) {
        self.vvv(0x4E20_D400, rd, rn, rm);
    }

    pub fn fmul_4s(&mut self, rd: VReg, rn: VReg, rm: VReg) {
        self.vvv(0x6E20_DC00, rd, rn, rm);
    }
}
