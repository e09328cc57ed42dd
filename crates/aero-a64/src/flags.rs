//! Guest status-flag bookkeeping for flag-producing ALU instructions.
//!
//! The generated block computes values only; the dispatcher snapshots the destination before the
//! block runs and calls [`update_flags`] with the operands afterwards. Flags are derived from the
//! low 32 bits of each value.

use aero_cpu::Rflags;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagOp {
    Add,
    Sub,
    /// AND/OR/XOR/TEST: CF and OF are cleared.
    Logic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagOperand {
    Imm(u64),
    /// Guest register index.
    Reg(u8),
}

/// Describes how to recompute RFLAGS once a lowered block has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagEffect {
    pub op: FlagOp,
    /// Guest register index of the left operand.
    pub dst: u8,
    pub rhs: FlagOperand,
    /// `false` for CMP/TEST, whose result is discarded.
    pub writes_dst: bool,
}

impl FlagEffect {
    /// Result the instruction would have produced. Used when the destination is left untouched.
    pub fn result(&self, before: u64, rhs: u64) -> u64 {
        match self.op {
            FlagOp::Add => before.wrapping_add(rhs),
            FlagOp::Sub => before.wrapping_sub(rhs),
            FlagOp::Logic => before & rhs,
        }
    }
}

/// Recompute ZF, SF, CF and OF from the destination value before the operation, the right-hand
/// operand, and the result.
pub fn update_flags(flags: &mut Rflags, op: FlagOp, before: u64, rhs: u64, after: u64) {
    let b = before as u32;
    let r = rhs as u32;
    let a = after as u32;

    let zf = a == 0;
    let sf = a >> 31 != 0;
    let (cf, of) = match op {
        FlagOp::Add => (a < b, ((b ^ a) & (r ^ a)) >> 31 != 0),
        FlagOp::Sub => (a > b, ((b ^ r) & (b ^ a)) >> 31 != 0),
        FlagOp::Logic => (false, false),
    };
    flags.set_status(zf, sf, cf, of);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(op: FlagOp, before: u64, rhs: u64) -> Rflags {
        let mut flags = Rflags::default();
        let effect = FlagEffect {
            op,
            dst: 0,
            rhs: FlagOperand::Imm(rhs),
            writes_dst: true,
        };
        update_flags(&mut flags, op, before, rhs, effect.result(before, rhs));
        flags
    }

    #[test]
    fn add_sets_carry_and_zero_on_wrap() {
        let flags = run(FlagOp::Add, 0xFFFF_FFFF, 1);
        assert!(flags.contains(Rflags::CF));
        assert!(flags.contains(Rflags::ZF));
        assert!(!flags.contains(Rflags::OF));
    }

    #[test]
    fn add_signed_overflow() {
        let flags = run(FlagOp::Add, 0x7FFF_FFFF, 1);
        assert!(flags.contains(Rflags::OF));
        assert!(flags.contains(Rflags::SF));
        assert!(!flags.contains(Rflags::CF));
    }

    #[test]
    fn sub_borrow_and_equal() {
        let flags = run(FlagOp::Sub, 1, 2);
        assert!(flags.contains(Rflags::CF));
        assert!(flags.contains(Rflags::SF));

        let flags = run(FlagOp::Sub, 7, 7);
        assert!(flags.contains(Rflags::ZF));
        assert!(!flags.contains(Rflags::CF));
    }

    #[test]
    fn logic_clears_carry_and_overflow() {
        let mut flags = Rflags::default() | Rflags::CF | Rflags::OF;
        update_flags(&mut flags, FlagOp::Logic, 0xF0, 0x0F, 0);
        assert!(!flags.contains(Rflags::CF));
        assert!(!flags.contains(Rflags::OF));
        assert!(flags.contains(Rflags::ZF));
    }
}
