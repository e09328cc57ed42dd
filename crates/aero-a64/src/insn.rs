//! Structured view of the A64 words the code generator emits.
//!
//! Only the encodings produced by [`crate::Emitter`] are recognized; anything else decodes to
//! `None` and the block executor refuses to run it.

use core::fmt;

use crate::emit::FpOp;
use crate::reg::Cond;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveWide {
    N,
    Z,
    K,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp {
    And,
    Orr,
    Eor,
    Ands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpUnary {
    Mov,
    Abs,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VecOp {
    Orr16B,
    Eor16B,
    Add16B,
    Add4S,
    Fadd4S,
    Fmul4S,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum A64Insn {
    MoveWide {
        wide: bool,
        op: MoveWide,
        hw: u8,
        imm16: u16,
        rd: u8,
    },
    AddSubImm {
        wide: bool,
        sub: bool,
        set_flags: bool,
        imm: u32,
        rn: u8,
        rd: u8,
    },
    AddSubReg {
        wide: bool,
        sub: bool,
        set_flags: bool,
        rm: u8,
        rn: u8,
        rd: u8,
    },
    Logic {
        wide: bool,
        op: LogicOp,
        rm: u8,
        rn: u8,
        rd: u8,
    },
    /// Offsets are in instruction words, relative to this instruction.
    B {
        link: bool,
        offset: i32,
    },
    BCond {
        cond: Cond,
        offset: i32,
    },
    Ret {
        rn: u8,
    },
    Nop,
    Svc(u16),
    Hlt(u16),
    /// 64-bit pre/post-indexed `STR`/`LDR`.
    LoadStoreIndexed {
        load: bool,
        pre: bool,
        offset: i16,
        rn: u8,
        rt: u8,
    },
    /// `STR`/`LDR` with an unsigned scaled offset.
    LoadStoreOffset {
        load: bool,
        wide: bool,
        offset: u32,
        rn: u8,
        rt: u8,
    },
    FpArith {
        double: bool,
        op: FpOp,
        rm: u8,
        rn: u8,
        rd: u8,
    },
    FpUnary {
        double: bool,
        op: FpUnary,
        rn: u8,
        rd: u8,
    },
    FmovImm {
        double: bool,
        imm8: u8,
        rd: u8,
    },
    /// `FMOV Dd, Xn`
    FmovFromGpr {
        rn: u8,
        rd: u8,
    },
    /// `MOV Vd.S[0], Vn.S[0]`
    InsS0 {
        rn: u8,
        rd: u8,
    },
    Vec {
        op: VecOp,
        rm: u8,
        rn: u8,
        rd: u8,
    },
}

fn field(word: u32, shift: u32, bits: u32) -> u32 {
    (word >> shift) & ((1 << bits) - 1)
}

fn sext(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

pub fn decode_word(word: u32) -> Option<A64Insn> {
    let rd = field(word, 0, 5) as u8;
    let rn = field(word, 5, 5) as u8;
    let rm = field(word, 16, 5) as u8;
    let wide = word >> 31 != 0;

    match word {
        0xD503_201F => return Some(A64Insn::Nop),
        w if w & 0xFFFF_FC1F == 0xD65F_0000 => return Some(A64Insn::Ret { rn }),
        w if w & 0xFFE0_001F == 0xD400_0001 => {
            return Some(A64Insn::Svc(field(w, 5, 16) as u16))
        }
        w if w & 0xFFE0_001F == 0xD440_0000 => {
            return Some(A64Insn::Hlt(field(w, 5, 16) as u16))
        }
        _ => {}
    }

    if word & 0x7C00_0000 == 0x1400_0000 {
        return Some(A64Insn::B {
            link: wide,
            offset: sext(field(word, 0, 26), 26),
        });
    }
    if word & 0xFF00_0010 == 0x5400_0000 {
        return Some(A64Insn::BCond {
            cond: Cond::from_bits(field(word, 0, 4) as u8),
            offset: sext(field(word, 5, 19), 19),
        });
    }
    if word & 0x1F80_0000 == 0x1280_0000 {
        let op = match field(word, 29, 2) {
            0 => MoveWide::N,
            2 => MoveWide::Z,
            3 => MoveWide::K,
            _ => return None,
        };
        let hw = field(word, 21, 2) as u8;
        if !wide && hw > 1 {
            return None;
        }
        return Some(A64Insn::MoveWide {
            wide,
            op,
            hw,
            imm16: field(word, 5, 16) as u16,
            rd,
        });
    }
    if word & 0x1F80_0000 == 0x1100_0000 {
        let shift = if field(word, 22, 1) != 0 { 12 } else { 0 };
        return Some(A64Insn::AddSubImm {
            wide,
            sub: field(word, 30, 1) != 0,
            set_flags: field(word, 29, 1) != 0,
            imm: field(word, 10, 12) << shift,
            rn,
            rd,
        });
    }
    if word & 0x1F20_0000 == 0x0B00_0000 {
        // Only the unshifted form is emitted.
        if field(word, 22, 2) != 0 || field(word, 10, 6) != 0 {
            return None;
        }
        return Some(A64Insn::AddSubReg {
            wide,
            sub: field(word, 30, 1) != 0,
            set_flags: field(word, 29, 1) != 0,
            rm,
            rn,
            rd,
        });
    }
    if word & 0x1F00_0000 == 0x0A00_0000 {
        if field(word, 21, 3) != 0 || field(word, 10, 6) != 0 {
            return None;
        }
        let op = match field(word, 29, 2) {
            0 => LogicOp::And,
            1 => LogicOp::Orr,
            2 => LogicOp::Eor,
            _ => LogicOp::Ands,
        };
        return Some(A64Insn::Logic {
            wide,
            op,
            rm,
            rn,
            rd,
        });
    }
    if word & 0xFF20_0400 == 0xF800_0400 {
        return Some(A64Insn::LoadStoreIndexed {
            load: field(word, 22, 1) != 0,
            pre: field(word, 11, 1) != 0,
            offset: sext(field(word, 12, 9), 9) as i16,
            rn,
            rt: rd,
        });
    }
    if word & 0xBF80_0000 == 0xB900_0000 {
        let wide = field(word, 30, 1) != 0;
        let scale = if wide { 8 } else { 4 };
        return Some(A64Insn::LoadStoreOffset {
            load: field(word, 22, 1) != 0,
            wide,
            offset: field(word, 10, 12) * scale,
            rn,
            rt: rd,
        });
    }
    if word & 0xFFA0_0C00 == 0x1E20_0800 {
        let op = match field(word, 12, 4) {
            0b0000 => FpOp::Mul,
            0b0001 => FpOp::Div,
            0b0010 => FpOp::Add,
            0b0011 => FpOp::Sub,
            _ => return None,
        };
        return Some(A64Insn::FpArith {
            double: field(word, 22, 1) != 0,
            op,
            rm,
            rn,
            rd,
        });
    }
    if word & 0xFFBE_7C00 == 0x1E20_4000 {
        let op = match field(word, 15, 2) {
            0b00 => FpUnary::Mov,
            0b01 => FpUnary::Abs,
            0b10 => FpUnary::Neg,
            _ => return None,
        };
        return Some(A64Insn::FpUnary {
            double: field(word, 22, 1) != 0,
            op,
            rn,
            rd,
        });
    }
    if word & 0xFFA0_1FE0 == 0x1E20_1000 {
        return Some(A64Insn::FmovImm {
            double: field(word, 22, 1) != 0,
            imm8: field(word, 13, 8) as u8,
            rd,
        });
    }
    if word & 0xFFFF_FC00 == 0x9E67_0000 {
        return Some(A64Insn::FmovFromGpr { rn, rd });
    }
    if word & 0xFFFF_FC00 == 0x6E04_0400 {
        return Some(A64Insn::InsS0 { rn, rd });
    }
    let vec = match word & 0xFFE0_FC00 {
        0x4EA0_1C00 => VecOp::Orr16B,
        0x6E20_1C00 => VecOp::Eor16B,
        0x4E20_8400 => VecOp::Add16B,
        0x4EA0_8400 => VecOp::Add4S,
        0x4E20_D400 => VecOp::Fadd4S,
        0x6E20_DC00 => VecOp::Fmul4S,
        _ => return None,
    };
    Some(A64Insn::Vec { op: vec, rm, rn, rd })
}

/// Expand the 8-bit packed FP immediate used by `FMOV (immediate)`.
pub fn expand_fp_imm8(imm8: u8) -> f64 {
    let sign = (imm8 >> 7) as u64;
    let b6 = ((imm8 >> 6) & 1) as u64;
    let exp_low = ((imm8 >> 4) & 0x3) as u64;
    let frac = (imm8 & 0xf) as u64;
    // exponent = NOT(b6) : b6 x 8 : exp_low
    let replicated: u64 = if b6 != 0 { 0xff } else { 0 };
    let exp = ((b6 ^ 1) << 10) | (replicated << 2) | exp_low;
    f64::from_bits(sign << 63 | exp << 52 | frac << 48)
}

struct R(u8, bool);

impl fmt::Display for R {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.0, self.1) {
            (31, true) => f.write_str("xzr"),
            (31, false) => f.write_str("wzr"),
            (n, true) => write!(f, "x{n}"),
            (n, false) => write!(f, "w{n}"),
        }
    }
}

/// Base register of a load/store or add/sub immediate, where 31 is SP.
struct Base(u8);

impl fmt::Display for Base {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            31 => f.write_str("sp"),
            n => write!(f, "x{n}"),
        }
    }
}

impl fmt::Display for A64Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            A64Insn::MoveWide {
                wide,
                op,
                hw,
                imm16,
                rd,
            } => {
                let name = match op {
                    MoveWide::N => "movn",
                    MoveWide::Z => "movz",
                    MoveWide::K => "movk",
                };
                write!(f, "{name} {}, #{imm16:#x}", R(rd, wide))?;
                if hw != 0 {
                    write!(f, ", lsl #{}", hw as u32 * 16)?;
                }
                Ok(())
            }
            A64Insn::AddSubImm {
                wide,
                sub,
                set_flags,
                imm,
                rn,
                rd,
            } => {
                let name = match (sub, set_flags) {
                    (false, false) => "add",
                    (false, true) => "adds",
                    (true, false) => "sub",
                    (true, true) => "subs",
                };
                let rn = match (rn, wide) {
                    (31, true) => "sp".to_string(),
                    (31, false) => "wsp".to_string(),
                    _ => R(rn, wide).to_string(),
                };
                write!(f, "{name} {}, {rn}, #{imm:#x}", R(rd, wide))
            }
            A64Insn::AddSubReg {
                wide,
                sub,
                set_flags,
                rm,
                rn,
                rd,
            } => {
                let name = match (sub, set_flags) {
                    (false, false) => "add",
                    (false, true) => "adds",
                    (true, false) => "sub",
                    (true, true) => "subs",
                };
                write!(f, "{name} {}, {}, {}", R(rd, wide), R(rn, wide), R(rm, wide))
            }
            A64Insn::Logic {
                wide,
                op,
                rm,
                rn,
                rd,
            } => {
                let name = match op {
                    LogicOp::And => "and",
                    LogicOp::Orr => "orr",
                    LogicOp::Eor => "eor",
                    LogicOp::Ands => "ands",
                };
                write!(f, "{name} {}, {}, {}", R(rd, wide), R(rn, wide), R(rm, wide))
            }
            A64Insn::B { link, offset } => {
                write!(f, "{} #{}", if link { "bl" } else { "b" }, offset * 4)
            }
            A64Insn::BCond { cond, offset } => write!(f, "b.{cond} #{}", offset * 4),
            A64Insn::Ret { rn } => {
                if rn == 30 {
                    f.write_str("ret")
                } else {
                    write!(f, "ret x{rn}")
                }
            }
            A64Insn::Nop => f.write_str("nop"),
            A64Insn::Svc(imm) => write!(f, "svc #{imm:#x}"),
            A64Insn::Hlt(imm) => write!(f, "hlt #{imm:#x}"),
            A64Insn::LoadStoreIndexed {
                load,
                pre,
                offset,
                rn,
                rt,
            } => {
                let name = if load { "ldr" } else { "str" };
                if pre {
                    write!(f, "{name} {}, [{}, #{offset}]!", R(rt, true), Base(rn))
                } else {
                    write!(f, "{name} {}, [{}], #{offset}", R(rt, true), Base(rn))
                }
            }
            A64Insn::LoadStoreOffset {
                load,
                wide,
                offset,
                rn,
                rt,
            } => {
                let name = if load { "ldr" } else { "str" };
                if offset == 0 {
                    write!(f, "{name} {}, [{}]", R(rt, wide), Base(rn))
                } else {
                    write!(f, "{name} {}, [{}, #{offset}]", R(rt, wide), Base(rn))
                }
            }
            A64Insn::FpArith {
                double,
                op,
                rm,
                rn,
                rd,
            } => {
                let name = match op {
                    FpOp::Add => "fadd",
                    FpOp::Sub => "fsub",
                    FpOp::Mul => "fmul",
                    FpOp::Div => "fdiv",
                };
                let p = if double { 'd' } else { 's' };
                write!(f, "{name} {p}{rd}, {p}{rn}, {p}{rm}")
            }
            A64Insn::FpUnary { double, op, rn, rd } => {
                let name = match op {
                    FpUnary::Mov => "fmov",
                    FpUnary::Abs => "fabs",
                    FpUnary::Neg => "fneg",
                };
                let p = if double { 'd' } else { 's' };
                write!(f, "{name} {p}{rd}, {p}{rn}")
            }
            A64Insn::FmovImm { double, imm8, rd } => {
                let p = if double { 'd' } else { 's' };
                write!(f, "fmov {p}{rd}, #{}", expand_fp_imm8(imm8))
            }
            A64Insn::FmovFromGpr { rn, rd } => write!(f, "fmov d{rd}, {}", R(rn, true)),
            A64Insn::InsS0 { rn, rd } => write!(f, "mov v{rd}.s[0], v{rn}.s[0]"),
            A64Insn::Vec { op, rm, rn, rd } => {
                let (name, arr) = match op {
                    VecOp::Orr16B => ("orr", "16b"),
                    VecOp::Eor16B => ("eor", "16b"),
                    VecOp::Add16B => ("add", "16b"),
                    VecOp::Add4S => ("add", "4s"),
                    VecOp::Fadd4S => ("fadd", "4s"),
                    VecOp::Fmul4S => ("fmul", "4s"),
                };
                write!(f, "{name} v{rd}.{arr}, v{rn}.{arr}, v{rm}.{arr}")
            }
        }
    }
}

/// Render a word for listings; unknown words print as `.word`.
pub fn format_word(word: u32) -> String {
    match decode_word(word) {
        Some(insn) => insn.to_string(),
        None => format!(".word {word:#010x}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_emitted_forms() {
        assert_eq!(format_word(0x5280_0540), "movz w0, #0x2a");
        assert_eq!(format_word(0x72A0_0023), "movk w3, #0x1, lsl #16");
        assert_eq!(format_word(0xF100_041F), "subs xzr, x0, #0x1");
        assert_eq!(format_word(0xF81F_0F80), "str x0, [x28, #-16]!");
        assert_eq!(format_word(0xF841_0780), "ldr x0, [x28], #16");
        assert_eq!(format_word(0x54FF_FFC1), "b.ne #-8");
        assert_eq!(format_word(0x17FF_FFFF), "b #-4");
        assert_eq!(format_word(0xD65F_03C0), "ret");
        assert_eq!(format_word(0x4E22_8400), "add v0.16b, v0.16b, v2.16b");
        assert_eq!(format_word(0x1E6E_1000), "fmov d0, #1");
        assert_eq!(format_word(0x0000_0000), ".word 0x00000000");
    }

    #[test]
    fn fp_immediates_expand() {
        assert_eq!(expand_fp_imm8(0x70), 1.0);
        assert_eq!(expand_fp_imm8(0x00), 2.0);
        assert_eq!(expand_fp_imm8(0xF0), -1.0);
        assert_eq!(expand_fp_imm8(0x60), 0.5);
    }
}
