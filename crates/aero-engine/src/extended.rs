//! Direct interpretation of the string and bit-manipulation families.
//!
//! These instructions run against [`CpuState`] without going through code generation. Every
//! guest memory access goes through the validated accessors of [`aero_cpu::GuestMemory`].

use aero_cpu::{CpuState, Gpr, MemoryError, Rflags};
use aero_x86::{BitOp, DecodedInstruction, InstKind, RepPrefix, StringOp, Width};

use crate::error::EngineError;

pub(crate) fn execute(cpu: &mut CpuState, inst: &DecodedInstruction) -> Result<(), EngineError> {
    let fault = |source: MemoryError| EngineError::Memory {
        rip: inst.rip,
        source,
    };
    match inst.kind {
        InstKind::String { op, rep } => string(cpu, op, rep, inst.width).map_err(fault),
        InstKind::Bit(op) => bit(cpu, op, inst).map_err(fault),
        _ => Err(EngineError::Unsupported {
            rip: inst.rip,
            mnemonic: inst.mnemonic,
        }),
    }
}

fn string(
    cpu: &mut CpuState,
    op: StringOp,
    rep: Option<RepPrefix>,
    width: Width,
) -> Result<(), MemoryError> {
    let Some(rep) = rep else {
        return string_once(cpu, op, width);
    };
    let compares = matches!(op, StringOp::Cmps | StringOp::Scas);
    loop {
        let count = cpu.gpr(Gpr::Rcx);
        if count == 0 {
            return Ok(());
        }
        string_once(cpu, op, width)?;
        cpu.set_gpr(Gpr::Rcx, count - 1);
        if compares {
            let zf = cpu.flag(Rflags::ZF);
            match rep {
                RepPrefix::Rep if !zf => return Ok(()),
                RepPrefix::Repne if zf => return Ok(()),
                _ => {}
            }
        }
    }
}

fn string_once(cpu: &mut CpuState, op: StringOp, width: Width) -> Result<(), MemoryError> {
    let size = width.bytes();
    let step = if cpu.flag(Rflags::DF) {
        (size as u64).wrapping_neg()
    } else {
        size as u64
    };
    let rsi = cpu.gpr(Gpr::Rsi);
    let rdi = cpu.gpr(Gpr::Rdi);

    match op {
        StringOp::Movs => {
            let value = cpu.memory.read_uint(rsi, size)?;
            cpu.memory.write_uint(rdi, size, value)?;
            cpu.set_gpr(Gpr::Rsi, rsi.wrapping_add(step));
            cpu.set_gpr(Gpr::Rdi, rdi.wrapping_add(step));
        }
        StringOp::Stos => {
            let value = cpu.gpr(Gpr::Rax) & width.mask();
            cpu.memory.write_uint(rdi, size, value)?;
            cpu.set_gpr(Gpr::Rdi, rdi.wrapping_add(step));
        }
        StringOp::Lods => {
            let value = cpu.memory.read_uint(rsi, size)?;
            let rax = write_sized(cpu.gpr(Gpr::Rax), value, width);
            cpu.set_gpr(Gpr::Rax, rax);
            cpu.set_gpr(Gpr::Rsi, rsi.wrapping_add(step));
        }
        StringOp::Cmps => {
            let a = cpu.memory.read_uint(rsi, size)?;
            let b = cpu.memory.read_uint(rdi, size)?;
            compare_flags(&mut cpu.rflags, a, b, width);
            cpu.set_gpr(Gpr::Rsi, rsi.wrapping_add(step));
            cpu.set_gpr(Gpr::Rdi, rdi.wrapping_add(step));
        }
        StringOp::Scas => {
            let a = cpu.gpr(Gpr::Rax) & width.mask();
            let b = cpu.memory.read_uint(rdi, size)?;
            compare_flags(&mut cpu.rflags, a, b, width);
            cpu.set_gpr(Gpr::Rdi, rdi.wrapping_add(step));
        }
    }
    Ok(())
}

/// Register write with x86 partial-register rules: 8/16-bit writes merge, 32-bit writes
/// zero-extend.
fn write_sized(old: u64, value: u64, width: Width) -> u64 {
    match width {
        Width::W8 | Width::W16 => (old & !width.mask()) | (value & width.mask()),
        Width::W32 | Width::W64 => value & width.mask(),
    }
}

/// Status flags of `a - b` at the operand width.
fn compare_flags(flags: &mut Rflags, a: u64, b: u64, width: Width) {
    let mask = width.mask();
    let sign = 1u64 << (width.bytes() * 8 - 1);
    let (a, b) = (a & mask, b & mask);
    let r = a.wrapping_sub(b) & mask;
    flags.set_status(r == 0, r & sign != 0, a < b, (a ^ b) & (a ^ r) & sign != 0);
}

fn bit(cpu: &mut CpuState, op: BitOp, inst: &DecodedInstruction) -> Result<(), MemoryError> {
    match op {
        BitOp::Bsf | BitOp::Bsr => {
            let Some(dst) = inst.dst_reg else {
                return Ok(());
            };
            // Register sources are scanned across all 64 bits.
            let source = match inst.src_reg {
                Some(src) => cpu.gpr_at(src),
                None => cpu
                    .memory
                    .read_uint(inst.effective_address, inst.width.bytes())?,
            };
            if source == 0 {
                cpu.set_gpr_at(dst, 0);
                cpu.set_flag(Rflags::ZF, true);
                return Ok(());
            }
            let index = if op == BitOp::Bsf {
                source.trailing_zeros()
            } else {
                63 - source.leading_zeros()
            };
            cpu.set_gpr_at(dst, u64::from(index));
            cpu.set_flag(Rflags::ZF, false);
        }
        BitOp::Bt | BitOp::Bts | BitOp::Btr | BitOp::Btc => {
            let index = match (inst.src_reg, inst.immediate) {
                (Some(src), _) => cpu.gpr_at(src),
                (None, Some(imm)) => imm as u64,
                (None, None) => return Ok(()),
            };
            match inst.dst_reg {
                Some(dst) => {
                    let value = cpu.gpr_at(dst);
                    let (cf, updated) = test_bit(op, value, index % 64);
                    cpu.set_flag(Rflags::CF, cf);
                    if op != BitOp::Bt {
                        cpu.set_gpr_at(dst, updated);
                    }
                }
                None => {
                    let size = inst.width.bytes();
                    let bits = (size * 8) as u64;
                    let addr = inst.effective_address;
                    let value = cpu.memory.read_uint(addr, size)?;
                    let (cf, updated) = test_bit(op, value, index % bits);
                    if op != BitOp::Bt {
                        cpu.memory.write_uint(addr, size, updated)?;
                    }
                    cpu.set_flag(Rflags::CF, cf);
                }
            }
        }
    }
    Ok(())
}

/// Returns the selected bit and the value after the operation.
fn test_bit(op: BitOp, value: u64, index: u64) -> (bool, u64) {
    let mask = 1u64 << index;
    let updated = match op {
        BitOp::Bts => value | mask,
        BitOp::Btr => value & !mask,
        BitOp::Btc => value ^ mask,
        _ => value,
    };
    (value & mask != 0, updated)
}

#[cfg(test)]
mod tests {
    use aero_cpu::{GuestMemory, MemoryLimits, RegionFlags};
    use aero_x86::{decode, NoRegs};

    use super::*;

    fn cpu() -> CpuState {
        let mut mem = GuestMemory::new(0x10000, MemoryLimits::default()).unwrap();
        mem.map_region(0x2000, 0x1000, RegionFlags::WRITABLE, "data")
            .unwrap();
        CpuState::new(mem)
    }

    fn run(cpu: &mut CpuState, bytes: &[u8]) -> Result<(), EngineError> {
        let inst = decode(bytes, 0x1000, &*cpu);
        assert!(inst.valid, "{bytes:02x?} did not decode");
        execute(cpu, &inst)
    }

    #[test]
    fn rep_movsb_copies_and_advances() {
        let mut cpu = cpu();
        cpu.memory.load(0x2000, b"hello").unwrap();
        cpu.set_gpr(Gpr::Rsi, 0x2000);
        cpu.set_gpr(Gpr::Rdi, 0x2100);
        cpu.set_gpr(Gpr::Rcx, 5);
        run(&mut cpu, &[0xF3, 0xA4]).unwrap();
        assert_eq!(cpu.memory.peek(0x2100, 5).unwrap(), b"hello");
        assert_eq!(cpu.gpr(Gpr::Rcx), 0);
        assert_eq!(cpu.gpr(Gpr::Rsi), 0x2005);
        assert_eq!(cpu.gpr(Gpr::Rdi), 0x2105);
    }

    #[test]
    fn stosd_honours_direction_flag() {
        let mut cpu = cpu();
        cpu.set_gpr(Gpr::Rax, 0x1122_3344_5566_7788);
        cpu.set_gpr(Gpr::Rdi, 0x2010);
        cpu.set_flag(Rflags::DF, true);
        run(&mut cpu, &[0xAB]).unwrap();
        assert_eq!(cpu.memory.read_u32(0x2010).unwrap(), 0x5566_7788);
        assert_eq!(cpu.gpr(Gpr::Rdi), 0x200c);
    }

    #[test]
    fn lodsb_merges_into_al() {
        let mut cpu = cpu();
        cpu.memory.load(0x2000, &[0x5a]).unwrap();
        cpu.set_gpr(Gpr::Rax, 0xffff_ff00);
        cpu.set_gpr(Gpr::Rsi, 0x2000);
        run(&mut cpu, &[0xAC]).unwrap();
        assert_eq!(cpu.gpr(Gpr::Rax), 0xffff_ff5a);
        assert_eq!(cpu.gpr(Gpr::Rsi), 0x2001);
    }

    #[test]
    fn repne_scasb_stops_on_match() {
        let mut cpu = cpu();
        cpu.memory.load(0x2000, b"abc\0def").unwrap();
        cpu.set_gpr(Gpr::Rax, 0);
        cpu.set_gpr(Gpr::Rdi, 0x2000);
        cpu.set_gpr(Gpr::Rcx, 100);
        run(&mut cpu, &[0xF2, 0xAE]).unwrap();
        assert!(cpu.flag(Rflags::ZF));
        assert_eq!(cpu.gpr(Gpr::Rdi), 0x2004);
        assert_eq!(cpu.gpr(Gpr::Rcx), 96);
    }

    #[test]
    fn string_fault_outside_regions() {
        let mut cpu = cpu();
        cpu.set_gpr(Gpr::Rdi, 0x8000);
        let err = run(&mut cpu, &[0xAA]).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Memory {
                source: MemoryError::Unmapped { .. },
                ..
            }
        ));
        assert_eq!(cpu.gpr(Gpr::Rdi), 0x8000);
    }

    #[test]
    fn bsf_and_bsr() {
        let mut cpu = cpu();
        cpu.set_gpr(Gpr::Rcx, 0x8);
        run(&mut cpu, &[0x0F, 0xBC, 0xC1]).unwrap();
        assert_eq!(cpu.gpr(Gpr::Rax), 3);
        assert!(!cpu.flag(Rflags::ZF));

        cpu.set_gpr(Gpr::Rcx, 0x8001_0000);
        run(&mut cpu, &[0x0F, 0xBD, 0xC1]).unwrap();
        assert_eq!(cpu.gpr(Gpr::Rax), 31);
    }

    #[test]
    fn bit_scan_covers_upper_register_half() {
        let mut cpu = cpu();
        cpu.set_gpr(Gpr::Rax, 0xdead);
        cpu.set_gpr(Gpr::Rcx, 1 << 40);
        // bsf eax, ecx
        run(&mut cpu, &[0x0F, 0xBC, 0xC1]).unwrap();
        assert_eq!(cpu.gpr(Gpr::Rax), 40);
        assert!(!cpu.flag(Rflags::ZF));

        cpu.set_gpr(Gpr::Rcx, (1 << 63) | 1);
        // bsr eax, ecx
        run(&mut cpu, &[0x0F, 0xBD, 0xC1]).unwrap();
        assert_eq!(cpu.gpr(Gpr::Rax), 63);
    }

    #[test]
    fn bsf_of_zero_writes_zero_and_sets_zf() {
        let mut cpu = cpu();
        cpu.set_gpr(Gpr::Rax, 0xdead);
        cpu.set_gpr(Gpr::Rcx, 0);
        run(&mut cpu, &[0x0F, 0xBC, 0xC1]).unwrap();
        assert_eq!(cpu.gpr(Gpr::Rax), 0);
        assert!(cpu.flag(Rflags::ZF));
    }

    #[test]
    fn bit_test_family() {
        let mut cpu = cpu();
        cpu.set_gpr(Gpr::Rax, 0b1010);
        // bt eax, 65 -> bit 1
        cpu.set_gpr(Gpr::Rcx, 65);
        run(&mut cpu, &[0x0F, 0xA3, 0xC8]).unwrap();
        assert!(cpu.flag(Rflags::CF));
        assert_eq!(cpu.gpr(Gpr::Rax), 0b1010);

        // bts eax, 0
        run(&mut cpu, &[0x0F, 0xBA, 0xE8, 0x00]).unwrap();
        assert!(!cpu.flag(Rflags::CF));
        assert_eq!(cpu.gpr(Gpr::Rax), 0b1011);

        // btr eax, 3
        run(&mut cpu, &[0x0F, 0xBA, 0xF0, 0x03]).unwrap();
        assert!(cpu.flag(Rflags::CF));
        assert_eq!(cpu.gpr(Gpr::Rax), 0b0011);

        // btc eax, 2
        run(&mut cpu, &[0x0F, 0xBA, 0xF8, 0x02]).unwrap();
        assert!(!cpu.flag(Rflags::CF));
        assert_eq!(cpu.gpr(Gpr::Rax), 0b0111);
    }
}
