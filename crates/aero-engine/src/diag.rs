//! Read-only views of engine state for hosts and the CLI.

use std::fmt::Write as _;

use aero_cpu::{CpuState, GuestMemory, Gpr, MemoryError, RegionFlags};
use aero_x86::{disassemble as sweep, DisasmLine};

pub fn dump_registers(cpu: &CpuState) -> String {
    let mut out = String::new();
    for row in Gpr::ALL.chunks(4) {
        let cells: Vec<String> = row
            .iter()
            .map(|&reg| format!("{:>3}={:#018x}", reg.name(), cpu.gpr(reg)))
            .collect();
        let _ = writeln!(out, "{}", cells.join("  "));
    }
    let _ = writeln!(
        out,
        "rip={:#018x}  rflags={:#06x} [{}]",
        cpu.rip,
        cpu.rflags.bits(),
        cpu.rflags.describe()
    );
    let _ = write!(
        out,
        "executed={} budget={} safety={} last_rip={:#x} last_inst=[{}]",
        cpu.executed,
        cpu.budget,
        if cpu.safety { "on" } else { "off" },
        cpu.last_valid_rip,
        cpu.last_inst
    );
    out
}

fn perms(flags: RegionFlags) -> String {
    [
        (RegionFlags::ALLOCATED, 'a'),
        (RegionFlags::WRITABLE, 'w'),
        (RegionFlags::EXECUTABLE, 'x'),
    ]
    .iter()
    .map(|&(flag, c)| if flags.contains(flag) { c } else { '-' })
    .collect()
}

pub fn dump_regions(memory: &GuestMemory) -> String {
    let mut out = String::new();
    for (id, region) in memory.regions() {
        let _ = writeln!(
            out,
            "#{:<2} {:#010x}-{:#010x} {} {}",
            id.0,
            region.start,
            region.end(),
            perms(region.flags),
            region.name
        );
    }
    if out.is_empty() {
        out.push_str("(no regions)\n");
    }
    out
}

/// Hex dump of `len` bytes at `addr`, 16 per line.
pub fn dump_memory(memory: &GuestMemory, addr: u64, len: usize) -> Result<String, MemoryError> {
    let bytes = memory.peek(addr, len)?;
    let mut out = String::new();
    for (i, chunk) in bytes.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() { b as char } else { '.' })
            .collect();
        let _ = writeln!(
            out,
            "{:#010x}  {:<47}  {}",
            addr + (i * 16) as u64,
            hex.join(" "),
            ascii
        );
    }
    Ok(out)
}

pub fn disassemble(
    memory: &GuestMemory,
    addr: u64,
    len: usize,
) -> Result<Vec<DisasmLine>, MemoryError> {
    Ok(sweep(memory.peek(addr, len)?, addr))
}

#[cfg(test)]
mod tests {
    use aero_cpu::MemoryLimits;

    use super::*;

    #[test]
    fn region_dump_lists_permissions() {
        let mut mem = GuestMemory::new(0x10000, MemoryLimits::default()).unwrap();
        mem.map_region(0x1000, 0x100, RegionFlags::EXECUTABLE, "code")
            .unwrap();
        assert_eq!(dump_regions(&mem), "#0  0x00001000-0x00001100 a-x code\n");
    }

    #[test]
    fn memory_dump_formats_lines() {
        let mut mem = GuestMemory::new(0x10000, MemoryLimits::default()).unwrap();
        mem.load(0x1000, b"AB\x00").unwrap();
        let dump = dump_memory(&mem, 0x1000, 3).unwrap();
        assert!(dump.starts_with("0x00001000  41 42 00"));
        assert!(dump.trim_end().ends_with("AB."));
        assert!(dump_memory(&mem, 0x10, 4).is_err());
    }
}
