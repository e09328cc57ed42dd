use crate::decoder::{decode, NoRegs};
use crate::inst::DecodedInstruction;

/// One line of a linear disassembly listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisasmLine {
    pub address: u64,
    pub bytes: Vec<u8>,
    pub text: String,
}

impl DisasmLine {
    fn new(address: u64, bytes: &[u8], inst: Option<&DecodedInstruction>) -> Self {
        Self {
            address,
            bytes: bytes.to_vec(),
            text: inst.map_or_else(|| "(bad)".to_string(), ToString::to_string),
        }
    }
}

impl std::fmt::Display for DisasmLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hex: Vec<String> = self.bytes.iter().map(|b| format!("{b:02x}")).collect();
        write!(f, "{:#010x}  {:<30} {}", self.address, hex.join(" "), self.text)
    }
}

/// Linear sweep over `bytes` loaded at `address`. Undecodable bytes are listed one at a time as
/// `(bad)` and the sweep continues with the next byte.
pub fn disassemble(bytes: &[u8], address: u64) -> Vec<DisasmLine> {
    let mut lines = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        let rip = address.wrapping_add(offset as u64);
        let inst = decode(&bytes[offset..], rip, &NoRegs);
        if inst.length == 0 {
            lines.push(DisasmLine::new(rip, &bytes[offset..offset + 1], None));
            offset += 1;
            continue;
        }
        let len = inst.length as usize;
        lines.push(DisasmLine::new(rip, &bytes[offset..offset + len], Some(&inst)));
        offset += len;
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_walks_instruction_boundaries() {
        let code = [0xB8, 0x0A, 0, 0, 0, 0x05, 0x05, 0, 0, 0, 0x06, 0x90, 0xC3];
        let lines = disassemble(&code, 0x1000);
        let text: Vec<&str> = lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(text, ["mov eax, 0xa", "add eax, 0x5", "(bad)", "nop", "ret"]);
        assert_eq!(lines[3].address, 0x100b);
    }
}
