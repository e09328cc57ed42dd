use aero_x86::{decode, try_decode, InstKind, NoRegs};
use proptest::prelude::*;

fn iced_len(bytes: &[u8], ip: u64) -> Option<usize> {
    let mut decoder = iced_x86::Decoder::with_ip(64, bytes, ip, iced_x86::DecoderOptions::NONE);
    let instruction = decoder.decode();
    if instruction.is_invalid() {
        None
    } else {
        Some(instruction.len())
    }
}

/// Byte strings biased towards opcodes the decoder knows about.
fn interesting_bytes() -> impl Strategy<Value = Vec<u8>> {
    let lead = prop_oneof![
        Just(vec![]),
        Just(vec![0x48]),
        Just(vec![0x41]),
        Just(vec![0xF3]),
        Just(vec![0x66]),
        Just(vec![0x0F]),
        Just(vec![0xF3, 0x0F]),
        Just(vec![0x66, 0x0F]),
    ];
    (lead, proptest::collection::vec(any::<u8>(), 0..=15)).prop_map(|(mut lead, tail)| {
        lead.extend(tail);
        lead.truncate(15);
        lead
    })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 4096,
        .. ProptestConfig::default()
    })]

    #[test]
    fn length_never_exceeds_window(
        rip in any::<u64>(),
        bytes in proptest::collection::vec(any::<u8>(), 0..=20),
    ) {
        let inst = decode(&bytes, rip, &NoRegs);
        prop_assert!(
            (inst.length as usize) <= bytes.len(),
            "len={} bytes={:02x?}",
            inst.length,
            bytes
        );
        prop_assert!(inst.length <= 15);
        prop_assert_eq!(inst.valid, inst.length > 0);
        if !inst.valid {
            prop_assert_eq!(inst.kind, InstKind::Invalid);
        }
    }

    #[test]
    fn register_operands_stay_in_range(bytes in interesting_bytes()) {
        let inst = decode(&bytes, 0x1000, &NoRegs);
        for reg in [inst.src_reg, inst.dst_reg].into_iter().flatten() {
            prop_assert!(reg < 16, "reg={} bytes={:02x?}", reg, bytes);
        }
    }

    #[test]
    fn lengths_agree_with_iced(bytes in interesting_bytes()) {
        if let Ok(inst) = try_decode(&bytes, 0x1000, &NoRegs) {
            if let Some(expected) = iced_len(&bytes, 0x1000) {
                let len = inst.length as usize;
                prop_assert_eq!(len, expected, "bytes={:02x?} inst={}", bytes, inst);
            }
        }
    }

    #[test]
    fn prefix_of_valid_instruction_never_decodes_longer(
        bytes in interesting_bytes(),
        cut in 0usize..15,
    ) {
        let full = decode(&bytes, 0x1000, &NoRegs);
        let cut = cut.min(bytes.len());
        let short = decode(&bytes[..cut], 0x1000, &NoRegs);
        if full.valid && cut < full.length as usize {
            prop_assert!(!short.valid, "bytes={:02x?} cut={}", bytes, cut);
        }
    }
}
