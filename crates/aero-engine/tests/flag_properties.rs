use aero_cpu::Rflags;
use aero_engine::{Engine, EngineConfig, Gpr};
use proptest::prelude::*;

fn program(a: u32, op: u8, b: u32) -> Vec<u8> {
    let mut code = vec![0xB8];
    code.extend_from_slice(&a.to_le_bytes());
    code.push(op);
    code.extend_from_slice(&b.to_le_bytes());
    code.push(0xC3);
    code
}

fn run(code: &[u8]) -> Engine {
    let mut e = Engine::new(EngineConfig::default()).unwrap();
    e.load_image(0x1000, code, 0x1000).unwrap();
    e.run().unwrap();
    e
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn add_imm_matches_32_bit_arithmetic(a in any::<u32>(), b in 0u32..0x1000) {
        let e = run(&program(a, 0x05, b));
        let r = a.wrapping_add(b);
        prop_assert_eq!(e.gpr(Gpr::Rax), u64::from(r));
        prop_assert_eq!(e.cpu().flag(Rflags::ZF), r == 0);
        prop_assert_eq!(e.cpu().flag(Rflags::SF), r >> 31 != 0);
        prop_assert_eq!(e.cpu().flag(Rflags::CF), r < a);
    }

    #[test]
    fn cmp_imm_leaves_eax_and_sets_zf_on_equality(a in 0u32..0x1000, b in 0u32..0x1000) {
        let e = run(&program(a, 0x3D, b));
        prop_assert_eq!(e.gpr(Gpr::Rax), u64::from(a));
        prop_assert_eq!(e.cpu().flag(Rflags::ZF), a == b);
    }
}
