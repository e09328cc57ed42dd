use aero_engine::{Engine, EngineConfig, EngineError, FaultKind, Gpr, RegionFlags};

const BASE: u64 = 0x1000;

fn engine(code: &[u8]) -> Engine {
    let mut engine = Engine::new(EngineConfig::default()).unwrap();
    engine.load_image(BASE, code, BASE).unwrap();
    engine
}

fn ps(lanes: [f32; 4]) -> u128 {
    lanes
        .iter()
        .enumerate()
        .fold(0, |acc, (i, f)| acc | (f.to_bits() as u128) << (32 * i))
}

fn lanes(v: u128) -> [f32; 4] {
    [0, 1, 2, 3].map(|i| f32::from_bits((v >> (32 * i)) as u32))
}

#[test]
fn x87_stack_pushes_and_adds() {
    // fld1; fld1; fadd st0, st1; fldz
    let mut e = engine(&[0xD9, 0xE8, 0xD9, 0xE8, 0xD8, 0xC1, 0xD9, 0xEE, 0xC3]);
    let result = e.run().unwrap();
    assert_eq!(result.executed, 5);
    assert_eq!(e.cpu().x87[0], 0.0);
    assert_eq!(e.cpu().x87[1], 2.0);
    assert_eq!(e.cpu().x87[2], 1.0);
}

#[test]
fn x87_exchange_and_pop() {
    // fld1; fldz; fxch st1; fstp st0
    let mut e = engine(&[0xD9, 0xE8, 0xD9, 0xEE, 0xD9, 0xC9, 0xDD, 0xD8, 0xC3]);
    e.run().unwrap();
    assert_eq!(e.cpu().x87[0], 0.0);
    assert_eq!(e.cpu().x87[7], 0.0);
}

#[test]
fn scalar_add_preserves_upper_lanes() {
    // addss xmm0, xmm1
    let mut e = engine(&[0xF3, 0x0F, 0x58, 0xC1, 0xC3]);
    e.cpu_mut().xmm[0] = ps([1.0, 2.0, 3.0, 4.0]);
    e.cpu_mut().xmm[1] = ps([10.0, 20.0, 30.0, 40.0]);
    e.run().unwrap();
    assert_eq!(lanes(e.cpu().xmm[0]), [11.0, 2.0, 3.0, 4.0]);
}

#[test]
fn packed_ops_cover_every_lane() {
    // addps xmm0, xmm1; pxor xmm2, xmm2
    let mut e = engine(&[0x0F, 0x58, 0xC1, 0x66, 0x0F, 0xEF, 0xD2, 0xC3]);
    e.cpu_mut().xmm[0] = ps([1.0, 2.0, 3.0, 4.0]);
    e.cpu_mut().xmm[1] = ps([10.0, 20.0, 30.0, 40.0]);
    e.cpu_mut().xmm[2] = u128::MAX;
    e.run().unwrap();
    assert_eq!(lanes(e.cpu().xmm[0]), [11.0, 22.0, 33.0, 44.0]);
    assert_eq!(e.cpu().xmm[2], 0);
}

#[test]
fn unsafe_fpu_memory_form_is_rejected() {
    // fld dword [rax]
    let mut e = engine(&[0xD9, 0x00, 0xC3]);
    let err = e.run().unwrap_err();
    assert_eq!(err.kind(), FaultKind::Decode);
    assert!(matches!(err, EngineError::Unsafe { .. }));
}

#[test]
fn rep_stosb_fills_guest_memory() {
    // rep stosb
    let mut e = engine(&[0xF3, 0xAA, 0xC3]);
    e.map_region(0x10_0000, 0x100, RegionFlags::WRITABLE, "buf")
        .unwrap();
    e.set_gpr(Gpr::Rax, 0xCC);
    e.set_gpr(Gpr::Rdi, 0x10_0000);
    e.set_gpr(Gpr::Rcx, 0x40);
    let result = e.run().unwrap();
    assert_eq!(result.executed, 2);
    assert_eq!(e.gpr(Gpr::Rcx), 0);
    assert_eq!(e.gpr(Gpr::Rdi), 0x10_0040);
    assert!(e
        .cpu()
        .memory
        .peek(0x10_0000, 0x40)
        .unwrap()
        .iter()
        .all(|&b| b == 0xCC));
}

#[test]
fn string_overrun_faults_with_memory_kind() {
    let mut e = engine(&[0xF3, 0xAA, 0xC3]);
    e.map_region(0x10_0000, 0x10, RegionFlags::WRITABLE, "buf")
        .unwrap();
    e.set_gpr(Gpr::Rdi, 0x10_0000);
    e.set_gpr(Gpr::Rcx, 0x20);
    let err = e.run().unwrap_err();
    assert_eq!(err.kind(), FaultKind::Memory);
    // Sixteen iterations completed before the fault.
    assert_eq!(e.gpr(Gpr::Rcx), 0x10);
}

#[test]
fn bit_scan_through_the_dispatcher() {
    // mov ecx, 8; bsf eax, ecx; mov ecx, 0; bsf edx, ecx
    let code = [
        0xB9, 0x08, 0x00, 0x00, 0x00, 0x0F, 0xBC, 0xC1, 0xB9, 0x00, 0x00, 0x00, 0x00, 0x0F, 0xBC,
        0xD1, 0xC3,
    ];
    let mut e = engine(&code);
    e.set_gpr(Gpr::Rdx, 0x55);
    e.run().unwrap();
    assert_eq!(e.gpr(Gpr::Rax), 3);
    assert_eq!(e.gpr(Gpr::Rdx), 0);
    assert!(e.cpu().flag(aero_cpu::Rflags::ZF));
}

#[test]
fn bit_scan_finds_bits_above_31() {
    // bsf eax, ecx
    let mut e = engine(&[0x0F, 0xBC, 0xC1, 0xC3]);
    e.set_gpr(Gpr::Rax, 0xdead);
    e.set_gpr(Gpr::Rcx, 1 << 40);
    e.run().unwrap();
    assert_eq!(e.gpr(Gpr::Rax), 40);
    assert!(!e.cpu().flag(aero_cpu::Rflags::ZF));
}
