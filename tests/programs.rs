mod common;

use aero_engine::{Engine, EngineConfig, Gpr, HaltReason, RegionFlags};
use common::FIB;

const BASE: u64 = 0x1000;

fn run(code: &[u8]) -> Engine {
    let mut engine = Engine::new(EngineConfig::default()).unwrap();
    engine.load_image(BASE, code, BASE).unwrap();
    let result = engine.run().unwrap();
    assert_eq!(result.reason, HaltReason::Return);
    engine
}

#[test]
fn fibonacci_of_ten() {
    let e = run(&FIB);
    assert_eq!(e.gpr(Gpr::Rax), 55);
    assert_eq!(e.gpr(Gpr::Rcx), 0);
    assert_eq!(e.cpu().executed, 65);
}

#[test]
fn copy_a_string_into_the_heap() {
    let heap = EngineConfig::default().heap_base();
    let mut code = vec![
        0x48, 0x8D, 0x35, 0x00, 0x00, 0x00, 0x00, // lea rsi, [rip+msg]
        0xB9, 0x05, 0x00, 0x00, 0x00, // mov ecx, 5
        0xF3, 0xA4, // rep movsb
        0xC3,
    ];
    let msg_offset = (code.len() - 7) as u32;
    code[3..7].copy_from_slice(&msg_offset.to_le_bytes());
    code.extend_from_slice(b"hello");

    let mut e = Engine::new(EngineConfig::default()).unwrap();
    e.load_image(BASE, &code, BASE).unwrap();
    e.set_gpr(Gpr::Rdi, heap);
    e.run().unwrap();
    assert_eq!(e.cpu().memory.peek(heap, 5).unwrap(), b"hello");
    assert_eq!(e.gpr(Gpr::Rdi), heap + 5);
}

#[test]
fn load_and_store_through_a_data_region() {
    let code = [
        0x8B, 0x05, 0xFA, 0xEF, 0x0F, 0x00, // mov eax, [rip+0xfeffa] -> 0x100000
        0x05, 0x01, 0x00, 0x00, 0x00, // add eax, 1
        0x89, 0x05, 0xEF, 0xEF, 0x0F, 0x00, // mov [rip+0xfefef] -> 0x100000
        0xC3,
    ];
    let mut e = Engine::new(EngineConfig::default()).unwrap();
    e.load_image(BASE, &code, BASE).unwrap();
    e.map_region(0x10_0000, 0x1000, RegionFlags::WRITABLE, "data")
        .unwrap();
    e.cpu_mut().memory.write_u32(0x10_0000, 41).unwrap();
    e.run().unwrap();
    assert_eq!(e.gpr(Gpr::Rax), 42);
    assert_eq!(e.cpu().memory.read_u32(0x10_0000).unwrap(), 42);
}
