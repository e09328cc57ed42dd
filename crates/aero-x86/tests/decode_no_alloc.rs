use aero_x86::{decode, NoRegs};
use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

struct CountingAlloc;

static ALLOCATIONS: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    // libtest runs each `#[test]` on its own thread; only count this one.
    static COUNT_ALLOC: Cell<bool> = const { Cell::new(false) };
}

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc(layout) };
        if !ptr.is_null() && COUNT_ALLOC.try_with(Cell::get).unwrap_or(false) {
            ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) };
    }
}

#[global_allocator]
static GLOBAL: CountingAlloc = CountingAlloc;

#[test]
fn decode_does_not_allocate_per_instruction() {
    // Warm-up: allow any one-time allocations to happen before we begin counting.
    let program: [&[u8]; 4] = [
        &[0x48, 0x89, 0xD8],             // mov rax, rbx
        &[0xB8, 0x0A, 0x00, 0x00, 0x00], // mov eax, 10
        &[0xF3, 0x0F, 0x58, 0xC1],       // addss xmm0, xmm1
        &[0x0F, 0xBC, 0xC1],             // bsf eax, ecx
    ];
    let _ = decode(program[0], 0x1000, &NoRegs);

    ALLOCATIONS.store(0, Ordering::Relaxed);

    COUNT_ALLOC.with(|c| c.set(true));
    for _ in 0..10_000 {
        for bytes in program {
            let inst = decode(bytes, 0x1000, &NoRegs);
            assert_eq!(inst.length as usize, bytes.len());
        }
    }
    COUNT_ALLOC.with(|c| c.set(false));

    assert_eq!(
        ALLOCATIONS.load(Ordering::Relaxed),
        0,
        "decoder allocated during hot-path decode"
    );
}
