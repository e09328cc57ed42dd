#![allow(dead_code)]

/// Iterative Fibonacci: leaves fib(10) in EAX.
pub const FIB: [u8; 33] = [
    0xB8, 0x00, 0x00, 0x00, 0x00, // mov eax, 0
    0xBB, 0x01, 0x00, 0x00, 0x00, // mov ebx, 1
    0xB9, 0x0A, 0x00, 0x00, 0x00, // mov ecx, 10
    0xBE, 0x01, 0x00, 0x00, 0x00, // mov esi, 1
    0x89, 0xC2, // loop: mov edx, eax
    0x01, 0xDA, // add edx, ebx
    0x89, 0xD8, // mov eax, ebx
    0x89, 0xD3, // mov ebx, edx
    0x29, 0xF1, // sub ecx, esi
    0x75, 0xF4, // jne loop
    0xC3,
];
