use std::mem;

/// Single-byte `nop`
pub const NOP: u8 = 0x90;
/// Opcode of `call rel32`
pub const CALL_REL32: u8 = 0xE8;
/// Opcode of `jmp rel32`
pub const JMP_REL32: u8 = 0xE9;
/// Length of a `call rel32` / `jmp rel32` instruction
pub const REL32_LEN: usize = 5;
/// Length of the absolute jump produced by [`jmp_abs`]
pub const JMP_ABS_LEN: usize = mem::size_of::<JmpAbs>();

#[repr(packed)]
#[allow(dead_code)]
/// Struct helper for generating an absolute jump
struct JmpAbs {
    /// Absolute jmp instruction (jmp [rip + 0])
    jmp: [u8; 6],
    /// Absolute address to jump to
    target: u64,
}

/// Generates an absolute jump to a specified address and returns bytecode
pub fn jmp_abs(target: usize) -> [u8; JMP_ABS_LEN] {
    unsafe {
        mem::transmute(JmpAbs {
            jmp: [0xff, 0x25, 0x00, 0x00, 0x00, 0x00],
            target: (target as u64).to_le(),
        })
    }
}

/// Displacement that makes an instruction of `len` bytes at `source` land on `destination`,
/// or `None` if it does not fit in 32 bits
pub fn rel32(source: usize, len: usize, destination: usize) -> Option<i32> {
    let next = (source as i128) + (len as i128);
    i32::try_from(destination as i128 - next).ok()
}

/// `opcode rel32` at `source` reaching `destination`
fn branch_rel32(opcode: u8, source: usize, destination: usize) -> Option<[u8; REL32_LEN]> {
    let displacement = rel32(source, REL32_LEN, destination)?;
    let mut code = [opcode, 0, 0, 0, 0];
    code[1..].copy_from_slice(&displacement.to_le_bytes());
    Some(code)
}

/// `call rel32` placed at `source`
pub fn call_rel32(source: usize, destination: usize) -> Option<[u8; REL32_LEN]> {
    branch_rel32(CALL_REL32, source, destination)
}

/// `jmp rel32` placed at `source`
pub fn jmp_rel32(source: usize, destination: usize) -> Option<[u8; REL32_LEN]> {
    branch_rel32(JMP_REL32, source, destination)
}

/// `count` single-byte nops
pub fn nops(count: usize) -> Vec<u8> {
    vec![NOP; count]
}
