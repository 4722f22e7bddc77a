#![allow(dead_code)]

use unihook::hook::memory::ExecBlock;
use unihook::Target;

/// Bytes every test function starts with: `push rbp; mov rbp, rsp` and a
/// ten-byte nop. Fourteen bytes of position-independent instructions.
pub const PROLOGUE: [u8; 14] = [
    0x55, 0x48, 0x89, 0xe5, 0x66, 0x2e, 0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// `lea rax, [arg0 + arg1]`
#[cfg(not(windows))]
const LEA_SUM: [u8; 4] = [0x48, 0x8d, 0x04, 0x37];
#[cfg(windows)]
const LEA_SUM: [u8; 4] = [0x48, 0x8d, 0x04, 0x11];

/// `mulsd xmm0, xmm1`
const MULSD: [u8; 4] = [0xf2, 0x0f, 0x59, 0xc1];

/// `add rax, rbx; add rax, r12`
const ADD_CALLEE_SAVED: [u8; 6] = [0x48, 0x01, 0xd8, 0x4c, 0x01, 0xe0];

/// `pop rbp; ret`
const EPILOGUE: [u8; 2] = [0x5d, 0xc3];

pub type Binary = extern "C" fn(u64, u64) -> u64;
pub type Float = extern "C" fn(f64, f64) -> f64;

/// A small function assembled at runtime, so its prologue is known.
pub struct TestFunction {
    block: ExecBlock,
}

impl TestFunction {
    fn assemble(body: &[u8]) -> Self {
        let mut code = PROLOGUE.to_vec();
        code.extend_from_slice(body);
        code.extend_from_slice(&EPILOGUE);

        let block = ExecBlock::allocate(code.len()).unwrap();
        unsafe { block.write(0, &code).unwrap() };
        block.seal().unwrap();
        Self { block }
    }

    /// `a + b`
    pub fn add() -> Self {
        Self::assemble(&LEA_SUM)
    }

    /// `a * b` on doubles.
    pub fn mul() -> Self {
        Self::assemble(&MULSD)
    }

    /// `rax + rbx + r12`, outside any calling convention.
    pub fn registers() -> Self {
        Self::assemble(&ADD_CALLEE_SAVED)
    }

    pub fn address(&self) -> usize {
        self.block.address()
    }

    pub fn target(&self) -> Target {
        Target::code(self.address(), PROLOGUE.len())
    }

    pub fn binary(&self) -> Binary {
        unsafe { std::mem::transmute::<usize, Binary>(self.address()) }
    }

    pub fn float(&self) -> Float {
        unsafe { std::mem::transmute::<usize, Float>(self.address()) }
    }

    pub fn entry_bytes(&self) -> Vec<u8> {
        unsafe { std::slice::from_raw_parts(self.block.as_ptr(), PROLOGUE.len()) }.to_vec()
    }
}
