//! Register roles of the platform C calling convention.
//!
//! Trampolines are generated from these tables instead of per-variant byte
//! strings, so the System V and Microsoft x64 builds share one code path.

use super::writer::{Reg, Xmm};

/// The platform calling convention as far as trampolines care.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abi {
    pub name: &'static str,
    /// Integer argument registers, in argument order.
    pub int_args: &'static [Reg],
    /// Vector argument registers, in argument order.
    pub vector_args: &'static [Xmm],
    /// Integer result registers.
    pub int_results: &'static [Reg],
    /// Vector result registers.
    pub vector_results: &'static [Xmm],
}

pub const SYSV: Abi = Abi {
    name: "sysv64",
    int_args: &[Reg::RDI, Reg::RSI, Reg::RDX, Reg::RCX, Reg::R8, Reg::R9],
    vector_args: &[
        Xmm::XMM0,
        Xmm::XMM1,
        Xmm::XMM2,
        Xmm::XMM3,
        Xmm::XMM4,
        Xmm::XMM5,
        Xmm::XMM6,
        Xmm::XMM7,
    ],
    int_results: &[Reg::RAX, Reg::RDX],
    vector_results: &[Xmm::XMM0, Xmm::XMM1],
};

/// Microsoft x64, with the vectorcall register set for wide variants.
pub const WIN64: Abi = Abi {
    name: "win64",
    int_args: &[Reg::RCX, Reg::RDX, Reg::R8, Reg::R9],
    vector_args: &[Xmm::XMM0, Xmm::XMM1, Xmm::XMM2, Xmm::XMM3, Xmm::XMM4, Xmm::XMM5],
    int_results: &[Reg::RAX],
    vector_results: &[Xmm::XMM0, Xmm::XMM1, Xmm::XMM2, Xmm::XMM3],
};

#[cfg(windows)]
pub const NATIVE: Abi = WIN64;

#[cfg(not(windows))]
pub const NATIVE: Abi = SYSV;

/// General purpose registers other than the stack pointer, in context order.
pub const ALL_GPRS: [Reg; 15] = [
    Reg::RAX,
    Reg::RBX,
    Reg::RCX,
    Reg::RDX,
    Reg::RBP,
    Reg::RSI,
    Reg::RDI,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
];

pub const ALL_XMMS: [Xmm; 16] = [
    Xmm::XMM0,
    Xmm::XMM1,
    Xmm::XMM2,
    Xmm::XMM3,
    Xmm::XMM4,
    Xmm::XMM5,
    Xmm::XMM6,
    Xmm::XMM7,
    Xmm::XMM8,
    Xmm::XMM9,
    Xmm::XMM10,
    Xmm::XMM11,
    Xmm::XMM12,
    Xmm::XMM13,
    Xmm::XMM14,
    Xmm::XMM15,
];

impl Abi {
    pub fn first_arg(&self) -> Reg {
        self.int_args[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Registers the trampolines use as scratch must never carry arguments
    /// or results, and the slot register must be callee-saved.
    #[test]
    fn scratch_registers_are_free() {
        for abi in [SYSV, WIN64] {
            for reg in [Reg::R10, Reg::R11, Reg::R12] {
                assert!(!abi.int_args.contains(&reg), "{} uses {:?}", abi.name, reg);
                assert!(!abi.int_results.contains(&reg), "{} uses {:?}", abi.name, reg);
            }
        }
    }

    #[test]
    fn result_registers_start_with_rax() {
        assert_eq!(SYSV.int_results[0], Reg::RAX);
        assert_eq!(WIN64.int_results[0], Reg::RAX);
        assert_eq!(SYSV.first_arg(), Reg::RDI);
        assert_eq!(WIN64.first_arg(), Reg::RCX);
    }

    #[test]
    fn context_covers_every_register_but_rsp() {
        assert!(!ALL_GPRS.contains(&Reg::RSP));
        let mut seen: Vec<u8> = ALL_GPRS.iter().map(|r| *r as u8).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 15);
    }
}
