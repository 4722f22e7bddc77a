//! Trampoline generation.
//!
//! Every variant is the same skeleton: borrow a context slot, save registers
//! into it, run the handler and/or the original with the return address
//! swapped for an internal resume label, restore, release the slot, continue.
//! What differs is the order of handler and original, who returns to the
//! caller, and which registers are saved; those come from `Variant` and the
//! calling-convention tables in `arch::abi`.
//!
//! Register use inside a trampoline: `rax`, `r10` and `r11` are scratch for
//! the pool protocol, `r12` holds the borrowed slot between save and
//! release. Context trampolines hand the original every register as the
//! handler left it. The other kinds only keep what the calling convention
//! makes visible: the original sees the caller's arguments, `rax` and the
//! callee-saved registers except `r12`, which still holds the slot when an
//! Exit or Override trampoline runs the original. `r10` and `r11` arrive
//! clobbered. The caller always gets its callee-saved registers back.

use super::context::{
    gpr_offset, result_offset, vector_result_offset, xmm_offset, CTX_R12, CTX_RAX, CTX_RETURN_ADDRESS,
    CTX_RSP,
};
use super::record::HeaderFields;
use crate::arch::abi::{Abi, ALL_GPRS, ALL_XMMS};
use crate::arch::writer::{Cond, Label, Reg, X86_64Writer, Xmm};
use crate::error::Result;

/// When the handler runs and whose return value reaches the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// Handler first, then the original; the original's result is returned.
    Entry,
    /// Original first, then the handler with the same arguments; the
    /// original's result is returned.
    Exit,
    /// Original first, then the handler with the same arguments; the
    /// handler's result is returned.
    Override,
    /// Handler first with `&mut HookContext`, then the original with the
    /// registers as the handler left them.
    Context,
}

/// Which registers a trampoline preserves around the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterSet {
    Integer,
    /// Integer plus vector registers.
    Vector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Variant {
    pub kind: HookKind,
    pub registers: RegisterSet,
}

impl Variant {
    pub const ENTRY: Variant = Variant::new(HookKind::Entry, RegisterSet::Integer);
    pub const EXIT: Variant = Variant::new(HookKind::Exit, RegisterSet::Integer);
    pub const OVERRIDE: Variant = Variant::new(HookKind::Override, RegisterSet::Integer);
    pub const CONTEXT: Variant = Variant::new(HookKind::Context, RegisterSet::Integer);
    pub const ENTRY_WIDE: Variant = Variant::new(HookKind::Entry, RegisterSet::Vector);
    pub const EXIT_WIDE: Variant = Variant::new(HookKind::Exit, RegisterSet::Vector);
    pub const OVERRIDE_WIDE: Variant = Variant::new(HookKind::Override, RegisterSet::Vector);
    pub const CONTEXT_WIDE: Variant = Variant::new(HookKind::Context, RegisterSet::Vector);

    pub const ALL: [Variant; 8] = [
        Variant::ENTRY,
        Variant::EXIT,
        Variant::OVERRIDE,
        Variant::CONTEXT,
        Variant::ENTRY_WIDE,
        Variant::EXIT_WIDE,
        Variant::OVERRIDE_WIDE,
        Variant::CONTEXT_WIDE,
    ];

    pub const fn new(kind: HookKind, registers: RegisterSet) -> Self {
        Self { kind, registers }
    }

    pub fn is_wide(&self) -> bool {
        self.registers == RegisterSet::Vector
    }

    pub fn name(&self) -> &'static str {
        match (self.kind, self.registers) {
            (HookKind::Entry, RegisterSet::Integer) => "entry",
            (HookKind::Exit, RegisterSet::Integer) => "exit",
            (HookKind::Override, RegisterSet::Integer) => "override",
            (HookKind::Context, RegisterSet::Integer) => "context",
            (HookKind::Entry, RegisterSet::Vector) => "entry-wide",
            (HookKind::Exit, RegisterSet::Vector) => "exit-wide",
            (HookKind::Override, RegisterSet::Vector) => "override-wide",
            (HookKind::Context, RegisterSet::Vector) => "context-wide",
        }
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Slot register between borrow and release.
const SLOT: Reg = Reg::R12;

/// Registers the pool protocol clobbers; their caller values live in the slot.
const SCRATCH: [Reg; 4] = [Reg::RAX, Reg::R10, Reg::R11, Reg::R12];

/// Generates the code for `variant`, to be placed at `fields.entry`.
pub fn generate(variant: Variant, abi: &Abi, fields: &HeaderFields) -> Result<Vec<u8>> {
    let mut generator = Generator {
        w: X86_64Writer::new(fields.entry),
        abi,
        fields,
        variant,
    };

    match variant.kind {
        HookKind::Entry => generator.entry()?,
        HookKind::Exit => generator.exit()?,
        HookKind::Override => generator.override_return()?,
        HookKind::Context => generator.context()?,
    }

    generator.w.finish()
}

struct Generator<'a> {
    w: X86_64Writer,
    abi: &'a Abi,
    fields: &'a HeaderFields,
    variant: Variant,
}

impl Generator<'_> {
    fn entry(&mut self) -> Result<()> {
        let resume = self.w.new_label();

        self.borrow_slot()?;
        self.save_args();
        self.swap_return_address(resume);
        self.w.put_mov_reg_mem(Reg::RAX, SLOT, CTX_RAX);
        self.w.put_jmp_rip(self.fields.handler)?;

        self.w.bind(resume);
        self.restore_args();
        self.w.put_push_mem(SLOT, CTX_RETURN_ADDRESS);
        self.w.put_push_mem(SLOT, CTX_RAX);
        self.release_slot()?;
        self.w.put_pop_reg(Reg::RAX);
        self.w.put_jmp_rip(self.fields.original)
    }

    fn exit(&mut self) -> Result<()> {
        let resume = self.w.new_label();

        self.borrow_slot()?;
        self.save_args();
        self.swap_return_address(resume);
        self.w.put_mov_reg_mem(Reg::RAX, SLOT, CTX_RAX);
        self.w.put_jmp_rip(self.fields.original)?;

        self.w.bind(resume);
        self.save_results();
        self.restore_args();
        self.w.put_mov_reg_mem(Reg::RAX, SLOT, CTX_RAX);
        // rsp is 16-byte aligned here and the caller's shadow space is free
        // again, so the handler can be called directly.
        self.w.put_call_rip(self.fields.handler)?;
        self.restore_results();
        self.w.put_push_mem(SLOT, CTX_RETURN_ADDRESS);
        self.w.put_push_mem(SLOT, result_offset(0));
        self.release_slot()?;
        self.w.put_pop_reg(Reg::RAX);
        self.w.put_ret();
        Ok(())
    }

    fn override_return(&mut self) -> Result<()> {
        let resume = self.w.new_label();

        self.borrow_slot()?;
        self.save_args();
        self.swap_return_address(resume);
        self.w.put_mov_reg_mem(Reg::RAX, SLOT, CTX_RAX);
        self.w.put_jmp_rip(self.fields.original)?;

        self.w.bind(resume);
        self.restore_args();
        self.w.put_push_mem(SLOT, CTX_RETURN_ADDRESS);
        self.w.put_push_mem(SLOT, CTX_RAX);
        self.release_slot()?;
        self.w.put_pop_reg(Reg::RAX);
        self.w.put_jmp_rip(self.fields.handler)
    }

    fn context(&mut self) -> Result<()> {
        let resume = self.w.new_label();

        self.borrow_slot()?;
        for reg in context_gprs() {
            self.w.put_mov_mem_reg(SLOT, gpr_offset(reg), reg);
        }
        if self.variant.is_wide() {
            self.save_xmms(&ALL_XMMS);
        }
        self.swap_return_address(resume);
        self.w.put_mov_reg_reg(self.abi.first_arg(), SLOT);
        self.w.put_jmp_rip(self.fields.handler)?;

        self.w.bind(resume);
        for reg in context_gprs() {
            self.w.put_mov_reg_mem(reg, SLOT, gpr_offset(reg));
        }
        if self.variant.is_wide() {
            self.restore_xmms(&ALL_XMMS);
        }
        self.w.put_push_mem(SLOT, CTX_RETURN_ADDRESS);
        self.w.put_push_mem(SLOT, gpr_offset(Reg::RAX));
        self.w.put_push_mem(SLOT, gpr_offset(Reg::R10));
        self.w.put_push_mem(SLOT, gpr_offset(Reg::R11));
        self.release_slot()?;
        self.w.put_pop_reg(Reg::R11);
        self.w.put_pop_reg(Reg::R10);
        self.w.put_pop_reg(Reg::RAX);
        self.w.put_jmp_rip(self.fields.original)
    }

    /// Takes a slot from the pool into `r12`, leaving the caller's `rax`,
    /// `r10`, `r11` and `r12` in it and `rsp` where it was on entry.
    fn borrow_slot(&mut self) -> Result<()> {
        let advance = self.w.new_label();
        let probe = self.w.new_label();

        self.w.put_push_reg(Reg::RAX);
        self.w.put_push_reg(Reg::R10);
        self.w.put_push_reg(Reg::R11);

        self.w.put_mov_reg_rip(Reg::R10, self.fields.pool)?;
        self.w.bind(advance);
        self.w.put_add_reg_imm8(Reg::R10, 8);
        self.w.put_cmp_reg_rip(Reg::R10, self.fields.pool_end)?;
        self.w.put_jcc_label(Cond::Below, probe);
        self.w.put_pause();
        self.w.put_mov_reg_rip(Reg::R10, self.fields.pool)?;
        self.w.put_jmp_label(advance);

        self.w.bind(probe);
        self.w.put_mov_reg_mem(Reg::RAX, Reg::R10, 0);
        self.w.put_test_reg_reg(Reg::RAX, Reg::RAX);
        self.w.put_jcc_label(Cond::Equal, advance);
        self.w.put_zero_reg(Reg::R11);
        self.w.put_lock_cmpxchg_mem_reg(Reg::R10, 0, Reg::R11);
        self.w.put_jcc_label(Cond::NotEqual, advance);

        self.w.put_mov_mem_reg(Reg::RAX, CTX_R12, SLOT);
        self.w.put_mov_reg_reg(SLOT, Reg::RAX);
        self.w.put_pop_mem(SLOT, gpr_offset(Reg::R11));
        self.w.put_pop_mem(SLOT, gpr_offset(Reg::R10));
        self.w.put_pop_mem(SLOT, gpr_offset(Reg::RAX));
        self.w.put_mov_mem_reg(SLOT, CTX_RSP, Reg::RSP);
        Ok(())
    }

    /// Returns the slot in `r12` to the first empty cell and restores the
    /// caller's `r12` from it. Clobbers `rax`, `r10` and `r11`.
    fn release_slot(&mut self) -> Result<()> {
        let advance = self.w.new_label();
        let attempt = self.w.new_label();

        self.w.put_mov_reg_reg(Reg::R11, SLOT);
        self.w.put_mov_reg_mem(SLOT, Reg::R11, CTX_R12);

        self.w.put_mov_reg_rip(Reg::R10, self.fields.pool)?;
        self.w.bind(advance);
        self.w.put_add_reg_imm8(Reg::R10, 8);
        self.w.put_cmp_reg_rip(Reg::R10, self.fields.pool_end)?;
        self.w.put_jcc_label(Cond::Below, attempt);
        self.w.put_pause();
        self.w.put_mov_reg_rip(Reg::R10, self.fields.pool)?;
        self.w.put_jmp_label(advance);

        self.w.bind(attempt);
        self.w.put_zero_reg(Reg::RAX);
        self.w.put_lock_cmpxchg_mem_reg(Reg::R10, 0, Reg::R11);
        self.w.put_jcc_label(Cond::NotEqual, advance);
        Ok(())
    }

    /// Replaces the return address on top of the stack with `resume` and
    /// keeps the real one in the slot. Clobbers `rax`.
    fn swap_return_address(&mut self, resume: Label) {
        self.w.put_lea_reg_label(Reg::RAX, resume);
        self.w.put_xchg_mem_reg(Reg::RSP, 0, Reg::RAX);
        self.w.put_mov_mem_reg(SLOT, CTX_RETURN_ADDRESS, Reg::RAX);
    }

    fn save_args(&mut self) {
        for &reg in self.abi.int_args {
            self.w.put_mov_mem_reg(SLOT, gpr_offset(reg), reg);
        }
        if self.variant.is_wide() {
            self.save_xmms(self.abi.vector_args);
        }
    }

    fn restore_args(&mut self) {
        for &reg in self.abi.int_args {
            self.w.put_mov_reg_mem(reg, SLOT, gpr_offset(reg));
        }
        if self.variant.is_wide() {
            self.restore_xmms(self.abi.vector_args);
        }
    }

    fn save_results(&mut self) {
        for (i, &reg) in self.abi.int_results.iter().enumerate() {
            self.w.put_mov_mem_reg(SLOT, result_offset(i), reg);
        }
        if self.variant.is_wide() {
            for (i, &xmm) in self.abi.vector_results.iter().enumerate() {
                self.w.put_movups_mem_xmm(SLOT, vector_result_offset(i), xmm);
            }
        }
    }

    fn restore_results(&mut self) {
        for (i, &reg) in self.abi.int_results.iter().enumerate() {
            self.w.put_mov_reg_mem(reg, SLOT, result_offset(i));
        }
        if self.variant.is_wide() {
            for (i, &xmm) in self.abi.vector_results.iter().enumerate() {
                self.w.put_movups_xmm_mem(xmm, SLOT, vector_result_offset(i));
            }
        }
    }

    fn save_xmms(&mut self, xmms: &[Xmm]) {
        for &xmm in xmms {
            self.w.put_movups_mem_xmm(SLOT, xmm_offset(xmm), xmm);
        }
    }

    fn restore_xmms(&mut self, xmms: &[Xmm]) {
        for &xmm in xmms {
            self.w.put_movups_xmm_mem(xmm, SLOT, xmm_offset(xmm));
        }
    }
}

/// Registers a Context trampoline moves explicitly; the scratch set is
/// handled by borrow/release.
fn context_gprs() -> impl Iterator<Item = Reg> {
    ALL_GPRS.into_iter().filter(|reg| !SCRATCH.contains(reg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::abi::{NATIVE, SYSV, WIN64};

    fn fields() -> HeaderFields {
        HeaderFields::at(0x10_0000)
    }

    #[test]
    fn every_variant_generates_for_both_abis() {
        for abi in [SYSV, WIN64] {
            for variant in Variant::ALL {
                let code = generate(variant, &abi, &fields()).unwrap();
                assert!(!code.is_empty(), "{} / {}", variant, abi.name);
                assert!(code.len() < 1024, "{} / {} is {} bytes", variant, abi.name, code.len());
            }
        }
    }

    #[test]
    fn trampolines_start_by_stashing_scratch_registers() {
        let code = generate(Variant::ENTRY, &NATIVE, &fields()).unwrap();
        // push rax; push r10; push r11; mov r10, [rip + pool]
        assert_eq!(&code[..8], &[0x50, 0x41, 0x52, 0x41, 0x53, 0x4C, 0x8B, 0x15]);
    }

    #[test]
    fn pool_protocol_uses_locked_cmpxchg() {
        let code = generate(Variant::EXIT, &NATIVE, &fields()).unwrap();
        let locked = code.windows(4).filter(|w| *w == [0xF0, 0x4D, 0x0F, 0xB1]).count();
        assert_eq!(locked, 2, "one borrow and one release");
    }

    #[test]
    fn wide_variants_are_larger() {
        for (narrow, wide) in [
            (Variant::ENTRY, Variant::ENTRY_WIDE),
            (Variant::EXIT, Variant::EXIT_WIDE),
            (Variant::OVERRIDE, Variant::OVERRIDE_WIDE),
            (Variant::CONTEXT, Variant::CONTEXT_WIDE),
        ] {
            let a = generate(narrow, &NATIVE, &fields()).unwrap();
            let b = generate(wide, &NATIVE, &fields()).unwrap();
            assert!(b.len() > a.len(), "{} vs {}", narrow, wide);
        }
    }

    #[test]
    fn exit_returns_itself_and_others_jump_on() {
        let exit = generate(Variant::EXIT, &NATIVE, &fields()).unwrap();
        assert_eq!(exit.last(), Some(&0xC3));

        for variant in [Variant::ENTRY, Variant::OVERRIDE, Variant::CONTEXT] {
            let code = generate(variant, &NATIVE, &fields()).unwrap();
            let tail = &code[code.len() - 6..code.len() - 4];
            assert_eq!(tail, &[0xFF, 0x25], "{} ends in jmp [rip+x]", variant);
        }
    }

    #[test]
    fn variant_names_are_unique() {
        let mut names: Vec<_> = Variant::ALL.iter().map(|v| v.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 8);
    }
}
