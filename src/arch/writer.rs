//! A small x86-64 emitter covering what the trampolines need.
//!
//! Memory operands are always encoded as `[base + disp32]` so that every
//! instruction has a fixed length regardless of the displacement. RIP-relative
//! operands are resolved against the writer's base address, which must be the
//! address the code will run from.

use crate::error::{HookError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    RAX = 0,
    RCX = 1,
    RDX = 2,
    RBX = 3,
    RSP = 4,
    RBP = 5,
    RSI = 6,
    RDI = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Xmm {
    XMM0 = 0,
    XMM1 = 1,
    XMM2 = 2,
    XMM3 = 3,
    XMM4 = 4,
    XMM5 = 5,
    XMM6 = 6,
    XMM7 = 7,
    XMM8 = 8,
    XMM9 = 9,
    XMM10 = 10,
    XMM11 = 11,
    XMM12 = 12,
    XMM13 = 13,
    XMM14 = 14,
    XMM15 = 15,
}

/// Registers share the split 3+1 bit encoding.
trait Encoded: Copy {
    fn code(self) -> u8;

    #[inline]
    fn lo3(self) -> u8 {
        self.code() & 7
    }

    #[inline]
    fn is_extended(self) -> bool {
        self.code() >= 8
    }
}

impl Encoded for Reg {
    fn code(self) -> u8 {
        self as u8
    }
}

impl Encoded for Xmm {
    fn code(self) -> u8 {
        self as u8
    }
}

impl Xmm {
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Condition codes for `jcc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    Below = 0x2,
    Equal = 0x4,
    NotEqual = 0x5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug)]
struct Fixup {
    /// Offset of the rel32 field; the displacement is relative to its end.
    at: usize,
    label: Label,
}

#[derive(Debug)]
pub struct X86_64Writer {
    code: Vec<u8>,
    base: u64,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
}

impl X86_64Writer {
    pub fn new(base: u64) -> Self {
        Self {
            code: Vec::with_capacity(512),
            base,
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    pub fn pc(&self) -> u64 {
        self.base + self.code.len() as u64
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) {
        debug_assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(self.code.len());
    }

    /// Resolves label references and returns the finished code.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        for fixup in &self.fixups {
            let target = self.labels[fixup.label.0]
                .ok_or_else(|| HookError::InvalidConfig(format!("unbound label {}", fixup.label.0)))?;
            let disp = target as i64 - (fixup.at as i64 + 4);
            self.code[fixup.at..fixup.at + 4].copy_from_slice(&(disp as i32).to_le_bytes());
        }
        Ok(self.code)
    }

    #[inline]
    fn emit(&mut self, byte: u8) {
        self.code.push(byte);
    }

    #[inline]
    fn emit_u32_le(&mut self, val: u32) {
        self.code.extend_from_slice(&val.to_le_bytes());
    }

    /// REX prefix: 0100 W R X B
    #[inline]
    fn rex(w: bool, r: bool, x: bool, b: bool) -> u8 {
        0x40 | ((w as u8) << 3) | ((r as u8) << 2) | ((x as u8) << 1) | (b as u8)
    }

    /// REX prefix only when some bit is set.
    #[inline]
    fn emit_rex_opt(&mut self, w: bool, r: bool, b: bool) {
        if w || r || b {
            self.emit(Self::rex(w, r, false, b));
        }
    }

    /// ModRM byte: mod(2) | reg(3) | rm(3)
    #[inline]
    fn modrm(mod_: u8, reg: u8, rm: u8) -> u8 {
        ((mod_ & 3) << 6) | ((reg & 7) << 3) | (rm & 7)
    }

    /// `[base + disp32]`, with the SIB byte RSP/R12 need.
    fn emit_mem(&mut self, reg_field: u8, base: Reg, disp: i32) {
        if base.lo3() == 4 {
            self.emit(Self::modrm(0b10, reg_field, 0b100));
            self.emit(0x24);
        } else {
            self.emit(Self::modrm(0b10, reg_field, base.lo3()));
        }
        self.emit_u32_le(disp as u32);
    }

    /// `[rip + disp32]` aimed at an absolute address. The disp32 must be the
    /// last field of the instruction.
    fn emit_rip(&mut self, reg_field: u8, target: u64) -> Result<()> {
        self.emit(Self::modrm(0b00, reg_field, 0b101));
        let next = self.pc() + 4;
        let disp = target as i64 - next as i64;
        if disp < i32::MIN as i64 || disp > i32::MAX as i64 {
            return Err(HookError::DisplacementOutOfRange(target as usize));
        }
        self.emit_u32_le(disp as i32 as u32);
        Ok(())
    }

    /// `[rip + disp32]` aimed at a label.
    fn emit_rip_label(&mut self, reg_field: u8, label: Label) {
        self.emit(Self::modrm(0b00, reg_field, 0b101));
        self.emit_rel32_label(label);
    }

    fn emit_rel32_label(&mut self, label: Label) {
        self.fixups.push(Fixup { at: self.code.len(), label });
        self.emit_u32_le(0);
    }

    // ── Stack ────────────────────────────────────────────────────────

    /// `push reg`: [REX.B] 50+rd
    pub fn put_push_reg(&mut self, reg: Reg) {
        self.emit_rex_opt(false, false, reg.is_extended());
        self.emit(0x50 + reg.lo3());
    }

    /// `pop reg`: [REX.B] 58+rd
    pub fn put_pop_reg(&mut self, reg: Reg) {
        self.emit_rex_opt(false, false, reg.is_extended());
        self.emit(0x58 + reg.lo3());
    }

    /// `push qword [base + disp]`: [REX.B] FF /6
    pub fn put_push_mem(&mut self, base: Reg, disp: i32) {
        self.emit_rex_opt(false, false, base.is_extended());
        self.emit(0xFF);
        self.emit_mem(6, base, disp);
    }

    /// `pop qword [base + disp]`: [REX.B] 8F /0
    pub fn put_pop_mem(&mut self, base: Reg, disp: i32) {
        self.emit_rex_opt(false, false, base.is_extended());
        self.emit(0x8F);
        self.emit_mem(0, base, disp);
    }

    // ── MOV / LEA ────────────────────────────────────────────────────

    /// `mov dst, src`: REX.W 89 /r
    pub fn put_mov_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.emit(Self::rex(true, src.is_extended(), false, dst.is_extended()));
        self.emit(0x89);
        self.emit(Self::modrm(0b11, src.lo3(), dst.lo3()));
    }

    /// `mov dst, [base + disp]`: REX.W 8B /r
    pub fn put_mov_reg_mem(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.emit(Self::rex(true, dst.is_extended(), false, base.is_extended()));
        self.emit(0x8B);
        self.emit_mem(dst.lo3(), base, disp);
    }

    /// `mov [base + disp], src`: REX.W 89 /r
    pub fn put_mov_mem_reg(&mut self, base: Reg, disp: i32, src: Reg) {
        self.emit(Self::rex(true, src.is_extended(), false, base.is_extended()));
        self.emit(0x89);
        self.emit_mem(src.lo3(), base, disp);
    }

    /// `mov dst, [rip + target]`
    pub fn put_mov_reg_rip(&mut self, dst: Reg, target: u64) -> Result<()> {
        self.emit(Self::rex(true, dst.is_extended(), false, false));
        self.emit(0x8B);
        self.emit_rip(dst.lo3(), target)
    }

    /// `lea dst, [rip + label]`
    pub fn put_lea_reg_label(&mut self, dst: Reg, label: Label) {
        self.emit(Self::rex(true, dst.is_extended(), false, false));
        self.emit(0x8D);
        self.emit_rip_label(dst.lo3(), label);
    }

    /// `xchg [base + disp], reg`: REX.W 87 /r
    pub fn put_xchg_mem_reg(&mut self, base: Reg, disp: i32, reg: Reg) {
        self.emit(Self::rex(true, reg.is_extended(), false, base.is_extended()));
        self.emit(0x87);
        self.emit_mem(reg.lo3(), base, disp);
    }

    // ── Arithmetic / atomics ─────────────────────────────────────────

    /// `add reg, imm8`: REX.W 83 /0 ib
    pub fn put_add_reg_imm8(&mut self, reg: Reg, imm: i8) {
        self.emit(Self::rex(true, false, false, reg.is_extended()));
        self.emit(0x83);
        self.emit(Self::modrm(0b11, 0, reg.lo3()));
        self.emit(imm as u8);
    }

    /// `xor reg32, reg32`, which also clears the upper half.
    pub fn put_zero_reg(&mut self, reg: Reg) {
        self.emit_rex_opt(false, reg.is_extended(), reg.is_extended());
        self.emit(0x31);
        self.emit(Self::modrm(0b11, reg.lo3(), reg.lo3()));
    }

    /// `test a, b`: REX.W 85 /r
    pub fn put_test_reg_reg(&mut self, a: Reg, b: Reg) {
        self.emit(Self::rex(true, b.is_extended(), false, a.is_extended()));
        self.emit(0x85);
        self.emit(Self::modrm(0b11, b.lo3(), a.lo3()));
    }

    /// `cmp reg, [rip + target]`: REX.W 3B /r
    pub fn put_cmp_reg_rip(&mut self, reg: Reg, target: u64) -> Result<()> {
        self.emit(Self::rex(true, reg.is_extended(), false, false));
        self.emit(0x3B);
        self.emit_rip(reg.lo3(), target)
    }

    /// `lock cmpxchg [base + disp], src`: F0 REX.W 0F B1 /r
    pub fn put_lock_cmpxchg_mem_reg(&mut self, base: Reg, disp: i32, src: Reg) {
        self.emit(0xF0);
        self.emit(Self::rex(true, src.is_extended(), false, base.is_extended()));
        self.emit(0x0F);
        self.emit(0xB1);
        self.emit_mem(src.lo3(), base, disp);
    }

    pub fn put_pause(&mut self) {
        self.emit(0xF3);
        self.emit(0x90);
    }

    // ── SSE ──────────────────────────────────────────────────────────

    /// `movups [base + disp], xmm`: [REX] 0F 11 /r
    pub fn put_movups_mem_xmm(&mut self, base: Reg, disp: i32, xmm: Xmm) {
        self.emit_rex_opt(false, xmm.is_extended(), base.is_extended());
        self.emit(0x0F);
        self.emit(0x11);
        self.emit_mem(xmm.lo3(), base, disp);
    }

    /// `movups xmm, [base + disp]`: [REX] 0F 10 /r
    pub fn put_movups_xmm_mem(&mut self, xmm: Xmm, base: Reg, disp: i32) {
        self.emit_rex_opt(false, xmm.is_extended(), base.is_extended());
        self.emit(0x0F);
        self.emit(0x10);
        self.emit_mem(xmm.lo3(), base, disp);
    }

    // ── Control flow ─────────────────────────────────────────────────

    /// `jmp qword [rip + target]`: FF /4
    pub fn put_jmp_rip(&mut self, target: u64) -> Result<()> {
        self.emit(0xFF);
        self.emit_rip(4, target)
    }

    /// `call qword [rip + target]`: FF /2
    pub fn put_call_rip(&mut self, target: u64) -> Result<()> {
        self.emit(0xFF);
        self.emit_rip(2, target)
    }

    /// `jmp label`: E9 cd
    pub fn put_jmp_label(&mut self, label: Label) {
        self.emit(0xE9);
        self.emit_rel32_label(label);
    }

    /// `jcc label`: 0F 80+cc cd
    pub fn put_jcc_label(&mut self, cond: Cond, label: Label) {
        self.emit(0x0F);
        self.emit(0x80 | cond as u8);
        self.emit_rel32_label(label);
    }

    pub fn put_ret(&mut self) {
        self.emit(0xC3);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(f: impl FnOnce(&mut X86_64Writer)) -> Vec<u8> {
        let mut w = X86_64Writer::new(0x1000);
        f(&mut w);
        w.finish().unwrap()
    }

    #[test]
    fn push_pop_registers() {
        assert_eq!(encode(|w| w.put_push_reg(Reg::RAX)), [0x50]);
        assert_eq!(encode(|w| w.put_push_reg(Reg::R10)), [0x41, 0x52]);
        assert_eq!(encode(|w| w.put_pop_reg(Reg::R11)), [0x41, 0x5B]);
        assert_eq!(encode(|w| w.put_pop_reg(Reg::RAX)), [0x58]);
    }

    #[test]
    fn push_pop_memory_through_r12() {
        assert_eq!(
            encode(|w| w.put_push_mem(Reg::R12, 8)),
            [0x41, 0xFF, 0xB4, 0x24, 0x08, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            encode(|w| w.put_pop_mem(Reg::R12, 0x50)),
            [0x41, 0x8F, 0x84, 0x24, 0x50, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn moves() {
        assert_eq!(
            encode(|w| w.put_mov_mem_reg(Reg::R12, 0x60, Reg::R12)),
            [0x4D, 0x89, 0xA4, 0x24, 0x60, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            encode(|w| w.put_mov_reg_mem(Reg::RCX, Reg::RAX, 0x10)),
            [0x48, 0x8B, 0x88, 0x10, 0x00, 0x00, 0x00]
        );
        assert_eq!(encode(|w| w.put_mov_reg_reg(Reg::R12, Reg::RAX)), [0x49, 0x89, 0xC4]);
        assert_eq!(encode(|w| w.put_mov_reg_reg(Reg::R11, Reg::R12)), [0x4D, 0x89, 0xE3]);
    }

    #[test]
    fn rip_relative_load() {
        let bytes = encode(|w| w.put_mov_reg_rip(Reg::R10, 0x1007).unwrap());
        assert_eq!(bytes, [0x4C, 0x8B, 0x15, 0x00, 0x00, 0x00, 0x00]);

        let bytes = encode(|w| w.put_jmp_rip(0x1000).unwrap());
        assert_eq!(bytes, [0xFF, 0x25, 0xFA, 0xFF, 0xFF, 0xFF]);

        let bytes = encode(|w| w.put_call_rip(0x1010).unwrap());
        assert_eq!(bytes, [0xFF, 0x15, 0x0A, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn rip_relative_out_of_range() {
        let mut w = X86_64Writer::new(0x1000);
        let err = w.put_jmp_rip(0x7fff_0000_0000).unwrap_err();
        assert!(matches!(err, HookError::DisplacementOutOfRange(_)));
    }

    #[test]
    fn atomics_and_arithmetic() {
        assert_eq!(
            encode(|w| w.put_lock_cmpxchg_mem_reg(Reg::R10, 0, Reg::R11)),
            [0xF0, 0x4D, 0x0F, 0xB1, 0x9A, 0x00, 0x00, 0x00, 0x00]
        );
        assert_eq!(encode(|w| w.put_add_reg_imm8(Reg::R10, 8)), [0x49, 0x83, 0xC2, 0x08]);
        assert_eq!(encode(|w| w.put_zero_reg(Reg::RAX)), [0x31, 0xC0]);
        assert_eq!(encode(|w| w.put_zero_reg(Reg::R11)), [0x45, 0x31, 0xDB]);
        assert_eq!(encode(|w| w.put_test_reg_reg(Reg::RAX, Reg::RAX)), [0x48, 0x85, 0xC0]);
        assert_eq!(
            encode(|w| w.put_xchg_mem_reg(Reg::RSP, 0, Reg::RAX)),
            [0x48, 0x87, 0x84, 0x24, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn sse_moves() {
        assert_eq!(
            encode(|w| w.put_movups_mem_xmm(Reg::R12, 0x90, Xmm::XMM9)),
            [0x45, 0x0F, 0x11, 0x8C, 0x24, 0x90, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            encode(|w| w.put_movups_xmm_mem(Xmm::XMM0, Reg::RAX, 0x20)),
            [0x0F, 0x10, 0x80, 0x20, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn labels_resolve_both_directions() {
        let bytes = encode(|w| {
            let back = w.new_label();
            w.bind(back);
            w.put_jmp_label(back);
        });
        assert_eq!(bytes, [0xE9, 0xFB, 0xFF, 0xFF, 0xFF]);

        let bytes = encode(|w| {
            let ahead = w.new_label();
            w.put_jcc_label(Cond::NotEqual, ahead);
            w.put_ret();
            w.bind(ahead);
        });
        assert_eq!(bytes, [0x0F, 0x85, 0x01, 0x00, 0x00, 0x00, 0xC3]);
    }

    #[test]
    fn lea_of_label_is_rip_relative() {
        let bytes = encode(|w| {
            let target = w.new_label();
            w.put_lea_reg_label(Reg::RAX, target);
            w.bind(target);
        });
        assert_eq!(bytes, [0x48, 0x8D, 0x05, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn unbound_labels_are_an_error() {
        let mut w = X86_64Writer::new(0);
        let label = w.new_label();
        w.put_jmp_label(label);
        assert!(w.finish().is_err());
    }
}
