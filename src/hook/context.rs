use crate::arch::abi::NATIVE;
use crate::arch::writer::{Reg, Xmm};
use std::mem::{offset_of, size_of};

/// Register snapshot of one intercepted call.
///
/// Context-variant handlers receive the live snapshot and may rewrite any
/// field except `rsp`; the rewritten values are what the original function
/// (or the caller, for `return_address`) sees afterwards.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    /// Stack pointer at trampoline entry, pointing at the return address.
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    /// The caller's return address while the call is intercepted.
    pub return_address: u64,
    _pad: u64,
    /// Integer results of the original, kept across an exit handler.
    pub results: [u64; 2],
    /// Vector results of the original, kept across an exit handler.
    pub vector_results: [u128; 4],
    pub xmm: [u128; 16],
}

pub const CTX_RAX: i32 = offset_of!(HookContext, rax) as i32;
pub const CTX_RBX: i32 = offset_of!(HookContext, rbx) as i32;
pub const CTX_RCX: i32 = offset_of!(HookContext, rcx) as i32;
pub const CTX_RDX: i32 = offset_of!(HookContext, rdx) as i32;
pub const CTX_RSP: i32 = offset_of!(HookContext, rsp) as i32;
pub const CTX_RBP: i32 = offset_of!(HookContext, rbp) as i32;
pub const CTX_RSI: i32 = offset_of!(HookContext, rsi) as i32;
pub const CTX_RDI: i32 = offset_of!(HookContext, rdi) as i32;
pub const CTX_R8: i32 = offset_of!(HookContext, r8) as i32;
pub const CTX_R9: i32 = offset_of!(HookContext, r9) as i32;
pub const CTX_R10: i32 = offset_of!(HookContext, r10) as i32;
pub const CTX_R11: i32 = offset_of!(HookContext, r11) as i32;
pub const CTX_R12: i32 = offset_of!(HookContext, r12) as i32;
pub const CTX_R13: i32 = offset_of!(HookContext, r13) as i32;
pub const CTX_R14: i32 = offset_of!(HookContext, r14) as i32;
pub const CTX_R15: i32 = offset_of!(HookContext, r15) as i32;
pub const CTX_RETURN_ADDRESS: i32 = offset_of!(HookContext, return_address) as i32;
pub const CTX_RESULTS: i32 = offset_of!(HookContext, results) as i32;
pub const CTX_VECTOR_RESULTS: i32 = offset_of!(HookContext, vector_results) as i32;
pub const CTX_XMM: i32 = offset_of!(HookContext, xmm) as i32;

// The generated code relies on this layout.
const _: () = assert!(CTX_RAX == 0x00 && CTX_RSP == 0x20 && CTX_R12 == 0x60 && CTX_R15 == 0x78);
const _: () = assert!(CTX_RETURN_ADDRESS == 0x80);
const _: () = assert!(CTX_VECTOR_RESULTS % 16 == 0 && CTX_XMM % 16 == 0);
const _: () = assert!(size_of::<HookContext>() % 16 == 0);

/// Offset of a general purpose register inside `HookContext`.
pub const fn gpr_offset(reg: Reg) -> i32 {
    match reg {
        Reg::RAX => CTX_RAX,
        Reg::RBX => CTX_RBX,
        Reg::RCX => CTX_RCX,
        Reg::RDX => CTX_RDX,
        Reg::RSP => CTX_RSP,
        Reg::RBP => CTX_RBP,
        Reg::RSI => CTX_RSI,
        Reg::RDI => CTX_RDI,
        Reg::R8 => CTX_R8,
        Reg::R9 => CTX_R9,
        Reg::R10 => CTX_R10,
        Reg::R11 => CTX_R11,
        Reg::R12 => CTX_R12,
        Reg::R13 => CTX_R13,
        Reg::R14 => CTX_R14,
        Reg::R15 => CTX_R15,
    }
}

pub const fn xmm_offset(xmm: Xmm) -> i32 {
    CTX_XMM + 16 * xmm as i32
}

pub const fn result_offset(index: usize) -> i32 {
    CTX_RESULTS + 8 * index as i32
}

pub const fn vector_result_offset(index: usize) -> i32 {
    CTX_VECTOR_RESULTS + 16 * index as i32
}

/// Signature of Context-variant handlers.
pub type ContextHandler = unsafe extern "C" fn(ctx: &mut HookContext);

impl HookContext {
    pub fn gpr(&self, reg: Reg) -> u64 {
        let offset = gpr_offset(reg) as usize / 8;
        self.gprs()[offset]
    }

    pub fn set_gpr(&mut self, reg: Reg, value: u64) {
        let offset = gpr_offset(reg) as usize / 8;
        self.gprs_mut()[offset] = value;
    }

    fn gprs(&self) -> &[u64; 16] {
        // The sixteen registers are the first sixteen u64 fields.
        unsafe { &*(self as *const Self as *const [u64; 16]) }
    }

    fn gprs_mut(&mut self) -> &mut [u64; 16] {
        unsafe { &mut *(self as *mut Self as *mut [u64; 16]) }
    }

    /// Integer argument `index` under the platform calling convention.
    /// Only register-passed arguments are covered.
    pub fn arg(&self, index: usize) -> Option<u64> {
        NATIVE.int_args.get(index).map(|&reg| self.gpr(reg))
    }

    pub fn set_arg(&mut self, index: usize, value: u64) -> bool {
        match NATIVE.int_args.get(index) {
            Some(&reg) => {
                self.set_gpr(reg, value);
                true
            }
            None => false,
        }
    }

    /// Low double of vector argument register `index`. Wide variants only.
    pub fn float_arg(&self, index: usize) -> Option<f64> {
        let xmm = NATIVE.vector_args.get(index)?;
        Some(f64::from_bits(self.xmm[xmm.index()] as u64))
    }

    pub fn set_float_arg(&mut self, index: usize, value: f64) -> bool {
        match NATIVE.vector_args.get(index) {
            Some(xmm) => {
                let lane = &mut self.xmm[xmm.index()];
                *lane = (*lane & !(u64::MAX as u128)) | value.to_bits() as u128;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpr_offsets_follow_field_order() {
        assert_eq!(gpr_offset(Reg::RAX), 0x00);
        assert_eq!(gpr_offset(Reg::RBX), 0x08);
        assert_eq!(gpr_offset(Reg::RCX), 0x10);
        assert_eq!(gpr_offset(Reg::RDX), 0x18);
        assert_eq!(gpr_offset(Reg::RSP), 0x20);
        assert_eq!(gpr_offset(Reg::RDI), 0x38);
        assert_eq!(gpr_offset(Reg::R8), 0x40);
        assert_eq!(gpr_offset(Reg::R15), 0x78);
    }

    #[test]
    fn accessors_hit_the_named_fields() {
        let mut ctx = HookContext::default();
        ctx.set_gpr(Reg::R13, 0xdead);
        assert_eq!(ctx.r13, 0xdead);
        ctx.rbp = 7;
        assert_eq!(ctx.gpr(Reg::RBP), 7);
    }

    #[test]
    fn args_use_the_native_order() {
        let mut ctx = HookContext::default();
        assert!(ctx.set_arg(0, 11));
        assert!(ctx.set_arg(1, 22));
        assert_eq!(ctx.gpr(NATIVE.int_args[0]), 11);
        assert_eq!(ctx.gpr(NATIVE.int_args[1]), 22);
        assert_eq!(ctx.arg(1), Some(22));
        assert_eq!(ctx.arg(NATIVE.int_args.len()), None);
        assert!(!ctx.set_arg(NATIVE.int_args.len(), 1));
    }

    #[test]
    fn float_args_keep_the_upper_lane() {
        let mut ctx = HookContext::default();
        ctx.xmm[NATIVE.vector_args[0].index()] = 0xffff_0000_0000_0000_0000_0000_0000_0000;
        assert!(ctx.set_float_arg(0, 1.5));
        assert_eq!(ctx.float_arg(0), Some(1.5));
        assert_eq!(ctx.xmm[NATIVE.vector_args[0].index()] >> 64, 0xffff_0000_0000_0000);
    }

    #[test]
    fn slot_offsets_are_aligned() {
        assert_eq!(std::mem::align_of::<HookContext>(), 16);
        assert_eq!(xmm_offset(Xmm::XMM1) - xmm_offset(Xmm::XMM0), 16);
        assert_eq!(result_offset(1) - result_offset(0), 8);
        assert_eq!(vector_result_offset(0) % 16, 0);
    }
}
