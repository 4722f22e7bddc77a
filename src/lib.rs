//! Inline function interception for x86-64.
//!
//! A hook sends calls of a target function through a generated trampoline
//! that runs a handler before, after or around the original. Each hook owns
//! a fixed pool of register snapshots, so any number of threads up to the
//! pool's capacity can be inside it at once, and hooks on one target stack
//! into a chain that can be taken apart in any order.

#[cfg(not(target_arch = "x86_64"))]
compile_error!("unihook generates x86-64 code and only builds for x86_64 targets");

pub mod arch;
pub mod config;
pub mod debug;
pub mod error;
pub mod hook;
pub mod utils;

pub use config::{HookOptions, InterceptorConfig};
pub use error::{HookError, Result};
pub use hook::chain::{HookHandle, Interceptor};
pub use hook::context::{ContextHandler, HookContext};
pub use hook::pool::ContextPool;
pub use hook::record::{HookHeader, CODE_OFFSET, HOOK_MAGIC};
pub use hook::target::Target;
pub use hook::trampoline::{HookKind, RegisterSet, Variant};

pub fn set_debug(enabled: bool) {
    if enabled {
        debug::enable_debug();
    } else {
        debug::disable_debug();
    }
}

pub fn is_debug() -> bool {
    debug::is_debug_enabled()
}

/// Hooks the function-pointer cell at `slot` with a fresh `Interceptor`
/// and returns both. Dropping the interceptor removes the hook.
///
/// # Safety
/// See `Interceptor::install`.
pub unsafe fn hook_slot<T>(slot: *mut T, handler: usize, variant: Variant) -> Result<(Interceptor, HookHandle)> {
    if slot.is_null() {
        return Err(HookError::NullPointer);
    }
    let interceptor = Interceptor::new();
    let handle = interceptor.install(Target::slot(slot as usize), handler, variant)?;
    Ok((interceptor, handle))
}

/// Code patching and the registries under test share process-wide state
/// (the same functions, the debug flag), so such tests run one at a time.
#[cfg(test)]
pub(crate) fn lock_hook_tests() -> parking_lot::MutexGuard<'static, ()> {
    static LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());
    LOCK.lock()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn triple(x: u64) -> u64 {
        x * 3
    }

    extern "C" fn count(_x: u64) -> u64 {
        CALLS.fetch_add(1, Ordering::SeqCst);
        0
    }

    #[test]
    fn hook_slot_lives_as_long_as_its_interceptor() {
        let _lock = lock_hook_tests();
        let mut slot: extern "C" fn(u64) -> u64 = triple;
        let cell = &mut slot as *mut extern "C" fn(u64) -> u64;

        let (interceptor, handle) = unsafe { hook_slot(cell, count as usize, Variant::ENTRY) }.unwrap();
        let hooked = unsafe { std::ptr::read_volatile(cell) };
        assert_eq!(hooked as usize, handle.entry());
        assert_eq!(hooked(5), 15);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);

        drop(interceptor);
        assert_eq!(unsafe { std::ptr::read_volatile(cell) } as usize, triple as usize);
    }

    #[test]
    fn hook_slot_rejects_null() {
        let err = unsafe { hook_slot(std::ptr::null_mut::<usize>(), count as usize, Variant::ENTRY) }.unwrap_err();
        assert!(matches!(err, HookError::NullPointer));
    }
}
