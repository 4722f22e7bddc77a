use super::memory::ProtectedMemory;
use crate::arch::x86_64::{self, REL_JUMP_LEN};
use crate::error::{HookError, Result};
use crate::utils::{ensure_code, ensure_slot};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Where a hook takes over a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// A pointer-sized cell holding the function's address: a vtable entry,
    /// an import slot, a callback field. Hooking swaps the cell's value.
    Slot(usize),
    /// The function's first instruction. Hooking overwrites the first
    /// `prologue_len` bytes with a jump; those bytes must be whole,
    /// position-independent instructions.
    Code { address: usize, prologue_len: usize },
}

impl Target {
    pub fn slot(cell: usize) -> Self {
        Target::Slot(cell)
    }

    pub fn code(address: usize, prologue_len: usize) -> Self {
        Target::Code { address, prologue_len }
    }

    /// The address identifying this target in an interceptor.
    pub fn address(&self) -> usize {
        match *self {
            Target::Slot(cell) => cell,
            Target::Code { address, .. } => address,
        }
    }

    /// Entry `index` of the virtual function table at `vtable`.
    pub fn vtable_entry(vtable: usize, index: usize) -> Self {
        Target::Slot(vtable + index * std::mem::size_of::<usize>())
    }

    /// Checks that the target is mapped and usable, without changing it.
    pub fn validate(&self) -> Result<()> {
        match *self {
            Target::Slot(0) | Target::Code { address: 0, .. } => Err(HookError::NullPointer),
            Target::Slot(cell) => {
                ensure_slot(cell)?;
                Ok(())
            }
            Target::Code { address, prologue_len } => {
                if prologue_len < REL_JUMP_LEN {
                    return Err(HookError::PrologueTooShort {
                        needed: REL_JUMP_LEN,
                        available: prologue_len,
                    });
                }
                ensure_code(address, prologue_len)?;
                Ok(())
            }
        }
    }

    /// The address a call through this target currently lands on, when it
    /// can be told without disassembling: the slot's value, or where the
    /// code's leading jump goes.
    ///
    /// # Safety
    /// The target must have passed `validate`.
    pub unsafe fn current_entry(&self) -> Option<usize> {
        match *self {
            Target::Slot(cell) => Some(slot_cell(cell).load(Ordering::SeqCst)),
            Target::Code { address, .. } => x86_64::read_jump(address),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Target::Slot(cell) => write!(f, "slot {:#x}", cell),
            Target::Code { address, prologue_len } => write!(f, "code {:#x}+{}", address, prologue_len),
        }
    }
}

unsafe fn slot_cell<'a>(cell: usize) -> &'a AtomicUsize {
    &*(cell as *const AtomicUsize)
}

/// Replaces the value of a function-pointer cell if it still holds `expected`.
///
/// # Safety
/// `cell` must be a valid, aligned pointer-sized cell.
pub unsafe fn swap_slot(cell: usize, expected: usize, replacement: usize) -> Result<()> {
    let writable = crate::utils::query_region(cell)?.map_or(false, |region| region.writable);
    let _guard = if writable {
        None
    } else {
        Some(ProtectedMemory::new(cell as *mut u8, std::mem::size_of::<usize>())?)
    };

    slot_cell(cell)
        .compare_exchange(expected, replacement, Ordering::SeqCst, Ordering::SeqCst)
        .map(|_| ())
        .map_err(|actual| {
            tracing::warn!("slot {:#x} holds {:#x}, expected {:#x}", cell, actual, expected);
            HookError::EntryChanged(cell)
        })
}
