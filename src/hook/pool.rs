use super::context::HookContext;
use crate::config::validate_capacity;
use crate::error::Result;
use std::cell::UnsafeCell;
use std::hint;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

/// Fixed set of reusable register snapshots for one hook.
///
/// `cells[0]` is a sentinel that never holds a slot: a scan starts there and
/// steps forward before looking, and wraps back to it past the last cell.
/// Every other cell holds either a free slot or null while that slot is
/// borrowed. The generated trampolines run the same protocol on `cells`, so
/// its layout (contiguous pointer-sized cells) is part of the contract.
pub struct ContextPool {
    slots: Box<[UnsafeCell<HookContext>]>,
    cells: Box<[AtomicPtr<HookContext>]>,
}

unsafe impl Send for ContextPool {}
unsafe impl Sync for ContextPool {}

impl ContextPool {
    pub fn new(capacity: usize) -> Result<Self> {
        validate_capacity(capacity)?;

        let slots: Box<[UnsafeCell<HookContext>]> =
            (0..capacity).map(|_| UnsafeCell::new(HookContext::default())).collect();

        let cells: Box<[AtomicPtr<HookContext>]> = std::iter::once(AtomicPtr::new(ptr::null_mut()))
            .chain(slots.iter().map(|slot| AtomicPtr::new(slot.get())))
            .collect();

        Ok(Self { slots, cells })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Address of the sentinel cell.
    pub fn cells_start(&self) -> usize {
        self.cells.as_ptr() as usize
    }

    /// Address one past the last cell.
    pub fn cells_end(&self) -> usize {
        self.cells_start() + self.cells.len() * std::mem::size_of::<AtomicPtr<HookContext>>()
    }

    /// Takes a slot nobody else holds.
    ///
    /// Spins while every slot is out; sizing the pool to the real
    /// concurrency of the target keeps that from happening.
    pub fn borrow(&self) -> NonNull<HookContext> {
        let mut cursor = 0;
        loop {
            cursor += 1;
            if cursor == self.cells.len() {
                cursor = 0;
                hint::spin_loop();
                continue;
            }

            let cell = &self.cells[cursor];
            let current = cell.load(Ordering::Relaxed);
            if current.is_null() {
                continue;
            }
            if cell
                .compare_exchange(current, ptr::null_mut(), Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                // Cells only ever hold addresses from `slots`.
                return unsafe { NonNull::new_unchecked(current) };
            }
        }
    }

    /// Puts a borrowed slot back into the first empty cell.
    ///
    /// # Safety
    /// `slot` must have come from `borrow` on this pool and not been released since.
    pub unsafe fn release(&self, slot: NonNull<HookContext>) {
        debug_assert!(self.owns(slot.as_ptr()));
        let mut cursor = 0;
        loop {
            cursor += 1;
            if cursor == self.cells.len() {
                cursor = 0;
                hint::spin_loop();
                continue;
            }

            if self.cells[cursor]
                .compare_exchange(ptr::null_mut(), slot.as_ptr(), Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Number of slots currently free.
    pub fn available(&self) -> usize {
        self.cells[1..].iter().filter(|cell| !cell.load(Ordering::Acquire).is_null()).count()
    }

    pub fn owns(&self, slot: *const HookContext) -> bool {
        self.slots.iter().any(|candidate| candidate.get() as *const HookContext == slot)
    }
}

impl std::fmt::Debug for ContextPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextPool")
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}
