//! Jumps at code targets and the relocated prologue ("detour thunk") that
//! lets a hooked function still be called.

use crate::debug;
use crate::error::{HookError, Result};
use crate::hook::memory::{ExecBlock, ProtectedMemory};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

/// `jmp rel32`
pub const REL_JUMP_LEN: usize = 5;
/// `jmp [rip+0]` followed by the absolute destination.
pub const ABS_JUMP_LEN: usize = 14;

fn is_32bit_offset(target: usize, source: usize) -> bool {
    let offset = target as isize - source as isize;
    offset as i32 as isize == offset
}

/// Bytes `encode_jump(source, target)` produces.
pub fn size_of_jump(target: usize, source: usize) -> usize {
    if is_32bit_offset(target, source + REL_JUMP_LEN) {
        REL_JUMP_LEN
    } else {
        ABS_JUMP_LEN
    }
}

fn write_skip(code: &mut Vec<u8>, source: usize, target: usize) {
    let rel = target as isize - (source + REL_JUMP_LEN) as isize;
    code.push(0xe9);
    code.extend_from_slice(&(rel as i32).to_le_bytes());
}

fn write_absolute(code: &mut Vec<u8>, target: usize) {
    code.extend_from_slice(&[0xff, 0x25, 0x00, 0x00, 0x00, 0x00]);
    code.extend_from_slice(&(target as u64).to_le_bytes());
}

/// Shortest jump from `source` to `target`. Neither form clobbers a register.
pub fn encode_jump(source: usize, target: usize) -> Vec<u8> {
    let mut code = Vec::with_capacity(ABS_JUMP_LEN);
    if size_of_jump(target, source) == REL_JUMP_LEN {
        write_skip(&mut code, source, target);
    } else {
        write_absolute(&mut code, target);
    }
    code
}

/// Destination of the unconditional jump at `source`, if it starts with one.
///
/// # Safety
/// `source` must point at readable code; for `jmp [rip+disp]` the pointer
/// cell must be readable too.
pub unsafe fn read_jump(source: usize) -> Option<usize> {
    let code = source as *const u8;
    match *code {
        0xe9 => {
            let rel = ptr::read_unaligned(code.add(1) as *const i32);
            Some((source as isize + REL_JUMP_LEN as isize + rel as isize) as usize)
        }
        0xeb => {
            let rel = *code.add(1) as i8;
            Some((source as isize + 2 + rel as isize) as usize)
        }
        0xff if *code.add(1) == 0x25 => {
            let disp = ptr::read_unaligned(code.add(2) as *const i32);
            let cell = (source as isize + 6 + disp as isize) as *const usize;
            Some(ptr::read_unaligned(cell))
        }
        _ => None,
    }
}

/// Writes `bytes` over live code at `address`.
///
/// A patch that fits in one aligned 8-byte word is stored in a single
/// atomic write, so other threads see either the old or the new bytes.
///
/// # Safety
/// No thread may be executing inside the patched range unless the write
/// is a single atomic store.
pub unsafe fn patch_code(address: usize, bytes: &[u8]) -> Result<()> {
    if address == 0 {
        return Err(HookError::NullPointer);
    }
    let _code = ProtectedMemory::new(address as *mut u8, bytes.len())?;

    let word = address & !7;
    let shift = address - word;
    if shift + bytes.len() <= 8 {
        let cell = &*(word as *const AtomicU64);
        let mut value = cell.load(Ordering::Acquire).to_le_bytes();
        value[shift..shift + bytes.len()].copy_from_slice(bytes);
        cell.store(u64::from_le_bytes(value), Ordering::Release);
    } else {
        ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
    }

    debug::log_code("patch", bytes, address);
    Ok(())
}

/// Saved entry bytes of a code target and the way back into its body.
#[derive(Debug)]
pub struct Detour {
    address: usize,
    stolen: Vec<u8>,
    /// Relocated prologue followed by a jump to the rest of the function.
    /// Absent when the entry already was a jump.
    thunk: Option<ExecBlock>,
    original: usize,
}

impl Detour {
    /// Saves `prologue_len` bytes at `address` and builds what calling the
    /// original must run instead of them. The prologue must be position
    /// independent and end on an instruction boundary.
    ///
    /// # Safety
    /// `address..address + prologue_len` must be mapped code.
    pub unsafe fn new(address: usize, prologue_len: usize) -> Result<Self> {
        if address == 0 {
            return Err(HookError::NullPointer);
        }
        if prologue_len < REL_JUMP_LEN {
            return Err(HookError::PrologueTooShort {
                needed: REL_JUMP_LEN,
                available: prologue_len,
            });
        }

        let mut stolen = vec![0u8; prologue_len];
        ptr::copy_nonoverlapping(address as *const u8, stolen.as_mut_ptr(), prologue_len);

        if let Some(destination) = read_jump(address) {
            tracing::debug!("entry {:#x} already jumps to {:#x}", address, destination);
            return Ok(Self {
                address,
                stolen,
                thunk: None,
                original: destination,
            });
        }

        let mut code = stolen.clone();
        write_absolute(&mut code, address + prologue_len);

        let thunk = ExecBlock::allocate(code.len())?;
        thunk.write(0, &code)?;
        thunk.seal()?;
        debug::log_code("thunk", &code, thunk.address());

        let original = thunk.address();
        Ok(Self {
            address,
            stolen,
            thunk: Some(thunk),
            original,
        })
    }

    pub fn address(&self) -> usize {
        self.address
    }

    /// Where a call to the unhooked function should go.
    pub fn original(&self) -> usize {
        self.original
    }

    pub fn stolen(&self) -> &[u8] {
        &self.stolen
    }

    pub fn has_thunk(&self) -> bool {
        self.thunk.is_some()
    }

    /// Makes the entry jump to `target`. Fails without touching the entry
    /// when the jump does not fit in the saved prologue.
    ///
    /// # Safety
    /// See `patch_code`.
    pub unsafe fn redirect(&self, target: usize) -> Result<()> {
        let jump = encode_jump(self.address, target);
        if jump.len() > self.stolen.len() {
            return Err(HookError::PrologueTooShort {
                needed: jump.len(),
                available: self.stolen.len(),
            });
        }
        patch_code(self.address, &jump)
    }

    /// Whether a jump from the entry to `target` fits in the prologue.
    pub fn reaches(&self, target: usize) -> bool {
        size_of_jump(target, self.address) <= self.stolen.len()
    }

    /// Puts the saved bytes back.
    ///
    /// # Safety
    /// See `patch_code`.
    pub unsafe fn restore(&self) -> Result<()> {
        patch_code(self.address, &self.stolen)
    }
}
