use crate::error::{HookError, Result};
use std::ptr::{self, NonNull};

#[cfg(unix)]
use libc::{c_void, mmap, mprotect, munmap, sysconf, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_EXEC, PROT_READ, PROT_WRITE, _SC_PAGESIZE};

#[cfg(windows)]
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
    PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS, PAGE_READWRITE,
};

/// Candidate addresses tried on each side of a code target.
const NEAR_PROBES: usize = 256;

/// Stride between near-allocation candidates; matches the Windows
/// allocation granularity so every hint is a legal base there too.
const NEAR_STRIDE: usize = 0x10000;

#[cfg(unix)]
pub fn page_size() -> usize {
    unsafe { sysconf(_SC_PAGESIZE) as usize }
}

#[cfg(windows)]
pub fn page_size() -> usize {
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
    let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
    unsafe { GetSystemInfo(&mut info) };
    info.dwPageSize as usize
}

fn page_span(address: usize, size: usize) -> (usize, usize) {
    let page = page_size();
    let base = address & !(page - 1);
    let end = (address + size + page - 1) & !(page - 1);
    (base, end - base)
}

/// Makes the pages covering a range writable for the guard's lifetime.
pub struct ProtectedMemory {
    address: *mut u8,
    width: usize,
    #[cfg(unix)]
    restore: i32,
    #[cfg(windows)]
    restore: PAGE_PROTECTION_FLAGS,
}

impl ProtectedMemory {
    pub unsafe fn new(data: *mut u8, size: usize) -> Result<Self> {
        if data.is_null() || size == 0 {
            return Err(HookError::NullPointer);
        }

        let (base, width) = page_span(data as usize, size);
        let address = base as *mut u8;

        #[cfg(unix)]
        {
            let restore = restore_protection(data as usize)?;

            let result = mprotect(address as *mut c_void, width, PROT_READ | PROT_WRITE | PROT_EXEC);
            if result == -1 {
                let err = std::io::Error::last_os_error();
                return Err(HookError::MemoryProtection(format!("{}", err)));
            }

            Ok(Self { address, width, restore })
        }

        #[cfg(windows)]
        {
            let mut restore: PAGE_PROTECTION_FLAGS = 0;
            let ok = VirtualProtect(address as *const _, width, PAGE_EXECUTE_READWRITE, &mut restore);
            if ok == 0 {
                let err = std::io::Error::last_os_error();
                return Err(HookError::MemoryProtection(format!("{}", err)));
            }

            Ok(Self { address, width, restore })
        }
    }
}

/// Protection the pages go back to once the guard is dropped.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn restore_protection(address: usize) -> Result<i32> {
    let region = crate::utils::query_region(address)?.ok_or(HookError::InvalidTarget(address))?;
    let mut prot = 0;
    if region.readable {
        prot |= PROT_READ;
    }
    if region.writable {
        prot |= PROT_WRITE;
    }
    if region.executable {
        prot |= PROT_EXEC;
    }
    Ok(prot)
}

/// Without a region query the old protection is unknown; patched pages
/// are code, so they go back to read and execute.
#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
fn restore_protection(_address: usize) -> Result<i32> {
    Ok(PROT_READ | PROT_EXEC)
}

impl Drop for ProtectedMemory {
    fn drop(&mut self) {
        unsafe {
            #[cfg(unix)]
            {
                mprotect(self.address as *mut c_void, self.width, self.restore);
            }

            #[cfg(windows)]
            {
                let mut previous: PAGE_PROTECTION_FLAGS = 0;
                VirtualProtect(self.address as *const _, self.width, self.restore, &mut previous);
            }

            flush_instruction_cache(self.address, self.width);
        }
    }
}

pub unsafe fn flush_instruction_cache(_address: *const u8, _size: usize) {
    #[cfg(windows)]
    {
        use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
        use windows_sys::Win32::System::Threading::GetCurrentProcess;
        FlushInstructionCache(GetCurrentProcess(), _address as *const _, _size);
    }
}

/// A private mapping that holds generated code.
///
/// Starts out read/write; `seal` flips it to read/execute.
#[derive(Debug)]
pub struct ExecBlock {
    base: NonNull<u8>,
    size: usize,
}

unsafe impl Send for ExecBlock {}
unsafe impl Sync for ExecBlock {}

impl ExecBlock {
    pub fn allocate(size: usize) -> Result<Self> {
        let size = round_to_page(size);
        unsafe { map_block(ptr::null_mut(), size) }
            .map(|base| Self { base, size })
            .ok_or_else(|| HookError::MemoryMap(format!("{}", std::io::Error::last_os_error())))
    }

    /// Allocates a block whose every byte is within `radius` of `near`, so a
    /// `jmp rel32` at `near` can reach it. Falls back to any address.
    pub fn allocate_near(near: usize, size: usize, radius: usize) -> Result<Self> {
        let size = round_to_page(size);
        let origin = near & !(NEAR_STRIDE - 1);

        for step in 1..=NEAR_PROBES {
            let distance = step * NEAR_STRIDE;
            if distance + size > radius {
                break;
            }

            for hint in [origin.checked_sub(distance), origin.checked_add(distance)] {
                let Some(hint) = hint else { continue };
                let Some(base) = (unsafe { map_block(hint as *mut u8, size) }) else { continue };

                let block = Self { base, size };
                if block.within(near, radius) {
                    return Ok(block);
                }
                // Dropping unmaps the far block.
            }
        }

        tracing::warn!("no free block within {:#x} of {:#x}, using a far block", radius, near);
        Self::allocate(size)
    }

    fn within(&self, near: usize, radius: usize) -> bool {
        let start = self.base.as_ptr() as usize;
        let end = start + self.size;
        start.abs_diff(near) <= radius && end.abs_diff(near) <= radius
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn address(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Copies `bytes` to `offset`. Only valid before `seal` or inside `unsealed`.
    pub unsafe fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        if offset + bytes.len() > self.size {
            return Err(HookError::CodeTooLarge {
                needed: offset + bytes.len(),
                capacity: self.size,
            });
        }
        ptr::copy_nonoverlapping(bytes.as_ptr(), self.as_ptr().add(offset), bytes.len());
        Ok(())
    }

    pub fn seal(&self) -> Result<()> {
        unsafe {
            protect_block(self.as_ptr(), self.size, false)?;
            flush_instruction_cache(self.as_ptr(), self.size);
        }
        Ok(())
    }

    /// Runs `apply` with the block temporarily writable again.
    pub unsafe fn unsealed<R>(&self, apply: impl FnOnce(*mut u8) -> R) -> Result<R> {
        protect_block(self.as_ptr(), self.size, true)?;
        let result = apply(self.as_ptr());
        protect_block(self.as_ptr(), self.size, false)?;
        flush_instruction_cache(self.as_ptr(), self.size);
        Ok(result)
    }
}

impl Drop for ExecBlock {
    fn drop(&mut self) {
        unsafe { free_block(self.as_ptr(), self.size) }
    }
}

fn round_to_page(size: usize) -> usize {
    let page = page_size();
    (size.max(1) + page - 1) & !(page - 1)
}

#[cfg(unix)]
unsafe fn map_block(hint: *mut u8, size: usize) -> Option<NonNull<u8>> {
    let ptr = mmap(hint as *mut c_void, size, PROT_READ | PROT_WRITE, MAP_ANON | MAP_PRIVATE, -1, 0);
    if ptr == MAP_FAILED {
        return None;
    }
    NonNull::new(ptr as *mut u8)
}

#[cfg(windows)]
unsafe fn map_block(hint: *mut u8, size: usize) -> Option<NonNull<u8>> {
    let ptr = VirtualAlloc(hint as *const _, size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE);
    NonNull::new(ptr as *mut u8)
}

#[cfg(unix)]
unsafe fn protect_block(ptr: *mut u8, size: usize, writable: bool) -> Result<()> {
    let prot = if writable { PROT_READ | PROT_WRITE | PROT_EXEC } else { PROT_READ | PROT_EXEC };
    if mprotect(ptr as *mut c_void, size, prot) == -1 {
        let err = std::io::Error::last_os_error();
        return Err(HookError::MemoryProtection(format!("{}", err)));
    }
    Ok(())
}

#[cfg(windows)]
unsafe fn protect_block(ptr: *mut u8, size: usize, writable: bool) -> Result<()> {
    let prot = if writable { PAGE_EXECUTE_READWRITE } else { PAGE_EXECUTE_READ };
    let mut previous: PAGE_PROTECTION_FLAGS = 0;
    if VirtualProtect(ptr as *const _, size, prot, &mut previous) == 0 {
        let err = std::io::Error::last_os_error();
        return Err(HookError::MemoryProtection(format!("{}", err)));
    }
    Ok(())
}

#[cfg(unix)]
unsafe fn free_block(ptr: *mut u8, size: usize) {
    munmap(ptr as *mut c_void, size);
}

#[cfg(windows)]
unsafe fn free_block(ptr: *mut u8, _size: usize) {
    VirtualFree(ptr as *mut _, 0, MEM_RELEASE);
}
