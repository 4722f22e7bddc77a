use crate::error::{HookError, Result};

/// One mapping of the process address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start: usize,
    pub end: usize,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
}

impl Region {
    pub fn contains(&self, address: usize) -> bool {
        address >= self.start && address < self.end
    }

    pub fn contains_range(&self, address: usize, len: usize) -> bool {
        self.contains(address) && address.saturating_add(len) <= self.end
    }
}

/// Finds the mapping holding `address`.
///
/// `Ok(None)` means the address is not mapped.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn query_region(address: usize) -> Result<Option<Region>> {
    let maps = std::fs::read_to_string("/proc/self/maps")?;

    for line in maps.lines() {
        if let Some(region) = parse_maps_line(line) {
            if region.contains(address) {
                return Ok(Some(region));
            }
        }
    }

    Ok(None)
}

#[cfg(windows)]
pub fn query_region(address: usize) -> Result<Option<Region>> {
    use windows_sys::Win32::System::Memory::{
        VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_COMMIT, PAGE_EXECUTE, PAGE_EXECUTE_READ,
        PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_READONLY, PAGE_READWRITE,
        PAGE_WRITECOPY,
    };

    let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
    let written = unsafe {
        VirtualQuery(
            address as *const core::ffi::c_void,
            &mut info,
            std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };
    if written == 0 || info.State != MEM_COMMIT {
        return Ok(None);
    }

    let protect = info.Protect & 0xff;
    let executable = matches!(
        protect,
        PAGE_EXECUTE | PAGE_EXECUTE_READ | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY
    );
    let writable = matches!(
        protect,
        PAGE_READWRITE | PAGE_WRITECOPY | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY
    );
    let readable = writable || matches!(protect, PAGE_READONLY | PAGE_EXECUTE_READ);

    let start = info.BaseAddress as usize;
    Ok(Some(Region {
        start,
        end: start + info.RegionSize,
        readable,
        writable,
        executable,
    }))
}

/// Platforms without a cheap region query report every address as an
/// unrestricted mapping and leave validation to the caller. Patched code
/// pages are put back to read and execute by `ProtectedMemory`.
#[cfg(not(any(target_os = "linux", target_os = "android", windows)))]
pub fn query_region(address: usize) -> Result<Option<Region>> {
    if address == 0 {
        return Ok(None);
    }
    Ok(Some(Region {
        start: address,
        end: usize::MAX,
        readable: true,
        writable: true,
        executable: true,
    }))
}

/// Parses one `/proc/self/maps` line: `start-end perms offset dev inode path`.
pub fn parse_maps_line(line: &str) -> Option<Region> {
    let mut parts = line.split_whitespace();
    let (start, end) = parts.next()?.split_once('-')?;
    let perms = parts.next()?.as_bytes();
    if perms.len() < 3 {
        return None;
    }

    Some(Region {
        start: usize::from_str_radix(start, 16).ok()?,
        end: usize::from_str_radix(end, 16).ok()?,
        readable: perms[0] == b'r',
        writable: perms[1] == b'w',
        executable: perms[2] == b'x',
    })
}

/// Fails unless `len` bytes at `address` are mapped executable code.
pub fn ensure_code(address: usize, len: usize) -> Result<Region> {
    match query_region(address)? {
        Some(region) if region.executable && region.contains_range(address, len) => Ok(region),
        _ => Err(HookError::InvalidTarget(address)),
    }
}

/// Fails unless a pointer-sized cell at `address` is mapped and readable.
pub fn ensure_slot(address: usize) -> Result<Region> {
    if address % std::mem::align_of::<usize>() != 0 {
        return Err(HookError::InvalidTarget(address));
    }
    match query_region(address)? {
        Some(region) if region.readable && region.contains_range(address, std::mem::size_of::<usize>()) => {
            Ok(region)
        }
        _ => Err(HookError::InvalidTarget(address)),
    }
}
