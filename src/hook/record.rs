use super::memory::{page_size, ExecBlock};
use super::pool::ContextPool;
use super::trampoline::{self, Variant};
use crate::arch::abi::NATIVE;
use crate::debug;
use crate::error::{HookError, Result};
use crate::utils::query_region;
use parking_lot::Mutex;
use std::mem::{offset_of, size_of};
use std::ptr;
use std::sync::Arc;

/// "UniHook\0", little endian.
pub const HOOK_MAGIC: u64 = 0x006B_6F6F_4869_6E55;

/// Generated code starts this far into a record's block, so the entry of
/// every hook sits at a fixed page offset.
pub const CODE_OFFSET: usize = 0x40;

/// Serialises patching of one target across every record that chains on it.
pub type TargetLock = Arc<Mutex<()>>;

/// The fixed-layout head of a record's block, read by the generated code and
/// by any other interceptor that finds this hook at a target's entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookHeader {
    pub magic: u64,
    /// Address of the pool's sentinel cell.
    pub pool: usize,
    /// One past the last pool cell.
    pub pool_end: usize,
    /// Entry of the hook this one was chained onto, or 0.
    pub previous: usize,
    pub handler: usize,
    /// Where "call the original" goes.
    pub original: usize,
    pub extra: usize,
    /// `Arc::into_raw` of the target lock; the header owns one reference.
    pub lock: usize,
}

pub const HDR_MAGIC: usize = offset_of!(HookHeader, magic);
pub const HDR_POOL: usize = offset_of!(HookHeader, pool);
pub const HDR_POOL_END: usize = offset_of!(HookHeader, pool_end);
pub const HDR_PREVIOUS: usize = offset_of!(HookHeader, previous);
pub const HDR_HANDLER: usize = offset_of!(HookHeader, handler);
pub const HDR_ORIGINAL: usize = offset_of!(HookHeader, original);
pub const HDR_EXTRA: usize = offset_of!(HookHeader, extra);
pub const HDR_LOCK: usize = offset_of!(HookHeader, lock);

const _: () = assert!(HDR_MAGIC == 0 && HDR_POOL == 0x08 && HDR_LOCK == 0x38);
const _: () = assert!(size_of::<HookHeader>() <= CODE_OFFSET);

/// Absolute addresses the generated code refers to, RIP-relative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderFields {
    pub entry: u64,
    pub pool: u64,
    pub pool_end: u64,
    pub handler: u64,
    pub original: u64,
}

impl HeaderFields {
    pub fn at(header: usize) -> Self {
        let field = |offset: usize| (header + offset) as u64;
        Self {
            entry: field(CODE_OFFSET),
            pool: field(HDR_POOL),
            pool_end: field(HDR_POOL_END),
            handler: field(HDR_HANDLER),
            original: field(HDR_ORIGINAL),
        }
    }
}

impl HookHeader {
    /// Reads the header in front of `entry` if `entry` is a hook built by
    /// this crate, whichever interceptor owns it.
    ///
    /// # Safety
    /// A mapped header at `entry - CODE_OFFSET` must not be unmapped concurrently.
    pub unsafe fn probe(entry: usize) -> Option<HookHeader> {
        if entry < CODE_OFFSET || entry % page_size() != CODE_OFFSET {
            return None;
        }
        let address = entry - CODE_OFFSET;
        match query_region(address) {
            Ok(Some(region)) if region.readable && region.contains_range(address, size_of::<HookHeader>()) => {}
            _ => return None,
        }

        let header = ptr::read_volatile(address as *const HookHeader);
        (header.magic == HOOK_MAGIC).then_some(header)
    }

    /// A new reference to the lock this header shares with its chain.
    ///
    /// # Safety
    /// The header must come from a live record.
    pub unsafe fn shared_lock(&self) -> Option<TargetLock> {
        if self.lock == 0 {
            return None;
        }
        let raw = self.lock as *const Mutex<()>;
        Arc::increment_strong_count(raw);
        Some(Arc::from_raw(raw))
    }
}

pub struct RecordParams<'a> {
    pub variant: Variant,
    pub handler: usize,
    pub original: usize,
    pub previous: usize,
    pub capacity: usize,
    pub extra: usize,
    pub lock: &'a TargetLock,
    /// Place the block within `(address, radius)` when set.
    pub near: Option<(usize, usize)>,
}

/// One installed hook: header, generated code and context pool.
///
/// Dropping a record clears its magic and frees the code; it must no longer
/// be reachable from any entry point or other record by then.
pub struct HookRecord {
    block: ExecBlock,
    pool: ContextPool,
    variant: Variant,
}

impl HookRecord {
    pub fn build(params: RecordParams<'_>) -> Result<Self> {
        let pool = ContextPool::new(params.capacity)?;
        let block = match params.near {
            Some((near, radius)) => ExecBlock::allocate_near(near, page_size(), radius)?,
            None => ExecBlock::allocate(page_size())?,
        };

        let fields = HeaderFields::at(block.address());
        let code = trampoline::generate(params.variant, &NATIVE, &fields)?;
        unsafe { block.write(CODE_OFFSET, &code)? };

        let header = HookHeader {
            magic: HOOK_MAGIC,
            pool: pool.cells_start(),
            pool_end: pool.cells_end(),
            previous: params.previous,
            handler: params.handler,
            original: params.original,
            extra: params.extra,
            lock: Arc::into_raw(Arc::clone(params.lock)) as usize,
        };
        // Blocks are page aligned; the header reference is released by Drop.
        unsafe { ptr::write(block.as_ptr() as *mut HookHeader, header) };

        let record = Self {
            block,
            pool,
            variant: params.variant,
        };
        record.block.seal()?;

        debug::log_code(params.variant.name(), &code, record.entry());
        tracing::trace!(
            "built {} record at {:#x} ({} bytes of code, {} slots)",
            record.variant,
            record.entry(),
            code.len(),
            record.pool.capacity()
        );
        Ok(record)
    }

    pub fn entry(&self) -> usize {
        self.block.address() + CODE_OFFSET
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn pool(&self) -> &ContextPool {
        &self.pool
    }

    pub fn header(&self) -> HookHeader {
        unsafe { ptr::read_volatile(self.block.as_ptr() as *const HookHeader) }
    }

    pub fn original(&self) -> usize {
        self.header().original
    }

    pub fn previous(&self) -> usize {
        self.header().previous
    }

    pub fn extra(&self) -> usize {
        self.header().extra
    }

    pub fn validate(&self) -> Result<()> {
        if self.header().magic != HOOK_MAGIC {
            return Err(HookError::Corrupted(self.entry()));
        }
        Ok(())
    }

    /// Points this record's original and previous at new values, used when
    /// the record it chained onto is spliced out.
    ///
    /// # Safety
    /// The caller must hold the target lock.
    pub unsafe fn relink(&self, original: usize, previous: usize) -> Result<()> {
        self.block.unsealed(|base| {
            ptr::write_volatile(base.add(HDR_ORIGINAL) as *mut usize, original);
            ptr::write_volatile(base.add(HDR_PREVIOUS) as *mut usize, previous);
        })
    }

    #[cfg(test)]
    pub(crate) unsafe fn overwrite_magic(&self, magic: u64) -> Result<()> {
        self.block.unsealed(|base| ptr::write_volatile(base as *mut u64, magic))
    }
}

impl Drop for HookRecord {
    fn drop(&mut self) {
        let lock = self.header().lock;
        unsafe {
            if let Err(err) = self.block.unsealed(|base| ptr::write_volatile(base as *mut u64, 0)) {
                tracing::warn!("could not clear magic of {:#x}: {}", self.entry(), err);
            }
            if lock != 0 {
                drop(Arc::from_raw(lock as *const Mutex<()>));
            }
        }
    }
}

impl std::fmt::Debug for HookRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRecord")
            .field("entry", &format_args!("{:#x}", self.entry()))
            .field("variant", &self.variant)
            .field("header", &self.header())
            .field("pool", &self.pool)
            .finish()
    }
}
