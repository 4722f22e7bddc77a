//! The registry of installed hooks.
//!
//! Hooks on one target form a chain: the target leads to the newest record,
//! each record's "original" leads to the one installed before it, and the
//! oldest leads to the real function. Installing on a target that already
//! carries a hook from another interceptor joins that chain instead of
//! displacing it.

use super::record::{HookHeader, HookRecord, RecordParams, TargetLock};
use super::target::{swap_slot, Target};
use super::trampoline::Variant;
use crate::arch::x86_64::Detour;
use crate::config::{HookOptions, InterceptorConfig};
use crate::debug;
use crate::error::{HookError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Identifies one installed hook. Copyable; stays meaningful only while the
/// hook is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookHandle {
    target: Target,
    entry: usize,
}

impl HookHandle {
    /// Rebuilds a handle from its parts, for example after passing the entry
    /// through a C callback. Uninstalling checks it against the registry.
    pub fn from_raw_parts(target: Target, entry: usize) -> Self {
        Self { target, entry }
    }

    pub fn target(&self) -> Target {
        self.target
    }

    /// Address of the hook's trampoline.
    pub fn entry(&self) -> usize {
        self.entry
    }
}

struct Chain {
    target: Target,
    lock: TargetLock,
    /// Saved entry bytes; code targets only.
    detour: Option<Detour>,
    /// Oldest first. Never empty while the chain is registered.
    records: Vec<HookRecord>,
}

impl Chain {
    fn head(&self) -> Result<&HookRecord> {
        self.records
            .last()
            .ok_or(HookError::NotHooked(self.target.address()))
    }

    fn handle(&self, record: &HookRecord) -> HookHandle {
        HookHandle {
            target: self.target,
            entry: record.entry(),
        }
    }

    /// Sends the target to `to`, provided it currently leads to `expected`.
    unsafe fn redirect(&self, expected: usize, to: usize) -> Result<()> {
        match (self.target, &self.detour) {
            (Target::Slot(cell), _) => swap_slot(cell, expected, to),
            (Target::Code { address, .. }, Some(detour)) => {
                if self.target.current_entry() != Some(expected) {
                    return Err(HookError::EntryChanged(address));
                }
                detour.redirect(to)
            }
            (Target::Code { address, .. }, None) => Err(HookError::InvalidTarget(address)),
        }
    }

    /// Takes `records[index]` out of the path of calls. The record itself is
    /// left in place for the caller to drop.
    unsafe fn unlink(&self, index: usize) -> Result<()> {
        let record = &self.records[index];
        record.validate()?;

        let _guard = self.lock.lock();
        if index + 1 == self.records.len() {
            if self.target.current_entry() != Some(record.entry()) {
                return Err(HookError::NotChainHead(record.entry()));
            }
            match (&self.detour, index) {
                (Some(detour), 0) => detour.restore(),
                _ => self.redirect(record.entry(), record.original()),
            }
        } else {
            let newer = &self.records[index + 1];
            newer.validate()?;
            newer.relink(record.original(), record.previous())
        }
    }
}

/// Installs, chains and removes hooks, and owns everything they allocate.
///
/// Dropping the interceptor removes its hooks, newest first.
pub struct Interceptor {
    config: InterceptorConfig,
    chains: Mutex<HashMap<usize, Chain>>,
}

impl Default for Interceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Interceptor {
    pub fn new() -> Self {
        Self {
            config: InterceptorConfig::default(),
            chains: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config(config: InterceptorConfig) -> Result<Self> {
        config.validate()?;
        if config.dump_code {
            debug::enable_debug();
        }
        Ok(Self {
            config,
            chains: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &InterceptorConfig {
        &self.config
    }

    /// Hooks a target this interceptor has not hooked yet.
    ///
    /// # Safety
    /// `handler` must be a function with the shape `variant` expects, and
    /// for code targets the prologue must be as `Target::Code` describes and
    /// no thread may be executing it while it is patched.
    pub unsafe fn install(&self, target: Target, handler: usize, variant: Variant) -> Result<HookHandle> {
        self.install_with(target, handler, variant, HookOptions::default())
    }

    /// # Safety
    /// See `install`.
    pub unsafe fn install_with(
        &self,
        target: Target,
        handler: usize,
        variant: Variant,
        options: HookOptions,
    ) -> Result<HookHandle> {
        if handler == 0 {
            return Err(HookError::NullPointer);
        }
        target.validate()?;

        let mut chains = self.chains.lock();
        if chains.contains_key(&target.address()) {
            return Err(HookError::AlreadyHooked(target.address()));
        }
        self.start_chain(&mut chains, target, handler, variant, options)
    }

    /// Adds a hook on top of the newest one on an already hooked target.
    ///
    /// # Safety
    /// See `install`.
    pub unsafe fn chain(&self, target: Target, handler: usize, variant: Variant) -> Result<HookHandle> {
        self.chain_with(target, handler, variant, HookOptions::default())
    }

    /// # Safety
    /// See `install`.
    pub unsafe fn chain_with(
        &self,
        target: Target,
        handler: usize,
        variant: Variant,
        options: HookOptions,
    ) -> Result<HookHandle> {
        if handler == 0 {
            return Err(HookError::NullPointer);
        }

        let mut chains = self.chains.lock();
        let chain = chains
            .get_mut(&target.address())
            .ok_or(HookError::NotHooked(target.address()))?;
        self.extend_chain(chain, handler, variant, options)
    }

    /// `install` or `chain`, whichever applies.
    ///
    /// # Safety
    /// See `install`.
    pub unsafe fn hook(&self, target: Target, handler: usize, variant: Variant) -> Result<HookHandle> {
        self.hook_with(target, handler, variant, HookOptions::default())
    }

    /// # Safety
    /// See `install`.
    pub unsafe fn hook_with(
        &self,
        target: Target,
        handler: usize,
        variant: Variant,
        options: HookOptions,
    ) -> Result<HookHandle> {
        if handler == 0 {
            return Err(HookError::NullPointer);
        }

        let mut chains = self.chains.lock();
        match chains.get_mut(&target.address()) {
            Some(chain) => self.extend_chain(chain, handler, variant, options),
            None => {
                target.validate()?;
                self.start_chain(&mut chains, target, handler, variant, options)
            }
        }
    }

    unsafe fn start_chain(
        &self,
        chains: &mut HashMap<usize, Chain>,
        target: Target,
        handler: usize,
        variant: Variant,
        options: HookOptions,
    ) -> Result<HookHandle> {
        let (detour, original) = match target {
            Target::Slot(cell) => match target.current_entry() {
                Some(current) if current != 0 => (None, current),
                _ => {
                    tracing::warn!("slot {:#x} holds no function", cell);
                    return Err(HookError::NullPointer);
                }
            },
            Target::Code { address, prologue_len } => {
                let detour = Detour::new(address, prologue_len)?;
                let original = detour.original();
                (Some(detour), original)
            }
        };

        // A record from another interceptor already at the target: chain
        // onto it and share its lock.
        let foreign = HookHeader::probe(original);
        let lock = foreign
            .and_then(|header| header.shared_lock())
            .unwrap_or_default();
        let previous = if foreign.is_some() { original } else { 0 };
        if foreign.is_some() {
            tracing::debug!("{} already leads to hook {:#x}, chaining onto it", target, original);
        }

        let mut chain = Chain {
            target,
            lock,
            detour,
            records: Vec::new(),
        };

        let record = HookRecord::build(RecordParams {
            variant,
            handler,
            original,
            previous,
            capacity: options.capacity.unwrap_or(self.config.pool_capacity),
            extra: options.extra,
            lock: &chain.lock,
            near: self.placement(&target),
        })?;

        {
            let _guard = chain.lock.lock();
            match &chain.detour {
                Some(detour) => detour.redirect(record.entry())?,
                None => chain.redirect(original, record.entry())?,
            }
        }

        let handle = chain.handle(&record);
        tracing::debug!("installed {} hook {:#x} on {}", variant, handle.entry, target);
        chain.records.push(record);
        chains.insert(target.address(), chain);
        Ok(handle)
    }

    unsafe fn extend_chain(
        &self,
        chain: &mut Chain,
        handler: usize,
        variant: Variant,
        options: HookOptions,
    ) -> Result<HookHandle> {
        let head = chain.head()?;
        head.validate()?;
        let head_entry = head.entry();

        let lock = Arc::clone(&chain.lock);
        let _guard = lock.lock();
        if chain.target.current_entry() != Some(head_entry) {
            return Err(HookError::NotChainHead(head_entry));
        }

        let record = HookRecord::build(RecordParams {
            variant,
            handler,
            original: head_entry,
            previous: head_entry,
            capacity: options.capacity.unwrap_or(self.config.pool_capacity),
            extra: options.extra,
            lock: &chain.lock,
            near: self.placement(&chain.target),
        })?;
        chain.redirect(head_entry, record.entry())?;

        let handle = chain.handle(&record);
        tracing::debug!(
            "chained {} hook {:#x} on {} ({} deep)",
            variant,
            handle.entry,
            chain.target,
            chain.records.len() + 1
        );
        chain.records.push(record);
        Ok(handle)
    }

    /// Code targets get their trampolines close enough for a `jmp rel32`.
    fn placement(&self, target: &Target) -> Option<(usize, usize)> {
        match *target {
            Target::Code { address, .. } => Some((address, self.config.near_search_radius)),
            Target::Slot(_) => None,
        }
    }

    /// Removes one hook. The newest hook on a target hands the target back
    /// to whatever it chained onto; an older one is spliced out of the chain.
    /// Either way its memory is released before this returns.
    ///
    /// # Safety
    /// No thread may be executing the hook's trampoline or handler, or the
    /// patched prologue of a code target.
    pub unsafe fn uninstall(&self, handle: HookHandle) -> Result<()> {
        let key = handle.target.address();
        let mut chains = self.chains.lock();
        let chain = chains
            .get_mut(&key)
            .ok_or(HookError::NotInstalled(handle.entry))?;
        let index = chain
            .records
            .iter()
            .position(|record| record.entry() == handle.entry)
            .ok_or(HookError::NotInstalled(handle.entry))?;

        chain.unlink(index)?;
        let record = chain.records.remove(index);
        tracing::debug!("removed {} hook {:#x} from {}", record.variant(), handle.entry, chain.target);
        drop(record);

        if chain.records.is_empty() {
            chains.remove(&key);
        }
        Ok(())
    }

    /// Removes every hook, newest first on each target. A target whose head
    /// cannot be taken back keeps its remaining hooks alive and reachable;
    /// the first such failure is returned.
    ///
    /// # Safety
    /// See `uninstall`.
    pub unsafe fn uninstall_all(&self) -> Result<()> {
        let mut chains = self.chains.lock();
        let mut first_error = None;

        for (_, mut chain) in chains.drain() {
            while let Some(index) = chain.records.len().checked_sub(1) {
                if let Err(err) = chain.unlink(index) {
                    tracing::warn!("leaving {} hooked: {}", chain.target, err);
                    first_error.get_or_insert(err);
                    break;
                }
                chain.records.pop();
            }
            if !chain.records.is_empty() {
                // Calls can still reach this code.
                std::mem::forget(chain);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    pub fn is_hooked(&self, target: Target) -> bool {
        self.chains.lock().contains_key(&target.address())
    }

    /// Hooks this interceptor holds on `target`.
    pub fn chain_len(&self, target: Target) -> usize {
        self.chains
            .lock()
            .get(&target.address())
            .map_or(0, |chain| chain.records.len())
    }

    /// Handles on `target`, oldest first.
    pub fn handles(&self, target: Target) -> Vec<HookHandle> {
        self.chains
            .lock()
            .get(&target.address())
            .map(|chain| chain.records.iter().map(|record| chain.handle(record)).collect())
            .unwrap_or_default()
    }

    /// Total number of installed hooks.
    pub fn len(&self) -> usize {
        self.chains.lock().values().map(|chain| chain.records.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.lock().is_empty()
    }

    fn with_record<R>(&self, handle: HookHandle, read: impl FnOnce(&HookRecord) -> R) -> Result<R> {
        let chains = self.chains.lock();
        chains
            .get(&handle.target.address())
            .and_then(|chain| chain.records.iter().find(|record| record.entry() == handle.entry))
            .map(read)
            .ok_or(HookError::NotInstalled(handle.entry))
    }

    /// Where the hook's "call the original" currently leads.
    pub fn original(&self, handle: HookHandle) -> Result<usize> {
        self.with_record(handle, HookRecord::original)
    }

    /// Entry of the hook this one was chained onto, or 0.
    pub fn previous(&self, handle: HookHandle) -> Result<usize> {
        self.with_record(handle, HookRecord::previous)
    }

    pub fn extra(&self, handle: HookHandle) -> Result<usize> {
        self.with_record(handle, HookRecord::extra)
    }

    pub fn variant(&self, handle: HookHandle) -> Result<Variant> {
        self.with_record(handle, HookRecord::variant)
    }

    /// Context slots of the hook not currently in use.
    pub fn available_slots(&self, handle: HookHandle) -> Result<usize> {
        self.with_record(handle, |record| record.pool().available())
    }
}

impl Drop for Interceptor {
    fn drop(&mut self) {
        if let Err(err) = unsafe { self.uninstall_all() } {
            tracing::warn!("interceptor dropped with hooks left in place: {}", err);
        }
    }
}

impl std::fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor")
            .field("config", &self.config)
            .field("hooks", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::record::HOOK_MAGIC;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Binary = extern "C" fn(u64, u64) -> u64;

    extern "C" fn add(a: u64, b: u64) -> u64 {
        a + b
    }

    extern "C" fn sub(a: u64, b: u64) -> u64 {
        a.wrapping_sub(b)
    }

    static SEEN: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn count(_a: u64, _b: u64) -> u64 {
        SEEN.fetch_add(1, Ordering::SeqCst);
        0
    }

    fn call(cell: &AtomicUsize, a: u64, b: u64) -> u64 {
        let f: Binary = unsafe { std::mem::transmute(cell.load(Ordering::SeqCst)) };
        f(a, b)
    }

    fn slot(cell: &AtomicUsize) -> Target {
        Target::slot(cell as *const AtomicUsize as usize)
    }

    #[test]
    fn install_then_uninstall_restores_the_slot() {
        let _lock = crate::lock_hook_tests();
        let cell = AtomicUsize::new(add as usize);
        let interceptor = Interceptor::new();

        let handle = unsafe { interceptor.install(slot(&cell), count as usize, Variant::ENTRY) }.unwrap();
        assert_eq!(cell.load(Ordering::SeqCst), handle.entry());
        assert_eq!(interceptor.original(handle).unwrap(), add as usize);
        assert_eq!(interceptor.previous(handle).unwrap(), 0);

        let before = SEEN.load(Ordering::SeqCst);
        assert_eq!(call(&cell, 2, 3), 5);
        assert_eq!(SEEN.load(Ordering::SeqCst), before + 1);

        unsafe { interceptor.uninstall(handle) }.unwrap();
        assert_eq!(cell.load(Ordering::SeqCst), add as usize);
        assert!(interceptor.is_empty());
    }

    #[test]
    fn second_install_and_missing_chain_are_refused() {
        let _lock = crate::lock_hook_tests();
        let cell = AtomicUsize::new(add as usize);
        let other = AtomicUsize::new(sub as usize);
        let interceptor = Interceptor::new();

        unsafe {
            interceptor.install(slot(&cell), count as usize, Variant::ENTRY).unwrap();
            let err = interceptor.install(slot(&cell), count as usize, Variant::ENTRY).unwrap_err();
            assert!(matches!(err, HookError::AlreadyHooked(_)));

            let err = interceptor.chain(slot(&other), count as usize, Variant::ENTRY).unwrap_err();
            assert!(matches!(err, HookError::NotHooked(_)));

            let err = interceptor.install(slot(&other), 0, Variant::ENTRY).unwrap_err();
            assert!(matches!(err, HookError::NullPointer));
        }
        assert_eq!(other.load(Ordering::SeqCst), sub as usize);
    }

    #[test]
    fn double_uninstall_reports_not_installed() {
        let _lock = crate::lock_hook_tests();
        let cell = AtomicUsize::new(add as usize);
        let interceptor = Interceptor::new();

        unsafe {
            let handle = interceptor.install(slot(&cell), count as usize, Variant::EXIT).unwrap();
            interceptor.uninstall(handle).unwrap();
            let err = interceptor.uninstall(handle).unwrap_err();
            assert!(matches!(err, HookError::NotInstalled(entry) if entry == handle.entry()));
        }
    }

    #[test]
    fn damaged_record_is_not_removed() {
        let _lock = crate::lock_hook_tests();
        let cell = AtomicUsize::new(add as usize);
        let interceptor = Interceptor::new();

        let handle = unsafe { interceptor.install(slot(&cell), count as usize, Variant::ENTRY) }.unwrap();
        {
            let chains = interceptor.chains.lock();
            let record = &chains[&handle.target().address()].records[0];
            unsafe { record.overwrite_magic(0) }.unwrap();
        }

        let err = unsafe { interceptor.uninstall(handle) }.unwrap_err();
        assert!(matches!(err, HookError::Corrupted(_)));
        assert_eq!(cell.load(Ordering::SeqCst), handle.entry());

        {
            let chains = interceptor.chains.lock();
            let record = &chains[&handle.target().address()].records[0];
            unsafe { record.overwrite_magic(HOOK_MAGIC) }.unwrap();
        }
        unsafe { interceptor.uninstall(handle) }.unwrap();
        assert_eq!(cell.load(Ordering::SeqCst), add as usize);
    }

    #[test]
    fn options_reach_the_record() {
        let _lock = crate::lock_hook_tests();
        let cell = AtomicUsize::new(add as usize);
        let interceptor = Interceptor::with_config(InterceptorConfig::new().with_pool_capacity(3)).unwrap();

        unsafe {
            let first = interceptor.install(slot(&cell), count as usize, Variant::ENTRY).unwrap();
            let second = interceptor
                .chain_with(
                    slot(&cell),
                    count as usize,
                    Variant::OVERRIDE,
                    HookOptions::new().with_capacity(5).with_extra(0xfeed),
                )
                .unwrap();

            assert_eq!(interceptor.available_slots(first).unwrap(), 3);
            assert_eq!(interceptor.available_slots(second).unwrap(), 5);
            assert_eq!(interceptor.extra(first).unwrap(), 0);
            assert_eq!(interceptor.extra(second).unwrap(), 0xfeed);
            assert_eq!(interceptor.variant(second).unwrap(), Variant::OVERRIDE);
            assert_eq!(interceptor.previous(second).unwrap(), first.entry());
            assert_eq!(interceptor.handles(slot(&cell)), vec![first, second]);
        }
    }

    #[test]
    fn dropping_the_interceptor_unhooks() {
        let _lock = crate::lock_hook_tests();
        let cell = AtomicUsize::new(add as usize);
        {
            let interceptor = Interceptor::new();
            unsafe {
                interceptor.hook(slot(&cell), count as usize, Variant::ENTRY).unwrap();
                interceptor.hook(slot(&cell), count as usize, Variant::EXIT).unwrap();
            }
            assert_eq!(interceptor.chain_len(slot(&cell)), 2);
            assert_ne!(cell.load(Ordering::SeqCst), add as usize);
        }
        assert_eq!(cell.load(Ordering::SeqCst), add as usize);
    }

    #[test]
    fn interceptors_chain_onto_each_other() {
        let _lock = crate::lock_hook_tests();
        let cell = AtomicUsize::new(add as usize);
        let first = Interceptor::new();
        let second = Interceptor::new();

        unsafe {
            let bottom = first.install(slot(&cell), count as usize, Variant::ENTRY).unwrap();
            let top = second.install(slot(&cell), count as usize, Variant::ENTRY).unwrap();
            assert_eq!(second.previous(top).unwrap(), bottom.entry());
            assert_eq!(second.original(top).unwrap(), bottom.entry());

            let before = SEEN.load(Ordering::SeqCst);
            assert_eq!(call(&cell, 4, 5), 9);
            assert_eq!(SEEN.load(Ordering::SeqCst), before + 2);

            // The older hook is not at the entry any more.
            let err = first.uninstall(bottom).unwrap_err();
            assert!(matches!(err, HookError::NotChainHead(_)));

            second.uninstall(top).unwrap();
            first.uninstall(bottom).unwrap();
        }
        assert_eq!(cell.load(Ordering::SeqCst), add as usize);
    }
}
