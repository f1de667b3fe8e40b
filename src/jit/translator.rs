// The Translator drives a guest address through the whole pipeline: decode, IR construction,
// SSA, optimization, phi resolution, host code generation and placement in the executable
// arena. It owns the code cache and the address table the generated code dispatches through.
//
// Invalidation bumps an epoch before removing cache entries. A translation snapshots the epoch
// before it decodes and installs only if the epoch is unchanged, so a block that was decoded
// from bytes overwritten in the meantime is retried; after max_translation_retries attempts
// the translation is installed anyway to guarantee progress. Removed and replaced functions
// are not freed right away: a thread may still be running their code or may hold their host
// address, so they go to a deferred queue that is only drained while no thread is inside the
// dispatch loop.
//
// Fast-tier functions count their calls and, past the threshold, enqueue their guest address
// for re-translation. The queue is deduplicated and is drained either on the executing thread
// between dispatches or by a background worker waiting on a condition variable.

//! Translation pipeline, invalidation and tier-up.

use super::address_table::AddressTable;
use super::arena::ExecutableArena;
use super::cache::{CodeCache, InstallOutcome};
use super::function::{
    counter_address, new_call_counter, CompiledFunction, TranslatedFunction,
};
use crate::core::config::JitConfig;
use crate::core::error::JitResult;
use crate::core::session::TranslationSession;
use crate::decoder::{decode_block, ExecutionMode};
use crate::ir::optimizer::{self, Tier};
use crate::ir::{ssa, Function};
use crate::state::memory::MemoryManager;
use crate::translate::{translate_block, TranslationOptions};
use crate::x64::{self, EntryFn, RuntimeStubs};
use bumpalo::Bump;
use hashbrown::HashSet;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct RejitQueue {
    pending: VecDeque<u64>,
    queued: HashSet<u64>,
    shutdown: bool,
}

#[derive(Default)]
struct Counters {
    translations: AtomicU64,
    fast_translations: AtomicU64,
    optimized_translations: AtomicU64,
    rejits: AtomicU64,
    invalidated: AtomicU64,
    install_races: AtomicU64,
    stale_retries: AtomicU64,
    host_bytes: AtomicU64,
}

/// Snapshot of translator activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TranslatorStats {
    pub translations: u64,
    pub fast_translations: u64,
    pub optimized_translations: u64,
    /// Fast-tier functions replaced by an optimized translation.
    pub rejits: u64,
    /// Functions removed by invalidation or a cache clear.
    pub invalidated: u64,
    /// Translations discarded because another thread installed the address first.
    pub install_races: u64,
    /// Translations retried because an invalidation ran concurrently.
    pub stale_retries: u64,
    pub host_bytes: u64,
    pub cached_functions: usize,
    pub deferred_functions: usize,
    pub arena_live_bytes: usize,
}

impl fmt::Display for TranslatorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Translator Statistics:")?;
        writeln!(
            f,
            "  Translations: {} ({} fast, {} optimized)",
            self.translations, self.fast_translations, self.optimized_translations
        )?;
        writeln!(f, "  Re-translations: {}", self.rejits)?;
        writeln!(f, "  Invalidated: {}", self.invalidated)?;
        writeln!(
            f,
            "  Install races: {}, stale retries: {}",
            self.install_races, self.stale_retries
        )?;
        writeln!(f, "  Host bytes emitted: {}", self.host_bytes)?;
        writeln!(
            f,
            "  Cached: {}, deferred: {}",
            self.cached_functions, self.deferred_functions
        )?;
        write!(f, "  Arena bytes in use: {}", self.arena_live_bytes)
    }
}

/// Keeps deferred functions alive while a thread is dispatching.
pub struct DispatchGuard<'t> {
    translator: &'t Translator,
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.translator
            .active_dispatch
            .fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Translator {
    config: JitConfig,
    memory: Arc<dyn MemoryManager>,
    arena: Arc<ExecutableArena>,
    stubs: RuntimeStubs,
    table: Arc<AddressTable>,
    cache: CodeCache,
    epoch: AtomicU64,
    deferred: Mutex<Vec<(u64, Arc<TranslatedFunction>)>>,
    rejit: Mutex<RejitQueue>,
    rejit_ready: Condvar,
    active_dispatch: AtomicUsize,
    counters: Counters,
}

impl Translator {
    pub fn new(config: JitConfig, memory: Arc<dyn MemoryManager>) -> JitResult<Self> {
        let arena = ExecutableArena::new(config.arena_size)?;
        let stubs = RuntimeStubs::new(&arena)?;
        let table = Arc::new(AddressTable::new(config.mode, stubs.fill_address()));
        let cache = CodeCache::new(table.clone());
        log::info!(
            "Translator ready: {:?}, {} KiB arena, tiered: {}",
            config.mode,
            config.arena_size >> 10,
            config.tiered
        );
        Ok(Self {
            config,
            memory,
            arena,
            stubs,
            table,
            cache,
            epoch: AtomicU64::new(0),
            deferred: Mutex::new(Vec::new()),
            rejit: Mutex::new(RejitQueue::default()),
            rejit_ready: Condvar::new(),
            active_dispatch: AtomicUsize::new(0),
            counters: Counters::default(),
        })
    }

    /// The translation of `address`, creating and installing it on a cache miss.
    pub fn get_or_translate(
        &self,
        address: u64,
        mode: ExecutionMode,
    ) -> JitResult<Arc<TranslatedFunction>> {
        if let Some(function) = self.cache.get(address) {
            return Ok(function);
        }
        let tier = if self.config.tiered {
            Tier::Fast
        } else {
            Tier::Optimized
        };
        let attempts = self.config.max_translation_retries.max(1);
        let mut attempt = 1;
        loop {
            let epoch = self.epoch.load(Ordering::Acquire);
            let function = self.translate(address, mode, tier)?;
            let force = attempt >= attempts;
            match self.cache.install(function, &self.epoch, epoch, force) {
                InstallOutcome::Installed(function) => return Ok(function),
                InstallOutcome::Existing(function) => {
                    self.counters.install_races.fetch_add(1, Ordering::Relaxed);
                    log::trace!("Lost install race for {address:#x}");
                    return Ok(function);
                }
                InstallOutcome::Stale => {
                    self.counters.stale_retries.fetch_add(1, Ordering::Relaxed);
                    attempt += 1;
                    if attempt >= attempts {
                        log::warn!(
                            "Translation of {address:#x} raced with invalidation {} times, installing the next attempt",
                            attempt - 1
                        );
                    } else {
                        log::debug!("Retranslating {address:#x} after a concurrent invalidation");
                    }
                }
            }
        }
    }

    /// Run the full pipeline for one block. The result is not installed.
    fn translate(
        &self,
        address: u64,
        mode: ExecutionMode,
        tier: Tier,
    ) -> JitResult<Arc<TranslatedFunction>> {
        let bump = Bump::new();
        let session = TranslationSession::new(&bump);

        // Every page the decoder may fetch from is tracked before the first fetch, so a guest
        // write racing with decoding moves the epoch and the install below comes back stale.
        let span = (self.config.max_block_instructions as u64).saturating_mul(4);
        self.memory.track_code(address, span.min(u64::MAX - address));

        let is_known_entry = |entry: u64| entry != address && self.cache.contains(entry);
        let block = decode_block(
            self.memory.as_ref(),
            address,
            mode,
            self.config.max_block_instructions,
            &is_known_entry,
        )?;
        session.record_guest_block(block.opcodes.len(), block.guest_size() as usize);

        let call_counter = new_call_counter();
        let options = TranslationOptions {
            tier,
            call_counter: match tier {
                Tier::Fast => counter_address(&call_counter),
                Tier::Optimized => 0,
            },
            rejit_threshold: self.config.rejit_threshold,
        };

        let mut func = Function::new(&bump, address);
        translate_block(&mut func, &block, mode, &options)?;
        session.record_ir_built(func.operation_count());

        ssa::construct(&mut func)?;
        let stats = optimizer::optimize(&mut func, tier);
        for _ in 0..stats.rounds {
            session.record_optimizer_round(func.operation_count());
        }
        for _ in 0..ssa::deconstruct(&mut func)? {
            session.record_phi_copy();
        }
        if cfg!(debug_assertions) {
            func.verify()?;
        }
        if log::log_enabled!(log::Level::Trace) {
            log::trace!("IR for {address:#x}:\n{func}");
        }

        let compiled = CompiledFunction {
            code: x64::generate(&func, &self.table, &session)?,
            guest_size: block.guest_size(),
        };
        let allocation = self.arena.allocate(&compiled.code)?;

        let session_stats = session.stats();
        log::debug!(
            "Translated {address:#x} ({:?}): {} instructions, {} IR ops -> {} host bytes at {:#x}",
            tier,
            session_stats.guest_instructions,
            session_stats.ir_operations_optimized,
            session_stats.host_bytes,
            allocation.host_address()
        );
        self.counters.translations.fetch_add(1, Ordering::Relaxed);
        let per_tier = match tier {
            Tier::Fast => &self.counters.fast_translations,
            Tier::Optimized => &self.counters.optimized_translations,
        };
        per_tier.fetch_add(1, Ordering::Relaxed);
        self.counters
            .host_bytes
            .fetch_add(compiled.code.len() as u64, Ordering::Relaxed);

        Ok(Arc::new(TranslatedFunction::new(
            address,
            compiled.guest_size,
            tier,
            allocation,
            call_counter,
        )))
    }

    /// Host entry for `pc`, translating on a miss.
    pub fn resolve_host(&self, pc: u64) -> JitResult<u64> {
        if let Some(host) = self.table.lookup(pc) {
            return Ok(host);
        }
        Ok(self.get_or_translate(pc, self.config.mode)?.host_address())
    }

    /// Host entry for `pc` if it is translated.
    pub fn lookup_host(&self, pc: u64) -> Option<u64> {
        self.table.lookup(pc)
    }

    /// Drop every translation intersecting `[address, address + size)`. Returns how many.
    pub fn invalidate_region(&self, address: u64, size: u64) -> usize {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        let removed = self.cache.remove_range(address, size);
        let count = removed.len();
        if count > 0 {
            log::debug!(
                "Invalidated {count} translation(s) in [{address:#x}, {:#x})",
                address.saturating_add(size)
            );
            self.defer(removed);
        }
        count
    }

    /// Drop every translation. Their code is freed at once when no thread is dispatching.
    pub fn clear_cache(&self) -> usize {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        let removed = self.cache.clear();
        let count = removed.len();
        log::debug!("Cleared {count} translation(s)");
        self.defer(removed);
        self.reclaim_deferred();
        count
    }

    fn defer(&self, functions: Vec<Arc<TranslatedFunction>>) {
        self.counters
            .invalidated
            .fetch_add(functions.len() as u64, Ordering::Relaxed);
        self.deferred
            .lock()
            .extend(functions.into_iter().map(|f| (f.guest_address(), f)));
    }

    /// Free deferred functions if no thread is inside the dispatch loop. Returns how many.
    pub fn reclaim_deferred(&self) -> usize {
        if self.active_dispatch.load(Ordering::SeqCst) != 0 {
            return 0;
        }
        let reclaimed = std::mem::take(&mut *self.deferred.lock());
        if !reclaimed.is_empty() {
            log::trace!("Freeing {} deferred translation(s)", reclaimed.len());
        }
        reclaimed.len()
    }

    /// Mark the calling thread as dispatching until the guard drops.
    pub fn enter_dispatch(&self) -> DispatchGuard<'_> {
        self.active_dispatch.fetch_add(1, Ordering::SeqCst);
        DispatchGuard { translator: self }
    }

    /// Queue `address` for optimized re-translation.
    pub fn enqueue_rejit(&self, address: u64) {
        let mut queue = self.rejit.lock();
        if queue.shutdown || !queue.queued.insert(address) {
            return;
        }
        queue.pending.push_back(address);
        log::debug!("Queued {address:#x} for re-translation");
        self.rejit_ready.notify_one();
    }

    /// Replace the fast-tier translation of `address` with an optimized one. Returns false when
    /// there is nothing to replace or the entry changed while translating.
    pub fn rejit(&self, address: u64) -> JitResult<bool> {
        let Some(current) = self.cache.get(address) else {
            return Ok(false);
        };
        if current.tier() != Tier::Fast {
            return Ok(false);
        }
        let epoch = self.epoch.load(Ordering::Acquire);
        let optimized = self.translate(address, self.config.mode, Tier::Optimized)?;
        if self.epoch.load(Ordering::Acquire) != epoch {
            log::debug!("Dropping re-translation of {address:#x}: invalidated meanwhile");
            return Ok(false);
        }
        if !self.cache.replace(&current, optimized) {
            return Ok(false);
        }
        log::debug!(
            "Re-translated {address:#x} after {} calls",
            current.calls()
        );
        self.counters.rejits.fetch_add(1, Ordering::Relaxed);
        self.deferred.lock().push((address, current));
        Ok(true)
    }

    fn next_rejit(&self) -> Option<u64> {
        let mut queue = self.rejit.lock();
        let address = queue.pending.pop_front()?;
        queue.queued.remove(&address);
        Some(address)
    }

    fn rejit_logged(&self, address: u64) {
        if let Err(error) = self.rejit(address) {
            log::warn!("Re-translation of {address:#x} failed: {error}");
        }
    }

    /// Process every queued re-translation on the calling thread. Returns how many ran.
    pub fn drain_rejit_queue(&self) -> usize {
        let mut processed = 0;
        while let Some(address) = self.next_rejit() {
            self.rejit_logged(address);
            processed += 1;
        }
        processed
    }

    /// Body of the background re-translation thread. Returns after [`Self::shutdown_rejit_worker`].
    pub fn run_rejit_worker(&self) {
        log::debug!("Re-translation worker started");
        loop {
            let address = {
                let mut queue = self.rejit.lock();
                while queue.pending.is_empty() && !queue.shutdown {
                    self.rejit_ready.wait(&mut queue);
                }
                if queue.shutdown {
                    break;
                }
                let Some(address) = queue.pending.pop_front() else {
                    continue;
                };
                queue.queued.remove(&address);
                address
            };
            self.rejit_logged(address);
        }
        log::debug!("Re-translation worker stopped");
    }

    pub fn shutdown_rejit_worker(&self) {
        let mut queue = self.rejit.lock();
        queue.shutdown = true;
        queue.pending.clear();
        queue.queued.clear();
        self.rejit_ready.notify_all();
    }

    pub fn pending_rejits(&self) -> usize {
        self.rejit.lock().pending.len()
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.lock().len()
    }

    pub fn stats(&self) -> TranslatorStats {
        let c = &self.counters;
        TranslatorStats {
            translations: c.translations.load(Ordering::Relaxed),
            fast_translations: c.fast_translations.load(Ordering::Relaxed),
            optimized_translations: c.optimized_translations.load(Ordering::Relaxed),
            rejits: c.rejits.load(Ordering::Relaxed),
            invalidated: c.invalidated.load(Ordering::Relaxed),
            install_races: c.install_races.load(Ordering::Relaxed),
            stale_retries: c.stale_retries.load(Ordering::Relaxed),
            host_bytes: c.host_bytes.load(Ordering::Relaxed),
            cached_functions: self.cache.len(),
            deferred_functions: self.deferred_len(),
            arena_live_bytes: self.arena.live_bytes(),
        }
    }

    pub fn entry(&self) -> EntryFn {
        self.stubs.entry()
    }

    pub fn exit_stub(&self) -> u64 {
        self.stubs.exit_address()
    }

    pub fn memory(&self) -> &dyn MemoryManager {
        self.memory.as_ref()
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn table(&self) -> &Arc<AddressTable> {
        &self.table
    }

    pub fn cache(&self) -> &CodeCache {
        &self.cache
    }

    pub fn arena(&self) -> &Arc<ExecutableArena> {
        &self.arena
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::memory::FlatMemory;

    const MOVZ_X0_5: u32 = 0xd280_00a0;
    const B_NEXT: u32 = 0x1400_0001;
    const BRK_0: u32 = 0xd420_0000;

    fn setup(tiered: bool) -> (Arc<FlatMemory>, Translator) {
        let _ = env_logger::builder().is_test(true).try_init();
        let memory = Arc::new(FlatMemory::new());
        let words = [MOVZ_X0_5, B_NEXT, MOVZ_X0_5, BRK_0];
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        memory.map(0x1000, 0x1000, true);
        memory.write(0x1000, &bytes).unwrap();
        let config = JitConfig::new(ExecutionMode::Aarch64)
            .with_arena_size(1 << 18)
            .with_tiered(tiered);
        let translator = Translator::new(config, memory.clone()).unwrap();
        (memory, translator)
    }

    #[test]
    fn test_translation_is_cached_and_published() {
        let (_memory, translator) = setup(true);
        let first = translator
            .get_or_translate(0x1000, ExecutionMode::Aarch64)
            .unwrap();
        assert_eq!(first.tier(), Tier::Fast);
        assert_eq!(first.guest_size(), 8);
        let again = translator
            .get_or_translate(0x1000, ExecutionMode::Aarch64)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(translator.lookup_host(0x1000), Some(first.host_address()));
        assert_eq!(translator.resolve_host(0x1000).unwrap(), first.host_address());
        assert_eq!(translator.stats().translations, 1);
    }

    #[test]
    fn test_untiered_translations_are_optimized() {
        let (_memory, translator) = setup(false);
        let function = translator
            .get_or_translate(0x1008, ExecutionMode::Aarch64)
            .unwrap();
        assert_eq!(function.tier(), Tier::Optimized);
        assert_eq!(translator.stats().optimized_translations, 1);
    }

    #[test]
    fn test_unmapped_address_is_an_error() {
        let (_memory, translator) = setup(true);
        assert!(translator.resolve_host(0x9000).is_err());
        assert!(translator.cache().is_empty());
    }

    #[test]
    fn test_invalidation_defers_and_reclaims() {
        let (_memory, translator) = setup(true);
        translator.resolve_host(0x1000).unwrap();
        translator.resolve_host(0x1008).unwrap();

        {
            let _dispatch = translator.enter_dispatch();
            assert_eq!(translator.invalidate_region(0x1004, 4), 1);
            assert_eq!(translator.lookup_host(0x1000), None);
            assert!(translator.lookup_host(0x1008).is_some());
            assert_eq!(translator.deferred_len(), 1);
            assert_eq!(translator.reclaim_deferred(), 0);
        }
        assert_eq!(translator.reclaim_deferred(), 1);
        assert_eq!(translator.deferred_len(), 0);
        assert_eq!(translator.arena().live_allocations(), 3 + 1);
    }

    #[test]
    fn test_code_write_invalidates_through_handler() {
        let (memory, translator) = setup(true);
        let translator = Arc::new(translator);
        struct Invalidate(Arc<Translator>);
        impl crate::state::memory::MemoryEventHandler for Invalidate {
            fn on_memory_event(&self, event: crate::state::memory::MemoryEvent) {
                use crate::state::memory::MemoryEvent::*;
                match event {
                    CodeWritten { address, size } | Unmapped { address, size } => {
                        self.0.invalidate_region(address, size);
                    }
                }
            }
        }
        memory.subscribe(Arc::new(Invalidate(translator.clone())));
        translator.resolve_host(0x1000).unwrap();
        memory.write(0x1000, &BRK_0.to_le_bytes()).unwrap();
        assert_eq!(translator.lookup_host(0x1000), None);
        assert_eq!(translator.stats().invalidated, 1);
    }

    #[test]
    fn test_clear_cache_frees_when_idle() {
        let (_memory, translator) = setup(true);
        translator.resolve_host(0x1000).unwrap();
        translator.resolve_host(0x1008).unwrap();
        assert_eq!(translator.clear_cache(), 2);
        assert_eq!(translator.deferred_len(), 0);
        assert_eq!(translator.arena().live_allocations(), 3);
    }

    #[test]
    fn test_rejit_replaces_fast_translation() {
        let (_memory, translator) = setup(true);
        let fast = translator.resolve_host(0x1000).unwrap();

        translator.enqueue_rejit(0x1000);
        translator.enqueue_rejit(0x1000);
        assert_eq!(translator.pending_rejits(), 1);
        assert_eq!(translator.drain_rejit_queue(), 1);

        let live = translator.cache().get(0x1000).unwrap();
        assert_eq!(live.tier(), Tier::Optimized);
        assert_ne!(live.host_address(), fast);
        assert_eq!(translator.lookup_host(0x1000), Some(live.host_address()));
        assert_eq!(translator.deferred_len(), 1);
        assert!(!translator.rejit(0x1000).unwrap());
        assert_eq!(translator.stats().rejits, 1);
    }

    #[test]
    fn test_rejit_of_missing_entry_is_a_no_op() {
        let (_memory, translator) = setup(true);
        assert!(!translator.rejit(0x1000).unwrap());
        translator.shutdown_rejit_worker();
        translator.enqueue_rejit(0x1000);
        assert_eq!(translator.pending_rejits(), 0);
    }

    #[test]
    fn test_worker_exits_on_shutdown() {
        let (_memory, translator) = setup(true);
        let translator = Arc::new(translator);
        translator.resolve_host(0x1000).unwrap();
        let worker = {
            let translator = translator.clone();
            std::thread::spawn(move || translator.run_rejit_worker())
        };
        translator.enqueue_rejit(0x1000);
        for _ in 0..1000 {
            if translator.stats().rejits == 1 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        translator.shutdown_rejit_worker();
        worker.join().unwrap();
        assert_eq!(translator.stats().rejits, 1);
    }
}
