// The code cache owns every live TranslatedFunction, keyed by guest entry address. It is
// split into shards so translations of unrelated addresses do not contend; each shard is a
// BTreeMap under a parking_lot RwLock. Installation and removal update the address table slot
// while the shard write lock is held, which keeps the table and the cache in agreement for
// every address. Range queries scan each shard from `address - max_span`, where max_span is
// the largest guest size ever installed, so an entry starting before the range but reaching
// into it is still found.

//! Sharded concurrent code cache.

use super::address_table::AddressTable;
use super::function::TranslatedFunction;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const SHARD_COUNT: usize = 64;

type Shard = RwLock<BTreeMap<u64, Arc<TranslatedFunction>>>;

/// Result of [`CodeCache::install`].
#[derive(Debug)]
pub enum InstallOutcome {
    Installed(Arc<TranslatedFunction>),
    /// Another thread installed this address first.
    Existing(Arc<TranslatedFunction>),
    /// An invalidation ran since the translation started.
    Stale,
}

pub struct CodeCache {
    shards: Box<[Shard]>,
    table: Arc<AddressTable>,
    max_span: AtomicU64,
}

impl CodeCache {
    pub fn new(table: Arc<AddressTable>) -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(BTreeMap::new())).collect(),
            table,
            max_span: AtomicU64::new(0),
        }
    }

    fn shard(&self, address: u64) -> &Shard {
        &self.shards[((address >> 2) as usize) % SHARD_COUNT]
    }

    pub fn get(&self, address: u64) -> Option<Arc<TranslatedFunction>> {
        self.shard(address).read().get(&address).cloned()
    }

    pub fn contains(&self, address: u64) -> bool {
        self.shard(address).read().contains_key(&address)
    }

    /// Install `function` unless an entry exists or `epoch` moved past `expected_epoch`.
    /// `force` skips the epoch check.
    pub fn install(
        &self,
        function: Arc<TranslatedFunction>,
        epoch: &AtomicU64,
        expected_epoch: u64,
        force: bool,
    ) -> InstallOutcome {
        let address = function.guest_address();
        let mut shard = self.shard(address).write();
        if let Some(existing) = shard.get(&address) {
            return InstallOutcome::Existing(existing.clone());
        }
        if !force && epoch.load(Ordering::Acquire) != expected_epoch {
            return InstallOutcome::Stale;
        }
        self.max_span
            .fetch_max(function.guest_size(), Ordering::AcqRel);
        self.table.set(address, function.host_address());
        shard.insert(address, function.clone());
        InstallOutcome::Installed(function)
    }

    /// Swap `current` for `replacement` if `current` is still the live entry.
    pub fn replace(
        &self,
        current: &Arc<TranslatedFunction>,
        replacement: Arc<TranslatedFunction>,
    ) -> bool {
        let address = current.guest_address();
        let mut shard = self.shard(address).write();
        match shard.get(&address) {
            Some(live) if Arc::ptr_eq(live, current) => {
                self.max_span
                    .fetch_max(replacement.guest_size(), Ordering::AcqRel);
                self.table.set(address, replacement.host_address());
                shard.insert(address, replacement);
                true
            }
            _ => false,
        }
    }

    /// Remove every entry whose guest range intersects `[address, address + size)`.
    pub fn remove_range(&self, address: u64, size: u64) -> Vec<Arc<TranslatedFunction>> {
        let start = address.saturating_sub(self.max_span.load(Ordering::Acquire));
        let end = address.saturating_add(size);
        let mut removed = Vec::new();
        for shard in self.shards.iter() {
            let mut shard = shard.write();
            let hits: Vec<u64> = shard
                .range(start..end)
                .filter(|(_, f)| f.overlaps(address, size))
                .map(|(&a, _)| a)
                .collect();
            for hit in hits {
                if let Some(function) = shard.remove(&hit) {
                    self.table.reset(hit);
                    removed.push(function);
                }
            }
        }
        removed
    }

    /// Entries whose guest range intersects `[address, address + size)`.
    pub fn overlapping(&self, address: u64, size: u64) -> Vec<Arc<TranslatedFunction>> {
        let start = address.saturating_sub(self.max_span.load(Ordering::Acquire));
        let end = address.saturating_add(size);
        self.shards
            .iter()
            .flat_map(|shard| {
                shard
                    .read()
                    .range(start..end)
                    .filter(|(_, f)| f.overlaps(address, size))
                    .map(|(_, f)| f.clone())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Remove every entry and reset the address table.
    pub fn clear(&self) -> Vec<Arc<TranslatedFunction>> {
        let mut guards: Vec<_> = self.shards.iter().map(|s| s.write()).collect();
        self.table.clear();
        let mut removed = Vec::new();
        for shard in guards.iter_mut() {
            removed.extend(std::mem::take(&mut **shard).into_values());
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn table(&self) -> &Arc<AddressTable> {
        &self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::ExecutionMode;
    use crate::ir::optimizer::Tier;
    use crate::jit::arena::ExecutableArena;
    use crate::jit::function::new_call_counter;

    const FILL: u64 = 0xf111;

    fn function(arena: &Arc<ExecutableArena>, address: u64, size: u64) -> Arc<TranslatedFunction> {
        let code = arena.allocate(&[0xc3]).unwrap();
        Arc::new(TranslatedFunction::new(
            address,
            size,
            Tier::Optimized,
            code,
            new_call_counter(),
        ))
    }

    fn cache() -> (Arc<ExecutableArena>, CodeCache) {
        let table = Arc::new(AddressTable::new(ExecutionMode::Aarch64, FILL));
        (ExecutableArena::new(1 << 16).unwrap(), CodeCache::new(table))
    }

    #[test]
    fn test_install_publishes_and_keeps_first() {
        let (arena, cache) = cache();
        let epoch = AtomicU64::new(0);
        let first = function(&arena, 0x1000, 8);
        let host = first.host_address();
        assert!(matches!(
            cache.install(first, &epoch, 0, false),
            InstallOutcome::Installed(_)
        ));
        assert_eq!(cache.table().lookup(0x1000), Some(host));

        let second = function(&arena, 0x1000, 8);
        match cache.install(second, &epoch, 0, false) {
            InstallOutcome::Existing(f) => assert_eq!(f.host_address(), host),
            other => panic!("unexpected {other:?}"),
        }
        // The losing translation's code went back to the arena.
        assert_eq!(arena.live_allocations(), 1);
    }

    #[test]
    fn test_stale_epoch_rejected_unless_forced() {
        let (arena, cache) = cache();
        let epoch = AtomicU64::new(3);
        assert!(matches!(
            cache.install(function(&arena, 0x2000, 4), &epoch, 2, false),
            InstallOutcome::Stale
        ));
        assert!(cache.is_empty());
        assert!(matches!(
            cache.install(function(&arena, 0x2000, 4), &epoch, 2, true),
            InstallOutcome::Installed(_)
        ));
    }

    #[test]
    fn test_remove_range_finds_entries_starting_before() {
        let (arena, cache) = cache();
        let epoch = AtomicU64::new(0);
        for (address, size) in [(0x1000, 0x40), (0x1040, 0x10), (0x2000, 4)] {
            cache.install(function(&arena, address, size), &epoch, 0, false);
        }
        assert_eq!(cache.overlapping(0x1030, 4).len(), 1);

        let removed = cache.remove_range(0x1030, 0x14);
        let mut addresses: Vec<u64> = removed.iter().map(|f| f.guest_address()).collect();
        addresses.sort();
        assert_eq!(addresses, vec![0x1000, 0x1040]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.table().lookup(0x1000), None);
        assert!(cache.table().lookup(0x2000).is_some());
    }

    #[test]
    fn test_replace_requires_live_entry() {
        let (arena, cache) = cache();
        let epoch = AtomicU64::new(0);
        let fast = function(&arena, 0x3000, 4);
        cache.install(fast.clone(), &epoch, 0, false);
        let optimized = function(&arena, 0x3000, 4);
        let host = optimized.host_address();
        assert!(cache.replace(&fast, optimized));
        assert_eq!(cache.table().lookup(0x3000), Some(host));
        assert!(!cache.replace(&fast, function(&arena, 0x3000, 4)));
    }

    #[test]
    fn test_clear_empties_everything() {
        let (arena, cache) = cache();
        let epoch = AtomicU64::new(0);
        cache.install(function(&arena, 0x1000, 4), &epoch, 0, false);
        cache.install(function(&arena, 0x5000, 4), &epoch, 0, false);
        let removed = cache.clear();
        assert_eq!(removed.len(), 2);
        assert!(cache.is_empty());
        assert_eq!(cache.table().lookup(0x5000), None);
    }
}
