// The address table maps a guest pc to the host code that implements it. It is a radix tree
// with a fixed level layout per guest bitness; generated code walks it inline for computed
// branch targets, so every slot is a plain 64-bit word: interior slots hold the address of the
// next level, leaf slots hold a host entry point. Untouched parts of the tree point into a
// chain of shared fill levels, one per depth, whose leaf slots all hold the fill stub; the
// stub asks the translator for the pc and jumps to the result. Levels are materialized with a
// compare-and-swap on the parent slot, so concurrent writers agree on one level and the loser
// discards its copy. Levels are never freed while the table lives, which keeps the slot
// addresses baked into generated code valid.

//! Multi-level guest address to host entry table.

use crate::decoder::ExecutionMode;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// One level of the table: the index is `(pc >> shift) & ((1 << bits) - 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Level {
    pub shift: u32,
    pub bits: u32,
}

impl Level {
    const fn new(shift: u32, bits: u32) -> Self {
        Self { shift, bits }
    }

    pub fn entries(&self) -> usize {
        1 << self.bits
    }

    pub fn index(&self, pc: u64) -> usize {
        ((pc >> self.shift) & ((1 << self.bits) - 1)) as usize
    }

    pub fn mask(&self) -> u32 {
        (1 << self.bits) - 1
    }
}

pub const A64_LEVELS: [Level; 5] = [
    Level::new(39, 9),
    Level::new(30, 9),
    Level::new(21, 9),
    Level::new(12, 9),
    Level::new(2, 10),
];

pub const A32_LEVELS: [Level; 3] = [Level::new(22, 10), Level::new(12, 10), Level::new(2, 10)];

/// Upper bound on the leaf levels a single `prepare` call materializes.
pub const MAX_PREPARED_LEAVES: usize = 4096;

type Slots = Box<[AtomicU64]>;

fn new_slots(entries: usize, value: u64) -> Slots {
    (0..entries).map(|_| AtomicU64::new(value)).collect()
}

fn slots_address(slots: &Slots) -> u64 {
    slots.as_ptr() as u64
}

pub struct AddressTable {
    levels: &'static [Level],
    root: Slots,
    /// Shared fill level for each depth; index 0 is unused.
    fill_levels: Vec<Slots>,
    /// Materialized levels below the root, with their depth.
    allocated: Mutex<Vec<(usize, Slots)>>,
    fill_stub: u64,
    /// Bits that must be clear for a pc to be representable.
    invalid_mask: u64,
}

impl AddressTable {
    pub fn new(mode: ExecutionMode, fill_stub: u64) -> Self {
        let levels: &'static [Level] = match mode {
            ExecutionMode::Aarch64 => &A64_LEVELS,
            ExecutionMode::Aarch32Arm => &A32_LEVELS,
        };
        let top = levels[0];
        let covered_bits = top.shift + top.bits;
        let granule = (1u64 << levels[levels.len() - 1].shift) - 1;
        let invalid_mask = !((1u64 << covered_bits) - 1) | granule;

        // Built leaf first so each level can point at the one below it.
        let depth = levels.len();
        let mut fill_levels: Vec<Slots> = Vec::with_capacity(depth);
        let mut below = fill_stub;
        for d in (1..depth).rev() {
            let slots = new_slots(levels[d].entries(), below);
            below = slots_address(&slots);
            fill_levels.push(slots);
        }
        fill_levels.push(new_slots(0, 0));
        fill_levels.reverse();
        let root = new_slots(top.entries(), below);

        Self {
            levels,
            root,
            fill_levels,
            allocated: Mutex::new(Vec::new()),
            fill_stub,
            invalid_mask,
        }
    }

    pub fn levels(&self) -> &'static [Level] {
        self.levels
    }

    pub fn root_address(&self) -> u64 {
        slots_address(&self.root)
    }

    pub fn fill_stub(&self) -> u64 {
        self.fill_stub
    }

    /// Mask of pc bits that make an address bypass the table.
    pub fn invalid_mask(&self) -> u64 {
        self.invalid_mask
    }

    pub fn is_valid(&self, pc: u64) -> bool {
        pc & self.invalid_mask == 0
    }

    fn fill_address(&self, depth: usize) -> u64 {
        slots_address(&self.fill_levels[depth])
    }

    fn is_fill(&self, depth: usize, address: u64) -> bool {
        address == self.fill_address(depth)
    }

    /// Host entry for `pc`, or `None` when the slot still holds the fill stub.
    pub fn lookup(&self, pc: u64) -> Option<u64> {
        let slot = self.find_slot(pc)?;
        let value = slot.load(Ordering::Acquire);
        (value != self.fill_stub).then_some(value)
    }

    /// Leaf slot for `pc` if every level above it exists.
    fn find_slot(&self, pc: u64) -> Option<&AtomicU64> {
        if !self.is_valid(pc) {
            return None;
        }
        let mut slots: *const AtomicU64 = self.root.as_ptr();
        for (depth, level) in self.levels.iter().enumerate() {
            let slot = unsafe { &*slots.add(level.index(pc)) };
            if depth + 1 == self.levels.len() {
                return Some(slot);
            }
            let next = slot.load(Ordering::Acquire);
            if self.is_fill(depth + 1, next) {
                return None;
            }
            slots = next as *const AtomicU64;
        }
        None
    }

    /// Leaf slot for `pc`, materializing levels on the way. `None` for unrepresentable pcs.
    pub fn ensure_slot(&self, pc: u64) -> Option<&AtomicU64> {
        if !self.is_valid(pc) {
            return None;
        }
        let mut slots: *const AtomicU64 = self.root.as_ptr();
        for (depth, level) in self.levels.iter().enumerate() {
            let slot = unsafe { &*slots.add(level.index(pc)) };
            if depth + 1 == self.levels.len() {
                return Some(slot);
            }
            let mut next = slot.load(Ordering::Acquire);
            if self.is_fill(depth + 1, next) {
                next = self.materialize(slot, depth + 1, next);
            }
            slots = next as *const AtomicU64;
        }
        None
    }

    /// Replace a fill pointer in `parent` with a private copy of the fill level at `depth`.
    fn materialize(&self, parent: &AtomicU64, depth: usize, fill: u64) -> u64 {
        let template = &self.fill_levels[depth];
        let fresh: Slots = template
            .iter()
            .map(|s| AtomicU64::new(s.load(Ordering::Relaxed)))
            .collect();
        let address = slots_address(&fresh);

        // The lock keeps the level alive before it becomes reachable.
        let mut allocated = self.allocated.lock();
        match parent.compare_exchange(fill, address, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                allocated.push((depth, fresh));
                address
            }
            Err(current) => current,
        }
    }

    /// Publish `host` as the entry for `pc`. Returns false for unrepresentable pcs.
    pub fn set(&self, pc: u64, host: u64) -> bool {
        match self.ensure_slot(pc) {
            Some(slot) => {
                slot.store(host, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Point `pc` back at the fill stub.
    pub fn reset(&self, pc: u64) {
        if let Some(slot) = self.find_slot(pc) {
            slot.store(self.fill_stub, Ordering::Release);
        }
    }

    /// Reset every leaf slot.
    pub fn clear(&self) {
        let leaf = self.levels.len() - 1;
        let allocated = self.allocated.lock();
        for (_, slots) in allocated.iter().filter(|(depth, _)| *depth == leaf) {
            for slot in slots.iter() {
                slot.store(self.fill_stub, Ordering::Release);
            }
        }
    }

    /// Materialize the levels covering `[address, address + size)`.
    ///
    /// The range is clipped to the addresses the table can represent, and at most
    /// [`MAX_PREPARED_LEAVES`] leaf levels are materialized per call. Returns how many leaf
    /// spans were visited.
    pub fn prepare(&self, address: u64, size: u64) -> usize {
        let leaf = self.levels[self.levels.len() - 1];
        let leaf_span = 1u64 << (leaf.shift + leaf.bits);
        let top = self.levels[0];
        let limit = 1u64 << (top.shift + top.bits);
        let end = address.saturating_add(size).min(limit);

        let mut pc = address & !(leaf_span - 1);
        let mut visited = 0;
        while pc < end {
            if visited == MAX_PREPARED_LEAVES {
                log::warn!(
                    "Address table preparation of {address:#x}+{size:#x} stopped at {pc:#x}"
                );
                break;
            }
            // Slots are materialized per leaf level; the granule bits do not matter here.
            let aligned = pc.max(address) & !3;
            if self.ensure_slot(aligned).is_none() {
                break;
            }
            visited += 1;
            pc += leaf_span;
        }
        visited
    }

    /// Number of levels materialized below the root.
    pub fn allocated_levels(&self) -> usize {
        self.allocated.lock().len()
    }
}

impl std::fmt::Debug for AddressTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressTable")
            .field("levels", &self.levels.len())
            .field("allocated", &self.allocated_levels())
            .finish()
    }
}
