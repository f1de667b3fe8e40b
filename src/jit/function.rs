//! Translated guest functions.

use super::arena::CodeAllocation;
use crate::ir::optimizer::Tier;
use std::sync::atomic::{AtomicU64, Ordering};

/// Emitter output: position-independent host bytes and the guest byte length they cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledFunction {
    pub code: Vec<u8>,
    pub guest_size: u64,
}

/// A guest block's host code, installed in the code cache.
#[derive(Debug)]
pub struct TranslatedFunction {
    guest_address: u64,
    guest_size: u64,
    tier: Tier,
    code: CodeAllocation,
    /// Boxed so generated code can keep its address.
    call_counter: Box<AtomicU64>,
}

impl TranslatedFunction {
    pub fn new(
        guest_address: u64,
        guest_size: u64,
        tier: Tier,
        code: CodeAllocation,
        call_counter: Box<AtomicU64>,
    ) -> Self {
        Self {
            guest_address,
            guest_size,
            tier,
            code,
            call_counter,
        }
    }

    pub fn guest_address(&self) -> u64 {
        self.guest_address
    }

    pub fn guest_size(&self) -> u64 {
        self.guest_size
    }

    pub fn guest_end(&self) -> u64 {
        self.guest_address + self.guest_size
    }

    pub fn host_address(&self) -> u64 {
        self.code.host_address()
    }

    pub fn host_size(&self) -> usize {
        self.code.size()
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Entries counted by the fast-tier prologue.
    pub fn calls(&self) -> u64 {
        self.call_counter.load(Ordering::Relaxed)
    }

    /// Whether the guest range intersects `[address, address + size)`.
    pub fn overlaps(&self, address: u64, size: u64) -> bool {
        let end = address.saturating_add(size);
        self.guest_address < end && address < self.guest_end()
    }
}

/// Allocate the call counter of a function that is about to be compiled.
pub fn new_call_counter() -> Box<AtomicU64> {
    Box::new(AtomicU64::new(0))
}

/// Address of a call counter as embedded in generated code.
pub fn counter_address(counter: &AtomicU64) -> u64 {
    counter as *const AtomicU64 as u64
}
