// This module provides arena-based translation session management using the bumpalo crate.
// TranslationSession owns a reference to the per-translation bump arena that backs every IR
// operand, operation, use-list and block of one guest function, so tearing down a translation
// is a matter of dropping the arena. The session also records per-translation statistics
// (guest instructions decoded, IR operations before and after optimization, optimizer rounds,
// spill stores, emitted host bytes) which the translator folds into its global counters and
// prints at trace level.

//! Arena-based translation session management.
//!
//! All IR objects of one translation share the session lifetime.

use bumpalo::Bump;
use std::cell::RefCell;
use std::fmt;

/// Arena-based translation session.
pub struct TranslationSession<'arena> {
    /// Arena allocator for IR objects.
    arena: &'arena Bump,

    /// Counters folded into the translator statistics.
    stats: RefCell<SessionStats>,
}

impl<'arena> TranslationSession<'arena> {
    /// Create a new translation session with the given arena.
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
        }
    }

    /// Bump arena backing the IR of this translation.
    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Move `value` into the arena.
    pub fn alloc<T>(&self, value: T) -> &'arena mut T {
        self.arena.alloc(value)
    }

    /// Record the decoded guest block.
    pub fn record_guest_block(&self, instructions: usize, guest_bytes: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.guest_instructions += instructions;
        stats.guest_bytes += guest_bytes;
    }

    /// Record the IR size before optimization.
    pub fn record_ir_built(&self, operations: usize) {
        self.stats.borrow_mut().ir_operations_built += operations;
    }

    /// Record one optimizer round and the IR size after it.
    pub fn record_optimizer_round(&self, operations: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.optimizer_rounds += 1;
        stats.ir_operations_optimized = operations;
    }

    /// Record a copy inserted for a phi operand.
    pub fn record_phi_copy(&self) {
        self.stats.borrow_mut().phi_copies += 1;
    }

    /// Record a spill store emitted by the register allocator.
    pub fn record_spill_store(&self) {
        self.stats.borrow_mut().spill_stores += 1;
    }

    /// Record a native interface call emitted.
    pub fn record_native_call(&self) {
        self.stats.borrow_mut().native_calls += 1;
    }

    /// Record the final host code size.
    pub fn record_host_code(&self, bytes: usize) {
        self.stats.borrow_mut().host_bytes += bytes;
    }

    /// Get translation statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Translation session statistics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionStats {
    /// Guest instructions decoded.
    pub guest_instructions: usize,

    /// Guest bytes covered.
    pub guest_bytes: usize,

    /// IR operations emitted by the guest-to-IR translation.
    pub ir_operations_built: usize,

    /// IR operations left after the last optimizer round.
    pub ir_operations_optimized: usize,

    /// Optimizer rounds executed.
    pub optimizer_rounds: usize,

    /// Phi copies.
    pub phi_copies: usize,

    /// Spill stores emitted by the register allocator.
    pub spill_stores: usize,

    /// Native interface calls emitted.
    pub native_calls: usize,

    /// Host code bytes emitted.
    pub host_bytes: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Translation Session Statistics:")?;
        writeln!(
            f,
            "  Guest instructions: {} ({} bytes)",
            self.guest_instructions, self.guest_bytes
        )?;
        writeln!(
            f,
            "  IR operations: {} built, {} after {} optimizer rounds",
            self.ir_operations_built, self.ir_operations_optimized, self.optimizer_rounds
        )?;
        writeln!(f, "  Phi copies: {}", self.phi_copies)?;
        writeln!(f, "  Spill stores: {}", self.spill_stores)?;
        writeln!(f, "  Native calls: {}", self.native_calls)?;
        writeln!(f, "  Host code size: {} bytes", self.host_bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translation_session_creation() {
        let arena = Bump::new();
        let session = TranslationSession::new(&arena);

        let stats = session.stats();
        assert_eq!(stats, SessionStats::default());
        assert_eq!(*session.alloc(42u32), 42);
    }

    #[test]
    fn test_session_statistics() {
        let arena = Bump::new();
        let session = TranslationSession::new(&arena);

        session.record_guest_block(2, 8);
        session.record_ir_built(12);
        session.record_optimizer_round(9);
        session.record_optimizer_round(7);
        session.record_phi_copy();
        session.record_spill_store();
        session.record_native_call();
        session.record_host_code(96);

        let stats = session.stats();
        assert_eq!(stats.guest_instructions, 2);
        assert_eq!(stats.guest_bytes, 8);
        assert_eq!(stats.ir_operations_built, 12);
        assert_eq!(stats.ir_operations_optimized, 7);
        assert_eq!(stats.optimizer_rounds, 2);
        assert_eq!(stats.spill_stores, 1);
        assert_eq!(stats.host_bytes, 96);
    }

    #[test]
    fn test_statistics_display() {
        let arena = Bump::new();
        let session = TranslationSession::new(&arena);
        session.record_guest_block(3, 12);
        session.record_host_code(40);

        let output = format!("{}", session.stats());
        assert!(output.contains("Guest instructions: 3 (12 bytes)"));
        assert!(output.contains("Host code size: 40 bytes"));
    }
}
