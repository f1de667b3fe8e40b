//! Host hooks consumed by the execution engine.

use super::context::ExecutionContext;
use std::time::Instant;

/// Host handlers for guest exceptions.
///
/// Every handler runs on the thread executing the guest, with the profiling timer paused.
/// A handler may modify guest registers through the context and may stop execution with
/// [`ExecutionContext::stop`].
pub trait ExceptionCallbacks: Send + Sync {
    /// SVC with its immediate; `pc` is the address of the SVC instruction.
    fn supervisor_call(&self, ctx: &mut ExecutionContext, pc: u64, imm: u32);

    /// BRK/BKPT with its immediate.
    fn breakpoint(&self, ctx: &mut ExecutionContext, pc: u64, imm: u32) {
        log::debug!("breakpoint #{imm:#x} at {pc:#x}");
        ctx.stop();
    }

    /// An instruction the decoder does not support.
    fn undefined(&self, ctx: &mut ExecutionContext, pc: u64, opcode: u32) {
        log::warn!("undefined instruction {opcode:#010x} at {pc:#x}");
        ctx.stop();
    }

    /// Raised at the next synchronization point after an interrupt request.
    fn interrupt(&self, _ctx: &mut ExecutionContext) {}
}

/// Source of the guest generic timer.
pub trait CounterSource: Send + Sync {
    /// Ticks per second.
    fn frequency(&self) -> u64;
    fn counter(&self) -> u64;
}

/// Counter derived from the host monotonic clock.
pub struct InstantCounter {
    start: Instant,
    frequency: u64,
}

impl InstantCounter {
    pub const DEFAULT_FREQUENCY: u64 = 19_200_000;

    pub fn new(frequency: u64) -> Self {
        Self {
            start: Instant::now(),
            frequency: frequency.max(1),
        }
    }
}

impl Default for InstantCounter {
    fn default() -> Self {
        Self::new(Self::DEFAULT_FREQUENCY)
    }
}

impl CounterSource for InstantCounter {
    fn frequency(&self) -> u64 {
        self.frequency
    }

    fn counter(&self) -> u64 {
        let nanos = self.start.elapsed().as_nanos();
        (nanos * self.frequency as u128 / 1_000_000_000) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instant_counter_is_monotonic() {
        let counter = InstantCounter::new(1_000_000_000);
        let a = counter.counter();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = counter.counter();
        assert!(b > a);
        assert_eq!(counter.frequency(), 1_000_000_000);
    }
}
