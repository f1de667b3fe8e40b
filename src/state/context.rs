// Guest register state lives in a #[repr(C)] NativeContext whose address generated code keeps
// in r15; every context access in host code is a fixed displacement from that register, and
// the displacements are computed here with memoffset so the layout has a single source of
// truth. The record is heap allocated behind an Arc so InterruptHandle clones held by other
// threads can reach the three atomic fields while the executing thread owns the rest. Plain
// fields are only touched by the executing thread (generated code or host accessors) and are
// always reached through raw-pointer field projections, never through a reference to the
// whole record.

//! Guest execution context.

use super::callbacks::{CounterSource, ExceptionCallbacks};
use crate::decoder::ExecutionMode;
use crate::ir::{ContextField, Flag, GuestReg};
use bitflags::bitflags;
use memoffset::offset_of;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Guest register file as laid out for generated code.
#[repr(C)]
#[derive(Debug)]
pub struct NativeContext {
    /// X0-X30 and SP in A64; R0-R14 in the low halves in A32.
    pub x: [u64; 32],
    pub v: [u128; 32],
    /// N, Z, C and V, each 0 or 1.
    pub nzcv: [u32; 4],
    pub fpcr: u64,
    pub fpsr: u64,
    pub tpidr_el0: u64,
    pub tpidrro_el0: u64,
    pub pc: u64,
    pub running: AtomicU32,
    pub interrupt: AtomicU32,
    pub sync_counter: AtomicI32,
}

impl Default for NativeContext {
    fn default() -> Self {
        Self {
            x: [0; 32],
            v: [0; 32],
            nzcv: [0; 4],
            fpcr: 0,
            fpsr: 0,
            tpidr_el0: 0,
            tpidrro_el0: 0,
            pc: 0,
            running: AtomicU32::new(0),
            interrupt: AtomicU32::new(0),
            sync_counter: AtomicI32::new(0),
        }
    }
}

impl NativeContext {
    pub fn pc_offset() -> i32 {
        offset_of!(NativeContext, pc) as i32
    }

    pub fn interrupt_offset() -> i32 {
        offset_of!(NativeContext, interrupt) as i32
    }

    pub fn sync_counter_offset() -> i32 {
        offset_of!(NativeContext, sync_counter) as i32
    }

    /// Byte offset of a context field from the start of the record.
    pub fn field_offset(field: ContextField) -> i32 {
        let offset = match field {
            ContextField::Register(GuestReg::Gpr(n)) => {
                offset_of!(NativeContext, x) + 8 * (n as usize & 31)
            }
            ContextField::Register(GuestReg::Flag(flag)) => {
                offset_of!(NativeContext, nzcv) + 4 * flag.index()
            }
            ContextField::Pc => offset_of!(NativeContext, pc),
            ContextField::Running => offset_of!(NativeContext, running),
            ContextField::TpidrEl0 => offset_of!(NativeContext, tpidr_el0),
            ContextField::TpidrroEl0 => offset_of!(NativeContext, tpidrro_el0),
            ContextField::Fpcr => offset_of!(NativeContext, fpcr),
            ContextField::Fpsr => offset_of!(NativeContext, fpsr),
        };
        offset as i32
    }

    /// Storage width of a context field in bytes.
    pub fn field_size(field: ContextField) -> u32 {
        match field {
            ContextField::Register(GuestReg::Flag(_)) | ContextField::Running => 4,
            _ => 8,
        }
    }
}

pub(crate) struct NativeCell(UnsafeCell<NativeContext>);

// Only the atomic fields are accessed from threads other than the executing one.
unsafe impl Send for NativeCell {}
unsafe impl Sync for NativeCell {}

impl NativeCell {
    fn running(&self) -> &AtomicU32 {
        unsafe { &(*self.0.get()).running }
    }

    fn interrupt(&self) -> &AtomicU32 {
        unsafe { &(*self.0.get()).interrupt }
    }

    fn request_stop(&self) {
        self.running().store(0, Ordering::SeqCst);
        self.interrupt().store(1, Ordering::SeqCst);
    }
}

bitflags! {
    /// Condition flags in PSTATE/CPSR bit positions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Pstate: u32 {
        const N = 1 << 31;
        const Z = 1 << 30;
        const C = 1 << 29;
        const V = 1 << 28;
    }
}

/// Cross-thread handle for interrupting or stopping a running context.
#[derive(Clone)]
pub struct InterruptHandle {
    native: Arc<NativeCell>,
}

impl InterruptHandle {
    /// Ask the executing thread to run the interrupt callback at its next synchronization point.
    pub fn request_interrupt(&self) {
        self.native.interrupt().store(1, Ordering::SeqCst);
    }

    /// Stop execution at the next synchronization point.
    pub fn stop(&self) {
        self.native.request_stop();
    }

    pub fn is_running(&self) -> bool {
        self.native.running().load(Ordering::SeqCst) != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Guest,
    Host,
}

/// Splits wall time of an execution between guest code and host callbacks.
#[derive(Debug, Default)]
pub struct ProfilingTimer {
    guest: Duration,
    host: Duration,
    current: Option<(Phase, Instant)>,
}

impl ProfilingTimer {
    fn switch(&mut self, next: Option<Phase>) {
        let now = Instant::now();
        if let Some((phase, since)) = self.current.take() {
            match phase {
                Phase::Guest => self.guest += now - since,
                Phase::Host => self.host += now - since,
            }
        }
        self.current = next.map(|phase| (phase, now));
    }

    /// Begin accounting guest time.
    pub fn start(&mut self) {
        self.switch(Some(Phase::Guest));
    }

    /// Account time to the host until [`resume`](Self::resume).
    pub fn pause(&mut self) {
        if self.current.is_some() {
            self.switch(Some(Phase::Host));
        }
    }

    pub fn resume(&mut self) {
        if self.current.is_some() {
            self.switch(Some(Phase::Guest));
        }
    }

    pub fn stop(&mut self) {
        self.switch(None);
    }

    pub fn guest_time(&self) -> Duration {
        self.guest
    }

    pub fn host_time(&self) -> Duration {
        self.host
    }
}

/// One guest hardware thread.
pub struct ExecutionContext {
    native: Arc<NativeCell>,
    mode: ExecutionMode,
    callbacks: Arc<dyn ExceptionCallbacks>,
    counter: Arc<dyn CounterSource>,
    timer: ProfilingTimer,
    sync_interval: i32,
}

impl ExecutionContext {
    pub fn new(
        mode: ExecutionMode,
        counter: Arc<dyn CounterSource>,
        callbacks: Arc<dyn ExceptionCallbacks>,
        sync_interval: u32,
    ) -> Self {
        Self {
            native: Arc::new(NativeCell(UnsafeCell::new(NativeContext::default()))),
            mode,
            callbacks,
            counter,
            timer: ProfilingTimer::default(),
            sync_interval: sync_interval.clamp(1, i32::MAX as u32) as i32,
        }
    }

    fn raw(&self) -> *mut NativeContext {
        self.native.0.get()
    }

    pub(crate) fn native_ptr(&mut self) -> *mut NativeContext {
        self.raw()
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// X register (A64) or zero-extended R register (A32). Index 31 is SP.
    pub fn x(&self, n: usize) -> u64 {
        unsafe { (*self.raw()).x[n] }
    }

    pub fn set_x(&mut self, n: usize, value: u64) {
        let value = match self.mode {
            ExecutionMode::Aarch64 => value,
            ExecutionMode::Aarch32Arm => value & 0xffff_ffff,
        };
        unsafe { (*self.raw()).x[n] = value }
    }

    /// Low 32 bits of a register.
    pub fn w(&self, n: usize) -> u32 {
        self.x(n) as u32
    }

    /// Write a 32-bit value, clearing the upper half.
    pub fn set_w(&mut self, n: usize, value: u32) {
        unsafe { (*self.raw()).x[n] = value as u64 }
    }

    fn sp_index(&self) -> usize {
        match self.mode {
            ExecutionMode::Aarch64 => 31,
            ExecutionMode::Aarch32Arm => crate::decoder::a32::SP as usize,
        }
    }

    pub fn sp(&self) -> u64 {
        self.x(self.sp_index())
    }

    pub fn set_sp(&mut self, value: u64) {
        let n = self.sp_index();
        self.set_x(n, value);
    }

    pub fn pc(&self) -> u64 {
        unsafe { (*self.raw()).pc }
    }

    pub fn set_pc(&mut self, value: u64) {
        unsafe { (*self.raw()).pc = value }
    }

    pub fn v(&self, n: usize) -> u128 {
        unsafe { (*self.raw()).v[n] }
    }

    pub fn set_v(&mut self, n: usize, value: u128) {
        unsafe { (*self.raw()).v[n] = value }
    }

    pub fn flag(&self, flag: Flag) -> bool {
        unsafe { (*self.raw()).nzcv[flag.index()] != 0 }
    }

    pub fn pstate(&self) -> Pstate {
        let mut pstate = Pstate::empty();
        for (flag, bit) in [
            (Flag::N, Pstate::N),
            (Flag::Z, Pstate::Z),
            (Flag::C, Pstate::C),
            (Flag::V, Pstate::V),
        ] {
            pstate.set(bit, self.flag(flag));
        }
        pstate
    }

    pub fn set_pstate(&mut self, pstate: Pstate) {
        let values = [
            pstate.contains(Pstate::N),
            pstate.contains(Pstate::Z),
            pstate.contains(Pstate::C),
            pstate.contains(Pstate::V),
        ];
        for (index, value) in values.into_iter().enumerate() {
            unsafe { (*self.raw()).nzcv[index] = value as u32 }
        }
    }

    pub fn tpidr_el0(&self) -> u64 {
        unsafe { (*self.raw()).tpidr_el0 }
    }

    pub fn set_tpidr_el0(&mut self, value: u64) {
        unsafe { (*self.raw()).tpidr_el0 = value }
    }

    pub fn tpidrro_el0(&self) -> u64 {
        unsafe { (*self.raw()).tpidrro_el0 }
    }

    pub fn set_tpidrro_el0(&mut self, value: u64) {
        unsafe { (*self.raw()).tpidrro_el0 = value }
    }

    pub fn fpcr(&self) -> u64 {
        unsafe { (*self.raw()).fpcr }
    }

    pub fn set_fpcr(&mut self, value: u64) {
        unsafe { (*self.raw()).fpcr = value }
    }

    pub fn fpsr(&self) -> u64 {
        unsafe { (*self.raw()).fpsr }
    }

    pub fn set_fpsr(&mut self, value: u64) {
        unsafe { (*self.raw()).fpsr = value }
    }

    pub fn is_running(&self) -> bool {
        self.native.running().load(Ordering::SeqCst) != 0
    }

    /// Stop execution once control returns to the dispatcher.
    pub fn stop(&mut self) {
        self.native.request_stop();
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            native: self.native.clone(),
        }
    }

    pub fn callbacks(&self) -> Arc<dyn ExceptionCallbacks> {
        self.callbacks.clone()
    }

    pub fn counter(&self) -> &dyn CounterSource {
        self.counter.as_ref()
    }

    pub fn timer(&self) -> &ProfilingTimer {
        &self.timer
    }

    pub(crate) fn timer_mut(&mut self) -> &mut ProfilingTimer {
        &mut self.timer
    }

    /// Mark running and rearm the synchronization counter.
    pub(crate) fn begin_run(&mut self) {
        self.native.running().store(1, Ordering::SeqCst);
        self.reset_sync_counter();
    }

    pub(crate) fn reset_sync_counter(&mut self) {
        unsafe { &(*self.raw()).sync_counter }.store(self.sync_interval, Ordering::Relaxed);
    }

    /// Clear a pending interrupt request, returning whether one was set.
    pub(crate) fn take_interrupt(&mut self) -> bool {
        self.native.interrupt().swap(0, Ordering::SeqCst) != 0
    }

    pub(crate) fn mark_stopped(&mut self) {
        self.native.running().store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::callbacks::InstantCounter;

    struct Ignore;

    impl ExceptionCallbacks for Ignore {
        fn supervisor_call(&self, _ctx: &mut ExecutionContext, _pc: u64, _imm: u32) {}
    }

    fn context(mode: ExecutionMode) -> ExecutionContext {
        ExecutionContext::new(
            mode,
            Arc::new(InstantCounter::default()),
            Arc::new(Ignore),
            16,
        )
    }

    #[test]
    fn test_field_offsets() {
        assert_eq!(
            NativeContext::field_offset(ContextField::Register(GuestReg::Gpr(0))),
            0
        );
        assert_eq!(
            NativeContext::field_offset(ContextField::Register(GuestReg::Gpr(31))),
            31 * 8
        );
        assert_eq!(offset_of!(NativeContext, v) % 16, 0);
        assert_eq!(
            NativeContext::field_offset(ContextField::Register(GuestReg::Flag(Flag::C))),
            offset_of!(NativeContext, nzcv) as i32 + 8
        );
        assert_eq!(
            NativeContext::field_offset(ContextField::Pc),
            NativeContext::pc_offset()
        );
    }

    #[test]
    fn test_register_accessors() {
        let mut ctx = context(ExecutionMode::Aarch64);
        ctx.set_x(3, 0x1234_5678_9abc_def0);
        assert_eq!(ctx.w(3), 0x9abc_def0);
        ctx.set_w(3, 7);
        assert_eq!(ctx.x(3), 7);
        ctx.set_sp(0x8000);
        assert_eq!(ctx.x(31), 0x8000);
        ctx.set_v(1, u128::MAX);
        assert_eq!(ctx.v(1), u128::MAX);

        let mut ctx = context(ExecutionMode::Aarch32Arm);
        ctx.set_x(0, u64::MAX);
        assert_eq!(ctx.x(0), 0xffff_ffff);
        ctx.set_sp(0x100);
        assert_eq!(ctx.x(13), 0x100);
    }

    #[test]
    fn test_pstate_round_trip() {
        let mut ctx = context(ExecutionMode::Aarch64);
        ctx.set_pstate(Pstate::N | Pstate::C);
        assert!(ctx.flag(Flag::N));
        assert!(!ctx.flag(Flag::Z));
        assert_eq!(ctx.pstate(), Pstate::N | Pstate::C);
    }

    #[test]
    fn test_interrupt_handle_from_other_thread() {
        let mut ctx = context(ExecutionMode::Aarch64);
        ctx.begin_run();
        assert!(ctx.is_running());

        let handle = ctx.interrupt_handle();
        std::thread::spawn(move || handle.stop()).join().unwrap();

        assert!(!ctx.is_running());
        assert!(ctx.take_interrupt());
        assert!(!ctx.take_interrupt());
    }

    #[test]
    fn test_profiling_timer_splits_time() {
        let mut timer = ProfilingTimer::default();
        timer.start();
        timer.pause();
        std::thread::sleep(Duration::from_millis(2));
        timer.resume();
        timer.stop();
        assert!(timer.host_time() >= Duration::from_millis(2));
    }
}
