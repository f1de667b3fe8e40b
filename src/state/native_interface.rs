// Generated code cannot carry Rust references, so everything it needs from the host goes
// through the extern "sysv64" entry points in this module. The dispatcher registers the running
// ExecutionContext and its Translator in a thread-local slot before entering generated code and
// restores the previous registration when the guard drops, so nested or sequential runs on one
// thread each see their own state. Entry points never unwind into generated code: failures are
// recorded in the registration, the context is marked not running, and the halt check that
// follows every native call leaves the function. A call with no registration is a host bug and
// panics, which aborts because the panic cannot cross the extern boundary.

//! Call bridge between generated code and the host.

use super::context::ExecutionContext;
use super::memory::{MemoryManager, MemoryManagerExt};
use crate::core::error::JitError;
use crate::decoder::MemSize;
use crate::jit::translator::Translator;
use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr::NonNull;

/// Size of the line invalidated by `IC IVAU`.
pub const CACHE_LINE_SIZE: u64 = 64;

struct Registration {
    context: *mut ExecutionContext,
    translator: *const Translator,
    pending_error: Option<JitError>,
}

impl Registration {
    fn context(&mut self) -> &mut ExecutionContext {
        unsafe { &mut *self.context }
    }

    fn translator(&self) -> &Translator {
        unsafe { &*self.translator }
    }

    fn memory(&self) -> &dyn MemoryManager {
        self.translator().memory()
    }

    /// Record a failure and stop the context. The first failure wins.
    fn fail(&mut self, error: JitError) {
        log::debug!("Native call failed: {error}");
        if self.pending_error.is_none() {
            self.pending_error = Some(error);
        }
        self.context().mark_stopped();
    }
}

thread_local! {
    static CURRENT: Cell<Option<NonNull<Registration>>> = const { Cell::new(None) };
}

/// Keeps a context registered on the current thread; restores the previous one on drop.
pub struct RegistrationGuard<'a> {
    registration: NonNull<Registration>,
    previous: Option<NonNull<Registration>>,
    _borrow: PhantomData<(&'a mut ExecutionContext, &'a Translator)>,
}

/// Register `context` and `translator` for native calls made on this thread.
pub fn register<'a>(
    context: &'a mut ExecutionContext,
    translator: &'a Translator,
) -> RegistrationGuard<'a> {
    let registration = Box::new(Registration {
        context,
        translator,
        pending_error: None,
    });
    let registration = NonNull::from(Box::leak(registration));
    let previous = CURRENT.with(|current| current.replace(Some(registration)));
    RegistrationGuard {
        registration,
        previous,
        _borrow: PhantomData,
    }
}

impl RegistrationGuard<'_> {
    /// The registered context.
    pub fn context(&mut self) -> &mut ExecutionContext {
        unsafe { (*self.registration.as_ptr()).context() }
    }

    pub fn take_error(&mut self) -> Option<JitError> {
        unsafe { (*self.registration.as_ptr()).pending_error.take() }
    }

    pub fn has_error(&self) -> bool {
        unsafe { (*self.registration.as_ptr()).pending_error.is_some() }
    }
}

impl Drop for RegistrationGuard<'_> {
    fn drop(&mut self) {
        CURRENT.with(|current| current.set(self.previous));
        drop(unsafe { Box::from_raw(self.registration.as_ptr()) });
    }
}

/// Whether a context is registered on this thread.
pub fn is_registered() -> bool {
    CURRENT.with(|current| current.get().is_some())
}

fn with_registration<R>(f: impl FnOnce(&mut Registration) -> R) -> R {
    let Some(mut registration) = CURRENT.with(|current| current.get()) else {
        panic!("native interface called without a registered execution context");
    };
    f(unsafe { registration.as_mut() })
}

fn read_memory<T: bytemuck::Pod + Into<u64>>(address: u64) -> u64 {
    with_registration(|reg| {
        let size = std::mem::size_of::<T>() as u64;
        let result = reg
            .memory()
            .signal_memory_tracking(address, size, false)
            .and_then(|()| reg.memory().read_guest::<T>(address));
        match result {
            Ok(value) => value.into(),
            Err(error) => {
                reg.fail(error.into());
                0
            }
        }
    })
}

fn write_memory<T: bytemuck::Pod>(address: u64, value: T) {
    with_registration(|reg| {
        let size = std::mem::size_of::<T>() as u64;
        let result = reg
            .memory()
            .signal_memory_tracking(address, size, true)
            .and_then(|()| reg.memory().write_guest(address, value));
        if let Err(error) = result {
            reg.fail(error.into());
        }
    })
}

pub extern "sysv64" fn read_memory_8(address: u64) -> u64 {
    read_memory::<u8>(address)
}

pub extern "sysv64" fn read_memory_16(address: u64) -> u64 {
    read_memory::<u16>(address)
}

pub extern "sysv64" fn read_memory_32(address: u64) -> u64 {
    read_memory::<u32>(address)
}

pub extern "sysv64" fn read_memory_64(address: u64) -> u64 {
    read_memory::<u64>(address)
}

pub extern "sysv64" fn write_memory_8(address: u64, value: u64) {
    write_memory(address, value as u8)
}

pub extern "sysv64" fn write_memory_16(address: u64, value: u64) {
    write_memory(address, value as u16)
}

pub extern "sysv64" fn write_memory_32(address: u64, value: u64) {
    write_memory(address, value as u32)
}

pub extern "sysv64" fn write_memory_64(address: u64, value: u64) {
    write_memory(address, value)
}

pub extern "sysv64" fn read_counter() -> u64 {
    with_registration(|reg| reg.context().counter().counter())
}

pub extern "sysv64" fn read_frequency() -> u64 {
    with_registration(|reg| reg.context().counter().frequency())
}

/// Run a host callback with the profiling timer paused.
fn host_callback(f: impl FnOnce(&mut ExecutionContext)) {
    with_registration(|reg| {
        let context = reg.context();
        context.timer_mut().pause();
        f(context);
        context.timer_mut().resume();
    })
}

pub extern "sysv64" fn supervisor_call(pc: u64, imm: u64) {
    host_callback(|context| {
        log::trace!("SVC #{imm:#x} at {pc:#x}");
        context.callbacks().supervisor_call(context, pc, imm as u32);
    })
}

pub extern "sysv64" fn breakpoint(pc: u64, imm: u64) {
    host_callback(|context| context.callbacks().breakpoint(context, pc, imm as u32))
}

pub extern "sysv64" fn undefined_instruction(pc: u64, opcode: u64) {
    host_callback(|context| {
        log::warn!("Undefined instruction {opcode:#010x} at {pc:#x}");
        context.callbacks().undefined(context, pc, opcode as u32);
    })
}

/// Slow path of the dispatch check. Returns 1 to keep running, 0 to stop.
pub extern "sysv64" fn check_synchronization() -> u64 {
    with_registration(|reg| {
        let context = reg.context();
        context.reset_sync_counter();
        if context.take_interrupt() && context.is_running() {
            let callbacks = context.callbacks();
            context.timer_mut().pause();
            callbacks.interrupt(context);
            context.timer_mut().resume();
        }
        context.is_running() as u64
    })
}

/// Host entry for `pc`, translating it if needed. On failure, the exit stub.
pub extern "sysv64" fn get_function_address(pc: u64) -> u64 {
    with_registration(|reg| match reg.translator().resolve_host(pc) {
        Ok(host) => host,
        Err(error) => {
            log::error!("Translation of {pc:#x} failed: {error}");
            let exit = reg.translator().exit_stub();
            reg.fail(error);
            exit
        }
    })
}

pub extern "sysv64" fn enqueue_for_rejit(address: u64) {
    with_registration(|reg| reg.translator().enqueue_rejit(address))
}

pub extern "sysv64" fn invalidate_cache_line(address: u64) {
    with_registration(|reg| {
        reg.translator()
            .invalidate_region(address & !(CACHE_LINE_SIZE - 1), CACHE_LINE_SIZE);
    })
}

/// Address of the read entry point for `size`.
pub fn read_memory_entry(size: MemSize) -> u64 {
    let f: extern "sysv64" fn(u64) -> u64 = match size {
        MemSize::Byte => read_memory_8,
        MemSize::Half => read_memory_16,
        MemSize::Word => read_memory_32,
        MemSize::Double => read_memory_64,
    };
    f as usize as u64
}

/// Address of the write entry point for `size`.
pub fn write_memory_entry(size: MemSize) -> u64 {
    let f: extern "sysv64" fn(u64, u64) = match size {
        MemSize::Byte => write_memory_8,
        MemSize::Half => write_memory_16,
        MemSize::Word => write_memory_32,
        MemSize::Double => write_memory_64,
    };
    f as usize as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::JitConfig;
    use crate::core::error::MemoryError;
    use crate::decoder::ExecutionMode;
    use crate::state::callbacks::{ExceptionCallbacks, InstantCounter};
    use crate::state::memory::FlatMemory;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        svcs: AtomicU32,
    }

    impl ExceptionCallbacks for Recorder {
        fn supervisor_call(&self, ctx: &mut ExecutionContext, _pc: u64, imm: u32) {
            self.svcs.fetch_add(1, Ordering::SeqCst);
            ctx.set_x(0, imm as u64);
        }
    }

    fn setup() -> (Arc<FlatMemory>, Translator, ExecutionContext, Arc<Recorder>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let memory = Arc::new(FlatMemory::new());
        memory.map(0x1000, 0x1000, true);
        let config = JitConfig::new(ExecutionMode::Aarch64).with_arena_size(1 << 16);
        let translator = Translator::new(config, memory.clone()).unwrap();
        let recorder = Arc::new(Recorder::default());
        let context = ExecutionContext::new(
            ExecutionMode::Aarch64,
            Arc::new(InstantCounter::default()),
            recorder.clone(),
            16,
        );
        (memory, translator, context, recorder)
    }

    #[test]
    #[should_panic(expected = "without a registered execution context")]
    fn test_unregistered_call_panics() {
        with_registration(|_| ());
    }

    #[test]
    fn test_memory_round_trip_and_fault() {
        let (_memory, translator, mut context, _) = setup();
        let mut guard = register(&mut context, &translator);
        guard.context().begin_run();

        write_memory_32(0x1010, 0xdead_beef);
        assert_eq!(read_memory_32(0x1010), 0xdead_beef);
        assert_eq!(read_memory_8(0x1013), 0xde);
        assert!(!guard.has_error());

        assert_eq!(read_memory_64(0x9000), 0);
        assert!(!guard.context().is_running());
        match guard.take_error() {
            Some(JitError::MemoryFault(MemoryError::Unmapped { address, .. })) => {
                assert_eq!(address, 0x9000)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_callbacks_reach_context() {
        let (_memory, translator, mut context, recorder) = setup();
        {
            let mut guard = register(&mut context, &translator);
            guard.context().begin_run();
            supervisor_call(0x1000, 42);
            assert_eq!(guard.context().x(0), 42);
            // Default breakpoint handling stops the context.
            breakpoint(0x1004, 0);
            assert!(!guard.context().is_running());
        }
        assert_eq!(recorder.svcs.load(Ordering::SeqCst), 1);
        assert!(!is_registered());
    }

    #[test]
    fn test_registration_nests() {
        let (_memory, translator, mut outer, _) = setup();
        let (_m2, translator2, mut inner, _) = setup();
        let mut outer_guard = register(&mut outer, &translator);
        outer_guard.context().set_x(1, 1);
        {
            let mut inner_guard = register(&mut inner, &translator2);
            inner_guard.context().begin_run();
            supervisor_call(0, 7);
            assert_eq!(inner_guard.context().x(0), 7);
        }
        assert!(is_registered());
        supervisor_call(0, 9);
        assert_eq!(outer_guard.context().x(0), 9);
    }

    #[test]
    fn test_check_synchronization_handles_stop() {
        let (_memory, translator, mut context, _) = setup();
        let handle = context.interrupt_handle();
        let mut guard = register(&mut context, &translator);
        guard.context().begin_run();
        assert_eq!(check_synchronization(), 1);
        handle.request_interrupt();
        assert_eq!(check_synchronization(), 1);
        handle.stop();
        assert_eq!(check_synchronization(), 0);
    }
}
