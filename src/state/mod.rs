//! Guest-visible state: register context, memory provider interface, host callbacks and the
//! bridge generated code uses to call back into the host.

pub mod callbacks;
pub mod context;
pub mod memory;
pub mod native_interface;

pub use callbacks::{CounterSource, ExceptionCallbacks, InstantCounter};
pub use context::{ExecutionContext, InterruptHandle, NativeContext, ProfilingTimer, Pstate};
pub use memory::{
    FlatMemory, MemoryEvent, MemoryEventHandler, MemoryManager, MemoryManagerExt, PAGE_SIZE,
};
