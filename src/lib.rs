//! armjit - ARM guest to x86-64 dynamic binary translation.
//!
//! armjit runs 64-bit (A64) and 32-bit (A32) ARM guest code on x86-64 hosts. Guest basic
//! blocks are decoded, lowered to an SSA IR, optimized and compiled to host code the first
//! time they run; translated blocks jump to each other through a shared address table.
//!
//! # Primary Usage
//!
//! ```ignore
//! use armjit::{CpuContext, ExecutionMode, FlatMemory, InstantCounter, JitConfig};
//! use std::sync::Arc;
//!
//! let memory = Arc::new(FlatMemory::new());
//! memory.map_with(0x1000, &image, false);
//!
//! let cpu = CpuContext::new(memory, JitConfig::new(ExecutionMode::Aarch64))?;
//! let mut context = cpu.create_context(Arc::new(InstantCounter::default()), callbacks);
//! cpu.execute(&mut context, 0x1000)?;
//! ```
//!
//! # Architecture
//!
//! - [`decoder`] - A64/A32 decoding and basic block discovery
//! - [`ir`] - SSA IR, dominance, liveness and the optimizer
//! - [`translate`] - guest instruction to IR lowering
//! - [`x64`] - host code generation and runtime stubs
//! - [`jit`] - executable arena, address table, code cache and translator
//! - [`state`] - guest register context, memory provider and the native call bridge
//! - [`core`] - errors, configuration, sessions and the host register file
//! - [`cpu`] - the embedding entry point

#[cfg(not(target_arch = "x86_64"))]
compile_error!("armjit generates x86-64 code and only builds for x86-64 hosts");

pub mod core;
pub mod cpu;
pub mod decoder;
pub mod ir;
pub mod jit;
pub mod state;
pub mod translate;
pub mod x64;

pub use crate::core::{CompileError, JitConfig, JitError, JitResult, MemoryError};
pub use cpu::CpuContext;
pub use decoder::ExecutionMode;
pub use jit::{Translator, TranslatorStats};
pub use state::{
    CounterSource, ExceptionCallbacks, ExecutionContext, FlatMemory, InstantCounter,
    InterruptHandle, MemoryEvent, MemoryEventHandler, MemoryManager, MemoryManagerExt, Pstate,
};
