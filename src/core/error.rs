// This module defines the error types shared by the translator using the thiserror crate for
// idiomatic Rust error handling. MemoryError is what a guest memory provider reports when an
// access cannot be satisfied. CompileError covers every failure of the translation pipeline:
// instruction fetch faults, malformed IR, register allocation and host encoding failures.
// JitError is the top-level error returned from the execution entry points; it wraps the other
// two and adds the runtime-only conditions (executable arena exhaustion, mapping failures).
// Expected outcomes such as an unknown guest encoding, a cache miss or a lost install race are
// never errors; they are ordinary values in the decoder and translator.

//! Error types for the translator and its runtime.
//!
//! Using thiserror for more idiomatic error handling.

use thiserror::Error;

use crate::core::register_file::RegAllocError;
use crate::x64::encoder::EncodingError;

/// Failure reported by a guest memory provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("guest address {address:#x} is not mapped ({size} bytes)")]
    Unmapped { address: u64, size: usize },

    #[error("guest address {address:#x} is not writable ({size} bytes)")]
    ReadOnly { address: u64, size: usize },
}

impl MemoryError {
    /// Guest address that faulted.
    pub fn address(&self) -> u64 {
        match self {
            MemoryError::Unmapped { address, .. } | MemoryError::ReadOnly { address, .. } => {
                *address
            }
        }
    }
}

/// Main error type for guest code translation.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("Instruction fetch failed at {address:#x}: {source}")]
    InstructionFetch {
        address: u64,
        #[source]
        source: MemoryError,
    },

    #[error("Invalid IR: {reason}")]
    InvalidIr { reason: String },

    #[error("Block layout error: {reason}")]
    BlockLayout { reason: String },

    #[error("Register allocation failed: {0}")]
    RegisterAllocation(#[from] RegAllocError),

    #[error("Code generation failed: {reason}")]
    CodeGeneration { reason: String },

    #[error("Host encoding failed: {0}")]
    Encoding(#[from] EncodingError),
}

/// Result type alias for translation operations.
pub type CompileResult<T> = Result<T, CompileError>;

/// Top-level error returned by the execution entry points.
#[derive(Error, Debug)]
pub enum JitError {
    #[error("guest memory fault: {0}")]
    MemoryFault(#[from] MemoryError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("executable arena exhausted: requested {requested} bytes, largest free range is {available} bytes")]
    ArenaExhausted { requested: usize, available: usize },

    #[error("failed to map executable memory: {0}")]
    ExecutableMapping(#[source] std::io::Error),
}

/// Result type alias for runtime operations.
pub type JitResult<T> = Result<T, JitError>;
