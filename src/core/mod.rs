//! Core infrastructure shared by every stage of the translator.
//!
//! This module contains the error types, configuration, per-translation arena sessions
//! and the host register file used by the code generator.

pub mod config;
pub mod error;
pub mod register_file;
pub mod session;

pub use config::JitConfig;
pub use error::{CompileError, CompileResult, JitError, JitResult, MemoryError};
pub use register_file::{AsmReg, RegSet, RegisterFile};
pub use session::{SessionStats, TranslationSession};
