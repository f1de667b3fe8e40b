//! Runtime side of the translator.
//!
//! - [`arena`]: the executable memory generated code lives in
//! - [`address_table`]: guest pc to host entry lookup shared with generated code
//! - [`function`]: translated functions and their call counters
//! - [`cache`]: the concurrent code cache
//! - [`translator`]: the pipeline driver with invalidation and re-translation

pub mod address_table;
pub mod arena;
pub mod cache;
pub mod function;
pub mod translator;

pub use address_table::AddressTable;
pub use arena::{CodeAllocation, ExecutableArena};
pub use cache::{CodeCache, InstallOutcome};
pub use function::{CompiledFunction, TranslatedFunction};
pub use translator::{DispatchGuard, Translator, TranslatorStats};
