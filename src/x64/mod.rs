//! x86-64 host backend.
//!
//! - [`encoder`]: instruction encoding on top of iced-x86
//! - [`calling_convention`]: register roles and frame layout
//! - [`codegen`]: IR lowering with block-local register allocation
//! - [`stubs`]: entry, exit and fill stubs shared by all generated code

pub mod calling_convention;
pub mod codegen;
pub mod encoder;
pub mod stubs;

pub use codegen::generate;
pub use encoder::{EncodingError, X64Encoder};
pub use stubs::{EntryFn, RuntimeStubs};
