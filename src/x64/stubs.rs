//! Runtime stubs shared by all generated functions.
//!
//! * entry: `extern "sysv64" fn(*mut NativeContext, host_target) -> next_pc`. Saves the
//!   callee-saved registers, loads r15 with the context and calls the target. Generated code
//!   returns to it with the next guest pc in rax.
//! * exit: returns to the entry stub with the pc stored in the context.
//! * fill: the leaf value of every untranslated table slot. Asks the translator for the pc in
//!   the context and jumps to the result (which is the exit stub when translation failed).

use super::calling_convention::{CALLEE_SAVED_REGS, CONTEXT_REG};
use super::encoder::{regs::*, AluOp, EncodeResult, Width, X64Encoder};
use crate::core::error::JitResult;
use crate::ir::Type;
use crate::jit::arena::{CodeAllocation, ExecutableArena};
use crate::state::context::NativeContext;
use crate::state::native_interface;
use std::sync::Arc;

/// Signature of the entry stub.
pub type EntryFn = unsafe extern "sysv64" fn(*mut NativeContext, u64) -> u64;

pub fn emit_entry() -> EncodeResult<Vec<u8>> {
    let mut enc = X64Encoder::new()?;
    for reg in CALLEE_SAVED_REGS {
        enc.push(reg)?;
    }
    enc.mov_rr(Type::I64, CONTEXT_REG, RDI)?;
    enc.alu_ri(AluOp::Sub, Type::I64, RSP, 8)?;
    enc.call_reg(RSI)?;
    enc.alu_ri(AluOp::Add, Type::I64, RSP, 8)?;
    for reg in CALLEE_SAVED_REGS.iter().rev() {
        enc.pop(*reg)?;
    }
    enc.ret()?;
    enc.finalize()
}

pub fn emit_exit() -> EncodeResult<Vec<u8>> {
    let mut enc = X64Encoder::new()?;
    enc.load(Width::B64, RAX, CONTEXT_REG, NativeContext::pc_offset())?;
    enc.ret()?;
    enc.finalize()
}

pub fn emit_fill(get_function_address: u64) -> EncodeResult<Vec<u8>> {
    let mut enc = X64Encoder::new()?;
    enc.load(Width::B64, RDI, CONTEXT_REG, NativeContext::pc_offset())?;
    enc.alu_ri(AluOp::Sub, Type::I64, RSP, 8)?;
    enc.mov_ri(RAX, get_function_address)?;
    enc.call_reg(RAX)?;
    enc.alu_ri(AluOp::Add, Type::I64, RSP, 8)?;
    enc.jmp_reg(RAX)?;
    enc.finalize()
}

/// The three stubs, placed in the arena.
#[derive(Debug)]
pub struct RuntimeStubs {
    entry: CodeAllocation,
    exit: CodeAllocation,
    fill: CodeAllocation,
}

impl RuntimeStubs {
    pub fn new(arena: &Arc<ExecutableArena>) -> JitResult<Self> {
        let get_function_address = native_interface::get_function_address as usize as u64;
        let entry = arena.allocate(&emit_entry().map_err(crate::core::error::CompileError::from)?)?;
        let exit = arena.allocate(&emit_exit().map_err(crate::core::error::CompileError::from)?)?;
        let fill = arena.allocate(
            &emit_fill(get_function_address).map_err(crate::core::error::CompileError::from)?,
        )?;
        log::debug!(
            "Runtime stubs: entry {:#x}, exit {:#x}, fill {:#x}",
            entry.host_address(),
            exit.host_address(),
            fill.host_address()
        );
        Ok(Self { entry, exit, fill })
    }

    pub fn entry(&self) -> EntryFn {
        unsafe { std::mem::transmute::<usize, EntryFn>(self.entry.host_address() as usize) }
    }

    pub fn exit_address(&self) -> u64 {
        self.exit.host_address()
    }

    pub fn fill_address(&self) -> u64 {
        self.fill.host_address()
    }
}
