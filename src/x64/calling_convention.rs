// This module describes how translated code uses the host registers and stack under the
// System V AMD64 ABI. Generated functions are entered from the entry stub, never from
// arbitrary host code, so the convention is small: r15 holds the NativeContext pointer for
// the whole run, rax/rcx/rdx are scratch registers the lowering uses freely (rcx doubles as
// the shift count register), and the remaining general purpose registers are handed to the
// register allocator. Native interface calls follow System V: arguments in rdi and rsi,
// result in rax, and rsi/rdi/r8-r11 are clobbered, so the code generator flushes those before
// every call. Every IR local owns an 8-byte spill slot; FrameLayout places them above rsp
// and pads the frame so rsp is 16-byte aligned at call sites.

//! System V x86-64 register roles and frame layout for generated code.

use super::encoder::regs::*;
use crate::core::register_file::{AsmReg, RegSet};

/// Register holding the guest context pointer.
pub const CONTEXT_REG: AsmReg = R15;

/// Scratch registers never handed to the allocator.
pub const SCRATCH_REGS: [AsmReg; 3] = [RAX, RCX, RDX];

/// Integer argument registers, in order.
pub const ARG_REGS: [AsmReg; 6] = [RDI, RSI, RDX, RCX, R8, R9];

pub const RETURN_REG: AsmReg = RAX;

/// Registers available to the allocator.
pub const ALLOCATABLE_REGS: [AsmReg; 11] = [RBX, RBP, R12, R13, R14, RSI, RDI, R8, R9, R10, R11];

/// Callee-saved registers the entry stub preserves for its host caller.
pub const CALLEE_SAVED_REGS: [AsmReg; 6] = [RBX, RBP, R12, R13, R14, R15];

/// Allocatable registers a native call may clobber.
pub const CALLER_SAVED_ALLOCATABLE: [AsmReg; 6] = [RSI, RDI, R8, R9, R10, R11];

pub fn allocatable_set() -> RegSet {
    RegSet::from_regs(&ALLOCATABLE_REGS)
}

pub fn caller_saved_set() -> RegSet {
    RegSet::from_regs(&CALLER_SAVED_ALLOCATABLE)
}

/// Stack frame of a generated function.
///
/// On entry rsp is 8 mod 16 (the entry stub's return address is on top). The frame holds one
/// slot per local at `[rsp + 8 * local]` and is sized so rsp is 16-byte aligned afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    locals: u32,
    size: u32,
}

impl FrameLayout {
    pub fn new(locals: u32) -> Self {
        let slots = (locals * 8).div_ceil(16) * 16;
        Self {
            locals,
            size: slots + 8,
        }
    }

    /// Bytes subtracted from rsp by the prologue.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn locals(&self) -> u32 {
        self.locals
    }

    /// rsp-relative offset of a local's spill slot.
    pub fn slot_offset(&self, local: u32) -> i32 {
        debug_assert!(local < self.locals);
        (local * 8) as i32
    }
}
