// Lowering of optimized, phi-free IR to x86-64. Registers are allocated per basic block with the
// RegisterFile: its state is reset at every block start, and every local owns an 8-byte stack
// slot. A local that is live out of its defining block is written through to its slot as soon
// as it is defined, so a block boundary never needs shuffling; other definitions stay dirty in
// their register and are stored only when the register is evicted or clobbered by a native
// call. Sources are locked for the duration of one operation, destinations get a fresh
// register. rax, rcx and rdx are never allocated and serve as scratch for fixed-register
// instruction forms, immediates that do not fit an encoding, and the inline dispatch sequence.
//
// Dispatch to another guest address first stores the pc into the context, then checks the
// interrupt flag and decrements the synchronization counter; the slow path calls into the
// host and returns to the dispatcher. The fast path jumps through the address table: a constant
// target jumps through its (materialized) leaf slot, a computed target walks the table inline.

//! x86-64 code generation for translated guest blocks.

use super::calling_convention::{
    allocatable_set, caller_saved_set, FrameLayout, ARG_REGS, CONTEXT_REG, RETURN_REG,
};
use super::encoder::{disassemble, regs::*, AluOp, CondCode, ShiftOp, Width, X64Encoder};
use crate::core::error::{CompileError, CompileResult};
use crate::core::register_file::{AsmReg, RegisterFile};
use crate::core::session::TranslationSession;
use crate::ir::liveness::{Liveness, LocalSet};
use crate::ir::{BlockId, Condition, Function, Instruction, OperandId, OperandKind, Operation, Type};
use crate::jit::address_table::AddressTable;
use crate::state::context::NativeContext;
use crate::state::native_interface;
use std::sync::atomic::AtomicU64;

/// An operand as seen by the lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Value {
    Reg(AsmReg),
    Imm(u64),
}

impl Value {
    /// The value as a sign-extended 32-bit immediate of a `ty` operation, if it fits.
    fn imm32(self, ty: Type) -> Option<i32> {
        match (self, ty) {
            (Value::Imm(v), Type::I32) => Some(v as u32 as i32),
            (Value::Imm(v), Type::I64) => i32::try_from(v as i64).ok(),
            (Value::Reg(_), _) => None,
        }
    }
}

fn cond_code(cond: Condition) -> CondCode {
    match cond {
        Condition::Eq => CondCode::E,
        Condition::Ne => CondCode::Ne,
        Condition::Ult => CondCode::B,
        Condition::Ule => CondCode::Be,
        Condition::Ugt => CondCode::A,
        Condition::Uge => CondCode::Ae,
        Condition::Slt => CondCode::L,
        Condition::Sle => CondCode::Le,
        Condition::Sgt => CondCode::G,
        Condition::Sge => CondCode::Ge,
    }
}

fn type_bytes(ty: Type) -> u32 {
    ty.bits() / 8
}

/// Generate position-independent host code for `func`.
pub fn generate(
    func: &Function<'_>,
    table: &AddressTable,
    session: &TranslationSession<'_>,
) -> CompileResult<Vec<u8>> {
    let mut generator = CodeGenerator {
        func,
        table,
        session,
        enc: X64Encoder::new()?,
        regs: RegisterFile::new(allocatable_set()),
        frame: FrameLayout::new(func.local_count()),
        liveness: Liveness::compute(func),
        dirty: LocalSet::new(func.local_count()),
        block: func.entry(),
        stale: None,
    };
    generator.emit_function()?;
    let code = generator.enc.finalize()?;

    session.record_host_code(code.len());
    if log::log_enabled!(log::Level::Trace) {
        log::trace!(
            "host code for {:#x} ({} bytes):\n{}",
            func.guest_address,
            code.len(),
            disassemble(&code, 0)
        );
    }
    Ok(code)
}

struct CodeGenerator<'g, 'a> {
    func: &'g Function<'a>,
    table: &'g AddressTable,
    session: &'g TranslationSession<'g>,
    enc: X64Encoder,
    regs: RegisterFile,
    frame: FrameLayout,
    liveness: Liveness,
    /// Locals whose register copy is newer than their stack slot.
    dirty: LocalSet,
    block: BlockId,
    /// Previous register of a local being redefined; released once the new value is written.
    stale: Option<AsmReg>,
}

impl CodeGenerator<'_, '_> {
    fn emit_function(&mut self) -> CompileResult<()> {
        let order: Vec<BlockId> = self.func.block_ids().collect();
        for (position, &block) in order.iter().enumerate() {
            let next = order.get(position + 1).copied();
            self.begin_block(block)?;
            if block == self.func.entry() {
                self.enc
                    .alu_ri(AluOp::Sub, Type::I64, RSP, self.frame.size() as i32)?;
            }

            let ops = self.func.block_operations(block);
            if self.func.terminator(block).is_none() {
                return Err(CompileError::BlockLayout {
                    reason: format!("{block} does not end in a terminator"),
                });
            }
            for id in ops {
                let op = *self.func.operation(id);
                self.emit_operation(&op, next)?;
                self.regs.unlock_all();
            }
        }
        Ok(())
    }

    fn begin_block(&mut self, block: BlockId) -> CompileResult<()> {
        self.block = block;
        self.regs.reset();
        self.dirty = LocalSet::new(self.func.local_count());
        self.stale = None;
        let label = self.enc.label_for_block(block.index());
        self.enc.place_label(label)?;
        Ok(())
    }

    // ==== REGISTERS ====

    fn slot(&self, local: u32) -> i32 {
        self.frame.slot_offset(local)
    }

    /// Allocate a register for `local`, storing a dirty victim first.
    fn allocate(&mut self, local: u32) -> CompileResult<AsmReg> {
        let (reg, evicted) = self.regs.allocate(local)?;
        if let Some(victim) = evicted {
            if self.dirty.contains(victim.local) {
                self.enc
                    .store(Width::B64, RSP, self.slot(victim.local), reg)?;
                self.dirty.remove(victim.local);
                self.session.record_spill_store();
            }
        }
        Ok(reg)
    }

    /// Register holding `local`, reloaded from its slot if needed. The register is locked.
    fn use_local(&mut self, local: u32) -> CompileResult<AsmReg> {
        let reg = match self.regs.holder_of(local) {
            Some(reg) => reg,
            None => {
                let reg = self.allocate(local)?;
                self.enc.load(Width::B64, reg, RSP, self.slot(local))?;
                reg
            }
        };
        self.regs.lock(reg)?;
        Ok(reg)
    }

    fn operand_value(&mut self, id: OperandId) -> CompileResult<Value> {
        match self.func.operand(id).kind {
            OperandKind::Constant(value) => Ok(Value::Imm(value)),
            OperandKind::Undefined => Ok(Value::Imm(0)),
            OperandKind::Local(local) => Ok(Value::Reg(self.use_local(local)?)),
            OperandKind::Register(reg) => Err(CompileError::InvalidIr {
                reason: format!("guest register {reg:?} survived SSA construction"),
            }),
        }
    }

    fn source_id(&self, op: &Operation, index: usize) -> CompileResult<OperandId> {
        op.sources()
            .get(index)
            .copied()
            .ok_or_else(|| CompileError::InvalidIr {
                reason: format!("{} is missing source {index}", op.inst.name()),
            })
    }

    fn source(&mut self, op: &Operation, index: usize) -> CompileResult<Value> {
        let id = self.source_id(op, index)?;
        self.operand_value(id)
    }

    fn source_type(&self, op: &Operation, index: usize) -> CompileResult<Type> {
        Ok(self.func.operand(self.source_id(op, index)?).ty)
    }

    fn constant_source(&self, op: &Operation, index: usize) -> CompileResult<u64> {
        let id = self.source_id(op, index)?;
        self.func
            .operand(id)
            .constant_value()
            .ok_or_else(|| CompileError::InvalidIr {
                reason: format!("{} expects a constant in source {index}", op.inst.name()),
            })
    }

    fn dest(&self, op: &Operation) -> CompileResult<OperandId> {
        op.dest.ok_or_else(|| CompileError::InvalidIr {
            reason: format!("{} has no destination", op.inst.name()),
        })
    }

    fn dest_local(&self, dest: OperandId) -> CompileResult<u32> {
        self.func
            .operand(dest)
            .local_index()
            .ok_or_else(|| CompileError::InvalidIr {
                reason: format!("{dest} is not a local"),
            })
    }

    /// Fresh, locked register for a definition of `dest`.
    fn define(&mut self, dest: OperandId) -> CompileResult<AsmReg> {
        let local = self.dest_local(dest)?;
        if let Some(old) = self.regs.holder_of(local) {
            if self.regs.is_locked(old) {
                self.stale = Some(old);
            } else {
                self.regs.release(old)?;
            }
        }
        let reg = self.allocate(local)?;
        self.regs.lock(reg)?;
        Ok(reg)
    }

    /// Complete a definition: write through if the local leaves the block.
    fn finish_def(&mut self, dest: OperandId, reg: AsmReg) -> CompileResult<()> {
        let local = self.dest_local(dest)?;
        if let Some(stale) = self.stale.take() {
            self.regs.release(stale)?;
        }
        if self.liveness.live_out(self.block).contains(local) {
            self.enc.store(Width::B64, RSP, self.slot(local), reg)?;
            self.dirty.remove(local);
        } else {
            self.dirty.insert(local);
        }
        Ok(())
    }

    /// Store dirty caller-saved registers and release every caller-saved register.
    fn flush_caller_saved(&mut self) -> CompileResult<()> {
        for (reg, assignment) in self.regs.owned_in(caller_saved_set()) {
            if self.dirty.contains(assignment.local) {
                self.enc
                    .store(Width::B64, RSP, self.slot(assignment.local), reg)?;
                self.dirty.remove(assignment.local);
                self.session.record_spill_store();
            }
            self.regs.release(reg)?;
        }
        Ok(())
    }

    fn mov_value(&mut self, dst: AsmReg, value: Value) -> CompileResult<()> {
        match value {
            Value::Reg(src) if src == dst => {}
            Value::Reg(src) => self.enc.mov_rr(Type::I64, dst, src)?,
            Value::Imm(imm) => self.enc.mov_ri(dst, imm)?,
        }
        Ok(())
    }

    /// The value in a register, using `scratch` for immediates.
    fn materialize(&mut self, value: Value, scratch: AsmReg) -> CompileResult<AsmReg> {
        match value {
            Value::Reg(reg) => Ok(reg),
            Value::Imm(imm) => {
                self.enc.mov_ri(scratch, imm)?;
                Ok(scratch)
            }
        }
    }

    fn leave_frame(&mut self) -> CompileResult<()> {
        self.enc
            .alu_ri(AluOp::Add, Type::I64, RSP, self.frame.size() as i32)?;
        Ok(())
    }

    /// Call a native interface entry point with up to two arguments.
    fn call_native(&mut self, target: u64, args: &[Value]) -> CompileResult<()> {
        self.flush_caller_saved()?;
        match *args {
            [] => {}
            [a] => self.mov_value(ARG_REGS[0], a)?,
            [a, b] => {
                // Through rax in case the arguments sit in each other's registers.
                self.mov_value(RAX, b)?;
                self.mov_value(ARG_REGS[0], a)?;
                self.enc.mov_rr(Type::I64, ARG_REGS[1], RAX)?;
            }
            _ => {
                return Err(CompileError::CodeGeneration {
                    reason: format!("{} arguments to a native call", args.len()),
                })
            }
        }
        self.enc.mov_ri(RAX, target)?;
        self.enc.call_reg(RAX)?;
        self.session.record_native_call();
        Ok(())
    }

    /// Native call whose result defines `op.dest`.
    fn call_native_value(&mut self, op: &Operation, target: u64, args: &[Value]) -> CompileResult<()> {
        self.call_native(target, args)?;
        let dest = self.dest(op)?;
        let ty = self.func.operand(dest).ty;
        let rd = self.define(dest)?;
        self.enc.mov_rr(ty, rd, RETURN_REG)?;
        self.finish_def(dest, rd)
    }

    // ==== OPERATIONS ====

    fn emit_unary(
        &mut self,
        op: &Operation,
        body: impl FnOnce(&mut Self, Type, AsmReg, Value) -> CompileResult<()>,
    ) -> CompileResult<()> {
        let a = self.source(op, 0)?;
        let dest = self.dest(op)?;
        let ty = self.func.operand(dest).ty;
        let rd = self.define(dest)?;
        body(self, ty, rd, a)?;
        self.finish_def(dest, rd)
    }

    fn emit_binary(
        &mut self,
        op: &Operation,
        body: impl FnOnce(&mut Self, Type, AsmReg, Value, Value) -> CompileResult<()>,
    ) -> CompileResult<()> {
        let a = self.source(op, 0)?;
        let b = self.source(op, 1)?;
        let dest = self.dest(op)?;
        let ty = self.func.operand(dest).ty;
        let rd = self.define(dest)?;
        body(self, ty, rd, a, b)?;
        self.finish_def(dest, rd)
    }

    fn alu(&mut self, op: AluOp, ty: Type, rd: AsmReg, a: Value, b: Value) -> CompileResult<()> {
        self.mov_value(rd, a)?;
        match b.imm32(ty) {
            Some(imm) => self.enc.alu_ri(op, ty, rd, imm)?,
            None => {
                let rb = self.materialize(b, RAX)?;
                self.enc.alu_rr(op, ty, rd, rb)?;
            }
        }
        Ok(())
    }

    fn shift(&mut self, op: ShiftOp, ty: Type, rd: AsmReg, a: Value, b: Value) -> CompileResult<()> {
        self.mov_value(rd, a)?;
        match b {
            Value::Imm(amount) => {
                self.enc
                    .shift_ri(op, ty, rd, (amount & (ty.bits() as u64 - 1)) as u32)?
            }
            Value::Reg(amount) => {
                self.enc.mov_rr(Type::I64, RCX, amount)?;
                self.enc.shift_cl(op, ty, rd)?;
            }
        }
        Ok(())
    }

    fn multiply_high(&mut self, signed: bool, ty: Type, rd: AsmReg, a: Value, b: Value) -> CompileResult<()> {
        self.mov_value(RAX, a)?;
        self.mov_value(RCX, b)?;
        self.enc.mul_wide(signed, RCX)?;
        self.enc.mov_rr(ty, rd, RDX)?;
        Ok(())
    }

    /// Division with ARM semantics: a zero divisor gives zero, `MIN / -1` wraps.
    fn divide(&mut self, signed: bool, ty: Type, rd: AsmReg, a: Value, b: Value) -> CompileResult<()> {
        let done = self.enc.create_label();
        self.mov_value(RAX, a)?;
        self.mov_value(RCX, b)?;
        self.enc.mov_ri(rd, 0)?;
        self.enc.alu_rr(AluOp::Test, ty, RCX, RCX)?;
        self.enc.jcc(CondCode::E, done)?;
        if signed {
            let divide = self.enc.create_label();
            self.enc.alu_ri(AluOp::Cmp, ty, RCX, -1)?;
            self.enc.jcc(CondCode::Ne, divide)?;
            self.enc.mov_rr(ty, rd, RAX)?;
            self.enc.neg(ty, rd)?;
            self.enc.jmp(done)?;
            self.enc.place_label(divide)?;
        }
        self.enc.div(signed, ty, RCX)?;
        self.enc.mov_rr(ty, rd, RAX)?;
        self.enc.place_label(done)?;
        Ok(())
    }

    fn count_leading_zeros(&mut self, ty: Type, rd: AsmReg, a: Value) -> CompileResult<()> {
        let ra = self.materialize(a, RAX)?;
        self.enc.bsr(ty, RAX, ra)?;
        self.enc.mov_ri(RDX, u64::MAX)?;
        self.enc.cmov(true, Type::I64, RAX, RDX)?;
        self.enc.mov_ri(rd, ty.bits() as u64 - 1)?;
        self.enc.alu_rr(AluOp::Sub, ty, rd, RAX)?;
        Ok(())
    }

    fn compare(&mut self, op: &Operation, cond: Condition) -> CompileResult<()> {
        let source_ty = self.source_type(op, 0)?;
        self.emit_binary(op, |this, _, rd, a, b| {
            this.enc.mov_ri(rd, 0)?;
            let ra = this.materialize(a, RAX)?;
            match b.imm32(source_ty) {
                Some(imm) => this.enc.alu_ri(AluOp::Cmp, source_ty, ra, imm)?,
                None => {
                    let rb = this.materialize(b, RDX)?;
                    this.enc.alu_rr(AluOp::Cmp, source_ty, ra, rb)?;
                }
            }
            this.enc.setcc(cond_code(cond), rd)?;
            Ok(())
        })
    }

    fn select(&mut self, op: &Operation) -> CompileResult<()> {
        let cond_ty = self.source_type(op, 0)?;
        let c = self.source(op, 0)?;
        let a = self.source(op, 1)?;
        let b = self.source(op, 2)?;
        let dest = self.dest(op)?;
        let ty = self.func.operand(dest).ty;
        let rd = self.define(dest)?;
        self.mov_value(rd, b)?;
        let ra = self.materialize(a, RDX)?;
        let rc = self.materialize(c, RAX)?;
        self.enc.alu_rr(AluOp::Test, cond_ty, rc, rc)?;
        self.enc.cmov(false, ty, rd, ra)?;
        self.finish_def(dest, rd)
    }

    fn extend(&mut self, op: &Operation) -> CompileResult<()> {
        let inst = op.inst;
        self.emit_unary(op, |this, ty, rd, a| {
            let ra = this.materialize(a, RAX)?;
            match inst {
                Instruction::ZeroExtend8 => this.enc.movzx(Width::B8, rd, ra)?,
                Instruction::ZeroExtend16 => this.enc.movzx(Width::B16, rd, ra)?,
                Instruction::SignExtend8 => this.enc.movsx(ty, Width::B8, rd, ra)?,
                Instruction::SignExtend16 => this.enc.movsx(ty, Width::B16, rd, ra)?,
                Instruction::SignExtend32 => this.enc.movsx(ty, Width::B32, rd, ra)?,
                // ZeroExtend32 and Truncate: a 32-bit move clears the upper half.
                _ => this.enc.mov_rr(Type::I32, rd, ra)?,
            }
            Ok(())
        })
    }

    fn load_context(&mut self, op: &Operation, field: crate::ir::ContextField) -> CompileResult<()> {
        let dest = self.dest(op)?;
        let ty = self.func.operand(dest).ty;
        let width = Width::from_bytes(NativeContext::field_size(field).min(type_bytes(ty)))?;
        let rd = self.define(dest)?;
        self.enc
            .load(width, rd, CONTEXT_REG, NativeContext::field_offset(field))?;
        self.finish_def(dest, rd)
    }

    fn store_context(&mut self, op: &Operation, field: crate::ir::ContextField) -> CompileResult<()> {
        let value = self.source(op, 0)?;
        let width = Width::from_bytes(NativeContext::field_size(field))?;
        let offset = NativeContext::field_offset(field);
        let imm = match (value, width) {
            (Value::Imm(v), Width::B32) => Some(v as u32 as i32),
            (Value::Imm(v), _) => i32::try_from(v as i64).ok(),
            (Value::Reg(_), _) => None,
        };
        match imm {
            Some(imm) => self.enc.store_imm(width, CONTEXT_REG, offset, imm)?,
            None => {
                let reg = self.materialize(value, RAX)?;
                self.enc.store(width, CONTEXT_REG, offset, reg)?;
            }
        }
        Ok(())
    }

    /// Fast-tier entry counter; queues the function once the threshold is reached.
    fn count_call(&mut self, op: &Operation) -> CompileResult<()> {
        let counter = self.constant_source(op, 0)?;
        let guest = self.constant_source(op, 1)?;
        let threshold = self.constant_source(op, 2)?;
        self.flush_caller_saved()?;

        let skip = self.enc.create_label();
        self.enc.mov_ri(RAX, counter)?;
        self.enc.mov_ri(RCX, 1)?;
        self.enc.lock_xadd(RAX, RCX)?;
        self.enc.mov_ri(RDX, threshold.saturating_sub(1))?;
        self.enc.alu_rr(AluOp::Cmp, Type::I64, RCX, RDX)?;
        self.enc.jcc(CondCode::Ne, skip)?;
        self.enc.mov_ri(ARG_REGS[0], guest)?;
        self.enc
            .mov_ri(RAX, native_interface::enqueue_for_rejit as usize as u64)?;
        self.enc.call_reg(RAX)?;
        self.session.record_native_call();
        self.enc.place_label(skip)?;
        Ok(())
    }

    // ==== TERMINATORS ====

    fn branch(&mut self, target: BlockId, next: Option<BlockId>) -> CompileResult<()> {
        if next != Some(target) {
            let label = self.enc.label_for_block(target.index());
            self.enc.jmp(label)?;
        }
        Ok(())
    }

    fn branch_if(
        &mut self,
        op: &Operation,
        then: BlockId,
        otherwise: BlockId,
        next: Option<BlockId>,
    ) -> CompileResult<()> {
        let cond_ty = self.source_type(op, 0)?;
        match self.source(op, 0)? {
            Value::Imm(c) => self.branch(if c != 0 { then } else { otherwise }, next),
            Value::Reg(c) => {
                self.enc.alu_rr(AluOp::Test, cond_ty, c, c)?;
                let then_label = self.enc.label_for_block(then.index());
                self.enc.jcc(CondCode::Ne, then_label)?;
                self.branch(otherwise, next)
            }
        }
    }

    fn exit(&mut self, op: &Operation) -> CompileResult<()> {
        let target = self.source(op, 0)?;
        self.mov_value(RAX, target)?;
        self.enc
            .store(Width::B64, CONTEXT_REG, NativeContext::pc_offset(), RAX)?;
        self.leave_frame()?;
        self.enc.ret()?;
        Ok(())
    }

    fn dispatch(&mut self, op: &Operation) -> CompileResult<()> {
        let target = self.source(op, 0)?;
        let slow = self.enc.create_label();

        self.mov_value(RAX, target)?;
        self.enc
            .store(Width::B64, CONTEXT_REG, NativeContext::pc_offset(), RAX)?;
        self.enc
            .cmp_mem_imm(Width::B32, CONTEXT_REG, NativeContext::interrupt_offset(), 0)?;
        self.enc.jcc(CondCode::Ne, slow)?;
        self.enc
            .sub_mem_imm(Width::B32, CONTEXT_REG, NativeContext::sync_counter_offset(), 1)?;
        self.enc.jcc(CondCode::Le, slow)?;

        match target {
            Value::Imm(pc) => match self.table.ensure_slot(pc) {
                Some(slot) => {
                    self.enc.mov_ri(RAX, slot as *const AtomicU64 as u64)?;
                    self.leave_frame()?;
                    self.enc.jmp_mem(RAX)?;
                }
                None => {
                    self.leave_frame()?;
                    self.enc.ret()?;
                }
            },
            Value::Reg(_) => self.table_walk()?,
        }

        // The dispatcher resumes from the stored pc once the host has synchronized.
        self.enc.place_label(slow)?;
        self.enc
            .mov_ri(RAX, native_interface::check_synchronization as usize as u64)?;
        self.enc.call_reg(RAX)?;
        self.session.record_native_call();
        self.enc
            .load(Width::B64, RAX, CONTEXT_REG, NativeContext::pc_offset())?;
        self.leave_frame()?;
        self.enc.ret()?;
        Ok(())
    }

    /// Inline address table lookup of the pc in rax.
    fn table_walk(&mut self) -> CompileResult<()> {
        let bypass = self.enc.create_label();
        self.enc.mov_ri(RCX, self.table.invalid_mask())?;
        self.enc.alu_rr(AluOp::Test, Type::I64, RAX, RCX)?;
        self.enc.jcc(CondCode::Ne, bypass)?;

        self.enc.mov_ri(RDX, self.table.root_address())?;
        for level in self.table.levels() {
            self.enc.mov_rr(Type::I64, RCX, RAX)?;
            self.enc.shift_ri(ShiftOp::Shr, Type::I64, RCX, level.shift)?;
            self.enc
                .alu_ri(AluOp::And, Type::I32, RCX, level.mask() as i32)?;
            self.enc.load_indexed(RDX, RDX, RCX)?;
        }
        self.leave_frame()?;
        self.enc.jmp_reg(RDX)?;

        self.enc.place_label(bypass)?;
        self.leave_frame()?;
        self.enc.ret()?;
        Ok(())
    }

    fn emit_operation(&mut self, op: &Operation, next: Option<BlockId>) -> CompileResult<()> {
        use native_interface as ni;
        match op.inst {
            Instruction::Copy => self.emit_unary(op, |this, _, rd, a| this.mov_value(rd, a)),
            Instruction::Add => self.emit_binary(op, |this, ty, rd, a, b| this.alu(AluOp::Add, ty, rd, a, b)),
            Instruction::Subtract => {
                self.emit_binary(op, |this, ty, rd, a, b| this.alu(AluOp::Sub, ty, rd, a, b))
            }
            Instruction::Multiply => {
                self.emit_binary(op, |this, ty, rd, a, b| this.alu(AluOp::Imul, ty, rd, a, b))
            }
            Instruction::And => self.emit_binary(op, |this, ty, rd, a, b| this.alu(AluOp::And, ty, rd, a, b)),
            Instruction::Or => self.emit_binary(op, |this, ty, rd, a, b| this.alu(AluOp::Or, ty, rd, a, b)),
            Instruction::Xor => self.emit_binary(op, |this, ty, rd, a, b| this.alu(AluOp::Xor, ty, rd, a, b)),
            Instruction::MultiplyHighSigned => {
                self.emit_binary(op, |this, ty, rd, a, b| this.multiply_high(true, ty, rd, a, b))
            }
            Instruction::MultiplyHighUnsigned => {
                self.emit_binary(op, |this, ty, rd, a, b| this.multiply_high(false, ty, rd, a, b))
            }
            Instruction::DivideSigned => {
                self.emit_binary(op, |this, ty, rd, a, b| this.divide(true, ty, rd, a, b))
            }
            Instruction::DivideUnsigned => {
                self.emit_binary(op, |this, ty, rd, a, b| this.divide(false, ty, rd, a, b))
            }
            Instruction::ShiftLeft => {
                self.emit_binary(op, |this, ty, rd, a, b| this.shift(ShiftOp::Shl, ty, rd, a, b))
            }
            Instruction::ShiftRightLogical => {
                self.emit_binary(op, |this, ty, rd, a, b| this.shift(ShiftOp::Shr, ty, rd, a, b))
            }
            Instruction::ShiftRightArithmetic => {
                self.emit_binary(op, |this, ty, rd, a, b| this.shift(ShiftOp::Sar, ty, rd, a, b))
            }
            Instruction::RotateRight => {
                self.emit_binary(op, |this, ty, rd, a, b| this.shift(ShiftOp::Ror, ty, rd, a, b))
            }
            Instruction::Not => self.emit_unary(op, |this, ty, rd, a| {
                this.mov_value(rd, a)?;
                Ok(this.enc.not(ty, rd)?)
            }),
            Instruction::Negate => self.emit_unary(op, |this, ty, rd, a| {
                this.mov_value(rd, a)?;
                Ok(this.enc.neg(ty, rd)?)
            }),
            Instruction::ByteSwap => self.emit_unary(op, |this, ty, rd, a| {
                this.mov_value(rd, a)?;
                Ok(this.enc.bswap(ty, rd)?)
            }),
            Instruction::CountLeadingZeros => {
                self.emit_unary(op, |this, ty, rd, a| this.count_leading_zeros(ty, rd, a))
            }
            Instruction::Compare(cond) => self.compare(op, cond),
            Instruction::Select => self.select(op),
            Instruction::ZeroExtend8
            | Instruction::ZeroExtend16
            | Instruction::ZeroExtend32
            | Instruction::SignExtend8
            | Instruction::SignExtend16
            | Instruction::SignExtend32
            | Instruction::Truncate => self.extend(op),
            Instruction::LoadContext(field) => self.load_context(op, field),
            Instruction::StoreContext(field) => self.store_context(op, field),
            Instruction::Load(size) => {
                let address = self.source(op, 0)?;
                self.call_native_value(op, ni::read_memory_entry(size), &[address])
            }
            Instruction::Store(size) => {
                let address = self.source(op, 0)?;
                let value = self.source(op, 1)?;
                self.call_native(ni::write_memory_entry(size), &[address, value])
            }
            Instruction::ReadCounter => {
                self.call_native_value(op, ni::read_counter as usize as u64, &[])
            }
            Instruction::ReadFrequency => {
                self.call_native_value(op, ni::read_frequency as usize as u64, &[])
            }
            Instruction::SupervisorCall | Instruction::Breakpoint | Instruction::Undefined => {
                let target = match op.inst {
                    Instruction::SupervisorCall => ni::supervisor_call as usize as u64,
                    Instruction::Breakpoint => ni::breakpoint as usize as u64,
                    _ => ni::undefined_instruction as usize as u64,
                };
                let pc = self.source(op, 0)?;
                let payload = self.source(op, 1)?;
                self.call_native(target, &[pc, payload])
            }
            Instruction::InvalidateCacheLine => {
                let address = self.source(op, 0)?;
                self.call_native(ni::invalidate_cache_line as usize as u64, &[address])
            }
            Instruction::CountCall => self.count_call(op),
            Instruction::Phi => Err(CompileError::InvalidIr {
                reason: "phi reached code generation".to_string(),
            }),
            Instruction::Branch(target) => self.branch(target, next),
            Instruction::BranchIf { then, otherwise } => self.branch_if(op, then, otherwise, next),
            Instruction::Dispatch => self.dispatch(op),
            Instruction::Exit => self.exit(op),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::SessionStats;
    use crate::decoder::ExecutionMode;
    use crate::ir::{ContextField, GuestReg};
    use crate::jit::arena::ExecutableArena;
    use crate::x64::stubs::RuntimeStubs;
    use bumpalo::Bump;
    use std::sync::atomic::AtomicI32;

    fn gpr(n: u8) -> ContextField {
        ContextField::Register(GuestReg::Gpr(n))
    }

    /// Generate `build`'s function, run it through the entry stub and return the context.
    /// Untranslated table slots lead to the exit stub, so dispatches return their target.
    fn run(
        build: impl FnOnce(&mut Function<'_>),
        setup: impl FnOnce(&mut NativeContext),
    ) -> (NativeContext, u64, SessionStats) {
        let _ = env_logger::builder().is_test(true).try_init();
        let arena = ExecutableArena::new(1 << 16).unwrap();
        let stubs = RuntimeStubs::new(&arena).unwrap();
        let table = AddressTable::new(ExecutionMode::Aarch64, stubs.exit_address());

        let bump = Bump::new();
        let session = TranslationSession::new(&bump);
        let mut func = Function::new(&bump, 0x1000);
        build(&mut func);
        func.compute_predecessors();
        func.verify().unwrap();
        let code = generate(&func, &table, &session).unwrap();
        let host = arena.allocate(&code).unwrap();

        let mut context = NativeContext {
            sync_counter: AtomicI32::new(100),
            ..NativeContext::default()
        };
        setup(&mut context);
        let next = unsafe { (stubs.entry())(&mut context, host.host_address()) };
        (context, next, session.stats())
    }

    #[test]
    fn test_add_and_exit() {
        let (ctx, next, _) = run(
            |f| {
                let entry = f.entry();
                let (v0, v1) = (f.new_local(Type::I64), f.new_local(Type::I64));
                let five = f.constant(5, Type::I64);
                let pc = f.constant(0x40, Type::I64);
                f.append(entry, Instruction::LoadContext(gpr(1)), Some(v0), &[]).unwrap();
                f.append(entry, Instruction::Add, Some(v1), &[v0, five]).unwrap();
                f.append(entry, Instruction::StoreContext(gpr(0)), None, &[v1]).unwrap();
                f.append(entry, Instruction::Exit, None, &[pc]).unwrap();
            },
            |c| c.x[1] = 37,
        );
        assert_eq!(ctx.x[0], 42);
        assert_eq!(next, 0x40);
        assert_eq!(ctx.pc, 0x40);
    }

    #[test]
    fn test_register_pressure_spills() {
        let (ctx, _, stats) = run(
            |f| {
                let entry = f.entry();
                let values: Vec<_> = (0..20u8)
                    .map(|n| {
                        let v = f.new_local(Type::I64);
                        f.append(entry, Instruction::LoadContext(gpr(n)), Some(v), &[])
                            .unwrap();
                        v
                    })
                    .collect();
                let mut sum = values[0];
                for &v in &values[1..] {
                    let next = f.new_local(Type::I64);
                    f.append(entry, Instruction::Add, Some(next), &[sum, v]).unwrap();
                    sum = next;
                }
                f.append(entry, Instruction::StoreContext(gpr(0)), None, &[sum])
                    .unwrap();
                let pc = f.constant(0, Type::I64);
                f.append(entry, Instruction::Exit, None, &[pc]).unwrap();
            },
            |c| {
                for n in 0..20 {
                    c.x[n] = n as u64 + 1;
                }
            },
        );
        assert_eq!(ctx.x[0], 210);
        assert!(stats.spill_stores > 0);
    }

    fn divide(a: u64, b: u64) -> u64 {
        let (ctx, _, _) = run(
            |f| {
                let entry = f.entry();
                let (x, y, q) = (
                    f.new_local(Type::I32),
                    f.new_local(Type::I32),
                    f.new_local(Type::I32),
                );
                f.append(entry, Instruction::LoadContext(gpr(0)), Some(x), &[]).unwrap();
                f.append(entry, Instruction::LoadContext(gpr(1)), Some(y), &[]).unwrap();
                f.append(entry, Instruction::DivideSigned, Some(q), &[x, y]).unwrap();
                f.append(entry, Instruction::StoreContext(gpr(2)), None, &[q]).unwrap();
                let pc = f.constant(0, Type::I64);
                f.append(entry, Instruction::Exit, None, &[pc]).unwrap();
            },
            |c| {
                c.x[0] = a;
                c.x[1] = b;
                c.x[2] = 0xdead;
            },
        );
        ctx.x[2]
    }

    #[test]
    fn test_signed_division_edge_cases() {
        assert_eq!(divide(7, 0), 0);
        assert_eq!(divide(0x8000_0000, 0xffff_ffff), 0x8000_0000);
        assert_eq!(divide((-9i32) as u32 as u64, 2), (-4i32) as u32 as u64);
        assert_eq!(divide(9, 0xffff_ffff), (-9i32) as u32 as u64);
    }

    #[test]
    fn test_clz_and_select() {
        let (ctx, _, _) = run(
            |f| {
                let entry = f.entry();
                let x = f.new_local(Type::I32);
                let clz = f.new_local(Type::I32);
                let cond = f.new_local(Type::I32);
                let picked = f.new_local(Type::I64);
                let ten = f.constant(10, Type::I64);
                let twenty = f.constant(20, Type::I64);
                f.append(entry, Instruction::LoadContext(gpr(0)), Some(x), &[]).unwrap();
                f.append(entry, Instruction::CountLeadingZeros, Some(clz), &[x]).unwrap();
                f.append(entry, Instruction::StoreContext(gpr(1)), None, &[clz]).unwrap();
                f.append(entry, Instruction::Compare(Condition::Eq), Some(cond), &[x, x])
                    .unwrap();
                f.append(entry, Instruction::Select, Some(picked), &[cond, ten, twenty])
                    .unwrap();
                f.append(entry, Instruction::StoreContext(gpr(2)), None, &[picked])
                    .unwrap();
                let pc = f.constant(0, Type::I64);
                f.append(entry, Instruction::Exit, None, &[pc]).unwrap();
            },
            |c| c.x[0] = 0,
        );
        assert_eq!(ctx.x[1], 32);
        assert_eq!(ctx.x[2], 10);
    }

    #[test]
    fn test_branch_carries_locals_across_blocks() {
        fn build(f: &mut Function<'_>) {
            let entry = f.entry();
            let then = f.create_block();
            let otherwise = f.create_block();
            let x = f.new_local(Type::I64);
            let bumped = f.new_local(Type::I64);
            let below = f.new_local(Type::I32);
            let one = f.constant(1, Type::I64);
            let ten = f.constant(10, Type::I64);
            f.append(entry, Instruction::LoadContext(gpr(0)), Some(x), &[]).unwrap();
            f.append(entry, Instruction::Add, Some(bumped), &[x, one]).unwrap();
            f.append(entry, Instruction::Compare(Condition::Ult), Some(below), &[x, ten])
                .unwrap();
            f.append(entry, Instruction::BranchIf { then, otherwise }, None, &[below])
                .unwrap();

            f.append(then, Instruction::StoreContext(gpr(1)), None, &[bumped]).unwrap();
            let pc_then = f.constant(0x100, Type::I64);
            f.append(then, Instruction::Exit, None, &[pc_then]).unwrap();

            f.append(otherwise, Instruction::StoreContext(gpr(1)), None, &[x]).unwrap();
            let pc_else = f.constant(0x200, Type::I64);
            f.append(otherwise, Instruction::Exit, None, &[pc_else]).unwrap();
        }

        let (ctx, next, _) = run(build, |c| c.x[0] = 3);
        assert_eq!((ctx.x[1], next), (4, 0x100));
        let (ctx, next, _) = run(build, |c| c.x[0] = 30);
        assert_eq!((ctx.x[1], next), (30, 0x200));
    }

    #[test]
    fn test_fall_through_branches() {
        // entry -> middle -> last, each a branch to the block laid out next.
        let (ctx, next, _) = run(
            |f| {
                let entry = f.entry();
                let middle = f.create_block();
                let last = f.create_block();
                let x = f.new_local(Type::I64);
                f.append(entry, Instruction::LoadContext(gpr(0)), Some(x), &[]).unwrap();
                f.append(entry, Instruction::StoreContext(gpr(1)), None, &[x]).unwrap();
                f.append(entry, Instruction::Branch(middle), None, &[]).unwrap();
                f.append(middle, Instruction::Branch(last), None, &[]).unwrap();
                let pc = f.constant(0x80, Type::I64);
                f.append(last, Instruction::Exit, None, &[pc]).unwrap();
            },
            |c| c.x[0] = 7,
        );
        assert_eq!((ctx.x[1], next), (7, 0x80));
    }

    #[test]
    fn test_dispatch_through_table() {
        // Constant target: jumps through its slot, which holds the exit stub.
        let (ctx, next, _) = run(
            |f| {
                let target = f.constant(0x2000, Type::I64);
                f.append(f.entry(), Instruction::Dispatch, None, &[target]).unwrap();
            },
            |_| {},
        );
        assert_eq!((next, ctx.pc), (0x2000, 0x2000));
        assert_eq!(ctx.sync_counter.load(std::sync::atomic::Ordering::Relaxed), 99);

        // Computed targets: a representable pc walks the table, a misaligned one bypasses it.
        for pc in [0x3000u64, 0x3002] {
            let (ctx, next, _) = run(
                |f| {
                    let v = f.new_local(Type::I64);
                    f.append(f.entry(), Instruction::LoadContext(gpr(0)), Some(v), &[])
                        .unwrap();
                    f.append(f.entry(), Instruction::Dispatch, None, &[v]).unwrap();
                },
                |c| c.x[0] = pc,
            );
            assert_eq!((next, ctx.pc), (pc, pc));
        }
    }

    #[test]
    fn test_phi_is_rejected() {
        let bump = Bump::new();
        let session = TranslationSession::new(&bump);
        let table = AddressTable::new(ExecutionMode::Aarch64, 0xf111);
        let mut func = Function::new(&bump, 0);
        let v = func.new_local(Type::I64);
        let zero = func.constant(0, Type::I64);
        func.append(func.entry(), Instruction::Phi, Some(v), &[]).unwrap();
        func.append(func.entry(), Instruction::Exit, None, &[zero]).unwrap();
        assert!(matches!(
            generate(&func, &table, &session),
            Err(CompileError::InvalidIr { .. })
        ));
    }
}
