// Guest-to-IR translation. A decoded block becomes one IR function: block 0 is a prologue that
// (for fast-tier translations) bumps the entry call counter and then branches to the body, so
// the entry never has predecessors. Guest registers are referenced as Register operands and
// become SSA values later. Every memory access and every exception-raising instruction is
// followed by a halt check: if the native side marked the context as not running (fault or
// stop request), control leaves through an Exit with the guest pc that should be resumed.
// Results of a faulting instruction are only written after its check, so the guest state
// seen at the exit is the state before the instruction.

//! Translation of decoded guest blocks into IR.

pub mod a32;
pub mod a64;

use crate::core::error::CompileResult;
use crate::decoder::{Block, Cond, ExecutionMode, MemSize, OpKind};
use crate::ir::optimizer::Tier;
use crate::ir::{
    BlockId, Condition, ContextField, Flag, Function, GuestReg, Instruction, OperandId, Type,
};

/// Per-translation settings.
#[derive(Debug, Clone, Copy)]
pub struct TranslationOptions {
    pub tier: Tier,
    /// Address of the entry call counter; only used by fast-tier translations.
    pub call_counter: u64,
    pub rejit_threshold: u64,
}

/// Translate a decoded block into `func`.
pub fn translate_block(
    func: &mut Function<'_>,
    block: &Block,
    mode: ExecutionMode,
    options: &TranslationOptions,
) -> CompileResult<()> {
    let mut builder = IrBuilder::new(func, mode);

    if options.tier == Tier::Fast && options.call_counter != 0 {
        let counter = builder.konst(options.call_counter, Type::I64);
        let guest = builder.konst(block.start, Type::I64);
        let threshold = builder.konst(options.rejit_threshold, Type::I64);
        builder.effect(Instruction::CountCall, &[counter, guest, threshold])?;
    }
    let body = builder.new_block();
    builder.branch(body)?;
    builder.switch_to(body);

    for opcode in &block.opcodes {
        if builder.is_terminated() {
            break;
        }
        match opcode.kind {
            OpKind::A64(op) => a64::translate(&mut builder, opcode, op)?,
            OpKind::A32(instr) => a32::translate(&mut builder, opcode, instr)?,
        }
    }

    if !builder.is_terminated() {
        builder.dispatch_to(block.end)?;
    }
    Ok(())
}

/// Carry input of [`IrBuilder::add_with_carry`].
#[derive(Debug, Clone, Copy)]
pub enum CarryIn {
    Zero,
    One,
    /// An I32 0/1 value.
    Value(OperandId),
}

/// Result and flags of an addition.
#[derive(Debug, Clone, Copy)]
pub struct AddResult {
    pub result: OperandId,
    pub n: OperandId,
    pub z: OperandId,
    pub c: OperandId,
    pub v: OperandId,
}

/// Appends IR for guest instructions to a function.
pub struct IrBuilder<'f, 'a> {
    func: &'f mut Function<'a>,
    mode: ExecutionMode,
    block: BlockId,
    terminated: bool,
}

impl<'f, 'a> IrBuilder<'f, 'a> {
    pub fn new(func: &'f mut Function<'a>, mode: ExecutionMode) -> Self {
        let block = func.entry();
        Self {
            func,
            mode,
            block,
            terminated: false,
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Type of a guest general purpose register.
    pub fn gpr_type(&self) -> Type {
        match self.mode {
            ExecutionMode::Aarch64 => Type::I64,
            ExecutionMode::Aarch32Arm => Type::I32,
        }
    }

    pub fn new_block(&mut self) -> BlockId {
        self.func.create_block()
    }

    pub fn current_block(&self) -> BlockId {
        self.block
    }

    pub fn switch_to(&mut self, block: BlockId) {
        self.block = block;
        self.terminated = false;
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn konst(&mut self, value: u64, ty: Type) -> OperandId {
        self.func.constant(value, ty)
    }

    pub fn ty(&self, value: OperandId) -> Type {
        self.func.operand(value).ty
    }

    /// Append an operation producing a fresh local of type `ty`.
    pub fn emit(
        &mut self,
        inst: Instruction,
        ty: Type,
        sources: &[OperandId],
    ) -> CompileResult<OperandId> {
        let dest = self.func.new_local(ty);
        self.func.append(self.block, inst, Some(dest), sources)?;
        Ok(dest)
    }

    /// Append an operation without a result.
    pub fn effect(&mut self, inst: Instruction, sources: &[OperandId]) -> CompileResult<()> {
        self.func.append(self.block, inst, None, sources)?;
        if inst.is_terminator() {
            self.terminated = true;
        }
        Ok(())
    }

    pub fn binary(
        &mut self,
        inst: Instruction,
        a: OperandId,
        b: OperandId,
    ) -> CompileResult<OperandId> {
        let ty = self.ty(a);
        self.emit(inst, ty, &[a, b])
    }

    /// Binary operation with an immediate right-hand side.
    pub fn binary_imm(
        &mut self,
        inst: Instruction,
        a: OperandId,
        imm: u64,
    ) -> CompileResult<OperandId> {
        let ty = self.ty(a);
        let b = self.konst(imm, ty);
        self.emit(inst, ty, &[a, b])
    }

    pub fn unary(&mut self, inst: Instruction, a: OperandId) -> CompileResult<OperandId> {
        let ty = self.ty(a);
        self.emit(inst, ty, &[a])
    }

    /// Convert between I32 and I64 (zero-extending or truncating).
    pub fn resize(&mut self, value: OperandId, ty: Type) -> CompileResult<OperandId> {
        match (self.ty(value), ty) {
            (Type::I32, Type::I64) => self.emit(Instruction::ZeroExtend32, Type::I64, &[value]),
            (Type::I64, Type::I32) => self.emit(Instruction::Truncate, Type::I32, &[value]),
            _ => Ok(value),
        }
    }

    pub fn compare(
        &mut self,
        cond: Condition,
        a: OperandId,
        b: OperandId,
    ) -> CompileResult<OperandId> {
        self.emit(Instruction::Compare(cond), Type::I32, &[a, b])
    }

    pub fn compare_imm(
        &mut self,
        cond: Condition,
        a: OperandId,
        imm: u64,
    ) -> CompileResult<OperandId> {
        let ty = self.ty(a);
        let b = self.konst(imm, ty);
        self.compare(cond, a, b)
    }

    pub fn select(
        &mut self,
        cond: OperandId,
        if_true: OperandId,
        if_false: OperandId,
    ) -> CompileResult<OperandId> {
        let ty = self.ty(if_true);
        self.emit(Instruction::Select, ty, &[cond, if_true, if_false])
    }

    /// Guest register operand.
    pub fn gpr(&mut self, n: u8) -> OperandId {
        let ty = self.gpr_type();
        self.func.register(GuestReg::Gpr(n), ty)
    }

    pub fn write_gpr(&mut self, n: u8, value: OperandId) -> CompileResult<()> {
        let reg = self.gpr(n);
        let value = self.resize(value, self.gpr_type())?;
        self.func
            .append(self.block, Instruction::Copy, Some(reg), &[value])?;
        Ok(())
    }

    pub fn flag(&mut self, flag: Flag) -> OperandId {
        self.func.register(GuestReg::Flag(flag), Type::I32)
    }

    pub fn set_flag(&mut self, flag: Flag, value: OperandId) -> CompileResult<()> {
        let reg = self.flag(flag);
        self.func
            .append(self.block, Instruction::Copy, Some(reg), &[value])?;
        Ok(())
    }

    pub fn load_context(&mut self, field: ContextField, ty: Type) -> CompileResult<OperandId> {
        self.emit(Instruction::LoadContext(field), ty, &[])
    }

    pub fn store_context(&mut self, field: ContextField, value: OperandId) -> CompileResult<()> {
        self.effect(Instruction::StoreContext(field), &[value])
    }

    pub fn branch(&mut self, target: BlockId) -> CompileResult<()> {
        self.effect(Instruction::Branch(target), &[])
    }

    pub fn branch_if(
        &mut self,
        cond: OperandId,
        then: BlockId,
        otherwise: BlockId,
    ) -> CompileResult<()> {
        self.effect(Instruction::BranchIf { then, otherwise }, &[cond])
    }

    /// Continue guest execution at a computed address.
    pub fn dispatch(&mut self, target: OperandId) -> CompileResult<()> {
        let target = self.resize(target, Type::I64)?;
        self.effect(Instruction::Dispatch, &[target])
    }

    pub fn dispatch_to(&mut self, address: u64) -> CompileResult<()> {
        let target = self.konst(address, Type::I64);
        self.effect(Instruction::Dispatch, &[target])
    }

    /// Return to the dispatcher, resuming at `address` later.
    pub fn exit_to(&mut self, address: u64) -> CompileResult<()> {
        let target = self.konst(address, Type::I64);
        self.effect(Instruction::Exit, &[target])
    }

    /// Leave through an exit to `resume_pc` if the context stopped running.
    pub fn halt_check(&mut self, resume_pc: u64) -> CompileResult<()> {
        let running = self.load_context(ContextField::Running, Type::I32)?;
        let halted = self.new_block();
        let next = self.new_block();
        self.branch_if(running, next, halted)?;
        self.switch_to(halted);
        self.exit_to(resume_pc)?;
        self.switch_to(next);
        Ok(())
    }

    /// Guest memory read of `size` bytes, zero-extended into `ty`.
    pub fn load(
        &mut self,
        size: MemSize,
        address: OperandId,
        ty: Type,
        pc: u64,
    ) -> CompileResult<OperandId> {
        let value = self.emit(Instruction::Load(size), ty, &[address])?;
        self.halt_check(pc)?;
        Ok(value)
    }

    pub fn store(
        &mut self,
        size: MemSize,
        address: OperandId,
        value: OperandId,
        pc: u64,
    ) -> CompileResult<()> {
        self.effect(Instruction::Store(size), &[address, value])?;
        self.halt_check(pc)
    }

    /// Raise an exception-like native call, then continue at `next_pc` unless stopped.
    pub fn raise(
        &mut self,
        inst: Instruction,
        pc: u64,
        payload: u64,
        next_pc: u64,
    ) -> CompileResult<()> {
        let pc_value = self.konst(pc, Type::I64);
        let payload = self.konst(payload, Type::I64);
        self.effect(inst, &[pc_value, payload])?;
        self.halt_check(next_pc)?;
        self.dispatch_to(next_pc)
    }

    /// Evaluate an ARM condition over the current flags as an I32 0/1.
    pub fn condition(&mut self, cond: Cond) -> CompileResult<OperandId> {
        let n = self.flag(Flag::N);
        let z = self.flag(Flag::Z);
        let c = self.flag(Flag::C);
        let v = self.flag(Flag::V);
        let value = match cond {
            Cond::Eq => z,
            Cond::Ne => self.binary_imm(Instruction::Xor, z, 1)?,
            Cond::Cs => c,
            Cond::Cc => self.binary_imm(Instruction::Xor, c, 1)?,
            Cond::Mi => n,
            Cond::Pl => self.binary_imm(Instruction::Xor, n, 1)?,
            Cond::Vs => v,
            Cond::Vc => self.binary_imm(Instruction::Xor, v, 1)?,
            Cond::Hi | Cond::Ls => {
                let not_z = self.binary_imm(Instruction::Xor, z, 1)?;
                let hi = self.binary(Instruction::And, c, not_z)?;
                if cond == Cond::Hi {
                    hi
                } else {
                    self.binary_imm(Instruction::Xor, hi, 1)?
                }
            }
            Cond::Ge => self.compare(Condition::Eq, n, v)?,
            Cond::Lt => self.compare(Condition::Ne, n, v)?,
            Cond::Gt | Cond::Le => {
                let ge = self.compare(Condition::Eq, n, v)?;
                let not_z = self.binary_imm(Instruction::Xor, z, 1)?;
                let gt = self.binary(Instruction::And, ge, not_z)?;
                if cond == Cond::Gt {
                    gt
                } else {
                    self.binary_imm(Instruction::Xor, gt, 1)?
                }
            }
            Cond::Al | Cond::Nv => self.konst(1, Type::I32),
        };
        Ok(value)
    }

    /// Most significant bit of `value` as an I32 0/1.
    pub fn sign_bit(&mut self, value: OperandId) -> CompileResult<OperandId> {
        let bits = self.ty(value).bits() as u64;
        let shifted = self.binary_imm(Instruction::ShiftRightLogical, value, bits - 1)?;
        self.resize(shifted, Type::I32)
    }

    /// `a + b + carry` with ARM NZCV semantics.
    pub fn add_with_carry(
        &mut self,
        a: OperandId,
        b: OperandId,
        carry: CarryIn,
    ) -> CompileResult<AddResult> {
        let ty = self.ty(a);
        let sum = self.binary(Instruction::Add, a, b)?;
        let result = match carry {
            CarryIn::Zero => sum,
            CarryIn::One => self.binary_imm(Instruction::Add, sum, 1)?,
            CarryIn::Value(c) => {
                let c = self.resize(c, ty)?;
                self.binary(Instruction::Add, sum, c)?
            }
        };

        let n = self.sign_bit(result)?;
        let z = self.compare_imm(Condition::Eq, result, 0)?;
        let c = match carry {
            CarryIn::Zero => self.compare(Condition::Ult, result, a)?,
            CarryIn::One => self.compare(Condition::Ule, result, a)?,
            CarryIn::Value(carry) => {
                let with = self.compare(Condition::Ule, result, a)?;
                let without = self.compare(Condition::Ult, result, a)?;
                self.select(carry, with, without)?
            }
        };
        let a_xor = self.binary(Instruction::Xor, a, result)?;
        let b_xor = self.binary(Instruction::Xor, b, result)?;
        let overflow = self.binary(Instruction::And, a_xor, b_xor)?;
        let v = self.sign_bit(overflow)?;

        Ok(AddResult { result, n, z, c, v })
    }

    /// `a - b - !carry` expressed as `a + !b + carry`.
    pub fn sub_with_carry(
        &mut self,
        a: OperandId,
        b: OperandId,
        carry: CarryIn,
    ) -> CompileResult<AddResult> {
        let not_b = self.unary(Instruction::Not, b)?;
        self.add_with_carry(a, not_b, carry)
    }

    pub fn set_nzcv(&mut self, flags: &AddResult) -> CompileResult<()> {
        self.set_flag(Flag::N, flags.n)?;
        self.set_flag(Flag::Z, flags.z)?;
        self.set_flag(Flag::C, flags.c)?;
        self.set_flag(Flag::V, flags.v)
    }

    /// Set N and Z from a result.
    pub fn set_nz(&mut self, result: OperandId) -> CompileResult<()> {
        let n = self.sign_bit(result)?;
        let z = self.compare_imm(Condition::Eq, result, 0)?;
        self.set_flag(Flag::N, n)?;
        self.set_flag(Flag::Z, z)
    }

    /// Run `emit_body` only when `cond` holds, continuing in a join block afterwards.
    pub fn conditional(
        &mut self,
        cond: Cond,
        emit_body: impl FnOnce(&mut Self) -> CompileResult<()>,
    ) -> CompileResult<()> {
        if matches!(cond, Cond::Al | Cond::Nv) {
            return emit_body(self);
        }
        let taken = self.condition(cond)?;
        let body = self.new_block();
        let join = self.new_block();
        self.branch_if(taken, body, join)?;
        self.switch_to(body);
        emit_body(self)?;
        if !self.is_terminated() {
            self.branch(join)?;
        }
        self.switch_to(join);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode_instruction;
    use crate::ir::{optimizer, ssa};
    use bumpalo::Bump;

    fn block_of(mode: ExecutionMode, words: &[u32]) -> Block {
        let opcodes: Vec<_> = words
            .iter()
            .enumerate()
            .map(|(i, raw)| decode_instruction(mode, 0x1000 + 4 * i as u64, *raw))
            .collect();
        let end = 0x1000 + 4 * words.len() as u64;
        Block {
            start: 0x1000,
            end,
            opcodes,
            end_reason: crate::decoder::BlockEnd::ControlFlow,
        }
    }

    fn options(tier: Tier) -> TranslationOptions {
        TranslationOptions {
            tier,
            call_counter: 0x5000,
            rejit_threshold: 10,
        }
    }

    #[test]
    fn test_entry_has_no_predecessors_and_counter() {
        let arena = Bump::new();
        let mut func = Function::new(&arena, 0x1000);
        // add x0, x1, x2; ret
        let block = block_of(ExecutionMode::Aarch64, &[0x8B020020, 0xD65F03C0]);
        translate_block(&mut func, &block, ExecutionMode::Aarch64, &options(Tier::Fast)).unwrap();
        func.compute_predecessors();
        func.verify().unwrap();

        assert!(func.predecessors(func.entry()).is_empty());
        let first = func.first_operation(func.entry()).unwrap();
        assert_eq!(func.operation(first).inst, Instruction::CountCall);

        ssa::construct(&mut func).unwrap();
        optimizer::optimize(&mut func, Tier::Optimized);
        func.verify().unwrap();
    }

    #[test]
    fn test_a32_conditional_creates_join() {
        let arena = Bump::new();
        let mut func = Function::new(&arena, 0x1000);
        // addeq r0, r0, #1; bx lr
        let block = block_of(ExecutionMode::Aarch32Arm, &[0x02800001, 0xE12FFF1E]);
        translate_block(
            &mut func,
            &block,
            ExecutionMode::Aarch32Arm,
            &options(Tier::Optimized),
        )
        .unwrap();
        func.compute_predecessors();
        func.verify().unwrap();

        let joins = func
            .block_ids()
            .filter(|b| func.predecessors(*b).len() == 2)
            .count();
        assert_eq!(joins, 1);
        ssa::construct(&mut func).unwrap();
        func.verify().unwrap();
    }
}
