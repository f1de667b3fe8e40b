//! A64 instruction translation.

use super::{CarryIn, IrBuilder};
use crate::core::error::CompileResult;
use crate::decoder::a64::{
    A64Op, AddrOffset, Address, BitfieldOp, BranchRegKind, CondCompareOperand, CondSelectOp,
    Extend, IndexMode, LogicOp, MoveWideOp, Operand2, Reg, ReverseKind, SysReg,
};
use crate::decoder::{Cond, MemSize, OpCode, ShiftType};
use crate::ir::{Condition, ContextField, Flag, Instruction, OperandId, Type};

/// Link register.
const LR: u8 = 30;
/// Bytes zeroed by DC ZVA.
const DC_ZVA_BLOCK: u64 = 64;
/// CTR_EL0 reported to the guest: 64-byte lines.
const CTR_EL0_VALUE: u64 = 0x8444_c004;
/// DCZID_EL0 reported to the guest: 64-byte DC ZVA blocks.
const DCZID_EL0_VALUE: u64 = 4;

fn width(sf: bool) -> Type {
    if sf {
        Type::I64
    } else {
        Type::I32
    }
}

fn slot(reg: Reg) -> Option<u8> {
    match reg {
        Reg::X(n) => Some(n),
        Reg::Sp => Some(31),
        Reg::Zr => None,
    }
}

fn mask(len: u32) -> u64 {
    if len >= 64 {
        u64::MAX
    } else {
        (1u64 << len) - 1
    }
}

impl IrBuilder<'_, '_> {
    fn read(&mut self, reg: Reg, ty: Type) -> CompileResult<OperandId> {
        match slot(reg) {
            Some(n) => {
                let value = self.gpr(n);
                self.resize(value, ty)
            }
            None => Ok(self.konst(0, ty)),
        }
    }

    fn write(&mut self, reg: Reg, value: OperandId) -> CompileResult<()> {
        match slot(reg) {
            Some(n) => self.write_gpr(n, value),
            None => Ok(()),
        }
    }

    fn shift(
        &mut self,
        value: OperandId,
        shift: ShiftType,
        amount: OperandId,
    ) -> CompileResult<OperandId> {
        let inst = match shift {
            ShiftType::Lsl => Instruction::ShiftLeft,
            ShiftType::Lsr => Instruction::ShiftRightLogical,
            ShiftType::Asr => Instruction::ShiftRightArithmetic,
            ShiftType::Ror => Instruction::RotateRight,
        };
        self.binary(inst, value, amount)
    }

    fn shift_imm(
        &mut self,
        value: OperandId,
        shift: ShiftType,
        amount: u8,
    ) -> CompileResult<OperandId> {
        if amount == 0 {
            return Ok(value);
        }
        let ty = self.ty(value);
        let amount = self.konst(amount as u64, ty);
        self.shift(value, shift, amount)
    }

    fn extend(&mut self, rm: Reg, extend: Extend, ty: Type) -> CompileResult<OperandId> {
        let value = self.read(rm, ty)?;
        match (extend, ty) {
            (Extend::Uxtb, _) => self.emit(Instruction::ZeroExtend8, ty, &[value]),
            (Extend::Uxth, _) => self.emit(Instruction::ZeroExtend16, ty, &[value]),
            (Extend::Sxtb, _) => self.emit(Instruction::SignExtend8, ty, &[value]),
            (Extend::Sxth, _) => self.emit(Instruction::SignExtend16, ty, &[value]),
            (Extend::Uxtw, Type::I64) => {
                let low = self.resize(value, Type::I32)?;
                self.resize(low, Type::I64)
            }
            (Extend::Sxtw, Type::I64) => self.emit(Instruction::SignExtend32, ty, &[value]),
            _ => Ok(value),
        }
    }

    fn operand2(&mut self, operand: Operand2, ty: Type) -> CompileResult<OperandId> {
        match operand {
            Operand2::Imm(value) => Ok(self.konst(value, ty)),
            Operand2::Shifted { rm, shift, amount } => {
                let value = self.read(rm, ty)?;
                self.shift_imm(value, shift, amount)
            }
            Operand2::Extended { rm, extend, shift } => {
                let value = self.extend(rm, extend, ty)?;
                self.shift_imm(value, ShiftType::Lsl, shift)
            }
        }
    }

    /// Returns the access address and, for indexed modes, the written-back base.
    fn address(&mut self, addr: Address) -> CompileResult<(OperandId, Option<OperandId>)> {
        let base = self.read(addr.base, Type::I64)?;
        let offset = match addr.offset {
            AddrOffset::Imm(0) if addr.mode == IndexMode::Offset => return Ok((base, None)),
            AddrOffset::Imm(imm) => self.konst(imm as u64, Type::I64),
            AddrOffset::Reg { rm, extend, shift } => {
                let value = self.extend(rm, extend, Type::I64)?;
                self.shift_imm(value, ShiftType::Lsl, shift)?
            }
        };
        let offset_address = self.binary(Instruction::Add, base, offset)?;
        Ok(match addr.mode {
            IndexMode::Offset => (offset_address, None),
            IndexMode::PreIndex => (offset_address, Some(offset_address)),
            IndexMode::PostIndex => (base, Some(offset_address)),
        })
    }

    /// Load `size` bytes and extend the value into the destination width.
    fn load_value(
        &mut self,
        size: MemSize,
        signed: bool,
        ty: Type,
        address: OperandId,
        pc: u64,
    ) -> CompileResult<OperandId> {
        let raw = self.load(size, address, Type::I64, pc)?;
        if !signed {
            return self.resize(raw, ty);
        }
        let inst = match size {
            MemSize::Byte => Instruction::SignExtend8,
            MemSize::Half => Instruction::SignExtend16,
            MemSize::Word => Instruction::SignExtend32,
            MemSize::Double => return self.resize(raw, ty),
        };
        if inst == Instruction::SignExtend32 {
            return self.emit(inst, Type::I64, &[raw]);
        }
        self.emit(inst, ty, &[raw])
    }

    fn read_word_extended(&mut self, reg: Reg, signed: bool) -> CompileResult<OperandId> {
        let value = self.read(reg, Type::I32)?;
        if signed {
            self.emit(Instruction::SignExtend32, Type::I64, &[value])
        } else {
            self.resize(value, Type::I64)
        }
    }

    fn branch_on(&mut self, taken: OperandId, target: u64, next: u64) -> CompileResult<()> {
        let yes = self.new_block();
        let no = self.new_block();
        self.branch_if(taken, yes, no)?;
        self.switch_to(yes);
        self.dispatch_to(target)?;
        self.switch_to(no);
        self.dispatch_to(next)
    }

    fn bitfield(
        &mut self,
        sf: bool,
        op: BitfieldOp,
        rd: Reg,
        rn: Reg,
        immr: u8,
        imms: u8,
    ) -> CompileResult<()> {
        let ty = width(sf);
        let bits = ty.bits();
        let (immr, imms) = (immr as u32 % bits, imms as u32 % bits);
        let src = self.read(rn, ty)?;

        let result = if imms >= immr {
            // Extract imms-immr+1 bits starting at immr into the low bits.
            let len = imms - immr + 1;
            match op {
                BitfieldOp::Ubfm => {
                    let shifted = self.binary_imm(Instruction::ShiftRightLogical, src, immr as u64)?;
                    self.binary_imm(Instruction::And, shifted, mask(len))?
                }
                BitfieldOp::Sbfm => {
                    let up = self.binary_imm(Instruction::ShiftLeft, src, (bits - 1 - imms) as u64)?;
                    self.binary_imm(Instruction::ShiftRightArithmetic, up, (bits - len) as u64)?
                }
                BitfieldOp::Bfm => {
                    let dst = self.read(rd, ty)?;
                    let shifted = self.binary_imm(Instruction::ShiftRightLogical, src, immr as u64)?;
                    let field = self.binary_imm(Instruction::And, shifted, mask(len))?;
                    let kept = self.binary_imm(Instruction::And, dst, !mask(len))?;
                    self.binary(Instruction::Or, kept, field)?
                }
            }
        } else {
            // Insert the low imms+1 bits at position bits-immr.
            let len = imms + 1;
            let position = bits - immr;
            match op {
                BitfieldOp::Ubfm => {
                    let field = self.binary_imm(Instruction::And, src, mask(len))?;
                    self.binary_imm(Instruction::ShiftLeft, field, position as u64)?
                }
                BitfieldOp::Sbfm => {
                    let up = self.binary_imm(Instruction::ShiftLeft, src, (bits - len) as u64)?;
                    let field =
                        self.binary_imm(Instruction::ShiftRightArithmetic, up, (bits - len) as u64)?;
                    self.binary_imm(Instruction::ShiftLeft, field, position as u64)?
                }
                BitfieldOp::Bfm => {
                    let dst = self.read(rd, ty)?;
                    let low = self.binary_imm(Instruction::And, src, mask(len))?;
                    let field = self.binary_imm(Instruction::ShiftLeft, low, position as u64)?;
                    let kept =
                        self.binary_imm(Instruction::And, dst, !(mask(len) << position))?;
                    self.binary(Instruction::Or, kept, field)?
                }
            }
        };
        self.write(rd, result)
    }

    fn reverse(&mut self, sf: bool, kind: ReverseKind, rn: Reg) -> CompileResult<OperandId> {
        let ty = width(sf);
        let src = self.read(rn, ty)?;
        match kind {
            ReverseKind::Rev => self.unary(Instruction::ByteSwap, src),
            ReverseKind::Rev32 => {
                let swapped = self.unary(Instruction::ByteSwap, src)?;
                self.binary_imm(Instruction::RotateRight, swapped, 32)
            }
            ReverseKind::Rev16 => {
                let low_bytes = 0x00ff_00ff_00ff_00ffu64 & ty.mask();
                let high = self.binary_imm(Instruction::ShiftRightLogical, src, 8)?;
                let high = self.binary_imm(Instruction::And, high, low_bytes)?;
                let low = self.binary_imm(Instruction::And, src, low_bytes)?;
                let low = self.binary_imm(Instruction::ShiftLeft, low, 8)?;
                self.binary(Instruction::Or, high, low)
            }
        }
    }

    fn read_nzcv(&mut self) -> CompileResult<OperandId> {
        let mut packed = self.konst(0, Type::I64);
        for (flag, bit) in [(Flag::N, 31), (Flag::Z, 30), (Flag::C, 29), (Flag::V, 28)] {
            let value = self.flag(flag);
            let wide = self.resize(value, Type::I64)?;
            let shifted = self.binary_imm(Instruction::ShiftLeft, wide, bit)?;
            packed = self.binary(Instruction::Or, packed, shifted)?;
        }
        Ok(packed)
    }

    fn write_nzcv(&mut self, value: OperandId) -> CompileResult<()> {
        for (flag, bit) in [(Flag::N, 31), (Flag::Z, 30), (Flag::C, 29), (Flag::V, 28)] {
            let shifted = self.binary_imm(Instruction::ShiftRightLogical, value, bit)?;
            let masked = self.binary_imm(Instruction::And, shifted, 1)?;
            let narrow = self.resize(masked, Type::I32)?;
            self.set_flag(flag, narrow)?;
        }
        Ok(())
    }

    fn undefined(&mut self, opcode: &OpCode) -> CompileResult<()> {
        self.raise(
            Instruction::Undefined,
            opcode.address,
            opcode.raw as u64,
            opcode.next_address(),
        )
    }
}

/// Emit IR for one A64 instruction.
pub fn translate(b: &mut IrBuilder<'_, '_>, opcode: &OpCode, op: A64Op) -> CompileResult<()> {
    let pc = opcode.address;
    let next = opcode.next_address();

    match op {
        A64Op::AddSub {
            sf,
            sub,
            set_flags,
            rd,
            rn,
            operand,
        } => {
            let ty = width(sf);
            let a = b.read(rn, ty)?;
            let m = b.operand2(operand, ty)?;
            if set_flags {
                let flags = if sub {
                    b.sub_with_carry(a, m, CarryIn::One)?
                } else {
                    b.add_with_carry(a, m, CarryIn::Zero)?
                };
                b.set_nzcv(&flags)?;
                b.write(rd, flags.result)?;
            } else {
                let inst = if sub {
                    Instruction::Subtract
                } else {
                    Instruction::Add
                };
                let result = b.binary(inst, a, m)?;
                b.write(rd, result)?;
            }
        }

        A64Op::AddSubCarry {
            sf,
            sub,
            set_flags,
            rd,
            rn,
            rm,
        } => {
            let ty = width(sf);
            let a = b.read(rn, ty)?;
            let m = b.read(rm, ty)?;
            let carry = b.flag(Flag::C);
            let flags = if sub {
                b.sub_with_carry(a, m, CarryIn::Value(carry))?
            } else {
                b.add_with_carry(a, m, CarryIn::Value(carry))?
            };
            if set_flags {
                b.set_nzcv(&flags)?;
            }
            b.write(rd, flags.result)?;
        }

        A64Op::Logical {
            sf,
            op,
            invert,
            set_flags,
            rd,
            rn,
            operand,
        } => {
            let ty = width(sf);
            let a = b.read(rn, ty)?;
            let mut m = b.operand2(operand, ty)?;
            if invert {
                m = b.unary(Instruction::Not, m)?;
            }
            let inst = match op {
                LogicOp::And => Instruction::And,
                LogicOp::Orr => Instruction::Or,
                LogicOp::Eor => Instruction::Xor,
            };
            let result = b.binary(inst, a, m)?;
            if set_flags {
                b.set_nz(result)?;
                let zero = b.konst(0, Type::I32);
                b.set_flag(Flag::C, zero)?;
                b.set_flag(Flag::V, zero)?;
            }
            b.write(rd, result)?;
        }

        A64Op::MoveWide {
            sf,
            op,
            rd,
            imm16,
            shift,
        } => {
            let ty = width(sf);
            let placed = (imm16 as u64) << shift;
            let result = match op {
                MoveWideOp::Movz => b.konst(placed, ty),
                MoveWideOp::Movn => b.konst(!placed, ty),
                MoveWideOp::Movk => {
                    let old = b.read(rd, ty)?;
                    let kept = b.binary_imm(Instruction::And, old, !(0xffffu64 << shift))?;
                    b.binary_imm(Instruction::Or, kept, placed)?
                }
            };
            b.write(rd, result)?;
        }

        A64Op::Adr { rd, target } => {
            let value = b.konst(target, Type::I64);
            b.write(rd, value)?;
        }

        A64Op::Bitfield {
            sf,
            op,
            rd,
            rn,
            immr,
            imms,
        } => b.bitfield(sf, op, rd, rn, immr, imms)?,

        A64Op::Extract {
            sf,
            rd,
            rn,
            rm,
            lsb,
        } => {
            let ty = width(sf);
            let low = b.read(rm, ty)?;
            let result = if lsb == 0 {
                low
            } else {
                let high = b.read(rn, ty)?;
                let low = b.binary_imm(Instruction::ShiftRightLogical, low, lsb as u64)?;
                let high =
                    b.binary_imm(Instruction::ShiftLeft, high, (ty.bits() - lsb as u32) as u64)?;
                b.binary(Instruction::Or, high, low)?
            };
            b.write(rd, result)?;
        }

        A64Op::ShiftVariable {
            sf,
            shift,
            rd,
            rn,
            rm,
        } => {
            let ty = width(sf);
            let value = b.read(rn, ty)?;
            let amount = b.read(rm, ty)?;
            let result = b.shift(value, shift, amount)?;
            b.write(rd, result)?;
        }

        A64Op::Divide {
            sf,
            signed,
            rd,
            rn,
            rm,
        } => {
            let ty = width(sf);
            let n = b.read(rn, ty)?;
            let m = b.read(rm, ty)?;
            let inst = if signed {
                Instruction::DivideSigned
            } else {
                Instruction::DivideUnsigned
            };
            let result = b.binary(inst, n, m)?;
            b.write(rd, result)?;
        }

        A64Op::MulAdd {
            sf,
            sub,
            rd,
            rn,
            rm,
            ra,
        } => {
            let ty = width(sf);
            let n = b.read(rn, ty)?;
            let m = b.read(rm, ty)?;
            let product = b.binary(Instruction::Multiply, n, m)?;
            let result = if ra == Reg::Zr && !sub {
                product
            } else {
                let acc = b.read(ra, ty)?;
                let inst = if sub {
                    Instruction::Subtract
                } else {
                    Instruction::Add
                };
                b.binary(inst, acc, product)?
            };
            b.write(rd, result)?;
        }

        A64Op::MulAddLong {
            signed,
            sub,
            rd,
            rn,
            rm,
            ra,
        } => {
            let n = b.read_word_extended(rn, signed)?;
            let m = b.read_word_extended(rm, signed)?;
            let product = b.binary(Instruction::Multiply, n, m)?;
            let acc = b.read(ra, Type::I64)?;
            let inst = if sub {
                Instruction::Subtract
            } else {
                Instruction::Add
            };
            let result = b.binary(inst, acc, product)?;
            b.write(rd, result)?;
        }

        A64Op::MulHigh { signed, rd, rn, rm } => {
            let n = b.read(rn, Type::I64)?;
            let m = b.read(rm, Type::I64)?;
            let inst = if signed {
                Instruction::MultiplyHighSigned
            } else {
                Instruction::MultiplyHighUnsigned
            };
            let result = b.binary(inst, n, m)?;
            b.write(rd, result)?;
        }

        A64Op::CountLeadingZeros { sf, rd, rn } => {
            let value = b.read(rn, width(sf))?;
            let result = b.unary(Instruction::CountLeadingZeros, value)?;
            b.write(rd, result)?;
        }

        A64Op::Reverse { sf, kind, rd, rn } => {
            let result = b.reverse(sf, kind, rn)?;
            b.write(rd, result)?;
        }

        A64Op::CondSelect {
            sf,
            op,
            rd,
            rn,
            rm,
            cond,
        } => {
            let ty = width(sf);
            let taken = b.condition(cond)?;
            let n = b.read(rn, ty)?;
            let m = b.read(rm, ty)?;
            let alternative = match op {
                CondSelectOp::Csel => m,
                CondSelectOp::Csinc => b.binary_imm(Instruction::Add, m, 1)?,
                CondSelectOp::Csinv => b.unary(Instruction::Not, m)?,
                CondSelectOp::Csneg => b.unary(Instruction::Negate, m)?,
            };
            let result = b.select(taken, n, alternative)?;
            b.write(rd, result)?;
        }

        A64Op::CondCompare {
            sf,
            negative,
            rn,
            operand,
            nzcv,
            cond,
        } => {
            let ty = width(sf);
            let taken = b.condition(cond)?;
            let a = b.read(rn, ty)?;
            let m = match operand {
                CondCompareOperand::Imm(imm) => b.konst(imm as u64, ty),
                CondCompareOperand::Reg(rm) => b.read(rm, ty)?,
            };
            let flags = if negative {
                b.add_with_carry(a, m, CarryIn::Zero)?
            } else {
                b.sub_with_carry(a, m, CarryIn::One)?
            };
            for (flag, computed, bit) in [
                (Flag::N, flags.n, 8),
                (Flag::Z, flags.z, 4),
                (Flag::C, flags.c, 2),
                (Flag::V, flags.v, 1),
            ] {
                let fallback = b.konst((nzcv & bit != 0) as u64, Type::I32);
                let value = b.select(taken, computed, fallback)?;
                b.set_flag(flag, value)?;
            }
        }

        A64Op::Load {
            size,
            signed,
            sf,
            rt,
            addr,
        } => {
            let (address, writeback) = b.address(addr)?;
            let value = b.load_value(size, signed, width(sf), address, pc)?;
            b.write(rt, value)?;
            if let Some(base) = writeback {
                b.write(addr.base, base)?;
            }
        }

        A64Op::Store { size, rt, addr } => {
            let (address, writeback) = b.address(addr)?;
            let ty = if size == MemSize::Double {
                Type::I64
            } else {
                Type::I32
            };
            let value = b.read(rt, ty)?;
            b.store(size, address, value, pc)?;
            if let Some(base) = writeback {
                b.write(addr.base, base)?;
            }
        }

        A64Op::LoadLiteral {
            size,
            signed,
            rt,
            address,
        } => {
            let address = b.konst(address, Type::I64);
            let ty = if size == MemSize::Double || signed {
                Type::I64
            } else {
                Type::I32
            };
            let value = b.load_value(size, signed, ty, address, pc)?;
            b.write(rt, value)?;
        }

        A64Op::LoadPair {
            size,
            signed,
            rt,
            rt2,
            addr,
        } => {
            let (address, writeback) = b.address(addr)?;
            let ty = if size == MemSize::Double || signed {
                Type::I64
            } else {
                Type::I32
            };
            let first = b.load_value(size, signed, ty, address, pc)?;
            let second_address = b.binary_imm(Instruction::Add, address, size.bytes())?;
            let second = b.load_value(size, signed, ty, second_address, pc)?;
            b.write(rt, first)?;
            b.write(rt2, second)?;
            if let Some(base) = writeback {
                b.write(addr.base, base)?;
            }
        }

        A64Op::StorePair {
            size,
            rt,
            rt2,
            addr,
        } => {
            let (address, writeback) = b.address(addr)?;
            let ty = if size == MemSize::Double {
                Type::I64
            } else {
                Type::I32
            };
            let first = b.read(rt, ty)?;
            let second = b.read(rt2, ty)?;
            b.store(size, address, first, pc)?;
            let second_address = b.binary_imm(Instruction::Add, address, size.bytes())?;
            b.store(size, second_address, second, pc)?;
            if let Some(base) = writeback {
                b.write(addr.base, base)?;
            }
        }

        A64Op::Branch { target } => b.dispatch_to(target)?,

        A64Op::BranchLink { target } => {
            let link = b.konst(next, Type::I64);
            b.write_gpr(LR, link)?;
            b.dispatch_to(target)?;
        }

        A64Op::BranchCond { cond, target } => {
            if matches!(cond, Cond::Al | Cond::Nv) {
                b.dispatch_to(target)?;
            } else {
                let taken = b.condition(cond)?;
                b.branch_on(taken, target, next)?;
            }
        }

        A64Op::CompareBranch {
            sf,
            nonzero,
            rt,
            target,
        } => {
            let value = b.read(rt, width(sf))?;
            let cond = if nonzero {
                Condition::Ne
            } else {
                Condition::Eq
            };
            let taken = b.compare_imm(cond, value, 0)?;
            b.branch_on(taken, target, next)?;
        }

        A64Op::TestBranch {
            bit,
            nonzero,
            rt,
            target,
        } => {
            let value = b.read(rt, Type::I64)?;
            let tested = b.binary_imm(Instruction::And, value, 1u64 << (bit & 63))?;
            let cond = if nonzero {
                Condition::Ne
            } else {
                Condition::Eq
            };
            let taken = b.compare_imm(cond, tested, 0)?;
            b.branch_on(taken, target, next)?;
        }

        A64Op::BranchRegister { kind, rn } => {
            let target = b.read(rn, Type::I64)?;
            if kind == BranchRegKind::Blr {
                let link = b.konst(next, Type::I64);
                b.write_gpr(LR, link)?;
            }
            b.dispatch(target)?;
        }

        A64Op::Svc { imm } => b.raise(Instruction::SupervisorCall, pc, imm as u64, next)?,
        A64Op::Brk { imm } => b.raise(Instruction::Breakpoint, pc, imm as u64, next)?,

        A64Op::Mrs { rt, reg } => {
            let value = match reg {
                SysReg::Nzcv => b.read_nzcv()?,
                SysReg::Fpcr => b.load_context(ContextField::Fpcr, Type::I64)?,
                SysReg::Fpsr => b.load_context(ContextField::Fpsr, Type::I64)?,
                SysReg::TpidrEl0 => b.load_context(ContextField::TpidrEl0, Type::I64)?,
                SysReg::TpidrroEl0 => b.load_context(ContextField::TpidrroEl0, Type::I64)?,
                SysReg::CntvctEl0 | SysReg::CntpctEl0 => {
                    b.emit(Instruction::ReadCounter, Type::I64, &[])?
                }
                SysReg::CntfrqEl0 => b.emit(Instruction::ReadFrequency, Type::I64, &[])?,
                SysReg::CtrEl0 => b.konst(CTR_EL0_VALUE, Type::I64),
                SysReg::DczidEl0 => b.konst(DCZID_EL0_VALUE, Type::I64),
            };
            b.write(rt, value)?;
        }

        A64Op::Msr { rt, reg } => {
            let value = b.read(rt, Type::I64)?;
            match reg {
                SysReg::Nzcv => b.write_nzcv(value)?,
                SysReg::Fpcr => b.store_context(ContextField::Fpcr, value)?,
                SysReg::Fpsr => b.store_context(ContextField::Fpsr, value)?,
                SysReg::TpidrEl0 => b.store_context(ContextField::TpidrEl0, value)?,
                _ => b.undefined(opcode)?,
            }
        }

        A64Op::InvalidateInstructionCache { rt } => {
            let address = b.read(rt, Type::I64)?;
            b.effect(Instruction::InvalidateCacheLine, &[address])?;
            b.dispatch_to(next)?;
        }

        A64Op::DataCacheZero { rt } => {
            let address = b.read(rt, Type::I64)?;
            let base = b.binary_imm(Instruction::And, address, !(DC_ZVA_BLOCK - 1))?;
            let zero = b.konst(0, Type::I64);
            for offset in (0..DC_ZVA_BLOCK).step_by(8) {
                let target = b.binary_imm(Instruction::Add, base, offset)?;
                b.store(MemSize::Double, target, zero, pc)?;
            }
        }

        A64Op::Nop => {}

        A64Op::Undefined => b.undefined(opcode)?,
    }
    Ok(())
}
