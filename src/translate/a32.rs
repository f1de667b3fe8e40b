//! A32 instruction translation.
//!
//! Every instruction is wrapped in its condition. Reads of PC yield the architectural
//! `address + 8`; writes to PC end the function with a dispatch to the written value.

use super::{CarryIn, IrBuilder};
use crate::core::error::CompileResult;
use crate::decoder::a32::{
    A32Instr, A32Offset, A32Op, A32Shift, BlockMode, CoprocReg, DpOpcode, ExtraKind,
    ShifterOperand, ShiftedReg, LR, PC,
};
use crate::decoder::{MemSize, OpCode, ShiftType};
use crate::ir::{ContextField, Flag, Instruction, OperandId, Type};

/// Alignment mask applied to values written to PC by data processing and loads.
const ARM_PC_MASK: u64 = !3;
/// BX clears only the interworking bit.
const BX_PC_MASK: u64 = !1;

impl IrBuilder<'_, '_> {
    fn a32_read(&mut self, reg: u8, pc: u64) -> OperandId {
        if reg == PC {
            self.konst(pc.wrapping_add(8), Type::I32)
        } else {
            self.gpr(reg)
        }
    }

    /// Write a register; writes to PC end the function.
    fn a32_write(&mut self, reg: u8, value: OperandId, pc_mask: u64) -> CompileResult<()> {
        if reg == PC {
            let target = self.binary_imm(Instruction::And, value, pc_mask & 0xffff_ffff)?;
            self.dispatch(target)
        } else {
            self.write_gpr(reg, value)
        }
    }

    fn a32_shift_imm(
        &mut self,
        value: OperandId,
        inst: Instruction,
        amount: u32,
    ) -> CompileResult<OperandId> {
        self.binary_imm(inst, value, amount as u64)
    }

    /// Bit `index` of `value` as an I32 0/1.
    fn a32_bit(&mut self, value: OperandId, index: u32) -> CompileResult<OperandId> {
        let shifted = if index == 0 {
            value
        } else {
            self.binary_imm(Instruction::ShiftRightLogical, value, index as u64)?
        };
        self.binary_imm(Instruction::And, shifted, 1)
    }

    /// Shifted register operand with its carry-out; `None` leaves C unchanged.
    fn a32_shifted(
        &mut self,
        shifted: ShiftedReg,
        pc: u64,
    ) -> CompileResult<(OperandId, Option<OperandId>)> {
        let value = self.a32_read(shifted.rm, pc);
        let result = match shifted.shift {
            A32Shift::Imm(_, 0) => (value, None),
            A32Shift::Imm(ShiftType::Lsl, n) => {
                let n = n as u32;
                let carry = self.a32_bit(value, 32 - n)?;
                (
                    self.a32_shift_imm(value, Instruction::ShiftLeft, n)?,
                    Some(carry),
                )
            }
            A32Shift::Imm(ShiftType::Lsr, n) => {
                let n = n as u32;
                let carry = self.a32_bit(value, n - 1)?;
                let shifted = if n >= 32 {
                    self.konst(0, Type::I32)
                } else {
                    self.a32_shift_imm(value, Instruction::ShiftRightLogical, n)?
                };
                (shifted, Some(carry))
            }
            A32Shift::Imm(ShiftType::Asr, n) => {
                let n = (n as u32).min(32);
                let carry = self.a32_bit(value, n - 1)?;
                let shifted =
                    self.a32_shift_imm(value, Instruction::ShiftRightArithmetic, n.min(31))?;
                (shifted, Some(carry))
            }
            A32Shift::Imm(ShiftType::Ror, n) => {
                let n = n as u32;
                let carry = self.a32_bit(value, n - 1)?;
                (
                    self.a32_shift_imm(value, Instruction::RotateRight, n)?,
                    Some(carry),
                )
            }
            A32Shift::Rrx => {
                let carry_in = self.flag(Flag::C);
                let top = self.binary_imm(Instruction::ShiftLeft, carry_in, 31)?;
                let rest = self.binary_imm(Instruction::ShiftRightLogical, value, 1)?;
                let carry = self.binary_imm(Instruction::And, value, 1)?;
                (self.binary(Instruction::Or, top, rest)?, Some(carry))
            }
        };
        Ok(result)
    }

    fn a32_operand(
        &mut self,
        operand: ShifterOperand,
        pc: u64,
    ) -> CompileResult<(OperandId, Option<OperandId>)> {
        match operand {
            ShifterOperand::Imm { value, carry } => {
                let value = self.konst(value as u64, Type::I32);
                let carry = carry.map(|c| self.konst(c as u64, Type::I32));
                Ok((value, carry))
            }
            ShifterOperand::Reg(shifted) => self.a32_shifted(shifted, pc),
        }
    }

    fn a32_offset(&mut self, offset: A32Offset, pc: u64) -> CompileResult<OperandId> {
        match offset {
            A32Offset::Imm(imm) => Ok(self.konst(imm as u64, Type::I32)),
            A32Offset::Reg(shifted) => Ok(self.a32_shifted(shifted, pc)?.0),
        }
    }

    /// Returns the access address and the offset address used for writeback.
    fn a32_address(
        &mut self,
        rn: u8,
        offset: A32Offset,
        add: bool,
        pre_index: bool,
        pc: u64,
    ) -> CompileResult<(OperandId, OperandId)> {
        let base = self.a32_read(rn, pc);
        let offset = self.a32_offset(offset, pc)?;
        let inst = if add {
            Instruction::Add
        } else {
            Instruction::Subtract
        };
        let offset_address = self.binary(inst, base, offset)?;
        let access = if pre_index { offset_address } else { base };
        Ok((access, offset_address))
    }

    fn a32_data_processing(
        &mut self,
        opcode: DpOpcode,
        set_flags: bool,
        rd: u8,
        rn: u8,
        operand: ShifterOperand,
        pc: u64,
    ) -> CompileResult<()> {
        let (m, shifter_carry) = self.a32_operand(operand, pc)?;
        let n = self.a32_read(rn, pc);
        let carry = self.flag(Flag::C);

        let result = if opcode.is_logical() {
            let result = match opcode {
                DpOpcode::And | DpOpcode::Tst => self.binary(Instruction::And, n, m)?,
                DpOpcode::Eor | DpOpcode::Teq => self.binary(Instruction::Xor, n, m)?,
                DpOpcode::Orr => self.binary(Instruction::Or, n, m)?,
                DpOpcode::Mov => m,
                DpOpcode::Bic => {
                    let inverted = self.unary(Instruction::Not, m)?;
                    self.binary(Instruction::And, n, inverted)?
                }
                _ => self.unary(Instruction::Not, m)?,
            };
            if set_flags {
                self.set_nz(result)?;
                if let Some(c) = shifter_carry {
                    self.set_flag(Flag::C, c)?;
                }
            }
            result
        } else {
            let flags = match opcode {
                DpOpcode::Add | DpOpcode::Cmn => self.add_with_carry(n, m, CarryIn::Zero)?,
                DpOpcode::Sub | DpOpcode::Cmp => self.sub_with_carry(n, m, CarryIn::One)?,
                DpOpcode::Rsb => self.sub_with_carry(m, n, CarryIn::One)?,
                DpOpcode::Adc => self.add_with_carry(n, m, CarryIn::Value(carry))?,
                DpOpcode::Sbc => self.sub_with_carry(n, m, CarryIn::Value(carry))?,
                _ => self.sub_with_carry(m, n, CarryIn::Value(carry))?,
            };
            if set_flags {
                self.set_nzcv(&flags)?;
            }
            flags.result
        };

        if opcode.is_test() {
            return Ok(());
        }
        self.a32_write(rd, result, ARM_PC_MASK)
    }

    fn a32_load_store_multiple(
        &mut self,
        load: bool,
        rn: u8,
        registers: u16,
        mode: BlockMode,
        writeback: bool,
        pc: u64,
    ) -> CompileResult<()> {
        let count = registers.count_ones() as u64;
        let base = self.a32_read(rn, pc);
        let (start, new_base) = match mode {
            BlockMode::IncrementAfter => (0i64, 4 * count as i64),
            BlockMode::IncrementBefore => (4, 4 * count as i64),
            BlockMode::DecrementAfter => (4 - 4 * count as i64, -4 * count as i64),
            BlockMode::DecrementBefore => (-4 * count as i64, -4 * count as i64),
        };

        let mut loaded = Vec::new();
        let mut offset = start;
        for reg in (0..16u8).filter(|r| registers & (1 << r) != 0) {
            let address = self.binary_imm(Instruction::Add, base, offset as u64)?;
            if load {
                let value = self.load(MemSize::Word, address, Type::I32, pc)?;
                loaded.push((reg, value));
            } else {
                let value = self.a32_read(reg, pc);
                self.store(MemSize::Word, address, value, pc)?;
            }
            offset += 4;
        }

        let base_loaded = load && registers & (1 << rn) != 0;
        if writeback && !base_loaded {
            let updated = self.binary_imm(Instruction::Add, base, new_base as u64)?;
            self.write_gpr(rn, updated)?;
        }
        for (reg, value) in loaded {
            self.a32_write(reg, value, ARM_PC_MASK)?;
        }
        Ok(())
    }

    fn a32_op(&mut self, opcode: &OpCode, op: A32Op) -> CompileResult<()> {
        let pc = opcode.address;
        let next = opcode.next_address();

        match op {
            A32Op::DataProcessing {
                opcode: dp,
                set_flags,
                rd,
                rn,
                operand,
            } => self.a32_data_processing(dp, set_flags, rd, rn, operand, pc)?,

            A32Op::MoveWide { top, rd, imm16 } => {
                let result = if top {
                    let old = self.a32_read(rd, pc);
                    let low = self.binary_imm(Instruction::And, old, 0xffff)?;
                    self.binary_imm(Instruction::Or, low, (imm16 as u64) << 16)?
                } else {
                    self.konst(imm16 as u64, Type::I32)
                };
                self.write_gpr(rd, result)?;
            }

            A32Op::Multiply {
                accumulate,
                set_flags,
                rd,
                rn,
                rm,
                ra,
            } => {
                let n = self.a32_read(rn, pc);
                let m = self.a32_read(rm, pc);
                let mut result = self.binary(Instruction::Multiply, n, m)?;
                if accumulate {
                    let acc = self.a32_read(ra, pc);
                    result = self.binary(Instruction::Add, result, acc)?;
                }
                if set_flags {
                    self.set_nz(result)?;
                }
                self.write_gpr(rd, result)?;
            }

            A32Op::MultiplyLong {
                signed,
                accumulate,
                set_flags,
                rd_lo,
                rd_hi,
                rn,
                rm,
            } => {
                let widen = if signed {
                    Instruction::SignExtend32
                } else {
                    Instruction::ZeroExtend32
                };
                let n = self.a32_read(rn, pc);
                let m = self.a32_read(rm, pc);
                let n = self.emit(widen, Type::I64, &[n])?;
                let m = self.emit(widen, Type::I64, &[m])?;
                let mut product = self.binary(Instruction::Multiply, n, m)?;
                if accumulate {
                    let lo = self.a32_read(rd_lo, pc);
                    let hi = self.a32_read(rd_hi, pc);
                    let lo = self.resize(lo, Type::I64)?;
                    let hi = self.resize(hi, Type::I64)?;
                    let hi = self.binary_imm(Instruction::ShiftLeft, hi, 32)?;
                    let acc = self.binary(Instruction::Or, hi, lo)?;
                    product = self.binary(Instruction::Add, product, acc)?;
                }
                if set_flags {
                    self.set_nz(product)?;
                }
                let lo = self.resize(product, Type::I32)?;
                let high = self.binary_imm(Instruction::ShiftRightLogical, product, 32)?;
                let hi = self.resize(high, Type::I32)?;
                self.write_gpr(rd_lo, lo)?;
                self.write_gpr(rd_hi, hi)?;
            }

            A32Op::CountLeadingZeros { rd, rm } => {
                let value = self.a32_read(rm, pc);
                let result = self.unary(Instruction::CountLeadingZeros, value)?;
                self.write_gpr(rd, result)?;
            }

            A32Op::LoadStore {
                load,
                size,
                rt,
                rn,
                offset,
                add,
                pre_index,
                writeback,
            } => {
                let (access, offset_address) = self.a32_address(rn, offset, add, pre_index, pc)?;
                if load {
                    let value = self.load(size, access, Type::I32, pc)?;
                    if writeback && rn != rt {
                        self.write_gpr(rn, offset_address)?;
                    }
                    self.a32_write(rt, value, ARM_PC_MASK)?;
                } else {
                    let value = self.a32_read(rt, pc);
                    self.store(size, access, value, pc)?;
                    if writeback {
                        self.write_gpr(rn, offset_address)?;
                    }
                }
            }

            A32Op::LoadStoreExtra {
                load,
                kind,
                rt,
                rn,
                offset,
                add,
                pre_index,
                writeback,
            } => {
                let (access, offset_address) = self.a32_address(rn, offset, add, pre_index, pc)?;
                if load {
                    let value = match kind {
                        ExtraKind::Half => self.load(MemSize::Half, access, Type::I32, pc)?,
                        ExtraKind::SignedByte => {
                            let raw = self.load(MemSize::Byte, access, Type::I32, pc)?;
                            self.unary(Instruction::SignExtend8, raw)?
                        }
                        ExtraKind::SignedHalf => {
                            let raw = self.load(MemSize::Half, access, Type::I32, pc)?;
                            self.unary(Instruction::SignExtend16, raw)?
                        }
                    };
                    if writeback && rn != rt {
                        self.write_gpr(rn, offset_address)?;
                    }
                    self.write_gpr(rt, value)?;
                } else {
                    let value = self.a32_read(rt, pc);
                    self.store(MemSize::Half, access, value, pc)?;
                    if writeback {
                        self.write_gpr(rn, offset_address)?;
                    }
                }
            }

            A32Op::LoadStoreMultiple {
                load,
                rn,
                registers,
                mode,
                writeback,
            } => self.a32_load_store_multiple(load, rn, registers, mode, writeback, pc)?,

            A32Op::Branch { link, target } => {
                if link {
                    let ret = self.konst(next, Type::I32);
                    self.write_gpr(LR, ret)?;
                }
                self.dispatch_to(target)?;
            }

            A32Op::BranchExchange { link, rm } => {
                let target = self.a32_read(rm, pc);
                if link {
                    let ret = self.konst(next, Type::I32);
                    self.write_gpr(LR, ret)?;
                }
                let target = self.binary_imm(Instruction::And, target, BX_PC_MASK & 0xffff_ffff)?;
                self.dispatch(target)?;
            }

            A32Op::Svc { imm } => {
                self.raise(Instruction::SupervisorCall, pc, imm as u64, next)?
            }
            A32Op::Bkpt { imm } => self.raise(Instruction::Breakpoint, pc, imm as u64, next)?,

            A32Op::ReadCoprocessor { rt, reg } => {
                let field = match reg {
                    CoprocReg::TpidrUrw => ContextField::TpidrEl0,
                    CoprocReg::TpidrUro => ContextField::TpidrroEl0,
                };
                let value = self.load_context(field, Type::I64)?;
                let value = self.resize(value, Type::I32)?;
                self.a32_write(rt, value, ARM_PC_MASK)?;
            }

            A32Op::WriteCoprocessor { rt, reg } => match reg {
                CoprocReg::TpidrUrw => {
                    let value = self.a32_read(rt, pc);
                    let value = self.resize(value, Type::I64)?;
                    self.store_context(ContextField::TpidrEl0, value)?;
                }
                CoprocReg::TpidrUro => self.raise(
                    Instruction::Undefined,
                    pc,
                    opcode.raw as u64,
                    next,
                )?,
            },

            A32Op::Nop => {}

            A32Op::Undefined => {
                self.raise(Instruction::Undefined, pc, opcode.raw as u64, next)?
            }
        }
        Ok(())
    }
}

/// Emit IR for one A32 instruction, honouring its condition.
pub fn translate(b: &mut IrBuilder<'_, '_>, opcode: &OpCode, instr: A32Instr) -> CompileResult<()> {
    b.conditional(instr.cond, |b| b.a32_op(opcode, instr.op))
}
