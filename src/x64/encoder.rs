// This module provides the x86-64 instruction encoding layer on top of the iced-x86 code_asm
// assembler. X64Encoder converts AsmReg register references into iced register operands of
// the requested width and exposes the small instruction vocabulary the code generator and the
// runtime stubs need: moves and zero/sign extensions, two-operand ALU forms, shifts, the
// rdx:rax multiply/divide group, SETcc/CMOVcc, context-relative memory operands, locked
// exchange-add for call counters and label-based control flow. All absolute targets (native
// entry points, address table slots, counters) are materialized with 64-bit immediates, so the
// assembled bytes are position independent and can be copied into any arena range. Operand
// widths follow the IR: 32-bit operations write the 32-bit register, which clears the upper
// half, so an I32 value is always held zero-extended.

//! x86-64 instruction encoding using iced-x86.

use crate::core::register_file::AsmReg;
use crate::ir::Type;
use iced_x86::code_asm::*;
use iced_x86::{
    Code, Decoder, DecoderOptions, Formatter, Instruction, IntelFormatter, Register,
};
use std::collections::HashMap;
use thiserror::Error;

/// Error types for instruction encoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Invalid register for the requested operation.
    #[error("Invalid register for operation")]
    InvalidRegister,
    /// Unsupported instruction or operand combination.
    #[error("Unsupported instruction or operand combination")]
    UnsupportedInstruction,
    /// Assembly error from iced-x86.
    #[error("Assembly error: {0}")]
    AssemblyError(String),
    /// Memory operand construction failed.
    #[error("Invalid memory operand")]
    InvalidMemoryOperand,
}

pub type EncodeResult<T> = Result<T, EncodingError>;

fn asm_err(e: IcedError) -> EncodingError {
    EncodingError::AssemblyError(e.to_string())
}

/// Hardware numbers of the registers the runtime refers to by name.
pub mod regs {
    use crate::core::register_file::AsmReg;

    pub const RAX: AsmReg = AsmReg::gp(0);
    pub const RCX: AsmReg = AsmReg::gp(1);
    pub const RDX: AsmReg = AsmReg::gp(2);
    pub const RBX: AsmReg = AsmReg::gp(3);
    pub const RSP: AsmReg = AsmReg::gp(4);
    pub const RBP: AsmReg = AsmReg::gp(5);
    pub const RSI: AsmReg = AsmReg::gp(6);
    pub const RDI: AsmReg = AsmReg::gp(7);
    pub const R8: AsmReg = AsmReg::gp(8);
    pub const R9: AsmReg = AsmReg::gp(9);
    pub const R10: AsmReg = AsmReg::gp(10);
    pub const R11: AsmReg = AsmReg::gp(11);
    pub const R12: AsmReg = AsmReg::gp(12);
    pub const R13: AsmReg = AsmReg::gp(13);
    pub const R14: AsmReg = AsmReg::gp(14);
    pub const R15: AsmReg = AsmReg::gp(15);
}

/// Width of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    B8,
    B16,
    B32,
    B64,
}

impl Width {
    pub fn from_bytes(bytes: u32) -> EncodeResult<Self> {
        match bytes {
            1 => Ok(Width::B8),
            2 => Ok(Width::B16),
            4 => Ok(Width::B32),
            8 => Ok(Width::B64),
            _ => Err(EncodingError::InvalidMemoryOperand),
        }
    }
}

/// Two-operand integer ALU instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Cmp,
    Test,
    Imul,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Shl,
    Shr,
    Sar,
    Ror,
}

/// x86 condition codes used by SETcc, CMOVcc and Jcc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondCode {
    E,
    Ne,
    B,
    Be,
    A,
    Ae,
    L,
    Le,
    G,
    Ge,
}

/// Handle to a label created by [`X64Encoder::create_label`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

const GP64_REGS: [AsmRegister64; 16] = [
    rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15,
];

const GP32_REGS: [AsmRegister32; 16] = [
    eax, ecx, edx, ebx, esp, ebp, esi, edi, r8d, r9d, r10d, r11d, r12d, r13d, r14d, r15d,
];

const GP16_REGS: [AsmRegister16; 16] = [
    ax, cx, dx, bx, sp, bp, si, di, r8w, r9w, r10w, r11w, r12w, r13w, r14w, r15w,
];

const GP8_REGS: [AsmRegister8; 16] = [
    al, cl, dl, bl, spl, bpl, sil, dil, r8b, r9b, r10b, r11b, r12b, r13b, r14b, r15b,
];

fn lookup<T: Copy>(table: &[T; 16], reg: AsmReg) -> EncodeResult<T> {
    if reg.bank != 0 {
        return Err(EncodingError::InvalidRegister);
    }
    table
        .get(reg.id as usize)
        .copied()
        .ok_or(EncodingError::InvalidRegister)
}

fn gp64(reg: AsmReg) -> EncodeResult<AsmRegister64> {
    lookup(&GP64_REGS, reg)
}

fn gp32(reg: AsmReg) -> EncodeResult<AsmRegister32> {
    lookup(&GP32_REGS, reg)
}

fn gp16(reg: AsmReg) -> EncodeResult<AsmRegister16> {
    lookup(&GP16_REGS, reg)
}

fn gp8(reg: AsmReg) -> EncodeResult<AsmRegister8> {
    lookup(&GP8_REGS, reg)
}

fn mem(base: AsmReg, offset: i32) -> EncodeResult<AsmMemoryOperand> {
    Ok(gp64(base)? + offset)
}

/// x86-64 instruction encoder using iced-x86.
pub struct X64Encoder {
    assembler: CodeAssembler,
    labels: Vec<CodeLabel>,
    block_labels: HashMap<usize, Label>,
    /// Instruction index the most recently placed label is waiting for.
    label_at: Option<usize>,
}

impl X64Encoder {
    pub fn new() -> EncodeResult<Self> {
        let assembler = CodeAssembler::new(64).map_err(asm_err)?;
        Ok(Self {
            assembler,
            labels: Vec::new(),
            block_labels: HashMap::new(),
            label_at: None,
        })
    }

    // ==== LABELS ====

    pub fn create_label(&mut self) -> Label {
        self.labels.push(self.assembler.create_label());
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the next instruction. iced allows one label per instruction, so a
    /// label placed right after another one gets a nop to attach to.
    pub fn place_label(&mut self, label: Label) -> EncodeResult<()> {
        self.flush_label()?;
        let code_label = &mut self.labels[label.0];
        self.assembler.set_label(code_label).map_err(asm_err)?;
        self.label_at = Some(self.assembler.instructions().len());
        Ok(())
    }

    fn flush_label(&mut self) -> EncodeResult<()> {
        if self.label_at == Some(self.assembler.instructions().len()) {
            self.nop()?;
        }
        self.label_at = None;
        Ok(())
    }

    pub fn nop(&mut self) -> EncodeResult<()> {
        self.assembler.nop().map_err(asm_err)
    }

    /// Create or get the label of a basic block.
    pub fn label_for_block(&mut self, block: usize) -> Label {
        if let Some(&label) = self.block_labels.get(&block) {
            return label;
        }
        let label = self.create_label();
        self.block_labels.insert(block, label);
        label
    }

    // ==== MOVES ====

    /// Register copy; a 32-bit copy clears the upper half.
    pub fn mov_rr(&mut self, ty: Type, dst: AsmReg, src: AsmReg) -> EncodeResult<()> {
        match ty {
            Type::I32 => self.assembler.mov(gp32(dst)?, gp32(src)?),
            Type::I64 => self.assembler.mov(gp64(dst)?, gp64(src)?),
        }
        .map_err(asm_err)
    }

    /// Load a 64-bit constant using the shortest encoding.
    pub fn mov_ri(&mut self, dst: AsmReg, value: u64) -> EncodeResult<()> {
        if value <= u32::MAX as u64 {
            self.assembler.mov(gp32(dst)?, value as u32)
        } else if let Ok(imm) = i32::try_from(value as i64) {
            let reg: Register = gp64(dst)?.into();
            let inst = Instruction::with2(Code::Mov_rm64_imm32, reg, imm).map_err(asm_err)?;
            self.assembler.add_instruction(inst)
        } else {
            self.assembler.mov(gp64(dst)?, value)
        }
        .map_err(asm_err)
    }

    /// Zero-extending load from `[base + offset]`.
    pub fn load(
        &mut self,
        width: Width,
        dst: AsmReg,
        base: AsmReg,
        offset: i32,
    ) -> EncodeResult<()> {
        let address = mem(base, offset)?;
        match width {
            Width::B8 => self.assembler.movzx(gp32(dst)?, byte_ptr(address)),
            Width::B16 => self.assembler.movzx(gp32(dst)?, word_ptr(address)),
            Width::B32 => self.assembler.mov(gp32(dst)?, dword_ptr(address)),
            Width::B64 => self.assembler.mov(gp64(dst)?, qword_ptr(address)),
        }
        .map_err(asm_err)
    }

    pub fn store(
        &mut self,
        width: Width,
        base: AsmReg,
        offset: i32,
        src: AsmReg,
    ) -> EncodeResult<()> {
        let address = mem(base, offset)?;
        match width {
            Width::B8 => self.assembler.mov(byte_ptr(address), gp8(src)?),
            Width::B16 => self.assembler.mov(word_ptr(address), gp16(src)?),
            Width::B32 => self.assembler.mov(dword_ptr(address), gp32(src)?),
            Width::B64 => self.assembler.mov(qword_ptr(address), gp64(src)?),
        }
        .map_err(asm_err)
    }

    /// Store a sign-extended 32-bit immediate.
    pub fn store_imm(
        &mut self,
        width: Width,
        base: AsmReg,
        offset: i32,
        imm: i32,
    ) -> EncodeResult<()> {
        let address = mem(base, offset)?;
        match width {
            Width::B32 => self.assembler.mov(dword_ptr(address), imm),
            Width::B64 => self.assembler.mov(qword_ptr(address), imm),
            _ => return Err(EncodingError::UnsupportedInstruction),
        }
        .map_err(asm_err)
    }

    pub fn movzx(&mut self, from: Width, dst: AsmReg, src: AsmReg) -> EncodeResult<()> {
        match from {
            Width::B8 => self.assembler.movzx(gp32(dst)?, gp8(src)?),
            Width::B16 => self.assembler.movzx(gp32(dst)?, gp16(src)?),
            Width::B32 => self.assembler.mov(gp32(dst)?, gp32(src)?),
            Width::B64 => self.assembler.mov(gp64(dst)?, gp64(src)?),
        }
        .map_err(asm_err)
    }

    /// Sign extension of the low `from` bits of `src` into a `ty` register.
    pub fn movsx(&mut self, ty: Type, from: Width, dst: AsmReg, src: AsmReg) -> EncodeResult<()> {
        match (ty, from) {
            (Type::I32, Width::B8) => self.assembler.movsx(gp32(dst)?, gp8(src)?),
            (Type::I32, Width::B16) => self.assembler.movsx(gp32(dst)?, gp16(src)?),
            (Type::I32, _) => self.assembler.mov(gp32(dst)?, gp32(src)?),
            (Type::I64, Width::B8) => self.assembler.movsx(gp64(dst)?, gp8(src)?),
            (Type::I64, Width::B16) => self.assembler.movsx(gp64(dst)?, gp16(src)?),
            (Type::I64, Width::B32) => self.assembler.movsxd(gp64(dst)?, gp32(src)?),
            (Type::I64, Width::B64) => self.assembler.mov(gp64(dst)?, gp64(src)?),
        }
        .map_err(asm_err)
    }

    // ==== ARITHMETIC ====

    pub fn alu_rr(&mut self, op: AluOp, ty: Type, dst: AsmReg, src: AsmReg) -> EncodeResult<()> {
        let a = &mut self.assembler;
        match ty {
            Type::I32 => {
                let (d, s) = (gp32(dst)?, gp32(src)?);
                match op {
                    AluOp::Add => a.add(d, s),
                    AluOp::Sub => a.sub(d, s),
                    AluOp::And => a.and(d, s),
                    AluOp::Or => a.or(d, s),
                    AluOp::Xor => a.xor(d, s),
                    AluOp::Cmp => a.cmp(d, s),
                    AluOp::Test => a.test(d, s),
                    AluOp::Imul => a.imul_2(d, s),
                }
            }
            Type::I64 => {
                let (d, s) = (gp64(dst)?, gp64(src)?);
                match op {
                    AluOp::Add => a.add(d, s),
                    AluOp::Sub => a.sub(d, s),
                    AluOp::And => a.and(d, s),
                    AluOp::Or => a.or(d, s),
                    AluOp::Xor => a.xor(d, s),
                    AluOp::Cmp => a.cmp(d, s),
                    AluOp::Test => a.test(d, s),
                    AluOp::Imul => a.imul_2(d, s),
                }
            }
        }
        .map_err(asm_err)
    }

    /// ALU operation with a sign-extended 32-bit immediate.
    pub fn alu_ri(&mut self, op: AluOp, ty: Type, dst: AsmReg, imm: i32) -> EncodeResult<()> {
        let a = &mut self.assembler;
        match ty {
            Type::I32 => {
                let d = gp32(dst)?;
                match op {
                    AluOp::Add => a.add(d, imm),
                    AluOp::Sub => a.sub(d, imm),
                    AluOp::And => a.and(d, imm),
                    AluOp::Or => a.or(d, imm),
                    AluOp::Xor => a.xor(d, imm),
                    AluOp::Cmp => a.cmp(d, imm),
                    AluOp::Test => a.test(d, imm),
                    AluOp::Imul => a.imul_3(d, d, imm),
                }
            }
            Type::I64 => {
                let d = gp64(dst)?;
                match op {
                    AluOp::Add => a.add(d, imm),
                    AluOp::Sub => a.sub(d, imm),
                    AluOp::And => a.and(d, imm),
                    AluOp::Or => a.or(d, imm),
                    AluOp::Xor => a.xor(d, imm),
                    AluOp::Cmp => a.cmp(d, imm),
                    AluOp::Test => a.test(d, imm),
                    AluOp::Imul => a.imul_3(d, d, imm),
                }
            }
        }
        .map_err(asm_err)
    }

    pub fn shift_ri(&mut self, op: ShiftOp, ty: Type, dst: AsmReg, amount: u32) -> EncodeResult<()> {
        let a = &mut self.assembler;
        match ty {
            Type::I32 => {
                let d = gp32(dst)?;
                match op {
                    ShiftOp::Shl => a.shl(d, amount),
                    ShiftOp::Shr => a.shr(d, amount),
                    ShiftOp::Sar => a.sar(d, amount),
                    ShiftOp::Ror => a.ror(d, amount),
                }
            }
            Type::I64 => {
                let d = gp64(dst)?;
                match op {
                    ShiftOp::Shl => a.shl(d, amount),
                    ShiftOp::Shr => a.shr(d, amount),
                    ShiftOp::Sar => a.sar(d, amount),
                    ShiftOp::Ror => a.ror(d, amount),
                }
            }
        }
        .map_err(asm_err)
    }

    /// Shift by CL; the hardware masks the count to the operand width.
    pub fn shift_cl(&mut self, op: ShiftOp, ty: Type, dst: AsmReg) -> EncodeResult<()> {
        let a = &mut self.assembler;
        match ty {
            Type::I32 => {
                let d = gp32(dst)?;
                match op {
                    ShiftOp::Shl => a.shl(d, cl),
                    ShiftOp::Shr => a.shr(d, cl),
                    ShiftOp::Sar => a.sar(d, cl),
                    ShiftOp::Ror => a.ror(d, cl),
                }
            }
            Type::I64 => {
                let d = gp64(dst)?;
                match op {
                    ShiftOp::Shl => a.shl(d, cl),
                    ShiftOp::Shr => a.shr(d, cl),
                    ShiftOp::Sar => a.sar(d, cl),
                    ShiftOp::Ror => a.ror(d, cl),
                }
            }
        }
        .map_err(asm_err)
    }

    pub fn neg(&mut self, ty: Type, dst: AsmReg) -> EncodeResult<()> {
        match ty {
            Type::I32 => self.assembler.neg(gp32(dst)?),
            Type::I64 => self.assembler.neg(gp64(dst)?),
        }
        .map_err(asm_err)
    }

    pub fn not(&mut self, ty: Type, dst: AsmReg) -> EncodeResult<()> {
        match ty {
            Type::I32 => self.assembler.not(gp32(dst)?),
            Type::I64 => self.assembler.not(gp64(dst)?),
        }
        .map_err(asm_err)
    }

    pub fn bswap(&mut self, ty: Type, dst: AsmReg) -> EncodeResult<()> {
        match ty {
            Type::I32 => self.assembler.bswap(gp32(dst)?),
            Type::I64 => self.assembler.bswap(gp64(dst)?),
        }
        .map_err(asm_err)
    }

    /// Index of the highest set bit; ZF is set when `src` is zero.
    pub fn bsr(&mut self, ty: Type, dst: AsmReg, src: AsmReg) -> EncodeResult<()> {
        match ty {
            Type::I32 => self.assembler.bsr(gp32(dst)?, gp32(src)?),
            Type::I64 => self.assembler.bsr(gp64(dst)?, gp64(src)?),
        }
        .map_err(asm_err)
    }

    /// One-operand multiply of rax by `src` into rdx:rax.
    pub fn mul_wide(&mut self, signed: bool, src: AsmReg) -> EncodeResult<()> {
        let s = gp64(src)?;
        if signed {
            self.assembler.imul(s)
        } else {
            self.assembler.mul(s)
        }
        .map_err(asm_err)
    }

    /// Divide rax by `src`, quotient in rax. Extends rax into rdx first.
    pub fn div(&mut self, signed: bool, ty: Type, src: AsmReg) -> EncodeResult<()> {
        let a = &mut self.assembler;
        match (ty, signed) {
            (Type::I32, true) => {
                a.cdq().map_err(asm_err)?;
                a.idiv(gp32(src)?)
            }
            (Type::I32, false) => {
                a.xor(edx, edx).map_err(asm_err)?;
                a.div(gp32(src)?)
            }
            (Type::I64, true) => {
                a.cqo().map_err(asm_err)?;
                a.idiv(gp64(src)?)
            }
            (Type::I64, false) => {
                a.xor(edx, edx).map_err(asm_err)?;
                a.div(gp64(src)?)
            }
        }
        .map_err(asm_err)
    }

    /// `dst = condition ? 1 : 0` in the low byte; the caller clears the rest beforehand.
    pub fn setcc(&mut self, cond: CondCode, dst: AsmReg) -> EncodeResult<()> {
        let d = gp8(dst)?;
        let a = &mut self.assembler;
        match cond {
            CondCode::E => a.sete(d),
            CondCode::Ne => a.setne(d),
            CondCode::B => a.setb(d),
            CondCode::Be => a.setbe(d),
            CondCode::A => a.seta(d),
            CondCode::Ae => a.setae(d),
            CondCode::L => a.setl(d),
            CondCode::Le => a.setle(d),
            CondCode::G => a.setg(d),
            CondCode::Ge => a.setge(d),
        }
        .map_err(asm_err)
    }

    /// Conditional move on ZF (`zero`) or its inverse.
    pub fn cmov(&mut self, zero: bool, ty: Type, dst: AsmReg, src: AsmReg) -> EncodeResult<()> {
        let a = &mut self.assembler;
        match (ty, zero) {
            (Type::I32, true) => a.cmove(gp32(dst)?, gp32(src)?),
            (Type::I32, false) => a.cmovne(gp32(dst)?, gp32(src)?),
            (Type::I64, true) => a.cmove(gp64(dst)?, gp64(src)?),
            (Type::I64, false) => a.cmovne(gp64(dst)?, gp64(src)?),
        }
        .map_err(asm_err)
    }

    // ==== MEMORY-OPERAND FORMS ====

    pub fn cmp_mem_imm(&mut self, width: Width, base: AsmReg, offset: i32, imm: i32) -> EncodeResult<()> {
        let address = mem(base, offset)?;
        match width {
            Width::B32 => self.assembler.cmp(dword_ptr(address), imm),
            Width::B64 => self.assembler.cmp(qword_ptr(address), imm),
            _ => return Err(EncodingError::UnsupportedInstruction),
        }
        .map_err(asm_err)
    }

    pub fn sub_mem_imm(&mut self, width: Width, base: AsmReg, offset: i32, imm: i32) -> EncodeResult<()> {
        let address = mem(base, offset)?;
        match width {
            Width::B32 => self.assembler.sub(dword_ptr(address), imm),
            Width::B64 => self.assembler.sub(qword_ptr(address), imm),
            _ => return Err(EncodingError::UnsupportedInstruction),
        }
        .map_err(asm_err)
    }

    /// `lock xadd qword [base], src`
    pub fn lock_xadd(&mut self, base: AsmReg, src: AsmReg) -> EncodeResult<()> {
        let address = mem(base, 0)?;
        self.assembler
            .lock()
            .xadd(qword_ptr(address), gp64(src)?)
            .map_err(asm_err)
    }

    /// `mov dst, [table + index*8]`
    pub fn load_indexed(&mut self, dst: AsmReg, table: AsmReg, index: AsmReg) -> EncodeResult<()> {
        let address = gp64(table)? + gp64(index)? * 8;
        self.assembler
            .mov(gp64(dst)?, qword_ptr(address))
            .map_err(asm_err)
    }

    // ==== CONTROL FLOW ====

    pub fn push(&mut self, reg: AsmReg) -> EncodeResult<()> {
        self.assembler.push(gp64(reg)?).map_err(asm_err)
    }

    pub fn pop(&mut self, reg: AsmReg) -> EncodeResult<()> {
        self.assembler.pop(gp64(reg)?).map_err(asm_err)
    }

    pub fn call_reg(&mut self, reg: AsmReg) -> EncodeResult<()> {
        self.assembler.call(gp64(reg)?).map_err(asm_err)
    }

    pub fn jmp_reg(&mut self, reg: AsmReg) -> EncodeResult<()> {
        self.assembler.jmp(gp64(reg)?).map_err(asm_err)
    }

    /// `jmp qword [base]`
    pub fn jmp_mem(&mut self, base: AsmReg) -> EncodeResult<()> {
        let address = mem(base, 0)?;
        self.assembler.jmp(qword_ptr(address)).map_err(asm_err)
    }

    pub fn jmp(&mut self, label: Label) -> EncodeResult<()> {
        let target = self.labels[label.0];
        self.assembler.jmp(target).map_err(asm_err)
    }

    pub fn jcc(&mut self, cond: CondCode, label: Label) -> EncodeResult<()> {
        let target = self.labels[label.0];
        let a = &mut self.assembler;
        match cond {
            CondCode::E => a.je(target),
            CondCode::Ne => a.jne(target),
            CondCode::B => a.jb(target),
            CondCode::Be => a.jbe(target),
            CondCode::A => a.ja(target),
            CondCode::Ae => a.jae(target),
            CondCode::L => a.jl(target),
            CondCode::Le => a.jle(target),
            CondCode::G => a.jg(target),
            CondCode::Ge => a.jge(target),
        }
        .map_err(asm_err)
    }

    pub fn ret(&mut self) -> EncodeResult<()> {
        self.assembler.ret().map_err(asm_err)
    }

    /// Number of instructions emitted so far.
    pub fn instruction_count(&self) -> usize {
        self.assembler.instructions().len()
    }

    /// Assemble the emitted instructions. The result contains no absolute relocations.
    pub fn finalize(&mut self) -> EncodeResult<Vec<u8>> {
        self.flush_label()?;
        self.assembler.assemble(0).map_err(asm_err)
    }
}

/// Render machine code as Intel syntax, one instruction per line.
pub fn disassemble(code: &[u8], ip: u64) -> String {
    let mut decoder = Decoder::with_ip(64, code, ip, DecoderOptions::NONE);
    let mut formatter = IntelFormatter::new();
    let mut output = String::new();
    let mut line = String::new();
    for instruction in &mut decoder {
        line.clear();
        formatter.format(&instruction, &mut line);
        output.push_str(&format!("{:016x} {}\n", instruction.ip(), line));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::regs::*;
    use super::*;

    #[test]
    fn test_mov_immediate_forms() {
        let mut enc = X64Encoder::new().unwrap();
        enc.mov_ri(RAX, 5).unwrap();
        enc.mov_ri(RAX, u64::MAX).unwrap();
        enc.mov_ri(RAX, 0x1234_5678_9abc).unwrap();
        let code = enc.finalize().unwrap();
        // mov eax, 5 / mov rax, -1 / mov rax, imm64
        assert_eq!(&code[..5], &[0xb8, 5, 0, 0, 0]);
        assert_eq!(&code[5..12], &[0x48, 0xc7, 0xc0, 0xff, 0xff, 0xff, 0xff]);
        assert_eq!(code.len(), 5 + 7 + 10);
    }

    #[test]
    fn test_labels_resolve_backward_and_forward() {
        let mut enc = X64Encoder::new().unwrap();
        let top = enc.create_label();
        let done = enc.create_label();
        enc.place_label(top).unwrap();
        enc.alu_ri(AluOp::Sub, Type::I32, RBX, 1).unwrap();
        enc.jcc(CondCode::E, done).unwrap();
        enc.jmp(top).unwrap();
        enc.place_label(done).unwrap();
        enc.ret().unwrap();
        let code = enc.finalize().unwrap();
        assert_eq!(*code.last().unwrap(), 0xc3);
        let text = disassemble(&code, 0);
        assert_eq!(text.lines().count(), 4);
    }

    #[test]
    fn test_adjacent_labels_get_a_nop() {
        let mut enc = X64Encoder::new().unwrap();
        let first = enc.create_label();
        let second = enc.create_label();
        let trailing = enc.create_label();
        enc.jmp(second).unwrap();
        enc.place_label(first).unwrap();
        enc.place_label(second).unwrap();
        enc.ret().unwrap();
        enc.place_label(trailing).unwrap();
        let code = enc.finalize().unwrap();
        // jmp rel8 / nop / ret / nop
        assert_eq!(code, vec![0xeb, 0x01, 0x90, 0xc3, 0x90]);
    }

    #[test]
    fn test_invalid_register_rejected() {
        let mut enc = X64Encoder::new().unwrap();
        assert_eq!(
            enc.mov_rr(Type::I64, AsmReg::new(1, 0), RAX),
            Err(EncodingError::InvalidRegister)
        );
        assert_eq!(
            enc.store_imm(Width::B8, R15, 0, 1),
            Err(EncodingError::UnsupportedInstruction)
        );
    }

    #[test]
    fn test_context_relative_operands() {
        let mut enc = X64Encoder::new().unwrap();
        enc.load(Width::B32, RBX, R15, 0x100).unwrap();
        enc.store(Width::B64, R15, 0x108, R12).unwrap();
        enc.lock_xadd(RAX, RCX).unwrap();
        enc.load_indexed(RDX, RDX, RCX).unwrap();
        let text = disassemble(&enc.finalize().unwrap(), 0);
        assert!(text.contains("lock xadd"));
        assert!(text.contains("[r15+100h]"));
    }
}
