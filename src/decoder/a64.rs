//! A64 instruction decoding.
//!
//! Decodes the integer subset of the A64 instruction set into [`A64Op`] payloads. Register
//! number 31 is resolved here: depending on the instruction it names the stack pointer or
//! the zero register.

use super::{Cond, MemSize, ShiftType};

/// A resolved A64 general purpose register operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    /// X0-X30 (or W0-W30).
    X(u8),
    /// The stack pointer.
    Sp,
    /// The zero register.
    Zr,
}

/// Extension applied to an extended-register operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Extend {
    Uxtb,
    Uxth,
    Uxtw,
    Uxtx,
    Sxtb,
    Sxth,
    Sxtw,
    Sxtx,
}

impl Extend {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 7 {
            0 => Extend::Uxtb,
            1 => Extend::Uxth,
            2 => Extend::Uxtw,
            3 => Extend::Uxtx,
            4 => Extend::Sxtb,
            5 => Extend::Sxth,
            6 => Extend::Sxtw,
            _ => Extend::Sxtx,
        }
    }
}

/// Second source operand of arithmetic and logical instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand2 {
    Imm(u64),
    Shifted {
        rm: Reg,
        shift: ShiftType,
        amount: u8,
    },
    Extended {
        rm: Reg,
        extend: Extend,
        shift: u8,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp {
    And,
    Orr,
    Eor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveWideOp {
    Movn,
    Movz,
    Movk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitfieldOp {
    Sbfm,
    Bfm,
    Ubfm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondSelectOp {
    Csel,
    Csinc,
    Csinv,
    Csneg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondCompareOperand {
    Imm(u8),
    Reg(Reg),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReverseKind {
    /// Reverse bytes in each halfword.
    Rev16,
    /// Reverse bytes in each word of a 64-bit register.
    Rev32,
    /// Reverse all bytes of the register.
    Rev,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchRegKind {
    Br,
    Blr,
    Ret,
}

/// Addressing mode writeback behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    Offset,
    PreIndex,
    PostIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrOffset {
    Imm(i64),
    Reg { rm: Reg, extend: Extend, shift: u8 },
}

/// A base-plus-offset memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub base: Reg,
    pub offset: AddrOffset,
    pub mode: IndexMode,
}

/// System registers accessible through MRS/MSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SysReg {
    Nzcv,
    Fpcr,
    Fpsr,
    TpidrEl0,
    TpidrroEl0,
    CntvctEl0,
    CntpctEl0,
    CntfrqEl0,
    CtrEl0,
    DczidEl0,
}

impl SysReg {
    fn from_encoding(op0: u32, op1: u32, crn: u32, crm: u32, op2: u32) -> Option<Self> {
        let reg = match (op0, op1, crn, crm, op2) {
            (3, 3, 4, 2, 0) => SysReg::Nzcv,
            (3, 3, 4, 4, 0) => SysReg::Fpcr,
            (3, 3, 4, 4, 1) => SysReg::Fpsr,
            (3, 3, 13, 0, 2) => SysReg::TpidrEl0,
            (3, 3, 13, 0, 3) => SysReg::TpidrroEl0,
            (3, 3, 14, 0, 2) => SysReg::CntvctEl0,
            (3, 3, 14, 0, 1) => SysReg::CntpctEl0,
            (3, 3, 14, 0, 0) => SysReg::CntfrqEl0,
            (3, 3, 0, 0, 1) => SysReg::CtrEl0,
            (3, 3, 0, 0, 7) => SysReg::DczidEl0,
            _ => return None,
        };
        Some(reg)
    }

    /// Whether MSR may write this register at EL0.
    pub fn is_writable(self) -> bool {
        matches!(
            self,
            SysReg::Nzcv | SysReg::Fpcr | SysReg::Fpsr | SysReg::TpidrEl0
        )
    }
}

/// A decoded A64 instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum A64Op {
    AddSub {
        sf: bool,
        sub: bool,
        set_flags: bool,
        rd: Reg,
        rn: Reg,
        operand: Operand2,
    },
    AddSubCarry {
        sf: bool,
        sub: bool,
        set_flags: bool,
        rd: Reg,
        rn: Reg,
        rm: Reg,
    },
    Logical {
        sf: bool,
        op: LogicOp,
        invert: bool,
        set_flags: bool,
        rd: Reg,
        rn: Reg,
        operand: Operand2,
    },
    MoveWide {
        sf: bool,
        op: MoveWideOp,
        rd: Reg,
        imm16: u16,
        shift: u8,
    },
    Adr {
        rd: Reg,
        target: u64,
    },
    Bitfield {
        sf: bool,
        op: BitfieldOp,
        rd: Reg,
        rn: Reg,
        immr: u8,
        imms: u8,
    },
    Extract {
        sf: bool,
        rd: Reg,
        rn: Reg,
        rm: Reg,
        lsb: u8,
    },
    ShiftVariable {
        sf: bool,
        shift: ShiftType,
        rd: Reg,
        rn: Reg,
        rm: Reg,
    },
    Divide {
        sf: bool,
        signed: bool,
        rd: Reg,
        rn: Reg,
        rm: Reg,
    },
    MulAdd {
        sf: bool,
        sub: bool,
        rd: Reg,
        rn: Reg,
        rm: Reg,
        ra: Reg,
    },
    MulAddLong {
        signed: bool,
        sub: bool,
        rd: Reg,
        rn: Reg,
        rm: Reg,
        ra: Reg,
    },
    MulHigh {
        signed: bool,
        rd: Reg,
        rn: Reg,
        rm: Reg,
    },
    CountLeadingZeros {
        sf: bool,
        rd: Reg,
        rn: Reg,
    },
    Reverse {
        sf: bool,
        kind: ReverseKind,
        rd: Reg,
        rn: Reg,
    },
    CondSelect {
        sf: bool,
        op: CondSelectOp,
        rd: Reg,
        rn: Reg,
        rm: Reg,
        cond: Cond,
    },
    CondCompare {
        sf: bool,
        negative: bool,
        rn: Reg,
        operand: CondCompareOperand,
        nzcv: u8,
        cond: Cond,
    },
    Load {
        size: MemSize,
        signed: bool,
        sf: bool,
        rt: Reg,
        addr: Address,
    },
    Store {
        size: MemSize,
        rt: Reg,
        addr: Address,
    },
    LoadLiteral {
        size: MemSize,
        signed: bool,
        rt: Reg,
        address: u64,
    },
    LoadPair {
        size: MemSize,
        signed: bool,
        rt: Reg,
        rt2: Reg,
        addr: Address,
    },
    StorePair {
        size: MemSize,
        rt: Reg,
        rt2: Reg,
        addr: Address,
    },
    Branch {
        target: u64,
    },
    BranchLink {
        target: u64,
    },
    BranchCond {
        cond: Cond,
        target: u64,
    },
    CompareBranch {
        sf: bool,
        nonzero: bool,
        rt: Reg,
        target: u64,
    },
    TestBranch {
        bit: u8,
        nonzero: bool,
        rt: Reg,
        target: u64,
    },
    BranchRegister {
        kind: BranchRegKind,
        rn: Reg,
    },
    Svc {
        imm: u16,
    },
    Brk {
        imm: u16,
    },
    Mrs {
        rt: Reg,
        reg: SysReg,
    },
    Msr {
        rt: Reg,
        reg: SysReg,
    },
    InvalidateInstructionCache {
        rt: Reg,
    },
    DataCacheZero {
        rt: Reg,
    },
    Nop,
    Undefined,
}

impl A64Op {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            A64Op::Branch { .. }
                | A64Op::BranchLink { .. }
                | A64Op::BranchCond { .. }
                | A64Op::CompareBranch { .. }
                | A64Op::TestBranch { .. }
                | A64Op::BranchRegister { .. }
                | A64Op::Svc { .. }
                | A64Op::Brk { .. }
                | A64Op::InvalidateInstructionCache { .. }
                | A64Op::Undefined
        )
    }

    pub fn branch_target(&self) -> Option<u64> {
        match *self {
            A64Op::Branch { target }
            | A64Op::BranchLink { target }
            | A64Op::BranchCond { target, .. }
            | A64Op::CompareBranch { target, .. }
            | A64Op::TestBranch { target, .. } => Some(target),
            _ => None,
        }
    }

    pub fn may_fall_through(&self) -> bool {
        !matches!(
            self,
            A64Op::Branch { .. } | A64Op::BranchLink { .. } | A64Op::BranchRegister { .. }
        )
    }
}

#[inline]
fn bits(raw: u32, hi: u32, lo: u32) -> u32 {
    (raw >> lo) & ((1u32 << (hi - lo + 1)) - 1)
}

#[inline]
fn bit(raw: u32, n: u32) -> bool {
    (raw >> n) & 1 != 0
}

fn sign_extend(value: u32, width: u32) -> i64 {
    let shift = 64 - width;
    ((value as u64) << shift) as i64 >> shift
}

fn gpr_zr(n: u32) -> Reg {
    if n == 31 {
        Reg::Zr
    } else {
        Reg::X(n as u8)
    }
}

fn gpr_sp(n: u32) -> Reg {
    if n == 31 {
        Reg::Sp
    } else {
        Reg::X(n as u8)
    }
}

/// Decode an A64 logical immediate (`N:immr:imms`) for a `width`-bit register.
pub fn decode_bit_masks(n: bool, imms: u32, immr: u32, width: u32) -> Option<u64> {
    let combined = ((n as u32) << 6) | (!imms & 0x3f);
    if combined == 0 {
        return None;
    }
    let len = 31 - combined.leading_zeros();
    if len < 1 {
        return None;
    }
    let esize = 1u32 << len;
    if esize > width {
        return None;
    }
    let levels = esize - 1;
    let s = imms & levels;
    let r = immr & levels;
    if s == levels {
        return None;
    }

    let welem = (1u64 << (s + 1)) - 1;
    let emask = if esize == 64 {
        u64::MAX
    } else {
        (1u64 << esize) - 1
    };
    let elem = if r == 0 {
        welem
    } else {
        ((welem >> r) | (welem << (esize - r))) & emask
    };

    let mut result = 0u64;
    let mut pos = 0;
    while pos < width {
        result |= elem << pos;
        pos += esize;
    }
    Some(if width == 32 {
        result & 0xffff_ffff
    } else {
        result
    })
}

/// Decode one A64 instruction located at `address`.
pub fn decode(address: u64, raw: u32) -> A64Op {
    let decoded = match bits(raw, 28, 25) {
        0b1000 | 0b1001 => decode_dp_immediate(address, raw),
        0b1010 | 0b1011 => decode_branch_system(address, raw),
        0b0100 | 0b0110 | 0b1100 | 0b1110 => decode_load_store(address, raw),
        0b0101 | 0b1101 => decode_dp_register(raw),
        _ => None,
    };
    decoded.unwrap_or(A64Op::Undefined)
}

fn decode_dp_immediate(address: u64, raw: u32) -> Option<A64Op> {
    let sf = bit(raw, 31);
    let rd = bits(raw, 4, 0);
    let rn = bits(raw, 9, 5);

    match bits(raw, 25, 23) {
        0b000 | 0b001 => {
            let imm = sign_extend((bits(raw, 23, 5) << 2) | bits(raw, 30, 29), 21);
            let target = if bit(raw, 31) {
                (address & !0xfff).wrapping_add((imm << 12) as u64)
            } else {
                address.wrapping_add(imm as u64)
            };
            Some(A64Op::Adr {
                rd: gpr_zr(rd),
                target,
            })
        }
        0b010 => {
            let set_flags = bit(raw, 29);
            let imm = bits(raw, 21, 10) as u64;
            let imm = if bit(raw, 22) { imm << 12 } else { imm };
            Some(A64Op::AddSub {
                sf,
                sub: bit(raw, 30),
                set_flags,
                rd: if set_flags { gpr_zr(rd) } else { gpr_sp(rd) },
                rn: gpr_sp(rn),
                operand: Operand2::Imm(imm),
            })
        }
        0b100 => {
            let n = bit(raw, 22);
            if !sf && n {
                return None;
            }
            let width = if sf { 64 } else { 32 };
            let imm = decode_bit_masks(n, bits(raw, 15, 10), bits(raw, 21, 16), width)?;
            let (op, set_flags) = logic_op(bits(raw, 30, 29));
            Some(A64Op::Logical {
                sf,
                op,
                invert: false,
                set_flags,
                rd: if set_flags { gpr_zr(rd) } else { gpr_sp(rd) },
                rn: gpr_zr(rn),
                operand: Operand2::Imm(imm),
            })
        }
        0b101 => {
            let hw = bits(raw, 22, 21);
            if !sf && hw >= 2 {
                return None;
            }
            let op = match bits(raw, 30, 29) {
                0 => MoveWideOp::Movn,
                2 => MoveWideOp::Movz,
                3 => MoveWideOp::Movk,
                _ => return None,
            };
            Some(A64Op::MoveWide {
                sf,
                op,
                rd: gpr_zr(rd),
                imm16: bits(raw, 20, 5) as u16,
                shift: (hw * 16) as u8,
            })
        }
        0b110 => {
            if bit(raw, 22) != sf {
                return None;
            }
            let op = match bits(raw, 30, 29) {
                0 => BitfieldOp::Sbfm,
                1 => BitfieldOp::Bfm,
                2 => BitfieldOp::Ubfm,
                _ => return None,
            };
            let immr = bits(raw, 21, 16);
            let imms = bits(raw, 15, 10);
            if !sf && (immr >= 32 || imms >= 32) {
                return None;
            }
            Some(A64Op::Bitfield {
                sf,
                op,
                rd: gpr_zr(rd),
                rn: gpr_zr(rn),
                immr: immr as u8,
                imms: imms as u8,
            })
        }
        0b111 => {
            if bits(raw, 30, 29) != 0 || bit(raw, 21) || bit(raw, 22) != sf {
                return None;
            }
            let lsb = bits(raw, 15, 10);
            if !sf && lsb >= 32 {
                return None;
            }
            Some(A64Op::Extract {
                sf,
                rd: gpr_zr(rd),
                rn: gpr_zr(rn),
                rm: gpr_zr(bits(raw, 20, 16)),
                lsb: lsb as u8,
            })
        }
        _ => None,
    }
}

fn logic_op(opc: u32) -> (LogicOp, bool) {
    match opc {
        0 => (LogicOp::And, false),
        1 => (LogicOp::Orr, false),
        2 => (LogicOp::Eor, false),
        _ => (LogicOp::And, true),
    }
}

fn decode_branch_system(address: u64, raw: u32) -> Option<A64Op> {
    if bits(raw, 30, 26) == 0b00101 {
        let target = address.wrapping_add((sign_extend(bits(raw, 25, 0), 26) << 2) as u64);
        return Some(if bit(raw, 31) {
            A64Op::BranchLink { target }
        } else {
            A64Op::Branch { target }
        });
    }

    if bits(raw, 31, 24) == 0b0101_0100 {
        if bit(raw, 4) {
            return None;
        }
        let target = address.wrapping_add((sign_extend(bits(raw, 23, 5), 19) << 2) as u64);
        return Some(A64Op::BranchCond {
            cond: Cond::from_bits(bits(raw, 3, 0)),
            target,
        });
    }

    if bits(raw, 30, 25) == 0b011010 {
        let target = address.wrapping_add((sign_extend(bits(raw, 23, 5), 19) << 2) as u64);
        return Some(A64Op::CompareBranch {
            sf: bit(raw, 31),
            nonzero: bit(raw, 24),
            rt: gpr_zr(bits(raw, 4, 0)),
            target,
        });
    }

    if bits(raw, 30, 25) == 0b011011 {
        let target = address.wrapping_add((sign_extend(bits(raw, 18, 5), 14) << 2) as u64);
        return Some(A64Op::TestBranch {
            bit: (((raw >> 31) << 5) | bits(raw, 23, 19)) as u8,
            nonzero: bit(raw, 24),
            rt: gpr_zr(bits(raw, 4, 0)),
            target,
        });
    }

    if bits(raw, 31, 24) == 0b1101_0100 {
        if bits(raw, 4, 2) != 0 {
            return None;
        }
        let imm = bits(raw, 20, 5) as u16;
        return match (bits(raw, 23, 21), bits(raw, 1, 0)) {
            (0, 1) => Some(A64Op::Svc { imm }),
            (1, 0) => Some(A64Op::Brk { imm }),
            _ => None,
        };
    }

    if bits(raw, 31, 22) == 0b11_0101_0100 {
        return decode_system(raw);
    }

    if bits(raw, 31, 25) == 0b110_1011 {
        if bits(raw, 20, 16) != 0x1f || bits(raw, 15, 10) != 0 || bits(raw, 4, 0) != 0 {
            return None;
        }
        let kind = match bits(raw, 24, 21) {
            0 => BranchRegKind::Br,
            1 => BranchRegKind::Blr,
            2 => BranchRegKind::Ret,
            _ => return None,
        };
        return Some(A64Op::BranchRegister {
            kind,
            rn: gpr_zr(bits(raw, 9, 5)),
        });
    }

    None
}

fn decode_system(raw: u32) -> Option<A64Op> {
    let read = bit(raw, 21);
    let op0 = bits(raw, 20, 19);
    let op1 = bits(raw, 18, 16);
    let crn = bits(raw, 15, 12);
    let crm = bits(raw, 11, 8);
    let op2 = bits(raw, 7, 5);
    let rt = gpr_zr(bits(raw, 4, 0));

    match op0 {
        // Hints, barriers and PSTATE writes.
        0 if !read && matches!(crn, 2..=4) => Some(A64Op::Nop),
        0 => None,
        1 if !read && crn == 7 => match (op1, crm, op2) {
            (3, 5, 1) => Some(A64Op::InvalidateInstructionCache { rt }),
            (3, 4, 1) => Some(A64Op::DataCacheZero { rt }),
            _ => Some(A64Op::Nop),
        },
        1 => None,
        _ => {
            let reg = SysReg::from_encoding(op0, op1, crn, crm, op2)?;
            if read {
                Some(A64Op::Mrs { rt, reg })
            } else if reg.is_writable() {
                Some(A64Op::Msr { rt, reg })
            } else {
                None
            }
        }
    }
}

fn decode_load_store(address: u64, raw: u32) -> Option<A64Op> {
    if bit(raw, 26) {
        return None;
    }
    let rt = bits(raw, 4, 0);
    let rn = bits(raw, 9, 5);

    match bits(raw, 29, 27) {
        0b011 => {
            if bits(raw, 25, 24) != 0 {
                return None;
            }
            let target = address.wrapping_add((sign_extend(bits(raw, 23, 5), 19) << 2) as u64);
            let (size, signed) = match bits(raw, 31, 30) {
                0 => (MemSize::Word, false),
                1 => (MemSize::Double, false),
                2 => (MemSize::Word, true),
                _ => return Some(A64Op::Nop),
            };
            Some(A64Op::LoadLiteral {
                size,
                signed,
                rt: gpr_zr(rt),
                address: target,
            })
        }
        0b101 => {
            let mode = match bits(raw, 24, 23) {
                0 | 2 => IndexMode::Offset,
                1 => IndexMode::PostIndex,
                _ => IndexMode::PreIndex,
            };
            let load = bit(raw, 22);
            let (size, signed) = match (bits(raw, 31, 30), load) {
                (0, _) => (MemSize::Word, false),
                (1, true) => (MemSize::Word, true),
                (2, _) => (MemSize::Double, false),
                _ => return None,
            };
            let addr = Address {
                base: gpr_sp(rn),
                offset: AddrOffset::Imm(sign_extend(bits(raw, 21, 15), 7) << size.log2()),
                mode,
            };
            let rt2 = gpr_zr(bits(raw, 14, 10));
            Some(if load {
                A64Op::LoadPair {
                    size,
                    signed,
                    rt: gpr_zr(rt),
                    rt2,
                    addr,
                }
            } else {
                A64Op::StorePair {
                    size,
                    rt: gpr_zr(rt),
                    rt2,
                    addr,
                }
            })
        }
        0b111 => decode_load_store_register(raw, rt, rn),
        _ => None,
    }
}

fn decode_load_store_register(raw: u32, rt: u32, rn: u32) -> Option<A64Op> {
    let size_log2 = bits(raw, 31, 30);
    let size = MemSize::from_log2(size_log2);
    let opc = bits(raw, 23, 22);

    // (is_load, signed, sf); None marks a prefetch.
    let class = match (size_log2, opc) {
        (_, 0) => Some((false, false, false)),
        (_, 1) => Some((true, false, size_log2 == 3)),
        (3, 2) => None,
        (2, 3) | (3, 3) => return None,
        (_, 2) => Some((true, true, true)),
        (_, _) => Some((true, true, false)),
    };

    let base = gpr_sp(rn);
    let addr = match bits(raw, 25, 24) {
        0b01 => Address {
            base,
            offset: AddrOffset::Imm((bits(raw, 21, 10) as i64) << size_log2),
            mode: IndexMode::Offset,
        },
        0b00 if !bit(raw, 21) => Address {
            base,
            offset: AddrOffset::Imm(sign_extend(bits(raw, 20, 12), 9)),
            mode: match bits(raw, 11, 10) {
                0 | 2 => IndexMode::Offset,
                1 => IndexMode::PostIndex,
                _ => IndexMode::PreIndex,
            },
        },
        0b00 if bits(raw, 11, 10) == 0b10 => {
            let option = bits(raw, 15, 13);
            if option & 2 == 0 {
                return None;
            }
            Address {
                base,
                offset: AddrOffset::Reg {
                    rm: gpr_zr(bits(raw, 20, 16)),
                    extend: Extend::from_bits(option),
                    shift: if bit(raw, 12) { size_log2 as u8 } else { 0 },
                },
                mode: IndexMode::Offset,
            }
        }
        _ => return None,
    };

    let Some((load, signed, sf)) = class else {
        return Some(A64Op::Nop);
    };
    let rt = gpr_zr(rt);
    Some(if load {
        A64Op::Load {
            size,
            signed,
            sf,
            rt,
            addr,
        }
    } else {
        A64Op::Store { size, rt, addr }
    })
}

fn decode_dp_register(raw: u32) -> Option<A64Op> {
    let sf = bit(raw, 31);
    let rd = bits(raw, 4, 0);
    let rn = bits(raw, 9, 5);
    let rm = bits(raw, 20, 16);

    if !bit(raw, 28) {
        if !bit(raw, 24) {
            let amount = bits(raw, 15, 10);
            if !sf && amount >= 32 {
                return None;
            }
            let (op, set_flags) = logic_op(bits(raw, 30, 29));
            return Some(A64Op::Logical {
                sf,
                op,
                invert: bit(raw, 21),
                set_flags,
                rd: gpr_zr(rd),
                rn: gpr_zr(rn),
                operand: Operand2::Shifted {
                    rm: gpr_zr(rm),
                    shift: ShiftType::from_bits(bits(raw, 23, 22)),
                    amount: amount as u8,
                },
            });
        }

        if !bit(raw, 21) {
            let shift = bits(raw, 23, 22);
            let amount = bits(raw, 15, 10);
            if shift == 3 || (!sf && amount >= 32) {
                return None;
            }
            return Some(A64Op::AddSub {
                sf,
                sub: bit(raw, 30),
                set_flags: bit(raw, 29),
                rd: gpr_zr(rd),
                rn: gpr_zr(rn),
                operand: Operand2::Shifted {
                    rm: gpr_zr(rm),
                    shift: ShiftType::from_bits(shift),
                    amount: amount as u8,
                },
            });
        }

        let imm3 = bits(raw, 12, 10);
        if bits(raw, 23, 22) != 0 || imm3 > 4 {
            return None;
        }
        let set_flags = bit(raw, 29);
        return Some(A64Op::AddSub {
            sf,
            sub: bit(raw, 30),
            set_flags,
            rd: if set_flags { gpr_zr(rd) } else { gpr_sp(rd) },
            rn: gpr_sp(rn),
            operand: Operand2::Extended {
                rm: gpr_zr(rm),
                extend: Extend::from_bits(bits(raw, 15, 13)),
                shift: imm3 as u8,
            },
        });
    }

    match bits(raw, 24, 21) {
        0b0000 => {
            if bits(raw, 15, 10) != 0 {
                return None;
            }
            Some(A64Op::AddSubCarry {
                sf,
                sub: bit(raw, 30),
                set_flags: bit(raw, 29),
                rd: gpr_zr(rd),
                rn: gpr_zr(rn),
                rm: gpr_zr(rm),
            })
        }
        0b0010 => {
            if !bit(raw, 29) || bit(raw, 10) || bit(raw, 4) {
                return None;
            }
            let operand = if bit(raw, 11) {
                CondCompareOperand::Imm(rm as u8)
            } else {
                CondCompareOperand::Reg(gpr_zr(rm))
            };
            Some(A64Op::CondCompare {
                sf,
                negative: !bit(raw, 30),
                rn: gpr_zr(rn),
                operand,
                nzcv: bits(raw, 3, 0) as u8,
                cond: Cond::from_bits(bits(raw, 15, 12)),
            })
        }
        0b0100 => {
            if bit(raw, 29) || bit(raw, 11) {
                return None;
            }
            let op = match (bit(raw, 30), bit(raw, 10)) {
                (false, false) => CondSelectOp::Csel,
                (false, true) => CondSelectOp::Csinc,
                (true, false) => CondSelectOp::Csinv,
                (true, true) => CondSelectOp::Csneg,
            };
            Some(A64Op::CondSelect {
                sf,
                op,
                rd: gpr_zr(rd),
                rn: gpr_zr(rn),
                rm: gpr_zr(rm),
                cond: Cond::from_bits(bits(raw, 15, 12)),
            })
        }
        0b0110 => {
            if bit(raw, 29) {
                return None;
            }
            let (rd, rn) = (gpr_zr(rd), gpr_zr(rn));
            if !bit(raw, 30) {
                let rm = gpr_zr(rm);
                return match bits(raw, 15, 10) {
                    0b000010 => Some(A64Op::Divide {
                        sf,
                        signed: false,
                        rd,
                        rn,
                        rm,
                    }),
                    0b000011 => Some(A64Op::Divide {
                        sf,
                        signed: true,
                        rd,
                        rn,
                        rm,
                    }),
                    opcode @ 0b001000..=0b001011 => Some(A64Op::ShiftVariable {
                        sf,
                        shift: ShiftType::from_bits(opcode),
                        rd,
                        rn,
                        rm,
                    }),
                    _ => None,
                };
            }
            if bits(raw, 20, 16) != 0 {
                return None;
            }
            let kind = match (bits(raw, 15, 10), sf) {
                (1, _) => ReverseKind::Rev16,
                (2, true) => ReverseKind::Rev32,
                (2, false) | (3, true) => ReverseKind::Rev,
                (4, _) => return Some(A64Op::CountLeadingZeros { sf, rd, rn }),
                _ => return None,
            };
            Some(A64Op::Reverse { sf, kind, rd, rn })
        }
        0b1000..=0b1111 => {
            if bits(raw, 30, 29) != 0 {
                return None;
            }
            let sub = bit(raw, 15);
            let (rd, rn, rm) = (gpr_zr(rd), gpr_zr(rn), gpr_zr(rm));
            let ra = gpr_zr(bits(raw, 14, 10));
            match bits(raw, 23, 21) {
                0 => Some(A64Op::MulAdd {
                    sf,
                    sub,
                    rd,
                    rn,
                    rm,
                    ra,
                }),
                1 if sf => Some(A64Op::MulAddLong {
                    signed: true,
                    sub,
                    rd,
                    rn,
                    rm,
                    ra,
                }),
                5 if sf => Some(A64Op::MulAddLong {
                    signed: false,
                    sub,
                    rd,
                    rn,
                    rm,
                    ra,
                }),
                2 if sf && !sub => Some(A64Op::MulHigh {
                    signed: true,
                    rd,
                    rn,
                    rm,
                }),
                6 if sf && !sub => Some(A64Op::MulHigh {
                    signed: false,
                    rd,
                    rn,
                    rm,
                }),
                _ => None,
            }
        }
        _ => None,
    }
}
