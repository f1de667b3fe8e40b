//! A32 (ARM state) instruction decoding.
//!
//! Every instruction carries its condition field; [`A32Op`] holds the operation itself.
//! Register operands are plain register numbers, with 15 naming the program counter.
//! Unpredictable encodings decode to [`A32Op::Undefined`].

use super::{Cond, MemSize, ShiftType};

/// The program counter register number.
pub const PC: u8 = 15;
/// The link register number.
pub const LR: u8 = 14;
/// The stack pointer register number.
pub const SP: u8 = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DpOpcode {
    And,
    Eor,
    Sub,
    Rsb,
    Add,
    Adc,
    Sbc,
    Rsc,
    Tst,
    Teq,
    Cmp,
    Cmn,
    Orr,
    Mov,
    Bic,
    Mvn,
}

impl DpOpcode {
    fn from_bits(bits: u32) -> Self {
        use DpOpcode::*;
        const TABLE: [DpOpcode; 16] = [
            And, Eor, Sub, Rsb, Add, Adc, Sbc, Rsc, Tst, Teq, Cmp, Cmn, Orr, Mov, Bic, Mvn,
        ];
        TABLE[(bits & 0xf) as usize]
    }

    /// Comparison opcodes only update flags.
    pub fn is_test(self) -> bool {
        matches!(self, DpOpcode::Tst | DpOpcode::Teq | DpOpcode::Cmp | DpOpcode::Cmn)
    }

    /// Logical opcodes take C from the shifter and leave V alone.
    pub fn is_logical(self) -> bool {
        matches!(
            self,
            DpOpcode::And
                | DpOpcode::Eor
                | DpOpcode::Tst
                | DpOpcode::Teq
                | DpOpcode::Orr
                | DpOpcode::Mov
                | DpOpcode::Bic
                | DpOpcode::Mvn
        )
    }

    /// Whether the first operand register is read.
    pub fn uses_rn(self) -> bool {
        !matches!(self, DpOpcode::Mov | DpOpcode::Mvn)
    }
}

/// Immediate shift applied to a register operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum A32Shift {
    /// Shift type with amount; LSR and ASR amounts range 1..=32.
    Imm(ShiftType, u8),
    /// Rotate right by one through carry.
    Rrx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShiftedReg {
    pub rm: u8,
    pub shift: A32Shift,
}

/// Second operand of data processing instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShifterOperand {
    /// Rotated immediate; `carry` is the shifter carry-out when the rotation is non-zero.
    Imm { value: u32, carry: Option<bool> },
    Reg(ShiftedReg),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum A32Offset {
    Imm(u32),
    Reg(ShiftedReg),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtraKind {
    Half,
    SignedByte,
    SignedHalf,
}

/// LDM/STM addressing modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMode {
    IncrementAfter,
    IncrementBefore,
    DecrementAfter,
    DecrementBefore,
}

/// CP15 registers accessible from user mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoprocReg {
    /// User read/write thread ID register.
    TpidrUrw,
    /// User read-only thread ID register.
    TpidrUro,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum A32Op {
    DataProcessing {
        opcode: DpOpcode,
        set_flags: bool,
        rd: u8,
        rn: u8,
        operand: ShifterOperand,
    },
    MoveWide {
        top: bool,
        rd: u8,
        imm16: u16,
    },
    Multiply {
        accumulate: bool,
        set_flags: bool,
        rd: u8,
        rn: u8,
        rm: u8,
        ra: u8,
    },
    MultiplyLong {
        signed: bool,
        accumulate: bool,
        set_flags: bool,
        rd_lo: u8,
        rd_hi: u8,
        rn: u8,
        rm: u8,
    },
    CountLeadingZeros {
        rd: u8,
        rm: u8,
    },
    LoadStore {
        load: bool,
        size: MemSize,
        rt: u8,
        rn: u8,
        offset: A32Offset,
        add: bool,
        pre_index: bool,
        writeback: bool,
    },
    LoadStoreExtra {
        load: bool,
        kind: ExtraKind,
        rt: u8,
        rn: u8,
        offset: A32Offset,
        add: bool,
        pre_index: bool,
        writeback: bool,
    },
    LoadStoreMultiple {
        load: bool,
        rn: u8,
        registers: u16,
        mode: BlockMode,
        writeback: bool,
    },
    Branch {
        link: bool,
        target: u64,
    },
    BranchExchange {
        link: bool,
        rm: u8,
    },
    Svc {
        imm: u32,
    },
    Bkpt {
        imm: u16,
    },
    ReadCoprocessor {
        rt: u8,
        reg: CoprocReg,
    },
    WriteCoprocessor {
        rt: u8,
        reg: CoprocReg,
    },
    Nop,
    Undefined,
}

impl A32Op {
    pub fn is_terminal(&self) -> bool {
        match *self {
            A32Op::Branch { .. }
            | A32Op::BranchExchange { .. }
            | A32Op::Svc { .. }
            | A32Op::Bkpt { .. }
            | A32Op::Undefined => true,
            A32Op::DataProcessing { opcode, rd, .. } => rd == PC && !opcode.is_test(),
            A32Op::LoadStore { load, rt, .. } => load && rt == PC,
            A32Op::LoadStoreMultiple {
                load, registers, ..
            } => load && registers & (1 << PC) != 0,
            _ => false,
        }
    }

    pub fn branch_target(&self) -> Option<u64> {
        match *self {
            A32Op::Branch { target, .. } => Some(target),
            _ => None,
        }
    }
}

/// A decoded A32 instruction with its condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct A32Instr {
    pub cond: Cond,
    pub op: A32Op,
}

#[inline]
fn bits(raw: u32, hi: u32, lo: u32) -> u32 {
    (raw >> lo) & ((1u32 << (hi - lo + 1)) - 1)
}

#[inline]
fn bit(raw: u32, n: u32) -> bool {
    (raw >> n) & 1 != 0
}

fn reg(raw: u32, lo: u32) -> u8 {
    bits(raw, lo + 3, lo) as u8
}

/// Decode one A32 instruction located at `address`.
pub fn decode(address: u64, raw: u32) -> A32Instr {
    let cond = Cond::from_bits(raw >> 28);
    if cond == Cond::Nv {
        return A32Instr {
            cond: Cond::Al,
            op: decode_unconditional(raw),
        };
    }
    A32Instr {
        cond,
        op: decode_conditional(address, raw).unwrap_or(A32Op::Undefined),
    }
}

fn decode_unconditional(raw: u32) -> A32Op {
    // PLD/PLI and the barrier group.
    let pld = matches!(bits(raw, 27, 24), 0b0101 | 0b0111) && bits(raw, 22, 20) & 0b011 == 0b001;
    let barrier = bits(raw, 27, 8) == 0x57FF0;
    if pld || barrier {
        A32Op::Nop
    } else {
        A32Op::Undefined
    }
}

fn decode_conditional(address: u64, raw: u32) -> Option<A32Op> {
    match bits(raw, 27, 25) {
        0b000 => {
            if bit(raw, 4) && bit(raw, 7) {
                if bits(raw, 6, 5) == 0 {
                    decode_multiply(raw)
                } else {
                    decode_extra_load_store(raw)
                }
            } else if bits(raw, 24, 23) == 0b10 && !bit(raw, 20) {
                decode_misc(raw)
            } else if bit(raw, 4) {
                None
            } else {
                let shifted = ShiftedReg {
                    rm: reg(raw, 0),
                    shift: decode_imm_shift(bits(raw, 6, 5), bits(raw, 11, 7)),
                };
                decode_data_processing(raw, ShifterOperand::Reg(shifted))
            }
        }
        0b001 => {
            if bits(raw, 24, 23) == 0b10 && !bit(raw, 20) {
                let imm16 = ((bits(raw, 19, 16) << 12) | bits(raw, 11, 0)) as u16;
                let rd = reg(raw, 12);
                match bits(raw, 22, 21) {
                    0b00 | 0b10 if rd == PC => None,
                    0b00 => Some(A32Op::MoveWide {
                        top: false,
                        rd,
                        imm16,
                    }),
                    0b10 => Some(A32Op::MoveWide {
                        top: true,
                        rd,
                        imm16,
                    }),
                    0b01 if bits(raw, 19, 16) == 0 => Some(A32Op::Nop),
                    _ => None,
                }
            } else {
                let rotate = bits(raw, 11, 8) * 2;
                let value = bits(raw, 7, 0).rotate_right(rotate);
                let carry = (rotate != 0).then_some(value >> 31 != 0);
                decode_data_processing(raw, ShifterOperand::Imm { value, carry })
            }
        }
        0b010 => decode_load_store(raw, A32Offset::Imm(bits(raw, 11, 0))),
        0b011 => {
            if bit(raw, 4) {
                return None;
            }
            let shifted = ShiftedReg {
                rm: reg(raw, 0),
                shift: decode_imm_shift(bits(raw, 6, 5), bits(raw, 11, 7)),
            };
            if shifted.rm == PC {
                return None;
            }
            decode_load_store(raw, A32Offset::Reg(shifted))
        }
        0b100 => decode_load_store_multiple(raw),
        0b101 => {
            let offset = (((raw & 0x00ff_ffff) << 8) as i32 >> 6) as i64;
            let target = (address as i64 + 8 + offset) as u64 & 0xffff_ffff;
            Some(A32Op::Branch {
                link: bit(raw, 24),
                target,
            })
        }
        0b111 => {
            if bit(raw, 24) {
                Some(A32Op::Svc {
                    imm: raw & 0x00ff_ffff,
                })
            } else if bit(raw, 4) && bits(raw, 11, 8) == 15 {
                decode_coprocessor(raw)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn decode_imm_shift(kind: u32, imm5: u32) -> A32Shift {
    let amount = imm5 as u8;
    match ShiftType::from_bits(kind) {
        ShiftType::Lsl => A32Shift::Imm(ShiftType::Lsl, amount),
        ShiftType::Lsr => A32Shift::Imm(ShiftType::Lsr, if amount == 0 { 32 } else { amount }),
        ShiftType::Asr => A32Shift::Imm(ShiftType::Asr, if amount == 0 { 32 } else { amount }),
        ShiftType::Ror if amount == 0 => A32Shift::Rrx,
        ShiftType::Ror => A32Shift::Imm(ShiftType::Ror, amount),
    }
}

fn decode_data_processing(raw: u32, operand: ShifterOperand) -> Option<A32Op> {
    let opcode = DpOpcode::from_bits(bits(raw, 24, 21));
    let set_flags = bit(raw, 20);
    let rd = reg(raw, 12);
    if opcode.is_test() && !set_flags {
        return None;
    }
    // Flag-setting writes to PC are exception returns.
    if rd == PC && set_flags && !opcode.is_test() {
        return None;
    }
    Some(A32Op::DataProcessing {
        opcode,
        set_flags,
        rd,
        rn: reg(raw, 16),
        operand,
    })
}

fn decode_misc(raw: u32) -> Option<A32Op> {
    let rm = reg(raw, 0);
    match (bits(raw, 7, 4), bits(raw, 22, 21)) {
        (0b0001, 0b01) => Some(A32Op::BranchExchange { link: false, rm }),
        (0b0011, 0b01) if rm != PC => Some(A32Op::BranchExchange { link: true, rm }),
        (0b0001, 0b11) if rm != PC && reg(raw, 12) != PC => Some(A32Op::CountLeadingZeros {
            rd: reg(raw, 12),
            rm,
        }),
        (0b0111, 0b01) => Some(A32Op::Bkpt {
            imm: ((bits(raw, 19, 8) << 4) | bits(raw, 3, 0)) as u16,
        }),
        _ => None,
    }
}

fn decode_multiply(raw: u32) -> Option<A32Op> {
    if bits(raw, 27, 24) != 0 {
        return None;
    }
    let set_flags = bit(raw, 20);
    let hi = reg(raw, 16);
    let lo = reg(raw, 12);
    let rm = reg(raw, 8);
    let rn = reg(raw, 0);
    if [hi, rm, rn].contains(&PC) {
        return None;
    }

    let long = |signed, accumulate| {
        if lo == PC || lo == hi {
            None
        } else {
            Some(A32Op::MultiplyLong {
                signed,
                accumulate,
                set_flags,
                rd_lo: lo,
                rd_hi: hi,
                rn,
                rm,
            })
        }
    };

    match bits(raw, 23, 21) {
        0b000 => Some(A32Op::Multiply {
            accumulate: false,
            set_flags,
            rd: hi,
            rn,
            rm,
            ra: 0,
        }),
        0b001 if lo != PC => Some(A32Op::Multiply {
            accumulate: true,
            set_flags,
            rd: hi,
            rn,
            rm,
            ra: lo,
        }),
        0b100 => long(false, false),
        0b101 => long(false, true),
        0b110 => long(true, false),
        0b111 => long(true, true),
        _ => None,
    }
}

fn decode_extra_load_store(raw: u32) -> Option<A32Op> {
    let pre_index = bit(raw, 24);
    let write = bit(raw, 21);
    let load = bit(raw, 20);
    let rn = reg(raw, 16);
    let rt = reg(raw, 12);

    let kind = match (load, bits(raw, 6, 5)) {
        (_, 0b01) => ExtraKind::Half,
        (true, 0b10) => ExtraKind::SignedByte,
        (true, 0b11) => ExtraKind::SignedHalf,
        _ => return None,
    };
    if !pre_index && write {
        return None;
    }
    let writeback = !pre_index || write;
    if rt == PC || (writeback && rn == PC) {
        return None;
    }

    let offset = if bit(raw, 22) {
        A32Offset::Imm((bits(raw, 11, 8) << 4) | bits(raw, 3, 0))
    } else {
        if bits(raw, 11, 8) != 0 || reg(raw, 0) == PC {
            return None;
        }
        A32Offset::Reg(ShiftedReg {
            rm: reg(raw, 0),
            shift: A32Shift::Imm(ShiftType::Lsl, 0),
        })
    };

    Some(A32Op::LoadStoreExtra {
        load,
        kind,
        rt,
        rn,
        offset,
        add: bit(raw, 23),
        pre_index,
        writeback,
    })
}

fn decode_load_store(raw: u32, offset: A32Offset) -> Option<A32Op> {
    let pre_index = bit(raw, 24);
    let byte = bit(raw, 22);
    let load = bit(raw, 20);
    let rn = reg(raw, 16);
    let rt = reg(raw, 12);
    let writeback = !pre_index || bit(raw, 21);

    if writeback && rn == PC {
        return None;
    }
    if byte && rt == PC {
        return None;
    }

    Some(A32Op::LoadStore {
        load,
        size: if byte { MemSize::Byte } else { MemSize::Word },
        rt,
        rn,
        offset,
        add: bit(raw, 23),
        pre_index,
        writeback,
    })
}

fn decode_load_store_multiple(raw: u32) -> Option<A32Op> {
    let registers = (raw & 0xffff) as u16;
    let rn = reg(raw, 16);
    if bit(raw, 22) || registers == 0 || rn == PC {
        return None;
    }
    let mode = match (bit(raw, 24), bit(raw, 23)) {
        (false, true) => BlockMode::IncrementAfter,
        (true, true) => BlockMode::IncrementBefore,
        (false, false) => BlockMode::DecrementAfter,
        (true, false) => BlockMode::DecrementBefore,
    };
    Some(A32Op::LoadStoreMultiple {
        load: bit(raw, 20),
        rn,
        registers,
        mode,
        writeback: bit(raw, 21),
    })
}

fn decode_coprocessor(raw: u32) -> Option<A32Op> {
    let rt = reg(raw, 12);
    if bits(raw, 23, 21) != 0 || bits(raw, 19, 16) != 13 || bits(raw, 3, 0) != 0 || rt == PC {
        return None;
    }
    let reg = match bits(raw, 7, 5) {
        2 => CoprocReg::TpidrUrw,
        3 => CoprocReg::TpidrUro,
        _ => return None,
    };
    if bit(raw, 20) {
        Some(A32Op::ReadCoprocessor { rt, reg })
    } else if reg == CoprocReg::TpidrUrw {
        Some(A32Op::WriteCoprocessor { rt, reg })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn op(raw: u32) -> A32Op {
        decode(0x1000, raw).op
    }

    #[test]
    fn test_data_processing() {
        assert_eq!(
            op(0xE0810002),
            A32Op::DataProcessing {
                opcode: DpOpcode::Add,
                set_flags: false,
                rd: 0,
                rn: 1,
                operand: ShifterOperand::Reg(ShiftedReg {
                    rm: 2,
                    shift: A32Shift::Imm(ShiftType::Lsl, 0)
                }),
            }
        );
        // mov r0, #1
        assert_eq!(
            op(0xE3A00001),
            A32Op::DataProcessing {
                opcode: DpOpcode::Mov,
                set_flags: false,
                rd: 0,
                rn: 0,
                operand: ShifterOperand::Imm {
                    value: 1,
                    carry: None
                },
            }
        );
        // cmp r0, #0
        assert!(matches!(
            op(0xE3500000),
            A32Op::DataProcessing {
                opcode: DpOpcode::Cmp,
                set_flags: true,
                ..
            }
        ));
        // mov r0, #0xff000000 rotates and reports carry
        assert_eq!(
            op(0xE3A004FF),
            A32Op::DataProcessing {
                opcode: DpOpcode::Mov,
                set_flags: false,
                rd: 0,
                rn: 0,
                operand: ShifterOperand::Imm {
                    value: 0xff00_0000,
                    carry: Some(true)
                },
            }
        );
    }

    #[test]
    fn test_shift_encodings() {
        // mov r0, r1, lsr #32 is encoded with a zero amount
        assert!(matches!(
            op(0xE1A00021),
            A32Op::DataProcessing {
                operand: ShifterOperand::Reg(ShiftedReg {
                    rm: 1,
                    shift: A32Shift::Imm(ShiftType::Lsr, 32)
                }),
                ..
            }
        ));
        // mov r0, r1, rrx
        assert!(matches!(
            op(0xE1A00061),
            A32Op::DataProcessing {
                operand: ShifterOperand::Reg(ShiftedReg {
                    rm: 1,
                    shift: A32Shift::Rrx
                }),
                ..
            }
        ));
    }

    #[test]
    fn test_conditions_and_branches() {
        let instr = decode(0x1000, 0x1A000000);
        assert_eq!(instr.cond, Cond::Ne);
        assert_eq!(
            instr.op,
            A32Op::Branch {
                link: false,
                target: 0x1008
            }
        );
        // bl -8 (branch to self)
        assert_eq!(
            op(0xEBFFFFFE),
            A32Op::Branch {
                link: true,
                target: 0x1000
            }
        );
        assert_eq!(
            op(0xE12FFF1E),
            A32Op::BranchExchange { link: false, rm: 14 }
        );
        assert!(op(0xE12FFF1E).is_terminal());
    }

    #[test]
    fn test_memory_and_system() {
        assert_eq!(
            op(0xE5910004),
            A32Op::LoadStore {
                load: true,
                size: MemSize::Word,
                rt: 0,
                rn: 1,
                offset: A32Offset::Imm(4),
                add: true,
                pre_index: true,
                writeback: false,
            }
        );
        assert_eq!(
            op(0xE92D4010),
            A32Op::LoadStoreMultiple {
                load: false,
                rn: SP,
                registers: 0x4010,
                mode: BlockMode::DecrementBefore,
                writeback: true,
            }
        );
        assert_eq!(op(0xEF000000), A32Op::Svc { imm: 0 });
        assert_eq!(
            op(0xEE1D0F70),
            A32Op::ReadCoprocessor {
                rt: 0,
                reg: CoprocReg::TpidrUro
            }
        );
        assert_eq!(
            op(0xE3010234),
            A32Op::MoveWide {
                top: false,
                rd: 0,
                imm16: 0x1234
            }
        );
        assert_eq!(
            op(0xE0000291),
            A32Op::Multiply {
                accumulate: false,
                set_flags: false,
                rd: 0,
                rn: 1,
                rm: 2,
                ra: 0
            }
        );
    }

    #[test]
    fn test_pc_writes_end_blocks() {
        // pop {r4, pc}
        assert!(op(0xE8BD8010).is_terminal());
        // ldr pc, [sp], #4
        assert!(op(0xE49DF004).is_terminal());
        // add pc, pc, r0
        assert!(op(0xE08FF000).is_terminal());
        // cmp pc, r0 does not write PC
        assert!(!op(0xE15F0000).is_terminal());
    }

    proptest! {
        #[test]
        fn decode_never_panics(raw in any::<u32>(), address in 0u64..0x1_0000_0000) {
            let _ = decode(address & !3, raw);
        }
    }
}
