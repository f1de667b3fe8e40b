// This module turns guest machine code into immutable opcode descriptors and groups them into
// single-entry basic blocks. Both guest instruction sets share the OpCode/Block types; the
// instruction-set specific payloads live in the a64 and a32 submodules. Register operands are
// fully resolved at decode time (A64 register 31 is either SP or XZR depending on the
// instruction), so later stages never look at raw encoding bits. Unknown encodings are not
// errors: they decode to an Undefined payload that ends the block and raises the undefined
// instruction callback when executed.

//! Guest instruction decoding and basic block discovery.

pub mod a32;
pub mod a64;

use crate::core::error::{CompileError, CompileResult};
use crate::state::memory::{MemoryManager, MemoryManagerExt};

/// Guest instruction set state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    /// 64-bit A64 instruction set.
    Aarch64,
    /// 32-bit A32 instruction set (ARM state).
    Aarch32Arm,
}

impl ExecutionMode {
    pub fn is_64bit(self) -> bool {
        matches!(self, ExecutionMode::Aarch64)
    }
}

/// ARM condition codes, shared by both instruction sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    Eq,
    Ne,
    Cs,
    Cc,
    Mi,
    Pl,
    Vs,
    Vc,
    Hi,
    Ls,
    Ge,
    Lt,
    Gt,
    Le,
    Al,
    Nv,
}

impl Cond {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 0xf {
            0x0 => Cond::Eq,
            0x1 => Cond::Ne,
            0x2 => Cond::Cs,
            0x3 => Cond::Cc,
            0x4 => Cond::Mi,
            0x5 => Cond::Pl,
            0x6 => Cond::Vs,
            0x7 => Cond::Vc,
            0x8 => Cond::Hi,
            0x9 => Cond::Ls,
            0xa => Cond::Ge,
            0xb => Cond::Lt,
            0xc => Cond::Gt,
            0xd => Cond::Le,
            0xe => Cond::Al,
            _ => Cond::Nv,
        }
    }

    /// The condition with the opposite outcome.
    pub fn invert(self) -> Self {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Cs => Cond::Cc,
            Cond::Cc => Cond::Cs,
            Cond::Mi => Cond::Pl,
            Cond::Pl => Cond::Mi,
            Cond::Vs => Cond::Vc,
            Cond::Vc => Cond::Vs,
            Cond::Hi => Cond::Ls,
            Cond::Ls => Cond::Hi,
            Cond::Ge => Cond::Lt,
            Cond::Lt => Cond::Ge,
            Cond::Gt => Cond::Le,
            Cond::Le => Cond::Gt,
            Cond::Al => Cond::Nv,
            Cond::Nv => Cond::Al,
        }
    }

    /// Evaluate against a packed NZCV nibble (N in bit 3).
    pub fn holds(self, nzcv: u8) -> bool {
        let n = nzcv & 8 != 0;
        let z = nzcv & 4 != 0;
        let c = nzcv & 2 != 0;
        let v = nzcv & 1 != 0;
        match self {
            Cond::Eq => z,
            Cond::Ne => !z,
            Cond::Cs => c,
            Cond::Cc => !c,
            Cond::Mi => n,
            Cond::Pl => !n,
            Cond::Vs => v,
            Cond::Vc => !v,
            Cond::Hi => c && !z,
            Cond::Ls => !(c && !z),
            Cond::Ge => n == v,
            Cond::Lt => n != v,
            Cond::Gt => !z && n == v,
            Cond::Le => !(!z && n == v),
            Cond::Al | Cond::Nv => true,
        }
    }
}

/// Access size of a guest memory operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemSize {
    Byte,
    Half,
    Word,
    Double,
}

impl MemSize {
    pub fn from_log2(log2: u32) -> Self {
        match log2 {
            0 => MemSize::Byte,
            1 => MemSize::Half,
            2 => MemSize::Word,
            _ => MemSize::Double,
        }
    }

    pub fn bytes(self) -> u64 {
        match self {
            MemSize::Byte => 1,
            MemSize::Half => 2,
            MemSize::Word => 4,
            MemSize::Double => 8,
        }
    }

    pub fn log2(self) -> u32 {
        match self {
            MemSize::Byte => 0,
            MemSize::Half => 1,
            MemSize::Word => 2,
            MemSize::Double => 3,
        }
    }
}

/// Shift applied to a register operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShiftType {
    Lsl,
    Lsr,
    Asr,
    Ror,
}

impl ShiftType {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 3 {
            0 => ShiftType::Lsl,
            1 => ShiftType::Lsr,
            2 => ShiftType::Asr,
            _ => ShiftType::Ror,
        }
    }
}

/// Instruction-set specific payload of a decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    A64(a64::A64Op),
    A32(a32::A32Instr),
}

/// A decoded guest instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpCode {
    /// Guest address of the instruction.
    pub address: u64,
    /// Raw encoding.
    pub raw: u32,
    /// Length in bytes.
    pub size: u8,
    pub kind: OpKind,
}

impl OpCode {
    /// Address of the following instruction.
    pub fn next_address(&self) -> u64 {
        self.address + self.size as u64
    }

    /// Whether this instruction ends a basic block.
    pub fn ends_block(&self) -> bool {
        match &self.kind {
            OpKind::A64(op) => op.is_terminal(),
            OpKind::A32(instr) => instr.op.is_terminal(),
        }
    }

    /// Static branch target, if the instruction has one.
    pub fn branch_target(&self) -> Option<u64> {
        match &self.kind {
            OpKind::A64(op) => op.branch_target(),
            OpKind::A32(instr) => instr.op.branch_target(),
        }
    }

    /// Whether execution may continue at the next instruction.
    pub fn may_fall_through(&self) -> bool {
        match &self.kind {
            OpKind::A64(op) => op.may_fall_through(),
            OpKind::A32(instr) => instr.cond != Cond::Al || !instr.op.is_terminal(),
        }
    }
}

/// Why block decoding stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockEnd {
    /// The last instruction transfers control (branch, exception, PC write).
    ControlFlow,
    /// The next address already has a translation.
    KnownEntry,
    /// The instruction limit was reached.
    InstructionLimit,
    /// The next instruction could not be fetched.
    FetchFault,
}

/// A decoded basic block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub start: u64,
    pub end: u64,
    pub opcodes: Vec<OpCode>,
    pub end_reason: BlockEnd,
}

impl Block {
    /// Guest bytes covered by the block.
    pub fn guest_size(&self) -> u64 {
        self.end - self.start
    }

    /// Possible successor addresses of the block.
    pub fn successors(&self) -> Vec<u64> {
        let Some(last) = self.opcodes.last() else {
            return Vec::new();
        };
        if self.end_reason != BlockEnd::ControlFlow {
            return vec![self.end];
        }
        let mut successors = Vec::new();
        if let Some(target) = last.branch_target() {
            successors.push(target);
        }
        if last.may_fall_through() && !successors.contains(&self.end) {
            successors.push(self.end);
        }
        successors
    }
}

/// Decode a single instruction of the given instruction set.
pub fn decode_instruction(mode: ExecutionMode, address: u64, raw: u32) -> OpCode {
    let kind = match mode {
        ExecutionMode::Aarch64 => OpKind::A64(a64::decode(address, raw)),
        ExecutionMode::Aarch32Arm => OpKind::A32(a32::decode(address, raw)),
    };
    OpCode {
        address,
        raw,
        size: 4,
        kind,
    }
}

/// Decode one basic block starting at `address`.
///
/// Decoding stops after a control-flow instruction, before an address for which
/// `is_known_entry` returns true, after `max_instructions`, or before an instruction
/// that cannot be fetched. A fetch fault on the very first instruction is an error.
pub fn decode_block(
    memory: &dyn MemoryManager,
    address: u64,
    mode: ExecutionMode,
    max_instructions: usize,
    is_known_entry: &dyn Fn(u64) -> bool,
) -> CompileResult<Block> {
    let mut opcodes = Vec::new();
    let mut current = address;
    let mut end_reason = BlockEnd::InstructionLimit;

    while opcodes.len() < max_instructions.max(1) {
        if !opcodes.is_empty() && is_known_entry(current) {
            end_reason = BlockEnd::KnownEntry;
            break;
        }

        let raw = match memory.read_guest::<u32>(current) {
            Ok(raw) => raw,
            Err(source) if opcodes.is_empty() => {
                return Err(CompileError::InstructionFetch {
                    address: current,
                    source,
                });
            }
            Err(_) => {
                end_reason = BlockEnd::FetchFault;
                break;
            }
        };

        let opcode = decode_instruction(mode, current, raw);
        current = opcode.next_address();
        let terminal = opcode.ends_block();
        opcodes.push(opcode);

        if terminal {
            end_reason = BlockEnd::ControlFlow;
            break;
        }
    }

    log::trace!(
        "decoded {} instructions at {address:#x}..{current:#x} ({end_reason:?})",
        opcodes.len()
    );

    Ok(Block {
        start: address,
        end: current,
        opcodes,
        end_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::memory::FlatMemory;

    const NOP: u32 = 0xD503201F;
    const A64_B_PLUS_8: u32 = 0x14000002;

    fn memory_with(words: &[u32]) -> FlatMemory {
        let memory = FlatMemory::new();
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        memory.map_with(0x1000, &bytes, false);
        memory
    }

    #[test]
    fn test_block_ends_at_unconditional_branch() {
        let memory = memory_with(&[NOP, NOP, A64_B_PLUS_8, NOP]);
        let block = decode_block(&memory, 0x1000, ExecutionMode::Aarch64, 64, &|_| false).unwrap();

        assert_eq!(block.opcodes.len(), 3);
        assert_eq!(block.end_reason, BlockEnd::ControlFlow);
        assert_eq!(block.guest_size(), 12);
        assert_eq!(block.successors(), vec![0x1008 + 8]);
    }

    #[test]
    fn test_block_stops_before_known_entry() {
        let memory = memory_with(&[NOP, NOP, NOP, NOP]);
        let block =
            decode_block(&memory, 0x1000, ExecutionMode::Aarch64, 64, &|a| a == 0x1008).unwrap();

        assert_eq!(block.opcodes.len(), 2);
        assert_eq!(block.end_reason, BlockEnd::KnownEntry);
        assert_eq!(block.successors(), vec![0x1008]);
    }

    #[test]
    fn test_block_instruction_limit() {
        let memory = memory_with(&[NOP; 8]);
        let block = decode_block(&memory, 0x1000, ExecutionMode::Aarch64, 3, &|_| false).unwrap();
        assert_eq!(block.opcodes.len(), 3);
        assert_eq!(block.end_reason, BlockEnd::InstructionLimit);
    }

    #[test]
    fn test_fetch_fault_handling() {
        let memory = memory_with(&[NOP, NOP]);

        let err = decode_block(&memory, 0x4000, ExecutionMode::Aarch64, 8, &|_| false).unwrap_err();
        assert!(matches!(
            err,
            CompileError::InstructionFetch {
                address: 0x4000,
                ..
            }
        ));

        let block = decode_block(&memory, 0x1000, ExecutionMode::Aarch64, 8, &|_| false).unwrap();
        assert_eq!(block.opcodes.len(), 2);
        assert_eq!(block.end_reason, BlockEnd::FetchFault);
    }

    #[test]
    fn test_condition_evaluation() {
        // N=1, V=0
        assert!(Cond::Lt.holds(0b1000));
        assert!(!Cond::Ge.holds(0b1000));
        // Z=1
        assert!(Cond::Le.holds(0b0100));
        assert!(Cond::Ls.holds(0b0110));
        assert!(Cond::Hi.holds(0b0010));
        for bits in 0..14 {
            let cond = Cond::from_bits(bits);
            for nzcv in 0..16u8 {
                assert_ne!(cond.holds(nzcv), cond.invert().holds(nzcv));
            }
        }
    }
}
