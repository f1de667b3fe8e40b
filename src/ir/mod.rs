// This module defines the intermediate representation every guest block is translated into
// before host code is emitted. Operands and operations live in index-addressed arenas owned by
// a Function that is itself allocated in the per-translation bumpalo arena, so no IR object
// owns another and teardown is dropping the arena. Each operand carries a use-list (the set of
// operations that read it, a hashbrown set allocated in the same arena) and a def-list; the
// mutation API below is the only way to change sources or destinations, and it keeps both
// lists exact. Operations form an intrusive doubly linked list per basic block. Instruction is
// a closed enum so every pass matches it exhaustively. Before SSA construction guest registers
// appear as Register operands; afterwards only locals, constants and undefined values remain.

//! Index-addressed IR with use-lists.

pub mod dominance;
pub mod liveness;
pub mod optimizer;
pub mod ssa;

use crate::core::error::{CompileError, CompileResult};
use crate::decoder::MemSize;
use bumpalo::{collections::Vec as BumpVec, Bump};
use hashbrown::{DefaultHashBuilder, HashMap, HashSet};
use std::fmt;

/// Maximum number of source operands of one operation.
pub const MAX_SOURCES: usize = 4;

macro_rules! index_type {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

index_type!(OperandId, "%");
index_type!(OperationId, "op");
index_type!(BlockId, "bb");

/// Value type of an operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    I32,
    I64,
}

impl Type {
    pub fn bits(self) -> u32 {
        match self {
            Type::I32 => 32,
            Type::I64 => 64,
        }
    }

    /// Mask of the bits a value of this type may have set.
    pub fn mask(self) -> u64 {
        match self {
            Type::I32 => 0xffff_ffff,
            Type::I64 => u64::MAX,
        }
    }
}

/// Guest condition flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    N,
    Z,
    C,
    V,
}

impl Flag {
    pub const ALL: [Flag; 4] = [Flag::N, Flag::Z, Flag::C, Flag::V];

    pub fn index(self) -> usize {
        match self {
            Flag::N => 0,
            Flag::Z => 1,
            Flag::C => 2,
            Flag::V => 3,
        }
    }
}

/// Guest state that SSA construction keeps in locals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuestReg {
    /// General purpose register slot; in A64 slot 31 is SP.
    Gpr(u8),
    Flag(Flag),
}

/// A field of the native execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextField {
    Register(GuestReg),
    Pc,
    Running,
    TpidrEl0,
    TpidrroEl0,
    Fpcr,
    Fpsr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// Virtual register; the payload is a dense local index.
    Local(u32),
    Constant(u64),
    /// Guest register, only present before SSA construction.
    Register(GuestReg),
    Undefined,
}

/// Integer comparison predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    Eq,
    Ne,
    Ult,
    Ule,
    Ugt,
    Uge,
    Slt,
    Sle,
    Sgt,
    Sge,
}

impl Condition {
    pub fn evaluate(self, a: u64, b: u64, ty: Type) -> bool {
        let (sa, sb) = match ty {
            Type::I32 => (a as u32 as i32 as i64, b as u32 as i32 as i64),
            Type::I64 => (a as i64, b as i64),
        };
        match self {
            Condition::Eq => a == b,
            Condition::Ne => a != b,
            Condition::Ult => a < b,
            Condition::Ule => a <= b,
            Condition::Ugt => a > b,
            Condition::Uge => a >= b,
            Condition::Slt => sa < sb,
            Condition::Sle => sa <= sb,
            Condition::Sgt => sa > sb,
            Condition::Sge => sa >= sb,
        }
    }
}

/// Operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Copy,
    Add,
    Subtract,
    Multiply,
    MultiplyHighSigned,
    MultiplyHighUnsigned,
    /// Signed division; a zero divisor yields zero and overflow wraps.
    DivideSigned,
    /// Unsigned division; a zero divisor yields zero.
    DivideUnsigned,
    And,
    Or,
    Xor,
    Not,
    Negate,
    ShiftLeft,
    ShiftRightLogical,
    ShiftRightArithmetic,
    RotateRight,
    CountLeadingZeros,
    ByteSwap,
    /// Produces an I32 0 or 1.
    Compare(Condition),
    /// `dest = sources[0] != 0 ? sources[1] : sources[2]`.
    Select,
    ZeroExtend8,
    ZeroExtend16,
    /// I32 to I64.
    ZeroExtend32,
    SignExtend8,
    SignExtend16,
    /// Low 32 bits sign-extended to I64.
    SignExtend32,
    /// I64 to I32.
    Truncate,
    /// Guest memory read of the given size, zero-extended.
    Load(MemSize),
    /// Guest memory write: `sources = [address, value]`.
    Store(MemSize),
    LoadContext(ContextField),
    StoreContext(ContextField),
    ReadCounter,
    ReadFrequency,
    /// `sources = [pc, immediate]`.
    SupervisorCall,
    /// `sources = [pc, immediate]`.
    Breakpoint,
    /// `sources = [pc, raw encoding]`.
    Undefined,
    /// `sources = [address]`.
    InvalidateCacheLine,
    /// Entry call counter: `sources = [counter address, guest address, threshold]`.
    CountCall,
    Phi,
    Branch(BlockId),
    /// `sources = [condition]`.
    BranchIf {
        then: BlockId,
        otherwise: BlockId,
    },
    /// Leave the function and continue at the guest address in `sources[0]`.
    Dispatch,
    /// Return to the dispatcher with the guest address in `sources[0]`.
    Exit,
}

impl Instruction {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Instruction::Branch(_)
                | Instruction::BranchIf { .. }
                | Instruction::Dispatch
                | Instruction::Exit
        )
    }

    /// Operations that must be kept even when their result is unused.
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            Instruction::Load(_)
                | Instruction::Store(_)
                | Instruction::StoreContext(_)
                | Instruction::SupervisorCall
                | Instruction::Breakpoint
                | Instruction::Undefined
                | Instruction::InvalidateCacheLine
                | Instruction::CountCall
        ) || self.is_terminator()
    }

    /// Operations after which the guest context may have been read or modified by the host.
    pub fn synchronizes_context(&self) -> bool {
        matches!(
            self,
            Instruction::SupervisorCall | Instruction::Breakpoint | Instruction::Undefined
        )
    }

    /// Operations lowered to a call into the native interface.
    pub fn is_native_call(&self) -> bool {
        matches!(
            self,
            Instruction::Load(_)
                | Instruction::Store(_)
                | Instruction::ReadCounter
                | Instruction::ReadFrequency
                | Instruction::SupervisorCall
                | Instruction::Breakpoint
                | Instruction::Undefined
                | Instruction::InvalidateCacheLine
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Instruction::Copy => "copy",
            Instruction::Add => "add",
            Instruction::Subtract => "sub",
            Instruction::Multiply => "mul",
            Instruction::MultiplyHighSigned => "smulh",
            Instruction::MultiplyHighUnsigned => "umulh",
            Instruction::DivideSigned => "sdiv",
            Instruction::DivideUnsigned => "udiv",
            Instruction::And => "and",
            Instruction::Or => "or",
            Instruction::Xor => "xor",
            Instruction::Not => "not",
            Instruction::Negate => "neg",
            Instruction::ShiftLeft => "shl",
            Instruction::ShiftRightLogical => "lshr",
            Instruction::ShiftRightArithmetic => "ashr",
            Instruction::RotateRight => "ror",
            Instruction::CountLeadingZeros => "clz",
            Instruction::ByteSwap => "bswap",
            Instruction::Compare(_) => "cmp",
            Instruction::Select => "select",
            Instruction::ZeroExtend8 => "zext8",
            Instruction::ZeroExtend16 => "zext16",
            Instruction::ZeroExtend32 => "zext32",
            Instruction::SignExtend8 => "sext8",
            Instruction::SignExtend16 => "sext16",
            Instruction::SignExtend32 => "sext32",
            Instruction::Truncate => "trunc",
            Instruction::Load(_) => "load",
            Instruction::Store(_) => "store",
            Instruction::LoadContext(_) => "ldctx",
            Instruction::StoreContext(_) => "stctx",
            Instruction::ReadCounter => "counter",
            Instruction::ReadFrequency => "frequency",
            Instruction::SupervisorCall => "svc",
            Instruction::Breakpoint => "brk",
            Instruction::Undefined => "undefined",
            Instruction::InvalidateCacheLine => "icinval",
            Instruction::CountCall => "countcall",
            Instruction::Phi => "phi",
            Instruction::Branch(_) => "br",
            Instruction::BranchIf { .. } => "brif",
            Instruction::Dispatch => "dispatch",
            Instruction::Exit => "exit",
        }
    }
}

/// An IR value.
pub struct Operand<'a> {
    pub kind: OperandKind,
    pub ty: Type,
    uses: HashSet<OperationId, DefaultHashBuilder, &'a Bump>,
    defs: BumpVec<'a, OperationId>,
}

impl<'a> Operand<'a> {
    /// Operations reading this operand.
    pub fn uses(&self) -> &HashSet<OperationId, DefaultHashBuilder, &'a Bump> {
        &self.uses
    }

    /// Operations writing this operand.
    pub fn defs(&self) -> &[OperationId] {
        &self.defs
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.kind, OperandKind::Constant(_))
    }

    pub fn constant_value(&self) -> Option<u64> {
        match self.kind {
            OperandKind::Constant(value) => Some(value),
            _ => None,
        }
    }

    pub fn local_index(&self) -> Option<u32> {
        match self.kind {
            OperandKind::Local(index) => Some(index),
            _ => None,
        }
    }
}

/// An IR operation.
#[derive(Debug, Clone, Copy)]
pub struct Operation {
    pub inst: Instruction,
    pub dest: Option<OperandId>,
    sources: [OperandId; MAX_SOURCES],
    source_count: u8,
    pub block: BlockId,
    prev: Option<OperationId>,
    next: Option<OperationId>,
    live: bool,
}

impl Operation {
    pub fn sources(&self) -> &[OperandId] {
        &self.sources[..self.source_count as usize]
    }

    pub fn is_live(&self) -> bool {
        self.live
    }
}

/// A basic block: an intrusive list of operations ending in a terminator.
pub struct BasicBlock<'a> {
    first: Option<OperationId>,
    last: Option<OperationId>,
    predecessors: BumpVec<'a, BlockId>,
}

/// A function under translation.
pub struct Function<'a> {
    arena: &'a Bump,
    operands: BumpVec<'a, Operand<'a>>,
    operations: BumpVec<'a, Operation>,
    blocks: BumpVec<'a, BasicBlock<'a>>,
    constants: HashMap<(u64, Type), OperandId, DefaultHashBuilder, &'a Bump>,
    registers: HashMap<GuestReg, OperandId, DefaultHashBuilder, &'a Bump>,
    undefined: [Option<OperandId>; 2],
    local_count: u32,
    /// Guest address of the first instruction.
    pub guest_address: u64,
}

impl<'a> Function<'a> {
    /// Create an empty function with an entry block.
    pub fn new(arena: &'a Bump, guest_address: u64) -> Self {
        let mut function = Self {
            arena,
            operands: BumpVec::new_in(arena),
            operations: BumpVec::new_in(arena),
            blocks: BumpVec::new_in(arena),
            constants: HashMap::new_in(arena),
            registers: HashMap::new_in(arena),
            undefined: [None; 2],
            local_count: 0,
            guest_address,
        };
        function.create_block();
        function
    }

    pub fn arena(&self) -> &'a Bump {
        self.arena
    }

    pub fn entry(&self) -> BlockId {
        BlockId(0)
    }

    pub fn create_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock {
            first: None,
            last: None,
            predecessors: BumpVec::new_in(self.arena),
        });
        id
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + use<> {
        (0..self.blocks.len() as u32).map(BlockId)
    }

    pub fn operand_count(&self) -> usize {
        self.operands.len()
    }

    /// Number of locals; locals are numbered densely from zero.
    pub fn local_count(&self) -> u32 {
        self.local_count
    }

    /// Number of live operations.
    pub fn operation_count(&self) -> usize {
        self.operations.iter().filter(|op| op.live).count()
    }

    fn push_operand(&mut self, kind: OperandKind, ty: Type) -> OperandId {
        let id = OperandId(self.operands.len() as u32);
        self.operands.push(Operand {
            kind,
            ty,
            uses: HashSet::new_in(self.arena),
            defs: BumpVec::new_in(self.arena),
        });
        id
    }

    pub fn new_local(&mut self, ty: Type) -> OperandId {
        let index = self.local_count;
        self.local_count += 1;
        self.push_operand(OperandKind::Local(index), ty)
    }

    /// Interned constant; the value is truncated to the type.
    pub fn constant(&mut self, value: u64, ty: Type) -> OperandId {
        let value = value & ty.mask();
        if let Some(&id) = self.constants.get(&(value, ty)) {
            return id;
        }
        let id = self.push_operand(OperandKind::Constant(value), ty);
        self.constants.insert((value, ty), id);
        id
    }

    /// Interned guest register operand.
    pub fn register(&mut self, reg: GuestReg, ty: Type) -> OperandId {
        if let Some(&id) = self.registers.get(&reg) {
            return id;
        }
        let id = self.push_operand(OperandKind::Register(reg), ty);
        self.registers.insert(reg, id);
        id
    }

    /// Guest register operands referenced so far, in creation order.
    pub fn register_operands(&self) -> Vec<(GuestReg, OperandId)> {
        let mut regs: Vec<_> = self.registers.iter().map(|(r, id)| (*r, *id)).collect();
        regs.sort_by_key(|(_, id)| *id);
        regs
    }

    pub fn undefined(&mut self, ty: Type) -> OperandId {
        let slot = match ty {
            Type::I32 => 0,
            Type::I64 => 1,
        };
        if let Some(id) = self.undefined[slot] {
            return id;
        }
        let id = self.push_operand(OperandKind::Undefined, ty);
        self.undefined[slot] = Some(id);
        id
    }

    pub fn operand(&self, id: OperandId) -> &Operand<'a> {
        &self.operands[id.index()]
    }

    pub fn operation(&self, id: OperationId) -> &Operation {
        &self.operations[id.index()]
    }

    fn new_operation(
        &mut self,
        block: BlockId,
        inst: Instruction,
        dest: Option<OperandId>,
        sources: &[OperandId],
    ) -> CompileResult<OperationId> {
        if sources.len() > MAX_SOURCES {
            return Err(CompileError::InvalidIr {
                reason: format!("{} takes {} sources", inst.name(), sources.len()),
            });
        }
        let id = OperationId(self.operations.len() as u32);
        let mut packed = [OperandId(0); MAX_SOURCES];
        packed[..sources.len()].copy_from_slice(sources);
        self.operations.push(Operation {
            inst,
            dest,
            sources: packed,
            source_count: sources.len() as u8,
            block,
            prev: None,
            next: None,
            live: true,
        });
        for &source in sources {
            self.operands[source.index()].uses.insert(id);
        }
        if let Some(dest) = dest {
            self.operands[dest.index()].defs.push(id);
        }
        Ok(id)
    }

    /// Append an operation at the end of `block`.
    pub fn append(
        &mut self,
        block: BlockId,
        inst: Instruction,
        dest: Option<OperandId>,
        sources: &[OperandId],
    ) -> CompileResult<OperationId> {
        let id = self.new_operation(block, inst, dest, sources)?;
        let last = self.blocks[block.index()].last;
        self.operations[id.index()].prev = last;
        match last {
            Some(last) => self.operations[last.index()].next = Some(id),
            None => self.blocks[block.index()].first = Some(id),
        }
        self.blocks[block.index()].last = Some(id);
        Ok(id)
    }

    /// Insert an operation at the start of `block`.
    pub fn prepend(
        &mut self,
        block: BlockId,
        inst: Instruction,
        dest: Option<OperandId>,
        sources: &[OperandId],
    ) -> CompileResult<OperationId> {
        match self.blocks[block.index()].first {
            Some(first) => self.insert_before(first, inst, dest, sources),
            None => self.append(block, inst, dest, sources),
        }
    }

    /// Insert an operation immediately before `anchor`.
    pub fn insert_before(
        &mut self,
        anchor: OperationId,
        inst: Instruction,
        dest: Option<OperandId>,
        sources: &[OperandId],
    ) -> CompileResult<OperationId> {
        let block = self.operations[anchor.index()].block;
        let id = self.new_operation(block, inst, dest, sources)?;
        let prev = self.operations[anchor.index()].prev;
        self.operations[id.index()].prev = prev;
        self.operations[id.index()].next = Some(anchor);
        self.operations[anchor.index()].prev = Some(id);
        match prev {
            Some(prev) => self.operations[prev.index()].next = Some(id),
            None => self.blocks[block.index()].first = Some(id),
        }
        Ok(id)
    }

    /// Insert an operation immediately after `anchor`.
    pub fn insert_after(
        &mut self,
        anchor: OperationId,
        inst: Instruction,
        dest: Option<OperandId>,
        sources: &[OperandId],
    ) -> CompileResult<OperationId> {
        match self.operations[anchor.index()].next {
            Some(next) => self.insert_before(next, inst, dest, sources),
            None => {
                let block = self.operations[anchor.index()].block;
                self.append(block, inst, dest, sources)
            }
        }
    }

    /// Unlink an operation and drop it from every use- and def-list.
    pub fn remove(&mut self, id: OperationId) {
        let op = self.operations[id.index()];
        if !op.live {
            return;
        }
        match op.prev {
            Some(prev) => self.operations[prev.index()].next = op.next,
            None => self.blocks[op.block.index()].first = op.next,
        }
        match op.next {
            Some(next) => self.operations[next.index()].prev = op.prev,
            None => self.blocks[op.block.index()].last = op.prev,
        }
        for &source in op.sources() {
            self.operands[source.index()].uses.remove(&id);
        }
        if let Some(dest) = op.dest {
            self.operands[dest.index()].defs.retain(|d| *d != id);
        }
        let slot = &mut self.operations[id.index()];
        slot.live = false;
        slot.prev = None;
        slot.next = None;
    }

    /// Replace source `index` of an operation.
    pub fn set_source(&mut self, id: OperationId, index: usize, new: OperandId) {
        let old = self.operations[id.index()].sources[index];
        if old == new {
            return;
        }
        self.operations[id.index()].sources[index] = new;
        if !self.operations[id.index()].sources().contains(&old) {
            self.operands[old.index()].uses.remove(&id);
        }
        self.operands[new.index()].uses.insert(id);
    }

    /// Replace every source of an operation.
    pub fn set_sources(&mut self, id: OperationId, sources: &[OperandId]) -> CompileResult<()> {
        if sources.len() > MAX_SOURCES {
            return Err(CompileError::InvalidIr {
                reason: format!("{} sources do not fit an operation", sources.len()),
            });
        }
        let old = self.operations[id.index()];
        for &source in old.sources() {
            self.operands[source.index()].uses.remove(&id);
        }
        let op = &mut self.operations[id.index()];
        op.sources = [OperandId(0); MAX_SOURCES];
        op.sources[..sources.len()].copy_from_slice(sources);
        op.source_count = sources.len() as u8;
        for &source in sources {
            self.operands[source.index()].uses.insert(id);
        }
        Ok(())
    }

    pub fn set_instruction(&mut self, id: OperationId, inst: Instruction) {
        self.operations[id.index()].inst = inst;
    }

    pub fn set_dest(&mut self, id: OperationId, dest: Option<OperandId>) {
        if let Some(old) = self.operations[id.index()].dest {
            self.operands[old.index()].defs.retain(|d| *d != id);
        }
        self.operations[id.index()].dest = dest;
        if let Some(new) = dest {
            self.operands[new.index()].defs.push(id);
        }
    }

    /// Rewrite every use of `old` to `new`.
    pub fn replace_all_uses(&mut self, old: OperandId, new: OperandId) {
        if old == new {
            return;
        }
        let users: Vec<OperationId> = self.operands[old.index()].uses.iter().copied().collect();
        for user in users {
            for index in 0..self.operations[user.index()].source_count as usize {
                if self.operations[user.index()].sources[index] == old {
                    self.set_source(user, index, new);
                }
            }
        }
    }

    /// Live operations of a block in order.
    pub fn block_operations(&self, block: BlockId) -> Vec<OperationId> {
        let mut ops = Vec::new();
        let mut cursor = self.blocks[block.index()].first;
        while let Some(id) = cursor {
            ops.push(id);
            cursor = self.operations[id.index()].next;
        }
        ops
    }

    pub fn first_operation(&self, block: BlockId) -> Option<OperationId> {
        self.blocks[block.index()].first
    }

    /// The block's terminator, if its last operation is one.
    pub fn terminator(&self, block: BlockId) -> Option<OperationId> {
        self.blocks[block.index()]
            .last
            .filter(|id| self.operations[id.index()].inst.is_terminator())
    }

    pub fn successors(&self, block: BlockId) -> Vec<BlockId> {
        match self.terminator(block).map(|id| self.operations[id.index()].inst) {
            Some(Instruction::Branch(target)) => vec![target],
            Some(Instruction::BranchIf { then, otherwise }) if then == otherwise => vec![then],
            Some(Instruction::BranchIf { then, otherwise }) => vec![then, otherwise],
            _ => Vec::new(),
        }
    }

    pub fn predecessors(&self, block: BlockId) -> &[BlockId] {
        &self.blocks[block.index()].predecessors
    }

    /// Recompute predecessor lists from the terminators.
    pub fn compute_predecessors(&mut self) {
        for block in self.blocks.iter_mut() {
            block.predecessors.clear();
        }
        for block in 0..self.blocks.len() as u32 {
            for successor in self.successors(BlockId(block)) {
                self.blocks[successor.index()]
                    .predecessors
                    .push(BlockId(block));
            }
        }
    }

    /// Check structural invariants: exact use-lists, terminators and phi arity.
    pub fn verify(&self) -> CompileResult<()> {
        let invalid = |reason: String| Err(CompileError::InvalidIr { reason });

        let mut expected: Vec<Vec<OperationId>> = vec![Vec::new(); self.operands.len()];
        for block in self.block_ids() {
            let ops = self.block_operations(block);
            let Some((&last, body)) = ops.split_last() else {
                return invalid(format!("{block} is empty"));
            };
            if !self.operations[last.index()].inst.is_terminator() {
                return invalid(format!("{block} does not end in a terminator"));
            }
            for &id in body {
                if self.operations[id.index()].inst.is_terminator() {
                    return invalid(format!("{id} terminates {block} early"));
                }
            }
            for &id in &ops {
                let op = &self.operations[id.index()];
                if !op.live || op.block != block {
                    return invalid(format!("{id} is linked into {block} but not owned by it"));
                }
                if op.inst == Instruction::Phi
                    && op.sources().len() != self.predecessors(block).len()
                {
                    return invalid(format!("{id} has the wrong phi arity"));
                }
                for &source in op.sources() {
                    if !expected[source.index()].contains(&id) {
                        expected[source.index()].push(id);
                    }
                }
            }
        }

        for (index, operand) in self.operands.iter().enumerate() {
            let uses = &expected[index];
            if operand.uses.len() != uses.len() || !uses.iter().all(|u| operand.uses.contains(u)) {
                return invalid(format!(
                    "use-list of %{index} has {} entries, expected {}",
                    operand.uses.len(),
                    uses.len()
                ));
            }
        }
        Ok(())
    }

    fn fmt_operand(&self, f: &mut fmt::Formatter<'_>, id: OperandId) -> fmt::Result {
        let operand = &self.operands[id.index()];
        match operand.kind {
            OperandKind::Local(index) => write!(f, "v{index}"),
            OperandKind::Constant(value) => write!(f, "#{value:#x}"),
            OperandKind::Register(GuestReg::Gpr(n)) => write!(f, "r{n}"),
            OperandKind::Register(GuestReg::Flag(flag)) => write!(f, "{flag:?}"),
            OperandKind::Undefined => write!(f, "undef"),
        }
    }
}

impl fmt::Display for Function<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "function @{:#x}:", self.guest_address)?;
        for block in self.block_ids() {
            writeln!(f, "{block}: preds {:?}", self.predecessors(block))?;
            for id in self.block_operations(block) {
                let op = &self.operations[id.index()];
                write!(f, "  ")?;
                if let Some(dest) = op.dest {
                    self.fmt_operand(f, dest)?;
                    write!(f, ":{:?} = ", self.operands[dest.index()].ty)?;
                }
                write!(f, "{}", op.inst.name())?;
                match op.inst {
                    Instruction::Compare(cond) => write!(f, ".{cond:?}")?,
                    Instruction::LoadContext(field) | Instruction::StoreContext(field) => {
                        write!(f, " [{field:?}]")?
                    }
                    Instruction::Branch(target) => write!(f, " {target}")?,
                    Instruction::BranchIf { then, otherwise } => {
                        write!(f, " {then}, {otherwise} if")?
                    }
                    _ => {}
                }
                for (i, &source) in op.sources().iter().enumerate() {
                    write!(f, "{}", if i == 0 { " " } else { ", " })?;
                    self.fmt_operand(f, source)?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_use_lists_follow_mutations() {
        let arena = Bump::new();
        let mut func = Function::new(&arena, 0x1000);
        let entry = func.entry();

        let a = func.new_local(Type::I64);
        let b = func.new_local(Type::I64);
        let c = func.constant(5, Type::I64);
        let def_a = func.append(entry, Instruction::Copy, Some(a), &[c]).unwrap();
        let add = func
            .append(entry, Instruction::Add, Some(b), &[a, a])
            .unwrap();
        func.append(entry, Instruction::Dispatch, None, &[b]).unwrap();
        func.compute_predecessors();

        assert_eq!(func.operand(a).uses().len(), 1);
        assert_eq!(func.operand(a).defs(), &[def_a]);
        func.verify().unwrap();

        // Replacing one of two identical sources keeps the use.
        func.set_source(add, 0, c);
        assert!(func.operand(a).uses().contains(&add));
        func.set_source(add, 1, c);
        assert!(func.operand(a).uses().is_empty());
        func.verify().unwrap();

        func.remove(def_a);
        assert!(func.operand(a).defs().is_empty());
        assert!(!func.operand(c).uses().contains(&def_a));
        func.verify().unwrap();
    }

    #[test]
    fn test_replace_all_uses_and_insertion_order() {
        let arena = Bump::new();
        let mut func = Function::new(&arena, 0);
        let entry = func.entry();
        let x = func.new_local(Type::I32);
        let y = func.new_local(Type::I32);
        let one = func.constant(1, Type::I32);

        let term = func.append(entry, Instruction::Exit, None, &[x]).unwrap();
        let def_x = func
            .insert_before(term, Instruction::Copy, Some(x), &[one])
            .unwrap();
        let def_y = func
            .insert_after(def_x, Instruction::Add, Some(y), &[x, one])
            .unwrap();
        func.compute_predecessors();

        assert_eq!(func.block_operations(entry), vec![def_x, def_y, term]);
        func.replace_all_uses(x, y);
        assert!(func.operand(x).uses().is_empty());
        assert_eq!(func.operand(y).uses().len(), 2);
        func.verify().unwrap();
    }

    #[test]
    fn test_verify_rejects_missing_terminator() {
        let arena = Bump::new();
        let mut func = Function::new(&arena, 0);
        let v = func.new_local(Type::I64);
        let zero = func.constant(0, Type::I64);
        func.append(func.entry(), Instruction::Copy, Some(v), &[zero])
            .unwrap();
        assert!(matches!(
            func.verify(),
            Err(CompileError::InvalidIr { .. })
        ));
    }

    #[test]
    fn test_constants_are_interned_and_truncated() {
        let arena = Bump::new();
        let mut func = Function::new(&arena, 0);
        let a = func.constant(0x1_0000_0001, Type::I32);
        let b = func.constant(1, Type::I32);
        let c = func.constant(1, Type::I64);
        assert_eq!(a, b);
        assert_ne!(b, c);
        assert_eq!(func.operand(a).constant_value(), Some(1));
    }
}
