//! Block-level liveness of locals, computed after SSA deconstruction.

use super::{BlockId, Function, OperandKind};

/// Dense bit set over local indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSet {
    words: Vec<u64>,
}

impl LocalSet {
    pub fn new(capacity: u32) -> Self {
        Self {
            words: vec![0; (capacity as usize).div_ceil(64)],
        }
    }

    pub fn insert(&mut self, local: u32) -> bool {
        let (word, bit) = (local as usize / 64, local % 64);
        let was = self.words[word] & (1 << bit) != 0;
        self.words[word] |= 1 << bit;
        !was
    }

    pub fn remove(&mut self, local: u32) {
        let (word, bit) = (local as usize / 64, local % 64);
        self.words[word] &= !(1 << bit);
    }

    pub fn contains(&self, local: u32) -> bool {
        let (word, bit) = (local as usize / 64, local % 64);
        self.words.get(word).is_some_and(|w| w & (1 << bit) != 0)
    }

    /// Add every member of `other`; returns whether anything changed.
    pub fn union_with(&mut self, other: &LocalSet) -> bool {
        let mut changed = false;
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            let merged = *a | *b;
            changed |= merged != *a;
            *a = merged;
        }
        changed
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(index, &word)| {
            (0..64)
                .filter(move |bit| word & (1u64 << bit) != 0)
                .map(move |bit| (index * 64 + bit) as u32)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }
}

pub struct Liveness {
    live_in: Vec<LocalSet>,
    live_out: Vec<LocalSet>,
}

impl Liveness {
    pub fn compute(func: &Function<'_>) -> Self {
        let count = func.block_count();
        let locals = func.local_count();
        let mut uses = vec![LocalSet::new(locals); count];
        let mut defs = vec![LocalSet::new(locals); count];

        for block in func.block_ids() {
            let (block_uses, block_defs) = (&mut uses[block.index()], &mut defs[block.index()]);
            for id in func.block_operations(block) {
                let op = func.operation(id);
                for &source in op.sources() {
                    if let OperandKind::Local(local) = func.operand(source).kind {
                        if !block_defs.contains(local) {
                            block_uses.insert(local);
                        }
                    }
                }
                if let Some(OperandKind::Local(local)) = op.dest.map(|d| func.operand(d).kind) {
                    block_defs.insert(local);
                }
            }
        }

        let mut live_in = uses.clone();
        let mut live_out = vec![LocalSet::new(locals); count];
        let order: Vec<BlockId> = func.block_ids().collect();
        let mut changed = true;
        while changed {
            changed = false;
            for &block in order.iter().rev() {
                let mut out = LocalSet::new(locals);
                for successor in func.successors(block) {
                    out.union_with(&live_in[successor.index()]);
                }
                let mut input = out.clone();
                for local in defs[block.index()].iter() {
                    input.remove(local);
                }
                input.union_with(&uses[block.index()]);

                if out != live_out[block.index()] {
                    live_out[block.index()] = out;
                    changed = true;
                }
                if input != live_in[block.index()] {
                    live_in[block.index()] = input;
                    changed = true;
                }
            }
        }

        Self { live_in, live_out }
    }

    pub fn live_in(&self, block: BlockId) -> &LocalSet {
        &self.live_in[block.index()]
    }

    pub fn live_out(&self, block: BlockId) -> &LocalSet {
        &self.live_out[block.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Instruction, Type};
    use bumpalo::Bump;

    #[test]
    fn test_local_set() {
        let mut set = LocalSet::new(130);
        assert!(set.insert(3));
        assert!(!set.insert(3));
        set.insert(129);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![3, 129]);
        set.remove(3);
        assert!(!set.contains(3));
        assert!(!set.is_empty());
    }

    #[test]
    fn test_value_live_across_loop() {
        let arena = Bump::new();
        let mut func = Function::new(&arena, 0);
        let entry = func.entry();
        let header = func.create_block();
        let exit = func.create_block();

        let counter = func.new_local(Type::I64);
        let cond = func.new_local(Type::I32);
        let zero = func.constant(0, Type::I64);
        let one = func.constant(1, Type::I64);

        func.append(entry, Instruction::Copy, Some(counter), &[zero]).unwrap();
        func.append(entry, Instruction::Branch(header), None, &[]).unwrap();
        func.append(header, Instruction::Add, Some(counter), &[counter, one])
            .unwrap();
        func.append(
            header,
            Instruction::Compare(crate::ir::Condition::Ult),
            Some(cond),
            &[counter, one],
        )
        .unwrap();
        func.append(header, Instruction::BranchIf { then: header, otherwise: exit }, None, &[cond])
            .unwrap();
        func.append(exit, Instruction::Dispatch, None, &[counter]).unwrap();
        func.compute_predecessors();

        let liveness = Liveness::compute(&func);
        let counter_local = func.operand(counter).local_index().unwrap();
        let cond_local = func.operand(cond).local_index().unwrap();

        assert!(liveness.live_in(header).contains(counter_local));
        assert!(liveness.live_out(header).contains(counter_local));
        assert!(!liveness.live_out(header).contains(cond_local));
        assert!(liveness.live_out(entry).contains(counter_local));
        assert!(liveness.live_in(entry).is_empty());
    }
}
