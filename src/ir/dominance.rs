//! Dominator tree and dominance frontiers.
//!
//! Uses the iterative algorithm of Cooper, Harvey and Kennedy over the reverse postorder.
//! Unreachable blocks have no immediate dominator and an empty frontier.

use super::{BlockId, Function};

const UNREACHABLE: usize = usize::MAX;

pub struct DominatorTree {
    idom: Vec<Option<BlockId>>,
    rpo: Vec<BlockId>,
    rpo_index: Vec<usize>,
    children: Vec<Vec<BlockId>>,
    frontiers: Vec<Vec<BlockId>>,
}

impl DominatorTree {
    pub fn compute(func: &Function<'_>) -> Self {
        let count = func.block_count();
        let rpo = reverse_postorder(func);
        let mut rpo_index = vec![UNREACHABLE; count];
        for (index, block) in rpo.iter().enumerate() {
            rpo_index[block.index()] = index;
        }

        let entry = func.entry();
        let mut idom: Vec<Option<BlockId>> = vec![None; count];
        idom[entry.index()] = Some(entry);

        let mut changed = true;
        while changed {
            changed = false;
            for &block in rpo.iter().skip(1) {
                let mut new_idom: Option<BlockId> = None;
                for &pred in func.predecessors(block) {
                    if idom[pred.index()].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(current) => intersect(&idom, &rpo_index, pred, current),
                    });
                }
                if new_idom.is_some() && idom[block.index()] != new_idom {
                    idom[block.index()] = new_idom;
                    changed = true;
                }
            }
        }

        let mut children = vec![Vec::new(); count];
        for &block in rpo.iter().skip(1) {
            if let Some(parent) = idom[block.index()] {
                children[parent.index()].push(block);
            }
        }

        let mut frontiers: Vec<Vec<BlockId>> = vec![Vec::new(); count];
        for &block in &rpo {
            let preds: Vec<BlockId> = func
                .predecessors(block)
                .iter()
                .copied()
                .filter(|p| rpo_index[p.index()] != UNREACHABLE)
                .collect();
            if preds.len() < 2 {
                continue;
            }
            let Some(block_idom) = idom[block.index()] else {
                continue;
            };
            for pred in preds {
                let mut runner = pred;
                while runner != block_idom {
                    let frontier = &mut frontiers[runner.index()];
                    if !frontier.contains(&block) {
                        frontier.push(block);
                    }
                    match idom[runner.index()] {
                        Some(next) if next != runner => runner = next,
                        _ => break,
                    }
                }
            }
        }

        idom[entry.index()] = None;
        Self {
            idom,
            rpo,
            rpo_index,
            children,
            frontiers,
        }
    }

    /// Immediate dominator; `None` for the entry and unreachable blocks.
    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        self.idom[block.index()]
    }

    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.rpo_index[block.index()] != UNREACHABLE
    }

    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if !self.is_reachable(b) {
            return false;
        }
        let mut current = b;
        loop {
            if current == a {
                return true;
            }
            match self.idom(current) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    /// Blocks immediately dominated by `block`.
    pub fn children(&self, block: BlockId) -> &[BlockId] {
        &self.children[block.index()]
    }

    pub fn frontier(&self, block: BlockId) -> &[BlockId] {
        &self.frontiers[block.index()]
    }

    pub fn reverse_postorder(&self) -> &[BlockId] {
        &self.rpo
    }
}

fn intersect(
    idom: &[Option<BlockId>],
    rpo_index: &[usize],
    mut a: BlockId,
    mut b: BlockId,
) -> BlockId {
    while a != b {
        while rpo_index[a.index()] > rpo_index[b.index()] {
            match idom[a.index()] {
                Some(next) => a = next,
                None => return b,
            }
        }
        while rpo_index[b.index()] > rpo_index[a.index()] {
            match idom[b.index()] {
                Some(next) => b = next,
                None => return a,
            }
        }
    }
    a
}

fn reverse_postorder(func: &Function<'_>) -> Vec<BlockId> {
    let count = func.block_count();
    let mut visited = vec![false; count];
    let mut postorder = Vec::with_capacity(count);
    let mut stack: Vec<(BlockId, Vec<BlockId>)> = Vec::new();

    let entry = func.entry();
    visited[entry.index()] = true;
    stack.push((entry, func.successors(entry)));

    while let Some((block, pending)) = stack.last_mut() {
        match pending.pop() {
            Some(next) if !visited[next.index()] => {
                visited[next.index()] = true;
                let successors = func.successors(next);
                stack.push((next, successors));
            }
            Some(_) => {}
            None => {
                postorder.push(*block);
                stack.pop();
            }
        }
    }

    postorder.reverse();
    postorder
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Instruction, Type};
    use bumpalo::Bump;

    /// entry -> a; a -> b | c; b -> d; c -> d; d -> a | exit
    fn loop_diamond(arena: &Bump) -> (Function<'_>, [BlockId; 6]) {
        let mut func = Function::new(arena, 0);
        let entry = func.entry();
        let a = func.create_block();
        let b = func.create_block();
        let c = func.create_block();
        let d = func.create_block();
        let exit = func.create_block();
        let cond = func.new_local(Type::I32);
        let zero = func.constant(0, Type::I32);
        let pc = func.constant(0, Type::I64);

        func.append(entry, Instruction::Copy, Some(cond), &[zero]).unwrap();
        func.append(entry, Instruction::Branch(a), None, &[]).unwrap();
        func.append(a, Instruction::BranchIf { then: b, otherwise: c }, None, &[cond])
            .unwrap();
        func.append(b, Instruction::Branch(d), None, &[]).unwrap();
        func.append(c, Instruction::Branch(d), None, &[]).unwrap();
        func.append(d, Instruction::BranchIf { then: a, otherwise: exit }, None, &[cond])
            .unwrap();
        func.append(exit, Instruction::Exit, None, &[pc]).unwrap();
        func.compute_predecessors();
        (func, [entry, a, b, c, d, exit])
    }

    #[test]
    fn test_idoms_and_frontiers() {
        let arena = Bump::new();
        let (func, [entry, a, b, c, d, exit]) = loop_diamond(&arena);
        let tree = DominatorTree::compute(&func);

        assert_eq!(tree.idom(entry), None);
        assert_eq!(tree.idom(a), Some(entry));
        assert_eq!(tree.idom(b), Some(a));
        assert_eq!(tree.idom(c), Some(a));
        assert_eq!(tree.idom(d), Some(a));
        assert_eq!(tree.idom(exit), Some(d));

        assert_eq!(tree.frontier(b), &[d]);
        assert_eq!(tree.frontier(c), &[d]);
        assert_eq!(tree.frontier(d), &[a]);
        assert_eq!(tree.frontier(a), &[a]);
        assert!(tree.frontier(entry).is_empty());

        assert!(tree.dominates(a, exit));
        assert!(!tree.dominates(b, d));
        assert_eq!(tree.reverse_postorder()[0], entry);
    }

    #[test]
    fn test_unreachable_block() {
        let arena = Bump::new();
        let mut func = Function::new(&arena, 0);
        let dead = func.create_block();
        let pc = func.constant(4, Type::I64);
        func.append(func.entry(), Instruction::Exit, None, &[pc]).unwrap();
        func.append(dead, Instruction::Exit, None, &[pc]).unwrap();
        func.compute_predecessors();

        let tree = DominatorTree::compute(&func);
        assert!(!tree.is_reachable(dead));
        assert_eq!(tree.idom(dead), None);
    }
}
