// SSA construction turns the guest register operands the translator emitted into locals.
// Every register referenced by the function is loaded from the context once at entry; phis are
// placed on the iterated dominance frontier of the blocks that define the register, where a
// context-synchronizing operation (SVC, BRK, undefined instruction) counts as a definition of
// every register because the host may have changed any of them. Renaming walks the dominator
// tree keeping one value stack per register. Write-back is decided after renaming: every exit
// and every synchronizing operation records the values current at that point, and a
// StoreContext is emitted only for values that differ from what the context holds, which is
// every value not produced by a LoadContext (phis are clean only if all their inputs are).
//
// Deconstruction gives every phi a fresh temporary assigned at the end of each predecessor,
// then turns the phi into a copy from that temporary.

//! SSA construction and deconstruction.

use super::dominance::DominatorTree;
use super::{
    BlockId, ContextField, Function, GuestReg, Instruction, OperandId, OperandKind,
    OperationId, MAX_SOURCES,
};
use crate::core::error::{CompileError, CompileResult};

struct PendingStore {
    anchor: OperationId,
    reg: GuestReg,
    value: OperandId,
}

/// Rewrite guest register operands into SSA locals.
pub fn construct(func: &mut Function<'_>) -> CompileResult<()> {
    func.compute_predecessors();
    if !func.predecessors(func.entry()).is_empty() {
        return Err(CompileError::BlockLayout {
            reason: "entry block has predecessors".into(),
        });
    }
    neutralize_unreachable(func)?;
    func.compute_predecessors();

    for block in func.block_ids() {
        let preds = func.predecessors(block).len();
        if preds > MAX_SOURCES {
            return Err(CompileError::BlockLayout {
                reason: format!("{block} has {preds} predecessors"),
            });
        }
    }

    let tree = DominatorTree::compute(func);
    let registers = func.register_operands();
    let reg_index = |operand: OperandId| registers.iter().position(|(_, id)| *id == operand);

    // Blocks defining each register; sync blocks define all of them.
    let mut def_blocks: Vec<Vec<BlockId>> = vec![Vec::new(); registers.len()];
    for block in func.block_ids() {
        for id in func.block_operations(block) {
            let op = func.operation(id);
            if op.inst.synchronizes_context() {
                for defs in def_blocks.iter_mut() {
                    if !defs.contains(&block) {
                        defs.push(block);
                    }
                }
            } else if let Some(index) = op.dest.and_then(reg_index) {
                if !def_blocks[index].contains(&block) {
                    def_blocks[index].push(block);
                }
            }
        }
    }

    // Phi placement on the iterated dominance frontier.
    let mut phi_reg: Vec<(OperationId, usize)> = Vec::new();
    for (index, &(_, operand)) in registers.iter().enumerate() {
        let mut has_phi = vec![false; func.block_count()];
        let mut worklist = def_blocks[index].clone();
        while let Some(block) = worklist.pop() {
            for &frontier in tree.frontier(block) {
                if has_phi[frontier.index()] {
                    continue;
                }
                has_phi[frontier.index()] = true;
                let arity = func.predecessors(frontier).len();
                let sources = vec![operand; arity];
                let phi = func.prepend(frontier, Instruction::Phi, Some(operand), &sources)?;
                phi_reg.push((phi, index));
                if !def_blocks[index].contains(&frontier) {
                    worklist.push(frontier);
                }
            }
        }
    }
    let phi_register = |id: OperationId| {
        phi_reg
            .iter()
            .find(|(phi, _)| *phi == id)
            .map(|(_, index)| *index)
    };

    // Initial values.
    let entry = func.entry();
    let mut stacks: Vec<Vec<OperandId>> = vec![Vec::new(); registers.len()];
    for (index, &(reg, operand)) in registers.iter().enumerate().rev() {
        let ty = func.operand(operand).ty;
        let value = func.new_local(ty);
        func.prepend(
            entry,
            Instruction::LoadContext(ContextField::Register(reg)),
            Some(value),
            &[],
        )?;
        stacks[index].push(value);
    }

    let mut pending = Vec::new();
    enum Visit {
        Enter(BlockId),
        Leave(Vec<usize>),
    }
    let mut walk = vec![Visit::Enter(entry)];
    while let Some(visit) = walk.pop() {
        let block = match visit {
            Visit::Leave(heights) => {
                for (stack, height) in stacks.iter_mut().zip(heights) {
                    stack.truncate(height);
                }
                continue;
            }
            Visit::Enter(block) => block,
        };
        walk.push(Visit::Leave(stacks.iter().map(Vec::len).collect()));

        for id in func.block_operations(block) {
            let op = *func.operation(id);

            if op.inst == Instruction::Phi {
                if let Some(index) = phi_register(id) {
                    let value = func.new_local(func.operand(registers[index].1).ty);
                    func.set_dest(id, Some(value));
                    stacks[index].push(value);
                }
                continue;
            }

            for (slot, &source) in op.sources().iter().enumerate() {
                if let Some(index) = reg_index(source) {
                    let current = current_value(&stacks, index)?;
                    func.set_source(id, slot, current);
                }
            }

            if op.inst.synchronizes_context()
                || matches!(op.inst, Instruction::Exit | Instruction::Dispatch)
            {
                for (index, &(reg, _)) in registers.iter().enumerate() {
                    pending.push(PendingStore {
                        anchor: id,
                        reg,
                        value: current_value(&stacks, index)?,
                    });
                }
            }

            if let Some(index) = op.dest.and_then(reg_index) {
                let value = func.new_local(func.operand(registers[index].1).ty);
                func.set_dest(id, Some(value));
                stacks[index].push(value);
            }

            if op.inst.synchronizes_context() {
                let mut anchor = id;
                for (index, &(reg, operand)) in registers.iter().enumerate() {
                    let value = func.new_local(func.operand(operand).ty);
                    anchor = func.insert_after(
                        anchor,
                        Instruction::LoadContext(ContextField::Register(reg)),
                        Some(value),
                        &[],
                    )?;
                    stacks[index].push(value);
                }
            }
        }

        for successor in func.successors(block) {
            let Some(position) = func
                .predecessors(successor)
                .iter()
                .position(|p| *p == block)
            else {
                continue;
            };
            for id in func.block_operations(successor) {
                if func.operation(id).inst != Instruction::Phi {
                    break;
                }
                if let Some(index) = phi_register(id) {
                    let current = current_value(&stacks, index)?;
                    func.set_source(id, position, current);
                }
            }
        }

        for &child in tree.children(block).iter().rev() {
            walk.push(Visit::Enter(child));
        }
    }

    for &(reg, operand) in &registers {
        let remaining = func.operand(operand);
        if !remaining.uses().is_empty() || !remaining.defs().is_empty() {
            return Err(CompileError::InvalidIr {
                reason: format!("{reg:?} still referenced after renaming"),
            });
        }
    }

    let dirty = dirty_values(func);
    for store in pending {
        if dirty[store.value.index()] {
            func.insert_before(
                store.anchor,
                Instruction::StoreContext(ContextField::Register(store.reg)),
                None,
                &[store.value],
            )?;
        }
    }
    Ok(())
}

fn current_value(stacks: &[Vec<OperandId>], index: usize) -> CompileResult<OperandId> {
    stacks[index]
        .last()
        .copied()
        .ok_or_else(|| CompileError::InvalidIr {
            reason: "register read without a reaching definition".into(),
        })
}

/// Replace the body of every unreachable block with an exit so no edge leaves it.
fn neutralize_unreachable(func: &mut Function<'_>) -> CompileResult<()> {
    let tree = DominatorTree::compute(func);
    let dead: Vec<BlockId> = func.block_ids().filter(|b| !tree.is_reachable(*b)).collect();
    if dead.is_empty() {
        return Ok(());
    }
    let pc = func.constant(func.guest_address, super::Type::I64);
    for block in dead {
        for id in func.block_operations(block) {
            func.remove(id);
        }
        func.append(block, Instruction::Exit, None, &[pc])?;
    }
    Ok(())
}

/// Locals whose value may differ from the context field they shadow.
fn dirty_values(func: &Function<'_>) -> Vec<bool> {
    let mut dirty = vec![false; func.operand_count()];
    let mut phis = Vec::new();
    for index in 0..func.operand_count() {
        let operand = func.operand(OperandId(index as u32));
        if !matches!(operand.kind, OperandKind::Local(_)) {
            continue;
        }
        for &def in operand.defs() {
            match func.operation(def).inst {
                Instruction::LoadContext(_) => {}
                Instruction::Phi => phis.push(def),
                _ => dirty[index] = true,
            }
        }
    }

    let mut changed = true;
    while changed {
        changed = false;
        for &phi in &phis {
            let op = func.operation(phi);
            let Some(dest) = op.dest else { continue };
            if dirty[dest.index()] {
                continue;
            }
            if op.sources().iter().any(|s| dirty[s.index()]) {
                dirty[dest.index()] = true;
                changed = true;
            }
        }
    }
    dirty
}

/// Replace phis with copies through per-phi temporaries. Returns the number of phis resolved.
pub fn deconstruct(func: &mut Function<'_>) -> CompileResult<usize> {
    let mut resolved = 0;
    for block in func.block_ids().collect::<Vec<_>>() {
        let preds = func.predecessors(block).to_vec();
        for id in func.block_operations(block) {
            let op = *func.operation(id);
            if op.inst != Instruction::Phi {
                break;
            }
            let Some(dest) = op.dest else {
                func.remove(id);
                continue;
            };
            let temp = func.new_local(func.operand(dest).ty);
            for (&pred, &source) in preds.iter().zip(op.sources()) {
                let terminator = func.terminator(pred).ok_or_else(|| CompileError::BlockLayout {
                    reason: format!("{pred} has no terminator"),
                })?;
                func.insert_before(terminator, Instruction::Copy, Some(temp), &[source])?;
            }
            func.set_instruction(id, Instruction::Copy);
            func.set_sources(id, &[temp])?;
            resolved += 1;
        }
    }
    Ok(resolved)
}
