//! SSA optimizer: copy propagation, constant folding and dead-code elimination.
//!
//! The passes run in rounds until a round changes nothing. Each pass goes through the
//! [`Function`] mutation API, so use-lists stay exact and DCE can rely on an empty use-list
//! meaning "unused".

use super::{Function, Instruction, OperandId, OperandKind, OperationId, Type};

/// Optimization tier of a translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Quick translation with a call counter for later re-translation.
    Fast,
    /// Full optimization to a fixed point.
    Optimized,
}

/// Upper bound on optimizer rounds; real functions converge in a handful.
const MAX_ROUNDS: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizerStats {
    pub rounds: usize,
    pub copies_propagated: usize,
    pub constants_folded: usize,
    pub operations_removed: usize,
}

impl OptimizerStats {
    fn changes(&self) -> usize {
        self.copies_propagated + self.constants_folded + self.operations_removed
    }
}

/// Optimize an SSA function for the given tier.
pub fn optimize(func: &mut Function<'_>, tier: Tier) -> OptimizerStats {
    let mut stats = OptimizerStats::default();
    match tier {
        Tier::Fast => {
            stats.rounds = 1;
            stats.operations_removed = eliminate_dead_code(func);
        }
        Tier::Optimized => {
            while stats.rounds < MAX_ROUNDS {
                stats.rounds += 1;
                let before = stats.changes();
                stats.copies_propagated += propagate_copies(func);
                stats.constants_folded += fold_constants(func);
                stats.operations_removed += eliminate_dead_code(func);
                if stats.changes() == before {
                    break;
                }
            }
            if stats.rounds == MAX_ROUNDS {
                log::warn!(
                    "optimizer hit the round limit at {:#x}",
                    func.guest_address
                );
            }
        }
    }
    log::trace!("optimizer: {stats:?}");
    stats
}

fn live_operations(func: &Function<'_>) -> Vec<OperationId> {
    func.block_ids()
        .flat_map(|block| func.block_operations(block))
        .collect()
}

/// Forward single-definition copies and collapse trivial phis.
pub fn propagate_copies(func: &mut Function<'_>) -> usize {
    let mut changed = 0;
    for id in live_operations(func) {
        let op = *func.operation(id);
        if !op.is_live() {
            continue;
        }
        let Some(dest) = op.dest else { continue };

        match op.inst {
            Instruction::Phi => {
                let mut unique: Option<OperandId> = None;
                let mut trivial = true;
                for &source in op.sources() {
                    if source == dest || Some(source) == unique {
                        continue;
                    }
                    if unique.is_some() {
                        trivial = false;
                        break;
                    }
                    unique = Some(source);
                }
                if let (true, Some(source)) = (trivial, unique) {
                    func.set_instruction(id, Instruction::Copy);
                    // set_sources only fails for oversized lists.
                    if func.set_sources(id, &[source]).is_ok() {
                        changed += 1;
                    }
                }
            }
            Instruction::Copy => {
                let source = op.sources()[0];
                if func.operand(dest).defs().len() != 1
                    || !matches!(func.operand(dest).kind, OperandKind::Local(_))
                    || func.operand(source).ty != func.operand(dest).ty
                {
                    continue;
                }
                func.replace_all_uses(dest, source);
                func.remove(id);
                changed += 1;
            }
            _ => {}
        }
    }
    changed
}

/// Replace pure operations over constants by their result.
pub fn fold_constants(func: &mut Function<'_>) -> usize {
    let mut folded = 0;
    for id in live_operations(func) {
        let op = *func.operation(id);
        if !op.is_live() || op.inst == Instruction::Copy {
            continue;
        }
        let Some(dest) = op.dest else { continue };
        if func.operand(dest).defs().len() != 1 {
            continue;
        }
        let mut values = [0u64; super::MAX_SOURCES];
        let mut all_constant = true;
        for (slot, &source) in op.sources().iter().enumerate() {
            match func.operand(source).constant_value() {
                Some(value) => values[slot] = value,
                None => {
                    all_constant = false;
                    break;
                }
            }
        }
        if !all_constant {
            continue;
        }
        let source_ty = op
            .sources()
            .first()
            .map(|s| func.operand(*s).ty)
            .unwrap_or(Type::I64);
        let dest_ty = func.operand(dest).ty;
        let Some(value) = evaluate(op.inst, dest_ty, source_ty, &values[..op.sources().len()])
        else {
            continue;
        };
        let constant = func.constant(value, dest_ty);
        func.replace_all_uses(dest, constant);
        func.remove(id);
        folded += 1;
    }
    folded
}

/// Remove operations whose results are unused and that have no side effects.
pub fn eliminate_dead_code(func: &mut Function<'_>) -> usize {
    let mut worklist = live_operations(func);
    let mut removed = 0;
    while let Some(id) = worklist.pop() {
        let op = *func.operation(id);
        if !op.is_live() || op.inst.has_side_effects() {
            continue;
        }
        let Some(dest) = op.dest else { continue };
        if !func.operand(dest).uses().is_empty() {
            continue;
        }
        func.remove(id);
        removed += 1;
        for &source in op.sources() {
            worklist.extend(func.operand(source).defs().iter().copied());
        }
    }
    removed
}

/// Compute the result of a pure instruction over constant inputs.
pub fn evaluate(inst: Instruction, ty: Type, source_ty: Type, args: &[u64]) -> Option<u64> {
    let bits = ty.bits();
    let mask = ty.mask();
    let arg = |i: usize| args.get(i).copied().unwrap_or(0);
    let signed = |v: u64| match ty {
        Type::I32 => v as u32 as i32 as i64,
        Type::I64 => v as i64,
    };
    let amount = |v: u64| (v & (bits as u64 - 1)) as u32;

    let value = match inst {
        Instruction::Add => arg(0).wrapping_add(arg(1)),
        Instruction::Subtract => arg(0).wrapping_sub(arg(1)),
        Instruction::Multiply => arg(0).wrapping_mul(arg(1)),
        Instruction::MultiplyHighSigned => {
            ((arg(0) as i64 as i128 * arg(1) as i64 as i128) >> 64) as u64
        }
        Instruction::MultiplyHighUnsigned => ((arg(0) as u128 * arg(1) as u128) >> 64) as u64,
        Instruction::DivideSigned => {
            let (a, b) = (signed(arg(0)), signed(arg(1)));
            if b == 0 {
                0
            } else {
                let min = match ty {
                    Type::I32 => i32::MIN as i64,
                    Type::I64 => i64::MIN,
                };
                if a == min && b == -1 {
                    a as u64
                } else {
                    (a / b) as u64
                }
            }
        }
        Instruction::DivideUnsigned => {
            let (a, b) = (arg(0) & mask, arg(1) & mask);
            if b == 0 {
                0
            } else {
                a / b
            }
        }
        Instruction::And => arg(0) & arg(1),
        Instruction::Or => arg(0) | arg(1),
        Instruction::Xor => arg(0) ^ arg(1),
        Instruction::Not => !arg(0),
        Instruction::Negate => arg(0).wrapping_neg(),
        Instruction::ShiftLeft => arg(0) << amount(arg(1)),
        Instruction::ShiftRightLogical => (arg(0) & mask) >> amount(arg(1)),
        Instruction::ShiftRightArithmetic => (signed(arg(0)) >> amount(arg(1))) as u64,
        Instruction::RotateRight => match ty {
            Type::I32 => (arg(0) as u32).rotate_right(amount(arg(1))) as u64,
            Type::I64 => arg(0).rotate_right(amount(arg(1))),
        },
        Instruction::CountLeadingZeros => match ty {
            Type::I32 => (arg(0) as u32).leading_zeros() as u64,
            Type::I64 => arg(0).leading_zeros() as u64,
        },
        Instruction::ByteSwap => match ty {
            Type::I32 => (arg(0) as u32).swap_bytes() as u64,
            Type::I64 => arg(0).swap_bytes(),
        },
        Instruction::Compare(cond) => cond.evaluate(arg(0), arg(1), source_ty) as u64,
        Instruction::Select => {
            if arg(0) != 0 {
                arg(1)
            } else {
                arg(2)
            }
        }
        Instruction::ZeroExtend8 => arg(0) & 0xff,
        Instruction::ZeroExtend16 => arg(0) & 0xffff,
        Instruction::ZeroExtend32 | Instruction::Truncate => arg(0) & 0xffff_ffff,
        Instruction::SignExtend8 => arg(0) as u8 as i8 as i64 as u64,
        Instruction::SignExtend16 => arg(0) as u16 as i16 as i64 as u64,
        Instruction::SignExtend32 => arg(0) as u32 as i32 as i64 as u64,
        _ => return None,
    };
    Some(value & mask)
}
