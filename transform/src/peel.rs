//! Loop peeling: moving the first or last `n` iterations of a loop into a
//! dedicated copy running before the main loop.
//!
//! Peeling clones the loop ahead of itself (the same attachment fission
//! uses), adds a fresh bounded counter to the clone, and rewrites the
//! clone's exit branch to test that counter. The main loop's header phis
//! are already seeded from the clone's final values by the attachment, so
//! it simply continues where the peel left off.
//!
//! The standalone pass consults scalar evolution to find conditions inside
//! a loop that hold only for the first or last `n` iterations, and peels
//! those iterations off so each loop sees a constant condition.

use spirv::Op;

use spvopt_analysis::{SENode, ScalarEvolutionAnalysis};
use spvopt_ir::{
    Analyses, DefUseManager, IRContext, Instruction, InstructionBuilder, IrError,
    LoopDescriptor, LoopIndex, Operand, Pass, PassStatus,
};

use crate::loop_utils::{
    clone_and_attach_loop_to_header, get_or_create_pre_header, make_loop_closed_ssa,
};

/// Upper bound on `peel factor * loop size` for the guided pass, to keep
/// code growth in check.
const CODE_GROW_THRESHOLD: usize = 1000;

/// Which end of the iteration space a peel removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeelDirection {
    /// The first `n` iterations.
    Before,
    /// The last `n` iterations.
    After,
}

/// Whether the loop is in a shape the peeler can handle: a structured merge
/// reached from exactly one in-loop predecessor.
pub fn can_peel_loop(
    ctx: &mut IRContext,
    function: usize,
    descriptor: &LoopDescriptor,
    index: LoopIndex,
) -> bool {
    let l = descriptor.get(index);
    let cfg = ctx.get_cfg(function);
    let in_loop_preds = cfg
        .preds(l.merge())
        .iter()
        .filter(|pred| l.is_inside(**pred))
        .count();
    in_loop_preds == 1
}

/// Peel the first `factor` iterations into a dedicated loop placed before
/// the main loop.
pub fn peel_before(
    ctx: &mut IRContext,
    function: usize,
    descriptor: &LoopDescriptor,
    index: LoopIndex,
    factor: u32,
) -> Result<bool, IrError> {
    peel(ctx, function, descriptor, index, factor, None)
}

/// Peel the last `factor` of `total_iterations` iterations: the dedicated
/// loop runs the first `total_iterations - factor`, and the original loop
/// finishes the remainder under its own exit condition.
pub fn peel_after(
    ctx: &mut IRContext,
    function: usize,
    descriptor: &LoopDescriptor,
    index: LoopIndex,
    factor: u32,
    total_iterations: u64,
) -> Result<bool, IrError> {
    if u64::from(factor) >= total_iterations {
        return Ok(false);
    }
    let bound = (total_iterations - u64::from(factor)) as u32;
    peel(ctx, function, descriptor, index, factor, Some(bound))
}

/// Shared peel machinery. `before_bound` of `None` peels `factor` first
/// iterations; `Some(n)` runs `n` iterations in the peeled loop instead.
fn peel(
    ctx: &mut IRContext,
    function: usize,
    descriptor: &LoopDescriptor,
    index: LoopIndex,
    factor: u32,
    before_bound: Option<u32>,
) -> Result<bool, IrError> {
    if factor == 0 {
        return Ok(false);
    }
    if !can_peel_loop(ctx, function, descriptor, index) {
        return Ok(false);
    }

    let mut l = descriptor.get(index).clone();
    get_or_create_pre_header(ctx, function, &mut l)?;
    make_loop_closed_ssa(ctx, function, &l)?;

    // The peeled copy runs first.
    let clone = clone_and_attach_loop_to_header(ctx, function, &mut l)?;
    let peeled_header = clone.old_to_new_block[&l.header()];
    let peeled_latch = clone.old_to_new_block[&l.latch()];

    // A dedicated counter in the peeled loop: j = 0, ++j each iteration.
    let counter_type = InstructionBuilder::new(ctx, function, 0).get_or_add_int_type(32, false)?;
    let zero = InstructionBuilder::new(ctx, function, 0).get_or_add_int_constant(counter_type, 0)?;
    let one = InstructionBuilder::new(ctx, function, 0).get_or_add_int_constant(counter_type, 1)?;
    let cap = InstructionBuilder::new(ctx, function, 0)
        .get_or_add_int_constant(counter_type, u64::from(before_bound.unwrap_or(factor)))?;

    let peeled_pre_header = {
        // The clone's entry edge comes from the original pre-header.
        let cfg = ctx.get_cfg(function);
        cfg.preds(peeled_header)
            .iter()
            .copied()
            .find(|pred| *pred != peeled_latch)
            .ok_or(IrError::Corrupt("peeled loop has no entry edge"))?
    };

    let counter_next = ctx.take_next_id().ok_or(IrError::IdOverflow)?;
    let counter_phi_id = ctx.take_next_id().ok_or(IrError::IdOverflow)?;
    let counter_phi = ctx.alloc_inst(Instruction::new(
        Op::Phi,
        counter_type,
        counter_phi_id,
        [
            Operand::IdRef(zero),
            Operand::IdRef(peeled_pre_header),
            Operand::IdRef(counter_next),
            Operand::IdRef(peeled_latch),
        ],
    ));
    if let Some(bb) = ctx
        .module_mut()
        .function_mut(function)
        .block_mut(peeled_header)
    {
        bb.insert_at(0, counter_phi);
    }
    let step = ctx.alloc_inst(Instruction::new(
        Op::IAdd,
        counter_type,
        counter_next,
        [Operand::IdRef(counter_phi_id), Operand::IdRef(one)],
    ));
    {
        let insert = {
            let module = ctx.module();
            module
                .function(function)
                .block(peeled_latch)
                .and_then(|bb| bb.terminator_uid(module))
        };
        let bb = ctx
            .module_mut()
            .function_mut(function)
            .block_mut(peeled_latch)
            .ok_or(IrError::Corrupt("peeled latch vanished"))?;
        match insert {
            Some(term) => bb.insert_before(term, step),
            None => bb.push(step),
        }
    }

    // Rewrite the peeled loop's exit test: continue while j < cap. The
    // clone of the original condition block carries the exit branch.
    let peeled_condition = {
        let module = ctx.module();
        let f = module.function(function);
        let cfg = spvopt_ir::ControlFlowGraph::new(module, f);
        descriptor
            .get(index)
            .find_condition_block(module, f, &cfg)
            .and_then(|block| clone.old_to_new_block.get(&block).copied())
    }
    .ok_or(IrError::Corrupt("peeled loop has no condition block"))?;

    let bool_type = InstructionBuilder::new(ctx, function, 0).get_or_add_bool_type()?;
    let compare_id = ctx.take_next_id().ok_or(IrError::IdOverflow)?;
    let compare = ctx.alloc_inst(Instruction::new(
        Op::ULessThan,
        bool_type,
        compare_id,
        [Operand::IdRef(counter_phi_id), Operand::IdRef(cap)],
    ));
    let term = {
        let module = ctx.module();
        module
            .function(function)
            .block(peeled_condition)
            .and_then(|bb| bb.terminator_uid(module))
            .ok_or(IrError::Corrupt("peeled condition block has no terminator"))?
    };
    {
        let bb = ctx
            .module_mut()
            .function_mut(function)
            .block_mut(peeled_condition)
            .unwrap();
        bb.insert_before(term, compare);
    }
    ctx.module_mut()
        .inst_mut(term)
        .set_operand(0, Operand::IdRef(compare_id));

    ctx.invalidate_all_except(Analyses::LOOP_ANALYSIS);
    Ok(true)
}

/// Peels loops whose bodies test conditions that are constant except for
/// the first or last few iterations.
#[derive(Default)]
pub struct LoopPeelingPass;

impl Pass for LoopPeelingPass {
    fn name(&self) -> &'static str {
        "loop-peeling"
    }

    fn process(&mut self, ctx: &mut IRContext) -> PassStatus {
        let mut modified = false;
        for function in 0..ctx.module().functions().len() {
            let descriptor = ctx.build_loop_descriptor(function);
            let candidates: Vec<(LoopIndex, PeelDirection, u32, u64)> = (0..descriptor
                .num_loops())
                .filter_map(|index| {
                    find_peeling_opportunity(ctx, function, &descriptor, index)
                        .map(|(direction, factor, trips)| (index, direction, factor, trips))
                })
                .collect();
            // Re-derive the descriptor after each peel; indices go stale.
            for (index, direction, factor, trips) in candidates.into_iter().take(1) {
                let descriptor = ctx.build_loop_descriptor(function);
                if index >= descriptor.num_loops() {
                    continue;
                }
                let peeled = match direction {
                    PeelDirection::Before => {
                        peel_before(ctx, function, &descriptor, index, factor)
                    }
                    PeelDirection::After => {
                        peel_after(ctx, function, &descriptor, index, factor, trips)
                    }
                };
                match peeled {
                    Ok(true) => modified = true,
                    Ok(false) => {}
                    Err(_) => return PassStatus::Failure,
                }
            }
        }
        if modified {
            PassStatus::SuccessWithChange
        } else {
            PassStatus::SuccessWithoutChange
        }
    }
}

/// Look for a conditional branch in the loop body whose comparison of an
/// induction-derived value against a constant flips exactly once across the
/// iteration space.
fn find_peeling_opportunity(
    ctx: &mut IRContext,
    function: usize,
    descriptor: &LoopDescriptor,
    index: LoopIndex,
) -> Option<(PeelDirection, u32, u64)> {
    let l = descriptor.get(index);
    let block_of = ctx.instr_to_block_map();
    let module = ctx.module();
    let f = module.function(function);
    let cfg = spvopt_ir::ControlFlowGraph::new(module, f);
    let def_use = DefUseManager::new(module);

    let induction = l.find_induction_variable(module, f, &cfg, &def_use)?;
    let trips = l.find_number_of_iterations(module, f, &cfg, &def_use, &induction)?;
    if trips < 2 {
        return None;
    }
    let condition_block = induction.condition_block;
    let loop_size: usize = l
        .blocks()
        .iter()
        .filter_map(|block| f.block(*block))
        .map(|bb| bb.instructions().len())
        .sum();

    let mut scev = ScalarEvolutionAnalysis::new(module, f, &def_use, descriptor, &block_of);

    for block in l.blocks() {
        if *block == condition_block {
            continue;
        }
        let bb = f.block(*block)?;
        let term = bb.terminator(module)?;
        if term.opcode() != Op::BranchConditional {
            continue;
        }
        let compare = def_use.get_def(term.single_word_operand(0))?;
        let compare_inst = module.inst(compare);
        if !compare_inst.is_int_compare() && compare_inst.opcode() != Op::IEqual {
            continue;
        }

        let lhs = scev.analyze_id(compare_inst.single_word_operand(0));
        let lhs = scev.simplify_expression(lhs);
        let rhs = scev.analyze_id(compare_inst.single_word_operand(1));
        let rhs = scev.simplify_expression(rhs);

        // Normalise to `Rec(c, a) OP k`.
        let (rec, constant) = match (scev.node(lhs).clone(), scev.node(rhs).clone()) {
            (SENode::Recurrent { .. }, SENode::Constant(k)) => (lhs, k),
            (SENode::Constant(k), SENode::Recurrent { .. }) => (rhs, k),
            _ => continue,
        };
        let SENode::Recurrent {
            offset,
            coefficient,
            ..
        } = scev.node(rec).clone()
        else {
            continue;
        };
        let (Some(c), Some(a)) = (scev.constant_of(offset), scev.constant_of(coefficient)) else {
            continue;
        };
        if a == 0 {
            continue;
        }

        let opportunity = match compare_inst.opcode() {
            Op::IEqual => {
                // True on exactly one iteration.
                let delta = constant - c;
                if delta % a != 0 {
                    continue;
                }
                let hit = delta / a;
                if hit == 0 {
                    Some((PeelDirection::Before, 1u32))
                } else if hit == trips as i64 - 1 {
                    Some((PeelDirection::After, 1u32))
                } else {
                    None
                }
            }
            Op::SLessThan | Op::ULessThan | Op::SGreaterThan | Op::UGreaterThan => {
                // `c + a*i OP k` changes truth value once, at the crossing
                // point; which side starts true does not matter for the
                // peel, only where the flip lands.
                let crossing = div_ceil(constant - c, a);
                if crossing <= 0 || crossing >= trips as i64 {
                    None
                } else if crossing <= (trips as i64) / 2 {
                    Some((PeelDirection::Before, crossing as u32))
                } else {
                    Some((PeelDirection::After, (trips as i64 - crossing) as u32))
                }
            }
            _ => None,
        };

        if let Some((direction, factor)) = opportunity {
            if factor as usize * loop_size <= CODE_GROW_THRESHOLD {
                log::debug!(
                    "peeling opportunity at loop {}: {:?} by {}",
                    l.header(),
                    direction,
                    factor
                );
                return Some((direction, factor, trips));
            }
        }
    }
    None
}

fn div_ceil(a: i64, b: i64) -> i64 {
    let d = a / b;
    if a % b != 0 && (a < 0) == (b < 0) {
        d + 1
    } else {
        d
    }
}
