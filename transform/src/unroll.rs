//! Full and partial loop unrolling.
//!
//! The body of the loop is replicated after itself in structured order,
//! threading the induction value through each copy: every use of the header
//! phi inside copy `i` is rewritten to the value the back-edge would have
//! produced after `i` iterations. Copy condition blocks collapse to
//! unconditional branches; for a full unroll the original condition and the
//! loop-merge go too and the final latch jumps straight to the merge block.
//!
//! A partial unroll by factor `k` keeps the original exit test at the top of
//! the loop and stitches the `k` copies into one mega-iteration, so it is
//! only legal when the trip count divides by `k + 1`. Uneven factors first
//! split the iteration space: the original loop's bound is clamped to the
//! largest multiple, and a clone of the whole loop runs the remainder,
//! seeded with the first loop's final induction value.

use rustc_hash::FxHashMap;
use spirv::Op;

use spvopt_ir::{
    Analyses, BasicBlock, IRContext, InductionVar, Instruction, InstructionBuilder, IrError, Loop,
    LoopDescriptor, LoopIndex, Operand, Pass, PassStatus, UniqueId, Word,
};

use crate::loop_utils::{clone_blocks, retarget_branch};

/// Fully unrolls every loop whose OpLoopMerge carries the Unroll hint.
#[derive(Default)]
pub struct LoopUnrollerPass;

impl Pass for LoopUnrollerPass {
    fn name(&self) -> &'static str {
        "loop-unroll"
    }

    fn process(&mut self, ctx: &mut IRContext) -> PassStatus {
        let mut modified = false;
        for function in 0..ctx.module().functions().len() {
            loop {
                let descriptor = ctx.build_loop_descriptor(function);
                let candidate = descriptor.iter().find_map(|(index, l)| {
                    let hinted =
                        l.has_unroll_hint(ctx.module(), ctx.module().function(function));
                    (hinted && can_perform_unroll(ctx, function, &descriptor, index))
                        .then_some(index)
                });
                let Some(index) = candidate else { break };
                match fully_unroll(ctx, function, &descriptor, index) {
                    Ok(true) => modified = true,
                    Ok(false) => break,
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

/// Whether `index` satisfies the unrolling preconditions: a structured
/// loop-merge, a recognised induction with a constant trip count, an
/// unconditional latch branching to the header, and no phi in the header
/// other than the induction.
pub fn can_perform_unroll(
    ctx: &mut IRContext,
    function: usize,
    descriptor: &LoopDescriptor,
    index: LoopIndex,
) -> bool {
    Unroller::init(ctx, function, descriptor, index).is_some()
}

/// Replicate the loop body to eliminate the back-edge entirely.
pub fn fully_unroll(
    ctx: &mut IRContext,
    function: usize,
    descriptor: &LoopDescriptor,
    index: LoopIndex,
) -> Result<bool, IrError> {
    // Work from scratch: incremental def-use upkeep is not worth carrying
    // through wholesale body duplication.
    ctx.invalidate(Analyses::DEF_USE | Analyses::INSTR_TO_BLOCK);
    let Some(mut unroller) = Unroller::init(ctx, function, descriptor, index) else {
        return Ok(false);
    };
    unroller.fully_unroll()?;
    ctx.invalidate_all_except(Analyses::LOOP_ANALYSIS);
    Ok(true)
}

/// Unroll by `factor`, duplicating the body `factor` extra times. Factors
/// at least as large as the remaining iterations fall back to a full
/// unroll; factors that do not divide the trip count split the loop first.
pub fn partially_unroll(
    ctx: &mut IRContext,
    function: usize,
    descriptor: &LoopDescriptor,
    index: LoopIndex,
    factor: u64,
) -> Result<bool, IrError> {
    if factor == 0 {
        return Ok(false);
    }
    ctx.invalidate(Analyses::DEF_USE | Analyses::INSTR_TO_BLOCK);
    let Some(mut unroller) = Unroller::init(ctx, function, descriptor, index) else {
        return Ok(false);
    };
    if factor >= unroller.iterations - 1 {
        unroller.fully_unroll()?;
    } else if unroller.iterations % (factor + 1) != 0 {
        if !unroller.partially_unroll_uneven(factor)? {
            return Ok(false);
        }
    } else {
        unroller.partially_unroll_even(factor)?;
    }
    ctx.invalidate_all_except(Analyses::LOOP_ANALYSIS);
    Ok(true)
}

/// Book-keeping carried between body copies.
#[derive(Default)]
struct UnrollState {
    previous_latch: Word,
    /// The id holding the induction value entering the next copy.
    previous_backedge_value: Word,
    new_header: Word,
    new_latch: Word,
    new_condition: Word,
    /// Old result id to this copy's result id.
    new_inst: FxHashMap<Word, Word>,
}

struct Unroller<'c> {
    ctx: &'c mut IRContext,
    function: usize,
    l: Loop,
    blocks_in_order: Vec<Word>,
    condition_block: Word,
    induction: InductionVar,
    iterations: u64,
    /// The value id the original phi receives along the back-edge.
    backedge_value: Word,
    state: UnrollState,
    /// Condition blocks of the copies made so far, to be folded.
    copy_conditions: Vec<Word>,
    /// Where copied blocks are inserted (the merge block, or the split
    /// point for the uneven case).
    insert_point: Word,
}

impl<'c> Unroller<'c> {
    fn init(
        ctx: &'c mut IRContext,
        function: usize,
        descriptor: &LoopDescriptor,
        index: LoopIndex,
    ) -> Option<Self> {
        let l = descriptor.get(index).clone();
        let module = ctx.module();
        let f = module.function(function);

        // The loop must carry a structured merge.
        let header = f.block(l.header())?;
        header.loop_merge_inst(module)?;

        let cfg = ctx.get_cfg(function);
        let def_use_owned = spvopt_ir::DefUseManager::new(ctx.module());
        let module = ctx.module();
        let f = module.function(function);
        let condition_block = l.find_condition_block(module, f, &cfg)?;
        let induction = l.find_induction_variable(module, f, &cfg, &def_use_owned)?;
        let iterations =
            l.find_number_of_iterations(module, f, &cfg, &def_use_owned, &induction)?;
        if iterations == 0 {
            return None;
        }

        // The latch must be an unconditional branch to the header.
        let latch = f.block(l.latch())?;
        let latch_term = latch.terminator(module)?;
        if latch_term.opcode() != Op::Branch
            || latch_term.single_word_operand(0) != l.header()
        {
            return None;
        }

        // The induction must be the only phi in the header.
        let header = f.block(l.header())?;
        let phis = header.phis(module);
        if phis.len() != 1 || phis[0] != induction.phi {
            return None;
        }

        let backedge_value = module
            .inst(induction.phi)
            .phi_incoming()
            .find(|(_, pred)| *pred == l.latch())
            .map(|(value, _)| value)?;

        let blocks_in_order = l.blocks().to_vec();
        let insert_point = l.merge();
        Some(Self {
            ctx,
            function,
            l,
            blocks_in_order,
            condition_block,
            induction,
            iterations,
            backedge_value,
            state: UnrollState::default(),
            copy_conditions: Vec::new(),
            insert_point,
        })
    }

    fn fully_unroll(&mut self) -> Result<(), IrError> {
        let copies = self.iterations - 1;
        self.unroll_copies(copies)?;

        // Every exit test goes: the copies' and the original's.
        let conditions = std::mem::take(&mut self.copy_conditions);
        for condition in conditions {
            self.fold_condition_block(condition)?;
        }
        self.fold_condition_block(self.condition_block)?;

        // Tear the loop structure down: no merge declaration, and the final
        // latch falls through to the merge block.
        let merge_inst = {
            let module = self.ctx.module();
            module
                .function(self.function)
                .block(self.l.header())
                .and_then(|bb| bb.merge_inst_uid(module))
        };
        if let Some(merge_inst) = merge_inst {
            self.ctx.kill_inst(merge_inst);
        }
        let final_latch = if copies == 0 {
            self.l.latch()
        } else {
            self.state.previous_latch
        };
        retarget_branch(
            self.ctx,
            self.function,
            final_latch,
            self.l.header(),
            self.l.merge(),
        );

        // The induction phi collapses to its initial value.
        let phi_id = self.ctx.module().inst(self.induction.phi).result_id();
        self.ctx.replace_all_uses_with(phi_id, self.induction.init_id);
        self.ctx.kill_inst(self.induction.phi);
        Ok(())
    }

    fn partially_unroll_even(&mut self, factor: u64) -> Result<(), IrError> {
        debug_assert_eq!(self.iterations % (factor + 1), 0);
        self.unroll_copies(factor)?;

        // Copies lose their exit tests; the original test at the top of the
        // loop now fires once per mega-iteration.
        let conditions = std::mem::take(&mut self.copy_conditions);
        for condition in conditions {
            self.fold_condition_block(condition)?;
        }

        // The back-edge now comes from the last copy.
        let last_latch = self.state.previous_latch;
        let last_value = self.state.previous_backedge_value;
        let latch_id = self.l.latch();
        let phi = self.ctx.module_mut().inst_mut(self.induction.phi);
        let incoming: Vec<(Word, Word)> = phi.phi_incoming().collect();
        for (index, (_, pred)) in incoming.iter().enumerate() {
            if *pred == latch_id {
                phi.set_operand(index * 2, Operand::IdRef(last_value));
                phi.set_operand(index * 2 + 1, Operand::IdRef(last_latch));
            }
        }
        Ok(())
    }

    /// `trip_count mod (factor + 1) != 0`: run the largest even multiple in
    /// the (unrolled) original loop and the remainder in a clone placed
    /// after it.
    fn partially_unroll_uneven(&mut self, factor: u64) -> Result<bool, IrError> {
        // The bound rewrite below assumes a strict comparison with the phi
        // on one side.
        let condition = self.ctx.module().inst(self.induction.condition);
        if !matches!(
            condition.opcode(),
            Op::ULessThan | Op::SLessThan | Op::UGreaterThan | Op::SGreaterThan
        ) {
            return Ok(false);
        }
        let phi_id = self.ctx.module().inst(self.induction.phi).result_id();
        let bound_operand_index = if condition.single_word_operand(0) == phi_id {
            1
        } else if condition.single_word_operand(1) == phi_id {
            0
        } else {
            return Ok(false);
        };
        let Some(init) = self.induction.init_value else {
            return Ok(false);
        };

        let remainder = self.iterations % (factor + 1);
        let main_trips = self.iterations - remainder;
        let split_value = init + main_trips as i64 * self.induction.step;

        // A block separating the two loops, branching into the remainder
        // loop.
        let merge = self.l.merge();
        let first_merge = spvopt_ir::create_block(self.ctx, self.function, Some(merge))?;

        // Clone the whole loop, phi and merge declaration included.
        let body: Vec<Word> = self.blocks_in_order.clone();
        let clone = clone_blocks(self.ctx, self.function, &body, merge)?;
        let clone_header = clone.old_to_new_block[&self.l.header()];
        InstructionBuilder::new(self.ctx, self.function, first_merge).add_branch(clone_header);

        // Seed the remainder loop: its induction starts at the split value
        // and flows in from the first loop's merge block.
        let phi_type = self.ctx.module().inst(self.induction.phi).type_id();
        let split_const = self.get_or_add_constant(phi_type, split_value)?;
        let clone_phi = clone.uid_map[&self.induction.phi];
        let pre_header = self
            .l
            .pre_header()
            .ok_or(IrError::Corrupt("unrolled loop has no pre-header"))?;
        let init_id = self.induction.init_id;
        let phi = self.ctx.module_mut().inst_mut(clone_phi);
        phi.map_ids(|id| {
            if id == pre_header {
                first_merge
            } else if id == init_id {
                split_const
            } else {
                id
            }
        });

        // Clamp the first loop to the even multiple.
        let clamp_const = self.get_or_add_constant(phi_type, split_value)?;
        self.ctx
            .module_mut()
            .inst_mut(self.induction.condition)
            .set_operand(bound_operand_index, Operand::IdRef(clamp_const));

        // The first loop now exits into the split block.
        retarget_branch(
            self.ctx,
            self.function,
            self.condition_block,
            merge,
            first_merge,
        );
        let header_merge_inst = {
            let module = self.ctx.module();
            module
                .function(self.function)
                .block(self.l.header())
                .and_then(|bb| bb.merge_inst_uid(module))
        };
        if let Some(uid) = header_merge_inst {
            self.ctx
                .module_mut()
                .inst_mut(uid)
                .map_ids(|id| if id == merge { first_merge } else { id });
        }
        self.l.set_merge(first_merge);

        // Unroll the first loop; its copies now slot in before the split
        // block, and its iteration count is the clamped even multiple.
        self.insert_point = first_merge;
        self.iterations = main_trips;
        self.partially_unroll_even(factor)?;
        Ok(true)
    }

    /// Make `factor` copies of the loop body, chaining each onto the last.
    fn unroll_copies(&mut self, factor: u64) -> Result<(), IrError> {
        self.state = UnrollState {
            previous_latch: self.l.latch(),
            previous_backedge_value: self.backedge_value,
            ..UnrollState::default()
        };
        for _ in 0..factor {
            self.copy_body()?;
        }
        Ok(())
    }

    fn copy_body(&mut self) -> Result<(), IrError> {
        self.state.new_inst.clear();
        let mut copied: Vec<BasicBlock> = Vec::with_capacity(self.blocks_in_order.len());

        for block in self.blocks_in_order.clone() {
            copied.push(self.copy_basic_block(block)?);
        }

        // The previous back-edge now continues into this copy, and this
        // copy's latch carries the back-edge to the real header.
        retarget_branch(
            self.ctx,
            self.function,
            self.state.previous_latch,
            self.l.header(),
            self.state.new_header,
        );

        // Uses of the induction phi inside this copy see the value the
        // previous back-edge produced.
        let phi_id = self.ctx.module().inst(self.induction.phi).result_id();
        self.state
            .new_inst
            .insert(phi_id, self.state.previous_backedge_value);
        // The back-edge to the original header must survive remapping.
        self.state.new_inst.insert(self.l.header(), self.l.header());

        for block in &copied {
            for uid in block.instructions() {
                let map = &self.state.new_inst;
                self.ctx
                    .module_mut()
                    .inst_mut(*uid)
                    .map_ids(|id| map.get(&id).copied().unwrap_or(id));
            }
        }

        let insert_point = self.insert_point;
        self.ctx
            .module_mut()
            .function_mut(self.function)
            .insert_blocks_before(insert_point, copied);

        // Swap the copy in as the new "previous" iteration.
        self.copy_conditions.push(self.state.new_condition);
        self.state.previous_latch = self.state.new_latch;
        self.state.previous_backedge_value = self
            .state
            .new_inst
            .get(&self.backedge_value)
            .copied()
            .unwrap_or(self.backedge_value);
        Ok(())
    }

    fn copy_basic_block(&mut self, block: Word) -> Result<BasicBlock, IrError> {
        let is_header = block == self.l.header();
        let old_insts: Vec<UniqueId> = {
            let module = self.ctx.module();
            module
                .function(self.function)
                .block(block)
                .ok_or(IrError::Corrupt("loop block vanished during unroll"))?
                .instructions()
                .to_vec()
        };

        let label_id = self.ctx.take_next_id().ok_or(IrError::IdOverflow)?;
        let label = self
            .ctx
            .alloc_inst(Instruction::new(Op::Label, 0, label_id, []));
        let mut new_block = BasicBlock::new(label, label_id);
        if !is_header {
            self.state.new_inst.insert(block, label_id);
        }

        for old_uid in old_insts {
            let (opcode, old_result) = {
                let inst = self.ctx.module().inst(old_uid);
                (inst.opcode(), inst.result_id())
            };
            // The copies are straight-line body: no loop declaration, and
            // the induction phi is substituted, not re-created.
            if is_header && (opcode == Op::LoopMerge || opcode == Op::Phi) {
                continue;
            }
            let new_uid = self.ctx.module_mut().clone_inst(old_uid);
            if old_result != 0 {
                let new_result = self.ctx.take_next_id().ok_or(IrError::IdOverflow)?;
                self.ctx
                    .module_mut()
                    .inst_mut(new_uid)
                    .set_result_id(new_result);
                self.state.new_inst.insert(old_result, new_result);
            }
            new_block.push(new_uid);
        }

        if is_header {
            self.state.new_header = label_id;
        }
        if block == self.l.latch() {
            self.state.new_latch = label_id;
            // The loop's continue target follows the newest copy.
            let merge_inst = {
                let module = self.ctx.module();
                module
                    .function(self.function)
                    .block(self.l.header())
                    .and_then(|bb| bb.merge_inst_uid(module))
            };
            if let Some(uid) = merge_inst {
                let latch = self.l.latch();
                let previous_latch = self.state.previous_latch;
                self.ctx.module_mut().inst_mut(uid).map_ids(|id| {
                    if id == latch || id == previous_latch {
                        label_id
                    } else {
                        id
                    }
                });
            }
        }
        if block == self.condition_block {
            self.state.new_condition = label_id;
        }
        Ok(new_block)
    }

    /// Replace the conditional exit in `block` with an unconditional branch
    /// to its in-loop target.
    fn fold_condition_block(&mut self, block: Word) -> Result<(), IrError> {
        let (term, keep_target) = {
            let module = self.ctx.module();
            let bb = module
                .function(self.function)
                .block(block)
                .ok_or(IrError::Corrupt("condition block vanished during unroll"))?;
            let term = bb
                .terminator_uid(module)
                .ok_or(IrError::Corrupt("condition block has no terminator"))?;
            let inst = module.inst(term);
            if inst.opcode() != Op::BranchConditional {
                return Ok(());
            }
            let t = inst.single_word_operand(1);
            let f = inst.single_word_operand(2);
            // Continue into the loop: take whichever target is not an exit.
            let keep = if t == self.l.merge() || t == self.insert_point {
                f
            } else {
                t
            };
            (term, keep)
        };
        self.ctx.kill_inst(term);
        InstructionBuilder::new(self.ctx, self.function, block).add_branch(keep_target);
        Ok(())
    }

    fn get_or_add_constant(&mut self, type_id: Word, value: i64) -> Result<Word, IrError> {
        let mut builder = InstructionBuilder::new(self.ctx, self.function, 0);
        builder.get_or_add_int_constant(type_id, value as u32 as u64)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use spvopt_ir::test_util::FunctionBuilderHarness;

    use super::*;

    fn opcode_census(ctx: &IRContext) -> FxHashMap<Op, usize> {
        let module = ctx.module();
        let mut census = FxHashMap::default();
        for function in module.functions() {
            for block in function.blocks() {
                for uid in block.instructions() {
                    *census.entry(module.inst(*uid).opcode()).or_insert(0) += 1;
                }
            }
        }
        census
    }

    fn back_edge_count(ctx: &mut IRContext) -> usize {
        let cfg = ctx.get_cfg(0);
        let dom = ctx.get_dominator_analysis(0);
        let module = ctx.module();
        let mut count = 0;
        for block in module.function(0).blocks() {
            for succ in cfg.succs(block.id()) {
                if dom.dominates(*succ, block.id()) {
                    count += 1;
                }
            }
        }
        count
    }

    /// Full unroll of a ten-trip loop storing into `array[i]`
    /// leaves ten stores, no loop-merge, and no phi feeding the induction.
    #[test]
    fn full_unroll_of_ten_trip_loop() {
        let mut h = FunctionBuilderHarness::new();
        let array = h.workgroup_array_var(16);
        h.counted_loop_with_body(0, 10, 1, |h, cl| {
            let one = h.i32_constant(1);
            let ptr = h.access_chain_i32(cl.body, array, &[cl.phi]);
            h.store(cl.body, ptr, one);
        });
        let mut ctx = h.finish_ctx();
        assert_eq!(back_edge_count(&mut ctx), 1);

        let descriptor = ctx.build_loop_descriptor(0);
        assert!(can_perform_unroll(&mut ctx, 0, &descriptor, 0));
        assert!(fully_unroll(&mut ctx, 0, &descriptor, 0).unwrap());
        spvopt_ir::verify::verify_module(ctx.module()).unwrap();

        let census = opcode_census(&ctx);
        assert_eq!(census.get(&Op::Store).copied().unwrap_or(0), 10);
        assert_eq!(census.get(&Op::AccessChain).copied().unwrap_or(0), 10);
        assert_eq!(census.get(&Op::LoopMerge).copied().unwrap_or(0), 0);
        assert_eq!(census.get(&Op::Phi).copied().unwrap_or(0), 0);
        assert_eq!(census.get(&Op::BranchConditional).copied().unwrap_or(0), 0);

        // No back-edges remain.
        assert_eq!(back_edge_count(&mut ctx), 0);
    }

    /// Partial unroll by an even factor keeps one loop with the body
    /// repeated `factor + 1` times per iteration.
    #[test]
    fn partial_unroll_even_factor() {
        let mut h = FunctionBuilderHarness::new();
        let array = h.workgroup_array_var(16);
        let cl = h.counted_loop_with_body(0, 10, 1, |h, cl| {
            let one = h.i32_constant(1);
            let ptr = h.access_chain_i32(cl.body, array, &[cl.phi]);
            h.store(cl.body, ptr, one);
        });
        let mut ctx = h.finish_ctx();

        let descriptor = ctx.build_loop_descriptor(0);
        // 10 % (1 + 1) == 0: an even partial unroll.
        assert!(partially_unroll(&mut ctx, 0, &descriptor, 0, 1).unwrap());
        spvopt_ir::verify::verify_module(ctx.module()).unwrap();

        let census = opcode_census(&ctx);
        assert_eq!(census.get(&Op::Store).copied().unwrap_or(0), 2);
        assert_eq!(census.get(&Op::LoopMerge).copied().unwrap_or(0), 1);
        // One exit test survives, at the top of the loop.
        assert_eq!(census.get(&Op::BranchConditional).copied().unwrap_or(0), 1);
        assert_eq!(back_edge_count(&mut ctx), 1);

        // The loop is still recognisable and the back-edge comes from the
        // copy's latch.
        let descriptor = ctx.build_loop_descriptor(0);
        assert_eq!(descriptor.num_loops(), 1);
        let l = descriptor.get(0);
        assert_eq!(l.header(), cl.header);
        assert_ne!(l.latch(), cl.latch);
    }

    /// Uneven factors split the iteration space into an unrolled loop and a
    /// remainder loop.
    #[test]
    fn partial_unroll_uneven_factor_splits_loop() {
        let mut h = FunctionBuilderHarness::new();
        let array = h.workgroup_array_var(16);
        h.counted_loop_with_body(0, 10, 1, |h, cl| {
            let one = h.i32_constant(1);
            let ptr = h.access_chain_i32(cl.body, array, &[cl.phi]);
            h.store(cl.body, ptr, one);
        });
        let mut ctx = h.finish_ctx();

        let descriptor = ctx.build_loop_descriptor(0);
        // 10 % (2 + 1) == 1: the uneven path.
        assert!(partially_unroll(&mut ctx, 0, &descriptor, 0, 2).unwrap());
        spvopt_ir::verify::verify_module(ctx.module()).unwrap();

        let descriptor = ctx.build_loop_descriptor(0);
        assert_eq!(descriptor.num_loops(), 2);

        // First loop: three stores per iteration; remainder loop: one.
        let census = opcode_census(&ctx);
        assert_eq!(census.get(&Op::Store).copied().unwrap_or(0), 4);
        assert_eq!(census.get(&Op::LoopMerge).copied().unwrap_or(0), 2);
        assert_eq!(back_edge_count(&mut ctx), 2);
    }
}
