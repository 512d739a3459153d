//! Loop fission: splitting a loop body into two loops over the same
//! iteration space, each executing an independent subset of the work.
//!
//! Instructions are grouped into related sets by walking def-use chains
//! (stopping at phis to avoid induction cycles); the cone feeding the loop
//! and branch conditions is shared and never split out. A split is legal
//! when no store of one group and load of the other carry a dependence that
//! the new execution order would violate. The loop is then cloned in front
//! of itself and each copy keeps one group, the other's instructions being
//! killed.

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};
use spirv::Op;

use spvopt_analysis::{DistanceVector, LoopDependenceAnalysis, RegisterLiveness};
use spvopt_ir::{
    Analyses, DefUseManager, IRContext, IrError, LoopDescriptor, LoopIndex, Pass, PassStatus,
    UniqueId, Word,
};

use crate::loop_utils::{clone_and_attach_loop_to_header, get_or_create_pre_header};

/// Splits innermost loops, optionally only when their register pressure
/// exceeds a threshold, and optionally re-splitting the results until the
/// criterion is satisfied.
pub struct LoopFissionPass {
    register_threshold: Option<usize>,
    split_multiple_times: bool,
}

impl Default for LoopFissionPass {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopFissionPass {
    /// Split every splittable innermost loop once.
    pub fn new() -> Self {
        Self {
            register_threshold: None,
            split_multiple_times: false,
        }
    }

    /// Split loops whose peak register pressure exceeds `threshold`,
    /// repeatedly while the resulting loops still exceed it.
    pub fn with_register_threshold(threshold: usize) -> Self {
        Self {
            register_threshold: Some(threshold),
            split_multiple_times: true,
        }
    }

    fn should_split(&self, ctx: &mut IRContext, function: usize, header: Word) -> bool {
        let Some(threshold) = self.register_threshold else {
            return true;
        };
        let cfg = ctx.get_cfg(function);
        let dom = ctx.get_dominator_analysis(function);
        let descriptor = ctx.build_loop_descriptor(function);
        let Some(index) = descriptor
            .iter()
            .find(|(_, l)| l.header() == header)
            .map(|(index, _)| index)
        else {
            return false;
        };
        let module = ctx.module();
        let f = module.function(function);
        let def_use = DefUseManager::new(module);
        let liveness = RegisterLiveness::new(module, f, &cfg, &dom, &descriptor, &def_use);
        let pressure = liveness.compute_loop_register_pressure(descriptor.get(index), &cfg);
        pressure.used_registers > threshold
    }
}

impl Pass for LoopFissionPass {
    fn name(&self) -> &'static str {
        "loop-fission"
    }

    fn process(&mut self, ctx: &mut IRContext) -> PassStatus {
        let mut modified = false;
        for function in 0..ctx.module().functions().len() {
            // Work over header ids: splitting invalidates loop indices but
            // headers survive.
            let mut worklist: VecDeque<Word> = {
                let descriptor = ctx.build_loop_descriptor(function);
                descriptor
                    .iter()
                    .filter(|(_, l)| l.is_innermost())
                    .map(|(_, l)| l.header())
                    .collect()
            };

            while let Some(header) = worklist.pop_front() {
                if !self.should_split(ctx, function, header) {
                    continue;
                }
                let descriptor = ctx.build_loop_descriptor(function);
                let Some(index) = descriptor
                    .iter()
                    .find(|(_, l)| l.header() == header)
                    .map(|(index, _)| index)
                else {
                    continue;
                };
                match split_loop(ctx, function, &descriptor, index) {
                    Ok(Some(new_header)) => {
                        modified = true;
                        ctx.invalidate_all_except(Analyses::LOOP_ANALYSIS);
                        if self.split_multiple_times {
                            worklist.push_back(new_header);
                            worklist.push_back(header);
                        }
                    }
                    Ok(None) => {}
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

/// Attempt to split the loop at `index` into two. On success, returns the
/// header of the newly created first loop.
pub fn split_loop(
    ctx: &mut IRContext,
    function: usize,
    descriptor: &LoopDescriptor,
    index: LoopIndex,
) -> Result<Option<Word>, IrError> {
    let mut grouping = Grouping::default();
    if !grouping.build_related_sets(ctx, function, descriptor, index) {
        return Ok(None);
    }
    if !grouping.can_perform_split(ctx, function, descriptor, index) {
        log::debug!(
            "fission rejected for loop at block {}",
            descriptor.get(index).header()
        );
        return Ok(None);
    }

    // Clone the loop ahead of itself; the clone keeps the first group.
    let mut l = descriptor.get(index).clone();
    get_or_create_pre_header(ctx, function, &mut l)?;
    let clone = clone_and_attach_loop_to_header(ctx, function, &mut l)?;
    let new_header = clone.old_to_new_block[&l.header()];
    // The def-use relation must see the cloned instructions before uses of
    // the killed phis are rewritten onto their clones.
    ctx.invalidate_all_except(Analyses::LOOP_ANALYSIS);

    let mut kills: Vec<UniqueId> = Vec::new();
    let mut replacements: Vec<(Word, Word)> = Vec::new();
    for inst in &grouping.first {
        if !grouping.second.contains(inst) {
            // The instruction lives on only in the clone.
            kills.push(*inst);
            let instruction = ctx.module().inst(*inst);
            if instruction.is_phi() {
                let old_id = instruction.result_id();
                if let Some(new_id) = clone.value_map.get(&old_id) {
                    replacements.push((old_id, *new_id));
                }
            }
        }
    }
    for inst in &grouping.second {
        if !grouping.first.contains(inst) {
            if let Some(cloned) = clone.uid_map.get(inst) {
                kills.push(*cloned);
            }
        }
    }

    for (old_id, new_id) in replacements {
        ctx.replace_all_uses_with(old_id, new_id);
    }
    for inst in kills {
        ctx.kill_inst(inst);
    }

    log::debug!(
        "fission split loop at block {}; first loop now at block {new_header}",
        l.header()
    );
    Ok(Some(new_header))
}

#[derive(Default)]
struct Grouping {
    first: FxHashSet<UniqueId>,
    second: FxHashSet<UniqueId>,
    seen: FxHashSet<UniqueId>,
    /// Source-order index of every load and store in the loop.
    instruction_order: FxHashMap<UniqueId, usize>,
    load_used_in_condition: bool,
}

impl Grouping {
    /// Partition the loop's instructions into independent related sets; the
    /// condition cone is pre-seeded so it is never split out. Returns false
    /// when fewer than two sets exist.
    fn build_related_sets(
        &mut self,
        ctx: &mut IRContext,
        function: usize,
        descriptor: &LoopDescriptor,
        index: LoopIndex,
    ) -> bool {
        let l = descriptor.get(index);
        let blocks: Vec<Word> = l.blocks().to_vec();

        // The cone of the loop condition and of every structured branch is
        // shared between the split loops.
        let cfg = ctx.get_cfg(function);
        let condition_block =
            l.find_condition_block(ctx.module(), ctx.module().function(function), &cfg);
        drop(cfg);
        let mut shared = FxHashSet::default();
        if let Some(condition_block) = condition_block {
            let term = {
                let module = ctx.module();
                module
                    .function(function)
                    .block(condition_block)
                    .and_then(|bb| bb.terminator_uid(module))
            };
            if let Some(term) = term {
                self.traverse_use_def(ctx, descriptor, index, term, &mut shared, true, true);
            }
        }
        for block in &blocks {
            let insts: Vec<UniqueId> = ctx
                .module()
                .function(function)
                .block(*block)
                .map(|bb| bb.instructions().to_vec())
                .unwrap_or_default();
            for inst in insts {
                let opcode = ctx.module().inst(inst).opcode();
                if matches!(opcode, Op::SelectionMerge | Op::BranchConditional) {
                    self.traverse_use_def(ctx, descriptor, index, inst, &mut shared, true, true);
                }
            }
        }

        // Group what remains by connectivity in the def-use graph.
        let mut sets: Vec<FxHashSet<UniqueId>> = Vec::new();
        for block in &blocks {
            let insts: Vec<UniqueId> = ctx
                .module()
                .function(function)
                .block(*block)
                .map(|bb| bb.instructions().to_vec())
                .unwrap_or_default();
            for inst in insts {
                let opcode = ctx.module().inst(inst).opcode();
                if matches!(opcode, Op::Load | Op::Store) {
                    let order = self.instruction_order.len();
                    self.instruction_order.insert(inst, order);
                }
                if self.seen.contains(&inst) {
                    continue;
                }
                let mut set = FxHashSet::default();
                self.traverse_use_def(ctx, descriptor, index, inst, &mut set, false, false);
                if !set.is_empty() {
                    sets.push(set);
                }
            }
        }

        if sets.len() < 2 {
            return false;
        }
        let half = sets.len() / 2;
        for set in sets.drain(..half) {
            self.first.extend(set);
        }
        for set in sets {
            self.second.extend(set);
        }
        true
    }

    /// Walk the def-use chain from `seed`, collecting related instructions
    /// inside the loop. Phis terminate the user direction (breaking the
    /// cycle through the induction); labels, merges, and branches are never
    /// collected.
    #[allow(clippy::too_many_arguments)]
    fn traverse_use_def(
        &mut self,
        ctx: &mut IRContext,
        descriptor: &LoopDescriptor,
        index: LoopIndex,
        seed: UniqueId,
        set: &mut FxHashSet<UniqueId>,
        ignore_phi_users: bool,
        report_loads: bool,
    ) {
        let mut worklist = vec![seed];
        while let Some(inst) = worklist.pop() {
            if self.seen.contains(&inst) {
                continue;
            }
            let block = ctx.get_instr_block(inst);
            let inside = block
                .map(|b| descriptor.get(index).is_inside(b))
                .unwrap_or(false);
            if !inside {
                continue;
            }
            let (opcode, is_branch, is_phi) = {
                let instruction = ctx.module().inst(inst);
                (
                    instruction.opcode(),
                    instruction.is_branch(),
                    instruction.is_phi(),
                )
            };
            if matches!(opcode, Op::LoopMerge | Op::Label) {
                continue;
            }
            if opcode == Op::Load && report_loads {
                self.load_used_in_condition = true;
            }

            self.seen.insert(inst);
            if !is_branch {
                set.insert(inst);
            }

            // Uses: the operands' defining instructions.
            let mut operand_ids = Vec::new();
            ctx.module()
                .inst(inst)
                .for_each_id(|_, id| operand_ids.push(id));
            for id in operand_ids {
                let def = {
                    let def_use = ctx.get_def_use_mgr();
                    def_use.get_def(id)
                };
                if let Some(def) = def {
                    worklist.push(def);
                }
            }

            // Users, unless this is a phi and phis cut the traversal.
            if ignore_phi_users && is_phi {
                continue;
            }
            let users: Vec<UniqueId> = {
                let def_use = ctx.get_def_use_mgr();
                let mut users = Vec::new();
                def_use.for_each_user(inst, |user| {
                    users.push(user);
                    true
                });
                users
            };
            worklist.extend(users);
        }
    }

    /// The legality check: both groups must be movable, and no dependence
    /// between a store on one side and a load on the other may be violated
    /// by running the first group's loop entirely before the second's.
    fn can_perform_split(
        &self,
        ctx: &mut IRContext,
        function: usize,
        descriptor: &LoopDescriptor,
        index: LoopIndex,
    ) -> bool {
        if self.load_used_in_condition {
            return false;
        }

        let mut first_stores = Vec::new();
        let mut first_loads = Vec::new();
        for inst in &self.first {
            let instruction = ctx.module().inst(*inst);
            if !movable_instruction(instruction) {
                return false;
            }
            match instruction.opcode() {
                Op::Store => first_stores.push(*inst),
                Op::Load => first_loads.push(*inst),
                _ => {}
            }
        }
        for inst in &self.second {
            if !movable_instruction(ctx.module().inst(*inst)) {
                return false;
            }
        }

        let nest = descriptor.nest_of(index);
        let depth = nest.len();
        let block_of = ctx.instr_to_block_map();
        let def_use = DefUseManager::new(ctx.module());
        let module = ctx.module();
        let f = module.function(function);
        let mut analysis =
            LoopDependenceAnalysis::new(module, f, &def_use, descriptor, &block_of, nest);

        // The dependence analysis is oriented load-as-source: a positive
        // distance means the store logically follows the load across
        // iterations.
        for inst in &self.second {
            match module.inst(*inst).opcode() {
                Op::Load => {
                    for store in &first_stores {
                        // A store moved into the first loop must not
                        // originally come after this load.
                        if self.instruction_order[store] > self.instruction_order[inst] {
                            return false;
                        }
                        let mut dv = DistanceVector::new(depth);
                        if !analysis.get_dependence(*inst, *store, &mut dv) {
                            if dv.entries.iter().any(|entry| entry.distance > 0) {
                                return false;
                            }
                        }
                    }
                }
                Op::Store => {
                    for load in &first_loads {
                        if self.instruction_order[load] > self.instruction_order[inst] {
                            return false;
                        }
                        let mut dv = DistanceVector::new(depth);
                        if !analysis.get_dependence(*load, *inst, &mut dv) {
                            if dv.entries.iter().any(|entry| entry.distance < 0) {
                                return false;
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        true
    }
}

/// Only instructions with no side effects beyond memory reads/writes the
/// analysis understands may change loops.
fn movable_instruction(inst: &spvopt_ir::Instruction) -> bool {
    matches!(
        inst.opcode(),
        Op::Load | Op::Store | Op::SelectionMerge | Op::Phi
    ) || inst.is_code_motion_safe()
}
