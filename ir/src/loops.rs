use rustc_hash::FxHashMap;
use spirv::Op;

use crate::{
    ControlFlowGraph, DefUseManager, DominatorTree, Function, Module, UniqueId, Word,
};

/// Index of a loop within its function's [LoopDescriptor].
pub type LoopIndex = usize;

/// The recognised induction variable of a loop: a header phi whose
/// latch-incoming value is a loop-invariant constant step applied to itself.
#[derive(Debug, Clone)]
pub struct InductionVar {
    /// The OpPhi in the loop header.
    pub phi: UniqueId,
    /// The initial value flowing in from outside the loop.
    pub init_id: Word,
    /// The initial value folded to a constant, when it is one.
    pub init_value: Option<i64>,
    /// The add/sub computing the next value on the back-edge.
    pub step_inst: UniqueId,
    /// Signed step applied per iteration.
    pub step: i64,
    /// The comparison feeding the exit branch.
    pub condition: UniqueId,
    /// The block whose conditional branch exits the loop.
    pub condition_block: Word,
}

/// A natural loop identified by a header block carrying an OpLoopMerge.
///
/// The merge instruction is the single source of truth for the loop shape:
/// `merge` and `latch` are its two operands, and helpers that find the CFG
/// disagreeing with it report the loop as unsupported rather than guessing.
#[derive(Debug, Clone)]
pub struct Loop {
    header: Word,
    latch: Word,
    merge: Word,
    pre_header: Option<Word>,
    parent: Option<LoopIndex>,
    children: Vec<LoopIndex>,
    /// Body blocks in structured order: header first, then the dominator
    /// subtree of the header minus everything dominated by the merge.
    blocks: Vec<Word>,
    block_set: rustc_hash::FxHashSet<Word>,
}

impl Loop {
    #[inline]
    pub fn header(&self) -> Word {
        self.header
    }

    /// The continue target: the sole back-edge source named by OpLoopMerge.
    #[inline]
    pub fn latch(&self) -> Word {
        self.latch
    }

    /// The merge block: the unique exit of a well-structured loop.
    #[inline]
    pub fn merge(&self) -> Word {
        self.merge
    }

    #[inline]
    pub fn pre_header(&self) -> Option<Word> {
        self.pre_header
    }

    pub fn set_pre_header(&mut self, block: Word) {
        self.pre_header = Some(block);
    }

    pub fn set_merge(&mut self, block: Word) {
        self.merge = block;
    }

    #[inline]
    pub fn parent(&self) -> Option<LoopIndex> {
        self.parent
    }

    #[inline]
    pub fn children(&self) -> &[LoopIndex] {
        &self.children
    }

    #[inline]
    pub fn is_innermost(&self) -> bool {
        self.children.is_empty()
    }

    /// Body blocks in structured order, header first. The merge block is not
    /// part of the loop.
    #[inline]
    pub fn blocks(&self) -> &[Word] {
        &self.blocks
    }

    #[inline]
    pub fn is_inside(&self, block: Word) -> bool {
        self.block_set.contains(&block)
    }

    pub fn add_block(&mut self, block: Word) {
        if self.block_set.insert(block) {
            self.blocks.push(block);
        }
    }

    pub fn remove_block(&mut self, block: Word) {
        if self.block_set.remove(&block) {
            self.blocks.retain(|b| *b != block);
        }
    }

    /// Nesting depth; an outermost loop has depth 1.
    pub fn depth(&self, descriptor: &LoopDescriptor) -> usize {
        let mut depth = 1;
        let mut current = self.parent;
        while let Some(index) = current {
            depth += 1;
            current = descriptor.get(index).parent;
        }
        depth
    }

    /// Blocks outside the loop that are branched to from inside.
    pub fn exit_blocks(&self, cfg: &ControlFlowGraph) -> Vec<Word> {
        let mut exits = Vec::new();
        for block in &self.blocks {
            for succ in cfg.succs(*block) {
                if !self.is_inside(*succ) && !exits.contains(succ) {
                    exits.push(*succ);
                }
            }
        }
        exits
    }

    /// The unique in-loop predecessor of the merge block terminated by a
    /// conditional branch, i.e. the block testing the exit condition.
    pub fn find_condition_block(
        &self,
        module: &Module,
        function: &Function,
        cfg: &ControlFlowGraph,
    ) -> Option<Word> {
        let mut in_loop_pred = None;
        for pred in cfg.preds(self.merge) {
            if self.is_inside(*pred) {
                if in_loop_pred.is_some() {
                    return None;
                }
                in_loop_pred = Some(*pred);
            }
        }
        let block = function.block(in_loop_pred?)?;
        let term = block.terminator(module)?;
        (term.opcode() == Op::BranchConditional).then(|| block.id())
    }

    /// Recognise the induction variable, per the canonical counted-loop
    /// shape. Returns `None` whenever any link of the chain (condition block,
    /// integer compare, header phi with two incoming edges, constant add or
    /// subtract step) is missing.
    pub fn find_induction_variable(
        &self,
        module: &Module,
        function: &Function,
        cfg: &ControlFlowGraph,
        def_use: &DefUseManager,
    ) -> Option<InductionVar> {
        let condition_block = self.find_condition_block(module, function, cfg)?;
        let branch = function.block(condition_block)?.terminator(module)?;
        let condition_uid = def_use.get_def(branch.single_word_operand(0))?;
        let condition = module.inst(condition_uid);
        if !condition.is_int_compare() {
            return None;
        }

        // Whichever compare operand resolves to a phi in the header is the
        // induction; the other is the bound.
        let phi_uid = [0usize, 1usize].into_iter().find_map(|index| {
            let uid = def_use.get_def(condition.single_word_operand(index))?;
            let inst = module.inst(uid);
            let header = function.block(self.header)?;
            (inst.is_phi() && header.contains(uid)).then_some(uid)
        })?;

        let phi = module.inst(phi_uid);
        let incoming: Vec<(Word, Word)> = phi.phi_incoming().collect();
        if incoming.len() != 2 {
            return None;
        }
        let (mut init_id, mut step_id) = (None, None);
        for (value, pred) in incoming {
            if pred == self.latch {
                step_id = Some(value);
            } else if !self.is_inside(pred) {
                init_id = Some(value);
            }
        }
        let (init_id, step_id) = (init_id?, step_id?);

        let step_uid = def_use.get_def(step_id)?;
        let step_inst = module.inst(step_uid);
        let step = match step_inst.opcode() {
            Op::IAdd => {
                let constant = self.step_constant_operand(module, def_use, step_inst, phi_uid)?;
                constant
            }
            Op::ISub => {
                // Only `phi - c` counts down; `c - phi` is not an induction.
                let lhs = def_use.get_def(step_inst.single_word_operand(0))?;
                if lhs != phi_uid {
                    return None;
                }
                let rhs = def_use.get_def(step_inst.single_word_operand(1))?;
                -module.int_constant_value(module.inst(rhs))?
            }
            _ => return None,
        };
        if step == 0 {
            return None;
        }

        let init_value = def_use
            .get_def(init_id)
            .and_then(|uid| module.int_constant_value(module.inst(uid)));

        Some(InductionVar {
            phi: phi_uid,
            init_id,
            init_value,
            step_inst: step_uid,
            step,
            condition: condition_uid,
            condition_block,
        })
    }

    fn step_constant_operand(
        &self,
        module: &Module,
        def_use: &DefUseManager,
        step_inst: &crate::Instruction,
        phi: UniqueId,
    ) -> Option<i64> {
        let lhs = def_use.get_def(step_inst.single_word_operand(0))?;
        let rhs = def_use.get_def(step_inst.single_word_operand(1))?;
        let constant = if lhs == phi {
            rhs
        } else if rhs == phi {
            lhs
        } else {
            return None;
        };
        module.int_constant_value(module.inst(constant))
    }

    /// The number of latch executions, for a constant-bounded loop.
    pub fn find_number_of_iterations(
        &self,
        module: &Module,
        function: &Function,
        cfg: &ControlFlowGraph,
        def_use: &DefUseManager,
        induction: &InductionVar,
    ) -> Option<u64> {
        let condition = module.inst(induction.condition);
        let phi_id = module.inst(induction.phi).result_id();
        let (bound_index, phi_is_lhs) = if condition.single_word_operand(0) == phi_id {
            (1, true)
        } else if condition.single_word_operand(1) == phi_id {
            (0, false)
        } else {
            return None;
        };
        let bound_uid = def_use.get_def(condition.single_word_operand(bound_index))?;
        let bound = module.int_constant_value(module.inst(bound_uid))?;
        let init = induction.init_value?;

        let mut opcode = condition.opcode();
        if !phi_is_lhs {
            opcode = mirror_compare(opcode)?;
        }
        // If the branch exits the loop on `true`, the comparison describes the
        // exit condition; the continue condition is its negation.
        let branch = function
            .block(induction.condition_block)?
            .terminator(module)?;
        if branch.single_word_operand(1) == self.merge {
            opcode = negate_compare(opcode)?;
        }

        iterations(opcode, init, bound, induction.step)
    }

    /// Whether every value defined in the loop and used outside flows through
    /// a phi in the merge block.
    pub fn is_lcssa(
        &self,
        module: &Module,
        function: &Function,
        def_use: &DefUseManager,
        block_of: &FxHashMap<UniqueId, Word>,
    ) -> bool {
        let merge = self.merge;
        for block in &self.blocks {
            let Some(bb) = function.block(*block) else {
                continue;
            };
            for uid in bb.instructions() {
                let inst = module.inst(*uid);
                if !inst.has_result_id() {
                    continue;
                }
                let closed = def_use.for_each_user(*uid, |user| {
                    match block_of.get(&user) {
                        Some(user_block) if self.is_inside(*user_block) => true,
                        Some(user_block) if *user_block == merge => {
                            module.inst(user).is_phi()
                        }
                        Some(_) => false,
                        // Users outside any block (module-level) do not break
                        // loop-closed form.
                        None => true,
                    }
                });
                if !closed {
                    return false;
                }
            }
        }
        true
    }

    /// Whether the loop body contains nothing that forbids duplication
    /// (convergent or primitive-stream instructions).
    pub fn is_safe_to_clone(&self, module: &Module, function: &Function) -> bool {
        for block in &self.blocks {
            let Some(bb) = function.block(*block) else {
                return false;
            };
            for uid in bb.instructions() {
                if matches!(
                    module.inst(*uid).opcode(),
                    Op::ControlBarrier | Op::MemoryBarrier | Op::EmitVertex | Op::EndPrimitive
                ) {
                    return false;
                }
            }
        }
        true
    }

    /// Whether the header's OpLoopMerge requests unrolling.
    pub fn has_unroll_hint(&self, module: &Module, function: &Function) -> bool {
        function
            .block(self.header)
            .and_then(|bb| bb.loop_merge_inst(module))
            .map(|merge| match merge.operands().get(2) {
                Some(crate::Operand::LoopControl(control)) => {
                    control.contains(spirv::LoopControl::UNROLL)
                }
                _ => false,
            })
            .unwrap_or(false)
    }
}

/// Rewrites `a OP b` as `b OP' a`.
fn mirror_compare(op: Op) -> Option<Op> {
    Some(match op {
        Op::ULessThan => Op::UGreaterThan,
        Op::SLessThan => Op::SGreaterThan,
        Op::ULessThanEqual => Op::UGreaterThanEqual,
        Op::SLessThanEqual => Op::SGreaterThanEqual,
        Op::UGreaterThan => Op::ULessThan,
        Op::SGreaterThan => Op::SLessThan,
        Op::UGreaterThanEqual => Op::ULessThanEqual,
        Op::SGreaterThanEqual => Op::SLessThanEqual,
        _ => return None,
    })
}

fn negate_compare(op: Op) -> Option<Op> {
    Some(match op {
        Op::ULessThan => Op::UGreaterThanEqual,
        Op::SLessThan => Op::SGreaterThanEqual,
        Op::ULessThanEqual => Op::UGreaterThan,
        Op::SLessThanEqual => Op::SGreaterThan,
        Op::UGreaterThan => Op::ULessThanEqual,
        Op::SGreaterThan => Op::SLessThanEqual,
        Op::UGreaterThanEqual => Op::ULessThan,
        Op::SGreaterThanEqual => Op::SLessThan,
        _ => return None,
    })
}

/// Latch executions for a loop `for (i = init; i OP bound; i += step)`.
///
/// Returns `None` when the step runs away from the bound (the loop would not
/// terminate through this condition).
fn iterations(op: Op, init: i64, bound: i64, step: i64) -> Option<u64> {
    debug_assert_ne!(step, 0);
    let span: i64;
    let stride: i64;
    match op {
        Op::ULessThan | Op::SLessThan => {
            if init >= bound {
                return Some(0);
            }
            span = bound.checked_sub(init)?;
            stride = step;
        }
        Op::ULessThanEqual | Op::SLessThanEqual => {
            if init > bound {
                return Some(0);
            }
            span = bound.checked_sub(init)?.checked_add(1)?;
            stride = step;
        }
        Op::UGreaterThan | Op::SGreaterThan => {
            if init <= bound {
                return Some(0);
            }
            span = init.checked_sub(bound)?;
            stride = -step;
        }
        Op::UGreaterThanEqual | Op::SGreaterThanEqual => {
            if init < bound {
                return Some(0);
            }
            span = init.checked_sub(bound)?.checked_add(1)?;
            stride = -step;
        }
        _ => return None,
    }
    if stride <= 0 {
        return None;
    }
    // ceil(span / stride)
    Some(((span + stride - 1) / stride) as u64)
}

/// All loops of one function, discovered from OpLoopMerge instructions in
/// dominator-tree pre-order.
///
/// The order guarantees that a loop appears before the later siblings of its
/// ancestors, so walking indices in reverse processes nested loops before
/// the loops containing them.
#[derive(Debug, Default)]
pub struct LoopDescriptor {
    loops: Vec<Loop>,
    block_to_loop: FxHashMap<Word, LoopIndex>,
}

impl LoopDescriptor {
    pub fn new(
        module: &Module,
        function: &Function,
        cfg: &ControlFlowGraph,
        dom: &DominatorTree,
    ) -> Self {
        let mut descriptor = Self::default();

        // Collect loop headers in dominator-tree pre-order.
        for block in dom.pre_order() {
            let Some(bb) = function.block(block) else {
                continue;
            };
            let Some(merge_inst) = bb.loop_merge_inst(module) else {
                continue;
            };
            let merge = merge_inst.single_word_operand(0);
            let latch = merge_inst.single_word_operand(1);

            let blocks = dom.pre_order_from(block, |b| dom.dominates(merge, b));
            let block_set = blocks.iter().copied().collect();
            let mut new_loop = Loop {
                header: block,
                latch,
                merge,
                pre_header: None,
                parent: None,
                children: Vec::new(),
                blocks,
                block_set,
            };
            new_loop.pre_header = find_pre_header(cfg, &new_loop);
            descriptor.loops.push(new_loop);

            // Walk previously created loops inner-to-outer looking for the
            // parent: the nearest loop whose header dominates this header but
            // whose merge does not.
            let this = descriptor.loops.len() - 1;
            for candidate in (0..this).rev() {
                let previous = &descriptor.loops[candidate];
                if !dom.dominates(previous.header, block) {
                    break;
                }
                if dom.dominates(previous.merge, block) {
                    continue;
                }
                descriptor.loops[this].parent = Some(candidate);
                descriptor.loops[candidate].children.push(this);
                break;
            }
        }

        // Innermost-loop map: creation order visits outer headers before the
        // headers nested inside them, so later inserts win.
        for (index, l) in descriptor.loops.iter().enumerate() {
            for block in &l.blocks {
                descriptor.block_to_loop.insert(*block, index);
            }
        }

        descriptor
    }

    #[inline]
    pub fn num_loops(&self) -> usize {
        self.loops.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn get(&self, index: LoopIndex) -> &Loop {
        &self.loops[index]
    }

    pub fn get_mut(&mut self, index: LoopIndex) -> &mut Loop {
        &mut self.loops[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = (LoopIndex, &Loop)> {
        self.loops.iter().enumerate()
    }

    /// Loop indices ordered children-before-parents.
    pub fn indices_inner_to_outer(&self) -> Vec<LoopIndex> {
        let mut order: Vec<LoopIndex> = (0..self.loops.len()).collect();
        order.sort_by_key(|index| std::cmp::Reverse(self.loops[*index].depth(self)));
        order
    }

    /// The innermost loop containing `block`.
    pub fn loop_of(&self, block: Word) -> Option<LoopIndex> {
        self.block_to_loop.get(&block).copied()
    }

    /// The loop nest enclosing `index`, innermost first.
    pub fn nest_of(&self, index: LoopIndex) -> Vec<LoopIndex> {
        let mut nest = vec![index];
        let mut current = self.loops[index].parent;
        while let Some(parent) = current {
            nest.push(parent);
            current = self.loops[parent].parent;
        }
        nest
    }

    pub fn set_block_to_loop(&mut self, block: Word, index: LoopIndex) {
        self.block_to_loop.insert(block, index);
    }

    pub fn forget_block(&mut self, block: Word) {
        self.block_to_loop.remove(&block);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        dominators::Direction,
        test_util::FunctionBuilderHarness,
    };

    #[test]
    fn single_counted_loop_is_recognised() {
        // for (i = 0; i < 10; ++i) {}
        let mut h = FunctionBuilderHarness::new();
        let cl = h.counted_loop(0, 10, 1);
        let module = h.finish();
        let function = module.function(0);
        let cfg = ControlFlowGraph::new(&module, function);
        let dom = DominatorTree::new(&cfg, Direction::Forward);

        let descriptor = LoopDescriptor::new(&module, function, &cfg, &dom);
        assert_eq!(descriptor.num_loops(), 1);

        let l = descriptor.get(0);
        assert_eq!(l.header(), cl.header);
        assert_eq!(l.latch(), cl.latch);
        assert_eq!(l.merge(), cl.merge);
        assert_eq!(l.pre_header(), Some(cl.pre_header));
        assert!(l.is_inside(cl.body));
        assert!(l.is_inside(cl.cond_block));
        assert!(!l.is_inside(cl.merge));

        let def_use = DefUseManager::new(&module);
        assert_eq!(
            l.find_condition_block(&module, function, &cfg),
            Some(cl.cond_block)
        );
        let induction = l
            .find_induction_variable(&module, function, &cfg, &def_use)
            .expect("canonical loop has an induction variable");
        assert_eq!(induction.step, 1);
        assert_eq!(induction.init_value, Some(0));
        assert_eq!(induction.condition_block, cl.cond_block);

        let trips = l
            .find_number_of_iterations(&module, function, &cfg, &def_use, &induction)
            .expect("constant trip count");
        assert_eq!(trips, 10);
    }

    #[test]
    fn counting_down_loops_are_recognised() {
        let mut h = FunctionBuilderHarness::new();
        let cl = h.counted_loop(8, 0, -2);
        // Rewrite the comparison: `i < bound` becomes `i > bound`.
        let mut module = h.finish();
        let cond_uid = DefUseManager::new(&module).get_def(cl.cond).unwrap();
        module.inst_mut(cond_uid).set_opcode(Op::SGreaterThan);

        let function = module.function(0);
        let cfg = ControlFlowGraph::new(&module, function);
        let dom = DominatorTree::new(&cfg, Direction::Forward);
        let descriptor = LoopDescriptor::new(&module, function, &cfg, &dom);
        let def_use = DefUseManager::new(&module);

        let l = descriptor.get(0);
        let induction = l
            .find_induction_variable(&module, function, &cfg, &def_use)
            .unwrap();
        assert_eq!(induction.step, -2);
        let trips = l
            .find_number_of_iterations(&module, function, &cfg, &def_use, &induction)
            .unwrap();
        assert_eq!(trips, 4); // 8, 6, 4, 2
    }

    #[test]
    fn trip_count_table() {
        use spirv::Op;

        // i < 10 from 0 step 1
        assert_eq!(iterations(Op::SLessThan, 0, 10, 1), Some(10));
        // i < 10 from 0 step 3: 0,3,6,9
        assert_eq!(iterations(Op::SLessThan, 0, 10, 3), Some(4));
        // i <= 10 from 0 step 1
        assert_eq!(iterations(Op::SLessThanEqual, 0, 10, 1), Some(11));
        // i > 0 from 10 step -1
        assert_eq!(iterations(Op::SGreaterThan, 10, 0, -1), Some(10));
        // i >= 0 from 10 step -2: 10,8,6,4,2,0
        assert_eq!(iterations(Op::SGreaterThanEqual, 10, 0, -2), Some(6));
        // Degenerate: already false on entry.
        assert_eq!(iterations(Op::SLessThan, 10, 0, 1), Some(0));
        // Step runs away from the bound.
        assert_eq!(iterations(Op::SLessThan, 0, 10, -1), None);
    }

    #[test]
    fn nested_loops_have_parents_assigned() {
        let mut h = FunctionBuilderHarness::new();
        let nest = h.nested_loops();
        let module = h.finish();
        let function = module.function(0);
        let cfg = ControlFlowGraph::new(&module, function);
        let dom = DominatorTree::new(&cfg, Direction::Forward);

        let descriptor = LoopDescriptor::new(&module, function, &cfg, &dom);
        assert_eq!(descriptor.num_loops(), 2);

        let outer = descriptor
            .iter()
            .find(|(_, l)| l.header() == nest.outer_header)
            .map(|(index, _)| index)
            .unwrap();
        let inner = descriptor
            .iter()
            .find(|(_, l)| l.header() == nest.inner_header)
            .map(|(index, _)| index)
            .unwrap();

        assert_eq!(descriptor.get(inner).parent(), Some(outer));
        assert_eq!(descriptor.get(outer).children(), &[inner]);
        assert_eq!(descriptor.get(inner).depth(&descriptor), 2);

        // The innermost map prefers the inner loop for its blocks.
        assert_eq!(descriptor.loop_of(nest.inner_header), Some(inner));
        assert_eq!(descriptor.loop_of(nest.outer_header), Some(outer));

        // The outer loop's body includes the whole inner loop, but not
        // either merge block.
        assert!(descriptor.get(outer).is_inside(nest.inner_header));
        assert!(descriptor.get(outer).is_inside(nest.inner_merge));
        assert!(!descriptor.get(outer).is_inside(nest.outer_merge));

        // Inner-to-outer ordering processes the nested loop first.
        let order = descriptor.indices_inner_to_outer();
        assert_eq!(order[0], inner);
    }
}

fn find_pre_header(cfg: &ControlFlowGraph, l: &Loop) -> Option<Word> {
    let mut outside = None;
    for pred in cfg.preds(l.header()) {
        if !l.is_inside(*pred) {
            if outside.is_some() {
                return None;
            }
            outside = Some(*pred);
        }
    }
    let candidate = outside?;
    (cfg.succs(candidate) == [l.header()]).then_some(candidate)
}
