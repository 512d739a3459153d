//! SSA register liveness and pressure, per basic block and per loop region.
//!
//! Liveness is computed in one post-order sweep of the CFG (back edges are
//! skipped, then patched up by loop unification), followed by a bottom-up
//! walk of each block to find the peak number of simultaneously live
//! registers and their breakdown by register class.

use rustc_hash::{FxHashMap, FxHashSet};
use spirv::Op;

use spvopt_ir::{
    ControlFlowGraph, DefUseManager, DominatorTree, Function, Loop, LoopDescriptor, Module,
    UniqueId, Word,
};

/// Classification of an SSA register: its type and whether the value is
/// uniform across an invocation group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterClass {
    pub type_id: Word,
    pub is_uniform: bool,
}

/// Liveness facts for one region (a basic block, or an aggregated loop).
#[derive(Debug, Clone, Default)]
pub struct RegionRegisterLiveness {
    /// Registers live when entering the region.
    pub live_in: FxHashSet<UniqueId>,
    /// Registers live when exiting the region.
    pub live_out: FxHashSet<UniqueId>,
    /// Peak number of simultaneously live registers inside the region.
    pub used_registers: usize,
    /// Per-class breakdown of the registers counted above.
    pub register_classes: Vec<(RegisterClass, usize)>,
}

impl RegionRegisterLiveness {
    fn add_register_class(&mut self, class: RegisterClass) {
        match self
            .register_classes
            .iter_mut()
            .find(|(existing, _)| *existing == class)
        {
            Some((_, count)) => *count += 1,
            None => self.register_classes.push((class, 1)),
        }
    }
}

/// Per-block register liveness for one function.
pub struct RegisterLiveness {
    blocks: FxHashMap<Word, RegionRegisterLiveness>,
}

impl RegisterLiveness {
    pub fn new(
        module: &Module,
        function: &Function,
        cfg: &ControlFlowGraph,
        dom: &DominatorTree,
        descriptor: &LoopDescriptor,
        def_use: &DefUseManager,
    ) -> Self {
        let mut analysis = Self {
            blocks: FxHashMap::default(),
        };
        Compute {
            module,
            function,
            cfg,
            dom,
            descriptor,
            def_use,
        }
        .run(&mut analysis);
        analysis
    }

    pub fn get(&self, block: Word) -> Option<&RegionRegisterLiveness> {
        self.blocks.get(&block)
    }

    /// Aggregate the pressure of a whole loop region: live-in is the
    /// header's live-in, live-out is the union of live-ins of the blocks the
    /// loop exits to, and the peak is the maximum over the loop's blocks.
    pub fn compute_loop_register_pressure(
        &self,
        l: &Loop,
        cfg: &ControlFlowGraph,
    ) -> RegionRegisterLiveness {
        let mut region = RegionRegisterLiveness::default();
        if let Some(header) = self.get(l.header()) {
            region.live_in = header.live_in.clone();
        }
        for exit in l.exit_blocks(cfg) {
            if let Some(liveness) = self.get(exit) {
                region.live_out.extend(liveness.live_in.iter().copied());
            }
        }
        for block in l.blocks() {
            if let Some(liveness) = self.get(*block) {
                region.used_registers = region.used_registers.max(liveness.used_registers);
            }
        }
        region
    }
}

struct Compute<'a> {
    module: &'a Module,
    function: &'a Function,
    cfg: &'a ControlFlowGraph,
    dom: &'a DominatorTree,
    descriptor: &'a LoopDescriptor,
    def_use: &'a DefUseManager,
}

impl Compute<'_> {
    fn run(&self, analysis: &mut RegisterLiveness) {
        for block in self.cfg.post_order(self.cfg.entry()) {
            self.compute_partial_liveness(analysis, block);
        }
        for (index, l) in self.descriptor.iter() {
            if l.parent().is_none() {
                self.unify_loop_liveness(analysis, index);
            }
        }
        self.evaluate_register_requirements(analysis);
    }

    /// Whether `inst` occupies a register: it defines a result that is not a
    /// constant, undef, or label.
    fn creates_register_usage(&self, inst: UniqueId) -> bool {
        let inst = self.module.inst(inst);
        inst.has_result_id()
            && inst.opcode() != Op::Undef
            && inst.opcode() != Op::Label
            && !inst.is_constant()
    }

    /// The values this block contributes to successor phis along its edges.
    fn compute_phi_uses(&self, block: Word, live: &mut FxHashSet<UniqueId>) {
        for succ in self.cfg.succs(block) {
            let Some(succ_bb) = self.function.block(*succ) else {
                continue;
            };
            for phi in succ_bb.phis(self.module) {
                for (value, pred) in self.module.inst(phi).phi_incoming() {
                    if pred != block {
                        continue;
                    }
                    if let Some(def) = self.def_use.get_def(value) {
                        if self.creates_register_usage(def) {
                            live.insert(def);
                        }
                    }
                    break;
                }
            }
        }
    }

    fn compute_partial_liveness(&self, analysis: &mut RegisterLiveness, block: Word) {
        let mut region = RegionRegisterLiveness::default();
        self.compute_phi_uses(block, &mut region.live_out);

        for succ in self.cfg.succs(block) {
            // Back edges point at blocks that have not been processed yet;
            // loop unification patches the header contribution in later.
            if self.dom.dominates(*succ, block) {
                continue;
            }
            let Some(succ_bb) = self.function.block(*succ) else {
                continue;
            };
            let succ_phis: FxHashSet<UniqueId> =
                succ_bb.phis(self.module).into_iter().collect();
            if let Some(succ_region) = analysis.blocks.get(succ) {
                for value in &succ_region.live_in {
                    if !succ_phis.contains(value) {
                        region.live_out.insert(*value);
                    }
                }
            }
        }

        region.live_in = region.live_out.clone();
        let Some(bb) = self.function.block(block) else {
            return;
        };
        for uid in bb.instructions().iter().rev() {
            let inst = self.module.inst(*uid);
            if inst.is_phi() {
                // Phis enter the block as a unit.
                for phi in bb.phis(self.module) {
                    region.live_in.insert(phi);
                }
                break;
            }
            region.live_in.remove(uid);
            inst.for_each_id(|_, id| {
                if let Some(def) = self.def_use.get_def(id) {
                    if self.creates_register_usage(def) {
                        region.live_in.insert(def);
                    }
                }
            });
        }

        analysis.blocks.insert(block, region);
    }

    /// Everything live into a loop header (except its phis) stays live
    /// through every block of the loop, including nested loop headers.
    fn unify_loop_liveness(&self, analysis: &mut RegisterLiveness, index: usize) {
        let l = self.descriptor.get(index);
        let header = l.header();
        let Some(header_bb) = self.function.block(header) else {
            return;
        };
        let header_phis: FxHashSet<UniqueId> = header_bb.phis(self.module).into_iter().collect();
        let live_loop: Vec<UniqueId> = analysis
            .blocks
            .get(&header)
            .map(|region| {
                region
                    .live_in
                    .iter()
                    .copied()
                    .filter(|value| !header_phis.contains(value))
                    .collect()
            })
            .unwrap_or_default();

        for block in l.blocks() {
            if *block == header || self.descriptor.loop_of(*block) != Some(index) {
                continue;
            }
            if let Some(region) = analysis.blocks.get_mut(block) {
                region.live_in.extend(live_loop.iter().copied());
                region.live_out.extend(live_loop.iter().copied());
            }
        }

        for child in l.children().to_vec() {
            let child_header = self.descriptor.get(child).header();
            if let Some(region) = analysis.blocks.get_mut(&child_header) {
                region.live_in.extend(live_loop.iter().copied());
                region.live_out.extend(live_loop.iter().copied());
            }
            self.unify_loop_liveness(analysis, child);
        }
    }

    fn classify_register(&self, inst: UniqueId) -> RegisterClass {
        let instruction = self.module.inst(inst);
        let result_id = instruction.result_id();
        let is_uniform = self
            .def_use
            .get_annotations(self.module, result_id)
            .into_iter()
            .any(|annotation| {
                let annotation = self.module.inst(annotation);
                annotation.opcode() == Op::Decorate
                    && matches!(
                        annotation.operands().get(1),
                        Some(spvopt_ir::Operand::Decoration(spirv::Decoration::Uniform))
                    )
            });
        RegisterClass {
            type_id: instruction.type_id(),
            is_uniform,
        }
    }

    /// Walk each block bottom-up counting live registers: a use first seen
    /// from below brings a register to life, passing its definition frees
    /// it. The running maximum is the block's peak pressure.
    fn evaluate_register_requirements(&self, analysis: &mut RegisterLiveness) {
        for bb in self.function.blocks() {
            let Some(region) = analysis.blocks.get_mut(&bb.id()) else {
                continue;
            };
            let mut reg_count = region.live_out.len();
            let live_out = region.live_out.clone();
            for value in &live_out {
                let class = self.classify_register(*value);
                region.add_register_class(class);
            }
            region.used_registers = reg_count;

            let mut die_in_block: FxHashSet<Word> = FxHashSet::default();
            for uid in bb.instructions().iter().rev() {
                let inst = self.module.inst(*uid);
                if inst.is_phi() {
                    break;
                }
                if !self.creates_register_usage(*uid) {
                    continue;
                }
                let mut ids = Vec::new();
                inst.for_each_id(|_, id| ids.push(id));
                for id in ids {
                    let Some(def) = self.def_use.get_def(id) else {
                        continue;
                    };
                    if !self.creates_register_usage(def) || live_out.contains(&def) {
                        continue;
                    }
                    if die_in_block.insert(id) {
                        let class = self.classify_register(def);
                        region.add_register_class(class);
                        reg_count += 1;
                    }
                }
                if inst.has_result_id() && die_in_block.contains(&inst.result_id()) {
                    reg_count -= 1;
                }
                region.used_registers = region.used_registers.max(reg_count);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use spvopt_ir::{test_util::FunctionBuilderHarness, Direction, DominatorTree};

    use super::*;

    #[test]
    fn loop_invariant_value_is_live_through_the_loop_body() {
        // x defined before the loop and stored on every iteration must be
        // live in every block of the loop.
        let mut h = FunctionBuilderHarness::new();
        let array = h.workgroup_array_var(16);
        let mut x = 0;
        let cl = h.counted_loop_with_body(0, 10, 1, |h, cl| {
            let two = h.i32_constant(2);
            let three = h.i32_constant(3);
            // Define x in the pre-header, use it in the body.
            x = h.iadd(cl.pre_header, two, three);
            let ptr = h.access_chain_i32(cl.body, array, &[cl.phi]);
            h.store(cl.body, ptr, x);
        });
        let module = h.finish();
        let function = module.function(0);
        let cfg = ControlFlowGraph::new(&module, function);
        let dom = DominatorTree::new(&cfg, Direction::Forward);
        let descriptor = LoopDescriptor::new(&module, function, &cfg, &dom);
        let def_use = DefUseManager::new(&module);
        let x_def = def_use.get_def(x).unwrap();

        let liveness =
            RegisterLiveness::new(&module, function, &cfg, &dom, &descriptor, &def_use);

        for block in [cl.header, cl.cond_block, cl.body, cl.latch] {
            let region = liveness.get(block).expect("block analysed");
            assert!(
                region.live_in.contains(&x_def),
                "x should be live into {block}"
            );
            assert!(
                region.live_out.contains(&x_def) || block == cl.body,
                "x should be live out of {block}"
            );
        }

        // The body holds x, the access chain, and the phi simultaneously.
        let body = liveness.get(cl.body).unwrap();
        assert!(body.used_registers >= 2);

        let l = descriptor.get(0);
        let region = liveness.compute_loop_register_pressure(l, &cfg);
        assert!(region.live_in.contains(&x_def));
        assert!(region.used_registers >= body.used_registers);
    }
}
