use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::{
    cfg::ControlFlowGraph,
    def_use::DefUseManager,
    dominators::{Direction, DominatorTree},
    loops::LoopDescriptor,
    Instruction, Module, UniqueId, Word,
};

bitflags::bitflags! {
    /// The set of analyses currently valid on an [IRContext].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Analyses: u32 {
        const NONE = 0;
        const DEF_USE = 1 << 0;
        const INSTR_TO_BLOCK = 1 << 1;
        const CFG = 1 << 2;
        const DOMINATOR = 1 << 3;
        const POST_DOMINATOR = 1 << 4;
        const LOOP_ANALYSIS = 1 << 5;
        const REGISTER_PRESSURE = 1 << 6;
        const SCALAR_EVOLUTION = 1 << 7;
        const CONSTANTS = 1 << 8;
        const TYPES = 1 << 9;
        const DECORATIONS = 1 << 10;
    }
}

/// Map from instruction handle to the id of the block containing it. Labels
/// map to their own block.
pub type InstrToBlockMap = FxHashMap<UniqueId, Word>;

/// The shared state a pass operates on: the module plus lazily built, cached
/// analyses and the book-keeping that keeps them consistent under mutation.
///
/// Analyses are built on first request and cached until invalidated. The
/// mutation API (`kill_inst`, `replace_all_uses_with`, `analyze_uses`,
/// `set_instr_block`, `take_next_id`) incrementally updates whichever
/// analyses are still marked valid; passes performing structural surgery
/// through [IRContext::module_mut] must invalidate what they break; reading
/// a stale analysis afterwards is a logic bug, not a race.
///
/// Killed instructions are tombstoned in the arena and recorded in a kill
/// set that is drained at pass boundaries; handles to them never dangle.
pub struct IRContext {
    module: Module,
    valid: Analyses,
    def_use: Option<DefUseManager>,
    instr_to_block: Option<InstrToBlockMap>,
    cfgs: FxHashMap<usize, Rc<ControlFlowGraph>>,
    dom_trees: FxHashMap<usize, Rc<DominatorTree>>,
    post_dom_trees: FxHashMap<usize, Rc<DominatorTree>>,
    kill_set: Vec<UniqueId>,
}

impl IRContext {
    pub fn new(module: Module) -> Self {
        Self {
            module,
            valid: Analyses::NONE,
            def_use: None,
            instr_to_block: None,
            cfgs: FxHashMap::default(),
            dom_trees: FxHashMap::default(),
            post_dom_trees: FxHashMap::default(),
            kill_set: Vec::new(),
        }
    }

    pub fn into_module(self) -> Module {
        self.module
    }

    #[inline]
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Mutable access to the module for structural surgery.
    ///
    /// This does not invalidate anything by itself; the caller is
    /// responsible for invalidating every analysis its edits break.
    #[inline]
    pub fn module_mut(&mut self) -> &mut Module {
        &mut self.module
    }

    #[inline]
    pub fn is_valid(&self, analyses: Analyses) -> bool {
        self.valid.contains(analyses)
    }

    /// Mark `analyses` invalid and drop their caches.
    pub fn invalidate(&mut self, analyses: Analyses) {
        self.valid &= !analyses;
        if analyses.contains(Analyses::DEF_USE) {
            self.def_use = None;
        }
        if analyses.contains(Analyses::INSTR_TO_BLOCK) {
            self.instr_to_block = None;
        }
        if analyses.contains(Analyses::CFG) {
            self.cfgs.clear();
        }
        if analyses.contains(Analyses::DOMINATOR) {
            self.dom_trees.clear();
        }
        if analyses.contains(Analyses::POST_DOMINATOR) {
            self.post_dom_trees.clear();
        }
    }

    /// Invalidate every analysis outside `preserve`. Passes call this with
    /// their preserve set at completion.
    pub fn invalidate_all_except(&mut self, preserve: Analyses) {
        self.invalidate(Analyses::all() & !preserve);
    }

    /// The def-use manager, built from the module on first request.
    pub fn get_def_use_mgr(&mut self) -> &DefUseManager {
        if !self.valid.contains(Analyses::DEF_USE) || self.def_use.is_none() {
            self.def_use = Some(DefUseManager::new(&self.module));
            self.valid |= Analyses::DEF_USE;
        }
        self.def_use.as_ref().unwrap()
    }

    /// The block containing `inst`, if it is inside a function body.
    pub fn get_instr_block(&mut self, inst: UniqueId) -> Option<Word> {
        self.ensure_instr_to_block();
        self.instr_to_block.as_ref().unwrap().get(&inst).copied()
    }

    /// Record that `inst` now lives in `block`.
    pub fn set_instr_block(&mut self, inst: UniqueId, block: Word) {
        if self.valid.contains(Analyses::INSTR_TO_BLOCK) {
            if let Some(map) = self.instr_to_block.as_mut() {
                map.insert(inst, block);
            }
        }
    }

    fn ensure_instr_to_block(&mut self) {
        if self.valid.contains(Analyses::INSTR_TO_BLOCK) && self.instr_to_block.is_some() {
            return;
        }
        let mut map = InstrToBlockMap::default();
        for function in self.module.functions() {
            for block in function.blocks() {
                map.insert(block.label(), block.id());
                for uid in block.instructions() {
                    map.insert(*uid, block.id());
                }
            }
        }
        self.instr_to_block = Some(map);
        self.valid |= Analyses::INSTR_TO_BLOCK;
    }

    /// A snapshot of the full instruction-to-block map.
    pub fn instr_to_block_map(&mut self) -> InstrToBlockMap {
        self.ensure_instr_to_block();
        self.instr_to_block.as_ref().unwrap().clone()
    }

    /// The control-flow graph of function `index`.
    pub fn get_cfg(&mut self, index: usize) -> Rc<ControlFlowGraph> {
        if !self.valid.contains(Analyses::CFG) {
            self.cfgs.clear();
            self.valid |= Analyses::CFG;
        }
        if let Some(cfg) = self.cfgs.get(&index) {
            return Rc::clone(cfg);
        }
        let cfg = Rc::new(ControlFlowGraph::new(
            &self.module,
            self.module.function(index),
        ));
        self.cfgs.insert(index, Rc::clone(&cfg));
        cfg
    }

    /// The dominator tree of function `index`.
    pub fn get_dominator_analysis(&mut self, index: usize) -> Rc<DominatorTree> {
        if !self.valid.contains(Analyses::DOMINATOR) {
            self.dom_trees.clear();
            self.valid |= Analyses::DOMINATOR;
        }
        if let Some(tree) = self.dom_trees.get(&index) {
            return Rc::clone(tree);
        }
        let cfg = self.get_cfg(index);
        let tree = Rc::new(DominatorTree::new(&cfg, Direction::Forward));
        self.dom_trees.insert(index, Rc::clone(&tree));
        tree
    }

    /// The post-dominator tree of function `index`.
    pub fn get_post_dominator_analysis(&mut self, index: usize) -> Rc<DominatorTree> {
        if !self.valid.contains(Analyses::POST_DOMINATOR) {
            self.post_dom_trees.clear();
            self.valid |= Analyses::POST_DOMINATOR;
        }
        if let Some(tree) = self.post_dom_trees.get(&index) {
            return Rc::clone(tree);
        }
        let cfg = self.get_cfg(index);
        let tree = Rc::new(DominatorTree::new(&cfg, Direction::Reverse));
        self.post_dom_trees.insert(index, Rc::clone(&tree));
        tree
    }

    /// Build the loop descriptor for function `index`.
    ///
    /// Loop descriptors are owned by their consumers: transformations edit
    /// loop structure as they go, so the context hands out fresh ones rather
    /// than sharing a cached copy.
    pub fn build_loop_descriptor(&mut self, index: usize) -> LoopDescriptor {
        let cfg = self.get_cfg(index);
        let dom = self.get_dominator_analysis(index);
        LoopDescriptor::new(&self.module, self.module.function(index), &cfg, &dom)
    }

    /// Reserve a fresh result id, or `None` when the id space is exhausted;
    /// the caller is expected to turn that into pass failure.
    pub fn take_next_id(&mut self) -> Option<Word> {
        self.module.take_next_id()
    }

    /// Allocate a detached instruction into the arena.
    pub fn alloc_inst(&mut self, inst: Instruction) -> UniqueId {
        self.module.alloc_inst(inst)
    }

    /// Record the def and uses of `inst`, updating the def-use relation if it
    /// is valid.
    pub fn analyze_uses(&mut self, inst: UniqueId) {
        if self.valid.contains(Analyses::DEF_USE) {
            if let Some(def_use) = self.def_use.as_mut() {
                def_use.analyze_inst_def_use(self.module.inst(inst));
            }
        }
    }

    /// Rewrite every use of `old_id` to `new_id`. Returns the modified users.
    pub fn replace_all_uses_with(&mut self, old_id: Word, new_id: Word) -> Vec<UniqueId> {
        if !self.valid.contains(Analyses::DEF_USE) || self.def_use.is_none() {
            self.def_use = Some(DefUseManager::new(&self.module));
            self.valid |= Analyses::DEF_USE;
        }
        let def_use = self.def_use.as_mut().unwrap();
        def_use.replace_all_uses_of(&mut self.module, old_id, new_id)
    }

    /// Kill `inst`: remove it from its block and from every valid analysis,
    /// then tombstone its arena slot. The handle stays allocated so stale
    /// references cannot alias a later instruction.
    pub fn kill_inst(&mut self, inst: UniqueId) {
        if self.module.inst(inst).opcode() == spirv::Op::Nop {
            return;
        }

        let structural = {
            let i = self.module.inst(inst);
            i.is_terminator() || i.is_merge() || i.opcode() == spirv::Op::Label
        };

        if self.valid.contains(Analyses::DEF_USE) {
            if let Some(def_use) = self.def_use.as_mut() {
                def_use.clear_inst(self.module.inst(inst));
            }
        }

        // Detach from the containing block, if any.
        let block = self
            .instr_to_block
            .as_ref()
            .and_then(|map| map.get(&inst).copied())
            .or_else(|| self.find_block_of(inst));
        if let Some(block_id) = block {
            if let Some(function_index) = self.function_of_block(block_id) {
                if let Some(bb) = self.module.function_mut(function_index).block_mut(block_id) {
                    bb.remove(inst);
                }
            }
        }
        if let Some(map) = self.instr_to_block.as_mut() {
            map.remove(&inst);
        }

        self.module.tombstone_inst(inst);
        self.kill_set.push(inst);

        if structural {
            self.invalidate(
                Analyses::CFG
                    | Analyses::DOMINATOR
                    | Analyses::POST_DOMINATOR
                    | Analyses::LOOP_ANALYSIS,
            );
        }
    }

    /// Drain the kill set accumulated since the last pass boundary.
    pub fn take_kill_set(&mut self) -> Vec<UniqueId> {
        std::mem::take(&mut self.kill_set)
    }

    /// Index of the function containing the block `id`.
    pub fn function_of_block(&self, id: Word) -> Option<usize> {
        self.module
            .functions()
            .iter()
            .position(|f| f.block(id).is_some())
    }

    fn find_block_of(&self, inst: UniqueId) -> Option<Word> {
        for function in self.module.functions() {
            for block in function.blocks() {
                if block.contains(inst) {
                    return Some(block.id());
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::test_util::FunctionBuilderHarness;

    #[test]
    fn kill_inst_tombstones_and_detaches() {
        let mut h = FunctionBuilderHarness::new();
        let mut sum = 0;
        let cl = h.counted_loop_with_body(0, 10, 1, |h, cl| {
            let two = h.i32_constant(2);
            sum = h.iadd(cl.body, cl.phi, two);
        });
        let mut ctx = h.finish_ctx();

        let def_use = ctx.get_def_use_mgr();
        let add = def_use.get_def(sum).unwrap();
        assert!(ctx.get_instr_block(add).is_some());

        ctx.kill_inst(add);

        // The slot is a tombstone, the block no longer lists it, and the
        // kill set records it until the pass boundary.
        assert_eq!(ctx.module().inst(add).opcode(), spirv::Op::Nop);
        assert_eq!(ctx.get_instr_block(add), None);
        let body = ctx.module().function(0).block(cl.body).unwrap();
        assert!(!body.contains(add));
        assert_eq!(ctx.take_kill_set(), vec![add]);
        assert!(ctx.take_kill_set().is_empty());

        // The def-use relation forgot the definition.
        assert_eq!(ctx.get_def_use_mgr().get_def(sum), None);

        // Killing twice is a no-op.
        ctx.kill_inst(add);
        assert!(ctx.take_kill_set().is_empty());
    }

    #[test]
    fn killing_a_terminator_invalidates_structure() {
        let mut h = FunctionBuilderHarness::new();
        let cl = h.counted_loop(0, 10, 1);
        let mut ctx = h.finish_ctx();

        let _ = ctx.get_cfg(0);
        let _ = ctx.get_dominator_analysis(0);
        assert!(ctx.is_valid(Analyses::CFG | Analyses::DOMINATOR));

        let term = {
            let module = ctx.module();
            module
                .function(0)
                .block(cl.cond_block)
                .unwrap()
                .terminator_uid(module)
                .unwrap()
        };
        ctx.kill_inst(term);
        assert!(!ctx.is_valid(Analyses::CFG));
        assert!(!ctx.is_valid(Analyses::DOMINATOR));
    }

    #[test]
    fn replace_all_uses_with_updates_module() {
        let mut h = FunctionBuilderHarness::new();
        let mut sum = 0;
        let cl = h.counted_loop_with_body(0, 10, 1, |h, cl| {
            let two = h.i32_constant(2);
            sum = h.iadd(cl.body, cl.phi, two);
        });
        let three = {
            let mut b = crate::InstructionBuilder::new(h.ctx(), 0, cl.body);
            b.get_or_add_i32_constant(3).unwrap()
        };
        let mut ctx = h.finish_ctx();

        // The add has no users; replacing its uses touches nothing, but the
        // dead definition is still registered.
        let modified = ctx.replace_all_uses_with(sum, three);
        assert_eq!(modified.len(), 0);

        // The phi, by contrast, has users to rewrite.
        let modified = ctx.replace_all_uses_with(cl.phi, three);
        assert!(!modified.is_empty());
        for user in modified {
            let mut reads_phi = false;
            ctx.module().inst(user).for_each_id(|_, id| {
                reads_phi |= id == cl.phi;
            });
            assert!(!reads_phi);
        }
    }
}
