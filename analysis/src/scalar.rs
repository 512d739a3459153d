mod simplify;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use spirv::Op;

use spvopt_ir::{
    DefUseManager, Function, InstrToBlockMap, Loop, LoopDescriptor, Module, UniqueId, Word,
};

/// Handle to a node in a [ScalarEvolutionAnalysis] pool.
///
/// Nodes are hash-consed: two structurally equal expressions receive the
/// same handle, so handle equality within one analysis is exactly structural
/// equality of simplified expressions. Handles from different analyses must
/// never be compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SENodeId(u32);

impl SENodeId {
    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// A scalar-evolution expression node.
///
/// `Add` and `Multiply` keep their children sorted, making structural
/// equality order-insensitive. A `Recurrent` node describes the value
/// `offset + coefficient * trip(loop)` inside the loop identified by its
/// header block.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SENode {
    Constant(i64),
    Recurrent {
        loop_header: Word,
        offset: SENodeId,
        coefficient: SENodeId,
    },
    Add(SmallVec<[SENodeId; 2]>),
    Multiply(SmallVec<[SENodeId; 2]>),
    Negative(SENodeId),
    ValueUnknown(UniqueId),
    CantCompute,
}

impl SENode {
    #[inline]
    pub fn is_constant(&self) -> bool {
        matches!(self, Self::Constant(_))
    }

    #[inline]
    pub fn is_recurrent(&self) -> bool {
        matches!(self, Self::Recurrent { .. })
    }

    #[inline]
    pub fn is_cant_compute(&self) -> bool {
        matches!(self, Self::CantCompute)
    }

    fn children(&self) -> SmallVec<[SENodeId; 2]> {
        match self {
            Self::Add(children) | Self::Multiply(children) => children.clone(),
            Self::Negative(child) => SmallVec::from_slice(&[*child]),
            Self::Recurrent {
                offset,
                coefficient,
                ..
            } => SmallVec::from_slice(&[*offset, *coefficient]),
            _ => SmallVec::new(),
        }
    }
}

/// Assigns to instructions a DAG of scalar-evolution expressions describing
/// their values in terms of recurrences over the enclosing loops.
///
/// Construction is recursive over the def-use graph from a seed instruction.
/// Cycles through loop-header phis are broken by registering a placeholder
/// for the phi before analysing its back-edge expression; for a linear step
/// the placeholder cancels out of the recovered coefficient.
pub struct ScalarEvolutionAnalysis<'a> {
    module: &'a Module,
    function: &'a Function,
    def_use: &'a DefUseManager,
    descriptor: &'a LoopDescriptor,
    block_of: &'a InstrToBlockMap,
    nodes: Vec<SENode>,
    interner: FxHashMap<SENode, SENodeId>,
    inst_map: FxHashMap<UniqueId, SENodeId>,
}

impl<'a> ScalarEvolutionAnalysis<'a> {
    pub fn new(
        module: &'a Module,
        function: &'a Function,
        def_use: &'a DefUseManager,
        descriptor: &'a LoopDescriptor,
        block_of: &'a InstrToBlockMap,
    ) -> Self {
        Self {
            module,
            function,
            def_use,
            descriptor,
            block_of,
            nodes: Vec::new(),
            interner: FxHashMap::default(),
            inst_map: FxHashMap::default(),
        }
    }

    #[inline]
    pub fn node(&self, id: SENodeId) -> &SENode {
        &self.nodes[id.index()]
    }

    /// Intern `node`, returning the canonical handle for its structure.
    pub fn get_cached_or_add(&mut self, node: SENode) -> SENodeId {
        if let Some(existing) = self.interner.get(&node) {
            return *existing;
        }
        let id = SENodeId(self.nodes.len() as u32);
        self.nodes.push(node.clone());
        self.interner.insert(node, id);
        id
    }

    pub fn create_constant(&mut self, value: i64) -> SENodeId {
        self.get_cached_or_add(SENode::Constant(value))
    }

    pub fn create_value_unknown(&mut self, inst: UniqueId) -> SENodeId {
        self.get_cached_or_add(SENode::ValueUnknown(inst))
    }

    pub fn create_cant_compute(&mut self) -> SENodeId {
        self.get_cached_or_add(SENode::CantCompute)
    }

    pub fn create_add(&mut self, lhs: SENodeId, rhs: SENodeId) -> SENodeId {
        let mut children = SmallVec::from_slice(&[lhs, rhs]);
        children.sort_unstable();
        self.get_cached_or_add(SENode::Add(children))
    }

    pub fn create_multiply(&mut self, lhs: SENodeId, rhs: SENodeId) -> SENodeId {
        let mut children = SmallVec::from_slice(&[lhs, rhs]);
        children.sort_unstable();
        self.get_cached_or_add(SENode::Multiply(children))
    }

    pub fn create_negation(&mut self, operand: SENodeId) -> SENodeId {
        self.get_cached_or_add(SENode::Negative(operand))
    }

    /// `lhs - rhs`, expressed as `lhs + (-rhs)`.
    pub fn create_subtraction(&mut self, lhs: SENodeId, rhs: SENodeId) -> SENodeId {
        let negated = self.create_negation(rhs);
        self.create_add(lhs, negated)
    }

    pub fn create_recurrent(
        &mut self,
        loop_header: Word,
        offset: SENodeId,
        coefficient: SENodeId,
    ) -> SENodeId {
        self.get_cached_or_add(SENode::Recurrent {
            loop_header,
            offset,
            coefficient,
        })
    }

    /// The folded value of `id` when it is a constant node.
    pub fn constant_of(&self, id: SENodeId) -> Option<i64> {
        match self.node(id) {
            SENode::Constant(value) => Some(*value),
            _ => None,
        }
    }

    /// Build the expression for the instruction defining `result_id`.
    pub fn analyze_id(&mut self, result_id: Word) -> SENodeId {
        match self.def_use.get_def(result_id) {
            Some(uid) => self.analyze_instruction(uid),
            None => self.create_cant_compute(),
        }
    }

    /// Build the expression DAG for `inst` by traversing its use-def chain.
    pub fn analyze_instruction(&mut self, inst: UniqueId) -> SENodeId {
        if let Some(cached) = self.inst_map.get(&inst) {
            return *cached;
        }
        let node = match self.module.inst(inst).opcode() {
            Op::Phi => self.analyze_phi(inst),
            Op::Constant => self.analyze_constant(inst),
            Op::IAdd => self.analyze_add_op(inst, false),
            Op::ISub => self.analyze_add_op(inst, true),
            Op::IMul => self.analyze_multiply_op(inst),
            _ => {
                if self.module.inst(inst).has_result_id() {
                    self.create_value_unknown(inst)
                } else {
                    self.create_cant_compute()
                }
            }
        };
        self.inst_map.insert(inst, node);
        node
    }

    fn analyze_constant(&mut self, inst: UniqueId) -> SENodeId {
        match self.module.int_constant_value(self.module.inst(inst)) {
            Some(value) => self.create_constant(value),
            None => self.create_cant_compute(),
        }
    }

    fn analyze_add_op(&mut self, inst: UniqueId, is_subtraction: bool) -> SENodeId {
        let (lhs_id, rhs_id) = {
            let i = self.module.inst(inst);
            (i.single_word_operand(0), i.single_word_operand(1))
        };
        let lhs = self.analyze_id(lhs_id);
        let rhs = self.analyze_id(rhs_id);
        if is_subtraction {
            self.create_subtraction(lhs, rhs)
        } else {
            self.create_add(lhs, rhs)
        }
    }

    fn analyze_multiply_op(&mut self, inst: UniqueId) -> SENodeId {
        let (lhs_id, rhs_id) = {
            let i = self.module.inst(inst);
            (i.single_word_operand(0), i.single_word_operand(1))
        };
        let lhs = self.analyze_id(lhs_id);
        let rhs = self.analyze_id(rhs_id);
        self.create_multiply(lhs, rhs)
    }

    /// A phi in a loop header with one incoming value from outside and one
    /// from the latch becomes a recurrent expression; any other phi is an
    /// opaque value.
    fn analyze_phi(&mut self, inst: UniqueId) -> SENodeId {
        let Some(block) = self.block_of.get(&inst).copied() else {
            return self.create_value_unknown(inst);
        };
        let Some(loop_index) = self.descriptor.loop_of(block) else {
            return self.create_value_unknown(inst);
        };
        let l = self.descriptor.get(loop_index);
        if l.header() != block {
            return self.create_value_unknown(inst);
        }

        let incoming: Vec<(Word, Word)> = self.module.inst(inst).phi_incoming().collect();
        if incoming.len() != 2 {
            return self.create_cant_compute();
        }
        let mut init = None;
        let mut step = None;
        for (value, pred) in incoming {
            if pred == l.latch() {
                step = Some(value);
            } else if !l.is_inside(pred) {
                init = Some(value);
            }
        }
        let (Some(init), Some(step)) = (init, step) else {
            return self.create_cant_compute();
        };

        // Pre-register the phi as an opaque placeholder so the back-edge
        // recursion terminates; for a linear step the placeholder cancels
        // out of `step_expr - phi`.
        let placeholder = self.create_value_unknown(inst);
        self.inst_map.insert(inst, placeholder);

        let header = l.header();
        let init_node = self.analyze_id(init);
        let offset = self.simplify_expression(init_node);
        let step_node = self.analyze_id(step);
        let delta = self.create_subtraction(step_node, placeholder);
        let coefficient = self.simplify_expression(delta);

        if self.node(offset).is_cant_compute()
            || self.node(coefficient).is_cant_compute()
            || self.contains_node(coefficient, placeholder)
        {
            return self.create_cant_compute();
        }
        self.create_recurrent(header, offset, coefficient)
    }

    /// Whether `needle` appears anywhere in the DAG under `root`.
    fn contains_node(&self, root: SENodeId, needle: SENodeId) -> bool {
        let mut stack = vec![root];
        let mut seen = FxHashSet::default();
        while let Some(id) = stack.pop() {
            if id == needle {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            stack.extend(self.node(id).children());
        }
        false
    }

    /// All distinct recurrent nodes in the DAG under `root`.
    pub fn collect_recurrent_nodes(&self, root: SENodeId) -> Vec<SENodeId> {
        let mut out = Vec::new();
        self.visit_dag(root, |analysis, id| {
            if analysis.node(id).is_recurrent() {
                out.push(id);
            }
        });
        out
    }

    /// All distinct value-unknown nodes in the DAG under `root`.
    pub fn collect_value_unknown_nodes(&self, root: SENodeId) -> Vec<SENodeId> {
        let mut out = Vec::new();
        self.visit_dag(root, |analysis, id| {
            if matches!(analysis.node(id), SENode::ValueUnknown(_)) {
                out.push(id);
            }
        });
        out
    }

    /// The headers of the loops whose recurrences appear under `root`.
    pub fn loops_in(&self, root: SENodeId) -> FxHashSet<Word> {
        let mut loops = FxHashSet::default();
        self.visit_dag(root, |analysis, id| {
            if let SENode::Recurrent { loop_header, .. } = analysis.node(id) {
                loops.insert(*loop_header);
            }
        });
        loops
    }

    fn visit_dag<F: FnMut(&Self, SENodeId)>(&self, root: SENodeId, mut f: F) {
        let mut stack = vec![root];
        let mut seen = FxHashSet::default();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            f(self, id);
            stack.extend(self.node(id).children());
        }
    }

    /// Whether the value of `node` is unchanged across iterations of `l`.
    pub fn is_loop_invariant(&self, l: &Loop, node: SENodeId) -> bool {
        let mut invariant = true;
        self.visit_dag(node, |analysis, id| match analysis.node(id) {
            SENode::Recurrent { loop_header, .. } => {
                if l.is_inside(*loop_header) {
                    invariant = false;
                }
            }
            SENode::ValueUnknown(inst) => {
                if let Some(block) = analysis.block_of.get(inst) {
                    if l.is_inside(*block) {
                        invariant = false;
                    }
                }
            }
            SENode::CantCompute => invariant = false,
            _ => {}
        });
        invariant
    }

    /// Whether `node` is provably greater than zero (`Some(true)`), provably
    /// not (`Some(false)`), or unknown.
    pub fn is_always_greater_than_zero(&self, node: SENodeId) -> Option<bool> {
        self.signum(node).map(|s| s > 0)
    }

    fn signum(&self, node: SENodeId) -> Option<i64> {
        match self.node(node) {
            SENode::Constant(value) => Some(value.signum()),
            SENode::Negative(child) => self.signum(*child).map(|s| -s),
            _ => None,
        }
    }

    #[inline]
    pub(crate) fn module(&self) -> &'a Module {
        self.module
    }

    #[inline]
    pub(crate) fn function(&self) -> &'a Function {
        self.function
    }

    #[inline]
    pub(crate) fn def_use(&self) -> &'a DefUseManager {
        self.def_use
    }

    #[inline]
    pub(crate) fn descriptor(&self) -> &'a LoopDescriptor {
        self.descriptor
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use spvopt_ir::{
        test_util::FunctionBuilderHarness, ControlFlowGraph, DefUseManager, Direction,
        DominatorTree, LoopDescriptor,
    };

    use super::*;

    struct Fixture {
        module: Module,
        phi: Word,
        derived: Word,
        header: Word,
    }

    fn counted_loop_with_derived() -> Fixture {
        // for (i = 0; i < 10; ++i) { t = i * 4 + 3; }
        let mut h = FunctionBuilderHarness::new();
        let mut derived = 0;
        let cl = h.counted_loop_with_body(0, 10, 1, |h, cl| {
            let four = h.i32_constant(4);
            let three = h.i32_constant(3);
            let scaled = h.imul(cl.body, cl.phi, four);
            derived = h.iadd(cl.body, scaled, three);
        });
        Fixture {
            module: h.finish(),
            phi: cl.phi,
            derived,
            header: cl.header,
        }
    }

    fn with_analysis<R>(
        fixture: &Fixture,
        f: impl FnOnce(&mut ScalarEvolutionAnalysis<'_>) -> R,
    ) -> R {
        let module = &fixture.module;
        let function = module.function(0);
        let cfg = ControlFlowGraph::new(module, function);
        let dom = DominatorTree::new(&cfg, Direction::Forward);
        let descriptor = LoopDescriptor::new(module, function, &cfg, &dom);
        let def_use = DefUseManager::new(module);
        let mut block_of = InstrToBlockMap::default();
        for block in function.blocks() {
            block_of.insert(block.label(), block.id());
            for uid in block.instructions() {
                block_of.insert(*uid, block.id());
            }
        }
        let mut analysis =
            ScalarEvolutionAnalysis::new(module, function, &def_use, &descriptor, &block_of);
        f(&mut analysis)
    }

    #[test]
    fn induction_phi_becomes_recurrent() {
        let fixture = counted_loop_with_derived();
        let header = fixture.header;
        with_analysis(&fixture, |scev| {
            let node = scev.analyze_id(fixture.phi);
            let node = scev.simplify_expression(node);
            match scev.node(node).clone() {
                SENode::Recurrent {
                    loop_header,
                    offset,
                    coefficient,
                } => {
                    assert_eq!(loop_header, header);
                    assert_eq!(scev.constant_of(offset), Some(0));
                    assert_eq!(scev.constant_of(coefficient), Some(1));
                }
                other => panic!("expected recurrent, got {other:?}"),
            }
        });
    }

    #[test]
    fn derived_expression_folds_into_single_recurrent() {
        let fixture = counted_loop_with_derived();
        with_analysis(&fixture, |scev| {
            // i * 4 + 3 over Rec(0, 1) is Rec(3, 4).
            let node = scev.analyze_id(fixture.derived);
            let node = scev.simplify_expression(node);
            match scev.node(node).clone() {
                SENode::Recurrent {
                    offset,
                    coefficient,
                    ..
                } => {
                    assert_eq!(scev.constant_of(offset), Some(3));
                    assert_eq!(scev.constant_of(coefficient), Some(4));
                }
                other => panic!("expected recurrent, got {other:?}"),
            }
        });
    }

    #[test]
    fn simplification_is_idempotent_on_instruction_expressions() {
        let fixture = counted_loop_with_derived();
        with_analysis(&fixture, |scev| {
            for seed in [fixture.phi, fixture.derived] {
                let node = scev.analyze_id(seed);
                let once = scev.simplify_expression(node);
                let twice = scev.simplify_expression(once);
                assert_eq!(once, twice);
            }
        });
    }
}
