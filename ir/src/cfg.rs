use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::{Function, Module, Word};

/// The control-flow graph of one function: predecessor and successor lists
/// per block, computed from terminator operands.
///
/// Block mutation is handled by forgetting and re-registering edges; passes
/// that restructure whole regions instead invalidate the graph and rebuild.
#[derive(Debug, Default, Clone)]
pub struct ControlFlowGraph {
    entry: Word,
    preds: FxHashMap<Word, Vec<Word>>,
    succs: FxHashMap<Word, Vec<Word>>,
}

impl ControlFlowGraph {
    pub fn new(module: &Module, function: &Function) -> Self {
        let mut cfg = Self {
            entry: function.entry().map(|bb| bb.id()).unwrap_or(0),
            ..Default::default()
        };
        for block in function.blocks() {
            cfg.preds.entry(block.id()).or_default();
            cfg.succs.entry(block.id()).or_default();
        }
        for block in function.blocks() {
            cfg.register_block_edges(block.id(), block.successors(module));
        }
        cfg
    }

    #[inline]
    pub fn entry(&self) -> Word {
        self.entry
    }

    pub fn preds(&self, block: Word) -> &[Word] {
        self.preds.get(&block).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn succs(&self, block: Word) -> &[Word] {
        self.succs.get(&block).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, block: Word) -> bool {
        self.succs.contains_key(&block)
    }

    /// Register `block` and the edges its terminator currently names.
    pub fn register_block(&mut self, module: &Module, function: &Function, block: Word) {
        let Some(bb) = function.block(block) else {
            return;
        };
        self.preds.entry(block).or_default();
        self.succs.entry(block).or_default();
        self.register_block_edges(block, bb.successors(module));
    }

    fn register_block_edges(&mut self, block: Word, successors: SmallVec<[Word; 2]>) {
        for succ in &successors {
            let preds = self.preds.entry(*succ).or_default();
            if !preds.contains(&block) {
                preds.push(block);
            }
        }
        self.succs.insert(block, successors.into_vec());
    }

    /// Drop `block` and every edge touching it.
    pub fn forget_block(&mut self, block: Word) {
        if let Some(succs) = self.succs.remove(&block) {
            for succ in succs {
                if let Some(preds) = self.preds.get_mut(&succ) {
                    preds.retain(|p| *p != block);
                }
            }
        }
        if let Some(preds) = self.preds.remove(&block) {
            for pred in preds {
                if let Some(succs) = self.succs.get_mut(&pred) {
                    succs.retain(|s| *s != block);
                }
            }
        }
    }

    /// Re-derive the predecessor list of `block` from the recorded successor
    /// lists, dropping predecessors that no longer branch to it.
    pub fn remove_nonexistent_edges(&mut self, block: Word) {
        let stale: Vec<Word> = self
            .preds(block)
            .iter()
            .copied()
            .filter(|pred| !self.succs(*pred).contains(&block))
            .collect();
        if let Some(preds) = self.preds.get_mut(&block) {
            preds.retain(|p| !stale.contains(p));
        }
    }

    /// Blocks reachable from `from`, in post-order over successor edges.
    pub fn post_order(&self, from: Word) -> Vec<Word> {
        let mut order = Vec::with_capacity(self.succs.len());
        let mut visited = rustc_hash::FxHashSet::default();
        // Iterative DFS; the second visit of a frame emits the node.
        let mut stack: Vec<(Word, bool)> = vec![(from, false)];
        while let Some((block, emitted)) = stack.pop() {
            if emitted {
                order.push(block);
                continue;
            }
            if !visited.insert(block) {
                continue;
            }
            stack.push((block, true));
            for succ in self.succs(block).iter().rev() {
                if !visited.contains(succ) {
                    stack.push((*succ, false));
                }
            }
        }
        order
    }

    /// Blocks reachable from the entry, in reverse post-order.
    pub fn reverse_post_order(&self) -> Vec<Word> {
        let mut order = self.post_order(self.entry);
        order.reverse();
        order
    }

    /// Visit every block reachable from `from` in post-order.
    pub fn for_each_block_in_post_order<F: FnMut(Word)>(&self, from: Word, mut f: F) {
        for block in self.post_order(from) {
            f(block);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::test_util::FunctionBuilderHarness;

    #[test]
    fn diamond_preds_and_succs() {
        // entry -> (then | else) -> exit
        let mut h = FunctionBuilderHarness::new();
        let entry = h.new_block();
        let then_bb = h.new_block();
        let else_bb = h.new_block();
        let exit = h.new_block();
        let cond = h.bool_constant(true);
        h.branch_conditional_with_merge(entry, cond, then_bb, else_bb, exit);
        h.branch(then_bb, exit);
        h.branch(else_bb, exit);
        h.ret(exit);
        let module = h.finish();
        let function = module.function(0);

        let cfg = super::ControlFlowGraph::new(&module, function);
        assert_eq!(cfg.succs(entry), &[then_bb, else_bb]);
        assert_eq!(cfg.preds(exit), &[then_bb, else_bb]);

        let post = cfg.post_order(entry);
        assert_eq!(*post.last().unwrap(), entry);
        assert_eq!(post[0], exit);
    }

    #[test]
    fn edges_can_be_forgotten_and_reregistered() {
        let mut h = FunctionBuilderHarness::new();
        let entry = h.new_block();
        let mid = h.new_block();
        let exit = h.new_block();
        h.branch(entry, mid);
        h.branch(mid, exit);
        h.ret(exit);
        let module = h.finish();
        let function = module.function(0);

        let mut cfg = super::ControlFlowGraph::new(&module, function);
        cfg.forget_block(mid);
        assert!(!cfg.contains(mid));
        assert!(cfg.preds(exit).is_empty());

        cfg.register_block(&module, function, mid);
        assert_eq!(cfg.succs(mid), &[exit]);
        assert_eq!(cfg.preds(exit), &[mid]);

        // Stale predecessor records are dropped against the successor lists.
        cfg.forget_block(entry);
        cfg.remove_nonexistent_edges(mid);
        assert!(cfg.preds(mid).is_empty());
    }
}
