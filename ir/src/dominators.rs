use rustc_hash::{FxHashMap, FxHashSet};

use crate::{ControlFlowGraph, Word};

/// Traversal direction for dominator computation.
///
/// `Forward` computes the dominator tree from a synthetic pseudo-entry that
/// precedes the real entry. `Reverse` computes the post-dominator tree from a
/// synthetic pseudo-exit that succeeds every return/kill/unreachable block,
/// with successor and predecessor roles swapped throughout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

#[derive(Debug)]
struct DomNode {
    parent: Option<Word>,
    children: Vec<Word>,
    pre: u32,
    post: u32,
}

/// A dominator or post-dominator tree over the blocks of one function.
///
/// The tree root is a synthetic pseudo-block that never appears in queries;
/// real roots (the entry, or every exit for the reverse direction) have no
/// parent. Each node carries pre- and post-order counters assigned in a
/// single traversal, making [DominatorTree::dominates] a constant-time
/// counter comparison. Blocks not reachable from the chosen start are absent
/// from the tree: queries on them report "not dominating" and no immediate
/// dominator.
#[derive(Debug)]
pub struct DominatorTree {
    direction: Direction,
    nodes: FxHashMap<Word, DomNode>,
    roots: Vec<Word>,
}

impl DominatorTree {
    /// Compute the tree for `cfg` in the given direction.
    pub fn new(cfg: &ControlFlowGraph, direction: Direction) -> Self {
        let mut tree = Self {
            direction,
            nodes: FxHashMap::default(),
            roots: Vec::new(),
        };
        tree.compute(cfg);
        tree
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The children of the synthetic pseudo-root: the entry block, or every
    /// reachable exit block for the reverse direction.
    #[inline]
    pub fn roots(&self) -> &[Word] {
        &self.roots
    }

    /// Whether `block` is reachable, i.e. present in the tree.
    #[inline]
    pub fn contains(&self, block: Word) -> bool {
        self.nodes.contains_key(&block)
    }

    /// Whether `a` (post-)dominates `b`. Reflexive for present blocks; false
    /// whenever either block is absent from the tree.
    pub fn dominates(&self, a: Word, b: Word) -> bool {
        let (Some(na), Some(nb)) = (self.nodes.get(&a), self.nodes.get(&b)) else {
            return false;
        };
        if a == b {
            return true;
        }
        na.pre < nb.pre && na.post > nb.post
    }

    pub fn strictly_dominates(&self, a: Word, b: Word) -> bool {
        a != b && self.dominates(a, b)
    }

    /// The immediate (post-)dominator of `block`, or `None` for roots and
    /// absent blocks.
    pub fn immediate_dominator(&self, block: Word) -> Option<Word> {
        self.nodes.get(&block)?.parent
    }

    /// The blocks immediately dominated by `block`.
    pub fn children(&self, block: Word) -> &[Word] {
        self.nodes
            .get(&block)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    /// All blocks of the tree in depth-first pre-order, roots first.
    pub fn pre_order(&self) -> Vec<Word> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<Word> = self.roots.iter().rev().copied().collect();
        while let Some(block) = stack.pop() {
            order.push(block);
            stack.extend(self.children(block).iter().rev());
        }
        order
    }

    /// Depth-first pre-order of the subtree rooted at `block`, pruning any
    /// subtree for which `prune` returns true.
    pub fn pre_order_from<F: FnMut(Word) -> bool>(&self, block: Word, mut prune: F) -> Vec<Word> {
        let mut order = Vec::new();
        let mut stack = vec![block];
        while let Some(block) = stack.pop() {
            if prune(block) {
                continue;
            }
            order.push(block);
            stack.extend(self.children(block).iter().rev());
        }
        order
    }

    fn compute(&mut self, cfg: &ControlFlowGraph) {
        // Roots of the walk: the entry for the forward direction, every
        // reachable block without successors for the reverse one.
        let roots: Vec<Word> = match self.direction {
            Direction::Forward => vec![cfg.entry()],
            Direction::Reverse => cfg
                .post_order(cfg.entry())
                .into_iter()
                .filter(|block| cfg.succs(*block).is_empty())
                .collect(),
        };
        if roots.is_empty() {
            return;
        }

        // Post-order over the walk direction, with the visited set shared
        // across roots so each block appears once.
        let mut postorder: Vec<Word> = Vec::new();
        let mut visited = FxHashSet::default();
        for root in &roots {
            self.post_order_into(cfg, *root, &mut visited, &mut postorder);
        }

        let index_of: FxHashMap<Word, usize> = postorder
            .iter()
            .enumerate()
            .map(|(index, block)| (*block, index))
            .collect();
        let root_set: FxHashSet<Word> = roots.iter().copied().collect();

        // Cooper-Harvey-Kennedy iterative immediate-dominator computation.
        // `idom[n]` is a post-order index. The synthetic pseudo-root takes
        // the highest index so that intersections from different real roots
        // converge on it instead of cycling.
        let pseudo = postorder.len();
        let mut idom: Vec<Option<usize>> = vec![None; postorder.len() + 1];
        idom[pseudo] = Some(pseudo);
        for root in &roots {
            idom[index_of[root]] = Some(pseudo);
        }
        let mut changed = true;
        while changed {
            changed = false;
            for index in (0..postorder.len()).rev() {
                let block = postorder[index];
                if root_set.contains(&block) {
                    continue;
                }
                let mut new_idom: Option<usize> = None;
                for neighbour in self.walk_preds(cfg, block) {
                    let Some(n_index) = index_of.get(&neighbour).copied() else {
                        continue;
                    };
                    if idom[n_index].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => n_index,
                        Some(current) => Self::intersect(&idom, current, n_index),
                    });
                }
                if new_idom.is_some() && idom[index] != new_idom {
                    idom[index] = new_idom;
                    changed = true;
                }
            }
        }

        // Materialise the tree.
        for (index, block) in postorder.iter().enumerate() {
            let parent = match idom[index] {
                Some(p) if p != pseudo => Some(postorder[p]),
                _ => None,
            };
            self.nodes.insert(
                *block,
                DomNode {
                    parent,
                    children: Vec::new(),
                    pre: 0,
                    post: 0,
                },
            );
        }
        let edges: Vec<(Word, Word)> = self
            .nodes
            .iter()
            .filter_map(|(block, node)| node.parent.map(|parent| (parent, *block)))
            .collect();
        for (parent, child) in edges {
            self.nodes.get_mut(&parent).unwrap().children.push(child);
        }
        for node in self.nodes.values_mut() {
            node.children.sort_unstable();
        }
        self.roots = roots;

        self.assign_counters();
    }

    /// Assign pre/post DFS counters in one traversal of the materialised
    /// tree. Must be re-run if the tree shape is edited in place.
    pub fn reset_df_numbering(&mut self) {
        self.assign_counters();
    }

    fn assign_counters(&mut self) {
        let mut counter = 0u32;
        let roots = self.roots.clone();
        for root in roots {
            // Emulated recursion: (block, entered) frames.
            let mut stack: Vec<(Word, bool)> = vec![(root, false)];
            while let Some((block, entered)) = stack.pop() {
                if entered {
                    counter += 1;
                    self.nodes.get_mut(&block).unwrap().post = counter;
                    continue;
                }
                counter += 1;
                self.nodes.get_mut(&block).unwrap().pre = counter;
                stack.push((block, true));
                let children = self.nodes[&block].children.clone();
                for child in children.into_iter().rev() {
                    stack.push((child, false));
                }
            }
        }
    }

    fn post_order_into(
        &self,
        cfg: &ControlFlowGraph,
        from: Word,
        visited: &mut FxHashSet<Word>,
        out: &mut Vec<Word>,
    ) {
        let mut stack: Vec<(Word, bool)> = vec![(from, false)];
        while let Some((block, emitted)) = stack.pop() {
            if emitted {
                out.push(block);
                continue;
            }
            if !visited.insert(block) {
                continue;
            }
            stack.push((block, true));
            for next in self.walk_succs(cfg, block).iter().rev() {
                if !visited.contains(next) {
                    stack.push((*next, false));
                }
            }
        }
    }

    fn walk_succs<'c>(&self, cfg: &'c ControlFlowGraph, block: Word) -> &'c [Word] {
        match self.direction {
            Direction::Forward => cfg.succs(block),
            Direction::Reverse => cfg.preds(block),
        }
    }

    fn walk_preds<'c>(&self, cfg: &'c ControlFlowGraph, block: Word) -> Vec<Word> {
        match self.direction {
            Direction::Forward => cfg.preds(block).to_vec(),
            Direction::Reverse => cfg.succs(block).to_vec(),
        }
    }

    fn intersect(idom: &[Option<usize>], mut a: usize, mut b: usize) -> usize {
        while a != b {
            while a < b {
                a = idom[a].expect("intersect reached an unprocessed node");
            }
            while b < a {
                b = idom[b].expect("intersect reached an unprocessed node");
            }
        }
        a
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{Direction, DominatorTree};
    use crate::{test_util::FunctionBuilderHarness, ControlFlowGraph};

    #[test]
    fn diamond_dominators() {
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
        let cfg = ControlFlowGraph::new(&module, function);

        let dom = DominatorTree::new(&cfg, Direction::Forward);
        assert!(dom.dominates(entry, exit));
        assert!(dom.dominates(entry, entry));
        assert!(!dom.dominates(then_bb, exit));
        assert_eq!(dom.immediate_dominator(exit), Some(entry));
        assert_eq!(dom.immediate_dominator(entry), None);

        let post = DominatorTree::new(&cfg, Direction::Reverse);
        assert!(post.dominates(exit, entry));
        assert!(post.dominates(exit, then_bb));
        assert!(!post.dominates(then_bb, entry));
        assert_eq!(post.immediate_dominator(entry), Some(exit));
    }

    #[test]
    fn dominance_is_transitive_and_antisymmetric() {
        // entry -> a -> b -> exit, straight line.
        let mut h = FunctionBuilderHarness::new();
        let entry = h.new_block();
        let a = h.new_block();
        let b = h.new_block();
        let exit = h.new_block();
        h.branch(entry, a);
        h.branch(a, b);
        h.branch(b, exit);
        h.ret(exit);
        let module = h.finish();
        let function = module.function(0);
        let cfg = ControlFlowGraph::new(&module, function);
        let dom = DominatorTree::new(&cfg, Direction::Forward);

        assert!(dom.dominates(entry, a) && dom.dominates(a, b));
        assert!(dom.dominates(entry, b));
        assert!(!dom.dominates(b, a));
        assert!(dom.strictly_dominates(a, b) && !dom.strictly_dominates(b, a));
    }

    #[test]
    fn unreachable_blocks_are_absent() {
        let mut h = FunctionBuilderHarness::new();
        let entry = h.new_block();
        let orphan = h.new_block();
        let exit = h.new_block();
        h.branch(entry, exit);
        h.branch(orphan, exit);
        h.ret(exit);
        let module = h.finish();
        let function = module.function(0);
        let cfg = ControlFlowGraph::new(&module, function);
        let dom = DominatorTree::new(&cfg, Direction::Forward);

        assert!(!dom.contains(orphan));
        assert!(!dom.dominates(orphan, exit));
        assert!(!dom.dominates(entry, orphan));
        assert_eq!(dom.immediate_dominator(orphan), None);
    }

    /// The constant-time counter test agrees with the definition by
    /// parent-chain walking, for every pair of blocks.
    #[test]
    fn counter_test_matches_tree_walk() {
        let mut h = FunctionBuilderHarness::new();
        h.nested_loops();
        let module = h.finish();
        let function = module.function(0);
        let cfg = ControlFlowGraph::new(&module, function);
        let dom = DominatorTree::new(&cfg, Direction::Forward);

        let blocks: Vec<_> = function.blocks().iter().map(|bb| bb.id()).collect();
        for a in &blocks {
            for b in &blocks {
                let mut walks = false;
                let mut current = Some(*b);
                while let Some(block) = current {
                    if block == *a {
                        walks = true;
                        break;
                    }
                    current = dom.immediate_dominator(block);
                }
                assert_eq!(
                    dom.dominates(*a, *b),
                    walks,
                    "counter test disagrees for ({a}, {b})"
                );
            }
        }
    }

    /// A loop that breaks to a block ending in OpUnreachable has two roots in
    /// the post-dominator tree: the break target and the merge. Neither
    /// post-dominates blocks under the other.
    #[test]
    fn post_dominators_with_unreachable_break_target() {
        let mut h = FunctionBuilderHarness::new();
        let entry = h.new_block();
        let header = h.new_block();
        let body = h.new_block();
        let cont = h.new_block();
        let latch = h.new_block();
        let dead_end = h.new_block();
        let merge = h.new_block();
        let break_cond = h.bool_constant(false);
        let exit_cond = h.bool_constant(true);

        h.branch(entry, header);
        h.loop_merge(header, merge, latch);
        h.branch(header, body);
        h.branch_conditional(body, break_cond, dead_end, cont);
        h.branch_conditional(cont, exit_cond, merge, latch);
        h.branch(latch, header);
        h.unreachable(dead_end);
        h.ret(merge);
        let module = h.finish();
        let function = module.function(0);
        let cfg = ControlFlowGraph::new(&module, function);

        let post = DominatorTree::new(&cfg, Direction::Reverse);
        assert!(post.roots().contains(&dead_end));
        assert!(post.roots().contains(&merge));
        assert!(!post.dominates(merge, dead_end));
        assert!(!post.dominates(dead_end, merge));
        assert_eq!(post.immediate_dominator(merge), None);
    }
}
