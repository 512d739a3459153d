//! Expression simplification: rewriting an SE DAG as a flat weighted sum.
//!
//! A graph of additions, multiplications, and negations over constants,
//! unknowns, and recurrents collapses into one `Add` whose children are the
//! distinct terms with folded integer coefficients. `X + X*2 + Y - Y + 34 -
//! 17` becomes `3*X + 17`; recurrents over the same loop merge, and when a
//! single recurrent remains the surrounding terms fold into its offset, so
//! `Rec(0, 1) + 1` becomes `Rec(1, 1)`.

use std::collections::BTreeMap;

use spvopt_ir::Word;

use super::{ScalarEvolutionAnalysis, SENode, SENodeId};

#[derive(Default)]
struct Accumulators {
    constant: i64,
    /// Distinct opaque terms (unknowns and recurrents) to their net integer
    /// coefficient. Ordered so rebuild order is deterministic.
    terms: BTreeMap<SENodeId, i64>,
    /// Children that do not fit the weighted-sum grammar, with the negation
    /// state they were encountered under.
    opaque: Vec<(SENodeId, bool)>,
}

impl ScalarEvolutionAnalysis<'_> {
    /// Canonicalise `node`. Idempotent: simplifying a simplified node
    /// returns the same handle.
    pub fn simplify_expression(&mut self, node: SENodeId) -> SENodeId {
        match self.node(node) {
            SENode::Add(_) | SENode::Multiply(_) | SENode::Negative(_) => {}
            _ => return node,
        }

        let mut acc = Accumulators::default();
        if !self.gather(node, false, &mut acc) {
            return self.create_cant_compute();
        }

        // Rebuild each accumulated term with its folded coefficient.
        let mut children: Vec<SENodeId> = Vec::new();
        let terms: Vec<(SENodeId, i64)> = acc.terms.into_iter().collect();
        for (term, count) in terms {
            if count == 0 {
                continue;
            }
            let child = match self.node(term).clone() {
                SENode::Recurrent {
                    loop_header,
                    offset,
                    coefficient,
                } if count != 1 => {
                    // n * Rec(c, a) folds to Rec(n*c, n*a).
                    let n = self.create_constant(count);
                    let offset = self.create_multiply(offset, n);
                    let offset = self.simplify_expression(offset);
                    let coefficient = self.create_multiply(coefficient, n);
                    let coefficient = self.simplify_expression(coefficient);
                    self.create_recurrent(loop_header, offset, coefficient)
                }
                _ if count == 1 => term,
                _ if count == -1 => self.create_negation(term),
                _ => {
                    let n = self.create_constant(count);
                    self.create_multiply(n, term)
                }
            };
            children.push(child);
        }
        for (opaque, negated) in std::mem::take(&mut acc.opaque) {
            children.push(if negated {
                self.create_negation(opaque)
            } else {
                opaque
            });
        }
        if acc.constant != 0 {
            children.push(self.create_constant(acc.constant));
        }

        let children = self.fold_recurrent_terms(children);
        let children = self.fold_into_single_recurrent(children);

        match children.len() {
            0 => self.create_constant(0),
            1 => children[0],
            _ => self.create_add_many(children),
        }
    }

    /// Descend the DAG collecting the weighted-sum accumulators. Returns
    /// false when a `CantCompute` is encountered anywhere.
    fn gather(&mut self, node: SENodeId, negated: bool, acc: &mut Accumulators) -> bool {
        let sign: i64 = if negated { -1 } else { 1 };
        match self.node(node).clone() {
            SENode::Constant(value) => {
                acc.constant = acc.constant.wrapping_add(value.wrapping_mul(sign));
            }
            SENode::ValueUnknown(_) | SENode::Recurrent { .. } => {
                *acc.terms.entry(node).or_insert(0) += sign;
            }
            SENode::Add(children) => {
                for child in children {
                    if !self.gather(child, negated, acc) {
                        return false;
                    }
                }
            }
            SENode::Negative(child) => {
                if !self.gather(child, !negated, acc) {
                    return false;
                }
            }
            SENode::Multiply(_) => match self.constant_times_term(node) {
                Some((k, Some(term))) => {
                    *acc.terms.entry(term).or_insert(0) += k.wrapping_mul(sign);
                }
                Some((k, None)) => {
                    acc.constant = acc.constant.wrapping_add(k.wrapping_mul(sign));
                }
                None => acc.opaque.push((node, negated)),
            },
            SENode::CantCompute => return false,
        }
        true
    }

    /// Rewrite `node` as `k * term` when it is a (possibly nested) product
    /// of constants, negations, and at most one opaque term. `term` of
    /// `None` means the node folds to the constant `k` alone.
    fn constant_times_term(&self, node: SENodeId) -> Option<(i64, Option<SENodeId>)> {
        match self.node(node).clone() {
            SENode::Constant(value) => Some((value, None)),
            SENode::ValueUnknown(_) | SENode::Recurrent { .. } => Some((1, Some(node))),
            SENode::Negative(child) => {
                let (k, term) = self.constant_times_term(child)?;
                Some((k.wrapping_neg(), term))
            }
            SENode::Multiply(children) => {
                let mut k = 1i64;
                let mut term = None;
                for child in children {
                    let (child_k, child_term) = self.constant_times_term(child)?;
                    k = k.wrapping_mul(child_k);
                    match (term, child_term) {
                        (Some(_), Some(_)) => return None,
                        (None, t) => term = t,
                        (t, None) => term = t,
                    }
                }
                Some((k, term))
            }
            _ => None,
        }
    }

    /// Merge recurrent children over the same loop: the coefficients and
    /// offsets sum per group and each loop contributes one recurrent.
    fn fold_recurrent_terms(&mut self, children: Vec<SENodeId>) -> Vec<SENodeId> {
        let mut per_loop: BTreeMap<Word, Vec<(SENodeId, SENodeId)>> = BTreeMap::new();
        let mut rest = Vec::with_capacity(children.len());
        for child in children {
            match self.node(child).clone() {
                SENode::Recurrent {
                    loop_header,
                    offset,
                    coefficient,
                } => per_loop
                    .entry(loop_header)
                    .or_default()
                    .push((offset, coefficient)),
                _ => rest.push(child),
            }
        }
        for (loop_header, recs) in per_loop {
            let (offset, coefficient) = if recs.len() == 1 {
                recs[0]
            } else {
                let offsets: Vec<SENodeId> = recs.iter().map(|(o, _)| *o).collect();
                let coefficients: Vec<SENodeId> = recs.iter().map(|(_, c)| *c).collect();
                let offset = self.create_add_many(offsets);
                let offset = self.simplify_expression(offset);
                let coefficient = self.create_add_many(coefficients);
                let coefficient = self.simplify_expression(coefficient);
                (offset, coefficient)
            };
            // A recurrence that no longer advances is just its offset.
            if self.scev_constant_is_zero(coefficient) {
                rest.push(offset);
            } else {
                rest.push(self.create_recurrent(loop_header, offset, coefficient));
            }
        }
        rest
    }

    fn scev_constant_is_zero(&self, node: SENodeId) -> bool {
        matches!(self.node(node), SENode::Constant(0))
    }

    /// When exactly one recurrent term remains in the whole expression, the
    /// other terms fold into its offset: `Rec(c, a) + k` is `Rec(c + k, a)`.
    fn fold_into_single_recurrent(&mut self, children: Vec<SENodeId>) -> Vec<SENodeId> {
        if children.len() < 2 {
            return children;
        }
        let mut recurrent = None;
        let mut rest = Vec::with_capacity(children.len() - 1);
        for child in &children {
            if self.node(*child).is_recurrent() {
                if recurrent.is_some() {
                    return children;
                }
                recurrent = Some(*child);
            } else {
                // A recurrent buried deeper (e.g. inside an unfoldable
                // multiply) blocks the rewrite.
                if !self.collect_recurrent_nodes(*child).is_empty() {
                    return children;
                }
                rest.push(*child);
            }
        }
        let Some(recurrent) = recurrent else {
            return children;
        };
        let SENode::Recurrent {
            loop_header,
            offset,
            coefficient,
        } = self.node(recurrent).clone()
        else {
            unreachable!();
        };
        let extra = self.create_add_many(rest);
        let offset = self.create_add(offset, extra);
        let offset = self.simplify_expression(offset);
        vec![self.create_recurrent(loop_header, offset, coefficient)]
    }

    fn create_add_many(&mut self, mut children: Vec<SENodeId>) -> SENodeId {
        match children.len() {
            0 => self.create_constant(0),
            1 => children[0],
            _ => {
                children.sort_unstable();
                self.get_cached_or_add(SENode::Add(children.into_iter().collect()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use spvopt_ir::{
        test_util::FunctionBuilderHarness, ControlFlowGraph, DefUseManager, Direction,
        DominatorTree, InstrToBlockMap, LoopDescriptor, Word,
    };

    use crate::scalar::{ScalarEvolutionAnalysis, SENodeId};

    /// Recipe for one randomly shaped expression over the loop induction.
    #[derive(Debug, Clone)]
    enum Expr {
        Const(i32),
        Induction,
        Add(Box<Expr>, Box<Expr>),
        Sub(Box<Expr>, Box<Expr>),
        Mul(Box<Expr>, Box<Expr>),
        Neg(Box<Expr>),
    }

    fn expr_strategy() -> impl Strategy<Value = Expr> {
        let leaf = prop_oneof![
            (-100i32..100).prop_map(Expr::Const),
            Just(Expr::Induction),
        ];
        leaf.prop_recursive(4, 32, 2, |inner| {
            prop_oneof![
                (inner.clone(), inner.clone())
                    .prop_map(|(a, b)| Expr::Add(Box::new(a), Box::new(b))),
                (inner.clone(), inner.clone())
                    .prop_map(|(a, b)| Expr::Sub(Box::new(a), Box::new(b))),
                (inner.clone(), inner.clone())
                    .prop_map(|(a, b)| Expr::Mul(Box::new(a), Box::new(b))),
                inner.prop_map(|a| Expr::Neg(Box::new(a))),
            ]
        })
    }

    fn build(
        scev: &mut ScalarEvolutionAnalysis<'_>,
        induction: SENodeId,
        expr: &Expr,
    ) -> SENodeId {
        match expr {
            Expr::Const(value) => scev.create_constant(i64::from(*value)),
            Expr::Induction => induction,
            Expr::Add(a, b) => {
                let (a, b) = (build(scev, induction, a), build(scev, induction, b));
                scev.create_add(a, b)
            }
            Expr::Sub(a, b) => {
                let (a, b) = (build(scev, induction, a), build(scev, induction, b));
                scev.create_subtraction(a, b)
            }
            Expr::Mul(a, b) => {
                let (a, b) = (build(scev, induction, a), build(scev, induction, b));
                scev.create_multiply(a, b)
            }
            Expr::Neg(a) => {
                let a = build(scev, induction, a);
                scev.create_negation(a)
            }
        }
    }

    proptest! {
        /// Simplification is idempotent, and it never invents recurrences
        /// over loops the original expression did not mention.
        #[test]
        fn simplify_is_idempotent(expr in expr_strategy()) {
            let mut h = FunctionBuilderHarness::new();
            let cl = h.counted_loop(0, 10, 1);
            let module = h.finish();
            let function = module.function(0);
            let cfg = ControlFlowGraph::new(&module, function);
            let dom = DominatorTree::new(&cfg, Direction::Forward);
            let descriptor = LoopDescriptor::new(&module, function, &cfg, &dom);
            let def_use = DefUseManager::new(&module);
            let mut block_of = InstrToBlockMap::default();
            for block in function.blocks() {
                block_of.insert(block.label(), block.id());
                for uid in block.instructions() {
                    block_of.insert(*uid, block.id());
                }
            }
            let mut scev = ScalarEvolutionAnalysis::new(
                &module, function, &def_use, &descriptor, &block_of,
            );
            let induction = scev.analyze_id(cl.phi);

            let root = build(&mut scev, induction, &expr);
            let once = scev.simplify_expression(root);
            let twice = scev.simplify_expression(once);
            prop_assert_eq!(once, twice);

            let before: std::collections::BTreeSet<Word> =
                scev.loops_in(root).into_iter().collect();
            let after: std::collections::BTreeSet<Word> =
                scev.loops_in(once).into_iter().collect();
            prop_assert!(after.is_subset(&before));
        }
    }
}
