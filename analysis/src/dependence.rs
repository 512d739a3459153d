//! Loop-carried dependence analysis between pairs of memory accesses.
//!
//! Given a load and a store through access chains into the same base
//! variable, the analysis classifies each subscript pair by the number of
//! induction variables it involves (ZIV / SIV / MIV) and applies the
//! matching test. Proving any subscript independent proves the whole pair
//! independent; otherwise the per-loop [DistanceVector] records whatever
//! direction, distance, and peeling information the tests established.
//!
//! The analysis is pure: it never mutates the module.

use rustc_hash::FxHashSet;
use spirv::Op;

use spvopt_ir::{
    ControlFlowGraph, DefUseManager, Function, InstrToBlockMap, LoopDescriptor, LoopIndex, Module,
    UniqueId, Word,
};

use crate::scalar::{SENode, SENodeId, ScalarEvolutionAnalysis};

bitflags::bitflags! {
    /// The set of possible orderings between two dependent accesses.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DependenceDirections: u8 {
        const NONE = 0;
        const LT = 1 << 0;
        const EQ = 1 << 1;
        const GT = 1 << 2;
        const ALL = Self::LT.bits() | Self::EQ.bits() | Self::GT.bits();
    }
}

/// How much is known about the dependence carried by one loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DependenceInformation {
    #[default]
    Unknown,
    Direction,
    Distance,
    Peel,
}

/// Per-loop dependence findings for one access pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistanceEntry {
    pub dependence_information: DependenceInformation,
    pub direction: DependenceDirections,
    pub distance: i64,
    pub peel_first: bool,
    pub peel_last: bool,
}

impl Default for DistanceEntry {
    fn default() -> Self {
        Self {
            dependence_information: DependenceInformation::Unknown,
            direction: DependenceDirections::ALL,
            distance: 0,
            peel_first: false,
            peel_last: false,
        }
    }
}

/// One [DistanceEntry] per loop of the analysed nest, in the order the nest
/// was given to [LoopDependenceAnalysis::new].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistanceVector {
    pub entries: Vec<DistanceEntry>,
}

impl DistanceVector {
    pub fn new(size: usize) -> Self {
        Self {
            entries: vec![DistanceEntry::default(); size],
        }
    }
}

/// Dependence analysis over one loop nest.
pub struct LoopDependenceAnalysis<'a> {
    scev: ScalarEvolutionAnalysis<'a>,
    cfg: ControlFlowGraph,
    /// The loop nest; distance-vector entries parallel this list.
    loops: Vec<LoopIndex>,
    /// Header block ids of `loops`, for recurrent-node lookups.
    headers: Vec<Word>,
}

impl<'a> LoopDependenceAnalysis<'a> {
    pub fn new(
        module: &'a Module,
        function: &'a Function,
        def_use: &'a DefUseManager,
        descriptor: &'a LoopDescriptor,
        block_of: &'a InstrToBlockMap,
        loops: Vec<LoopIndex>,
    ) -> Self {
        let headers = loops
            .iter()
            .map(|index| descriptor.get(*index).header())
            .collect();
        Self {
            scev: ScalarEvolutionAnalysis::new(module, function, def_use, descriptor, block_of),
            cfg: ControlFlowGraph::new(module, function),
            loops,
            headers,
        }
    }

    #[inline]
    pub fn scalar_evolution(&mut self) -> &mut ScalarEvolutionAnalysis<'a> {
        &mut self.scev
    }

    /// Whether every loop of the nest has a recognised induction variable
    /// stepping by one.
    pub fn check_supported_loops(&mut self) -> bool {
        let indices: Vec<LoopIndex> = self.loops.clone();
        indices.into_iter().all(|index| self.is_supported_loop(index))
    }

    pub fn is_supported_loop(&mut self, index: LoopIndex) -> bool {
        let l = self.scev.descriptor().get(index);
        let induction = l.find_induction_variable(
            self.scev.module(),
            self.scev.function(),
            &self.cfg,
            self.scev.def_use(),
        );
        matches!(induction, Some(iv) if iv.step == 1 || iv.step == -1)
    }

    /// Find the dependence between memory accesses `source` and
    /// `destination` (one loading, one storing through an access chain).
    ///
    /// Returns true when independence is proven; otherwise the direction and
    /// distance information gathered per loop is left in `distance_vector`.
    pub fn get_dependence(
        &mut self,
        source: UniqueId,
        destination: UniqueId,
        distance_vector: &mut DistanceVector,
    ) -> bool {
        let Some((source_base, source_subscripts)) = self.memory_access_parts(source) else {
            self.mark_all(distance_vector);
            return false;
        };
        let Some((destination_base, destination_subscripts)) =
            self.memory_access_parts(destination)
        else {
            self.mark_all(distance_vector);
            return false;
        };

        // Distinct base variables cannot alias in the logical addressing
        // model.
        if source_base != destination_base {
            self.mark_independent(distance_vector);
            return true;
        }
        if source_subscripts.len() != destination_subscripts.len() {
            self.mark_independent(distance_vector);
            return true;
        }

        for (source_sub, destination_sub) in
            source_subscripts.iter().zip(destination_subscripts.iter())
        {
            let source_node = self.scev.analyze_instruction(*source_sub);
            let source_node = self.scev.simplify_expression(source_node);
            let destination_node = self.scev.analyze_instruction(*destination_sub);
            let destination_node = self.scev.simplify_expression(destination_node);

            if self.scev.node(source_node).is_cant_compute()
                || self.scev.node(destination_node).is_cant_compute()
            {
                self.mark_all(distance_vector);
                return false;
            }

            let mut involved: FxHashSet<Word> = self.scev.loops_in(source_node);
            involved.extend(self.scev.loops_in(destination_node));

            match involved.len() {
                0 => {
                    // ZIV: both sides invariant over the whole nest.
                    if source_node != destination_node {
                        log::trace!("ZIV test proved independence");
                        self.mark_independent(distance_vector);
                        return true;
                    }
                }
                1 => {
                    let header = *involved.iter().next().unwrap();
                    let Some(entry_index) = self.headers.iter().position(|h| *h == header)
                    else {
                        self.mark_all(distance_vector);
                        return false;
                    };
                    if self.siv_test(
                        source_node,
                        destination_node,
                        entry_index,
                        distance_vector,
                    ) {
                        self.mark_independent(distance_vector);
                        return true;
                    }
                }
                _ => {
                    if self.gcd_miv_test(source_node, destination_node) {
                        log::trace!("GCD MIV test proved independence");
                        self.mark_independent(distance_vector);
                        return true;
                    }
                    for header in involved {
                        if let Some(index) = self.headers.iter().position(|h| *h == header) {
                            let entry = &mut distance_vector.entries[index];
                            entry.direction = DependenceDirections::ALL;
                            entry.dependence_information = DependenceInformation::Unknown;
                        }
                    }
                }
            }
        }

        false
    }

    fn mark_independent(&self, distance_vector: &mut DistanceVector) {
        for entry in distance_vector.entries.iter_mut() {
            entry.direction = DependenceDirections::NONE;
            entry.dependence_information = DependenceInformation::Direction;
        }
    }

    fn mark_all(&self, distance_vector: &mut DistanceVector) {
        for entry in distance_vector.entries.iter_mut() {
            entry.direction = DependenceDirections::ALL;
            entry.dependence_information = DependenceInformation::Unknown;
        }
    }

    /// Resolve a load or store to `(base variable, subscript instructions)`.
    ///
    /// Only accesses whose pointer is a single access chain rooted at a
    /// variable are supported.
    fn memory_access_parts(&self, access: UniqueId) -> Option<(UniqueId, Vec<UniqueId>)> {
        let module = self.scev.module();
        let def_use = self.scev.def_use();
        let inst = module.inst(access);
        let pointer = match inst.opcode() {
            Op::Load | Op::Store => inst.single_word_operand(0),
            _ => return None,
        };
        let chain_uid = def_use.get_def(pointer)?;
        let chain = module.inst(chain_uid);
        if !matches!(chain.opcode(), Op::AccessChain | Op::InBoundsAccessChain) {
            return None;
        }
        let base = def_use.get_def(chain.single_word_operand(0))?;
        if module.inst(base).opcode() != Op::Variable {
            return None;
        }
        let mut subscripts = Vec::with_capacity(chain.num_operands() - 1);
        for index in 1..chain.num_operands() {
            subscripts.push(def_use.get_def(chain.single_word_operand(index))?);
        }
        Some((base, subscripts))
    }

    /// Dispatch the applicable single-induction-variable test. Returns true
    /// when independence is proven.
    fn siv_test(
        &mut self,
        source: SENodeId,
        destination: SENodeId,
        entry_index: usize,
        distance_vector: &mut DistanceVector,
    ) -> bool {
        let source_recurrents = self.scev.collect_recurrent_nodes(source);
        let destination_recurrents = self.scev.collect_recurrent_nodes(destination);

        // Weak-zero: one side is invariant in the loop.
        if source_recurrents.is_empty() {
            if let SENode::Recurrent { coefficient, .. } = self.scev.node(destination).clone() {
                return self.weak_zero_siv_test(
                    source,
                    destination,
                    coefficient,
                    true,
                    entry_index,
                    distance_vector,
                );
            }
        }
        if destination_recurrents.is_empty() {
            if let SENode::Recurrent { coefficient, .. } = self.scev.node(source).clone() {
                return self.weak_zero_siv_test(
                    destination,
                    source,
                    coefficient,
                    false,
                    entry_index,
                    distance_vector,
                );
            }
        }

        if source_recurrents.len() == 1 && destination_recurrents.len() == 1 {
            let source_coefficient = self.recurrent_coefficient(source_recurrents[0]);
            let destination_coefficient = self.recurrent_coefficient(destination_recurrents[0]);

            if source_coefficient == destination_coefficient {
                return self.strong_siv_test(
                    source,
                    destination,
                    source_coefficient,
                    entry_index,
                    distance_vector,
                );
            }

            let negated = self.scev.create_negation(destination_coefficient);
            let negated = self.scev.simplify_expression(negated);
            if source_coefficient == negated {
                return self.weak_crossing_siv_test(
                    source,
                    destination,
                    source_coefficient,
                    entry_index,
                    distance_vector,
                );
            }
        }

        self.symbolic_siv_test(source, destination, entry_index, distance_vector)
    }

    fn recurrent_coefficient(&self, node: SENodeId) -> SENodeId {
        match self.scev.node(node) {
            SENode::Recurrent { coefficient, .. } => *coefficient,
            _ => unreachable!("recurrent node expected"),
        }
    }

    fn recurrent_offset(&self, node: SENodeId) -> Option<SENodeId> {
        match self.scev.node(node) {
            SENode::Recurrent { offset, .. } => Some(*offset),
            _ => None,
        }
    }

    /// Both subscripts advance with the same coefficient:
    /// `distance = (c_source - c_destination) / a`.
    fn strong_siv_test(
        &mut self,
        source: SENodeId,
        destination: SENodeId,
        coefficient: SENodeId,
        entry_index: usize,
        distance_vector: &mut DistanceVector,
    ) -> bool {
        // Symbolic offsets fall back to a bounds argument.
        if !self.scev.collect_value_unknown_nodes(source).is_empty()
            || !self.scev.collect_value_unknown_nodes(destination).is_empty()
        {
            return self.symbolic_siv_test(source, destination, entry_index, distance_vector);
        }
        let (Some(source_offset), Some(destination_offset)) = (
            self.recurrent_offset(source),
            self.recurrent_offset(destination),
        ) else {
            return self.symbolic_siv_test(source, destination, entry_index, distance_vector);
        };

        let delta = self.scev.create_subtraction(source_offset, destination_offset);
        let delta = self.scev.simplify_expression(delta);
        let (Some(delta_value), Some(coefficient_value)) = (
            self.scev.constant_of(delta),
            self.scev.constant_of(coefficient),
        ) else {
            let entry = &mut distance_vector.entries[entry_index];
            entry.direction = DependenceDirections::ALL;
            return false;
        };

        if coefficient_value == 0 || delta_value % coefficient_value != 0 {
            log::trace!("strong SIV: non-integral distance proves independence");
            return true;
        }
        let distance = delta_value / coefficient_value;

        // Outside the iteration span, the accesses can never meet.
        if let Some(bound) = self.loop_span(entry_index) {
            if distance.unsigned_abs() > bound {
                log::trace!("strong SIV: distance {distance} exceeds loop span {bound}");
                let entry = &mut distance_vector.entries[entry_index];
                entry.distance = distance;
                return true;
            }
        }

        let entry = &mut distance_vector.entries[entry_index];
        entry.dependence_information = DependenceInformation::Distance;
        entry.distance = distance;
        entry.direction = match distance.signum() {
            1 => DependenceDirections::LT,
            0 => DependenceDirections::EQ,
            _ => DependenceDirections::GT,
        };
        false
    }

    /// One side is invariant: `distance = (invariant - offset_other) / a`,
    /// with first/last-trip peel detection when the distance test fails.
    #[allow(clippy::too_many_arguments)]
    fn weak_zero_siv_test(
        &mut self,
        invariant: SENodeId,
        recurrent: SENodeId,
        coefficient: SENodeId,
        _invariant_is_source: bool,
        entry_index: usize,
        distance_vector: &mut DistanceVector,
    ) -> bool {
        let Some(offset) = self.recurrent_offset(recurrent) else {
            return false;
        };
        let delta = self.scev.create_subtraction(invariant, offset);
        let delta = self.scev.simplify_expression(delta);

        if let (Some(delta_value), Some(coefficient_value)) = (
            self.scev.constant_of(delta),
            self.scev.constant_of(coefficient),
        ) {
            if coefficient_value != 0 && delta_value % coefficient_value != 0 {
                log::trace!("weak-zero SIV: non-integral distance proves independence");
                return true;
            }
            if coefficient_value != 0 {
                let distance = delta_value / coefficient_value;
                if let Some((lower, upper)) = self.loop_bound_values(entry_index) {
                    if !within_bounds(distance, lower, upper) {
                        log::trace!("weak-zero SIV: distance {distance} outside loop bounds");
                        let entry = &mut distance_vector.entries[entry_index];
                        entry.distance = distance;
                        return true;
                    }
                }
            }
        }

        // The dependence may exist only on the first or last iteration, in
        // which case peeling breaks it.
        if let Some(first) = self.trip_value(entry_index, coefficient, offset, TripEnd::First) {
            if first == invariant {
                let entry = &mut distance_vector.entries[entry_index];
                entry.peel_first = true;
                entry.dependence_information = DependenceInformation::Peel;
                return false;
            }
        }
        if let Some(last) = self.trip_value(entry_index, coefficient, offset, TripEnd::Last) {
            if last == invariant {
                let entry = &mut distance_vector.entries[entry_index];
                entry.peel_last = true;
                entry.dependence_information = DependenceInformation::Peel;
                return false;
            }
        }

        let entry = &mut distance_vector.entries[entry_index];
        entry.direction = DependenceDirections::ALL;
        false
    }

    /// Coefficients of equal magnitude and opposite sign:
    /// `distance = (c_destination - c_source) / 2a`.
    fn weak_crossing_siv_test(
        &mut self,
        source: SENodeId,
        destination: SENodeId,
        coefficient: SENodeId,
        entry_index: usize,
        distance_vector: &mut DistanceVector,
    ) -> bool {
        let (Some(source_offset), Some(destination_offset)) = (
            self.recurrent_offset(source),
            self.recurrent_offset(destination),
        ) else {
            let entry = &mut distance_vector.entries[entry_index];
            entry.direction = DependenceDirections::ALL;
            return false;
        };
        let delta = self
            .scev
            .create_subtraction(destination_offset, source_offset);
        let delta = self.scev.simplify_expression(delta);

        let (Some(delta_value), Some(coefficient_value)) = (
            self.scev.constant_of(delta),
            self.scev.constant_of(coefficient),
        ) else {
            let entry = &mut distance_vector.entries[entry_index];
            entry.direction = DependenceDirections::ALL;
            return false;
        };
        if coefficient_value == 0 {
            return false;
        }

        let double = 2 * coefficient_value;
        if delta_value % coefficient_value != 0 {
            // Not even a half-integral crossing point.
            log::trace!("weak-crossing SIV: fractional crossing proves independence");
            return true;
        }
        if delta_value % double != 0 {
            // Half-integral: the accesses cross between iterations; no
            // common iteration pair exists, but distinct pairs may depend.
            let entry = &mut distance_vector.entries[entry_index];
            entry.direction = DependenceDirections::ALL;
            return false;
        }
        let distance = delta_value / double;
        let entry = &mut distance_vector.entries[entry_index];
        if distance == 0 {
            entry.dependence_information = DependenceInformation::Distance;
            entry.direction = DependenceDirections::EQ;
            entry.distance = 0;
        } else {
            entry.direction = DependenceDirections::ALL;
        }
        false
    }

    /// Fall back to proving that `source - destination` lies outside the
    /// loop's iteration span symbolically.
    fn symbolic_siv_test(
        &mut self,
        source: SENodeId,
        destination: SENodeId,
        entry_index: usize,
        distance_vector: &mut DistanceVector,
    ) -> bool {
        let delta = self.scev.create_subtraction(source, destination);
        let delta = self.scev.simplify_expression(delta);
        if self.is_provably_outwith_loop_bounds(entry_index, delta) {
            log::trace!("symbolic SIV: delta provably outside loop bounds");
            return true;
        }
        let entry = &mut distance_vector.entries[entry_index];
        entry.direction = DependenceDirections::ALL;
        false
    }

    /// GCD test: independence when the gcd of every induction coefficient
    /// fails to divide the constant part of `destination - source`.
    fn gcd_miv_test(&mut self, source: SENodeId, destination: SENodeId) -> bool {
        let Some((source_constant, source_coefficients)) = self.linear_parts(source) else {
            return false;
        };
        let Some((destination_constant, destination_coefficients)) =
            self.linear_parts(destination)
        else {
            return false;
        };
        let delta = destination_constant.wrapping_sub(source_constant);
        let mut divisor: i64 = 0;
        for (_, coefficient) in source_coefficients.iter().chain(&destination_coefficients) {
            divisor = gcd(divisor, coefficient.abs());
        }
        if divisor == 0 {
            return false;
        }
        delta % divisor != 0
    }

    /// Decompose `node` as `constant + sum(coefficient * trip(loop))`.
    fn linear_parts(&self, node: SENodeId) -> Option<(i64, Vec<(Word, i64)>)> {
        match self.scev.node(node).clone() {
            SENode::Constant(value) => Some((value, Vec::new())),
            SENode::Recurrent {
                loop_header,
                offset,
                coefficient,
            } => {
                let (constant, mut coefficients) = self.linear_parts(offset)?;
                let coefficient = self.scev.constant_of(coefficient)?;
                coefficients.push((loop_header, coefficient));
                Some((constant, coefficients))
            }
            SENode::Add(children) => {
                let mut constant = 0i64;
                let mut coefficients = Vec::new();
                for child in children {
                    let (c, mut terms) = self.linear_parts(child)?;
                    constant = constant.wrapping_add(c);
                    coefficients.append(&mut terms);
                }
                Some((constant, coefficients))
            }
            SENode::Negative(child) => {
                let (constant, coefficients) = self.linear_parts(child)?;
                Some((
                    constant.wrapping_neg(),
                    coefficients
                        .into_iter()
                        .map(|(header, c)| (header, -c))
                        .collect(),
                ))
            }
            _ => None,
        }
    }

    /// `upper - lower` as a constant, when both bounds fold.
    fn loop_span(&mut self, entry_index: usize) -> Option<u64> {
        let (lower, upper) = self.loop_bound_values(entry_index)?;
        Some(upper.abs_diff(lower))
    }

    fn loop_bound_values(&mut self, entry_index: usize) -> Option<(i64, i64)> {
        let lower = self.lower_bound(entry_index)?;
        let lower = self.scev.constant_of(lower)?;
        let upper = self.upper_bound(entry_index)?;
        let upper = self.scev.constant_of(upper)?;
        Some((lower, upper))
    }

    /// The first value the induction takes, from the loop condition.
    pub fn lower_bound(&mut self, entry_index: usize) -> Option<SENodeId> {
        let (condition_opcode, lhs, rhs) = self.condition_parts(entry_index)?;
        match condition_opcode {
            Op::ULessThan | Op::SLessThan | Op::ULessThanEqual | Op::SLessThanEqual => {
                let node = self.analyze_bound_operand(lhs)?;
                Some(self.scev.simplify_expression(node))
            }
            Op::UGreaterThan | Op::SGreaterThan => {
                let node = self.analyze_bound_operand(rhs)?;
                let one = self.scev.create_constant(1);
                let node = self.scev.create_add(node, one);
                Some(self.scev.simplify_expression(node))
            }
            Op::UGreaterThanEqual | Op::SGreaterThanEqual => {
                let node = self.analyze_bound_operand(rhs)?;
                Some(self.scev.simplify_expression(node))
            }
            _ => None,
        }
    }

    /// The last value before the exit condition trips.
    pub fn upper_bound(&mut self, entry_index: usize) -> Option<SENodeId> {
        let (condition_opcode, lhs, rhs) = self.condition_parts(entry_index)?;
        match condition_opcode {
            Op::ULessThan | Op::SLessThan => {
                let node = self.analyze_bound_operand(rhs)?;
                let one = self.scev.create_constant(1);
                let node = self.scev.create_subtraction(node, one);
                Some(self.scev.simplify_expression(node))
            }
            Op::ULessThanEqual | Op::SLessThanEqual => {
                let node = self.analyze_bound_operand(rhs)?;
                Some(self.scev.simplify_expression(node))
            }
            Op::UGreaterThan
            | Op::SGreaterThan
            | Op::UGreaterThanEqual
            | Op::SGreaterThanEqual => {
                let node = self.analyze_bound_operand(lhs)?;
                Some(self.scev.simplify_expression(node))
            }
            _ => None,
        }
    }

    fn condition_parts(&mut self, entry_index: usize) -> Option<(Op, Word, Word)> {
        let loop_index = self.loops[entry_index];
        let module = self.scev.module();
        let function = self.scev.function();
        let l = self.scev.descriptor().get(loop_index);
        let induction =
            l.find_induction_variable(module, function, &self.cfg, self.scev.def_use())?;
        let condition = module.inst(induction.condition);
        Some((
            condition.opcode(),
            condition.single_word_operand(0),
            condition.single_word_operand(1),
        ))
    }

    /// Analyse a loop-bound operand, looking through one phi (the induction)
    /// to its initial value.
    fn analyze_bound_operand(&mut self, id: Word) -> Option<SENodeId> {
        let def_use = self.scev.def_use();
        let module = self.scev.module();
        let mut uid = def_use.get_def(id)?;
        if module.inst(uid).opcode() == Op::Phi {
            uid = def_use.get_def(module.inst(uid).single_word_operand(0))?;
            if module.inst(uid).opcode() == Op::Phi {
                // Chains of phis are out of scope.
                return None;
            }
        }
        Some(self.scev.analyze_instruction(uid))
    }

    /// Whether `|distance|` provably exceeds `upper - lower`: the excess in
    /// either direction must fold to a positive constant after the symbolic
    /// parts cancel.
    pub fn is_provably_outwith_loop_bounds(
        &mut self,
        entry_index: usize,
        distance: SENodeId,
    ) -> bool {
        let (Some(lower), Some(upper)) = (
            self.lower_bound(entry_index),
            self.upper_bound(entry_index),
        ) else {
            return false;
        };
        let span = self.scev.create_subtraction(upper, lower);
        let span = self.scev.simplify_expression(span);
        for candidate in [distance, self.scev.create_negation(distance)] {
            let excess = self.scev.create_subtraction(candidate, span);
            let excess = self.scev.simplify_expression(excess);
            if matches!(self.scev.constant_of(excess), Some(value) if value > 0) {
                return true;
            }
        }
        false
    }

    /// The subscript value at the first or last trip:
    /// `induction_at_end * coefficient + offset`.
    fn trip_value(
        &mut self,
        entry_index: usize,
        coefficient: SENodeId,
        offset: SENodeId,
        end: TripEnd,
    ) -> Option<SENodeId> {
        let loop_index = self.loops[entry_index];
        let module = self.scev.module();
        let function = self.scev.function();
        let l = self.scev.descriptor().get(loop_index);
        let induction =
            l.find_induction_variable(module, function, &self.cfg, self.scev.def_use())?;
        let init = induction.init_value?;
        let induction_value = match end {
            TripEnd::First => init,
            TripEnd::Last => {
                let trips = l.find_number_of_iterations(
                    module,
                    function,
                    &self.cfg,
                    self.scev.def_use(),
                    &induction,
                )?;
                if trips == 0 {
                    return None;
                }
                init + (trips as i64 - 1) * induction.step
            }
        };
        let induction_node = self.scev.create_constant(induction_value);
        let scaled = self.scev.create_multiply(induction_node, coefficient);
        let value = self.scev.create_add(scaled, offset);
        Some(self.scev.simplify_expression(value))
    }
}

#[derive(Clone, Copy)]
enum TripEnd {
    First,
    Last,
}

fn within_bounds(value: i64, bound_one: i64, bound_two: i64) -> bool {
    let (lower, upper) = if bound_one <= bound_two {
        (bound_one, bound_two)
    } else {
        (bound_two, bound_one)
    };
    value >= lower && value <= upper
}

fn gcd(a: i64, b: i64) -> i64 {
    if b == 0 {
        a.abs()
    } else {
        gcd(b, a % b)
    }
}
