//! Higher-level analyses for the loop subsystem: scalar evolution, loop
//! dependence, and register liveness.
//!
//! Each analysis is constructed by its consumer against the base analyses
//! (def-use, CFG, dominators, loop descriptor) and module references handed
//! out by the IR context; none of them mutates the module.

mod dependence;
mod liveness;
pub mod scalar;

pub use self::{
    dependence::{
        DependenceDirections, DependenceInformation, DistanceEntry, DistanceVector,
        LoopDependenceAnalysis,
    },
    liveness::{RegionRegisterLiveness, RegisterClass, RegisterLiveness},
    scalar::{SENode, SENodeId, ScalarEvolutionAnalysis},
};

#[cfg(test)]
mod dependence_tests {
    use pretty_assertions::assert_eq;
    use spvopt_ir::{
        test_util::FunctionBuilderHarness, ControlFlowGraph, DefUseManager, Direction,
        DominatorTree, InstrToBlockMap, LoopDescriptor, Module, UniqueId,
    };

    use crate::{DependenceDirections, DistanceVector, LoopDependenceAnalysis};

    fn block_map(module: &Module) -> InstrToBlockMap {
        let function = module.function(0);
        let mut map = InstrToBlockMap::default();
        for block in function.blocks() {
            map.insert(block.label(), block.id());
            for uid in block.instructions() {
                map.insert(*uid, block.id());
            }
        }
        map
    }

    /// Find the load and store instruction handles in the loop body.
    fn body_access_pair(module: &Module, body: spvopt_ir::Word) -> (UniqueId, UniqueId) {
        let function = module.function(0);
        let bb = function.block(body).unwrap();
        let mut load = None;
        let mut store = None;
        for uid in bb.instructions() {
            match module.inst(*uid).opcode() {
                spirv::Op::Load => load = Some(*uid),
                spirv::Op::Store => store = Some(*uid),
                _ => {}
            }
        }
        (load.unwrap(), store.unwrap())
    }

    /// `A[i] = A[i + 1]`: strong SIV distance 1, direction `<`.
    #[test]
    fn strong_siv_reports_distance_one() {
        let mut h = FunctionBuilderHarness::new();
        let array = h.workgroup_array_var(16);
        let cl = h.counted_loop_with_body(0, 10, 1, |h, cl| {
            let one = h.i32_constant(1);
            let next = h.iadd(cl.body, cl.phi, one);
            let src_ptr = h.access_chain_i32(cl.body, array, &[next]);
            let value = h.load_i32(cl.body, src_ptr);
            let dst_ptr = h.access_chain_i32(cl.body, array, &[cl.phi]);
            h.store(cl.body, dst_ptr, value);
        });
        let module = h.finish();
        let function = module.function(0);
        let cfg = ControlFlowGraph::new(&module, function);
        let dom = DominatorTree::new(&cfg, Direction::Forward);
        let descriptor = LoopDescriptor::new(&module, function, &cfg, &dom);
        let def_use = DefUseManager::new(&module);
        let block_of = block_map(&module);
        let (load, store) = body_access_pair(&module, cl.body);

        let mut analysis = LoopDependenceAnalysis::new(
            &module,
            function,
            &def_use,
            &descriptor,
            &block_of,
            vec![0],
        );
        assert!(analysis.check_supported_loops());
        let mut dv = DistanceVector::new(1);
        let independent = analysis.get_dependence(load, store, &mut dv);

        assert!(!independent);
        assert_eq!(dv.entries[0].distance, 1);
        assert_eq!(dv.entries[0].direction, DependenceDirections::LT);
    }

    /// `A[i] = A[i]`: distance zero, direction `=`.
    #[test]
    fn strong_siv_reports_equal_direction_for_same_subscript() {
        let mut h = FunctionBuilderHarness::new();
        let array = h.workgroup_array_var(16);
        let cl = h.counted_loop_with_body(0, 10, 1, |h, cl| {
            let src_ptr = h.access_chain_i32(cl.body, array, &[cl.phi]);
            let value = h.load_i32(cl.body, src_ptr);
            let dst_ptr = h.access_chain_i32(cl.body, array, &[cl.phi]);
            h.store(cl.body, dst_ptr, value);
        });
        let module = h.finish();
        let function = module.function(0);
        let cfg = ControlFlowGraph::new(&module, function);
        let dom = DominatorTree::new(&cfg, Direction::Forward);
        let descriptor = LoopDescriptor::new(&module, function, &cfg, &dom);
        let def_use = DefUseManager::new(&module);
        let block_of = block_map(&module);
        let (load, store) = body_access_pair(&module, cl.body);

        let mut analysis = LoopDependenceAnalysis::new(
            &module,
            function,
            &def_use,
            &descriptor,
            &block_of,
            vec![0],
        );
        let mut dv = DistanceVector::new(1);
        let independent = analysis.get_dependence(load, store, &mut dv);

        assert!(!independent);
        assert_eq!(dv.entries[0].distance, 0);
        assert_eq!(dv.entries[0].direction, DependenceDirections::EQ);
    }

    /// `A[i] = A[i + 20]` in a ten-trip loop: the distance exceeds the loop
    /// span, proving independence.
    #[test]
    fn strong_siv_proves_independence_outside_loop_span() {
        let mut h = FunctionBuilderHarness::new();
        let array = h.workgroup_array_var(64);
        let cl = h.counted_loop_with_body(0, 10, 1, |h, cl| {
            let twenty = h.i32_constant(20);
            let far = h.iadd(cl.body, cl.phi, twenty);
            let src_ptr = h.access_chain_i32(cl.body, array, &[far]);
            let value = h.load_i32(cl.body, src_ptr);
            let dst_ptr = h.access_chain_i32(cl.body, array, &[cl.phi]);
            h.store(cl.body, dst_ptr, value);
        });
        let module = h.finish();
        let function = module.function(0);
        let cfg = ControlFlowGraph::new(&module, function);
        let dom = DominatorTree::new(&cfg, Direction::Forward);
        let descriptor = LoopDescriptor::new(&module, function, &cfg, &dom);
        let def_use = DefUseManager::new(&module);
        let block_of = block_map(&module);
        let (load, store) = body_access_pair(&module, cl.body);

        let mut analysis = LoopDependenceAnalysis::new(
            &module,
            function,
            &def_use,
            &descriptor,
            &block_of,
            vec![0],
        );
        let mut dv = DistanceVector::new(1);
        assert!(analysis.get_dependence(load, store, &mut dv));
    }

    /// `A[i + 2N] = A[i + N]` with symbolic `N` (a loop-invariant load):
    /// subtracting the bounds cancels `N`, proving independence.
    #[test]
    fn symbolic_siv_proves_independence_when_bounds_cancel() {
        let mut h = FunctionBuilderHarness::new();
        let array = h.workgroup_array_var(64);
        let n_var = h.input_var_i32();

        // The bound is the symbolic N itself: i < N.
        let pre_header = h.new_block();
        let header = h.new_block();
        let cond_block = h.new_block();
        let body = h.new_block();
        let latch = h.new_block();
        let merge = h.new_block();

        let zero = h.i32_constant(0);
        let one = h.i32_constant(1);
        let i_next = h.take_id();

        let n = h.load_i32(pre_header, n_var);
        h.branch(pre_header, header);
        let phi = h.phi_i32(header, &[(zero, pre_header), (i_next, latch)]);
        h.loop_merge(header, merge, latch);
        h.branch(header, cond_block);
        let cond = h.slt(cond_block, phi, n);
        h.branch_conditional(cond_block, cond, body, merge);

        // source subscript: i + N; destination subscript: i + 2N.
        let two = h.i32_constant(2);
        let two_n = h.imul(body, n, two);
        let src_index = h.iadd(body, phi, n);
        let dst_index = h.iadd(body, phi, two_n);
        let src_ptr = h.access_chain_i32(body, array, &[src_index]);
        let value = h.load_i32(body, src_ptr);
        let dst_ptr = h.access_chain_i32(body, array, &[dst_index]);
        h.store(body, dst_ptr, value);
        h.branch(body, latch);

        h.iadd_with_result(latch, phi, one, i_next);
        h.branch(latch, header);
        h.ret(merge);

        let module = h.finish();
        let function = module.function(0);
        let cfg = ControlFlowGraph::new(&module, function);
        let dom = DominatorTree::new(&cfg, Direction::Forward);
        let descriptor = LoopDescriptor::new(&module, function, &cfg, &dom);
        let def_use = DefUseManager::new(&module);
        let block_of = block_map(&module);
        let (load, store) = body_access_pair(&module, body);

        let mut analysis = LoopDependenceAnalysis::new(
            &module,
            function,
            &def_use,
            &descriptor,
            &block_of,
            vec![0],
        );
        let mut dv = DistanceVector::new(1);
        assert!(analysis.get_dependence(load, store, &mut dv));
    }

    /// Accesses into different base variables are trivially independent.
    #[test]
    fn distinct_bases_are_independent() {
        let mut h = FunctionBuilderHarness::new();
        let a = h.workgroup_array_var(16);
        let b = h.workgroup_array_var(16);
        let cl = h.counted_loop_with_body(0, 10, 1, |h, cl| {
            let src_ptr = h.access_chain_i32(cl.body, a, &[cl.phi]);
            let value = h.load_i32(cl.body, src_ptr);
            let dst_ptr = h.access_chain_i32(cl.body, b, &[cl.phi]);
            h.store(cl.body, dst_ptr, value);
        });
        let module = h.finish();
        let function = module.function(0);
        let cfg = ControlFlowGraph::new(&module, function);
        let dom = DominatorTree::new(&cfg, Direction::Forward);
        let descriptor = LoopDescriptor::new(&module, function, &cfg, &dom);
        let def_use = DefUseManager::new(&module);
        let block_of = block_map(&module);
        let (load, store) = body_access_pair(&module, cl.body);

        let mut analysis = LoopDependenceAnalysis::new(
            &module,
            function,
            &def_use,
            &descriptor,
            &block_of,
            vec![0],
        );
        let mut dv = DistanceVector::new(1);
        assert!(analysis.get_dependence(load, store, &mut dv));
        assert_eq!(dv.entries[0].direction, DependenceDirections::NONE);
    }
}
