//! Loop transformations over the spvopt IR: invariant code motion,
//! unrolling, unswitching, fission, and peeling, plus the loop-surgery
//! utilities they share.
//!
//! Every pass follows the same discipline: analyses are requested from the
//! [spvopt_ir::IRContext], mutation goes through the context or the shared
//! utilities, and at completion everything outside the pass's preserve set
//! is invalidated. A pass that cannot transform a loop leaves the module
//! untouched and reports no change.

mod fission;
mod licm;
pub mod loop_utils;
mod peel;
mod unroll;
mod unswitch;

pub use self::{
    fission::{split_loop, LoopFissionPass},
    licm::LicmPass,
    peel::{can_peel_loop, peel_after, peel_before, LoopPeelingPass, PeelDirection},
    unroll::{can_perform_unroll, fully_unroll, partially_unroll, LoopUnrollerPass},
    unswitch::{find_unswitchable, LoopUnswitchPass},
};

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use spirv::Op;
    use spvopt_ir::{test_util::FunctionBuilderHarness, IRContext, Pass, PassStatus, Word};

    use super::*;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn count_in_loop(ctx: &mut IRContext, function: usize, header: Word, opcode: Op) -> usize {
        let descriptor = ctx.build_loop_descriptor(function);
        let Some((_, l)) = descriptor.iter().find(|(_, l)| l.header() == header) else {
            return 0;
        };
        let module = ctx.module();
        let f = module.function(function);
        l.blocks()
            .iter()
            .filter_map(|block| f.block(*block))
            .flat_map(|bb| bb.instructions().iter())
            .filter(|uid| module.inst(**uid).opcode() == opcode)
            .count()
    }

    /// A loop with `if (cond) s += 1; else t += 1;` and `cond`
    /// loop-invariant unswitches into two loops, each with a single live
    /// arm, dispatched by a new conditional branch where the pre-header
    /// used to be.
    #[test]
    fn unswitch_splits_invariant_branch() {
        init_logging();
        let mut h = FunctionBuilderHarness::new();
        let in_x = h.input_var_i32();
        let in_y = h.input_var_i32();

        let ph = h.new_block();
        let header = h.new_block();
        let cond_block = h.new_block();
        let body = h.new_block();
        let then_bb = h.new_block();
        let else_bb = h.new_block();
        let join = h.new_block();
        let latch = h.new_block();
        let merge = h.new_block();

        let zero = h.i32_constant(0);
        let one = h.i32_constant(1);
        let ten = h.i32_constant(10);

        // Loop-invariant selector, computed before the loop.
        let x = h.load_i32(ph, in_x);
        let y = h.load_i32(ph, in_y);
        let selector = h.slt(ph, x, y);
        h.branch(ph, header);

        let iv_next = h.take_id();
        let s_out = h.take_id();
        let t_out = h.take_id();
        let iv = h.phi_i32(header, &[(zero, ph), (iv_next, latch)]);
        let s = h.phi_i32(header, &[(zero, ph), (s_out, latch)]);
        let t = h.phi_i32(header, &[(zero, ph), (t_out, latch)]);
        h.loop_merge(header, merge, latch);
        h.branch(header, cond_block);

        let exit = h.slt(cond_block, iv, ten);
        h.branch_conditional(cond_block, exit, body, merge);

        h.branch_conditional_with_merge(body, selector, then_bb, else_bb, join);
        let s_inc = h.iadd(then_bb, s, one);
        h.branch(then_bb, join);
        let t_inc = h.iadd(else_bb, t, one);
        h.branch(else_bb, join);

        // Join the two arms; these feed the next iteration.
        let s_phi = h.phi_i32(join, &[(s_inc, then_bb), (s, else_bb)]);
        let t_phi = h.phi_i32(join, &[(t, then_bb), (t_inc, else_bb)]);
        h.branch(join, latch);

        h.iadd_with_result(latch, iv, one, iv_next);
        h.branch(latch, header);
        h.ret(merge);

        // Stitch the join values into the header phis.
        {
            let s_def = h.ctx().module().find_def_inst(s).unwrap();
            let t_def = h.ctx().module().find_def_inst(t).unwrap();
            let module = h.ctx().module_mut();
            module.inst_mut(s_def).map_ids(|id| if id == s_out { s_phi } else { id });
            module.inst_mut(t_def).map_ids(|id| if id == t_out { t_phi } else { id });
        }

        let mut ctx = h.finish_ctx();
        let status = LoopUnswitchPass.run(&mut ctx);
        assert_eq!(status, PassStatus::SuccessWithChange);
        spvopt_ir::verify::verify_module(ctx.module()).unwrap();

        // Two specialised loops now exist.
        let descriptor = ctx.build_loop_descriptor(0);
        assert_eq!(descriptor.num_loops(), 2);

        // The old pre-header dispatches on the original selector.
        let module = ctx.module();
        let function = module.function(0);
        let dispatch = function.block(ph).unwrap().terminator(module).unwrap();
        assert_eq!(dispatch.opcode(), Op::BranchConditional);
        assert_eq!(dispatch.single_word_operand(0), selector);

        // Each specialised loop kept exactly one arm: its induction step
        // plus a single accumulator increment.
        let headers: Vec<Word> = descriptor.iter().map(|(_, l)| l.header()).collect();
        for loop_header in headers {
            assert_eq!(count_in_loop(&mut ctx, 0, loop_header, Op::IAdd), 2);
            // And no conditional branch on the selector survives inside.
            let descriptor = ctx.build_loop_descriptor(0);
            let (_, l) = descriptor
                .iter()
                .find(|(_, l)| l.header() == loop_header)
                .unwrap();
            let module = ctx.module();
            let f = module.function(0);
            let selector_branches = l
                .blocks()
                .iter()
                .filter_map(|block| f.block(*block))
                .filter_map(|bb| bb.terminator(module))
                .filter(|term| {
                    term.opcode() == Op::BranchConditional
                        && term.single_word_operand(0) == selector
                })
                .count();
            assert_eq!(selector_branches, 0);
        }
    }

    /// Fission splits `A[i] = B[i]; C[i] = D[i]` into two loops with one
    /// store each.
    #[test]
    fn fission_splits_independent_statements() {
        init_logging();
        let mut h = FunctionBuilderHarness::new();
        let a = h.workgroup_array_var(16);
        let b = h.workgroup_array_var(16);
        let c = h.workgroup_array_var(16);
        let d = h.workgroup_array_var(16);
        h.counted_loop_with_body(0, 10, 1, |h, cl| {
            let b_ptr = h.access_chain_i32(cl.body, b, &[cl.phi]);
            let v = h.load_i32(cl.body, b_ptr);
            let a_ptr = h.access_chain_i32(cl.body, a, &[cl.phi]);
            h.store(cl.body, a_ptr, v);

            let d_ptr = h.access_chain_i32(cl.body, d, &[cl.phi]);
            let w = h.load_i32(cl.body, d_ptr);
            let c_ptr = h.access_chain_i32(cl.body, c, &[cl.phi]);
            h.store(cl.body, c_ptr, w);
        });
        let mut ctx = h.finish_ctx();

        let mut pass = LoopFissionPass::new();
        let status = pass.run(&mut ctx);
        assert_eq!(status, PassStatus::SuccessWithChange);
        spvopt_ir::verify::verify_module(ctx.module()).unwrap();

        let descriptor = ctx.build_loop_descriptor(0);
        assert_eq!(descriptor.num_loops(), 2);
        let headers: Vec<Word> = descriptor.iter().map(|(_, l)| l.header()).collect();
        for header in headers {
            assert_eq!(count_in_loop(&mut ctx, 0, header, Op::Store), 1);
            assert_eq!(count_in_loop(&mut ctx, 0, header, Op::Load), 1);
        }
        assert!(headers_distinct(&mut ctx));
    }

    fn headers_distinct(ctx: &mut IRContext) -> bool {
        let descriptor = ctx.build_loop_descriptor(0);
        let headers: Vec<Word> = descriptor.iter().map(|(_, l)| l.header()).collect();
        headers.windows(2).all(|pair| pair[0] != pair[1])
    }

    /// `A[i] = B[i]; B[i] = A[i+1]` must not be split: the
    /// `A[i+1]` load would observe the first loop's stores.
    #[test]
    fn fission_rejects_cross_iteration_dependence() {
        init_logging();
        let mut h = FunctionBuilderHarness::new();
        let a = h.workgroup_array_var(16);
        let b = h.workgroup_array_var(16);
        h.counted_loop_with_body(0, 10, 1, |h, cl| {
            let b_ptr = h.access_chain_i32(cl.body, b, &[cl.phi]);
            let v = h.load_i32(cl.body, b_ptr);
            let a_ptr = h.access_chain_i32(cl.body, a, &[cl.phi]);
            h.store(cl.body, a_ptr, v);

            let one = h.i32_constant(1);
            let next = h.iadd(cl.body, cl.phi, one);
            let a1_ptr = h.access_chain_i32(cl.body, a, &[next]);
            let w = h.load_i32(cl.body, a1_ptr);
            let b2_ptr = h.access_chain_i32(cl.body, b, &[cl.phi]);
            h.store(cl.body, b2_ptr, w);
        });
        let mut ctx = h.finish_ctx();

        let mut pass = LoopFissionPass::new();
        let status = pass.run(&mut ctx);
        assert_eq!(status, PassStatus::SuccessWithoutChange);

        let descriptor = ctx.build_loop_descriptor(0);
        assert_eq!(descriptor.num_loops(), 1);
    }

    /// The guided pass spots a condition true only for the first iterations
    /// and peels them off.
    #[test]
    fn peeling_pass_peels_early_true_condition() {
        init_logging();
        let mut h = FunctionBuilderHarness::new();
        let array = h.workgroup_array_var(16);

        let ph = h.new_block();
        let header = h.new_block();
        let cond_block = h.new_block();
        let body = h.new_block();
        let early = h.new_block();
        let late = h.new_block();
        let join = h.new_block();
        let latch = h.new_block();
        let merge = h.new_block();

        let zero = h.i32_constant(0);
        let one = h.i32_constant(1);
        let three = h.i32_constant(3);
        let ten = h.i32_constant(10);

        h.branch(ph, header);
        let iv_next = h.take_id();
        let iv = h.phi_i32(header, &[(zero, ph), (iv_next, latch)]);
        h.loop_merge(header, merge, latch);
        h.branch(header, cond_block);
        let exit = h.slt(cond_block, iv, ten);
        h.branch_conditional(cond_block, exit, body, merge);

        // True only while i < 3: the first three iterations.
        let warmup = h.slt(body, iv, three);
        h.branch_conditional_with_merge(body, warmup, early, late, join);
        let ptr = h.access_chain_i32(early, array, &[iv]);
        h.store(early, ptr, one);
        h.branch(early, join);
        let ptr = h.access_chain_i32(late, array, &[iv]);
        h.store(late, ptr, zero);
        h.branch(late, join);
        h.branch(join, latch);
        h.iadd_with_result(latch, iv, one, iv_next);
        h.branch(latch, header);
        h.ret(merge);

        let mut ctx = h.finish_ctx();
        let status = LoopPeelingPass.run(&mut ctx);
        assert_eq!(status, PassStatus::SuccessWithChange);
        spvopt_ir::verify::verify_module(ctx.module()).unwrap();

        let descriptor = ctx.build_loop_descriptor(0);
        assert_eq!(descriptor.num_loops(), 2);
    }

    /// Peeling the first iterations produces two loops, with the peel
    /// bounded by a fresh counter.
    #[test]
    fn peel_before_creates_bounded_prologue() {
        let mut h = FunctionBuilderHarness::new();
        let array = h.workgroup_array_var(16);
        h.counted_loop_with_body(0, 10, 1, |h, cl| {
            let one = h.i32_constant(1);
            let ptr = h.access_chain_i32(cl.body, array, &[cl.phi]);
            h.store(cl.body, ptr, one);
        });
        let mut ctx = h.finish_ctx();

        let descriptor = ctx.build_loop_descriptor(0);
        assert!(peel_before(&mut ctx, 0, &descriptor, 0, 2).unwrap());
        spvopt_ir::verify::verify_module(ctx.module()).unwrap();

        let descriptor = ctx.build_loop_descriptor(0);
        assert_eq!(descriptor.num_loops(), 2);

        // The peeled loop tests its fresh unsigned counter.
        let module = ctx.module();
        let function = module.function(0);
        let mut saw_peel_test = false;
        for block in function.blocks() {
            for uid in block.instructions() {
                if module.inst(*uid).opcode() == Op::ULessThan {
                    saw_peel_test = true;
                }
            }
        }
        assert!(saw_peel_test);
    }
}
