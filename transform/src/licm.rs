//! Loop-invariant code motion.
//!
//! For each loop, innermost first, a linear scan seeds a work queue with
//! instructions whose operands are all defined outside the loop; each one is
//! hoisted to just before the pre-header's terminator, and its users are
//! re-checked in case the hoist made them invariant too.

use std::collections::VecDeque;

use spirv::Op;

use spvopt_ir::{
    Analyses, IRContext, LoopDescriptor, LoopIndex, Pass, PassStatus, UniqueId, Word,
};

use crate::loop_utils::get_or_create_pre_header;

#[derive(Default)]
pub struct LicmPass;

impl Pass for LicmPass {
    fn name(&self) -> &'static str {
        "loop-invariant-code-motion"
    }

    fn process(&mut self, ctx: &mut IRContext) -> PassStatus {
        let mut modified = false;
        let mut structural_change = false;
        for function in 0..ctx.module().functions().len() {
            match process_function(ctx, function) {
                Ok((hoisted, created_pre_header)) => {
                    modified |= hoisted;
                    structural_change |= created_pre_header;
                }
                Err(_) => return PassStatus::Failure,
            }
        }
        if structural_change {
            ctx.invalidate_all_except(Analyses::LOOP_ANALYSIS);
        } else if modified {
            // Hoisting moves instructions between existing blocks; the CFG,
            // dominators, and def-use relation all survive.
            ctx.invalidate(Analyses::REGISTER_PRESSURE | Analyses::SCALAR_EVOLUTION);
        }
        if modified {
            PassStatus::SuccessWithChange
        } else {
            PassStatus::SuccessWithoutChange
        }
    }
}

fn process_function(
    ctx: &mut IRContext,
    function: usize,
) -> Result<(bool, bool), spvopt_ir::IrError> {
    // Materialise missing pre-headers first, for every loop that has work
    // to hoist: the blocks this inserts become part of the enclosing loops,
    // so the descriptor used for hoisting must be rebuilt afterwards.
    let mut structural = false;
    let mut descriptor = ctx.build_loop_descriptor(function);
    for index in 0..descriptor.num_loops() {
        let mut seeds = VecDeque::new();
        gather_immediately_invariant(ctx, &descriptor, index, &mut seeds);
        if seeds.is_empty() {
            continue;
        }
        let mut l = descriptor.get(index).clone();
        let (_, created) = get_or_create_pre_header(ctx, function, &mut l)?;
        structural |= created;
    }
    if structural {
        descriptor = ctx.build_loop_descriptor(function);
    }

    let mut modified = false;
    for index in descriptor.indices_inner_to_outer() {
        modified |= process_loop(ctx, function, &descriptor, index)?;
    }
    Ok((modified, structural))
}

fn process_loop(
    ctx: &mut IRContext,
    function: usize,
    descriptor: &LoopDescriptor,
    index: LoopIndex,
) -> Result<bool, spvopt_ir::IrError> {
    let mut queue: VecDeque<UniqueId> = VecDeque::new();
    gather_immediately_invariant(ctx, descriptor, index, &mut queue);
    if queue.is_empty() {
        return Ok(false);
    }

    let Some(pre_header) = descriptor.get(index).pre_header() else {
        return Ok(false);
    };

    let mut modified = false;
    while let Some(inst) = queue.pop_front() {
        hoist_instruction(ctx, function, pre_header, inst);
        modified = true;
        log::trace!(
            "hoisted %{} out of loop at block {}",
            ctx.module().inst(inst).result_id(),
            descriptor.get(index).header()
        );

        // Users blocked only on this definition may now be invariant.
        let users: Vec<UniqueId> = {
            let def_use = ctx.get_def_use_mgr();
            let mut users = Vec::new();
            def_use.for_each_user(inst, |user| {
                users.push(user);
                true
            });
            users
        };
        for user in users {
            if queue.contains(&user) {
                continue;
            }
            if is_invariant_candidate(ctx, descriptor, index, user) {
                queue.push_back(user);
            }
        }
    }
    Ok(modified)
}

/// Seed the queue with every instruction in the loop that is already
/// invariant: not a phi, no observable side effects, and every operand
/// defined outside the loop.
fn gather_immediately_invariant(
    ctx: &mut IRContext,
    descriptor: &LoopDescriptor,
    index: LoopIndex,
    queue: &mut VecDeque<UniqueId>,
) {
    let blocks: Vec<Word> = descriptor.get(index).blocks().to_vec();
    for block in blocks {
        let insts: Vec<UniqueId> = ctx
            .module()
            .functions()
            .iter()
            .find_map(|f| f.block(block))
            .map(|bb| bb.instructions().to_vec())
            .unwrap_or_default();
        for inst in insts {
            if is_invariant_candidate(ctx, descriptor, index, inst) {
                queue.push_back(inst);
            }
        }
    }
}

fn is_invariant_candidate(
    ctx: &mut IRContext,
    descriptor: &LoopDescriptor,
    index: LoopIndex,
    inst: UniqueId,
) -> bool {
    let l = descriptor.get(index);
    // Only consider instructions still inside this loop.
    match ctx.get_instr_block(inst) {
        Some(block) if l.is_inside(block) => {}
        _ => return false,
    }
    {
        let instruction = ctx.module().inst(inst);
        if instruction.is_phi() || !is_hoistable_opcode(ctx, inst) {
            return false;
        }
    }
    all_operands_outside_loop(ctx, descriptor, index, inst)
}

/// Whether the opcode may be executed speculatively ahead of the loop:
/// pure computation, or a load from read-only memory.
fn is_hoistable_opcode(ctx: &IRContext, inst: UniqueId) -> bool {
    let instruction = ctx.module().inst(inst);
    if instruction.is_code_motion_safe() {
        return true;
    }
    if instruction.opcode() == Op::Load {
        return load_is_read_only(ctx, inst);
    }
    false
}

/// A load is hoistable when its pointer chain bottoms out in a read-only
/// storage class.
fn load_is_read_only(ctx: &IRContext, load: UniqueId) -> bool {
    let module = ctx.module();
    let mut pointer = module.inst(load).single_word_operand(0);
    // Walk through access chains to the base variable.
    for _ in 0..16 {
        let Some(def) = find_def(ctx, pointer) else {
            return false;
        };
        let inst = module.inst(def);
        match inst.opcode() {
            Op::AccessChain | Op::InBoundsAccessChain => {
                pointer = inst.single_word_operand(0);
            }
            Op::Variable => {
                return matches!(
                    inst.operands().first(),
                    Some(spvopt_ir::Operand::StorageClass(
                        spirv::StorageClass::Input
                            | spirv::StorageClass::UniformConstant
                            | spirv::StorageClass::PushConstant
                    ))
                );
            }
            _ => return false,
        }
    }
    false
}

fn find_def(ctx: &IRContext, id: Word) -> Option<UniqueId> {
    // The def-use manager may not be built while this is called from an
    // immutable context; fall back to a scan of the defining sections.
    let module = ctx.module();
    let mut found = None;
    module.for_each_inst(|uid| {
        if found.is_none() && module.inst(uid).result_id() == id {
            found = Some(uid);
        }
    });
    found
}

fn all_operands_outside_loop(
    ctx: &mut IRContext,
    descriptor: &LoopDescriptor,
    index: LoopIndex,
    inst: UniqueId,
) -> bool {
    let l = descriptor.get(index);
    let mut ids = Vec::new();
    ctx.module().inst(inst).for_each_id(|_, id| ids.push(id));
    for id in ids {
        let def = {
            let def_use = ctx.get_def_use_mgr();
            def_use.get_def(id)
        };
        let Some(def) = def else {
            return false;
        };
        if let Some(block) = ctx.get_instr_block(def) {
            if l.is_inside(block) {
                return false;
            }
        }
    }
    true
}

/// Move `inst` to just before the pre-header's terminator.
fn hoist_instruction(ctx: &mut IRContext, function: usize, pre_header: Word, inst: UniqueId) {
    let source_block = ctx.get_instr_block(inst);
    {
        let module = ctx.module_mut();
        let f = module.function_mut(function);
        if let Some(block) = source_block {
            if let Some(bb) = f.block_mut(block) {
                bb.remove(inst);
            }
        }
    }
    let insert_at = {
        let module = ctx.module();
        module
            .function(function)
            .block(pre_header)
            .and_then(|bb| bb.terminator_uid(module))
    };
    {
        let module = ctx.module_mut();
        let bb = module
            .function_mut(function)
            .block_mut(pre_header)
            .expect("pre-header disappeared");
        match insert_at {
            Some(term) => bb.insert_before(term, inst),
            None => bb.push(inst),
        }
    }
    ctx.set_instr_block(inst, pre_header);
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use spvopt_ir::{test_util::FunctionBuilderHarness, Pass};

    use super::*;

    /// `a = in.x + in.y; array[i] = a` leaves only the
    /// access chain and store in the body, with the add sitting immediately
    /// before the pre-header's terminator.
    #[test]
    fn invariant_add_is_hoisted_to_pre_header() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut h = FunctionBuilderHarness::new();
        let array = h.workgroup_array_var(16);
        let in_x = h.input_var_i32();
        let in_y = h.input_var_i32();
        let mut sum = 0;
        let cl = h.counted_loop_with_body(0, 10, 1, |h, cl| {
            let x = h.load_i32(cl.body, in_x);
            let y = h.load_i32(cl.body, in_y);
            sum = h.iadd(cl.body, x, y);
            let ptr = h.access_chain_i32(cl.body, array, &[cl.phi]);
            h.store(cl.body, ptr, sum);
        });
        let mut ctx = h.finish_ctx();

        let status = LicmPass.run(&mut ctx);
        assert_eq!(status, PassStatus::SuccessWithChange);
        spvopt_ir::verify::verify_module(ctx.module()).unwrap();

        let module = ctx.module();
        let function = module.function(0);

        // The add (and the two loads feeding it) moved to the pre-header.
        let pre_header = function.block(cl.pre_header).unwrap();
        let hoisted: Vec<spirv::Op> = pre_header
            .instructions()
            .iter()
            .map(|uid| module.inst(*uid).opcode())
            .collect();
        assert_eq!(
            hoisted,
            vec![
                spirv::Op::Load,
                spirv::Op::Load,
                spirv::Op::IAdd,
                spirv::Op::Branch
            ]
        );

        // The loop body is just the loop-variant address computation and
        // the store.
        let body = function.block(cl.body).unwrap();
        let remaining: Vec<spirv::Op> = body
            .instructions()
            .iter()
            .map(|uid| module.inst(*uid).opcode())
            .collect();
        assert_eq!(
            remaining,
            vec![spirv::Op::AccessChain, spirv::Op::Store, spirv::Op::Branch]
        );
    }

    /// Loop-variant instructions stay put.
    #[test]
    fn variant_instructions_are_not_hoisted() {
        let mut h = FunctionBuilderHarness::new();
        let array = h.workgroup_array_var(16);
        let cl = h.counted_loop_with_body(0, 10, 1, |h, cl| {
            let two = h.i32_constant(2);
            let scaled = h.imul(cl.body, cl.phi, two);
            let ptr = h.access_chain_i32(cl.body, array, &[cl.phi]);
            h.store(cl.body, ptr, scaled);
        });
        let mut ctx = h.finish_ctx();

        let status = LicmPass.run(&mut ctx);
        assert_eq!(status, PassStatus::SuccessWithoutChange);
        spvopt_ir::verify::verify_module(ctx.module()).unwrap();

        let module = ctx.module();
        let body = module.function(0).block(cl.body).unwrap();
        let opcodes: Vec<spirv::Op> = body
            .instructions()
            .iter()
            .map(|uid| module.inst(*uid).opcode())
            .collect();
        assert_eq!(
            opcodes,
            vec![
                spirv::Op::IMul,
                spirv::Op::AccessChain,
                spirv::Op::Store,
                spirv::Op::Branch
            ]
        );
    }

    /// Invariants inside a nested loop hoist past both loops, one level per
    /// loop, ending up outside the outer loop after the innermost-first
    /// sweep.
    #[test]
    fn nested_loop_hoists_through_both_levels() {
        let mut h = FunctionBuilderHarness::new();
        let in_x = h.input_var_i32();
        let array = h.workgroup_array_var(16);
        let nest = h.nested_loops();
        // An invariant computation and a store in the inner body.
        let inner_body = nest.inner_body;
        let x = h.load_i32(inner_body, in_x);
        let two = h.i32_constant(2);
        let doubled = h.iadd(inner_body, x, two);
        let zero = h.i32_constant(0);
        let ptr = h.access_chain_i32(inner_body, array, &[zero]);
        h.store(inner_body, ptr, doubled);
        let mut ctx = h.finish_ctx();

        let status = LicmPass.run(&mut ctx);
        assert_eq!(status, PassStatus::SuccessWithChange);
        spvopt_ir::verify::verify_module(ctx.module()).unwrap();

        // The load and add escape the outer loop entirely.
        let module = ctx.module();
        let function = module.function(0);
        let mut descriptor_blocks: Vec<spvopt_ir::Word> = Vec::new();
        for block in function.blocks() {
            descriptor_blocks.push(block.id());
        }
        let outer_pos = descriptor_blocks
            .iter()
            .position(|b| *b == nest.outer_header)
            .unwrap();
        let load_block = {
            let mut found = None;
            for block in function.blocks() {
                for uid in block.instructions() {
                    if module.inst(*uid).opcode() == spirv::Op::IAdd {
                        found = Some(block.id());
                    }
                }
            }
            found.unwrap()
        };
        let load_pos = descriptor_blocks
            .iter()
            .position(|b| *b == load_block)
            .unwrap();
        assert!(
            load_pos < outer_pos,
            "invariant add should precede the outer loop header"
        );
    }
}
