//! Shared machinery for loop transformations: cloning a loop body with
//! fresh ids, pre-header creation, and loop-closed SSA conversion.

use rustc_hash::FxHashMap;
use spirv::Op;

use spvopt_ir::{
    builder::create_block, Analyses, BasicBlock, IRContext, InstructionBuilder, IrError, Loop,
    Operand, UniqueId, Word,
};

/// The maps produced by cloning a set of blocks.
#[derive(Debug, Default)]
pub struct LoopCloningResult {
    /// Old result id (including block labels) to its clone's result id.
    pub value_map: FxHashMap<Word, Word>,
    /// Old instruction handle to its clone's handle.
    pub uid_map: FxHashMap<UniqueId, UniqueId>,
    pub old_to_new_block: FxHashMap<Word, Word>,
    pub new_to_old_block: FxHashMap<Word, Word>,
    /// The cloned block ids, in the order the originals were given.
    pub cloned_blocks: Vec<Word>,
}

/// Clone `blocks` (in the given order) into fresh blocks inserted before
/// `insert_before`. Every cloned instruction receives a fresh result id, and
/// operands referring to cloned ids are remapped; operands referring to
/// anything else (constants, values defined outside, uncloned blocks) are
/// left alone.
pub fn clone_blocks(
    ctx: &mut IRContext,
    function: usize,
    blocks: &[Word],
    insert_before: Word,
) -> Result<LoopCloningResult, IrError> {
    let mut result = LoopCloningResult::default();
    let mut cloned: Vec<BasicBlock> = Vec::with_capacity(blocks.len());

    for old_block in blocks {
        let old_insts: Vec<UniqueId> = {
            let bb = ctx
                .module()
                .function(function)
                .block(*old_block)
                .ok_or(IrError::Corrupt("cloned block is not in the function"))?;
            bb.instructions().to_vec()
        };

        let new_label_id = ctx.take_next_id().ok_or(IrError::IdOverflow)?;
        let label = ctx.alloc_inst(spvopt_ir::Instruction::new(
            Op::Label,
            0,
            new_label_id,
            [],
        ));
        let mut new_block = BasicBlock::new(label, new_label_id);
        result.value_map.insert(*old_block, new_label_id);
        result.old_to_new_block.insert(*old_block, new_label_id);
        result.new_to_old_block.insert(new_label_id, *old_block);
        result.cloned_blocks.push(new_label_id);

        for old_uid in old_insts {
            let new_uid = ctx.module_mut().clone_inst(old_uid);
            let old_result = ctx.module().inst(old_uid).result_id();
            if old_result != 0 {
                let new_result = ctx.take_next_id().ok_or(IrError::IdOverflow)?;
                ctx.module_mut().inst_mut(new_uid).set_result_id(new_result);
                result.value_map.insert(old_result, new_result);
            }
            result.uid_map.insert(old_uid, new_uid);
            new_block.push(new_uid);
        }
        cloned.push(new_block);
    }

    // Remap intra-clone references now that the whole value map is known.
    for block in &cloned {
        for uid in block.instructions() {
            let map = &result.value_map;
            ctx.module_mut()
                .inst_mut(*uid)
                .map_ids(|id| map.get(&id).copied().unwrap_or(id));
        }
    }

    ctx.module_mut()
        .function_mut(function)
        .insert_blocks_before(insert_before, cloned);
    Ok(result)
}

/// Clone `l` and attach the clone between the loop's pre-header and its
/// header, so the clone becomes a first loop running the same iteration
/// space ahead of the original.
///
/// The clone gets its own merge block branching to the original header,
/// which becomes the original loop's new pre-header; the original header
/// phis are rewired to take their incoming values from it.
pub fn clone_and_attach_loop_to_header(
    ctx: &mut IRContext,
    function: usize,
    l: &mut Loop,
) -> Result<LoopCloningResult, IrError> {
    let pre_header = l
        .pre_header()
        .ok_or(IrError::Corrupt("loop has no pre-header"))?;
    let header = l.header();
    let merge = l.merge();

    let body: Vec<Word> = l.blocks().to_vec();
    let mut result = clone_blocks(ctx, function, &body, header)?;

    // A fresh merge block for the clone, placed between the cloned body and
    // the original header, branching into the original loop.
    let clone_merge = create_block(ctx, function, Some(header))?;
    InstructionBuilder::new(ctx, function, clone_merge).add_branch(header);

    // The cloned exit edges still name the original merge block; point them
    // and the cloned OpLoopMerge at the clone's own merge.
    for new_block in result.cloned_blocks.clone() {
        let insts: Vec<UniqueId> = ctx
            .module()
            .function(function)
            .block(new_block)
            .map(|bb| bb.instructions().to_vec())
            .unwrap_or_default();
        for uid in insts {
            let inst = ctx.module_mut().inst_mut(uid);
            if inst.is_branch() || inst.is_merge() {
                inst.map_ids(|id| if id == merge { clone_merge } else { id });
            }
        }
    }

    // Enter the clone instead of the original loop.
    let clone_header = result.old_to_new_block[&header];
    retarget_branch(ctx, function, pre_header, header, clone_header);

    // The original loop is now entered from the clone's merge block.
    let header_phis: Vec<UniqueId> = {
        let module = ctx.module();
        module
            .function(function)
            .block(header)
            .map(|bb| bb.phis(module).into_vec())
            .unwrap_or_default()
    };
    for phi in header_phis {
        ctx.module_mut().inst_mut(phi).map_ids(|id| {
            if id == pre_header {
                clone_merge
            } else {
                id
            }
        });
    }

    l.set_pre_header(clone_merge);
    result.value_map.insert(merge, clone_merge);
    result.old_to_new_block.insert(merge, clone_merge);
    result.new_to_old_block.insert(clone_merge, merge);
    result.cloned_blocks.push(clone_merge);
    Ok(result)
}

/// Rewrite the branch targets of `block`'s terminator, replacing `from` with
/// `to`.
pub fn retarget_branch(ctx: &mut IRContext, function: usize, block: Word, from: Word, to: Word) {
    let term = {
        let module = ctx.module();
        module
            .function(function)
            .block(block)
            .and_then(|bb| bb.terminator_uid(module))
    };
    if let Some(term) = term {
        ctx.module_mut()
            .inst_mut(term)
            .map_ids(|id| if id == from { to } else { id });
    }
}

/// Ensure `l` has a dedicated pre-header: a block outside the loop whose
/// only successor is the header and which is the header's only out-of-loop
/// predecessor. Creates one if needed, merging multiple entry edges through
/// phis. Returns the pre-header id and whether a block was created.
pub fn get_or_create_pre_header(
    ctx: &mut IRContext,
    function: usize,
    l: &mut Loop,
) -> Result<(Word, bool), IrError> {
    if let Some(existing) = l.pre_header() {
        return Ok((existing, false));
    }
    let header = l.header();
    let cfg = ctx.get_cfg(function);
    let outside_preds: Vec<Word> = cfg
        .preds(header)
        .iter()
        .copied()
        .filter(|pred| !l.is_inside(*pred))
        .collect();
    drop(cfg);

    let pre_header = create_block(ctx, function, Some(header))?;

    // Split every header phi: out-of-loop incoming pairs move into a phi in
    // the new pre-header (or collapse to the single value).
    let header_phis: Vec<UniqueId> = {
        let module = ctx.module();
        module
            .function(function)
            .block(header)
            .map(|bb| bb.phis(module).into_vec())
            .unwrap_or_default()
    };
    for phi in header_phis {
        let (type_id, incoming): (Word, Vec<(Word, Word)>) = {
            let inst = ctx.module().inst(phi);
            (inst.type_id(), inst.phi_incoming().collect())
        };
        let (outside, inside): (Vec<_>, Vec<_>) = incoming
            .into_iter()
            .partition(|(_, pred)| outside_preds.contains(pred));
        let entry_value = match outside.len() {
            0 => continue,
            1 => outside[0].0,
            _ => {
                let mut builder = InstructionBuilder::new(ctx, function, pre_header);
                let new_phi = builder.add_phi(type_id, &outside)?;
                ctx.module().inst(new_phi).result_id()
            }
        };
        let mut operands = Vec::new();
        for (value, pred) in inside {
            operands.push(Operand::IdRef(value));
            operands.push(Operand::IdRef(pred));
        }
        operands.push(Operand::IdRef(entry_value));
        operands.push(Operand::IdRef(pre_header));
        let inst = ctx.module_mut().inst_mut(phi);
        while inst.num_operands() > 0 {
            inst.remove_operand(inst.num_operands() - 1);
        }
        for operand in operands {
            inst.push_operand(operand);
        }
    }

    for pred in outside_preds {
        retarget_branch(ctx, function, pred, header, pre_header);
    }
    InstructionBuilder::new(ctx, function, pre_header).add_branch(header);

    l.set_pre_header(pre_header);
    ctx.invalidate(
        Analyses::CFG
            | Analyses::DOMINATOR
            | Analyses::POST_DOMINATOR
            | Analyses::DEF_USE
            | Analyses::INSTR_TO_BLOCK,
    );
    Ok((pre_header, true))
}

/// Convert `l` to loop-closed SSA: every value defined inside the loop and
/// used outside is routed through a phi in the merge block.
pub fn make_loop_closed_ssa(
    ctx: &mut IRContext,
    function: usize,
    l: &Loop,
) -> Result<bool, IrError> {
    let merge = l.merge();
    let cfg = ctx.get_cfg(function);
    let merge_preds: Vec<Word> = cfg
        .preds(merge)
        .iter()
        .copied()
        .filter(|pred| l.is_inside(*pred))
        .collect();
    drop(cfg);
    if merge_preds.is_empty() {
        return Ok(false);
    }

    let block_of = ctx.instr_to_block_map();
    let merge_phis: Vec<UniqueId> = {
        let module = ctx.module();
        module
            .function(function)
            .block(merge)
            .map(|bb| bb.phis(module).into_vec())
            .unwrap_or_default()
    };

    // Collect the escaping uses first; rewiring happens after so the def-use
    // iteration is not perturbed.
    let mut escapes: Vec<(UniqueId, Word, Vec<(UniqueId, u32)>)> = Vec::new();
    {
        let defs: Vec<(UniqueId, Word)> = {
            let module = ctx.module();
            let f = module.function(function);
            let mut defs = Vec::new();
            for block in l.blocks() {
                let Some(bb) = f.block(*block) else { continue };
                for uid in bb.instructions() {
                    let inst = module.inst(*uid);
                    if inst.has_result_id() {
                        defs.push((*uid, inst.result_id()));
                    }
                }
            }
            defs
        };
        let def_use = ctx.get_def_use_mgr();
        for (def, result_id) in defs {
            let mut outside_uses = Vec::new();
            def_use.for_each_use(def, |user, index| {
                let user_block = block_of.get(&user).copied();
                let escapes_loop = match user_block {
                    Some(block) if l.is_inside(block) => false,
                    Some(block) if block == merge => !merge_phis.contains(&user),
                    Some(_) => true,
                    None => false,
                };
                if escapes_loop {
                    outside_uses.push((user, index));
                }
                true
            });
            if !outside_uses.is_empty() {
                escapes.push((def, result_id, outside_uses));
            }
        }
    }

    if escapes.is_empty() {
        return Ok(false);
    }

    for (def, result_id, uses) in escapes {
        let type_id = ctx.module().inst(def).type_id();
        let phi_id = ctx.take_next_id().ok_or(IrError::IdOverflow)?;
        let mut operands = Vec::with_capacity(merge_preds.len() * 2);
        for pred in &merge_preds {
            operands.push(Operand::IdRef(result_id));
            operands.push(Operand::IdRef(*pred));
        }
        let phi_uid = ctx.alloc_inst(spvopt_ir::Instruction::new(
            Op::Phi,
            type_id,
            phi_id,
            operands,
        ));
        let position = {
            let module = ctx.module();
            module
                .function(function)
                .block(merge)
                .map(|bb| bb.num_phis(module))
                .unwrap_or(0)
        };
        if let Some(bb) = ctx.module_mut().function_mut(function).block_mut(merge) {
            bb.insert_at(position, phi_uid);
        }
        for (user, index) in uses {
            ctx.module_mut()
                .inst_mut(user)
                .set_operand(index as usize, Operand::IdRef(phi_id));
        }
    }
    ctx.invalidate(Analyses::DEF_USE | Analyses::INSTR_TO_BLOCK);
    Ok(true)
}
