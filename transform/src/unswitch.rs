//! Loop unswitching: hoisting a loop-invariant conditional branch or switch
//! out of the loop by cloning the loop once per selector value.
//!
//! Each clone is specialised by substituting the selector with the constant
//! it is cloned for and folding every branch whose condition became a
//! constant; blocks made unreachable disappear, except merge targets of
//! surviving constructs, which become OpUnreachable. A new branch (or
//! switch) in the old pre-header dispatches over the selector to the
//! specialised loops, and the landing-pad phis below the old merge are
//! extended with one incoming edge per surviving clone.

use rustc_hash::{FxHashMap, FxHashSet};
use spirv::Op;

use spvopt_ir::{
    builder::create_block, Analyses, IRContext, Instruction, InstructionBuilder, IrError,
    LoopDescriptor, LoopIndex, Operand, Pass, PassStatus, UniqueId, Word,
};

use crate::loop_utils::{
    clone_blocks, get_or_create_pre_header, make_loop_closed_ssa, retarget_branch,
    LoopCloningResult,
};

#[derive(Default)]
pub struct LoopUnswitchPass;

impl Pass for LoopUnswitchPass {
    fn name(&self) -> &'static str {
        "loop-unswitch"
    }

    fn process(&mut self, ctx: &mut IRContext) -> PassStatus {
        let mut modified = false;
        for function in 0..ctx.module().functions().len() {
            // Each successful unswitch folds the branch it hoisted, so the
            // candidate search converges; the guard bounds pathological
            // inputs.
            for _ in 0..64 {
                let descriptor = ctx.build_loop_descriptor(function);
                let candidate = (0..descriptor.num_loops())
                    .find_map(|index| {
                        find_unswitchable(ctx, function, &descriptor, index)
                            .map(|block| (index, block))
                    });
                let Some((index, switch_block)) = candidate else {
                    break;
                };
                match unswitch(ctx, function, &descriptor, index, switch_block) {
                    Ok(()) => {
                        modified = true;
                        ctx.invalidate_all_except(Analyses::LOOP_ANALYSIS);
                    }
                    Err(_) => return PassStatus::Failure,
                }
            }
        }
        if modified {
            PassStatus::SuccessWithChange
        } else {
            PassStatus::SuccessWithoutChange
        }
    }
}

/// Find a block of the loop whose multi-way terminator tests a value whose
/// definition lives outside the loop. The loop's own exit branch does not
/// count, and the loop must be safe to duplicate.
pub fn find_unswitchable(
    ctx: &mut IRContext,
    function: usize,
    descriptor: &LoopDescriptor,
    index: LoopIndex,
) -> Option<Word> {
    let l = descriptor.get(index);
    if !l.is_safe_to_clone(ctx.module(), ctx.module().function(function)) {
        return None;
    }
    let cfg = ctx.get_cfg(function);
    let condition_block =
        l.find_condition_block(ctx.module(), ctx.module().function(function), &cfg);
    drop(cfg);

    let blocks: Vec<Word> = l.blocks().to_vec();
    for block in blocks {
        if Some(block) == condition_block || block == l.header() {
            continue;
        }
        let selector = {
            let module = ctx.module();
            let bb = module.function(function).block(block)?;
            let term = bb.terminator(module)?;
            if !matches!(term.opcode(), Op::BranchConditional | Op::Switch) {
                continue;
            }
            term.single_word_operand(0)
        };
        let def = {
            let def_use = ctx.get_def_use_mgr();
            def_use.get_def(selector)
        };
        let Some(def) = def else { continue };
        if ctx.module().inst(def).is_constant() {
            continue;
        }
        match ctx.get_instr_block(def) {
            Some(def_block) if descriptor.get(index).is_inside(def_block) => continue,
            _ => return Some(block),
        }
    }
    None
}

/// One clone to produce: the selector constant driving it (`None` for a
/// switch default) and, once cloned, its entry block.
struct Specialisation {
    constant: Option<Word>,
    case_literal: Option<u32>,
    entry: Word,
}

fn unswitch(
    ctx: &mut IRContext,
    function: usize,
    descriptor: &LoopDescriptor,
    index: LoopIndex,
    switch_block: Word,
) -> Result<(), IrError> {
    let mut l = descriptor.get(index).clone();
    get_or_create_pre_header(ctx, function, &mut l)?;
    make_loop_closed_ssa(ctx, function, &l)?;

    let header = l.header();
    let if_merge = l.merge();

    // Record the loop's exit edges before restructuring.
    let exit_preds: Vec<Word> = {
        let cfg = ctx.get_cfg(function);
        cfg.preds(if_merge).to_vec()
    };

    // Step 1: the old merge becomes the if-merge; the loop gets a fresh
    // merge block in front of it carrying the loop-closed phis.
    let loop_merge_block = create_block(ctx, function, Some(if_merge))?;
    InstructionBuilder::new(ctx, function, loop_merge_block).add_branch(if_merge);

    let merge_phis: Vec<UniqueId> = {
        let module = ctx.module();
        module
            .function(function)
            .block(if_merge)
            .map(|bb| bb.phis(module).into_vec())
            .unwrap_or_default()
    };
    for (position, phi) in merge_phis.iter().enumerate() {
        // Move the loop-closed phi down into the new merge block and leave
        // a single-source phi behind as the landing pad.
        let (type_id, operands): (Word, Vec<Operand>) = {
            let inst = ctx.module().inst(*phi);
            (inst.type_id(), inst.operands().to_vec())
        };
        let clone_id = ctx.take_next_id().ok_or(IrError::IdOverflow)?;
        let clone_uid = ctx.alloc_inst(Instruction::new(Op::Phi, type_id, clone_id, operands));
        if let Some(bb) = ctx
            .module_mut()
            .function_mut(function)
            .block_mut(loop_merge_block)
        {
            bb.insert_at(position, clone_uid);
        }
        let phi_inst = ctx.module_mut().inst_mut(*phi);
        while phi_inst.num_operands() > 0 {
            phi_inst.remove_operand(phi_inst.num_operands() - 1);
        }
        phi_inst.push_operand(Operand::IdRef(clone_id));
        phi_inst.push_operand(Operand::IdRef(loop_merge_block));
    }
    for pred in exit_preds {
        if pred == loop_merge_block {
            continue;
        }
        retarget_branch(ctx, function, pred, if_merge, loop_merge_block);
        // Merge declarations naming the old merge follow the edge.
        let merge_insts: Vec<UniqueId> = {
            let module = ctx.module();
            module
                .function(function)
                .block(pred)
                .and_then(|bb| bb.merge_inst_uid(module))
                .into_iter()
                .collect()
        };
        for uid in merge_insts {
            ctx.module_mut().inst_mut(uid).map_ids(|id| {
                if id == if_merge {
                    loop_merge_block
                } else {
                    id
                }
            });
        }
    }
    let header_merge_inst = {
        let module = ctx.module();
        module
            .function(function)
            .block(header)
            .and_then(|bb| bb.merge_inst_uid(module))
            .ok_or(IrError::Corrupt("unswitched loop lost its merge"))?
    };
    ctx.module_mut().inst_mut(header_merge_inst).map_ids(|id| {
        if id == if_merge {
            loop_merge_block
        } else {
            id
        }
    });
    l.set_merge(loop_merge_block);

    // Step 2: split the pre-header; the old one becomes the if-block.
    let if_block = l
        .pre_header()
        .ok_or(IrError::Corrupt("unswitched loop has no pre-header"))?;
    let loop_pre_header = create_block(ctx, function, Some(header))?;
    InstructionBuilder::new(ctx, function, loop_pre_header).add_branch(header);
    retarget_branch(ctx, function, if_block, header, loop_pre_header);
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
            if id == if_block {
                loop_pre_header
            } else {
                id
            }
        });
    }
    l.set_pre_header(loop_pre_header);

    // Step 3: enumerate the specialisations to clone.
    let (selector_opcode, selector) = {
        let module = ctx.module();
        let term = module
            .function(function)
            .block(switch_block)
            .and_then(|bb| bb.terminator(module))
            .ok_or(IrError::Corrupt("switch block lost its terminator"))?;
        (term.opcode(), term.single_word_operand(0))
    };
    let mut specialisations: Vec<Specialisation> = Vec::new();
    let original_constant: Option<Word>;
    match selector_opcode {
        Op::BranchConditional => {
            let false_const = InstructionBuilder::new(ctx, function, 0)
                .get_or_add_bool_constant(false)?;
            original_constant = Some(
                InstructionBuilder::new(ctx, function, 0).get_or_add_bool_constant(true)?,
            );
            specialisations.push(Specialisation {
                constant: Some(false_const),
                case_literal: None,
                entry: 0,
            });
        }
        Op::Switch => {
            original_constant = None;
            let selector_type = {
                let module = ctx.module();
                module
                    .find_def_inst(selector)
                    .map(|uid| module.inst(uid).type_id())
                    .unwrap_or(0)
            };
            let cases: Vec<u32> = {
                let module = ctx.module();
                let term = module
                    .function(function)
                    .block(switch_block)
                    .and_then(|bb| bb.terminator(module))
                    .unwrap();
                term.operands()
                    .chunks_exact(2)
                    .skip(1)
                    .filter_map(|pair| match pair {
                        [Operand::LiteralBit32(literal), Operand::IdRef(_)] => Some(*literal),
                        _ => None,
                    })
                    .collect()
            };
            for literal in cases {
                let constant = InstructionBuilder::new(ctx, function, 0)
                    .get_or_add_int_constant(selector_type, u64::from(literal))?;
                specialisations.push(Specialisation {
                    constant: Some(constant),
                    case_literal: Some(literal),
                    entry: 0,
                });
            }
        }
        _ => return Err(IrError::Corrupt("unswitch selector is not a branch")),
    }

    // Step 4: clone and specialise.
    let region: Vec<Word> = {
        let mut region = vec![loop_pre_header];
        region.extend(l.blocks().iter().copied());
        region.push(loop_merge_block);
        region
    };
    for spec in specialisations.iter_mut() {
        let clone = clone_blocks(ctx, function, &region, loop_pre_header)?;
        spec.entry = clone.old_to_new_block[&loop_pre_header];
        specialise_region(
            ctx,
            function,
            &clone.cloned_blocks.clone(),
            clone.old_to_new_block[&loop_pre_header],
            selector,
            spec.constant,
            spec.case_literal,
            if_merge,
            Some(&clone),
        )?;
    }

    // Step 5: specialise the original loop with the value it keeps.
    specialise_region(
        ctx,
        function,
        &region,
        loop_pre_header,
        selector,
        original_constant,
        None,
        if_merge,
        None,
    )?;

    // Finally: dispatch over the selector from the if-block.
    let if_term = {
        let module = ctx.module();
        module
            .function(function)
            .block(if_block)
            .and_then(|bb| bb.terminator_uid(module))
    };
    if let Some(term) = if_term {
        ctx.kill_inst(term);
    }
    match selector_opcode {
        Op::BranchConditional => {
            InstructionBuilder::new(ctx, function, if_block).add_conditional_branch(
                selector,
                loop_pre_header,
                specialisations[0].entry,
                Some(if_merge),
            );
        }
        Op::Switch => {
            let cases: Vec<(u32, Word)> = specialisations
                .iter()
                .filter_map(|spec| spec.case_literal.map(|literal| (literal, spec.entry)))
                .collect();
            InstructionBuilder::new(ctx, function, if_block).add_switch(
                selector,
                loop_pre_header,
                &cases,
                Some(if_merge),
            );
        }
        _ => unreachable!(),
    }
    Ok(())
}

/// Specialise one copy of the loop for a known selector value: substitute,
/// fold the branches that became constant, drop unreachable blocks, and
/// patch the phis left behind.
#[allow(clippy::too_many_arguments)]
fn specialise_region(
    ctx: &mut IRContext,
    function: usize,
    region: &[Word],
    entry: Word,
    selector: Word,
    constant: Option<Word>,
    case_literal: Option<u32>,
    if_merge: Word,
    clone: Option<&LoopCloningResult>,
) -> Result<(), IrError> {
    let region_set: FxHashSet<Word> = region.iter().copied().collect();

    // Substitute the selector's uses within the region.
    if let Some(constant) = constant {
        for block in region {
            let insts: Vec<UniqueId> = ctx
                .module()
                .function(function)
                .block(*block)
                .map(|bb| bb.instructions().to_vec())
                .unwrap_or_default();
            for uid in insts {
                ctx.module_mut()
                    .inst_mut(uid)
                    .map_ids(|id| if id == selector { constant } else { id });
            }
        }
    }

    // Fold every multi-way branch whose selector is now a constant.
    for block in region {
        fold_constant_terminator(ctx, function, *block, selector, constant, case_literal)?;
    }

    // Reachability within the region from its entry.
    let mut live: FxHashSet<Word> = FxHashSet::default();
    let mut stack = vec![entry];
    while let Some(block) = stack.pop() {
        if !live.insert(block) {
            continue;
        }
        let successors = {
            let module = ctx.module();
            module
                .function(function)
                .block(block)
                .map(|bb| bb.successors(module))
                .unwrap_or_default()
        };
        for succ in successors {
            if region_set.contains(&succ) && !live.contains(&succ) {
                stack.push(succ);
            }
        }
    }

    // Patch phis in live blocks: drop incoming pairs whose predecessor died
    // or no longer branches here.
    let mut edges: FxHashMap<Word, FxHashSet<Word>> = FxHashMap::default();
    for block in &live {
        let successors = {
            let module = ctx.module();
            module
                .function(function)
                .block(*block)
                .map(|bb| bb.successors(module))
                .unwrap_or_default()
        };
        for succ in successors {
            edges.entry(succ).or_default().insert(*block);
        }
    }
    for block in &live {
        let phis: Vec<UniqueId> = {
            let module = ctx.module();
            module
                .function(function)
                .block(*block)
                .map(|bb| bb.phis(module).into_vec())
                .unwrap_or_default()
        };
        let preds = edges.get(block).cloned().unwrap_or_default();
        for phi in phis {
            let incoming: Vec<(Word, Word)> =
                ctx.module().inst(phi).phi_incoming().collect();
            let kept: Vec<(Word, Word)> = incoming
                .iter()
                .copied()
                .filter(|(_, pred)| !region_set.contains(pred) || preds.contains(pred))
                .collect();
            if kept.len() != incoming.len() {
                let inst = ctx.module_mut().inst_mut(phi);
                while inst.num_operands() > 0 {
                    inst.remove_operand(inst.num_operands() - 1);
                }
                for (value, pred) in kept {
                    inst.push_operand(Operand::IdRef(value));
                    inst.push_operand(Operand::IdRef(pred));
                }
            }
        }
    }

    // The merge targets named by surviving constructs must stay as labels
    // even when unreachable.
    let mut protected: FxHashSet<Word> = FxHashSet::default();
    for block in &live {
        let module = ctx.module();
        if let Some(bb) = module.function(function).block(*block) {
            if let Some(merge_inst) = bb.merge_inst(module) {
                protected.insert(merge_inst.single_word_operand(0));
                if merge_inst.opcode() == Op::LoopMerge {
                    protected.insert(merge_inst.single_word_operand(1));
                }
            }
        }
    }

    for block in region {
        if live.contains(block) {
            continue;
        }
        let insts: Vec<UniqueId> = ctx
            .module()
            .function(function)
            .block(*block)
            .map(|bb| bb.instructions().to_vec())
            .unwrap_or_default();
        for uid in insts {
            ctx.kill_inst(uid);
        }
        if protected.contains(block) {
            // Keep the label, make the block vacuously terminated.
            InstructionBuilder::new(ctx, function, *block).add_unreachable();
        } else {
            let label = ctx
                .module()
                .function(function)
                .block(*block)
                .map(|bb| bb.label());
            ctx.module_mut().function_mut(function).remove_block(*block);
            if let Some(label) = label {
                ctx.kill_inst(label);
            }
        }
    }

    // Extend (or prune) the landing-pad phis in the if-merge block.
    let pad_phis: Vec<UniqueId> = {
        let module = ctx.module();
        module
            .function(function)
            .block(if_merge)
            .map(|bb| bb.phis(module).into_vec())
            .unwrap_or_default()
    };
    match clone {
        Some(clone) => {
            // The original loop-merge block was cloned; if its clone is
            // alive it now also flows into the if-merge.
            for phi in pad_phis {
                let incoming: Vec<(Word, Word)> =
                    ctx.module().inst(phi).phi_incoming().collect();
                let mut additions = Vec::new();
                for (value, pred) in incoming {
                    if let Some(cloned_pred) = clone.old_to_new_block.get(&pred) {
                        if live.contains(cloned_pred) {
                            let cloned_value =
                                clone.value_map.get(&value).copied().unwrap_or(value);
                            additions.push((cloned_value, *cloned_pred));
                        }
                    }
                }
                let inst = ctx.module_mut().inst_mut(phi);
                for (value, pred) in additions {
                    inst.push_operand(Operand::IdRef(value));
                    inst.push_operand(Operand::IdRef(pred));
                }
            }
        }
        None => {
            for phi in pad_phis {
                let incoming: Vec<(Word, Word)> =
                    ctx.module().inst(phi).phi_incoming().collect();
                let kept: Vec<(Word, Word)> = incoming
                    .into_iter()
                    .filter(|(_, pred)| !region_set.contains(pred) || live.contains(pred))
                    .collect();
                let inst = ctx.module_mut().inst_mut(phi);
                while inst.num_operands() > 0 {
                    inst.remove_operand(inst.num_operands() - 1);
                }
                for (value, pred) in kept {
                    inst.push_operand(Operand::IdRef(value));
                    inst.push_operand(Operand::IdRef(pred));
                }
            }
        }
    }

    Ok(())
}

/// If `block` ends in a conditional branch on a boolean constant, or a
/// switch on an integer constant, collapse it to the taken branch. The
/// accompanying OpSelectionMerge goes with it.
fn fold_constant_terminator(
    ctx: &mut IRContext,
    function: usize,
    block: Word,
    selector: Word,
    constant: Option<Word>,
    case_literal: Option<u32>,
) -> Result<(), IrError> {
    let decision = {
        let module = ctx.module();
        let Some(bb) = module.function(function).block(block) else {
            return Ok(());
        };
        let Some(term) = bb.terminator(module) else {
            return Ok(());
        };
        match term.opcode() {
            Op::BranchConditional => {
                let condition = term.single_word_operand(0);
                let def = module.find_def_inst(condition);
                match def.map(|uid| module.inst(uid).opcode()) {
                    Some(Op::ConstantTrue) => Some(term.single_word_operand(1)),
                    Some(Op::ConstantFalse) => Some(term.single_word_operand(2)),
                    _ => None,
                }
            }
            Op::Switch => {
                let tested = term.single_word_operand(0);
                match case_literal {
                    // The selector was substituted by a known constant: fold
                    // this switch to the matching case arm.
                    Some(literal) if Some(tested) == constant => {
                        let mut target = term.single_word_operand(1);
                        let operands = term.operands();
                        let mut i = 2;
                        while i + 1 < operands.len() {
                            if let (Operand::LiteralBit32(case), Operand::IdRef(label)) =
                                (&operands[i], &operands[i + 1])
                            {
                                if *case == literal {
                                    target = *label;
                                }
                            }
                            i += 2;
                        }
                        Some(target)
                    }
                    // Keeping the default arm of the unswitched switch.
                    None if tested == selector => Some(term.single_word_operand(1)),
                    _ => None,
                }
            }
            _ => None,
        }
    };

    let Some(target) = decision else {
        return Ok(());
    };
    let (term, merge_inst) = {
        let module = ctx.module();
        let bb = module.function(function).block(block).unwrap();
        // A loop header's declaration must survive; folding its terminator
        // would dissolve the loop construct.
        if let Some(merge) = bb.merge_inst(module) {
            if merge.opcode() == Op::LoopMerge {
                return Ok(());
            }
        }
        (bb.terminator_uid(module), bb.merge_inst_uid(module))
    };
    if let Some(merge_inst) = merge_inst {
        ctx.kill_inst(merge_inst);
    }
    if let Some(term) = term {
        ctx.kill_inst(term);
    }
    InstructionBuilder::new(ctx, function, block).add_branch(target);
    Ok(())
}
