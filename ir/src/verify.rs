//! Structural verification of functions, for use at pass boundaries in
//! tests. Checks the block-level invariants every transformation must
//! preserve; it is not a full validator.

use rustc_hash::FxHashSet;
use spirv::Op;

use crate::{ControlFlowGraph, Function, IrError, Module};

/// Verify the structural invariants of `function`:
///
/// * every block ends in exactly one terminator, with no terminator earlier
///   in the body;
/// * merge instructions sit immediately before the terminator, and nowhere
///   else;
/// * phis are contiguous at the top of their block, and their incoming
///   predecessors are exactly the block's CFG predecessors;
/// * every branch target and every block named by a merge instruction is a
///   block of the function.
pub fn verify_function(module: &Module, function: &Function) -> Result<(), IrError> {
    let cfg = ControlFlowGraph::new(module, function);
    let block_ids: FxHashSet<_> = function.blocks().iter().map(|bb| bb.id()).collect();

    for bb in function.blocks() {
        let insts = bb.instructions();
        if insts.is_empty() {
            return Err(IrError::Corrupt("block has no instructions"));
        }
        let last = insts.len() - 1;
        for (position, uid) in insts.iter().enumerate() {
            let inst = module.inst(*uid);
            if inst.is_terminator() && position != last {
                return Err(IrError::Corrupt("terminator before the end of a block"));
            }
            if inst.is_merge() && position + 1 != last {
                return Err(IrError::Corrupt(
                    "merge instruction not immediately before the terminator",
                ));
            }
        }
        let term = module.inst(insts[last]);
        if !term.is_terminator() {
            return Err(IrError::Corrupt("block does not end in a terminator"));
        }
        for target in term.branch_targets() {
            if !block_ids.contains(&target) {
                return Err(IrError::Corrupt("branch to a block not in the function"));
            }
        }
        if let Some(merge) = bb.merge_inst(module) {
            if !block_ids.contains(&merge.single_word_operand(0)) {
                return Err(IrError::Corrupt("merge declaration names a missing block"));
            }
            if merge.opcode() == Op::LoopMerge
                && !block_ids.contains(&merge.single_word_operand(1))
            {
                return Err(IrError::Corrupt("continue target is a missing block"));
            }
        }

        let mut past_phis = false;
        for uid in insts {
            let inst = module.inst(*uid);
            if inst.is_phi() {
                if past_phis {
                    return Err(IrError::Corrupt("phi after a non-phi instruction"));
                }
                let mut preds: Vec<_> = cfg.preds(bb.id()).to_vec();
                let mut incoming: Vec<_> = inst.phi_incoming().map(|(_, pred)| pred).collect();
                preds.sort_unstable();
                incoming.sort_unstable();
                if preds != incoming {
                    return Err(IrError::Corrupt(
                        "phi incoming blocks disagree with the predecessors",
                    ));
                }
            } else {
                past_phis = true;
            }
        }
    }
    Ok(())
}

/// Verify every function of `module`.
pub fn verify_module(module: &Module) -> Result<(), IrError> {
    for function in module.functions() {
        verify_function(module, function)?;
    }
    Ok(())
}
