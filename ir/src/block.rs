use smallvec::SmallVec;
use spirv::Op;

use crate::{Instruction, Module, UniqueId, Word};

/// A basic block: an OpLabel followed by an ordered, non-empty sequence of
/// instructions ending in exactly one terminator.
///
/// The block id is the result id of its label. Blocks hold handles into the
/// module arena rather than the instructions themselves, so structural edits
/// (hoisting, cloning, killing) are handle moves that never invalidate other
/// references.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    label: UniqueId,
    id: Word,
    insts: Vec<UniqueId>,
}

impl BasicBlock {
    pub fn new(label: UniqueId, id: Word) -> Self {
        Self {
            label,
            id,
            insts: Vec::new(),
        }
    }

    /// The block id, i.e. the result id of the block's OpLabel.
    #[inline]
    pub fn id(&self) -> Word {
        self.id
    }

    #[inline]
    pub fn label(&self) -> UniqueId {
        self.label
    }

    /// Update the label result id. Keeps the cached block id in sync; the
    /// label instruction itself must be updated by the caller.
    pub(crate) fn set_id(&mut self, id: Word) {
        self.id = id;
    }

    /// The instruction handles of the block body, in order. The label is not
    /// part of this list.
    #[inline]
    pub fn instructions(&self) -> &[UniqueId] {
        &self.insts
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    pub fn push(&mut self, inst: UniqueId) {
        self.insts.push(inst);
    }

    /// Insert `inst` immediately before `point`.
    ///
    /// # Panics
    ///
    /// Panics if `point` is not in this block.
    pub fn insert_before(&mut self, point: UniqueId, inst: UniqueId) {
        let index = self
            .insts
            .iter()
            .position(|uid| *uid == point)
            .expect("insertion point is not in this block");
        self.insts.insert(index, inst);
    }

    /// Insert `inst` before the terminator, or at the end of a block that has
    /// no terminator yet.
    pub fn insert_before_terminator(&mut self, module: &Module, inst: UniqueId) {
        match self.terminator_uid(module) {
            Some(term) => self.insert_before(term, inst),
            None => self.insts.push(inst),
        }
    }

    /// Insert `inst` at the top of the block, after any leading phis.
    pub fn insert_after_phis(&mut self, module: &Module, inst: UniqueId) {
        let index = self
            .insts
            .iter()
            .position(|uid| !module.inst(*uid).is_phi())
            .unwrap_or(self.insts.len());
        self.insts.insert(index, inst);
    }

    /// Insert `inst` at `index` in the block body.
    pub fn insert_at(&mut self, index: usize, inst: UniqueId) {
        self.insts.insert(index, inst);
    }

    /// Number of leading OpPhi instructions.
    pub fn num_phis(&self, module: &Module) -> usize {
        self.insts
            .iter()
            .take_while(|uid| module.inst(**uid).is_phi())
            .count()
    }

    /// Remove `inst` from the block body. Returns false if it was not there.
    pub fn remove(&mut self, inst: UniqueId) -> bool {
        match self.insts.iter().position(|uid| *uid == inst) {
            Some(index) => {
                self.insts.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, inst: UniqueId) -> bool {
        self.insts.contains(&inst)
    }

    /// The block terminator, if the block is complete.
    pub fn terminator<'m>(&self, module: &'m Module) -> Option<&'m Instruction> {
        let uid = *self.insts.last()?;
        let inst = module.inst(uid);
        inst.is_terminator().then_some(inst)
    }

    pub fn terminator_uid(&self, module: &Module) -> Option<UniqueId> {
        let uid = *self.insts.last()?;
        module.inst(uid).is_terminator().then_some(uid)
    }

    /// The merge instruction (OpLoopMerge or OpSelectionMerge) sitting
    /// immediately before the terminator, if any.
    pub fn merge_inst<'m>(&self, module: &'m Module) -> Option<&'m Instruction> {
        if self.insts.len() < 2 {
            return None;
        }
        let inst = module.inst(self.insts[self.insts.len() - 2]);
        inst.is_merge().then_some(inst)
    }

    pub fn merge_inst_uid(&self, module: &Module) -> Option<UniqueId> {
        if self.insts.len() < 2 {
            return None;
        }
        let uid = self.insts[self.insts.len() - 2];
        module.inst(uid).is_merge().then_some(uid)
    }

    /// The OpLoopMerge of this block, if it is a loop header.
    pub fn loop_merge_inst<'m>(&self, module: &'m Module) -> Option<&'m Instruction> {
        self.merge_inst(module)
            .filter(|inst| inst.opcode() == Op::LoopMerge)
    }

    /// Handles of the leading OpPhi instructions.
    pub fn phis(&self, module: &Module) -> SmallVec<[UniqueId; 2]> {
        self.insts
            .iter()
            .copied()
            .take_while(|uid| module.inst(*uid).is_phi())
            .collect()
    }

    /// The successor labels named by the terminator, in branch order.
    pub fn successors(&self, module: &Module) -> SmallVec<[Word; 2]> {
        self.terminator(module)
            .map(|term| term.branch_targets())
            .unwrap_or_default()
    }
}
