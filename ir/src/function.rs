use crate::{BasicBlock, Module, UniqueId, Word};

/// A function: an OpFunction, its parameters, and an ordered sequence of
/// basic blocks of which the first is the entry.
#[derive(Debug, Clone)]
pub struct Function {
    def: UniqueId,
    params: Vec<UniqueId>,
    blocks: Vec<BasicBlock>,
    end: UniqueId,
}

impl Function {
    pub fn new(def: UniqueId, end: UniqueId) -> Self {
        Self {
            def,
            params: Vec::new(),
            blocks: Vec::new(),
            end,
        }
    }

    /// Handle of the defining OpFunction.
    #[inline]
    pub fn def(&self) -> UniqueId {
        self.def
    }

    /// The function's result id.
    pub fn result_id(&self, module: &Module) -> Word {
        module.inst(self.def).result_id()
    }

    #[inline]
    pub fn params(&self) -> &[UniqueId] {
        &self.params
    }

    pub fn push_param(&mut self, param: UniqueId) {
        self.params.push(param);
    }

    #[inline]
    pub fn end(&self) -> UniqueId {
        self.end
    }

    #[inline]
    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    #[inline]
    pub fn blocks_mut(&mut self) -> &mut [BasicBlock] {
        &mut self.blocks
    }

    /// The entry block. Only empty function declarations have none.
    pub fn entry(&self) -> Option<&BasicBlock> {
        self.blocks.first()
    }

    pub fn block(&self, id: Word) -> Option<&BasicBlock> {
        self.blocks.iter().find(|bb| bb.id() == id)
    }

    pub fn block_mut(&mut self, id: Word) -> Option<&mut BasicBlock> {
        self.blocks.iter_mut().find(|bb| bb.id() == id)
    }

    pub fn block_position(&self, id: Word) -> Option<usize> {
        self.blocks.iter().position(|bb| bb.id() == id)
    }

    pub fn push_block(&mut self, block: BasicBlock) {
        self.blocks.push(block);
    }

    /// Insert `blocks` immediately before the block with id `point`.
    ///
    /// # Panics
    ///
    /// Panics if `point` is not a block of this function.
    pub fn insert_blocks_before(&mut self, point: Word, blocks: impl IntoIterator<Item = BasicBlock>) {
        let index = self
            .block_position(point)
            .expect("insertion point is not a block of this function");
        let mut tail = self.blocks.split_off(index);
        self.blocks.extend(blocks);
        self.blocks.append(&mut tail);
    }

    /// Insert `blocks` immediately after the block with id `point`.
    pub fn insert_blocks_after(&mut self, point: Word, blocks: impl IntoIterator<Item = BasicBlock>) {
        let index = self
            .block_position(point)
            .expect("insertion point is not a block of this function");
        let mut tail = self.blocks.split_off(index + 1);
        self.blocks.extend(blocks);
        self.blocks.append(&mut tail);
    }

    /// Remove the block with id `id`, returning it.
    pub fn remove_block(&mut self, id: Word) -> Option<BasicBlock> {
        let index = self.block_position(id)?;
        Some(self.blocks.remove(index))
    }
}
