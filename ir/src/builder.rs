use spirv::Op;

use crate::{
    context::{Analyses, IRContext},
    BasicBlock, Instruction, IrError, Operand, UniqueId, Word,
};

/// Where an [InstructionBuilder] places new instructions within its block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPoint {
    /// Append at the end of the block (used while a block is being filled).
    End,
    /// Insert immediately before the block terminator.
    BeforeTerminator,
    /// Insert immediately before a specific instruction.
    Before(UniqueId),
}

/// Appends or inserts instructions into one block of one function, keeping
/// the requested analyses up to date as it goes.
///
/// Builders are cheap and short-lived: create one per block being edited,
/// with `preserved` naming the analyses (def-use, instruction-to-block) that
/// should track the new instructions instead of being invalidated.
pub struct InstructionBuilder<'ctx> {
    ctx: &'ctx mut IRContext,
    function: usize,
    block: Word,
    point: InsertPoint,
    preserved: Analyses,
}

impl<'ctx> InstructionBuilder<'ctx> {
    pub fn new(ctx: &'ctx mut IRContext, function: usize, block: Word) -> Self {
        Self {
            ctx,
            function,
            block,
            point: InsertPoint::End,
            preserved: Analyses::NONE,
        }
    }

    /// Keep `analyses` updated for every instruction this builder adds.
    pub fn preserving(mut self, analyses: Analyses) -> Self {
        self.preserved = analyses;
        self
    }

    pub fn at(mut self, point: InsertPoint) -> Self {
        self.point = point;
        self
    }

    pub fn set_insert_point(&mut self, point: InsertPoint) {
        self.point = point;
    }

    #[inline]
    pub fn block(&self) -> Word {
        self.block
    }

    pub fn context(&mut self) -> &mut IRContext {
        self.ctx
    }

    /// Place `inst` at the current insert point.
    ///
    /// `BeforeTerminator` degrades to appending while the block is still
    /// being filled and has no terminator yet.
    pub fn add_instruction(&mut self, inst: Instruction) -> UniqueId {
        let block = self.block;
        let target = match self.point {
            InsertPoint::End => None,
            InsertPoint::Before(at) => Some(at),
            InsertPoint::BeforeTerminator => {
                let module = self.ctx.module();
                module
                    .function(self.function)
                    .block(block)
                    .and_then(|bb| bb.terminator_uid(module))
            }
        };
        let uid = self.ctx.alloc_inst(inst);
        {
            let module = self.ctx.module_mut();
            let bb = module
                .function_mut(self.function)
                .block_mut(block)
                .expect("builder block disappeared");
            match target {
                Some(at) => bb.insert_before(at, uid),
                None => bb.push(uid),
            }
        }
        if self.preserved.contains(Analyses::DEF_USE) {
            self.ctx.analyze_uses(uid);
        }
        if self.preserved.contains(Analyses::INSTR_TO_BLOCK) {
            self.ctx.set_instr_block(uid, block);
        }
        uid
    }

    /// Append an OpBranch to `target`.
    pub fn add_branch(&mut self, target: Word) -> UniqueId {
        self.add_instruction(Instruction::new(Op::Branch, 0, 0, [Operand::IdRef(target)]))
    }

    /// Append an OpBranchConditional, optionally preceded by an
    /// OpSelectionMerge declaring `merge`.
    pub fn add_conditional_branch(
        &mut self,
        condition: Word,
        true_target: Word,
        false_target: Word,
        merge: Option<Word>,
    ) -> UniqueId {
        if let Some(merge) = merge {
            self.add_instruction(Instruction::new(
                Op::SelectionMerge,
                0,
                0,
                [
                    Operand::IdRef(merge),
                    Operand::SelectionControl(spirv::SelectionControl::NONE),
                ],
            ));
        }
        self.add_instruction(Instruction::new(
            Op::BranchConditional,
            0,
            0,
            [
                Operand::IdRef(condition),
                Operand::IdRef(true_target),
                Operand::IdRef(false_target),
            ],
        ))
    }

    /// Append an OpSwitch, optionally preceded by an OpSelectionMerge.
    pub fn add_switch(
        &mut self,
        selector: Word,
        default: Word,
        cases: &[(u32, Word)],
        merge: Option<Word>,
    ) -> UniqueId {
        if let Some(merge) = merge {
            self.add_instruction(Instruction::new(
                Op::SelectionMerge,
                0,
                0,
                [
                    Operand::IdRef(merge),
                    Operand::SelectionControl(spirv::SelectionControl::NONE),
                ],
            ));
        }
        let mut operands = vec![Operand::IdRef(selector), Operand::IdRef(default)];
        for (literal, target) in cases {
            operands.push(Operand::LiteralBit32(*literal));
            operands.push(Operand::IdRef(*target));
        }
        self.add_instruction(Instruction::new(Op::Switch, 0, 0, operands))
    }

    /// Append an OpLoopMerge declaring `merge` and `continue_target`.
    pub fn add_loop_merge(&mut self, merge: Word, continue_target: Word) -> UniqueId {
        self.add_instruction(Instruction::new(
            Op::LoopMerge,
            0,
            0,
            [
                Operand::IdRef(merge),
                Operand::IdRef(continue_target),
                Operand::LoopControl(spirv::LoopControl::NONE),
            ],
        ))
    }

    pub fn add_return(&mut self) -> UniqueId {
        self.add_instruction(Instruction::new(Op::Return, 0, 0, []))
    }

    pub fn add_unreachable(&mut self) -> UniqueId {
        self.add_instruction(Instruction::new(Op::Unreachable, 0, 0, []))
    }

    /// Append an OpPhi with the given `(value, predecessor)` pairs.
    pub fn add_phi(
        &mut self,
        type_id: Word,
        incoming: &[(Word, Word)],
    ) -> Result<UniqueId, IrError> {
        let result = self.ctx.take_next_id().ok_or(IrError::IdOverflow)?;
        let mut operands = Vec::with_capacity(incoming.len() * 2);
        for (value, pred) in incoming {
            operands.push(Operand::IdRef(*value));
            operands.push(Operand::IdRef(*pred));
        }
        Ok(self.add_instruction(Instruction::new(Op::Phi, type_id, result, operands)))
    }

    pub fn add_binary_op(
        &mut self,
        op: Op,
        type_id: Word,
        lhs: Word,
        rhs: Word,
    ) -> Result<UniqueId, IrError> {
        let result = self.ctx.take_next_id().ok_or(IrError::IdOverflow)?;
        Ok(self.add_instruction(Instruction::new(
            op,
            type_id,
            result,
            [Operand::IdRef(lhs), Operand::IdRef(rhs)],
        )))
    }

    pub fn add_load(&mut self, type_id: Word, pointer: Word) -> Result<UniqueId, IrError> {
        let result = self.ctx.take_next_id().ok_or(IrError::IdOverflow)?;
        Ok(self.add_instruction(Instruction::new(
            Op::Load,
            type_id,
            result,
            [Operand::IdRef(pointer)],
        )))
    }

    pub fn add_store(&mut self, pointer: Word, value: Word) -> UniqueId {
        self.add_instruction(Instruction::new(
            Op::Store,
            0,
            0,
            [Operand::IdRef(pointer), Operand::IdRef(value)],
        ))
    }

    pub fn add_access_chain(
        &mut self,
        type_id: Word,
        base: Word,
        indexes: &[Word],
    ) -> Result<UniqueId, IrError> {
        let result = self.ctx.take_next_id().ok_or(IrError::IdOverflow)?;
        let mut operands = vec![Operand::IdRef(base)];
        operands.extend(indexes.iter().map(|id| Operand::IdRef(*id)));
        Ok(self.add_instruction(Instruction::new(Op::AccessChain, type_id, result, operands)))
    }

    /// Find or create a 32-bit unsigned integer constant in the global
    /// section.
    pub fn get_or_add_u32_constant(&mut self, value: u32) -> Result<Word, IrError> {
        let type_id = self.get_or_add_int_type(32, false)?;
        self.get_or_add_int_constant(type_id, u64::from(value))
    }

    /// Find or create a 32-bit signed integer constant.
    pub fn get_or_add_i32_constant(&mut self, value: i32) -> Result<Word, IrError> {
        let type_id = self.get_or_add_int_type(32, true)?;
        self.get_or_add_int_constant(type_id, value as u32 as u64)
    }

    pub fn get_or_add_int_type(&mut self, width: u32, signed: bool) -> Result<Word, IrError> {
        let module = self.ctx.module();
        for uid in module.types_values() {
            let inst = module.inst(*uid);
            if inst.opcode() == Op::TypeInt
                && inst.single_word_operand(0) == width
                && (inst.single_word_operand(1) != 0) == signed
            {
                return Ok(inst.result_id());
            }
        }
        let result = self.ctx.take_next_id().ok_or(IrError::IdOverflow)?;
        let inst = Instruction::new(
            Op::TypeInt,
            0,
            result,
            [
                Operand::LiteralBit32(width),
                Operand::LiteralBit32(signed as u32),
            ],
        );
        let uid = self.ctx.alloc_inst(inst);
        self.ctx.module_mut().push_type_or_value(uid);
        self.ctx.analyze_uses(uid);
        Ok(result)
    }

    /// Find or create an OpConstantTrue/False of the module's bool type.
    pub fn get_or_add_bool_constant(&mut self, value: bool) -> Result<Word, IrError> {
        let type_id = self.get_or_add_bool_type()?;
        let opcode = if value {
            Op::ConstantTrue
        } else {
            Op::ConstantFalse
        };
        let module = self.ctx.module();
        for uid in module.types_values() {
            let inst = module.inst(*uid);
            if inst.opcode() == opcode && inst.type_id() == type_id {
                return Ok(inst.result_id());
            }
        }
        let result = self.ctx.take_next_id().ok_or(IrError::IdOverflow)?;
        let inst = Instruction::new(opcode, type_id, result, []);
        let uid = self.ctx.alloc_inst(inst);
        self.ctx.module_mut().push_type_or_value(uid);
        self.ctx.analyze_uses(uid);
        Ok(result)
    }

    pub fn get_or_add_bool_type(&mut self) -> Result<Word, IrError> {
        let module = self.ctx.module();
        for uid in module.types_values() {
            let inst = module.inst(*uid);
            if inst.opcode() == Op::TypeBool {
                return Ok(inst.result_id());
            }
        }
        let result = self.ctx.take_next_id().ok_or(IrError::IdOverflow)?;
        let inst = Instruction::new(Op::TypeBool, 0, result, []);
        let uid = self.ctx.alloc_inst(inst);
        self.ctx.module_mut().push_type_or_value(uid);
        self.ctx.analyze_uses(uid);
        Ok(result)
    }

    /// Find or create an integer OpConstant of `type_id` with the raw
    /// literal `bits`.
    pub fn get_or_add_int_constant(&mut self, type_id: Word, bits: u64) -> Result<Word, IrError> {
        let module = self.ctx.module();
        for uid in module.types_values() {
            let inst = module.inst(*uid);
            if inst.opcode() == Op::Constant
                && inst.type_id() == type_id
                && inst.operands().first().and_then(Operand::literal) == Some(bits)
            {
                return Ok(inst.result_id());
            }
        }
        let result = self.ctx.take_next_id().ok_or(IrError::IdOverflow)?;
        let inst = Instruction::new(
            Op::Constant,
            type_id,
            result,
            [Operand::LiteralBit32(bits as u32)],
        );
        let uid = self.ctx.alloc_inst(inst);
        self.ctx.module_mut().push_type_or_value(uid);
        self.ctx.analyze_uses(uid);
        Ok(result)
    }
}

/// Create an empty block with a fresh label, inserted before `point` (or
/// appended when `point` is `None`), and register it with the valid analyses.
pub fn create_block(
    ctx: &mut IRContext,
    function: usize,
    point: Option<Word>,
) -> Result<Word, IrError> {
    let id = ctx.take_next_id().ok_or(IrError::IdOverflow)?;
    let label = ctx.alloc_inst(Instruction::new(Op::Label, 0, id, []));
    let block = BasicBlock::new(label, id);
    let f = ctx.module_mut().function_mut(function);
    match point {
        Some(point) => f.insert_blocks_before(point, [block]),
        None => f.push_block(block),
    }
    ctx.analyze_uses(label);
    ctx.set_instr_block(label, id);
    Ok(id)
}
