//! Support for building small modules in tests.
//!
//! This is not part of the public API surface; it exists so the analysis and
//! transform crates can construct the same canonical loop shapes without
//! repeating builder boilerplate.
#![doc(hidden)]

use spirv::Op;

use crate::{
    builder::{create_block, InstructionBuilder},
    context::IRContext,
    Function, Instruction, Module, Operand, Word,
};

/// Ids of the blocks and values making up one canonical counted loop:
///
/// ```text
/// pre_header: OpBranch %header
/// header:     %phi = OpPhi [init, pre_header] [i_next, latch]
///             OpLoopMerge %merge %latch
///             OpBranch %cond_block
/// cond_block: %cond = OpSLessThan %phi %bound
///             OpBranchConditional %cond %body %merge
/// body:       ...caller content...
///             OpBranch %latch
/// latch:      %i_next = OpIAdd %phi %step
///             OpBranch %header
/// merge:      OpReturn
/// ```
#[derive(Debug, Clone, Copy)]
pub struct CountedLoop {
    pub pre_header: Word,
    pub header: Word,
    pub cond_block: Word,
    pub body: Word,
    pub latch: Word,
    pub merge: Word,
    /// Result id of the induction phi.
    pub phi: Word,
    /// Result id of the per-iteration step add.
    pub i_next: Word,
    /// Result id of the exit comparison.
    pub cond: Word,
}

/// Blocks of a two-deep nested loop shape used by structure tests.
#[derive(Debug, Clone, Copy)]
pub struct NestedLoops {
    pub outer_header: Word,
    pub outer_latch: Word,
    pub outer_merge: Word,
    pub inner_header: Word,
    pub inner_body: Word,
    pub inner_latch: Word,
    pub inner_merge: Word,
}

/// Builds a module containing a single void function, block by block.
pub struct FunctionBuilderHarness {
    ctx: IRContext,
    function: usize,
}

impl Default for FunctionBuilderHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionBuilderHarness {
    pub fn new() -> Self {
        let mut module = Module::new();
        let void_ty = module.take_next_id().unwrap();
        let void = module.alloc_inst(Instruction::new(Op::TypeVoid, 0, void_ty, []));
        module.push_type_or_value(void);
        let fn_ty = module.take_next_id().unwrap();
        let fn_type = module.alloc_inst(Instruction::new(
            Op::TypeFunction,
            0,
            fn_ty,
            [Operand::IdRef(void_ty)],
        ));
        module.push_type_or_value(fn_type);

        let fn_id = module.take_next_id().unwrap();
        let def = module.alloc_inst(Instruction::new(
            Op::Function,
            void_ty,
            fn_id,
            [
                Operand::FunctionControl(spirv::FunctionControl::NONE),
                Operand::IdRef(fn_ty),
            ],
        ));
        let end = module.alloc_inst(Instruction::new(Op::FunctionEnd, 0, 0, []));
        let function = module.push_function(Function::new(def, end));

        Self {
            ctx: IRContext::new(module),
            function,
        }
    }

    pub fn ctx(&mut self) -> &mut IRContext {
        &mut self.ctx
    }

    pub fn module(&self) -> &Module {
        self.ctx.module()
    }

    pub fn take_id(&mut self) -> Word {
        self.ctx.take_next_id().unwrap()
    }

    pub fn new_block(&mut self) -> Word {
        create_block(&mut self.ctx, self.function, None).unwrap()
    }

    fn builder(&mut self, block: Word) -> InstructionBuilder<'_> {
        InstructionBuilder::new(&mut self.ctx, self.function, block)
    }

    /// Builder for value-producing instructions: lands before the block
    /// terminator once one exists, so body content can be added late.
    fn value_builder(&mut self, block: Word) -> InstructionBuilder<'_> {
        InstructionBuilder::new(&mut self.ctx, self.function, block)
            .at(crate::builder::InsertPoint::BeforeTerminator)
    }

    pub fn bool_type(&mut self) -> Word {
        if let Some(existing) = self.find_type(Op::TypeBool, &[]) {
            return existing;
        }
        let id = self.take_id();
        let uid = self
            .ctx
            .alloc_inst(Instruction::new(Op::TypeBool, 0, id, []));
        self.ctx.module_mut().push_type_or_value(uid);
        id
    }

    pub fn i32_type(&mut self) -> Word {
        self.builder_type_int(true)
    }

    pub fn u32_type(&mut self) -> Word {
        self.builder_type_int(false)
    }

    fn builder_type_int(&mut self, signed: bool) -> Word {
        let mut b = self.builder(0);
        // The builder only needs the context for type interning; block 0 is
        // never touched.
        b.get_or_add_int_type(32, signed).unwrap()
    }

    fn find_type(&self, op: Op, operands: &[Word]) -> Option<Word> {
        let module = self.ctx.module();
        for uid in module.types_values() {
            let inst = module.inst(*uid);
            if inst.opcode() != op || inst.num_operands() != operands.len() {
                continue;
            }
            let matches = operands
                .iter()
                .enumerate()
                .all(|(index, w)| inst.single_word_operand(index) == *w);
            if matches {
                return Some(inst.result_id());
            }
        }
        None
    }

    pub fn bool_constant(&mut self, value: bool) -> Word {
        let ty = self.bool_type();
        let op = if value {
            Op::ConstantTrue
        } else {
            Op::ConstantFalse
        };
        let module = self.ctx.module();
        for uid in module.types_values() {
            let inst = module.inst(*uid);
            if inst.opcode() == op && inst.type_id() == ty {
                return inst.result_id();
            }
        }
        let id = self.take_id();
        let uid = self.ctx.alloc_inst(Instruction::new(op, ty, id, []));
        self.ctx.module_mut().push_type_or_value(uid);
        id
    }

    pub fn i32_constant(&mut self, value: i32) -> Word {
        let mut b = self.builder(0);
        b.get_or_add_i32_constant(value).unwrap()
    }

    pub fn u32_constant(&mut self, value: u32) -> Word {
        let mut b = self.builder(0);
        b.get_or_add_u32_constant(value).unwrap()
    }

    /// A pointer type in `storage` to the i32 type.
    pub fn i32_ptr_type(&mut self, storage: spirv::StorageClass) -> Word {
        let pointee = self.i32_type();
        if let Some(existing) = self.find_type(Op::TypePointer, &[storage as u32, pointee]) {
            return existing;
        }
        let id = self.take_id();
        let uid = self.ctx.alloc_inst(Instruction::new(
            Op::TypePointer,
            0,
            id,
            [Operand::StorageClass(storage), Operand::IdRef(pointee)],
        ));
        self.ctx.module_mut().push_type_or_value(uid);
        id
    }

    /// A module-scope `i32[len]` array variable in Workgroup storage.
    pub fn workgroup_array_var(&mut self, len: u32) -> Word {
        let i32_ty = self.i32_type();
        let len_id = self.u32_constant(len);
        let array_ty = match self.find_type(Op::TypeArray, &[i32_ty, len_id]) {
            Some(existing) => existing,
            None => {
                let id = self.take_id();
                let uid = self.ctx.alloc_inst(Instruction::new(
                    Op::TypeArray,
                    0,
                    id,
                    [Operand::IdRef(i32_ty), Operand::IdRef(len_id)],
                ));
                self.ctx.module_mut().push_type_or_value(uid);
                id
            }
        };
        let storage = spirv::StorageClass::Workgroup;
        let ptr_ty = match self.find_type(Op::TypePointer, &[storage as u32, array_ty]) {
            Some(existing) => existing,
            None => {
                let id = self.take_id();
                let uid = self.ctx.alloc_inst(Instruction::new(
                    Op::TypePointer,
                    0,
                    id,
                    [Operand::StorageClass(storage), Operand::IdRef(array_ty)],
                ));
                self.ctx.module_mut().push_type_or_value(uid);
                id
            }
        };
        let id = self.take_id();
        let uid = self.ctx.alloc_inst(Instruction::new(
            Op::Variable,
            ptr_ty,
            id,
            [Operand::StorageClass(storage)],
        ));
        self.ctx.module_mut().push_type_or_value(uid);
        id
    }

    /// A module-scope i32 variable in Input storage (read-only memory).
    pub fn input_var_i32(&mut self) -> Word {
        let storage = spirv::StorageClass::Input;
        let ptr_ty = self.i32_ptr_type(storage);
        let id = self.take_id();
        let uid = self.ctx.alloc_inst(Instruction::new(
            Op::Variable,
            ptr_ty,
            id,
            [Operand::StorageClass(storage)],
        ));
        self.ctx.module_mut().push_type_or_value(uid);
        id
    }

    pub fn branch(&mut self, block: Word, target: Word) {
        let function = self.function;
        InstructionBuilder::new(&mut self.ctx, function, block).add_branch(target);
    }

    pub fn branch_conditional(&mut self, block: Word, cond: Word, t: Word, f: Word) {
        let function = self.function;
        InstructionBuilder::new(&mut self.ctx, function, block)
            .add_conditional_branch(cond, t, f, None);
    }

    pub fn branch_conditional_with_merge(
        &mut self,
        block: Word,
        cond: Word,
        t: Word,
        f: Word,
        merge: Word,
    ) {
        let function = self.function;
        InstructionBuilder::new(&mut self.ctx, function, block)
            .add_conditional_branch(cond, t, f, Some(merge));
    }

    pub fn switch(&mut self, block: Word, selector: Word, default: Word, cases: &[(u32, Word)], merge: Word) {
        let function = self.function;
        InstructionBuilder::new(&mut self.ctx, function, block)
            .add_switch(selector, default, cases, Some(merge));
    }

    pub fn loop_merge(&mut self, header: Word, merge: Word, continue_target: Word) {
        let function = self.function;
        InstructionBuilder::new(&mut self.ctx, function, header)
            .add_loop_merge(merge, continue_target);
    }

    pub fn ret(&mut self, block: Word) {
        let function = self.function;
        InstructionBuilder::new(&mut self.ctx, function, block).add_return();
    }

    pub fn unreachable(&mut self, block: Word) {
        let function = self.function;
        InstructionBuilder::new(&mut self.ctx, function, block).add_unreachable();
    }

    pub fn phi_i32(&mut self, block: Word, incoming: &[(Word, Word)]) -> Word {
        let ty = self.i32_type();
        let uid = self.value_builder(block).add_phi(ty, incoming).unwrap();
        self.ctx.module().inst(uid).result_id()
    }

    pub fn binary_i32(&mut self, block: Word, op: Op, lhs: Word, rhs: Word) -> Word {
        let ty = self.i32_type();
        let uid = self
            .value_builder(block)
            .add_binary_op(op, ty, lhs, rhs)
            .unwrap();
        self.ctx.module().inst(uid).result_id()
    }

    pub fn iadd(&mut self, block: Word, lhs: Word, rhs: Word) -> Word {
        self.binary_i32(block, Op::IAdd, lhs, rhs)
    }

    pub fn imul(&mut self, block: Word, lhs: Word, rhs: Word) -> Word {
        self.binary_i32(block, Op::IMul, lhs, rhs)
    }

    /// Add an IAdd whose result id was reserved in advance (used to satisfy
    /// forward references from phis).
    pub fn iadd_with_result(&mut self, block: Word, lhs: Word, rhs: Word, result: Word) {
        let ty = self.i32_type();
        let inst = Instruction::new(
            Op::IAdd,
            ty,
            result,
            [Operand::IdRef(lhs), Operand::IdRef(rhs)],
        );
        self.value_builder(block).add_instruction(inst);
    }

    pub fn slt(&mut self, block: Word, lhs: Word, rhs: Word) -> Word {
        let ty = self.bool_type();
        let uid = self
            .value_builder(block)
            .add_binary_op(Op::SLessThan, ty, lhs, rhs)
            .unwrap();
        self.ctx.module().inst(uid).result_id()
    }

    pub fn access_chain_i32(&mut self, block: Word, base: Word, indexes: &[Word]) -> Word {
        let ty = self.i32_ptr_type(spirv::StorageClass::Workgroup);
        let uid = self
            .value_builder(block)
            .add_access_chain(ty, base, indexes)
            .unwrap();
        self.ctx.module().inst(uid).result_id()
    }

    pub fn load_i32(&mut self, block: Word, pointer: Word) -> Word {
        let ty = self.i32_type();
        let uid = self.value_builder(block).add_load(ty, pointer).unwrap();
        self.ctx.module().inst(uid).result_id()
    }

    pub fn store(&mut self, block: Word, pointer: Word, value: Word) {
        self.value_builder(block).add_store(pointer, value);
    }

    /// Build a canonical counted loop with an empty body.
    pub fn counted_loop(&mut self, init: i32, bound: i32, step: i32) -> CountedLoop {
        self.counted_loop_with_body(init, bound, step, |_, _| {})
    }

    /// Build a canonical counted loop, calling `fill` to populate the body
    /// block before its terminator is added.
    pub fn counted_loop_with_body(
        &mut self,
        init: i32,
        bound: i32,
        step: i32,
        fill: impl FnOnce(&mut Self, &CountedLoop),
    ) -> CountedLoop {
        let pre_header = self.new_block();
        let header = self.new_block();
        let cond_block = self.new_block();
        let body = self.new_block();
        let latch = self.new_block();
        let merge = self.new_block();

        let c_init = self.i32_constant(init);
        let c_bound = self.i32_constant(bound);
        let c_step = self.i32_constant(step.abs());

        // The phi references the step result, which is created later; its id
        // is reserved up front.
        let i_next = self.take_id();

        self.branch(pre_header, header);
        let phi = self.phi_i32(header, &[(c_init, pre_header), (i_next, latch)]);
        self.loop_merge(header, merge, latch);
        self.branch(header, cond_block);
        let cond = self.slt(cond_block, phi, c_bound);
        self.branch_conditional(cond_block, cond, body, merge);

        let ids = CountedLoop {
            pre_header,
            header,
            cond_block,
            body,
            latch,
            merge,
            phi,
            i_next,
            cond,
        };
        fill(self, &ids);
        self.branch(body, latch);

        if step >= 0 {
            self.iadd_with_result(latch, phi, c_step, i_next);
        } else {
            let ty = self.i32_type();
            let inst = Instruction::new(
                Op::ISub,
                ty,
                i_next,
                [Operand::IdRef(phi), Operand::IdRef(c_step)],
            );
            self.value_builder(latch).add_instruction(inst);
        }
        self.branch(latch, header);
        self.ret(merge);

        ids
    }

    /// Build two nested single-block-body loops driven by boolean constants.
    pub fn nested_loops(&mut self) -> NestedLoops {
        let entry = self.new_block();
        let outer_header = self.new_block();
        let outer_cond = self.new_block();
        let inner_header = self.new_block();
        let inner_cond = self.new_block();
        let inner_body = self.new_block();
        let inner_latch = self.new_block();
        let inner_merge = self.new_block();
        let outer_latch = self.new_block();
        let outer_merge = self.new_block();
        let keep_going = self.bool_constant(true);

        self.branch(entry, outer_header);
        self.loop_merge(outer_header, outer_merge, outer_latch);
        self.branch(outer_header, outer_cond);
        self.branch_conditional(outer_cond, keep_going, inner_header, outer_merge);
        self.loop_merge(inner_header, inner_merge, inner_latch);
        self.branch(inner_header, inner_cond);
        self.branch_conditional(inner_cond, keep_going, inner_body, inner_merge);
        self.branch(inner_body, inner_latch);
        self.branch(inner_latch, inner_header);
        self.branch(inner_merge, outer_latch);
        self.branch(outer_latch, outer_header);
        self.ret(outer_merge);

        NestedLoops {
            outer_header,
            outer_latch,
            outer_merge,
            inner_header,
            inner_body,
            inner_latch,
            inner_merge,
        }
    }

    /// Finish building, returning the module. The function is at index 0.
    pub fn finish(self) -> Module {
        self.ctx.into_module()
    }

    /// Finish building, returning a context wrapping the module.
    pub fn finish_ctx(self) -> IRContext {
        self.ctx
    }
}
