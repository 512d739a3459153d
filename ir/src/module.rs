use cranelift_entity::PrimaryMap;
use spirv::Op;

use crate::{Function, Instruction, Operand, UniqueId, Word};

/// An in-memory SPIR-V module.
///
/// The module owns every instruction: all of them live in a single arena
/// keyed by [UniqueId], and the section lists, functions, and blocks hold
/// handles into it. The arena is append-only; killing an instruction
/// tombstones its slot in place (the slot becomes an OpNop) so that stale
/// handles can never alias a different instruction.
#[derive(Debug, Default)]
pub struct Module {
    arena: PrimaryMap<UniqueId, Instruction>,
    capabilities: Vec<UniqueId>,
    extensions: Vec<UniqueId>,
    ext_inst_imports: Vec<UniqueId>,
    memory_model: Option<UniqueId>,
    entry_points: Vec<UniqueId>,
    execution_modes: Vec<UniqueId>,
    debug: Vec<UniqueId>,
    annotations: Vec<UniqueId>,
    types_values: Vec<UniqueId>,
    functions: Vec<Function>,
    id_bound: Word,
}

impl Module {
    pub fn new() -> Self {
        Self {
            id_bound: 1,
            ..Default::default()
        }
    }

    /// Allocate `inst` into the arena, assigning its unique id.
    pub fn alloc_inst(&mut self, mut inst: Instruction) -> UniqueId {
        let uid = self.arena.next_key();
        inst.set_unique_id(uid);
        self.arena.push(inst);
        uid
    }

    /// Clone the instruction behind `uid` into a fresh arena slot.
    ///
    /// The clone keeps the original's result id; the caller decides whether
    /// to reassign it (see [Module::take_next_id]).
    pub fn clone_inst(&mut self, uid: UniqueId) -> UniqueId {
        let inst = self.arena[uid].clone();
        self.alloc_inst(inst)
    }

    #[inline]
    pub fn inst(&self, uid: UniqueId) -> &Instruction {
        &self.arena[uid]
    }

    #[inline]
    pub fn inst_mut(&mut self, uid: UniqueId) -> &mut Instruction {
        &mut self.arena[uid]
    }

    /// Tombstone the instruction behind `uid`: the slot becomes an OpNop with
    /// no operands. Handles to it stay valid but describe nothing.
    pub(crate) fn tombstone_inst(&mut self, uid: UniqueId) {
        let inst = &mut self.arena[uid];
        inst.set_opcode(Op::Nop);
        inst.set_result_id(0);
        while inst.num_operands() > 0 {
            inst.remove_operand(inst.num_operands() - 1);
        }
    }

    /// The id bound: every id in the module is strictly below this.
    #[inline]
    pub fn id_bound(&self) -> Word {
        self.id_bound
    }

    pub fn set_id_bound(&mut self, bound: Word) {
        self.id_bound = bound;
    }

    /// Reserve and return a fresh result id, or `None` when the id space is
    /// exhausted.
    pub fn take_next_id(&mut self) -> Option<Word> {
        if self.id_bound == Word::MAX {
            return None;
        }
        let id = self.id_bound;
        self.id_bound += 1;
        Some(id)
    }

    #[inline]
    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    #[inline]
    pub fn functions_mut(&mut self) -> &mut [Function] {
        &mut self.functions
    }

    pub fn function(&self, index: usize) -> &Function {
        &self.functions[index]
    }

    pub fn function_mut(&mut self, index: usize) -> &mut Function {
        &mut self.functions[index]
    }

    pub fn push_function(&mut self, function: Function) -> usize {
        self.functions.push(function);
        self.functions.len() - 1
    }

    pub fn push_capability(&mut self, inst: UniqueId) {
        self.capabilities.push(inst);
    }

    pub fn push_extension(&mut self, inst: UniqueId) {
        self.extensions.push(inst);
    }

    pub fn push_ext_inst_import(&mut self, inst: UniqueId) {
        self.ext_inst_imports.push(inst);
    }

    pub fn set_memory_model(&mut self, inst: UniqueId) {
        self.memory_model = Some(inst);
    }

    pub fn push_entry_point(&mut self, inst: UniqueId) {
        self.entry_points.push(inst);
    }

    pub fn push_execution_mode(&mut self, inst: UniqueId) {
        self.execution_modes.push(inst);
    }

    pub fn push_debug(&mut self, inst: UniqueId) {
        self.debug.push(inst);
    }

    pub fn push_annotation(&mut self, inst: UniqueId) {
        self.annotations.push(inst);
    }

    pub fn push_type_or_value(&mut self, inst: UniqueId) {
        self.types_values.push(inst);
    }

    #[inline]
    pub fn annotations(&self) -> &[UniqueId] {
        &self.annotations
    }

    #[inline]
    pub fn types_values(&self) -> &[UniqueId] {
        &self.types_values
    }

    /// Iterate over every instruction handle in module order: global sections
    /// first, then each function's definition, parameters, blocks (label
    /// included), and end marker.
    pub fn for_each_inst<F: FnMut(UniqueId)>(&self, mut f: F) {
        let globals = self
            .capabilities
            .iter()
            .chain(self.extensions.iter())
            .chain(self.ext_inst_imports.iter())
            .chain(self.memory_model.iter())
            .chain(self.entry_points.iter())
            .chain(self.execution_modes.iter())
            .chain(self.debug.iter())
            .chain(self.annotations.iter())
            .chain(self.types_values.iter());
        for uid in globals {
            f(*uid);
        }
        for function in &self.functions {
            f(function.def());
            for param in function.params() {
                f(*param);
            }
            for block in function.blocks() {
                f(block.label());
                for uid in block.instructions() {
                    f(*uid);
                }
            }
            f(function.end());
        }
    }

    /// The names of the extensions declared by this module.
    pub fn extension_names(&self) -> Vec<&str> {
        self.extensions
            .iter()
            .filter_map(|uid| match self.inst(*uid).operands().first() {
                Some(Operand::LiteralString(name)) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Find the instruction defining `id` by scanning the module. Use the
    /// def-use manager where one is available; this is the fallback for
    /// contexts that do not carry one.
    pub fn find_def_inst(&self, id: Word) -> Option<UniqueId> {
        if id == 0 {
            return None;
        }
        let mut found = None;
        self.for_each_inst(|uid| {
            if found.is_none() && self.inst(uid).result_id() == id {
                found = Some(uid);
            }
        });
        found
    }

    /// Find the type or constant defining `id` in the global section.
    pub fn type_or_value_def(&self, id: Word) -> Option<&Instruction> {
        self.types_values
            .iter()
            .map(|uid| self.inst(*uid))
            .find(|inst| inst.result_id() == id)
    }

    /// The signed value of an integer OpConstant, interpreting the literal
    /// according to the signedness and width of its integer type.
    pub fn int_constant_value(&self, constant: &Instruction) -> Option<i64> {
        if constant.opcode() != Op::Constant {
            return None;
        }
        let ty = self.type_or_value_def(constant.type_id())?;
        if ty.opcode() != Op::TypeInt {
            return None;
        }
        let width = ty.single_word_operand(0);
        let signed = ty.single_word_operand(1) != 0;
        let raw = constant.operands().first()?.literal()?;
        let value = match (width, signed) {
            (64, true) => raw as i64,
            (64, false) => i64::try_from(raw).ok()?,
            (_, true) => i64::from(raw as u32 as i32),
            (_, false) => i64::from(raw as u32),
        };
        Some(value)
    }
}
