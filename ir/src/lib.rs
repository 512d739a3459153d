//! In-memory SPIR-V IR and the core analyses the loop subsystem builds on.
//!
//! The crate is layered bottom-up:
//!
//! * the IR substrate: [Module], [Function], [BasicBlock], [Instruction],
//!   with every instruction owned by a module-wide arena and addressed by
//!   [UniqueId] handles;
//! * graph analyses: [DefUseManager], [ControlFlowGraph], [DominatorTree]
//!   (dominators and post-dominators through one direction-parameterised
//!   implementation);
//! * loop structure: [LoopDescriptor] and [Loop], discovered from
//!   OpLoopMerge instructions;
//! * orchestration: [IRContext] (lazy analysis cache plus the invalidation
//!   discipline) and the [Pass]/[PassManager] shell.
//!
//! Binary encoding and decoding are out of scope: a decoder hands this crate
//! a [Module] and receives one back.

pub mod builder;
mod block;
mod cfg;
mod context;
mod def_use;
mod dominators;
mod function;
mod instruction;
mod loops;
mod module;
mod pass;
pub mod test_util;
pub mod verify;

pub use self::{
    block::BasicBlock,
    builder::{create_block, InsertPoint, InstructionBuilder},
    cfg::ControlFlowGraph,
    context::{Analyses, IRContext, InstrToBlockMap},
    def_use::DefUseManager,
    dominators::{Direction, DominatorTree},
    function::Function,
    instruction::{Instruction, Operand, UniqueId, Word, NULL_ID},
    loops::{InductionVar, Loop, LoopDescriptor, LoopIndex},
    module::Module,
    pass::{all_extensions_allowed, Pass, PassManager, PassStatus, ALLOWED_EXTENSIONS},
};

/// Errors surfaced by IR mutation. Passes map these to
/// [PassStatus::Failure].
#[derive(Debug, thiserror::Error)]
pub enum IrError {
    /// `TakeNextId` exhausted the 32-bit id space.
    #[error("result id space exhausted")]
    IdOverflow,
    /// An analysis and the module disagree about structure.
    #[error("structural corruption detected: {0}")]
    Corrupt(&'static str),
}
