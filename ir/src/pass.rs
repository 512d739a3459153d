use crate::IRContext;

/// The outcome of running a pass over a module.
///
/// `Failure` means the pass detected structural corruption or ran out of
/// ids; it leaves no partial mutation behind because kills accumulate into
/// the context kill set finalised at pass end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassStatus {
    SuccessWithoutChange,
    SuccessWithChange,
    Failure,
}

impl PassStatus {
    #[inline]
    pub fn modified(self) -> bool {
        self == Self::SuccessWithChange
    }

    /// Combine the status of two pass runs.
    pub fn combine(self, other: Self) -> Self {
        match (self, other) {
            (Self::Failure, _) | (_, Self::Failure) => Self::Failure,
            (Self::SuccessWithChange, _) | (_, Self::SuccessWithChange) => Self::SuccessWithChange,
            _ => Self::SuccessWithoutChange,
        }
    }
}

/// The extensions the passes accept. A module declaring anything outside
/// this list is passed through unchanged.
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "SPV_KHR_shader_ballot",
    "SPV_KHR_shader_draw_parameters",
    "SPV_KHR_subgroup_vote",
    "SPV_KHR_16bit_storage",
    "SPV_KHR_device_group",
    "SPV_KHR_multiview",
    "SPV_KHR_variable_pointers",
    "SPV_KHR_post_depth_coverage",
    "SPV_KHR_shader_atomic_counter_ops",
    "SPV_KHR_storage_buffer_storage_class",
];

/// Whether every extension declared by the module is on the allow list.
pub fn all_extensions_allowed(ctx: &IRContext) -> bool {
    ctx.module()
        .extension_names()
        .iter()
        .all(|name| ALLOWED_EXTENSIONS.contains(name))
}

/// A module transformation.
///
/// Implementations mutate the module through the context's APIs and report
/// what happened; `run` is the entry point callers use, wrapping `process`
/// with the extension gate and pass-boundary bookkeeping.
pub trait Pass {
    fn name(&self) -> &'static str;

    fn process(&mut self, ctx: &mut IRContext) -> PassStatus;

    fn run(&mut self, ctx: &mut IRContext) -> PassStatus {
        if !all_extensions_allowed(ctx) {
            log::debug!(
                "skipping {}: module declares unsupported extensions",
                self.name()
            );
            return PassStatus::SuccessWithoutChange;
        }
        log::debug!("running pass {}", self.name());
        let status = self.process(ctx);
        // Pass boundary: killed instructions are done with; their arena
        // slots stay tombstoned.
        let killed = ctx.take_kill_set();
        log::trace!(
            "pass {} finished: {:?}, {} instructions killed",
            self.name(),
            status,
            killed.len()
        );
        status
    }
}

/// Runs a sequence of passes in order, stopping at the first failure.
#[derive(Default)]
pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
}

impl PassManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pass(&mut self, pass: impl Pass + 'static) -> &mut Self {
        self.passes.push(Box::new(pass));
        self
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    pub fn run(&mut self, ctx: &mut IRContext) -> PassStatus {
        let mut status = PassStatus::SuccessWithoutChange;
        for pass in self.passes.iter_mut() {
            let pass_status = pass.run(ctx);
            if pass_status == PassStatus::Failure {
                log::warn!("pass {} failed; aborting pipeline", pass.name());
                return PassStatus::Failure;
            }
            status = status.combine(pass_status);
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{test_util::FunctionBuilderHarness, Instruction, Operand};

    struct RecordingPass {
        status: PassStatus,
        ran: std::rc::Rc<std::cell::Cell<u32>>,
    }

    impl Pass for RecordingPass {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn process(&mut self, _ctx: &mut IRContext) -> PassStatus {
            self.ran.set(self.ran.get() + 1);
            self.status
        }
    }

    #[test]
    fn manager_combines_statuses_and_stops_on_failure() {
        let ran = std::rc::Rc::new(std::cell::Cell::new(0));
        let mut h = FunctionBuilderHarness::new();
        let entry = h.new_block();
        h.ret(entry);
        let mut ctx = h.finish_ctx();

        let mut manager = PassManager::new();
        manager
            .add_pass(RecordingPass {
                status: PassStatus::SuccessWithoutChange,
                ran: ran.clone(),
            })
            .add_pass(RecordingPass {
                status: PassStatus::SuccessWithChange,
                ran: ran.clone(),
            });
        assert_eq!(manager.run(&mut ctx), PassStatus::SuccessWithChange);
        assert_eq!(ran.get(), 2);

        let mut manager = PassManager::new();
        manager
            .add_pass(RecordingPass {
                status: PassStatus::Failure,
                ran: ran.clone(),
            })
            .add_pass(RecordingPass {
                status: PassStatus::SuccessWithChange,
                ran: ran.clone(),
            });
        assert_eq!(manager.run(&mut ctx), PassStatus::Failure);
        // The pass after the failure never ran.
        assert_eq!(ran.get(), 3);
    }

    #[test]
    fn modules_with_unknown_extensions_pass_through_unchanged() {
        let ran = std::rc::Rc::new(std::cell::Cell::new(0));
        let mut h = FunctionBuilderHarness::new();
        let entry = h.new_block();
        h.ret(entry);
        let mut ctx = h.finish_ctx();

        // A whitelisted extension does not block the pipeline.
        let ext = ctx.alloc_inst(Instruction::new(
            spirv::Op::Extension,
            0,
            0,
            [Operand::LiteralString("SPV_KHR_multiview".into())],
        ));
        ctx.module_mut().push_extension(ext);
        let mut pass = RecordingPass {
            status: PassStatus::SuccessWithChange,
            ran: ran.clone(),
        };
        assert_eq!(pass.run(&mut ctx), PassStatus::SuccessWithChange);
        assert_eq!(ran.get(), 1);

        // An unknown extension turns every pass into a no-op.
        let ext = ctx.alloc_inst(Instruction::new(
            spirv::Op::Extension,
            0,
            0,
            [Operand::LiteralString("SPV_VENDOR_exotic".into())],
        ));
        ctx.module_mut().push_extension(ext);
        let mut pass = RecordingPass {
            status: PassStatus::SuccessWithChange,
            ran: ran.clone(),
        };
        assert_eq!(pass.run(&mut ctx), PassStatus::SuccessWithoutChange);
        assert_eq!(ran.get(), 1);
    }
}
