use std::collections::BTreeSet;

use rustc_hash::FxHashMap;

use crate::{Instruction, Module, Operand, UniqueId, Word};

/// Def-use relations over the instructions of a module.
///
/// Two relations are maintained:
///
/// * `id -> defining instruction`: each non-zero result id has exactly one
///   definition;
/// * `defining instruction -> (user, operand index)` records, ordered by
///   `(def unique id, user unique id, operand index)` so that all uses of one
///   def are contiguous and users are visited in unique-id order.
///
/// Only id-bearing in-operands are treated as uses. Type references are not:
/// nothing in this library ever rewrites a type id.
#[derive(Debug, Default)]
pub struct DefUseManager {
    id_to_def: FxHashMap<Word, UniqueId>,
    use_records: BTreeSet<(UniqueId, UniqueId, u32)>,
}

impl DefUseManager {
    /// Build the full relation for `module`.
    pub fn new(module: &Module) -> Self {
        let mut mgr = Self::default();
        // Two passes: definitions must all be registered before uses are
        // resolved, since an operand may refer forward (e.g. a phi).
        module.for_each_inst(|uid| mgr.analyze_inst_def(module.inst(uid)));
        module.for_each_inst(|uid| mgr.analyze_inst_use(module.inst(uid)));
        mgr
    }

    /// Record the definition made by `inst`, if it has a result id.
    pub fn analyze_inst_def(&mut self, inst: &Instruction) {
        if inst.has_result_id() {
            self.id_to_def.insert(inst.result_id(), inst.unique_id());
        }
    }

    /// Record the uses made by `inst`. Previous use records of `inst` are
    /// dropped first, so this is safe to call after operand rewrites.
    ///
    /// Operands that refer to ids with no registered definition are skipped;
    /// [DefUseManager::new] orders its passes so that this cannot happen for
    /// a well-formed module.
    pub fn analyze_inst_use(&mut self, inst: &Instruction) {
        self.erase_use_records_of_user(inst);
        let user = inst.unique_id();
        inst.for_each_id(|index, id| {
            if let Some(def) = self.id_to_def.get(&id) {
                self.use_records.insert((*def, user, index as u32));
            }
        });
    }

    pub fn analyze_inst_def_use(&mut self, inst: &Instruction) {
        self.analyze_inst_def(inst);
        self.analyze_inst_use(inst);
    }

    /// The instruction defining `id`.
    pub fn get_def(&self, id: Word) -> Option<UniqueId> {
        self.id_to_def.get(&id).copied()
    }

    /// Visit each distinct user of `def` in unique-id order. The callback
    /// returns `false` to stop early; the return value is `false` iff the
    /// iteration was stopped.
    pub fn for_each_user<F: FnMut(UniqueId) -> bool>(&self, def: UniqueId, mut f: F) -> bool {
        let mut previous = None;
        for (_, user, _) in self.uses_of(def) {
            if previous == Some(user) {
                continue;
            }
            previous = Some(user);
            if !f(user) {
                return false;
            }
        }
        true
    }

    /// Visit each `(user, operand index)` use of `def`, one call per operand
    /// position. The callback returns `false` to stop early.
    pub fn for_each_use<F: FnMut(UniqueId, u32) -> bool>(&self, def: UniqueId, mut f: F) -> bool {
        for (_, user, index) in self.uses_of(def) {
            if !f(user, index) {
                return false;
            }
        }
        true
    }

    /// Number of distinct users of `def`.
    pub fn num_users(&self, def: UniqueId) -> usize {
        let mut count = 0;
        self.for_each_user(def, |_| {
            count += 1;
            true
        });
        count
    }

    /// Number of uses (operand positions) of `def`.
    pub fn num_uses(&self, def: UniqueId) -> usize {
        self.uses_of(def).count()
    }

    /// Rewrite every use of `old_id` to `new_id`, updating both the module
    /// and the use relation. Returns the set of modified users.
    ///
    /// The definition record of `old_id` is left in place: a def with no
    /// remaining users is still a registered def.
    pub fn replace_all_uses_of(
        &mut self,
        module: &mut Module,
        old_id: Word,
        new_id: Word,
    ) -> Vec<UniqueId> {
        let Some(old_def) = self.get_def(old_id) else {
            return Vec::new();
        };
        let Some(new_def) = self.get_def(new_id) else {
            return Vec::new();
        };
        let records: Vec<(UniqueId, UniqueId, u32)> = self.uses_of(old_def).collect();
        let mut modified = Vec::new();
        for (def, user, index) in records {
            let inst = module.inst_mut(user);
            debug_assert_eq!(inst.id_operand(index as usize), Some(old_id));
            inst.set_operand(index as usize, Operand::IdRef(new_id));
            self.use_records.remove(&(def, user, index));
            self.use_records.insert((new_def, user, index));
            if modified.last() != Some(&user) {
                modified.push(user);
            }
        }
        modified
    }

    /// Forget everything known about `inst`: its definition, the uses it
    /// makes, and the use records of its result. One of the two removal entry
    /// points (with [DefUseManager::erase_use_records_of_user]).
    pub fn clear_inst(&mut self, inst: &Instruction) {
        self.erase_use_records_of_user(inst);
        if inst.has_result_id() {
            let def = inst.unique_id();
            let records: Vec<_> = self.uses_of(def).collect();
            for record in records {
                self.use_records.remove(&record);
            }
            // Only remove the id mapping if it still points at this
            // instruction; the id may have been rebound by a clone.
            if self.id_to_def.get(&inst.result_id()) == Some(&def) {
                self.id_to_def.remove(&inst.result_id());
            }
        }
    }

    /// Drop the use records made by `inst` (as a user). The defs it referred
    /// to keep their other users.
    pub fn erase_use_records_of_user(&mut self, inst: &Instruction) {
        let user = inst.unique_id();
        inst.for_each_id(|index, id| {
            if let Some(def) = self.id_to_def.get(&id) {
                self.use_records.remove(&(*def, user, index as u32));
            }
        });
    }

    /// The annotation instructions directly targeting `id` (no transitive
    /// decoration groups).
    pub fn get_annotations(&self, module: &Module, id: Word) -> Vec<UniqueId> {
        module
            .annotations()
            .iter()
            .copied()
            .filter(|uid| module.inst(*uid).id_operand(0) == Some(id))
            .collect()
    }

    fn uses_of(
        &self,
        def: UniqueId,
    ) -> impl Iterator<Item = (UniqueId, UniqueId, u32)> + '_ {
        use cranelift_entity::packed_option::ReservedValue;
        let lo = (def, UniqueId::from_u32(0), 0u32);
        let hi = (def, UniqueId::reserved_value(), u32::MAX);
        self.use_records.range(lo..=hi).copied()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::test_util::FunctionBuilderHarness;

    fn harness_with_loop() -> (crate::Module, crate::test_util::CountedLoop) {
        let mut h = FunctionBuilderHarness::new();
        let cl = h.counted_loop_with_body(0, 10, 1, |h, cl| {
            let two = h.i32_constant(2);
            h.iadd(cl.body, cl.phi, two);
        });
        (h.finish(), cl)
    }

    /// Every id-bearing operand of every instruction appears in exactly one
    /// use record, and the reverse relation matches the module.
    #[test]
    fn relation_is_consistent_with_module() {
        let (module, _) = harness_with_loop();
        let def_use = DefUseManager::new(&module);

        module.for_each_inst(|uid| {
            let inst = module.inst(uid);
            inst.for_each_id(|index, id| {
                let def = def_use.get_def(id).expect("operand id has a definition");
                let mut found = false;
                def_use.for_each_use(def, |user, use_index| {
                    if user == uid && use_index == index as u32 {
                        found = true;
                        return false;
                    }
                    true
                });
                assert!(found, "missing use record for %{id} at operand {index}");
            });
        });
    }

    #[test]
    fn users_are_distinct_and_uses_are_per_operand() {
        let (module, cl) = harness_with_loop();
        let def_use = DefUseManager::new(&module);
        let phi = def_use.get_def(cl.phi).unwrap();

        // The phi is used by the step add, the compare, and the body add:
        // each user once, even if it appeared at several operand positions.
        let mut users = Vec::new();
        def_use.for_each_user(phi, |user| {
            users.push(user);
            true
        });
        assert_eq!(users.len(), def_use.num_users(phi));
        let mut deduped = users.clone();
        deduped.dedup();
        assert_eq!(users, deduped);
        assert!(def_use.num_uses(phi) >= def_use.num_users(phi));
    }

    #[test]
    fn for_each_user_stops_early() {
        let (module, cl) = harness_with_loop();
        let def_use = DefUseManager::new(&module);
        let phi = def_use.get_def(cl.phi).unwrap();

        let mut visited = 0;
        let completed = def_use.for_each_user(phi, |_| {
            visited += 1;
            false
        });
        assert!(!completed);
        assert_eq!(visited, 1);
    }

    #[test]
    fn replace_all_uses_rewrites_operands_and_records() {
        let (mut module, cl) = harness_with_loop();
        let mut def_use = DefUseManager::new(&module);
        let phi = def_use.get_def(cl.phi).unwrap();
        let old_users = def_use.num_users(phi);
        assert!(old_users > 0);

        // Redirect everything that read the phi to the step value.
        let modified = def_use.replace_all_uses_of(&mut module, cl.phi, cl.i_next);
        assert!(!modified.is_empty());
        assert_eq!(def_use.num_users(phi), 0);

        for user in modified {
            let mut reads_old = false;
            module.inst(user).for_each_id(|_, id| {
                reads_old |= id == cl.phi;
            });
            assert!(!reads_old);
        }
    }

    #[test]
    fn clear_inst_removes_both_directions() {
        let (module, cl) = harness_with_loop();
        let mut def_use = DefUseManager::new(&module);
        let step = def_use.get_def(cl.i_next).unwrap();

        def_use.clear_inst(module.inst(step));
        assert_eq!(def_use.get_def(cl.i_next), None);
        assert_eq!(def_use.num_uses(step), 0);
        // The phi no longer counts the step add among its users.
        let phi = def_use.get_def(cl.phi).unwrap();
        let mut users = Vec::new();
        def_use.for_each_user(phi, |user| {
            users.push(user);
            true
        });
        assert!(!users.contains(&step));
    }
}
