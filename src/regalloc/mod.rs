//! Register assignment.
//!
//! This module contains the data structures and algorithms of the local
//! register assignment pass: the virtual register pool, the machine register
//! file, dependency conditions, the per-instruction assignment driver, and
//! condition-code tracking.

pub mod cc;
pub mod deps;
pub mod machine;
pub mod virtregs;

mod assign;

pub use self::machine::Machine;
pub use self::virtregs::{PairHalves, VirtReg, VirtRegs};

use crate::isa::RegKind;

/// Whether assignment updates liveness counters.
///
/// Threaded explicitly through the assignment entry point (one value per
/// call, owned by the phase driver) instead of living in process state. A
/// re-scan pass disables it to walk instructions without disturbing the
/// future-use counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bookkeeping {
    /// Consume future uses and free drained registers.
    Enabled,
    /// Leave all counters untouched.
    Disabled,
}

impl Bookkeeping {
    /// Is bookkeeping on?
    pub fn is_enabled(self) -> bool {
        self == Bookkeeping::Enabled
    }
}

/// The set of register kinds processed by one assignment pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegKinds(u8);

fn kind_bit(kind: RegKind) -> u8 {
    match kind {
        RegKind::Gpr => 1,
        RegKind::Fpr => 2,
        RegKind::Vector => 4,
    }
}

impl RegKinds {
    /// Every register kind.
    pub fn all() -> Self {
        RegKinds(7)
    }

    /// A single kind.
    pub fn only(kind: RegKind) -> Self {
        RegKinds(kind_bit(kind))
    }

    /// This set plus `kind`.
    pub fn with(self, kind: RegKind) -> Self {
        RegKinds(self.0 | kind_bit(kind))
    }

    /// Does the pass process `kind`?
    pub fn contains(self, kind: RegKind) -> bool {
        self.0 & kind_bit(kind) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::deps::{Constraint, Dep, DepAction};
    use super::*;
    use crate::inst::{Inst, MemArg, Reg};
    use crate::isa::registers::NUM_UNITS;
    use crate::isa::{Opcode, RealReg, RegState};
    use crate::{Config, Context};

    fn ctx() -> Context {
        Context::new(Config::default())
    }

    fn assign(ctx: &mut Context, inst: Inst) {
        ctx.assign_registers(inst, RegKinds::all(), Bookkeeping::Enabled);
    }

    fn assert_nothing_blocked(ctx: &Context) {
        for unit in 0..NUM_UNITS as u8 {
            let reg = RealReg::from_unit(unit);
            assert_ne!(
                ctx.machine().state(reg),
                RegState::Blocked,
                "{} left blocked",
                reg
            );
        }
    }

    #[test]
    fn block_unblock_symmetry() {
        let mut ctx = ctx();

        // Empty operand set.
        let label = ctx.create_label();
        let label_inst = ctx.append(Opcode::Label);
        ctx.set_label(label_inst, label);

        // Mixed: a pair target, single sources, and a memory operand.
        let shell = ctx.vregs_mut().allocate_pair(RegKind::Gpr);
        let a = ctx.vregs_mut().allocate(RegKind::Gpr);
        let base = ctx.vregs_mut().allocate(RegKind::Gpr);
        let mul = ctx.append(Opcode::Mr);
        ctx.use_target_register(mul, Reg::Virt(shell));
        ctx.use_source_register(mul, Reg::Virt(a));
        ctx.use_source_mem(mul, MemArg::base_disp(Reg::Virt(base), 8));

        // Single target only.
        let b = ctx.vregs_mut().allocate(RegKind::Gpr);
        let ld = ctx.append(Opcode::Lhi);
        ctx.use_target_register(ld, Reg::Virt(b));

        for inst in &[ld, mul, label_inst] {
            assign(&mut ctx, *inst);
            assert_nothing_blocked(&ctx);
        }
    }

    #[test]
    fn already_real_operand_keeps_identity() {
        let mut ctx = ctx();
        let v = ctx.vregs_mut().allocate(RegKind::Gpr);

        // Two uses of the same value through its already-assigned register.
        let first = ctx.append(Opcode::Lr);
        let t1 = ctx.vregs_mut().allocate(RegKind::Gpr);
        ctx.use_target_register(first, Reg::Virt(t1));
        ctx.use_source_register(first, Reg::Virt(v));
        let second = ctx.append(Opcode::Lr);
        let t2 = ctx.vregs_mut().allocate(RegKind::Gpr);
        ctx.use_target_register(second, Reg::Virt(t2));
        ctx.use_source_register(second, Reg::Virt(v));

        // Backward pass: the later instruction binds the virtual register.
        assign(&mut ctx, second);
        let home = ctx.vregs().assigned(v).expect("source not assigned");
        assert_eq!(ctx.vregs().future_uses(v), 1);

        // The earlier one sees a bound register: identity preserved, only
        // liveness bookkeeping happens, and the final use frees it.
        assign(&mut ctx, first);
        assert_eq!(ctx.source_registers(first), &[Reg::Real(home)]);
        assert_eq!(ctx.vregs().future_uses(v), 0);
        assert_eq!(ctx.machine().state(home), RegState::Free);
        assert_eq!(ctx.vregs().assigned(v), None);
    }

    #[test]
    fn pairs_are_assigned_before_singles() {
        let mut ctx = ctx();
        let shell = ctx.vregs_mut().allocate_pair(RegKind::Gpr);
        let s1 = ctx.vregs_mut().allocate(RegKind::Gpr);
        let s2 = ctx.vregs_mut().allocate(RegKind::Gpr);

        let inst = ctx.append(Opcode::Dr);
        // Singles recorded first: ordering must still give the pair the
        // first whole couple.
        ctx.use_source_register(inst, Reg::Virt(s1));
        ctx.use_source_register(inst, Reg::Virt(s2));
        ctx.use_target_register(inst, Reg::Virt(shell));

        // Keep everything live past the instruction so the assignments are
        // observable afterwards (a drained future count would free them).
        let keepalive = ctx.append(Opcode::Stm);
        ctx.use_target_register(keepalive, Reg::Virt(shell));
        let extra = ctx.append(Opcode::Ar);
        ctx.use_target_register(extra, Reg::Virt(s1));
        ctx.use_source_register(extra, Reg::Virt(s2));

        assign(&mut ctx, inst);
        let halves = ctx.vregs().pair(shell).unwrap();
        assert_eq!(ctx.vregs().assigned(halves.high), Some(RealReg::gpr(0)));
        assert_eq!(ctx.vregs().assigned(halves.low), Some(RealReg::gpr(1)));
        // The singles were pushed past the pair.
        assert_eq!(ctx.vregs().assigned(s1), Some(RealReg::gpr(2)));
        assert_eq!(ctx.vregs().assigned(s2), Some(RealReg::gpr(3)));
        assert_nothing_blocked(&ctx);
    }

    #[test]
    fn attach_bookkeeping_counts_only_new_region() {
        let mut ctx = ctx();
        let v = ctx.vregs_mut().allocate(RegKind::Gpr);
        let inst = ctx.append(Opcode::Basr);

        let first = ctx.create_conds(1, 0);
        ctx.add_pre_dep(first, Dep::new(v, Constraint::Fixed(RealReg::gpr(2)), DepAction::USE));
        ctx.set_dependency_conditions(inst, Some(first));
        assert_eq!(ctx.vregs().total_uses(v), 1);

        // A second pass adds more conditions to the same instruction: only
        // the new entries are counted, not the already-attached region.
        let second = ctx.create_conds(1, 0);
        ctx.add_pre_dep(second, Dep::new(v, Constraint::AssignAny, DepAction::USE));
        let merged = ctx.set_dependency_conditions(inst, Some(second));
        assert_eq!(ctx.vregs().total_uses(v), 2);
        assert_eq!(ctx.conds(merged).pre_cursor(), 2);
        assert!(ctx.conds(merged).is_used());
    }

    #[test]
    #[should_panic(expected = "null register dependency conditions")]
    fn null_condition_set_is_fatal() {
        let mut ctx = ctx();
        let inst = ctx.append(Opcode::Basr);
        ctx.set_dependency_conditions(inst, None);
    }

    #[test]
    fn post_conditions_place_call_results() {
        let mut ctx = ctx();
        let result = ctx.vregs_mut().allocate(RegKind::Gpr);

        // A consumer after the call (processed first by the backward pass).
        let consumer = ctx.append(Opcode::St);
        let base = ctx.vregs_mut().allocate(RegKind::Gpr);
        ctx.use_target_register(consumer, Reg::Virt(result));
        ctx.use_target_mem(consumer, MemArg::base_disp(Reg::Virt(base), 0));

        let call = ctx.append(Opcode::Brasl);
        let set = ctx.create_conds(0, 1);
        ctx.add_post_dep(
            set,
            Dep::new(result, Constraint::Fixed(RealReg::gpr(2)), DepAction::DEF),
        );
        ctx.set_dependency_conditions(call, Some(set));

        assign(&mut ctx, consumer);
        // First-fit placed the result somewhere; the call's post-condition
        // must coerce it into the linkage register.
        assert!(ctx.vregs().assigned(result).is_some());
        assign(&mut ctx, call);
        // The call defines the value: its lifetime starts here, so after the
        // last (attach) use is consumed the register is released.
        assert_eq!(ctx.vregs().assigned(result), None);
        assert_eq!(ctx.machine().state(RealReg::gpr(2)), RegState::Free);
        // The observed reference was recorded on the dependency.
        let conds = ctx.dependency_conditions(call).unwrap();
        assert!(ctx.conds(conds).post().unwrap().deps()[0].action.refs);
        assert_nothing_blocked(&ctx);
    }

    #[test]
    fn call_preserves_vector_data_in_nonvolatile_float_registers() {
        let mut ctx = ctx();
        let vec = ctx.vregs_mut().allocate(RegKind::Vector);

        // Give the vector value a live range across the call.
        let user = ctx.append(Opcode::Va);
        ctx.use_target_register(user, Reg::Virt(vec));
        ctx.use_source_register(user, Reg::Virt(vec));

        let call = ctx.append(Opcode::Brasl);
        let ret = ctx.vregs_mut().allocate(RegKind::Gpr);
        let set = ctx.create_conds(0, 1);
        ctx.add_post_dep(
            set,
            Dep::new(ret, Constraint::Fixed(RealReg::gpr(14)), DepAction::DEF),
        );
        ctx.set_dependency_conditions(call, Some(set));

        // Park the vector value in a preserved floating register.
        let parked = RealReg::fpr(8);
        {
            let Context { machine, vregs, .. } = &mut ctx;
            machine.bind(vregs, vec, parked);
        }

        assign(&mut ctx, call);
        // The overlap rule moved the vector value out of %f8.
        assert_ne!(ctx.vregs().assigned(vec), Some(parked));
        assert_eq!(ctx.machine().state(parked), RegState::Unlatched);
    }

    #[test]
    fn redirect_body_is_assigned_and_conditions_merge() {
        let mut ctx = ctx();

        // Out-of-line body: add with its own dependency conditions.
        let bv = ctx.vregs_mut().allocate(RegKind::Gpr);
        let bs = ctx.vregs_mut().allocate(RegKind::Gpr);
        let body = ctx.append_detached(Opcode::Ar);
        ctx.use_target_register(body, Reg::Virt(bv));
        ctx.use_source_register(body, Reg::Virt(bs));
        let body_set = ctx.create_conds(1, 0);
        ctx.add_pre_dep(
            body_set,
            Dep::new(bv, Constraint::Fixed(RealReg::gpr(3)), DepAction::USE),
        );
        ctx.set_dependency_conditions(body, Some(body_set));

        // The visible execute instruction.
        let base = ctx.vregs_mut().allocate(RegKind::Gpr);
        let ex = ctx.append(Opcode::Ex);
        let len = ctx.vregs_mut().allocate(RegKind::Gpr);
        ctx.use_source_register(ex, Reg::Virt(len));
        ctx.use_source_mem(ex, MemArg::base_disp(Reg::Virt(base), 0));
        ctx.set_redirect(ex, body);
        let ex_set = ctx.create_conds(1, 0);
        ctx.add_pre_dep(
            ex_set,
            Dep::new(len, Constraint::AssignAny, DepAction::USE),
        );
        ctx.set_dependency_conditions(ex, Some(ex_set));

        assign(&mut ctx, ex);

        // Body operands were assigned through the redirect.
        assert!(ctx.target_registers(body)[0].real().is_some());
        assert!(ctx.source_registers(body)[0].real().is_some());
        // The body's conditions moved into the execute instruction's set:
        // body entries first, then the redirect's own.
        assert_eq!(ctx.dependency_conditions(body), None);
        let merged = ctx.dependency_conditions(ex).unwrap();
        let pre = ctx.conds(merged).pre().unwrap();
        assert_eq!(pre.cursor(), 2);
        assert_eq!(pre.deps()[0].vreg, bv);
        assert_eq!(pre.deps()[1].vreg, len);
        assert_nothing_blocked(&ctx);
    }

    #[test]
    fn cold_section_is_assigned_once() {
        let mut ctx = ctx();
        let cold = ctx.create_label();

        let v = ctx.vregs_mut().allocate(RegKind::Gpr);
        let ool_inst = ctx.append_detached(Opcode::Lhi);
        ctx.use_target_register(ool_inst, Reg::Virt(v));
        ctx.define_ool_section(cold, vec![ool_inst]);

        let br1 = ctx.append(Opcode::Brc);
        ctx.set_label(br1, cold);
        let br2 = ctx.append(Opcode::Brc);
        ctx.set_label(br2, cold);

        assign(&mut ctx, br2);
        assert!(ctx.target_registers(ool_inst)[0].real().is_some());
        assert_eq!(ctx.vregs().future_uses(v), 0);
        // The second branch must not re-run the section (the counters would
        // underflow if it did).
        assign(&mut ctx, br1);
    }

    #[test]
    fn spill_register_selection_is_a_pure_query() {
        let mut ctx = ctx();
        let inst = ctx.append(Opcode::L);
        let v = ctx.vregs_mut().allocate(RegKind::Gpr);
        ctx.use_target_register(inst, Reg::Virt(v));
        ctx.use_source_mem(
            inst,
            MemArg::base_disp(Reg::Real(RealReg::gpr(1)), 4096),
        );
        assign(&mut ctx, inst);

        let before: Vec<RegState> = (0..NUM_UNITS as u8)
            .map(|u| ctx.machine().state(RealReg::from_unit(u)))
            .collect();
        let first = ctx.assign_best_spill_register(inst);
        let second = ctx.assign_best_spill_register2(inst);
        let after: Vec<RegState> = (0..NUM_UNITS as u8)
            .map(|u| ctx.machine().state(RealReg::from_unit(u)))
            .collect();

        // Neither selection may name an instruction operand, pick the same
        // register twice, or change any machine state.
        assert_ne!(first, second);
        for reg in &[first, second] {
            assert!(!ctx.contains_register(inst, Reg::Real(*reg)));
        }
        assert_eq!(before, after);
        assert_eq!(ctx.spill_registers(inst), [Some(first), Some(second)]);
    }

    #[test]
    fn free_register_vector_reflects_machine_state() {
        let mut ctx = ctx();
        let v = ctx.vregs_mut().allocate(RegKind::Gpr);
        let w = ctx.vregs_mut().allocate(RegKind::Gpr);

        // def v; w = v; store w. Only the first two are assigned; the store
        // keeps w live so the move's register picture is observable.
        let def = ctx.append(Opcode::Lhi);
        ctx.use_target_register(def, Reg::Virt(v));
        let mv = ctx.append(Opcode::Lr);
        ctx.use_target_register(mv, Reg::Virt(w));
        ctx.use_source_register(mv, Reg::Virt(v));
        let keepalive = ctx.append(Opcode::St);
        ctx.use_target_register(keepalive, Reg::Virt(w));

        assign(&mut ctx, mv);
        let free = ctx.free_regs(mv);
        // %r0 is never offered and v's register is live across this point.
        assert_eq!(free & RealReg::gpr(0).bit(), 0);
        let home = ctx.vregs().assigned(v).unwrap();
        assert_eq!(free & home.bit(), 0);

        assign(&mut ctx, def);
        // v dies at its definition, so its register is free again there.
        assert_ne!(ctx.free_regs(def) & home.bit(), 0);
    }
}
