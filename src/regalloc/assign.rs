//! Per-instruction register assignment.
//!
//! The surrounding phase driver walks the instruction stream in reverse
//! program order and calls
//! [`Context::assign_registers`](../../context/struct.Context.html#method.assign_registers)
//! once per instruction per pass. For each instruction the steps are:
//!
//! 1. block every live operand register,
//! 2. assign register pairs (both halves placed and blocked before any
//!    single register),
//! 3. assign remaining target registers, releasing a target's real register
//!    when its future use count drains to zero,
//! 4. apply pre-condition dependencies; dead targets are unblocked around
//!    this step so the conditions see them as available,
//! 5. assign remaining source registers, then registers referenced only
//!    from memory operands,
//! 6. apply post-condition dependencies, force-preserving overlapping
//!    register classes around calls,
//! 7. unblock everything blocked in the steps above,
//! 8. capture the free-register bit vector for later long-displacement
//!    resolution.
//!
//! The order matters: blocking prevents an operand's register from
//! being handed to a neighbouring operand mid-instruction, and the backward
//! traversal makes a future-use count of zero mean "no earlier instruction
//! needs this value".

use crate::context::Context;
use crate::inst::{Inst, Label, Reg, MAX_REG_OPERANDS};
use crate::isa::registers::{mask_units, GPR_MASK_NO_R0};
use crate::isa::{RealReg, RegKind, RegState};
use crate::regalloc::deps::{Constraint, Dep, DepConds, DepSet};
use crate::regalloc::virtregs::VirtReg;
use crate::regalloc::{Bookkeeping, RegKinds};
use log::debug;
use smallvec::SmallVec;

/// Non-volatile floating registers per the calling convention. Vector-kind
/// values resting here collide with the callee's view of the floating file.
const PRESERVED_FPRS: core::ops::Range<u8> = 8..16;

/// Registers blocked on behalf of one instruction, unblocked together when
/// its assignment completes.
type BlockedList = SmallVec<[RealReg; 16]>;

/// Which group of a condition set is being applied.
#[derive(Clone, Copy, PartialEq, Eq)]
enum DepPosition {
    Pre,
    Post,
}

impl Context {
    /// Assign real registers for one instruction.
    ///
    /// `kinds` selects the register kinds processed this pass; operands of
    /// other kinds are left untouched. `bookkeeping` controls whether
    /// liveness counters are updated, threaded explicitly so a re-scan pass
    /// can walk the stream without disturbing them.
    pub fn assign_registers(&mut self, inst: Inst, kinds: RegKinds, bookkeeping: Bookkeeping) {
        debug!("assigning registers for {}", inst);
        self.assign_registers_and_dependencies(inst, kinds, bookkeeping);

        // An execute-style redirect stands in for an out-of-line body: the
        // body is assigned in the redirect's position, so its previous-link
        // is rewired for the duration.
        if let Some(body) = self.insts[inst].redirect {
            let saved_prev = self.insts[body].prev;
            self.insts[body].prev = self.insts[inst].prev;
            self.assign_registers(body, kinds, bookkeeping);

            // Fold the body's conditions into the redirect's. Use counts
            // were taken when the body's set was first attached, so none are
            // taken here.
            if let Some(body_conds) = self.insts[body].conds.take() {
                let merged = match self.insts[inst].conds {
                    Some(own) => {
                        let merged = DepConds::merged(&self.conds[body_conds], &self.conds[own]);
                        self.conds.push(merged)
                    }
                    None => body_conds,
                };
                self.insts[inst].conds = Some(merged);
            }

            self.insts[body].prev = saved_prev;
        }

        debug!(
            "free registers after {}: {:#014x}",
            inst, self.insts[inst].free_regs
        );
    }

    fn assign_registers_and_dependencies(
        &mut self,
        inst: Inst,
        kinds: RegKinds,
        bookkeeping: Bookkeeping,
    ) {
        // A branch into a cold out-of-line stream assigns that whole stream
        // first, so the section sees the register state of its merge point.
        if self.insts[inst].opcode.is_branch() {
            if let Some(target) = self.insts[inst].label {
                if self.is_label_cold(target) {
                    self.assign_ool_section(target, kinds, bookkeeping);
                }
            }
        }

        self.assign_ordered_registers(inst, kinds, bookkeeping);

        // Step 8: free-register bit vector, for long-displacement scratch
        // selection. %r0 can't serve as a scratch base.
        self.insts[inst].free_regs = self.machine.free_mask() & GPR_MASK_NO_R0;
    }

    fn assign_ool_section(&mut self, label: Label, kinds: RegKinds, bookkeeping: Bookkeeping) {
        let index = self
            .ool
            .iter()
            .position(|s| s.label == label)
            .unwrap_or_else(|| panic!("no out-of-line section for {}", label));
        if self.ool[index].assigned {
            return;
        }
        self.ool[index].assigned = true;
        debug!("assigning out-of-line section at {}", label);
        let insts = self.ool[index].insts.clone();
        for &ool_inst in insts.iter().rev() {
            self.assign_registers(ool_inst, kinds, bookkeeping);
        }
    }

    /// Steps 1–7 for one instruction.
    fn assign_ordered_registers(&mut self, inst: Inst, kinds: RegKinds, bookkeeping: Bookkeeping) {
        let opcode = self.insts[inst].opcode;

        let num_tgt_pairs = self.insts[inst]
            .tgts
            .iter()
            .filter(|reg| reg.virt().map_or(false, |v| self.vregs.is_pair(v)))
            .count();

        // A lone dead-on-entry target with no own reads doesn't need to stay
        // blocked while the sources are assigned.
        let block_target = !(num_tgt_pairs == 0
            && self.insts[inst].tgts.len() == 1
            && self.insts[inst].tgt_mems.is_empty()
            && !opcode.uses_target()
            && !self.any_spilled_operands(inst));

        // Step 1: block all live operand registers. Everything pushed onto
        // `blocked` is unblocked in step 7, which keeps the two symmetric
        // even as operands are rewritten in between.
        let mut blocked: BlockedList = SmallVec::new();
        for real in self.operand_real_set(inst, block_target) {
            self.machine.block(real);
            blocked.push(real);
        }

        let mut src_done = [0u8; MAX_REG_OPERANDS];
        let mut tgt_done = [0u8; MAX_REG_OPERANDS];

        // Step 2: register pairs first, targets then sources. Both halves
        // are placed and blocked before any single register is considered.
        for i in 0..self.insts[inst].tgts.len() {
            if let Some(v) = self.insts[inst].tgts[i].virt() {
                if self.vregs.is_pair(v) {
                    self.assign_pair_operand(v, kinds, bookkeeping, &mut blocked);
                    tgt_done[i] = 2;
                }
            }
        }
        for i in 0..self.insts[inst].srcs.len() {
            if let Some(v) = self.insts[inst].srcs[i].virt() {
                if self.vregs.is_pair(v) {
                    self.assign_pair_operand(v, kinds, bookkeeping, &mut blocked);
                    src_done[i] = 2;
                }
            }
        }

        // Step 3: remaining target registers.
        for i in 0..self.insts[inst].tgts.len() {
            if tgt_done[i] != 0 {
                continue;
            }
            let assigned = self.assign_register_no_dependencies(
                inst,
                self.insts[inst].tgts[i],
                kinds,
                bookkeeping,
            );
            self.insts[inst].tgts[i] = assigned;
            if let Some(real) = self.operand_real(assigned) {
                if self.machine.assigned_vreg(real).is_some() || block_target {
                    self.machine.block(real);
                    blocked.push(real);
                }
            }
            tgt_done[i] = 1;
        }

        // Pre-condition placement must see dead targets as available, so
        // unblock them around step 4.
        if block_target {
            self.toggle_dead_targets(inst, &tgt_done, false);
        }

        // Step 4: pre-condition dependencies.
        if let Some(set) = self.insts[inst].conds {
            self.assign_dependency_group(set, DepPosition::Pre, kinds, bookkeeping);
        }

        if block_target {
            self.toggle_dead_targets(inst, &tgt_done, true);
        }

        // Step 5: remaining source registers, then registers referenced only
        // from memory operands.
        for i in 0..self.insts[inst].srcs.len() {
            if src_done[i] != 0 {
                continue;
            }
            let assigned = self.assign_register_no_dependencies(
                inst,
                self.insts[inst].srcs[i],
                kinds,
                bookkeeping,
            );
            self.insts[inst].srcs[i] = assigned;
            if let Some(real) = self.operand_real(assigned) {
                self.machine.block(real);
                blocked.push(real);
            }
            src_done[i] = 1;
        }
        self.assign_mem_operands(inst, kinds, bookkeeping, &mut blocked);

        // Step 6: post-condition dependencies, plus the architectural
        // register-file overlap rule around calls.
        if let Some(set) = self.insts[inst].conds {
            self.assign_dependency_group(set, DepPosition::Post, kinds, bookkeeping);
            if opcode.is_call() {
                self.preserve_overlapping_classes();
            }
        }

        // Step 7: unblock everything blocked in steps 1–6. Registers that
        // were freed along the way already left the Blocked state, so this
        // is a no-op for them.
        for real in blocked {
            self.machine.unblock(real);
        }
    }

    /// Resolve the real registers currently occupied by the instruction's
    /// operands: targets (when requested), sources, and memory bases and
    /// indexes.
    fn operand_real_set(&self, inst: Inst, include_tgts: bool) -> BlockedList {
        let mut out = BlockedList::new();
        let data = &self.insts[inst];
        if include_tgts {
            for reg in &data.tgts {
                self.operand_reals(*reg, &mut out);
            }
        }
        for reg in &data.srcs {
            self.operand_reals(*reg, &mut out);
        }
        for mem in data.src_mems.iter().chain(data.tgt_mems.iter()) {
            for reg in mem.regs() {
                self.operand_reals(reg, &mut out);
            }
        }
        out
    }

    /// The real registers an operand currently occupies, if any.
    fn operand_reals(&self, reg: Reg, out: &mut BlockedList) {
        match reg {
            Reg::Real(r) => out.push(r),
            Reg::Virt(v) => match self.vregs.pair(v) {
                Some(halves) => {
                    if let Some(r) = self.vregs.assigned(halves.high) {
                        out.push(r);
                    }
                    if let Some(r) = self.vregs.assigned(halves.low) {
                        out.push(r);
                    }
                }
                None => {
                    if let Some(r) = self.vregs.assigned(v) {
                        out.push(r);
                    }
                }
            },
        }
    }

    fn operand_real(&self, reg: Reg) -> Option<RealReg> {
        match reg {
            Reg::Real(r) => Some(r),
            Reg::Virt(v) => self.vregs.assigned(v),
        }
    }

    fn toggle_dead_targets(&mut self, inst: Inst, tgt_done: &[u8; MAX_REG_OPERANDS], block: bool) {
        for i in 0..self.insts[inst].tgts.len() {
            // Pairs were fully assigned already; leave them blocked.
            if tgt_done[i] == 2 {
                continue;
            }
            if let Some(real) = self.operand_real(self.insts[inst].tgts[i]) {
                if self.machine.assigned_vreg(real).is_none() {
                    if block {
                        self.machine.block(real);
                    } else {
                        self.machine.unblock(real);
                    }
                }
            }
        }
    }

    fn assign_pair_operand(
        &mut self,
        shell: VirtReg,
        kinds: RegKinds,
        bookkeeping: Bookkeeping,
        blocked: &mut BlockedList,
    ) {
        if !kinds.contains(self.vregs.kind(shell)) {
            return;
        }
        let (even, odd) =
            self.machine
                .assign_best_register_pair(&mut self.vregs, shell, bookkeeping);
        self.machine.block(even);
        self.machine.block(odd);
        blocked.push(even);
        blocked.push(odd);
    }

    /// Assign one non-pair operand, outside of any dependency constraints.
    ///
    /// An operand that is already a real register degenerates to liveness
    /// bookkeeping: its virtual owner's future use count is decremented and
    /// the register freed when the count drains; a real register is never
    /// reassigned to a different real register. Hardcoded but semantically
    /// inert register mentions are excluded even from that.
    fn assign_register_no_dependencies(
        &mut self,
        inst: Inst,
        reg: Reg,
        kinds: RegKinds,
        bookkeeping: Bookkeeping,
    ) -> Reg {
        match reg {
            Reg::Real(real) => {
                if self.is_inert_reg_mention(inst, real) {
                    return reg;
                }
                if self.machine.state(real) != RegState::Locked && bookkeeping.is_enabled() {
                    if let Some(owner) = self.machine.assigned_vreg(real) {
                        if self.vregs.consume_use(owner) == 0 {
                            self.machine.unbind(&mut self.vregs, owner);
                        }
                    }
                }
                reg
            }
            Reg::Virt(v) => {
                assert!(
                    !self.vregs.is_pair(v),
                    "register pair {} reached the single-register assignment path",
                    v
                );
                if !kinds.contains(self.vregs.kind(v)) {
                    return reg;
                }
                let real = self
                    .machine
                    .assign_best_register(&mut self.vregs, v, bookkeeping, !0);
                Reg::Real(real)
            }
        }
    }

    fn assign_mem_operands(
        &mut self,
        inst: Inst,
        kinds: RegKinds,
        bookkeeping: Bookkeeping,
        blocked: &mut BlockedList,
    ) {
        for target_side in &[false, true] {
            let count = if *target_side {
                self.insts[inst].tgt_mems.len()
            } else {
                self.insts[inst].src_mems.len()
            };
            for i in 0..count {
                let mem = if *target_side {
                    self.insts[inst].tgt_mems[i]
                } else {
                    self.insts[inst].src_mems[i]
                };
                let base = mem
                    .base
                    .map(|reg| self.assign_register_no_dependencies(inst, reg, kinds, bookkeeping));
                let index = mem
                    .index
                    .map(|reg| self.assign_register_no_dependencies(inst, reg, kinds, bookkeeping));
                for reg in base.iter().chain(index.iter()) {
                    if let Some(real) = self.operand_real(*reg) {
                        self.machine.block(real);
                        blocked.push(real);
                    }
                }
                let slot = if *target_side {
                    &mut self.insts[inst].tgt_mems[i]
                } else {
                    &mut self.insts[inst].src_mems[i]
                };
                slot.base = base;
                slot.index = index;
            }
        }
    }

    /// Apply one group of a dependency condition set.
    ///
    /// Placement order: kill/spill directives, then already-placed registers
    /// are blocked, then pairs, then leftover pair-member constraints, then
    /// specific registers, and wildcards last (any free register satisfies
    /// them). Registers blocked to protect the group are unblocked when the
    /// group is done.
    fn assign_dependency_group(
        &mut self,
        set: DepSet,
        position: DepPosition,
        kinds: RegKinds,
        bookkeeping: Bookkeeping,
    ) {
        let deps: Vec<Dep> = {
            let conds = &self.conds[set];
            let group = match position {
                DepPosition::Pre => conds.pre(),
                DepPosition::Post => conds.post(),
            };
            match group {
                Some(group) => group.deps().to_vec(),
                None => return,
            }
        };

        // Wildcards may not land on registers the group names explicitly.
        let mut avail: u64 = !0;
        for dep in &deps {
            if let Some(real) = dep.constraint.fixed_reg() {
                avail &= !real.bit();
            }
        }

        let mut group_blocked: Vec<RealReg> = Vec::new();

        // Kill and spill directives first: they release registers the rest
        // of the group may claim.
        for dep in &deps {
            match dep.constraint {
                Constraint::KillClass(kind) => self.kill_register_class(kind),
                Constraint::Spilled => {
                    if self.vregs.assigned(dep.vreg).is_some() {
                        self.machine.unbind(&mut self.vregs, dep.vreg);
                        self.vregs.data_mut(dep.vreg).spilled = true;
                    }
                }
                _ => {}
            }
        }

        // Protect registers that already satisfy their dependency from the
        // coercion shuffles below.
        for dep in &deps {
            if let Some(real) = self.vregs.assigned(dep.vreg) {
                if self.machine.state(real) == RegState::Assigned {
                    self.machine.block(real);
                    group_blocked.push(real);
                }
            }
        }

        // Pairs, then leftover pair members, then fixed, then wildcards.
        for dep in &deps {
            if dep.constraint == Constraint::EvenOddPair
                && kinds.contains(self.vregs.kind(dep.vreg))
            {
                let (even, odd) = self.machine.assign_best_register_pair(
                    &mut self.vregs,
                    dep.vreg,
                    Bookkeeping::Disabled,
                );
                self.machine.block(even);
                self.machine.block(odd);
                group_blocked.push(even);
                group_blocked.push(odd);
            }
        }
        for dep in &deps {
            if dep.constraint.is_pair_member() && kinds.contains(self.vregs.kind(dep.vreg)) {
                let want_even = dep.constraint == Constraint::LegalEvenOfPair;
                let real = self.ensure_pairable_member(dep.vreg, want_even);
                self.machine.block(real);
                group_blocked.push(real);
            }
        }
        for dep in &deps {
            if let Some(real) = dep.constraint.fixed_reg() {
                if kinds.contains(self.vregs.kind(dep.vreg)) {
                    if self.vregs.assigned(dep.vreg) == Some(real) {
                        continue;
                    }
                    // The target may be blocked as an operand or for group
                    // protection; its own dependency overrides that.
                    self.machine.unblock(real);
                    if let Some(home) = self.vregs.assigned(dep.vreg) {
                        self.machine.unblock(home);
                    }
                    self.machine
                        .coerce(&mut self.vregs, dep.vreg, real, Bookkeeping::Disabled);
                    self.machine.block(real);
                    group_blocked.push(real);
                }
            }
        }
        for dep in &deps {
            if dep.constraint.is_assign_any()
                && kinds.contains(self.vregs.kind(dep.vreg))
                && self.vregs.assigned(dep.vreg).is_none()
            {
                let mut mask = avail;
                if dep.constraint == Constraint::AssignAnyExceptZero {
                    mask &= !RealReg::gpr(0).bit();
                }
                let real = self.machine.assign_best_register(
                    &mut self.vregs,
                    dep.vreg,
                    Bookkeeping::Disabled,
                    mask,
                );
                self.machine.block(real);
                group_blocked.push(real);
            }
        }

        // Liveness bookkeeping over the whole group, and record the refs
        // actually observed at this boundary.
        for (i, dep) in deps.iter().enumerate() {
            if let Constraint::KillClass(_) = dep.constraint {
                continue;
            }
            if !kinds.contains(self.vregs.kind(dep.vreg)) {
                continue;
            }
            if bookkeeping.is_enabled() {
                if let Some(halves) = self.vregs.pair(dep.vreg) {
                    self.machine
                        .bookkeep(&mut self.vregs, halves.high, bookkeeping);
                    self.machine
                        .bookkeep(&mut self.vregs, halves.low, bookkeeping);
                }
                self.machine.bookkeep(&mut self.vregs, dep.vreg, bookkeeping);
            }
            let group = match position {
                DepPosition::Pre => self.conds[set].pre_mut(),
                DepPosition::Post => self.conds[set].post_mut(),
            };
            if let Some(group) = group {
                group.deps_mut()[i].action.refs = true;
            }
        }

        for real in group_blocked {
            self.machine.unblock(real);
        }
    }

    /// Place a leftover even/odd pair-member so it stays legally pairable.
    fn ensure_pairable_member(&mut self, vreg: VirtReg, want_even: bool) -> RealReg {
        if let Some(real) = self.vregs.assigned(vreg) {
            if real.is_even() == want_even {
                return real;
            }
        }
        let bank = self.vregs.kind(vreg).bank_mask();
        let even = self
            .machine
            .find_free_pair(bank)
            .unwrap_or_else(|| panic!("no legal pair member available for {}", vreg));
        let target = if want_even { even } else { even.odd_sibling() };
        if let Some(home) = self.vregs.assigned(vreg) {
            self.machine.unblock(home);
        }
        self.machine
            .coerce(&mut self.vregs, vreg, target, Bookkeeping::Disabled);
        target
    }

    /// Release every register of `kind` at a clobbering boundary.
    fn kill_register_class(&mut self, kind: RegKind) {
        for real in mask_units(kind.bank_mask()) {
            if self.machine.state(real) == RegState::Assigned {
                if let Some(owner) = self.machine.assigned_vreg(real) {
                    self.machine.unbind(&mut self.vregs, owner);
                    self.vregs.data_mut(owner).spilled = true;
                    debug!("killing {} across boundary, {} spilled", real, owner);
                }
            }
        }
    }

    /// Around a call, a non-volatile floating register holding a
    /// vector-kind value is physically the low half of a clobbered vector
    /// register. Move the value out through a placeholder and leave the
    /// register unlatched.
    fn preserve_overlapping_classes(&mut self) {
        for n in PRESERVED_FPRS {
            let real = RealReg::fpr(n);
            let owner = match self.machine.assigned_vreg(real) {
                Some(owner) => owner,
                None => continue,
            };
            if self.vregs.kind(owner) == RegKind::Fpr {
                continue;
            }
            debug!("preserving {} out of overlapping {}", owner, real);
            let dummy = self.vregs.allocate_placeholder(RegKind::Fpr);
            self.machine
                .coerce(&mut self.vregs, dummy, real, Bookkeeping::Disabled);
            self.machine.unbind(&mut self.vregs, dummy);
            self.machine.set_state(real, RegState::Unlatched);
        }
    }

    /// Pick a register provably not referenced by this instruction, for a
    /// save/restore spill around it. A pure query: the register keeps its
    /// current state.
    pub fn assign_best_spill_register(&mut self, inst: Inst) -> RealReg {
        let reg = self.find_reg_not_used_in(inst, None);
        self.insts[inst].spill_regs[0] = Some(reg);
        reg
    }

    /// Second spill register; never the one picked first.
    pub fn assign_best_spill_register2(&mut self, inst: Inst) -> RealReg {
        let avoid = self.insts[inst].spill_regs[0];
        let reg = self.find_reg_not_used_in(inst, avoid);
        self.insts[inst].spill_regs[1] = Some(reg);
        reg
    }

    /// Spill registers selected for this instruction so far.
    pub fn spill_registers(&self, inst: Inst) -> [Option<RealReg>; 2] {
        self.insts[inst].spill_regs
    }

    fn find_reg_not_used_in(&self, inst: Inst, avoid: Option<RealReg>) -> RealReg {
        // %r0 can't serve as a base register in the save/restore sequence.
        mask_units(GPR_MASK_NO_R0)
            .filter(|r| Some(*r) != avoid)
            .find(|r| !self.contains_register(inst, Reg::Real(*r)))
            .unwrap_or_else(|| panic!("no spill register free of {}", inst))
    }

    fn any_spilled_operands(&self, inst: Inst) -> bool {
        let data = &self.insts[inst];
        let regs = data
            .srcs
            .iter()
            .cloned()
            .chain(data.src_mems.iter().flat_map(|mem| mem.regs()));
        for reg in regs {
            let v = match reg.virt() {
                Some(v) => v,
                None => continue,
            };
            let members: SmallVec<[VirtReg; 2]> = match self.vregs.pair(v) {
                Some(halves) => SmallVec::from_slice(&[halves.high, halves.low]),
                None => SmallVec::from_slice(&[v]),
            };
            for m in members {
                if self.vregs.assigned(m).is_none()
                    && self.vregs.total_uses(m) != self.vregs.future_uses(m)
                {
                    return true;
                }
            }
        }
        false
    }
}
