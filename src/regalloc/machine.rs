//! Real register file state.
//!
//! The machine tracks, for every register unit, its allocation state and the
//! virtual register bound to it. The virtual→real and real→virtual links must
//! agree whenever both are present; to keep that invariant in one place, the
//! only routines that write either side are [`bind`](struct.Machine.html#method.bind)
//! and [`unbind`](struct.Machine.html#method.unbind).
//!
//! Register selection here is deliberately simple (first fit in ascending
//! unit order within the eligibility mask): the assignment pass is local and
//! the caller constrains eligibility through the mask. Evictions and spills
//! are state-level only: inserting the corresponding move and reload
//! instructions belongs to the encoding layer, not to this subsystem.

use crate::isa::registers::{mask_units, NUM_UNITS};
use crate::isa::{RealReg, RegMask, RegState};
use crate::regalloc::virtregs::{VirtReg, VirtRegs};
use crate::regalloc::Bookkeeping;
use log::debug;

#[derive(Clone, Copy)]
struct RealRegData {
    state: RegState,
    assigned: Option<VirtReg>,
}

/// The register file of one compilation unit.
pub struct Machine {
    regs: [RealRegData; NUM_UNITS],
}

impl Machine {
    /// Create a register file with every unit free.
    pub fn new() -> Self {
        Self {
            regs: [RealRegData {
                state: RegState::Free,
                assigned: None,
            }; NUM_UNITS],
        }
    }

    /// Permanently reserve `reg` (stack pointer, environment pointers).
    pub fn lock(&mut self, reg: RealReg) {
        let data = &mut self.regs[reg.unit() as usize];
        debug_assert!(data.assigned.is_none(), "locking an assigned register");
        data.state = RegState::Locked;
    }

    /// Current state of `reg`.
    pub fn state(&self, reg: RealReg) -> RegState {
        self.regs[reg.unit() as usize].state
    }

    pub(crate) fn set_state(&mut self, reg: RealReg, state: RegState) {
        self.regs[reg.unit() as usize].state = state;
    }

    /// The virtual register bound to `reg`, if any.
    pub fn assigned_vreg(&self, reg: RealReg) -> Option<VirtReg> {
        self.regs[reg.unit() as usize].assigned
    }

    /// Bind `vreg` to `reg`, updating both directions of the relation.
    pub fn bind(&mut self, vregs: &mut VirtRegs, vreg: VirtReg, reg: RealReg) {
        let data = &mut self.regs[reg.unit() as usize];
        assert!(
            data.state != RegState::Locked,
            "binding {} to locked {}",
            vreg,
            reg
        );
        debug_assert!(
            data.assigned.is_none() || data.assigned == Some(vreg),
            "binding {} over occupied {}",
            vreg,
            reg
        );
        data.state = RegState::Assigned;
        data.assigned = Some(vreg);
        let vdata = vregs.data_mut(vreg);
        vdata.assigned = Some(reg);
        vdata.spilled = false;
        debug!("assigning {} to {}", reg, vreg);
    }

    /// Dissolve `vreg`'s binding, freeing its real register. Returns the
    /// register that was freed.
    pub fn unbind(&mut self, vregs: &mut VirtRegs, vreg: VirtReg) -> Option<RealReg> {
        let reg = vregs.data_mut(vreg).assigned.take()?;
        let data = &mut self.regs[reg.unit() as usize];
        debug_assert_eq!(data.assigned, Some(vreg));
        data.assigned = None;
        data.state = RegState::Free;
        debug!("freeing {} from {}", reg, vreg);
        Some(reg)
    }

    /// Make `reg` ineligible for reassignment until unblocked. Locked
    /// registers are never blocked.
    pub fn block(&mut self, reg: RealReg) {
        let data = &mut self.regs[reg.unit() as usize];
        if data.state != RegState::Locked {
            data.state = RegState::Blocked;
        }
    }

    /// Undo [`block`](#method.block): back to Assigned or Free depending on
    /// whether a virtual register is bound.
    pub fn unblock(&mut self, reg: RealReg) {
        let data = &mut self.regs[reg.unit() as usize];
        if data.state == RegState::Blocked {
            data.state = if data.assigned.is_some() {
                RegState::Assigned
            } else {
                RegState::Free
            };
        }
    }

    /// First assignable register in `mask`, in ascending unit order.
    /// Free and Unlatched units qualify.
    pub fn find_free(&self, mask: RegMask) -> Option<RealReg> {
        mask_units(mask).find(|r| self.is_assignable(*r))
    }

    /// First even/odd couple in `mask` with both units assignable. Returns
    /// the even member.
    pub fn find_free_pair(&self, mask: RegMask) -> Option<RealReg> {
        mask_units(mask)
            .filter(|r| r.is_even())
            .find(|r| {
                let odd = r.odd_sibling();
                mask & odd.bit() != 0 && self.is_assignable(*r) && self.is_assignable(odd)
            })
    }

    fn is_assignable(&self, reg: RealReg) -> bool {
        match self.state(reg) {
            RegState::Free | RegState::Unlatched => true,
            _ => false,
        }
    }

    /// Assign the best register for `vreg` under `mask`.
    ///
    /// If the virtual register already holds a real register, that register
    /// is reused; assignment never migrates an existing binding. Otherwise
    /// a free register is taken, evicting an occupant to its spill slot if
    /// the mask is exhausted. With bookkeeping enabled, one future use is
    /// consumed and the register is released when the count reaches zero.
    pub fn assign_best_register(
        &mut self,
        vregs: &mut VirtRegs,
        vreg: VirtReg,
        bookkeeping: Bookkeeping,
        mask: RegMask,
    ) -> RealReg {
        let reg = match vregs.assigned(vreg) {
            Some(reg) => reg,
            None => {
                let mask = self.restrict(vregs, vreg, mask);
                let reg = match self.find_free(mask) {
                    Some(reg) => reg,
                    None => self.spill_victim(vregs, mask),
                };
                self.bind(vregs, vreg, reg);
                reg
            }
        };
        self.bookkeep(vregs, vreg, bookkeeping);
        reg
    }

    /// Assign an even/odd register couple to the halves of the pair shell
    /// `shell`. Returns `(even, odd)`.
    pub fn assign_best_register_pair(
        &mut self,
        vregs: &mut VirtRegs,
        shell: VirtReg,
        bookkeeping: Bookkeeping,
    ) -> (RealReg, RealReg) {
        let halves = vregs
            .pair(shell)
            .unwrap_or_else(|| panic!("{} is not a register pair", shell));

        let (even, odd) = match (vregs.assigned(halves.high), vregs.assigned(halves.low)) {
            (Some(e), Some(o)) => {
                assert!(
                    e.is_even() && o == e.odd_sibling(),
                    "pair {} split across {} and {}",
                    shell,
                    e,
                    o
                );
                (e, o)
            }
            _ => {
                let mask = self.restrict(vregs, halves.high, vregs.kind(shell).bank_mask());
                let even = match self.find_free_pair(mask) {
                    Some(even) => even,
                    None => self.spill_victim_pair(vregs, mask),
                };
                // Re-couple a half that was previously placed elsewhere.
                if vregs.assigned(halves.high).is_some() {
                    self.unbind(vregs, halves.high);
                }
                if vregs.assigned(halves.low).is_some() {
                    self.unbind(vregs, halves.low);
                }
                self.bind(vregs, halves.high, even);
                self.bind(vregs, halves.low, even.odd_sibling());
                (even, even.odd_sibling())
            }
        };

        self.bookkeep(vregs, halves.high, bookkeeping);
        self.bookkeep(vregs, halves.low, bookkeeping);
        self.bookkeep(vregs, shell, bookkeeping);
        (even, odd)
    }

    /// Force `vreg` into the specific register `target`, evicting any
    /// occupant. The occupant is relocated to a free register of its bank if
    /// one exists, and sent to its spill slot otherwise. A register `vreg`
    /// previously occupied is left Unlatched: its value has been moved out
    /// but nothing has claimed the register yet.
    pub fn coerce(
        &mut self,
        vregs: &mut VirtRegs,
        vreg: VirtReg,
        target: RealReg,
        bookkeeping: Bookkeeping,
    ) {
        if vregs.assigned(vreg) == Some(target) {
            self.bookkeep(vregs, vreg, bookkeeping);
            return;
        }

        match self.state(target) {
            RegState::Locked => panic!("coercing {} into locked {}", vreg, target),
            RegState::Blocked => panic!("coercing {} into blocked {}", vreg, target),
            RegState::Assigned => {
                let occupant = self.assigned_vreg(target).expect("assigned without vreg");
                let bank = vregs.kind(occupant).bank_mask();
                self.unbind(vregs, occupant);
                match self.find_free(bank & !target.bit()) {
                    Some(home) => self.bind(vregs, occupant, home),
                    None => {
                        debug!("spilling {} evicted from {}", occupant, target);
                        vregs.data_mut(occupant).spilled = true;
                    }
                }
            }
            RegState::Free | RegState::Unlatched => {}
        }

        if let Some(old) = self.unbind(vregs, vreg) {
            self.set_state(old, RegState::Unlatched);
        }
        self.bind(vregs, vreg, target);
        self.bookkeep(vregs, vreg, bookkeeping);
    }

    /// Consume one future use of `vreg`; release its register at zero.
    pub(crate) fn bookkeep(
        &mut self,
        vregs: &mut VirtRegs,
        vreg: VirtReg,
        bookkeeping: Bookkeeping,
    ) {
        if bookkeeping.is_enabled() && vregs.consume_use(vreg) == 0 {
            self.unbind(vregs, vreg);
        }
    }

    fn restrict(&self, vregs: &VirtRegs, vreg: VirtReg, mask: RegMask) -> RegMask {
        let mut mask = mask & vregs.kind(vreg).bank_mask();
        if vregs.avoids_gpr0(vreg) {
            mask &= !RealReg::gpr(0).bit();
        }
        mask
    }

    fn spill_victim(&mut self, vregs: &mut VirtRegs, mask: RegMask) -> RealReg {
        let victim = mask_units(mask)
            .find(|r| self.state(*r) == RegState::Assigned)
            .unwrap_or_else(|| panic!("no assignable register in {:#x}", mask));
        let owner = self.assigned_vreg(victim).expect("assigned without vreg");
        self.unbind(vregs, owner);
        vregs.data_mut(owner).spilled = true;
        debug!("spilling {} to free {}", owner, victim);
        victim
    }

    fn spill_victim_pair(&mut self, vregs: &mut VirtRegs, mask: RegMask) -> RealReg {
        let even = mask_units(mask)
            .filter(|r| r.is_even() && mask & r.odd_sibling().bit() != 0)
            .find(|r| {
                let ok = |s| s == RegState::Assigned || s == RegState::Free || s == RegState::Unlatched;
                ok(self.state(*r)) && ok(self.state(r.odd_sibling()))
            })
            .unwrap_or_else(|| panic!("no assignable register couple in {:#x}", mask));
        for reg in &[even, even.odd_sibling()] {
            if let Some(owner) = self.assigned_vreg(*reg) {
                self.unbind(vregs, owner);
                vregs.data_mut(owner).spilled = true;
                debug!("spilling {} to free pair member {}", owner, reg);
            }
        }
        even
    }

    /// Bit vector of Free units.
    pub fn free_mask(&self) -> RegMask {
        self.collect_mask(|s| s == RegState::Free)
    }

    /// Bit vector of units holding live values (Assigned or Blocked).
    pub fn live_mask(&self) -> RegMask {
        self.collect_mask(|s| s == RegState::Assigned || s == RegState::Blocked)
    }

    fn collect_mask(&self, pred: impl Fn(RegState) -> bool) -> RegMask {
        let mut mask = 0;
        for unit in 0..NUM_UNITS {
            if pred(self.regs[unit].state) {
                mask |= 1 << unit;
            }
        }
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::RegKind;

    fn setup() -> (Machine, VirtRegs) {
        (Machine::new(), VirtRegs::new())
    }

    fn used(vregs: &mut VirtRegs, kind: RegKind, uses: u32) -> VirtReg {
        let v = vregs.allocate(kind);
        for _ in 0..uses {
            vregs.record_use(v);
        }
        v
    }

    #[test]
    fn bind_unbind_agree() {
        let (mut machine, mut vregs) = setup();
        let v = used(&mut vregs, RegKind::Gpr, 2);
        machine.bind(&mut vregs, v, RealReg::gpr(5));
        assert_eq!(vregs.assigned(v), Some(RealReg::gpr(5)));
        assert_eq!(machine.assigned_vreg(RealReg::gpr(5)), Some(v));
        assert_eq!(machine.state(RealReg::gpr(5)), RegState::Assigned);

        machine.unbind(&mut vregs, v);
        assert_eq!(vregs.assigned(v), None);
        assert_eq!(machine.assigned_vreg(RealReg::gpr(5)), None);
        assert_eq!(machine.state(RealReg::gpr(5)), RegState::Free);
    }

    #[test]
    fn existing_binding_is_reused() {
        let (mut machine, mut vregs) = setup();
        let v = used(&mut vregs, RegKind::Gpr, 3);
        machine.bind(&mut vregs, v, RealReg::gpr(9));
        let r = machine.assign_best_register(&mut vregs, v, Bookkeeping::Enabled, !0);
        assert_eq!(r, RealReg::gpr(9));
        assert_eq!(vregs.future_uses(v), 2);
    }

    #[test]
    fn release_at_last_use() {
        let (mut machine, mut vregs) = setup();
        let v = used(&mut vregs, RegKind::Gpr, 1);
        let r = machine.assign_best_register(&mut vregs, v, Bookkeeping::Enabled, !0);
        // One use total: consumed here, so the register comes straight back.
        assert_eq!(machine.state(r), RegState::Free);
        assert_eq!(vregs.assigned(v), None);
    }

    #[test]
    fn blocked_registers_are_skipped() {
        let (mut machine, mut vregs) = setup();
        machine.block(RealReg::gpr(0));
        machine.block(RealReg::gpr(1));
        let v = used(&mut vregs, RegKind::Gpr, 2);
        let r = machine.assign_best_register(&mut vregs, v, Bookkeeping::Enabled, !0);
        assert_eq!(r, RealReg::gpr(2));
        machine.unblock(RealReg::gpr(0));
        assert_eq!(machine.state(RealReg::gpr(0)), RegState::Free);
    }

    #[test]
    fn pair_occupies_even_odd_couple() {
        let (mut machine, mut vregs) = setup();
        // Occupy %r0 so the first free couple is %r2/%r3... except %r1 is
        // free, making %r0/%r1 illegal but %r2/%r3 the first whole couple.
        let filler = used(&mut vregs, RegKind::Gpr, 2);
        machine.bind(&mut vregs, filler, RealReg::gpr(0));

        let shell = vregs.allocate_pair(RegKind::Gpr);
        let halves = vregs.pair(shell).unwrap();
        vregs.record_use(shell);
        vregs.record_use(halves.high);
        vregs.record_use(halves.low);

        let (even, odd) = machine.assign_best_register_pair(&mut vregs, shell, Bookkeeping::Disabled);
        assert_eq!(even, RealReg::gpr(2));
        assert_eq!(odd, RealReg::gpr(3));
        assert_eq!(vregs.assigned(halves.high), Some(even));
        assert_eq!(vregs.assigned(halves.low), Some(odd));
    }

    #[test]
    fn coerce_evicts_occupant() {
        let (mut machine, mut vregs) = setup();
        let occupant = used(&mut vregs, RegKind::Gpr, 2);
        machine.bind(&mut vregs, occupant, RealReg::gpr(2));
        let v = used(&mut vregs, RegKind::Gpr, 2);
        machine.coerce(&mut vregs, v, RealReg::gpr(2), Bookkeeping::Enabled);
        assert_eq!(vregs.assigned(v), Some(RealReg::gpr(2)));
        // The occupant was relocated, not lost.
        let home = vregs.assigned(occupant).unwrap();
        assert_ne!(home, RealReg::gpr(2));
        assert_eq!(machine.assigned_vreg(home), Some(occupant));
    }

    #[test]
    fn coerce_moves_prior_home_to_unlatched() {
        let (mut machine, mut vregs) = setup();
        let v = used(&mut vregs, RegKind::Gpr, 2);
        machine.bind(&mut vregs, v, RealReg::gpr(7));
        machine.coerce(&mut vregs, v, RealReg::gpr(2), Bookkeeping::Enabled);
        assert_eq!(machine.state(RealReg::gpr(7)), RegState::Unlatched);
        assert_eq!(vregs.assigned(v), Some(RealReg::gpr(2)));
    }

    #[test]
    fn spill_when_mask_exhausted() {
        let (mut machine, mut vregs) = setup();
        let a = used(&mut vregs, RegKind::Gpr, 2);
        let b = used(&mut vregs, RegKind::Gpr, 2);
        machine.bind(&mut vregs, a, RealReg::gpr(4));
        let mask = RealReg::gpr(4).bit();
        let r = machine.assign_best_register(&mut vregs, b, Bookkeeping::Enabled, mask);
        assert_eq!(r, RealReg::gpr(4));
        assert!(vregs.is_spilled(a));
        assert_eq!(vregs.assigned(a), None);
    }
}
