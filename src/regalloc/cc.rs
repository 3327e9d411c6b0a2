//! Condition-code liveness tracking.
//!
//! The architecture has a single condition-code resource. The tracker
//! records which instruction last set it and, when the opcode's effect is
//! precisely classifiable, which facts the value encodes (overflow, zero,
//! sign, carry, comparison). Later passes (redundant compare elimination)
//! consume this to prove a compare's result is already available.
//!
//! "Last producer" is only meaningful in forward program order, so the
//! transitions below run while lowering appends instructions; the backward
//! register assignment pass never touches this state. Target-register writes
//! that clobber a value the producer's result depends on demote the producer
//! as they are recorded (see `Context::use_target_register`).

use crate::context::Context;
use crate::inst::Inst;

/// Which condition-code liveness model to apply across structural
/// boundaries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CcModel {
    /// Condition-code state resets at every label and call.
    Simple,
    /// State survives labels inside internal single-entry/single-exit
    /// control-flow regions, verified by a region scan; calls still reset.
    Extended,
}

/// Tracker state: the recorded producer and its classified effect.
pub struct CcTracker {
    inst: Option<Inst>,
    has_info: bool,
    overflow: bool,
    zero: bool,
    sign: bool,
    carry: bool,
    compare: bool,
}

impl CcTracker {
    /// A tracker with no producer on record.
    pub fn new() -> Self {
        Self {
            inst: None,
            has_info: false,
            overflow: false,
            zero: false,
            sign: false,
            carry: false,
            compare: false,
        }
    }

    /// The instruction that last set the condition code, if known.
    pub fn producer(&self) -> Option<Inst> {
        self.inst
    }

    /// Is the recorded effect precisely classified? `false` means a producer
    /// may be on record but its effect must be treated as unknown.
    pub fn has_info(&self) -> bool {
        self.has_info
    }

    /// The value reflects signed overflow.
    pub fn overflow(&self) -> bool {
        self.has_info && self.overflow
    }

    /// The value reflects a zero result.
    pub fn zero(&self) -> bool {
        self.has_info && self.zero
    }

    /// The value reflects the result sign.
    pub fn sign(&self) -> bool {
        self.has_info && self.sign
    }

    /// The value reflects a carry/borrow.
    pub fn carry(&self) -> bool {
        self.has_info && self.carry
    }

    /// The value is a comparison outcome.
    pub fn compare(&self) -> bool {
        self.has_info && self.compare
    }

    fn clear(&mut self) {
        self.inst = None;
        self.has_info = false;
    }
}

impl Context {
    /// Run the tracker transitions for a freshly lowered instruction. Must
    /// be called after the instruction's operands are recorded, so reads are
    /// accounted before the instruction's own set takes effect.
    pub fn update_cc_tracking(&mut self, inst: Inst) {
        self.read_cc_info(inst);

        let opcode = self.insts[inst].opcode;
        let clear = match self.config.cc_model {
            CcModel::Simple => opcode.is_label() || opcode.is_call() || self.insts[inst].starts_icf,
            CcModel::Extended => {
                opcode.is_call()
                    || (opcode.is_label() && {
                        // State survives the label only when every branch of
                        // the region ending here stays inside it.
                        match self.insts[inst].prev {
                            Some(prev) => !self.is_internal_region_closed(prev),
                            None => true,
                        }
                    })
            }
        };
        if clear {
            self.clear_cc_info();
        } else {
            self.set_cc_info(inst);
        }
    }

    /// This instruction consumes the condition code: mark the recorded
    /// producer's effect as known-used.
    pub fn read_cc_info(&mut self, inst: Inst) {
        if !self.insts[inst].opcode.reads_cc() {
            return;
        }
        if let Some(producer) = self.cc.inst {
            self.insts[producer].cc_use_known = true;
            self.insts[producer].cc_used = true;
        }
    }

    /// This instruction defines the condition code: record it as the new
    /// producer, with structured detail when the opcode's effect is
    /// precisely classifiable and the conservative "unknown" marking when it
    /// is not.
    pub fn set_cc_info(&mut self, inst: Inst) {
        let opcode = self.insts[inst].opcode;
        if !opcode.sets_cc() {
            return;
        }

        if let Some(old) = self.cc.inst {
            // The new producer overrides the old value, so the old
            // instruction's CC usage is now fully known.
            self.insts[old].cc_use_known = true;
        }

        let classified = opcode.sets_overflow_flag()
            || opcode.sets_zero_flag()
            || opcode.sets_sign_flag()
            || opcode.sets_carry_flag()
            || opcode.sets_compare_flag();
        if classified {
            self.cc.has_info = true;
            self.cc.overflow = opcode.sets_overflow_flag();
            self.cc.zero = opcode.sets_zero_flag();
            self.cc.sign = opcode.sets_sign_flag();
            self.cc.carry = opcode.sets_carry_flag();
            self.cc.compare = opcode.sets_compare_flag();
        } else {
            // Generic CC effect: record no detail rather than guess.
            self.cc.has_info = false;
        }
        self.cc.inst = Some(inst);
    }

    /// Forget the recorded producer. Called at structural boundaries where
    /// condition-code continuity can't be assumed.
    pub fn clear_cc_info(&mut self) {
        self.cc.clear();
    }

    /// The tracker itself, for consumers that classify the recorded effect.
    pub fn cc_tracker(&self) -> &CcTracker {
        &self.cc
    }

    /// Was this instruction's condition-code effect consumed by a later
    /// instruction?
    pub fn is_cc_used(&self, inst: Inst) -> bool {
        self.insts[inst].cc_used
    }

    /// Is this instruction's condition-code usage fully known (consumed or
    /// provably overwritten)?
    pub fn is_cc_use_known(&self, inst: Inst) -> bool {
        self.insts[inst].cc_use_known
    }

    /// Scan the internal control-flow region ending at `region_end` and
    /// confirm it is single-entry/single-exit: every branch inside the
    /// region targets a label defined inside it.
    ///
    /// The region extends backwards to the nearest label or explicit
    /// region-start marker.
    pub fn is_internal_region_closed(&self, region_end: Inst) -> bool {
        // First walk: find the region start and collect its labels.
        let mut labels = Vec::new();
        let mut region_start = None;
        let mut cur = Some(region_end);
        while let Some(inst) = cur {
            let data = &self.insts[inst];
            if data.opcode.is_label() {
                if let Some(label) = data.label {
                    labels.push(label);
                }
                region_start = data.prev;
                break;
            }
            if data.starts_icf {
                region_start = data.prev;
                break;
            }
            cur = data.prev;
        }

        // Second walk: every branch in the region must target a collected
        // label.
        let mut cur = Some(region_end);
        while cur != region_start {
            let inst = match cur {
                Some(inst) => inst,
                None => break,
            };
            let data = &self.insts[inst];
            if data.opcode.is_branch() {
                match data.label {
                    Some(target) if labels.contains(&target) => {}
                    // A branch to an outside label (or a register branch
                    // with no label at all) leaves the region.
                    _ => return false,
                }
            }
            cur = data.prev;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inst::Reg;
    use crate::isa::{Opcode, RegKind};
    use crate::{Config, Context};

    fn ctx(model: CcModel) -> Context {
        Context::new(Config { cc_model: model })
    }

    #[test]
    fn compare_records_structured_detail() {
        let mut ctx = ctx(CcModel::Simple);
        let a = ctx.vregs_mut().allocate(RegKind::Gpr);
        let b = ctx.vregs_mut().allocate(RegKind::Gpr);
        let cmp = ctx.append(Opcode::Cr);
        ctx.use_target_register(cmp, Reg::Virt(a));
        ctx.use_source_register(cmp, Reg::Virt(b));
        ctx.update_cc_tracking(cmp);

        assert_eq!(ctx.cc_tracker().producer(), Some(cmp));
        assert!(ctx.cc_tracker().has_info());
        assert!(ctx.cc_tracker().compare());
        assert!(!ctx.cc_tracker().carry());
    }

    #[test]
    fn reader_marks_producer_used() {
        let mut ctx = ctx(CcModel::Simple);
        let a = ctx.vregs_mut().allocate(RegKind::Gpr);
        let b = ctx.vregs_mut().allocate(RegKind::Gpr);
        let cmp = ctx.append(Opcode::Cr);
        ctx.use_target_register(cmp, Reg::Virt(a));
        ctx.use_source_register(cmp, Reg::Virt(b));
        ctx.update_cc_tracking(cmp);

        let br = ctx.append(Opcode::Brc);
        ctx.update_cc_tracking(br);
        assert!(ctx.is_cc_used(cmp));
        assert!(ctx.is_cc_use_known(cmp));
    }

    #[test]
    fn target_write_demotes_producer() {
        let mut ctx = ctx(CcModel::Simple);
        let r1 = ctx.vregs_mut().allocate(RegKind::Gpr);
        let r2 = ctx.vregs_mut().allocate(RegKind::Gpr);
        let r3 = ctx.vregs_mut().allocate(RegKind::Gpr);

        // compare r1, r2
        let cmp = ctx.append(Opcode::Cr);
        ctx.use_target_register(cmp, Reg::Virt(r1));
        ctx.use_source_register(cmp, Reg::Virt(r2));
        ctx.update_cc_tracking(cmp);
        assert_eq!(ctx.cc_tracker().producer(), Some(cmp));

        // add r1, r3 overwrites a register the compare's value depends on.
        let add = ctx.append(Opcode::Ar);
        ctx.use_target_register(add, Reg::Virt(r1));
        ctx.use_source_register(add, Reg::Virt(r3));
        // The compare's CC is no longer cleanly available.
        assert!(ctx.is_cc_use_known(cmp));
        assert_eq!(ctx.cc_tracker().producer(), None);

        ctx.update_cc_tracking(add);
        assert_eq!(ctx.cc_tracker().producer(), Some(add));
    }

    #[test]
    fn simple_model_resets_at_label_and_call() {
        let mut ctx = ctx(CcModel::Simple);
        let a = ctx.vregs_mut().allocate(RegKind::Gpr);
        let b = ctx.vregs_mut().allocate(RegKind::Gpr);
        let add = ctx.append(Opcode::Ar);
        ctx.use_target_register(add, Reg::Virt(a));
        ctx.use_source_register(add, Reg::Virt(b));
        ctx.update_cc_tracking(add);
        assert!(ctx.cc_tracker().producer().is_some());

        let label = ctx.create_label();
        let label_inst = ctx.append(Opcode::Label);
        ctx.set_label(label_inst, label);
        ctx.update_cc_tracking(label_inst);
        assert_eq!(ctx.cc_tracker().producer(), None);
    }

    #[test]
    fn extended_model_keeps_state_across_closed_region() {
        let mut ctx = ctx(CcModel::Extended);
        let a = ctx.vregs_mut().allocate(RegKind::Gpr);
        let b = ctx.vregs_mut().allocate(RegKind::Gpr);

        // A little internal loop: top label, an add, a branch back to top,
        // then the region-ending label.
        let top = ctx.create_label();
        let top_inst = ctx.append(Opcode::Label);
        ctx.set_label(top_inst, top);
        ctx.update_cc_tracking(top_inst);

        let add = ctx.append(Opcode::Ar);
        ctx.use_target_register(add, Reg::Virt(a));
        ctx.use_source_register(add, Reg::Virt(b));
        ctx.update_cc_tracking(add);

        let back = ctx.append(Opcode::Brc);
        ctx.set_label(back, top);
        ctx.update_cc_tracking(back);

        let done = ctx.create_label();
        let done_inst = ctx.append(Opcode::Label);
        ctx.set_label(done_inst, done);
        ctx.update_cc_tracking(done_inst);
        // Every branch stays inside, so the producer survives the label.
        assert_eq!(ctx.cc_tracker().producer(), Some(add));
    }

    #[test]
    fn extended_model_clears_when_region_escapes() {
        let mut ctx = ctx(CcModel::Extended);
        let a = ctx.vregs_mut().allocate(RegKind::Gpr);
        let b = ctx.vregs_mut().allocate(RegKind::Gpr);

        let outside = ctx.create_label();
        let top = ctx.create_label();
        let top_inst = ctx.append(Opcode::Label);
        ctx.set_label(top_inst, top);
        ctx.update_cc_tracking(top_inst);

        let add = ctx.append(Opcode::Ar);
        ctx.use_target_register(add, Reg::Virt(a));
        ctx.use_source_register(add, Reg::Virt(b));
        ctx.update_cc_tracking(add);

        let escape = ctx.append(Opcode::Brc);
        ctx.set_label(escape, outside);
        ctx.update_cc_tracking(escape);

        let done = ctx.create_label();
        let done_inst = ctx.append(Opcode::Label);
        ctx.set_label(done_inst, done);
        ctx.update_cc_tracking(done_inst);
        assert_eq!(ctx.cc_tracker().producer(), None);
    }
}
