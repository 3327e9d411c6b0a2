//! Compilation unit context.
//!
//! One `Context` owns everything the register assignment subsystem mutates
//! for a single compilation unit: the instruction arena, the virtual register
//! pool, the dependency condition sets, the label table, the out-of-line
//! section registry, the machine register file, and the condition-code
//! tracker. Compilation units share nothing, so independent units can be
//! processed on independent threads without locking.

use crate::inst::{Inst, InstData, Label, LabelData};
use crate::isa::{CondMask, Opcode, RegMask};
use crate::regalloc::cc::CcTracker;
use crate::regalloc::deps::{Dep, DepConds, DepSet};
use crate::regalloc::machine::Machine;
use crate::regalloc::virtregs::VirtRegs;
use cranelift_entity::PrimaryMap;

pub use crate::regalloc::cc::CcModel;

/// Per-compilation-unit configuration.
///
/// These are explicit values owned by the unit, not process-wide switches.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Which condition-code liveness model to use.
    pub cc_model: CcModel,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cc_model: CcModel::Simple,
        }
    }
}

/// A deferred instruction stream reached through a cold label.
pub(crate) struct OolSection {
    pub(crate) label: Label,
    /// Instructions in program order.
    pub(crate) insts: Vec<Inst>,
    /// Nested assignment happens at most once, at the first branch into the
    /// section encountered by the backward pass.
    pub(crate) assigned: bool,
}

/// All state of one compilation unit.
pub struct Context {
    pub(crate) config: Config,
    pub(crate) insts: PrimaryMap<Inst, InstData>,
    pub(crate) vregs: VirtRegs,
    pub(crate) machine: Machine,
    pub(crate) conds: PrimaryMap<DepSet, DepConds>,
    pub(crate) labels: PrimaryMap<Label, LabelData>,
    pub(crate) cc: CcTracker,
    pub(crate) ool: Vec<OolSection>,
    /// Last instruction appended to the main stream.
    pub(crate) last: Option<Inst>,
}

impl Context {
    /// Create an empty context.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            insts: PrimaryMap::new(),
            vregs: VirtRegs::new(),
            machine: Machine::new(),
            conds: PrimaryMap::new(),
            labels: PrimaryMap::new(),
            cc: CcTracker::new(),
            ool: Vec::new(),
            last: None,
        }
    }

    /// The virtual register pool.
    pub fn vregs(&self) -> &VirtRegs {
        &self.vregs
    }

    /// Mutable access to the virtual register pool (lowering only).
    pub fn vregs_mut(&mut self) -> &mut VirtRegs {
        &mut self.vregs
    }

    /// The machine register file.
    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// Mutable access to the machine register file.
    pub fn machine_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }

    /// Append an instruction to the main stream.
    pub fn append(&mut self, opcode: Opcode) -> Inst {
        let prev = self.last.take();
        let inst = self.insts.push(InstData::new(opcode, prev));
        self.last = Some(inst);
        inst
    }

    /// Create an instruction outside the main stream (out-of-line bodies,
    /// execute targets). Its previous link starts empty.
    pub fn append_detached(&mut self, opcode: Opcode) -> Inst {
        self.insts.push(InstData::new(opcode, None))
    }

    /// Last instruction of the main stream.
    pub fn last_inst(&self) -> Option<Inst> {
        self.last
    }

    /// The instruction preceding `inst` in its stream.
    pub fn prev(&self, inst: Inst) -> Option<Inst> {
        self.insts[inst].prev
    }

    /// The instruction's opcode.
    pub fn opcode(&self, inst: Inst) -> Opcode {
        self.insts[inst].opcode
    }

    /// Create a fresh label.
    pub fn create_label(&mut self) -> Label {
        self.labels.push(LabelData { cold: false })
    }

    /// Mark a label as the start of a cold (out-of-line) instruction stream.
    pub fn mark_label_cold(&mut self, label: Label) {
        self.labels[label].cold = true;
    }

    /// Does this label start a cold instruction stream?
    pub fn is_label_cold(&self, label: Label) -> bool {
        self.labels[label].cold
    }

    /// Attach a label to an instruction: the defined label for `Label`
    /// instructions, the branch target otherwise.
    pub fn set_label(&mut self, inst: Inst, label: Label) {
        self.insts[inst].label = Some(label);
    }

    /// The instruction's label, if any.
    pub fn label(&self, inst: Inst) -> Option<Label> {
        self.insts[inst].label
    }

    /// Set the branch condition mask.
    pub fn set_cond_mask(&mut self, inst: Inst, mask: CondMask) {
        self.insts[inst].mask = mask;
    }

    /// Mark the start of an internal control-flow region.
    pub fn set_starts_icf(&mut self, inst: Inst) {
        self.insts[inst].starts_icf = true;
    }

    /// Register `body` as the out-of-line instruction the redirect `inst`
    /// stands in for.
    pub fn set_redirect(&mut self, inst: Inst, body: Inst) {
        debug_assert!(
            self.insts[inst].opcode == Opcode::Ex || self.insts[inst].opcode == Opcode::Exrl,
            "only execute-style opcodes can redirect"
        );
        self.insts[inst].redirect = Some(body);
    }

    /// The redirect target of `inst`, if it is an out-of-line alias.
    pub fn redirect(&self, inst: Inst) -> Option<Inst> {
        self.insts[inst].redirect
    }

    /// Register a deferred instruction stream for `label`.
    pub fn define_ool_section(&mut self, label: Label, insts: Vec<Inst>) {
        self.mark_label_cold(label);
        self.ool.push(OolSection {
            label,
            insts,
            assigned: false,
        });
    }

    /// Free real registers observed right after this instruction was
    /// assigned, for later long-displacement resolution.
    pub fn free_regs(&self, inst: Inst) -> RegMask {
        self.insts[inst].free_regs
    }

    /// Create a dependency condition set with the given group capacities.
    pub fn create_conds(&mut self, num_pre: usize, num_post: usize) -> DepSet {
        self.conds.push(DepConds::new(num_pre, num_post))
    }

    /// Read access to a condition set.
    pub fn conds(&self, set: DepSet) -> &DepConds {
        &self.conds[set]
    }

    /// Append a pre-condition to an unattached set.
    pub fn add_pre_dep(&mut self, set: DepSet, dep: Dep) {
        self.conds[set].add_pre(dep);
    }

    /// Append a post-condition to an unattached set.
    pub fn add_post_dep(&mut self, set: DepSet, dep: Dep) {
        self.conds[set].add_post(dep);
    }

    /// The condition set attached to `inst`, if any.
    pub fn dependency_conditions(&self, inst: Inst) -> Option<DepSet> {
        self.insts[inst].conds
    }

    /// Attach `cond` to `inst` with use-count bookkeeping.
    ///
    /// If the instruction already carries conditions, a new merged set is
    /// built (the existing set may be shared with other instructions and is
    /// never mutated). Bookkeeping covers only the newly added region, so
    /// entries counted by an earlier attach are not counted twice.
    ///
    /// Passing `None` is a lowering bug and aborts the compilation.
    pub fn set_dependency_conditions(&mut self, inst: Inst, cond: Option<DepSet>) -> DepSet {
        let cond = match cond {
            Some(cond) => cond,
            None => panic!("null register dependency conditions on {}", inst),
        };

        let mut old_pre = 0;
        let mut old_post = 0;
        let cond = match self.insts[inst].conds {
            Some(existing) => {
                old_pre = self.conds[existing].pre_cursor();
                old_post = self.conds[existing].post_cursor();
                let merged = DepConds::merged(&self.conds[existing], &self.conds[cond]);
                self.conds.push(merged)
            }
            None => cond,
        };

        self.bookkeep_register_uses(cond, old_pre, old_post);
        self.conds[cond].set_used();
        if let Some(pre) = self.conds[cond].pre_mut() {
            pre.inc_num_uses();
        }
        if let Some(post) = self.conds[cond].post_mut() {
            post.inc_num_uses();
        }

        self.insts[inst].conds = Some(cond);
        cond
    }

    /// Attach `cond` to `inst` without use-count bookkeeping.
    ///
    /// Used when an instruction is re-targeted (out-of-line dispatch) and
    /// the counts were already taken by the instruction that originally
    /// owned the conditions.
    pub fn set_dependency_conditions_no_bookkeeping(&mut self, inst: Inst, cond: DepSet) -> DepSet {
        let cond = match self.insts[inst].conds {
            Some(existing) => {
                let merged = DepConds::merged(&self.conds[existing], &self.conds[cond]);
                self.conds.push(merged)
            }
            None => cond,
        };
        self.insts[inst].conds = Some(cond);
        cond
    }

    /// Count register uses over the region of `cond` past the given old add
    /// cursors.
    fn bookkeep_register_uses(&mut self, cond: DepSet, old_pre: usize, old_post: usize) {
        let mut fresh: Vec<crate::regalloc::virtregs::VirtReg> = Vec::new();
        if let Some(pre) = self.conds[cond].pre() {
            fresh.extend(pre.deps()[old_pre..].iter().map(|d| d.vreg));
        }
        if let Some(post) = self.conds[cond].post() {
            fresh.extend(post.deps()[old_post..].iter().map(|d| d.vreg));
        }
        for vreg in fresh {
            // Dependency-only uses don't reset placeholder status.
            self.record_register_use(crate::inst::Reg::Virt(vreg), true);
        }
    }
}
