//! Machine instructions and operand bookkeeping.
//!
//! An instruction owns its register and memory operand arrays, split into
//! source and target positions the way the encodings name them. Target
//! position is an encoding fact, not a dataflow fact: a store's target-
//! position register is semantically a source, and the use/def derivation
//! below reclassifies such operands when building the canonical "registers
//! read" and "registers written" lists.
//!
//! Operand arrays hold virtual registers after lowering; register assignment
//! replaces them with real registers in place. An instruction can also be a
//! thin redirect for an out-of-line body (execute-style dispatch), in which
//! case its apparent register footprint includes the body's.

use crate::context::Context;
use crate::isa::registers::NUM_GPRS;
use crate::isa::{CondMask, Opcode, RealReg, RegMask};
use crate::regalloc::virtregs::VirtReg;
use cranelift_entity::entity_impl;
use smallvec::SmallVec;

/// An opaque reference to an instruction.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Inst(u32);
entity_impl!(Inst, "inst");

/// An opaque reference to a label.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);
entity_impl!(Label, "label");

/// Per-label facts.
pub(crate) struct LabelData {
    /// Starts a cold out-of-line instruction stream.
    pub(crate) cold: bool,
}

/// Maximum register operands per position array. The assignment driver's
/// scratch arrays are sized to this; exceeding it is a lowering bug.
pub const MAX_REG_OPERANDS: usize = 4;

/// Maximum memory operands per position array.
pub const MAX_MEM_OPERANDS: usize = 2;

/// A register operand: virtual until assignment replaces it with the real
/// register it landed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reg {
    /// Not yet bound to hardware.
    Virt(VirtReg),
    /// A concrete architectural register.
    Real(RealReg),
}

impl Reg {
    /// The virtual register, if still unbound.
    pub fn virt(self) -> Option<VirtReg> {
        match self {
            Reg::Virt(v) => Some(v),
            Reg::Real(_) => None,
        }
    }

    /// The real register, if bound.
    pub fn real(self) -> Option<RealReg> {
        match self {
            Reg::Real(r) => Some(r),
            Reg::Virt(_) => None,
        }
    }
}

/// A memory operand: base/index registers inside an addressing expression
/// plus a displacement.
#[derive(Clone, Copy, Debug)]
pub struct MemArg {
    /// Base address register.
    pub base: Option<Reg>,
    /// Index register.
    pub index: Option<Reg>,
    /// Byte displacement.
    pub disp: i32,
}

impl MemArg {
    /// Base plus displacement.
    pub fn base_disp(base: Reg, disp: i32) -> Self {
        Self {
            base: Some(base),
            index: None,
            disp,
        }
    }

    /// Base plus index plus displacement.
    pub fn base_index_disp(base: Reg, index: Reg, disp: i32) -> Self {
        Self {
            base: Some(base),
            index: Some(index),
            disp,
        }
    }

    /// The registers this operand mentions.
    pub fn regs(&self) -> impl Iterator<Item = Reg> {
        self.base.into_iter().chain(self.index)
    }
}

/// Canonical derived register lists: what the instruction reads and what it
/// writes, after position reclassification and range expansion.
pub(crate) struct UseDefSets {
    pub(crate) uses: Vec<Reg>,
    pub(crate) defs: Vec<Reg>,
    /// Bit per `uses` index: the use came from a memory operand.
    pub(crate) use_from_mem: u32,
}

/// Per-instruction state.
pub(crate) struct InstData {
    pub(crate) opcode: Opcode,
    pub(crate) prev: Option<Inst>,
    pub(crate) srcs: SmallVec<[Reg; MAX_REG_OPERANDS]>,
    pub(crate) tgts: SmallVec<[Reg; MAX_REG_OPERANDS]>,
    pub(crate) src_mems: SmallVec<[MemArg; MAX_MEM_OPERANDS]>,
    pub(crate) tgt_mems: SmallVec<[MemArg; MAX_MEM_OPERANDS]>,
    pub(crate) conds: Option<crate::regalloc::deps::DepSet>,
    pub(crate) redirect: Option<Inst>,
    pub(crate) label: Option<Label>,
    pub(crate) mask: CondMask,
    pub(crate) starts_icf: bool,
    pub(crate) cc_use_known: bool,
    pub(crate) cc_used: bool,
    pub(crate) use_defs: Option<UseDefSets>,
    pub(crate) free_regs: RegMask,
    pub(crate) spill_regs: [Option<RealReg>; 2],
}

impl InstData {
    pub(crate) fn new(opcode: Opcode, prev: Option<Inst>) -> Self {
        Self {
            opcode,
            prev,
            srcs: SmallVec::new(),
            tgts: SmallVec::new(),
            src_mems: SmallVec::new(),
            tgt_mems: SmallVec::new(),
            conds: None,
            redirect: None,
            label: None,
            mask: CondMask::new(0),
            starts_icf: false,
            cc_use_known: false,
            cc_used: false,
            use_defs: None,
            free_regs: 0,
            spill_regs: [None, None],
        }
    }
}

/// The single generic append primitive behind every operand array. Keeps
/// insertion order (operand index is externally meaningful) and aborts on
/// overflow of the declared inline capacity.
fn record_operand<A: smallvec::Array>(ops: &mut SmallVec<A>, op: A::Item, what: &str) -> usize {
    assert!(ops.len() < ops.inline_size(), "too many {} operands", what);
    ops.push(op);
    ops.len() - 1
}

impl Context {
    /// Append a source register operand. Returns its index in the source
    /// array.
    pub fn use_source_register(&mut self, inst: Inst, reg: Reg) -> usize {
        let index = record_operand(&mut self.insts[inst].srcs, reg, "source register");
        self.record_register_use(reg, false);
        self.apply_width_tags(inst, reg);
        if self.insts[inst].opcode.disallows_gpr0_operand() {
            self.disallow_gpr0(reg);
        }
        index
    }

    /// Append a target register operand. Returns its index in the target
    /// array.
    ///
    /// Writing a register the recorded condition-code producer depends on
    /// demotes that producer: its CC value can no longer be soundly
    /// re-derived, so the tracker forgets it and marks its usage unknown.
    pub fn use_target_register(&mut self, inst: Inst, reg: Reg) -> usize {
        let index = record_operand(&mut self.insts[inst].tgts, reg, "target register");

        if let Some(producer) = self.cc.producer() {
            if self.cc.has_info() && producer != inst && self.contains_register(producer, reg) {
                self.insts[producer].cc_use_known = true;
                self.clear_cc_info();
            }
        }

        self.record_register_use(reg, false);
        self.apply_width_tags(inst, reg);
        index
    }

    /// Append a source memory operand. Returns its index in the source
    /// memory array.
    pub fn use_source_mem(&mut self, inst: Inst, mem: MemArg) -> usize {
        self.record_mem_regs(&mem);
        record_operand(&mut self.insts[inst].src_mems, mem, "source memory")
    }

    /// Append a target memory operand. Returns its index in the target
    /// memory array.
    pub fn use_target_mem(&mut self, inst: Inst, mem: MemArg) -> usize {
        self.record_mem_regs(&mem);
        record_operand(&mut self.insts[inst].tgt_mems, mem, "target memory")
    }

    /// Source register operands, in recording order.
    pub fn source_registers(&self, inst: Inst) -> &[Reg] {
        &self.insts[inst].srcs
    }

    /// Target register operands, in recording order.
    pub fn target_registers(&self, inst: Inst) -> &[Reg] {
        &self.insts[inst].tgts
    }

    /// Source memory operands.
    pub fn source_mems(&self, inst: Inst) -> &[MemArg] {
        &self.insts[inst].src_mems
    }

    /// Target memory operands.
    pub fn target_mems(&self, inst: Inst) -> &[MemArg] {
        &self.insts[inst].tgt_mems
    }

    /// Record one register use: counters, placeholder reset, pair handling.
    /// Dependency-only uses pass `dummy` to leave placeholder status alone.
    pub(crate) fn record_register_use(&mut self, reg: Reg, dummy: bool) {
        let vreg = match reg {
            Reg::Virt(v) => v,
            // Real register mentions carry no use counters.
            Reg::Real(_) => return,
        };
        if let Some(halves) = self.vregs.pair(vreg) {
            assert!(
                self.vregs.sibling(halves.high).is_some()
                    && self.vregs.sibling(halves.low).is_some(),
                "register pair {} lacks sibling links",
                vreg
            );
            self.vregs.record_use(halves.high);
            self.vregs.record_use(halves.low);
            self.vregs.record_use(vreg);
        } else {
            self.vregs.record_use(vreg);
            if !dummy && self.vregs.is_placeholder(vreg) {
                self.vregs.data_mut(vreg).placeholder = false;
            }
        }
    }

    /// Propagate the 64-bit width tag for wide and widening opcodes.
    fn apply_width_tags(&mut self, inst: Inst, reg: Reg) {
        let opcode = self.insts[inst].opcode;
        if !(opcode.is_64bit() || opcode.is_32_to_64()) {
            return;
        }
        if let Reg::Virt(v) = reg {
            self.vregs.data_mut(v).is_64bit = true;
            if let Some(halves) = self.vregs.pair(v) {
                self.vregs.data_mut(halves.high).is_64bit = true;
                self.vregs.data_mut(halves.low).is_64bit = true;
            }
        }
    }

    fn disallow_gpr0(&mut self, reg: Reg) {
        if let Reg::Virt(v) = reg {
            self.vregs.data_mut(v).avoid_gpr0 = true;
            if let Some(halves) = self.vregs.pair(v) {
                self.vregs.data_mut(halves.high).avoid_gpr0 = true;
                self.vregs.data_mut(halves.low).avoid_gpr0 = true;
            }
        }
    }

    fn record_mem_regs(&mut self, mem: &MemArg) {
        for reg in mem.regs() {
            self.record_register_use(reg, false);
            // `%r0` in a base or index position encodes "no register".
            self.disallow_gpr0(reg);
        }
    }

    /// Does operand `op` mention `query`? Pair shells match their members,
    /// and a virtual operand matches the real register it is assigned to
    /// (and vice versa).
    pub fn operand_uses(&self, op: Reg, query: Reg) -> bool {
        if op == query {
            return true;
        }
        match (op, query) {
            (Reg::Virt(v), q) => {
                if let Some(halves) = self.vregs.pair(v) {
                    return self.operand_uses(Reg::Virt(halves.high), q)
                        || self.operand_uses(Reg::Virt(halves.low), q);
                }
                match q {
                    Reg::Real(r) => self.vregs.assigned(v) == Some(r),
                    Reg::Virt(qv) => match self.vregs.pair(qv) {
                        Some(halves) => v == halves.high || v == halves.low,
                        None => false,
                    },
                }
            }
            (Reg::Real(r), Reg::Virt(qv)) => {
                if let Some(halves) = self.vregs.pair(qv) {
                    self.operand_uses(op, Reg::Virt(halves.high))
                        || self.operand_uses(op, Reg::Virt(halves.low))
                } else {
                    self.vregs.assigned(qv) == Some(r)
                }
            }
            (Reg::Real(_), Reg::Real(_)) => false,
        }
    }

    /// Does `query` match any of the given operands?
    pub fn matches_any_register(&self, query: Reg, ops: &[Reg]) -> bool {
        ops.iter().any(|op| self.operand_uses(*op, query))
    }

    /// Does this instruction implicitly write the queried real register?
    pub fn matches_target_register(&self, inst: Inst, query: Reg) -> bool {
        let real = match query {
            Reg::Real(r) => r,
            Reg::Virt(_) => return false,
        };
        let opcode = self.insts[inst].opcode;
        (opcode.implicitly_sets_gpr1() && real == RealReg::gpr(1))
            || (opcode.implicitly_sets_gpr2() && real == RealReg::gpr(2))
    }

    /// Is `vreg` referenced (read) by this instruction's dependency
    /// conditions?
    pub fn refs_register(&self, inst: Inst, vreg: VirtReg) -> bool {
        match self.insts[inst].conds {
            Some(set) => self.conds[set].refs_vreg(vreg),
            None => false,
        }
    }

    /// Does any target-position register operand mention `query`?
    pub fn defs_register(&self, inst: Inst, query: Reg) -> bool {
        self.matches_any_register(query, &self.insts[inst].tgts)
    }

    /// Is `query` written by this instruction, per the derived def list and
    /// the implicit register targets?
    pub fn is_def_register(&self, inst: Inst, query: Reg) -> bool {
        if self.matches_target_register(inst, query) {
            return true;
        }
        match &self.insts[inst].use_defs {
            Some(sets) => self.matches_any_register(query, &sets.defs),
            None => false,
        }
    }

    /// Does this instruction read `query`? Sources, memory operands, and the
    /// target positions of target-reading opcodes all count, as does the
    /// out-of-line body of a redirect.
    pub fn uses_register(&self, inst: Inst, query: Reg) -> bool {
        let data = &self.insts[inst];
        if self.matches_any_register(query, &data.srcs) {
            return true;
        }
        let opcode = data.opcode;
        if (opcode.is_store() || opcode.is_compare() || opcode.is_trap() || opcode.uses_target())
            && self.matches_any_register(query, &data.tgts)
        {
            return true;
        }
        if self.mem_operands_use(inst, query) {
            return true;
        }
        match data.redirect {
            Some(body) => self.uses_register(body, query),
            None => false,
        }
    }

    /// Like [`uses_register`](#method.uses_register), but never counts
    /// target positions.
    pub fn uses_only_register(&self, inst: Inst, query: Reg) -> bool {
        let data = &self.insts[inst];
        if self.matches_any_register(query, &data.srcs) || self.mem_operands_use(inst, query) {
            return true;
        }
        match data.redirect {
            Some(body) => self.uses_only_register(body, query),
            None => false,
        }
    }

    fn mem_operands_use(&self, inst: Inst, query: Reg) -> bool {
        let data = &self.insts[inst];
        data.src_mems
            .iter()
            .chain(data.tgt_mems.iter())
            .flat_map(|mem| mem.regs())
            .any(|reg| self.operand_uses(reg, query))
    }

    /// Comprehensive containment: does `query` appear anywhere in this
    /// instruction's operands, or in the out-of-line body it redirects to?
    pub fn contains_register(&self, inst: Inst, query: Reg) -> bool {
        let data = &self.insts[inst];
        if self.matches_any_register(query, &data.srcs)
            || self.matches_any_register(query, &data.tgts)
            || self.mem_operands_use(inst, query)
        {
            return true;
        }
        match data.redirect {
            Some(body) => self.contains_register(body, query),
            None => false,
        }
    }

    /// A semantically inert hardcoded register mention: a never-taken
    /// register branch naming `%r0`. Excluded from liveness bookkeeping so a
    /// live value in `%r0` is not spuriously freed.
    pub(crate) fn is_inert_reg_mention(&self, inst: Inst, reg: RealReg) -> bool {
        let data = &self.insts[inst];
        data.opcode == Opcode::Bcr && reg == RealReg::gpr(0) && data.mask.is_nop_mask()
    }

    /// Derive the canonical use/def register lists.
    ///
    /// Computed at most once per instruction and cached; the peephole phase
    /// calls [`reset_use_def_registers`](#method.reset_use_def_registers)
    /// first when it needs a fresh derivation after mutating operands.
    pub fn set_use_def_registers(&mut self, inst: Inst) {
        if self.insts[inst].use_defs.is_some() {
            return;
        }

        let opcode = self.insts[inst].opcode;
        let reads_target = opcode.is_store()
            || opcode.is_compare()
            || opcode.is_trap()
            || opcode.uses_target();
        let writes_target = (!opcode.is_store() && !opcode.is_compare() && !opcode.is_trap())
            || opcode.is_load();

        let mut uses: Vec<Reg> = Vec::new();
        let mut defs: Vec<Reg> = Vec::new();
        let mut use_from_mem: u32 = 0;

        let srcs = self.insts[inst].srcs.clone();
        for src in &srcs {
            match src.virt().and_then(|v| self.vregs.pair(v)) {
                Some(halves) => {
                    uses.push(Reg::Virt(halves.high));
                    uses.push(Reg::Virt(halves.low));
                }
                None => uses.push(*src),
            }
        }

        let tgts = self.insts[inst].tgts.clone();
        for tgt in &tgts {
            match tgt.virt().and_then(|v| self.vregs.pair(v)) {
                Some(halves) => {
                    if reads_target {
                        uses.push(Reg::Virt(halves.high));
                        uses.push(Reg::Virt(halves.low));
                    }
                    if (!opcode.is_store() && !opcode.sets_compare_flag()) || opcode.is_load() {
                        defs.push(Reg::Virt(halves.high));
                        defs.push(Reg::Virt(halves.low));
                    }
                }
                None => {
                    if reads_target {
                        uses.push(*tgt);
                    }
                    if writes_target {
                        defs.push(*tgt);
                    }
                }
            }
        }

        // A load or store multiple touches every register between its two
        // endpoints. Once both endpoints are real, expand the intervening
        // registers (the range wraps past %r15).
        if opcode.is_load_multiple() || opcode.is_store_multiple() {
            if let Some((first, last)) = self.multiple_range_endpoints(inst) {
                let low = first.number();
                let high = last.number();
                let mut cur = (low + 1) % NUM_GPRS;
                while cur != high {
                    let reg = Reg::Real(RealReg::gpr(cur));
                    if opcode.is_load_multiple() {
                        defs.push(reg);
                    } else {
                        uses.push(reg);
                    }
                    cur = (cur + 1) % NUM_GPRS;
                }
            }
        }

        // Implicit register side effects.
        if opcode.implicitly_sets_gpr1() {
            defs.push(Reg::Real(RealReg::gpr(1)));
        }
        if opcode.implicitly_sets_gpr2() {
            defs.push(Reg::Real(RealReg::gpr(2)));
        }
        if opcode.implicitly_uses_gpr0() {
            uses.push(Reg::Real(RealReg::gpr(0)));
        }

        // Base and index registers are always reads.
        let mems: Vec<MemArg> = self.insts[inst]
            .src_mems
            .iter()
            .chain(self.insts[inst].tgt_mems.iter())
            .cloned()
            .collect();
        for mem in &mems {
            for reg in mem.regs() {
                use_from_mem |= 1 << uses.len() as u32;
                uses.push(reg);
            }
        }

        // A pure dependency carrier defines whatever its conditions place.
        if opcode == Opcode::Depend {
            if let Some(set) = self.insts[inst].conds {
                let conds = &self.conds[set];
                for group in conds.pre().into_iter().chain(conds.post()) {
                    for dep in group.deps() {
                        if !self.vregs.is_pair(dep.vreg) {
                            defs.push(Reg::Virt(dep.vreg));
                        }
                    }
                }
            }
        }

        self.insts[inst].use_defs = Some(UseDefSets {
            uses,
            defs,
            use_from_mem,
        });
    }

    /// Endpoints of a load/store-multiple register range, once both are
    /// real: a pair shell's assigned halves, or the first two target
    /// operands.
    fn multiple_range_endpoints(&self, inst: Inst) -> Option<(RealReg, RealReg)> {
        let tgts = &self.insts[inst].tgts;
        let (first, last) = match tgts.first()?.virt().and_then(|v| self.vregs.pair(v)) {
            Some(halves) => (Reg::Virt(halves.high), Reg::Virt(halves.low)),
            None => (*tgts.get(0)?, *tgts.get(1)?),
        };
        Some((self.resolve_real(first)?, self.resolve_real(last)?))
    }

    fn resolve_real(&self, reg: Reg) -> Option<RealReg> {
        match reg {
            Reg::Real(r) => Some(r),
            Reg::Virt(v) => self.vregs.assigned(v),
        }
    }

    /// Drop the cached use/def derivation so the peephole phase can
    /// recompute it.
    pub fn reset_use_def_registers(&mut self, inst: Inst) {
        self.insts[inst].use_defs = None;
    }

    /// The derived "registers read" list (empty until derived).
    pub fn use_regs(&self, inst: Inst) -> &[Reg] {
        match &self.insts[inst].use_defs {
            Some(sets) => &sets.uses,
            None => &[],
        }
    }

    /// The derived "registers written" list (empty until derived).
    pub fn def_regs(&self, inst: Inst) -> &[Reg] {
        match &self.insts[inst].use_defs {
            Some(sets) => &sets.defs,
            None => &[],
        }
    }

    /// Did the i'th derived use come from a memory operand?
    pub fn use_reg_from_mem(&self, inst: Inst, index: usize) -> bool {
        match &self.insts[inst].use_defs {
            Some(sets) => sets.use_from_mem & (1 << index as u32) != 0,
            None => false,
        }
    }
}
