//! Virtual register pool.
//!
//! Virtual registers are entities in a per-compilation-unit arena; all
//! cross-references use the entity index, never pointers. Each virtual
//! register carries the use counters driving liveness decisions: the total
//! use count is fixed once lowering ends, and the future use count is
//! decremented as the backward assignment pass consumes uses. A future count
//! of zero during assignment means no earlier instruction uses the value, so
//! the real register can be released.

use crate::isa::{RealReg, RegKind};
use cranelift_entity::{entity_impl, PrimaryMap};

/// An opaque reference to a virtual register.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtReg(u32);
entity_impl!(VirtReg, "v");

/// The two members of a register pair, by their architectural roles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PairHalves {
    /// The even (first) member.
    pub high: VirtReg,
    /// The odd (second) member.
    pub low: VirtReg,
}

/// Per-virtual-register state.
pub(crate) struct VirtRegData {
    pub(crate) kind: RegKind,
    pub(crate) total_uses: u32,
    pub(crate) future_uses: u32,
    /// Written only by `Machine::bind`/`Machine::unbind`.
    pub(crate) assigned: Option<RealReg>,
    /// Present on pair shells only.
    pub(crate) pair: Option<PairHalves>,
    /// On pair members: the other member.
    pub(crate) sibling: Option<VirtReg>,
    pub(crate) placeholder: bool,
    pub(crate) is_64bit: bool,
    pub(crate) spilled: bool,
    pub(crate) avoid_gpr0: bool,
}

impl VirtRegData {
    fn new(kind: RegKind) -> Self {
        Self {
            kind,
            total_uses: 0,
            future_uses: 0,
            assigned: None,
            pair: None,
            sibling: None,
            placeholder: false,
            is_64bit: false,
            spilled: false,
            avoid_gpr0: false,
        }
    }
}

/// The pool of virtual registers of one compilation unit.
pub struct VirtRegs {
    regs: PrimaryMap<VirtReg, VirtRegData>,
}

impl VirtRegs {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            regs: PrimaryMap::new(),
        }
    }

    /// Allocate a fresh single virtual register of `kind`.
    pub fn allocate(&mut self, kind: RegKind) -> VirtReg {
        self.regs.push(VirtRegData::new(kind))
    }

    /// Allocate a placeholder register: a slot that stands for no
    /// materialized value yet. The flag is reset by the first real
    /// (non-dependency) use.
    pub fn allocate_placeholder(&mut self, kind: RegKind) -> VirtReg {
        let vreg = self.allocate(kind);
        self.regs[vreg].placeholder = true;
        vreg
    }

    /// Allocate a register pair: two sibling-linked members plus the shell
    /// register standing for the whole pair. Returns the shell.
    pub fn allocate_pair(&mut self, kind: RegKind) -> VirtReg {
        let high = self.regs.push(VirtRegData::new(kind));
        let low = self.regs.push(VirtRegData::new(kind));
        self.regs[high].sibling = Some(low);
        self.regs[low].sibling = Some(high);
        let shell = self.regs.push(VirtRegData::new(kind));
        self.regs[shell].pair = Some(PairHalves { high, low });
        shell
    }

    /// The register's kind.
    pub fn kind(&self, vreg: VirtReg) -> RegKind {
        self.regs[vreg].kind
    }

    /// The real register currently assigned, if any.
    pub fn assigned(&self, vreg: VirtReg) -> Option<RealReg> {
        self.regs[vreg].assigned
    }

    /// Pair halves if `vreg` is a pair shell.
    pub fn pair(&self, vreg: VirtReg) -> Option<PairHalves> {
        self.regs[vreg].pair
    }

    /// Is this a pair shell?
    pub fn is_pair(&self, vreg: VirtReg) -> bool {
        self.regs[vreg].pair.is_some()
    }

    /// The sibling of a pair member.
    pub fn sibling(&self, vreg: VirtReg) -> Option<VirtReg> {
        self.regs[vreg].sibling
    }

    /// Total number of uses recorded during lowering.
    pub fn total_uses(&self, vreg: VirtReg) -> u32 {
        self.regs[vreg].total_uses
    }

    /// Number of uses the backward pass has not consumed yet.
    pub fn future_uses(&self, vreg: VirtReg) -> u32 {
        self.regs[vreg].future_uses
    }

    /// Is this a placeholder register?
    pub fn is_placeholder(&self, vreg: VirtReg) -> bool {
        self.regs[vreg].placeholder
    }

    /// Has the 64-bit width tag been applied?
    pub fn is_64bit(&self, vreg: VirtReg) -> bool {
        self.regs[vreg].is_64bit
    }

    /// Is the value currently resident in a spill slot instead of a
    /// register?
    pub fn is_spilled(&self, vreg: VirtReg) -> bool {
        self.regs[vreg].spilled
    }

    /// Must assignment avoid `%r0` for this register?
    pub fn avoids_gpr0(&self, vreg: VirtReg) -> bool {
        self.regs[vreg].avoid_gpr0
    }

    /// Record one use: bumps both counters.
    pub(crate) fn record_use(&mut self, vreg: VirtReg) {
        self.regs[vreg].total_uses += 1;
        self.regs[vreg].future_uses += 1;
    }

    /// Consume one future use; returns the remaining count.
    pub(crate) fn consume_use(&mut self, vreg: VirtReg) -> u32 {
        let data = &mut self.regs[vreg];
        debug_assert!(data.future_uses > 0, "future use count underflow on {}", vreg);
        data.future_uses -= 1;
        data.future_uses
    }

    pub(crate) fn data(&self, vreg: VirtReg) -> &VirtRegData {
        &self.regs[vreg]
    }

    pub(crate) fn data_mut(&mut self, vreg: VirtReg) -> &mut VirtRegData {
        &mut self.regs[vreg]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_links() {
        let mut pool = VirtRegs::new();
        let shell = pool.allocate_pair(RegKind::Gpr);
        let halves = pool.pair(shell).unwrap();
        assert_eq!(pool.sibling(halves.high), Some(halves.low));
        assert_eq!(pool.sibling(halves.low), Some(halves.high));
        assert!(!pool.is_pair(halves.high));
    }

    #[test]
    fn counters() {
        let mut pool = VirtRegs::new();
        let v = pool.allocate(RegKind::Fpr);
        pool.record_use(v);
        pool.record_use(v);
        assert_eq!(pool.total_uses(v), 2);
        assert_eq!(pool.consume_use(v), 1);
        assert_eq!(pool.consume_use(v), 0);
        // Total stays; only the future count drains.
        assert_eq!(pool.total_uses(v), 2);
    }
}
