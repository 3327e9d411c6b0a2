//! Register dependency conditions.
//!
//! A dependency condition constrains which real register a virtual register
//! must occupy at one instruction boundary: argument registers before a call,
//! result registers after it, linkage-mandated placements at branch targets.
//! Each instruction can carry one condition set with two ordered groups:
//! pre-conditions (hold before the instruction executes) and post-conditions
//! (hold after).
//!
//! Condition sets are arena entities so that one set can be attached to
//! several instructions (linkage sequences do this). Merging two sets always
//! builds a new set, never splicing in place, because either input may still
//! be referenced by another instruction. A merge concatenates the entries of
//! both inputs in order; duplicates are kept, since each input's constraints
//! must be satisfied independently.

use crate::isa::{RealReg, RegKind};
use crate::regalloc::virtregs::VirtReg;
use cranelift_entity::entity_impl;

/// An opaque reference to a dependency condition set.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepSet(u32);
entity_impl!(DepSet, "deps");

/// The real-register constraint of one dependency record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Constraint {
    /// Must occupy this specific real register.
    Fixed(RealReg),
    /// A pair shell that must occupy an even/odd register couple.
    EvenOddPair,
    /// A pair member that must end up in the even half of a couple.
    LegalEvenOfPair,
    /// A pair member that must end up in the odd half of a couple.
    LegalOddOfPair,
    /// Any available register of the virtual register's kind.
    AssignAny,
    /// Any available register except `%r0`.
    AssignAnyExceptZero,
    /// The value must be resident in its spill slot, not in a register.
    Spilled,
    /// Every register of the named kind is clobbered at this boundary.
    KillClass(RegKind),
}

impl Constraint {
    /// The specific register, for `Fixed` constraints.
    pub fn fixed_reg(self) -> Option<RealReg> {
        match self {
            Constraint::Fixed(reg) => Some(reg),
            _ => None,
        }
    }

    /// Is this a wildcard ("any available register") constraint?
    pub fn is_assign_any(self) -> bool {
        match self {
            Constraint::AssignAny | Constraint::AssignAnyExceptZero => true,
            _ => false,
        }
    }

    /// Is this a pair-membership constraint?
    pub fn is_pair_member(self) -> bool {
        match self {
            Constraint::LegalEvenOfPair | Constraint::LegalOddOfPair => true,
            _ => false,
        }
    }
}

/// Whether a dependency reads and/or writes the constrained register.
///
/// Both flags may be updated during assignment to record what was actually
/// observed; everything else in a record is read-only once built.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DepAction {
    /// The instruction boundary reads the register.
    pub refs: bool,
    /// The instruction boundary writes the register.
    pub defs: bool,
}

impl DepAction {
    /// Reference only.
    pub const USE: Self = DepAction {
        refs: true,
        defs: false,
    };

    /// Definition only.
    pub const DEF: Self = DepAction {
        refs: false,
        defs: true,
    };

    /// Reference and definition.
    pub const USE_DEF: Self = DepAction {
        refs: true,
        defs: true,
    };
}

/// One dependency record: a virtual register, its placement constraint, and
/// the observed use/def action.
#[derive(Clone, Copy, Debug)]
pub struct Dep {
    /// The constrained virtual register.
    pub vreg: VirtReg,
    /// Where it must live at this boundary.
    pub constraint: Constraint,
    /// Read/write flags.
    pub action: DepAction,
}

impl Dep {
    /// Build a record.
    pub fn new(vreg: VirtReg, constraint: Constraint, action: DepAction) -> Self {
        Self {
            vreg,
            constraint,
            action,
        }
    }
}

/// An ordered group of dependency records with a fixed declared capacity.
///
/// Insertion order is significant; the add cursor is the next free slot.
/// Exceeding the declared capacity is a lowering bug and aborts.
pub struct DepGroup {
    slots: Vec<Dep>,
    limit: usize,
    num_uses: u32,
}

impl DepGroup {
    /// Create a group able to hold `limit` records.
    pub fn with_capacity(limit: usize) -> Self {
        Self {
            slots: Vec::with_capacity(limit),
            limit,
            num_uses: 0,
        }
    }

    /// Append a record at the add cursor.
    pub fn add(&mut self, dep: Dep) {
        assert!(
            self.slots.len() < self.limit,
            "dependency group overflow: capacity {}",
            self.limit
        );
        self.slots.push(dep);
    }

    /// The next free slot index.
    pub fn cursor(&self) -> usize {
        self.slots.len()
    }

    /// Declared capacity.
    pub fn capacity(&self) -> usize {
        self.limit
    }

    /// The records added so far, in insertion order.
    pub fn deps(&self) -> &[Dep] {
        &self.slots
    }

    /// Mutable access for recording observed refs/defs during assignment.
    pub(crate) fn deps_mut(&mut self) -> &mut [Dep] {
        &mut self.slots
    }

    /// Number of instructions sharing this group.
    pub fn num_uses(&self) -> u32 {
        self.num_uses
    }

    /// Count one more sharing instruction.
    pub fn inc_num_uses(&mut self) {
        self.num_uses += 1;
    }

    /// Does any record reference `vreg` as a read?
    pub fn refs_vreg(&self, vreg: VirtReg) -> bool {
        self.slots.iter().any(|d| d.vreg == vreg && d.action.refs)
    }

    /// Does any record reference `vreg` as a write?
    pub fn defs_vreg(&self, vreg: VirtReg) -> bool {
        self.slots.iter().any(|d| d.vreg == vreg && d.action.defs)
    }
}

/// A dependency condition set: optional pre and post groups plus sharing
/// bookkeeping.
pub struct DepConds {
    pre: Option<DepGroup>,
    post: Option<DepGroup>,
    is_used: bool,
}

impl DepConds {
    /// Create a set with room for `num_pre` pre-conditions and `num_post`
    /// post-conditions. A zero capacity means the corresponding group is
    /// absent.
    pub fn new(num_pre: usize, num_post: usize) -> Self {
        Self {
            pre: if num_pre > 0 {
                Some(DepGroup::with_capacity(num_pre))
            } else {
                None
            },
            post: if num_post > 0 {
                Some(DepGroup::with_capacity(num_post))
            } else {
                None
            },
            is_used: false,
        }
    }

    /// Build a new set holding all entries of `a` followed by all entries of
    /// `b`. Neither input is mutated; duplicates across the inputs are
    /// preserved since both must be satisfied independently.
    pub fn merged(a: &DepConds, b: &DepConds) -> DepConds {
        fn merge_groups(ga: Option<&DepGroup>, gb: Option<&DepGroup>) -> Option<DepGroup> {
            let cap = ga.map_or(0, |g| g.capacity()) + gb.map_or(0, |g| g.capacity());
            if cap == 0 {
                return None;
            }
            let mut merged = DepGroup::with_capacity(cap);
            for group in ga.iter().chain(gb.iter()) {
                for dep in group.deps() {
                    merged.add(*dep);
                }
            }
            Some(merged)
        }

        DepConds {
            pre: merge_groups(a.pre.as_ref(), b.pre.as_ref()),
            post: merge_groups(a.post.as_ref(), b.post.as_ref()),
            is_used: false,
        }
    }

    /// Append a pre-condition. Only legal before the set is first attached.
    pub fn add_pre(&mut self, dep: Dep) {
        debug_assert!(!self.is_used, "modifying an attached condition set");
        self.pre
            .as_mut()
            .expect("condition set has no pre-condition group")
            .add(dep);
    }

    /// Append a post-condition. Only legal before the set is first attached.
    pub fn add_post(&mut self, dep: Dep) {
        debug_assert!(!self.is_used, "modifying an attached condition set");
        self.post
            .as_mut()
            .expect("condition set has no post-condition group")
            .add(dep);
    }

    /// The pre-condition group.
    pub fn pre(&self) -> Option<&DepGroup> {
        self.pre.as_ref()
    }

    /// The post-condition group.
    pub fn post(&self) -> Option<&DepGroup> {
        self.post.as_ref()
    }

    pub(crate) fn pre_mut(&mut self) -> Option<&mut DepGroup> {
        self.pre.as_mut()
    }

    pub(crate) fn post_mut(&mut self) -> Option<&mut DepGroup> {
        self.post.as_mut()
    }

    /// Add cursor of the pre group (0 when absent).
    pub fn pre_cursor(&self) -> usize {
        self.pre.as_ref().map_or(0, |g| g.cursor())
    }

    /// Add cursor of the post group (0 when absent).
    pub fn post_cursor(&self) -> usize {
        self.post.as_ref().map_or(0, |g| g.cursor())
    }

    /// Has this set been attached to an instruction?
    pub fn is_used(&self) -> bool {
        self.is_used
    }

    /// Mark the set attached.
    pub(crate) fn set_used(&mut self) {
        self.is_used = true;
    }

    /// Does any record in either group read `vreg`?
    pub fn refs_vreg(&self, vreg: VirtReg) -> bool {
        self.pre.as_ref().map_or(false, |g| g.refs_vreg(vreg))
            || self.post.as_ref().map_or(false, |g| g.refs_vreg(vreg))
    }

    /// Does any record in either group write `vreg`?
    pub fn defs_vreg(&self, vreg: VirtReg) -> bool {
        self.pre.as_ref().map_or(false, |g| g.defs_vreg(vreg))
            || self.post.as_ref().map_or(false, |g| g.defs_vreg(vreg))
    }
}
