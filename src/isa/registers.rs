//! Data structures describing the registers of the target architecture.
//!
//! The register file is modeled as a flat space of *register units*. Units
//! 0..16 are the general purpose registers. Units 16..48 form the
//! floating/vector bank: the 16 floating point registers physically overlay
//! the low halves of the first 16 vector registers, so `%f3` and `%v3` are
//! the *same unit* and can't hold live values at the same time. The register
//! allocator relies on that aliasing when it preserves non-volatile floating
//! registers around calls.

use core::fmt;

/// The smallest unit of register allocation. One unit per architectural
/// register; aliasing registers share a unit.
pub type RegUnit = u8;

/// Number of general purpose registers.
pub const NUM_GPRS: u8 = 16;

/// First unit of the floating/vector bank.
pub const FP_BANK_BASE: u8 = 16;

/// Number of units in the floating/vector bank (32 vector registers, of
/// which the first 16 double as the floating point registers).
pub const NUM_FP_UNITS: u8 = 32;

/// Total number of register units.
pub const NUM_UNITS: usize = (FP_BANK_BASE + NUM_FP_UNITS) as usize;

/// A bit mask of register units, used for allocation eligibility.
pub type RegMask = u64;

/// Mask of all general purpose register units.
pub const GPR_MASK: RegMask = 0xffff;

/// Mask of the general purpose registers excluding `%r0`.
///
/// `%r0` reads as the constant zero in addressing contexts and can't encode a
/// branch target, so many queries want it excluded.
pub const GPR_MASK_NO_R0: RegMask = GPR_MASK & !1;

/// Mask of the floating point register units.
pub const FPR_MASK: RegMask = 0xffff << FP_BANK_BASE;

/// Mask of all vector register units.
pub const VR_MASK: RegMask = 0xffff_ffff << FP_BANK_BASE;

/// The kind of value a virtual register holds, which selects the register
/// bank it allocates from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegKind {
    /// General purpose (integer/address) register.
    Gpr,
    /// Floating point register: the low 16 units of the vector bank.
    Fpr,
    /// Full-width vector register.
    Vector,
}

impl RegKind {
    /// The allocation eligibility mask for this kind.
    pub fn bank_mask(self) -> RegMask {
        match self {
            RegKind::Gpr => GPR_MASK,
            RegKind::Fpr => FPR_MASK,
            RegKind::Vector => VR_MASK,
        }
    }
}

impl fmt::Display for RegKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            RegKind::Gpr => f.write_str("gpr"),
            RegKind::Fpr => f.write_str("fpr"),
            RegKind::Vector => f.write_str("vr"),
        }
    }
}

/// Allocation state of a real register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegState {
    /// Holds no live value.
    Free,
    /// The resident value was moved out, but the register has not been
    /// rebound or freed yet.
    Unlatched,
    /// Bound to a virtual register.
    Assigned,
    /// Temporarily ineligible for reassignment while the current
    /// instruction's own assignment is in progress.
    Blocked,
    /// Permanently reserved (stack pointer and friends); never assigned,
    /// never bookkept.
    Locked,
}

/// A concrete architectural register, identified by its unit.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RealReg(RegUnit);

impl RealReg {
    /// General purpose register `%rN`.
    pub fn gpr(n: u8) -> Self {
        debug_assert!(n < NUM_GPRS);
        Self(n)
    }

    /// Floating point register `%fN`.
    pub fn fpr(n: u8) -> Self {
        debug_assert!(n < 16);
        Self(FP_BANK_BASE + n)
    }

    /// Vector register `%vN`. For `n < 16` this is the same unit as `%fN`.
    pub fn vr(n: u8) -> Self {
        debug_assert!(n < NUM_FP_UNITS);
        Self(FP_BANK_BASE + n)
    }

    /// Reconstruct a register from its unit number.
    pub fn from_unit(unit: RegUnit) -> Self {
        debug_assert!((unit as usize) < NUM_UNITS);
        Self(unit)
    }

    /// The register's unit, usable as an index.
    pub fn unit(self) -> RegUnit {
        self.0
    }

    /// The register's number within its bank.
    pub fn number(self) -> u8 {
        if self.is_gpr() {
            self.0
        } else {
            self.0 - FP_BANK_BASE
        }
    }

    /// Is this a general purpose register?
    pub fn is_gpr(self) -> bool {
        self.0 < NUM_GPRS
    }

    /// Is this a unit of the floating/vector bank?
    pub fn is_fp_bank(self) -> bool {
        self.0 >= FP_BANK_BASE
    }

    /// Does this register have an even number within its bank?
    ///
    /// Register pairs must occupy an even/odd couple, even register first.
    pub fn is_even(self) -> bool {
        self.number() % 2 == 0
    }

    /// The odd sibling of an even register.
    pub fn odd_sibling(self) -> Self {
        debug_assert!(self.is_even());
        Self(self.0 + 1)
    }

    /// A single-bit mask selecting this register's unit.
    pub fn bit(self) -> RegMask {
        1 << self.0
    }
}

impl fmt::Display for RealReg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_gpr() {
            write!(f, "%r{}", self.number())
        } else if self.number() < 16 {
            write!(f, "%f{}", self.number())
        } else {
            write!(f, "%v{}", self.number())
        }
    }
}

impl fmt::Debug for RealReg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Iterate over the registers selected by `mask`, in increasing unit order.
pub fn mask_units(mask: RegMask) -> impl Iterator<Item = RealReg> {
    let mut bits = mask & ((1 << NUM_UNITS as u32) - 1);
    core::iter::from_fn(move || {
        if bits == 0 {
            None
        } else {
            let unit = bits.trailing_zeros() as RegUnit;
            bits &= bits - 1;
            Some(RealReg::from_unit(unit))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_space() {
        assert_eq!(RealReg::gpr(3).unit(), 3);
        assert_eq!(RealReg::fpr(3).unit(), 19);
        // The floating bank overlays the low vector registers.
        assert_eq!(RealReg::fpr(5), RealReg::vr(5));
        assert_ne!(RealReg::gpr(5), RealReg::vr(5));
        assert_eq!(RealReg::vr(20).number(), 20);
    }

    #[test]
    fn pair_parity() {
        assert!(RealReg::gpr(6).is_even());
        assert_eq!(RealReg::gpr(6).odd_sibling(), RealReg::gpr(7));
        assert!(!RealReg::fpr(1).is_even());
    }

    #[test]
    fn display() {
        assert_eq!(RealReg::gpr(14).to_string(), "%r14");
        assert_eq!(RealReg::fpr(4).to_string(), "%f4");
        assert_eq!(RealReg::vr(24).to_string(), "%v24");
    }

    #[test]
    fn mask_iteration() {
        let mask = RealReg::gpr(1).bit() | RealReg::gpr(9).bit() | RealReg::fpr(0).bit();
        let regs: Vec<RealReg> = mask_units(mask).collect();
        assert_eq!(regs, [RealReg::gpr(1), RealReg::gpr(9), RealReg::fpr(0)]);
        assert_eq!(mask_units(0).count(), 0);
    }
}
