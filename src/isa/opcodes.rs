//! Opcode metadata.
//!
//! Read-only facts about each opcode, consumed by operand bookkeeping, the
//! use/def derivation, and the condition-code tracker. This is a compact
//! hand-maintained table covering the opcodes the register assignment layer
//! cares about; encoding details live with the binary emitter, not here.

use core::fmt;

/// Instruction encoding format. Only the length fact matters to this layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstFormat {
    /// Register-register, 2 bytes.
    Rr,
    /// Extended register-register, 4 bytes.
    Rre,
    /// Register-immediate, 4 bytes.
    Ri,
    /// Register + storage operand, 4 bytes.
    Rx,
    /// Register range + storage operand, 4 bytes.
    Rs,
    /// Register + long immediate/relative, 6 bytes.
    Ril,
    /// Vector register + storage operand, 6 bytes.
    Vrx,
    /// Vector register-register, 6 bytes.
    Vrr,
    /// No encoding: labels and dependency carriers.
    Pseudo,
}

impl InstFormat {
    /// Encoded instruction length in bytes.
    pub fn len(self) -> u8 {
        match self {
            InstFormat::Rr => 2,
            InstFormat::Rre | InstFormat::Ri | InstFormat::Rx | InstFormat::Rs => 4,
            InstFormat::Ril | InstFormat::Vrx | InstFormat::Vrr => 6,
            InstFormat::Pseudo => 0,
        }
    }
}

/// A 4-bit branch condition mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CondMask(u8);

impl CondMask {
    /// Branch always.
    pub const ALWAYS: Self = CondMask(15);

    /// Build a mask from its 4 bits.
    pub fn new(bits: u8) -> Self {
        debug_assert!(bits < 16);
        CondMask(bits)
    }

    /// The raw mask bits.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Masks 14 and 15 on a register branch with `%r0` encode a no-op; the
    /// register mention is semantically inert.
    pub fn is_nop_mask(self) -> bool {
        self.0 >= 14
    }
}

/// Opcode mnemonics known to the register assignment layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Opcode {
    // Register moves and loads.
    Lr,
    Lgr,
    Ler,
    Ldr,
    Vlr,
    L,
    Lg,
    Ld,
    Vl,
    Lhi,
    Lghi,
    Llgfr,
    Lm,
    Lmg,
    // Stores.
    St,
    Stg,
    Std,
    Vst,
    Stm,
    Stmg,
    // Two-address arithmetic and logic.
    Ar,
    Agr,
    Alr,
    Algr,
    Alcr,
    Sr,
    Sgr,
    Slr,
    Nr,
    Or,
    Xr,
    Xgr,
    // Even/odd pair arithmetic.
    Mr,
    Dr,
    // Floating point.
    Adbr,
    Sdbr,
    Cdbr,
    // Vector.
    Va,
    // Compares and traps.
    Cr,
    Cgr,
    C,
    Clr,
    Cl,
    Crt,
    // Branches and calls.
    Brc,
    Bcr,
    Brct,
    Brasl,
    Basr,
    // String ops with implicit register side effects.
    Trt,
    Srst,
    // Execute-style redirection.
    Ex,
    Exrl,
    // Pseudo instructions.
    Label,
    Depend,
}

impl Opcode {
    /// Encoding format of this opcode.
    pub fn format(self) -> InstFormat {
        use self::Opcode::*;
        match self {
            Lr | Ler | Ldr | Ar | Alr | Alcr | Sr | Slr | Nr | Or | Xr | Mr | Dr | Cr | Clr
            | Bcr | Basr => InstFormat::Rr,
            Lgr | Agr | Algr | Sgr | Xgr | Llgfr | Cgr | Adbr | Sdbr | Cdbr | Crt | Trt | Srst => {
                InstFormat::Rre
            }
            Lhi | Lghi | Brc | Brct => InstFormat::Ri,
            L | Lg | Ld | St | Stg | Std | Ex | C | Cl => InstFormat::Rx,
            Lm | Lmg | Stm | Stmg => InstFormat::Rs,
            Brasl | Exrl => InstFormat::Ril,
            Vl | Vst => InstFormat::Vrx,
            Vlr | Va => InstFormat::Vrr,
            Label | Depend => InstFormat::Pseudo,
        }
    }

    /// Encoded length in bytes.
    pub fn len(self) -> u8 {
        self.format().len()
    }

    /// Does this opcode load its target from memory or another register?
    pub fn is_load(self) -> bool {
        use self::Opcode::*;
        match self {
            Lr | Lgr | Ler | Ldr | Vlr | L | Lg | Ld | Vl | Lhi | Lghi | Llgfr | Lm | Lmg => true,
            _ => false,
        }
    }

    /// Does this opcode store to memory? Its target-position register operand
    /// is semantically a source.
    pub fn is_store(self) -> bool {
        use self::Opcode::*;
        match self {
            St | Stg | Std | Vst | Stm | Stmg => true,
            _ => false,
        }
    }

    /// Is this a compare? Compares read their target-position operand and
    /// define nothing but the condition code.
    pub fn is_compare(self) -> bool {
        use self::Opcode::*;
        match self {
            Cr | Cgr | C | Clr | Cl | Cdbr => true,
            _ => false,
        }
    }

    /// Is this a trapping compare?
    pub fn is_trap(self) -> bool {
        self == Opcode::Crt
    }

    /// Does this opcode read its target-position register operand (two
    /// address arithmetic, counted branches, execute)?
    pub fn uses_target(self) -> bool {
        use self::Opcode::*;
        match self {
            Ar | Agr | Alr | Algr | Alcr | Sr | Sgr | Slr | Nr | Or | Xr | Xgr | Mr | Dr | Adbr
            | Sdbr | Va | Brct | Ex | Exrl => true,
            _ => false,
        }
    }

    /// Does this opcode operate on full 64-bit register width?
    pub fn is_64bit(self) -> bool {
        use self::Opcode::*;
        match self {
            Lgr | Lg | Lghi | Lmg | Stg | Stmg | Agr | Algr | Sgr | Xgr | Cgr => true,
            _ => false,
        }
    }

    /// Does this opcode widen a 32-bit source into a 64-bit target?
    pub fn is_32_to_64(self) -> bool {
        self == Opcode::Llgfr
    }

    /// Is this a conditional or unconditional branch (calls excluded)?
    pub fn is_branch(self) -> bool {
        use self::Opcode::*;
        match self {
            Brc | Bcr | Brct => true,
            _ => false,
        }
    }

    /// Is this a call?
    pub fn is_call(self) -> bool {
        use self::Opcode::*;
        match self {
            Brasl | Basr => true,
            _ => false,
        }
    }

    /// Is this a label definition?
    pub fn is_label(self) -> bool {
        self == Opcode::Label
    }

    /// Load-multiple: expands to a range of real registers once assigned.
    pub fn is_load_multiple(self) -> bool {
        use self::Opcode::*;
        match self {
            Lm | Lmg => true,
            _ => false,
        }
    }

    /// Store-multiple counterpart of [`is_load_multiple`](#method.is_load_multiple).
    pub fn is_store_multiple(self) -> bool {
        use self::Opcode::*;
        match self {
            Stm | Stmg => true,
            _ => false,
        }
    }

    /// Does this opcode set the condition code?
    pub fn sets_cc(self) -> bool {
        use self::Opcode::*;
        match self {
            Ar | Agr | Alr | Algr | Alcr | Sr | Sgr | Slr | Nr | Or | Xr | Xgr | Adbr | Sdbr
            | Cr | Cgr | C | Clr | Cl | Cdbr | Trt | Srst => true,
            _ => false,
        }
    }

    /// Does this opcode read the condition code?
    pub fn reads_cc(self) -> bool {
        use self::Opcode::*;
        match self {
            Brc | Bcr | Alcr => true,
            _ => false,
        }
    }

    /// The condition code reflects signed overflow.
    pub fn sets_overflow_flag(self) -> bool {
        use self::Opcode::*;
        match self {
            Ar | Agr | Sr | Sgr => true,
            _ => false,
        }
    }

    /// The condition code reflects a zero result.
    pub fn sets_zero_flag(self) -> bool {
        use self::Opcode::*;
        match self {
            Ar | Agr | Alr | Algr | Alcr | Sr | Sgr | Slr | Nr | Or | Xr | Xgr => true,
            _ => false,
        }
    }

    /// The condition code reflects the result's sign.
    pub fn sets_sign_flag(self) -> bool {
        use self::Opcode::*;
        match self {
            Ar | Agr | Sr | Sgr => true,
            _ => false,
        }
    }

    /// The condition code reflects a carry/borrow.
    pub fn sets_carry_flag(self) -> bool {
        use self::Opcode::*;
        match self {
            Alr | Algr | Alcr | Slr => true,
            _ => false,
        }
    }

    /// The condition code is a comparison outcome.
    pub fn sets_compare_flag(self) -> bool {
        self.is_compare()
    }

    /// Implicitly defines `%r1` (no explicit operand says so).
    pub fn implicitly_sets_gpr1(self) -> bool {
        self == Opcode::Trt
    }

    /// Implicitly defines `%r2`.
    pub fn implicitly_sets_gpr2(self) -> bool {
        self == Opcode::Trt
    }

    /// Implicitly reads `%r0`.
    pub fn implicitly_uses_gpr0(self) -> bool {
        self == Opcode::Srst
    }

    /// Register operands of this opcode can't encode `%r0` (register
    /// branches, execute targets, addressing bases).
    pub fn disallows_gpr0_operand(self) -> bool {
        use self::Opcode::*;
        match self {
            Bcr | Basr | Ex | Exrl => true,
            _ => false,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Lowercase mnemonics in listings.
        let s = format!("{:?}", self);
        f.write_str(&s.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_targets_are_sources() {
        assert!(Opcode::St.is_store());
        assert!(!Opcode::St.is_load());
        assert!(Opcode::Cr.is_compare());
        assert!(!Opcode::Cr.is_store());
    }

    #[test]
    fn lengths() {
        assert_eq!(Opcode::Lr.len(), 2);
        assert_eq!(Opcode::L.len(), 4);
        assert_eq!(Opcode::Brasl.len(), 6);
        assert_eq!(Opcode::Label.len(), 0);
    }

    #[test]
    fn cc_classification() {
        // Adds carry detail, so the tracker can keep structured info.
        assert!(Opcode::Alr.sets_cc() && Opcode::Alr.sets_carry_flag());
        // Pure moves leave the condition code alone.
        assert!(!Opcode::Lr.sets_cc());
        // Branch on condition consumes it.
        assert!(Opcode::Brc.reads_cc());
        assert!(Opcode::Cr.sets_compare_flag());
    }

    #[test]
    fn nop_mask() {
        assert!(CondMask::new(14).is_nop_mask());
        assert!(CondMask::ALWAYS.is_nop_mask());
        assert!(!CondMask::new(8).is_nop_mask());
    }
}
