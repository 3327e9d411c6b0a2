//! Target architecture description.
//!
//! This subsystem is deliberately single-family: the register file layout and
//! opcode metadata below describe the zarch architecture only. Anything the
//! assignment algorithm needs to know about the target is answered by the
//! read-only facts in these two modules.

pub mod opcodes;
pub mod registers;

pub use self::opcodes::{CondMask, InstFormat, Opcode};
pub use self::registers::{RealReg, RegKind, RegMask, RegState, RegUnit};
