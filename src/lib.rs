//! Zarch register assignment library.
//!
//! This crate implements the instruction-selection backend's local register
//! assignment for the zarch family: dependency conditions at control-flow
//! merge points, backward per-instruction assignment of virtual registers to
//! real registers, condition-code liveness tracking, and out-of-line
//! (execute-style) instruction redirection.
//!
//! Assignment is purely local and order-dependent: the surrounding driver
//! walks the instruction stream in reverse program order and calls
//! [`Context::assign_registers`](context/struct.Context.html) exactly once
//! per instruction per pass. All cross-instruction state lives in the
//! per-compilation-unit [`Context`](context/struct.Context.html); nothing is
//! shared between compilation units.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

pub use cranelift_entity as entity;

pub mod inst;
pub mod isa;
pub mod regalloc;

mod context;

pub use crate::context::{CcModel, Config, Context};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
