//! Linear intermediate representation for tensor programs.
//!
//! The IR is a single straight-line block of instructions over named memory
//! locations. This module defines:
//! - the data model ([`Module`], [`Instr`], [`WeightVar`], operands, users),
//! - the [`builder::IrBuilder`] that creates instructions and wires users,
//! - `Module::verify`, the well-formedness check run before and after
//!   optimization.

mod types;
pub use types::*;

pub mod builder;
pub use builder::IrBuilder;

mod verify;
