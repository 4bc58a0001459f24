//! Weight mutability inference.
//!
//! A weight that every user references only through `@in` operand slots is
//! never written by the program and is marked `Constant`; anything else is
//! `Mutable`. Constant weights are excluded from liveness tracking and
//! unlock the weight-source case of copy propagation.

use crate::ir::{Module, Mutability, OperandKind, ValueRef};

pub fn run(module: &mut Module) {
    for w in module.weight_ids().collect::<Vec<_>>() {
        let read_only = module
            .users(ValueRef::Weight(w))
            .iter()
            .all(|u| module.instr(u.instr).operand(u.operand).1 == OperandKind::In);
        module.weight_mut(w).mutability = if read_only {
            Mutability::Constant
        } else {
            Mutability::Mutable
        };
    }
}
