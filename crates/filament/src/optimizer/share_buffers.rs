//! Operand-level in-place buffer reuse.
//!
//! A reverse walk maintains the set of allocation origins whose current
//! contents are still needed by some later reader. Weights start live and
//! stay live. At each instruction, operand kinds update the live set in
//! three steps:
//!
//! 1. `@out` origins leave the live set (the buffer is about to be
//!    clobbered, so its prior contents are dead here) and are remembered in
//!    the instruction's out-buffer set; `@inout` origins join the live set;
//!    an `@in` of a buffer in the out-buffer set joins the live set (the
//!    instruction also reads what it writes through a different slot).
//! 2. With liveness exact at this point, the in-place attempt runs: if an
//!    ordered slot pair is permitted by the kind's in-place table, the two
//!    origins have equal types and are distinct, and both are dead, the
//!    destination's non-dealloc uses are rewired to the source and the scan
//!    stops for this instruction.
//! 3. Every non-`@out` origin joins the live set: the instruction needs its
//!    inputs alive.

use std::collections::HashSet;

use smallvec::SmallVec;
use tracing::debug;

use crate::ir::{InstrId, Module, Operand, OperandKind, ValueRef};

use super::utils::replace_all_non_dealloc_users_with;

pub fn run(module: &mut Module) {
    // Buffers known to contain information used later; never clobbered.
    let mut live: HashSet<ValueRef> = module.weight_ids().map(ValueRef::Weight).collect();

    for id in module.instr_ids().into_iter().rev() {
        // Output buffers of the current instruction.
        let mut out_buffers: HashSet<ValueRef> = HashSet::new();

        let ops: SmallVec<[Operand; 6]> = module.instr(id).operands().iter().copied().collect();
        for (v, kind) in &ops {
            let Some(alloc) = module.allocation_origin(*v) else {
                continue;
            };
            let origin = ValueRef::Instr(alloc);
            match kind {
                OperandKind::Out => {
                    live.remove(&origin);
                    out_buffers.insert(origin);
                }
                OperandKind::InOut => {
                    live.insert(origin);
                }
                OperandKind::In if out_buffers.contains(&origin) => {
                    live.insert(origin);
                }
                OperandKind::In => {}
            }
        }

        // Liveness is now exact at this program point; try to reuse the
        // operand buffers.
        try_to_share_buffers_for_instr(module, &live, id);

        // The instruction needs its inputs alive.
        let ops: SmallVec<[Operand; 6]> = module.instr(id).operands().iter().copied().collect();
        for (v, kind) in &ops {
            if *kind == OperandKind::Out {
                continue;
            }
            if let Some(alloc) = module.allocation_origin(*v) {
                live.insert(ValueRef::Instr(alloc));
            }
        }
    }
}

/// Try to fold one operand buffer of `id` into another, based on the
/// liveness information in `live`. At this point `@out` origins are dead and
/// `@in` origins have not been marked alive yet.
fn try_to_share_buffers_for_instr(module: &mut Module, live: &HashSet<ValueRef>, id: InstrId) {
    let n = module.instr(id).num_operands();
    for first in 0..n {
        for second in first + 1..n {
            let dest_op = module.instr(id).operand(first).0;
            let src_op = module.instr(id).operand(second).0;
            let dest = module
                .allocation_origin(dest_op)
                .map(ValueRef::Instr)
                .unwrap_or(dest_op);
            let src = module
                .allocation_origin(src_op)
                .map(ValueRef::Instr)
                .unwrap_or(src_op);

            // Operands must be different, but of the same type.
            if module.value_type(dest) != module.value_type(src) || dest == src {
                continue;
            }

            if !module.instr(id).is_inplace_op(first, second) {
                continue;
            }

            // Both slots carry dead content at this point, so the buffer
            // storage can be reused.
            if !live.contains(&dest) && !live.contains(&src) {
                debug!(
                    instr = %module.instr(id).name,
                    dest = %module.value_name(dest),
                    src = %module.value_name(src),
                    "sharing buffers"
                );
                replace_all_non_dealloc_users_with(module, dest, src);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ElemKind, IrBuilder, Mutability, Type};

    fn fp(dims: Vec<usize>) -> Type {
        Type::new(ElemKind::Float, dims)
    }

    #[test]
    fn elementwise_dest_folds_into_dead_src() {
        // a = splat 1; add(b, a, a); copy(w, b)
        // After the add, a is dead; the add may compute into a's storage.
        let mut m = Module::new("test");
        let w = m.create_weight("w", fp(vec![4]), Mutability::Mutable);
        let mut b = IrBuilder::new(&mut m);
        let a = b.alloc_activation("a", fp(vec![4]));
        let bb = b.alloc_activation("b", fp(vec![4]));
        b.splat("sa", ValueRef::Instr(a), 1.0);
        let add = b.element_add("add", ValueRef::Instr(bb), ValueRef::Instr(a), ValueRef::Instr(a));
        let cp = b.copy("cp", ValueRef::Weight(w), ValueRef::Instr(bb));
        b.dealloc_activation("da", ValueRef::Instr(a));
        b.dealloc_activation("db", ValueRef::Instr(bb));

        run(&mut m);

        // Every non-dealloc use of b is rewired to a.
        assert_eq!(m.instr(add).operand(0).0, ValueRef::Instr(a));
        assert_eq!(m.instr(cp).operand(1).0, ValueRef::Instr(a));
        assert!(m.verify().is_ok());
    }

    #[test]
    fn live_src_blocks_sharing() {
        // a's contents are read again after the add, so the add must not
        // clobber a.
        let mut m = Module::new("test");
        let w = m.create_weight("w", fp(vec![4]), Mutability::Mutable);
        let w2 = m.create_weight("w2", fp(vec![4]), Mutability::Mutable);
        let mut b = IrBuilder::new(&mut m);
        let a = b.alloc_activation("a", fp(vec![4]));
        let bb = b.alloc_activation("b", fp(vec![4]));
        b.splat("sa", ValueRef::Instr(a), 1.0);
        let add = b.element_add("add", ValueRef::Instr(bb), ValueRef::Instr(a), ValueRef::Instr(a));
        b.copy("cp2", ValueRef::Weight(w2), ValueRef::Instr(a));
        b.dealloc_activation("da", ValueRef::Instr(a));
        b.copy("cp", ValueRef::Weight(w), ValueRef::Instr(bb));
        b.dealloc_activation("db", ValueRef::Instr(bb));

        run(&mut m);
        assert_eq!(m.instr(add).operand(0).0, ValueRef::Instr(bb));
        assert!(m.verify().is_ok());
    }

    #[test]
    fn copy_never_shares() {
        let mut m = Module::new("test");
        let w = m.create_weight("w", fp(vec![4]), Mutability::Mutable);
        let mut b = IrBuilder::new(&mut m);
        let a = b.alloc_activation("a", fp(vec![4]));
        let bb = b.alloc_activation("b", fp(vec![4]));
        b.splat("sa", ValueRef::Instr(a), 1.0);
        let cp1 = b.copy("cp1", ValueRef::Instr(bb), ValueRef::Instr(a));
        b.dealloc_activation("da", ValueRef::Instr(a));
        b.copy("cp", ValueRef::Weight(w), ValueRef::Instr(bb));
        b.dealloc_activation("db", ValueRef::Instr(bb));

        run(&mut m);
        // The copy's in-place table permits nothing.
        assert_eq!(m.instr(cp1).operand(0).0, ValueRef::Instr(bb));
    }

    #[test]
    fn type_mismatch_blocks_sharing() {
        let mut m = Module::new("test");
        let w = m.create_weight("w", fp(vec![2]), Mutability::Mutable);
        let mut b = IrBuilder::new(&mut m);
        let a = b.alloc_activation("a", fp(vec![4]));
        let bb = b.alloc_activation("b", fp(vec![2]));
        b.splat("sa", ValueRef::Instr(a), 1.0);
        let r = b.relu("r", ValueRef::Instr(bb), ValueRef::Instr(a));
        b.dealloc_activation("da", ValueRef::Instr(a));
        b.copy("cp", ValueRef::Weight(w), ValueRef::Instr(bb));
        b.dealloc_activation("db", ValueRef::Instr(bb));

        run(&mut m);
        assert_eq!(m.instr(r).operand(0).0, ValueRef::Instr(bb));
    }

    #[test]
    fn self_read_write_does_not_rewrite() {
        // An op that writes and reads the same buffer through different
        // slots: the in-place attempt requires distinct origins, so nothing
        // changes and the dealloc stays put.
        let mut m = Module::new("test");
        let mut b = IrBuilder::new(&mut m);
        let a = b.alloc_activation("a", fp(vec![4]));
        b.splat("sa", ValueRef::Instr(a), 1.0);
        let add = b.element_add("add", ValueRef::Instr(a), ValueRef::Instr(a), ValueRef::Instr(a));
        b.dealloc_activation("da", ValueRef::Instr(a));

        let before = m.instr_ids();
        run(&mut m);
        assert_eq!(m.instr_ids(), before);
        assert_eq!(m.instr(add).operand(0).0, ValueRef::Instr(a));
        assert!(m.verify().is_ok());
    }

    #[test]
    fn weights_never_clobbered() {
        // dest is a weight: weights are always live, so no sharing.
        let mut m = Module::new("test");
        let w = m.create_weight("w", fp(vec![4]), Mutability::Mutable);
        let mut b = IrBuilder::new(&mut m);
        let a = b.alloc_activation("a", fp(vec![4]));
        b.splat("sa", ValueRef::Instr(a), 1.0);
        let add = b.element_add(
            "add",
            ValueRef::Weight(w),
            ValueRef::Instr(a),
            ValueRef::Instr(a),
        );
        b.dealloc_activation("da", ValueRef::Instr(a));

        run(&mut m);
        assert_eq!(m.instr(add).operand(0).0, ValueRef::Weight(w));
    }
}
