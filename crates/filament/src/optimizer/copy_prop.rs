//! Copy propagation.
//!
//! For each `copy dest <- src`, two shapes fold the copy away:
//!
//! * **Constant-weight source.** If `src` is a constant weight, `dest` is
//!   not a weight, and the copy is the only writer of `dest`, then every
//!   later reader of `dest` can read `src` directly. Rewire the non-dealloc
//!   users of `dest` to `src` and erase the copy.
//!
//! * **Allocation to allocation.** Using live intervals (same numbering as
//!   [`super::liveness`]): let `SI`/`DI` be the src/dest intervals enclosing
//!   the copy. If `SI` ends at or before `DI` begins, the copy is the last
//!   use of `src`'s current value; if `DI` is strictly enclosed in `SI`,
//!   `dest`'s whole lifetime sits inside `src`'s. In both shapes `src` can
//!   be renamed to `dest` throughout `SI` (except non-write operands at
//!   `SI`'s opening index, which still read the previous value), after
//!   which the copy is self-referential and is erased.
//!
//! The interval map is not updated after a rewrite. A rewrite either erases
//! the copy or leaves the stream in a state the next guard rejects, so stale
//! intervals are never acted on; do not attempt incremental repair.

use std::collections::HashSet;

use tracing::debug;

use crate::ir::{InstrId, InstrKind, Module, Mutability, OperandKind, ValueRef};

use super::liveness::{
    calculate_live_intervals, enclosing_interval, is_enclosed_inside, Interval,
};
use super::utils::{erase_instructions, replace_all_non_dealloc_users_with, single_writer};

pub fn run(module: &mut Module) {
    let intervals_map = calculate_live_intervals(module);

    let mut erased: HashSet<InstrId> = HashSet::new();
    let mut idx = 0usize;
    for id in module.instr_ids() {
        let instr = module.instr(id);
        if matches!(instr.kind, InstrKind::DeallocActivation) {
            continue;
        }
        let inst_idx = idx;
        idx += 1;
        if !matches!(instr.kind, InstrKind::Copy) {
            continue;
        }

        let dest = instr.operand(0).0;
        let src = instr.operand(1).0;
        debug_assert_eq!(
            module.value_type(dest),
            module.value_type(src),
            "copy operands must have the same type"
        );

        // The source may have been modified by any instruction that used it
        // as @out or @inout; writes into it are about to be renamed, which
        // must not change an observable effect.
        if let ValueRef::Weight(w) = src {
            // Bail if src is a mutable weight, if dest has writers besides
            // this copy, or if dest is itself an output variable whose
            // assignment cannot be removed.
            if module.weight(w).mutability == Mutability::Mutable
                || single_writer(module, dest) != Some(id)
                || matches!(dest, ValueRef::Weight(_))
            {
                continue;
            }
            // The only write into dest is this copy, so it is safe to
            // replace all uses of dest by src.
            debug!(
                copy = %module.instr(id).name,
                src = %module.value_name(src),
                "forward propagating constant weight"
            );
            replace_all_non_dealloc_users_with(module, dest, src);
            erased.insert(id);
            continue;
        }

        // Bail if information about live intervals is not known.
        let (Some(src_intervals), Some(dest_intervals)) = (
            intervals_map.intervals(src),
            intervals_map.intervals(dest),
        ) else {
            continue;
        };
        let Some(src_interval) = enclosing_interval(src_intervals, inst_idx) else {
            continue;
        };
        let Some(dest_interval) = enclosing_interval(dest_intervals, inst_idx) else {
            continue;
        };

        // Either the copy is the last use of src's current value, or dest's
        // lifetime is strictly enclosed in src's. Otherwise renaming would
        // merge two values that coexist.
        let can_propagate = src_interval.1 <= dest_interval.0
            || is_enclosed_inside(src_interval, dest_interval);
        if !can_propagate {
            continue;
        }

        debug!(
            copy = %module.instr(id).name,
            src = %module.value_name(src),
            dest = %module.value_name(dest),
            "renaming src to dest inside its interval"
        );
        replace_all_uses_in_interval(module, src, dest, src_interval);
        debug_assert_eq!(
            module.instr(id).operand(0).0,
            module.instr(id).operand(1).0,
            "copy should be self-referential after renaming"
        );
        // Renaming extends dest's lifetime beyond what alloc placement
        // assumed; widen its alloc/dealloc pair to enclose the new uses.
        if let ValueRef::Instr(dest_alloc) = dest {
            widen_alloc_lifetime(module, dest_alloc);
        }
        erased.insert(id);
    }

    let erased: Vec<InstrId> = erased.into_iter().collect();
    erase_instructions(module, &erased);
}

/// Move an allocation before its earliest user and its dealloc after its
/// latest non-dealloc user, when renaming has pushed uses outside the pair.
fn widen_alloc_lifetime(module: &mut Module, alloc: InstrId) {
    if !matches!(module.instr(alloc).kind, InstrKind::AllocActivation { .. }) {
        return;
    }
    let mut first: Option<InstrId> = None;
    let mut last: Option<InstrId> = None;
    let mut dealloc: Option<InstrId> = None;
    for u in module.instr(alloc).users() {
        if matches!(module.instr(u.instr).kind, InstrKind::DeallocActivation) {
            dealloc = Some(u.instr);
            continue;
        }
        let pos = module.index_of(u.instr);
        if first.is_none_or(|f| pos < module.index_of(f)) {
            first = Some(u.instr);
        }
        if last.is_none_or(|l| pos > module.index_of(l)) {
            last = Some(u.instr);
        }
    }
    if let Some(f) = first {
        if module.index_of(alloc) > module.index_of(f) {
            module.move_before(f, alloc);
        }
    }
    if let (Some(d), Some(l)) = (dealloc, last) {
        if module.index_of(d) < module.index_of(l) {
            module.move_after(l, d);
        }
    }
}

/// Rewrite every operand referencing `val` to `with`, inside the
/// instruction-index range of `interval` (same numbering as liveness:
/// deallocs carry no index and are left untouched). At the interval's
/// opening index only write operands are rewired: the instruction that
/// opened the interval may also read the location's previous value.
fn replace_all_uses_in_interval(
    module: &mut Module,
    val: ValueRef,
    with: ValueRef,
    interval: Interval,
) {
    let mut changed = 0usize;
    let mut idx = 0usize;
    for id in module.instr_ids() {
        if matches!(module.instr(id).kind, InstrKind::DeallocActivation) {
            continue;
        }
        let inst_idx = idx;
        idx += 1;
        if inst_idx < interval.0 {
            continue;
        }
        if inst_idx > interval.1 {
            break;
        }
        for i in 0..module.instr(id).num_operands() {
            let (v, kind) = module.instr(id).operand(i);
            if v != val {
                continue;
            }
            if inst_idx == interval.0 && kind != OperandKind::Out {
                continue;
            }
            module.set_operand(id, i, with);
            changed += 1;
        }
    }
    debug_assert!(changed > 0, "renaming changed no instructions");
}
