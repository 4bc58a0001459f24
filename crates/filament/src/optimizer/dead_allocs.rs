//! Delete allocations that have no readers or writers.
//!
//! Three collect-then-erase passes, in order:
//!
//! 1. tensor views with no users,
//! 2. deallocs whose allocation has fewer than two users (the dealloc's own
//!    operand reference is one of them, so "fewer than two" means nothing
//!    else touches the buffer),
//! 3. allocations with fewer than two users.
//!
//! Erasing the views first lets a view-only allocation drop below the
//! threshold in the same sweep.

use crate::ir::{InstrId, InstrKind, Module, ValueRef};

use super::utils::erase_instructions;

pub fn run(module: &mut Module) {
    // Remove all unused tensor views.
    let dead: Vec<InstrId> = module
        .order()
        .iter()
        .copied()
        .filter(|&id| {
            matches!(module.instr(id).kind, InstrKind::TensorView { .. })
                && module.instr(id).num_users() == 0
        })
        .collect();
    erase_instructions(module, &dead);

    // Remove the deallocs that close unused allocs.
    let dead: Vec<InstrId> = module
        .order()
        .iter()
        .copied()
        .filter(|&id| {
            if !matches!(module.instr(id).kind, InstrKind::DeallocActivation) {
                return false;
            }
            let alloc = module
                .allocation_origin(module.instr(id).operand(0).0)
                .expect("dealloc of a value that is not an activation");
            module.num_users(ValueRef::Instr(alloc)) < 2
        })
        .collect();
    erase_instructions(module, &dead);

    // Remove the unused allocs.
    let dead: Vec<InstrId> = module
        .order()
        .iter()
        .copied()
        .filter(|&id| {
            matches!(module.instr(id).kind, InstrKind::AllocActivation { .. })
                && module.instr(id).num_users() < 2
        })
        .collect();
    erase_instructions(module, &dead);
}
