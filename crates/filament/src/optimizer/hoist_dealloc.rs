//! Hoist dealloc instructions right after the last use of their allocation.
//!
//! A forward walk records, for each activation allocation, the last
//! non-dealloc instruction that references it. Any use of a tensor view
//! counts as a use of its source allocation, so a view's lifetime is always
//! enclosed inside the lifetime of its source tensor. A second walk then
//! moves each dealloc to the position right after that last use, which
//! tightens the lower bound of the buffer's lifetime.

use std::collections::HashMap;

use crate::ir::{InstrId, InstrKind, Module};

pub fn run(module: &mut Module) {
    // Maps each allocation to its last non-dealloc user. The allocation
    // itself seeds the map, so the dealloc of an otherwise-unused buffer
    // hoists to right after the alloc.
    let mut last_user: HashMap<InstrId, InstrId> = HashMap::new();
    for &id in module.order() {
        let instr = module.instr(id);
        if matches!(instr.kind, InstrKind::DeallocActivation) {
            continue;
        }
        if matches!(instr.kind, InstrKind::AllocActivation { .. }) {
            last_user.insert(id, id);
            continue;
        }
        for (v, _) in instr.operands() {
            if let Some(alloc) = module.allocation_origin(*v) {
                last_user.insert(alloc, id);
            }
        }
    }

    // Now that the last user is known the dealloc can be hoisted.
    for id in module.instr_ids() {
        if !matches!(module.instr(id).kind, InstrKind::DeallocActivation) {
            continue;
        }
        let alloc = module
            .allocation_origin(module.instr(id).operand(0).0)
            .expect("dealloc of a value that is not an activation");
        let last = last_user[&alloc];
        if module.index_of(last) + 1 == module.index_of(id) {
            // Already right after the last use.
            continue;
        }
        module.move_after(last, id);
    }
}
