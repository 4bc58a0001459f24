//! Sink alloc instructions right before their first use.
//!
//! Every activation allocation is detached from the stream (without
//! destroying it; identity and user edges survive), then reinserted
//! immediately before the first instruction whose operand list references
//! it. Tensor views reference their source allocation directly, so an
//! allocation first used through a view lands right before the view. This
//! tightens the upper bound of the buffer's lifetime.

use std::collections::HashSet;

use smallvec::SmallVec;

use crate::ir::{InstrId, InstrKind, Module, ValueRef};

pub fn run(module: &mut Module) {
    // Detach all of the allocs.
    let mut pending: HashSet<InstrId> = HashSet::new();
    for id in module.instr_ids() {
        if matches!(module.instr(id).kind, InstrKind::AllocActivation { .. }) {
            module.detach(id);
            pending.insert(id);
        }
    }

    // Place each alloc back in the right place.
    for id in module.instr_ids() {
        let refs: SmallVec<[ValueRef; 8]> = module
            .instr(id)
            .operands()
            .iter()
            .map(|(v, _)| *v)
            .collect();
        for v in refs {
            let ValueRef::Instr(a) = v else { continue };
            if pending.remove(&a) {
                module.insert_before(id, a);
            }
        }
        if pending.is_empty() {
            return;
        }
    }

    assert!(pending.is_empty(), "failed to sink some allocations");
}
