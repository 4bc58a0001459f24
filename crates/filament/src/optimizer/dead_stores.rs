//! Dead store elimination.
//!
//! A single backwards pass suffices because the program is one basic block:
//!
//! - for each memory location, remember the last seen read and write;
//! - at a write: if no read has been seen since, the write is dead; record
//!   the write and reset the last seen read.
//!
//! An instruction is removed when every operand it mutates is dead. Mutable
//! weights are seeded with a synthetic read at the end of the program, so a
//! terminal store into a weight (an observable effect) is never removed.
//! Allocs, deallocs and tensor views carry no stores and are skipped;
//! operands are resolved through view chains to the underlying location.

use std::collections::HashMap;

use smallvec::SmallVec;
use tracing::debug;

use crate::ir::{InstrId, InstrKind, Module, Operand, OperandKind, ValueRef};

use super::utils::erase_instructions;

/// Per-location analysis state.
#[derive(Default, Clone, Copy)]
struct MemoryLocationState {
    last_seen_read: Option<InstrId>,
    last_seen_write: Option<InstrId>,
}

pub fn run(module: &mut Module) {
    let order = module.instr_ids();
    let mut memory_state: HashMap<ValueRef, MemoryLocationState> = HashMap::new();

    // A synthetic read at the end of the program keeps the last store into
    // every weight alive.
    if let Some(&last) = order.last() {
        for w in module.weight_ids() {
            memory_state.entry(ValueRef::Weight(w)).or_default().last_seen_read = Some(last);
        }
    }

    let mut erased: Vec<InstrId> = Vec::new();
    for &id in order.iter().rev() {
        let instr = module.instr(id);
        if matches!(
            instr.kind,
            InstrKind::DeallocActivation
                | InstrKind::AllocActivation { .. }
                | InstrKind::TensorView { .. }
        ) {
            continue;
        }

        let ops: SmallVec<[Operand; 6]> = instr.operands().iter().copied().collect();

        // Process all operand writes.
        let mut num_mutated = 0usize;
        let mut num_mutated_unread = 0usize;
        let mut shadowed_by: SmallVec<[InstrId; 2]> = SmallVec::new();
        for (v, kind) in &ops {
            if *kind == OperandKind::In {
                continue;
            }
            let origin = module.origin_of(*v);
            let state = memory_state.entry(origin).or_default();
            num_mutated += 1;
            if state.last_seen_read.is_none() {
                num_mutated_unread += 1;
                if let Some(w) = state.last_seen_write {
                    shadowed_by.push(w);
                }
            }
            state.last_seen_write = Some(id);
            state.last_seen_read = None;
        }

        // The instruction can go if every location it mutates is unread
        // downstream; its reads are then not processed at all.
        if num_mutated > 0 && num_mutated == num_mutated_unread {
            debug!(
                instr = %module.instr(id).name,
                shadowed_by = ?shadowed_by
                    .iter()
                    .map(|&w| module.instr(w).name.clone())
                    .collect::<Vec<_>>(),
                "erasing dead store"
            );
            erased.push(id);
            continue;
        }

        // Process all operand reads.
        for (v, kind) in &ops {
            if *kind == OperandKind::Out {
                continue;
            }
            let origin = module.origin_of(*v);
            memory_state.entry(origin).or_default().last_seen_read = Some(id);
        }
    }

    erase_instructions(module, &erased);
}
