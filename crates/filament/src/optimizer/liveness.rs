//! Live-interval computation for mutable memory locations.
//!
//! A location is an activation allocation or a non-constant weight. Each
//! location maps to a list of intervals `[begin, end]` over instruction
//! indices; every fresh write that follows a use closes the current interval
//! and opens a new one, so a location written twice has two intervals.
//!
//! Indices are assigned only to non-dealloc instructions: deallocs are
//! skipped and do not advance the index. Copy propagation walks the stream
//! with the same numbering, so its interval lookups stay consistent.
//!
//! Within one instruction, operands are sorted by `(value, kind)` with
//! `In < InOut < Out` before processing. This ordering guarantees that a
//! read-modify-write of the same location extends the existing interval
//! instead of opening a spurious new one.

use std::collections::HashMap;

use smallvec::SmallVec;
use tracing::trace;

use crate::ir::{InstrKind, Module, Mutability, Operand, OperandKind, ValueRef};

/// A live interval `[begin, end]` in instruction indices.
pub type Interval = (usize, usize);

/// Live intervals for every mutable location in the module.
#[derive(Debug, Default)]
pub struct LiveIntervalsMap {
    map: HashMap<ValueRef, Vec<Interval>>,
}

impl LiveIntervalsMap {
    /// Intervals of a location, in program order. `None` for locations the
    /// analysis does not track (constant weights, views, untouched values).
    pub fn intervals(&self, v: ValueRef) -> Option<&[Interval]> {
        self.map.get(&v).map(|ivs| ivs.as_slice())
    }

    pub fn locations(&self) -> impl Iterator<Item = ValueRef> + '_ {
        self.map.keys().copied()
    }
}

/// The interval of `intervals` covering instruction index `idx`, if any.
pub fn enclosing_interval(intervals: &[Interval], idx: usize) -> Option<Interval> {
    intervals
        .iter()
        .copied()
        .find(|&(begin, end)| begin <= idx && idx <= end)
}

/// Whether `rhs` is strictly enclosed inside `lhs`.
pub fn is_enclosed_inside(lhs: Interval, rhs: Interval) -> bool {
    lhs.0 < rhs.0 && rhs.1 <= lhs.1
}

/// Compute live intervals for each mutable location.
pub fn calculate_live_intervals(module: &Module) -> LiveIntervalsMap {
    let mut liveness: HashMap<ValueRef, Vec<Interval>> = HashMap::new();
    let mut idx = 0usize;

    for &id in module.order() {
        let instr = module.instr(id);
        // Deallocations are ignored by the analysis and get no index.
        if matches!(instr.kind, InstrKind::DeallocActivation) {
            continue;
        }

        let mut sorted: SmallVec<[Operand; 6]> = instr.operands().iter().copied().collect();
        // Group operands of the same value together and process reads before
        // the write to the same location.
        sorted.sort();

        for (v, kind) in sorted {
            // Locations are direct allocation or weight references; operands
            // that name a tensor view are not tracked here (the view's own
            // source operand covers the underlying buffer).
            let loc = match v {
                ValueRef::Instr(t)
                    if matches!(module.instr(t).kind, InstrKind::AllocActivation { .. }) =>
                {
                    v
                }
                ValueRef::Weight(w)
                    if module.weight(w).mutability != Mutability::Constant =>
                {
                    v
                }
                _ => continue,
            };

            if !liveness.contains_key(&loc) {
                // A first reference must initialize the location: a write,
                // a view taken over it, or an externally initialized weight.
                debug_assert!(
                    matches!(instr.kind, InstrKind::TensorView { .. })
                        || matches!(v, ValueRef::Weight(_))
                        || kind == OperandKind::Out
                        || kind == OperandKind::InOut,
                    "first reference to %{} is a read of undefined contents",
                    module.value_name(loc)
                );
                liveness.insert(loc, vec![(idx, idx)]);
                continue;
            }

            let intervals = liveness.get_mut(&loc).expect("checked above");
            let last = intervals.last_mut().expect("interval list cannot be empty");
            // Extend the interval, unless this is a write over an interval
            // that has seen no read yet.
            if kind != OperandKind::Out || last.1 != last.0 {
                last.1 = idx;
            }
            if kind == OperandKind::In || kind == OperandKind::InOut {
                continue;
            }
            // A fresh write: end the active interval for this location and
            // begin a new one.
            intervals.push((idx, idx));
        }

        idx += 1;
    }

    // Mutable weights are observable after the program ends; extend their
    // final interval to the end.
    for (loc, intervals) in liveness.iter_mut() {
        if let ValueRef::Weight(_) = loc {
            let last = intervals.last_mut().expect("interval list cannot be empty");
            last.1 = idx;
        }
    }

    let result = LiveIntervalsMap { map: liveness };
    trace!(module = module.name(), "live intervals: {:?}", result.map);
    result
}
