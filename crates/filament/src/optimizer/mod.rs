//! IR optimization passes.
//!
//! Each pass is a self-contained sub-module operating on the linear
//! instruction stream of a [`Module`]. The top-level [`optimize`] function
//! runs the fixed pipeline in order:
//!
//! 1. peephole rewrites (expose further opportunities),
//! 2. buffer sharing (operand-level in-place reuse via liveness),
//! 3. dead-alloc sweep,
//! 4. hoist-dealloc / sink-alloc (tighten buffer lifetimes),
//! 5. weight mutability inference,
//! 6. copy propagation (interval-based coalescing),
//! 7. peephole + dead-alloc sweep + dead-store elimination + dead-alloc
//!    sweep,
//! 8. optional debug instrumentation.
//!
//! The module is verified before and after the pipeline. Every pass that
//! mutates the stream iterates over a snapshot of instruction ids or
//! collects candidates first and erases in a second walk; user-list
//! iterations that rewire operands always run on a snapshot.

use anyhow::{Context, Result};
use tracing::debug;

use crate::ir::Module;
use crate::OptimizeOptions;

// ── Shared utilities ─────────────────────────────────────────────────────────
pub(crate) mod utils;

// ── Passes ───────────────────────────────────────────────────────────────────
mod const_weights;
mod copy_prop;
mod dead_allocs;
mod dead_stores;
mod hoist_dealloc;
mod instrument;
pub mod liveness;
mod peephole;
mod share_buffers;
mod sink_allocs;

/// Optimize the module by running all passes in order.
pub fn optimize(module: &mut Module, options: &OptimizeOptions) -> Result<()> {
    module
        .verify()
        .context("IR verification failed before optimization")?;
    if !options.optimize_ir {
        return Ok(());
    }

    debug!(module = module.name(), mode = ?options.mode, "optimizing IR");

    peephole::run(module);

    // Reuse buffers from previous operations.
    share_buffers::run(module);

    // Remove unused allocations.
    dead_allocs::run(module);

    // Shorten the lifetime of buffers.
    hoist_dealloc::run(module);
    sink_allocs::run(module);

    // Turn read-only weights into constant weights.
    const_weights::run(module);

    // Coalesce copies whose source and destination lifetimes permit it.
    copy_prop::run(module);

    peephole::run(module);
    dead_allocs::run(module);
    dead_stores::run(module);
    dead_allocs::run(module);

    if options.instrument_debug {
        instrument::run(module);
    }

    module
        .verify()
        .context("IR verification failed after optimization")?;
    Ok(())
}
