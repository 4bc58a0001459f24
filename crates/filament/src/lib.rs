//! filament: the low-level IR optimizer of a neural-network inference compiler.
//!
//! This crate takes a fully materialized linear IR module (one straight-line
//! block of tensor instructions over weight variables and activation
//! buffers) and rewrites it to shorten buffer lifetimes, reuse buffer
//! storage in place, eliminate redundant copies, dead stores and dead
//! allocations, and canonicalize instruction patterns.
//!
//! The surrounding compiler produces the [`ir::Module`] (graph lowering) and
//! consumes it after [`optimize`] returns (code generation, execution). The
//! optimizer borrows the module exclusively for the duration of the call.

pub mod ir;
pub mod optimizer;

// Re-export key types for convenience
pub use anyhow::{Context, Result};

/// What the surrounding compilation is for. Carried through the optimizer;
/// does not alter the pass set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilationMode {
    Train,
    Infer,
}

/// Configuration options for IR optimization.
#[derive(Debug, Clone)]
pub struct OptimizeOptions {
    /// Run the optimization pipeline. When false, `optimize` only verifies.
    pub optimize_ir: bool,
    /// Insert a `debug_print` tap before and after every instruction's
    /// operands.
    pub instrument_debug: bool,
    /// Compilation mode.
    pub mode: CompilationMode,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            optimize_ir: true,
            instrument_debug: false,
            mode: CompilationMode::Infer,
        }
    }
}

/// Optimize a linear-IR module in place.
///
/// Verifies the module before and after the pipeline; a verification failure
/// means the producer handed over (or a pass produced) ill-formed IR and is
/// reported as an error.
pub fn optimize(module: &mut ir::Module, options: &OptimizeOptions) -> Result<()> {
    optimizer::optimize(module, options)
}
