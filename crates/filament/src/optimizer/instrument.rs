//! Debug instrumentation.
//!
//! Inserts a `debug_print` tap for every input operand before each
//! instruction and for every output operand after it, so a failing program
//! can be diffed tensor by tensor against a reference run. Allocs, deallocs
//! and existing `debug_print`s are left alone. Generated names follow
//! `debug_print.{before,after}.<operandName>.<instrName>`.

use smallvec::SmallVec;

use crate::ir::{InstrKind, IrBuilder, Module, Operand, OperandKind};

pub fn run(module: &mut Module) {
    let order = module.instr_ids();
    for (i, &id) in order.iter().enumerate() {
        if matches!(
            module.instr(id).kind,
            InstrKind::DebugPrint
                | InstrKind::AllocActivation { .. }
                | InstrKind::DeallocActivation
        ) {
            continue;
        }
        // The original next instruction anchors the after-prints, so they
        // land between this instruction and its successor in operand order.
        let next = order.get(i + 1).copied();
        let instr_name = module.instr(id).name.clone();

        let ops: SmallVec<[Operand; 6]> = module.instr(id).operands().iter().copied().collect();
        for (v, kind) in &ops {
            // Dump inputs of the current instruction before the instruction.
            if *kind != OperandKind::Out {
                let name = format!(
                    "debug_print.before.{}.{}",
                    module.value_name(*v),
                    instr_name
                );
                let tap = IrBuilder::new(module).debug_print(name, *v);
                module.move_before(id, tap);
            }

            // Dump outputs of the current instruction after the instruction.
            if *kind != OperandKind::In {
                let name = format!(
                    "debug_print.after.{}.{}",
                    module.value_name(*v),
                    instr_name
                );
                let tap = IrBuilder::new(module).debug_print(name, *v);
                match next {
                    Some(next) => module.move_before(next, tap),
                    // Already appended at the end of the stream.
                    None => {}
                }
            }
        }
    }
}
