//! Shared utility functions for IR optimization passes.

use smallvec::SmallVec;

use crate::ir::{InstrId, InstrKind, Module, OperandKind, Use, ValueRef};

/// Replace every use of `val` with `with`, except uses inside dealloc
/// instructions: rewiring those would break the alloc/dealloc pairing the
/// IR's well-formedness depends on.
///
/// The user list is snapshotted first: rewiring an operand mutates the user
/// list, which would otherwise invalidate the iteration.
pub fn replace_all_non_dealloc_users_with(module: &mut Module, val: ValueRef, with: ValueRef) {
    assert_ne!(val, with, "replacing a value with itself");
    let users: SmallVec<[Use; 6]> = module.users(val).iter().copied().collect();
    for u in users {
        if matches!(module.instr(u.instr).kind, InstrKind::DeallocActivation) {
            continue;
        }
        module.set_operand(u.instr, u.operand, with);
    }
}

/// The single instruction that writes into `v`, or `None` if the number of
/// writers is not exactly one. Deallocs and read-only uses are ignored.
pub fn single_writer(module: &Module, v: ValueRef) -> Option<InstrId> {
    let mut writer = None;
    for u in module.users(v) {
        let instr = module.instr(u.instr);
        if matches!(instr.kind, InstrKind::DeallocActivation) {
            continue;
        }
        if instr.operand(u.operand).1 == OperandKind::In {
            continue;
        }
        if writer.is_some() {
            return None;
        }
        writer = Some(u.instr);
    }
    writer
}

/// Erase every instruction in `ids`, in order.
pub fn erase_instructions(module: &mut Module, ids: &[InstrId]) {
    for &id in ids {
        module.erase(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ElemKind, IrBuilder, Module, Type};

    fn fp(dims: Vec<usize>) -> Type {
        Type::new(ElemKind::Float, dims)
    }

    #[test]
    fn replace_skips_deallocs() {
        let mut m = Module::new("test");
        let mut b = IrBuilder::new(&mut m);
        let a = b.alloc_activation("a", fp(vec![4]));
        let c = b.alloc_activation("c", fp(vec![4]));
        let s = b.splat("s", ValueRef::Instr(a), 1.0);
        let da = b.dealloc_activation("da", ValueRef::Instr(a));
        b.dealloc_activation("dc", ValueRef::Instr(c));

        replace_all_non_dealloc_users_with(&mut m, ValueRef::Instr(a), ValueRef::Instr(c));

        // The splat now writes c, but a's dealloc still references a.
        assert_eq!(m.instr(s).operand(0).0, ValueRef::Instr(c));
        assert_eq!(m.instr(da).operand(0).0, ValueRef::Instr(a));
        assert_eq!(m.num_users(ValueRef::Instr(a)), 1);
    }

    #[test]
    fn single_writer_counts_out_and_inout() {
        let mut m = Module::new("test");
        let mut b = IrBuilder::new(&mut m);
        let a = b.alloc_activation("a", fp(vec![4]));
        let x = b.alloc_activation("x", fp(vec![4]));
        let s = b.splat("s", ValueRef::Instr(a), 1.0);
        b.copy("rd", ValueRef::Instr(x), ValueRef::Instr(a));
        b.dealloc_activation("da", ValueRef::Instr(a));

        // One writer (the splat): reads and the dealloc don't count.
        assert_eq!(single_writer(&m, ValueRef::Instr(a)), Some(s));

        // A second writer disqualifies.
        let mut b = IrBuilder::new(&mut m);
        b.splat("s2", ValueRef::Instr(a), 2.0);
        assert_eq!(single_writer(&m, ValueRef::Instr(a)), None);
    }

    #[test]
    fn single_writer_none_for_unwritten() {
        let mut m = Module::new("test");
        let mut b = IrBuilder::new(&mut m);
        let a = b.alloc_activation("a", fp(vec![4]));
        let x = b.alloc_activation("x", fp(vec![4]));
        b.copy("rd", ValueRef::Instr(x), ValueRef::Instr(a));
        assert_eq!(single_writer(&m, ValueRef::Instr(a)), None);
    }
}
