//! Peephole optimizations.
//!
//! A forward scan over the stream applies local, structurally guarded
//! rewrites. A rewrite replaces the current instruction with one built
//! through the [`IrBuilder`] (which wires users), moves it into place, and
//! resumes the scan at the replacement so follow-up rewrites fire in the
//! same walk. Cleanup of values a rewrite orphans (a retyping view over an
//! unchanged type, a buffer with no remaining readers) is deliberately left
//! to the identity-view rule on a later visit and to the dead-alloc sweep;
//! the rewrites themselves stay minimal.
//!
//! | pattern | replacement |
//! |---|---|
//! | `pool_max_with_xy` with an unread xy scratch | `pool_max` |
//! | `softmax_with_e` with an unread e scratch | `softmax` |
//! | `reshape` | `tensorview` + `copy` |
//! | `transpose` of a splat-filled buffer | (`tensorview` +) `copy` |
//! | `element_max` with the splat on the left | swap operands |
//! | `tensorview` that does not change the type | forward to its source |
//! | `copy` whose operands share an origin | erase |

use tracing::debug;

use crate::ir::{InstrKind, IrBuilder, Module, OperandKind, ValueRef};

use super::utils::{replace_all_non_dealloc_users_with, single_writer};

pub fn run(module: &mut Module) {
    let mut pos = 0usize;
    while pos < module.len() {
        let id = module.order()[pos];
        let kind = module.instr(id).kind.clone();
        match kind {
            // pool_max_with_xy -> pool_max, when the xy cache is an
            // allocation with exactly 2 users: this instruction and its
            // dealloc.
            InstrKind::PoolMaxWithXY { kernel, stride, pad } => {
                let src_xy = module.instr(id).operand(2).0;
                let xy_unread = match src_xy {
                    ValueRef::Instr(x) => {
                        matches!(module.instr(x).kind, InstrKind::AllocActivation { .. })
                            && module.num_users(src_xy) == 2
                    }
                    ValueRef::Weight(_) => false,
                };
                if xy_unread {
                    let dest = module.instr(id).operand(0).0;
                    let src = module.instr(id).operand(1).0;
                    let name = module.instr(id).name.clone();
                    debug!(instr = %name, "dropping unused xy cache of pool_max_with_xy");
                    let new = IrBuilder::new(module).pool_max(name, dest, src, kernel, stride, pad);
                    module.move_before(id, new);
                    module.erase(id);
                    continue;
                }
            }

            // softmax_with_e -> softmax, when the e cache is read only by
            // this instruction.
            InstrKind::SoftMaxWithE => {
                let e = module.instr(id).operand(3).0;
                let e_origin = module.origin_of(e);
                let e_read_elsewhere = module.users(e_origin).iter().any(|u| {
                    module.instr(u.instr).operand(u.operand).1 != OperandKind::Out
                        && u.instr != id
                });
                if !e_read_elsewhere {
                    let dest = module.instr(id).operand(0).0;
                    let src = module.instr(id).operand(1).0;
                    let selected = module.instr(id).operand(2).0;
                    let name = module.instr(id).name.clone();
                    debug!(instr = %name, "dropping unused e cache of softmax_with_e");
                    let new = IrBuilder::new(module).softmax(name, dest, src, selected);
                    module.move_before(id, new);
                    module.erase(id);
                    continue;
                }
            }

            // reshape -> tensorview + copy.
            InstrKind::Reshape => {
                let dest = module.instr(id).operand(0).0;
                let src = module.instr(id).operand(1).0;
                let name = module.instr(id).name.clone();
                let dest_ty = module.value_type(dest).clone();
                debug!(instr = %name, "lowering reshape to tensorview + copy");
                let view = IrBuilder::new(module).tensor_view(name.clone(), src, dest_ty);
                module.move_before(id, view);
                let cp = IrBuilder::new(module).copy(name, dest, ValueRef::Instr(view));
                module.move_before(id, cp);
                module.erase(id);
                continue;
            }

            // A transpose of a uniform fill is still a uniform fill: only
            // the type changes, so a (retyping) copy suffices.
            InstrKind::Transpose { .. } => {
                let dest = module.instr(id).operand(0).0;
                let src = module.instr(id).operand(1).0;
                let splat_writes_src = single_writer(module, src)
                    .is_some_and(|w| matches!(module.instr(w).kind, InstrKind::Splat { .. }));
                if splat_writes_src {
                    let name = module.instr(id).name.clone();
                    debug!(instr = %name, "rewriting transpose of a splat to a copy");
                    let mut copy_src = src;
                    if module.value_type(src) != module.value_type(dest) {
                        let dest_ty = module.value_type(dest).clone();
                        let view = IrBuilder::new(module).tensor_view(name.clone(), src, dest_ty);
                        module.move_before(id, view);
                        copy_src = ValueRef::Instr(view);
                    }
                    let cp = IrBuilder::new(module).copy(name, dest, copy_src);
                    module.move_before(id, cp);
                    module.erase(id);
                    pos = module.index_of(cp);
                    continue;
                }
            }

            // Canonical form for element_max: the splat argument goes last.
            InstrKind::ElementMax => {
                let dest = module.instr(id).operand(0).0;
                let lhs = module.instr(id).operand(1).0;
                let rhs = module.instr(id).operand(2).0;
                let lhs_is_splat = single_writer(module, lhs)
                    .is_some_and(|w| matches!(module.instr(w).kind, InstrKind::Splat { .. }));
                let rhs_is_splat = single_writer(module, rhs)
                    .is_some_and(|w| matches!(module.instr(w).kind, InstrKind::Splat { .. }));
                if lhs_is_splat && !rhs_is_splat {
                    let name = module.instr(id).name.clone();
                    debug!(instr = %name, "canonicalizing element_max splat operand");
                    let new = IrBuilder::new(module).element_max(name, dest, rhs, lhs);
                    module.move_before(id, new);
                    module.erase(id);
                    continue;
                }
            }

            // A tensorview that does not change the type is equivalent to
            // its source operand.
            InstrKind::TensorView { ref ty } => {
                let src = module.instr(id).operand(0).0;
                if *ty == *module.value_type(src) && module.num_users(ValueRef::Instr(id)) > 0 {
                    debug!(
                        instr = %module.instr(id).name,
                        "forwarding identity tensorview to its source"
                    );
                    replace_all_non_dealloc_users_with(module, ValueRef::Instr(id), src);
                }
            }

            // Remove useless copies: both operands name the same buffer.
            InstrKind::Copy => {
                let dest = module.instr(id).operand(0).0;
                let src = module.instr(id).operand(1).0;
                if module.origin_of(dest) == module.origin_of(src) {
                    debug!(instr = %module.instr(id).name, "erasing self copy");
                    module.erase(id);
                    continue;
                }
            }

            _ => {}
        }
        pos += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ElemKind, Mutability, Type};

    fn fp(dims: Vec<usize>) -> Type {
        Type::new(ElemKind::Float, dims)
    }

    #[test]
    fn pool_max_with_xy_drops_unused_cache() {
        let mut m = Module::new("test");
        let win = m.create_weight("win", fp(vec![8, 8]), Mutability::Mutable);
        let wout = m.create_weight("wout", fp(vec![4, 4]), Mutability::Mutable);
        let mut b = IrBuilder::new(&mut m);
        let d = b.alloc_activation("d", fp(vec![4, 4]));
        let xy = b.alloc_activation("xy", fp(vec![4, 4, 2]));
        b.pool_max_with_xy(
            "pm",
            ValueRef::Instr(d),
            ValueRef::Weight(win),
            ValueRef::Instr(xy),
            2,
            2,
            0,
        );
        b.copy("cp", ValueRef::Weight(wout), ValueRef::Instr(d));
        b.dealloc_activation("dxy", ValueRef::Instr(xy));
        b.dealloc_activation("dd", ValueRef::Instr(d));

        run(&mut m);

        let kinds: Vec<_> = m
            .instr_ids()
            .into_iter()
            .map(|id| m.instr(id).kind.mnemonic())
            .collect();
        assert!(kinds.contains(&"pool_max"));
        assert!(!kinds.contains(&"pool_max_with_xy"));
        // Only the dealloc still references the cache.
        assert_eq!(m.num_users(ValueRef::Instr(xy)), 1);
        assert!(m.verify().is_ok());
    }

    #[test]
    fn pool_max_with_xy_kept_when_cache_read() {
        let mut m = Module::new("test");
        let win = m.create_weight("win", fp(vec![8, 8]), Mutability::Mutable);
        let wxy = m.create_weight("wxy", fp(vec![4, 4, 2]), Mutability::Mutable);
        let mut b = IrBuilder::new(&mut m);
        let d = b.alloc_activation("d", fp(vec![4, 4]));
        let xy = b.alloc_activation("xy", fp(vec![4, 4, 2]));
        let pm = b.pool_max_with_xy(
            "pm",
            ValueRef::Instr(d),
            ValueRef::Weight(win),
            ValueRef::Instr(xy),
            2,
            2,
            0,
        );
        b.copy("cpxy", ValueRef::Weight(wxy), ValueRef::Instr(xy));
        b.dealloc_activation("dxy", ValueRef::Instr(xy));
        b.dealloc_activation("dd", ValueRef::Instr(d));

        run(&mut m);
        assert!(m.contains(pm));
    }

    #[test]
    fn softmax_with_e_drops_unread_cache() {
        let mut m = Module::new("test");
        let win = m.create_weight("win", fp(vec![10]), Mutability::Mutable);
        let sel = m.create_weight("sel", Type::new(ElemKind::Index, vec![1]), Mutability::Mutable);
        let wout = m.create_weight("wout", fp(vec![10]), Mutability::Mutable);
        let mut b = IrBuilder::new(&mut m);
        let d = b.alloc_activation("d", fp(vec![10]));
        let e = b.alloc_activation("e", fp(vec![10]));
        b.softmax_with_e(
            "sm",
            ValueRef::Instr(d),
            ValueRef::Weight(win),
            ValueRef::Weight(sel),
            ValueRef::Instr(e),
        );
        b.copy("cp", ValueRef::Weight(wout), ValueRef::Instr(d));
        b.dealloc_activation("de", ValueRef::Instr(e));
        b.dealloc_activation("dd", ValueRef::Instr(d));

        run(&mut m);

        let kinds: Vec<_> = m
            .instr_ids()
            .into_iter()
            .map(|id| m.instr(id).kind.mnemonic())
            .collect();
        assert!(kinds.contains(&"softmax"));
        assert!(!kinds.contains(&"softmax_with_e"));
        assert!(m.verify().is_ok());
    }

    #[test]
    fn softmax_with_e_kept_when_cache_read() {
        let mut m = Module::new("test");
        let win = m.create_weight("win", fp(vec![10]), Mutability::Mutable);
        let sel = m.create_weight("sel", Type::new(ElemKind::Index, vec![1]), Mutability::Mutable);
        let we = m.create_weight("we", fp(vec![10]), Mutability::Mutable);
        let mut b = IrBuilder::new(&mut m);
        let d = b.alloc_activation("d", fp(vec![10]));
        let e = b.alloc_activation("e", fp(vec![10]));
        let sm = b.softmax_with_e(
            "sm",
            ValueRef::Instr(d),
            ValueRef::Weight(win),
            ValueRef::Weight(sel),
            ValueRef::Instr(e),
        );
        b.copy("cpe", ValueRef::Weight(we), ValueRef::Instr(e));
        b.dealloc_activation("de", ValueRef::Instr(e));
        b.dealloc_activation("dd", ValueRef::Instr(d));

        run(&mut m);
        assert!(m.contains(sm));
    }

    #[test]
    fn reshape_lowers_to_view_and_copy() {
        let mut m = Module::new("test");
        let wout = m.create_weight("wout", fp(vec![4]), Mutability::Mutable);
        let mut b = IrBuilder::new(&mut m);
        let s = b.alloc_activation("s", fp(vec![2, 2]));
        let d = b.alloc_activation("d", fp(vec![4]));
        b.splat("init", ValueRef::Instr(s), 1.0);
        let rs = b.reshape("rs", ValueRef::Instr(d), ValueRef::Instr(s));
        b.copy("cp", ValueRef::Weight(wout), ValueRef::Instr(d));
        b.dealloc_activation("ds", ValueRef::Instr(s));
        b.dealloc_activation("dd", ValueRef::Instr(d));

        run(&mut m);

        assert!(!m.contains(rs));
        let kinds: Vec<_> = m
            .instr_ids()
            .into_iter()
            .map(|id| m.instr(id).kind.mnemonic())
            .collect();
        let view_pos = kinds.iter().position(|&k| k == "tensorview").unwrap();
        assert_eq!(kinds[view_pos + 1], "copy");
        // The view retypes the source to the destination's type.
        let view_id = m.instr_ids()[view_pos];
        assert_eq!(*m.value_type(ValueRef::Instr(view_id)), fp(vec![4]));
        assert!(m.verify().is_ok());
    }

    #[test]
    fn transpose_of_splat_becomes_copy() {
        let mut m = Module::new("test");
        let wout = m.create_weight("wout", fp(vec![3, 2]), Mutability::Mutable);
        let mut b = IrBuilder::new(&mut m);
        let s = b.alloc_activation("s", fp(vec![2, 3]));
        let d = b.alloc_activation("d", fp(vec![3, 2]));
        b.splat("fill", ValueRef::Instr(s), 0.5);
        let tr = b.transpose("tr", ValueRef::Instr(d), ValueRef::Instr(s), vec![1, 0]);
        b.copy("cp", ValueRef::Weight(wout), ValueRef::Instr(d));
        b.dealloc_activation("ds", ValueRef::Instr(s));
        b.dealloc_activation("dd", ValueRef::Instr(d));

        run(&mut m);

        assert!(!m.contains(tr));
        let kinds: Vec<_> = m
            .instr_ids()
            .into_iter()
            .map(|id| m.instr(id).kind.mnemonic())
            .collect();
        // Types differ, so a retyping view feeds the copy.
        assert!(kinds.contains(&"tensorview"));
        assert!(!kinds.contains(&"transpose"));
        assert!(m.verify().is_ok());
    }

    #[test]
    fn transpose_of_computed_value_kept() {
        let mut m = Module::new("test");
        let win = m.create_weight("win", fp(vec![2, 3]), Mutability::Mutable);
        let wout = m.create_weight("wout", fp(vec![3, 2]), Mutability::Mutable);
        let mut b = IrBuilder::new(&mut m);
        let s = b.alloc_activation("s", fp(vec![2, 3]));
        let d = b.alloc_activation("d", fp(vec![3, 2]));
        b.relu("r", ValueRef::Instr(s), ValueRef::Weight(win));
        let tr = b.transpose("tr", ValueRef::Instr(d), ValueRef::Instr(s), vec![1, 0]);
        b.copy("cp", ValueRef::Weight(wout), ValueRef::Instr(d));
        b.dealloc_activation("ds", ValueRef::Instr(s));
        b.dealloc_activation("dd", ValueRef::Instr(d));

        run(&mut m);
        assert!(m.contains(tr));
    }

    #[test]
    fn element_max_splat_moves_right() {
        let mut m = Module::new("test");
        let win = m.create_weight("win", fp(vec![4]), Mutability::Mutable);
        let wout = m.create_weight("wout", fp(vec![4]), Mutability::Mutable);
        let mut b = IrBuilder::new(&mut m);
        let l = b.alloc_activation("l", fp(vec![4]));
        let r = b.alloc_activation("r", fp(vec![4]));
        let d = b.alloc_activation("d", fp(vec![4]));
        b.splat("k", ValueRef::Instr(l), 0.0);
        b.relu("load", ValueRef::Instr(r), ValueRef::Weight(win));
        let em = b.element_max("max", ValueRef::Instr(d), ValueRef::Instr(l), ValueRef::Instr(r));
        b.copy("cp", ValueRef::Weight(wout), ValueRef::Instr(d));
        b.dealloc_activation("dl", ValueRef::Instr(l));
        b.dealloc_activation("dr", ValueRef::Instr(r));
        b.dealloc_activation("dd", ValueRef::Instr(d));

        run(&mut m);

        assert!(!m.contains(em));
        let new_em = m
            .instr_ids()
            .into_iter()
            .find(|&id| matches!(m.instr(id).kind, InstrKind::ElementMax))
            .unwrap();
        // The splat-filled buffer is now the right operand.
        assert_eq!(m.instr(new_em).operand(1).0, ValueRef::Instr(r));
        assert_eq!(m.instr(new_em).operand(2).0, ValueRef::Instr(l));
        assert!(m.verify().is_ok());
    }

    #[test]
    fn element_max_of_two_splats_untouched() {
        let mut m = Module::new("test");
        let wout = m.create_weight("wout", fp(vec![4]), Mutability::Mutable);
        let mut b = IrBuilder::new(&mut m);
        let l = b.alloc_activation("l", fp(vec![4]));
        let r = b.alloc_activation("r", fp(vec![4]));
        let d = b.alloc_activation("d", fp(vec![4]));
        b.splat("kl", ValueRef::Instr(l), 0.0);
        b.splat("kr", ValueRef::Instr(r), 1.0);
        let em = b.element_max("max", ValueRef::Instr(d), ValueRef::Instr(l), ValueRef::Instr(r));
        b.copy("cp", ValueRef::Weight(wout), ValueRef::Instr(d));
        b.dealloc_activation("dl", ValueRef::Instr(l));
        b.dealloc_activation("dr", ValueRef::Instr(r));
        b.dealloc_activation("dd", ValueRef::Instr(d));

        run(&mut m);
        assert!(m.contains(em));
    }

    #[test]
    fn identity_view_forwarded_to_source() {
        let mut m = Module::new("test");
        let wout = m.create_weight("wout", fp(vec![4]), Mutability::Mutable);
        let mut b = IrBuilder::new(&mut m);
        let a = b.alloc_activation("a", fp(vec![4]));
        b.splat("s", ValueRef::Instr(a), 1.0);
        let v = b.tensor_view("v", ValueRef::Instr(a), fp(vec![4]));
        let cp = b.copy("cp", ValueRef::Weight(wout), ValueRef::Instr(v));
        b.dealloc_activation("da", ValueRef::Instr(a));

        run(&mut m);

        // The copy reads the allocation directly; the orphaned view is left
        // for the dead-alloc sweep.
        assert_eq!(m.instr(cp).operand(1).0, ValueRef::Instr(a));
        assert_eq!(m.num_users(ValueRef::Instr(v)), 0);
        assert!(m.verify().is_ok());
    }

    #[test]
    fn self_copy_through_views_erased() {
        let mut m = Module::new("test");
        let mut b = IrBuilder::new(&mut m);
        let a = b.alloc_activation("a", fp(vec![2, 2]));
        b.splat("s", ValueRef::Instr(a), 1.0);
        let v1 = b.tensor_view("v1", ValueRef::Instr(a), fp(vec![4]));
        let v2 = b.tensor_view("v2", ValueRef::Instr(a), fp(vec![4]));
        let cp = b.copy("cp", ValueRef::Instr(v1), ValueRef::Instr(v2));
        b.dealloc_activation("da", ValueRef::Instr(a));

        run(&mut m);
        assert!(!m.contains(cp));
        assert!(m.verify().is_ok());
    }
}
