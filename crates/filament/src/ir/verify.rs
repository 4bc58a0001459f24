//! Module well-formedness verification.
//!
//! `Module::verify` checks the invariants every pass must preserve:
//!
//! 1. Every operand resolves, through tensor-view chains, to a weight or an
//!    activation allocation present in the module.
//! 2. Each allocation has at most one dealloc; the dealloc follows the alloc
//!    and every use of the allocation lies between them.
//! 3. Constant weights appear only in `@in` operand slots.
//! 4. Tensor views are pure metadata: a single `@in` operand.
//! 5. User lists match the operand references in the stream exactly.
//!
//! The optimizer runs this before and after the pipeline; tests run it after
//! every individual pass.

use std::collections::{HashMap, HashSet};

use anyhow::{bail, ensure, Result};

use super::types::{InstrId, InstrKind, Module, Mutability, OperandKind, Use, ValueRef};

impl Module {
    pub fn verify(&self) -> Result<()> {
        self.verify_stream()?;
        self.verify_users()?;
        self.verify_operands()?;
        self.verify_alloc_lifetimes()?;
        self.verify_const_weights()?;
        Ok(())
    }

    /// Program order references live slots, without duplicates, and no live
    /// slot is missing from program order (a detached instruction that was
    /// never reinserted).
    fn verify_stream(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for &id in self.order() {
            ensure!(
                self.contains(id),
                "instruction stream references an erased slot {:?}",
                id
            );
            ensure!(
                seen.insert(id),
                "instruction %{} appears twice in the stream",
                self.instr(id).name
            );
        }
        for id in self.arena_ids() {
            ensure!(
                seen.contains(&id),
                "instruction %{} is detached from the stream",
                self.instr(id).name
            );
        }
        Ok(())
    }

    /// The user list of every value matches the operand references.
    fn verify_users(&self) -> Result<()> {
        let mut expected: HashMap<ValueRef, Vec<Use>> = HashMap::new();
        for &id in self.order() {
            for (i, (v, _)) in self.instr(id).operands().iter().enumerate() {
                expected
                    .entry(*v)
                    .or_default()
                    .push(Use { instr: id, operand: i });
            }
        }

        let check = |v: ValueRef, name: &str| -> Result<()> {
            let mut stored: Vec<Use> = self.users(v).to_vec();
            let mut want: Vec<Use> = expected.get(&v).cloned().unwrap_or_default();
            stored.sort();
            want.sort();
            ensure!(
                stored == want,
                "stale user list on %{}: stored {:?}, stream has {:?}",
                name,
                stored,
                want
            );
            Ok(())
        };

        for w in self.weight_ids() {
            check(ValueRef::Weight(w), &self.weight(w).name)?;
        }
        for &id in self.order() {
            let instr = self.instr(id);
            if instr.kind.defines_value() {
                check(ValueRef::Instr(id), &instr.name)?;
            } else {
                ensure!(
                    instr.users().is_empty(),
                    "%{} defines no value but has users",
                    instr.name
                );
            }
        }
        Ok(())
    }

    /// Operands reference weights, allocations, or views whose
    /// chain of sources terminates at one of those two; views carry exactly
    /// one `@in` operand.
    fn verify_operands(&self) -> Result<()> {
        let chain_limit = self.len() + 1;
        for &id in self.order() {
            let instr = self.instr(id);
            if let InstrKind::TensorView { .. } = instr.kind {
                ensure!(
                    instr.num_operands() == 1 && instr.operand(0).1 == OperandKind::In,
                    "tensor view %{} must have a single @in operand",
                    instr.name
                );
            }
            for (v, _) in instr.operands() {
                // Walk the view chain with a bound so a malformed cycle
                // reports instead of hanging.
                let mut cur = *v;
                let mut steps = 0;
                loop {
                    match cur {
                        ValueRef::Weight(_) => break,
                        ValueRef::Instr(t) => {
                            ensure!(
                                self.contains(t),
                                "%{} references an erased instruction",
                                instr.name
                            );
                            match self.instr(t).kind {
                                InstrKind::AllocActivation { .. } => break,
                                InstrKind::TensorView { .. } => {
                                    ensure!(
                                        steps < chain_limit,
                                        "tensor view cycle reached from %{}",
                                        instr.name
                                    );
                                    steps += 1;
                                    cur = self.instr(t).operand(0).0;
                                }
                                ref other => bail!(
                                    "%{} references %{}, a {} that defines no value",
                                    instr.name,
                                    self.instr(t).name,
                                    other.mnemonic()
                                ),
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Alloc/dealloc pairing and enclosure of all uses.
    fn verify_alloc_lifetimes(&self) -> Result<()> {
        let pos: HashMap<InstrId, usize> = self
            .order()
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, i))
            .collect();

        for &id in self.order() {
            if !matches!(self.instr(id).kind, InstrKind::AllocActivation { .. }) {
                continue;
            }
            let alloc_pos = pos[&id];
            let deallocs: Vec<InstrId> = self
                .instr(id)
                .users()
                .iter()
                .map(|u| u.instr)
                .filter(|&u| matches!(self.instr(u).kind, InstrKind::DeallocActivation))
                .collect();
            ensure!(
                deallocs.len() <= 1,
                "allocation %{} has {} deallocs",
                self.instr(id).name,
                deallocs.len()
            );
            let dealloc_pos = deallocs.first().map(|d| pos[d]);
            if let Some(dp) = dealloc_pos {
                ensure!(
                    dp > alloc_pos,
                    "dealloc of %{} precedes the allocation",
                    self.instr(id).name
                );
            }

            // Any use, direct or through a view chain, must sit inside the
            // allocation's lifetime.
            for &user in self.order() {
                for (v, _) in self.instr(user).operands() {
                    if self.allocation_origin(*v) != Some(id) {
                        continue;
                    }
                    let p = pos[&user];
                    ensure!(
                        p >= alloc_pos,
                        "%{} uses %{} before its allocation",
                        self.instr(user).name,
                        self.instr(id).name
                    );
                    if let Some(dp) = dealloc_pos {
                        ensure!(
                            p <= dp,
                            "%{} uses %{} after its deallocation",
                            self.instr(user).name,
                            self.instr(id).name
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Constant weights are read-only.
    fn verify_const_weights(&self) -> Result<()> {
        for w in self.weight_ids() {
            if self.weight(w).mutability != Mutability::Constant {
                continue;
            }
            for u in self.weight(w).users() {
                let kind = self.instr(u.instr).operand(u.operand).1;
                ensure!(
                    kind == OperandKind::In,
                    "constant weight %{} is written by %{}",
                    self.weight(w).name,
                    self.instr(u.instr).name
                );
            }
        }
        Ok(())
    }
}
