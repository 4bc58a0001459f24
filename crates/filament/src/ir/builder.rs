//! IR builder.
//!
//! The only way instructions enter a [`Module`]: each factory method creates
//! a kind-tagged instruction, appends it to the end of the stream, and wires
//! the user edges of its operands. Callers that need a different position
//! (the peephole rewriter, debug instrumentation) move the instruction
//! afterwards with [`Module::move_before`] / [`Module::insert_before`];
//! movement preserves identity and user edges.

use super::types::{Instr, InstrId, InstrKind, Module, Operand, OperandKind, Type, ValueRef};

pub struct IrBuilder<'m> {
    module: &'m mut Module,
}

impl<'m> IrBuilder<'m> {
    pub fn new(module: &'m mut Module) -> Self {
        Self { module }
    }

    fn push(&mut self, name: impl Into<String>, kind: InstrKind, operands: Vec<Operand>) -> InstrId {
        self.module.push_instr(Instr {
            name: name.into(),
            kind,
            operands,
            users: Vec::new(),
        })
    }

    // ─── Memory ──────────────────────────────────────────────────────────

    pub fn alloc_activation(&mut self, name: impl Into<String>, ty: Type) -> InstrId {
        self.push(name, InstrKind::AllocActivation { ty }, vec![])
    }

    pub fn dealloc_activation(&mut self, name: impl Into<String>, alloc: ValueRef) -> InstrId {
        self.push(
            name,
            InstrKind::DeallocActivation,
            vec![(alloc, OperandKind::Out)],
        )
    }

    pub fn tensor_view(&mut self, name: impl Into<String>, src: ValueRef, ty: Type) -> InstrId {
        self.push(
            name,
            InstrKind::TensorView { ty },
            vec![(src, OperandKind::In)],
        )
    }

    // ─── Data movement ───────────────────────────────────────────────────

    pub fn copy(&mut self, name: impl Into<String>, dest: ValueRef, src: ValueRef) -> InstrId {
        self.push(
            name,
            InstrKind::Copy,
            vec![(dest, OperandKind::Out), (src, OperandKind::In)],
        )
    }

    pub fn splat(&mut self, name: impl Into<String>, dest: ValueRef, value: f32) -> InstrId {
        self.push(
            name,
            InstrKind::Splat { value },
            vec![(dest, OperandKind::Out)],
        )
    }

    pub fn reshape(&mut self, name: impl Into<String>, dest: ValueRef, src: ValueRef) -> InstrId {
        self.push(
            name,
            InstrKind::Reshape,
            vec![(dest, OperandKind::Out), (src, OperandKind::In)],
        )
    }

    pub fn transpose(
        &mut self,
        name: impl Into<String>,
        dest: ValueRef,
        src: ValueRef,
        shuffle: Vec<usize>,
    ) -> InstrId {
        self.push(
            name,
            InstrKind::Transpose { shuffle },
            vec![(dest, OperandKind::Out), (src, OperandKind::In)],
        )
    }

    // ─── Elementwise ─────────────────────────────────────────────────────

    fn element(
        &mut self,
        name: impl Into<String>,
        kind: InstrKind,
        dest: ValueRef,
        lhs: ValueRef,
        rhs: ValueRef,
    ) -> InstrId {
        self.push(
            name,
            kind,
            vec![
                (dest, OperandKind::Out),
                (lhs, OperandKind::In),
                (rhs, OperandKind::In),
            ],
        )
    }

    pub fn element_add(
        &mut self,
        name: impl Into<String>,
        dest: ValueRef,
        lhs: ValueRef,
        rhs: ValueRef,
    ) -> InstrId {
        self.element(name, InstrKind::ElementAdd, dest, lhs, rhs)
    }

    pub fn element_sub(
        &mut self,
        name: impl Into<String>,
        dest: ValueRef,
        lhs: ValueRef,
        rhs: ValueRef,
    ) -> InstrId {
        self.element(name, InstrKind::ElementSub, dest, lhs, rhs)
    }

    pub fn element_mul(
        &mut self,
        name: impl Into<String>,
        dest: ValueRef,
        lhs: ValueRef,
        rhs: ValueRef,
    ) -> InstrId {
        self.element(name, InstrKind::ElementMul, dest, lhs, rhs)
    }

    pub fn element_div(
        &mut self,
        name: impl Into<String>,
        dest: ValueRef,
        lhs: ValueRef,
        rhs: ValueRef,
    ) -> InstrId {
        self.element(name, InstrKind::ElementDiv, dest, lhs, rhs)
    }

    pub fn element_max(
        &mut self,
        name: impl Into<String>,
        dest: ValueRef,
        lhs: ValueRef,
        rhs: ValueRef,
    ) -> InstrId {
        self.element(name, InstrKind::ElementMax, dest, lhs, rhs)
    }

    fn unary(
        &mut self,
        name: impl Into<String>,
        kind: InstrKind,
        dest: ValueRef,
        src: ValueRef,
    ) -> InstrId {
        self.push(
            name,
            kind,
            vec![(dest, OperandKind::Out), (src, OperandKind::In)],
        )
    }

    pub fn relu(&mut self, name: impl Into<String>, dest: ValueRef, src: ValueRef) -> InstrId {
        self.unary(name, InstrKind::Relu, dest, src)
    }

    pub fn sigmoid(&mut self, name: impl Into<String>, dest: ValueRef, src: ValueRef) -> InstrId {
        self.unary(name, InstrKind::Sigmoid, dest, src)
    }

    pub fn tanh(&mut self, name: impl Into<String>, dest: ValueRef, src: ValueRef) -> InstrId {
        self.unary(name, InstrKind::Tanh, dest, src)
    }

    // ─── Layers ──────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn convolution(
        &mut self,
        name: impl Into<String>,
        dest: ValueRef,
        src: ValueRef,
        filter: ValueRef,
        bias: ValueRef,
        kernel: usize,
        stride: usize,
        pad: usize,
    ) -> InstrId {
        self.push(
            name,
            InstrKind::Convolution { kernel, stride, pad },
            vec![
                (dest, OperandKind::Out),
                (src, OperandKind::In),
                (filter, OperandKind::In),
                (bias, OperandKind::In),
            ],
        )
    }

    pub fn fully_connected(
        &mut self,
        name: impl Into<String>,
        dest: ValueRef,
        src: ValueRef,
        filter: ValueRef,
        bias: ValueRef,
        depth: usize,
    ) -> InstrId {
        self.push(
            name,
            InstrKind::FullyConnected { depth },
            vec![
                (dest, OperandKind::Out),
                (src, OperandKind::In),
                (filter, OperandKind::In),
                (bias, OperandKind::In),
            ],
        )
    }

    pub fn pool_max(
        &mut self,
        name: impl Into<String>,
        dest: ValueRef,
        src: ValueRef,
        kernel: usize,
        stride: usize,
        pad: usize,
    ) -> InstrId {
        self.push(
            name,
            InstrKind::PoolMax { kernel, stride, pad },
            vec![(dest, OperandKind::Out), (src, OperandKind::In)],
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn pool_max_with_xy(
        &mut self,
        name: impl Into<String>,
        dest: ValueRef,
        src: ValueRef,
        src_xy: ValueRef,
        kernel: usize,
        stride: usize,
        pad: usize,
    ) -> InstrId {
        self.push(
            name,
            InstrKind::PoolMaxWithXY { kernel, stride, pad },
            vec![
                (dest, OperandKind::Out),
                (src, OperandKind::In),
                (src_xy, OperandKind::Out),
            ],
        )
    }

    pub fn pool_avg(
        &mut self,
        name: impl Into<String>,
        dest: ValueRef,
        src: ValueRef,
        kernel: usize,
        stride: usize,
        pad: usize,
    ) -> InstrId {
        self.push(
            name,
            InstrKind::PoolAvg { kernel, stride, pad },
            vec![(dest, OperandKind::Out), (src, OperandKind::In)],
        )
    }

    pub fn softmax(
        &mut self,
        name: impl Into<String>,
        dest: ValueRef,
        src: ValueRef,
        selected: ValueRef,
    ) -> InstrId {
        self.push(
            name,
            InstrKind::SoftMax,
            vec![
                (dest, OperandKind::Out),
                (src, OperandKind::In),
                (selected, OperandKind::In),
            ],
        )
    }

    pub fn softmax_with_e(
        &mut self,
        name: impl Into<String>,
        dest: ValueRef,
        src: ValueRef,
        selected: ValueRef,
        e: ValueRef,
    ) -> InstrId {
        self.push(
            name,
            InstrKind::SoftMaxWithE,
            vec![
                (dest, OperandKind::Out),
                (src, OperandKind::In),
                (selected, OperandKind::In),
                (e, OperandKind::Out),
            ],
        )
    }

    // ─── Diagnostics ─────────────────────────────────────────────────────

    pub fn debug_print(&mut self, name: impl Into<String>, src: ValueRef) -> InstrId {
        self.push(name, InstrKind::DebugPrint, vec![(src, OperandKind::In)])
    }
}
