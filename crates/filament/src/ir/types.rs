//! IR type definitions.
//!
//! These types represent a linearized, single-basic-block program of tensor
//! instructions. Instructions reference named memory locations: weight
//! variables (externally visible, program-lifetime) and activation buffers
//! (compiler-introduced, delimited by an alloc/dealloc pair). Each operand
//! carries an access mode (`@in`, `@inout`, `@out`) that the optimizer's
//! liveness and sharing analyses rely on.
//!
//! Ownership is flat: the [`Module`] owns every instruction in an arena and
//! every weight in a table. Operands hold [`ValueRef`] handles, and every
//! referenced value keeps a back-list of [`Use`] edges. The two directions
//! are kept consistent by routing all rewrites through
//! [`Module::set_operand`].

use std::fmt;

/// Unique identifier for an instruction in the module's arena.
///
/// An `InstrId` stays valid across moves within the instruction stream; it is
/// invalidated only by [`Module::erase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrId(pub u32);

/// Unique identifier for a weight variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WeightId(pub u32);

/// Anything addressable by an instruction operand.
///
/// Only weights and value-defining instructions ([`InstrKind::AllocActivation`]
/// and [`InstrKind::TensorView`]) may be referenced; `Module::verify` enforces
/// this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueRef {
    Weight(WeightId),
    Instr(InstrId),
}

/// Access mode of an operand slot.
///
/// The declaration order is load-bearing: liveness analysis sorts operands by
/// `(value, kind)` so that reads of a location are processed before the write
/// to the same location within one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperandKind {
    In,
    InOut,
    Out,
}

impl fmt::Display for OperandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperandKind::In => write!(f, "@in"),
            OperandKind::InOut => write!(f, "@inout"),
            OperandKind::Out => write!(f, "@out"),
        }
    }
}

/// An operand: a value handle plus its access mode.
pub type Operand = (ValueRef, OperandKind);

/// A use edge: which instruction references a value, and through which
/// operand slot. The slot index recovers the [`OperandKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Use {
    pub instr: InstrId,
    pub operand: usize,
}

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemKind {
    Float,
    Int8,
    Index,
}

impl fmt::Display for ElemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElemKind::Float => write!(f, "float"),
            ElemKind::Int8 => write!(f, "i8"),
            ElemKind::Index => write!(f, "index"),
        }
    }
}

/// A tensor type: element kind plus dimensions. Equality is structural.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type {
    pub elem: ElemKind,
    pub dims: Vec<usize>,
}

impl Type {
    pub fn new(elem: ElemKind, dims: Vec<usize>) -> Self {
        Self { elem, dims }
    }

    /// Number of elements in a tensor of this type.
    pub fn size(&self) -> usize {
        self.dims.iter().product()
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<", self.elem)?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, " x ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, ">")
    }
}

/// Whether a weight may be written by the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutability {
    Constant,
    Mutable,
}

/// A named, externally visible tensor location. Its lifetime spans the whole
/// program, so the optimizer must preserve the last store into any mutable
/// weight.
#[derive(Debug, Clone)]
pub struct WeightVar {
    pub name: String,
    pub ty: Type,
    pub mutability: Mutability,
    pub(crate) users: Vec<Use>,
}

impl WeightVar {
    pub fn users(&self) -> &[Use] {
        &self.users
    }
}

/// The closed instruction kind set, with per-kind metadata payloads.
///
/// Operand slot conventions (dest first):
///
/// | kind | operands |
/// |---|---|
/// | `DeallocActivation` | alloc `@out` |
/// | `TensorView` | src `@in` |
/// | `Copy` | dest `@out`, src `@in` |
/// | `Splat` | dest `@out` |
/// | `Reshape`/`Transpose`/`Relu`/`Sigmoid`/`Tanh` | dest `@out`, src `@in` |
/// | `Element*` | dest `@out`, lhs `@in`, rhs `@in` |
/// | `Convolution`/`FullyConnected` | dest `@out`, src `@in`, filter `@in`, bias `@in` |
/// | `PoolMax`/`PoolAvg` | dest `@out`, src `@in` |
/// | `PoolMaxWithXY` | dest `@out`, src `@in`, src_xy `@out` |
/// | `SoftMax` | dest `@out`, src `@in`, selected `@in` |
/// | `SoftMaxWithE` | dest `@out`, src `@in`, selected `@in`, e `@out` |
/// | `DebugPrint` | src `@in` |
#[derive(Debug, Clone, PartialEq)]
pub enum InstrKind {
    /// Defines an activation buffer. The buffer's contents are undefined
    /// until the first write.
    AllocActivation { ty: Type },
    /// Releases an activation buffer. At most one per allocation.
    DeallocActivation,
    /// Zero-copy reinterpretation of another value. Pure metadata: reads and
    /// writes no buffer content.
    TensorView { ty: Type },
    Copy,
    Splat { value: f32 },
    Reshape,
    Transpose { shuffle: Vec<usize> },
    ElementAdd,
    ElementSub,
    ElementMul,
    ElementDiv,
    ElementMax,
    Relu,
    Sigmoid,
    Tanh,
    Convolution { kernel: usize, stride: usize, pad: usize },
    PoolMax { kernel: usize, stride: usize, pad: usize },
    PoolMaxWithXY { kernel: usize, stride: usize, pad: usize },
    PoolAvg { kernel: usize, stride: usize, pad: usize },
    FullyConnected { depth: usize },
    SoftMax,
    SoftMaxWithE,
    DebugPrint,
}

impl InstrKind {
    /// Short lowercase name used in textual dumps and derived names.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            InstrKind::AllocActivation { .. } => "allocactivation",
            InstrKind::DeallocActivation => "deallocactivation",
            InstrKind::TensorView { .. } => "tensorview",
            InstrKind::Copy => "copy",
            InstrKind::Splat { .. } => "splat",
            InstrKind::Reshape => "reshape",
            InstrKind::Transpose { .. } => "transpose",
            InstrKind::ElementAdd => "element_add",
            InstrKind::ElementSub => "element_sub",
            InstrKind::ElementMul => "element_mul",
            InstrKind::ElementDiv => "element_div",
            InstrKind::ElementMax => "element_max",
            InstrKind::Relu => "relu",
            InstrKind::Sigmoid => "sigmoid",
            InstrKind::Tanh => "tanh",
            InstrKind::Convolution { .. } => "convolution",
            InstrKind::PoolMax { .. } => "pool_max",
            InstrKind::PoolMaxWithXY { .. } => "pool_max_with_xy",
            InstrKind::PoolAvg { .. } => "pool_avg",
            InstrKind::FullyConnected { .. } => "fully_connected",
            InstrKind::SoftMax => "softmax",
            InstrKind::SoftMaxWithE => "softmax_with_e",
            InstrKind::DebugPrint => "debug_print",
        }
    }

    /// Whether this instruction defines a value that operands may reference.
    pub fn defines_value(&self) -> bool {
        matches!(
            self,
            InstrKind::AllocActivation { .. } | InstrKind::TensorView { .. }
        )
    }
}

/// An instruction: common header (name, operands, kind) plus the user list
/// of the value it defines (empty for non-value-defining kinds).
#[derive(Debug, Clone)]
pub struct Instr {
    pub name: String,
    pub kind: InstrKind,
    pub(crate) operands: Vec<Operand>,
    pub(crate) users: Vec<Use>,
}

impl Instr {
    pub fn operands(&self) -> &[Operand] {
        &self.operands
    }

    pub fn operand(&self, i: usize) -> Operand {
        self.operands[i]
    }

    pub fn num_operands(&self) -> usize {
        self.operands.len()
    }

    /// Uses of the value defined by this instruction.
    pub fn users(&self) -> &[Use] {
        &self.users
    }

    pub fn num_users(&self) -> usize {
        self.users.len()
    }

    /// Whether the operand slot pair `(dst, src)` of this instruction kind
    /// tolerates aliasing the two buffers, i.e. whether the operation may be
    /// computed in place.
    ///
    /// Elementwise kinds read each input element exactly once before writing
    /// the corresponding output element, so the destination may share storage
    /// with either input. Everything else (copies, convolutions, pools,
    /// softmax, transposes) reads and writes with offsets and permits none.
    pub fn is_inplace_op(&self, dst: usize, src: usize) -> bool {
        match self.kind {
            InstrKind::ElementAdd
            | InstrKind::ElementSub
            | InstrKind::ElementMul
            | InstrKind::ElementDiv
            | InstrKind::ElementMax => dst == 0 && (src == 1 || src == 2),
            InstrKind::Relu | InstrKind::Sigmoid | InstrKind::Tanh => dst == 0 && src == 1,
            _ => false,
        }
    }
}

/// The linear-IR carrier: one instruction stream plus the weight variables
/// it references.
///
/// Instructions live in a slot arena indexed by [`InstrId`]; `order` gives
/// program order. Erasing an instruction vacates its slot, so an `InstrId`
/// is never reused within one module.
#[derive(Debug, Clone, Default)]
pub struct Module {
    name: String,
    weights: Vec<WeightVar>,
    instrs: Vec<Option<Instr>>,
    order: Vec<InstrId>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weights: Vec::new(),
            instrs: Vec::new(),
            order: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ─── Weights ─────────────────────────────────────────────────────────

    /// Register a weight variable. Weights are created before the optimizer
    /// runs and are never erased.
    pub fn create_weight(
        &mut self,
        name: impl Into<String>,
        ty: Type,
        mutability: Mutability,
    ) -> WeightId {
        let id = WeightId(self.weights.len() as u32);
        self.weights.push(WeightVar {
            name: name.into(),
            ty,
            mutability,
            users: Vec::new(),
        });
        id
    }

    pub fn weight(&self, id: WeightId) -> &WeightVar {
        &self.weights[id.0 as usize]
    }

    pub fn weight_mut(&mut self, id: WeightId) -> &mut WeightVar {
        &mut self.weights[id.0 as usize]
    }

    pub fn weight_ids(&self) -> impl Iterator<Item = WeightId> {
        (0..self.weights.len() as u32).map(WeightId)
    }

    pub fn num_weights(&self) -> usize {
        self.weights.len()
    }

    // ─── Instruction access ──────────────────────────────────────────────

    pub fn instr(&self, id: InstrId) -> &Instr {
        self.instrs[id.0 as usize]
            .as_ref()
            .expect("reference to erased instruction")
    }

    fn instr_mut(&mut self, id: InstrId) -> &mut Instr {
        self.instrs[id.0 as usize]
            .as_mut()
            .expect("reference to erased instruction")
    }

    /// Whether `id` still occupies an arena slot.
    pub fn contains(&self, id: InstrId) -> bool {
        self.instrs
            .get(id.0 as usize)
            .is_some_and(|slot| slot.is_some())
    }

    /// The instruction stream in program order.
    pub fn order(&self) -> &[InstrId] {
        &self.order
    }

    /// Snapshot of the stream in program order. Passes that insert, move or
    /// erase while walking iterate over a snapshot, never over `order`
    /// directly.
    pub fn instr_ids(&self) -> Vec<InstrId> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// All live arena slots, placed or detached. Used by verification to
    /// catch instructions removed from the stream but never reinserted.
    pub(crate) fn arena_ids(&self) -> impl Iterator<Item = InstrId> + '_ {
        self.instrs
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| InstrId(i as u32))
    }

    /// Position of `id` in program order. Panics if the instruction is
    /// detached or erased.
    pub fn index_of(&self, id: InstrId) -> usize {
        self.order
            .iter()
            .position(|&x| x == id)
            .expect("instruction is not in the stream")
    }

    // ─── Stream mutation ─────────────────────────────────────────────────

    /// Append a new instruction to the stream, wiring user edges for every
    /// operand. Instructions are only created through the builder.
    pub(crate) fn push_instr(&mut self, instr: Instr) -> InstrId {
        let id = InstrId(self.instrs.len() as u32);
        let operands = instr.operands.clone();
        self.instrs.push(Some(instr));
        self.order.push(id);
        for (i, (v, _)) in operands.iter().enumerate() {
            self.add_user(*v, Use { instr: id, operand: i });
        }
        id
    }

    /// Rewire operand `idx` of `user` to reference `v`, updating user edges
    /// on both the old and the new value.
    pub fn set_operand(&mut self, user: InstrId, idx: usize, v: ValueRef) {
        let old = self.instr(user).operand(idx).0;
        if old == v {
            return;
        }
        self.remove_user(old, Use { instr: user, operand: idx });
        self.instr_mut(user).operands[idx].0 = v;
        self.add_user(v, Use { instr: user, operand: idx });
    }

    /// Insert a detached instruction into the stream before `before`.
    pub fn insert_before(&mut self, before: InstrId, id: InstrId) {
        debug_assert!(!self.order.contains(&id), "instruction already placed");
        let pos = self.index_of(before);
        self.order.insert(pos, id);
    }

    /// Insert a detached instruction into the stream after `after`.
    pub fn insert_after(&mut self, after: InstrId, id: InstrId) {
        debug_assert!(!self.order.contains(&id), "instruction already placed");
        let pos = self.index_of(after);
        self.order.insert(pos + 1, id);
    }

    /// Move `id` so it sits immediately before `before`. Identity and user
    /// edges are preserved.
    pub fn move_before(&mut self, before: InstrId, id: InstrId) {
        assert_ne!(before, id, "moving an instruction relative to itself");
        self.detach(id);
        self.insert_before(before, id);
    }

    /// Move `id` so it sits immediately after `after`.
    pub fn move_after(&mut self, after: InstrId, id: InstrId) {
        assert_ne!(after, id, "moving an instruction relative to itself");
        self.detach(id);
        self.insert_after(after, id);
    }

    /// Remove `id` from program order without destroying it. The instruction
    /// keeps its arena slot and all user edges, and can be reinserted later.
    pub fn detach(&mut self, id: InstrId) {
        let pos = self.index_of(id);
        self.order.remove(pos);
    }

    /// Erase an instruction: unwire the user edges of every operand, then
    /// vacate the arena slot. The value defined by the instruction (if any)
    /// must no longer have users.
    pub fn erase(&mut self, id: InstrId) {
        if let Some(pos) = self.order.iter().position(|&x| x == id) {
            self.order.remove(pos);
        }
        let instr = self.instrs[id.0 as usize]
            .take()
            .expect("erasing an already-erased instruction");
        for (i, (v, _)) in instr.operands.iter().enumerate() {
            self.remove_user(*v, Use { instr: id, operand: i });
        }
        debug_assert!(
            instr.users.is_empty(),
            "erasing {} while it still has users",
            instr.name
        );
    }

    // ─── Values ──────────────────────────────────────────────────────────

    /// The tensor type of a value. Panics for instructions that define no
    /// value.
    pub fn value_type(&self, v: ValueRef) -> &Type {
        match v {
            ValueRef::Weight(w) => &self.weight(w).ty,
            ValueRef::Instr(id) => match &self.instr(id).kind {
                InstrKind::AllocActivation { ty } | InstrKind::TensorView { ty } => ty,
                other => panic!("{} does not define a value", other.mnemonic()),
            },
        }
    }

    pub fn value_name(&self, v: ValueRef) -> &str {
        match v {
            ValueRef::Weight(w) => &self.weight(w).name,
            ValueRef::Instr(id) => &self.instr(id).name,
        }
    }

    /// Uses of a value across the stream.
    pub fn users(&self, v: ValueRef) -> &[Use] {
        match v {
            ValueRef::Weight(w) => &self.weight(w).users,
            ValueRef::Instr(id) => &self.instr(id).users,
        }
    }

    pub fn num_users(&self, v: ValueRef) -> usize {
        self.users(v).len()
    }

    /// Follow tensor-view chains to the terminal non-view value.
    pub fn origin_of(&self, v: ValueRef) -> ValueRef {
        let mut cur = v;
        loop {
            match cur {
                ValueRef::Instr(id)
                    if matches!(self.instr(id).kind, InstrKind::TensorView { .. }) =>
                {
                    cur = self.instr(id).operand(0).0;
                }
                _ => return cur,
            }
        }
    }

    /// Like [`Module::origin_of`], but only if the terminal origin is an
    /// activation allocation.
    pub fn allocation_origin(&self, v: ValueRef) -> Option<InstrId> {
        match self.origin_of(v) {
            ValueRef::Instr(id)
                if matches!(self.instr(id).kind, InstrKind::AllocActivation { .. }) =>
            {
                Some(id)
            }
            _ => None,
        }
    }

    // ─── User-edge bookkeeping ───────────────────────────────────────────

    fn add_user(&mut self, v: ValueRef, u: Use) {
        match v {
            ValueRef::Weight(w) => self.weight_mut(w).users.push(u),
            ValueRef::Instr(id) => self.instr_mut(id).users.push(u),
        }
    }

    fn remove_user(&mut self, v: ValueRef, u: Use) {
        let users = match v {
            ValueRef::Weight(w) => &mut self.weight_mut(w).users,
            ValueRef::Instr(id) => &mut self.instr_mut(id).users,
        };
        let pos = users
            .iter()
            .position(|&x| x == u)
            .expect("unwiring a user edge that was never wired");
        users.remove(pos);
    }
}

// Textual dump of the whole module, for diagnostics and tracing output.
impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "module {} {{", self.name)?;
        for w in &self.weights {
            let m = match w.mutability {
                Mutability::Constant => "const",
                Mutability::Mutable => "mutable",
            };
            writeln!(f, "  weight %{}: {} // {}", w.name, w.ty, m)?;
        }
        for &id in &self.order {
            let instr = self.instr(id);
            write!(f, "  %{} = {}", instr.name, instr.kind.mnemonic())?;
            for (i, (v, kind)) in instr.operands.iter().enumerate() {
                let sep = if i == 0 { " " } else { ", " };
                write!(f, "{}{} %{}", sep, kind, self.value_name(*v))?;
            }
            writeln!(f)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(dims: Vec<usize>) -> Type {
        Type::new(ElemKind::Float, dims)
    }

    #[test]
    fn operand_kind_ordering() {
        // Liveness relies on reads sorting before writes to the same value.
        assert!(OperandKind::In < OperandKind::InOut);
        assert!(OperandKind::InOut < OperandKind::Out);
    }

    #[test]
    fn type_display_and_size() {
        let ty = fp(vec![2, 3, 4]);
        assert_eq!(ty.to_string(), "float<2 x 3 x 4>");
        assert_eq!(ty.size(), 24);
    }

    #[test]
    fn weight_registration() {
        let mut m = Module::new("test");
        let w = m.create_weight("input", fp(vec![4]), Mutability::Mutable);
        assert_eq!(m.weight(w).name, "input");
        assert_eq!(m.num_weights(), 1);
        assert_eq!(m.num_users(ValueRef::Weight(w)), 0);
    }

    #[test]
    fn inplace_table_elementwise_only() {
        let add = Instr {
            name: "add".into(),
            kind: InstrKind::ElementAdd,
            operands: vec![],
            users: vec![],
        };
        assert!(add.is_inplace_op(0, 1));
        assert!(add.is_inplace_op(0, 2));
        assert!(!add.is_inplace_op(1, 2));

        let copy = Instr {
            name: "copy".into(),
            kind: InstrKind::Copy,
            operands: vec![],
            users: vec![],
        };
        assert!(!copy.is_inplace_op(0, 1));

        let conv = Instr {
            name: "conv".into(),
            kind: InstrKind::Convolution {
                kernel: 3,
                stride: 1,
                pad: 0,
            },
            operands: vec![],
            users: vec![],
        };
        assert!(!conv.is_inplace_op(0, 1));
    }

    #[test]
    fn value_ref_ordering_groups_same_value() {
        // Sorting (value, kind) pairs groups slots on the same value.
        let a = ValueRef::Instr(InstrId(0));
        let b = ValueRef::Instr(InstrId(1));
        let mut ops = vec![
            (b, OperandKind::In),
            (a, OperandKind::Out),
            (a, OperandKind::In),
        ];
        ops.sort();
        assert_eq!(
            ops,
            vec![
                (a, OperandKind::In),
                (a, OperandKind::Out),
                (b, OperandKind::In),
            ]
        );
    }
}
