//! Tree IR surface used by the struct-promotion phase
//!
//! The promotion phase operates on a small slice of the compiler's IR:
//! locals, class layouts, basic blocks with statements, and expression
//! trees held in a per-method node arena. Trees are rewritten in place by
//! node id; statement-level insertions are collected and applied per block
//! so a walk never observes a half-edited tree.

use bitflags::bitflags;

/// Primitive value types a scalar local can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimType {
    /// Signed 8-bit.
    I8,
    /// Unsigned 8-bit.
    U8,
    /// Signed 16-bit.
    I16,
    /// Unsigned 16-bit.
    U16,
    /// Signed 32-bit.
    I32,
    /// Signed 64-bit.
    I64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// GC reference (pointer sized).
    Ref,
    /// 16-byte vector.
    Simd16,
}

impl PrimType {
    /// Size of the type in bytes.
    pub fn size(self) -> u32 {
        match self {
            PrimType::I8 | PrimType::U8 => 1,
            PrimType::I16 | PrimType::U16 => 2,
            PrimType::I32 | PrimType::F32 => 4,
            PrimType::I64 | PrimType::F64 | PrimType::Ref => 8,
            PrimType::Simd16 => 16,
        }
    }

    /// The unsigned integer type of a given byte size, if one exists.
    /// Used to plug single-hole remainders with one load/store.
    pub fn int_of_size(size: u32) -> Option<PrimType> {
        match size {
            1 => Some(PrimType::U8),
            2 => Some(PrimType::U16),
            4 => Some(PrimType::I32),
            8 => Some(PrimType::I64),
            16 => Some(PrimType::Simd16),
            _ => None,
        }
    }
}

bitflags! {
    /// Attributes of a class layout that drive padding significance.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LayoutFlags: u32 {
        /// Opaque run of bytes (no field list).
        const BLOCK_LAYOUT = 1 << 0;
        /// Fields are indexable; padding is addressable.
        const INDEXABLE_FIELDS = 1 << 1;
        /// Explicit (custom) layout.
        const CUSTOM_LAYOUT = 1 << 2;
        /// Contains at least one GC reference.
        const CONTAINS_GC_REF = 1 << 3;
        /// The engine declines to inspect the field list.
        const OPAQUE_FIELDS = 1 << 4;
    }
}

/// One field of a layout. Nested aggregates appear flattened with
/// `ty == None` and an explicit size.
#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    /// Byte offset inside the aggregate.
    pub offset: u32,
    /// Field size in bytes.
    pub size: u32,
    /// Primitive type, or `None` for an embedded aggregate.
    pub ty: Option<PrimType>,
}

/// Index of a layout in the method's layout table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutId(pub u32);

/// Shape of an aggregate type.
#[derive(Debug, Clone)]
pub struct ClassLayout {
    /// Total size in bytes.
    pub size: u32,
    /// Field list, sorted by offset. Empty for block layouts.
    pub fields: Vec<FieldDef>,
    /// Attribute flags.
    pub flags: LayoutFlags,
    /// Offsets of GC reference slots (pointer aligned, sorted).
    pub gc_slots: Vec<u32>,
}

impl ClassLayout {
    /// Layout of `size` raw bytes with no field information.
    pub fn block(size: u32) -> ClassLayout {
        ClassLayout {
            size,
            fields: Vec::new(),
            flags: LayoutFlags::BLOCK_LAYOUT,
            gc_slots: Vec::new(),
        }
    }

    /// Whether any GC slot intersects `[start, start + len)`.
    pub fn intersects_gc_ref(&self, start: u32, len: u32) -> bool {
        self.gc_slots
            .iter()
            .any(|&slot| slot < start + len && slot + 8 > start)
    }

    /// Whether a pointer-sized, pointer-aligned slot holds a GC reference.
    pub fn is_gc_slot(&self, offset: u32) -> bool {
        self.gc_slots.binary_search(&offset).is_ok()
    }

    /// Whether the layout holds any GC reference.
    pub fn has_gc_ref(&self) -> bool {
        !self.gc_slots.is_empty()
    }
}

/// Index of a local in the method's local table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub u32);

/// A local's type: scalar or aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalType {
    /// Scalar local.
    Prim(PrimType),
    /// Aggregate local with the given layout.
    Struct(LayoutId),
}

/// Descriptor for one local variable.
#[derive(Debug, Clone)]
pub struct LocalDesc {
    /// The local's type.
    pub ty: LocalType,
    /// Incoming parameter.
    pub is_param: bool,
    /// Initialized by an on-stack-replacement transition; treated like a
    /// parameter for read-back purposes.
    pub is_osr_local: bool,
    /// The local's address escapes; promotion must leave it alone.
    pub address_exposed: bool,
    /// A struct parameter passed by hidden reference.
    pub implicit_byref: bool,
    /// Already scalarized by an earlier pass.
    pub promoted_by_earlier_pass: bool,
    /// Prolog zero-init was suppressed for this local.
    pub suppressed_zero_init: bool,
    /// Set when a rewrite introduces a def of this local inside an
    /// embedded statement; downstream copy-prop must be careful.
    pub redefined_in_embedded_statement: bool,
}

impl LocalDesc {
    /// A plain scalar local.
    pub fn prim(ty: PrimType) -> LocalDesc {
        LocalDesc {
            ty: LocalType::Prim(ty),
            is_param: false,
            is_osr_local: false,
            address_exposed: false,
            implicit_byref: false,
            promoted_by_earlier_pass: false,
            suppressed_zero_init: false,
            redefined_in_embedded_statement: false,
        }
    }

    /// A plain aggregate local.
    pub fn aggregate(layout: LayoutId) -> LocalDesc {
        LocalDesc {
            ty: LocalType::Struct(layout),
            ..LocalDesc::prim(PrimType::I32)
        }
    }
}

/// Index of a node in the method's node arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

bitflags! {
    /// Per-node flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeFlags: u8 {
        /// This reference is the last use of the (remaining) local.
        const VAR_DEATH = 1 << 0;
        /// The node can raise an exception.
        const MAY_THROW = 1 << 1;
    }
}

/// Binary operators. The promotion phase treats them as opaque value
/// producers; only the throw behavior of division matters to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    /// Addition.
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
    /// Division (can throw).
    Div,
}

/// Expression/statement node kinds.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Integer constant.
    IntConst {
        /// The value.
        value: i64,
        /// Value type.
        ty: PrimType,
    },
    /// A constant whose every byte is `pattern` (block-init element).
    PatternConst {
        /// Value type.
        ty: PrimType,
        /// Repeated byte.
        pattern: u8,
    },
    /// Scalar read of a local at a byte offset.
    LocalRead {
        /// The local.
        local: LocalId,
        /// Byte offset into the local.
        offset: u32,
        /// Access type.
        ty: PrimType,
    },
    /// Scalar store to a local at a byte offset.
    LocalStore {
        /// The local.
        local: LocalId,
        /// Byte offset into the local.
        offset: u32,
        /// Access type.
        ty: PrimType,
        /// Value operand.
        value: NodeId,
    },
    /// Aggregate-typed read of a local (whole or a sub-range).
    StructRead {
        /// The local.
        local: LocalId,
        /// Byte offset into the local.
        offset: u32,
        /// Layout of the accessed range.
        layout: LayoutId,
    },
    /// Aggregate-typed store to a local.
    StructStore {
        /// The local.
        local: LocalId,
        /// Byte offset into the local.
        offset: u32,
        /// Layout of the stored range.
        layout: LayoutId,
        /// Source: a `StructRead`, `BlkRead`, `InitPattern`, or `Call`.
        src: NodeId,
    },
    /// Address of a local (escape point or call ret-buffer argument).
    LocalAddr {
        /// The local.
        local: LocalId,
    },
    /// Scalar load through an address.
    IndirRead {
        /// Address operand.
        addr: NodeId,
        /// Loaded type.
        ty: PrimType,
        /// Constant byte offset added to the address.
        offset: u32,
    },
    /// Scalar store through an address.
    IndirStore {
        /// Address operand.
        addr: NodeId,
        /// Stored type.
        ty: PrimType,
        /// Constant byte offset added to the address.
        offset: u32,
        /// Value operand.
        value: NodeId,
    },
    /// Aggregate load through an address.
    BlkRead {
        /// Address operand.
        addr: NodeId,
        /// Layout of the loaded block.
        layout: LayoutId,
    },
    /// Aggregate store through an address.
    BlkStore {
        /// Address operand.
        addr: NodeId,
        /// Layout of the stored block.
        layout: LayoutId,
        /// Source: a `StructRead`, `BlkRead`, or `InitPattern`.
        src: NodeId,
    },
    /// The repeated-byte source of a block init.
    InitPattern {
        /// Repeated byte.
        pattern: u8,
    },
    /// Binary arithmetic.
    Binary {
        /// Operator.
        op: BinOp,
        /// Left operand.
        lhs: NodeId,
        /// Right operand.
        rhs: NodeId,
        /// Result type.
        ty: PrimType,
    },
    /// A call. Aggregate arguments appear as `StructRead` operands; an
    /// aggregate return assigned to a local appears as the `src` of a
    /// `StructStore`, or through `ret_buf`.
    Call {
        /// Argument nodes in evaluation order.
        args: Vec<NodeId>,
        /// Hidden return-buffer address argument, when the callee writes
        /// its aggregate result through a pointer.
        ret_buf: Option<NodeId>,
        /// Scalar return type, if any.
        ret_ty: Option<PrimType>,
        /// Layout of an aggregate return (used with `ret_buf`, or when the
        /// call is the source of an aggregate store).
        ret_layout: Option<LayoutId>,
    },
    /// Conditional value (short-circuited subtrees).
    Select {
        /// Condition operand.
        cond: NodeId,
        /// Value when the condition is nonzero.
        when_true: NodeId,
        /// Value when the condition is zero.
        when_false: NodeId,
    },
    /// Method return.
    Return {
        /// Returned value, if not void.
        value: Option<NodeId>,
    },
    /// Sequencing: evaluate `effect` for side effects, yield `value`.
    Comma {
        /// Side-effect operand.
        effect: NodeId,
        /// Result operand.
        value: NodeId,
    },
    /// No operation (placeholder left by rewrites).
    Nop,
}

/// One node of the per-method arena.
#[derive(Debug, Clone)]
pub struct Node {
    /// What the node is.
    pub kind: NodeKind,
    /// Flags.
    pub flags: NodeFlags,
}

/// A statement: one rooted tree executed for its side effects.
#[derive(Debug, Clone, Copy)]
pub struct Statement {
    /// Root node.
    pub root: NodeId,
}

/// Index of a basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

/// Index of an exception-handling region descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EhIndex(pub u32);

/// Handler flavor of an EH region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EhKind {
    /// Catch handler.
    Catch,
    /// Filter followed by its handler.
    Filter,
    /// Finally handler.
    Finally,
    /// Fault handler.
    Fault,
}

/// One try region and its handler.
#[derive(Debug, Clone)]
pub struct EhRegion {
    /// Handler flavor.
    pub kind: EhKind,
    /// First block of the handler.
    pub handler_entry: BlockId,
    /// First block of the filter, for [`EhKind::Filter`] regions.
    pub filter_entry: Option<BlockId>,
    /// Index of the enclosing try region, if nested. Enclosing regions
    /// always have higher indices than the regions they enclose.
    pub enclosing: Option<EhIndex>,
}

/// A basic block.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    /// Statements in execution order.
    pub statements: Vec<Statement>,
    /// Successor blocks.
    pub successors: Vec<BlockId>,
    /// Profile weight.
    pub weight: f64,
    /// Innermost try region whose body contains this block.
    pub try_index: Option<EhIndex>,
    /// Innermost region whose *filter* contains this block.
    pub filter_index: Option<EhIndex>,
}

impl BasicBlock {
    fn new(weight: f64) -> BasicBlock {
        BasicBlock {
            statements: Vec::new(),
            successors: Vec::new(),
            weight,
            try_index: None,
            filter_index: None,
        }
    }
}

/// A method's IR: locals, layouts, blocks, EH table, and the node arena.
#[derive(Debug, Default)]
pub struct MethodIr {
    /// Local table.
    pub locals: Vec<LocalDesc>,
    /// Layout table.
    pub layouts: Vec<ClassLayout>,
    /// Blocks; index 0 is the method entry.
    pub blocks: Vec<BasicBlock>,
    /// EH region table, innermost first.
    pub eh_regions: Vec<EhRegion>,
    /// Node arena.
    pub nodes: Vec<Node>,
    /// Stable hash of the method identity, for configuration ranges.
    pub method_hash: u64,
}

impl MethodIr {
    /// Empty method with one entry block of weight 1.
    pub fn new() -> MethodIr {
        let mut ir = MethodIr::default();
        ir.blocks.push(BasicBlock::new(1.0));
        ir
    }

    // ---- construction -------------------------------------------------

    /// Add a local; returns its id.
    pub fn add_local(&mut self, desc: LocalDesc) -> LocalId {
        self.locals.push(desc);
        LocalId(self.locals.len() as u32 - 1)
    }

    /// Add a layout; returns its id.
    pub fn add_layout(&mut self, layout: ClassLayout) -> LayoutId {
        self.layouts.push(layout);
        LayoutId(self.layouts.len() as u32 - 1)
    }

    /// Add a block with the given weight; returns its id.
    pub fn add_block(&mut self, weight: f64) -> BlockId {
        self.blocks.push(BasicBlock::new(weight));
        BlockId(self.blocks.len() as u32 - 1)
    }

    /// Add a node; returns its id.
    pub fn add_node(&mut self, kind: NodeKind) -> NodeId {
        let flags = match &kind {
            NodeKind::Call { .. } => NodeFlags::MAY_THROW,
            NodeKind::IndirRead { .. }
            | NodeKind::IndirStore { .. }
            | NodeKind::BlkRead { .. }
            | NodeKind::BlkStore { .. } => NodeFlags::MAY_THROW,
            NodeKind::Binary { op: BinOp::Div, .. } => NodeFlags::MAY_THROW,
            _ => NodeFlags::empty(),
        };
        self.nodes.push(Node { kind, flags });
        NodeId(self.nodes.len() as u32 - 1)
    }

    /// Append a statement rooted at `root` to `block`.
    pub fn add_statement(&mut self, block: BlockId, root: NodeId) {
        self.blocks[block.0 as usize].statements.push(Statement { root });
    }

    // ---- node factories used by the rewriter --------------------------

    /// `local = value` (whole scalar local).
    pub fn new_local_store(&mut self, local: LocalId, ty: PrimType, value: NodeId) -> NodeId {
        self.add_node(NodeKind::LocalStore { local, offset: 0, ty, value })
    }

    /// Read of a whole scalar local.
    pub fn new_local_read(&mut self, local: LocalId, ty: PrimType) -> NodeId {
        self.add_node(NodeKind::LocalRead { local, offset: 0, ty })
    }

    /// `local@offset = value` (field store into an aggregate).
    pub fn new_field_store(
        &mut self,
        local: LocalId,
        offset: u32,
        ty: PrimType,
        value: NodeId,
    ) -> NodeId {
        self.add_node(NodeKind::LocalStore { local, offset, ty, value })
    }

    /// Read of `local@offset` (field read from an aggregate).
    pub fn new_field_read(&mut self, local: LocalId, offset: u32, ty: PrimType) -> NodeId {
        self.add_node(NodeKind::LocalRead { local, offset, ty })
    }

    /// A constant of `ty` whose every byte is `pattern`.
    pub fn new_pattern_const(&mut self, ty: PrimType, pattern: u8) -> NodeId {
        self.add_node(NodeKind::PatternConst { ty, pattern })
    }

    // ---- accessors -----------------------------------------------------

    /// Node by id.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    /// Mutable node by id.
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    /// Local descriptor by id.
    pub fn local(&self, id: LocalId) -> &LocalDesc {
        &self.locals[id.0 as usize]
    }

    /// Mutable local descriptor by id.
    pub fn local_mut(&mut self, id: LocalId) -> &mut LocalDesc {
        &mut self.locals[id.0 as usize]
    }

    /// Layout by id.
    pub fn layout(&self, id: LayoutId) -> &ClassLayout {
        &self.layouts[id.0 as usize]
    }

    /// Layout of an aggregate local.
    pub fn local_layout(&self, id: LocalId) -> Option<&ClassLayout> {
        match self.local(id).ty {
            LocalType::Struct(layout) => Some(self.layout(layout)),
            LocalType::Prim(_) => None,
        }
    }

    /// Direct operands of a node, in evaluation order.
    pub fn operands(&self, id: NodeId) -> Vec<NodeId> {
        match &self.node(id).kind {
            NodeKind::IntConst { .. }
            | NodeKind::PatternConst { .. }
            | NodeKind::LocalRead { .. }
            | NodeKind::StructRead { .. }
            | NodeKind::LocalAddr { .. }
            | NodeKind::InitPattern { .. }
            | NodeKind::Nop => Vec::new(),
            NodeKind::LocalStore { value, .. } => vec![*value],
            NodeKind::StructStore { src, .. } => vec![*src],
            NodeKind::IndirRead { addr, .. } => vec![*addr],
            NodeKind::IndirStore { addr, value, .. } => vec![*addr, *value],
            NodeKind::BlkRead { addr, .. } => vec![*addr],
            NodeKind::BlkStore { addr, src, .. } => vec![*addr, *src],
            NodeKind::Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
            NodeKind::Call { args, ret_buf, .. } => {
                // Evaluation order puts the hidden buffer last.
                let mut ops = args.clone();
                if let Some(rb) = ret_buf {
                    ops.push(*rb);
                }
                ops
            }
            NodeKind::Select { cond, when_true, when_false } => {
                vec![*cond, *when_true, *when_false]
            }
            NodeKind::Return { value } => value.iter().copied().collect(),
            NodeKind::Comma { effect, value } => vec![*effect, *value],
        }
    }

    /// Nodes of the tree rooted at `root` in execution order (operands
    /// before users).
    pub fn execution_order(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.visit_post(root, &mut out);
        out
    }

    fn visit_post(&self, id: NodeId, out: &mut Vec<NodeId>) {
        for op in self.operands(id) {
            self.visit_post(op, out);
        }
        out.push(id);
    }

    /// Whether the tree rooted at `root` contains a conditional subtree.
    pub fn tree_has_select(&self, root: NodeId) -> bool {
        self.execution_order(root)
            .iter()
            .any(|&n| matches!(self.node(n).kind, NodeKind::Select { .. }))
    }

    /// Whether the block lies inside a try region with exception flow.
    pub fn block_has_exn_flow(&self, block: BlockId) -> bool {
        let b = &self.blocks[block.0 as usize];
        b.try_index.is_some() || b.filter_index.is_some()
    }

    /// Whether a local is an aggregate eligible for promotion analysis:
    /// struct-typed, not address-exposed, not already scalarized.
    pub fn is_candidate_for_promotion(&self, local: LocalId) -> bool {
        let desc = self.local(local);
        matches!(desc.ty, LocalType::Struct(_))
            && !desc.address_exposed
            && !desc.promoted_by_earlier_pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_order_is_postorder() {
        let mut ir = MethodIr::new();
        let a = ir.add_local(LocalDesc::prim(PrimType::I32));

        let lhs = ir.new_local_read(a, PrimType::I32);
        let rhs = ir.add_node(NodeKind::IntConst { value: 3, ty: PrimType::I32 });
        let sum = ir.add_node(NodeKind::Binary { op: BinOp::Add, lhs, rhs, ty: PrimType::I32 });
        let store = ir.new_local_store(a, PrimType::I32, sum);

        assert_eq!(ir.execution_order(store), vec![lhs, rhs, sum, store]);
    }

    #[test]
    fn test_call_operands_include_retbuf() {
        let mut ir = MethodIr::new();
        let layout = ir.add_layout(ClassLayout::block(16));
        let v = ir.add_local(LocalDesc::aggregate(layout));

        let arg = ir.add_node(NodeKind::StructRead { local: v, offset: 0, layout });
        let rb = ir.add_node(NodeKind::LocalAddr { local: v });
        let call = ir.add_node(NodeKind::Call {
            args: vec![arg],
            ret_buf: Some(rb),
            ret_ty: None,
            ret_layout: Some(layout),
        });

        assert_eq!(ir.operands(call), vec![arg, rb]);
        assert!(ir.node(call).flags.contains(NodeFlags::MAY_THROW));
    }

    #[test]
    fn test_layout_gc_queries() {
        let layout = ClassLayout {
            size: 24,
            fields: vec![
                FieldDef { offset: 0, size: 8, ty: Some(PrimType::I64) },
                FieldDef { offset: 8, size: 8, ty: Some(PrimType::Ref) },
                FieldDef { offset: 16, size: 8, ty: Some(PrimType::I64) },
            ],
            flags: LayoutFlags::CONTAINS_GC_REF,
            gc_slots: vec![8],
        };

        assert!(layout.has_gc_ref());
        assert!(layout.is_gc_slot(8));
        assert!(!layout.is_gc_slot(0));
        assert!(layout.intersects_gc_ref(4, 8));
        assert!(!layout.intersects_gc_ref(0, 8));
        assert!(!layout.intersects_gc_ref(16, 8));
    }

    #[test]
    fn test_tree_has_select() {
        let mut ir = MethodIr::new();
        let a = ir.add_local(LocalDesc::prim(PrimType::I32));
        let c = ir.add_node(NodeKind::IntConst { value: 1, ty: PrimType::I32 });
        let t = ir.add_node(NodeKind::IntConst { value: 2, ty: PrimType::I32 });
        let f = ir.add_node(NodeKind::IntConst { value: 3, ty: PrimType::I32 });
        let sel = ir.add_node(NodeKind::Select { cond: c, when_true: t, when_false: f });
        let store = ir.new_local_store(a, PrimType::I32, sel);

        assert!(ir.tree_has_select(store));
        assert!(!ir.tree_has_select(c));
    }
}
