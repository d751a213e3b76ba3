//! Access profiles for aggregate locals
//!
//! Walks every statement once and records, per candidate aggregate, the
//! distinct `(offset, type, layout)` accesses with weighted counts broken
//! down by use kind. The picker's cost model runs entirely off this
//! profile.

use bitflags::bitflags;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::jit::ir::{LayoutId, LocalId, MethodIr, NodeId, NodeKind, PrimType};

bitflags! {
    /// How a single use of an aggregate participates in its parent node.
    /// A use may carry several flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AccessKindFlags: u32 {
        /// Passed as a call argument.
        const IS_CALL_ARG = 1 << 0;
        /// Right-hand side of a store.
        const IS_ASSIGNMENT_SOURCE = 1 << 1;
        /// Destination of a store.
        const IS_ASSIGNMENT_DESTINATION = 1 << 2;
        /// Passed as a call's hidden return buffer.
        const IS_CALL_RETBUF = 1 << 3;
        /// Destination of a store whose value comes from a call.
        const IS_ASSIGNED_FROM_CALL = 1 << 4;
        /// Operand of a return.
        const IS_RETURNED = 1 << 5;
    }
}

/// Type of a recorded access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    /// Scalar access.
    Prim(PrimType),
    /// Aggregate access with the given layout.
    Struct(LayoutId),
}

/// One distinct access into an aggregate local.
#[derive(Debug, Clone)]
pub struct Access {
    /// Byte offset of the access.
    pub offset: u32,
    /// Access type. Distinct entries may share an offset.
    pub ty: AccessType,
    /// Access size in bytes.
    pub size: u32,

    /// Times seen.
    pub count: u32,
    /// Weighted count.
    pub count_wtd: f64,
    /// Weighted count as store source.
    pub count_assignment_source_wtd: f64,
    /// Weighted count as store destination.
    pub count_assignment_destination_wtd: f64,
    /// Weighted count as store destination where the value is a call.
    pub count_assigned_from_call_wtd: f64,
    /// Weighted count as call argument.
    pub count_call_args_wtd: f64,
    /// Weighted count as return operand.
    pub count_returns_wtd: f64,
    /// Weighted count as call return buffer.
    pub count_passed_as_retbuf_wtd: f64,
}

impl Access {
    fn new(offset: u32, ty: AccessType, size: u32) -> Access {
        Access {
            offset,
            ty,
            size,
            count: 0,
            count_wtd: 0.0,
            count_assignment_source_wtd: 0.0,
            count_assignment_destination_wtd: 0.0,
            count_assigned_from_call_wtd: 0.0,
            count_call_args_wtd: 0.0,
            count_returns_wtd: 0.0,
            count_passed_as_retbuf_wtd: 0.0,
        }
    }

    /// Whether the access overlaps `[other_start, other_start + other_size)`.
    pub fn overlaps(&self, other_start: u32, other_size: u32) -> bool {
        self.offset < other_start + other_size && other_start < self.offset + self.size
    }

    fn bump(&mut self, flags: AccessKindFlags, weight: f64) {
        self.count += 1;
        self.count_wtd += weight;
        if flags.contains(AccessKindFlags::IS_ASSIGNMENT_SOURCE) {
            self.count_assignment_source_wtd += weight;
        }
        if flags.contains(AccessKindFlags::IS_ASSIGNMENT_DESTINATION) {
            self.count_assignment_destination_wtd += weight;
        }
        if flags.contains(AccessKindFlags::IS_ASSIGNED_FROM_CALL) {
            self.count_assigned_from_call_wtd += weight;
        }
        if flags.contains(AccessKindFlags::IS_CALL_ARG) {
            self.count_call_args_wtd += weight;
        }
        if flags.contains(AccessKindFlags::IS_RETURNED) {
            self.count_returns_wtd += weight;
        }
        if flags.contains(AccessKindFlags::IS_CALL_RETBUF) {
            self.count_passed_as_retbuf_wtd += weight;
        }
    }
}

/// All recorded accesses for one aggregate, sorted by offset.
#[derive(Debug, Default)]
pub struct LocalUses {
    /// Sorted by offset; entries with equal offsets are adjacent.
    pub accesses: Vec<Access>,
}

impl LocalUses {
    /// Record one use. Finds or creates the `(offset, type)` entry and
    /// accumulates the counters.
    pub fn record(&mut self, offset: u32, ty: AccessType, size: u32, flags: AccessKindFlags, weight: f64) {
        let mut index = self.accesses.partition_point(|a| a.offset < offset);
        // Scan forward through entries that share the offset.
        while index < self.accesses.len() && self.accesses[index].offset == offset {
            if self.accesses[index].ty == ty {
                self.accesses[index].bump(flags, weight);
                return;
            }
            index += 1;
        }
        let mut access = Access::new(offset, ty, size);
        access.bump(flags, weight);
        self.accesses.insert(index, access);
    }
}

/// Use profiles for every candidate aggregate in a method.
#[derive(Debug, Default)]
pub struct LocalProfiles {
    uses: FxHashMap<LocalId, LocalUses>,
    /// Locals whose address escaped during the walk; never promoted.
    escaped: FxHashSet<LocalId>,
}

impl LocalProfiles {
    /// Profile for a local, unless it escaped.
    pub fn uses_for(&self, local: LocalId) -> Option<&LocalUses> {
        if self.escaped.contains(&local) {
            return None;
        }
        self.uses.get(&local)
    }

    /// Locals with at least one recorded access, in id order.
    pub fn profiled_locals(&self) -> Vec<LocalId> {
        let mut out: Vec<LocalId> = self
            .uses
            .keys()
            .filter(|l| !self.escaped.contains(l))
            .copied()
            .collect();
        out.sort();
        out
    }
}

/// Strip comma wrappers to the value-producing node.
fn effective_val(ir: &MethodIr, mut id: NodeId) -> NodeId {
    while let NodeKind::Comma { value, .. } = ir.node(id).kind {
        id = value;
    }
    id
}

/// Build profiles for every candidate aggregate local in the method.
pub fn collect_profiles(ir: &MethodIr) -> LocalProfiles {
    let mut profiles = LocalProfiles::default();

    for block in &ir.blocks {
        for stmt in &block.statements {
            visit(ir, stmt.root, None, block.weight, &mut profiles);
        }
    }

    profiles
}

fn visit(ir: &MethodIr, node: NodeId, user: Option<NodeId>, weight: f64, profiles: &mut LocalProfiles) {
    for op in ir.operands(node) {
        visit(ir, op, Some(node), weight, profiles);
    }

    match &ir.node(node).kind {
        NodeKind::LocalRead { local, offset, ty } => {
            if ir.is_candidate_for_promotion(*local) {
                let flags = user_flags(ir, node, user);
                profiles.uses.entry(*local).or_default().record(
                    *offset,
                    AccessType::Prim(*ty),
                    ty.size(),
                    flags,
                    weight,
                );
            }
        }
        NodeKind::LocalStore { local, offset, ty, value } => {
            if ir.is_candidate_for_promotion(*local) {
                let mut flags = AccessKindFlags::IS_ASSIGNMENT_DESTINATION;
                if matches!(ir.node(effective_val(ir, *value)).kind, NodeKind::Call { .. }) {
                    flags |= AccessKindFlags::IS_ASSIGNED_FROM_CALL;
                }
                profiles.uses.entry(*local).or_default().record(
                    *offset,
                    AccessType::Prim(*ty),
                    ty.size(),
                    flags,
                    weight,
                );
            }
        }
        NodeKind::StructRead { local, offset, layout } => {
            if ir.is_candidate_for_promotion(*local) {
                let flags = user_flags(ir, node, user);
                profiles.uses.entry(*local).or_default().record(
                    *offset,
                    AccessType::Struct(*layout),
                    ir.layout(*layout).size,
                    flags,
                    weight,
                );
            }
        }
        NodeKind::StructStore { local, offset, layout, src } => {
            if ir.is_candidate_for_promotion(*local) {
                let mut flags = AccessKindFlags::IS_ASSIGNMENT_DESTINATION;
                if matches!(ir.node(effective_val(ir, *src)).kind, NodeKind::Call { .. }) {
                    flags |= AccessKindFlags::IS_ASSIGNED_FROM_CALL;
                }
                profiles.uses.entry(*local).or_default().record(
                    *offset,
                    AccessType::Struct(*layout),
                    ir.layout(*layout).size,
                    flags,
                    weight,
                );
            }
        }
        NodeKind::LocalAddr { local } => {
            if !ir.is_candidate_for_promotion(*local) {
                return;
            }
            // A local address is fine exactly when it is a call's return
            // buffer; anything else exposes the local.
            let retbuf_layout = user.and_then(|u| match &ir.node(u).kind {
                NodeKind::Call { ret_buf: Some(rb), ret_layout, .. } if *rb == node => *ret_layout,
                _ => None,
            });
            match retbuf_layout {
                Some(layout) => {
                    profiles.uses.entry(*local).or_default().record(
                        0,
                        AccessType::Struct(layout),
                        ir.layout(layout).size,
                        AccessKindFlags::IS_CALL_RETBUF,
                        weight,
                    );
                }
                None => {
                    profiles.escaped.insert(*local);
                }
            }
        }
        _ => {}
    }
}

/// Flags contributed by the user (parent) of a local reference.
fn user_flags(ir: &MethodIr, node: NodeId, user: Option<NodeId>) -> AccessKindFlags {
    let Some(user) = user else {
        return AccessKindFlags::empty();
    };
    match &ir.node(user).kind {
        NodeKind::Call { args, .. } => {
            if args.contains(&node) {
                AccessKindFlags::IS_CALL_ARG
            } else {
                AccessKindFlags::empty()
            }
        }
        NodeKind::LocalStore { value, .. } if *value == node => AccessKindFlags::IS_ASSIGNMENT_SOURCE,
        NodeKind::StructStore { src, .. } if *src == node => AccessKindFlags::IS_ASSIGNMENT_SOURCE,
        NodeKind::IndirStore { value, .. } if *value == node => AccessKindFlags::IS_ASSIGNMENT_SOURCE,
        NodeKind::BlkStore { src, .. } if *src == node => AccessKindFlags::IS_ASSIGNMENT_SOURCE,
        NodeKind::Return { .. } => AccessKindFlags::IS_RETURNED,
        _ => AccessKindFlags::empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::{BinOp, ClassLayout, FieldDef, LayoutFlags, LocalDesc};

    fn four_int_layout(ir: &mut MethodIr) -> LayoutId {
        ir.add_layout(ClassLayout {
            size: 16,
            fields: (0..4)
                .map(|i| FieldDef { offset: i * 4, size: 4, ty: Some(PrimType::I32) })
                .collect(),
            flags: LayoutFlags::empty(),
            gc_slots: vec![],
        })
    }

    #[test]
    fn test_distinct_entries_per_offset_and_type() {
        let mut ir = MethodIr::new();
        let layout = four_int_layout(&mut ir);
        let v = ir.add_local(LocalDesc::aggregate(layout));
        let sink = ir.add_local(LocalDesc::prim(PrimType::I32));

        // Two reads of v@0 as int, one as float.
        let entry = crate::jit::ir::BlockId(0);
        for _ in 0..2 {
            let read = ir.new_field_read(v, 0, PrimType::I32);
            let store = ir.new_local_store(sink, PrimType::I32, read);
            ir.add_statement(entry, store);
        }
        let fread = ir.new_field_read(v, 0, PrimType::F32);
        let stmt = ir.add_node(NodeKind::Return { value: Some(fread) });
        ir.add_statement(entry, stmt);

        let profiles = collect_profiles(&ir);
        let uses = profiles.uses_for(v).unwrap();
        assert_eq!(uses.accesses.len(), 2);
        assert_eq!(uses.accesses[0].offset, 0);
        assert_eq!(uses.accesses[1].offset, 0);

        let int_access = uses
            .accesses
            .iter()
            .find(|a| a.ty == AccessType::Prim(PrimType::I32))
            .unwrap();
        assert_eq!(int_access.count, 2);
        assert!((int_access.count_wtd - 2.0).abs() < 1e-9);
        assert!((int_access.count_assignment_source_wtd - 2.0).abs() < 1e-9);

        let float_access = uses
            .accesses
            .iter()
            .find(|a| a.ty == AccessType::Prim(PrimType::F32))
            .unwrap();
        assert!((float_access.count_returns_wtd - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_struct_uses_classified() {
        let mut ir = MethodIr::new();
        let layout = four_int_layout(&mut ir);
        let v = ir.add_local(LocalDesc::aggregate(layout));
        let other = ir.add_local(LocalDesc::aggregate(layout));

        let entry = crate::jit::ir::BlockId(0);

        // other = v (v is assignment source, other is destination).
        let src = ir.add_node(NodeKind::StructRead { local: v, offset: 0, layout });
        let store = ir.add_node(NodeKind::StructStore { local: other, offset: 0, layout, src });
        ir.add_statement(entry, store);

        // call(v) (call arg).
        let arg = ir.add_node(NodeKind::StructRead { local: v, offset: 0, layout });
        let call = ir.add_node(NodeKind::Call { args: vec![arg], ret_buf: None, ret_ty: None, ret_layout: None });
        ir.add_statement(entry, call);

        // call with v as retbuf.
        let rb = ir.add_node(NodeKind::LocalAddr { local: v });
        let call2 = ir.add_node(NodeKind::Call {
            args: vec![],
            ret_buf: Some(rb),
            ret_ty: None,
            ret_layout: Some(layout),
        });
        ir.add_statement(entry, call2);

        let profiles = collect_profiles(&ir);
        let uses = profiles.uses_for(v).unwrap();
        let st = uses
            .accesses
            .iter()
            .find(|a| matches!(a.ty, AccessType::Struct(_)))
            .unwrap();
        assert!((st.count_assignment_source_wtd - 1.0).abs() < 1e-9);
        assert!((st.count_call_args_wtd - 1.0).abs() < 1e-9);
        assert!((st.count_passed_as_retbuf_wtd - 1.0).abs() < 1e-9);

        let other_uses = profiles.uses_for(other).unwrap();
        let dst = &other_uses.accesses[0];
        assert!((dst.count_assignment_destination_wtd - 1.0).abs() < 1e-9);
        assert!((dst.count_assigned_from_call_wtd - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_assigned_from_call() {
        let mut ir = MethodIr::new();
        let layout = four_int_layout(&mut ir);
        let v = ir.add_local(LocalDesc::aggregate(layout));

        let entry = crate::jit::ir::BlockId(0);
        let call = ir.add_node(NodeKind::Call { args: vec![], ret_buf: None, ret_ty: None, ret_layout: Some(layout) });
        let store = ir.add_node(NodeKind::StructStore { local: v, offset: 0, layout, src: call });
        ir.add_statement(entry, store);

        let profiles = collect_profiles(&ir);
        let uses = profiles.uses_for(v).unwrap();
        assert!((uses.accesses[0].count_assigned_from_call_wtd - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_escaped_address_disqualifies() {
        let mut ir = MethodIr::new();
        let layout = four_int_layout(&mut ir);
        let v = ir.add_local(LocalDesc::aggregate(layout));
        let p = ir.add_local(LocalDesc::prim(PrimType::I64));

        let entry = crate::jit::ir::BlockId(0);
        let read = ir.new_field_read(v, 0, PrimType::I32);
        let sum = ir.add_node(NodeKind::Binary {
            op: BinOp::Add,
            lhs: read,
            rhs: read,
            ty: PrimType::I32,
        });
        ir.add_statement(entry, sum);

        // Address taken outside a retbuf position.
        let addr = ir.add_node(NodeKind::LocalAddr { local: v });
        let store = ir.new_local_store(p, PrimType::I64, addr);
        ir.add_statement(entry, store);

        let profiles = collect_profiles(&ir);
        assert!(profiles.uses_for(v).is_none());
    }

    #[test]
    fn test_weights_follow_blocks() {
        let mut ir = MethodIr::new();
        let layout = four_int_layout(&mut ir);
        let v = ir.add_local(LocalDesc::aggregate(layout));
        let sink = ir.add_local(LocalDesc::prim(PrimType::I32));

        let hot = ir.add_block(100.0);
        let read = ir.new_field_read(v, 4, PrimType::I32);
        let store = ir.new_local_store(sink, PrimType::I32, read);
        ir.add_statement(hot, store);

        let profiles = collect_profiles(&ir);
        let uses = profiles.uses_for(v).unwrap();
        assert_eq!(uses.accesses[0].count, 1);
        assert!((uses.accesses[0].count_wtd - 100.0).abs() < 1e-9);
    }
}
