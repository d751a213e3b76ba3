//! IR rewriting for promoted aggregates
//!
//! Replaces scalar accesses of promoted ranges with their replacement
//! locals, keeps the aggregate's home location consistent around calls,
//! returns and throwing nodes via write-backs and read-backs, and takes
//! apart struct copies and inits into per-field operations plus a minimal
//! remainder operation.
//!
//! Tree edits happen by node id against the statement's arena snapshot:
//! a node is rewritten in place, or cloned into a fresh node and wrapped
//! in a comma, so the walk never sees a half-edited tree. Statement-level
//! insertions only happen at block boundaries (end-of-block read-backs).

use crate::jit::ir::{
    BlockId, ClassLayout, LayoutId, LocalDesc, LocalId, MethodIr, NodeFlags, NodeId, NodeKind,
    PrimType, Statement,
};

use super::liveness::{PromotionLiveness, StructDeaths};
use super::picker::significant_segments;
use super::segments::{Segment, StructSegments};
use super::{AggregateStore, Replacement};

/// How the bytes not covered by plan entries are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemainderStrategy {
    /// Nothing to do: empty remainder, or the remainder is dying.
    None,
    /// One primitive load+store plugs the hole.
    Primitive {
        /// Offset of the hole relative to the copied range.
        offset: u32,
        /// Type used for the plug.
        ty: PrimType,
    },
    /// Keep a full block operation for the remainder.
    FullBlock,
}

/// One planned field-level operation of a copy decomposition.
#[derive(Debug, Clone, Copy)]
struct Entry {
    /// Destination replacement index within its aggregate, if any.
    to: Option<usize>,
    /// Source replacement index within its aggregate, if any.
    from: Option<usize>,
    /// Offset relative to the copied range.
    rel_offset: u32,
    ty: PrimType,
}

impl Entry {
    fn range(&self) -> Segment {
        Segment::new(self.rel_offset, self.rel_offset + self.ty.size())
    }
}

/// One side of a copy: a local at a base offset, or an indirection whose
/// address is cloned per derived access.
enum LocationAccess {
    Local { local: LocalId, base: u32 },
    Indir { template: NodeId },
}

impl LocationAccess {
    /// Read `ty` at `rel` bytes into the location.
    fn create_read(&self, ir: &mut MethodIr, rel: u32, ty: PrimType) -> NodeId {
        match self {
            LocationAccess::Local { local, base } => ir.new_field_read(*local, base + rel, ty),
            LocationAccess::Indir { template } => {
                let addr = clone_tree(ir, *template);
                ir.add_node(NodeKind::IndirRead { addr, ty, offset: rel })
            }
        }
    }

    /// Store `value` of `ty` at `rel` bytes into the location.
    fn create_store(&self, ir: &mut MethodIr, rel: u32, ty: PrimType, value: NodeId) -> NodeId {
        match self {
            LocationAccess::Local { local, base } => {
                ir.new_field_store(*local, base + rel, ty, value)
            }
            LocationAccess::Indir { template } => {
                let addr = clone_tree(ir, *template);
                ir.add_node(NodeKind::IndirStore { addr, ty, offset: rel, value })
            }
        }
    }

    /// Rebuild a whole-range block access of this location.
    fn create_block_read(&self, ir: &mut MethodIr, layout: LayoutId) -> NodeId {
        match self {
            LocationAccess::Local { local, base } => {
                ir.add_node(NodeKind::StructRead { local: *local, offset: *base, layout })
            }
            LocationAccess::Indir { template } => {
                let addr = clone_tree(ir, *template);
                ir.add_node(NodeKind::BlkRead { addr, layout })
            }
        }
    }

    fn create_block_store(&self, ir: &mut MethodIr, layout: LayoutId, src: NodeId) -> NodeId {
        match self {
            LocationAccess::Local { local, base } => {
                ir.add_node(NodeKind::StructStore { local: *local, offset: *base, layout, src })
            }
            LocationAccess::Indir { template } => {
                let addr = clone_tree(ir, *template);
                ir.add_node(NodeKind::BlkStore { addr, layout, src })
            }
        }
    }
}

/// Deep-copy the tree rooted at `id` into fresh nodes.
fn clone_tree(ir: &mut MethodIr, id: NodeId) -> NodeId {
    let kind = ir.node(id).kind.clone();
    let flags = ir.node(id).flags;
    let new_kind = match kind {
        NodeKind::LocalStore { local, offset, ty, value } => {
            let value = clone_tree(ir, value);
            NodeKind::LocalStore { local, offset, ty, value }
        }
        NodeKind::StructStore { local, offset, layout, src } => {
            let src = clone_tree(ir, src);
            NodeKind::StructStore { local, offset, layout, src }
        }
        NodeKind::IndirRead { addr, ty, offset } => {
            let addr = clone_tree(ir, addr);
            NodeKind::IndirRead { addr, ty, offset }
        }
        NodeKind::IndirStore { addr, ty, offset, value } => {
            let addr = clone_tree(ir, addr);
            let value = clone_tree(ir, value);
            NodeKind::IndirStore { addr, ty, offset, value }
        }
        NodeKind::BlkRead { addr, layout } => {
            let addr = clone_tree(ir, addr);
            NodeKind::BlkRead { addr, layout }
        }
        NodeKind::BlkStore { addr, layout, src } => {
            let addr = clone_tree(ir, addr);
            let src = clone_tree(ir, src);
            NodeKind::BlkStore { addr, layout, src }
        }
        NodeKind::Binary { op, lhs, rhs, ty } => {
            let lhs = clone_tree(ir, lhs);
            let rhs = clone_tree(ir, rhs);
            NodeKind::Binary { op, lhs, rhs, ty }
        }
        NodeKind::Comma { effect, value } => {
            let effect = clone_tree(ir, effect);
            let value = clone_tree(ir, value);
            NodeKind::Comma { effect, value }
        }
        leaf => leaf,
    };
    let new_id = ir.add_node(new_kind);
    ir.node_mut(new_id).flags = flags;
    new_id
}

/// Clone `node`'s current content into a fresh node and turn `node` into
/// `COMMA(effect, clone)`. Returns the clone, which now carries the
/// original meaning.
fn wrap_with_effect(ir: &mut MethodIr, node: NodeId, effect: NodeId) -> NodeId {
    let kind = ir.node(node).kind.clone();
    let flags = ir.node(node).flags;
    let inner = ir.add_node(kind);
    ir.node_mut(inner).flags = flags;
    ir.node_mut(node).kind = NodeKind::Comma { effect, value: inner };
    ir.node_mut(node).flags = NodeFlags::empty();
    inner
}

/// `struct_local@offset = replacement_local` — the store that syncs a
/// replacement's value back into its home range.
fn create_write_back(ir: &mut MethodIr, struct_local: LocalId, rep: Replacement) -> NodeId {
    let value = ir.new_local_read(rep.local, rep.ty);
    ir.new_field_store(struct_local, rep.offset, rep.ty, value)
}

/// `replacement_local = struct_local@offset` — the load that re-syncs a
/// replacement after its home range was updated directly.
fn create_read_back(ir: &mut MethodIr, struct_local: LocalId, rep: Replacement) -> NodeId {
    let value = ir.new_field_read(struct_local, rep.offset, rep.ty);
    ir.new_local_store(rep.local, rep.ty, value)
}

fn can_init_primitive(ty: PrimType, pattern: u8) -> bool {
    match ty {
        // Reference fields and vectors can only represent the zero
        // pattern directly.
        PrimType::Ref | PrimType::Simd16 => pattern == 0,
        _ => true,
    }
}

/// Replace `node` with the sequence `ops` (executed in order). An empty
/// sequence leaves a no-op.
fn replace_with_sequence(ir: &mut MethodIr, node: NodeId, mut ops: Vec<NodeId>) {
    let kind = match ops.len() {
        0 => NodeKind::Nop,
        1 => ir.node(ops[0]).kind.clone(),
        _ => {
            let mut value = ops.pop().expect("nonempty");
            while ops.len() > 1 {
                let effect = ops.pop().expect("nonempty");
                value = ir.add_node(NodeKind::Comma { effect, value });
            }
            NodeKind::Comma { effect: ops[0], value }
        }
    };
    ir.node_mut(node).kind = kind;
    ir.node_mut(node).flags = NodeFlags::empty();
}

/// The statement/tree rewriter. One instance walks all blocks of a
/// method once.
pub struct ReplaceVisitor<'a> {
    liveness: &'a PromotionLiveness,
    current_block: BlockId,
    made_changes: bool,
    has_pending_read_backs: bool,
}

impl<'a> ReplaceVisitor<'a> {
    /// Rewrite every block of `ir`. Returns whether anything changed.
    pub fn run(ir: &mut MethodIr, aggregates: &mut AggregateStore, liveness: &'a PromotionLiveness) -> bool {
        let mut visitor = ReplaceVisitor {
            liveness,
            current_block: BlockId(0),
            made_changes: false,
            has_pending_read_backs: false,
        };

        for b in 0..ir.blocks.len() {
            let block = BlockId(b as u32);
            visitor.current_block = block;

            let stmts: Vec<Statement> = ir.blocks[b].statements.clone();
            for stmt in &stmts {
                visitor.visit_statement(ir, aggregates, stmt.root);
            }

            visitor.end_block(ir, aggregates);
        }

        visitor.made_changes
    }

    fn visit_statement(&mut self, ir: &mut MethodIr, aggs: &mut AggregateStore, root: NodeId) {
        for node in ir.execution_order(root) {
            self.process_node(ir, aggs, node);
        }
    }

    fn process_node(&mut self, ir: &mut MethodIr, aggs: &mut AggregateStore, node: NodeId) {
        let mut node = node;

        // Inside a try region, a pending read-back must land before any
        // node that can throw or call: the handler may observe the
        // aggregate's home location.
        if self.has_pending_read_backs
            && ir.block_has_exn_flow(self.current_block)
            && ir.node(node).flags.contains(NodeFlags::MAY_THROW)
        {
            node = self.insert_mid_tree_read_backs(ir, aggs, node);
        }

        match ir.node(node).kind.clone() {
            NodeKind::LocalRead { .. } | NodeKind::LocalStore { .. } => {
                self.replace_local(ir, aggs, node);
            }
            NodeKind::StructStore { .. } | NodeKind::BlkStore { .. } => {
                self.handle_struct_store(ir, aggs, node);
            }
            NodeKind::Call { .. } => {
                self.load_store_around_call(ir, aggs, node);
            }
            NodeKind::Return { .. } => {
                self.store_before_return(ir, aggs, node);
            }
            _ => {}
        }
    }

    // ---- scalar replacement -------------------------------------------

    fn replace_local(&mut self, ir: &mut MethodIr, aggs: &mut AggregateStore, node: NodeId) {
        let (local, offset, ty, value) = match ir.node(node).kind {
            NodeKind::LocalRead { local, offset, ty } => (local, offset, ty, None),
            NodeKind::LocalStore { local, offset, ty, value } => (local, offset, ty, Some(value)),
            _ => return,
        };
        let Some(agg) = aggs.get_mut(local) else { return };
        let Some(index) = agg.find_exact(offset) else {
            // Scalar access into the remainder: nothing to rewrite.
            return;
        };
        let rep = agg.replacements[index];
        debug_assert_eq!(ty, rep.ty);

        match value {
            Some(value) => {
                ir.node_mut(node).kind =
                    NodeKind::LocalStore { local: rep.local, offset: 0, ty, value };
                agg.replacements[index].needs_write_back = true;
                agg.replacements[index].needs_read_back = false;
            }
            None => {
                ir.node_mut(node).kind = NodeKind::LocalRead { local: rep.local, offset: 0, ty };
                if rep.needs_read_back {
                    agg.replacements[index].needs_read_back = false;
                    let read_back = create_read_back(ir, local, rep);
                    wrap_with_effect(ir, node, read_back);
                    // The replacement local now has a def embedded in the
                    // middle of a statement; downstream copy propagation
                    // must not move uses across it.
                    ir.local_mut(rep.local).redefined_in_embedded_statement = true;
                }
            }
        }
        self.made_changes = true;
    }

    fn insert_mid_tree_read_backs(
        &mut self,
        ir: &mut MethodIr,
        aggs: &mut AggregateStore,
        node: NodeId,
    ) -> NodeId {
        let mut cur = node;
        for agg_index in 0..aggs.len() {
            let local = aggs.info_at(agg_index).local;
            for i in 0..aggs.info_at(agg_index).replacements.len() {
                let rep = aggs.info_at(agg_index).replacements[i];
                if !rep.needs_read_back {
                    continue;
                }
                aggs.info_at_mut(agg_index).replacements[i].needs_read_back = false;
                let read_back = create_read_back(ir, local, rep);
                cur = wrap_with_effect(ir, cur, read_back);
                self.made_changes = true;
            }
        }
        self.has_pending_read_backs = false;
        cur
    }

    // ---- call / return boundaries -------------------------------------

    fn load_store_around_call(&mut self, ir: &mut MethodIr, aggs: &mut AggregateStore, call: NodeId) {
        let NodeKind::Call { args, ret_buf, ret_layout, .. } = ir.node(call).kind.clone() else {
            return;
        };

        for arg in args {
            let NodeKind::StructRead { local, offset, layout } = ir.node(arg).kind else {
                continue;
            };
            if aggs.get(local).is_none() {
                continue;
            }
            let size = ir.layout(layout).size;
            self.write_back_before_use(ir, aggs, arg, local, offset, size);
            if self.is_promoted_struct_local_dying(aggs, arg, local) {
                ir.node_mut(arg).flags.insert(NodeFlags::VAR_DEATH);
            }
        }

        if let Some(rb) = ret_buf {
            if let NodeKind::LocalAddr { local } = ir.node(rb).kind {
                if let Some(layout) = ret_layout {
                    let size = ir.layout(layout).size;
                    self.mark_for_read_back(aggs, local, 0, size);
                }
            }
        }
    }

    fn store_before_return(&mut self, ir: &mut MethodIr, aggs: &mut AggregateStore, ret: NodeId) {
        let NodeKind::Return { value: Some(value) } = ir.node(ret).kind else {
            return;
        };
        let NodeKind::StructRead { local, offset, layout } = ir.node(value).kind else {
            return;
        };
        if aggs.get(local).is_none() {
            return;
        }
        let size = ir.layout(layout).size;
        self.write_back_before_use(ir, aggs, value, local, offset, size);
    }

    /// Wrap `use_node` in write-backs for every overlapping replacement
    /// whose replacement local holds the freshest value.
    fn write_back_before_use(
        &mut self,
        ir: &mut MethodIr,
        aggs: &mut AggregateStore,
        use_node: NodeId,
        local: LocalId,
        offset: u32,
        size: u32,
    ) {
        let Some(agg) = aggs.get_mut(local) else { return };
        let range = agg.overlapping_range(offset, size);
        let mut cur = use_node;
        for i in range {
            let rep = agg.replacements[i];
            if rep.needs_write_back {
                agg.replacements[i].needs_write_back = false;
                let wb = create_write_back(ir, local, rep);
                cur = wrap_with_effect(ir, cur, wb);
                self.made_changes = true;
            }
        }
    }

    /// Mark replacements in `[offset, offset + size)` as stale: the home
    /// location was (or will be) updated directly.
    fn mark_for_read_back(
        &mut self,
        aggs: &mut AggregateStore,
        local: LocalId,
        offset: u32,
        size: u32,
    ) -> bool {
        let Some(agg) = aggs.get_mut(local) else {
            return false;
        };
        let mut any = false;
        for i in agg.overlapping_range(offset, size) {
            agg.replacements[i].needs_read_back = true;
            agg.replacements[i].needs_write_back = false;
            any = true;
        }
        if any {
            self.has_pending_read_backs = true;
            self.made_changes = true;
        }
        any
    }

    /// Whether a whole-struct use is the last relevant use of the local:
    /// the remainder dies and no replacement is pending a read-back.
    fn is_promoted_struct_local_dying(
        &self,
        aggs: &AggregateStore,
        node: NodeId,
        local: LocalId,
    ) -> bool {
        let Some(deaths) = self.liveness.deaths_for_struct_local(node) else {
            return false;
        };
        if !deaths.is_remainder_dying() {
            return false;
        }
        let agg = aggs.get(local).expect("caller checked");
        agg.replacements.iter().all(|r| !r.needs_read_back)
    }

    // ---- end of block --------------------------------------------------

    /// Flush pending read-backs (when live-out) and reset all replacement
    /// state so the next block starts with every replacement fresh.
    fn end_block(&mut self, ir: &mut MethodIr, aggs: &mut AggregateStore) {
        let block = self.current_block;
        let mut flushed: Vec<NodeId> = Vec::new();

        for agg_index in 0..aggs.len() {
            let local = aggs.info_at(agg_index).local;
            for i in 0..aggs.info_at(agg_index).replacements.len() {
                let rep = aggs.info_at(agg_index).replacements[i];
                debug_assert!(!(rep.needs_read_back && rep.needs_write_back));
                if rep.needs_read_back {
                    if self.liveness.is_replacement_live_out(block, local, i as u32) {
                        flushed.push(create_read_back(ir, local, rep));
                        self.made_changes = true;
                    }
                    aggs.info_at_mut(agg_index).replacements[i].needs_read_back = false;
                }
                aggs.info_at_mut(agg_index).replacements[i].needs_write_back = true;
            }
        }

        if !flushed.is_empty() {
            // Keep the read-backs ahead of the block's terminating
            // statement (a return) when there is one.
            let insert_at = {
                let stmts = &ir.blocks[block.0 as usize].statements;
                match stmts.last() {
                    Some(last) if tree_is_terminator(ir, last.root) => stmts.len() - 1,
                    _ => stmts.len(),
                }
            };
            let stmts = &mut ir.blocks[block.0 as usize].statements;
            for (k, root) in flushed.into_iter().enumerate() {
                stmts.insert(insert_at + k, Statement { root });
            }
        }

        self.has_pending_read_backs = false;
    }

    // ---- struct stores -------------------------------------------------

    fn handle_struct_store(&mut self, ir: &mut MethodIr, aggs: &mut AggregateStore, store: NodeId) {
        let (dst_local, layout_id, src) = match ir.node(store).kind {
            NodeKind::StructStore { local, offset, layout, src } => {
                (Some((local, offset)), layout, src)
            }
            NodeKind::BlkStore { addr: _, layout, src } => (None, layout, src),
            _ => return,
        };
        let size = ir.layout(layout_id).size;

        let dst_involved = dst_local
            .map(|(l, off)| has_overlapping_reps(aggs, l, off, size))
            .unwrap_or(false);

        let src_kind = ir.node(src).kind.clone();
        let (src_local, src_involved) = match src_kind {
            NodeKind::StructRead { local, offset, .. } => {
                (Some((local, offset)), has_overlapping_reps(aggs, local, offset, size))
            }
            _ => (None, false),
        };

        if !dst_involved && !src_involved {
            return;
        }

        match src_kind {
            NodeKind::InitPattern { pattern } => {
                let (local, offset) = dst_local.expect("init of a non-local cannot be involved");
                self.decompose_init(ir, aggs, store, local, offset, layout_id, pattern);
            }
            NodeKind::StructRead { .. } | NodeKind::BlkRead { .. } => {
                self.decompose_copy(
                    ir,
                    aggs,
                    store,
                    dst_local,
                    src,
                    src_local,
                    layout_id,
                    dst_involved,
                    src_involved,
                );
            }
            _ => {
                // The source is something decomposition cannot prove safe
                // (a call, or an opaque tree). Flush the participating
                // replacements around the store and leave the op alone.
                if let Some((l, off)) = src_local {
                    self.write_back_before_use(ir, aggs, src, l, off, size);
                }
                if let Some((l, off)) = dst_local {
                    self.mark_for_read_back(aggs, l, off, size);
                }
            }
        }
    }

    /// Trim partially-covered boundary replacements off an overlap range.
    ///
    /// A boundary replacement keeps bytes outside the store; its fresh
    /// value is written back first so the store sees it, and (for the
    /// destination side) it is marked stale afterwards.
    #[allow(clippy::too_many_arguments)]
    fn trim_boundary_reps(
        &mut self,
        ir: &mut MethodIr,
        aggs: &mut AggregateStore,
        local: LocalId,
        offset: u32,
        size: u32,
        is_dst: bool,
        pre_ops: &mut Vec<NodeId>,
        non_remainder_use: &mut bool,
    ) -> std::ops::Range<usize> {
        let agg = aggs.get(local).expect("involved side has info");
        let mut range = agg.overlapping_range(offset, size);

        if range.start < range.end {
            let first = agg.replacements[range.start];
            if first.offset < offset {
                if first.needs_write_back {
                    pre_ops.push(create_write_back(ir, local, first));
                    aggs.get_mut(local).unwrap().replacements[range.start].needs_write_back = false;
                }
                if is_dst {
                    aggs.get_mut(local).unwrap().replacements[range.start].needs_read_back = true;
                    self.has_pending_read_backs = true;
                    *non_remainder_use = true;
                }
                range.start += 1;
            }
        }
        if range.start < range.end {
            let agg = aggs.get(local).expect("involved side has info");
            let last = agg.replacements[range.end - 1];
            if last.end() > offset + size {
                if last.needs_write_back {
                    pre_ops.push(create_write_back(ir, local, last));
                    aggs.get_mut(local).unwrap().replacements[range.end - 1].needs_write_back =
                        false;
                }
                if is_dst {
                    aggs.get_mut(local).unwrap().replacements[range.end - 1].needs_read_back = true;
                    self.has_pending_read_backs = true;
                    *non_remainder_use = true;
                }
                range.end -= 1;
            }
        }
        range
    }

    fn decompose_init(
        &mut self,
        ir: &mut MethodIr,
        aggs: &mut AggregateStore,
        store: NodeId,
        local: LocalId,
        offset: u32,
        layout_id: LayoutId,
        pattern: u8,
    ) {
        let size = ir.layout(layout_id).size;
        let deaths = self.liveness.deaths_for_struct_local(store).cloned();
        let mut non_remainder_use = false;
        let mut ops: Vec<NodeId> = Vec::new();

        let range =
            self.trim_boundary_reps(ir, aggs, local, offset, size, true, &mut ops, &mut non_remainder_use);

        // Entries are replacements the pattern can be materialized into;
        // the rest fall back to the remainder and a later read-back.
        let mut entries: Vec<usize> = Vec::new();
        for i in range {
            let rep = aggs.get(local).unwrap().replacements[i];
            if can_init_primitive(rep.ty, pattern) {
                entries.push(i);
            } else {
                let agg = aggs.get_mut(local).unwrap();
                agg.replacements[i].needs_read_back = true;
                agg.replacements[i].needs_write_back = false;
                self.has_pending_read_backs = true;
            }
        }

        for &i in &entries {
            let rep = aggs.get(local).unwrap().replacements[i];
            let dying = deaths
                .as_ref()
                .map(|d| d.is_replacement_dying(i as u32))
                .unwrap_or(false);
            if !dying {
                let value = ir.new_pattern_const(rep.ty, pattern);
                ops.push(ir.new_local_store(rep.local, rep.ty, value));
            }
            let agg = aggs.get_mut(local).unwrap();
            agg.replacements[i].needs_write_back = true;
            agg.replacements[i].needs_read_back = false;
        }

        let mut remainder = significant_segments(ir.layout(layout_id));
        for &i in &entries {
            let rep = aggs.get(local).unwrap().replacements[i];
            remainder.subtract(Segment::new(rep.offset - offset, rep.end() - offset));
        }

        let remainder_dying = !non_remainder_use
            && deaths.as_ref().map(|d| d.is_remainder_dying()).unwrap_or(false);
        let strategy = determine_remainder_strategy(
            ir.layout(layout_id),
            &remainder,
            remainder_dying,
            Some(pattern),
        );

        match strategy {
            RemainderStrategy::None => {}
            RemainderStrategy::Primitive { offset: rel, ty } => {
                let value = ir.new_pattern_const(ty, pattern);
                ops.push(ir.new_field_store(local, offset + rel, ty, value));
            }
            RemainderStrategy::FullBlock => {
                let init = ir.add_node(NodeKind::InitPattern { pattern });
                ops.push(ir.add_node(NodeKind::StructStore {
                    local,
                    offset,
                    layout: layout_id,
                    src: init,
                }));
            }
        }

        replace_with_sequence(ir, store, ops);
        self.made_changes = true;
    }

    #[allow(clippy::too_many_arguments)]
    fn decompose_copy(
        &mut self,
        ir: &mut MethodIr,
        aggs: &mut AggregateStore,
        store: NodeId,
        dst_local: Option<(LocalId, u32)>,
        src: NodeId,
        src_local: Option<(LocalId, u32)>,
        layout_id: LayoutId,
        dst_involved: bool,
        src_involved: bool,
    ) {
        let size = ir.layout(layout_id).size;
        let dst_deaths: Option<StructDeaths> = if dst_involved {
            self.liveness.deaths_for_struct_local(store).cloned()
        } else {
            None
        };
        let src_deaths: Option<StructDeaths> = if src_involved {
            self.liveness.deaths_for_struct_local(src).cloned()
        } else {
            None
        };

        let mut pre_ops: Vec<NodeId> = Vec::new();
        let mut non_remainder_use = false;

        let dst_range = if dst_involved {
            let (l, off) = dst_local.expect("involved destination is a local");
            self.trim_boundary_reps(ir, aggs, l, off, size, true, &mut pre_ops, &mut non_remainder_use)
        } else {
            0..0
        };
        let src_range = if src_involved {
            let (l, off) = src_local.expect("involved source is a local");
            let mut ignore = false;
            self.trim_boundary_reps(ir, aggs, l, off, size, false, &mut pre_ops, &mut ignore)
        } else {
            0..0
        };

        // Merge the two sorted replacement lists into plan entries.
        let mut entries: Vec<Entry> = Vec::new();
        {
            let dst_base = dst_local.map(|(_, o)| o).unwrap_or(0);
            let src_base = src_local.map(|(_, o)| o).unwrap_or(0);
            let mut di = dst_range.start;
            let mut si = src_range.start;

            while di < dst_range.end || si < src_range.end {
                // A stale source replacement must be read back before the
                // copy consumes it.
                if si < src_range.end {
                    let (sl, _) = src_local.expect("src reps imply local");
                    let srep = aggs.get(sl).unwrap().replacements[si];
                    if srep.needs_read_back {
                        pre_ops.push(create_read_back(ir, sl, srep));
                        let agg = aggs.get_mut(sl).unwrap();
                        agg.replacements[si].needs_read_back = false;
                        debug_assert!(!agg.replacements[si].needs_write_back);
                    }
                }

                if di < dst_range.end && si < src_range.end {
                    let (dl, _) = dst_local.expect("dst reps imply local");
                    let (sl, _) = src_local.expect("src reps imply local");
                    let drep = aggs.get(dl).unwrap().replacements[di];
                    let srep = aggs.get(sl).unwrap().replacements[si];
                    let drel = drep.offset - dst_base;
                    let srel = srep.offset - src_base;

                    if srel + srep.ty.size() <= drel {
                        entries.push(Entry { to: None, from: Some(si), rel_offset: srel, ty: srep.ty });
                        si += 1;
                    } else if drel + drep.ty.size() <= srel {
                        entries.push(Entry { to: Some(di), from: None, rel_offset: drel, ty: drep.ty });
                        di += 1;
                    } else if drel == srel && drep.ty == srep.ty {
                        entries.push(Entry {
                            to: Some(di),
                            from: Some(si),
                            rel_offset: drel,
                            ty: drep.ty,
                        });
                        di += 1;
                        si += 1;
                    } else {
                        // Partial overlap between replacements: push the
                        // source's value into the struct and let a later
                        // iteration handle the destination from there.
                        if srep.needs_write_back {
                            pre_ops.push(create_write_back(ir, sl, srep));
                            aggs.get_mut(sl).unwrap().replacements[si].needs_write_back = false;
                        }
                        si += 1;
                    }
                } else if di < dst_range.end {
                    let (dl, _) = dst_local.expect("dst reps imply local");
                    let drep = aggs.get(dl).unwrap().replacements[di];
                    entries.push(Entry {
                        to: Some(di),
                        from: None,
                        rel_offset: drep.offset - dst_base,
                        ty: drep.ty,
                    });
                    di += 1;
                } else {
                    let (sl, _) = src_local.expect("src reps imply local");
                    let srep = aggs.get(sl).unwrap().replacements[si];
                    entries.push(Entry {
                        to: None,
                        from: Some(si),
                        rel_offset: srep.offset - src_base,
                        ty: srep.ty,
                    });
                    si += 1;
                }
            }
        }

        // Remainder of the copied range not handled by entries.
        let mut remainder = significant_segments(ir.layout(layout_id));
        for entry in &entries {
            remainder.subtract(entry.range());
        }

        let remainder_dying = dst_involved
            && !non_remainder_use
            && dst_deaths.as_ref().map(|d| d.is_remainder_dying()).unwrap_or(false);
        let strategy =
            determine_remainder_strategy(ir.layout(layout_id), &remainder, remainder_dying, None);

        let dying_to = |e: &Entry| -> bool {
            match (e.to, &dst_deaths) {
                (Some(i), Some(d)) => d.is_replacement_dying(i as u32),
                _ => false,
            }
        };
        let skip_entry = |aggs: &AggregateStore, e: &Entry| -> bool {
            if dying_to(e) {
                return true;
            }
            if e.to.is_none()
                && dst_involved
                && dst_deaths.as_ref().map(|d| d.is_remainder_dying()).unwrap_or(false)
            {
                return true;
            }
            // The full-block remainder already carries this range with
            // identical bytes when the source replacement is clean.
            if e.to.is_none() && strategy == RemainderStrategy::FullBlock {
                if let Some(si) = e.from {
                    let (sl, _) = src_local.expect("src reps imply local");
                    if !aggs.get(sl).unwrap().replacements[si].needs_write_back {
                        return true;
                    }
                }
            }
            false
        };

        // Emitting the remainder last is preferred, but a block remainder
        // copies from the source's home location; when fresh values live
        // in source replacement locals the bulk copy must go first so the
        // entry stores land on top of it.
        let remainder_first = src_involved
            && match strategy {
                RemainderStrategy::FullBlock => true,
                RemainderStrategy::Primitive { offset, ty } => entries.iter().any(|e| {
                    !skip_entry(aggs, e)
                        && e.rel_offset < offset + ty.size()
                        && offset < e.rel_offset + e.ty.size()
                }),
                RemainderStrategy::None => false,
            };

        // Pre-write-back reference-typed source replacements when a
        // GC-bearing full block remains: their final store then goes
        // through the block copy's write barrier instead of one barrier
        // per field.
        if strategy == RemainderStrategy::FullBlock
            && dst_local.is_none()
            && ir.layout(layout_id).has_gc_ref()
        {
            for entry in &entries {
                if entry.ty != PrimType::Ref {
                    continue;
                }
                let Some(si) = entry.from else { continue };
                let (sl, _) = src_local.expect("src reps imply local");
                let srep = aggs.get(sl).unwrap().replacements[si];
                if srep.needs_write_back {
                    pre_ops.push(create_write_back(ir, sl, srep));
                    aggs.get_mut(sl).unwrap().replacements[si].needs_write_back = false;
                }
            }
        }

        // Count how many derived accesses go through an indirection; more
        // than one means the address must be reusable or spilled.
        let dst_is_indir = dst_local.is_none();
        let src_is_indir = src_local.is_none() && matches!(ir.node(src).kind, NodeKind::BlkRead { .. });
        let mut addr_uses = 0usize;
        for entry in &entries {
            if skip_entry(aggs, entry) {
                continue;
            }
            if (dst_is_indir && entry.to.is_none()) || (src_is_indir && entry.from.is_none()) {
                addr_uses += 1;
            }
        }
        if strategy != RemainderStrategy::None && (dst_is_indir || src_is_indir) {
            addr_uses += 1;
        }

        let indir_addr = if dst_is_indir {
            match ir.node(store).kind {
                NodeKind::BlkStore { addr, .. } => Some(addr),
                _ => None,
            }
        } else if src_is_indir {
            match ir.node(src).kind {
                NodeKind::BlkRead { addr, .. } => Some(addr),
                _ => None,
            }
        } else {
            None
        };

        let addr_template = match indir_addr {
            Some(addr) if addr_uses > 1 => {
                if address_is_reusable(ir, aggs, addr) {
                    // More uses of the same address local follow; it no
                    // longer dies at the original reference.
                    ir.node_mut(addr).flags.remove(NodeFlags::VAR_DEATH);
                    Some(addr)
                } else {
                    let fresh = ir.add_local(LocalDesc::prim(PrimType::I64));
                    let spill = ir.new_local_store(fresh, PrimType::I64, addr);
                    pre_ops.push(spill);
                    Some(ir.new_local_read(fresh, PrimType::I64))
                }
            }
            other => other,
        };

        let dst_access = match dst_local {
            Some((l, off)) => LocationAccess::Local { local: l, base: off },
            None => LocationAccess::Indir {
                template: addr_template.expect("indirect store has an address"),
            },
        };
        let src_access = match src_local {
            Some((l, off)) => LocationAccess::Local { local: l, base: off },
            None => LocationAccess::Indir {
                template: addr_template.expect("indirect source has an address"),
            },
        };

        let mut ops = pre_ops;

        let emit_remainder = |ir: &mut MethodIr, ops: &mut Vec<NodeId>| match strategy {
            RemainderStrategy::None => {}
            RemainderStrategy::Primitive { offset, ty } => {
                let value = src_access.create_read(ir, offset, ty);
                ops.push(dst_access.create_store(ir, offset, ty, value));
            }
            RemainderStrategy::FullBlock => {
                let block_src = src_access.create_block_read(ir, layout_id);
                ops.push(dst_access.create_block_store(ir, layout_id, block_src));
            }
        };

        if remainder_first {
            emit_remainder(ir, &mut ops);
        }

        for entry in &entries {
            // Destination replacements now hold the newest value whether
            // or not the store itself was emitted.
            if let Some(di) = entry.to {
                let (dl, _) = dst_local.expect("dst reps imply local");
                let agg = aggs.get_mut(dl).unwrap();
                agg.replacements[di].needs_write_back = true;
                agg.replacements[di].needs_read_back = false;
            }

            if skip_entry(aggs, entry) {
                continue;
            }

            let value = match entry.from {
                Some(si) => {
                    let (sl, _) = src_local.expect("src reps imply local");
                    let srep = aggs.get(sl).unwrap().replacements[si];
                    let read = ir.new_local_read(srep.local, srep.ty);
                    if src_deaths
                        .as_ref()
                        .map(|d| d.is_replacement_dying(si as u32))
                        .unwrap_or(false)
                    {
                        ir.node_mut(read).flags.insert(NodeFlags::VAR_DEATH);
                    }
                    read
                }
                None => src_access.create_read(ir, entry.rel_offset, entry.ty),
            };

            let op = match entry.to {
                Some(di) => {
                    let (dl, _) = dst_local.expect("dst reps imply local");
                    let drep = aggs.get(dl).unwrap().replacements[di];
                    ir.new_local_store(drep.local, drep.ty, value)
                }
                None => dst_access.create_store(ir, entry.rel_offset, entry.ty, value),
            };
            ops.push(op);
        }

        if !remainder_first {
            emit_remainder(ir, &mut ops);
        }

        replace_with_sequence(ir, store, ops);
        self.made_changes = true;
    }
}

/// Whether the node tree can be duplicated per derived access without
/// changing behavior: invariant leaves only.
fn address_is_reusable(ir: &MethodIr, aggs: &AggregateStore, addr: NodeId) -> bool {
    match ir.node(addr).kind {
        NodeKind::IntConst { .. } => true,
        // A scalar address local cannot alias the promoted aggregate.
        NodeKind::LocalRead { local, .. } => aggs.get(local).is_none(),
        NodeKind::LocalAddr { local } => aggs.get(local).is_none(),
        _ => false,
    }
}

fn has_overlapping_reps(aggs: &AggregateStore, local: LocalId, offset: u32, size: u32) -> bool {
    aggs.get(local)
        .map(|agg| !agg.overlapping_range(offset, size).is_empty())
        .unwrap_or(false)
}

/// Whether the statement is a control transfer the end-of-block flushes
/// must stay ahead of.
fn tree_is_terminator(ir: &MethodIr, root: NodeId) -> bool {
    ir.execution_order(root)
        .iter()
        .any(|&n| matches!(ir.node(n).kind, NodeKind::Return { .. }))
}

/// Choose how to cover the remainder once entries are planned.
fn determine_remainder_strategy(
    layout: &ClassLayout,
    remainder: &StructSegments,
    remainder_dying: bool,
    init_pattern: Option<u8>,
) -> RemainderStrategy {
    if remainder_dying {
        return RemainderStrategy::None;
    }
    if remainder.is_empty() {
        return RemainderStrategy::None;
    }

    if let Some(hull) = remainder.covering_segment() {
        let hull_size = hull.size();
        let mut ty = None;
        if hull_size == 8 && hull.start % 8 == 0 {
            ty = Some(if layout.is_gc_slot(hull.start) {
                PrimType::Ref
            } else {
                PrimType::I64
            });
        } else if !layout.intersects_gc_ref(hull.start, hull_size) {
            ty = PrimType::int_of_size(hull_size);
        }

        if let Some(ty) = ty {
            let init_ok = match init_pattern {
                Some(pattern) => can_init_primitive(ty, pattern),
                None => true,
            };
            if init_ok {
                return RemainderStrategy::Primitive { offset: hull.start, ty };
            }
        }
    }

    RemainderStrategy::FullBlock
}
