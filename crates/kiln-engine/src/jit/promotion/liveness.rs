//! Liveness for promoted aggregates
//!
//! Tracks one dense bit per aggregate element: index `base` is the
//! remainder, `base + 1 + i` is replacement `i`. Classic backwards
//! iterative dataflow over the blocks (single pass when the CFG has no
//! back edges), with exception-handler live sets unioned into every block
//! of a try region. A finalization pass walks each block backwards to
//! stamp death information onto the IR: scalar references get a per-node
//! dying flag, aggregate references get a [`StructDeaths`] bit vector.

use rustc_hash::FxHashMap;

use crate::jit::ir::{BlockId, EhKind, LocalId, MethodIr, NodeFlags, NodeId, NodeKind};

use super::AggregateStore;

/// Dense bit set sized once at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    /// Empty set with capacity for `len` bits.
    pub fn new(len: u32) -> BitSet {
        BitSet {
            words: vec![0; (len as usize).div_ceil(64)],
        }
    }

    /// Whether bit `i` is set.
    pub fn contains(&self, i: u32) -> bool {
        (self.words[(i / 64) as usize] >> (i % 64)) & 1 != 0
    }

    /// Set bit `i`.
    pub fn insert(&mut self, i: u32) {
        self.words[(i / 64) as usize] |= 1 << (i % 64);
    }

    /// Clear bit `i`.
    pub fn remove(&mut self, i: u32) {
        self.words[(i / 64) as usize] &= !(1 << (i % 64));
    }

    /// Clear all bits.
    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    /// Union `other` in; reports whether anything changed.
    pub fn union_with(&mut self, other: &BitSet) -> bool {
        let mut changed = false;
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            let new = *w | o;
            changed |= new != *w;
            *w = new;
        }
        changed
    }

    /// `self = use ∪ (out − def)`, the backwards transfer function.
    pub fn assign_liveness(&mut self, var_use: &BitSet, var_def: &BitSet, out: &BitSet) {
        for i in 0..self.words.len() {
            self.words[i] = var_use.words[i] | (out.words[i] & !var_def.words[i]);
        }
    }

    /// Number of set bits.
    pub fn count(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }
}

/// Death facts for one aggregate reference: bit 0 is the remainder, bit
/// `1 + i` is replacement `i`.
#[derive(Debug, Clone)]
pub struct StructDeaths {
    bits: BitSet,
}

impl StructDeaths {
    /// Whether the non-promoted bytes die at this reference.
    pub fn is_remainder_dying(&self) -> bool {
        self.bits.contains(0)
    }

    /// Whether replacement `i` dies at this reference.
    pub fn is_replacement_dying(&self, i: u32) -> bool {
        self.bits.contains(1 + i)
    }
}

#[derive(Debug, Clone)]
struct BlockLiveness {
    var_use: BitSet,
    var_def: BitSet,
    live_in: BitSet,
    live_out: BitSet,
}

/// How one IR node touches a single aggregate.
enum LocalRef {
    Prim { local: LocalId, offset: u32, size: u32, is_def: bool },
    Struct { local: LocalId, offset: u32, size: u32, is_def: bool },
    /// Address-of used as a retbuf: a def of unknown extent.
    Addr,
}

fn classify(ir: &MethodIr, node: NodeId) -> Option<LocalRef> {
    match &ir.node(node).kind {
        NodeKind::LocalRead { local, offset, ty } => Some(LocalRef::Prim {
            local: *local,
            offset: *offset,
            size: ty.size(),
            is_def: false,
        }),
        NodeKind::LocalStore { local, offset, ty, .. } => Some(LocalRef::Prim {
            local: *local,
            offset: *offset,
            size: ty.size(),
            is_def: true,
        }),
        NodeKind::StructRead { local, offset, layout } => Some(LocalRef::Struct {
            local: *local,
            offset: *offset,
            size: ir.layout(*layout).size,
            is_def: false,
        }),
        NodeKind::StructStore { local, offset, layout, .. } => Some(LocalRef::Struct {
            local: *local,
            offset: *offset,
            size: ir.layout(*layout).size,
            is_def: true,
        }),
        NodeKind::LocalAddr { .. } => Some(LocalRef::Addr),
        _ => None,
    }
}

/// Computed liveness for all promoted aggregates of one method.
pub struct PromotionLiveness {
    base_index: FxHashMap<LocalId, u32>,
    num_elements: u32,
    bb: Vec<BlockLiveness>,
    deaths: FxHashMap<NodeId, StructDeaths>,
}

impl PromotionLiveness {
    /// Run the analysis. Stamps per-node dying flags into `ir` and keeps
    /// aggregate death vectors keyed by node.
    pub fn compute(ir: &mut MethodIr, aggregates: &AggregateStore) -> PromotionLiveness {
        let mut base_index = FxHashMap::default();
        let mut next = 0u32;
        for info in aggregates.iter() {
            base_index.insert(info.local, next);
            next += 1 + info.replacements.len() as u32;
        }

        let mut liveness = PromotionLiveness {
            base_index,
            num_elements: next,
            bb: vec![
                BlockLiveness {
                    var_use: BitSet::new(next),
                    var_def: BitSet::new(next),
                    live_in: BitSet::new(next),
                    live_out: BitSet::new(next),
                };
                ir.blocks.len()
            ],
            deaths: FxHashMap::default(),
        };

        liveness.compute_use_def(ir, aggregates);
        liveness.inter_block(ir);
        liveness.fill_in(ir, aggregates);
        liveness
    }

    fn element_base(&self, local: LocalId) -> Option<u32> {
        self.base_index.get(&local).copied()
    }

    // ---- per-block use/def --------------------------------------------

    fn compute_use_def(&mut self, ir: &MethodIr, aggregates: &AggregateStore) {
        for b in 0..ir.blocks.len() {
            let mut var_use = BitSet::new(self.num_elements);
            let mut var_def = BitSet::new(self.num_elements);

            for stmt in &ir.blocks[b].statements {
                // Defs under a conditional subtree may not execute; they
                // must not kill anything.
                let conditional = ir.tree_has_select(stmt.root);
                for node in ir.execution_order(stmt.root) {
                    self.mark_use_def(ir, aggregates, node, conditional, &mut var_use, &mut var_def);
                }
            }

            self.bb[b].var_use = var_use;
            self.bb[b].var_def = var_def;
        }
    }

    fn mark_use_def(
        &self,
        ir: &MethodIr,
        aggregates: &AggregateStore,
        node: NodeId,
        conditional: bool,
        var_use: &mut BitSet,
        var_def: &mut BitSet,
    ) {
        let Some(r) = classify(ir, node) else { return };

        let mark = |index: u32, is_use: bool, is_def: bool, var_use: &mut BitSet, var_def: &mut BitSet| {
            if is_use && !var_def.contains(index) {
                var_use.insert(index);
            }
            if is_def && !conditional {
                var_def.insert(index);
            }
        };

        match r {
            LocalRef::Addr => {
                // Retbuf def of unknown extent: makes nothing dead,
                // defines nothing for killing purposes.
            }
            LocalRef::Prim { local, offset, size, is_def } => {
                let Some(agg) = aggregates.get(local) else { return };
                let Some(base) = self.element_base(local) else { return };
                match agg.find_exact(offset) {
                    Some(i) => {
                        mark(base + 1 + i as u32, !is_def, is_def, var_use, var_def);
                    }
                    None => {
                        let full_def = is_def
                            && agg.unpromoted_min >= offset
                            && agg.unpromoted_max <= offset + size;
                        mark(base, !is_def, full_def, var_use, var_def);
                    }
                }
            }
            LocalRef::Struct { local, offset, size, is_def } => {
                let Some(agg) = aggregates.get(local) else { return };
                let Some(base) = self.element_base(local) else { return };
                for i in agg.overlapping_range(offset, size) {
                    let rep = &agg.replacements[i];
                    let full_field_def =
                        is_def && offset <= rep.offset && offset + size >= rep.end();
                    mark(base + 1 + i as u32, !is_def, full_field_def, var_use, var_def);
                }
                let full_def = is_def
                    && agg.unpromoted_min >= offset
                    && agg.unpromoted_max <= offset + size;
                mark(base, !is_def, full_def, var_use, var_def);
            }
        }
    }

    // ---- fixed point --------------------------------------------------

    fn inter_block(&mut self, ir: &MethodIr) {
        let n = ir.blocks.len();
        let mut has_back_edge = ir.blocks.iter().enumerate().any(|(i, b)| {
            ir.block_has_exn_flow(BlockId(i as u32))
                || b.successors.iter().any(|s| (s.0 as usize) <= i)
        });

        loop {
            let mut changed = false;
            for b in (0..n).rev() {
                let block_id = BlockId(b as u32);

                let mut live_out = BitSet::new(self.num_elements);
                for succ in &ir.blocks[b].successors {
                    live_out.union_with(&self.bb[succ.0 as usize].live_in);
                    has_back_edge |= (succ.0 as usize) <= b;
                }

                let mut live_in = BitSet::new(self.num_elements);
                live_in.assign_liveness(&self.bb[b].var_use, &self.bb[b].var_def, &live_out);

                if ir.block_has_exn_flow(block_id) {
                    let mut eh = BitSet::new(self.num_elements);
                    self.add_handler_live_vars(ir, block_id, &mut eh);
                    live_in.union_with(&eh);
                    live_out.union_with(&eh);
                }

                if live_in != self.bb[b].live_in {
                    self.bb[b].live_in = live_in;
                    changed = true;
                }
                self.bb[b].live_out = live_out;
            }

            if !changed || !has_back_edge {
                break;
            }
        }
    }

    /// Union the live-in sets of every handler reachable from `block` by
    /// implicit exception flow.
    fn add_handler_live_vars(&self, ir: &MethodIr, block: BlockId, out: &mut BitSet) {
        let b = &ir.blocks[block.0 as usize];

        let mut region = b.try_index;
        while let Some(idx) = region {
            let eh = &ir.eh_regions[idx.0 as usize];
            if let Some(filter) = eh.filter_entry {
                out.union_with(&self.bb[filter.0 as usize].live_in);
                // A stack walk can happen between the filter returning and
                // the handler running; the try body must keep the
                // handler's live-ins alive too.
                out.union_with(&self.bb[eh.handler_entry.0 as usize].live_in);
            } else {
                out.union_with(&self.bb[eh.handler_entry.0 as usize].live_in);
            }
            region = eh.enclosing;
        }

        // Inside a filter, enclosed fault/finally handlers run during the
        // second pass of exception handling; their live-ins are exception
        // successors of every filter block.
        if let Some(filter_region) = b.filter_index {
            for i in (0..filter_region.0).rev() {
                let mut enclosing = ir.eh_regions[i as usize].enclosing;
                let mut is_enclosed = false;
                while let Some(idx) = enclosing {
                    if idx == filter_region {
                        is_enclosed = true;
                        break;
                    }
                    enclosing = ir.eh_regions[idx.0 as usize].enclosing;
                }
                if !is_enclosed {
                    break;
                }
                let enclosed = &ir.eh_regions[i as usize];
                if matches!(enclosed.kind, EhKind::Finally | EhKind::Fault) {
                    out.union_with(&self.bb[enclosed.handler_entry.0 as usize].live_in);
                }
            }
        }
    }

    // ---- finalization -------------------------------------------------

    fn fill_in(&mut self, ir: &mut MethodIr, aggregates: &AggregateStore) {
        for b in 0..ir.blocks.len() {
            let block_id = BlockId(b as u32);
            if ir.blocks[b].statements.is_empty() {
                continue;
            }

            let mut volatile = BitSet::new(self.num_elements);
            if ir.block_has_exn_flow(block_id) {
                self.add_handler_live_vars(ir, block_id, &mut volatile);
            }

            let mut life = self.bb[b].live_out.clone();

            let stmts: Vec<NodeId> = ir.blocks[b].statements.iter().map(|s| s.root).collect();
            for root in stmts.into_iter().rev() {
                let conditional = ir.tree_has_select(root);
                let order = ir.execution_order(root);
                for node in order.into_iter().rev() {
                    if conditional {
                        // Conditionally-executed defs neither die nor kill.
                        if let Some(LocalRef::Prim { is_def: true, .. })
                        | Some(LocalRef::Struct { is_def: true, .. }) = classify(ir, node)
                        {
                            continue;
                        }
                    }
                    self.fill_in_node(ir, aggregates, node, &mut life, &volatile);
                }
            }
        }
    }

    fn fill_in_node(
        &mut self,
        ir: &mut MethodIr,
        aggregates: &AggregateStore,
        node: NodeId,
        life: &mut BitSet,
        volatile: &BitSet,
    ) {
        let Some(r) = classify(ir, node) else { return };

        match r {
            LocalRef::Addr => {
                // Retbufs are defs of unknown extent: never dead, never
                // killing.
            }
            LocalRef::Prim { local, offset, size, is_def } => {
                let Some(agg) = aggregates.get(local) else { return };
                let Some(base) = self.element_base(local) else { return };

                let index = match agg.find_exact(offset) {
                    Some(i) => base + 1 + i as u32,
                    None => base,
                };
                let full_def = match agg.find_exact(offset) {
                    Some(_) => is_def,
                    None => {
                        is_def && agg.unpromoted_min >= offset && agg.unpromoted_max <= offset + size
                    }
                };

                if life.contains(index) {
                    ir.node_mut(node).flags.remove(NodeFlags::VAR_DEATH);
                    if full_def && !volatile.contains(index) {
                        life.remove(index);
                    }
                } else {
                    ir.node_mut(node).flags.insert(NodeFlags::VAR_DEATH);
                    if !is_def {
                        life.insert(index);
                    }
                }
            }
            LocalRef::Struct { local, offset, size, is_def } => {
                let Some(agg) = aggregates.get(local) else { return };
                let Some(base) = self.element_base(local) else { return };

                let mut deaths = BitSet::new(1 + agg.replacements.len() as u32);

                for i in agg.overlapping_range(offset, size) {
                    let rep = &agg.replacements[i];
                    let index = base + 1 + i as u32;
                    if life.contains(index) {
                        let full_field_def =
                            is_def && offset <= rep.offset && offset + size >= rep.end();
                        if full_field_def && !volatile.contains(index) {
                            life.remove(index);
                        }
                    } else {
                        deaths.insert(1 + i as u32);
                        if !is_def {
                            life.insert(index);
                        }
                    }
                }

                if life.contains(base) {
                    let full_def = is_def
                        && agg.unpromoted_min >= offset
                        && agg.unpromoted_max <= offset + size;
                    if full_def && !volatile.contains(base) {
                        life.remove(base);
                    }
                } else {
                    deaths.insert(0);
                    if !is_def {
                        life.insert(base);
                    }
                }

                self.deaths.insert(node, StructDeaths { bits: deaths });
            }
        }
    }

    // ---- queries ------------------------------------------------------

    /// Whether replacement `index` of `local` is live when `block` exits.
    pub fn is_replacement_live_out(&self, block: BlockId, local: LocalId, index: u32) -> bool {
        let Some(base) = self.element_base(local) else {
            return false;
        };
        self.bb[block.0 as usize].live_out.contains(base + 1 + index)
    }

    /// Whether the remainder of `local` is live when `block` exits.
    pub fn is_remainder_live_out(&self, block: BlockId, local: LocalId) -> bool {
        let Some(base) = self.element_base(local) else {
            return false;
        };
        self.bb[block.0 as usize].live_out.contains(base)
    }

    /// Death facts for an aggregate-typed local reference node.
    pub fn deaths_for_struct_local(&self, node: NodeId) -> Option<&StructDeaths> {
        self.deaths.get(&node)
    }

    /// Live-in count for a block, for tests and diagnostics.
    pub fn live_in_count(&self, block: BlockId) -> u32 {
        self.bb[block.0 as usize].live_in.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::{
        ClassLayout, EhIndex, EhRegion, FieldDef, LayoutFlags, LocalDesc, LocalType, PrimType,
    };
    use crate::jit::promotion::{AggregateInfo, Replacement};

    /// Layout { int @0, int @4, int @8, int @12 }, one aggregate local
    /// with replacements for fields 0 and 4.
    fn setup() -> (MethodIr, AggregateStore, LocalId, LocalId, LocalId) {
        let mut ir = MethodIr::new();
        let layout = ir.add_layout(ClassLayout {
            size: 16,
            fields: (0..4)
                .map(|i| FieldDef { offset: i * 4, size: 4, ty: Some(PrimType::I32) })
                .collect(),
            flags: LayoutFlags::empty(),
            gc_slots: vec![],
        });
        let v = ir.add_local(LocalDesc::aggregate(layout));
        let r0 = ir.add_local(LocalDesc::prim(PrimType::I32));
        let r1 = ir.add_local(LocalDesc::prim(PrimType::I32));

        let aggs = AggregateStore::from_infos(vec![AggregateInfo {
            local: v,
            replacements: vec![
                Replacement::new(0, PrimType::I32, r0),
                Replacement::new(4, PrimType::I32, r1),
            ],
            unpromoted_min: 8,
            unpromoted_max: 16,
        }]);
        (ir, aggs, v, r0, r1)
    }

    fn layout_of(ir: &MethodIr, v: LocalId) -> crate::jit::ir::LayoutId {
        match ir.local(v).ty {
            LocalType::Struct(l) => l,
            LocalType::Prim(_) => unreachable!(),
        }
    }

    #[test]
    fn test_straightline_death() {
        let (mut ir, aggs, v, _, _) = setup();
        let entry = BlockId(0);
        let sink = ir.add_local(LocalDesc::prim(PrimType::I32));

        // read v@0; read v@0 again; the second is the death.
        let read1 = ir.new_field_read(v, 0, PrimType::I32);
        let st1 = ir.new_local_store(sink, PrimType::I32, read1);
        ir.add_statement(entry, st1);
        let read2 = ir.new_field_read(v, 0, PrimType::I32);
        let st2 = ir.new_local_store(sink, PrimType::I32, read2);
        ir.add_statement(entry, st2);

        let liveness = PromotionLiveness::compute(&mut ir, &aggs);

        assert!(!ir.node(read1).flags.contains(NodeFlags::VAR_DEATH));
        assert!(ir.node(read2).flags.contains(NodeFlags::VAR_DEATH));
        assert!(!liveness.is_replacement_live_out(entry, v, 0));
    }

    #[test]
    fn test_whole_struct_use_deaths() {
        let (mut ir, aggs, v, _, _) = setup();
        let layout = layout_of(&ir, v);
        let entry = BlockId(0);

        // One whole-struct use; everything dies at it.
        let src = ir.add_node(NodeKind::StructRead { local: v, offset: 0, layout });
        let call = ir.add_node(NodeKind::Call {
            args: vec![src],
            ret_buf: None,
            ret_ty: None,
            ret_layout: None,
        });
        ir.add_statement(entry, call);

        let liveness = PromotionLiveness::compute(&mut ir, &aggs);
        let deaths = liveness.deaths_for_struct_local(src).expect("deaths recorded");
        assert!(deaths.is_remainder_dying());
        assert!(deaths.is_replacement_dying(0));
        assert!(deaths.is_replacement_dying(1));
    }

    #[test]
    fn test_loop_keeps_elements_alive() {
        let (mut ir, aggs, v, _, _) = setup();
        let sink = ir.add_local(LocalDesc::prim(PrimType::I32));

        // entry(0) -> loop(1) -> loop(1) | exit(2)
        let loop_b = ir.add_block(10.0);
        let exit = ir.add_block(1.0);
        ir.blocks[0].successors = vec![loop_b];
        ir.blocks[loop_b.0 as usize].successors = vec![loop_b, exit];

        // Loop body reads v@0, so the replacement stays live around the
        // back edge.
        let read = ir.new_field_read(v, 0, PrimType::I32);
        let st = ir.new_local_store(sink, PrimType::I32, read);
        ir.add_statement(loop_b, st);

        let liveness = PromotionLiveness::compute(&mut ir, &aggs);
        assert!(liveness.is_replacement_live_out(BlockId(0), v, 0));
        assert!(liveness.is_replacement_live_out(loop_b, v, 0));
        assert!(!liveness.is_replacement_live_out(exit, v, 0));
        // The read in the loop is never a death.
        assert!(!ir.node(read).flags.contains(NodeFlags::VAR_DEATH));
    }

    #[test]
    fn test_full_def_kills_only_unconditionally() {
        let (mut ir, aggs, v, _, _) = setup();
        let entry = BlockId(0);
        let sink = ir.add_local(LocalDesc::prim(PrimType::I32));

        // Conditional def: (cond ? (v0 = 1) : 2) — must not kill v@0.
        let cond = ir.add_node(NodeKind::IntConst { value: 1, ty: PrimType::I32 });
        let one = ir.add_node(NodeKind::IntConst { value: 1, ty: PrimType::I32 });
        let def = ir.new_field_store(v, 0, PrimType::I32, one);
        let two = ir.add_node(NodeKind::IntConst { value: 2, ty: PrimType::I32 });
        let sel = ir.add_node(NodeKind::Select { cond, when_true: def, when_false: two });
        ir.add_statement(entry, sel);

        // Later read keeps it live.
        let read = ir.new_field_read(v, 0, PrimType::I32);
        let st = ir.new_local_store(sink, PrimType::I32, read);
        ir.add_statement(entry, st);

        let liveness = PromotionLiveness::compute(&mut ir, &aggs);
        // v@0 is live into the block: the conditional def did not kill it.
        assert!(liveness.live_in_count(entry) >= 1);
    }

    #[test]
    fn test_eh_flow_keeps_handler_live_ins() {
        let (mut ir, aggs, v, _, _) = setup();
        let sink = ir.add_local(LocalDesc::prim(PrimType::I32));

        // Block 1 is a try body, block 2 its catch handler, block 3 exit.
        let try_b = ir.add_block(1.0);
        let handler = ir.add_block(0.5);
        let exit = ir.add_block(1.0);
        ir.blocks[0].successors = vec![try_b];
        ir.blocks[try_b.0 as usize].successors = vec![exit];
        ir.blocks[handler.0 as usize].successors = vec![exit];

        let region = EhIndex(0);
        ir.eh_regions.push(EhRegion {
            kind: EhKind::Catch,
            handler_entry: handler,
            filter_entry: None,
            enclosing: None,
        });
        ir.blocks[try_b.0 as usize].try_index = Some(region);

        // The handler reads v@0.
        let read = ir.new_field_read(v, 0, PrimType::I32);
        let st = ir.new_local_store(sink, PrimType::I32, read);
        ir.add_statement(handler, st);

        // The try body fully defines v@0; without EH flow that would kill
        // it, but the handler may observe the pre-store value.
        let one = ir.add_node(NodeKind::IntConst { value: 1, ty: PrimType::I32 });
        let def = ir.new_field_store(v, 0, PrimType::I32, one);
        ir.add_statement(try_b, def);

        let liveness = PromotionLiveness::compute(&mut ir, &aggs);
        // Live into the try body because the handler needs it.
        assert!(liveness.is_replacement_live_out(BlockId(0), v, 0));
    }

    #[test]
    fn test_partial_struct_def_kills_covered_field_only() {
        let (mut ir, aggs, v, _, _) = setup();
        let entry = BlockId(0);
        let sink = ir.add_local(LocalDesc::prim(PrimType::I32));

        // Narrow layout covering bytes [0, 8): fields 0 and 4.
        let narrow = ir.add_layout(ClassLayout {
            size: 8,
            fields: vec![
                FieldDef { offset: 0, size: 4, ty: Some(PrimType::I32) },
                FieldDef { offset: 4, size: 4, ty: Some(PrimType::I32) },
            ],
            flags: LayoutFlags::empty(),
            gc_slots: vec![],
        });

        // Reads of v@0 and v@4 below keep both live...
        let init = ir.add_node(NodeKind::InitPattern { pattern: 0 });
        let def = ir.add_node(NodeKind::StructStore { local: v, offset: 0, layout: narrow, src: init });
        ir.add_statement(entry, def);

        let r0 = ir.new_field_read(v, 0, PrimType::I32);
        let s0 = ir.new_local_store(sink, PrimType::I32, r0);
        ir.add_statement(entry, s0);
        let r1 = ir.new_field_read(v, 4, PrimType::I32);
        let s1 = ir.new_local_store(sink, PrimType::I32, r1);
        ir.add_statement(entry, s1);

        let liveness = PromotionLiveness::compute(&mut ir, &aggs);
        // The partial def covers both replacements fully, so nothing is
        // live into the block.
        assert_eq!(liveness.live_in_count(entry), 0);
        let deaths = liveness.deaths_for_struct_local(def).unwrap();
        // Both fields are consumed after the def, so neither dies at it;
        // the never-read remainder does.
        assert!(!deaths.is_replacement_dying(0));
        assert!(!deaths.is_replacement_dying(1));
        assert!(deaths.is_remainder_dying());
    }
}
