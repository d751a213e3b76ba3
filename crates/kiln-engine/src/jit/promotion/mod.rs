//! Physical struct promotion
//!
//! Replaces hot primitive-typed ranges of aggregate locals with fresh
//! scalar locals, rewrites every use, and keeps the remaining aggregate
//! bytes consistent with read-backs and write-backs around calls,
//! returns, throwing sites and block copies.
//!
//! The phase runs strictly in four steps, each reading only what earlier
//! steps produced: profile collection ([`access`]), replacement selection
//! ([`picker`]), element liveness ([`liveness`]), and the rewrite itself
//! ([`decompose`]). All state lives for a single method compilation.

pub mod access;
pub mod decompose;
pub mod liveness;
pub mod picker;
pub mod segments;

use once_cell::sync::OnceCell;
use rustc_hash::FxHashMap;

use crate::jit::ir::{LocalId, MethodIr, NodeId, PrimType, Statement};

pub use access::{collect_profiles, Access, AccessKindFlags, AccessType, LocalProfiles, LocalUses};
pub use decompose::ReplaceVisitor;
pub use liveness::{PromotionLiveness, StructDeaths};
pub use picker::{pick_promotions, significant_segments};
pub use segments::{Segment, StructSegments};

/// A scalar local standing in for one byte range of an aggregate.
///
/// `needs_write_back` means the replacement local holds a newer value
/// than the aggregate's home location; `needs_read_back` the opposite.
/// At most one of the two is set.
#[derive(Debug, Clone, Copy)]
pub struct Replacement {
    /// Byte offset of the replaced range in the aggregate.
    pub offset: u32,
    /// Type of the replaced range.
    pub ty: PrimType,
    /// The fresh scalar local.
    pub local: LocalId,
    /// The replacement local is newer than the home location.
    pub needs_write_back: bool,
    /// The home location is newer than the replacement local.
    pub needs_read_back: bool,
}

impl Replacement {
    /// New replacement; starts considered newest in its local.
    pub fn new(offset: u32, ty: PrimType, local: LocalId) -> Replacement {
        Replacement {
            offset,
            ty,
            local,
            needs_write_back: true,
            needs_read_back: false,
        }
    }

    /// One past the last byte of the replaced range.
    pub fn end(&self) -> u32 {
        self.offset + self.ty.size()
    }

    /// Whether the range overlaps `[start, start + size)`.
    pub fn overlaps(&self, start: u32, size: u32) -> bool {
        self.offset < start + size && start < self.end()
    }
}

/// Promotion state for one aggregate local.
#[derive(Debug, Clone)]
pub struct AggregateInfo {
    /// The promoted aggregate.
    pub local: LocalId,
    /// Replacements sorted by offset; ranges never overlap.
    pub replacements: Vec<Replacement>,
    /// Start of the unpromoted remainder's covering range.
    pub unpromoted_min: u32,
    /// End of the unpromoted remainder's covering range. Equal to
    /// `unpromoted_min` iff the aggregate is fully promoted.
    pub unpromoted_max: u32,
}

impl AggregateInfo {
    /// Whether every significant byte is covered by a replacement.
    pub fn is_fully_promoted(&self) -> bool {
        self.unpromoted_min == self.unpromoted_max
    }

    /// Index of the replacement starting exactly at `offset`.
    pub fn find_exact(&self, offset: u32) -> Option<usize> {
        self.replacements
            .binary_search_by_key(&offset, |r| r.offset)
            .ok()
    }

    /// Indices of replacements overlapping `[offset, offset + size)`.
    pub fn overlapping_range(&self, offset: u32, size: u32) -> std::ops::Range<usize> {
        let mut start = self.replacements.partition_point(|r| r.offset < offset);
        if start > 0 && self.replacements[start - 1].overlaps(offset, size) {
            start -= 1;
        }
        let mut end = start;
        while end < self.replacements.len() && self.replacements[end].offset < offset + size {
            end += 1;
        }
        start..end
    }
}

/// All promoted aggregates of one method, looked up by parent local.
#[derive(Debug, Default)]
pub struct AggregateStore {
    by_local: FxHashMap<LocalId, usize>,
    infos: Vec<AggregateInfo>,
}

impl AggregateStore {
    /// Build a store; infos are kept sorted by parent local.
    pub fn from_infos(mut infos: Vec<AggregateInfo>) -> AggregateStore {
        infos.sort_by_key(|i| i.local);
        let by_local = infos.iter().enumerate().map(|(i, a)| (a.local, i)).collect();
        AggregateStore { by_local, infos }
    }

    /// Info for a parent local.
    pub fn get(&self, local: LocalId) -> Option<&AggregateInfo> {
        self.by_local.get(&local).map(|&i| &self.infos[i])
    }

    /// Mutable info for a parent local.
    pub fn get_mut(&mut self, local: LocalId) -> Option<&mut AggregateInfo> {
        let i = *self.by_local.get(&local)?;
        Some(&mut self.infos[i])
    }

    /// Iterate infos in parent-local order.
    pub fn iter(&self) -> impl Iterator<Item = &AggregateInfo> {
        self.infos.iter()
    }

    /// Number of promoted aggregates.
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Whether nothing was promoted.
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Info by position (parent-local order).
    pub fn info_at(&self, index: usize) -> &AggregateInfo {
        &self.infos[index]
    }

    /// Mutable info by position.
    pub fn info_at_mut(&mut self, index: usize) -> &mut AggregateInfo {
        &mut self.infos[index]
    }
}

/// Process-wide promotion configuration, consulted once per process.
#[derive(Debug, Clone)]
pub struct PromotionConfig {
    /// Master switch.
    pub enabled: bool,
    /// Restrict the phase to methods whose hash falls in this inclusive
    /// range.
    pub hash_range: Option<(u64, u64)>,
    /// Stress mode: randomly promote candidates the cost model declined.
    pub stress: bool,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        PromotionConfig {
            enabled: true,
            hash_range: None,
            stress: false,
        }
    }
}

static GLOBAL_CONFIG: OnceCell<PromotionConfig> = OnceCell::new();

/// Install the process-wide configuration. Returns `false` if it was
/// already set (first writer wins).
pub fn configure(config: PromotionConfig) -> bool {
    GLOBAL_CONFIG.set(config).is_ok()
}

/// The process-wide configuration (defaults if never installed).
pub fn global_config() -> &'static PromotionConfig {
    GLOBAL_CONFIG.get_or_init(PromotionConfig::default)
}

/// Outcome of running the phase on one method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStatus {
    /// The IR was left untouched.
    ModifiedNothing,
    /// The IR was rewritten.
    ModifiedEverything,
}

/// Run physical promotion over one method.
pub fn run(ir: &mut MethodIr, config: &PromotionConfig) -> PhaseStatus {
    if !config.enabled {
        return PhaseStatus::ModifiedNothing;
    }
    if let Some((lo, hi)) = config.hash_range {
        if ir.method_hash < lo || ir.method_hash > hi {
            return PhaseStatus::ModifiedNothing;
        }
    }
    if !(0..ir.locals.len()).any(|i| ir.is_candidate_for_promotion(LocalId(i as u32))) {
        return PhaseStatus::ModifiedNothing;
    }

    let profiles = collect_profiles(ir);

    let mut infos = Vec::new();
    for local in profiles.profiled_locals() {
        let Some(uses) = profiles.uses_for(local) else {
            continue;
        };
        if let Some(info) = pick_promotions(ir, local, uses, config) {
            infos.push(info);
        }
    }
    if infos.is_empty() {
        return PhaseStatus::ModifiedNothing;
    }

    let mut aggregates = AggregateStore::from_infos(infos);
    let liveness = PromotionLiveness::compute(ir, &aggregates);
    ReplaceVisitor::run(ir, &mut aggregates, &liveness);
    insert_entry_statements(ir, &aggregates);

    PhaseStatus::ModifiedEverything
}

/// Prolog work in the method-entry scratch position: parameters and OSR
/// locals read their incoming aggregate bytes into the replacement
/// locals; suppressed-zero-init locals get their replacements explicitly
/// zeroed (the prolog no longer zeroes those bytes for them).
fn insert_entry_statements(ir: &mut MethodIr, aggregates: &AggregateStore) {
    let mut entry_stmts: Vec<NodeId> = Vec::new();

    for info in aggregates.iter() {
        let desc = ir.local(info.local).clone();
        if desc.is_param || desc.is_osr_local {
            for rep in &info.replacements {
                let value = ir.new_field_read(info.local, rep.offset, rep.ty);
                entry_stmts.push(ir.new_local_store(rep.local, rep.ty, value));
            }
        } else if desc.suppressed_zero_init {
            for rep in &info.replacements {
                let zero = ir.new_pattern_const(rep.ty, 0);
                entry_stmts.push(ir.new_local_store(rep.local, rep.ty, zero));
            }
        }
    }

    if entry_stmts.is_empty() {
        return;
    }
    let entry = &mut ir.blocks[0].statements;
    for (i, root) in entry_stmts.into_iter().enumerate() {
        entry.insert(i, Statement { root });
    }
}
