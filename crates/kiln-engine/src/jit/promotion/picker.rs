//! Replacement selection for aggregate locals
//!
//! Runs the cost model over each primitive access recorded in a profile
//! and decides which byte ranges become scalar replacement locals. Costs
//! are in cycles: an unpromoted struct field access is 3, a promoted one
//! is a reg-reg move at 0.5, a read-back is a stack load at 3, and a
//! write-back is 3 unless it needs a checked write barrier (a reference
//! field of an implicit-byref parameter), which is 10. Overlapping struct
//! copies that decomposition will take apart contribute nothing; this is
//! a known overshoot kept as is.

use rand::Rng;

use crate::jit::ir::{ClassLayout, LayoutFlags, LocalDesc, LocalId, LocalType, MethodIr, PrimType};

use super::access::{Access, AccessType, LocalUses};
use super::segments::{Segment, StructSegments};
use super::{AggregateInfo, PromotionConfig, Replacement};

const COST_STRUCT_ACCESS: f64 = 3.0;
const COST_REG_ACCESS: f64 = 0.5;
const COST_READ_BACK: f64 = 3.0;
const COST_WRITE_BACK: f64 = 3.0;
const COST_WRITE_BACK_BARRIER: f64 = 10.0;

/// Chance that stress mode promotes a candidate the cost model declined.
const STRESS_PROMOTE_CHANCE: f64 = 0.25;

/// The significant (non-padding) byte ranges of a layout.
///
/// Block layouts, indexable-field layouts, layouts the engine declines to
/// inspect, and custom layouts without GC references treat every byte as
/// significant; otherwise only the field ranges count.
pub fn significant_segments(layout: &ClassLayout) -> StructSegments {
    let significant_padding = layout.flags.contains(LayoutFlags::BLOCK_LAYOUT)
        || layout.flags.contains(LayoutFlags::INDEXABLE_FIELDS)
        || layout.flags.contains(LayoutFlags::OPAQUE_FIELDS)
        || (layout.flags.contains(LayoutFlags::CUSTOM_LAYOUT)
            && !layout.flags.contains(LayoutFlags::CONTAINS_GC_REF));

    let mut segments = StructSegments::new();
    if significant_padding {
        if layout.size > 0 {
            segments.add(Segment::new(0, layout.size));
        }
        return segments;
    }

    for field in &layout.fields {
        segments.add(Segment::new(field.offset, field.offset + field.size));
    }
    segments
}

/// Decide whether one primitive access is worth replacing with a scalar.
fn evaluate_replacement(
    ir: &MethodIr,
    local: LocalId,
    uses: &LocalUses,
    access: &Access,
    config: &PromotionConfig,
) -> bool {
    let AccessType::Prim(access_ty) = access.ty else {
        return false;
    };
    let size = access_ty.size();

    let mut overlapped_call_arg_wtd = 0.0;
    let mut overlapped_retbuf_wtd = 0.0;
    let mut overlapped_assigned_from_call_wtd = 0.0;

    for other in &uses.accesses {
        if std::ptr::eq(other, access) || !other.overlaps(access.offset, size) {
            continue;
        }
        // An overlapping access of a different scalar type means the bytes
        // are viewed incompatibly; promotion would be unsound to pick.
        if !matches!(other.ty, AccessType::Struct(_)) {
            return false;
        }
        overlapped_call_arg_wtd += other.count_call_args_wtd;
        overlapped_retbuf_wtd += other.count_passed_as_retbuf_wtd;
        overlapped_assigned_from_call_wtd += other.count_assigned_from_call_wtd;
        // Overlapping plain assignments are decomposable; they cost
        // nothing here even though the remainder may still be copied.
    }

    let cost_without = access.count_wtd * COST_STRUCT_ACCESS;

    let mut cost_with = access.count_wtd * COST_REG_ACCESS;

    let desc = ir.local(local);
    let mut read_backs_wtd = 0.0;
    // Parameters and OSR locals pay one read-back at entry.
    if desc.is_param || desc.is_osr_local {
        read_backs_wtd += ir.blocks[0].weight;
    }
    read_backs_wtd += overlapped_retbuf_wtd;
    read_backs_wtd += overlapped_assigned_from_call_wtd;
    cost_with += read_backs_wtd * COST_READ_BACK;

    let write_back_cost = if desc.implicit_byref && access_ty == PrimType::Ref {
        COST_WRITE_BACK_BARRIER
    } else {
        COST_WRITE_BACK
    };
    cost_with += overlapped_call_arg_wtd * write_back_cost;

    if cost_with < cost_without {
        return true;
    }

    config.stress && rand::thread_rng().gen_bool(STRESS_PROMOTE_CHANCE)
}

/// Pick replacements for one aggregate local from its profile.
///
/// Allocates a fresh scalar local per chosen access and computes the
/// unpromoted remainder range. Returns `None` when nothing is worth
/// promoting.
pub fn pick_promotions(
    ir: &mut MethodIr,
    local: LocalId,
    uses: &LocalUses,
    config: &PromotionConfig,
) -> Option<AggregateInfo> {
    if uses.accesses.is_empty() {
        return None;
    }

    let mut replacements: Vec<Replacement> = Vec::new();
    let chosen: Vec<(u32, PrimType)> = uses
        .accesses
        .iter()
        .filter_map(|access| match access.ty {
            AccessType::Prim(ty) if evaluate_replacement(ir, local, uses, access, config) => {
                Some((access.offset, ty))
            }
            _ => None,
        })
        .collect();

    for (offset, ty) in chosen {
        let fresh = ir.add_local(LocalDesc::prim(ty));
        replacements.push(Replacement::new(offset, ty, fresh));
    }

    if replacements.is_empty() {
        return None;
    }
    debug_assert!(replacements.windows(2).all(|w| w[0].end() <= w[1].offset));

    let LocalType::Struct(layout_id) = ir.local(local).ty else {
        return None;
    };
    let mut unpromoted = significant_segments(ir.layout(layout_id));
    for rep in &replacements {
        unpromoted.subtract(Segment::new(rep.offset, rep.end()));
    }

    let (unpromoted_min, unpromoted_max) = match unpromoted.covering_segment() {
        Some(seg) => (seg.start, seg.end),
        // Fully promoted: min == max.
        None => (0, 0),
    };

    Some(AggregateInfo {
        local,
        replacements,
        unpromoted_min,
        unpromoted_max,
    })
}
