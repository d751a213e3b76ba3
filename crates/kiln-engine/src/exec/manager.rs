//! Execution manager: the facade over code heaps, the range registry,
//! jump stubs, and unwind publication
//!
//! One instance lives for the engine's lifetime and is passed explicitly
//! (no process-wide singleton). All heap mutation is serialized by the
//! code-heap lock; address→code queries go through the range registry and
//! per-heap nibble maps without taking it. Nothing under the code-heap
//! lock may block on managed activity, and destruction of unlinked heaps
//! is deferred to an explicit sweep at a safe point.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::aot::AotImage;
use super::code_heap::{
    default_jump_stub_reserve, AllocatorId, CodeBlockHeader, CodeHeap, CodeRequest, HeapKind,
    MethodHandle,
};
use super::error::CodeMemError;
use super::jump_stub::{JumpStubManager, StubScope};
use super::range_map::{RangeMap, RangeSection, SectionTarget};
use super::unwind::{NullUnwindOs, UnwindOs, UnwindTable};
use super::virtual_mem::{round_up_to_page, Reservation, RESERVE_GRANULARITY};

/// Baseline reservation for a fresh code heap.
const INITIAL_HEAP_SIZE: usize = 64 * 1024;

/// Once an allocator owns this many heaps, new ones reserve 4x the
/// baseline to cut heap churn for code-heavy workloads.
const HEAP_COUNT_SIZE_INCREASE_THRESHOLD: usize = 8;

/// Chunk size targeted when building the emergency jump-stub reserve.
const EMERGENCY_RESERVE_CHUNK: usize = 16 * 1024 * 1024;

/// Result of a successful method-code allocation.
#[derive(Debug, Clone)]
pub struct CodeAllocation {
    /// Start of the code bytes (recorded in the heap's nibble map).
    pub code: usize,
    /// Heap the code lives in.
    pub heap: Arc<CodeHeap>,
}

/// Pre-reserved address space consumed only when a range-constrained heap
/// reservation fails and the caller demanded success.
struct EmergencyReserve {
    reservation: Reservation,
    /// Bytes not yet promised to future consumers.
    free: usize,
}

struct CodeManState {
    heaps: Vec<Arc<CodeHeap>>,
    emergency: Vec<EmergencyReserve>,
    /// Unlinked heaps awaiting destruction at the next sweep.
    pending_release: Vec<Arc<CodeHeap>>,
    heap_counts: FxHashMap<AllocatorId, usize>,
}

/// Facade over the code-memory subsystem.
pub struct ExecutionManager {
    ranges: RangeMap,
    stubs: JumpStubManager,
    unwind_os: Arc<dyn UnwindOs>,
    /// The code-heap lock.
    state: Mutex<CodeManState>,
}

impl ExecutionManager {
    /// Create a manager publishing unwind tables through `unwind_os`.
    pub fn new(unwind_os: Arc<dyn UnwindOs>) -> ExecutionManager {
        ExecutionManager {
            ranges: RangeMap::new(),
            stubs: JumpStubManager::new(),
            unwind_os,
            state: Mutex::new(CodeManState {
                heaps: Vec::new(),
                emergency: Vec::new(),
                pending_release: Vec::new(),
                heap_counts: FxHashMap::default(),
            }),
        }
    }

    /// Create a manager with no OS unwind publication.
    pub fn with_null_unwind() -> ExecutionManager {
        ExecutionManager::new(Arc::new(NullUnwindOs::default()))
    }

    /// The global range registry.
    pub fn ranges(&self) -> &RangeMap {
        &self.ranges
    }

    // ---- address -> code queries -------------------------------------

    /// Find the range section covering `pc`.
    pub fn find_code_range(&self, pc: usize) -> Option<Arc<RangeSection>> {
        self.ranges.get(pc)
    }

    /// Whether `pc` lies inside a real (non-stub) managed code block.
    pub fn is_managed_code(&self, pc: usize) -> bool {
        self.code_method(pc).is_some()
    }

    /// The method whose code covers `pc`.
    pub fn code_method(&self, pc: usize) -> Option<MethodHandle> {
        let section = self.ranges.get(pc)?;
        match &section.target {
            SectionTarget::Heap(heap) => match heap.find_block(pc)? {
                (_, CodeBlockHeader::Real { method, .. }) => Some(method),
                (_, CodeBlockHeader::Stub { .. }) => None,
            },
            SectionTarget::Aot(img) => img.find_method(pc),
        }
    }

    // ---- allocation ---------------------------------------------------

    /// Allocate code for a method, opening a new heap when none fits.
    ///
    /// On success the block's header record and the range registry are
    /// already up to date. Constrained requests that cannot be satisfied
    /// return [`CodeMemError::OutOfMemoryWithinRange`]; unconstrained
    /// exhaustion returns [`CodeMemError::OutOfMemory`].
    pub fn allocate_method_code(
        &self,
        req: &CodeRequest,
        method: MethodHandle,
    ) -> Result<CodeAllocation, CodeMemError> {
        let (lo, hi) = req.range.unwrap_or((0, usize::MAX));
        let mut state = self.state.lock();

        // Dynamic methods get a heap of their own; everyone else reuses.
        if req.kind != HeapKind::Dynamic {
            for heap in state.heaps.iter() {
                if heap.allocator() != req.allocator || heap.kind() != req.kind {
                    continue;
                }
                if !heap.can_satisfy(req.footprint(), lo, hi, req.within_reserve) {
                    continue;
                }
                if let Some(code) = heap.allocate_code(
                    req.header_bytes,
                    req.body_bytes,
                    req.align,
                    req.reserve_for_jump_stubs,
                ) {
                    let heap = Arc::clone(heap);
                    heap.record_header(code, CodeBlockHeader::Real { method, len: req.body_bytes });
                    return Ok(CodeAllocation { code, heap });
                }
            }
        }

        let heap = self.new_code_heap(&mut state, req, /* throw_on_failure */ true)?;
        let code = heap
            .allocate_code(req.header_bytes, req.body_bytes, req.align, req.reserve_for_jump_stubs)
            .ok_or(CodeMemError::OutOfMemory)?;
        heap.record_header(code, CodeBlockHeader::Real { method, len: req.body_bytes });
        Ok(CodeAllocation { code, heap })
    }

    /// Create a heap able to hold `req`, register its range, and return it.
    ///
    /// Requires the code-heap lock. Placement ladder for constrained
    /// requests: centered eighth of the window, the whole window, then
    /// (when the caller demanded success) the emergency reserve.
    fn new_code_heap(
        &self,
        state: &mut CodeManState,
        req: &CodeRequest,
        throw_on_failure: bool,
    ) -> Result<Arc<CodeHeap>, CodeMemError> {
        let heap_count = state.heap_counts.get(&req.allocator).copied().unwrap_or(0);
        let mut reserve_size = INITIAL_HEAP_SIZE;
        if heap_count > HEAP_COUNT_SIZE_INCREASE_THRESHOLD {
            reserve_size *= 4;
        }
        reserve_size = reserve_size.max(round_up_to_page(
            req.footprint() + default_jump_stub_reserve(INITIAL_HEAP_SIZE),
        ));

        let (reservation, stub_reserve) = match req.range {
            None => {
                let res = Reservation::reserve(reserve_size).ok_or(CodeMemError::OutOfMemory)?;
                (res, 0)
            }
            Some((lo, hi)) => match Self::reserve_in_window(reserve_size, lo, hi) {
                Some(res) => (res, 0),
                None => {
                    if !throw_on_failure {
                        return Err(CodeMemError::OutOfMemoryWithinRange { lo, hi });
                    }
                    let res = Self::take_emergency_reserve(state, lo, hi)
                        .ok_or(CodeMemError::OutOfMemoryWithinRange { lo, hi })?;
                    // Emergency-backed heaps exist for stubs: the whole
                    // heap counts as jump-stub reserve.
                    let whole = res.size();
                    (res, whole)
                }
            },
        };

        let heap = Arc::new(CodeHeap::new(reservation, req.kind, req.allocator, stub_reserve));
        let (start, limit) = heap.range();
        let unwind = Arc::new(UnwindTable::new((start, limit), 8, Arc::clone(&self.unwind_os)));
        let inserted = self.ranges.insert(RangeSection {
            lo: start,
            hi: limit,
            target: SectionTarget::Heap(Arc::clone(&heap)),
            collectible: req.kind == HeapKind::Collectible,
            unwind: Some(unwind),
        });
        debug_assert!(inserted, "fresh reservation overlapped a live range");

        state.heaps.push(Arc::clone(&heap));
        *state.heap_counts.entry(req.allocator).or_insert(0) += 1;
        Ok(heap)
    }

    /// Reservation ladder inside `[lo, hi]`: prefer the centered
    /// three-quarters of the window (more likely to satisfy later
    /// neighbors), then the whole window.
    fn reserve_in_window(size: usize, lo: usize, hi: usize) -> Option<Reservation> {
        let span = hi.saturating_sub(lo);
        let centered_lo = lo + span / 8;
        let centered_hi = hi - span / 8;
        Reservation::reserve_within(size, centered_lo, centered_hi)
            .or_else(|| Reservation::reserve_within(size, lo, hi))
    }

    fn take_emergency_reserve(
        state: &mut CodeManState,
        lo: usize,
        hi: usize,
    ) -> Option<Reservation> {
        let idx = state.emergency.iter().position(|r| {
            let base = r.reservation.base();
            base >= lo && base + r.reservation.size() <= hi
        })?;
        Some(state.emergency.remove(idx).reservation)
    }

    /// Pre-reserve `reserve_size` bytes of address space reachable by
    /// 32-bit pc-relative branches from anywhere in `[image_base,
    /// image_base + image_size)`, for later emergency consumption.
    ///
    /// Strategies, most efficient first: the centered part of the
    /// reachable window, the whole window, then small-chunk reservations.
    pub fn ensure_jump_stub_reserve(
        &self,
        image_base: usize,
        image_size: usize,
        mut reserve_size: usize,
    ) {
        let lo = (image_base + image_size).saturating_add_signed(i32::MIN as isize);
        let hi = image_base.saturating_add(i32::MAX as usize);

        let mut state = self.state.lock();

        // Space already promised by in-range reserves counts.
        for r in state.emergency.iter_mut() {
            let base = r.reservation.base();
            if base >= lo && base + r.reservation.size() <= hi {
                let used = reserve_size.min(r.free);
                r.free -= used;
                reserve_size -= used;
                if reserve_size == 0 {
                    return;
                }
            }
        }

        let mut chunk = round_up_to_page(reserve_size).max(EMERGENCY_RESERVE_CHUNK);
        let mut mode = 0;
        while reserve_size > 0 {
            let span = hi.saturating_sub(lo);
            let reservation = loop {
                let attempt = match mode {
                    0 => Reservation::reserve_within(chunk, lo + span / 8, hi - span / 8),
                    1 => Reservation::reserve_within(chunk, lo, hi),
                    2 => {
                        chunk = RESERVE_GRANULARITY.max(round_up_to_page(reserve_size));
                        Reservation::reserve_within(chunk, lo, hi)
                    }
                    _ => return, // cannot build the reserve; give up
                };
                match attempt {
                    Some(res) => break res,
                    None => mode += 1,
                }
            };

            let used = chunk.min(reserve_size);
            reserve_size -= used;
            state.emergency.push(EmergencyReserve {
                free: reservation.size() - used,
                reservation,
            });
        }
    }

    // ---- jump stubs ---------------------------------------------------

    /// Return a stub in `[lo, hi]` jumping to `target`, allocating a new
    /// stub block (possibly a new heap of `allocator`) when needed.
    ///
    /// LCG scopes still place their private blocks in the owning
    /// allocator's heaps; privacy is a property of the cache, teardown a
    /// property of the scope.
    ///
    /// `Ok(None)` means the window cannot be satisfied and the caller may
    /// retry with relaxed constraints; with `throw_on_failure` the same
    /// condition is an error.
    pub fn jump_stub(
        &self,
        target: usize,
        lo: usize,
        hi: usize,
        allocator: AllocatorId,
        scope: StubScope,
        throw_on_failure: bool,
    ) -> Result<Option<usize>, CodeMemError> {
        let result = self.stubs.get_stub(target, lo, hi, scope, |bytes, lo, hi| {
            self.allocate_stub_block(bytes, lo, hi, allocator, scope, throw_on_failure)
        });

        match result {
            Some(stub) => Ok(Some(stub)),
            None if throw_on_failure => Err(CodeMemError::OutOfMemoryWithinRange { lo, hi }),
            None => Ok(None),
        }
    }

    /// Block placement callback: an existing heap's reserve first, then a
    /// fresh heap inside the window.
    fn allocate_stub_block(
        &self,
        bytes: usize,
        lo: usize,
        hi: usize,
        allocator: AllocatorId,
        scope: StubScope,
        throw_on_failure: bool,
    ) -> Option<(Arc<CodeHeap>, usize)> {
        let mut state = self.state.lock();

        for heap in state.heaps.iter() {
            if heap.allocator() != allocator {
                continue;
            }
            if !heap.can_satisfy(bytes, lo, hi, /* within_reserve */ true) {
                continue;
            }
            if let Some(base) = heap.allocate_from_reserve(bytes, 16) {
                if base >= lo && base + bytes - 1 <= hi {
                    return Some((Arc::clone(heap), base));
                }
            }
        }

        let req = CodeRequest {
            allocator,
            header_bytes: 0,
            body_bytes: bytes,
            align: 16,
            reserve_for_jump_stubs: 0,
            range: Some((lo, hi)),
            within_reserve: true,
            kind: match scope {
                StubScope::Shared(_) => HeapKind::Static,
                StubScope::LcgMethod(_) => HeapKind::Dynamic,
            },
        };
        let heap = self.new_code_heap(&mut state, &req, throw_on_failure).ok()?;
        let base = heap.allocate_from_reserve(bytes, 16)?;
        (base >= lo && base + bytes - 1 <= hi).then_some((heap, base))
    }

    // ---- range add / delete ------------------------------------------

    /// Publish an AOT image's range.
    pub fn add_aot_range(&self, image: Arc<AotImage>) -> bool {
        let lo = image.base();
        let hi = lo + image.size();
        self.ranges.insert(RangeSection {
            lo,
            hi,
            target: SectionTarget::Aot(image),
            collectible: false,
            unwind: None,
        })
    }

    /// Unlink the range starting at `lo`. Heap-backed ranges defer heap
    /// destruction to [`ExecutionManager::sweep_pending`].
    pub fn delete_range(&self, lo: usize) -> bool {
        let Some(section) = self.ranges.remove(lo) else {
            return false;
        };
        if let SectionTarget::Heap(heap) = &section.target {
            let mut state = self.state.lock();
            let heap_start = heap.start();
            if let Some(idx) = state.heaps.iter().position(|h| h.start() == heap_start) {
                let heap = state.heaps.remove(idx);
                if let Some(count) = state.heap_counts.get_mut(&heap.allocator()) {
                    *count = count.saturating_sub(1);
                }
                state.pending_release.push(heap);
            }
        }
        // `section` (and with it the unwind table) drops here, outside the
        // writer critical section.
        true
    }

    /// Unlink everything owned by `allocator` and drop its stub caches.
    pub fn unload_allocator(&self, allocator: AllocatorId) {
        let starts: Vec<usize> = {
            let state = self.state.lock();
            state
                .heaps
                .iter()
                .filter(|h| h.allocator() == allocator)
                .map(|h| h.start())
                .collect()
        };
        for start in starts {
            self.delete_range(start);
        }
        self.stubs.purge_allocator(allocator);
    }

    /// Release heaps unlinked since the last sweep. Called at safe points;
    /// the actual unmapping happens after the lock is dropped.
    pub fn sweep_pending(&self) -> usize {
        let pending = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.pending_release)
        };
        let count = pending.len();
        drop(pending);
        count
    }

    /// The jump-stub manager, for per-method teardown.
    pub fn jump_stubs(&self) -> &JumpStubManager {
        &self.stubs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(allocator: u64, body: usize) -> CodeRequest {
        CodeRequest {
            allocator: AllocatorId(allocator),
            header_bytes: 8,
            body_bytes: body,
            align: 16,
            reserve_for_jump_stubs: 0,
            range: None,
            within_reserve: false,
            kind: HeapKind::Static,
        }
    }

    #[test]
    fn test_allocate_and_identify_code() {
        let mgr = ExecutionManager::with_null_unwind();
        let alloc = mgr.allocate_method_code(&request(1, 0x100), MethodHandle(7)).unwrap();

        assert!(mgr.is_managed_code(alloc.code));
        assert!(mgr.is_managed_code(alloc.code + 0xFF));
        assert!(!mgr.is_managed_code(alloc.code + 0x100));
        assert_eq!(mgr.code_method(alloc.code + 0x40), Some(MethodHandle(7)));

        // Second method in the same heap.
        let alloc2 = mgr.allocate_method_code(&request(1, 0x80), MethodHandle(8)).unwrap();
        assert_eq!(mgr.code_method(alloc2.code), Some(MethodHandle(8)));
        assert_eq!(mgr.code_method(alloc.code), Some(MethodHandle(7)));
        assert!(Arc::ptr_eq(&alloc.heap, &alloc2.heap));
    }

    #[test]
    fn test_heap_growth_across_exhaustion() {
        let mgr = ExecutionManager::with_null_unwind();
        // Allocate more than one initial heap can hold.
        let mut methods = Vec::new();
        for i in 0..40u64 {
            let alloc = mgr
                .allocate_method_code(&request(1, 8 * 1024), MethodHandle(i))
                .unwrap();
            methods.push((alloc.code, MethodHandle(i)));
        }
        assert!(mgr.ranges().len() > 1, "exhaustion should open new heaps");
        for (pc, m) in methods {
            assert_eq!(mgr.code_method(pc), Some(m));
        }
    }

    #[test]
    fn test_jump_stub_within_heap_window() {
        let mgr = ExecutionManager::with_null_unwind();
        let alloc = mgr.allocate_method_code(&request(1, 0x100), MethodHandle(1)).unwrap();
        let (lo, hi) = alloc.heap.range();

        let scope = StubScope::Shared(AllocatorId(1));
        let target = 0x7F00_0000_0000usize;

        let s1 = mgr.jump_stub(target, lo, hi - 1, AllocatorId(1), scope, false).unwrap().unwrap();
        assert!(s1 >= lo && s1 < hi);
        // Stub addresses are covered by a range but are not managed code.
        assert!(mgr.find_code_range(s1).is_some());
        assert!(!mgr.is_managed_code(s1));

        // Same target, same window: cached.
        let s2 = mgr.jump_stub(target, lo, hi - 1, AllocatorId(1), scope, false).unwrap().unwrap();
        assert_eq!(s1, s2);

        // Different target: new slot.
        let s3 = mgr.jump_stub(target + 0x100, lo, hi - 1, AllocatorId(1), scope, false).unwrap().unwrap();
        assert_ne!(s1, s3);
    }

    #[test]
    fn test_jump_stub_failure_modes() {
        let mgr = ExecutionManager::with_null_unwind();
        // A 1-byte window can hold no stub block and no heap.
        let err = mgr
            .jump_stub(0x1000, 0x10000, 0x10001, AllocatorId(1), StubScope::Shared(AllocatorId(1)), true)
            .unwrap_err();
        assert!(matches!(err, CodeMemError::OutOfMemoryWithinRange { .. }));

        let relaxed = mgr
            .jump_stub(0x1000, 0x10000, 0x10001, AllocatorId(1), StubScope::Shared(AllocatorId(1)), false)
            .unwrap();
        assert_eq!(relaxed, None);
    }

    #[test]
    fn test_delete_range_and_sweep() {
        let mgr = ExecutionManager::with_null_unwind();
        let alloc = mgr.allocate_method_code(&request(1, 0x100), MethodHandle(1)).unwrap();
        let heap_start = alloc.heap.start();

        assert!(mgr.delete_range(heap_start));
        assert!(mgr.find_code_range(alloc.code).is_none());
        assert!(!mgr.is_managed_code(alloc.code));
        assert!(!mgr.delete_range(heap_start));

        assert_eq!(mgr.sweep_pending(), 1);
        assert_eq!(mgr.sweep_pending(), 0);
    }

    #[test]
    fn test_unload_allocator_drops_everything() {
        let mgr = ExecutionManager::with_null_unwind();
        let a = mgr.allocate_method_code(&request(1, 0x4000), MethodHandle(1)).unwrap();
        let b = mgr.allocate_method_code(&request(2, 0x4000), MethodHandle(2)).unwrap();

        mgr.unload_allocator(AllocatorId(1));
        assert!(!mgr.is_managed_code(a.code));
        assert!(mgr.is_managed_code(b.code));
        assert!(mgr.sweep_pending() >= 1);
    }

    #[test]
    fn test_aot_ranges_participate() {
        use crate::exec::aot::AotMethod;

        let mgr = ExecutionManager::with_null_unwind();
        let img = Arc::new(AotImage::new(
            0x7000_0000,
            0x1000,
            vec![AotMethod { begin_rva: 0x100, end_rva: 0x200, method: MethodHandle(99) }],
        ));
        assert!(mgr.add_aot_range(img));

        assert_eq!(mgr.code_method(0x7000_0150), Some(MethodHandle(99)));
        assert!(!mgr.is_managed_code(0x7000_0080));
        assert!(mgr.delete_range(0x7000_0000));
        assert_eq!(mgr.code_method(0x7000_0150), None);
    }
}
