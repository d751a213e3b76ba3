//! Executable code heaps
//!
//! A [`CodeHeap`] is one reserved region of executable address space with a
//! bump allocator, an owning nibble map, and a reserve at the top that only
//! jump-stub allocation may consume. Collectible allocators get a free-list
//! variant so individual methods can be released; dynamic (per-method)
//! heaps host exactly one method and are torn down as a unit.
//!
//! All mutation happens under the execution manager's code-heap lock. The
//! allocation cursor and the nibble map are published with single-word
//! atomic stores so lock-free readers (stack walkers) see consistent
//! values.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use super::nibble_map::{NibbleMap, BYTES_PER_BUCKET, CODE_ALIGN};
use super::virtual_mem::{round_down_to_page, round_up_to_page, Reservation};

/// Identifies the loader allocator that owns a heap (supports bulk unload).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocatorId(pub u64);

/// Identity of a compiled method, opaque to this subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodHandle(pub u64);

/// Lifetime class of a code heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapKind {
    /// Lives until process exit.
    Static,
    /// Owned by a collectible allocator; individual blocks can be freed.
    Collectible,
    /// Hosts a single dynamically-emitted method; torn down as a unit.
    Dynamic,
}

/// What a recorded code block is.
///
/// Replaces the original's tagged header pointer: stubs and real method
/// bodies share the nibble map but only real bodies answer managed-code
/// queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeBlockHeader {
    /// JIT-compiled method body.
    Real {
        /// Owning method.
        method: MethodHandle,
        /// Total code bytes starting at the recorded address.
        len: usize,
    },
    /// Runtime thunk (not managed code).
    Stub {
        /// Thunk flavor.
        kind: StubKind,
    },
}

/// Flavors of runtime thunks a heap can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubKind {
    /// Unconditional-jump thunk extending the reach of short calls.
    JumpStub,
}

/// Parameters for a code allocation request.
#[derive(Debug, Clone, Copy)]
pub struct CodeRequest {
    /// Owner of the resulting code.
    pub allocator: AllocatorId,
    /// Bytes of block header preceding the code.
    pub header_bytes: usize,
    /// Bytes of code.
    pub body_bytes: usize,
    /// Alignment of the code start. At least [`CODE_ALIGN`].
    pub align: usize,
    /// Extra top-of-heap bytes to keep free for future jump stubs.
    pub reserve_for_jump_stubs: usize,
    /// Inclusive address window, or `None` for unconstrained.
    pub range: Option<(usize, usize)>,
    /// Whether the request may consume the heap's jump-stub reserve.
    pub within_reserve: bool,
    /// Requested heap lifetime class.
    pub kind: HeapKind,
}

impl CodeRequest {
    /// Total bytes the request consumes, before bucket padding.
    pub fn footprint(&self) -> usize {
        self.header_bytes + self.body_bytes + self.align.max(CODE_ALIGN)
    }
}

/// Free block bookkeeping for collectible heaps. Sorted by address,
/// coalesced with both neighbors on insert.
#[derive(Debug, Default)]
struct FreeList {
    blocks: Vec<(usize, usize)>,
}

impl FreeList {
    /// Take the first block that fits `size` bytes at `align`, splitting
    /// off any tail remainder.
    fn take(&mut self, size: usize, align: usize) -> Option<usize> {
        for i in 0..self.blocks.len() {
            let (start, len) = self.blocks[i];
            let aligned = align_up(start, align);
            let waste = aligned - start;
            if len < waste + size {
                continue;
            }
            let rest = len - waste - size;
            if rest > 0 {
                self.blocks[i] = (aligned + size, rest);
            } else {
                self.blocks.remove(i);
            }
            if waste > 0 {
                self.insert(start, waste);
            }
            return Some(aligned);
        }
        None
    }

    /// Return `[start, start + len)` to the free list, merging with any
    /// adjacent blocks.
    fn insert(&mut self, mut start: usize, mut len: usize) {
        let pos = self.blocks.partition_point(|&(s, _)| s < start);
        if pos < self.blocks.len() && start + len == self.blocks[pos].0 {
            len += self.blocks[pos].1;
            self.blocks.remove(pos);
        }
        if pos > 0 {
            let (prev_start, prev_len) = self.blocks[pos - 1];
            if prev_start + prev_len == start {
                start = prev_start;
                len += prev_len;
                self.blocks.remove(pos - 1);
            }
        }
        let pos = self.blocks.partition_point(|&(s, _)| s < start);
        self.blocks.insert(pos, (start, len));
    }
}

/// One reserved+committed executable region with a bump allocator, a
/// jump-stub reserve, and an owning nibble map.
#[derive(Debug)]
pub struct CodeHeap {
    reservation: Reservation,
    kind: HeapKind,
    allocator: AllocatorId,

    /// First allocatable address; constant.
    start: usize,
    /// One past the last address the heap may ever hand out.
    limit: usize,
    /// Next allocation cursor. Published for lock-free bound checks.
    bump: AtomicUsize,
    /// Committed high-water mark (page aligned).
    committed: AtomicUsize,
    /// Minimum start for the next allocation so its header cannot share a
    /// nibble-map bucket with the previous one.
    min_next_start: AtomicUsize,

    /// Bytes at the top only jump-stub allocation may consume.
    jump_stub_reserve: usize,

    map: NibbleMap,
    headers: RwLock<FxHashMap<usize, CodeBlockHeader>>,
    free_list: Mutex<FreeList>,
}

#[inline]
fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

impl CodeHeap {
    /// Wrap a fresh reservation as a code heap.
    ///
    /// `jump_stub_reserve` of zero selects the default sizing for the
    /// reservation (a small percentage with a one-block floor).
    pub fn new(
        reservation: Reservation,
        kind: HeapKind,
        allocator: AllocatorId,
        jump_stub_reserve: usize,
    ) -> CodeHeap {
        let start = reservation.base();
        let limit = start + reservation.size();
        let map_base = round_down_to_page(start);
        let map = NibbleMap::new(map_base, round_up_to_page(limit - map_base));
        let reserve = if jump_stub_reserve == 0 {
            default_jump_stub_reserve(reservation.size())
        } else {
            jump_stub_reserve
        };
        CodeHeap {
            reservation,
            kind,
            allocator,
            start,
            limit,
            bump: AtomicUsize::new(start),
            committed: AtomicUsize::new(start),
            min_next_start: AtomicUsize::new(0),
            jump_stub_reserve: reserve,
            map,
            headers: RwLock::new(FxHashMap::default()),
            free_list: Mutex::new(FreeList::default()),
        }
    }

    /// Lifetime class of this heap.
    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    /// Owning allocator.
    pub fn allocator(&self) -> AllocatorId {
        self.allocator
    }

    /// First allocatable address.
    pub fn start(&self) -> usize {
        self.start
    }

    /// One past the highest address the heap may hand out.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Current allocation high-water mark.
    pub fn bump_end(&self) -> usize {
        self.bump.load(Ordering::Acquire)
    }

    /// Bytes kept back for jump stubs.
    pub fn jump_stub_reserve(&self) -> usize {
        self.jump_stub_reserve
    }

    /// The heap's address range as `[start, limit)`.
    pub fn range(&self) -> (usize, usize) {
        (self.start, self.limit)
    }

    /// Whether the next allocation of `request` bytes (plus worst-case
    /// bucket padding) can land inside `[lo, hi]` without touching the
    /// jump-stub reserve.
    pub fn can_satisfy(&self, request: usize, lo: usize, hi: usize, within_reserve: bool) -> bool {
        if self.kind == HeapKind::Collectible {
            // A collectible heap may reuse freed blocks anywhere in the
            // reservation, so every address it will ever return must fit.
            if self.start < lo || self.limit - 1 > hi {
                return false;
            }
        }
        let next = self.bump.load(Ordering::Acquire);
        let top = if within_reserve {
            self.limit
        } else {
            self.limit - self.jump_stub_reserve
        };
        let end = match next.checked_add(request + BYTES_PER_BUCKET) {
            Some(end) => end,
            None => return false,
        };
        next >= lo && end <= top && end - 1 <= hi
    }

    /// Allocate a code block. Returns the code start address, which is
    /// recorded in the nibble map.
    ///
    /// The caller must hold the code-heap lock. Returns `None` when the
    /// request (plus `max(reserve_for_jump_stubs, heap reserve)`) does not
    /// fit.
    pub fn allocate_code(
        &self,
        header_bytes: usize,
        body_bytes: usize,
        align: usize,
        reserve_for_jump_stubs: usize,
    ) -> Option<usize> {
        self.allocate_inner(
            header_bytes,
            body_bytes,
            align,
            self.jump_stub_reserve.max(reserve_for_jump_stubs),
        )
    }

    /// Allocation overload for jump-stub blocks: may consume the heap's
    /// jump-stub reserve so stub placement cannot be starved by ordinary
    /// code allocation.
    pub fn allocate_from_reserve(&self, bytes: usize, align: usize) -> Option<usize> {
        self.allocate_inner(0, bytes, align, 0)
    }

    fn allocate_inner(
        &self,
        header_bytes: usize,
        body_bytes: usize,
        align: usize,
        reserve: usize,
    ) -> Option<usize> {
        let align = align.max(CODE_ALIGN);

        if self.kind == HeapKind::Collectible {
            let total = align_up(header_bytes, CODE_ALIGN) + body_bytes;
            // Reuse starts are bucket aligned; a reused start may still not
            // share its bucket with a live block whose extent reaches into
            // the freed space, so check occupancy before committing to it.
            if let Some(block) = self.free_list.lock().take(total + align, BYTES_PER_BUCKET) {
                let code_start = align_up(block + align_up(header_bytes, CODE_ALIGN), align);
                if self.bucket_is_free(code_start) {
                    self.map.set(code_start);
                    return Some(code_start);
                }
                self.free_list.lock().insert(block, total + align);
            }
        }

        let pos = self.bump.load(Ordering::Acquire);
        let header_start = align_up(pos, CODE_ALIGN);
        let mut code_start = align_up(header_start + header_bytes, align);

        // Keep one recorded block start per 32-byte bucket.
        let min_next = self.min_next_start.load(Ordering::Relaxed);
        if code_start < min_next {
            code_start = align_up(min_next, align);
        }

        let end = code_start + body_bytes;
        if end.checked_add(reserve)? > self.limit {
            return None;
        }
        if !self.ensure_committed(end) {
            return None;
        }

        self.bump.store(end, Ordering::Release);
        self.min_next_start
            .store(align_up(code_start + 1, BYTES_PER_BUCKET), Ordering::Relaxed);
        self.map.set(code_start);
        Some(code_start)
    }

    /// Whether no recorded block start shares `addr`'s nibble-map bucket.
    fn bucket_is_free(&self, addr: usize) -> bool {
        let bucket_base = addr & !(BYTES_PER_BUCKET - 1);
        let headers = self.headers.read();
        (0..BYTES_PER_BUCKET)
            .step_by(CODE_ALIGN)
            .all(|off| !headers.contains_key(&(bucket_base + off)))
    }

    /// Return a block to a collectible heap and clear its records.
    pub fn free_code(&self, code_start: usize, total_bytes: usize) {
        debug_assert_eq!(self.kind, HeapKind::Collectible);
        self.map.clear(code_start);
        self.headers.write().remove(&code_start);
        self.free_list.lock().insert(code_start, total_bytes);
    }

    fn ensure_committed(&self, end: usize) -> bool {
        let committed = self.committed.load(Ordering::Acquire);
        if end <= committed {
            return true;
        }
        let new_committed = round_up_to_page(end).min(self.limit);
        let base = self.reservation.base();
        let commit_from = round_down_to_page(committed.max(base)) - base;
        let commit_len = round_up_to_page(new_committed - base) - commit_from;
        if !self.reservation.commit(commit_from, commit_len) {
            return false;
        }
        self.committed.store(new_committed, Ordering::Release);
        true
    }

    /// Record what the block starting at `code_start` is.
    pub fn record_header(&self, code_start: usize, header: CodeBlockHeader) {
        self.headers.write().insert(code_start, header);
    }

    /// Look up the recorded block covering `pc`: the nibble map yields the
    /// preceding recorded start; the header bounds-checks real code.
    pub fn find_block(&self, pc: usize) -> Option<(usize, CodeBlockHeader)> {
        if pc < self.start || pc >= self.bump_end() {
            return None;
        }
        let start = self.map.find_block_start(pc)?;
        let header = *self.headers.read().get(&start)?;
        if let CodeBlockHeader::Real { len, .. } = header {
            if pc >= start + len {
                return None;
            }
        }
        Some((start, header))
    }

    /// The nibble map, for tests and diagnostics.
    pub fn nibble_map(&self) -> &NibbleMap {
        &self.map
    }
}

/// Default top-of-heap reserve for jump stubs: a small percentage of the
/// heap with a floor of one stub block plus alignment slop.
pub fn default_jump_stub_reserve(heap_size: usize) -> usize {
    const PERCENT: usize = 2;
    let proportional = PERCENT * (heap_size / 100);
    let minimum = super::jump_stub::JUMP_STUB_BLOCK_HEADER_BYTES
        + super::jump_stub::DEFAULT_JUMP_STUBS_PER_BLOCK * super::jump_stub::JUMP_STUB_BYTES
        + CODE_ALIGN
        + BYTES_PER_BUCKET;
    proportional.max(minimum)
}
