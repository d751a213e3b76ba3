//! Jump-stub allocation under absolute-range constraints
//!
//! A jump stub is a short unconditional-jump thunk placed inside a caller
//! supplied address window `[lo, hi]` so that a 32-bit pc-relative call
//! site can always reach its target: the call reaches the stub, the stub
//! jumps absolute. Stubs are grouped into fixed-size blocks carved out of
//! code heaps; a per-allocator cache shares stubs aggressively, while
//! dynamically-emitted (LCG) methods get private blocks so they can be torn
//! down per method.
//!
//! Allocation holds its own lock and may call into the code-heap lock when
//! a new block is needed; never the other way around.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::code_heap::{AllocatorId, CodeBlockHeader, CodeHeap, MethodHandle, StubKind};

/// Encoded size of one stub: `mov rax, imm64; jmp rax`.
pub const JUMP_STUB_BYTES: usize = 12;

/// Bytes reserved at the front of each block for the block header slot.
pub const JUMP_STUB_BLOCK_HEADER_BYTES: usize = 32;

/// Stub slots per shared block.
pub const DEFAULT_JUMP_STUBS_PER_BLOCK: usize = 32;

/// Stub slots per private LCG block. Small: most LCG methods need few.
pub const LCG_JUMP_STUBS_PER_BLOCK: usize = 4;

/// Write the 12-byte thunk `mov rax, target; jmp rax` at `slot`.
///
/// # Safety
/// `slot` must point at `JUMP_STUB_BYTES` writable bytes inside a committed
/// code heap, and no thread may be executing those bytes.
pub unsafe fn emit_back_to_back_jump(slot: usize, target: usize) {
    let p = slot as *mut u8;
    // REX.W mov rax, imm64
    p.write(0x48);
    p.add(1).write(0xB8);
    let imm = (target as u64).to_le_bytes();
    std::ptr::copy_nonoverlapping(imm.as_ptr(), p.add(2), 8);
    // jmp rax
    p.add(10).write(0xFF);
    p.add(11).write(0xE0);
}

/// Decode the target of a previously emitted stub. Test/diagnostic aid.
///
/// # Safety
/// `slot` must point at a stub emitted by [`emit_back_to_back_jump`].
pub unsafe fn read_jump_target(slot: usize) -> usize {
    let p = slot as *const u8;
    let mut imm = [0u8; 8];
    std::ptr::copy_nonoverlapping(p.add(2), imm.as_mut_ptr(), 8);
    u64::from_le_bytes(imm) as usize
}

/// Which cache a stub request resolves against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StubScope {
    /// Ordinary code: stubs are shared across the owning allocator.
    Shared(AllocatorId),
    /// LCG method: private stubs, torn down with the method.
    LcgMethod(MethodHandle),
}

/// A block of back-to-back stub slots inside some code heap.
#[derive(Debug)]
struct JumpStubBlock {
    heap: Arc<CodeHeap>,
    /// Block start (the header slot); slots follow.
    base: usize,
    allocated: usize,
    used: usize,
}

impl JumpStubBlock {
    fn next_slot(&self) -> usize {
        self.base + JUMP_STUB_BLOCK_HEADER_BYTES + self.used * JUMP_STUB_BYTES
    }

    fn is_full(&self) -> bool {
        self.used >= self.allocated
    }
}

/// Blocks plus the `target → stubs` multi-map for one scope.
#[derive(Debug, Default)]
struct StubPool {
    blocks: Vec<JumpStubBlock>,
    cache: FxHashMap<usize, Vec<usize>>,
}

impl StubPool {
    fn cached_stub_in_range(&self, target: usize, lo: usize, hi: usize) -> Option<usize> {
        self.cache
            .get(&target)?
            .iter()
            .copied()
            .find(|&stub| stub >= lo && stub <= hi)
    }
}

/// Bytes a new block of `slots` stubs occupies in its heap.
pub fn jump_stub_block_bytes(slots: usize) -> usize {
    JUMP_STUB_BLOCK_HEADER_BYTES + slots * JUMP_STUB_BYTES
}

/// Allocates and caches jump stubs.
///
/// Block placement is delegated to the caller through a callback so this
/// lock never wraps heap selection policy; the callback takes the
/// code-heap lock internally.
#[derive(Debug, Default)]
pub struct JumpStubManager {
    state: Mutex<StubState>,
}

#[derive(Debug, Default)]
struct StubState {
    shared: FxHashMap<AllocatorId, StubPool>,
    lcg: FxHashMap<MethodHandle, StubPool>,
}

impl StubState {
    fn pool(&mut self, scope: StubScope) -> &mut StubPool {
        match scope {
            StubScope::Shared(a) => self.shared.entry(a).or_default(),
            StubScope::LcgMethod(m) => self.lcg.entry(m).or_default(),
        }
    }
}

impl JumpStubManager {
    /// Create an empty manager.
    pub fn new() -> JumpStubManager {
        JumpStubManager::default()
    }

    /// Return a stub in `[lo, hi]` that jumps to `target`.
    ///
    /// Checks the scope's cache, then partially-used blocks, then asks
    /// `alloc_block(bytes, lo, hi)` for space for a fresh block (the
    /// callback returns the block base inside a heap, typically from the
    /// heap's jump-stub reserve). Returns `None` when no block can be
    /// placed in the window.
    pub fn get_stub(
        &self,
        target: usize,
        lo: usize,
        hi: usize,
        scope: StubScope,
        alloc_block: impl FnOnce(usize, usize, usize) -> Option<(Arc<CodeHeap>, usize)>,
    ) -> Option<usize> {
        let mut state = self.state.lock();
        let pool = state.pool(scope);

        if let Some(stub) = pool.cached_stub_in_range(target, lo, hi) {
            return Some(stub);
        }

        // A partially-used block whose next slot lands in the window.
        for block in pool.blocks.iter_mut() {
            if block.is_full() {
                continue;
            }
            let slot = block.next_slot();
            if slot < lo || slot + JUMP_STUB_BYTES - 1 > hi {
                continue;
            }
            return Some(Self::claim_slot(block, &mut pool.cache, target));
        }

        let slots = match scope {
            StubScope::Shared(_) => DEFAULT_JUMP_STUBS_PER_BLOCK,
            StubScope::LcgMethod(_) => LCG_JUMP_STUBS_PER_BLOCK,
        };
        let bytes = jump_stub_block_bytes(slots);
        let (heap, base) = alloc_block(bytes, lo, hi)?;

        let first_slot = base + JUMP_STUB_BLOCK_HEADER_BYTES;
        if first_slot < lo || first_slot + JUMP_STUB_BYTES - 1 > hi {
            return None;
        }

        heap.record_header(base, CodeBlockHeader::Stub { kind: StubKind::JumpStub });
        pool.blocks.push(JumpStubBlock {
            heap,
            base,
            allocated: slots,
            used: 0,
        });
        let block = pool.blocks.last_mut().expect("just pushed");
        Some(Self::claim_slot(block, &mut pool.cache, target))
    }

    fn claim_slot(
        block: &mut JumpStubBlock,
        cache: &mut FxHashMap<usize, Vec<usize>>,
        target: usize,
    ) -> usize {
        let slot = block.next_slot();
        // Safety: the slot lies inside the block allocated from committed
        // heap pages, and the slot has never been handed out.
        unsafe { emit_back_to_back_jump(slot, target) };
        block.used += 1;
        cache.entry(target).or_default().push(slot);
        slot
    }

    /// Drop an LCG method's private blocks and cache. The backing memory
    /// goes away with the method's heap.
    pub fn purge_method(&self, method: MethodHandle) {
        self.state.lock().lcg.remove(&method);
    }

    /// Drop everything owned by an unloading allocator.
    pub fn purge_allocator(&self, allocator: AllocatorId) {
        let mut state = self.state.lock();
        state.shared.remove(&allocator);
    }

    /// Total stubs currently cached for a scope. Test/diagnostic aid.
    pub fn cached_stub_count(&self, scope: StubScope) -> usize {
        let mut state = self.state.lock();
        state.pool(scope).cache.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::code_heap::HeapKind;
    use crate::exec::virtual_mem::Reservation;

    fn stub_heap() -> Arc<CodeHeap> {
        let res = Reservation::reserve(0x10000).expect("reserve");
        Arc::new(CodeHeap::new(res, HeapKind::Static, AllocatorId(1), 0))
    }

    fn alloc_from(heap: &Arc<CodeHeap>) -> impl FnOnce(usize, usize, usize) -> Option<(Arc<CodeHeap>, usize)> + '_ {
        move |bytes, lo, hi| {
            let base = heap.allocate_from_reserve(bytes, 16)?;
            (base >= lo && base + bytes - 1 <= hi).then(|| (Arc::clone(heap), base))
        }
    }

    #[test]
    fn test_stub_encoding() {
        let heap = stub_heap();
        let mgr = JumpStubManager::new();
        let (lo, hi) = heap.range();

        let target = 0x1_2345_6789_ABCDusize;
        let stub = mgr
            .get_stub(target, lo, hi - 1, StubScope::Shared(AllocatorId(1)), alloc_from(&heap))
            .expect("stub");

        assert!(stub >= lo && stub + JUMP_STUB_BYTES <= hi);
        // Safety: stub points at bytes this test just emitted.
        unsafe {
            assert_eq!((stub as *const u8).read(), 0x48);
            assert_eq!((stub as *const u8).add(1).read(), 0xB8);
            assert_eq!((stub as *const u8).add(10).read(), 0xFF);
            assert_eq!((stub as *const u8).add(11).read(), 0xE0);
            assert_eq!(read_jump_target(stub), target);
        }
    }

    #[test]
    fn test_same_target_shares_stub() {
        let heap = stub_heap();
        let mgr = JumpStubManager::new();
        let (lo, hi) = heap.range();
        let scope = StubScope::Shared(AllocatorId(1));

        let s1 = mgr.get_stub(0x7000_0000, lo, hi - 1, scope, alloc_from(&heap)).unwrap();
        let s2 = mgr.get_stub(0x7000_0000, lo, hi - 1, scope, alloc_from(&heap)).unwrap();
        assert_eq!(s1, s2);

        // Different target gets a different slot, still in the window.
        let s3 = mgr.get_stub(0x7000_0100, lo, hi - 1, scope, alloc_from(&heap)).unwrap();
        assert_ne!(s1, s3);
        assert!(s3 >= lo && s3 <= hi - 1);
        // Safety: slots were emitted above.
        unsafe {
            assert_eq!(read_jump_target(s1), 0x7000_0000);
            assert_eq!(read_jump_target(s3), 0x7000_0100);
        }
    }

    #[test]
    fn test_cached_stub_outside_window_not_reused() {
        let heap = stub_heap();
        let mgr = JumpStubManager::new();
        let (lo, hi) = heap.range();
        let scope = StubScope::Shared(AllocatorId(1));

        let s1 = mgr.get_stub(0x9000_0000, lo, hi - 1, scope, alloc_from(&heap)).unwrap();

        // A window that excludes s1 must not return it; with no allocatable
        // block in that window the request fails instead.
        let res = mgr.get_stub(0x9000_0000, s1 + 0x100000, s1 + 0x200000, scope, |_, _, _| None);
        assert_eq!(res, None);
    }

    #[test]
    fn test_block_fills_then_new_block() {
        let heap = stub_heap();
        let mgr = JumpStubManager::new();
        let (lo, hi) = heap.range();
        let scope = StubScope::Shared(AllocatorId(1));

        let mut stubs = Vec::new();
        for i in 0..(DEFAULT_JUMP_STUBS_PER_BLOCK + 3) {
            let s = mgr
                .get_stub(0x8000_0000 + i * 8, lo, hi - 1, scope, alloc_from(&heap))
                .expect("stub");
            stubs.push(s);
        }
        stubs.sort_unstable();
        stubs.dedup();
        assert_eq!(stubs.len(), DEFAULT_JUMP_STUBS_PER_BLOCK + 3);
        assert_eq!(mgr.cached_stub_count(scope), DEFAULT_JUMP_STUBS_PER_BLOCK + 3);
    }

    #[test]
    fn test_lcg_stubs_are_private() {
        let heap = stub_heap();
        let mgr = JumpStubManager::new();
        let (lo, hi) = heap.range();

        let shared = StubScope::Shared(AllocatorId(1));
        let lcg = StubScope::LcgMethod(MethodHandle(42));

        let s_shared = mgr.get_stub(0xAAAA_0000, lo, hi - 1, shared, alloc_from(&heap)).unwrap();
        let s_lcg = mgr.get_stub(0xAAAA_0000, lo, hi - 1, lcg, alloc_from(&heap)).unwrap();
        // Same target, but never shared across the LCG boundary.
        assert_ne!(s_shared, s_lcg);

        mgr.purge_method(MethodHandle(42));
        assert_eq!(mgr.cached_stub_count(lcg), 0);
        assert_eq!(mgr.cached_stub_count(shared), 1);
    }
}
