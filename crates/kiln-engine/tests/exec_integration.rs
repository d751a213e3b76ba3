//! End-to-end tests for the code-memory subsystem: heaps, the range
//! registry, jump stubs, and unwind publication working together.

use std::sync::Arc;

use kiln_engine::exec::{
    AllocatorId, CodeMemError, CodeRequest, EntryKind, ExecutionManager, HeapKind, MethodHandle,
    RuntimeFunction, SectionTarget, StubScope, UnwindRecord,
};

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
fn test_methods_land_in_registry_and_resolve() {
    let mgr = ExecutionManager::with_null_unwind();

    let mut allocations = Vec::new();
    for i in 0..64u64 {
        let alloc = mgr
            .allocate_method_code(&request(1 + (i % 3), 0x200), MethodHandle(i))
            .expect("allocation");
        allocations.push((alloc, MethodHandle(i)));
    }

    // The registry stays sorted (head = highest lo) and non-overlapping.
    let ranges = mgr.ranges().ranges();
    assert!(ranges.windows(2).all(|w| w[0].0 >= w[1].1));

    for (alloc, method) in &allocations {
        // Every byte of the body resolves to its method.
        assert_eq!(mgr.code_method(alloc.code), Some(*method));
        assert_eq!(mgr.code_method(alloc.code + 0x1FF), Some(*method));
        // The section covering the code points back at the same heap.
        let section = mgr.find_code_range(alloc.code).expect("covered");
        match &section.target {
            SectionTarget::Heap(heap) => assert_eq!(heap.start(), alloc.heap.start()),
            SectionTarget::Aot(_) => panic!("expected a heap section"),
        }
    }
}

#[test]
fn test_jump_stub_caching_per_allocator_and_method() {
    let mgr = ExecutionManager::with_null_unwind();
    let alloc = mgr.allocate_method_code(&request(1, 0x100), MethodHandle(1)).unwrap();
    let (lo, hi) = alloc.heap.range();
    let window = (lo, hi - 1);

    let shared = StubScope::Shared(AllocatorId(1));
    let target = 0x6100_0000_0000usize;

    let s1 = mgr.jump_stub(target, window.0, window.1, AllocatorId(1), shared, true).unwrap().unwrap();
    let s2 = mgr.jump_stub(target, window.0, window.1, AllocatorId(1), shared, true).unwrap().unwrap();
    assert_eq!(s1, s2, "shared scope caches aggressively");

    // Another allocator never sees the first allocator's stubs.
    let other_alloc = mgr.allocate_method_code(&request(2, 0x100), MethodHandle(2)).unwrap();
    let (olo, ohi) = other_alloc.heap.range();
    let s3 = mgr
        .jump_stub(target, olo.min(window.0), ohi.max(window.1), AllocatorId(2), StubScope::Shared(AllocatorId(2)), true)
        .unwrap()
        .unwrap();
    assert_ne!(s1, s3);

    // LCG methods get private stubs, removable per method.
    let lcg = StubScope::LcgMethod(MethodHandle(77));
    let s4 = mgr.jump_stub(target, window.0, window.1, AllocatorId(1), lcg, true).unwrap().unwrap();
    assert_ne!(s1, s4);
    mgr.jump_stubs().purge_method(MethodHandle(77));
    assert_eq!(mgr.jump_stubs().cached_stub_count(lcg), 0);
}

#[test]
fn test_constrained_failure_is_typed() {
    let mgr = ExecutionManager::with_null_unwind();
    let err = mgr
        .jump_stub(0x1000, 0x100, 0x200, AllocatorId(9), StubScope::Shared(AllocatorId(9)), true)
        .unwrap_err();
    match err {
        CodeMemError::OutOfMemoryWithinRange { lo, hi } => {
            assert_eq!(lo, 0x100);
            assert_eq!(hi, 0x200);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_unwind_publication_through_section() {
    let mgr = ExecutionManager::with_null_unwind();
    let alloc = mgr.allocate_method_code(&request(1, 0x400), MethodHandle(1)).unwrap();

    let section = mgr.find_code_range(alloc.code).expect("section");
    let table = section.unwind.as_ref().expect("heap sections publish unwind tables");

    let base = section.lo;
    // Publish a few functions, one out of order, one fragmented.
    let rva = |addr: usize| (addr - base) as u32;
    let publish = |begin: u32, end: u32, data: u32, kind: EntryKind| {
        table.publish(UnwindRecord {
            func: RuntimeFunction { begin_rva: begin, end_rva: end, unwind_data_rva: data },
            kind,
        });
    };

    publish(rva(alloc.code), rva(alloc.code) + 0x100, 0x10, EntryKind::Root);
    publish(rva(alloc.code) + 0x300, rva(alloc.code) + 0x380, 0x20, EntryKind::Fragment);
    publish(rva(alloc.code) + 0x200, rva(alloc.code) + 0x280, 0x30, EntryKind::Root);

    let live = table.live_records();
    assert!(live.windows(2).all(|w| w[0].begin_rva < w[1].begin_rva));

    // The fragment resolves to the function root before it.
    let root = table.find_root_entry(rva(alloc.code) + 0x340).unwrap();
    assert_eq!(root.kind, EntryKind::Root);
    assert_eq!(root.func.begin_rva, rva(alloc.code));

    // Tombstone one record; sortedness of the live view is preserved.
    table.unpublish(rva(alloc.code) + 0x200);
    let live = table.live_records();
    assert_eq!(live.len(), 2);
    assert!(live.windows(2).all(|w| w[0].begin_rva < w[1].begin_rva));
}

#[test]
fn test_unload_is_complete_and_deferred() {
    let mgr = ExecutionManager::with_null_unwind();

    let a1 = mgr.allocate_method_code(&request(1, 0x4000), MethodHandle(1)).unwrap();
    let a2 = mgr.allocate_method_code(&request(2, 0x4000), MethodHandle(2)).unwrap();

    mgr.unload_allocator(AllocatorId(1));

    assert!(!mgr.is_managed_code(a1.code));
    assert!(mgr.find_code_range(a1.code).is_none());
    assert!(mgr.is_managed_code(a2.code));

    // Releases are deferred to the sweep.
    assert!(mgr.sweep_pending() >= 1);
    assert_eq!(mgr.sweep_pending(), 0);
}

#[test]
fn test_concurrent_lookups_during_allocation() {
    use std::thread;

    let mgr = Arc::new(ExecutionManager::with_null_unwind());
    let seed = mgr.allocate_method_code(&request(1, 0x100), MethodHandle(0)).unwrap();
    let probe = seed.code;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let mgr = Arc::clone(&mgr);
        handles.push(thread::spawn(move || {
            for _ in 0..5000 {
                assert!(mgr.is_managed_code(probe));
                assert!(!mgr.is_managed_code(0x10));
            }
        }));
    }
    {
        let mgr = Arc::clone(&mgr);
        handles.push(thread::spawn(move || {
            for i in 1..200u64 {
                mgr.allocate_method_code(&request(2, 0x800), MethodHandle(i)).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
}
