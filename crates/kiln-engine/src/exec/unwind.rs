//! OS unwind-table publication for JIT-compiled code
//!
//! Stack walkers only see JIT frames if every function's unwind records are
//! registered with the OS as a *growable function table*: a sorted array of
//! `(begin, end, unwind_data)` records with the same layout as a static
//! image's function table. Each range section owns one table. Appending in
//! `begin_rva` order grows in place through the OS grow primitive;
//! out-of-order publication or a full table rebuilds the array, registers
//! the new copy, and unregisters the old.
//!
//! Registration can fail (or be unsupported); the table then flips to
//! unpublished and later operations skip the OS while staying logically
//! correct, so in-process lookups keep working and stack walkers merely
//! degrade.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::error::CodeMemError;

/// One function's (or function fragment's) unwind record, RVA-relative to
/// the owning range's start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeFunction {
    /// First code byte of the function or fragment.
    pub begin_rva: u32,
    /// One past the last code byte.
    pub end_rva: u32,
    /// RVA of the unwind data. Zero marks a tombstoned (unpublished) slot.
    pub unwind_data_rva: u32,
}

/// Whether a record is a function's root entry or a continuation fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Root record; owns the function's canonical unwind data.
    Root,
    /// Fragment continuing an earlier root (e.g. cold section).
    Fragment,
}

/// A published record plus bookkeeping the OS layout has no room for.
#[derive(Debug, Clone, Copy)]
pub struct UnwindRecord {
    /// The OS-visible triple.
    pub func: RuntimeFunction,
    /// Root/fragment classification used by root-entry lookup.
    pub kind: EntryKind,
}

/// Opaque handle the OS hands back for a registered growable table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsTableHandle(pub u64);

/// The OS growable-function-table primitives, as a seam for testing and
/// for platforms without the facility.
pub trait UnwindOs: Send + Sync {
    /// Register `entries[..count]` (capacity `max_count`) for `range`.
    fn add_growable_table(
        &self,
        range: (usize, usize),
        entries: &[RuntimeFunction],
        max_count: usize,
    ) -> Result<OsTableHandle, CodeMemError>;

    /// Tell the OS that the registered table now has `new_count` entries.
    fn grow_table(&self, handle: OsTableHandle, new_count: usize);

    /// Unregister a table.
    fn delete_table(&self, handle: OsTableHandle);
}

/// Default [`UnwindOs`] that accepts every registration and does nothing.
/// Used where the OS keeps no dynamic function tables.
#[derive(Debug, Default)]
pub struct NullUnwindOs {
    next: AtomicU64,
}

impl UnwindOs for NullUnwindOs {
    fn add_growable_table(
        &self,
        _range: (usize, usize),
        _entries: &[RuntimeFunction],
        _max_count: usize,
    ) -> Result<OsTableHandle, CodeMemError> {
        Ok(OsTableHandle(self.next.fetch_add(1, Ordering::Relaxed)))
    }

    fn grow_table(&self, _handle: OsTableHandle, _new_count: usize) {}

    fn delete_table(&self, _handle: OsTableHandle) {}
}

struct TableInner {
    /// Sorted by `begin_rva`; tombstones keep their position until the
    /// next rebuild compacts them away.
    records: Vec<UnwindRecord>,
    max_count: usize,
    deleted: usize,
    handle: Option<OsTableHandle>,
    /// Cleared when the OS rejects a registration; all later OS calls for
    /// this table are skipped.
    active: bool,
}

/// Growable sorted unwind table for one range section.
pub struct UnwindTable {
    range: (usize, usize),
    os: Arc<dyn UnwindOs>,
    inner: Mutex<TableInner>,
}

impl std::fmt::Debug for UnwindTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("UnwindTable")
            .field("range", &self.range)
            .field("count", &inner.records.len())
            .field("deleted", &inner.deleted)
            .field("active", &inner.active)
            .finish()
    }
}

impl UnwindTable {
    /// Create and register an empty table for `range` with room for
    /// `initial_capacity` records.
    pub fn new(range: (usize, usize), initial_capacity: usize, os: Arc<dyn UnwindOs>) -> UnwindTable {
        let max_count = initial_capacity.max(4);
        let mut inner = TableInner {
            records: Vec::with_capacity(max_count),
            max_count,
            deleted: 0,
            handle: None,
            active: true,
        };
        match os.add_growable_table(range, &[], max_count) {
            Ok(handle) => inner.handle = Some(handle),
            Err(_) => inner.active = false,
        }
        UnwindTable {
            range,
            os,
            inner: Mutex::new(inner),
        }
    }

    /// The `[start, end)` code range this table covers.
    pub fn range(&self) -> (usize, usize) {
        self.range
    }

    /// Whether the OS currently sees this table.
    pub fn is_published(&self) -> bool {
        self.inner.lock().active
    }

    /// Publish an unwind record.
    ///
    /// A function's first record must be a [`EntryKind::Root`]; fragments
    /// may only follow a root at lower RVAs.
    pub fn publish(&self, record: UnwindRecord) {
        debug_assert_ne!(record.func.unwind_data_rva, 0, "zero marks tombstones");
        let mut inner = self.inner.lock();

        if record.kind == EntryKind::Fragment {
            // The emitter must have published the function's root first;
            // root lookup depends on it.
            debug_assert!(
                inner
                    .records
                    .iter()
                    .any(|r| r.kind == EntryKind::Root && r.func.begin_rva < record.func.begin_rva),
                "fragment published before any root"
            );
        }

        let in_order = inner
            .records
            .last()
            .map(|last| record.func.begin_rva > last.func.begin_rva)
            .unwrap_or(true);

        if in_order && inner.records.len() < inner.max_count {
            inner.records.push(record);
            let count = inner.records.len();
            if inner.active {
                if let Some(handle) = inner.handle {
                    self.os.grow_table(handle, count);
                }
            }
            return;
        }

        self.rebuild_with(&mut inner, Some(record));
    }

    /// Unpublish the record beginning at `begin_rva` by tombstoning its
    /// slot. Physical removal happens at the next rebuild.
    pub fn unpublish(&self, begin_rva: u32) {
        let mut inner = self.inner.lock();
        if let Some(rec) = inner
            .records
            .iter_mut()
            .find(|r| r.func.begin_rva == begin_rva && r.func.unwind_data_rva != 0)
        {
            rec.func.unwind_data_rva = 0;
            inner.deleted += 1;
        }
    }

    /// Grow (compacting tombstones), merge-insert `extra` if given, and
    /// re-register with the OS.
    fn rebuild_with(&self, inner: &mut TableInner, extra: Option<UnwindRecord>) {
        let live = inner.records.len() - inner.deleted;
        // 1.25x growth normally; 1.5x when the table is truly full (no
        // tombstones to reclaim).
        let new_max = if inner.deleted == 0 {
            (live + live / 2).max(live + 1)
        } else {
            (live + live / 4).max(live + 1)
        }
        .max(4);

        let mut new_records = Vec::with_capacity(new_max);
        let mut extra = extra;
        for rec in inner.records.iter().filter(|r| r.func.unwind_data_rva != 0) {
            if let Some(pending) = extra {
                if pending.func.begin_rva < rec.func.begin_rva {
                    new_records.push(pending);
                    extra = None;
                }
            }
            new_records.push(*rec);
        }
        if let Some(pending) = extra {
            new_records.push(pending);
        }

        let old_handle = inner.handle.take();
        inner.records = new_records;
        inner.max_count = new_max;
        inner.deleted = 0;

        if !inner.active {
            return;
        }

        let os_view: Vec<RuntimeFunction> = inner.records.iter().map(|r| r.func).collect();
        match self.os.add_growable_table(self.range, &os_view, new_max) {
            Ok(handle) => {
                inner.handle = Some(handle);
                if let Some(old) = old_handle {
                    self.os.delete_table(old);
                }
            }
            Err(_) => {
                // Keep the logical table; stop talking to the OS.
                inner.active = false;
                if let Some(old) = old_handle {
                    self.os.delete_table(old);
                }
            }
        }
    }

    /// The live record covering `rva`, if any.
    pub fn find_entry(&self, rva: u32) -> Option<UnwindRecord> {
        let inner = self.inner.lock();
        let idx = inner
            .records
            .partition_point(|r| r.func.begin_rva <= rva);
        inner.records[..idx]
            .iter()
            .rev()
            .find(|r| r.func.unwind_data_rva != 0)
            .filter(|r| rva < r.func.end_rva)
            .copied()
    }

    /// The *root* record for the function covering `rva`: walks backwards
    /// past fragments. The emitter guarantees every function publishes a
    /// root before any fragment, so a covering fragment implies a root.
    pub fn find_root_entry(&self, rva: u32) -> Option<UnwindRecord> {
        let inner = self.inner.lock();
        let idx = inner
            .records
            .partition_point(|r| r.func.begin_rva <= rva);
        let mut live = inner.records[..idx]
            .iter()
            .rev()
            .filter(|r| r.func.unwind_data_rva != 0);

        let covering = live.clone().next().filter(|r| rva < r.func.end_rva)?;
        if covering.kind == EntryKind::Root {
            return Some(*covering);
        }
        let root = live.find(|r| r.kind == EntryKind::Root);
        debug_assert!(root.is_some(), "fragment with no preceding root");
        root.copied()
    }

    /// Snapshot of live (non-tombstoned) records in table order.
    pub fn live_records(&self) -> Vec<RuntimeFunction> {
        self.inner
            .lock()
            .records
            .iter()
            .filter(|r| r.func.unwind_data_rva != 0)
            .map(|r| r.func)
            .collect()
    }

    /// `(current, max, deleted)` counts, for tests and diagnostics.
    pub fn counts(&self) -> (usize, usize, usize) {
        let inner = self.inner.lock();
        (inner.records.len(), inner.max_count, inner.deleted)
    }
}

impl Drop for UnwindTable {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(handle) = inner.handle.take() {
            self.os.delete_table(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Records every OS interaction; optionally fails registrations.
    #[derive(Default)]
    struct FakeOs {
        next: AtomicU64,
        registrations: AtomicUsize,
        grows: AtomicUsize,
        deletions: AtomicUsize,
        fail_after: AtomicUsize,
    }

    impl FakeOs {
        fn failing_after(n: usize) -> FakeOs {
            let os = FakeOs::default();
            os.fail_after.store(n + 1, Ordering::Relaxed);
            os
        }
    }

    impl UnwindOs for FakeOs {
        fn add_growable_table(
            &self,
            _range: (usize, usize),
            entries: &[RuntimeFunction],
            max_count: usize,
        ) -> Result<OsTableHandle, CodeMemError> {
            assert!(entries.len() <= max_count);
            let fail_after = self.fail_after.load(Ordering::Relaxed);
            if fail_after > 0 && self.registrations.load(Ordering::Relaxed) + 1 >= fail_after {
                return Err(CodeMemError::Publication);
            }
            self.registrations.fetch_add(1, Ordering::Relaxed);
            Ok(OsTableHandle(self.next.fetch_add(1, Ordering::Relaxed)))
        }

        fn grow_table(&self, _handle: OsTableHandle, _new_count: usize) {
            self.grows.fetch_add(1, Ordering::Relaxed);
        }

        fn delete_table(&self, _handle: OsTableHandle) {
            self.deletions.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn root(begin: u32, end: u32, data: u32) -> UnwindRecord {
        UnwindRecord {
            func: RuntimeFunction { begin_rva: begin, end_rva: end, unwind_data_rva: data },
            kind: EntryKind::Root,
        }
    }

    fn fragment(begin: u32, end: u32, data: u32) -> UnwindRecord {
        UnwindRecord {
            func: RuntimeFunction { begin_rva: begin, end_rva: end, unwind_data_rva: data },
            kind: EntryKind::Fragment,
        }
    }

    fn assert_sorted(table: &UnwindTable) {
        let live = table.live_records();
        assert!(live.windows(2).all(|w| w[0].begin_rva < w[1].begin_rva));
    }

    #[test]
    fn test_in_order_appends_grow_in_place() {
        let os = Arc::new(FakeOs::default());
        let table = UnwindTable::new((0x10000, 0x20000), 8, Arc::clone(&os) as _);

        for i in 0..5u32 {
            table.publish(root(i * 0x100, i * 0x100 + 0x80, 0x8000 + i));
            assert_sorted(&table);
        }
        // One registration at creation; everything else in-place grows.
        assert_eq!(os.registrations.load(Ordering::Relaxed), 1);
        assert_eq!(os.grows.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_out_of_order_publish_rebuilds_sorted() {
        let os = Arc::new(FakeOs::default());
        let table = UnwindTable::new((0x10000, 0x20000), 8, Arc::clone(&os) as _);

        table.publish(root(0x300, 0x380, 1));
        table.publish(root(0x100, 0x180, 2));
        table.publish(root(0x200, 0x280, 3));

        assert_sorted(&table);
        let live = table.live_records();
        assert_eq!(live.iter().map(|r| r.begin_rva).collect::<Vec<_>>(), vec![0x100, 0x200, 0x300]);
        // Two rebuilds (re-registrations) for the two out-of-order inserts.
        assert_eq!(os.registrations.load(Ordering::Relaxed), 3);
        assert_eq!(os.deletions.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_full_table_grows() {
        let os = Arc::new(FakeOs::default());
        let table = UnwindTable::new((0x10000, 0x20000), 4, Arc::clone(&os) as _);

        for i in 0..20u32 {
            table.publish(root(i * 0x40, i * 0x40 + 0x20, i + 1));
            assert_sorted(&table);
        }
        let (count, max, deleted) = table.counts();
        assert_eq!(count, 20);
        assert_eq!(deleted, 0);
        assert!(max >= 20);
    }

    #[test]
    fn test_unpublish_tombstones_then_compacts() {
        let os = Arc::new(FakeOs::default());
        let table = UnwindTable::new((0x10000, 0x20000), 4, Arc::clone(&os) as _);

        for i in 0..4u32 {
            table.publish(root(i * 0x100, i * 0x100 + 0x80, i + 1));
        }
        table.unpublish(0x100);
        assert_sorted(&table);
        assert_eq!(table.counts().2, 1);
        assert!(table.find_entry(0x140).is_none());

        // The next growth compacts the tombstone away.
        table.publish(root(0x400, 0x480, 9));
        let (count, _, deleted) = table.counts();
        assert_eq!(count, 4);
        assert_eq!(deleted, 0);
        assert_sorted(&table);
    }

    #[test]
    fn test_find_entry_bounds() {
        let os = Arc::new(NullUnwindOs::default());
        let table = UnwindTable::new((0, 0x10000), 8, os);

        table.publish(root(0x100, 0x180, 1));
        table.publish(root(0x200, 0x300, 2));

        assert_eq!(table.find_entry(0x100).unwrap().func.unwind_data_rva, 1);
        assert_eq!(table.find_entry(0x17F).unwrap().func.unwind_data_rva, 1);
        // Gap between the functions.
        assert!(table.find_entry(0x180).is_none());
        assert_eq!(table.find_entry(0x2FF).unwrap().func.unwind_data_rva, 2);
        assert!(table.find_entry(0x300).is_none());
    }

    #[test]
    fn test_root_lookup_skips_fragments() {
        let os = Arc::new(NullUnwindOs::default());
        let table = UnwindTable::new((0, 0x10000), 8, os);

        table.publish(root(0x100, 0x200, 1));
        table.publish(fragment(0x400, 0x500, 2));
        table.publish(fragment(0x600, 0x700, 3));

        let entry = table.find_root_entry(0x650).unwrap();
        assert_eq!(entry.func.begin_rva, 0x100);
        assert_eq!(entry.kind, EntryKind::Root);

        // A pc inside the root resolves to the root directly.
        assert_eq!(table.find_root_entry(0x150).unwrap().func.begin_rva, 0x100);
    }

    #[test]
    fn test_registration_failure_degrades_gracefully() {
        let os = Arc::new(FakeOs::failing_after(1));
        let table = UnwindTable::new((0x10000, 0x20000), 2, Arc::clone(&os) as _);
        assert!(table.is_published());

        table.publish(root(0x100, 0x180, 1));
        table.publish(root(0x200, 0x280, 2));
        // Third publish forces a rebuild whose registration fails.
        table.publish(root(0x300, 0x380, 3));
        assert!(!table.is_published());

        // The logical table keeps working.
        assert_sorted(&table);
        assert_eq!(table.live_records().len(), 3);
        table.publish(root(0x400, 0x480, 4));
        assert_eq!(table.live_records().len(), 4);
        assert_eq!(table.find_entry(0x410).unwrap().func.unwind_data_rva, 4);
    }
}
