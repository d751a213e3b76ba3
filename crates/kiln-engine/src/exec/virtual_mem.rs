//! OS page management for executable code heaps
//!
//! Wraps reserve / commit / protect / release of executable pages. A heap
//! first *reserves* address space (no backing store), then *commits* pages
//! as its allocation high-water mark grows. On unix this maps directly to
//! `mmap`/`mprotect`; other targets get a plain heap-backed fallback that
//! supports everything except placement within an address window.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Allocation granularity used when probing for a reservation inside an
/// address window. 64 KiB matches the coarsest granularity of the platforms
/// we care about and keeps probe counts low.
pub const RESERVE_GRANULARITY: usize = 64 * 1024;

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Size of an OS page.
pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let size = query_page_size();
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

#[cfg(unix)]
fn query_page_size() -> usize {
    // Safety: sysconf with a valid name has no preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if raw <= 0 {
        4096
    } else {
        raw as usize
    }
}

#[cfg(not(unix))]
fn query_page_size() -> usize {
    4096
}

/// Round `value` up to the next page boundary.
pub fn round_up_to_page(value: usize) -> usize {
    let page = page_size();
    (value + page - 1) & !(page - 1)
}

/// Round `value` down to a page boundary.
pub fn round_down_to_page(value: usize) -> usize {
    value & !(page_size() - 1)
}

/// A reserved region of address space that code heaps carve pages out of.
///
/// The region starts fully uncommitted; [`Reservation::commit`] makes page
/// ranges readable/writable/executable. The mapping is released on drop.
#[derive(Debug)]
pub struct Reservation {
    base: usize,
    size: usize,
    #[cfg(not(unix))]
    backing: Vec<u8>,
}

// The reservation is an address range; all mutation of the underlying pages
// goes through raw pointers guarded by the owning heap's locking discipline.
unsafe impl Send for Reservation {}
unsafe impl Sync for Reservation {}

impl Reservation {
    /// Reserve `size` bytes of address space anywhere.
    pub fn reserve(size: usize) -> Option<Reservation> {
        let size = round_up_to_page(size);
        reserve_impl(size)
    }

    /// Reserve `size` bytes such that the entire region lies in `[lo, hi]`.
    ///
    /// Probes candidate base addresses at [`RESERVE_GRANULARITY`] steps.
    /// Returns `None` when no placement in the window succeeds.
    pub fn reserve_within(size: usize, lo: usize, hi: usize) -> Option<Reservation> {
        let size = round_up_to_page(size);
        if lo > hi || hi - lo < size {
            return None;
        }
        reserve_within_impl(size, lo, hi)
    }

    /// Base address of the reservation. Page aligned.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Total reserved size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Commit `[offset, offset + len)` as read/write/execute pages.
    ///
    /// `offset` and `len` must be page aligned and lie inside the
    /// reservation. Committing an already-committed range is a no-op.
    pub fn commit(&self, offset: usize, len: usize) -> bool {
        debug_assert_eq!(offset % page_size(), 0);
        debug_assert_eq!(len % page_size(), 0);
        debug_assert!(offset + len <= self.size);
        commit_impl(self, offset, len)
    }
}

#[cfg(unix)]
mod sys {
    use super::*;
    use std::ptr;

    pub(super) fn reserve_impl(size: usize) -> Option<Reservation> {
        // Safety: anonymous PROT_NONE mapping with no address hint.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        Some(Reservation {
            base: ptr as usize,
            size,
        })
    }

    pub(super) fn reserve_within_impl(size: usize, lo: usize, hi: usize) -> Option<Reservation> {
        let first = (lo + RESERVE_GRANULARITY - 1) & !(RESERVE_GRANULARITY - 1);
        let last = (hi - size) & !(RESERVE_GRANULARITY - 1);
        if first > last {
            return None;
        }

        // Cap the number of probes; stride up if the window is huge.
        let span = last - first;
        let mut stride = RESERVE_GRANULARITY;
        const MAX_PROBES: usize = 1024;
        if span / stride > MAX_PROBES {
            stride = ((span / MAX_PROBES) + RESERVE_GRANULARITY - 1) & !(RESERVE_GRANULARITY - 1);
        }

        let mut candidate = first;
        loop {
            if let Some(res) = try_reserve_at(candidate, size) {
                return Some(res);
            }
            match candidate.checked_add(stride) {
                Some(next) if next <= last => candidate = next,
                _ => return None,
            }
        }
    }

    fn try_reserve_at(addr: usize, size: usize) -> Option<Reservation> {
        #[cfg(target_os = "linux")]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE;
        #[cfg(not(target_os = "linux"))]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

        // Safety: anonymous mapping; MAP_FIXED_NOREPLACE never clobbers an
        // existing mapping, and on the hint-only path we verify the result.
        let ptr = unsafe { libc::mmap(addr as *mut _, size, libc::PROT_NONE, flags, -1, 0) };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        if ptr as usize != addr {
            // The kernel placed us elsewhere; give the mapping back.
            // Safety: `ptr` is a live mapping of exactly `size` bytes.
            unsafe { libc::munmap(ptr, size) };
            return None;
        }
        Some(Reservation {
            base: addr,
            size,
        })
    }

    pub(super) fn commit_impl(res: &Reservation, offset: usize, len: usize) -> bool {
        // Safety: the range is inside our own reservation.
        let ret = unsafe {
            libc::mprotect(
                (res.base + offset) as *mut _,
                len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            )
        };
        ret == 0
    }

    impl Drop for Reservation {
        fn drop(&mut self) {
            // Safety: we own the mapping.
            unsafe {
                libc::munmap(self.base as *mut _, self.size);
            }
        }
    }
}

#[cfg(unix)]
use sys::{commit_impl, reserve_impl, reserve_within_impl};

#[cfg(not(unix))]
mod sys {
    use super::*;

    pub(super) fn reserve_impl(size: usize) -> Option<Reservation> {
        let mut backing = vec![0u8; size + page_size()];
        let raw = backing.as_mut_ptr() as usize;
        let base = round_up_to_page(raw);
        Some(Reservation {
            base,
            size,
            backing,
        })
    }

    pub(super) fn reserve_within_impl(_size: usize, _lo: usize, _hi: usize) -> Option<Reservation> {
        // Placement is an OS facility; the fallback cannot honor it.
        None
    }

    pub(super) fn commit_impl(_res: &Reservation, _offset: usize, _len: usize) -> bool {
        true
    }
}

#[cfg(not(unix))]
use sys::{commit_impl, reserve_impl, reserve_within_impl};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_rounding() {
        let page = page_size();
        assert_eq!(round_up_to_page(0), 0);
        assert_eq!(round_up_to_page(1), page);
        assert_eq!(round_up_to_page(page), page);
        assert_eq!(round_down_to_page(page + 1), page);
    }

    #[test]
    fn test_reserve_and_commit() {
        let res = Reservation::reserve(4 * page_size()).unwrap();
        assert_eq!(res.base() % page_size(), 0);
        assert!(res.size() >= 4 * page_size());
        assert!(res.commit(0, page_size()));

        // Committed pages are writable.
        // Safety: the first page was just committed read/write.
        unsafe {
            let p = res.base() as *mut u8;
            p.write(0xCC);
            assert_eq!(p.read(), 0xCC);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_reserve_within_window() {
        // Reserve anywhere first to learn a plausible free neighborhood,
        // then ask for a placement in a window around it.
        let probe = Reservation::reserve(RESERVE_GRANULARITY).unwrap();
        let lo = probe.base().saturating_sub(1 << 30);
        let hi = probe.base() + (1 << 30);
        drop(probe);

        if let Some(res) = Reservation::reserve_within(RESERVE_GRANULARITY, lo, hi) {
            assert!(res.base() >= lo);
            assert!(res.base() + res.size() <= hi + 1);
        }
    }

    #[test]
    fn test_reserve_within_rejects_empty_window() {
        assert!(Reservation::reserve_within(0x10000, 0x200000, 0x100000).is_none());
        assert!(Reservation::reserve_within(0x20000, 0x100000, 0x10F000).is_none());
    }
}
