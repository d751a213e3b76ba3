//! Sorted, coalesced interval sets over aggregate byte ranges
//!
//! Used to track which parts of an aggregate are significant (non-padding)
//! and which parts remain uncovered after replacements are carved out.

/// A half-open byte range `[start, end)` inside an aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Inclusive start.
    pub start: u32,
    /// Exclusive end.
    pub end: u32,
}

impl Segment {
    /// Create a segment. `start < end` must hold.
    pub fn new(start: u32, end: u32) -> Segment {
        debug_assert!(start < end);
        Segment { start, end }
    }

    /// Size in bytes.
    pub fn size(&self) -> u32 {
        self.end - self.start
    }

    /// Whether the segments overlap or touch.
    pub fn intersects_or_adjacent(&self, other: &Segment) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Whether `self` fully contains `other`.
    pub fn contains(&self, other: &Segment) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// A set of non-overlapping, non-adjacent segments, sorted by start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructSegments {
    segments: Vec<Segment>,
}

impl StructSegments {
    /// Empty set.
    pub fn new() -> StructSegments {
        StructSegments::default()
    }

    /// Add a segment, merging with everything it overlaps or touches.
    pub fn add(&mut self, segment: Segment) {
        let index = self.segments.partition_point(|s| s.end < segment.start);
        let mut merged = segment;
        let mut remove_to = index;
        while remove_to < self.segments.len()
            && merged.intersects_or_adjacent(&self.segments[remove_to])
        {
            let other = self.segments[remove_to];
            merged.start = merged.start.min(other.start);
            merged.end = merged.end.max(other.end);
            remove_to += 1;
        }
        self.segments.splice(index..remove_to, [merged]);
    }

    /// Subtract a segment, splitting or trimming whatever it overlaps.
    pub fn subtract(&mut self, segment: Segment) {
        // First segment that extends past the subtrahend's start.
        let mut index = self.segments.partition_point(|s| s.end <= segment.start);

        while index < self.segments.len() {
            let cur = self.segments[index];
            if cur.start >= segment.end {
                break;
            }
            if cur.contains(&segment) {
                // Split into up to two pieces and stop.
                let mut replacement = Vec::with_capacity(2);
                if cur.start < segment.start {
                    replacement.push(Segment::new(cur.start, segment.start));
                }
                if segment.end < cur.end {
                    replacement.push(Segment::new(segment.end, cur.end));
                }
                self.segments.splice(index..index + 1, replacement);
                return;
            }
            if cur.start < segment.start {
                // Trim the tail and move on.
                self.segments[index].end = segment.start;
                index += 1;
            } else if cur.end <= segment.end {
                // Fully covered.
                self.segments.remove(index);
            } else {
                // Trim the head of the last overlapped segment.
                self.segments[index].start = segment.end;
                break;
            }
        }
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The single stored segment, if there is exactly one.
    pub fn single_segment(&self) -> Option<Segment> {
        (self.segments.len() == 1).then(|| self.segments[0])
    }

    /// The hull `[first.start, last.end)` of a non-empty set.
    pub fn covering_segment(&self) -> Option<Segment> {
        let first = self.segments.first()?;
        let last = self.segments.last()?;
        Some(Segment::new(first.start, last.end))
    }

    /// Iterate segments in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Segment> + '_ {
        self.segments.iter().copied()
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        assert!(self.segments.iter().all(|s| s.start < s.end));
        // Strictly separated: no overlap, no touching.
        assert!(self.segments.windows(2).all(|w| w[0].end < w[1].start));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(parts: &[(u32, u32)]) -> StructSegments {
        let mut s = StructSegments::new();
        for &(a, b) in parts {
            s.add(Segment::new(a, b));
            s.check_invariants();
        }
        s
    }

    fn parts(s: &StructSegments) -> Vec<(u32, u32)> {
        s.iter().map(|seg| (seg.start, seg.end)).collect()
    }

    #[test]
    fn test_add_coalesces_adjacent_and_overlapping() {
        let s = set(&[(0, 8), (8, 16)]);
        assert_eq!(parts(&s), vec![(0, 16)]);

        let s = set(&[(0, 8), (16, 24), (4, 20)]);
        assert_eq!(parts(&s), vec![(0, 24)]);

        let s = set(&[(8, 16), (0, 4)]);
        assert_eq!(parts(&s), vec![(0, 4), (8, 16)]);
    }

    #[test]
    fn test_subtract_splits_and_trims() {
        // Mirrors the aggregate-hole sequence the remainder computation
        // produces: carve two replacements out of [0, 32), then widen.
        let mut s = set(&[(0, 32)]);

        s.subtract(Segment::new(8, 16));
        s.check_invariants();
        assert_eq!(parts(&s), vec![(0, 8), (16, 32)]);

        s.subtract(Segment::new(4, 28));
        s.check_invariants();
        assert_eq!(parts(&s), vec![(0, 4), (28, 32)]);

        s.add(Segment::new(4, 28));
        s.check_invariants();
        assert_eq!(parts(&s), vec![(0, 32)]);
    }

    #[test]
    fn test_subtract_spanning_multiple_segments() {
        let mut s = set(&[(0, 8), (12, 20), (24, 32), (40, 48)]);
        s.subtract(Segment::new(4, 26));
        s.check_invariants();
        assert_eq!(parts(&s), vec![(0, 4), (26, 32), (40, 48)]);
    }

    #[test]
    fn test_subtract_misses_entirely() {
        let mut s = set(&[(8, 16)]);
        s.subtract(Segment::new(0, 8));
        s.subtract(Segment::new(16, 32));
        s.check_invariants();
        assert_eq!(parts(&s), vec![(8, 16)]);
    }

    #[test]
    fn test_add_then_subtract_is_identity() {
        let cases: &[&[(u32, u32)]] = &[
            &[(0, 8), (16, 24)],
            &[(4, 12)],
            &[],
        ];
        for initial in cases {
            for probe in [(0u32, 4u32), (2, 30), (24, 40), (100, 200)] {
                let mut s = set(initial);
                let before = parts(&s);
                // Only valid when the probe shares no bytes with the set,
                // which is the direction the invariant promises.
                if s.iter().all(|seg| {
                    seg.end <= probe.0 || probe.1 <= seg.start
                }) {
                    s.add(Segment::new(probe.0, probe.1));
                    s.subtract(Segment::new(probe.0, probe.1));
                    s.check_invariants();
                    assert_eq!(parts(&s), before, "initial={initial:?} probe={probe:?}");
                }
            }
        }
    }

    #[test]
    fn test_covering_and_single_segment() {
        let s = set(&[(4, 8), (16, 24)]);
        assert_eq!(s.covering_segment(), Some(Segment::new(4, 24)));
        assert_eq!(s.single_segment(), None);

        let s = set(&[(4, 8)]);
        assert_eq!(s.single_segment(), Some(Segment::new(4, 8)));

        let s = StructSegments::new();
        assert!(s.is_empty());
        assert_eq!(s.covering_segment(), None);
    }
}
