//! Ahead-of-time compiled images
//!
//! An AOT image is the second implementation of the range-section contract:
//! a contiguous executable region whose method layout was fixed at build
//! time. The execution manager treats it as opaque apart from the sorted
//! method table it exposes for address→method lookup.

use super::code_heap::MethodHandle;

/// One method's extent inside an AOT image, RVA-relative to the image base.
#[derive(Debug, Clone, Copy)]
pub struct AotMethod {
    /// First code byte, relative to the image base.
    pub begin_rva: u32,
    /// One past the last code byte, relative to the image base.
    pub end_rva: u32,
    /// Owning method.
    pub method: MethodHandle,
}

/// A loaded ahead-of-time image participating in code-range lookup.
#[derive(Debug)]
pub struct AotImage {
    base: usize,
    size: usize,
    /// Sorted by `begin_rva`; non-overlapping.
    methods: Vec<AotMethod>,
}

impl AotImage {
    /// Describe a mapped image. `methods` must be sorted by `begin_rva`
    /// and non-overlapping.
    pub fn new(base: usize, size: usize, methods: Vec<AotMethod>) -> AotImage {
        debug_assert!(methods.windows(2).all(|w| w[0].end_rva <= w[1].begin_rva));
        AotImage {
            base,
            size,
            methods,
        }
    }

    /// Image base address.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Image size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The method whose code covers `pc`, if any.
    pub fn find_method(&self, pc: usize) -> Option<MethodHandle> {
        if pc < self.base || pc >= self.base + self.size {
            return None;
        }
        let rva = (pc - self.base) as u32;
        let idx = self.methods.partition_point(|m| m.begin_rva <= rva);
        let candidate = self.methods.get(idx.checked_sub(1)?)?;
        (rva < candidate.end_rva).then_some(candidate.method)
    }

    /// Whether `pc` lies inside some method body (not padding or data).
    pub fn is_code(&self, pc: usize) -> bool {
        self.find_method(pc).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_lookup() {
        let img = AotImage::new(
            0x40000,
            0x1000,
            vec![
                AotMethod { begin_rva: 0x100, end_rva: 0x200, method: MethodHandle(1) },
                AotMethod { begin_rva: 0x200, end_rva: 0x280, method: MethodHandle(2) },
                AotMethod { begin_rva: 0x300, end_rva: 0x400, method: MethodHandle(3) },
            ],
        );

        assert_eq!(img.find_method(0x40100), Some(MethodHandle(1)));
        assert_eq!(img.find_method(0x401FF), Some(MethodHandle(1)));
        assert_eq!(img.find_method(0x40200), Some(MethodHandle(2)));
        // Gap between methods is not code.
        assert_eq!(img.find_method(0x402C0), None);
        // Outside the image entirely.
        assert_eq!(img.find_method(0x3FFFF), None);
        assert_eq!(img.find_method(0x41000), None);
    }
}
