use std::fmt;

use super::PageOffset;

/// An inclusive, never empty run of pages `[first, last]`. The allocator
/// hands these out and the heap file locks and writes them.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PageRange {
    pub first: PageOffset,
    pub last: PageOffset,
}

impl PageRange {
    /// Caller must ensure `first <= last`, ranges are never empty.
    pub fn new(first: PageOffset, last: PageOffset) -> PageRange {
        debug_assert!(first <= last);
        PageRange { first, last }
    }

    /// Caller must ensure `length > 0`.
    pub fn from_length(first: PageOffset, length: usize) -> PageRange {
        debug_assert!(length > 0);
        PageRange {
            first,
            last: PageOffset(first.0 + length - 1),
        }
    }

    pub fn length(&self) -> usize {
        self.last.0 - self.first.0 + 1
    }

    /// The offset one past the end, useful for adjacency math.
    pub fn end(&self) -> PageOffset {
        self.last.next()
    }

    pub fn overlaps(&self, other: &PageRange) -> bool {
        self.first <= other.last && other.first <= self.last
    }

    /// Overlapping or directly adjacent, meaning the two can fold into one
    /// extent.
    pub fn touches(&self, other: &PageRange) -> bool {
        self.first.0 <= other.last.0 + 1 && other.first.0 <= self.last.0 + 1
    }

    /// Smallest range covering both. Only meaningful when they touch.
    pub fn merge(&self, other: &PageRange) -> PageRange {
        PageRange {
            first: self.first.min(other.first),
            last: self.last.max(other.last),
        }
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.first, self.last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_and_end() -> Result<(), Box<dyn std::error::Error>> {
        let range = PageRange::from_length(PageOffset(4), 3);
        assert_eq!(range.last, PageOffset(6));
        assert_eq!(range.length(), 3);
        assert_eq!(range.end(), PageOffset(7));
        Ok(())
    }

    #[test]
    fn test_overlaps() -> Result<(), Box<dyn std::error::Error>> {
        let a = PageRange::new(PageOffset(0), PageOffset(10));
        let b = PageRange::new(PageOffset(5), PageOffset(15));
        let c = PageRange::new(PageOffset(11), PageOffset(12));

        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
        Ok(())
    }

    #[test]
    fn test_touches_includes_adjacency() -> Result<(), Box<dyn std::error::Error>> {
        let a = PageRange::new(PageOffset(0), PageOffset(4));
        let b = PageRange::new(PageOffset(5), PageOffset(9));
        let c = PageRange::new(PageOffset(6), PageOffset(9));

        assert!(a.touches(&b));
        assert!(b.touches(&a));
        assert!(!a.touches(&c));

        assert_eq!(a.merge(&b), PageRange::new(PageOffset(0), PageOffset(9)));
        Ok(())
    }
}
