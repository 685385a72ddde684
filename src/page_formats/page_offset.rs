use std::{
    fmt,
    ops::{Add, AddAssign},
};

/// Index of a page within a heap file's page area. Page 0 is the first page
/// after the file header and alignment padding.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PageOffset(pub usize);

impl PageOffset {
    /// The offset immediately after this one.
    pub fn next(self) -> PageOffset {
        PageOffset(self.0 + 1)
    }
}

impl Add for PageOffset {
    type Output = PageOffset;
    fn add(self, other: Self) -> Self::Output {
        PageOffset(self.0 + other.0)
    }
}

impl AddAssign for PageOffset {
    fn add_assign(&mut self, other: Self) {
        self.0.add_assign(other.0);
    }
}

impl fmt::Display for PageOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_assign() -> Result<(), Box<dyn std::error::Error>> {
        let mut test = PageOffset(1);
        test += PageOffset(2);
        assert_eq!(test, PageOffset(3));
        Ok(())
    }

    #[test]
    fn test_next() -> Result<(), Box<dyn std::error::Error>> {
        assert_eq!(PageOffset(0).next(), PageOffset(1));
        Ok(())
    }
}
