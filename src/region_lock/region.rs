use std::fmt;

use thiserror::Error;

/// An ascending, non empty integer range `[first, last]` over one shared
/// resource. What the integers address (pages, bytes, index slots) is the
/// caller's business.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Region {
    first: u64,
    last: u64,
}

impl Region {
    pub fn new(first: u64, last: u64) -> Result<Region, RegionError> {
        if first > last {
            return Err(RegionError::Descending(first, last));
        }
        Ok(Region { first, last })
    }

    pub fn first(&self) -> u64 {
        self.first
    }

    pub fn last(&self) -> u64 {
        self.last
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.first <= other.last && other.first <= self.last
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.first, self.last)
    }
}

#[derive(Debug, Error)]
pub enum RegionError {
    #[error("Regions must be ascending, got [{0}, {1}]")]
    Descending(u64, u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descending_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        assert!(Region::new(5, 4).is_err());
        assert!(Region::new(5, 5).is_ok());
        Ok(())
    }

    #[test]
    fn test_overlaps() -> Result<(), Box<dyn std::error::Error>> {
        let a = Region::new(0, 10)?;
        let b = Region::new(5, 15)?;
        let c = Region::new(11, 11)?;

        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
        assert!(b.overlaps(&c));
        Ok(())
    }
}
