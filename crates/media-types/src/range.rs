use serde::{Deserialize, Serialize};

/// A contiguous byte region of a remote resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    #[inline]
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Build a range from inclusive `first..=last` bounds (DASH `a-b` notation).
    /// Returns `None` when `last < first`.
    pub fn from_inclusive(first: u64, last: u64) -> Option<Self> {
        (last >= first).then(|| Self::new(first, last - first + 1))
    }

    /// First byte past the end of the range.
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Last byte included in the range, or `None` for an empty range.
    #[inline]
    pub fn last_byte(&self) -> Option<u64> {
        self.length.checked_sub(1).map(|l| self.offset + l)
    }

    /// Value of an HTTP `Range` header selecting this region.
    pub fn header_value(&self) -> String {
        match self.last_byte() {
            Some(last) => format!("bytes={}-{}", self.offset, last),
            None => format!("bytes={}-", self.offset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inclusive_bounds_round_trip_to_header() {
        let range = ByteRange::from_inclusive(752, 82863).unwrap();
        assert_eq!(range.length, 82112);
        assert_eq!(range.end(), 82864);
        assert_eq!(range.header_value(), "bytes=752-82863");
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        assert!(ByteRange::from_inclusive(10, 9).is_none());
    }

    #[test]
    fn empty_range_has_no_last_byte() {
        let range = ByteRange::new(100, 0);
        assert_eq!(range.last_byte(), None);
        assert_eq!(range.header_value(), "bytes=100-");
    }
}
