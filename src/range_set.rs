//! An ordered, coalescing set of non-overlapping `u64` ranges.
//!
//! Used for packet-number ACK ranges (C3 FrameEngine) and for tracking the
//! byte ranges an out-of-order stream receiver has already buffered (C4
//! StreamManager). Adjacent and overlapping ranges are merged on insert, so
//! iteration always yields disjoint, increasing, non-adjacent ranges.

use std::collections::BTreeMap;
use std::ops::Range;

#[derive(Debug, Clone, Default)]
pub struct RangeSet {
    // Keyed by range start, value is the (exclusive) end.
    map: BTreeMap<u64, u64>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn contains(&self, x: u64) -> bool {
        self.map
            .range(..=x)
            .next_back()
            .map_or(false, |(_, &end)| x < end)
    }

    pub fn insert_one(&mut self, x: u64) {
        self.insert(x..x + 1);
    }

    /// Insert `range`, merging with any overlapping or adjacent ranges.
    pub fn insert(&mut self, range: Range<u64>) {
        if range.start >= range.end {
            return;
        }
        let mut start = range.start;
        let mut end = range.end;

        // Merge with a preceding range that touches or overlaps `start`.
        if let Some((&prev_start, &prev_end)) = self.map.range(..=start).next_back() {
            if prev_end >= start {
                start = prev_start;
                end = end.max(prev_end);
                self.map.remove(&prev_start);
            }
        }

        // Merge with every following range that touches or overlaps `end`.
        let to_remove: Vec<u64> = self
            .map
            .range(start..=end)
            .map(|(&s, _)| s)
            .collect();
        for s in to_remove {
            if let Some(e) = self.map.remove(&s) {
                end = end.max(e);
            }
        }

        self.map.insert(start, end);
    }

    /// Remove every range entirely covered by `other`, and clip partial
    /// overlaps. Used for retiring ACK ranges that have themselves been
    /// acknowledged.
    pub fn subtract(&mut self, other: &RangeSet) {
        for (&start, &end) in &other.map {
            self.remove(start..end);
        }
    }

    pub fn remove(&mut self, range: Range<u64>) {
        if range.start >= range.end {
            return;
        }
        let mut to_add = Vec::new();
        let mut to_remove = Vec::new();
        for (&s, &e) in self.map.range(..range.end) {
            if e <= range.start {
                continue;
            }
            to_remove.push(s);
            if s < range.start {
                to_add.push(s..range.start);
            }
            if e > range.end {
                to_add.push(range.end..e);
            }
        }
        for s in to_remove {
            self.map.remove(&s);
        }
        for r in to_add {
            self.map.insert(r.start, r.end);
        }
    }

    /// Smallest value not contained in the set, at or after `from`.
    pub fn first_gap(&self, from: u64) -> u64 {
        let mut x = from;
        loop {
            match self.map.range(..=x).next_back() {
                Some((_, &end)) if end > x => x = end,
                _ => return x,
            }
        }
    }

    pub fn min(&self) -> Option<u64> {
        self.map.keys().next().cloned()
    }

    pub fn max(&self) -> Option<u64> {
        self.map.values().next_back().cloned()
    }

    pub fn pop_min(&mut self) -> Option<Range<u64>> {
        let &start = self.map.keys().next()?;
        let end = self.map.remove(&start).unwrap();
        Some(start..end)
    }

    /// Iterate disjoint ranges in increasing order. Callers that need the
    /// newest-first order ACK frames encode ranges in (as
    /// `frame::encode_ack` does) should `.rev()` this.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = Range<u64>> + '_ {
        self.map.iter().map(|(&s, &e)| s..e)
    }
}

impl<'a> IntoIterator for &'a RangeSet {
    type Item = Range<u64>;
    type IntoIter = Box<dyn DoubleEndedIterator<Item = Range<u64>> + 'a>;
    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

impl std::iter::FromIterator<Range<u64>> for RangeSet {
    fn from_iter<T: IntoIterator<Item = Range<u64>>>(iter: T) -> Self {
        let mut set = RangeSet::new();
        for r in iter {
            set.insert(r);
        }
        set
    }
}

impl std::ops::AddAssign<Range<u64>> for RangeSet {
    fn add_assign(&mut self, rhs: Range<u64>) {
        self.insert(rhs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_adjacent_and_overlapping() {
        let mut s = RangeSet::new();
        s.insert(0..4);
        s.insert(4..8);
        s.insert(2..6);
        assert_eq!(s.iter().collect::<Vec<_>>(), vec![0..8]);
    }

    #[test]
    fn disjoint_ranges_stay_separate() {
        let mut s = RangeSet::new();
        s.insert(0..2);
        s.insert(5..7);
        assert_eq!(s.iter().collect::<Vec<_>>(), vec![0..2, 5..7]);
    }

    #[test]
    fn subtract_clips_partial_overlap() {
        let mut s = RangeSet::new();
        s.insert(0..10);
        let mut other = RangeSet::new();
        other.insert(3..6);
        s.subtract(&other);
        assert_eq!(s.iter().collect::<Vec<_>>(), vec![0..3, 6..10]);
    }

    #[test]
    fn contains_and_gap() {
        let mut s = RangeSet::new();
        s.insert(0..3);
        s.insert(5..8);
        assert!(s.contains(1));
        assert!(!s.contains(4));
        assert!(s.contains(7));
        assert!(!s.contains(8));
    }
}
