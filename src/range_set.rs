//! Ordered set of contiguous packet-number ranges.
//!
//! Backs the per-space ack tracker and the scratch space used when decoding
//! ACK frames. Ranges are half-open and kept maximally coalesced.

use std::collections::btree_map::{self, BTreeMap};
use std::ops::Range;

#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct RangeSet(BTreeMap<u64, u64>);

impl RangeSet {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn contains(&self, x: u64) -> bool {
        self.pred(x).map_or(false, |(_, end)| end > x)
    }

    pub fn insert_one(&mut self, x: u64) -> bool {
        self.insert(x..x + 1)
    }

    /// Returns whether any part of `range` was newly added.
    pub fn insert(&mut self, mut range: Range<u64>) -> bool {
        if range.is_empty() {
            return false;
        }
        let mut new = false;
        if let Some((start, end)) = self.pred(range.start) {
            if end >= range.end {
                return false;
            }
            if end >= range.start {
                // Grow the predecessor instead of inserting a new entry.
                self.0.remove(&start);
                range.start = start;
            }
        }
        new |= range.start < range.end;
        // Absorb successors the new range overlaps or abuts.
        while let Some((start, end)) = self.succ(range.start) {
            if start > range.end {
                break;
            }
            self.0.remove(&start);
            range.end = range.end.max(end);
        }
        self.0.insert(range.start, range.end);
        new
    }

    /// Remove every range in `other` from `self`.
    pub fn subtract(&mut self, other: &RangeSet) {
        for (&start, &end) in &other.0 {
            self.remove(start..end);
        }
    }

    pub fn remove(&mut self, range: Range<u64>) {
        if range.is_empty() {
            return;
        }
        let before = self
            .0
            .range(..=range.start)
            .next_back()
            .map(|(&s, &e)| (s, e));
        if let Some((start, end)) = before {
            if end > range.start {
                self.0.remove(&start);
                if start < range.start {
                    self.0.insert(start, range.start);
                }
                if end > range.end {
                    self.0.insert(range.end, end);
                }
            }
        }
        let contained = self
            .0
            .range(range.start..range.end)
            .map(|(&s, &e)| (s, e))
            .collect::<Vec<_>>();
        for (start, end) in contained {
            self.0.remove(&start);
            if end > range.end {
                self.0.insert(range.end, end);
            }
        }
    }

    pub fn min(&self) -> Option<u64> {
        self.0.keys().next().cloned()
    }

    pub fn max(&self) -> Option<u64> {
        self.0.values().next_back().map(|&end| end - 1)
    }

    pub fn pop_min(&mut self) -> Option<Range<u64>> {
        let (&start, &end) = self.0.iter().next()?;
        self.0.remove(&start);
        Some(start..end)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter(self.0.iter())
    }

    /// Ranges from the largest down, the order ACK frames are encoded in.
    pub fn iter_descending(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        self.0.iter().rev().map(|(&start, &end)| start..end)
    }

    fn pred(&self, x: u64) -> Option<(u64, u64)> {
        self.0.range(..=x).next_back().map(|(&s, &e)| (s, e))
    }

    fn succ(&self, x: u64) -> Option<(u64, u64)> {
        self.0
            .range((
                std::ops::Bound::Excluded(x),
                std::ops::Bound::Unbounded,
            ))
            .next()
            .map(|(&s, &e)| (s, e))
    }
}

pub struct Iter<'a>(btree_map::Iter<'a, u64, u64>);

impl<'a> Iterator for Iter<'a> {
    type Item = Range<u64>;
    fn next(&mut self) -> Option<Range<u64>> {
        self.0.next().map(|(&start, &end)| start..end)
    }
}

impl<'a> IntoIterator for &'a RangeSet {
    type Item = Range<u64>;
    type IntoIter = Iter<'a>;
    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_adjacent() {
        let mut set = RangeSet::new();
        assert!(set.insert_one(1));
        assert!(set.insert_one(2));
        assert!(set.insert_one(0));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0..3]);
        assert!(!set.insert_one(1));
    }

    #[test]
    fn merges_overlapping() {
        let mut set = RangeSet::new();
        set.insert(0..2);
        set.insert(5..10);
        set.insert(1..6);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0..10]);
    }

    #[test]
    fn keeps_gaps() {
        let mut set = RangeSet::new();
        set.insert(0..3);
        set.insert(5..8);
        assert!(set.contains(2));
        assert!(!set.contains(3));
        assert!(!set.contains(4));
        assert!(set.contains(5));
        assert_eq!(set.min(), Some(0));
        assert_eq!(set.max(), Some(7));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn subtract_splits() {
        let mut set = RangeSet::new();
        set.insert(0..10);
        let mut other = RangeSet::new();
        other.insert(3..5);
        set.subtract(&other);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0..3, 5..10]);
    }

    #[test]
    fn pop_min_drains_in_order() {
        let mut set = RangeSet::new();
        set.insert(7..9);
        set.insert(0..2);
        assert_eq!(set.pop_min(), Some(0..2));
        assert_eq!(set.pop_min(), Some(7..9));
        assert_eq!(set.pop_min(), None);
    }
}
