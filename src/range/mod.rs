//! Byte range index
//!
//! An ordered collection of disjoint, non-touching half-open ranges keyed by
//! their start offset. Overlapping or adjacent additions coalesce into a
//! single entry, so the index never stores two ranges that could be merged.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;

/// Half-open byte range `[begin, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileRange {
    pub begin: u64,
    pub end: u64,
}

impl FileRange {
    /// Create a range; `end` is clamped so the range is never inverted
    pub fn new(begin: u64, end: u64) -> Self {
        Self {
            begin,
            end: end.max(begin),
        }
    }

    /// Range of `length` bytes starting at `offset`
    pub fn at(offset: u64, length: u64) -> Self {
        Self::new(offset, offset.saturating_add(length))
    }

    pub fn len(&self) -> u64 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.begin <= offset && offset < self.end
    }

    /// Whether `other` lies entirely inside this range
    pub fn covers(&self, other: &FileRange) -> bool {
        self.begin <= other.begin && other.end <= self.end
    }

    /// Whether the ranges share at least one byte
    pub fn intersects(&self, other: &FileRange) -> bool {
        self.begin < other.end && other.begin < self.end
    }

    /// Whether the ranges overlap or touch end to end
    pub fn adjoins(&self, other: &FileRange) -> bool {
        self.begin <= other.end && other.begin <= self.end
    }

    /// Smallest range containing both
    pub fn union(&self, other: &FileRange) -> FileRange {
        FileRange::new(self.begin.min(other.begin), self.end.max(other.end))
    }

    /// Overlapping part, if any
    pub fn intersection(&self, other: &FileRange) -> Option<FileRange> {
        let range = FileRange::new(self.begin.max(other.begin), self.end.min(other.end));
        (!range.is_empty()).then_some(range)
    }
}

impl fmt::Display for FileRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

#[derive(Debug, Clone)]
struct Slot<V> {
    end: u64,
    value: V,
}

/// Ordered map of disjoint ranges to values
#[derive(Debug, Clone)]
pub struct FileRangeMap<V> {
    entries: BTreeMap<u64, Slot<V>>,
}

/// Ordered set of disjoint ranges
pub type FileRangeSet = FileRangeMap<()>;

impl<V> Default for FileRangeMap<V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<V> FileRangeMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin offsets of every entry overlapping or touching `range`
    fn adjoining(&self, range: &FileRange) -> Vec<u64> {
        let mut keys = Vec::new();

        // At most one entry starting before the range can reach into it.
        if let Some((&begin, slot)) = self
            .entries
            .range((Bound::Unbounded, Bound::Excluded(range.begin)))
            .next_back()
        {
            if slot.end >= range.begin {
                keys.push(begin);
            }
        }

        keys.extend(
            self.entries
                .range((Bound::Included(range.begin), Bound::Included(range.end)))
                .map(|(&begin, _)| begin),
        );
        keys
    }

    fn covering(&self, range: &FileRange) -> Option<FileRange> {
        let (&begin, slot) = self.entries.range(..=range.begin).next_back()?;
        let entry = FileRange::new(begin, slot.end);
        (entry.covers(range) && !range.is_empty()).then_some(entry)
    }

    fn merge(&mut self, range: FileRange, value: V) -> FileRange {
        let mut merged = range;
        for begin in self.adjoining(&range) {
            if let Some(slot) = self.entries.remove(&begin) {
                merged = merged.union(&FileRange::new(begin, slot.end));
            }
        }

        self.entries.insert(
            merged.begin,
            Slot {
                end: merged.end,
                value,
            },
        );
        merged
    }

    /// Insert `range`, coalescing it with every overlapping or adjacent entry
    ///
    /// The merged entry takes `value`. Empty ranges are ignored.
    ///
    /// # Returns
    /// The resulting entry, and false when an existing entry already covered `range`
    pub fn add(&mut self, range: FileRange, value: V) -> (FileRange, bool) {
        self.try_add(range, || value)
    }

    /// Like [`add`](Self::add), but builds the value only when something changes
    pub fn try_add<F>(&mut self, range: FileRange, make_value: F) -> (FileRange, bool)
    where
        F: FnOnce() -> V,
    {
        if range.is_empty() {
            return (range, false);
        }

        if let Some(existing) = self.covering(&range) {
            return (existing, false);
        }

        (self.merge(range, make_value()), true)
    }

    /// Entries intersecting `query`, in ascending order
    pub fn find(&self, query: FileRange) -> Vec<(FileRange, &V)> {
        if query.is_empty() {
            return Vec::new();
        }

        let mut found = Vec::new();
        if let Some((&begin, slot)) = self.entries.range(..query.begin).next_back() {
            if slot.end > query.begin {
                found.push((FileRange::new(begin, slot.end), &slot.value));
            }
        }

        found.extend(
            self.entries
                .range(query.begin..query.end)
                .map(|(&begin, slot)| (FileRange::new(begin, slot.end), &slot.value)),
        );
        found
    }

    /// Entry starting exactly at `begin`
    pub fn get(&self, begin: u64) -> Option<(FileRange, &V)> {
        self.entries
            .get(&begin)
            .map(|slot| (FileRange::new(begin, slot.end), &slot.value))
    }

    /// Entry containing `offset`
    pub fn containing(&self, offset: u64) -> Option<(FileRange, &V)> {
        let (&begin, slot) = self.entries.range(..=offset).next_back()?;
        (slot.end > offset).then(|| (FileRange::new(begin, slot.end), &slot.value))
    }

    /// Whether a single entry covers all of `range`
    pub fn contains(&self, range: FileRange) -> bool {
        range.is_empty() || self.covering(&range).is_some()
    }

    /// Parts of `query` not covered by any entry, in ascending order
    pub fn gaps(&self, query: FileRange) -> Vec<FileRange> {
        let mut gaps = Vec::new();
        let mut cursor = query.begin;

        for (entry, _) in self.find(query) {
            if entry.begin > cursor {
                gaps.push(FileRange::new(cursor, entry.begin));
            }
            cursor = cursor.max(entry.end);
        }

        if cursor < query.end {
            gaps.push(FileRange::new(cursor, query.end));
        }
        gaps
    }

    /// Remove the entry starting at `begin`
    pub fn remove(&mut self, begin: u64) -> Option<(FileRange, V)> {
        self.entries
            .remove(&begin)
            .map(|slot| (FileRange::new(begin, slot.end), slot.value))
    }

    /// Remove every whole entry intersecting `query`
    ///
    /// # Returns
    /// Number of entries removed
    pub fn remove_entries(&mut self, query: FileRange) -> usize {
        let keys: Vec<u64> = self.find(query).into_iter().map(|(r, _)| r.begin).collect();
        for key in &keys {
            self.entries.remove(key);
        }
        keys.len()
    }

    /// Iterate over every entry in ascending order
    pub fn iter(&self) -> impl Iterator<Item = (FileRange, &V)> + '_ {
        self.entries
            .iter()
            .map(|(&begin, slot)| (FileRange::new(begin, slot.end), &slot.value))
    }

    pub fn first(&self) -> Option<(FileRange, &V)> {
        self.iter().next()
    }

    pub fn last(&self) -> Option<(FileRange, &V)> {
        self.entries
            .iter()
            .next_back()
            .map(|(&begin, slot)| (FileRange::new(begin, slot.end), &slot.value))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(begin: u64, end: u64) -> FileRange {
        FileRange::new(begin, end)
    }

    fn ranges(set: &FileRangeSet) -> Vec<FileRange> {
        set.iter().map(|(range, _)| range).collect()
    }

    #[test]
    fn test_overlapping_add_merges() {
        let mut set = FileRangeSet::new();
        assert_eq!(set.add(r(2, 4), ()), (r(2, 4), true));
        assert_eq!(set.add(r(1, 3), ()), (r(1, 4), true));

        assert_eq!(set.len(), 1);
        assert_eq!(ranges(&set), vec![r(1, 4)]);
    }

    #[test]
    fn test_adjacent_add_merges() {
        let mut set = FileRangeSet::new();
        set.add(r(0, 10), ());
        set.add(r(20, 30), ());
        let (merged, added) = set.add(r(10, 20), ());

        assert!(added);
        assert_eq!(merged, r(0, 30));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_covered_add_reports_existing() {
        let mut set = FileRangeSet::new();
        set.add(r(0, 100), ());

        let mut built = false;
        let (entry, added) = set.try_add(r(10, 20), || built = true);
        assert_eq!(entry, r(0, 100));
        assert!(!added);
        assert!(!built);
    }

    #[test]
    fn test_add_spanning_many_entries() {
        let mut set = FileRangeSet::new();
        for i in 0..5 {
            set.add(r(i * 10, i * 10 + 5), ());
        }
        assert_eq!(set.len(), 5);

        let (merged, _) = set.add(r(3, 42), ());
        assert_eq!(merged, r(0, 45));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_entries_never_touch() {
        let mut set = FileRangeSet::new();
        let adds = [(5, 9), (0, 2), (12, 15), (2, 3), (9, 12), (20, 22), (16, 19)];
        for (begin, end) in adds {
            set.add(r(begin, end), ());
        }

        let entries = ranges(&set);
        for pair in entries.windows(2) {
            assert!(pair[0].end < pair[1].begin, "{} touches {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_find_ascending_and_exact() {
        let mut set = FileRangeSet::new();
        set.add(r(0, 5), ());
        set.add(r(10, 15), ());
        set.add(r(20, 25), ());
        set.add(r(30, 35), ());

        let found: Vec<_> = set.find(r(12, 22)).into_iter().map(|(x, _)| x).collect();
        assert_eq!(found, vec![r(10, 15), r(20, 25)]);

        // Half-open: touching the end of an entry is not an intersection.
        assert!(set.find(r(5, 10)).is_empty());
        assert_eq!(set.find(r(4, 11)).len(), 2);
    }

    #[test]
    fn test_map_values_follow_entries() {
        let mut map = FileRangeMap::new();
        map.add(r(0, 4), "a");
        map.add(r(8, 12), "b");

        assert_eq!(map.containing(9), Some((r(8, 12), &"b")));
        assert_eq!(map.containing(4), None);

        map.add(r(4, 8), "c");
        assert_eq!(map.get(0), Some((r(0, 12), &"c")));
    }

    #[test]
    fn test_gaps() {
        let mut set = FileRangeSet::new();
        set.add(r(10, 20), ());
        set.add(r(30, 40), ());

        assert_eq!(set.gaps(r(0, 50)), vec![r(0, 10), r(20, 30), r(40, 50)]);
        assert_eq!(set.gaps(r(12, 18)), Vec::<FileRange>::new());
        assert_eq!(set.gaps(r(15, 35)), vec![r(20, 30)]);
    }

    #[test]
    fn test_remove_whole_entries() {
        let mut set = FileRangeSet::new();
        set.add(r(0, 5), ());
        set.add(r(10, 15), ());
        set.add(r(20, 25), ());

        assert_eq!(set.remove_entries(r(3, 12)), 2);
        assert_eq!(ranges(&set), vec![r(20, 25)]);

        assert_eq!(set.remove(20), Some((r(20, 25), ())));
        assert!(set.is_empty());
    }

    #[test]
    fn test_contains() {
        let mut set = FileRangeSet::new();
        set.add(r(0, 10), ());
        set.add(r(11, 20), ());

        assert!(set.contains(r(2, 8)));
        assert!(!set.contains(r(5, 15)));
        assert!(set.contains(r(7, 7)));
    }
}
