use std::collections::BTreeMap;
use std::sync::Arc;

use crate::segment::Segment;

/// Ordered set of segments keyed by `start_index`.
///
/// Segments never overlap: for any two consecutive segments `a`, `b` in the
/// set, `a.end_index() <= b.start_index`.
#[derive(Default)]
pub struct SegmentSet {
    by_start: BTreeMap<u64, Arc<Segment>>,
}

impl SegmentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, segment: Arc<Segment>) {
        self.by_start.insert(segment.start_index, segment);
    }

    pub fn remove(&mut self, start_index: u64) -> Option<Arc<Segment>> {
        self.by_start.remove(&start_index)
    }

    pub fn get(&self, start_index: u64) -> Option<&Arc<Segment>> {
        self.by_start.get(&start_index)
    }

    pub fn is_empty(&self) -> bool {
        self.by_start.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_start.len()
    }

    /// The segment with the greatest `start_index <= index`, if any.
    pub fn floor(&self, index: u64) -> Option<&Arc<Segment>> {
        self.by_start.range(..=index).next_back().map(|(_, s)| s)
    }

    /// The segment with the smallest `start_index >= index`, if any.
    pub fn ceiling(&self, index: u64) -> Option<&Arc<Segment>> {
        self.by_start.range(index..).next().map(|(_, s)| s)
    }

    /// The first segment (lowest `start_index`), if any.
    pub fn first(&self) -> Option<&Arc<Segment>> {
        self.by_start.values().next()
    }

    /// The last segment (highest `start_index`), if any.
    pub fn last(&self) -> Option<&Arc<Segment>> {
        self.by_start.values().next_back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Segment>> {
        self.by_start.values()
    }

    pub fn start_indices(&self) -> impl Iterator<Item = u64> + '_ {
        self.by_start.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn seg(start: u64, max_len: u64) -> Arc<Segment> {
        Arc::new(Segment::new(PathBuf::from(format!("seg.{start}")), start, max_len))
    }

    #[test]
    fn floor_and_ceiling() {
        let mut set = SegmentSet::new();
        set.insert(seg(0, 10));
        set.insert(seg(10, 10));
        set.insert(seg(30, 10));

        assert_eq!(set.floor(5).unwrap().start_index, 0);
        assert_eq!(set.floor(10).unwrap().start_index, 10);
        assert_eq!(set.floor(25).unwrap().start_index, 10);
        assert!(set.floor(0).is_some());

        assert_eq!(set.ceiling(5).unwrap().start_index, 10);
        assert_eq!(set.ceiling(10).unwrap().start_index, 10);
        assert_eq!(set.ceiling(31).is_none(), true);
    }

    #[test]
    fn remove_and_len() {
        let mut set = SegmentSet::new();
        set.insert(seg(0, 10));
        set.insert(seg(10, 10));
        assert_eq!(set.len(), 2);
        assert!(set.remove(0).is_some());
        assert_eq!(set.len(), 1);
        assert!(set.remove(0).is_none());
    }
}
