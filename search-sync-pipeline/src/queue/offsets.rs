//! Commit positions for out-of-order settlement of Kafka offsets.

use std::collections::{BTreeMap, HashMap};

/// Tracks received offsets per partition and which of them are settled.
///
/// Kafka commits are cumulative, so a partition's position may only advance
/// past an offset once it and every offset received before it are settled.
#[derive(Debug, Default)]
pub(crate) struct OffsetTracker {
    partitions: HashMap<i32, BTreeMap<i64, bool>>,
}

impl OffsetTracker {
    pub fn track(&mut self, partition: i32, offset: i64) {
        self.partitions
            .entry(partition)
            .or_default()
            .entry(offset)
            .or_insert(false);
    }

    /// Mark `offset` settled.
    ///
    /// Returns the position to commit when this closes a settled prefix of
    /// the partition, `None` while an earlier offset is still outstanding.
    pub fn settle(&mut self, partition: i32, offset: i64) -> Option<i64> {
        let pending = self.partitions.get_mut(&partition)?;
        *pending.get_mut(&offset)? = true;

        let mut position = None;
        while let Some(entry) = pending.first_entry() {
            if !*entry.get() {
                break;
            }
            position = Some(*entry.key() + 1);
            entry.remove();
        }
        position
    }

    /// Offsets received on `partition` and not yet committable.
    pub fn outstanding(&self, partition: i32) -> usize {
        self.partitions.get(&partition).map_or(0, BTreeMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_waits_for_earlier_offsets() {
        let mut offsets = OffsetTracker::default();
        offsets.track(0, 5);
        offsets.track(0, 6);
        offsets.track(0, 7);

        assert_eq!(offsets.settle(0, 6), None);
        assert_eq!(offsets.settle(0, 5), Some(7));
        assert_eq!(offsets.outstanding(0), 1);
        assert_eq!(offsets.settle(0, 7), Some(8));
        assert_eq!(offsets.outstanding(0), 0);
    }

    #[test]
    fn test_partitions_are_independent() {
        let mut offsets = OffsetTracker::default();
        offsets.track(0, 10);
        offsets.track(1, 3);

        assert_eq!(offsets.settle(1, 3), Some(4));
        assert_eq!(offsets.outstanding(0), 1);
    }

    #[test]
    fn test_unknown_offsets_are_ignored() {
        let mut offsets = OffsetTracker::default();
        assert_eq!(offsets.settle(0, 1), None);

        offsets.track(0, 1);
        assert_eq!(offsets.settle(0, 2), None);
        assert_eq!(offsets.outstanding(0), 1);
    }
}
