//! Per-partition commit bookkeeping.
//!
//! Kafka commits a single offset per partition: everything below it counts
//! as consumed. Deliveries are settled out of order, so the committable
//! offset is the lowest one still in flight (or one past the highest seen
//! when nothing is in flight). A nacked offset stays in flight until it is
//! delivered again and acked, which keeps the commit from passing it.

use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default)]
struct PartitionOffsets {
    in_flight: BTreeSet<i64>,
    highest_seen: Option<i64>,
    committed: Option<i64>,
}

impl PartitionOffsets {
    fn commit_point(&self) -> Option<i64> {
        self.in_flight
            .first()
            .copied()
            .or_else(|| self.highest_seen.map(|offset| offset + 1))
    }
}

/// Delivery counts and commit points for the partitions of one topic.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<i32, PartitionOffsets>,
    deliveries: HashMap<(i32, i64), u32>,
}

impl OffsetTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `offset` was handed to the subscriber; returns how many
    /// times it has been delivered by this process, starting at 1.
    pub fn delivered(&mut self, partition: i32, offset: i64) -> u32 {
        let state = self.partitions.entry(partition).or_default();
        // The first offset seen is where the group's committed position already is.
        state.committed.get_or_insert(offset);
        state.in_flight.insert(offset);
        state.highest_seen = Some(state.highest_seen.map_or(offset, |seen| seen.max(offset)));

        let count = self.deliveries.entry((partition, offset)).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Settle `offset` as processed. Returns the offset to commit if the
    /// commit point moved forward.
    pub fn acked(&mut self, partition: i32, offset: i64) -> Option<i64> {
        self.deliveries.remove(&(partition, offset));
        let state = self.partitions.get_mut(&partition)?;
        state.in_flight.remove(&offset);

        let point = state.commit_point()?;
        if state.committed.is_some_and(|committed| committed >= point) {
            return None;
        }
        state.committed = Some(point);
        Some(point)
    }

    /// Where to rewind `partition` so that every unsettled offset is
    /// delivered again.
    #[must_use]
    pub fn rewind_point(&self, partition: i32) -> Option<i64> {
        self.partitions.get(&partition)?.in_flight.first().copied()
    }

    /// Offsets handed out and not yet acked.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.partitions.values().map(|p| p.in_flight.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_acks_advance_the_commit() {
        let mut tracker = OffsetTracker::new();
        tracker.delivered(0, 10);
        tracker.delivered(0, 11);

        assert_eq!(tracker.acked(0, 10), Some(11));
        assert_eq!(tracker.acked(0, 11), Some(12));
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn commit_waits_for_the_lowest_in_flight_offset() {
        let mut tracker = OffsetTracker::new();
        for offset in 0..3 {
            tracker.delivered(0, offset);
        }

        assert_eq!(tracker.acked(0, 2), None);
        assert_eq!(tracker.acked(0, 1), None);
        assert_eq!(tracker.acked(0, 0), Some(3));
    }

    #[test]
    fn nacked_offset_blocks_commit_until_redelivered_and_acked() {
        let mut tracker = OffsetTracker::new();
        assert_eq!(tracker.delivered(0, 5), 1);
        tracker.delivered(0, 6);

        // 5 is nacked and stays in flight.
        assert_eq!(tracker.rewind_point(0), Some(5));
        assert_eq!(tracker.acked(0, 6), None);
        assert_eq!(tracker.rewind_point(0), Some(5));
        assert_eq!(tracker.delivered(0, 5), 2);
        assert_eq!(tracker.delivered(0, 6), 1);
        assert_eq!(tracker.acked(0, 5), Some(6));
        assert_eq!(tracker.acked(0, 6), Some(7));
    }

    #[test]
    fn partitions_are_independent() {
        let mut tracker = OffsetTracker::new();
        tracker.delivered(0, 100);
        tracker.delivered(1, 7);

        assert_eq!(tracker.acked(1, 7), Some(8));
        assert_eq!(tracker.in_flight(), 1);
        assert_eq!(tracker.acked(0, 100), Some(101));
        assert_eq!(tracker.acked(2, 1), None);
    }
}
