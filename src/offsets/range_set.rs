use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{RestructureError, Result};

/// A topic/partition pair identifying one shard of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicPartition {
    /// Topic name, non-empty.
    pub topic: String,
    /// Partition number within the topic.
    pub partition: u32,
}

impl TopicPartition {
    /// Creates a topic/partition pair.
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// An inclusive range `[from, to]` of processed offsets.
///
/// Equality and ordering consider only the offset bounds;
/// `last_processed` is bookkeeping carried along on merges.
#[derive(Debug, Clone, Copy)]
pub struct OffsetRange {
    /// First offset covered, inclusive.
    pub from: u64,
    /// Last offset covered, inclusive.
    pub to: u64,
    /// When an offset in this range was last processed, epoch millis.
    pub last_processed: i64,
}

impl OffsetRange {
    /// Creates a range `[from, to]` stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns an error if `from > to`.
    pub fn new(from: u64, to: u64) -> Result<Self> {
        if from > to {
            return Err(RestructureError::StringError(format!(
                "invalid offset range [{from}, {to}]"
            )));
        }
        Ok(Self {
            from,
            to,
            last_processed: Utc::now().timestamp_millis(),
        })
    }

    /// A single-offset range `[offset, offset]`.
    pub fn singleton(offset: u64) -> Self {
        Self {
            from: offset,
            to: offset,
            last_processed: Utc::now().timestamp_millis(),
        }
    }

    /// Number of offsets covered.
    pub fn size(&self) -> u64 {
        self.to - self.from + 1
    }
}

impl PartialEq for OffsetRange {
    fn eq(&self, other: &Self) -> bool {
        self.from == other.from && self.to == other.to
    }
}

impl Eq for OffsetRange {}

impl PartialOrd for OffsetRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OffsetRange {
    fn cmp(&self, other: &Self) -> Ordering {
        self.from
            .cmp(&other.from)
            .then(self.to.cmp(&other.to))
    }
}

impl fmt::Display for OffsetRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}

/// Canonical set of processed offset ranges, keyed by topic partition.
///
/// Each partition holds a sorted list of disjoint ranges where no two
/// neighbours are adjacent: for consecutive r1, r2 always
/// `r1.to + 1 < r2.from`. Mutations preserve this by merging on insert.
///
/// The set itself is not thread-safe; the accountant owns it behind
/// its own synchronization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetRangeSet {
    partitions: HashMap<TopicPartition, Vec<OffsetRange>>,
}

impl OffsetRangeSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the single offset `[offset, offset]` for a partition.
    pub fn add_offset(&mut self, tp: &TopicPartition, offset: u64) {
        self.add(tp, OffsetRange::singleton(offset));
    }

    /// Adds a range, merging with any overlapping or adjacent stored
    /// ranges. The merged range keeps the maximum `last_processed` of
    /// all participants.
    pub fn add(&mut self, tp: &TopicPartition, range: OffsetRange) {
        let list = self.partitions.entry(tp.clone()).or_default();
        add_to_list(list, range);
    }

    /// Adds every range of `other` into this set.
    pub fn add_all(&mut self, other: &OffsetRangeSet) {
        for (tp, ranges) in &other.partitions {
            let list = self.partitions.entry(tp.clone()).or_default();
            for &range in ranges {
                add_to_list(list, range);
            }
        }
    }

    /// True iff some stored range fully covers `range`.
    pub fn contains(&self, tp: &TopicPartition, range: &OffsetRange) -> bool {
        let Some(list) = self.partitions.get(tp) else {
            return false;
        };
        // First range with from > range.from sits at i; its left
        // neighbour is the only candidate container.
        let i = list.partition_point(|r| r.from <= range.from);
        i > 0 && list[i - 1].to >= range.to
    }

    /// True iff the single offset is covered.
    pub fn contains_offset(&self, tp: &TopicPartition, offset: u64) -> bool {
        self.contains(
            tp,
            &OffsetRange {
                from: offset,
                to: offset,
                last_processed: 0,
            },
        )
    }

    /// Number of stored ranges for a partition.
    pub fn size(&self, tp: &TopicPartition) -> usize {
        self.partitions.get(tp).map_or(0, Vec::len)
    }

    /// True iff no partition holds any range.
    pub fn is_empty(&self) -> bool {
        self.partitions.values().all(Vec::is_empty)
    }

    /// Iterates all `(partition, range)` pairs in unspecified
    /// partition order; ranges within a partition come out sorted.
    pub fn ranges(&self) -> impl Iterator<Item = (&TopicPartition, &OffsetRange)> {
        self.partitions
            .iter()
            .flat_map(|(tp, ranges)| ranges.iter().map(move |r| (tp, r)))
    }

    /// The partitions present in this set.
    pub fn topic_partitions(&self) -> impl Iterator<Item = &TopicPartition> {
        self.partitions.keys()
    }
}

/// Inserts `range` into a sorted canonical list, merging neighbours.
///
/// Binary-searches the insertion point, folds in the left neighbour
/// when `left.to + 1 >= range.from`, then absorbs right neighbours
/// while `right.from <= merged.to + 1`.
fn add_to_list(list: &mut Vec<OffsetRange>, mut range: OffsetRange) {
    let mut i = list.partition_point(|r| r.from < range.from);

    if i > 0 && list[i - 1].to.saturating_add(1) >= range.from {
        i -= 1;
        let left = list.remove(i);
        range.from = left.from;
        range.to = range.to.max(left.to);
        range.last_processed = range.last_processed.max(left.last_processed);
    }

    while i < list.len() && list[i].from <= range.to.saturating_add(1) {
        let right = list.remove(i);
        range.to = range.to.max(right.to);
        range.last_processed = range.last_processed.max(right.last_processed);
    }

    list.insert(i, range);
}
