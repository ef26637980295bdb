use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::warn;

use super::postponed::{PostponedWriter, WRITE_DEBOUNCE};
use super::range_set::{OffsetRange, OffsetRangeSet, TopicPartition};
use crate::Result;

/// Durable backend for one topic's offset range set.
///
/// Implementations must be safe for concurrent use across worker
/// processes; the store above them serializes writes per topic within
/// one process.
pub trait OffsetPersistence: Send + Sync {
    /// Reads the persisted set for a topic. A missing entry is an empty
    /// set; a corrupt one is an error (the caller degrades it to empty).
    fn read(&self, topic: &str) -> Result<OffsetRangeSet>;

    /// Replaces the persisted set for a topic. `staging` is a scratch
    /// directory for backends that publish through a temp file.
    fn write(&self, topic: &str, set: &OffsetRangeSet, staging: &Path) -> Result<()>;
}

/// In-memory offset set for one topic with postponed durable writes.
///
/// Reads that fail degrade to an empty set with a warning: the cost is
/// re-processing already-emitted records, never lost output. Write
/// failures are logged and superseded by the next successful write.
pub struct OffsetStore {
    set: Arc<Mutex<OffsetRangeSet>>,
    writer: Mutex<PostponedWriter>,
}

impl OffsetStore {
    /// Loads the persisted set for `topic` and starts the write thread.
    pub fn open(backend: Arc<dyn OffsetPersistence>, topic: &str, staging: &Path) -> Self {
        let initial = backend.read(topic).unwrap_or_else(|e| {
            warn!("cannot read offsets of topic {topic}, records may be re-emitted: {e}");
            OffsetRangeSet::new()
        });
        let set = Arc::new(Mutex::new(initial));

        let write_set = Arc::clone(&set);
        let write_topic = topic.to_string();
        let staging: PathBuf = staging.to_path_buf();
        let writer = PostponedWriter::new(topic, WRITE_DEBOUNCE, move || {
            let snapshot = write_set.lock().unwrap().clone();
            backend.write(&write_topic, &snapshot, &staging)
        });

        Self {
            set,
            writer: Mutex::new(writer),
        }
    }

    /// Merges `ranges` into the set and requests a coalesced write.
    pub fn add_all(&self, ranges: &OffsetRangeSet) {
        self.set.lock().unwrap().add_all(ranges);
        self.trigger_write();
    }

    /// True iff `range` is fully covered for the partition.
    pub fn contains(&self, tp: &TopicPartition, range: &OffsetRange) -> bool {
        self.set.lock().unwrap().contains(tp, range)
    }

    /// True iff the single offset is covered for the partition.
    pub fn contains_offset(&self, tp: &TopicPartition, offset: u64) -> bool {
        self.set.lock().unwrap().contains_offset(tp, offset)
    }

    /// Requests a write without blocking.
    pub fn trigger_write(&self) {
        self.writer.lock().unwrap().trigger();
    }

    /// Forces a synchronous write of the current set.
    pub fn flush(&self) -> Result<()> {
        self.writer.lock().unwrap().flush()
    }

    /// Forces a final write and stops the background thread.
    pub fn close(&self) -> Result<()> {
        self.writer.lock().unwrap().close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MemoryPersistence {
        sets: Mutex<std::collections::HashMap<String, OffsetRangeSet>>,
    }

    impl OffsetPersistence for MemoryPersistence {
        fn read(&self, topic: &str) -> Result<OffsetRangeSet> {
            Ok(self
                .sets
                .lock()
                .unwrap()
                .get(topic)
                .cloned()
                .unwrap_or_default())
        }

        fn write(&self, topic: &str, set: &OffsetRangeSet, _staging: &Path) -> Result<()> {
            self.sets
                .lock()
                .unwrap()
                .insert(topic.to_string(), set.clone());
            Ok(())
        }
    }

    #[test]
    fn add_all_survives_a_flush_cycle() {
        let backend = Arc::new(MemoryPersistence::default());
        let staging = tempfile::tempdir().unwrap();
        let tp = TopicPartition::new("t", 0);

        let store = OffsetStore::open(backend.clone(), "t", staging.path());
        let mut ranges = OffsetRangeSet::new();
        ranges.add(&tp, OffsetRange::new(0, 9).unwrap());
        store.add_all(&ranges);
        store.close().unwrap();

        let reloaded = OffsetStore::open(backend, "t", staging.path());
        assert!(reloaded.contains_offset(&tp, 9));
        assert!(!reloaded.contains_offset(&tp, 10));
        reloaded.close().unwrap();
    }
}
