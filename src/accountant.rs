//! Commit tracking for processed records.
//!
//! Workers stage completions in a [`Ledger`]; the per-topic
//! [`Accountant`] merges ledgers into the durable offset store and the
//! engine-wide bins tally. A crash between staging and commit costs at
//! most re-processing, never data on the target.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::offsets::{OffsetPersistence, OffsetRange, OffsetRangeSet, OffsetStore, TopicPartition};
use crate::storage::StorageDriver;
use crate::Result;

/// The unit of processing: one record at one offset.
#[derive(Debug, Clone)]
pub struct Transaction {
    /// Partition the record came from.
    pub tp: TopicPartition,
    /// Offset of the record within the partition.
    pub offset: u64,
}

impl Transaction {
    /// Creates a transaction for one record.
    pub fn new(tp: TopicPartition, offset: u64) -> Self {
        Self { tp, offset }
    }
}

/// Key of the output bin tally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Bin {
    /// Topic the records came from.
    pub topic: String,
    /// Sanitized source category.
    pub category: String,
    /// Time bin the records landed in.
    pub time_bin: String,
}

/// Offsets and bin ticks staged by one file cache between flushes.
#[derive(Debug, Default)]
pub struct Ledger {
    offsets: OffsetRangeSet,
    bins: HashMap<Bin, u64>,
}

impl Ledger {
    /// Stages one successfully written record.
    pub fn add(&mut self, transaction: &Transaction, bin: Bin) {
        self.offsets.add_offset(&transaction.tp, transaction.offset);
        *self.bins.entry(bin).or_insert(0) += 1;
    }

    /// True when nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty() && self.bins.is_empty()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BinRow {
    topic: String,
    category: String,
    #[serde(rename = "timeBin")]
    time_bin: String,
    count: u64,
}

/// The engine-wide `bins.csv` tally at the output root.
///
/// Counts accumulate in memory and merge into the published file on
/// flush. The mutex serializes workers within this process; the
/// rewrite publishes atomically through the target driver.
pub struct BinFile {
    driver: Arc<dyn StorageDriver>,
    path: PathBuf,
    staging: TempDir,
    state: Mutex<HashMap<Bin, u64>>,
}

impl BinFile {
    /// Creates the tally for `<output_root>/bins.csv`.
    pub fn new(
        driver: Arc<dyn StorageDriver>,
        output_root: &Path,
        tmp_root: &Path,
    ) -> Result<Self> {
        let staging = tempfile::Builder::new()
            .prefix("bins-")
            .tempdir_in(tmp_root)?;
        Ok(Self {
            driver,
            path: output_root.join("bins.csv"),
            staging,
            state: Mutex::new(HashMap::new()),
        })
    }

    /// Accumulates bin ticks in memory.
    pub fn add(&self, counts: &HashMap<Bin, u64>) {
        let mut state = self.state.lock().unwrap();
        for (bin, count) in counts {
            *state.entry(bin.clone()).or_insert(0) += count;
        }
    }

    /// Merges the pending counts into `bins.csv` and publishes it.
    pub fn flush(&self) -> Result<()> {
        let pending = {
            let mut state = self.state.lock().unwrap();
            if state.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *state)
        };

        match self.merge_and_publish(&pending) {
            Ok(()) => Ok(()),
            Err(e) => {
                // Put the ticks back so the next flush retries them.
                self.add(&pending);
                Err(e)
            }
        }
    }

    fn merge_and_publish(&self, pending: &HashMap<Bin, u64>) -> Result<()> {
        let mut totals: HashMap<Bin, u64> = HashMap::new();
        if self.driver.status(&self.path)?.is_some() {
            let stream = self.driver.new_input_stream(&self.path)?;
            let mut reader = csv::Reader::from_reader(stream);
            for row in reader.deserialize() {
                let row: BinRow = row?;
                let bin = Bin {
                    topic: row.topic,
                    category: row.category,
                    time_bin: row.time_bin,
                };
                *totals.entry(bin).or_insert(0) += row.count;
            }
        }
        for (bin, count) in pending {
            *totals.entry(bin.clone()).or_insert(0) += count;
        }

        let mut rows: Vec<(&Bin, &u64)> = totals.iter().collect();
        rows.sort_by(|a, b| a.0.cmp(b.0));

        let temp = tempfile::Builder::new()
            .prefix("bins-")
            .suffix(".csv")
            .tempfile_in(self.staging.path())?;
        let mut writer = csv::Writer::from_writer(temp);
        for (bin, count) in rows {
            writer.serialize(BinRow {
                topic: bin.topic.clone(),
                category: bin.category.clone(),
                time_bin: bin.time_bin.clone(),
                count: *count,
            })?;
        }
        let mut temp = writer
            .into_inner()
            .map_err(|e| crate::RestructureError::StringError(e.to_string()))?;
        temp.flush()?;

        let staged = temp.into_temp_path();
        self.driver.store(&staged, &self.path)?;
        Ok(())
    }
}

/// Owns one topic's committed offsets and its share of the bin tally.
///
/// Writer threads call in while records flow, so all internal state
/// sits behind its own synchronization.
pub struct Accountant {
    store: OffsetStore,
    bins: Arc<BinFile>,
    staging: Mutex<Option<TempDir>>,
}

impl Accountant {
    /// Loads the topic's persisted offsets and opens the staging
    /// directory durable writes publish through.
    pub fn open(
        backend: Arc<dyn OffsetPersistence>,
        topic: &str,
        bins: Arc<BinFile>,
        tmp_root: &Path,
    ) -> Result<Self> {
        let staging = tempfile::Builder::new()
            .prefix(&format!("accountant-{topic}-"))
            .tempdir_in(tmp_root)?;
        let store = OffsetStore::open(backend, topic, staging.path());
        Ok(Self {
            store,
            bins,
            staging: Mutex::new(Some(staging)),
        })
    }

    /// Merges a staged ledger and requests a coalesced durable write.
    pub fn process(&self, ledger: Ledger) {
        if ledger.offsets.is_empty() && ledger.bins.is_empty() {
            return;
        }
        if !ledger.offsets.is_empty() {
            self.store.add_all(&ledger.offsets);
        }
        if !ledger.bins.is_empty() {
            self.bins.add(&ledger.bins);
        }
    }

    /// Commits a whole file's offset range after the file completed.
    pub fn commit(&self, tp: &TopicPartition, range: OffsetRange) {
        let mut set = OffsetRangeSet::new();
        set.add(tp, range);
        self.store.add_all(&set);
    }

    /// True iff the offset was committed by an earlier run or flush.
    pub fn contains_offset(&self, tp: &TopicPartition, offset: u64) -> bool {
        self.store.contains_offset(tp, offset)
    }

    /// True iff the whole range is already committed.
    pub fn contains(&self, tp: &TopicPartition, range: &OffsetRange) -> bool {
        self.store.contains(tp, range)
    }

    /// Forces a synchronous write of offsets and bins.
    pub fn flush(&self) -> Result<()> {
        self.store.flush()?;
        self.bins.flush()
    }

    /// Forces a final write and drops the private staging directory.
    pub fn close(&self) -> Result<()> {
        let result = self.store.close().and(self.bins.flush());
        if let Some(staging) = self.staging.lock().unwrap().take() {
            staging.close()?;
        }
        result
    }
}
