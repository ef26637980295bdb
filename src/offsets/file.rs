use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::range_set::{OffsetRange, OffsetRangeSet, TopicPartition};
use super::store::OffsetPersistence;
use crate::storage::StorageDriver;
use crate::Result;

/// One row of `<output>/offsets/<topic>.csv`.
#[derive(Debug, Serialize, Deserialize)]
struct OffsetRow {
    #[serde(rename = "offsetFrom")]
    offset_from: u64,
    #[serde(rename = "offsetTo")]
    offset_to: u64,
    topic: String,
    partition: u32,
}

/// File-per-topic offset backend under `<output>/offsets/`.
///
/// Reads canonicalize through the range set, so legacy files holding
/// overlapping or adjacent ranges self-heal on load. Writes stage a
/// full CSV in the caller's scratch directory and publish it through
/// the target driver's atomic store.
pub struct FileOffsetPersistence {
    driver: Arc<dyn StorageDriver>,
    root: PathBuf,
}

impl FileOffsetPersistence {
    /// Creates a backend rooted at the output directory.
    pub fn new(driver: Arc<dyn StorageDriver>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            driver,
            root: output_root.into(),
        }
    }

    fn topic_path(&self, topic: &str) -> PathBuf {
        self.root.join("offsets").join(format!("{topic}.csv"))
    }

    /// Rewrites a topic's file in canonical form, dropping redundant
    /// rows left behind by older versions.
    pub fn compact(&self, topic: &str, staging: &Path) -> Result<()> {
        let set = self.read(topic)?;
        if set.is_empty() {
            return Ok(());
        }
        self.write(topic, &set, staging)
    }
}

impl OffsetPersistence for FileOffsetPersistence {
    fn read(&self, topic: &str) -> Result<OffsetRangeSet> {
        let path = self.topic_path(topic);
        let mut set = OffsetRangeSet::new();
        if self.driver.status(&path)?.is_none() {
            return Ok(set);
        }

        let stream = self.driver.new_input_stream(&path)?;
        let mut reader = csv::Reader::from_reader(stream);
        for row in reader.deserialize() {
            let row: OffsetRow = row?;
            let tp = TopicPartition::new(row.topic, row.partition);
            set.add(&tp, OffsetRange::new(row.offset_from, row.offset_to)?);
        }
        Ok(set)
    }

    fn write(&self, topic: &str, set: &OffsetRangeSet, staging: &Path) -> Result<()> {
        let temp = tempfile::Builder::new()
            .prefix("offsets-")
            .suffix(".csv")
            .tempfile_in(staging)?;

        let mut rows: Vec<OffsetRow> = set
            .ranges()
            .map(|(tp, r)| OffsetRow {
                offset_from: r.from,
                offset_to: r.to,
                topic: tp.topic.clone(),
                partition: tp.partition,
            })
            .collect();
        rows.sort_by(|a, b| {
            (&a.topic, a.partition, a.offset_from).cmp(&(&b.topic, b.partition, b.offset_from))
        });

        let mut writer = csv::Writer::from_writer(temp);
        for row in &rows {
            writer.serialize(row)?;
        }
        let mut temp = writer
            .into_inner()
            .map_err(|e| crate::RestructureError::StringError(e.to_string()))?;
        temp.flush()?;

        let staged = temp.into_temp_path();
        self.driver.store(&staged, &self.topic_path(topic))?;
        Ok(())
    }
}
