//! Per-topic restructuring pipeline.
//!
//! One worker owns one topic for the duration of a run: it streams the
//! topic's container files in largest-first order, skips offsets the
//! accountant already committed, routes each record through the path
//! factory into the cache store, and commits each file's offset range
//! once the file completes. Nothing here is shared with other workers.

use std::collections::HashSet;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use apache_avro::types::Value;
use apache_avro::Reader;
use log::{debug, error, warn};
use rand::Rng;

use crate::accountant::{Accountant, Bin, Transaction};
use crate::cache::FileCacheStore;
use crate::convert::record_field;
use crate::paths::RecordPathFactory;
use crate::source::{TopicFile, TopicFileList};
use crate::storage::StorageDriver;
use crate::timer::TimeTracker;
use crate::{RestructureError, Result};

/// Offsets between cache flushes; each worker jitters this by ±25 % so
/// concurrent workers do not flush in lockstep.
const FLUSH_OFFSET_INTERVAL: u64 = 500_000;

/// Bound on schema-conflict sidecar attempts for a single record.
const MAX_WRITE_ATTEMPTS: u32 = 100;

/// Restructures the container files of one topic.
pub struct RestructureWorker {
    topic: String,
    source: Arc<dyn StorageDriver>,
    target: Arc<dyn StorageDriver>,
    accountant: Arc<Accountant>,
    cache_store: FileCacheStore,
    path_factory: RecordPathFactory,
    tracker: Arc<TimeTracker>,
    closed: Arc<AtomicBool>,
    flush_threshold: u64,
    accumulated: u64,
    schema_dirs: HashSet<PathBuf>,
    processed_files: u64,
    processed_records: u64,
}

impl RestructureWorker {
    /// Creates a worker; the flush threshold is jittered per worker.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        topic: String,
        source: Arc<dyn StorageDriver>,
        target: Arc<dyn StorageDriver>,
        accountant: Arc<Accountant>,
        cache_store: FileCacheStore,
        path_factory: RecordPathFactory,
        tracker: Arc<TimeTracker>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        Self {
            topic,
            source,
            target,
            accountant,
            cache_store,
            path_factory,
            tracker,
            closed,
            flush_threshold: (FLUSH_OFFSET_INTERVAL as f64 * jitter) as u64,
            accumulated: 0,
            schema_dirs: HashSet::new(),
            processed_files: 0,
            processed_records: 0,
        }
    }

    /// Processes the topic's files largest-first. A file that cannot
    /// be read or mapped is skipped with a log line and the run
    /// continues; shutdown is observed between files, never inside
    /// one, so a completed file's range always commits.
    pub fn process(&mut self, mut files: TopicFileList) -> Result<(u64, u64)> {
        files.sort_largest_first();
        for file in files.iter() {
            if self.closed.load(Ordering::Relaxed) {
                debug!("topic {}: shutting down between files", self.topic);
                break;
            }
            match self.process_file(file) {
                Ok(()) => self.processed_files += 1,
                Err(e) => error!("skipping source file {}: {e}", file.path.display()),
            }
        }
        Ok((self.processed_files, self.processed_records))
    }

    /// Publishes all open caches and removes the scratch directory.
    pub fn close(self) -> Result<()> {
        self.cache_store.close()
    }

    fn process_file(&mut self, file: &TopicFile) -> Result<()> {
        if let Some(0) = self.source.status(&file.path)? {
            warn!("skipping zero-length source file {}", file.path.display());
            return Ok(());
        }
        let tracker = self.tracker.clone();
        let _scope = tracker.scope("worker.file");

        let stream = self.source.new_input_stream(&file.path)?;
        let reader = Reader::new(BufReader::new(stream))?;
        let schema = reader.writer_schema().canonical_form();

        let mut offset = file.range.from;
        for datum in reader {
            let record = datum?;
            if !self.accountant.contains_offset(&file.partition, offset) {
                self.write_record(file, offset, &record, &schema)?;
                self.processed_records += 1;
            }
            offset += 1;
            self.accumulated += 1;
            if self.accumulated >= self.flush_threshold {
                self.cache_store.flush()?;
                self.accountant.flush()?;
                self.accumulated = 0;
            }
        }

        // Committing the whole range keeps a crash from ever
        // re-emitting this file's records.
        self.accountant.commit(&file.partition, file.range);
        Ok(())
    }

    /// Routes one record, spilling to `_<attempt>` sidecar paths until
    /// a compatible target accepts it.
    fn write_record(
        &mut self,
        file: &TopicFile,
        offset: u64,
        record: &Value,
        schema: &str,
    ) -> Result<()> {
        let null = Value::Null;
        let key = record_field(record, "key").unwrap_or(&null);
        let value = record_field(record, "value").ok_or_else(|| {
            RestructureError::RecordMapping(format!(
                "record at offset {offset} of {} has no value field",
                file.path.display()
            ))
        })?;

        let transaction = Transaction::new(file.partition.clone(), offset);
        for attempt in 0..MAX_WRITE_ATTEMPTS {
            let org = self.path_factory.organize(&file.topic, key, value, attempt);
            let bin = Bin {
                topic: file.topic.clone(),
                category: org.category.clone(),
                time_bin: self.path_factory.time_bin(org.time),
            };
            let response = self
                .cache_store
                .write_record(&org.path, &bin, record, &transaction)?;
            if response.is_success() {
                self.ensure_schema(&org.path, schema)?;
                return Ok(());
            }
        }

        error!(
            "topic {}: no compatible target for offset {offset} after {MAX_WRITE_ATTEMPTS} attempts",
            self.topic
        );
        Ok(())
    }

    /// Emits `schema.json` beside the target on the first successful
    /// write into its directory; an existing file is left alone.
    fn ensure_schema(&mut self, target: &Path, schema: &str) -> Result<()> {
        let Some(dir) = target.parent() else {
            return Ok(());
        };
        if self.schema_dirs.contains(dir) {
            return Ok(());
        }

        let schema_path = dir.join("schema.json");
        if self.target.status(&schema_path)?.is_none() {
            let temp = tempfile::Builder::new()
                .prefix("schema-")
                .suffix(".json")
                .tempfile_in(self.cache_store.scratch())?;
            let (mut file, staged) = temp.into_parts();
            file.write_all(schema.as_bytes())?;
            file.write_all(b"\n")?;
            file.flush()?;
            drop(file);
            self.target.store(&staged, &schema_path)?;
        }
        self.schema_dirs.insert(dir.to_path_buf());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accountant::BinFile;
    use crate::cache::SinkSpec;
    use crate::compression::codec_registry;
    use crate::convert::converter_registry;
    use crate::dedup::DedupSettings;
    use crate::offsets::FileOffsetPersistence;
    use crate::paths::TimeBinFormat;
    use crate::storage::LocalStorageDriver;
    use std::fs;

    fn worker_for(out: &Path, tmp: &Path) -> (RestructureWorker, Arc<Accountant>) {
        let driver: Arc<dyn StorageDriver> = Arc::new(LocalStorageDriver::new());
        let backend = Arc::new(FileOffsetPersistence::new(driver.clone(), out));
        let bins = Arc::new(BinFile::new(driver.clone(), out, tmp).unwrap());
        let accountant = Arc::new(Accountant::open(backend, "t", bins, tmp).unwrap());
        let spec = Arc::new(SinkSpec {
            driver: driver.clone(),
            converter: converter_registry().get("csv").unwrap(),
            codec: codec_registry().get("none").unwrap(),
            dedup: DedupSettings::default(),
        });
        let cache_store = FileCacheStore::new(spec, accountant.clone(), tmp, 8).unwrap();
        let worker = RestructureWorker::new(
            "t".into(),
            driver.clone(),
            driver,
            accountant.clone(),
            cache_store,
            RecordPathFactory::new(out, TimeBinFormat::Hourly, ".csv".into()),
            Arc::new(TimeTracker::new(false)),
            Arc::new(AtomicBool::new(false)),
        );
        (worker, accountant)
    }

    #[test]
    fn zero_length_files_are_skipped_without_commit() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let path = src.path().join("t+0+0+4.avro");
        fs::write(&path, b"").unwrap();

        let (mut worker, accountant) = worker_for(out.path(), tmp.path());
        let files = TopicFileList::new(vec![TopicFile::parse(&path).unwrap()]);
        let (files_done, records) = worker.process(files).unwrap();
        worker.close().unwrap();

        assert_eq!((files_done, records), (1, 0));
        assert!(!accountant.contains_offset(&crate::offsets::TopicPartition::new("t", 0), 0));
        accountant.close().unwrap();
    }

    #[test]
    fn unreadable_container_is_skipped_and_counted_as_failure() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let path = src.path().join("t+0+0+4.avro");
        fs::write(&path, b"this is not a container file").unwrap();

        let (mut worker, accountant) = worker_for(out.path(), tmp.path());
        let files = TopicFileList::new(vec![TopicFile::parse(&path).unwrap()]);
        let (files_done, records) = worker.process(files).unwrap();
        worker.close().unwrap();
        accountant.close().unwrap();

        assert_eq!((files_done, records), (0, 0));
    }
}
