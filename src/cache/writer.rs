use std::cmp::Ordering;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use apache_avro::types::Value;
use tempfile::TempPath;

use super::SinkSpec;
use crate::accountant::{Accountant, Bin, Ledger, Transaction};
use crate::convert::RecordConverter;
use crate::dedup::deduplicate_target;
use crate::Result;

/// One open output writer for one target path.
///
/// Rows go to a temp file under the worker's scratch directory; the
/// target is only touched on close, when the temp publishes through
/// the driver's atomic store. An existing target's content is carried
/// over first so appends preserve it and the converter re-reads its
/// pinned header. Successful writes stage their offset and bin tick in
/// the cache's ledger, which commits to the accountant on flush and
/// after publish.
pub struct FileCache {
    spec: Arc<SinkSpec>,
    accountant: Arc<Accountant>,
    target: PathBuf,
    entry: String,
    temp: Option<TempPath>,
    converter: Option<Box<dyn RecordConverter>>,
    ledger: Ledger,
    last_use: Instant,
    errored: bool,
    scratch: PathBuf,
}

impl FileCache {
    /// Opens a cache for `target`, staging into `scratch`.
    pub fn open(
        spec: Arc<SinkSpec>,
        accountant: Arc<Accountant>,
        target: PathBuf,
        scratch: &Path,
    ) -> Result<Self> {
        let entry = spec.entry_name(&target);
        let exists = matches!(spec.driver.status(&target)?, Some(size) if size > 0);

        let header = if exists {
            let decompressed = spec
                .codec
                .reader(spec.driver.new_input_stream(&target)?, &entry)?;
            spec.converter.read_header(decompressed)?
        } else {
            None
        };

        let temp = tempfile::Builder::new()
            .prefix("cache-")
            .tempfile_in(scratch)?;
        let (file, temp_path) = temp.into_parts();

        let existing_raw = if exists {
            Some(spec.driver.new_input_stream(&target)?)
        } else {
            None
        };
        let sink = spec.codec.writer(file, existing_raw, &entry)?;
        let converter = spec.converter.converter(sink, header, !exists)?;

        Ok(Self {
            spec,
            accountant,
            target,
            entry,
            temp: Some(temp_path),
            converter: Some(converter),
            ledger: Ledger::default(),
            last_use: Instant::now(),
            errored: false,
            scratch: scratch.to_path_buf(),
        })
    }

    /// Writes one row. On success the transaction and bin tick are
    /// staged in the ledger; a refused or failed write stages nothing,
    /// and a failure additionally marks the cache errored.
    pub fn write_record(
        &mut self,
        transaction: &Transaction,
        bin: &Bin,
        record: &Value,
    ) -> Result<bool> {
        self.last_use = Instant::now();
        let converter = self
            .converter
            .as_mut()
            .expect("cache used after close");
        match converter.write_record(record) {
            Ok(true) => {
                self.ledger.add(transaction, bin.clone());
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) => {
                self.errored = true;
                Err(e)
            }
        }
    }

    /// Flushes buffered rows and commits the staged ledger.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(converter) = self.converter.as_mut() {
            if let Err(e) = converter.flush() {
                self.errored = true;
                return Err(e);
            }
        }
        self.accountant.process(mem::take(&mut self.ledger));
        Ok(())
    }

    /// Closes the writer and publishes the temp file to the target.
    ///
    /// An errored cache deletes its temp without touching the target;
    /// its staged ledger is discarded so the records re-process on the
    /// next run.
    pub fn close(mut self) -> Result<()> {
        let converter = self.converter.take();
        if self.errored {
            return Ok(());
        }
        if let Some(converter) = converter {
            converter.close()?;
        }

        let temp = self.temp.take().expect("cache closed twice");
        self.spec.driver.store(&temp, &self.target)?;

        if self.spec.dedup.enabled {
            deduplicate_target(
                &self.spec.driver,
                &self.spec.codec,
                &self.target,
                &self.entry,
                &self.spec.dedup,
                self.spec.is_tabular(),
                &self.scratch,
            )?;
        }

        // Offsets commit only after the data is safely published.
        self.accountant.process(mem::take(&mut self.ledger));
        Ok(())
    }

    /// When this cache last wrote a record.
    pub fn last_use(&self) -> Instant {
        self.last_use
    }

    /// The target path this cache writes.
    pub fn target(&self) -> &Path {
        &self.target
    }

    pub(crate) fn mark_errored(&mut self) {
        self.errored = true;
    }
}

impl PartialEq for FileCache {
    fn eq(&self, other: &Self) -> bool {
        self.last_use == other.last_use && self.target == other.target
    }
}

impl Eq for FileCache {}

impl PartialOrd for FileCache {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FileCache {
    fn cmp(&self, other: &Self) -> Ordering {
        self.last_use
            .cmp(&other.last_use)
            .then_with(|| self.target.cmp(&other.target))
    }
}
