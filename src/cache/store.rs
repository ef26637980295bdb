use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use apache_avro::types::Value;
use log::warn;
use tempfile::TempDir;

use super::writer::FileCache;
use super::SinkSpec;
use crate::accountant::{Accountant, Bin, Transaction};
use crate::{RestructureError, Result};

/// Outcome of a pooled write: whether the target's cache already
/// existed, and whether the row was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResponse {
    /// Cache hit, row written.
    CacheAndWrite,
    /// Cache hit, row refused by the pinned schema.
    CacheAndNoWrite,
    /// Cache freshly opened, row written.
    NoCacheAndWrite,
    /// Cache freshly opened (or dropped on error), row not written.
    NoCacheAndNoWrite,
}

impl WriteResponse {
    fn of(cache_hit: bool, success: bool) -> Self {
        match (cache_hit, success) {
            (true, true) => WriteResponse::CacheAndWrite,
            (true, false) => WriteResponse::CacheAndNoWrite,
            (false, true) => WriteResponse::NoCacheAndWrite,
            (false, false) => WriteResponse::NoCacheAndNoWrite,
        }
    }

    /// Whether the row was written.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            WriteResponse::CacheAndWrite | WriteResponse::NoCacheAndWrite
        )
    }

    /// Whether the target's cache was already open.
    pub fn is_cache_hit(&self) -> bool {
        matches!(
            self,
            WriteResponse::CacheAndWrite | WriteResponse::CacheAndNoWrite
        )
    }
}

/// Bounded pool of file caches keyed by target path.
///
/// When the pool reaches `max_files`, the least-recently-used half is
/// closed and published in one sweep. Bulk eviction amortizes publish
/// cost and avoids churn when many paths share similar last-use times.
pub struct FileCacheStore {
    spec: Arc<SinkSpec>,
    accountant: Arc<Accountant>,
    temp_dir: TempDir,
    caches: HashMap<PathBuf, FileCache>,
    max_files: usize,
}

impl FileCacheStore {
    /// Creates a pool with its own scratch directory under `tmp_root`.
    pub fn new(
        spec: Arc<SinkSpec>,
        accountant: Arc<Accountant>,
        tmp_root: &Path,
        max_files: usize,
    ) -> Result<Self> {
        let temp_dir = tempfile::Builder::new()
            .prefix("worker-")
            .tempdir_in(tmp_root)?;
        Ok(Self {
            spec,
            accountant,
            temp_dir,
            caches: HashMap::new(),
            max_files: max_files.max(1),
        })
    }

    /// The pool's scratch directory.
    pub fn scratch(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes one record to the cache of `path`, opening it on a miss.
    ///
    /// A write exception marks the cache errored, drops it from the
    /// pool (deleting its temp without publishing) and reports
    /// [`WriteResponse::NoCacheAndNoWrite`].
    pub fn write_record(
        &mut self,
        path: &Path,
        bin: &Bin,
        record: &Value,
        transaction: &Transaction,
    ) -> Result<WriteResponse> {
        let cache_hit = self.caches.contains_key(path);
        if !cache_hit {
            self.ensure_capacity()?;
            let cache = FileCache::open(
                self.spec.clone(),
                self.accountant.clone(),
                path.to_path_buf(),
                self.temp_dir.path(),
            )?;
            self.caches.insert(path.to_path_buf(), cache);
        }

        let cache = self.caches.get_mut(path).expect("cache just ensured");
        match cache.write_record(transaction, bin, record) {
            Ok(success) => Ok(WriteResponse::of(cache_hit, success)),
            Err(e) => {
                warn!("dropping errored cache for {}: {e}", path.display());
                if let Some(mut cache) = self.caches.remove(path) {
                    cache.mark_errored();
                    let _ = cache.close();
                }
                Ok(WriteResponse::NoCacheAndNoWrite)
            }
        }
    }

    /// Closes the least-recently-used half of a full pool.
    fn ensure_capacity(&mut self) -> Result<()> {
        if self.caches.len() < self.max_files {
            return Ok(());
        }

        let mut entries: Vec<(PathBuf, FileCache)> = self.caches.drain().collect();
        entries.sort_by(|a, b| a.1.cmp(&b.1));
        let evict = (self.max_files + 1) / 2;
        let kept = entries.split_off(evict);
        self.caches.extend(kept);

        let mut errors = Vec::new();
        for (path, cache) in entries {
            if let Err(e) = cache.close() {
                warn!("evicting cache for {} failed: {e}", path.display());
                errors.push(e);
            }
        }
        aggregate(errors, evict)
    }

    /// Flushes every cache; per-cache failures do not skip the rest.
    pub fn flush(&mut self) -> Result<()> {
        let total = self.caches.len();
        let mut errors = Vec::new();
        for cache in self.caches.values_mut() {
            if let Err(e) = cache.flush() {
                errors.push(e);
            }
        }
        aggregate(errors, total)
    }

    /// Closes and publishes every cache, then removes the scratch
    /// directory. Per-cache failures aggregate into one error.
    pub fn close(mut self) -> Result<()> {
        let total = self.caches.len();
        let mut errors = Vec::new();
        for (path, cache) in self.caches.drain() {
            if let Err(e) = cache.close() {
                warn!("closing cache for {} failed: {e}", path.display());
                errors.push(e);
            }
        }
        let result = aggregate(errors, total);
        self.temp_dir.close()?;
        result
    }
}

fn aggregate(errors: Vec<RestructureError>, total: usize) -> Result<()> {
    match errors.first() {
        None => Ok(()),
        Some(first) => Err(RestructureError::CacheAggregate {
            failed: errors.len(),
            total,
            first: first.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accountant::BinFile;
    use crate::compression::{codec_registry, CompressionCodec};
    use crate::convert::converter_registry;
    use crate::dedup::DedupSettings;
    use crate::offsets::{FileOffsetPersistence, TopicPartition};
    use crate::storage::{LocalStorageDriver, StorageDriver};
    use std::fs;
    use std::io::Read;

    fn test_accountant(out: &Path, tmp: &Path) -> Arc<Accountant> {
        let driver: Arc<dyn StorageDriver> = Arc::new(LocalStorageDriver::new());
        let backend = Arc::new(FileOffsetPersistence::new(driver.clone(), out));
        let bins = Arc::new(BinFile::new(driver, out, tmp).unwrap());
        Arc::new(Accountant::open(backend, "t", bins, tmp).unwrap())
    }

    fn spec(codec: &str) -> Arc<SinkSpec> {
        Arc::new(SinkSpec {
            driver: Arc::new(LocalStorageDriver::new()),
            converter: converter_registry().get("csv").unwrap(),
            codec: codec_registry().get(codec).unwrap(),
            dedup: DedupSettings::default(),
        })
    }

    fn row(fields: &[(&str, &str)]) -> Value {
        Value::Record(
            fields
                .iter()
                .map(|(n, v)| (n.to_string(), Value::String(v.to_string())))
                .collect(),
        )
    }

    fn bin() -> Bin {
        Bin {
            topic: "t".into(),
            category: "c".into(),
            time_bin: "20170502_0700".into(),
        }
    }

    #[test]
    fn response_grid_with_eviction_and_schema_conflicts() {
        let out = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let accountant = test_accountant(out.path(), tmp.path());
        let mut store = FileCacheStore::new(spec("none"), accountant, tmp.path(), 2).unwrap();

        let f = |name: &str| out.path().join(name);
        let tp = TopicPartition::new("t", 0);
        let mut offset = 0;
        let mut tx = || {
            offset += 1;
            Transaction::new(tp.clone(), offset)
        };

        // Warm f1 through f4; the pool of two evicts as it goes.
        for value in ["something", "somethingElse", "third"] {
            let r = store
                .write_record(&f("f1.csv"), &bin(), &row(&[("a", value)]), &tx())
                .unwrap();
            assert!(r.is_success());
        }
        for value in ["something", "f2"] {
            store
                .write_record(&f("f2.csv"), &bin(), &row(&[("a", value)]), &tx())
                .unwrap();
        }
        for _ in 0..3 {
            store
                .write_record(&f("f3.csv"), &bin(), &row(&[("a", "f3")]), &tx())
                .unwrap();
        }
        store
            .write_record(&f("f4.csv"), &bin(), &row(&[("a", "f4")]), &tx())
            .unwrap();

        let extended = row(&[("a", "f1"), ("b", "conflict")]);

        // f3 is still pooled: hit, refused.
        assert_eq!(
            store
                .write_record(&f("f3.csv"), &bin(), &extended, &tx())
                .unwrap(),
            WriteResponse::CacheAndNoWrite
        );
        // f1 was evicted and published: fresh cache pins the header
        // from the file, still refuses.
        assert_eq!(
            store
                .write_record(&f("f1.csv"), &bin(), &extended, &tx())
                .unwrap(),
            WriteResponse::NoCacheAndNoWrite
        );
        // A fresh path accepts the extended shape.
        assert_eq!(
            store
                .write_record(&f("f5.csv"), &bin(), &extended, &tx())
                .unwrap(),
            WriteResponse::NoCacheAndWrite
        );

        store.close().unwrap();

        assert_eq!(
            fs::read_to_string(f("f1.csv")).unwrap(),
            "a\nsomething\nsomethingElse\nthird\n"
        );
        assert_eq!(fs::read_to_string(f("f3.csv")).unwrap(), "a\nf3\nf3\nf3\n");
        assert_eq!(fs::read_to_string(f("f5.csv")).unwrap(), "a,b\nf1,conflict\n");
    }

    #[test]
    fn gzip_reopen_concatenates_members() {
        let out = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let target = out.path().join("bin.csv.gz");
        let tp = TopicPartition::new("t", 0);

        for (offset, value) in ["first", "second"].iter().enumerate() {
            let accountant = test_accountant(out.path(), tmp.path());
            let mut store =
                FileCacheStore::new(spec("gzip"), accountant.clone(), tmp.path(), 4).unwrap();
            let r = store
                .write_record(
                    &target,
                    &bin(),
                    &row(&[("a", value)]),
                    &Transaction::new(tp.clone(), offset as u64),
                )
                .unwrap();
            assert!(r.is_success());
            store.close().unwrap();
            accountant.close().unwrap();
        }

        let codec = codec_registry().get("gzip").unwrap();
        let driver: Arc<dyn StorageDriver> = Arc::new(LocalStorageDriver::new());
        let mut decoded = String::new();
        codec
            .reader(driver.new_input_stream(&target).unwrap(), "bin.csv")
            .unwrap()
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "a\nfirst\nsecond\n");
    }

    #[test]
    fn write_exception_drops_cache_without_publishing() {
        let out = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let accountant = test_accountant(out.path(), tmp.path());
        let mut store =
            FileCacheStore::new(spec("none"), accountant.clone(), tmp.path(), 4).unwrap();
        let target = out.path().join("broken.csv");
        let tp = TopicPartition::new("t", 0);

        // A top-level scalar cannot be mapped, which surfaces as a
        // converter exception inside the cache.
        let response = store
            .write_record(
                &target,
                &bin(),
                &Value::Int(3),
                &Transaction::new(tp.clone(), 0),
            )
            .unwrap();
        assert_eq!(response, WriteResponse::NoCacheAndNoWrite);

        store.close().unwrap();
        assert!(
            !target.exists(),
            "errored cache must not publish a half-created target"
        );
        assert!(!accountant.contains_offset(&tp, 0));
    }

    #[test]
    fn successful_close_commits_staged_offsets() {
        let out = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let accountant = test_accountant(out.path(), tmp.path());
        let mut store =
            FileCacheStore::new(spec("none"), accountant.clone(), tmp.path(), 4).unwrap();
        let tp = TopicPartition::new("t", 0);

        store
            .write_record(
                &out.path().join("f.csv"),
                &bin(),
                &row(&[("a", "x")]),
                &Transaction::new(tp.clone(), 7),
            )
            .unwrap();
        assert!(
            !accountant.contains_offset(&tp, 7),
            "offsets stay staged until publish"
        );
        store.close().unwrap();
        assert!(accountant.contains_offset(&tp, 7));
        accountant.close().unwrap();
    }
}
