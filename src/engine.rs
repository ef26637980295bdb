//! The orchestrator: discovers topics and schedules per-topic workers.
//!
//! Topics are shuffled and dispatched onto a work-stealing pool; each
//! job takes the topic's advisory lock, builds an accountant from the
//! durable offset store and runs one worker to exhaustion. Workers
//! share nothing mutable: only the offset store and the lock backend
//! cross thread or process boundaries.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::sync::WaitGroup;
use log::{debug, error, info};
use rand::seq::SliceRandom;

use crate::accountant::{Accountant, BinFile};
use crate::cache::{FileCacheStore, SinkSpec};
use crate::compression::{codec_registry, CompressionCodec};
use crate::config::Config;
use crate::convert::{converter_registry, ConverterFactory};
use crate::lock::{FileLockManager, LockManager, RedisLockManager};
use crate::offsets::{FileOffsetPersistence, OffsetPersistence, RedisOffsetPersistence};
use crate::paths::RecordPathFactory;
use crate::pool::{ThreadPool, WorkStealingThreadPool};
use crate::registry::Registry;
use crate::source::SourceScanner;
use crate::storage::{driver_registry, StorageDriver, StorageDriverFactory};
use crate::timer::TimeTracker;
use crate::worker::RestructureWorker;
use crate::Result;

/// The pluggable-backend registries configuration resolves against.
/// Custom backends register here before the engine is built.
pub struct Registries {
    /// Row format factories.
    pub converters: Registry<dyn ConverterFactory>,
    /// Compression codecs.
    pub codecs: Registry<dyn CompressionCodec>,
    /// Storage driver factories.
    pub drivers: Registry<dyn StorageDriverFactory>,
}

impl Default for Registries {
    fn default() -> Self {
        Self {
            converters: converter_registry(),
            codecs: codec_registry(),
            drivers: driver_registry(),
        }
    }
}

/// Totals of one engine pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessSummary {
    /// Topics scheduled this pass (after exclusion).
    pub topics: u64,
    /// Source files fully processed.
    pub files: u64,
    /// Records written.
    pub records: u64,
    /// Topics that failed with an error.
    pub failed_topics: u64,
}

struct TopicContext {
    config: Config,
    source: Arc<dyn StorageDriver>,
    target: Arc<dyn StorageDriver>,
    offsets: Arc<dyn OffsetPersistence>,
    locks: Arc<dyn LockManager>,
    converter: Arc<dyn ConverterFactory>,
    codec: Arc<dyn CompressionCodec>,
    bins: Arc<BinFile>,
    tmp_root: PathBuf,
    tracker: Arc<TimeTracker>,
    closed: Arc<AtomicBool>,
    files_total: AtomicU64,
    records_total: AtomicU64,
    failed_total: AtomicU64,
}

/// Restructures every discovered topic of the configured sources.
pub struct Restructurer {
    ctx: Arc<TopicContext>,
}

impl Restructurer {
    /// Builds an engine from a validated configuration, resolving all
    /// pluggable backends by name.
    pub fn new(config: Config, registries: &Registries) -> Result<Self> {
        config.validate()?;

        let source = registries
            .drivers
            .get(&config.source_type)?
            .create(&config.source_properties)?;
        let target = registries
            .drivers
            .get(&config.target_type)?
            .create(&config.target_properties)?;
        let converter = registries.converters.get(&config.format)?;
        let codec = registries.codecs.get(&config.compression)?;

        let tmp_root = config
            .tmp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        fs::create_dir_all(&tmp_root)?;
        target.create_directories(&config.output)?;

        let offsets: Arc<dyn OffsetPersistence> = match &config.redis {
            Some(redis) if redis.offsets => Arc::new(RedisOffsetPersistence::new(
                &redis.url,
                redis.prefix.clone(),
            )?),
            _ => Arc::new(FileOffsetPersistence::new(target.clone(), &config.output)),
        };

        // Processes that share a target tree must share a lock space;
        // the output itself is the default rendezvous.
        let locks: Arc<dyn LockManager> = if let Some(dir) = &config.lock_directory {
            Arc::new(FileLockManager::new(dir))
        } else if let Some(redis) = &config.redis {
            Arc::new(RedisLockManager::new(&redis.url, redis.prefix.clone())?)
        } else {
            Arc::new(FileLockManager::new(config.output.join(".locks")))
        };

        let bins = Arc::new(BinFile::new(target.clone(), &config.output, &tmp_root)?);
        let tracker = Arc::new(TimeTracker::new(config.timer));

        Ok(Self {
            ctx: Arc::new(TopicContext {
                config,
                source,
                target,
                offsets,
                locks,
                converter,
                codec,
                bins,
                tmp_root,
                tracker,
                closed: Arc::new(AtomicBool::new(false)),
                files_total: AtomicU64::new(0),
                records_total: AtomicU64::new(0),
                failed_total: AtomicU64::new(0),
            }),
        })
    }

    /// Requests a cooperative shutdown: workers stop taking new files.
    pub fn shutdown(&self) {
        self.ctx.closed.store(true, Ordering::Relaxed);
    }

    /// Whether a shutdown was requested.
    pub fn is_closed(&self) -> bool {
        self.ctx.closed.load(Ordering::Relaxed)
    }

    /// Runs one pass over all configured input roots on the default
    /// work-stealing pool.
    pub fn process(&self) -> Result<ProcessSummary> {
        self.process_with_pool::<WorkStealingThreadPool>()
    }

    /// Runs one pass, dispatching topics on the given pool kind.
    pub fn process_with_pool<P: ThreadPool>(&self) -> Result<ProcessSummary> {
        let ctx = &self.ctx;
        ctx.files_total.store(0, Ordering::Relaxed);
        ctx.records_total.store(0, Ordering::Relaxed);
        ctx.failed_total.store(0, Ordering::Relaxed);

        let scanner = SourceScanner::new(ctx.source.clone());
        let mut discovered: HashSet<PathBuf> = HashSet::new();
        for root in &ctx.config.inputs {
            discovered.extend(scanner.find_topic_paths(root)?);
        }

        let excluded = ctx.config.excluded();
        let mut topic_dirs: Vec<PathBuf> = discovered
            .into_iter()
            .filter(|dir| {
                dir.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|topic| !excluded.contains(topic))
            })
            .collect();
        topic_dirs.sort_unstable();
        topic_dirs.shuffle(&mut rand::thread_rng());

        let topics = topic_dirs.len() as u64;
        let pool = P::new(ctx.config.num_threads.max(1))?;
        let wg = WaitGroup::new();
        for dir in topic_dirs {
            let ctx = Arc::clone(&self.ctx);
            let wg = wg.clone();
            pool.spawn(move || {
                if !ctx.closed.load(Ordering::Relaxed) {
                    match process_topic(&ctx, &dir) {
                        Ok(Some((files, records))) => {
                            ctx.files_total.fetch_add(files, Ordering::Relaxed);
                            ctx.records_total.fetch_add(records, Ordering::Relaxed);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!("topic at {} failed: {e}", dir.display());
                            ctx.failed_total.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                drop(wg);
            });
        }
        wg.wait();

        if ctx.tracker.is_enabled() {
            for line in ctx.tracker.report() {
                info!("timing {line}");
            }
        }

        Ok(ProcessSummary {
            topics,
            files: ctx.files_total.load(Ordering::Relaxed),
            records: ctx.records_total.load(Ordering::Relaxed),
            failed_topics: ctx.failed_total.load(Ordering::Relaxed),
        })
    }
}

fn process_topic(ctx: &TopicContext, dir: &Path) -> Result<Option<(u64, u64)>> {
    let Some(topic) = dir
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
    else {
        return Ok(None);
    };

    let Some(_lock) = ctx.locks.acquire_topic_lock(&topic) else {
        debug!("topic {topic}: held by another process, skipping");
        return Ok(None);
    };
    let _scope = ctx.tracker.scope("topic.process");

    let accountant = Arc::new(Accountant::open(
        ctx.offsets.clone(),
        &topic,
        ctx.bins.clone(),
        &ctx.tmp_root,
    )?);

    let scanner = SourceScanner::new(ctx.source.clone());
    let files = {
        let accountant = accountant.clone();
        scanner.list_topic_files(
            dir,
            move |file| accountant.contains(&file.partition, &file.range),
            ctx.config.max_files_per_topic,
        )?
    };
    if files.is_empty() {
        accountant.close()?;
        return Ok(Some((0, 0)));
    }
    info!(
        "topic {topic}: {} files covering {} offsets",
        files.len(),
        files.size()
    );

    let spec = Arc::new(SinkSpec {
        driver: ctx.target.clone(),
        converter: ctx.converter.clone(),
        codec: ctx.codec.clone(),
        dedup: ctx.config.dedup_for(&topic),
    });
    let cache_store = FileCacheStore::new(
        spec.clone(),
        accountant.clone(),
        &ctx.tmp_root,
        ctx.config.cache_size,
    )?;
    let factory = RecordPathFactory::new(
        ctx.config.output.clone(),
        ctx.config.time_bin,
        spec.extension(),
    );
    let mut worker = RestructureWorker::new(
        topic.clone(),
        ctx.source.clone(),
        ctx.target.clone(),
        accountant.clone(),
        cache_store,
        factory,
        ctx.tracker.clone(),
        ctx.closed.clone(),
    );

    let outcome = worker.process(files);
    let closed_worker = worker.close();
    let closed_accountant = accountant.close();
    let (files_done, records) = outcome?;
    closed_worker?;
    closed_accountant?;

    info!("topic {topic}: processed {files_done} files, {records} records");
    Ok(Some((files_done, records)))
}
