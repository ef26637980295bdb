#![deny(missing_docs)]

//! Restructures stream-oriented container files into a tree of
//! per-project, per-user, time-binned output files.
//!
//! Source trees hold container files named
//! `topic+partition+offsetFrom+offsetTo.avro`. The engine discovers
//! topics, takes an advisory per-topic lock, streams each file's
//! records through a bounded pool of output writers and commits
//! processed offset ranges durably, so interrupted runs resume without
//! re-emitting records.

mod accountant;
mod cache;
mod compression;
mod config;
mod convert;
mod dedup;
mod engine;
mod error;
mod lock;
mod offsets;
mod paths;
mod pool;
mod registry;
mod source;
mod storage;
mod timer;
mod worker;

pub use accountant::{Accountant, Bin, BinFile, Ledger, Transaction};
pub use cache::{FileCache, FileCacheStore, SinkSpec, WriteResponse};
pub use compression::{codec_registry, CompressionCodec, GzipCodec, IdentityCodec, RowSink, ZipCodec};
pub use config::{
    Config, ConfigOverlay, PathsOverlay, RedisOverlay, RedisSettings, ServiceOverlay,
    StorageOverlay, TopicSettings, WorkerOverlay,
};
pub use convert::{
    converter_registry, ConverterFactory, CsvConverterFactory, JsonConverterFactory,
    RecordConverter,
};
pub use dedup::DedupSettings;
pub use engine::{ProcessSummary, Registries, Restructurer};
pub use error::{RestructureError, Result};
pub use lock::{FileLockManager, LockManager, RedisLockManager, TopicLock};
pub use offsets::{
    FileOffsetPersistence, OffsetPersistence, OffsetRange, OffsetRangeSet, OffsetStore,
    RedisOffsetPersistence, TopicPartition,
};
pub use paths::{RecordOrganization, RecordPathFactory, TimeBinFormat};
pub use pool::{SharedQueueThreadPool, ThreadPool, WorkStealingThreadPool};
pub use registry::Registry;
pub use source::{SourceScanner, TopicFile, TopicFileList};
pub use storage::{
    driver_registry, FileStatus, LocalStorageDriver, StorageDriver, StorageDriverFactory,
};
pub use timer::{TimeScope, TimeTracker};
pub use worker::RestructureWorker;
