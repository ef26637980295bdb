//! Runtime configuration.
//!
//! The command line produces a fully-defaulted [`Config`]; a YAML
//! configuration file, when given, overlays it and wins for every
//! value it sets. Per-topic blocks add exclusion and dedup overrides.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::dedup::DedupSettings;
use crate::paths::TimeBinFormat;
use crate::{RestructureError, Result};

/// Resolved engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Source paths scanned for topic directories.
    pub inputs: Vec<PathBuf>,
    /// Root of the output tree.
    pub output: PathBuf,
    /// Row format name (`csv`, `json`).
    pub format: String,
    /// Compression name (`none`, `gzip`, `zip`).
    pub compression: String,
    /// Default dedup switch, overridable per topic.
    pub deduplicate: bool,
    /// Worker threads for per-topic processing.
    pub num_threads: u32,
    /// Bound on simultaneously open output writers per worker.
    pub cache_size: usize,
    /// Per-topic bound on files per run; `None` is unbounded.
    pub max_files_per_topic: Option<usize>,
    /// Topics never processed.
    pub excluded_topics: HashSet<String>,
    /// Run repeatedly at a fixed cadence.
    pub service: bool,
    /// Cadence of service mode in seconds.
    pub interval_secs: u64,
    /// Root for scratch directories; system default when unset.
    pub tmp_dir: Option<PathBuf>,
    /// Directory for file-based topic locks.
    pub lock_directory: Option<PathBuf>,
    /// Time bin granularity of output files.
    pub time_bin: TimeBinFormat,
    /// Collect and report per-category timings.
    pub timer: bool,
    /// Source storage driver name.
    pub source_type: String,
    /// Driver-specific source properties (e.g. `nameservice`).
    pub source_properties: HashMap<String, String>,
    /// Target storage driver name.
    pub target_type: String,
    /// Driver-specific target properties.
    pub target_properties: HashMap<String, String>,
    /// Redis backend for locks and, optionally, offsets.
    pub redis: Option<RedisSettings>,
    /// Per-topic overrides.
    pub topics: HashMap<String, TopicSettings>,
}

/// Redis connection block.
#[derive(Debug, Clone)]
pub struct RedisSettings {
    /// Connection URL, e.g. `redis://localhost:6379`.
    pub url: String,
    /// Key prefix for locks and offsets.
    pub prefix: String,
    /// Store offsets in redis instead of per-topic files.
    pub offsets: bool,
}

/// Per-topic configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TopicSettings {
    /// Skip this topic entirely.
    pub exclude: bool,
    /// Override of the global dedup switch.
    pub deduplicate: Option<bool>,
    /// Column subset forming the dedup identity.
    pub deduplicate_fields: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            output: PathBuf::new(),
            format: "csv".into(),
            compression: "none".into(),
            deduplicate: false,
            num_threads: 1,
            cache_size: 100,
            max_files_per_topic: None,
            excluded_topics: HashSet::new(),
            service: false,
            interval_secs: 3600,
            tmp_dir: None,
            lock_directory: None,
            time_bin: TimeBinFormat::Hourly,
            timer: false,
            source_type: "local".into(),
            source_properties: HashMap::new(),
            target_type: "local".into(),
            target_properties: HashMap::new(),
            redis: None,
            topics: HashMap::new(),
        }
    }
}

impl Config {
    /// Loads a YAML overlay file.
    pub fn load_overlay(path: &Path) -> Result<ConfigOverlay> {
        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }

    /// Applies an overlay; its values override the current ones.
    pub fn apply_overlay(&mut self, overlay: ConfigOverlay) -> Result<()> {
        if let Some(service) = overlay.service {
            if let Some(enable) = service.enable {
                self.service = enable;
            }
            if let Some(interval) = service.interval {
                self.interval_secs = interval;
            }
        }
        if let Some(compression) = overlay.compression {
            self.compression = compression;
        }
        if let Some(format) = overlay.format {
            self.format = format;
        }
        if let Some(worker) = overlay.worker {
            if let Some(threads) = worker.num_threads {
                self.num_threads = threads;
            }
            if let Some(cache_size) = worker.cache_size {
                self.cache_size = cache_size;
            }
            if let Some(max_files) = worker.max_files_per_topic {
                self.max_files_per_topic = (max_files > 0).then_some(max_files);
            }
            if let Some(timer) = worker.enable_timer {
                self.timer = timer;
            }
            if let Some(deduplicate) = worker.deduplicate {
                self.deduplicate = deduplicate;
            }
        }
        if let Some(paths) = overlay.paths {
            if let Some(inputs) = paths.inputs {
                self.inputs = inputs;
            }
            if let Some(output) = paths.output {
                self.output = output;
            }
            if let Some(tmp) = paths.tmp {
                self.tmp_dir = Some(tmp);
            }
            if let Some(lock) = paths.lock {
                self.lock_directory = Some(lock);
            }
            if let Some(time_bin) = paths.time_bin {
                self.time_bin = time_bin.parse()?;
            }
        }
        if let Some(topics) = overlay.topics {
            self.topics.extend(topics);
        }
        if let Some(source) = overlay.source {
            if let Some(kind) = source.kind {
                self.source_type = kind;
            }
            self.source_properties.extend(source.properties);
        }
        if let Some(target) = overlay.target {
            if let Some(kind) = target.kind {
                self.target_type = kind;
            }
            self.target_properties.extend(target.properties);
        }
        if let Some(redis) = overlay.redis {
            let current = self.redis.take().unwrap_or(RedisSettings {
                url: String::new(),
                prefix: "restructure".into(),
                offsets: false,
            });
            self.redis = Some(RedisSettings {
                url: redis.url.unwrap_or(current.url),
                prefix: redis.prefix.unwrap_or(current.prefix),
                offsets: redis.offsets.unwrap_or(current.offsets),
            });
        }
        Ok(())
    }

    /// Checks the configuration is runnable.
    pub fn validate(&self) -> Result<()> {
        if self.inputs.is_empty() {
            return Err(RestructureError::Config("no input paths given".into()));
        }
        if self.output.as_os_str().is_empty() {
            return Err(RestructureError::Config(
                "no output directory given".into(),
            ));
        }
        if self.num_threads == 0 {
            return Err(RestructureError::Config(
                "number of threads must be positive".into(),
            ));
        }
        if self.cache_size == 0 {
            return Err(RestructureError::Config(
                "cache size must be positive".into(),
            ));
        }
        if let Some(redis) = &self.redis {
            if redis.url.is_empty() {
                return Err(RestructureError::Config("redis block has no url".into()));
            }
        }
        Ok(())
    }

    /// All excluded topics: the exclusion set plus per-topic flags.
    pub fn excluded(&self) -> HashSet<String> {
        let mut excluded = self.excluded_topics.clone();
        for (topic, settings) in &self.topics {
            if settings.exclude {
                excluded.insert(topic.clone());
            }
        }
        excluded
    }

    /// Resolved dedup policy for one topic.
    pub fn dedup_for(&self, topic: &str) -> DedupSettings {
        let settings = self.topics.get(topic);
        DedupSettings {
            enabled: settings
                .and_then(|s| s.deduplicate)
                .unwrap_or(self.deduplicate),
            fields: settings
                .map(|s| s.deduplicate_fields.clone())
                .unwrap_or_default(),
        }
    }
}

/// A partial configuration parsed from YAML; every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigOverlay {
    /// `service` section.
    pub service: Option<ServiceOverlay>,
    /// Top-level compression name.
    pub compression: Option<String>,
    /// Top-level row format name.
    pub format: Option<String>,
    /// `worker` section.
    pub worker: Option<WorkerOverlay>,
    /// `paths` section.
    pub paths: Option<PathsOverlay>,
    /// `topics` section.
    pub topics: Option<HashMap<String, TopicSettings>>,
    /// `source` section.
    pub source: Option<StorageOverlay>,
    /// `target` section.
    pub target: Option<StorageOverlay>,
    /// `redis` section.
    pub redis: Option<RedisOverlay>,
}

/// `service` overlay block.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceOverlay {
    /// Enable service mode.
    pub enable: Option<bool>,
    /// Cadence in seconds.
    pub interval: Option<u64>,
}

/// `worker` overlay block.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerOverlay {
    /// Worker thread count.
    pub num_threads: Option<u32>,
    /// Open-writer bound.
    pub cache_size: Option<usize>,
    /// Per-topic file cap; 0 is unbounded.
    pub max_files_per_topic: Option<usize>,
    /// Collect timings.
    pub enable_timer: Option<bool>,
    /// Default dedup switch.
    pub deduplicate: Option<bool>,
}

/// `paths` overlay block.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PathsOverlay {
    /// Source paths.
    pub inputs: Option<Vec<PathBuf>>,
    /// Output root.
    pub output: Option<PathBuf>,
    /// Scratch root.
    pub tmp: Option<PathBuf>,
    /// Lock directory.
    pub lock: Option<PathBuf>,
    /// Time bin granularity: `hourly` or `monthly`.
    pub time_bin: Option<String>,
}

/// `source`/`target` overlay block: a driver name plus free-form
/// driver properties.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StorageOverlay {
    /// Driver short name.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// Driver-specific properties.
    #[serde(flatten)]
    pub properties: HashMap<String, String>,
}

/// `redis` overlay block.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RedisOverlay {
    /// Connection URL.
    pub url: Option<String>,
    /// Key prefix.
    pub prefix: Option<String>,
    /// Keep offsets in redis.
    pub offsets: Option<bool>,
}
