//! Pooled output writers.
//!
//! A [`FileCache`] owns the staged writer for one target path; the
//! [`FileCacheStore`] bounds how many stay open at once, evicting the
//! least-recently-used half when full. Eviction closes and publishes
//! caches, which is the engine's backpressure on open files and
//! memory.

mod store;
mod writer;

use std::path::Path;
use std::sync::Arc;

use crate::compression::CompressionCodec;
use crate::convert::ConverterFactory;
use crate::dedup::DedupSettings;
use crate::storage::StorageDriver;

pub use self::store::{FileCacheStore, WriteResponse};
pub use self::writer::FileCache;

/// How one topic's output files are written: target driver, row
/// format, compression and dedup policy. Shared by a store and all of
/// its caches.
pub struct SinkSpec {
    /// Driver of the target store.
    pub driver: Arc<dyn StorageDriver>,
    /// Row format factory.
    pub converter: Arc<dyn ConverterFactory>,
    /// Compression codec.
    pub codec: Arc<dyn CompressionCodec>,
    /// Dedup policy applied after publish.
    pub dedup: DedupSettings,
}

impl SinkSpec {
    /// The full target extension, row format plus compression.
    pub fn extension(&self) -> String {
        format!("{}{}", self.converter.extension(), self.codec.extension())
    }

    /// Inner entry name for archive codecs: the target file name
    /// without the compression extension.
    pub(crate) fn entry_name(&self, target: &Path) -> String {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match name.strip_suffix(self.codec.extension()) {
            Some(stripped) if !self.codec.extension().is_empty() => stripped.to_string(),
            _ => name,
        }
    }

    /// Whether rows are tabular, enabling field-subset dedup.
    pub(crate) fn is_tabular(&self) -> bool {
        self.converter.extension() == ".csv"
    }
}
