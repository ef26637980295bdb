//! Pluggable object-store access.
//!
//! All source reads and target publishes go through the
//! [`StorageDriver`] trait so the engine never touches a concrete
//! store directly. A local-filesystem driver ships built in; drivers
//! for remote stores register under their short name (`s3`, `azure`,
//! `hdfs`) before configuration is resolved.

mod local;

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::registry::Registry;
use crate::Result;

pub use self::local::LocalStorageDriver;

/// One entry of a directory listing.
#[derive(Debug, Clone)]
pub struct FileStatus {
    /// Full path of the entry.
    pub path: PathBuf,
    /// True for directories.
    pub is_directory: bool,
    /// Size in bytes; zero for directories.
    pub size: u64,
}

/// Access to one object store.
///
/// Implementations must be safe to share across worker threads.
pub trait StorageDriver: Send + Sync {
    /// Lists the direct children of a directory.
    fn list(&self, path: &Path) -> Result<Vec<FileStatus>>;

    /// Opens a readable stream over a file.
    fn new_input_stream(&self, path: &Path) -> Result<Box<dyn Read + Send>>;

    /// Size of a file in bytes, or `None` if it does not exist.
    fn status(&self, path: &Path) -> Result<Option<u64>>;

    /// Publishes a local file to `remote`, atomically where the store
    /// supports it. The local file is consumed.
    fn store(&self, local: &Path, remote: &Path) -> Result<()>;

    /// Moves a file within the store.
    fn move_file(&self, from: &Path, to: &Path) -> Result<()>;

    /// Removes a file, or a directory with its contents.
    fn delete(&self, path: &Path) -> Result<()>;

    /// Creates a directory and all missing parents.
    fn create_directories(&self, path: &Path) -> Result<()>;
}

/// Builds a [`StorageDriver`] from a configuration block's properties.
pub trait StorageDriverFactory: Send + Sync {
    /// Creates the driver from the type-specific properties of the
    /// `source`/`target` configuration block.
    fn create(&self, properties: &HashMap<String, String>) -> Result<Arc<dyn StorageDriver>>;
}

/// Registry of storage driver factories with the `local` driver
/// pre-registered. Remote backends (`s3`, `azure`, `hdfs`) are
/// provided by external factories registered before parse.
pub fn driver_registry() -> Registry<dyn StorageDriverFactory> {
    struct LocalFactory;
    impl StorageDriverFactory for LocalFactory {
        fn create(&self, _properties: &HashMap<String, String>) -> Result<Arc<dyn StorageDriver>> {
            Ok(Arc::new(LocalStorageDriver::new()))
        }
    }

    let mut registry = Registry::new("storage driver");
    registry.register("local", Arc::new(LocalFactory) as Arc<dyn StorageDriverFactory>);
    registry
}
