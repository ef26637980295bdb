use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use super::{FileStatus, StorageDriver};
use crate::Result;

/// Storage driver over the local filesystem.
#[derive(Debug, Default)]
pub struct LocalStorageDriver;

impl LocalStorageDriver {
    /// Creates a local driver.
    pub fn new() -> Self {
        Self
    }
}

impl StorageDriver for LocalStorageDriver {
    fn list(&self, path: &Path) -> Result<Vec<FileStatus>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            entries.push(FileStatus {
                path: entry.path(),
                is_directory: metadata.is_dir(),
                size: if metadata.is_dir() { 0 } else { metadata.len() },
            });
        }
        Ok(entries)
    }

    fn new_input_stream(&self, path: &Path) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(path)?))
    }

    fn status(&self, path: &Path) -> Result<Option<u64>> {
        match fs::metadata(path) {
            Ok(metadata) => Ok(Some(if metadata.is_dir() { 0 } else { metadata.len() })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, local: &Path, remote: &Path) -> Result<()> {
        if let Some(parent) = remote.parent() {
            fs::create_dir_all(parent)?;
        }
        // Rename is atomic on one filesystem; across filesystems copy
        // to a sibling temp first so readers never see a partial file.
        if fs::rename(local, remote).is_err() {
            let staged = sibling_temp(remote);
            fs::copy(local, &staged)?;
            fs::rename(&staged, remote)?;
            fs::remove_file(local)?;
        }
        Ok(())
    }

    fn move_file(&self, from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        if fs::rename(from, to).is_err() {
            fs::copy(from, to)?;
            fs::remove_file(from)?;
        }
        Ok(())
    }

    fn delete(&self, path: &Path) -> Result<()> {
        let metadata = fs::metadata(path)?;
        if metadata.is_dir() {
            fs::remove_dir_all(path)?;
        } else {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn create_directories(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }
}

fn sibling_temp(remote: &Path) -> std::path::PathBuf {
    let name = remote
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "target".to_string());
    let unique: u32 = rand::random();
    remote.with_file_name(format!(".{name}.{unique:08x}.tmp"))
}
