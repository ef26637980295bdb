use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};

use super::{LockManager, TopicLock, LOCK_TTL};

/// Lock manager over a shared lock directory.
///
/// One file per topic, taken with an exclusive create. Processes that
/// share the target tree coordinate through the same directory. A file
/// whose modification time is older than the TTL belonged to a crashed
/// holder and may be taken over.
pub struct FileLockManager {
    dir: PathBuf,
    ttl: Duration,
}

impl FileLockManager {
    /// Creates a manager over `dir` with the default TTL.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_ttl(dir, LOCK_TTL)
    }

    /// Creates a manager with an explicit TTL.
    pub fn with_ttl(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    fn lock_path(&self, topic: &str) -> PathBuf {
        self.dir.join(format!("{topic}.lock"))
    }

    fn try_create(&self, path: &Path) -> Option<()> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let _ = write!(file, "{}", std::process::id());
                Some(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => None,
            Err(e) => {
                warn!("cannot create lock file {}: {e}", path.display());
                None
            }
        }
    }

    fn is_stale(&self, path: &Path) -> bool {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|age| age > self.ttl)
    }
}

impl LockManager for FileLockManager {
    fn acquire_topic_lock(&self, topic: &str) -> Option<TopicLock> {
        if let Err(e) = fs::create_dir_all(&self.dir) {
            warn!("cannot create lock directory {}: {e}", self.dir.display());
            return None;
        }

        let path = self.lock_path(topic);
        if self.try_create(&path).is_none() {
            if !self.is_stale(&path) {
                return None;
            }
            debug!("taking over stale lock {}", path.display());
            let _ = fs::remove_file(&path);
            self.try_create(&path)?;
        }

        let heartbeat_path = path.clone();
        let release_path = path;
        Some(TopicLock::spawn(
            topic,
            self.ttl / 3,
            move || {
                // Rewriting the content refreshes the mtime the TTL
                // check reads.
                fs::write(&heartbeat_path, format!("{}", std::process::id())).is_ok()
            },
            move || {
                let _ = fs::remove_file(&release_path);
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_of_two_racing_acquires_wins() {
        let dir = tempfile::tempdir().unwrap();
        let first = FileLockManager::new(dir.path());
        let second = FileLockManager::new(dir.path());

        let a = first.acquire_topic_lock("t");
        let b = second.acquire_topic_lock("t");
        assert!(a.is_some() != b.is_some() || (a.is_some() && b.is_none()));
        assert!(a.is_some());
        assert!(b.is_none());

        drop(a);
        assert!(second.acquire_topic_lock("t").is_some());
    }

    #[test]
    fn sequential_reacquire_by_same_manager_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FileLockManager::new(dir.path());

        let lock = manager.acquire_topic_lock("t").unwrap();
        drop(lock);
        let again = manager.acquire_topic_lock("t");
        assert!(again.is_some());
    }

    #[test]
    fn locks_are_per_topic() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FileLockManager::new(dir.path());
        let _a = manager.acquire_topic_lock("a").unwrap();
        assert!(manager.acquire_topic_lock("b").is_some());
    }

    #[test]
    fn stale_lock_is_taken_over_after_ttl() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("t.lock"), "12345").unwrap();

        let manager = FileLockManager::with_ttl(dir.path(), Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(50));
        assert!(manager.acquire_topic_lock("t").is_some());
    }

    #[test]
    fn fresh_foreign_lock_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("t.lock"), "12345").unwrap();

        let manager = FileLockManager::new(dir.path());
        assert!(manager.acquire_topic_lock("t").is_none());
    }
}
