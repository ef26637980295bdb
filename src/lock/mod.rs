//! Advisory per-topic locks shared across worker processes.
//!
//! The lock is best-effort mutual exclusion: `acquire_topic_lock`
//! never blocks, the handle refreshes a TTL heartbeat-style while it
//! lives, and TTL expiry is the only recovery path for a crashed
//! holder. Backends: a lock directory of exclusively-created files,
//! or redis `SET NX PX`.

mod file;
mod redis;

use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use log::warn;

pub use self::file::FileLockManager;
pub use self::redis::RedisLockManager;

/// Time a lock survives without a heartbeat.
pub const LOCK_TTL: Duration = Duration::from_secs(300);

/// Best-effort mutual exclusion per topic across all processes that
/// share the backing store.
pub trait LockManager: Send + Sync {
    /// Tries to take the topic lock. Returns `None` immediately when
    /// another holder owns it. The returned handle releases on drop,
    /// on all paths; sequential re-acquire after release succeeds.
    fn acquire_topic_lock(&self, topic: &str) -> Option<TopicLock>;
}

/// A held topic lock. Refreshes its TTL on a background thread and
/// releases the lock when dropped.
pub struct TopicLock {
    stop: Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TopicLock {
    /// Starts the heartbeat thread. `refresh` extends the TTL and
    /// reports whether the lock is still ours; `release` gives it up.
    pub(crate) fn spawn<R, F>(topic: &str, interval: Duration, mut refresh: R, release: F) -> Self
    where
        R: FnMut() -> bool + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        let (stop, stop_rx) = channel::bounded::<()>(1);
        let name = topic.to_string();
        let handle = thread::Builder::new()
            .name(format!("lock-{topic}"))
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        release();
                        return;
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if !refresh() {
                            warn!("lost heartbeat on topic lock {name}");
                        }
                    }
                }
            })
            .expect("failed to spawn lock heartbeat thread");
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for TopicLock {
    fn drop(&mut self) {
        let _ = self.stop.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
